//! Sensitivity analysis.
//!
//! Classifies composite types by which of their fields hold code
//! pointers. The result is a side table built once per module run and
//! queried read-only by the rewriter and the synchronizer; no type
//! inspection happens during rewriting itself.
//!
//! Field indices are structural offsets in declaration order, so the
//! classification is deterministic: no ties, no ordering ambiguity.

use cpi_ir::{TypeId, TypeTable};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// Ordered set of sensitive field indices. Almost every sensitive struct
/// has a handful of callback fields at most.
pub type FieldSet = SmallVec<[u32; 4]>;

/// Map from composite-type id to the ordered set of field indices whose
/// declared type is a function pointer.
///
/// Invariant: a type appears only if its set is non-empty.
#[derive(Debug, Clone, Default)]
pub struct SensitiveFieldMap {
    fields: FxHashMap<TypeId, FieldSet>,
}

impl SensitiveFieldMap {
    /// Build the map by inspecting every struct declared in the table.
    pub fn build(types: &TypeTable) -> Self {
        let mut fields: FxHashMap<TypeId, FieldSet> = FxHashMap::default();

        for (sid, def) in types.structs() {
            let mut set = FieldSet::new();
            for (index, &fty) in def.fields.iter().enumerate() {
                if types.is_fn_ptr(fty) {
                    set.push(index as u32);
                }
            }
            if set.is_empty() {
                continue;
            }
            let tid = types
                .struct_type(sid)
                .expect("declared struct without an interned type");
            fields.insert(tid, set);
        }

        SensitiveFieldMap { fields }
    }

    /// Sensitive field indices of a composite type, if it has any.
    pub fn fields_of(&self, ty: TypeId) -> Option<&[u32]> {
        self.fields.get(&ty).map(|s| s.as_slice())
    }

    /// Whether a type is a sensitive composite.
    pub fn is_sensitive_struct(&self, ty: TypeId) -> bool {
        self.fields.contains_key(&ty)
    }

    /// Whether a pointer type points at a sensitive composite.
    pub fn is_sensitive_struct_ptr(&self, types: &TypeTable, ty: TypeId) -> bool {
        types
            .pointee(ty)
            .map(|p| self.is_sensitive_struct(p))
            .unwrap_or(false)
    }

    /// Number of sensitive composite types.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether no composite type is sensitive.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_has_non_empty_entries_only() {
        let mut types = TypeTable::new();
        let int = types.int();
        let fp = types.fn_ptr();

        let (_, plain) = types.declare_struct("plain", vec![int, int]);
        let (_, hooks) = types.declare_struct("hooks", vec![int, fp, fp]);

        let map = SensitiveFieldMap::build(&types);
        assert_eq!(map.len(), 1);
        assert!(!map.is_sensitive_struct(plain));
        assert!(map.is_sensitive_struct(hooks));
        assert_eq!(map.fields_of(hooks), Some(&[1, 2][..]));
        assert_eq!(map.fields_of(plain), None);
    }

    #[test]
    fn test_field_indices_are_declaration_order() {
        let mut types = TypeTable::new();
        let int = types.int();
        let fp = types.fn_ptr();
        let (_, s) = types.declare_struct("s", vec![fp, int, fp, int, fp]);

        let map = SensitiveFieldMap::build(&types);
        assert_eq!(map.fields_of(s), Some(&[0, 2, 4][..]));
    }

    #[test]
    fn test_sensitive_struct_ptr_classification() {
        let mut types = TypeTable::new();
        let int = types.int();
        let fp = types.fn_ptr();
        let (_, hooks) = types.declare_struct("hooks", vec![fp]);
        let (_, plain) = types.declare_struct("plain", vec![int]);
        let hooks_ptr = types.ptr(hooks);
        let plain_ptr = types.ptr(plain);

        let map = SensitiveFieldMap::build(&types);
        assert!(map.is_sensitive_struct_ptr(&types, hooks_ptr));
        assert!(!map.is_sensitive_struct_ptr(&types, plain_ptr));
        assert!(!map.is_sensitive_struct_ptr(&types, int));
    }

    #[test]
    fn test_nested_composites_not_traversed() {
        // Sensitivity is a property of directly declared fields; a struct
        // containing a sensitive struct is not itself sensitive.
        let mut types = TypeTable::new();
        let fp = types.fn_ptr();
        let (_, inner) = types.declare_struct("inner", vec![fp]);
        let (_, outer) = types.declare_struct("outer", vec![inner]);

        let map = SensitiveFieldMap::build(&types);
        assert!(map.is_sensitive_struct(inner));
        assert!(!map.is_sensitive_struct(outer));
    }
}
