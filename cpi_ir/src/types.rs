//! Type table and word-based layout.
//!
//! Types are interned behind `TypeId` so equality is id equality. The
//! layout model is word-granular: every scalar occupies one 64-bit word,
//! a struct field's offset is the word count of the fields preceding it,
//! and arrays are `len * elem` words. Declaration order of struct fields
//! is structural, so field indices are stable offsets with no ordering
//! ambiguity.

use crate::arena::{Arena, Id};
use rustc_hash::FxHashMap;
use std::sync::Arc;

// =============================================================================
// Types
// =============================================================================

/// Identifier for an interned type.
pub type TypeId = Id<Type>;

/// Identifier for a struct declaration.
pub type StructId = Id<StructDef>;

/// A type in the program.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// 64-bit integer.
    Int,
    /// Pointer to a function. The sensitive scalar type.
    FnPtr,
    /// Pointer to a value of the given type.
    Ptr(TypeId),
    /// A declared composite type.
    Struct(StructId),
    /// Fixed-length array of a scalar element type.
    Array(TypeId, u32),
}

/// A struct declaration: a name and ordered field types.
#[derive(Debug, Clone)]
pub struct StructDef {
    /// Declared name.
    pub name: Arc<str>,
    /// Field types in declaration order.
    pub fields: Vec<TypeId>,
}

// =============================================================================
// Type Table
// =============================================================================

/// Module-wide table of interned types and struct declarations.
#[derive(Debug, Clone, Default)]
pub struct TypeTable {
    types: Arena<Type>,
    structs: Arena<StructDef>,
    /// Interning map so each structurally-equal type has one id.
    interned: FxHashMap<Type, TypeId>,
}

impl TypeTable {
    /// Create an empty type table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a type, returning its canonical id.
    pub fn intern(&mut self, ty: Type) -> TypeId {
        if let Some(&id) = self.interned.get(&ty) {
            return id;
        }
        let id = self.types.alloc(ty.clone());
        self.interned.insert(ty, id);
        id
    }

    /// The integer type.
    pub fn int(&mut self) -> TypeId {
        self.intern(Type::Int)
    }

    /// The function-pointer type.
    pub fn fn_ptr(&mut self) -> TypeId {
        self.intern(Type::FnPtr)
    }

    /// Pointer to `pointee`.
    pub fn ptr(&mut self, pointee: TypeId) -> TypeId {
        self.intern(Type::Ptr(pointee))
    }

    /// Array of `len` elements of `elem`.
    pub fn array(&mut self, elem: TypeId, len: u32) -> TypeId {
        self.intern(Type::Array(elem, len))
    }

    /// Declare a new struct and return both its declaration id and its
    /// interned type id.
    pub fn declare_struct(
        &mut self,
        name: impl Into<Arc<str>>,
        fields: Vec<TypeId>,
    ) -> (StructId, TypeId) {
        let sid = self.structs.alloc(StructDef {
            name: name.into(),
            fields,
        });
        let tid = self.intern(Type::Struct(sid));
        (sid, tid)
    }

    /// Look up a type by id.
    #[inline]
    pub fn get(&self, id: TypeId) -> &Type {
        &self.types[id]
    }

    /// Look up a struct declaration by id.
    #[inline]
    pub fn struct_def(&self, id: StructId) -> &StructDef {
        &self.structs[id]
    }

    /// Iterate over all struct declarations in declaration order.
    pub fn structs(&self) -> impl Iterator<Item = (StructId, &StructDef)> {
        self.structs.iter()
    }

    /// The interned type id of a struct declaration. Always present for
    /// structs created through [`TypeTable::declare_struct`].
    pub fn struct_type(&self, sid: StructId) -> Option<TypeId> {
        self.interned.get(&Type::Struct(sid)).copied()
    }

    /// The struct id behind a type, if it is a struct type.
    pub fn as_struct(&self, id: TypeId) -> Option<StructId> {
        match self.get(id) {
            Type::Struct(sid) => Some(*sid),
            _ => None,
        }
    }

    /// The pointee of a pointer type, if it is a pointer type.
    pub fn pointee(&self, id: TypeId) -> Option<TypeId> {
        match self.get(id) {
            Type::Ptr(inner) => Some(*inner),
            _ => None,
        }
    }

    /// Check whether a type is the function-pointer type.
    pub fn is_fn_ptr(&self, id: TypeId) -> bool {
        matches!(self.get(id), Type::FnPtr)
    }

    // =========================================================================
    // Layout
    // =========================================================================

    /// Size of a type in 64-bit words.
    pub fn size_words(&self, id: TypeId) -> u32 {
        match self.get(id) {
            Type::Int | Type::FnPtr | Type::Ptr(_) => 1,
            Type::Struct(sid) => {
                let def = self.struct_def(*sid);
                def.fields.iter().map(|&f| self.size_words(f)).sum()
            }
            Type::Array(elem, len) => self.size_words(*elem) * len,
        }
    }

    /// Word offset of a struct field from the struct base.
    ///
    /// Panics if `field` is out of range for the struct.
    pub fn field_offset(&self, sid: StructId, field: u32) -> u32 {
        let def = self.struct_def(sid);
        assert!(
            (field as usize) < def.fields.len(),
            "field {} out of range for struct '{}'",
            field,
            def.name
        );
        def.fields[..field as usize]
            .iter()
            .map(|&f| self.size_words(f))
            .sum()
    }

    /// Type of a struct field.
    pub fn field_type(&self, sid: StructId, field: u32) -> TypeId {
        self.struct_def(sid).fields[field as usize]
    }
}
