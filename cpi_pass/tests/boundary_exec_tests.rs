//! Boundary synchronization under an adversarial host: opaque handlers
//! that observe and mutate foreign copies, and tampered origins.

use cpi_ir::{FuncId, FunctionBuilder, Module, TypeTable, Value};
use cpi_pass::instrument;
use cpi_rt::DivergencePolicy;
use cpi_vm::{encode_fn, Trap, Vm};

use std::cell::RefCell;
use std::rc::Rc;

/// Module with two targets and a `main` that installs `f1` into a
/// struct's callback field, lets external code see the struct, then
/// invokes whatever the field holds.
fn swap_module() -> (Module, FuncId, FuncId, FuncId) {
    let mut types = TypeTable::new();
    let int = types.int();
    let fp = types.fn_ptr();
    let (_, s) = types.declare_struct("handler", vec![int, fp]);
    let mut module = Module::with_types(types);

    let mut f1 = FunctionBuilder::new("f1", vec![]);
    f1.ret(Some(Value::ConstInt(111)));
    let f1 = module.add_function(f1.finish());

    let mut f2 = FunctionBuilder::new("f2", vec![]);
    f2.ret(Some(Value::ConstInt(222)));
    let f2 = module.add_function(f2.finish());

    let mut m = FunctionBuilder::new("main", vec![]);
    let obj = m.alloca(s);
    let cb = m.field_addr(obj, s, 1);
    m.store(cb, Value::FuncAddr(f1));
    m.call_opaque("swap", &[obj]);
    let v = m.load(cb);
    let r = m.call_indirect(v, &[]);
    m.ret(Some(r));
    let main = module.add_function(m.finish());

    (module, main, f1, f2)
}

#[test]
fn test_commit_and_restore_across_opaque_call() {
    let (mut module, main, f1, f2) = swap_module();
    instrument(&mut module);

    // The handler sees the *committed* value at the foreign location and
    // legitimately replaces it; the restore must carry the replacement
    // back into the safe region.
    let observed = Rc::new(RefCell::new(0u64));
    let sink = Rc::clone(&observed);
    let f2_word = encode_fn(f2);

    let mut vm = Vm::new();
    vm.register_opaque(
        "swap",
        Box::new(move |mem, args| {
            let field = args[0] + 1;
            *sink.borrow_mut() = mem.load(field).unwrap();
            mem.store(field, f2_word).unwrap();
            0
        }),
    );

    let out = vm.run(&module, main, &[]).unwrap();
    assert_eq!(*observed.borrow(), encode_fn(f1), "commit did not reach the origin");
    assert_eq!(out, 222, "restore did not adopt the foreign update");
}

#[test]
fn test_opaque_call_that_only_reads_changes_nothing() {
    let (mut module, main, f1, _) = swap_module();
    instrument(&mut module);

    let observed = Rc::new(RefCell::new(0u64));
    let sink = Rc::clone(&observed);

    let mut vm = Vm::new();
    vm.register_opaque(
        "swap",
        Box::new(move |mem, args| {
            *sink.borrow_mut() = mem.load(args[0] + 1).unwrap();
            0
        }),
    );

    let out = vm.run(&module, main, &[]).unwrap();
    assert_eq!(*observed.borrow(), encode_fn(f1));
    assert_eq!(out, 111);
}

/// Module whose `update` takes a sensitive-struct pointer, installs a
/// callback through it, and invokes it.
fn foreign_module() -> (Module, FuncId, FuncId, FuncId) {
    let mut types = TypeTable::new();
    let int = types.int();
    let fp = types.fn_ptr();
    let (_, s) = types.declare_struct("handler", vec![int, fp]);
    let s_ptr = types.ptr(s);
    let mut module = Module::with_types(types);

    let mut f1 = FunctionBuilder::new("f1", vec![]);
    f1.ret(Some(Value::ConstInt(111)));
    let f1 = module.add_function(f1.finish());

    let mut f2 = FunctionBuilder::new("f2", vec![]);
    f2.ret(Some(Value::ConstInt(222)));
    let f2 = module.add_function(f2.finish());

    let mut g = FunctionBuilder::new("update", vec![s_ptr]);
    let cb = g.field_addr(Value::Param(0), s, 1);
    g.store(cb, Value::FuncAddr(f2));
    let v = g.load(cb);
    let r = g.call_indirect(v, &[]);
    g.ret(Some(r));
    let update = module.add_function(g.finish());

    (module, update, f1, f2)
}

/// Address where the tests place the foreign struct. Far from the
/// bump-allocated frame slots.
const FOREIGN_BASE: u64 = 1000;

#[test]
fn test_mirrored_write_reaches_the_origin() {
    let (mut module, update, f1, f2) = foreign_module();
    let report = instrument(&mut module);
    assert_eq!(report.total_shadowed(), 1);

    let mut vm = Vm::new();
    vm.mem_mut().store(FOREIGN_BASE, 3).unwrap();
    vm.mem_mut().store(FOREIGN_BASE + 1, encode_fn(f1)).unwrap();

    let out = vm.run(&module, update, &[FOREIGN_BASE]).unwrap();
    assert_eq!(out, 222);
    // The write went to the handle's slot *and* the foreign location, so
    // code that never learned about the indirection stays correct.
    assert_eq!(vm.mem().load(FOREIGN_BASE + 1).unwrap(), encode_fn(f2));
    // The non-sensitive neighbor is untouched.
    assert_eq!(vm.mem().load(FOREIGN_BASE).unwrap(), 3);
}

/// `update` variant with an opaque call between install and invoke; the
/// handler tampers with the origin out of band, so the next verified
/// read sees a divergence.
fn tampered_module() -> (Module, FuncId, FuncId) {
    let mut types = TypeTable::new();
    let int = types.int();
    let fp = types.fn_ptr();
    let (_, s) = types.declare_struct("handler", vec![int, fp]);
    let s_ptr = types.ptr(s);
    let mut module = Module::with_types(types);

    let mut f2 = FunctionBuilder::new("f2", vec![]);
    f2.ret(Some(Value::ConstInt(222)));
    let f2 = module.add_function(f2.finish());

    let mut f3 = FunctionBuilder::new("f3", vec![]);
    f3.ret(Some(Value::ConstInt(333)));
    let f3 = module.add_function(f3.finish());

    let mut g = FunctionBuilder::new("update", vec![s_ptr]);
    let cb = g.field_addr(Value::Param(0), s, 1);
    g.store(cb, Value::FuncAddr(f2));
    // The pointer is NOT passed here, so no commit/restore bracket: any
    // origin mutation in the handler is unsanctioned.
    g.call_opaque("lurk", &[]);
    let v = g.load(cb);
    let r = g.call_indirect(v, &[]);
    g.ret(Some(r));
    let update = module.add_function(g.finish());

    (module, update, f3)
}

#[test]
fn test_strict_policy_rejects_tampered_origin() {
    let (mut module, update, _) = tampered_module();
    instrument(&mut module);

    let mut vm = Vm::new();
    vm.mem_mut().store(FOREIGN_BASE + 1, 0).unwrap();
    vm.register_opaque(
        "lurk",
        Box::new(|mem, _| {
            mem.store(FOREIGN_BASE + 1, 0xbad).unwrap();
            0
        }),
    );

    let err = vm.run(&module, update, &[FOREIGN_BASE]).unwrap_err();
    assert!(matches!(err, Trap::Region(_)), "expected divergence, got {:?}", err);
}

#[test]
fn test_resync_policy_adopts_tampered_origin() {
    let (mut module, update, f3) = tampered_module();
    instrument(&mut module);

    // Under the permissive policy the foreign write wins. Pointing the
    // origin at a real function makes the outcome observable: the
    // installed callback returns 222, the tampered one 333.
    let f3_word = encode_fn(f3);
    let mut vm = Vm::with_policy(DivergencePolicy::Resync);
    vm.mem_mut().store(FOREIGN_BASE + 1, 0).unwrap();
    vm.register_opaque(
        "lurk",
        Box::new(move |mem, _| {
            mem.store(FOREIGN_BASE + 1, f3_word).unwrap();
            0
        }),
    );

    let out = vm.run(&module, update, &[FOREIGN_BASE]).unwrap();
    assert_eq!(out, 333);
}
