//! Differential execution tests: rewritten programs must behave exactly
//! like their originals whenever no attack is in play.

use cpi_ir::{FuncId, FunctionBuilder, Module, TypeTable, Value};
use cpi_pass::instrument;
use cpi_vm::Vm;

use std::cell::RefCell;
use std::rc::Rc;

/// f1 returns 111, f2 returns 222; main picks one through a
/// function-pointer local based on its argument and calls it.
fn branching_module() -> (Module, FuncId) {
    let mut types = TypeTable::new();
    let int = types.int();
    let fp = types.fn_ptr();
    let mut module = Module::with_types(types);

    let mut f1 = FunctionBuilder::new("f1", vec![]);
    f1.ret(Some(Value::ConstInt(111)));
    let f1 = module.add_function(f1.finish());

    let mut f2 = FunctionBuilder::new("f2", vec![]);
    f2.ret(Some(Value::ConstInt(222)));
    let f2 = module.add_function(f2.finish());

    let mut m = FunctionBuilder::new("main", vec![int]);
    let slot = m.alloca(fp);
    let then_block = m.create_block();
    let else_block = m.create_block();
    let join = m.create_block();
    m.cond_br(Value::Param(0), then_block, else_block);
    m.switch_to(then_block);
    m.store(slot, Value::FuncAddr(f1));
    m.br(join);
    m.switch_to(else_block);
    m.store(slot, Value::FuncAddr(f2));
    m.br(join);
    m.switch_to(join);
    let v = m.load(slot);
    let r = m.call_indirect(v, &[]);
    m.ret(Some(r));
    let main = module.add_function(m.finish());

    (module, main)
}

#[test]
fn test_behavior_preserved_on_both_branches() {
    let (original, main) = branching_module();
    let mut rewritten = original.clone();
    let report = instrument(&mut rewritten);
    assert!(report.changed());

    for flag in [0, 1] {
        let before = Vm::new().run(&original, main, &[flag]).unwrap();
        let after = Vm::new().run(&rewritten, main, &[flag]).unwrap();
        assert_eq!(before, after, "output diverged for flag {}", flag);
    }
}

#[test]
fn test_shadow_stack_pointer_restored_after_run() {
    let (mut module, main) = branching_module();
    instrument(&mut module);

    let mut vm = Vm::new();
    assert_eq!(vm.region().cursor(), 0);
    vm.run(&module, main, &[1]).unwrap();
    assert_eq!(vm.region().cursor(), 0);
}

#[test]
fn test_checkpoint_symmetry_across_multiple_returns() {
    // helper has two distinct return instructions and a relocated
    // local; whichever path it takes, the cursor must come back to the
    // caller's checkpoint.
    let mut types = TypeTable::new();
    let int = types.int();
    let fp = types.fn_ptr();
    let mut module = Module::with_types(types);

    let mut f1 = FunctionBuilder::new("f1", vec![]);
    f1.ret(Some(Value::ConstInt(10)));
    let f1 = module.add_function(f1.finish());

    let mut h = FunctionBuilder::new("helper", vec![int]);
    let slot = h.alloca(fp);
    h.store(slot, Value::FuncAddr(f1));
    let early = h.create_block();
    let late = h.create_block();
    h.cond_br(Value::Param(0), early, late);
    h.switch_to(early);
    h.ret(Some(Value::ConstInt(0)));
    h.switch_to(late);
    let v = h.load(slot);
    let r = h.call_indirect(v, &[]);
    h.ret(Some(r));
    let helper = module.add_function(h.finish());

    let mut m = FunctionBuilder::new("main", vec![int]);
    let slot = m.alloca(fp);
    m.store(slot, Value::FuncAddr(f1));
    let a = m.call(helper, &[Value::Param(0)]);
    let v = m.load(slot);
    let b = m.call_indirect(v, &[]);
    let sum = m.binary(cpi_ir::BinaryOp::Add, a, b);
    m.ret(Some(sum));
    let main = module.add_function(m.finish());

    instrument(&mut module);

    for flag in [0, 1] {
        let mut vm = Vm::new();
        let out = vm.run(&module, main, &[flag]).unwrap();
        // helper returns 0 on the early path, 10 on the late one.
        assert_eq!(out, if flag != 0 { 10 } else { 20 });
        assert_eq!(vm.region().cursor(), 0, "cursor leaked for flag {}", flag);
    }
}

#[test]
fn test_non_sensitive_fields_keep_their_storage() {
    // An external probe reads the aggregate's base address and its first
    // (non-sensitive) field directly from guest memory. Rewriting must
    // not move either.
    let mut types = TypeTable::new();
    let int = types.int();
    let fp = types.fn_ptr();
    let (_, s) = types.declare_struct("handler", vec![int, fp]);
    let mut module = Module::with_types(types);

    let mut f1 = FunctionBuilder::new("f1", vec![]);
    f1.ret(Some(Value::ConstInt(7)));
    let f1 = module.add_function(f1.finish());

    let mut m = FunctionBuilder::new("main", vec![]);
    let obj = m.alloca(s);
    let count = m.field_addr(obj, s, 0);
    m.store(count, Value::ConstInt(5));
    let cb = m.field_addr(obj, s, 1);
    m.store(cb, Value::FuncAddr(f1));
    m.call_opaque("probe", &[obj]);
    let v = m.load(cb);
    let r = m.call_indirect(v, &[]);
    m.ret(Some(r));
    let main = module.add_function(m.finish());

    let run_probed = |module: &Module| -> (u64, u64, u64) {
        let seen = Rc::new(RefCell::new((0u64, 0u64)));
        let sink = Rc::clone(&seen);
        let mut vm = Vm::new();
        vm.register_opaque(
            "probe",
            Box::new(move |mem, args| {
                let base = args[0];
                *sink.borrow_mut() = (base, mem.load(base).unwrap());
                0
            }),
        );
        let out = vm.run(module, main, &[]).unwrap();
        let (base, field0) = *seen.borrow();
        (out, base, field0)
    };

    let (out_before, base_before, field0_before) = run_probed(&module);

    let mut rewritten = module.clone();
    instrument(&mut rewritten);
    let (out_after, base_after, field0_after) = run_probed(&rewritten);

    assert_eq!(out_before, out_after);
    assert_eq!(base_before, base_after, "aggregate moved");
    assert_eq!(field0_before, 5);
    assert_eq!(field0_after, 5, "non-sensitive field lost its storage");
}
