//! Heap and stack invariants driven through full programs.

use opal_core::{BufferBuilder, OpCode, Value};
use opal_heap::PAGE_SLOTS;
use opal_vm::{FuncSymbol, Vm};

fn num(b: &mut BufferBuilder, f: f64) -> u16 {
    b.const_value(Value::float(f))
}

#[test]
fn test_stack_balance_without_result() {
    let mut b = BufferBuilder::new();
    b.main_local_size(3);
    let c1 = num(&mut b, 1.0);
    b.op_w(OpCode::PushConst, c1);
    b.op_b(OpCode::Set, 0);
    b.op(OpCode::End);

    let mut vm = Vm::new();
    let result = vm.eval(b.build()).unwrap();
    assert!(result.is_none());
    assert_eq!(vm.stack_top(), 3);
}

#[test]
fn test_stack_balance_with_result() {
    let mut b = BufferBuilder::new();
    b.main_local_size(2);
    let c1 = num(&mut b, 1.0);
    b.op_w(OpCode::PushConst, c1);
    b.op(OpCode::End);

    let mut vm = Vm::new();
    let result = vm.eval(b.build()).unwrap();
    assert_eq!(result.as_f64(), 1.0);
    // The single produced value was consumed from `main_local_size + 1`.
    assert_eq!(vm.stack_top(), 2);
}

#[test]
fn test_grow_stack_recovery_on_large_frame() {
    let mut vm = Vm::new();
    let fid = vm.symbols_mut().ensure_func_sym("big");

    let mut b = BufferBuilder::new();
    b.op(OpCode::PushNone);
    b.op_wb(OpCode::CallSym0, fid as u16, 1);
    b.op(OpCode::End);
    let body_pc = b.pc();
    b.op(OpCode::Ret0);

    // Far beyond the initial stack reservation: the call must fail with
    // StackOverflow and be transparently retried by the grow driver.
    vm.symbols_mut().set_func_sym(
        fid,
        FuncSymbol::User { pc: body_pc, num_locals: 2000 },
    );

    let result = vm.eval(b.build()).unwrap();
    assert!(result.is_none());
    assert_eq!(vm.stack_top(), 0);
}

#[test]
fn test_all_objects_freed_after_program() {
    let mut b = BufferBuilder::new();
    let c1 = num(&mut b, 1.0);
    let c2 = num(&mut b, 2.0);
    // [[1], [2]] built and returned.
    b.op_w(OpCode::PushConst, c1);
    b.op_b(OpCode::PushList, 1);
    b.op_w(OpCode::PushConst, c2);
    b.op_b(OpCode::PushList, 1);
    b.op_b(OpCode::PushList, 2);
    b.op(OpCode::End);

    let mut vm = Vm::new();
    let result = vm.eval(b.build()).unwrap();
    assert_eq!(vm.heap().live_count(), 3);

    vm.release(result);
    assert_eq!(vm.heap().live_count(), 0);
    assert_eq!(vm.heap().free_slot_count(), PAGE_SLOTS - 1);
}

#[test]
fn test_heap_pages_persist_across_evals() {
    let mut vm = Vm::new();
    for _ in 0..3 {
        let mut b = BufferBuilder::new();
        b.main_local_size(1);
        let c1 = num(&mut b, 1.0);
        b.op_w(OpCode::PushConst, c1);
        b.op_b(OpCode::PushList, 1);
        b.op_b(OpCode::Set, 0);
        b.op_b(OpCode::Release, 0);
        b.op(OpCode::End);
        vm.eval(b.build()).unwrap();
        assert_eq!(vm.heap().live_count(), 0);
        assert_eq!(vm.heap().page_count(), 1);
    }
}

#[test]
fn test_retain_release_balance_over_iteration() {
    let mut vm = Vm::new();
    vm.set_trace(true);

    let mut b = BufferBuilder::new();
    b.main_local_size(2);
    let cs: Vec<u16> = [1.0, 2.0, 3.0, 4.0].iter().map(|f| num(&mut b, *f)).collect();
    for c in &cs {
        b.op_w(OpCode::PushConst, *c);
    }
    b.op_b(OpCode::PushList, 4);
    let site = b.pc() as usize;
    b.op_b(OpCode::ForIter, 0);
    b.operand(0);
    b.operand(0);
    b.op_b(OpCode::Load, 1);
    b.op_b(OpCode::Load, 0);
    b.op(OpCode::Add);
    b.op_b(OpCode::Set, 1);
    b.op(OpCode::Cont);
    b.patch_end_offset(site, 2);
    b.op_b(OpCode::Load, 1);
    b.op(OpCode::End);

    let result = vm.eval(b.build()).unwrap();
    assert_eq!(result.as_f64(), 10.0);
    assert_eq!(vm.heap().live_count(), 0);

    let stats = vm.trace_stats();
    assert_eq!(stats.num_retains, stats.num_releases + vm.heap().live_refs());
}

#[test]
fn test_check_memory_clean_after_acyclic_program() {
    let mut b = BufferBuilder::new();
    b.main_local_size(1);
    let c1 = num(&mut b, 1.0);
    b.op_w(OpCode::PushConst, c1);
    b.op_b(OpCode::PushList, 1);
    b.op_b(OpCode::Set, 0);
    b.op(OpCode::End);

    let mut vm = Vm::new();
    vm.eval(b.build()).unwrap();
    // Slot 0 still holds the list, acyclically.
    assert_eq!(vm.heap().live_count(), 1);
    assert!(vm.check_memory());
    assert_eq!(vm.heap().live_count(), 1);
}
