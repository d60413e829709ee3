//! Dispatch-loop throughput benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use opal_core::{BufferBuilder, ByteCodeBuffer, OpCode, Value};
use opal_vm::Vm;

/// while x < 100000: x = x + 1
fn loop_program() -> ByteCodeBuffer {
    let mut b = BufferBuilder::new();
    b.main_local_size(1);
    let c0 = b.const_value(Value::float(0.0));
    let c1 = b.const_value(Value::float(1.0));
    let limit = b.const_value(Value::float(100_000.0));
    b.op_w(OpCode::PushConst, c0);
    b.op_b(OpCode::Set, 0);
    let top = b.pc();
    b.op_b(OpCode::Load, 0);
    b.op_w(OpCode::PushConst, limit);
    b.op(OpCode::Lt);
    let exit = b.jump(OpCode::JumpNotCond);
    b.op_b(OpCode::Load, 0);
    b.op_w(OpCode::PushConst, c1);
    b.op(OpCode::Add);
    b.op_b(OpCode::Set, 0);
    b.jump_back(top);
    b.patch_jump(exit);
    b.op_b(OpCode::Load, 0);
    b.op(OpCode::End);
    b.build()
}

fn bench_counting_loop(c: &mut Criterion) {
    let buf = loop_program();
    let mut vm = Vm::new();
    c.bench_function("counting_loop_100k", |bench| {
        bench.iter(|| {
            let result = vm.eval(buf.clone()).unwrap();
            black_box(result.as_f64())
        })
    });
}

fn bench_list_iteration(c: &mut Criterion) {
    let mut b = BufferBuilder::new();
    b.main_local_size(2);
    let c0 = b.const_value(Value::float(0.0));
    let consts: Vec<u16> = (0..64)
        .map(|i| b.const_value(Value::float(f64::from(i))))
        .collect();
    b.op_w(OpCode::PushConst, c0);
    b.op_b(OpCode::Set, 1);
    for idx in &consts {
        b.op_w(OpCode::PushConst, *idx);
    }
    b.op_b(OpCode::PushList, 64);
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
    let buf = b.build();

    let mut vm = Vm::new();
    c.bench_function("list_iter_64", |bench| {
        bench.iter(|| {
            let result = vm.eval(buf.clone()).unwrap();
            black_box(result.as_f64())
        })
    });
}

criterion_group!(benches, bench_counting_loop, bench_list_iteration);
criterion_main!(benches);
