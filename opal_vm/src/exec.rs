//! The dispatch loop.
//!
//! A switch-dispatched evaluator over the flat byte stream: each
//! iteration decodes one opcode plus its immediates, mutates the pc,
//! frame pointer, stack cursor, or heap, and falls through to the next
//! fetch. The loop only ever commits `self.pc` after an opcode's
//! fallible work is done, so an error (including the recoverable
//! `StackOverflow` from call entry) always leaves the pc on the
//! faulting instruction.

use crate::ops::ArithOp;
use crate::symbols::{METHOD_ITERATOR, METHOD_NEXT};
use crate::vm::Vm;
use opal_core::{OpCode, Value, VmError, VmResult, NULL_BYTE};
use opal_heap::MapKey;

/// How one invocation of the dispatch loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopExit {
    /// `end`: the program is complete.
    Done,
    /// `cont`: one loop-body iteration finished (nested dispatch only).
    Cont,
    /// `break`: unwind exactly one loop level (nested dispatch only).
    Break,
    /// A `ret` with the RetInfo continue-flag set: control returns to
    /// the native caller or loop driver that pushed the frame.
    FrameRet,
}

impl Vm {
    #[inline]
    fn op_u8(&self, off: usize) -> u8 {
        self.buf.ops[off]
    }

    #[inline]
    fn op_u16(&self, off: usize) -> u16 {
        u16::from_le_bytes([self.buf.ops[off], self.buf.ops[off + 1]])
    }

    /// Run the dispatch loop until an exit condition or error.
    #[inline(never)]
    pub(crate) fn eval_loop(&mut self) -> VmResult<LoopExit> {
        loop {
            let pc0 = self.pc;
            let byte = *self
                .buf
                .ops
                .get(pc0)
                .ok_or_else(|| VmError::panic("pc ran off the end of the bytecode"))?;
            let op = OpCode::from_u8(byte)
                .ok_or_else(|| VmError::panic(format!("invalid opcode {byte:#04x}")))?;

            match op {
                // =============================================================
                // Literals / load / store
                // =============================================================
                OpCode::PushNone => {
                    self.push(Value::none());
                    self.pc = pc0 + 1;
                }
                OpCode::PushTrue => {
                    self.push(Value::bool_(true));
                    self.pc = pc0 + 1;
                }
                OpCode::PushFalse => {
                    self.push(Value::bool_(false));
                    self.pc = pc0 + 1;
                }
                OpCode::PushConst => {
                    let idx = self.op_u16(pc0 + 1);
                    let v = self.buf.const_value(idx);
                    self.push(v);
                    self.pc = pc0 + 3;
                }
                OpCode::Load => {
                    let v = self.local(self.op_u8(pc0 + 1));
                    self.push(v);
                    self.pc = pc0 + 2;
                }
                OpCode::LoadRetain => {
                    let v = self.local(self.op_u8(pc0 + 1));
                    self.heap.retain(v);
                    self.push(v);
                    self.pc = pc0 + 2;
                }
                OpCode::Set => {
                    let slot = self.op_u8(pc0 + 1);
                    let v = self.pop();
                    self.set_local(slot, v);
                    self.pc = pc0 + 2;
                }
                OpCode::ReleaseSet => {
                    let slot = self.op_u8(pc0 + 1);
                    let old = self.local(slot);
                    self.heap.release(old);
                    let v = self.pop();
                    self.set_local(slot, v);
                    self.pc = pc0 + 2;
                }
                OpCode::SetInitN => {
                    let n = self.op_u8(pc0 + 1) as usize;
                    for k in 0..n {
                        let slot = self.op_u8(pc0 + 2 + k);
                        self.set_local(slot, Value::none());
                    }
                    self.pc = pc0 + 2 + n;
                }
                OpCode::Release => {
                    let slot = self.op_u8(pc0 + 1);
                    let v = self.local(slot);
                    self.heap.release(v);
                    self.set_local(slot, Value::none());
                    self.pc = pc0 + 2;
                }

                // =============================================================
                // Arithmetic
                // =============================================================
                OpCode::Add => self.bin_arith(pc0, ArithOp::Add)?,
                OpCode::Sub => self.bin_arith(pc0, ArithOp::Sub)?,
                OpCode::Mul => self.bin_arith(pc0, ArithOp::Mul)?,
                OpCode::Div => self.bin_arith(pc0, ArithOp::Div)?,
                OpCode::Mod => self.bin_arith(pc0, ArithOp::Mod)?,
                OpCode::Pow => self.bin_arith(pc0, ArithOp::Pow)?,
                OpCode::Sub1 | OpCode::Sub2 => {
                    let a_slot = self.op_u8(pc0 + 1);
                    let b_slot = self.op_u8(pc0 + 2);
                    let b = if b_slot == NULL_BYTE { self.pop() } else { self.local(b_slot) };
                    let a = if a_slot == NULL_BYTE { self.pop() } else { self.local(a_slot) };
                    if a.is_number() && b.is_number() {
                        self.push(Value::float(a.as_f64() - b.as_f64()));
                    } else {
                        // Slot-sourced operands are borrowed from their
                        // locals; the fallback releases both, so give
                        // each borrowed operand a reference first.
                        if a_slot != NULL_BYTE {
                            self.heap.retain(a);
                        }
                        if b_slot != NULL_BYTE {
                            self.heap.retain(b);
                        }
                        let r = self.arith_fallback(ArithOp::Sub, a, b)?;
                        self.push(r);
                    }
                    self.pc = pc0 + 3;
                }
                OpCode::Neg => {
                    let v = self.pop();
                    if v.is_number() {
                        self.push(Value::float(-v.as_f64()));
                    } else {
                        let f = self.to_f64_coerce(v)?;
                        self.heap.release(v);
                        self.push(Value::float(-f));
                    }
                    self.pc = pc0 + 1;
                }
                OpCode::Not => {
                    let v = self.pop();
                    let truthy = v.to_bool();
                    self.heap.release(v);
                    self.push(Value::bool_(!truthy));
                    self.pc = pc0 + 1;
                }
                OpCode::BitAnd => {
                    let b = self.pop();
                    let a = self.pop();
                    let x = self.to_f64_coerce(a)?;
                    let y = self.to_f64_coerce(b)?;
                    self.heap.release(a);
                    self.heap.release(b);
                    self.push(Value::float(((x as i64) & (y as i64)) as f64));
                    self.pc = pc0 + 1;
                }

                // =============================================================
                // Comparison
                // =============================================================
                OpCode::Eq | OpCode::Neq => {
                    let b = self.pop();
                    let a = self.pop();
                    let eq = self.values_equal(a, b)?;
                    self.push(Value::bool_(if op == OpCode::Eq { eq } else { !eq }));
                    self.pc = pc0 + 1;
                }
                OpCode::Lt | OpCode::Gt | OpCode::Le | OpCode::Ge => {
                    let b = self.pop();
                    let a = self.pop();
                    let (x, y) = self.compare_operands(a, b)?;
                    let r = match op {
                        OpCode::Lt => x < y,
                        OpCode::Gt => x > y,
                        OpCode::Le => x <= y,
                        _ => x >= y,
                    };
                    self.push(Value::bool_(r));
                    self.pc = pc0 + 1;
                }

                // =============================================================
                // Branching
                // =============================================================
                OpCode::Jump => {
                    self.pc = pc0 + self.op_u16(pc0 + 1) as usize;
                }
                OpCode::JumpBack => {
                    self.pc = pc0 - self.op_u16(pc0 + 1) as usize;
                }
                OpCode::JumpCond => {
                    let off = self.op_u16(pc0 + 1) as usize;
                    let v = self.pop();
                    let truthy = v.to_bool();
                    self.heap.release(v);
                    self.pc = if truthy { pc0 + off } else { pc0 + 3 };
                }
                OpCode::JumpNotCond => {
                    let off = self.op_u16(pc0 + 1) as usize;
                    let v = self.pop();
                    let truthy = v.to_bool();
                    self.heap.release(v);
                    self.pc = if truthy { pc0 + 3 } else { pc0 + off };
                }
                OpCode::JumpCondKeep => {
                    let off = self.op_u16(pc0 + 1) as usize;
                    let v = self.stack[self.top - 1];
                    if v.to_bool() {
                        self.pc = pc0 + off;
                    } else {
                        self.top -= 1;
                        self.heap.release(v);
                        self.pc = pc0 + 3;
                    }
                }
                OpCode::JumpNotCondKeep => {
                    let off = self.op_u16(pc0 + 1) as usize;
                    let v = self.stack[self.top - 1];
                    if v.to_bool() {
                        self.top -= 1;
                        self.heap.release(v);
                        self.pc = pc0 + 3;
                    } else {
                        self.pc = pc0 + off;
                    }
                }

                // =============================================================
                // Aggregates & indexing
                // =============================================================
                OpCode::PushList => {
                    let n = self.op_u8(pc0 + 1) as usize;
                    let items = self.stack[self.top - n..self.top].to_vec();
                    self.top -= n;
                    let list = self.heap.alloc_list(items)?;
                    self.push(list);
                    self.pc = pc0 + 2;
                }
                OpCode::PushMapEmpty => {
                    let map = self.heap.alloc_map()?;
                    self.push(map);
                    self.pc = pc0 + 1;
                }
                OpCode::PushMap => {
                    let n = self.op_u8(pc0 + 1) as usize;
                    let cidx = self.op_u16(pc0 + 2);
                    let map = self.heap.alloc_map()?;
                    for k in 0..n {
                        let key_const = self.buf.const_value(cidx + k as u16);
                        let Some((start, len)) = key_const.as_const_string() else {
                            return Err(VmError::panic("map key constant is not a string"));
                        };
                        let key = MapKey::str(self.buf.str_slice(start, len));
                        let value = self.stack[self.top - n + k];
                        self.heap.map_insert(map, key, value);
                    }
                    self.top -= n;
                    self.push(map);
                    self.pc = pc0 + 4;
                }
                OpCode::PushStructInitSmall => {
                    let type_id = self.op_u16(pc0 + 1) as u32;
                    let n = self.op_u8(pc0 + 3) as usize;
                    let mut fields = [Value::none(); 4];
                    for k in 0..n {
                        let offset = self.op_u8(pc0 + 4 + k) as usize;
                        fields[offset] = self.stack[self.top - n + k];
                    }
                    self.top -= n;
                    let obj = self.heap.alloc_small_object(type_id, fields)?;
                    self.push(obj);
                    self.pc = pc0 + 4 + n;
                }
                OpCode::PushSlice => {
                    let end = self.pop();
                    let start = self.pop();
                    let recv = self.pop();
                    let out = self.slice_list(recv, start, end)?;
                    self.push(out);
                    self.pc = pc0 + 1;
                }
                OpCode::PushIndex => {
                    let idx = self.pop();
                    let recv = self.pop();
                    let out = self.index_read(recv, idx, false)?;
                    self.push(out);
                    self.pc = pc0 + 1;
                }
                OpCode::PushReverseIndex => {
                    let idx = self.pop();
                    let recv = self.pop();
                    let out = self.index_read(recv, idx, true)?;
                    self.push(out);
                    self.pc = pc0 + 1;
                }
                OpCode::SetIndex => {
                    let val = self.pop();
                    let idx = self.pop();
                    let recv = self.pop();
                    self.index_write(recv, idx, val)?;
                    self.pc = pc0 + 1;
                }

                // =============================================================
                // Fields
                // =============================================================
                OpCode::PushField => {
                    self.field_read(self.op_u16(pc0 + 1), false, false)?;
                    self.pc = pc0 + 3;
                }
                OpCode::PushFieldRetain => {
                    self.field_read(self.op_u16(pc0 + 1), true, false)?;
                    self.pc = pc0 + 3;
                }
                OpCode::PushFieldParentRelease => {
                    self.field_read(self.op_u16(pc0 + 1), false, true)?;
                    self.pc = pc0 + 3;
                }
                OpCode::PushFieldRetainParentRelease => {
                    self.field_read(self.op_u16(pc0 + 1), true, true)?;
                    self.pc = pc0 + 3;
                }
                OpCode::SetField => {
                    self.field_write(self.op_u16(pc0 + 1), false)?;
                    self.pc = pc0 + 3;
                }
                OpCode::ReleaseSetField => {
                    self.field_write(self.op_u16(pc0 + 1), true)?;
                    self.pc = pc0 + 3;
                }

                // =============================================================
                // Calls & returns
                // =============================================================
                OpCode::Call0 | OpCode::Call1 => {
                    let num_args = self.op_u8(pc0 + 1);
                    let req = u8::from(op == OpCode::Call1);
                    self.call_value(num_args, req, (pc0 + 2) as u32, false)?;
                }
                OpCode::CallSym0 | OpCode::CallSym1 => {
                    let fid = self.op_u16(pc0 + 1);
                    let num_args = self.op_u8(pc0 + 3);
                    let req = u8::from(op == OpCode::CallSym1);
                    self.call_sym(fid, num_args, req, (pc0 + 4) as u32)?;
                }
                OpCode::CallObjSym0 | OpCode::CallObjSym1 => {
                    let mid = self.op_u16(pc0 + 1);
                    let num_args = self.op_u8(pc0 + 3);
                    let req = u8::from(op == OpCode::CallObjSym1);
                    self.call_obj_sym(mid, num_args, req, (pc0 + 4) as u32, false)?;
                }
                OpCode::Ret0 => {
                    if self.pop_stack_frame(0) {
                        return Ok(LoopExit::FrameRet);
                    }
                }
                OpCode::Ret1 => {
                    if self.pop_stack_frame(1) {
                        return Ok(LoopExit::FrameRet);
                    }
                }

                // =============================================================
                // Closures & iteration
                // =============================================================
                OpCode::PushLambda => {
                    let rel = self.op_u16(pc0 + 1) as usize;
                    let num_params = self.op_u8(pc0 + 3);
                    let num_locals = self.op_u8(pc0 + 4);
                    let v = self
                        .heap
                        .alloc_lambda((pc0 + rel) as u32, num_params, num_locals)?;
                    self.push(v);
                    self.pc = pc0 + 5;
                }
                OpCode::PushClosure => {
                    let rel = self.op_u16(pc0 + 1) as usize;
                    let num_params = self.op_u8(pc0 + 3);
                    let n_caps = self.op_u8(pc0 + 4) as usize;
                    let num_locals = self.op_u8(pc0 + 5);
                    let caps = self.stack[self.top - n_caps..self.top].to_vec();
                    self.top -= n_caps;
                    let v = self.heap.alloc_closure(
                        (pc0 + rel) as u32,
                        num_params,
                        num_locals,
                        &caps,
                    )?;
                    self.push(v);
                    self.pc = pc0 + 6;
                }
                OpCode::ForIter => self.exec_for_iter(pc0)?,
                OpCode::ForRange => self.exec_for_range(pc0)?,
                OpCode::Cont => return Ok(LoopExit::Cont),
                OpCode::Break => return Ok(LoopExit::Break),

                // =============================================================
                // Strings
                // =============================================================
                OpCode::StringTemplate => {
                    let n = self.op_u8(pc0 + 1) as usize;
                    let parts = self.stack[self.top - n..self.top].to_vec();
                    let mut out = String::new();
                    for p in &parts {
                        out.push_str(&crate::fmt::value_to_string(self, *p));
                    }
                    for p in &parts {
                        self.heap.release(*p);
                    }
                    self.top -= n;
                    let s = self.heap.alloc_string(&out)?;
                    self.push(s);
                    self.pc = pc0 + 2;
                }

                OpCode::End => return Ok(LoopExit::Done),
            }
        }
    }

    #[inline]
    fn bin_arith(&mut self, pc0: usize, op: ArithOp) -> VmResult<()> {
        let b = self.stack[self.top - 1];
        let a = self.stack[self.top - 2];
        if a.is_number() && b.is_number() {
            self.stack[self.top - 2] = Value::float(op.apply(a.as_f64(), b.as_f64()));
            self.top -= 1;
        } else {
            self.top -= 2;
            let r = self.arith_fallback(op, a, b)?;
            self.push(r);
        }
        self.pc = pc0 + 1;
        Ok(())
    }

    /// The `forIter` protocol: resolve `iterator()` once, then drive
    /// `next()` until it yields `none`. The body runs as a nested
    /// invocation of the dispatch loop: `cont` ends one iteration and
    /// `break` unwinds exactly this loop level.
    fn exec_for_iter(&mut self, pc0: usize) -> VmResult<()> {
        let slot = self.op_u8(pc0 + 1);
        let end_off = self.op_u16(pc0 + 2) as usize;
        let body_pc = pc0 + 4;
        let end_pc = pc0 + end_off;

        let iterable = self.pop();
        let iterator = self.call_method_nested(METHOD_ITERATOR, iterable)?;

        loop {
            self.heap.retain(iterator);
            let item = self.call_method_nested(METHOD_NEXT, iterator)?;
            if item.is_none() {
                break;
            }
            if slot == NULL_BYTE {
                self.heap.release(item);
            } else {
                let old = self.local(slot);
                self.heap.release(old);
                self.set_local(slot, item);
            }
            self.pc = body_pc;
            match self.eval_loop_grow_stack()? {
                LoopExit::Cont => {}
                LoopExit::Break => break,
                _ => return Err(VmError::panic("loop body fell through")),
            }
        }
        self.heap.release(iterator);
        self.pc = end_pc;
        Ok(())
    }

    /// The `forRange` protocol: pops step, end, start; ascends when
    /// `start <= end`, otherwise descends by the step.
    fn exec_for_range(&mut self, pc0: usize) -> VmResult<()> {
        let slot = self.op_u8(pc0 + 1);
        let end_off = self.op_u16(pc0 + 2) as usize;
        let body_pc = pc0 + 4;
        let end_pc = pc0 + end_off;

        let step_v = self.pop();
        let end_v = self.pop();
        let start_v = self.pop();
        let step = self.to_f64_coerce(step_v)?;
        let end = self.to_f64_coerce(end_v)?;
        let start = self.to_f64_coerce(start_v)?;
        self.heap.release(step_v);
        self.heap.release(end_v);
        self.heap.release(start_v);
        if step == 0.0 {
            return Err(VmError::panic("range step must be non-zero"));
        }

        let ascending = start <= end;
        let mut cur = start;
        loop {
            if ascending {
                if cur >= end {
                    break;
                }
            } else if cur <= end {
                break;
            }
            if slot != NULL_BYTE {
                let old = self.local(slot);
                self.heap.release(old);
                self.set_local(slot, Value::float(cur));
            }
            self.pc = body_pc;
            match self.eval_loop_grow_stack()? {
                LoopExit::Cont => {}
                LoopExit::Break => break,
                _ => return Err(VmError::panic("loop body fell through")),
            }
            if ascending {
                cur += step;
            } else {
                cur -= step;
            }
        }
        self.pc = end_pc;
        Ok(())
    }
}
