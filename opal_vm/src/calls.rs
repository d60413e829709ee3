//! Call and return machinery.
//!
//! ## Call ABI
//!
//! The caller pushes the callee slot first (the callee value for
//! `call0`/`call1`, a `none` placeholder for symbol calls), then the
//! arguments in order. `num_args` includes the callee slot, so the new
//! frame pointer is `top - num_args`: the RetInfo claims the callee
//! slot, parameters sit untouched at `fp + 1`.., and the receiver of a
//! method call is already in place at `fp + 1`.
//!
//! Frame layout after entry:
//!
//! ```text
//! fp+0            RetInfo (saved pc, caller fp, required returns, flag)
//! fp+1 ..         parameters (the receiver first for methods)
//! ..              captured values (closures only)
//! ..  top         locals, initialized to none
//! ```
//!
//! Every frame keeps two spare slots above `top`; a call that cannot
//! reserve its frame returns `StackOverflow` *before* mutating any
//! state, so the grow-stack driver can enlarge and re-execute it.
//!
//! ## Ownership
//!
//! References to the callee slot and the arguments transfer into the
//! call. User function bodies release their parameters before
//! returning (compiler-emitted `Release` ops). Native callees own
//! their arguments: they release what they do not return. Method
//! dispatch retains the receiver around native entries so the callee
//! always observes `rc >= 1`.

use crate::exec::LoopExit;
use crate::symbols::{FuncSymbol, MethodEntry, MethodId};
use crate::vm::Vm;
use opal_core::{RetInfo, Value, VmError, VmResult};
use opal_heap::{MapKey, TYPE_CLOSURE, TYPE_LAMBDA, TYPE_MAP};
use smallvec::SmallVec;

/// Spare slots guaranteed above every frame.
pub(crate) const SPARE_SLOTS: usize = 2;

impl Vm {
    /// Call the value in the callee slot (`call0`/`call1`).
    pub(crate) fn call_value(
        &mut self,
        num_args: u8,
        req_ret: u8,
        ret_pc: u32,
        ret_flag: bool,
    ) -> VmResult<()> {
        let num_args = num_args as usize;
        let fp_new = self.top - num_args;
        let callee = self.stack[fp_new];
        let type_id = self
            .heap
            .type_of(callee)
            .ok_or_else(|| VmError::panic("value is not callable"))?;

        match type_id {
            TYPE_LAMBDA => {
                let (func_pc, n_params, n_locals) = self.heap.lambda_info(callee);
                if num_args - 1 != n_params as usize {
                    return Err(VmError::panic("wrong number of arguments"));
                }
                let new_top = fp_new + num_args + n_locals as usize;
                if new_top + SPARE_SLOTS > self.stack.len() {
                    return Err(VmError::StackOverflow);
                }
                self.heap.release(callee);
                self.enter_frame(fp_new, new_top, func_pc, req_ret, ret_pc, ret_flag);
                Ok(())
            }
            TYPE_CLOSURE => {
                let (func_pc, n_params, n_caps, n_locals) = self.heap.closure_info(callee);
                if num_args - 1 != n_params as usize {
                    return Err(VmError::panic("wrong number of arguments"));
                }
                let new_top = fp_new + num_args + n_caps as usize + n_locals as usize;
                if new_top + SPARE_SLOTS > self.stack.len() {
                    return Err(VmError::StackOverflow);
                }
                // Copy captures into the slots after the parameters,
                // each with its own reference, before the callee slot
                // reference is dropped.
                let mut caps: SmallVec<[Value; 4]> = SmallVec::new();
                self.heap.for_each_capture(callee, |v| caps.push(v));
                let mut idx = fp_new + num_args;
                for v in caps {
                    self.heap.retain(v);
                    self.stack[idx] = v;
                    idx += 1;
                }
                self.top = idx;
                self.heap.release(callee);
                self.enter_frame(fp_new, new_top, func_pc, req_ret, ret_pc, ret_flag);
                Ok(())
            }
            _ => Err(VmError::panic("value is not callable")),
        }
    }

    /// Call a function symbol (`callSym0`/`callSym1`).
    pub(crate) fn call_sym(
        &mut self,
        fid: u16,
        num_args: u8,
        req_ret: u8,
        ret_pc: u32,
    ) -> VmResult<()> {
        let num_args = num_args as usize;
        let sym = self.syms.func_syms.get(fid as usize).copied();
        match sym {
            Some(FuncSymbol::User { pc, num_locals }) => {
                let fp_new = self.top - num_args;
                let new_top = fp_new + num_args + num_locals as usize;
                if new_top + SPARE_SLOTS > self.stack.len() {
                    return Err(VmError::StackOverflow);
                }
                self.enter_frame(fp_new, new_top, pc, req_ret, ret_pc, false);
                Ok(())
            }
            Some(FuncSymbol::Native(f)) => {
                let fp_new = self.top - num_args;
                let args: SmallVec<[Value; 8]> =
                    self.stack[fp_new + 1..self.top].iter().copied().collect();
                self.top = fp_new;
                let result = f(self, &args);
                if req_ret == 1 {
                    self.push(result);
                } else {
                    self.heap.release(result);
                }
                self.pc = ret_pc as usize;
                Ok(())
            }
            _ => Err(VmError::missing_symbol(
                "function",
                self.syms.func_name(fid as u32),
            )),
        }
    }

    /// Call a method symbol on the receiver at `fp_new + 1`
    /// (`callObjSym0`/`callObjSym1`).
    pub(crate) fn call_obj_sym(
        &mut self,
        mid: u16,
        num_args: u8,
        req_ret: u8,
        ret_pc: u32,
        ret_flag: bool,
    ) -> VmResult<()> {
        let num_args_us = num_args as usize;
        let fp_new = self.top - num_args_us;
        let recv = self.stack[fp_new + 1];
        let entry = self
            .heap
            .type_of(recv)
            .and_then(|t| self.syms.resolve_method(t, mid as MethodId));

        match entry {
            Some(MethodEntry::User { pc, num_locals }) => {
                let new_top = fp_new + num_args_us + num_locals as usize;
                if new_top + SPARE_SLOTS > self.stack.len() {
                    return Err(VmError::StackOverflow);
                }
                self.enter_frame(fp_new, new_top, pc, req_ret, ret_pc, ret_flag);
                Ok(())
            }
            Some(MethodEntry::Native1(f)) => {
                let args: SmallVec<[Value; 8]> =
                    self.stack[fp_new + 2..self.top].iter().copied().collect();
                self.top = fp_new;
                self.heap.retain(recv);
                let result = f(self, recv, &args);
                self.heap.release(recv);
                if req_ret == 1 {
                    self.push(result);
                } else {
                    self.heap.release(result);
                }
                self.pc = ret_pc as usize;
                Ok(())
            }
            Some(MethodEntry::Native2(f)) => {
                let args: SmallVec<[Value; 8]> =
                    self.stack[fp_new + 2..self.top].iter().copied().collect();
                self.top = fp_new;
                self.heap.retain(recv);
                let (first, second) = f(self, recv, &args);
                self.heap.release(recv);
                if req_ret == 1 {
                    self.push(first);
                } else {
                    self.heap.release(first);
                }
                self.heap.release(second);
                self.pc = ret_pc as usize;
                Ok(())
            }
            None => self.call_map_method(mid, num_args, req_ret, ret_pc, ret_flag, recv, fp_new),
        }
    }

    /// Dispatch-miss fallback: a map receiver may carry the method as
    /// an entry under the method's name.
    fn call_map_method(
        &mut self,
        mid: u16,
        num_args: u8,
        req_ret: u8,
        ret_pc: u32,
        ret_flag: bool,
        recv: Value,
        fp_new: usize,
    ) -> VmResult<()> {
        let name = self.syms.method_name(mid as MethodId).to_owned();
        if self.heap.type_of(recv) == Some(TYPE_MAP) {
            if let Some(f_val) = self.heap.map_get(recv, &MapKey::str(&name)) {
                let ty = self.heap.type_of(f_val);
                if matches!(ty, Some(TYPE_LAMBDA | TYPE_CLOSURE)) {
                    // The stored function takes the callee slot; the
                    // receiver stays as the first argument.
                    self.heap.retain(f_val);
                    self.stack[fp_new] = f_val;
                    return self.call_value(num_args, req_ret, ret_pc, ret_flag);
                }
            }
        }
        Err(VmError::missing_symbol("method", &name))
    }

    /// Write the RetInfo, zero the locals region, and transfer control.
    #[inline]
    fn enter_frame(
        &mut self,
        fp_new: usize,
        new_top: usize,
        func_pc: u32,
        req_ret: u8,
        ret_pc: u32,
        ret_flag: bool,
    ) {
        self.stack[fp_new] = Value::ret_info(RetInfo {
            pc: ret_pc,
            prev_fp: self.fp as u32,
            req_ret,
            ret_flag,
        });
        for slot in &mut self.stack[self.top..new_top] {
            *slot = Value::none();
        }
        self.fp = fp_new;
        self.top = new_top;
        self.pc = func_pc as usize;
    }

    /// Return ABI: reconcile the produced value count with what the
    /// call site required, then restore the caller's pc and frame.
    /// Returns true when the RetInfo's flag asks the dispatch loop to
    /// exit (control returns to a native caller or loop driver).
    pub(crate) fn pop_stack_frame(&mut self, produced: u8) -> bool {
        debug_assert!(self.stack[self.fp].is_ret_info());
        let ri = self.stack[self.fp].as_ret_info();
        match (produced, ri.req_ret) {
            (1, 1) => {
                let r = self.stack[self.top - 1];
                self.stack[self.fp] = r;
                self.top = self.fp + 1;
            }
            (1, 0) => {
                let r = self.stack[self.top - 1];
                self.heap.release(r);
                self.top = self.fp;
            }
            (0, 1) => {
                self.stack[self.fp] = Value::none();
                self.top = self.fp + 1;
            }
            _ => {
                self.top = self.fp;
            }
        }
        self.pc = ri.pc as usize;
        self.fp = ri.prev_fp as usize;
        ri.ret_flag
    }

    /// Invoke a method from VM-internal code (the `forIter` protocol),
    /// returning its single result. The receiver reference transfers
    /// into the call.
    pub(crate) fn call_method_nested(&mut self, mid: MethodId, recv: Value) -> VmResult<Value> {
        let saved_pc = self.pc;
        self.push(Value::none());
        self.push(recv);
        loop {
            match self.call_obj_sym(mid as u16, 2, 1, saved_pc as u32, true) {
                Err(VmError::StackOverflow) => self.stack.push(Value::none()),
                Err(e) => return Err(e),
                Ok(()) => break,
            }
        }
        if self.pc != saved_pc {
            // A user entry pushed a frame; run it to its flagged return.
            match self.eval_loop_grow_stack()? {
                LoopExit::FrameRet => {}
                _ => return Err(VmError::panic("method did not return")),
            }
        }
        let result = self.pop();
        self.pc = saved_pc;
        Ok(result)
    }
}
