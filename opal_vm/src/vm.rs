//! The virtual machine: execution state and the host facade.
//!
//! A `Vm` owns the value stack, the heap, the symbol registries, and
//! the bytecode buffer it is currently bound to. `eval` resets the
//! per-run state and drives the dispatch loop through the grow-stack
//! driver; heap pages persist across runs.

use crate::builtins;
use crate::exec::LoopExit;
use crate::symbols::Symbols;
use crate::trace::StackTrace;
use opal_core::{ByteCodeBuffer, DebugInfo, Value, VmError, VmResult};
use opal_heap::{Heap, MapKey, TraceStats};

/// Initial value stack reservation (slots).
const INITIAL_STACK_SLOTS: usize = 512;

/// The Opal virtual machine.
///
/// Strictly single-threaded: one `eval` owns the thread of control
/// until it returns, and native callbacks must not re-enter the same
/// instance.
pub struct Vm {
    pub(crate) heap: Heap,
    /// Contiguous value stack. Always fully initialized up to `len`;
    /// `top` is the cursor.
    pub(crate) stack: Vec<Value>,
    pub(crate) top: usize,
    /// Current frame's slot 0 (the RetInfo slot for called frames).
    pub(crate) fp: usize,
    pub(crate) pc: usize,
    pub(crate) buf: ByteCodeBuffer,
    pub(crate) debug: DebugInfo,
    pub(crate) syms: Symbols,
    panic_msg: String,
    stack_trace: StackTrace,
    pub(crate) printed: Vec<String>,
}

impl Vm {
    /// Create a VM with its first heap page, pre-sized stack, and the
    /// core bindings registered.
    #[must_use]
    pub fn new() -> Self {
        let mut vm = Vm {
            heap: Heap::new(),
            stack: vec![Value::none(); INITIAL_STACK_SLOTS],
            top: 0,
            fp: 0,
            pc: 0,
            buf: ByteCodeBuffer::default(),
            debug: DebugInfo::default(),
            syms: Symbols::new(),
            panic_msg: String::new(),
            stack_trace: StackTrace::default(),
            printed: Vec::new(),
        };
        builtins::register(&mut vm);
        vm
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Execute a bytecode buffer to completion.
    ///
    /// Resets the per-run state (panic message, stack, pc), rebinds the
    /// buffer, and runs the dispatch loop. The returned value carries a
    /// reference the host must release.
    pub fn eval(&mut self, buf: ByteCodeBuffer) -> VmResult<Value> {
        let main = buf.main_local_size as usize;
        self.buf = buf;
        self.panic_msg.clear();
        self.stack_trace = StackTrace::default();
        self.printed.clear();

        if self.stack.len() < main + INITIAL_STACK_SLOTS {
            self.stack.resize(main + INITIAL_STACK_SLOTS, Value::none());
        }
        for slot in &mut self.stack[..main] {
            *slot = Value::none();
        }
        self.top = main;
        self.fp = 0;
        self.pc = 0;

        match self.eval_loop_grow_stack() {
            Ok(LoopExit::Done) => {
                if self.top == main + 1 {
                    self.top -= 1;
                    Ok(self.stack[self.top])
                } else {
                    debug_assert_eq!(self.top, main, "unbalanced stack at end");
                    Ok(Value::none())
                }
            }
            Ok(_) => Err(VmError::panic("stray loop control at top level")),
            Err(err) => {
                if err.is_panic() {
                    self.panic_msg = match &err {
                        VmError::Panic { msg } => msg.clone(),
                        VmError::OutOfBounds => "index out of bounds".to_owned(),
                        _ => unreachable!(),
                    };
                    if !self.buf.debug_table.is_empty() {
                        self.stack_trace = self.build_stack_trace()?;
                    }
                }
                Err(err)
            }
        }
    }

    /// The grow-stack driver: recover `StackOverflow` from call entry
    /// by enlarging the stack one slot and resuming. The failing call
    /// leaves the pc on its own opcode, so resuming re-executes it.
    pub(crate) fn eval_loop_grow_stack(&mut self) -> VmResult<LoopExit> {
        loop {
            match self.eval_loop() {
                Err(VmError::StackOverflow) => self.stack.push(Value::none()),
                other => return other,
            }
        }
    }

    // =========================================================================
    // Host API
    // =========================================================================

    /// Bind the source mapping used for stack traces.
    pub fn set_debug_info(&mut self, debug: DebugInfo) {
        self.debug = debug;
    }

    /// Drop one host reference.
    pub fn release(&mut self, v: Value) {
        self.heap.release(v);
    }

    /// Add one host reference.
    pub fn retain(&mut self, v: Value) {
        self.heap.retain(v);
    }

    /// Allocate a heap string. The returned value carries a reference
    /// the host must release.
    pub fn alloc_string(&mut self, s: &str) -> VmResult<Value> {
        self.heap.alloc_string(s)
    }

    /// User-visible string rendering of a value.
    #[must_use]
    pub fn value_as_string(&self, v: Value) -> String {
        crate::fmt::value_to_string(self, v)
    }

    /// Message of the last panic, empty when the last run succeeded.
    #[must_use]
    pub fn get_panic_msg(&self) -> &str {
        &self.panic_msg
    }

    /// Stack trace of the last panic.
    #[must_use]
    pub fn get_stack_trace(&self) -> &StackTrace {
        &self.stack_trace
    }

    /// Run the cycle sweep; see [`Heap::check_memory`].
    pub fn check_memory(&mut self) -> bool {
        self.heap.check_memory()
    }

    /// Enable or disable retain/release accounting.
    pub fn set_trace(&mut self, on: bool) {
        self.heap.set_trace(on);
    }

    /// Current retain/release counters.
    #[must_use]
    pub fn trace_stats(&self) -> TraceStats {
        self.heap.trace_stats()
    }

    /// Lines produced by the `print` binding during the last run.
    pub fn take_printed(&mut self) -> Vec<String> {
        std::mem::take(&mut self.printed)
    }

    /// The heap (host-side inspection).
    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The heap, mutably.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// The symbol registries.
    #[must_use]
    pub fn symbols(&self) -> &Symbols {
        &self.syms
    }

    /// The symbol registries, mutably (compiler-side registration).
    pub fn symbols_mut(&mut self) -> &mut Symbols {
        &mut self.syms
    }

    /// Stack cursor (testing hook for the balance invariant).
    #[must_use]
    pub fn stack_top(&self) -> usize {
        self.top
    }

    // =========================================================================
    // Stack Primitives
    // =========================================================================

    #[inline]
    pub(crate) fn push(&mut self, v: Value) {
        if self.top == self.stack.len() {
            self.stack.push(Value::none());
        }
        self.stack[self.top] = v;
        self.top += 1;
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Value {
        debug_assert!(self.top > 0);
        self.top -= 1;
        self.stack[self.top]
    }

    #[inline]
    pub(crate) fn local(&self, slot: u8) -> Value {
        self.stack[self.fp + slot as usize]
    }

    #[inline]
    pub(crate) fn set_local(&mut self, slot: u8, v: Value) {
        let idx = self.fp + slot as usize;
        self.stack[idx] = v;
    }

    // =========================================================================
    // String / Map Key Resolution
    // =========================================================================

    /// Borrow the text of a string value (constant-pool or heap).
    #[inline]
    pub(crate) fn str_of(&self, v: Value) -> Option<&str> {
        if let Some((start, len)) = v.as_const_string() {
            return Some(self.buf.str_slice(start, len));
        }
        if v.is_pointer() {
            return self.heap.string_value(v);
        }
        None
    }

    /// Materialize a map key from a value, without taking a reference
    /// (lookup/remove path; the insert path retains identity keys).
    pub(crate) fn map_key_ref(&self, v: Value) -> VmResult<MapKey> {
        if v.is_number() {
            return Ok(MapKey::num(v.as_f64()));
        }
        if v.is_none() {
            return Ok(MapKey::None);
        }
        if let Some(b) = v.as_bool() {
            return Ok(MapKey::Bool(b));
        }
        if let Some(s) = self.str_of(v) {
            return Ok(MapKey::str(s));
        }
        if let Some(p) = v.as_ptr() {
            return Ok(MapKey::obj(p));
        }
        Err(VmError::panic("invalid map key"))
    }

    /// Materialize a map key for insertion: identity keys take a
    /// reference owned by the map.
    pub(crate) fn map_key_owned(&mut self, v: Value) -> VmResult<MapKey> {
        let key = self.map_key_ref(v)?;
        if matches!(key, MapKey::Obj(_)) {
            self.heap.retain(v);
        }
        Ok(key)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
