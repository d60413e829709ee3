//! Panic stack traces.
//!
//! After a panic, the unwinder walks the in-band RetInfo chain from
//! the current frame, resolves each saved pc through the debug table
//! (a linear scan; the table is small), and maps node token offsets to
//! line/column positions with a second linear scan over the source.
//! The outermost frame is synthesized as `main`.

use crate::vm::Vm;
use opal_core::debug::line_col;
use opal_core::{DebugSym, VmError, VmResult, NULL_ID};
use smallvec::SmallVec;

/// One stack trace entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFrame {
    /// Function name (`main` for the outermost frame).
    pub name: String,
    /// 1-based source line.
    pub line: u32,
    /// 1-based source column.
    pub col: u32,
}

/// A materialized stack trace, top-most frame first.
#[derive(Debug, Clone, Default)]
pub struct StackTrace {
    /// Frames from the panic site outward.
    pub frames: SmallVec<[TraceFrame; 8]>,
}

impl std::fmt::Display for StackTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for frame in &self.frames {
            writeln!(f, "  at {}:{}:{}", frame.name, frame.line, frame.col)?;
        }
        Ok(())
    }
}

impl Vm {
    /// Find the debug symbol covering a pc: the last table entry at or
    /// before it.
    fn find_debug_sym(&self, pc: u32) -> VmResult<DebugSym> {
        let mut best: Option<DebugSym> = None;
        for sym in &self.buf.debug_table {
            if sym.pc <= pc {
                best = Some(*sym);
            } else {
                break;
            }
        }
        best.ok_or(VmError::NoDebugSym { pc })
    }

    /// Walk the frame chain and materialize the trace.
    pub(crate) fn build_stack_trace(&self) -> VmResult<StackTrace> {
        let mut frames: SmallVec<[TraceFrame; 8]> = SmallVec::new();
        let mut pc = self.pc as u32;
        let mut fp = self.fp;

        loop {
            let sym = self.find_debug_sym(pc)?;
            let (line, col) = self
                .debug
                .node(sym.node_id)
                .map(|n| line_col(&self.debug.src, n.token_pos))
                .unwrap_or((0, 0));
            let name = if sym.frame_node_id == NULL_ID {
                "main".to_owned()
            } else {
                self.debug
                    .node(sym.frame_node_id)
                    .and_then(|n| n.name.clone())
                    .unwrap_or_else(|| "(anonymous)".to_owned())
            };
            frames.push(TraceFrame { name, line, col });

            if sym.frame_node_id == NULL_ID {
                break;
            }
            let linkage = self.stack[fp];
            if !linkage.is_ret_info() {
                break;
            }
            let ri = linkage.as_ret_info();
            // The saved pc points after the call instruction; step back
            // inside it for the lookup.
            pc = ri.pc.saturating_sub(1);
            fp = ri.prev_fp as usize;
        }

        Ok(StackTrace { frames })
    }
}
