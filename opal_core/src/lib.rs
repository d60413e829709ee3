//! # Opal Core
//!
//! Core types shared across the Opal virtual machine:
//!
//! - **Value System**: NaN-boxed 64-bit tagged values, including the
//!   in-band `RetInfo` frame linkage word
//! - **Bytecode**: the flat byte-stream instruction format the VM
//!   consumes, plus a builder for producing it
//! - **Debug Info**: pc-to-source mapping tables for stack traces
//! - **Error Handling**: the unified result and error definitions

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod bytecode;
pub mod debug;
pub mod error;
pub mod value;

pub use bytecode::{BufferBuilder, ByteCodeBuffer, OpCode};
pub use debug::{DebugInfo, DebugNode, DebugSym};
pub use error::{VmError, VmResult};
pub use value::{RetInfo, Value};

/// Sentinel id used throughout the VM for "no entry" (free slots,
/// missing debug frames, absent operands).
pub const NULL_ID: u32 = u32::MAX;

/// Sentinel byte operand meaning "no local slot" (e.g. an unbound loop
/// variable or an operand taken from the stack instead of a local).
pub const NULL_BYTE: u8 = u8::MAX;
