//! Shrike VM Core Runtime
//!
//! This crate provides the execution core of the Shrike virtual machine:
//! - The bytecode dispatch loop with its invoke and throw transitions
//! - The unified operand/locals stack and frame manager
//! - Lazy constant-pool resolution
//! - The native method bridge
//! - Exception unwinding with handler lookup and uncaught reporting
//!
//! Class-file parsing, the collection policy, the C-ABI caller, and the
//! launcher are external collaborators expressed as traits on [`Machine`].

#![warn(rust_2018_idioms)]

pub mod gc;
pub mod interp;
pub mod machine;
pub mod native;
pub mod object;
pub mod resolve;
pub mod stack;
pub mod sync;
pub mod value;

pub use gc::{Heap, Obj};
pub use interp::{run, run_main, run_method, Arg};
pub use machine::{ClassFinder, HostCall, Library, Machine, MachineOptions, RunState};
pub use native::{BuiltinFn, NativeArgs};
pub use object::{Cell, Class, Code, Field, Instance, Method, MethodCode, Throwable};
pub use stack::{Thread, FRAME_FOOTPRINT, NO_FRAME};
pub use value::Slot;

/// Fatal VM failures.
///
/// These are the truly-impossible states of the core: they never enter the
/// guest-visible exception slot and abort the run instead. Everything a
/// guest program can observe travels through the pending-exception slot on
/// [`Thread`].
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    /// The code stream contained a byte outside the implemented catalog.
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u8),

    /// `wide` prefixed an opcode that has no widened form.
    #[error("unknown wide opcode {0:#04x}")]
    UnknownWideOpcode(u8),

    /// Any other impossible state, with a description.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias for core operations that can hit a fatal state.
pub type VmResult<T> = Result<T, VmError>;
