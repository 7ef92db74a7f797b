//! Shrike VM Bytecode Definitions
//!
//! This crate provides the instruction set and the class-file level data
//! definitions shared by the Shrike virtual machine: opcodes, access flags,
//! method descriptors, and the attribute tables the interpreter consults
//! (exception handlers and line numbers).

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod descriptor;
pub mod flags;
pub mod opcode;
pub mod tables;

pub use descriptor::{DescriptorError, FfiType, FieldKind, MethodDescriptor};
pub use opcode::Opcode;
pub use tables::{ExceptionHandler, LineNumber};
