//! Access flags and VM-internal flags
//!
//! Class, method, and field access flags use the class-file bit assignments.
//! `ACC_SUPER` and `ACC_SYNCHRONIZED` share a bit; the former is only
//! meaningful on classes and the latter only on methods.

/// Declared public.
pub const ACC_PUBLIC: u16 = 0x0001;
/// Declared private.
pub const ACC_PRIVATE: u16 = 0x0002;
/// Declared protected.
pub const ACC_PROTECTED: u16 = 0x0004;
/// Declared static.
pub const ACC_STATIC: u16 = 0x0008;
/// Declared final.
pub const ACC_FINAL: u16 = 0x0010;
/// Class flag: `invokespecial` folds to the superclass method.
pub const ACC_SUPER: u16 = 0x0020;
/// Method flag: the monitor of the receiver (or class) guards each call.
pub const ACC_SYNCHRONIZED: u16 = 0x0020;
/// Field flag: reads and writes use volatile ordering.
pub const ACC_VOLATILE: u16 = 0x0040;
/// Method flag: the implementation is bound through the native bridge.
pub const ACC_NATIVE: u16 = 0x0100;
/// Class flag: the class is an interface.
pub const ACC_INTERFACE: u16 = 0x0200;
/// Declared abstract.
pub const ACC_ABSTRACT: u16 = 0x0400;

/// VM flag: instances are weak references, registered at allocation and
/// cleared by the collector when the referent dies.
pub const VM_WEAK_REFERENCE: u16 = 0x0001;
