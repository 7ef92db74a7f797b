//! Shared helpers for building classes, methods, and code by hand.
//!
//! Integration tests play the role of the external class loader: they
//! assemble `Class`/`Method`/`Field`/`Code` cells directly and register
//! them with the machine.

#![allow(dead_code)]

use shrike_bytecode::flags::ACC_STATIC;
use shrike_bytecode::{ExceptionHandler, FieldKind, LineNumber, MethodDescriptor};
use shrike_core::object::{Cell, Class, Code, Field, Method, MethodCode, Reference};
use shrike_core::{Machine, MachineOptions, Obj};

pub fn machine() -> Machine {
    Machine::new(MachineOptions::default())
}

pub fn machine_with(options: MachineOptions) -> Machine {
    Machine::new(options)
}

pub fn define_class(m: &mut Machine, name: &str, super_class: Option<Obj>, flags: u16) -> Obj {
    let class = m.heap.alloc(Cell::Class(Class {
        flags,
        vm_flags: 0,
        name: name.to_string(),
        super_class,
        interface_table: Vec::new(),
        virtual_table: Vec::new(),
        field_table: Vec::new(),
        method_table: Vec::new(),
        static_table: Vec::new(),
        initializer: None,
        instance_size: 0,
    }));
    m.register_class(name, class);
    class
}

pub fn code(m: &mut Machine, max_locals: usize, max_stack: usize, body: Vec<u8>) -> Obj {
    code_full(m, max_locals, max_stack, body, Vec::new(), Vec::new(), Vec::new())
}

pub fn code_full(
    m: &mut Machine,
    max_locals: usize,
    max_stack: usize,
    body: Vec<u8>,
    pool: Vec<Obj>,
    handlers: Vec<ExceptionHandler>,
    line_numbers: Vec<LineNumber>,
) -> Obj {
    m.heap.alloc(Cell::Code(Code {
        body,
        max_locals,
        max_stack,
        pool,
        handlers,
        line_numbers,
    }))
}

/// Install a method on a class. Parameter counts include the receiver for
/// instance methods, the way the loader computes them.
pub fn method(
    m: &mut Machine,
    class: Obj,
    name: &str,
    spec: &str,
    flags: u16,
    code: MethodCode,
) -> Obj {
    let descriptor = MethodDescriptor::parse(spec).expect("test method spec");
    let receiver = usize::from(flags & ACC_STATIC == 0);
    let method = m.heap.alloc(Cell::Method(Method {
        flags,
        class: Some(class),
        name: name.to_string(),
        spec: spec.to_string(),
        parameter_count: descriptor.parameter_count() + receiver,
        parameter_footprint: descriptor.parameter_footprint() + receiver,
        offset: 0,
        code,
    }));
    m.heap.class_mut(class).method_table.push(method);
    method
}

/// Append a method to a class's virtual table, assigning its offset.
pub fn add_virtual(m: &mut Machine, class: Obj, method: Obj) {
    let offset = m.heap.class(class).virtual_table.len();
    m.heap.method_mut(method).offset = offset;
    m.heap.class_mut(class).virtual_table.push(method);
}

pub fn field(
    m: &mut Machine,
    class: Obj,
    name: &str,
    spec: &str,
    kind: FieldKind,
    offset: usize,
    flags: u16,
) -> Obj {
    let field = m.heap.alloc(Cell::Field(Field {
        flags,
        class: Some(class),
        name: name.to_string(),
        spec: spec.to_string(),
        code: kind,
        offset,
    }));
    m.heap.class_mut(class).field_table.push(field);
    field
}

/// A symbolic member reference pool entry.
pub fn member_ref(m: &mut Machine, class_name: &str, name: &str, spec: &str) -> Obj {
    m.heap.alloc(Cell::Reference(Reference {
        class_name: class_name.to_string(),
        name: name.to_string(),
        spec: spec.to_string(),
    }))
}

/// A symbolic class name pool entry.
pub fn class_sym(m: &mut Machine, name: &str) -> Obj {
    m.heap.alloc(Cell::Symbol(name.to_string()))
}

pub fn int_const(m: &mut Machine, v: i32) -> Obj {
    m.heap.alloc(Cell::Int(v))
}

pub fn long_const(m: &mut Machine, v: i64) -> Obj {
    m.heap.alloc(Cell::Long(v))
}

pub fn float_const(m: &mut Machine, v: f32) -> Obj {
    m.heap.alloc(Cell::Float(v))
}

pub fn double_const(m: &mut Machine, v: f64) -> Obj {
    m.heap.alloc(Cell::Double(v))
}

pub fn str_const(m: &mut Machine, s: &str) -> Obj {
    m.heap.alloc(Cell::Str(s.to_string()))
}

pub fn int_result(m: &Machine, result: Option<Obj>) -> i32 {
    m.heap.int_value(result.expect("no boxed result"))
}

pub fn long_result(m: &Machine, result: Option<Obj>) -> i64 {
    m.heap.long_value(result.expect("no boxed result"))
}

/// Class of the thread's pending exception.
pub fn pending_class(m: &Machine, t: &shrike_core::Thread) -> Obj {
    let e = t.exception.expect("no pending exception");
    m.class_of(e)
}

/// Message of the thread's pending exception.
pub fn pending_message(m: &Machine, t: &shrike_core::Thread) -> Option<String> {
    let e = t.exception.expect("no pending exception");
    m.heap.throwable(e).message.clone()
}
