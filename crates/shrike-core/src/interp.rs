//! The dispatch loop and its transitions
//!
//! One function drives a thread: fetch an opcode, effect its stack and
//! heap transitions, repeat. Invocation and exception delivery are
//! sub-states of the same loop rather than separate functions, so no
//! loop-local caches need restoring when an invoke returns. A pending
//! exception diverts the loop to the unwinder, which walks the frame
//! chain's handler tables and either resumes at a handler or reports the
//! exception and ends the run.

use crate::gc::Obj;
use crate::machine::{Machine, RunState};
use crate::native::invoke_native;
use crate::object::{Cell, MethodCode};
use crate::resolve::{
    find_interface_method, find_method, find_method_in_class, instance_of, is_special_method,
    resolve_class, resolve_class_by_name, resolve_field, resolve_method,
};
use crate::stack::{check_stack, pop_frame, push_frame, Thread, FRAME_FOOTPRINT};
use crate::value::Slot;
use crate::{VmError, VmResult};
use shrike_bytecode::flags::{ACC_NATIVE, ACC_STATIC, ACC_SYNCHRONIZED};
use shrike_bytecode::tables::line_for;
use shrike_bytecode::{FieldKind, MethodDescriptor, Opcode};

/// An argument to [`run_method`], matching one descriptor parameter.
#[derive(Debug, Clone, Copy)]
pub enum Arg {
    /// A 32-bit primitive (`B C F I S Z`).
    Int(i32),
    /// A 64-bit primitive (`J D`).
    Long(i64),
    /// A reference (`L…;` or `[…`).
    Object(Option<Obj>),
}

enum Flow {
    Fetch,
    Invoke(Obj),
    Throw,
}

enum Unwind {
    Handled,
    NativeBoundary,
    Uncaught,
}

#[inline]
fn current_code(t: &Thread) -> Obj {
    t.code.expect("dispatch without a code array")
}

#[inline]
fn fetch_u8(m: &Machine, t: &mut Thread) -> u8 {
    let byte = m.heap.code(current_code(t)).body[t.ip];
    t.ip += 1;
    byte
}

#[inline]
fn fetch_u16(m: &Machine, t: &mut Thread) -> u16 {
    let hi = fetch_u8(m, t) as u16;
    let lo = fetch_u8(m, t) as u16;
    (hi << 8) | lo
}

#[inline]
fn fetch_i32(m: &Machine, t: &mut Thread) -> i32 {
    let hi = fetch_u16(m, t) as u32;
    let lo = fetch_u16(m, t) as u32;
    ((hi << 16) | lo) as i32
}

/// Apply a 16-bit PC-relative branch. The offset is relative to the
/// opcode's own address, three bytes back from the post-operand `ip`.
#[inline]
fn branch16(m: &Machine, t: &mut Thread, taken: bool) {
    let offset = fetch_u16(m, t) as i16 as i64;
    if taken {
        t.ip = (t.ip as i64 - 3 + offset) as usize;
    }
}

/// Null-check then bounds-check an array access; raises and returns
/// `None` on failure.
fn checked_array_index(
    m: &mut Machine,
    t: &mut Thread,
    array: Option<Obj>,
    index: i32,
) -> Option<(Obj, usize)> {
    let Some(array) = array else {
        m.throw_null_pointer(t);
        return None;
    };
    let length = m.heap.array_length(array);
    if index >= 0 && (index as usize) < length {
        Some((array, index as usize))
    } else {
        m.throw_array_index(t, index, length);
        None
    }
}

/// Execute the current thread until the root frame returns or the run
/// dies to an unhandled exception.
///
/// Returns the root method's result: a boxed `Int`/`Long` for primitive
/// returns, the reference for object returns, `None` for void. `None`
/// with a pending exception on the thread means the run was killed (the
/// exception report has already been written to stderr), or that control
/// reached a native frame boundary during unwinding.
pub fn run(m: &mut Machine, t: &mut Thread) -> VmResult<Option<Obj>> {
    let mut flow = if t.exception.is_some() {
        Flow::Throw
    } else {
        Flow::Fetch
    };

    loop {
        match flow {
            Flow::Fetch => {}
            Flow::Invoke(target) => {
                if m.heap.method(target).flags & ACC_NATIVE != 0 {
                    invoke_native(m, t, target)?;
                } else {
                    check_stack(m, t, target);
                    if t.exception.is_none() {
                        push_frame(m, t, target);
                    }
                }
                flow = if t.exception.is_some() {
                    Flow::Throw
                } else {
                    Flow::Fetch
                };
                continue;
            }
            Flow::Throw => match unwind(m, t)? {
                Unwind::Handled => {
                    flow = Flow::Fetch;
                    continue;
                }
                Unwind::NativeBoundary => return Ok(None),
                Unwind::Uncaught => {
                    let exception = t.exception.expect("uncaught without an exception");
                    eprint!("{}", format_uncaught(m, exception));
                    return Ok(None);
                }
            },
        }

        flow = Flow::Fetch;
        let byte = fetch_u8(m, t);
        let op = Opcode::from_u8(byte).ok_or(VmError::UnknownOpcode(byte))?;

        match op {
            Opcode::Aaload => {
                let index = t.pop_int();
                let array = t.pop_object();
                match checked_array_index(m, t, array, index) {
                    Some((a, i)) => {
                        let v = m.heap.object_array(a).data[i];
                        t.push_object(v);
                    }
                    None => flow = Flow::Throw,
                }
            }

            Opcode::Aastore => {
                let value = t.pop_object();
                let index = t.pop_int();
                let array = t.pop_object();
                match checked_array_index(m, t, array, index) {
                    Some((a, i)) => m.heap.object_array_mut(a).data[i] = value,
                    None => flow = Flow::Throw,
                }
            }

            Opcode::AconstNull => t.push_object(None),

            Opcode::Aload => {
                let index = fetch_u8(m, t) as usize;
                let v = t.local_object(index);
                t.push_object(v);
            }
            Opcode::Aload0 => {
                let v = t.local_object(0);
                t.push_object(v);
            }
            Opcode::Aload1 => {
                let v = t.local_object(1);
                t.push_object(v);
            }
            Opcode::Aload2 => {
                let v = t.local_object(2);
                t.push_object(v);
            }
            Opcode::Aload3 => {
                let v = t.local_object(3);
                t.push_object(v);
            }

            Opcode::Anewarray => {
                let count = t.pop_int();
                if count >= 0 {
                    let index = fetch_u16(m, t) as usize;
                    match resolve_class(m, t, current_code(t), index - 1) {
                        Some(class) => {
                            match m.make_object_array(t, Some(class), count as usize) {
                                Some(array) => t.push_object(Some(array)),
                                None => flow = Flow::Throw,
                            }
                        }
                        None => flow = Flow::Throw,
                    }
                } else {
                    m.throw_negative_array_size(t, count);
                    flow = Flow::Throw;
                }
            }

            Opcode::Areturn => {
                let result = t.pop_object();
                pop_frame(m, t);
                if t.frame < 0 {
                    return Ok(result);
                }
                t.push_object(result);
            }

            Opcode::Arraylength => match t.pop_object() {
                Some(array) => {
                    let length = m.heap.array_length(array);
                    t.push_int(length as i32);
                }
                None => {
                    m.throw_null_pointer(t);
                    flow = Flow::Throw;
                }
            },

            Opcode::Astore => {
                let index = fetch_u8(m, t) as usize;
                let v = t.pop_object();
                t.set_local_object(index, v);
            }
            Opcode::Astore0 => {
                let v = t.pop_object();
                t.set_local_object(0, v);
            }
            Opcode::Astore1 => {
                let v = t.pop_object();
                t.set_local_object(1, v);
            }
            Opcode::Astore2 => {
                let v = t.pop_object();
                t.set_local_object(2, v);
            }
            Opcode::Astore3 => {
                let v = t.pop_object();
                t.set_local_object(3, v);
            }

            Opcode::Athrow => {
                match t.pop_object() {
                    Some(e) => t.exception = Some(e),
                    None => m.throw_null_pointer(t),
                }
                flow = Flow::Throw;
            }

            Opcode::Baload => {
                let index = t.pop_int();
                let array = t.pop_object();
                match checked_array_index(m, t, array, index) {
                    Some((a, i)) => {
                        let v = m.heap.byte_array(a)[i];
                        t.push_int(v as i32);
                    }
                    None => flow = Flow::Throw,
                }
            }

            Opcode::Bastore => {
                let value = t.pop_int() as i8;
                let index = t.pop_int();
                let array = t.pop_object();
                match checked_array_index(m, t, array, index) {
                    Some((a, i)) => m.heap.byte_array_mut(a)[i] = value,
                    None => flow = Flow::Throw,
                }
            }

            Opcode::Bipush => {
                let v = fetch_u8(m, t) as i8 as i32;
                t.push_int(v);
            }

            Opcode::Caload => {
                let index = t.pop_int();
                let array = t.pop_object();
                match checked_array_index(m, t, array, index) {
                    Some((a, i)) => {
                        let v = m.heap.char_array(a)[i];
                        t.push_int(v as i32);
                    }
                    None => flow = Flow::Throw,
                }
            }

            Opcode::Castore => {
                let value = t.pop_int() as u16;
                let index = t.pop_int();
                let array = t.pop_object();
                match checked_array_index(m, t, array, index) {
                    Some((a, i)) => m.heap.char_array_mut(a)[i] = value,
                    None => flow = Flow::Throw,
                }
            }

            Opcode::Checkcast => {
                let index = fetch_u16(m, t) as usize;
                if let Some(top) = t.peek_object(t.sp - 1) {
                    match resolve_class(m, t, current_code(t), index - 1) {
                        Some(class) => {
                            if !instance_of(m, class, Some(top)) {
                                let actual = m.heap.class(m.class_of(top)).name.clone();
                                let target = m.heap.class(class).name.clone();
                                m.throw_class_cast(t, &actual, &target);
                                flow = Flow::Throw;
                            }
                        }
                        None => flow = Flow::Throw,
                    }
                }
            }

            Opcode::Dup => {
                let v1 = t.stack[t.sp - 1];
                t.stack[t.sp] = v1;
                t.sp += 1;
            }
            Opcode::DupX1 => {
                let v1 = t.stack[t.sp - 1];
                let v2 = t.stack[t.sp - 2];
                t.stack[t.sp - 2] = v1;
                t.stack[t.sp - 1] = v2;
                t.stack[t.sp] = v1;
                t.sp += 1;
            }
            Opcode::DupX2 => {
                let v1 = t.stack[t.sp - 1];
                let v2 = t.stack[t.sp - 2];
                let v3 = t.stack[t.sp - 3];
                t.stack[t.sp - 3] = v1;
                t.stack[t.sp - 2] = v3;
                t.stack[t.sp - 1] = v2;
                t.stack[t.sp] = v1;
                t.sp += 1;
            }
            Opcode::Dup2 => {
                let v1 = t.stack[t.sp - 1];
                let v2 = t.stack[t.sp - 2];
                t.stack[t.sp] = v2;
                t.stack[t.sp + 1] = v1;
                t.sp += 2;
            }
            Opcode::Dup2X1 => {
                let v1 = t.stack[t.sp - 1];
                let v2 = t.stack[t.sp - 2];
                let v3 = t.stack[t.sp - 3];
                t.stack[t.sp - 3] = v2;
                t.stack[t.sp - 2] = v1;
                t.stack[t.sp - 1] = v3;
                t.stack[t.sp] = v2;
                t.stack[t.sp + 1] = v1;
                t.sp += 2;
            }
            Opcode::Dup2X2 => {
                let v1 = t.stack[t.sp - 1];
                let v2 = t.stack[t.sp - 2];
                let v3 = t.stack[t.sp - 3];
                let v4 = t.stack[t.sp - 4];
                t.stack[t.sp - 4] = v2;
                t.stack[t.sp - 3] = v1;
                t.stack[t.sp - 2] = v4;
                t.stack[t.sp - 1] = v3;
                t.stack[t.sp] = v2;
                t.stack[t.sp + 1] = v1;
                t.sp += 2;
            }

            Opcode::Getfield => {
                if t.peek_object(t.sp - 1).is_some() {
                    let index = fetch_u16(m, t) as usize;
                    match resolve_field(m, t, current_code(t), index - 1) {
                        Some(field) => {
                            let (kind, offset) = {
                                let f = m.heap.field(field);
                                (f.code, f.offset)
                            };
                            let instance = t.pop_object().expect("receiver vanished");
                            let slot = m.heap.instance(instance).fields[offset];
                            match kind {
                                FieldKind::Byte | FieldKind::Boolean => {
                                    t.push_int(slot.as_int() as i8 as i32)
                                }
                                FieldKind::Char => t.push_int(slot.as_int() as u16 as i32),
                                FieldKind::Short => t.push_int(slot.as_int() as i16 as i32),
                                FieldKind::Float | FieldKind::Int => t.push_int(slot.as_int()),
                                FieldKind::Double | FieldKind::Long => {
                                    t.push_long(slot.as_long())
                                }
                                FieldKind::Object => t.push_object(slot.as_object()),
                                FieldKind::Void => {
                                    return Err(VmError::Internal(
                                        "void field read".to_string(),
                                    ))
                                }
                            }
                        }
                        None => flow = Flow::Throw,
                    }
                } else {
                    m.throw_null_pointer(t);
                    flow = Flow::Throw;
                }
            }

            Opcode::Getstatic => {
                let index = fetch_u16(m, t) as usize;
                match resolve_field(m, t, current_code(t), index - 1) {
                    Some(field) => {
                        let field_class =
                            m.heap.field(field).class.expect("field without a class");
                        if let Some(clinit) = m.heap.class(field_class).initializer {
                            m.heap.class_mut(field_class).initializer = None;
                            t.ip -= 3;
                            flow = Flow::Invoke(clinit);
                        } else {
                            let (kind, offset) = {
                                let f = m.heap.field(field);
                                (f.code, f.offset)
                            };
                            let v = m.heap.class(field_class).static_table[offset];
                            match kind {
                                FieldKind::Byte
                                | FieldKind::Boolean
                                | FieldKind::Char
                                | FieldKind::Short
                                | FieldKind::Float
                                | FieldKind::Int => {
                                    t.push_int(v.map_or(0, |b| m.heap.int_value(b)))
                                }
                                FieldKind::Double | FieldKind::Long => {
                                    t.push_long(v.map_or(0, |b| m.heap.long_value(b)))
                                }
                                FieldKind::Object => t.push_object(v),
                                FieldKind::Void => {
                                    return Err(VmError::Internal(
                                        "void field read".to_string(),
                                    ))
                                }
                            }
                        }
                    }
                    None => flow = Flow::Throw,
                }
            }

            Opcode::Goto => branch16(m, t, true),
            Opcode::GotoW => {
                let offset = fetch_i32(m, t) as i64;
                t.ip = (t.ip as i64 - 5 + offset) as usize;
            }

            Opcode::I2b => {
                let v = t.pop_int();
                t.push_int(v as i8 as i32);
            }
            Opcode::I2c => {
                let v = t.pop_int();
                t.push_int(v as u16 as i32);
            }
            Opcode::I2l => {
                let v = t.pop_int();
                t.push_long(v as i64);
            }
            Opcode::I2s => {
                let v = t.pop_int();
                t.push_int(v as i16 as i32);
            }

            Opcode::Iadd => {
                let b = t.pop_int();
                let a = t.pop_int();
                t.push_int(a.wrapping_add(b));
            }

            Opcode::Iaload => {
                let index = t.pop_int();
                let array = t.pop_object();
                match checked_array_index(m, t, array, index) {
                    Some((a, i)) => {
                        let v = m.heap.int_array(a)[i];
                        t.push_int(v);
                    }
                    None => flow = Flow::Throw,
                }
            }

            Opcode::Iand => {
                let b = t.pop_int();
                let a = t.pop_int();
                t.push_int(a & b);
            }

            Opcode::Iastore => {
                let value = t.pop_int();
                let index = t.pop_int();
                let array = t.pop_object();
                match checked_array_index(m, t, array, index) {
                    Some((a, i)) => m.heap.int_array_mut(a)[i] = value,
                    None => flow = Flow::Throw,
                }
            }

            Opcode::IconstM1 => t.push_int(-1),
            Opcode::Iconst0 => t.push_int(0),
            Opcode::Iconst1 => t.push_int(1),
            Opcode::Iconst2 => t.push_int(2),
            Opcode::Iconst3 => t.push_int(3),
            Opcode::Iconst4 => t.push_int(4),
            Opcode::Iconst5 => t.push_int(5),

            Opcode::Idiv => {
                let b = t.pop_int();
                let a = t.pop_int();
                if b == 0 {
                    m.throw_arithmetic(t);
                    flow = Flow::Throw;
                } else {
                    t.push_int(a.wrapping_div(b));
                }
            }

            Opcode::IfAcmpeq => {
                let b = t.pop_object();
                let a = t.pop_object();
                branch16(m, t, a == b);
            }
            Opcode::IfAcmpne => {
                let b = t.pop_object();
                let a = t.pop_object();
                branch16(m, t, a != b);
            }
            Opcode::IfIcmpeq => {
                let b = t.pop_int();
                let a = t.pop_int();
                branch16(m, t, a == b);
            }
            Opcode::IfIcmpne => {
                let b = t.pop_int();
                let a = t.pop_int();
                branch16(m, t, a != b);
            }
            Opcode::IfIcmplt => {
                let b = t.pop_int();
                let a = t.pop_int();
                branch16(m, t, a < b);
            }
            Opcode::IfIcmpge => {
                let b = t.pop_int();
                let a = t.pop_int();
                branch16(m, t, a >= b);
            }
            Opcode::IfIcmpgt => {
                let b = t.pop_int();
                let a = t.pop_int();
                branch16(m, t, a > b);
            }
            Opcode::IfIcmple => {
                let b = t.pop_int();
                let a = t.pop_int();
                branch16(m, t, a <= b);
            }
            Opcode::Ifeq => {
                let v = t.pop_int();
                branch16(m, t, v == 0);
            }
            Opcode::Ifne => {
                let v = t.pop_int();
                branch16(m, t, v != 0);
            }
            Opcode::Iflt => {
                let v = t.pop_int();
                branch16(m, t, v < 0);
            }
            Opcode::Ifge => {
                let v = t.pop_int();
                branch16(m, t, v >= 0);
            }
            Opcode::Ifgt => {
                let v = t.pop_int();
                branch16(m, t, v > 0);
            }
            Opcode::Ifle => {
                let v = t.pop_int();
                branch16(m, t, v <= 0);
            }
            Opcode::Ifnull => {
                let v = t.pop_object();
                branch16(m, t, v.is_none());
            }
            Opcode::Ifnonnull => {
                let v = t.pop_object();
                branch16(m, t, v.is_some());
            }

            Opcode::Iinc => {
                let index = fetch_u8(m, t) as usize;
                let c = fetch_u8(m, t) as i8 as i32;
                let v = t.local_int(index);
                t.set_local_int(index, v.wrapping_add(c));
            }

            Opcode::Iload => {
                let index = fetch_u8(m, t) as usize;
                let v = t.local_int(index);
                t.push_int(v);
            }
            Opcode::Iload0 => {
                let v = t.local_int(0);
                t.push_int(v);
            }
            Opcode::Iload1 => {
                let v = t.local_int(1);
                t.push_int(v);
            }
            Opcode::Iload2 => {
                let v = t.local_int(2);
                t.push_int(v);
            }
            Opcode::Iload3 => {
                let v = t.local_int(3);
                t.push_int(v);
            }

            Opcode::Imul => {
                let b = t.pop_int();
                let a = t.pop_int();
                t.push_int(a.wrapping_mul(b));
            }

            Opcode::Ineg => {
                let v = t.pop_int();
                t.push_int(v.wrapping_neg());
            }

            Opcode::Instanceof => {
                let index = fetch_u16(m, t) as usize;
                if let Some(top) = t.peek_object(t.sp - 1) {
                    match resolve_class(m, t, current_code(t), index - 1) {
                        Some(class) => {
                            let _ = t.pop_object();
                            let is = instance_of(m, class, Some(top));
                            t.push_int(is as i32);
                        }
                        None => flow = Flow::Throw,
                    }
                } else {
                    let _ = t.pop_object();
                    t.push_int(0);
                }
            }

            Opcode::Invokeinterface => {
                let index = fetch_u16(m, t) as usize;
                // count and zero bytes, present in the stream but unused
                t.ip += 2;
                match resolve_method(m, t, current_code(t), index - 1) {
                    Some(method) => {
                        let footprint = m.heap.method(method).parameter_footprint;
                        match t.peek_object(t.sp - footprint) {
                            Some(receiver) => {
                                let target = find_interface_method(m, method, receiver)?;
                                flow = Flow::Invoke(target);
                            }
                            None => {
                                m.throw_null_pointer(t);
                                flow = Flow::Throw;
                            }
                        }
                    }
                    None => flow = Flow::Throw,
                }
            }

            Opcode::Invokespecial => {
                let index = fetch_u16(m, t) as usize;
                match resolve_method(m, t, current_code(t), index - 1) {
                    Some(method) => {
                        let footprint = m.heap.method(method).parameter_footprint;
                        if t.peek_object(t.sp - footprint).is_some() {
                            'dispatch: {
                                let caller_class = m
                                    .heap
                                    .method(t.frame_method(t.frame))
                                    .class
                                    .expect("method without a class");
                                if is_special_method(m, method, caller_class) {
                                    let super_class = m
                                        .heap
                                        .class(caller_class)
                                        .super_class
                                        .expect("SUPER class without a superclass");
                                    if m.heap.class(super_class).virtual_table.is_empty() {
                                        let name = m.heap.class(super_class).name.clone();
                                        if resolve_class_by_name(m, t, &name).is_none() {
                                            flow = Flow::Throw;
                                            break 'dispatch;
                                        }
                                        if let Some(clinit) =
                                            m.heap.class(super_class).initializer
                                        {
                                            m.heap.class_mut(super_class).initializer = None;
                                            t.ip -= 3;
                                            flow = Flow::Invoke(clinit);
                                            break 'dispatch;
                                        }
                                    }
                                    flow = Flow::Invoke(find_method(m, method, super_class));
                                } else {
                                    flow = Flow::Invoke(method);
                                }
                            }
                        } else {
                            m.throw_null_pointer(t);
                            flow = Flow::Throw;
                        }
                    }
                    None => flow = Flow::Throw,
                }
            }

            Opcode::Invokestatic => {
                let index = fetch_u16(m, t) as usize;
                match resolve_method(m, t, current_code(t), index - 1) {
                    Some(method) => {
                        let method_class =
                            m.heap.method(method).class.expect("method without a class");
                        if let Some(clinit) = m.heap.class(method_class).initializer {
                            m.heap.class_mut(method_class).initializer = None;
                            t.ip -= 3;
                            flow = Flow::Invoke(clinit);
                        } else {
                            flow = Flow::Invoke(method);
                        }
                    }
                    None => flow = Flow::Throw,
                }
            }

            Opcode::Invokevirtual => {
                let index = fetch_u16(m, t) as usize;
                match resolve_method(m, t, current_code(t), index - 1) {
                    Some(method) => {
                        let footprint = m.heap.method(method).parameter_footprint;
                        match t.peek_object(t.sp - footprint) {
                            Some(receiver) => 'dispatch: {
                                let class = m.class_of(receiver);
                                if m.heap.class(class).virtual_table.is_empty() {
                                    let name = m.heap.class(class).name.clone();
                                    if resolve_class_by_name(m, t, &name).is_none() {
                                        flow = Flow::Throw;
                                        break 'dispatch;
                                    }
                                    if let Some(clinit) = m.heap.class(class).initializer {
                                        m.heap.class_mut(class).initializer = None;
                                        t.ip -= 3;
                                        flow = Flow::Invoke(clinit);
                                        break 'dispatch;
                                    }
                                }
                                flow = Flow::Invoke(find_method(m, method, class));
                            }
                            None => {
                                m.throw_null_pointer(t);
                                flow = Flow::Throw;
                            }
                        }
                    }
                    None => flow = Flow::Throw,
                }
            }

            Opcode::Ior => {
                let b = t.pop_int();
                let a = t.pop_int();
                t.push_int(a | b);
            }

            Opcode::Irem => {
                let b = t.pop_int();
                let a = t.pop_int();
                if b == 0 {
                    m.throw_arithmetic(t);
                    flow = Flow::Throw;
                } else {
                    t.push_int(a.wrapping_rem(b));
                }
            }

            Opcode::Ireturn => {
                let result = t.pop_int();
                pop_frame(m, t);
                if t.frame < 0 {
                    return Ok(Some(m.heap.alloc(Cell::Int(result))));
                }
                t.push_int(result);
            }

            Opcode::Ishl => {
                let b = t.pop_int();
                let a = t.pop_int();
                t.push_int(a.wrapping_shl(b as u32));
            }
            Opcode::Ishr => {
                let b = t.pop_int();
                let a = t.pop_int();
                t.push_int(a.wrapping_shr(b as u32));
            }

            Opcode::Istore => {
                let index = fetch_u8(m, t) as usize;
                let v = t.pop_int();
                t.set_local_int(index, v);
            }
            Opcode::Istore0 => {
                let v = t.pop_int();
                t.set_local_int(0, v);
            }
            Opcode::Istore1 => {
                let v = t.pop_int();
                t.set_local_int(1, v);
            }
            Opcode::Istore2 => {
                let v = t.pop_int();
                t.set_local_int(2, v);
            }
            Opcode::Istore3 => {
                let v = t.pop_int();
                t.set_local_int(3, v);
            }

            Opcode::Isub => {
                let b = t.pop_int();
                let a = t.pop_int();
                t.push_int(a.wrapping_sub(b));
            }

            Opcode::Iushr => {
                let b = t.pop_int();
                let a = t.pop_int();
                t.push_int((a as u32).wrapping_shr(b as u32) as i32);
            }

            Opcode::Ixor => {
                let b = t.pop_int();
                let a = t.pop_int();
                t.push_int(a ^ b);
            }

            Opcode::Jsr => {
                let offset = fetch_u16(m, t) as i16 as i64;
                t.push_int(t.ip as i32);
                t.ip = (t.ip as i64 - 3 + offset) as usize;
            }
            Opcode::JsrW => {
                let offset = fetch_i32(m, t) as i64;
                t.push_int(t.ip as i32);
                t.ip = (t.ip as i64 - 5 + offset) as usize;
            }

            Opcode::L2i => {
                let v = t.pop_long();
                t.push_int(v as i32);
            }

            Opcode::Ladd => {
                let b = t.pop_long();
                let a = t.pop_long();
                t.push_long(a.wrapping_add(b));
            }

            Opcode::Laload => {
                let index = t.pop_int();
                let array = t.pop_object();
                match checked_array_index(m, t, array, index) {
                    Some((a, i)) => {
                        let v = m.heap.long_array(a)[i];
                        t.push_long(v);
                    }
                    None => flow = Flow::Throw,
                }
            }

            Opcode::Land => {
                let b = t.pop_long();
                let a = t.pop_long();
                t.push_long(a & b);
            }

            Opcode::Lastore => {
                let value = t.pop_long();
                let index = t.pop_int();
                let array = t.pop_object();
                match checked_array_index(m, t, array, index) {
                    Some((a, i)) => m.heap.long_array_mut(a)[i] = value,
                    None => flow = Flow::Throw,
                }
            }

            Opcode::Lcmp => {
                let b = t.pop_long();
                let a = t.pop_long();
                t.push_int(match a.cmp(&b) {
                    std::cmp::Ordering::Greater => 1,
                    std::cmp::Ordering::Equal => 0,
                    std::cmp::Ordering::Less => -1,
                });
            }

            Opcode::Lconst0 => t.push_long(0),
            Opcode::Lconst1 => t.push_long(1),

            Opcode::Ldc | Opcode::LdcW => {
                let index = if op == Opcode::Ldc {
                    fetch_u8(m, t) as usize
                } else {
                    fetch_u16(m, t) as usize
                };
                let entry = m.heap.code(current_code(t)).pool[index - 1];
                match m.heap.get(entry) {
                    Cell::Int(v) => {
                        let v = *v;
                        t.push_int(v);
                    }
                    Cell::Float(v) => {
                        let bits = v.to_bits() as i32;
                        t.push_int(bits);
                    }
                    Cell::Str(_) => t.push_object(Some(entry)),
                    other => {
                        return Err(VmError::Internal(format!(
                            "ldc of a {} pool entry",
                            other.kind_name()
                        )))
                    }
                }
            }

            Opcode::Ldc2W => {
                let index = fetch_u16(m, t) as usize;
                let entry = m.heap.code(current_code(t)).pool[index - 1];
                match m.heap.get(entry) {
                    Cell::Long(v) => {
                        let v = *v;
                        t.push_long(v);
                    }
                    Cell::Double(v) => {
                        let bits = v.to_bits() as i64;
                        t.push_long(bits);
                    }
                    other => {
                        return Err(VmError::Internal(format!(
                            "ldc2_w of a {} pool entry",
                            other.kind_name()
                        )))
                    }
                }
            }

            Opcode::Ldiv => {
                let b = t.pop_long();
                let a = t.pop_long();
                if b == 0 {
                    m.throw_arithmetic(t);
                    flow = Flow::Throw;
                } else {
                    t.push_long(a.wrapping_div(b));
                }
            }

            Opcode::Lload => {
                let index = fetch_u8(m, t) as usize;
                let v = t.local_long(index);
                t.push_long(v);
            }
            Opcode::Lload0 => {
                let v = t.local_long(0);
                t.push_long(v);
            }
            Opcode::Lload1 => {
                let v = t.local_long(1);
                t.push_long(v);
            }
            Opcode::Lload2 => {
                let v = t.local_long(2);
                t.push_long(v);
            }
            Opcode::Lload3 => {
                let v = t.local_long(3);
                t.push_long(v);
            }

            Opcode::Lmul => {
                let b = t.pop_long();
                let a = t.pop_long();
                t.push_long(a.wrapping_mul(b));
            }

            Opcode::Lneg => {
                let v = t.pop_long();
                t.push_long(v.wrapping_neg());
            }

            Opcode::Lor => {
                let b = t.pop_long();
                let a = t.pop_long();
                t.push_long(a | b);
            }

            Opcode::Lrem => {
                let b = t.pop_long();
                let a = t.pop_long();
                if b == 0 {
                    m.throw_arithmetic(t);
                    flow = Flow::Throw;
                } else {
                    t.push_long(a.wrapping_rem(b));
                }
            }

            Opcode::Lreturn => {
                let result = t.pop_long();
                pop_frame(m, t);
                if t.frame < 0 {
                    return Ok(Some(m.heap.alloc(Cell::Long(result))));
                }
                t.push_long(result);
            }

            Opcode::Lshl => {
                let b = t.pop_int();
                let a = t.pop_long();
                t.push_long(a.wrapping_shl(b as u32));
            }
            Opcode::Lshr => {
                let b = t.pop_int();
                let a = t.pop_long();
                t.push_long(a.wrapping_shr(b as u32));
            }

            Opcode::Lstore => {
                let index = fetch_u8(m, t) as usize;
                let v = t.pop_long();
                t.set_local_long(index, v);
            }
            Opcode::Lstore0 => {
                let v = t.pop_long();
                t.set_local_long(0, v);
            }
            Opcode::Lstore1 => {
                let v = t.pop_long();
                t.set_local_long(1, v);
            }
            Opcode::Lstore2 => {
                let v = t.pop_long();
                t.set_local_long(2, v);
            }
            Opcode::Lstore3 => {
                let v = t.pop_long();
                t.set_local_long(3, v);
            }

            Opcode::Lsub => {
                let b = t.pop_long();
                let a = t.pop_long();
                t.push_long(a.wrapping_sub(b));
            }

            Opcode::Lushr => {
                let b = t.pop_int();
                let a = t.pop_long();
                t.push_long((a as u64).wrapping_shr(b as u32) as i64);
            }

            Opcode::Lxor => {
                let b = t.pop_long();
                let a = t.pop_long();
                t.push_long(a ^ b);
            }

            Opcode::Monitorenter => match t.pop_object() {
                Some(o) => m.acquire(t.id, o),
                None => {
                    m.throw_null_pointer(t);
                    flow = Flow::Throw;
                }
            },

            Opcode::Monitorexit => match t.pop_object() {
                Some(o) => m.release(t.id, o),
                None => {
                    m.throw_null_pointer(t);
                    flow = Flow::Throw;
                }
            },

            Opcode::New => {
                let index = fetch_u16(m, t) as usize;
                match resolve_class(m, t, current_code(t), index - 1) {
                    Some(class) => {
                        if let Some(clinit) = m.heap.class(class).initializer {
                            m.heap.class_mut(class).initializer = None;
                            t.ip -= 3;
                            flow = Flow::Invoke(clinit);
                        } else {
                            match m.make_instance(t, class) {
                                Some(o) => t.push_object(Some(o)),
                                None => flow = Flow::Throw,
                            }
                        }
                    }
                    None => flow = Flow::Throw,
                }
            }

            Opcode::Newarray => {
                let count = t.pop_int();
                if count >= 0 {
                    let ty = fetch_u8(m, t);
                    match m.make_primitive_array(t, ty, count as usize)? {
                        Some(array) => t.push_object(Some(array)),
                        None => flow = Flow::Throw,
                    }
                } else {
                    m.throw_negative_array_size(t, count);
                    flow = Flow::Throw;
                }
            }

            Opcode::Nop => {}

            Opcode::Pop => t.sp -= 1,
            Opcode::Pop2 => t.sp -= 2,

            Opcode::Putfield => {
                let index = fetch_u16(m, t) as usize;
                match resolve_field(m, t, current_code(t), index - 1) {
                    Some(field) => {
                        let (kind, offset) = {
                            let f = m.heap.field(field);
                            (f.code, f.offset)
                        };
                        match kind {
                            FieldKind::Byte
                            | FieldKind::Boolean
                            | FieldKind::Char
                            | FieldKind::Short
                            | FieldKind::Float
                            | FieldKind::Int => {
                                let value = t.pop_int();
                                match t.pop_object() {
                                    Some(o) => {
                                        let slot = match kind {
                                            FieldKind::Byte | FieldKind::Boolean => {
                                                Slot::from_int(value as i8 as i32)
                                            }
                                            FieldKind::Char => {
                                                Slot::from_int(value as u16 as i32)
                                            }
                                            FieldKind::Short => {
                                                Slot::from_int(value as i16 as i32)
                                            }
                                            _ => Slot::from_int(value),
                                        };
                                        m.heap.instance_mut(o).fields[offset] = slot;
                                    }
                                    None => {
                                        m.throw_null_pointer(t);
                                        flow = Flow::Throw;
                                    }
                                }
                            }
                            FieldKind::Double | FieldKind::Long => {
                                let value = t.pop_long();
                                match t.pop_object() {
                                    Some(o) => {
                                        m.heap.instance_mut(o).fields[offset] =
                                            Slot::from_long(value);
                                    }
                                    None => {
                                        m.throw_null_pointer(t);
                                        flow = Flow::Throw;
                                    }
                                }
                            }
                            FieldKind::Object => {
                                let value = t.pop_object();
                                match t.pop_object() {
                                    Some(o) => {
                                        m.heap.instance_mut(o).fields[offset] =
                                            Slot::from_object(value);
                                    }
                                    None => {
                                        m.throw_null_pointer(t);
                                        flow = Flow::Throw;
                                    }
                                }
                            }
                            FieldKind::Void => {
                                return Err(VmError::Internal("void field write".to_string()))
                            }
                        }
                    }
                    None => flow = Flow::Throw,
                }
            }

            Opcode::Putstatic => {
                let index = fetch_u16(m, t) as usize;
                match resolve_field(m, t, current_code(t), index - 1) {
                    Some(field) => {
                        let field_class =
                            m.heap.field(field).class.expect("field without a class");
                        if let Some(clinit) = m.heap.class(field_class).initializer {
                            m.heap.class_mut(field_class).initializer = None;
                            t.ip -= 3;
                            flow = Flow::Invoke(clinit);
                        } else {
                            let (kind, offset) = {
                                let f = m.heap.field(field);
                                (f.code, f.offset)
                            };
                            let v = match kind {
                                FieldKind::Byte
                                | FieldKind::Boolean
                                | FieldKind::Char
                                | FieldKind::Short
                                | FieldKind::Float
                                | FieldKind::Int => {
                                    let value = t.pop_int();
                                    Some(m.heap.alloc(Cell::Int(value)))
                                }
                                FieldKind::Double | FieldKind::Long => {
                                    let value = t.pop_long();
                                    Some(m.heap.alloc(Cell::Long(value)))
                                }
                                FieldKind::Object => t.pop_object(),
                                FieldKind::Void => {
                                    return Err(VmError::Internal(
                                        "void field write".to_string(),
                                    ))
                                }
                            };
                            m.heap.class_mut(field_class).static_table[offset] = v;
                        }
                    }
                    None => flow = Flow::Throw,
                }
            }

            Opcode::Ret => {
                let index = fetch_u8(m, t) as usize;
                t.ip = t.local_int(index) as usize;
            }

            Opcode::Return => {
                pop_frame(m, t);
                if t.frame < 0 {
                    return Ok(None);
                }
            }

            Opcode::Saload => {
                let index = t.pop_int();
                let array = t.pop_object();
                match checked_array_index(m, t, array, index) {
                    Some((a, i)) => {
                        let v = m.heap.short_array(a)[i];
                        t.push_int(v as i32);
                    }
                    None => flow = Flow::Throw,
                }
            }

            Opcode::Sastore => {
                let value = t.pop_int() as i16;
                let index = t.pop_int();
                let array = t.pop_object();
                match checked_array_index(m, t, array, index) {
                    Some((a, i)) => m.heap.short_array_mut(a)[i] = value,
                    None => flow = Flow::Throw,
                }
            }

            Opcode::Sipush => {
                let v = fetch_u16(m, t) as i16 as i32;
                t.push_int(v);
            }

            Opcode::Swap => {
                let v1 = t.stack[t.sp - 1];
                let v2 = t.stack[t.sp - 2];
                t.stack[t.sp - 1] = v2;
                t.stack[t.sp - 2] = v1;
            }

            Opcode::Wide => {
                let sub = fetch_u8(m, t);
                match Opcode::from_u8(sub) {
                    Some(Opcode::Aload) => {
                        let index = fetch_u16(m, t) as usize;
                        let v = t.local_object(index);
                        t.push_object(v);
                    }
                    Some(Opcode::Astore) => {
                        let index = fetch_u16(m, t) as usize;
                        let v = t.pop_object();
                        t.set_local_object(index, v);
                    }
                    Some(Opcode::Iinc) => {
                        let index = fetch_u16(m, t) as usize;
                        let c = fetch_u16(m, t) as i16 as i32;
                        let v = t.local_int(index);
                        t.set_local_int(index, v.wrapping_add(c));
                    }
                    Some(Opcode::Iload) => {
                        let index = fetch_u16(m, t) as usize;
                        let v = t.local_int(index);
                        t.push_int(v);
                    }
                    Some(Opcode::Istore) => {
                        let index = fetch_u16(m, t) as usize;
                        let v = t.pop_int();
                        t.set_local_int(index, v);
                    }
                    Some(Opcode::Lload) => {
                        let index = fetch_u16(m, t) as usize;
                        let v = t.local_long(index);
                        t.push_long(v);
                    }
                    Some(Opcode::Lstore) => {
                        let index = fetch_u16(m, t) as usize;
                        let v = t.pop_long();
                        t.set_local_long(index, v);
                    }
                    Some(Opcode::Ret) => {
                        let index = fetch_u16(m, t) as usize;
                        t.ip = t.local_int(index) as usize;
                    }
                    _ => return Err(VmError::UnknownWideOpcode(sub)),
                }
            }
        }
    }
}

/// Walk the frame chain's handler tables for the pending exception.
///
/// A native frame stops the walk with the exception still pending; its
/// invoker continues the walk when control returns to it. Unwinding past a
/// synchronized method releases its monitor, so entry and release counts
/// match on the exceptional exit path too.
fn unwind(m: &mut Machine, t: &mut Thread) -> VmResult<Unwind> {
    log::debug!("unwinding for a pending exception");

    if t.frame >= 0 {
        let frame = t.frame;
        let ip = t.ip;
        t.set_frame_ip(frame, ip);
    }

    while t.frame >= 0 {
        let frame = t.frame;
        let method = t.frame_method(frame);
        let (flags, method_class, method_code) = {
            let mm = m.heap.method(method);
            (mm.flags, mm.class, mm.code.clone())
        };

        if flags & ACC_NATIVE != 0 {
            return Ok(Unwind::NativeBoundary);
        }

        let code = match method_code {
            MethodCode::Bytecode(c) => c,
            other => {
                return Err(VmError::Internal(format!(
                    "bytecode frame with {other:?} code"
                )))
            }
        };

        // The saved ip points one past the faulting opcode's first byte.
        let pc = t.frame_ip(frame) as i64 - 1;

        let handler_count = m.heap.code(code).handlers.len();
        for i in 0..handler_count {
            let handler = m.heap.code(code).handlers[i];
            if pc < handler.start_pc as i64 || pc >= handler.end_pc as i64 {
                continue;
            }

            let mut pending = t.exception.expect("unwind without a pending exception");
            let matched = if handler.catch_type == 0 {
                // catch-any ("finally")
                true
            } else {
                match resolve_class(m, t, code, handler.catch_type as usize - 1) {
                    Some(catch_class) => instance_of(m, catch_class, Some(pending)),
                    None => {
                        // The link error replaced the pending exception and
                        // is delivered to this handler instead.
                        pending = t.exception.expect("resolver cleared the exception");
                        true
                    }
                }
            };

            if matched {
                t.sp = frame as usize + FRAME_FOOTPRINT;
                t.ip = handler.handler_pc as usize;
                t.code = Some(code);
                t.push_object(Some(pending));
                t.exception = None;
                return Ok(Unwind::Handled);
            }
        }

        if flags & ACC_SYNCHRONIZED != 0 {
            if flags & ACC_STATIC != 0 {
                m.release(t.id, method_class.expect("method without a class"));
            } else if let Some(receiver) = t.peek_object(t.frame_base(frame)) {
                m.release(t.id, receiver);
            }
        }

        t.frame = t.frame_next(frame);
    }

    Ok(Unwind::Uncaught)
}

/// Render an uncaught exception chain in the report format:
/// `<class>: <message>` (no colon without a message), one `  at` line per
/// trace element, each cause prefixed with `caused by: `.
pub fn format_uncaught(m: &Machine, exception: Obj) -> String {
    let mut out = String::new();
    let mut next = Some(exception);
    let mut first = true;

    while let Some(e) = next {
        if !first {
            out.push_str("caused by: ");
        }
        first = false;

        let class = m.class_of(e);
        out.push_str(&m.heap.class(class).name);

        let (message, trace, cause) = match m.heap.get(e) {
            Cell::Throwable(throwable) => (
                throwable.message.clone(),
                throwable.trace.clone(),
                throwable.cause,
            ),
            _ => (None, Vec::new(), None),
        };

        if let Some(message) = message {
            out.push_str(": ");
            out.push_str(&message);
        }
        out.push('\n');

        for element in &trace {
            let method = m.heap.method(element.method);
            let class_name = method
                .class
                .map(|c| m.heap.class(c).name.as_str())
                .unwrap_or("?");
            out.push_str("  at ");
            out.push_str(class_name);
            out.push('.');
            out.push_str(&method.name);
            out.push(' ');

            if method.flags & ACC_NATIVE != 0 {
                out.push_str("(native)\n");
            } else {
                let line = match method.code {
                    MethodCode::Bytecode(c) => line_for(
                        &m.heap.code(c).line_numbers,
                        element.ip.saturating_sub(1),
                    ),
                    _ => None,
                };
                match line {
                    Some(line) => {
                        out.push_str(&format!("(line {line})\n"));
                    }
                    None => out.push_str("(unknown line)\n"),
                }
            }
        }

        next = cause;
    }

    out
}

/// Invoke a method by name: the launcher-facing entry point.
///
/// Pushes the receiver (if any) and the arguments according to the method
/// spec, resolves the class and method, and runs to completion. Primitive
/// results come back boxed; a `None` result with a pending exception on
/// the thread means the run failed.
pub fn run_method(
    m: &mut Machine,
    t: &mut Thread,
    class_name: &str,
    method_name: &str,
    method_spec: &str,
    this: Option<Obj>,
    args: &[Arg],
) -> VmResult<Option<Obj>> {
    let descriptor = MethodDescriptor::parse(method_spec)
        .map_err(|e| VmError::Internal(format!("launch spec: {e}")))?;
    if args.len() != descriptor.parameter_count() {
        return Err(VmError::Internal(format!(
            "{} arguments for {method_spec}",
            args.len()
        )));
    }

    if t.sp + descriptor.parameter_footprint() + 1 > t.stack.len() {
        m.throw_stack_overflow(t);
        return Ok(None);
    }

    if let Some(o) = this {
        t.push_object(Some(o));
    }
    for (kind, arg) in descriptor.params.iter().zip(args) {
        match (kind, arg) {
            (FieldKind::Object, Arg::Object(o)) => t.push_object(*o),
            (FieldKind::Long | FieldKind::Double, Arg::Long(v)) => t.push_long(*v),
            (
                FieldKind::Byte
                | FieldKind::Boolean
                | FieldKind::Char
                | FieldKind::Short
                | FieldKind::Int
                | FieldKind::Float,
                Arg::Int(v),
            ) => t.push_int(*v),
            (kind, arg) => {
                return Err(VmError::Internal(format!(
                    "argument {arg:?} does not fit a {kind:?} parameter"
                )))
            }
        }
    }

    'setup: {
        let Some(class) = resolve_class_by_name(m, t, class_name) else {
            break 'setup;
        };
        let Some(method) = find_method_in_class(m, class, method_name, method_spec) else {
            m.throw_no_such_method(
                t,
                format!("{method_name} {method_spec} not found in {class_name}"),
            );
            break 'setup;
        };

        let flags = m.heap.method(method).flags;
        debug_assert_eq!(flags & ACC_STATIC != 0, this.is_none());

        if flags & ACC_NATIVE != 0 {
            let return_code = invoke_native(m, t, method)?;
            if t.exception.is_none() {
                return Ok(match return_code {
                    FieldKind::Byte
                    | FieldKind::Boolean
                    | FieldKind::Char
                    | FieldKind::Short
                    | FieldKind::Float
                    | FieldKind::Int => {
                        let v = t.pop_int();
                        Some(m.heap.alloc(Cell::Int(v)))
                    }
                    FieldKind::Long | FieldKind::Double => {
                        let v = t.pop_long();
                        Some(m.heap.alloc(Cell::Long(v)))
                    }
                    FieldKind::Object => t.pop_object(),
                    FieldKind::Void => None,
                });
            }
        } else {
            check_stack(m, t, method);
            if t.exception.is_none() {
                push_frame(m, t, method);
            }
        }
    }

    run(m, t)
}

/// Run a class's `main(String[])`: the machine-level driver.
///
/// Returns the process exit code: `-1` when an exception remained
/// unhandled, `0` otherwise.
pub fn run_main(
    m: &mut Machine,
    t: &mut Thread,
    class_name: &str,
    args: &[&str],
) -> VmResult<i32> {
    m.enter(t, RunState::Active);

    if let Some(array) = m.make_object_array(t, Some(m.intrinsics.string), args.len()) {
        for (i, arg) in args.iter().enumerate() {
            let s = m.make_string(*arg);
            m.heap.object_array_mut(array).data[i] = Some(s);
        }
        run_method(
            m,
            t,
            class_name,
            "main",
            "([Ljava/lang/String;)V",
            None,
            &[Arg::Object(Some(array))],
        )?;
    }

    Ok(if t.exception.is_some() { -1 } else { 0 })
}
