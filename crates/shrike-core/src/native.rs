//! Native method bridge
//!
//! A native method starts life with a symbol name in its code slot. The
//! first invocation binds it: the machine's library chain is searched in
//! order, then the builtin table, and the winning binding is memoized into
//! the method (the one mutation a method ever sees). Binding derives an
//! argument-type descriptor from the method spec; invocation marshals
//! argument words from the caller's frame and dispatches either directly
//! (builtins, which never leave the Active state) or through the host's
//! C-ABI caller (foreign calls, bracketed by an Idle transition so the
//! collector may run while the call is out).

use crate::gc::Obj;
use crate::machine::{Machine, RunState};
use crate::object::MethodCode;
use crate::stack::{pop_frame, push_frame, Thread};
use crate::{VmError, VmResult};
use shrike_bytecode::flags::ACC_STATIC;
use shrike_bytecode::{FfiType, FieldKind, MethodDescriptor};

const BYTES_PER_WORD: usize = std::mem::size_of::<usize>();

/// A builtin native function.
///
/// Builtins run inside the VM: they receive the machine and thread
/// directly, plus the marshaled arguments. The returned word is
/// interpreted by the method's return type (references return their
/// encoded handle bits).
pub type BuiltinFn = fn(&mut Machine, &mut Thread, &NativeArgs<'_>) -> u64;

/// The bound target of a native method.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeFunction {
    /// An internal function from the builtin table.
    Builtin(BuiltinFn),
    /// A foreign function address from the library chain.
    Foreign(usize),
}

/// Memoized binding of a native method.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeData {
    /// The call target.
    pub function: NativeFunction,
    /// Size of the marshaled argument table, in bytes.
    pub argument_table_size: usize,
    /// Return type driving the result push.
    pub return_code: FieldKind,
    /// Builtin calls skip the Idle transition.
    pub builtin: bool,
    /// Per-argument FFI type codes. Slot 0 is always `Pointer` (the thread
    /// handle); slot 1 is `Pointer` for the receiver of instance methods.
    pub parameter_types: Vec<FfiType>,
}

/// Marshaled arguments handed to a builtin.
///
/// Index 0 is the thread word; declared arguments (receiver first for
/// instance methods) start at index 1.
pub struct NativeArgs<'a> {
    words: &'a [u64],
    types: &'a [FfiType],
    objects: &'a [Option<Obj>],
}

impl<'a> NativeArgs<'a> {
    fn new(words: &'a [u64], types: &'a [FfiType], objects: &'a [Option<Obj>]) -> Self {
        Self {
            words,
            types,
            objects,
        }
    }

    /// Number of argument words, the thread word included.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Whether only the thread word is present.
    pub fn is_empty(&self) -> bool {
        self.words.len() <= 1
    }

    /// The FFI type of argument `i`.
    pub fn ffi_type(&self, i: usize) -> FfiType {
        self.types[i]
    }

    /// Raw argument word `i`.
    pub fn word(&self, i: usize) -> u64 {
        self.words[i]
    }

    /// Argument `i` as a 32-bit integer.
    pub fn int(&self, i: usize) -> i32 {
        self.words[i] as u32 as i32
    }

    /// Argument `i` as a 64-bit integer.
    pub fn long(&self, i: usize) -> i64 {
        self.words[i] as i64
    }

    /// Argument `i` as a float (bit pattern in the low word).
    pub fn float(&self, i: usize) -> f32 {
        f32::from_bits(self.words[i] as u32)
    }

    /// Argument `i` as a double.
    pub fn double(&self, i: usize) -> f64 {
        f64::from_bits(self.words[i])
    }

    /// Argument `i` as a reference. The handle was captured from the
    /// pinned stack slot at marshal time.
    pub fn object(&self, i: usize) -> Option<Obj> {
        self.objects[i]
    }
}

#[inline]
fn pad(n: usize) -> usize {
    (n + BYTES_PER_WORD - 1) & !(BYTES_PER_WORD - 1)
}

/// Derive the argument-type descriptor for a native method and build its
/// binding data.
fn make_native_method_data(
    m: &mut Machine,
    method: Obj,
    function: NativeFunction,
    builtin: bool,
) -> VmResult<Obj> {
    let (flags, spec) = {
        let mm = m.heap.method(method);
        (mm.flags, mm.spec.clone())
    };
    let descriptor = MethodDescriptor::parse(&spec)
        .map_err(|e| VmError::Internal(format!("native method spec: {e}")))?;

    let mut parameter_types = Vec::with_capacity(descriptor.parameter_count() + 2);
    let mut argument_table_size = BYTES_PER_WORD;

    parameter_types.push(FfiType::Pointer);
    if flags & ACC_STATIC == 0 {
        parameter_types.push(FfiType::Pointer);
        argument_table_size += BYTES_PER_WORD;
    }

    for &kind in &descriptor.params {
        parameter_types.push(kind.ffi_type());
        argument_table_size += match kind {
            FieldKind::Object => BYTES_PER_WORD,
            _ => pad(kind.size_bytes()),
        };
    }

    Ok(m.heap.alloc(crate::object::Cell::NativeData(NativeData {
        function,
        argument_table_size,
        return_code: descriptor.ret,
        builtin,
        parameter_types,
    })))
}

/// Bind a native method on first use, memoizing the binding into the
/// method's code slot.
///
/// Returns `None` with `UnsatisfiedLinkError` pending when neither the
/// library chain nor the builtin table resolves the symbol.
fn resolve_native_data(
    m: &mut Machine,
    t: &mut Thread,
    method: Obj,
) -> VmResult<Option<Obj>> {
    let symbol = match &m.heap.method(method).code {
        MethodCode::NativeBound(data) => return Ok(Some(*data)),
        MethodCode::NativeName(symbol) => symbol.clone(),
        other => {
            return Err(VmError::Internal(format!(
                "native invocation of a method with {other:?} code"
            )))
        }
    };

    let binding = match m.resolve_symbol(&symbol) {
        Some(address) => Some((NativeFunction::Foreign(address), false)),
        None => m
            .builtin(&symbol)
            .map(|f| (NativeFunction::Builtin(f), true)),
    };

    match binding {
        Some((function, builtin)) => {
            let depth = t.pin(method);
            let data = make_native_method_data(m, method, function, builtin)?;
            m.heap.method_mut(method).code = MethodCode::NativeBound(data);
            t.unpin_to(depth);
            Ok(Some(data))
        }
        None => {
            m.throw_unsatisfied_link(t, &symbol);
            Ok(None)
        }
    }
}

/// Invoke a native method.
///
/// Arguments were pushed by the caller; a frame is pushed around the call
/// so the arguments stay rooted, and the frame's base is where marshaling
/// reads them. Primitives are copied by value; object parameters pass the
/// address of their pinned stack slot. The return word is pushed according
/// to the method's return type. Returns the return code, `Void` when the
/// invocation raised.
pub fn invoke_native(m: &mut Machine, t: &mut Thread, method: Obj) -> VmResult<FieldKind> {
    let depth = t.pin(method);
    let data_obj = match resolve_native_data(m, t, method)? {
        Some(data) => data,
        None => {
            t.unpin_to(depth);
            return Ok(FieldKind::Void);
        }
    };

    push_frame(m, t, method);

    let data = m.heap.native_data(data_obj).clone();
    let count = m.heap.method(method).parameter_count;

    let mut args: Vec<u64> = Vec::with_capacity(count + 1);
    let mut objects: Vec<Option<Obj>> = Vec::with_capacity(count + 1);
    args.push(t as *mut Thread as u64);
    objects.push(None);

    let mut sp = t.frame_base(t.frame);
    for i in 0..count {
        match data.parameter_types[i + 1] {
            FfiType::Int8 | FfiType::Int16 | FfiType::Int32 | FfiType::Float => {
                args.push(t.peek_int(sp) as u32 as u64);
                objects.push(None);
                sp += 1;
            }
            FfiType::Int64 | FfiType::Double => {
                args.push(t.peek_long(sp) as u64);
                objects.push(None);
                sp += 2;
            }
            FfiType::Pointer => {
                args.push(&t.stack[sp].bits as *const u64 as u64);
                objects.push(t.peek_object(sp));
                sp += 1;
            }
            FfiType::Void => {
                return Err(VmError::Internal("void native parameter".to_string()))
            }
        }
    }

    if log::log_enabled!(log::Level::Debug) {
        let mm = m.heap.method(method);
        let class = mm.class.map(|c| m.heap.class(c).name.clone());
        log::debug!(
            "invoke native method {}.{}",
            class.as_deref().unwrap_or("?"),
            mm.name
        );
    }

    let old_state = t.state.load();
    if !data.builtin {
        m.enter(t, RunState::Idle);
    }

    let result = match data.function {
        NativeFunction::Builtin(f) => {
            let native_args = NativeArgs::new(&args, &data.parameter_types, &objects);
            f(m, t, &native_args)
        }
        NativeFunction::Foreign(address) => m.host_call(
            address,
            &args,
            &data.parameter_types,
            data.argument_table_size,
            data.return_code.ffi_type(),
        )?,
    };

    if !data.builtin {
        m.enter(t, old_state);
    }

    log::debug!("return from native method");

    pop_frame(m, t);
    t.unpin_to(depth);

    if t.exception.is_some() {
        return Ok(FieldKind::Void);
    }

    match data.return_code {
        FieldKind::Byte
        | FieldKind::Boolean
        | FieldKind::Char
        | FieldKind::Short
        | FieldKind::Float
        | FieldKind::Int => t.push_int(result as u32 as i32),
        FieldKind::Long | FieldKind::Double => t.push_long(result as i64),
        FieldKind::Object => {
            let o = match data.function {
                NativeFunction::Builtin(_) => Obj::from_bits(result),
                NativeFunction::Foreign(_) => {
                    if result == 0 {
                        None
                    } else {
                        // SAFETY: a foreign object result is the address of
                        // a slot whose referent stayed pinned for the
                        // duration of the call.
                        Obj::from_bits(unsafe { *(result as *const u64) })
                    }
                }
            };
            t.push_object(o);
        }
        FieldKind::Void => {}
    }

    Ok(data.return_code)
}
