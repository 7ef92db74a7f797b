//! The machine: shared VM state threaded through every operation
//!
//! A [`Machine`] owns the heap, the class registry, the native binding
//! tables, the monitor table, and the weak-reference registry. External
//! collaborators plug in through traits: [`ClassFinder`] supplies classes
//! by name, [`Library`] resolves native symbols, and [`HostCall`] performs
//! the C-ABI call for foreign functions.

use crate::gc::{Heap, Obj};
use crate::object::{Cell, Class, Instance, ObjectArray, Throwable, TraceElement};
use crate::stack::Thread;
use crate::sync::MonitorTable;
use crate::value::Slot;
use crate::{VmError, VmResult};
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use shrike_bytecode::flags::VM_WEAK_REFERENCE;
use shrike_bytecode::tables::{
    T_BOOLEAN, T_BYTE, T_CHAR, T_DOUBLE, T_FLOAT, T_INT, T_LONG, T_SHORT,
};
use shrike_bytecode::FfiType;

/// Default operand/locals stack capacity, in slots.
pub const DEFAULT_STACK_SLOTS: usize = 64 * 1024;

/// Thread run states for safepoint cooperation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Executing guest code; the collector must wait for this thread.
    Active,
    /// Not touching the heap (blocked, or inside foreign code); the
    /// collector may proceed without it.
    Idle,
    /// Holding the machine exclusively (a stop-the-world caller).
    Exclusive,
    /// Terminated.
    Zombie,
}

/// Machine construction options.
#[derive(Debug, Clone)]
pub struct MachineOptions {
    /// Stack capacity per thread, in slots.
    pub stack_slots: usize,
    /// Soft heap limit in cells; `None` is unbounded.
    pub heap_limit: Option<usize>,
}

impl Default for MachineOptions {
    fn default() -> Self {
        Self {
            stack_slots: DEFAULT_STACK_SLOTS,
            heap_limit: None,
        }
    }
}

/// Supplies classes by binary name.
///
/// The finder parses and links class files into heap cells; the core only
/// consumes the result. Returning `None` raises `NoClassDefFoundError` at
/// the resolution site.
pub trait ClassFinder {
    /// Build (or look up) the named class inside `m`'s heap.
    fn find(&self, m: &mut Machine, name: &str) -> Option<Obj>;
}

/// One dynamic library in the machine's search chain.
pub trait Library {
    /// Resolve a native symbol to a raw function address.
    fn resolve(&self, symbol: &str) -> Option<usize>;
}

/// Performs the C-ABI call for foreign native methods.
///
/// `args` are the marshaled argument words, described one-to-one by
/// `types`; `size_bytes` is the argument table size. The return value is
/// widened into a `u64` regardless of the declared return type.
pub trait HostCall {
    /// Call `function` with the marshaled arguments.
    fn call(
        &self,
        function: usize,
        args: &[u64],
        types: &[FfiType],
        size_bytes: usize,
        return_type: FfiType,
    ) -> u64;
}

/// Handles of the bootstrap classes the core itself instantiates.
#[derive(Debug, Clone, Copy)]
pub struct Intrinsics {
    /// `java/lang/Object`
    pub object: Obj,
    /// `java/lang/String`
    pub string: Obj,
    /// `java/lang/Throwable`
    pub throwable: Obj,
    /// `java/lang/Exception`
    pub exception: Obj,
    /// `java/lang/RuntimeException`
    pub runtime_exception: Obj,
    /// `java/lang/Error`
    pub error: Obj,
    /// `java/lang/NullPointerException`
    pub null_pointer: Obj,
    /// `java/lang/ArrayIndexOutOfBoundsException`
    pub array_index: Obj,
    /// `java/lang/NegativeArraySizeException`
    pub negative_array_size: Obj,
    /// `java/lang/ClassCastException`
    pub class_cast: Obj,
    /// `java/lang/ArithmeticException`
    pub arithmetic: Obj,
    /// `java/lang/StackOverflowError`
    pub stack_overflow: Obj,
    /// `java/lang/OutOfMemoryError`
    pub out_of_memory: Obj,
    /// `java/lang/NoSuchFieldError`
    pub no_such_field: Obj,
    /// `java/lang/NoSuchMethodError`
    pub no_such_method: Obj,
    /// `java/lang/UnsatisfiedLinkError`
    pub unsatisfied_link: Obj,
    /// `java/lang/NoClassDefFoundError`
    pub no_class_def: Obj,
}

struct Safepoint {
    exclusive: Mutex<Option<u64>>,
    changed: Condvar,
}

/// Shared VM state.
pub struct Machine {
    /// The cell arena.
    pub heap: Heap,
    /// Bootstrap class handles.
    pub intrinsics: Intrinsics,
    /// Construction options.
    pub options: MachineOptions,
    classes: FxHashMap<String, Obj>,
    finder: Option<Box<dyn ClassFinder>>,
    builtins: FxHashMap<String, crate::native::BuiltinFn>,
    libraries: Vec<Box<dyn Library>>,
    host: Option<Box<dyn HostCall>>,
    monitors: MonitorTable,
    weak_references: Mutex<Vec<Obj>>,
    safepoint: Safepoint,
}

impl Machine {
    /// Create a machine and seed the bootstrap classes.
    pub fn new(options: MachineOptions) -> Self {
        let mut heap = Heap::new(options.heap_limit);
        let mut classes = FxHashMap::default();
        let intrinsics = bootstrap(&mut heap, &mut classes);

        Self {
            heap,
            intrinsics,
            options,
            classes,
            finder: None,
            builtins: FxHashMap::default(),
            libraries: Vec::new(),
            host: None,
            monitors: MonitorTable::new(),
            weak_references: Mutex::new(Vec::new()),
            safepoint: Safepoint {
                exclusive: Mutex::new(None),
                changed: Condvar::new(),
            },
        }
    }

    /// Create a thread sized to this machine's options.
    pub fn spawn_thread(&self) -> Thread {
        Thread::new(self.options.stack_slots)
    }

    // ========================================================================
    // Class registry
    // ========================================================================

    /// Install the class finder.
    pub fn set_finder(&mut self, finder: Box<dyn ClassFinder>) {
        self.finder = Some(finder);
    }

    /// Register a loaded class under its binary name.
    pub fn register_class(&mut self, name: impl Into<String>, class: Obj) {
        self.classes.insert(name.into(), class);
    }

    /// Look up an already-registered class.
    pub fn lookup_class(&self, name: &str) -> Option<Obj> {
        self.classes.get(name).copied()
    }

    pub(crate) fn take_finder(&mut self) -> Option<Box<dyn ClassFinder>> {
        self.finder.take()
    }

    pub(crate) fn put_finder(&mut self, finder: Option<Box<dyn ClassFinder>>) {
        self.finder = finder;
    }

    /// Visit the machine's strong roots (the class registry). Weak
    /// references are deliberately absent.
    pub fn visit_roots<F>(&self, mut visitor: F)
    where
        F: FnMut(Obj),
    {
        for &class in self.classes.values() {
            visitor(class);
        }
    }

    // ========================================================================
    // Native binding tables
    // ========================================================================

    /// Register a builtin native function under its symbol name.
    pub fn register_builtin(&mut self, symbol: impl Into<String>, f: crate::native::BuiltinFn) {
        self.builtins.insert(symbol.into(), f);
    }

    /// Look up a builtin by symbol.
    pub fn builtin(&self, symbol: &str) -> Option<crate::native::BuiltinFn> {
        self.builtins.get(symbol).copied()
    }

    /// Append a library to the symbol search chain. Libraries are searched
    /// in insertion order, before the builtin table.
    pub fn add_library(&mut self, library: Box<dyn Library>) {
        self.libraries.push(library);
    }

    /// Resolve a symbol through the library chain.
    pub fn resolve_symbol(&self, symbol: &str) -> Option<usize> {
        self.libraries.iter().find_map(|lib| lib.resolve(symbol))
    }

    /// Install the host C-ABI caller.
    pub fn set_host(&mut self, host: Box<dyn HostCall>) {
        self.host = Some(host);
    }

    /// Dispatch a foreign call through the host caller.
    pub fn host_call(
        &self,
        function: usize,
        args: &[u64],
        types: &[FfiType],
        size_bytes: usize,
        return_type: FfiType,
    ) -> VmResult<u64> {
        match &self.host {
            Some(host) => Ok(host.call(function, args, types, size_bytes, return_type)),
            None => Err(VmError::Internal(
                "foreign native call without a host call interface".to_string(),
            )),
        }
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate a zeroed instance of `class`.
    ///
    /// Instances of weak-reference classes are linked into the
    /// weak-reference registry before they become visible. Returns `None`
    /// with `OutOfMemoryError` pending when the heap limit is exhausted.
    pub fn make_instance(&mut self, t: &mut Thread, class: Obj) -> Option<Obj> {
        if self.heap.exhausted() {
            self.throw_out_of_memory(t);
            return None;
        }
        let depth = t.pin(class);
        let size = self.heap.class(class).instance_size;
        let instance = self.heap.alloc(Cell::Instance(Instance {
            class,
            fields: vec![Slot::zero(); size],
        }));
        if self.heap.class(class).vm_flags & VM_WEAK_REFERENCE != 0 {
            self.register_weak_reference(instance);
        }
        t.unpin_to(depth);
        Some(instance)
    }

    /// Allocate a null-initialized object array.
    pub fn make_object_array(
        &mut self,
        t: &mut Thread,
        class: Option<Obj>,
        count: usize,
    ) -> Option<Obj> {
        if self.heap.exhausted() {
            self.throw_out_of_memory(t);
            return None;
        }
        Some(self.heap.alloc(Cell::ObjectArray(ObjectArray {
            class,
            data: vec![None; count],
        })))
    }

    /// Allocate a zeroed primitive array for a `newarray` type code.
    pub fn make_primitive_array(
        &mut self,
        t: &mut Thread,
        ty: u8,
        count: usize,
    ) -> VmResult<Option<Obj>> {
        if self.heap.exhausted() {
            self.throw_out_of_memory(t);
            return Ok(None);
        }
        let cell = match ty {
            T_BOOLEAN | T_BYTE => Cell::ByteArray(vec![0; count]),
            T_CHAR => Cell::CharArray(vec![0; count]),
            T_SHORT => Cell::ShortArray(vec![0; count]),
            T_INT => Cell::IntArray(vec![0; count]),
            T_LONG => Cell::LongArray(vec![0; count]),
            T_FLOAT => Cell::FloatArray(vec![0.0; count]),
            T_DOUBLE => Cell::DoubleArray(vec![0.0; count]),
            _ => return Err(VmError::Internal(format!("unknown array type code {ty}"))),
        };
        Ok(Some(self.heap.alloc(cell)))
    }

    /// Allocate a string cell.
    pub fn make_string(&mut self, s: impl Into<String>) -> Obj {
        self.heap.alloc(Cell::Str(s.into()))
    }

    /// The class of any heap object, falling back to the root class for
    /// cells with no guest-visible class of their own.
    pub fn class_of(&self, o: Obj) -> Obj {
        match self.heap.get(o) {
            Cell::Instance(i) => i.class,
            Cell::Throwable(e) => e.class,
            Cell::Str(_) => self.intrinsics.string,
            _ => self.intrinsics.object,
        }
    }

    // ========================================================================
    // Throwables
    // ========================================================================

    /// Build a throwable of `class`, capturing the thread's frame chain.
    pub fn make_throwable(
        &mut self,
        t: &Thread,
        class: Obj,
        message: Option<String>,
    ) -> Obj {
        let trace = self.capture_trace(t);
        self.heap.alloc(Cell::Throwable(Throwable {
            class,
            message,
            trace,
            cause: None,
        }))
    }

    fn capture_trace(&self, t: &Thread) -> Vec<TraceElement> {
        let mut trace = Vec::new();
        let mut frame = t.frame;
        let mut top = true;
        while frame >= 0 {
            let method = t.frame_method(frame);
            let ip = if top { t.ip } else { t.frame_ip(frame) };
            trace.push(TraceElement { method, ip });
            top = false;
            frame = t.frame_next(frame);
        }
        trace
    }

    fn throw_with(&mut self, t: &mut Thread, class: Obj, message: Option<String>) {
        let e = self.make_throwable(t, class, message);
        t.exception = Some(e);
    }

    /// Raise `NullPointerException`.
    pub fn throw_null_pointer(&mut self, t: &mut Thread) {
        let class = self.intrinsics.null_pointer;
        self.throw_with(t, class, None);
    }

    /// Raise `ArrayIndexOutOfBoundsException` with the canonical message.
    pub fn throw_array_index(&mut self, t: &mut Thread, index: i32, length: usize) {
        let class = self.intrinsics.array_index;
        self.throw_with(t, class, Some(format!("{index} not in [0,{length}]")));
    }

    /// Raise `NegativeArraySizeException` carrying the requested count.
    pub fn throw_negative_array_size(&mut self, t: &mut Thread, count: i32) {
        let class = self.intrinsics.negative_array_size;
        self.throw_with(t, class, Some(format!("{count}")));
    }

    /// Raise `ClassCastException` with the canonical message.
    pub fn throw_class_cast(&mut self, t: &mut Thread, actual: &str, target: &str) {
        let class = self.intrinsics.class_cast;
        self.throw_with(t, class, Some(format!("{actual} as {target}")));
    }

    /// Raise `ArithmeticException` for integer division by zero.
    pub fn throw_arithmetic(&mut self, t: &mut Thread) {
        let class = self.intrinsics.arithmetic;
        self.throw_with(t, class, Some("/ by zero".to_string()));
    }

    /// Raise `StackOverflowError`.
    pub fn throw_stack_overflow(&mut self, t: &mut Thread) {
        let class = self.intrinsics.stack_overflow;
        self.throw_with(t, class, None);
    }

    /// Raise `OutOfMemoryError`.
    pub fn throw_out_of_memory(&mut self, t: &mut Thread) {
        let class = self.intrinsics.out_of_memory;
        self.throw_with(t, class, None);
    }

    /// Raise `NoSuchFieldError` with a prebuilt message.
    pub fn throw_no_such_field(&mut self, t: &mut Thread, message: String) {
        let class = self.intrinsics.no_such_field;
        self.throw_with(t, class, Some(message));
    }

    /// Raise `NoSuchMethodError` with a prebuilt message.
    pub fn throw_no_such_method(&mut self, t: &mut Thread, message: String) {
        let class = self.intrinsics.no_such_method;
        self.throw_with(t, class, Some(message));
    }

    /// Raise `UnsatisfiedLinkError`; the message is the unresolved symbol.
    pub fn throw_unsatisfied_link(&mut self, t: &mut Thread, symbol: &str) {
        let class = self.intrinsics.unsatisfied_link;
        self.throw_with(t, class, Some(symbol.to_string()));
    }

    /// Raise `NoClassDefFoundError`; the message is the missing class name.
    pub fn throw_no_class_def(&mut self, t: &mut Thread, name: &str) {
        let class = self.intrinsics.no_class_def;
        self.throw_with(t, class, Some(name.to_string()));
    }

    // ========================================================================
    // Monitors
    // ========================================================================

    /// Acquire the monitor of `o` for thread `thread`.
    pub fn acquire(&self, thread: u64, o: Obj) {
        self.monitors.acquire(thread, o);
    }

    /// Release one entry of the monitor of `o`.
    pub fn release(&self, thread: u64, o: Obj) {
        if !self.monitors.release(thread, o) {
            log::warn!("monitor release by non-owner thread {thread}");
        }
    }

    /// The thread's entry count on the monitor of `o`.
    pub fn monitor_entry_count(&self, thread: u64, o: Obj) -> u32 {
        self.monitors.entry_count(thread, o)
    }

    // ========================================================================
    // Weak references
    // ========================================================================

    /// Link a weak-reference instance into the registry. Called at
    /// allocation time, under the registry lock.
    pub fn register_weak_reference(&self, o: Obj) {
        self.weak_references.lock().push(o);
    }

    /// Head of the weak-reference registry: the most recently linked
    /// instance.
    pub fn weak_reference_head(&self) -> Option<Obj> {
        self.weak_references.lock().last().copied()
    }

    /// Snapshot of the registry, head first, for the collector's clearing
    /// pass.
    pub fn weak_reference_list(&self) -> Vec<Obj> {
        let list = self.weak_references.lock();
        list.iter().rev().copied().collect()
    }

    // ========================================================================
    // Safepoint cooperation
    // ========================================================================

    /// Transition a thread's run state.
    ///
    /// This is the sole interaction with the surrounding scheduler: going
    /// `Active` blocks while another thread holds the machine exclusively,
    /// and going `Idle` publishes the thread's stack to a stop-the-world
    /// caller. An exclusive holder re-entering `Active` releases the
    /// machine.
    pub fn enter(&self, t: &Thread, state: RunState) {
        match state {
            RunState::Active => {
                let mut exclusive = self.safepoint.exclusive.lock();
                if *exclusive == Some(t.id) {
                    *exclusive = None;
                    self.safepoint.changed.notify_all();
                } else {
                    while exclusive.is_some() {
                        self.safepoint.changed.wait(&mut exclusive);
                    }
                }
                t.state.store(RunState::Active);
            }
            RunState::Exclusive => {
                let mut exclusive = self.safepoint.exclusive.lock();
                while exclusive.is_some() {
                    self.safepoint.changed.wait(&mut exclusive);
                }
                *exclusive = Some(t.id);
                t.state.store(RunState::Exclusive);
            }
            RunState::Idle | RunState::Zombie => {
                t.state.store(state);
                self.safepoint.changed.notify_all();
            }
        }
    }
}

fn bootstrap(heap: &mut Heap, classes: &mut FxHashMap<String, Obj>) -> Intrinsics {
    fn define(
        heap: &mut Heap,
        classes: &mut FxHashMap<String, Obj>,
        name: &str,
        super_class: Option<Obj>,
    ) -> Obj {
        let class = heap.alloc(Cell::Class(Class {
            flags: shrike_bytecode::flags::ACC_PUBLIC,
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
        classes.insert(name.to_string(), class);
        class
    }

    let object = define(heap, classes, "java/lang/Object", None);
    let string = define(heap, classes, "java/lang/String", Some(object));
    let throwable = define(heap, classes, "java/lang/Throwable", Some(object));

    let exception = define(heap, classes, "java/lang/Exception", Some(throwable));
    let runtime_exception = define(
        heap,
        classes,
        "java/lang/RuntimeException",
        Some(exception),
    );
    let null_pointer = define(
        heap,
        classes,
        "java/lang/NullPointerException",
        Some(runtime_exception),
    );
    let index_out_of_bounds = define(
        heap,
        classes,
        "java/lang/IndexOutOfBoundsException",
        Some(runtime_exception),
    );
    let array_index = define(
        heap,
        classes,
        "java/lang/ArrayIndexOutOfBoundsException",
        Some(index_out_of_bounds),
    );
    let negative_array_size = define(
        heap,
        classes,
        "java/lang/NegativeArraySizeException",
        Some(runtime_exception),
    );
    let class_cast = define(
        heap,
        classes,
        "java/lang/ClassCastException",
        Some(runtime_exception),
    );
    let arithmetic = define(
        heap,
        classes,
        "java/lang/ArithmeticException",
        Some(runtime_exception),
    );

    let error = define(heap, classes, "java/lang/Error", Some(throwable));
    let vm_error = define(heap, classes, "java/lang/VirtualMachineError", Some(error));
    let stack_overflow = define(
        heap,
        classes,
        "java/lang/StackOverflowError",
        Some(vm_error),
    );
    let out_of_memory = define(heap, classes, "java/lang/OutOfMemoryError", Some(vm_error));

    let linkage_error = define(heap, classes, "java/lang/LinkageError", Some(error));
    let no_class_def = define(
        heap,
        classes,
        "java/lang/NoClassDefFoundError",
        Some(linkage_error),
    );
    let no_such_field = define(
        heap,
        classes,
        "java/lang/NoSuchFieldError",
        Some(linkage_error),
    );
    let no_such_method = define(
        heap,
        classes,
        "java/lang/NoSuchMethodError",
        Some(linkage_error),
    );
    let unsatisfied_link = define(
        heap,
        classes,
        "java/lang/UnsatisfiedLinkError",
        Some(linkage_error),
    );

    Intrinsics {
        object,
        string,
        throwable,
        exception,
        runtime_exception,
        error,
        null_pointer,
        array_index,
        negative_array_size,
        class_cast,
        arithmetic,
        stack_overflow,
        out_of_memory,
        no_such_field,
        no_such_method,
        unsatisfied_link,
        no_class_def,
    }
}
