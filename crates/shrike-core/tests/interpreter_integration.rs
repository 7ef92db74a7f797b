//! End-to-end interpreter scenarios: invocation, unwinding, initialization,
//! dispatch, and the native bridge working together.

mod common;

use common::*;
use shrike_bytecode::flags::{
    ACC_INTERFACE, ACC_NATIVE, ACC_STATIC, ACC_SUPER, ACC_SYNCHRONIZED, VM_WEAK_REFERENCE,
};
use shrike_bytecode::{ExceptionHandler, FieldKind, LineNumber, Opcode};
use shrike_core::interp::format_uncaught;
use shrike_core::object::MethodCode;
use shrike_core::{run_main, run_method, Arg, MachineOptions, NativeArgs, Obj};

#[test]
fn test_static_add() {
    let mut m = machine();
    let mut t = m.spawn_thread();

    let object = m.intrinsics.object;
    let adder = define_class(&mut m, "Adder", Some(object), 0);
    let body = vec![
        Opcode::Iload0 as u8,
        Opcode::Iload1 as u8,
        Opcode::Iadd as u8,
        Opcode::Ireturn as u8,
    ];
    let code = code(&mut m, 2, 2, body);
    method(&mut m, adder, "add", "(II)I", ACC_STATIC, MethodCode::Bytecode(code));

    let r = run_method(
        &mut m,
        &mut t,
        "Adder",
        "add",
        "(II)I",
        None,
        &[Arg::Int(3), Arg::Int(4)],
    )
    .unwrap();

    assert_eq!(int_result(&m, r), 7);
    assert_eq!(t.sp, 0);
    assert!(t.exception.is_none());
}

#[test]
fn test_invokestatic() {
    let mut m = machine();
    let mut t = m.spawn_thread();

    let object = m.intrinsics.object;
    let adder = define_class(&mut m, "Adder", Some(object), 0);
    let add_body = vec![
        Opcode::Iload0 as u8,
        Opcode::Iload1 as u8,
        Opcode::Iadd as u8,
        Opcode::Ireturn as u8,
    ];
    let add_code = code(&mut m, 2, 2, add_body);
    method(&mut m, adder, "add", "(II)I", ACC_STATIC, MethodCode::Bytecode(add_code));

    let caller = define_class(&mut m, "Caller", Some(object), 0);
    let add_ref = member_ref(&mut m, "Adder", "add", "(II)I");
    let body = vec![
        Opcode::Iconst3 as u8,
        Opcode::Iconst4 as u8,
        Opcode::Invokestatic as u8,
        0,
        1,
        Opcode::Ireturn as u8,
    ];
    let caller_code = code_full(&mut m, 0, 2, body, vec![add_ref], Vec::new(), Vec::new());
    method(&mut m, caller, "run", "()I", ACC_STATIC, MethodCode::Bytecode(caller_code));

    let r = run_method(&mut m, &mut t, "Caller", "run", "()I", None, &[]).unwrap();
    assert_eq!(int_result(&m, r), 7);
    assert_eq!(t.sp, 0);
}

/// Body of `Main.run`: allocate `new int[2]`, store 10 and 20, then read
/// index 5.
fn out_of_bounds_body(tail: &[u8]) -> Vec<u8> {
    let mut body = vec![
        Opcode::Iconst2 as u8,  // 0
        Opcode::Newarray as u8, // 1
        10,                     // T_INT
        Opcode::Astore0 as u8,  // 3
        Opcode::Aload0 as u8,   // 4
        Opcode::Iconst0 as u8,  // 5
        Opcode::Bipush as u8,   // 6
        10,
        Opcode::Iastore as u8, // 8
        Opcode::Aload0 as u8,  // 9
        Opcode::Iconst1 as u8, // 10
        Opcode::Bipush as u8,  // 11
        20,
        Opcode::Iastore as u8, // 13
        Opcode::Aload0 as u8,  // 14
        Opcode::Iconst5 as u8, // 15
        Opcode::Iaload as u8,  // 16
    ];
    body.extend_from_slice(tail);
    body
}

#[test]
fn test_uncaught_array_bounds_report() {
    let mut m = machine();
    let mut t = m.spawn_thread();

    let object = m.intrinsics.object;
    let main = define_class(&mut m, "Main", Some(object), 0);
    let body = out_of_bounds_body(&[Opcode::Ireturn as u8]);
    let lines = vec![LineNumber { start_pc: 0, line: 3 }];
    let run_code = code_full(&mut m, 1, 3, body, Vec::new(), Vec::new(), lines);
    method(&mut m, main, "run", "()I", ACC_STATIC, MethodCode::Bytecode(run_code));

    let r = run_method(&mut m, &mut t, "Main", "run", "()I", None, &[]).unwrap();
    assert_eq!(r, None);

    let e = t.exception.unwrap();
    assert_eq!(
        format_uncaught(&m, e),
        "java/lang/ArrayIndexOutOfBoundsException: 5 not in [0,2]\n  at Main.run (line 3)\n"
    );
}

#[test]
fn test_run_main_exit_codes() {
    // a main that dies to the array read exits with -1
    let mut m = machine();
    let mut t = m.spawn_thread();

    let object = m.intrinsics.object;
    let main = define_class(&mut m, "Main", Some(object), 0);
    let body = out_of_bounds_body(&[Opcode::Pop as u8, Opcode::Return as u8]);
    let run_code = code(&mut m, 2, 3, body);
    // local 0 is the String[] argument; the body's astore_0 reuses it
    method(
        &mut m,
        main,
        "main",
        "([Ljava/lang/String;)V",
        ACC_STATIC,
        MethodCode::Bytecode(run_code),
    );
    assert_eq!(run_main(&mut m, &mut t, "Main", &["a", "b"]).unwrap(), -1);

    // a clean main exits with 0
    let mut m = machine();
    let mut t = m.spawn_thread();
    let object = m.intrinsics.object;
    let main = define_class(&mut m, "Main", Some(object), 0);
    let ok_code = code(&mut m, 1, 1, vec![Opcode::Return as u8]);
    method(
        &mut m,
        main,
        "main",
        "([Ljava/lang/String;)V",
        ACC_STATIC,
        MethodCode::Bytecode(ok_code),
    );
    assert_eq!(run_main(&mut m, &mut t, "Main", &[]).unwrap(), 0);
}

#[test]
fn test_null_deref_caught_in_caller() {
    let mut m = machine();
    let mut t = m.spawn_thread();

    let object = m.intrinsics.object;
    let callee_class = define_class(&mut m, "Callee", Some(object), 0);
    let x_ref = member_ref(&mut m, "Holder", "x", "I");
    let callee_body = vec![
        Opcode::AconstNull as u8,
        Opcode::Getfield as u8,
        0,
        1,
        Opcode::Ireturn as u8,
    ];
    let callee_code = code_full(&mut m, 0, 1, callee_body, vec![x_ref], Vec::new(), Vec::new());
    method(
        &mut m,
        callee_class,
        "callee",
        "()I",
        ACC_STATIC,
        MethodCode::Bytecode(callee_code),
    );

    let caller_class = define_class(&mut m, "Catcher", Some(object), 0);
    let callee_ref = member_ref(&mut m, "Callee", "callee", "()I");
    let npe_sym = class_sym(&mut m, "java/lang/NullPointerException");
    let caller_body = vec![
        Opcode::Invokestatic as u8, // 0
        0,
        1,
        Opcode::Ireturn as u8, // 3
        Opcode::Pop as u8,     // 4 (handler: drop the exception)
        Opcode::Bipush as u8,  // 5
        7,
        Opcode::Ireturn as u8, // 7
    ];
    let handlers = vec![ExceptionHandler {
        start_pc: 0,
        end_pc: 4,
        handler_pc: 4,
        catch_type: 2,
    }];
    let caller_code = code_full(
        &mut m,
        0,
        1,
        caller_body,
        vec![callee_ref, npe_sym],
        handlers,
        Vec::new(),
    );
    method(
        &mut m,
        caller_class,
        "run",
        "()I",
        ACC_STATIC,
        MethodCode::Bytecode(caller_code),
    );

    let r = run_method(&mut m, &mut t, "Catcher", "run", "()I", None, &[]).unwrap();
    assert_eq!(int_result(&m, r), 7);
    assert!(t.exception.is_none());
    assert_eq!(t.sp, 0);
}

#[test]
fn test_synchronized_method_releases_on_throw() {
    let mut m = machine();
    let mut t = m.spawn_thread();

    let object = m.intrinsics.object;
    let class = define_class(&mut m, "Locked", Some(object), 0);
    let boom_body = vec![Opcode::AconstNull as u8, Opcode::Athrow as u8];
    let boom_code = code(&mut m, 1, 1, boom_body);
    let boom = method(
        &mut m,
        class,
        "boom",
        "()V",
        ACC_SYNCHRONIZED,
        MethodCode::Bytecode(boom_code),
    );
    add_virtual(&mut m, class, boom);

    let receiver = m.make_instance(&mut t, class).unwrap();
    assert_eq!(m.monitor_entry_count(t.id, receiver), 0);

    let r = run_method(
        &mut m,
        &mut t,
        "Locked",
        "boom",
        "()V",
        Some(receiver),
        &[],
    )
    .unwrap();
    assert_eq!(r, None);
    assert_eq!(pending_class(&m, &t), m.intrinsics.null_pointer);

    // the unwinder released the monitor on the exceptional exit path
    assert_eq!(m.monitor_entry_count(t.id, receiver), 0);
}

#[test]
fn test_synchronized_method_normal_return() {
    let mut m = machine();
    let mut t = m.spawn_thread();

    let object = m.intrinsics.object;
    let class = define_class(&mut m, "Locked", Some(object), 0);
    let body = vec![Opcode::Iconst1 as u8, Opcode::Ireturn as u8];
    let ok_code = code(&mut m, 1, 1, body);
    let ok = method(
        &mut m,
        class,
        "ok",
        "()I",
        ACC_SYNCHRONIZED,
        MethodCode::Bytecode(ok_code),
    );
    add_virtual(&mut m, class, ok);

    let receiver = m.make_instance(&mut t, class).unwrap();
    let r = run_method(&mut m, &mut t, "Locked", "ok", "()I", Some(receiver), &[]).unwrap();
    assert_eq!(int_result(&m, r), 1);
    assert_eq!(m.monitor_entry_count(t.id, receiver), 0);
}

#[test]
fn test_clinit_runs_once_before_static_access() {
    let mut m = machine();
    let mut t = m.spawn_thread();

    let object = m.intrinsics.object;
    let k = define_class(&mut m, "K", Some(object), 0);
    m.heap.class_mut(k).static_table = vec![None];
    field(&mut m, k, "x", "I", FieldKind::Int, 0, ACC_STATIC);

    // <clinit>: x = 42
    let clinit_ref = member_ref(&mut m, "K", "x", "I");
    let clinit_body = vec![
        Opcode::Bipush as u8,
        42,
        Opcode::Putstatic as u8,
        0,
        1,
        Opcode::Return as u8,
    ];
    let clinit_code = code_full(&mut m, 0, 1, clinit_body, vec![clinit_ref], Vec::new(), Vec::new());
    let clinit = method(
        &mut m,
        k,
        "<clinit>",
        "()V",
        ACC_STATIC,
        MethodCode::Bytecode(clinit_code),
    );
    m.heap.class_mut(k).initializer = Some(clinit);

    // run(): K.x + K.x
    let user = define_class(&mut m, "User", Some(object), 0);
    let x_ref = member_ref(&mut m, "K", "x", "I");
    let body = vec![
        Opcode::Getstatic as u8,
        0,
        1,
        Opcode::Getstatic as u8,
        0,
        1,
        Opcode::Iadd as u8,
        Opcode::Ireturn as u8,
    ];
    let run_code = code_full(&mut m, 0, 2, body, vec![x_ref], Vec::new(), Vec::new());
    method(&mut m, user, "run", "()I", ACC_STATIC, MethodCode::Bytecode(run_code));

    let r = run_method(&mut m, &mut t, "User", "run", "()I", None, &[]).unwrap();
    assert_eq!(int_result(&m, r), 84);

    // the initializer slot was cleared before it ran; it can never run twice
    assert_eq!(m.heap.class(k).initializer, None);
}

#[test]
fn test_clinit_before_new() {
    let mut m = machine();
    let mut t = m.spawn_thread();

    let object = m.intrinsics.object;
    let k = define_class(&mut m, "K", Some(object), 0);
    m.heap.class_mut(k).static_table = vec![None];
    field(&mut m, k, "x", "I", FieldKind::Int, 0, ACC_STATIC);

    let clinit_ref = member_ref(&mut m, "K", "x", "I");
    let clinit_body = vec![
        Opcode::Bipush as u8,
        9,
        Opcode::Putstatic as u8,
        0,
        1,
        Opcode::Return as u8,
    ];
    let clinit_code = code_full(&mut m, 0, 1, clinit_body, vec![clinit_ref], Vec::new(), Vec::new());
    let clinit = method(
        &mut m,
        k,
        "<clinit>",
        "()V",
        ACC_STATIC,
        MethodCode::Bytecode(clinit_code),
    );
    m.heap.class_mut(k).initializer = Some(clinit);

    let user = define_class(&mut m, "User", Some(object), 0);
    let k_sym = class_sym(&mut m, "K");
    let x_ref = member_ref(&mut m, "K", "x", "I");
    let body = vec![
        Opcode::New as u8,
        0,
        1,
        Opcode::Pop as u8,
        Opcode::Getstatic as u8,
        0,
        2,
        Opcode::Ireturn as u8,
    ];
    let run_code = code_full(&mut m, 0, 1, body, vec![k_sym, x_ref], Vec::new(), Vec::new());
    method(&mut m, user, "run", "()I", ACC_STATIC, MethodCode::Bytecode(run_code));

    let r = run_method(&mut m, &mut t, "User", "run", "()I", None, &[]).unwrap();
    assert_eq!(int_result(&m, r), 9);
    assert_eq!(m.heap.class(k).initializer, None);
}

#[test]
fn test_interface_dispatch() {
    let mut m = machine();
    let mut t = m.spawn_thread();

    let object = m.intrinsics.object;
    let list = define_class(&mut m, "List", Some(object), ACC_INTERFACE);
    method(&mut m, list, "size", "()I", 0, MethodCode::None);

    let array_list = define_class(&mut m, "ArrayList", Some(object), 0);
    let size_body = vec![Opcode::Iconst0 as u8, Opcode::Ireturn as u8];
    let size_code = code(&mut m, 1, 1, size_body);
    let size_impl = method(
        &mut m,
        array_list,
        "size",
        "()I",
        0,
        MethodCode::Bytecode(size_code),
    );
    add_virtual(&mut m, array_list, size_impl);
    m.heap
        .class_mut(array_list)
        .interface_table
        .push((list, vec![size_impl]));

    let caller = define_class(&mut m, "Caller", Some(object), 0);
    let size_ref = member_ref(&mut m, "List", "size", "()I");
    let body = vec![
        Opcode::Aload0 as u8,
        Opcode::Invokeinterface as u8,
        0,
        1,
        1, // count byte, read and discarded
        0, // zero byte, read and discarded
        Opcode::Ireturn as u8,
    ];
    let caller_code = code_full(&mut m, 1, 1, body, vec![size_ref], Vec::new(), Vec::new());
    method(
        &mut m,
        caller,
        "run",
        "(LList;)I",
        ACC_STATIC,
        MethodCode::Bytecode(caller_code),
    );

    let receiver = m.make_instance(&mut t, array_list).unwrap();
    let r = run_method(
        &mut m,
        &mut t,
        "Caller",
        "run",
        "(LList;)I",
        None,
        &[Arg::Object(Some(receiver))],
    )
    .unwrap();
    assert_eq!(int_result(&m, r), 0);
}

#[test]
fn test_invokevirtual_dispatches_on_receiver_class() {
    let mut m = machine();
    let mut t = m.spawn_thread();

    let object = m.intrinsics.object;
    let a = define_class(&mut m, "A", Some(object), 0);
    let one = code(&mut m, 1, 1, vec![Opcode::Iconst1 as u8, Opcode::Ireturn as u8]);
    let frob_a = method(&mut m, a, "frob", "()I", 0, MethodCode::Bytecode(one));
    add_virtual(&mut m, a, frob_a);

    let b = define_class(&mut m, "B", Some(a), 0);
    let two = code(&mut m, 1, 1, vec![Opcode::Iconst2 as u8, Opcode::Ireturn as u8]);
    let frob_b = method(&mut m, b, "frob", "()I", 0, MethodCode::Bytecode(two));
    add_virtual(&mut m, b, frob_b);

    let caller = define_class(&mut m, "Caller", Some(object), 0);
    let frob_ref = member_ref(&mut m, "A", "frob", "()I");
    let body = vec![
        Opcode::Aload0 as u8,
        Opcode::Invokevirtual as u8,
        0,
        1,
        Opcode::Ireturn as u8,
    ];
    let caller_code = code_full(&mut m, 1, 1, body, vec![frob_ref], Vec::new(), Vec::new());
    method(
        &mut m,
        caller,
        "run",
        "(LA;)I",
        ACC_STATIC,
        MethodCode::Bytecode(caller_code),
    );

    let on_a = m.make_instance(&mut t, a).unwrap();
    let r = run_method(
        &mut m,
        &mut t,
        "Caller",
        "run",
        "(LA;)I",
        None,
        &[Arg::Object(Some(on_a))],
    )
    .unwrap();
    assert_eq!(int_result(&m, r), 1);

    let on_b = m.make_instance(&mut t, b).unwrap();
    let r = run_method(
        &mut m,
        &mut t,
        "Caller",
        "run",
        "(LA;)I",
        None,
        &[Arg::Object(Some(on_b))],
    )
    .unwrap();
    assert_eq!(int_result(&m, r), 2);
}

#[test]
fn test_invokevirtual_null_receiver() {
    let mut m = machine();
    let mut t = m.spawn_thread();

    let object = m.intrinsics.object;
    let a = define_class(&mut m, "A", Some(object), 0);
    let one = code(&mut m, 1, 1, vec![Opcode::Iconst1 as u8, Opcode::Ireturn as u8]);
    let frob = method(&mut m, a, "frob", "()I", 0, MethodCode::Bytecode(one));
    add_virtual(&mut m, a, frob);

    let caller = define_class(&mut m, "Caller", Some(object), 0);
    let frob_ref = member_ref(&mut m, "A", "frob", "()I");
    let body = vec![
        Opcode::AconstNull as u8,
        Opcode::Invokevirtual as u8,
        0,
        1,
        Opcode::Ireturn as u8,
    ];
    let caller_code = code_full(&mut m, 0, 1, body, vec![frob_ref], Vec::new(), Vec::new());
    method(&mut m, caller, "run", "()I", ACC_STATIC, MethodCode::Bytecode(caller_code));

    let r = run_method(&mut m, &mut t, "Caller", "run", "()I", None, &[]).unwrap();
    assert_eq!(r, None);
    assert_eq!(pending_class(&m, &t), m.intrinsics.null_pointer);
}

#[test]
fn test_invokespecial_super_fold() {
    let mut m = machine();
    let mut t = m.spawn_thread();

    // Grand.m -> 1, Base.m -> 2 (overrides), Derived has SUPER and calls
    // Grand.m via invokespecial; the fold dispatches against Base.
    let object = m.intrinsics.object;
    let grand = define_class(&mut m, "Grand", Some(object), 0);
    let one = code(&mut m, 1, 1, vec![Opcode::Iconst1 as u8, Opcode::Ireturn as u8]);
    let m_grand = method(&mut m, grand, "m", "()I", 0, MethodCode::Bytecode(one));
    add_virtual(&mut m, grand, m_grand);

    let base = define_class(&mut m, "Base", Some(grand), 0);
    let two = code(&mut m, 1, 1, vec![Opcode::Iconst2 as u8, Opcode::Ireturn as u8]);
    let m_base = method(&mut m, base, "m", "()I", 0, MethodCode::Bytecode(two));
    add_virtual(&mut m, base, m_base);

    let derived = define_class(&mut m, "Derived", Some(base), ACC_SUPER);
    let m_ref = member_ref(&mut m, "Grand", "m", "()I");
    let body = vec![
        Opcode::Aload0 as u8,
        Opcode::Invokespecial as u8,
        0,
        1,
        Opcode::Ireturn as u8,
    ];
    let call_code = code_full(&mut m, 1, 1, body, vec![m_ref], Vec::new(), Vec::new());
    let call = method(&mut m, derived, "call", "()I", 0, MethodCode::Bytecode(call_code));
    add_virtual(&mut m, derived, call);

    let receiver = m.make_instance(&mut t, derived).unwrap();
    let r = run_method(
        &mut m,
        &mut t,
        "Derived",
        "call",
        "()I",
        Some(receiver),
        &[],
    )
    .unwrap();
    assert_eq!(int_result(&m, r), 2);
}

#[test]
fn test_native_method_through_dispatch() {
    let mut m = machine();
    let mut t = m.spawn_thread();

    m.register_builtin("Native_add", |_m, _t, args: &NativeArgs<'_>| {
        (args.int(1) + args.int(2)) as u32 as u64
    });

    let object = m.intrinsics.object;
    let native = define_class(&mut m, "Native", Some(object), 0);
    method(
        &mut m,
        native,
        "add",
        "(II)I",
        ACC_STATIC | ACC_NATIVE,
        MethodCode::NativeName("Native_add".to_string()),
    );

    let caller = define_class(&mut m, "Caller", Some(object), 0);
    let add_ref = member_ref(&mut m, "Native", "add", "(II)I");
    let body = vec![
        Opcode::Iconst3 as u8,
        Opcode::Iconst4 as u8,
        Opcode::Invokestatic as u8,
        0,
        1,
        Opcode::Ireturn as u8,
    ];
    let caller_code = code_full(&mut m, 0, 2, body, vec![add_ref], Vec::new(), Vec::new());
    method(&mut m, caller, "run", "()I", ACC_STATIC, MethodCode::Bytecode(caller_code));

    let r = run_method(&mut m, &mut t, "Caller", "run", "()I", None, &[]).unwrap();
    assert_eq!(int_result(&m, r), 7);
    assert_eq!(t.sp, 0);
}

#[test]
fn test_unbound_native_raises_link_error() {
    let mut m = machine();
    let mut t = m.spawn_thread();

    let object = m.intrinsics.object;
    let native = define_class(&mut m, "Native", Some(object), 0);
    method(
        &mut m,
        native,
        "gone",
        "()V",
        ACC_STATIC | ACC_NATIVE,
        MethodCode::NativeName("Native_gone".to_string()),
    );

    let r = run_method(&mut m, &mut t, "Native", "gone", "()V", None, &[]).unwrap();
    assert_eq!(r, None);
    assert_eq!(pending_class(&m, &t), m.intrinsics.unsatisfied_link);
    assert_eq!(pending_message(&m, &t).as_deref(), Some("Native_gone"));
}

#[test]
fn test_deep_recursion_overflows() {
    let mut m = machine_with(MachineOptions {
        stack_slots: 512,
        heap_limit: None,
    });
    let mut t = m.spawn_thread();

    let object = m.intrinsics.object;
    let class = define_class(&mut m, "R", Some(object), 0);
    let rec_ref = member_ref(&mut m, "R", "rec", "()V");
    let body = vec![
        Opcode::Invokestatic as u8,
        0,
        1,
        Opcode::Return as u8,
    ];
    let rec_code = code_full(&mut m, 0, 1, body, vec![rec_ref], Vec::new(), Vec::new());
    method(&mut m, class, "rec", "()V", ACC_STATIC, MethodCode::Bytecode(rec_code));

    let r = run_method(&mut m, &mut t, "R", "rec", "()V", None, &[]).unwrap();
    assert_eq!(r, None);
    assert_eq!(pending_class(&m, &t), m.intrinsics.stack_overflow);
}

#[test]
fn test_weak_reference_allocation_via_new() {
    let mut m = machine();
    let mut t = m.spawn_thread();

    let object = m.intrinsics.object;
    let weak = define_class(&mut m, "Weak", Some(object), 0);
    m.heap.class_mut(weak).vm_flags |= VM_WEAK_REFERENCE;

    let user = define_class(&mut m, "User", Some(object), 0);
    let weak_sym = class_sym(&mut m, "Weak");
    let body = vec![Opcode::New as u8, 0, 1, Opcode::Areturn as u8];
    let run_code = code_full(&mut m, 0, 1, body, vec![weak_sym], Vec::new(), Vec::new());
    method(
        &mut m,
        user,
        "run",
        "()Ljava/lang/Object;",
        ACC_STATIC,
        MethodCode::Bytecode(run_code),
    );

    let r = run_method(&mut m, &mut t, "User", "run", "()Ljava/lang/Object;", None, &[])
        .unwrap();
    let instance: Option<Obj> = r;
    assert!(instance.is_some());
    assert_eq!(m.weak_reference_head(), instance);
}

#[test]
fn test_resolution_is_memoized_across_calls() {
    let mut m = machine();
    let mut t = m.spawn_thread();

    let object = m.intrinsics.object;
    let adder = define_class(&mut m, "Adder", Some(object), 0);
    let add_body = vec![
        Opcode::Iload0 as u8,
        Opcode::Iload1 as u8,
        Opcode::Iadd as u8,
        Opcode::Ireturn as u8,
    ];
    let add_code = code(&mut m, 2, 2, add_body);
    let add = method(&mut m, adder, "add", "(II)I", ACC_STATIC, MethodCode::Bytecode(add_code));

    let caller = define_class(&mut m, "Caller", Some(object), 0);
    let add_ref = member_ref(&mut m, "Adder", "add", "(II)I");
    let body = vec![
        Opcode::Iconst3 as u8,
        Opcode::Iconst4 as u8,
        Opcode::Invokestatic as u8,
        0,
        1,
        Opcode::Ireturn as u8,
    ];
    let caller_code = code_full(&mut m, 0, 2, body, vec![add_ref], Vec::new(), Vec::new());
    method(&mut m, caller, "run", "()I", ACC_STATIC, MethodCode::Bytecode(caller_code));

    run_method(&mut m, &mut t, "Caller", "run", "()I", None, &[]).unwrap();
    // the pool slot now holds the resolved method
    assert_eq!(m.heap.code(caller_code).pool[0], add);

    // and a second run goes straight through the memoized entry
    let r = run_method(&mut m, &mut t, "Caller", "run", "()I", None, &[]).unwrap();
    assert_eq!(int_result(&m, r), 7);
    assert_eq!(m.heap.code(caller_code).pool[0], add);
}
