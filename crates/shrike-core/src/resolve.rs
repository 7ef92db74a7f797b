//! Lazy constant-pool resolution and dispatch helpers
//!
//! Symbolic pool entries (`Symbol` class names and `Reference` member
//! triples) are rewritten in place with their resolved form on first use.
//! The rewrite is monotonic: a resolved slot never reverts, and a second
//! resolution of the same slot returns the memoized handle. Resolution
//! failures raise link errors into the thread's exception slot.

use crate::gc::Obj;
use crate::machine::Machine;
use crate::stack::Thread;
use crate::{VmError, VmResult};
use shrike_bytecode::flags::{ACC_INTERFACE, ACC_SUPER};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Member {
    Field,
    Method,
}

/// Resolve a class by binary name: registry first, then the class finder.
///
/// Raises `NoClassDefFoundError` when neither supplies it.
pub fn resolve_class_by_name(m: &mut Machine, t: &mut Thread, name: &str) -> Option<Obj> {
    if let Some(class) = m.lookup_class(name) {
        return Some(class);
    }

    let finder = m.take_finder();
    let found = finder.as_ref().and_then(|f| f.find(m, name));
    m.put_finder(finder);

    match found {
        Some(class) => {
            m.register_class(name, class);
            Some(class)
        }
        None => {
            m.throw_no_class_def(t, name);
            None
        }
    }
}

/// Resolve the class at pool slot `index` (0-based), memoizing in place.
pub fn resolve_class(m: &mut Machine, t: &mut Thread, code: Obj, index: usize) -> Option<Obj> {
    let entry = m.heap.code(code).pool[index];
    match m.heap.get(entry) {
        crate::object::Cell::Symbol(name) => {
            let name = name.clone();
            let class = resolve_class_by_name(m, t, &name)?;
            m.heap.code_mut(code).pool[index] = class;
            Some(class)
        }
        crate::object::Cell::Class(_) => Some(entry),
        other => panic!(
            "constant pool slot {index} holds {}, expected a class",
            other.kind_name()
        ),
    }
}

/// Resolve the field reference at pool slot `index` (0-based).
pub fn resolve_field(m: &mut Machine, t: &mut Thread, code: Obj, index: usize) -> Option<Obj> {
    resolve_member(m, t, code, index, Member::Field)
}

/// Resolve the method reference at pool slot `index` (0-based).
pub fn resolve_method(m: &mut Machine, t: &mut Thread, code: Obj, index: usize) -> Option<Obj> {
    resolve_member(m, t, code, index, Member::Method)
}

fn resolve_member(
    m: &mut Machine,
    t: &mut Thread,
    code: Obj,
    index: usize,
    kind: Member,
) -> Option<Obj> {
    let entry = m.heap.code(code).pool[index];
    match (m.heap.get(entry), kind) {
        (crate::object::Cell::Reference(r), _) => {
            let r = r.clone();
            let class = resolve_class_by_name(m, t, &r.class_name)?;

            // Walk the resolution class chain upward, matching name and
            // spec byte-exactly.
            let mut found = None;
            let mut search = Some(class);
            while let Some(c) = search {
                if found.is_some() {
                    break;
                }
                found = find_in_class(m, c, kind, &r.name, &r.spec);
                search = m.heap.class(c).super_class;
            }

            match found {
                Some(member) => {
                    m.heap.code_mut(code).pool[index] = member;
                    Some(member)
                }
                None => {
                    let message =
                        format!("{} {} not found in {}", r.name, r.spec, r.class_name);
                    match kind {
                        Member::Field => m.throw_no_such_field(t, message),
                        Member::Method => m.throw_no_such_method(t, message),
                    }
                    None
                }
            }
        }
        (crate::object::Cell::Field(_), Member::Field) => Some(entry),
        (crate::object::Cell::Method(_), Member::Method) => Some(entry),
        (other, _) => panic!(
            "constant pool slot {index} holds {}, expected a member reference",
            other.kind_name()
        ),
    }
}

fn find_in_class(m: &Machine, class: Obj, kind: Member, name: &str, spec: &str) -> Option<Obj> {
    let table = match kind {
        Member::Field => &m.heap.class(class).field_table,
        Member::Method => &m.heap.class(class).method_table,
    };
    for &member in table {
        let (member_name, member_spec) = match kind {
            Member::Field => {
                let f = m.heap.field(member);
                (f.name.as_str(), f.spec.as_str())
            }
            Member::Method => {
                let mm = m.heap.method(member);
                (mm.name.as_str(), mm.spec.as_str())
            }
        };
        if member_name == name && member_spec == spec {
            return Some(member);
        }
    }
    None
}

/// Search a class and its superclasses for a method by name and spec.
pub fn find_method_in_class(
    m: &Machine,
    class: Obj,
    name: &str,
    spec: &str,
) -> Option<Obj> {
    let mut search = Some(class);
    while let Some(c) = search {
        if let Some(method) = find_in_class(m, c, Member::Method, name, spec) {
            return Some(method);
        }
        search = m.heap.class(c).super_class;
    }
    None
}

/// Virtual dispatch: the class's vtable entry at the method's offset.
pub fn find_method(m: &Machine, method: Obj, class: Obj) -> Obj {
    m.heap.class(class).virtual_table[m.heap.method(method).offset]
}

/// Interface dispatch: scan the receiver class's interface table for the
/// method's interface, then index the paired dispatch array.
///
/// An object that reached an `invokeinterface` without implementing the
/// interface is an impossible state.
pub fn find_interface_method(m: &Machine, method: Obj, o: Obj) -> VmResult<Obj> {
    let interface = m
        .heap
        .method(method)
        .class
        .expect("interface method without a class");
    let class = m.class_of(o);
    for (implemented, dispatch) in &m.heap.class(class).interface_table {
        if *implemented == interface {
            return Ok(dispatch[m.heap.method(method).offset]);
        }
    }
    Err(VmError::Internal(format!(
        "interface {} not implemented by {}",
        m.heap.class(interface).name,
        m.heap.class(class).name
    )))
}

/// Whether `class` is a proper superclass of `base`.
pub fn is_superclass(m: &Machine, class: Obj, base: Obj) -> bool {
    let mut search = m.heap.class(base).super_class;
    while let Some(c) = search {
        if c == class {
            return true;
        }
        search = m.heap.class(c).super_class;
    }
    false
}

/// Whether an `invokespecial` of `method` from `class` dispatches against
/// the superclass instead of the statically named class.
pub fn is_special_method(m: &Machine, method: Obj, class: Obj) -> bool {
    m.heap.class(class).flags & ACC_SUPER != 0
        && m.heap.method(method).name != "<init>"
        && m.heap
            .method(method)
            .class
            .is_some_and(|c| is_superclass(m, c, class))
}

/// The `instanceof`/`checkcast` test. Null is never an instance.
pub fn instance_of(m: &Machine, class: Obj, o: Option<Obj>) -> bool {
    let Some(o) = o else {
        return false;
    };

    if m.heap.class(class).flags & ACC_INTERFACE != 0 {
        let mut search = Some(m.class_of(o));
        while let Some(c) = search {
            for (implemented, _) in &m.heap.class(c).interface_table {
                if *implemented == class {
                    return true;
                }
            }
            search = m.heap.class(c).super_class;
        }
    } else {
        let mut search = Some(m.class_of(o));
        while let Some(c) = search {
            if c == class {
                return true;
            }
            search = m.heap.class(c).super_class;
        }
    }

    false
}
