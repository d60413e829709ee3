//! Core native bindings registered at VM construction.
//!
//! Natives follow the ownership rule of the call ABI: receiver and
//! argument references transfer in, so a native releases everything it
//! does not hand back as a return value.

use crate::fmt::value_to_string;
use crate::symbols::{FuncSymbol, MethodEntry, METHOD_ITERATOR, METHOD_NEXT};
use crate::vm::Vm;
use opal_core::value::Tag;
use opal_core::Value;
use opal_heap::{TYPE_LIST, TYPE_MAP};

/// Register the built-in types' methods and the core free functions.
pub(crate) fn register(vm: &mut Vm) {
    let syms = &mut vm.syms;

    // The compiler resolves the iteration protocol against these two
    // reserved ids; they must be created first.
    let iterator = syms.ensure_method_sym("iterator");
    debug_assert_eq!(iterator, METHOD_ITERATOR);
    let next = syms.ensure_method_sym("next");
    debug_assert_eq!(next, METHOD_NEXT);

    syms.add_method_sym(iterator, TYPE_LIST, MethodEntry::Native1(list_iterator));
    syms.add_method_sym(next, TYPE_LIST, MethodEntry::Native1(list_next));

    let append = syms.ensure_method_sym("append");
    syms.add_method_sym(append, TYPE_LIST, MethodEntry::Native1(list_append));

    let size = syms.ensure_method_sym("size");
    syms.add_method_sym(size, TYPE_LIST, MethodEntry::Native1(list_size));
    syms.add_method_sym(size, TYPE_MAP, MethodEntry::Native1(map_size));

    let remove = syms.ensure_method_sym("remove");
    syms.add_method_sym(remove, TYPE_MAP, MethodEntry::Native2(map_remove));

    let print = syms.ensure_func_sym("print");
    syms.set_func_sym(print, FuncSymbol::Native(print_native));

    let type_name = syms.ensure_func_sym("typeName");
    syms.set_func_sym(type_name, FuncSymbol::Native(type_name_native));
}

// =============================================================================
// List
// =============================================================================

/// `list.iterator()`: reset the in-object cursor; the list is its own
/// iterator, and the transferred receiver reference becomes the
/// returned iterator reference.
fn list_iterator(vm: &mut Vm, recv: Value, _args: &[Value]) -> Value {
    vm.heap.list_iter_reset(recv);
    recv
}

/// `list.next()`: yield the element under the cursor, `none` when
/// exhausted.
fn list_next(vm: &mut Vm, recv: Value, _args: &[Value]) -> Value {
    let out = match vm.heap.list_iter_next(recv) {
        Some(item) => {
            vm.heap.retain(item);
            item
        }
        None => Value::none(),
    };
    vm.heap.release(recv);
    out
}

/// `list.append(item)`: the item reference moves into the list.
fn list_append(vm: &mut Vm, recv: Value, args: &[Value]) -> Value {
    let item = args.first().copied().unwrap_or_else(Value::none);
    vm.heap.list_push(recv, item);
    vm.heap.release(recv);
    Value::none()
}

/// `list.size()`.
fn list_size(vm: &mut Vm, recv: Value, _args: &[Value]) -> Value {
    let n = vm.heap.list_len(recv);
    vm.heap.release(recv);
    Value::float(n as f64)
}

// =============================================================================
// Map
// =============================================================================

/// `map.size()`.
fn map_size(vm: &mut Vm, recv: Value, _args: &[Value]) -> Value {
    let n = vm.heap.map_len(recv);
    vm.heap.release(recv);
    Value::float(n as f64)
}

/// `map.remove(key)`: two returns, the removed value and whether the
/// key was present.
fn map_remove(vm: &mut Vm, recv: Value, args: &[Value]) -> (Value, Value) {
    let key_v = args.first().copied().unwrap_or_else(Value::none);
    let result = match vm.map_key_ref(key_v) {
        Ok(key) => {
            let (removed, found) = vm.heap.map_remove(recv, &key);
            (removed.unwrap_or_else(Value::none), Value::bool_(found))
        }
        Err(_) => (Value::none(), Value::bool_(false)),
    };
    vm.heap.release(key_v);
    vm.heap.release(recv);
    result
}

// =============================================================================
// Free Functions
// =============================================================================

/// `print(values...)`: render arguments space-separated into the VM's
/// output buffer.
fn print_native(vm: &mut Vm, args: &[Value]) -> Value {
    let line = args
        .iter()
        .map(|v| value_to_string(vm, *v))
        .collect::<Vec<_>>()
        .join(" ");
    vm.printed.push(line);
    for v in args {
        vm.heap.release(*v);
    }
    Value::none()
}

/// `typeName(value)`: the display name of a value's type.
fn type_name_native(vm: &mut Vm, args: &[Value]) -> Value {
    let v = args.first().copied().unwrap_or_else(Value::none);
    let name = if v.is_number() {
        "Number".to_owned()
    } else {
        match v.tag() {
            Tag::None => "None".to_owned(),
            Tag::True | Tag::False => "Boolean".to_owned(),
            Tag::ConstString => "String".to_owned(),
            Tag::Pointer => {
                let type_id = vm.heap.type_of(v).unwrap_or(opal_core::NULL_ID);
                vm.syms.type_name(type_id).to_owned()
            }
            _ => "(internal)".to_owned(),
        }
    };
    vm.heap.release(v);
    vm.heap.alloc_string(&name).unwrap_or_else(|_| Value::none())
}
