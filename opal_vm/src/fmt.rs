//! User-visible value stringification.
//!
//! Numbers print without a fractional part when they hold an integral
//! value; containers render recursively with a depth cap so
//! self-referential structures terminate.

use crate::vm::Vm;
use opal_core::value::Tag;
use opal_core::Value;
use opal_heap::{Heap, MapKey, TYPE_CLOSURE, TYPE_LAMBDA, TYPE_LIST, TYPE_MAP, TYPE_STRING};

const MAX_RENDER_DEPTH: u32 = 8;

/// Render a number the way the language prints it.
pub(crate) fn num_to_string(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_owned();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_owned();
    }
    if f == f.trunc() && f.abs() < 1e15 {
        format!("{}", f as i64)
    } else {
        format!("{f}")
    }
}

/// Render any value.
pub(crate) fn value_to_string(vm: &Vm, v: Value) -> String {
    render(vm, v, 0)
}

fn render(vm: &Vm, v: Value, depth: u32) -> String {
    if v.is_number() {
        return num_to_string(v.as_f64());
    }
    match v.tag() {
        Tag::None => "none".to_owned(),
        Tag::True => "true".to_owned(),
        Tag::False => "false".to_owned(),
        Tag::Error => "error".to_owned(),
        Tag::RetInfo => "(frame)".to_owned(),
        Tag::ConstString => {
            let (start, len) = v.as_const_string().unwrap_or((0, 0));
            vm.buf.str_slice(start, len).to_owned()
        }
        Tag::Pointer => render_object(vm, v, depth),
    }
}

fn render_object(vm: &Vm, v: Value, depth: u32) -> String {
    if depth > MAX_RENDER_DEPTH {
        return "...".to_owned();
    }
    let heap: &Heap = &vm.heap;
    match heap.type_of(v) {
        Some(TYPE_STRING) => heap.string_value(v).unwrap_or("").to_owned(),
        Some(TYPE_LIST) => {
            let mut out = String::from("[");
            for (i, item) in heap.list_items(v).iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&render(vm, *item, depth + 1));
            }
            out.push(']');
            out
        }
        Some(TYPE_MAP) => {
            let mut out = String::from("{");
            for (i, (key, value)) in heap.map_ref(v).iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&key_to_string(key));
                out.push_str(": ");
                out.push_str(&render(vm, value, depth + 1));
            }
            out.push('}');
            out
        }
        Some(TYPE_LAMBDA) => "lambda".to_owned(),
        Some(TYPE_CLOSURE) => "closure".to_owned(),
        Some(type_id) => vm.syms.type_name(type_id).to_owned(),
        None => "(invalid)".to_owned(),
    }
}

fn key_to_string(key: &MapKey) -> String {
    match key {
        MapKey::None => "none".to_owned(),
        MapKey::Bool(b) => b.to_string(),
        MapKey::Num(bits) => num_to_string(f64::from_bits(*bits)),
        MapKey::Str(s) => s.to_string(),
        MapKey::Obj(_) => "object".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integral_numbers_drop_fraction() {
        assert_eq!(num_to_string(7.0), "7");
        assert_eq!(num_to_string(-3.0), "-3");
        assert_eq!(num_to_string(0.0), "0");
    }

    #[test]
    fn test_fractional_numbers_keep_fraction() {
        assert_eq!(num_to_string(2.5), "2.5");
        assert_eq!(num_to_string(-0.125), "-0.125");
    }

    #[test]
    fn test_special_numbers() {
        assert_eq!(num_to_string(f64::NAN), "nan");
        assert_eq!(num_to_string(f64::INFINITY), "inf");
        assert_eq!(num_to_string(f64::NEG_INFINITY), "-inf");
    }
}
