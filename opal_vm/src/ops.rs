//! Operation helpers behind the dispatch loop's fast paths.
//!
//! Arithmetic and comparison specialize on number-number operands in
//! the loop itself; everything else lands here. The fallback coercion
//! table is: `true` is 1, `false` and `none` are 0, strings parse (or
//! 0 when unparsable), and any other operand panics.

use crate::vm::Vm;
use opal_core::{Value, VmError, VmResult};
use opal_heap::{MapKey, TYPE_LIST, TYPE_MAP};

/// Binary arithmetic selector for the shared fallback path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

impl ArithOp {
    #[inline]
    pub(crate) fn apply(self, x: f64, y: f64) -> f64 {
        match self {
            ArithOp::Add => x + y,
            ArithOp::Sub => x - y,
            ArithOp::Mul => x * y,
            ArithOp::Div => x / y,
            ArithOp::Mod => x % y,
            ArithOp::Pow => x.powf(y),
        }
    }
}

impl Vm {
    /// Full numeric coercion, including string parsing.
    pub(crate) fn to_f64_coerce(&self, v: Value) -> VmResult<f64> {
        if let Some(f) = v.to_f64_prim() {
            return Ok(f);
        }
        if let Some(s) = self.str_of(v) {
            return Ok(s.trim().parse().unwrap_or(0.0));
        }
        Err(VmError::panic("cannot coerce value to number"))
    }

    /// Slow arithmetic path. Takes ownership of both operand
    /// references and releases them.
    pub(crate) fn arith_fallback(&mut self, op: ArithOp, a: Value, b: Value) -> VmResult<Value> {
        if op == ArithOp::Add {
            let concat = match (self.str_of(a), self.str_of(b)) {
                (Some(x), Some(y)) => {
                    let mut s = String::with_capacity(x.len() + y.len());
                    s.push_str(x);
                    s.push_str(y);
                    Some(s)
                }
                _ => None,
            };
            if let Some(s) = concat {
                let out = self.heap.alloc_string(&s)?;
                self.heap.release(a);
                self.heap.release(b);
                return Ok(out);
            }
        }
        let x = self.to_f64_coerce(a)?;
        let y = self.to_f64_coerce(b)?;
        self.heap.release(a);
        self.heap.release(b);
        Ok(Value::float(op.apply(x, y)))
    }

    /// Equality across kinds: number-number by value, string-string by
    /// bytes, pointer-pointer by identity, anything else through the
    /// coercion table. Releases both operand references.
    pub(crate) fn values_equal(&mut self, a: Value, b: Value) -> VmResult<bool> {
        if a.is_number() && b.is_number() {
            return Ok(a.as_f64() == b.as_f64());
        }
        let str_eq = match (self.str_of(a), self.str_of(b)) {
            (Some(x), Some(y)) => Some(x == y),
            _ => None,
        };
        if let Some(eq) = str_eq {
            self.heap.release(a);
            self.heap.release(b);
            return Ok(eq);
        }
        if a.is_pointer() && b.is_pointer() {
            let eq = a.bits() == b.bits();
            self.heap.release(a);
            self.heap.release(b);
            return Ok(eq);
        }
        let x = self.to_f64_coerce(a)?;
        let y = self.to_f64_coerce(b)?;
        self.heap.release(a);
        self.heap.release(b);
        Ok(x == y)
    }

    /// Ordering comparison operands: coerce both to numbers and release
    /// the references.
    pub(crate) fn compare_operands(&mut self, a: Value, b: Value) -> VmResult<(f64, f64)> {
        if a.is_number() && b.is_number() {
            return Ok((a.as_f64(), b.as_f64()));
        }
        let x = self.to_f64_coerce(a)?;
        let y = self.to_f64_coerce(b)?;
        self.heap.release(a);
        self.heap.release(b);
        Ok((x, y))
    }

    // =========================================================================
    // Indexing
    // =========================================================================

    /// `pushIndex` / `pushReverseIndex`. Takes ownership of both
    /// operand references; the result carries a fresh reference.
    pub(crate) fn index_read(&mut self, recv: Value, idx: Value, reverse: bool) -> VmResult<Value> {
        match self.heap.type_of(recv) {
            Some(TYPE_LIST) => {
                if !idx.is_number() {
                    return Err(VmError::panic("expected an integer list index"));
                }
                let len = self.heap.list_len(recv) as i64;
                let i = idx.as_f64() as i64;
                let i = if reverse { len - i } else { i };
                if i < 0 || i >= len {
                    return Err(VmError::OutOfBounds);
                }
                let v = self.heap.list_items(recv)[i as usize];
                self.heap.retain(v);
                self.heap.release(recv);
                Ok(v)
            }
            Some(TYPE_MAP) => {
                // Reverse indexing a map negates a numeric key.
                let key_v = if reverse && idx.is_number() {
                    Value::float(-idx.as_f64())
                } else {
                    idx
                };
                let key = self.map_key_ref(key_v)?;
                let found = self.heap.map_get(recv, &key);
                let out = match found {
                    Some(v) => {
                        self.heap.retain(v);
                        v
                    }
                    None => Value::none(),
                };
                self.heap.release(idx);
                self.heap.release(recv);
                Ok(out)
            }
            _ => Err(VmError::panic("value is not indexable")),
        }
    }

    /// `setIndex`. Takes ownership of all three operand references; the
    /// stored value's reference transfers into the container.
    pub(crate) fn index_write(&mut self, recv: Value, idx: Value, val: Value) -> VmResult<()> {
        match self.heap.type_of(recv) {
            Some(TYPE_LIST) => {
                if !idx.is_number() {
                    return Err(VmError::panic("expected an integer list index"));
                }
                let len = self.heap.list_len(recv) as i64;
                let i = idx.as_f64() as i64;
                if i < 0 || i >= len {
                    return Err(VmError::OutOfBounds);
                }
                let old = self.heap.list_set(recv, i as usize, val);
                self.heap.release(old);
                self.heap.release(recv);
                Ok(())
            }
            Some(TYPE_MAP) => {
                let key = self.map_key_owned(idx)?;
                self.heap.map_insert(recv, key, val);
                self.heap.release(idx);
                self.heap.release(recv);
                Ok(())
            }
            _ => Err(VmError::panic("value is not indexable")),
        }
    }

    /// `pushSlice`: python-style negative-index adjustment, `none`
    /// bounds default to the ends, out-of-range panics. Element
    /// references are retained into the new list.
    pub(crate) fn slice_list(&mut self, recv: Value, start: Value, end: Value) -> VmResult<Value> {
        if self.heap.type_of(recv) != Some(TYPE_LIST) {
            return Err(VmError::panic("can only slice a list"));
        }
        let len = self.heap.list_len(recv) as i64;
        let resolve = |v: Value, default: i64| -> VmResult<i64> {
            if v.is_none() {
                return Ok(default);
            }
            if !v.is_number() {
                return Err(VmError::panic("expected an integer slice bound"));
            }
            let i = v.as_f64() as i64;
            Ok(if i < 0 { len + i } else { i })
        };
        let s = resolve(start, 0)?;
        let e = resolve(end, len)?;
        if s < 0 || e > len || s > e {
            return Err(VmError::OutOfBounds);
        }
        let items: Vec<Value> = self.heap.list_items(recv)[s as usize..e as usize].to_vec();
        for v in &items {
            self.heap.retain(*v);
        }
        self.heap.release(recv);
        self.heap.alloc_list(items)
    }

    // =========================================================================
    // Fields
    // =========================================================================

    /// `pushField` family. The receiver reference is consumed only by
    /// the parent-release variants; the result is retained only by the
    /// retain variants.
    pub(crate) fn field_read(
        &mut self,
        fid: u16,
        retain: bool,
        parent_release: bool,
    ) -> VmResult<()> {
        let recv = self.pop();
        let type_id = self.heap.type_of(recv);
        let direct =
            type_id.and_then(|t| self.syms.resolve_field(t, fid as u32));
        let val = if let Some(field_idx) = direct {
            Some(self.heap.object_field(recv, field_idx as usize))
        } else if type_id == Some(TYPE_MAP) {
            let name = self.syms.field_syms[fid as usize].name.clone();
            self.heap.map_get(recv, &MapKey::str(&name))
        } else {
            None
        };
        let Some(val) = val else {
            let name = &self.syms.field_syms[fid as usize].name;
            return Err(VmError::panic(format!("Missing field `{name}`")));
        };
        if retain {
            self.heap.retain(val);
        }
        if parent_release {
            self.heap.release(recv);
        }
        self.push(val);
        Ok(())
    }

    /// `setField` / `releaseSetField`. The stored value's reference
    /// transfers into the object; `release_old` frees the displaced
    /// field value.
    pub(crate) fn field_write(&mut self, fid: u16, release_old: bool) -> VmResult<()> {
        let val = self.pop();
        let recv = self.pop();
        let type_id = self.heap.type_of(recv);
        if let Some(field_idx) = type_id.and_then(|t| self.syms.resolve_field(t, fid as u32)) {
            let old = self.heap.object_set_field(recv, field_idx as usize, val);
            if release_old {
                self.heap.release(old);
            }
            return Ok(());
        }
        if type_id == Some(TYPE_MAP) {
            let name = self.syms.field_syms[fid as usize].name.clone();
            self.heap.map_insert(recv, MapKey::str(&name), val);
            return Ok(());
        }
        let name = &self.syms.field_syms[fid as usize].name;
        Err(VmError::panic(format!("Missing field `{name}`")))
    }
}
