//! Cycle detection sweep.
//!
//! Reference counting cannot reclaim cycles. [`Heap::check_memory`] is
//! a debugging and testing hook: it walks the object graph over every
//! live slot, records objects re-entered on a DFS back-edge as cycle
//! roots, and force-frees those roots. It is not a scheduled collector;
//! production code that builds mutually-capturing closures must break
//! the cycles itself (weak references or explicit unlinking).

use crate::heap::Heap;
use crate::object::{HeapObject, CAPTURE_SPILLED, TYPE_CLOSURE, TYPE_LAMBDA, TYPE_LIST, TYPE_MAP, TYPE_STRING};
use opal_core::Value;
use rustc_hash::FxHashMap;

/// Guard added to cycle roots so releases triggered while tearing the
/// cycle down can never re-enter their destructors.
const FORCE_GUARD: u32 = 1 << 30;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    /// On the DFS path.
    Entered,
    /// Fully explored.
    Visited,
}

impl Heap {
    /// Sweep the heap for reference cycles.
    ///
    /// Returns `true` when no cycle exists among the currently live
    /// objects. When cycles are found, their roots are force-freed
    /// (payload destructed, slot returned to the free pool) and the
    /// sweep returns `false`.
    pub fn check_memory(&mut self) -> bool {
        let live = self.live_objects();
        let mut color: FxHashMap<usize, Color> = FxHashMap::default();
        let mut roots: Vec<*mut HeapObject> = Vec::new();

        for &start in &live {
            if color.contains_key(&(start as usize)) {
                continue;
            }
            self.dfs(start, &mut color, &mut roots);
        }

        if roots.is_empty() {
            return true;
        }

        for &r in &roots {
            unsafe {
                (*r).head.rc += FORCE_GUARD;
            }
        }
        for &r in &roots {
            unsafe {
                self.destruct_payload(r);
            }
        }
        for &r in &roots {
            self.free_object(r);
        }
        false
    }

    fn dfs(
        &mut self,
        start: *mut HeapObject,
        color: &mut FxHashMap<usize, Color>,
        roots: &mut Vec<*mut HeapObject>,
    ) {
        enum Step {
            Child(*mut HeapObject),
            Done(*mut HeapObject),
        }

        let mut stack: Vec<(*mut HeapObject, Vec<*mut HeapObject>, usize)> = Vec::new();
        color.insert(start as usize, Color::Entered);
        stack.push((start, self.children(start), 0));

        while !stack.is_empty() {
            let step = {
                let (node, children, idx) = stack.last_mut().expect("non-empty stack");
                if *idx < children.len() {
                    let child = children[*idx];
                    *idx += 1;
                    Step::Child(child)
                } else {
                    Step::Done(*node)
                }
            };
            match step {
                Step::Child(child) => match color.get(&(child as usize)).copied() {
                    None => {
                        color.insert(child as usize, Color::Entered);
                        let grandchildren = self.children(child);
                        stack.push((child, grandchildren, 0));
                    }
                    Some(Color::Entered) => {
                        // Back-edge: the child is on the current path.
                        if !roots.contains(&child) {
                            roots.push(child);
                        }
                    }
                    Some(Color::Visited) => {}
                },
                Step::Done(node) => {
                    color.insert(node as usize, Color::Visited);
                    stack.pop();
                }
            }
        }
    }

    /// Heap children of an object: every contained value that is a
    /// pointer, including a closure's spill list and a map's identity
    /// keys.
    fn children(&self, obj: *mut HeapObject) -> Vec<*mut HeapObject> {
        let mut out = Vec::new();
        let mut push = |v: Value, out: &mut Vec<*mut HeapObject>| {
            if let Some(p) = v.as_ptr() {
                out.push(p as *mut HeapObject);
            }
        };
        unsafe {
            match (*obj).type_id() {
                TYPE_LIST => {
                    let l = (*obj).list;
                    for i in 0..l.len {
                        push(*l.ptr.add(i), &mut out);
                    }
                }
                TYPE_MAP => {
                    let m = &*(*obj).map.map;
                    for (key, value) in m.iter() {
                        push(value, &mut out);
                        if let Some(kv) = key.as_obj_value() {
                            push(kv, &mut out);
                        }
                    }
                }
                TYPE_CLOSURE => {
                    let c = (*obj).closure;
                    if c.flags & CAPTURE_SPILLED != 0 {
                        push(c.captures[0], &mut out);
                    } else {
                        for i in 0..(c.num_captured as usize) {
                            push(c.captures[i], &mut out);
                        }
                    }
                }
                TYPE_STRING | TYPE_LAMBDA => {}
                _ => {
                    let o = (*obj).object;
                    for v in o.fields {
                        push(v, &mut out);
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::PAGE_SLOTS;

    #[test]
    fn test_acyclic_heap_is_clean() {
        let mut heap = Heap::new();
        let s = heap.alloc_string("x").unwrap();
        let list = heap.alloc_list(vec![s]).unwrap();
        assert!(heap.check_memory());
        // Nothing was freed.
        assert_eq!(heap.live_count(), 2);
        heap.release(list);
    }

    #[test]
    fn test_self_cycle_detected_and_freed() {
        let mut heap = Heap::new();
        // a = []; a.append(a): the list holds the only reference to
        // itself after the program releases its handle.
        let a = heap.alloc_list(Vec::new()).unwrap();
        heap.retain(a);
        heap.list_push(a, a);
        heap.release(a);
        assert_eq!(heap.ref_count(a), Some(1));

        assert!(!heap.check_memory());
        assert_eq!(heap.live_count(), 0);
        assert_eq!(heap.free_slot_count(), PAGE_SLOTS - 1);
    }

    #[test]
    fn test_two_object_cycle() {
        let mut heap = Heap::new();
        let a = heap.alloc_list(Vec::new()).unwrap();
        let b = heap.alloc_list(Vec::new()).unwrap();
        heap.retain(b);
        heap.list_push(a, b);
        heap.retain(a);
        heap.list_push(b, a);
        // Drop the program's handles; the cycle keeps both alive.
        heap.release(a);
        heap.release(b);
        assert_eq!(heap.live_count(), 2);

        assert!(!heap.check_memory());
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_shared_acyclic_diamond_is_clean() {
        let mut heap = Heap::new();
        let shared = heap.alloc_string("shared").unwrap();
        heap.retain(shared);
        let left = heap.alloc_list(vec![shared]).unwrap();
        let right = heap.alloc_list(vec![shared]).unwrap();
        let top = heap.alloc_list(vec![left, right]).unwrap();
        assert!(heap.check_memory());
        heap.release(top);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_cycle_through_closure_capture() {
        let mut heap = Heap::new();
        let list = heap.alloc_list(Vec::new()).unwrap();
        heap.retain(list);
        let clo = heap.alloc_closure(0, 0, 0, &[list]).unwrap();
        heap.list_push(list, clo);
        heap.release(list);
        // list <-> closure keep each other alive.
        assert_eq!(heap.live_count(), 2);
        assert!(!heap.check_memory());
        assert_eq!(heap.live_count(), 0);
    }
}
