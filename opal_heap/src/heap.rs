//! The slab heap: page management, free-span allocation, reference
//! counting, and the kind-specific free paths.
//!
//! Pages are fixed arrays of 1600 uniform slots and are never freed or
//! relocated while the heap lives, so raw slot pointers stay valid
//! until drop. Free slots are threaded through an intrusive span list:
//! each maximal run of free slots is described by a header in its
//! first slot and a back-pointer in its last, which makes freeing next
//! to an existing span an O(1) merge.

use crate::map::{MapKey, ValueMap};
use crate::object::{
    Closure, FreeSpan, HeapObject, Lambda, ListInner, MapInner, SmallObject, StringInner, TypeId,
    CAPTURE_SPILLED, MAX_INLINE_CAPTURES, SMALL_OBJECT_FIELDS, TYPE_CLOSURE, TYPE_LAMBDA,
    TYPE_LIST, TYPE_MAP, TYPE_SENTINEL, TYPE_STRING,
};
use opal_core::{Value, VmError, VmResult, NULL_ID};
use std::mem::ManuallyDrop;
use std::ptr;

/// Slots per page: ~62 KiB of object memory at 40 bytes per slot.
pub const PAGE_SLOTS: usize = 1600;

/// Retain/release counters maintained in trace mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceStats {
    /// Total retains since trace mode was enabled.
    pub num_retains: u64,
    /// Total releases since trace mode was enabled.
    pub num_releases: u64,
}

/// One slab page. The box never moves once allocated.
struct Page {
    slots: Box<[HeapObject]>,
}

impl Page {
    fn new() -> Self {
        let mut slots = vec![HeapObject::free(); PAGE_SLOTS].into_boxed_slice();
        // Slot 0 is the permanently reserved sentinel: a backwards
        // probe from any slot must never read a free type id here.
        slots[0] = HeapObject {
            head: crate::object::Head {
                type_id: TYPE_SENTINEL,
                rc: 1,
            },
        };
        Page { slots }
    }

    #[inline]
    fn base(&mut self) -> *mut HeapObject {
        self.slots.as_mut_ptr()
    }

    #[inline]
    fn base_const(&self) -> *const HeapObject {
        self.slots.as_ptr()
    }
}

/// The object heap.
pub struct Heap {
    pages: Vec<Page>,
    free_head: *mut HeapObject,
    max_pages: usize,
    trace: bool,
    num_retains: u64,
    num_releases: u64,
}

impl Heap {
    /// Create a heap with its first page allocated.
    #[must_use]
    pub fn new() -> Self {
        let mut heap = Heap {
            pages: Vec::new(),
            free_head: ptr::null_mut(),
            max_pages: usize::MAX,
            trace: false,
            num_retains: 0,
            num_releases: 0,
        };
        heap.add_page();
        heap
    }

    /// Cap the page count; further growth reports `OutOfMemory`.
    pub fn set_max_pages(&mut self, max: usize) {
        self.max_pages = max.max(1);
    }

    /// Enable or disable retain/release accounting.
    pub fn set_trace(&mut self, on: bool) {
        self.trace = on;
        if on {
            self.num_retains = 0;
            self.num_releases = 0;
        }
    }

    /// Current trace counters.
    #[must_use]
    pub fn trace_stats(&self) -> TraceStats {
        TraceStats {
            num_retains: self.num_retains,
            num_releases: self.num_releases,
        }
    }

    /// Number of allocated pages.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    // =========================================================================
    // Slot Allocation
    // =========================================================================

    /// Allocate one uninitialized slot.
    ///
    /// The caller writes the full payload, including the type id and
    /// `rc = 1`, before the slot is observable anywhere.
    pub fn alloc_object(&mut self) -> VmResult<*mut HeapObject> {
        if self.free_head.is_null() {
            self.grow()?;
        }
        let head = self.free_head;
        unsafe {
            let span = (*head).free_span;
            if span.len == 1 {
                self.free_head = span.next;
            } else {
                // Split: the remainder keeps the list position.
                let new_head = head.add(1);
                (*new_head).free_span = FreeSpan {
                    type_id: NULL_ID,
                    len: span.len - 1,
                    start: new_head,
                    next: span.next,
                };
                let tail = head.add(span.len as usize - 1);
                (*tail).free_span.start = new_head;
                self.free_head = new_head;
            }
        }
        Ok(head)
    }

    /// Return a slot to the free pool, merging with a free span on its
    /// left when present.
    ///
    /// A merged slot is not re-linked into the free list: the left
    /// span already carries the list membership.
    pub fn free_object(&mut self, obj: *mut HeapObject) {
        unsafe {
            let left = obj.sub(1);
            if (*left).type_id() == NULL_ID {
                let span_head = (*left).free_span.start;
                (*span_head).free_span.len += 1;
                (*obj).free_span = FreeSpan {
                    type_id: NULL_ID,
                    len: 0,
                    start: span_head,
                    next: ptr::null_mut(),
                };
            } else {
                (*obj).free_span = FreeSpan {
                    type_id: NULL_ID,
                    len: 1,
                    start: obj,
                    next: self.free_head,
                };
                self.free_head = obj;
            }
        }
    }

    fn add_page(&mut self) {
        let mut page = Page::new();
        let base = page.base();
        unsafe {
            let header = base.add(1);
            (*header).free_span = FreeSpan {
                type_id: NULL_ID,
                len: (PAGE_SLOTS - 1) as u32,
                start: header,
                next: self.free_head,
            };
            (*base.add(PAGE_SLOTS - 1)).free_span.start = header;
            self.free_head = header;
        }
        self.pages.push(page);
    }

    fn grow(&mut self) -> VmResult<()> {
        let want = ((self.pages.len() * 3) + 1) / 2;
        let mut add = want.max(1);
        if self.pages.len() + add > self.max_pages {
            add = self.max_pages.saturating_sub(self.pages.len());
        }
        if add == 0 {
            return Err(VmError::OutOfMemory);
        }
        for _ in 0..add {
            self.add_page();
        }
        Ok(())
    }

    // =========================================================================
    // Reference Counting
    // =========================================================================

    /// Bump the reference count of a heap value; no-op for primitives.
    #[inline]
    pub fn retain(&mut self, v: Value) {
        if let Some(ptr) = v.as_ptr() {
            let obj = ptr as *mut HeapObject;
            unsafe {
                (*obj).head.rc += 1;
            }
            if self.trace {
                self.num_retains += 1;
            }
        }
    }

    /// Drop one reference from a heap value; frees the object and
    /// recursively releases its children at zero.
    pub fn release(&mut self, v: Value) {
        let Some(ptr) = v.as_ptr() else { return };
        let obj = ptr as *mut HeapObject;
        if self.trace {
            self.num_releases += 1;
        }
        unsafe {
            debug_assert!((*obj).head.rc >= 1, "release of a dead object");
            (*obj).head.rc -= 1;
            if (*obj).head.rc == 0 {
                self.free_by_kind(obj);
            }
        }
    }

    /// Destruct an object's payload (releasing children, dropping owned
    /// buffers) and return its slot to the free pool.
    pub(crate) fn free_by_kind(&mut self, obj: *mut HeapObject) {
        unsafe {
            self.destruct_payload(obj);
        }
        self.free_object(obj);
    }

    /// Release children and free owned buffers, leaving the slot
    /// contents dead but the slot itself still allocated.
    ///
    /// # Safety
    /// `obj` must point at a live, fully initialized slot.
    pub(crate) unsafe fn destruct_payload(&mut self, obj: *mut HeapObject) {
        let type_id = unsafe { (*obj).type_id() };
        match type_id {
            TYPE_LIST => {
                let l = unsafe { (*obj).list };
                let items = unsafe { Vec::from_raw_parts(l.ptr, l.len, l.cap) };
                for v in &items {
                    self.release(*v);
                }
            }
            TYPE_MAP => {
                let m = unsafe { (*obj).map };
                let mut map = unsafe { Box::from_raw(m.map) };
                for (key, value) in map.drain() {
                    self.release(value);
                    if let Some(obj_key) = key.as_obj_value() {
                        self.release(obj_key);
                    }
                }
            }
            TYPE_STRING => {
                let s = unsafe { (*obj).string };
                let slice = ptr::slice_from_raw_parts_mut(s.ptr, s.len);
                drop(unsafe { Box::from_raw(slice) });
            }
            TYPE_LAMBDA => {}
            TYPE_CLOSURE => {
                let c = unsafe { (*obj).closure };
                if c.flags & CAPTURE_SPILLED != 0 {
                    self.release(c.captures[0]);
                } else {
                    for i in 0..(c.num_captured as usize).min(MAX_INLINE_CAPTURES) {
                        self.release(c.captures[i]);
                    }
                }
            }
            _ => {
                // Small object: unused fields hold `none`, so releasing
                // all four is safe.
                let o = unsafe { (*obj).object };
                for v in o.fields {
                    self.release(v);
                }
            }
        }
    }

    // =========================================================================
    // Object Constructors
    // =========================================================================

    #[inline]
    fn init(&mut self, write: impl FnOnce(*mut HeapObject)) -> VmResult<Value> {
        let slot = self.alloc_object()?;
        write(slot);
        // An object is born with rc = 1; trace mode books that initial
        // reference as a retain so the balance invariant
        // `retains == releases + live refs` holds exactly.
        if self.trace {
            self.num_retains += 1;
        }
        Ok(Value::pointer(slot as *const ()))
    }

    /// Allocate a list taking ownership of `items` (element references
    /// transfer to the list).
    pub fn alloc_list(&mut self, items: Vec<Value>) -> VmResult<Value> {
        let mut items = ManuallyDrop::new(items);
        let (ptr, len, cap) = (items.as_mut_ptr(), items.len(), items.capacity());
        self.init(|slot| unsafe {
            (*slot).list = ListInner {
                type_id: TYPE_LIST,
                rc: 1,
                ptr,
                len,
                cap,
                cursor: 0,
            };
        })
    }

    /// Allocate an empty map.
    pub fn alloc_map(&mut self) -> VmResult<Value> {
        let map = Box::into_raw(Box::new(ValueMap::new()));
        self.init(|slot| unsafe {
            (*slot).map = MapInner {
                type_id: TYPE_MAP,
                rc: 1,
                map,
            };
        })
    }

    /// Allocate a string by copying `s`.
    pub fn alloc_string(&mut self, s: &str) -> VmResult<Value> {
        let len = s.len();
        let boxed: Box<[u8]> = s.as_bytes().into();
        let ptr = Box::into_raw(boxed) as *mut u8;
        self.init(|slot| unsafe {
            (*slot).string = StringInner {
                type_id: TYPE_STRING,
                rc: 1,
                ptr,
                len,
            };
        })
    }

    /// Allocate a lambda.
    pub fn alloc_lambda(&mut self, func_pc: u32, num_params: u8, num_locals: u8) -> VmResult<Value> {
        self.init(|slot| unsafe {
            (*slot).lambda = Lambda {
                type_id: TYPE_LAMBDA,
                rc: 1,
                func_pc,
                num_params,
                num_locals,
            };
        })
    }

    /// Allocate a closure taking ownership of the capture references.
    /// More than three captures spill into a heap list.
    pub fn alloc_closure(
        &mut self,
        func_pc: u32,
        num_params: u8,
        num_locals: u8,
        caps: &[Value],
    ) -> VmResult<Value> {
        let mut captures = [Value::none(); MAX_INLINE_CAPTURES];
        let mut flags = 0;
        if caps.len() <= MAX_INLINE_CAPTURES {
            captures[..caps.len()].copy_from_slice(caps);
        } else {
            captures[0] = self.alloc_list(caps.to_vec())?;
            flags = CAPTURE_SPILLED;
        }
        let num_captured = caps.len() as u8;
        self.init(|slot| unsafe {
            (*slot).closure = Closure {
                type_id: TYPE_CLOSURE,
                rc: 1,
                func_pc,
                num_params,
                num_captured,
                num_locals,
                flags,
                captures,
            };
        })
    }

    /// Allocate a small object taking ownership of the field references.
    pub fn alloc_small_object(
        &mut self,
        type_id: TypeId,
        fields: [Value; SMALL_OBJECT_FIELDS],
    ) -> VmResult<Value> {
        self.init(|slot| unsafe {
            (*slot).object = SmallObject { type_id, rc: 1, fields };
        })
    }

    // =========================================================================
    // Typed Accessors
    // =========================================================================

    /// Slot pointer behind a heap value.
    #[inline]
    #[must_use]
    pub fn obj(v: Value) -> *mut HeapObject {
        debug_assert!(v.is_pointer());
        v.as_ptr().unwrap_or(ptr::null_mut()) as *mut HeapObject
    }

    /// Type id of a heap value, `None` for primitives.
    #[inline]
    #[must_use]
    pub fn type_of(&self, v: Value) -> Option<TypeId> {
        let ptr = v.as_ptr()? as *mut HeapObject;
        Some(unsafe { (*ptr).type_id() })
    }

    /// Reference count of a heap value.
    #[must_use]
    pub fn ref_count(&self, v: Value) -> Option<u32> {
        let ptr = v.as_ptr()? as *mut HeapObject;
        Some(unsafe { (*ptr).head.rc })
    }

    /// Borrow the bytes of a string object as `&str`.
    #[inline]
    #[must_use]
    pub fn string_value(&self, v: Value) -> Option<&str> {
        if self.type_of(v)? != TYPE_STRING {
            return None;
        }
        let s = unsafe { (*Self::obj(v)).string };
        let bytes = unsafe { std::slice::from_raw_parts(s.ptr, s.len) };
        std::str::from_utf8(bytes).ok()
    }

    /// Borrow list elements.
    #[inline]
    #[must_use]
    pub fn list_items(&self, v: Value) -> &[Value] {
        let l = unsafe { (*Self::obj(v)).list };
        unsafe { std::slice::from_raw_parts(l.ptr, l.len) }
    }

    /// List length.
    #[inline]
    #[must_use]
    pub fn list_len(&self, v: Value) -> usize {
        unsafe { (*Self::obj(v)).list.len }
    }

    /// Overwrite a list element, returning the old value for release.
    pub fn list_set(&mut self, v: Value, idx: usize, item: Value) -> Value {
        let l = unsafe { &mut (*Self::obj(v)).list };
        debug_assert!(idx < l.len);
        unsafe {
            let slot = l.ptr.add(idx);
            let old = *slot;
            *slot = item;
            old
        }
    }

    /// Append to a list, taking ownership of the item reference.
    pub fn list_push(&mut self, v: Value, item: Value) {
        let obj = Self::obj(v);
        unsafe {
            let l = (*obj).list;
            let mut items = ManuallyDrop::new(Vec::from_raw_parts(l.ptr, l.len, l.cap));
            items.push(item);
            (*obj).list.ptr = items.as_mut_ptr();
            (*obj).list.len = items.len();
            (*obj).list.cap = items.capacity();
        }
    }

    /// Reset the list's iterator cursor.
    pub fn list_iter_reset(&mut self, v: Value) {
        unsafe {
            (*Self::obj(v)).list.cursor = 0;
        }
    }

    /// Advance the list's iterator cursor, yielding the next element.
    pub fn list_iter_next(&mut self, v: Value) -> Option<Value> {
        let obj = Self::obj(v);
        unsafe {
            let l = &mut (*obj).list;
            if (l.cursor as usize) < l.len {
                let item = *l.ptr.add(l.cursor as usize);
                l.cursor += 1;
                Some(item)
            } else {
                None
            }
        }
    }

    /// Borrow a map's storage.
    #[inline]
    #[must_use]
    pub fn map_ref(&self, v: Value) -> &ValueMap {
        unsafe { &*(*Self::obj(v)).map.map }
    }

    /// Look up a map entry (borrowed; retain before storing).
    #[must_use]
    pub fn map_get(&self, v: Value, key: &MapKey) -> Option<Value> {
        self.map_ref(v).get(key)
    }

    /// Insert a map entry, releasing any displaced value. Ownership of
    /// `value` (and of an identity key's reference) transfers in.
    pub fn map_insert(&mut self, v: Value, key: MapKey, value: Value) {
        let old = unsafe { (*(*Self::obj(v)).map.map).insert(key, value) };
        if let Some(old) = old {
            self.release(old);
        }
    }

    /// Remove a map entry; ownership of the removed value moves out.
    pub fn map_remove(&mut self, v: Value, key: &MapKey) -> (Option<Value>, bool) {
        let (removed, found) = unsafe { (*(*Self::obj(v)).map.map).remove(key) };
        if found {
            if let Some(obj_key) = key.as_obj_value() {
                self.release(obj_key);
            }
        }
        (removed, found)
    }

    /// Map entry count.
    #[must_use]
    pub fn map_len(&self, v: Value) -> usize {
        self.map_ref(v).len()
    }

    /// Lambda payload `(func_pc, num_params, num_locals)`.
    #[inline]
    #[must_use]
    pub fn lambda_info(&self, v: Value) -> (u32, u8, u8) {
        let l = unsafe { (*Self::obj(v)).lambda };
        (l.func_pc, l.num_params, l.num_locals)
    }

    /// Closure payload `(func_pc, num_params, num_captured, num_locals)`.
    #[inline]
    #[must_use]
    pub fn closure_info(&self, v: Value) -> (u32, u8, u8, u8) {
        let c = unsafe { (*Self::obj(v)).closure };
        (c.func_pc, c.num_params, c.num_captured, c.num_locals)
    }

    /// Visit each captured value in declaration order, resolving the
    /// spill list when present.
    pub fn for_each_capture(&self, v: Value, mut f: impl FnMut(Value)) {
        let c = unsafe { (*Self::obj(v)).closure };
        if c.flags & CAPTURE_SPILLED != 0 {
            for item in self.list_items(c.captures[0]) {
                f(*item);
            }
        } else {
            for i in 0..(c.num_captured as usize) {
                f(c.captures[i]);
            }
        }
    }

    /// Read a small-object field.
    #[inline]
    #[must_use]
    pub fn object_field(&self, v: Value, idx: usize) -> Value {
        debug_assert!(idx < SMALL_OBJECT_FIELDS);
        unsafe { (*Self::obj(v)).object.fields[idx] }
    }

    /// Overwrite a small-object field, returning the old value.
    pub fn object_set_field(&mut self, v: Value, idx: usize, value: Value) -> Value {
        debug_assert!(idx < SMALL_OBJECT_FIELDS);
        unsafe {
            let field = &mut (*Self::obj(v)).object.fields[idx];
            let old = *field;
            *field = value;
            old
        }
    }

    // =========================================================================
    // Introspection (tests and the cycle sweep)
    // =========================================================================

    /// Pointers to every live slot (sentinels and free slots excluded).
    #[must_use]
    pub fn live_objects(&self) -> Vec<*mut HeapObject> {
        let mut out = Vec::new();
        for page in &self.pages {
            for (i, slot) in page.slots.iter().enumerate() {
                let id = slot.type_id();
                if i == 0 || id == NULL_ID || id == TYPE_SENTINEL {
                    continue;
                }
                out.push(slot as *const HeapObject as *mut HeapObject);
            }
        }
        out
    }

    /// Number of live objects.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.live_objects().len()
    }

    /// Sum of live reference counts.
    #[must_use]
    pub fn live_refs(&self) -> u64 {
        self.live_objects()
            .iter()
            .map(|&o| unsafe { (*o).head.rc } as u64)
            .sum()
    }

    /// Number of spans on the free list. Panics if the list loops.
    #[must_use]
    pub fn free_span_count(&self) -> usize {
        let mut count = 0;
        let mut cur = self.free_head;
        let limit = self.pages.len() * PAGE_SLOTS + 1;
        while !cur.is_null() {
            count += 1;
            assert!(count <= limit, "free list loop");
            cur = unsafe { (*cur).free_span.next };
        }
        count
    }

    /// Total free slots reachable from the free list.
    #[must_use]
    pub fn free_slot_count(&self) -> usize {
        let mut total = 0;
        let mut cur = self.free_head;
        let limit = self.pages.len() * PAGE_SLOTS + 1;
        let mut steps = 0;
        while !cur.is_null() {
            total += unsafe { (*cur).free_span.len } as usize;
            steps += 1;
            assert!(steps <= limit, "free list loop");
            cur = unsafe { (*cur).free_span.next };
        }
        total
    }

    /// True when a pointer addresses a slot in some page.
    #[must_use]
    pub fn contains(&self, obj: *const HeapObject) -> bool {
        self.pages.iter().any(|p| {
            let base = p.base_const();
            let end = unsafe { base.add(PAGE_SLOTS) };
            obj >= base && obj < end
        })
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Heap {
    /// Free all pages unconditionally. Still-live reference counts are
    /// ignored (leak detection is `check_memory`'s job), but owned
    /// side buffers are reclaimed so the process does not leak.
    fn drop(&mut self) {
        for page in &mut self.pages {
            for i in 1..PAGE_SLOTS {
                let slot = &mut page.slots[i];
                let id = slot.type_id();
                if id == NULL_ID || id == TYPE_SENTINEL {
                    continue;
                }
                unsafe {
                    match id {
                        TYPE_LIST => {
                            let l = slot.list;
                            drop(Vec::from_raw_parts(l.ptr, l.len, l.cap));
                        }
                        TYPE_MAP => {
                            drop(Box::from_raw(slot.map.map));
                        }
                        TYPE_STRING => {
                            let s = slot.string;
                            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(s.ptr, s.len)));
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_heap_has_one_page_one_span() {
        let heap = Heap::new();
        assert_eq!(heap.page_count(), 1);
        assert_eq!(heap.free_span_count(), 1);
        assert_eq!(heap.free_slot_count(), PAGE_SLOTS - 1);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_alloc_free_lifo_reuse() {
        let mut heap = Heap::new();
        let a = heap.alloc_object().unwrap();
        unsafe {
            (*a).lambda = Lambda {
                type_id: TYPE_LAMBDA,
                rc: 1,
                func_pc: 0,
                num_params: 0,
                num_locals: 0,
            };
        }
        heap.free_object(a);
        let b = heap.alloc_object().unwrap();
        assert_eq!(a, b, "single-slot hole is reused LIFO");
        heap.free_object(b);
    }

    #[test]
    fn test_left_coalescing_merges_spans() {
        let mut heap = Heap::new();
        let objs: Vec<_> = (0..4).map(|_| heap.alloc_object().unwrap()).collect();
        for &o in &objs {
            unsafe {
                (*o).lambda = Lambda {
                    type_id: TYPE_LAMBDA,
                    rc: 1,
                    func_pc: 0,
                    num_params: 0,
                    num_locals: 0,
                };
            }
        }
        let spans_before = heap.free_span_count();
        // Freeing left-to-right: each free lands next to the previous
        // one and merges into it.
        for &o in &objs {
            heap.free_object(o);
        }
        assert_eq!(heap.free_span_count(), spans_before + 1);
        assert_eq!(heap.free_slot_count(), PAGE_SLOTS - 1);
    }

    #[test]
    fn test_free_list_is_loop_free_under_churn() {
        let mut heap = Heap::new();
        let mut held = Vec::new();
        for round in 0..8 {
            for _ in 0..50 {
                let o = heap.alloc_object().unwrap();
                unsafe {
                    (*o).lambda = Lambda {
                        type_id: TYPE_LAMBDA,
                        rc: 1,
                        func_pc: 0,
                        num_params: 0,
                        num_locals: 0,
                    };
                }
                held.push(o);
            }
            // Free every other object to fragment the page.
            let mut keep = Vec::new();
            for (i, o) in held.drain(..).enumerate() {
                if i % 2 == round % 2 {
                    heap.free_object(o);
                } else {
                    keep.push(o);
                }
            }
            held = keep;
            // Walks panic on a loop.
            let _ = heap.free_span_count();
        }
        for o in held {
            heap.free_object(o);
        }
        let _ = heap.free_span_count();
    }

    #[test]
    fn test_page_growth_factor() {
        let mut heap = Heap::new();
        let mut vals = Vec::new();
        // Exhaust the first page.
        for _ in 0..(PAGE_SLOTS - 1) {
            vals.push(heap.alloc_lambda(0, 0, 0).unwrap());
        }
        assert_eq!(heap.page_count(), 1);
        vals.push(heap.alloc_lambda(0, 0, 0).unwrap());
        // ceil(1 * 1.5) = 2 new pages.
        assert_eq!(heap.page_count(), 3);
        for v in vals {
            heap.release(v);
        }
    }

    #[test]
    fn test_out_of_memory_with_page_cap() {
        let mut heap = Heap::new();
        heap.set_max_pages(1);
        let mut vals = Vec::new();
        for _ in 0..(PAGE_SLOTS - 1) {
            vals.push(heap.alloc_lambda(0, 0, 0).unwrap());
        }
        assert_eq!(heap.alloc_object().unwrap_err(), VmError::OutOfMemory);
        for v in vals {
            heap.release(v);
        }
    }

    #[test]
    fn test_string_roundtrip_and_release() {
        let mut heap = Heap::new();
        let v = heap.alloc_string("hello heap").unwrap();
        assert_eq!(heap.type_of(v), Some(TYPE_STRING));
        assert_eq!(heap.string_value(v), Some("hello heap"));
        assert_eq!(heap.ref_count(v), Some(1));
        heap.release(v);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_list_release_releases_children() {
        let mut heap = Heap::new();
        let s = heap.alloc_string("child").unwrap();
        let list = heap.alloc_list(vec![s, Value::float(1.0)]).unwrap();
        assert_eq!(heap.live_count(), 2);
        heap.release(list);
        assert_eq!(heap.live_count(), 0);
        assert_eq!(heap.free_slot_count(), PAGE_SLOTS - 1);
    }

    #[test]
    fn test_retained_child_survives_parent() {
        let mut heap = Heap::new();
        let s = heap.alloc_string("kept").unwrap();
        heap.retain(s);
        let list = heap.alloc_list(vec![s]).unwrap();
        heap.release(list);
        assert_eq!(heap.string_value(s), Some("kept"));
        heap.release(s);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_list_push_and_iterate() {
        let mut heap = Heap::new();
        let list = heap.alloc_list(Vec::new()).unwrap();
        for i in 0..5 {
            heap.list_push(list, Value::float(f64::from(i)));
        }
        assert_eq!(heap.list_len(list), 5);
        heap.list_iter_reset(list);
        let mut got = Vec::new();
        while let Some(v) = heap.list_iter_next(list) {
            got.push(v.as_f64());
        }
        assert_eq!(got, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        heap.release(list);
    }

    #[test]
    fn test_map_insert_get_remove() {
        let mut heap = Heap::new();
        let map = heap.alloc_map().unwrap();
        let s = heap.alloc_string("v").unwrap();
        heap.map_insert(map, MapKey::str("k"), s);
        assert_eq!(heap.map_len(map), 1);
        assert_eq!(heap.map_get(map, &MapKey::str("k")), Some(s));
        let (removed, found) = heap.map_remove(map, &MapKey::str("k"));
        assert!(found);
        heap.release(removed.unwrap());
        heap.release(map);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_map_insert_displaces_and_releases() {
        let mut heap = Heap::new();
        let map = heap.alloc_map().unwrap();
        let a = heap.alloc_string("a").unwrap();
        let b = heap.alloc_string("b").unwrap();
        heap.map_insert(map, MapKey::num(1.0), a);
        heap.map_insert(map, MapKey::num(1.0), b);
        // `a` was displaced and released.
        assert_eq!(heap.live_count(), 2);
        heap.release(map);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_closure_inline_captures_released() {
        let mut heap = Heap::new();
        let s = heap.alloc_string("cap").unwrap();
        let c = heap.alloc_closure(10, 1, 2, &[s, Value::float(3.0)]).unwrap();
        let (pc, params, caps, locals) = heap.closure_info(c);
        assert_eq!((pc, params, caps, locals), (10, 1, 2, 2));
        heap.release(c);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_closure_capture_spill_beyond_three() {
        let mut heap = Heap::new();
        let caps: Vec<Value> = (0..5).map(|i| Value::float(f64::from(i))).collect();
        let c = heap.alloc_closure(0, 0, 0, &caps).unwrap();
        let (_, _, num_caps, _) = heap.closure_info(c);
        assert_eq!(num_caps, 5);
        let mut seen = Vec::new();
        heap.for_each_capture(c, |v| seen.push(v.as_f64()));
        assert_eq!(seen, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        // Closure + spill list.
        assert_eq!(heap.live_count(), 2);
        heap.release(c);
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn test_trace_counters_balance() {
        let mut heap = Heap::new();
        heap.set_trace(true);
        // Allocation books the initial reference as a retain.
        let s = heap.alloc_string("x").unwrap();
        heap.retain(s);
        assert_eq!(heap.trace_stats().num_retains, 2);
        heap.release(s);
        heap.release(s);
        let stats = heap.trace_stats();
        assert_eq!(stats.num_retains, stats.num_releases + heap.live_refs());
        assert_eq!(heap.live_refs(), 0);
    }

    #[test]
    fn test_drop_reclaims_live_buffers() {
        // No assertion: run under the leak checker / miri to verify the
        // wholesale Drop path frees owned buffers of leaked objects.
        let mut heap = Heap::new();
        let s = heap.alloc_string("leaked on purpose").unwrap();
        let _list = heap.alloc_list(vec![s]).unwrap();
        drop(heap);
    }
}
