//! Uniform heap object slots.
//!
//! Every heap object occupies exactly one 40-byte slot. The slot is a
//! tagged union whose first field is always a 32-bit type id, so any
//! reader can branch on object kind without knowing the variant. Free
//! slots reuse the same layout as [`FreeSpan`] records with
//! `type_id == NULL_ID`.

use crate::map::ValueMap;
use opal_core::{Value, NULL_ID};

/// Integer type identifier. The first five ids are reserved for the
/// built-in kinds; user struct types start at [`FIRST_USER_TYPE`].
pub type TypeId = u32;

/// Built-in list kind.
pub const TYPE_LIST: TypeId = 0;
/// Built-in map kind.
pub const TYPE_MAP: TypeId = 1;
/// Built-in closure kind.
pub const TYPE_CLOSURE: TypeId = 2;
/// Built-in lambda kind.
pub const TYPE_LAMBDA: TypeId = 3;
/// Built-in string kind.
pub const TYPE_STRING: TypeId = 4;
/// First id available for user struct types.
pub const FIRST_USER_TYPE: TypeId = 5;
/// Type id of the permanently reserved slot 0 of every page. Non-null
/// so a backwards probe from any slot never misreads it as free.
pub const TYPE_SENTINEL: TypeId = NULL_ID - 1;

/// Number of inline field slots in a small object.
pub const SMALL_OBJECT_FIELDS: usize = 4;
/// Number of captured values a closure stores inline.
pub const MAX_INLINE_CAPTURES: usize = 3;
/// Closure flag: captures beyond [`MAX_INLINE_CAPTURES`] spilled into a
/// heap list referenced from inline capture slot 0.
pub const CAPTURE_SPILLED: u8 = 1;

/// Common prefix of every slot variant.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Head {
    /// Object kind; `NULL_ID` marks a free slot.
    pub type_id: TypeId,
    /// Reference count. Live objects always have `rc >= 1`.
    pub rc: u32,
}

/// A span of consecutive free slots.
///
/// The span header lives in the first slot; the last slot of the span
/// carries a back-pointer (`start`) to the header so freeing the slot
/// to the right of a span coalesces in O(1). A length-1 span is its
/// own header and tail.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct FreeSpan {
    /// Always `NULL_ID`.
    pub type_id: TypeId,
    /// Number of consecutive free slots (valid in the header).
    pub len: u32,
    /// Back-pointer to the span header (valid in the tail).
    pub start: *mut HeapObject,
    /// Next span in the allocator's free list (valid in the header).
    pub next: *mut HeapObject,
}

/// List payload: raw parts of a `Vec<Value>` plus the iteration cursor
/// the `iterator`/`next` protocol advances.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct ListInner {
    /// Always [`TYPE_LIST`].
    pub type_id: TypeId,
    /// Reference count.
    pub rc: u32,
    /// Element buffer.
    pub ptr: *mut Value,
    /// Live element count.
    pub len: usize,
    /// Buffer capacity.
    pub cap: usize,
    /// Iterator cursor (index of the next element to yield).
    pub cursor: u32,
}

/// Map payload: a boxed [`ValueMap`].
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct MapInner {
    /// Always [`TYPE_MAP`].
    pub type_id: TypeId,
    /// Reference count.
    pub rc: u32,
    /// Owned map storage.
    pub map: *mut ValueMap,
}

/// String payload: an owned UTF-8 byte buffer.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct StringInner {
    /// Always [`TYPE_STRING`].
    pub type_id: TypeId,
    /// Reference count.
    pub rc: u32,
    /// Byte buffer (raw parts of a `Box<[u8]>`).
    pub ptr: *mut u8,
    /// Byte length.
    pub len: usize,
}

/// Lambda payload: a function entry with no captured environment.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Lambda {
    /// Always [`TYPE_LAMBDA`].
    pub type_id: TypeId,
    /// Reference count.
    pub rc: u32,
    /// Entry pc of the function body.
    pub func_pc: u32,
    /// Declared parameter count.
    pub num_params: u8,
    /// Local slot count the body needs.
    pub num_locals: u8,
}

/// Closure payload: a function entry plus captured values.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Closure {
    /// Always [`TYPE_CLOSURE`].
    pub type_id: TypeId,
    /// Reference count.
    pub rc: u32,
    /// Entry pc of the function body.
    pub func_pc: u32,
    /// Declared parameter count.
    pub num_params: u8,
    /// Captured value count.
    pub num_captured: u8,
    /// Local slot count the body needs.
    pub num_locals: u8,
    /// [`CAPTURE_SPILLED`] when captures live in a heap list.
    pub flags: u8,
    /// Inline captures; with the spill flag set, slot 0 holds the list.
    pub captures: [Value; MAX_INLINE_CAPTURES],
}

/// User-defined record with up to four inline fields.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SmallObject {
    /// The user type id (>= [`FIRST_USER_TYPE`]).
    pub type_id: TypeId,
    /// Reference count.
    pub rc: u32,
    /// Inline field storage; unused fields hold `none`.
    pub fields: [Value; SMALL_OBJECT_FIELDS],
}

/// One heap slot. Exactly 40 bytes; see the module docs.
#[derive(Clone, Copy)]
#[repr(C)]
pub union HeapObject {
    /// Kind-independent prefix.
    pub head: Head,
    /// Free-slot record.
    pub free_span: FreeSpan,
    /// List variant.
    pub list: ListInner,
    /// Map variant.
    pub map: MapInner,
    /// String variant.
    pub string: StringInner,
    /// Lambda variant.
    pub lambda: Lambda,
    /// Closure variant.
    pub closure: Closure,
    /// Small object variant.
    pub object: SmallObject,
}

impl HeapObject {
    /// A free-slot record not yet linked into any span.
    #[inline]
    #[must_use]
    pub fn free() -> Self {
        HeapObject {
            free_span: FreeSpan {
                type_id: NULL_ID,
                len: 0,
                start: std::ptr::null_mut(),
                next: std::ptr::null_mut(),
            },
        }
    }

    /// Read the type id. Valid for every variant by layout.
    #[inline]
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        // The type id is the first field of every variant.
        unsafe { self.head.type_id }
    }

    /// True for free slots.
    #[inline]
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.type_id() == NULL_ID
    }
}

impl std::fmt::Debug for HeapObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.type_id() {
            NULL_ID => write!(f, "HeapObject(free)"),
            TYPE_SENTINEL => write!(f, "HeapObject(sentinel)"),
            id => write!(f, "HeapObject(type={id}, rc={})", unsafe { self.head.rc }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_is_40_bytes() {
        assert_eq!(std::mem::size_of::<HeapObject>(), 40);
        assert_eq!(std::mem::align_of::<HeapObject>(), 8);
    }

    #[test]
    fn test_variants_fit_the_slot() {
        assert!(std::mem::size_of::<FreeSpan>() <= 40);
        assert!(std::mem::size_of::<ListInner>() <= 40);
        assert!(std::mem::size_of::<MapInner>() <= 40);
        assert!(std::mem::size_of::<StringInner>() <= 40);
        assert!(std::mem::size_of::<Lambda>() <= 40);
        assert_eq!(std::mem::size_of::<Closure>(), 40);
        assert_eq!(std::mem::size_of::<SmallObject>(), 40);
    }

    #[test]
    fn test_type_id_aliases_every_variant() {
        let mut slot = HeapObject::free();
        assert!(slot.is_free());

        slot.lambda = Lambda {
            type_id: TYPE_LAMBDA,
            rc: 1,
            func_pc: 10,
            num_params: 2,
            num_locals: 3,
        };
        assert_eq!(slot.type_id(), TYPE_LAMBDA);
        assert!(!slot.is_free());
    }

    #[test]
    fn test_reserved_ids_do_not_collide() {
        assert!(TYPE_SENTINEL != NULL_ID);
        for id in [TYPE_LIST, TYPE_MAP, TYPE_CLOSURE, TYPE_LAMBDA, TYPE_STRING] {
            assert!(id < FIRST_USER_TYPE);
            assert!(id != TYPE_SENTINEL && id != NULL_ID);
        }
    }
}
