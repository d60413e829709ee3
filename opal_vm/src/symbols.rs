//! Symbol registries and the method dispatch cache.
//!
//! Three parallel tables keyed by name: free functions, fields, and
//! methods. Field and method symbols carry an inline cache that
//! progresses empty → one-type → many-types, mirroring the classic
//! inline-cache ladder: a monomorphic site dispatches on a single
//! cached type, and the first second type promotes the site to a
//! polymorphic shape with an MRU entry in front of the full
//! `(type, symbol)` side table.

use crate::vm::Vm;
use opal_core::Value;
use opal_heap::TypeId;
use rustc_hash::FxHashMap;

/// Function symbol id.
pub type FuncId = u32;
/// Field symbol id.
pub type FieldId = u32;
/// Method symbol id.
pub type MethodId = u32;

/// Reserved method id the compiler resolves `iterator()` calls to.
pub const METHOD_ITERATOR: MethodId = 0;
/// Reserved method id the compiler resolves `next()` calls to.
pub const METHOD_NEXT: MethodId = 1;

/// Native free function. Arguments transfer ownership to the callee:
/// it releases what it does not return.
pub type NativeFunc = fn(&mut Vm, &[Value]) -> Value;
/// Native method with one return value. Receiver and arguments
/// transfer ownership to the callee.
pub type NativeMethod1 = fn(&mut Vm, Value, &[Value]) -> Value;
/// Native method with two return values (methods only).
pub type NativeMethod2 = fn(&mut Vm, Value, &[Value]) -> (Value, Value);

/// A registered free function.
#[derive(Clone, Copy)]
pub enum FuncSymbol {
    /// Declared but not yet bound.
    None,
    /// Host-native function.
    Native(NativeFunc),
    /// User function compiled to bytecode.
    User {
        /// Entry pc.
        pc: u32,
        /// Local slot count past the arguments.
        num_locals: u32,
    },
}

impl std::fmt::Debug for FuncSymbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FuncSymbol::None => write!(f, "FuncSymbol::None"),
            FuncSymbol::Native(_) => write!(f, "FuncSymbol::Native"),
            FuncSymbol::User { pc, num_locals } => {
                write!(f, "FuncSymbol::User(pc={pc}, locals={num_locals})")
            }
        }
    }
}

/// Type descriptor. Ids index [`Symbols::types`]; the first five are
/// reserved for the built-in kinds.
#[derive(Debug, Clone)]
pub struct TypeDesc {
    /// Display name.
    pub name: String,
    /// Declared field count (small objects: at most 4).
    pub num_fields: u32,
}

/// Field symbol cache shape. Progresses the same ladder as
/// [`MethodShape`]: empty → one-type → many-types with an MRU entry in
/// front of the `(type, field)` side table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldShape {
    /// Never bound to a type.
    Empty,
    /// Monomorphic: a direct index into the cached type's inline slots.
    OneType {
        /// The cached receiver type.
        type_id: TypeId,
        /// Inline slot index.
        field_idx: u8,
    },
    /// Polymorphic: the most recent receiver type in front of the side
    /// table.
    ManyTypes {
        /// Most recently resolved receiver type.
        mru_type_id: TypeId,
        /// Its inline slot index.
        mru_field_idx: u8,
    },
}

/// A registered field name.
#[derive(Debug, Clone)]
pub struct FieldSymbol {
    /// Field name, used for map-by-name fallback.
    pub name: String,
    /// Cache shape.
    pub shape: FieldShape,
}

/// Where a method dispatch lands.
#[derive(Clone, Copy)]
pub enum MethodEntry {
    /// User function compiled to bytecode.
    User {
        /// Entry pc.
        pc: u32,
        /// Local slot count past the arguments.
        num_locals: u32,
    },
    /// Native method, one return value.
    Native1(NativeMethod1),
    /// Native method, two return values.
    Native2(NativeMethod2),
}

impl std::fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodEntry::User { pc, num_locals } => {
                write!(f, "MethodEntry::User(pc={pc}, locals={num_locals})")
            }
            MethodEntry::Native1(_) => write!(f, "MethodEntry::Native1"),
            MethodEntry::Native2(_) => write!(f, "MethodEntry::Native2"),
        }
    }
}

/// Method symbol cache shape.
#[derive(Debug, Clone, Copy)]
pub enum MethodShape {
    /// No implementation registered.
    Empty,
    /// Monomorphic: exactly one implementing type.
    OneType {
        /// The implementing type.
        type_id: TypeId,
        /// Its entry.
        entry: MethodEntry,
    },
    /// Polymorphic: the most recent receiver type in front of the side
    /// table.
    ManyTypes {
        /// Most recently dispatched receiver type.
        mru_type_id: TypeId,
        /// Its entry.
        mru_entry: MethodEntry,
    },
}

/// A registered method name.
#[derive(Debug, Clone)]
pub struct MethodSymbol {
    /// Method name, used for map-by-name fallback and panic messages.
    pub name: String,
    /// Cache shape.
    pub shape: MethodShape,
}

/// All symbol state of one VM instance.
pub struct Symbols {
    /// Free function symbols by id.
    pub func_syms: Vec<FuncSymbol>,
    /// Identifier to function-symbol id.
    pub globals: FxHashMap<String, FuncId>,
    /// Field symbols by id.
    pub field_syms: Vec<FieldSymbol>,
    field_ids: FxHashMap<String, FieldId>,
    /// Method symbols by id.
    pub method_syms: Vec<MethodSymbol>,
    method_ids: FxHashMap<String, MethodId>,
    /// Full polymorphic mapping behind `ManyTypes` method symbols.
    pub method_table: FxHashMap<(TypeId, MethodId), MethodEntry>,
    /// Full polymorphic mapping behind `ManyTypes` field symbols.
    pub field_table: FxHashMap<(TypeId, FieldId), u8>,
    /// Type descriptors by id.
    pub types: Vec<TypeDesc>,
}

/// Initial method-table bucket reservation.
const METHOD_TABLE_BUCKETS: usize = 512;

impl Symbols {
    /// Create the registries with the built-in types installed.
    #[must_use]
    pub fn new() -> Self {
        let types = ["List", "Map", "Closure", "Lambda", "String"]
            .iter()
            .map(|name| TypeDesc {
                name: (*name).to_owned(),
                num_fields: 0,
            })
            .collect();
        Symbols {
            func_syms: Vec::new(),
            globals: FxHashMap::default(),
            field_syms: Vec::new(),
            field_ids: FxHashMap::default(),
            method_syms: Vec::new(),
            method_ids: FxHashMap::default(),
            method_table: FxHashMap::with_capacity_and_hasher(
                METHOD_TABLE_BUCKETS,
                Default::default(),
            ),
            field_table: FxHashMap::default(),
            types,
        }
    }

    // =========================================================================
    // Types
    // =========================================================================

    /// Register a user type, returning its id.
    pub fn add_type(&mut self, name: impl Into<String>, num_fields: u32) -> TypeId {
        let id = self.types.len() as TypeId;
        self.types.push(TypeDesc {
            name: name.into(),
            num_fields,
        });
        id
    }

    /// Display name for a type id.
    #[must_use]
    pub fn type_name(&self, id: TypeId) -> &str {
        self.types
            .get(id as usize)
            .map(|t| t.name.as_str())
            .unwrap_or("(unknown)")
    }

    // =========================================================================
    // Function Symbols
    // =========================================================================

    /// Get or create the function symbol for an identifier.
    pub fn ensure_func_sym(&mut self, name: &str) -> FuncId {
        if let Some(&id) = self.globals.get(name) {
            return id;
        }
        let id = self.func_syms.len() as FuncId;
        self.func_syms.push(FuncSymbol::None);
        self.globals.insert(name.to_owned(), id);
        id
    }

    /// Bind a function symbol.
    pub fn set_func_sym(&mut self, id: FuncId, sym: FuncSymbol) {
        self.func_syms[id as usize] = sym;
    }

    /// Identifier bound to a function symbol (panic messages only; this
    /// walks the globals map).
    #[must_use]
    pub fn func_name(&self, id: FuncId) -> &str {
        self.globals
            .iter()
            .find(|(_, &v)| v == id)
            .map(|(k, _)| k.as_str())
            .unwrap_or("(unknown)")
    }

    // =========================================================================
    // Field Symbols
    // =========================================================================

    /// Get or create the field symbol for a name.
    pub fn ensure_field_sym(&mut self, name: &str) -> FieldId {
        if let Some(&id) = self.field_ids.get(name) {
            return id;
        }
        let id = self.field_syms.len() as FieldId;
        self.field_syms.push(FieldSymbol {
            name: name.to_owned(),
            shape: FieldShape::Empty,
        });
        self.field_ids.insert(name.to_owned(), id);
        id
    }

    /// Bind a field placement for a type, promoting the cache shape.
    ///
    /// empty → one-type on first registration; one-type → many-types on
    /// the second distinct type (the original placement moves into the
    /// side table); many-types stays.
    pub fn add_field_sym(&mut self, id: FieldId, type_id: TypeId, field_idx: u8) {
        let sym = &mut self.field_syms[id as usize];
        match sym.shape {
            FieldShape::Empty => {
                sym.shape = FieldShape::OneType { type_id, field_idx };
            }
            FieldShape::OneType {
                type_id: cached,
                field_idx: cached_idx,
            } => {
                if cached == type_id {
                    sym.shape = FieldShape::OneType { type_id, field_idx };
                } else {
                    self.field_table.insert((cached, id), cached_idx);
                    self.field_table.insert((type_id, id), field_idx);
                    sym.shape = FieldShape::ManyTypes {
                        mru_type_id: type_id,
                        mru_field_idx: field_idx,
                    };
                }
            }
            FieldShape::ManyTypes { .. } => {
                self.field_table.insert((type_id, id), field_idx);
            }
        }
    }

    /// Resolve a field placement for a receiver type, updating the MRU
    /// entry on a side-table hit. `None` means the dispatch misses and
    /// the caller applies its fallback (map-by-name, then panic).
    pub fn resolve_field(&mut self, type_id: TypeId, id: FieldId) -> Option<u8> {
        let sym = self.field_syms.get_mut(id as usize)?;
        match sym.shape {
            FieldShape::Empty => None,
            FieldShape::OneType {
                type_id: cached,
                field_idx,
            } => {
                if cached == type_id {
                    Some(field_idx)
                } else {
                    None
                }
            }
            FieldShape::ManyTypes {
                mru_type_id,
                mru_field_idx,
            } => {
                if mru_type_id == type_id {
                    Some(mru_field_idx)
                } else {
                    let field_idx = self.field_table.get(&(type_id, id)).copied()?;
                    sym.shape = FieldShape::ManyTypes {
                        mru_type_id: type_id,
                        mru_field_idx: field_idx,
                    };
                    Some(field_idx)
                }
            }
        }
    }

    // =========================================================================
    // Method Symbols
    // =========================================================================

    /// Get or create the method symbol for a name.
    pub fn ensure_method_sym(&mut self, name: &str) -> MethodId {
        if let Some(&id) = self.method_ids.get(name) {
            return id;
        }
        let id = self.method_syms.len() as MethodId;
        self.method_syms.push(MethodSymbol {
            name: name.to_owned(),
            shape: MethodShape::Empty,
        });
        self.method_ids.insert(name.to_owned(), id);
        id
    }

    /// Register a method implementation, promoting the cache shape.
    ///
    /// empty → one-type on first registration; one-type → many-types on
    /// the second distinct type (the original entry moves into the side
    /// table); many-types stays.
    pub fn add_method_sym(&mut self, id: MethodId, type_id: TypeId, entry: MethodEntry) {
        let sym = &mut self.method_syms[id as usize];
        match sym.shape {
            MethodShape::Empty => {
                sym.shape = MethodShape::OneType { type_id, entry };
            }
            MethodShape::OneType {
                type_id: cached,
                entry: cached_entry,
            } => {
                if cached == type_id {
                    sym.shape = MethodShape::OneType { type_id, entry };
                } else {
                    self.method_table.insert((cached, id), cached_entry);
                    self.method_table.insert((type_id, id), entry);
                    sym.shape = MethodShape::ManyTypes {
                        mru_type_id: type_id,
                        mru_entry: entry,
                    };
                }
            }
            MethodShape::ManyTypes { .. } => {
                self.method_table.insert((type_id, id), entry);
            }
        }
    }

    /// Resolve a method for a receiver type, updating the MRU entry on
    /// a side-table hit. `None` means the dispatch misses and the
    /// caller applies its fallback (map-by-name, then panic).
    pub fn resolve_method(&mut self, type_id: TypeId, id: MethodId) -> Option<MethodEntry> {
        let sym = self.method_syms.get_mut(id as usize)?;
        match sym.shape {
            MethodShape::Empty => None,
            MethodShape::OneType {
                type_id: cached,
                entry,
            } => {
                if cached == type_id {
                    Some(entry)
                } else {
                    None
                }
            }
            MethodShape::ManyTypes {
                mru_type_id,
                mru_entry,
            } => {
                if mru_type_id == type_id {
                    Some(mru_entry)
                } else {
                    let entry = self.method_table.get(&(type_id, id)).copied()?;
                    sym.shape = MethodShape::ManyTypes {
                        mru_type_id: type_id,
                        mru_entry: entry,
                    };
                    Some(entry)
                }
            }
        }
    }

    /// Method name for panic messages.
    #[must_use]
    pub fn method_name(&self, id: MethodId) -> &str {
        self.method_syms
            .get(id as usize)
            .map(|s| s.name.as_str())
            .unwrap_or("(unknown)")
    }
}

impl Default for Symbols {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opal_heap::{FIRST_USER_TYPE, TYPE_LIST, TYPE_MAP};

    fn user(pc: u32) -> MethodEntry {
        MethodEntry::User { pc, num_locals: 0 }
    }

    #[test]
    fn test_builtin_types_reserved() {
        let syms = Symbols::new();
        assert_eq!(syms.types.len() as u32, FIRST_USER_TYPE);
        assert_eq!(syms.type_name(TYPE_LIST), "List");
        assert_eq!(syms.type_name(TYPE_MAP), "Map");
    }

    #[test]
    fn test_func_sym_identity() {
        let mut syms = Symbols::new();
        let a = syms.ensure_func_sym("foo");
        let b = syms.ensure_func_sym("foo");
        let c = syms.ensure_func_sym("bar");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_method_promotion_empty_to_one_type() {
        let mut syms = Symbols::new();
        let m = syms.ensure_method_sym("m");
        assert!(matches!(syms.method_syms[m as usize].shape, MethodShape::Empty));

        syms.add_method_sym(m, 7, user(100));
        assert!(matches!(
            syms.method_syms[m as usize].shape,
            MethodShape::OneType { type_id: 7, .. }
        ));
        // One-type shape keeps the table empty.
        assert!(syms.method_table.is_empty());
    }

    #[test]
    fn test_method_promotion_to_many_types_populates_table() {
        let mut syms = Symbols::new();
        let m = syms.ensure_method_sym("m");
        syms.add_method_sym(m, 7, user(100));
        syms.add_method_sym(m, 9, user(200));

        assert!(matches!(
            syms.method_syms[m as usize].shape,
            MethodShape::ManyTypes { mru_type_id: 9, .. }
        ));
        assert!(syms.method_table.contains_key(&(7, m)));
        assert!(syms.method_table.contains_key(&(9, m)));
    }

    #[test]
    fn test_mru_flips_on_alternating_dispatch() {
        let mut syms = Symbols::new();
        let m = syms.ensure_method_sym("m");
        syms.add_method_sym(m, 7, user(100));
        syms.add_method_sym(m, 9, user(200));

        for i in 0..10 {
            let ty = if i % 2 == 0 { 7 } else { 9 };
            assert!(syms.resolve_method(ty, m).is_some());
            match syms.method_syms[m as usize].shape {
                MethodShape::ManyTypes { mru_type_id, .. } => assert_eq!(mru_type_id, ty),
                _ => panic!("expected many-types shape"),
            }
        }
    }

    #[test]
    fn test_one_type_mismatch_misses() {
        let mut syms = Symbols::new();
        let m = syms.ensure_method_sym("m");
        syms.add_method_sym(m, 7, user(100));
        assert!(syms.resolve_method(7, m).is_some());
        assert!(syms.resolve_method(8, m).is_none());
    }

    #[test]
    fn test_rebinding_same_type_stays_one_type() {
        let mut syms = Symbols::new();
        let m = syms.ensure_method_sym("m");
        syms.add_method_sym(m, 7, user(100));
        syms.add_method_sym(m, 7, user(300));
        assert!(matches!(
            syms.method_syms[m as usize].shape,
            MethodShape::OneType { type_id: 7, .. }
        ));
        match syms.resolve_method(7, m) {
            Some(MethodEntry::User { pc, .. }) => assert_eq!(pc, 300),
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn test_field_promotion_and_side_table() {
        let mut syms = Symbols::new();
        let f = syms.ensure_field_sym("x");
        assert!(matches!(syms.field_syms[f as usize].shape, FieldShape::Empty));

        syms.add_field_sym(f, 7, 0);
        assert!(matches!(
            syms.field_syms[f as usize].shape,
            FieldShape::OneType { type_id: 7, .. }
        ));
        assert!(syms.field_table.is_empty());

        syms.add_field_sym(f, 9, 2);
        assert!(matches!(
            syms.field_syms[f as usize].shape,
            FieldShape::ManyTypes { mru_type_id: 9, .. }
        ));
        assert!(syms.field_table.contains_key(&(7, f)));
        assert!(syms.field_table.contains_key(&(9, f)));

        assert_eq!(syms.resolve_field(7, f), Some(0));
        assert_eq!(syms.resolve_field(9, f), Some(2));
        assert_eq!(syms.resolve_field(11, f), None);
    }

    #[test]
    fn test_field_mru_flips_on_alternating_resolution() {
        let mut syms = Symbols::new();
        let f = syms.ensure_field_sym("x");
        syms.add_field_sym(f, 7, 0);
        syms.add_field_sym(f, 9, 2);

        for i in 0..6 {
            let ty = if i % 2 == 0 { 7 } else { 9 };
            assert!(syms.resolve_field(ty, f).is_some());
            match syms.field_syms[f as usize].shape {
                FieldShape::ManyTypes { mru_type_id, .. } => assert_eq!(mru_type_id, ty),
                ref other => panic!("expected many-types shape, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_field_one_type_mismatch_misses() {
        let mut syms = Symbols::new();
        let f = syms.ensure_field_sym("x");
        syms.add_field_sym(f, 7, 0);
        assert_eq!(syms.resolve_field(7, f), Some(0));
        assert_eq!(syms.resolve_field(8, f), None);
    }
}
