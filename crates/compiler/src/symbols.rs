//! Symbol table
//!
//! A stack of scopes with the three C namespaces: ordinary identifiers,
//! struct/union/enum tags, and labels. Labels are function-scoped — a label
//! defined anywhere in a function body is visible throughout it, and `goto`
//! may reference a label before its definition; unresolved labels surface
//! when the function scope is popped.
//!
//! Shadowing across scopes is permitted; redefinition inside one scope is
//! the analyzer's call (function declarations and `extern` objects may be
//! re-declared), so `define` reports the previous symbol and lets the
//! caller decide.

use crate::diag::SourceLoc;
use crate::types::TypeId;
use std::collections::HashMap;

/// Index of a symbol in the session's symbol arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(u32);

impl SymbolId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Variable,
    Function,
    Parameter,
    Typedef,
    EnumConstant,
    StructTag,
    UnionTag,
    EnumTag,
    Label,
}

/// Declared storage class, `None` when unspecified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageClass {
    #[default]
    None,
    Auto,
    Register,
    Static,
    Extern,
    Typedef,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    pub ty: TypeId,
    pub loc: SourceLoc,
    pub storage: StorageClass,
    /// Definition (with body/initializer) seen, not just a declaration.
    pub defined: bool,
    pub used: bool,
    /// Enumerator value for `SymbolKind::EnumConstant`.
    pub enum_value: i64,
    /// True when the symbol lives at file scope (emitted as a global).
    pub is_global: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    File,
    Function,
    Block,
}

struct Scope {
    kind: ScopeKind,
    ordinary: HashMap<String, SymbolId>,
    tags: HashMap<String, SymbolId>,
    /// Populated only on `ScopeKind::Function` scopes.
    labels: HashMap<String, SymbolId>,
}

impl Scope {
    fn new(kind: ScopeKind) -> Self {
        Scope {
            kind,
            ordinary: HashMap::new(),
            tags: HashMap::new(),
            labels: HashMap::new(),
        }
    }
}

/// The scope stack plus the symbol arena. The file scope is pushed at
/// construction and never popped, so declarations persist across
/// translation units in one session.
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    scopes: Vec<Scope>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable {
            symbols: Vec::new(),
            scopes: vec![Scope::new(ScopeKind::File)],
        }
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.index()]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.index()]
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn at_file_scope(&self) -> bool {
        self.scopes.len() == 1
    }

    pub fn push_scope(&mut self, kind: ScopeKind) {
        debug_assert!(kind != ScopeKind::File, "file scope exists at construction");
        self.scopes.push(Scope::new(kind));
    }

    /// Pop the innermost scope, returning the symbols it defined (the
    /// analyzer uses these for unused-variable reporting).
    pub fn pop_scope(&mut self) -> Vec<SymbolId> {
        debug_assert!(self.scopes.len() > 1, "cannot pop the file scope");
        let scope = self.scopes.pop().expect("scope stack underflow");
        scope.ordinary.values().copied().collect()
    }

    /// Pop a function scope, returning labels that were referenced but
    /// never defined.
    pub fn pop_function_scope(&mut self) -> Vec<SymbolId> {
        let scope = self.scopes.pop().expect("scope stack underflow");
        debug_assert!(scope.kind == ScopeKind::Function);
        scope
            .labels
            .values()
            .copied()
            .filter(|&id| !self.symbols[id.index()].defined)
            .collect()
    }

    fn alloc(&mut self, sym: Symbol) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(sym);
        id
    }

    /// Define an ordinary identifier in the current scope.
    ///
    /// On a name clash in the same scope the previous symbol id is
    /// returned as the error; compatible redeclarations are the caller's
    /// policy decision.
    pub fn define(
        &mut self,
        name: &str,
        kind: SymbolKind,
        ty: TypeId,
        loc: SourceLoc,
        storage: StorageClass,
    ) -> Result<SymbolId, SymbolId> {
        let scope = self.scopes.last().expect("scope stack empty");
        if let Some(&prev) = scope.ordinary.get(name) {
            return Err(prev);
        }
        let is_global = self.at_file_scope();
        let id = self.alloc(Symbol {
            name: name.to_string(),
            kind,
            ty,
            loc,
            storage,
            defined: false,
            used: false,
            enum_value: 0,
            is_global,
        });
        self.scopes
            .last_mut()
            .expect("scope stack empty")
            .ordinary
            .insert(name.to_string(), id);
        Ok(id)
    }

    /// Replace the binding for `name` in the current scope (used when a
    /// redeclaration is accepted and the merged symbol wins).
    pub fn rebind(&mut self, name: &str, id: SymbolId) {
        self.scopes
            .last_mut()
            .expect("scope stack empty")
            .ordinary
            .insert(name.to_string(), id);
    }

    /// Define directly at file scope regardless of the current depth.
    /// Used for C89 implicit function declarations, which inject the
    /// synthesized `int ()` declaration at file scope.
    pub fn define_global(
        &mut self,
        name: &str,
        kind: SymbolKind,
        ty: TypeId,
        loc: SourceLoc,
        storage: StorageClass,
    ) -> Result<SymbolId, SymbolId> {
        if let Some(&prev) = self.scopes[0].ordinary.get(name) {
            return Err(prev);
        }
        let id = self.alloc(Symbol {
            name: name.to_string(),
            kind,
            ty,
            loc,
            storage,
            defined: false,
            used: false,
            enum_value: 0,
            is_global: true,
        });
        self.scopes[0].ordinary.insert(name.to_string(), id);
        Ok(id)
    }

    /// Define a struct/union/enum tag in the current scope.
    pub fn define_tag(
        &mut self,
        name: &str,
        kind: SymbolKind,
        ty: TypeId,
        loc: SourceLoc,
    ) -> Result<SymbolId, SymbolId> {
        debug_assert!(matches!(
            kind,
            SymbolKind::StructTag | SymbolKind::UnionTag | SymbolKind::EnumTag
        ));
        let scope = self.scopes.last().expect("scope stack empty");
        if let Some(&prev) = scope.tags.get(name) {
            return Err(prev);
        }
        let is_global = self.at_file_scope();
        let id = self.alloc(Symbol {
            name: name.to_string(),
            kind,
            ty,
            loc,
            storage: StorageClass::None,
            defined: false,
            used: false,
            enum_value: 0,
            is_global,
        });
        self.scopes
            .last_mut()
            .expect("scope stack empty")
            .tags
            .insert(name.to_string(), id);
        Ok(id)
    }

    fn function_scope_mut(&mut self) -> Option<&mut Scope> {
        self.scopes
            .iter_mut()
            .rev()
            .find(|s| s.kind == ScopeKind::Function)
    }

    /// Record a label definition (`name:`). Errors with the previous id if
    /// the label was already defined in this function.
    pub fn define_label(&mut self, name: &str, ty: TypeId, loc: SourceLoc) -> Result<SymbolId, SymbolId> {
        if let Some(scope) = self
            .scopes
            .iter()
            .rev()
            .find(|s| s.kind == ScopeKind::Function)
        {
            if let Some(&prev) = scope.labels.get(name) {
                if self.symbols[prev.index()].defined {
                    return Err(prev);
                }
                self.symbols[prev.index()].defined = true;
                self.symbols[prev.index()].loc = loc;
                return Ok(prev);
            }
        }
        let id = self.alloc(Symbol {
            name: name.to_string(),
            kind: SymbolKind::Label,
            ty,
            loc,
            storage: StorageClass::None,
            defined: true,
            used: false,
            enum_value: 0,
            is_global: false,
        });
        if let Some(scope) = self.function_scope_mut() {
            scope.labels.insert(name.to_string(), id);
        }
        Ok(id)
    }

    /// Record a label reference (`goto name;`), creating a forward entry
    /// when the label has not been defined yet.
    pub fn use_label(&mut self, name: &str, ty: TypeId, loc: SourceLoc) -> SymbolId {
        if let Some(scope) = self
            .scopes
            .iter()
            .rev()
            .find(|s| s.kind == ScopeKind::Function)
        {
            if let Some(&id) = scope.labels.get(name) {
                self.symbols[id.index()].used = true;
                return id;
            }
        }
        let id = self.alloc(Symbol {
            name: name.to_string(),
            kind: SymbolKind::Label,
            ty,
            loc,
            storage: StorageClass::None,
            defined: false,
            used: true,
            enum_value: 0,
            is_global: false,
        });
        if let Some(scope) = self.function_scope_mut() {
            scope.labels.insert(name.to_string(), id);
        }
        id
    }

    /// Ordinary lookup, walking outward through enclosing scopes.
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        for scope in self.scopes.iter().rev() {
            if let Some(&id) = scope.ordinary.get(name) {
                return Some(id);
            }
        }
        None
    }

    /// Ordinary lookup restricted to the current scope.
    pub fn lookup_current(&self, name: &str) -> Option<SymbolId> {
        self.scopes
            .last()
            .and_then(|s| s.ordinary.get(name).copied())
    }

    pub fn lookup_tag(&self, name: &str) -> Option<SymbolId> {
        for scope in self.scopes.iter().rev() {
            if let Some(&id) = scope.tags.get(name) {
                return Some(id);
            }
        }
        None
    }

    pub fn lookup_tag_current(&self, name: &str) -> Option<SymbolId> {
        self.scopes.last().and_then(|s| s.tags.get(name).copied())
    }

    pub fn lookup_label(&self, name: &str) -> Option<SymbolId> {
        self.scopes
            .iter()
            .rev()
            .find(|s| s.kind == ScopeKind::Function)
            .and_then(|s| s.labels.get(name).copied())
    }

    /// True when `name` currently resolves to a typedef.
    pub fn is_typedef(&self, name: &str) -> bool {
        self.lookup(name)
            .map(|id| self.symbols[id.index()].kind == SymbolKind::Typedef)
            .unwrap_or(false)
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        SymbolTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TargetLayout, TypeTable};
    use std::rc::Rc;

    fn loc() -> SourceLoc {
        SourceLoc::new(Rc::from("t.c"), 1, 1)
    }

    #[test]
    fn test_shadowing_across_scopes() {
        let tt = TypeTable::new(TargetLayout::lp64());
        let mut st = SymbolTable::new();
        let outer = st
            .define("x", SymbolKind::Variable, tt.int(), loc(), StorageClass::None)
            .unwrap();
        st.push_scope(ScopeKind::Block);
        let inner = st
            .define("x", SymbolKind::Variable, tt.double(), loc(), StorageClass::None)
            .unwrap();
        assert_eq!(st.lookup("x"), Some(inner));
        st.pop_scope();
        assert_eq!(st.lookup("x"), Some(outer));
    }

    #[test]
    fn test_redefinition_in_same_scope() {
        let tt = TypeTable::new(TargetLayout::lp64());
        let mut st = SymbolTable::new();
        let first = st
            .define("x", SymbolKind::Variable, tt.int(), loc(), StorageClass::None)
            .unwrap();
        let err = st
            .define("x", SymbolKind::Variable, tt.int(), loc(), StorageClass::None)
            .unwrap_err();
        assert_eq!(err, first);
    }

    #[test]
    fn test_nothing_survives_pop(){
        let tt = TypeTable::new(TargetLayout::lp64());
        let mut st = SymbolTable::new();
        st.push_scope(ScopeKind::Block);
        st.define("y", SymbolKind::Variable, tt.int(), loc(), StorageClass::None)
            .unwrap();
        st.define_tag("s", SymbolKind::StructTag, tt.int(), loc())
            .unwrap();
        st.pop_scope();
        assert!(st.lookup("y").is_none());
        assert!(st.lookup_tag("s").is_none());
    }

    #[test]
    fn test_tags_do_not_collide_with_ordinary() {
        let tt = TypeTable::new(TargetLayout::lp64());
        let mut st = SymbolTable::new();
        st.define("s", SymbolKind::Variable, tt.int(), loc(), StorageClass::None)
            .unwrap();
        // `struct s` lives in the tag namespace.
        st.define_tag("s", SymbolKind::StructTag, tt.int(), loc())
            .unwrap();
        assert!(st.lookup("s").is_some());
        assert!(st.lookup_tag("s").is_some());
    }

    #[test]
    fn test_forward_label_resolution() {
        let tt = TypeTable::new(TargetLayout::lp64());
        let mut st = SymbolTable::new();
        st.push_scope(ScopeKind::Function);
        // goto before the label exists
        let used = st.use_label("out", tt.void(), loc());
        assert!(!st.symbol(used).defined);
        // label definition resolves the same symbol
        let defined = st.define_label("out", tt.void(), loc()).unwrap();
        assert_eq!(used, defined);
        let unresolved = st.pop_function_scope();
        assert!(unresolved.is_empty());
    }

    #[test]
    fn test_unresolved_label_reported_at_function_end() {
        let tt = TypeTable::new(TargetLayout::lp64());
        let mut st = SymbolTable::new();
        st.push_scope(ScopeKind::Function);
        st.use_label("nowhere", tt.void(), loc());
        let unresolved = st.pop_function_scope();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(st.symbol(unresolved[0]).name, "nowhere");
    }

    #[test]
    fn test_label_visible_from_nested_block() {
        let tt = TypeTable::new(TargetLayout::lp64());
        let mut st = SymbolTable::new();
        st.push_scope(ScopeKind::Function);
        st.define_label("top", tt.void(), loc()).unwrap();
        st.push_scope(ScopeKind::Block);
        // Label scope is flattened to the function.
        assert!(st.lookup_label("top").is_some());
        let id = st.use_label("top", tt.void(), loc());
        assert!(st.symbol(id).defined);
        st.pop_scope();
        st.pop_function_scope();
    }

    #[test]
    fn test_duplicate_label_is_error() {
        let tt = TypeTable::new(TargetLayout::lp64());
        let mut st = SymbolTable::new();
        st.push_scope(ScopeKind::Function);
        st.define_label("l", tt.void(), loc()).unwrap();
        assert!(st.define_label("l", tt.void(), loc()).is_err());
    }
}
