//! Lexical scopes and symbols.
//!
//! Each scope keeps three namespaces: ordinary symbols (variables,
//! functions, enum constants, builtins), tags (struct/union/enum names),
//! and typedef names. Scopes form a stack threaded through the parser as
//! explicit context; pushes and pops follow lexical nesting exactly.
//!
//! A function prototype's scope is retained on the function type so tags
//! declared among the parameters stay visible when the body is parsed.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::CompileError;
use crate::lexer::Token;
use crate::strings::Name;
use crate::types::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Linkage {
    None,
    Internal,
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    VaStart,
    VaArg,
    VaEnd,
    VaCopy,
    FuncName,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Variable,
    Function,
    Typedef,
    EnumConstant(i32),
    Builtin(Builtin),
}

/// A declared name. Shared by scopes, AST nodes, and the code generator.
pub struct Symbol {
    pub kind: SymbolKind,
    pub name: Name,
    /// Interior-mutable: an indeterminate array type is completed in place
    /// by an initialiser or a later declaration.
    ty: RefCell<Rc<Type>>,
    pub token: Option<Rc<Token>>,
    /// Emitted label; differs from `name` for static locals and
    /// `__asm__("...")` renames.
    asm_name: RefCell<Name>,
    linkage: Cell<Linkage>,
    defined: Cell<bool>,
    tentative: Cell<bool>,
    hidden: Cell<bool>,
    /// Byte offset from the frame pointer; set by the code generator for
    /// locals and parameters.
    frame_offset: Cell<Option<i32>>,
}

impl Symbol {
    pub fn new(
        kind: SymbolKind,
        name: Name,
        ty: Rc<Type>,
        token: Option<Rc<Token>>,
    ) -> Rc<Symbol> {
        let asm_name = RefCell::new(name.clone());
        Rc::new(Symbol {
            kind,
            name,
            ty: RefCell::new(ty),
            token,
            asm_name,
            linkage: Cell::new(Linkage::None),
            defined: Cell::new(false),
            tentative: Cell::new(false),
            hidden: Cell::new(false),
            frame_offset: Cell::new(None),
        })
    }

    pub fn ty(&self) -> Rc<Type> {
        Rc::clone(&self.ty.borrow())
    }

    /// Replace the type (array completion only).
    pub fn set_type(&self, ty: Rc<Type>) {
        *self.ty.borrow_mut() = ty;
    }

    pub fn asm_name(&self) -> Name {
        self.asm_name.borrow().clone()
    }

    pub fn set_asm_name(&self, name: Name) {
        *self.asm_name.borrow_mut() = name;
    }

    pub fn linkage(&self) -> Linkage {
        self.linkage.get()
    }

    pub fn set_linkage(&self, linkage: Linkage) {
        self.linkage.set(linkage);
    }

    pub fn is_defined(&self) -> bool {
        self.defined.get()
    }

    pub fn set_defined(&self) {
        self.defined.set(true);
        self.tentative.set(false);
    }

    pub fn is_tentative(&self) -> bool {
        self.tentative.get()
    }

    pub fn set_tentative(&self, tentative: bool) {
        self.tentative.set(tentative);
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden.get()
    }

    pub fn set_hidden(&self) {
        self.hidden.set(true);
    }

    pub fn frame_offset(&self) -> Option<i32> {
        self.frame_offset.get()
    }

    pub fn set_frame_offset(&self, offset: i32) {
        self.frame_offset.set(Some(offset));
    }

    /// True for locals and parameters (addressed relative to the frame).
    pub fn is_local(&self) -> bool {
        self.frame_offset.get().is_some()
    }

    pub fn enum_value(&self) -> Option<i32> {
        match self.kind {
            SymbolKind::EnumConstant(value) => Some(value),
            _ => None,
        }
    }

    pub fn builtin(&self) -> Option<Builtin> {
        match self.kind {
            SymbolKind::Builtin(builtin) => Some(builtin),
            _ => None,
        }
    }
}

#[derive(Default)]
pub struct Scope {
    pub parent: Option<Rc<RefCell<Scope>>>,
    symbols: HashMap<Name, Rc<Symbol>>,
    tags: HashMap<Name, Rc<Type>>,
    typedefs: HashMap<Name, Rc<Symbol>>,
}

impl Scope {
    fn child_of(parent: &Rc<RefCell<Scope>>) -> Rc<RefCell<Scope>> {
        Rc::new(RefCell::new(Scope {
            parent: Some(Rc::clone(parent)),
            ..Scope::default()
        }))
    }
}

/// The scope stack. The current scope changes on push/pop; the global
/// scope is always the root.
pub struct ScopeStack {
    current: Rc<RefCell<Scope>>,
    global: Rc<RefCell<Scope>>,
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeStack {
    pub fn new() -> Self {
        let global = Rc::new(RefCell::new(Scope::default()));
        ScopeStack {
            current: Rc::clone(&global),
            global,
        }
    }

    pub fn current(&self) -> Rc<RefCell<Scope>> {
        Rc::clone(&self.current)
    }

    pub fn is_global(&self) -> bool {
        Rc::ptr_eq(&self.current, &self.global)
    }

    /// Open a child of the current scope.
    pub fn push(&mut self) {
        self.current = Scope::child_of(&self.current);
    }

    /// Re-enter a scope created earlier (a function prototype's scope).
    pub fn push_existing(&mut self, scope: Rc<RefCell<Scope>>) {
        self.current = scope;
    }

    pub fn pop(&mut self) -> Result<(), CompileError> {
        let parent = self
            .current
            .borrow()
            .parent
            .clone()
            .ok_or_else(|| CompileError::internal("scope pop past the global scope"))?;
        self.current = parent;
        Ok(())
    }

    /// Look up an ordinary symbol. With `recursive`, walk parents up to and
    /// including the global scope.
    pub fn find_symbol(&self, name: &Name, recursive: bool) -> Option<Rc<Symbol>> {
        let mut scope = Rc::clone(&self.current);
        loop {
            if let Some(symbol) = scope.borrow().symbols.get(name) {
                return Some(Rc::clone(symbol));
            }
            if !recursive {
                return None;
            }
            let parent = scope.borrow().parent.clone()?;
            scope = parent;
        }
    }

    /// Add an ordinary symbol to the current scope. Duplicates within one
    /// scope are rejected; shadowing an outer scope is allowed.
    pub fn add_symbol(&self, symbol: Rc<Symbol>) -> Result<(), CompileError> {
        let mut scope = self.current.borrow_mut();
        if scope.symbols.contains_key(&symbol.name) {
            let mut e = CompileError::new(
                crate::error::ErrorKind::Semantic,
                format!("'{}' is already declared in this scope", symbol.name),
            );
            if let Some(token) = &symbol.token {
                e = e.at(token);
            }
            return Err(e);
        }
        scope.symbols.insert(symbol.name.clone(), symbol);
        Ok(())
    }

    /// Add a symbol to the global scope regardless of the current scope
    /// (block-scope extern declarations surface here).
    pub fn add_global_symbol(&self, symbol: Rc<Symbol>) {
        self.global
            .borrow_mut()
            .symbols
            .insert(symbol.name.clone(), symbol);
    }

    pub fn find_global_symbol(&self, name: &Name) -> Option<Rc<Symbol>> {
        self.global.borrow().symbols.get(name).map(Rc::clone)
    }

    pub fn find_tag(&self, name: &Name, recursive: bool) -> Option<Rc<Type>> {
        let mut scope = Rc::clone(&self.current);
        loop {
            if let Some(ty) = scope.borrow().tags.get(name) {
                return Some(Rc::clone(ty));
            }
            if !recursive {
                return None;
            }
            let parent = scope.borrow().parent.clone()?;
            scope = parent;
        }
    }

    pub fn add_tag(&self, name: Name, ty: Rc<Type>) {
        self.current.borrow_mut().tags.insert(name, ty);
    }

    pub fn find_typedef(&self, name: &Name, recursive: bool) -> Option<Rc<Symbol>> {
        let mut scope = Rc::clone(&self.current);
        loop {
            if let Some(symbol) = scope.borrow().typedefs.get(name) {
                return Some(Rc::clone(symbol));
            }
            if !recursive {
                return None;
            }
            let parent = scope.borrow().parent.clone()?;
            scope = parent;
        }
    }

    pub fn add_typedef(&self, symbol: Rc<Symbol>) -> Result<(), CompileError> {
        let mut scope = self.current.borrow_mut();
        if let Some(existing) = scope.typedefs.get(&symbol.name) {
            // Redeclaring a typedef with the identical type is allowed.
            if Type::equal(&existing.ty(), &symbol.ty()) {
                return Ok(());
            }
            let mut e = CompileError::new(
                crate::error::ErrorKind::Semantic,
                format!("typedef '{}' redeclared with a different type", symbol.name),
            );
            if let Some(token) = &symbol.token {
                e = e.at(token);
            }
            return Err(e);
        }
        scope.typedefs.insert(symbol.name.clone(), symbol);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strings::Interner;

    fn symbol(interner: &Interner, name: &str) -> Rc<Symbol> {
        Symbol::new(
            SymbolKind::Variable,
            interner.intern(name),
            Type::int(),
            None,
        )
    }

    #[test]
    fn test_push_pop_restores_scope() {
        let mut scopes = ScopeStack::new();
        let before = scopes.current();
        for _ in 0..5 {
            scopes.push();
        }
        for _ in 0..5 {
            scopes.pop().unwrap();
        }
        assert!(Rc::ptr_eq(&before, &scopes.current()));
        assert!(scopes.is_global());
    }

    #[test]
    fn test_pop_past_global_fails() {
        let mut scopes = ScopeStack::new();
        assert!(scopes.pop().is_err());
    }

    #[test]
    fn test_duplicate_in_one_scope_rejected() {
        let interner = Interner::new();
        let scopes = ScopeStack::new();
        scopes.add_symbol(symbol(&interner, "x")).unwrap();
        assert!(scopes.add_symbol(symbol(&interner, "x")).is_err());
    }

    #[test]
    fn test_shadowing_across_scopes_allowed() {
        let interner = Interner::new();
        let mut scopes = ScopeStack::new();
        let outer = symbol(&interner, "x");
        scopes.add_symbol(Rc::clone(&outer)).unwrap();

        scopes.push();
        let inner = symbol(&interner, "x");
        scopes.add_symbol(Rc::clone(&inner)).unwrap();

        let found = scopes.find_symbol(&interner.intern("x"), true).unwrap();
        assert!(Rc::ptr_eq(&found, &inner));

        scopes.pop().unwrap();
        let found = scopes.find_symbol(&interner.intern("x"), true).unwrap();
        assert!(Rc::ptr_eq(&found, &outer));
    }

    #[test]
    fn test_recursive_vs_local_lookup() {
        let interner = Interner::new();
        let mut scopes = ScopeStack::new();
        scopes.add_symbol(symbol(&interner, "g")).unwrap();
        scopes.push();
        assert!(scopes.find_symbol(&interner.intern("g"), false).is_none());
        assert!(scopes.find_symbol(&interner.intern("g"), true).is_some());
    }

    #[test]
    fn test_namespaces_are_independent() {
        let interner = Interner::new();
        let scopes = ScopeStack::new();
        let name = interner.intern("list");
        scopes.add_symbol(symbol(&interner, "list")).unwrap();
        scopes.add_tag(name.clone(), Type::int());
        assert!(scopes.find_symbol(&name, true).is_some());
        assert!(scopes.find_tag(&name, true).is_some());
        assert!(scopes.find_typedef(&name, true).is_none());
    }

    #[test]
    fn test_prototype_scope_reentry() {
        let mut scopes = ScopeStack::new();
        scopes.push();
        let proto = scopes.current();
        scopes.pop().unwrap();
        scopes.push_existing(Rc::clone(&proto));
        assert!(Rc::ptr_eq(&proto, &scopes.current()));
        scopes.pop().unwrap();
        assert!(scopes.is_global());
    }
}
