//! String intern pool.
//!
//! Every identifier, keyword, filename, and literal body is canonicalised to
//! a shared immutable handle. Two handles for the same byte sequence are the
//! same allocation, so equality is normally a pointer comparison.

use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

/// A handle to an interned string.
///
/// Handles produced by one [`Interner`] compare equal exactly when their
/// bytes are equal; the byte comparison only runs when the pointer check
/// fails (handles from different pools).
#[derive(Clone)]
pub struct Name(Rc<str>);

impl Name {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn ptr_eq(a: &Name, b: &Name) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0) || self.0 == other.0
    }
}

impl Eq for Name {}

impl PartialEq<str> for Name {
    fn eq(&self, other: &str) -> bool {
        *self.0 == *other
    }
}

impl PartialEq<&str> for Name {
    fn eq(&self, other: &&str) -> bool {
        *self.0 == **other
    }
}

impl std::hash::Hash for Name {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Deref for Name {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", &*self.0)
    }
}

/// The pool. Owns one `Rc<str>` per distinct byte sequence.
///
/// Interior mutability lets the pool be shared between the lexer and the
/// parser through a plain `Rc` without threading `&mut` everywhere.
#[derive(Default)]
pub struct Interner {
    pool: RefCell<HashSet<Rc<str>>>,
}

impl Interner {
    pub fn new() -> Self {
        Interner::default()
    }

    /// Return the canonical handle for `s`, inserting it on first sight.
    pub fn intern(&self, s: &str) -> Name {
        let mut pool = self.pool.borrow_mut();
        if let Some(existing) = pool.get(s) {
            return Name(Rc::clone(existing));
        }
        let entry: Rc<str> = Rc::from(s);
        pool.insert(Rc::clone(&entry));
        Name(entry)
    }

    /// Number of distinct strings in the pool.
    pub fn len(&self) -> usize {
        self.pool.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.borrow().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_bytes_same_handle() {
        let pool = Interner::new();
        let a = pool.intern("offset");
        let b = pool.intern("offset");
        assert!(Name::ptr_eq(&a, &b));
        assert_eq!(a, b);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_distinct_bytes_distinct_handles() {
        let pool = Interner::new();
        let a = pool.intern("x");
        let b = pool.intern("y");
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_handle_equality_matches_byte_equality() {
        let pool = Interner::new();
        let other = Interner::new();
        let a = pool.intern("main");
        let b = other.intern("main");
        // Different pools, same bytes: still equal, just not pointer-equal.
        assert!(!Name::ptr_eq(&a, &b));
        assert_eq!(a, b);
    }

    #[test]
    fn test_str_comparison() {
        let pool = Interner::new();
        let a = pool.intern("while");
        assert_eq!(a, "while");
        assert_eq!(a.as_str(), "while");
    }
}
