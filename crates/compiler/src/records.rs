//! Struct/union layout and enum definitions.
//!
//! A record accumulates members as the parser reads them. Struct members
//! are placed at the previous end rounded up to the member's alignment;
//! union members all sit at offset zero. The record's size is always kept
//! rounded up to its alignment. Anonymous struct/union members appear once
//! in the member list and their own members are flattened into the parent's
//! name map with the member's offset added.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use crate::error::{CompileError, ErrorKind};
use crate::strings::Name;
use crate::types::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Struct,
    Union,
}

/// One declared member, in declaration order.
pub struct Member {
    pub name: Option<Name>,
    pub ty: Rc<Type>,
    pub offset: u32,
}

struct Layout {
    members: Vec<Member>,
    /// Named lookup, anonymous members flattened in.
    by_name: HashMap<Name, (Rc<Type>, u32)>,
    /// Raw end of the last member, before rounding to the record alignment.
    end: u32,
    size: u32,
    align: u32,
}

pub struct Record {
    tag: Option<Name>,
    kind: RecordKind,
    layout: RefCell<Layout>,
    defined: Cell<bool>,
}

impl Record {
    pub fn new(tag: Option<Name>, kind: RecordKind) -> Rc<Record> {
        Rc::new(Record {
            tag,
            kind,
            layout: RefCell::new(Layout {
                members: Vec::new(),
                by_name: HashMap::new(),
                end: 0,
                size: 0,
                align: 1,
            }),
            defined: Cell::new(false),
        })
    }

    pub fn tag(&self) -> Option<Name> {
        self.tag.clone()
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            RecordKind::Struct => "struct",
            RecordKind::Union => "union",
        }
    }

    pub fn is_defined(&self) -> bool {
        self.defined.get()
    }

    /// Mark the member list complete. Layout is final after this.
    pub fn mark_defined(&self) {
        self.defined.set(true);
    }

    pub fn size_checked(&self) -> Result<u32, CompileError> {
        if !self.defined.get() {
            return Err(CompileError::new(
                ErrorKind::Semantic,
                format!("{} is incomplete", self.describe()),
            ));
        }
        Ok(self.layout.borrow().size)
    }

    pub fn alignment_checked(&self) -> Result<u32, CompileError> {
        if !self.defined.get() {
            return Err(CompileError::new(
                ErrorKind::Semantic,
                format!("{} is incomplete", self.describe()),
            ));
        }
        Ok(self.layout.borrow().align)
    }

    fn describe(&self) -> String {
        match &self.tag {
            Some(tag) => format!("{} {}", self.kind_name(), tag),
            None => format!("anonymous {}", self.kind_name()),
        }
    }

    /// Add one member and recompute the layout.
    ///
    /// A flexible array member contributes zero bytes. An anonymous record
    /// member flattens its own names into this record's map.
    pub fn add_member(&self, name: Option<Name>, ty: Rc<Type>) -> Result<(), CompileError> {
        let (member_size, member_align) = if ty.is_flexible_array() {
            let element = ty.element().expect("flexible array has an element type");
            (0, element.alignment()?)
        } else {
            (ty.size()?, ty.alignment()?)
        };

        let mut layout = self.layout.borrow_mut();
        let offset = match self.kind {
            RecordKind::Struct => round_up(layout.end, member_align),
            RecordKind::Union => 0,
        };

        layout.align = layout.align.max(member_align);
        layout.end = layout.end.max(offset + member_size);
        let align = layout.align;
        layout.size = layout.size.max(round_up(offset + member_size, align));

        match &name {
            Some(member_name) => {
                if layout.by_name.contains_key(member_name) {
                    return Err(CompileError::new(
                        ErrorKind::Semantic,
                        format!(
                            "duplicate member '{}' in {}",
                            member_name,
                            self.describe()
                        ),
                    ));
                }
                layout
                    .by_name
                    .insert(member_name.clone(), (Rc::clone(&ty), offset));
            }
            None => {
                // Anonymous member: must be a record; flatten its names.
                let inner = ty.as_record().ok_or_else(|| {
                    CompileError::new(
                        ErrorKind::Semantic,
                        "unnamed member is not a struct or union",
                    )
                })?;
                for (inner_name, inner_ty, inner_offset) in inner.flattened_names() {
                    if layout.by_name.contains_key(&inner_name) {
                        return Err(CompileError::new(
                            ErrorKind::Semantic,
                            format!(
                                "duplicate member '{}' in {}",
                                inner_name,
                                self.describe()
                            ),
                        ));
                    }
                    layout
                        .by_name
                        .insert(inner_name, (inner_ty, offset + inner_offset));
                }
            }
        }

        layout.members.push(Member { name, ty, offset });
        Ok(())
    }

    /// All reachable member names with their types and offsets.
    fn flattened_names(&self) -> Vec<(Name, Rc<Type>, u32)> {
        let layout = self.layout.borrow();
        layout
            .by_name
            .iter()
            .map(|(name, (ty, offset))| (name.clone(), Rc::clone(ty), *offset))
            .collect()
    }

    /// Look up a member by name, anonymous members included.
    pub fn find(&self, name: &Name) -> Option<(Rc<Type>, u32)> {
        let layout = self.layout.borrow();
        layout
            .by_name
            .get(name)
            .map(|(ty, offset)| (Rc::clone(ty), *offset))
    }

    /// Visit declared members in order (for initialiser lists and data
    /// emission). Anonymous members appear once, unflattened.
    pub fn members(&self) -> Vec<(Option<Name>, Rc<Type>, u32)> {
        let layout = self.layout.borrow();
        layout
            .members
            .iter()
            .map(|m| (m.name.clone(), Rc::clone(&m.ty), m.offset))
            .collect()
    }

    pub fn member_count(&self) -> usize {
        self.layout.borrow().members.len()
    }
}

/// An enum definition. The enumerators also become ordinary-namespace
/// constant symbols in the enclosing scope; this list exists for display
/// and completeness checks.
pub struct EnumDef {
    pub tag: Option<Name>,
    members: RefCell<Vec<(Name, i32)>>,
    defined: Cell<bool>,
}

impl EnumDef {
    pub fn new(tag: Option<Name>) -> Rc<EnumDef> {
        Rc::new(EnumDef {
            tag,
            members: RefCell::new(Vec::new()),
            defined: Cell::new(false),
        })
    }

    pub fn add_member(&self, name: Name, value: i32) {
        self.members.borrow_mut().push((name, value));
    }

    pub fn members(&self) -> Vec<(Name, i32)> {
        self.members.borrow().clone()
    }

    pub fn is_defined(&self) -> bool {
        self.defined.get()
    }

    pub fn mark_defined(&self) {
        self.defined.set(true);
    }
}

fn round_up(value: u32, align: u32) -> u32 {
    debug_assert!(align > 0);
    value.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strings::Interner;
    use crate::types::Base;

    fn name(interner: &Interner, s: &str) -> Name {
        interner.intern(s)
    }

    #[test]
    fn test_struct_layout_with_padding() {
        let interner = Interner::new();
        let r = Record::new(Some(name(&interner, "S")), RecordKind::Struct);
        r.add_member(Some(name(&interner, "c")), Type::char_type()).unwrap();
        r.add_member(Some(name(&interner, "i")), Type::int()).unwrap();
        r.add_member(Some(name(&interner, "s")), Type::base(Base::Short)).unwrap();
        r.mark_defined();

        assert_eq!(r.find(&name(&interner, "c")).unwrap().1, 0);
        assert_eq!(r.find(&name(&interner, "i")).unwrap().1, 4);
        assert_eq!(r.find(&name(&interner, "s")).unwrap().1, 8);
        assert_eq!(r.size_checked().unwrap(), 12);
        assert_eq!(r.alignment_checked().unwrap(), 4);
    }

    #[test]
    fn test_struct_offsets_align_to_member() {
        let interner = Interner::new();
        let r = Record::new(None, RecordKind::Struct);
        r.add_member(Some(name(&interner, "a")), Type::char_type()).unwrap();
        r.add_member(Some(name(&interner, "b")), Type::base(Base::Short)).unwrap();
        r.mark_defined();
        assert_eq!(r.find(&name(&interner, "b")).unwrap().1, 2);
        assert_eq!(r.size_checked().unwrap(), 4);
        assert_eq!(r.alignment_checked().unwrap(), 2);
    }

    #[test]
    fn test_union_members_at_zero() {
        let interner = Interner::new();
        let r = Record::new(Some(name(&interner, "U")), RecordKind::Union);
        r.add_member(Some(name(&interner, "c")), Type::char_type()).unwrap();
        r.add_member(Some(name(&interner, "i")), Type::int()).unwrap();
        r.mark_defined();
        assert_eq!(r.find(&name(&interner, "c")).unwrap().1, 0);
        assert_eq!(r.find(&name(&interner, "i")).unwrap().1, 0);
        assert_eq!(r.size_checked().unwrap(), 4);
    }

    #[test]
    fn test_size_is_multiple_of_alignment() {
        let interner = Interner::new();
        let r = Record::new(None, RecordKind::Struct);
        r.add_member(Some(name(&interner, "i")), Type::int()).unwrap();
        r.add_member(Some(name(&interner, "c")), Type::char_type()).unwrap();
        r.mark_defined();
        let size = r.size_checked().unwrap();
        let align = r.alignment_checked().unwrap();
        assert_eq!(size % align, 0);
        assert_eq!(size, 8);
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let interner = Interner::new();
        let r = Record::new(None, RecordKind::Struct);
        r.add_member(Some(name(&interner, "x")), Type::int()).unwrap();
        let result = r.add_member(Some(name(&interner, "x")), Type::int());
        assert!(result.is_err());
        assert!(result.err().unwrap().to_string().contains("duplicate member"));
    }

    #[test]
    fn test_anonymous_member_flattening() {
        let interner = Interner::new();
        let inner = Record::new(None, RecordKind::Struct);
        inner.add_member(Some(name(&interner, "x")), Type::int()).unwrap();
        inner.add_member(Some(name(&interner, "y")), Type::int()).unwrap();
        inner.mark_defined();

        let outer = Record::new(Some(name(&interner, "O")), RecordKind::Struct);
        outer.add_member(Some(name(&interner, "head")), Type::int()).unwrap();
        outer.add_member(None, Type::record(inner)).unwrap();
        outer.mark_defined();

        // Inner names are visible through the parent with offsets added.
        assert_eq!(outer.find(&name(&interner, "x")).unwrap().1, 4);
        assert_eq!(outer.find(&name(&interner, "y")).unwrap().1, 8);
        assert_eq!(outer.size_checked().unwrap(), 12);
        // The anonymous member appears once in the member list.
        assert_eq!(outer.member_count(), 2);
    }

    #[test]
    fn test_flexible_array_contributes_nothing() {
        let interner = Interner::new();
        let r = Record::new(Some(name(&interner, "F")), RecordKind::Struct);
        r.add_member(Some(name(&interner, "len")), Type::int()).unwrap();
        let flex = Type::indeterminate_array(Type::int()).unwrap();
        r.add_member(Some(name(&interner, "data")), flex).unwrap();
        r.mark_defined();
        assert_eq!(r.size_checked().unwrap(), 4);
        assert_eq!(r.find(&name(&interner, "data")).unwrap().1, 4);
    }

    #[test]
    fn test_incomplete_record_has_no_size() {
        let r = Record::new(None, RecordKind::Struct);
        assert!(r.size_checked().is_err());
        r.mark_defined();
        assert!(r.size_checked().is_ok());
    }

    #[test]
    fn test_enum_members() {
        let interner = Interner::new();
        let e = EnumDef::new(Some(name(&interner, "E")));
        e.add_member(name(&interner, "A"), 0);
        e.add_member(name(&interner, "B"), 5);
        e.mark_defined();
        assert_eq!(e.members(), vec![(name(&interner, "A"), 0), (name(&interner, "B"), 5)]);
    }
}
