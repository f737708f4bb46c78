use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::num::NonZeroUsize;

use crate::{
    frame,
    symbol::{Interner, Symbol},
    symtab::SymbolTable,
};

/// A virtual register. Most temps are unnamed; the named ones are exactly the
/// machine registers, interned so that asking for the same register twice
/// yields the same temp.
#[derive(Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Hash)]
pub enum Temp {
    Named(Symbol),
    Unnamed(NonZeroUsize),
}

/// A code address. Named labels are function entry points and runtime
/// symbols; unnamed labels are compiler-generated branch targets.
#[derive(Eq, PartialEq, Ord, PartialOrd, Copy, Clone, Hash)]
pub enum Label {
    Named(Symbol),
    Unnamed(NonZeroUsize),
}

impl Debug for Temp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Temp::Named(s) => write!(f, "reg_sym{}", s.to_usize()),
            Temp::Unnamed(id) => write!(f, "t{}", id),
        }
    }
}

impl Debug for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Label::Named(s) => write!(f, "named_label{}", s.to_usize()),
            Label::Unnamed(id) => write!(f, ".L{}", id),
        }
    }
}

impl Display for Temp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl Label {
    pub fn debug_to_string(&self, gen: &dyn Uuids) -> String {
        match self {
            Label::Unnamed(id) => format!(".L{}", id),
            Label::Named(sym) => gen
                .resolve(sym)
                .expect("impl bug: named label from foreign interner")
                .to_string(),
        }
    }

    pub fn resolve_named<'a>(&self, gen: &'a dyn Uuids) -> &'a str {
        match self {
            Label::Unnamed(..) => panic!("impl bug: expected a named label"),
            Label::Named(sym) => gen
                .resolve(sym)
                .expect("impl bug: named label from foreign interner"),
        }
    }
}

/// Maps temporaries to machine register names. The allocator seeds one from
/// the target's register list to know the precolored nodes, and the final
/// assembly formatter consults the (extended) map for every temp.
#[derive(Debug)]
pub struct TempMap(HashMap<Temp, &'static str>);

impl TempMap {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn get(&self, t: &Temp) -> Option<&&'static str> {
        self.0.get(t)
    }

    pub fn contains_key(&self, t: &Temp) -> bool {
        self.0.contains_key(t)
    }

    pub fn insert(&mut self, t: Temp, v: &'static str) {
        self.0.insert(t, v);
    }
}

/// The supply of unique temporaries, labels and symbols. Passed explicitly
/// through every backend stage instead of living in a global, so a whole
/// compilation is a pure function of its inputs.
pub trait Uuids {
    fn new() -> Self
    where
        Self: Sized;

    fn resolve(&self, s: &Symbol) -> Option<&str>;

    fn intern(&mut self, name: &str) -> Symbol;

    fn new_unnamed_temp(&mut self) -> Temp;

    /// Returns the temp associated with a machine register name, creating
    /// the association on first use. Repeated calls with the same name give
    /// the same temp.
    fn named_temp(&mut self, name: &'static str) -> Temp;

    /// Builds a `TempMap` for a list of register names, reusing existing
    /// name-temp associations.
    fn to_temp_map(&mut self, names: &[frame::Register]) -> TempMap;

    fn new_unnamed_label(&mut self) -> Label;

    fn named_label(&mut self, s: &str) -> Label;
}

pub struct UuidsImpl {
    next_id: NonZeroUsize,
    pool: Interner,
    name_temp: SymbolTable<Temp>,
}

impl UuidsImpl {
    fn bump(&mut self) -> NonZeroUsize {
        let id = self.next_id;
        self.next_id = NonZeroUsize::new(id.get().wrapping_add(1))
            .expect("impl bug: temp id counter wrapped");
        id
    }
}

impl Uuids for UuidsImpl {
    fn new() -> Self {
        Self {
            next_id: NonZeroUsize::MIN,
            pool: Interner::new(),
            name_temp: SymbolTable::empty(),
        }
    }

    #[inline]
    fn resolve(&self, s: &Symbol) -> Option<&str> {
        self.pool.resolve(s)
    }

    #[inline]
    fn intern(&mut self, name: &str) -> Symbol {
        self.pool.intern(name)
    }

    fn new_unnamed_temp(&mut self) -> Temp {
        Temp::Unnamed(self.bump())
    }

    fn named_temp(&mut self, name: &'static str) -> Temp {
        let sym = self.pool.intern(name);
        match self.name_temp.look(sym) {
            Some(t) => *t,
            None => {
                let t = Temp::Named(sym);
                self.name_temp.enter(sym, t);
                t
            }
        }
    }

    fn to_temp_map(&mut self, names: &[frame::Register]) -> TempMap {
        let mut tm = TempMap::new();
        for name in names {
            let t = self.named_temp(name);
            tm.insert(t, name);
        }
        tm
    }

    fn new_unnamed_label(&mut self) -> Label {
        Label::Unnamed(self.bump())
    }

    fn named_label(&mut self, s: &str) -> Label {
        Label::Named(self.pool.intern(s))
    }
}

pub mod test_helpers {
    use super::*;

    pub fn new_unnamed_temp(s: usize) -> Temp {
        Temp::Unnamed(NonZeroUsize::new(s).unwrap())
    }

    pub fn new_unnamed_label(s: usize) -> Label {
        Label::Unnamed(NonZeroUsize::new(s).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_temp_is_stable_across_calls() {
        let mut gen = UuidsImpl::new();
        let t1 = gen.named_temp("rax");
        let t2 = gen.named_temp("rax");
        assert_eq!(t1, t2);
    }

    #[test]
    fn unnamed_temps_are_distinct() {
        let mut gen = UuidsImpl::new();
        assert_ne!(gen.new_unnamed_temp(), gen.new_unnamed_temp());
    }

    #[test]
    fn temp_map_covers_requested_registers() {
        let mut gen = UuidsImpl::new();
        let tm = gen.to_temp_map(&["rax", "rbx"]);
        let rax = gen.named_temp("rax");
        assert_eq!(Some(&"rax"), tm.get(&rax));
    }
}
