use crate::symbol::Symbol;
use std::collections::HashMap;

/// Scoped symbol table. A symbol maps to a LIFO list of entries so that a
/// binding in a nested scope shadows the outer one, and `end_scope` restores
/// exactly the bindings the current scope pushed.
#[derive(Debug)]
pub struct SymbolTable<T> {
    tbl: HashMap<Symbol, Vec<T>>,
    // Symbols pushed since the matching begin_scope, in push order.
    stack: Vec<ScopeEntry>,
}

#[derive(Debug, Copy, Clone)]
enum ScopeEntry {
    Marker,
    Sym(Symbol),
}

impl<T> SymbolTable<T> {
    pub fn empty() -> Self {
        SymbolTable {
            tbl: HashMap::new(),
            stack: Vec::new(),
        }
    }

    pub fn enter(&mut self, symbol: Symbol, v: T) {
        self.tbl.entry(symbol).or_default().push(v);
        self.stack.push(ScopeEntry::Sym(symbol));
    }

    pub fn look(&self, symbol: Symbol) -> Option<&T> {
        self.tbl.get(&symbol).and_then(|v| v.last())
    }

    pub fn begin_scope(&mut self) {
        self.stack.push(ScopeEntry::Marker);
    }

    pub fn end_scope(&mut self) {
        while let Some(entry) = self.stack.pop() {
            match entry {
                ScopeEntry::Marker => return,
                ScopeEntry::Sym(s) => {
                    // the stack and the table going out of alignment is a bug.
                    self.tbl
                        .get_mut(&s)
                        .expect("impl bug: scope stack names unknown symbol")
                        .pop();
                }
            }
        }
        panic!("impl bug: end_scope without matching begin_scope");
    }
}
