use std::fmt;
use std::rc::Rc;

use tracing::trace;

use crate::host::HostModule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableId(usize);

/// What a slot is known to hold before the program runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Value { indexable: bool },
    Function,
    Macro { loop_control: bool },
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Symbol {
    pub params_num: usize,
    pub default_count: usize,
    pub shape: Shape,
}

impl Symbol {
    pub fn value(indexable: bool) -> Self {
        Self {
            params_num: 0,
            default_count: 0,
            shape: Shape::Value { indexable },
        }
    }

    pub fn function(params_num: usize, default_count: usize) -> Self {
        Self {
            params_num,
            default_count,
            shape: Shape::Function,
        }
    }

    pub fn macro_symbol(params_num: usize) -> Self {
        Self {
            params_num,
            default_count: 0,
            shape: Shape::Macro {
                loop_control: false,
            },
        }
    }

    pub fn file() -> Self {
        Self {
            params_num: 0,
            default_count: 0,
            shape: Shape::File,
        }
    }

    pub fn accepts(&self, count: usize) -> bool {
        (self.params_num..=self.params_num + self.default_count).contains(&count)
    }

    pub fn is_indexable(&self) -> bool {
        match self.shape {
            Shape::Value { indexable } => indexable,
            // Call results are only known at runtime.
            Shape::Function | Shape::Macro { .. } => true,
            Shape::File => false,
        }
    }
}

#[derive(Debug, Clone)]
pub enum StaticModule {
    Unit(TableId),
    Host(Rc<HostModule>),
}

#[derive(Debug)]
struct ScopedSymbolTable {
    level: usize,
    enclosing: Option<TableId>,
    symbols: Vec<Symbol>,
    modules: Vec<StaticModule>,
}

/// Static mirror of the runtime scope arena. Tables live as long as the analyzer.
#[derive(Debug, Default)]
pub struct SymbolTables {
    tables: Vec<ScopedSymbolTable>,
}

impl SymbolTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, name: impl fmt::Display, enclosing: Option<TableId>) -> TableId {
        let level = enclosing
            .and_then(|id| self.tables.get(id.0))
            .map_or(1, |table| table.level + 1);
        trace!(table = %name, level, "open symbol table");
        self.tables.push(ScopedSymbolTable {
            level,
            enclosing,
            symbols: Vec::new(),
            modules: Vec::new(),
        });
        TableId(self.tables.len() - 1)
    }

    #[cfg(test)]
    pub fn level(&self, id: TableId) -> usize {
        self.tables.get(id.0).map_or(0, |table| table.level)
    }

    pub fn len(&self, id: TableId) -> usize {
        self.tables.get(id.0).map_or(0, |table| table.symbols.len())
    }

    fn resolve(&self, id: TableId, depth: usize) -> Option<TableId> {
        let mut current = id;
        for _ in 0..depth {
            current = self.tables.get(current.0)?.enclosing?;
        }
        Some(current)
    }

    /// Appends a symbol and returns its slot index.
    pub fn insert(&mut self, id: TableId, symbol: Symbol) -> usize {
        match self.tables.get_mut(id.0) {
            Some(table) => {
                table.symbols.push(symbol);
                table.symbols.len() - 1
            }
            None => 0,
        }
    }

    pub fn lookup(&self, id: TableId, depth: usize, index: usize) -> Option<Symbol> {
        let target = self.resolve(id, depth)?;
        self.tables.get(target.0)?.symbols.get(index).copied()
    }

    /// Overwrites a symbol; returns false when the address does not exist.
    pub fn set(&mut self, id: TableId, depth: usize, index: usize, symbol: Symbol) -> bool {
        let Some(target) = self.resolve(id, depth) else {
            return false;
        };
        match self
            .tables
            .get_mut(target.0)
            .and_then(|table| table.symbols.get_mut(index))
        {
            Some(slot) => {
                *slot = symbol;
                true
            }
            None => false,
        }
    }

    pub fn add_module(&mut self, id: TableId, module: StaticModule) {
        if let Some(table) = self.tables.get_mut(id.0) {
            table.modules.push(module);
        }
    }

    pub fn module(&self, id: TableId, depth: usize, index: usize) -> Option<&StaticModule> {
        let target = self.resolve(id, depth)?;
        self.tables.get(target.0)?.modules.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_walks_enclosing_tables() {
        let mut tables = SymbolTables::new();
        let global = tables.open("global", None);
        tables.insert(global, Symbol::function(1, 0));
        let body = tables.open("function", Some(global));
        tables.insert(body, Symbol::value(false));

        assert_eq!(tables.level(body), 2);
        assert_eq!(tables.lookup(body, 0, 0), Some(Symbol::value(false)));
        assert_eq!(tables.lookup(body, 1, 0), Some(Symbol::function(1, 0)));
        assert_eq!(tables.lookup(body, 2, 0), None);
        assert_eq!(tables.lookup(body, 0, 1), None);
    }

    #[test]
    fn set_replaces_shape_in_place() {
        let mut tables = SymbolTables::new();
        let global = tables.open("global", None);
        let index = tables.insert(global, Symbol::value(false));
        assert!(!tables.lookup(global, 0, index).is_some_and(|s| s.is_indexable()));

        assert!(tables.set(global, 0, index, Symbol::value(true)));
        assert!(tables.lookup(global, 0, index).is_some_and(|s| s.is_indexable()));
        assert!(!tables.set(global, 0, 7, Symbol::value(true)));
    }
}
