use std::rc::Rc;

use tracing::debug;

use crate::ast::SetMode;
use crate::error::{ErrorCode, Fault};
use crate::host::HostModule;

use super::value::Value;

/// Handle to a scope record in [`Memory`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(usize);

/// Entry in a scope's module list.
#[derive(Debug, Clone)]
pub enum ModuleHandle {
    Unit(ScopeId),
    Host(Rc<HostModule>),
}

#[derive(Debug)]
struct Scope {
    name: String,
    level: usize,
    enclosing: Option<ScopeId>,
    return_to: Option<ScopeId>,
    // Unit roots and the host scope are pinned and outlive their block.
    pinned: bool,
    slots: Vec<Value>,
    modules: Vec<ModuleHandle>,
}

/// Runtime scope arena.
///
/// `enclosing` is the lexical parent that depth walks follow. `return_to` is the scope
/// control goes back to when the scope ends. Released records are recycled unless pinned.
#[derive(Debug, Default)]
pub struct Memory {
    scopes: Vec<Option<Scope>>,
    free: Vec<usize>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(
        &mut self,
        name: impl Into<String>,
        enclosing: Option<ScopeId>,
        return_to: Option<ScopeId>,
    ) -> ScopeId {
        let level = enclosing
            .and_then(|id| self.scope(id))
            .map_or(1, |scope| scope.level + 1);
        let scope = Scope {
            name: name.into(),
            level,
            enclosing,
            return_to,
            pinned: false,
            slots: Vec::new(),
            modules: Vec::new(),
        };
        debug!(scope = %scope.name, level, "enter scope");
        match self.free.pop() {
            Some(index) => {
                self.scopes[index] = Some(scope);
                ScopeId(index)
            }
            None => {
                self.scopes.push(Some(scope));
                ScopeId(self.scopes.len() - 1)
            }
        }
    }

    pub fn release(&mut self, id: ScopeId) {
        if self.scope(id).is_none_or(|scope| scope.pinned) {
            return;
        }
        if let Some(scope) = self.scopes.get_mut(id.0).and_then(Option::take) {
            debug!(scope = %scope.name, level = scope.level, "leave scope");
            self.free.push(id.0);
        }
    }

    /// Keeps `id` and its lexical ancestors alive after their blocks end.
    pub fn pin(&mut self, id: ScopeId) {
        let mut next = Some(id);
        while let Some(scope) = next.and_then(|id| self.scope_mut(id)) {
            if scope.pinned {
                break;
            }
            scope.pinned = true;
            next = scope.enclosing;
        }
    }

    fn scope(&self, id: ScopeId) -> Option<&Scope> {
        self.scopes.get(id.0).and_then(Option::as_ref)
    }

    fn scope_mut(&mut self, id: ScopeId) -> Option<&mut Scope> {
        self.scopes.get_mut(id.0).and_then(Option::as_mut)
    }

    #[cfg(test)]
    pub fn level(&self, id: ScopeId) -> Option<usize> {
        self.scope(id).map(|scope| scope.level)
    }

    pub fn return_to(&self, id: ScopeId) -> Option<ScopeId> {
        self.scope(id).and_then(|scope| scope.return_to)
    }

    pub fn len(&self, id: ScopeId) -> usize {
        self.scope(id).map_or(0, |scope| scope.slots.len())
    }

    #[cfg(test)]
    pub fn is_live(&self, id: ScopeId) -> bool {
        self.scope(id).is_some()
    }

    #[cfg(test)]
    pub fn live_scopes(&self) -> usize {
        self.scopes.iter().flatten().count()
    }

    /// Follows `enclosing` links `depth` times.
    fn resolve(&self, id: ScopeId, depth: usize) -> Option<ScopeId> {
        let mut current = id;
        for _ in 0..depth {
            current = self.scope(current)?.enclosing?;
        }
        Some(current)
    }

    pub fn insert(&mut self, id: ScopeId, value: Value) {
        if let Some(scope) = self.scope_mut(id) {
            scope.slots.push(value);
        }
    }

    pub fn get(&self, id: ScopeId, depth: usize, index: usize) -> Option<&Value> {
        let target = self.resolve(id, depth)?;
        self.scope(target)?.slots.get(index)
    }

    pub fn get_mut(&mut self, id: ScopeId, depth: usize, index: usize) -> Option<&mut Value> {
        let target = self.resolve(id, depth)?;
        self.scope_mut(target)?.slots.get_mut(index)
    }

    /// Replaces the slot, or accumulates into it for `++`/`--`.
    pub fn set(
        &mut self,
        id: ScopeId,
        depth: usize,
        index: usize,
        value: Value,
        mode: SetMode,
    ) -> Result<(), Fault> {
        let slot = self
            .get_mut(id, depth, index)
            .ok_or_else(|| missing(depth, index))?;
        *slot = accumulate(slot, value, mode)?;
        Ok(())
    }

    pub fn add_module(&mut self, id: ScopeId, module: ModuleHandle) {
        if let Some(scope) = self.scope_mut(id) {
            scope.modules.push(module);
        }
    }

    pub fn module(&self, id: ScopeId, depth: usize, index: usize) -> Option<&ModuleHandle> {
        let target = self.resolve(id, depth)?;
        self.scope(target)?.modules.get(index)
    }
}

pub(crate) fn accumulate(current: &Value, value: Value, mode: SetMode) -> Result<Value, Fault> {
    match mode {
        SetMode::Assign => Ok(value),
        SetMode::Add => current.add(&value),
        SetMode::Subtract => current.sub(&value),
    }
}

pub(crate) fn missing(depth: usize, index: usize) -> Fault {
    Fault::new(
        ErrorCode::VariableMissing,
        format!("no value at m{depth}.{index}"),
    )
}
