use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::ast::Program;
use crate::host::HostNamespace;

pub const EXTENSION: &str = "ql";

#[derive(Debug, Clone)]
enum Unit {
    Pending,
    Ready(Rc<Program>),
}

/// Parse state of a source file as seen from an import.
#[derive(Debug, Clone)]
pub enum UnitStatus {
    Missing,
    Pending,
    Ready(Rc<Program>),
}

/// Source units known to one run, keyed by resolved path.
///
/// A unit is `Pending` from the moment its parse starts until its AST is stored, so an
/// import that reaches a pending unit is a cycle. Every later stage reads ASTs from here.
#[derive(Debug)]
pub struct ModuleRegistry {
    root: PathBuf,
    units: FxHashMap<PathBuf, Unit>,
    host: HostNamespace,
}

impl ModuleRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            units: FxHashMap::default(),
            host: HostNamespace::standard(),
        }
    }

    /// Path an `@ 'name'` import refers to. Existing files are canonicalized so that
    /// `'lib'` and `'./lib'` name the same unit.
    pub fn resolve(&self, name: &str) -> PathBuf {
        let joined = self.root.join(format!("{name}.{EXTENSION}"));
        fs::canonicalize(&joined).unwrap_or(joined)
    }

    /// Path a file-open statement refers to.
    pub fn resolve_file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn status(&self, path: &Path) -> UnitStatus {
        match self.units.get(path) {
            None => UnitStatus::Missing,
            Some(Unit::Pending) => UnitStatus::Pending,
            Some(Unit::Ready(program)) => UnitStatus::Ready(Rc::clone(program)),
        }
    }

    pub fn begin(&mut self, path: &Path) {
        debug!(path = %path.display(), "parsing unit");
        self.units.insert(path.to_path_buf(), Unit::Pending);
    }

    pub fn complete(&mut self, program: Program) -> Rc<Program> {
        let program = Rc::new(program);
        debug!(path = %program.path.display(), "unit parsed");
        self.units
            .insert(program.path.clone(), Unit::Ready(Rc::clone(&program)));
        program
    }

    pub fn unit(&self, path: &Path) -> Option<Rc<Program>> {
        match self.units.get(path) {
            Some(Unit::Ready(program)) => Some(Rc::clone(program)),
            _ => None,
        }
    }

    pub fn host(&self) -> &HostNamespace {
        &self.host
    }

    pub fn host_mut(&mut self) -> &mut HostNamespace {
        &mut self.host
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{BlockKind, StatementList};

    fn empty(path: &Path) -> Program {
        Program {
            path: path.to_path_buf(),
            statements: StatementList {
                kind: BlockKind::Program,
                children: Vec::new(),
            },
        }
    }

    #[test]
    fn resolves_imports_against_the_root() {
        let registry = ModuleRegistry::new("scripts");
        assert_eq!(registry.resolve("util"), Path::new("scripts/util.ql"));
        assert_eq!(registry.resolve_file("data.txt"), Path::new("scripts/data.txt"));
    }

    #[test]
    fn equivalent_import_paths_resolve_to_one_unit() {
        let dir = std::env::temp_dir().join(format!("quill-registry-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("create scratch dir");
        fs::write(dir.join("lib.ql"), "1").expect("write lib");

        let registry = ModuleRegistry::new(&dir);
        let plain = registry.resolve("lib");
        assert_eq!(plain, registry.resolve("./lib"));
        let name = dir.file_name().expect("dir name").to_string_lossy();
        assert_eq!(plain, registry.resolve(&format!("../{name}/lib")));
        assert!(plain.is_absolute());
    }

    #[test]
    fn tracks_pending_and_completed_units() {
        let mut registry = ModuleRegistry::new("");
        let path = registry.resolve("main");
        assert!(matches!(registry.status(&path), UnitStatus::Missing));

        registry.begin(&path);
        assert!(matches!(registry.status(&path), UnitStatus::Pending));
        assert!(registry.unit(&path).is_none());

        registry.complete(empty(&path));
        assert!(matches!(registry.status(&path), UnitStatus::Ready(_)));
        assert!(registry.unit(&path).is_some());
    }
}
