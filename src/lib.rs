//! Lexer, parser, semantic analyzer and tree-walking interpreter for the quill
//! scripting language.
//!
//! Variables have no names at runtime. Every reference is a `(depth, index)` pair that the
//! analyzer checks against the same scope layout the interpreter builds.

pub mod analyzer;
pub mod ast;
pub mod builtins;
pub mod error;
pub mod host;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod registry;
pub mod token;

use std::mem;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::debug;

pub use error::{Diagnostic, Error, ErrorCode, Result};
pub use interpreter::{Output, Value};
pub use registry::ModuleRegistry;

use analyzer::SemanticAnalyzer;
use ast::Program;
use interpreter::Interpreter;

/// Name inline sources are registered under inside the import root.
const INLINE_UNIT: &str = "__main__";

/// Runs the whole pipeline over files or inline sources sharing one import root.
#[derive(Debug)]
pub struct Engine {
    registry: ModuleRegistry,
    output: Output,
}

impl Engine {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            registry: ModuleRegistry::new(root),
            output: Output::Stdout,
        }
    }

    pub fn with_output(mut self, output: Output) -> Self {
        self.output = output;
        self
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// Host modules are registered through here before running anything.
    pub fn registry_mut(&mut self) -> &mut ModuleRegistry {
        &mut self.registry
    }

    pub fn output(&self) -> &Output {
        &self.output
    }

    pub fn run_file(&mut self, path: &Path) -> Result<()> {
        let program = parser::parse_file(path, &mut self.registry)?;
        self.execute(&program)
    }

    pub fn run_source(&mut self, source: &str) -> Result<()> {
        let program = self.check_source(source)?;
        self.run_checked(&program)
    }

    /// Parses and analyzes `source` without running it.
    pub fn check_source(&mut self, source: &str) -> Result<Rc<Program>> {
        let path = self.registry.resolve(INLINE_UNIT);
        let program = parser::parse_source(source, &path, &mut self.registry)?;
        SemanticAnalyzer::new(&self.registry).analyze(&program)?;
        Ok(program)
    }

    fn execute(&mut self, program: &Program) -> Result<()> {
        SemanticAnalyzer::new(&self.registry).analyze(program)?;
        self.run_checked(program)
    }

    fn run_checked(&mut self, program: &Program) -> Result<()> {
        debug!(path = %program.path.display(), "running");
        let output = mem::take(&mut self.output);
        let mut interpreter = Interpreter::with_output(&self.registry, output);
        let result = interpreter.run(program).map(|_| ());
        self.output = interpreter.into_output();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn engine() -> Engine {
        Engine::new("").with_output(Output::captured())
    }

    #[test]
    fn runs_inline_sources() {
        let mut engine = engine();
        let source = indoc! {"
            # squares below ten #
            [],
            ?/ RANGE<1, 4>: M.0.PUSH<M0 ** 2>;,
            P<M0, LEN<M0>>
        "};
        engine.run_source(source).expect("run failed");
        assert_eq!(engine.output().lines(), ["[1, 4, 9] 3"]);
    }

    #[test]
    fn stages_tag_their_errors() {
        let mut engine = engine();
        assert!(matches!(engine.run_source("'open"), Err(Error::Lex(_))));
        assert!(matches!(engine.run_source("P<"), Err(Error::Parse(_))));
        assert!(matches!(engine.run_source("P<M3>"), Err(Error::Semantic(_))));
        assert!(matches!(engine.run_source("[], P<M0[0]>"), Err(Error::Runtime(_))));
    }

    #[test]
    fn check_source_does_not_run() {
        let mut engine = engine();
        engine.check_source("P<'quiet'>").expect("valid program");
        assert!(engine.output().lines().is_empty());
    }

    #[test]
    fn embedders_can_add_host_modules() {
        use host::{HostFunction, HostModule};

        let mut engine = engine();
        engine.registry_mut().host_mut().register(HostModule::new("app").function(
            HostFunction {
                name: "answer",
                params_num: 0,
                default_count: 0,
                produces_value: true,
                call: |_| Ok(Value::Int(42)),
            },
        ));
        engine
            .run_source("@^'app', P<$0 ^answer<>>")
            .expect("run failed");
        assert_eq!(engine.output().lines(), ["42"]);
    }
}
