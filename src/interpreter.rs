use std::io::{self, Write};
use std::path::PathBuf;
use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::ast::Program;
use crate::error::Result;
use crate::registry::ModuleRegistry;

mod memory;
mod runtime;
mod value;

pub use memory::{Memory, ModuleHandle, ScopeId};
pub use value::{Closure, FileHandle, Key, MacroClosure, Value};

use runtime::{CallFrame, LoopFrame};

/// Where `P` and the `I` prompt write to.
#[derive(Debug, Default)]
pub enum Output {
    #[default]
    Stdout,
    Captured(Vec<String>),
}

impl Output {
    pub fn captured() -> Self {
        Self::Captured(Vec::new())
    }

    pub fn write_line(&mut self, line: String) {
        match self {
            Self::Stdout => println!("{line}"),
            Self::Captured(lines) => lines.push(line),
        }
    }

    pub fn prompt(&mut self, text: &str) {
        match self {
            Self::Stdout => {
                print!("{text}");
                let _ = io::stdout().flush();
            }
            Self::Captured(lines) => lines.push(text.to_string()),
        }
    }

    /// Captured lines. Always empty for stdout.
    pub fn lines(&self) -> &[String] {
        match self {
            Self::Stdout => &[],
            Self::Captured(lines) => lines,
        }
    }

    pub fn text(&self) -> String {
        self.lines().join("\n")
    }
}

/// Tree-walking backend that executes analyzed programs against a [`Memory`] arena.
pub struct Interpreter<'r> {
    registry: &'r ModuleRegistry,
    memory: Memory,
    current: ScopeId,
    file: Rc<str>,
    calls: Vec<CallFrame>,
    loops: Vec<LoopFrame>,
    executed: FxHashMap<PathBuf, ScopeId>,
    output: Output,
}

impl<'r> Interpreter<'r> {
    pub fn new(registry: &'r ModuleRegistry) -> Self {
        Self::with_output(registry, Output::Stdout)
    }

    pub fn with_output(registry: &'r ModuleRegistry, output: Output) -> Self {
        let mut memory = Memory::new();
        let current = memory.open("host", None, None);
        memory.pin(current);
        Self {
            registry,
            memory,
            current,
            file: Rc::from(""),
            calls: Vec::new(),
            loops: Vec::new(),
            executed: FxHashMap::default(),
            output,
        }
    }

    /// Executes `program` and returns its root scope. Units already executed by this
    /// interpreter are not run again.
    pub fn run(&mut self, program: &Program) -> Result<ScopeId> {
        self.run_unit(program)
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn output(&self) -> &Output {
        &self.output
    }

    pub fn into_output(self) -> Output {
        self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::SemanticAnalyzer;
    use crate::error::{Error, ErrorCode};
    use crate::parser::{parse, parse_file, parse_source};
    use indoc::indoc;
    use std::path::Path;
    use std::{env, fs};

    fn run_in(registry: &mut ModuleRegistry, source: &str) -> Result<Vec<String>> {
        let program = parse_source(source, Path::new("<test>"), registry)?;
        SemanticAnalyzer::new(registry).analyze(&program)?;
        let mut interpreter = Interpreter::with_output(registry, Output::captured());
        interpreter.run(&program)?;
        Ok(interpreter.into_output().lines().to_vec())
    }

    fn run(source: &str) -> Result<Vec<String>> {
        run_in(&mut ModuleRegistry::new(""), source)
    }

    fn output(source: &str) -> Vec<String> {
        run(source).expect("program failed")
    }

    fn runtime_code(source: &str) -> ErrorCode {
        let err = run(source).expect_err("expected runtime error");
        assert!(matches!(err, Error::Runtime(_)), "got {err}");
        err.code()
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("quill-interp-{name}-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    #[test]
    fn evaluates_arithmetic_and_prints() {
        assert_eq!(
            output("P<1 + 2 * 3, 7 // 2, 7 / 2, -7 % 3, 'a' + 'b', 2 ** 10>"),
            ["7 3 3.5 2 ab 1024"]
        );
        assert_eq!(output("P<1 = 1.0, 'a' </ 'b', ! 0, 0 | 'x', [] & 1>"), ["T T T T F"]);
    }

    #[test]
    fn recursive_functions_resolve_through_their_definition_scope() {
        let source = indoc! {"
            1: ? M0 </ 2: R<M.0>;, R<M.0<M0 - 1> + M.0<M0 - 2>>;,
            P<M0<10>>
        "};
        assert_eq!(output(source), ["55"]);
    }

    #[test]
    fn nested_closures_see_the_enclosing_call() {
        let source = indoc! {"
            1:
              1: ? M0 >/ 0: R<M.0 + M..1<M.0 - 1>>;, R<M.0>;,
              R<M1<M0>>;,
            P<M0<4>, M0<1>>
        "};
        assert_eq!(output(source), ["10 1"]);
    }

    #[test]
    fn call_scopes_are_released_after_nested_declarations() {
        let registry = ModuleRegistry::new("");
        let program = parse("1: : R<1>;, R<M1>;, ?/ RANGE<5000>: M.0<M0>;").expect("parse");
        SemanticAnalyzer::new(&registry)
            .analyze(&program)
            .expect("analyze");
        let mut interpreter = Interpreter::with_output(&registry, Output::captured());
        interpreter.run(&program).expect("run");
        assert!(interpreter.memory().live_scopes() < 100);
    }

    #[test]
    fn defaults_fill_missing_trailing_arguments() {
        let source = "1 || M0 * 2, 5: R<M0 + M1 + M2>;, P<M0<1>, M0<1, 1>, M0<1, 1, 1>>";
        assert_eq!(output(source), ["8 7 3"]);
    }

    #[test]
    fn while_loops_honor_break_and_continue() {
        let source = indoc! {"
            0,
            ?? T:
              S.0 ++ 1,
              ? M.0 = 2: C;,
              ? M.0 >/ 4: B;,
              P<M.0>;,
            P<'done', M0>
        "};
        assert_eq!(output(source), ["1", "3", "4", "done 5"]);
    }

    #[test]
    fn break_only_leaves_the_innermost_loop() {
        let source = "?/ [1, 2, 3]: ?/ RANGE<10>: ? M0 = 2: B;, P<M.0 * 10 + M0>;;";
        assert_eq!(output(source), ["10", "11", "20", "21", "30", "31"]);
    }

    #[test]
    fn return_unwinds_loops_inside_functions() {
        let source = "1: ?/ M0: ? M0 >/ 2: R<M.0>;;, R<X>;, P<M0<[1, 5, 9]>, M0<[1]>>";
        assert_eq!(output(source), ["5 X"]);
    }

    #[test]
    fn macros_return_values_and_break_their_callers_loop() {
        assert_eq!(output("D 2: R<~0 * ~1>;, P<M0<3, 4>>"), ["12"]);
        let source = indoc! {"
            D 1: ? ~0 >/ 2: B;;,
            ?/ RANGE<10>: M.0<M0>, P<M0>;
        "};
        assert_eq!(output(source), ["0", "1", "2"]);
    }

    #[test]
    fn indexed_sets_update_nested_elements() {
        let source = indoc! {"
            [1, [2, 3]], {'a': 1},
            S0[1][0] => 9, S1['b'] => 2, S1['a'] ++ 5,
            P<M0, M1, M0[-1][1]>
        "};
        assert_eq!(output(source), ["[1, [9, 3]] {'a': 6, 'b': 2} 3"]);
    }

    #[test]
    fn mutating_builtins_write_back_to_the_receiver() {
        let source = "[1], M0.PUSH<2>, PUSH<M0, 3>, P<M0, M0.POP<>, M0>";
        assert_eq!(output(source), ["[1, 2, 3] 3 [1, 2]"]);
        assert_eq!(output("[[1], 5], M0[0].PUSH<2>, P<M0>"), ["[[1, 2], 5]"]);
    }

    #[test]
    fn call_results_can_be_indexed() {
        assert_eq!(output(": R<[1, 2]>;, D: R<'ab'>;, P<M0[1], M1[0]>"), ["2 a"]);
    }

    #[test]
    fn write_back_leaves_function_slots_alone() {
        assert_eq!(output(": R<[1]>;, M0.PUSH<2>, P<M0>"), ["[1]"]);
        assert_eq!(output("D: R<[1]>;, M0.POP<>, P<M0>"), ["[1]"]);
    }

    #[test]
    fn interpolates_and_decodes_strings() {
        assert_eq!(output("3, P<`v={M0 * 2}!`>"), ["v=6!"]);
        assert_eq!(output(r"P<'a\tb'>"), ["a\tb"]);
    }

    #[test]
    fn host_calls_and_modules() {
        let source = "@^'math', P<$0 ^floor<2.7>, ^abs<-3>, ^max<1, 2>, $0 ^pi>";
        assert_eq!(output(source), ["2 3 2 3.141592653589793"]);
        assert_eq!(output("@^'text', P<$0 ^upper<'ab'>>"), ["AB"]);
    }

    #[test]
    fn host_module_arguments_resolve_against_the_root() {
        assert_eq!(output("@^'math', P<$0 ^sqrt<^abs<-4>>>"), ["2.0"]);
        let err = run("@^'math', P<$0 ^sqrt<^nope<1>>>").expect_err("unknown root function");
        assert_eq!(err.code(), ErrorCode::IdNotFound);
    }

    #[test]
    fn value_errors_carry_runtime_codes() {
        assert_eq!(runtime_code("[1, 2], P<M0[5]>"), ErrorCode::IndexOutOfRange);
        assert_eq!(runtime_code("{'a': 1}, P<M0['b']>"), ErrorCode::IndexOutOfRange);
        assert_eq!(runtime_code("P<1 // 0>"), ErrorCode::TypeError);
        assert_eq!(runtime_code("'a', S0 -- 1"), ErrorCode::TypeError);
        assert_eq!(runtime_code("P<INT<'x'>>"), ErrorCode::ParamType);
    }

    #[test]
    fn runtime_errors_are_located() {
        let err = run("1,\nP<M0 + 'a'>").expect_err("type error");
        let diagnostic = err.diagnostic();
        assert_eq!(diagnostic.file, "<test>");
        assert_eq!((diagnostic.location.line, diagnostic.location.column), (2, 6));
    }

    #[test]
    fn control_flow_outside_callables_is_rejected_at_runtime() {
        let registry = ModuleRegistry::new("");
        for (source, code) in [
            ("R<1>", ErrorCode::InvalidReturn),
            ("B", ErrorCode::InvalidBreak),
            ("C", ErrorCode::InvalidContinue),
        ] {
            let program = parse(source).expect("parse");
            let mut interpreter = Interpreter::with_output(&registry, Output::captured());
            let err = interpreter.run(&program).expect_err("unanalyzed control flow");
            assert_eq!(err.code(), code);
        }
    }

    #[test]
    fn runtime_slots_match_static_slots() {
        let source = indoc! {"
            1, P<M0>, 'x', : R<1>;, D: R<2>;, PUSH<[1], 2>, => P<3>,
            ? T: 4, 5;
        "};
        let mut registry = ModuleRegistry::new("");
        let program = parse_source(source, Path::new("<test>"), &mut registry).expect("parse");
        let mut analyzer = SemanticAnalyzer::new(&registry);
        let table = analyzer.analyze(&program).expect("analyze");
        let mut interpreter = Interpreter::with_output(&registry, Output::captured());
        let scope = interpreter.run(&program).expect("run");

        assert_eq!(interpreter.memory().len(scope), analyzer.tables().len(table));
        assert_eq!(interpreter.memory().len(scope), 5);
        assert_eq!(interpreter.memory().get(scope, 0, 4), Some(&Value::Null));
    }

    #[test]
    fn file_blocks_read_append_and_close() {
        let dir = scratch_dir("files");
        fs::write(dir.join("log.txt"), "a").expect("seed file");
        let mut registry = ModuleRegistry::new(&dir);
        let source = "FA 'log.txt': M0.WRITE<'b'>;, FR 'log.txt': P<M0.READ<>>;";
        assert_eq!(run_in(&mut registry, source).expect("run"), ["ab"]);

        // The handle escapes through R but the block still closes it.
        let source = ": FW 'x.txt': R<M0>;;, M0.WRITE<'z'>";
        let err = run_in(&mut registry, source).expect_err("closed handle");
        assert_eq!(err.code(), ErrorCode::InvalidFunctionCall);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn imports_run_once_and_expose_members() {
        let dir = scratch_dir("imports");
        fs::write(dir.join("lib.ql"), "P<'loading'>, 1: R<M0 * 2>;").expect("write lib");
        fs::write(dir.join("main.ql"), "@ 'lib', @ './lib', P<$0 M0<4>, $1 M0<5>>")
            .expect("write main");

        let mut registry = ModuleRegistry::new(&dir);
        let program = parse_file(&dir.join("main.ql"), &mut registry).expect("parse");
        SemanticAnalyzer::new(&registry)
            .analyze(&program)
            .expect("analyze");
        let mut interpreter = Interpreter::with_output(&registry, Output::captured());
        interpreter.run(&program).expect("run");
        assert_eq!(interpreter.output().lines(), ["loading", "8 10"]);
        let _ = fs::remove_dir_all(&dir);
    }
}
