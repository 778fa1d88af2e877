#![allow(dead_code)]
use std::fs;
use std::path::Path;
use std::rc::Rc;

use quill::ModuleRegistry;
use quill::ast::Program;
use quill::parser;
use test_support::{Case, bench_cases};

pub const PROGRAMS_DIR: &str = "tests/programs";

/// Fixture cases with `bench.enabled`, labelled by directory name.
pub fn workloads() -> Vec<Case> {
    bench_cases(Path::new(PROGRAMS_DIR), None).unwrap_or_else(|err| panic!("load cases: {err}"))
}

pub fn load_source(case: &Case) -> String {
    fs::read_to_string(&case.program_path)
        .unwrap_or_else(|err| panic!("read {}: {err}", case.program_path.display()))
}

pub fn load_program(case: &Case) -> (ModuleRegistry, Rc<Program>) {
    let source = load_source(case);
    let mut registry = ModuleRegistry::new(&case.dir);
    let program = parser::parse_source(&source, &case.program_path, &mut registry)
        .unwrap_or_else(|err| panic!("parse {}: {err}", case.name));
    (registry, program)
}
