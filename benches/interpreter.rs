mod common;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use quill::Output;
use quill::analyzer::SemanticAnalyzer;
use quill::interpreter::Interpreter;

fn bench_interpreter(c: &mut Criterion) {
    for case in common::workloads() {
        let (registry, program) = common::load_program(&case);
        SemanticAnalyzer::new(&registry)
            .analyze(&program)
            .expect("analyze");

        c.bench_function(&format!("interpreter_run_{}", case.name), |b| {
            b.iter(|| {
                let mut interpreter = Interpreter::with_output(&registry, Output::captured());
                interpreter.run(black_box(&program)).expect("run");
                black_box(interpreter.into_output());
            })
        });
    }
}

criterion_group!(benches, bench_interpreter);
criterion_main!(benches);
