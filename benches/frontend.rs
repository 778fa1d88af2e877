mod common;

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use quill::ModuleRegistry;
use quill::analyzer::SemanticAnalyzer;
use quill::{lexer, parser};

fn bench_frontend(c: &mut Criterion) {
    for case in common::workloads() {
        let label = &case.name;
        let source = common::load_source(&case);

        c.bench_function(&format!("frontend_tokenize_{label}"), |b| {
            b.iter(|| {
                let out = lexer::tokenize(black_box(&source)).expect("tokenize");
                black_box(out);
            })
        });

        c.bench_function(&format!("frontend_parse_{label}"), |b| {
            b.iter(|| {
                let mut registry = ModuleRegistry::new(&case.dir);
                let out = parser::parse_source(black_box(&source), &case.program_path, &mut registry)
                    .expect("parse");
                black_box(out);
            })
        });

        let (registry, program) = common::load_program(&case);
        c.bench_function(&format!("frontend_analyze_{label}"), |b| {
            b.iter(|| {
                let out = SemanticAnalyzer::new(&registry)
                    .analyze(black_box(&program))
                    .expect("analyze");
                black_box(out);
            })
        });
    }
}

criterion_group!(benches, bench_frontend);
criterion_main!(benches);
