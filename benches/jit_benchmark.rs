//! Benchmarks comparing the reference interpreter against the JIT.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

use turbine::compiler;
use turbine::Vm;

/// Sum loop - tests loop performance and arithmetic
fn sum_loop_source(n: u32) -> String {
    format!(
        "Fn Main: \
           Any total = 0; \
           Any i = 1; \
           While i < {} Then \
             total = total + i; \
             i = i + 1; \
           End While \
           Return total; \
         End Fn",
        n + 1
    )
}

fn bench_interpreter_vs_jit(c: &mut Criterion) {
    let mut group = c.benchmark_group("interpreter_vs_jit");
    group.sample_size(20);
    group.measurement_time(Duration::from_secs(5));

    let source = sum_loop_source(100_000);
    let program = compiler::compile("bench.tb", &source).unwrap();

    group.bench_function("sum_loop_interpreter", |b| {
        b.iter(|| {
            let mut vm = Vm::new();
            vm.run(black_box(&program)).unwrap()
        })
    });

    #[cfg(all(target_arch = "x86_64", feature = "jit"))]
    {
        use turbine::jit::{self, JitOptions};

        group.bench_function("sum_loop_jit_compile_and_run", |b| {
            b.iter(|| {
                let function = jit::compile(
                    black_box(&program.functions[program.main]),
                    JitOptions::default(),
                )
                .unwrap();
                function.call()
            })
        });

        let function =
            jit::compile(&program.functions[program.main], JitOptions::default()).unwrap();
        group.bench_function("sum_loop_jit_run_only", |b| {
            b.iter(|| black_box(&function).call())
        });
    }

    group.finish();
}

criterion_group!(benches, bench_interpreter_vs_jit);
criterion_main!(benches);
