//! In-process round-trip tests.
//!
//! For every program here the value computed by the JIT-compiled Main must
//! equal the reference interpreter's value to bit-exact f64 equality, with
//! optimizations on and off.

#![cfg(all(target_arch = "x86_64", feature = "jit"))]

use turbine::compiler;
use turbine::jit::{self, JitOptions};
use turbine::Vm;

fn vm_result(source: &str) -> f64 {
    let program = compiler::compile("test.tb", source).unwrap();
    Vm::new().run(&program).unwrap()
}

fn jit_result(source: &str, use_optimizations: bool) -> f64 {
    let program = compiler::compile("test.tb", source).unwrap();
    let function = jit::compile(
        &program.functions[program.main],
        JitOptions { use_optimizations },
    )
    .unwrap();
    function.call()
}

fn assert_round_trip(source: &str) {
    let expected = vm_result(source);
    for use_optimizations in [true, false] {
        let actual = jit_result(source, use_optimizations);
        assert_eq!(
            actual.to_bits(),
            expected.to_bits(),
            "jit (optimizations={}) returned {}, interpreter returned {}\nsource: {}",
            use_optimizations,
            actual,
            expected,
            source
        );
    }
}

#[test]
fn test_pure_arithmetic() {
    assert_round_trip("Fn Main: Return 1 + 2 * 3; End Fn");
    assert_round_trip("Fn Main: Return (1 + 2) * 3; End Fn");
    assert_round_trip("Fn Main: Return 10 - 4 - 3; End Fn");
    assert_round_trip("Fn Main: Return 100 / 8 / 2; End Fn");
}

#[test]
fn test_inexact_division() {
    // No exact binary representation; both sides must round identically.
    assert_round_trip("Fn Main: Return 1 / 3; End Fn");
    assert_round_trip("Fn Main: Return 10 / 3 * 7 / 11; End Fn");
}

#[test]
fn test_const_reuse() {
    assert_round_trip("Fn Main: Const x = 10; Return x + x; End Fn");
    assert_round_trip("Fn Main: Const x = 2.5; Const y = 4; Return x * y + x; End Fn");
}

#[test]
fn test_const_reuse_chained_operations() {
    // Repeated reads of one aliased identifier through separate consuming
    // operations; each must see the original value.
    assert_round_trip("Fn Main: Const x = 10; Return x + x + x; End Fn");
    assert_round_trip("Fn Main: Const x = 3; Return x * x + x * x; End Fn");
    assert_round_trip("Fn Main: Const x = 2; Const y = 5; Return x * y + y * x - x; End Fn");
}

#[test]
fn test_const_read_after_comparison() {
    // The compare writes its boolean into a register; the compared
    // constant must still be readable afterwards.
    assert_round_trip(
        "Fn Main: Const x = 1; If x == 2 Then Return 100; End If Return x; End Fn",
    );
    assert_round_trip(
        "Fn Main: Const x = 5; Any s = 0; If x > 2 Then s = x; End If Return s + x; End Fn",
    );
}

#[test]
fn test_assignments() {
    assert_round_trip("Fn Main: Any a = 0; a = 5; a = a + 3; Return a; End Fn");
    assert_round_trip("Fn Main: Any a = 1; Any b = 2; a = b + a; b = a - b; Return a * 10 + b; End Fn");
}

#[test]
fn test_if_both_paths() {
    assert_round_trip(
        "Fn Main: Const x = 1; If x == 2 Then Return 100; End If Return 7; End Fn",
    );
    assert_round_trip(
        "Fn Main: Const x = 2; If x == 2 Then Return 100; End If Return 7; End Fn",
    );
}

#[test]
fn test_comparison_values() {
    assert_round_trip("Fn Main: Return (1 < 2) + (3 != 3) + (2 > 1) + (4 == 4); End Fn");
    assert_round_trip("Fn Main: Return (2 < 1) + (3 == 4); End Fn");
}

#[test]
fn test_while_countdown() {
    assert_round_trip(
        "Fn Main: Any i = 5; Any s = 0; \
         While i > 0 Then s = s + i; i = i - 1; End While \
         Return s; End Fn",
    );
}

#[test]
fn test_nested_while() {
    // 3 + 2 + 1 inner iterations in total.
    assert_round_trip(
        "Fn Main: Any i = 3; Any s = 0; Any j = 0; \
         While i > 0 Then \
           j = i; \
           While j > 0 Then s = s + 1; j = j - 1; End While \
           i = i - 1; \
         End While \
         Return s; End Fn",
    );
}

#[test]
fn test_if_inside_while() {
    assert_round_trip(
        "Fn Main: Any i = 6; Any s = 0; \
         While i > 0 Then \
           If i > 3 Then s = s + i; End If \
           i = i - 1; \
         End While \
         Return s; End Fn",
    );
}

#[test]
fn test_spill_pressure() {
    // Nine right-nested subtractions keep ten constants live at once.
    assert_round_trip(
        "Fn Main: Return 1 - (2 - (3 - (4 - (5 - (6 - (7 - (8 - (9 - 10)))))))); End Fn",
    );
}

#[test]
fn test_constant_fold_after_reassignment() {
    // The pool still holds 2.0 but no live register does, so the add folds
    // it into a memory operand.
    assert_round_trip("Fn Main: Any a = 2; a = 5; Return a + 2; End Fn");
}

#[test]
fn test_fractional_arithmetic() {
    assert_round_trip("Fn Main: Return 0.1 + 0.2; End Fn");
    assert_round_trip("Fn Main: Const half = 0.5; Return 10 * half - 1.25; End Fn");
}

#[test]
fn test_while_loop_longer() {
    assert_round_trip(
        "Fn Main: Any i = 100; Any s = 0; \
         While i > 0 Then s = s + i * i; i = i - 1; End While \
         Return s; End Fn",
    );
}
