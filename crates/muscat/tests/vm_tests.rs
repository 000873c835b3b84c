//! End-to-end interpreter tests: source text in, final value out.

use muscat::{InterpretError, Value, Vm};
use pretty_assertions::assert_eq;

fn vm() -> Vm {
    let mut vm = Vm::new(Vec::new());
    vm.register_core_modules().expect("core modules must register");
    vm
}

fn eval(vm: &mut Vm, source: &str) -> Value {
    match vm.eval_string(source) {
        Ok(value) => value,
        Err(e) => panic!("eval failed for {source:?}: {e}"),
    }
}

fn eval_number(source: &str) -> f64 {
    let mut vm = vm();
    match eval(&mut vm, source) {
        Value::Number(n) => n,
        other => panic!("expected a number from {source:?}, got {other:?}"),
    }
}

#[test]
fn returns_basic_values() {
    let mut vm = vm();
    assert_eq!(eval(&mut vm, "311"), Value::Number(311.0));
    assert_eq!(eval(&mut vm, "#t"), Value::Bool(true));
    assert_eq!(eval(&mut vm, "#f"), Value::Bool(false));
    assert_eq!(eval(&mut vm, "#\\a"), Value::Char(b'a'));
    assert_eq!(eval(&mut vm, "'()"), Value::Empty);
}

#[test]
fn evaluates_arithmetic_and_comparison() {
    assert_eq!(eval_number("(+ 3 1)"), 4.0);
    assert_eq!(eval_number("(- 10 4)"), 6.0);
    assert_eq!(eval_number("(* 6 7)"), 42.0);
    assert_eq!(eval_number("(/ 9 2)"), 4.5);
    assert_eq!(eval_number("(% 7 3)"), 1.0);

    let mut vm = vm();
    assert_eq!(eval(&mut vm, "(> 2 1)"), Value::Bool(true));
    assert_eq!(eval(&mut vm, "(<= 2 1)"), Value::Bool(false));
    assert_eq!(eval(&mut vm, "(eqv? 3 3)"), Value::Bool(true));
}

#[test]
fn evaluates_and_or() {
    assert_eq!(
        eval_number(
            "(or (and #f 2 3)\
                 (and 3 2 #f)\
                 (and 2 3 4)\
                 #f)"
        ),
        4.0
    );

    let mut vm = vm();
    assert_eq!(eval(&mut vm, "(and #t #f)"), Value::Bool(false));
    assert_eq!(eval(&mut vm, "(or #f #f)"), Value::Bool(false));
}

#[test]
fn evaluates_if_branches() {
    assert_eq!(eval_number("(if #t (+ 3 1) 2)"), 4.0);
    assert_eq!(eval_number("(if #f (+ 3 1) 2)"), 2.0);
    // A missing else arm produces #f.
    let mut vm = vm();
    assert_eq!(eval(&mut vm, "(if #f 1)"), Value::Bool(false));
}

#[test]
fn evaluates_let() {
    assert_eq!(eval_number("(let ((x 3) (y 4)) (+ x y))"), 7.0);
    assert_eq!(eval_number("(let () 5)"), 5.0);
}

#[test]
fn closures_capture_their_environment() {
    let source = "\
        (define (make-adder n)\
          (lambda (x) (+ x n)))\
        (define add2 (make-adder 2))\
        (add2 40)";
    assert_eq!(eval_number(source), 42.0);
}

#[test]
fn set_through_an_upvalue_is_visible_to_all_captures() {
    let source = "\
        (define (make-counter)\
          (let ((count 0))\
            (lambda ()\
              (set! count (+ count 1))\
              count)))\
        (define tick (make-counter))\
        (tick)\
        (tick)\
        (tick)";
    assert_eq!(eval_number(source), 3.0);
}

#[test]
fn named_let_loops_with_constant_stack() {
    let source = "(let loop ((x 1)) (if (equal? x 5) x (loop (+ x 1))))";
    assert_eq!(eval_number(source), 5.0);

    // Far more iterations than FRAMES_MAX can hold without tail-call
    // frame reuse.
    let source = "(let loop ((x 1)) (if (equal? x 50000) x (loop (+ x 1))))";
    assert_eq!(eval_number(source), 50000.0);
}

#[test]
fn global_recursion_runs_in_tail_position() {
    let source = "\
        (define (countdown n)\
          (if (equal? n 0) 0 (countdown (- n 1))))\
        (countdown 50000)";
    assert_eq!(eval_number(source), 0.0);
}

#[test]
fn deep_non_tail_recursion_overflows_cleanly() {
    let mut vm = vm();
    let source = "\
        (define (grow n)\
          (if (equal? n 0) 0 (+ 1 (grow (- n 1)))))\
        (grow 100000)";
    match vm.eval_string(source) {
        Err(InterpretError::Runtime(e)) => assert!(e.message.contains("Stack overflow")),
        other => panic!("expected a stack overflow, got {other:?}"),
    }
}

#[test]
fn evaluates_reset_and_shift() {
    let source = "(+ 1 (reset (lambda () (* 2 (shift (lambda (k) (+ 2 (k 3))))))))";
    assert_eq!(eval_number(source), 9.0);
}

#[test]
fn shift_without_resume_discards_the_context() {
    let source = "(+ 1 (reset (lambda () (* 10 (shift (lambda (k) 4))))))";
    assert_eq!(eval_number(source), 5.0);
}

#[test]
fn nested_reset_with_a_later_shift() {
    let source = "(+ 1 (reset (lambda () (reset (lambda () 3)) (shift (lambda (k) 4)))))";
    assert_eq!(eval_number(source), 5.0);
}

#[test]
fn continuation_composes_with_surrounding_context() {
    // The captured continuation multiplies by 2; invoking it twice
    // within the shift body chains both applications.
    let source = "(reset (lambda () (* 2 (shift (lambda (k) (k (k 3)))))))";
    assert_eq!(eval_number(source), 12.0);
}

#[test]
fn record_round_trip() {
    let mut vm = vm();
    let source = "\
        (define-record-type p (fields x y))\
        (p-x (make-p :x 1 :y 2))";
    assert_eq!(eval(&mut vm, source), Value::Number(1.0));

    assert_eq!(eval(&mut vm, "(p? (make-p))"), Value::Bool(true));
    assert_eq!(eval(&mut vm, "(p? 0)"), Value::Bool(false));

    // Omitted fields default to #f.
    assert_eq!(eval(&mut vm, "(p-y (make-p :x 3))"), Value::Bool(false));
}

#[test]
fn record_setters_mutate_shared_instances() {
    let mut vm = vm();
    let source = "\
        (define-record-type point (fields x y))\
        (define origin (make-point :x 0 :y 0))\
        (point-x-set! origin 7)\
        (point-x origin)";
    assert_eq!(eval(&mut vm, source), Value::Number(7.0));
}

#[test]
fn record_accessors_reject_other_types() {
    let mut vm = vm();
    let source = "\
        (define-record-type a (fields v))\
        (define-record-type b (fields v))\
        (a-v (make-b :v 1))";
    match vm.eval_string(source) {
        Err(InterpretError::Runtime(e)) => assert!(e.message.contains("record")),
        other => panic!("expected a record type error, got {other:?}"),
    }
}

#[test]
fn apply_unrolls_its_argument_list() {
    assert_eq!(eval_number("(apply + '(1 2 3 4))"), 10.0);
    assert_eq!(eval_number("(apply + '())"), 0.0);
}

#[test]
fn rest_parameters_collect_trailing_arguments() {
    let source = "\
        (define (f x . a)\
          (car (cdr (cdr a))))\
        (f 1 2 3 4)";
    assert_eq!(eval_number(source), 4.0);

    // Nothing left over for the rest parameter leaves it #f.
    let mut vm = vm();
    let source = "\
        (define (g x . a) a)\
        (g 1)";
    assert_eq!(eval(&mut vm, source), Value::Bool(false));
}

#[test]
fn keyword_parameters_bind_by_name_with_defaults() {
    let mut vm = vm();
    let source = "\
        (module-import (muscat string))\
        (define (greet name :keys (greeting \"hi\"))\
          (string-append greeting \" \" name))\
        (greet \"bob\" :greeting \"yo\")";
    let value = eval(&mut vm, source);
    assert_eq!(vm.format_value(value), "yo bob");

    let value = eval(&mut vm, "(greet \"bob\")");
    assert_eq!(vm.format_value(value), "hi bob");

    // A keyword parameter with no default binds #f when omitted.
    let value = eval(&mut vm, "(define (h :keys k) k) (h)");
    assert_eq!(value, Value::Bool(false));
}

#[test]
fn unknown_keyword_arguments_are_an_error() {
    let mut vm = vm();
    eval(&mut vm, "(define (f x :keys k) x)");
    match vm.eval_string("(f 1 :bogus 2)") {
        Err(InterpretError::Runtime(e)) => {
            assert!(e.message.contains("Unknown keyword argument :bogus"));
        }
        other => panic!("expected an unknown-keyword error, got {other:?}"),
    }
}

#[test]
fn arity_mismatch_is_a_runtime_error() {
    let mut vm = vm();
    eval(&mut vm, "(define (two a b) a)");
    match vm.eval_string("(two 1)") {
        Err(InterpretError::Runtime(e)) => {
            assert!(e.message.contains("Expected 2 arguments but got 1"));
        }
        other => panic!("expected an arity error, got {other:?}"),
    }
}

#[test]
fn undefined_variables_are_a_runtime_error() {
    let mut vm = vm();
    match vm.eval_string("missing-binding") {
        Err(InterpretError::Runtime(e)) => {
            assert!(e.message.contains("Undefined variable 'missing-binding'"));
        }
        other => panic!("expected an undefined-variable error, got {other:?}"),
    }
}

#[test]
fn calling_a_non_function_is_a_runtime_error() {
    let mut vm = vm();
    match vm.eval_string("(3 4)") {
        Err(InterpretError::Runtime(e)) => assert!(e.message.contains("Can only call functions")),
        other => panic!("expected a non-callable error, got {other:?}"),
    }
}

#[test]
fn equal_recurses_structurally_but_eqv_does_not() {
    let mut vm = vm();
    assert_eq!(eval(&mut vm, "(equal? '(1 (2 3)) '(1 (2 3)))"), Value::Bool(true));
    assert_eq!(eval(&mut vm, "(eqv? '(1 2) '(1 2))"), Value::Bool(false));
    // Interned strings compare equal under both.
    assert_eq!(eval(&mut vm, "(eqv? \"abc\" \"abc\")"), Value::Bool(true));
}

#[test]
fn display_writes_to_the_output_port() {
    let mut vm = vm();
    vm.use_string_output();
    eval(&mut vm, "(display \"out: \") (display 42)");
    assert_eq!(vm.take_output(), "out: 42");
}

#[test]
fn quoted_data_prints_in_read_syntax() {
    let mut vm = vm();
    let value = eval(&mut vm, "'(1 (2 . 3) \"s\")");
    assert_eq!(vm.format_value(value), "(1 (2 . 3) s)");
}

#[test]
fn list_and_cons_operators_build_lists() {
    let mut vm = vm();
    let value = eval(&mut vm, "(list 1 2 3)");
    assert_eq!(vm.format_value(value), "(1 2 3)");
    let value = eval(&mut vm, "(cons 1 2)");
    assert_eq!(vm.format_value(value), "(1 . 2)");
    let value = eval(&mut vm, "(list)");
    assert_eq!(value, Value::Empty);
}

#[test]
fn native_helpers_round_trip() {
    let mut vm = vm();
    assert_eq!(eval(&mut vm, "(car '(1 2))"), Value::Number(1.0));
    let value = eval(&mut vm, "(append '(1) '(2 3))");
    assert_eq!(vm.format_value(value), "(1 2 3)");

    eval(&mut vm, "(module-import (muscat string))");
    let value = eval(&mut vm, "(number->string 4)");
    assert_eq!(vm.format_value(value), "4");

    eval(&mut vm, "(module-import (muscat list))");
    assert_eq!(eval(&mut vm, "(length '(1 2 3))"), Value::Number(3.0));
    assert_eq!(eval(&mut vm, "(list-ref '(1 2 3) 1)"), Value::Number(2.0));

    eval(&mut vm, "(module-import (muscat math))");
    assert_eq!(eval(&mut vm, "(max 1 9 4)"), Value::Number(9.0));
    assert_eq!(eval(&mut vm, "(expt 2 10)"), Value::Number(1024.0));
}

#[test]
fn arrays_construct_push_and_index() {
    let mut vm = vm();
    eval(&mut vm, "(module-import (muscat array))");
    assert_eq!(eval(&mut vm, "(array-length (make-array 3))"), Value::Number(3.0));
    assert_eq!(eval(&mut vm, "(array? (make-array))"), Value::Bool(true));
    assert_eq!(eval(&mut vm, "(array? '(1 2))"), Value::Bool(false));

    let source = "\
        (define a (make-array 2))\
        (array-nth-set! a 0 41)\
        (array-push a 7)\
        (array-nth a 0)";
    assert_eq!(eval(&mut vm, source), Value::Number(41.0));

    // Fresh slots default to #f; pushes append after them.
    assert_eq!(eval(&mut vm, "(array-length a)"), Value::Number(3.0));
    assert_eq!(eval(&mut vm, "(array-nth a 1)"), Value::Bool(false));
    assert_eq!(eval(&mut vm, "(array-nth a 2)"), Value::Number(7.0));

    let value = eval(&mut vm, "a");
    assert_eq!(vm.format_value(value), "#(41 #f 7)");
}

#[test]
fn array_indexing_out_of_bounds_is_an_error() {
    let mut vm = vm();
    eval(&mut vm, "(module-import (muscat array)) (define a (make-array 1))");
    match vm.eval_string("(array-nth a 9)") {
        Err(InterpretError::Runtime(e)) => assert!(e.message.contains("out of bounds")),
        other => panic!("expected an out-of-bounds error, got {other:?}"),
    }
    match vm.eval_string("(array-nth-set! a 9 0)") {
        Err(InterpretError::Runtime(e)) => assert!(e.message.contains("out of bounds")),
        other => panic!("expected an out-of-bounds error, got {other:?}"),
    }
}

#[test]
fn call_closure_reenters_the_vm() {
    let mut vm = vm();
    let closure = eval(&mut vm, "(lambda (a b) (+ a b))");
    let result = vm
        .call_closure(closure, &[Value::Number(2.0), Value::Number(3.0)])
        .expect("call_closure failed");
    assert_eq!(result, Value::Number(5.0));
}

#[test]
fn disassembly_names_jump_targets() {
    let mut vm = vm();
    let listing = vm
        .disassemble_source("(if #t 1 2)", None)
        .expect("disassembly failed");
    assert!(listing.contains("JUMP_IF_FALSE"), "got:\n{listing}");
    assert!(listing.contains("->"), "got:\n{listing}");
}
