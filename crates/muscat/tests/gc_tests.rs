//! Collector behavior observed through the public surface: forced
//! collections must preserve everything reachable and reclaim what is
//! not.

use muscat::{Value, Vm};
use pretty_assertions::assert_eq;

fn vm() -> Vm {
    let mut vm = Vm::new(Vec::new());
    vm.register_core_modules().expect("core modules must register");
    vm
}

#[test]
fn collection_preserves_reachable_data() {
    let mut vm = vm();
    vm.eval_string("(define xs '(1 2 3))").expect("define failed");
    vm.collect_garbage();

    let value = vm.eval_string("(car xs)").expect("read after collect failed");
    assert_eq!(value, Value::Number(1.0));
    let value = vm.eval_string("xs").expect("read after collect failed");
    assert_eq!(vm.format_value(value), "(1 2 3)");
}

#[test]
fn collection_reclaims_unreachable_data() {
    let mut vm = vm();
    // Produce garbage whose result is discarded.
    for _ in 0..50 {
        vm.eval_string("(begin (list 1 2 3 4 5) 0)").expect("eval failed");
    }
    vm.collect_garbage();
    let after_first = vm.heap().live_objects();

    // A second collection with no new work frees nothing further:
    // everything left is reachable from the roots.
    vm.collect_garbage();
    assert_eq!(vm.heap().live_objects(), after_first);

    // New garbage comes and goes.
    for _ in 0..50 {
        vm.eval_string("(begin (list 1 2 3 4 5) 0)").expect("eval failed");
    }
    vm.collect_garbage();
    assert_eq!(vm.heap().live_objects(), after_first);
}

#[test]
fn collection_mid_loop_leaves_captured_state_intact() {
    let mut vm = vm();
    // Closures created in a loop keep their captured values across a
    // forced collection.
    vm.eval_string(
        "(define (make-keeper v) (lambda () v))\
         (define k1 (make-keeper '(10 20)))\
         (define k2 (make-keeper 30))",
    )
    .expect("setup failed");

    vm.collect_garbage();

    let value = vm.eval_string("(k1)").expect("closure call failed");
    assert_eq!(vm.format_value(value), "(10 20)");
    let value = vm.eval_string("(k2)").expect("closure call failed");
    assert_eq!(value, Value::Number(30.0));
}

#[test]
fn interned_strings_survive_while_referenced() {
    let mut vm = vm();
    vm.eval_string("(define s \"keep me\")").expect("define failed");
    vm.collect_garbage();
    vm.collect_garbage();
    let value = vm.eval_string("s").expect("read failed");
    assert_eq!(vm.format_value(value), "keep me");
}

#[test]
fn arrays_survive_collection() {
    let mut vm = vm();
    vm.eval_string(
        "(module-import (muscat array))\
         (define arr (make-array 1))\
         (array-nth-set! arr 0 '(1 2))",
    )
    .expect("setup failed");

    vm.collect_garbage();

    let value = vm.eval_string("(array-nth arr 0)").expect("read failed");
    assert_eq!(vm.format_value(value), "(1 2)");
}

#[test]
fn records_survive_collection() {
    let mut vm = vm();
    vm.eval_string(
        "(define-record-type p (fields x y))\
         (define inst (make-p :x 1 :y '(2 3)))",
    )
    .expect("setup failed");

    vm.collect_garbage();

    let value = vm.eval_string("(p-x inst)").expect("accessor failed");
    assert_eq!(value, Value::Number(1.0));
    let value = vm.eval_string("(p-y inst)").expect("accessor failed");
    assert_eq!(vm.format_value(value), "(2 3)");
    let value = vm.eval_string("(p? inst)").expect("predicate failed");
    assert_eq!(value, Value::Bool(true));
}
