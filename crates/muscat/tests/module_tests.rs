//! Module resolution, import/export, and load-file behavior against
//! real module files on disk.

use std::fs;

use muscat::{InterpretError, Value, Vm};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn vm_with_root(root: &TempDir) -> Vm {
    let mut vm = Vm::new(Vec::new());
    vm.add_load_path(root.path().to_path_buf());
    vm.register_core_modules().expect("core modules must register");
    vm
}

fn write_module(root: &TempDir, relative: &str, source: &str) {
    let path = root.path().join(relative);
    fs::create_dir_all(path.parent().expect("module path must have a parent"))
        .expect("create module directory");
    fs::write(path, source).expect("write module file");
}

#[test]
fn imports_exported_bindings_from_a_module_file() {
    let root = TempDir::new().expect("temp dir");
    write_module(
        &root,
        "mylib/util.msc",
        "(define-module (mylib util))\n\
         (define (hello) :export \"hello world\")\n\
         (define secret 41)\n",
    );

    let mut vm = vm_with_root(&root);
    let value = vm
        .eval_string("(module-import (mylib util)) (hello)")
        .expect("import and call failed");
    assert_eq!(vm.format_value(value), "hello world");

    // Unexported bindings stay private to the module.
    match vm.eval_string("secret") {
        Err(InterpretError::Runtime(e)) => assert!(e.message.contains("Undefined variable")),
        other => panic!("expected an undefined-variable error, got {other:?}"),
    }
}

#[test]
fn module_files_require_a_define_module_form() {
    let root = TempDir::new().expect("temp dir");
    write_module(&root, "bad/mod.msc", "(define x 1)\n");

    let mut vm = vm_with_root(&root);
    match vm.eval_string("(module-import (bad mod))") {
        Err(InterpretError::Runtime(e)) => {
            assert!(e.message.contains("module definition"), "got: {e}");
        }
        other => panic!("expected a module definition error, got {other:?}"),
    }
}

#[test]
fn define_module_without_a_file_creates_an_empty_module() {
    let root = TempDir::new().expect("temp dir");
    let mut vm = vm_with_root(&root);
    let value = vm
        .eval_string("(define-module (test call)) (define x 9) x")
        .expect("in-memory module failed");
    assert_eq!(value, Value::Number(9.0));
}

#[test]
fn import_inside_define_module_pulls_dependencies() {
    let root = TempDir::new().expect("temp dir");
    write_module(
        &root,
        "dep/base.msc",
        "(define-module (dep base))\n\
         (define base-value 17 :export)\n",
    );
    write_module(
        &root,
        "dep/user.msc",
        "(define-module (dep user)\n\
           (import (dep base)))\n\
         (define (get-it) :export base-value)\n",
    );

    let mut vm = vm_with_root(&root);
    let value = vm
        .eval_string("(module-import (dep user)) (get-it)")
        .expect("nested import failed");
    assert_eq!(value, Value::Number(17.0));
}

#[test]
fn mutual_imports_do_not_recurse_forever() {
    let root = TempDir::new().expect("temp dir");
    write_module(
        &root,
        "cyc/a.msc",
        "(define-module (cyc a)\n\
           (import (cyc b)))\n\
         (define (fa) :export 1)\n",
    );
    write_module(
        &root,
        "cyc/b.msc",
        "(define-module (cyc b)\n\
           (import (cyc a)))\n\
         (define (fb) :export 2)\n",
    );

    let mut vm = vm_with_root(&root);
    let value = vm
        .eval_string("(module-import (cyc a)) (fa)")
        .expect("cyclic import failed");
    assert_eq!(value, Value::Number(1.0));
}

#[test]
fn module_enter_switches_the_current_module() {
    let root = TempDir::new().expect("temp dir");
    let mut vm = vm_with_root(&root);
    vm.eval_string("(module-enter (scratch pad)) (define inside 5)")
        .expect("module-enter failed");

    // Still inside (scratch pad): the binding resolves.
    let value = vm.eval_string("inside").expect("binding should resolve");
    assert_eq!(value, Value::Number(5.0));
}

#[test]
fn load_file_runs_a_script_into_the_current_module() {
    let root = TempDir::new().expect("temp dir");
    write_module(&root, "script.msc", "(define loaded-value 99)\n");

    let mut vm = vm_with_root(&root);
    let script = root.path().join("script.msc");
    let source = format!("(load-file \"{}\") loaded-value", script.display());
    let value = vm.eval_string(&source).expect("load-file failed");
    assert_eq!(value, Value::Number(99.0));
}

#[test]
fn first_matching_load_path_root_wins() {
    let first = TempDir::new().expect("temp dir");
    let second = TempDir::new().expect("temp dir");
    write_module(
        &first,
        "pick/me.msc",
        "(define-module (pick me))\n(define which \"first\" :export)\n",
    );
    write_module(
        &second,
        "pick/me.msc",
        "(define-module (pick me))\n(define which \"second\" :export)\n",
    );

    let mut vm = Vm::new(Vec::new());
    vm.add_load_path(first.path().to_path_buf());
    vm.add_load_path(second.path().to_path_buf());
    vm.register_core_modules().expect("core modules must register");

    let value = vm
        .eval_string("(module-import (pick me)) which")
        .expect("import failed");
    assert_eq!(vm.format_value(value), "first");
}
