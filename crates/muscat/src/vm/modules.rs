//! The module system: named scopes with explicit imports and exports.
//!
//! A module name `(a b c)` is compiled into the string `"a b c"`; the
//! loader maps it to `<root>/a/b/c.msc` across the configured load-path
//! roots, first match wins. Initialization clears `needs_init` *before*
//! running the module body so mutual imports do not recurse.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;

use crate::{
    compiler::compile_module,
    error::RuntimeError,
    function::Closure,
    heap::{HeapData, HeapId},
    value::Value,
};

use super::Vm;

/// A named scope: its own binding table, import and export lists, and
/// the compiled top-level body of its source file.
pub struct Module {
    pub name: HeapId,
    /// Bindings, keyed by interned name string. Insertion order is kept
    /// so export iteration and diagnostics are deterministic.
    pub locals: IndexMap<HeapId, Value>,
    pub imports: Vec<HeapId>,
    pub exports: Vec<HeapId>,
    pub init_function: Option<HeapId>,
    pub needs_init: bool,
}

impl Module {
    #[must_use]
    pub fn new(name: HeapId) -> Self {
        Self {
            name,
            locals: IndexMap::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            init_function: None,
            needs_init: false,
        }
    }
}

impl Vm {
    /// Looks up (or creates) the module registered under `name`,
    /// loading and running its file from the load path when `run_init`
    /// is set and the module has not been initialized yet.
    pub fn resolve_module(&mut self, name: &str, run_init: bool) -> Result<HeapId, RuntimeError> {
        let module = match self.module_registry().get(name) {
            Some(&module) => module,
            None => {
                let name_id = self.intern_string(name);
                self.push(Value::Object(name_id));
                let module = self.alloc(HeapData::Module(Module::new(name_id)));
                self.pop();
                self.heap_mut().module_mut(module).needs_init = true;
                self.module_registry().insert(name.into(), module);
                module
            }
        };

        if run_init && self.heap().module(module).needs_init {
            // Clearing the flag before running the body is what breaks
            // import cycles.
            self.heap_mut().module_mut(module).needs_init = false;
            if let Some(path) = self.find_module_path(name) {
                self.load_module(module, &path)?;
            }
        }
        Ok(module)
    }

    /// Probes each load-path root for `<root>/a/b/c.msc`.
    fn find_module_path(&self, name: &str) -> Option<PathBuf> {
        let relative = format!("{}.msc", name.replace(' ', "/"));
        self.load_path_roots()
            .iter()
            .map(|root| root.join(&relative))
            .find(|candidate| candidate.is_file())
    }

    /// Compiles and runs a module's source file, leaving its bindings in
    /// the module's table.
    fn load_module(&mut self, module: HeapId, path: &Path) -> Result<(), RuntimeError> {
        let display_path = path.display().to_string();
        let source = match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(e) => {
                return Err(self.runtime_error(format!("Could not load module file {display_path}: {e}")))
            }
        };

        let file_id = self.intern_string(&display_path);
        self.push(Value::Object(file_id));
        let compiled = compile_module(self, &source, Some(file_id), module);
        self.pop();
        let function = match compiled {
            Ok(function) => function,
            Err(e) => {
                return Err(self.runtime_error(format!(
                    "Error while loading module {display_path}: {e}"
                )))
            }
        };
        self.heap_mut().module_mut(module).init_function = Some(function);

        self.push(Value::Object(function));
        let closure = self.alloc(HeapData::Closure(Closure {
            function,
            module: Some(module),
            upvalues: Vec::new(),
        }));
        self.pop();

        self.push(Value::Object(closure));
        self.call_value(Value::Object(closure), 0, 0, false)?;
        self.run()?;
        self.pop();
        Ok(())
    }

    /// Copies each exported binding of `from` into `to`'s locals.
    pub(crate) fn import_module(&mut self, from: HeapId, to: HeapId) {
        let exports = self.heap().module(from).exports.clone();
        for name in exports {
            let value = self
                .heap()
                .module(from)
                .locals
                .get(&name)
                .copied()
                .unwrap_or(Value::FALSE);
            self.heap_mut().module_mut(to).locals.insert(name, value);
        }
        self.heap_mut().module_mut(to).imports.push(from);
    }

    pub(crate) fn create_module_binding(
        &mut self,
        module: HeapId,
        name: HeapId,
        value: Value,
        exported: bool,
    ) {
        let data = self.heap_mut().module_mut(module);
        data.locals.insert(name, value);
        if exported {
            data.exports.push(name);
        }
    }

    /// Registers native functions into a module, creating it on demand.
    pub fn define_native_funcs(
        &mut self,
        module_name: &str,
        entries: &[crate::native::NativeFuncEntry],
    ) -> Result<(), RuntimeError> {
        let module = self.resolve_module(module_name, false)?;
        for &(name, function, exported) in entries {
            self.define_native(module, name, function, exported);
        }
        Ok(())
    }

    /// Registers one native function binding in a module.
    pub fn define_native(
        &mut self,
        module: HeapId,
        name: &str,
        function: crate::native::NativeFn,
        exported: bool,
    ) {
        let name_id = self.intern_string(name);
        self.push(Value::Object(name_id));
        let native = self.alloc(HeapData::NativeFunction(function));
        self.pop();
        self.create_module_binding(module, name_id, Value::Object(native), exported);
    }

    /// `DEFINE_MODULE`: resolve the named module and make it the current
    /// closure's module, so subsequent global defines land in it.
    pub(crate) fn op_define_module(&mut self) -> Result<(), RuntimeError> {
        let name = self.module_name_argument()?;
        let module = self.resolve_module(&name, true)?;
        let closure = self.current_closure();
        self.heap_mut().closure_mut(closure).module = Some(module);
        self.pop();
        self.push(Value::Object(module));
        Ok(())
    }

    /// `IMPORT_MODULE`: resolve (loading if needed), then copy the
    /// module's exports into the current module.
    pub(crate) fn op_import_module(&mut self) -> Result<(), RuntimeError> {
        let name = self.module_name_argument()?;
        let resolved = self.resolve_module(&name, true)?;
        self.pop();
        let target = self.frame_module();
        self.import_module(resolved, target);
        self.push(Value::Object(resolved));
        Ok(())
    }

    /// `ENTER_MODULE`: switch the VM's current module.
    pub(crate) fn op_enter_module(&mut self) -> Result<(), RuntimeError> {
        let name = self.module_name_argument()?;
        let module = self.resolve_module(&name, true)?;
        self.pop();
        let closure = self.current_closure();
        self.heap_mut().closure_mut(closure).module = Some(module);
        self.set_current_module(module);
        self.push(Value::Object(module));
        Ok(())
    }

    fn module_name_argument(&mut self) -> Result<String, RuntimeError> {
        match self.heap().as_string_id(self.peek(0)) {
            Some(id) => Ok(self.heap().string(id).to_string()),
            None => Err(self.runtime_error("Expected a module name string.")),
        }
    }
}
