//! Record types: user-defined nominal product types with generated
//! constructors, predicates, accessors, and setters.
//!
//! `DEFINE_RECORD n` consumes the type-name symbol and `n` (name,
//! default) pairs from the stack, creates the type, and binds
//! `make-<name>`, `<name>?`, `<name>-<field>`, and
//! `<name>-<field>-set!` in the current module, all exported.

use crate::{
    error::RuntimeError,
    heap::{HeapData, HeapId},
    value::Value,
};

use super::Vm;

/// A record type: its name and ordered field list.
pub struct Record {
    pub name: HeapId,
    pub fields: Vec<HeapId>,
}

/// One declared field: its name string and the default used when the
/// constructor call omits it.
#[derive(Debug, Clone, Copy)]
pub struct RecordField {
    pub name: HeapId,
    pub default_value: Value,
}

#[derive(Debug, Clone, Copy)]
pub struct RecordAccessor {
    pub record_type: HeapId,
    pub field_index: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RecordSetter {
    pub record_type: HeapId,
    pub field_index: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RecordPredicate {
    pub record_type: HeapId,
}

/// An instance stores its field values positionally, in the type's
/// declaration order.
pub struct RecordInstance {
    pub record_type: HeapId,
    pub field_values: Vec<Value>,
}

impl Vm {
    /// `DEFINE_RECORD`: stack holds `[name-symbol, (field-symbol,
    /// default)*]`. Leaves the record type as the result.
    pub(crate) fn op_define_record(&mut self, field_count: usize) -> Result<(), RuntimeError> {
        let name_value = self.peek(field_count * 2);
        let Some(name_symbol) = self.heap.as_symbol_id(name_value) else {
            return Err(self.runtime_error("define-record-type: expected a type name symbol."));
        };
        let type_name = self.heap.symbol(name_symbol).name;
        let base = self.stack.len() - (field_count * 2 + 1);

        let record = self.alloc(HeapData::Record(Record {
            name: type_name,
            fields: Vec::with_capacity(field_count),
        }));
        self.push(Value::Object(record));

        let module = self.frame_module();

        // Constructor and predicate bindings. Every freshly interned
        // name is rooted before the next allocation can collect.
        let maker_name = format!("make-{}", self.heap.string(type_name));
        let maker_id = self.intern_string(&maker_name);
        self.push(Value::Object(maker_id));
        let predicate_name = format!("{}?", self.heap.string(type_name));
        let predicate_id = self.intern_string(&predicate_name);
        self.push(Value::Object(predicate_id));
        let predicate = self.alloc(HeapData::RecordPredicate(RecordPredicate {
            record_type: record,
        }));
        self.push(Value::Object(predicate));

        self.create_module_binding(module, maker_id, Value::Object(record), true);
        self.create_module_binding(module, predicate_id, Value::Object(predicate), true);
        self.pop(); // predicate
        self.pop(); // predicate name
        self.pop(); // maker name

        for index in 0..field_count {
            let field_value = self.stack[base + 1 + index * 2];
            let default_value = self.stack[base + 2 + index * 2];
            let Some(field_symbol) = self.heap.as_symbol_id(field_value) else {
                return Err(self.runtime_error("define-record-type: expected a field name symbol."));
            };
            let field_name = self.heap.symbol(field_symbol).name;

            let field = self.alloc(HeapData::RecordField(RecordField {
                name: field_name,
                default_value,
            }));
            self.push(Value::Object(field));
            self.heap.record_mut(record).fields.push(field);
            self.pop();

            // `<type>-<field>` accessor.
            let accessor_name = format!(
                "{}-{}",
                self.heap.string(type_name),
                self.heap.string(field_name)
            );
            let accessor_id = self.intern_string(&accessor_name);
            self.push(Value::Object(accessor_id));
            let accessor = self.alloc(HeapData::RecordAccessor(RecordAccessor {
                record_type: record,
                field_index: index,
            }));
            self.push(Value::Object(accessor));
            self.create_module_binding(module, accessor_id, Value::Object(accessor), true);

            // `<type>-<field>-set!` setter.
            let setter_name = format!("{accessor_name}-set!");
            let setter_id = self.intern_string(&setter_name);
            self.push(Value::Object(setter_id));
            let setter = self.alloc(HeapData::RecordSetter(RecordSetter {
                record_type: record,
                field_index: index,
            }));
            self.push(Value::Object(setter));
            self.create_module_binding(module, setter_id, Value::Object(setter), true);

            self.pop(); // setter
            self.pop(); // setter name
            self.pop(); // accessor
            self.pop(); // accessor name
        }

        // Drop the root, the arguments, and leave the type as result.
        self.pop();
        self.stack.truncate(base);
        self.push(Value::Object(record));
        Ok(())
    }

    /// Calling a record type constructs an instance. Arguments are
    /// keyword/value pairs matching field names; omitted fields take
    /// their declared default.
    pub(crate) fn construct_record(
        &mut self,
        record_id: HeapId,
        arg_count: usize,
        keyword_count: usize,
    ) -> Result<(), RuntimeError> {
        let total = arg_count + keyword_count * 2;
        if total % 2 != 0 {
            return Err(self.runtime_error("Record constructors take keyword arguments only."));
        }
        let base = self.stack.len() - total;
        let fields = self.heap.record(record_id).fields.clone();

        let instance = self.alloc(HeapData::RecordInstance(RecordInstance {
            record_type: record_id,
            field_values: Vec::with_capacity(fields.len()),
        }));
        self.push(Value::Object(instance));

        for &field_id in &fields {
            let field = *self.heap.record_field(field_id);
            let mut value = field.default_value;
            for pair in 0..total / 2 {
                let Some(keyword) = self.heap.as_keyword_id(self.stack[base + pair * 2]) else {
                    return Err(
                        self.runtime_error("Record constructors take keyword arguments only.")
                    );
                };
                if self.heap.keyword_text(keyword) == self.heap.string(field.name) {
                    value = self.stack[base + pair * 2 + 1];
                    break;
                }
            }
            // Field filling allocates nothing, so the loop cannot lose
            // the instance mid-construction.
            self.heap.record_instance_mut(instance).field_values.push(value);
        }

        self.pop();
        self.stack.truncate(base - 1);
        self.push(Value::Object(instance));
        Ok(())
    }

    pub(crate) fn call_record_accessor(
        &mut self,
        accessor_id: HeapId,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        let accessor = match self.heap.get(accessor_id) {
            HeapData::RecordAccessor(a) => *a,
            _ => unreachable!("dispatched on accessor kind"),
        };
        if arg_count != 1 {
            let name = self.record_type_name(accessor.record_type);
            return Err(self.runtime_error(format!(
                "Record field accessor for type '{name}' requires a single record instance argument."
            )));
        }

        let instance_id = self.check_instance_of(self.peek(0), accessor.record_type)?;
        let value = self.heap.record_instance(instance_id).field_values[accessor.field_index];
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    pub(crate) fn call_record_setter(
        &mut self,
        setter_id: HeapId,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        let setter = match self.heap.get(setter_id) {
            HeapData::RecordSetter(s) => *s,
            _ => unreachable!("dispatched on setter kind"),
        };
        if arg_count != 2 {
            let name = self.record_type_name(setter.record_type);
            return Err(self.runtime_error(format!(
                "Record field setter for type '{name}' requires a record instance and a value."
            )));
        }

        let instance_id = self.check_instance_of(self.peek(1), setter.record_type)?;
        let value = self.pop();
        self.pop();
        self.pop();
        self.heap.record_instance_mut(instance_id).field_values[setter.field_index] = value;
        self.push(value);
        Ok(())
    }

    pub(crate) fn call_record_predicate(
        &mut self,
        predicate_id: HeapId,
        arg_count: usize,
    ) -> Result<(), RuntimeError> {
        let predicate = match self.heap.get(predicate_id) {
            HeapData::RecordPredicate(p) => *p,
            _ => unreachable!("dispatched on predicate kind"),
        };
        if arg_count != 1 {
            let name = self.record_type_name(predicate.record_type);
            return Err(self.runtime_error(format!(
                "Record type predicate '{name}?' requires a single argument."
            )));
        }

        let value = self.pop();
        self.pop();
        let is_instance = matches!(
            value,
            Value::Object(id) if matches!(
                self.heap.get(id),
                HeapData::RecordInstance(instance) if instance.record_type == predicate.record_type
            )
        );
        self.push(Value::truth(is_instance));
        Ok(())
    }

    fn check_instance_of(&mut self, value: Value, record_type: HeapId) -> Result<HeapId, RuntimeError> {
        let expected = self.record_type_name(record_type);
        let Some(id) = value.as_object() else {
            return Err(self.runtime_error(format!(
                "Expected an instance of record type {expected} but received a {}.",
                value.kind_name()
            )));
        };
        let HeapData::RecordInstance(instance) = self.heap.get(id) else {
            let kind = self.heap.kind_name(id);
            return Err(self.runtime_error(format!(
                "Expected an instance of record type {expected} but received a {kind}."
            )));
        };
        if instance.record_type != record_type {
            let actual = self.record_type_name(instance.record_type);
            return Err(self.runtime_error(format!(
                "Passed a record of type {actual} where {expected} was expected."
            )));
        }
        Ok(id)
    }

    fn record_type_name(&self, record_type: HeapId) -> String {
        self.heap.string(self.heap.record(record_type).name).to_string()
    }
}
