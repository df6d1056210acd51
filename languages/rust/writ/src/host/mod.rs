//! Translate between the policy VM and Rust: the class registry and
//! the table of live host instances.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use writ_core::terms::{Operator, Term, Value};
use writ_core::Engine;

use crate::errors::WritError;

mod class;
mod class_method;
mod from_writ;
mod method;
mod to_writ;
mod value;

pub use class::{Class, ClassBuilder, Instance};
pub use from_writ::{FromWrit, FromWritList};
pub use to_writ::{ToWrit, ToWritList, ToWritResults, WritResultIter};
pub use value::{WritValue, WritValueType};

/// Maintain mappings and caches for Rust classes & instances
///
/// Every query works on its own clone: classes are shared, instances
/// created while the query runs stay with that query.
#[derive(Clone)]
pub struct Host {
    /// Reference to the core engine, used to allocate instance ids
    engine: Arc<Engine>,

    /// Map from names to `Class`s
    classes: Arc<HashMap<String, Class>>,

    /// Map from type IDs, to class names
    /// This helps us go from a generic type `T` to the
    /// class name it is registered as
    class_names: Arc<HashMap<TypeId, String>>,

    /// Map of cached instances
    instances: HashMap<u64, Instance>,
}

impl Host {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            classes: Default::default(),
            class_names: Default::default(),
            instances: HashMap::new(),
        }
    }

    pub fn get_class(&self, name: &str) -> crate::Result<&Class> {
        self.classes
            .get(name)
            .ok_or_else(|| WritError::MissingClassError {
                name: name.to_owned(),
            })
    }

    pub fn get_class_by_type_id(&self, id: TypeId) -> crate::Result<&Class> {
        self.class_names
            .get(&id)
            .ok_or_else(|| WritError::MissingClassError {
                name: format!("TypeId: {:?}", id),
            })
            .and_then(|name| self.get_class(name))
    }

    /// Add the class to the host classes
    ///
    /// Returns the name the class is registered under.
    pub fn cache_class(&mut self, class: Class) -> crate::Result<String> {
        let name = class.name.clone();
        if self.classes.contains_key(&name) {
            return Err(WritError::DuplicateClassError { name });
        }

        Arc::make_mut(&mut self.class_names).insert(class.type_id, name.clone());
        Arc::make_mut(&mut self.classes).insert(name.clone(), class);
        Ok(name)
    }

    pub fn classes(&self) -> impl Iterator<Item = &Class> {
        self.classes.values()
    }

    pub fn get_instance(&self, id: u64) -> crate::Result<&Instance> {
        self.instances
            .get(&id)
            .ok_or(WritError::MissingInstanceError { id })
    }

    pub fn cache_instance(&mut self, instance: Instance, id: Option<u64>) -> u64 {
        let id = id.unwrap_or_else(|| self.engine.get_external_id());
        self.instances.insert(id, instance);
        id
    }

    pub fn make_instance(&mut self, name: &str, fields: Vec<WritValue>, id: u64) -> crate::Result<()> {
        let class = self.get_class(name)?.clone();
        debug_assert!(!self.instances.contains_key(&id));
        let instance = class.init(fields)?;
        self.cache_instance(instance, Some(id));
        Ok(())
    }

    /// Rust types have no inheritance, so a value is an instance of
    /// exactly the class its type is registered as.
    pub fn isa(&self, value: WritValue, class_tag: &str) -> crate::Result<bool> {
        let res = match value {
            WritValue::Instance(instance) => {
                let class = self.get_class(class_tag)?;
                instance.instance_of(class)
            }
            WritValue::Boolean(_) => class_tag == "Boolean",
            WritValue::Map(_) => class_tag == "Dictionary",
            WritValue::List(_) => class_tag == "List",
            WritValue::Integer(_) => class_tag == "Integer" || class_tag == "Number",
            WritValue::Float(_) => class_tag == "Float" || class_tag == "Number",
            WritValue::String(_) => class_tag == "String",
            WritValue::Variable(_) => false,
        };
        Ok(res)
    }

    pub fn is_subclass(&self, left_tag: &str, right_tag: &str) -> bool {
        left_tag == right_tag
    }

    /// Follow `path` through declared field types starting at `base_tag`.
    pub fn isa_with_path(&self, base_tag: &str, path: &[Term], class_tag: &str) -> crate::Result<bool> {
        let mut tag = base_tag.to_owned();
        for field in path {
            let field = match field.value() {
                Value::String(field) => field,
                _ => return lazy_error!("path elements must be field names, got {}", field),
            };
            let class = self.get_class(&tag)?;
            match class.fields.get(&writ_core::terms::Symbol::new(field)) {
                Some(field_type) => tag = field_type.class_tag().to_owned(),
                None => return Ok(false),
            }
        }
        Ok(self.is_subclass(&tag, class_tag))
    }

    pub fn operator(&self, op: Operator, args: [Instance; 2]) -> crate::Result<bool> {
        let [left, right] = args;
        match op {
            Operator::Eq | Operator::Unify => left.equals(&right, self),
            Operator::Neq => left.equals(&right, self).map(|eq| !eq),
            _ => Err(WritError::UnsupportedOperation {
                operation: format!("{:?}", op),
                type_name: left.name(self).to_owned(),
            }),
        }
    }
}
