//! Rust types exposed to policies as classes, and the type-erased
//! instances that travel through the host.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use writ_core::filter::Filter;
use writ_core::kb::FieldType;
use writ_core::terms::Symbol;

use crate::errors::{InvalidCallError, TypeError, WritError};

use super::class_method::{
    AttributeGetter, BuildQuery, ClassMethod, CombineQuery, Constructor, ExecQuery,
    InstanceMethod, RegisterHook,
};
use super::from_writ::FromWritList;
use super::method::{Function, Method};
use super::to_writ::{ToWritResults, WritIter, WritResultIter};
use super::{Host, WritValue};

type EqualityCheck = Arc<dyn Fn(&Host, &Instance, &Instance) -> crate::Result<bool> + Send + Sync>;
type IntoIter = Arc<dyn Fn(&Host, &Instance) -> crate::Result<WritResultIter> + Send + Sync>;

/// `std::any::type_name` without the module path or generic arguments.
fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let path = full.split('<').next().unwrap_or(full);
    path.rsplit("::").next().unwrap_or(path)
}

/// A registered Rust type: how to construct it, which attributes and
/// methods policies may use, and how to filter collections of it.
#[derive(Clone)]
pub struct Class {
    pub name: String,
    pub type_id: TypeId,
    /// Declared field types, used by data filtering to resolve relations.
    pub fields: HashMap<Symbol, FieldType>,
    pub register_hooks: Vec<RegisterHook>,

    constructor: Option<Constructor>,
    attributes: HashMap<&'static str, AttributeGetter>,
    instance_methods: HashMap<&'static str, InstanceMethod>,
    class_methods: HashMap<&'static str, ClassMethod>,
    // Only consulted when both sides have this class.
    equality_check: Option<EqualityCheck>,
    into_iter: Option<IntoIter>,

    pub(crate) build_query: Option<BuildQuery>,
    pub(crate) combine_query: Option<CombineQuery>,
    pub(crate) exec_query: Option<ExecQuery>,
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Class<{}>", self.name)
    }
}

impl crate::WritClass for Class {}

impl Class {
    pub fn builder<T: 'static>() -> ClassBuilder<T> {
        ClassBuilder {
            class: Class {
                name: short_type_name::<T>().to_owned(),
                type_id: TypeId::of::<T>(),
                fields: HashMap::new(),
                register_hooks: vec![],
                constructor: None,
                attributes: HashMap::new(),
                instance_methods: HashMap::new(),
                class_methods: HashMap::new(),
                equality_check: None,
                into_iter: None,
                build_query: None,
                combine_query: None,
                exec_query: None,
            },
            ty: PhantomData,
        }
    }

    fn unsupported(&self, operation: &str) -> WritError {
        WritError::UnsupportedOperation {
            operation: operation.to_owned(),
            type_name: self.name.clone(),
        }
    }

    /// Construct an instance for `new Name(...)`.
    pub fn init(&self, args: Vec<WritValue>) -> crate::Result<Instance> {
        match &self.constructor {
            Some(constructor) => constructor.invoke(args),
            None => Err(WritError::MissingConstructorError {
                type_name: self.name.clone(),
            }),
        }
    }

    /// Call the class method `name`, as in `Name.method(...)`.
    pub fn call(&self, name: &str, args: Vec<WritValue>) -> crate::Result<WritValue> {
        match self.class_methods.get(name) {
            Some(method) => method.invoke(args),
            None => Err(InvalidCallError::ClassMethodNotFound {
                method_name: name.to_owned(),
                type_name: self.name.clone(),
            }
            .into()),
        }
    }

    fn instance_method(&self, name: &str) -> Option<InstanceMethod> {
        if self.type_id == TypeId::of::<Class>() {
            // A class constant answers method calls with its class methods.
            return Some(InstanceMethod::from_class_method(name.to_owned()));
        }
        self.instance_methods.get(name).cloned()
    }
}

/// Builds a [`Class`] for `T`.
///
/// ```ignore
/// let class = Class::builder::<User>()
///     .add_attribute_getter("name", |u: &User| u.name.clone())
///     .add_method("is_admin_of", |u: &User, org: String| u.admin_of.contains(&org))
///     .with_equality_check()
///     .build();
/// ```
#[derive(Clone)]
pub struct ClassBuilder<T> {
    class: Class,
    ty: PhantomData<T>,
}

impl<T: 'static> ClassBuilder<T> {
    /// A builder whose constructor is `T::default`.
    pub fn with_default() -> Self
    where
        T: Default + Send + Sync,
    {
        Class::builder::<T>().set_constructor(T::default)
    }

    /// Register under `name` instead of the type's short name.
    pub fn name(mut self, name: &str) -> Self {
        self.class.name = name.to_owned();
        self
    }

    pub fn set_constructor<F, Args>(mut self, f: F) -> Self
    where
        F: Function<Args, Result = T>,
        T: Send + Sync,
        Args: FromWritList,
    {
        self.class.constructor = Some(Constructor::new(f));
        self
    }

    /// Compare instances with `f` for `==` and unification.
    pub fn set_equality_check<F>(mut self, f: F) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        self.class.equality_check = Some(Arc::new(move |host: &Host, left: &Instance, right: &Instance| {
            let left = left.downcast::<T>(Some(host)).map_err(|e| e.user())?;
            let right = right.downcast::<T>(Some(host)).map_err(|e| e.user())?;
            Ok(f(left, right))
        }));
        self
    }

    pub fn with_equality_check(self) -> Self
    where
        T: PartialEq,
    {
        self.set_equality_check(|a: &T, b: &T| a == b)
    }

    /// Make instances iterable with `x in instance`.
    pub fn set_into_iter<F, I, V>(mut self, f: F) -> Self
    where
        F: Fn(&T) -> I + Send + Sync + 'static,
        I: Iterator<Item = V> + 'static,
        V: ToWritResults + 'static,
    {
        self.class.into_iter = Some(Arc::new(move |host: &Host, instance: &Instance| {
            let instance = instance.downcast::<T>(Some(host)).map_err(|e| e.user())?;
            Ok(WritIter { iter: f(instance) }.to_writ_results())
        }));
        self
    }

    /// Iterate a clone of the instance through its `IntoIterator` impl.
    pub fn with_iter<V>(self) -> Self
    where
        T: IntoIterator<Item = V> + Clone,
        T::IntoIter: 'static,
        V: ToWritResults + 'static,
    {
        self.set_into_iter(|t: &T| t.clone().into_iter())
    }

    /// Expose `instance.name` to policies.
    pub fn add_attribute_getter<F, R>(mut self, name: &'static str, f: F) -> Self
    where
        F: Fn(&T) -> R + Send + Sync + 'static,
        R: crate::ToWrit,
    {
        self.class.attributes.insert(name, AttributeGetter::new(f));
        self
    }

    /// Expose `instance.name(args...)` to policies.
    pub fn add_method<F, Args, R>(mut self, name: &'static str, f: F) -> Self
    where
        Args: FromWritList,
        F: Method<T, Args, Result = R>,
        R: ToWritResults + 'static,
    {
        self.class.instance_methods.insert(name, InstanceMethod::new(f));
        self
    }

    /// A method yielding many values. Policies see one list of all of them.
    pub fn add_iterator_method<F, Args, I>(mut self, name: &'static str, f: F) -> Self
    where
        Args: FromWritList,
        F: Method<T, Args>,
        F::Result: IntoIterator<Item = I>,
        <F::Result as IntoIterator>::IntoIter: Sized + 'static,
        I: ToWritResults + 'static,
    {
        self.class
            .instance_methods
            .insert(name, InstanceMethod::new_iterator(f));
        self
    }

    /// Expose `Name.name(args...)` to policies.
    pub fn add_class_method<F, Args, R>(mut self, name: &'static str, f: F) -> Self
    where
        F: Function<Args, Result = R>,
        Args: FromWritList,
        R: ToWritResults + 'static,
    {
        self.class.class_methods.insert(name, ClassMethod::new(f));
        self
    }

    /// Register `value` as the constant `name` alongside the class.
    pub fn add_constant<V>(mut self, value: V, name: &'static str) -> Self
    where
        V: crate::ToWrit + Clone + Send + Sync + 'static,
    {
        self.class.register_hooks.push(RegisterHook::new(move |writ: &mut crate::Writ| {
            writ.register_constant(value.clone(), name)
        }));
        self
    }

    /// Declare the type of a field, for data filtering.
    ///
    /// ```ignore
    /// Class::builder::<Repo>()
    ///     .add_field("name", FieldType::Base { class_tag: "String".into() })
    ///     .add_field("org", FieldType::Relation {
    ///         kind: RelationKind::One,
    ///         other_class_tag: "Org".into(),
    ///         my_field: "org_id".into(),
    ///         other_field: "id".into(),
    ///     })
    /// ```
    pub fn add_field(mut self, name: &str, field: FieldType) -> Self {
        self.class.fields.insert(Symbol::new(name), field);
        self
    }

    /// Turn a data filter into a query object `Q`.
    pub fn set_build_query<F, Q>(mut self, f: F) -> Self
    where
        F: Fn(&Filter) -> crate::Result<Q> + Send + Sync + 'static,
        Q: Send + Sync + 'static,
    {
        self.class.build_query = Some(Arc::new(move |filter: &Filter| f(filter).map(Instance::new)));
        self
    }

    /// Union two query objects.
    pub fn set_combine_query<F, Q>(mut self, f: F) -> Self
    where
        F: Fn(&Q, &Q) -> Q + Send + Sync + 'static,
        Q: Send + Sync + 'static,
    {
        self.class.combine_query = Some(Arc::new(move |left: &Instance, right: &Instance| {
            let left = left.downcast::<Q>(None).map_err(|e| e.invariant())?;
            let right = right.downcast::<Q>(None).map_err(|e| e.invariant())?;
            Ok(Instance::new(f(left, right)))
        }));
        self
    }

    /// Run a query object, loading the matching objects.
    pub fn set_exec_query<F, Q>(mut self, f: F) -> Self
    where
        F: Fn(&Q) -> crate::Result<Vec<T>> + Send + Sync + 'static,
        Q: Send + Sync + 'static,
        T: Send + Sync,
    {
        self.class.exec_query = Some(Arc::new(move |query: &Instance| {
            let query = query.downcast::<Q>(None).map_err(|e| e.invariant())?;
            Ok(f(query)?.into_iter().map(Instance::new).collect())
        }));
        self
    }

    pub fn build(self) -> Class {
        self.class
    }
}

/// A host value of any type. Its class is whichever registered class has
/// the same `TypeId`, if any.
#[derive(Clone)]
pub struct Instance {
    inner: Arc<dyn Any + Send + Sync>,
    /// Full Rust type name, for messages about unregistered types.
    type_name: &'static str,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Instance<{}>", self.type_name)
    }
}

impl Instance {
    pub fn new<T: Send + Sync + 'static>(instance: T) -> Self {
        Self {
            inner: Arc::new(instance),
            type_name: std::any::type_name::<T>(),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.inner.as_ref().type_id()
    }

    pub fn instance_of(&self, class: &Class) -> bool {
        self.type_id() == class.type_id
    }

    pub fn class<'a>(&self, host: &'a Host) -> crate::Result<&'a Class> {
        host.get_class_by_type_id(self.type_id())
            .map_err(|_| WritError::MissingClassError {
                name: self.type_name.to_owned(),
            })
    }

    /// The registered class name, or the Rust type name when unregistered.
    pub fn name<'a>(&self, host: &'a Host) -> &'a str {
        match self.class(host) {
            Ok(class) => &class.name,
            Err(_) => self.type_name,
        }
    }

    pub fn debug_name(&self) -> &'static str {
        self.type_name
    }

    pub fn get_attr(&self, name: &str, host: &mut Host) -> crate::Result<WritValue> {
        tracing::trace!(attribute = name, instance = self.type_name, "get_attr");
        let class = self.class(host)?;
        let getter = class.attributes.get(name).cloned().ok_or_else(|| {
            InvalidCallError::AttributeNotFound {
                attribute_name: name.to_owned(),
                type_name: class.name.clone(),
            }
        })?;
        getter.invoke(self, host)
    }

    pub fn call(&self, name: &str, args: Vec<WritValue>, host: &mut Host) -> crate::Result<WritValue> {
        tracing::trace!(method = name, ?args, instance = self.type_name, "call");
        let class = self.class(host)?;
        let method = class.instance_method(name).ok_or_else(|| {
            InvalidCallError::MethodNotFound {
                method_name: name.to_owned(),
                type_name: class.name.clone(),
            }
        })?;
        method.invoke(self, args, host)
    }

    pub fn as_iter(&self, host: &Host) -> crate::Result<WritResultIter> {
        let class = self.class(host)?;
        match &class.into_iter {
            Some(into_iter) => into_iter(host, self),
            None => Err(class.unsupported("in")),
        }
    }

    /// Instances of different types are never equal.
    pub fn equals(&self, other: &Self, host: &Host) -> crate::Result<bool> {
        let class = self.class(host)?;
        if self.type_id() != other.type_id() {
            return Ok(false);
        }
        match &class.equality_check {
            Some(eq) => eq(host, self, other),
            None => Err(class.unsupported("equals")),
        }
    }

    /// Borrow the wrapped value as a `T`. Passing the host gives the error
    /// registered class names instead of Rust type names.
    pub fn downcast<T: 'static>(&self, host: Option<&Host>) -> Result<&T, TypeError> {
        self.inner.downcast_ref::<T>().ok_or_else(|| {
            let registered = |id: TypeId| host.and_then(|h| h.get_class_by_type_id(id).ok());
            let expected = registered(TypeId::of::<T>())
                .map_or_else(|| std::any::type_name::<T>().to_owned(), |c| c.name.clone());
            let got = registered(self.type_id())
                .map_or_else(|| self.type_name.to_owned(), |c| c.name.clone());
            TypeError::expected(expected).got(got)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn instances_belong_to_the_class_of_their_type() {
        struct Foo;
        struct Bar;

        let foo = Instance::new(Foo);
        assert!(foo.instance_of(&Class::builder::<Foo>().build()));
        assert!(!foo.instance_of(&Class::builder::<Bar>().build()));
        assert!(foo.downcast::<Bar>(None).is_err());
    }

    #[test]
    fn class_names_drop_paths_and_generics() {
        struct Repo;
        assert_eq!(Class::builder::<Repo>().build().name, "Repo");
        assert_eq!(Class::builder::<Vec<Repo>>().build().name, "Vec");
        assert_eq!(Class::builder::<Repo>().name("Repository").build().name, "Repository");
    }

    #[test]
    fn classes_without_a_constructor_cannot_be_created() {
        struct Repo;
        let class = Class::builder::<Repo>().build();
        assert_eq!(
            class.init(vec![]).unwrap_err().to_string(),
            "Repo has no constructor"
        );
    }

    #[test]
    fn class_methods_are_called_by_name() {
        #[derive(Default)]
        struct Counter;
        let class = ClassBuilder::<Counter>::with_default()
            .add_class_method("answer", || 42)
            .build();
        assert_eq!(class.call("answer", vec![]).unwrap(), WritValue::Integer(42));
        assert!(matches!(
            class.call("question", vec![]),
            Err(WritError::InvalidCall(InvalidCallError::ClassMethodNotFound { .. }))
        ));
        assert!(class.init(vec![]).unwrap().downcast::<Counter>(None).is_ok());
    }

    #[test]
    fn policies_call_class_methods_on_registered_classes() -> crate::Result<()> {
        #[derive(Default)]
        struct Counter;
        let mut writ = crate::Writ::new();
        writ.register_class(
            ClassBuilder::<Counter>::with_default()
                .add_class_method("double", |n: i64| n * 2)
                .build(),
        )?;
        let mut query = writ.query("x = Counter.double(3)")?;
        let answer = query.next().transpose()?.expect("one answer");
        assert_eq!(answer.get_typed::<i64>("x")?, 6);
        Ok(())
    }

    #[test]
    fn constants_are_registered_with_their_class() -> crate::Result<()> {
        #[derive(Clone)]
        struct Limits;
        let mut writ = crate::Writ::new();
        writ.register_class(
            Class::builder::<Limits>()
                .add_constant(100i64, "MAX_SEATS")
                .build(),
        )?;
        writ.load_str("over_limit(n) if n > MAX_SEATS;")?;
        let mut query = writ.query_rule("over_limit", (101i64,))?;
        assert!(query.next().transpose()?.is_some());
        Ok(())
    }
}
