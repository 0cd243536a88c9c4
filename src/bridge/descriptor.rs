use std::any::{type_name, Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;

use super::error::{BridgeError, Operation};
use super::value::{coerce, FunctionArgs, ValueCell};

/// Type-erased exposed instance.
pub type Instance = dyn Any + Send + Sync;

type Getter = Arc<dyn Fn(&Instance) -> Result<JsonValue, BridgeError> + Send + Sync>;
type Setter = Arc<dyn Fn(&Instance, &JsonValue) -> Result<(), BridgeError> + Send + Sync>;
type Invoker = Arc<dyn Fn(&Instance, &[JsonValue]) -> Result<JsonValue, BridgeError> + Send + Sync>;
type ChildAccessor = Arc<dyn Fn(&Instance) -> Option<ObjectRef> + Send + Sync>;

/// A host type that can be exposed to scripts.
///
/// `describe` is the declaration table for the type: it lists the properties,
/// functions and nested objects scripts may reach. It runs once per
/// registration and must not have side effects.
///
/// ```ignore
/// struct Bell { count: ValueCell<i32> }
///
/// impl ExposedObject for Bell {
///     fn describe(desc: &mut DescriptorBuilder<Self>) {
///         desc.value("count", |bell| &bell.count)
///             .function("ringBell", |bell, (): ()| {
///                 bell.count.update(|c| *c += 1);
///                 Ok(())
///             });
///     }
/// }
/// ```
pub trait ExposedObject: Send + Sync + 'static {
    fn describe(desc: &mut DescriptorBuilder<Self>)
    where
        Self: Sized;
}

/// Per-field flags for [`DescriptorBuilder::value_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueFlags {
    pub allow_get: bool,
    pub allow_set: bool,
    pub watch: bool,
}

impl Default for ValueFlags {
    fn default() -> Self {
        Self {
            allow_get: true,
            allow_set: true,
            watch: false,
        }
    }
}

impl ValueFlags {
    pub fn read_only(mut self) -> Self {
        self.allow_set = false;
        self
    }

    pub fn write_only(mut self) -> Self {
        self.allow_get = false;
        self
    }

    pub fn watched(mut self) -> Self {
        self.watch = true;
        self
    }
}

pub struct PropertyDescriptor {
    name: String,
    allow_get: bool,
    allow_set: bool,
    watch: bool,
    getter: Option<Getter>,
    setter: Option<Setter>,
}

impl PropertyDescriptor {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            allow_get: false,
            allow_set: false,
            watch: false,
            getter: None,
            setter: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn allows_get(&self) -> bool {
        self.allow_get && self.getter.is_some()
    }

    pub fn allows_set(&self) -> bool {
        self.allow_set && self.setter.is_some()
    }

    pub fn is_watched(&self) -> bool {
        self.watch && self.getter.is_some()
    }

    pub(crate) fn get(&self, instance: &Instance) -> Result<JsonValue, BridgeError> {
        match &self.getter {
            Some(getter) if self.allow_get => getter(instance),
            _ => Err(self.denied(Operation::Get)),
        }
    }

    pub(crate) fn set(&self, instance: &Instance, value: &JsonValue) -> Result<(), BridgeError> {
        match &self.setter {
            Some(setter) if self.allow_set => setter(instance, value),
            _ => Err(self.denied(Operation::Set)),
        }
    }

    /// Read for mutation sampling; ignores the GET permission.
    pub(crate) fn sample(&self, instance: &Instance) -> Result<JsonValue, BridgeError> {
        match &self.getter {
            Some(getter) => getter(instance),
            None => Err(self.denied(Operation::Get)),
        }
    }

    fn denied(&self, operation: Operation) -> BridgeError {
        BridgeError::NotPermitted {
            operation,
            property: self.name.clone(),
        }
    }
}

impl fmt::Debug for PropertyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyDescriptor")
            .field("name", &self.name)
            .field("allow_get", &self.allows_get())
            .field("allow_set", &self.allows_set())
            .field("watch", &self.watch)
            .finish()
    }
}

pub struct FunctionDescriptor {
    name: String,
    param_types: Vec<&'static str>,
    invoker: Invoker,
}

impl FunctionDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.param_types.len()
    }

    pub fn param_types(&self) -> &[&'static str] {
        &self.param_types
    }

    pub(crate) fn invoke(
        &self,
        instance: &Instance,
        args: &[JsonValue],
    ) -> Result<JsonValue, BridgeError> {
        if args.len() != self.arity() {
            return Err(BridgeError::ArityMismatch {
                function: self.name.clone(),
                expected: self.arity(),
                actual: args.len(),
            });
        }
        (self.invoker)(instance, args)
    }
}

impl fmt::Debug for FunctionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionDescriptor")
            .field("name", &self.name)
            .field("param_types", &self.param_types)
            .finish()
    }
}

pub struct ChildDescriptor {
    name: String,
    accessor: ChildAccessor,
}

impl ChildDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn resolve(&self, instance: &Instance) -> Option<ObjectRef> {
        (self.accessor)(instance)
    }
}

/// Immutable capability table of one exposed type.
pub struct ObjectDescriptor {
    type_name: &'static str,
    properties: BTreeMap<String, PropertyDescriptor>,
    functions: BTreeMap<String, FunctionDescriptor>,
    children: Vec<ChildDescriptor>,
}

static DESCRIPTORS: OnceLock<RwLock<HashMap<TypeId, Arc<ObjectDescriptor>>>> = OnceLock::new();

impl ObjectDescriptor {
    /// Build a fresh table for `T`.
    pub fn of<T: ExposedObject>() -> Self {
        let mut builder = DescriptorBuilder::<T>::new();
        T::describe(&mut builder);
        builder.build()
    }

    /// The table of `T`, built on first use and shared afterwards.
    pub fn shared<T: ExposedObject>() -> Arc<Self> {
        let cache = DESCRIPTORS.get_or_init(|| RwLock::new(HashMap::new()));
        if let Some(descriptor) = cache.read().get(&TypeId::of::<T>()) {
            return Arc::clone(descriptor);
        }
        // Built outside the lock; a racing builder's table is discarded.
        let built = Arc::new(Self::of::<T>());
        Arc::clone(cache.write().entry(TypeId::of::<T>()).or_insert(built))
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.properties.get(name)
    }

    pub fn function(&self, name: &str) -> Option<&FunctionDescriptor> {
        self.functions.get(name)
    }

    pub fn properties(&self) -> impl Iterator<Item = &PropertyDescriptor> {
        self.properties.values()
    }

    pub fn functions(&self) -> impl Iterator<Item = &FunctionDescriptor> {
        self.functions.values()
    }

    pub fn children(&self) -> &[ChildDescriptor] {
        &self.children
    }
}

impl fmt::Debug for ObjectDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDescriptor")
            .field("type_name", &self.type_name)
            .field("properties", &self.properties.values().collect::<Vec<_>>())
            .field("functions", &self.functions.values().collect::<Vec<_>>())
            .field(
                "children",
                &self.children.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Collects the declaration table of `T`.
pub struct DescriptorBuilder<T> {
    properties: BTreeMap<String, PropertyDescriptor>,
    functions: BTreeMap<String, FunctionDescriptor>,
    children: Vec<ChildDescriptor>,
    _marker: PhantomData<fn(&T)>,
}

impl<T: Send + Sync + 'static> DescriptorBuilder<T> {
    fn new() -> Self {
        Self {
            properties: BTreeMap::new(),
            functions: BTreeMap::new(),
            children: Vec::new(),
            _marker: PhantomData,
        }
    }

    fn entry(&mut self, name: &str) -> &mut PropertyDescriptor {
        self.properties
            .entry(name.to_string())
            .or_insert_with(|| PropertyDescriptor::new(name))
    }

    /// Bind a field with default flags (get and set allowed, not watched).
    pub fn value<V>(&mut self, name: &str, field: fn(&T) -> &ValueCell<V>) -> &mut Self
    where
        V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        self.value_with(name, field, ValueFlags::default())
    }

    pub fn value_with<V>(
        &mut self,
        name: &str,
        field: fn(&T) -> &ValueCell<V>,
        flags: ValueFlags,
    ) -> &mut Self
    where
        V: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let getter: Getter = Arc::new(move |instance| {
            let this = downcast::<T>(instance)?;
            to_json(&field(this).get())
        });
        let property = name.to_string();
        let setter: Setter = Arc::new(move |instance, value| {
            let this = downcast::<T>(instance)?;
            if value.is_null() {
                field(this).clear();
            } else {
                field(this).set(coerce::<V>(value, &format!("value for {property}"))?);
            }
            Ok(())
        });

        let entry = self.entry(name);
        entry.getter = Some(getter);
        entry.setter = Some(setter);
        entry.allow_get = flags.allow_get;
        entry.allow_set = flags.allow_set;
        entry.watch = flags.watch;
        self
    }

    /// Explicit accessor; replaces any field binding for GET.
    pub fn getter<R, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        R: Serialize,
        F: Fn(&T) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let getter: Getter = Arc::new(move |instance| {
            let this = downcast::<T>(instance)?;
            let result = f(this).map_err(BridgeError::host)?;
            to_json(&result)
        });
        let entry = self.entry(name);
        entry.getter = Some(getter);
        entry.allow_get = true;
        self
    }

    /// Explicit mutator; `None` is passed for a script-side `null`.
    pub fn setter<V, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        V: DeserializeOwned,
        F: Fn(&T, Option<V>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let property = name.to_string();
        let setter: Setter = Arc::new(move |instance, value| {
            let this = downcast::<T>(instance)?;
            let converted = if value.is_null() {
                None
            } else {
                Some(coerce::<V>(value, &format!("value for {property}"))?)
            };
            f(this, converted).map_err(BridgeError::host)
        });
        let entry = self.entry(name);
        entry.setter = Some(setter);
        entry.allow_set = true;
        self
    }

    /// Poll `name` for changes. Needed for properties declared through
    /// [`getter`](Self::getter); fields use [`ValueFlags::watched`].
    pub fn watch(&mut self, name: &str) -> &mut Self {
        self.entry(name).watch = true;
        self
    }

    pub fn function<A, R, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        A: FunctionArgs,
        R: Serialize,
        F: Fn(&T, A) -> anyhow::Result<R> + Send + Sync + 'static,
    {
        let invoker: Invoker = Arc::new(move |instance, args| {
            let this = downcast::<T>(instance)?;
            let parsed = A::from_json(args)?;
            let result = f(this, parsed).map_err(BridgeError::host)?;
            to_json(&result)
        });
        self.functions.insert(
            name.to_string(),
            FunctionDescriptor {
                name: name.to_string(),
                param_types: A::param_types(),
                invoker,
            },
        );
        self
    }

    /// Nested exposed object, resolved again on every tree walk so that a
    /// swapped child is picked up by the next (re)initialisation.
    pub fn child<C, F>(&mut self, name: &str, f: F) -> &mut Self
    where
        C: ExposedObject,
        F: Fn(&T) -> Option<Arc<C>> + Send + Sync + 'static,
    {
        let accessor: ChildAccessor = Arc::new(move |instance| {
            let this = instance.downcast_ref::<T>()?;
            f(this).map(ObjectRef::new)
        });
        self.children.retain(|child| child.name != name);
        self.children.push(ChildDescriptor {
            name: name.to_string(),
            accessor,
        });
        self
    }

    pub fn build(self) -> ObjectDescriptor {
        ObjectDescriptor {
            type_name: type_name::<T>(),
            properties: self.properties,
            functions: self.functions,
            children: self.children,
        }
    }
}

/// A live host instance paired with its descriptor.
#[derive(Clone)]
pub struct ObjectRef {
    instance: Arc<Instance>,
    descriptor: Arc<ObjectDescriptor>,
}

impl ObjectRef {
    pub fn new<T: ExposedObject>(instance: Arc<T>) -> Self {
        Self {
            instance,
            descriptor: ObjectDescriptor::shared::<T>(),
        }
    }

    /// Address of the shared instance; stable while any `Arc` to it lives.
    pub fn identity(&self) -> usize {
        Arc::as_ptr(&self.instance) as *const () as usize
    }

    pub fn same_instance(&self, other: &ObjectRef) -> bool {
        self.identity() == other.identity()
    }

    pub fn descriptor(&self) -> &ObjectDescriptor {
        &self.descriptor
    }

    pub fn instance(&self) -> &Instance {
        self.instance.as_ref()
    }

    pub fn downcast<T: ExposedObject>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.instance).downcast::<T>().ok()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectRef")
            .field("type_name", &self.descriptor.type_name)
            .field("identity", &format_args!("{:#x}", self.identity()))
            .finish()
    }
}

fn downcast<T: 'static>(instance: &Instance) -> Result<&T, BridgeError> {
    instance.downcast_ref::<T>().ok_or_else(|| {
        let message = format!("descriptor bound to {} got another type", type_name::<T>());
        BridgeError::Host {
            trace: message.clone(),
            message,
        }
    })
}

fn to_json<R: Serialize>(value: &R) -> Result<JsonValue, BridgeError> {
    serde_json::to_value(value).map_err(|err| BridgeError::host(anyhow::Error::from(err)))
}
