//! Class definitions, instances, and property descriptors.
//!
//! A [`ClassDef`] is the shared half of an object: a method table and a
//! property-descriptor table, both replaceable member by member. An
//! [`Instance`] carries a unique [`ObjectId`], a handle to its class, and a
//! private field map. Method dispatch and property access always consult
//! the class tables, so wrapping a shared method or descriptor affects
//! every instance at once - and restoring it restores them all.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::Value;
use crate::error::{Error, Result};
use crate::ledger::Token;

/// Unique identity for an object (instance or deferred value).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Allocates a fresh, process-unique id.
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw id value.
    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the ledger token for this object.
    #[must_use]
    pub fn token(self) -> Token {
        Token::Object(self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Object({})", self.0)
    }
}

/// A shared method of a class.
pub type MethodFn = Arc<dyn Fn(&Instance, &[Value]) -> Value + Send + Sync>;

/// The read half of an accessor property.
pub type GetterFn = Arc<dyn Fn(&Instance) -> Value + Send + Sync>;

/// The write half of an accessor property.
pub type SetterFn = Arc<dyn Fn(&Instance, Value) + Send + Sync>;

/// Describes how a named property behaves on instances of a class.
#[derive(Clone)]
pub enum PropertySlot {
    /// A plain data property backed by the instance field map.
    Stored,
    /// An accessor property.
    ///
    /// `handler` is the dispatch view used by [`Instance::invoke`]; it may
    /// differ from the read view so an instrumented property can hand back
    /// the originally assigned callback while dispatching a wrapper.
    Accessor {
        /// Runs on [`Instance::get`].
        get: GetterFn,
        /// Runs on [`Instance::set`].
        set: SetterFn,
        /// Produces the callable dispatched by [`Instance::invoke`].
        handler: GetterFn,
    },
}

impl fmt::Debug for PropertySlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stored => write!(f, "Stored"),
            Self::Accessor { .. } => write!(f, "Accessor"),
        }
    }
}

/// A class: a shared method table plus property descriptors.
///
/// Cloning shares the underlying tables.
#[derive(Clone)]
pub struct ClassDef {
    inner: Arc<ClassInner>,
}

struct ClassInner {
    name: String,
    methods: Mutex<HashMap<String, MethodFn>>,
    properties: Mutex<HashMap<String, PropertySlot>>,
}

impl ClassDef {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(ClassInner {
                name: name.to_string(),
                methods: Mutex::new(HashMap::new()),
                properties: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Returns the class name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Defines (or redefines) a shared method.
    pub fn define_method<F>(&self, name: &str, method: F)
    where
        F: Fn(&Instance, &[Value]) -> Value + Send + Sync + 'static,
    {
        self.inner
            .methods
            .lock()
            .insert(name.to_string(), Arc::new(method));
    }

    /// Looks up a shared method.
    #[must_use]
    pub fn method(&self, name: &str) -> Option<MethodFn> {
        self.inner.methods.lock().get(name).map(Arc::clone)
    }

    /// Swaps a shared method, returning the previous definition.
    pub(crate) fn replace_method(&self, name: &str, method: MethodFn) -> Result<MethodFn> {
        match self.inner.methods.lock().get_mut(name) {
            Some(slot) => Ok(std::mem::replace(slot, method)),
            None => Err(Error::missing_member(format!(
                "{}::{name}",
                self.inner.name
            ))),
        }
    }

    /// Returns the descriptor for a named property, if one is defined.
    ///
    /// An undescribed property behaves as [`PropertySlot::Stored`].
    #[must_use]
    pub fn property_slot(&self, name: &str) -> Option<PropertySlot> {
        self.inner.properties.lock().get(name).cloned()
    }

    /// Installs a property descriptor, returning the prior one if any.
    pub(crate) fn set_property_slot(
        &self,
        name: &str,
        slot: PropertySlot,
    ) -> Option<PropertySlot> {
        self.inner.properties.lock().insert(name.to_string(), slot)
    }

    /// Creates a fresh instance of this class.
    #[must_use]
    pub fn instantiate(&self) -> Instance {
        Instance {
            inner: Arc::new(InstanceInner {
                id: ObjectId::new(),
                class: self.clone(),
                fields: Mutex::new(HashMap::new()),
            }),
        }
    }
}

impl fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDef")
            .field("name", &self.inner.name)
            .field("methods", &self.inner.methods.lock().len())
            .field("properties", &self.inner.properties.lock().len())
            .finish()
    }
}

/// An instance of a [`ClassDef`].
///
/// Cloning shares the underlying state; the clone is the same object.
#[derive(Clone)]
pub struct Instance {
    inner: Arc<InstanceInner>,
}

struct InstanceInner {
    id: ObjectId,
    class: ClassDef,
    fields: Mutex<HashMap<String, Value>>,
}

impl Instance {
    /// Returns this instance's unique id.
    #[must_use]
    pub fn id(&self) -> ObjectId {
        self.inner.id
    }

    /// Returns the ledger token keyed on this instance.
    #[must_use]
    pub fn token(&self) -> Token {
        self.inner.id.token()
    }

    /// Returns the class this instance belongs to.
    #[must_use]
    pub fn class(&self) -> &ClassDef {
        &self.inner.class
    }

    /// Invokes a shared method on this instance.
    ///
    /// The method is cloned out of the class table before the call, so the
    /// method body may re-enter the instance or its class.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingMember`] when the class has no such method.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        let method = self.inner.class.method(name).ok_or_else(|| {
            Error::missing_member(format!("{}::{name}", self.inner.class.name()))
        })?;
        Ok((*method)(self, args))
    }

    /// Reads a property through its descriptor.
    ///
    /// Undescribed and stored properties read the field map directly; an
    /// absent field reads as [`Value::Unit`].
    #[must_use]
    pub fn get(&self, name: &str) -> Value {
        match self.inner.class.property_slot(name) {
            Some(PropertySlot::Accessor { get, .. }) => (*get)(self),
            _ => self.raw_field(name).unwrap_or(Value::Unit),
        }
    }

    /// Writes a property through its descriptor.
    pub fn set(&self, name: &str, value: Value) {
        match self.inner.class.property_slot(name) {
            Some(PropertySlot::Accessor { set, .. }) => (*set)(self, value),
            _ => self.raw_set(name, value),
        }
    }

    /// Dispatches a property as an event handler.
    ///
    /// Resolves the callable through the descriptor's dispatch view and
    /// calls it; a property that is absent or not callable yields
    /// [`Value::Unit`] without error (firing an unset handler is a no-op).
    pub fn invoke(&self, name: &str, args: &[Value]) -> Value {
        let callable = match self.inner.class.property_slot(name) {
            Some(PropertySlot::Accessor { handler, .. }) => (*handler)(self),
            _ => self.raw_field(name).unwrap_or(Value::Unit),
        };
        match callable {
            Value::Callback(callback) => (*callback)(args),
            _ => Value::Unit,
        }
    }

    /// Reads a field directly, bypassing any accessor.
    #[must_use]
    pub fn raw_field(&self, name: &str) -> Option<Value> {
        self.inner.fields.lock().get(name).cloned()
    }

    /// Writes a field directly, bypassing any accessor.
    pub fn raw_set(&self, name: &str, value: Value) {
        self.inner.fields.lock().insert(name.to_string(), value);
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.inner.id)
            .field("class", &self.inner.class.name())
            .finish()
    }
}
