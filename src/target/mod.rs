//! Dynamic target substrate: named members that can be replaced and restored.
//!
//! A [`Target`] stands in for the "arbitrary object graph" an instrumentation
//! session wraps. It is a table of named members - free functions, class
//! definitions with shared method tables and property descriptors, and
//! deferred-value classes - all stored as `Arc`'d closures so that member
//! replacement is cheap and exact restoration (down to reference equality)
//! is possible.
//!
//! Invocation never holds a lock while user code runs, so intercepted calls
//! may freely re-enter the target.
//!
//! # Example
//!
//! ```rust
//! use settlekit::target::{Target, Value};
//!
//! let target = Target::new();
//! target.define_function("double", |args| {
//!     match args.first() {
//!         Some(Value::Int(n)) => Value::Int(n * 2),
//!         _ => Value::Unit,
//!     }
//! });
//!
//! assert_eq!(target.call("double", &[Value::Int(21)]).unwrap(), Value::Int(42));
//! assert!(target.call("missing", &[]).is_err());
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Error, Result};

pub mod class;
pub mod deferred;

pub use class::{ClassDef, GetterFn, Instance, MethodFn, ObjectId, PropertySlot, SetterFn};
pub use deferred::{CatchFn, Deferred, DeferredClass, Settlement, ThenFn};

/// A scheduler-issued operation handle.
pub type Handle = u64;

/// A dynamically-typed callable stored in a target.
pub type Callback = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// A free-function member of a target.
pub type MemberFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// A dynamically-typed value passed through instrumented members.
#[derive(Clone)]
pub enum Value {
    /// The absence of a value.
    Unit,
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// A string.
    Str(String),
    /// A scheduler-issued handle.
    Handle(Handle),
    /// A callable value.
    Callback(Callback),
}

impl Value {
    /// Wraps a closure as a callback value.
    pub fn callback<F>(function: F) -> Self
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        Self::Callback(Arc::new(function))
    }

    /// Returns the handle if this value is one.
    #[must_use]
    pub fn as_handle(&self) -> Option<Handle> {
        match self {
            Self::Handle(handle) => Some(*handle),
            _ => None,
        }
    }

    /// Returns the integer if this value is one.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the callback if this value is one.
    #[must_use]
    pub fn as_callback(&self) -> Option<Callback> {
        match self {
            Self::Callback(callback) => Some(Arc::clone(callback)),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Unit, Self::Unit) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Handle(a), Self::Handle(b)) => a == b,
            // Callbacks compare by identity, not behavior.
            (Self::Callback(a), Self::Callback(b)) => {
                std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
            }
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => write!(f, "Unit"),
            Self::Bool(value) => write!(f, "Bool({value})"),
            Self::Int(value) => write!(f, "Int({value})"),
            Self::Str(value) => write!(f, "Str({value:?})"),
            Self::Handle(handle) => write!(f, "Handle({handle})"),
            Self::Callback(_) => write!(f, "Callback(<fn>)"),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

/// One named member of a target.
enum Member {
    Function(MemberFn),
    Class(ClassDef),
    Deferred(DeferredClass),
}

/// A dynamic object whose members can be instrumented and restored.
///
/// Cloning shares the underlying member table.
#[derive(Clone, Default)]
pub struct Target {
    inner: Arc<TargetInner>,
}

#[derive(Default)]
struct TargetInner {
    members: Mutex<HashMap<String, Member>>,
}

impl Target {
    /// Creates an empty target.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines (or redefines) a free-function member.
    pub fn define_function<F>(&self, name: &str, function: F)
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        self.inner
            .members
            .lock()
            .insert(name.to_string(), Member::Function(Arc::new(function)));
    }

    /// Defines a class member and returns a handle to it.
    pub fn define_class(&self, name: &str) -> ClassDef {
        let class = ClassDef::new(name);
        self.inner
            .members
            .lock()
            .insert(name.to_string(), Member::Class(class.clone()));
        class
    }

    /// Defines a deferred-value class member and returns a handle to it.
    pub fn define_deferred_class(&self, name: &str) -> DeferredClass {
        let class = DeferredClass::new(name);
        self.inner
            .members
            .lock()
            .insert(name.to_string(), Member::Deferred(class.clone()));
        class
    }

    /// Looks up a free-function member.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingMember`] when no member has that name, and
    /// [`Error::WrongShape`] when the member is not a function.
    pub fn function(&self, name: &str) -> Result<MemberFn> {
        match self.inner.members.lock().get(name) {
            Some(Member::Function(function)) => Ok(Arc::clone(function)),
            Some(_) => Err(Error::wrong_shape(name, "function")),
            None => Err(Error::missing_member(name)),
        }
    }

    /// Looks up a class member.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingMember`] or [`Error::WrongShape`] as
    /// [`Target::function`] does.
    pub fn class(&self, name: &str) -> Result<ClassDef> {
        match self.inner.members.lock().get(name) {
            Some(Member::Class(class)) => Ok(class.clone()),
            Some(_) => Err(Error::wrong_shape(name, "class")),
            None => Err(Error::missing_member(name)),
        }
    }

    /// Looks up a deferred-value class member.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingMember`] or [`Error::WrongShape`] as
    /// [`Target::function`] does.
    pub fn deferred_class(&self, name: &str) -> Result<DeferredClass> {
        match self.inner.members.lock().get(name) {
            Some(Member::Deferred(class)) => Ok(class.clone()),
            Some(_) => Err(Error::wrong_shape(name, "deferred-value class")),
            None => Err(Error::missing_member(name)),
        }
    }

    /// Invokes a free-function member.
    ///
    /// The member is cloned out of the table before the call, so the member
    /// body may re-enter the target.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingMember`] or [`Error::WrongShape`] as
    /// [`Target::function`] does.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value> {
        let function = self.function(name)?;
        Ok((*function)(args))
    }

    /// Returns `true` when the target has a member with that name.
    #[must_use]
    pub fn has_member(&self, name: &str) -> bool {
        self.inner.members.lock().contains_key(name)
    }

    /// Swaps a free-function member, returning the previous definition.
    pub(crate) fn replace_function(&self, name: &str, function: MemberFn) -> Result<MemberFn> {
        match self.inner.members.lock().get_mut(name) {
            Some(Member::Function(slot)) => Ok(std::mem::replace(slot, function)),
            Some(_) => Err(Error::wrong_shape(name, "function")),
            None => Err(Error::missing_member(name)),
        }
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("members", &self.inner.members.lock().len())
            .finish()
    }
}

/// Compares two callables by identity.
pub(crate) fn same_fn<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
