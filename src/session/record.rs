//! Saved originals for undoing installed interceptors.

use crate::target::{CatchFn, ClassDef, DeferredClass, MemberFn, MethodFn, PropertySlot, Target, ThenFn};

/// Everything needed to reverse one installed interceptor exactly.
///
/// Records are independent point-fixes; restoration order does not matter.
/// Each record is exclusively owned by the session that created it.
pub(crate) enum InterceptionRecord {
    /// A wrapped callback-accepting function member.
    Callback {
        name: String,
        original: MemberFn,
    },
    /// A wrapped timer-fire function member.
    TimerHandler {
        name: String,
        original: MemberFn,
    },
    /// Replaced attachment operations of a deferred-value class.
    Deferred {
        class: DeferredClass,
        then: ThenFn,
        catch: CatchFn,
    },
    /// A wrapped shared method.
    Method {
        class: ClassDef,
        name: String,
        original: MethodFn,
    },
    /// A replaced property descriptor. `original` is `None` when no
    /// descriptor existed before instrumentation; restoration then installs
    /// an explicit plain descriptor rather than leaving the accessor.
    Property {
        class: ClassDef,
        name: String,
        original: Option<PropertySlot>,
    },
}

impl InterceptionRecord {
    /// Reinstates the saved original definition.
    pub(crate) fn undo(self, target: &Target) {
        match self {
            Self::Callback { name, original } | Self::TimerHandler { name, original } => {
                let _ = target.replace_function(&name, original);
            }
            Self::Deferred { class, then, catch } => {
                class.replace_then(then);
                class.replace_catch(catch);
            }
            Self::Method {
                class,
                name,
                original,
            } => {
                let _ = class.replace_method(&name, original);
            }
            Self::Property {
                class,
                name,
                original,
            } => {
                class.set_property_slot(&name, original.unwrap_or(PropertySlot::Stored));
            }
        }
    }
}

impl std::fmt::Debug for InterceptionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Callback { name, .. } => write!(f, "Callback({name})"),
            Self::TimerHandler { name, .. } => write!(f, "TimerHandler({name})"),
            Self::Deferred { class, .. } => write!(f, "Deferred({})", class.name()),
            Self::Method { class, name, .. } => write!(f, "Method({}::{name})", class.name()),
            Self::Property { class, name, .. } => write!(f, "Property({}::{name})", class.name()),
        }
    }
}
