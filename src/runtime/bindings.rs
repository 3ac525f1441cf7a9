//! Binding table for host functions and objects exposed to script.
//!
//! Descriptors are registered before execution and read on every call from
//! script back into host code. Entries live in an arena indexed by a
//! generation-checked slot id; closing the runtime bumps the generation,
//! which invalidates every outstanding [`ObjectHandle`] at once.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::LocalBoxFuture;

use crate::runtime::error::{Error, Result};
use crate::runtime::js_value::JsValue;

/// A synchronous host callable.
pub type HostFunction = Arc<dyn Fn(Vec<JsValue>) -> Result<JsValue> + Send + Sync>;

/// An asynchronous host callable. The returned future runs on the runtime
/// thread and may suspend freely; it never blocks the engine.
pub type HostAsyncFunction =
    Arc<dyn Fn(Vec<JsValue>) -> LocalBoxFuture<'static, Result<JsValue>> + Send + Sync>;

/// A host-backed property getter.
pub type HostGetter = Arc<dyn Fn() -> Result<JsValue> + Send + Sync>;

/// A host-backed property setter.
pub type HostSetter = Arc<dyn Fn(JsValue) -> Result<()> + Send + Sync>;

/// A callable binding, sync or async.
#[derive(Clone)]
pub enum FunctionBinding {
    Sync(HostFunction),
    Async(HostAsyncFunction),
}

impl FunctionBinding {
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Vec<JsValue>) -> Result<JsValue> + Send + Sync + 'static,
    {
        FunctionBinding::Sync(Arc::new(f))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, FunctionBinding::Async(_))
    }
}

/// One named property on an object binding.
pub struct PropertyDescriptor {
    pub name: String,
    pub getter: Option<HostGetter>,
    pub setter: Option<HostSetter>,
}

/// One named function on an object binding.
pub struct FunctionDescriptor {
    pub name: String,
    pub binding: FunctionBinding,
}

/// Shape of a host object exposed to script: named properties backed by
/// getter/setter capabilities plus named functions.
#[derive(Default)]
pub struct ObjectDescriptor {
    pub properties: Vec<PropertyDescriptor>,
    pub functions: Vec<FunctionDescriptor>,
}

impl ObjectDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn property<G>(mut self, name: &str, getter: G) -> Self
    where
        G: Fn() -> Result<JsValue> + Send + Sync + 'static,
    {
        self.properties.push(PropertyDescriptor {
            name: name.to_string(),
            getter: Some(Arc::new(getter)),
            setter: None,
        });
        self
    }

    pub fn mutable_property<G, S>(mut self, name: &str, getter: G, setter: S) -> Self
    where
        G: Fn() -> Result<JsValue> + Send + Sync + 'static,
        S: Fn(JsValue) -> Result<()> + Send + Sync + 'static,
    {
        self.properties.push(PropertyDescriptor {
            name: name.to_string(),
            getter: Some(Arc::new(getter)),
            setter: Some(Arc::new(setter)),
        });
        self
    }

    pub fn function<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Vec<JsValue>) -> Result<JsValue> + Send + Sync + 'static,
    {
        self.functions.push(FunctionDescriptor {
            name: name.to_string(),
            binding: FunctionBinding::Sync(Arc::new(f)),
        });
        self
    }

    pub fn async_function<F, Fut>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Vec<JsValue>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<JsValue>> + 'static,
    {
        let callable: HostAsyncFunction = Arc::new(move |args| Box::pin(f(args)));
        self.functions.push(FunctionDescriptor {
            name: name.to_string(),
            binding: FunctionBinding::Async(callable),
        });
        self
    }
}

/// Getter/setter capability pair for one property of an object entry.
pub(crate) struct PropertySlots {
    pub getter: Option<HostGetter>,
    pub setter: Option<HostSetter>,
}

/// A registered object binding: its host-backed properties. The script-side
/// object itself lives in the engine's binding registry, keyed by the same
/// slot id.
pub(crate) struct ObjectEntry {
    pub properties: HashMap<String, PropertySlots>,
}

/// One arena entry.
pub(crate) enum BindingEntry {
    Function(FunctionBinding),
    Object(ObjectEntry),
}

/// Opaque handle to a registered object binding, used as the parent scope for
/// nested registrations. Stale after the runtime closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHandle {
    pub(crate) index: u32,
    pub(crate) generation: u64,
}

/// Arena of binding descriptors, owned by the runtime thread.
pub(crate) struct BindingTable {
    entries: Vec<Option<BindingEntry>>,
    generation: u64,
}

impl BindingTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            generation: 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Insert an entry, returning its slot id.
    pub fn insert(&mut self, entry: BindingEntry) -> u32 {
        let index = self.entries.len() as u32;
        self.entries.push(Some(entry));
        index
    }

    /// Drop an entry registered speculatively before an engine-side failure.
    pub fn remove(&mut self, index: u32) {
        if let Some(slot) = self.entries.get_mut(index as usize) {
            *slot = None;
        }
    }

    pub fn get(&self, index: u32) -> Option<&BindingEntry> {
        self.entries.get(index as usize).and_then(Option::as_ref)
    }

    /// Resolve the slot behind an object handle, rejecting handles from a
    /// previous generation (the runtime was closed since they were issued).
    pub fn resolve_object(&self, handle: ObjectHandle) -> Result<u32> {
        if handle.generation != self.generation {
            return Err(Error::ClosedRuntime);
        }
        match self.get(handle.index) {
            Some(BindingEntry::Object(_)) => Ok(handle.index),
            _ => Err(Error::DuplicateOrInvalidName(format!(
                "object handle #{}",
                handle.index
            ))),
        }
    }

    /// Invalidate every entry and outstanding handle.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.generation += 1;
    }
}

/// Names must be plausible identifiers; the engine-side definition also
/// rejects anything already present in the target scope.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' || first == '$' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::DuplicateOrInvalidName(name.to_string()))
    }
}
