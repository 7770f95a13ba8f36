use core::any::{Any, TypeId};
use core::fmt;
use core::hash::{Hash, Hasher};
use std::collections::HashMap;
use std::sync::Arc;

use crate::interceptor::signature::Signature;

/// A dependency value as seen by the resolver and injector.
///
/// A value bound or resolved for declared type `T` always has concrete type `T`.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Temporary type -> value map consulted before regular bindings during one
/// resolution pass.
pub type ScopedInstances = HashMap<TypeKey, Value>;

/// Runtime identity of a Rust type, printable by name.
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: core::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn is_unit(&self) -> bool {
        self.id == TypeId::of::<()>()
    }

    /// Whether `value` holds a `T` for this key's `T`.
    pub fn matches(&self, value: &Value) -> bool {
        (**value).type_id() == self.id
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Parameter/return shape of a compiled function.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CallSignature {
    pub receiver: Option<TypeKey>,
    pub parameters: Vec<TypeKey>,
    pub output: TypeKey,
}

impl CallSignature {
    pub fn of<F: Signature>() -> Self {
        Self {
            receiver: F::receiver_type(),
            parameters: F::parameter_types(),
            output: TypeKey::of::<F::Output>(),
        }
    }

    pub fn is_void(&self) -> bool {
        self.output.is_unit()
    }

    pub fn arity(&self) -> usize {
        self.parameters.len()
    }
}

impl fmt::Display for CallSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        let mut first = true;
        if let Some(receiver) = &self.receiver {
            write!(f, "&{receiver}")?;
            first = false;
        }
        for param in &self.parameters {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{param}")?;
            first = false;
        }
        write!(f, ") -> {}", self.output)
    }
}

/// Entry address of a compiled function together with its signature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FunctionHandle {
    entry: usize,
    signature: CallSignature,
}

impl FunctionHandle {
    pub fn new(entry: usize, signature: CallSignature) -> Self {
        Self { entry, signature }
    }

    pub fn of<F: Signature>(function: F) -> Self {
        Self::new(function.entry(), CallSignature::of::<F>())
    }

    pub fn entry(&self) -> usize {
        self.entry
    }

    pub fn signature(&self) -> &CallSignature {
        &self.signature
    }
}

/// Identity of an interception slot: owning bound type plus call shape.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShapeKey {
    owner: TypeKey,
    signature: CallSignature,
}

impl ShapeKey {
    pub fn new(owner: TypeKey, signature: CallSignature) -> Self {
        Self { owner, signature }
    }

    pub fn of<O: ?Sized + 'static, F: Signature>() -> Self {
        Self::new(TypeKey::of::<O>(), CallSignature::of::<F>())
    }

    pub fn owner(&self) -> TypeKey {
        self.owner
    }

    pub fn signature(&self) -> &CallSignature {
        &self.signature
    }
}

impl fmt::Display for ShapeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.owner, self.signature)
    }
}
