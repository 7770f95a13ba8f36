use std::sync::Arc;

use crate::error::{ArgumentError, ResolutionError};
use crate::types::{TypeKey, Value};

/// A parameter type that can travel through the resolver as a [`Value`].
///
/// `Option<Arc<T>>` is the nullable form: `None` is an unset slot that gets
/// resolved for `T`.
pub trait Argument: Sized + 'static {
    /// Type the resolver looks up when this slot is unset.
    fn declared_type() -> TypeKey;

    fn into_slot(self) -> Option<Value>;

    fn from_value(value: Value) -> Result<Self, ResolutionError>;
}

macro_rules! plain_arguments {
    ($($t:ty),* $(,)?) => {$(
        impl Argument for $t {
            fn declared_type() -> TypeKey {
                TypeKey::of::<$t>()
            }

            fn into_slot(self) -> Option<Value> {
                Some(Arc::new(self) as Value)
            }

            fn from_value(value: Value) -> Result<Self, ResolutionError> {
                value
                    .downcast::<$t>()
                    .map(|v| (*v).clone())
                    .map_err(|_| ResolutionError::TypeMismatch { expected: TypeKey::of::<$t>() })
            }
        }
    )*};
}

plain_arguments!(
    i8, i16, i32, i64, i128, isize,
    u8, u16, u32, u64, u128, usize,
    f32, f64, bool, char,
    String, &'static str,
);

impl<T: Send + Sync + 'static> Argument for Arc<T> {
    fn declared_type() -> TypeKey {
        TypeKey::of::<T>()
    }

    fn into_slot(self) -> Option<Value> {
        Some(self as Value)
    }

    fn from_value(value: Value) -> Result<Self, ResolutionError> {
        value
            .downcast::<T>()
            .map_err(|_| ResolutionError::TypeMismatch { expected: TypeKey::of::<T>() })
    }
}

impl<T: Send + Sync + 'static> Argument for Option<Arc<T>> {
    fn declared_type() -> TypeKey {
        TypeKey::of::<T>()
    }

    fn into_slot(self) -> Option<Value> {
        self.map(|v| v as Value)
    }

    fn from_value(value: Value) -> Result<Self, ResolutionError> {
        <Arc<T> as Argument>::from_value(value).map(Some)
    }
}

/// A full parameter list, as a tuple of [`Argument`]s.
pub trait ArgumentList: Sized + 'static {
    /// Exact Rust parameter types, in order.
    fn parameter_types() -> Vec<TypeKey>;

    /// Types unset slots resolve as, in order.
    fn declared_types() -> Vec<TypeKey>;

    fn into_slots(self) -> Vec<Option<Value>>;

    fn from_values(values: Vec<Value>) -> Result<Self, ResolutionError>;
}

macro_rules! tuple_arguments {
    ($n:expr; $($A:ident $a:ident),*) => {
        impl<$($A: Argument),*> ArgumentList for ($($A,)*) {
            fn parameter_types() -> Vec<TypeKey> {
                vec![$(TypeKey::of::<$A>()),*]
            }

            fn declared_types() -> Vec<TypeKey> {
                vec![$($A::declared_type()),*]
            }

            fn into_slots(self) -> Vec<Option<Value>> {
                let ($($a,)*) = self;
                vec![$($a.into_slot()),*]
            }

            #[allow(unused_mut, unused_variables)]
            fn from_values(values: Vec<Value>) -> Result<Self, ResolutionError> {
                if values.len() != $n {
                    return Err(ResolutionError::ArityMismatch { expected: $n, actual: values.len() });
                }
                let mut values = values.into_iter();
                Ok(($(
                    $A::from_value(values.next().ok_or(ResolutionError::ArityMismatch {
                        expected: $n,
                        actual: 0,
                    })?)?,
                )*))
            }
        }
    };
}

tuple_arguments!(0;);
tuple_arguments!(1; A0 a0);
tuple_arguments!(2; A0 a0, A1 a1);
tuple_arguments!(3; A0 a0, A1 a1, A2 a2);
tuple_arguments!(4; A0 a0, A1 a1, A2 a2, A3 a3);
tuple_arguments!(5; A0 a0, A1 a1, A2 a2, A3 a3, A4 a4);
tuple_arguments!(6; A0 a0, A1 a1, A2 a2, A3 a3, A4 a4, A5 a5);
tuple_arguments!(7; A0 a0, A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6);
tuple_arguments!(8; A0 a0, A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6, A7 a7);
tuple_arguments!(9; A0 a0, A1 a1, A2 a2, A3 a3, A4 a4, A5 a5, A6 a6, A7 a7, A8 a8);

/// What an interception puts in one parameter position.
#[derive(Debug, Clone)]
pub enum FixedSlot {
    /// Pass the caller's value through.
    Caller,
    Value(Value),
    /// A fixed null: always resolved, whatever the caller passed.
    Resolve,
}

/// Fixed call arguments for one interception, set at bind time and replayed
/// on every call.
#[derive(Debug, Clone)]
pub struct CallArgumentSpec {
    parameters: Vec<TypeKey>,
    fixed: Option<Vec<FixedSlot>>,
}

impl CallArgumentSpec {
    /// No fixed arguments: callers' values pass through unchanged.
    pub fn new(parameters: Vec<TypeKey>) -> Self {
        Self { parameters, fixed: None }
    }

    pub fn for_arguments<A: ArgumentList>() -> Self {
        Self::new(A::parameter_types())
    }

    pub fn for_signature<F: crate::interceptor::signature::Signature>() -> Self {
        Self::for_arguments::<F::Arguments>()
    }

    /// Every position fixed. `None` entries of nullable parameters are
    /// resolved at call time.
    pub fn with_arguments<A: ArgumentList>(arguments: A) -> Self {
        let mut spec = Self::for_arguments::<A>();
        spec.fixed = Some(slots_from(arguments.into_slots()));
        spec
    }

    /// Replaces all fixed arguments after validating them against the
    /// declared parameter types.
    pub fn set_arguments<A: ArgumentList>(&mut self, arguments: A) -> Result<(), ArgumentError> {
        let supplied = A::parameter_types();
        if supplied.len() != self.parameters.len() {
            return Err(ArgumentError::ArityMismatch {
                expected: self.parameters.len(),
                actual: supplied.len(),
            });
        }
        for (position, (expected, actual)) in self.parameters.iter().zip(&supplied).enumerate() {
            if expected != actual {
                return Err(ArgumentError::TypeMismatch {
                    position,
                    expected: *expected,
                    actual: *actual,
                });
            }
        }
        self.fixed = Some(slots_from(arguments.into_slots()));
        Ok(())
    }

    /// Fixes a single position; others keep the caller's value.
    pub fn fix<T: Argument>(mut self, position: usize, value: T) -> Result<Self, ArgumentError> {
        let arity = self.parameters.len();
        let expected = *self
            .parameters
            .get(position)
            .ok_or(ArgumentError::PositionOutOfRange { position, arity })?;
        let actual = TypeKey::of::<T>();
        if expected != actual {
            return Err(ArgumentError::TypeMismatch { position, expected, actual });
        }
        let slot = match value.into_slot() {
            Some(v) => FixedSlot::Value(v),
            None => FixedSlot::Resolve,
        };
        self.fixed.get_or_insert_with(|| vec![FixedSlot::Caller; arity])[position] = slot;
        Ok(self)
    }

    /// Checks that this spec was built for `parameters`.
    pub fn validate(&self, parameters: &[TypeKey]) -> Result<(), ArgumentError> {
        if self.parameters.len() != parameters.len() {
            return Err(ArgumentError::ArityMismatch {
                expected: parameters.len(),
                actual: self.parameters.len(),
            });
        }
        for (position, (expected, actual)) in parameters.iter().zip(&self.parameters).enumerate() {
            if expected != actual {
                return Err(ArgumentError::TypeMismatch {
                    position,
                    expected: *expected,
                    actual: *actual,
                });
            }
        }
        Ok(())
    }

    pub fn parameter_types(&self) -> &[TypeKey] {
        &self.parameters
    }

    pub fn fixed(&self) -> Option<&[FixedSlot]> {
        self.fixed.as_deref()
    }

    pub fn has_fixed(&self) -> bool {
        self.fixed.is_some()
    }

    /// Final slots for one call: fixed values win, caller values fill the
    /// rest. `None` slots still need resolving.
    pub fn merge(&self, caller: Vec<Option<Value>>) -> Vec<Option<Value>> {
        let Some(fixed) = &self.fixed else {
            return caller;
        };
        fixed
            .iter()
            .zip(caller)
            .map(|(slot, supplied)| match slot {
                FixedSlot::Caller => supplied,
                FixedSlot::Value(v) => Some(v.clone()),
                FixedSlot::Resolve => None,
            })
            .collect()
    }
}

fn slots_from(values: Vec<Option<Value>>) -> Vec<FixedSlot> {
    values
        .into_iter()
        .map(|v| v.map_or(FixedSlot::Resolve, FixedSlot::Value))
        .collect()
}
