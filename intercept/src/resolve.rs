//! Interfaces to the dependency container the pipeline calls into.

use core::any::Any;

use crate::error::{InjectionError, ResolutionError};
use crate::types::{ScopedInstances, TypeKey, Value};

/// Fills unset argument slots.
pub trait Resolver: Send + Sync {
    /// Returns one value per slot. Set slots pass through; each `None` is
    /// resolved for `declared[i]`, consulting `scoped` before any binding.
    fn resolve(
        &self,
        slots: Vec<Option<Value>>,
        declared: &[TypeKey],
        scoped: &ScopedInstances,
    ) -> Result<Vec<Value>, ResolutionError>;
}

/// Populates dependencies of an already constructed value.
///
/// `target` has concrete type `ty`. Must tolerate being called more than once
/// for the same value.
pub trait Injector: Send + Sync {
    fn inject(&self, target: &dyn Any, ty: TypeKey, scoped: &ScopedInstances) -> Result<(), InjectionError>;
}

/// Resolves from scoped instances only and injects nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBindings;

impl Resolver for NoBindings {
    fn resolve(
        &self,
        slots: Vec<Option<Value>>,
        declared: &[TypeKey],
        scoped: &ScopedInstances,
    ) -> Result<Vec<Value>, ResolutionError> {
        resolve_slots(slots, declared, |ty| {
            scoped.get(ty).cloned().ok_or(ResolutionError::UnboundType { ty: *ty })
        })
    }
}

impl Injector for NoBindings {
    fn inject(&self, _target: &dyn Any, _ty: TypeKey, _scoped: &ScopedInstances) -> Result<(), InjectionError> {
        Ok(())
    }
}

/// Slot-by-slot resolution shared by resolver implementations: arity check,
/// pass set slots through, call `lookup` for the rest and type-check it.
pub fn resolve_slots(
    slots: Vec<Option<Value>>,
    declared: &[TypeKey],
    mut lookup: impl FnMut(&TypeKey) -> Result<Value, ResolutionError>,
) -> Result<Vec<Value>, ResolutionError> {
    if slots.len() != declared.len() {
        return Err(ResolutionError::ArityMismatch {
            expected: declared.len(),
            actual: slots.len(),
        });
    }
    slots
        .into_iter()
        .zip(declared)
        .map(|(slot, ty)| match slot {
            Some(v) => Ok(v),
            None => {
                let v = lookup(ty)?;
                if ty.matches(&v) {
                    Ok(v)
                } else {
                    Err(ResolutionError::TypeMismatch { expected: *ty })
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct Engine;

    #[test]
    fn scoped_instances_fill_unset_slots() {
        let engine: Value = Arc::new(Engine);
        let mut scoped = ScopedInstances::new();
        scoped.insert(TypeKey::of::<Engine>(), engine.clone());

        let out = NoBindings
            .resolve(
                vec![Some(Arc::new(3_i32) as Value), None],
                &[TypeKey::of::<i32>(), TypeKey::of::<Engine>()],
                &scoped,
            )
            .unwrap();
        assert!(Arc::ptr_eq(&out[1], &engine));
    }

    #[test]
    fn missing_binding_is_reported() {
        let err = NoBindings
            .resolve(vec![None], &[TypeKey::of::<Engine>()], &ScopedInstances::new())
            .unwrap_err();
        assert_eq!(err, ResolutionError::UnboundType { ty: TypeKey::of::<Engine>() });
    }

    #[test]
    fn lookup_result_is_type_checked() {
        let err = resolve_slots(vec![None], &[TypeKey::of::<Engine>()], |_| Ok(Arc::new(1_u8) as Value))
            .unwrap_err();
        assert_eq!(err, ResolutionError::TypeMismatch { expected: TypeKey::of::<Engine>() });
    }

    #[test]
    fn arity_mismatch_is_reported() {
        let err = resolve_slots(vec![None, None], &[TypeKey::of::<Engine>()], |_| unreachable!())
            .unwrap_err();
        assert_eq!(err, ResolutionError::ArityMismatch { expected: 1, actual: 2 });
    }
}
