//! A minimal binding table: one provider per type, resolved on demand.

use core::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use log::trace;

use easyjection_intercept::error::InjectionError;
use easyjection_intercept::resolve::resolve_slots;
use easyjection_intercept::{Injector, ResolutionError, Resolver, ScopedInstances, TypeKey, Value};

type Factory = Arc<dyn Fn(&Scope<'_>) -> anyhow::Result<Value> + Send + Sync>;
type Routine = Arc<dyn Fn(&dyn Any, &Scope<'_>) -> Result<(), InjectionError> + Send + Sync>;

#[derive(Clone)]
enum Provider {
    Instance(Value),
    Factory(Factory),
}

/// What factories and injection routines see: the bindings plus the
/// instances scoped to the current call.
pub struct Scope<'a> {
    bindings: &'a Bindings,
    scoped: &'a ScopedInstances,
}

impl Scope<'_> {
    pub fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ResolutionError> {
        self.bindings.resolve_in(self.scoped)
    }

    pub fn scoped(&self) -> &ScopedInstances {
        self.scoped
    }
}

/// Type bindings and injection routines.
///
/// Binding a type twice is allowed, but resolving it afterwards fails with
/// [`ResolutionError::AmbiguousBinding`].
#[derive(Default)]
pub struct Bindings {
    providers: RwLock<HashMap<TypeKey, Vec<Provider>>>,
    routines: RwLock<HashMap<TypeKey, Vec<Routine>>>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds a shared instance; every resolution of `T` returns this `Arc`.
    pub fn bind_instance<T: Send + Sync + 'static>(&self, instance: Arc<T>) {
        self.add_provider(TypeKey::of::<T>(), Provider::Instance(instance as Value));
    }

    pub fn bind_value<T: Send + Sync + 'static>(&self, value: T) {
        self.bind_instance(Arc::new(value));
    }

    /// Binds `T` to a factory called on every resolution.
    pub fn bind_factory<T, F>(&self, factory: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&Scope<'_>) -> anyhow::Result<T> + Send + Sync + 'static,
    {
        let factory: Factory = Arc::new(move |scope: &Scope<'_>| Ok(Arc::new(factory(scope)?) as Value));
        self.add_provider(TypeKey::of::<T>(), Provider::Factory(factory));
    }

    /// Registers a routine run whenever a `T`, or an `Arc<T>`, is injected.
    pub fn on_inject<T, F>(&self, routine: F)
    where
        T: Send + Sync + 'static,
        F: Fn(&T, &Scope<'_>) -> Result<(), ResolutionError> + Send + Sync + 'static,
    {
        let routine = Arc::new(routine);
        let by_value = routine.clone();
        let plain: Routine = Arc::new(move |target: &dyn Any, scope: &Scope<'_>| {
            let target = target
                .downcast_ref::<T>()
                .ok_or(InjectionError::TargetNotWritable { ty: TypeKey::of::<T>() })?;
            Ok(by_value(target, scope)?)
        });
        let shared: Routine = Arc::new(move |target: &dyn Any, scope: &Scope<'_>| {
            let target = target
                .downcast_ref::<Arc<T>>()
                .ok_or(InjectionError::TargetNotWritable { ty: TypeKey::of::<Arc<T>>() })?;
            Ok(routine(target, scope)?)
        });

        let mut routines = self.routines.write().unwrap_or_else(PoisonError::into_inner);
        routines.entry(TypeKey::of::<T>()).or_default().push(plain);
        routines.entry(TypeKey::of::<Arc<T>>()).or_default().push(shared);
    }

    pub fn resolve<T: Send + Sync + 'static>(&self) -> Result<Arc<T>, ResolutionError> {
        self.resolve_in(&ScopedInstances::new())
    }

    /// Resolves `T`, preferring an instance in `scoped` over any binding.
    pub fn resolve_in<T: Send + Sync + 'static>(&self, scoped: &ScopedInstances) -> Result<Arc<T>, ResolutionError> {
        self.resolve_type(TypeKey::of::<T>(), scoped)?
            .downcast::<T>()
            .map_err(|_| ResolutionError::TypeMismatch { expected: TypeKey::of::<T>() })
    }

    pub fn is_bound(&self, ty: TypeKey) -> bool {
        self.read_providers().get(&ty).is_some_and(|p| !p.is_empty())
    }

    fn resolve_type(&self, ty: TypeKey, scoped: &ScopedInstances) -> Result<Value, ResolutionError> {
        if let Some(value) = scoped.get(&ty) {
            trace!("resolved {} from scope", ty);
            return Ok(value.clone());
        }

        // Cloned out so factories can resolve their own dependencies.
        let provider = match self.read_providers().get(&ty).map(Vec::as_slice) {
            None | Some([]) => return Err(ResolutionError::UnboundType { ty }),
            Some([provider]) => provider.clone(),
            Some(many) => {
                return Err(ResolutionError::AmbiguousBinding {
                    ty,
                    candidates: many.len(),
                })
            }
        };

        match provider {
            Provider::Instance(value) => Ok(value),
            Provider::Factory(factory) => {
                let scope = Scope { bindings: self, scoped };
                let value = factory(&scope).map_err(|e| ResolutionError::Factory {
                    ty,
                    reason: format!("{e:#}"),
                })?;
                trace!("built {} from factory", ty);
                Ok(value)
            }
        }
    }

    fn add_provider(&self, ty: TypeKey, provider: Provider) {
        let mut providers = self.providers.write().unwrap_or_else(PoisonError::into_inner);
        providers.entry(ty).or_default().push(provider);
    }

    fn read_providers(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TypeKey, Vec<Provider>>> {
        self.providers.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Resolver for Bindings {
    fn resolve(
        &self,
        slots: Vec<Option<Value>>,
        declared: &[TypeKey],
        scoped: &ScopedInstances,
    ) -> Result<Vec<Value>, ResolutionError> {
        resolve_slots(slots, declared, |ty| self.resolve_type(*ty, scoped))
    }
}

impl Injector for Bindings {
    fn inject(&self, target: &dyn Any, ty: TypeKey, scoped: &ScopedInstances) -> Result<(), InjectionError> {
        let routines = match self
            .routines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&ty)
        {
            Some(routines) => routines.clone(),
            None => return Ok(()),
        };

        let scope = Scope { bindings: self, scoped };
        for routine in &routines {
            routine(target, &scope)?;
        }
        trace!("injected {} routine(s) into {}", routines.len(), ty);
        Ok(())
    }
}
