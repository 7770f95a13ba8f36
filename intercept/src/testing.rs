//! In-crate test doubles for the resolver, injector and native plugin.

use core::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{InjectionError, PatchError, ResolutionError};
use crate::patch::RemotePatcher;
use crate::resolve::{resolve_slots, Injector, Resolver};
use crate::types::{FunctionHandle, ScopedInstances, TypeKey, Value};

type Hook = Box<dyn Fn(&dyn Any) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Noted {
    Value(String),
    Type(TypeKey),
}

/// One value per type plus per-type injection hooks, recording every call.
#[derive(Default)]
pub(crate) struct MapBindings {
    values: Mutex<HashMap<TypeKey, Value>>,
    hooks: Mutex<Vec<Hook>>,
    resolved: Mutex<Vec<TypeKey>>,
    injected: Mutex<Vec<Noted>>,
}

impl MapBindings {
    pub(crate) fn bind<T: Send + Sync + 'static>(&self, value: T) {
        self.values.lock().unwrap().insert(TypeKey::of::<T>(), Arc::new(value));
    }

    pub(crate) fn on_inject<T: 'static>(&self, hook: impl Fn(&T) + Send + Sync + 'static) {
        self.hooks.lock().unwrap().push(Box::new(move |target| {
            if let Some(t) = target.downcast_ref::<T>() {
                hook(t);
            }
        }));
    }

    pub(crate) fn resolved(&self) -> Vec<TypeKey> {
        self.resolved.lock().unwrap().clone()
    }

    pub(crate) fn injected(&self) -> Vec<Noted> {
        self.injected.lock().unwrap().clone()
    }
}

impl Resolver for MapBindings {
    fn resolve(
        &self,
        slots: Vec<Option<Value>>,
        declared: &[TypeKey],
        scoped: &ScopedInstances,
    ) -> Result<Vec<Value>, ResolutionError> {
        resolve_slots(slots, declared, |ty| {
            self.resolved.lock().unwrap().push(*ty);
            if let Some(v) = scoped.get(ty) {
                return Ok(v.clone());
            }
            let values = self.values.lock().unwrap();
            values.get(ty).cloned().ok_or(ResolutionError::UnboundType { ty: *ty })
        })
    }
}

impl Injector for MapBindings {
    fn inject(&self, target: &dyn Any, ty: TypeKey, _scoped: &ScopedInstances) -> Result<(), InjectionError> {
        let noted = match target.downcast_ref::<String>() {
            Some(s) => Noted::Value(s.clone()),
            None => Noted::Type(ty),
        };
        self.injected.lock().unwrap().push(noted);
        for hook in self.hooks.lock().unwrap().iter() {
            hook(target);
        }
        Ok(())
    }
}

/// Remote patcher that only logs, optionally failing the next install.
#[derive(Default)]
pub(crate) struct ScriptedPlugin {
    log: Mutex<Vec<&'static str>>,
    fail_install: AtomicBool,
}

impl ScriptedPlugin {
    pub(crate) fn log(&self) -> Vec<&'static str> {
        self.log.lock().unwrap().clone()
    }

    pub(crate) fn fail_next_install(&self) {
        self.fail_install.store(true, Ordering::SeqCst);
    }
}

impl RemotePatcher for ScriptedPlugin {
    fn install_remote(&self, _target: &FunctionHandle, _redirect: &FunctionHandle) -> Result<(), PatchError> {
        if self.fail_install.swap(false, Ordering::SeqCst) {
            return Err(PatchError::Remote { reason: "scripted failure".into() });
        }
        self.log.lock().unwrap().push("install");
        Ok(())
    }

    fn uninstall_remote(&self, _target: &FunctionHandle) -> Result<(), PatchError> {
        self.log.lock().unwrap().push("uninstall");
        Ok(())
    }
}
