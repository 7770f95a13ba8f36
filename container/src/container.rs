use std::sync::Arc;

use anyhow::{Context, Result};
use log::{info, warn};

use easyjection_intercept::{
    BinaryPatcher, CallArgumentSpec, Interception, Interceptor, InterceptorConfig, ResolutionError, Signature,
};

use crate::bindings::{Bindings, Scope};

/// Owns a [`Bindings`] table and an [`Interceptor`] resolving through it.
///
/// Every interception made through the container is removed when it is
/// disposed or dropped.
pub struct Container {
    bindings: Arc<Bindings>,
    interceptor: Interceptor,
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl Container {
    /// A container for the native architecture, configured from the
    /// environment.
    pub fn new() -> Self {
        Self::with_config(InterceptorConfig::from_env())
    }

    pub fn with_config(config: InterceptorConfig) -> Self {
        Self::with_patcher(BinaryPatcher::native(), config)
    }

    pub fn with_patcher(patcher: BinaryPatcher, config: InterceptorConfig) -> Self {
        let bindings = Arc::new(Bindings::new());
        let interceptor = Interceptor::with_patcher(patcher, bindings.clone(), bindings.clone(), config);
        Self { bindings, interceptor }
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    pub fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    pub fn bind_instance<T: Send + Sync + 'static>(&self, instance: Arc<T>) -> &Self {
        self.bindings.bind_instance(instance);
        self
    }

    pub fn bind_value<T: Send + Sync + 'static>(&self, value: T) -> &Self {
        self.bindings.bind_value(value);
        self
    }

    pub fn bind_factory<T, F>(&self, factory: F) -> &Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Scope<'_>) -> Result<T> + Send + Sync + 'static,
    {
        self.bindings.bind_factory(factory);
        self
    }

    pub fn on_inject<T, F>(&self, routine: F) -> &Self
    where
        T: Send + Sync + 'static,
        F: Fn(&T, &Scope<'_>) -> std::result::Result<(), ResolutionError> + Send + Sync + 'static,
    {
        self.bindings.on_inject(routine);
        self
    }

    pub fn resolve<T: Send + Sync + 'static>(&self) -> std::result::Result<Arc<T>, ResolutionError> {
        self.bindings.resolve()
    }

    /// Intercepts `target` as a member of `O`.
    pub fn intercept<O, F>(&self, target: F, arguments: CallArgumentSpec) -> Result<Arc<Interception<F>>>
    where
        O: ?Sized + 'static,
        F: Signature,
    {
        let interception = self
            .interceptor
            .intercept::<O, F>(target, arguments)
            .with_context(|| format!("Failed to intercept {}", std::any::type_name::<F>()))?;
        info!(
            "Intercepted {} #{} at {:#x}",
            interception.shape(),
            interception.ordinal(),
            interception.record().target().entry()
        );
        Ok(interception)
    }

    /// [`intercept`](Self::intercept) with every argument fixed.
    pub fn intercept_with<O, F>(&self, target: F, arguments: F::Arguments) -> Result<Arc<Interception<F>>>
    where
        O: ?Sized + 'static,
        F: Signature,
    {
        self.intercept::<O, F>(target, CallArgumentSpec::with_arguments(arguments))
    }

    /// Removes every interception and restores the original code. The
    /// container stays usable.
    pub fn dispose(&self) -> Result<()> {
        self.interceptor
            .clear_all()
            .context("Failed to restore intercepted functions")
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!("{:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use easyjection_intercept::arch::{Architecture, PointerWidth};
    use easyjection_intercept::types::FunctionHandle;
    use easyjection_intercept::{PatchError, RemotePatcher};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Plugin {
        installed: Mutex<Vec<usize>>,
    }

    impl RemotePatcher for Plugin {
        fn install_remote(&self, target: &FunctionHandle, _redirect: &FunctionHandle) -> std::result::Result<(), PatchError> {
            self.installed.lock().unwrap().push(target.entry());
            Ok(())
        }

        fn uninstall_remote(&self, target: &FunctionHandle) -> std::result::Result<(), PatchError> {
            self.installed.lock().unwrap().retain(|e| *e != target.entry());
            Ok(())
        }
    }

    struct Disposed;
    struct Dropped;
    struct Resolved;
    struct Duplicated;

    fn triple(x: u32) -> u32 {
        x * 3
    }

    fn quadruple(x: u32) -> u32 {
        x * 4
    }

    fn quintuple(x: u32) -> u32 {
        x * 5
    }

    fn container(plugin: &Arc<Plugin>) -> Container {
        let patcher = BinaryPatcher::remote(Architecture::foreign(PointerWidth::Bits64), plugin.clone());
        Container::with_patcher(patcher, InterceptorConfig::default())
    }

    #[test]
    fn dispose_removes_every_interception() {
        let plugin = Arc::new(Plugin::default());
        let container = container(&plugin);
        let interception = container.intercept_with::<Disposed, fn(u32) -> u32>(triple, (4,)).unwrap();
        assert_eq!(plugin.installed.lock().unwrap().len(), 1);

        container.dispose().unwrap();
        assert!(plugin.installed.lock().unwrap().is_empty());
        assert!(!interception.is_installed());
    }

    #[test]
    fn drop_disposes() {
        let plugin = Arc::new(Plugin::default());
        {
            let container = container(&plugin);
            container.intercept_with::<Dropped, fn(u32) -> u32>(quadruple, (4,)).unwrap();
        }
        assert!(plugin.installed.lock().unwrap().is_empty());
    }

    #[test]
    fn invoke_resolves_through_bindings() {
        let plugin = Arc::new(Plugin::default());
        let container = container(&plugin);
        container.bind_value(11_u32);
        let spec = CallArgumentSpec::for_signature::<fn(Option<Arc<u32>>) -> u32>();
        fn read(value: Option<Arc<u32>>) -> u32 {
            value.map_or(0, |v| *v)
        }
        let interception = container.intercept::<Resolved, fn(Option<Arc<u32>>) -> u32>(read, spec).unwrap();
        assert_eq!(interception.invoke(&(), (None,)).unwrap(), 11);
        assert_eq!(interception.invoke(&(), (Some(Arc::new(2)),)).unwrap(), 2);
    }

    #[test]
    fn failed_interception_carries_context() {
        let plugin = Arc::new(Plugin::default());
        let container = container(&plugin);
        container.intercept_with::<Duplicated, fn(u32) -> u32>(quintuple, (1,)).unwrap();
        let err = container
            .intercept_with::<Duplicated, fn(u32) -> u32>(quintuple, (2,))
            .unwrap_err();
        assert!(err.to_string().starts_with("Failed to intercept"));
        assert!(matches!(
            err.downcast_ref::<easyjection_intercept::InterceptError>(),
            Some(easyjection_intercept::InterceptError::Patch(PatchError::AlreadyInstalled { .. }))
        ));
    }
}
