use core::any::Any;
use std::fmt;
use std::sync::Arc;

use log::error;

pub mod arguments;
pub mod pipeline;
pub mod record;
pub mod registry;
pub mod signature;

use crate::config::InterceptorConfig;
use crate::error::{InterceptError, PatchError, RegistryError};
use crate::patch::BinaryPatcher;
use crate::resolve::{Injector, Resolver};
use crate::types::{FunctionHandle, ShapeKey};
use arguments::CallArgumentSpec;
use pipeline::InvocationPipeline;
use record::InvocationRecord;
use registry::{routes, Intercepted, InterceptionRegistry};
use signature::{Signature, MAX_ORDINALS};

/// Redirects compiled functions to trampolines that run them through an
/// [`InvocationPipeline`].
///
/// Dropping the interceptor (more precisely its registry) restores every
/// patched function.
#[derive(Clone)]
pub struct Interceptor {
    registry: InterceptionRegistry,
    pipeline: InvocationPipeline,
}

impl Interceptor {
    pub fn new(resolver: Arc<dyn Resolver>, injector: Arc<dyn Injector>) -> Self {
        Self::with_config(resolver, injector, InterceptorConfig::default())
    }

    pub fn with_config(resolver: Arc<dyn Resolver>, injector: Arc<dyn Injector>, config: InterceptorConfig) -> Self {
        Self::with_patcher(BinaryPatcher::native(), resolver, injector, config)
    }

    pub fn with_patcher(
        patcher: BinaryPatcher,
        resolver: Arc<dyn Resolver>,
        injector: Arc<dyn Injector>,
        config: InterceptorConfig,
    ) -> Self {
        let patcher = if config.verify_patches {
            patcher.with_verification(true)
        } else {
            patcher
        };
        let pipeline = InvocationPipeline::new(patcher.clone(), resolver, injector)
            .with_invocation_logging(config.log_invocations);
        Self {
            registry: InterceptionRegistry::new(patcher),
            pipeline,
        }
    }

    /// Patches `target` so every call runs through the pipeline with
    /// `arguments`. `O` is the owning bound type; interceptions of equal
    /// shape on the same owner get successive ordinals.
    pub fn intercept<O, F>(&self, target: F, arguments: CallArgumentSpec) -> Result<Arc<Interception<F>>, InterceptError>
    where
        O: ?Sized + 'static,
        F: Signature,
    {
        arguments.validate(&F::parameter_types())?;
        let shape = ShapeKey::of::<O, F>();
        let handle = FunctionHandle::of(target);

        self.registry.register_with(&shape, handle.entry(), |ordinal| {
            let redirect = F::redirect::<O>(ordinal).ok_or_else(|| RegistryError::OrdinalsExhausted {
                shape: shape.to_string(),
                limit: MAX_ORDINALS,
            })?;
            let record = self.registry.patcher().record(handle.clone(), FunctionHandle::of(redirect))?;
            Ok(Arc::new(Interception {
                shape: shape.clone(),
                ordinal,
                target,
                record,
                arguments,
                pipeline: self.pipeline.clone(),
            }))
        })
    }

    /// [`intercept`](Self::intercept) with every argument fixed.
    pub fn intercept_with<O, F>(&self, target: F, arguments: F::Arguments) -> Result<Arc<Interception<F>>, InterceptError>
    where
        O: ?Sized + 'static,
        F: Signature,
    {
        self.intercept::<O, F>(target, CallArgumentSpec::with_arguments(arguments))
    }

    pub fn registry(&self) -> &InterceptionRegistry {
        &self.registry
    }

    pub fn pipeline(&self) -> &InvocationPipeline {
        &self.pipeline
    }

    /// Removes every interception and restores the original code.
    pub fn clear_all(&self) -> Result<(), PatchError> {
        self.registry.clear_all()
    }
}

/// One installed interception of a function of type `F`.
pub struct Interception<F: Signature> {
    shape: ShapeKey,
    ordinal: usize,
    target: F,
    record: InvocationRecord,
    arguments: CallArgumentSpec,
    pipeline: InvocationPipeline,
}

impl<F: Signature> Interception<F> {
    /// Runs the intercepted call directly, reporting pipeline failures as
    /// errors instead of panicking.
    pub fn invoke(&self, receiver: &F::Receiver, arguments: F::Arguments) -> Result<F::Output, InterceptError> {
        self.pipeline
            .run(&self.record, self.target, &self.arguments, receiver, arguments)
    }

    /// Restores the original entry; calls bypass the interception until
    /// [`resume`](Self::resume).
    pub fn suspend(&self) -> Result<(), PatchError> {
        self.pipeline.patcher().uninstall(&self.record)
    }

    pub fn resume(&self) -> Result<(), PatchError> {
        self.pipeline.patcher().install(&self.record)
    }

    pub fn is_installed(&self) -> bool {
        self.record.is_installed()
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn shape(&self) -> &ShapeKey {
        &self.shape
    }

    pub fn target(&self) -> F {
        self.target
    }

    pub fn record(&self) -> &InvocationRecord {
        &self.record
    }

    pub fn arguments(&self) -> &CallArgumentSpec {
        &self.arguments
    }
}

impl<F: Signature> fmt::Debug for Interception<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interception")
            .field("shape", &self.shape.to_string())
            .field("ordinal", &self.ordinal)
            .field("target", &format_args!("{:#x}", self.record.target().entry()))
            .field("installed", &self.is_installed())
            .finish()
    }
}

impl<F: Signature> Intercepted for Interception<F> {
    fn record(&self) -> &InvocationRecord {
        &self.record
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Entered by every trampoline. Pipeline errors cannot be returned through
/// the original signature, so they are raised as a panic carrying the
/// [`InterceptError`].
pub(crate) fn dispatch<O, F>(ordinal: usize, receiver: &F::Receiver, arguments: F::Arguments) -> F::Output
where
    O: ?Sized + 'static,
    F: Signature,
{
    let shape = ShapeKey::of::<O, F>();
    let outcome = find::<F>(&shape, ordinal).and_then(|i| i.invoke(receiver, arguments));
    match outcome {
        Ok(output) => output,
        Err(e) => {
            error!("interception {} #{} failed: {}", shape, ordinal, e);
            std::panic::panic_any(e)
        }
    }
}

fn find<F: Signature>(shape: &ShapeKey, ordinal: usize) -> Result<Arc<Interception<F>>, InterceptError> {
    let not_found = || RegistryError::NotFound {
        shape: shape.to_string(),
        ordinal,
    };
    // The registry handle is released before the pipeline runs.
    let entry = routes::owner(shape).ok_or_else(not_found)?.lookup(shape, ordinal)?;
    entry
        .into_any()
        .downcast::<Interception<F>>()
        .map_err(|_| not_found().into())
}
