use core::any::Any;
use std::fmt;
use std::sync::Arc;

use log::{log, warn, Level};

use super::arguments::{ArgumentList, CallArgumentSpec};
use super::record::{InvocationRecord, RecordLock};
use super::signature::{Receiver, Signature};
use crate::error::{InterceptError, PatchError};
use crate::patch::BinaryPatcher;
use crate::resolve::{Injector, Resolver};
use crate::types::{ScopedInstances, TypeKey};

/// Runs one interception event: suspend the patch, resolve arguments, call
/// the original, inject into the result, resume the patch.
#[derive(Clone)]
pub struct InvocationPipeline {
    patcher: BinaryPatcher,
    resolver: Arc<dyn Resolver>,
    injector: Arc<dyn Injector>,
    level: Level,
}

impl fmt::Debug for InvocationPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationPipeline")
            .field("patcher", &self.patcher)
            .field("level", &self.level)
            .finish_non_exhaustive()
    }
}

impl InvocationPipeline {
    pub fn new(patcher: BinaryPatcher, resolver: Arc<dyn Resolver>, injector: Arc<dyn Injector>) -> Self {
        Self {
            patcher,
            resolver,
            injector,
            level: Level::Trace,
        }
    }

    /// Log pipeline transitions at `debug` instead of `trace`.
    pub fn with_invocation_logging(mut self, enabled: bool) -> Self {
        self.level = if enabled { Level::Debug } else { Level::Trace };
        self
    }

    pub fn patcher(&self) -> &BinaryPatcher {
        &self.patcher
    }

    /// Calls `target` on behalf of an intercepted call.
    ///
    /// Holds `record`'s lock for the whole event, so concurrent callers of the
    /// same interception queue up. The patch is reinstalled on every exit
    /// path, including a panic in `target`; resolution and injection errors
    /// are returned only after that.
    pub fn run<F: Signature>(
        &self,
        record: &InvocationRecord,
        target: F,
        arguments: &CallArgumentSpec,
        receiver: &F::Receiver,
        caller: F::Arguments,
    ) -> Result<F::Output, InterceptError> {
        let address = record.target().entry();
        let mut lock = record.lock();
        self.patcher.uninstall_locked(&mut lock)?;
        log!(self.level, "suspended {:#x}", address);

        let resume = Resume {
            patcher: &self.patcher,
            lock,
            armed: true,
        };
        let outcome = self.invoke(target, arguments, receiver, caller);
        let resumed = resume.finish();

        match (outcome, resumed) {
            (Ok(output), Ok(())) => {
                log!(self.level, "resumed {:#x}", address);
                Ok(output)
            }
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(resume_err)) => {
                warn!("{:#x} stays suspended after failed call ({}): {}", address, e, resume_err);
                Err(e)
            }
        }
    }

    fn invoke<F: Signature>(
        &self,
        target: F,
        arguments: &CallArgumentSpec,
        receiver: &F::Receiver,
        caller: F::Arguments,
    ) -> Result<F::Output, InterceptError> {
        let mut scoped = ScopedInstances::new();
        if let Some((ty, value)) = receiver.scoped() {
            scoped.insert(ty, value);
        }

        let slots = arguments.merge(caller.into_slots());
        let values = if slots.iter().any(Option::is_none) {
            let declared = <F::Arguments as ArgumentList>::declared_types();
            self.resolver.resolve(slots, &declared, &scoped)?
        } else {
            slots.into_iter().flatten().collect()
        };
        let resolved = <F::Arguments as ArgumentList>::from_values(values)?;

        log!(self.level, "calling original {:#x}", target.entry());
        let output = target.call(receiver, resolved);

        let output_type = TypeKey::of::<F::Output>();
        let inject_into = if output_type.is_unit() {
            receiver.injection_target()
        } else {
            Some((&output as &dyn Any, output_type))
        };
        if let Some((value, ty)) = inject_into {
            self.injector.inject(value, ty, &scoped)?;
        }
        Ok(output)
    }
}

/// Reinstalls the suspended patch when dropped, unless [`finish`](Self::finish)
/// already did.
struct Resume<'p, 'r> {
    patcher: &'p BinaryPatcher,
    lock: RecordLock<'r>,
    armed: bool,
}

impl Resume<'_, '_> {
    fn finish(mut self) -> Result<(), PatchError> {
        self.armed = false;
        self.patcher.install_locked(&mut self.lock)
    }
}

impl Drop for Resume<'_, '_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let address = self.lock.record().target().entry();
        match self.patcher.install_locked(&mut self.lock) {
            Ok(()) => log::debug!("resumed {:#x} while unwinding", address),
            Err(e) => warn!("could not resume {:#x} while unwinding: {}", address, e),
        }
    }
}
