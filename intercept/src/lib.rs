//! easyjection-intercept: runtime redirection of compiled functions through
//! a dependency-injection pipeline.

pub mod arch;
pub mod code;
pub mod config;
pub mod error;
pub mod interceptor;
pub mod patch;
pub mod resolve;
pub mod types;

#[cfg(test)]
mod testing;

// Re-exports for convenience (flattened imports)
pub use arch::Architecture;
pub use config::InterceptorConfig;
pub use error::{InterceptError, PatchError, RegistryError, ResolutionError};
pub use interceptor::arguments::{Argument, ArgumentList, CallArgumentSpec};
pub use interceptor::record::InvocationRecord;
pub use interceptor::registry::InterceptionRegistry;
pub use interceptor::signature::{Method, Signature};
pub use interceptor::{Interception, Interceptor};
pub use patch::{BinaryPatcher, RemotePatcher};
pub use resolve::{Injector, NoBindings, Resolver};
pub use types::{ScopedInstances, TypeKey, Value};

/// Process-global lock for tests that modify executable code.
///
/// Tests that patch functions of the test binary must hold this lock: two
/// tests restoring neighbouring functions would otherwise race on the same
/// page.
#[cfg(test)]
pub(crate) fn lock_hook_tests() -> std::sync::MutexGuard<'static, ()> {
    use std::sync::{Mutex, OnceLock};
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}
