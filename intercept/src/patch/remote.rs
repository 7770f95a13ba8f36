use crate::error::PatchError;
use crate::types::FunctionHandle;

/// Out-of-process patching for hosts that cannot rewrite their own code
/// (ahead-of-time compiled runtimes, signed text segments).
///
/// Implementations must honor the same contract as local patching: after
/// `install_remote` every call to `target` lands in `redirect`, and after
/// `uninstall_remote` the original entry is restored exactly. Failures are
/// reported as [`PatchError::Remote`].
pub trait RemotePatcher: Send + Sync {
    fn install_remote(&self, target: &FunctionHandle, redirect: &FunctionHandle) -> Result<(), PatchError>;

    fn uninstall_remote(&self, target: &FunctionHandle) -> Result<(), PatchError>;
}
