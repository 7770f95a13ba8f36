//! Installs and removes the entry-point jump of an [`InvocationRecord`].

pub mod remote;

use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::arch::Architecture;
use crate::code::patcher::{patch_code, read_code};
use crate::error::PatchError;
use crate::interceptor::record::{InvocationRecord, RecordLock};
use crate::types::FunctionHandle;
pub use remote::RemotePatcher;

#[derive(Clone)]
enum Backend {
    Local,
    Remote(Arc<dyn RemotePatcher>),
    Unavailable,
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Local => f.write_str("Local"),
            Backend::Remote(_) => f.write_str("Remote"),
            Backend::Unavailable => f.write_str("Unavailable"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BinaryPatcher {
    arch: Architecture,
    backend: Backend,
    verify: bool,
}

impl BinaryPatcher {
    /// Patches this process's own code. On architectures without a local
    /// path every install fails with [`PatchError::Unsupported`].
    pub fn native() -> Self {
        Self::for_architecture(*Architecture::probe())
    }

    pub fn for_architecture(arch: Architecture) -> Self {
        let backend = if arch.patches_locally() {
            Backend::Local
        } else {
            Backend::Unavailable
        };
        Self { arch, backend, verify: false }
    }

    /// Forwards every install/uninstall to `plugin`.
    pub fn remote(arch: Architecture, plugin: Arc<dyn RemotePatcher>) -> Self {
        Self { arch, backend: Backend::Remote(plugin), verify: false }
    }

    pub fn with_verification(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    pub fn architecture(&self) -> &Architecture {
        &self.arch
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.backend, Backend::Remote(_))
    }

    /// Builds a record for this patcher's architecture.
    pub fn record(
        &self,
        target: FunctionHandle,
        redirect: FunctionHandle,
    ) -> Result<InvocationRecord, PatchError> {
        InvocationRecord::new(target, redirect, &self.arch)
    }

    pub fn install(&self, record: &InvocationRecord) -> Result<(), PatchError> {
        self.install_locked(&mut record.lock())
    }

    pub fn uninstall(&self, record: &InvocationRecord) -> Result<(), PatchError> {
        self.uninstall_locked(&mut record.lock())
    }

    pub(crate) fn install_locked(&self, lock: &mut RecordLock<'_>) -> Result<(), PatchError> {
        let record = lock.record();
        let address = record.target().entry();
        if lock.is_installed() {
            return Err(PatchError::AlreadyInstalled { address });
        }

        let saved = match &self.backend {
            Backend::Local => self.install_local(record)?,
            Backend::Remote(plugin) => {
                plugin.install_remote(record.target(), record.redirect())?;
                Vec::new()
            }
            Backend::Unavailable => return Err(PatchError::Unsupported { arch: self.arch.kind() }),
        };

        lock.mark_installed(saved);
        debug!("installed {:#x} -> {:#x}", address, record.redirect().entry());
        Ok(())
    }

    pub(crate) fn uninstall_locked(&self, lock: &mut RecordLock<'_>) -> Result<(), PatchError> {
        let record = lock.record();
        let address = record.target().entry();
        if !lock.is_installed() {
            return Err(PatchError::NotInstalled { address });
        }

        match &self.backend {
            Backend::Local => {
                // SAFETY: `saved` was read from this address at install time.
                unsafe { patch_code(address, lock.saved())? };
                if self.verify && read_back(address, lock.saved().len()) != lock.saved() {
                    // The saved bytes were written; treat the entry as restored.
                    lock.mark_uninstalled();
                    return Err(PatchError::VerificationFailed { address });
                }
            }
            Backend::Remote(plugin) => plugin.uninstall_remote(record.target())?,
            Backend::Unavailable => return Err(PatchError::Unsupported { arch: self.arch.kind() }),
        }

        lock.mark_uninstalled();
        debug!("uninstalled {:#x}", address);
        Ok(())
    }

    fn install_local(&self, record: &InvocationRecord) -> Result<Vec<u8>, PatchError> {
        let address = record.target().entry();
        let jump = self.arch.encode_near_jump(address, record.redirect().entry())?;

        // SAFETY: the handle was taken from a live function pointer, so its
        // entry is mapped code at least `patch_length` bytes long.
        unsafe {
            let saved = read_code(address, record.patch_length());
            patch_code(address, &jump)?;
            if self.verify && read_back(address, jump.len()) != jump {
                // Put back whatever we can; the record stays uninstalled.
                if let Err(e) = patch_code(address, &saved) {
                    log::warn!("could not roll back failed patch at {:#x}: {}", address, e);
                }
                return Err(PatchError::VerificationFailed { address });
            }
            Ok(saved)
        }
    }
}

#[cfg(test)]
thread_local! {
    static SKEW_READ_BACK: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Reads patched bytes for verification.
fn read_back(address: usize, len: usize) -> Vec<u8> {
    // SAFETY: only called right after a successful write of `len` bytes here.
    let bytes = unsafe { read_code(address, len) };
    #[cfg(test)]
    let bytes = skewed(bytes);
    bytes
}

#[cfg(test)]
fn skewed(mut bytes: Vec<u8>) -> Vec<u8> {
    if SKEW_READ_BACK.with(|s| s.get()) {
        if let Some(b) = bytes.first_mut() {
            *b ^= 0xff;
        }
    }
    bytes
}
