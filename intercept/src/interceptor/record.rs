use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::arch::Architecture;
use crate::error::PatchError;
use crate::types::FunctionHandle;

/// Per-interception patch state: the original function, its redirect, and
/// the bytes the redirect overwrote.
///
/// `installed` and the saved bytes form one critical section guarded by the
/// record's own lock; nothing else serializes access to a record.
#[derive(Debug)]
pub struct InvocationRecord {
    target: FunctionHandle,
    redirect: FunctionHandle,
    patch_length: usize,
    state: Mutex<PatchState>,
    // Lock-free mirror of `state.installed` for observers.
    installed: AtomicBool,
}

#[derive(Debug, Default)]
pub(crate) struct PatchState {
    installed: bool,
    saved: Vec<u8>,
}

impl InvocationRecord {
    /// Fails if `arch` patches locally and `redirect` is outside the near-jump
    /// window of `target`.
    pub fn new(
        target: FunctionHandle,
        redirect: FunctionHandle,
        arch: &Architecture,
    ) -> Result<Self, PatchError> {
        if arch.patches_locally() {
            arch.check_reach(target.entry(), redirect.entry())?;
        }
        Ok(Self {
            target,
            redirect,
            patch_length: arch.patch_length(),
            state: Mutex::new(PatchState::default()),
            installed: AtomicBool::new(false),
        })
    }

    pub fn target(&self) -> &FunctionHandle {
        &self.target
    }

    pub fn redirect(&self) -> &FunctionHandle {
        &self.redirect
    }

    pub fn patch_length(&self) -> usize {
        self.patch_length
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Bytes captured at the last install; empty before the first install
    /// and for remotely patched records.
    pub fn saved_bytes(&self) -> Vec<u8> {
        self.lock().state.saved.clone()
    }

    /// Takes the record's lock. A panic while the lock was held does not
    /// wedge the record.
    pub(crate) fn lock(&self) -> RecordLock<'_> {
        RecordLock {
            record: self,
            state: self.state.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// Exclusive access to one record's patch state.
pub(crate) struct RecordLock<'a> {
    record: &'a InvocationRecord,
    state: MutexGuard<'a, PatchState>,
}

impl<'a> RecordLock<'a> {
    pub(crate) fn record(&self) -> &'a InvocationRecord {
        self.record
    }

    pub(crate) fn is_installed(&self) -> bool {
        self.state.installed
    }

    pub(crate) fn saved(&self) -> &[u8] {
        &self.state.saved
    }

    pub(crate) fn mark_installed(&mut self, saved: Vec<u8>) {
        self.state.saved = saved;
        self.state.installed = true;
        self.record.installed.store(true, Ordering::Release);
    }

    pub(crate) fn mark_uninstalled(&mut self) {
        self.state.installed = false;
        self.record.installed.store(false, Ordering::Release);
    }
}
