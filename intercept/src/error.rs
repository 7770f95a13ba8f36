use thiserror::Error;

use crate::arch::ArchKind;
use crate::types::TypeKey;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatchError {
    #[error("interception at {address:#x} is already installed")]
    AlreadyInstalled { address: usize },

    #[error("interception at {address:#x} is not installed")]
    NotInstalled { address: usize },

    #[error("code page containing {address:#x} cannot be made writable")]
    UnwritableMemory { address: usize },

    #[error("redirect {redirect:#x} is outside the rel32 window of target {target:#x}")]
    DisplacementOutOfRange { target: usize, redirect: usize },

    #[error("patch at {address:#x} did not read back as written")]
    VerificationFailed { address: usize },

    #[error("in-process patching is not available on {arch:?}; a native plugin is required")]
    Unsupported { arch: ArchKind },

    #[error("native plugin failed: {reason}")]
    Remote { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("no binding for {ty}")]
    UnboundType { ty: TypeKey },

    #[error("{candidates} bindings for {ty}; expected exactly one")]
    AmbiguousBinding { ty: TypeKey, candidates: usize },

    #[error("resolved value is not a {expected}")]
    TypeMismatch { expected: TypeKey },

    #[error("expected {expected} arguments, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },

    #[error("factory for {ty} failed: {reason}")]
    Factory { ty: TypeKey, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InjectionError {
    #[error("cannot inject into {ty}")]
    TargetNotWritable { ty: TypeKey },

    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

/// Registry failures. These indicate a trampoline/registration mismatch and
/// are never recovered from.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no interception #{ordinal} registered for {shape}")]
    NotFound { shape: String, ordinal: usize },

    #[error("{shape} is already routed to another registry")]
    ShapeClaimed { shape: String },

    #[error("{shape} already has {limit} interceptions")]
    OrdinalsExhausted { shape: String, limit: usize },
}

/// Bind-time validation of fixed call arguments.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgumentError {
    #[error("expected {expected} arguments, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },

    #[error("argument {position}: expected {expected}, got {actual}")]
    TypeMismatch {
        position: usize,
        expected: TypeKey,
        actual: TypeKey,
    },

    #[error("argument position {position} out of range for arity {arity}")]
    PositionOutOfRange { position: usize, arity: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InterceptError {
    #[error("patch: {0}")]
    Patch(#[from] PatchError),

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("resolution: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("injection: {0}")]
    Injection(#[from] InjectionError),

    #[error("arguments: {0}")]
    Arguments(#[from] ArgumentError),
}
