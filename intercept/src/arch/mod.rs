//! Native architecture probe.
//!
//! Determines pointer width and instruction family once per process; patch
//! length and jump encoding derive from it.

pub mod x86;

use std::sync::OnceLock;

use crate::error::PatchError;
use x86::writer::{near_displacement, X86Writer, NEAR_JUMP_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerWidth {
    Bits32,
    Bits64,
}

impl PointerWidth {
    pub const fn bytes(self) -> usize {
        match self {
            PointerWidth::Bits32 => 4,
            PointerWidth::Bits64 => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchKind {
    X86,
    X86_64,
    /// Anything without a local patch path (aarch64, wasm, ...).
    Foreign,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Architecture {
    kind: ArchKind,
    width: PointerWidth,
}

impl Architecture {
    /// The architecture of the running process, computed on first use.
    pub fn probe() -> &'static Architecture {
        static NATIVE: OnceLock<Architecture> = OnceLock::new();
        NATIVE.get_or_init(|| {
            let arch = Self::detect();
            log::debug!("architecture probe: {:?} ({}-byte pointers)", arch.kind, arch.width.bytes());
            arch
        })
    }

    fn detect() -> Self {
        if cfg!(target_arch = "x86_64") {
            Self::x86_64()
        } else if cfg!(target_arch = "x86") {
            Self::x86()
        } else {
            Self::foreign(PointerWidth::from_native())
        }
    }

    pub const fn x86_64() -> Self {
        Self { kind: ArchKind::X86_64, width: PointerWidth::Bits64 }
    }

    pub const fn x86() -> Self {
        Self { kind: ArchKind::X86, width: PointerWidth::Bits32 }
    }

    pub const fn foreign(width: PointerWidth) -> Self {
        Self { kind: ArchKind::Foreign, width }
    }

    pub fn kind(&self) -> ArchKind {
        self.kind
    }

    pub fn pointer_width(&self) -> PointerWidth {
        self.width
    }

    /// Bytes saved from the target entry before patching.
    ///
    /// Room for the worst-case absolute fallback (`mov rax, imm64; jmp rax`
    /// on 64-bit, `mov eax, imm32; jmp eax` on 32-bit), although only the
    /// 5-byte near jump is ever written.
    pub const fn patch_length(&self) -> usize {
        match self.width {
            PointerWidth::Bits64 => 13,
            PointerWidth::Bits32 => 7,
        }
    }

    /// Whether this process can rewrite its own code for this architecture.
    pub fn patches_locally(&self) -> bool {
        self.kind != ArchKind::Foreign
    }

    /// Checks that `redirect` is reachable from a near jump at `target`.
    pub fn check_reach(&self, target: usize, redirect: usize) -> Result<i32, PatchError> {
        near_displacement(target as u64, redirect as u64)
            .ok_or(PatchError::DisplacementOutOfRange { target, redirect })
    }

    /// The 5-byte `E9 rel32` that redirects `target` to `redirect`.
    pub fn encode_near_jump(
        &self,
        target: usize,
        redirect: usize,
    ) -> Result<[u8; NEAR_JUMP_LEN], PatchError> {
        if !self.patches_locally() {
            return Err(PatchError::Unsupported { arch: self.kind });
        }
        self.check_reach(target, redirect)?;
        let mut code = [0u8; NEAR_JUMP_LEN];
        X86Writer::new(&mut code, target as u64).put_jmp_near(redirect as u64);
        Ok(code)
    }
}

impl PointerWidth {
    fn from_native() -> Self {
        if cfg!(target_pointer_width = "64") {
            PointerWidth::Bits64
        } else {
            PointerWidth::Bits32
        }
    }
}
