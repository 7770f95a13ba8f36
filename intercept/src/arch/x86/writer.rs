//! Minimal x86/x86_64 instruction emitter.
//!
//! Only the near jump the patcher writes, plus the two instructions the
//! code-page tests assemble.

/// Length of `E9 rel32`.
pub const NEAR_JUMP_LEN: usize = 5;

/// Emits into a caller-owned byte buffer that will live at address `pc`.
#[derive(Debug)]
pub struct X86Writer<'a> {
    buf: &'a mut [u8],
    offset: usize,
    pc: u64,
}

impl<'a> X86Writer<'a> {
    pub fn new(buf: &'a mut [u8], pc: u64) -> Self {
        Self { buf, offset: 0, pc }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    fn emit(&mut self, byte: u8) {
        assert!(self.offset < self.buf.len(), "x86 writer overflow");
        self.buf[self.offset] = byte;
        self.offset += 1;
        self.pc = self.pc.wrapping_add(1);
    }

    fn emit_u32_le(&mut self, val: u32) {
        for b in val.to_le_bytes() {
            self.emit(b);
        }
    }

    /// `jmp rel32` (E9). The displacement is relative to the end of the
    /// 5-byte instruction and must fit in an `i32`.
    pub fn put_jmp_near(&mut self, target: u64) {
        let rel = near_displacement(self.pc, target)
            .unwrap_or_else(|| panic!("jmp target {target:#x} out of rel32 range from {:#x}", self.pc));
        self.emit(0xE9);
        self.emit_u32_le(rel as u32);
    }

    /// `mov eax, imm32` (B8); zero-extends into rax on x86_64.
    pub fn put_mov_eax_imm32(&mut self, imm: u32) {
        self.emit(0xB8);
        self.emit_u32_le(imm);
    }

    pub fn put_ret(&mut self) {
        self.emit(0xC3);
    }
}

/// `target - (pc + 5)` if it fits a signed 32-bit displacement.
pub fn near_displacement(pc: u64, target: u64) -> Option<i32> {
    let next = (pc as i128) + NEAR_JUMP_LEN as i128;
    i32::try_from(target as i128 - next).ok()
}
