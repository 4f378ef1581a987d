//! Minimal x86-64 encoder for the hammer-loop code generator.
//!
//! The emitted instruction mix is fixed and small, so instead of pulling in
//! a full assembler the encoder provides one method per needed instruction
//! plus forward-reference label binding with rel32 patching. All memory
//! operands go through `rax`; that register contract is part of the
//! emitted code's design, not a limitation worth generalizing away.

use thiserror::Error;

/// Errors finalizing an instruction stream.
#[derive(Debug, Error)]
pub enum AsmError {
    /// A label was referenced but never bound.
    #[error("label {0} was never bound")]
    UnboundLabel(usize),
    /// A jump target is further away than rel32 can express.
    #[error("jump displacement out of range at offset {0}")]
    DisplacementOverflow(usize),
}

/// A forward-referenceable position in the instruction stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Incremental x86-64 instruction encoder.
#[derive(Default)]
pub struct Assembler {
    code: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, Label)>,
}

impl Assembler {
    /// Creates an empty instruction stream.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates an unbound label.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the current position.
    ///
    /// # Panics
    ///
    /// Panics if the label is already bound; binding twice is a codegen bug.
    pub fn bind(&mut self, label: Label) {
        assert!(
            self.labels[label.0].is_none(),
            "label {} bound twice",
            label.0
        );
        self.labels[label.0] = Some(self.code.len());
    }

    fn emit(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn emit_rel32(&mut self, opcode: &[u8], target: Label) {
        self.emit(opcode);
        self.fixups.push((self.code.len(), target));
        self.emit(&[0, 0, 0, 0]);
    }

    /// `mov rax, imm64`
    pub fn mov_rax_imm64(&mut self, imm: u64) {
        self.emit(&[0x48, 0xB8]);
        self.emit(&imm.to_le_bytes());
    }

    /// `mov rsi, imm64`
    pub fn mov_rsi_imm64(&mut self, imm: u64) {
        self.emit(&[0x48, 0xBE]);
        self.emit(&imm.to_le_bytes());
    }

    /// `mov rbx, [rax]` - the hammer access load
    pub fn load_rbx_from_rax(&mut self) {
        self.emit(&[0x48, 0x8B, 0x18]);
    }

    /// `mov rcx, [rax]` - sync probe load
    pub fn load_rcx_from_rax(&mut self) {
        self.emit(&[0x48, 0x8B, 0x08]);
    }

    /// `mov rax, [rax]` - counted sync probe load
    pub fn load_rax_from_rax(&mut self) {
        self.emit(&[0x48, 0x8B, 0x00]);
    }

    /// `clflushopt [rax]`
    pub fn clflushopt_rax(&mut self) {
        self.emit(&[0x66, 0x0F, 0xAE, 0x38]);
    }

    /// `mfence`
    pub fn mfence(&mut self) {
        self.emit(&[0x0F, 0xAE, 0xF0]);
    }

    /// `lfence`
    pub fn lfence(&mut self) {
        self.emit(&[0x0F, 0xAE, 0xE8]);
    }

    /// `rdtscp` - timestamp into edx:eax, clobbers ecx
    pub fn rdtscp(&mut self) {
        self.emit(&[0x0F, 0x01, 0xF9]);
    }

    /// `mov ebx, eax`
    pub fn mov_ebx_eax(&mut self) {
        self.emit(&[0x89, 0xC3]);
    }

    /// `mov eax, edx`
    pub fn mov_eax_edx(&mut self) {
        self.emit(&[0x89, 0xD0]);
    }

    /// `sub eax, ebx`
    pub fn sub_eax_ebx(&mut self) {
        self.emit(&[0x29, 0xD8]);
    }

    /// `cmp eax, imm32`
    pub fn cmp_eax_imm32(&mut self, imm: u32) {
        self.emit(&[0x3D]);
        self.emit(&imm.to_le_bytes());
    }

    /// `cmp rsi, imm8`
    pub fn cmp_rsi_imm8(&mut self, imm: i8) {
        self.emit(&[0x48, 0x83, 0xFE, imm as u8]);
    }

    /// `dec rsi`
    pub fn dec_rsi(&mut self) {
        self.emit(&[0x48, 0xFF, 0xCE]);
    }

    /// `mov edx, imm32`
    pub fn mov_edx_imm32(&mut self, imm: u32) {
        self.emit(&[0xBA]);
        self.emit(&imm.to_le_bytes());
    }

    /// `inc edx`
    pub fn inc_edx(&mut self) {
        self.emit(&[0xFF, 0xC2]);
    }

    /// `push rdx`
    pub fn push_rdx(&mut self) {
        self.emit(&[0x52]);
    }

    /// `pop rdx`
    pub fn pop_rdx(&mut self) {
        self.emit(&[0x5A]);
    }

    /// `push rbx`
    pub fn push_rbx(&mut self) {
        self.emit(&[0x53]);
    }

    /// `pop rbx`
    pub fn pop_rbx(&mut self) {
        self.emit(&[0x5B]);
    }

    /// `jg rel32`
    pub fn jg(&mut self, target: Label) {
        self.emit_rel32(&[0x0F, 0x8F], target);
    }

    /// `jz rel32`
    pub fn jz(&mut self, target: Label) {
        self.emit_rel32(&[0x0F, 0x84], target);
    }

    /// `jmp rel32`
    pub fn jmp(&mut self, target: Label) {
        self.emit_rel32(&[0xE9], target);
    }

    /// `ret`
    pub fn ret(&mut self) {
        self.emit(&[0xC3]);
    }

    /// Patches all label references and returns the finished code.
    ///
    /// # Errors
    ///
    /// Fails if any referenced label was never bound or a displacement
    /// exceeds the rel32 range.
    pub fn finalize(mut self) -> Result<Vec<u8>, AsmError> {
        for (pos, label) in std::mem::take(&mut self.fixups) {
            let target = self.labels[label.0].ok_or(AsmError::UnboundLabel(label.0))?;
            let rel = target as i64 - (pos as i64 + 4);
            let rel32 =
                i32::try_from(rel).map_err(|_| AsmError::DisplacementOverflow(pos))?;
            self.code[pos..pos + 4].copy_from_slice(&rel32.to_le_bytes());
        }
        Ok(self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_and_backward_jumps() {
        let mut a = Assembler::new();
        let start = a.new_label();
        let end = a.new_label();
        a.bind(start);
        a.mov_edx_imm32(0);
        a.jz(end);
        a.jmp(start);
        a.bind(end);
        a.ret();
        let code = a.finalize().expect("finalize");
        // jz sits after the 5-byte mov; its rel32 must skip the 5-byte jmp
        assert_eq!(&code[5..7], &[0x0F, 0x84]);
        assert_eq!(i32::from_le_bytes(code[7..11].try_into().unwrap()), 5);
        // backward jmp to offset 0
        assert_eq!(code[11], 0xE9);
        assert_eq!(i32::from_le_bytes(code[12..16].try_into().unwrap()), -16);
        assert_eq!(*code.last().unwrap(), 0xC3);
    }

    #[test]
    fn test_unbound_label_rejected() {
        let mut a = Assembler::new();
        let l = a.new_label();
        a.jmp(l);
        assert!(matches!(a.finalize(), Err(AsmError::UnboundLabel(_))));
    }

    #[test]
    fn test_mov_imm64_encoding() {
        let mut a = Assembler::new();
        a.mov_rax_imm64(0x1122334455667788);
        let code = a.finalize().unwrap();
        assert_eq!(
            code,
            vec![0x48, 0xB8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }
}
