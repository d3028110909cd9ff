//! Machine-code production for the two gadget shapes.
//!
//! The scanner does not disassemble anything: it asks this module for the
//! exact bytes a gadget must consist of and searches executable pages for
//! them.

use crate::error::{Error, Result};
use iced_x86::{BlockEncoder, BlockEncoderOptions, Code, Instruction, InstructionBlock, Register};

/// One of the 16 x64 general-purpose registers, as stored by a pivot gadget
/// and as addressed inside a thread context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegKey {
    Rax,
    Rcx,
    Rdx,
    Rbx,
    Rsp,
    Rbp,
    Rsi,
    Rdi,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl RegKey {
    pub const ALL: [RegKey; 16] = [
        RegKey::Rax,
        RegKey::Rcx,
        RegKey::Rdx,
        RegKey::Rbx,
        RegKey::Rsp,
        RegKey::Rbp,
        RegKey::Rsi,
        RegKey::Rdi,
        RegKey::R8,
        RegKey::R9,
        RegKey::R10,
        RegKey::R11,
        RegKey::R12,
        RegKey::R13,
        RegKey::R14,
        RegKey::R15,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            RegKey::Rax => "rax",
            RegKey::Rcx => "rcx",
            RegKey::Rdx => "rdx",
            RegKey::Rbx => "rbx",
            RegKey::Rsp => "rsp",
            RegKey::Rbp => "rbp",
            RegKey::Rsi => "rsi",
            RegKey::Rdi => "rdi",
            RegKey::R8 => "r8",
            RegKey::R9 => "r9",
            RegKey::R10 => "r10",
            RegKey::R11 => "r11",
            RegKey::R12 => "r12",
            RegKey::R13 => "r13",
            RegKey::R14 => "r14",
            RegKey::R15 => "r15",
        }
    }

    const fn register(self) -> Register {
        match self {
            RegKey::Rax => Register::RAX,
            RegKey::Rcx => Register::RCX,
            RegKey::Rdx => Register::RDX,
            RegKey::Rbx => Register::RBX,
            RegKey::Rsp => Register::RSP,
            RegKey::Rbp => Register::RBP,
            RegKey::Rsi => Register::RSI,
            RegKey::Rdi => Register::RDI,
            RegKey::R8 => Register::R8,
            RegKey::R9 => Register::R9,
            RegKey::R10 => Register::R10,
            RegKey::R11 => Register::R11,
            RegKey::R12 => Register::R12,
            RegKey::R13 => Register::R13,
            RegKey::R14 => Register::R14,
            RegKey::R15 => Register::R15,
        }
    }
}

/// Bytes of the sleep gadget: a two-byte jump to itself (`jmp $`).
pub fn sleep_gadget() -> Result<Vec<u8>> {
    let jmp = Instruction::with_branch(Code::Jmp_rel8_64, 0)
        .map_err(|_| scan_failed("jmp $"))?;

    encode(&[jmp], "jmp $")
}

/// Bytes of a pivot gadget for the given register: `push <reg>; ret`.
pub fn pivot_gadget(reg: RegKey) -> Result<Vec<u8>> {
    let pattern = || format!("push {}; ret", reg.name());

    let push = Instruction::with1(Code::Push_r64, reg.register())
        .map_err(|_| Error::GadgetScanFailed { pattern: pattern() })?;
    let ret = Instruction::with(Code::Retnq);

    let bytes = encode(&[push, ret], &pattern())?;
    if bytes.is_empty() {
        return Err(Error::GadgetScanFailed { pattern: pattern() });
    }

    Ok(bytes)
}

fn encode(instructions: &[Instruction], pattern: &str) -> Result<Vec<u8>> {
    // The gadgets are position independent, so any rip works for encoding.
    //
    let block = InstructionBlock::new(instructions, 0);

    BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)
        .map(|b| b.code_buffer)
        .map_err(|_| scan_failed(pattern))
}

fn scan_failed(pattern: &str) -> Error {
    Error::GadgetScanFailed {
        pattern: pattern.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_gadget_is_a_self_jump() {
        assert_eq!(sleep_gadget().unwrap(), [0xEB, 0xFE]);
    }

    #[test]
    fn pivot_gadgets_for_legacy_registers() {
        assert_eq!(pivot_gadget(RegKey::Rax).unwrap(), [0x50, 0xC3]);
        assert_eq!(pivot_gadget(RegKey::Rbx).unwrap(), [0x53, 0xC3]);
        assert_eq!(pivot_gadget(RegKey::Rbp).unwrap(), [0x55, 0xC3]);
        assert_eq!(pivot_gadget(RegKey::Rdi).unwrap(), [0x57, 0xC3]);
    }

    #[test]
    fn pivot_gadgets_for_extended_registers_carry_a_rex_prefix() {
        assert_eq!(pivot_gadget(RegKey::R8).unwrap(), [0x41, 0x50, 0xC3]);
        assert_eq!(pivot_gadget(RegKey::R12).unwrap(), [0x41, 0x54, 0xC3]);
        assert_eq!(pivot_gadget(RegKey::R15).unwrap(), [0x41, 0x57, 0xC3]);
    }
}
