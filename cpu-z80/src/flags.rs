use bitflags::bitflags;

use crate::instructions::Condition;

bitflags! {
    /// The Z80 F register. Bits 3 and 5 (`F3`/`F5`) are undocumented and
    /// simply mirror bits of the last ALU result or, for `SCF`/`CCF`, the
    /// Zilog `Q`-register formula (see `crate::execute`).
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct Flags: u8 {
        const CARRY            = 0x01;
        const SUBTRACT         = 0x02;
        const PARITY_OVERFLOW  = 0x04;
        const F3                = 0x08;
        const HALF_CARRY       = 0x10;
        const F5                = 0x20;
        const ZERO              = 0x40;
        const SIGN               = 0x80;
    }
}

bitflags! {
    /// Static metadata about a decoded instruction, produced once by the
    /// shared decode engine and consumed by both the disassembler (to
    /// annotate output) and the interpreter (to classify control flow for
    /// the trace buffer without a second match over `Instruction`).
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct InstructionFlags: u16 {
        const BRANCH        = 1 << 0;
        const CALL          = 1 << 1;
        const RETURN        = 1 << 2;
        const CONDITIONAL   = 1 << 3;
        const UNDOCUMENTED  = 1 << 4;
        const INDEXED       = 1 << 5;
        const PREFIXED      = 1 << 6;
        const BLOCK         = 1 << 7;
        const IO            = 1 << 8;
        const AFFECTS_FLAGS = 1 << 9;
    }
}

/// Whether `cond` holds given the current `F` register — shared by the
/// interpreter's `JPcc`/`JRcc`/`CALLcc`/`RETcc` dispatch and the
/// disassembler's flag-taken annotation (spec.md §4.2, §4.6), so the two
/// never drift apart on what a condition code means.
pub fn condition_met(cond: Condition, flags: Flags) -> bool {
    match cond {
        Condition::NotZero => !flags.contains(Flags::ZERO),
        Condition::Zero => flags.contains(Flags::ZERO),
        Condition::NotCarry => !flags.contains(Flags::CARRY),
        Condition::Carry => flags.contains(Flags::CARRY),
        Condition::ParityOdd => !flags.contains(Flags::PARITY_OVERFLOW),
        Condition::ParityEven => flags.contains(Flags::PARITY_OVERFLOW),
        Condition::Positive => !flags.contains(Flags::SIGN),
        Condition::Negative => flags.contains(Flags::SIGN),
    }
}
