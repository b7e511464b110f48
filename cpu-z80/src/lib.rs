//! A cycle-accurate Z80 interpreter built on `zxcore`'s banked memory,
//! breakpoint engine, event bus, analyzer framework and trace buffer.

pub mod disasm;
pub mod error;
pub mod execute;
pub mod flags;
pub mod instructions;
pub mod state;
pub mod timing;

pub use crate::disasm::{
    disassemble_single, disassemble_with_runtime, format_mnemonic, next_instruction_addr, should_step_over, step_over_exclusion_ranges, DecodedInstruction,
    StepOverRange,
};
pub use crate::error::Z80Error;
pub use crate::execute::{IoBus, Z80};
pub use crate::flags::{Flags, InstructionFlags};
pub use crate::instructions::{
    Condition, Direction, IndexRegister, IndexRegisterHalf, Instruction, InterruptMode, LoadTarget, Register, RegisterPair, Size, SpecialRegister, Target,
};
pub use crate::state::{Status, Z80State};
pub use crate::timing::Z80InstructionCycles;
