//! Register file and status for a single Z80 core.

use crate::flags::Flags;
use crate::instructions::{InterruptMode, Register};

fn im_as_u8(im: InterruptMode) -> u8 {
    match im {
        InterruptMode::Mode0 => 0,
        InterruptMode::Mode1 => 1,
        InterruptMode::Mode2 => 2,
        InterruptMode::Unknown(n) => n,
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    Init,
    Running,
    Halted,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Z80State {
    pub status: Status,

    pub pc: u16,
    pub sp: u16,
    pub ix: u16,
    pub iy: u16,

    pub reg: [u8; 8],
    pub shadow_reg: [u8; 8],

    pub i: u8,
    pub r: u8,

    pub iff1: bool,
    pub iff2: bool,
    pub im: InterruptMode,

    /// The undocumented MEMPTR/WZ register: most instructions that form
    /// a 16-bit address leave a trace of it here, later observable
    /// through `BIT n,(HL)`'s undocumented F3/F5 behavior.
    pub memptr: u16,

    /// F immediately after the last instruction that affected flags, or
    /// 0 if that instruction was itself `SCF`/`CCF`. Feeds the Zilog
    /// undocumented-bit formula applied by those two instructions.
    pub q: u8,

    pub int_pending: bool,
    pub nmi_pending: bool,
    /// Set for the one instruction immediately following `EI`; during it
    /// interrupts are not accepted even though IFF1 is already true.
    pub ei_delay: bool,
    /// Master interrupt-acceptance gate, separate from `IFF1`/`IFF2`: a
    /// hardware-level line the controller can hold low (e.g. during reset)
    /// independently of whether the program has executed `DI`/`EI`.
    pub int_gate: bool,

    /// `m1_pc` of the most recently taken branch/call/return/RST, for
    /// debug-dump and step-over tooling.
    pub last_branch: u16,

    /// PC at the most recent M1 (opcode fetch) cycle.
    pub m1_pc: u16,
    pub prev_pc: u16,
    pub prefix: u8,
    pub opcode: u8,

    pub total_t_states: u64,
}

impl Default for Z80State {
    fn default() -> Self {
        Self {
            status: Status::Init,
            pc: 0,
            sp: 0,
            ix: 0,
            iy: 0,
            reg: [0; 8],
            shadow_reg: [0; 8],
            i: 0,
            r: 0,
            iff1: false,
            iff2: false,
            im: InterruptMode::Mode0,
            memptr: 0,
            q: 0,
            int_pending: false,
            nmi_pending: false,
            ei_delay: false,
            int_gate: true,
            last_branch: 0,
            m1_pc: 0,
            prev_pc: 0,
            prefix: 0,
            opcode: 0,
            total_t_states: 0,
        }
    }
}

impl Z80State {
    pub fn get_register(&self, reg: Register) -> u8 {
        self.reg[reg as usize]
    }

    pub fn set_register(&mut self, reg: Register, value: u8) {
        self.reg[reg as usize] = value;
    }

    pub fn flags(&self) -> Flags {
        Flags::from_bits_truncate(self.reg[Register::F as usize])
    }

    pub fn set_flags(&mut self, flags: Flags) {
        self.reg[Register::F as usize] = flags.bits();
    }

    /// A packed view of `IFF1`/`IFF2`/`IM` for debug dumps — `0` whenever
    /// both are clear and the interrupt mode is the reset default.
    pub fn int_flags(&self) -> u8 {
        (self.iff1 as u8) | ((self.iff2 as u8) << 1) | (im_as_u8(self.im) << 2)
    }
}
