//! The shared decode engine (spec.md §4.2).
//!
//! One decode routine walks every prefix chain (plain, `CB`, `ED`, `DD`,
//! `FD`, `DDCB`, `FDCB`) and produces an [`Instruction`]. Both the
//! disassembler and the interpreter's instruction fetch drive it through
//! the [`ByteSource`] trait — the disassembler over a byte slice, the
//! interpreter over live memory — rather than maintaining two separate
//! opcode tables. [`disassemble_single`] wraps it for tooling and adds
//! mnemonic formatting and a T-state estimate.

use crate::error::Z80Error;
use crate::flags::{condition_met, InstructionFlags};
use crate::instructions::{
    Condition, Direction, IndexRegister, IndexRegisterHalf, Instruction, LoadTarget, Register, RegisterPair, SpecialRegister, Target,
};
use crate::state::Z80State;
use crate::timing::Z80InstructionCycles;

/// Where a byte of the instruction stream comes from. `is_opcode` is true
/// for the initial opcode byte and every prefix byte (`CB`/`ED`/`DD`/`FD`)
/// — the bytes that would be fetched on a real M1 cycle — and false for
/// displacement and immediate operand bytes.
pub trait ByteSource {
    fn fetch(&mut self, is_opcode: bool) -> u8;
}

pub struct SliceByteSource<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> SliceByteSource<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        SliceByteSource { bytes, pos: 0 }
    }

    pub fn consumed(&self) -> usize {
        self.pos
    }
}

impl<'a> ByteSource for SliceByteSource<'a> {
    fn fetch(&mut self, _is_opcode: bool) -> u8 {
        let byte = self.bytes.get(self.pos).copied().unwrap_or(0x00);
        self.pos += 1;
        byte
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum HlContext {
    Hl,
    Ix,
    Iy,
}

impl HlContext {
    fn index_register(self) -> Option<IndexRegister> {
        match self {
            HlContext::Hl => None,
            HlContext::Ix => Some(IndexRegister::IX),
            HlContext::Iy => Some(IndexRegister::IY),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DecodedInstruction {
    pub instruction: Instruction,
    pub address: u16,
    pub bytes: Vec<u8>,
    pub mnemonic: String,
    pub flags: InstructionFlags,
    pub cycles: Z80InstructionCycles,
    /// Filled only by [`disassemble_with_runtime`]: the absolute address an
    /// indexed target (`(IX+d)`/`(IY+d)`) resolves to given the live `IX`/`IY`.
    pub displacement_effective_addr: Option<u16>,
    /// Filled only by [`disassemble_with_runtime`]: the address execution
    /// resumes at after a `CALL`/`CALLcc`/`RST` returns.
    pub return_addr: Option<u16>,
    /// Filled only by [`disassemble_with_runtime`]: a flag-taken prediction
    /// such as `"Will jump to $8007"` or `"Won't jump"` for conditional
    /// control flow, or the dereferenced value at an indexed operand
    /// (`"-> #2A"`) when there's no condition to predict.
    pub annotation: Option<String>,
    /// `false` when the input ran out before the instruction was fully
    /// decoded (including an empty `bytes` slice) — the decode itself
    /// never fails in that case, it just pads with `0x00`, so this is the
    /// caller's signal not to trust the result.
    pub is_valid: bool,
}

impl DecodedInstruction {
    pub fn length(&self) -> u16 {
        self.bytes.len() as u16
    }

    pub fn next_address(&self) -> u16 {
        self.address.wrapping_add(self.length())
    }
}

/// Decodes exactly one instruction from `source`, returning the
/// instruction and the raw bytes consumed (opcode bytes, prefixes,
/// displacement and immediates all included — the equivalence key the
/// trace buffer and breakpoint engine key off of).
pub fn decode_one(source: &mut impl ByteSource) -> (Instruction, Vec<u8>) {
    let mut bytes = Vec::with_capacity(4);
    let mut take = |src: &mut dyn ByteSource, is_opcode: bool, bytes: &mut Vec<u8>| -> u8 {
        let b = src.fetch(is_opcode);
        bytes.push(b);
        b
    };

    let first = take(source, true, &mut bytes);
    let instruction = match first {
        0xCB => {
            let op = take(source, true, &mut bytes);
            decode_cb(op, HlContext::Hl, source, &mut bytes)
        },
        0xED => decode_ed(source, &mut bytes),
        0xDD => decode_prefixed(HlContext::Ix, source, &mut bytes),
        0xFD => decode_prefixed(HlContext::Iy, source, &mut bytes),
        _ => decode_base(first, HlContext::Hl, source, &mut bytes),
    };
    (instruction, bytes)
}

fn decode_prefixed(hl: HlContext, source: &mut impl ByteSource, bytes: &mut Vec<u8>) -> Instruction {
    let next = {
        let b = source.fetch(true);
        bytes.push(b);
        b
    };
    match next {
        0xCB => {
            let d = fetch_displacement(source, bytes);
            let op = {
                let b = source.fetch(true);
                bytes.push(b);
                b
            };
            decode_cb_indexed(op, hl.index_register().unwrap(), d)
        },
        // A second DD/FD prefix in a row: the earlier one is discarded on real
        // hardware and only the last one before the opcode is effective.
        0xDD => decode_prefixed(HlContext::Ix, source, bytes),
        0xFD => decode_prefixed(HlContext::Iy, source, bytes),
        // DD/FD immediately followed by ED: the index prefix is wasted and
        // the ED instruction executes exactly as if unprefixed (still HL).
        0xED => decode_ed(source, bytes),
        _ => decode_base(next, hl, source, bytes),
    }
}

fn fetch_displacement(source: &mut impl ByteSource, bytes: &mut Vec<u8>) -> i8 {
    let b = source.fetch(false);
    bytes.push(b);
    b as i8
}

fn fetch_byte(source: &mut impl ByteSource, bytes: &mut Vec<u8>) -> u8 {
    let b = source.fetch(false);
    bytes.push(b);
    b
}

fn fetch_word(source: &mut impl ByteSource, bytes: &mut Vec<u8>) -> u16 {
    let lo = fetch_byte(source, bytes) as u16;
    let hi = fetch_byte(source, bytes) as u16;
    lo | (hi << 8)
}

fn rp_index(p: u8, hl: HlContext) -> RegisterPair {
    match (p, hl) {
        (0, _) => RegisterPair::BC,
        (1, _) => RegisterPair::DE,
        (2, HlContext::Hl) => RegisterPair::HL,
        (2, HlContext::Ix) => RegisterPair::IX,
        (2, HlContext::Iy) => RegisterPair::IY,
        (3, _) => RegisterPair::SP,
        _ => unreachable!("p is always in 0..=3"),
    }
}

fn rp2_index(p: u8, hl: HlContext) -> RegisterPair {
    match (p, hl) {
        (0, _) => RegisterPair::BC,
        (1, _) => RegisterPair::DE,
        (2, HlContext::Hl) => RegisterPair::HL,
        (2, HlContext::Ix) => RegisterPair::IX,
        (2, HlContext::Iy) => RegisterPair::IY,
        (3, _) => RegisterPair::AF,
        _ => unreachable!("p is always in 0..=3"),
    }
}

fn hl_regpair(hl: HlContext) -> RegisterPair {
    match hl {
        HlContext::Hl => RegisterPair::HL,
        HlContext::Ix => RegisterPair::IX,
        HlContext::Iy => RegisterPair::IY,
    }
}

fn cc_from_y(y: u8) -> Condition {
    match y {
        0 => Condition::NotZero,
        1 => Condition::Zero,
        2 => Condition::NotCarry,
        3 => Condition::Carry,
        4 => Condition::ParityOdd,
        5 => Condition::ParityEven,
        6 => Condition::Positive,
        7 => Condition::Negative,
        _ => unreachable!("y is always in 0..=7"),
    }
}

/// A direct (non-memory) 8-bit register reference, substituting the
/// relevant index-register half when `hl != HlContext::Hl`.
fn reg_target(slot: u8, hl: HlContext, source: &mut impl ByteSource, bytes: &mut Vec<u8>) -> Target {
    match slot {
        0 => Target::DirectReg(Register::B),
        1 => Target::DirectReg(Register::C),
        2 => Target::DirectReg(Register::D),
        3 => Target::DirectReg(Register::E),
        4 => match hl {
            HlContext::Hl => Target::DirectReg(Register::H),
            HlContext::Ix => Target::DirectRegHalf(IndexRegisterHalf::IXH),
            HlContext::Iy => Target::DirectRegHalf(IndexRegisterHalf::IYH),
        },
        5 => match hl {
            HlContext::Hl => Target::DirectReg(Register::L),
            HlContext::Ix => Target::DirectRegHalf(IndexRegisterHalf::IXL),
            HlContext::Iy => Target::DirectRegHalf(IndexRegisterHalf::IYL),
        },
        6 => match hl {
            HlContext::Hl => Target::IndirectReg(RegisterPair::HL),
            HlContext::Ix => Target::IndirectOffset(IndexRegister::IX, fetch_displacement(source, bytes)),
            HlContext::Iy => Target::IndirectOffset(IndexRegister::IY, fetch_displacement(source, bytes)),
        },
        7 => Target::DirectReg(Register::A),
        _ => unreachable!("slot is always in 0..=7"),
    }
}

fn reg_load_target(slot: u8, hl: HlContext, source: &mut impl ByteSource, bytes: &mut Vec<u8>) -> LoadTarget {
    match slot {
        0 => LoadTarget::DirectRegByte(Register::B),
        1 => LoadTarget::DirectRegByte(Register::C),
        2 => LoadTarget::DirectRegByte(Register::D),
        3 => LoadTarget::DirectRegByte(Register::E),
        4 => match hl {
            HlContext::Hl => LoadTarget::DirectRegByte(Register::H),
            HlContext::Ix => LoadTarget::DirectRegHalfByte(IndexRegisterHalf::IXH),
            HlContext::Iy => LoadTarget::DirectRegHalfByte(IndexRegisterHalf::IYH),
        },
        5 => match hl {
            HlContext::Hl => LoadTarget::DirectRegByte(Register::L),
            HlContext::Ix => LoadTarget::DirectRegHalfByte(IndexRegisterHalf::IXL),
            HlContext::Iy => LoadTarget::DirectRegHalfByte(IndexRegisterHalf::IYL),
        },
        6 => match hl {
            HlContext::Hl => LoadTarget::IndirectRegByte(RegisterPair::HL),
            HlContext::Ix => LoadTarget::IndirectOffsetByte(IndexRegister::IX, fetch_displacement(source, bytes)),
            HlContext::Iy => LoadTarget::IndirectOffsetByte(IndexRegister::IY, fetch_displacement(source, bytes)),
        },
        7 => LoadTarget::DirectRegByte(Register::A),
        _ => unreachable!("slot is always in 0..=7"),
    }
}

fn alu_instruction(y: u8, target: Target) -> Instruction {
    match y {
        0 => Instruction::ADDa(target),
        1 => Instruction::ADCa(target),
        2 => Instruction::SUB(target),
        3 => Instruction::SBCa(target),
        4 => Instruction::AND(target),
        5 => Instruction::XOR(target),
        6 => Instruction::OR(target),
        7 => Instruction::CP(target),
        _ => unreachable!("y is always in 0..=7"),
    }
}

fn reg_from_slot(slot: u8) -> Register {
    match slot {
        0 => Register::B,
        1 => Register::C,
        2 => Register::D,
        3 => Register::E,
        4 => Register::H,
        5 => Register::L,
        7 => Register::A,
        _ => unreachable!("IN r,(C)/OUT (C),r never select slot 6"),
    }
}

fn decode_base(opcode: u8, hl: HlContext, source: &mut impl ByteSource, bytes: &mut Vec<u8>) -> Instruction {
    let x = (opcode >> 6) & 0b11;
    let y = (opcode >> 3) & 0b111;
    let z = opcode & 0b111;
    let p = y >> 1;
    let q = y & 1;

    match x {
        0 => match z {
            0 => match y {
                0 => Instruction::NOP,
                1 => Instruction::EXafaf,
                2 => Instruction::DJNZ(fetch_displacement(source, bytes)),
                3 => Instruction::JR(fetch_displacement(source, bytes)),
                4..=7 => Instruction::JRcc(cc_from_y(y - 4), fetch_displacement(source, bytes)),
                _ => unreachable!(),
            },
            1 => {
                if q == 0 {
                    let nn = fetch_word(source, bytes);
                    Instruction::LD(LoadTarget::DirectRegWord(rp_index(p, hl)), LoadTarget::ImmediateWord(nn))
                } else {
                    Instruction::ADD16(hl_regpair(hl), rp_index(p, hl))
                }
            },
            2 => match (q, p) {
                (0, 0) => Instruction::LD(LoadTarget::IndirectRegByte(RegisterPair::BC), LoadTarget::DirectRegByte(Register::A)),
                (0, 1) => Instruction::LD(LoadTarget::IndirectRegByte(RegisterPair::DE), LoadTarget::DirectRegByte(Register::A)),
                (0, 2) => {
                    let nn = fetch_word(source, bytes);
                    Instruction::LD(LoadTarget::IndirectWord(nn), LoadTarget::DirectRegWord(hl_regpair(hl)))
                },
                (0, 3) => {
                    let nn = fetch_word(source, bytes);
                    Instruction::LD(LoadTarget::IndirectByte(nn), LoadTarget::DirectRegByte(Register::A))
                },
                (1, 0) => Instruction::LD(LoadTarget::DirectRegByte(Register::A), LoadTarget::IndirectRegByte(RegisterPair::BC)),
                (1, 1) => Instruction::LD(LoadTarget::DirectRegByte(Register::A), LoadTarget::IndirectRegByte(RegisterPair::DE)),
                (1, 2) => {
                    let nn = fetch_word(source, bytes);
                    Instruction::LD(LoadTarget::DirectRegWord(hl_regpair(hl)), LoadTarget::IndirectWord(nn))
                },
                (1, 3) => {
                    let nn = fetch_word(source, bytes);
                    Instruction::LD(LoadTarget::DirectRegByte(Register::A), LoadTarget::IndirectByte(nn))
                },
                _ => unreachable!(),
            },
            3 => {
                let rp = rp_index(p, hl);
                if q == 0 { Instruction::INC16(rp) } else { Instruction::DEC16(rp) }
            },
            4 => Instruction::INC8(reg_target(y, hl, source, bytes)),
            5 => Instruction::DEC8(reg_target(y, hl, source, bytes)),
            6 => {
                let dest = reg_load_target(y, hl, source, bytes);
                let n = fetch_byte(source, bytes);
                Instruction::LD(dest, LoadTarget::ImmediateByte(n))
            },
            7 => match y {
                0 => Instruction::RLCA,
                1 => Instruction::RRCA,
                2 => Instruction::RLA,
                3 => Instruction::RRA,
                4 => Instruction::DAA,
                5 => Instruction::CPL,
                6 => Instruction::SCF,
                7 => Instruction::CCF,
                _ => unreachable!(),
            },
            _ => unreachable!(),
        },

        1 => {
            if z == 6 && y == 6 {
                Instruction::HALT
            } else {
                let dest = reg_load_target(y, hl, source, bytes);
                let src = reg_load_target(z, hl, source, bytes);
                Instruction::LD(dest, src)
            }
        },

        2 => alu_instruction(y, reg_target(z, hl, source, bytes)),

        3 => match z {
            0 => Instruction::RETcc(cc_from_y(y)),
            1 => {
                if q == 0 {
                    Instruction::POP(rp2_index(p, hl))
                } else {
                    match p {
                        0 => Instruction::RET,
                        1 => Instruction::EXX,
                        2 => Instruction::JPIndirect(hl_regpair(hl)),
                        3 => Instruction::LD(LoadTarget::DirectRegWord(RegisterPair::SP), LoadTarget::DirectRegWord(hl_regpair(hl))),
                        _ => unreachable!(),
                    }
                }
            },
            2 => {
                let nn = fetch_word(source, bytes);
                Instruction::JPcc(cc_from_y(y), nn)
            },
            3 => match y {
                0 => Instruction::JP(fetch_word(source, bytes)),
                1 => unreachable!("0xCB is intercepted before decode_base is reached"),
                2 => Instruction::OUTx(fetch_byte(source, bytes)),
                3 => Instruction::INx(fetch_byte(source, bytes)),
                4 => Instruction::EXsp(hl_regpair(hl)),
                5 => Instruction::EXhlde,
                6 => Instruction::DI,
                7 => Instruction::EI,
                _ => unreachable!(),
            },
            4 => {
                let nn = fetch_word(source, bytes);
                Instruction::CALLcc(cc_from_y(y), nn)
            },
            5 => {
                if q == 0 {
                    Instruction::PUSH(rp2_index(p, hl))
                } else if p == 0 {
                    Instruction::CALL(fetch_word(source, bytes))
                } else {
                    unreachable!("0xDD/0xED/0xFD are intercepted before decode_base is reached")
                }
            },
            6 => alu_instruction(y, Target::Immediate(fetch_byte(source, bytes))),
            7 => Instruction::RST(y * 8),
            _ => unreachable!(),
        },

        _ => unreachable!("x is always in 0..=3"),
    }
}

fn rot_instruction(y: u8, target: Target, copy: Option<Target>) -> Instruction {
    match y {
        0 => Instruction::RLC(target, copy),
        1 => Instruction::RRC(target, copy),
        2 => Instruction::RL(target, copy),
        3 => Instruction::RR(target, copy),
        4 => Instruction::SLA(target, copy),
        5 => Instruction::SRA(target, copy),
        6 => Instruction::SLL(target, copy),
        7 => Instruction::SRL(target, copy),
        _ => unreachable!("y is always in 0..=7"),
    }
}

fn decode_cb(opcode: u8, hl: HlContext, source: &mut impl ByteSource, bytes: &mut Vec<u8>) -> Instruction {
    let x = (opcode >> 6) & 0b11;
    let y = (opcode >> 3) & 0b111;
    let z = opcode & 0b111;
    let target = reg_target(z, hl, source, bytes);
    match x {
        0 => rot_instruction(y, target, None),
        1 => Instruction::BIT(y, target),
        2 => Instruction::RES(y, target, None),
        3 => Instruction::SET(y, target, None),
        _ => unreachable!(),
    }
}

/// `DDCB`/`FDCB`: the displacement byte was already consumed before the
/// final opcode byte. When the opcode's low-order register slot isn't
/// `(HL)`'s slot (6), the result is additionally copied into that
/// register — an undocumented side effect this decode exposes through
/// `Instruction`'s `UndocumentedCopy` field rather than silently losing it.
fn decode_cb_indexed(opcode: u8, index: IndexRegister, displacement: i8) -> Instruction {
    let x = (opcode >> 6) & 0b11;
    let y = (opcode >> 3) & 0b111;
    let z = opcode & 0b111;
    let target = Target::IndirectOffset(index, displacement);
    let copy = if z != 6 { Some(reg_target_no_fetch(z)) } else { None };

    match x {
        0 => rot_instruction(y, target, copy),
        1 => Instruction::BIT(y, target),
        2 => Instruction::RES(y, target, copy),
        3 => Instruction::SET(y, target, copy),
        _ => unreachable!(),
    }
}

fn reg_target_no_fetch(slot: u8) -> Target {
    match slot {
        0 => Target::DirectReg(Register::B),
        1 => Target::DirectReg(Register::C),
        2 => Target::DirectReg(Register::D),
        3 => Target::DirectReg(Register::E),
        4 => Target::DirectReg(Register::H),
        5 => Target::DirectReg(Register::L),
        7 => Target::DirectReg(Register::A),
        _ => unreachable!("slot 6 ((HL)) never gets an undocumented copy"),
    }
}

fn im_from_y(y: u8) -> crate::instructions::InterruptMode {
    use crate::instructions::InterruptMode;
    match y {
        0 | 1 | 4 | 5 => InterruptMode::Mode0,
        2 | 6 => InterruptMode::Mode1,
        3 | 7 => InterruptMode::Mode2,
        _ => unreachable!("y is always in 0..=7"),
    }
}

fn decode_ed(source: &mut impl ByteSource, bytes: &mut Vec<u8>) -> Instruction {
    let opcode = fetch_byte_as_opcode(source, bytes);
    let x = (opcode >> 6) & 0b11;
    let y = (opcode >> 3) & 0b111;
    let z = opcode & 0b111;
    let p = y >> 1;
    let q = y & 1;

    match x {
        1 => match z {
            0 => if y == 6 { Instruction::INicz } else { Instruction::INic(reg_from_slot(y)) },
            1 => if y == 6 { Instruction::OUTicz } else { Instruction::OUTic(reg_from_slot(y)) },
            2 => {
                let rp = rp_index(p, HlContext::Hl);
                if q == 0 { Instruction::SBC16(RegisterPair::HL, rp) } else { Instruction::ADC16(RegisterPair::HL, rp) }
            },
            3 => {
                let nn = fetch_word(source, bytes);
                let rp = rp_index(p, HlContext::Hl);
                if q == 0 {
                    Instruction::LD(LoadTarget::IndirectWord(nn), LoadTarget::DirectRegWord(rp))
                } else {
                    Instruction::LD(LoadTarget::DirectRegWord(rp), LoadTarget::IndirectWord(nn))
                }
            },
            4 => Instruction::NEG,
            5 => if y == 1 { Instruction::RETI } else { Instruction::RETN },
            6 => Instruction::IM(im_from_y(y)),
            7 => match y {
                0 => Instruction::LDsr(SpecialRegister::I, Direction::FromAcc),
                1 => Instruction::LDsr(SpecialRegister::R, Direction::FromAcc),
                2 => Instruction::LDsr(SpecialRegister::I, Direction::ToAcc),
                3 => Instruction::LDsr(SpecialRegister::R, Direction::ToAcc),
                4 => Instruction::RRD,
                5 => Instruction::RLD,
                6 | 7 => Instruction::NOP,
                _ => unreachable!(),
            },
            _ => unreachable!(),
        },

        2 if z <= 3 && y >= 4 => match (z, y) {
            (0, 4) => Instruction::LDI,
            (0, 5) => Instruction::LDD,
            (0, 6) => Instruction::LDIR,
            (0, 7) => Instruction::LDDR,
            (1, 4) => Instruction::CPI,
            (1, 5) => Instruction::CPD,
            (1, 6) => Instruction::CPIR,
            (1, 7) => Instruction::CPDR,
            (2, 4) => Instruction::INI,
            (2, 5) => Instruction::IND,
            (2, 6) => Instruction::INIR,
            (2, 7) => Instruction::INDR,
            (3, 4) => Instruction::OUTI,
            (3, 5) => Instruction::OUTD,
            (3, 6) => Instruction::OTIR,
            (3, 7) => Instruction::OTDR,
            _ => unreachable!(),
        },

        // every other ED-prefixed byte ("NONI") behaves as a plain NOP
        _ => Instruction::NOP,
    }
}

fn fetch_byte_as_opcode(source: &mut impl ByteSource, bytes: &mut Vec<u8>) -> u8 {
    let b = source.fetch(true);
    bytes.push(b);
    b
}

fn hex(value: impl Into<i64>) -> String {
    let value = value.into();
    if value < 0 { format!("-#{:02X}", -value) } else { format!("#{:02X}", value) }
}

fn fmt_target(target: &Target) -> String {
    match target {
        Target::DirectReg(r) => format!("{:?}", r).to_lowercase(),
        Target::DirectRegHalf(r) => format!("{:?}", r).to_lowercase(),
        Target::IndirectReg(rp) => format!("({:?})", rp).to_lowercase(),
        Target::IndirectOffset(ix, d) => format!("({}{})", format!("{:?}", ix).to_lowercase(), hex(*d as i64)),
        Target::Immediate(n) => format!("#{:02X}", n),
    }
}

fn fmt_load_target(target: &LoadTarget) -> String {
    match target {
        LoadTarget::DirectRegByte(r) => format!("{:?}", r).to_lowercase(),
        LoadTarget::DirectRegHalfByte(r) => format!("{:?}", r).to_lowercase(),
        LoadTarget::DirectRegWord(rp) => format!("{:?}", rp).to_lowercase(),
        LoadTarget::IndirectRegByte(rp) => format!("({:?})", rp).to_lowercase(),
        LoadTarget::IndirectRegWord(rp) => format!("({:?})", rp).to_lowercase(),
        LoadTarget::IndirectOffsetByte(ix, d) => format!("({}{})", format!("{:?}", ix).to_lowercase(), hex(*d as i64)),
        LoadTarget::DirectAltRegByte(r) => format!("{:?}'", r).to_lowercase(),
        LoadTarget::IndirectByte(addr) => format!("(#{:04X})", addr),
        LoadTarget::IndirectWord(addr) => format!("(#{:04X})", addr),
        LoadTarget::ImmediateByte(n) => format!("#{:02X}", n),
        LoadTarget::ImmediateWord(n) => format!("#{:04X}", n),
    }
}

fn fmt_cc(cond: Condition) -> &'static str {
    match cond {
        Condition::NotZero => "nz",
        Condition::Zero => "z",
        Condition::NotCarry => "nc",
        Condition::Carry => "c",
        Condition::ParityOdd => "po",
        Condition::ParityEven => "pe",
        Condition::Positive => "p",
        Condition::Negative => "m",
    }
}

/// Formats `instruction` in lowercase ZX-Spectrum-convention assembly
/// (`#` hex prefix). `next_pc` is the address immediately after this
/// instruction, needed to resolve `JR`/`DJNZ` relative displacements to
/// an absolute target.
pub fn format_mnemonic(instruction: &Instruction, next_pc: u16) -> String {
    let rel = |d: i8| -> String { format!("#{:04X}", (next_pc as i16).wrapping_add(d as i16) as u16) };

    match instruction {
        Instruction::ADCa(t) => format!("adc a,{}", fmt_target(t)),
        Instruction::ADC16(d, s) => format!("adc {:?},{:?}", d, s).to_lowercase(),
        Instruction::ADDa(t) => format!("add a,{}", fmt_target(t)),
        Instruction::ADD16(d, s) => format!("add {:?},{:?}", d, s).to_lowercase(),
        Instruction::AND(t) => format!("and {}", fmt_target(t)),
        Instruction::BIT(b, t) => format!("bit {},{}", b, fmt_target(t)),
        Instruction::CALL(addr) => format!("call #{:04X}", addr),
        Instruction::CALLcc(c, addr) => format!("call {},#{:04X}", fmt_cc(*c), addr),
        Instruction::CCF => "ccf".to_string(),
        Instruction::CP(t) => format!("cp {}", fmt_target(t)),
        Instruction::CPD => "cpd".to_string(),
        Instruction::CPDR => "cpdr".to_string(),
        Instruction::CPI => "cpi".to_string(),
        Instruction::CPIR => "cpir".to_string(),
        Instruction::CPL => "cpl".to_string(),
        Instruction::DAA => "daa".to_string(),
        Instruction::DEC16(rp) => format!("dec {:?}", rp).to_lowercase(),
        Instruction::DEC8(t) => format!("dec {}", fmt_target(t)),
        Instruction::DI => "di".to_string(),
        Instruction::DJNZ(d) => format!("djnz {}", rel(*d)),
        Instruction::EI => "ei".to_string(),
        Instruction::EXX => "exx".to_string(),
        Instruction::EXafaf => "ex af,af'".to_string(),
        Instruction::EXhlde => "ex de,hl".to_string(),
        Instruction::EXsp(rp) => format!("ex (sp),{:?}", rp).to_lowercase(),
        Instruction::HALT => "halt".to_string(),
        Instruction::IM(mode) => format!("im {:?}", mode).to_lowercase().replace("mode", ""),
        Instruction::INC16(rp) => format!("inc {:?}", rp).to_lowercase(),
        Instruction::INC8(t) => format!("inc {}", fmt_target(t)),
        Instruction::IND => "ind".to_string(),
        Instruction::INDR => "indr".to_string(),
        Instruction::INI => "ini".to_string(),
        Instruction::INIR => "inir".to_string(),
        Instruction::INic(r) => format!("in {:?},(c)", r).to_lowercase(),
        Instruction::INicz => "in (c)".to_string(),
        Instruction::INx(n) => format!("in a,(#{:02X})", n),
        Instruction::JP(addr) => format!("jp #{:04X}", addr),
        Instruction::JPIndirect(rp) => format!("jp ({:?})", rp).to_lowercase(),
        Instruction::JPcc(c, addr) => format!("jp {},#{:04X}", fmt_cc(*c), addr),
        Instruction::JR(d) => format!("jr {}", rel(*d)),
        Instruction::JRcc(c, d) => format!("jr {},{}", fmt_cc(*c), rel(*d)),
        Instruction::LD(dest, src) => format!("ld {},{}", fmt_load_target(dest), fmt_load_target(src)),
        Instruction::LDsr(sr, dir) => match dir {
            Direction::FromAcc => format!("ld {:?},a", sr).to_lowercase(),
            Direction::ToAcc => format!("ld a,{:?}", sr).to_lowercase(),
        },
        Instruction::LDD => "ldd".to_string(),
        Instruction::LDDR => "lddr".to_string(),
        Instruction::LDI => "ldi".to_string(),
        Instruction::LDIR => "ldir".to_string(),
        Instruction::NEG => "neg".to_string(),
        Instruction::NOP => "nop".to_string(),
        Instruction::OR(t) => format!("or {}", fmt_target(t)),
        Instruction::OTDR => "otdr".to_string(),
        Instruction::OTIR => "otir".to_string(),
        Instruction::OUTD => "outd".to_string(),
        Instruction::OUTI => "outi".to_string(),
        Instruction::OUTic(r) => format!("out (c),{:?}", r).to_lowercase(),
        Instruction::OUTicz => "out (c),0".to_string(),
        Instruction::OUTx(n) => format!("out (#{:02X}),a", n),
        Instruction::POP(rp) => format!("pop {:?}", rp).to_lowercase(),
        Instruction::PUSH(rp) => format!("push {:?}", rp).to_lowercase(),
        Instruction::RES(b, t, copy) => format_with_copy("res", Some(*b), t, copy),
        Instruction::RET => "ret".to_string(),
        Instruction::RETI => "reti".to_string(),
        Instruction::RETN => "retn".to_string(),
        Instruction::RETcc(c) => format!("ret {}", fmt_cc(*c)),
        Instruction::RL(t, copy) => format_with_copy("rl", None, t, copy),
        Instruction::RLA => "rla".to_string(),
        Instruction::RLC(t, copy) => format_with_copy("rlc", None, t, copy),
        Instruction::RLCA => "rlca".to_string(),
        Instruction::RLD => "rld".to_string(),
        Instruction::RR(t, copy) => format_with_copy("rr", None, t, copy),
        Instruction::RRA => "rra".to_string(),
        Instruction::RRC(t, copy) => format_with_copy("rrc", None, t, copy),
        Instruction::RRCA => "rrca".to_string(),
        Instruction::RRD => "rrd".to_string(),
        Instruction::RST(addr) => format!("rst #{:02X}", addr),
        Instruction::SBCa(t) => format!("sbc a,{}", fmt_target(t)),
        Instruction::SBC16(d, s) => format!("sbc {:?},{:?}", d, s).to_lowercase(),
        Instruction::SCF => "scf".to_string(),
        Instruction::SET(b, t, copy) => format_with_copy("set", Some(*b), t, copy),
        Instruction::SLA(t, copy) => format_with_copy("sla", None, t, copy),
        Instruction::SLL(t, copy) => format_with_copy("sll", None, t, copy),
        Instruction::SRA(t, copy) => format_with_copy("sra", None, t, copy),
        Instruction::SRL(t, copy) => format_with_copy("srl", None, t, copy),
        Instruction::SUB(t) => format!("sub {}", fmt_target(t)),
        Instruction::XOR(t) => format!("xor {}", fmt_target(t)),
    }
}

fn format_with_copy(mnemonic: &str, bit: Option<u8>, target: &Target, copy: &Option<Target>) -> String {
    let operand = match bit {
        Some(b) => format!("{},{}", b, fmt_target(target)),
        None => fmt_target(target),
    };
    match copy {
        Some(c) => format!("{} {},{}", mnemonic, operand, fmt_target(c)),
        None => format!("{} {}", mnemonic, operand),
    }
}

/// Coarse metadata derived from the already-decoded instruction — no
/// second pass over the opcode bytes.
pub fn classify(instruction: &Instruction) -> InstructionFlags {
    use Instruction::*;
    let mut flags = InstructionFlags::empty();
    match instruction {
        JP(_) | JR(_) | JPIndirect(_) => flags |= InstructionFlags::BRANCH,
        JPcc(_, _) | JRcc(_, _) | DJNZ(_) => flags |= InstructionFlags::BRANCH | InstructionFlags::CONDITIONAL,
        CALL(_) => flags |= InstructionFlags::CALL,
        CALLcc(_, _) => flags |= InstructionFlags::CALL | InstructionFlags::CONDITIONAL,
        RET | RETI | RETN => flags |= InstructionFlags::RETURN,
        RETcc(_) => flags |= InstructionFlags::RETURN | InstructionFlags::CONDITIONAL,
        RST(_) => flags |= InstructionFlags::CALL,
        LDI | LDD | LDIR | LDDR | CPI | CPD | CPIR | CPDR | INI | IND | INIR | INDR | OUTI | OUTD | OTIR | OTDR => {
            flags |= InstructionFlags::BLOCK
        },
        INic(_) | INicz | INx(_) | OUTic(_) | OUTicz | OUTx(_) => flags |= InstructionFlags::IO,
        _ => {},
    }

    if matches!(
        instruction,
        INic(_) | INicz | OUTic(_) | OUTicz | RETI | RETN | NEG | LDsr(_, _) | RLD | RRD | IM(_)
            | LDI | LDD | LDIR | LDDR | CPI | CPD | CPIR | CPDR | INI | IND | INIR | INDR | OUTI | OUTD | OTIR | OTDR
    ) {
        flags |= InstructionFlags::PREFIXED;
    }

    if matches!(instruction, RLC(_, Some(_)) | RRC(_, Some(_)) | RL(_, Some(_)) | RR(_, Some(_)) | SLA(_, Some(_)) | SLL(_, Some(_)) | SRA(_, Some(_)) | SRL(_, Some(_)) | RES(_, _, Some(_)) | SET(_, _, Some(_))) {
        flags |= InstructionFlags::UNDOCUMENTED;
    }
    if matches!(instruction, Instruction::SLL(_, _)) {
        flags |= InstructionFlags::UNDOCUMENTED;
    }

    flags
}

fn is_indexed(target: &Target) -> bool {
    matches!(target, Target::IndirectOffset(_, _) | Target::DirectRegHalf(_))
}

fn mark_indexed(instruction: &Instruction, mut flags: InstructionFlags) -> InstructionFlags {
    use Instruction::*;
    let indexed = match instruction {
        ADCa(t) | ADDa(t) | AND(t) | CP(t) | SBCa(t) | SUB(t) | OR(t) | XOR(t) | INC8(t) | DEC8(t) => is_indexed(t),
        BIT(_, t) | RES(_, t, _) | SET(_, t, _) | RL(t, _) | RLC(t, _) | RR(t, _) | RRC(t, _) | SLA(t, _) | SLL(t, _) | SRA(t, _) | SRL(t, _) => is_indexed(t),
        ADD16(rp, _) | ADC16(rp, _) | SBC16(rp, _) | INC16(rp) | DEC16(rp) | POP(rp) | PUSH(rp) | JPIndirect(rp) | EXsp(rp) => matches!(rp, RegisterPair::IX | RegisterPair::IY),
        _ => false,
    };
    if indexed {
        flags |= InstructionFlags::INDEXED;
    }
    flags
}

/// Disassembles a single instruction starting at `bytes[0]`, which is
/// `address` in the original address space.
pub fn disassemble_single(bytes: &[u8], address: u16) -> Result<DecodedInstruction, Z80Error> {
    let mut source = SliceByteSource::new(bytes);
    let (instruction, consumed) = decode_one(&mut source);
    let is_valid = source.consumed() <= bytes.len();
    let cycles = Z80InstructionCycles::from_instruction(&instruction, 0)?;
    let next_pc = address.wrapping_add(consumed.len() as u16);
    let mnemonic = format_mnemonic(&instruction, next_pc);
    let flags = mark_indexed(&instruction, classify(&instruction));

    Ok(DecodedInstruction {
        instruction,
        address,
        bytes: consumed,
        mnemonic,
        flags,
        cycles,
        displacement_effective_addr: None,
        return_addr: None,
        annotation: None,
        is_valid,
    })
}

/// A [`ByteSource`] over live memory, used for runtime disassembly and the
/// step-over CFG walk. Reads through `direct_read` so decoding never
/// triggers memory-access breakpoints or analyzer callbacks.
struct MemoryByteSource<'a> {
    memory: &'a zxcore::Memory,
    addr: u16,
}

impl<'a> ByteSource for MemoryByteSource<'a> {
    fn fetch(&mut self, _is_opcode: bool) -> u8 {
        let byte = self.memory.direct_read(self.addr);
        self.addr = self.addr.wrapping_add(1);
        byte
    }
}

/// Decodes the instruction at `addr` directly from memory, returning it
/// along with the address immediately following it.
fn decode_at(memory: &zxcore::Memory, addr: u16) -> (Instruction, u16) {
    let mut source = MemoryByteSource { memory, addr };
    let (instruction, bytes) = decode_one(&mut source);
    (instruction, addr.wrapping_add(bytes.len() as u16))
}

/// `addr + full_len` of the instruction at `addr`, modulo 2^16.
pub fn next_instruction_addr(addr: u16, memory: &zxcore::Memory) -> u16 {
    decode_at(memory, addr).1
}

fn is_return(instruction: &Instruction) -> bool {
    matches!(instruction, Instruction::RET | Instruction::RETcc(_) | Instruction::RETI | Instruction::RETN)
}

/// The absolute address execution resumes at after `instruction` returns,
/// for the subset of instructions that push a return address: `CALL`,
/// `CALLcc` and `RST` all resume at the address immediately following them.
fn call_like_target(instruction: &Instruction, next_pc: u16) -> Option<u16> {
    match instruction {
        Instruction::CALL(_) | Instruction::CALLcc(_, _) | Instruction::RST(_) => Some(next_pc),
        _ => None,
    }
}

/// Resolves `(IX+d)`/`(IY+d)` targets against the live index registers.
fn indirect_offset_addr(instruction: &Instruction, state: &Z80State) -> Option<u16> {
    let resolve = |target: &Target| match target {
        Target::IndirectOffset(IndexRegister::IX, d) => Some(state.ix.wrapping_add(*d as i16 as u16)),
        Target::IndirectOffset(IndexRegister::IY, d) => Some(state.iy.wrapping_add(*d as i16 as u16)),
        _ => None,
    };
    use Instruction::*;
    match instruction {
        ADCa(t) | ADDa(t) | AND(t) | CP(t) | SBCa(t) | SUB(t) | OR(t) | XOR(t) | INC8(t) | DEC8(t) => resolve(t),
        BIT(_, t) | RES(_, t, _) | SET(_, t, _) | RL(t, _) | RLC(t, _) | RR(t, _) | RRC(t, _) | SLA(t, _) | SLL(t, _) | SRA(t, _) | SRL(t, _) => resolve(t),
        LD(dest, src) => match (dest, src) {
            (LoadTarget::IndirectOffsetByte(IndexRegister::IX, d), _) | (_, LoadTarget::IndirectOffsetByte(IndexRegister::IX, d)) => {
                Some(state.ix.wrapping_add(*d as i16 as u16))
            },
            (LoadTarget::IndirectOffsetByte(IndexRegister::IY, d), _) | (_, LoadTarget::IndirectOffsetByte(IndexRegister::IY, d)) => {
                Some(state.iy.wrapping_add(*d as i16 as u16))
            },
            _ => None,
        },
        _ => None,
    }
}

/// Builds the `"Will jump to $XXXX"` / `"Won't jump"` family of flag-taken
/// predictions for conditional control flow, evaluated against the live
/// flags register (spec.md's "flag-taken prediction" algorithm).
fn condition_annotation(instruction: &Instruction, state: &Z80State, next_pc: u16) -> Option<String> {
    let rel_target = |d: i8| -> u16 { (next_pc as i16).wrapping_add(d as i16) as u16 };
    match instruction {
        Instruction::JRcc(cond, d) => {
            if condition_met(*cond, state.flags()) {
                Some(format!("Will jump to ${:04X}", rel_target(*d)))
            } else {
                Some("Won't jump".to_string())
            }
        },
        Instruction::JPcc(cond, addr) => {
            if condition_met(*cond, state.flags()) {
                Some(format!("Will jump to ${:04X}", addr))
            } else {
                Some("Won't jump".to_string())
            }
        },
        Instruction::DJNZ(d) => {
            let taken = state.reg[Register::B as usize].wrapping_sub(1) != 0;
            if taken {
                Some(format!("Will jump to ${:04X}", rel_target(*d)))
            } else {
                Some("Won't jump".to_string())
            }
        },
        Instruction::CALLcc(cond, addr) => {
            if condition_met(*cond, state.flags()) {
                Some(format!("Will call ${:04X}", addr))
            } else {
                Some("Won't call".to_string())
            }
        },
        Instruction::RETcc(cond) => {
            if condition_met(*cond, state.flags()) {
                Some("Will return".to_string())
            } else {
                Some("Won't return".to_string())
            }
        },
        _ => None,
    }
}

/// Like [`disassemble_single`], but additionally consults live register and
/// memory state to fill `displacement_effective_addr`, `return_addr` and a
/// flag-taken `annotation` for conditional control flow.
pub fn disassemble_with_runtime(bytes: &[u8], address: u16, state: &Z80State, memory: &zxcore::Memory) -> Result<DecodedInstruction, Z80Error> {
    let mut decoded = disassemble_single(bytes, address)?;
    let next_pc = decoded.next_address();

    decoded.displacement_effective_addr = indirect_offset_addr(&decoded.instruction, state);
    decoded.return_addr = call_like_target(&decoded.instruction, next_pc);
    decoded.annotation = condition_annotation(&decoded.instruction, state, next_pc).or_else(|| {
        decoded
            .displacement_effective_addr
            .map(|addr| format!("-> #{:02X}", memory.direct_read(addr)))
    });

    Ok(decoded)
}

/// Total instructions a single [`step_over_exclusion_ranges`] walk may
/// decode before giving up and returning whatever ranges it has found.
const STEP_OVER_MAX_INSTRUCTIONS: u32 = 1000;
/// Maximum `CALL`/`RST` nesting depth the walk will follow.
const STEP_OVER_MAX_DEPTH: u32 = 10;

/// A closed `[start, end]` address range the debugger should treat as
/// "inside the stepped-over call" — breakpoints within it are deactivated
/// for the duration of a step-over.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StepOverRange {
    pub start: u16,
    pub end: u16,
}

/// Walks the reachable control-flow graph from the instruction at `pc`,
/// returning the address ranges a "step over" debugger command should
/// treat as one unit: the body of a `CALL`/`RST` target (followed to its
/// `RET`) or the single address a block-repeat instruction loops on.
///
/// Bounded by `max_depth` (recursion through nested calls) and a fixed
/// total instruction budget, so a pathological or self-modifying target
/// can never hang the debugger; on either limit the walk returns whatever
/// ranges it already found rather than erroring.
pub fn step_over_exclusion_ranges(pc: u16, memory: &zxcore::Memory, max_depth: u32) -> Vec<StepOverRange> {
    let (instruction, next_pc) = decode_at(memory, pc);

    if matches!(instruction, Instruction::LDIR | Instruction::LDDR | Instruction::CPIR | Instruction::CPDR | Instruction::INIR | Instruction::INDR | Instruction::OTIR | Instruction::OTDR) {
        return vec![StepOverRange { start: pc, end: pc }];
    }

    let target = match &instruction {
        Instruction::CALL(addr) | Instruction::CALLcc(_, addr) => *addr,
        Instruction::RST(addr) => *addr as u16,
        _ => return Vec::new(),
    };

    let mut ranges = Vec::new();
    let mut visited = std::collections::HashSet::new();
    let mut budget = STEP_OVER_MAX_INSTRUCTIONS;
    walk_block(target, memory, max_depth.min(STEP_OVER_MAX_DEPTH), &mut visited, &mut budget, &mut ranges);
    ranges.push(StepOverRange { start: next_pc, end: next_pc });
    ranges
}

fn walk_block(
    start: u16,
    memory: &zxcore::Memory,
    depth_remaining: u32,
    visited: &mut std::collections::HashSet<u16>,
    budget: &mut u32,
    ranges: &mut Vec<StepOverRange>,
) {
    if depth_remaining == 0 || !visited.insert(start) {
        return;
    }

    let mut addr = start;
    let mut end = start;
    while *budget > 0 {
        *budget -= 1;
        let (instruction, next) = decode_at(memory, addr);
        end = addr;

        if is_return(&instruction) {
            break;
        }
        if let Some(target) = match &instruction {
            Instruction::CALL(a) | Instruction::CALLcc(_, a) => Some(*a),
            Instruction::RST(a) => Some(*a as u16),
            _ => None,
        } {
            walk_block(target, memory, depth_remaining - 1, visited, budget, ranges);
        }

        addr = next;
        if *budget == 0 || addr == start {
            break;
        }
    }

    ranges.push(StepOverRange { start, end });
}

/// True for instructions a "step over" debugger command should treat as
/// a unit rather than stepping into (`CALL`/`RST`/block repeats).
pub fn should_step_over(instruction: &Instruction) -> bool {
    classify(instruction).intersects(InstructionFlags::CALL) || matches!(instruction, Instruction::LDIR | Instruction::LDDR | Instruction::CPIR | Instruction::CPDR | Instruction::INIR | Instruction::INDR | Instruction::OTIR | Instruction::OTDR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::Flags;

    #[test]
    fn decodes_plain_nop() {
        let decoded = disassemble_single(&[0x00], 0x8000).unwrap();
        assert_eq!(decoded.mnemonic, "nop");
        assert_eq!(decoded.bytes, vec![0x00]);
        assert!(decoded.is_valid);
    }

    #[test]
    fn empty_input_is_marked_invalid() {
        let decoded = disassemble_single(&[], 0x8000).unwrap();
        assert!(!decoded.is_valid);
    }

    #[test]
    fn truncated_multi_byte_instruction_is_marked_invalid() {
        // JR is 2 bytes; supplying only the opcode byte underruns.
        let decoded = disassemble_single(&[0x18], 0x8000).unwrap();
        assert!(!decoded.is_valid);
    }

    #[test]
    fn decodes_fdcb_bit_with_iy_offset() {
        // FD CB 02 5E = bit 3,(iy+$02)
        let decoded = disassemble_single(&[0xFD, 0xCB, 0x02, 0x5E], 0x8000).unwrap();
        assert_eq!(decoded.mnemonic, "bit 3,(iy+#02)");
        assert_eq!(decoded.bytes, vec![0xFD, 0xCB, 0x02, 0x5E]);
    }

    #[test]
    fn ddcb_set_exposes_undocumented_copy() {
        // DD CB 05 C0 = set 0,(ix+$05),b (undocumented register copy)
        let decoded = disassemble_single(&[0xDD, 0xCB, 0x05, 0xC0], 0x8000).unwrap();
        assert_eq!(decoded.mnemonic, "set 0,(ix+#05),b");
        assert!(decoded.flags.contains(InstructionFlags::UNDOCUMENTED));
    }

    #[test]
    fn relative_jump_resolves_against_address_after_instruction() {
        // JR $+5 from address 0x8000: the instruction is 2 bytes, so the
        // branch computes from 0x8002.
        let decoded = disassemble_single(&[0x18, 0x05], 0x8000).unwrap();
        assert_eq!(decoded.mnemonic, "jr #8007");
    }

    #[test]
    fn dd_prefixed_ld_uses_index_half_registers() {
        let decoded = disassemble_single(&[0xDD, 0x7C], 0x8000).unwrap(); // LD A,IXH
        assert_eq!(decoded.mnemonic, "ld a,ixh");
    }

    #[test]
    fn indexed_arithmetic_reads_displacement_before_immediate_and_back() {
        // DD 36 d n = LD (IX+d),n
        let decoded = disassemble_single(&[0xDD, 0x36, 0x10, 0x42], 0x8000).unwrap();
        assert_eq!(decoded.mnemonic, "ld (ix+#10),#42");
        assert_eq!(decoded.bytes.len(), 4);
    }

    #[test]
    fn ed_block_instruction_decodes_correctly() {
        let decoded = disassemble_single(&[0xED, 0xB0], 0x8000).unwrap(); // LDIR
        assert_eq!(decoded.mnemonic, "ldir");
    }

    #[test]
    fn call_is_classified_as_call_flow() {
        let decoded = disassemble_single(&[0xCD, 0x00, 0x80], 0x8000).unwrap();
        assert!(decoded.flags.contains(InstructionFlags::CALL));
        assert!(should_step_over(&decoded.instruction));
    }

    #[test]
    fn next_instruction_addr_skips_over_a_multi_byte_instruction() {
        let mut memory = zxcore::Memory::default_48k();
        memory.direct_write_slice(0x8000, &[0xDD, 0x36, 0x10, 0x42]); // LD (IX+#10),#42
        assert_eq!(next_instruction_addr(0x8000, &memory), 0x8004);
    }

    #[test]
    fn runtime_disassembly_predicts_taken_conditional_jump() {
        let mut memory = zxcore::Memory::default_48k();
        memory.direct_write_slice(0x8000, &[0x28, 0x05]); // JR Z,$+5
        let mut state = Z80State::default();
        state.set_flags(Flags::ZERO);
        let decoded = disassemble_with_runtime(&[0x28, 0x05], 0x8000, &state, &memory).unwrap();
        assert_eq!(decoded.annotation.as_deref(), Some("Will jump to $8007"));
    }

    #[test]
    fn runtime_disassembly_predicts_not_taken_conditional_jump() {
        let memory = zxcore::Memory::default_48k();
        let state = Z80State::default();
        let decoded = disassemble_with_runtime(&[0x28, 0x05], 0x8000, &state, &memory).unwrap();
        assert_eq!(decoded.annotation.as_deref(), Some("Won't jump"));
    }

    #[test]
    fn runtime_disassembly_resolves_indexed_displacement_against_live_ix() {
        let memory = zxcore::Memory::default_48k();
        let mut state = Z80State::default();
        state.ix = 0x9000;
        let decoded = disassemble_with_runtime(&[0xDD, 0x7E, 0x05], 0x8000, &state, &memory).unwrap(); // LD A,(IX+5)
        assert_eq!(decoded.displacement_effective_addr, Some(0x9005));
    }

    #[test]
    fn runtime_disassembly_fills_return_addr_for_call() {
        let memory = zxcore::Memory::default_48k();
        let state = Z80State::default();
        let decoded = disassemble_with_runtime(&[0xCD, 0x00, 0x80], 0x8000, &state, &memory).unwrap();
        assert_eq!(decoded.return_addr, Some(0x8003));
    }

    #[test]
    fn step_over_exclusion_ranges_covers_call_body_and_landing_address() {
        let mut memory = zxcore::Memory::default_48k();
        memory.direct_write_slice(0x8000, &[0xCD, 0x00, 0x90]); // CALL $9000
        memory.direct_write_slice(0x9000, &[0x00, 0xC9]); // NOP; RET
        let ranges = step_over_exclusion_ranges(0x8000, &memory, 10);
        assert!(ranges.iter().any(|r| r.start == 0x9000 && r.end == 0x9001));
        assert!(ranges.iter().any(|r| r.start == 0x8003 && r.end == 0x8003));
    }

    #[test]
    fn step_over_exclusion_ranges_is_empty_for_non_call_instructions() {
        let mut memory = zxcore::Memory::default_48k();
        memory.direct_write_slice(0x8000, &[0x00]); // NOP
        assert!(step_over_exclusion_ranges(0x8000, &memory, 10).is_empty());
    }
}
