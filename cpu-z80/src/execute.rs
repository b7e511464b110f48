//! The M1 fetch/decode/execute loop and the arithmetic core behind every
//! `Instruction` variant.
//!
//! `Z80` owns its memory, breakpoint engine, event bus, analyzer manager
//! and trace buffer outright rather than borrowing them — the hot loop
//! (`step`) drives all five every instruction, and keeping them as
//! sibling fields avoids the aliasing a shared/borrowed `Memory` would
//! otherwise force onto the analyzer dispatch path. `Memory`'s own
//! `MemoryObserver` hook exists for callers that wire these crates
//! together differently (e.g. attaching a debugger after construction);
//! here `Z80` calls into its `AnalyzerManager` directly since it already
//! owns both fields, leaving `Memory`'s observer at its default no-op.

use zxcore::{AnalyzerManager, BankSnapshot, BreakpointEngine, ControlFlowEvent, ControlFlowKind, EventBus, Memory, MemoryObserver, TraceBuffer};

use crate::disasm::{classify, decode_one, ByteSource};
use crate::error::Z80Error;
use crate::flags::{Flags, InstructionFlags};
use crate::instructions::{Condition, Direction, IndexRegister, IndexRegisterHalf, Instruction, InterruptMode, LoadTarget, Register, RegisterPair, SpecialRegister, Target};
use crate::state::{Status, Z80State};
use crate::timing::Z80InstructionCycles;

/// Z80 port I/O: a 16-bit address space entirely separate from banked
/// memory, so it gets its own trait rather than living on `zxcore::Memory`.
pub trait IoBus {
    fn read_port(&mut self, port: u16) -> u8;
    fn write_port(&mut self, port: u16, value: u8);
}

const BREAKPOINT_TOPIC: &str = "breakpoint_hit";

pub struct Z80<Io: IoBus> {
    pub state: Z80State,
    pub memory: Memory,
    pub io: Io,
    pub breakpoints: BreakpointEngine,
    pub events: EventBus,
    pub analyzers: AnalyzerManager,
    pub trace: TraceBuffer,
    paused: bool,
    frame: u64,
    breakpoint_topic: u32,

    /// T-states since the last frame boundary; reset by [`Self::on_frame_boundary`].
    frame_t: u64,
    /// Nominal T-states per video frame (48K Spectrum: 69888).
    pub frame_limit: u64,
    /// T-state offset from frame start where the ULA's interrupt pulse begins.
    pub intstart: u64,
    /// Duration in T-states of the interrupt pulse.
    pub intlen: u64,
    /// `TT = T * rate`: a finer-grained counter for sub-cycle arbitration.
    /// Stays at its nominal value across speed-multiplier changes.
    pub rate: u16,
    /// Scales `frame_limit`/`intstart`/`intlen` at frame boundaries; `rate`
    /// itself is unaffected.
    pub speed_multiplier: u32,
    int_pulsed_this_frame: bool,
    /// Set by [`Self::finish`] while dispatching the current instruction;
    /// tells `step` whether to leave `Q` alone (it was just set to the
    /// correct `F & 0x28`) or reset it to 0 for an instruction that
    /// doesn't touch flags at all.
    flags_touched_this_step: bool,
}

impl<Io: IoBus> Z80<Io> {
    pub fn new(memory: Memory, io: Io) -> Self {
        let mut events = EventBus::new(64);
        let breakpoint_topic = events.register_topic(BREAKPOINT_TOPIC).expect("fresh event bus has room for one topic");
        events.start();

        Z80 {
            state: Z80State::default(),
            memory,
            io,
            breakpoints: BreakpointEngine::new(),
            events,
            analyzers: AnalyzerManager::new(),
            trace: TraceBuffer::new(256, 4096),
            paused: false,
            frame: 0,
            breakpoint_topic,
            frame_t: 0,
            frame_limit: 69_888,
            intstart: 0,
            intlen: 32,
            rate: 256,
            speed_multiplier: 1,
            int_pulsed_this_frame: false,
            flags_touched_this_step: false,
        }
    }

    /// `PC=0, SP=0xFFFF, AF=0xFFFF, I=R=0, IM=0, IFF1=IFF2=0, int_gate=true`;
    /// consumes the 3 T-states a real reset takes.
    pub fn reset(&mut self) {
        self.state = Z80State::default();
        self.state.status = Status::Running;
        self.state.sp = 0xFFFF;
        self.state.set_register(Register::A, 0xFF);
        self.state.set_flags(Flags::all());
        self.state.total_t_states = 3;
        self.paused = false;
        self.frame_t = 0;
        self.int_pulsed_this_frame = false;
    }

    /// `TT = T * rate`, the scaled counter used for sub-cycle arbitration.
    pub fn tt(&self) -> u64 {
        self.state.total_t_states * self.rate as u64
    }

    /// One line of `register=value` pairs suitable for a debugger status
    /// line or log message.
    pub fn dump_state(&self) -> String {
        format!(
            "PC={:04X} SP={:04X} AF={:04X} BC={:04X} DE={:04X} HL={:04X} IX={:04X} IY={:04X} I={:02X} R={:02X} IM={:?} IFF={:02X} T={}",
            self.state.pc,
            self.state.sp,
            self.get_regpair(RegisterPair::AF),
            self.get_regpair(RegisterPair::BC),
            self.get_regpair(RegisterPair::DE),
            self.get_regpair(RegisterPair::HL),
            self.state.ix,
            self.state.iy,
            self.state.i,
            self.state.r,
            self.state.im,
            self.state.int_flags(),
            self.state.total_t_states,
        )
    }

    /// Steps until `frame_t >= frame_limit`, raising the ULA's once-per-frame
    /// interrupt pulse when `frame_t` enters `[intstart, intstart+intlen)`,
    /// then fires [`Self::on_frame_boundary`].
    pub fn frame_cycle(&mut self) -> Result<(), Z80Error> {
        let multiplier = self.speed_multiplier.max(1) as u64;
        let limit = self.frame_limit * multiplier;
        let int_start = self.intstart * multiplier;
        let int_end = int_start + self.intlen * multiplier;

        while self.frame_t < limit {
            if self.paused {
                return Ok(());
            }
            if self.frame_t >= int_start && self.frame_t < int_end && !self.int_pulsed_this_frame {
                self.request_int();
                self.int_pulsed_this_frame = true;
            }
            let consumed = self.step()?;
            self.frame_t += consumed.max(1) as u64;
        }

        self.on_frame_boundary();
        Ok(())
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn request_int(&mut self) {
        self.state.int_pending = true;
    }

    pub fn request_nmi(&mut self) {
        self.state.nmi_pending = true;
    }

    fn post_breakpoint_hit(&mut self, breakpoint_id: u32, pc: u16) {
        if let Some(owner) = self.breakpoints.get(breakpoint_id).and_then(|b| b.owner_analyzer_id) {
            self.analyzers.dispatch_breakpoint_hit(owner, breakpoint_id, pc);
        } else {
            let mut payload = Vec::with_capacity(6);
            payload.extend_from_slice(&breakpoint_id.to_le_bytes());
            payload.extend_from_slice(&pc.to_le_bytes());
            self.events.post(self.breakpoint_topic, payload);
            self.paused = true;
        }
    }

    /// Runs one instruction (or one HALT-state tick, or one interrupt
    /// acknowledgement) and returns the T-states it consumed. Returns 0
    /// without consuming anything if an execution breakpoint halted
    /// dispatch before the instruction fetch.
    pub fn step(&mut self) -> Result<u32, Z80Error> {
        let suppress_interrupts = self.state.ei_delay;
        self.state.ei_delay = false;

        if self.state.nmi_pending {
            self.state.nmi_pending = false;
            self.state.status = Status::Running;
            self.state.iff2 = self.state.iff1;
            self.state.iff1 = false;
            let from_pc = self.state.pc;
            self.push_word(self.state.pc);
            self.state.pc = 0x0066;
            self.state.total_t_states += 11;
            self.log_interrupt_ack(from_pc);
            return Ok(11);
        }

        if self.state.int_pending && self.state.iff1 && !suppress_interrupts {
            self.state.int_pending = false;
            self.state.status = Status::Running;
            self.state.iff1 = false;
            self.state.iff2 = false;
            let from_pc = self.state.pc;
            let cycles = match self.state.im {
                InterruptMode::Mode2 => {
                    let vector = ((self.state.i as u16) << 8) | 0xFF;
                    let addr = self.read_byte(vector, false) as u16 | ((self.read_byte(vector.wrapping_add(1), false) as u16) << 8);
                    self.push_word(self.state.pc);
                    self.state.pc = addr;
                    19
                },
                _ => {
                    self.push_word(self.state.pc);
                    self.state.pc = 0x0038;
                    13
                },
            };
            self.state.total_t_states += cycles as u64;
            self.log_interrupt_ack(from_pc);
            return Ok(cycles);
        }

        if self.state.status == Status::Halted {
            self.state.total_t_states += 4;
            self.analyzers.dispatch_cpu_step(self.state.total_t_states);
            return Ok(4);
        }

        let hit_ids = self.breakpoints.handle_pc_change(self.state.pc);
        if !hit_ids.is_empty() {
            for id in &hit_ids {
                self.post_breakpoint_hit(*id, self.state.pc);
            }
            if self.paused {
                return Ok(0);
            }
        }

        self.memory.update_rom_overlay(self.state.pc);
        self.state.m1_pc = self.state.pc;
        self.state.prev_pc = self.state.pc;

        let (instruction, bytes) = {
            let mut fetch = MemFetch { memory: &mut self.memory, addr: self.state.pc };
            let result = decode_one(&mut fetch);
            self.state.pc = fetch.addr;
            result
        };
        self.state.r = (self.state.r & 0x80) | (self.state.r.wrapping_add(1) & 0x7F);

        self.flags_touched_this_step = false;
        let branch_taken = self.execute(&instruction)?;
        if !self.flags_touched_this_step {
            self.state.q = 0;
        }

        let cycles = Z80InstructionCycles::from_instruction(&instruction, 0)?.calculate_cycles(branch_taken);
        self.state.total_t_states += cycles as u64;

        let flags = classify(&instruction);
        if let Some(kind) = control_flow_kind(&instruction, flags, branch_taken) {
            self.state.last_branch = self.state.m1_pc;
            self.trace.log_if_control_flow(
                ControlFlowEvent {
                    m1_pc: self.state.m1_pc,
                    target_addr: self.state.pc,
                    kind,
                    banks: [self.bank_snapshot(0), self.bank_snapshot(1), self.bank_snapshot(2), self.bank_snapshot(3)],
                    opcode_bytes: bytes,
                    flags: self.state.flags().bits(),
                    sp: self.state.sp,
                    stack_top: self.stack_top3(),
                },
                self.frame,
            );
        }

        self.analyzers.dispatch_cpu_step(self.state.total_t_states);
        Ok(cycles as u32)
    }

    pub fn on_frame_boundary(&mut self) {
        self.analyzers.dispatch_frame_end(self.frame);
        self.frame += 1;
        self.analyzers.dispatch_frame_boundary(self.frame);
        self.trace.on_frame_boundary(self.frame, 300);
        self.frame_t = 0;
        self.int_pulsed_this_frame = false;
        self.analyzers.dispatch_frame_start(self.frame);
    }

    fn read_byte(&mut self, addr: u16, is_execution: bool) -> u8 {
        let value = self.memory.read(addr, is_execution);
        if self.memory.debug_mode() {
            self.analyzers.on_read(addr, value, is_execution);
        }
        if !is_execution {
            let hits = self.breakpoints.handle_memory_read(addr);
            for id in hits {
                self.post_breakpoint_hit(id, self.state.pc);
            }
        }
        value
    }

    fn write_byte(&mut self, addr: u16, value: u8) {
        self.memory.write(addr, value);
        if self.memory.debug_mode() {
            self.analyzers.on_write(addr, value);
        }
        let hits = self.breakpoints.handle_memory_write(addr);
        for id in hits {
            self.post_breakpoint_hit(id, self.state.pc);
        }
    }

    fn read_port(&mut self, port: u16) -> u8 {
        let value = self.io.read_port(port);
        let hits = self.breakpoints.handle_port_in(port);
        for id in hits {
            self.post_breakpoint_hit(id, self.state.pc);
        }
        value
    }

    fn write_port(&mut self, port: u16, value: u8) {
        self.io.write_port(port, value);
        let hits = self.breakpoints.handle_port_out(port);
        for id in hits {
            self.post_breakpoint_hit(id, self.state.pc);
        }
    }

    fn push_word(&mut self, value: u16) {
        let (hi, lo) = split(value);
        self.state.sp = self.state.sp.wrapping_sub(1);
        self.write_byte(self.state.sp, hi);
        self.state.sp = self.state.sp.wrapping_sub(1);
        self.write_byte(self.state.sp, lo);
    }

    fn pop_word(&mut self) -> u16 {
        let lo = self.read_byte(self.state.sp, false);
        self.state.sp = self.state.sp.wrapping_add(1);
        let hi = self.read_byte(self.state.sp, false);
        self.state.sp = self.state.sp.wrapping_add(1);
        word(hi, lo)
    }

    fn get_regpair(&self, rp: RegisterPair) -> u16 {
        match rp {
            RegisterPair::BC => word(self.state.reg[0], self.state.reg[1]),
            RegisterPair::DE => word(self.state.reg[2], self.state.reg[3]),
            RegisterPair::HL => word(self.state.reg[4], self.state.reg[5]),
            RegisterPair::AF => word(self.state.reg[6], self.state.reg[7]),
            RegisterPair::SP => self.state.sp,
            RegisterPair::IX => self.state.ix,
            RegisterPair::IY => self.state.iy,
        }
    }

    fn set_regpair(&mut self, rp: RegisterPair, value: u16) {
        let (hi, lo) = split(value);
        match rp {
            RegisterPair::BC => {
                self.state.reg[0] = hi;
                self.state.reg[1] = lo;
            },
            RegisterPair::DE => {
                self.state.reg[2] = hi;
                self.state.reg[3] = lo;
            },
            RegisterPair::HL => {
                self.state.reg[4] = hi;
                self.state.reg[5] = lo;
            },
            RegisterPair::AF => {
                self.state.reg[6] = hi;
                self.state.reg[7] = lo;
            },
            RegisterPair::SP => self.state.sp = value,
            RegisterPair::IX => self.state.ix = value,
            RegisterPair::IY => self.state.iy = value,
        }
    }

    fn get_index_half(&self, half: IndexRegisterHalf) -> u8 {
        match half {
            IndexRegisterHalf::IXH => (self.state.ix >> 8) as u8,
            IndexRegisterHalf::IXL => self.state.ix as u8,
            IndexRegisterHalf::IYH => (self.state.iy >> 8) as u8,
            IndexRegisterHalf::IYL => self.state.iy as u8,
        }
    }

    fn set_index_half(&mut self, half: IndexRegisterHalf, value: u8) {
        match half {
            IndexRegisterHalf::IXH => self.state.ix = word(value, self.state.ix as u8),
            IndexRegisterHalf::IXL => self.state.ix = word((self.state.ix >> 8) as u8, value),
            IndexRegisterHalf::IYH => self.state.iy = word(value, self.state.iy as u8),
            IndexRegisterHalf::IYL => self.state.iy = word((self.state.iy >> 8) as u8, value),
        }
    }

    fn offset_addr(&mut self, ix: IndexRegister, d: i8) -> u16 {
        let base = match ix {
            IndexRegister::IX => self.state.ix,
            IndexRegister::IY => self.state.iy,
        };
        let addr = (base as i16).wrapping_add(d as i16) as u16;
        self.state.memptr = addr;
        addr
    }

    fn get_target(&mut self, target: &Target) -> u8 {
        match target {
            Target::DirectReg(r) => self.state.get_register(*r),
            Target::DirectRegHalf(h) => self.get_index_half(*h),
            Target::IndirectReg(rp) => {
                let addr = self.get_regpair(*rp);
                self.read_byte(addr, false)
            },
            Target::IndirectOffset(ix, d) => {
                let addr = self.offset_addr(*ix, *d);
                self.read_byte(addr, false)
            },
            Target::Immediate(n) => *n,
        }
    }

    fn set_target(&mut self, target: &Target, value: u8) -> Result<(), Z80Error> {
        match target {
            Target::DirectReg(r) => self.state.set_register(*r, value),
            Target::DirectRegHalf(h) => self.set_index_half(*h, value),
            Target::IndirectReg(rp) => {
                let addr = self.get_regpair(*rp);
                self.write_byte(addr, value);
            },
            Target::IndirectOffset(ix, d) => {
                let addr = self.offset_addr(*ix, *d);
                self.write_byte(addr, value);
            },
            Target::Immediate(_) => return Err(Z80Error::other("cannot write to an immediate operand")),
        }
        Ok(())
    }

    /// Applies the undocumented `(IX+d)`/`(IY+d)` shift-and-copy side
    /// effect when `copy` names a plain register.
    fn apply_undocumented_copy(&mut self, copy: &Option<Target>, value: u8) -> Result<(), Z80Error> {
        if let Some(t) = copy {
            self.set_target(t, value)?;
        }
        Ok(())
    }

    fn get_load_byte(&mut self, target: &LoadTarget) -> u8 {
        match target {
            LoadTarget::DirectRegByte(r) => self.state.get_register(*r),
            LoadTarget::DirectRegHalfByte(h) => self.get_index_half(*h),
            LoadTarget::DirectAltRegByte(r) => self.state.shadow_reg[*r as usize],
            LoadTarget::IndirectRegByte(rp) => {
                let addr = self.get_regpair(*rp);
                if matches!(rp, RegisterPair::BC | RegisterPair::DE) {
                    self.state.memptr = addr.wrapping_add(1);
                }
                self.read_byte(addr, false)
            },
            LoadTarget::IndirectOffsetByte(ix, d) => {
                let addr = self.offset_addr(*ix, *d);
                self.read_byte(addr, false)
            },
            LoadTarget::IndirectByte(addr) => {
                self.state.memptr = addr.wrapping_add(1);
                self.read_byte(*addr, false)
            },
            LoadTarget::ImmediateByte(n) => *n,
            LoadTarget::DirectRegWord(_) | LoadTarget::IndirectRegWord(_) | LoadTarget::IndirectWord(_) | LoadTarget::ImmediateWord(_) => {
                unreachable!("word-family LoadTarget routed through get_load_word")
            },
        }
    }

    fn set_load_byte(&mut self, target: &LoadTarget, value: u8) {
        match target {
            LoadTarget::DirectRegByte(r) => self.state.set_register(*r, value),
            LoadTarget::DirectRegHalfByte(h) => self.set_index_half(*h, value),
            LoadTarget::DirectAltRegByte(r) => self.state.shadow_reg[*r as usize] = value,
            LoadTarget::IndirectRegByte(rp) => {
                let addr = self.get_regpair(*rp);
                if matches!(rp, RegisterPair::BC | RegisterPair::DE) {
                    self.state.memptr = ((value as u16) << 8) | (addr.wrapping_add(1) & 0xFF);
                }
                self.write_byte(addr, value);
            },
            LoadTarget::IndirectOffsetByte(ix, d) => {
                let addr = self.offset_addr(*ix, *d);
                self.write_byte(addr, value);
            },
            LoadTarget::IndirectByte(addr) => {
                self.state.memptr = ((value as u16) << 8) | (addr.wrapping_add(1) & 0xFF);
                self.write_byte(*addr, value);
            },
            LoadTarget::ImmediateByte(_) | LoadTarget::DirectRegWord(_) | LoadTarget::IndirectRegWord(_) | LoadTarget::IndirectWord(_) | LoadTarget::ImmediateWord(_) => {},
        }
    }

    fn get_load_word(&mut self, target: &LoadTarget) -> u16 {
        match target {
            LoadTarget::DirectRegWord(rp) => self.get_regpair(*rp),
            LoadTarget::IndirectRegWord(rp) => {
                let addr = self.get_regpair(*rp);
                self.read_word(addr)
            },
            LoadTarget::IndirectWord(addr) => self.read_word(*addr),
            LoadTarget::ImmediateWord(n) => *n,
            _ => unreachable!("byte-family LoadTarget routed through get_load_byte"),
        }
    }

    fn set_load_word(&mut self, target: &LoadTarget, value: u16) {
        match target {
            LoadTarget::DirectRegWord(rp) => self.set_regpair(*rp, value),
            LoadTarget::IndirectRegWord(rp) => {
                let addr = self.get_regpair(*rp);
                self.write_word(addr, value);
            },
            LoadTarget::IndirectWord(addr) => self.write_word(*addr, value),
            _ => {},
        }
    }

    fn read_word(&mut self, addr: u16) -> u16 {
        self.state.memptr = addr.wrapping_add(1);
        let lo = self.read_byte(addr, false);
        let hi = self.read_byte(addr.wrapping_add(1), false);
        word(hi, lo)
    }

    fn write_word(&mut self, addr: u16, value: u16) {
        self.state.memptr = addr.wrapping_add(1);
        let (hi, lo) = split(value);
        self.write_byte(addr, lo);
        self.write_byte(addr.wrapping_add(1), hi);
    }

    fn get_condition(&self, cond: Condition) -> bool {
        crate::flags::condition_met(cond, self.state.flags())
    }

    /// Snapshot of `bank_index`'s current mapping, for the control-flow
    /// trace buffer's per-event bank record.
    fn bank_snapshot(&self, bank_index: usize) -> BankSnapshot {
        if self.memory.bank_mode(bank_index) == zxcore::BankMode::Rom {
            BankSnapshot { is_rom: true, page: self.memory.rom_page_of_bank(bank_index) }
        } else {
            BankSnapshot { is_rom: false, page: self.memory.ram_page_of_bank(bank_index) }
        }
    }

    /// The three words at the top of the stack, closest first, read
    /// without side effects for the control-flow trace buffer.
    fn stack_top3(&self) -> [u16; 3] {
        let sp = self.state.sp;
        [
            word(self.memory.direct_read(sp.wrapping_add(1)), self.memory.direct_read(sp)),
            word(self.memory.direct_read(sp.wrapping_add(3)), self.memory.direct_read(sp.wrapping_add(2))),
            word(self.memory.direct_read(sp.wrapping_add(5)), self.memory.direct_read(sp.wrapping_add(4))),
        ]
    }

    fn finish(&mut self, flags: Flags) {
        self.state.set_flags(flags);
        self.state.q = flags.bits() & 0x28;
        self.flags_touched_this_step = true;
    }

    /// Executes a decoded instruction. Returns whether a conditional
    /// branch/repeat took its "long" path — used both for cycle
    /// accounting and to tell the trace buffer a jump was actually taken.
    fn execute(&mut self, instruction: &Instruction) -> Result<bool, Z80Error> {
        use Instruction::*;
        match instruction {
            NOP => {},

            LD(dest, src) => {
                if is_word_target(dest) || is_word_target(src) {
                    let v = self.get_load_word(src);
                    self.set_load_word(dest, v);
                } else {
                    let v = self.get_load_byte(src);
                    self.set_load_byte(dest, v);
                }
            },
            LDsr(sr, dir) => match (sr, dir) {
                (SpecialRegister::I, Direction::FromAcc) => self.state.i = self.state.get_register(Register::A),
                (SpecialRegister::R, Direction::FromAcc) => self.state.r = self.state.get_register(Register::A),
                (SpecialRegister::I, Direction::ToAcc) => {
                    let i = self.state.i;
                    self.state.set_register(Register::A, i);
                    let mut flags = Flags::empty();
                    flags.set(Flags::SIGN, (i & 0x80) != 0);
                    flags.set(Flags::ZERO, i == 0);
                    flags.set(Flags::PARITY_OVERFLOW, self.state.iff2);
                    self.finish(flags);
                },
                (SpecialRegister::R, Direction::ToAcc) => {
                    let r = self.state.r;
                    self.state.set_register(Register::A, r);
                    let mut flags = Flags::empty();
                    flags.set(Flags::SIGN, (r & 0x80) != 0);
                    flags.set(Flags::ZERO, r == 0);
                    flags.set(Flags::PARITY_OVERFLOW, self.state.iff2);
                    self.finish(flags);
                },
            },

            PUSH(rp) => {
                let v = self.get_regpair(*rp);
                self.push_word(v);
            },
            POP(rp) => {
                let v = self.pop_word();
                self.set_regpair(*rp, v);
            },
            EXsp(rp) => {
                let sp = self.state.sp;
                let stack_val = self.read_word(sp);
                let reg_val = self.get_regpair(*rp);
                self.write_word(sp, reg_val);
                self.set_regpair(*rp, stack_val);
                self.state.memptr = stack_val;
            },
            EXX => {
                for i in 0..6 {
                    let tmp = self.state.reg[i];
                    self.state.reg[i] = self.state.shadow_reg[i];
                    self.state.shadow_reg[i] = tmp;
                }
            },
            EXafaf => {
                for i in 6..8 {
                    let tmp = self.state.reg[i];
                    self.state.reg[i] = self.state.shadow_reg[i];
                    self.state.shadow_reg[i] = tmp;
                }
            },
            EXhlde => {
                let hl = self.get_regpair(RegisterPair::HL);
                let de = self.get_regpair(RegisterPair::DE);
                self.set_regpair(RegisterPair::HL, de);
                self.set_regpair(RegisterPair::DE, hl);
            },

            ADDa(t) => {
                let a = self.state.get_register(Register::A);
                let v = self.get_target(t);
                let (result, flags) = add_bytes(a, v, false);
                self.state.set_register(Register::A, result);
                self.finish(flags);
            },
            ADCa(t) => {
                let a = self.state.get_register(Register::A);
                let v = self.get_target(t);
                let carry = self.state.flags().contains(Flags::CARRY);
                let (result, flags) = add_bytes(a, v, carry);
                self.state.set_register(Register::A, result);
                self.finish(flags);
            },
            SUB(t) => {
                let a = self.state.get_register(Register::A);
                let v = self.get_target(t);
                let (result, flags) = sub_bytes(a, v, false);
                self.state.set_register(Register::A, result);
                self.finish(flags);
            },
            SBCa(t) => {
                let a = self.state.get_register(Register::A);
                let v = self.get_target(t);
                let carry = self.state.flags().contains(Flags::CARRY);
                let (result, flags) = sub_bytes(a, v, carry);
                self.state.set_register(Register::A, result);
                self.finish(flags);
            },
            AND(t) => {
                let a = self.state.get_register(Register::A);
                let v = self.get_target(t);
                let (result, flags) = and_bytes(a, v);
                self.state.set_register(Register::A, result);
                self.finish(flags);
            },
            OR(t) => {
                let a = self.state.get_register(Register::A);
                let v = self.get_target(t);
                let (result, flags) = or_bytes(a, v);
                self.state.set_register(Register::A, result);
                self.finish(flags);
            },
            XOR(t) => {
                let a = self.state.get_register(Register::A);
                let v = self.get_target(t);
                let (result, flags) = xor_bytes(a, v);
                self.state.set_register(Register::A, result);
                self.finish(flags);
            },
            CP(t) => {
                let a = self.state.get_register(Register::A);
                let v = self.get_target(t);
                let (_, mut flags) = sub_bytes(a, v, false);
                flags.set(Flags::F3, (v & 0x08) != 0);
                flags.set(Flags::F5, (v & 0x20) != 0);
                self.finish(flags);
            },

            INC8(t) => {
                let v = self.get_target(t);
                let result = v.wrapping_add(1);
                let mut flags = self.state.flags() & Flags::CARRY;
                flags.set(Flags::HALF_CARRY, (v & 0x0F) == 0x0F);
                flags.set(Flags::PARITY_OVERFLOW, v == 0x7F);
                flags.set(Flags::ZERO, result == 0);
                flags.set(Flags::SIGN, (result & 0x80) != 0);
                flags.set(Flags::F3, (result & 0x08) != 0);
                flags.set(Flags::F5, (result & 0x20) != 0);
                self.set_target(t, result)?;
                self.finish(flags);
            },
            DEC8(t) => {
                let v = self.get_target(t);
                let result = v.wrapping_sub(1);
                let mut flags = (self.state.flags() & Flags::CARRY) | Flags::SUBTRACT;
                flags.set(Flags::HALF_CARRY, (v & 0x0F) == 0);
                flags.set(Flags::PARITY_OVERFLOW, v == 0x80);
                flags.set(Flags::ZERO, result == 0);
                flags.set(Flags::SIGN, (result & 0x80) != 0);
                flags.set(Flags::F3, (result & 0x08) != 0);
                flags.set(Flags::F5, (result & 0x20) != 0);
                self.set_target(t, result)?;
                self.finish(flags);
            },

            ADD16(dest, src) => {
                let a = self.get_regpair(*dest);
                let b = self.get_regpair(*src);
                self.state.memptr = a.wrapping_add(1);
                let (result, mut flags) = add_words(a, b);
                flags |= self.state.flags() & (Flags::SIGN | Flags::ZERO | Flags::PARITY_OVERFLOW);
                self.set_regpair(*dest, result);
                self.finish(flags);
            },
            ADC16(dest, src) => {
                let a = self.get_regpair(*dest);
                let b = self.get_regpair(*src);
                let carry = self.state.flags().contains(Flags::CARRY);
                self.state.memptr = a.wrapping_add(1);
                let (result, flags) = adc_words(a, b, carry);
                self.set_regpair(*dest, result);
                self.finish(flags);
            },
            SBC16(dest, src) => {
                let a = self.get_regpair(*dest);
                let b = self.get_regpair(*src);
                let carry = self.state.flags().contains(Flags::CARRY);
                self.state.memptr = a.wrapping_add(1);
                let (result, flags) = sbc_words(a, b, carry);
                self.set_regpair(*dest, result);
                self.finish(flags);
            },
            INC16(rp) => {
                let v = self.get_regpair(*rp);
                self.set_regpair(*rp, v.wrapping_add(1));
            },
            DEC16(rp) => {
                let v = self.get_regpair(*rp);
                self.set_regpair(*rp, v.wrapping_sub(1));
            },

            DAA => {
                let a = self.state.get_register(Register::A);
                let f = self.state.flags();
                let mut correction: u8 = 0;
                let mut carry = f.contains(Flags::CARRY);
                if f.contains(Flags::HALF_CARRY) || (a & 0x0F) > 9 {
                    correction |= 0x06;
                }
                if carry || a > 0x99 {
                    correction |= 0x60;
                    carry = true;
                }
                let result = if f.contains(Flags::SUBTRACT) { a.wrapping_sub(correction) } else { a.wrapping_add(correction) };
                let half = if f.contains(Flags::SUBTRACT) {
                    f.contains(Flags::HALF_CARRY) && (a & 0x0F) < 6
                } else {
                    (a & 0x0F) > 9
                };
                let mut flags = Flags::empty();
                flags.set(Flags::SUBTRACT, f.contains(Flags::SUBTRACT));
                flags.set(Flags::CARRY, carry);
                flags.set(Flags::HALF_CARRY, half);
                flags.set(Flags::ZERO, result == 0);
                flags.set(Flags::SIGN, (result & 0x80) != 0);
                flags.set(Flags::PARITY_OVERFLOW, parity_even(result));
                flags.set(Flags::F3, (result & 0x08) != 0);
                flags.set(Flags::F5, (result & 0x20) != 0);
                self.state.set_register(Register::A, result);
                self.finish(flags);
            },
            CPL => {
                let a = self.state.get_register(Register::A);
                let result = !a;
                self.state.set_register(Register::A, result);
                let mut flags = self.state.flags() | Flags::SUBTRACT | Flags::HALF_CARRY;
                flags.set(Flags::F3, (result & 0x08) != 0);
                flags.set(Flags::F5, (result & 0x20) != 0);
                self.finish(flags);
            },
            NEG => {
                let a = self.state.get_register(Register::A);
                let (result, mut flags) = sub_bytes(0, a, false);
                flags.set(Flags::PARITY_OVERFLOW, a == 0x80);
                flags.set(Flags::CARRY, a != 0);
                self.state.set_register(Register::A, result);
                self.finish(flags);
            },
            SCF => {
                let a = self.state.get_register(Register::A);
                let undocumented = (a | (self.state.flags().bits() & !self.state.q)) & 0x28;
                let mut flags = (self.state.flags() & (Flags::SIGN | Flags::ZERO | Flags::PARITY_OVERFLOW)) | Flags::CARRY;
                flags.set(Flags::F3, (undocumented & 0x08) != 0);
                flags.set(Flags::F5, (undocumented & 0x20) != 0);
                self.finish(flags);
            },
            CCF => {
                let a = self.state.get_register(Register::A);
                let was_carry = self.state.flags().contains(Flags::CARRY);
                let undocumented = (a | (self.state.flags().bits() & !self.state.q)) & 0x28;
                let mut flags = self.state.flags() & (Flags::SIGN | Flags::ZERO | Flags::PARITY_OVERFLOW);
                flags.set(Flags::HALF_CARRY, was_carry);
                flags.set(Flags::CARRY, !was_carry);
                flags.set(Flags::F3, (undocumented & 0x08) != 0);
                flags.set(Flags::F5, (undocumented & 0x20) != 0);
                self.finish(flags);
            },

            RLCA => {
                let a = self.state.get_register(Register::A);
                let result = a.rotate_left(1);
                self.state.set_register(Register::A, result);
                self.finish(rotate_acc_flags(self.state.flags(), result, (a & 0x80) != 0));
            },
            RRCA => {
                let a = self.state.get_register(Register::A);
                let result = a.rotate_right(1);
                self.state.set_register(Register::A, result);
                self.finish(rotate_acc_flags(self.state.flags(), result, (a & 0x01) != 0));
            },
            RLA => {
                let a = self.state.get_register(Register::A);
                let carry_in = self.state.flags().contains(Flags::CARRY) as u8;
                let result = (a << 1) | carry_in;
                self.state.set_register(Register::A, result);
                self.finish(rotate_acc_flags(self.state.flags(), result, (a & 0x80) != 0));
            },
            RRA => {
                let a = self.state.get_register(Register::A);
                let carry_in = self.state.flags().contains(Flags::CARRY) as u8;
                let result = (a >> 1) | (carry_in << 7);
                self.state.set_register(Register::A, result);
                self.finish(rotate_acc_flags(self.state.flags(), result, (a & 0x01) != 0));
            },

            RLC(t, copy) => {
                let v = self.get_target(t);
                let result = v.rotate_left(1);
                self.set_target(t, result)?;
                self.apply_undocumented_copy(copy, result)?;
                self.finish(rotate_flags(result, (v & 0x80) != 0));
            },
            RRC(t, copy) => {
                let v = self.get_target(t);
                let result = v.rotate_right(1);
                self.set_target(t, result)?;
                self.apply_undocumented_copy(copy, result)?;
                self.finish(rotate_flags(result, (v & 0x01) != 0));
            },
            RL(t, copy) => {
                let v = self.get_target(t);
                let carry_in = self.state.flags().contains(Flags::CARRY) as u8;
                let result = (v << 1) | carry_in;
                self.set_target(t, result)?;
                self.apply_undocumented_copy(copy, result)?;
                self.finish(rotate_flags(result, (v & 0x80) != 0));
            },
            RR(t, copy) => {
                let v = self.get_target(t);
                let carry_in = self.state.flags().contains(Flags::CARRY) as u8;
                let result = (v >> 1) | (carry_in << 7);
                self.set_target(t, result)?;
                self.apply_undocumented_copy(copy, result)?;
                self.finish(rotate_flags(result, (v & 0x01) != 0));
            },
            SLA(t, copy) => {
                let v = self.get_target(t);
                let result = v << 1;
                self.set_target(t, result)?;
                self.apply_undocumented_copy(copy, result)?;
                self.finish(rotate_flags(result, (v & 0x80) != 0));
            },
            SRA(t, copy) => {
                let v = self.get_target(t);
                let result = (v >> 1) | (v & 0x80);
                self.set_target(t, result)?;
                self.apply_undocumented_copy(copy, result)?;
                self.finish(rotate_flags(result, (v & 0x01) != 0));
            },
            SLL(t, copy) => {
                let v = self.get_target(t);
                let result = (v << 1) | 0x01;
                self.set_target(t, result)?;
                self.apply_undocumented_copy(copy, result)?;
                self.finish(rotate_flags(result, (v & 0x80) != 0));
            },
            SRL(t, copy) => {
                let v = self.get_target(t);
                let result = v >> 1;
                self.set_target(t, result)?;
                self.apply_undocumented_copy(copy, result)?;
                self.finish(rotate_flags(result, (v & 0x01) != 0));
            },

            BIT(b, t) => {
                let v = self.get_target(t);
                let set = (v & (1u8 << *b)) != 0;
                let mut flags = (self.state.flags() & Flags::CARRY) | Flags::HALF_CARRY;
                flags.set(Flags::ZERO, !set);
                flags.set(Flags::PARITY_OVERFLOW, !set);
                flags.set(Flags::SIGN, *b == 7 && set);
                // F3/F5 mirror the tested operand for register/(HL) operands;
                // for (IX+d)/(IY+d) they come from MEMPTR's high byte instead
                // (a well-known undocumented quirk of this addressing mode).
                let source = if matches!(t, Target::IndirectOffset(_, _)) { (self.state.memptr >> 8) as u8 } else { v };
                flags.set(Flags::F3, (source & 0x08) != 0);
                flags.set(Flags::F5, (source & 0x20) != 0);
                self.finish(flags);
            },
            RES(b, t, copy) => {
                let v = self.get_target(t);
                let result = v & !(1u8 << *b);
                self.set_target(t, result)?;
                self.apply_undocumented_copy(copy, result)?;
            },
            SET(b, t, copy) => {
                let v = self.get_target(t);
                let result = v | (1u8 << *b);
                self.set_target(t, result)?;
                self.apply_undocumented_copy(copy, result)?;
            },

            RLD => {
                let hl = self.get_regpair(RegisterPair::HL);
                let mem = self.get_target(&Target::IndirectReg(RegisterPair::HL));
                let a = self.state.get_register(Register::A);
                let new_a = (a & 0xF0) | (mem >> 4);
                let new_mem = (mem << 4) | (a & 0x0F);
                self.set_target(&Target::IndirectReg(RegisterPair::HL), new_mem)?;
                self.state.set_register(Register::A, new_a);
                self.state.memptr = hl.wrapping_add(1);
                self.finish(rotate_acc8_flags(self.state.flags(), new_a));
            },
            RRD => {
                let hl = self.get_regpair(RegisterPair::HL);
                let mem = self.get_target(&Target::IndirectReg(RegisterPair::HL));
                let a = self.state.get_register(Register::A);
                let new_a = (a & 0xF0) | (mem & 0x0F);
                let new_mem = (a << 4) | (mem >> 4);
                self.set_target(&Target::IndirectReg(RegisterPair::HL), new_mem)?;
                self.state.set_register(Register::A, new_a);
                self.state.memptr = hl.wrapping_add(1);
                self.finish(rotate_acc8_flags(self.state.flags(), new_a));
            },

            JP(addr) => {
                self.state.pc = *addr;
                self.state.memptr = *addr;
            },
            JPIndirect(rp) => {
                self.state.pc = self.get_regpair(*rp);
            },
            JPcc(cond, addr) => {
                self.state.memptr = *addr;
                if self.get_condition(*cond) {
                    self.state.pc = *addr;
                    return Ok(true);
                }
                return Ok(false);
            },
            JR(d) => {
                self.state.pc = (self.state.pc as i16).wrapping_add(*d as i16) as u16;
                self.state.memptr = self.state.pc;
            },
            JRcc(cond, d) => {
                if self.get_condition(*cond) {
                    self.state.pc = (self.state.pc as i16).wrapping_add(*d as i16) as u16;
                    self.state.memptr = self.state.pc;
                    return Ok(true);
                }
                return Ok(false);
            },
            DJNZ(d) => {
                let b = self.state.get_register(Register::B).wrapping_sub(1);
                self.state.set_register(Register::B, b);
                if b != 0 {
                    self.state.pc = (self.state.pc as i16).wrapping_add(*d as i16) as u16;
                    self.state.memptr = self.state.pc;
                    return Ok(true);
                }
                return Ok(false);
            },

            CALL(addr) => {
                self.push_word(self.state.pc);
                self.state.pc = *addr;
                self.state.memptr = *addr;
            },
            CALLcc(cond, addr) => {
                self.state.memptr = *addr;
                if self.get_condition(*cond) {
                    self.push_word(self.state.pc);
                    self.state.pc = *addr;
                    return Ok(true);
                }
                return Ok(false);
            },
            RET => {
                self.state.pc = self.pop_word();
                self.state.memptr = self.state.pc;
            },
            RETcc(cond) => {
                if self.get_condition(*cond) {
                    self.state.pc = self.pop_word();
                    self.state.memptr = self.state.pc;
                    return Ok(true);
                }
                return Ok(false);
            },
            RETI => {
                self.state.pc = self.pop_word();
            },
            RETN => {
                self.state.pc = self.pop_word();
                self.state.iff1 = self.state.iff2;
            },
            RST(addr) => {
                self.push_word(self.state.pc);
                self.state.pc = *addr as u16;
                self.state.memptr = *addr as u16;
            },

            HALT => {
                self.state.status = Status::Halted;
            },
            DI => {
                self.state.iff1 = false;
                self.state.iff2 = false;
            },
            EI => {
                self.state.iff1 = true;
                self.state.iff2 = true;
                self.state.ei_delay = true;
            },
            IM(mode) => {
                self.state.im = *mode;
            },

            INic(r) => {
                let port = self.get_regpair(RegisterPair::BC);
                let v = self.read_port(port);
                self.state.set_register(*r, v);
                self.finish(inout_flags(self.state.flags(), v));
            },
            INicz => {
                let port = self.get_regpair(RegisterPair::BC);
                let v = self.read_port(port);
                self.finish(inout_flags(self.state.flags(), v));
            },
            OUTic(r) => {
                let port = self.get_regpair(RegisterPair::BC);
                let v = self.state.get_register(*r);
                self.write_port(port, v);
            },
            OUTicz => {
                let port = self.get_regpair(RegisterPair::BC);
                self.write_port(port, 0);
            },
            INx(n) => {
                let a = self.state.get_register(Register::A);
                let port = ((a as u16) << 8) | (*n as u16);
                let v = self.read_port(port);
                self.state.set_register(Register::A, v);
            },
            OUTx(n) => {
                let a = self.state.get_register(Register::A);
                let port = ((a as u16) << 8) | (*n as u16);
                self.write_port(port, a);
            },

            LDI => {
                self.block_transfer(1, false);
            },
            LDD => {
                self.block_transfer(-1, false);
            },
            LDIR => return Ok(self.block_transfer(1, true)),
            LDDR => return Ok(self.block_transfer(-1, true)),
            CPI => {
                self.block_compare(1, false);
            },
            CPD => {
                self.block_compare(-1, false);
            },
            CPIR => return Ok(self.block_compare(1, true)),
            CPDR => return Ok(self.block_compare(-1, true)),
            INI => {
                self.block_in(1, false);
            },
            IND => {
                self.block_in(-1, false);
            },
            INIR => return Ok(self.block_in(1, true)),
            INDR => return Ok(self.block_in(-1, true)),
            OUTI => {
                self.block_out(1, false);
            },
            OUTD => {
                self.block_out(-1, false);
            },
            OTIR => return Ok(self.block_out(1, true)),
            OTDR => return Ok(self.block_out(-1, true)),
        }
        Ok(false)
    }

    fn block_transfer(&mut self, step: i16, repeat: bool) -> bool {
        let hl = self.get_regpair(RegisterPair::HL);
        let de = self.get_regpair(RegisterPair::DE);
        let bc = self.get_regpair(RegisterPair::BC).wrapping_sub(1);
        let value = self.read_byte(hl, false);
        self.write_byte(de, value);
        self.set_regpair(RegisterPair::HL, (hl as i16).wrapping_add(step) as u16);
        self.set_regpair(RegisterPair::DE, (de as i16).wrapping_add(step) as u16);
        self.set_regpair(RegisterPair::BC, bc);

        let a = self.state.get_register(Register::A);
        let n = a.wrapping_add(value);
        let mut flags = self.state.flags() & (Flags::SIGN | Flags::ZERO | Flags::CARRY);
        flags.set(Flags::PARITY_OVERFLOW, bc != 0);
        flags.set(Flags::F3, (n & 0x08) != 0);
        flags.set(Flags::F5, (n & 0x02) != 0);
        self.finish(flags);

        if repeat && bc != 0 {
            self.state.pc = self.state.pc.wrapping_sub(2);
            self.state.memptr = self.state.pc.wrapping_add(1);
            true
        } else {
            false
        }
    }

    fn block_compare(&mut self, step: i16, repeat: bool) -> bool {
        let hl = self.get_regpair(RegisterPair::HL);
        let bc = self.get_regpair(RegisterPair::BC).wrapping_sub(1);
        let value = self.read_byte(hl, false);
        self.set_regpair(RegisterPair::HL, (hl as i16).wrapping_add(step) as u16);
        self.set_regpair(RegisterPair::BC, bc);

        let a = self.state.get_register(Register::A);
        let (diff, sub_flags) = sub_bytes(a, value, false);
        let mut flags = (self.state.flags() & Flags::CARRY) | (sub_flags & (Flags::SIGN | Flags::ZERO | Flags::HALF_CARRY | Flags::SUBTRACT));
        flags.set(Flags::PARITY_OVERFLOW, bc != 0);
        let n = if sub_flags.contains(Flags::HALF_CARRY) { diff.wrapping_sub(1) } else { diff };
        flags.set(Flags::F3, (n & 0x08) != 0);
        flags.set(Flags::F5, (n & 0x02) != 0);
        self.finish(flags);

        self.state.memptr = (self.state.memptr as i16).wrapping_add(step) as u16;

        if repeat && bc != 0 && diff != 0 {
            self.state.pc = self.state.pc.wrapping_sub(2);
            true
        } else {
            false
        }
    }

    fn block_in(&mut self, step: i16, repeat: bool) -> bool {
        let hl = self.get_regpair(RegisterPair::HL);
        let bc = self.get_regpair(RegisterPair::BC);
        let value = self.read_port(bc);
        self.write_byte(hl, value);
        self.set_regpair(RegisterPair::HL, (hl as i16).wrapping_add(step) as u16);
        let b_after = self.state.get_register(Register::B).wrapping_sub(1);
        self.state.set_register(Register::B, b_after);

        let c_next = ((bc as u8) as i16).wrapping_add(step) as u8;
        let k = (c_next as u16).wrapping_add(value as u16);
        let mut flags = Flags::empty();
        flags.set(Flags::ZERO, b_after == 0);
        flags.set(Flags::SIGN, (b_after & 0x80) != 0);
        flags.set(Flags::SUBTRACT, (value & 0x80) != 0);
        flags.set(Flags::CARRY, k > 0xFF);
        flags.set(Flags::HALF_CARRY, k > 0xFF);
        flags.set(Flags::PARITY_OVERFLOW, parity_even(((k as u8) & 0x07) ^ b_after));
        flags.set(Flags::F3, (b_after & 0x08) != 0);
        flags.set(Flags::F5, (b_after & 0x20) != 0);
        self.finish(flags);

        if repeat && b_after != 0 {
            self.state.pc = self.state.pc.wrapping_sub(2);
            true
        } else {
            false
        }
    }

    fn block_out(&mut self, step: i16, repeat: bool) -> bool {
        let hl = self.get_regpair(RegisterPair::HL);
        let value = self.read_byte(hl, false);
        self.set_regpair(RegisterPair::HL, (hl as i16).wrapping_add(step) as u16);
        let b_after = self.state.get_register(Register::B).wrapping_sub(1);
        self.state.set_register(Register::B, b_after);
        let bc = (self.get_regpair(RegisterPair::BC) & 0x00FF) | ((b_after as u16) << 8);
        self.write_port(bc, value);

        let l_after = self.get_regpair(RegisterPair::HL) as u8;
        let k = (l_after as u16).wrapping_add(value as u16);
        let mut flags = Flags::empty();
        flags.set(Flags::ZERO, b_after == 0);
        flags.set(Flags::SIGN, (b_after & 0x80) != 0);
        flags.set(Flags::SUBTRACT, (value & 0x80) != 0);
        flags.set(Flags::CARRY, k > 0xFF);
        flags.set(Flags::HALF_CARRY, k > 0xFF);
        flags.set(Flags::PARITY_OVERFLOW, parity_even(((k as u8) & 0x07) ^ b_after));
        flags.set(Flags::F3, (b_after & 0x08) != 0);
        flags.set(Flags::F5, (b_after & 0x20) != 0);
        self.finish(flags);

        if repeat && b_after != 0 {
            self.state.pc = self.state.pc.wrapping_sub(2);
            true
        } else {
            false
        }
    }
}

struct MemFetch<'a> {
    memory: &'a mut Memory,
    addr: u16,
}

impl<'a> ByteSource for MemFetch<'a> {
    fn fetch(&mut self, is_opcode: bool) -> u8 {
        let value = self.memory.read(self.addr, is_opcode);
        self.addr = self.addr.wrapping_add(1);
        value
    }
}

fn word(hi: u8, lo: u8) -> u16 {
    ((hi as u16) << 8) | lo as u16
}

fn split(v: u16) -> (u8, u8) {
    ((v >> 8) as u8, v as u8)
}

fn parity_even(v: u8) -> bool {
    v.count_ones() % 2 == 0
}

fn is_word_target(target: &LoadTarget) -> bool {
    matches!(target, LoadTarget::DirectRegWord(_) | LoadTarget::IndirectRegWord(_) | LoadTarget::IndirectWord(_) | LoadTarget::ImmediateWord(_))
}

fn control_flow_kind(instruction: &Instruction, flags: InstructionFlags, branch_taken: bool) -> Option<ControlFlowKind> {
    let conditional_and_not_taken = flags.contains(InstructionFlags::CONDITIONAL) && !branch_taken;
    if conditional_and_not_taken {
        return None;
    }
    if flags.contains(InstructionFlags::CALL) {
        return Some(if matches!(instruction, Instruction::RST(_)) { ControlFlowKind::Rst } else { ControlFlowKind::Call });
    }
    if flags.contains(InstructionFlags::RETURN) {
        return Some(ControlFlowKind::Return);
    }
    if flags.contains(InstructionFlags::BRANCH) {
        return Some(ControlFlowKind::Jump);
    }
    None
}

fn add_bytes(a: u8, b: u8, carry: bool) -> (u8, Flags) {
    let carry_in = carry as u16;
    let result16 = a as u16 + b as u16 + carry_in;
    let result = result16 as u8;
    let half = ((a & 0x0F) + (b & 0x0F) + carry_in as u8) > 0x0F;
    let overflow = (!(a ^ b) & (a ^ result) & 0x80) != 0;
    let mut flags = Flags::empty();
    flags.set(Flags::CARRY, result16 > 0xFF);
    flags.set(Flags::HALF_CARRY, half);
    flags.set(Flags::PARITY_OVERFLOW, overflow);
    flags.set(Flags::ZERO, result == 0);
    flags.set(Flags::SIGN, (result & 0x80) != 0);
    flags.set(Flags::F3, (result & 0x08) != 0);
    flags.set(Flags::F5, (result & 0x20) != 0);
    (result, flags)
}

fn sub_bytes(a: u8, b: u8, carry: bool) -> (u8, Flags) {
    let carry_in = carry as i16;
    let result16 = a as i16 - b as i16 - carry_in;
    let result = result16 as u8;
    let half = ((a & 0x0F) as i16) - ((b & 0x0F) as i16) - carry_in < 0;
    let overflow = ((a ^ b) & (a ^ result) & 0x80) != 0;
    let mut flags = Flags::SUBTRACT;
    flags.set(Flags::CARRY, result16 < 0);
    flags.set(Flags::HALF_CARRY, half);
    flags.set(Flags::PARITY_OVERFLOW, overflow);
    flags.set(Flags::ZERO, result == 0);
    flags.set(Flags::SIGN, (result & 0x80) != 0);
    flags.set(Flags::F3, (result & 0x08) != 0);
    flags.set(Flags::F5, (result & 0x20) != 0);
    (result, flags)
}

fn and_bytes(a: u8, b: u8) -> (u8, Flags) {
    let result = a & b;
    let mut flags = Flags::HALF_CARRY;
    flags.set(Flags::ZERO, result == 0);
    flags.set(Flags::SIGN, (result & 0x80) != 0);
    flags.set(Flags::PARITY_OVERFLOW, parity_even(result));
    flags.set(Flags::F3, (result & 0x08) != 0);
    flags.set(Flags::F5, (result & 0x20) != 0);
    (result, flags)
}

fn or_bytes(a: u8, b: u8) -> (u8, Flags) {
    logic_flags(a | b)
}

fn xor_bytes(a: u8, b: u8) -> (u8, Flags) {
    logic_flags(a ^ b)
}

fn logic_flags(result: u8) -> (u8, Flags) {
    let mut flags = Flags::empty();
    flags.set(Flags::ZERO, result == 0);
    flags.set(Flags::SIGN, (result & 0x80) != 0);
    flags.set(Flags::PARITY_OVERFLOW, parity_even(result));
    flags.set(Flags::F3, (result & 0x08) != 0);
    flags.set(Flags::F5, (result & 0x20) != 0);
    (result, flags)
}

fn add_words(a: u16, b: u16) -> (u16, Flags) {
    let result = a.wrapping_add(b);
    let half = ((a & 0x0FFF) + (b & 0x0FFF)) > 0x0FFF;
    let carry = (a as u32 + b as u32) > 0xFFFF;
    let mut flags = Flags::empty();
    flags.set(Flags::HALF_CARRY, half);
    flags.set(Flags::CARRY, carry);
    flags.set(Flags::F3, ((result >> 8) & 0x08) != 0);
    flags.set(Flags::F5, ((result >> 8) & 0x20) != 0);
    (result, flags)
}

fn adc_words(a: u16, b: u16, carry: bool) -> (u16, Flags) {
    let carry_in = carry as u32;
    let result32 = a as u32 + b as u32 + carry_in;
    let result = result32 as u16;
    let half = ((a & 0x0FFF) as u32 + (b & 0x0FFF) as u32 + carry_in) > 0x0FFF;
    let overflow = (!(a ^ b) & (a ^ result) & 0x8000) != 0;
    let mut flags = Flags::empty();
    flags.set(Flags::HALF_CARRY, half);
    flags.set(Flags::CARRY, result32 > 0xFFFF);
    flags.set(Flags::PARITY_OVERFLOW, overflow);
    flags.set(Flags::ZERO, result == 0);
    flags.set(Flags::SIGN, (result & 0x8000) != 0);
    flags.set(Flags::F3, ((result >> 8) & 0x08) != 0);
    flags.set(Flags::F5, ((result >> 8) & 0x20) != 0);
    (result, flags)
}

fn sbc_words(a: u16, b: u16, carry: bool) -> (u16, Flags) {
    let carry_in = carry as i32;
    let result32 = a as i32 - b as i32 - carry_in;
    let result = result32 as u16;
    let half = ((a & 0x0FFF) as i32) - ((b & 0x0FFF) as i32) - carry_in < 0;
    let overflow = ((a ^ b) & (a ^ result) & 0x8000) != 0;
    let mut flags = Flags::SUBTRACT;
    flags.set(Flags::HALF_CARRY, half);
    flags.set(Flags::CARRY, result32 < 0);
    flags.set(Flags::PARITY_OVERFLOW, overflow);
    flags.set(Flags::ZERO, result == 0);
    flags.set(Flags::SIGN, (result & 0x8000) != 0);
    flags.set(Flags::F3, ((result >> 8) & 0x08) != 0);
    flags.set(Flags::F5, ((result >> 8) & 0x20) != 0);
    (result, flags)
}

fn rotate_acc_flags(existing: Flags, result: u8, carry_out: bool) -> Flags {
    let mut flags = existing & (Flags::SIGN | Flags::ZERO | Flags::PARITY_OVERFLOW);
    flags.set(Flags::CARRY, carry_out);
    flags.set(Flags::F3, (result & 0x08) != 0);
    flags.set(Flags::F5, (result & 0x20) != 0);
    flags
}

fn rotate_flags(result: u8, carry_out: bool) -> Flags {
    let (_, mut flags) = logic_flags(result);
    flags.set(Flags::CARRY, carry_out);
    flags
}

fn rotate_acc8_flags(existing: Flags, result: u8) -> Flags {
    let mut flags = existing & Flags::CARRY;
    flags.set(Flags::ZERO, result == 0);
    flags.set(Flags::SIGN, (result & 0x80) != 0);
    flags.set(Flags::PARITY_OVERFLOW, parity_even(result));
    flags.set(Flags::F3, (result & 0x08) != 0);
    flags.set(Flags::F5, (result & 0x20) != 0);
    flags
}

fn inout_flags(existing: Flags, result: u8) -> Flags {
    let mut flags = existing & Flags::CARRY;
    flags.set(Flags::ZERO, result == 0);
    flags.set(Flags::SIGN, (result & 0x80) != 0);
    flags.set(Flags::PARITY_OVERFLOW, parity_even(result));
    flags.set(Flags::F3, (result & 0x08) != 0);
    flags.set(Flags::F5, (result & 0x20) != 0);
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullIo;
    impl IoBus for NullIo {
        fn read_port(&mut self, _port: u16) -> u8 {
            0xFF
        }
        fn write_port(&mut self, _port: u16, _value: u8) {}
    }

    fn boot() -> Z80<NullIo> {
        let mut cpu = Z80::new(Memory::default_48k(), NullIo);
        cpu.reset();
        cpu
    }

    #[test]
    fn reset_puts_cpu_in_running_state_with_pc_zero() {
        let cpu = boot();
        assert_eq!(cpu.state.status, Status::Running);
        assert_eq!(cpu.state.pc, 0);
    }

    #[test]
    fn reset_matches_documented_register_state() {
        let cpu = boot();
        assert_eq!(cpu.state.pc, 0x0000);
        assert_eq!(cpu.state.sp, 0xFFFF);
        assert_eq!(cpu.get_regpair(RegisterPair::AF), 0xFFFF);
        assert_eq!(cpu.state.i, 0);
        assert_eq!(cpu.state.r, 0);
        assert_eq!(cpu.state.int_flags(), 0);
        assert!(!cpu.state.int_pending);
        assert!(cpu.state.int_gate);
        assert_eq!(cpu.state.total_t_states, 3);
    }

    #[test]
    fn frame_cycle_raises_interrupt_pulse_and_fires_frame_boundary() {
        let mut cpu = boot();
        // IM0/1 ack costs exactly 13 T-states; a 13-T-state frame with the
        // pulse open the whole time means the frame consists of exactly
        // that one interrupt acknowledgement.
        cpu.frame_limit = 13;
        cpu.intstart = 0;
        cpu.intlen = 13;
        cpu.state.iff1 = true;
        cpu.frame_cycle().unwrap();
        assert_eq!(cpu.state.pc, 0x0038);
        assert_eq!(cpu.frame, 1);
    }

    #[test]
    fn scf_after_a_flag_affecting_instruction_takes_the_zilog_q_path() {
        let mut cpu = boot();
        cpu.memory.direct_write(0x0000, 0x3C); // INC A
        cpu.memory.direct_write(0x0001, 0x37); // SCF
        cpu.state.set_register(Register::A, 0x00);
        cpu.step().unwrap();
        cpu.step().unwrap();
        let a = cpu.state.get_register(Register::A);
        let flags = cpu.state.flags();
        assert!(flags.contains(Flags::CARRY));
        assert_eq!(flags.contains(Flags::F3), (a & 0x08) != 0);
        assert_eq!(flags.contains(Flags::F5), (a & 0x20) != 0);
    }

    #[test]
    fn scf_with_q_zero_ors_a_with_the_untouched_flag_bits() {
        let mut cpu = boot();
        cpu.memory.direct_write(0x0000, 0x37); // SCF
        cpu.state.set_register(Register::A, 0x00);
        cpu.state.set_flags(Flags::F3 | Flags::F5);
        cpu.state.q = 0x00;
        cpu.step().unwrap();
        let flags = cpu.state.flags();
        assert_eq!(flags.bits() & 0x28, 0x28);
        assert!(flags.contains(Flags::CARRY));
    }

    #[test]
    fn ccf_with_q_equal_to_f_clears_the_undocumented_bits() {
        let mut cpu = boot();
        cpu.memory.direct_write(0x0000, 0x3F); // CCF
        cpu.state.set_register(Register::A, 0x00);
        cpu.state.set_flags(Flags::F3 | Flags::F5 | Flags::CARRY);
        cpu.state.q = 0x28;
        cpu.step().unwrap();
        let flags = cpu.state.flags();
        assert_eq!(flags.bits() & 0x28, 0x00);
        assert!(!flags.contains(Flags::CARRY));
    }

    #[test]
    fn q_resets_to_zero_after_an_instruction_that_does_not_touch_flags() {
        let mut cpu = boot();
        cpu.memory.direct_write(0x0000, 0x00); // NOP
        cpu.state.q = 0x28;
        cpu.step().unwrap();
        assert_eq!(cpu.state.q, 0x00);
    }

    #[test]
    fn ld_bc_nn_loads_immediate_word() {
        let mut cpu = boot();
        cpu.memory.direct_write(0x0000, 0x01);
        cpu.memory.direct_write(0x0001, 0x34);
        cpu.memory.direct_write(0x0002, 0x12);
        cpu.step().unwrap();
        assert_eq!(cpu.get_regpair(RegisterPair::BC), 0x1234);
    }

    #[test]
    fn execution_breakpoint_pauses_before_instruction_runs() {
        let mut cpu = boot();
        cpu.memory.direct_write(0x0000, 0x00);
        cpu.breakpoints.add_execution(0x0000, zxcore::DEFAULT_GROUP);
        let consumed = cpu.step().unwrap();
        assert_eq!(consumed, 0);
        assert!(cpu.is_paused());
    }

    #[test]
    fn silent_analyzer_breakpoint_fires_on_breakpoint_hit_without_pausing() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use zxcore::Analyzer;

        static HIT: AtomicBool = AtomicBool::new(false);

        struct Watcher;
        impl Analyzer for Watcher {
            fn name(&self) -> &str {
                "watcher"
            }
            fn on_breakpoint_hit(&mut self, _breakpoint_id: u32, _pc: u16) {
                HIT.store(true, Ordering::SeqCst);
            }
        }

        HIT.store(false, Ordering::SeqCst);
        let mut cpu = boot();
        cpu.memory.direct_write(0x0000, 0x00); // NOP
        let owner = cpu.analyzers.register(Box::new(Watcher), None, None, None);
        let bp = cpu.breakpoints.add_execution(0x0000, zxcore::DEFAULT_GROUP);
        cpu.breakpoints.set_owner(bp, Some(owner)).unwrap();

        let consumed = cpu.step().unwrap();
        assert!(HIT.load(Ordering::SeqCst));
        assert!(!cpu.is_paused());
        assert!(consumed > 0);
    }

    #[test]
    fn halt_holds_pc_until_interrupt() {
        let mut cpu = boot();
        cpu.memory.direct_write(0x0000, 0x76); // HALT
        cpu.step().unwrap();
        assert_eq!(cpu.state.status, Status::Halted);
        cpu.step().unwrap();
        assert_eq!(cpu.state.status, Status::Halted);
        cpu.state.iff1 = true;
        cpu.request_int();
        cpu.step().unwrap();
        assert_eq!(cpu.state.status, Status::Running);
        assert_eq!(cpu.state.pc, 0x0038);
    }
}
