//! Two-tier control-flow trace buffer (spec.md §4.7).
//!
//! Every taken jump, call, return, `RST` and interrupt acknowledgement is
//! logged through `log_if_control_flow`. A small hot ring holds the most
//! recent events uncompressed so the CPU hot path pays only a bounded
//! `VecDeque` push; once it overflows, the oldest event is folded into
//! the cold ring, where consecutive equivalent events (a tight loop) are
//! compressed into a single entry plus a repeat count rather than being
//! stored one-by-one.

use std::collections::VecDeque;
use std::fmt::Write as _;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ControlFlowKind {
    Call,
    Jump,
    Return,
    Rst,
    Interrupt,
}

/// A bank's mapping at the moment an event was logged, per spec.md §3's
/// `{is_rom, page}` pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BankSnapshot {
    pub is_rom: bool,
    pub page: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlFlowEvent {
    pub m1_pc: u16,
    pub target_addr: u16,
    pub kind: ControlFlowKind,
    pub banks: [BankSnapshot; 4],
    pub opcode_bytes: Vec<u8>,
    /// `F` register at the moment of the event.
    pub flags: u8,
    /// `SP` at the moment of the event.
    pub sp: u16,
    /// The three words at the top of the stack, closest first — captured
    /// unconditionally so `RET`/`RETI` events have the return address
    /// (and the two words beneath it) without a second memory pass.
    pub stack_top: [u16; 3],
}

impl ControlFlowEvent {
    /// Two events are equivalent for loop-count compression purposes
    /// when every field but the frame number, flags and stack snapshot
    /// matches — a tight loop re-derives the same flags/stack shape each
    /// pass, but comparing them would defeat compression on the first
    /// flag-affected iteration.
    fn equivalent(&self, other: &ControlFlowEvent) -> bool {
        self.m1_pc == other.m1_pc
            && self.target_addr == other.target_addr
            && self.kind == other.kind
            && self.banks == other.banks
            && self.opcode_bytes == other.opcode_bytes
    }
}

struct HotEntry {
    event: ControlFlowEvent,
    frame: u64,
}

struct ColdEntry {
    event: ControlFlowEvent,
    first_frame: u64,
    last_frame: u64,
    repeat_count: u32,
}

pub struct TraceBuffer {
    hot_capacity: usize,
    cold_capacity: usize,
    hot: VecDeque<HotEntry>,
    cold: VecDeque<ColdEntry>,
}

impl TraceBuffer {
    pub fn new(hot_capacity: usize, cold_capacity: usize) -> Self {
        TraceBuffer {
            hot_capacity: hot_capacity.max(1),
            cold_capacity: cold_capacity.max(1),
            hot: VecDeque::with_capacity(hot_capacity),
            cold: VecDeque::with_capacity(cold_capacity),
        }
    }

    /// Logs a control-flow event, pushing it into the hot ring and
    /// spilling the oldest hot entry into the cold ring (with
    /// compression) if the hot ring is at capacity. A no-op call site
    /// decision — whether a given instruction actually constitutes
    /// control flow — is the caller's to make; this method always logs.
    pub fn log_if_control_flow(&mut self, event: ControlFlowEvent, frame: u64) {
        self.hot.push_back(HotEntry { event, frame });
        while self.hot.len() > self.hot_capacity {
            self.spill_oldest_hot();
        }
    }

    fn spill_oldest_hot(&mut self) {
        let Some(HotEntry { event, frame }) = self.hot.pop_front() else { return };

        if let Some(last) = self.cold.back_mut() {
            if last.event.equivalent(&event) {
                last.repeat_count += 1;
                last.last_frame = frame;
                return;
            }
        }

        if self.cold.len() >= self.cold_capacity {
            self.cold.pop_front();
        }
        self.cold.push_back(ColdEntry { event, first_frame: frame, last_frame: frame, repeat_count: 1 });
    }

    /// Drops cold entries whose last occurrence is more than
    /// `retain_frames` behind `current_frame`. Called on frame boundaries
    /// so a trace left running doesn't grow without bound from the cold
    /// side even though entries there are already compressed.
    pub fn on_frame_boundary(&mut self, current_frame: u64, retain_frames: u64) {
        while let Some(front) = self.cold.front() {
            if current_frame.saturating_sub(front.last_frame) > retain_frames {
                self.cold.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.hot.len() + self.cold.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recent events first, cold (compressed, oldest) entries
    /// trailing behind the hot (uncompressed, newest) ones.
    pub fn recent(&self, limit: usize) -> Vec<(ControlFlowEvent, u32, u64)> {
        let mut out: Vec<(ControlFlowEvent, u32, u64)> = self.latest_hot(limit);
        if out.len() < limit {
            out.extend(self.latest_cold(limit - out.len()));
        }
        out
    }

    /// Most recent `limit` hot-ring entries, newest first.
    pub fn latest_hot(&self, limit: usize) -> Vec<(ControlFlowEvent, u32, u64)> {
        self.hot.iter().rev().take(limit).map(|e| (e.event.clone(), 1, e.frame)).collect()
    }

    /// Most recent `limit` cold-ring entries, newest first.
    pub fn latest_cold(&self, limit: usize) -> Vec<(ControlFlowEvent, u32, u64)> {
        self.cold.iter().rev().take(limit).map(|e| (e.event.clone(), e.repeat_count, e.last_frame)).collect()
    }

    /// Every cold-ring entry, newest first.
    pub fn all_cold(&self) -> Vec<(ControlFlowEvent, u32, u64)> {
        self.latest_cold(self.cold.len())
    }

    /// Textual save format: one YAML-style record per entry, newest
    /// first, carrying every field spec.md §6 names: `idx`, `m1_pc`,
    /// `type`, `target`, `flags`, `loop_count`, `sp`, `opcodes`, `banks`
    /// (4x `{is_rom, page}`), `stack_top` (3 words).
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for (idx, (event, repeat_count, frame)) in self.recent(self.len()).into_iter().enumerate() {
            let bytes: Vec<String> = event.opcode_bytes.iter().map(|b| format!("{:02X}", b)).collect();
            let banks: Vec<String> =
                event.banks.iter().map(|b| format!("{{is_rom: {}, page: {}}}", b.is_rom, b.page)).collect();
            let stack_top: Vec<String> = event.stack_top.iter().map(|w| format!("{:04X}", w)).collect();
            writeln!(
                out,
                "- idx: {}\n  frame: {}\n  m1_pc: {:#06X}\n  type: {:?}\n  target: {:#06X}\n  flags: {:#04X}\n  loop_count: {}\n  sp: {:#06X}\n  opcodes: [{}]\n  banks: [{}]\n  stack_top: [{}]",
                idx,
                frame,
                event.m1_pc,
                event.kind,
                event.target_addr,
                event.flags,
                repeat_count,
                event.sp,
                bytes.join(", "),
                banks.join(", "),
                stack_top.join(", "),
            )
            .unwrap();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(pc: u16, target: u16) -> ControlFlowEvent {
        ControlFlowEvent {
            m1_pc: pc,
            target_addr: target,
            kind: ControlFlowKind::Jump,
            banks: [
                BankSnapshot { is_rom: true, page: 0 },
                BankSnapshot { is_rom: false, page: 5 },
                BankSnapshot { is_rom: false, page: 2 },
                BankSnapshot { is_rom: false, page: 0 },
            ],
            opcode_bytes: vec![0xC3],
            flags: 0,
            sp: 0xFFFF,
            stack_top: [0, 0, 0],
        }
    }

    #[test]
    fn hot_ring_spills_into_cold_on_overflow() {
        let mut trace = TraceBuffer::new(2, 8);
        trace.log_if_control_flow(sample(0x8000, 0x8100), 0);
        trace.log_if_control_flow(sample(0x8100, 0x8200), 1);
        assert_eq!(trace.len(), 2);
        trace.log_if_control_flow(sample(0x8200, 0x8300), 2);
        assert_eq!(trace.len(), 3);
    }

    #[test]
    fn repeated_loop_body_compresses_in_cold_ring() {
        let mut trace = TraceBuffer::new(1, 8);
        for frame in 0..5u64 {
            trace.log_if_control_flow(sample(0x8000, 0x8000), frame);
        }
        // hot ring holds the very latest, the rest collapsed into one cold entry.
        assert_eq!(trace.cold.len(), 1);
        assert_eq!(trace.cold.back().unwrap().repeat_count, 4);
    }

    #[test]
    fn frame_boundary_eviction_drops_stale_cold_entries() {
        let mut trace = TraceBuffer::new(1, 8);
        trace.log_if_control_flow(sample(0x8000, 0x8100), 0);
        trace.log_if_control_flow(sample(0x9000, 0x9100), 100);
        trace.on_frame_boundary(100, 10);
        assert_eq!(trace.cold.len(), 1);
        assert_eq!(trace.cold.front().unwrap().event.m1_pc, 0x9000);
    }

    #[test]
    fn to_text_marks_compressed_runs() {
        let mut trace = TraceBuffer::new(1, 8);
        for frame in 0..3u64 {
            trace.log_if_control_flow(sample(0x8000, 0x8000), frame);
        }
        let text = trace.to_text();
        assert!(text.contains("loop_count: 2"));
        assert!(text.contains("stack_top:"));
        assert!(text.contains("is_rom:"));
    }
}
