//! Typed breakpoint engine (spec.md §4.3).
//!
//! Breakpoints are indexed by kind so the CPU hot path never scans the
//! full set: `handle_pc_change` only ever touches the execution index,
//! `handle_memory_read`/`handle_memory_write` only the memory index, and
//! so on. Each descriptor carries a stable id used for removal and for
//! analyzer ownership bookkeeping.

use bitflags::bitflags;
use std::collections::HashMap;

use crate::error::Error;

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct AccessMask: u8 {
        const READ    = 0b0000_0001;
        const WRITE   = 0b0000_0010;
        const EXECUTE = 0b0000_0100;
        const IN      = 0b0000_1000;
        const OUT     = 0b0001_0000;
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BreakpointKind {
    Execute,
    Memory,
    Io,
    Keyboard,
}

pub const DEFAULT_GROUP: &str = "default";

#[derive(Clone, Debug)]
pub struct BreakpointDescriptor {
    pub id: u32,
    pub kind: BreakpointKind,
    pub address: u16,
    pub mask: AccessMask,
    pub group: String,
    pub note: Option<String>,
    pub active: bool,
    /// Set when an analyzer owns this breakpoint: hits are dispatched
    /// silently to that analyzer rather than published on the event bus
    /// and never pause the CPU (spec.md §4.5).
    pub owner_analyzer_id: Option<u32>,
}

pub struct BreakpointEngine {
    next_id: u32,
    breakpoints: HashMap<u32, BreakpointDescriptor>,
    /// address -> ids, restricted to BreakpointKind::Execute
    exec_index: HashMap<u16, Vec<u32>>,
    /// address -> ids, restricted to BreakpointKind::Memory
    memory_index: HashMap<u16, Vec<u32>>,
    /// port -> ids, restricted to BreakpointKind::Io
    io_index: HashMap<u16, Vec<u32>>,
    keyboard_index: Vec<u32>,
}

impl Default for BreakpointEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl BreakpointEngine {
    pub fn new() -> Self {
        BreakpointEngine {
            next_id: 1,
            breakpoints: HashMap::new(),
            exec_index: HashMap::new(),
            memory_index: HashMap::new(),
            io_index: HashMap::new(),
            keyboard_index: Vec::new(),
        }
    }

    fn index_for(&mut self, kind: BreakpointKind) -> Option<&mut HashMap<u16, Vec<u32>>> {
        match kind {
            BreakpointKind::Execute => Some(&mut self.exec_index),
            BreakpointKind::Memory => Some(&mut self.memory_index),
            BreakpointKind::Io => Some(&mut self.io_index),
            BreakpointKind::Keyboard => None,
        }
    }

    /// Adds a breakpoint, deduplicating against an existing descriptor
    /// with the same `(kind, address, mask)` in the same group — the
    /// existing id is returned and reactivated rather than a duplicate
    /// being created.
    pub fn add(&mut self, kind: BreakpointKind, address: u16, mask: AccessMask, group: &str) -> u32 {
        if let Some(existing) = self.breakpoints.values_mut().find(|b| {
            b.kind == kind && b.address == address && b.mask == mask && b.group == group
        }) {
            existing.active = true;
            return existing.id;
        }

        let id = self.next_id;
        self.next_id += 1;

        let descriptor = BreakpointDescriptor {
            id,
            kind,
            address,
            mask,
            group: group.to_string(),
            note: None,
            active: true,
            owner_analyzer_id: None,
        };
        self.breakpoints.insert(id, descriptor);

        match kind {
            BreakpointKind::Keyboard => self.keyboard_index.push(id),
            _ => self.index_for(kind).unwrap().entry(address).or_default().push(id),
        }

        id
    }

    pub fn add_execution(&mut self, address: u16, group: &str) -> u32 {
        self.add(BreakpointKind::Execute, address, AccessMask::EXECUTE, group)
    }

    pub fn add_combined_memory(&mut self, address: u16, mask: AccessMask, group: &str) -> u32 {
        self.add(BreakpointKind::Memory, address, mask, group)
    }

    pub fn add_combined_port(&mut self, port: u16, mask: AccessMask, group: &str) -> u32 {
        self.add(BreakpointKind::Io, port, mask, group)
    }

    /// Marks a breakpoint as owned by an analyzer: hits are dispatched
    /// silently (no bus post, no pause) to that analyzer only.
    pub fn set_owner(&mut self, id: u32, analyzer_id: Option<u32>) -> Result<(), Error> {
        self.breakpoints.get_mut(&id).ok_or(Error::UnknownId(id))?.owner_analyzer_id = analyzer_id;
        Ok(())
    }

    pub fn remove_by_id(&mut self, id: u32) -> Result<(), Error> {
        let descriptor = self.breakpoints.remove(&id).ok_or(Error::UnknownId(id))?;
        match descriptor.kind {
            BreakpointKind::Keyboard => self.keyboard_index.retain(|&i| i != id),
            _ => {
                if let Some(ids) = self.index_for(descriptor.kind).unwrap().get_mut(&descriptor.address) {
                    ids.retain(|&i| i != id);
                }
            },
        }
        Ok(())
    }

    pub fn remove_by_descriptor(&mut self, kind: BreakpointKind, address: u16, mask: AccessMask) -> Result<(), Error> {
        let id = self
            .breakpoints
            .values()
            .find(|b| b.kind == kind && b.address == address && b.mask == mask)
            .map(|b| b.id)
            .ok_or(Error::other("no matching breakpoint"))?;
        self.remove_by_id(id)
    }

    /// Removes every breakpoint owned by `analyzer_id` (called on
    /// analyzer deactivation).
    pub fn remove_owned_by(&mut self, analyzer_id: u32) {
        let ids: Vec<u32> = self
            .breakpoints
            .values()
            .filter(|b| b.owner_analyzer_id == Some(analyzer_id))
            .map(|b| b.id)
            .collect();
        for id in ids {
            let _ = self.remove_by_id(id);
        }
    }

    pub fn clear(&mut self) {
        self.breakpoints.clear();
        self.exec_index.clear();
        self.memory_index.clear();
        self.io_index.clear();
        self.keyboard_index.clear();
    }

    pub fn activate(&mut self, id: u32) -> Result<(), Error> {
        self.breakpoints.get_mut(&id).ok_or(Error::UnknownId(id))?.active = true;
        Ok(())
    }

    pub fn deactivate(&mut self, id: u32) -> Result<(), Error> {
        self.breakpoints.get_mut(&id).ok_or(Error::UnknownId(id))?.active = false;
        Ok(())
    }

    pub fn set_group(&mut self, id: u32, group: &str) -> Result<(), Error> {
        self.breakpoints.get_mut(&id).ok_or(Error::UnknownId(id))?.group = group.to_string();
        Ok(())
    }

    pub fn set_note(&mut self, id: u32, note: Option<String>) -> Result<(), Error> {
        self.breakpoints.get_mut(&id).ok_or(Error::UnknownId(id))?.note = note;
        Ok(())
    }

    pub fn get(&self, id: u32) -> Option<&BreakpointDescriptor> {
        self.breakpoints.get(&id)
    }

    pub fn all(&self) -> impl Iterator<Item = &BreakpointDescriptor> {
        self.breakpoints.values()
    }

    pub fn by_group<'a>(&'a self, group: &'a str) -> impl Iterator<Item = &'a BreakpointDescriptor> {
        self.breakpoints.values().filter(move |b| b.group == group)
    }

    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.breakpoints.values().map(|b| b.group.clone()).collect();
        groups.sort();
        groups.dedup();
        groups
    }

    fn matches_at(index: &HashMap<u16, Vec<u32>>, breakpoints: &HashMap<u32, BreakpointDescriptor>, addr: u16, mask: AccessMask) -> Vec<u32> {
        index
            .get(&addr)
            .into_iter()
            .flatten()
            .filter(|id| {
                breakpoints.get(id).map(|b| b.active && b.mask.intersects(mask)).unwrap_or(false)
            })
            .copied()
            .collect()
    }

    /// Hot path: called on every M1 fetch with the instruction's PC.
    pub fn handle_pc_change(&self, pc: u16) -> Vec<u32> {
        Self::matches_at(&self.exec_index, &self.breakpoints, pc, AccessMask::EXECUTE)
    }

    pub fn handle_memory_read(&self, addr: u16) -> Vec<u32> {
        Self::matches_at(&self.memory_index, &self.breakpoints, addr, AccessMask::READ)
    }

    pub fn handle_memory_write(&self, addr: u16) -> Vec<u32> {
        Self::matches_at(&self.memory_index, &self.breakpoints, addr, AccessMask::WRITE)
    }

    pub fn handle_port_in(&self, port: u16) -> Vec<u32> {
        Self::matches_at(&self.io_index, &self.breakpoints, port, AccessMask::IN)
    }

    pub fn handle_port_out(&self, port: u16) -> Vec<u32> {
        Self::matches_at(&self.io_index, &self.breakpoints, port, AccessMask::OUT)
    }

    pub fn handle_keyboard_event(&self) -> Vec<u32> {
        self.keyboard_index
            .iter()
            .filter(|id| self.breakpoints.get(id).map(|b| b.active).unwrap_or(false))
            .copied()
            .collect()
    }

    /// True if the hit at `id` should stay internal to its owning
    /// analyzer (no event bus post, no pause).
    pub fn is_silent(&self, id: u32) -> bool {
        self.breakpoints.get(&id).map(|b| b.owner_analyzer_id.is_some()).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_add_reuses_id_and_reactivates() {
        let mut engine = BreakpointEngine::new();
        let id1 = engine.add_execution(0x8000, DEFAULT_GROUP);
        engine.deactivate(id1).unwrap();
        let id2 = engine.add_execution(0x8000, DEFAULT_GROUP);
        assert_eq!(id1, id2);
        assert!(engine.get(id1).unwrap().active);
    }

    #[test]
    fn execution_breakpoint_fires_only_on_its_address() {
        let mut engine = BreakpointEngine::new();
        engine.add_execution(0x8000, DEFAULT_GROUP);
        assert_eq!(engine.handle_pc_change(0x8000).len(), 1);
        assert!(engine.handle_pc_change(0x8001).is_empty());
    }

    #[test]
    fn memory_breakpoint_respects_access_mask() {
        let mut engine = BreakpointEngine::new();
        engine.add_combined_memory(0x4000, AccessMask::WRITE, DEFAULT_GROUP);
        assert!(engine.handle_memory_read(0x4000).is_empty());
        assert_eq!(engine.handle_memory_write(0x4000).len(), 1);
    }

    #[test]
    fn owned_breakpoints_are_silent_and_removed_with_owner() {
        let mut engine = BreakpointEngine::new();
        let id = engine.add_execution(0x8000, DEFAULT_GROUP);
        engine.set_owner(id, Some(7)).unwrap();
        assert!(engine.is_silent(id));

        engine.remove_owned_by(7);
        assert!(engine.get(id).is_none());
        assert!(engine.handle_pc_change(0x8000).is_empty());
    }

    #[test]
    fn deactivated_breakpoint_does_not_fire() {
        let mut engine = BreakpointEngine::new();
        let id = engine.add_execution(0x8000, DEFAULT_GROUP);
        engine.deactivate(id).unwrap();
        assert!(engine.handle_pc_change(0x8000).is_empty());
    }
}
