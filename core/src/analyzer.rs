//! Pluggable analyzer framework (spec.md §4.5).
//!
//! Analyzers register hooks in three dispatch tiers:
//!
//! - hot: plain function pointers called on every `cpu_step` and every
//!   memory access. No allocation, no virtual dispatch.
//! - warm: boxed closures called on `video_line`/`audio_sample` — far
//!   less frequent than the hot path, so the closure-call overhead is
//!   immaterial.
//! - cold: full trait-object dispatch on frame boundaries and breakpoint
//!   hits, where per-call cost is irrelevant.
//!
//! An analyzer that owns an execution breakpoint receives hits through
//! `on_breakpoint_hit` directly; the breakpoint engine marks that
//! breakpoint silent so it never also reaches the event bus or pauses
//! the CPU (see `crate::breakpoints::BreakpointEngine::is_silent`).

use std::collections::HashMap;

use log::debug;

use crate::breakpoints::{AccessMask, BreakpointEngine, DEFAULT_GROUP};
use crate::error::Error;
use crate::memory::MemoryObserver;

pub type AnalyzerId = u32;
pub type SubscriptionId = u32;

/// Cold-path trait every analyzer implements. Hot hooks
/// (`cpu_step`/`memory_read`/`memory_write`) are registered separately as
/// plain function pointers so the CPU's inner loop never pays for
/// virtual dispatch; this trait covers activation and the infrequent
/// events.
pub trait Analyzer {
    fn name(&self) -> &str;

    fn on_activate(&mut self) {}
    fn on_deactivate(&mut self) {}

    fn on_frame_boundary(&mut self, _frame: u64) {}
    fn on_frame_start(&mut self, _frame: u64) {}
    fn on_frame_end(&mut self, _frame: u64) {}
    fn on_breakpoint_hit(&mut self, _breakpoint_id: u32, _pc: u16) {}
    fn on_video_line(&mut self, _line: u16) {}
    fn on_audio_sample(&mut self, _left: i16, _right: i16) {}
}

type HotStepFn = fn(&mut dyn Analyzer, u64);
type HotMemFn = fn(&mut dyn Analyzer, u16, u8, bool);

struct Entry {
    analyzer: Box<dyn Analyzer>,
    active: bool,
    cpu_step_hook: Option<HotStepFn>,
    memory_read_hook: Option<HotMemFn>,
    memory_write_hook: Option<HotMemFn>,
}

/// A warm-path closure subscription — independent of any `Entry`, so a
/// caller can observe video/audio events without implementing the full
/// `Analyzer` trait. Tagged with an owning analyzer id purely for
/// `unsubscribe_all` bookkeeping; the owner need not itself be registered.
enum WarmSubscriber {
    VideoLine(Box<dyn FnMut(u16) + Send>),
    AudioSample(Box<dyn FnMut(i16, i16) + Send>),
}

struct WarmSubscription {
    owner: AnalyzerId,
    subscriber: WarmSubscriber,
}

/// Owns every registered analyzer and fans out hot/warm/cold events to
/// the active ones. Implements `MemoryObserver` so a `Memory` in debug
/// mode can dispatch directly into it without the two crates knowing
/// about each other's concrete types.
pub struct AnalyzerManager {
    next_id: AnalyzerId,
    entries: HashMap<AnalyzerId, Entry>,
    next_sub_id: SubscriptionId,
    warm_subs: HashMap<SubscriptionId, WarmSubscription>,
    /// Breakpoint ids acquired through `request_execution_breakpoint`/
    /// `request_memory_breakpoint`, so `unsubscribe_all`/`unregister` can
    /// hand them back to the caller's `BreakpointEngine` for release.
    owned_breakpoints: HashMap<AnalyzerId, Vec<u32>>,
}

impl Default for AnalyzerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AnalyzerManager {
    pub fn new() -> Self {
        AnalyzerManager {
            next_id: 1,
            entries: HashMap::new(),
            next_sub_id: 1,
            warm_subs: HashMap::new(),
            owned_breakpoints: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        analyzer: Box<dyn Analyzer>,
        cpu_step_hook: Option<HotStepFn>,
        memory_read_hook: Option<HotMemFn>,
        memory_write_hook: Option<HotMemFn>,
    ) -> AnalyzerId {
        let id = self.next_id;
        self.next_id += 1;
        debug!("analyzer: registering {:?} as id {}", analyzer.name(), id);
        self.entries.insert(id, Entry { analyzer, active: true, cpu_step_hook, memory_read_hook, memory_write_hook });
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.analyzer.on_activate();
        }
        id
    }

    /// Unregisters `id`, releasing every warm subscription it owns. Its
    /// breakpoints are left for the caller to release through
    /// `release_all_breakpoints` — the manager has no `BreakpointEngine`
    /// of its own to release them against.
    pub fn unregister(&mut self, id: AnalyzerId) -> Result<(), Error> {
        let mut entry = self.entries.remove(&id).ok_or(Error::UnknownId(id))?;
        entry.analyzer.on_deactivate();
        self.warm_subs.retain(|_, sub| sub.owner != id);
        Ok(())
    }

    pub fn activate(&mut self, id: AnalyzerId) -> Result<(), Error> {
        let entry = self.entries.get_mut(&id).ok_or(Error::UnknownId(id))?;
        if !entry.active {
            entry.active = true;
            entry.analyzer.on_activate();
        }
        Ok(())
    }

    /// Operating on an unknown id is a no-op, per spec's failure contract
    /// for `activate`/`deactivate` on IDs that don't (or no longer) exist.
    pub fn activate_all(&mut self) {
        let ids: Vec<AnalyzerId> = self.entries.keys().copied().collect();
        for id in ids {
            let _ = self.activate(id);
        }
    }

    pub fn deactivate_all(&mut self) {
        let ids: Vec<AnalyzerId> = self.entries.keys().copied().collect();
        for id in ids {
            let _ = self.deactivate(id);
        }
    }

    pub fn is_active(&self, id: AnalyzerId) -> bool {
        self.entries.get(&id).map(|e| e.active).unwrap_or(false)
    }

    pub fn registered(&self) -> Vec<AnalyzerId> {
        self.entries.keys().copied().collect()
    }

    pub fn active(&self) -> Vec<AnalyzerId> {
        self.entries.iter().filter(|(_, e)| e.active).map(|(id, _)| *id).collect()
    }

    /// Sets (or replaces) `id`'s hot `cpu_step` hook after registration —
    /// the spec's `subscribe_cpu_step` named as a standalone operation,
    /// implemented as a field update on the existing entry rather than a
    /// second subscription table, since a hot hook's lifetime is already
    /// exactly the analyzer's own.
    pub fn subscribe_cpu_step(&mut self, id: AnalyzerId, hook: HotStepFn) -> Result<(), Error> {
        self.entries.get_mut(&id).ok_or(Error::UnknownId(id))?.cpu_step_hook = Some(hook);
        Ok(())
    }

    pub fn subscribe_memory_read(&mut self, id: AnalyzerId, hook: HotMemFn) -> Result<(), Error> {
        self.entries.get_mut(&id).ok_or(Error::UnknownId(id))?.memory_read_hook = Some(hook);
        Ok(())
    }

    pub fn subscribe_memory_write(&mut self, id: AnalyzerId, hook: HotMemFn) -> Result<(), Error> {
        self.entries.get_mut(&id).ok_or(Error::UnknownId(id))?.memory_write_hook = Some(hook);
        Ok(())
    }

    /// Warm-path closure subscription, independent of the `Analyzer`
    /// trait's own `on_video_line` hook — lets a caller observe video
    /// timing without registering a full analyzer.
    pub fn subscribe_video_line(&mut self, owner_id: AnalyzerId, closure: impl FnMut(u16) + Send + 'static) -> SubscriptionId {
        let id = self.next_sub_id;
        self.next_sub_id += 1;
        self.warm_subs.insert(id, WarmSubscription { owner: owner_id, subscriber: WarmSubscriber::VideoLine(Box::new(closure)) });
        id
    }

    pub fn subscribe_audio_sample(&mut self, owner_id: AnalyzerId, closure: impl FnMut(i16, i16) + Send + 'static) -> SubscriptionId {
        let id = self.next_sub_id;
        self.next_sub_id += 1;
        self.warm_subs.insert(id, WarmSubscription { owner: owner_id, subscriber: WarmSubscriber::AudioSample(Box::new(closure)) });
        id
    }

    /// Operating on an unknown subscription id is a no-op.
    pub fn unsubscribe(&mut self, sub_id: SubscriptionId) {
        self.warm_subs.remove(&sub_id);
    }

    /// Releases every warm subscription owned by `owner_id`. Hot hooks and
    /// breakpoints owned by a registered analyzer are released by
    /// `unregister`/`release_all_breakpoints` respectively.
    pub fn unsubscribe_all(&mut self, owner_id: AnalyzerId) {
        self.warm_subs.retain(|_, sub| sub.owner != owner_id);
    }

    /// Acquires an execution breakpoint on `owner_id`'s behalf and marks
    /// it silent, so hits reach `owner_id.on_breakpoint_hit` without also
    /// posting to the event bus or pausing the CPU (spec.md §4.5's
    /// silent-dispatch contract).
    pub fn request_execution_breakpoint(&mut self, engine: &mut BreakpointEngine, addr: u16, owner_id: AnalyzerId) -> Result<u32, Error> {
        let id = engine.add_execution(addr, DEFAULT_GROUP);
        engine.set_owner(id, Some(owner_id))?;
        self.owned_breakpoints.entry(owner_id).or_default().push(id);
        Ok(id)
    }

    pub fn request_memory_breakpoint(&mut self, engine: &mut BreakpointEngine, addr: u16, on_read: bool, on_write: bool, owner_id: AnalyzerId) -> Result<u32, Error> {
        let mut mask = AccessMask::empty();
        mask.set(AccessMask::READ, on_read);
        mask.set(AccessMask::WRITE, on_write);
        let id = engine.add_combined_memory(addr, mask, DEFAULT_GROUP);
        engine.set_owner(id, Some(owner_id))?;
        self.owned_breakpoints.entry(owner_id).or_default().push(id);
        Ok(id)
    }

    pub fn release_breakpoint(&mut self, engine: &mut BreakpointEngine, bp_id: u32) -> Result<(), Error> {
        for ids in self.owned_breakpoints.values_mut() {
            ids.retain(|&id| id != bp_id);
        }
        engine.remove_by_id(bp_id)
    }

    /// Releases every breakpoint `owner_id` acquired through
    /// `request_execution_breakpoint`/`request_memory_breakpoint`. Call
    /// this alongside `unregister`/`unsubscribe_all` when an analyzer goes
    /// away entirely.
    pub fn release_all_breakpoints(&mut self, engine: &mut BreakpointEngine, owner_id: AnalyzerId) {
        if let Some(ids) = self.owned_breakpoints.remove(&owner_id) {
            for id in ids {
                let _ = engine.remove_by_id(id);
            }
        }
    }

    pub fn deactivate(&mut self, id: AnalyzerId) -> Result<(), Error> {
        let entry = self.entries.get_mut(&id).ok_or(Error::UnknownId(id))?;
        if entry.active {
            entry.active = false;
            entry.analyzer.on_deactivate();
        }
        Ok(())
    }

    pub fn is_registered(&self, id: AnalyzerId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Hot path: called once per retired instruction.
    pub fn dispatch_cpu_step(&mut self, t_states: u64) {
        for entry in self.entries.values_mut().filter(|e| e.active) {
            if let Some(hook) = entry.cpu_step_hook {
                hook(entry.analyzer.as_mut(), t_states);
            }
        }
    }

    pub fn dispatch_frame_boundary(&mut self, frame: u64) {
        for entry in self.entries.values_mut().filter(|e| e.active) {
            entry.analyzer.on_frame_boundary(frame);
        }
    }

    pub fn dispatch_frame_start(&mut self, frame: u64) {
        for entry in self.entries.values_mut().filter(|e| e.active) {
            entry.analyzer.on_frame_start(frame);
        }
    }

    pub fn dispatch_frame_end(&mut self, frame: u64) {
        for entry in self.entries.values_mut().filter(|e| e.active) {
            entry.analyzer.on_frame_end(frame);
        }
    }

    /// Cold path: called for a breakpoint hit owned by `analyzer_id`.
    /// Does not touch the event bus — the breakpoint engine marked this
    /// hit silent precisely so it wouldn't.
    pub fn dispatch_breakpoint_hit(&mut self, analyzer_id: AnalyzerId, breakpoint_id: u32, pc: u16) {
        if let Some(entry) = self.entries.get_mut(&analyzer_id) {
            if entry.active {
                entry.analyzer.on_breakpoint_hit(breakpoint_id, pc);
            }
        }
    }

    pub fn dispatch_video_line(&mut self, line: u16) {
        for entry in self.entries.values_mut().filter(|e| e.active) {
            entry.analyzer.on_video_line(line);
        }
        for sub in self.warm_subs.values_mut() {
            if let WarmSubscriber::VideoLine(closure) = &mut sub.subscriber {
                closure(line);
            }
        }
    }

    pub fn dispatch_audio_sample(&mut self, left: i16, right: i16) {
        for entry in self.entries.values_mut().filter(|e| e.active) {
            entry.analyzer.on_audio_sample(left, right);
        }
        for sub in self.warm_subs.values_mut() {
            if let WarmSubscriber::AudioSample(closure) = &mut sub.subscriber {
                closure(left, right);
            }
        }
    }
}

impl MemoryObserver for AnalyzerManager {
    fn on_read(&mut self, addr: u16, value: u8, is_execution: bool) {
        for entry in self.entries.values_mut().filter(|e| e.active) {
            if let Some(hook) = entry.memory_read_hook {
                hook(entry.analyzer.as_mut(), addr, value, is_execution);
            }
        }
    }

    fn on_write(&mut self, addr: u16, value: u8) {
        for entry in self.entries.values_mut().filter(|e| e.active) {
            if let Some(hook) = entry.memory_write_hook {
                hook(entry.analyzer.as_mut(), addr, value, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    static STEP_COUNT: AtomicU32 = AtomicU32::new(0);

    struct CountingAnalyzer;

    impl Analyzer for CountingAnalyzer {
        fn name(&self) -> &str {
            "counting"
        }
    }

    fn count_step(_a: &mut dyn Analyzer, _t_states: u64) {
        STEP_COUNT.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn hot_hook_fires_only_while_active() {
        STEP_COUNT.store(0, Ordering::SeqCst);
        let mut mgr = AnalyzerManager::new();
        let id = mgr.register(Box::new(CountingAnalyzer), Some(count_step), None, None);
        mgr.dispatch_cpu_step(4);
        assert_eq!(STEP_COUNT.load(Ordering::SeqCst), 1);

        mgr.deactivate(id).unwrap();
        mgr.dispatch_cpu_step(4);
        assert_eq!(STEP_COUNT.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unregister_removes_the_analyzer() {
        let mut mgr = AnalyzerManager::new();
        let id = mgr.register(Box::new(CountingAnalyzer), None, None, None);
        assert!(mgr.is_registered(id));
        mgr.unregister(id).unwrap();
        assert!(!mgr.is_registered(id));
    }

    #[test]
    fn activate_all_and_deactivate_all_cover_every_registered_id() {
        let mut mgr = AnalyzerManager::new();
        let a = mgr.register(Box::new(CountingAnalyzer), None, None, None);
        let b = mgr.register(Box::new(CountingAnalyzer), None, None, None);
        mgr.deactivate_all();
        assert!(!mgr.is_active(a));
        assert!(!mgr.is_active(b));
        assert_eq!(mgr.active(), Vec::<AnalyzerId>::new());

        mgr.activate_all();
        assert!(mgr.is_active(a));
        assert!(mgr.is_active(b));
        let mut active = mgr.active();
        active.sort();
        assert_eq!(active, vec![a, b]);

        let mut registered = mgr.registered();
        registered.sort();
        assert_eq!(registered, vec![a, b]);
    }

    #[test]
    fn is_active_is_false_for_an_unknown_id() {
        let mgr = AnalyzerManager::new();
        assert!(!mgr.is_active(999));
    }

    #[test]
    fn video_line_subscription_fires_independently_of_the_analyzer_trait() {
        let mut mgr = AnalyzerManager::new();
        let owner = mgr.register(Box::new(CountingAnalyzer), None, None, None);
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let sub = mgr.subscribe_video_line(owner, move |line| seen_clone.lock().unwrap().push(line));

        mgr.dispatch_video_line(42);
        assert_eq!(*seen.lock().unwrap(), vec![42]);

        mgr.unsubscribe(sub);
        mgr.dispatch_video_line(43);
        assert_eq!(*seen.lock().unwrap(), vec![42]);
    }

    #[test]
    fn unsubscribe_all_releases_every_warm_subscription_for_an_owner() {
        let mut mgr = AnalyzerManager::new();
        let owner = mgr.register(Box::new(CountingAnalyzer), None, None, None);
        let hits = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let hits_clone = hits.clone();
        mgr.subscribe_video_line(owner, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        let hits_clone2 = hits.clone();
        mgr.subscribe_audio_sample(owner, move |_, _| {
            hits_clone2.fetch_add(1, Ordering::SeqCst);
        });

        mgr.unsubscribe_all(owner);
        mgr.dispatch_video_line(1);
        mgr.dispatch_audio_sample(0, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn requested_execution_breakpoint_is_owned_and_released_as_a_group() {
        use crate::breakpoints::BreakpointEngine;

        let mut mgr = AnalyzerManager::new();
        let mut engine = BreakpointEngine::new();
        let owner = mgr.register(Box::new(CountingAnalyzer), None, None, None);

        let bp = mgr.request_execution_breakpoint(&mut engine, 0x8000, owner).unwrap();
        assert!(engine.is_silent(bp));

        mgr.release_all_breakpoints(&mut engine, owner);
        assert!(engine.remove_by_id(bp).is_err());
    }

    #[test]
    fn release_breakpoint_removes_it_from_its_owner_group_too() {
        use crate::breakpoints::BreakpointEngine;

        let mut mgr = AnalyzerManager::new();
        let mut engine = BreakpointEngine::new();
        let owner = mgr.register(Box::new(CountingAnalyzer), None, None, None);

        let bp = mgr.request_memory_breakpoint(&mut engine, 0x4000, true, false, owner).unwrap();
        mgr.release_breakpoint(&mut engine, bp).unwrap();
        assert!(engine.remove_by_id(bp).is_err());

        // Already removed from the owner's group, so releasing the whole
        // group again must not try to double-remove it.
        mgr.release_all_breakpoints(&mut engine, owner);
    }
}
