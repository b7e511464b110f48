//! Banked memory, breakpoints, event bus, analyzer framework and
//! control-flow trace buffer for a debug-capable Z80 core. The Z80
//! interpreter and disassembler themselves live in the `zxcore-z80`
//! crate, which depends on this one.

pub mod analyzer;
pub mod breakpoints;
pub mod error;
pub mod eventbus;
pub mod memory;
pub mod trace;

pub use crate::analyzer::{Analyzer, AnalyzerId, AnalyzerManager, SubscriptionId};
pub use crate::breakpoints::{AccessMask, BreakpointDescriptor, BreakpointEngine, BreakpointKind, DEFAULT_GROUP};
pub use crate::error::{Error, UNMAPPABLE};
pub use crate::eventbus::{Event, EventBus, TopicId};
pub use crate::memory::{BankMode, Memory, MemoryObserver, PageRegion, PAGE_SIZE};
pub use crate::trace::{BankSnapshot, ControlFlowEvent, ControlFlowKind, TraceBuffer};
