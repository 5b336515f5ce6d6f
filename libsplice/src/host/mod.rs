//! Capabilities the engine needs from the system it patches.
//!
//! The engine never touches the host directly: symbol tables, module
//! bookkeeping, the task list and the stop-the-world primitive all come
//! through these traits. [`SimHost`] implements them in memory.

mod pause;
mod sim;

pub use pause::*;
pub use sim::*;

use serde::{Deserialize, Serialize};

use crate::image::Memory;
use crate::matcher::InsnDecoder;
use crate::Result;

/// A loaded extension module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub base: u64,
    pub size: u64,
    /// Leading part of `[base, base + size)` holding code
    pub text_size: u64,
}

impl ModuleInfo {
    pub fn contains_text(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.text_size
    }

    pub fn contains_data(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// The context running the safety check
    Current,
    /// On a CPU right now
    Running,
    /// Descheduled, registers saved
    Sleeping,
}

/// One schedulable context as seen while the world is paused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub pid: u32,
    pub name: String,
    pub state: TaskState,
    pub ip: u64,
    /// Saved stack pointer, or the frame address for the current context
    pub sp: u64,
    pub stack_base: u64,
    pub stack_top: u64,
}

pub trait SymbolSource {
    fn exported_symbol(&self, name: &str) -> Option<u64>;

    /// Every core image symbol named `name`
    fn core_symbols(&self, name: &str) -> Vec<u64>;

    /// Every symbol named `name` in `module`
    fn module_symbols(&self, module: &str, name: &str) -> Vec<u64>;

    /// Renames an export in place. Returns false if `name` is not exported.
    fn rename_export(&self, name: &str, new_name: &str) -> bool;

    /// Exception table entry covering the faulting instruction at `addr`
    fn exception_entry(&self, addr: u64) -> Option<u64>;

    /// Bug table entry for the trap instruction at `addr`
    fn bug_entry(&self, addr: u64) -> Option<u64>;

    /// True if `addr` is an instrumentation entry point (mcount and friends)
    fn is_trace_entry(&self, addr: u64) -> bool;
}

pub trait ModuleSource {
    fn modules(&self) -> Vec<ModuleInfo>;

    /// Text range of the core image
    fn core_text(&self) -> (u64, u64);

    fn module_text_address(&self, addr: u64) -> Option<String> {
        self.modules()
            .into_iter()
            .find(|m| m.contains_text(addr))
            .map(|m| m.name)
    }

    fn module_data_address(&self, addr: u64) -> Option<String> {
        self.modules()
            .into_iter()
            .find(|m| m.contains_data(addr))
            .map(|m| m.name)
    }

    fn module_refcount(&self, name: &str) -> usize;

    fn try_module_get(&self, name: &str) -> bool;

    fn module_put(&self, name: &str);

    /// Records that `user` depends on `dependency`
    fn use_module(&self, user: &str, dependency: &str) -> bool;
}

pub trait TaskSource {
    fn tasks(&self) -> Vec<Task>;
}

pub trait StopMachine {
    /// Runs `callback` with every other context unable to make progress
    fn stop_machine(&self, callback: &mut dyn FnMut() -> Result<()>) -> Result<()>;
}

/// Everything an update needs from the patched system
pub trait Host: Memory + SymbolSource + ModuleSource + TaskSource + StopMachine {
    fn decoder(&self) -> &dyn InsnDecoder;
}
