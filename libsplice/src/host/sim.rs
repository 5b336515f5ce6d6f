use std::collections::VecDeque;

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};

use super::*;
use crate::errors::MemoryError;
use crate::image::{MemoryResult, SimImage};
use crate::matcher::X86Decoder;

#[derive(Debug, Clone)]
struct SimModule {
    info: ModuleInfo,
    symbols: Vec<(String, u64)>,
    refcount: usize,
    uses: Vec<String>,
}

#[derive(Debug, Default)]
struct SimState {
    exports: AHashMap<String, u64>,
    core_symbols: Vec<(String, u64)>,
    core_text: (u64, u64),
    modules: Vec<SimModule>,
    tasks: Vec<Task>,
    exception_table: AHashMap<u64, u64>,
    bug_table: AHashMap<u64, u64>,
    trace_entries: Vec<u64>,
}

/// A complete host kept in memory: image, symbol tables, modules and tasks.
pub struct SimHost {
    image: SimImage,
    decoder: X86Decoder,
    gate: PauseGate,
    state: RwLock<SimState>,
    schedule: Mutex<VecDeque<Vec<Task>>>,
}

impl Default for SimHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SimHost {
    pub fn new() -> Self {
        Self::with_decoder(X86Decoder::new(64))
    }

    pub fn with_decoder(decoder: X86Decoder) -> Self {
        Self {
            image: SimImage::new(),
            decoder,
            gate: PauseGate::new(),
            state: RwLock::new(SimState::default()),
            schedule: Mutex::new(VecDeque::new()),
        }
    }

    pub fn image(&self) -> &SimImage {
        &self.image
    }

    pub fn gate(&self) -> &PauseGate {
        &self.gate
    }

    pub fn map(&self, base: u64, bytes: Vec<u8>) {
        self.image.map(base, bytes);
    }

    pub fn set_core_text(&self, start: u64, end: u64) {
        self.state.write().core_text = (start, end);
    }

    pub fn add_core_symbol(&self, name: &str, addr: u64) {
        self.state.write().core_symbols.push((name.to_string(), addr));
    }

    pub fn add_export(&self, name: &str, addr: u64) {
        self.state.write().exports.insert(name.to_string(), addr);
    }

    pub fn add_module(&self, info: ModuleInfo) {
        self.state.write().modules.push(SimModule {
            info,
            symbols: Vec::new(),
            refcount: 0,
            uses: Vec::new(),
        });
    }

    pub fn add_module_symbol(&self, module: &str, name: &str, addr: u64) {
        let mut state = self.state.write();
        if let Some(m) = state.modules.iter_mut().find(|m| m.info.name == module) {
            m.symbols.push((name.to_string(), addr));
        }
    }

    /// Reference held by someone outside the engine
    pub fn hold_module(&self, module: &str) -> bool {
        self.try_module_get(module)
    }

    pub fn module_uses(&self, module: &str) -> Vec<String> {
        self.state
            .read()
            .modules
            .iter()
            .find(|m| m.info.name == module)
            .map(|m| m.uses.clone())
            .unwrap_or_default()
    }

    pub fn add_exception_entry(&self, insn: u64, entry: u64) {
        self.state.write().exception_table.insert(insn, entry);
    }

    pub fn add_bug_entry(&self, insn: u64, entry: u64) {
        self.state.write().bug_table.insert(insn, entry);
    }

    pub fn add_trace_entry(&self, addr: u64) {
        self.state.write().trace_entries.push(addr);
    }

    /// Replaces the task list. Waits for any pause in progress, so a
    /// stopped machine never sees its tasks move.
    pub fn set_tasks(&self, tasks: Vec<Task>) {
        let _running = self.gate.enter();
        self.state.write().tasks = tasks;
    }

    /// Task lists installed one per pause, the last one stays
    pub fn schedule_tasks(&self, snapshots: Vec<Vec<Task>>) {
        self.schedule.lock().extend(snapshots);
    }

    pub fn pause_count(&self) -> usize {
        self.gate.pause_count()
    }

    pub fn export_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.read().exports.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Memory for SimHost {
    fn read(&self, addr: u64, buf: &mut [u8]) -> bool {
        self.image.read(addr, buf)
    }

    fn write(&self, addr: u64, bytes: &[u8]) -> MemoryResult<()> {
        self.image.write(addr, bytes)?;
        match self.image.read_vec(addr, bytes.len()) {
            Some(check) if check == bytes => Ok(()),
            _ => Err(MemoryError::VerificationFailed(addr)),
        }
    }
}

impl SymbolSource for SimHost {
    fn exported_symbol(&self, name: &str) -> Option<u64> {
        self.state.read().exports.get(name).copied()
    }

    fn core_symbols(&self, name: &str) -> Vec<u64> {
        self.state
            .read()
            .core_symbols
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, addr)| *addr)
            .collect()
    }

    fn module_symbols(&self, module: &str, name: &str) -> Vec<u64> {
        self.state
            .read()
            .modules
            .iter()
            .filter(|m| m.info.name == module)
            .flat_map(|m| m.symbols.iter())
            .filter(|(n, _)| n == name)
            .map(|(_, addr)| *addr)
            .collect()
    }

    fn rename_export(&self, name: &str, new_name: &str) -> bool {
        let mut state = self.state.write();
        match state.exports.remove(name) {
            Some(addr) => {
                state.exports.insert(new_name.to_string(), addr);
                true
            }
            None => false,
        }
    }

    fn exception_entry(&self, addr: u64) -> Option<u64> {
        self.state.read().exception_table.get(&addr).copied()
    }

    fn bug_entry(&self, addr: u64) -> Option<u64> {
        self.state.read().bug_table.get(&addr).copied()
    }

    fn is_trace_entry(&self, addr: u64) -> bool {
        self.state.read().trace_entries.contains(&addr)
    }
}

impl ModuleSource for SimHost {
    fn modules(&self) -> Vec<ModuleInfo> {
        self.state.read().modules.iter().map(|m| m.info.clone()).collect()
    }

    fn core_text(&self) -> (u64, u64) {
        self.state.read().core_text
    }

    fn module_refcount(&self, name: &str) -> usize {
        self.state
            .read()
            .modules
            .iter()
            .find(|m| m.info.name == name)
            .map_or(0, |m| m.refcount)
    }

    fn try_module_get(&self, name: &str) -> bool {
        let mut state = self.state.write();
        match state.modules.iter_mut().find(|m| m.info.name == name) {
            Some(m) => {
                m.refcount += 1;
                true
            }
            None => false,
        }
    }

    fn module_put(&self, name: &str) {
        let mut state = self.state.write();
        if let Some(m) = state.modules.iter_mut().find(|m| m.info.name == name) {
            m.refcount = m.refcount.saturating_sub(1);
        }
    }

    fn use_module(&self, user: &str, dependency: &str) -> bool {
        let mut state = self.state.write();
        if !state.modules.iter().any(|m| m.info.name == dependency) {
            return false;
        }
        match state.modules.iter_mut().find(|m| m.info.name == user) {
            Some(m) => {
                if !m.uses.iter().any(|u| u == dependency) {
                    m.uses.push(dependency.to_string());
                }
                true
            }
            None => false,
        }
    }
}

impl TaskSource for SimHost {
    fn tasks(&self) -> Vec<Task> {
        self.state.read().tasks.clone()
    }
}

impl StopMachine for SimHost {
    fn stop_machine(&self, callback: &mut dyn FnMut() -> Result<()>) -> Result<()> {
        if let Some(next) = self.schedule.lock().pop_front() {
            self.state.write().tasks = next;
        }
        self.gate.pause(callback)
    }
}

impl Host for SimHost {
    fn decoder(&self) -> &dyn InsnDecoder {
        &self.decoder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(name: &str, base: u64) -> ModuleInfo {
        ModuleInfo {
            name: name.to_string(),
            base,
            size: 0x1000,
            text_size: 0x800,
        }
    }

    #[test]
    fn test_module_address_lookup() {
        let host = SimHost::new();
        host.add_module(module("ext4", 0x10_0000));

        assert_eq!(host.module_text_address(0x10_0010).as_deref(), Some("ext4"));
        assert_eq!(host.module_text_address(0x10_0900), None);
        assert_eq!(host.module_data_address(0x10_0900).as_deref(), Some("ext4"));
    }

    #[test]
    fn test_refcounts_and_dependencies() {
        let host = SimHost::new();
        host.add_module(module("splice_new", 0x20_0000));
        host.add_module(module("ext4", 0x10_0000));

        assert!(host.try_module_get("splice_new"));
        assert!(host.hold_module("splice_new"));
        assert_eq!(host.module_refcount("splice_new"), 2);
        host.module_put("splice_new");
        assert_eq!(host.module_refcount("splice_new"), 1);

        assert!(host.use_module("splice_new", "ext4"));
        assert!(!host.use_module("splice_new", "missing"));
        assert_eq!(host.module_uses("splice_new"), vec!["ext4".to_string()]);
    }

    #[test]
    fn test_rename_export() {
        let host = SimHost::new();
        host.add_export("printk", 0x1000);

        assert!(host.rename_export("printk", "printk_old"));
        assert_eq!(host.exported_symbol("printk"), None);
        assert_eq!(host.exported_symbol("printk_old"), Some(0x1000));
        assert!(!host.rename_export("printk", "again"));
    }

    #[test]
    fn test_scheduled_tasks_advance_per_pause() {
        let host = SimHost::new();
        let task = |pid| Task {
            pid,
            name: "worker".into(),
            state: TaskState::Sleeping,
            ip: 0,
            sp: 0,
            stack_base: 0,
            stack_top: 0,
        };
        host.schedule_tasks(vec![vec![task(1)], vec![task(2)]]);

        let mut seen = Vec::new();
        for _ in 0..3 {
            host.stop_machine(&mut || {
                seen.push(host.tasks()[0].pid);
                Ok(())
            })
            .unwrap();
        }
        assert_eq!(seen, vec![1, 2, 2]);
        assert_eq!(host.pause_count(), 3);
    }

    #[test]
    fn test_task_list_frozen_during_pause() {
        let host = SimHost::new();
        let task = Task {
            pid: 9,
            name: "worker".into(),
            state: TaskState::Sleeping,
            ip: 0,
            sp: 0,
            stack_base: 0,
            stack_top: 0,
        };

        std::thread::scope(|s| {
            host.stop_machine(&mut || {
                let writer = s.spawn(|| host.set_tasks(vec![task.clone()]));
                std::thread::sleep(std::time::Duration::from_millis(20));
                assert!(!writer.is_finished());
                assert!(host.tasks().is_empty());
                Ok(())
            })
            .unwrap();
        });
        assert_eq!(host.tasks()[0].pid, 9);
    }
}
