//! Execution-safety check: no context may be executing, or about to return
//! into, code the update replaces.

use serde::{Deserialize, Serialize};

use crate::config::SpliceConfig;
use crate::errors::AbortCause;
use crate::host::{Host, Task, TaskState};
use crate::Result;

/// Live range that must be idle while the world is paused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyRecord {
    pub addr: u64,
    pub size: u64,
    /// Label of the section the range was matched for
    pub label: String,
}

impl SafetyRecord {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr - self.addr < self.size
    }
}

/// One address inspected for a context: its instruction pointer or a word
/// found on its stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub addr: u64,
    /// Label of the safety record containing `addr`
    pub label: Option<String>,
}

impl Frame {
    pub fn has_conflict(&self) -> bool {
        self.label.is_some()
    }
}

/// A context that blocked the pause, with everything checked for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    pub process_name: String,
    pub pid: u32,
    pub frames: Vec<Frame>,
}

impl Conflict {
    /// `name pid label...`, one label per conflicting frame
    pub fn report_line(&self) -> String {
        let mut line = format!("{} {}", self.process_name, self.pid);
        for label in self.frames.iter().filter_map(|f| f.label.as_deref()) {
            line.push(' ');
            line.push_str(label);
        }
        line
    }
}

/// Joined report lines of `conflicts`
pub fn conflict_report(conflicts: &[Conflict]) -> String {
    conflicts
        .iter()
        .map(|c| format!("{}\n", c.report_line()))
        .collect()
}

struct TaskCheck<'a> {
    records: &'a [SafetyRecord],
    frames: Vec<Frame>,
    busy: bool,
}

impl TaskCheck<'_> {
    fn check_address(&mut self, addr: u64) {
        let label = self
            .records
            .iter()
            .find(|r| r.contains(addr))
            .map(|r| r.label.clone());
        self.busy |= label.is_some();
        self.frames.push(Frame { addr, label });
    }

    /// Every word from `sp` up to the top of the stack
    fn check_stack(&mut self, host: &dyn Host, task: &Task, word: u64) {
        if task.sp < task.stack_base {
            return;
        }
        let mut at = task.sp;
        while at.checked_add(word).is_some_and(|end| end <= task.stack_top) {
            let mut buf = [0u8; 8];
            if !host.read(at, &mut buf[..word as usize]) {
                break;
            }
            self.check_address(u64::from_le_bytes(buf));
            at += word;
        }
    }
}

/// Inspects every context against `records`.
///
/// Conflicting contexts are collected into `conflicts`. A context found
/// running on another processor that is not the pause helper cannot be
/// inspected at all, which outranks any busy range.
pub fn check_each_task(
    host: &dyn Host,
    config: &SpliceConfig,
    records: &[SafetyRecord],
    conflicts: &mut Vec<Conflict>,
) -> Result<()> {
    let word = u64::from((config.bitness / 8).clamp(2, 8));
    let mut status = Ok(());

    for task in host.tasks() {
        let mut check = TaskCheck {
            records,
            frames: Vec::new(),
            busy: false,
        };
        check.check_address(task.ip);

        let mut unexpected = false;
        match task.state {
            TaskState::Current | TaskState::Sleeping => check.check_stack(host, &task, word),
            TaskState::Running => unexpected = !config.is_stop_helper(&task.name),
        }

        if check.busy || unexpected {
            log::debug!(
                target: "libsplice",
                "stack check: pid {} ({}) busy={} running={}",
                task.pid,
                task.name,
                check.busy,
                unexpected
            );
            conflicts.push(Conflict {
                process_name: task.name.clone(),
                pid: task.pid,
                frames: check.frames,
            });
        }
        if unexpected {
            status = Err(AbortCause::UnexpectedRunningTask);
        } else if check.busy && status.is_ok() {
            status = Err(AbortCause::CodeBusy);
        }
    }

    status
}
