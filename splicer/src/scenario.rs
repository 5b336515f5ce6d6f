use std::path::{Path, PathBuf};

use libsplice::host::{ModuleInfo, Task};
use libsplice::{ModChange, SimHost, SpliceConfig};
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScenarioError {
    #[error("Failed to read scenario {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed scenario: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Region at 0x{base:X} has bad hex: {reason}")]
    BadHex { base: u64, reason: String },

    #[error("No change named {0} in scenario")]
    UnknownChange(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamedAddr {
    pub name: String,
    pub addr: u64,
}

/// Bytes mapped at `base`, written as space separated hex
#[derive(Debug, Clone, Deserialize)]
pub struct Region {
    pub base: u64,
    pub hex: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModuleSpec {
    #[serde(flatten)]
    pub info: ModuleInfo,
    #[serde(default)]
    pub symbols: Vec<NamedAddr>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableEntry {
    pub insn: u64,
    pub entry: u64,
}

/// Simulated system the scenario runs against
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostSpec {
    pub regions: Vec<Region>,
    pub core_text: Option<(u64, u64)>,
    pub core_symbols: Vec<NamedAddr>,
    pub exports: Vec<NamedAddr>,
    pub modules: Vec<ModuleSpec>,
    pub tasks: Vec<Task>,
    pub bug_entries: Vec<TableEntry>,
    pub exception_entries: Vec<TableEntry>,
    pub trace_entries: Vec<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Register {
        change: String,
    },
    Unregister {
        kid: String,
        change: String,
    },
    Apply {
        kid: String,
        #[serde(default = "ok")]
        expect: String,
    },
    Reverse {
        kid: String,
        #[serde(default = "ok")]
        expect: String,
    },
    Status {
        kid: String,
    },
    SetDebug {
        kid: String,
        level: u8,
    },
    SetTasks {
        tasks: Vec<Task>,
    },
    HoldModule {
        module: String,
    },
    ReleaseModule {
        module: String,
    },
}

fn ok() -> String {
    "ok".to_string()
}

impl Step {
    pub fn op(&self) -> &'static str {
        match self {
            Step::Register { .. } => "register",
            Step::Unregister { .. } => "unregister",
            Step::Apply { .. } => "apply",
            Step::Reverse { .. } => "reverse",
            Step::Status { .. } => "status",
            Step::SetDebug { .. } => "set_debug",
            Step::SetTasks { .. } => "set_tasks",
            Step::HoldModule { .. } => "hold_module",
            Step::ReleaseModule { .. } => "release_module",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub config: SpliceConfig,
    #[serde(default)]
    pub host: HostSpec,
    #[serde(default)]
    pub changes: Vec<ModChange>,
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self, ScenarioError> {
        let text = std::fs::read_to_string(path).map_err(|source| ScenarioError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ScenarioError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn change(&self, name: &str) -> Result<&ModChange, ScenarioError> {
        self.changes
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| ScenarioError::UnknownChange(name.to_string()))
    }

    pub fn build_host(&self) -> Result<SimHost, ScenarioError> {
        let spec = &self.host;
        let host = SimHost::new();

        for region in &spec.regions {
            host.map(region.base, parse_hex(region)?);
        }
        if let Some((start, end)) = spec.core_text {
            host.set_core_text(start, end);
        }
        for sym in &spec.core_symbols {
            host.add_core_symbol(&sym.name, sym.addr);
        }
        for sym in &spec.exports {
            host.add_export(&sym.name, sym.addr);
        }
        for module in &spec.modules {
            host.add_module(module.info.clone());
            for sym in &module.symbols {
                host.add_module_symbol(&module.info.name, &sym.name, sym.addr);
            }
        }
        for entry in &spec.bug_entries {
            host.add_bug_entry(entry.insn, entry.entry);
        }
        for entry in &spec.exception_entries {
            host.add_exception_entry(entry.insn, entry.entry);
        }
        for addr in &spec.trace_entries {
            host.add_trace_entry(*addr);
        }
        host.set_tasks(spec.tasks.clone());

        log::debug!(
            "Built host for {}: {} region(s), {} module(s), {} task(s)",
            self.name,
            spec.regions.len(),
            spec.modules.len(),
            spec.tasks.len()
        );
        Ok(host)
    }
}

fn parse_hex(region: &Region) -> Result<Vec<u8>, ScenarioError> {
    let bad = |reason: String| ScenarioError::BadHex {
        base: region.base,
        reason,
    };

    let digits: Vec<u8> = region
        .hex
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if digits.len() % 2 != 0 {
        return Err(bad("odd number of digits".into()));
    }

    digits
        .chunks(2)
        .map(|pair| {
            let s = std::str::from_utf8(pair).map_err(|e| bad(e.to_string()))?;
            u8::from_str_radix(s, 16).map_err(|e| bad(format!("{:?}: {}", s, e)))
        })
        .collect()
}
