use std::sync::LazyLock;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::SpliceConfig;
use crate::errors::AbortCause;
use crate::host::Host;
use crate::metadata::ModChange;
use crate::Result;

use super::{Stage, Update, UpdateStatus};

/// The process-wide registry. Holding the lock serializes every apply and
/// reverse in the process.
pub static REGISTRY: LazyLock<Mutex<Registry>> =
    LazyLock::new(|| Mutex::new(Registry::new(SpliceConfig::default())));

/// Module holding one change's replacement code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchModule {
    pub kid: String,
    /// Target the replacement code belongs to, `None` for the core image
    pub target: Option<String>,
    pub primary: String,
    pub applied: bool,
}

/// All known updates, grouped by id. Reached through [`REGISTRY`].
#[derive(Debug)]
pub struct Registry {
    config: SpliceConfig,
    updates: Vec<Update>,
}

impl Registry {
    pub(crate) fn new(config: SpliceConfig) -> Self {
        Self {
            config,
            updates: Vec::new(),
        }
    }

    pub fn config(&self) -> &SpliceConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: SpliceConfig) {
        self.config = config;
    }

    pub fn kids(&self) -> Vec<String> {
        self.updates.iter().map(|u| u.kid().to_string()).collect()
    }

    pub fn update(&self, kid: &str) -> Option<&Update> {
        self.updates.iter().find(|u| u.kid() == kid)
    }

    fn update_mut(&mut self, kid: &str) -> Result<&mut Update> {
        self.updates
            .iter_mut()
            .find(|u| u.kid() == kid)
            .ok_or_else(|| AbortCause::unexpected(format!("no update {}", kid)))
    }

    /// Adds `change` to the update named by its `kid`, creating the update
    /// on first use.
    pub fn register_change(&mut self, change: ModChange) -> Result<()> {
        let kid = change.kid.clone();
        if self.update(&kid).is_none() {
            log::debug!(target: "libsplice", "new update {}", kid);
            self.updates.push(Update::new(kid.as_str(), self.config.clone()));
        }

        log::info!("Registering change {} for update {}", change.name, kid);
        self.update_mut(&kid)?.add_change(change)
    }

    /// Removes a change. An update left without changes is forgotten unless
    /// it is applied.
    pub fn unregister_change(&mut self, kid: &str, name: &str) -> Result<()> {
        let update = self.update_mut(kid)?;
        update.remove_change(name)?;

        if update.changes().is_empty() && update.stage() != Stage::Applied {
            self.updates.retain(|u| u.kid() != kid);
        }
        Ok(())
    }

    /// Replacement code modules of every registered update
    pub fn patch_modules(&self) -> Vec<PatchModule> {
        self.updates.iter().flat_map(Update::patch_modules).collect()
    }

    pub fn apply(&mut self, kid: &str, host: &dyn Host) -> Result<()> {
        let modules = self.patch_modules();
        self.update_mut(kid)?.apply(host, &modules)
    }

    pub fn reverse(&mut self, kid: &str, host: &dyn Host) -> Result<()> {
        self.update_mut(kid)?.reverse(host)
    }

    pub fn status(&self, kid: &str) -> Option<UpdateStatus> {
        self.update(kid).map(Update::status)
    }

    pub fn set_debug(&mut self, kid: &str, level: u8) -> Result<()> {
        self.update_mut(kid)?.set_debug(level);
        Ok(())
    }
}
