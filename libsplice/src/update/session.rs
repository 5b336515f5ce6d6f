use std::thread;

use serde::Serialize;

use crate::common::{spdebug, DebugLog};
use crate::config::SpliceConfig;
use crate::errors::AbortCause;
use crate::host::Host;
use crate::matcher::{match_change_sections, MatchCtx};
use crate::metadata::{ExportEntry, ModChange, PatchKind};
use crate::reloc::{add_dependency_on_address, apply_new_relocs, RelocIndex};
use crate::resolver::{require_singular, LookupScope};
use crate::safety::{check_each_task, conflict_report, Conflict, SafetyRecord};
use crate::Result;

use super::{PatchModule, PatchSite, Stage};

/// What the status interface reports for one update
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateStatus {
    pub kid: String,
    pub stage: Stage,
    /// `ok` or the name of the last abort cause
    pub abort_cause: String,
    /// Human readable form of the abort cause
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort_detail: Option<String>,
    pub debug: u8,
    /// One `name pid label...` line per conflicting context
    pub conflicts: Vec<String>,
    pub debug_log: String,
    pub changes: Vec<String>,
}

/// Output of preparing one change
struct Prepared {
    sites: Vec<PatchSite>,
    records: Vec<SafetyRecord>,
}

/// A set of changes applied and reversed as one unit
#[derive(Debug)]
pub struct Update {
    kid: String,
    config: SpliceConfig,
    changes: Vec<ModChange>,
    stage: Stage,
    abort_cause: Option<AbortCause>,
    conflicts: Vec<Conflict>,
    log: DebugLog,
    sites: Vec<PatchSite>,
    renamed: Vec<ExportEntry>,
    /// Ranges that must be idle for the next transition
    safety_records: Vec<SafetyRecord>,
}

impl Update {
    pub fn new(kid: impl Into<String>, config: SpliceConfig) -> Self {
        let log = DebugLog::new(config.debug);
        Self {
            kid: kid.into(),
            config,
            changes: Vec::new(),
            stage: Stage::Preparing,
            abort_cause: None,
            conflicts: Vec::new(),
            log,
            sites: Vec::new(),
            renamed: Vec::new(),
            safety_records: Vec::new(),
        }
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn abort_cause(&self) -> Option<&AbortCause> {
        self.abort_cause.as_ref()
    }

    pub fn conflicts(&self) -> &[Conflict] {
        &self.conflicts
    }

    pub fn changes(&self) -> &[ModChange] {
        &self.changes
    }

    pub fn sites(&self) -> &[PatchSite] {
        &self.sites
    }

    pub fn safety_records(&self) -> &[SafetyRecord] {
        &self.safety_records
    }

    pub fn debug_log(&self) -> &DebugLog {
        &self.log
    }

    pub fn set_debug(&mut self, level: u8) {
        self.log.set_level(level);
    }

    pub fn add_change(&mut self, change: ModChange) -> Result<()> {
        if !self.stage.accepts_changes() {
            return Err(AbortCause::unexpected(format!(
                "update {} is {}",
                self.kid, self.stage
            )));
        }
        if self.changes.iter().any(|c| c.name == change.name) {
            return Err(AbortCause::unexpected(format!(
                "change {} already registered",
                change.name
            )));
        }
        self.changes.push(change);
        Ok(())
    }

    /// An applied update keeps its changes until it is reversed
    pub fn remove_change(&mut self, name: &str) -> Result<()> {
        if self.stage == Stage::Applied {
            return Err(AbortCause::ModuleBusy);
        }
        let idx = self
            .changes
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| AbortCause::unexpected(format!("no change {}", name)))?;
        self.changes.remove(idx);
        Ok(())
    }

    /// Patch modules this update contributes
    pub fn patch_modules(&self) -> impl Iterator<Item = PatchModule> + '_ {
        self.changes.iter().map(|change| PatchModule {
            kid: self.kid.clone(),
            target: change.target.clone(),
            primary: change.primary.clone(),
            applied: self.stage == Stage::Applied,
        })
    }

    pub fn status(&self) -> UpdateStatus {
        UpdateStatus {
            kid: self.kid.clone(),
            stage: self.stage,
            abort_cause: self
                .abort_cause
                .as_ref()
                .map_or("ok", AbortCause::as_str)
                .to_string(),
            abort_detail: self.abort_cause.as_ref().map(ToString::to_string),
            debug: self.log.level(),
            conflicts: self.conflicts.iter().map(Conflict::report_line).collect(),
            debug_log: self.log.contents().to_string(),
            changes: self.changes.iter().map(|c| c.name.clone()).collect(),
        }
    }

    fn record(&mut self, result: Result<()>) -> Result<()> {
        self.abort_cause = result.as_ref().err().cloned();
        result
    }

    /// Prepares every change and swaps the code in under a pause.
    ///
    /// On any failure the live image is left as it was found.
    pub fn apply(&mut self, host: &dyn Host, patch_modules: &[PatchModule]) -> Result<()> {
        let result = match self.stage {
            Stage::Preparing => self.apply_update(host, patch_modules),
            Stage::Applied => Err(AbortCause::unexpected(format!(
                "update {} is already applied",
                self.kid
            ))),
            Stage::Reversed => Err(AbortCause::AlreadyReversed),
        };
        if let Err(err) = &result {
            log::error!("Update {} not applied: {}", self.kid, err);
        }
        self.record(result)
    }

    pub fn reverse(&mut self, host: &dyn Host) -> Result<()> {
        let result = match self.stage {
            Stage::Applied => self.reverse_update(host),
            Stage::Reversed => Err(AbortCause::AlreadyReversed),
            Stage::Preparing => Err(AbortCause::unexpected(format!(
                "update {} is not applied",
                self.kid
            ))),
        };
        if let Err(err) = &result {
            log::error!("Update {} not reversed: {}", self.kid, err);
        }
        self.record(result)
    }

    fn primaries(&self) -> Vec<String> {
        let mut primaries: Vec<String> = Vec::new();
        for change in &self.changes {
            if !primaries.contains(&change.primary) {
                primaries.push(change.primary.clone());
            }
        }
        primaries
    }

    fn apply_update(&mut self, host: &dyn Host, patch_modules: &[PatchModule]) -> Result<()> {
        if self.changes.is_empty() {
            return Err(AbortCause::unexpected(format!(
                "update {} has no changes",
                self.kid
            )));
        }
        self.conflicts.clear();
        spdebug!(self.log, 0, "Preparing and checking {}", self.kid);

        let exports: Vec<ExportEntry> = self
            .changes
            .iter()
            .flat_map(|c| c.exports.iter().cloned())
            .collect();

        let mut sites = Vec::new();
        let mut records = Vec::new();
        for change in &self.changes {
            let prepared = prepare_change(
                host,
                &self.config,
                change,
                patch_modules,
                &exports,
                &mut self.log,
            )?;
            sites.extend(prepared.sites);
            records.extend(prepared.records);
        }

        let primaries = self.primaries();
        let retries = self.config.apply_retries.max(1);
        let mut result = Err(AbortCause::CodeBusy);
        for attempt in 0..retries {
            if attempt > 0 {
                spdebug!(
                    self.log,
                    1,
                    "Code busy, retrying in {:?} ({}/{})",
                    self.config.retry_backoff(),
                    attempt + 1,
                    retries
                );
                thread::sleep(self.config.retry_backoff());
            }

            self.conflicts.clear();
            let config = &self.config;
            let conflicts = &mut self.conflicts;
            let stage = &mut self.stage;
            result = host.stop_machine(&mut || {
                apply_in_pause(
                    host,
                    config,
                    &records,
                    &primaries,
                    &exports,
                    &mut sites,
                    &mut *conflicts,
                )?;
                *stage = Stage::Applied;
                Ok(())
            });
            if result != Err(AbortCause::CodeBusy) {
                break;
            }
        }

        if let Err(err) = result {
            self.log_conflicts();
            return Err(err);
        }

        self.sites = sites;
        self.renamed = exports;
        // Reverse needs both the replaced code and its replacement idle
        records.extend(self.changes.iter().flat_map(|change| {
            change.new_code.sections.iter().map(|s| SafetyRecord {
                addr: s.address,
                size: s.size,
                label: change.label(s.symbol).to_string(),
            })
        }));
        self.safety_records = records;

        log::info!("Update {} applied successfully", self.kid);
        spdebug!(self.log, 0, "Update {} applied successfully", self.kid);
        Ok(())
    }

    fn reverse_update(&mut self, host: &dyn Host) -> Result<()> {
        self.conflicts.clear();
        let primaries = self.primaries();
        let retries = self.config.apply_retries.max(1);
        let mut result = Err(AbortCause::CodeBusy);

        for attempt in 0..retries {
            if attempt > 0 {
                thread::sleep(self.config.retry_backoff());
            }

            self.conflicts.clear();
            let config = &self.config;
            let conflicts = &mut self.conflicts;
            let records = &self.safety_records;
            let renamed = &self.renamed;
            let sites = &mut self.sites;
            let stage = &mut self.stage;
            result = host.stop_machine(&mut || {
                for primary in &primaries {
                    if host.module_refcount(primary) != 1 {
                        return Err(AbortCause::ModuleBusy);
                    }
                }
                check_each_task(host, config, records, &mut *conflicts)?;
                if let Some(site) = sites.iter().find(|s| !s.is_patch_applied(host)) {
                    return Err(AbortCause::unexpected(format!(
                        "patch {} at {:#x} was overwritten",
                        site.label, site.oldaddr
                    )));
                }

                remove_sites(host, &mut sites[..])?;
                *stage = Stage::Reversed;
                for primary in &primaries {
                    host.module_put(primary);
                }
                for export in renamed.iter().rev() {
                    host.rename_export(&export.new_name, &export.name);
                }
                Ok(())
            });
            if result != Err(AbortCause::CodeBusy) {
                break;
            }
        }

        if let Err(err) = result {
            self.log_conflicts();
            return Err(err);
        }

        self.safety_records.clear();
        self.sites.clear();
        self.renamed.clear();
        log::info!("Update {} reversed successfully", self.kid);
        spdebug!(self.log, 0, "Update {} reversed successfully", self.kid);
        Ok(())
    }

    fn log_conflicts(&mut self) {
        if !self.conflicts.is_empty() {
            log::warn!(
                target: "libsplice",
                "Update {} blocked by:\n{}",
                self.kid,
                conflict_report(&self.conflicts).trim_end()
            );
        }
        for conflict in &self.conflicts {
            let mut line = format!(
                "stack check: pid {} ({}):",
                conflict.pid, conflict.process_name
            );
            for frame in &conflict.frames {
                line.push_str(&format!(" {:#x}", frame.addr));
                if frame.has_conflict() {
                    line.push_str(" [<-CONFLICT]");
                }
            }
            self.log.emit(2, format_args!("{}", line));
        }
    }
}

/// Everything that can be done before the pause: matching, patch sites,
/// exports and the new code's relocations.
fn prepare_change(
    host: &dyn Host,
    config: &SpliceConfig,
    change: &ModChange,
    patch_modules: &[PatchModule],
    exports: &[ExportEntry],
    log: &mut DebugLog,
) -> Result<Prepared> {
    change.validate()?;

    let relocs = RelocIndex::new(&change.old_code.relocs);
    let mut ctx = MatchCtx::new(host, config, change, &relocs, patch_modules, exports, log);
    spdebug!(
        ctx.log,
        1,
        "Preparing {} for {}",
        change.name,
        change.target_name()
    );

    match_change_sections(&mut ctx)?;
    let sites = finalize_patches(&mut ctx)?;
    finalize_exports(&mut ctx)?;
    apply_new_relocs(&mut ctx)?;
    ctx.deferred.clear();

    Ok(Prepared {
        sites,
        records: ctx.safety_records,
    })
}

fn finalize_patches(ctx: &mut MatchCtx<'_>) -> Result<Vec<PatchSite>> {
    let host = ctx.host;
    let change = ctx.change;
    let mut sites = Vec::new();
    sites.try_reserve(change.patches.len())?;

    for patch in &change.patches {
        let label = change.label(patch.symbol);
        let oldaddr = require_singular(ctx, patch.symbol, LookupScope::OldCode)?;
        let site = match patch.kind {
            PatchKind::Text => PatchSite::redirect(host, label, oldaddr, patch.repladdr)?,
            PatchKind::Data => PatchSite::data(host, label, oldaddr, patch.contents.clone())?,
        };

        let last = oldaddr + site.contents.len() as u64 - 1;
        let covered = ctx
            .safety_records
            .iter()
            .any(|r| r.contains(oldaddr) && r.contains(last));
        if !covered {
            return Err(AbortCause::unexpected(format!(
                "no safety record covers patch site {} at {:#x}",
                label, oldaddr
            )));
        }

        add_dependency_on_address(ctx, oldaddr)?;
        spdebug!(
            ctx.log,
            3,
            "patch {} at {:#x} -> {:#x}",
            label,
            oldaddr,
            patch.repladdr
        );
        sites.push(site);
    }

    Ok(sites)
}

fn finalize_exports(ctx: &mut MatchCtx<'_>) -> Result<()> {
    let change = ctx.change;
    for export in &change.exports {
        if ctx.host.exported_symbol(&export.name).is_none() {
            spdebug!(ctx.log, 0, "Could not find export {}", export.name);
            return Err(AbortCause::MissingExport(export.name.clone()));
        }
    }
    Ok(())
}

/// Runs with the world paused. Either everything is switched over or
/// nothing is.
fn apply_in_pause(
    host: &dyn Host,
    config: &SpliceConfig,
    records: &[SafetyRecord],
    primaries: &[String],
    exports: &[ExportEntry],
    sites: &mut [PatchSite],
    conflicts: &mut Vec<Conflict>,
) -> Result<()> {
    check_each_task(host, config, records, conflicts)?;

    let mut taken: Vec<&str> = Vec::new();
    let release = |taken: &[&str]| {
        for primary in taken {
            host.module_put(primary);
        }
    };
    for primary in primaries {
        if !host.try_module_get(primary) {
            release(taken.as_slice());
            return Err(AbortCause::unexpected(format!(
                "cannot take a reference on {}",
                primary
            )));
        }
        taken.push(primary.as_str());
    }

    let restore = |renamed: &[ExportEntry]| {
        for export in renamed.iter().rev() {
            host.rename_export(&export.new_name, &export.name);
        }
    };
    for (i, export) in exports.iter().enumerate() {
        if !host.rename_export(&export.name, &export.new_name) {
            restore(&exports[..i]);
            release(taken.as_slice());
            return Err(AbortCause::MissingExport(export.name.clone()));
        }
    }

    for i in 0..sites.len() {
        if let Err(err) = sites[i].insert(host) {
            for site in sites[..i].iter_mut().rev() {
                let _ = site.remove(host);
            }
            restore(exports);
            release(taken.as_slice());
            return Err(err);
        }
    }

    Ok(())
}

/// Restores every site, last first. If one cannot be restored, the ones
/// already restored are put back so the image stays fully patched.
fn remove_sites(host: &dyn Host, sites: &mut [PatchSite]) -> Result<()> {
    for i in (0..sites.len()).rev() {
        if let Err(err) = sites[i].remove(host) {
            for site in &mut sites[i + 1..] {
                let _ = site.insert(host);
            }
            return Err(err);
        }
    }
    Ok(())
}
