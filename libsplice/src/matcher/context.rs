use crate::common::DebugLog;
use crate::config::SpliceConfig;
use crate::host::Host;
use crate::metadata::{ExportEntry, ModChange};
use crate::reloc::{DeferredRelocs, RelocIndex};
use crate::resolver::SymbolTable;
use crate::safety::SafetyRecord;
use crate::update::{follow_trampolines, PatchModule};

use super::InsnDecoder;

/// Working state while one change is prepared.
///
/// Everything mutable here is private to the change's session; the host and
/// tables are only read.
pub(crate) struct MatchCtx<'a> {
    pub host: &'a dyn Host,
    pub config: &'a SpliceConfig,
    pub change: &'a ModChange,
    /// Old-code relocations
    pub relocs: &'a RelocIndex,
    /// Patch modules of every registered update
    pub patch_modules: &'a [PatchModule],
    /// Exports renamed by any change of this update
    pub update_exports: &'a [ExportEntry],
    pub symbols: SymbolTable,
    pub deferred: DeferredRelocs,
    pub safety_records: Vec<SafetyRecord>,
    pub log: &'a mut DebugLog,
}

impl<'a> MatchCtx<'a> {
    pub fn new(
        host: &'a dyn Host,
        config: &'a SpliceConfig,
        change: &'a ModChange,
        relocs: &'a RelocIndex,
        patch_modules: &'a [PatchModule],
        update_exports: &'a [ExportEntry],
        log: &'a mut DebugLog,
    ) -> Self {
        let symbols = SymbolTable::new(change);
        let deferred = DeferredRelocs::collect(relocs, &symbols);

        Self {
            host,
            config,
            change,
            relocs,
            patch_modules,
            update_exports,
            symbols,
            deferred,
            safety_records: Vec::new(),
            log,
        }
    }

    pub fn decoder(&self) -> &'a dyn InsnDecoder {
        let host: &'a dyn Host = self.host;
        host.decoder()
    }

    pub fn follow_trampolines(&self, addr: u64) -> u64 {
        follow_trampolines(self.host, self.change, self.patch_modules, addr)
    }
}
