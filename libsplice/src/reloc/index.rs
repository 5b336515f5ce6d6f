use std::collections::BTreeMap;

use crate::metadata::{Reloc, SymbolId};
use crate::resolver::SymbolTable;

/// Relocations of one code image, sorted by field address
#[derive(Debug, Clone, Default)]
pub struct RelocIndex {
    relocs: Vec<Reloc>,
}

impl RelocIndex {
    pub fn new(relocs: &[Reloc]) -> Self {
        let mut relocs = relocs.to_vec();
        relocs.sort_by_key(|r| r.blank_addr);
        Self { relocs }
    }

    pub fn len(&self) -> usize {
        self.relocs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relocs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Reloc> {
        self.relocs.iter()
    }

    /// Relocation whose field covers `addr`.
    ///
    /// Zero-sized markers (trap sites, exception entries) cover only their
    /// own address.
    pub fn covering(&self, addr: u64) -> Option<&Reloc> {
        let idx = self.relocs.partition_point(|r| {
            let size = u64::from(r.howto.size);
            addr >= r.blank_addr.saturating_add(size) && !(size == 0 && addr == r.blank_addr)
        });
        let reloc = self.relocs.get(idx)?;
        (addr >= reloc.blank_addr).then_some(reloc)
    }
}

/// Reference relocations whose symbol was still unresolved when matching
/// began, keyed by field address.
#[derive(Debug, Clone, Default)]
pub struct DeferredRelocs {
    pending: BTreeMap<u64, SymbolId>,
}

impl DeferredRelocs {
    pub fn collect(index: &RelocIndex, symbols: &SymbolTable) -> Self {
        let pending = index
            .iter()
            .filter(|r| r.howto.is_value() && symbols.resolved(r.symbol).is_none())
            .map(|r| (r.blank_addr, r.symbol))
            .collect();
        Self { pending }
    }

    /// Drops entries whose symbol matching has resolved, returns how many
    pub fn prune(&mut self, symbols: &SymbolTable) -> usize {
        let before = self.pending.len();
        self.pending
            .retain(|_, symbol| symbols.resolved(*symbol).is_none());
        before - self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending(&self) -> impl Iterator<Item = (u64, SymbolId)> + '_ {
        self.pending.iter().map(|(addr, symbol)| (*addr, *symbol))
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
