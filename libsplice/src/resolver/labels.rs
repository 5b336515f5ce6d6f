use crate::errors::AbortCause;
use crate::metadata::{ModChange, SymbolId};
use crate::Result;

use super::CandidateSet;

/// How long a value given to a symbol lasts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelStatus {
    /// Dropped when the probe that produced it ends, unless committed
    Temp,
    /// Final for this session
    Val,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SymbolValue {
    Candidates {
        set: CandidateSet,
        /// External lookup sources already merged in
        populated: bool,
    },
    Resolved(u64),
}

/// Per-session resolution state of every symbol of one change.
///
/// Values found while probing a candidate are recorded as temporary together
/// with what they replaced, so a failed or exploratory probe leaves the table
/// exactly as it was.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    values: Vec<SymbolValue>,
    temp: Vec<(SymbolId, SymbolValue)>,
}

impl SymbolTable {
    pub fn new(change: &ModChange) -> Self {
        let values = change
            .symbols
            .iter()
            .map(|sym| SymbolValue::Candidates {
                set: sym.candidates.iter().copied().collect(),
                populated: false,
            })
            .collect();

        Self {
            values,
            temp: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn resolved(&self, id: SymbolId) -> Option<u64> {
        match self.values.get(id)? {
            SymbolValue::Resolved(val) => Some(*val),
            SymbolValue::Candidates { .. } => None,
        }
    }

    pub fn resolved_count(&self) -> usize {
        self.values
            .iter()
            .filter(|v| matches!(v, SymbolValue::Resolved(_)))
            .count()
    }

    /// Known candidates of an unresolved symbol
    pub fn candidates(&self, id: SymbolId) -> Option<&CandidateSet> {
        match self.values.get(id)? {
            SymbolValue::Candidates { set, .. } => Some(set),
            SymbolValue::Resolved(_) => None,
        }
    }

    pub(crate) fn is_populated(&self, id: SymbolId) -> bool {
        matches!(
            self.values.get(id),
            Some(SymbolValue::Candidates {
                populated: true,
                ..
            }) | Some(SymbolValue::Resolved(_))
        )
    }

    pub(crate) fn populate(&mut self, id: SymbolId, found: CandidateSet) {
        if let Some(SymbolValue::Candidates { set, populated }) = self.values.get_mut(id) {
            set.extend(found.iter());
            *populated = true;
        }
    }

    /// Drops a candidate the matcher disproved
    pub fn narrow(&mut self, id: SymbolId, val: u64) {
        if let Some(SymbolValue::Candidates { set, .. }) = self.values.get_mut(id) {
            set.remove(val);
        }
    }

    /// Gives `id` the value `val`.
    ///
    /// An already resolved symbol must agree, otherwise the probe that found
    /// `val` is not a match.
    pub fn create_labelval(&mut self, id: SymbolId, val: u64, status: LabelStatus) -> Result<()> {
        let slot = self
            .values
            .get_mut(id)
            .ok_or_else(|| AbortCause::unexpected(format!("symbol {} out of range", id)))?;

        if let SymbolValue::Resolved(current) = slot {
            return if *current == val {
                Ok(())
            } else {
                Err(AbortCause::NoMatch)
            };
        }

        let previous = std::mem::replace(slot, SymbolValue::Resolved(val));
        if status == LabelStatus::Temp {
            self.temp.push((id, previous));
        }
        Ok(())
    }

    /// Ends a probe: keeps its values (`Val`) or restores what they replaced
    pub fn set_temp_labelvals(&mut self, status: LabelStatus) {
        let temp = std::mem::take(&mut self.temp);
        if status == LabelStatus::Val {
            return;
        }
        for (id, previous) in temp.into_iter().rev() {
            self.values[id] = previous;
        }
    }

    pub fn has_temp(&self) -> bool {
        !self.temp.is_empty()
    }
}
