//! Typed tables produced by the build-time tooling for one change.
//!
//! A change patches one target (the core image or a single module). Old code
//! is the reference build of the functions being replaced; new code is the
//! replacement, already loaded into the live image inside the primary module.

use serde::{Deserialize, Serialize};

use crate::common::range_fits;
use crate::errors::AbortCause;
use crate::Result;

/// Index into [`ModChange::symbols`]
pub type SymbolId = usize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolEntry {
    /// Name used for symbol table lookups
    pub name: String,
    /// Unique label within the update
    pub label: String,
    /// Addresses the build tooling already believes possible
    #[serde(default)]
    pub candidates: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HowtoKind {
    Reloc,
    /// Reference to the start of a function that may carry a redirect stub
    RelocPatch,
    /// Embedded `__DATE__` string
    Date,
    /// Embedded `__TIME__` string
    Time,
    /// Trap site listed in the bug table
    Bug,
    /// Faulting instruction listed in the exception table
    Extable,
}

/// How a relocated field is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocHowto {
    pub kind: HowtoKind,
    #[serde(default)]
    pub pcrel: bool,
    /// Storage unit width in bytes
    pub size: u8,
    pub dst_mask: u64,
    #[serde(default)]
    pub rightshift: u32,
    #[serde(default)]
    pub signed_addend: bool,
}

impl RelocHowto {
    /// Whole storage unit, no shift
    pub fn word(size: u8, pcrel: bool) -> Self {
        Self {
            kind: HowtoKind::Reloc,
            pcrel,
            size,
            dst_mask: crate::reloc::n_bits(u32::from(size) * 8),
            rightshift: 0,
            signed_addend: true,
        }
    }

    pub fn marker(kind: HowtoKind) -> Self {
        Self {
            kind,
            pcrel: false,
            size: 0,
            dst_mask: 0,
            rightshift: 0,
            signed_addend: false,
        }
    }

    pub fn is_value(&self) -> bool {
        matches!(self.kind, HowtoKind::Reloc | HowtoKind::RelocPatch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reloc {
    /// Address of the storage unit being relocated
    pub blank_addr: u64,
    pub symbol: SymbolId,
    pub howto: RelocHowto,
    #[serde(default)]
    pub insn_addend: i64,
    #[serde(default)]
    pub target_addend: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionKind {
    Text,
    Rodata,
    Data,
    String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    /// Symbol naming the section; its value is the section's live address
    pub symbol: SymbolId,
    pub address: u64,
    pub size: u64,
    pub kind: SectionKind,
    /// Present in old code only, removed by the update
    #[serde(default)]
    pub deleted: bool,
}

impl Section {
    pub fn is_text(&self) -> bool {
        self.kind == SectionKind::Text
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.address && addr - self.address < self.size
    }
}

/// Bytes of the reference build, at the addresses its tables use
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeImage {
    pub base: u64,
    pub bytes: Vec<u8>,
}

impl CodeImage {
    pub fn end(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OldCode {
    pub image: CodeImage,
    pub sections: Vec<Section>,
    #[serde(default)]
    pub relocs: Vec<Reloc>,
}

/// Replacement code; its storage lives in the live image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCode {
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default)]
    pub relocs: Vec<Reloc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchKind {
    /// Redirect stub to `repladdr`
    #[default]
    Text,
    /// Literal replacement bytes
    Data,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchEntry {
    /// Old symbol whose resolved value is the patch site
    pub symbol: SymbolId,
    #[serde(default)]
    pub repladdr: u64,
    #[serde(default)]
    pub kind: PatchKind,
    #[serde(default)]
    pub contents: Vec<u8>,
}

/// Exported symbol renamed while the update is applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportEntry {
    pub name: String,
    pub new_name: String,
    #[serde(default)]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModChange {
    pub name: String,
    /// Update identifier shared by all changes of one update
    pub kid: String,
    /// Patched module, `None` for the core image
    #[serde(default)]
    pub target: Option<String>,
    /// Module holding the new code
    pub primary: String,
    pub symbols: Vec<SymbolEntry>,
    pub old_code: OldCode,
    #[serde(default)]
    pub new_code: NewCode,
    #[serde(default)]
    pub patches: Vec<PatchEntry>,
    #[serde(default)]
    pub exports: Vec<ExportEntry>,
}

impl ModChange {
    pub fn target_name(&self) -> &str {
        self.target.as_deref().unwrap_or("core")
    }

    pub fn symbol(&self, id: SymbolId) -> &SymbolEntry {
        &self.symbols[id]
    }

    pub fn label(&self, id: SymbolId) -> &str {
        self.symbols
            .get(id)
            .map(|s| s.label.as_str())
            .unwrap_or("<bad symbol>")
    }

    /// Old-code section named by `id`
    pub fn old_section(&self, id: SymbolId) -> Option<&Section> {
        self.old_code.sections.iter().find(|s| s.symbol == id)
    }

    /// Rejects tables that cannot describe a real build
    pub fn validate(&self) -> Result<()> {
        let symbols = self.symbols.len();
        let bad = |what: String| {
            log::error!("[{}] Bad reference data: {}", self.name, what);
            AbortCause::BadReferenceData
        };

        let image = &self.old_code.image;
        for section in self.old_code.sections.iter().chain(&self.new_code.sections) {
            if section.symbol >= symbols {
                return Err(bad(format!("section symbol {} out of range", section.symbol)));
            }
        }
        for section in &self.old_code.sections {
            let inside = section.address >= image.base
                && section
                    .address
                    .checked_add(section.size)
                    .is_some_and(|end| end <= image.end());
            if !inside {
                return Err(bad(format!(
                    "section {} outside reference image",
                    self.label(section.symbol)
                )));
            }
        }

        for section in &self.new_code.sections {
            if !range_fits(section.address, section.size) {
                return Err(bad(format!(
                    "new section {} wraps the address space",
                    self.label(section.symbol)
                )));
            }
        }

        for reloc in self.old_code.relocs.iter().chain(&self.new_code.relocs) {
            if reloc.symbol >= symbols {
                return Err(bad(format!("relocation symbol {} out of range", reloc.symbol)));
            }
            let size_ok = match reloc.howto.kind {
                HowtoKind::Reloc | HowtoKind::RelocPatch => {
                    matches!(reloc.howto.size, 1 | 2 | 4 | 8)
                }
                _ => matches!(reloc.howto.size, 0 | 1 | 2 | 4 | 8),
            };
            if !size_ok {
                return Err(bad(format!(
                    "relocation at {:#x} has size {}",
                    reloc.blank_addr, reloc.howto.size
                )));
            }
        }

        for patch in &self.patches {
            if patch.symbol >= symbols {
                return Err(bad(format!("patch symbol {} out of range", patch.symbol)));
            }
            if patch.kind == PatchKind::Data && patch.contents.is_empty() {
                return Err(bad(format!(
                    "data patch {} has no contents",
                    self.label(patch.symbol)
                )));
            }
        }

        Ok(())
    }
}
