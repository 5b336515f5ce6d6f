//! Hand-assembled x86-64 image shared by the unit tests.
//!
//! `foo` calls `bar`. The core image has two functions named `foo`; only the
//! one at [`FOO_GOOD`] is the compiled form of [`FOO_PRE`].

use crate::common::DebugLog;
use crate::config::SpliceConfig;
use crate::host::{ModuleInfo, SimHost};
use crate::matcher::MatchCtx;
use crate::metadata::*;
use crate::reloc::RelocIndex;
use crate::update::PatchModule;

pub const FOO: SymbolId = 0;
pub const BAR: SymbolId = 1;
pub const MISSING: SymbolId = 2;
pub const FOO_NEW: SymbolId = 3;

pub const FOO_PRE_BASE: u64 = 0x10000;
pub const FOO_WRONG: u64 = 0x1000;
pub const FOO_GOOD: u64 = 0x2000;
pub const BAR_ADDR: u64 = 0x3000;
pub const REPL_ADDR: u64 = 0x9000;
pub const PRIMARY: &str = "splice_k1_new";

/// xor eax,eax; push rbp; mov rbp,rsp; call bar; pop rbp; ret
pub const FOO_PRE: [u8; 13] = [
    0x31, 0xc0, 0x55, 0x48, 0x89, 0xe5, 0xe8, 0x77, 0x77, 0x77, 0x77, 0x5d, 0xc3,
];

/// mov eax,1; call bar; ret
pub const FOO_NEW_CODE: [u8; 11] = [
    0xb8, 0x01, 0x00, 0x00, 0x00, 0xe8, 0x77, 0x77, 0x77, 0x77, 0xc3,
];

/// `bytes` with the call at offset 6 pointing at `bar` from `base`
fn with_call_to_bar(mut bytes: Vec<u8>, base: u64) -> Vec<u8> {
    let rel = (BAR_ADDR as i64 - (base + 11) as i64) as i32;
    bytes[7..11].copy_from_slice(&rel.to_le_bytes());
    bytes
}

/// Live bytes at [`FOO_GOOD`]
pub fn live_foo() -> Vec<u8> {
    with_call_to_bar(FOO_PRE.to_vec(), FOO_GOOD)
}

/// Same start, but `xor rbp,rbp` where the reference has `mov rbp,rsp`
pub fn wrong_foo() -> Vec<u8> {
    let mut bytes = FOO_PRE.to_vec();
    bytes[4] = 0x31;
    bytes[5] = 0xed;
    with_call_to_bar(bytes, FOO_WRONG)
}

fn symbol(name: &str, label: &str) -> SymbolEntry {
    SymbolEntry {
        name: name.into(),
        label: label.into(),
        candidates: Vec::new(),
    }
}

fn rel32(blank_addr: u64, symbol: SymbolId) -> Reloc {
    Reloc {
        blank_addr,
        symbol,
        howto: RelocHowto::word(4, true),
        insn_addend: -4,
        target_addend: 0,
    }
}

/// Replaces `foo` in the core image with a version returning 1
pub fn foo_change() -> ModChange {
    ModChange {
        name: "fix_foo".into(),
        kid: "k1".into(),
        target: None,
        primary: PRIMARY.into(),
        symbols: vec![
            symbol("foo", "foo_pre"),
            symbol("bar", "bar_pre"),
            symbol("missing", "missing_pre"),
            symbol("foo_new", "foo_new"),
        ],
        old_code: OldCode {
            image: CodeImage {
                base: FOO_PRE_BASE,
                bytes: FOO_PRE.to_vec(),
            },
            sections: vec![Section {
                symbol: FOO,
                address: FOO_PRE_BASE,
                size: FOO_PRE.len() as u64,
                kind: SectionKind::Text,
                deleted: false,
            }],
            relocs: vec![rel32(FOO_PRE_BASE + 7, BAR)],
        },
        new_code: NewCode {
            sections: vec![Section {
                symbol: FOO_NEW,
                address: REPL_ADDR,
                size: FOO_NEW_CODE.len() as u64,
                kind: SectionKind::Text,
                deleted: false,
            }],
            relocs: vec![rel32(REPL_ADDR + 6, BAR)],
        },
        patches: vec![PatchEntry {
            symbol: FOO,
            repladdr: REPL_ADDR,
            kind: PatchKind::Text,
            contents: Vec::new(),
        }],
        exports: Vec::new(),
    }
}

/// Core image with both `foo`s and `bar`, plus the loaded primary module
pub fn foo_host() -> SimHost {
    let host = SimHost::new();
    host.add_core_symbol("foo", FOO_WRONG);
    host.add_core_symbol("foo", FOO_GOOD);
    host.add_core_symbol("bar", BAR_ADDR);

    host.map(FOO_WRONG, wrong_foo());
    host.map(FOO_GOOD, live_foo());
    let mut bar = vec![0xcc; 16];
    bar[0] = 0xc3;
    host.map(BAR_ADDR, bar);

    host.add_module(ModuleInfo {
        name: PRIMARY.into(),
        base: REPL_ADDR,
        size: 0x1000,
        text_size: 0x800,
    });
    host.map(REPL_ADDR, FOO_NEW_CODE.to_vec());
    host
}

/// Owns everything a [`MatchCtx`] borrows
pub struct Env<'h> {
    pub config: SpliceConfig,
    pub relocs: RelocIndex,
    pub patch_modules: Vec<PatchModule>,
    pub exports: Vec<ExportEntry>,
    pub log: DebugLog,
    pub host: &'h SimHost,
    pub change: &'h ModChange,
}

impl<'h> Env<'h> {
    pub fn new(host: &'h SimHost, change: &'h ModChange) -> Self {
        Self {
            config: SpliceConfig {
                retry_backoff_ms: 0,
                ..SpliceConfig::default()
            },
            relocs: RelocIndex::new(&change.old_code.relocs),
            patch_modules: Vec::new(),
            exports: Vec::new(),
            log: DebugLog::new(0),
            host,
            change,
        }
    }

    pub fn ctx(&mut self) -> MatchCtx<'_> {
        MatchCtx::new(
            self.host,
            &self.config,
            self.change,
            &self.relocs,
            &self.patch_modules,
            &self.exports,
            &mut self.log,
        )
    }
}
