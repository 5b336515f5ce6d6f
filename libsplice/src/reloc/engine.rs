use crate::common::spdebug;
use crate::errors::AbortCause;
use crate::image::Memory;
use crate::matcher::{MatchCtx, RunPreMode};
use crate::metadata::{HowtoKind, Reloc};
use crate::resolver::{require_singular, LabelStatus, LookupScope};
use crate::Result;

use super::*;

/// Reference relocation whose field starts at or covers `addr`.
///
/// A value relocation whose reference storage no longer holds the canary was
/// filled in at build time and is compared as plain bytes instead.
pub(crate) fn lookup_reloc(ctx: &mut MatchCtx<'_>, addr: u64) -> Result<Option<Reloc>> {
    let relocs = ctx.relocs;
    let Some(reloc) = relocs.covering(addr) else {
        return Ok(None);
    };
    if !reloc.howto.is_value() {
        return Ok(Some(reloc.clone()));
    }

    if !contains_canary(&ctx.change.old_code.image, reloc.blank_addr, &reloc.howto)? {
        spdebug!(
            ctx.log,
            3,
            "run-pre: reloc skipped at p_a={:#x} {} (already filled)",
            reloc.blank_addr,
            ctx.change.label(reloc.symbol)
        );
        return Ok(None);
    }
    if addr != reloc.blank_addr {
        return Err(AbortCause::unexpected(format!(
            "nonzero relocation offset at {:#x}",
            addr
        )));
    }

    Ok(Some(reloc.clone()))
}

/// Checks the live field at `run_addr` against `reloc`, learning its
/// symbol's value along the way. Returns the number of bytes accounted for.
pub(crate) fn handle_reloc(
    ctx: &mut MatchCtx<'_>,
    reloc: &Reloc,
    run_addr: u64,
    mode: RunPreMode,
) -> Result<usize> {
    match reloc.howto.kind {
        HowtoKind::Reloc | HowtoKind::RelocPatch => handle_howto_reloc(ctx, reloc, run_addr, mode),
        HowtoKind::Date | HowtoKind::Time => handle_timestamp(ctx, reloc, run_addr),
        HowtoKind::Bug => {
            let entry = ctx.host.bug_entry(run_addr);
            handle_table_entry(ctx, reloc, run_addr, entry, "bug")
        }
        HowtoKind::Extable => {
            let entry = ctx.host.exception_entry(run_addr);
            handle_table_entry(ctx, reloc, run_addr, entry, "exception")
        }
    }
}

fn handle_howto_reloc(
    ctx: &mut MatchCtx<'_>,
    reloc: &Reloc,
    run_addr: u64,
    mode: RunPreMode,
) -> Result<usize> {
    let mut val = read_reloc_value(ctx.host, reloc, run_addr)?;
    if reloc.howto.pcrel {
        val = val.wrapping_add(run_addr);
    }

    if contains_canary(ctx.host, run_addr, &reloc.howto)? {
        return Err(AbortCause::unexpected(format!(
            "canary in run code at {:#x}",
            run_addr
        )));
    }

    let val = ctx.follow_trampolines(val);
    if mode == RunPreMode::Debug {
        spdebug!(
            ctx.log,
            4,
            "run-pre: reloc at r_a={:#x} p_a={:#x}: {}={:#x}",
            run_addr,
            reloc.blank_addr,
            ctx.change.label(reloc.symbol),
            val
        );
    }

    if let Err(err) = ctx.symbols.create_labelval(reloc.symbol, val, LabelStatus::Temp) {
        if err == AbortCause::NoMatch && mode != RunPreMode::Initial {
            let expected = ctx.symbols.resolved(reloc.symbol).unwrap_or_default();
            spdebug!(
                ctx.log,
                2,
                "run-pre: reloc at r_a={:#x} p_a={:#x}: {} is {:#x}, not {:#x}",
                run_addr,
                reloc.blank_addr,
                ctx.change.label(reloc.symbol),
                expected,
                val
            );
        }
        return Err(err);
    }

    Ok(usize::from(reloc.howto.size))
}

const MONTHS: [&[u8; 3]; 12] = [
    b"Jan", b"Feb", b"Mar", b"Apr", b"May", b"Jun", b"Jul", b"Aug", b"Sep", b"Oct", b"Nov", b"Dec",
];

/// `Mmm dd yyyy`, day possibly space padded
fn is_date(s: &[u8]) -> bool {
    s.len() == 11
        && MONTHS.iter().any(|m| &s[..3] == m.as_slice())
        && s[3] == b' '
        && (s[4] == b' ' || s[4].is_ascii_digit())
        && s[5].is_ascii_digit()
        && s[6] == b' '
        && s[7..].iter().all(u8::is_ascii_digit)
}

/// `hh:mm:ss`
fn is_time(s: &[u8]) -> bool {
    s.len() == 8
        && s[2] == b':'
        && s[5] == b':'
        && [0, 1, 3, 4, 6, 7].iter().all(|&i| s[i].is_ascii_digit())
}

/// Build timestamps differ between builds; any well-formed one matches
fn handle_timestamp(ctx: &mut MatchCtx<'_>, reloc: &Reloc, run_addr: u64) -> Result<usize> {
    let (len, check): (usize, fn(&[u8]) -> bool) = match reloc.howto.kind {
        HowtoKind::Date => (11, is_date),
        _ => (8, is_time),
    };

    let pre = ctx
        .change
        .old_code
        .image
        .read_vec(reloc.blank_addr, len)
        .ok_or_else(|| AbortCause::unexpected("timestamp outside reference image"))?;
    if !check(&pre) {
        return Err(AbortCause::unexpected(format!(
            "malformed timestamp at p_a={:#x}",
            reloc.blank_addr
        )));
    }

    match ctx.host.read_vec(run_addr, len) {
        Some(run) if check(&run) => Ok(len),
        _ => {
            spdebug!(ctx.log, 3, "run-pre: no timestamp at r_a={:#x}", run_addr);
            Err(AbortCause::NoMatch)
        }
    }
}

/// Trap sites and faulting instructions match by their table entry: the
/// entry found for the live instruction becomes the value of the section
/// holding the reference entry.
fn handle_table_entry(
    ctx: &mut MatchCtx<'_>,
    reloc: &Reloc,
    run_addr: u64,
    entry: Option<u64>,
    table: &str,
) -> Result<usize> {
    let Some(entry) = entry else {
        spdebug!(ctx.log, 3, "run-pre: no {} entry for r_a={:#x}", table, run_addr);
        return Err(AbortCause::NoMatch);
    };
    let section = ctx.change.old_section(reloc.symbol).ok_or_else(|| {
        AbortCause::unexpected(format!(
            "{} relocation at {:#x} names no section",
            table, reloc.blank_addr
        ))
    })?;

    ctx.symbols
        .create_labelval(section.symbol, entry, LabelStatus::Temp)?;
    Ok(0)
}

/// Fills the canary-holding fields of the new code with resolved values.
pub(crate) fn apply_new_relocs(ctx: &mut MatchCtx<'_>) -> Result<()> {
    let change = ctx.change;

    for reloc in &change.new_code.relocs {
        if !reloc.howto.is_value() {
            continue;
        }
        if !contains_canary(ctx.host, reloc.blank_addr, &reloc.howto)? {
            spdebug!(
                ctx.log,
                3,
                "reloc skipped at {:#x} {} (already filled)",
                reloc.blank_addr,
                change.label(reloc.symbol)
            );
            continue;
        }

        let sym_addr = require_singular(ctx, reloc.symbol, LookupScope::NewCode)?;
        write_reloc_value(ctx.host, reloc, reloc.blank_addr, sym_addr)?;
        add_dependency_on_address(ctx, sym_addr)?;
    }

    Ok(())
}

/// Keeps the module owning `addr` loaded for as long as the patch is.
pub(crate) fn add_dependency_on_address(ctx: &mut MatchCtx<'_>, addr: u64) -> Result<()> {
    let host = ctx.host;
    let Some(module) = host
        .module_text_address(addr)
        .or_else(|| host.module_data_address(addr))
    else {
        return Ok(());
    };

    let change = ctx.change;
    if module == change.primary || ctx.patch_modules.iter().any(|m| m.primary == module) {
        return Ok(());
    }
    if !host.use_module(&change.primary, &module) {
        spdebug!(ctx.log, 1, "Unable to add dependency on {}", module);
        return Err(AbortCause::ModuleBusy);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::host::ModuleInfo;
    use crate::metadata::RelocHowto;

    #[test]
    fn test_timestamp_shapes() {
        assert!(is_date(b"Oct 17 2026"));
        assert!(is_date(b"Oct  7 2026"));
        assert!(!is_date(b"Foo 17 2026"));
        assert!(is_time(b"12:34:56"));
        assert!(!is_time(b"12-34-56"));
    }

    #[test]
    fn test_lookup_reloc_finds_canary_field() {
        let host = fixtures::foo_host();
        let change = fixtures::foo_change();
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();

        let reloc = lookup_reloc(&mut ctx, fixtures::FOO_PRE_BASE + 7).unwrap().unwrap();
        assert_eq!(reloc.symbol, fixtures::BAR);
        assert!(lookup_reloc(&mut ctx, fixtures::FOO_PRE_BASE + 6).unwrap().is_none());
        assert!(matches!(
            lookup_reloc(&mut ctx, fixtures::FOO_PRE_BASE + 8),
            Err(AbortCause::Unexpected(_))
        ));
    }

    #[test]
    fn test_filled_reference_field_is_skipped() {
        let host = fixtures::foo_host();
        let mut change = fixtures::foo_change();
        change.old_code.image.bytes[7..11].copy_from_slice(&[0, 0, 0, 0]);
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();

        assert!(lookup_reloc(&mut ctx, fixtures::FOO_PRE_BASE + 7).unwrap().is_none());
    }

    #[test]
    fn test_howto_reloc_discovers_symbol() {
        let host = fixtures::foo_host();
        let change = fixtures::foo_change();
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();
        let reloc = change.old_code.relocs[0].clone();

        let len =
            handle_reloc(&mut ctx, &reloc, fixtures::FOO_GOOD + 7, RunPreMode::Initial).unwrap();
        assert_eq!(len, 4);
        assert_eq!(ctx.symbols.resolved(fixtures::BAR), Some(fixtures::BAR_ADDR));
        assert!(ctx.symbols.has_temp());
    }

    #[test]
    fn test_canary_in_live_field_is_unexpected() {
        let host = fixtures::foo_host();
        host.map(0x7000, vec![0xe8, 0x77, 0x77, 0x77, 0x77]);
        let change = fixtures::foo_change();
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();
        let reloc = change.old_code.relocs[0].clone();

        assert!(matches!(
            handle_reloc(&mut ctx, &reloc, 0x7001, RunPreMode::Initial),
            Err(AbortCause::Unexpected(_))
        ));
        assert_eq!(ctx.symbols.resolved(fixtures::BAR), None);
    }

    #[test]
    fn test_bug_entry_names_section() {
        let host = fixtures::foo_host();
        host.add_bug_entry(0x2100, 0x8800);
        let change = fixtures::foo_change();
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();
        let reloc = Reloc {
            blank_addr: fixtures::FOO_PRE_BASE,
            symbol: fixtures::FOO,
            howto: RelocHowto::marker(HowtoKind::Bug),
            insn_addend: 0,
            target_addend: 0,
        };

        assert_eq!(
            handle_reloc(&mut ctx, &reloc, 0x2101, RunPreMode::Initial),
            Err(AbortCause::NoMatch)
        );
        assert_eq!(handle_reloc(&mut ctx, &reloc, 0x2100, RunPreMode::Initial), Ok(0));
        assert_eq!(ctx.symbols.resolved(fixtures::FOO), Some(0x8800));
    }

    #[test]
    fn test_new_code_relocation_written_once() {
        let host = fixtures::foo_host();
        let change = fixtures::foo_change();
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();

        apply_new_relocs(&mut ctx).unwrap();
        let reloc = &change.new_code.relocs[0];
        let val = read_reloc_value(&host, reloc, reloc.blank_addr).unwrap();
        assert_eq!(val.wrapping_add(reloc.blank_addr), fixtures::BAR_ADDR);

        // Second pass sees a filled field and leaves it alone
        apply_new_relocs(&mut ctx).unwrap();
        let again = read_reloc_value(&host, reloc, reloc.blank_addr).unwrap();
        assert_eq!(again, val);
    }

    #[test]
    fn test_dependency_on_other_module() {
        let host = fixtures::foo_host();
        host.add_module(ModuleInfo {
            name: "ext4".into(),
            base: 0x40_0000,
            size: 0x1000,
            text_size: 0x1000,
        });
        let change = fixtures::foo_change();
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();

        add_dependency_on_address(&mut ctx, 0x40_0010).unwrap();
        add_dependency_on_address(&mut ctx, fixtures::BAR_ADDR).unwrap();
        assert_eq!(host.module_uses(&change.primary), vec!["ext4".to_string()]);
    }
}
