use crate::common::spdebug;
use crate::errors::AbortCause;
use crate::metadata::{Section, SectionKind};
#[cfg(feature = "brute-search")]
use crate::resolver::CandidateSet;
use crate::resolver::{lookup_symbol, LabelStatus, LookupScope};
use crate::safety::SafetyRecord;
use crate::Result;

use super::runpre::{run_pre_cmp_data, run_pre_cmp_text};
use super::*;

fn section_kind(sect: &Section) -> &'static str {
    match sect.kind {
        SectionKind::Text => "text",
        SectionKind::Rodata => "rodata",
        SectionKind::Data => "data",
        SectionKind::String => "string",
    }
}

fn compare(
    ctx: &mut MatchCtx<'_>,
    sect: &Section,
    run_addr: u64,
    mode: RunPreMode,
) -> Result<Vec<SafetyRecord>> {
    if sect.is_text() {
        run_pre_cmp_text(ctx, sect, run_addr, mode)
    } else {
        run_pre_cmp_data(ctx, sect, run_addr, mode)
    }
}

/// Tests whether `sect` lives at `run_addr`.
///
/// Outside `Final` mode the symbol table is left exactly as it was found.
/// A `Final` success commits every value learned and keeps the safety
/// records.
pub(crate) fn try_addr(
    ctx: &mut MatchCtx<'_>,
    sect: &Section,
    run_addr: u64,
    mode: RunPreMode,
) -> Result<()> {
    let host = ctx.host;
    let change = ctx.change;
    let label = change.label(sect.symbol);

    let module = if sect.is_text() {
        host.module_text_address(run_addr)
    } else {
        host.module_data_address(run_addr)
    };
    if module != change.target {
        spdebug!(
            ctx.log,
            3,
            "run-pre: ignoring address {:#x} in {} for {}",
            run_addr,
            module.as_deref().unwrap_or("core"),
            label
        );
        return Err(AbortCause::NoMatch);
    }

    if let Err(err) = ctx
        .symbols
        .create_labelval(sect.symbol, run_addr, LabelStatus::Temp)
    {
        ctx.symbols.set_temp_labelvals(LabelStatus::Temp);
        return Err(err);
    }

    match compare(ctx, sect, run_addr, mode) {
        Ok(records) if mode == RunPreMode::Final => {
            ctx.symbols.set_temp_labelvals(LabelStatus::Val);
            ctx.safety_records.extend(records);
            spdebug!(
                ctx.log,
                3,
                "run-pre: found {} {} at {:#x}",
                section_kind(sect),
                label,
                run_addr
            );
            Ok(())
        }
        Ok(_) => {
            ctx.symbols.set_temp_labelvals(LabelStatus::Temp);
            Ok(())
        }
        Err(AbortCause::NoMatch) if mode != RunPreMode::Final => {
            ctx.symbols.set_temp_labelvals(LabelStatus::Temp);
            spdebug!(
                ctx.log,
                3,
                "run-pre: {} section {} does not match (r_a={:#x} p_a={:#x} s={:#x})",
                section_kind(sect),
                label,
                run_addr,
                sect.address,
                sect.size
            );
            if mode == RunPreMode::Initial && ctx.log.enabled(4) {
                spdebug!(ctx.log, 4, "run-pre: replaying {} at {:#x}", label, run_addr);
                if ctx
                    .symbols
                    .create_labelval(sect.symbol, run_addr, LabelStatus::Temp)
                    .is_ok()
                {
                    let _ = compare(ctx, sect, run_addr, RunPreMode::Debug);
                }
                ctx.symbols.set_temp_labelvals(LabelStatus::Temp);
            }
            Err(AbortCause::NoMatch)
        }
        Err(err) => {
            ctx.symbols.set_temp_labelvals(LabelStatus::Temp);
            if err == AbortCause::NoMatch {
                spdebug!(
                    ctx.log,
                    1,
                    "run-pre: final comparison of {} at {:#x} failed",
                    label,
                    run_addr
                );
            }
            Err(err)
        }
    }
}

/// Every address in the target's text whose bytes could start `sect`
#[cfg(feature = "brute-search")]
fn brute_search_all(
    ctx: &mut MatchCtx<'_>,
    sect: &Section,
    vals: &mut CandidateSet,
) -> Result<()> {
    let host = ctx.host;
    let change = ctx.change;

    let range = match &change.target {
        None => Some(host.core_text()),
        Some(target) => host
            .modules()
            .into_iter()
            .find(|m| &m.name == target)
            .map(|m| (m.base, m.base + m.text_size)),
    };
    let Some((start, end)) = range else {
        return Ok(());
    };
    let Some(first) = change
        .old_code
        .image
        .bytes
        .get((sect.address - change.old_code.image.base) as usize)
        .copied()
    else {
        return Ok(());
    };
    let len = usize::try_from(end.saturating_sub(start)).map_err(|_| AbortCause::OutOfMemory)?;
    let Some(text) = host.read_vec(start, len) else {
        spdebug!(ctx.log, 1, "brute search: text at {:#x} is not readable", start);
        return Ok(());
    };

    spdebug!(
        ctx.log,
        1,
        "brute search for {} in {}",
        change.label(sect.symbol),
        change.target_name()
    );

    // Every failed probe would log; keep the buffer readable
    let saved = ctx.log.level();
    ctx.log.set_level(0);
    let mut result = Ok(());
    for (offset, _) in text.iter().enumerate().filter(|(_, b)| **b == first) {
        let addr = start + offset as u64;
        match try_addr(ctx, sect, addr, RunPreMode::Initial) {
            Ok(()) => {
                vals.add(addr);
            }
            Err(AbortCause::NoMatch) => {}
            Err(err) => {
                result = Err(err);
                break;
            }
        }
    }
    ctx.log.set_level(saved);

    spdebug!(
        ctx.log,
        1,
        "brute search for {}: {} hit(s)",
        change.label(sect.symbol),
        vals.len()
    );
    result
}

/// Locates one old-code section in the live image.
pub(crate) fn find_section(ctx: &mut MatchCtx<'_>, idx: usize) -> Result<()> {
    let change = ctx.change;
    let sect = &change.old_code.sections[idx];
    let label = change.label(sect.symbol);

    let mut vals = lookup_symbol(ctx, sect.symbol, LookupScope::OldCode)?;
    for val in vals.clone().iter() {
        match try_addr(ctx, sect, val, RunPreMode::Initial) {
            Ok(()) => {}
            Err(AbortCause::NoMatch) => {
                vals.remove(val);
                ctx.symbols.narrow(sect.symbol, val);
            }
            Err(err) => return Err(err),
        }
    }

    #[cfg(feature = "brute-search")]
    if vals.is_empty() && sect.is_text() {
        brute_search_all(ctx, sect, &mut vals)?;
    }

    match vals.value() {
        Some(val) => try_addr(ctx, sect, val, RunPreMode::Final),
        None if vals.is_empty() => {
            spdebug!(ctx.log, 3, "run-pre: no candidate left for {}", label);
            Err(AbortCause::NoMatch)
        }
        None => {
            let listed: Vec<String> = vals.iter().take(5).map(|v| format!("{:#x}", v)).collect();
            spdebug!(
                ctx.log,
                1,
                "run-pre: {} candidates for {}: {}{}",
                vals.len(),
                label,
                listed.join(" "),
                if vals.len() > 5 { " ..." } else { "" }
            );
            Err(AbortCause::NoMatch)
        }
    }
}

/// Matches every old-code section, in passes, until all are found.
///
/// Finding one section can resolve the symbol of another, so a pass that
/// made progress is followed by another over what is left.
pub(crate) fn match_change_sections(ctx: &mut MatchCtx<'_>) -> Result<()> {
    let change = ctx.change;
    let sections = &change.old_code.sections;
    let mut finished: Vec<bool> = sections.iter().map(|s| s.size == 0).collect();
    let mut passes = 0;

    loop {
        let remaining: Vec<usize> = (0..sections.len())
            .filter(|&i| !finished[i] && sections[i].kind != SectionKind::String)
            .collect();
        if remaining.is_empty() {
            break;
        }
        if passes >= ctx.config.restart_limit {
            spdebug!(ctx.log, 0, "Too many restarts matching {}", change.name);
            return Err(AbortCause::NoMatch);
        }
        passes += 1;

        let mut progress = false;
        for idx in remaining {
            match find_section(ctx, idx) {
                Ok(()) => {
                    finished[idx] = true;
                    progress = true;
                }
                Err(AbortCause::NoMatch) => {}
                Err(err) => return Err(err),
            }
        }
        let pruned = ctx.deferred.prune(&ctx.symbols);
        spdebug!(
            ctx.log,
            3,
            "pass {}: {} deferred relocation(s) resolved, {} pending",
            passes,
            pruned,
            ctx.deferred.len()
        );

        if !progress {
            for (i, sect) in sections.iter().enumerate() {
                if !finished[i] && sect.kind != SectionKind::String {
                    spdebug!(
                        ctx.log,
                        0,
                        "run-pre: could not match {} section {}",
                        section_kind(sect),
                        change.label(sect.symbol)
                    );
                }
            }
            for (addr, symbol) in ctx.deferred.pending() {
                spdebug!(
                    ctx.log,
                    1,
                    "run-pre: relocation at {:#x} still waiting on {}",
                    addr,
                    change.label(symbol)
                );
            }
            return Err(AbortCause::NoMatch);
        }
    }

    // Strings are best effort
    for (i, sect) in sections.iter().enumerate() {
        if finished[i] || sect.kind != SectionKind::String {
            continue;
        }
        match find_section(ctx, i) {
            Ok(()) | Err(AbortCause::NoMatch) => {}
            Err(err) => return Err(err),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::host::ModuleInfo;

    #[test]
    fn test_try_addr_probe_leaves_no_trace() {
        let host = fixtures::foo_host();
        let change = fixtures::foo_change();
        let sect = change.old_section(fixtures::FOO).unwrap().clone();
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();

        try_addr(&mut ctx, &sect, fixtures::FOO_GOOD, RunPreMode::Initial).unwrap();
        assert_eq!(ctx.symbols.resolved(fixtures::FOO), None);
        assert_eq!(ctx.symbols.resolved(fixtures::BAR), None);
        assert!(!ctx.symbols.has_temp());
        assert!(ctx.safety_records.is_empty());
    }

    #[test]
    fn test_try_addr_final_commits() {
        let host = fixtures::foo_host();
        let change = fixtures::foo_change();
        let sect = change.old_section(fixtures::FOO).unwrap().clone();
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();

        try_addr(&mut ctx, &sect, fixtures::FOO_GOOD, RunPreMode::Final).unwrap();
        assert_eq!(ctx.symbols.resolved(fixtures::FOO), Some(fixtures::FOO_GOOD));
        assert_eq!(ctx.symbols.resolved(fixtures::BAR), Some(fixtures::BAR_ADDR));
        assert_eq!(ctx.safety_records.len(), 1);
    }

    #[test]
    fn test_try_addr_rejects_other_module() {
        let host = fixtures::foo_host();
        host.add_module(ModuleInfo {
            name: "ext4".into(),
            base: 0x2000,
            size: 0x100,
            text_size: 0x100,
        });
        let change = fixtures::foo_change();
        let sect = change.old_section(fixtures::FOO).unwrap().clone();
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();

        assert_eq!(
            try_addr(&mut ctx, &sect, fixtures::FOO_GOOD, RunPreMode::Initial),
            Err(AbortCause::NoMatch)
        );
    }

    #[test]
    fn test_debug_replay_writes_trace() {
        let host = fixtures::foo_host();
        let change = fixtures::foo_change();
        let sect = change.old_section(fixtures::FOO).unwrap().clone();
        let mut env = fixtures::Env::new(&host, &change);
        env.log.set_level(4);
        let mut ctx = env.ctx();

        assert_eq!(
            try_addr(&mut ctx, &sect, 0x1000, RunPreMode::Initial),
            Err(AbortCause::NoMatch)
        );
        assert!(!ctx.symbols.has_temp());
        drop(ctx);
        assert!(env.log.contents().contains("mnemonic mismatch"));
    }

    #[test]
    fn test_find_section_narrows_to_live_copy() {
        let host = fixtures::foo_host();
        let change = fixtures::foo_change();
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();

        find_section(&mut ctx, 0).unwrap();
        assert_eq!(ctx.symbols.resolved(fixtures::FOO), Some(fixtures::FOO_GOOD));
        assert_eq!(ctx.safety_records.len(), 1);
        assert_eq!(ctx.safety_records[0].addr, fixtures::FOO_GOOD);
    }

    #[test]
    fn test_two_live_copies_are_ambiguous() {
        let host = fixtures::foo_host();
        host.add_core_symbol("foo", 0x5000);
        let mut copy = fixtures::FOO_PRE.to_vec();
        let rel = (fixtures::BAR_ADDR as i64 - 0x500b) as i32;
        copy[7..11].copy_from_slice(&rel.to_le_bytes());
        host.map(0x5000, copy);

        let change = fixtures::foo_change();
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();

        assert_eq!(find_section(&mut ctx, 0), Err(AbortCause::NoMatch));
        assert_eq!(ctx.symbols.resolved(fixtures::FOO), None);
    }

    #[cfg(feature = "brute-search")]
    #[test]
    fn test_brute_search_finds_unnamed_copy() {
        let host = fixtures::foo_host();
        host.set_core_text(0x1000, 0x2100);
        let pre_len = fixtures::FOO_PRE.len() as u64;
        host.map(0x1000 + pre_len, vec![0xcc; (0x1000 - pre_len) as usize]);
        host.map(0x2000 + pre_len, vec![0xcc; (0x100 - pre_len) as usize]);
        let mut change = fixtures::foo_change();
        change.symbols[fixtures::FOO].name = "foo_renamed".into();
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();

        find_section(&mut ctx, 0).unwrap();
        assert_eq!(ctx.symbols.resolved(fixtures::FOO), Some(fixtures::FOO_GOOD));
    }

    #[test]
    fn test_match_change_sections_converges() {
        let host = fixtures::foo_host();
        let change = fixtures::foo_change();
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();

        assert_eq!(ctx.deferred.len(), 1);
        match_change_sections(&mut ctx).unwrap();
        assert!(ctx.deferred.is_empty());
        assert_eq!(ctx.symbols.resolved(fixtures::BAR), Some(fixtures::BAR_ADDR));
    }

    #[test]
    fn test_unmatched_section_fails_update() {
        let host = fixtures::foo_host();
        let mut change = fixtures::foo_change();
        change.old_code.image.bytes[0] = 0x90;
        let mut env = fixtures::Env::new(&host, &change);
        env.log.set_level(1);
        let mut ctx = env.ctx();

        assert_eq!(match_change_sections(&mut ctx), Err(AbortCause::NoMatch));
        drop(ctx);
        let log = env.log.contents();
        assert!(log.contains("could not match text section foo_pre"));
        let waiting = format!(
            "relocation at {:#x} still waiting on bar_pre",
            fixtures::FOO_PRE_BASE + 7
        );
        assert!(log.contains(&waiting));
    }

    #[test]
    fn test_string_sections_are_best_effort() {
        let host = fixtures::foo_host();
        let mut change = fixtures::foo_change();
        change.old_code.sections[0].kind = SectionKind::String;
        change.old_code.image.bytes[0] = 0x90;
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();

        match_change_sections(&mut ctx).unwrap();
        assert_eq!(ctx.symbols.resolved(fixtures::FOO), None);
    }
}
