use crate::common::spdebug;
use crate::errors::AbortCause;
use crate::matcher::MatchCtx;
use crate::metadata::SymbolId;
use crate::reloc::is_canary;
use crate::Result;

use super::CandidateSet;

/// Which code a reference comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LookupScope {
    /// Reference code being matched against the live image
    OldCode,
    /// Replacement code; may also bind to exports this update introduces
    NewCode,
}

/// Every address `id` might have.
///
/// A resolved symbol short-circuits to its value. Otherwise the external
/// sources are consulted once per session and merged into the symbol's
/// candidates, which matching then narrows.
pub(crate) fn lookup_symbol(
    ctx: &mut MatchCtx<'_>,
    id: SymbolId,
    scope: LookupScope,
) -> Result<CandidateSet> {
    if let Some(val) = ctx.symbols.resolved(id) {
        return Ok(CandidateSet::single(val));
    }

    if !ctx.symbols.is_populated(id) {
        let found = gather_candidates(ctx, id);
        ctx.symbols.populate(id, found);
    }

    let mut vals = ctx.symbols.candidates(id).cloned().unwrap_or_default();
    if scope == LookupScope::NewCode {
        new_export_lookup(ctx, id, &mut vals);
    }
    Ok(vals)
}

/// Value of `id`, which must be unique
pub(crate) fn require_singular(
    ctx: &mut MatchCtx<'_>,
    id: SymbolId,
    scope: LookupScope,
) -> Result<u64> {
    let vals = lookup_symbol(ctx, id, scope)?;
    match vals.value() {
        Some(val) => Ok(val),
        None => {
            let label = ctx.change.label(id).to_string();
            spdebug!(
                ctx.log,
                1,
                "Failed to find symbol {} ({} candidates)",
                label,
                vals.len()
            );
            Err(AbortCause::FailedToFind(label))
        }
    }
}

fn gather_candidates(ctx: &mut MatchCtx<'_>, id: SymbolId) -> CandidateSet {
    let host = ctx.host;
    let change = ctx.change;
    let sym = change.symbol(id);
    let mut vals = CandidateSet::new();

    // Section-local labels have no meaningful name
    if sym.name.is_empty() || sym.name.starts_with(".rodata") {
        return vals;
    }

    if let Some(addr) = host.exported_symbol(&sym.name) {
        vals.add(addr);
    }

    vals.extend(host.core_symbols(&sym.name));

    for module in ctx.patch_modules {
        if module.target == change.target && module.primary != change.primary {
            vals.extend(host.module_symbols(&module.primary, &sym.name));
        }
    }

    if let Some(target) = &change.target {
        vals.extend(host.module_symbols(target, &sym.name));
    }

    // Code already replaced by an applied update lives at the redirect target
    let vals: CandidateSet = vals.iter().map(|val| ctx.follow_trampolines(val)).collect();

    spdebug!(
        ctx.log,
        3,
        "lookup {}: {} candidate(s) for {}",
        sym.label,
        vals.len(),
        sym.name
    );
    vals
}

/// Exports that changes of this update are about to rename into `id`'s name
fn new_export_lookup(ctx: &mut MatchCtx<'_>, id: SymbolId, vals: &mut CandidateSet) {
    let name = &ctx.change.symbol(id).name;

    for export in ctx.update_exports {
        if &export.new_name != name {
            continue;
        }
        match ctx.host.exported_symbol(&export.name) {
            Some(val) if is_canary(val, 8) => {
                spdebug!(ctx.log, 3, "export {} not yet relocated, skipped", export.name);
            }
            Some(val) => {
                vals.add(val);
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::metadata::ExportEntry;
    use crate::reloc::CANARY;

    #[test]
    fn test_sources_are_merged_and_cached() {
        let host = fixtures::foo_host();
        let change = fixtures::foo_change();
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();

        let vals = lookup_symbol(&mut ctx, fixtures::FOO, LookupScope::OldCode).unwrap();
        assert_eq!(vals.iter().collect::<Vec<_>>(), vec![0x1000, 0x2000]);

        // Narrowing sticks for the rest of the session
        ctx.symbols.narrow(fixtures::FOO, 0x1000);
        let vals = lookup_symbol(&mut ctx, fixtures::FOO, LookupScope::OldCode).unwrap();
        assert_eq!(vals.value(), Some(0x2000));
    }

    #[test]
    fn test_resolved_value_short_circuits() {
        let host = fixtures::foo_host();
        let change = fixtures::foo_change();
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();

        ctx.symbols
            .create_labelval(fixtures::FOO, 0x5000, crate::resolver::LabelStatus::Val)
            .unwrap();
        let vals = lookup_symbol(&mut ctx, fixtures::FOO, LookupScope::OldCode).unwrap();
        assert_eq!(vals.value(), Some(0x5000));
    }

    #[test]
    fn test_singular_requirement() {
        let host = fixtures::foo_host();
        let change = fixtures::foo_change();
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();

        assert_eq!(
            require_singular(&mut ctx, fixtures::FOO, LookupScope::OldCode),
            Err(AbortCause::FailedToFind("foo_pre".into()))
        );
        assert_eq!(
            require_singular(&mut ctx, fixtures::BAR, LookupScope::OldCode),
            Ok(fixtures::BAR_ADDR)
        );
        assert_eq!(
            require_singular(&mut ctx, fixtures::MISSING, LookupScope::OldCode),
            Err(AbortCause::FailedToFind("missing_pre".into()))
        );
    }

    #[test]
    fn test_new_export_skips_canary() {
        let host = fixtures::foo_host();
        let change = fixtures::foo_change();
        let exports = vec![
            ExportEntry {
                name: "missing_impl".into(),
                new_name: "missing".into(),
                kind: String::new(),
            },
            ExportEntry {
                name: "pending_impl".into(),
                new_name: "missing".into(),
                kind: String::new(),
            },
        ];
        host.add_export("missing_impl", 0x7000);
        host.add_export("pending_impl", CANARY);

        let mut env = fixtures::Env::new(&host, &change);
        env.exports = exports;
        let mut ctx = env.ctx();

        let old = lookup_symbol(&mut ctx, fixtures::MISSING, LookupScope::OldCode).unwrap();
        assert!(old.is_empty());
        let new = lookup_symbol(&mut ctx, fixtures::MISSING, LookupScope::NewCode).unwrap();
        assert_eq!(new.value(), Some(0x7000));
    }
}
