use crate::common::{hex_bytes, spdebug};
use crate::errors::AbortCause;
use crate::image::Memory;
use crate::metadata::{HowtoKind, Section};
use crate::reloc::{handle_reloc, lookup_reloc, n_bits};
use crate::safety::SafetyRecord;
use crate::Result;

use super::*;

/// How a comparison run treats what it learns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPreMode {
    /// Probe one candidate; everything learned is rolled back
    Initial,
    /// Repeat of a failed probe with a verbose trace
    Debug,
    /// The candidate is the only one left; commit
    Final,
}

/// Reference offset to live address, for every instruction boundary and
/// branch target seen so far
#[derive(Debug, Clone)]
pub struct MatchMap {
    base: u64,
    slots: Vec<Option<u64>>,
}

impl MatchMap {
    pub fn new(base: u64, size: u64) -> Result<Self> {
        let len = usize::try_from(size).map_err(|_| AbortCause::OutOfMemory)?;
        let mut slots = Vec::new();
        slots.try_reserve_exact(len)?;
        slots.resize(len, None);
        Ok(Self { base, slots })
    }

    fn slot(&self, pre: u64) -> Option<usize> {
        let offset = usize::try_from(pre.checked_sub(self.base)?).ok()?;
        (offset < self.slots.len()).then_some(offset)
    }

    pub fn get(&self, pre: u64) -> Option<u64> {
        self.slot(pre).and_then(|i| self.slots[i])
    }

    pub fn set(&mut self, pre: u64, run: u64) {
        if let Some(i) = self.slot(pre) {
            self.slots[i] = Some(run);
        }
    }

    pub fn contains(&self, pre: u64) -> bool {
        self.slot(pre).is_some()
    }
}

/// Largest instruction any supported decoder produces
const DECODE_WINDOW: usize = 32;

fn decode_pre(ctx: &MatchCtx<'_>, sect: &Section, addr: u64) -> Option<Insn> {
    let end = sect.address + sect.size;
    if addr >= end {
        return None;
    }
    let decoder = ctx.decoder();
    let want = decoder
        .max_len()
        .min(DECODE_WINDOW)
        .min((end - addr) as usize);
    let mut buf = [0u8; DECODE_WINDOW];
    let n = ctx.change.old_code.image.read_prefix(addr, &mut buf[..want]);
    decoder.decode(&buf[..n], addr)
}

fn decode_run(ctx: &MatchCtx<'_>, addr: u64) -> Option<Insn> {
    let decoder = ctx.decoder();
    let want = decoder.max_len().min(DECODE_WINDOW);
    let mut buf = [0u8; DECODE_WINDOW];
    let n = ctx.host.read_prefix(addr, &mut buf[..want]);
    decoder.decode(&buf[..n], addr)
}

/// Padding, or a call into the tracing entry points
fn is_nop_like(ctx: &MatchCtx<'_>, insn: &Insn) -> bool {
    insn.nop
        || insn
            .call_target()
            .is_some_and(|target| ctx.host.is_trace_entry(target))
}

/// Safety records only matter for code the update replaces or removes
fn create_safety_record(
    ctx: &mut MatchCtx<'_>,
    sect: &Section,
    records: &mut Vec<SafetyRecord>,
    mode: RunPreMode,
    addr: u64,
    size: u64,
) {
    if mode != RunPreMode::Final || size == 0 {
        return;
    }
    let change = ctx.change;
    if !sect.deleted && !change.patches.iter().any(|p| p.symbol == sect.symbol) {
        return;
    }

    let label = change.label(sect.symbol).to_string();
    spdebug!(
        ctx.log,
        3,
        "safety record for {}: {:#x}+{:#x}",
        label,
        addr,
        size
    );
    records.push(SafetyRecord { addr, size, label });
}

fn trace_pair(
    ctx: &mut MatchCtx<'_>,
    sect: &Section,
    pre: u64,
    pre_len: usize,
    run: u64,
    run_len: usize,
) {
    if !ctx.log.enabled(4) {
        return;
    }
    let pre_bytes = ctx
        .change
        .old_code
        .image
        .read_vec(pre, pre_len)
        .unwrap_or_default();
    let run_bytes = ctx.host.read_vec(run, run_len).unwrap_or_default();
    spdebug!(
        ctx.log,
        4,
        "{}+{:#x}: r_a={:#x} [{}] p_a={:#x} [{}]",
        ctx.change.label(sect.symbol),
        pre - sect.address,
        run,
        hex_bytes(&run_bytes),
        pre,
        hex_bytes(&pre_bytes)
    );
}

/// Walks reference and live instruction streams in lockstep.
///
/// Returns the safety records of the live ranges covered, which are only
/// produced in `Final` mode.
pub(crate) fn run_pre_cmp_text(
    ctx: &mut MatchCtx<'_>,
    sect: &Section,
    run_start: u64,
    mode: RunPreMode,
) -> Result<Vec<SafetyRecord>> {
    let mut map = MatchMap::new(sect.address, sect.size)?;
    let mut records = Vec::new();

    let mut pre = sect.address;
    let mut run = run_start;
    let mut safety_start = run_start;

    let Some(mut pre_insn) = decode_pre(ctx, sect, pre) else {
        return Ok(records);
    };
    let mut run_insn = decode_run(ctx, run).ok_or(AbortCause::NoMatch)?;
    let mut pre_advance = false;
    let mut run_advance = false;
    let mut run_unconditional = false;

    loop {
        if pre_advance {
            match decode_pre(ctx, sect, pre) {
                Some(insn) => pre_insn = insn,
                None => {
                    let size = run - safety_start;
                    create_safety_record(ctx, sect, &mut records, mode, safety_start, size);
                    return Ok(records);
                }
            }
        }
        if run_advance {
            run_insn = match decode_run(ctx, run) {
                Some(insn) => insn,
                None => {
                    if mode == RunPreMode::Debug {
                        spdebug!(ctx.log, 4, "live code ends at r_a={:#x}", run);
                    }
                    return Err(AbortCause::NoMatch);
                }
            };
        }
        pre_advance = false;
        run_advance = false;

        let pre_nop = is_nop_like(ctx, &pre_insn);
        let run_nop = is_nop_like(ctx, &run_insn);
        if pre_nop && !run_nop {
            pre += pre_insn.len as u64;
            pre_advance = true;
            continue;
        }
        if run_nop && !pre_nop {
            run += run_insn.len as u64;
            run_advance = true;
            continue;
        }
        if pre_nop && run_nop {
            // Padding of different shapes is skipped, identical padding is
            // matched like anything else
            let same = compare_instructions(
                ctx,
                sect,
                &mut map,
                &pre_insn,
                &run_insn,
                pre,
                run,
                RunPreMode::Initial,
            );
            match same {
                Ok(()) => {}
                Err(AbortCause::NoMatch) => {
                    pre += pre_insn.len as u64;
                    run += run_insn.len as u64;
                    pre_advance = true;
                    run_advance = true;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }

        match map.get(pre) {
            None => map.set(pre, run),
            Some(mapped) if mapped != run => {
                if !run_unconditional {
                    if mode == RunPreMode::Debug {
                        spdebug!(
                            ctx.log,
                            2,
                            "divergent control flow: p_a={:#x} maps to {:#x}, reached at {:#x}",
                            pre,
                            mapped,
                            run
                        );
                    }
                    return Err(AbortCause::NoMatch);
                }
                let size = run - safety_start;
                create_safety_record(ctx, sect, &mut records, mode, safety_start, size);
                run = mapped;
                safety_start = run;
                run_insn = decode_run(ctx, run).ok_or(AbortCause::NoMatch)?;
            }
            Some(_) => {}
        }

        if mode == RunPreMode::Debug {
            trace_pair(ctx, sect, pre, pre_insn.len, run, run_insn.len);
        }
        compare_instructions(ctx, sect, &mut map, &pre_insn, &run_insn, pre, run, mode)?;

        run_unconditional = run_insn.unconditional;
        pre += pre_insn.len as u64;
        run += run_insn.len as u64;
        pre_advance = true;
        run_advance = true;
    }
}

#[allow(clippy::too_many_arguments)]
fn compare_instructions(
    ctx: &mut MatchCtx<'_>,
    sect: &Section,
    map: &mut MatchMap,
    pre_insn: &Insn,
    run_insn: &Insn,
    pre: u64,
    run: u64,
    mode: RunPreMode,
) -> Result<()> {
    if pre_insn.mnemonic != run_insn.mnemonic {
        if mode == RunPreMode::Debug {
            spdebug!(ctx.log, 2, "mnemonic mismatch at p_a={:#x} r_a={:#x}", pre, run);
        }
        return Err(AbortCause::NoMatch);
    }
    if run_insn.invalid {
        return Err(AbortCause::unexpected(format!(
            "unrecognized opcode at {}+{:#x}",
            ctx.change.label(sect.symbol),
            pre - sect.address
        )));
    }

    match lookup_reloc(ctx, pre)? {
        Some(reloc) if matches!(reloc.howto.kind, HowtoKind::Bug | HowtoKind::Extable) => {
            handle_reloc(ctx, &reloc, run, mode)?;
        }
        _ if run_insn.trap => {
            if mode == RunPreMode::Debug {
                spdebug!(ctx.log, 2, "trap without a bug entry at r_a={:#x}", run);
            }
            return Err(AbortCause::NoMatch);
        }
        _ => {}
    }

    if pre_insn.operands.len() != run_insn.operands.len() {
        if mode == RunPreMode::Debug {
            spdebug!(ctx.log, 2, "operand count mismatch at p_a={:#x}", pre);
        }
        return Err(AbortCause::NoMatch);
    }
    for (pre_op, run_op) in pre_insn.operands.iter().zip(&run_insn.operands) {
        compare_operands(ctx, sect, map, pre_op, run_op, pre, run, mode)?;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn compare_operands(
    ctx: &mut MatchCtx<'_>,
    sect: &Section,
    map: &mut MatchMap,
    pre_op: &Operand,
    run_op: &Operand,
    pre: u64,
    run: u64,
    mode: RunPreMode,
) -> Result<()> {
    let shape_matches = pre_op.kind == run_op.kind
        && pre_op.base == run_op.base
        && pre_op.index == run_op.index
        && pre_op.scale == run_op.scale
        && pre_op.segment == run_op.segment;
    if !shape_matches {
        if mode == RunPreMode::Debug {
            spdebug!(ctx.log, 2, "operand mismatch at p_a={:#x} r_a={:#x}", pre, run);
        }
        return Err(AbortCause::NoMatch);
    }

    let (pre_field, run_field) = match (pre_op.field, run_op.field) {
        (None, None) => return Ok(()),
        (Some(p), Some(r)) => (p, r),
        _ => return Err(AbortCause::NoMatch),
    };
    let pre_at = pre + u64::from(pre_field.offset);
    let run_at = run + u64::from(run_field.offset);

    if let Some(reloc) = lookup_reloc(ctx, pre_at)? {
        if reloc.howto.is_value() {
            if reloc.howto.size != pre_field.size {
                if mode == RunPreMode::Debug {
                    spdebug!(
                        ctx.log,
                        2,
                        "relocation size {} for a {} byte field at p_a={:#x}",
                        reloc.howto.size,
                        pre_field.size,
                        pre_at
                    );
                }
                return Err(AbortCause::NoMatch);
            }

            let mut run_reloc = reloc;
            if run_field.size != pre_field.size {
                // The assembler picked another encoding width; only a
                // relocation that owns the whole field can follow it
                let full = n_bits(u32::from(pre_field.size) * 8);
                if run_reloc.howto.dst_mask != full || run_reloc.howto.rightshift != 0 {
                    return Err(AbortCause::unexpected(format!(
                        "cannot resize masked relocation at p_a={:#x}",
                        pre_at
                    )));
                }
                run_reloc.howto.size = run_field.size;
                run_reloc.howto.dst_mask = n_bits(u32::from(run_field.size) * 8);
                run_reloc.insn_addend += i64::from(pre_field.size) - i64::from(run_field.size);
            }
            handle_reloc(ctx, &run_reloc, run_at, mode)?;
            return Ok(());
        }
    }

    if pre_op.kind == OperandKind::NearBranch {
        if pre_op.target == run_op.target {
            return Ok(());
        }
        if sect.contains(pre_op.target) {
            return match map.get(pre_op.target) {
                Some(mapped) if mapped != run_op.target => {
                    if mode == RunPreMode::Debug {
                        spdebug!(
                            ctx.log,
                            2,
                            "branch to p_a={:#x} expected at {:#x}, goes to {:#x}",
                            pre_op.target,
                            mapped,
                            run_op.target
                        );
                    }
                    Err(AbortCause::NoMatch)
                }
                Some(_) => Ok(()),
                None => {
                    map.set(pre_op.target, run_op.target);
                    Ok(())
                }
            };
        }
    }

    if pre_field.size != run_field.size {
        return Err(AbortCause::NoMatch);
    }
    let len = usize::from(pre_field.size);
    let pre_bytes = ctx.change.old_code.image.read_vec(pre_at, len);
    let run_bytes = ctx.host.read_vec(run_at, len);
    if pre_bytes.is_none() || pre_bytes != run_bytes {
        if mode == RunPreMode::Debug {
            spdebug!(ctx.log, 2, "operand bytes differ at p_a={:#x} r_a={:#x}", pre_at, run_at);
        }
        return Err(AbortCause::NoMatch);
    }
    Ok(())
}

/// Byte-for-byte comparison of a data, read-only data or string section,
/// relocated fields excepted.
pub(crate) fn run_pre_cmp_data(
    ctx: &mut MatchCtx<'_>,
    sect: &Section,
    run_start: u64,
    mode: RunPreMode,
) -> Result<Vec<SafetyRecord>> {
    let len = usize::try_from(sect.size).map_err(|_| AbortCause::OutOfMemory)?;
    let Some(run_bytes) = ctx.host.read_vec(run_start, len) else {
        if mode == RunPreMode::Debug {
            spdebug!(ctx.log, 2, "section at r_a={:#x} is not fully mapped", run_start);
        }
        return Err(AbortCause::NoMatch);
    };
    let pre_bytes = ctx
        .change
        .old_code
        .image
        .read_vec(sect.address, len)
        .ok_or(AbortCause::BadReferenceData)?;

    let mut offset = 0;
    while offset < len {
        let pre = sect.address + offset as u64;
        let run = run_start + offset as u64;

        if let Some(reloc) = lookup_reloc(ctx, pre)? {
            let consumed = handle_reloc(ctx, &reloc, run, mode)?;
            if consumed > 0 {
                offset += consumed;
                continue;
            }
        }

        if pre_bytes[offset] != run_bytes[offset] {
            if mode == RunPreMode::Debug {
                spdebug!(
                    ctx.log,
                    2,
                    "data mismatch at {}+{:#x}: {:02x} vs {:02x}",
                    ctx.change.label(sect.symbol),
                    offset,
                    pre_bytes[offset],
                    run_bytes[offset]
                );
            }
            return Err(AbortCause::NoMatch);
        }
        offset += 1;
    }

    let mut records = Vec::new();
    create_safety_record(ctx, sect, &mut records, mode, run_start, sect.size);
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::metadata::SectionKind;

    fn foo_section(change: &crate::metadata::ModChange) -> Section {
        change.old_section(fixtures::FOO).unwrap().clone()
    }

    #[test]
    fn test_match_map_bounds() {
        let mut map = MatchMap::new(0x100, 4).unwrap();
        map.set(0x101, 0x901);
        map.set(0x104, 0x904);
        assert_eq!(map.get(0x101), Some(0x901));
        assert_eq!(map.get(0x104), None);
        assert!(!map.contains(0xff));
    }

    #[test]
    fn test_live_copy_matches_and_learns_callee() {
        let host = fixtures::foo_host();
        let change = fixtures::foo_change();
        let sect = foo_section(&change);
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();

        let records =
            run_pre_cmp_text(&mut ctx, &sect, fixtures::FOO_GOOD, RunPreMode::Initial).unwrap();
        assert!(records.is_empty());
        assert_eq!(ctx.symbols.resolved(fixtures::BAR), Some(fixtures::BAR_ADDR));
    }

    #[test]
    fn test_final_mode_covers_whole_function() {
        let host = fixtures::foo_host();
        let change = fixtures::foo_change();
        let sect = foo_section(&change);
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();

        let records =
            run_pre_cmp_text(&mut ctx, &sect, fixtures::FOO_GOOD, RunPreMode::Final).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].addr, fixtures::FOO_GOOD);
        assert_eq!(records[0].size, fixtures::FOO_PRE.len() as u64);
        assert_eq!(records[0].label, "foo_pre");
    }

    #[test]
    fn test_different_instruction_is_no_match() {
        let host = fixtures::foo_host();
        let change = fixtures::foo_change();
        let sect = foo_section(&change);
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();

        assert_eq!(
            run_pre_cmp_text(&mut ctx, &sect, 0x1000, RunPreMode::Initial),
            Err(AbortCause::NoMatch)
        );
    }

    #[test]
    fn test_padding_is_skipped() {
        let host = fixtures::foo_host();
        // nopl 0(%rax) in front of the live copy
        let mut bytes = vec![0x0f, 0x1f, 0x40, 0x00];
        bytes.extend_from_slice(&fixtures::FOO_PRE);
        // rel32 now starts 4 bytes later
        let rel = (fixtures::BAR_ADDR as i64 - (0x6000 + 4 + 11) as i64) as i32;
        bytes[4 + 7..4 + 11].copy_from_slice(&rel.to_le_bytes());
        host.map(0x6000, bytes);

        let change = fixtures::foo_change();
        let sect = foo_section(&change);
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();

        run_pre_cmp_text(&mut ctx, &sect, 0x6000, RunPreMode::Initial).unwrap();
    }

    #[test]
    fn test_trace_call_counts_as_padding() {
        let host = fixtures::foo_host();
        host.add_trace_entry(0x500);
        // call mcount at 0x6000, then the function body
        let mut bytes = vec![0xe8];
        bytes.extend_from_slice(&((0x500i64 - 0x6005) as i32).to_le_bytes());
        bytes.extend_from_slice(&fixtures::FOO_PRE);
        let rel = (fixtures::BAR_ADDR as i64 - (0x6005 + 11) as i64) as i32;
        bytes[5 + 7..5 + 11].copy_from_slice(&rel.to_le_bytes());
        host.map(0x6000, bytes);

        let change = fixtures::foo_change();
        let sect = foo_section(&change);
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();

        run_pre_cmp_text(&mut ctx, &sect, 0x6000, RunPreMode::Initial).unwrap();
    }

    #[test]
    fn test_live_stream_ending_early_is_no_match() {
        let host = fixtures::foo_host();
        host.map(0x6000, fixtures::FOO_PRE[..6].to_vec());
        let change = fixtures::foo_change();
        let sect = foo_section(&change);
        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();

        assert_eq!(
            run_pre_cmp_text(&mut ctx, &sect, 0x6000, RunPreMode::Initial),
            Err(AbortCause::NoMatch)
        );
    }

    /// Local branch layouts in both streams
    fn branchy_change(pre_code: Vec<u8>) -> (crate::metadata::ModChange, Section) {
        let mut change = fixtures::foo_change();
        change.old_code.image.bytes = pre_code.clone();
        change.old_code.relocs.clear();
        change.old_code.sections[0].size = pre_code.len() as u64;
        let sect = foo_section(&change);
        (change, sect)
    }

    #[test]
    fn test_local_branches_must_agree() {
        // je +2; xor eax,eax; nop; nop; ret  -- with je landing on ret
        let pre = vec![0x74, 0x04, 0x31, 0xc0, 0x90, 0x90, 0xc3];
        let (change, sect) = branchy_change(pre);

        let host = fixtures::foo_host();
        // Same shape without padding: je lands on ret
        host.map(0x6000, vec![0x74, 0x02, 0x31, 0xc0, 0xc3]);
        // je lands on the xor instead
        host.map(0x7000, vec![0x74, 0x00, 0x31, 0xc0, 0xc3]);

        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();
        run_pre_cmp_text(&mut ctx, &sect, 0x6000, RunPreMode::Initial).unwrap();
        assert_eq!(
            run_pre_cmp_text(&mut ctx, &sect, 0x7000, RunPreMode::Initial),
            Err(AbortCause::NoMatch)
        );
    }

    #[test]
    fn test_divergence_after_unconditional_jump() {
        // jmp +1; ret; ret
        let pre = vec![0xeb, 0x01, 0xc3, 0xc3];
        let (change, sect) = branchy_change(pre);

        let host = fixtures::foo_host();
        // jmp +2 over a ret and a filler byte the reference does not have
        host.map(0x6000, vec![0xeb, 0x02, 0xc3, 0xcc, 0xc3]);

        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();
        let records = run_pre_cmp_text(&mut ctx, &sect, 0x6000, RunPreMode::Final).unwrap();
        let ranges: Vec<_> = records.iter().map(|r| (r.addr, r.size)).collect();
        assert_eq!(ranges, vec![(0x6000, 3), (0x6004, 1)]);
    }

    #[test]
    fn test_divergence_without_unconditional_jump_is_no_match() {
        // je +1; int3; ret
        let pre = vec![0x74, 0x01, 0xcc, 0xc3];
        let (change, sect) = branchy_change(pre);

        let host = fixtures::foo_host();
        host.map(0x6000, vec![0x74, 0x02, 0xcc, 0xcc, 0xc3]);

        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();
        assert_eq!(
            run_pre_cmp_text(&mut ctx, &sect, 0x6000, RunPreMode::Initial),
            Err(AbortCause::NoMatch)
        );
    }

    #[test]
    fn test_ud2_needs_bug_entry() {
        let (change, sect) = branchy_change(vec![0x0f, 0x0b]);
        let host = fixtures::foo_host();
        host.map(0x6000, vec![0x0f, 0x0b]);

        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();
        assert_eq!(
            run_pre_cmp_text(&mut ctx, &sect, 0x6000, RunPreMode::Initial),
            Err(AbortCause::NoMatch)
        );
    }

    #[test]
    fn test_outside_branch_target_compares_bytes() {
        // jmp to a fixed displacement outside the function, no relocation
        let (change, sect) = branchy_change(vec![0xe9, 0x00, 0x01, 0x00, 0x00]);
        let host = fixtures::foo_host();
        host.map(0x6000, vec![0xe9, 0x00, 0x01, 0x00, 0x00]);
        host.map(0x7000, vec![0xe9, 0x00, 0x02, 0x00, 0x00]);

        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();
        run_pre_cmp_text(&mut ctx, &sect, 0x6000, RunPreMode::Initial).unwrap();
        assert_eq!(
            run_pre_cmp_text(&mut ctx, &sect, 0x7000, RunPreMode::Initial),
            Err(AbortCause::NoMatch)
        );
    }

    #[test]
    fn test_short_encoding_of_relocated_branch() {
        let mut change = fixtures::foo_change();
        // jmp bar, rel32 relocated
        change.old_code.image.bytes = vec![0xe9, 0x77, 0x77, 0x77, 0x77];
        change.old_code.sections[0].size = 5;
        change.old_code.relocs[0].blank_addr = fixtures::FOO_PRE_BASE + 1;
        let sect = foo_section(&change);

        let host = fixtures::foo_host();
        // jmp bar, rel8, bar right behind the jump
        host.map(0x2ff0, vec![0xeb, 0x0e]);

        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();
        run_pre_cmp_text(&mut ctx, &sect, 0x2ff0, RunPreMode::Initial).unwrap();
        assert_eq!(ctx.symbols.resolved(fixtures::BAR), Some(fixtures::BAR_ADDR));
    }

    fn data_change(bytes: Vec<u8>, kind: SectionKind) -> (crate::metadata::ModChange, Section) {
        let mut change = fixtures::foo_change();
        change.old_code.image.bytes = bytes.clone();
        change.old_code.sections[0].size = bytes.len() as u64;
        change.old_code.sections[0].kind = kind;
        change.old_code.relocs.clear();
        let sect = foo_section(&change);
        (change, sect)
    }

    #[test]
    fn test_data_section_with_pointer() {
        let mut pre = vec![1, 2, 3, 4];
        pre.extend_from_slice(&[0x77; 8]);
        let (mut change, sect) = data_change(pre, SectionKind::Data);
        change.old_code.relocs.push(crate::metadata::Reloc {
            blank_addr: fixtures::FOO_PRE_BASE + 4,
            symbol: fixtures::BAR,
            howto: crate::metadata::RelocHowto::word(8, false),
            insn_addend: 0,
            target_addend: 0,
        });

        let host = fixtures::foo_host();
        let mut live = vec![1, 2, 3, 4];
        live.extend_from_slice(&fixtures::BAR_ADDR.to_le_bytes());
        host.map(0x8000, live.clone());
        live[0] = 9;
        host.map(0x8100, live);

        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();
        run_pre_cmp_data(&mut ctx, &sect, 0x8000, RunPreMode::Initial).unwrap();
        assert_eq!(ctx.symbols.resolved(fixtures::BAR), Some(fixtures::BAR_ADDR));
        assert_eq!(
            run_pre_cmp_data(&mut ctx, &sect, 0x8100, RunPreMode::Initial),
            Err(AbortCause::NoMatch)
        );
    }

    #[test]
    fn test_unmapped_data_is_no_match() {
        let (change, sect) = data_change(vec![1, 2, 3], SectionKind::Rodata);
        let host = fixtures::foo_host();
        host.map(0x8000, vec![1, 2]);

        let mut env = fixtures::Env::new(&host, &change);
        let mut ctx = env.ctx();
        assert_eq!(
            run_pre_cmp_data(&mut ctx, &sect, 0x8000, RunPreMode::Initial),
            Err(AbortCause::NoMatch)
        );
    }
}
