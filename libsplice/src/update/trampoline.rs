use crate::errors::AbortCause;
use crate::host::Host;
use crate::image::Memory;
use crate::metadata::ModChange;
use crate::Result;

use super::PatchModule;

/// `jmp rel32`
const JMP_REL32: u8 = 0xE9;

/// Length of a redirect stub
pub const TRAMPOLINE_LEN: usize = 5;

/// Displacement of a stub at `source` jumping to `target`, if it fits
fn branch_displacement(source: u64, target: u64) -> Option<i32> {
    let next = source.checked_add(TRAMPOLINE_LEN as u64)?;
    i32::try_from(target.wrapping_sub(next) as i64).ok()
}

/// Validates that a stub at `source` can reach `target`, returning the
/// displacement to encode
pub fn validate_branch_range(source: u64, target: u64) -> Result<i32> {
    match branch_displacement(source, target) {
        Some(rel) => Ok(rel),
        None => {
            log::error!(
                "Redirect from {:#x} to {:#x} exceeds the 2GB branch range",
                source,
                target
            );
            Err(AbortCause::BadReferenceData)
        }
    }
}

/// Bytes of a redirect stub from `source` to `target`
pub fn create_trampoline(source: u64, target: u64) -> Result<Vec<u8>> {
    let rel = validate_branch_range(source, target)?;

    let mut stub = Vec::new();
    stub.try_reserve_exact(TRAMPOLINE_LEN)?;
    stub.push(JMP_REL32);
    stub.extend_from_slice(&rel.to_le_bytes());
    Ok(stub)
}

/// Where the stub at `addr` jumps to, if `addr` holds one
pub fn trampoline_target<M: Memory + ?Sized>(mem: &M, addr: u64) -> Option<u64> {
    let mut stub = [0u8; TRAMPOLINE_LEN];
    if !mem.read(addr, &mut stub) || stub[0] != JMP_REL32 {
        return None;
    }
    let rel = i32::from_le_bytes([stub[1], stub[2], stub[3], stub[4]]);
    Some(
        addr.wrapping_add(TRAMPOLINE_LEN as u64)
            .wrapping_add(i64::from(rel) as u64),
    )
}

/// Follows redirect stubs installed by earlier applied updates.
///
/// A jump only counts if it lands in the replacement code of an applied
/// patch module; the change's own target never does.
pub(crate) fn follow_trampolines(
    host: &dyn Host,
    change: &ModChange,
    patch_modules: &[PatchModule],
    mut addr: u64,
) -> u64 {
    // Each applied update adds at most one hop
    for _ in 0..=patch_modules.len() {
        let Some(next) = trampoline_target(host, addr) else {
            return addr;
        };
        let Some(module) = host.module_text_address(next) else {
            return addr;
        };
        let into_patch = patch_modules
            .iter()
            .any(|m| m.applied && m.primary == module);
        if !into_patch || change.target.as_deref() == Some(module.as_str()) {
            return addr;
        }
        log::debug!(target: "libsplice", "following redirect {:#x} -> {:#x}", addr, next);
        addr = next;
    }
    addr
}
