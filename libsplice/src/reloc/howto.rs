use crate::errors::AbortCause;
use crate::image::Memory;
use crate::metadata::{Reloc, RelocHowto};
use crate::Result;

/// Fill pattern of relocation storage nobody has written yet
pub const CANARY: u64 = 0x7777_7777_7777_7777;

/// Mask of the low `bits` bits
pub fn n_bits(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// True if `value` is the canary for a field of `size` bytes
pub fn is_canary(value: u64, size: u8) -> bool {
    let mask = n_bits(u32::from(size) * 8);
    value & mask == CANARY & mask
}

fn checked_size(size: u8) -> Result<usize> {
    match size {
        1 | 2 | 4 | 8 => Ok(usize::from(size)),
        _ => Err(AbortCause::unexpected(format!(
            "invalid relocation size {}",
            size
        ))),
    }
}

/// Raw little-endian storage unit at `addr`, `None` if unmapped
pub fn read_storage<M: Memory + ?Sized>(mem: &M, addr: u64, size: u8) -> Result<Option<u64>> {
    let size = checked_size(size)?;
    let mut bytes = [0u8; 8];
    if !mem.read(addr, &mut bytes[..size]) {
        return Ok(None);
    }
    Ok(Some(u64::from_le_bytes(bytes)))
}

/// True if the masked field at `addr` still holds the canary
pub fn contains_canary<M: Memory + ?Sized>(mem: &M, addr: u64, howto: &RelocHowto) -> Result<bool> {
    let storage = read_storage(mem, addr, howto.size)?.ok_or_else(|| {
        AbortCause::unexpected(format!("relocation storage at {:#x} is not mapped", addr))
    })?;
    Ok(storage & howto.dst_mask == CANARY & howto.dst_mask)
}

/// Decodes the field at `addr` back into `symbol + addend`, minus `addr` when
/// pc-relative.
pub fn read_reloc_value<M: Memory + ?Sized>(mem: &M, reloc: &Reloc, addr: u64) -> Result<u64> {
    let howto = &reloc.howto;
    let mut val = read_storage(mem, addr, howto.size)?.ok_or(AbortCause::NoMatch)?;

    val &= howto.dst_mask;
    if howto.signed_addend {
        let sign = howto.dst_mask & !(howto.dst_mask >> 1);
        val |= (val & sign).wrapping_neg();
    }
    val = val.wrapping_shl(howto.rightshift);
    val = val.wrapping_sub(reloc.insn_addend.wrapping_add(reloc.target_addend) as u64);
    Ok(val)
}

/// Encodes `sym_addr` into the field at `addr`, keeping bits outside the mask.
pub fn write_reloc_value<M: Memory + ?Sized>(
    mem: &M,
    reloc: &Reloc,
    addr: u64,
    sym_addr: u64,
) -> Result<()> {
    let howto = &reloc.howto;
    let size = checked_size(howto.size)?;

    let mut val = sym_addr
        .wrapping_add(reloc.target_addend as u64)
        .wrapping_add(reloc.insn_addend as u64);
    if howto.pcrel {
        val = val.wrapping_sub(addr);
    }

    let storage = read_storage(mem, addr, howto.size)?.ok_or_else(|| {
        AbortCause::unexpected(format!("relocation storage at {:#x} is not mapped", addr))
    })?;
    let updated = (storage & !howto.dst_mask) | ((val >> howto.rightshift) & howto.dst_mask);
    mem.write(addr, &updated.to_le_bytes()[..size])?;

    let mut check = read_reloc_value(mem, reloc, addr)?;
    if howto.pcrel {
        check = check.wrapping_add(addr);
    }
    if check != sym_addr {
        return Err(AbortCause::unexpected(format!(
            "relocation overflow at {:#x}: wanted {:#x}, field holds {:#x}",
            addr, sym_addr, check
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::SimImage;
    use crate::metadata::HowtoKind;

    fn rel32(blank_addr: u64) -> Reloc {
        Reloc {
            blank_addr,
            symbol: 0,
            howto: RelocHowto::word(4, true),
            insn_addend: -4,
            target_addend: 0,
        }
    }

    #[test]
    fn test_n_bits() {
        assert_eq!(n_bits(8), 0xff);
        assert_eq!(n_bits(32), 0xffff_ffff);
        assert_eq!(n_bits(64), u64::MAX);
    }

    #[test]
    fn test_canary_in_pcrel_field_is_detected() {
        let image = SimImage::new();
        image.map(0x1000, vec![0xe8, 0x77, 0x77, 0x77, 0x77]);
        let reloc = rel32(0x1001);

        assert!(contains_canary(&image, 0x1001, &reloc.howto).unwrap());

        image.write(0x1001, &[0, 0, 0, 0]).unwrap();
        assert!(!contains_canary(&image, 0x1001, &reloc.howto).unwrap());
    }

    #[test]
    fn test_canary_respects_mask() {
        let image = SimImage::new();
        image.map(0x1000, vec![0x77, 0x77, 0x12, 0x34]);
        let mut howto = RelocHowto::word(4, false);

        assert!(!contains_canary(&image, 0x1000, &howto).unwrap());
        howto.dst_mask = 0xffff;
        assert!(contains_canary(&image, 0x1000, &howto).unwrap());
    }

    #[test]
    fn test_pcrel_write_then_read() {
        let image = SimImage::new();
        image.map(0x2000, vec![0xe8, 0x77, 0x77, 0x77, 0x77]);
        let reloc = rel32(0x2001);

        write_reloc_value(&image, &reloc, 0x2001, 0x3000).unwrap();
        // call 0x3000 from 0x2000
        assert_eq!(image.read_vec(0x2001, 4), Some(0xffbu32.to_le_bytes().to_vec()));
        let val = read_reloc_value(&image, &reloc, 0x2001).unwrap();
        assert_eq!(val.wrapping_add(0x2001), 0x3000);
    }

    #[test]
    fn test_backward_pcrel_sign_extends() {
        let image = SimImage::new();
        image.map(0x9000, vec![0; 4]);
        let reloc = rel32(0x9000);

        write_reloc_value(&image, &reloc, 0x9000, 0x1000).unwrap();
        let val = read_reloc_value(&image, &reloc, 0x9000).unwrap();
        assert_eq!(val.wrapping_add(0x9000), 0x1000);
    }

    #[test]
    fn test_masked_shifted_field_keeps_other_bits() {
        let image = SimImage::new();
        image.map(0x100, vec![0xff, 0xff]);
        let reloc = Reloc {
            blank_addr: 0x100,
            symbol: 0,
            howto: RelocHowto {
                kind: HowtoKind::Reloc,
                pcrel: false,
                size: 2,
                dst_mask: 0x0ff0,
                rightshift: 2,
                signed_addend: false,
            },
            insn_addend: 0,
            target_addend: 0,
        };

        write_reloc_value(&image, &reloc, 0x100, 0x0100).unwrap();
        let storage = read_storage(&image, 0x100, 2).unwrap().unwrap();
        assert_eq!(storage & 0xf00f, 0xf00f);
        assert_eq!(read_reloc_value(&image, &reloc, 0x100).unwrap(), 0x0100);
    }

    #[test]
    fn test_overflow_is_unexpected() {
        let image = SimImage::new();
        image.map(0x100, vec![0]);
        let reloc = Reloc {
            blank_addr: 0x100,
            symbol: 0,
            howto: RelocHowto::word(1, false),
            insn_addend: 0,
            target_addend: 0,
        };

        let err = write_reloc_value(&image, &reloc, 0x100, 0x1234).unwrap_err();
        assert_eq!(err.as_str(), "unexpected");
    }

    #[test]
    fn test_unmapped_live_field_is_no_match() {
        let image = SimImage::new();
        assert_eq!(
            read_reloc_value(&image, &rel32(0x10), 0x10),
            Err(AbortCause::NoMatch)
        );
    }
}
