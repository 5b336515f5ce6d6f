use std::fmt::Write;

/// Formats bytes as space separated hex, e.g. `e9 10 00 00 00`
pub fn hex_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, byte) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// Returns true if `[addr, addr + len)` fits in the address space
pub fn range_fits(addr: u64, len: u64) -> bool {
    addr.checked_add(len).is_some()
}
