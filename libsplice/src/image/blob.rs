use super::*;
use crate::metadata::CodeImage;

// Reference code is never patched in place.
impl Memory for CodeImage {
    fn read(&self, addr: u64, buf: &mut [u8]) -> bool {
        let Some(offset) = addr.checked_sub(self.base) else {
            return false;
        };
        let Ok(start) = usize::try_from(offset) else {
            return false;
        };
        match start.checked_add(buf.len()) {
            Some(end) if end <= self.bytes.len() => {
                buf.copy_from_slice(&self.bytes[start..end]);
                true
            }
            _ => false,
        }
    }

    fn write(&self, addr: u64, _bytes: &[u8]) -> MemoryResult<()> {
        Err(MemoryError::ReadOnly(addr))
    }
}
