//! Access to the live image.
//!
//! Everything the engine reads or rewrites goes through [`Memory`], so the
//! same matcher runs against a simulated image in tests and against the
//! current process on Linux.

mod blob;
#[cfg(target_os = "linux")]
mod process;
mod sim;

#[cfg(target_os = "linux")]
pub use process::*;
pub use sim::*;

use crate::errors::MemoryError;

pub type MemoryResult<T> = core::result::Result<T, MemoryError>;

/// Byte-level view of an address space
pub trait Memory: Send + Sync {
    /// Reads exactly `buf.len()` bytes. Returns false if any byte is unmapped.
    fn read(&self, addr: u64, buf: &mut [u8]) -> bool;

    /// Writes `bytes` at `addr`, changing protections if the backend needs to.
    fn write(&self, addr: u64, bytes: &[u8]) -> MemoryResult<()>;

    /// Makes freshly written code visible to instruction fetch.
    fn flush_icache(&self, _addr: u64, _len: usize) {}

    fn is_mapped(&self, addr: u64) -> bool {
        let mut byte = [0u8; 1];
        self.read(addr, &mut byte)
    }

    fn read_vec(&self, addr: u64, len: usize) -> Option<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read(addr, &mut buf).then_some(buf)
    }

    /// Reads as many leading bytes as are mapped, returns how many.
    fn read_prefix(&self, addr: u64, buf: &mut [u8]) -> usize {
        if self.read(addr, buf) {
            return buf.len();
        }
        let mut count = 0;
        while count < buf.len() {
            let at = match addr.checked_add(count as u64) {
                Some(at) => at,
                None => break,
            };
            if !self.read(at, &mut buf[count..count + 1]) {
                break;
            }
            count += 1;
        }
        count
    }

    /// Little-endian machine word
    fn read_word(&self, addr: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf).then(|| u64::from_le_bytes(buf))
    }
}
