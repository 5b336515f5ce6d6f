use std::io;

use super::*;

/// The current process's own address space.
///
/// Reads never fault: they go through `process_vm_readv`, which reports
/// unmapped pages instead of raising a signal.
#[derive(Debug, Clone, Copy)]
pub struct ProcessMemory {
    pid: libc::pid_t,
}

impl ProcessMemory {
    pub fn current() -> Self {
        Self {
            pid: unsafe { libc::getpid() },
        }
    }

    fn page_size() -> u64 {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 {
            size as u64
        } else {
            4096
        }
    }

    fn write_vm(&self, addr: u64, bytes: &[u8]) -> bool {
        let local = libc::iovec {
            iov_base: bytes.as_ptr() as *mut libc::c_void,
            iov_len: bytes.len(),
        };
        let remote = libc::iovec {
            iov_base: addr as usize as *mut libc::c_void,
            iov_len: bytes.len(),
        };
        let written = unsafe { libc::process_vm_writev(self.pid, &local, 1, &remote, 1, 0) };
        written == bytes.len() as isize
    }

    /// Writes through a temporary RWX mapping of the covering pages, for text.
    fn write_protected(&self, addr: u64, bytes: &[u8]) -> MemoryResult<()> {
        let page = Self::page_size();
        let start = addr & !(page - 1);
        let end = (addr + bytes.len() as u64 + page - 1) & !(page - 1);
        let len = (end - start) as usize;
        let base = start as usize as *mut libc::c_void;

        let rwx = libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC;
        if unsafe { libc::mprotect(base, len, rwx) } != 0 {
            return Err(MemoryError::ProtectionChangeFailed(last_errno()));
        }

        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as usize as *mut u8, bytes.len());
        }

        if unsafe { libc::mprotect(base, len, libc::PROT_READ | libc::PROT_EXEC) } != 0 {
            return Err(MemoryError::ProtectionChangeFailed(last_errno()));
        }

        Ok(())
    }
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

impl Memory for ProcessMemory {
    fn read(&self, addr: u64, buf: &mut [u8]) -> bool {
        if buf.is_empty() {
            return true;
        }

        let local = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: addr as usize as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let read = unsafe { libc::process_vm_readv(self.pid, &local, 1, &remote, 1, 0) };
        read == buf.len() as isize
    }

    fn write(&self, addr: u64, bytes: &[u8]) -> MemoryResult<()> {
        if bytes.is_empty() {
            return Err(MemoryError::InvalidSize);
        }
        if !self.is_mapped(addr) || !self.is_mapped(addr + bytes.len() as u64 - 1) {
            return Err(MemoryError::NotMapped(addr));
        }

        // Writable data goes straight through, text needs its protection lifted
        if !self.write_vm(addr, bytes) {
            self.write_protected(addr, bytes)?;
        }

        let mut check = vec![0u8; bytes.len()];
        if !self.read(addr, &mut check) || check != bytes {
            return Err(MemoryError::VerificationFailed(addr));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_and_write_own_heap() {
        let memory = ProcessMemory::current();
        let buffer = vec![0x11u8, 0x22, 0x33, 0x44].into_boxed_slice();
        let addr = buffer.as_ptr() as u64;

        assert_eq!(memory.read_vec(addr, 4), Some(vec![0x11, 0x22, 0x33, 0x44]));

        memory.write(addr + 1, &[0xaa, 0xbb]).unwrap();
        assert_eq!(memory.read_vec(addr, 4), Some(vec![0x11, 0xaa, 0xbb, 0x44]));
        drop(buffer);
    }

    #[test]
    fn test_unmapped_read_fails_cleanly() {
        let memory = ProcessMemory::current();
        assert!(!memory.is_mapped(0x10));
        assert_eq!(memory.write(0x10, &[0]), Err(MemoryError::NotMapped(0x10)));
    }
}
