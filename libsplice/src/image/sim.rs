use std::collections::{BTreeMap, BTreeSet};

use parking_lot::RwLock;

use super::*;

/// In-memory address space made of disjoint byte regions
#[derive(Debug, Default)]
pub struct SimImage {
    regions: RwLock<BTreeMap<u64, Vec<u8>>>,
    /// Bases of regions that refuse writes
    read_only: RwLock<BTreeSet<u64>>,
}

impl SimImage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `bytes` at `base`, replacing any region that starts there.
    pub fn map(&self, base: u64, bytes: Vec<u8>) {
        self.regions.write().insert(base, bytes);
    }

    pub fn unmap(&self, base: u64) -> Option<Vec<u8>> {
        self.read_only.write().remove(&base);
        self.regions.write().remove(&base)
    }

    /// Marks the region containing `addr` read-only or writable again.
    /// Returns false if nothing is mapped there.
    pub fn set_read_only(&self, addr: u64, read_only: bool) -> bool {
        let Some((base, _)) = Self::locate(&self.regions.read(), addr) else {
            return false;
        };
        let mut set = self.read_only.write();
        if read_only {
            set.insert(base);
        } else {
            set.remove(&base);
        }
        true
    }

    /// Base and length of every mapped region, in address order
    pub fn regions(&self) -> Vec<(u64, u64)> {
        self.regions
            .read()
            .iter()
            .map(|(base, bytes)| (*base, bytes.len() as u64))
            .collect()
    }

    fn locate(regions: &BTreeMap<u64, Vec<u8>>, addr: u64) -> Option<(u64, usize)> {
        let (base, bytes) = regions.range(..=addr).next_back()?;
        let offset = (addr - base) as usize;
        (offset < bytes.len()).then_some((*base, offset))
    }
}

impl Memory for SimImage {
    fn read(&self, addr: u64, buf: &mut [u8]) -> bool {
        let regions = self.regions.read();
        let mut done = 0;

        while done < buf.len() {
            let at = match addr.checked_add(done as u64) {
                Some(at) => at,
                None => return false,
            };
            let Some((base, offset)) = Self::locate(&regions, at) else {
                return false;
            };
            let region = &regions[&base];
            let chunk = (region.len() - offset).min(buf.len() - done);
            buf[done..done + chunk].copy_from_slice(&region[offset..offset + chunk]);
            done += chunk;
        }

        true
    }

    fn write(&self, addr: u64, bytes: &[u8]) -> MemoryResult<()> {
        if bytes.is_empty() {
            return Err(MemoryError::InvalidSize);
        }

        let mut regions = self.regions.write();
        let read_only = self.read_only.read();

        // Validate the whole range first so a failed write changes nothing
        let mut checked = 0;
        while checked < bytes.len() {
            let at = addr
                .checked_add(checked as u64)
                .ok_or(MemoryError::NotMapped(addr))?;
            let (base, offset) = Self::locate(&regions, at).ok_or(MemoryError::NotMapped(at))?;
            if read_only.contains(&base) {
                return Err(MemoryError::ReadOnly(at));
            }
            checked += (regions[&base].len() - offset).min(bytes.len() - checked);
        }

        let mut done = 0;
        while done < bytes.len() {
            let at = addr + done as u64;
            let (base, offset) = Self::locate(&regions, at).ok_or(MemoryError::NotMapped(at))?;
            let region = regions
                .get_mut(&base)
                .ok_or(MemoryError::NotMapped(at))?;
            let chunk = (region.len() - offset).min(bytes.len() - done);
            region[offset..offset + chunk].copy_from_slice(&bytes[done..done + chunk]);
            done += chunk;
        }

        Ok(())
    }
}
