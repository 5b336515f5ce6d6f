use serde::Serialize;

use crate::common::hex_bytes;
use crate::errors::AbortCause;
use crate::image::Memory;
use crate::metadata::PatchKind;
use crate::Result;

use super::create_trampoline;

/// One rewrite of the live image, reversible.
///
/// The bytes it replaces are saved when the site is built, before the pause,
/// so inserting and removing inside the pause never allocate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchSite {
    pub label: String,
    pub oldaddr: u64,
    pub repladdr: u64,
    pub kind: PatchKind,
    /// Bytes written at `oldaddr`
    pub contents: Vec<u8>,
    /// Bytes found at `oldaddr`
    #[serde(skip)]
    saved: Vec<u8>,
    inserted: bool,
}

impl PatchSite {
    /// A redirect stub from `oldaddr` to `repladdr`
    pub fn redirect<M: Memory + ?Sized>(
        mem: &M,
        label: impl Into<String>,
        oldaddr: u64,
        repladdr: u64,
    ) -> Result<Self> {
        let contents = create_trampoline(oldaddr, repladdr)?;
        Self::new(mem, label.into(), oldaddr, repladdr, PatchKind::Text, contents)
    }

    /// Literal replacement bytes
    pub fn data<M: Memory + ?Sized>(
        mem: &M,
        label: impl Into<String>,
        oldaddr: u64,
        contents: Vec<u8>,
    ) -> Result<Self> {
        Self::new(mem, label.into(), oldaddr, 0, PatchKind::Data, contents)
    }

    fn new<M: Memory + ?Sized>(
        mem: &M,
        label: String,
        oldaddr: u64,
        repladdr: u64,
        kind: PatchKind,
        contents: Vec<u8>,
    ) -> Result<Self> {
        if contents.is_empty() {
            return Err(AbortCause::BadReferenceData);
        }

        let mut saved = Vec::new();
        saved.try_reserve_exact(contents.len())?;
        saved.resize(contents.len(), 0);
        if !mem.read(oldaddr, &mut saved) {
            return Err(AbortCause::unexpected(format!(
                "patch site {} at {:#x} is not mapped",
                label, oldaddr
            )));
        }

        Ok(Self {
            label,
            oldaddr,
            repladdr,
            kind,
            contents,
            saved,
            inserted: false,
        })
    }

    pub fn saved_bytes(&self) -> &[u8] {
        &self.saved
    }

    pub fn is_inserted(&self) -> bool {
        self.inserted
    }

    /// Checks the live bytes are still ours
    pub fn is_patch_applied<M: Memory + ?Sized>(&self, mem: &M) -> bool {
        mem.read_vec(self.oldaddr, self.contents.len())
            .is_some_and(|current| current == self.contents)
    }

    pub fn insert<M: Memory + ?Sized>(&mut self, mem: &M) -> Result<()> {
        if self.inserted {
            return Err(AbortCause::unexpected(format!(
                "patch {} already inserted",
                self.label
            )));
        }

        mem.write(self.oldaddr, &self.contents)?;
        mem.flush_icache(self.oldaddr, self.contents.len());
        if !self.is_patch_applied(mem) {
            return Err(AbortCause::unexpected(format!(
                "patch {} did not stick at {:#x}",
                self.label, self.oldaddr
            )));
        }

        log::debug!(
            target: "libsplice",
            "patched {} at {:#x}: {}",
            self.label,
            self.oldaddr,
            hex_bytes(&self.contents)
        );
        self.inserted = true;
        Ok(())
    }

    /// Restores the saved bytes. Only memory this site wrote is touched.
    pub fn remove<M: Memory + ?Sized>(&mut self, mem: &M) -> Result<()> {
        if !self.inserted {
            return Err(AbortCause::unexpected(format!(
                "patch {} is not inserted",
                self.label
            )));
        }
        if !self.is_patch_applied(mem) {
            return Err(AbortCause::unexpected(format!(
                "patch {} at {:#x} was overwritten",
                self.label, self.oldaddr
            )));
        }

        mem.write(self.oldaddr, &self.saved)?;
        mem.flush_icache(self.oldaddr, self.saved.len());
        self.inserted = false;
        Ok(())
    }
}
