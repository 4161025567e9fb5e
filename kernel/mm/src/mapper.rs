//! Collaborator interface to per-process page tables.
//!
//! The region mapper decides *where* user memory lives; an
//! [`AddressSpaceOps`] implementation decides *how* the decision lands
//! in hardware page tables. Keeping the seam a trait lets the host test
//! suite drive the region logic against a mock space, including
//! injected failures.

use muon_core::addr::VirtAddr;

use crate::VmError;

bitflags::bitflags! {
    /// Page protection bits from `mmap`'s `prot` argument.
    ///
    /// Recorded on the region; enforcement is the page-table
    /// installer's concern.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtFlags: u32 {
        /// Pages may be read.
        const READ  = 1 << 0;
        /// Pages may be written.
        const WRITE = 1 << 1;
        /// Pages may be executed.
        const EXEC  = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Mapping kind bits from `mmap`'s `flags` argument. Recorded only.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        /// Updates are visible to other mappers of the same object.
        const SHARED    = 0x01;
        /// Updates stay private to this mapping.
        const PRIVATE   = 0x02;
        /// The hint is a demand, not a preference.
        const FIXED     = 0x10;
        /// No backing file.
        const ANONYMOUS = 0x20;
    }
}

/// Page-table operations performed on behalf of one process.
///
/// Ranges are half-open byte ranges; implementations operate on the
/// pages covering `[page_round_up(from), page_round_up(to))`, matching
/// a break that is only ever rounded up at its use sites.
pub trait AddressSpaceOps {
    /// Installs writable user pages covering `[from, to)`.
    ///
    /// Newly installed pages must read as zero. Fails — with any
    /// partial installation already rolled back — when a page-table
    /// frame cannot be allocated or the range reaches `KERNBASE`.
    fn map_range(&mut self, from: VirtAddr, to: VirtAddr) -> Result<(), VmError>;

    /// Removes the user pages covering `[from, to)`, releasing their
    /// frames. Pages that were never installed are skipped.
    fn unmap_range(&mut self, from: VirtAddr, to: VirtAddr) -> Result<(), VmError>;

    /// Reloads the CPU's mapping state for this address space.
    fn activate(&mut self);
}
