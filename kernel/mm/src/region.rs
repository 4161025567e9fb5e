//! Region nodes for per-process mapped-memory bookkeeping.
//!
//! A process's mappings are a singly linked list of [`Region`] nodes
//! sorted by start address. Nodes live on the kernel heap: the list
//! structure is raw pointers, owned end to end by the process's
//! [`ProcessVm`](crate::vm::ProcessVm) and only walked under its
//! exclusive borrow.

use core::ptr::{self, NonNull};

use muon_core::addr::VirtAddr;

use crate::heap::KernelHeap;
use crate::mapper::{MapFlags, ProtFlags};
use crate::{PAGE_SIZE, page_round_down, page_round_up};

/// Classification of a region by its backing object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Anonymous memory (`fd == -1`).
    Anonymous,
    /// Backed by an open file description.
    File,
}

/// The parameters of an `mmap` call, decoded once at the syscall edge.
#[derive(Debug, Clone, Copy)]
pub struct MapRequest {
    /// Placement hint; zero means "anywhere".
    pub addr: VirtAddr,
    /// Requested length in bytes.
    pub length: u64,
    /// Protection bits (recorded only).
    pub prot: ProtFlags,
    /// Mapping flags (recorded only).
    pub flags: MapFlags,
    /// Backing file descriptor, `-1` for anonymous.
    pub fd: i32,
    /// Offset into the backing file.
    pub offset: i64,
}

impl MapRequest {
    /// The backing classification this request implies.
    pub fn kind(&self) -> RegionKind {
        if self.fd == -1 {
            RegionKind::Anonymous
        } else {
            RegionKind::File
        }
    }
}

/// One contiguous interval of a process's address space.
///
/// A *used* node is a live mapping with its pages installed; a *free*
/// node reserves a gap between used nodes so the list keeps owning the
/// full span it ever covered. `length` may trail `capacity` on used
/// nodes whose request was not a whole number of pages.
#[derive(Clone)]
pub struct Region {
    /// Page-aligned start address.
    pub start: VirtAddr,
    /// Usable length in bytes; at most `capacity`.
    pub length: u64,
    /// Page-aligned span owned by this node.
    pub capacity: u64,
    /// True iff the pages of `[start, start + length)` are installed.
    pub used: bool,
    /// Backing classification, derived from `fd`.
    pub kind: RegionKind,
    /// Recorded protection bits.
    pub prot: ProtFlags,
    /// Recorded mapping flags.
    pub flags: MapFlags,
    /// Recorded file descriptor (`-1` when anonymous).
    pub fd: i32,
    /// Recorded file offset.
    pub offset: i64,
    /// Next node in ascending address order.
    pub(crate) next: *mut Region,
}

impl Region {
    /// End of the owned span (`start + capacity`).
    pub fn end(&self) -> VirtAddr {
        self.start + self.capacity
    }

    /// Allocates a used node carrying the request's parameters.
    pub(crate) fn new_used(
        heap: &KernelHeap,
        start: VirtAddr,
        length: u64,
        capacity: u64,
        req: &MapRequest,
    ) -> Option<NonNull<Region>> {
        let node = Self::alloc_node(heap)?;
        // SAFETY: `alloc_node` returned a block large enough for a
        // `Region`; writing initializes it.
        unsafe {
            node.as_ptr().write(Region {
                start,
                length,
                capacity,
                used: true,
                kind: req.kind(),
                prot: req.prot,
                flags: req.flags,
                fd: req.fd,
                offset: req.offset,
                next: ptr::null_mut(),
            });
        }
        Some(node)
    }

    /// Allocates a free node reserving `[start, start + span)`.
    pub(crate) fn new_free(
        heap: &KernelHeap,
        start: VirtAddr,
        span: u64,
    ) -> Option<NonNull<Region>> {
        let node = Self::alloc_node(heap)?;
        // SAFETY: as in `new_used`.
        unsafe {
            node.as_ptr().write(Region {
                start,
                length: span,
                capacity: span,
                used: false,
                kind: RegionKind::Anonymous,
                prot: ProtFlags::empty(),
                flags: MapFlags::empty(),
                fd: -1,
                offset: 0,
                next: ptr::null_mut(),
            });
        }
        Some(node)
    }

    pub(crate) fn alloc_node(heap: &KernelHeap) -> Option<NonNull<Region>> {
        NonNull::new(heap.alloc(size_of::<Region>()).cast::<Region>())
    }

    /// Returns a node's storage to the kernel heap.
    ///
    /// # Safety
    ///
    /// `node` must have come from [`alloc_node`](Self::alloc_node) on
    /// the same heap, be unlinked, and never be used again.
    pub(crate) unsafe fn release(heap: &KernelHeap, node: *mut Region) {
        // SAFETY: forwarded caller contract.
        unsafe { heap.free(node.cast::<u8>()) }
    }
}

/// Outcome of the placement search for a new mapping.
pub(crate) enum Placement {
    /// Carve the mapping out of an existing free node.
    Reuse {
        /// The free node that will host the mapping.
        node: NonNull<Region>,
        /// Chosen page-aligned start inside the node.
        addr: VirtAddr,
    },
    /// Nothing suitable below the break; extend the top of the address
    /// space at the given page-aligned address.
    Extend {
        /// Chosen start at or above the rounded break.
        addr: VirtAddr,
    },
}

/// Chooses where a `length`-byte mapping goes.
///
/// A zero hint takes the first free node that fits. Otherwise the hint
/// is rounded to the nearer page boundary and every page-aligned
/// candidate start inside each fitting free node competes on distance
/// to the rounded hint; the scan stops as soon as distance starts
/// growing, since the list is address-sorted. Extending at the top wins
/// whenever it is at least as close as the best in-list candidate.
pub(crate) fn find_placement(
    head: *mut Region,
    hint: VirtAddr,
    length: u64,
    brk: VirtAddr,
) -> Placement {
    let any = hint.as_u64() == 0;
    let aligned = if hint.as_u64() % PAGE_SIZE as u64 >= PAGE_SIZE as u64 / 2 {
        page_round_up(hint.as_u64())
    } else {
        page_round_down(hint.as_u64())
    };

    let mut best: Option<(NonNull<Region>, u64)> = None;
    let mut cur = head;
    'scan: while !cur.is_null() {
        // SAFETY: list links are valid nodes owned by the caller.
        let r = unsafe { &*cur };
        if !r.used && r.length >= length {
            if any {
                best = Some((NonNull::new(cur).unwrap(), r.start.as_u64()));
                break;
            }
            let mut t = r.start.as_u64();
            while t + length <= r.start.as_u64() + r.length {
                match best {
                    Some((_, b)) if t.abs_diff(aligned) > b.abs_diff(aligned) => {
                        // Past the minimum; later candidates only get
                        // farther on a sorted list.
                        break 'scan;
                    }
                    Some((_, b)) if t.abs_diff(aligned) < b.abs_diff(aligned) => {
                        best = Some((NonNull::new(cur).unwrap(), t));
                    }
                    None => best = Some((NonNull::new(cur).unwrap(), t)),
                    Some(_) => {}
                }
                t += PAGE_SIZE as u64;
            }
        }
        cur = r.next;
    }

    let top = page_round_up(brk.as_u64());
    match best {
        Some((node, addr)) if top.abs_diff(aligned) >= addr.abs_diff(aligned) => Placement::Reuse {
            node,
            addr: VirtAddr::new(addr),
        },
        _ => Placement::Extend {
            addr: VirtAddr::new(top.max(aligned)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a leaked list from `(start, span, used)` triples.
    fn build_list(entries: &[(u64, u64, bool)]) -> *mut Region {
        let mut head: *mut Region = ptr::null_mut();
        let mut tail: *mut Region = ptr::null_mut();
        for &(start, span, used) in entries {
            let node = Box::into_raw(Box::new(Region {
                start: VirtAddr::new(start),
                length: span,
                capacity: span,
                used,
                kind: RegionKind::Anonymous,
                prot: ProtFlags::empty(),
                flags: MapFlags::empty(),
                fd: -1,
                offset: 0,
                next: ptr::null_mut(),
            }));
            if tail.is_null() {
                head = node;
            } else {
                unsafe { (*tail).next = node };
            }
            tail = node;
        }
        head
    }

    fn drop_list(head: *mut Region) {
        let mut cur = head;
        while !cur.is_null() {
            let next = unsafe { (*cur).next };
            drop(unsafe { Box::from_raw(cur) });
            cur = next;
        }
    }

    #[test]
    fn empty_list_extends_at_rounded_break() {
        match find_placement(ptr::null_mut(), VirtAddr::zero(), 0x1000, VirtAddr::new(0x4800)) {
            Placement::Extend { addr } => assert_eq!(addr.as_u64(), 0x5000),
            Placement::Reuse { .. } => panic!("nothing to reuse"),
        }
    }

    #[test]
    fn any_hint_takes_first_fitting_gap() {
        let head = build_list(&[(0x4000, 0x2000, false), (0x6000, 0x1000, true)]);
        match find_placement(head, VirtAddr::zero(), 0x1000, VirtAddr::new(0x7000)) {
            Placement::Reuse { addr, .. } => assert_eq!(addr.as_u64(), 0x4000),
            Placement::Extend { .. } => panic!("gap should win in any-valid mode"),
        }
        drop_list(head);
    }

    #[test]
    fn used_nodes_are_skipped() {
        let head = build_list(&[(0x4000, 0x2000, true)]);
        match find_placement(head, VirtAddr::zero(), 0x1000, VirtAddr::new(0x6000)) {
            Placement::Extend { addr } => assert_eq!(addr.as_u64(), 0x6000),
            Placement::Reuse { .. } => panic!("used node reused"),
        }
        drop_list(head);
    }

    #[test]
    fn too_small_gaps_are_skipped() {
        let head = build_list(&[(0x4000, 0x1000, false), (0x5000, 0x1000, true)]);
        match find_placement(head, VirtAddr::zero(), 0x2000, VirtAddr::new(0x6000)) {
            Placement::Extend { addr } => assert_eq!(addr.as_u64(), 0x6000),
            Placement::Reuse { .. } => panic!("gap too small"),
        }
        drop_list(head);
    }

    #[test]
    fn hint_rounds_to_nearer_boundary_and_lands_inside_gap() {
        let head = build_list(&[(0x4000, 0x2000, false), (0x6000, 0x1000, true)]);
        // 0x4800 is exactly halfway: rounds up to 0x5000.
        match find_placement(head, VirtAddr::new(0x4800), 0x1000, VirtAddr::new(0x7000)) {
            Placement::Reuse { addr, .. } => assert_eq!(addr.as_u64(), 0x5000),
            Placement::Extend { .. } => panic!("hint fits in the gap"),
        }
        // 0x4400 rounds down to 0x4000.
        match find_placement(head, VirtAddr::new(0x4400), 0x1000, VirtAddr::new(0x7000)) {
            Placement::Reuse { addr, .. } => assert_eq!(addr.as_u64(), 0x4000),
            Placement::Extend { .. } => panic!("hint fits in the gap"),
        }
        drop_list(head);
    }

    #[test]
    fn hint_above_break_extends_at_hint() {
        match find_placement(ptr::null_mut(), VirtAddr::new(0x8000), 0x1000, VirtAddr::new(0x4000))
        {
            Placement::Extend { addr } => assert_eq!(addr.as_u64(), 0x8000),
            Placement::Reuse { .. } => panic!("nothing to reuse"),
        }
    }

    #[test]
    fn top_wins_when_hint_is_nearer_the_break() {
        // Gap at 0x4000, break at 0x20000, hint right at the break: the
        // top placement is closer than any in-gap candidate.
        let head = build_list(&[(0x4000, 0x1000, false), (0x5000, 0x1b000, true)]);
        match find_placement(head, VirtAddr::new(0x20000), 0x1000, VirtAddr::new(0x20000)) {
            Placement::Extend { addr } => assert_eq!(addr.as_u64(), 0x20000),
            Placement::Reuse { .. } => panic!("top placement is nearer"),
        }
        drop_list(head);
    }

    #[test]
    fn nearest_candidate_beats_first_candidate() {
        // One large gap; the hint points into its middle.
        let head = build_list(&[(0x10000, 0x8000, false), (0x18000, 0x1000, true)]);
        match find_placement(head, VirtAddr::new(0x14000), 0x1000, VirtAddr::new(0x19000)) {
            Placement::Reuse { addr, .. } => assert_eq!(addr.as_u64(), 0x14000),
            Placement::Extend { .. } => panic!("hint fits in the gap"),
        }
        drop_list(head);
    }

    #[test]
    fn request_kind_follows_fd() {
        let mut req = MapRequest {
            addr: VirtAddr::zero(),
            length: 0x1000,
            prot: ProtFlags::READ,
            flags: MapFlags::ANONYMOUS,
            fd: -1,
            offset: 0,
        };
        assert_eq!(req.kind(), RegionKind::Anonymous);
        req.fd = 3;
        assert_eq!(req.kind(), RegionKind::File);
    }
}
