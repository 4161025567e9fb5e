//! Per-process mapped-memory state and the `mmap` / `munmap` operations.
//!
//! [`ProcessVm`] owns the break and the address-sorted region list.
//! Every public operation is a transaction: page-table calls through
//! [`AddressSpaceOps`] are checked, and any failure unwinds the
//! metadata edits of the current call in reverse before the error
//! surfaces. On an error return the list, the break, and the page
//! tables look exactly as they did before the call.

use core::fmt;
use core::marker::PhantomData;
use core::ptr::{self, NonNull};

use muon_core::addr::VirtAddr;
use muon_core::{kdebug, kwarn};

use crate::heap::KernelHeap;
use crate::mapper::{AddressSpaceOps, MapFlags, ProtFlags};
use crate::region::{MapRequest, Placement, Region, RegionKind, find_placement};
use crate::{KERNBASE, PAGE_SIZE, VmError, page_round_up};

/// Per-process user-memory state: the image break and the mapped-region
/// list.
///
/// Nodes are kernel-heap allocations owned exclusively by this value;
/// call [`release_all`](Self::release_all) before dropping it on
/// process exit, since nodes can only be returned through the heap.
pub struct ProcessVm {
    /// Top of the user image. Mappings placed at the top advance it;
    /// tail reclaim lowers it.
    brk: VirtAddr,
    /// Head of the address-sorted region list.
    head: *mut Region,
}

// SAFETY: the raw node pointers are owned by this value alone, and the
// kernel serializes access through the owning process.
unsafe impl Send for ProcessVm {}

impl ProcessVm {
    /// State for a fresh process whose loaded image ends at `brk`.
    pub fn new(brk: VirtAddr) -> Self {
        Self {
            brk,
            head: ptr::null_mut(),
        }
    }

    /// Current top of the user image.
    pub fn brk(&self) -> VirtAddr {
        self.brk
    }

    /// Iterates the region list in address order.
    pub fn regions(&self) -> RegionIter<'_> {
        RegionIter {
            cur: self.head,
            _marker: PhantomData,
        }
    }

    /// Creates a mapping of `req.length` bytes and returns its start.
    ///
    /// A zero hint means "anywhere"; otherwise the mapping lands as
    /// close to the hint as the existing layout allows, reusing a
    /// reserved gap or extending the break.
    pub fn mmap(
        &mut self,
        req: &MapRequest,
        space: &mut impl AddressSpaceOps,
        heap: &KernelHeap,
    ) -> Result<VirtAddr, VmError> {
        if req.addr.as_u64() >= KERNBASE || req.length == 0 || req.length >= KERNBASE {
            return Err(VmError::InvalidArgument);
        }
        self.reclaim_tail(space, heap);

        let start = match find_placement(self.head, req.addr, req.length, self.brk) {
            Placement::Extend { addr } => self.map_at_top(addr, req, space, heap)?,
            Placement::Reuse { node, addr } => self.map_into_gap(node, addr, req, space, heap)?,
        };
        space.activate();
        // A reuse split may have left a new free node at the very top.
        self.reclaim_tail(space, heap);
        kdebug!("mmap: {:#x}+{:#x} placed", start, req.length);
        Ok(start)
    }

    /// Tears down the mapping previously created at exactly
    /// `(addr, length)`.
    pub fn munmap(
        &mut self,
        addr: VirtAddr,
        length: u64,
        space: &mut impl AddressSpaceOps,
        heap: &KernelHeap,
    ) -> Result<(), VmError> {
        if addr.as_u64() >= KERNBASE || length == 0 {
            return Err(VmError::InvalidArgument);
        }

        let mut prev: *mut Region = ptr::null_mut();
        let mut cur = self.head;
        // SAFETY: list links are valid nodes owned by `self`; exclusive
        // access through `&mut self`.
        unsafe {
            while !cur.is_null()
                && !((*cur).used && (*cur).start == addr && (*cur).length == length)
            {
                prev = cur;
                cur = (*cur).next;
            }
            let Some(cur) = NonNull::new(cur) else {
                return Err(VmError::NoSuchMapping);
            };
            let cur = cur.as_ptr();

            // Page tables first: if the mapper refuses, the call must
            // leave no trace.
            space.unmap_range((*cur).start, (*cur).start + (*cur).capacity)?;

            // The node reverts to a gap covering its whole span.
            (*cur).length = (*cur).capacity;
            (*cur).used = false;
            (*cur).kind = RegionKind::Anonymous;
            (*cur).prot = ProtFlags::empty();
            (*cur).flags = MapFlags::empty();
            (*cur).fd = -1;
            (*cur).offset = 0;

            let mut cur = cur;
            if !prev.is_null() && !(*prev).used && (*prev).end() == (*cur).start {
                (*prev).length += (*cur).capacity;
                (*prev).capacity += (*cur).capacity;
                (*prev).next = (*cur).next;
                Region::release(heap, cur);
                cur = prev;
            }
            let next = (*cur).next;
            if !next.is_null() && !(*next).used && (*cur).end() == (*next).start {
                (*cur).length += (*next).capacity;
                (*cur).capacity += (*next).capacity;
                (*cur).next = (*next).next;
                Region::release(heap, next);
            }
        }
        self.reclaim_tail(space, heap);
        kdebug!("munmap: {:#x}+{:#x} released", addr, length);
        Ok(())
    }

    /// Clones the region list for a forked child.
    ///
    /// Order and field values are preserved. Page-table entries are not
    /// duplicated — that is the fork path's job on the child's address
    /// space. On a mid-clone allocation failure the partial copy is
    /// released and nothing leaks.
    pub fn clone_for_fork(&self, heap: &KernelHeap) -> Result<ProcessVm, VmError> {
        let mut new_head: *mut Region = ptr::null_mut();
        let mut tail: *mut Region = ptr::null_mut();
        let mut cur = self.head;
        // SAFETY: source links are valid; copies are fresh heap nodes.
        unsafe {
            while !cur.is_null() {
                let Some(copy) = Region::alloc_node(heap) else {
                    let mut n = new_head;
                    while !n.is_null() {
                        let next = (*n).next;
                        Region::release(heap, n);
                        n = next;
                    }
                    return Err(VmError::OutOfMemory);
                };
                let copy = copy.as_ptr();
                let mut cloned = (*cur).clone();
                cloned.next = ptr::null_mut();
                copy.write(cloned);
                if tail.is_null() {
                    new_head = copy;
                } else {
                    (*tail).next = copy;
                }
                tail = copy;
                cur = (*cur).next;
            }
        }
        Ok(ProcessVm {
            brk: self.brk,
            head: new_head,
        })
    }

    /// Releases every node on process exit.
    ///
    /// The caller must already have torn down live mappings; a node
    /// still marked used is logged and released anyway.
    pub fn release_all(&mut self, heap: &KernelHeap) {
        let mut cur = self.head;
        self.head = ptr::null_mut();
        // SAFETY: the nodes are owned by `self` and no longer reachable
        // once the head is cleared.
        unsafe {
            while !cur.is_null() {
                if (*cur).used {
                    kwarn!("region list released with live mapping at {:#x}", (*cur).start);
                }
                let next = (*cur).next;
                Region::release(heap, cur);
                cur = next;
            }
        }
    }

    /// Places a mapping at or above the rounded break (placement said
    /// nothing below fits better).
    fn map_at_top(
        &mut self,
        addr: VirtAddr,
        req: &MapRequest,
        space: &mut impl AddressSpaceOps,
        heap: &KernelHeap,
    ) -> Result<VirtAddr, VmError> {
        let base = VirtAddr::new(page_round_up(self.brk.as_u64()));
        let gap = addr - base;
        debug_assert!(gap % PAGE_SIZE as u64 == 0, "top placement must be page-aligned");
        let capacity = page_round_up(req.length);
        let end = addr + req.length;

        space.map_range(self.brk, end)?;

        let Some(node) = Region::new_used(heap, addr, req.length, capacity, req) else {
            let _ = space.unmap_range(self.brk, end);
            return Err(VmError::OutOfMemory);
        };
        if gap > 0 {
            let Some(gap_node) = Region::new_free(heap, base, gap) else {
                // SAFETY: `node` was just created and never linked.
                unsafe { Region::release(heap, node.as_ptr()) };
                let _ = space.unmap_range(self.brk, end);
                return Err(VmError::OutOfMemory);
            };
            // The reserved gap must not keep live page-table entries.
            if let Err(e) = space.unmap_range(base, base + gap) {
                // SAFETY: both nodes are fresh and unlinked.
                unsafe {
                    Region::release(heap, gap_node.as_ptr());
                    Region::release(heap, node.as_ptr());
                }
                let _ = space.unmap_range(self.brk, end);
                return Err(e);
            }
            // SAFETY: fresh nodes; the chain gap -> used goes on the tail.
            unsafe { (*gap_node.as_ptr()).next = node.as_ptr() };
            self.link_tail(gap_node.as_ptr());
        } else {
            self.link_tail(node.as_ptr());
        }
        self.brk = addr + capacity;
        Ok(addr)
    }

    /// Places a mapping inside the free node chosen by the placement
    /// search, splitting off leading and trailing remainders as needed.
    fn map_into_gap(
        &mut self,
        node: NonNull<Region>,
        closest: VirtAddr,
        req: &MapRequest,
        space: &mut impl AddressSpaceOps,
        heap: &KernelHeap,
    ) -> Result<VirtAddr, VmError> {
        let b = node.as_ptr();
        // SAFETY: `b` is a node of this list; exclusive access through
        // `&mut self`. Split nodes are fresh until linked.
        unsafe {
            let b_start = (*b).start;
            let block_end = page_round_up((closest + req.length).as_u64());
            let pre = closest - b_start;
            let post = (b_start.as_u64() + (*b).length) - block_end;
            let capacity = block_end - closest.as_u64();
            if pre % PAGE_SIZE as u64 != 0 {
                kwarn!(
                    "mmap: gap at {:#x} yields unaligned head split of {:#x} bytes",
                    b_start,
                    pre
                );
                return Err(VmError::Corrupted);
            }
            let (old_len, old_cap) = ((*b).length, (*b).capacity);

            let mut post_node: *mut Region = ptr::null_mut();
            if post > 0 {
                let Some(p) = Region::new_free(heap, VirtAddr::new(block_end), post) else {
                    return Err(VmError::OutOfMemory);
                };
                post_node = p.as_ptr();
                (*post_node).next = (*b).next;
                (*b).next = post_node;
                (*b).length = req.length;
                (*b).capacity = capacity;
            }

            let target = if pre > 0 {
                let Some(inner) = Region::new_used(heap, closest, req.length, capacity, req)
                else {
                    if !post_node.is_null() {
                        (*b).next = (*post_node).next;
                        (*b).length = old_len;
                        (*b).capacity = old_cap;
                        Region::release(heap, post_node);
                    }
                    return Err(VmError::OutOfMemory);
                };
                let inner = inner.as_ptr();
                (*b).length = pre;
                (*b).capacity = pre;
                (*inner).next = (*b).next;
                (*b).next = inner;
                inner
            } else {
                (*b).length = req.length;
                (*b).capacity = capacity;
                b
            };

            if let Err(e) = space.map_range(closest, closest + req.length) {
                // Undo the splits in reverse; `b` reabsorbs the span.
                if target != b {
                    (*b).next = (*target).next;
                    (*b).capacity += capacity;
                    (*b).length = (*b).capacity;
                    Region::release(heap, target);
                }
                if !post_node.is_null() {
                    (*b).next = (*post_node).next;
                    (*b).capacity += post;
                    (*b).length = (*b).capacity;
                    Region::release(heap, post_node);
                }
                if target == b && post_node.is_null() {
                    (*b).length = old_len;
                    (*b).capacity = old_cap;
                }
                return Err(e);
            }

            (*target).used = true;
            (*target).length = req.length;
            (*target).capacity = capacity;
            (*target).kind = req.kind();
            (*target).prot = req.prot;
            (*target).flags = req.flags;
            (*target).fd = req.fd;
            (*target).offset = req.offset;
            Ok(closest)
        }
    }

    /// Lowers the break when the highest node is an unused gap ending
    /// exactly at it. Safe at any time: a gap's span holds no PTEs.
    fn reclaim_tail(&mut self, space: &mut impl AddressSpaceOps, heap: &KernelHeap) {
        let (prev, last) = self.tail();
        if last.is_null() {
            return;
        }
        // SAFETY: `prev` and `last` are nodes of this list.
        unsafe {
            if (*last).used || (*last).end() != self.brk {
                return;
            }
            self.brk = (*last).start;
            if prev.is_null() {
                self.head = ptr::null_mut();
            } else {
                (*prev).next = ptr::null_mut();
            }
            Region::release(heap, last);
        }
        space.activate();
    }

    /// Last node and its predecessor (both null for an empty list).
    fn tail(&self) -> (*mut Region, *mut Region) {
        let mut prev: *mut Region = ptr::null_mut();
        let mut cur = self.head;
        // SAFETY: list links are valid nodes owned by `self`.
        unsafe {
            while !cur.is_null() && !(*cur).next.is_null() {
                prev = cur;
                cur = (*cur).next;
            }
        }
        (prev, cur)
    }

    /// Appends an unlinked node (or chain of nodes) at the tail.
    fn link_tail(&mut self, chain: *mut Region) {
        let (_, last) = self.tail();
        if last.is_null() {
            self.head = chain;
        } else {
            // SAFETY: `last` is the final node of this list.
            unsafe { (*last).next = chain };
        }
    }
}

impl fmt::Debug for ProcessVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProcessVm {{ brk: {:#x}", self.brk)?;
        for r in self.regions() {
            write!(
                f,
                ", [{:#x}+{:#x}/{:#x} {}]",
                r.start,
                r.length,
                r.capacity,
                if r.used { "used" } else { "free" }
            )?;
        }
        write!(f, " }}")
    }
}

/// Iterator over a process's regions in address order.
pub struct RegionIter<'a> {
    cur: *mut Region,
    _marker: PhantomData<&'a Region>,
}

impl<'a> Iterator for RegionIter<'a> {
    type Item = &'a Region;

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: the iterator borrows the list; links stay valid for
        // the borrow's lifetime.
        let r = unsafe { self.cur.as_ref()? };
        self.cur = r.next;
        Some(r)
    }
}
