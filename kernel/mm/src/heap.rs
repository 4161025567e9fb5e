//! Kernel heap allocator (`kmalloc` / `kmfree`).
//!
//! A first-fit allocator over a circular free list of block headers.
//! Every block is a whole number of *units*, one unit being the size of
//! a header, so bodies come out naturally aligned and all pointer
//! arithmetic is in units rather than bytes. A zero-size sentinel
//! anchors the list and a roving cursor marks both where the next
//! search starts and where freed blocks coalesce from, which keeps
//! activity clustered.
//!
//! Memory arrives one page frame at a time from a registered frame
//! source and is never handed back; freed blocks return to the list and
//! merge with exactly-adjacent neighbors. A single request can never
//! exceed one page's worth of units — that limit is a hard abort, not
//! an error return.

use core::mem;
use core::ptr::{self, NonNull};

use muon_core::sync::SpinLock;

use crate::PAGE_SIZE;

/// Source of page frames for the heap.
///
/// Returns one page of kernel-writable, page-aligned memory, or `None`
/// when physical memory is exhausted. Frames handed to the heap are
/// owned by it for good.
pub type FrameSourceFn = fn() -> Option<NonNull<u8>>;

/// Block header, stored at the start of every block.
///
/// The header doubles as the allocation unit: sizes count units, and
/// block addresses are unit multiples within their frame.
#[repr(C)]
struct Block {
    /// Next free block; meaningful only while this block is on the list.
    next: *mut Block,
    /// Whole-block size in units, this header included.
    size: usize,
}

/// Size of one allocation unit in bytes.
const UNIT: usize = mem::size_of::<Block>();

/// Units carried by a single page frame.
const UNITS_PER_PAGE: usize = PAGE_SIZE / UNIT;

struct HeapInner {
    /// Sentinel anchoring the circular free list; its size stays 0.
    base: Block,
    /// Roving cursor. Null until the first allocation initializes the list.
    cursor: *mut Block,
    /// Registered page-frame source.
    frame_fn: Option<FrameSourceFn>,
}

// SAFETY: the inner state is only touched under the SpinLock.
unsafe impl Send for HeapInner {}

/// The kernel heap.
///
/// Const-constructible so it can live in a `static`. The sentinel links
/// into itself once the free list exists, so a populated heap must not
/// be moved; instances outside the global either stay in place or sit
/// behind a `Box`.
pub struct KernelHeap {
    inner: SpinLock<HeapInner>,
}

impl KernelHeap {
    /// Creates an empty heap with no frame source.
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(HeapInner {
                base: Block {
                    next: ptr::null_mut(),
                    size: 0,
                },
                cursor: ptr::null_mut(),
                frame_fn: None,
            }),
        }
    }

    /// Registers the frame source consulted when the free list runs dry.
    pub fn set_frame_source(&self, f: FrameSourceFn) {
        self.inner.lock().frame_fn = Some(f);
    }

    /// Allocates a block with at least `nbytes` usable bytes.
    ///
    /// Returns null when no frame can be obtained. The block starts
    /// immediately after its header and is unit-aligned.
    ///
    /// # Panics
    ///
    /// A request larger than one page's worth of units aborts the
    /// kernel; the heap is for small objects only.
    pub fn alloc(&self, nbytes: usize) -> *mut u8 {
        let nunits = nbytes.div_ceil(UNIT) + 1;
        assert!(
            nunits <= UNITS_PER_PAGE,
            "kmalloc: request of {nbytes} bytes exceeds one page"
        );

        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        let base: *mut Block = &raw mut inner.base;
        if inner.cursor.is_null() {
            inner.base.next = base;
            inner.base.size = 0;
            inner.cursor = base;
        }

        let mut prev = inner.cursor;
        // SAFETY: every pointer on the free list is either the sentinel
        // or a header within a frame owned by the heap; sizes keep each
        // block inside its frame, so unit arithmetic stays in bounds.
        unsafe {
            let mut p = (*prev).next;
            loop {
                if (*p).size >= nunits {
                    if (*p).size == nunits {
                        // Exact fit: unlink the whole block.
                        (*prev).next = (*p).next;
                    } else {
                        // Shrink in place and carve the tail off; the
                        // tail is the allocation and never joins the list.
                        (*p).size -= nunits;
                        p = p.add((*p).size);
                        (*p).size = nunits;
                    }
                    inner.cursor = prev;
                    return p.add(1).cast::<u8>();
                }
                if p == inner.cursor {
                    // Wrapped without a fit; pull in a fresh frame.
                    p = match Self::grow(inner) {
                        Some(block) => block.as_ptr(),
                        None => return ptr::null_mut(),
                    };
                }
                prev = p;
                p = (*p).next;
            }
        }
    }

    /// Returns a block to the free pool.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`alloc`](Self::alloc) on this
    /// heap and not freed since.
    pub unsafe fn free(&self, ptr: *mut u8) {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.cursor.is_null(), "kmfree before any kmalloc");
        // SAFETY: caller contract puts `ptr` one unit past a live header.
        unsafe { Self::release(&mut inner, ptr) };
    }

    /// Total units currently on the free list.
    pub fn free_units(&self) -> usize {
        let mut inner = self.inner.lock();
        let inner = &mut *inner;
        if inner.cursor.is_null() {
            return 0;
        }
        let base: *mut Block = &raw mut inner.base;
        let mut total = 0;
        // SAFETY: free-list pointers are valid (see `alloc`) and the
        // list is circular, so the walk terminates back at the sentinel.
        unsafe {
            let mut p = (*base).next;
            while p != base {
                total += (*p).size;
                p = (*p).next;
            }
        }
        total
    }

    /// Obtains one page frame and injects it as a single block through
    /// the release path, so it coalesces with an adjacent span if the
    /// source hands out contiguous frames.
    fn grow(inner: &mut HeapInner) -> Option<NonNull<Block>> {
        let frame_fn = inner.frame_fn?;
        let page = frame_fn()?;
        let block = page.cast::<Block>().as_ptr();
        // SAFETY: the frame is one page of writable memory; the header
        // sits at its start and the size claims exactly the frame.
        unsafe {
            (*block).size = UNITS_PER_PAGE;
            (*block).next = ptr::null_mut();
            Self::release(inner, block.add(1).cast::<u8>());
        }
        NonNull::new(inner.cursor)
    }

    /// Links the block whose body is `ptr` back into the address-ordered
    /// circular list, merging with exactly-adjacent neighbors.
    ///
    /// # Safety
    ///
    /// `ptr` must be the body of a block carved by this heap, and the
    /// free list must be initialized.
    unsafe fn release(inner: &mut HeapInner, ptr: *mut u8) {
        // SAFETY: the body sits one unit past its header; the walk below
        // only follows free-list links, which are valid headers.
        unsafe {
            let bp = ptr.cast::<Block>().sub(1);
            // Find p with p < bp < p.next; at the wrap point (p >= p.next)
            // the slot also catches bp beyond the highest or below the
            // lowest block.
            let mut p = inner.cursor;
            while !(bp > p && bp < (*p).next) {
                if p >= (*p).next && (bp > p || bp < (*p).next) {
                    break;
                }
                p = (*p).next;
            }
            if bp.add((*bp).size) == (*p).next {
                // Upper neighbor is exactly adjacent: absorb it.
                let upper = (*p).next;
                (*bp).size += (*upper).size;
                (*bp).next = (*upper).next;
            } else {
                (*bp).next = (*p).next;
            }
            if p.add((*p).size) == bp {
                // Lower neighbor is exactly adjacent: absorb into it.
                (*p).size += (*bp).size;
                (*p).next = (*bp).next;
            } else {
                (*p).next = bp;
            }
            inner.cursor = p;
        }
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide kernel heap.
static KERNEL_HEAP: KernelHeap = KernelHeap::new();

/// Registers the frame source used by the global kernel heap.
pub fn register_frame_source(f: FrameSourceFn) {
    KERNEL_HEAP.set_frame_source(f);
}

/// Returns the global kernel heap.
pub fn kernel_heap() -> &'static KernelHeap {
    &KERNEL_HEAP
}

/// Allocates `nbytes` from the global kernel heap. Null on exhaustion.
pub fn kmalloc(nbytes: usize) -> *mut u8 {
    KERNEL_HEAP.alloc(nbytes)
}

/// Returns a block to the global kernel heap.
///
/// # Safety
///
/// `ptr` must have come from [`kmalloc`] and not been freed since.
pub unsafe fn kmfree(ptr: *mut u8) {
    // SAFETY: forwarded caller contract.
    unsafe { KERNEL_HEAP.free(ptr) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::Layout;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn frame_layout() -> Layout {
        Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).unwrap()
    }

    /// Hands out freshly allocated host pages. The heap keeps its frames
    /// for good, so test frames are simply left to the process.
    fn host_frame() -> Option<NonNull<u8>> {
        // SAFETY: valid non-zero-size layout.
        NonNull::new(unsafe { std::alloc::alloc_zeroed(frame_layout()) })
    }

    fn empty_frame() -> Option<NonNull<u8>> {
        None
    }

    /// Boxed so the sentinel's self-link stays put.
    fn test_heap() -> Box<KernelHeap> {
        let heap = Box::new(KernelHeap::new());
        heap.set_frame_source(host_frame);
        heap
    }

    #[test]
    fn alloc_returns_writable_memory() {
        let heap = test_heap();
        let p = heap.alloc(64);
        assert!(!p.is_null());
        // SAFETY: 64 usable bytes were just allocated.
        unsafe {
            ptr::write_bytes(p, 0xAB, 64);
            assert_eq!(*p, 0xAB);
            heap.free(p);
        }
    }

    #[test]
    fn alloc_zero_bytes_still_yields_a_block() {
        let heap = test_heap();
        let p = heap.alloc(0);
        assert!(!p.is_null());
        unsafe { heap.free(p) };
    }

    #[test]
    fn blocks_do_not_overlap() {
        let heap = test_heap();
        let a = heap.alloc(100);
        let b = heap.alloc(100);
        assert!(!a.is_null() && !b.is_null());
        let (a_addr, b_addr) = (a as usize, b as usize);
        let span = 100;
        assert!(a_addr + span <= b_addr || b_addr + span <= a_addr);
        unsafe {
            heap.free(a);
            heap.free(b);
        }
    }

    #[test]
    fn bodies_are_unit_aligned() {
        let heap = test_heap();
        for nbytes in [1, 7, 16, 47, 255] {
            let p = heap.alloc(nbytes);
            assert!(!p.is_null());
            assert_eq!(p as usize % UNIT, 0, "body misaligned for {nbytes}");
            unsafe { heap.free(p) };
        }
    }

    #[test]
    fn alloc_without_frame_source_is_null() {
        let heap = Box::new(KernelHeap::new());
        assert!(heap.alloc(8).is_null());
    }

    #[test]
    fn alloc_on_exhausted_source_is_null() {
        let heap = Box::new(KernelHeap::new());
        heap.set_frame_source(empty_frame);
        assert!(heap.alloc(8).is_null());
    }

    #[test]
    #[should_panic(expected = "exceeds one page")]
    fn oversize_request_aborts() {
        let heap = test_heap();
        let _ = heap.alloc(PAGE_SIZE);
    }

    #[test]
    fn free_restores_free_units() {
        let heap = test_heap();
        let warmup = heap.alloc(32);
        assert!(!warmup.is_null());
        unsafe { heap.free(warmup) };

        let before = heap.free_units();
        let p = heap.alloc(47);
        assert!(!p.is_null());
        assert!(heap.free_units() < before);
        unsafe { heap.free(p) };
        assert_eq!(heap.free_units(), before);
    }

    #[test]
    fn freed_neighbors_coalesce() {
        let heap = test_heap();
        let a = heap.alloc(47);
        let b = heap.alloc(47);
        let c = heap.alloc(47);
        assert!(!a.is_null() && !b.is_null() && !c.is_null());
        unsafe {
            heap.free(b);
            heap.free(a);
            heap.free(c);
        }
        // Everything merged back into the single page-sized block.
        assert_eq!(heap.free_units(), UNITS_PER_PAGE);
    }

    #[test]
    fn free_list_survives_out_of_order_frees() {
        let heap = test_heap();
        let blocks: Vec<*mut u8> = (0..8).map(|_| heap.alloc(64)).collect();
        assert!(blocks.iter().all(|p| !p.is_null()));
        for &p in blocks.iter().step_by(2) {
            unsafe { heap.free(p) };
        }
        for &p in blocks.iter().skip(1).step_by(2) {
            unsafe { heap.free(p) };
        }
        assert_eq!(heap.free_units(), UNITS_PER_PAGE);
    }

    #[test]
    fn tail_carving_reuses_the_same_block() {
        let heap = test_heap();
        let a = heap.alloc(47);
        assert!(!a.is_null());
        unsafe { heap.free(a) };
        let b = heap.alloc(47);
        // Identical request right after the free carves the same tail.
        assert_eq!(a, b);
        unsafe { heap.free(b) };
    }

    #[test]
    fn grows_past_one_page() {
        let heap = test_heap();
        // Each 1000-byte request takes 64 units; five of them cannot fit
        // in the 256 units a single page provides.
        let blocks: Vec<*mut u8> = (0..5).map(|_| heap.alloc(1000)).collect();
        assert!(blocks.iter().all(|p| !p.is_null()));
        for &p in &blocks {
            unsafe { heap.free(p) };
        }
        assert_eq!(heap.free_units(), 2 * UNITS_PER_PAGE);
    }

    #[test]
    fn alternating_alloc_free_needs_one_frame() {
        static FRAMES: AtomicUsize = AtomicUsize::new(0);
        fn counting_frame() -> Option<NonNull<u8>> {
            FRAMES.fetch_add(1, Ordering::Relaxed);
            // SAFETY: valid non-zero-size layout.
            NonNull::new(unsafe { std::alloc::alloc_zeroed(frame_layout()) })
        }

        let heap = Box::new(KernelHeap::new());
        heap.set_frame_source(counting_frame);
        for _ in 0..10_000 {
            let p = heap.alloc(47);
            assert!(!p.is_null());
            unsafe { heap.free(p) };
        }
        assert_eq!(FRAMES.load(Ordering::Relaxed), 1);
    }
}
