//! Memory syscall surface: `mmap` and `munmap`.
//!
//! Raw integers in, raw integers out. Arguments are decoded into typed
//! requests here, results collapse to the classic convention — the
//! chosen address (or 0) on success, −1 on any failure. Everything
//! else, including validation, lives in [`vm`](crate::vm).

use muon_core::addr::VirtAddr;
use muon_core::kdebug;

use crate::heap::KernelHeap;
use crate::mapper::{AddressSpaceOps, MapFlags, ProtFlags};
use crate::region::MapRequest;
use crate::vm::ProcessVm;

// ── Memory syscall numbers (0x40–0x4F) ──────────────────────────────

/// Map memory into the calling process's address space.
pub const SYS_MMAP: usize = 0x40;
/// Unmap a previously mapped extent.
pub const SYS_MUNMAP: usize = 0x41;

/// Failure value shared by the memory syscalls.
pub const MAP_FAILED: isize = -1;

/// `mmap(addr, length, prot, flags, fd, offset)`.
///
/// `addr == 0` asks for any placement. Returns the mapped address, or
/// −1 on failure.
#[expect(
    clippy::cast_possible_wrap,
    clippy::cast_possible_truncation,
    reason = "user addresses sit below KERNBASE, far under the sign bit"
)]
#[expect(
    clippy::too_many_arguments,
    reason = "mirrors the six-argument syscall plus the per-process context"
)]
pub fn sys_mmap(
    vm: &mut ProcessVm,
    space: &mut impl AddressSpaceOps,
    heap: &KernelHeap,
    addr: usize,
    length: usize,
    prot: usize,
    flags: usize,
    fd: i32,
    offset: i64,
) -> isize {
    let req = MapRequest {
        addr: VirtAddr::new(addr as u64),
        length: length as u64,
        prot: ProtFlags::from_bits_truncate(prot as u32),
        flags: MapFlags::from_bits_truncate(flags as u32),
        fd,
        offset,
    };
    match vm.mmap(&req, space, heap) {
        Ok(va) => va.as_u64() as isize,
        Err(e) => {
            kdebug!("sys_mmap({addr:#x}, {length:#x}): {e}");
            MAP_FAILED
        }
    }
}

/// `munmap(addr, length)`.
///
/// The extent must exactly match a prior `mmap`. Returns 0 on success,
/// −1 on failure.
pub fn sys_munmap(
    vm: &mut ProcessVm,
    space: &mut impl AddressSpaceOps,
    heap: &KernelHeap,
    addr: usize,
    length: usize,
) -> isize {
    match vm.munmap(VirtAddr::new(addr as u64), length as u64, space, heap) {
        Ok(()) => 0,
        Err(e) => {
            kdebug!("sys_munmap({addr:#x}, {length:#x}): {e}");
            MAP_FAILED
        }
    }
}
