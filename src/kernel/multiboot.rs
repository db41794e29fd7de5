//! Multiboot info consumption (§6 Boot entry, §4.3 architecture init). On the
//! non-uhyve path the loader hands the kernel a multiboot info structure instead of
//! pre-patching all of [`crate::config::BootInfo`] itself; this module fills in the
//! fields the loader left to us and reserves the VMAs covering the info block and
//! command line so the frame allocator never hands either address back out.

use core::sync::atomic::Ordering;

use hermit_multiboot::Multiboot;

use crate::config::{boot_info, PAGE_SIZE};
use crate::mm::vma::{vma_add, VmaFlags};

/// Walks the memory map for the highest available address below 4 GiB, which is
/// as much as this 32-bit-descriptor multiboot table can describe (§6).
fn highest_available_end(mb: &Multiboot) -> Option<u64> {
	mb.memory_map()?
		.filter(|entry| entry.is_available())
		.map(|entry| entry.base_address() as u64 + entry.length() as u64)
		.max()
}

/// Consumes the multiboot info block at `mb_info_addr`, populating the fields of
/// [`crate::config::boot_info`] that the loader's fixed-offset patch (§6) leaves to
/// this path, and reserving the info page and command line as VMAs (§4.3).
///
/// # Safety
/// `mb_info_addr` must point at a valid multiboot info structure, as it does for
/// every multiboot-compliant loader jumping to this kernel's entry point.
pub unsafe fn init(mb_info_addr: usize) {
	let mb = unsafe { Multiboot::new(mb_info_addr) };
	let info = boot_info();

	if let Some(end) = highest_available_end(&mb) {
		info.mem_size.store(end as usize, Ordering::Relaxed);
	}

	vma_add(
		(mb_info_addr as u64) & !(PAGE_SIZE as u64 - 1),
		((mb_info_addr as u64) & !(PAGE_SIZE as u64 - 1)) + PAGE_SIZE as u64,
		VmaFlags::READ,
	)
	.ok();

	if let Some(addr) = mb.command_line_address() {
		info.cmdline.store(addr as u64, Ordering::Relaxed);
		let len = unsafe { mb.command_line() }.map(str::len).unwrap_or(0);
		info.cmdline_len.store(len, Ordering::Relaxed);

		let page_start = (addr as u64) & !(PAGE_SIZE as u64 - 1);
		let page_end = ((addr as u64 + len as u64) + PAGE_SIZE as u64 - 1) & !(PAGE_SIZE as u64 - 1);
		vma_add(page_start, page_end.max(page_start + PAGE_SIZE as u64), VmaFlags::READ).ok();
	}
}

/// Returns the kernel command line as a UTF-8 string slice, if the loader supplied
/// one (either via multiboot or the uhyve-patched `BootInfo` fields).
pub fn command_line() -> Option<&'static str> {
	let info = boot_info();
	let addr = info.cmdline.load(Ordering::Relaxed);
	let len = info.cmdline_len.load(Ordering::Relaxed);
	if addr == 0 || len == 0 {
		return None;
	}
	unsafe {
		let slice = core::slice::from_raw_parts(addr as *const u8, len);
		core::str::from_utf8(slice).ok()
	}
}
