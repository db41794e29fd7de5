//! Frame allocator (§4.1): two structurally identical pools — ordinary RAM and an
//! optional high-bandwidth-memory pool — each a [`FreeList`] behind its own lock.

use core::sync::atomic::{AtomicU64, Ordering};

use hermit_sync::InterruptTicketMutex;

use crate::config::PAGE_SIZE;
use crate::mm::freelist::FreeList;

struct Pool {
	list: InterruptTicketMutex<FreeList>,
	total_pages: AtomicU64,
	total_allocated_pages: AtomicU64,
	total_available_pages: AtomicU64,
	base: AtomicU64,
}

impl Pool {
	const fn new() -> Self {
		Self {
			list: InterruptTicketMutex::new(FreeList::new()),
			total_pages: AtomicU64::new(0),
			total_allocated_pages: AtomicU64::new(0),
			total_available_pages: AtomicU64::new(0),
			base: AtomicU64::new(0),
		}
	}

	fn init(&self, start: u64, end: u64) {
		let pages = (end - start) / PAGE_SIZE as u64;
		self.list.lock().insert_initial(start, end);
		self.total_pages.store(pages, Ordering::Relaxed);
		self.total_available_pages.store(pages, Ordering::Relaxed);
		self.base.store(start.max(1), Ordering::Relaxed);
	}

	/// Returns `0` on exhaustion rather than panicking (§4.1 failure model: zero
	/// is an otherwise-impossible valid frame address).
	fn get_pages(&self, count: usize) -> u64 {
		let size = count as u64 * PAGE_SIZE as u64;
		match self.list.lock().allocate(size, PAGE_SIZE as u64) {
			Ok(addr) => {
				self.total_allocated_pages
					.fetch_add(count as u64, Ordering::Relaxed);
				self.total_available_pages
					.fetch_sub(count as u64, Ordering::Relaxed);
				addr
			}
			Err(_) => 0,
		}
	}

	fn put_pages(&self, phys: u64, count: usize) -> Result<(), crate::errno::KernelError> {
		let size = count as u64 * PAGE_SIZE as u64;
		self.list
			.lock()
			.deallocate(phys, phys + size)
			.map_err(|_| crate::errno::KernelError::Inval)?;
		self.total_allocated_pages
			.fetch_sub(count as u64, Ordering::Relaxed);
		self.total_available_pages
			.fetch_add(count as u64, Ordering::Relaxed);
		Ok(())
	}

	fn is_available(&self) -> bool {
		self.base.load(Ordering::Relaxed) != 0
	}
}

static RAM: Pool = Pool::new();
static HBMEM: Pool = Pool::new();

/// Seeds the ordinary RAM pool from the multiboot memory map, minus the kernel
/// image, command line, and the low I/O region below 1 MiB.
pub fn init(start: u64, end: u64) {
	RAM.init(start, end);
}

/// Seeds the high-bandwidth-memory pool, if the platform reports one.
pub fn init_hbmem(start: u64, end: u64) {
	HBMEM.init(start, end);
}

pub fn is_hbmem_available() -> bool {
	HBMEM.is_available()
}

pub fn get_pages(count: usize) -> u64 {
	RAM.get_pages(count)
}

pub fn put_pages(phys: u64, count: usize) -> Result<(), crate::errno::KernelError> {
	RAM.put_pages(phys, count)
}

pub fn get_pages_hbmem(count: usize) -> u64 {
	HBMEM.get_pages(count)
}

pub fn put_pages_hbmem(phys: u64, count: usize) -> Result<(), crate::errno::KernelError> {
	HBMEM.put_pages(phys, count)
}

/// Allocates one frame and zeroes it through the per-core scratch virtual
/// mapping before returning its physical address.
pub fn get_zeroed_page() -> u64 {
    let phys = get_pages(1);
    if phys == 0 {
        return 0;
    }
    crate::mm::paging::zero_frame(phys);
    phys
}

pub fn total_pages() -> u64 {
	RAM.total_pages.load(Ordering::Relaxed)
}

pub fn total_allocated_pages() -> u64 {
	RAM.total_allocated_pages.load(Ordering::Relaxed)
}

pub fn total_available_pages() -> u64 {
	RAM.total_available_pages.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn get_then_put_restores_available_count() {
		RAM.init(0x10_0000, 0x20_0000);
		let before = total_available_pages();
		let phys = get_pages(4);
		assert_ne!(phys, 0);
		assert_eq!(total_available_pages(), before - 4);
		put_pages(phys, 4).unwrap();
		assert_eq!(total_available_pages(), before);
	}
}
