//! Kernel virtual address space allocator, backing APIC/IOAPIC MMIO mappings and
//! per-core scratch pages. Unlike the physical frame pool this one is allowed to
//! coalesce, so it is built directly on the `free-list` crate.

use align_address::Align;
use free_list::{AllocError, FreeList, PageLayout, PageRange};
use hermit_sync::InterruptTicketMutex;
use memory_addresses::VirtAddr;

use crate::mm::paging::BasePageSize;

static KERNEL_FREE_LIST: InterruptTicketMutex<FreeList<16>> =
	InterruptTicketMutex::new(FreeList::new());

/// End of the virtual memory address space reserved for kernel memory
/// (inclusive). The task heap's VMA starts after this.
pub fn kernel_heap_end() -> VirtAddr {
	use x86_64::structures::paging::PageTableIndex;

	let p4_index = PageTableIndex::new(256);
	let addr = u64::from(p4_index) << 39;
	VirtAddr::new_truncate(addr - 1)
}

pub fn init() {
	let range = PageRange::new(
		kernel_heap_end().as_usize().div_ceil(2),
		kernel_heap_end().as_usize() + 1,
	)
	.unwrap();
	unsafe {
		KERNEL_FREE_LIST.lock().deallocate(range).unwrap();
	}
}

pub fn allocate(size: usize) -> Result<VirtAddr, AllocError> {
	assert!(size > 0);
	assert_eq!(size % BasePageSize::SIZE as usize, 0);
	let layout = PageLayout::from_size(size).unwrap();
	Ok(VirtAddr::new(
		KERNEL_FREE_LIST
			.lock()
			.allocate(layout)?
			.start()
			.try_into()
			.unwrap(),
	))
}

pub fn allocate_aligned(size: usize, align: usize) -> Result<VirtAddr, AllocError> {
	assert!(size > 0 && align > 0);
	assert_eq!(size % align, 0);
	let layout = PageLayout::from_size_align(size, align).unwrap();
	Ok(VirtAddr::new(
		KERNEL_FREE_LIST
			.lock()
			.allocate(layout)?
			.start()
			.try_into()
			.unwrap(),
	))
}

pub fn deallocate(virtual_address: VirtAddr, size: usize) {
	assert!(virtual_address.is_aligned_to(BasePageSize::SIZE));
	assert!(size > 0 && size % BasePageSize::SIZE as usize == 0);
	let range = PageRange::from_start_len(virtual_address.as_u64() as usize, size).unwrap();
	unsafe {
		KERNEL_FREE_LIST.lock().deallocate(range).unwrap();
	}
}
