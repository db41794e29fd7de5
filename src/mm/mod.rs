//! Memory management: frame allocator, paging, VMA list, kernel virtual address
//! space, and the global heap allocator.

pub mod allocator;
pub mod freelist;
pub mod paging;
pub mod physicalmem;
pub mod virtualmem;
pub mod vma;

use crate::config::{boot_info, LARGE_PAGE_SIZE, PAGE_SIZE};

unsafe extern "C" {
	static kernel_start: u8;
	static kernel_end: u8;
}

fn align_down(addr: u64, align: u64) -> u64 {
	addr & !(align - 1)
}

fn align_up(addr: u64, align: u64) -> u64 {
	(addr + align - 1) & !(align - 1)
}

pub fn kernel_start_address() -> u64 {
	align_down(core::ptr::addr_of!(kernel_start) as u64, LARGE_PAGE_SIZE as u64)
}

pub fn kernel_end_address() -> u64 {
	align_up(core::ptr::addr_of!(kernel_end) as u64, LARGE_PAGE_SIZE as u64)
}

/// Runs the `paging → frame allocator → VMA → …` half of the bootstrap order
/// from §2 that is this module's responsibility; the remainder (IRQ/IDT, APIC,
/// timer, task model, scheduler) is driven by [`crate::kernel::init`].
pub fn init() {
	let info = boot_info();
	let mem_end = info.base_phys.load(core::sync::atomic::Ordering::Relaxed) + info.mem_size() as u64;

	physicalmem::init(kernel_end_address(), mem_end);
	virtualmem::init();

	vma::vma_add(
		kernel_start_address(),
		kernel_end_address(),
		vma::VmaFlags::READ | vma::VmaFlags::WRITE | vma::VmaFlags::EXECUTE,
	)
	.ok();

	const INITIAL_HEAP_SIZE: usize = 2 * 1024 * 1024;
	let heap_virt = allocate(INITIAL_HEAP_SIZE, true);
	unsafe {
		crate::ALLOCATOR.init(heap_virt as *mut u8, INITIAL_HEAP_SIZE);
	}
}

/// Allocates `sz` bytes of backed, mapped kernel memory (not merely a VMA
/// reservation — frame + virtual range + page-table mapping, all three).
pub fn allocate(sz: usize, execute_disable: bool) -> u64 {
	let size = align_up(sz as u64, PAGE_SIZE as u64);
	let phys = physicalmem::get_pages((size / PAGE_SIZE as u64) as usize);
	let virt = virtualmem::allocate(size as usize).expect("kernel virtual memory exhausted");

	let mut flags = paging::PageTableEntryFlags::empty();
	flags.normal().writable();
	if execute_disable {
		flags.execute_disable();
	}
	paging::map::<paging::BasePageSize>(
		virt.as_u64(),
		phys,
		(size / PAGE_SIZE as u64) as usize,
		flags,
		false,
	)
	.expect("page_map failed during kernel allocation");

	virt.as_u64()
}

pub fn deallocate(virt: u64, sz: usize) {
	let size = align_up(sz as u64, PAGE_SIZE as u64);
	let count = (size / PAGE_SIZE as u64) as usize;
	if let Some(phys) = paging::virt_to_phys(virt) {
		paging::unmap::<paging::BasePageSize>(virt, count);
		virtualmem::deallocate(memory_addresses::VirtAddr::new(virt), size as usize);
		physicalmem::put_pages(phys, count).ok();
	}
}
