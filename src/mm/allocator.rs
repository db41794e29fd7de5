//! Kernel heap global allocator, backed by `talc` — the allocator the current
//! dependency manifest actually declares, rather than either of the two older
//! allocators (`good_memory_allocator`, a bootstrap-bump + `linked_list_allocator`
//! combo) found across the snapshot this crate is descended from.

use core::alloc::{GlobalAlloc, Layout};

use talc::{ClaimOnOom, Span, Talc, Talck};

/// Wraps `Talck` so the heap span can be claimed lazily once `mm::init` has
/// carved out the initial heap VMA and backing pages.
pub struct KernelAllocator(Talck<hermit_sync::RawInterruptTicketMutex, ClaimOnOom>);

impl KernelAllocator {
	pub const fn empty() -> Self {
		// Span is claimed for real in `init`; this placeholder is never
		// dereferenced before that runs.
		let span = Span::empty();
		Self(Talc::new(ClaimOnOom::new(span)).lock())
	}

	/// Claims `[heap_start, heap_start + size)` as the initial arena. Must run
	/// exactly once, after the backing pages have been mapped.
	pub unsafe fn init(&self, heap_start: *mut u8, size: usize) {
		unsafe {
			self.0
				.lock()
				.claim(Span::new(heap_start, heap_start.add(size)))
				.expect("failed to claim initial kernel heap span");
		}
	}
}

unsafe impl GlobalAlloc for KernelAllocator {
	unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
		unsafe { self.0.alloc(layout) }
	}

	unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
		unsafe { self.0.dealloc(ptr, layout) }
	}
}
