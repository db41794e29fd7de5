//! A single-address-space library operating system (unikernel) for x86-64 (§1):
//! paging, frame allocator, VMA list, APIC/IPI plumbing, the per-core scheduler, and
//! the mmnif intra-isle shared-memory network transport. Boots either bare-metal via
//! multiboot or under the `uhyve` hypervisor.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod console;
pub mod errno;
pub mod kernel;
pub mod logging;
pub mod mm;
#[cfg(feature = "mmnif")]
pub mod net;
pub mod scheduler;
pub mod synch;

use core::panic::PanicInfo;

use config::boot_info;

#[global_allocator]
static ALLOCATOR: mm::allocator::KernelAllocator = mm::allocator::KernelAllocator::empty();

/// Entry point the loader jumps to with `rdx = mb_info` (§6 Boot entry). The ABI
/// hands us the multiboot info address in `rdx`, not the first System V argument
/// register, so this naked shim moves it over before calling into Rust.
#[cfg(not(test))]
#[unsafe(naked)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _start() -> ! {
	core::arch::naked_asm!("mov rdi, rdx", "call {entry}", entry = sym kernel_main)
}

#[cfg(not(test))]
extern "C" fn kernel_main(mb_info: usize) -> ! {
	unsafe {
		if boot_info().is_uhyve() {
			kernel::init_first_core_uhyve();
		} else {
			kernel::init_first_core_multiboot(mb_info);
		}
	}

	kernel::core_local::core_scheduler().reschedule();
	unreachable!("idle task does not return from its first schedule-in");
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo<'_>) -> ! {
	log::error!("{info}");
	if boot_info().is_uhyve() {
		kernel::shutdown(1);
	}
	loop {
		x86_64::instructions::interrupts::disable();
		x86_64::instructions::hlt();
	}
}

#[cfg(not(test))]
#[alloc_error_handler]
fn alloc_error(layout: core::alloc::Layout) -> ! {
	log::error!("out of memory: failed to allocate {} bytes", layout.size());
	kernel::shutdown(1);
}
