//! Platform glue: GDT/IDT/APIC/MP bring-up, per-core installation, the multiboot
//! and uhyve boot paths, and the `paging → frame allocator → VMA → IRQ/IDT → APIC →
//! timer → task model → scheduler` bootstrap order (§2).

pub mod apic;
pub mod core_local;
pub mod gdt;
pub mod idt;
pub mod interrupts;
pub mod mp;
pub mod multiboot;
pub mod processor;
pub mod uhyve;

use x86_64::VirtAddr;

use crate::config::{boot_info, IST_SIZE};
use crate::scheduler::{CoreId, PerCoreScheduler};

/// Maps a fresh `IST_SIZE` stack and returns its top, for the double-fault/page-fault
/// IST slots every core's GDT needs (§4.5: a stack overflow in task context must not
/// corrupt the fault handler's own stack).
fn map_ist_stack() -> VirtAddr {
	let base = crate::mm::allocate(IST_SIZE, true);
	VirtAddr::new(base + IST_SIZE as u64)
}

/// Brings up the boot processor (core, conventionally, with local APIC id 0): memory
/// management, this core's GDT/IDT/APIC, and the scheduler's idle task. Split from
/// [`init_first_core`] only by naming — there is exactly one boot processor and this
/// is its entire bring-up.
fn bring_up_this_core(core_id: CoreId) {
	unsafe {
		core_local::CoreLocal::install(core_id);
	}

	let double_fault_stack = map_ist_stack();
	let page_fault_stack = map_ist_stack();
	gdt::init(double_fault_stack, page_fault_stack);

	idt::init();
	idt::load();
	interrupts::init();
}

/// Entry point for the multiboot path (§6 Boot entry): `mb_info` is the physical
/// address the loader left in `rdx` at the ELF entry point.
///
/// # Safety
/// Must be called exactly once, at the very start of execution on the boot
/// processor, with `mb_info` pointing at a valid multiboot info structure.
pub unsafe fn init_first_core_multiboot(mb_info: usize) {
	unsafe {
		multiboot::init(mb_info);
	}
	init_first_core();
}

/// Entry point for the uhyve path (§6): the loader has already patched every
/// `BootInfo` field this kernel needs directly, so there is no info structure to
/// parse first.
///
/// # Safety
/// Must be called exactly once, at the very start of execution on the boot
/// processor.
pub unsafe fn init_first_core_uhyve() {
	init_first_core();
}

/// The bootstrap order of §2, common to both boot paths once `BootInfo` is
/// populated: paging/frame-allocator/VMA (`mm::init`), this core's IRQ plumbing, the
/// APIC (which also calibrates the tick timer), this core's scheduler, then — if
/// `smp` is enabled and more than one CPU was reported — every AP.
fn init_first_core() {
	crate::console::CONSOLE.lock().init();
	crate::logging::init();
	crate::mm::init();

	bring_up_this_core(CoreId(0));

	apic::init();
	apic::notify_online();

	#[cfg(feature = "mmnif")]
	crate::net::mmnif::init(1);

	PerCoreScheduler::install(CoreId(0));

	#[cfg(feature = "smp")]
	if boot_info().possible_cpus() > 1 {
		apic::boot_application_processors();
	}

	log::info!(
		"hermitcore-kernel up: {} CPU(s) reported, uhyve={}",
		boot_info().possible_cpus(),
		boot_info().is_uhyve()
	);
}

/// Entry point every AP's real-mode trampoline jumps into after enabling long mode
/// (§4.4 AP wakeup). Brings the core's own GDT/IDT/APIC/scheduler up, signals
/// `notify_online`, and falls into the idle loop via the first `reschedule`.
///
/// # Safety
/// Must run on a fresh AP stack, with paging already pointing at the shared kernel
/// address space (the trampoline's job, not this function's).
pub unsafe fn init_application_processor(core_id: CoreId) -> ! {
	bring_up_this_core(core_id);
	apic::init();
	PerCoreScheduler::install(core_id);
	apic::notify_online();

	interrupts::enable();
	core_local::core_scheduler().reschedule();
	unreachable!("idle task does not return from its first schedule-in");
}

/// §7 Shutdown: requests every core leave its run loop, waits for the APs to report
/// back, then halts the boot processor for good.
pub fn shutdown(exit_code: i32) -> ! {
	apic::request_shutdown();
	#[cfg(feature = "smp")]
	apic::wait_for_shutdown();

	if boot_info().is_uhyve() {
		uhyve::exit(exit_code);
	}

	log::info!("system halted (exit code {exit_code})");
	loop {
		x86_64::instructions::interrupts::disable();
		x86_64::instructions::hlt();
	}
}
