//! `CoreLocal<T>`: an explicit per-core-global wrapper, replacing the `per_core(x)`
//! macro of the lineage this kernel descends from (§9 Design Notes). The
//! accessor's contract — IRQs disabled for the duration — is documented rather
//! than enforced by the type, matching every call site in the original.

use core::cell::Cell;

use x86_64::registers::model_specific::GsBase;
use x86_64::VirtAddr;

use crate::scheduler::{CoreId, PerCoreScheduler};

/// Per-core state reachable via `GS_BASE`. One instance is allocated per core at
/// AP bring-up and installed with [`CoreLocal::install`].
pub struct CoreLocal {
	this: *const Self,
	pub core_id: CoreId,
	scheduler: Cell<*mut PerCoreScheduler>,
	irq_counters: [Cell<u64>; 16],
}

unsafe impl Sync for CoreLocal {}

impl CoreLocal {
	fn new(core_id: CoreId) -> alloc::boxed::Box<Self> {
		alloc::boxed::Box::new(Self {
			this: core::ptr::null(),
			core_id,
			scheduler: Cell::new(core::ptr::null_mut()),
			irq_counters: core::array::from_fn(|_| Cell::new(0)),
		})
	}

	/// Builds this core's `CoreLocal` and publishes it through `GS_BASE`.
	///
	/// # Safety
	/// Must be called exactly once per core, before interrupts are enabled on
	/// that core.
	pub unsafe fn install(core_id: CoreId) {
		let mut boxed = Self::new(core_id);
		boxed.this = &*boxed as *const Self;
		let leaked = alloc::boxed::Box::leak(boxed) as *const Self;
		unsafe {
			GsBase::write(VirtAddr::new(leaked as u64));
		}
	}

	/// # Safety
	/// Requires interrupts disabled and [`CoreLocal::install`] to have already
	/// run on this core.
	#[inline]
	pub fn get() -> &'static Self {
		unsafe {
			let ptr: u64;
			core::arch::asm!("mov {}, gs:0", out(reg) ptr, options(nostack, preserves_flags));
			&*(ptr as *const Self)
		}
	}
}

#[inline]
pub fn core_id() -> CoreId {
	CoreLocal::get().core_id
}

/// Convenience alias for call sites (e.g. the logger) that read the core id
/// opportunistically; `CoreLocal::install` must already have run.
#[inline]
pub fn try_core_id() -> CoreId {
	core_id()
}

#[inline]
pub fn core_scheduler() -> &'static mut PerCoreScheduler {
	unsafe { &mut *CoreLocal::get().scheduler.get() }
}

#[inline]
pub fn set_core_scheduler(scheduler: *mut PerCoreScheduler) {
	CoreLocal::get().scheduler.set(scheduler);
}

#[inline]
pub fn increment_irq_counter(irq_no: u8) {
	if let Some(cell) = CoreLocal::get().irq_counters.get(irq_no as usize) {
		cell.set(cell.get() + 1);
	}
}

pub fn irq_counter(irq_no: u8) -> u64 {
	CoreLocal::get()
		.irq_counters
		.get(irq_no as usize)
		.map(Cell::get)
		.unwrap_or(0)
}
