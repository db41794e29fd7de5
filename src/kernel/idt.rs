//! The 256-entry interrupt descriptor table and the vector layout of §6:
//!
//! ```text
//! 0..31    CPU exceptions (14 replaced by the page-fault handler)
//! 32..47   legacy PIC IRQs 0..15
//! 48..55   IOAPIC-redirected IRQs 16..23
//! 112..114 irq80..irq82, reserved for drivers
//! 121      wakeup IPI
//! 122      mmnif doorbell
//! 123      APIC timer
//! 124,125  LINT0, LINT1
//! 126      APIC error
//! 127      APIC spurious
//! 128      legacy syscall
//! ```

use hermit_sync::InterruptTicketMutex;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::kernel::gdt::{DOUBLE_FAULT_IST_INDEX, PAGE_FAULT_IST_INDEX};

pub const PIC_1_OFFSET: u8 = 32;
pub const IOAPIC_OFFSET: u8 = 48;
pub const IRQ_RESERVED_BASE: u8 = 112;
/// TLB-shootdown IPI (§4.2, §4.4 IPI). Not named in §6's table; the legacy
/// source this kernel descends from used the first reserved-driver vector for
/// it, preserved here rather than inventing a new number.
pub const TLB_FLUSH_VECTOR: u8 = IRQ_RESERVED_BASE;
pub const WAKEUP_VECTOR: u8 = 121;
pub const MMNIF_VECTOR: u8 = 122;
pub const TIMER_VECTOR: u8 = 123;
pub const LINT0_VECTOR: u8 = 124;
pub const LINT1_VECTOR: u8 = 125;
pub const ERROR_VECTOR: u8 = 126;
pub const SPURIOUS_VECTOR: u8 = 127;
pub const SYSCALL_VECTOR: u8 = 128;

static IDT: InterruptTicketMutex<InterruptDescriptorTable> =
	InterruptTicketMutex::new(InterruptDescriptorTable::new());

extern "x86-interrupt" fn double_fault(frame: InterruptStackFrame, error: u64) -> ! {
	log::error!("double fault (error={error:#x}): {frame:#?}");
	loop {
		x86_64::instructions::hlt();
	}
}

extern "x86-interrupt" fn page_fault(frame: InterruptStackFrame, error: PageFaultErrorCode) {
	let addr = x86_64::registers::control::Cr2::read()
		.map(|a| a.as_u64())
		.unwrap_or(0);
	crate::mm::paging::page_fault_handler(addr, error.bits());
	let _ = frame;
}

extern "x86-interrupt" fn generic_exception(frame: InterruptStackFrame) {
	log::error!("unhandled CPU exception: {frame:#?}");
	crate::scheduler::abort_current_task(crate::errno::KernelError::Fault);
}

/// `#NM`: the first FPU instruction after a context switch traps here because
/// every switch sets `CR0.TS` (§5 FPU). Drives the lazy save/restore in
/// [`crate::scheduler::fpu_trap`].
extern "x86-interrupt" fn device_not_available(_frame: InterruptStackFrame) {
	crate::scheduler::fpu_trap();
}

/// Builds and loads this core's IDT. Exception vectors 0..31 get a uniform
/// handler except `#DF` (8, IST-switched) and `#PF` (14, routed to the paging
/// module); vectors 32 and up are wired by [`crate::kernel::interrupts`] and
/// [`crate::kernel::apic`] as those subsystems come up.
pub fn init() {
	let mut idt = IDT.lock();
	unsafe {
		idt.double_fault
			.set_handler_fn(double_fault)
			.set_stack_index(DOUBLE_FAULT_IST_INDEX);
		idt.page_fault
			.set_handler_fn(page_fault)
			.set_stack_index(PAGE_FAULT_IST_INDEX);
	}
	macro_rules! generic {
		($($name:ident),*) => {
			$(idt.$name.set_handler_fn(generic_exception);)*
		};
	}
	generic!(
		divide_error,
		debug,
		non_maskable_interrupt,
		breakpoint,
		overflow,
		bound_range_exceeded,
		invalid_opcode,
		invalid_tss,
		segment_not_present,
		stack_segment_fault,
		general_protection_fault,
		x87_floating_point,
		alignment_check,
		machine_check,
		simd_floating_point
	);
	idt.device_not_available.set_handler_fn(device_not_available);
}

/// Installs `handler` at `vector` (32..255: the range the `x86_64` crate
/// exposes for software-defined use). Used by every vector owner above the
/// CPU-exception range — APIC, IOAPIC-redirected IRQs, IPIs, mmnif — so the
/// 256-entry table has exactly one owner.
pub fn register(vector: u8, handler: extern "x86-interrupt" fn(InterruptStackFrame)) {
	assert!(vector >= 32, "vectors below 32 are reserved for CPU exceptions");
	IDT.lock()[vector].set_handler_fn(handler);
}

/// Loads the already-initialized IDT onto the current core. Separate from
/// [`init`] so the IDT contents are built once and simply reloaded on each AP.
pub fn load() {
	unsafe {
		let ptr = IDT.data_ptr();
		(*ptr).load_unsafe();
	}
}
