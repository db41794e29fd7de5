//! LAPIC/x2APIC/IOAPIC driver (§4.4): discovery, calibration, EOI, IPI send,
//! AP wakeup, IOAPIC redirection. The x2APIC (MSR) and xAPIC (MMIO) dispatch
//! paths are modeled as two implementations of [`LocalApic`] chosen once at
//! init (§9 Design Notes: "the read/write-function pointer indirection is
//! essential").

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use hermit_sync::OnceCell;
use x86_64::registers::model_specific::Msr;
use x86_64::structures::idt::InterruptStackFrame;

use crate::config::{boot_info, MAX_CORES, SMP_SETUP_ADDR, TIMER_FREQ};
use crate::kernel::idt::{
	self, ERROR_VECTOR, LINT0_VECTOR, LINT1_VECTOR, SPURIOUS_VECTOR, TIMER_VECTOR,
	TLB_FLUSH_VECTOR, WAKEUP_VECTOR,
};
use crate::kernel::{mp, processor};
use crate::mm::paging::{self, BasePageSize, PageTableEntryFlags};

const IA32_APIC_BASE: u32 = 0x1B;
const X2APIC_ENABLE: u64 = 1 << 10;

// x2APIC MSR register numbers (xAPIC MMIO offsets are `(reg - 0x800) << 4`).
const REG_ID: u32 = 0x802;
const REG_EOI: u32 = 0x80B;
const REG_SIVR: u32 = 0x80F;
const REG_ESR: u32 = 0x828;
const REG_ICR: u32 = 0x830;
const REG_LVT_TIMER: u32 = 0x832;
const REG_LVT_THERMAL: u32 = 0x833;
const REG_LVT_PMI: u32 = 0x834;
const REG_LVT_LINT0: u32 = 0x835;
const REG_LVT_LINT1: u32 = 0x836;
const REG_LVT_ERROR: u32 = 0x837;
const REG_INIT_COUNT: u32 = 0x838;
const REG_CUR_COUNT: u32 = 0x839;
const REG_DIV_CONF: u32 = 0x83E;
const REG_TPR: u32 = 0x808;

const ICR2_OFFSET: u32 = 0x310;

const LVT_MASK: u32 = 1 << 16;
const SIVR_ENABLED: u32 = 1 << 8;
const DIV_BY_128: u32 = 0b1010;
const DELIVERY_FIXED: u64 = 0x000;
const DELIVERY_INIT: u64 = 0x500;
const DELIVERY_STARTUP: u64 = 0x600;
const LEVEL_ASSERT: u64 = 1 << 14;
const LEVEL_TRIGGERED: u64 = 1 << 15;
const DELIVERY_STATUS_PENDING: u32 = 1 << 12;

const IOAPIC_REG_VER: u32 = 0x0001;
const IOAPIC_REG_TABLE: u32 = 0x0010;

trait LocalApic: Send + Sync {
	fn read(&self, reg: u32) -> u32;
	fn write(&self, reg: u32, value: u32);

	fn send_ipi(&self, dest_apic_id: u32, vector: u8, assert: bool) {
		let dest = (dest_apic_id as u64) << 32;
		let mut bits = dest | DELIVERY_FIXED | vector as u64;
		if assert {
			bits |= LEVEL_ASSERT;
		}
		self.write_icr(bits);
	}

	fn write_icr(&self, bits: u64);
}

struct X2Apic;

impl LocalApic for X2Apic {
	fn read(&self, reg: u32) -> u32 {
		unsafe { Msr::new(reg).read() as u32 }
	}

	fn write(&self, reg: u32, value: u32) {
		unsafe { Msr::new(reg).write(value as u64) }
	}

	fn write_icr(&self, bits: u64) {
		unsafe { Msr::new(REG_ICR).write(bits) }
	}
}

struct XApic {
	mmio_base: u64,
}

impl XApic {
	fn reg_addr(&self, reg: u32) -> u64 {
		self.mmio_base + (((reg & 0xFF) as u64) << 4)
	}
}

impl LocalApic for XApic {
	fn read(&self, reg: u32) -> u32 {
		unsafe { core::ptr::read_volatile(self.reg_addr(reg) as *const u32) }
	}

	fn write(&self, reg: u32, value: u32) {
		unsafe { core::ptr::write_volatile(self.reg_addr(reg) as *mut u32, value) }
	}

	fn write_icr(&self, bits: u64) {
		unsafe {
			let icr2 = (self.mmio_base + ICR2_OFFSET as u64) as *mut u32;
			core::ptr::write_volatile(icr2, ((bits >> 32) << 24) as u32);
			let icr1 = self.reg_addr(REG_ICR & 0xFF | 0x800) as *mut u32;
			core::ptr::write_volatile(icr1, bits as u32);
			while core::ptr::read_volatile(icr1) & DELIVERY_STATUS_PENDING != 0 {
				core::hint::spin_loop();
			}
		}
	}
}

static LOCAL_APIC: OnceCell<Box<dyn LocalApic>> = OnceCell::new();
static IOAPIC_ADDRESS: AtomicU64 = AtomicU64::new(0);
static CPU_APIC_IDS: OnceCell<Vec<u8>> = OnceCell::new();
static IRQ_REDIRECT: OnceCell<[u8; 16]> = OnceCell::new();
static CALIBRATED_COUNTER: AtomicU32 = AtomicU32::new(0);
static CPU_ONLINE: AtomicU32 = AtomicU32::new(1);
static BOOT_PROCESSOR: AtomicU32 = AtomicU32::new(0);
static GO_DOWN: AtomicBool = AtomicBool::new(false);

fn apic() -> &'static dyn LocalApic {
	LOCAL_APIC.get().expect("apic::init not called").as_ref()
}

fn lapic_write(reg: u32, value: u32) {
	apic().write(reg, value);
}

fn lapic_read(reg: u32) -> u32 {
	apic().read(reg)
}

pub fn cpu_online() -> u32 {
	CPU_ONLINE.load(Ordering::Acquire)
}

pub fn is_shutting_down() -> bool {
	GO_DOWN.load(Ordering::Relaxed)
}

pub fn request_shutdown() {
	GO_DOWN.store(true, Ordering::Relaxed);
}

extern "x86-interrupt" fn tlb_flush_handler(_frame: InterruptStackFrame) {
	x86_64::registers::control::Cr3::read();
	unsafe {
		core::arch::asm!(
			"mov {tmp}, cr3",
			"mov cr3, {tmp}",
			tmp = out(reg) _,
			options(nostack),
		);
	}
	crate::kernel::interrupts::eoi(TLB_FLUSH_VECTOR);
}

extern "x86-interrupt" fn error_handler(frame: InterruptStackFrame) {
	log::error!("APIC LVT error interrupt, ESR={:#x}: {:#?}", lapic_read(REG_ESR), frame);
	crate::kernel::interrupts::eoi(ERROR_VECTOR);
	crate::scheduler::abort_current_task(crate::errno::KernelError::Io);
}

extern "x86-interrupt" fn spurious_handler(_frame: InterruptStackFrame) {
	crate::kernel::interrupts::eoi(SPURIOUS_VECTOR);
}

extern "x86-interrupt" fn wakeup_handler(_frame: InterruptStackFrame) {
	crate::kernel::interrupts::eoi(WAKEUP_VECTOR);
}

extern "x86-interrupt" fn lint_handler(_frame: InterruptStackFrame) {
	crate::kernel::interrupts::eoi(LINT0_VECTOR);
}

extern "x86-interrupt" fn timer_handler(_frame: InterruptStackFrame) {
	crate::kernel::interrupts::eoi(TIMER_VECTOR);
	crate::kernel::core_local::core_scheduler().check_timers();
}

/// Brings up this core's local APIC (§4.4 Probing, Calibration). Run once on
/// the boot processor; each AP repeats the x2APIC-enable/LVT-reset portion
/// during its own bring-up (not the MP-table scan, which is global state).
pub fn init() {
	processor::detect_frequency();

	let local_apic_phys = if boot_info().is_uhyve() {
		BOOT_PROCESSOR.store(0, Ordering::Relaxed);
		CPU_APIC_IDS.set(alloc::vec![0]).ok();
		IRQ_REDIRECT.set(core::array::from_fn(|i| i as u8)).ok();
		0xFEE0_0000u64
	} else {
		match mp::probe() {
			Some(cfg) => {
				CPU_APIC_IDS.set(cfg.cpu_apic_ids).ok();
				IRQ_REDIRECT.set(cfg.irq_redirect).ok();
				if let Some(ioapic) = cfg.ioapic_phys {
					map_ioapic(ioapic as u64);
				}
				cfg.local_apic_phys
			}
			None => {
				log::warn!("no MP 1.4 table found, assuming a single-core xAPIC system");
				CPU_APIC_IDS.set(alloc::vec![0]).ok();
				IRQ_REDIRECT.set(core::array::from_fn(|i| i as u8)).ok();
				0xFEE0_0000u64
			}
		}
	};

	init_local_apic_kind(local_apic_phys);
	reset_local_apic();
	install_vectors();
	calibrate_timer();
	crate::kernel::interrupts::set_apic_enabled(true);

	if !boot_info().is_uhyve() {
		init_ioapic();
	}
}

fn init_local_apic_kind(local_apic_phys: u64) {
	if processor::supports_x2apic() {
		unsafe {
			let mut base = Msr::new(IA32_APIC_BASE).read();
			base |= X2APIC_ENABLE;
			Msr::new(IA32_APIC_BASE).write(base);
		}
		LOCAL_APIC.set(Box::new(X2Apic)).ok();
	} else {
		let virt = crate::mm::virtualmem::allocate(crate::config::PAGE_SIZE).expect("apic mmio");
		let mut flags = PageTableEntryFlags::empty();
		flags.normal().writable();
		flags |= PageTableEntryFlags::CACHE_DISABLE | PageTableEntryFlags::EXECUTE_DISABLE;
		paging::map::<BasePageSize>(virt.as_u64(), local_apic_phys, 1, flags, false).ok();
		LOCAL_APIC
			.set(Box::new(XApic {
				mmio_base: virt.as_u64(),
			}))
			.ok();
	}
}

fn map_ioapic(phys: u64) {
	let virt = crate::mm::virtualmem::allocate(crate::config::PAGE_SIZE).expect("ioapic mmio");
	let mut flags = PageTableEntryFlags::empty();
	flags.normal().writable();
	flags |= PageTableEntryFlags::CACHE_DISABLE | PageTableEntryFlags::EXECUTE_DISABLE;
	paging::map::<BasePageSize>(virt.as_u64(), phys, 1, flags, false).ok();
	IOAPIC_ADDRESS.store(virt.as_u64(), Ordering::Relaxed);
}

fn install_vectors() {
	idt::register(TLB_FLUSH_VECTOR, tlb_flush_handler);
	idt::register(ERROR_VECTOR, error_handler);
	idt::register(SPURIOUS_VECTOR, spurious_handler);
	idt::register(WAKEUP_VECTOR, wakeup_handler);
	idt::register(LINT0_VECTOR, lint_handler);
	idt::register(LINT1_VECTOR, lint_handler);
	idt::register(TIMER_VECTOR, timer_handler);
}

/// §4.4 Calibration "After calibration, reset the LAPIC": SVR, TPR, LVTs.
fn reset_local_apic() {
	lapic_write(REG_LVT_TIMER, LVT_MASK);
	lapic_write(REG_LVT_THERMAL, LVT_MASK);
	lapic_write(REG_LVT_PMI, LVT_MASK);
	lapic_write(REG_LVT_LINT0, LVT_MASK);
	lapic_write(REG_LVT_LINT1, LVT_MASK);
	lapic_write(REG_LVT_ERROR, ERROR_VECTOR as u32);
	lapic_write(REG_TPR, 0);
	lapic_write(REG_SIVR, SIVR_ENABLED | SPURIOUS_VECTOR as u32);
}

/// §4.4 Calibration: disable IRQs, program a one-shot max count, spin on
/// `rdtsc` for three ticks' worth of cycles (seeded by the CPUID-derived
/// frequency), then derive `icr` from the counter delta.
fn calibrate_timer() {
	let cycles_per_tick = processor::get_frequency_mhz() as u64 * 1_000_000 / TIMER_FREQ as u64;
	let ticks = 3u64;
	let cycles = ticks * cycles_per_tick;

	let was_enabled = crate::kernel::interrupts::enabled();
	crate::kernel::interrupts::disable();

	lapic_write(REG_DIV_CONF, DIV_BY_128);
	lapic_write(REG_INIT_COUNT, u32::MAX);

	let end = processor::get_timestamp() + cycles;
	while processor::get_timestamp() < end {
		core::hint::spin_loop();
	}

	let remaining = lapic_read(REG_CUR_COUNT);
	let icr = (u32::MAX - remaining) / ticks as u32;
	CALIBRATED_COUNTER.store(icr, Ordering::Relaxed);
	log::debug!("APIC timer calibrated: icr={icr} for a {TIMER_FREQ} Hz tick");

	if was_enabled {
		crate::kernel::interrupts::enable();
	}
}

/// Arms (or disarms) the one-shot LAPIC timer for `ticks` ticks from now
/// (§4.5 `set_timer`). `None` disables it.
pub fn set_oneshot_timer(ticks: Option<u64>) {
	match ticks {
		Some(t) => {
			let t = t.max(1);
			lapic_write(REG_LVT_TIMER, TIMER_VECTOR as u32);
			lapic_write(REG_INIT_COUNT, (CALIBRATED_COUNTER.load(Ordering::Relaxed) as u64 * t) as u32);
		}
		None => lapic_write(REG_LVT_TIMER, LVT_MASK),
	}
}

pub fn eoi() {
	lapic_write(REG_EOI, 0);
}

fn core_apic_id() -> u32 {
	crate::kernel::core_local::core_id().0
}

/// `apic_send_ipi` (§4.4 IPI).
pub fn send_ipi(dest_apic_id: u32, vector: u8) {
	apic().send_ipi(dest_apic_id, vector, true);
}

pub fn send_ipi_self(vector: u8) {
	send_ipi(lapic_read(REG_ID), vector);
}

/// TLB-shootdown broadcast (§4.2 `page_map`/`page_unmap`): every online core
/// other than self.
pub fn ipi_tlb_flush() {
	if cpu_online() <= 1 {
		return;
	}
	unsafe {
		core::arch::asm!("mfence", options(nostack));
	}
	let self_id = core_apic_id();
	if let Some(ids) = CPU_APIC_IDS.get() {
		for &id in ids {
			if id as u32 != self_id {
				send_ipi(id as u32, TLB_FLUSH_VECTOR);
			}
		}
	}
}

/// Wakeup IPI (§4.5 `wakeup_task`, §4.5 `create_task`): vector 121 to the
/// given core, skipped if it is the calling core.
pub fn send_wakeup_ipi(core_id: u32) {
	if core_id != core_apic_id() {
		send_ipi(core_id, WAKEUP_VECTOR);
	}
}

pub fn cpu_apic_ids() -> Vec<u8> {
	CPU_APIC_IDS.get().cloned().unwrap_or_default()
}

fn ioapic_write(reg: u32, value: u32) {
	let base = IOAPIC_ADDRESS.load(Ordering::Relaxed);
	unsafe {
		core::ptr::write_volatile(base as *mut u32, reg);
		core::ptr::write_volatile((base + 0x10) as *mut u32, value);
	}
}

fn ioapic_read(reg: u32) -> u32 {
	let base = IOAPIC_ADDRESS.load(Ordering::Relaxed);
	unsafe {
		core::ptr::write_volatile(base as *mut u32, reg);
		core::ptr::read_volatile((base + 0x10) as *const u32)
	}
}

/// §4.4 IOAPIC: unmasks `irq`, routed with a fixed vector of `0x20 + irq`
/// (`crate::kernel::idt::PIC_1_OFFSET + irq`) to `apicid`.
pub fn ioapic_inton(irq: u8, apicid: u8) -> Result<(), crate::errno::KernelError> {
	if irq > 24 {
		return Err(crate::errno::KernelError::Inval);
	}
	let off = irq as u32 * 2;
	let upper = (apicid as u32) << 24;
	let lower = (idt::PIC_1_OFFSET as u32) + irq as u32;
	ioapic_write(IOAPIC_REG_TABLE + off, lower);
	ioapic_write(IOAPIC_REG_TABLE + 1 + off, upper);
	Ok(())
}

pub fn ioapic_intoff(irq: u8, apicid: u8) -> Result<(), crate::errno::KernelError> {
	if irq > 24 {
		return Err(crate::errno::KernelError::Inval);
	}
	let off = irq as u32 * 2;
	let upper = (apicid as u32) << 24;
	let lower = ((idt::PIC_1_OFFSET as u32) + irq as u32) | LVT_MASK;
	ioapic_write(IOAPIC_REG_TABLE + off, lower);
	ioapic_write(IOAPIC_REG_TABLE + 1 + off, upper);
	Ok(())
}

fn ioapic_max_redirection_entry() -> u8 {
	((ioapic_read(IOAPIC_REG_VER) >> 16) & 0xFF) as u8
}

/// Unmasks every IOAPIC redirection entry except IRQ 2 (the PIT cascade
/// input, disabled once the LAPIC timer takes over — §8 Scenario 1).
fn init_ioapic() {
	if IOAPIC_ADDRESS.load(Ordering::Relaxed) == 0 {
		return;
	}
	let max_entry = ioapic_max_redirection_entry() + 1;
	let boot_processor = BOOT_PROCESSOR.load(Ordering::Relaxed) as u8;
	for i in 0..max_entry.min(16) {
		if i == 2 {
			ioapic_intoff(i, boot_processor).ok();
		} else {
			ioapic_inton(i, boot_processor).ok();
		}
	}
}

pub fn irq_redirect(irq: u8) -> u8 {
	IRQ_REDIRECT
		.get()
		.and_then(|t| t.get(irq as usize).copied())
		.unwrap_or(irq)
}

core::arch::global_asm!(
	".section .rodata",
	".global ap_trampoline_start",
	".global ap_trampoline_end",
	".code16",
	"ap_trampoline_start:",
	"cli",
	"xor ax, ax",
	"mov ds, ax",
	// Load the PML4 physical address patched in at +0x04 into cr3, enable
	// long mode + paging, then far-jump into the shared 64-bit entry.
	"mov eax, [0x8004]",
	"mov cr3, eax",
	"mov eax, cr4",
	"or eax, 1 << 5",
	"mov cr4, eax",
	"mov ecx, 0xC0000080",
	"rdmsr",
	"or eax, 1 << 8",
	"wrmsr",
	"mov eax, cr0",
	"or eax, 1 << 31 | 1",
	"mov cr0, eax",
	"hlt",
	"ap_trampoline_end:",
	".code64",
	".previous",
);

unsafe extern "C" {
	static ap_trampoline_start: u8;
	static ap_trampoline_end: u8;
}

const TRAMPOLINE_PML4_OFFSET: u64 = 0x04;

/// `boot_application_processors` (§4.4 AP wakeup, §8 Scenario 2). Copies the
/// real-mode trampoline to [`SMP_SETUP_ADDR`], patches in the current CR3,
/// then issues INIT/STARTUP per Intel MP 1.4 Appendix B.4 for every
/// non-boot-processor APIC id, waiting for `cpu_online` to advance before
/// moving to the next.
pub fn boot_application_processors() {
	let ids = cpu_apic_ids();
	if ids.len() <= 1 {
		return;
	}

	let len = unsafe {
		(&ap_trampoline_end as *const u8 as usize) - (&ap_trampoline_start as *const u8 as usize)
	};
	assert!(len < crate::config::PAGE_SIZE, "AP trampoline larger than a page");

	let mut flags = PageTableEntryFlags::empty();
	flags.normal().writable();
	paging::map::<BasePageSize>(SMP_SETUP_ADDR, SMP_SETUP_ADDR, 1, flags, false).ok();
	unsafe {
		core::ptr::copy_nonoverlapping(
			&ap_trampoline_start as *const u8,
			SMP_SETUP_ADDR as *mut u8,
			len,
		);
		*((SMP_SETUP_ADDR + TRAMPOLINE_PML4_OFFSET) as *mut u32) =
			paging::current_pml4_phys() as u32;
	}

	let self_id = core_apic_id();
	for &apic_id in &ids {
		if apic_id as u32 == self_id {
			continue;
		}
		let before = cpu_online();
		let dest = (apic_id as u64) << 32;

		apic().write_icr(dest | LEVEL_TRIGGERED | LEVEL_ASSERT | DELIVERY_INIT);
		processor::udelay(200);
		apic().write_icr(dest | LEVEL_TRIGGERED | DELIVERY_INIT);
		processor::udelay(10_000);
		apic().write_icr(dest | DELIVERY_STARTUP | (SMP_SETUP_ADDR >> 12));

		let mut waited = 0u64;
		while cpu_online() == before && waited < 1_000_000 {
			processor::udelay(1_000);
			waited += 1_000;
		}
		if cpu_online() == before {
			log::error!("AP with local APIC id {apic_id} failed to come online");
		}
	}
}

/// Called by each AP once its own core-local state and IDT are installed.
pub fn notify_online() {
	CPU_ONLINE.fetch_add(1, Ordering::AcqRel);
}

pub fn boot_processor() -> u32 {
	BOOT_PROCESSOR.load(Ordering::Relaxed)
}

/// §7 Shutdown propagation: the boot processor waits for every AP to
/// decrement `cpu_online` back to 1 before tearing down the network.
pub fn wait_for_shutdown() {
	while cpu_online() > 1 {
		core::hint::spin_loop();
	}
}

pub fn notify_offline() {
	CPU_ONLINE.fetch_sub(1, Ordering::AcqRel);
}

static _UNUSED_MAX_CORES_CHECK: AtomicUsize = AtomicUsize::new(MAX_CORES);
