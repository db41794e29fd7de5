//! IRQ plumbing shared by every vector owner (§6 vector layout): legacy 8259
//! PIC remap/mask so its vectors never collide with the CPU exception range,
//! and the EOI dispatch rule that picks between the APIC and the legacy PIC.

use x86_64::instructions::port::Port;

use crate::kernel::idt::{IOAPIC_OFFSET, PIC_1_OFFSET};

const PIC1_COMMAND: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_COMMAND: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

const CMD_INIT: u8 = 0x11;
const CMD_END_OF_INTERRUPT: u8 = 0x20;
const MODE_8086: u8 = 0x01;

static APIC_ENABLED: core::sync::atomic::AtomicBool = core::sync::atomic::AtomicBool::new(false);

/// Remaps the 8259 PIC so IRQs 0..15 land on vectors 32..47 (§6), then masks
/// every line. The IOAPIC (if present) takes over actual routing; this PIC
/// stays remapped-but-silent so a stray legacy interrupt cannot land on a CPU
/// exception vector.
pub fn init() {
	unsafe {
		let mut cmd1: Port<u8> = Port::new(PIC1_COMMAND);
		let mut data1: Port<u8> = Port::new(PIC1_DATA);
		let mut cmd2: Port<u8> = Port::new(PIC2_COMMAND);
		let mut data2: Port<u8> = Port::new(PIC2_DATA);

		cmd1.write(CMD_INIT);
		io_wait();
		cmd2.write(CMD_INIT);
		io_wait();

		data1.write(PIC_1_OFFSET);
		io_wait();
		data2.write(PIC_1_OFFSET + 8);
		io_wait();

		data1.write(4u8); // slave on IRQ2
		io_wait();
		data2.write(2u8); // cascade identity
		io_wait();

		data1.write(MODE_8086);
		io_wait();
		data2.write(MODE_8086);
		io_wait();

		// Mask everything; the IOAPIC (or individual `ioapic_inton`/legacy
		// fallback) unmasks what it actually routes.
		data1.write(0xFF);
		data2.write(0xFF);
	}
}

fn io_wait() {
	unsafe {
		Port::<u8>::new(0x80).write(0u8);
	}
}

pub fn set_apic_enabled(enabled: bool) {
	APIC_ENABLED.store(enabled, core::sync::atomic::Ordering::Relaxed);
}

/// §4.4 EOI: vectors `>= 123` (LINT0/LINT1/error/spurious/timer) or any vector
/// once the local APIC is enabled acknowledge through `APIC_EOI`; otherwise
/// the legacy PIC is acknowledged (slave first if the vector came from it).
pub fn eoi(vector: u8) {
	if vector >= 123 || APIC_ENABLED.load(core::sync::atomic::Ordering::Relaxed) {
		crate::kernel::apic::eoi();
		return;
	}
	unsafe {
		if vector >= PIC_1_OFFSET + 8 && vector < IOAPIC_OFFSET {
			Port::<u8>::new(PIC2_COMMAND).write(CMD_END_OF_INTERRUPT);
		}
		Port::<u8>::new(PIC1_COMMAND).write(CMD_END_OF_INTERRUPT);
	}
}

pub fn enable() {
	x86_64::instructions::interrupts::enable();
}

pub fn disable() {
	x86_64::instructions::interrupts::disable();
}

pub fn enabled() -> bool {
	x86_64::instructions::interrupts::are_enabled()
}
