//! Intel MultiProcessor Specification 1.4 floating-pointer/config-table scan
//! (§4.4 Probing, §9 "Dual MP-table/ACPI absence"). Deliberately not ACPI: the
//! lineage this kernel descends from only ever parsed the legacy MP tables,
//! and uhyve boots with neither, so this module's absence is itself a valid
//! outcome (`probe()` returns `None` and the caller falls back to the fixed
//! `0xFEE00000` LAPIC base).

use alloc::vec::Vec;
use core::{mem, str};

use crate::mm::paging::{self, BasePageSize, PageTableEntryFlags};

#[repr(C, packed)]
struct FloatingPointer {
	signature: [u8; 4],
	configuration_table_ptr: u32,
	length: u8,
	spec_rev: u8,
	checksum: u8,
	features: [u8; 5],
}

#[repr(C, packed)]
struct ConfigTableHeader {
	signature: [u8; 4],
	base_table_length: u16,
	spec_rev: u8,
	checksum: u8,
	oem_id: [u8; 8],
	product_id: [u8; 12],
	oem_table_ptr: u32,
	oem_table_size: u16,
	entry_count: u16,
	local_apic_address: u32,
	extended_table_length: u16,
	extended_table_checksum: u8,
	reserved: u8,
}

#[repr(C, packed)]
struct CpuEntry {
	entry_type: u8,
	local_apic_id: u8,
	local_apic_version: u8,
	flags: u8,
	signature: u32,
	features: u32,
	reserved: u64,
}

const CPU_FLAG_ENABLED: u8 = 1 << 0;
const CPU_FLAG_BOOT_PROCESSOR: u8 = 1 << 1;

#[repr(C, packed)]
struct BusEntry {
	entry_type: u8,
	id: u8,
	type_string: [u8; 6],
}

#[repr(C, packed)]
struct IoApicEntry {
	entry_type: u8,
	id: u8,
	version: u8,
	flags: u8,
	address: u32,
}

#[repr(C, packed)]
struct IoInterruptEntry {
	entry_type: u8,
	interrupt_type: u8,
	flags: u16,
	source_bus_id: u8,
	source_bus_irq: u8,
	destination_ioapic_id: u8,
	destination_ioapic_intin: u8,
}

#[repr(C, packed)]
struct LocalInterruptEntry {
	entry_type: u8,
	interrupt_type: u8,
	flags: u16,
	source_bus_id: u8,
	source_bus_irq: u8,
	destination_local_apic_id: u8,
	destination_local_apic_lintin: u8,
}

/// Everything `apic::init` needs from the MP tables.
pub struct MpConfig {
	pub local_apic_phys: u64,
	pub cpu_apic_ids: Vec<u8>,
	pub ioapic_phys: Option<u32>,
	/// ISA IRQ line `n` → IOAPIC input pin. Identity (`n`) unless the table
	/// gives an explicit redirection entry (§9 Open Questions: the behavior
	/// when an entry is missing is left unvalidated against real firmware).
	pub irq_redirect: [u8; 16],
}

fn identity_map(addr: u64) {
	let page = addr & !(crate::config::PAGE_SIZE as u64 - 1);
	let mut flags = PageTableEntryFlags::empty();
	flags.normal();
	flags |= PageTableEntryFlags::CACHE_DISABLE | PageTableEntryFlags::EXECUTE_DISABLE;
	let _ = paging::map::<BasePageSize>(page, page, 1, flags, false);
}

fn find_floating_pointer(start: u64, end: u64) -> Option<u64> {
	let mut mapped_page = u64::MAX;
	let mut addr = start;
	while addr < end {
		let page = addr / crate::config::PAGE_SIZE as u64;
		if page != mapped_page {
			identity_map(addr);
			mapped_page = page;
		}
		let signature = unsafe { &*(addr as *const [u8; 4]) };
		if signature == b"_MP_" {
			let fp = unsafe { &*(addr as *const FloatingPointer) };
			if fp.length == 1 && fp.features[0] == 0 {
				return Some(addr);
			}
		}
		addr += 4;
	}
	None
}

/// Scans the two low-memory windows the MP spec designates for the floating
/// pointer structure, then walks the configuration table it points at.
pub fn probe() -> Option<MpConfig> {
	let fp_addr = find_floating_pointer(0xF_0000, 0x10_0000)
		.or_else(|| find_floating_pointer(0x9_F000, 0xA_0000))?;
	let fp = unsafe { &*(fp_addr as *const FloatingPointer) };
	let mut addr = fp.configuration_table_ptr as u64;
	identity_map(addr);

	let header = unsafe { &*(addr as *const ConfigTableHeader) };
	let signature = unsafe { str::from_utf8_unchecked(&header.signature) };
	if signature != "PCMP" {
		return None;
	}

	let local_apic_phys = header.local_apic_address as u64;
	let entry_count = header.entry_count;
	addr += mem::size_of::<ConfigTableHeader>() as u64;

	let mut cpu_apic_ids = Vec::new();
	let mut ioapic_phys = None;
	let mut irq_redirect = core::array::from_fn(|i| i as u8);

	for _ in 0..entry_count {
		identity_map(addr);
		let entry_type = unsafe { *(addr as *const u8) };
		match entry_type {
			0 => {
				let cpu = unsafe { &*(addr as *const CpuEntry) };
				if cpu.flags & CPU_FLAG_ENABLED != 0 {
					if cpu.flags & CPU_FLAG_BOOT_PROCESSOR != 0 {
						debug_assert_eq!(cpu.local_apic_id, 0, "boot processor must have LAPIC id 0");
					}
					cpu_apic_ids.push(cpu.local_apic_id);
				}
				addr += mem::size_of::<CpuEntry>() as u64;
			}
			1 => addr += mem::size_of::<BusEntry>() as u64,
			2 => {
				let ioapic = unsafe { &*(addr as *const IoApicEntry) };
				ioapic_phys = Some(ioapic.address);
				addr += mem::size_of::<IoApicEntry>() as u64;
			}
			3 => {
				let io_irq = unsafe { &*(addr as *const IoInterruptEntry) };
				if (io_irq.source_bus_irq as usize) < irq_redirect.len() {
					irq_redirect[io_irq.source_bus_irq as usize] = io_irq.destination_ioapic_intin;
				}
				addr += mem::size_of::<IoInterruptEntry>() as u64;
			}
			4 => addr += mem::size_of::<LocalInterruptEntry>() as u64,
			other => {
				log::warn!("MP config table: unknown entry type {other}, stopping scan");
				break;
			}
		}
	}

	Some(MpConfig {
		local_apic_phys,
		cpu_apic_ids,
		ioapic_phys,
		irq_redirect,
	})
}
