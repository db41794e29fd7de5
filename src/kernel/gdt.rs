//! Per-core GDT/TSS with the interrupt stack table (IST) slots page faults and
//! double faults switch to, so a stack overflow in task context doesn't corrupt
//! the handler's own stack.

use alloc::vec::Vec;

use hermit_sync::InterruptTicketMutex;
use x86_64::instructions::segmentation::{Segment, CS, SS};
use x86_64::instructions::tables::load_tss;
use x86_64::registers::segmentation::{DS, ES};
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;
pub const PAGE_FAULT_IST_INDEX: u16 = 1;

struct TssHandle(*mut TaskStateSegment);
unsafe impl Send for TssHandle {}

/// Every core's TSS, indexed by core id, so [`set_kernel_stack`] can reach the
/// calling core's `rsp0` field without needing a dedicated `CoreLocal` slot. The
/// GDT descriptor that points at each TSS only records its address once at `init`
/// time, but the CPU re-reads `rsp0` out of memory on every ring transition, so
/// mutating it here through the raw pointer is enough.
static TSS_TABLE: InterruptTicketMutex<Vec<Option<TssHandle>>> = InterruptTicketMutex::new(Vec::new());

/// Installs this core's GDT and TSS. Both are leaked for the core's lifetime:
/// every core needs its own IST stacks, so these cannot be one shared global
/// static the way a single-core kernel might get away with.
pub fn init(double_fault_stack: VirtAddr, page_fault_stack: VirtAddr) {
	let mut tss = TaskStateSegment::new();
	tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = double_fault_stack;
	tss.interrupt_stack_table[PAGE_FAULT_IST_INDEX as usize] = page_fault_stack;
	let tss_ptr = alloc::boxed::Box::into_raw(alloc::boxed::Box::new(tss));
	let tss: &'static TaskStateSegment = unsafe { &*tss_ptr };

	let mut gdt = GlobalDescriptorTable::new();
	let code = gdt.append(Descriptor::kernel_code_segment());
	let data = gdt.append(Descriptor::kernel_data_segment());
	let tss_selector = gdt.append(Descriptor::tss_segment(tss));
	let gdt: &'static GlobalDescriptorTable = alloc::boxed::Box::leak(alloc::boxed::Box::new(gdt));
	gdt.load();

	unsafe {
		CS::set_reg(code);
		DS::set_reg(data);
		ES::set_reg(data);
		SS::set_reg(data);
		load_tss(tss_selector);
	}

	let core_id = crate::kernel::core_local::core_id().0 as usize;
	let mut table = TSS_TABLE.lock();
	if table.len() <= core_id {
		table.resize_with(core_id + 1, || None);
	}
	table[core_id] = Some(TssHandle(tss_ptr));
}

/// Updates this core's TSS `rsp0` to `top` (§4.5 context switch: the scheduler calls
/// this on every task switch so a subsequent interrupt lands on the new task's own
/// kernel stack rather than the previous task's).
pub fn set_kernel_stack(top: u64) {
	let core_id = crate::kernel::core_local::core_id().0 as usize;
	let table = TSS_TABLE.lock();
	if let Some(Some(handle)) = table.get(core_id) {
		unsafe {
			(*handle.0).privilege_stack_table[0] = VirtAddr::new(top);
		}
	}
}
