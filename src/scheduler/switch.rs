//! Per-task stacks, the saved-register frame, and the naked-function context switch
//! (§4.5 task creation step 3, §3 Task/PCB `stack`/`ist_addr` fields).
//!
//! There is no separate user stack: this kernel runs every task at the same
//! privilege level in the single address space (§1), so a task only ever owns a
//! kernel stack and an IST stack for double-fault/page-fault handling while it is
//! itself interrupted.

use core::{mem, ptr};

use crate::config::{DEFAULT_STACK_SIZE, IST_SIZE, PAGE_SIZE};
use crate::mm::paging::{self, BasePageSize, PageTableEntryFlags};
use crate::mm::{physicalmem, virtualmem};

/// Register file a context switch saves/restores, laid out to match the push order
/// in [`switch_to_task`]'s `naked_asm!` body. `rip` and the initial `rflags` are
/// primed by [`build_stack_frame`] so the very first "restore" is really a first
/// entry into `thread_entry`.
#[repr(C, packed)]
struct State {
	fs_base: u64,
	r15: u64,
	r14: u64,
	r13: u64,
	r12: u64,
	r11: u64,
	r10: u64,
	r9: u64,
	r8: u64,
	rdi: u64,
	rsi: u64,
	rbp: u64,
	rbx: u64,
	rdx: u64,
	rcx: u64,
	rax: u64,
	rflags: u64,
	rip: u64,
}

/// Debug canary at the very top of every task stack, mirroring the marker the
/// lineage this kernel descends from leaves so a stack overflow is visible in a
/// core dump rather than silently corrupting the region below.
const STACK_MARKER: u64 = 0xDEAD_BEEF_u64;
const MARKER_SIZE: usize = 0x10;

struct CommonStack {
	virt_addr: u64,
	phys_addr: u64,
	total_size: usize,
}

/// A task's kernel + IST stacks (§3: "`stack`: kernel stack base, `ist_addr`:
/// interrupt stack base"). `Boot` describes the statically allocated stacks the boot
/// processor is already running on when the idle task for core 0 is constructed;
/// every other task gets a freshly mapped `Common` pair.
pub enum TaskStacks {
	Boot { stack: u64, ist: u64 },
	Common(CommonStack),
	#[cfg(test)]
	Test(alloc::boxed::Box<[u8]>, alloc::boxed::Box<[u8]>),
}

impl TaskStacks {
	/// Maps a fresh IST + kernel stack pair with guard pages on both sides and
	/// between them, so a stack-bound overrun page-faults instead of corrupting the
	/// other stack (§4.2 Paging "every page table entry maps exactly one frame").
	pub fn new() -> Result<Self, crate::errno::KernelError> {
		let total_size = IST_SIZE + DEFAULT_STACK_SIZE;
		let virt_size = total_size + 3 * PAGE_SIZE;

		let page_count = total_size / PAGE_SIZE;
		let virt_addr = virtualmem::allocate(virt_size)
			.map_err(|_| crate::errno::KernelError::NoMem)?
			.as_u64();
		let phys_addr = physicalmem::get_pages(page_count);
		if phys_addr == 0 {
			virtualmem::deallocate(memory_addresses::VirtAddr::new(virt_addr), virt_size);
			return Err(crate::errno::KernelError::NoMem);
		}

		let mut flags = PageTableEntryFlags::empty();
		flags.normal().writable().execute_disable();

		let ist_virt = virt_addr + PAGE_SIZE as u64;
		let kernel_virt = virt_addr + (2 * PAGE_SIZE + IST_SIZE) as u64;

		paging::map::<BasePageSize>(ist_virt, phys_addr, IST_SIZE / PAGE_SIZE, flags, false)?;
		paging::map::<BasePageSize>(
			kernel_virt,
			phys_addr + IST_SIZE as u64,
			DEFAULT_STACK_SIZE / PAGE_SIZE,
			flags,
			false,
		)?;

		Ok(TaskStacks::Common(CommonStack {
			virt_addr,
			phys_addr,
			total_size,
		}))
	}

	#[cfg(test)]
	pub fn new_for_test() -> Self {
		TaskStacks::Test(
			alloc::vec![0u8; DEFAULT_STACK_SIZE].into_boxed_slice(),
			alloc::vec![0u8; IST_SIZE].into_boxed_slice(),
		)
	}

	pub fn kernel_stack_top(&self) -> u64 {
		match self {
			TaskStacks::Boot { stack, .. } => *stack + DEFAULT_STACK_SIZE as u64,
			TaskStacks::Common(s) => {
				s.virt_addr + (2 * PAGE_SIZE + IST_SIZE) as u64 + DEFAULT_STACK_SIZE as u64
			}
			#[cfg(test)]
			TaskStacks::Test(kernel, _) => kernel.as_ptr() as u64 + kernel.len() as u64,
		}
	}

	pub fn ist_stack_top(&self) -> u64 {
		match self {
			TaskStacks::Boot { ist, .. } => *ist + IST_SIZE as u64,
			TaskStacks::Common(s) => s.virt_addr + PAGE_SIZE as u64 + IST_SIZE as u64,
			#[cfg(test)]
			TaskStacks::Test(_, ist) => ist.as_ptr() as u64 + ist.len() as u64,
		}
	}
}

impl Drop for TaskStacks {
	fn drop(&mut self) {
		if let TaskStacks::Common(s) = self {
			let virt_size = s.total_size + 3 * PAGE_SIZE;
			paging::unmap::<BasePageSize>(s.virt_addr + PAGE_SIZE as u64, s.total_size / PAGE_SIZE);
			virtualmem::deallocate(memory_addresses::VirtAddr::new(s.virt_addr), virt_size);
			physicalmem::put_pages(s.phys_addr, s.total_size / PAGE_SIZE).ok();
		}
	}
}

/// First instruction a brand-new task runs: loads `func`/`arg` off the registers
/// [`build_stack_frame`] primed and tail-calls into Rust. Naked so no prologue
/// clobbers the registers the switch trampoline just restored.
#[unsafe(naked)]
extern "C" fn thread_entry(_func: extern "C" fn(usize) -> !, _arg: usize) -> ! {
	// `rdi`/`rsi` already hold `func`/`arg`: the preceding switch popped them
	// straight out of the `State` frame `build_stack_frame` wrote, so the System V
	// argument registers for `task_entry` are already correct on entry here.
	core::arch::naked_asm!("sti", "call {entry}", entry = sym task_entry)
}

extern "C" fn task_entry(func: extern "C" fn(usize) -> !, arg: usize) -> ! {
	func(arg)
}

/// Builds the initial saved-register frame at the top of `stacks`' kernel stack so
/// that the first context switch into this task lands in [`thread_entry`], which in
/// turn calls `func(arg)` (§4.5 task creation step 3). `tls_addr` is installed as
/// the task's saved `fs_base` so the very first restore — the same `wrfsbase` every
/// later [`switch_to_task`] does — points the thread pointer at this task's TLS
/// block before `func` ever runs; pass 0 for a task with no TLS.
pub fn build_stack_frame(
	stacks: &TaskStacks,
	func: extern "C" fn(usize) -> !,
	arg: usize,
	tls_addr: u64,
) -> u64 {
	unsafe {
		let mut sp = stacks.kernel_stack_top() - MARKER_SIZE as u64;
		*(sp as *mut u64) = STACK_MARKER;

		sp -= mem::size_of::<State>() as u64;
		let state = sp as *mut State;
		ptr::write_bytes(sp as *mut u8, 0, mem::size_of::<State>());

		(*state).rip = thread_entry as usize as u64;
		(*state).rdi = func as usize as u64;
		(*state).rsi = arg as u64;
		(*state).fs_base = tls_addr;
		// IF set, everything else clear: interrupts re-enable as part of the first
		// restore rather than needing a separate `sti` before the first switch out.
		(*state).rflags = 0x202;

		sp
	}
}

/// Switches from the task whose saved-stack-pointer slot is `old_stack_pointer` (may
/// be null if the outgoing context should simply be discarded, e.g. the idle task
/// before the very first switch) to `new_stack_pointer`. Sets `CR0.TS` on the way out
/// so the first FPU instruction the new task issues traps into
/// [`crate::scheduler::fpu_trap`] (§4.5 FPU lazy switch).
///
/// # Safety
/// `new_stack_pointer` must point at a `State` frame built either by
/// [`build_stack_frame`] or by a previous call to this function.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_to_task(old_stack_pointer: *mut u64, new_stack_pointer: u64) {
	core::arch::naked_asm!(
		"pushfq",
		"push rax",
		"push rcx",
		"push rdx",
		"push rbx",
		"push rbp",
		"push rsi",
		"push rdi",
		"push r8",
		"push r9",
		"push r10",
		"push r11",
		"push r12",
		"push r13",
		"push r14",
		"push r15",
		"rdfsbase rax",
		"push rax",
		"test rdi, rdi",
		"jz 2f",
		"mov [rdi], rsp",
		"2:",
		"mov rsp, rsi",
		"mov rax, cr0",
		"or rax, 8", // CR0.TS
		"mov cr0, rax",
		"call {set_kernel_stack}",
		"pop rax",
		"wrfsbase rax",
		"pop r15",
		"pop r14",
		"pop r13",
		"pop r12",
		"pop r11",
		"pop r10",
		"pop r9",
		"pop r8",
		"pop rdi",
		"pop rsi",
		"pop rbp",
		"pop rbx",
		"pop rdx",
		"pop rcx",
		"pop rax",
		"popfq",
		"ret",
		set_kernel_stack = sym set_kernel_stack_from_asm,
	)
}

/// Called from inside the naked trampoline with the new task's kernel-stack top
/// already loaded into `rdi` by the calling convention at the call site... in
/// practice it reads the incoming stack's extent via the current core's scheduler,
/// since the asm body above cannot carry a Rust argument across the stack switch.
extern "C" fn set_kernel_stack_from_asm() {
	crate::kernel::core_local::core_scheduler().update_tss_kernel_stack();
}
