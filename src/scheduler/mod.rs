//! The per-core scheduler (§4.5): task selection, the FPU lazy switch, timers, and
//! task creation/exit. `src/kernel/idt.rs` and `src/mm/paging.rs` call the two free
//! functions at the bottom of this module directly from trap handlers; everything
//! else goes through [`PerCoreScheduler`], reached via
//! [`crate::kernel::core_local::core_scheduler`].

pub mod switch;
pub mod task;

use core::cell::Cell;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use hermit_sync::InterruptTicketMutex;

use crate::config::MAX_TASKS;
use crate::errno::KernelError;
use crate::kernel::{apic, core_local, processor};
use task::{Priority, ReadyQueue, Task, TaskId, TaskStatus, Tick, IDLE_PRIO};

/// A core's identity, numerically equal to its local APIC id (§4.4 APIC: `apic.rs`
/// reads this straight off `CoreLocal` and hands it to `send_ipi` unchanged).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct CoreId(pub u32);

impl core::fmt::Display for CoreId {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// Monotonic tick counter, advanced once per `check_timers` call from the timer IRQ
/// (§4.5 `set_timer`/`check_timers`). Not the TSC — `Task::last_tsc` is used for the
/// round-robin heuristic in `check_scheduling` instead.
static TICKS: AtomicU64 = AtomicU64::new(0);

pub fn current_tick() -> Tick {
	TICKS.load(Ordering::Relaxed)
}

extern "C" fn idle_main(_arg: usize) -> ! {
	let mut reported_offline = false;
	loop {
		if apic::is_shutting_down() && !reported_offline {
			if apic::boot_processor() != core_local::core_id().0 {
				apic::notify_offline();
			}
			reported_offline = true;
		}
		crate::kernel::interrupts::enable();
		x86_64::instructions::hlt();
	}
}

/// Per-core scheduling state, installed via [`PerCoreScheduler::install`] and reached
/// thereafter through `CoreLocal`/`GS_BASE`.
pub struct PerCoreScheduler {
	core_id: CoreId,
	current_task: Cell<TaskId>,
	idle_task: TaskId,
	ready: &'static InterruptTicketMutex<ReadyQueue>,
}

impl PerCoreScheduler {
	/// Creates the idle task for this core, registers its ready queue globally, and
	/// installs the resulting scheduler through `CoreLocal` (§2 bring-up order:
	/// scheduler comes up after paging/frame-allocator/VMA/IDT/APIC).
	pub fn install(core_id: CoreId) {
		let ready = task::register_core(core_id);

		let stacks = switch::TaskStacks::new().expect("failed to allocate the idle task's stacks");
		let sp = switch::build_stack_frame(&stacks, idle_main, 0, 0);

		let idle_task = {
			let mut tasks = task::TASKS.lock();
			tasks
				.insert(|id| {
					let mut t = Task::new(id, core_id, IDLE_PRIO, stacks, current_tick());
					t.last_stack_pointer = sp as usize;
					t.status = TaskStatus::Idle;
					t
				})
				.expect("task table exhausted before the idle task could be created")
		};
		ready.lock().idle = Some(idle_task);

		let scheduler = alloc::boxed::Box::leak(alloc::boxed::Box::new(PerCoreScheduler {
			core_id,
			current_task: Cell::new(idle_task),
			idle_task,
			ready,
		}));
		core_local::set_core_scheduler(scheduler as *mut PerCoreScheduler);
	}

	pub fn core_id(&self) -> CoreId {
		self.core_id
	}

	pub fn current_task_id(&self) -> TaskId {
		self.current_task.get()
	}

	/// Writes the current task's kernel-stack top into the TSS so the next
	/// privilege-level transition (interrupt while running this task) lands on its
	/// own stack rather than the previous occupant's.
	pub fn update_tss_kernel_stack(&self) {
		let top = task::TASKS
			.lock()
			.get(self.current_task.get())
			.map(|t| t.stacks.kernel_stack_top());
		if let Some(top) = top {
			crate::kernel::gdt::set_kernel_stack(top);
		}
	}

	/// Drains and processes the pending cleanup a previous switch on this core left
	/// behind (§4.5 `finish_task_switch`). Must run before `pick_next` so a just-
	/// finished task's slot is freed before anyone could observe it mid-teardown.
	fn finish_task_switch(&self) {
		let Some(old_id) = self.ready.lock().old_task.take() else {
			return;
		};

		let status = task::TASKS.lock().get(old_id).map(|t| t.status);
		match status {
			Some(TaskStatus::Finished) => {
				let removed = task::TASKS.lock().remove(old_id);
				let mut ready = self.ready.lock();
				if ready.fpu_owner == Some(old_id) {
					ready.fpu_owner = None;
				}
				ready.nr_tasks = ready.nr_tasks.saturating_sub(1);
				drop(ready);
				drop(removed); // runs TaskStacks::drop, unmapping/freeing its stacks
			}
			Some(TaskStatus::Ready) => {
				let prio = task::TASKS.lock().get(old_id).unwrap().prio;
				self.ready.lock().push(old_id, prio);
			}
			_ => {}
		}
	}

	/// Picks the next task to run per the priority rule of §4.5 `scheduler()`.
	/// Returns `None` if the current task should simply keep running.
	fn pick_next(&self) -> Option<TaskId> {
		let mut ready = self.ready.lock();
		let mut tasks = task::TASKS.lock();
		let current = self.current_task.get();
		let current_status = tasks.get(current).map(|t| t.status).unwrap_or(TaskStatus::Invalid);

		let demote_and_stash = |tasks: &mut task::TaskTable, ready: &mut ReadyQueue| {
			if current_status == TaskStatus::Invalid {
				return;
			}
			if current_status == TaskStatus::Running {
				if let Some(t) = tasks.get_mut(current) {
					t.status = TaskStatus::Ready;
				}
			}
			ready.old_task = Some(current);
		};

		if apic::is_shutting_down() {
			if current == self.idle_task && current_status == TaskStatus::Idle {
				return None;
			}
			demote_and_stash(&mut tasks, &mut ready);
			return Some(self.idle_task);
		}

		let current_prio = tasks.get(current).map(|t| t.prio);
		match (current_status, ready.highest_priority()) {
			(TaskStatus::Running, None) | (TaskStatus::Idle, None) => None,
			(_, None) => {
				demote_and_stash(&mut tasks, &mut ready);
				Some(self.idle_task)
			}
			(TaskStatus::Running, Some(prio)) if Some(prio) <= current_prio => None,
			(_, Some(_)) => {
				let next = ready.pop().expect("prio_bitmap set but queue empty");
				demote_and_stash(&mut tasks, &mut ready);
				Some(next)
			}
		}
	}

	fn switch_to(&self, new: TaskId) {
		self.current_task.set(new);
		let new_sp = task::TASKS
			.lock()
			.get(new)
			.expect("switching to an unknown task")
			.last_stack_pointer as u64;

		let old_ptr: *mut u64 = match self.ready.lock().old_task {
			Some(id) => {
				let mut tasks = task::TASKS.lock();
				let task = tasks.get_mut(id).expect("outgoing task vanished from the table");
				(&mut task.last_stack_pointer) as *mut usize as *mut u64
			}
			None => core::ptr::null_mut(),
		};

		unsafe {
			switch::switch_to_task(old_ptr, new_sp);
		}

		// Execution resumes here once this task is switched back in. A brand-new
		// task never reaches this line on its first run — it starts at
		// `thread_entry` instead — so this call and the one at the top of
		// `reschedule` are what eventually process its own `old_task` stash.
		self.finish_task_switch();
	}

	/// Called with IRQs disabled. Picks a task and, if different from the current
	/// one, performs the context switch (§4.5 `scheduler()`).
	pub fn reschedule(&self) {
		self.finish_task_switch();
		if let Some(next) = self.pick_next() {
			self.switch_to(next);
		}
	}

	/// IRQ-epilogue hook (§4.5 `check_scheduling`): reschedule if a strictly higher
	/// priority task is ready, or — under the RDTSC round-robin heuristic — if the
	/// current task has held the CPU for a full tick's worth of cycles at equal
	/// priority.
	pub fn check_scheduling(&self) {
		let now = processor::get_timestamp();
		let should_switch = {
			let ready = self.ready.lock();
			let tasks = task::TASKS.lock();
			let current = tasks.get(self.current_task.get());
			match (ready.highest_priority(), current) {
				(Some(prio), Some(task)) if prio > task.prio => true,
				(Some(prio), Some(task)) if prio == task.prio => {
					let cycles_per_tick =
						u64::from(processor::get_frequency_mhz()) * 1_000_000 / u64::from(crate::config::TIMER_FREQ);
					now.saturating_sub(task.last_tsc) >= cycles_per_tick
				}
				_ => false,
			}
		};
		if should_switch {
			self.reschedule();
		}
	}

	/// Called once per timer tick (§4.5 `set_timer`/`check_timers`). Advances the
	/// tick counter, wakes every timer whose deadline has elapsed, then runs the
	/// round-robin/priority check.
	pub fn check_timers(&self) {
		let now = TICKS.fetch_add(1, Ordering::Relaxed) + 1;
		let expired = self.ready.lock().expire_timers(now);
		for id in expired {
			self.wake(id);
		}
		self.check_scheduling();
	}

	/// Blocks the current task, optionally with a deadline, then reschedules. Does
	/// not return until the task is woken again.
	pub fn block_current_task(&self, timeout: Option<Tick>) {
		{
			let mut tasks = task::TASKS.lock();
			let task = tasks.get_mut(self.current_task.get()).expect("current task missing");
			task.status = TaskStatus::Blocked;
			task.timeout = timeout;
		}
		if let Some(deadline) = timeout {
			let mut tasks = task::TASKS.lock();
			let task = tasks.get_mut(self.current_task.get()).unwrap();
			task.flags |= task::TaskFlags::TIMER;
			drop(tasks);
			if self.ready.lock().push_timer(self.current_task.get(), deadline) {
				apic::set_oneshot_timer(Some(deadline));
			}
		}
		self.reschedule();
	}

	fn wake(&self, id: TaskId) {
		let mut tasks = task::TASKS.lock();
		let Some(task) = tasks.get_mut(id) else { return };
		if task.status != TaskStatus::Blocked {
			return;
		}
		task.status = TaskStatus::Ready;
		let had_timer = task.flags.contains(task::TaskFlags::TIMER);
		task.flags.remove(task::TaskFlags::TIMER);
		let prio = task.prio;
		let last_core = task.last_core;
		drop(tasks);

		if had_timer && last_core == self.core_id {
			self.ready.lock().remove_timer(id);
		} else if had_timer {
			task::ready_queue_of(last_core).lock().remove_timer(id);
		}

		task::ready_queue_of(last_core).lock().push(id, prio);
		if last_core != self.core_id {
			apic::send_wakeup_ipi(last_core.0);
		}
	}

	/// Wakes a blocked task (§4.5 `wakeup_task`). Callable for a task on any core.
	pub fn wakeup_task(&self, id: TaskId) {
		self.wake(id);
	}

	/// Creates a new task (§4.5 task creation) and enqueues it on `core_id`.
	/// `tls_template`, if given, is copied into a fresh block private to the new
	/// task and installed as its thread pointer before `entry` ever runs.
	pub fn create_task(
		entry: extern "C" fn(usize) -> !,
		arg: usize,
		prio: Priority,
		core_id: CoreId,
		tls_template: Option<&[u8]>,
	) -> Result<TaskId, KernelError> {
		let stacks = switch::TaskStacks::new()?;
		let tls: Option<alloc::boxed::Box<[u8]>> =
			tls_template.map(|template| template.to_vec().into_boxed_slice());
		let tls_addr = tls.as_deref().map_or(0, |block| block.as_ptr() as u64);
		let sp = switch::build_stack_frame(&stacks, entry, arg, tls_addr);

		let id = {
			let mut tasks = task::TASKS.lock();
			tasks
				.insert(|id| {
					let mut t = Task::new(id, core_id, prio, stacks, current_tick());
					t.last_stack_pointer = sp as usize;
					t.tls = tls;
					t
				})
				.ok_or(KernelError::NoMem)?
		};

		let ready = task::ready_queue_of(core_id);
		ready.lock().push(id, prio);
		ready.lock().nr_tasks += 1;
		if core_id != core_local::core_id() {
			apic::send_wakeup_ipi(core_id.0);
		}
		Ok(id)
	}

	/// `create_task`, but inherits `heap`, `tls_addr`/`tls_size`, and `parent` from
	/// the calling task, and round-robins over the cores whose idle task is
	/// currently scheduled in (§4.5 `clone_task`). The child gets its own private
	/// copy of the parent's TLS block, not a shared one.
	pub fn clone_task(&self, entry: extern "C" fn(usize) -> !, arg: usize) -> Result<TaskId, KernelError> {
		let parent_id = self.current_task.get();
		let (heap, prio, tls_template) = {
			let tasks = task::TASKS.lock();
			let parent = tasks.get(parent_id).expect("current task missing");
			(parent.heap, parent.prio, parent.tls.as_deref().map(|b| b.to_vec()))
		};

		let target_core = self.next_clone_core();
		let id = Self::create_task(entry, arg, prio, target_core, tls_template.as_deref())?;

		let mut tasks = task::TASKS.lock();
		if let Some(child) = tasks.get_mut(id) {
			child.heap = heap;
			child.parent = Some(parent_id);
		}
		Ok(id)
	}

	/// Round-robins over every core whose idle task is currently scheduled in
	/// (§4.5 `clone_task`), falling back to this core if none are registered yet.
	fn next_clone_core(&self) -> CoreId {
		static NEXT: AtomicU32 = AtomicU32::new(0);
		let cores = task::registered_core_ids();
		if cores.is_empty() {
			return self.core_id;
		}
		let i = NEXT.fetch_add(1, Ordering::Relaxed) as usize % cores.len();
		cores[i]
	}

	/// Ends the current task (§4.5 Exit: `do_exit`). Never returns.
	pub fn exit(&self, _code: i32) -> ! {
		{
			let mut tasks = task::TASKS.lock();
			let task = tasks.get_mut(self.current_task.get()).expect("current task missing");
			task.status = TaskStatus::Finished;
		}
		self.reschedule();
		unreachable!("finished task was rescheduled back in");
	}

	/// FPU lazy-switch trap handler (§4.5 FPU lazy switch, §6 `#NM`).
	fn handle_fpu_trap(&self) {
		let current = self.current_task.get();
		let mut ready = self.ready.lock();
		let previous_owner = ready.fpu_owner;

		if previous_owner != Some(current) {
			if let Some(prev_id) = previous_owner {
				let mut tasks = task::TASKS.lock();
				if let Some(prev) = tasks.get_mut(prev_id) {
					prev.fpu.save();
					prev.flags.remove(task::TaskFlags::FPU_USED);
				}
			}
			ready.fpu_owner = Some(current);
		}
		drop(ready);

		let mut tasks = task::TASKS.lock();
		let task = tasks.get_mut(current).expect("current task missing");
		task.flags.insert(task::TaskFlags::FPU_USED);
		if !task.flags.contains(task::TaskFlags::FPU_INIT) {
			task.flags.insert(task::TaskFlags::FPU_INIT);
		}
		task.fpu.restore();

		unsafe {
			x86_64::registers::control::Cr0::update(|flags| {
				flags.remove(x86_64::registers::control::Cr0Flags::TASK_SWITCHED);
			});
		}
	}
}

/// Number of task slots this build supports; exposed for diagnostics.
pub const TASK_CAPACITY: usize = MAX_TASKS;

/// `src/kernel/idt.rs` calls this directly from the generic CPU-exception handler:
/// the faulting task is terminated, not the core.
pub fn abort_current_task(reason: KernelError) -> ! {
	log::error!("aborting current task: {reason}");
	core_local::core_scheduler().exit(i32::from(reason));
	unreachable!()
}

/// `src/kernel/idt.rs` calls this directly from the `#NM` handler.
pub fn fpu_trap() {
	core_local::core_scheduler().handle_fpu_trap();
}

pub use task::{Priority as TaskPriority, TaskId as Tid};
pub use task::{IDLE_PRIO as IdlePriority, NORMAL_PRIO as NormalPriority, REALTIME_PRIO as RealtimePriority};
