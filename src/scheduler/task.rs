//! Task/PCB data model (§3 Task/PCB, §4.5 Scheduler invariants): the task table, the
//! per-core priority ready queue, and the timer queue it shares a lock with.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::num::NonZeroU32;

use bitflags::bitflags;
use hermit_sync::InterruptTicketMutex;

use crate::config::{MAX_PRIO, MAX_TASKS};
use crate::kernel::processor::FpuState;
use crate::scheduler::{switch::TaskStacks, CoreId};

/// Returns the index of the most significant set bit, or `None` if `n == 0`.
#[inline]
fn msb(n: u32) -> Option<u32> {
	NonZeroU32::new(n).map(|n| u32::BITS - 1 - n.leading_zeros())
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TaskStatus {
	Invalid,
	Ready,
	Running,
	Blocked,
	Finished,
	Idle,
}

#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy, Hash)]
pub struct TaskId(u32);

impl TaskId {
	pub const fn from(x: u32) -> Self {
		TaskId(x)
	}

	pub const fn into(self) -> u32 {
		self.0
	}
}

impl core::fmt::Display for TaskId {
	fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Clone, Copy)]
pub struct Priority(u8);

impl Priority {
	pub const fn from(x: u8) -> Self {
		Priority(x)
	}

	pub const fn into(self) -> u8 {
		self.0
	}
}

/// Priority 0 is reserved for the per-core idle task (§3 Task/PCB).
pub const IDLE_PRIO: Priority = Priority::from(0);
pub const NORMAL_PRIO: Priority = Priority::from(16);
pub const REALTIME_PRIO: Priority = Priority::from(31);

/// `prio ∈ [1, 31]`, so `NO_PRIORITIES` ready-queue slots at index `prio - 1`.
pub const NO_PRIORITIES: usize = MAX_PRIO as usize - 1;

bitflags! {
	#[derive(Copy, Clone, Debug, Default)]
	pub struct TaskFlags: u8 {
		const FPU_INIT = 1 << 0;
		const FPU_USED = 1 << 1;
		const TIMER = 1 << 2;
	}
}

pub type Tick = u64;

/// Task control block. Lives inside the fixed-capacity arena in [`TaskTable`];
/// referenced everywhere else by [`TaskId`] rather than by pointer (§9 Open Questions:
/// the intrusive `next`/`prev` links of the legacy PCB are replaced by this arena plus
/// `VecDeque<TaskId>` ready queues).
pub struct Task {
	pub id: TaskId,
	pub status: TaskStatus,
	pub last_core: CoreId,
	pub last_stack_pointer: usize,
	pub stacks: TaskStacks,
	pub flags: TaskFlags,
	pub prio: Priority,
	pub timeout: Option<Tick>,
	pub start_tick: Tick,
	pub last_tsc: u64,
	/// `[heap_start, heap_end)`, inherited by clones, freed only by the root on exit.
	pub heap: Option<(u64, u64)>,
	pub parent: Option<TaskId>,
	/// This task's private TLS block, if `create_task`/`clone_task` was handed a
	/// template to copy. Stands in for the PCB's raw `tls_addr`/`tls_size: usize`
	/// pair the same way `heap` above stands in for a `VMA*`: ownership here does
	/// the bookkeeping a bare address/length pair would otherwise need, and freeing
	/// it is just letting this field drop (§4.5 Exit: "frees the TLS copy if any").
	pub tls: Option<Box<[u8]>>,
	pub signal_handler: Option<extern "C" fn(i32)>,
	pub lwip_err: i32,
	pub fpu: FpuState,
}

impl Task {
	pub fn new(id: TaskId, core_id: CoreId, prio: Priority, stacks: TaskStacks, tick: Tick) -> Self {
		Task {
			id,
			status: TaskStatus::Ready,
			last_core: core_id,
			last_stack_pointer: 0,
			stacks,
			flags: TaskFlags::empty(),
			prio,
			timeout: None,
			start_tick: tick,
			last_tsc: 0,
			heap: None,
			parent: None,
			tls: None,
			signal_handler: None,
			lwip_err: 0,
			fpu: FpuState::new(),
		}
	}

	pub fn tls_addr(&self) -> usize {
		self.tls.as_deref().map_or(0, |block| block.as_ptr() as usize)
	}

	pub fn tls_size(&self) -> usize {
		self.tls.as_deref().map_or(0, |block| block.len())
	}
}

/// Fixed-capacity slab of at most [`MAX_TASKS`] tasks, indexed by [`TaskId`]. A `None`
/// slot is the arena's notion of `INVALID` (§3: "INVALID and FINISHED tasks are in no
/// queue" — `FINISHED` is a transient status on an occupied slot; `finish_task_switch`
/// frees the slot back to `None`).
pub struct TaskTable {
	slots: Vec<Option<Task>>,
}

impl TaskTable {
	const fn new() -> Self {
		Self { slots: Vec::new() }
	}

	fn ensure_capacity(&mut self) {
		if self.slots.is_empty() {
			self.slots.resize_with(MAX_TASKS, || None);
		}
	}

	/// Scans for the first free slot and installs `task` there, or returns `None` if
	/// the table is full (§4.5 task creation step 2: "scan for the first INVALID
	/// slot; if none, return -ENOMEM").
	pub fn insert(&mut self, make: impl FnOnce(TaskId) -> Task) -> Option<TaskId> {
		self.ensure_capacity();
		let index = self.slots.iter().position(Option::is_none)?;
		let id = TaskId::from(index as u32);
		self.slots[index] = Some(make(id));
		Some(id)
	}

	pub fn get(&self, id: TaskId) -> Option<&Task> {
		self.slots.get(id.into() as usize)?.as_ref()
	}

	pub fn get_mut(&mut self, id: TaskId) -> Option<&mut Task> {
		self.slots.get_mut(id.into() as usize)?.as_mut()
	}

	/// Frees the slot, returning the task that occupied it.
	pub fn remove(&mut self, id: TaskId) -> Option<Task> {
		self.slots.get_mut(id.into() as usize)?.take()
	}
}

pub static TASKS: InterruptTicketMutex<TaskTable> = InterruptTicketMutex::new(TaskTable::new());

/// Per-core priority-bitmap ready queue plus the timer queue (§3 Ready queue,
/// §4.5 invariants). Both share this struct's lock since `wakeup_task` and
/// `set_timer` touch both under a single critical section.
pub struct ReadyQueue {
	queues: [VecDeque<TaskId>; NO_PRIORITIES],
	prio_bitmap: u32,
	pub idle: Option<TaskId>,
	/// Stashed by the outgoing side of a context switch under this same lock, and
	/// drained by whichever task next calls `finish_task_switch` — which may be a
	/// different task than the one that stashed it, since a brand-new task's first
	/// instruction is `thread_entry`, not a return from the switch call (§4.5
	/// `finish_task_switch`).
	pub old_task: Option<TaskId>,
	pub fpu_owner: Option<TaskId>,
	pub nr_tasks: u32,
	/// Sorted ascending by deadline; the head is the next tick to arm the LAPIC for.
	timers: Vec<(Tick, TaskId)>,
}

impl ReadyQueue {
	pub const fn new() -> Self {
		const EMPTY: VecDeque<TaskId> = VecDeque::new();
		Self {
			queues: [EMPTY; NO_PRIORITIES],
			prio_bitmap: 0,
			idle: None,
			old_task: None,
			fpu_owner: None,
			nr_tasks: 0,
			timers: Vec::new(),
		}
	}

	pub fn push(&mut self, id: TaskId, prio: Priority) {
		debug_assert_ne!(prio, IDLE_PRIO, "the idle task is never enqueued");
		let slot = prio.into() as usize - 1;
		self.queues[slot].push_back(id);
		self.prio_bitmap |= 1 << slot;
	}

	fn pop_slot(&mut self, slot: usize) -> Option<TaskId> {
		let id = self.queues[slot].pop_front()?;
		if self.queues[slot].is_empty() {
			self.prio_bitmap &= !(1 << slot);
		}
		Some(id)
	}

	/// Pops the highest-priority ready task, if any.
	pub fn pop(&mut self) -> Option<TaskId> {
		let slot = msb(self.prio_bitmap)? as usize;
		self.pop_slot(slot)
	}

	/// Highest ready priority, or `None` if the queue is empty.
	pub fn highest_priority(&self) -> Option<Priority> {
		msb(self.prio_bitmap).map(|slot| Priority::from(slot as u8 + 1))
	}

	pub fn remove(&mut self, id: TaskId, prio: Priority) -> bool {
		let slot = prio.into() as usize - 1;
		let queue = &mut self.queues[slot];
		let before = queue.len();
		queue.retain(|&t| t != id);
		if queue.is_empty() {
			self.prio_bitmap &= !(1 << slot);
		}
		queue.len() != before
	}

	/// Inserts into the deadline-sorted timer queue, returning `true` if `id` became
	/// the new head (the caller must then reprogram the LAPIC one-shot).
	pub fn push_timer(&mut self, id: TaskId, deadline: Tick) -> bool {
		let pos = self.timers.partition_point(|&(t, _)| t <= deadline);
		self.timers.insert(pos, (deadline, id));
		pos == 0
	}

	/// Removes `id` from the timer queue. Returns `true` if the head changed (the
	/// caller must reprogram or disarm the LAPIC one-shot).
	pub fn remove_timer(&mut self, id: TaskId) -> bool {
		let Some(pos) = self.timers.iter().position(|&(_, t)| t == id) else {
			return false;
		};
		self.timers.remove(pos);
		pos == 0
	}

	/// Pops every timer whose deadline has elapsed, returning the tasks to wake.
	pub fn expire_timers(&mut self, now: Tick) -> Vec<TaskId> {
		let split = self.timers.partition_point(|&(t, _)| t <= now);
		self.timers.drain(..split).map(|(_, id)| id).collect()
	}

	pub fn next_deadline(&self) -> Option<Tick> {
		self.timers.first().map(|&(t, _)| t)
	}
}

/// Global registry of every core's ready queue, keyed by [`CoreId`] (§4.5
/// `wakeup_task`: "push onto the ready queue of `task.last_core`"). `CoreLocal` only
/// ever exposes the *current* core's scheduler through `GS_BASE`, so remote enqueue
/// needs this separate table — the same shape as the legacy kernel's global scheduler
/// input registry, indexed by core instead of looked up by iteration.
static READYQUEUES: InterruptTicketMutex<Vec<Option<&'static InterruptTicketMutex<ReadyQueue>>>> =
	InterruptTicketMutex::new(Vec::new());

/// Leaks a fresh [`ReadyQueue`] and registers it for `core_id`. Called once per core
/// during bring-up, before that core's scheduler starts picking tasks.
pub fn register_core(core_id: CoreId) -> &'static InterruptTicketMutex<ReadyQueue> {
	let queue: &'static InterruptTicketMutex<ReadyQueue> =
		Box::leak(Box::new(InterruptTicketMutex::new(ReadyQueue::new())));
	let mut registry = READYQUEUES.lock();
	let index = core_id.0 as usize;
	if registry.len() <= index {
		registry.resize(index + 1, None);
	}
	registry[index] = Some(queue);
	queue
}

pub fn ready_queue_of(core_id: CoreId) -> &'static InterruptTicketMutex<ReadyQueue> {
	READYQUEUES.lock()[core_id.0 as usize].expect("ready queue requested for an unregistered core")
}

/// Every core whose idle task is currently scheduled in (§4.5 `clone_task`:
/// "the set of cores whose `readyqueues[c].idle` is non-null"), in ascending
/// `CoreId` order.
pub fn registered_core_ids() -> Vec<CoreId> {
	READYQUEUES
		.lock()
		.iter()
		.enumerate()
		.filter_map(|(i, slot)| slot.filter(|q| q.lock().idle.is_some()).map(|_| CoreId(i as u32)))
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn bitmap_tracks_highest_priority() {
		let mut q = ReadyQueue::new();
		assert_eq!(q.highest_priority(), None);
		q.push(TaskId::from(1), Priority::from(5));
		q.push(TaskId::from(2), Priority::from(9));
		assert_eq!(q.highest_priority(), Some(Priority::from(9)));
		assert_eq!(q.pop(), Some(TaskId::from(2)));
		assert_eq!(q.highest_priority(), Some(Priority::from(5)));
		assert_eq!(q.pop(), Some(TaskId::from(1)));
		assert_eq!(q.highest_priority(), None);
	}

	#[test]
	fn fifo_within_same_priority() {
		let mut q = ReadyQueue::new();
		q.push(TaskId::from(1), Priority::from(4));
		q.push(TaskId::from(2), Priority::from(4));
		assert_eq!(q.pop(), Some(TaskId::from(1)));
		assert_eq!(q.pop(), Some(TaskId::from(2)));
	}

	#[test]
	fn timer_queue_stays_sorted_and_expires_heads() {
		let mut q = ReadyQueue::new();
		assert!(q.push_timer(TaskId::from(1), 100));
		assert!(q.push_timer(TaskId::from(2), 50)); // earlier deadline displaces the head
		assert_eq!(q.next_deadline(), Some(50));
		let woken = q.expire_timers(60);
		assert_eq!(woken, [TaskId::from(2)]);
		assert_eq!(q.next_deadline(), Some(100));
		let woken = q.expire_timers(100);
		assert_eq!(woken, [TaskId::from(1)]);
		assert_eq!(q.next_deadline(), None);
	}

	#[test]
	fn remove_clears_bitmap_when_queue_drains() {
		let mut q = ReadyQueue::new();
		q.push(TaskId::from(1), Priority::from(7));
		assert!(q.remove(TaskId::from(1), Priority::from(7)));
		assert_eq!(q.highest_priority(), None);
	}

	#[test]
	fn task_table_reuses_freed_slots() {
		let mut table = TaskTable::new();
		let a = table
			.insert(|id| Task::new(id, CoreId(0), NORMAL_PRIO, TaskStacks::new_for_test(), 0))
			.unwrap();
		table.remove(a);
		let b = table
			.insert(|id| Task::new(id, CoreId(0), NORMAL_PRIO, TaskStacks::new_for_test(), 0))
			.unwrap();
		assert_eq!(a, b);
	}
}
