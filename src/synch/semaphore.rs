//! Counting, blocking semaphore (§4.5 Supplement). Layered directly on
//! `PerCoreScheduler::block_current_task`/`wakeup_task`, the same pair the scheduler
//! itself uses for `set_timer`/`wakeup_task`.

use alloc::collections::VecDeque;

use crossbeam_utils::Backoff;
use hermit_sync::InterruptTicketMutex;

use crate::kernel::core_local::core_scheduler;
use crate::scheduler::task::TaskId;
use crate::scheduler::current_tick;

struct State {
	count: isize,
	waiters: VecDeque<TaskId>,
}

/// A counting, blocking semaphore. Acquisition blocks the calling task (not the
/// core) until the count is positive; release increments it and wakes the
/// longest-waiting blocked task, if any.
pub struct Semaphore {
	state: InterruptTicketMutex<State>,
}

impl Semaphore {
	pub const fn new(count: isize) -> Self {
		Self {
			state: InterruptTicketMutex::new(State {
				count,
				waiters: VecDeque::new(),
			}),
		}
	}

	pub fn try_acquire(&self) -> bool {
		let mut state = self.state.lock();
		if state.count > 0 {
			state.count -= 1;
			true
		} else {
			false
		}
	}

	/// Blocks until a resource is available. Never returns without one.
	pub fn acquire(&self) {
		let backoff = Backoff::new();
		loop {
			if self.try_acquire() {
				return;
			}
			if backoff.is_completed() {
				let scheduler = core_scheduler();
				let me = scheduler.current_task_id();
				self.state.lock().waiters.push_back(me);
				scheduler.block_current_task(None);
			} else {
				backoff.snooze();
			}
		}
	}

	/// Blocks until a resource is available or `deadline` (absolute scheduler tick)
	/// passes. Returns `false` on timeout, having removed the caller from the
	/// semaphore's own wait list rather than relying solely on the timer queue's
	/// bookkeeping.
	pub fn acquire_timeout(&self, deadline: u64) -> bool {
		loop {
			if self.try_acquire() {
				return true;
			}
			if current_tick() >= deadline {
				return false;
			}

			let scheduler = core_scheduler();
			let me = scheduler.current_task_id();
			self.state.lock().waiters.push_back(me);
			scheduler.block_current_task(Some(deadline));

			if current_tick() < deadline {
				continue; // woken by a release(); try_acquire() above will confirm
			}

			let mut state = self.state.lock();
			let before = state.waiters.len();
			state.waiters.retain(|&id| id != me);
			if state.waiters.len() == before {
				// release() already popped us before the deadline fired; it handed
				// us the resource, we just haven't claimed it with try_acquire yet.
				drop(state);
				continue;
			}
			return false;
		}
	}

	/// Releases a resource, waking the longest-waiting blocked task if any.
	pub fn release(&self) {
		let woken = {
			let mut state = self.state.lock();
			state.count += 1;
			state.waiters.pop_front()
		};
		if let Some(id) = woken {
			core_scheduler().wakeup_task(id);
		}
	}
}
