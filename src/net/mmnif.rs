//! mmnif — the intra-isle shared-memory network (§4.6). Each isle owns one ring
//! (header + heap) that every other isle can write packets into directly; a per-ring
//! spinlock (`islelock`) serializes concurrent senders, and the descriptor state
//! machine (`FREE → PENDING → RDY → INPROC → PROC → FREE`) hands a range of the
//! heap off from producer to consumer without copying it twice.
//!
//! Grounded on the descriptor/state-machine idiom of the virtio virtqueue driver and
//! exposed at the boundary the loopback network driver uses: plain
//! `send_packet`/`receive_packet` rather than a full device trait, since no IP stack
//! lives in this crate (§1 Non-goals).

use alloc::boxed::Box;
use alloc::vec::Vec;

use hermit_sync::InterruptTicketMutex;

use x86_64::structures::idt::InterruptStackFrame;

use crate::config::{MAX_DESCRIPTORS, MAX_ISLE, MMNIF_MAX_FRAME_LEN, MMNIF_MIN_FRAME_LEN, MMNIF_RX_BUFFERLEN};
use crate::errno::KernelError;
use crate::kernel::idt::{self, MMNIF_VECTOR};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum DescStat {
	Free,
	Pending,
	Rdy,
	InProc,
	Proc,
}

#[derive(Copy, Clone)]
struct Descriptor {
	stat: DescStat,
	len: u16,
	addr: usize,
}

impl Descriptor {
	const fn empty() -> Self {
		Self {
			stat: DescStat::Free,
			len: 0,
			addr: 0,
		}
	}
}

/// One isle's inbound mailbox: descriptor table plus the contiguous byte ring its
/// descriptors address into (§3 mmnif ring). `head`/`tail` are byte offsets into
/// `heap`; widened to `usize` from the nominal `u16` since `MMNIF_RX_BUFFERLEN`
/// exceeds 64 KiB.
struct Ring {
	head: usize,
	tail: usize,
	dwrite: usize,
	dread: usize,
	dcount: u8,
	desc_table: [Descriptor; MAX_DESCRIPTORS],
	heap: Box<[u8]>,
}

impl Ring {
	fn new() -> Self {
		Self {
			head: 0,
			tail: 0,
			dwrite: 0,
			dread: 0,
			dcount: MAX_DESCRIPTORS as u8,
			desc_table: [Descriptor::empty(); MAX_DESCRIPTORS],
			heap: alloc::vec![0u8; MMNIF_RX_BUFFERLEN].into_boxed_slice(),
		}
	}

	/// Reserves `len` bytes in the ring, wrapping to offset 0 if the forward space
	/// would overrun the buffer (§4.6 Transmit step 2). Returns `None` if neither the
	/// forward run nor the wrapped run has room — the ring is full.
	fn reserve(&mut self, len: usize) -> Option<usize> {
		if self.tail >= self.head {
			let remaining = MMNIF_RX_BUFFERLEN - self.tail;
			if len <= remaining {
				return Some(self.tail);
			}
			if len <= self.head {
				return Some(0);
			}
			None
		} else {
			let remaining = self.head - self.tail;
			if len <= remaining {
				Some(self.tail)
			} else {
				None
			}
		}
	}

	/// Publishes a `PENDING` descriptor for `[addr, addr+len)` and advances `tail`/
	/// `dwrite` (§4.6 Transmit step 3). Caller still owns writing the payload and
	/// flipping the descriptor to `RDY` once that copy is done. Returns the
	/// descriptor slot, to be handed back to the caller alongside `addr`.
	fn publish_pending(&mut self, addr: usize, len: usize) -> usize {
		let slot = self.dwrite;
		self.desc_table[slot] = Descriptor {
			stat: DescStat::Pending,
			len: len as u16,
			addr,
		};
		self.dwrite = (self.dwrite + 1) % MAX_DESCRIPTORS;
		self.dcount -= 1;
		self.tail = addr + len;
		slot
	}

	/// Drains every contiguous `RDY` descriptor starting at `dread`, copying each
	/// payload out and returning it, then releases its heap range back to `FREE`
	/// (§4.6 Receive).
	fn drain(&mut self) -> Vec<Vec<u8>> {
		let mut out = Vec::new();
		loop {
			let slot = self.dread;
			let desc = self.desc_table[slot];
			match desc.stat {
				DescStat::Rdy => {
					self.desc_table[slot].stat = DescStat::InProc;
					let bytes = self.heap[desc.addr..desc.addr + desc.len as usize].to_vec();
					out.push(bytes);
					self.desc_table[slot].stat = DescStat::Proc;

					let next_addr = self.desc_table[(slot + 1) % MAX_DESCRIPTORS].addr;
					if next_addr < desc.addr {
						self.head = 0;
					} else {
						self.head = desc.addr + desc.len as usize;
					}
					self.desc_table[slot] = Descriptor::empty();
					self.dcount += 1;
					self.dread = (self.dread + 1) % MAX_DESCRIPTORS;
				}
				_ => break,
			}
		}
		out
	}
}

struct Isle {
	lock: InterruptTicketMutex<Ring>,
	/// Frames the doorbell IRQ has already pulled out of the ring but no one has
	/// polled for yet (§4.6 Receive: the IRQ-context walk and the `receive_packet`
	/// consumer run at different times, so this hands off between them).
	inbox: InterruptTicketMutex<alloc::collections::VecDeque<Vec<u8>>>,
}

static ISLES: InterruptTicketMutex<Vec<Option<&'static Isle>>> = InterruptTicketMutex::new(Vec::new());
static MY_ISLE: core::sync::atomic::AtomicU8 = core::sync::atomic::AtomicU8::new(0);

extern "x86-interrupt" fn doorbell_handler(_frame: InterruptStackFrame) {
	crate::kernel::interrupts::eoi(MMNIF_VECTOR);
	let my_isle = MY_ISLE.load(core::sync::atomic::Ordering::Relaxed);
	if my_isle == 0 {
		return;
	}
	let isles = ISLES.lock();
	let Some(isle) = isles.get(my_isle as usize - 1).copied().flatten() else {
		return;
	};
	drop(isles);
	let frames = isle.lock.lock().drain();
	isle.inbox.lock().extend(frames);
}

/// Registers this isle's own inbound ring and the doorbell IRQ vector; called once
/// at network bring-up with the isle id the launcher assigned this instance (§4.6).
pub fn init(my_isle: u8) {
	MY_ISLE.store(my_isle, core::sync::atomic::Ordering::Relaxed);
	let mut isles = ISLES.lock();
	isles.resize_with(MAX_ISLE, || None);
	let slot: &'static Isle = Box::leak(Box::new(Isle {
		lock: InterruptTicketMutex::new(Ring::new()),
		inbox: InterruptTicketMutex::new(alloc::collections::VecDeque::new()),
	}));
	isles[my_isle as usize - 1] = Some(slot);
	drop(isles);
	idt::register(MMNIF_VECTOR, doorbell_handler);
}

/// `last octet of destination IPv4 ∈ 192.168.28.0/24` selects the isle; anything
/// else is routed to isle 1, the Linux host (§6 Network).
pub fn isle_for_ipv4(dest: [u8; 4]) -> u8 {
	if dest[0] == 192 && dest[1] == 168 && dest[2] == 28 {
		dest[3]
	} else {
		1
	}
}

fn dest_isle_of_frame(frame: &[u8]) -> Result<u8, KernelError> {
	if frame.len() < MMNIF_MIN_FRAME_LEN {
		return Err(KernelError::Inval);
	}
	// Bare IPv4 (no Ethernet header, per the minimum length matching the IPv4
	// header size exactly): destination address lives at offset 16..20.
	let dest = [frame[16], frame[17], frame[18], frame[19]];
	Ok(isle_for_ipv4(dest))
}

const SPIN_LIMIT: u32 = 1_000;

/// Sends `frame` to whichever isle its destination address resolves to (§4.6
/// Transmit, §6 Network). Spins (bounded, unlike the free-running spin of the
/// system this is grounded on) while the destination ring reports no free
/// descriptors, since §4.6 deliberately has no send-side queueing.
pub fn send_packet(frame: &[u8]) -> Result<(), KernelError> {
	if frame.len() > MMNIF_MAX_FRAME_LEN {
		return Err(KernelError::Inval);
	}
	let dest_isle = dest_isle_of_frame(frame)?;
	send_to_isle(dest_isle, frame)
}

fn send_to_isle(dest_isle: u8, payload: &[u8]) -> Result<(), KernelError> {
	if dest_isle == 0 || dest_isle as usize > MAX_ISLE {
		return Err(KernelError::Inval);
	}
	let isles = ISLES.lock();
	let isle = isles.get(dest_isle as usize - 1).copied().flatten().ok_or(KernelError::NoDev)?;
	drop(isles);

	let (slot, heap_addr) = {
		let mut spins = 0;
		loop {
			let mut ring = isle.lock.lock();
			if ring.dcount > 0 {
				if let Some(addr) = ring.reserve(payload.len()) {
					let slot = ring.publish_pending(addr, payload.len());
					break (slot, addr);
				}
			}
			drop(ring);
			spins += 1;
			if spins >= SPIN_LIMIT {
				return Err(KernelError::Busy);
			}
			core::hint::spin_loop();
		}
	};

	{
		let mut ring = isle.lock.lock();
		ring.heap[heap_addr..heap_addr + payload.len()].copy_from_slice(payload);
		ring.desc_table[slot].stat = DescStat::Rdy;
	}

	crate::kernel::apic::send_ipi(dest_isle as u32, MMNIF_VECTOR);
	Ok(())
}

/// Pops one frame the doorbell IRQ has already pulled off this isle's ring, if
/// any (§4.6 Receive). The network-stack seam polls this; there is no IP stack
/// in this crate to hand the frame to (§1 Non-goals), so callers that want one
/// delivered somewhere still have to do that themselves.
pub fn receive_packet() -> Option<Vec<u8>> {
	let my_isle = MY_ISLE.load(core::sync::atomic::Ordering::Relaxed);
	if my_isle == 0 {
		return None;
	}
	let isles = ISLES.lock();
	let isle = isles.get(my_isle as usize - 1).copied().flatten()?;
	drop(isles);
	isle.inbox.lock().pop_front()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn isle_selection_matches_subnet_rule() {
		assert_eq!(isle_for_ipv4([192, 168, 28, 3]), 3);
		assert_eq!(isle_for_ipv4([10, 0, 0, 1]), 1);
	}

	#[test]
	fn ring_reserve_wraps_when_forward_space_is_insufficient() {
		let mut ring = Ring::new();
		ring.tail = MMNIF_RX_BUFFERLEN - 10;
		ring.head = 0;
		assert_eq!(ring.reserve(20), Some(0));
	}

	#[test]
	fn ring_publish_and_drain_round_trips_a_payload() {
		let mut ring = Ring::new();
		let addr = ring.reserve(5).unwrap();
		let slot = ring.publish_pending(addr, 5);
		ring.heap[addr..addr + 5].copy_from_slice(b"hello");
		ring.desc_table[slot].stat = DescStat::Rdy;

		let frames = ring.drain();
		assert_eq!(frames, alloc::vec![b"hello".to_vec()]);
		assert_eq!(ring.dcount, MAX_DESCRIPTORS as u8);
	}
}
