//! VMA list (§4.3): the address-sorted set of reserved virtual ranges. Orthogonal
//! to the page tables — removing a VMA does not unmap pages and vice versa.

use alloc::collections::BTreeMap;

use bitflags::bitflags;
use hermit_sync::InterruptTicketMutex;

use crate::config::{VMA_MAX, VMA_MIN};
use crate::errno::KernelError;

bitflags! {
	#[derive(Clone, Copy, Debug, PartialEq, Eq)]
	pub struct VmaFlags: u32 {
		const READ      = 1 << 0;
		const WRITE     = 1 << 1;
		const EXECUTE   = 1 << 2;
		const CACHEABLE = 1 << 3;
		const NO_ACCESS = 1 << 4;
		const USER      = 1 << 5;
		const HEAP      = 1 << 6;
	}
}

#[derive(Clone, Copy, Debug)]
pub struct Vma {
	pub start: u64,
	pub end: u64,
	pub flags: VmaFlags,
}

/// Keyed by `start`, kept address-sorted for free by `BTreeMap`'s ordering —
/// the same idiom the scheduler's task table uses for its own sorted indices.
static VMAS: InterruptTicketMutex<BTreeMap<u64, Vma>> = InterruptTicketMutex::new(BTreeMap::new());

fn overlaps(a_start: u64, a_end: u64, b_start: u64, b_end: u64) -> bool {
	a_start < b_end && b_start < a_end
}

/// Inserts `[start, end)` with the given flags. Overlap with an existing entry
/// is rejected with `-EINVAL`.
pub fn vma_add(start: u64, end: u64, flags: VmaFlags) -> Result<(), KernelError> {
	if start >= end || start < VMA_MIN || end > VMA_MAX {
		return Err(KernelError::Inval);
	}
	let mut vmas = VMAS.lock();
	for vma in vmas.values() {
		if overlaps(start, end, vma.start, vma.end) {
			return Err(KernelError::Inval);
		}
	}
	vmas.insert(start, Vma { start, end, flags });
	Ok(())
}

/// Scans for the first hole of at least `size` bytes within `[VMA_MIN,
/// VMA_MAX)`. Returns `0` if none exists (§4.1-style zero-sentinel failure).
pub fn vma_alloc(size: u64, flags: VmaFlags) -> u64 {
	let mut vmas = VMAS.lock();
	let mut cursor = VMA_MIN;
	for vma in vmas.values() {
		if vma.start >= cursor && vma.start - cursor >= size {
			break;
		}
		cursor = cursor.max(vma.end);
	}
	if cursor + size > VMA_MAX {
		return 0;
	}
	vmas.insert(cursor, Vma {
		start: cursor,
		end: cursor + size,
		flags,
	});
	cursor
}

/// Removes, shrinks, or splits whichever entry contains `[start, end)`.
pub fn vma_free(start: u64, end: u64) -> Result<(), KernelError> {
	let mut vmas = VMAS.lock();
	let key = vmas
		.iter()
		.find(|(_, v)| v.start <= start && end <= v.end)
		.map(|(k, _)| *k);
	let Some(key) = key else {
		return Err(KernelError::Inval);
	};
	let vma = vmas.remove(&key).unwrap();

	if vma.start == start && vma.end == end {
		// exact match: nothing to re-insert
	} else if vma.start == start {
		vmas.insert(end, Vma {
			start: end,
			end: vma.end,
			flags: vma.flags,
		});
	} else if vma.end == end {
		vmas.insert(vma.start, Vma {
			start: vma.start,
			end: start,
			flags: vma.flags,
		});
	} else {
		vmas.insert(vma.start, Vma {
			start: vma.start,
			end: start,
			flags: vma.flags,
		});
		vmas.insert(end, Vma {
			start: end,
			end: vma.end,
			flags: vma.flags,
		});
	}
	Ok(())
}

pub fn find_containing(addr: u64) -> Option<Vma> {
	VMAS.lock()
		.values()
		.find(|v| v.start <= addr && addr < v.end)
		.copied()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn reset() {
		VMAS.lock().clear();
	}

	#[test]
	fn add_then_free_restores_list_exactly() {
		reset();
		vma_add(0x10_0000, 0x20_0000, VmaFlags::READ | VmaFlags::WRITE).unwrap();
		assert!(VMAS.lock().is_empty() == false);
		vma_free(0x10_0000, 0x20_0000).unwrap();
		assert!(VMAS.lock().is_empty());
	}

	#[test]
	fn overlap_is_rejected() {
		reset();
		vma_add(0x10_0000, 0x20_0000, VmaFlags::READ).unwrap();
		assert_eq!(
			vma_add(0x18_0000, 0x28_0000, VmaFlags::READ),
			Err(KernelError::Inval)
		);
	}

	#[test]
	fn free_interior_range_splits_entry() {
		reset();
		vma_add(0x10_0000, 0x40_0000, VmaFlags::READ).unwrap();
		vma_free(0x20_0000, 0x30_0000).unwrap();
		let vmas = VMAS.lock();
		assert_eq!(vmas.len(), 2);
		assert!(find_containing(0x15_0000).is_some());
		assert!(find_containing(0x25_0000).is_none());
		assert!(find_containing(0x35_0000).is_some());
	}
}
