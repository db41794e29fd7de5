//! Compile-time constants and the loader-patched boot configuration block.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Size of a normal physical/virtual page.
pub const PAGE_SIZE: usize = 0x1000;
/// Size of a large (2 MiB) page.
pub const LARGE_PAGE_SIZE: usize = 0x20_0000;

/// Upper bound on live tasks across all cores.
pub const MAX_TASKS: usize = 512;
/// Upper bound on cores this build can bring up.
pub const MAX_CORES: usize = 64;
/// Number of priority levels, 0 (idle) through `MAX_PRIO - 1` (realtime).
pub const MAX_PRIO: usize = 32;

/// Default task kernel stack size.
pub const KERNEL_STACK_SIZE: usize = 32 * 1024;
/// Per-task interrupt stack table stack size.
pub const IST_SIZE: usize = 8 * 1024;
/// Default task (user) stack size.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024 * 1024;

/// Programmable timer frequency in Hz (one "tick" is `1/TIMER_FREQ` seconds).
pub const TIMER_FREQ: u32 = 100;

/// Lower bound of the VMA address range (§4.3).
pub const VMA_MIN: u64 = 0xC_0000;
/// Upper bound (exclusive) of the VMA address range (§4.3).
pub const VMA_MAX: u64 = 0xFFFF_FE80_0000_0000;

/// Real-mode address the AP bring-up trampoline is copied to.
pub const SMP_SETUP_ADDR: u64 = 0x8000;

/// mmnif: maximum number of isles this build recognizes.
pub const MAX_ISLE: usize = 8;
/// mmnif: descriptor-table capacity per sender.
pub const MAX_DESCRIPTORS: usize = 64;
/// mmnif: size in bytes of the shared ring heap per isle.
pub const MMNIF_RX_BUFFERLEN: usize = 0x1E0000;
/// mmnif: maximum Ethernet-framed payload length accepted by `mmnif_tx`.
pub const MMNIF_MAX_FRAME_LEN: usize = 1536;
/// mmnif: minimum accepted frame length (a bare IPv4 header).
pub const MMNIF_MIN_FRAME_LEN: usize = 20;

/// Boot-time configuration, patched by the loader at a fixed offset near the
/// kernel entry point (§6) and consumed once during early boot.
///
/// Mirrors the loader's ABI exactly: the field order here is load-bearing on the
/// real multiboot path, not merely descriptive.
#[repr(C)]
pub struct BootInfo {
	pub base_phys: AtomicU64,
	pub limit_phys: AtomicU64,
	pub possible_cpus: AtomicU32,
	pub current_boot_id: AtomicU32,
	pub uartport: AtomicU32,
	pub cmdline: AtomicU64,
	pub cmdline_len: AtomicUsize,
	pub mem_size: AtomicUsize,
	pub num_numa_nodes: AtomicU32,
	pub uhyve: AtomicBool,
	/// Explicit replacement for the weak-symbol `runtime_osinit` Go-runtime
	/// detection (§9 Design Notes): the loader sets this when the application
	/// image wants freshly-zeroed heap pages on every fault, instead of this
	/// kernel inferring it from a symbol that may or may not be present.
	pub zero_heap_pages: AtomicBool,
}

impl BootInfo {
	const fn new() -> Self {
		Self {
			base_phys: AtomicU64::new(0),
			limit_phys: AtomicU64::new(0),
			possible_cpus: AtomicU32::new(1),
			current_boot_id: AtomicU32::new(0),
			uartport: AtomicU32::new(0x3f8),
			cmdline: AtomicU64::new(0),
			cmdline_len: AtomicUsize::new(0),
			mem_size: AtomicUsize::new(0),
			num_numa_nodes: AtomicU32::new(1),
			uhyve: AtomicBool::new(false),
			zero_heap_pages: AtomicBool::new(false),
		}
	}

	pub fn possible_cpus(&self) -> u32 {
		self.possible_cpus.load(Ordering::Relaxed)
	}

	pub fn is_uhyve(&self) -> bool {
		self.uhyve.load(Ordering::Relaxed)
	}

	pub fn zero_heap_pages(&self) -> bool {
		self.zero_heap_pages.load(Ordering::Relaxed)
	}

	pub fn mem_size(&self) -> usize {
		self.mem_size.load(Ordering::Relaxed)
	}

	pub fn uartport(&self) -> u16 {
		self.uartport.load(Ordering::Relaxed) as u16
	}
}

static BOOT_INFO: BootInfo = BootInfo::new();

/// Returns the process-wide boot configuration block.
///
/// Valid only after [`crate::kernel::init_boot_info`] has run; reading it earlier
/// yields the conservative single-core defaults above.
pub fn boot_info() -> &'static BootInfo {
	&BOOT_INFO
}
