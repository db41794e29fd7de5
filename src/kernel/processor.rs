//! CPUID feature detection, TSC timestamp/frequency, busy-wait delay, and the
//! lazily-saved/restored FPU state (§4.5 FPU lazy switch, §5 FPU).

use alloc::boxed::Box;
use alloc::vec;
use core::arch::x86_64::{__rdtscp, _fxrstor, _fxsave, _mm_lfence, _rdtsc};
use core::hint::spin_loop;

use hermit_sync::Lazy;
use raw_cpuid::CpuId;
use x86_64::registers::mxcsr::MxCsr;

struct Features {
	supports_x2apic: bool,
	supports_nx: bool,
	supports_xsave: bool,
	has_xsaveopt: bool,
	has_xsavec: bool,
	supports_rdtscp: bool,
	supports_1gib_pages: bool,
}

static FEATURES: Lazy<Features> = Lazy::new(|| {
	let cpuid = CpuId::new();
	let feature_info = cpuid
		.get_feature_info()
		.expect("CPUID leaf 1 (feature info) not available");
	let extended_info = cpuid.get_extended_processor_and_feature_identifiers();
	let extended_state_info = cpuid.get_extended_state_info();

	Features {
		supports_x2apic: feature_info.has_x2apic(),
		supports_nx: extended_info.as_ref().is_some_and(|i| i.has_execute_disable()),
		supports_xsave: feature_info.has_xsave(),
		has_xsaveopt: extended_state_info.as_ref().is_some_and(|i| i.has_xsaveopt()),
		has_xsavec: extended_state_info.as_ref().is_some_and(|i| i.has_xsaveopt()),
		supports_rdtscp: extended_info.as_ref().is_some_and(|i| i.has_rdtscp()),
		supports_1gib_pages: extended_info.as_ref().is_some_and(|i| i.has_1gib_pages()),
	}
});

pub fn supports_x2apic() -> bool {
	FEATURES.supports_x2apic
}

pub fn supports_nx() -> bool {
	FEATURES.supports_nx
}

pub fn supports_xsave() -> bool {
	FEATURES.supports_xsave
}

pub fn supports_1gib_pages() -> bool {
	FEATURES.supports_1gib_pages
}

#[inline]
pub fn get_timestamp() -> u64 {
	unsafe {
		if FEATURES.supports_rdtscp {
			let mut aux: u32 = 0;
			let value = __rdtscp(&mut aux as *mut u32);
			_mm_lfence();
			value
		} else {
			_mm_lfence();
			let value = _rdtsc();
			_mm_lfence();
			value
		}
	}
}

/// Busy-waits for `usecs` microseconds using the TSC and the calibrated
/// frequency (§4.4 calibration, §4.4 AP wakeup delays).
pub fn udelay(usecs: u64) {
	let end = get_timestamp() + u64::from(get_frequency_mhz()) * usecs;
	while get_timestamp() < end {
		spin_loop();
	}
}

enum FrequencySource {
	Invalid,
	BrandString,
	Fallback,
}

struct CpuFrequency {
	mhz: u16,
	#[allow(dead_code)]
	source: FrequencySource,
}

/// Parses a `"... 2.40GHz"`-shaped processor brand string into MHz, the same
/// fixed-point scan the lineage this kernel descends from uses (no float
/// parsing in a `no_std` early-boot context).
fn detect_from_brand_string(cpuid: &CpuId) -> Option<u16> {
	let brand = cpuid.get_processor_brand_string()?;
	let s = brand.as_str();
	let ghz_at = s.find("GHz")?;
	let index = ghz_at.checked_sub(4)?;
	let chars: alloc::vec::Vec<char> = s.chars().collect();
	let thousand = chars.get(index)?.to_digit(10)?;
	if *chars.get(index + 1)? != '.' {
		return None;
	}
	let hundred = chars.get(index + 2)?.to_digit(10)?;
	let ten = chars.get(index + 3)?.to_digit(10)?;
	Some((thousand * 1000 + hundred * 100 + ten * 10) as u16)
}

static CPU_FREQUENCY: Lazy<CpuFrequency> = Lazy::new(|| {
	let cpuid = CpuId::new();
	match detect_from_brand_string(&cpuid) {
		Some(mhz) => CpuFrequency {
			mhz,
			source: FrequencySource::BrandString,
		},
		// Conservative fallback so `udelay`/APIC calibration never divide by
		// zero; real firmware/uhyve always hits the brand-string path above.
		None => CpuFrequency {
			mhz: 1000,
			source: FrequencySource::Fallback,
		},
	}
});

/// Returns the CPU frequency in MHz, detecting it from the CPUID brand string
/// on first call (§4.4 Calibration uses this as the seed for the `rdtsc`
/// spin-wait before the LAPIC timer's own `icr` is known).
pub fn get_frequency_mhz() -> u16 {
	CPU_FREQUENCY.mhz
}

pub fn detect_frequency() {
	Lazy::force(&CPU_FREQUENCY);
}

#[repr(C, align(16))]
struct XSaveLegacyRegion {
	fpu_control_word: u16,
	fpu_status_word: u16,
	fpu_tag_word: u16,
	fpu_opcode: u16,
	fpu_instruction_pointer: u32,
	fpu_instruction_pointer_high_or_cs: u32,
	fpu_data_pointer: u32,
	fpu_data_pointer_high_or_ds: u32,
	mxcsr: MxCsr,
	mxcsr_mask: u32,
	st_space: [u8; 8 * 16],
	xmm_space: [u8; 16 * 16],
	padding: [u8; 96],
}

#[derive(Clone)]
#[repr(C, align(64))]
struct AlignToSixtyFour([u8; 64]);

/// Per-task lazily-saved FPU register file (§3 Task/PCB `fpu` field). Sized to
/// the XSAVE area when available, else the legacy FXSAVE layout.
pub struct FpuState {
	area: Box<[AlignToSixtyFour]>,
}

impl FpuState {
	pub fn new() -> Self {
		let size = if supports_xsave() {
			CpuId::new()
				.get_extended_state_info()
				.map(|i| i.xsave_area_size_enabled_features() as usize)
				.unwrap_or(core::mem::size_of::<XSaveLegacyRegion>())
		} else {
			core::mem::size_of::<XSaveLegacyRegion>()
		};

		let units = size.div_ceil(core::mem::size_of::<AlignToSixtyFour>());
		let mut area = vec![AlignToSixtyFour([0; 64]); units].into_boxed_slice();

		// Safety: `area` is at least `size_of::<XSaveLegacyRegion>()` bytes.
		let legacy = unsafe { &mut *area.as_mut_ptr().cast::<XSaveLegacyRegion>() };
		legacy.fpu_control_word = 0x37f;
		legacy.fpu_tag_word = 0xffff;
		legacy.mxcsr = MxCsr::default();

		Self { area }
	}

	pub fn restore(&self) {
		if FEATURES.supports_xsave {
			unsafe { core::arch::x86_64::_xrstor(self.area.as_ptr().cast::<u8>(), u64::MAX) }
		} else {
			unsafe { _fxrstor(self.area.as_ptr().cast::<u8>()) }
		}
	}

	pub fn save(&mut self) {
		if FEATURES.supports_xsave {
			unsafe {
				if FEATURES.has_xsavec {
					core::arch::x86_64::_xsavec(self.area.as_mut_ptr().cast::<u8>(), u64::MAX)
				} else if FEATURES.has_xsaveopt {
					core::arch::x86_64::_xsaveopt(self.area.as_mut_ptr().cast::<u8>(), u64::MAX)
				} else {
					core::arch::x86_64::_xsave(self.area.as_mut_ptr().cast::<u8>(), u64::MAX)
				}
			}
		} else {
			unsafe {
				_fxsave(self.area.as_mut_ptr().cast::<u8>());
				core::arch::asm!("fnclex", options(nomem, nostack));
			}
		}
	}
}

impl Default for FpuState {
	fn default() -> Self {
		Self::new()
	}
}
