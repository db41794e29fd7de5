//! `log::Log` implementation wired over [`crate::console`].
//!
//! The level filter is compiled in rather than read at runtime: this kernel's
//! `trace!`/`debug!` call sites sit on interrupt-hot paths (IRQ dispatch, the
//! scheduler), and a runtime `Ordering::Relaxed` load on every call site is
//! measurable there. Pick the ceiling with `--cfg hermit_log_level="..."` style
//! feature selection at the call site's Cargo.toml instead.

use log::{Level, LevelFilter, Metadata, Record};

struct KernelLogger;

impl log::Log for KernelLogger {
	fn enabled(&self, metadata: &Metadata<'_>) -> bool {
		metadata.level() <= max_level()
	}

	fn log(&self, record: &Record<'_>) {
		if !self.enabled(record.metadata()) {
			return;
		}
		let color = match record.level() {
			Level::Error => "\x1b[31m",
			Level::Warn => "\x1b[33m",
			Level::Info => "\x1b[32m",
			Level::Debug => "\x1b[34m",
			Level::Trace => "\x1b[90m",
		};
		crate::println!(
			"{color}[{:5} core {}] {}\x1b[0m",
			record.level(),
			crate::kernel::core_local::try_core_id(),
			record.args()
		);
	}

	fn flush(&self) {}
}

const fn max_level() -> LevelFilter {
	if cfg!(debug_assertions) {
		LevelFilter::Debug
	} else {
		LevelFilter::Info
	}
}

static LOGGER: KernelLogger = KernelLogger;

/// Installs the kernel logger as the global `log` sink. Must run after
/// [`crate::console::Console::init`] so early messages are not dropped silently.
pub fn init() {
	log::set_logger(&LOGGER).expect("logger already installed");
	log::set_max_level(max_level());
}
