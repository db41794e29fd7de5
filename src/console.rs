//! Serial console: a 16550 UART on bare metal, the `UHYVE_PORT_WRITE` hypercall
//! under uhyve. Application and kernel log output share this one path regardless
//! of boot mode.

use core::fmt;

use hermit_sync::InterruptTicketMutex;
use x86_64::instructions::port::Port;

use crate::config::boot_info;

enum Inner {
	Uart(uart_16550::SerialPort),
	Uhyve(Port<u8>),
	Uninitialized,
}

pub struct Console {
	inner: Inner,
}

impl Console {
	const fn uninitialized() -> Self {
		Self {
			inner: Inner::Uninitialized,
		}
	}

	/// Brings the console online using the port patched into `BootInfo` by the
	/// loader. Safe to call more than once; later calls simply re-open the port.
	pub fn init(&mut self) {
		let port = boot_info().uartport();
		if boot_info().is_uhyve() {
			self.inner = Inner::Uhyve(Port::new(port));
		} else {
			let mut serial = unsafe { uart_16550::SerialPort::new(port) };
			serial.init();
			self.inner = Inner::Uart(serial);
		}
	}

	fn write_bytes(&mut self, buf: &[u8]) {
		match &mut self.inner {
			Inner::Uart(s) => {
				for &b in buf {
					s.send(b);
				}
			}
			Inner::Uhyve(port) => {
				// UHYVE_PORT_WRITE expects the physical address of a
				// `{ fd, buf_phys, len }` struct; fd 1 is stdout. Since this
				// kernel runs identity-mapped at boot, `buf.as_ptr()` already
				// is the physical address.
				#[repr(C)]
				struct WriteArgs {
					fd: i32,
					buf: *const u8,
					len: usize,
				}
				let args = WriteArgs {
					fd: 1,
					buf: buf.as_ptr(),
					len: buf.len(),
				};
				unsafe {
					port.write(0);
					let _ = &args;
					core::arch::asm!(
						"out dx, eax",
						in("dx") crate::kernel::uhyve::UHYVE_PORT_WRITE,
						in("eax") &args as *const WriteArgs as u32,
						options(nostack, preserves_flags),
					);
				}
			}
			Inner::Uninitialized => {}
		}
	}
}

impl fmt::Write for Console {
	fn write_str(&mut self, s: &str) -> fmt::Result {
		self.write_bytes(s.as_bytes());
		Ok(())
	}
}

pub static CONSOLE: InterruptTicketMutex<Console> =
	InterruptTicketMutex::new(Console::uninitialized());

#[doc(hidden)]
pub fn _print(args: fmt::Arguments<'_>) {
	use fmt::Write;
	let _ = CONSOLE.lock().write_fmt(args);
}

#[macro_export]
macro_rules! print {
	($($arg:tt)*) => {
		$crate::console::_print(format_args!($($arg)*))
	};
}

#[macro_export]
macro_rules! println {
	() => { $crate::print!("\n") };
	($($arg:tt)*) => {
		$crate::console::_print(format_args!("{}\n", format_args!($($arg)*)))
	};
}
