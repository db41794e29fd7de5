//! uhyve hypercall ports (§6). Each port accepts the *physical* address of an
//! argument struct written through a dedicated I/O port; since this kernel has
//! no user/kernel split, the argument struct's virtual address is translated
//! to physical with [`crate::mm::paging::virt_to_phys`] before the `out`.

use uhyve_interface::GuestPhysAddr;
use x86_64::instructions::port::Port;

pub const UHYVE_PORT_WRITE: u16 = 0x400;
pub const UHYVE_PORT_OPEN: u16 = 0x440;
pub const UHYVE_PORT_CLOSE: u16 = 0x480;
pub const UHYVE_PORT_READ: u16 = 0x500;
pub const UHYVE_PORT_EXIT: u16 = 0x540;
pub const UHYVE_PORT_LSEEK: u16 = 0x580;

#[repr(C, packed)]
pub struct ExitParams {
	pub code: i32,
}

#[repr(C, packed)]
pub struct WriteParams {
	pub fd: i32,
	pub buf: GuestPhysAddr,
	pub len: usize,
}

#[repr(C, packed)]
pub struct ReadParams {
	pub fd: i32,
	pub buf: GuestPhysAddr,
	pub len: usize,
	pub ret: isize,
}

#[repr(C, packed)]
pub struct OpenParams {
	pub name: GuestPhysAddr,
	pub flags: i32,
	pub mode: i32,
	pub ret: i32,
}

#[repr(C, packed)]
pub struct CloseParams {
	pub fd: i32,
	pub ret: i32,
}

#[repr(C, packed)]
pub struct LseekParams {
	pub fd: i32,
	pub offset: isize,
	pub whence: i32,
}

fn phys_of<T>(arg: &mut T) -> GuestPhysAddr {
	let virt = arg as *mut T as u64;
	let phys = crate::mm::paging::virt_to_phys(virt).unwrap_or(virt);
	GuestPhysAddr::new(phys)
}

/// Writes the physical address of `arg` to `port`, the common shape of every
/// hypercall in the table (§6): the hypervisor reads/writes the struct in
/// place, so callers observe the effect through `arg` after this returns.
fn send<T>(port: u16, arg: &mut T) {
	let phys = phys_of(arg);
	let mut io: Port<u32> = Port::new(port);
	unsafe {
		io.write(phys.as_u64() as u32);
	}
}

pub fn exit(code: i32) -> ! {
	let mut params = ExitParams { code };
	send(UHYVE_PORT_EXIT, &mut params);
	loop {
		x86_64::instructions::hlt();
	}
}

pub fn write(fd: i32, buf: &[u8]) -> isize {
	let mut params = WriteParams {
		fd,
		buf: GuestPhysAddr::new(
			crate::mm::paging::virt_to_phys(buf.as_ptr() as u64).unwrap_or(buf.as_ptr() as u64),
		),
		len: buf.len(),
	};
	send(UHYVE_PORT_WRITE, &mut params);
	params.len as isize
}

pub fn read(fd: i32, buf: &mut [u8]) -> isize {
	let mut params = ReadParams {
		fd,
		buf: GuestPhysAddr::new(
			crate::mm::paging::virt_to_phys(buf.as_mut_ptr() as u64)
				.unwrap_or(buf.as_mut_ptr() as u64),
		),
		len: buf.len(),
		ret: -1,
	};
	send(UHYVE_PORT_READ, &mut params);
	params.ret
}

pub fn open(name: &core::ffi::CStr, flags: i32, mode: i32) -> i32 {
	let mut params = OpenParams {
		name: GuestPhysAddr::new(
			crate::mm::paging::virt_to_phys(name.as_ptr() as u64).unwrap_or(name.as_ptr() as u64),
		),
		flags,
		mode,
		ret: -1,
	};
	send(UHYVE_PORT_OPEN, &mut params);
	params.ret
}

pub fn close(fd: i32) -> i32 {
	let mut params = CloseParams { fd, ret: -1 };
	send(UHYVE_PORT_CLOSE, &mut params);
	params.ret
}

pub fn lseek(fd: i32, offset: isize, whence: i32) -> isize {
	let mut params = LseekParams { fd, offset, whence };
	send(UHYVE_PORT_LSEEK, &mut params);
	params.offset
}
