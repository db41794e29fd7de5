//! The POSIX-shaped error taxonomy kernel functions report through (§7).

use thiserror::Error;

/// Kernel-internal error. `From<KernelError> for i32` yields the negative errno a
/// C-era call site expects; allocators (frame/VMA) use the zero/null sentinel
/// convention instead and never construct this type on OOM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
	#[error("EINVAL")]
	Inval,
	#[error("ENOMEM")]
	NoMem,
	#[error("ENOSYS")]
	NoSys,
	#[error("EIO")]
	Io,
	#[error("ENXIO")]
	NxIo,
	#[error("ENOENT")]
	NoEnt,
	#[error("EFAULT")]
	Fault,
	#[error("ENODEV")]
	NoDev,
	#[error("EBUSY")]
	Busy,
	/// Catch-all for assertion-style kernel invariant violations (§7 fatal path) that
	/// have no POSIX code of their own, e.g. popping a task whose status is `INVALID`.
	#[error("kernel error: {0}")]
	Other(&'static str),
}

impl KernelError {
	pub const fn errno(self) -> i32 {
		match self {
			KernelError::Inval => 22,
			KernelError::NoMem => 12,
			KernelError::NoSys => 38,
			KernelError::Io => 5,
			KernelError::NxIo => 6,
			KernelError::NoEnt => 2,
			KernelError::Fault => 14,
			KernelError::NoDev => 19,
			KernelError::Busy => 16,
			KernelError::Other(_) => 1, // EPERM, closest POSIX fallback
		}
	}
}

impl From<KernelError> for i32 {
	fn from(err: KernelError) -> Self {
		-err.errno()
	}
}

pub type KernelResult<T> = Result<T, KernelError>;
