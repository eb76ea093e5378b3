//! Error codes
//!
//! Every fallible kernel operation returns one of these codes. The numeric
//! values follow the POSIX `errno` convention so that device drivers layered
//! on top of the kernel can propagate them unchanged.
use core::fmt;

/// POSIX-style error code returned by kernel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Errno {
    /// `EPERM` - the calling task does not own the object.
    NotOwner = 1,
    /// `EINTR` - a blocking operation was interrupted by a signal.
    Interrupted = 4,
    /// `EBADF` - the device is not open.
    BadFd = 9,
    /// `EAGAIN` - the operation would block.
    Again = 11,
    /// `ENOMEM` - out of memory. The kernel itself never allocates; reserved
    /// for drivers.
    NoMemory = 12,
    /// `EBUSY` - the object is busy.
    Busy = 16,
    /// `EINVAL` - invalid argument or wrong-state object.
    Invalid = 22,
    /// `EMFILE` - too many open files.
    TooManyOpen = 24,
    /// `EDEADLK` - a deadlock was detected.
    Deadlock = 35,
    /// `EOVERFLOW` - a value is outside the representable range.
    Overflow = 75,
    /// `EMSGSIZE` - raw queue element size mismatch.
    MessageSize = 90,
    /// `ENOBUFS` - the supplied buffer is too small.
    NoBuffers = 105,
    /// `ETIMEDOUT` - the deadline was reached before the operation could
    /// complete.
    TimedOut = 110,
}

impl Errno {
    /// Get the POSIX `errno` value.
    #[inline]
    pub const fn code(self) -> i16 {
        self as i16
    }

    /// The symbolic POSIX name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::NotOwner => "EPERM",
            Self::Interrupted => "EINTR",
            Self::BadFd => "EBADF",
            Self::Again => "EAGAIN",
            Self::NoMemory => "ENOMEM",
            Self::Busy => "EBUSY",
            Self::Invalid => "EINVAL",
            Self::TooManyOpen => "EMFILE",
            Self::Deadlock => "EDEADLK",
            Self::Overflow => "EOVERFLOW",
            Self::MessageSize => "EMSGSIZE",
            Self::NoBuffers => "ENOBUFS",
            Self::TimedOut => "ETIMEDOUT",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The result type of fallible kernel operations.
pub type Result<T = ()> = core::result::Result<T, Errno>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posix_values() {
        assert_eq!(Errno::NotOwner.code(), 1);
        assert_eq!(Errno::Interrupted.code(), 4);
        assert_eq!(Errno::Again.code(), 11);
        assert_eq!(Errno::Invalid.code(), 22);
        assert_eq!(Errno::Deadlock.code(), 35);
        assert_eq!(Errno::MessageSize.code(), 90);
        assert_eq!(Errno::TimedOut.code(), 110);
    }

    #[test]
    fn names() {
        assert_eq!(Errno::Again.name(), "EAGAIN");
        assert_eq!(format!("{}", Errno::TimedOut), "ETIMEDOUT");
    }
}
