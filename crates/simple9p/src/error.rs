//! 9P error representations.
//!
//! In 9P2000 errors travel as strings inside `Rerror`. The server only ever
//! sends strings from the fixed vocabulary in [`string`], selected through
//! [`Ename`]. Host failures arrive as errno values or `std::io::Error`s and are
//! folded onto that vocabulary by [`map_errno`].

use crate::error::errno::*;
use nix::errno::Errno;
use std::error as stderror;
use std::io::ErrorKind::*;
use std::{fmt, io};

/// System error numbers.
pub mod errno {
    pub use nix::errno::Errno::*;
}

/// 9P2000 error strings.
pub mod string {
    pub const EUNKNOWNFID: &str = "unknown fid";
    pub const ENOAUTH: &str = "no authentication required";
    pub const EBADOFFSET: &str = "bad offset";
    pub const EBOTCH: &str = "protocol botch";
    pub const ECREATENONDIR: &str = "create in non-directory";
    pub const EDUPFID: &str = "duplicate fid";
    pub const EDUPTAG: &str = "duplicate tag";
    pub const EISDIR: &str = "is a directory";
    pub const ENOCREATE: &str = "create prohibited";
    pub const ENOTDIR: &str = "not a directory";
    pub const ENOWSTAT: &str = "wstat prohibited";
    pub const EPERM: &str = "permission denied";
    pub const ENOREMOVE: &str = "remove prohibited";
    pub const ENOSTAT: &str = "stat prohibited";
    pub const ENOTFOUND: &str = "file not found";
    pub const ENOWRITE: &str = "write prohibited";
    pub const ENOMEM: &str = "out of memory";
    pub const ENOTIMPL: &str = "not implemented";
    pub const EINVAL: &str = "invalid argument";
    pub const EIO: &str = "i/o error";
}

/// The closed set of error strings this server puts on the wire.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Ename {
    UnknownFid,
    NoAuth,
    BadOffset,
    Botch,
    CreateNonDir,
    DupFid,
    DupTag,
    IsDir,
    NoCreate,
    NotDir,
    NoWstat,
    Perm,
    NoRemove,
    NoStat,
    NotFound,
    NoWrite,
    NoMem,
    NotImpl,
    Inval,
    Io,
}

impl Ename {
    pub fn as_str(&self) -> &'static str {
        use self::string::*;

        match *self {
            Ename::UnknownFid => EUNKNOWNFID,
            Ename::NoAuth => ENOAUTH,
            Ename::BadOffset => EBADOFFSET,
            Ename::Botch => EBOTCH,
            Ename::CreateNonDir => ECREATENONDIR,
            Ename::DupFid => EDUPFID,
            Ename::DupTag => EDUPTAG,
            Ename::IsDir => EISDIR,
            Ename::NoCreate => ENOCREATE,
            Ename::NotDir => ENOTDIR,
            Ename::NoWstat => ENOWSTAT,
            Ename::Perm => EPERM,
            Ename::NoRemove => ENOREMOVE,
            Ename::NoStat => ENOSTAT,
            Ename::NotFound => ENOTFOUND,
            Ename::NoWrite => ENOWRITE,
            Ename::NoMem => ENOMEM,
            Ename::NotImpl => ENOTIMPL,
            Ename::Inval => EINVAL,
            Ename::Io => EIO,
        }
    }
}

impl fmt::Display for Ename {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a host errno onto the 9P2000 vocabulary.
///
/// Anything without a dedicated string becomes `i/o error`.
pub fn map_errno(e: Errno) -> Ename {
    match e {
        ENOENT => Ename::NotFound,
        EPERM | EACCES => Ename::Perm,
        ENOTDIR => Ename::NotDir,
        EISDIR => Ename::IsDir,
        ENOMEM => Ename::NoMem,
        EINVAL => Ename::Inval,
        _ => Ename::Io,
    }
}

fn errno_from_ioerror(e: &io::Error) -> Errno {
    e.raw_os_error()
        .map(Errno::from_raw)
        .unwrap_or(match e.kind() {
            NotFound => ENOENT,
            PermissionDenied => EPERM,
            ConnectionRefused => ECONNREFUSED,
            ConnectionReset => ECONNRESET,
            ConnectionAborted => ECONNABORTED,
            NotConnected => ENOTCONN,
            AddrInUse => EADDRINUSE,
            AddrNotAvailable => EADDRNOTAVAIL,
            BrokenPipe => EPIPE,
            AlreadyExists => EEXIST,
            WouldBlock => EAGAIN,
            InvalidInput => EINVAL,
            InvalidData => EINVAL,
            TimedOut => ETIMEDOUT,
            WriteZero => EAGAIN,
            Interrupted => EINTR,
            OutOfMemory => ENOMEM,
            _ => EIO,
        })
}

/// 9P error type which resolves to one of the [`Ename`] strings.
#[derive(Debug)]
pub enum Error {
    /// Protocol-level error with a fixed 9P2000 string.
    Proto(Ename),
    /// System error containing an errno.
    No(Errno),
    /// I/O error.
    Io(io::Error),
}

impl Error {
    /// Get the 9P2000 error string this error is reported as.
    pub fn ename(&self) -> Ename {
        match *self {
            Error::Proto(ename) => ename,
            Error::No(e) => map_errno(e),
            Error::Io(ref e) => map_errno(errno_from_ioerror(e)),
        }
    }

    /// Get the errno, if this error originated on the host.
    pub fn errno(&self) -> Option<Errno> {
        match *self {
            Error::Proto(_) => None,
            Error::No(e) => Some(e),
            Error::Io(ref e) => Some(errno_from_ioerror(e)),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Proto(ref e) => write!(f, "{}", e),
            Error::No(ref e) => write!(f, "System error: {}", e.desc()),
            Error::Io(ref e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl stderror::Error for Error {
    fn source(&self) -> Option<&(dyn stderror::Error + 'static)> {
        match *self {
            Error::Proto(_) => None,
            Error::No(ref e) => Some(e),
            Error::Io(ref e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<Errno> for Error {
    fn from(e: Errno) -> Self {
        Error::No(e)
    }
}

impl From<Ename> for Error {
    fn from(e: Ename) -> Self {
        Error::Proto(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_errors_map_to_fixed_strings() {
        assert_eq!(map_errno(ENOENT), Ename::NotFound);
        assert_eq!(map_errno(EACCES), Ename::Perm);
        assert_eq!(map_errno(EPERM), Ename::Perm);
        assert_eq!(map_errno(ENOTDIR), Ename::NotDir);
        assert_eq!(map_errno(EISDIR), Ename::IsDir);
        assert_eq!(map_errno(ENOMEM), Ename::NoMem);
        assert_eq!(map_errno(EINVAL), Ename::Inval);
        assert_eq!(map_errno(ENOTEMPTY), Ename::Io);
        assert_eq!(map_errno(EIO), Ename::Io);
    }

    #[test]
    fn io_errors_resolve_through_errno() {
        let e = Error::from(io::Error::from_raw_os_error(ENOENT as i32));
        assert_eq!(e.ename().as_str(), "file not found");

        let e = Error::from(io::Error::new(PermissionDenied, "nope"));
        assert_eq!(e.ename(), Ename::Perm);

        let e = Error::from(io::Error::other("weird"));
        assert_eq!(e.ename(), Ename::Io);
    }

    #[test]
    fn proto_errors_keep_their_string() {
        let e = Error::from(Ename::DupFid);
        assert_eq!(e.ename().as_str(), "duplicate fid");
        assert_eq!(e.errno(), None);
        assert_eq!(e.to_string(), "duplicate fid");
    }
}
