//! 9P protocol data types and constants.
//!
//! # Protocol
//! 9P2000

use std::fs;
use std::mem::{size_of, size_of_val};
use std::os::unix::fs::MetadataExt;

use bitflags::bitflags;
use enum_primitive::*;

use crate::error::Ename;

/// 9P2000 version string
pub const P92000: &str = "9P2000";

/// The version string that comes with RVersion when the server does not understand
/// the client's version string
pub const VERSION_UNKNOWN: &str = "unknown";

/*
 * 9P magic numbers
 */
/// Special tag which `TVersion`/`RVersion` must use as `tag`
pub const NOTAG: u16 = !0;

/// Special value which `TAttach` with no auth must use as `afid`
///
/// If the client does not wish to authenticate the connection, or knows that authentication is
/// not required, the afid field in the attach message should be set to `NOFID`
pub const NOFID: u32 = !0;

/// Default and largest message size the server offers
pub const MAXMSG: u32 = 8192;

/// Smallest message size a client may negotiate
pub const MINMSG: u32 = 256;

/// Ample room for `TWrite`/`RRead` header
///
/// size[4] TRead/TWrite[2] tag[2] fid[4] offset[8] count[4]
pub const IOHDRSZ: u32 = 24;

/// size[4] type[1] tag[2]
pub const HEADERSZ: u32 = 7;

/// Maximum number of elements in `TWalk`/`RWalk`
pub const MAXWELEM: usize = 16;

/// Maximum length of any string on the wire
pub const MAXSTRLEN: usize = 255;

/// The type of I/O
///
/// Open mode to be checked against the permissions for the file.
pub mod om {
    /// Open for read
    pub const READ: u8 = 0;
    /// Write
    pub const WRITE: u8 = 1;
    /// Read and write
    pub const RDWR: u8 = 2;
    /// Execute, == read but check execute permission
    pub const EXEC: u8 = 3;
    /// Or'ed in (except for exec), truncate file first
    pub const TRUNC: u8 = 16;
    /// Or'ed in, close on exec
    pub const CEXEC: u8 = 32;
    /// Or'ed in, remove on close
    pub const RCLOSE: u8 = 64;

    /// The 2-bit I/O direction of a mode
    pub fn access(mode: u8) -> u8 {
        mode & 3
    }

    /// If the mode permits reading
    pub fn readable(mode: u8) -> bool {
        access(mode) != WRITE
    }

    /// If the mode permits writing
    pub fn writable(mode: u8) -> bool {
        matches!(access(mode), WRITE | RDWR)
    }
}

/// Bits in Stat.mode
pub mod dm {
    /// Mode bit for directories
    pub const DIR: u32 = 0x80000000;
    /// Mode bit for append only files
    pub const APPEND: u32 = 0x40000000;
    /// Mode bit for exclusive use files
    pub const EXCL: u32 = 0x20000000;
    /// Mode bit for mounted channel
    pub const MOUNT: u32 = 0x10000000;
    /// Mode bit for authentication file
    pub const AUTH: u32 = 0x08000000;
    /// Mode bit for non-backed-up files
    pub const TMP: u32 = 0x04000000;
    /// Permission bits
    pub const PERM: u32 = 0o777;
}

bitflags! {
    /// Bits in QId.typ
    ///
    /// QIdType can be constructed from std::fs::FileType via From trait
    ///
    /// # Protocol
    /// 9P2000
    #[derive(Copy, Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord)]
    pub struct QIdType: u8 {
        #[doc = "Type bit for directories"]
        const DIR       = 0x80;
        #[doc = "Type bit for append only files"]
        const APPEND    = 0x40;
        #[doc = "Type bit for exclusive use files"]
        const EXCL      = 0x20;
        #[doc = "Type bit for mounted channel"]
        const MOUNT     = 0x10;
        #[doc = "Type bit for authentication file"]
        const AUTH      = 0x08;
        #[doc = "Type bit for not-backed-up file"]
        const TMP       = 0x04;
        #[doc = "Plain file"]
        const FILE      = 0x00;
    }
}

impl From<::std::fs::FileType> for QIdType {
    fn from(typ: ::std::fs::FileType) -> Self {
        From::from(&typ)
    }
}

impl<'a> From<&'a ::std::fs::FileType> for QIdType {
    fn from(typ: &'a ::std::fs::FileType) -> Self {
        if typ.is_dir() {
            QIdType::DIR
        } else {
            QIdType::FILE
        }
    }
}

/// Server side data type for path tracking
///
/// The server's unique identification for the file being accessed
///
/// # Protocol
/// 9P2000
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct QId {
    /// Specify whether the file is a directory, append-only file, etc.
    pub typ: QIdType,
    /// Version number for a file; the host modification time
    pub version: u32,
    /// An integer which is unique among all files in the hierarchy; the host inode
    pub path: u64,
}

impl QId {
    pub fn size(&self) -> u32 {
        (size_of::<QIdType>() + size_of::<u32>() + size_of::<u64>()) as u32
    }
}

impl From<&fs::Metadata> for QId {
    fn from(attr: &fs::Metadata) -> Self {
        QId {
            typ: From::from(attr.file_type()),
            version: attr.mtime() as u32,
            path: attr.ino(),
        }
    }
}

/// Plan 9 Namespace metadata (somewhat like a unix fstat)
///
/// The record is self-describing on the wire: a `size[2]` prefix counting the
/// bytes that follow it, the fixed fields, then four strings.
///
/// NOTE: Defined as `Dir` in libc.h of Plan 9
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Stat {
    /// Server type
    pub typ: u16,
    /// Server subtype
    pub dev: u32,
    /// Unique id from server
    pub qid: QId,
    /// Permissions
    pub mode: u32,
    /// Last read time
    pub atime: u32,
    /// Last write time
    pub mtime: u32,
    /// File length
    pub length: u64,
    /// Last element of path
    pub name: String,
    /// Owner name
    pub uid: String,
    /// Group name
    pub gid: String,
    /// Last modifier name
    pub muid: String,
}

/// Owner, group and last-modifier reported while no identity system is wired in
pub const NOUSER: &str = "none";

impl Stat {
    /// Build the stat record of a host file.
    pub fn from_attr(name: &str, attr: &fs::Metadata) -> Stat {
        let mut mode = attr.mode() & dm::PERM;
        if attr.is_dir() {
            mode |= dm::DIR;
        }

        Stat {
            typ: 0,
            dev: 0,
            qid: From::from(attr),
            mode,
            atime: attr.atime() as u32,
            mtime: attr.mtime() as u32,
            length: attr.size(),
            name: name.to_owned(),
            uid: NOUSER.to_owned(),
            gid: NOUSER.to_owned(),
            muid: NOUSER.to_owned(),
        }
    }

    /// A record with every field set to "don't touch", the base of a `TWStat`
    pub fn dont_touch() -> Stat {
        Stat {
            typ: !0,
            dev: !0,
            qid: QId {
                typ: QIdType::from_bits_retain(!0),
                version: !0,
                path: !0,
            },
            mode: !0,
            atime: !0,
            mtime: !0,
            length: !0,
            name: String::new(),
            uid: String::new(),
            gid: String::new(),
            muid: String::new(),
        }
    }

    /// Get the current size of the stat, not counting its own size prefix
    pub fn size(&self) -> u16 {
        (size_of_val(&self.typ)
            + size_of_val(&self.dev)
            + self.qid.size() as usize
            + size_of_val(&self.mode)
            + size_of_val(&self.atime)
            + size_of_val(&self.mtime)
            + size_of_val(&self.length)
            + (size_of::<u16>() * 4)
            + self.name.len()
            + self.uid.len()
            + self.gid.len()
            + self.muid.len()) as u16
    }
}

/// Data type used in `RRead` and `TWrite`
///
/// # Protocol
/// 9P2000
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Data(pub Vec<u8>);

enum_from_primitive! {
    #[doc = "Message type, 9P operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgType {
        TVersion        = 100,
        RVersion,
        TAuth           = 102,
        RAuth,
        TAttach         = 104,
        RAttach,
        TError          = 106,  // Illegal, never used
        RError,
        TFlush          = 108,
        RFlush,
        TWalk           = 110,
        RWalk,
        TOpen           = 112,
        ROpen,
        TCreate         = 114,
        RCreate,
        TRead           = 116,
        RRead,
        TWrite          = 118,
        RWrite,
        TClunk          = 120,
        RClunk,
        TRemove         = 122,
        RRemove,
        TStat           = 124,
        RStat,
        TWStat          = 126,
        RWStat,
    }
}

impl MsgType {
    /// If the message type is T-message
    pub fn is_t(&self) -> bool {
        !self.is_r()
    }

    /// If the message type is R-message
    pub fn is_r(&self) -> bool {
        (*self as u8) % 2 == 1
    }
}

impl<'a> From<&'a FCall> for MsgType {
    fn from(fcall: &'a FCall) -> MsgType {
        match *fcall {
            FCall::TVersion { .. } => MsgType::TVersion,
            FCall::RVersion { .. } => MsgType::RVersion,
            FCall::TAuth { .. } => MsgType::TAuth,
            FCall::RAuth { .. } => MsgType::RAuth,
            FCall::TAttach { .. } => MsgType::TAttach,
            FCall::RAttach { .. } => MsgType::RAttach,
            FCall::RError { .. } => MsgType::RError,
            FCall::TFlush { .. } => MsgType::TFlush,
            FCall::RFlush => MsgType::RFlush,
            FCall::TWalk { .. } => MsgType::TWalk,
            FCall::RWalk { .. } => MsgType::RWalk,
            FCall::TOpen { .. } => MsgType::TOpen,
            FCall::ROpen { .. } => MsgType::ROpen,
            FCall::TCreate { .. } => MsgType::TCreate,
            FCall::RCreate { .. } => MsgType::RCreate,
            FCall::TRead { .. } => MsgType::TRead,
            FCall::RRead { .. } => MsgType::RRead,
            FCall::TWrite { .. } => MsgType::TWrite,
            FCall::RWrite { .. } => MsgType::RWrite,
            FCall::TClunk { .. } => MsgType::TClunk,
            FCall::RClunk => MsgType::RClunk,
            FCall::TRemove { .. } => MsgType::TRemove,
            FCall::RRemove => MsgType::RRemove,
            FCall::TStat { .. } => MsgType::TStat,
            FCall::RStat { .. } => MsgType::RStat,
            FCall::TWStat { .. } => MsgType::TWStat,
            FCall::RWStat => MsgType::RWStat,
        }
    }
}

/// A data type encapsulating the various 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FCall {
    TVersion {
        msize: u32,
        version: String,
    },
    RVersion {
        msize: u32,
        version: String,
    },
    TAuth {
        afid: u32,
        uname: String,
        aname: String,
    },
    RAuth {
        aqid: QId,
    },
    TAttach {
        fid: u32,
        afid: u32,
        uname: String,
        aname: String,
    },
    RAttach {
        qid: QId,
    },
    RError {
        ename: String,
    },
    TFlush {
        oldtag: u16,
    },
    RFlush,
    TWalk {
        fid: u32,
        newfid: u32,
        wnames: Vec<String>,
    },
    RWalk {
        wqids: Vec<QId>,
    },
    TOpen {
        fid: u32,
        mode: u8,
    },
    ROpen {
        qid: QId,
        iounit: u32,
    },
    TCreate {
        fid: u32,
        name: String,
        perm: u32,
        mode: u8,
    },
    RCreate {
        qid: QId,
        iounit: u32,
    },
    TRead {
        fid: u32,
        offset: u64,
        count: u32,
    },
    RRead {
        data: Data,
    },
    TWrite {
        fid: u32,
        offset: u64,
        data: Data,
    },
    RWrite {
        count: u32,
    },
    TClunk {
        fid: u32,
    },
    RClunk,
    TRemove {
        fid: u32,
    },
    RRemove,
    TStat {
        fid: u32,
    },
    RStat {
        stat: Stat,
    },
    TWStat {
        fid: u32,
        stat: Stat,
    },
    RWStat,
}

/// Size of a string field on the wire
fn str_size(s: &str) -> u32 {
    (size_of::<u16>() + s.len()) as u32
}

/// Size of a stat field on the wire: nstat[2] followed by the record with its own size[2]
fn stat_size(stat: &Stat) -> u32 {
    (size_of::<u16>() * 2) as u32 + stat.size() as u32
}

impl FCall {
    /// Build an `RError` carrying `ename`, truncated to the protocol's maximum string length
    pub fn rerror<E: AsRef<str>>(ename: E) -> FCall {
        let ename = ename.as_ref();
        let mut end = ename.len().min(MAXSTRLEN);
        while !ename.is_char_boundary(end) {
            end -= 1;
        }
        FCall::RError {
            ename: ename[..end].to_owned(),
        }
    }

    /// Get the size of the body on the wire, without the 7-byte header
    pub fn size(&self) -> u32 {
        use crate::FCall::*;

        let qid = QId::default().size();
        match *self {
            TVersion { ref version, .. } | RVersion { ref version, .. } => 4 + str_size(version),
            TAuth { ref uname, ref aname, .. } => 4 + str_size(uname) + str_size(aname),
            RAuth { .. } => qid,
            TAttach { ref uname, ref aname, .. } => 4 + 4 + str_size(uname) + str_size(aname),
            RAttach { .. } => qid,
            RError { ref ename } => str_size(ename),
            TFlush { .. } => 2,
            RFlush => 0,
            TWalk { ref wnames, .. } => 4 + 4 + 2 + wnames.iter().map(|s| str_size(s)).sum::<u32>(),
            RWalk { ref wqids } => 2 + qid * wqids.len() as u32,
            TOpen { .. } => 4 + 1,
            ROpen { .. } | RCreate { .. } => qid + 4,
            TCreate { ref name, .. } => 4 + str_size(name) + 4 + 1,
            TRead { .. } => 4 + 8 + 4,
            RRead { ref data } => 4 + data.0.len() as u32,
            TWrite { ref data, .. } => 4 + 8 + 4 + data.0.len() as u32,
            RWrite { .. } => 4,
            TClunk { .. } | TRemove { .. } | TStat { .. } => 4,
            RClunk | RRemove | RWStat => 0,
            RStat { ref stat } => stat_size(stat),
            TWStat { ref stat, .. } => 4 + stat_size(stat),
        }
    }
}

impl From<Ename> for FCall {
    fn from(ename: Ename) -> FCall {
        FCall::rerror(ename.as_str())
    }
}

/// Envelope for 9P messages
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Msg {
    /// Chosen and used by the client to identify the message.
    /// The reply to the message will have the same tag
    pub tag: u16,
    /// Message body encapsulating the various 9P messages
    pub body: FCall,
}

impl Msg {
    /// Get the size of the whole frame, size prefix included
    pub fn size(&self) -> u32 {
        HEADERSZ + self.body.size()
    }
}
