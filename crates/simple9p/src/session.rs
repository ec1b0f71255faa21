//! Negotiated per-connection parameters.

use crate::{error::Ename, fcall::*, res, utils::Result};

/// Version string and message size agreed with the peer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    max: u32,
    msize: u32,
    version: Option<&'static str>,
    authenticated: bool,
}

impl Session {
    /// A fresh, un-negotiated session whose frames may not exceed `max`
    pub fn new(max: u32) -> Session {
        Session {
            max,
            msize: max,
            version: None,
            authenticated: false,
        }
    }

    /// Map a requested version onto the one this server speaks.
    ///
    /// "9P2000" and any "9P2000.<ext>" negotiate down to plain "9P2000".
    pub fn check_version(version: &str) -> Option<&'static str> {
        match version.strip_prefix(P92000) {
            Some("") => Some(P92000),
            Some(ext) if ext.starts_with('.') => Some(P92000),
            _ => None,
        }
    }

    /// Apply a `TVersion` request, returning the `(msize, version)` to answer with.
    ///
    /// An unrecognized version leaves the session untouched, and so does a
    /// recognized one whose msize is below [`MINMSG`], which is an error.
    pub fn negotiate(&mut self, msize: u32, version: &str) -> Result<(u32, &'static str)> {
        match Session::check_version(version) {
            Some(_) if msize < MINMSG => res!(Ename::Inval),
            Some(v) => {
                self.msize = msize.min(self.max);
                self.version = Some(v);
                self.authenticated = false;
                Ok((self.msize, v))
            }
            None => Ok((self.max, VERSION_UNKNOWN)),
        }
    }

    /// Forget any negotiation, as when a new transport is attached
    pub fn reset(&mut self) {
        *self = Session::new(self.max);
    }

    pub fn is_negotiated(&self) -> bool {
        self.version.is_some()
    }

    pub fn version(&self) -> Option<&'static str> {
        self.version
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Largest frame either side may send
    pub fn msize(&self) -> u32 {
        self.msize
    }

    /// Largest payload of a single read or write
    pub fn iounit(&self) -> u32 {
        self.msize.saturating_sub(IOHDRSZ)
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new(MAXMSG)
    }
}
