#![forbid(unsafe_code)]
//! 9P2000 file server library for Rust.
//!
//! This crate exports one host directory over the 9P2000 protocol to a single
//! client at a time, over any duplex byte stream: a socket, a character device,
//! or the process's standard input and output.
//!
//! # Overview
//!
//! A request travels through the crate in a fixed order:
//!
//! 1. [`transport::read_frame`] reads one length-prefixed frame
//! 2. [`serialize::decode_msg`] turns it into a [`Msg`]
//! 3. [`srv::Server::handle_message`] runs the handler against the [`fid::FidTable`]
//!    and the host filesystem ([`fs`])
//! 4. [`serialize::encode_msg`] and [`transport::write_frame`] send the response back
//!
//! Requests are handled one at a time; nothing overlaps.
//!
//! # Example
//!
//! ```no_run
//! use simple9p::srv::Server;
//!
//! #[tokio::main]
//! async fn main() -> simple9p::Result<()> {
//!     let mut server = Server::new("/srv/export", false);
//!     server.set_endpoints(tokio::io::stdin(), tokio::io::stdout());
//!     server.run().await
//! }
//! ```
//!
//! # Error Handling
//!
//! Handlers return [`Error`]. Before it reaches the wire every error is folded
//! onto the fixed 9P2000 vocabulary ([`error::Ename`]) and sent as `Rerror`.
//! Host errno values go through [`error::map_errno`]:
//! - `ENOENT` - file not found
//! - `EACCES` / `EPERM` - permission denied
//! - `ENOTDIR` - not a directory
//! - `EISDIR` - is a directory
//! - anything unlisted - i/o error
//!
//! # Transport
//!
//! [`srv::Server::serve`] listens on:
//! - **TCP**: `"tcp!host!port"` (e.g., `"tcp!0.0.0.0!564"`)
//! - **Unix Domain Sockets**: `"unix!path!suffix"` (e.g., `"unix!/tmp/socket!0"`)
//!
//! Any other stream can be attached with [`srv::Server::set_endpoints`].
//! Peers and tests can speak the protocol through [`serialize::Codec`].
pub mod error;
pub mod fcall;
pub mod fid;
pub mod fs;
pub mod serialize;
pub mod session;
pub mod srv;
pub mod transport;
#[macro_use]
pub mod utils;

pub use crate::error::Error;
pub use crate::error::errno;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::utils::Result;
