//! # rsup - CVSup checkout-mode client
//!
//! rsup synchronizes local checkout trees against a CVSup server.  One
//! TCP connection is multiplexed into two flow-controlled channels and
//! three concurrent workers stream per-collection state across them:
//! the lister reports what the client holds, the detailer turns the
//! server's proposals into precise delta requests, and the updater
//! applies the responses and rewrites the per-collection status files.
//!
//! ```rust,ignore
//! use rsup::{config, session};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let over = config::Overrides::default();
//!     let cfg = config::load("rsup.toml".as_ref(), &over)?;
//!     session::run(cfg).await
//! }
//! ```

#![deny(unsafe_code)]

pub mod config;
pub mod detailer;
pub mod error;
pub mod fattr;
pub mod fixups;
pub mod lister;
pub mod logging;
pub mod mux;
pub mod pathcomp;
pub mod proto;
pub mod rcs;
pub mod rsyncsum;
pub mod session;
pub mod status;
pub mod stream;
pub mod updater;
pub mod util;

pub use error::{MuxError, RcsError, StatusError, WorkerError};
pub use fattr::Fattr;
pub use status::{Status, StatusRec};

// vim: ts=4
