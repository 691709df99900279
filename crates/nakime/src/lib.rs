//! # nakime
//!
//! Ephemeral LDAP server fixture for Rust tests.
//!
//! Spawns a directory server as a child process in its own process group,
//! blocks until the child reports that it is listening, and tears the whole
//! group down again on [`Server::stop`], on drop, or when the host is
//! interrupted.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use nakime::{Options, Server};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), nakime::Error> {
//! let descriptor = Options {
//!     port: 0,
//!     quiet: true,
//!     ..Options::default()
//! }
//! .resolve()?;
//!
//! let server = Server::new(descriptor);
//! server.start().await?;
//! println!("ldap://localhost:{}", server.port());
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod blocking;
pub mod config;
pub mod error;
pub mod guard;
pub mod logs;
pub mod output;
pub mod readiness;
pub mod supervisor;
pub mod types;

pub use config::{Options, StartupDescriptor};
pub use error::{ConfigError, Error};
pub use output::OutputCapture;
pub use readiness::{Classifier, LineClass, Sentinels};
pub use supervisor::Server;
pub use types::*;
