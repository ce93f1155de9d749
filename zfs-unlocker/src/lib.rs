//! Automated unlocking of remote encrypted ZFS root filesystems.
//!
//! A server with an encrypted root pool boots into an initramfs that asks for
//! a passphrase over ssh before the real system can come up. This crate keeps
//! watch over such servers: it drives an interactive ssh client as a child
//! process, frames its output into bursts, classifies what the remote side is
//! showing (the initramfs unlock prompt, a regular shell, or noise), answers
//! the prompt with the passphrase, and then holds the session open so the next
//! reboot is noticed immediately. Connections are retried forever, rotating
//! through endpoint alternatives, until the process is told to stop.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use secrecy::SecretString;
//! use zfs_unlocker::destination::{Defaults, TargetGroup};
//! use zfs_unlocker::machine::MachineConfig;
//! use zfs_unlocker::orchestrator::Orchestrator;
//!
//! #[tokio::main]
//! async fn main() -> zfs_unlocker::Result<()> {
//!     let defaults = Defaults { user: Some("root".to_string()) };
//!     let group = TargetGroup::from_strings(["server.lan", "10.0.0.5:2222"], &defaults)?;
//!     let passphrase = Arc::new(SecretString::from("correct horse".to_string()));
//!     Orchestrator::new(MachineConfig::default(), passphrase)
//!         .run(vec![group])
//!         .await
//! }
//! ```

pub mod console;
pub mod destination;
pub mod error;
pub mod framing;
pub mod machine;
pub mod orchestrator;
pub mod probe;
pub mod process;
pub mod prompt;

pub use error::{Error, Result};
pub use machine::{MachineConfig, SessionMachine};
pub use orchestrator::Orchestrator;
