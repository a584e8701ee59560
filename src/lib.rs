//! meshwall - multi-cluster ingress firewall
//!
//! Compiles per-cluster ingress policy into declarative nftables specs and
//! keeps the kernel packet filter converged to them.
//!
//! # Architecture
//!
//! - [`core`] - Pure compilation logic: codec, assemblers, diff, evaluation
//! - [`transport`] - Packet filter seam (`nft` binary, in-memory)
//! - [`converger`] - Serialized, cancellable fetch/diff/apply per table
//! - [`store`] - Desired-state store seam (in-memory, JSON files)
//! - [`reconciler`] - Trigger-driven recomputation of every affected target
//! - [`retry`] - Exponential backoff for transport failures
//! - [`audit`] - JSON-lines audit trail of every apply
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Configuration persistence
//! - [`utils`] - Utility functions (XDG directories, atomic writes)
//!
//! # Safety Features
//!
//! - Every plan is applied as one atomic `nft -f` batch
//! - Optional pre-apply verification with `nft --check`
//! - Applies to one table are serialized; stale specs are never applied
//! - Input sanitization and validation before anything reaches `nft`

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod converger;
pub mod core;
pub mod reconciler;
pub mod retry;
pub mod store;
pub mod transport;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use converger::{Converger, ConvergerOptions, Outcome};
pub use core::error::{Error, ErrorKind, Result};
pub use core::firewall::{ClusterId, FirewallSpec, IngressPolicyMode};
pub use reconciler::{Reconciler, ReconcilerOptions, Trigger};
pub use store::{DesiredStateStore, FileStore, MemoryStore};
pub use transport::{MemoryFilter, NftFilter, PacketFilter};
