//! Packet filter transport
//!
//! The converger only ever talks to the kernel through [`PacketFilter`]:
//! read one table back, or commit one JSON batch atomically. Two
//! implementations exist:
//!
//! - [`NftFilter`] drives the `nft` binary
//! - [`MemoryFilter`] interprets batches in-process (tests, dry runs)

mod memory;
mod nft;

pub use memory::MemoryFilter;
pub use nft::{NFT_COMMAND_ENV, NftFilter, parse_nft_errors};

use crate::core::error::Result;
use crate::core::firewall::TableFamily;
use crate::core::observed::ObservedTable;
use async_trait::async_trait;
use serde_json::Value;

/// Result of a batch verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResult {
    pub success: bool,
    pub errors: Vec<String>,
}

impl VerifyResult {
    pub fn success() -> Self {
        Self {
            success: true,
            errors: Vec::new(),
        }
    }

    pub fn failure(errors: Vec<String>) -> Self {
        Self {
            success: false,
            errors,
        }
    }
}

#[async_trait]
pub trait PacketFilter: Send + Sync {
    /// Reads one table back. `Ok(None)` if the table does not exist.
    async fn fetch(&self, family: TableFamily, table: &str) -> Result<Option<ObservedTable>>;

    /// Commits a `{"nftables": [...]}` batch atomically: either every
    /// command takes effect or none does.
    async fn apply(&self, batch: &Value) -> Result<()>;

    /// Dry-runs a batch against the current state without committing it.
    async fn check(&self, batch: &Value) -> Result<VerifyResult>;
}
