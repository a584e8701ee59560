//! Core firewall compilation and reconciliation logic
//!
//! Everything in here is pure: no process spawning, no filesystem access.
//!
//! - [`firewall`]: Data structures for firewall specs (tables, chains, rules, sets)
//! - [`codec`]: Predicate canonicalization and the nftables JSON expression codec
//! - [`address_set`]: Named IPv4 sets and order-independent set comparison
//! - [`naming`]: Resource, table and set naming conventions
//! - [`assemble`]: Per-role spec assemblers (gateway, fabric, isolation)
//! - [`observed`]: Tables as listed back by the packet filter
//! - [`diff`]: Minimal plans converging an observed table to a spec
//! - [`eval`]: Packet-level evaluation of a spec
//! - [`error`]: Error types for firewall operations

pub mod address_set;
pub mod assemble;
pub mod codec;
pub mod diff;
pub mod error;
pub mod eval;
pub mod firewall;
pub mod naming;
pub mod observed;

#[cfg(test)]
pub mod test_helpers;
