//! Error taxonomy for the store adapter (spec §4.2, §7).
//!
//! The control API needs to tell a lookup miss from a backend failure; the
//! proxy data path never lets an internal failure reach the client (§7
//! "Propagation policy") and logs via `anyhow::Context` at each fallible
//! step instead, so there is no matching enum over there to match on.

use thiserror::Error;

/// Errors surfaced by the store adapter (§4.2).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Lookup miss: unknown request id, or `ListRequests` over an empty store.
    #[error("not found")]
    NotFound,

    /// Any transport/backend failure talking to the relational store.
    #[error("store backend error: {0}")]
    Backend(#[from] sqlx::Error),
}
