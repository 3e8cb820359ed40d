//! rarity-gate: navigation policy daemon
//!
//! Gates outbound navigations against a rarity-scored policy. Blocklisted
//! hosts are refused locally; everything else is allowed at once and scored
//! in the background, producing a warning for the tab if the score is low.
//! Tier state is kept per installation and reconciled with a remote authority.

pub mod api;
pub mod config;
pub mod engine;
pub mod hostlist;
pub mod models;
pub mod policy;
pub mod reconciler;
pub mod remote;
pub mod router;
pub mod store;
