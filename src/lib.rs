//! Node of a distributed item-approval ledger.
//!
//! Peers submit content-addressed items and the network settles each one
//! through a bounded, per-item vote (an "election"). The crate's center is
//! the decision kernel in [`node`]: it routes every item query to either the
//! durable [`ledger`] of finalized states or a live election, creating
//! elections atomically under races and retiring them once their retention
//! window lapses. [`election`] drives the vote itself, [`network`] abstracts
//! peer addressing and RPC, and [`storage`] persists finalized records.
//!
//! Applications typically depend on [`config::NodeConfig`] to bootstrap a
//! node, [`node::Node`] and [`node::NodeHandle`] to operate it, and
//! [`api::serve`] to expose the HTTP surface.

pub mod api;
pub mod config;
pub mod crypto;
pub mod election;
pub mod errors;
pub mod ledger;
pub mod network;
pub mod node;
pub mod storage;
pub mod types;
