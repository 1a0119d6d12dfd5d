//! Replicated inventory and policy registry.
//!
//! A cluster of registry instances keeps a hierarchical namespace of nodes,
//! typed resource collections attached to those nodes, and the users and
//! groups that are allowed to touch them. Writes are serialised by a raft
//! leader; reads are served from the local bucket store of any instance.
//!
//! The crate is layered bottom-up:
//!
//! ```text
//! transport -> store (redb + openraft) -> cluster (forwarding facade)
//!                 |                              |
//!               cache                  KeyValueStore trait
//!                                                |
//!        tree -> model (resources, machines, dashboards) -> dns
//!                  auth, report
//! ```
//!
//! [`node::RegistryNode`] composes everything into a running daemon.

pub mod auth;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod constants;
pub mod dns;
pub mod error;
pub mod model;
pub mod node;
pub mod report;
pub mod resource;
pub mod store;
pub mod transport;
pub mod tree;

pub use error::ApiResponse;
pub use error::RegistryError;
pub use error::Result;
pub use store::KeyValueStore;
