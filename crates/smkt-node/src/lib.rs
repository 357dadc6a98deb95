//! # smkt-node — Local Storage-Market Node
//!
//! Runs a storage provider and a storage client in one process against
//! the in-memory chain, network and sealing collaborators from
//! `smkt-chain` and `smkt-market`.
//!
//! ## Subcommands
//!
//! - `demo` — propose one deal and follow both sides to a terminal state
//! - `ask` — post an ask on the provider and read it back over the network
//!
//! Argument parsing lives here; deal logic stays in `smkt-market`.

pub mod ask;
pub mod demo;
pub mod node;
