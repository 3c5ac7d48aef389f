//! Admin HTTP surface of an OrcaNet node.
//!
//! The web client drives the node through these routes: advertise a local
//! file, list the providers of a CID with their metadata, and fetch a file
//! from a chosen peer.

mod files;
mod server;

#[cfg(test)]
mod files_tests;

pub use files::{AdvertiseParams, AdvertiseResponse, FileTransferParams, ProvidersParams};
pub use server::{bind_listener, serve, AppState};
