//! AXON Common Library
//!
//! This crate provides shared constants and configuration loading utilities
//! for all AXON workspace crates.
//!
//! # Module Structure
//!
//! - [`consts`] - IPC layout and timing constants
//! - [`config`] - Configuration loading traits and types
//! - [`role`] - Process roles for the two-process topology
//! - [`type_ids`] - Centralized, append-only message type-id registry
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! axon = { package = "axon_common", path = "../axon_common" }
//! ```
//!
//! Then import through the alias:
//! ```rust,ignore
//! use axon::consts::*;
//! use axon::config::{ConfigLoader, IpcSettings};
//! ```

pub mod config;
pub mod consts;
pub mod role;
pub mod type_ids;

pub use role::ProcessRole;
