//! weft device agent library
//!
//! The on-device agent bridging a cloud device-management service with
//! the local Privet HTTP API: device enrollment and session lifecycle,
//! the command pipeline, state upload, and local pairing/authentication.
//! The host embeds this crate and supplies transport, storage, and radio
//! integrations through the traits in [`providers`].

pub mod cloud;
pub mod commands;
pub mod error;
pub mod logging;
pub mod privet;
pub mod providers;
pub mod security;
pub mod settings;
pub mod state;

pub use error::{Error, Result};
