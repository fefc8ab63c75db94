//! Core library for the meshhub multi-device Meshtastic client
//!
//! This crate discovers radios over serial, TCP and BLE, keeps one session
//! per connected radio, classifies inbound packets into channel and direct
//! message buffers, and persists every message to append-only CSV logs.

pub mod classify;
pub mod client;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod message;
pub mod persist;
pub mod state;
pub mod transport;

// Re-export commonly used types
pub use anyhow::Result;
pub use client::MeshClient;
pub use config::ClientConfig;
pub use connection::{ConnectionManager, ConnectionState, SessionInfo};
pub use dispatch::{Dispatcher, Notification};
pub use error::MeshError;
pub use state::{Message, StateStore};
pub use transport::{TransportKind, TransportRegistry, TransportScanner};

#[cfg(test)]
mod tests;
