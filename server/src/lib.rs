//! Huddle Server - Real-time room chat hub.
//!
//! This crate provides the Huddle chat server, responsible for:
//! - Tracking live WebSocket connections and the rooms they joined
//! - Routing room broadcasts and direct messages
//! - Replaying recent room history to new members
//! - Account registration and token-based login
//!
//! # Architecture
//!
//! A single [`hub::Hub`] owns every connection and room. Each room runs its
//! own fan-out task; each connection runs an inbound and an outbound pump.
//! Delivery is best-effort: slow clients lose messages rather than stall a
//! room. History lives in memory only.

pub mod accounts;
pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod hub;
pub mod pump;
pub mod room;
pub mod routes;
pub mod transport;
pub mod types;
