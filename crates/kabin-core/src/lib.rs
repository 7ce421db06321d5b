//! Core library for Kabin.
//!
//! Contains the locker state machine and ownership store, the zone resolver
//! and configuration manager, the durable command queue, kiosk heartbeats,
//! VIP contracts, provisioning, the QR token protocol, RFID sessions, the
//! sliding-window rate limiter, and the append-only event log. This crate
//! depends on `kabin-store` for the shared database and knows nothing about
//! HTTP or the serial bus.
//!
//! Managers are constructed explicitly at each process's composition root
//! and shared via `Arc` — there are no global instances.

pub mod audit;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod provisioning;
pub mod qr;
pub mod ratelimit;
pub mod rfid;
pub mod state;
pub mod types;
pub mod vip;
pub mod zone;
