//! Kiosk agent library for Kabin.
//!
//! One process per physical kiosk. Owns the RS-485 serial port through the
//! driver actor, runs the RFID and QR user flows against the shared core,
//! and polls the gateway for staff commands. The binary in `main.rs` wires
//! these pieces together.

pub mod bus;
pub mod config;
pub mod driver;
pub mod error;
pub mod exec;
pub mod flows;
pub mod http;
pub mod modbus;
pub mod poller;
pub mod state;
