//! Gateway library for Kabin.
//!
//! Northbound HTTP: kiosk provisioning and heartbeats, the durable command
//! bus kiosks poll, the staff command API, locker read models, and health.
//! All domain logic lives in `kabin-core`; this crate is routing, auth
//! middleware, error mapping, and the background sweep loop.

pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod workers;
