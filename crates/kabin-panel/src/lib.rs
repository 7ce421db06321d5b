//! Staff panel backend for Kabin.
//!
//! Read models over lockers and kiosks, bulk operations, VIP contract
//! CRUD, and audit queries. Staff authentication is a collaborator — this
//! crate trusts the identity header and audits every operation under it.

pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
