//! ReproHub session core.
//!
//! Authorizes users by organization membership, prepares their workspace,
//! checks out the requested artifact once and reclaims it when the session
//! stops.

pub mod artifacts;
pub mod auth;
pub mod config;
pub mod container;
pub mod materializer;
pub mod session;
pub mod validate;
pub mod workspace;
