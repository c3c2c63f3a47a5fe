//! The Ianus server library. This implements the authorisation request engine
//! of the identity provider: everything between an inbound `/authorize` (or
//! `/device_authorization`) request and the decision that answers it, be that
//! a redirect carrying issued credentials, a redirect to an interactive step,
//! or a structured error.
//!
//! Persistence, cryptographic primitives, policy scripts and the HTTP
//! transport are collaborators behind traits - see [`store`] and [`external`].

#![recursion_limit = "512"]
#![warn(unused_extern_crates)]
// Enable some groups of clippy lints.
#![deny(clippy::suspicious)]
#![deny(clippy::perf)]
// Specific lints to enforce.
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::trivially_copy_pass_by_ref)]
#![deny(clippy::manual_let_else)]
#![allow(clippy::unreachable)]

#[macro_use]
extern crate tracing;
#[macro_use]
extern crate lazy_static;

pub mod audit;
pub mod authz;
pub mod config;
pub mod external;
pub mod prelude;
pub mod store;

#[cfg(any(test, feature = "test"))]
pub mod testkit;
