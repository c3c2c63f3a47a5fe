//! Ianus protocol definitions. These types cross the HTTP boundary of the
//! authorisation server and are shared between the server implementation and
//! any client tooling. Almost everything here is a serde type.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![warn(unused_extern_crates)]

pub mod constants;
pub mod internal;
pub mod oauth2;
