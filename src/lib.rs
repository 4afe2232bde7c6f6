//! The _p11bridge_ library crate.
//!
//! Loads PKCS#11 libraries, hands out validated opaque handles for them and
//! their slots, and drives the session open, login, logout and close
//! protocol on top. The operations meant for a host are in [`api`].

pub mod api;
pub mod cli;
pub mod config;
pub mod constants;
pub mod error;
pub mod handle;
#[cfg(any(test, feature = "mock"))]
#[doc(hidden)]
pub mod mock;
pub mod pkcs11;
