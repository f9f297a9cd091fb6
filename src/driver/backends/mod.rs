//! Engine backends.

pub mod memory;
#[cfg(feature = "mongodb")]
pub mod mongodb;
#[cfg(feature = "mysql")]
pub mod mysql;
pub mod postgres;
#[cfg(feature = "spanner")]
pub mod spanner;
