//! # Builders
//!
//! Builders for the Bitcoin structures a round produces: taproot addresses,
//! tapscripts and transactions with their spending metadata.

pub mod address;
pub mod script;
pub mod transaction;
