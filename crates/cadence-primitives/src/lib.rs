//! # cadence-primitives
//!
//! Primitive types shared by every Cadence crate: content hashes,
//! validator identities and big-integer voting power.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod address;
mod hash;

pub use address::{Address, AddressError};
pub use hash::{Hash, HashError, H256};

// Voting power is an unsigned big integer
pub use primitive_types::U256;

/// Epoch number (validator-set era)
pub type Epoch = u64;

/// Ledger state version (number of commands applied)
pub type StateVersion = u64;
