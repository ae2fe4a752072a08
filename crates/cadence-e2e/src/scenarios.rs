//! Multi-replica scenarios
//!
//! Each test builds a [`DeterministicTest`](crate::DeterministicTest), runs it
//! to a stop condition and checks the replicas' counters and ledgers.
