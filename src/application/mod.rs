//! Application layer - workflows built from bulk batches.
//!
//! Sequencing between batches lives here; the executor only runs one batch
//! at a time and knows nothing about what the caller does with the results.

mod roundtrip;

pub use roundtrip::{DEFAULT_CONCURRENCY, RoundTripOptions, RoundTripSummary, round_trip};
