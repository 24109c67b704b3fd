pub mod batch;
pub mod cdc_types;
pub mod change;
pub mod checkpoints;
pub mod error;
pub mod log_reader;
pub mod postgres;
pub mod protocol;
pub mod provisioning;
pub mod retry;
pub mod sink;
pub mod source;
mod stream_reader;

// The test module should be visible only if test feature is enabled.
// Test feature is disabled by default.
#[cfg(all(test, not(feature = "test")))]
mod test_utilities;

#[cfg(feature = "test")]
pub mod test_utilities;
