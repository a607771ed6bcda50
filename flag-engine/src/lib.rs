pub mod admin;
pub mod api;
pub mod audit;
pub mod cache;
pub mod config;
pub mod flags;
pub mod metrics;
pub mod registry;
pub mod rollout;
pub mod router;
pub mod server;
pub mod store;

// Test modules don't need to be compiled with main binary
// #[cfg(test)]
// TODO: To use in integration tests, we need to compile with binary
// or make it a separate feature using cfg(feature = "integration-tests")
// and then use this feature only in tests.
// For now, ok to just include in binary
pub mod test_utils;
