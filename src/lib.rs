// Library exports for the CLI and integration tests

pub mod chunk_store;
pub mod chunking;
pub mod codec;
pub mod config;
pub mod import;
pub mod playback;
pub mod session;
pub mod transcript;

// Test support (unit tests, and integration tests via the test-utils feature)
#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;
