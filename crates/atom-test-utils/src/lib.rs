// atom-test-utils: Shared test utilities for the Atom suite.
//
// Provides an in-process Redis-compatible server so integration tests run
// hermetically, one isolated server per test.

pub mod mock_redis;

pub use mock_redis::MockRedisServer;
