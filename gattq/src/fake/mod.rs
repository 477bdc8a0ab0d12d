//! An in-memory transport for tests and demos.

pub mod transport;

pub use transport::{FakeTransport, Submission};
