//! Integration tests for the template project harness
//!
//! Projects are scaffolded from a temporary template and "launched" as an
//! in-process fake service, so the full lifecycle runs without a .NET
//! toolchain or a cloud subscription.

pub mod infrastructure;
pub mod scenarios;

pub use infrastructure::{FakeControlPlane, FakeService, InMemoryBroker, TestWorkspace};
