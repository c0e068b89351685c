//! Test utilities for the localcloud workspace
//!
//! Scriptable stand-ins for the container runtime, service starters and
//! provisioner, an orchestrator harness wired to them, and async helpers that
//! wait for alerts and state transitions.

pub mod helpers;

pub use helpers::harness::TestHarness;
pub use helpers::mock_runtime::{MockRuntime, RuntimeCall};
pub use helpers::mock_starter::{MockProvisioner, MockStarter};
pub use helpers::logging::init_test_tracing;
pub use helpers::wait_utils::{wait_for_alert, wait_for_status, wait_for_unhealthy, wait_until, WaitError};
