pub mod harness;
pub mod logging;
pub mod mock_runtime;
pub mod mock_starter;
pub mod wait_utils;
