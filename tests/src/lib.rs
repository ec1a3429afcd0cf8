//! Squadron Testing Framework
//!
//! Scriptable agents and fixtures for exercising the orchestration core
//! without real agent backends.

pub mod agent;
pub mod fixtures;

pub use agent::{MockAgent, MockOutcome};
pub use fixtures::{EventLog, fast_config, init_test_logging, register_mock};

/// Assert that an [`EventLog`] has seen at least one event of `kind`.
#[macro_export]
macro_rules! assert_event_emitted {
    ($log:expr, $kind:expr) => {
        let seen = $log.count($kind);
        assert!(
            seen > 0,
            "Expected at least one '{}' event, saw kinds {:?}",
            $kind,
            $log.kinds()
        );
    };
}
