//! Orchestrator wired to mock collaborators

use std::collections::HashMap;
use std::sync::Arc;

use localcloud_lifecycle::{Orchestrator, OrchestratorBuilder, OrchestratorError, ServiceRegistration};

use super::mock_runtime::MockRuntime;
use super::mock_starter::MockStarter;

/// An [`Orchestrator`] over a [`MockRuntime`], with one [`MockStarter`] per
/// service kind. The system disk check is disabled.
pub struct TestHarness {
    pub runtime: Arc<MockRuntime>,
    pub orchestrator: Orchestrator,
    starters: HashMap<String, Arc<MockStarter>>,
}

impl TestHarness {
    /// Harness with a starter for each of `kinds`; containers are named after the kind.
    pub fn new(kinds: &[&str]) -> Self {
        Self::with_builder(kinds, |builder| builder)
    }

    /// Like [`TestHarness::new`], with a chance to adjust the builder.
    pub fn with_builder<F>(kinds: &[&str], configure: F) -> Self
    where
        F: FnOnce(OrchestratorBuilder) -> OrchestratorBuilder,
    {
        super::logging::init_test_tracing();

        let runtime = Arc::new(MockRuntime::new());
        let mut builder = Orchestrator::builder(runtime.clone()).system_probe(None);
        let mut starters = HashMap::new();
        for kind in kinds {
            let starter = Arc::new(MockStarter::new(kind));
            builder = builder.starter(kind, starter.clone());
            starters.insert(kind.to_string(), starter);
        }

        Self {
            runtime,
            orchestrator: configure(builder).build(),
            starters,
        }
    }

    pub fn register(&self, registration: ServiceRegistration) -> Result<(), OrchestratorError> {
        self.orchestrator.register_service(registration)
    }

    /// Starter registered for `kind`. Panics if there is none.
    pub fn starter(&self, kind: &str) -> Arc<MockStarter> {
        self.starters
            .get(kind)
            .cloned()
            .unwrap_or_else(|| panic!("no mock starter for kind {}", kind))
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        self.orchestrator.shutdown();
    }
}
