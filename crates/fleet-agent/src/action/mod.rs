//! Actions the control plane can invoke, and how they are looked up and run.

mod builtin;

pub use builtin::{CancelTaskAction, GetStateAction, GetTaskAction, PingAction};

use async_trait::async_trait;
use fleet_core::message::{ProtocolVersion, arguments_from_payload};
use fleet_core::ports::{JobSupervisor, SpecService};
use fleet_core::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::debug;

use crate::task::AsyncTaskService;

/// A named operation the agent performs on request.
#[async_trait]
pub trait Action: Send + Sync {
    /// Whether requests at this protocol version run as a background task.
    fn is_asynchronous(&self, version: ProtocolVersion) -> bool;

    /// Whether a background run must survive an agent restart.
    fn is_persistent(&self) -> bool;

    /// Whether request payloads may be written to the log.
    fn is_loggable(&self) -> bool;

    async fn run(&self, payload: &[u8], version: ProtocolVersion) -> Result<Value>;

    /// Continue a persisted run after a restart.
    async fn resume(&self, _payload: &[u8]) -> Result<Value> {
        Err(Error::Other("Resume not supported".to_string()))
    }

    /// Ask an in-flight run to stop.
    fn cancel(&self) -> Result<()> {
        Err(Error::Other("Cancel not supported".to_string()))
    }
}

/// Looks up actions by method name.
pub trait ActionFactory: Send + Sync {
    fn create(&self, method: &str) -> Result<Arc<dyn Action>>;
}

/// Runs actions on behalf of the dispatcher.
#[async_trait]
pub trait ActionRunner: Send + Sync {
    async fn run(&self, action: Arc<dyn Action>, payload: &[u8], version: ProtocolVersion) -> Result<Value>;

    async fn resume(&self, action: Arc<dyn Action>, payload: &[u8]) -> Result<Value>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ConcreteActionRunner;

#[async_trait]
impl ActionRunner for ConcreteActionRunner {
    async fn run(&self, action: Arc<dyn Action>, payload: &[u8], version: ProtocolVersion) -> Result<Value> {
        let started = Instant::now();
        let result = action.run(payload, version).await;
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, ok = result.is_ok(), "Action run finished");
        result
    }

    async fn resume(&self, action: Arc<dyn Action>, payload: &[u8]) -> Result<Value> {
        let started = Instant::now();
        let result = action.resume(payload).await;
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, ok = result.is_ok(), "Action resume finished");
        result
    }
}

/// Name-to-action registry, preloaded with the built-in actions.
pub struct DefaultActionFactory {
    actions: RwLock<HashMap<String, Arc<dyn Action>>>,
}

impl DefaultActionFactory {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            actions: RwLock::new(HashMap::new()),
        }
    }

    /// A registry holding `ping`, `get_task`, `cancel_task` and `get_state`.
    pub fn new(
        agent_id: impl Into<String>,
        task_service: AsyncTaskService,
        supervisor: Arc<dyn JobSupervisor>,
        spec_service: Arc<dyn SpecService>,
    ) -> Self {
        let factory = Self::empty();
        factory.register("ping", Arc::new(PingAction));
        factory.register("get_task", Arc::new(GetTaskAction::new(task_service.clone())));
        factory.register("cancel_task", Arc::new(CancelTaskAction::new(task_service)));
        factory.register(
            "get_state",
            Arc::new(GetStateAction::new(agent_id, supervisor, spec_service)),
        );
        factory
    }

    /// Add or replace an action.
    pub fn register(&self, name: impl Into<String>, action: Arc<dyn Action>) {
        self.actions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(name.into(), action);
    }
}

impl ActionFactory for DefaultActionFactory {
    fn create(&self, method: &str) -> Result<Arc<dyn Action>> {
        self.actions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(method)
            .cloned()
            .ok_or_else(|| Error::UnknownAction(method.to_string()))
    }
}

/// First positional argument as a string.
pub(crate) fn string_argument(payload: &[u8]) -> Result<String> {
    match arguments_from_payload(payload)?.into_iter().next() {
        Some(Value::String(s)) => Ok(s),
        Some(other) => Err(Error::Serialization(format!("Expected string argument, got {}", other))),
        None => Err(Error::Serialization("Not enough arguments".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::fakes::{FakeJobSupervisor, FakeSpecService};
    use fleet_core::ports::JobSpec;

    fn factory() -> DefaultActionFactory {
        DefaultActionFactory::new(
            "fake-agent-id",
            AsyncTaskService::default(),
            FakeJobSupervisor::new("running"),
            FakeSpecService::new(JobSpec::default()),
        )
    }

    #[test]
    fn test_builtins_are_registered() {
        let factory = factory();
        for name in ["ping", "get_task", "cancel_task", "get_state"] {
            assert!(factory.create(name).is_ok(), "{} missing", name);
        }
    }

    #[test]
    fn test_unknown_method() {
        let err = factory().create("fake-action").err().unwrap();
        assert!(matches!(err, Error::UnknownAction(ref m) if m == "fake-action"));
    }

    #[tokio::test]
    async fn test_registered_action_replaces_builtin() {
        struct Loud;

        #[async_trait]
        impl Action for Loud {
            fn is_asynchronous(&self, _version: ProtocolVersion) -> bool {
                false
            }
            fn is_persistent(&self) -> bool {
                false
            }
            fn is_loggable(&self) -> bool {
                true
            }
            async fn run(&self, _payload: &[u8], _version: ProtocolVersion) -> Result<Value> {
                Ok(Value::String("PONG".to_string()))
            }
        }

        let factory = factory();
        factory.register("ping", Arc::new(Loud));

        let action = factory.create("ping").unwrap();
        let value = ConcreteActionRunner
            .run(action, b"{}", ProtocolVersion::default())
            .await
            .unwrap();
        assert_eq!(value, Value::String("PONG".to_string()));
    }

    #[test]
    fn test_string_argument() {
        assert_eq!(string_argument(br#"{"arguments":["t-1"]}"#).unwrap(), "t-1");
        assert!(string_argument(br#"{"arguments":[]}"#).is_err());
        assert!(string_argument(br#"{"arguments":[3]}"#).is_err());
    }
}
