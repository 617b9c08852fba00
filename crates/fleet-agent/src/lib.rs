//! The fleet agent's control loop.
//!
//! Requests from the control plane go through the [`ActionDispatcher`],
//! which runs actions inline or as tasks on the [`AsyncTaskService`].
//! Persistent tasks are recorded by a [`TaskManager`] so they can be resumed
//! after a restart. The [`Agent`] ties the dispatcher to the message bus and
//! reports health.

pub mod action;
pub mod agent;
pub mod config;
pub mod disks;
pub mod dispatcher;
pub mod heartbeat;
pub mod spec_service;
pub mod supervisor;
pub mod task;

pub use action::{
    Action, ActionFactory, ActionRunner, ConcreteActionRunner, DefaultActionFactory,
};
pub use agent::{Agent, HeartbeatSettings};
pub use config::AgentConfig;
pub use disks::{DiskInventory, DiskReport};
pub use dispatcher::ActionDispatcher;
pub use heartbeat::HeartbeatGenerator;
pub use spec_service::FileSpecService;
pub use supervisor::UnmonitoredJobSupervisor;
pub use task::{
    AsyncTaskService, FileTaskManager, InMemoryTaskManager, Task, TaskInfo, TaskManager,
    TaskState,
};
