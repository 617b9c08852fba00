//! Routes inbound requests to actions and runs them inline or as tasks.

use crate::action::{Action, ActionFactory, ActionRunner};
use crate::task::{AsyncTaskService, CancelFunc, EndFunc, RunFunc, Task, TaskInfo, TaskManager};
use fleet_core::message::{ProtocolVersion, Request, Response};
use fleet_core::ports::DispatchFn;
use fleet_core::TaskId;
use futures::FutureExt;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct ActionDispatcher {
    factory: Arc<dyn ActionFactory>,
    runner: Arc<dyn ActionRunner>,
    tasks: AsyncTaskService,
    task_manager: Arc<dyn TaskManager>,
}

impl ActionDispatcher {
    pub fn new(
        factory: Arc<dyn ActionFactory>,
        runner: Arc<dyn ActionRunner>,
        tasks: AsyncTaskService,
        task_manager: Arc<dyn TaskManager>,
    ) -> Self {
        Self {
            factory,
            runner,
            tasks,
            task_manager,
        }
    }

    /// Wrap the dispatcher for the message bus.
    pub fn into_dispatch_fn(self: Arc<Self>) -> DispatchFn {
        Arc::new(move |request| {
            let dispatcher = Arc::clone(&self);
            async move { dispatcher.dispatch(request).await }.boxed()
        })
    }

    pub async fn dispatch(&self, request: Request) -> Response {
        let method = request.method.clone();

        let action = match self.factory.create(&method) {
            Ok(action) => action,
            Err(e) => {
                error!(method = %method, error = %e, "Unknown action");
                return Response::exception(format!("unknown message {}", method));
            }
        };

        if action.is_loggable() {
            debug!(method = %method, payload = %String::from_utf8_lossy(&request.payload), "Dispatching request");
        } else {
            debug!(method = %method, "Dispatching request");
        }

        if action.is_asynchronous(request.protocol_version) {
            self.dispatch_asynchronous(action, request).await
        } else {
            self.dispatch_synchronous(action, request).await
        }
    }

    async fn dispatch_synchronous(&self, action: Arc<dyn Action>, request: Request) -> Response {
        match self
            .runner
            .run(action, &request.payload, request.protocol_version)
            .await
        {
            Ok(value) => Response::Value(value),
            Err(e) => {
                info!(method = %request.method, error = %e, "Action failed");
                Response::exception(format!("Action Failed {}: {}", request.method, e))
            }
        }
    }

    async fn dispatch_asynchronous(&self, action: Arc<dyn Action>, request: Request) -> Response {
        let Request {
            method,
            payload,
            protocol_version,
            ..
        } = request;

        let run = self.run_func(Arc::clone(&action), payload.clone(), protocol_version);
        let cancel = cancel_func(Arc::clone(&action));
        let end = action.is_persistent().then(|| self.remove_info_func());

        let task = match self.tasks.create_task(run, Some(cancel), end) {
            Ok(task) => task,
            Err(e) => {
                error!(method = %method, error = %e, "Creating task");
                return Response::exception(format!("Action Failed {}: {}", method, e));
            }
        };

        if action.is_persistent() {
            let info = TaskInfo {
                task_id: task.id.clone(),
                method: method.clone(),
                payload,
            };
            if let Err(e) = self.task_manager.add_info(info).await {
                error!(task_id = %task.id, method = %method, error = %e, "Persisting task");
                self.tasks.discard_task(&task.id);
                return Response::exception(format!("Action Failed {}: {}", method, e));
            }
        }

        info!(task_id = %task.id, method = %method, "Starting task");
        self.tasks.start_task(&task);

        accepted(&task)
    }

    /// Restart every persisted task under its original id.
    ///
    /// Failures are logged per task and never stop the pass.
    pub async fn resume_previously_dispatched_tasks(&self) {
        let infos = match self.task_manager.get_infos().await {
            Ok(infos) => infos,
            Err(e) => {
                error!(error = %e, "Loading persisted tasks");
                return;
            }
        };

        for info in infos {
            let action = match self.factory.create(&info.method) {
                Ok(action) => action,
                Err(e) => {
                    warn!(task_id = %info.task_id, method = %info.method, error = %e, "Dropping unresumable task");
                    remove_persisted(self.task_manager.as_ref(), &info.task_id).await;
                    continue;
                }
            };

            let runner = Arc::clone(&self.runner);
            let resume_action = Arc::clone(&action);
            let payload = info.payload;
            let run: RunFunc = Box::new(move || {
                async move { runner.resume(resume_action, &payload).await }.boxed()
            });

            let task = self.tasks.create_task_with_id(
                info.task_id,
                run,
                Some(cancel_func(action)),
                Some(self.remove_info_func()),
            );

            info!(task_id = %task.id, method = %info.method, "Resuming task");
            self.tasks.start_task(&task);
        }
    }

    fn run_func(&self, action: Arc<dyn Action>, payload: Vec<u8>, version: ProtocolVersion) -> RunFunc {
        let runner = Arc::clone(&self.runner);
        Box::new(move || async move { runner.run(action, &payload, version).await }.boxed())
    }

    fn remove_info_func(&self) -> EndFunc {
        let task_manager = Arc::clone(&self.task_manager);
        Box::new(move |task: Task| {
            async move {
                remove_persisted(task_manager.as_ref(), &task.id).await;
            }.boxed()
        })
    }
}

fn cancel_func(action: Arc<dyn Action>) -> CancelFunc {
    Arc::new(move || action.cancel())
}

async fn remove_persisted(task_manager: &dyn TaskManager, task_id: &TaskId) {
    if let Err(e) = task_manager.remove_info(task_id).await {
        warn!(task_id = %task_id, error = %e, "Removing persisted task");
    }
}

fn accepted(task: &Task) -> Response {
    Response::value(json!({
        "agent_task_id": task.id,
        "state": task.state,
    }))
}
