use crate::actions::{Action, ActionInput, ActionOutput};
use crate::agent::{ActionCall, FunctionDefinition};
use crate::worker::{AsyncWorker, WorkerError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// An action call routed to the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequest {
    pub call: ActionCall,
    pub conversation_id: String,
}

/// Outcome reported back to the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResult {
    pub action: String,
    pub success: bool,
    pub message: String,
}

/// Runs agent-requested actions one at a time, in arrival order.
pub struct ActionsWorker {
    actions: HashMap<String, Arc<dyn Action>>,
    call_id: Option<String>,
    in_flight: Mutex<()>,
}

impl Default for ActionsWorker {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionsWorker {
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
            call_id: None,
            in_flight: Mutex::new(()),
        }
    }

    /// Registers `action` under its configured name. A later action with
    /// the same name replaces the earlier one.
    pub fn attach(mut self, action: Arc<dyn Action>) -> Self {
        let name = action.name().to_string();
        if self.actions.insert(name.clone(), action).is_some() {
            tracing::warn!(action = %name, "replacing registered action");
        }
        self
    }

    /// Live call the actions operate on
    pub fn with_call_id(mut self, call_id: Option<String>) -> Self {
        self.call_id = call_id;
        self
    }

    /// Function definitions of the agent-invocable actions, sorted by name.
    pub fn function_definitions(&self) -> Vec<FunctionDefinition> {
        let mut definitions: Vec<_> = self
            .actions
            .values()
            .filter(|a| a.config().agent_invocable)
            .map(|a| a.function_definition())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    pub fn has_action(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Runs one request. Concurrent callers queue behind the running one.
    pub async fn execute(&self, request: ActionRequest) -> ActionResult {
        let _guard = self.in_flight.lock().await;
        let name = request.call.name.clone();

        let output = match self.actions.get(&name) {
            Some(action) => {
                tracing::info!(
                    action = %name,
                    conversation_id = %request.conversation_id,
                    "running action"
                );
                action
                    .run(ActionInput {
                        action_config: action.config().clone(),
                        conversation_id: request.conversation_id,
                        params: request.call.params,
                        call_id: self.call_id.clone(),
                    })
                    .await
            }
            None => {
                tracing::warn!(action = %name, "unknown action requested");
                ActionOutput::failure(format!("Unknown action: {}", name))
            }
        };

        if !output.success {
            tracing::warn!(action = %name, message = %output.message, "action failed");
        }
        ActionResult {
            action: name,
            success: output.success,
            message: output.message,
        }
    }
}

#[async_trait]
impl AsyncWorker for ActionsWorker {
    type Input = ActionRequest;
    type Output = ActionResult;

    async fn process(
        &mut self,
        request: ActionRequest,
    ) -> std::result::Result<Option<ActionResult>, WorkerError> {
        Ok(Some(self.execute(request).await))
    }

    fn name(&self) -> &'static str {
        "actions"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::ActionConfig;
    use crate::worker::{TaskWorker, WorkerHandle};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records start/finish order and the peak number of concurrent runs.
    struct SlowAction {
        config: ActionConfig,
        running: AtomicUsize,
        peak: AtomicUsize,
        log: std::sync::Mutex<Vec<String>>,
    }

    impl SlowAction {
        fn new() -> Self {
            Self {
                config: ActionConfig::new("slow", "Sleeps"),
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                log: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Action for SlowAction {
        fn config(&self) -> &ActionConfig {
            &self.config
        }

        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {"id": {"type": "string"}}})
        }

        async fn run(&self, input: ActionInput) -> ActionOutput {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let id = input.params["id"].as_str().unwrap_or("?").to_string();
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.log.lock().unwrap().push(id.clone());
            self.running.fetch_sub(1, Ordering::SeqCst);
            ActionOutput::success(format!("done {}", id))
        }
    }

    fn request(name: &str, id: &str) -> ActionRequest {
        ActionRequest {
            call: ActionCall {
                name: name.to_string(),
                params: serde_json::json!({ "id": id }),
            },
            conversation_id: "conv".to_string(),
        }
    }

    #[tokio::test]
    async fn test_one_action_at_a_time_in_fifo_order() {
        let action = Arc::new(SlowAction::new());
        let worker = TaskWorker::new(ActionsWorker::new().attach(action.clone()));
        worker.start().unwrap();

        for id in ["a", "b", "c"] {
            worker.consume_nonblocking(request("slow", id)).unwrap();
        }
        let mut messages = Vec::new();
        for _ in 0..3 {
            messages.push(worker.output().recv().await.unwrap().message);
        }

        assert_eq!(messages, vec!["done a", "done b", "done c"]);
        assert_eq!(action.peak.load(Ordering::SeqCst), 1);
        worker.terminate();
    }

    #[tokio::test]
    async fn test_concurrent_execute_calls_are_serialized() {
        let action = Arc::new(SlowAction::new());
        let worker = Arc::new(ActionsWorker::new().attach(action.clone()));

        let first = tokio::spawn({
            let worker = worker.clone();
            async move { worker.execute(request("slow", "1")).await }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = tokio::spawn({
            let worker = worker.clone();
            async move { worker.execute(request("slow", "2")).await }
        });

        assert!(first.await.unwrap().success);
        assert!(second.await.unwrap().success);
        assert_eq!(action.peak.load(Ordering::SeqCst), 1);
        assert_eq!(*action.log.lock().unwrap(), vec!["1", "2"]);
    }

    #[tokio::test]
    async fn test_unknown_action_fails_without_error() {
        let worker = ActionsWorker::new();
        let result = worker.execute(request("transfer_call", "x")).await;
        assert!(!result.success);
        assert_eq!(result.action, "transfer_call");
        assert!(result.message.contains("Unknown action"));
    }

    #[test]
    fn test_function_definitions_skip_hidden_actions() {
        let mut hidden = SlowAction::new();
        hidden.config = ActionConfig {
            agent_invocable: false,
            ..ActionConfig::new("hidden", "Not for the model")
        };
        let worker = ActionsWorker::new()
            .attach(Arc::new(SlowAction::new()))
            .attach(Arc::new(hidden));

        let definitions = worker.function_definitions();
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions[0].name, "slow");
        assert_eq!(definitions[0].parameters["type"], "object");
        assert!(worker.has_action("hidden"));
    }
}
