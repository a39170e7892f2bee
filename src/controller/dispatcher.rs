//! Notification dispatch
//!
//! The only entry point for a lifecycle notification. It never fails: parse
//! errors, coordinator errors and even coordinator panics become a 500
//! response naming the error kind and step.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, instrument, warn};

use super::{Context, JoinCoordinator, NodeJoiner, NodeRemover, RemovalCoordinator};
use crate::error::StepError;
use crate::event::{LifecycleEvent, LifecycleHookRef, Transition};
use crate::fleet::{LifecycleActionResult, LifecycleHooks};
use crate::Error;

/// Status returned for every notification
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleResponse {
    /// 200 on success or ignore, 500 on any failure
    pub status_code: u16,
    /// Human-readable outcome
    pub body: String,
}

impl LifecycleResponse {
    /// A 200 response
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status_code: 200,
            body: body.into(),
        }
    }

    /// A 500 response
    pub fn failed(body: impl Into<String>) -> Self {
        Self {
            status_code: 500,
            body: body.into(),
        }
    }

    /// Whether the status is 200
    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }

    fn from_error(err: &Error) -> Self {
        Self::failed(format!("{}: {err}", err.kind()))
    }

    fn from_step_error(err: &StepError) -> Self {
        Self::failed(format!("{} at {}: {err}", err.kind(), err.step))
    }
}

/// Routes notifications to the join and removal coordinators
pub struct EventDispatcher {
    joiner: Arc<dyn NodeJoiner>,
    remover: Arc<dyn NodeRemover>,
    hooks: Option<Arc<dyn LifecycleHooks>>,
}

impl EventDispatcher {
    /// Create a dispatcher over the given coordinators
    pub fn new(joiner: Arc<dyn NodeJoiner>, remover: Arc<dyn NodeRemover>) -> Self {
        Self {
            joiner,
            remover,
            hooks: None,
        }
    }

    /// Complete lifecycle actions through `hooks` after each coordinator run
    pub fn with_lifecycle_hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Dispatcher wired to the real coordinators
    ///
    /// Lifecycle actions are completed only when enabled in the
    /// configuration and the context carries a hooks client.
    pub fn from_context(ctx: Arc<Context>) -> Self {
        let hooks = ctx
            .hooks
            .clone()
            .filter(|_| ctx.config.complete_lifecycle_action);
        let dispatcher = Self::new(
            Arc::new(JoinCoordinator::new(ctx.clone())),
            Arc::new(RemovalCoordinator::new(ctx)),
        );
        match hooks {
            Some(hooks) => dispatcher.with_lifecycle_hooks(hooks),
            None => dispatcher,
        }
    }

    /// Handle a raw JSON payload
    pub async fn handle_json(&self, payload: &str) -> LifecycleResponse {
        match serde_json::from_str(payload) {
            Ok(value) => self.handle(value).await,
            Err(e) => {
                let err = Error::malformed(format!("payload is not JSON: {e}"));
                warn!(error = %err, "Rejected notification");
                LifecycleResponse::from_error(&err)
            }
        }
    }

    /// Handle one decoded notification
    pub async fn handle(&self, payload: Value) -> LifecycleResponse {
        match LifecycleEvent::from_value(payload) {
            Ok(event) => self.dispatch(event).await,
            Err(err) => {
                warn!(error = %err, "Rejected notification");
                LifecycleResponse::from_error(&err)
            }
        }
    }

    #[instrument(
        skip(self, event),
        fields(instance_id = %event.instance_id, transition = %event.transition)
    )]
    async fn dispatch(&self, event: LifecycleEvent) -> LifecycleResponse {
        let instance_id = event.instance_id.clone();

        let result = match event.transition {
            Transition::Unknown => {
                let ignored = Error::UnknownTransition(event.raw_transition.clone());
                info!(kind = ignored.kind(), error = %ignored, "Ignoring notification");
                return LifecycleResponse::ok(format!(
                    "{}: {ignored} (ignored for {instance_id})",
                    ignored.kind()
                ));
            }
            Transition::Launching => {
                info!("Joining launched instance");
                let joiner = self.joiner.clone();
                let id = instance_id.clone();
                run_isolated(async move { joiner.join(&id).await.map(|o| o.to_string()) }).await
            }
            Transition::Terminating => {
                info!("Removing terminating instance");
                let remover = self.remover.clone();
                let id = instance_id.clone();
                run_isolated(async move { remover.remove(&id).await.map(|o| o.to_string()) })
                    .await
            }
        };

        let response = match &result {
            Ok(Ok(outcome)) => {
                info!(outcome = %outcome, "Lifecycle transition handled");
                LifecycleResponse::ok(outcome.clone())
            }
            Ok(Err(err)) => {
                error!(
                    step = %err.step,
                    kind = err.kind(),
                    error = %err,
                    "Lifecycle transition failed"
                );
                LifecycleResponse::from_step_error(err)
            }
            Err(panic) => {
                error!(error = %panic, "Coordinator aborted");
                LifecycleResponse::failed(format!("InternalError: {panic}"))
            }
        };

        if let Some(hook) = &event.hook {
            self.complete_lifecycle_action(&event, hook, response.is_success())
                .await;
        }

        response
    }

    async fn complete_lifecycle_action(
        &self,
        event: &LifecycleEvent,
        hook: &LifecycleHookRef,
        succeeded: bool,
    ) {
        let Some(hooks) = &self.hooks else {
            return;
        };

        let result = match (succeeded, event.transition) {
            (false, Transition::Launching) => LifecycleActionResult::Abandon,
            _ => LifecycleActionResult::Continue,
        };

        if let Err(e) = hooks.complete(&event.instance_id, hook, result).await {
            warn!(
                hook = %hook.hook_name,
                result = result.as_str(),
                error = %e,
                "Failed to complete lifecycle action"
            );
        }
    }
}

/// Run a coordinator on its own task so a panic becomes an error value
async fn run_isolated<F>(work: F) -> Result<Result<String, StepError>, tokio::task::JoinError>
where
    F: std::future::Future<Output = Result<String, StepError>> + Send + 'static,
{
    tokio::spawn(work).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::{JoinOutcome, MockNodeJoiner, MockNodeRemover, RemovalOutcome};
    use crate::error::Step;
    use crate::fleet::MockLifecycleHooks;
    use serde_json::json;

    fn joined() -> JoinOutcome {
        JoinOutcome::Joined {
            worker: "10.0.1.5".to_string(),
            endpoint: "10.0.0.1:6443".to_string(),
        }
    }

    fn dispatcher(joiner: MockNodeJoiner, remover: MockNodeRemover) -> EventDispatcher {
        EventDispatcher::new(Arc::new(joiner), Arc::new(remover))
    }

    fn hook_notification(transition: &str) -> Value {
        json!({
            "LifecycleHookName": "workers-hook",
            "AutoScalingGroupName": "k8s-workers",
            "LifecycleActionToken": "71514b9d",
            "LifecycleTransition": transition,
            "EC2InstanceId": "i-1"
        })
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Story: a launch notification reaches the joiner and only the joiner
    #[tokio::test]
    async fn story_launching_routes_to_join_only() {
        let mut joiner = MockNodeJoiner::new();
        joiner
            .expect_join()
            .withf(|id| id == "i-1")
            .times(1)
            .returning(|_| Ok(joined()));
        let mut remover = MockNodeRemover::new();
        remover.expect_remove().never();

        let response = dispatcher(joiner, remover)
            .handle(json!({"instanceId": "i-1", "lifecycleTransition": "EC2_INSTANCE_LAUNCHING"}))
            .await;

        assert_eq!(response.status_code, 200);
        assert!(response.body.contains("joined 10.0.0.1:6443"));
    }

    #[tokio::test]
    async fn terminating_routes_to_removal_only() {
        let mut joiner = MockNodeJoiner::new();
        joiner.expect_join().never();
        let mut remover = MockNodeRemover::new();
        remover.expect_remove().times(1).returning(|_| {
            Ok(RemovalOutcome::Removed {
                node: "ip-10-0-2-9".to_string(),
            })
        });

        let response = dispatcher(joiner, remover)
            .handle(json!({"instanceId": "i-2", "lifecycleTransition": "EC2_INSTANCE_TERMINATING"}))
            .await;

        assert_eq!(response, LifecycleResponse::ok("node ip-10-0-2-9 removed"));
    }

    /// Story: the autoscaler's test notification is acknowledged and ignored
    #[tokio::test]
    async fn story_test_notification_is_ignored() {
        let mut joiner = MockNodeJoiner::new();
        joiner.expect_join().never();
        let mut remover = MockNodeRemover::new();
        remover.expect_remove().never();

        let response = dispatcher(joiner, remover)
            .handle(json!({
                "AccountId": "123456789012",
                "AutoScalingGroupName": "k8s-workers",
                "Event": "autoscaling:TEST_NOTIFICATION",
                "Service": "AWS Auto Scaling"
            }))
            .await;

        assert_eq!(response.status_code, 200);
        assert!(response.body.starts_with("UnknownTransition: "));
        assert!(response.body.contains("TEST_NOTIFICATION"));
    }

    #[tokio::test]
    async fn malformed_payload_is_500_without_coordinators() {
        let mut joiner = MockNodeJoiner::new();
        joiner.expect_join().never();
        let mut remover = MockNodeRemover::new();
        remover.expect_remove().never();
        let d = dispatcher(joiner, remover);

        let response = d.handle(json!({"lifecycleTransition": "EC2_INSTANCE_LAUNCHING"})).await;
        assert_eq!(response.status_code, 500);
        assert!(response.body.starts_with("MalformedEvent"));

        let response = d.handle_json("{not json").await;
        assert_eq!(response.status_code, 500);
        assert!(response.body.starts_with("MalformedEvent"));

        let response = d.handle(json!(["i-1"])).await;
        assert_eq!(response.status_code, 500);
    }

    // =========================================================================
    // Failure reporting
    // =========================================================================

    /// Story: a failed drain is reported as a 500 naming the kind and step
    #[tokio::test]
    async fn story_coordinator_failure_names_kind_and_step() {
        let joiner = MockNodeJoiner::new();
        let mut remover = MockNodeRemover::new();
        remover.expect_remove().returning(|_| {
            Err(StepError::new(
                Step::Drain,
                "ip-10-0-2-9",
                Error::RemoteCommand {
                    host: "10.0.0.27".to_string(),
                    command: "kubectl drain".to_string(),
                    exit_status: 1,
                    stderr: "cannot evict pod".to_string(),
                },
            ))
        });

        let response = dispatcher(joiner, remover)
            .handle(json!({"instanceId": "i-2", "lifecycleTransition": "TERMINATING"}))
            .await;

        assert_eq!(response.status_code, 500);
        assert!(response.body.starts_with("RemoteCommandFailure at drain"));
        assert!(response.body.contains("ip-10-0-2-9"));
    }

    struct PanickingJoiner;

    #[async_trait::async_trait]
    impl NodeJoiner for PanickingJoiner {
        async fn join(&self, _instance_id: &str) -> Result<JoinOutcome, StepError> {
            panic!("executor state poisoned")
        }
    }

    #[tokio::test]
    async fn coordinator_panic_becomes_500() {
        let d = EventDispatcher::new(Arc::new(PanickingJoiner), Arc::new(MockNodeRemover::new()));

        let response = d
            .handle(json!({"instanceId": "i-1", "lifecycleTransition": "LAUNCHING"}))
            .await;

        assert_eq!(response.status_code, 500);
        assert!(response.body.starts_with("InternalError"));
    }

    #[test]
    fn response_serializes_with_status_code_field() {
        let json = serde_json::to_value(LifecycleResponse::ok("done")).unwrap();
        assert_eq!(json, json!({"statusCode": 200, "body": "done"}));
    }

    // =========================================================================
    // Lifecycle action completion
    // =========================================================================

    /// Story: a failed join abandons the launch so the autoscaler replaces
    /// the instance instead of keeping a node that never joined
    #[tokio::test]
    async fn story_failed_launch_abandons_lifecycle_action() {
        let mut joiner = MockNodeJoiner::new();
        joiner.expect_join().returning(|_| {
            Err(StepError::new(
                Step::WaitForReady,
                "i-1",
                Error::ReadinessTimeout {
                    instance_id: "i-1".to_string(),
                    waited: std::time::Duration::from_secs(300),
                    last_state: "pending".to_string(),
                },
            ))
        });
        let mut hooks = MockLifecycleHooks::new();
        hooks
            .expect_complete()
            .withf(|id, hook, result| {
                id == "i-1"
                    && hook.hook_name == "workers-hook"
                    && *result == LifecycleActionResult::Abandon
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let response = dispatcher(joiner, MockNodeRemover::new())
            .with_lifecycle_hooks(Arc::new(hooks))
            .handle(hook_notification("autoscaling:EC2_INSTANCE_LAUNCHING"))
            .await;

        assert_eq!(response.status_code, 500);
        assert!(response.body.starts_with("ReadinessTimeout at wait-for-ready"));
    }

    #[tokio::test]
    async fn failed_removal_still_continues_termination() {
        let mut remover = MockNodeRemover::new();
        remover.expect_remove().returning(|_| {
            Err(StepError::new(
                Step::ResolveNode,
                "i-1",
                Error::identity("i-1", "instance not found"),
            ))
        });
        let mut hooks = MockLifecycleHooks::new();
        hooks
            .expect_complete()
            .withf(|_, _, result| *result == LifecycleActionResult::Continue)
            .times(1)
            .returning(|_, _, _| Ok(()));

        let response = dispatcher(MockNodeJoiner::new(), remover)
            .with_lifecycle_hooks(Arc::new(hooks))
            .handle(hook_notification("autoscaling:EC2_INSTANCE_TERMINATING"))
            .await;

        assert_eq!(response.status_code, 500);
    }

    #[tokio::test]
    async fn completion_failure_does_not_change_status() {
        let mut joiner = MockNodeJoiner::new();
        joiner.expect_join().returning(|_| Ok(joined()));
        let mut hooks = MockLifecycleHooks::new();
        hooks
            .expect_complete()
            .returning(|_, _, _| Err(Error::fleet("i-1", "ValidationError: token expired")));

        let response = dispatcher(joiner, MockNodeRemover::new())
            .with_lifecycle_hooks(Arc::new(hooks))
            .handle(hook_notification("autoscaling:EC2_INSTANCE_LAUNCHING"))
            .await;

        assert_eq!(response.status_code, 200);
    }

    #[tokio::test]
    async fn direct_events_never_complete_actions() {
        let mut joiner = MockNodeJoiner::new();
        joiner.expect_join().returning(|_| Ok(joined()));
        let mut hooks = MockLifecycleHooks::new();
        hooks.expect_complete().never();

        let response = dispatcher(joiner, MockNodeRemover::new())
            .with_lifecycle_hooks(Arc::new(hooks))
            .handle(json!({"instanceId": "i-1", "lifecycleTransition": "LAUNCHING"}))
            .await;

        assert!(response.is_success());
    }
}
