//! 步骤执行器
//!
//! 在超时与取消的约束下把单个步骤派发给对应协议的适配器, 并用比较器判定结果。

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use vtp_protocol::{AdapterError, AdapterRegistry, AdapterRequest, ProtocolAdapter};

use crate::compare::compare;
use crate::plan::Step;
use crate::result::{FailureReason, NodeResult, NodeStatus};

/// 默认步骤超时
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(5);

enum CallOutcome {
    Returned(vtp_protocol::Result<serde_json::Value>),
    TimedOut,
    Cancelled,
}

/// 步骤执行器
#[derive(Clone)]
pub struct StepRunner {
    /// 协议注册表
    registry: Arc<AdapterRegistry>,

    /// 默认超时时间
    default_timeout: Duration,
}

impl StepRunner {
    /// 创建新的步骤执行器
    pub fn new(registry: Arc<AdapterRegistry>) -> Self {
        Self {
            registry,
            default_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    /// 设置默认超时时间
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// 执行步骤, 按协议类型从注册表查找适配器
    pub async fn run(&self, step: &Step, position: usize, cancel: &CancellationToken) -> NodeResult {
        let mut result = NodeResult::step(step, position);

        if cancel.is_cancelled() {
            result.finish(NodeStatus::Cancelled, Some(FailureReason::Cancelled));
            return result;
        }

        match self.registry.get(step.protocol).await {
            Ok(adapter) => self.run_with_adapter(step, position, adapter, cancel).await,
            Err(e) => {
                warn!("步骤 '{}' 无可用适配器: {}", step.name, e);
                result.finish(
                    NodeStatus::Error,
                    Some(FailureReason::AdapterNotFound {
                        protocol: step.protocol.to_string(),
                    }),
                );
                result
            }
        }
    }

    /// 使用指定适配器执行步骤
    ///
    /// 调用开始前已取消时不会发起调用。
    pub async fn run_with_adapter(
        &self,
        step: &Step,
        position: usize,
        adapter: Arc<dyn ProtocolAdapter>,
        cancel: &CancellationToken,
    ) -> NodeResult {
        let mut result = NodeResult::step(step, position);

        if cancel.is_cancelled() {
            result.finish(NodeStatus::Cancelled, Some(FailureReason::Cancelled));
            return result;
        }

        let step_timeout = step
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);
        let deadline = Instant::now() + step_timeout;

        // 子令牌交给适配器, 竞争结束后统一取消
        let call_token = cancel.child_token();
        let request = AdapterRequest::new(
            step.id.clone(),
            step.payload.clone(),
            deadline,
            call_token.clone(),
        );

        debug!(
            "执行步骤 '{}' via {} (超时 {:?})",
            step.name,
            adapter.name(),
            step_timeout
        );
        result.status = NodeStatus::Running;
        result.started_at = Some(Utc::now());

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => CallOutcome::Cancelled,
            res = tokio::time::timeout_at(deadline, adapter.execute(request)) => match res {
                Ok(value) => CallOutcome::Returned(value),
                Err(_) => CallOutcome::TimedOut,
            },
        };
        call_token.cancel();

        match outcome {
            CallOutcome::Cancelled => {
                debug!("步骤 '{}' 已取消", step.name);
                result.finish(NodeStatus::Cancelled, Some(FailureReason::Cancelled));
            }
            CallOutcome::TimedOut | CallOutcome::Returned(Err(AdapterError::Timeout)) => {
                warn!("步骤 '{}' 执行超时", step.name);
                result.finish(NodeStatus::Error, Some(FailureReason::Timeout));
            }
            CallOutcome::Returned(Err(AdapterError::Cancelled)) if cancel.is_cancelled() => {
                result.finish(NodeStatus::Cancelled, Some(FailureReason::Cancelled));
            }
            CallOutcome::Returned(Err(e)) => {
                warn!("步骤 '{}' 适配器错误: {}", step.name, e);
                result.finish(
                    NodeStatus::Error,
                    Some(FailureReason::Adapter {
                        message: e.to_string(),
                    }),
                );
            }
            CallOutcome::Returned(Ok(actual)) => {
                let diff = compare(&step.expected, &actual);
                if diff.passed {
                    debug!("步骤 '{}' 通过", step.name);
                    result.finish(NodeStatus::Passed, None);
                } else {
                    debug!("步骤 '{}' 比较失败: {}", step.name, diff.summary());
                    result.finish(NodeStatus::Failed, Some(FailureReason::Comparison));
                }
                result.actual = Some(actual);
                result.diff = Some(diff);
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use vtp_protocol::{MockResponse, MockServiceAdapter, ProtocolKind};

    use crate::compare::ExpectSpec;

    /// 永不返回的适配器, 记录是否收到取消信号
    struct HangingAdapter {
        calls: AtomicUsize,
        saw_cancel: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ProtocolAdapter for HangingAdapter {
        fn kind(&self) -> ProtocolKind {
            ProtocolKind::Can
        }

        async fn execute(&self, request: AdapterRequest) -> vtp_protocol::Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let saw_cancel = self.saw_cancel.clone();
            let token = request.cancel.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                saw_cancel.fetch_add(1, Ordering::SeqCst);
            });
            std::future::pending().await
        }
    }

    fn step(protocol: ProtocolKind, expected: ExpectSpec) -> Step {
        Step {
            id: "step-1".to_string(),
            name: "read speed".to_string(),
            protocol,
            payload: json!({"method": "speed.get"}),
            expected,
            timeout_ms: Some(100),
        }
    }

    async fn registry_with(adapter: Arc<dyn ProtocolAdapter>) -> Arc<AdapterRegistry> {
        let registry = Arc::new(AdapterRegistry::new());
        registry.register(adapter).await.unwrap();
        registry
    }

    #[tokio::test]
    async fn test_passed_and_failed() {
        let adapter = MockServiceAdapter::echo(ProtocolKind::Rpc)
            .with_response("speed.get", MockResponse::value(json!({"speed": 60})));
        let runner = StepRunner::new(registry_with(Arc::new(adapter)).await);
        let cancel = CancellationToken::new();

        let ok = step(
            ProtocolKind::Rpc,
            ExpectSpec::object([("speed", ExpectSpec::tolerance(59.5, 1.0))]),
        );
        let result = runner.run(&ok, 0, &cancel).await;
        assert_eq!(result.status, NodeStatus::Passed);
        assert_eq!(result.actual, Some(json!({"speed": 60})));
        assert!(result.started_at.is_some() && result.ended_at.is_some());

        let bad = step(
            ProtocolKind::Rpc,
            ExpectSpec::object([("speed", ExpectSpec::exact(json!(80)))]),
        );
        let result = runner.run(&bad, 1, &cancel).await;
        assert_eq!(result.status, NodeStatus::Failed);
        assert_eq!(result.reason, Some(FailureReason::Comparison));
        assert!(!result.diff.unwrap().passed);
    }

    #[tokio::test]
    async fn test_missing_adapter_is_error() {
        let runner = StepRunner::new(Arc::new(AdapterRegistry::new()));
        let result = runner
            .run(&step(ProtocolKind::Fsa, ExpectSpec::Ignore), 0, &CancellationToken::new())
            .await;

        assert_eq!(result.status, NodeStatus::Error);
        assert!(matches!(result.reason, Some(FailureReason::AdapterNotFound { .. })));
        assert!(result.started_at.is_none());
    }

    #[tokio::test]
    async fn test_adapter_error_is_error() {
        let adapter = MockServiceAdapter::echo(ProtocolKind::Rpc)
            .with_response("speed.get", MockResponse::error("ECU busy"));
        let runner = StepRunner::new(registry_with(Arc::new(adapter)).await);

        let result = runner
            .run(&step(ProtocolKind::Rpc, ExpectSpec::Ignore), 0, &CancellationToken::new())
            .await;
        assert_eq!(result.status, NodeStatus::Error);
        match result.reason {
            Some(FailureReason::Adapter { message }) => assert!(message.contains("ECU busy")),
            other => panic!("unexpected reason: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_returning_adapter_times_out() {
        let saw_cancel = Arc::new(AtomicUsize::new(0));
        let adapter = Arc::new(HangingAdapter {
            calls: AtomicUsize::new(0),
            saw_cancel: saw_cancel.clone(),
        });
        let runner = StepRunner::new(registry_with(adapter.clone()).await);

        let started = Instant::now();
        let result = runner
            .run(&step(ProtocolKind::Can, ExpectSpec::Ignore), 0, &CancellationToken::new())
            .await;

        assert_eq!(result.status, NodeStatus::Error);
        assert_eq!(result.reason, Some(FailureReason::Timeout));
        assert!(started.elapsed() < Duration::from_millis(150));

        // 超时后子令牌被取消
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(saw_cancel.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_call() {
        let adapter = Arc::new(HangingAdapter {
            calls: AtomicUsize::new(0),
            saw_cancel: Arc::new(AtomicUsize::new(0)),
        });
        let runner = StepRunner::new(registry_with(adapter).await);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result = runner
            .run(&step(ProtocolKind::Can, ExpectSpec::Ignore), 0, &cancel)
            .await;
        assert_eq!(result.status, NodeStatus::Cancelled);
        assert_eq!(result.reason, Some(FailureReason::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_before_call_never_dispatches() {
        let adapter = Arc::new(HangingAdapter {
            calls: AtomicUsize::new(0),
            saw_cancel: Arc::new(AtomicUsize::new(0)),
        });
        let runner = StepRunner::new(registry_with(adapter.clone()).await);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = runner
            .run(&step(ProtocolKind::Can, ExpectSpec::Ignore), 0, &cancel)
            .await;
        assert_eq!(result.status, NodeStatus::Cancelled);
        assert!(result.started_at.is_none());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
    }
}
