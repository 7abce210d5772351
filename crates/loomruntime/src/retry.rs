//! Retry and timeout wrapper around a single node executor invocation.

use loomcore::{Node, NodeContext, NodeError, NodeOutput, RetryPolicy};
use std::time::Duration;

/// Result of a wrapped invocation, carrying the attempt count the trace
/// records (attempts beyond the first).
pub struct AttemptOutcome {
    pub result: Result<NodeOutput, NodeError>,
    pub retries: u32,
}

fn backoff_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let base = policy.delay_ms as f64 * policy.backoff_multiplier.powi(attempt as i32);
    // Jitter 0.8x..1.2x so synchronized retries don't stampede a provider.
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((base * jitter).min(60_000.0) as u64)
}

/// Invoke `node` with a per-attempt deadline and a bounded retry budget.
///
/// A timed-out attempt counts as a failed attempt. Only retryable errors
/// consume budget; a non-retryable failure (missing input, bad config,
/// blocked host) returns immediately without spending any retries.
pub async fn run_with_policy(
    node: &dyn Node,
    ctx: &NodeContext,
    policy: &RetryPolicy,
    timeout: Duration,
) -> AttemptOutcome {
    let max_attempts = policy.max_attempts.max(1);
    let mut retries = 0u32;

    loop {
        let attempt = retries;
        if ctx.cancellation.is_cancelled() {
            return AttemptOutcome {
                result: Err(NodeError::Cancelled),
                retries,
            };
        }

        let attempt_result = match tokio::time::timeout(timeout, node.execute(ctx.clone())).await {
            Ok(result) => result,
            Err(_) => Err(NodeError::Timeout {
                ms: timeout.as_millis() as u64,
            }),
        };

        match attempt_result {
            Ok(output) => {
                return AttemptOutcome {
                    result: Ok(output),
                    retries,
                };
            }
            Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
                let delay = backoff_delay(attempt, policy);
                tracing::warn!(
                    node = %ctx.node_id,
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying node execution"
                );
                tokio::time::sleep(delay).await;
                retries += 1;
            }
            Err(e) => {
                return AttemptOutcome {
                    result: Err(e),
                    retries,
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use loomcore::{EventBus, ExecutionId, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_ctx() -> NodeContext {
        let bus = EventBus::new(16);
        NodeContext {
            node_id: "n1".into(),
            inputs: HashMap::new(),
            port_values: Vec::new(),
            config: HashMap::new(),
            flow_inputs: Arc::new(HashMap::new()),
            events: bus.create_emitter(ExecutionId::new_v4(), "n1".into()),
            cancellation: tokio_util::sync::CancellationToken::new(),
            scope: None,
            judge: None,
        }
    }

    struct FlakyNode {
        failures: usize,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Node for FlakyNode {
        fn spec_id(&self) -> &str {
            "flaky"
        }

        async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(NodeError::provider("upstream 503", true))
            } else {
                Ok(NodeOutput::value(Value::String("ok".into())))
            }
        }
    }

    struct SlowNode;

    #[async_trait]
    impl Node for SlowNode {
        fn spec_id(&self) -> &str {
            "slow"
        }

        async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(NodeOutput::new())
        }
    }

    struct BlockedNode {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Node for BlockedNode {
        fn spec_id(&self) -> &str {
            "blocked"
        }

        async fn execute(&self, _ctx: NodeContext) -> Result<NodeOutput, NodeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(NodeError::BlockedHost {
                host: "127.0.0.1".into(),
            })
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay_ms: 1,
            backoff_multiplier: 1.0,
        }
    }

    #[tokio::test]
    async fn fails_twice_succeeds_third_records_two_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let node = FlakyNode {
            failures: 2,
            calls: calls.clone(),
        };
        let outcome =
            run_with_policy(&node, &test_ctx(), &policy(3), Duration::from_secs(5)).await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.retries, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn budget_exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let node = FlakyNode {
            failures: 10,
            calls: calls.clone(),
        };
        let outcome =
            run_with_policy(&node, &test_ctx(), &policy(2), Duration::from_secs(5)).await;
        assert!(matches!(outcome.result, Err(NodeError::Provider { .. })));
        assert_eq!(outcome.retries, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn timeout_counts_as_failed_attempt() {
        let outcome =
            run_with_policy(&SlowNode, &test_ctx(), &policy(1), Duration::from_millis(20)).await;
        assert!(matches!(outcome.result, Err(NodeError::Timeout { .. })));
        assert_eq!(outcome.retries, 0);
    }

    #[tokio::test]
    async fn blocked_host_spends_no_retry_budget() {
        let calls = Arc::new(AtomicUsize::new(0));
        let node = BlockedNode {
            calls: calls.clone(),
        };
        let outcome =
            run_with_policy(&node, &test_ctx(), &policy(5), Duration::from_secs(5)).await;
        assert!(matches!(outcome.result, Err(NodeError::BlockedHost { .. })));
        assert_eq!(outcome.retries, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt() {
        let ctx = test_ctx();
        ctx.cancellation.cancel();
        let outcome =
            run_with_policy(&SlowNode, &ctx, &policy(3), Duration::from_millis(50)).await;
        assert!(matches!(outcome.result, Err(NodeError::Cancelled)));
    }
}
