//! A runner connected to a real broker over TCP.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use taskbroker_core::{TaskError, TaskPayload, TaskStatus};
use taskbroker_runner::{
    Config as RunnerConfig, ExecutionOutcome, Executor, ExecutorError, RunnerConnection,
    TaskRequest,
};
use taskbroker_server::{transport, Broker, Config as BrokerConfig};

/// Sums the input array, honours the guard, and hangs on request.
struct SumExecutor;

#[async_trait]
impl Executor for SumExecutor {
    async fn execute(
        &self,
        request: TaskRequest,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutorError> {
        if let Err(error) = taskbroker_runner::executor::check_imports(&request.payload.code, &request.guard) {
            return Ok(ExecutionOutcome::Finished(Err(error)));
        }
        if request.payload.code.contains("hang") {
            cancel.cancelled().await;
            return Ok(ExecutionOutcome::Cancelled);
        }
        let sum: i64 = request
            .payload
            .input
            .as_array()
            .map(|items| items.iter().filter_map(|v| v.as_i64()).sum())
            .unwrap_or_default();
        Ok(ExecutionOutcome::Finished(Ok(json!(sum))))
    }
}

struct Harness {
    broker: Broker,
    shutdown: CancellationToken,
}

async fn start(runner_config: RunnerConfig) -> Harness {
    let (broker, _events) = Broker::new(BrokerConfig::default());
    let shutdown = CancellationToken::new();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(transport::serve(listener, broker.clone(), shutdown.clone()));

    let config = RunnerConfig {
        broker_addr: addr.to_string(),
        ..runner_config
    };
    let connection = RunnerConnection::new(&config, Arc::new(SumExecutor));
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move { connection.connect_and_run(&shutdown).await }
    });

    // Wait for the runner to register.
    for _ in 0..100 {
        if !broker.runners().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(broker.runners().await.len(), 1);

    Harness { broker, shutdown }
}

fn runner_config() -> RunnerConfig {
    RunnerConfig {
        runner_id: Some("e2e".to_string()),
        max_concurrency: 2,
        deny_modules: vec!["fs".to_string()],
        ..RunnerConfig::default()
    }
}

#[tokio::test]
async fn test_task_round_trip_through_runner() {
    let h = start(runner_config()).await;

    let task_id = h
        .broker
        .submit(
            "exec",
            TaskPayload::new("return items.reduce((a, b) => a + b, 0)").with_input(json!([1, 2, 3])),
            None,
        )
        .await
        .unwrap();
    assert_eq!(h.broker.await_result(&task_id).await.unwrap(), Ok(json!(6)));
    assert_eq!(
        h.broker.task(&task_id).await.unwrap().status,
        TaskStatus::Succeeded
    );

    h.shutdown.cancel();
}

#[tokio::test]
async fn test_denied_module_reaches_client_verbatim() {
    let h = start(runner_config()).await;

    let task_id = h
        .broker
        .submit(
            "exec",
            TaskPayload::new("const fs = require('fs'); return fs.readdirSync('/');"),
            None,
        )
        .await
        .unwrap();
    assert_eq!(
        h.broker.await_result(&task_id).await.unwrap(),
        Err(TaskError::DisallowedModule {
            module: "fs".to_string()
        })
    );

    h.shutdown.cancel();
}

#[tokio::test]
async fn test_cancel_reaches_running_task() {
    let h = start(runner_config()).await;

    let task_id = h
        .broker
        .submit("exec", TaskPayload::new("hang"), None)
        .await
        .unwrap();
    for _ in 0..100 {
        if h.broker.task(&task_id).await.unwrap().status == TaskStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    h.broker.cancel(&task_id, "stop").await.unwrap();
    assert_eq!(
        h.broker.await_result(&task_id).await.unwrap(),
        Err(TaskError::Cancelled {
            reason: "stop".to_string()
        })
    );
    assert_eq!(h.broker.runners().await[0].in_flight, 0);

    h.shutdown.cancel();
}

#[tokio::test]
async fn test_runner_disconnect_fails_running_task() {
    let h = start(runner_config()).await;

    let task_id = h
        .broker
        .submit("exec", TaskPayload::new("hang"), None)
        .await
        .unwrap();
    for _ in 0..100 {
        if h.broker.task(&task_id).await.unwrap().status == TaskStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    h.shutdown.cancel();
    let outcome = h.broker.await_result(&task_id).await.unwrap();
    assert!(matches!(outcome, Err(TaskError::RunnerLost { .. })));
    assert!(h.broker.runners().await.is_empty());
}
