//! Connection management for the runner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskbroker_core::protocol::{decode, encode};
use taskbroker_core::{
    BrokerMessage, ModuleGuard, RunnerId, RunnerInfo, RunnerMessage, TaskError, TaskId,
    TaskPayload,
};

use crate::config::Config;
use crate::error::RunnerError;
use crate::executor::{ExecutionOutcome, Executor, TaskRequest};

/// Longest accepted frame.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

type Running = Arc<Mutex<HashMap<TaskId, CancellationToken>>>;

/// Manages the connection to the broker.
pub struct RunnerConnection {
    info: RunnerInfo,
    guard: ModuleGuard,
    heartbeat_interval: Duration,
    broker_addr: String,
    executor: Arc<dyn Executor>,
}

impl RunnerConnection {
    pub fn new(config: &Config, executor: Arc<dyn Executor>) -> Self {
        Self {
            info: config.runner_info(),
            guard: config.guard(),
            heartbeat_interval: config.heartbeat_interval(),
            broker_addr: config.broker_addr.clone(),
            executor,
        }
    }

    pub fn runner_id(&self) -> &RunnerId {
        &self.info.runner_id
    }

    /// Connect to the broker and run until the connection ends.
    /// Returns on disconnect (caller should handle reconnection).
    pub async fn connect_and_run(&self, shutdown: &CancellationToken) -> Result<(), RunnerError> {
        info!(addr = %self.broker_addr, "Connecting to broker");
        let stream = TcpStream::connect(&self.broker_addr).await?;
        self.run(stream, shutdown).await
    }

    /// Register over `io` and serve offers until the stream closes or
    /// `shutdown` fires. Tasks still executing are cancelled on the way out.
    pub async fn run<T>(&self, io: T, shutdown: &CancellationToken) -> Result<(), RunnerError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let framed = Framed::new(io, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
        let (mut sink, mut inbound) = framed.split();

        sink.send(encode(&RunnerMessage::register(&self.info))?)
            .await?;
        match inbound.next().await {
            Some(line) => match decode::<BrokerMessage>(&line?)? {
                BrokerMessage::Registered { runner_id } => {
                    info!(
                        runner_id = %runner_id,
                        max_concurrency = self.info.max_concurrency,
                        "Registered with broker"
                    );
                }
                BrokerMessage::RegistrationFailed { reason } => {
                    return Err(RunnerError::RegistrationFailed(reason));
                }
                other => {
                    return Err(RunnerError::Protocol(format!(
                        "expected registration reply, got {other:?}"
                    )));
                }
            },
            None => {
                return Err(RunnerError::Protocol(
                    "connection closed during registration".to_string(),
                ));
            }
        }

        // All outbound frames go through one channel so concurrent
        // executions never interleave writes.
        let (tx, mut rx) = mpsc::channel::<RunnerMessage>(64);
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let line = match encode(&message) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Failed to encode frame");
                        continue;
                    }
                };
                if sink.send(line).await.is_err() {
                    break;
                }
            }
        });

        let heartbeat = tokio::spawn(run_heartbeat_loop(
            tx.clone(),
            self.info.runner_id.clone(),
            self.heartbeat_interval,
        ));

        let running: Running = Arc::new(Mutex::new(HashMap::new()));

        let result = loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                line = inbound.next() => line,
            };
            match line {
                None => break Ok(()),
                Some(Err(e)) => break Err(e.into()),
                Some(Ok(line)) => match decode::<BrokerMessage>(&line) {
                    Ok(message) => self.handle_broker_message(message, &tx, &running).await,
                    Err(e) => warn!(error = %e, "Unreadable frame from broker"),
                },
            }
        };

        heartbeat.abort();
        for (task_id, token) in running.lock().await.drain() {
            debug!(task_id = %task_id, "Cancelling task on disconnect");
            token.cancel();
        }
        writer.abort();

        info!("Disconnected from broker");
        result
    }

    async fn handle_broker_message(
        &self,
        message: BrokerMessage,
        tx: &mpsc::Sender<RunnerMessage>,
        running: &Running,
    ) {
        match message {
            BrokerMessage::Offer {
                task_id,
                payload,
                timeout_ms,
            } => {
                info!(
                    task_id = %task_id,
                    task_type = %payload.task_type,
                    timeout_ms = ?timeout_ms,
                    "Received task offer"
                );

                let token = CancellationToken::new();
                let decision = {
                    let mut running = running.lock().await;
                    if running.contains_key(&task_id) {
                        warn!(task_id = %task_id, "Duplicate offer ignored");
                        return;
                    }
                    if running.len() >= self.info.max_concurrency as usize {
                        Err("runner at capacity")
                    } else if !self.info.supports_task_type(&payload.task_type) {
                        Err("unsupported task type")
                    } else {
                        running.insert(task_id.clone(), token.clone());
                        Ok(())
                    }
                };

                let reply = match decision {
                    Ok(()) => RunnerMessage::Accept {
                        task_id: task_id.clone(),
                    },
                    Err(reason) => {
                        warn!(task_id = %task_id, reason, "Rejecting offer");
                        let _ = tx
                            .send(RunnerMessage::Reject {
                                task_id,
                                reason: reason.to_string(),
                            })
                            .await;
                        return;
                    }
                };
                if tx.send(reply).await.is_err() {
                    running.lock().await.remove(&task_id);
                    return;
                }

                tokio::spawn(execute_task(
                    self.executor.clone(),
                    self.guard.clone(),
                    tx.clone(),
                    running.clone(),
                    task_id,
                    payload,
                    token,
                ));
            }
            BrokerMessage::Cancel { task_id, reason } => {
                match running.lock().await.get(&task_id) {
                    Some(token) => {
                        info!(task_id = %task_id, reason = %reason, "Cancelling task");
                        token.cancel();
                    }
                    None => debug!(task_id = %task_id, "Cancel for task not running here"),
                }
            }
            BrokerMessage::Registered { .. } | BrokerMessage::RegistrationFailed { .. } => {
                warn!("Unexpected registration reply");
            }
        }
    }
}

/// Run one accepted task and report how it ended.
async fn execute_task(
    executor: Arc<dyn Executor>,
    guard: ModuleGuard,
    tx: mpsc::Sender<RunnerMessage>,
    running: Running,
    task_id: TaskId,
    payload: TaskPayload,
    cancel: CancellationToken,
) {
    let _ = tx
        .send(RunnerMessage::Started {
            task_id: task_id.clone(),
        })
        .await;

    let request = TaskRequest {
        task_id: task_id.clone(),
        guard: guard.for_task(&payload.allowed_modules),
        payload,
    };
    let result = executor.execute(request, cancel).await;
    running.lock().await.remove(&task_id);

    let message = match result {
        Ok(ExecutionOutcome::Finished(Ok(result))) => {
            info!(task_id = %task_id, "Task succeeded");
            RunnerMessage::Done { task_id, result }
        }
        Ok(ExecutionOutcome::Finished(Err(error))) => {
            info!(task_id = %task_id, error = %error, "Task failed");
            RunnerMessage::Error { task_id, error }
        }
        Ok(ExecutionOutcome::Cancelled) => RunnerMessage::Cancelled { task_id },
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Executor error");
            RunnerMessage::Error {
                task_id,
                error: TaskError::execution(e.to_string()),
            }
        }
    };

    if tx.send(message).await.is_err() {
        warn!("Connection closed before task report could be sent");
    }
}

async fn run_heartbeat_loop(tx: mpsc::Sender<RunnerMessage>, runner_id: RunnerId, interval: Duration) {
    let mut interval_timer = tokio::time::interval(interval);

    loop {
        interval_timer.tick().await;

        let heartbeat = RunnerMessage::Heartbeat {
            runner_id: runner_id.clone(),
        };
        if tx.send(heartbeat).await.is_err() {
            // Channel closed, connection lost
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

    use crate::executor::{ExecutorError, NodeExecutor};

    /// Echoes the input back, or waits for cancellation when the code says so.
    struct EchoExecutor;

    #[async_trait]
    impl Executor for EchoExecutor {
        async fn execute(
            &self,
            request: TaskRequest,
            cancel: CancellationToken,
        ) -> Result<ExecutionOutcome, ExecutorError> {
            if request.payload.code == "hang" {
                cancel.cancelled().await;
                return Ok(ExecutionOutcome::Cancelled);
            }
            Ok(ExecutionOutcome::Finished(Ok(request.payload.input)))
        }
    }

    struct FakeBroker {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        write: WriteHalf<DuplexStream>,
    }

    impl FakeBroker {
        async fn send(&mut self, message: &BrokerMessage) {
            let mut line = encode(message).unwrap();
            line.push('\n');
            self.write.write_all(line.as_bytes()).await.unwrap();
        }

        /// Next frame that is not a heartbeat.
        async fn recv(&mut self) -> RunnerMessage {
            loop {
                let line = self.lines.next_line().await.unwrap().expect("frame");
                let message: RunnerMessage = decode(&line).unwrap();
                if !matches!(message, RunnerMessage::Heartbeat { .. }) {
                    return message;
                }
            }
        }
    }

    fn start(
        executor: Arc<dyn Executor>,
        config: Config,
    ) -> (FakeBroker, tokio::task::JoinHandle<Result<(), RunnerError>>, CancellationToken) {
        let (broker_io, runner_io) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(broker_io);
        let shutdown = CancellationToken::new();
        let connection = RunnerConnection::new(&config, executor);
        let task = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { connection.run(runner_io, &shutdown).await }
        });
        (
            FakeBroker {
                lines: BufReader::new(read).lines(),
                write,
            },
            task,
            shutdown,
        )
    }

    fn config(max_concurrency: u32) -> Config {
        Config {
            runner_id: Some("r1".to_string()),
            max_concurrency,
            ..Config::default()
        }
    }

    async fn register(broker: &mut FakeBroker) {
        assert!(matches!(broker.recv().await, RunnerMessage::Register { .. }));
        broker
            .send(&BrokerMessage::Registered {
                runner_id: RunnerId::new("r1"),
            })
            .await;
    }

    fn offer(task_id: &str, payload: TaskPayload) -> BrokerMessage {
        BrokerMessage::Offer {
            task_id: TaskId::new(task_id),
            payload,
            timeout_ms: None,
        }
    }

    #[tokio::test]
    async fn test_offer_is_accepted_and_reported() {
        let (mut broker, task, shutdown) = start(Arc::new(EchoExecutor), config(1));
        register(&mut broker).await;

        broker
            .send(&offer("t1", TaskPayload::new("x").with_input(json!({ "a": 1 }))))
            .await;
        assert_eq!(
            broker.recv().await,
            RunnerMessage::Accept {
                task_id: TaskId::new("t1")
            }
        );
        assert_eq!(
            broker.recv().await,
            RunnerMessage::Started {
                task_id: TaskId::new("t1")
            }
        );
        assert_eq!(
            broker.recv().await,
            RunnerMessage::Done {
                task_id: TaskId::new("t1"),
                result: json!({ "a": 1 })
            }
        );

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_offer_beyond_capacity_is_rejected() {
        let (mut broker, task, shutdown) = start(Arc::new(EchoExecutor), config(1));
        register(&mut broker).await;

        broker.send(&offer("t1", TaskPayload::new("hang"))).await;
        broker.send(&offer("t2", TaskPayload::new("x"))).await;
        broker
            .send(&offer("t3", TaskPayload::new("x").with_task_type("python")))
            .await;

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(broker.recv().await);
        }
        assert!(seen.contains(&RunnerMessage::Accept {
            task_id: TaskId::new("t1")
        }));
        assert!(seen.contains(&RunnerMessage::Reject {
            task_id: TaskId::new("t2"),
            reason: "runner at capacity".to_string()
        }));
        assert!(seen.iter().any(
            |m| matches!(m, RunnerMessage::Reject { task_id, .. } if task_id.as_str() == "t3")
        ));

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_stops_running_task() {
        let (mut broker, task, shutdown) = start(Arc::new(EchoExecutor), config(2));
        register(&mut broker).await;

        broker.send(&offer("t1", TaskPayload::new("hang"))).await;
        broker.recv().await; // accept
        broker.recv().await; // started
        broker
            .send(&BrokerMessage::Cancel {
                task_id: TaskId::new("t1"),
                reason: "user".to_string(),
            })
            .await;
        assert_eq!(
            broker.recv().await,
            RunnerMessage::Cancelled {
                task_id: TaskId::new("t1")
            }
        );

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disallowed_module_reported_as_error() {
        let config = Config {
            deny_modules: vec!["child_process".to_string()],
            node_path: "/nonexistent/node".to_string(),
            ..config(1)
        };
        let executor = Arc::new(NodeExecutor::new(config.node_path.clone()));
        let (mut broker, task, shutdown) = start(executor, config);
        register(&mut broker).await;

        broker
            .send(&offer(
                "t1",
                TaskPayload::new("const cp = require('node:child_process');"),
            ))
            .await;
        broker.recv().await; // accept
        broker.recv().await; // started
        assert_eq!(
            broker.recv().await,
            RunnerMessage::Error {
                task_id: TaskId::new("t1"),
                error: TaskError::DisallowedModule {
                    module: "node:child_process".to_string()
                }
            }
        );

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_registration_failure_ends_connection() {
        let (mut broker, task, _shutdown) = start(Arc::new(EchoExecutor), config(1));
        assert!(matches!(broker.recv().await, RunnerMessage::Register { .. }));
        broker
            .send(&BrokerMessage::RegistrationFailed {
                reason: "duplicate".to_string(),
            })
            .await;

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, RunnerError::RegistrationFailed(reason) if reason == "duplicate"));
    }
}
