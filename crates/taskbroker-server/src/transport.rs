//! Runner connections.
//!
//! Runners connect over TCP and speak newline-delimited JSON (see
//! [`taskbroker_core::protocol`]). Each connection is served by one task
//! that forwards the broker's messages for that runner onto the wire and
//! turns incoming frames into broker calls. When the connection ends, for
//! whatever reason, the runner is deregistered.

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskbroker_core::protocol::{decode, encode};
use taskbroker_core::{
    BrokerMessage, RunnerId, RunnerInfo, RunnerMessage, TaskError, TaskRejectError,
};

use crate::broker::Broker;
use crate::error::TransportError;

/// Longest accepted frame. Task payloads carry user code and input items.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Accept runner connections until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    broker: Broker,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    info!(addr = %listener.local_addr()?, "Listening for runners");

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted?,
        };
        debug!(peer = %peer, "Runner connection opened");

        let broker = broker.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, broker, shutdown).await {
                warn!(peer = %peer, error = %e, "Runner connection failed");
            }
        });
    }

    Ok(())
}

/// Serve one runner connection to completion.
pub async fn handle_connection<T>(
    io: T,
    broker: Broker,
    shutdown: CancellationToken,
) -> Result<(), TransportError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let framed = Framed::new(io, LinesCodec::new_with_max_length(MAX_FRAME_LENGTH));
    let (mut sink, mut stream) = framed.split();

    let info = match stream.next().await {
        Some(line) => registration(&line?)?,
        None => return Ok(()),
    };

    let handle = match broker.register(info).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(error = %e, "Runner registration refused");
            send(
                &mut sink,
                &BrokerMessage::RegistrationFailed {
                    reason: e.to_string(),
                },
            )
            .await?;
            return Ok(());
        }
    };
    let runner_id = handle.runner_id;
    let mut inbox = handle.rx;

    let result = async {
        send(
            &mut sink,
            &BrokerMessage::Registered {
                runner_id: runner_id.clone(),
            },
        )
        .await?;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                outbound = inbox.recv() => match outbound {
                    Some(message) => send(&mut sink, &message).await?,
                    None => break,
                },
                inbound = stream.next() => match inbound {
                    Some(line) => {
                        let line = line?;
                        match decode::<RunnerMessage>(&line) {
                            Ok(message) => {
                                if let Some(reply) = dispatch(&broker, &runner_id, message).await {
                                    send(&mut sink, &reply).await?;
                                }
                            }
                            Err(e) => warn!(runner_id = %runner_id, error = %e, "Unreadable frame"),
                        }
                    }
                    None => break,
                },
            }
        }
        Ok::<_, TransportError>(())
    }
    .await;

    info!(runner_id = %runner_id, "Runner disconnected");
    broker.deregister(&runner_id).await;
    result
}

fn registration(line: &str) -> Result<RunnerInfo, TransportError> {
    match decode::<RunnerMessage>(line)? {
        RunnerMessage::Register {
            runner_id,
            name,
            task_types,
            max_concurrency,
        } => Ok(RunnerInfo::new(runner_id, max_concurrency)
            .with_name(name)
            .with_task_types(task_types)),
        other => Err(TransportError::Protocol(format!(
            "expected register as first frame, got {other:?}"
        ))),
    }
}

/// Apply one runner frame. Returns a message to send back, if any.
async fn dispatch(
    broker: &Broker,
    runner_id: &RunnerId,
    message: RunnerMessage,
) -> Option<BrokerMessage> {
    let (task_id, result) = match message {
        RunnerMessage::Register { .. } => {
            warn!(runner_id = %runner_id, "Ignoring repeated register");
            return None;
        }
        RunnerMessage::Heartbeat { runner_id: claimed } => {
            if claimed != *runner_id {
                warn!(runner_id = %runner_id, claimed = %claimed, "Heartbeat names another runner");
            }
            broker.heartbeat(runner_id).await;
            return None;
        }
        RunnerMessage::Accept { task_id } => {
            if let Err(e) = broker.accept(runner_id, &task_id).await {
                // The offer expired or was cancelled; make the runner drop it.
                warn!(task_id = %task_id, runner_id = %runner_id, error = %e, "Late accept");
                return Some(BrokerMessage::Cancel {
                    task_id,
                    reason: "offer withdrawn".to_string(),
                });
            }
            return None;
        }
        RunnerMessage::Reject { task_id, reason } => {
            let result = broker
                .reject(runner_id, &task_id, TaskRejectError::new(reason))
                .await;
            (task_id, result)
        }
        RunnerMessage::Started { task_id } => {
            let result = broker.report_progress(runner_id, &task_id).await;
            (task_id, result)
        }
        RunnerMessage::Done { task_id, result } => {
            let result = broker.complete(runner_id, &task_id, Ok(result)).await;
            (task_id, result)
        }
        RunnerMessage::Error { task_id, error } => {
            let result = broker
                .complete(runner_id, &task_id, Err::<serde_json::Value, TaskError>(error))
                .await;
            (task_id, result)
        }
        RunnerMessage::Cancelled { task_id } => {
            let result = broker.cancel_ack(runner_id, &task_id).await;
            (task_id, result)
        }
    };

    if let Err(e) = result {
        // Reports for tasks that already moved on (timeout, cancel) land here.
        debug!(task_id = %task_id, runner_id = %runner_id, error = %e, "Runner report ignored");
    }
    None
}

async fn send<S>(sink: &mut S, message: &BrokerMessage) -> Result<(), TransportError>
where
    S: Sink<String, Error = LinesCodecError> + Unpin,
{
    sink.send(encode(message)?).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use taskbroker_core::{TaskPayload, TaskStatus};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    async fn write_line(io: &mut (impl AsyncWrite + Unpin), message: &RunnerMessage) {
        let mut line = encode(message).unwrap();
        line.push('\n');
        io.write_all(line.as_bytes()).await.unwrap();
    }

    async fn read_message<R: AsyncRead + Unpin>(lines: &mut tokio::io::Lines<BufReader<R>>) -> BrokerMessage {
        let line = lines.next_line().await.unwrap().unwrap();
        decode(&line).unwrap()
    }

    #[tokio::test]
    async fn test_register_offer_and_disconnect() {
        let (broker, _events) = Broker::new(Config::default());
        let (client, server) = tokio::io::duplex(64 * 1024);
        let conn = tokio::spawn(handle_connection(
            server,
            broker.clone(),
            CancellationToken::new(),
        ));

        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();
        let info = RunnerInfo::new(RunnerId::new("r1"), 1);
        write_line(&mut write, &RunnerMessage::register(&info)).await;
        assert_eq!(
            read_message(&mut lines).await,
            BrokerMessage::Registered {
                runner_id: RunnerId::new("r1")
            }
        );

        let task_id = broker
            .submit("exec", TaskPayload::new("return 1"), None)
            .await
            .unwrap();
        let BrokerMessage::Offer { task_id: offered, .. } = read_message(&mut lines).await else {
            panic!("expected offer");
        };
        assert_eq!(offered, task_id);

        write_line(&mut write, &RunnerMessage::Accept { task_id: task_id.clone() }).await;
        write_line(&mut write, &RunnerMessage::Started { task_id: task_id.clone() }).await;

        drop(write);
        drop(lines);
        conn.await.unwrap().unwrap();

        assert!(broker.runners().await.is_empty());
        let task = broker.task(&task_id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_refused() {
        let (broker, _events) = Broker::new(Config::default());
        let _existing = broker
            .register(RunnerInfo::new(RunnerId::new("r1"), 1))
            .await
            .unwrap();

        let (client, server) = tokio::io::duplex(4096);
        let conn = tokio::spawn(handle_connection(
            server,
            broker.clone(),
            CancellationToken::new(),
        ));
        let (read, mut write) = tokio::io::split(client);
        let mut lines = BufReader::new(read).lines();
        write_line(
            &mut write,
            &RunnerMessage::register(&RunnerInfo::new(RunnerId::new("r1"), 1)),
        )
        .await;

        assert!(matches!(
            read_message(&mut lines).await,
            BrokerMessage::RegistrationFailed { .. }
        ));
        conn.await.unwrap().unwrap();
        assert_eq!(broker.runners().await.len(), 1);
    }
}
