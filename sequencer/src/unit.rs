//! Connection Execution Unit
//!
//! Owns one client connection for the lifetime of one command:
//!
//! 1. read the Command
//! 2. resolve it to a handler and send the initial Acknowledge
//! 3. take the device lease and become the current unit (ordinary commands)
//! 4. run the handler, forwarding its progress Acknowledges
//! 5. release the device and send exactly one Completion
//!
//! Handler failures, including panics, become a failed Completion. Nothing that
//! happens here reaches other connections.

use crate::abort::ActiveUnit;
use crate::context::{Acknowledger, UnitContext};
use crate::device_ops::DeviceOps;
use crate::dispatcher::{self, CommandKind, SERVER_ERROR_BASE};
use crate::error::SequencerError;
use crate::state::SharedState;
use futures::FutureExt;
use kestrel_protocol::{framed, Acknowledge, Command, Completion, Message, MessageStream};
use std::panic::AssertUnwindSafe;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Serve one command on `io`
pub async fn run_unit<T>(state: SharedState, io: T, client: String)
where
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let mut conn = framed(io);

    let command = match conn.next().await {
        None => {
            tracing::debug!("{} closed the connection before sending a command", client);
            return;
        }
        Some(Ok(Message::Command(command))) => command,
        Some(Ok(other)) => {
            tracing::warn!("{} sent {:?} instead of a command", client, other);
            let done = Completion::failure(
                other.id(),
                SERVER_ERROR_BASE + 2,
                "Expected a command message",
            );
            finish(&mut conn, done).await;
            return;
        }
        Some(Err(e)) => {
            tracing::warn!("Unreadable command from {}: {}", client, e);
            let done = Completion::failure("", SERVER_ERROR_BASE + 1, format!("Malformed command: {}", e));
            finish(&mut conn, done).await;
            return;
        }
    };

    let unit_id = state.next_unit_id();
    let kind = CommandKind::from_name(&command.kind);
    let span = tracing::info_span!("unit", id = unit_id, kind = kind.name());

    async move {
        tracing::info!("Received {} {} from {}", command.kind, command.id, client);
        if let Some(done) = execute(&state, unit_id, kind, &command, &mut conn).await {
            if done.successful {
                tracing::info!("{} {} completed", command.kind, command.id);
            } else {
                tracing::warn!(
                    "{} {} failed ({}): {}",
                    command.kind,
                    command.id,
                    done.error_number,
                    done.error_string
                );
            }
            finish(&mut conn, done).await;
        }
    }
    .instrument(span)
    .await
}

async fn finish<T>(conn: &mut MessageStream<T>, done: Completion)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = conn.send(&Message::Completion(done)).await {
        tracing::warn!("Failed to send completion: {}", e);
        return;
    }
    if let Err(e) = conn.close().await {
        tracing::debug!("Error closing connection: {}", e);
    }
}

/// Run the command, returning its completion, or `None` if the client vanished
/// before the initial acknowledge could be written
async fn execute<T>(
    state: &SharedState,
    unit_id: u64,
    kind: CommandKind,
    command: &Command,
    conn: &mut MessageStream<T>,
) -> Option<Completion>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let fail = |e: SequencerError| Completion::failure(&command.id, e.error_number(kind), e.to_string());

    let handler = match dispatcher::dispatch(command) {
        Ok(handler) => handler,
        Err(e) => return Some(fail(e)),
    };

    let initial = Acknowledge {
        id: command.id.clone(),
        time_to_complete_ms: handler.initial_ack_ms(&state.config),
    };
    if let Err(e) = conn.send(&Message::Acknowledge(initial)).await {
        tracing::warn!("Client went away before the initial acknowledge: {}", e);
        return None;
    }

    let token = CancellationToken::new();
    let (lease, active) = if kind.is_interrupt() {
        (None, None)
    } else {
        let lease = match state.device.try_lease(&format!("{} {}", kind.name(), command.id)) {
            Ok(lease) => lease,
            Err(e) => return Some(fail(e.into())),
        };
        let active = state.coordinator.register(ActiveUnit {
            unit_id,
            command_id: command.id.clone(),
            kind,
            token: token.clone(),
            started: state.clock.now(),
        });
        (Some(lease), Some(active))
    };

    let (acks, mut ack_rx) = Acknowledger::channel(&command.id);
    let mut client_gone = false;

    let outcome = {
        let device: &dyn DeviceOps = match lease.as_deref() {
            Some(device) => device,
            None => state.device.ops().as_ref(),
        };
        let ctx = UnitContext::new(state, device, &command.id, kind, token, acks);
        let run = AssertUnwindSafe(handler.execute(&ctx)).catch_unwind();
        tokio::pin!(run);

        loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                Some(ack) = ack_rx.recv() => {
                    forward_ack(conn, ack, &mut client_gone).await;
                }
            }
        }
    };

    while let Ok(ack) = ack_rx.try_recv() {
        forward_ack(conn, ack, &mut client_gone).await;
    }

    drop(active);
    drop(lease);

    Some(match outcome {
        Ok(Ok(result)) => Completion::success(&command.id, result),
        Ok(Err(e)) => fail(e),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string());
            tracing::error!("{} handler panicked: {}", kind.name(), message);
            fail(SequencerError::Internal(message))
        }
    })
}

async fn forward_ack<T>(conn: &mut MessageStream<T>, ack: Acknowledge, client_gone: &mut bool)
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    if *client_gone {
        return;
    }
    tracing::debug!("Acknowledge {}: {}ms to complete", ack.id, ack.time_to_complete_ms);
    if let Err(e) = conn.send(&Message::Acknowledge(ack)).await {
        tracing::warn!("Failed to forward acknowledge, client gone: {}", e);
        *client_gone = true;
    }
}
