//! Peer Gateway
//!
//! Sends one typed request to a peer service (pointing, beam-steering or the
//! reduction pipeline) over a fresh connection and waits for its completion.
//! The wait polls the caller's abort token at a fixed interval, so an abort on
//! another connection releases a blocked caller within one poll period.
//!
//! Transport problems never escape as errors: they come back as a synthetic
//! failed [`Completion`] carrying a peer specific error number.

use crate::config::{PeerEndpoint, PeersConfig};
use async_trait::async_trait;
use kestrel_protocol::peer::PeerCommand;
use kestrel_protocol::{framed, Command, Completion, Message, ProtocolError};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// One of the three cooperating services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerKind {
    Pointing,
    BeamSteering,
    Pipeline,
}

impl PeerKind {
    pub fn name(&self) -> &'static str {
        match self {
            PeerKind::Pointing => "pointing",
            PeerKind::BeamSteering => "beam-steering",
            PeerKind::Pipeline => "pipeline",
        }
    }

    /// Stable index used to keep per-peer error numbers apart
    pub fn index(&self) -> i32 {
        match self {
            PeerKind::Pointing => 0,
            PeerKind::BeamSteering => 1,
            PeerKind::Pipeline => 2,
        }
    }

    /// Base of the numbers used in synthetic completions for this peer
    pub fn failure_base(&self) -> i32 {
        3000 + 100 * self.index()
    }
}

impl fmt::Display for PeerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Transport level failure talking to a peer
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Failed to connect to {address}: {cause}")]
    Connect { address: String, cause: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed before completion")]
    Closed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Aborted while waiting for reply")]
    Aborted,
}

impl PeerError {
    pub fn offset(&self) -> i32 {
        match self {
            PeerError::Connect { .. } => 1,
            PeerError::Transport(_) => 2,
            PeerError::Closed => 3,
            PeerError::Protocol(_) => 4,
            PeerError::Aborted => 5,
        }
    }

    /// Synthetic failed completion standing in for the reply that never came
    pub fn into_completion(self, peer: PeerKind, id: &str) -> Completion {
        Completion::failure(
            id,
            peer.failure_base() + self.offset(),
            format!("{} peer: {}", peer, self),
        )
    }
}

impl From<ProtocolError> for PeerError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => PeerError::Transport(e.to_string()),
            other => PeerError::Protocol(other.to_string()),
        }
    }
}

/// Synchronous request/completion exchange with a peer
#[async_trait]
pub trait PeerGateway: Send + Sync {
    /// Send `command` to `peer` and wait for its completion.
    ///
    /// With `check_abort` set, cancellation of `abort` ends the wait early with
    /// a synthetic failed completion.
    async fn send(
        &self,
        peer: PeerKind,
        command: Command,
        abort: &CancellationToken,
        check_abort: bool,
    ) -> Completion;
}

pub type SharedPeerGateway = Arc<dyn PeerGateway>;

/// Build the wire command for a typed peer request
pub fn peer_command<C: PeerCommand>(request: &C) -> Result<Command, PeerError> {
    let params = serde_json::to_value(request).map_err(|e| PeerError::Protocol(e.to_string()))?;
    Ok(Command::new(uuid::Uuid::new_v4().to_string(), C::KIND, params))
}

/// Gateway talking to real peers over TCP
pub struct TcpPeerGateway {
    config: PeersConfig,
}

impl TcpPeerGateway {
    pub fn new(config: PeersConfig) -> Self {
        Self { config }
    }

    fn endpoint(&self, peer: PeerKind) -> &PeerEndpoint {
        match peer {
            PeerKind::Pointing => &self.config.pointing,
            PeerKind::BeamSteering => &self.config.beam_steering,
            PeerKind::Pipeline => &self.config.pipeline,
        }
    }

    /// Beam-steering can be switched off; the other peers are always used
    fn is_faked(&self, peer: PeerKind) -> bool {
        peer == PeerKind::BeamSteering && !self.config.beam_steering.enabled
    }

    async fn exchange(
        &self,
        peer: PeerKind,
        endpoint: &PeerEndpoint,
        command: &Command,
    ) -> Result<Completion, PeerError> {
        let address = format!("{}:{}", endpoint.address, endpoint.port);
        let stream = TcpStream::connect(&address)
            .await
            .map_err(|e| PeerError::Connect {
                address: address.clone(),
                cause: e.to_string(),
            })?;
        let mut conn = framed(stream);

        tracing::debug!("Sending {} {} to {} peer at {}", command.kind, command.id, peer, address);
        conn.send(&Message::Command(command.clone())).await?;

        loop {
            let message = match conn.next().await {
                Some(message) => message?,
                None => return Err(PeerError::Closed),
            };
            match message {
                Message::Acknowledge(ack) if ack.id == command.id => {
                    tracing::debug!(
                        "{} peer acknowledged {} ({}ms to complete)",
                        peer,
                        command.kind,
                        ack.time_to_complete_ms
                    );
                }
                Message::Completion(done) if done.id == command.id => {
                    if let Err(e) = conn.close().await {
                        tracing::debug!("Closing {} peer connection: {}", peer, e);
                    }
                    return Ok(done);
                }
                other => {
                    return Err(PeerError::Protocol(format!(
                        "unexpected reply with id '{}' to {}",
                        other.id(),
                        command.id
                    )));
                }
            }
        }
    }
}

#[async_trait]
impl PeerGateway for TcpPeerGateway {
    async fn send(
        &self,
        peer: PeerKind,
        command: Command,
        abort: &CancellationToken,
        check_abort: bool,
    ) -> Completion {
        if self.is_faked(peer) {
            tracing::info!("{} peer disabled, faking success for {}", peer, command.kind);
            return Completion::success(command.id, None);
        }

        let endpoint = self.endpoint(peer);
        let exchange = self.exchange(peer, endpoint, &command);
        tokio::pin!(exchange);

        let mut poll = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms.max(1)));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                result = &mut exchange => break result,
                _ = poll.tick() => {
                    if check_abort && abort.is_cancelled() {
                        tracing::warn!("Abandoning {} wait for {} peer: aborted", command.kind, peer);
                        break Err(PeerError::Aborted);
                    }
                }
            }
        };

        match result {
            Ok(done) => {
                if !done.successful {
                    tracing::warn!(
                        "{} peer failed {}: {} ({})",
                        peer,
                        command.kind,
                        done.error_string,
                        done.error_number
                    );
                }
                done
            }
            Err(e) => {
                tracing::error!("{} to {} peer failed: {}", command.kind, peer, e);
                e.into_completion(peer, &command.id)
            }
        }
    }
}
