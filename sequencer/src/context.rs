//! Per-command execution context
//!
//! A [`UnitContext`] is what a handler sees of the world while it runs: the
//! shared state, the device (leased, or the unleased status view for interrupt
//! commands), its abort token and a way to send progress acknowledgements.

use crate::config::InstrumentConfig;
use crate::device_ops::DeviceOps;
use crate::dispatcher::CommandKind;
use crate::error::SequencerError;
use crate::filenames::ExposureCode;
use crate::peer::{peer_command, PeerError, PeerKind};
use crate::state::InstrumentState;
use chrono::{DateTime, Utc};
use kestrel_protocol::peer::PeerCommand;
use kestrel_protocol::Acknowledge;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Queues progress acknowledgements for the unit to write
#[derive(Clone)]
pub struct Acknowledger {
    id: String,
    tx: mpsc::UnboundedSender<Acknowledge>,
}

impl Acknowledger {
    pub fn channel(id: &str) -> (Self, mpsc::UnboundedReceiver<Acknowledge>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                id: id.to_string(),
                tx,
            },
            rx,
        )
    }

    pub fn send(&self, time_to_complete_ms: u64) {
        let ack = Acknowledge {
            id: self.id.clone(),
            time_to_complete_ms,
        };
        if self.tx.send(ack).is_err() {
            tracing::debug!("Acknowledge for {} dropped, unit already finished", self.id);
        }
    }
}

pub struct UnitContext<'a> {
    pub state: &'a InstrumentState,
    device: &'a dyn DeviceOps,
    command_id: &'a str,
    kind: CommandKind,
    abort: CancellationToken,
    acks: Acknowledger,
}

impl<'a> UnitContext<'a> {
    pub fn new(
        state: &'a InstrumentState,
        device: &'a dyn DeviceOps,
        command_id: &'a str,
        kind: CommandKind,
        abort: CancellationToken,
        acks: Acknowledger,
    ) -> Self {
        Self {
            state,
            device,
            command_id,
            kind,
            abort,
            acks,
        }
    }

    pub fn config(&self) -> &InstrumentConfig {
        &self.state.config
    }

    pub fn device(&self) -> &dyn DeviceOps {
        self.device
    }

    pub fn command_id(&self) -> &str {
        self.command_id
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.state.clock.now()
    }

    pub fn abort_token(&self) -> &CancellationToken {
        &self.abort
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Poll point: fail with [`SequencerError::Aborted`] once an abort was requested
    pub fn check_abort(&self) -> Result<(), SequencerError> {
        if self.abort.is_cancelled() {
            tracing::info!("{} {} noticed abort", self.kind.name(), self.command_id);
            return Err(SequencerError::Aborted);
        }
        Ok(())
    }

    /// Tell the client when to expect the next message
    pub fn acknowledge(&self, time_to_complete_ms: u64) {
        self.acks.send(time_to_complete_ms);
    }

    /// Deadline for one frame: exposure, readout and the acknowledge margin
    pub fn frame_deadline_ms(&self, exposure_ms: u64) -> u64 {
        let server = &self.config().server;
        self.config()
            .detector
            .clamp_exposure_ms(exposure_ms)
            .saturating_add(server.readout_ms)
            .saturating_add(server.acknowledge_margin_ms)
    }

    /// Take one exposure into `path`, with abort checks either side.
    ///
    /// The length is clamped to the detector's configured exposure range.
    pub async fn expose(&self, open_shutter: bool, requested_ms: u64, path: &Path) -> Result<(), SequencerError> {
        self.check_abort()?;
        let duration_ms = self.config().detector.clamp_exposure_ms(requested_ms);
        if duration_ms != requested_ms {
            tracing::warn!("Exposure of {}ms clamped to {}ms", requested_ms, duration_ms);
        }
        tracing::info!(
            "Exposing {}ms ({}) into {}",
            duration_ms,
            if open_shutter { "open" } else { "closed" },
            path.display()
        );
        let paths = [path.to_path_buf()];
        let exposing = self.device.expose(open_shutter, None, duration_ms, &paths);
        tokio::pin!(exposing);

        // The exposure is polled first so it has started before the abort is seen
        let aborted = tokio::select! {
            biased;
            result = &mut exposing => {
                result?;
                false
            }
            _ = self.abort.cancelled() => true,
        };
        if aborted {
            if let Err(e) = self.device.abort_exposure().await {
                tracing::warn!("Failed to abort exposure into {}: {}", path.display(), e);
            }
            if let Err(e) = exposing.await {
                tracing::debug!("Aborted exposure ended with: {}", e);
            }
        }
        self.check_abort()
    }

    /// Send a typed request to a peer, abort-aware
    pub async fn peer<C: PeerCommand + Sync>(&self, peer: PeerKind, request: &C) -> Result<C::Reply, SequencerError> {
        self.send_peer(peer, request, true).await
    }

    /// Send a typed request to a peer even if the command has been aborted
    pub async fn peer_unchecked<C: PeerCommand + Sync>(
        &self,
        peer: PeerKind,
        request: &C,
    ) -> Result<C::Reply, SequencerError> {
        self.send_peer(peer, request, false).await
    }

    async fn send_peer<C: PeerCommand + Sync>(
        &self,
        peer: PeerKind,
        request: &C,
        check_abort: bool,
    ) -> Result<C::Reply, SequencerError> {
        let peer_error = |e: PeerError| SequencerError::Peer {
            peer,
            error_number: peer.failure_base() + e.offset(),
            message: e.to_string(),
        };

        let command = peer_command(request).map_err(peer_error)?;
        let done = self.state.peers.send(peer, command, &self.abort, check_abort).await;
        if !done.successful {
            if check_abort && self.is_aborted() {
                return Err(SequencerError::Aborted);
            }
            return Err(SequencerError::Peer {
                peer,
                error_number: done.error_number,
                message: done.error_string,
            });
        }
        if check_abort {
            self.check_abort()?;
        }
        done.decode_result::<C::Reply>()
            .map_err(|e| peer_error(PeerError::Protocol(e.to_string())))
    }

    /// Start a new multrun
    pub async fn next_multrun(&self) -> u32 {
        let now = self.now();
        self.state.filenames.lock().await.next_multrun(now)
    }

    /// Filename for the next frame in the current multrun
    pub async fn next_filename(&self, code: ExposureCode) -> PathBuf {
        self.state.filenames.lock().await.next_run(code)
    }
}
