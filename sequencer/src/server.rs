//! Command server
//!
//! Accepts client connections and hands each to its own execution unit task.

use crate::state::SharedState;
use crate::unit::run_unit;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

pub struct Server {
    listener: TcpListener,
    state: SharedState,
}

impl Server {
    /// Bind the configured command port
    pub async fn bind(state: SharedState) -> std::io::Result<Self> {
        let address = format!("{}:{}", state.config.server.bind_address, state.config.server.port);
        let listener = TcpListener::bind(&address).await?;
        tracing::info!(
            "{} command server listening on {}",
            state.config.server.instrument_name,
            listener.local_addr()?
        );
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> std::io::Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Command server shutting down");
                    if self.state.coordinator.current().is_some() {
                        self.state.coordinator.request_abort().await;
                    }
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                tracing::debug!("set_nodelay failed for {}: {}", addr, e);
                            }
                            let state = self.state.clone();
                            tokio::spawn(run_unit(state, stream, addr.to_string()));
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{test_state, TestRig};
    use kestrel_protocol::{framed, Command, Completion, Message};
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpStream;

    /// Send one command and collect every reply up to the completion
    async fn call(addr: SocketAddr, command: Command) -> (Vec<u64>, Completion) {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = framed(stream);
        conn.send(&Message::Command(command)).await.unwrap();

        let mut acks = Vec::new();
        loop {
            match conn.next().await {
                Some(Ok(Message::Acknowledge(ack))) => acks.push(ack.time_to_complete_ms),
                Some(Ok(Message::Completion(done))) => {
                    assert!(conn.next().await.is_none(), "completion must be the last frame");
                    return (acks, done);
                }
                other => panic!("unexpected reply {:?}", other),
            }
        }
    }

    async fn start(rig: &TestRig) -> (SocketAddr, CancellationToken) {
        let server = Server::bind(rig.state.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.run(shutdown.clone()));
        (addr, shutdown)
    }

    #[tokio::test]
    async fn test_unsupported_command_fails_without_killing_server() {
        let rig = test_state();
        let (addr, shutdown) = start(&rig).await;

        let (acks, done) = call(addr, Command::new("u1", "REBOOT", json!(null))).await;
        assert_eq!(done.id, "u1");
        assert!(!done.successful);
        assert_eq!(done.error_number, 1);
        assert_eq!(acks.len(), 1);

        let (_, done) = call(addr, Command::new("s1", "GET_STATUS", json!(null))).await;
        assert!(done.successful, "{}", done.error_string);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_acquire_none_completes_without_exposures() {
        let rig = test_state();
        let (addr, shutdown) = start(&rig).await;

        let (acks, done) = call(addr, Command::new("a1", "ACQUIRE", json!({"mode": "none"}))).await;
        assert!(done.successful, "{}", done.error_string);
        assert_eq!(done.id, "a1");
        assert!(!acks.is_empty());
        assert!(rig.camera.calls().is_empty());
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_config_with_windows_and_binning_is_illegal() {
        let rig = test_state();
        let (addr, shutdown) = start(&rig).await;

        let params = json!({
            "binning": 2,
            "window_flags": 1,
            "windows": [{"x_start": 1, "y_start": 1, "x_end": 100, "y_end": 100}],
            "filter": "SDSS-R"
        });
        let (_, done) = call(addr, Command::new("c1", "CONFIG", params)).await;
        assert!(!done.successful);
        assert_eq!(done.error_number, 811);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_failure_completion() {
        let rig = test_state();
        let (addr, shutdown) = start(&rig).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = framed(stream);
        conn.send(&Message::Completion(Completion::success("x", None))).await.unwrap();
        match conn.next().await {
            Some(Ok(Message::Completion(done))) => {
                assert!(!done.successful);
                assert_eq!(done.error_number, 102);
            }
            other => panic!("unexpected reply {:?}", other),
        }
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_abort_from_second_connection_stops_multrun() {
        let rig = test_state();
        let (addr, shutdown) = start(&rig).await;

        let multrun = tokio::spawn(call(
            addr,
            Command::new("m1", "MULTRUN", json!({"exposure_ms": 60000, "count": 3})),
        ));

        // wait until the multrun owns the device
        for _ in 0..200 {
            if rig.state.coordinator.current().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (_, done) = call(addr, Command::new("ab", "ABORT", json!(null))).await;
        assert!(done.successful, "{}", done.error_string);

        let (_, done) = tokio::time::timeout(Duration::from_secs(10), multrun)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.id, "m1");
        assert!(!done.successful);
        assert_eq!(done.error_number, 1201);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_second_heavy_command_is_refused_while_device_busy() {
        let rig = test_state();
        let (addr, shutdown) = start(&rig).await;

        let multrun = tokio::spawn(call(
            addr,
            Command::new("m1", "MULTRUN", json!({"exposure_ms": 60000, "count": 1})),
        ));
        for _ in 0..200 {
            if rig.state.device.holder().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (_, done) = call(addr, Command::new("b1", "MULTBIAS", json!({"count": 1}))).await;
        assert!(!done.successful);
        assert_eq!(done.error_number, 1304);

        call(addr, Command::new("ab", "ABORT", json!(null))).await;
        let _ = tokio::time::timeout(Duration::from_secs(10), multrun).await;
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_huge_durations_get_a_failed_completion() {
        let rig = test_state();
        let (addr, shutdown) = start(&rig).await;

        let (acks, done) = call(
            addr,
            Command::new("t1", "TWILIGHT_CALIBRATE", json!({"time_to_complete_ms": u64::MAX})),
        )
        .await;
        assert!(acks.is_empty());
        assert!(!done.successful);
        assert_eq!(done.error_number, 2302);

        let (_, done) = call(
            addr,
            Command::new("d1", "MULTDARK", json!({"exposure_ms": u64::MAX, "count": 2})),
        )
        .await;
        assert!(!done.successful);
        assert_eq!(done.error_number, 1402);
        assert!(rig.camera.calls().is_empty());

        // the server is still serving
        let (_, done) = call(addr, Command::new("s1", "GET_STATUS", json!(null))).await;
        assert!(done.successful, "{}", done.error_string);
        shutdown.cancel();
    }
}
