//! Stream session
//!
//! One session runs the whole pipeline for a single peer: negotiate the
//! data endpoint over the control channel, then stream until cancelled.
//! Progress is published as a [`SessionState`] on a `watch` channel:
//!
//! ```text
//! Idle ──► Negotiating ──► Streaming ──► Stopped
//!               │              │
//!               └──────────────┴───────► Failed(reason)
//! ```
//!
//! The data socket and the media bridge are owned by the task running the
//! session; other tasks only see the state channel.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, TransportMode};
use crate::error::{Error, Result};
use crate::media::{BridgeState, EncoderPreset, MediaBridge, ProcessSpec};
use crate::network::discovery::advertise;
use crate::network::handshake::{connect, ControlListener, Hello, NegotiatedConfig, Offer};
use crate::network::{DatagramReceiver, DatagramSender, FrameSink, PayloadSource, ReceiverStats, SenderStats};

/// Session lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating,
    Streaming,
    Stopped,
    Failed(String),
}

/// How the data phase ended
#[derive(Debug, Clone)]
pub enum StreamOutcome {
    Sent(SenderStats),
    Received(ReceiverStats),
    Bridge(BridgeState),
}

/// Summary of a finished session
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub negotiated: NegotiatedConfig,
    pub outcome: StreamOutcome,
}

/// A single sender or receiver session
pub struct StreamSession {
    config: AppConfig,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
    advertise: bool,
    preview: bool,
}

impl StreamSession {
    pub fn new(config: AppConfig, cancel: CancellationToken) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            config,
            cancel,
            state,
            advertise: true,
            preview: false,
        }
    }

    /// Answer discovery queries while waiting for a receiver (sender side, default on)
    pub fn with_advertise(mut self, advertise: bool) -> Self {
        self.advertise = advertise;
        self
    }

    /// Play an MPEG-TS stream in a local window instead of counting datagrams (receiver side)
    pub fn with_preview(mut self, preview: bool) -> Self {
        self.preview = preview;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SessionState) {
        tracing::debug!(?state, "Session state changed");
        self.state.send_replace(state);
    }

    /// Record `error` as the end of the session and hand it back
    fn fail(&self, error: Error) -> Error {
        match &error {
            Error::Cancelled => self.set_state(SessionState::Stopped),
            e => {
                tracing::error!("Session failed: {}", e);
                self.set_state(SessionState::Failed(e.to_string()));
            }
        }
        error
    }

    /// Offering side: bind the control port, then [`Self::serve`]
    pub async fn run_sender<S: PayloadSource>(&self, source: &mut S) -> Result<SessionReport> {
        let control = &self.config.control;
        let listener = ControlListener::bind(&control.listen_address(), self.offer(), control.handshake_timeout())
            .await
            .map_err(|e| self.fail(e))?;
        self.serve(listener, source).await
    }

    /// Offering side on a bound listener: negotiate with one receiver, then
    /// stream framed datagrams or supervise the encoder
    pub async fn serve<S: PayloadSource>(&self, listener: ControlListener, source: &mut S) -> Result<SessionReport> {
        self.set_state(SessionState::Negotiating);

        let negotiated = {
            let _advertiser = if self.advertise {
                let control_port = listener.local_addr().map_err(|e| self.fail(e))?.port();
                let discovery = &self.config.discovery;
                let name = &self.config.capture.stream_name;
                Some(
                    advertise(discovery, name, &discovery.service_type, control_port, &self.cancel)
                        .map_err(|e| self.fail(e))?,
                )
            } else {
                None
            };

            // Advertising ends with the handshake; one receiver per session
            listener.serve_one(&self.cancel).await.map_err(|e| self.fail(e))?
        };

        self.set_state(SessionState::Streaming);

        let outcome = match negotiated.transport {
            TransportMode::Framed => {
                let sender = DatagramSender::bind(negotiated.receiver_endpoint, &self.config.stream)
                    .map_err(|e| self.fail(e))?;
                StreamOutcome::Sent(sender.run(source, &self.cancel).await)
            }
            TransportMode::MpegTs => {
                let preset = EncoderPreset::resolve(&self.config.media);
                let spec = ProcessSpec::encode(
                    &self.config.media,
                    &self.config.capture,
                    &preset,
                    negotiated.receiver_endpoint,
                );
                StreamOutcome::Bridge(self.supervise(spec).await?)
            }
        };

        self.set_state(SessionState::Stopped);
        Ok(SessionReport { negotiated, outcome })
    }

    /// Requesting side: bind a data socket, then [`Self::receive`]
    pub async fn run_receiver<K: FrameSink>(&self, peer: SocketAddr, sink: &mut K) -> Result<SessionReport> {
        // Bound before the handshake so the proposed port is known to be ours
        let receiver = DatagramReceiver::bind_available(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            self.config.stream.data_port,
            &self.config.stream,
        )
        .map_err(|e| self.fail(e))?;
        self.receive(receiver, peer, sink).await
    }

    /// Requesting side on a bound data socket: propose its address to
    /// `peer`, then run the receive loop or the preview player
    pub async fn receive<K: FrameSink>(
        &self,
        mut receiver: DatagramReceiver,
        peer: SocketAddr,
        sink: &mut K,
    ) -> Result<SessionReport> {
        self.set_state(SessionState::Negotiating);

        let local = receiver.local_addr().map_err(|e| self.fail(e))?;

        let hello = Hello {
            name: self.config.capture.stream_name.clone(),
            proposed_endpoint: Some(local),
        };
        let negotiated = connect(peer, hello, &self.config.control, &self.cancel)
            .await
            .map_err(|e| self.fail(e))?;

        self.set_state(SessionState::Streaming);

        let outcome = match (negotiated.transport, self.preview) {
            (TransportMode::MpegTs, true) => {
                // The player takes over the port
                drop(receiver);
                let spec = ProcessSpec::preview_endpoint(&self.config.media, local);
                StreamOutcome::Bridge(self.supervise(spec).await?)
            }
            (transport, preview) => {
                if preview {
                    tracing::warn!("Preview needs an MPEG-TS stream, sender offers {}", transport);
                }
                receiver.set_transport(transport);
                StreamOutcome::Received(receiver.run(sink, &self.cancel).await.map_err(|e| self.fail(e))?)
            }
        };

        self.set_state(SessionState::Stopped);
        Ok(SessionReport { negotiated, outcome })
    }

    /// Run a bridge until it exits or the session is cancelled
    async fn supervise(&self, spec: ProcessSpec) -> Result<BridgeState> {
        let mut bridge = MediaBridge::start(&spec).map_err(|e| self.fail(e))?;

        let exited = tokio::select! {
            state = bridge.wait() => state,
            _ = self.cancel.cancelled() => {
                let state = bridge.stop(self.config.media.grace_period()).await;
                tracing::info!(?state, "Media bridge stopped");
                return Ok(state);
            }
        };

        if exited.is_success() {
            Ok(exited)
        } else {
            Err(self.fail(Error::Bridge {
                program: bridge.program().to_string(),
                state: format!("{:?}", exited),
            }))
        }
    }

    fn offer(&self) -> Offer {
        Offer {
            name: self.config.capture.stream_name.clone(),
            data_port: self.config.stream.data_port,
            transport: self.config.media.transport,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{ReceivedFrame, ZeroPayload};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn loopback_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.control.bind_address = "127.0.0.1".to_string();
        config.control.port = 0;
        config.stream.data_port = 0;
        config.stream.send_interval_ms = 5;
        config.stream.payload_size = 32;
        config
    }

    async fn bound_listener(config: &AppConfig) -> ControlListener {
        let offer = Offer {
            name: config.capture.stream_name.clone(),
            data_port: config.stream.data_port,
            transport: config.media.transport,
        };
        ControlListener::bind(&config.control.listen_address(), offer, config.control.handshake_timeout())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_framed_session_end_to_end() {
        let cancel = CancellationToken::new();
        let config = loopback_config();

        let listener = bound_listener(&config).await;
        let control_addr = listener.local_addr().unwrap();

        let sender = StreamSession::new(config.clone(), cancel.clone()).with_advertise(false);
        let mut sender_states = sender.subscribe();
        let sender_task = tokio::spawn(async move {
            let mut source = ZeroPayload::new(32);
            let report = sender.serve(listener, &mut source).await;
            (report, sender.state())
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<ReceivedFrame>();
        let receiver = StreamSession::new(config, cancel.clone());
        let receiver_task = tokio::spawn(async move {
            let mut sink = tx;
            let report = receiver.run_receiver(control_addr, &mut sink).await;
            (report, receiver.state())
        });

        for expected in 0..5u32 {
            let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            assert_eq!(frame.sequence, expected);
            assert_eq!(frame.payload_len(), 32);
        }
        assert_eq!(*sender_states.borrow_and_update(), SessionState::Streaming);

        cancel.cancel();
        let (sender_report, sender_state) = sender_task.await.unwrap();
        let (receiver_report, receiver_state) = receiver_task.await.unwrap();
        assert_eq!(sender_state, SessionState::Stopped);
        assert_eq!(receiver_state, SessionState::Stopped);

        let sender_report = sender_report.unwrap();
        let receiver_report = receiver_report.unwrap();
        assert_eq!(sender_report.negotiated.session_id, receiver_report.negotiated.session_id);
        assert_eq!(sender_report.negotiated.receiver_endpoint, receiver_report.negotiated.receiver_endpoint);

        match (sender_report.outcome, receiver_report.outcome) {
            (StreamOutcome::Sent(sent), StreamOutcome::Received(received)) => {
                assert!(sent.packets_sent >= 5);
                assert!(received.packets_received >= 5);
                assert_eq!(received.invalid_packets, 0);
            }
            other => panic!("unexpected outcomes: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_sender_fails_session() {
        let refused = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };

        let session = StreamSession::new(loopback_config(), CancellationToken::new());
        let mut sink = |_frame: ReceivedFrame| {};
        let result = session.run_receiver(refused, &mut sink).await;

        assert!(matches!(result, Err(Error::Handshake(_))), "{:?}", result.err());
        assert!(matches!(session.state(), SessionState::Failed(_)));
    }

    #[tokio::test]
    async fn test_cancel_while_negotiating_stops() {
        let cancel = CancellationToken::new();
        let session = StreamSession::new(loopback_config(), cancel.clone()).with_advertise(false);

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(Duration::from_secs(1), session.run_sender(&mut ZeroPayload::new(8)))
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_receive_error_fails_session() {
        let cancel = CancellationToken::new();
        let config = loopback_config();

        let listener = bound_listener(&config).await;
        let control_addr = listener.local_addr().unwrap();
        let serve_cancel = cancel.clone();
        let offering = tokio::spawn(async move { listener.serve_one(&serve_cancel).await });

        // A listening stream socket behind the datagram API: it turns readable
        // on an incoming connection and every receive then fails with ENOTCONN
        let broken = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None).unwrap();
        broken.bind(&"127.0.0.1:0".parse::<SocketAddr>().unwrap().into()).unwrap();
        broken.listen(8).unwrap();
        broken.set_nonblocking(true).unwrap();
        let data_addr = broken.local_addr().unwrap().as_socket().unwrap();
        let socket = crate::network::UdpSocket::from_std(broken.into()).unwrap();
        let receiver = DatagramReceiver::new(socket, TransportMode::Framed);

        let session = StreamSession::new(config, cancel.clone());
        let receiving = tokio::spawn(async move {
            let mut sink = |_frame: ReceivedFrame| {};
            let result = session.receive(receiver, control_addr, &mut sink).await;
            (result, session.state())
        });

        let negotiated = offering.await.unwrap().unwrap();
        assert_eq!(negotiated.receiver_endpoint, data_addr);

        let _trigger = tokio::net::TcpStream::connect(data_addr).await.unwrap();
        let (result, state) = tokio::time::timeout(Duration::from_secs(5), receiving)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(result, Err(Error::Transport(_))), "{:?}", result.err());
        assert!(matches!(state, SessionState::Failed(_)), "{:?}", state);
    }

    /// Sender session configured for MPEG-TS with `encoder` standing in for ffmpeg
    async fn run_mpegts_sender(encoder: &str) -> (Result<SessionReport>, SessionState) {
        let mut config = loopback_config();
        config.media.transport = TransportMode::MpegTs;
        config.media.ffmpeg_path = encoder.to_string();

        let cancel = CancellationToken::new();
        let listener = bound_listener(&config).await;
        let control_addr = listener.local_addr().unwrap();
        let control = config.control.clone();

        let sender = StreamSession::new(config, cancel.clone()).with_advertise(false);
        let task = tokio::spawn(async move {
            let report = sender.serve(listener, &mut ZeroPayload::new(8)).await;
            (report, sender.state())
        });

        let hello = Hello {
            name: "test".to_string(),
            proposed_endpoint: Some("127.0.0.1:5999".parse().unwrap()),
        };
        let negotiated = connect(control_addr, hello, &control, &cancel).await.unwrap();
        assert_eq!(negotiated.transport, TransportMode::MpegTs);

        tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_missing_encoder_fails_session() {
        let (result, state) = run_mpegts_sender("openndi-missing-ffmpeg").await;
        assert!(matches!(result, Err(Error::DependencyMissing { .. })), "{:?}", result.err());
        assert!(matches!(state, SessionState::Failed(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_encoder_failure_ends_session_only() {
        // `false` ignores its arguments and exits 1
        let (result, state) = run_mpegts_sender("false").await;
        assert!(matches!(result, Err(Error::Bridge { .. })), "{:?}", result.err());
        assert!(matches!(state, SessionState::Failed(_)));
    }
}
