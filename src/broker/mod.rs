//! Connection to the STOMP message broker.
//!
//! One long-lived session subscribes to the shared topic and hands every
//! MESSAGE body to a [`FrameHandler`]. When the session drops unexpectedly
//! exactly one reconnect is attempted after a fixed delay; if that fails
//! the connection stays down until the next [`BrokerConnection::send`] or
//! [`BrokerConnection::connect`].

pub mod destination;
pub mod frame;
pub mod tls;

pub use destination::Destination;
pub use frame::{Frame, HeartBeat, StompCodec};

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::error::{Error, Result};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Subscription id used for the shared topic.
const SUBSCRIPTION_ID: &str = "1";

/// Receives what the broker delivers.
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    /// A MESSAGE frame arrived on `destination`.
    async fn on_message(&self, destination: &str, body: &str);

    /// The broker reported an ERROR frame.
    async fn on_error(&self, frame: &Frame) {
        error!(
            message = frame.get("message").unwrap_or_default(),
            body = %frame.body_text(),
            "broker reported an error"
        );
    }

    /// The session was lost without a local disconnect.
    async fn on_disconnected(&self) {}
}

/// Outbound side of the broker, as seen by callers.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Serialize `body` as JSON and send it. Returns whether the frame was written.
    async fn send(&self, destination: &str, body: &serde_json::Value) -> bool;

    fn is_connected(&self) -> bool;
}

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

type Reader = FramedRead<ReadHalf<Box<dyn Io>>, StompCodec>;
type Writer = Arc<Mutex<FramedWrite<WriteHalf<Box<dyn Io>>, StompCodec>>>;

struct Session {
    writer: Writer,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    fn abort(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

struct Inner {
    config: BrokerConfig,
    handler: Arc<dyn FrameHandler>,
    session: Mutex<Option<Session>>,
    connected: AtomicBool,
    /// Set by a local disconnect; suppresses the reconnect.
    closing: AtomicBool,
    reconnect_pending: AtomicBool,
    /// Bumped per session so a stale reader cannot tear down a newer one.
    generation: AtomicU64,
}

/// Shared handle to the broker session.
#[derive(Clone)]
pub struct BrokerConnection {
    inner: Arc<Inner>,
}

impl BrokerConnection {
    pub fn new(config: BrokerConfig, handler: Arc<dyn FrameHandler>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                handler,
                session: Mutex::new(None),
                connected: AtomicBool::new(false),
                closing: AtomicBool::new(false),
                reconnect_pending: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Open the session and subscribe. A no-op when already connected.
    pub async fn connect(&self) -> bool {
        self.connect_attempt("initial").await
    }

    /// Drop the current session, if any, and open a fresh one.
    pub async fn reconnect(&self) -> bool {
        if let Some(old) = self.inner.session.lock().await.take() {
            self.inner.connected.store(false, Ordering::SeqCst);
            old.abort();
        }
        self.connect_attempt("reconnect").await
    }

    /// Send DISCONNECT and close the session. No reconnect follows.
    pub async fn disconnect(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        let Some(session) = self.inner.session.lock().await.take() else {
            return;
        };
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            let mut writer = session.writer.lock().await;
            if let Err(e) = writer.send(Frame::disconnect("disconnect")).await {
                debug!(error = %e, "DISCONNECT not delivered");
            }
            if let Err(e) = SinkExt::<Frame>::close(&mut *writer).await {
                debug!(error = %e, "broker stream did not close cleanly");
            }
        }
        session.abort();
        info!("disconnected from broker");
    }

    /// Send a JSON body, connecting first if needed.
    pub async fn send(&self, destination: &str, body: &serde_json::Value) -> bool {
        if !self.is_connected() && !self.connect().await {
            warn!(destination, "broker unavailable, message not sent");
            return false;
        }
        let writer = match self.inner.session.lock().await.as_ref() {
            Some(session) => session.writer.clone(),
            None => return false,
        };
        let payload = match serde_json::to_vec(body) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(destination, error = %e, "failed to serialize message");
                return false;
            }
        };
        match writer.lock().await.send(Frame::send(destination, payload)).await {
            Ok(()) => {
                debug!(destination, "message sent");
                true
            }
            Err(e) => {
                error!(destination, error = %e, "failed to send message");
                false
            }
        }
    }

    async fn connect_attempt(&self, attempt: &'static str) -> bool {
        let mut session = self.inner.session.lock().await;
        if self.is_connected() {
            return true;
        }
        if let Some(stale) = session.take() {
            stale.abort();
        }
        self.inner.closing.store(false, Ordering::SeqCst);

        let config = &self.inner.config;
        match self.establish().await {
            Ok(fresh) => {
                *session = Some(fresh);
                metrics::broker_connects().add(
                    1,
                    &[
                        KeyValue::new("result", "ok"),
                        KeyValue::new("attempt", attempt),
                    ],
                );
                true
            }
            Err(e) => {
                error!(
                    host = %config.host,
                    port = config.port,
                    attempt,
                    error = %e,
                    "failed to connect to broker"
                );
                metrics::broker_connects().add(
                    1,
                    &[
                        KeyValue::new("result", "error"),
                        KeyValue::new("attempt", attempt),
                    ],
                );
                false
            }
        }
    }

    async fn establish(&self) -> Result<Session> {
        let config = &self.inner.config;
        let tcp = timeout(
            config.connect_timeout,
            TcpStream::connect((config.host.as_str(), config.port)),
        )
        .await
        .map_err(|_| {
            Error::Broker(format!(
                "timed out connecting to {}:{}",
                config.host, config.port
            ))
        })??;
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(error = %e, "could not disable Nagle on broker socket");
        }

        let stream: Box<dyn Io> = match &config.tls {
            Some(tls_config) => Box::new(tls::connect(tls_config, &config.host, tcp).await?),
            None => Box::new(tcp),
        };
        let (read, write) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read, StompCodec::default());
        let mut writer = FramedWrite::new(write, StompCodec::default());

        writer.send(Frame::connect(config)).await?;
        let reply = timeout(config.connect_timeout, reader.next())
            .await
            .map_err(|_| Error::Broker("timed out waiting for CONNECTED".to_string()))?;
        let connected = match reply {
            Some(Ok(frame)) if frame.command == "CONNECTED" => frame,
            Some(Ok(frame)) if frame.command == "ERROR" => {
                let reason = frame
                    .get("message")
                    .map(str::to_string)
                    .unwrap_or_else(|| frame.body_text());
                return Err(Error::Broker(format!("connection refused: {reason}")));
            }
            Some(Ok(frame)) => {
                return Err(Error::Broker(format!(
                    "unexpected {} frame during handshake",
                    frame.command
                )));
            }
            Some(Err(e)) => return Err(e),
            None => return Err(Error::Broker("closed during handshake".to_string())),
        };

        let topic = Destination::Broadcast(config.topic.clone()).to_string();
        writer.send(Frame::subscribe(&topic, SUBSCRIPTION_ID)).await?;

        let writer: Writer = Arc::new(Mutex::new(writer));
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.connected.store(true, Ordering::SeqCst);

        // The broker is presumed dead after two missed heart-beats.
        let idle_limit =
            frame::negotiate_receive_interval(config.heartbeat, connected.heart_beat())
                .map(|ms| Duration::from_millis(ms * 2));
        let mut tasks = vec![tokio::spawn(
            self.clone().read_loop(reader, generation, idle_limit),
        )];
        if let Some(ms) = frame::negotiate_send_interval(config.heartbeat, connected.heart_beat()) {
            tasks.push(spawn_heart_beats(writer.clone(), Duration::from_millis(ms)));
        }

        info!(
            host = %config.host,
            port = config.port,
            version = connected.get("version").unwrap_or("1.0"),
            destination = %topic,
            "connected to broker"
        );
        Ok(Session { writer, tasks })
    }

    async fn read_loop(self, mut reader: Reader, generation: u64, idle_limit: Option<Duration>) {
        loop {
            let next = match idle_limit {
                Some(limit) => match timeout(limit, reader.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        // Heart-beats are consumed by the codec, so check
                        // when bytes last arrived before giving up.
                        let quiet = reader
                            .decoder()
                            .last_inbound()
                            .is_none_or(|at| at.elapsed() >= limit);
                        if quiet {
                            warn!(
                                idle_ms = limit.as_millis() as u64,
                                "no heart-beat from broker"
                            );
                            break;
                        }
                        continue;
                    }
                },
                None => reader.next().await,
            };
            match next {
                Some(Ok(frame)) => self.dispatch(frame).await,
                Some(Err(e)) => {
                    warn!(error = %e, "broker stream failed");
                    break;
                }
                None => break,
            }
        }
        self.session_lost(generation).await;
    }

    async fn dispatch(&self, frame: Frame) {
        match frame.command.as_str() {
            "MESSAGE" => {
                let destination = frame.get("destination").unwrap_or_default();
                self.inner
                    .handler
                    .on_message(destination, &frame.body_text())
                    .await;
            }
            "ERROR" => self.inner.handler.on_error(&frame).await,
            other => debug!(command = other, "ignoring broker frame"),
        }
    }

    async fn session_lost(&self, generation: u64) {
        if self.inner.generation.load(Ordering::SeqCst) != generation
            || self.inner.closing.load(Ordering::SeqCst)
        {
            return;
        }
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            warn!("broker connection lost");
            self.inner.handler.on_disconnected().await;
            self.schedule_reconnect();
        }
    }

    fn schedule_reconnect(&self) {
        if self.inner.reconnect_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let conn = self.clone();
        let delay = conn.inner.config.reconnect_delay;
        info!(delay_secs = delay.as_secs(), "reconnect scheduled");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            conn.inner.reconnect_pending.store(false, Ordering::SeqCst);
            if conn.inner.closing.load(Ordering::SeqCst) || conn.is_connected() {
                return;
            }
            if conn.connect_attempt("reconnect").await {
                info!("reconnected to broker");
            } else {
                error!("reconnect failed, giving up until the next send");
            }
        });
    }
}

fn spawn_heart_beats(writer: Writer, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = writer.lock().await.send(HeartBeat).await {
                debug!(error = %e, "heart-beat write failed");
                break;
            }
        }
    })
}

#[async_trait]
impl MessageSink for BrokerConnection {
    async fn send(&self, destination: &str, body: &serde_json::Value) -> bool {
        BrokerConnection::send(self, destination, body).await
    }

    fn is_connected(&self) -> bool {
        BrokerConnection::is_connected(self)
    }
}
