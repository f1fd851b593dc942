//! Websocket driver for the realtime transport.
//!
//! [`RealtimeClient`] runs the Sans-IO [`Transport`] on a tokio task and
//! performs its actions over a tokio-tungstenite socket. Protocol logic stays
//! in the state machine; this layer only opens sockets, moves text frames and
//! sleeps until the next deadline.
//!
//! Every socket gets an epoch. Signals from a socket that has since been
//! replaced or closed carry a stale epoch and are dropped.

use std::{collections::VecDeque, time::Instant};

use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use parley_core::{
    ConnectFailure, ConnectionState, Environment, EventBus, HandlerError, SubscriptionId,
    Transport, TransportAction, TransportConfig, TransportEvent, TransportEventKind,
};
use parley_proto::Message;
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        self, Message as WsMessage,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, info, warn};

use crate::error::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code reported when the socket ends without a close frame.
const ABNORMAL_CLOSURE: u16 = 1006;

/// Close code reported for a close frame without a status.
const NO_STATUS: u16 = 1005;

const COMMAND_CAPACITY: usize = 64;

type BoxedHandler = Box<dyn FnMut(&TransportEvent) -> Result<(), HandlerError> + Send>;

enum Command {
    SetCredential(String),
    Connect { identity: String, reply: oneshot::Sender<Result<(), ClientError>> },
    Send { message: Message, reply: oneshot::Sender<Result<(), ClientError>> },
    Disconnect { reply: oneshot::Sender<()> },
    Subscribe { kind: TransportEventKind, handler: BoxedHandler, reply: oneshot::Sender<SubscriptionId> },
    Unsubscribe { id: SubscriptionId, reply: oneshot::Sender<bool> },
    State { reply: oneshot::Sender<ConnectionState> },
}

enum Signal {
    Opened { epoch: u64, stream: Box<WsStream> },
    Failed { epoch: u64, failure: ConnectFailure },
    Text { epoch: u64, text: String },
    Closed { epoch: u64, code: u16, reason: String },
}

/// Handle to a running websocket driver.
///
/// Cheap to share behind an `Arc`; every method is a message to the driver
/// task. Dropping the handle stops the driver and closes the socket.
pub struct RealtimeClient {
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl RealtimeClient {
    /// Start a driver on the current tokio runtime.
    ///
    /// Returns the handle and the stream of every transport event. Events are
    /// also dispatched to handlers registered with [`Self::subscribe`].
    pub fn spawn<E>(env: E, config: TransportConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>)
    where
        E: Environment<Instant = Instant>,
    {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();

        let transport = Transport::new(config, env.now(), env.wall_clock_millis());
        let driver = Driver {
            env,
            transport,
            bus: EventBus::new(),
            events: events_tx,
            signals: signals_tx,
            socket: None,
            reader: None,
            epoch: 0,
        };

        let task = tokio::spawn(driver.run(commands_rx, signals_rx));
        (Self { commands: commands_tx, task }, events_rx)
    }

    /// Store the bearer credential used for the next connection.
    pub async fn set_credential(&self, credential: impl Into<String>) -> Result<(), ClientError> {
        self.commands
            .send(Command::SetCredential(credential.into()))
            .await
            .map_err(|_| ClientError::DriverStopped)
    }

    /// Start connecting as `identity`. Returns once the attempt is under way;
    /// watch for [`TransportEvent::Connected`].
    pub async fn connect(&self, identity: impl Into<String>) -> Result<(), ClientError> {
        let identity = identity.into();
        self.request(|reply| Command::Connect { identity, reply }).await?
    }

    /// Send a message, queueing it while offline.
    pub async fn send(&self, message: Message) -> Result<(), ClientError> {
        self.request(|reply| Command::Send { message, reply }).await?
    }

    /// Close the socket, drop queued frames and remove every subscription.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Register a handler for events of `kind`.
    pub async fn subscribe<F>(&self, kind: TransportEventKind, handler: F) -> Result<SubscriptionId, ClientError>
    where
        F: FnMut(&TransportEvent) -> Result<(), HandlerError> + Send + 'static,
    {
        let handler: BoxedHandler = Box::new(handler);
        self.request(|reply| Command::Subscribe { kind, handler, reply }).await
    }

    /// Remove a handler. Returns false if it was not registered.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, ClientError> {
        self.request(|reply| Command::Unsubscribe { id, reply }).await
    }

    /// Current connection state.
    pub async fn state(&self) -> Result<ConnectionState, ClientError> {
        self.request(|reply| Command::State { reply }).await
    }

    /// Stop the driver immediately.
    pub fn shutdown(&self) {
        self.task.abort();
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, ClientError> {
        let (reply, response) = oneshot::channel();
        self.commands.send(command(reply)).await.map_err(|_| ClientError::DriverStopped)?;
        response.await.map_err(|_| ClientError::DriverStopped)
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeClient").field("finished", &self.task.is_finished()).finish()
    }
}

struct Driver<E: Environment<Instant = Instant>> {
    env: E,
    transport: Transport<Instant>,
    bus: EventBus<TransportEvent>,
    events: mpsc::UnboundedSender<TransportEvent>,
    signals: mpsc::UnboundedSender<Signal>,
    socket: Option<SplitSink<WsStream, WsMessage>>,
    reader: Option<JoinHandle<()>>,
    /// Incremented for every socket opened or dropped
    epoch: u64,
}

impl<E: Environment<Instant = Instant>> Driver<E> {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut signals: mpsc::UnboundedReceiver<Signal>) {
        loop {
            let deadline = self.transport.next_deadline();

            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        debug!("all handles dropped, driver stopping");
                        break;
                    };
                    self.handle_command(command).await;
                },
                Some(signal) = signals.recv() => self.handle_signal(signal).await,
                () = sleep_until(deadline) => {
                    let actions = self.transport.tick(self.env.now());
                    self.execute(actions).await;
                },
            }
        }

        let actions = self.transport.disconnect();
        self.execute(actions).await;
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SetCredential(credential) => self.transport.set_credential(credential),
            Command::Connect { identity, reply } => {
                let result = match self.transport.connect(&identity) {
                    Ok(actions) => {
                        self.execute(actions).await;
                        Ok(())
                    },
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            },
            Command::Send { message, reply } => {
                let result = match self.transport.send(&message, self.env.now()) {
                    Ok(actions) => {
                        self.execute(actions).await;
                        Ok(())
                    },
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            },
            Command::Disconnect { reply } => {
                let actions = self.transport.disconnect();
                self.execute(actions).await;
                self.bus.clear();
                let _ = reply.send(());
            },
            Command::Subscribe { kind, handler, reply } => {
                let _ = reply.send(self.bus.subscribe(kind, handler));
            },
            Command::Unsubscribe { id, reply } => {
                let _ = reply.send(self.bus.unsubscribe(id));
            },
            Command::State { reply } => {
                let _ = reply.send(self.transport.state());
            },
        }
    }

    async fn handle_signal(&mut self, signal: Signal) {
        let now = self.env.now();
        let actions = match signal {
            Signal::Opened { epoch, stream } if epoch == self.epoch => {
                let (sink, stream) = (*stream).split();
                self.socket = Some(sink);
                self.reader = Some(tokio::spawn(read_loop(stream, epoch, self.signals.clone())));
                self.transport.handle_opened(now)
            },
            Signal::Failed { epoch, failure } if epoch == self.epoch => {
                self.transport.handle_connect_failed(failure, now)
            },
            Signal::Text { epoch, text } if epoch == self.epoch => self.transport.handle_text(&text, now),
            Signal::Closed { epoch, code, reason } if epoch == self.epoch => {
                self.drop_socket();
                self.transport.handle_closed(code, &reason, now)
            },
            _ => {
                debug!("dropping signal from a stale socket");
                return;
            },
        };
        self.execute(actions).await;
    }

    async fn execute(&mut self, actions: Vec<TransportAction>) {
        let mut pending = VecDeque::from(actions);

        while let Some(action) = pending.pop_front() {
            match action {
                TransportAction::Open { url } => self.open(url),
                TransportAction::Send(text) => {
                    let Some(socket) = self.socket.as_mut() else {
                        warn!("frame dropped, no socket");
                        continue;
                    };
                    if let Err(e) = socket.send(WsMessage::Text(text)).await {
                        warn!(error = %e, "socket write failed");
                        self.drop_socket();
                        pending.extend(self.transport.handle_closed(
                            ABNORMAL_CLOSURE,
                            &e.to_string(),
                            self.env.now(),
                        ));
                    }
                },
                TransportAction::Close { code, reason } => {
                    self.close_socket(code, &reason).await;
                    if self.transport.state() == ConnectionState::Closing {
                        pending.extend(self.transport.handle_closed(code, &reason, self.env.now()));
                    }
                },
                TransportAction::Emit(event) => {
                    let report = self.bus.dispatch(&event);
                    if report.failed + report.panicked > 0 {
                        debug!(?report, "some event handlers failed");
                    }
                    let _ = self.events.send(event);
                },
            }
        }
    }

    fn open(&mut self, url: String) {
        self.drop_socket();
        let epoch = self.epoch;
        let signals = self.signals.clone();
        let timeout = self.transport.config().connect_timeout;

        // the URL carries the credential; never log it
        debug!(epoch, "opening socket");
        tokio::spawn(async move {
            let signal = match tokio::time::timeout(timeout, connect_async(url)).await {
                Ok(Ok((stream, _response))) => Signal::Opened { epoch, stream: Box::new(stream) },
                Ok(Err(e)) => Signal::Failed { epoch, failure: classify(&e) },
                Err(_) => Signal::Failed {
                    epoch,
                    failure: ConnectFailure::Network(format!("connect timed out after {timeout:?}")),
                },
            };
            let _ = signals.send(signal);
        });
    }

    async fn close_socket(&mut self, code: u16, reason: &str) {
        if let Some(mut socket) = self.socket.take() {
            let frame = CloseFrame { code: CloseCode::from(code), reason: reason.to_string().into() };
            if let Err(e) = socket.send(WsMessage::Close(Some(frame))).await {
                debug!(error = %e, "close frame not sent");
            }
            info!(code, "socket closed");
        }
        self.drop_socket();
    }

    /// Forget the current socket; anything it still reports is stale.
    fn drop_socket(&mut self) {
        self.epoch += 1;
        self.socket = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

impl<E: Environment<Instant = Instant>> Drop for Driver<E> {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, epoch: u64, signals: mpsc::UnboundedSender<Signal>) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Text(text)) => {
                if signals.send(Signal::Text { epoch, text }).is_err() {
                    return;
                }
            },
            Ok(WsMessage::Close(frame)) => {
                let (code, reason) = frame.map_or((NO_STATUS, String::new()), |f| {
                    (u16::from(f.code), f.reason.into_owned())
                });
                let _ = signals.send(Signal::Closed { epoch, code, reason });
                return;
            },
            Ok(_) => {},
            Err(e) => {
                let _ = signals.send(Signal::Closed { epoch, code: ABNORMAL_CLOSURE, reason: e.to_string() });
                return;
            },
        }
    }
    let _ = signals.send(Signal::Closed { epoch, code: ABNORMAL_CLOSURE, reason: "stream ended".to_string() });
}

/// 401/403 on the upgrade means the credential was refused.
fn classify(error: &tungstenite::Error) -> ConnectFailure {
    match error {
        tungstenite::Error::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            ConnectFailure::Unauthorized
        },
        other => ConnectFailure::Network(other.to_string()),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}
