//! Connection handle.
//!
//! A [`Client`] is a cheap, cloneable handle to one logical connection. The
//! connection itself is owned by a [`ClientDriver`] task which dials through a
//! [`Connector`], reconnects with the [`ResiliencePolicy`] backoff, queues
//! requests while offline and publishes [`ClientEvent`]s.
//!
//! ## States
//!
//! ```text
//! connecting -> connect -> ready
//!     ^                      |
//!     |                      v
//!     +---- reconnecting <---+        (any state) -> end
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::commands::{self, Commands};
use crate::config::ConnectionOptions;
use crate::error::ClientError;
use crate::policy::ResiliencePolicy;
use crate::resp::{Command, Value};
use crate::transport::{Connector, Transport};

/// Capacity of the per-client event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Connection state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Dialing the server.
    Connecting,
    /// Transport established.
    Connected,
    /// Accepting requests.
    Ready,
    /// Waiting out the backoff delay before the next dial.
    Reconnecting,
    /// Terminal. The handle accepts no more requests.
    End,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Connected => "connect",
            Self::Ready => "ready",
            Self::Reconnecting => "reconnecting",
            Self::End => "end",
        };
        f.write_str(s)
    }
}

/// Lifecycle events published by a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connect,
    Ready,
    Error(String),
    Close,
    Reconnecting { attempt: u32, delay: Duration },
    End,
}

struct Pending {
    cmd: Command,
    retries: u32,
    reply: oneshot::Sender<Result<Value, ClientError>>,
}

impl Pending {
    fn respond(self, result: Result<Value, ClientError>) {
        // The caller may have stopped waiting.
        let _ = self.reply.send(result);
    }
}

enum Request {
    Command(Pending),
    Quit(oneshot::Sender<Result<(), ClientError>>),
    Disconnect(oneshot::Sender<()>),
}

/// Why the driver stops.
enum Stop {
    /// Outcome of the `QUIT` exchange, `Ok` when none took place.
    Quit(Result<(), ClientError>),
    Disconnect(oneshot::Sender<()>),
    /// Every handle was dropped.
    Dropped,
}

/// Outcome of a phase of the driver loop.
enum Phase {
    Continue,
    Stop(Stop),
}

struct ClientInner {
    id: Uuid,
    name: String,
    options: ConnectionOptions,
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
}

/// Handle to one named connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("address", &self.inner.options.address())
            .field("state", &self.state())
            .finish()
    }
}

impl Client {
    /// Create a handle and the driver that owns its connection.
    ///
    /// Nothing happens on the wire until the driver is spawned, so observers
    /// can subscribe first without missing events.
    pub(crate) fn new(
        name: impl Into<String>,
        options: ConnectionOptions,
        policy: ResiliencePolicy,
        connector: Arc<dyn Connector>,
    ) -> (Self, ClientDriver) {
        let name = name.into();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let client = Self {
            inner: Arc::new(ClientInner {
                id: Uuid::new_v4(),
                name: name.clone(),
                options: options.clone(),
                requests: request_tx,
                state: state_rx,
                events: events.clone(),
            }),
        };

        let driver = ClientDriver {
            name,
            options,
            policy,
            connector,
            requests: request_rx,
            state: state_tx,
            events,
            queue: VecDeque::new(),
            quitting: Vec::new(),
        };

        (client, driver)
    }

    /// Unique id of this handle.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Logical name the handle is registered under.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Whether `operation` is a command this handle can forward.
    pub fn supports(&self, operation: &str) -> bool {
        commands::is_supported(operation)
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Wait until the handle is ready for requests.
    ///
    /// Fails with [`ClientError::Ended`] if the handle ends first.
    pub async fn ready(&self) -> Result<(), ClientError> {
        let mut state = self.inner.state.clone();
        let reached = state
            .wait_for(|s| matches!(s, ConnectionState::Ready | ConnectionState::End))
            .await
            .map(|s| *s);
        match reached {
            Ok(ConnectionState::Ready) => Ok(()),
            _ => Err(ClientError::Ended),
        }
    }

    /// Send a raw command and wait for its reply.
    ///
    /// While the connection is down the command waits in the offline queue.
    pub async fn send_command(&self, cmd: Command) -> Result<Value, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.inner
            .requests
            .send(Request::Command(Pending {
                cmd,
                retries: 0,
                reply,
            }))
            .map_err(|_| ClientError::Ended)?;
        rx.await.map_err(|_| ClientError::Ended)?
    }

    /// Close gracefully.
    ///
    /// Requests submitted earlier finish first, then `QUIT` is sent and the
    /// handle ends. While offline the quit waits behind queued requests until
    /// they are delivered or run out of retries; with nothing queued the
    /// handle ends without dialing again. Commands submitted after a quit
    /// fail with [`ClientError::ConnectionClosed`]. Quitting an ended handle
    /// is a no-op.
    pub async fn quit(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        if self.inner.requests.send(Request::Quit(reply)).is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }

    /// Close immediately without `QUIT`.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.inner.requests.send(Request::Disconnect(reply)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Task owning the connection of one [`Client`].
pub struct ClientDriver {
    name: String,
    options: ConnectionOptions,
    policy: ResiliencePolicy,
    connector: Arc<dyn Connector>,
    requests: mpsc::UnboundedReceiver<Request>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ClientEvent>,
    queue: VecDeque<Pending>,
    /// Callers waiting on `quit`. Once set, the driver stops as soon as the
    /// queue is empty and accepts no new commands.
    quitting: Vec<oneshot::Sender<Result<(), ClientError>>>,
}

impl ClientDriver {
    /// Drive the connection until the handle ends.
    #[instrument(skip_all, fields(connection = %self.name))]
    pub async fn run(mut self) {
        let mut attempt = 0u32;

        let stop = loop {
            self.set_state(ConnectionState::Connecting);

            let connector = Arc::clone(&self.connector);
            let options = self.options.clone();
            let connect = async move { connector.connect(&options).await };
            tokio::pin!(connect);

            let connected = loop {
                tokio::select! {
                    biased;
                    result = &mut connect => break Ok(result),
                    request = self.requests.recv() => {
                        if let Phase::Stop(stop) = self.accept_offline(request) {
                            break Err(stop);
                        }
                    }
                }
            };

            match connected {
                Err(stop) => break stop,
                Ok(Ok(transport)) => {
                    attempt = 0;
                    self.set_state(ConnectionState::Connected);
                    self.emit(ClientEvent::Connect);
                    self.set_state(ConnectionState::Ready);
                    self.emit(ClientEvent::Ready);

                    match self.serve(transport).await {
                        Ok(stop) => break stop,
                        Err(error) => {
                            warn!(error = %error, "Connection lost");
                            self.emit(ClientEvent::Error(error.to_string()));
                            self.emit(ClientEvent::Close);
                        }
                    }
                }
                Ok(Err(error)) => {
                    debug!(error = %error, "Connection attempt failed");
                    self.emit(ClientEvent::Error(error.to_string()));
                    self.emit(ClientEvent::Close);
                    self.charge_queued_requests();
                }
            }

            if let Phase::Stop(stop) = self.quit_if_idle() {
                break stop;
            }

            attempt = attempt.saturating_add(1);
            if let Phase::Stop(stop) = self.wait_before_reconnect(attempt).await {
                break stop;
            }
        };

        self.finish(stop);
    }

    /// Serve requests on an open transport.
    ///
    /// Returns `Err` when the connection is lost; the failed request is back
    /// in the queue unless its retries ran out.
    async fn serve(&mut self, mut transport: Box<dyn Transport>) -> Result<Stop, ClientError> {
        while let Some(pending) = self.queue.pop_front() {
            self.execute(transport.as_mut(), pending).await?;
        }
        if !self.quitting.is_empty() {
            return Ok(self.send_quit(transport.as_mut()).await);
        }

        loop {
            match self.requests.recv().await {
                Some(Request::Command(pending)) => {
                    self.execute(transport.as_mut(), pending).await?;
                }
                Some(Request::Quit(reply)) => {
                    self.quitting.push(reply);
                    return Ok(self.send_quit(transport.as_mut()).await);
                }
                Some(Request::Disconnect(reply)) => {
                    close_quietly(transport.as_mut()).await;
                    self.emit(ClientEvent::Close);
                    return Ok(Stop::Disconnect(reply));
                }
                None => {
                    close_quietly(transport.as_mut()).await;
                    self.emit(ClientEvent::Close);
                    return Ok(Stop::Dropped);
                }
            }
        }
    }

    async fn send_quit(&mut self, transport: &mut dyn Transport) -> Stop {
        let result = match transport.request(Command::new("QUIT")).await {
            Ok(Value::Error(message)) => Err(ClientError::Server(message)),
            Ok(_) => Ok(()),
            Err(error) => Err(error),
        };
        close_quietly(transport).await;
        self.emit(ClientEvent::Close);
        Stop::Quit(result)
    }

    async fn execute(
        &mut self,
        transport: &mut dyn Transport,
        mut pending: Pending,
    ) -> Result<(), ClientError> {
        match transport.request(pending.cmd.clone()).await {
            Ok(Value::Error(message)) => pending.respond(Err(ClientError::Server(message))),
            Ok(value) => pending.respond(Ok(value)),
            Err(error) if error.is_retryable() => {
                pending.retries += 1;
                if self.policy.retries_exhausted(pending.retries) {
                    let attempts = pending.retries;
                    pending.respond(Err(ClientError::MaxRetriesExceeded { attempts }));
                } else {
                    self.queue.push_front(pending);
                }
                return Err(error);
            }
            Err(error) => pending.respond(Err(error)),
        }
        Ok(())
    }

    /// Sleep out the backoff delay while still taking requests.
    async fn wait_before_reconnect(&mut self, attempt: u32) -> Phase {
        let delay = self.policy.reconnect_delay(attempt);
        self.set_state(ConnectionState::Reconnecting);
        self.emit(ClientEvent::Reconnecting { attempt, delay });
        debug!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return Phase::Continue,
                request = self.requests.recv() => {
                    if let Phase::Stop(stop) = self.accept_offline(request) {
                        return Phase::Stop(stop);
                    }
                }
            }
        }
    }

    /// Handle a request that arrived while the connection is down.
    fn accept_offline(&mut self, request: Option<Request>) -> Phase {
        match request {
            Some(Request::Command(pending)) => {
                if self.policy.offline_queue && self.quitting.is_empty() {
                    self.queue.push_back(pending);
                } else {
                    pending.respond(Err(ClientError::ConnectionClosed));
                }
                Phase::Continue
            }
            Some(Request::Quit(reply)) => {
                self.quitting.push(reply);
                self.quit_if_idle()
            }
            Some(Request::Disconnect(reply)) => Phase::Stop(Stop::Disconnect(reply)),
            None => Phase::Stop(Stop::Dropped),
        }
    }

    /// Stop if a quit is pending and nothing is left to deliver before it.
    fn quit_if_idle(&self) -> Phase {
        if !self.quitting.is_empty() && self.queue.is_empty() {
            Phase::Stop(Stop::Quit(Ok(())))
        } else {
            Phase::Continue
        }
    }

    /// Count a failed connection attempt against every queued request.
    fn charge_queued_requests(&mut self) {
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for mut pending in self.queue.drain(..) {
            pending.retries += 1;
            if self.policy.retries_exhausted(pending.retries) {
                let attempts = pending.retries;
                pending.respond(Err(ClientError::MaxRetriesExceeded { attempts }));
            } else {
                kept.push_back(pending);
            }
        }
        self.queue = kept;
    }

    fn finish(mut self, stop: Stop) {
        for pending in self.queue.drain(..) {
            pending.respond(Err(ClientError::ConnectionClosed));
        }
        self.set_state(ConnectionState::End);
        self.emit(ClientEvent::End);
        debug!("Connection ended");

        let mut quit_result = match stop {
            Stop::Quit(result) => Some(result),
            Stop::Disconnect(reply) => {
                let _ = reply.send(());
                None
            }
            Stop::Dropped => None,
        };
        // The first caller gets the outcome of the exchange.
        for reply in self.quitting.drain(..) {
            let _ = reply.send(quit_result.take().unwrap_or(Ok(())));
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: ClientEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

async fn close_quietly(transport: &mut dyn Transport) {
    if let Err(error) = transport.close().await {
        debug!(error = %error, "Error closing transport");
    }
}

#[async_trait]
impl Commands for Client {
    type Error = ClientError;

    async fn send_command(&self, cmd: Command) -> Result<Value, ClientError> {
        Client::send_command(self, cmd).await
    }
}
