//! Test utilities for registry and client testing.
//!
//! Provides an in-memory key-value server reachable through the
//! [`Connector`] seam, with knobs to refuse connections, drop requests and
//! fail `QUIT`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kvhub::{ClientError, Command, ConnectionOptions, Connector, Transport, Value};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Fake store server.
#[derive(Default)]
pub struct MockServer {
    store: Mutex<HashMap<String, String>>,
    received: Mutex<Vec<String>>,
    attempts: AtomicUsize,
    connects: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
    refuse_connects: AtomicUsize,
    refuse_all: AtomicBool,
    fail_quit: AtomicBool,
    drop_next_request: AtomicBool,
}

impl MockServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Connection attempts, refused ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Successful connections.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Currently open transports.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Most transports ever open at the same time.
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_next_connects(&self, n: usize) {
        self.refuse_connects.store(n, Ordering::SeqCst);
    }

    pub fn set_refuse_all(&self, refuse: bool) {
        self.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Answer `QUIT` with an error reply.
    pub fn fail_quit(&self) {
        self.fail_quit.store(true, Ordering::SeqCst);
    }

    /// Fail the next request as if the connection dropped mid-flight.
    pub fn drop_next_request(&self) {
        self.drop_next_request.store(true, Ordering::SeqCst);
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.store.lock().unwrap().get(key).cloned()
    }

    /// Names of every command received, in order.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_count(&self, name: &str) -> usize {
        self.received().iter().filter(|cmd| *cmd == name).count()
    }

    fn accept(&self) -> io::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse_all.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }
        let refused = self
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }

        self.connects.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(())
    }

    fn handle(&self, cmd: &Command) -> Value {
        self.received.lock().unwrap().push(cmd.name().to_string());
        let args: Vec<String> = cmd
            .arguments()
            .iter()
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect();
        let mut store = self.store.lock().unwrap();

        match (cmd.name(), args.as_slice()) {
            ("PING", []) => Value::Status("PONG".into()),
            ("ECHO", [message]) => Value::Data(message.clone().into()),
            ("GET", [key]) => store
                .get(key)
                .map_or(Value::Nil, |v| Value::Data(v.clone().into())),
            ("SET", [key, value, rest @ ..]) => {
                if rest.iter().any(|opt| opt == "NX") && store.contains_key(key) {
                    return Value::Nil;
                }
                store.insert(key.clone(), value.clone());
                Value::Status("OK".into())
            }
            ("DEL", keys) => {
                Value::Int(keys.iter().filter(|k| store.remove(*k).is_some()).count() as i64)
            }
            ("EXISTS", [key]) => Value::Int(store.contains_key(key) as i64),
            ("INCR", [key]) => {
                let next = store.get(key).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0) + 1;
                store.insert(key.clone(), next.to_string());
                Value::Int(next)
            }
            ("DBSIZE", []) => Value::Int(store.len() as i64),
            ("QUIT", []) => {
                if self.fail_quit.load(Ordering::SeqCst) {
                    Value::Error("ERR quit refused".into())
                } else {
                    Value::Status("OK".into())
                }
            }
            (name, _) => Value::Error(format!("ERR unknown command '{}'", name)),
        }
    }
}

/// Routes connections to a [`MockServer`] by host name.
#[derive(Default)]
pub struct MockConnector {
    servers: Mutex<HashMap<String, Arc<MockServer>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_server(self: Arc<Self>, host: &str, server: &Arc<MockServer>) -> Arc<Self> {
        self.servers
            .lock()
            .unwrap()
            .insert(host.to_string(), Arc::clone(server));
        self
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Box<dyn Transport>, ClientError> {
        let server = self
            .servers
            .lock()
            .unwrap()
            .get(&options.host)
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;
        server.accept()?;
        Ok(Box::new(MockTransport { server }))
    }
}

struct MockTransport {
    server: Arc<MockServer>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn request(&mut self, cmd: Command) -> Result<Value, ClientError> {
        if self.server.drop_next_request.swap(false, Ordering::SeqCst) {
            return Err(ClientError::ConnectionClosed);
        }
        Ok(self.server.handle(&cmd))
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        Ok(())
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        self.server.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Options pointing at the mock server registered as `host`.
pub fn options(host: &str) -> ConnectionOptions {
    ConnectionOptions::new(host, 6379)
}

/// Poll `condition` until it holds, panicking after [`DEFAULT_TIMEOUT`].
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    let result = tokio::time::timeout(DEFAULT_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}
