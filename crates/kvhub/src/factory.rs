//! Client factory.
//!
//! Builds connection handles with the fixed [`ResiliencePolicy`] and wires the
//! lifecycle observer that reports each handle's events.

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, error, info, warn};

use crate::client::{Client, ClientDriver, ClientEvent};
use crate::config::ConnectionOptions;
use crate::policy::ResiliencePolicy;
use crate::transport::Connector;

/// Produces [`Client`]s for the registry.
#[derive(Clone)]
pub struct ClientFactory {
    connector: Arc<dyn Connector>,
    policy: ResiliencePolicy,
}

impl ClientFactory {
    pub fn new(connector: impl Connector) -> Self {
        Self {
            connector: Arc::new(connector),
            policy: ResiliencePolicy::default(),
        }
    }

    /// Policy applied to every handle this factory builds.
    pub fn policy(&self) -> ResiliencePolicy {
        self.policy
    }

    /// Build a handle for `name`. The returned driver must be spawned with
    /// [`ClientFactory::spawn`] for the handle to connect.
    pub(crate) fn build(&self, name: &str, options: ConnectionOptions) -> (Client, ClientDriver) {
        Client::new(name, options, self.policy, Arc::clone(&self.connector))
    }

    /// Start the driver and an observer for its events.
    ///
    /// `on_end` runs once, when the handle publishes [`ClientEvent::End`].
    pub(crate) fn spawn<F>(&self, client: &Client, driver: ClientDriver, on_end: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let events = client.subscribe();
        tokio::spawn(observe(client.name().to_string(), events, on_end));
        tokio::spawn(driver.run());
    }
}

async fn observe<F>(name: String, mut events: broadcast::Receiver<ClientEvent>, on_end: F)
where
    F: FnOnce() + Send + 'static,
{
    loop {
        match events.recv().await {
            Ok(ClientEvent::Connect) => debug!(connection = %name, "Connected"),
            Ok(ClientEvent::Ready) => info!(connection = %name, "Connection ready"),
            Ok(ClientEvent::Error(message)) => {
                error!(connection = %name, error = %message, "Connection error")
            }
            Ok(ClientEvent::Close) => debug!(connection = %name, "Connection closing"),
            Ok(ClientEvent::Reconnecting { attempt, delay }) => info!(
                connection = %name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            ),
            Ok(ClientEvent::End) => {
                info!(connection = %name, "Connection ended");
                on_end();
                return;
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(connection = %name, skipped, "Lifecycle observer lagged");
            }
            Err(RecvError::Closed) => return,
        }
    }
}
