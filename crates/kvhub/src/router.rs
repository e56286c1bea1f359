//! Default router.
//!
//! [`DefaultRouter`] looks and acts like a handle to the `default`
//! connection. Every operation looks the handle up again, so a router
//! obtained before a forced re-initialization talks to the new handle
//! afterwards.

use async_trait::async_trait;

use crate::client::{Client, ConnectionState};
use crate::commands::{command_from_parts, Commands};
use crate::config::{ConnectionOptions, DEFAULT_CONNECTION};
use crate::error::RegistryError;
use crate::registry::ConnectionRegistry;
use crate::resp::{Command, Value};

/// Forwards operations to the registry's current `default` connection.
#[derive(Clone, Debug)]
pub struct DefaultRouter {
    registry: ConnectionRegistry,
}

impl DefaultRouter {
    pub(crate) fn new(registry: ConnectionRegistry) -> Self {
        Self { registry }
    }

    /// Look up any named connection, bypassing default resolution.
    pub fn connection(&self, name: &str) -> Result<Client, RegistryError> {
        self.registry.lookup(name)
    }

    /// The handle currently registered as `default`.
    pub fn resolve(&self) -> Result<Client, RegistryError> {
        self.registry.lookup(DEFAULT_CONNECTION)
    }

    /// Forward `operation` by name.
    pub async fn call(&self, operation: &str, args: &[&str]) -> Result<Value, RegistryError> {
        let cmd = command_from_parts(operation, args.iter().copied());
        self.send_command(cmd).await
    }

    pub fn name(&self) -> Result<String, RegistryError> {
        Ok(self.resolve()?.name().to_string())
    }

    pub fn options(&self) -> Result<ConnectionOptions, RegistryError> {
        Ok(self.resolve()?.options().clone())
    }

    pub fn state(&self) -> Result<ConnectionState, RegistryError> {
        Ok(self.resolve()?.state())
    }

    pub async fn ready(&self) -> Result<(), RegistryError> {
        Ok(self.resolve()?.ready().await?)
    }

    pub async fn quit(&self) -> Result<(), RegistryError> {
        Ok(self.resolve()?.quit().await?)
    }
}

#[async_trait]
impl Commands for DefaultRouter {
    type Error = RegistryError;

    async fn send_command(&self, cmd: Command) -> Result<Value, RegistryError> {
        let client = self.resolve()?;
        if !client.supports(cmd.name()) {
            return Err(RegistryError::UnsupportedOperation(cmd.name().to_string()));
        }
        Ok(client.send_command(cmd).await?)
    }
}
