//! Transport seam between a [`Client`](crate::Client) and the wire.
//!
//! A [`Connector`] opens connections; a [`Transport`] is one open connection
//! that answers requests in order. [`TcpConnector`] speaks RESP2 over TCP.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, instrument};

use crate::config::ConnectionOptions;
use crate::error::ClientError;
use crate::resp::{Command, RespCodec, Value};

/// Opens transports for connection options.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Dial and complete any handshake; the returned transport is ready for
    /// requests.
    async fn connect(&self, options: &ConnectionOptions) -> Result<Box<dyn Transport>, ClientError>;
}

/// One open connection.
#[async_trait]
pub trait Transport: Send {
    /// Send `cmd` and wait for its reply.
    ///
    /// Error replies from the server are returned as [`Value::Error`]; `Err`
    /// means the connection itself failed.
    async fn request(&mut self, cmd: Command) -> Result<Value, ClientError>;

    /// Close the connection.
    async fn close(&mut self) -> Result<(), ClientError>;
}

#[async_trait]
impl<C: Connector + ?Sized> Connector for Arc<C> {
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Box<dyn Transport>, ClientError> {
        (**self).connect(options).await
    }
}

/// RESP2 over plain TCP.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    #[instrument(skip_all, fields(address = %options.address()))]
    async fn connect(
        &self,
        options: &ConnectionOptions,
    ) -> Result<Box<dyn Transport>, ClientError> {
        let stream = tokio::time::timeout(
            options.connect_timeout(),
            TcpStream::connect(options.address()),
        )
        .await
        .map_err(|_| ClientError::ConnectTimeout)??;
        stream.set_nodelay(true)?;

        let mut transport = TcpTransport {
            framed: Framed::new(stream, RespCodec),
        };
        transport.handshake(options).await?;
        debug!("Connection established");

        Ok(Box::new(transport))
    }
}

struct TcpTransport {
    framed: Framed<TcpStream, RespCodec>,
}

impl TcpTransport {
    async fn handshake(&mut self, options: &ConnectionOptions) -> Result<(), ClientError> {
        if let Some(password) = &options.password {
            let cmd = match &options.username {
                Some(username) => Command::new("AUTH").arg(username).arg(password),
                None => Command::new("AUTH").arg(password),
            };
            self.expect_ok(cmd).await?;
        }
        if options.db != 0 {
            self.expect_ok(Command::new("SELECT").arg(options.db)).await?;
        }
        if let Some(name) = &options.connection_name {
            self.expect_ok(Command::new("CLIENT").arg("SETNAME").arg(name))
                .await?;
        }
        Ok(())
    }

    async fn expect_ok(&mut self, cmd: Command) -> Result<(), ClientError> {
        let name = cmd.name().to_string();
        match self.request(cmd).await? {
            Value::Error(message) => Err(ClientError::Server(message)),
            value if value.is_ok() => Ok(()),
            other => Err(ClientError::UnexpectedReply(format!(
                "{} answered {:?}",
                name, other
            ))),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request(&mut self, cmd: Command) -> Result<Value, ClientError> {
        self.framed.send(cmd).await?;
        match self.framed.next().await {
            Some(reply) => reply,
            None => Err(ClientError::ConnectionClosed),
        }
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        <Framed<TcpStream, RespCodec> as SinkExt<Command>>::close(&mut self.framed).await
    }
}
