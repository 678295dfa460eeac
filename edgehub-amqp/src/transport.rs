//! Transports the protocol head accepts connections on

use std::{fmt, net::SocketAddr};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
};
use tracing::{debug, info};

use crate::{
    error::BoxError,
    head::{TransportListener, TransportListenerProvider},
    settings::TransportSettings,
};

/// Byte stream an AMQP connection runs over
pub trait TransportStream: AsyncRead + AsyncWrite + fmt::Debug + Send + Unpin + 'static {}

impl<T> TransportStream for T where T: AsyncRead + AsyncWrite + fmt::Debug + Send + Unpin + 'static {}

/// An accepted transport
pub struct Transport {
    pub stream: Box<dyn TransportStream>,
    pub remote_address: Option<SocketAddr>,
}

impl Transport {
    pub fn new(stream: impl TransportStream, remote_address: Option<SocketAddr>) -> Self {
        Self {
            stream: Box::new(stream),
            remote_address,
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("remote_address", &self.remote_address)
            .finish()
    }
}

/// Plain TCP listener
#[derive(Debug)]
pub struct TcpTransportListener {
    address: String,
    listener: Option<TcpListener>,
}

impl TcpTransportListener {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            listener: None,
        }
    }

    /// Local address the listener is bound to, once opened
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    fn address(&self) -> &str {
        &self.address
    }

    async fn open(&mut self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.address).await?;
        info!(address = %self.address, "Listening");
        self.listener = Some(listener);
        Ok(())
    }

    async fn accept(&mut self) -> Result<Transport, BoxError> {
        let listener = self
            .listener
            .as_ref()
            .ok_or("TCP listener is not open")?;
        let (stream, remote_address) = listener.accept().await?;
        debug!(peer = %remote_address, "Accepted TCP connection");
        Ok(Transport::new(stream, Some(remote_address)))
    }
}

/// Creates [`TcpTransportListener`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransportListenerProvider;

impl TransportListenerProvider for TcpTransportListenerProvider {
    fn create_listener(
        &self,
        settings: &TransportSettings,
    ) -> Result<Box<dyn TransportListener>, BoxError> {
        match settings {
            TransportSettings::Tcp { address } => Ok(Box::new(TcpTransportListener::new(address))),
        }
    }
}
