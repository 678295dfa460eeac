//! The AMQP protocol head: listeners, accept loops and the connection resilience policy

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    error::{BoxError, ConnectionError, HeadError},
    settings::{AcceptBackoff, AmqpSettings, TransportSettings},
    transport::Transport,
};

/// A listener accepting transports
#[async_trait]
pub trait TransportListener: Send {
    fn address(&self) -> &str;

    /// Binds the listener
    async fn open(&mut self) -> Result<(), BoxError>;

    /// Waits for the next transport
    async fn accept(&mut self) -> Result<Transport, BoxError>;
}

/// Creates a listener per [`TransportSettings`]
pub trait TransportListenerProvider: Send + Sync {
    fn create_listener(
        &self,
        settings: &TransportSettings,
    ) -> Result<Box<dyn TransportListener>, BoxError>;
}

/// An AMQP connection over an accepted transport
#[async_trait]
pub trait AmqpConnection: Send {
    /// Negotiates the connection with the peer
    async fn open(&mut self, timeout: Duration) -> Result<(), ConnectionError>;

    /// Serves the connection until the peer closes it
    async fn run(&mut self) -> Result<(), ConnectionError>;

    /// Closes the connection. Closing twice is a no-op.
    async fn close(&mut self);
}

/// Creates AMQP connections over accepted transports
#[async_trait]
pub trait RuntimeProvider: Send + Sync + 'static {
    async fn create_connection(
        &self,
        transport: Transport,
    ) -> Result<Box<dyn AmqpConnection>, ConnectionError>;
}

/// Accepts AMQP connections on every configured transport.
///
/// Only listener setup errors are returned from [`start`](Self::start). Failures of a single
/// connection are logged and the connection is closed, the accept loop keeps going.
pub struct AmqpProtocolHead<L, R> {
    settings: AmqpSettings,
    listener_provider: L,
    runtime: Arc<R>,
    shutdown: CancellationToken,
    accept_loops: Vec<JoinHandle<()>>,
    started: bool,
}

impl<L, R> std::fmt::Debug for AmqpProtocolHead<L, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpProtocolHead")
            .field("settings", &self.settings)
            .field("accept_loops", &self.accept_loops.len())
            .field("started", &self.started)
            .finish()
    }
}

impl<L, R> AmqpProtocolHead<L, R>
where
    L: TransportListenerProvider,
    R: RuntimeProvider,
{
    pub fn new(settings: AmqpSettings, listener_provider: L, runtime: R) -> Self {
        Self {
            settings,
            listener_provider,
            runtime: Arc::new(runtime),
            shutdown: CancellationToken::new(),
            accept_loops: Vec::new(),
            started: false,
        }
    }

    pub fn settings(&self) -> &AmqpSettings {
        &self.settings
    }

    /// Opens every listener and spawns their accept loops
    #[instrument(skip_all)]
    pub async fn start(&mut self) -> Result<(), HeadError> {
        if self.started {
            return Err(HeadError::AlreadyStarted);
        }

        let mut listeners = Vec::with_capacity(self.settings.transports.len());
        for settings in &self.settings.transports {
            let startup = |source: BoxError| HeadError::Startup {
                address: settings.address().to_string(),
                source,
            };
            let mut listener = self
                .listener_provider
                .create_listener(settings)
                .map_err(startup)?;
            listener.open().await.map_err(startup)?;
            listeners.push(listener);
        }

        for listener in listeners {
            let runtime = self.runtime.clone();
            let shutdown = self.shutdown.child_token();
            let open_timeout = self.settings.connection_open_timeout;
            let backoff = self.settings.accept_backoff;
            self.accept_loops.push(tokio::spawn(accept_loop(
                listener,
                runtime,
                open_timeout,
                backoff,
                shutdown,
            )));
        }

        self.started = true;
        info!(listeners = self.accept_loops.len(), "Protocol head started");
        Ok(())
    }

    /// Like [`start`](Self::start), failing with [`HeadError::Timeout`] when the listeners do
    /// not open in time
    pub async fn start_with_timeout(&mut self, timeout: Duration) -> Result<(), HeadError> {
        match tokio::time::timeout(timeout, self.start()).await {
            Ok(result) => result,
            Err(_) => Err(HeadError::Timeout),
        }
    }

    /// Stops the accept loops and the connections they spawned, then waits for the loops
    #[instrument(skip_all)]
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        for accept_loop in self.accept_loops.drain(..) {
            if let Err(err) = accept_loop.await {
                error!(%err, "Accept loop panicked");
            }
        }
        info!("Protocol head closed");
    }
}

#[instrument(skip_all, fields(address = %listener.address()))]
async fn accept_loop<R: RuntimeProvider>(
    mut listener: Box<dyn TransportListener>,
    runtime: Arc<R>,
    open_timeout: Duration,
    backoff: AcceptBackoff,
    shutdown: CancellationToken,
) {
    let backoff = backoff.normalized();
    let mut delay = backoff.initial_delay;
    loop {
        let transport = tokio::select! {
            _ = shutdown.cancelled() => break,
            transport = listener.accept() => transport,
        };
        match transport {
            Ok(transport) => {
                delay = backoff.initial_delay;
                let runtime = runtime.clone();
                let shutdown = shutdown.child_token();
                tokio::spawn(handle_connection(runtime, transport, open_timeout, shutdown));
            }
            Err(err) => {
                warn!(%err, retry_in = ?delay, "Failed to accept transport");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = backoff.next_delay(delay);
            }
        }
    }
    debug!("Accept loop stopped");
}

#[instrument(skip_all, fields(peer = ?transport.remote_address))]
async fn handle_connection<R: RuntimeProvider>(
    runtime: Arc<R>,
    transport: Transport,
    open_timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut connection = match runtime.create_connection(transport).await {
        Ok(connection) => connection,
        Err(err) => {
            warn!(%err, "Failed to create connection");
            return;
        }
    };

    if let Err(err) = connection.open(open_timeout).await {
        warn!(%err, "Failed to open connection");
        connection.close().await;
        return;
    }

    tokio::select! {
        _ = shutdown.cancelled() => debug!("Closing connection on shutdown"),
        result = connection.run() => match result {
            Ok(()) => debug!("Connection ended"),
            Err(err) => warn!(%err, "Connection failed"),
        },
    }
    connection.close().await;
}
