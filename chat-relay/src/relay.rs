use std::{
    future::Future,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::{
    io::BufReader,
    net::{TcpListener, TcpStream},
    select,
    time::sleep,
};
use tracing::{debug, info, warn};

use crate::{
    registry::{Registry, SessionHandle, SessionId},
    session::Session,
};

/// Pause after a failed accept before trying again.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Failed accepts in a row after which the listener is considered unusable.
pub const MAX_CONSECUTIVE_ACCEPT_ERRORS: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub host: IpAddr,
    /// `0` asks the OS for an ephemeral port.
    pub port: u16,
    /// Lines a session may have queued before broadcasts to it are dropped.
    pub outbound_capacity: usize,
    /// Longest inbound line, in bytes, that is relayed.
    pub max_line_length: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            outbound_capacity: 128,
            max_line_length: 64 * 1024,
        }
    }
}

impl RelayConfig {
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Owns the listening socket and spawns one session task per connection.
pub struct Relay {
    listener: TcpListener,
    registry: Arc<Registry>,
    config: RelayConfig,
}

impl Relay {
    /// Binds the configured address. Failing here is fatal for the process.
    pub async fn bind(config: RelayConfig) -> Result<Self> {
        let addr = config.listen_addr();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        Ok(Self::new(listener, config))
    }

    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            listener,
            registry: Arc::new(Registry::new()),
            config,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accepts connections until the listener stops working.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Relay {
            listener,
            registry,
            config,
        } = self;
        tokio::pin!(shutdown);

        let mut next_id: SessionId = 1;
        let mut consecutive_errors = 0;

        loop {
            let accept_result = select! {
                _ = &mut shutdown => break,
                result = listener.accept() => result,
            };

            match handle_accept_result(accept_result, &mut consecutive_errors)? {
                Accepted::Connection(stream, peer) => {
                    spawn_session(stream, peer, next_id, &registry, &config).await;
                    next_id += 1;
                }
                Accepted::Retry => {
                    if backoff_until(&mut shutdown).await {
                        break;
                    }
                }
            }
        }

        info!("relay shutting down");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}

#[derive(Debug)]
enum Accepted {
    Connection(TcpStream, SocketAddr),
    Retry,
}

/// Tracks the run of failed accepts. A failure is logged and retried until
/// `MAX_CONSECUTIVE_ACCEPT_ERRORS` of them arrive in a row.
fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    consecutive_errors: &mut u32,
) -> Result<Accepted> {
    match result {
        Ok((stream, peer)) => {
            *consecutive_errors = 0;
            Ok(Accepted::Connection(stream, peer))
        }
        Err(err) => {
            *consecutive_errors += 1;
            if *consecutive_errors >= MAX_CONSECUTIVE_ACCEPT_ERRORS {
                return Err(err).context("listener is no longer accepting connections");
            }
            warn!(
                error = ?err,
                consecutive_errors = *consecutive_errors,
                "failed to accept connection"
            );
            Ok(Accepted::Retry)
        }
    }
}

/// Sleeps for `ACCEPT_BACKOFF`; returns true if `shutdown` fired first.
async fn backoff_until<F>(shutdown: &mut F) -> bool
where
    F: Future<Output = ()> + Unpin,
{
    select! {
        _ = shutdown => true,
        _ = sleep(ACCEPT_BACKOFF) => false,
    }
}

async fn spawn_session(
    stream: TcpStream,
    peer: SocketAddr,
    id: SessionId,
    registry: &Arc<Registry>,
    config: &RelayConfig,
) {
    debug!(session = id, %peer, "accepted connection");

    let (handle, inbox) = SessionHandle::channel(id, config.outbound_capacity);
    registry.add(handle).await;

    let (reader, writer) = stream.into_split();
    let session = Session::new(id, Some(peer), Arc::clone(registry), config.max_line_length);
    tokio::spawn(session.run(BufReader::new(reader), writer, inbox));
}
