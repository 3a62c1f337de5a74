//! TCP server: accept loop, connection limit, graceful shutdown

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::protocol::{Encodable, ErrorCode, ErrorMessage};
use crate::server::auth::AuthService;
use crate::server::connection::ConnectionHandler;
use crate::server::presence::PresenceManager;
use crate::server::registry::SessionRegistry;
use crate::server::router::MessageRouter;
use crate::store::CredentialStore;

/// Shared state handed to every connection handler
pub struct ServerContext {
    pub config: ServerConfig,
    pub store: Arc<dyn CredentialStore>,
    pub registry: Arc<SessionRegistry>,
    pub presence: Arc<PresenceManager>,
    pub auth: AuthService,
    pub router: MessageRouter,
    /// Root token; every connection's token is a child of it
    pub shutdown: CancellationToken,
}

impl ServerContext {
    pub fn new(config: ServerConfig, store: Arc<dyn CredentialStore>) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let presence = Arc::new(PresenceManager::new(
            Arc::clone(&store),
            Arc::clone(&registry),
        ));
        let auth = AuthService::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            Arc::clone(&presence),
            config.bcrypt_cost,
        );
        let router = MessageRouter::new(Arc::clone(&store), Arc::clone(&registry));

        Self {
            config,
            store,
            registry,
            presence,
            auth,
            router,
            shutdown: CancellationToken::new(),
        }
    }
}

/// Counts open connections against `max_connections`
#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    active: Arc<AtomicUsize>,
    max_connections: usize,
}

impl ConnectionLimiter {
    pub fn new(max_connections: usize) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            max_connections,
        }
    }

    /// Take a slot, or `None` if the server is full. The slot is released
    /// when the guard drops.
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < self.max_connections).then_some(current + 1)
            })
            .ok()
            .map(|_| ConnectionGuard {
                active: Arc::clone(&self.active),
            })
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Server statistics
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub active_connections: usize,
    pub online_users: usize,
    pub bind_address: SocketAddr,
}

/// The IM server
pub struct ImServer {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
    limiter: ConnectionLimiter,
    tasks: TaskTracker,
}

impl ImServer {
    /// Bind the listening socket
    pub async fn bind(config: ServerConfig, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let limiter = ConnectionLimiter::new(config.max_connections);
        info!("Server listening on {}", listener.local_addr()?);

        Ok(Self {
            ctx: Arc::new(ServerContext::new(config, store)),
            listener,
            limiter,
            tasks: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// Cancelling this token stops the server
    pub fn shutdown_token(&self) -> CancellationToken {
        self.ctx.shutdown.clone()
    }

    pub async fn get_stats(&self) -> Result<ServerStats> {
        Ok(ServerStats {
            active_connections: self.limiter.active_count(),
            online_users: self.ctx.registry.online_count().await,
            bind_address: self.local_addr()?,
        })
    }

    /// Accept connections until the shutdown token is cancelled, then wait
    /// for every connection to finish its teardown.
    pub async fn run(self) -> Result<()> {
        let shutdown = self.ctx.shutdown.clone();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => self.spawn_connection(stream, addr),
                    Err(e) => {
                        // Usually fd exhaustion; back off instead of spinning
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
            }
        }

        info!(
            "Shutting down, waiting for {} connections",
            self.limiter.active_count()
        );
        drop(self.listener);
        self.tasks.close();
        self.tasks.wait().await;

        let leftover = self.ctx.registry.drain().await;
        if !leftover.is_empty() {
            warn!("{} sessions left after shutdown", leftover.len());
        }
        info!("Server shutdown complete");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed for {}: {}", addr, e);
        }

        let Some(guard) = self.limiter.try_acquire() else {
            warn!("Connection limit reached, rejecting {}", addr);
            self.tasks.spawn(reject_busy(stream));
            return;
        };

        let handler = ConnectionHandler::new(Arc::clone(&self.ctx), addr);
        self.tasks.spawn(async move {
            let _guard = guard;
            handler.run(stream).await;
        });
    }
}

async fn reject_busy(mut stream: TcpStream) {
    let Ok(frame) = ErrorMessage::new(ErrorCode::ServerBusy, "Server busy").encode_frame() else {
        return;
    };
    let bytes = frame.encode_to_bytes();
    let _ = tokio::time::timeout(Duration::from_secs(1), stream.write_all(&bytes)).await;
    let _ = stream.shutdown().await;
}
