use std::{future::Future, io, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpSocket, TcpStream},
    select,
    task::{JoinError, JoinSet},
    time::timeout,
};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{barrier::CompletionBarrier, handler::handle_connection, store::BetStore};

/// Everything the server needs to start, independent of how it was parsed.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    pub backlog: u32,
    pub expected_agencies: usize,
    pub store_path: PathBuf,
    pub winning_number: i64,
    pub grace_period: Duration,
}

/// State shared by every connection handler for the lifetime of the process.
pub struct LotteryState {
    pub store: BetStore,
    pub barrier: CompletionBarrier,
    pub winning_number: i64,
}

impl LotteryState {
    pub async fn new(config: &ServerConfig) -> io::Result<Self> {
        Ok(Self {
            store: BetStore::open(&config.store_path).await?,
            barrier: CompletionBarrier::new(config.expected_agencies),
            winning_number: config.winning_number,
        })
    }
}

pub struct Server {
    listener: TcpListener,
    state: Arc<LotteryState>,
    grace_period: Duration,
}

impl Server {
    pub fn new(listener: TcpListener, state: Arc<LotteryState>, grace_period: Duration) -> Self {
        Self {
            listener,
            state,
            grace_period,
        }
    }

    /// Binds the configured address with the configured accept backlog.
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let listener = listen(config.listen, config.backlog)
            .with_context(|| format!("failed to listen on {}", config.listen))?;
        let state = LotteryState::new(config).await.with_context(|| {
            format!("failed to open bet store {}", config.store_path.display())
        })?;
        Ok(Self::new(listener, Arc::new(state), config.grace_period))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn state(&self) -> Arc<LotteryState> {
        Arc::clone(&self.state)
    }

    /// Accepts connections until `shutdown` resolves, then drains handlers.
    ///
    /// In-flight handlers get the grace period to finish; whatever is still
    /// running afterwards is aborted, and this returns once all have exited.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            state,
            grace_period,
        } = self;
        let mut handlers = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                biased;
                _ = &mut shutdown => break,
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &state, &mut handlers);
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    log_handler_exit(joined);
                }
            }
        }

        drop(listener);
        info!("stopped accepting connections");
        drain_handlers(handlers, grace_period).await;
        Ok(())
    }

    /// Runs until Ctrl-C or SIGTERM.
    pub async fn run_until_signal(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }
}

fn listen(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

fn handle_accept_result(
    result: io::Result<(TcpStream, SocketAddr)>,
    state: &Arc<LotteryState>,
    handlers: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => {
            info!(%peer, "connection accepted");
            spawn_connection_handler(stream, peer, state, handlers);
        }
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    state: &Arc<LotteryState>,
    handlers: &mut JoinSet<()>,
) {
    let state = Arc::clone(state);
    handlers.spawn(
        async move { serve_connection(stream, &state).await }
            .instrument(info_span!("connection", %peer)),
    );
}

async fn serve_connection(mut stream: TcpStream, state: &LotteryState) {
    match handle_connection(&mut stream, state).await {
        Ok(()) => debug!("connection finished"),
        Err(err) => warn!(error = %err, "connection closed with error"),
    }
    if let Err(err) = stream.shutdown().await {
        debug!(error = ?err, "failed to shut down socket");
    }
}

fn log_handler_exit(joined: std::result::Result<(), JoinError>) {
    match joined {
        Ok(()) => {}
        Err(err) if err.is_cancelled() => debug!("connection handler aborted"),
        Err(err) => warn!(error = %err, "connection handler panicked"),
    }
}

async fn drain_handlers(mut handlers: JoinSet<()>, grace_period: Duration) {
    if handlers.is_empty() {
        return;
    }

    info!(
        in_flight = handlers.len(),
        grace_ms = grace_period.as_millis() as u64,
        "waiting for in-flight connections"
    );
    let drained = timeout(grace_period, async {
        while let Some(joined) = handlers.join_next().await {
            log_handler_exit(joined);
        }
    })
    .await;

    if drained.is_err() {
        warn!(remaining = handlers.len(), "grace period elapsed, aborting connections");
        handlers.abort_all();
        while let Some(joined) = handlers.join_next().await {
            log_handler_exit(joined);
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                select! {
                    result = tokio::signal::ctrl_c() => log_ctrl_c(result),
                    _ = sigterm.recv() => info!("received SIGTERM"),
                }
                return;
            }
            Err(err) => warn!(error = ?err, "failed to install SIGTERM handler"),
        }
    }

    log_ctrl_c(tokio::signal::ctrl_c().await);
}

fn log_ctrl_c(result: io::Result<()>) {
    match result {
        Ok(()) => info!("received Ctrl-C"),
        Err(err) => warn!(error = ?err, "failed to install ctrl-c handler"),
    }
}
