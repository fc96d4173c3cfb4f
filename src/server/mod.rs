//! Relay server
//!
//! One receive thread and one send thread per connection, plus three
//! process-wide loops: video composition, audio mixing and statistics.
//! Everything shares one [`ServerContext`] owned by the entry point.

pub mod broadcast;
pub mod compose;
pub mod events;
pub mod handler;
pub mod registry;
pub mod session;
pub mod stats;

pub use compose::{compose, grid_dimensions, is_blank, Composition, Compositor};
pub use events::{EventBus, SessionEvent};
pub use registry::SessionRegistry;
pub use session::{ClientSession, SessionInfo, SessionState, SessionStats};

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::Mixer;
use crate::config::{AppConfig, AudioConfig, ServerConfig};
use crate::error::{Error, RelayError, Result};
use crate::util::Shutdown;
use crate::video::LuminanceRenderer;

/// Poll interval of the non-blocking accept loop
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// State shared by every server task
pub struct ServerContext {
    pub config: ServerConfig,
    pub audio: AudioConfig,
    pub registry: SessionRegistry,
    pub mixer: Mixer,
    pub events: EventBus,
    pub compositor: Compositor,
    pub shutdown: Arc<Shutdown>,
    started_at: Instant,
}

impl ServerContext {
    pub fn new(config: &AppConfig, shutdown: Arc<Shutdown>) -> Self {
        Self {
            config: config.server.clone(),
            audio: config.audio.clone(),
            registry: SessionRegistry::new(&config.server),
            mixer: Mixer::new(config.server.max_clients),
            events: EventBus::default(),
            compositor: Compositor::new(Box::new(LuminanceRenderer::default())),
            shutdown,
            started_at: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

/// Bound but not yet running server
pub struct Server {
    ctx: Arc<ServerContext>,
    listener: TcpListener,
}

impl Server {
    pub fn bind(config: &AppConfig, shutdown: Arc<Shutdown>) -> Result<Self> {
        let addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.port)
            .parse()
            .map_err(|e| Error::Config(format!("invalid bind address: {}", e)))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        let listener: TcpListener = socket.into();
        listener.set_nonblocking(true)?;

        tracing::info!("Relay listening on {}", listener.local_addr()?);
        Ok(Self {
            ctx: Arc::new(ServerContext::new(config, shutdown)),
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn context(&self) -> Arc<ServerContext> {
        Arc::clone(&self.ctx)
    }

    /// Run until shutdown is triggered, then close every session and wait
    /// for the background loops.
    pub fn run(self) -> Result<()> {
        let ctx = self.ctx;
        let loops = [
            spawn_loop("video-broadcast", &ctx, broadcast::run_video_loop)?,
            spawn_loop("audio-mix", &ctx, broadcast::run_audio_loop)?,
            spawn_loop("stats", &ctx, stats::run_stats_loop)?,
        ];

        while !ctx.shutdown.is_triggered() {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = handler::accept(&ctx, stream, peer) {
                        tracing::warn!(%peer, "Connection setup failed: {}", e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    ctx.shutdown.sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    ctx.shutdown.sleep(ACCEPT_POLL);
                }
            }
        }

        tracing::info!(sessions = ctx.registry.len(), "Shutting down relay");
        drop(self.listener);
        ctx.registry.close_all();
        for session in ctx.registry.snapshot() {
            if let Some(handle) = session.take_recv_thread() {
                let _ = handle.join();
            }
        }
        for handle in loops {
            let _ = handle.join();
        }
        tracing::info!("Relay stopped");
        Ok(())
    }

    /// Run on a background thread.
    pub fn spawn(self) -> Result<ServerHandle> {
        let ctx = self.context();
        let addr = self.local_addr()?;
        let thread = thread::Builder::new()
            .name("relay-accept".into())
            .spawn(move || self.run())?;
        Ok(ServerHandle {
            ctx,
            addr,
            thread: Some(thread),
        })
    }
}

fn spawn_loop(
    name: &str,
    ctx: &Arc<ServerContext>,
    body: fn(Arc<ServerContext>),
) -> Result<JoinHandle<()>> {
    let ctx = Arc::clone(ctx);
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || body(ctx))
        .map_err(|e| RelayError::SpawnFailed(format!("{}: {}", name, e)).into())
}

/// Handle to a server running on its own thread
pub struct ServerHandle {
    ctx: Arc<ServerContext>,
    addr: SocketAddr,
    thread: Option<JoinHandle<Result<()>>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Trigger shutdown and wait for the server to stop.
    pub fn stop(mut self) -> Result<()> {
        self.ctx.shutdown.trigger();
        self.join()
    }

    fn join(&mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => match thread.join() {
                Ok(result) => result,
                Err(_) => {
                    tracing::error!("Relay thread panicked");
                    Ok(())
                }
            },
            None => Ok(()),
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.ctx.shutdown.trigger();
        let _ = self.join();
    }
}
