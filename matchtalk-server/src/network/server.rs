//! MatchTalk Server
//!
//! Wires the components into one shared [`AppState`], serves HTTP and
//! WebSocket traffic, and runs the matching sweeper until shutdown.
//!
//! Each WebSocket connection gets a writer task fed by an mpsc channel. The
//! reader loop handles CONNECT, SUBSCRIBE and UNSUBSCRIBE inline so that
//! authentication strictly precedes any pooled work; SEND frames go through
//! the bounded inbound pool, in arrival order per connection. Nothing waits on
//! a full outbound buffer: replies to a client that stopped reading are
//! dropped and the broker evicts it.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

use super::audit::{self, Lifecycle};
use super::broker::{Broker, CONNECTION_BUFFER};
use super::http::create_router;
use super::pool::{InboundPool, Sequencer};
use super::protocol::{ClientFrame, ServerFrame};
use super::relay::Relay;
use crate::accounts::AccountService;
use crate::auth::frame::{authenticate_connect, ConnectionContext, ConnectionId, FrameAuthError};
use crate::auth::CredentialResolver;
use crate::config::AppConfig;
use crate::core::identity::{IdentityResolver, Principal};
use crate::core::store::Storage;
use crate::core::token::{TokenCodec, TokenConfigError};
use crate::error::GENERIC_AUTH_MESSAGE;
use crate::matching::MatchingEngine;
use crate::rooms::RoomProvisioner;

/// Startup and serving errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket trouble.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Signing key rejected.
    #[error("token configuration: {0}")]
    Token(#[from] TokenConfigError),
}

/// Everything handlers and connection tasks share.
#[derive(Clone)]
pub struct AppState {
    /// Effective configuration.
    pub config: Arc<AppConfig>,
    /// Token codec.
    pub tokens: Arc<TokenCodec>,
    /// Credential resolution for all three authenticators.
    pub credentials: CredentialResolver,
    /// Login.
    pub accounts: Arc<AccountService>,
    /// Matching.
    pub engine: Arc<MatchingEngine>,
    /// Rooms and membership.
    pub rooms: Arc<RoomProvisioner>,
    /// Realtime connections.
    pub broker: Arc<Broker>,
    /// Realtime routing.
    pub relay: Arc<Relay>,
    /// Inbound frame pool.
    pub pool: InboundPool,
    /// Collaborators.
    pub storage: Storage,
    /// Shutdown signal.
    pub shutdown: broadcast::Sender<()>,
}

impl AppState {
    /// Build the component graph. Fails when the signing key is too short.
    pub fn new(config: AppConfig, storage: Storage) -> Result<Self, ServerError> {
        let tokens = Arc::new(TokenCodec::new(&config.token)?);
        let credentials = CredentialResolver::new(tokens.clone(), IdentityResolver::new(storage.users.clone()));
        let accounts = Arc::new(AccountService::new(
            storage.users.clone(),
            tokens.clone(),
            config.lockout.clone(),
        ));

        let broker = Arc::new(Broker::new());
        let rooms = Arc::new(RoomProvisioner::new());
        let relay = Arc::new(Relay::new(broker.clone(), rooms.clone(), &storage));
        let engine = Arc::new(MatchingEngine::new(
            config.matching.clone(),
            rooms.clone(),
            relay.clone(),
        ));
        let pool = InboundPool::new(config.pool.clone());
        let (shutdown, _) = broadcast::channel(1);

        Ok(Self {
            config: Arc::new(config),
            tokens,
            credentials,
            accounts,
            engine,
            rooms,
            broker,
            relay,
            pool,
            storage,
            shutdown,
        })
    }
}

/// The server.
pub struct MatchTalkServer {
    state: AppState,
}

impl MatchTalkServer {
    /// Create a server from configuration and collaborators.
    pub fn new(config: AppConfig, storage: Storage) -> Result<Self, ServerError> {
        Ok(Self {
            state: AppState::new(config, storage)?,
        })
    }

    /// Shared state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Bind the configured address and serve until shutdown.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.state.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        info!("MatchTalk listening on {}", listener.local_addr()?);
        info!(
            "Matching mode {:?}, pool core={} max={} queue={}",
            self.state.config.matching.confirmation,
            self.state.config.pool.core_size,
            self.state.config.pool.max_size,
            self.state.config.pool.queue_capacity
        );

        let sweeper = tokio::spawn(Self::run_sweep_loop(
            self.state.engine.clone(),
            self.state.config.matching.sweep_interval,
            self.state.shutdown.subscribe(),
        ));

        let mut shutdown_rx = self.state.shutdown.subscribe();
        axum::serve(listener, create_router(self.state.clone()))
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("Shutdown signal received");
            })
            .await?;

        self.state.pool.shutdown();
        let _ = sweeper.await;
        info!("MatchTalk stopped");
        Ok(())
    }

    /// Signal every task to stop.
    pub fn shutdown(&self) {
        let _ = self.state.shutdown.send(());
    }

    /// Expire stale requests and proposals on a fixed tick.
    async fn run_sweep_loop(engine: Arc<MatchingEngine>, every: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(every);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    engine.sweep_expired(Instant::now()).await;
                }
                _ = shutdown.recv() => {
                    debug!("Sweeper stopping");
                    break;
                }
            }
        }
    }
}

/// Drive one upgraded WebSocket until it closes.
pub async fn handle_socket(socket: WebSocket, state: AppState, handshake: Option<Principal>) {
    let conn_id = state.broker.next_connection_id();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerFrame>(CONNECTION_BUFFER);
    let evicted = state.broker.register(conn_id, tx.clone()).await;
    let inbound = state.pool.sequencer();

    let mut ctx = ConnectionContext::new(conn_id, handshake);
    let mut shutdown_rx = state.shutdown.subscribe();
    debug!("Connection {} opened", conn_id);

    // Writer task
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match frame.to_json() {
                Ok(t) => t,
                Err(e) => {
                    error!("Failed to serialize frame: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame = match ClientFrame::from_json(text.as_str()) {
                            Ok(f) => f,
                            Err(e) => {
                                debug!("Invalid frame on connection {}: {}", conn_id, e);
                                reply(&tx, conn_id, ServerFrame::error("Invalid frame", None));
                                continue;
                            }
                        };
                        if handle_frame(&state, &mut ctx, &inbound, &tx, frame).await.is_break() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("WebSocket error on connection {}: {}", conn_id, e);
                        break;
                    }
                    _ => {}
                }
            }
            _ = evicted.notified() => {
                warn!("Closing connection {}: slow consumer", conn_id);
                break;
            }
            _ = shutdown_rx.recv() => {
                reply(&tx, conn_id, ServerFrame::error("Server shutting down", None));
                break;
            }
        }
    }

    // Cleanup runs on every exit path
    let principal = ctx.clear();
    if let Some((user, still_connected)) = state.broker.unregister(conn_id).await {
        if !still_connected && state.engine.cancel(&user).await {
            info!("{} disconnected while matching; request withdrawn", user);
        }
    }
    audit::record(
        Lifecycle::Disconnect,
        conn_id,
        principal.as_ref().map(|p| p.subject_id.as_str()),
        "",
    );

    // writer drains what is queued, then ends when the last sender drops
    drop(tx);
    if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
        debug!("Writer for connection {} did not drain in time", conn_id);
    }
}

/// Queue a frame for this connection's writer without waiting.
fn reply(tx: &mpsc::Sender<ServerFrame>, conn_id: ConnectionId, frame: ServerFrame) {
    if tx.try_send(frame).is_err() {
        debug!("Reply to connection {} dropped: buffer full or closed", conn_id);
    }
}

async fn handle_frame(
    state: &AppState,
    ctx: &mut ConnectionContext,
    inbound: &Sequencer,
    tx: &mpsc::Sender<ServerFrame>,
    frame: ClientFrame,
) -> ControlFlow<()> {
    if let ClientFrame::Connect { headers } = &frame {
        audit::record_connect(
            ctx.id(),
            ctx.handshake_principal().map(|p| p.subject_id.as_str()),
            headers,
        );
        return match authenticate_connect(ctx, &state.credentials, headers).await {
            Ok(principal) => {
                state.broker.bind_principal(ctx.id(), &principal.subject_id).await;
                reply(tx, ctx.id(), ServerFrame::connected(&principal.subject_id));
                audit::record(Lifecycle::Connected, ctx.id(), Some(&principal.subject_id), "");
                ControlFlow::Continue(())
            }
            Err(FrameAuthError::AlreadyConnected) => {
                reply(tx, ctx.id(), ServerFrame::error("Already connected", None));
                ControlFlow::Continue(())
            }
            Err(FrameAuthError::Rejected(_)) => {
                reply(tx, ctx.id(), ServerFrame::error(GENERIC_AUTH_MESSAGE, None));
                ControlFlow::Break(())
            }
        };
    }

    if frame == ClientFrame::Disconnect {
        return ControlFlow::Break(());
    }

    let Some(principal) = ctx.principal().cloned() else {
        debug!("{} before CONNECT on connection {}", frame.command(), ctx.id());
        reply(tx, ctx.id(), ServerFrame::error(GENERIC_AUTH_MESSAGE, None));
        return ControlFlow::Continue(());
    };

    match frame {
        ClientFrame::Subscribe { id, destination } => {
            match state.relay.authorize_subscription(&principal, &destination).await {
                Ok(_) => {
                    state.broker.subscribe(ctx.id(), &id, &destination).await;
                    audit::record(
                        Lifecycle::Subscribe,
                        ctx.id(),
                        Some(&principal.subject_id),
                        &format!("id={id} destination={destination}"),
                    );
                }
                Err(e) => {
                    reply(tx, ctx.id(), ServerFrame::error(e.to_string(), Some(&destination)));
                }
            }
        }
        ClientFrame::Unsubscribe { id } => {
            if !state.broker.unsubscribe(ctx.id(), &id).await {
                debug!("Unsubscribe of unknown id {} on connection {}", id, ctx.id());
            }
        }
        ClientFrame::Send { destination, body } => {
            let relay = state.relay.clone();
            let replies = tx.clone();
            let dest = destination.clone();
            let conn_id = ctx.id();
            let job = async move {
                if let Err(e) = relay.route(&principal, &dest, body).await {
                    debug!("SEND to {} by {} refused: {}", dest, principal.subject_id, e);
                    reply(&replies, conn_id, ServerFrame::error(e.to_string(), Some(&dest)));
                }
            };
            if inbound.submit(job).is_err() {
                reply(
                    tx,
                    ctx.id(),
                    ServerFrame::error("Server is busy, frame rejected", Some(&destination)),
                );
            }
        }
        ClientFrame::Connect { .. } | ClientFrame::Disconnect => {}
    }

    ControlFlow::Continue(())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Application fixtures.

    use super::*;
    use crate::auth::testing::SECRET;
    use crate::config::{ConfirmationMode, MatchingConfig, TokenConfig};
    use crate::core::store::testing::{directory, user};
    use crate::core::store::Gender;
    use chrono::NaiveDate;

    /// State with `alice` (F), `bob` (M) and `carol` (F), all with password `pw`.
    pub async fn state(mode: ConfirmationMode) -> AppState {
        let birth = |y| NaiveDate::from_ymd_opt(y, 4, 2).unwrap();
        let users = directory(vec![
            user(1, "alice", Gender::F, birth(2000), "pw"),
            user(2, "bob", Gender::M, birth(1999), "pw"),
            user(3, "carol", Gender::F, birth(2001), "pw"),
        ])
        .await;
        let config = AppConfig {
            token: TokenConfig {
                secret: SECRET.into(),
                ..Default::default()
            },
            matching: MatchingConfig {
                confirmation: mode,
                ..Default::default()
            },
            ..Default::default()
        };
        AppState::new(config, Storage::in_memory(users)).unwrap()
    }
}
