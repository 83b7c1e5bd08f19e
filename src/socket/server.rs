//! # Websocket Server
//!
//! One task per connection. The handshake must carry a bearer token (an
//! `Authorization` header or a `token` query parameter); the connection is
//! registered for its lifetime and its subscriptions end when it closes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::auth::{bearer, query_token, TokenError, TokenVerifier};
use super::protocol::{ClientMessage, ServerMessage};
use crate::config::SocketConfig;
use crate::engine::Engine;
use crate::errors::{LiveError, LiveResult};
use crate::mutation::retry_on_conflict;
use crate::object::{Identity, NewObject, ObjectId};
use crate::registry::SocketSession;
use crate::streamer::Delivery;

/// Websocket front end for an engine
pub struct SocketServer {
    engine: Arc<Engine>,
    verifier: Arc<TokenVerifier>,
    config: SocketConfig,
    shutdown_tx: broadcast::Sender<()>,
}

impl SocketServer {
    pub fn new(engine: Arc<Engine>, verifier: TokenVerifier, config: SocketConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            engine,
            verifier: Arc::new(verifier),
            config,
            shutdown_tx,
        }
    }

    /// Stop accepting and close every open connection
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> LiveResult<()> {
        let addr: SocketAddr = self
            .config
            .bind_addr
            .parse()
            .map_err(|e| LiveError::validation(format!("Invalid bind address: {}", e)))?;
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| LiveError::internal(format!("Failed to bind {}: {}", addr, e)))?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener until shutdown
    pub async fn serve(&self, listener: TcpListener) -> LiveResult<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "Socket server listening");
        }
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let connection = Connection {
                            engine: Arc::clone(&self.engine),
                            verifier: Arc::clone(&self.verifier),
                            heartbeat: Duration::from_secs(self.config.heartbeat_secs.max(1)),
                            shutdown: self.shutdown_tx.subscribe(),
                        };
                        tokio::spawn(async move {
                            if let Err(e) = connection.run(stream, peer).await {
                                warn!(peer = %peer, error = %e, "Connection ended with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "Accept failed"),
                },
                _ = shutdown_rx.recv() => {
                    info!("Socket server shutting down");
                    return Ok(());
                }
            }
        }
    }
}

struct Connection {
    engine: Arc<Engine>,
    verifier: Arc<TokenVerifier>,
    heartbeat: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl Connection {
    async fn run(mut self, stream: TcpStream, peer: SocketAddr) -> LiveResult<()> {
        let mut identity: Result<Identity, TokenError> = Err(TokenError::Missing);
        let verifier = Arc::clone(&self.verifier);
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let token = request
                .headers()
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .and_then(bearer)
                .or_else(|| request.uri().query().and_then(query_token));
            identity = match token {
                Some(token) => verifier.verify(token),
                None => Err(TokenError::Missing),
            };
            match &identity {
                Ok(_) => Ok(response),
                Err(e) => {
                    let mut denied = ErrorResponse::new(Some(e.to_string()));
                    *denied.status_mut() = StatusCode::UNAUTHORIZED;
                    Err(denied)
                }
            }
        };

        let ws = accept_hdr_async(stream, callback)
            .await
            .map_err(|e| LiveError::validation(format!("Handshake failed: {}", e)))?;
        let identity = identity.map_err(|e| LiveError::forbidden(e.to_string()))?;

        let (session, mut pushes) = self.engine.register(identity)?;
        let (mut sink, mut frames) = ws.split();
        info!(socket_id = %session.id(), peer = %peer, identity = %session.identity(), "Socket connected");

        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                frame = frames.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        let reply = self.handle_text(&session, &text).await;
                        if let Err(e) = send_json(&mut sink, &reply).await {
                            debug!(socket_id = %session.id(), error = %e, "Reply failed");
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        let reply = ServerMessage::malformed("binary frames are not supported");
                        if send_json(&mut sink, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(socket_id = %session.id(), error = %e, "Receive failed");
                        break;
                    }
                    Some(Ok(_)) => {}
                },
                delivery = pushes.recv() => match delivery {
                    Some(delivery) => {
                        if let Err(e) = send_delivery(&mut sink, &delivery).await {
                            debug!(socket_id = %session.id(), error = %e, "Push failed");
                            break;
                        }
                    }
                    None => break,
                },
                _ = heartbeat.tick() => {
                    if sink.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
                _ = self.shutdown.recv() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        info!(socket_id = %session.id(), "Socket closed");
        // Dropping the session tears down its subscriptions and backfills.
        drop(session);
        Ok(())
    }

    async fn handle_text(&self, session: &SocketSession, text: &str) -> ServerMessage {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => message,
            Err(e) => return ServerMessage::malformed(format!("Invalid message: {}", e)),
        };
        let message_id = message.message_id().to_string();
        match self.dispatch(session, message).await {
            Ok(reply) => reply,
            Err(e) => {
                debug!(socket_id = %session.id(), message_id = %message_id, error = %e, "Request failed");
                ServerMessage::failure(Some(message_id), &e)
            }
        }
    }

    async fn dispatch(&self, session: &SocketSession, message: ClientMessage) -> LiveResult<ServerMessage> {
        let engine = &self.engine;
        let caller = session.identity();
        let retry = engine.config().lock_retry;

        match message {
            ClientMessage::Update {
                message_id,
                object,
                id_proof,
            } => {
                let object = NewObject::from_wire(object).map_err(LiveError::Validation)?;
                let id = match id_proof {
                    None => engine.create(object, caller).await?,
                    Some(proof) => {
                        let id = object
                            .id
                            .clone()
                            .ok_or_else(|| LiveError::validation("replace requires an object _id"))?;
                        retry_on_conflict(&retry, || {
                            engine.replace(&id, object.clone(), &proof, caller)
                        })
                        .await?
                    }
                };
                Ok(ServerMessage::created(message_id, id))
            }
            ClientMessage::Delete {
                message_id,
                object_id,
            } => {
                let id = ObjectId::parse(&object_id)
                    .ok_or_else(|| LiveError::not_found(format!("object {}", object_id)))?;
                retry_on_conflict(&retry, || engine.remove(&id, caller)).await?;
                Ok(ServerMessage::success(message_id))
            }
            ClientMessage::Subscribe {
                message_id,
                query,
                since,
                query_id,
            } => {
                let subscription = engine
                    .subscribe(session.id(), &query, since, caller, query_id)
                    .await?;
                Ok(ServerMessage::subscribed(
                    message_id,
                    subscription.key.query_id,
                ))
            }
            ClientMessage::Unsubscribe {
                message_id,
                query_id,
            } => {
                engine.unsubscribe(session.id(), &query_id, caller).await?;
                Ok(ServerMessage::success(message_id))
            }
        }
    }
}

async fn send_json<S>(sink: &mut S, value: &ServerMessage) -> LiveResult<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(value).map_err(|e| LiveError::internal(e.to_string()))?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| LiveError::internal(e.to_string()))
}

async fn send_delivery<S>(sink: &mut S, delivery: &Delivery) -> LiveResult<()>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(&delivery.messages)
        .map_err(|e| LiveError::internal(e.to_string()))?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| LiveError::internal(e.to_string()))
}
