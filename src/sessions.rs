//! Live messaging sessions.
//!
//! Clients open a websocket under a session handle of their choosing and pass the
//! same handle on login; the handle is stored on the user row and used to push
//! short notifications such as `BalanceAdded`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        FromRef, Path, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::state::AppState;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("no live session {0:?}")]
    UnknownSession(String),
    #[error("session {0:?} is closed")]
    Closed(String),
}

/// Delivers a message to a live session.
#[async_trait]
pub trait SessionNotifier: Send + Sync {
    async fn send(&self, session: &str, message: &str) -> Result<(), NotifyError>;
}

/// Sends `message` if the user has a session; failures are logged, never returned.
pub async fn notify_best_effort(
    notifier: &dyn SessionNotifier,
    session: Option<&str>,
    message: &str,
) {
    let Some(session) = session.filter(|s| !s.is_empty()) else {
        return;
    };
    if let Err(e) = notifier.send(session, message).await {
        warn!(error = %e, %session, %message, "session notification not delivered");
    }
}

struct Connection {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

/// In-process registry of open session sockets.
#[derive(Default)]
pub struct SessionHub {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<String, Connection>>,
}

/// Receiving side of a registered session.
pub struct SessionHandle {
    pub id: u64,
    pub rx: mpsc::UnboundedReceiver<String>,
}

impl SessionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle`, replacing any previous connection under it.
    pub fn connect(&self, handle: &str) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(handle.to_string(), Connection { id, tx });
        debug!(%handle, conn = id, "session connected");
        SessionHandle { id, rx }
    }

    /// Removes `handle` unless it has since been taken over by a newer connection.
    pub fn disconnect(&self, handle: &str, id: u64) {
        let mut sessions = self.lock();
        if sessions.get(handle).is_some_and(|c| c.id == id) {
            sessions.remove(handle);
            debug!(%handle, conn = id, "session disconnected");
        }
    }

    pub fn is_live(&self, handle: &str) -> bool {
        self.lock().contains_key(handle)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Connection>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl SessionNotifier for SessionHub {
    async fn send(&self, session: &str, message: &str) -> Result<(), NotifyError> {
        let sessions = self.lock();
        let conn = sessions
            .get(session)
            .ok_or_else(|| NotifyError::UnknownSession(session.to_string()))?;
        conn.tx
            .send(message.to_string())
            .map_err(|_| NotifyError::Closed(session.to_string()))
    }
}

impl FromRef<AppState> for Arc<SessionHub> {
    fn from_ref(state: &AppState) -> Self {
        state.sessions.clone()
    }
}

pub fn router() -> Router<AppState> {
    Router::new().route("/sessions/ws/:handle", get(session_socket))
}

#[instrument(skip(ws, hub))]
async fn session_socket(
    ws: WebSocketUpgrade,
    Path(handle): Path<String>,
    State(hub): State<Arc<SessionHub>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| pump(socket, hub, handle))
}

async fn pump(mut socket: WebSocket, hub: Arc<SessionHub>, handle: String) {
    let SessionHandle { id, mut rx } = hub.connect(&handle);
    loop {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(text) => {
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    hub.disconnect(&handle, id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_to_connected_session() {
        let hub = SessionHub::new();
        let mut conn = hub.connect("abc");
        hub.send("abc", "BalanceAdded").await.unwrap();
        assert_eq!(conn.rx.recv().await.as_deref(), Some("BalanceAdded"));
    }

    #[tokio::test]
    async fn unknown_session_is_an_error() {
        let hub = SessionHub::new();
        let err = hub.send("nobody", "hi").await.unwrap_err();
        assert_eq!(err, NotifyError::UnknownSession("nobody".into()));
    }

    #[tokio::test]
    async fn stale_disconnect_keeps_newer_connection() {
        let hub = SessionHub::new();
        let old = hub.connect("abc");
        let mut new = hub.connect("abc");
        hub.disconnect("abc", old.id);
        assert!(hub.is_live("abc"));
        hub.send("abc", "ping").await.unwrap();
        assert_eq!(new.rx.recv().await.as_deref(), Some("ping"));
        hub.disconnect("abc", new.id);
        assert!(!hub.is_live("abc"));
    }

    #[tokio::test]
    async fn dropped_receiver_reports_closed() {
        let hub = SessionHub::new();
        drop(hub.connect("gone"));
        let err = hub.send("gone", "hi").await.unwrap_err();
        assert_eq!(err, NotifyError::Closed("gone".into()));
    }

    #[tokio::test]
    async fn best_effort_ignores_missing_session() {
        let hub = SessionHub::new();
        notify_best_effort(&hub, None, "x").await;
        notify_best_effort(&hub, Some(""), "x").await;
        notify_best_effort(&hub, Some("missing"), "x").await;
    }
}
