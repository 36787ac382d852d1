use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use itertools::Itertools;
use tokio::sync::{mpsc, RwLock};
use tungstenite::Message;
use uuid::Uuid;

use crate::common::{Position, Region};

/// Identifies one accepted transport. Minted by the accept loop; a player id
/// never outlives its connection, but the two are kept as separate keys so a
/// send failure can be traced back from either side.
pub type ConnId = u64;

/// Frames a session's writer can still accept before the broadcaster gives
/// up on it.
pub const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug)]
pub struct Session {
    pub player_id: String,
    pub conn: ConnId,
    pub outbound: mpsc::Sender<Message>,
    pub cursor: Position,
    pub score: i64,
}

/// What region queries hand out: enough to address, place, and reach a
/// session without holding the registry lock.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    pub player_id: String,
    pub cursor: Position,
    pub score: i64,
    pub outbound: mpsc::Sender<Message>,
}

impl Session {
    fn handle(&self) -> SessionHandle {
        SessionHandle {
            player_id: self.player_id.clone(),
            cursor: self.cursor,
            score: self.score,
            outbound: self.outbound.clone(),
        }
    }
}

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    by_conn: HashMap<ConnId, String>,
}

/// In-memory index of everyone currently connected. The two maps move in
/// lockstep under one lock; nothing here touches storage or blocks on IO.
#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<Inner>,
    next_conn: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mint_conn_id(&self) -> ConnId {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }

    pub fn mint_player_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Places a fresh session at the map centre. The caller has already
    /// bootstrapped the player row and owns the receiving end of `outbound`.
    pub async fn insert(
        &self,
        conn: ConnId,
        player_id: String,
        score: i64,
        outbound: mpsc::Sender<Message>,
    ) -> SessionHandle {
        let session = Session {
            player_id: player_id.clone(),
            conn,
            outbound,
            cursor: Position::center(),
            score,
        };
        let handle = session.handle();
        let mut inner = self.inner.write().await;
        inner.by_conn.insert(conn, player_id.clone());
        inner.sessions.insert(player_id, session);
        handle
    }

    pub async fn remove_conn(&self, conn: ConnId) -> Option<Session> {
        let mut inner = self.inner.write().await;
        let player_id = inner.by_conn.remove(&conn)?;
        inner.sessions.remove(&player_id)
    }

    pub async fn remove_player(&self, player_id: &str) -> Option<Session> {
        let mut inner = self.inner.write().await;
        let session = inner.sessions.remove(player_id)?;
        inner.by_conn.remove(&session.conn);
        Some(session)
    }

    /// Clamps the raw cursor onto the map and stores it. Returns the clamped
    /// position, or nothing if the session is already gone.
    pub async fn update_cursor(&self, player_id: &str, x: f64, y: f64) -> Option<Position> {
        let mut inner = self.inner.write().await;
        let session = inner.sessions.get_mut(player_id)?;
        session.cursor = Position::clamped(x, y);
        Some(session.cursor)
    }

    pub async fn update_score(&self, player_id: &str, score: i64) {
        let mut inner = self.inner.write().await;
        if let Some(session) = inner.sessions.get_mut(player_id) {
            session.score = score;
        }
    }

    pub async fn get(&self, player_id: &str) -> Option<SessionHandle> {
        self.inner
            .read()
            .await
            .sessions
            .get(player_id)
            .map(Session::handle)
    }

    pub async fn lookup_conn(&self, conn: ConnId) -> Option<String> {
        self.inner.read().await.by_conn.get(&conn).cloned()
    }

    /// Every session whose cursor sits inside `region`, optionally without
    /// one excluded player. Linear in the number of live sessions.
    pub async fn sessions_in_region(
        &self,
        region: Region,
        exclude: Option<&str>,
    ) -> Vec<SessionHandle> {
        self.inner
            .read()
            .await
            .sessions
            .values()
            .filter(|s| exclude != Some(s.player_id.as_str()))
            .filter(|s| region.contains(s.cursor))
            .map(Session::handle)
            .collect_vec()
    }

    pub async fn session_count(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    /// Empties the registry, returning every session so teardown can close
    /// their queues.
    pub async fn drain(&self) -> Vec<Session> {
        let mut inner = self.inner.write().await;
        inner.by_conn.clear();
        inner.sessions.drain().map(|(_, s)| s).collect_vec()
    }
}
