use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;

use crate::broadcast::Broadcaster;
use crate::connection;
use crate::engine::Engine;
use crate::registry::SessionRegistry;
use crate::store::Store;

/// Everything a connection task needs, created once at startup and passed by
/// handle. The registry is the only shared mutable state; the store owns all
/// durable state.
pub struct ServerState {
    pub registry: Arc<SessionRegistry>,
    pub store: Store,
    pub engine: Engine,
    pub broadcaster: Broadcaster,
}

pub struct App {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl App {
    pub async fn bind(address: SocketAddr, state: Arc<ServerState>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(App { listener, state })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts until interrupted, then tears down: stop accepting, close
    /// every session's queue so its task winds down, wait for the stragglers,
    /// and only then close the store.
    pub async fn run(self) {
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("shutting down");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        log::debug!("connection from {peer}");
                        tasks.spawn(connection::serve(self.state.clone(), socket));
                    }
                    Err(err) => log::warn!("accept failed: {err}"),
                },
                // reap finished connection tasks so the set stays small
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        drop(self.listener);
        log::info!(
            "closing {} live sessions",
            self.state.registry.session_count().await
        );
        for session in self.state.registry.drain().await {
            log::debug!("closing session {}", session.player_id);
        }
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log::warn!("some sessions did not drain in time");
            tasks.abort_all();
        }
        self.state.store.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Position;
    use crate::oracle::MineOracle;
    use crate::protocol::{CellState, ClientMessage, ServerMessage};
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
    use tungstenite::Message;

    const SEED: &str = "TEST_SEED_A1B2C3D4";

    type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn spawn_app() -> (SocketAddr, Arc<ServerState>, JoinHandle<()>) {
        let store = Store::open_in_memory().await.unwrap();
        let registry = Arc::new(SessionRegistry::new());
        let state = Arc::new(ServerState {
            engine: Engine::new(store.clone(), MineOracle::new(SEED)),
            broadcaster: Broadcaster::new(registry.clone()),
            registry,
            store,
        });
        let app = App::bind("127.0.0.1:0".parse().unwrap(), state.clone())
            .await
            .unwrap();
        let addr = app.local_addr().unwrap();
        let server = tokio::spawn(app.run());
        (addr, state, server)
    }

    async fn connect(addr: SocketAddr) -> ClientWs {
        let (ws, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        ws
    }

    async fn send(ws: &mut ClientWs, message: &ClientMessage) {
        let frame = serde_json::to_string(message).unwrap();
        ws.send(Message::Text(frame)).await.unwrap();
    }

    async fn recv(ws: &mut ClientWs, wait: Duration) -> Option<ServerMessage> {
        loop {
            match tokio::time::timeout(wait, ws.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    return Some(serde_json::from_str(&text).expect("undecodable server frame"))
                }
                Ok(Some(Ok(_))) => continue,
                Ok(Some(Err(_))) | Ok(None) | Err(_) => return None,
            }
        }
    }

    async fn expect_initial(ws: &mut ClientWs) -> (String, i64, Vec<String>) {
        match recv(ws, Duration::from_secs(5)).await {
            Some(ServerMessage::InitialState {
                player_id,
                score,
                players,
                ..
            }) => (
                player_id,
                score,
                players.into_iter().map(|p| p.id).collect(),
            ),
            other => panic!("expected initialState, got {other:?}"),
        }
    }

    async fn wait_for_cursor(state: &ServerState, player_id: &str, expected: Position) {
        for _ in 0..200 {
            if state.registry.get(player_id).await.map(|s| s.cursor) == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("cursor of {player_id} never reached {expected:?}");
    }

    /// Scans the joiner's starting viewport for a cell matching `pred`; the
    /// seeded world is dense enough for every predicate used here.
    fn find_near_center(pred: impl Fn(&MineOracle, Position) -> bool) -> Position {
        let oracle = MineOracle::new(SEED);
        let center = Position::center();
        for dy in -19i64..=19 {
            for dx in -29i64..=29 {
                let pos = Position(
                    (center.x() as i64 + dx) as u32,
                    (center.y() as i64 + dy) as u32,
                );
                if pred(&oracle, pos) {
                    return pos;
                }
            }
        }
        panic!("no cell near the center matches under this seed");
    }

    #[tokio::test]
    async fn reveal_and_penalty_flow_over_the_wire() {
        let (addr, state, server) = spawn_app().await;
        let mut client = connect(addr).await;
        let (player_id, score, peers) = expect_initial(&mut client).await;
        assert_eq!(score, 0);
        assert!(peers.is_empty());

        // a numbered safe cell reveals exactly itself
        let safe = find_near_center(|o, p| !o.is_mine(p) && o.adjacent_mines(p) > 0);
        send(
            &mut client,
            &ClientMessage::ClickCell {
                x: safe.x() as i64,
                y: safe.y() as i64,
            },
        )
        .await;
        match recv(&mut client, Duration::from_secs(5)).await {
            Some(ServerMessage::ScoreUpdate { score }) => assert_eq!(score, 1),
            other => panic!("expected scoreUpdate, got {other:?}"),
        }
        match recv(&mut client, Duration::from_secs(5)).await {
            Some(ServerMessage::MapUpdate { cells }) => {
                assert_eq!(cells.len(), 1);
                assert_eq!(cells[0].state, CellState::Revealed);
                assert_eq!((cells[0].x, cells[0].y), (safe.x(), safe.y()));
            }
            other => panic!("expected mapUpdate, got {other:?}"),
        }

        // stepping on a mine penalizes and is broadcast as a mine cell
        let mine = find_near_center(|o, p| o.is_mine(p));
        send(
            &mut client,
            &ClientMessage::ClickCell {
                x: mine.x() as i64,
                y: mine.y() as i64,
            },
        )
        .await;
        match recv(&mut client, Duration::from_secs(5)).await {
            Some(ServerMessage::PlayerPenalty {
                score,
                stun_duration_ms,
            }) => {
                assert_eq!(score, 1 - 50);
                assert_eq!(stun_duration_ms, 3000);
            }
            other => panic!("expected playerPenalty, got {other:?}"),
        }
        match recv(&mut client, Duration::from_secs(5)).await {
            Some(ServerMessage::MapUpdate { cells }) => {
                assert_eq!(cells.len(), 1);
                assert_eq!(cells[0].state, CellState::Mine);
                assert_eq!(cells[0].value, Some(-1));
            }
            other => panic!("expected mapUpdate, got {other:?}"),
        }

        let record = state.store.get_cell(mine).await.unwrap().unwrap();
        assert!(record.revealed && record.is_mine);
        assert_eq!(state.store.add_to_player_score(&player_id, 0).await.unwrap(), -49);

        server.abort();
    }

    #[tokio::test]
    async fn flag_toggle_round_trip_over_the_wire() {
        let (addr, state, server) = spawn_app().await;
        let mut client = connect(addr).await;
        expect_initial(&mut client).await;

        let target = Position(Position::center().x() + 1, Position::center().y() + 1);
        let click = ClientMessage::FlagCell {
            x: target.x() as i64,
            y: target.y() as i64,
        };

        send(&mut client, &click).await;
        match recv(&mut client, Duration::from_secs(5)).await {
            Some(ServerMessage::MapUpdate { cells }) => {
                assert_eq!(cells[0].state, CellState::Flagged)
            }
            other => panic!("expected mapUpdate, got {other:?}"),
        }
        assert!(state.store.get_cell(target).await.unwrap().unwrap().flagged);

        send(&mut client, &click).await;
        match recv(&mut client, Duration::from_secs(5)).await {
            Some(ServerMessage::MapUpdate { cells }) => {
                assert_eq!(cells[0].state, CellState::Hidden)
            }
            other => panic!("expected mapUpdate, got {other:?}"),
        }
        assert_eq!(state.store.get_cell(target).await.unwrap(), None);

        server.abort();
    }

    #[tokio::test]
    async fn join_visibility_follows_viewports() {
        let (addr, state, server) = spawn_app().await;

        let mut far = connect(addr).await;
        let (far_id, _, _) = expect_initial(&mut far).await;
        send(&mut far, &ClientMessage::UpdatePosition { x: 500.0, y: 500.0 }).await;
        wait_for_cursor(&state, &far_id, Position(500, 500)).await;

        let mut a = connect(addr).await;
        let (a_id, _, a_peers) = expect_initial(&mut a).await;
        assert!(a_peers.is_empty(), "the far player should be out of sight");
        send(&mut a, &ClientMessage::UpdatePosition { x: 300.0, y: 300.0 }).await;
        wait_for_cursor(&state, &a_id, Position(300, 300)).await;

        let mut b = connect(addr).await;
        let (b_id, _, b_peers) = expect_initial(&mut b).await;
        assert_eq!(b_peers, vec![a_id.clone()]);
        send(&mut b, &ClientMessage::UpdatePosition { x: 310.0, y: 310.0 }).await;
        wait_for_cursor(&state, &b_id, Position(310, 310)).await;

        let mut c = connect(addr).await;
        let (c_id, _, c_peers) = expect_initial(&mut c).await;
        assert_eq!(c_peers.len(), 2);
        assert!(c_peers.contains(&a_id) && c_peers.contains(&b_id));

        // a and b each hear about c exactly once; the far player hears nothing
        for ws in [&mut a, &mut b] {
            let mut joined = 0;
            while let Some(message) = recv(ws, Duration::from_millis(300)).await {
                if matches!(&message, ServerMessage::PlayerJoined { id, .. } if *id == c_id) {
                    joined += 1;
                }
            }
            assert_eq!(joined, 1);
        }
        assert!(recv(&mut far, Duration::from_millis(300)).await.is_none());

        server.abort();
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_keep_the_session() {
        let (addr, _state, server) = spawn_app().await;
        let mut client = connect(addr).await;
        expect_initial(&mut client).await;

        // unknown kind: logged and dropped, no reply
        client
            .send(Message::Text(
                r#"{"type": "teleport", "data": {}}"#.to_string(),
            ))
            .await
            .unwrap();
        assert!(recv(&mut client, Duration::from_millis(300)).await.is_none());

        // malformed payload: one error reply, session stays up
        client
            .send(Message::Text(
                r#"{"type": "clickCell", "data": {"x": "not a number"}}"#.to_string(),
            ))
            .await
            .unwrap();
        match recv(&mut client, Duration::from_secs(5)).await {
            Some(ServerMessage::Error { .. }) => {}
            other => panic!("expected an error reply, got {other:?}"),
        }

        // out-of-range coordinates: rejected, session stays up
        send(&mut client, &ClientMessage::ClickCell { x: 9999, y: 0 }).await;
        match recv(&mut client, Duration::from_secs(5)).await {
            Some(ServerMessage::Error { .. }) => {}
            other => panic!("expected an error reply, got {other:?}"),
        }

        // the session still works afterwards
        let target = Position(Position::center().x() + 2, Position::center().y() + 2);
        send(
            &mut client,
            &ClientMessage::FlagCell {
                x: target.x() as i64,
                y: target.y() as i64,
            },
        )
        .await;
        assert!(matches!(
            recv(&mut client, Duration::from_secs(5)).await,
            Some(ServerMessage::MapUpdate { .. })
        ));

        server.abort();
    }
}
