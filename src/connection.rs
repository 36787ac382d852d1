use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use itertools::Itertools;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite as tungsten;
use tokio_tungstenite::WebSocketStream;
use tungstenite::Message;

use crate::app::ServerState;
use crate::common::{Position, Region};
use crate::engine::{FlagOutcome, RevealOutcome};
use crate::protocol::{CellView, ClientMessage, MapChunk, PlayerView, ServerMessage};
use crate::registry::{SessionHandle, OUTBOUND_QUEUE};
use crate::store::{with_retry, StoreError};

enum Flow {
    Continue,
    Terminate,
}

/// Runs one client connection from handshake to cleanup. The task owns the
/// socket; everything else reaches the client through the session's bounded
/// outbound queue, whose senders live only in the registry, so an eviction
/// anywhere closes the queue and ends this loop.
pub async fn serve(state: Arc<ServerState>, stream: TcpStream) {
    let mut ws = match tungsten::accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            log::debug!("websocket handshake failed: {err}");
            return;
        }
    };

    let player_id = state.registry.mint_player_id();
    let player = match with_retry(|| state.store.find_or_create_player(&player_id)).await {
        Ok(player) => player,
        Err(err) => {
            log::error!("could not bootstrap player {player_id}: {err}");
            let _ = send_direct(
                &mut ws,
                &ServerMessage::Error {
                    message: "storage unavailable".into(),
                },
            )
            .await;
            let _ = ws.close(None).await;
            return;
        }
    };

    let conn = state.registry.mint_conn_id();
    let (outbound, mut queue) = mpsc::channel(OUTBOUND_QUEUE);
    let session = state
        .registry
        .insert(conn, player_id.clone(), player.score, outbound)
        .await;

    if let Err(err) = announce_join(&state, session).await {
        log::error!("could not assemble the initial snapshot for {player_id}: {err}");
        state.registry.remove_conn(conn).await;
        let _ = send_direct(
            &mut ws,
            &ServerMessage::Error {
                message: "storage failure".into(),
            },
        )
        .await;
        let _ = ws.close(None).await;
        return;
    }
    log::info!("{player_id} joined with score {}", player.score);

    loop {
        tokio::select! {
            frame = queue.recv() => match frame {
                Some(frame) => {
                    if ws.send(frame).await.is_err() {
                        // transport send failure terminates the session
                        break;
                    }
                }
                None => {
                    // evicted elsewhere; the registry entry is already gone
                    let _ = ws.close(None).await;
                    break;
                }
            },
            inbound = ws.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    match dispatch(&state, &player_id, &text).await {
                        Flow::Continue => {}
                        Flow::Terminate => break,
                    }
                }
                Some(Ok(Message::Binary(_))) => {
                    if !reply(&state, &player_id, &ServerMessage::Error {
                        message: "expected text frames".into(),
                    })
                    .await
                    {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong noise
                Some(Err(err)) => {
                    log::debug!("websocket read failed for {player_id}: {err}");
                    break;
                }
            }
        }
    }

    // resolve the transport back to its player; a session evicted elsewhere
    // is already gone and needs no second announcement
    if let Some(player_id) = state.registry.lookup_conn(conn).await {
        evict(&state, vec![player_id]).await;
    }
}

/// Assembles and enqueues the joiner's `initialState`, then announces the
/// join to everyone else overlapping the joiner's viewport.
async fn announce_join(state: &Arc<ServerState>, session: SessionHandle) -> Result<(), StoreError> {
    let region = Region::viewport(session.cursor);
    let records = with_retry(|| state.store.cells_in_region(region)).await?;
    let cells = records.iter().map(CellView::from_record).collect_vec();
    let players = state
        .registry
        .sessions_in_region(region, Some(&session.player_id))
        .await
        .into_iter()
        .map(|peer| PlayerView {
            id: peer.player_id,
            x: peer.cursor.x(),
            y: peer.cursor.y(),
        })
        .collect_vec();

    let initial = ServerMessage::InitialState {
        player_id: session.player_id.clone(),
        score: session.score,
        map_chunk: MapChunk { cells },
        players,
        self_position: session.cursor.into(),
    };
    enqueue(&session.outbound, &initial);

    let joined = ServerMessage::PlayerJoined {
        id: session.player_id.clone(),
        x: session.cursor.x(),
        y: session.cursor.y(),
    };
    let dead = state
        .broadcaster
        .broadcast(region, &joined, Some(&session.player_id))
        .await;
    evict(state, dead).await;
    Ok(())
}

/// Decodes one inbound text frame and routes it. Unknown kinds are dropped,
/// malformed payloads get a single error reply, and every real message
/// refreshes the player's `last_seen`.
async fn dispatch(state: &Arc<ServerState>, player_id: &str, text: &str) -> Flow {
    if let Err(err) = with_retry(|| state.store.touch_player(player_id)).await {
        return storage_failure(state, player_id, err).await;
    }

    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(_) => return handle_undecodable(state, player_id, text).await,
    };

    match message {
        ClientMessage::ClickCell { x, y } => handle_click(state, player_id, x, y).await,
        ClientMessage::FlagCell { x, y } => handle_flag(state, player_id, x, y).await,
        ClientMessage::UpdatePosition { x, y } => handle_cursor(state, player_id, x, y).await,
    }
}

async fn handle_undecodable(state: &Arc<ServerState>, player_id: &str, text: &str) -> Flow {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(text) {
        if let Some(kind) = value.get("type").and_then(|t| t.as_str()) {
            if !ClientMessage::KNOWN_KINDS.contains(&kind) {
                log::debug!("dropping message of unknown kind {kind:?} from {player_id}");
                return Flow::Continue;
            }
        }
    }
    reply_or_terminate(
        state,
        player_id,
        &ServerMessage::Error {
            message: "malformed message".into(),
        },
    )
    .await
}

async fn handle_click(state: &Arc<ServerState>, player_id: &str, x: i64, y: i64) -> Flow {
    let Some(pos) = Position::checked(x, y) else {
        return reply_or_terminate(
            state,
            player_id,
            &ServerMessage::Error {
                message: "cell coordinates out of range".into(),
            },
        )
        .await;
    };

    let outcome = match with_retry(|| state.engine.reveal(player_id, pos)).await {
        Ok(outcome) => outcome,
        Err(err) => return storage_failure(state, player_id, err).await,
    };

    match outcome {
        RevealOutcome::Ignored => Flow::Continue,
        RevealOutcome::MineHit {
            score,
            stun_ms,
            cells,
        } => {
            state.registry.update_score(player_id, score).await;
            let flow = reply_or_terminate(
                state,
                player_id,
                &ServerMessage::PlayerPenalty {
                    score,
                    stun_duration_ms: stun_ms,
                },
            )
            .await;
            broadcast_cells(state, pos, cells).await;
            flow
        }
        RevealOutcome::Safe { score, cells } => {
            state.registry.update_score(player_id, score).await;
            let flow =
                reply_or_terminate(state, player_id, &ServerMessage::ScoreUpdate { score }).await;
            broadcast_cells(state, pos, cells).await;
            flow
        }
    }
}

async fn handle_flag(state: &Arc<ServerState>, player_id: &str, x: i64, y: i64) -> Flow {
    let Some(pos) = Position::checked(x, y) else {
        return reply_or_terminate(
            state,
            player_id,
            &ServerMessage::Error {
                message: "cell coordinates out of range".into(),
            },
        )
        .await;
    };

    match with_retry(|| state.engine.toggle_flag(pos)).await {
        Ok(FlagOutcome::Ignored) => Flow::Continue,
        Ok(FlagOutcome::Flagged(cell)) | Ok(FlagOutcome::Unflagged(cell)) => {
            broadcast_cells(state, pos, vec![cell]).await;
            Flow::Continue
        }
        Err(err) => storage_failure(state, player_id, err).await,
    }
}

async fn handle_cursor(state: &Arc<ServerState>, player_id: &str, x: f64, y: f64) -> Flow {
    let Some(cursor) = state.registry.update_cursor(player_id, x, y).await else {
        return Flow::Terminate;
    };
    let update = ServerMessage::PlayerPositionUpdate {
        players: vec![PlayerView {
            id: player_id.to_string(),
            x: cursor.x(),
            y: cursor.y(),
        }],
    };
    let dead = state
        .broadcaster
        .broadcast(Region::viewport(cursor), &update, Some(player_id))
        .await;
    evict(state, dead).await;
    Flow::Continue
}

async fn broadcast_cells(state: &Arc<ServerState>, center: Position, cells: Vec<CellView>) {
    let dead = state
        .broadcaster
        .broadcast(
            Region::viewport(center),
            &ServerMessage::MapUpdate { cells },
            None,
        )
        .await;
    evict(state, dead).await;
}

async fn storage_failure(state: &Arc<ServerState>, player_id: &str, err: StoreError) -> Flow {
    if err.is_retryable() {
        log::warn!("action by {player_id} failed retryably: {err}");
        reply_or_terminate(
            state,
            player_id,
            &ServerMessage::Error {
                message: "action failed, try again".into(),
            },
        )
        .await
    } else {
        log::error!("losing session {player_id} to storage: {err}");
        reply(
            state,
            player_id,
            &ServerMessage::Error {
                message: "storage failure".into(),
            },
        )
        .await;
        Flow::Terminate
    }
}

/// Enqueues a frame onto the player's own queue. False means the session is
/// gone or its queue is saturated, which by policy ends the session.
async fn reply(state: &Arc<ServerState>, player_id: &str, message: &ServerMessage) -> bool {
    match state.registry.get(player_id).await {
        Some(session) => enqueue(&session.outbound, message),
        None => false,
    }
}

async fn reply_or_terminate(
    state: &Arc<ServerState>,
    player_id: &str,
    message: &ServerMessage,
) -> Flow {
    if reply(state, player_id, message).await {
        Flow::Continue
    } else {
        Flow::Terminate
    }
}

fn enqueue(outbound: &mpsc::Sender<Message>, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(frame) => outbound.try_send(Message::Text(frame)).is_ok(),
        Err(err) => {
            log::error!("dropping unserializable frame: {err}");
            true
        }
    }
}

/// Removes sessions and announces each departure to its neighbourhood.
/// Announcing can surface further dead recipients, so this chases the chain
/// until it dries up; re-removal of an already-gone id is a no-op, which
/// keeps the whole path idempotent and terminating.
pub async fn evict(state: &Arc<ServerState>, mut pending: Vec<String>) {
    while let Some(player_id) = pending.pop() {
        let Some(session) = state.registry.remove_player(&player_id).await else {
            continue;
        };
        if let Err(err) = state.store.touch_player(&player_id).await {
            log::debug!("could not stamp last_seen for {player_id}: {err}");
        }
        log::info!("{player_id} left");
        let left = ServerMessage::PlayerLeft {
            id: session.player_id.clone(),
        };
        let more = state
            .broadcaster
            .broadcast(Region::viewport(session.cursor), &left, Some(&player_id))
            .await;
        pending.extend(more);
    }
}

async fn send_direct(
    ws: &mut WebSocketStream<TcpStream>,
    message: &ServerMessage,
) -> Result<(), tungstenite::Error> {
    match serde_json::to_string(message) {
        Ok(frame) => ws.send(Message::Text(frame)).await,
        Err(_) => Ok(()),
    }
}
