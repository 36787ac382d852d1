use std::sync::Arc;

use tungstenite::Message;

use crate::common::Region;
use crate::protocol::ServerMessage;
use crate::registry::SessionRegistry;

/// Fans a message out to every session whose cursor falls inside a region.
/// The frame is serialised once; delivery is a non-blocking enqueue onto
/// each recipient's bounded outbound queue, so one saturated client can
/// never stall the rest.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<SessionRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Broadcaster { registry }
    }

    /// Delivers `message` to the region, skipping `exclude`. Returns the ids
    /// of recipients whose queue was full or closed; the caller is expected
    /// to evict them. Failures never abort the fan-out.
    pub async fn broadcast(
        &self,
        region: Region,
        message: &ServerMessage,
        exclude: Option<&str>,
    ) -> Vec<String> {
        let recipients = self.registry.sessions_in_region(region, exclude).await;
        if recipients.is_empty() {
            return Vec::new();
        }

        let frame = match serde_json::to_string(message) {
            Ok(frame) => frame,
            Err(err) => {
                log::error!("dropping unserializable broadcast: {err}");
                return Vec::new();
            }
        };

        let mut dead = Vec::new();
        for recipient in recipients {
            if recipient
                .outbound
                .try_send(Message::Text(frame.clone()))
                .is_err()
            {
                log::warn!(
                    "outbound queue unavailable for {}, scheduling eviction",
                    recipient.player_id
                );
                dead.push(recipient.player_id);
            }
        }
        dead
    }
}
