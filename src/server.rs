use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, warn};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;
use warp::ws::{Message, WebSocket};

use crate::db::ChatDb;
use crate::events::{ClientEvent, Message as ChatMessage, ServerEvent, SystemKind};
use crate::media::MediaStore;
use crate::now_ms;
use crate::presence::{JoinOutcome, PresenceManager};
use crate::translate::TranslationService;

type Connections = Arc<RwLock<HashMap<String, mpsc::UnboundedSender<Message>>>>;

/// The room session protocol: every websocket event lands here, mutates
/// presence/message state and fans out to the room's live sockets. The
/// server owns no chat state of its own beyond the connection registry.
#[derive(Clone)]
pub struct ChatServer {
    db: Arc<ChatDb>,
    presence: Arc<PresenceManager>,
    media: Arc<MediaStore>,
    translator: Arc<TranslationService>,
    connections: Connections,
    default_expiry_hours: u32,
}

impl ChatServer {
    pub fn new(
        db: Arc<ChatDb>,
        presence: Arc<PresenceManager>,
        media: Arc<MediaStore>,
        translator: Arc<TranslationService>,
        default_expiry_hours: u32,
    ) -> Self {
        ChatServer {
            db,
            presence,
            media,
            translator,
            connections: Arc::new(RwLock::new(HashMap::new())),
            default_expiry_hours,
        }
    }

    pub async fn handle_connection(&self, ws: WebSocket) {
        let socket_id = Uuid::new_v4().to_string();
        let (mut ws_tx, mut ws_rx) = ws.split();
        let mut rx = self.register_connection(&socket_id).await;

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if ws_tx.send(message).await.is_err() {
                    break;
                }
            }
        });

        while let Some(result) = ws_rx.next().await {
            match result {
                Ok(msg) => {
                    let Ok(text) = msg.to_str() else { continue };
                    match serde_json::from_str::<ClientEvent>(text) {
                        Ok(event) => self.handle_event(&socket_id, event).await,
                        // malformed frames are dropped, never fatal
                        Err(e) => debug!("ignoring unparseable frame from {socket_id}: {e}"),
                    }
                }
                Err(e) => {
                    debug!("websocket error on {socket_id}: {e}");
                    break;
                }
            }
        }

        self.handle_disconnect(&socket_id).await;
    }

    /// Registers a socket and returns the receiving end of its outbound
    /// queue. `handle_connection` pumps it into the websocket; tests read
    /// it directly.
    pub async fn register_connection(&self, socket_id: &str) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.write().await.insert(socket_id.to_string(), tx);
        rx
    }

    pub async fn handle_event(&self, socket_id: &str, event: ClientEvent) {
        match event {
            ClientEvent::Join { room_id, nickname, user_id, lang } => {
                self.handle_join(socket_id, &room_id, &nickname, user_id, lang).await;
            }
            ClientEvent::Message { room, nickname, content, kind, media_path, reply_to } => {
                self.handle_message(socket_id, room, nickname, content, kind, media_path, reply_to)
                    .await;
            }
            ClientEvent::DeleteMessage { id } => self.handle_delete_message(socket_id, &id).await,
            ClientEvent::ClearRoom => self.handle_clear_room(socket_id).await,
            ClientEvent::ClearUserMessages => self.handle_clear_user_messages(socket_id).await,
            ClientEvent::Typing { is_typing } => self.handle_typing(socket_id, is_typing).await,
            ClientEvent::SetExpiry { hours } => self.handle_set_expiry(socket_id, hours).await,
            ClientEvent::MarkRead { id } => self.handle_mark_read(socket_id, &id).await,
            ClientEvent::TranslateMessage { msg_id, text, source_lang, target_lang } => {
                self.handle_translate(socket_id, msg_id, text, source_lang, target_lang).await;
            }
        }
    }

    async fn handle_join(
        &self,
        socket_id: &str,
        room_id: &str,
        nickname: &str,
        user_id: Option<String>,
        lang: Option<String>,
    ) {
        // older clients may not send a durable id yet
        let user_id = user_id.unwrap_or_else(|| format!("anon_{socket_id}"));
        let lang = lang.unwrap_or_else(|| "en".to_string());

        let outcome = self.presence.join(room_id, &user_id, nickname, &lang, socket_id).await;

        let history = self.db.get_messages(room_id).await;
        self.send_to_socket(socket_id, &ServerEvent::History { messages: history }).await;

        self.broadcast_user_list(room_id).await;

        // a reconnect inside the grace period stays silent
        if outcome == JoinOutcome::Fresh {
            self.broadcast(
                room_id,
                &ServerEvent::System {
                    kind: SystemKind::Join,
                    nickname: Some(nickname.to_string()),
                    hours: None,
                    content: None,
                    timestamp: now_ms(),
                },
            )
            .await;
        }

        let expiry =
            self.db.get_room_expiry(room_id).await.unwrap_or(self.default_expiry_hours);
        self.send_to_socket(socket_id, &ServerEvent::RoomConfig { expiry }).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_message(
        &self,
        socket_id: &str,
        room: String,
        nickname: String,
        content: Option<String>,
        kind: crate::events::MessageKind,
        media_path: Option<String>,
        reply_to: Option<crate::events::ReplyTo>,
    ) {
        if self.presence.resolve(socket_id).await.is_none() {
            warn!("dropping message from unregistered socket {socket_id}");
            return;
        }

        let draft = ChatMessage {
            id: String::new(),
            room_id: room.clone(),
            nickname,
            content,
            kind,
            media_path,
            timestamp: now_ms(),
            reply_to,
        };
        let stored = self.db.add_message(draft).await;
        self.broadcast(&room, &ServerEvent::Message { message: stored }).await;
    }

    async fn handle_delete_message(&self, socket_id: &str, id: &str) {
        let Some((room_id, _)) = self.presence.resolve(socket_id).await else {
            return;
        };
        let Some(deleted) = self.db.delete_message(id).await else {
            // nothing was deleted, nothing to announce
            return;
        };
        if let Some(path) = deleted.media_path {
            let media = self.media.clone();
            tokio::spawn(async move { media.delete_by_url(&path).await });
        }
        self.broadcast(&room_id, &ServerEvent::MessageDeleted { id: id.to_string() }).await;
    }

    async fn handle_clear_room(&self, socket_id: &str) {
        let Some((room_id, _)) = self.presence.resolve(socket_id).await else {
            return;
        };
        if self.db.clear_room(&room_id).await {
            self.broadcast(&room_id, &ServerEvent::RoomCleared).await;
            self.broadcast(
                &room_id,
                &ServerEvent::System {
                    kind: SystemKind::Info,
                    nickname: None,
                    hours: None,
                    content: Some("Chat history cleared.".to_string()),
                    timestamp: now_ms(),
                },
            )
            .await;
        }
    }

    async fn handle_clear_user_messages(&self, socket_id: &str) {
        let Some((room_id, user_id)) = self.presence.resolve(socket_id).await else {
            return;
        };
        let Some(nickname) = self.presence.nickname_of(&room_id, &user_id).await else {
            return;
        };
        if self.db.delete_messages_by_nickname(&room_id, &nickname).await {
            self.broadcast(&room_id, &ServerEvent::UserMessagesCleared { nickname }).await;
        }
    }

    async fn handle_typing(&self, socket_id: &str, is_typing: bool) {
        let Some((room_id, user_id)) = self.presence.resolve(socket_id).await else {
            return;
        };
        let Some(nickname) = self.presence.nickname_of(&room_id, &user_id).await else {
            return;
        };
        self.broadcast_except(
            &room_id,
            &ServerEvent::UserTyping { nickname, is_typing },
            Some(socket_id),
        )
        .await;
    }

    async fn handle_set_expiry(&self, socket_id: &str, hours: u32) {
        let Some((room_id, user_id)) = self.presence.resolve(socket_id).await else {
            return;
        };
        self.db.set_room_expiry(&room_id, hours).await;
        self.broadcast(&room_id, &ServerEvent::RoomConfig { expiry: hours }).await;

        let nickname = self
            .presence
            .nickname_of(&room_id, &user_id)
            .await
            .unwrap_or_else(|| "Someone".to_string());
        self.broadcast(
            &room_id,
            &ServerEvent::System {
                kind: SystemKind::Expiry,
                nickname: Some(nickname),
                hours: Some(hours),
                content: None,
                timestamp: now_ms(),
            },
        )
        .await;
    }

    async fn handle_mark_read(&self, socket_id: &str, id: &str) {
        let Some((room_id, user_id)) = self.presence.resolve(socket_id).await else {
            return;
        };
        let Some(reader) = self.presence.nickname_of(&room_id, &user_id).await else {
            return;
        };
        // best-effort UX signal, nothing is stored
        self.broadcast(
            &room_id,
            &ServerEvent::MessageRead { msg_id: id.to_string(), reader },
        )
        .await;
    }

    async fn handle_translate(
        &self,
        socket_id: &str,
        msg_id: String,
        text: String,
        source_lang: Option<String>,
        target_lang: Option<String>,
    ) {
        let Some((room_id, user_id)) = self.presence.resolve(socket_id).await else {
            return;
        };
        // client-specified target wins, then the requester's stored language
        let target = match target_lang {
            Some(lang) if !lang.is_empty() => lang,
            _ => self
                .presence
                .lang_of(&room_id, &user_id)
                .await
                .unwrap_or_else(|| "en".to_string()),
        };

        let event = match self.translator.translate(&text, source_lang.as_deref(), &target).await
        {
            Ok(translated) => ServerEvent::TranslatedMessage {
                msg_id,
                translated,
                target_lang: target,
                error: None,
            },
            // chat never blocks on the backend: hand back the original
            Err(_) => ServerEvent::TranslatedMessage {
                msg_id,
                translated: text,
                target_lang: target,
                error: Some(true),
            },
        };
        self.send_to_socket(socket_id, &event).await;
    }

    pub async fn handle_disconnect(&self, socket_id: &str) {
        self.connections.write().await.remove(socket_id);

        let Some((room_id, user_id)) = self.presence.begin_disconnect(socket_id).await else {
            return;
        };

        // leave is announced only after the grace period passes un-rejoined
        let server = self.clone();
        let socket = socket_id.to_string();
        let grace = self.presence.grace_period();
        let timer_user = user_id.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(notice) =
                server.presence.finish_disconnect(&room_id, &timer_user, &socket).await
            else {
                return;
            };
            if notice.room_emptied {
                // last one out; nobody left to tell
                return;
            }
            server.broadcast_user_list(&room_id).await;
            server
                .broadcast(
                    &room_id,
                    &ServerEvent::System {
                        kind: SystemKind::Leave,
                        nickname: Some(notice.nickname),
                        hours: None,
                        content: None,
                        timestamp: now_ms(),
                    },
                )
                .await;
        });
        self.presence.register_pending(&user_id, timer).await;
    }

    async fn broadcast_user_list(&self, room_id: &str) {
        let users = self.presence.list_users(room_id).await;
        self.broadcast(room_id, &ServerEvent::UserList { users }).await;
    }

    async fn broadcast(&self, room_id: &str, event: &ServerEvent) {
        self.broadcast_except(room_id, event, None).await;
    }

    async fn broadcast_except(&self, room_id: &str, event: &ServerEvent, except: Option<&str>) {
        let text = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(e) => {
                error!("failed to serialize event: {e}");
                return;
            }
        };
        let sockets = self.presence.sockets_in(room_id).await;
        let connections = self.connections.read().await;
        for socket_id in sockets {
            if Some(socket_id.as_str()) == except {
                continue;
            }
            if let Some(tx) = connections.get(&socket_id) {
                let _ = tx.send(Message::text(text.clone()));
            }
        }
    }

    async fn send_to_socket(&self, socket_id: &str, event: &ServerEvent) {
        let text = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(e) => {
                error!("failed to serialize event: {e}");
                return;
            }
        };
        let connections = self.connections.read().await;
        if let Some(tx) = connections.get(socket_id) {
            let _ = tx.send(Message::text(text));
        }
    }
}
