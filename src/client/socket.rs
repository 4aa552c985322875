//! Chat socket: one binding to a character or room
//!
//! Commands go out as `{command, request_id, payload, origin_id}` frames and
//! the server answers with turn frames (`add_turn`, `update_turn`) or a
//! `neo_error`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::COOKIE, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};
use uuid::Uuid;

use super::http::Rest;
use super::models::{Account, Character, Chat, NewChat, Turn};
use super::{ClientError, Connection, EntityId};
use crate::credential::Token;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Incoming frame; only the parts we route on
#[derive(Debug, Default, Deserialize)]
struct Frame {
    #[serde(default)]
    command: String,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    turn: Option<Turn>,
    #[serde(default)]
    chat: Option<Chat>,
    #[serde(default)]
    comment: Option<String>,
}

impl Frame {
    /// Frames without a request id are broadcast and match every request
    fn answers(&self, request_id: &str) -> bool {
        self.request_id
            .as_deref()
            .map_or(true, |id| id.starts_with(request_id))
    }

    fn error_for(&self, request_id: &str) -> Option<ClientError> {
        if self.command == "neo_error" && self.answers(request_id) {
            let comment = self.comment.clone().unwrap_or_else(|| "unknown error".to_string());
            Some(ClientError::Upstream(comment))
        } else {
            None
        }
    }
}

pub(crate) struct CaiConnection {
    entity: EntityId,
    socket: Option<WsStream>,
    rest: Arc<Rest>,
    account: Account,
    group_idle: Duration,
}

impl CaiConnection {
    pub(crate) async fn open(
        ws_url: &str,
        token: &Token,
        entity: EntityId,
        rest: Arc<Rest>,
        account: Account,
        group_idle: Duration,
    ) -> Result<Self, ClientError> {
        let mut request = ws_url.into_client_request()?;
        let cookie = HeaderValue::from_str(&format!("HTTP_AUTHORIZATION=\"Token {}\"", token.as_str()))
            .map_err(|e| ClientError::WebSocket(e.to_string()))?;
        request.headers_mut().insert(COOKIE, cookie);

        let (socket, _) = tokio_tungstenite::connect_async(request).await?;
        debug!("Chat socket open for {}", entity);

        Ok(Self {
            entity,
            socket: Some(socket),
            rest,
            account,
            group_idle,
        })
    }

    fn socket(&mut self) -> Result<&mut WsStream, ClientError> {
        self.socket
            .as_mut()
            .ok_or_else(|| ClientError::WebSocket("chat socket already closed".to_string()))
    }

    async fn send_command(&mut self, command: &str, payload: Value) -> Result<String, ClientError> {
        let request_id = Uuid::new_v4().to_string();
        let frame = json!({
            "command": command,
            "request_id": request_id,
            "payload": payload,
            "origin_id": "web-next",
        });

        debug!("-> {} ({})", command, request_id);
        self.socket()?.send(Message::Text(frame.to_string())).await?;
        Ok(request_id)
    }

    async fn next_frame(&mut self) -> Result<Frame, ClientError> {
        loop {
            let socket = self.socket()?;
            match socket.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Frame>(&text) {
                    Ok(frame) => {
                        debug!("<- {}", frame.command);
                        return Ok(frame);
                    }
                    Err(e) => debug!("Skipping unparsable frame: {}", e),
                },
                Some(Ok(Message::Ping(data))) => socket.send(Message::Pong(data)).await?,
                Some(Ok(Message::Close(_))) | None => {
                    self.socket = None;
                    return Err(ClientError::WebSocket("chat socket closed by server".to_string()));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Wait for the first turn accepted by `wanted`
    async fn await_turn<F>(&mut self, request_id: &str, wanted: F) -> Result<Turn, ClientError>
    where
        F: Fn(&Turn) -> bool,
    {
        loop {
            let frame = self.next_frame().await?;
            if let Some(err) = frame.error_for(request_id) {
                return Err(err);
            }
            if let Some(turn) = frame.turn {
                if wanted(&turn) {
                    return Ok(turn);
                }
            }
        }
    }

    async fn await_command(&mut self, request_id: &str, command: &str) -> Result<Frame, ClientError> {
        loop {
            let frame = self.next_frame().await?;
            if let Some(err) = frame.error_for(request_id) {
                return Err(err);
            }
            if frame.command == command {
                return Ok(frame);
            }
        }
    }

    fn human_turn(&self, chat_id: &str, text: &str) -> Value {
        let candidate_id = Uuid::new_v4().to_string();
        json!({
            "turn_key": { "turn_id": Uuid::new_v4().to_string(), "chat_id": chat_id },
            "author": {
                "author_id": self.account.id,
                "is_human": true,
                "name": self.account.username,
            },
            "candidates": [{ "candidate_id": candidate_id, "raw_content": text }],
            "primary_candidate_id": candidate_id,
        })
    }
}

/// A finished reply from a character in `chat_id`
fn is_final_reply(turn: &Turn, chat_id: &str) -> bool {
    turn.turn_key.chat_id == chat_id && !turn.author.is_human && turn.is_final()
}

#[async_trait]
impl Connection for CaiConnection {
    fn entity(&self) -> &EntityId {
        &self.entity
    }

    async fn character_info(&mut self) -> Result<Character, ClientError> {
        let character_id = self.entity.character()?.to_string();
        self.rest.character_info(&character_id).await
    }

    async fn create_chat(&mut self, with_greeting: bool) -> Result<NewChat, ClientError> {
        let character_id = self.entity.character()?.to_string();
        let payload = json!({
            "chat": {
                "chat_id": Uuid::new_v4().to_string(),
                "creator_id": self.account.id,
                "visibility": "VISIBILITY_PRIVATE",
                "character_id": character_id,
                "type": "TYPE_ONE_ON_ONE",
            },
            "with_greeting": with_greeting,
        });

        let request_id = self.send_command("create_chat", payload).await?;
        let frame = self.await_command(&request_id, "create_chat_response").await?;
        let chat = frame
            .chat
            .ok_or_else(|| ClientError::Protocol("create_chat_response without chat".to_string()))?;

        let greeting = if with_greeting {
            let chat_id = chat.chat_id.clone();
            Some(self.await_turn(&request_id, |t| is_final_reply(t, &chat_id)).await?)
        } else {
            None
        };

        info!("Created chat {} with {}", chat.chat_id, character_id);
        Ok(NewChat { chat, greeting })
    }

    async fn send_message(&mut self, chat_id: &str, text: &str) -> Result<Turn, ClientError> {
        let character_id = self.entity.character()?.to_string();
        let payload = json!({
            "num_candidates": 1,
            "tts_enabled": false,
            "selected_language": "",
            "character_id": character_id,
            "user_name": self.account.username,
            "turn": self.human_turn(chat_id, text),
        });

        let request_id = self.send_command("create_and_generate_turn", payload).await?;
        self.await_turn(&request_id, |t| is_final_reply(t, chat_id)).await
    }

    async fn regenerate(&mut self, chat_id: &str, turn_id: &str) -> Result<Turn, ClientError> {
        let character_id = self.entity.character()?.to_string();
        let payload = json!({
            "tts_enabled": false,
            "selected_language": "",
            "character_id": character_id,
            "user_name": self.account.username,
            "turn_key": { "turn_id": turn_id, "chat_id": chat_id },
        });

        let request_id = self.send_command("generate_turn_candidate", payload).await?;
        self.await_turn(&request_id, |t| {
            is_final_reply(t, chat_id) && t.turn_key.turn_id == turn_id
        })
        .await
    }

    async fn edit_message(
        &mut self,
        chat_id: &str,
        turn_id: &str,
        candidate_id: &str,
        text: &str,
    ) -> Result<Turn, ClientError> {
        self.entity.character()?;
        let payload = json!({
            "turn_key": { "turn_id": turn_id, "chat_id": chat_id },
            "current_candidate_id": candidate_id,
            "new_candidate_raw_content": text,
        });

        let request_id = self.send_command("edit_turn_candidate", payload).await?;
        self.await_turn(&request_id, |t| t.turn_key.turn_id == turn_id).await
    }

    async fn pin_message(
        &mut self,
        chat_id: &str,
        turn_id: &str,
        pinned: bool,
    ) -> Result<Turn, ClientError> {
        self.entity.character()?;
        let payload = json!({
            "turn_key": { "turn_id": turn_id, "chat_id": chat_id },
            "is_pinned": pinned,
        });

        let request_id = self.send_command("set_turn_pin", payload).await?;
        self.await_turn(&request_id, |t| t.turn_key.turn_id == turn_id).await
    }

    async fn delete_messages(
        &mut self,
        chat_id: &str,
        turn_ids: &[String],
    ) -> Result<(), ClientError> {
        self.entity.character()?;
        let payload = json!({ "chat_id": chat_id, "turn_ids": turn_ids });

        let request_id = self.send_command("remove_turns", payload).await?;
        self.await_command(&request_id, "remove_turns_response").await?;
        Ok(())
    }

    async fn send_group_message(&mut self, text: &str) -> Result<Vec<Turn>, ClientError> {
        let room_id = self.entity.room()?.to_string();
        let payload = json!({
            "num_candidates": 1,
            "tts_enabled": false,
            "selected_language": "",
            "user_name": self.account.username,
            "chat_type": "TYPE_MU_ROOM",
            "turn": self.human_turn(&room_id, text),
        });

        let request_id = self.send_command("create_and_generate_turn", payload).await?;

        // Every character in the room may answer; stop once the room goes quiet
        let first = self.await_turn(&request_id, |t| is_final_reply(t, &room_id)).await?;
        let mut replies = vec![first];
        loop {
            let next = tokio::time::timeout(
                self.group_idle,
                self.await_turn(&request_id, |t| is_final_reply(t, &room_id)),
            )
            .await;
            match next {
                Ok(Ok(turn)) => {
                    replies.retain(|t| t.turn_key != turn.turn_key);
                    replies.push(turn);
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => break,
            }
        }

        info!("Room {} answered with {} turns", room_id, replies.len());
        Ok(replies)
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        if let Some(mut socket) = self.socket.take() {
            socket.close(None).await?;
            debug!("Chat socket closed for {}", self.entity);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{stub, Authenticator, CaiAuthenticator};
    use crate::config::ApiConfig;
    use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
    use axum::response::Response;
    use axum::routing::get;
    use axum::{Json, Router};

    fn reply(chat_id: &str, turn_id: &str, text: &str, is_final: bool) -> String {
        json!({
            "command": if is_final { "update_turn" } else { "add_turn" },
            "turn": {
                "turn_key": {"chat_id": chat_id, "turn_id": turn_id},
                "author": {"author_id": "c1", "name": "Bot", "is_human": false},
                "candidates": [{"candidate_id": "x", "raw_content": text, "is_final": is_final}],
                "primary_candidate_id": "x"
            }
        })
        .to_string()
    }

    /// Answers each command the way the chat socket does
    async fn serve_socket(mut socket: WebSocket) {
        while let Some(Ok(AxumMessage::Text(text))) = socket.recv().await {
            let frame: Value = serde_json::from_str(&text).unwrap();
            let request_id = frame["request_id"].as_str().unwrap_or_default().to_string();
            let payload = &frame["payload"];

            let out: Vec<String> = match frame["command"].as_str().unwrap_or_default() {
                "create_and_generate_turn" => {
                    let raw = payload["turn"]["candidates"][0]["raw_content"].as_str().unwrap_or("");
                    let chat_id = payload["turn"]["turn_key"]["chat_id"].as_str().unwrap_or("");
                    if raw == "fail" {
                        vec![json!({"command": "neo_error", "request_id": request_id, "comment": "blocked"}).to_string()]
                    } else if chat_id == "room-1" {
                        vec![
                            reply(chat_id, "r1", "hi from one", true),
                            reply(chat_id, "r2", "hi from two", true),
                        ]
                    } else {
                        vec![
                            reply(chat_id, "t9", "Ech", false),
                            reply(chat_id, "t9", &format!("Echo: {}", raw), true),
                        ]
                    }
                }
                "remove_turns" => vec![json!({
                    "command": "remove_turns_response",
                    "request_id": request_id
                })
                .to_string()],
                _ => Vec::new(),
            };

            for msg in out {
                if socket.send(AxumMessage::Text(msg)).await.is_err() {
                    return;
                }
            }
        }
    }

    async fn ws_handler(ws: WebSocketUpgrade) -> Response {
        ws.on_upgrade(serve_socket)
    }

    async fn connect(entity: EntityId) -> Box<dyn Connection> {
        let router = Router::new()
            .route(
                "/plus/chat/user/",
                get(|| async { Json(json!({"user": {"user": {"id": 1, "username": "me"}}})) }),
            )
            .route("/ws/", get(ws_handler));
        let addr = stub::spawn(router).await;
        let config = ApiConfig {
            neo_url: format!("http://{}", addr),
            plus_url: format!("http://{}/plus", addr),
            ws_url: format!("ws://{}/ws/", addr),
            request_timeout_secs: Some(5),
            group_idle_ms: 200,
        };

        let api = CaiAuthenticator::new(config)
            .authenticate(&Token::parse("good").unwrap())
            .await
            .unwrap();
        api.connect(&entity).await.unwrap()
    }

    #[tokio::test]
    async fn test_send_message_waits_for_final_turn() {
        let mut conn = connect(EntityId::Character("c1".to_string())).await;

        let turn = conn.send_message("chat-1", "hello").await.unwrap();
        assert_eq!(turn.text(), "Echo: hello");
        assert!(turn.is_final());

        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_neo_error_is_upstream_error() {
        let mut conn = connect(EntityId::Character("c1".to_string())).await;

        let err = conn.send_message("chat-1", "fail").await.unwrap_err();
        assert!(matches!(err, ClientError::Upstream(ref c) if c == "blocked"));
    }

    #[tokio::test]
    async fn test_delete_waits_for_ack() {
        let mut conn = connect(EntityId::Character("c1".to_string())).await;
        conn.delete_messages("chat-1", &["t1".to_string()]).await.unwrap();
    }

    #[tokio::test]
    async fn test_group_message_collects_all_replies() {
        let mut conn = connect(EntityId::Room("room-1".to_string())).await;

        let turns = conn.send_group_message("hello all").await.unwrap();
        let texts: Vec<&str> = turns.iter().map(|t| t.text()).collect();
        assert_eq!(texts, vec!["hi from one", "hi from two"]);
    }

    #[tokio::test]
    async fn test_room_binding_rejects_character_ops() {
        let mut conn = connect(EntityId::Room("room-1".to_string())).await;
        let err = conn.send_message("chat-1", "hello").await.unwrap_err();
        assert!(matches!(err, ClientError::Binding(_)));
    }

    #[test]
    fn test_frame_without_request_id_matches() {
        let frame: Frame = serde_json::from_str(r#"{"command": "neo_error", "comment": "nope"}"#).unwrap();
        assert!(matches!(frame.error_for("abc"), Some(ClientError::Upstream(_))));
    }

    #[test]
    fn test_frame_for_other_request_ignored() {
        let frame: Frame = serde_json::from_str(
            r#"{"command": "neo_error", "request_id": "other", "comment": "nope"}"#,
        )
        .unwrap();
        assert!(frame.error_for("abc").is_none());
    }
}
