//! In-memory platform used by session and tool tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::client::{
    Account, Authenticator, Character, CharacterUpdate, ChatApi, Chat, ClientError, Connection,
    EntityId, HistoryPage, NewCharacter, NewChat, NewScene, NewVoice, ProfileUpdate, Room, Scene,
    Turn, Voice, VoiceUpdate, Vote,
};
use crate::credential::Token;

/// Ordered log of what the platform saw
#[derive(Debug, Default)]
pub struct EventLog(Mutex<Vec<String>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

pub fn turn(chat_id: &str, turn_id: &str, text: &str) -> Turn {
    serde_json::from_value(json!({
        "turn_key": {"chat_id": chat_id, "turn_id": turn_id},
        "author": {"author_id": "bot", "name": "Bot", "is_human": false},
        "candidates": [{"candidate_id": "cand-1", "raw_content": text, "is_final": true}],
        "primary_candidate_id": "cand-1"
    }))
    .unwrap()
}

fn character(id: &str, name: &str) -> Character {
    serde_json::from_value(json!({"external_id": id, "name": name})).unwrap()
}

#[derive(Default)]
pub struct MockAuthenticator {
    pub calls: AtomicUsize,
    pub reject: AtomicBool,
    pub log: Arc<EventLog>,
}

impl MockAuthenticator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authenticator for MockAuthenticator {
    async fn authenticate(&self, token: &Token) -> Result<Box<dyn ChatApi>, ClientError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reject.load(Ordering::SeqCst) {
            return Err(ClientError::Auth("HTTP 401: invalid token".to_string()));
        }
        self.log.push(format!("auth:{}", token.as_str()));

        let account: Account =
            serde_json::from_value(json!({"id": "42", "username": "tester"})).unwrap();
        Ok(Box::new(MockApi {
            account,
            log: Arc::clone(&self.log),
        }))
    }
}

pub struct MockApi {
    account: Account,
    log: Arc<EventLog>,
}

#[async_trait]
impl ChatApi for MockApi {
    fn account(&self) -> &Account {
        &self.account
    }

    async fn recent_chats(&self) -> Result<Vec<Chat>, ClientError> {
        self.log.push("recent_chats");
        Ok(vec![serde_json::from_value(json!({"chat_id": "chat-1", "character_id": "c1"}))?])
    }

    async fn chats(&self, character_id: &str) -> Result<Vec<Chat>, ClientError> {
        self.log.push(format!("chats:{}", character_id));
        Ok(Vec::new())
    }

    async fn history(
        &self,
        chat_id: &str,
        next_token: Option<&str>,
    ) -> Result<HistoryPage, ClientError> {
        self.log.push(format!("history:{}:{}", chat_id, next_token.unwrap_or("-")));
        Ok(HistoryPage {
            turns: vec![turn(chat_id, "t1", "earlier")],
            next_token: Some("page-2".to_string()),
        })
    }

    async fn search_characters(&self, query: &str) -> Result<Vec<Character>, ClientError> {
        self.log.push(format!("search:{}", query));
        if query == "down" {
            return Err(ClientError::Api {
                status: 503,
                body: "maintenance".to_string(),
            });
        }
        Ok(vec![character("c1", query)])
    }

    async fn recommended_characters(&self) -> Result<Vec<Character>, ClientError> {
        Ok(vec![character("c2", "Recommended")])
    }

    async fn my_characters(&self) -> Result<Vec<Character>, ClientError> {
        Ok(Vec::new())
    }

    async fn rooms(&self) -> Result<Vec<Room>, ClientError> {
        Ok(vec![serde_json::from_value(json!({"room_id": "room-1", "title": "Lounge"}))?])
    }

    async fn search_voices(&self, query: &str) -> Result<Vec<Voice>, ClientError> {
        self.log.push(format!("voices:{}", query));
        Ok(Vec::new())
    }

    async fn voice(&self, voice_id: &str) -> Result<Voice, ClientError> {
        Ok(serde_json::from_value(json!({"id": voice_id, "name": "Narrator"}))?)
    }

    async fn create_character(&self, new: &NewCharacter) -> Result<Character, ClientError> {
        self.log.push(format!("create_character:{}", new.name));
        Ok(character("new-id", &new.name))
    }

    async fn update_character(&self, update: &CharacterUpdate) -> Result<Character, ClientError> {
        self.log.push(format!("update_character:{}", update.character_id));
        Ok(character(&update.character_id, update.name.as_deref().unwrap_or("Same")))
    }

    async fn vote_character(&self, character_id: &str, vote: Vote) -> Result<(), ClientError> {
        self.log.push(format!("vote:{}:{:?}", character_id, vote));
        Ok(())
    }

    async fn create_scene(&self, scene: &NewScene) -> Result<Scene, ClientError> {
        self.log.push(format!("create_scene:{}:{}", scene.character_id, scene.name));
        Ok(serde_json::from_value(json!({"scene_id": "scene-1", "name": scene.name}))?)
    }

    async fn create_voice(&self, voice: &NewVoice) -> Result<Voice, ClientError> {
        self.log.push(format!("create_voice:{}", voice.name));
        Ok(serde_json::from_value(json!({"id": "voice-new", "name": voice.name}))?)
    }

    async fn update_voice(&self, update: &VoiceUpdate) -> Result<Voice, ClientError> {
        self.log.push(format!("update_voice:{}", update.voice_id));
        let name = update.name.as_deref().unwrap_or("Narrator");
        Ok(serde_json::from_value(json!({"id": update.voice_id, "name": name}))?)
    }

    async fn set_character_voice(
        &self,
        character_id: &str,
        voice_id: Option<&str>,
    ) -> Result<(), ClientError> {
        self.log.push(format!(
            "character_voice:{}:{}",
            character_id,
            voice_id.unwrap_or("default")
        ));
        Ok(())
    }

    async fn update_profile(&self, profile: &ProfileUpdate) -> Result<Account, ClientError> {
        self.log.push("update_profile");
        let username = profile.username.as_deref().unwrap_or(&self.account.username);
        Ok(serde_json::from_value(json!({"id": self.account.id, "username": username}))?)
    }

    async fn connect(&self, entity: &EntityId) -> Result<Box<dyn Connection>, ClientError> {
        if entity.id() == "unreachable" {
            return Err(ClientError::WebSocket("connection refused".to_string()));
        }
        self.log.push(format!("connect:{}", entity));
        Ok(Box::new(MockConnection {
            entity: entity.clone(),
            log: Arc::clone(&self.log),
        }))
    }
}

/// Text `fail` makes an operation fail, `slow` makes it take a while;
/// entity id `sticky` refuses to close.
pub struct MockConnection {
    entity: EntityId,
    log: Arc<EventLog>,
}

impl MockConnection {
    async fn act(&self, what: &str, text: &str) -> Result<(), ClientError> {
        if text == "slow" {
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
        self.log.push(format!("{}:{}:{}", what, self.entity, text));
        if text == "fail" {
            return Err(ClientError::Upstream("blocked".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn entity(&self) -> &EntityId {
        &self.entity
    }

    async fn character_info(&mut self) -> Result<Character, ClientError> {
        let id = self.entity.character()?.to_string();
        self.act("info", "").await?;
        Ok(character(&id, "Ada"))
    }

    async fn create_chat(&mut self, with_greeting: bool) -> Result<NewChat, ClientError> {
        let id = self.entity.character()?.to_string();
        self.act("create_chat", "").await?;
        let chat: Chat = serde_json::from_value(json!({"chat_id": "chat-new", "character_id": id}))?;
        Ok(NewChat {
            chat,
            greeting: with_greeting.then(|| turn("chat-new", "g1", "Hello!")),
        })
    }

    async fn send_message(&mut self, chat_id: &str, text: &str) -> Result<Turn, ClientError> {
        self.entity.character()?;
        self.act("send", text).await?;
        Ok(turn(chat_id, "t2", &format!("reply to {}", text)))
    }

    async fn regenerate(&mut self, chat_id: &str, turn_id: &str) -> Result<Turn, ClientError> {
        self.act("regenerate", turn_id).await?;
        Ok(turn(chat_id, turn_id, "another take"))
    }

    async fn edit_message(
        &mut self,
        chat_id: &str,
        turn_id: &str,
        _candidate_id: &str,
        text: &str,
    ) -> Result<Turn, ClientError> {
        self.act("edit", text).await?;
        Ok(turn(chat_id, turn_id, text))
    }

    async fn pin_message(
        &mut self,
        chat_id: &str,
        turn_id: &str,
        pinned: bool,
    ) -> Result<Turn, ClientError> {
        self.act("pin", &pinned.to_string()).await?;
        let mut t = turn(chat_id, turn_id, "pinned");
        t.is_pinned = pinned;
        Ok(t)
    }

    async fn delete_messages(
        &mut self,
        _chat_id: &str,
        turn_ids: &[String],
    ) -> Result<(), ClientError> {
        self.act("delete", &turn_ids.join(",")).await
    }

    async fn send_group_message(&mut self, text: &str) -> Result<Vec<Turn>, ClientError> {
        let room = self.entity.room()?.to_string();
        self.act("group", text).await?;
        Ok(vec![turn(&room, "r1", "one"), turn(&room, "r2", "two")])
    }

    async fn close(&mut self) -> Result<(), ClientError> {
        self.log.push(format!("close:{}", self.entity));
        if self.entity.id() == "sticky" {
            return Err(ClientError::WebSocket("close handshake failed".to_string()));
        }
        Ok(())
    }
}
