//! Character.AI client
//!
//! Three seams:
//! - [`Authenticator`] turns a token into an authenticated [`ChatApi`]
//! - [`ChatApi`] covers everything that needs no binding
//! - [`Connection`] is one binding: a chat socket opened for one character or room

mod http;
mod models;
mod socket;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::credential::Token;

pub use http::CaiAuthenticator;
pub use models::{
    Account, Character, CharacterUpdate, Chat, HistoryPage, NewCharacter, NewChat, NewScene,
    NewVoice, ProfileUpdate, Room, Scene, Turn, Voice, VoiceUpdate, Vote,
};

/// Upstream response bodies are cut to this many characters in errors
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("authentication rejected by Character.AI: {0}")]
    Auth(String),

    #[error("Character.AI returned HTTP {status}: {body}")]
    Api { status: u16, body: String },

    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("chat socket error: {0}")]
    WebSocket(String),

    #[error("Character.AI error: {0}")]
    Upstream(String),

    #[error("unexpected response: {0}")]
    Protocol(String),

    #[error("binding mismatch: {0}")]
    Binding(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("cannot read {path}: {source}")]
    File {
        path: String,
        source: std::io::Error,
    },
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ClientError::WebSocket(e.to_string())
    }
}

pub(crate) fn truncate_body(body: &str) -> String {
    body.chars().take(MAX_ERROR_BODY).collect()
}

/// What a binding attaches the session to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityId {
    Character(String),
    Room(String),
}

impl EntityId {
    fn kind(&self) -> &'static str {
        match self {
            EntityId::Character(_) => "character",
            EntityId::Room(_) => "room",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            EntityId::Character(id) | EntityId::Room(id) => id,
        }
    }

    pub fn character(&self) -> Result<&str, ClientError> {
        match self {
            EntityId::Character(id) => Ok(id),
            EntityId::Room(id) => Err(ClientError::Binding(format!(
                "room {} is bound, a character is required",
                id
            ))),
        }
    }

    pub fn room(&self) -> Result<&str, ClientError> {
        match self {
            EntityId::Room(id) => Ok(id),
            EntityId::Character(id) => Err(ClientError::Binding(format!(
                "character {} is bound, a room is required",
                id
            ))),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// Creates authenticated sessions
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &Token) -> Result<Box<dyn ChatApi>, ClientError>;
}

/// Operations on an authenticated session that need no binding
#[async_trait]
pub trait ChatApi: Send + Sync {
    fn account(&self) -> &Account;

    async fn recent_chats(&self) -> Result<Vec<Chat>, ClientError>;

    async fn chats(&self, character_id: &str) -> Result<Vec<Chat>, ClientError>;

    async fn history(&self, chat_id: &str, next_token: Option<&str>)
        -> Result<HistoryPage, ClientError>;

    async fn search_characters(&self, query: &str) -> Result<Vec<Character>, ClientError>;

    async fn recommended_characters(&self) -> Result<Vec<Character>, ClientError>;

    async fn my_characters(&self) -> Result<Vec<Character>, ClientError>;

    async fn rooms(&self) -> Result<Vec<Room>, ClientError>;

    async fn search_voices(&self, query: &str) -> Result<Vec<Voice>, ClientError>;

    async fn voice(&self, voice_id: &str) -> Result<Voice, ClientError>;

    async fn create_character(&self, character: &NewCharacter) -> Result<Character, ClientError>;

    async fn update_character(&self, update: &CharacterUpdate) -> Result<Character, ClientError>;

    async fn vote_character(&self, character_id: &str, vote: Vote) -> Result<(), ClientError>;

    async fn create_scene(&self, scene: &NewScene) -> Result<Scene, ClientError>;

    /// Upload an audio sample and clone a voice from it
    async fn create_voice(&self, voice: &NewVoice) -> Result<Voice, ClientError>;

    async fn update_voice(&self, update: &VoiceUpdate) -> Result<Voice, ClientError>;

    /// Override the voice a character speaks with; `None` restores its default
    async fn set_character_voice(
        &self,
        character_id: &str,
        voice_id: Option<&str>,
    ) -> Result<(), ClientError>;

    async fn update_profile(&self, profile: &ProfileUpdate) -> Result<Account, ClientError>;

    /// Open a binding to one entity
    async fn connect(&self, entity: &EntityId) -> Result<Box<dyn Connection>, ClientError>;
}

/// One open binding
#[async_trait]
pub trait Connection: Send {
    fn entity(&self) -> &EntityId;

    async fn character_info(&mut self) -> Result<Character, ClientError>;

    async fn create_chat(&mut self, with_greeting: bool) -> Result<NewChat, ClientError>;

    async fn send_message(&mut self, chat_id: &str, text: &str) -> Result<Turn, ClientError>;

    /// Ask for another candidate of an existing character turn
    async fn regenerate(&mut self, chat_id: &str, turn_id: &str) -> Result<Turn, ClientError>;

    async fn edit_message(
        &mut self,
        chat_id: &str,
        turn_id: &str,
        candidate_id: &str,
        text: &str,
    ) -> Result<Turn, ClientError>;

    async fn pin_message(
        &mut self,
        chat_id: &str,
        turn_id: &str,
        pinned: bool,
    ) -> Result<Turn, ClientError>;

    async fn delete_messages(&mut self, chat_id: &str, turn_ids: &[String])
        -> Result<(), ClientError>;

    /// Post to the bound room and collect every character reply
    async fn send_group_message(&mut self, text: &str) -> Result<Vec<Turn>, ClientError>;

    async fn close(&mut self) -> Result<(), ClientError>;
}

#[cfg(test)]
pub(crate) mod stub {
    //! Local axum server standing in for Character.AI

    use axum::Router;

    pub async fn spawn(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("127.0.0.1:{}", addr.port())
    }
}
