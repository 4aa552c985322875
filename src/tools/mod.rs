//! Tool dispatch
//!
//! Every tool is one [`ToolRequest`] variant with its own parameter struct.
//! [`Dispatcher::call`] parses, runs and renders a call, and always answers
//! with a [`ToolOutcome`]; nothing propagates past it.

mod catalog;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::client::{
    CharacterUpdate, ClientError, EntityId, NewCharacter, NewScene, NewVoice, ProfileUpdate,
    VoiceUpdate, Vote,
};
use crate::metrics::ToolCallTimer;
use crate::protocol::{CallToolResult, ToolContent, ToolDefinition};
use crate::session::{SessionError, SessionManager};

pub use catalog::definitions;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error("failed to render result: {0}")]
    Render(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryParams {
    pub query: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CharacterParams {
    pub character_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatHistoryParams {
    pub chat_id: String,
    #[serde(default)]
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoiceParams {
    pub voice_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoteParams {
    pub character_id: String,
    pub vote: Vote,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CharacterVoiceParams {
    pub character_id: String,
    #[serde(default)]
    pub voice_id: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateChatParams {
    pub character_id: String,
    #[serde(default = "default_true")]
    pub greeting: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageParams {
    pub character_id: String,
    pub chat_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TurnParams {
    pub character_id: String,
    pub chat_id: String,
    pub turn_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EditMessageParams {
    pub character_id: String,
    pub chat_id: String,
    pub turn_id: String,
    pub candidate_id: String,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PinMessageParams {
    pub character_id: String,
    pub chat_id: String,
    pub turn_id: String,
    #[serde(default = "default_true")]
    pub pinned: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeleteMessagesParams {
    pub character_id: String,
    pub chat_id: String,
    pub turn_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroupMessageParams {
    pub room_id: String,
    pub text: String,
}

/// A parsed, validated tool call
#[derive(Debug, Clone)]
pub enum ToolRequest {
    GetAccount,
    SearchCharacters(QueryParams),
    GetRecommendedCharacters,
    GetMyCharacters,
    GetRecentChats,
    ListChats(CharacterParams),
    GetChatHistory(ChatHistoryParams),
    ListRooms,
    SearchVoices(QueryParams),
    GetVoice(VoiceParams),
    CreateCharacter(NewCharacter),
    UpdateCharacter(CharacterUpdate),
    VoteCharacter(VoteParams),
    CreateScene(NewScene),
    CreateVoice(NewVoice),
    UpdateVoice(VoiceUpdate),
    SetCharacterVoice(CharacterVoiceParams),
    UpdateProfile(ProfileUpdate),
    // Bound to a character or room
    GetCharacterInfo(CharacterParams),
    CreateChat(CreateChatParams),
    SendMessage(SendMessageParams),
    RegenerateMessage(TurnParams),
    EditMessage(EditMessageParams),
    PinMessage(PinMessageParams),
    DeleteMessages(DeleteMessagesParams),
    SendGroupMessage(GroupMessageParams),
}

fn args_of<T: for<'de> Deserialize<'de>>(tool: &str, args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}

impl ToolRequest {
    /// Parse a `tools/call` by name; missing or null arguments mean `{}`
    pub fn parse(name: &str, arguments: Option<Value>) -> Result<Self, ToolError> {
        let args = match arguments {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(args) => args,
        };

        let request = match name {
            "get_account" => ToolRequest::GetAccount,
            "search_characters" => ToolRequest::SearchCharacters(args_of(name, args)?),
            "get_recommended_characters" => ToolRequest::GetRecommendedCharacters,
            "get_my_characters" => ToolRequest::GetMyCharacters,
            "get_recent_chats" => ToolRequest::GetRecentChats,
            "list_chats" => ToolRequest::ListChats(args_of(name, args)?),
            "get_chat_history" => ToolRequest::GetChatHistory(args_of(name, args)?),
            "list_rooms" => ToolRequest::ListRooms,
            "search_voices" => ToolRequest::SearchVoices(args_of(name, args)?),
            "get_voice" => ToolRequest::GetVoice(args_of(name, args)?),
            "create_character" => ToolRequest::CreateCharacter(args_of(name, args)?),
            "update_character" => ToolRequest::UpdateCharacter(args_of(name, args)?),
            "vote_character" => ToolRequest::VoteCharacter(args_of(name, args)?),
            "create_scene" => ToolRequest::CreateScene(args_of(name, args)?),
            "create_voice" => ToolRequest::CreateVoice(args_of(name, args)?),
            "update_voice" => ToolRequest::UpdateVoice(args_of(name, args)?),
            "set_character_voice" => ToolRequest::SetCharacterVoice(args_of(name, args)?),
            "update_profile" => ToolRequest::UpdateProfile(args_of(name, args)?),
            "get_character_info" => ToolRequest::GetCharacterInfo(args_of(name, args)?),
            "create_chat" => ToolRequest::CreateChat(args_of(name, args)?),
            "send_message" => ToolRequest::SendMessage(args_of(name, args)?),
            "regenerate_message" => ToolRequest::RegenerateMessage(args_of(name, args)?),
            "edit_message" => ToolRequest::EditMessage(args_of(name, args)?),
            "pin_message" => ToolRequest::PinMessage(args_of(name, args)?),
            "delete_messages" => ToolRequest::DeleteMessages(args_of(name, args)?),
            "send_group_message" => ToolRequest::SendGroupMessage(args_of(name, args)?),
            other => return Err(ToolError::UnknownTool(other.to_string())),
        };

        request.validate()?;
        Ok(request)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolRequest::GetAccount => "get_account",
            ToolRequest::SearchCharacters(_) => "search_characters",
            ToolRequest::GetRecommendedCharacters => "get_recommended_characters",
            ToolRequest::GetMyCharacters => "get_my_characters",
            ToolRequest::GetRecentChats => "get_recent_chats",
            ToolRequest::ListChats(_) => "list_chats",
            ToolRequest::GetChatHistory(_) => "get_chat_history",
            ToolRequest::ListRooms => "list_rooms",
            ToolRequest::SearchVoices(_) => "search_voices",
            ToolRequest::GetVoice(_) => "get_voice",
            ToolRequest::CreateCharacter(_) => "create_character",
            ToolRequest::UpdateCharacter(_) => "update_character",
            ToolRequest::VoteCharacter(_) => "vote_character",
            ToolRequest::CreateScene(_) => "create_scene",
            ToolRequest::CreateVoice(_) => "create_voice",
            ToolRequest::UpdateVoice(_) => "update_voice",
            ToolRequest::SetCharacterVoice(_) => "set_character_voice",
            ToolRequest::UpdateProfile(_) => "update_profile",
            ToolRequest::GetCharacterInfo(_) => "get_character_info",
            ToolRequest::CreateChat(_) => "create_chat",
            ToolRequest::SendMessage(_) => "send_message",
            ToolRequest::RegenerateMessage(_) => "regenerate_message",
            ToolRequest::EditMessage(_) => "edit_message",
            ToolRequest::PinMessage(_) => "pin_message",
            ToolRequest::DeleteMessages(_) => "delete_messages",
            ToolRequest::SendGroupMessage(_) => "send_group_message",
        }
    }

    /// Ids and texts must be non-blank
    fn validate(&self) -> Result<(), ToolError> {
        let tool = self.name();
        let require = |field: &str, value: &str| {
            if value.trim().is_empty() {
                Err(ToolError::InvalidArguments {
                    tool: tool.to_string(),
                    message: format!("`{}` must not be empty", field),
                })
            } else {
                Ok(())
            }
        };

        match self {
            ToolRequest::GetAccount
            | ToolRequest::GetRecommendedCharacters
            | ToolRequest::GetMyCharacters
            | ToolRequest::GetRecentChats
            | ToolRequest::ListRooms => Ok(()),
            ToolRequest::SearchCharacters(p) | ToolRequest::SearchVoices(p) => {
                require("query", &p.query)
            }
            ToolRequest::ListChats(p) | ToolRequest::GetCharacterInfo(p) => {
                require("character_id", &p.character_id)
            }
            ToolRequest::GetChatHistory(p) => require("chat_id", &p.chat_id),
            ToolRequest::GetVoice(p) => require("voice_id", &p.voice_id),
            ToolRequest::CreateCharacter(p) => {
                require("name", &p.name)?;
                require("greeting", &p.greeting)
            }
            ToolRequest::UpdateCharacter(p) => {
                require("character_id", &p.character_id)?;
                if let Some(name) = &p.name {
                    require("name", name)?;
                }
                Ok(())
            }
            ToolRequest::VoteCharacter(p) => require("character_id", &p.character_id),
            ToolRequest::CreateScene(p) => {
                require("character_id", &p.character_id)?;
                require("name", &p.name)
            }
            ToolRequest::CreateVoice(p) => {
                require("name", &p.name)?;
                require("audio_path", &p.audio_path.to_string_lossy())
            }
            ToolRequest::UpdateVoice(p) => {
                require("voice_id", &p.voice_id)?;
                if let Some(name) = &p.name {
                    require("name", name)?;
                }
                Ok(())
            }
            ToolRequest::SetCharacterVoice(p) => {
                require("character_id", &p.character_id)?;
                if let Some(voice_id) = &p.voice_id {
                    require("voice_id", voice_id)?;
                }
                Ok(())
            }
            ToolRequest::UpdateProfile(p) => {
                if p.name.is_none() && p.username.is_none() && p.bio.is_none() {
                    return Err(ToolError::InvalidArguments {
                        tool: tool.to_string(),
                        message: "nothing to update".to_string(),
                    });
                }
                if let Some(username) = &p.username {
                    require("username", username)?;
                }
                Ok(())
            }
            ToolRequest::CreateChat(p) => require("character_id", &p.character_id),
            ToolRequest::SendMessage(p) => {
                require("character_id", &p.character_id)?;
                require("chat_id", &p.chat_id)?;
                require("text", &p.text)
            }
            ToolRequest::RegenerateMessage(p) => {
                require("character_id", &p.character_id)?;
                require("chat_id", &p.chat_id)?;
                require("turn_id", &p.turn_id)
            }
            ToolRequest::EditMessage(p) => {
                require("character_id", &p.character_id)?;
                require("chat_id", &p.chat_id)?;
                require("turn_id", &p.turn_id)?;
                require("candidate_id", &p.candidate_id)?;
                require("text", &p.text)
            }
            ToolRequest::PinMessage(p) => {
                require("character_id", &p.character_id)?;
                require("chat_id", &p.chat_id)?;
                require("turn_id", &p.turn_id)
            }
            ToolRequest::DeleteMessages(p) => {
                require("character_id", &p.character_id)?;
                require("chat_id", &p.chat_id)?;
                if p.turn_ids.is_empty() {
                    return Err(ToolError::InvalidArguments {
                        tool: tool.to_string(),
                        message: "`turn_ids` must list at least one turn".to_string(),
                    });
                }
                p.turn_ids.iter().try_for_each(|id| require("turn_ids", id))
            }
            ToolRequest::SendGroupMessage(p) => {
                require("room_id", &p.room_id)?;
                require("text", &p.text)
            }
        }
    }
}

/// The envelope every tool call ends in
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub text: String,
}

impl ToolOutcome {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            success: true,
            text: text.into(),
        }
    }

    pub fn failure(text: impl Into<String>) -> Self {
        Self {
            success: false,
            text: text.into(),
        }
    }
}

impl From<ToolOutcome> for CallToolResult {
    fn from(outcome: ToolOutcome) -> Self {
        CallToolResult {
            content: vec![ToolContent::Text { text: outcome.text }],
            is_error: !outcome.success,
        }
    }
}

/// One-line summary followed by the full payload as pretty JSON
fn render<T: Serialize + ?Sized>(summary: &str, value: &T) -> Result<String, ToolError> {
    Ok(format!("{}\n\n{}", summary, serde_json::to_string_pretty(value)?))
}

/// Runs tool calls against the shared session
pub struct Dispatcher {
    sessions: Arc<SessionManager>,
}

impl Dispatcher {
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        definitions()
    }

    /// Whether the platform session has been created yet
    pub async fn session_live(&self) -> bool {
        self.sessions.is_live().await
    }

    /// Run one tool call; failures come back as an error envelope
    pub async fn call(&self, name: &str, arguments: Option<Value>) -> ToolOutcome {
        let parsed = ToolRequest::parse(name, arguments);
        let timer = ToolCallTimer::new(parsed.as_ref().map(|r| r.name()).unwrap_or("unknown"));

        let result = match parsed {
            Ok(request) => self.execute(request).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(text) => {
                debug!("Tool {} succeeded", name);
                timer.observe_duration("success");
                ToolOutcome::success(text)
            }
            Err(e) => {
                warn!("Tool {} failed: {}", name, e);
                timer.observe_duration("error");
                ToolOutcome::failure(format!("Error: {}", e))
            }
        }
    }

    async fn execute(&self, request: ToolRequest) -> Result<String, ToolError> {
        let session = self.sessions.ensure_session().await?;
        let api = session.api();

        let text = match request {
            ToolRequest::GetAccount => {
                let account = api.account();
                render(&format!("Logged in as {}", account.username), account)?
            }
            ToolRequest::SearchCharacters(p) => {
                let found = api.search_characters(&p.query).await?;
                render(&format!("Found {} characters for \"{}\"", found.len(), p.query), &found)?
            }
            ToolRequest::GetRecommendedCharacters => {
                let found = api.recommended_characters().await?;
                render(&format!("{} recommended characters", found.len()), &found)?
            }
            ToolRequest::GetMyCharacters => {
                let found = api.my_characters().await?;
                render(&format!("You own {} characters", found.len()), &found)?
            }
            ToolRequest::GetRecentChats => {
                let chats = api.recent_chats().await?;
                render(&format!("{} recent chats", chats.len()), &chats)?
            }
            ToolRequest::ListChats(p) => {
                let chats = api.chats(&p.character_id).await?;
                render(
                    &format!("{} chats with character {}", chats.len(), p.character_id),
                    &chats,
                )?
            }
            ToolRequest::GetChatHistory(p) => {
                let page = api.history(&p.chat_id, p.next_token.as_deref()).await?;
                let more = if page.next_token.is_some() { " (more available)" } else { "" };
                render(
                    &format!("{} turns from chat {}{}", page.turns.len(), p.chat_id, more),
                    &page,
                )?
            }
            ToolRequest::ListRooms => {
                let rooms = api.rooms().await?;
                render(&format!("{} group rooms", rooms.len()), &rooms)?
            }
            ToolRequest::SearchVoices(p) => {
                let voices = api.search_voices(&p.query).await?;
                render(&format!("Found {} voices for \"{}\"", voices.len(), p.query), &voices)?
            }
            ToolRequest::GetVoice(p) => {
                let voice = api.voice(&p.voice_id).await?;
                render(&format!("Voice {}", voice.name), &voice)?
            }
            ToolRequest::CreateCharacter(p) => {
                let character = api.create_character(&p).await?;
                render(
                    &format!("Created character {} ({})", character.name, character.external_id),
                    &character,
                )?
            }
            ToolRequest::UpdateCharacter(p) => {
                let character = api.update_character(&p).await?;
                render(&format!("Updated character {}", character.external_id), &character)?
            }
            ToolRequest::VoteCharacter(p) => {
                api.vote_character(&p.character_id, p.vote).await?;
                format!("Vote {:?} recorded for character {}", p.vote, p.character_id)
            }
            ToolRequest::CreateScene(p) => {
                let scene = api.create_scene(&p).await?;
                render(&format!("Created scene {} ({})", scene.name, scene.scene_id), &scene)?
            }
            ToolRequest::CreateVoice(p) => {
                let voice = api.create_voice(&p).await?;
                render(&format!("Created voice {} ({})", voice.name, voice.id), &voice)?
            }
            ToolRequest::UpdateVoice(p) => {
                let voice = api.update_voice(&p).await?;
                render(&format!("Updated voice {}", voice.id), &voice)?
            }
            ToolRequest::SetCharacterVoice(p) => {
                api.set_character_voice(&p.character_id, p.voice_id.as_deref()).await?;
                match p.voice_id {
                    Some(voice_id) => {
                        format!("Character {} now speaks with voice {}", p.character_id, voice_id)
                    }
                    None => format!("Character {} uses its default voice again", p.character_id),
                }
            }
            ToolRequest::UpdateProfile(p) => {
                let account = api.update_profile(&p).await?;
                render(&format!("Updated profile of {}", account.username), &account)?
            }
            ToolRequest::GetCharacterInfo(p) => {
                let character = session
                    .bound(EntityId::Character(p.character_id), |conn| {
                        Box::pin(async move { conn.character_info().await })
                    })
                    .await?;
                render(&format!("Character {}", character.name), &character)?
            }
            ToolRequest::CreateChat(p) => {
                let greeting = p.greeting;
                let created = session
                    .bound(EntityId::Character(p.character_id), move |conn| {
                        Box::pin(async move { conn.create_chat(greeting).await })
                    })
                    .await?;
                render(&format!("Created chat {}", created.chat.chat_id), &created)?
            }
            ToolRequest::SendMessage(p) => {
                let SendMessageParams { character_id, chat_id, text } = p;
                let turn = session
                    .bound(EntityId::Character(character_id), move |conn| {
                        Box::pin(async move { conn.send_message(&chat_id, &text).await })
                    })
                    .await?;
                render(&format!("{}: {}", turn.author.name, turn.text()), &turn)?
            }
            ToolRequest::RegenerateMessage(p) => {
                let TurnParams { character_id, chat_id, turn_id } = p;
                let turn = session
                    .bound(EntityId::Character(character_id), move |conn| {
                        Box::pin(async move { conn.regenerate(&chat_id, &turn_id).await })
                    })
                    .await?;
                render(&format!("New candidate: {}", turn.text()), &turn)?
            }
            ToolRequest::EditMessage(p) => {
                let EditMessageParams { character_id, chat_id, turn_id, candidate_id, text } = p;
                let turn = session
                    .bound(EntityId::Character(character_id), move |conn| {
                        Box::pin(async move {
                            conn.edit_message(&chat_id, &turn_id, &candidate_id, &text).await
                        })
                    })
                    .await?;
                render(&format!("Edited turn {}", turn.turn_key.turn_id), &turn)?
            }
            ToolRequest::PinMessage(p) => {
                let PinMessageParams { character_id, chat_id, turn_id, pinned } = p;
                let turn = session
                    .bound(EntityId::Character(character_id), move |conn| {
                        Box::pin(async move { conn.pin_message(&chat_id, &turn_id, pinned).await })
                    })
                    .await?;
                let action = if turn.is_pinned { "Pinned" } else { "Unpinned" };
                render(&format!("{} turn {}", action, turn.turn_key.turn_id), &turn)?
            }
            ToolRequest::DeleteMessages(p) => {
                let DeleteMessagesParams { character_id, chat_id, turn_ids } = p;
                let count = turn_ids.len();
                let chat = chat_id.clone();
                session
                    .bound(EntityId::Character(character_id), move |conn| {
                        Box::pin(async move { conn.delete_messages(&chat_id, &turn_ids).await })
                    })
                    .await?;
                format!("Deleted {} turns from chat {}", count, chat)
            }
            ToolRequest::SendGroupMessage(p) => {
                let GroupMessageParams { room_id, text } = p;
                let turns = session
                    .bound(EntityId::Room(room_id), move |conn| {
                        Box::pin(async move { conn.send_group_message(&text).await })
                    })
                    .await?;
                render(&format!("{} characters replied", turns.len()), &turns)?
            }
        };

        Ok(text)
    }
}
