//! Character.AI payloads
//!
//! Each model names the fields the tools rely on and keeps every other
//! upstream field in `extra`, so rendering a model back to JSON loses nothing.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Ids arrive as numbers from some endpoints and as strings from others
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {}",
            other
        ))),
    }
}

/// The authenticated user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub username: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Character {
    #[serde(alias = "character_id")]
    pub external_id: String,
    #[serde(default, alias = "participant__name")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub greeting: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub definition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TurnKey {
    pub chat_id: String,
    pub turn_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Author {
    #[serde(deserialize_with = "string_or_number")]
    pub author_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_human: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate_id: String,
    #[serde(default)]
    pub raw_content: String,
    #[serde(default)]
    pub is_final: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One message in a chat, with its alternative candidates (swipes)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub turn_key: TurnKey,
    pub author: Author,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_candidate_id: Option<String>,
    #[serde(default)]
    pub is_pinned: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Turn {
    /// The primary candidate, falling back to the last one
    pub fn primary_candidate(&self) -> Option<&Candidate> {
        self.primary_candidate_id
            .as_deref()
            .and_then(|id| self.candidates.iter().find(|c| c.candidate_id == id))
            .or_else(|| self.candidates.last())
    }

    pub fn text(&self) -> &str {
        self.primary_candidate()
            .map(|c| c.raw_content.as_str())
            .unwrap_or("")
    }

    pub fn is_final(&self) -> bool {
        self.primary_candidate().map_or(false, |c| c.is_final)
    }
}

/// A page of chat history, newest first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub turns: Vec<Turn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

/// Result of opening a new chat
#[derive(Debug, Clone, Serialize)]
pub struct NewChat {
    pub chat: Chat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub greeting: Option<Turn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Voice {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Group chat room
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    #[serde(alias = "external_id", alias = "chat_id")]
    pub room_id: String,
    #[serde(default, alias = "name")]
    pub title: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Unlisted,
    #[default]
    Private,
}

impl Visibility {
    pub fn as_upstream(self) -> &'static str {
        match self {
            Visibility::Public => "PUBLIC",
            Visibility::Unlisted => "UNLISTED",
            Visibility::Private => "PRIVATE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vote {
    Up,
    Down,
    None,
}

impl Vote {
    pub fn as_upstream(self) -> Value {
        match self {
            Vote::Up => Value::Bool(true),
            Vote::Down => Value::Bool(false),
            Vote::None => Value::Null,
        }
    }
}

/// Fields for a new character
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NewCharacter {
    pub name: String,
    pub greeting: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub definition: Option<String>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub voice_id: Option<String>,
}

/// Changes to an existing character; unset fields keep their current value
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct CharacterUpdate {
    pub character_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub greeting: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub definition: Option<String>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
    #[serde(default)]
    pub voice_id: Option<String>,
}

/// Scenario built around one character
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    #[serde(alias = "external_id", alias = "id")]
    pub scene_id: String,
    #[serde(default, alias = "title")]
    pub name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NewScene {
    pub character_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub greeting: Option<String>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
}

/// A voice cloned from a local audio sample
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NewVoice {
    pub name: String,
    pub audio_path: PathBuf,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
}

/// Changes to a voice you own; unset fields keep their current value
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct VoiceUpdate {
    pub voice_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub visibility: Option<Visibility>,
}

/// Public profile fields of the account
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn turn_json(final_flag: bool) -> Value {
        json!({
            "turn_key": {"chat_id": "c1", "turn_id": "t1"},
            "author": {"author_id": 42, "name": "Bot", "is_human": false},
            "candidates": [
                {"candidate_id": "a", "raw_content": "first", "is_final": true},
                {"candidate_id": "b", "raw_content": "second", "is_final": final_flag}
            ],
            "primary_candidate_id": "b",
            "state": "STATE_OK"
        })
    }

    #[test]
    fn test_turn_uses_primary_candidate() {
        let turn: Turn = serde_json::from_value(turn_json(false)).unwrap();
        assert_eq!(turn.text(), "second");
        assert!(!turn.is_final());
        assert_eq!(turn.author.author_id, "42");
        assert_eq!(turn.extra.get("state"), Some(&json!("STATE_OK")));
    }

    #[test]
    fn test_turn_final_flag() {
        let turn: Turn = serde_json::from_value(turn_json(true)).unwrap();
        assert!(turn.is_final());
    }

    #[test]
    fn test_character_keeps_unknown_fields() {
        let character: Character = serde_json::from_value(json!({
            "external_id": "char-1",
            "name": "Ada",
            "participant__num_interactions": 12
        }))
        .unwrap();

        let back = serde_json::to_value(&character).unwrap();
        assert_eq!(back["participant__num_interactions"], json!(12));
        assert!(back.get("title").is_none());
    }

    #[test]
    fn test_account_numeric_id() {
        let account: Account =
            serde_json::from_value(json!({"id": 1234, "username": "me"})).unwrap();
        assert_eq!(account.id, "1234");
    }

    #[test]
    fn test_scene_accepts_external_id() {
        let scene: Scene =
            serde_json::from_value(json!({"external_id": "s1", "title": "Heist", "tags": []}))
                .unwrap();
        assert_eq!(scene.scene_id, "s1");
        assert_eq!(scene.name, "Heist");
        assert!(scene.extra.contains_key("tags"));
    }

    #[test]
    fn test_vote_upstream_values() {
        assert_eq!(Vote::Up.as_upstream(), json!(true));
        assert_eq!(Vote::Down.as_upstream(), json!(false));
        assert_eq!(Vote::None.as_upstream(), Value::Null);
    }
}
