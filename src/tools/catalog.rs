//! Tool definitions advertised by `tools/list`

use serde_json::{json, Value};

use crate::protocol::ToolDefinition;

fn string(description: &str) -> Value {
    json!({"type": "string", "description": description})
}

fn boolean(description: &str) -> Value {
    json!({"type": "boolean", "description": description})
}

fn tool(name: &str, description: &str, properties: Value, required: &[&str]) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: json!({
            "type": "object",
            "properties": properties,
            "required": required,
        }),
    }
}

fn visibility() -> Value {
    json!({
        "type": "string",
        "enum": ["public", "unlisted", "private"],
        "description": "Who can find it"
    })
}

fn character_fields() -> serde_json::Map<String, Value> {
    let mut fields = serde_json::Map::new();
    fields.insert("title".into(), string("Short tagline shown under the name"));
    fields.insert("description".into(), string("Longer description of the character"));
    fields.insert("definition".into(), string("Example dialogue and persona definition"));
    fields.insert("visibility".into(), visibility());
    fields.insert("voice_id".into(), string("Default voice for the character"));
    fields
}

pub fn definitions() -> Vec<ToolDefinition> {
    let mut create_fields = character_fields();
    create_fields.insert("name".into(), string("Character name"));
    create_fields.insert("greeting".into(), string("First message the character sends"));

    let mut update_fields = character_fields();
    update_fields.insert("character_id".into(), string("Character to update"));
    update_fields.insert("name".into(), string("New name"));
    update_fields.insert("greeting".into(), string("New greeting"));

    vec![
        tool(
            "get_account",
            "Show the Character.AI account the server is logged in as",
            json!({}),
            &[],
        ),
        tool(
            "search_characters",
            "Search public characters by name or keyword",
            json!({"query": string("Search text")}),
            &["query"],
        ),
        tool(
            "get_recommended_characters",
            "List characters recommended for this account",
            json!({}),
            &[],
        ),
        tool(
            "get_my_characters",
            "List characters created by this account",
            json!({}),
            &[],
        ),
        tool(
            "get_recent_chats",
            "List the most recent one-on-one chats",
            json!({}),
            &[],
        ),
        tool(
            "list_chats",
            "List chats with one character",
            json!({"character_id": string("Character id")}),
            &["character_id"],
        ),
        tool(
            "get_chat_history",
            "Fetch one page of turns from a chat, newest first",
            json!({
                "chat_id": string("Chat id"),
                "next_token": string("Token from a previous page to continue from")
            }),
            &["chat_id"],
        ),
        tool(
            "list_rooms",
            "List group chat rooms",
            json!({}),
            &[],
        ),
        tool(
            "search_voices",
            "Search voices by name",
            json!({"query": string("Search text")}),
            &["query"],
        ),
        tool(
            "get_voice",
            "Show details of one voice",
            json!({"voice_id": string("Voice id")}),
            &["voice_id"],
        ),
        tool(
            "create_character",
            "Create a new character",
            Value::Object(create_fields),
            &["name", "greeting"],
        ),
        tool(
            "update_character",
            "Change fields of a character you own; omitted fields are kept",
            Value::Object(update_fields),
            &["character_id"],
        ),
        tool(
            "vote_character",
            "Upvote, downvote or clear your vote on a character",
            json!({
                "character_id": string("Character id"),
                "vote": {"type": "string", "enum": ["up", "down", "none"], "description": "Vote to record"}
            }),
            &["character_id", "vote"],
        ),
        tool(
            "create_scene",
            "Create a scenario that starts chats with a character in a set situation",
            json!({
                "character_id": string("Character the scene is built around"),
                "name": string("Scene title"),
                "description": string("Situation the chat starts in"),
                "greeting": string("Opening message of the scene"),
                "visibility": visibility()
            }),
            &["character_id", "name"],
        ),
        tool(
            "create_voice",
            "Clone a new voice from a local audio sample",
            json!({
                "name": string("Voice name"),
                "audio_path": string("Path to an audio file on the machine running the server"),
                "description": string("What the voice sounds like"),
                "visibility": visibility()
            }),
            &["name", "audio_path"],
        ),
        tool(
            "update_voice",
            "Change fields of a voice you own; omitted fields are kept",
            json!({
                "voice_id": string("Voice to update"),
                "name": string("New name"),
                "description": string("New description"),
                "visibility": visibility()
            }),
            &["voice_id"],
        ),
        tool(
            "set_character_voice",
            "Make a character speak with a voice for you; omit voice_id to restore its default",
            json!({
                "character_id": string("Character id"),
                "voice_id": string("Voice to use")
            }),
            &["character_id"],
        ),
        tool(
            "update_profile",
            "Change your display name, username or bio; omitted fields are kept",
            json!({
                "name": string("Display name"),
                "username": string("Username"),
                "bio": string("Profile bio")
            }),
            &[],
        ),
        tool(
            "get_character_info",
            "Show the full profile of a character",
            json!({"character_id": string("Character id")}),
            &["character_id"],
        ),
        tool(
            "create_chat",
            "Start a new chat with a character",
            json!({
                "character_id": string("Character id"),
                "greeting": boolean("Have the character send its greeting (default true)")
            }),
            &["character_id"],
        ),
        tool(
            "send_message",
            "Send a message in a chat and wait for the character's reply",
            json!({
                "character_id": string("Character id"),
                "chat_id": string("Chat id"),
                "text": string("Message to send")
            }),
            &["character_id", "chat_id", "text"],
        ),
        tool(
            "regenerate_message",
            "Ask the character for another candidate reply to a turn",
            json!({
                "character_id": string("Character id"),
                "chat_id": string("Chat id"),
                "turn_id": string("Turn to regenerate")
            }),
            &["character_id", "chat_id", "turn_id"],
        ),
        tool(
            "edit_message",
            "Replace the text of one candidate of a turn",
            json!({
                "character_id": string("Character id"),
                "chat_id": string("Chat id"),
                "turn_id": string("Turn id"),
                "candidate_id": string("Candidate to edit"),
                "text": string("New text")
            }),
            &["character_id", "chat_id", "turn_id", "candidate_id", "text"],
        ),
        tool(
            "pin_message",
            "Pin or unpin a turn so the character keeps it in memory",
            json!({
                "character_id": string("Character id"),
                "chat_id": string("Chat id"),
                "turn_id": string("Turn id"),
                "pinned": boolean("Pin (true, default) or unpin (false)")
            }),
            &["character_id", "chat_id", "turn_id"],
        ),
        tool(
            "delete_messages",
            "Delete turns from a chat",
            json!({
                "character_id": string("Character id"),
                "chat_id": string("Chat id"),
                "turn_ids": {"type": "array", "items": {"type": "string"}, "description": "Turns to delete"}
            }),
            &["character_id", "chat_id", "turn_ids"],
        ),
        tool(
            "send_group_message",
            "Send a message to a group room and collect the characters' replies",
            json!({
                "room_id": string("Room id"),
                "text": string("Message to send")
            }),
            &["room_id", "text"],
        ),
    ]
}

/// Minimal arguments satisfying a definition's required fields
#[cfg(test)]
pub(crate) fn sample_arguments(def: &ToolDefinition) -> Value {
    let mut args = serde_json::Map::new();
    let mut required = def.input_schema["required"].as_array().cloned().unwrap_or_default();
    // All-optional tools still need one field
    if required.is_empty() {
        let properties = def.input_schema["properties"].as_object();
        required.extend(properties.and_then(|p| p.keys().next()).map(|k| json!(k)));
    }
    for field in required {
        let field = field.as_str().unwrap();
        let schema = &def.input_schema["properties"][field];
        let value = if let Some(options) = schema["enum"].as_array() {
            options[0].clone()
        } else if schema["type"] == "array" {
            json!(["t1"])
        } else {
            json!(format!("{}-1", field))
        };
        args.insert(field.to_string(), value);
    }
    Value::Object(args)
}
