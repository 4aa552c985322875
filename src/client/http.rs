//! REST side of the Character.AI client (neo and plus hosts)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use super::models::{
    Account, Character, CharacterUpdate, Chat, HistoryPage, NewCharacter, NewScene, NewVoice,
    ProfileUpdate, Room, Scene, Turn, Visibility, Voice, VoiceUpdate, Vote,
};
use super::socket::CaiConnection;
use super::{truncate_body, Authenticator, ChatApi, ClientError, Connection, EntityId};
use crate::config::ApiConfig;
use crate::credential::Token;
use crate::metrics;

/// Which upstream host a request goes to
#[derive(Debug, Clone, Copy)]
pub(crate) enum Host {
    Neo,
    Plus,
}

impl Host {
    fn label(self) -> &'static str {
        match self {
            Host::Neo => "neo",
            Host::Plus => "plus",
        }
    }
}

/// Shared HTTP plumbing, also used by open connections
pub(crate) struct Rest {
    http: reqwest::Client,
    neo_url: String,
    plus_url: String,
}

impl Rest {
    fn new(token: &Token, config: &ApiConfig) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Token {}", token.as_str()))
            .map_err(|_| ClientError::Auth("token contains invalid header characters".to_string()))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("cai-mcp/", env!("CARGO_PKG_VERSION"))),
        );

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(secs) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        Ok(Self {
            http: builder.build()?,
            neo_url: config.neo_url.trim_end_matches('/').to_string(),
            plus_url: config.plus_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, host: Host, path: &str) -> String {
        let base = match host {
            Host::Neo => &self.neo_url,
            Host::Plus => &self.plus_url,
        };
        format!("{}{}", base, path)
    }

    pub(crate) async fn get(
        &self,
        host: Host,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Value, ClientError> {
        let request = self.http.get(self.url(host, path)).query(query);
        execute(host, path, request).await
    }

    pub(crate) async fn post(&self, host: Host, path: &str, body: &Value) -> Result<Value, ClientError> {
        let request = self.http.post(self.url(host, path)).json(body);
        execute(host, path, request).await
    }

    async fn put(&self, host: Host, path: &str, body: &Value) -> Result<Value, ClientError> {
        let request = self.http.put(self.url(host, path)).json(body);
        execute(host, path, request).await
    }

    async fn post_multipart(
        &self,
        host: Host,
        path: &str,
        form: reqwest::multipart::Form,
    ) -> Result<Value, ClientError> {
        let request = self.http.post(self.url(host, path)).multipart(form);
        execute(host, path, request).await
    }

    pub(crate) async fn character_info(&self, character_id: &str) -> Result<Character, ClientError> {
        let body = self
            .post(Host::Plus, "/chat/character/info/", &json!({ "external_id": character_id }))
            .await?;
        take_field(body, "character")
    }
}

async fn execute(
    host: Host,
    path: &str,
    request: reqwest::RequestBuilder,
) -> Result<Value, ClientError> {
    debug!("{} {}", host.label(), path);

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            metrics::record_upstream_request(host.label(), "error");
            return Err(e.into());
        }
    };

    let status = response.status();
    metrics::record_upstream_request(host.label(), status.as_str());
    let text = response.text().await?;

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(ClientError::Auth(format!("HTTP {}: {}", status.as_u16(), truncate_body(&text))));
    }
    if !status.is_success() {
        return Err(ClientError::Api {
            status: status.as_u16(),
            body: truncate_body(&text),
        });
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_str(&text)?)
}

/// Pull one field out of a response body and deserialize it
pub(crate) fn take_field<T: DeserializeOwned>(mut body: Value, key: &str) -> Result<T, ClientError> {
    let value = body
        .get_mut(key)
        .map(Value::take)
        .ok_or_else(|| ClientError::Protocol(format!("missing `{}` in response", key)))?;
    Ok(serde_json::from_value(value)?)
}

/// Account lives at `user.user`
fn parse_account(body: Value) -> Result<Account, ClientError> {
    let user: Value = take_field(body, "user")?;
    take_field(user, "user")
}

/// Logs in with a token
pub struct CaiAuthenticator {
    config: ApiConfig,
}

impl CaiAuthenticator {
    pub fn new(config: ApiConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Authenticator for CaiAuthenticator {
    async fn authenticate(&self, token: &Token) -> Result<Box<dyn ChatApi>, ClientError> {
        let rest = Rest::new(token, &self.config)?;
        let body = rest.get(Host::Plus, "/chat/user/", &[]).await?;
        let account = parse_account(body)?;

        info!("Authenticated as {} ({})", account.username, account.id);

        Ok(Box::new(CaiApi {
            rest: Arc::new(rest),
            token: token.clone(),
            account,
            ws_url: self.config.ws_url.clone(),
            group_idle: Duration::from_millis(self.config.group_idle_ms),
        }))
    }
}

/// Authenticated session against the live platform
pub struct CaiApi {
    rest: Arc<Rest>,
    token: Token,
    account: Account,
    ws_url: String,
    group_idle: Duration,
}

#[async_trait]
impl ChatApi for CaiApi {
    fn account(&self) -> &Account {
        &self.account
    }

    async fn recent_chats(&self) -> Result<Vec<Chat>, ClientError> {
        let body = self.rest.get(Host::Neo, "/chats/recent/", &[]).await?;
        take_field(body, "chats")
    }

    async fn chats(&self, character_id: &str) -> Result<Vec<Chat>, ClientError> {
        let body = self
            .rest
            .get(Host::Neo, "/chats/", &[("character_ids", character_id)])
            .await?;
        take_field(body, "chats")
    }

    async fn history(
        &self,
        chat_id: &str,
        next_token: Option<&str>,
    ) -> Result<HistoryPage, ClientError> {
        let path = format!("/turns/{}/", chat_id);
        let query: Vec<(&str, &str)> = next_token.map(|t| ("next_token", t)).into_iter().collect();
        let mut body = self.rest.get(Host::Neo, &path, &query).await?;

        let next_token = body
            .pointer("/meta/next_token")
            .and_then(Value::as_str)
            .map(String::from);
        let turns: Vec<Turn> = match body.get_mut("turns") {
            Some(turns) => serde_json::from_value(turns.take())?,
            None => Vec::new(),
        };

        Ok(HistoryPage { turns, next_token })
    }

    async fn search_characters(&self, query: &str) -> Result<Vec<Character>, ClientError> {
        let body = self
            .rest
            .get(Host::Plus, "/chat/characters/search/", &[("query", query)])
            .await?;
        take_field(body, "characters")
    }

    async fn recommended_characters(&self) -> Result<Vec<Character>, ClientError> {
        let body = self.rest.get(Host::Neo, "/recommendation/v1/user", &[]).await?;
        take_field(body, "characters")
    }

    async fn my_characters(&self) -> Result<Vec<Character>, ClientError> {
        let body = self
            .rest
            .get(Host::Plus, "/chat/characters/", &[("scope", "user")])
            .await?;
        take_field(body, "characters")
    }

    async fn rooms(&self) -> Result<Vec<Room>, ClientError> {
        let body = self.rest.get(Host::Neo, "/murooms/", &[]).await?;
        take_field(body, "rooms")
    }

    async fn search_voices(&self, query: &str) -> Result<Vec<Voice>, ClientError> {
        let body = self
            .rest
            .get(Host::Neo, "/multimodal/api/v1/voices/search", &[("query", query)])
            .await?;
        take_field(body, "voices")
    }

    async fn voice(&self, voice_id: &str) -> Result<Voice, ClientError> {
        let path = format!("/multimodal/api/v1/voices/{}", voice_id);
        let body = self.rest.get(Host::Neo, &path, &[]).await?;
        take_field(body, "voice")
    }

    async fn create_character(&self, character: &NewCharacter) -> Result<Character, ClientError> {
        let voice_id = character.voice_id.clone().unwrap_or_default();
        let payload = json!({
            "identifier": format!("id:{}", Uuid::new_v4()),
            "name": character.name,
            "greeting": character.greeting,
            "title": character.title.clone().unwrap_or_default(),
            "description": character.description.clone().unwrap_or_default(),
            "definition": character.definition.clone().unwrap_or_default(),
            "visibility": character.visibility.unwrap_or_default().as_upstream(),
            "categories": [],
            "copyable": false,
            "avatar_rel_path": "",
            "img_gen_enabled": false,
            "base_img_prompt": "",
            "strip_img_prompt_from_msg": false,
            "voice_id": voice_id,
            "default_voice_id": voice_id,
        });

        let body = self.rest.post(Host::Plus, "/chat/character/create/", &payload).await?;
        take_field(body, "character")
    }

    async fn update_character(&self, update: &CharacterUpdate) -> Result<Character, ClientError> {
        // The endpoint replaces every field, so start from the current state
        let current = self.rest.character_info(&update.character_id).await?;
        let payload = merge_update(&current, update);

        let body = self.rest.post(Host::Plus, "/chat/character/update/", &payload).await?;
        take_field(body, "character")
    }

    async fn vote_character(&self, character_id: &str, vote: Vote) -> Result<(), ClientError> {
        let payload = json!({ "external_id": character_id, "vote": vote.as_upstream() });
        self.rest.post(Host::Plus, "/chat/character/vote/", &payload).await?;
        Ok(())
    }

    async fn create_scene(&self, scene: &NewScene) -> Result<Scene, ClientError> {
        let payload = json!({
            "character_id": scene.character_id,
            "title": scene.name,
            "description": scene.description.clone().unwrap_or_default(),
            "greeting": scene.greeting.clone().unwrap_or_default(),
            "visibility": scene.visibility.unwrap_or_default().as_upstream(),
        });

        let body = self.rest.post(Host::Plus, "/chat/scene/create/", &payload).await?;
        take_field(body, "scene")
    }

    async fn create_voice(&self, voice: &NewVoice) -> Result<Voice, ClientError> {
        let path = &voice.audio_path;
        let audio = tokio::fs::read(path).await.map_err(|source| ClientError::File {
            path: path.display().to_string(),
            source,
        })?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("sample.wav")
            .to_string();
        info!("Uploading {} bytes of voice sample {}", audio.len(), file_name);

        let metadata = json!({
            "voice": {
                "name": voice.name,
                "description": voice.description.clone().unwrap_or_default(),
                "visibility": voice.visibility.unwrap_or_default().as_upstream().to_lowercase(),
                "audioSourceType": "file",
            }
        });
        let form = reqwest::multipart::Form::new()
            .part("file", reqwest::multipart::Part::bytes(audio).file_name(file_name))
            .text("json", metadata.to_string());

        let body = self
            .rest
            .post_multipart(Host::Neo, "/multimodal/api/v1/voices/", form)
            .await?;
        take_field(body, "voice")
    }

    async fn update_voice(&self, update: &VoiceUpdate) -> Result<Voice, ClientError> {
        // Same full-replace semantics as characters
        let current = self.voice(&update.voice_id).await?;
        let payload = merge_voice(&current, update);

        let path = format!("/multimodal/api/v1/voices/{}", update.voice_id);
        let body = self.rest.put(Host::Neo, &path, &json!({ "voice": payload })).await?;
        take_field(body, "voice")
    }

    async fn set_character_voice(
        &self,
        character_id: &str,
        voice_id: Option<&str>,
    ) -> Result<(), ClientError> {
        let payload = json!({
            "character_id": character_id,
            "voice_id": voice_id.unwrap_or_default(),
        });
        self.rest
            .post(Host::Plus, "/chat/character/voice_override/update/", &payload)
            .await?;
        Ok(())
    }

    async fn update_profile(&self, profile: &ProfileUpdate) -> Result<Account, ClientError> {
        let current = &self.account;
        let keep = |new: &Option<String>, key: &str| {
            new.clone()
                .or_else(|| current.extra.get(key).and_then(Value::as_str).map(String::from))
                .unwrap_or_default()
        };
        let payload = json!({
            "username": profile.username.clone().unwrap_or_else(|| current.username.clone()),
            "name": keep(&profile.name, "name"),
            "bio": keep(&profile.bio, "bio"),
            "avatar_rel_path": keep(&None, "account_avatar_file_name"),
        });
        self.rest.post(Host::Plus, "/chat/user/update/", &payload).await?;

        let body = self.rest.get(Host::Plus, "/chat/user/", &[]).await?;
        parse_account(body)
    }

    async fn connect(&self, entity: &EntityId) -> Result<Box<dyn Connection>, ClientError> {
        let connection = CaiConnection::open(
            &self.ws_url,
            &self.token,
            entity.clone(),
            Arc::clone(&self.rest),
            self.account.clone(),
            self.group_idle,
        )
        .await?;
        Ok(Box::new(connection))
    }
}

fn merge_update(current: &Character, update: &CharacterUpdate) -> Value {
    let pick = |new: &Option<String>, old: &Option<String>| {
        new.clone().or_else(|| old.clone()).unwrap_or_default()
    };
    let visibility = update
        .visibility
        .map(|v| v.as_upstream().to_string())
        .or_else(|| current.visibility.clone())
        .unwrap_or_else(|| Visibility::default().as_upstream().to_string());
    let voice_id = update.voice_id.clone().or_else(|| {
        current
            .extra
            .get("default_voice_id")
            .and_then(Value::as_str)
            .map(String::from)
    });

    json!({
        "external_id": current.external_id,
        "name": update.name.clone().unwrap_or_else(|| current.name.clone()),
        "greeting": pick(&update.greeting, &current.greeting),
        "title": pick(&update.title, &current.title),
        "description": pick(&update.description, &current.description),
        "definition": pick(&update.definition, &current.definition),
        "visibility": visibility,
        "categories": current.extra.get("categories").cloned().unwrap_or_else(|| json!([])),
        "copyable": current.extra.get("copyable").cloned().unwrap_or(Value::Bool(false)),
        "avatar_rel_path": current.extra.get("avatar_file_name").cloned().unwrap_or_else(|| json!("")),
        "voice_id": voice_id.clone().unwrap_or_default(),
        "default_voice_id": voice_id.unwrap_or_default(),
    })
}

fn merge_voice(current: &Voice, update: &VoiceUpdate) -> Value {
    let visibility = update
        .visibility
        .map(|v| v.as_upstream().to_lowercase())
        .or_else(|| {
            current
                .extra
                .get("visibility")
                .and_then(Value::as_str)
                .map(String::from)
        })
        .unwrap_or_else(|| Visibility::default().as_upstream().to_lowercase());

    let mut voice = current.extra.clone();
    voice.insert("id".to_string(), json!(current.id));
    voice.insert(
        "name".to_string(),
        json!(update.name.clone().unwrap_or_else(|| current.name.clone())),
    );
    voice.insert(
        "description".to_string(),
        json!(update
            .description
            .clone()
            .or_else(|| current.description.clone())
            .unwrap_or_default()),
    );
    voice.insert("visibility".to_string(), json!(visibility));
    Value::Object(voice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::stub;
    use axum::extract::Query;
    use axum::http::{HeaderMap as AxumHeaders, StatusCode};
    use axum::body::Bytes;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;

    fn config_for(addr: &str) -> ApiConfig {
        ApiConfig {
            neo_url: format!("http://{}", addr),
            plus_url: format!("http://{}/plus", addr),
            ws_url: format!("ws://{}/ws/", addr),
            request_timeout_secs: Some(5),
            group_idle_ms: 200,
        }
    }

    async fn user_handler(headers: AxumHeaders) -> Result<Json<Value>, StatusCode> {
        match headers.get("authorization").and_then(|v| v.to_str().ok()) {
            Some("Token good") => Ok(Json(json!({
                "user": {"user": {"id": 7, "username": "tester"}, "is_human": true}
            }))),
            _ => Err(StatusCode::UNAUTHORIZED),
        }
    }

    async fn search_handler(Query(params): Query<HashMap<String, String>>) -> Json<Value> {
        let query = params.get("query").cloned().unwrap_or_default();
        Json(json!({
            "characters": [{"external_id": "c1", "participant__name": query}]
        }))
    }

    async fn voice_handler() -> Json<Value> {
        Json(json!({
            "voice": {
                "id": "v1",
                "name": "Old name",
                "description": "keep me",
                "visibility": "public",
                "creatorInfo": {"username": "tester"}
            }
        }))
    }

    async fn voice_put_handler(Json(body): Json<Value>) -> Json<Value> {
        Json(body)
    }

    async fn voice_upload_handler(headers: AxumHeaders, body: Bytes) -> Result<Json<Value>, StatusCode> {
        let multipart = headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("multipart/form-data"));
        let text = String::from_utf8_lossy(&body);
        if !multipart || !text.contains("sample.wav") || !text.contains("Narrator") {
            return Err(StatusCode::BAD_REQUEST);
        }
        Ok(Json(json!({"voice": {"id": "v9", "name": "Narrator"}})))
    }

    async fn voice_override_handler(Json(body): Json<Value>) -> StatusCode {
        if body["character_id"] == "c1" && body["voice_id"] == "" {
            StatusCode::OK
        } else {
            StatusCode::BAD_REQUEST
        }
    }

    async fn profile_handler(Json(body): Json<Value>) -> StatusCode {
        // Unset fields must carry the current values
        if body["username"] == "tester" && body["bio"] == "hello" {
            StatusCode::OK
        } else {
            StatusCode::BAD_REQUEST
        }
    }

    fn stub_router() -> Router {
        Router::new()
            .route("/plus/chat/user/", get(user_handler))
            .route("/plus/chat/user/update/", post(profile_handler))
            .route("/plus/chat/characters/search/", get(search_handler))
            .route(
                "/plus/chat/character/voice_override/update/",
                post(voice_override_handler),
            )
            .route("/multimodal/api/v1/voices/", post(voice_upload_handler))
            .route(
                "/multimodal/api/v1/voices/v1",
                get(voice_handler).put(voice_put_handler),
            )
            .route("/chats/recent/", get(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }))
    }

    async fn api_for(addr: &str) -> Box<dyn ChatApi> {
        CaiAuthenticator::new(config_for(addr))
            .authenticate(&Token::parse("good").unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_authenticate_reads_account() {
        let addr = stub::spawn(stub_router()).await;
        let auth = CaiAuthenticator::new(config_for(&addr));

        let api = auth.authenticate(&Token::parse("good").unwrap()).await.unwrap();
        assert_eq!(api.account().username, "tester");
        assert_eq!(api.account().id, "7");
    }

    #[tokio::test]
    async fn test_rejected_token_is_auth_error() {
        let addr = stub::spawn(stub_router()).await;
        let auth = CaiAuthenticator::new(config_for(&addr));

        let err = auth.authenticate(&Token::parse("bad").unwrap()).await.err().unwrap();
        assert!(matches!(err, ClientError::Auth(_)));
    }

    #[tokio::test]
    async fn test_search_passes_query() {
        let addr = stub::spawn(stub_router()).await;
        let auth = CaiAuthenticator::new(config_for(&addr));
        let api = auth.authenticate(&Token::parse("good").unwrap()).await.unwrap();

        let found = api.search_characters("ada lovelace").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "ada lovelace");
    }

    #[tokio::test]
    async fn test_non_success_status_is_api_error() {
        let addr = stub::spawn(stub_router()).await;
        let auth = CaiAuthenticator::new(config_for(&addr));
        let api = auth.authenticate(&Token::parse("good").unwrap()).await.unwrap();

        match api.recent_chats().await {
            Err(ClientError::Api { status, body }) => {
                assert_eq!(status, 502);
                assert_eq!(body, "upstream down");
            }
            other => panic!("expected api error, got {:?}", other.map(|c| c.len())),
        }
    }

    #[tokio::test]
    async fn test_update_voice_merges_current() {
        let addr = stub::spawn(stub_router()).await;
        let api = api_for(&addr).await;

        let update = VoiceUpdate {
            voice_id: "v1".to_string(),
            name: Some("New name".to_string()),
            ..Default::default()
        };
        let voice = api.update_voice(&update).await.unwrap();
        assert_eq!(voice.name, "New name");
        assert_eq!(voice.description.as_deref(), Some("keep me"));
        assert_eq!(voice.extra["visibility"], "public");
        assert_eq!(voice.extra["creatorInfo"]["username"], "tester");
    }

    #[tokio::test]
    async fn test_create_voice_uploads_sample() {
        let addr = stub::spawn(stub_router()).await;
        let api = api_for(&addr).await;
        let dir = tempfile::tempdir().unwrap();
        let sample = dir.path().join("sample.wav");
        std::fs::write(&sample, b"RIFF....WAVE").unwrap();

        let voice = api
            .create_voice(&NewVoice {
                name: "Narrator".to_string(),
                audio_path: sample,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(voice.id, "v9");
    }

    #[tokio::test]
    async fn test_create_voice_missing_sample() {
        let addr = stub::spawn(stub_router()).await;
        let api = api_for(&addr).await;
        let dir = tempfile::tempdir().unwrap();

        let err = api
            .create_voice(&NewVoice {
                name: "Narrator".to_string(),
                audio_path: dir.path().join("absent.wav"),
                ..Default::default()
            })
            .await
            .unwrap_err();
        match err {
            ClientError::File { path, .. } => assert!(path.ends_with("absent.wav")),
            other => panic!("expected file error, got {}", other),
        }
    }

    #[tokio::test]
    async fn test_reset_character_voice() {
        let addr = stub::spawn(stub_router()).await;
        let api = api_for(&addr).await;

        api.set_character_voice("c1", None).await.unwrap();
        assert!(api.set_character_voice("c2", None).await.is_err());
    }

    #[tokio::test]
    async fn test_update_profile_keeps_username() {
        let addr = stub::spawn(stub_router()).await;
        let api = api_for(&addr).await;

        let profile = ProfileUpdate {
            bio: Some("hello".to_string()),
            ..Default::default()
        };
        let account = api.update_profile(&profile).await.unwrap();
        assert_eq!(account.username, "tester");
    }

    #[test]
    fn test_take_field_missing() {
        let err = take_field::<Vec<Chat>>(json!({"other": []}), "chats").unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[test]
    fn test_merge_update_keeps_current_fields() {
        let current: Character = serde_json::from_value(json!({
            "external_id": "c1",
            "name": "Ada",
            "greeting": "Hello",
            "title": "Mathematician",
            "visibility": "PUBLIC",
            "categories": ["science"]
        }))
        .unwrap();
        let update = CharacterUpdate {
            character_id: "c1".to_string(),
            greeting: Some("Hi there".to_string()),
            ..Default::default()
        };

        let merged = merge_update(&current, &update);
        assert_eq!(merged["name"], "Ada");
        assert_eq!(merged["greeting"], "Hi there");
        assert_eq!(merged["title"], "Mathematician");
        assert_eq!(merged["visibility"], "PUBLIC");
        assert_eq!(merged["categories"], json!(["science"]));
    }
}
