//! End-to-end tests against a local mock of the OpenAI HTTP API.
//!
//! The mock serves `/v1/embeddings`, `/v1/chat/completions`, and
//! `/v1/audio/speech`. Embeddings are keyword counts so semantic ranking is
//! predictable. A second mock answers with a scripted sequence of status
//! codes to exercise the client's retries.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use vaultforge::chat::{respond_to_note, OpenAIChat};
use vaultforge::config::{parse_config, Config, OpenAiConfig};
use vaultforge::embedding::create_provider;
use vaultforge::generate::{EntityKind, Generator};
use vaultforge::index::{load_index, rebuild};
use vaultforge::openai::OpenAiClient;
use vaultforge::retrieve::{MatchPhase, Retriever};
use vaultforge::speech::{act_note, AudioSink, OffsetStore, OpenAISpeech};
use vaultforge::talk::{NpcRegistry, Talk, Voice};
use vaultforge::vault::Vault;

const MP3: &[u8] = b"ID3\x04mock-audio";

#[derive(Clone, Default)]
struct Mock {
    embedded: Arc<AtomicUsize>,
    chats: Arc<Mutex<Vec<Value>>>,
    speech: Arc<Mutex<Vec<Value>>>,
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        == Some("Bearer sk-test")
}

fn keyword_vector(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    let count = |words: &[&str]| words.iter().map(|w| lower.matches(w).count()).sum::<usize>() as f32;
    vec![count(&["dragon", "wyrm"]), count(&["tavern", "ale"]), 0.01]
}

async fn embeddings(
    State(mock): State<Mock>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let inputs: Vec<String> = match &body["input"] {
        Value::String(s) => vec![s.clone()],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => return Err(StatusCode::BAD_REQUEST),
    };
    mock.embedded.fetch_add(inputs.len(), Ordering::SeqCst);
    let data: Vec<Value> = inputs
        .iter()
        .enumerate()
        .map(|(i, text)| json!({"index": i, "embedding": keyword_vector(text)}))
        .collect();
    Ok(Json(json!({"data": data, "model": body["model"]})))
}

async fn chat_completions(
    State(mock): State<Mock>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let last = body["messages"]
        .as_array()
        .and_then(|m| m.last())
        .and_then(|m| m["content"].as_str())
        .unwrap_or_default()
        .to_string();
    mock.chats.lock().unwrap().push(body);
    Ok(Json(json!({
        "choices": [{"message": {"role": "assistant", "content": format!("You asked: {}", last)}}]
    })))
}

async fn audio_speech(
    State(mock): State<Mock>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Vec<u8>, StatusCode> {
    if !authorized(&headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    mock.speech.lock().unwrap().push(body);
    Ok(MP3.to_vec())
}

async fn start_mock() -> (Mock, String) {
    let mock = Mock::default();
    let app = Router::new()
        .route("/v1/embeddings", post(embeddings))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/audio/speech", post(audio_speech))
        .with_state(mock.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    (mock, format!("http://{}/v1", addr))
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

fn setup(base_url: &str) -> (TempDir, Config) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    write(root, "vault/Lore/Red.md", "# Red\n\nA red dragon sleeps on a hoard of gold.\n");
    write(root, "vault/Places/Inn.md", "# Inn\n\nA tavern with cheap ale and loud songs.\n");
    write(
        root,
        "vault/NPCs/Mira.md",
        "---\ntype: npc\nvoice: fable\nstyle: warm\n---\n# Mira\n\nKeeps the inn.\n",
    );

    let config = parse_config(&format!(
        r#"
[vault]
root = "{root}/vault"

[index]
path = "{root}/data/index.json"

[openai]
api_key = "sk-test"
base_url = "{base_url}"
timeout_secs = 10

[talk]
autoplay = true
transcript_mode = "both"

[speech]
audio_dir = "{root}/audio"
offsets_path = "{root}/data/offsets.json"
"#,
        root = root.display(),
        base_url = base_url
    ))
    .unwrap();
    (tmp, config)
}

#[tokio::test]
async fn test_index_reuses_vectors_and_ranks_semantically() {
    let (mock, base_url) = start_mock().await;
    let (_tmp, config) = setup(&base_url);
    let vault = Vault::open(&config.vault).unwrap();
    let provider = create_provider(&config.openai);

    let (snap, report) = rebuild(&config, &vault, provider.as_ref(), None, false)
        .await
        .unwrap();
    assert_eq!(report.files, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.embedded, snap.entries.len());
    assert!(snap.entries.iter().all(|e| e.has_embedding()));
    let requests = mock.embedded.load(Ordering::SeqCst);

    // Nothing changed: every vector comes from the previous snapshot.
    let previous = load_index(&config.index.path).unwrap();
    let (_, report) = rebuild(&config, &vault, provider.as_ref(), Some(&previous), false)
        .await
        .unwrap();
    assert_eq!(report.embedded, 0);
    assert_eq!(report.reused, snap.entries.len());
    assert_eq!(mock.embedded.load(Ordering::SeqCst), requests);

    // "wyrm" appears in no note, so ranking falls to the embeddings.
    let retriever = Retriever::open(&config);
    let result = retriever.retrieve("wyrm").await;
    assert_eq!(result.phase, MatchPhase::Semantic);
    assert_eq!(result.hits[0].path, "Lore/Red.md");
}

#[tokio::test]
async fn test_chat_note_answered_through_api() {
    let (mock, base_url) = start_mock().await;
    let (_tmp, config) = setup(&base_url);
    let vault = Vault::open(&config.vault).unwrap();
    vault
        .write("Chats/Session.md", "**You:** hello\n**GPT:** hi\nwhere is the tavern?\n")
        .unwrap();

    let model = OpenAIChat::new(&config.openai).unwrap();
    let reply = respond_to_note(&vault, "Chats/Session.md", &config.chat, None, &model)
        .await
        .unwrap();
    assert_eq!(reply.as_deref(), Some("You asked: where is the tavern?"));

    let content = vault.read("Chats/Session.md").unwrap();
    assert!(content.contains("**You:** where is the tavern?"));
    assert!(content.ends_with("**GPT:** You asked: where is the tavern?\n"));

    let chats = mock.chats.lock().unwrap();
    assert_eq!(chats[0]["model"], "gpt-4o");
    assert_eq!(chats[0]["messages"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_npc_reply_is_recorded_and_voiced() {
    let (mock, base_url) = start_mock().await;
    let (tmp, config) = setup(&base_url);
    let vault = Vault::open(&config.vault).unwrap();
    let registry = NpcRegistry::in_memory();
    let chat = OpenAIChat::new(&config.openai).unwrap();
    let synth = OpenAISpeech::new(&config.openai).unwrap();
    let sink = AudioSink::new(tmp.path().join("audio"));

    let talk = Talk {
        vault: &vault,
        config: &config.talk,
        registry: &registry,
        retriever: None,
        chat: &chat,
        voice: Some(Voice {
            synth: &synth,
            sink: &sink,
        }),
    };
    let reply = talk.respond("Mira", "Any rooms?").await.unwrap();
    assert_eq!(reply.reply, "You asked: Any rooms?");
    assert_eq!(std::fs::read(reply.audio.unwrap()).unwrap(), MP3);

    assert!(vault
        .read("Transcripts/Mira.md")
        .unwrap()
        .contains("Player: Any rooms?\nMira: You asked: Any rooms?\n"));
    assert!(vault.read("NPCs/Mira.md").unwrap().contains("## Dialogue Log"));

    assert_eq!(mock.chats.lock().unwrap()[0]["model"], "gpt-4o-mini");
    let speech = mock.speech.lock().unwrap();
    assert_eq!(speech[0]["voice"], "alloy");
    assert_eq!(speech[0]["response_format"], "mp3");
}

#[tokio::test]
async fn test_voice_act_only_voices_new_npc_lines() {
    let (mock, base_url) = start_mock().await;
    let (tmp, config) = setup(&base_url);
    let vault = Vault::open(&config.vault).unwrap();
    vault
        .write(
            "Sessions/One.md",
            "[[Mira]]: Welcome in.\n[[Aria]]: Thanks.\n",
        )
        .unwrap();
    let synth = OpenAISpeech::new(&config.openai).unwrap();
    let sink = AudioSink::new(tmp.path().join("audio"));
    let mut offsets = OffsetStore::in_memory();

    let report = act_note(&vault, "Sessions/One.md", &config.speech, &mut offsets, &synth, &sink)
        .await
        .unwrap();
    assert_eq!(report.found, 2);
    assert_eq!(report.queued, 1);
    assert_eq!(report.files.len(), 1);
    {
        let speech = mock.speech.lock().unwrap();
        assert_eq!(speech[0]["voice"], "fable");
        assert!(speech[0]["input"].as_str().unwrap().contains("Speaking style: warm"));
    }

    // Nothing new: no further requests.
    let report = act_note(&vault, "Sessions/One.md", &config.speech, &mut offsets, &synth, &sink)
        .await
        .unwrap();
    assert_eq!(report.found, 0);

    vault.append("Sessions/One.md", "[[Mira]]: Last call.\n").unwrap();
    let report = act_note(&vault, "Sessions/One.md", &config.speech, &mut offsets, &synth, &sink)
        .await
        .unwrap();
    assert_eq!(report.queued, 1);
    assert_eq!(mock.speech.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_generate_item_through_api() {
    let (mock, base_url) = start_mock().await;
    let (_tmp, config) = setup(&base_url);
    let vault = Vault::open(&config.vault).unwrap();
    let chat = OpenAIChat::new(&config.openai).unwrap();
    let generator = Generator {
        vault: &vault,
        config: &config.generate,
        retriever: None,
        chat: &chat,
    };

    // The mock echoes instead of answering JSON: the reply becomes the description.
    let generated = generator
        .generate(EntityKind::Item, "Lamp", "an oil lamp that never goes out")
        .await
        .unwrap();
    assert_eq!(generated.path, "Items/Lamp.md");
    let note = vault.read("Items/Lamp.md").unwrap();
    assert!(note.starts_with("# Lamp\n\n## Description\nYou asked: Item Name: Lamp\n"));

    let chats = mock.chats.lock().unwrap();
    assert_eq!(chats[0]["messages"][0]["role"], "system");
    assert!(chats[0]["messages"][0]["content"]
        .as_str()
        .unwrap()
        .contains("rarity, material, origin"));
}

// ============ Retries ============

#[derive(Clone)]
struct StatusMock {
    hits: Arc<AtomicUsize>,
    statuses: Arc<Vec<u16>>,
}

/// Answers the n-th request with the n-th status (the last one repeats).
async fn scripted_status(State(mock): State<StatusMock>) -> (StatusCode, Json<Value>) {
    let n = mock.hits.fetch_add(1, Ordering::SeqCst);
    let code = mock.statuses[n.min(mock.statuses.len() - 1)];
    let status = StatusCode::from_u16(code).unwrap();
    if status.is_success() {
        (status, Json(json!({"ok": true})))
    } else {
        (status, Json(json!({"error": {"message": format!("status {}", code)}})))
    }
}

async fn start_status_mock(statuses: &[u16]) -> (Arc<AtomicUsize>, String) {
    let mock = StatusMock {
        hits: Arc::new(AtomicUsize::new(0)),
        statuses: Arc::new(statuses.to_vec()),
    };
    let hits = mock.hits.clone();
    let app = Router::new()
        .route("/v1/echo", post(scripted_status))
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    (hits, format!("http://{}/v1", addr))
}

fn client(base_url: &str, max_retries: u32) -> OpenAiClient {
    OpenAiClient::from_config(&OpenAiConfig {
        api_key: Some("sk-test".to_string()),
        base_url: base_url.to_string(),
        timeout_secs: 10,
        max_retries,
        ..OpenAiConfig::default()
    })
    .unwrap()
}

#[tokio::test]
async fn test_rate_limit_is_retried() {
    let (hits, base_url) = start_status_mock(&[429, 200]).await;
    let body = client(&base_url, 1)
        .post_json("echo", &json!({}))
        .await
        .unwrap();
    assert_eq!(body["ok"], true);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_server_errors_exhaust_retries() {
    let (hits, base_url) = start_status_mock(&[503]).await;
    let err = client(&base_url, 1)
        .post_json("echo", &json!({}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("OpenAI API error 503"), "{}", err);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_client_error_fails_without_retry() {
    let (hits, base_url) = start_status_mock(&[400, 200]).await;
    let err = client(&base_url, 3)
        .post_json("echo", &json!({}))
        .await
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("OpenAI API error 400"), "{}", message);
    assert!(message.contains("status 400"), "{}", message);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_zero_retries_means_one_attempt() {
    let (hits, base_url) = start_status_mock(&[429, 200]).await;
    let err = client(&base_url, 0)
        .post_json("echo", &json!({}))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("OpenAI API error 429"), "{}", err);
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
