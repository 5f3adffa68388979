//! Character-sheet HTTP API against a temporary vault.

use serde_json::{json, Value};
use tempfile::TempDir;

use vaultforge::config::Config;
use vaultforge::server::build_router;

async fn start_server(config: &Config) -> String {
    let app = build_router(config).unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}", addr)
}

fn test_config(tmp: &TempDir) -> Config {
    let root = tmp.path();
    std::fs::create_dir_all(root.join("vault/Players")).unwrap();
    std::fs::write(
        root.join("vault/Players/Aria.md"),
        "---\nclass: Rogue\nabilities:\n  dexterity: 16\nskills:\n  stealth: expertise\n---\n# Aria\n\nBackstory.\n",
    )
    .unwrap();
    std::fs::create_dir_all(root.join("web")).unwrap();
    std::fs::write(root.join("web/index.html"), "<h1>sheets</h1>").unwrap();

    let mut config = Config::default();
    config.vault.root = root.join("vault");
    config.server.frontend_dir = Some(root.join("web"));
    config
}

#[tokio::test]
async fn test_health_and_list() {
    let tmp = TempDir::new().unwrap();
    let base = start_server(&test_config(&tmp)).await;
    let client = reqwest::Client::new();

    let resp = client.get(format!("{}/health", base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");

    let resp = client.get(format!("{}/api/players", base)).send().await.unwrap();
    let names: Vec<String> = resp.json().await.unwrap();
    assert_eq!(names, vec!["Aria"]);
}

#[tokio::test]
async fn test_get_update_and_skills() {
    let tmp = TempDir::new().unwrap();
    let base = start_server(&test_config(&tmp)).await;
    let client = reqwest::Client::new();

    let sheet: Value = client
        .get(format!("{}/api/player/Aria", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sheet["class"], "Rogue");

    let resp = client
        .put(format!("{}/api/player/Aria", base))
        .json(&json!({"hp": 18, "class": "Bard"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let updated: Value = resp.json().await.unwrap();
    assert_eq!(updated["hp"], 18);
    assert_eq!(updated["abilities"]["dexterity"], 16);

    let note = std::fs::read_to_string(tmp.path().join("vault/Players/Aria.md")).unwrap();
    assert!(note.contains("class: Bard"));
    assert!(note.ends_with("# Aria\n\nBackstory.\n"));

    let skills: Vec<Value> = client
        .get(format!("{}/api/player/Aria/skills", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let stealth = skills.iter().find(|s| s["skill"] == "stealth").unwrap();
    assert_eq!(stealth["modifier"], 7);
    assert_eq!(stealth["proficiency"], "expertise");
}

#[tokio::test]
async fn test_create_conflict_and_errors() {
    let tmp = TempDir::new().unwrap();
    let base = start_server(&test_config(&tmp)).await;
    let client = reqwest::Client::new();
    let url = format!("{}/api/player/Bram", base);

    let resp = client.post(&url).json(&json!({"class": "Fighter"})).send().await.unwrap();
    assert_eq!(resp.status(), 201);
    assert!(tmp.path().join("vault/Players/Bram.md").is_file());

    let resp = client.post(&url).json(&json!({})).send().await.unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "conflict");

    let resp = client.put(&url).json(&json!([1, 2])).send().await.unwrap();
    assert_eq!(resp.status(), 400);

    let resp = client
        .get(format!("{}/api/player/Nobody", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "not_found");

    let resp = client
        .get(format!("{}/api/player/..hidden", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_frontend_fallback() {
    let tmp = TempDir::new().unwrap();
    let base = start_server(&test_config(&tmp)).await;

    let resp = reqwest::get(format!("{}/index.html", base)).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "<h1>sheets</h1>");
}

#[tokio::test]
async fn test_update_with_malformed_frontmatter_leaves_note_alone() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    let path = tmp.path().join("vault/Players/Cass.md");
    let original = "---\nclass: [Wizard\nhp: 9\n---\n# Cass\n";
    std::fs::write(&path, original).unwrap();
    let base = start_server(&config).await;

    let resp = reqwest::Client::new()
        .put(format!("{}/api/player/Cass", base))
        .json(&json!({"hp": 10}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 500);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "internal");
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("Malformed frontmatter"));

    assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
}
