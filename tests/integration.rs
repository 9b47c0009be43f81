use exam_engine::config::Settings;
use exam_engine::models::Test;
use exam_engine::{build_state, routes::build_router};
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{json, Value};
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

fn sample_test(id: &str, published: bool) -> Test {
    serde_json::from_value(json!({
        "id": id,
        "title": "Geography",
        "description": "Capitals and rivers",
        "passingScore": 50.0,
        "isPublished": published,
        "questions": [
            {
                "id": "q2",
                "orderIndex": 2,
                "text": "Pick the rivers",
                "options": [
                    {"id": "o1", "orderIndex": 0, "text": "Nile", "isCorrect": true},
                    {"id": "o2", "orderIndex": 1, "text": "Alps"},
                    {"id": "o3", "orderIndex": 2, "text": "Volga", "isCorrect": true}
                ]
            },
            {
                "id": "q1",
                "orderIndex": 1,
                "text": "Capital of France",
                "options": [
                    {"id": "o1", "orderIndex": 0, "text": "Paris", "isCorrect": true},
                    {"id": "o2", "orderIndex": 1, "text": "Berlin"}
                ]
            }
        ]
    }))
    .unwrap()
}

async fn spawn_server() -> (String, reqwest::Client) {
    let settings = Settings {
        host: "127.0.0.1".into(),
        port: 0,
        ..Settings::default()
    };
    let state = build_state(settings).await.expect("state");
    state.db.upsert_test(sample_test("geo", true)).await.unwrap();
    state.db.upsert_test(sample_test("draft", false)).await.unwrap();
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("127.0.0.1:{}", addr.port()), reqwest::Client::new())
}

fn user_headers(user_id: &str) -> HeaderMap {
    let mut h = HeaderMap::new();
    h.insert("x-user-id", HeaderValue::from_str(user_id).unwrap());
    h
}

async fn create(client: &reqwest::Client, base: &str, test_id: &str, user: &str) -> reqwest::Response {
    client
        .post(format!("http://{}/api/v1/sessions", base))
        .headers(user_headers(user))
        .json(&json!({"testId": test_id, "mode": "exam"}))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn lists_only_published_tests() {
    let (base, client) = spawn_server().await;
    let resp = client
        .get(format!("http://{}/api/v1/tests", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let items = resp.json::<Value>().await.unwrap();
    let items = items.as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["id"], "geo");
    assert_eq!(items[0]["questionCount"], 2);
}

#[tokio::test]
async fn create_session_rejects_bad_requests() {
    let (base, client) = spawn_server().await;

    let unpublished = create(&client, &base, "draft", "alice").await;
    assert_eq!(unpublished.status(), 404);
    let body = unpublished.json::<Value>().await.unwrap();
    assert_eq!(body["error"]["code"], "NOT_FOUND");
    assert!(body["error"]["request_id"].is_string());

    let anonymous = client
        .post(format!("http://{}/api/v1/sessions", base))
        .json(&json!({"testId": "geo", "mode": "exam"}))
        .send()
        .await
        .unwrap();
    assert_eq!(anonymous.status(), 401);

    let empty_id = create(&client, &base, "", "alice").await;
    assert_eq!(empty_id.status(), 400);
    let body = empty_id.json::<Value>().await.unwrap();
    assert_eq!(body["error"]["details"][0]["field"], "test_id");
}

#[tokio::test]
async fn sessions_are_scoped_to_their_user() {
    let (base, client) = spawn_server().await;
    let created = create(&client, &base, "geo", "alice").await;
    assert_eq!(created.status(), 201);
    let handle = created.json::<Value>().await.unwrap()["handleId"]
        .as_str()
        .unwrap()
        .to_string();

    let foreign = client
        .get(format!("http://{}/api/v1/sessions/{}", base, handle))
        .headers(user_headers("mallory"))
        .send()
        .await
        .unwrap();
    assert_eq!(foreign.status(), 404);

    let deleted = client
        .delete(format!("http://{}/api/v1/sessions/{}", base, handle))
        .headers(user_headers("alice"))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 204);

    let gone = client
        .get(format!("http://{}/api/v1/sessions/{}", base, handle))
        .headers(user_headers("alice"))
        .send()
        .await
        .unwrap();
    assert_eq!(gone.status(), 404);
}

#[tokio::test]
async fn answer_navigate_submit_over_http_and_ws() {
    let (base, client) = spawn_server().await;
    let created = create(&client, &base, "geo", "alice").await;
    assert_eq!(created.status(), 201);
    let body = created.json::<Value>().await.unwrap();
    let handle = body["handleId"].as_str().unwrap().to_string();
    assert_eq!(body["snapshot"]["phase"], "active");
    assert_eq!(body["snapshot"]["currentQuestion"]["id"], "q1");
    assert!(body["snapshot"]["currentQuestion"]["options"][0]
        .get("isCorrect")
        .is_none());

    let ws_url = format!("ws://{}/ws/sessions/{}", base, handle);
    let (mut ws, _) = tokio_tungstenite::connect_async(ws_url).await.unwrap();
    let hello = next_event(&mut ws).await;
    assert_eq!(hello["event"], "snapshot");

    let session_url = format!("http://{}/api/v1/sessions/{}", base, handle);
    let answered = client
        .post(format!("{}/answer", session_url))
        .headers(user_headers("alice"))
        .json(&json!({"optionId": "o1"}))
        .send()
        .await
        .unwrap();
    assert_eq!(answered.status(), 200);
    assert_eq!(answered.json::<Value>().await.unwrap()["selectedAnswer"], json!(["o1"]));
    assert_eq!(next_event(&mut ws).await["event"], "state_changed");

    let moved = client
        .post(format!("{}/navigate", session_url))
        .headers(user_headers("alice"))
        .json(&json!({"action": "next"}))
        .send()
        .await
        .unwrap();
    let moved = moved.json::<Value>().await.unwrap();
    assert_eq!(moved["currentIndex"], 1);
    assert_eq!(moved["currentQuestion"]["allowsMultiple"], true);

    let bad_goto = client
        .post(format!("{}/navigate", session_url))
        .headers(user_headers("alice"))
        .json(&json!({"action": "goto"}))
        .send()
        .await
        .unwrap();
    assert_eq!(bad_goto.status(), 400);

    let marked = client
        .post(format!("{}/mark", session_url))
        .headers(user_headers("alice"))
        .send()
        .await
        .unwrap();
    assert_eq!(marked.json::<Value>().await.unwrap()["isMarkedForReview"], true);

    let submitted = client
        .post(format!("{}/submit", session_url))
        .headers(user_headers("alice"))
        .send()
        .await
        .unwrap();
    assert_eq!(submitted.status(), 200);
    let snap = submitted.json::<Value>().await.unwrap();
    assert_eq!(snap["phase"], "completed");
    assert_eq!(snap["results"]["correctAnswers"], 1);
    assert_eq!(snap["results"]["scorePercentage"], 50.0);
    assert_eq!(snap["results"]["passed"], true);

    let mut saw_completed = false;
    for _ in 0..6 {
        let env = next_event(&mut ws).await;
        if env["event"] == "completed" {
            assert_eq!(env["payload"]["session"]["passed"], true);
            saw_completed = true;
            break;
        }
    }
    assert!(saw_completed);
}

async fn next_event<S>(ws: &mut S) -> Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("ws event in time")
            .expect("ws open")
            .expect("ws frame");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}
