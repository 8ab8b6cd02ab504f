//! Router-level tests: the vendor, scoring and audio services are wiremock
//! servers, blobs live in memory and the token file in a temp dir.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use fitmusic_api::audio::AudioClient;
use fitmusic_api::feedback::{FeedbackLog, FEEDBACK_BLOB};
use fitmusic_api::oauth::{Credentials, Token, TokenFile};
use fitmusic_api::prompt::PromptClient;
use fitmusic_api::session::SessionStore;
use fitmusic_api::{build_router, AppState};
use fitmusic_storage::BlobStore;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::util::ServiceExt;
use wiremock::matchers::{body_json, body_string_contains, header as header_eq, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ACCESS_TOKEN: &str = "file-token";

struct Harness {
    server: MockServer,
    audio_store: BlobStore,
    feedback_store: BlobStore,
    token_file: TokenFile,
    dir: TempDir,
}

impl Harness {
    async fn new() -> Self {
        let server = MockServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        Self {
            audio_store: BlobStore::in_memory("https://acct.blob.core.windows.net/audio"),
            feedback_store: BlobStore::in_memory("https://acct.blob.core.windows.net/feedback"),
            token_file: TokenFile::new(dir.path().join("fitbit_token.json")),
            server,
            dir,
        }
    }

    async fn with_token(self) -> Self {
        let token: Token = serde_json::from_value(json!({
            "access_token": ACCESS_TOKEN,
            "refresh_token": "refresh",
        }))
        .unwrap();
        self.token_file.save(&token).await.unwrap();
        self
    }

    fn state(&self) -> AppState {
        let http = reqwest::Client::new();
        AppState {
            credentials: Credentials {
                client_id: "client-id".into(),
                client_secret: "client-secret".into(),
                redirect_uri: "http://localhost:5000/callback".into(),
            },
            fitbit_api_base: self.server.uri(),
            fitbit_token_url: format!("{}/oauth2/token", self.server.uri()),
            sessions: Arc::new(SessionStore::new("test-secret").unwrap()),
            token_file: self.token_file.clone(),
            prompts: PromptClient::new(http.clone(), format!("{}/score", self.server.uri())),
            audio: AudioClient::new(http.clone(), format!("{}/generate", self.server.uri())),
            audio_store: self.audio_store.clone(),
            feedback: FeedbackLog::new(self.feedback_store.clone()),
            http,
        }
    }

    fn app(&self) -> Router {
        build_router(self.state())
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn intraday_path(resource: &str) -> String {
    format!(r"^/1/user/-/activities/{}/date/\d{{4}}-\d{{2}}-\d{{2}}/1d/1min\.json$", resource)
}

fn intraday_body(resource: &str, points: &[(&str, Value)]) -> Value {
    let dataset: Vec<Value> = points
        .iter()
        .map(|(time, value)| json!({"time": time, "value": value}))
        .collect();
    json!({
        format!("activities-{}", resource): [{"dateTime": "today", "value": "0"}],
        format!("activities-{}-intraday", resource): {"dataset": dataset, "datasetInterval": 1},
    })
}

async fn mount_intraday(server: &MockServer, resource: &str, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path_regex(intraday_path(resource)))
        .respond_with(response)
        .mount(server)
        .await;
}

async fn mount_sleep(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path_regex(r"^/1\.2/user/-/sleep/date/.*\.json$"))
        .respond_with(response)
        .mount(server)
        .await;
}

// ── authorization ─────────────────────────────────────────────

#[tokio::test]
async fn authorize_redirects_to_fitbit() {
    let h = Harness::new().await;
    let response = h.app().oneshot(get("/authorize")).await.unwrap();

    assert_eq!(response.status(), StatusCode::FOUND);
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    assert!(location.starts_with("https://www.fitbit.com/oauth2/authorize?response_type=code"));
    assert!(location.contains("client_id=client-id"));
}

#[tokio::test]
async fn callback_without_code_is_bad_request() {
    let h = Harness::new().await;
    let response = h.app().oneshot(get("/callback")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn callback_exchanges_code_and_starts_session() {
    let h = Harness::new().await;
    let basic = base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        "client-id:client-secret",
    );

    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .and(header_eq("authorization", format!("Basic {}", basic).as_str()))
        .and(body_string_contains("grant_type=authorization_code"))
        .and(body_string_contains("code=abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "session-token",
            "refresh_token": "r",
            "expires_in": 28800,
            "token_type": "Bearer",
        })))
        .expect(1)
        .mount(&h.server)
        .await;

    Mock::given(method("GET"))
        .and(path_regex(intraday_path("steps")))
        .and(header_eq("authorization", "Bearer session-token"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(intraday_body("steps", &[("08:00:00", json!(15))])),
        )
        .mount(&h.server)
        .await;

    let app = h.app();
    let response = app.clone().oneshot(get("/callback?code=abc")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[header::LOCATION], "/");

    let set_cookie = response.headers()[header::SET_COOKIE].to_str().unwrap();
    let cookie = set_cookie.split(';').next().unwrap().to_string();

    let saved = h.token_file.load().await.unwrap().into_option().unwrap();
    assert_eq!(saved.access_token, "session-token");

    let request = Request::builder()
        .uri("/biometrics")
        .header(header::COOKIE, cookie)
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["steps"], 15);
}

#[tokio::test]
async fn failed_exchange_reports_authorization_error() {
    let h = Harness::new().await;
    Mock::given(method("POST"))
        .and(path("/oauth2/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid_grant"))
        .mount(&h.server)
        .await;

    let response = h.app().oneshot(get("/callback?code=stale")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json_body(response).await;
    assert!(body["message"].as_str().unwrap().starts_with("authorization error"));
    assert!(h.token_file.load().await.unwrap().into_option().is_none());
}

// ── biometrics ────────────────────────────────────────────────

#[tokio::test]
async fn biometrics_without_token_redirects() {
    let h = Harness::new().await;
    let response = h.app().oneshot(get("/biometrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(response.headers()[header::LOCATION], "/authorize");
}

#[tokio::test]
async fn biometrics_all_failures_still_succeed() {
    let h = Harness::new().await.with_token().await;
    for resource in ["steps", "calories", "heart", "minutesSedentary"] {
        mount_intraday(&h.server, resource, ResponseTemplate::new(500)).await;
    }
    mount_sleep(&h.server, ResponseTemplate::new(503)).await;

    let response = h.app().oneshot(get("/biometrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["time"], Value::Null);
    for key in ["steps", "calories", "bpm", "sedentary"] {
        assert_eq!(body[key], "-", "{} should be the sentinel", key);
    }
    assert!(body.get("asleep").is_none());
}

#[tokio::test]
async fn biometrics_degrade_per_resource() {
    let h = Harness::new().await.with_token().await;

    Mock::given(method("GET"))
        .and(path_regex(intraday_path("steps")))
        .and(header_eq("authorization", format!("Bearer {}", ACCESS_TOKEN).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(intraday_body(
            "steps",
            &[("10:00:00", json!(4)), ("10:01:00", json!(12))],
        )))
        .mount(&h.server)
        .await;
    mount_intraday(&h.server, "calories", ResponseTemplate::new(404)).await;
    mount_intraday(&h.server, "heart", ResponseTemplate::new(429)).await;
    mount_intraday(
        &h.server,
        "minutesSedentary",
        ResponseTemplate::new(200).set_body_json(intraday_body("minutesSedentary", &[])),
    )
    .await;
    mount_sleep(
        &h.server,
        ResponseTemplate::new(200).set_body_json(json!({
            "sleep": [{
                "minutesAsleep": 402,
                "efficiency": 91,
                "levels": {"summary": {
                    "rem": {"minutes": 85},
                    "deep": {"minutes": 66},
                    "wake": {"minutes": 38}
                }}
            }]
        })),
    )
    .await;

    let response = h.app().oneshot(get("/biometrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["steps"], 12);
    assert_eq!(body["time"], "10:01:00");
    assert_eq!(body["calories"], "-");
    assert_eq!(body["bpm"], "-");
    assert_eq!(body["sedentary"], "-");
    assert_eq!(body["asleep"], 402);
    assert_eq!(body["eff"], 91);
    assert_eq!(body["rem"], 85);
    assert_eq!(body["deep"], 66);
    assert_eq!(body["wake"], 38);
}

#[tokio::test]
async fn latest_time_comes_from_last_successful_resource() {
    let h = Harness::new().await.with_token().await;
    mount_intraday(
        &h.server,
        "steps",
        ResponseTemplate::new(200).set_body_json(intraday_body("steps", &[("11:30:00", json!(3))])),
    )
    .await;
    mount_intraday(
        &h.server,
        "heart",
        ResponseTemplate::new(200).set_body_json(intraday_body("heart", &[("11:28:00", json!(70))])),
    )
    .await;
    mount_intraday(&h.server, "calories", ResponseTemplate::new(500)).await;
    mount_intraday(&h.server, "minutesSedentary", ResponseTemplate::new(500)).await;
    mount_sleep(&h.server, ResponseTemplate::new(200).set_body_json(json!({"sleep": []}))).await;

    let body = json_body(h.app().oneshot(get("/biometrics")).await.unwrap()).await;
    assert_eq!(body["time"], "11:28:00");
    assert_eq!(body["bpm"], 70);
}

// ── history ───────────────────────────────────────────────────

#[tokio::test]
async fn heart_history_returns_trailing_sixty() {
    let h = Harness::new().await.with_token().await;
    let points: Vec<(String, Value)> = (0..90)
        .map(|i| (format!("10:{:02}:00", i % 60), json!(60 + i)))
        .collect();
    let borrowed: Vec<(&str, Value)> = points.iter().map(|(t, v)| (t.as_str(), v.clone())).collect();
    mount_intraday(
        &h.server,
        "heart",
        ResponseTemplate::new(200).set_body_json(intraday_body("heart", &borrowed)),
    )
    .await;

    let response = h.app().oneshot(get("/heart_history")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    let items = body.as_array().unwrap();
    assert_eq!(items.len(), 60);
    assert_eq!(items[0]["value"], 90);
    assert_eq!(items[59]["value"], 149);
}

#[tokio::test]
async fn short_history_is_returned_whole() {
    let h = Harness::new().await.with_token().await;
    mount_intraday(
        &h.server,
        "steps",
        ResponseTemplate::new(200).set_body_json(intraday_body(
            "steps",
            &[("00:00:00", json!(0)), ("00:01:00", json!(7))],
        )),
    )
    .await;

    let body = json_body(h.app().oneshot(get("/steps_history")).await.unwrap()).await;
    assert_eq!(body.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn history_points_are_passed_through_untouched() {
    let h = Harness::new().await.with_token().await;
    mount_intraday(
        &h.server,
        "calories",
        ResponseTemplate::new(200).set_body_json(json!({
            "activities-calories": [],
            "activities-calories-intraday": {"dataset": [
                {"level": 0, "mets": 10, "time": "00:00:00", "value": 1.2},
                {"value": 3},
                {"level": 1, "mets": 12, "time": "00:01:00", "value": 1.5},
            ]}
        })),
    )
    .await;

    let body = json_body(h.app().oneshot(get("/calories_history")).await.unwrap()).await;
    assert_eq!(
        body,
        json!([
            {"level": 0, "mets": 10, "time": "00:00:00", "value": 1.2},
            {"value": 3},
            {"level": 1, "mets": 12, "time": "00:01:00", "value": 1.5},
        ])
    );
}

#[tokio::test]
async fn history_failures_are_empty_arrays() {
    let h = Harness::new().await;
    let body = json_body(h.app().oneshot(get("/calories_history")).await.unwrap()).await;
    assert_eq!(body, json!([]));

    let h = h.with_token().await;
    mount_intraday(&h.server, "minutesSedentary", ResponseTemplate::new(500)).await;
    let body = json_body(h.app().oneshot(get("/sedentary_history")).await.unwrap()).await;
    assert_eq!(body, json!([]));
}

// ── generate_music ────────────────────────────────────────────

async fn mount_model(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/score"))
        .respond_with(response)
        .mount(server)
        .await;
}

async fn mount_audio(server: &MockServer, response: ResponseTemplate) {
    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(response)
        .mount(server)
        .await;
}

#[tokio::test]
async fn generate_music_runs_the_pipeline() {
    let h = Harness::new().await;
    Mock::given(method("POST"))
        .and(path("/score"))
        .and(body_json(json!({"biometric": "steps:120 bpm:71 time:10:01:00"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"generated_prompt": "upbeat synthwave"})),
        )
        .expect(1)
        .mount(&h.server)
        .await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .and(body_json(json!({"prompt": "upbeat synthwave", "duration": 30})))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"RIFF....WAVE".to_vec()))
        .expect(1)
        .mount(&h.server)
        .await;

    let request = post_json(
        "/generate_music",
        json!({"steps": 120, "bpm": 71, "time": "10:01:00"}),
    );
    let response = h.app().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["status"], "success");
    assert_eq!(body["prompt"], "upbeat synthwave");
    assert_eq!(body["input_text"], "steps:120 bpm:71 time:10:01:00");

    let filename = body["filename"].as_str().unwrap();
    assert!(filename.starts_with("music_") && filename.ends_with(".wav"));
    assert_eq!(
        body["url"],
        format!("https://acct.blob.core.windows.net/audio/{}", filename)
    );

    let stored = h.audio_store.get(filename).await.unwrap().unwrap();
    assert_eq!(&stored[..], b"RIFF....WAVE");
}

#[tokio::test]
async fn model_failure_is_reported_as_model_stage() {
    let h = Harness::new().await;
    mount_model(&h.server, ResponseTemplate::new(500)).await;

    let response = h
        .app()
        .oneshot(post_json("/generate_music", json!({"steps": 1})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    let body = json_body(response).await;
    assert_eq!(body["status"], "error");
    assert!(body["message"].as_str().unwrap().starts_with("model error"));
}

#[tokio::test]
async fn empty_prompt_is_a_model_failure() {
    let h = Harness::new().await;
    mount_model(
        &h.server,
        ResponseTemplate::new(200).set_body_json(json!({"generated_prompt": ""})),
    )
    .await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&h.server)
        .await;

    let body = json_body(
        h.app()
            .oneshot(post_json("/generate_music", json!({})))
            .await
            .unwrap(),
    )
    .await;
    assert!(body["message"].as_str().unwrap().starts_with("model error"));
}

#[tokio::test]
async fn audio_failure_is_reported_as_audio_stage() {
    let h = Harness::new().await;
    mount_model(
        &h.server,
        ResponseTemplate::new(200).set_body_json(json!({"generated_prompt": "ambient"})),
    )
    .await;
    mount_audio(&h.server, ResponseTemplate::new(502)).await;

    let body = json_body(
        h.app()
            .oneshot(post_json("/generate_music", json!({"bpm": 64})))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["status"], "error");
    assert!(body["message"]
        .as_str()
        .unwrap()
        .starts_with("audio generation error"));
}

#[tokio::test]
async fn upload_failure_is_reported_as_upload_stage() {
    let mut h = Harness::new().await;
    let root = h.dir.path().join("blobs");
    h.audio_store =
        BlobStore::from_connection_string(&format!("file://{}", root.display()), "audio").unwrap();
    // replace the container directory with a plain file so writes fail
    std::fs::remove_dir_all(root.join("audio")).unwrap();
    std::fs::write(root.join("audio"), b"not a directory").unwrap();

    mount_model(
        &h.server,
        ResponseTemplate::new(200).set_body_json(json!({"generated_prompt": "ambient"})),
    )
    .await;
    mount_audio(
        &h.server,
        ResponseTemplate::new(200).set_body_bytes(b"wav".to_vec()),
    )
    .await;

    let body = json_body(
        h.app()
            .oneshot(post_json("/generate_music", json!({"bpm": 64})))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body["status"], "error");
    assert!(body["message"].as_str().unwrap().starts_with("upload error"));
}

// ── feedback ──────────────────────────────────────────────────

#[tokio::test]
async fn feedback_missing_field_writes_nothing() {
    let h = Harness::new().await;
    let response = h
        .app()
        .oneshot(post_json(
            "/submit_feedback",
            json!({"input_text": "steps:1", "score": 4}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body, json!({"status": "error", "message": "missing fields"}));
    assert!(h.feedback_store.get(FEEDBACK_BLOB).await.unwrap().is_none());
}

#[tokio::test]
async fn feedback_empty_score_writes_nothing() {
    let h = Harness::new().await;
    let response = h
        .app()
        .oneshot(post_json(
            "/submit_feedback",
            json!({"input_text": "steps:1", "music_prompt": "jazz", "score": ""}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(h.feedback_store.get(FEEDBACK_BLOB).await.unwrap().is_none());
}

#[tokio::test]
async fn feedback_rows_accumulate() {
    let h = Harness::new().await;
    let app = h.app();

    for score in [5, 2] {
        let response = app
            .clone()
            .oneshot(post_json(
                "/submit_feedback",
                json!({"input_text": "bpm:\"70\"", "music_prompt": "slow piano", "score": score}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["status"], "success");
    }

    let raw = h.feedback_store.get(FEEDBACK_BLOB).await.unwrap().unwrap();
    assert_eq!(
        String::from_utf8(raw.to_vec()).unwrap(),
        "input_text,music_prompt,score\n\
         \"bpm:\"\"70\"\"\",\"slow piano\",5\n\
         \"bpm:\"\"70\"\"\",\"slow piano\",2\n"
    );
}

// ── static ────────────────────────────────────────────────────

#[tokio::test]
async fn index_and_health_are_served() {
    let h = Harness::new().await;
    let app = h.app();

    let response = app.clone().oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&bytes).contains("fitmusic"));

    let response = app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
