//! OAuth initiation/callback flow against a mock provider, including CSRF
//! state rejection.

mod common;

use common::*;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_with_provider(token_url: &str) -> agentrelay::config::Config {
    let mut config = base_config();
    config.oauth.providers.insert(
        "github".to_string(),
        agentrelay::config::OauthProviderConfig {
            authorize_url: "https://github.example.com/login/oauth/authorize".to_string(),
            token_url: token_url.to_string(),
            client_id: "Iv1.test".to_string(),
            client_secret_env: None,
            scope: "read:user".to_string(),
        },
    );
    config
}

#[tokio::test]
async fn initiate_returns_authorization_url_with_state() {
    let app = test_app(
        config_with_provider("https://unused.example.com/token"),
        StubAgent::ok("gemini", "x"),
        None,
    );

    let response = send(
        &app.router,
        get_request(
            Some("user-token"),
            "/api/v1/oauth/github/initiate?mcp_name=gh-tools",
        ),
    )
    .await;
    assert_eq!(response.status(), 200);
    let body = body_json(response).await;

    let url = body["authorization_url"].as_str().unwrap();
    let state = body["state"].as_str().unwrap();
    assert!(url.starts_with("https://github.example.com/login/oauth/authorize?"));
    assert!(url.contains("client_id=Iv1.test"));
    assert!(url.contains(&format!("state={state}")));
    assert!(state.len() >= 43); // 32 random bytes, base64url
    assert_eq!(body["expires_in"], 600);
}

#[tokio::test]
async fn initiate_rejects_unknown_provider() {
    let app = test_app(
        config_with_provider("https://unused.example.com/token"),
        StubAgent::ok("gemini", "x"),
        None,
    );
    let response = send(
        &app.router,
        get_request(
            Some("user-token"),
            "/api/v1/oauth/bitbucket/initiate?mcp_name=x",
        ),
    )
    .await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn callback_with_unknown_state_is_403_and_touches_nothing() {
    let app = test_app(
        config_with_provider("https://unused.example.com/token"),
        StubAgent::ok("gemini", "x"),
        None,
    );

    let response = send(
        &app.router,
        get_request(None, "/api/v1/oauth/callback?state=forged&code=abc"),
    )
    .await;
    assert_eq!(response.status(), 403);

    // The token cache was never written.
    assert!(app
        .state
        .token_cache
        .get_token("u-1", "github")
        .await
        .is_err());
}

#[tokio::test]
async fn full_flow_exchanges_code_and_stores_token_once() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "gho_live_access_token_abcdef123456",
            "refresh_token": "ghr_live_refresh_token_abcdef123456",
            "expires_in": 3600,
            "token_type": "bearer",
            "scope": "read:user",
        })))
        .expect(1)
        .mount(&provider)
        .await;

    let app = test_app(
        config_with_provider(&format!("{}/token", provider.uri())),
        StubAgent::ok("gemini", "x"),
        None,
    );

    // ── Initiate ──
    let initiate = body_json(
        send(
            &app.router,
            get_request(
                Some("user-token"),
                "/api/v1/oauth/github/initiate?mcp_name=gh-tools",
            ),
        )
        .await,
    )
    .await;
    let state = initiate["state"].as_str().unwrap().to_string();

    // ── Callback ──
    let callback = send(
        &app.router,
        get_request(
            None,
            &format!("/api/v1/oauth/callback?state={state}&code=authcode-1"),
        ),
    )
    .await;
    assert_eq!(callback.status(), 200);
    let body = body_json(callback).await;
    assert_eq!(body["status"], "connected");
    assert_eq!(body["provider"], "github");
    assert_eq!(body["mcp_name"], "gh-tools");

    // The cached token round-trips decrypted.
    let token = app
        .state
        .token_cache
        .get_token("u-1", "github")
        .await
        .unwrap();
    assert_eq!(token.access_token, "gho_live_access_token_abcdef123456");
    assert_eq!(token.token_type, "bearer");

    // ── Reuse is rejected: states are single-use ──
    let replay = send(
        &app.router,
        get_request(
            None,
            &format!("/api/v1/oauth/callback?state={state}&code=authcode-1"),
        ),
    )
    .await;
    assert_eq!(replay.status(), 403);
}

#[tokio::test]
async fn token_status_and_revoke_round_trip() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "gho_tok",
            "expires_in": 3600,
        })))
        .mount(&provider)
        .await;

    let app = test_app(
        config_with_provider(&format!("{}/token", provider.uri())),
        StubAgent::ok("gemini", "x"),
        None,
    );

    let initiate = body_json(
        send(
            &app.router,
            get_request(
                Some("user-token"),
                "/api/v1/oauth/github/initiate?mcp_name=gh-tools",
            ),
        )
        .await,
    )
    .await;
    let state = initiate["state"].as_str().unwrap();
    send(
        &app.router,
        get_request(None, &format!("/api/v1/oauth/callback?state={state}&code=c")),
    )
    .await;

    let status = body_json(
        send(
            &app.router,
            get_request(Some("user-token"), "/api/v1/oauth/tokens"),
        )
        .await,
    )
    .await;
    assert_eq!(status["total"], 1);
    assert_eq!(status["providers"][0], "github");

    let revoke = send(
        &app.router,
        axum::http::Request::builder()
            .method("DELETE")
            .uri("/api/v1/oauth/github")
            .header("authorization", "Bearer user-token")
            .body(axum::body::Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(revoke.status(), 200);

    // Revoking again reports token_not_found.
    let again = send(
        &app.router,
        axum::http::Request::builder()
            .method("DELETE")
            .uri("/api/v1/oauth/github")
            .header("authorization", "Bearer user-token")
            .body(axum::body::Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(again.status(), 404);
}
