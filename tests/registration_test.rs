//! Registration and cloud-session integration tests
//!
//! Drives the controller against a scripted transport and an in-memory
//! config store: URL building, token refresh outcomes, the full
//! claim/finalize/token registration sequence, and command updates.

mod common;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde_json::{json, Value};

use common::*;
use weft::cloud::controller::{DeviceController, SetupState};
use weft::cloud::encoding::form_field;
use weft::cloud::GcdState;
use weft::commands::catalog::CommandCatalog;
use weft::error::domain;
use weft::providers::MemoryConfigStore;
use weft::settings::Config;
use weft::state::StateChangeQueue;

fn registered_document() -> String {
    json!({
        "refresh_token": REFRESH_TOKEN,
        "cloud_id": DEVICE_ID,
        "robot_account": ROBOT_ACCOUNT_EMAIL,
    })
    .to_string()
}

fn build_agent(
    transport: Arc<MockTransport>,
    document: Option<String>,
) -> (Arc<Config>, Arc<DeviceController>) {
    let store = Arc::new(MemoryConfigStore::with_defaults(default_settings()));
    *store.document.lock() = document;
    let config = Arc::new(Config::new(store));
    config.load().unwrap();

    let catalog = Arc::new(CommandCatalog::new());
    let state_queue = Arc::new(StateChangeQueue::new());
    let controller = DeviceController::new(config.clone(), transport, catalog, state_queue);
    (config, controller)
}

fn load_test_catalog(catalog: &CommandCatalog) {
    catalog
        .load_base(&json!({
            "base": {
                "reboot": {
                    "parameters": {"delay": "integer"},
                    "minimalRole": "user",
                    "results": {}
                },
                "shutdown": {
                    "parameters": {},
                    "minimalRole": "user",
                    "results": {}
                }
            }
        }))
        .unwrap();
    catalog
        .load_vendor(&json!({
            "base": {
                "reboot": {
                    "parameters": {"delay": {"minimum": 10}},
                    "minimalRole": "user",
                    "results": {}
                }
            },
            "robot": {
                "_jump": {
                    "parameters": {"_height": "integer"},
                    "progress": {"progress": "integer"},
                    "results": {"status": "string"},
                    "minimalRole": "user"
                }
            }
        }))
        .unwrap();
}

#[tokio::test]
async fn test_get_service_url() {
    let transport = MockTransport::new();
    let (_config, controller) = build_agent(transport, None);
    let client = controller.client();

    assert_eq!(client.service_url("", &[]), SERVICE_URL);
    assert_eq!(
        client.service_url("registrationTickets", &[]),
        format!("{SERVICE_URL}registrationTickets")
    );
    assert_eq!(
        client.service_url("registrationTickets", &[("key", API_KEY)]),
        format!("{SERVICE_URL}registrationTickets?key={API_KEY}")
    );
    assert_eq!(
        client.service_url("registrationTickets", &[("key", API_KEY), ("restart", "true")]),
        format!("{SERVICE_URL}registrationTickets?key={API_KEY}&restart=true")
    );
}

#[tokio::test]
async fn test_get_oauth_url_encodes_reserved_characters() {
    let transport = MockTransport::new();
    let (_config, controller) = build_agent(transport, None);

    let url = controller.client().oauth_url(
        "auth",
        &[
            ("scope", "https://www.googleapis.com/auth/clouddevices"),
            ("redirect_uri", "urn:ietf:wg:oauth:2.0:oob"),
            ("response_type", "code"),
            ("client_id", CLIENT_ID),
        ],
    );
    let expected = format!(
        "{OAUTH_URL}auth?scope=https%3A%2F%2Fwww.googleapis.com%2Fauth%2Fclouddevices&\
         redirect_uri=urn%3Aietf%3Awg%3Aoauth%3A2.0%3Aoob&response_type=code&client_id={CLIENT_ID}"
    );
    assert_eq!(url, expected);
}

#[tokio::test]
async fn test_oauth_refresh_success() {
    let transport = MockTransport::new();
    let token_url = format!("{OAUTH_URL}token");
    transport.expect_json(
        "POST",
        &token_url,
        200,
        json!({ "access_token": ACCESS_TOKEN, "expires_in": 3600 }),
    );
    let (_config, controller) = build_agent(transport.clone(), Some(registered_document()));

    let token = controller.tokens().access_token().await.unwrap();
    assert_eq!(token, ACCESS_TOKEN);

    // Wall-clock expiry is about an hour out.
    let expires_at = controller.tokens().expires_at().await.unwrap();
    let remaining = expires_at.duration_since(SystemTime::now()).unwrap();
    assert!(remaining > Duration::from_secs(3500));
    assert!(remaining <= Duration::from_secs(3600));

    // The refresh request carried the exact form fields.
    let requests = transport.requests_to(&token_url);
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].header_value("content-type"),
        Some("application/x-www-form-urlencoded")
    );
    let body = String::from_utf8(requests[0].body.clone().unwrap()).unwrap();
    assert_eq!(form_field(&body, "grant_type").as_deref(), Some("refresh_token"));
    assert_eq!(form_field(&body, "refresh_token").as_deref(), Some(REFRESH_TOKEN));
    assert_eq!(form_field(&body, "client_id").as_deref(), Some(CLIENT_ID));
    assert_eq!(form_field(&body, "client_secret").as_deref(), Some(CLIENT_SECRET));

    // With a token in hand the controller goes connected.
    transport.expect_json(
        "POST",
        &token_url,
        200,
        json!({ "access_token": ACCESS_TOKEN, "expires_in": 3600 }),
    );
    controller.connect();
    wait_for("connected state", || controller.gcd_state() == GcdState::Connected).await;
}

#[tokio::test]
async fn test_concurrent_token_requests_coalesce() {
    let transport = MockTransport::new();
    let token_url = format!("{OAUTH_URL}token");
    // Exactly one scripted response: a second refresh would fail.
    transport.expect_json(
        "POST",
        &token_url,
        200,
        json!({ "access_token": ACCESS_TOKEN, "expires_in": 3600 }),
    );
    let (_config, controller) = build_agent(transport.clone(), Some(registered_document()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let tokens = controller.tokens().clone();
        handles.push(tokio::spawn(async move { tokens.access_token().await }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), ACCESS_TOKEN);
    }
    assert_eq!(transport.requests_to(&token_url).len(), 1);
}

#[tokio::test]
async fn test_oauth_invalid_grant_means_invalid_credentials() {
    let transport = MockTransport::new();
    let token_url = format!("{OAUTH_URL}token");
    transport.expect_json("POST", &token_url, 400, json!({ "error": "invalid_grant" }));
    transport.expect_json("POST", &token_url, 400, json!({ "error": "invalid_grant" }));
    let (_config, controller) = build_agent(transport.clone(), Some(registered_document()));

    let err = controller.tokens().access_token().await.unwrap_err();
    assert!(err.has_error(domain::OAUTH2, "invalid_grant"));
    // No token was cached on the failure path.
    assert!(controller.tokens().expires_at().await.is_none());

    controller.connect();
    wait_for("invalid_credentials state", || {
        controller.gcd_state() == GcdState::InvalidCredentials
    })
    .await;
}

#[tokio::test]
async fn test_unknown_oauth_error_stays_connecting() {
    let transport = MockTransport::new();
    let token_url = format!("{OAUTH_URL}token");
    transport.expect_json(
        "POST",
        &token_url,
        400,
        json!({ "error": "unable_to_authenticate" }),
    );
    let (_config, controller) = build_agent(transport.clone(), Some(registered_document()));

    let err = controller.tokens().access_token().await.unwrap_err();
    assert!(err.has_error(domain::OAUTH2, "unable_to_authenticate"));

    controller.connect();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(controller.gcd_state(), GcdState::Connecting);
}

#[tokio::test]
async fn test_register_device_happy_path() {
    let transport = MockTransport::new();
    let (config, controller) = build_agent(transport.clone(), None);
    load_test_catalog(controller.catalog());
    controller.start();
    assert_eq!(controller.gcd_state(), GcdState::Unconfigured);

    let ticket_url =
        format!("{SERVICE_URL}registrationTickets/{CLAIM_TICKET_ID}?key={API_KEY}");
    let finalize_url =
        format!("{SERVICE_URL}registrationTickets/{CLAIM_TICKET_ID}/finalize?key={API_KEY}");
    let token_url = format!("{OAUTH_URL}token");

    transport.expect_json(
        "PATCH",
        &ticket_url,
        200,
        json!({
            "id": CLAIM_TICKET_ID,
            "kind": "clouddevices#registrationTicket",
            "oauthClientId": CLIENT_ID,
            "deviceDraft": { "id": DEVICE_ID, "kind": "clouddevices#device" },
        }),
    );
    transport.expect_json(
        "POST",
        &finalize_url,
        200,
        json!({
            "id": CLAIM_TICKET_ID,
            "robotAccountEmail": ROBOT_ACCOUNT_EMAIL,
            "robotAccountAuthorizationCode": ROBOT_ACCOUNT_AUTH_CODE,
        }),
    );
    transport.expect_json(
        "POST",
        &token_url,
        200,
        json!({
            "access_token": ACCESS_TOKEN,
            "token_type": "Bearer",
            "refresh_token": REFRESH_TOKEN,
            "expires_in": 3600,
        }),
    );

    controller.register_device(CLAIM_TICKET_ID).await.unwrap();

    // The device draft carried identity, channel, and the merged defs.
    let claims = transport.requests_to(&ticket_url);
    assert_eq!(claims.len(), 1);
    let body: Value = serde_json::from_slice(claims[0].body.as_ref().unwrap()).unwrap();
    assert_eq!(body["id"], CLAIM_TICKET_ID);
    assert_eq!(body["oauthClientId"], CLIENT_ID);
    assert_eq!(body["deviceDraft"]["channel"]["supportedType"], "pull");
    assert_eq!(body["deviceDraft"]["name"], "Coffee Pot");
    assert_eq!(body["deviceDraft"]["description"], "Easy to clean");
    assert_eq!(body["deviceDraft"]["location"], "Kitchen");
    assert_eq!(body["deviceDraft"]["modelManifestId"], "AAAAA");
    assert_eq!(
        body["deviceDraft"]["commandDefs"],
        json!({
            "base": {
                "reboot": {
                    "parameters": { "delay": { "minimum": 10, "type": "integer" } },
                    "minimalRole": "user"
                }
            },
            "robot": {
                "_jump": {
                    "parameters": { "_height": { "type": "integer" } },
                    "progress": { "progress": { "type": "integer" } },
                    "results": { "status": { "type": "string" } },
                    "minimalRole": "user"
                }
            }
        })
    );

    // The auth-code exchange used the robot account grant.
    let token_requests = transport.requests_to(&token_url);
    assert_eq!(token_requests.len(), 1);
    let form = String::from_utf8(token_requests[0].body.clone().unwrap()).unwrap();
    assert_eq!(form_field(&form, "grant_type").as_deref(), Some("authorization_code"));
    assert_eq!(form_field(&form, "code").as_deref(), Some(ROBOT_ACCOUNT_AUTH_CODE));
    assert_eq!(form_field(&form, "client_id").as_deref(), Some(CLIENT_ID));
    assert_eq!(form_field(&form, "client_secret").as_deref(), Some(CLIENT_SECRET));
    assert_eq!(form_field(&form, "redirect_uri").as_deref(), Some("oob"));
    assert_eq!(
        form_field(&form, "scope").as_deref(),
        Some("https://www.googleapis.com/auth/clouddevices")
    );

    // Exactly the registration triple was persisted, in one transaction.
    let settings = config.settings();
    assert_eq!(settings.cloud_id, DEVICE_ID);
    assert_eq!(settings.refresh_token, REFRESH_TOKEN);
    assert_eq!(settings.robot_account, ROBOT_ACCOUNT_EMAIL);

    assert_eq!(controller.gcd_state(), GcdState::Connecting);
    assert_eq!(controller.registration_setup_state(), SetupState::Success);
}

#[tokio::test]
async fn test_register_device_failure_persists_nothing() {
    let transport = MockTransport::new();
    let (config, controller) = build_agent(transport.clone(), None);

    let ticket_url =
        format!("{SERVICE_URL}registrationTickets/{CLAIM_TICKET_ID}?key={API_KEY}");
    transport.expect_json(
        "PATCH",
        &ticket_url,
        404,
        json!({ "error": { "code": 404, "message": "ticket not found" } }),
    );

    let err = controller.register_device(CLAIM_TICKET_ID).await.unwrap_err();
    assert_eq!(err.domain(), domain::GCD);
    assert!(err.has_error(domain::GCD_SERVER, "404"));

    let settings = config.settings();
    assert!(settings.cloud_id.is_empty());
    assert!(settings.refresh_token.is_empty());
    assert!(settings.robot_account.is_empty());
    assert_eq!(controller.gcd_state(), GcdState::Unconfigured);
    assert!(matches!(
        controller.registration_setup_state(),
        SetupState::Error(_)
    ));
}

#[tokio::test]
async fn test_command_updates_reach_cloud() {
    let transport = MockTransport::new();
    let token_url = format!("{OAUTH_URL}token");
    let command_url = format!("{SERVICE_URL}commands/1234");
    transport.expect_json(
        "POST",
        &token_url,
        200,
        json!({ "access_token": ACCESS_TOKEN, "expires_in": 3600 }),
    );
    for _ in 0..3 {
        transport.expect_json("PATCH", &command_url, 200, json!({}));
    }

    let (_config, controller) = build_agent(transport.clone(), Some(registered_document()));
    load_test_catalog(controller.catalog());
    controller
        .dispatcher()
        .add_handler("robot._jump", Arc::new(|_instance| {}));

    controller.publish_commands(&[json!({
        "name": "robot._jump",
        "id": "1234",
        "parameters": { "_height": 100 },
    })]);

    // Acceptance is acknowledged with an immediate inProgress patch.
    wait_for("inProgress ack", || {
        transport
            .requests_to(&command_url)
            .iter()
            .any(|r| r.body.as_deref() == Some(br#"{"state":"inProgress"}"#.as_ref()))
    })
    .await;
    let ack = &transport.requests_to(&command_url)[0];
    assert_eq!(
        ack.header_value("authorization"),
        Some(format!("Bearer {ACCESS_TOKEN}").as_str())
    );
    assert_eq!(
        ack.header_value("content-type"),
        Some("application/json; charset=utf-8")
    );

    let instance = controller.dispatcher().find("1234").unwrap();
    instance.set_progress(json!({ "progress": 18 })).unwrap();
    wait_for("progress patch", || {
        transport.requests_to(&command_url).iter().any(|r| {
            r.body
                .as_deref()
                .map(|b| serde_json::from_slice::<Value>(b).unwrap())
                == Some(json!({ "state": "inProgress", "progress": { "progress": 18 } }))
        })
    })
    .await;

    instance.complete(json!({ "status": "Ok" })).unwrap();
    wait_for("done patch", || {
        transport.requests_to(&command_url).iter().any(|r| {
            r.body
                .as_deref()
                .map(|b| serde_json::from_slice::<Value>(b).unwrap())
                == Some(json!({ "state": "done", "results": { "status": "Ok" } }))
        })
    })
    .await;
}

#[tokio::test]
async fn test_invalid_cloud_command_is_rejected() {
    let transport = MockTransport::new();
    let token_url = format!("{OAUTH_URL}token");
    let command_url = format!("{SERVICE_URL}commands/999");
    transport.expect_json(
        "POST",
        &token_url,
        200,
        json!({ "access_token": ACCESS_TOKEN, "expires_in": 3600 }),
    );
    transport.expect_json("PATCH", &command_url, 200, json!({}));

    let (_config, controller) = build_agent(transport.clone(), Some(registered_document()));
    load_test_catalog(controller.catalog());

    controller.publish_commands(&[json!({
        "name": "robot._fly",
        "id": "999",
        "parameters": {},
    })]);

    wait_for("rejection patch", || {
        transport.requests_to(&command_url).iter().any(|r| {
            let body: Value = serde_json::from_slice(r.body.as_deref().unwrap()).unwrap();
            body["state"] == "error" && body["error"]["code"] == "unknown_command"
        })
    })
    .await;
    // The command was never materialized locally.
    assert!(controller.dispatcher().find("999").is_none());
}

#[tokio::test]
async fn test_get_device_info() {
    let transport = MockTransport::new();
    let token_url = format!("{OAUTH_URL}token");
    let device_url = format!("{SERVICE_URL}devices/{DEVICE_ID}");
    transport.expect_json(
        "POST",
        &token_url,
        200,
        json!({ "access_token": ACCESS_TOKEN, "expires_in": 3600 }),
    );
    transport.expect_json(
        "GET",
        &device_url,
        200,
        json!({ "id": DEVICE_ID, "kind": "clouddevices#device" }),
    );
    let (_config, controller) = build_agent(transport.clone(), Some(registered_document()));

    let info = controller.get_device_info().await.unwrap();
    assert_eq!(info["id"], DEVICE_ID);

    let requests = transport.requests_to(&device_url);
    assert_eq!(
        requests[0].header_value("authorization"),
        Some(format!("Bearer {ACCESS_TOKEN}").as_str())
    );
}

#[tokio::test]
async fn test_oob_registration_status() {
    // Freshly initialized with no stored settings.
    let transport = MockTransport::new();
    let (_config, controller) = build_agent(transport, None);
    controller.start();
    assert_eq!(controller.gcd_state(), GcdState::Unconfigured);

    // With persisted credentials the device starts connecting.
    let transport = MockTransport::new();
    let (_config, controller) = build_agent(transport, Some(registered_document()));
    controller.start();
    assert_eq!(controller.gcd_state(), GcdState::Connecting);
}

#[tokio::test]
async fn test_reset_erases_credentials() {
    let transport = MockTransport::new();
    let (config, controller) = build_agent(transport, Some(registered_document()));
    controller.start();
    assert_eq!(controller.gcd_state(), GcdState::Connecting);

    controller.reset().await.unwrap();
    assert_eq!(controller.gcd_state(), GcdState::Unconfigured);
    let settings = config.settings();
    assert!(settings.refresh_token.is_empty());
    assert!(settings.cloud_id.is_empty());
    assert!(settings.robot_account.is_empty());
}

#[tokio::test]
async fn test_network_loss_goes_offline_and_recovers() {
    let transport = MockTransport::new();
    let token_url = format!("{OAUTH_URL}token");
    transport.expect_json(
        "POST",
        &token_url,
        200,
        json!({ "access_token": ACCESS_TOKEN, "expires_in": 3600 }),
    );
    let (_config, controller) = build_agent(transport.clone(), Some(registered_document()));

    controller.start();
    wait_for("connected", || controller.gcd_state() == GcdState::Connected).await;

    controller.set_network_available(false);
    assert_eq!(controller.gcd_state(), GcdState::Offline);

    controller.set_network_available(true);
    wait_for("reconnected", || controller.gcd_state() == GcdState::Connected).await;
}

#[tokio::test]
async fn test_no_transition_out_of_invalid_credentials_without_reset() {
    let transport = MockTransport::new();
    let token_url = format!("{OAUTH_URL}token");
    transport.expect_json("POST", &token_url, 400, json!({ "error": "invalid_grant" }));
    let (_config, controller) = build_agent(transport.clone(), Some(registered_document()));

    controller.connect();
    wait_for("invalid_credentials", || {
        controller.gcd_state() == GcdState::InvalidCredentials
    })
    .await;

    // Network events must not revive the session.
    controller.set_network_available(false);
    assert_eq!(controller.gcd_state(), GcdState::InvalidCredentials);
    controller.set_network_available(true);
    assert_eq!(controller.gcd_state(), GcdState::InvalidCredentials);

    controller.reset().await.unwrap();
    assert_eq!(controller.gcd_state(), GcdState::Unconfigured);
}
