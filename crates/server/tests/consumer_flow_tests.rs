//! Flow controller tests against a stub protocol client.

mod common;

use axum::http::StatusCode;
use common::{
    BASE_URL, MemoryRegistrations, PROVIDER, StubClient, open_settings, settings,
};
use openid_consumer::consumer::{CompleteOutcome, ConsumerFlow, StartOutcome};
use openid_consumer::error::ConsumerError;
use openid_consumer::openid::VerificationOutcome;
use openid_consumer::policy::{Allowlist, ProviderMatcher};
use openid_consumer::projection::{AccessLevel, admin_session};
use openid_consumer::session::SessionData;
use std::collections::BTreeMap;
use std::sync::Arc;

const NODE_ID: &str = "https://host/openid/server/node/web01";

fn flow(client: StubClient) -> ConsumerFlow<StubClient> {
    ConsumerFlow::new(
        open_settings(),
        MemoryRegistrations::with(&[("web01", false)]),
        client,
    )
}

fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

// =============================================================================
// login gate
// =============================================================================

#[tokio::test]
async fn test_login_rejects_unlisted_identifier_without_discovery() {
    let client = StubClient::success(NODE_ID);
    let recorded = client.recorded.clone();
    let flow = ConsumerFlow::new(
        settings(
            Allowlist::Restricted(vec!["https://good".to_string()]),
            Allowlist::Open,
        ),
        MemoryRegistrations::with(&[]),
        client,
    );
    let mut session = SessionData::default();

    let err = flow
        .login(Some("bad-id"), false, &mut session)
        .await
        .unwrap_err();

    assert!(matches!(err, ConsumerError::Unauthorized(_)));
    assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(err.to_string(), "Sorry, bad-id is not an authorized OpenID.");
    assert_eq!(recorded.begin_calls(), 0);
    assert!(session.pending.is_none());
}

#[tokio::test]
async fn test_login_checks_identifier_against_provider_list() {
    let client = StubClient::success(NODE_ID);
    let recorded = client.recorded.clone();
    let flow = ConsumerFlow::new(
        settings(
            Allowlist::Open,
            Allowlist::Restricted(vec![ProviderMatcher::Exact(PROVIDER.to_string())]),
        ),
        MemoryRegistrations::with(&[]),
        client,
    );
    let mut session = SessionData::default();

    // The identifier is not the provider endpoint, so it is refused
    let err = flow
        .login(Some("https://alice.example.com/"), false, &mut session)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Sorry, https://alice.example.com/ is not an authorized OpenID Provider."
    );
    assert_eq!(recorded.begin_calls(), 0);

    // An identifier equal to an allowed provider passes both checks
    let outcome = flow.login(Some(PROVIDER), false, &mut session).await.unwrap();
    assert!(matches!(outcome, StartOutcome::Redirect(_)));
    assert_eq!(recorded.begin_calls(), 1);
}

#[tokio::test]
async fn test_login_missing_identifier_with_restricted_list() {
    let client = StubClient::success(NODE_ID);
    let flow = ConsumerFlow::new(
        settings(
            Allowlist::Restricted(vec!["https://good".to_string()]),
            Allowlist::Open,
        ),
        MemoryRegistrations::with(&[]),
        client,
    );
    let err = flow
        .login(None, false, &mut SessionData::default())
        .await
        .unwrap_err();
    assert!(matches!(err, ConsumerError::Unauthorized(_)));
}

#[tokio::test]
async fn test_login_allowed_identifier_starts_discovery() {
    let client = StubClient::success(NODE_ID);
    let recorded = client.recorded.clone();
    let flow = ConsumerFlow::new(
        settings(
            Allowlist::Restricted(vec!["https://good".to_string()]),
            Allowlist::Restricted(vec![ProviderMatcher::Prefix("https://".to_string())]),
        ),
        MemoryRegistrations::with(&[]),
        client,
    );
    let mut session = SessionData::default();

    let outcome = flow
        .login(Some("https://good"), false, &mut session)
        .await
        .unwrap();

    assert!(matches!(outcome, StartOutcome::Redirect(_)));
    assert_eq!(recorded.begin_calls(), 1);
    assert_eq!(
        session.pending.as_ref().and_then(|p| p.claimed_id.as_deref()),
        Some("https://good")
    );
}

// =============================================================================
// start
// =============================================================================

#[tokio::test]
async fn test_start_without_identifier() {
    let client = StubClient::success(NODE_ID);
    let recorded = client.recorded.clone();
    let flow = flow(client);

    for identifier in [None, Some(""), Some("   ")] {
        let err = flow
            .start(identifier, false, &mut SessionData::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::MissingIdentifier));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }
    assert_eq!(recorded.begin_calls(), 0);
}

#[tokio::test]
async fn test_start_redirect_uses_realm_and_return_to() {
    let client = StubClient::success(NODE_ID);
    let recorded = client.recorded.clone();
    let flow = flow(client);
    let mut session = SessionData::default();

    let StartOutcome::Redirect(url) = flow
        .start(Some("https://alice.example.com/"), false, &mut session)
        .await
        .unwrap()
    else {
        panic!("expected redirect");
    };

    assert!(url.starts_with(PROVIDER));
    let requests = recorded.requests.lock().unwrap().clone();
    assert_eq!(
        requests,
        vec![(
            format!("{BASE_URL}/openid/consumer"),
            format!("{BASE_URL}/openid/consumer/complete"),
            false
        )]
    );
    assert!(session.pending.is_some());
}

#[tokio::test]
async fn test_start_hands_identifier_to_discovery_unchanged() {
    let flow = flow(StubClient::success(NODE_ID));
    let mut session = SessionData::default();

    flow.start(Some("  https://alice.example.com/ "), false, &mut session)
        .await
        .unwrap();

    let pending = session.pending.expect("pending discovery");
    assert_eq!(
        pending.claimed_id.as_deref(),
        Some("  https://alice.example.com/ ")
    );
}

#[tokio::test]
async fn test_start_passes_immediate_through() {
    let client = StubClient::success(NODE_ID);
    let recorded = client.recorded.clone();
    let flow = flow(client);

    let StartOutcome::Redirect(url) = flow
        .start(Some("https://alice.example.com/"), true, &mut SessionData::default())
        .await
        .unwrap()
    else {
        panic!("expected redirect");
    };
    assert!(url.contains("checkid_immediate"));
    assert!(recorded.requests.lock().unwrap()[0].2);
}

#[tokio::test]
async fn test_start_form_post_branch() {
    let mut client = StubClient::success(NODE_ID);
    client.use_redirect = false;
    let flow = flow(client);

    let outcome = flow
        .start(Some("https://alice.example.com/"), false, &mut SessionData::default())
        .await
        .unwrap();

    let StartOutcome::Form(markup) = outcome else {
        panic!("expected form");
    };
    assert!(markup.contains("id=\"openid_form\""));
    assert!(markup.contains(&format!("{BASE_URL}/openid/consumer/complete")));
}

#[tokio::test]
async fn test_start_discovery_failure() {
    let mut client = StubClient::success(NODE_ID);
    client.discovery_error = Some("No usable OpenID services found".to_string());
    let flow = flow(client);
    let mut session = SessionData::default();

    let err = flow
        .start(Some("https://nobody.example/"), false, &mut session)
        .await
        .unwrap_err();

    match &err {
        ConsumerError::Discovery {
            identifier,
            message,
        } => {
            assert_eq!(identifier, "https://nobody.example/");
            assert_eq!(message, "No usable OpenID services found");
        }
        other => panic!("expected discovery error, got {other:?}"),
    }
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    assert!(session.pending.is_none());
}

// =============================================================================
// complete
// =============================================================================

#[tokio::test]
async fn test_complete_node_identity_without_admin() {
    let flow = flow(StubClient::success(NODE_ID));
    let mut session = SessionData::default();

    let outcome = flow.complete(BTreeMap::new(), &mut session).await.unwrap();

    let auth = session.auth.as_ref().unwrap();
    assert_eq!(auth.openid, NODE_ID);
    assert_eq!(auth.level(), AccessLevel::Node);
    assert_eq!(auth.node_name(), Some("web01"));
    assert_eq!(
        outcome,
        CompleteOutcome::Authenticated {
            redirect_to: format!("{BASE_URL}/nodes"),
            message: format!("Verification of {NODE_ID} succeeded."),
        }
    );
}

#[tokio::test]
async fn test_complete_node_identity_with_admin_registration() {
    let flow = ConsumerFlow::new(
        open_settings(),
        MemoryRegistrations::with(&[("web01", true)]),
        StubClient::success(NODE_ID),
    );
    let mut session = SessionData::default();

    flow.complete(BTreeMap::new(), &mut session).await.unwrap();

    let auth = session.auth.as_ref().unwrap();
    assert_eq!(auth.level(), AccessLevel::Admin);
    // Admins reached through a node-shaped identity keep the node name
    assert_eq!(auth.node_name(), Some("web01"));
}

#[tokio::test]
async fn test_complete_other_identity_is_admin() {
    let flow = flow(StubClient::success("https://host/otherpath"));
    let mut session = SessionData::default();

    flow.complete(BTreeMap::new(), &mut session).await.unwrap();

    let auth = session.auth.as_ref().unwrap();
    assert_eq!(auth.level(), AccessLevel::Admin);
    assert_eq!(auth.node_name(), None);
}

#[tokio::test]
async fn test_complete_failure_message() {
    let flow = flow(StubClient::returning(VerificationOutcome::Failure {
        message: "bad sig".to_string(),
        display_identifier: Some("https://x".to_string()),
    }));
    let mut session = SessionData::default();

    let err = flow
        .complete(BTreeMap::new(), &mut session)
        .await
        .unwrap_err();

    assert_eq!(
        err.to_string(),
        "Verification failed: bad sig for identifier 'https://x'"
    );
    assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    assert!(session.auth.is_none());
}

#[tokio::test]
async fn test_complete_failure_without_identifier() {
    let flow = flow(StubClient::returning(VerificationOutcome::Failure {
        message: "bad sig".to_string(),
        display_identifier: None,
    }));
    let err = flow
        .complete(BTreeMap::new(), &mut SessionData::default())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Verification failed: bad sig");
}

#[tokio::test]
async fn test_complete_setup_needed_leaves_session_alone() {
    let flow = flow(StubClient::returning(VerificationOutcome::SetupNeeded {
        setup_url: None,
    }));
    let mut session = SessionData {
        auth: Some(admin_session("https://before")),
        ..SessionData::default()
    };

    let outcome = flow.complete(BTreeMap::new(), &mut session).await.unwrap();

    assert_eq!(
        outcome,
        CompleteOutcome::Status("Immediate request failed - Setup Needed".to_string())
    );
    assert_eq!(session.auth, Some(admin_session("https://before")));
}

#[tokio::test]
async fn test_complete_cancelled() {
    let flow = flow(StubClient::returning(VerificationOutcome::Cancelled));
    let mut session = SessionData::default();

    let outcome = flow.complete(BTreeMap::new(), &mut session).await.unwrap();

    assert_eq!(
        outcome,
        CompleteOutcome::Status("OpenID transaction cancelled.".to_string())
    );
    assert!(session.auth.is_none());
}

#[tokio::test]
async fn test_complete_unknown_registration_is_forbidden() {
    let flow = ConsumerFlow::new(
        open_settings(),
        MemoryRegistrations::with(&[]),
        StubClient::success(NODE_ID),
    );
    let mut session = SessionData::default();

    let err = flow
        .complete(BTreeMap::new(), &mut session)
        .await
        .unwrap_err();

    assert!(matches!(err, ConsumerError::UnknownRegistration(ref name) if name == "web01"));
    assert_eq!(err.status(), StatusCode::FORBIDDEN);
    assert!(session.auth.is_none());
}

#[tokio::test]
async fn test_complete_strips_routing_parameters() {
    let client = StubClient::success("https://host/otherpath");
    let recorded = client.recorded.clone();
    let flow = flow(client);

    flow.complete(
        params(&[
            ("controller", "openid/consumer"),
            ("action", "complete"),
            ("openid.mode", "id_res"),
        ]),
        &mut SessionData::default(),
    )
    .await
    .unwrap();

    let seen = recorded.complete_params.lock().unwrap().clone().unwrap();
    assert_eq!(seen, params(&[("openid.mode", "id_res")]));
    assert_eq!(
        recorded.complete_url.lock().unwrap().as_deref(),
        Some(format!("{BASE_URL}/openid/consumer/complete").as_str())
    );
}

#[tokio::test]
async fn test_complete_redirects_to_page_requested_before_login() {
    let flow = flow(StubClient::success("https://host/otherpath"));
    let mut session = SessionData {
        return_to: Some(format!("{BASE_URL}/nodes/web02")),
        ..SessionData::default()
    };

    let outcome = flow.complete(BTreeMap::new(), &mut session).await.unwrap();

    let CompleteOutcome::Authenticated { redirect_to, .. } = outcome else {
        panic!("expected authentication");
    };
    assert_eq!(redirect_to, format!("{BASE_URL}/nodes/web02"));
    assert!(session.return_to.is_none());
}

#[tokio::test]
async fn test_start_then_complete_round_trip() {
    let client = StubClient::success(NODE_ID);
    let recorded = client.recorded.clone();
    let flow = flow(client);
    let mut session = SessionData::default();

    flow.start(Some(NODE_ID), false, &mut session).await.unwrap();
    assert!(session.pending.is_some());

    let outcome = flow
        .complete(params(&[("openid.mode", "id_res")]), &mut session)
        .await
        .unwrap();

    assert!(matches!(outcome, CompleteOutcome::Authenticated { .. }));
    assert_eq!(recorded.begin_calls(), 1);
    assert!(session.pending.is_none());
    assert_eq!(session.auth.as_ref().unwrap().node_name(), Some("web01"));
}

// =============================================================================
// logout
// =============================================================================

#[tokio::test]
async fn test_logout_clears_auth_and_is_idempotent() {
    let flow = flow(StubClient::success(NODE_ID));
    let mut session = SessionData::default();
    flow.complete(BTreeMap::new(), &mut session).await.unwrap();
    assert!(session.auth.is_some());

    assert_eq!(flow.logout(&mut session), format!("{BASE_URL}/"));
    assert!(session.auth.is_none());

    // Nothing to remove the second time
    assert_eq!(flow.logout(&mut session), format!("{BASE_URL}/"));
    assert!(session.auth.is_none());
}

#[tokio::test]
async fn test_flow_shares_settings() {
    let shared = open_settings();
    let flow = ConsumerFlow::new(
        shared.clone(),
        MemoryRegistrations::with(&[]),
        StubClient::success(NODE_ID),
    );
    assert_eq!(flow.realm(), format!("{BASE_URL}/openid/consumer"));
    assert_eq!(flow.return_to(), format!("{BASE_URL}/openid/consumer/complete"));
    assert_eq!(Arc::strong_count(&shared), 2);
}
