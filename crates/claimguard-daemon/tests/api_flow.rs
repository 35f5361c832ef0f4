//! API flow tests, calling the handlers directly.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;

use claimguard_core::config::Config;
use claimguard_core::consensus::Verdict;
use claimguard_core::gateway::{ModelGateway, ScriptedGateway};
use claimguard_core::hitl::TicketResolution;
use claimguard_core::ledger::AuditDb;
use claimguard_core::pipeline::PipelineStatus;
use claimguard_core::quota::Tier;

use claimguard_daemon::api::auth::API_KEY_HEADER;
use claimguard_daemon::api::routes::{
    approve_claim, claim_proof, claim_status, consensus_snapshot, health, metrics, submit_claim,
    submit_vote, ReviewRequest, SubmitClaimRequest, VoteRequest,
};
use claimguard_daemon::api::ApiError;
use claimguard_daemon::state::{ApiKeyEntry, ApiKeyRegistry, AppState, Role};

const SUBMITTER_KEY: &str = "test-submitter-key";
const REVIEWER_KEY: &str = "test-reviewer-key";
const MODEL_KEY: &str = "test-model-key";
const FREE_KEY: &str = "test-free-key";
const PRO_KEY: &str = "test-pro-key";

fn test_keys() -> ApiKeyRegistry {
    ApiKeyRegistry::from_entries(vec![
        ApiKeyEntry {
            key: SUBMITTER_KEY.to_string(),
            key_id: "submitter-1".to_string(),
            tier: Tier::Enterprise,
            roles: vec![Role::Submitter],
        },
        ApiKeyEntry {
            key: REVIEWER_KEY.to_string(),
            key_id: "reviewer-1".to_string(),
            tier: Tier::Enterprise,
            roles: vec![Role::Reviewer, Role::Submitter],
        },
        ApiKeyEntry {
            key: MODEL_KEY.to_string(),
            key_id: "external-model".to_string(),
            tier: Tier::Enterprise,
            roles: vec![Role::Model],
        },
        ApiKeyEntry {
            key: FREE_KEY.to_string(),
            key_id: "free-1".to_string(),
            tier: Tier::Free,
            roles: vec![Role::Submitter],
        },
        ApiKeyEntry {
            key: PRO_KEY.to_string(),
            key_id: "pro-1".to_string(),
            tier: Tier::Pro,
            roles: vec![Role::Submitter],
        },
    ])
}

struct TestApp {
    state: Arc<AppState>,
    resolutions: tokio::sync::mpsc::UnboundedReceiver<TicketResolution>,
}

fn test_app(mut config: Config) -> TestApp {
    config.models.verifiers = vec!["m1".to_string(), "m2".to_string(), "m3".to_string()];
    let gateway = Arc::new(ScriptedGateway::new(config.models.embedding_dim));
    for model in ["m1", "m2", "m3"] {
        gateway.script_vote(model, Verdict::Verified, 0.9, 0.85);
    }
    let db = AuditDb::in_memory().unwrap();
    let (state, resolutions) = AppState::build_with_gateway(
        config,
        db,
        test_keys(),
        Some(Arc::clone(&gateway) as Arc<dyn ModelGateway>),
    )
    .unwrap();
    TestApp { state, resolutions }
}

fn headers_for(key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(API_KEY_HEADER, key.parse().unwrap());
    headers
}

fn claim_body(text: &str) -> SubmitClaimRequest {
    SubmitClaimRequest {
        id: None,
        text: text.to_string(),
        evidence: vec![],
        domain: Some("vetproof".to_string()),
        priority: None,
    }
}

async fn wait_for_status(
    state: &Arc<AppState>,
    instance_id: &str,
    wanted: PipelineStatus,
) -> PipelineStatus {
    for _ in 0..500 {
        let instance = state.db.load_instance(instance_id).unwrap();
        if instance.status == wanted || instance.status.is_terminal() {
            return instance.status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("instance {instance_id} never reached {wanted:?}");
}

#[tokio::test]
async fn submit_status_proof_roundtrip() {
    let app = test_app(Config::default());

    let (status, Json(submitted)) = submit_claim(
        State(Arc::clone(&app.state)),
        headers_for(SUBMITTER_KEY),
        Json(claim_body("Veteran exam diagnosed bilateral tinnitus.")),
    )
    .await
    .unwrap();
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(submitted.status, PipelineStatus::Running);

    let final_status =
        wait_for_status(&app.state, &submitted.instance_id, PipelineStatus::Completed).await;
    assert_eq!(final_status, PipelineStatus::Completed);

    let Json(status_body) = claim_status(
        State(Arc::clone(&app.state)),
        headers_for(SUBMITTER_KEY),
        Path(submitted.instance_id.clone()),
    )
    .await
    .unwrap();
    assert_eq!(status_body.status, PipelineStatus::Completed);
    assert!(status_body.snapshot.unwrap().bft_reached);
    assert!(status_body.proof_id.is_some());

    // Proof lookup works by claim id and by instance id.
    let Json(proof) = claim_proof(
        State(Arc::clone(&app.state)),
        headers_for(SUBMITTER_KEY),
        Path(submitted.claim_id.clone()),
    )
    .await
    .unwrap();
    assert_eq!(proof.claim_id, submitted.claim_id);
    assert_eq!(proof.bundle.verdict.as_str(), "verified");

    // Consensus snapshot is served for the session (= claim id).
    let Json(snapshot) = consensus_snapshot(
        State(Arc::clone(&app.state)),
        headers_for(SUBMITTER_KEY),
        Path(submitted.claim_id.clone()),
    )
    .await
    .unwrap();
    assert!(snapshot.bft_reached);
}

#[tokio::test]
async fn authentication_and_roles_are_enforced() {
    let app = test_app(Config::default());

    let result = submit_claim(
        State(Arc::clone(&app.state)),
        HeaderMap::new(),
        Json(claim_body("text")),
    )
    .await;
    assert!(matches!(result, Err(ApiError::Unauthenticated)));

    let result = submit_claim(
        State(Arc::clone(&app.state)),
        headers_for("bogus-key"),
        Json(claim_body("text")),
    )
    .await;
    assert!(matches!(result, Err(ApiError::Unauthenticated)));

    // A submitter key cannot approve.
    let result = approve_claim(
        State(Arc::clone(&app.state)),
        headers_for(SUBMITTER_KEY),
        Path("whatever".to_string()),
        Some(Json(ReviewRequest::default())),
    )
    .await;
    assert!(matches!(result, Err(ApiError::Forbidden(_))));
}

#[tokio::test]
async fn unknown_domain_is_invalid_input() {
    let app = test_app(Config::default());
    let mut body = claim_body("text");
    body.domain = Some("astrology".to_string());

    let result = submit_claim(
        State(Arc::clone(&app.state)),
        headers_for(SUBMITTER_KEY),
        Json(body),
    )
    .await;
    assert!(matches!(result, Err(ApiError::InvalidInput(_))));
}

#[tokio::test]
async fn quota_denial_and_payment_required() {
    let mut config = Config::default();
    config.quota.claims_per_window.insert("free".to_string(), 1);
    config.quota.claims_per_window.insert("pro".to_string(), 1);
    let app = test_app(config);

    // Free tier: hard denial after the quota.
    submit_claim(
        State(Arc::clone(&app.state)),
        headers_for(FREE_KEY),
        Json(claim_body("first")),
    )
    .await
    .unwrap();
    let result = submit_claim(
        State(Arc::clone(&app.state)),
        headers_for(FREE_KEY),
        Json(claim_body("second")),
    )
    .await;
    assert!(matches!(result, Err(ApiError::QuotaExceeded(_))));

    // Pro tier: payment required with the configured price.
    submit_claim(
        State(Arc::clone(&app.state)),
        headers_for(PRO_KEY),
        Json(claim_body("first")),
    )
    .await
    .unwrap();
    let result = submit_claim(
        State(Arc::clone(&app.state)),
        headers_for(PRO_KEY),
        Json(claim_body("second")),
    )
    .await;
    match result {
        Err(ApiError::PaymentRequired {
            price_usd,
            currency,
        }) => {
            assert!((price_usd - 0.05).abs() < 1e-12);
            assert_eq!(currency, "USD");
        }
        other => panic!("expected payment required, got {other:?}"),
    }
}

#[tokio::test]
async fn request_rate_limit_applies() {
    let mut config = Config::default();
    config.quota.requests_per_window = 2;
    let app = test_app(config);

    for _ in 0..2 {
        claim_status(
            State(Arc::clone(&app.state)),
            headers_for(SUBMITTER_KEY),
            Path("missing".to_string()),
        )
        .await
        .err();
    }
    let result = claim_status(
        State(Arc::clone(&app.state)),
        headers_for(SUBMITTER_KEY),
        Path("missing".to_string()),
    )
    .await;
    assert!(matches!(result, Err(ApiError::RateLimited { .. })));
}

#[tokio::test]
async fn review_flow_through_the_api() {
    let mut app = test_app(Config::default());

    let mut body = claim_body("Veteran exam diagnosed bilateral tinnitus.");
    body.priority = Some("high".to_string());
    let (_, Json(submitted)) = submit_claim(
        State(Arc::clone(&app.state)),
        headers_for(SUBMITTER_KEY),
        Json(body),
    )
    .await
    .unwrap();

    let status = wait_for_status(
        &app.state,
        &submitted.instance_id,
        PipelineStatus::AwaitingReview,
    )
    .await;
    assert_eq!(status, PipelineStatus::AwaitingReview);

    let Json(review) = approve_claim(
        State(Arc::clone(&app.state)),
        headers_for(REVIEWER_KEY),
        Path(submitted.claim_id.clone()),
        Some(Json(ReviewRequest {
            reason: "evidence reviewed".to_string(),
        })),
    )
    .await
    .unwrap();
    assert_eq!(review.status.as_str(), "approved");

    // A second approval is rejected with a conflict.
    let again = approve_claim(
        State(Arc::clone(&app.state)),
        headers_for(REVIEWER_KEY),
        Path(submitted.claim_id.clone()),
        None,
    )
    .await;
    assert!(matches!(again, Err(ApiError::Conflict(_))));

    // Deliver the resolution the way the dispatcher would.
    let resolution = app.resolutions.recv().await.unwrap();
    app.state
        .orchestrator
        .resume(&resolution.ticket.instance_id, resolution.decision)
        .await
        .unwrap();

    let final_status =
        wait_for_status(&app.state, &submitted.instance_id, PipelineStatus::Completed).await;
    assert_eq!(final_status, PipelineStatus::Completed);

    let Json(proof) = claim_proof(
        State(Arc::clone(&app.state)),
        headers_for(SUBMITTER_KEY),
        Path(submitted.claim_id),
    )
    .await
    .unwrap();
    assert!(!proof.bundle.reviewer.auto);
    assert_eq!(proof.bundle.reviewer.reviewer, "reviewer-1");
}

#[tokio::test]
async fn external_votes_respect_session_state() {
    let app = test_app(Config::default());

    // Unknown session.
    let result = submit_vote(
        State(Arc::clone(&app.state)),
        headers_for(MODEL_KEY),
        Path("no-such-session".to_string()),
        Json(VoteRequest {
            model_id: None,
            verdict: "verified".to_string(),
            confidence: 0.9,
            coherence: 0.9,
            reasoning: String::new(),
            weight: None,
        }),
    )
    .await;
    assert!(matches!(result, Err(ApiError::NotFound(_))));

    // A completed run leaves the session sealed.
    let (_, Json(submitted)) = submit_claim(
        State(Arc::clone(&app.state)),
        headers_for(SUBMITTER_KEY),
        Json(claim_body("claim for sealing")),
    )
    .await
    .unwrap();
    wait_for_status(&app.state, &submitted.instance_id, PipelineStatus::Completed).await;

    let result = submit_vote(
        State(Arc::clone(&app.state)),
        headers_for(MODEL_KEY),
        Path(submitted.claim_id.clone()),
        Json(VoteRequest {
            model_id: None,
            verdict: "unverified".to_string(),
            confidence: 0.2,
            coherence: 0.9,
            reasoning: String::new(),
            weight: None,
        }),
    )
    .await;
    assert!(matches!(result, Err(ApiError::Conflict(_))));

    // Out-of-range votes are invalid input.
    let result = submit_vote(
        State(Arc::clone(&app.state)),
        headers_for(MODEL_KEY),
        Path(submitted.claim_id),
        Json(VoteRequest {
            model_id: None,
            verdict: "maybe".to_string(),
            confidence: 0.9,
            coherence: 0.9,
            reasoning: String::new(),
            weight: None,
        }),
    )
    .await;
    assert!(matches!(result, Err(ApiError::InvalidInput(_))));
}

#[tokio::test]
async fn health_and_metrics_surfaces() {
    let app = test_app(Config::default());

    let Json(report) = health(State(Arc::clone(&app.state))).await;
    assert!(report.healthy);

    app.state.metrics.claims_submitted.inc();
    let text = metrics(State(Arc::clone(&app.state))).await.unwrap();
    assert!(text.contains("claimguard_claims_submitted_total"));
}
