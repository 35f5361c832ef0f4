//! End-to-end pipeline scenarios against in-process dependencies.

use std::sync::Arc;

use tokio::sync::mpsc;

use claimguard_core::cache::ArtifactCache;
use claimguard_core::claim::{Claim, Domain, Priority};
use claimguard_core::config::Config;
use claimguard_core::consensus::{ConsensusEngine, FinalVerdict, Verdict};
use claimguard_core::evidence::{EvidenceStore, MemoryEvidenceStore};
use claimguard_core::gateway::{ModelGateway, ScriptedGateway};
use claimguard_core::hitl::{HitlGate, TicketResolution};
use claimguard_core::index::MemoryVectorIndex;
use claimguard_core::ledger::{AuditDb, AuditEventKind};
use claimguard_core::pipeline::{
    Dependencies, PipelineOrchestrator, PipelineStatus, ReviewOutcome, RunOutcome, Stage,
    TrustFlag,
};
use claimguard_core::proof::{ProofSigner, GENESIS_HASH};
use claimguard_core::trust::TrustRegistry;

struct Harness {
    orchestrator: Arc<PipelineOrchestrator>,
    gateway: Arc<ScriptedGateway>,
    evidence: Arc<MemoryEvidenceStore>,
    db: AuditDb,
    gate: Arc<HitlGate>,
    signer: Arc<ProofSigner>,
    resolutions: mpsc::UnboundedReceiver<TicketResolution>,
}

fn harness(mut config: Config) -> Harness {
    config.models.verifiers = vec!["m1".to_string(), "m2".to_string(), "m3".to_string()];
    let config = Arc::new(config);

    let gateway = Arc::new(ScriptedGateway::new(config.models.embedding_dim));
    let db = AuditDb::in_memory().unwrap();
    let evidence = Arc::new(MemoryEvidenceStore::new());
    let signer = Arc::new(ProofSigner::generate());
    let (gate, resolutions) = HitlGate::new(&db);
    let gate = Arc::new(gate);

    let orchestrator = Arc::new(PipelineOrchestrator::new(Dependencies {
        config: Arc::clone(&config),
        gateway: Arc::clone(&gateway) as Arc<dyn ModelGateway>,
        index: Arc::new(MemoryVectorIndex::new(config.models.embedding_dim)),
        evidence: Arc::clone(&evidence) as Arc<dyn EvidenceStore>,
        db: db.clone(),
        engine: Arc::new(ConsensusEngine::new(config.consensus.clone())),
        trust: Arc::new(TrustRegistry::new()),
        cache: Arc::new(ArtifactCache::new(config.cache.ttl)),
        gate: Arc::clone(&gate),
        signer: Arc::clone(&signer),
    }));

    Harness {
        orchestrator,
        gateway,
        evidence,
        db,
        gate,
        signer,
        resolutions,
    }
}

fn vetproof_claim(id: &str) -> Claim {
    Claim::new(
        id,
        "Veteran served 2001-2008 with documented noise exposure; \
         VA exam diagnosed bilateral tinnitus.",
    )
    .with_domain(Domain::Vetproof)
}

fn script_unanimous(gateway: &ScriptedGateway, confidences: [f64; 3]) {
    gateway.script_vote("m1", Verdict::Verified, confidences[0], 0.88);
    gateway.script_vote("m2", Verdict::Verified, confidences[1], 0.85);
    gateway.script_vote("m3", Verdict::Verified, confidences[2], 0.84);
}

async fn run_to_completion(h: &Harness, claim: Claim) -> RunOutcome {
    let instance = h.orchestrator.submit(claim).unwrap();
    h.orchestrator.run(&instance.instance_id).await.unwrap()
}

/// Delivers the pending gate resolution the way the dispatcher would.
async fn deliver_resolution(h: &mut Harness) -> RunOutcome {
    let resolution = h.resolutions.recv().await.expect("resolution pending");
    h.orchestrator
        .resume(&resolution.ticket.instance_id, resolution.decision)
        .await
        .unwrap()
}

#[tokio::test]
async fn scenario_a_clean_verify() {
    let h = harness(Config::default());
    script_unanimous(&h.gateway, [0.90, 0.88, 0.86]);

    let outcome = run_to_completion(&h, vetproof_claim("c1")).await;
    let RunOutcome::Completed(record) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };

    let snapshot = &record.bundle.stages.verify.snapshot;
    assert!(snapshot.bft_reached);
    assert!((snapshot.agreement_ratio - 1.0).abs() < 1e-9);
    assert!((snapshot.weighted_confidence - 0.88).abs() < 0.005);
    assert!(snapshot.confidence_std_dev < 0.02);
    assert!(!snapshot.variance_halt);
    assert!(!snapshot.constitutional_halt);

    assert_eq!(record.bundle.verdict, FinalVerdict::Verified);
    assert_eq!(record.bundle.previous_hash, GENESIS_HASH);
    assert_eq!(record.domain, "vetproof");

    // The stored hash matches a recomputation over the canonical bytes.
    assert_eq!(
        record.bundle.compute_hash().unwrap(),
        record.bundle.proof_hash
    );
    // The signature verifies against the platform key.
    h.signer
        .verify_hash(&record.bundle.proof_hash, &record.signature)
        .unwrap();

    // Stage-complete events form a strictly increasing prefix of the
    // stage order, one per stage.
    let completes: Vec<String> = h
        .db
        .events_for_claim("c1")
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == AuditEventKind::StageComplete)
        .map(|e| e.payload["stage"].as_str().unwrap().to_string())
        .collect();
    let expected: Vec<String> = Stage::ORDER.iter().map(|s| s.as_str().to_string()).collect();
    assert_eq!(completes, expected);

    let signed = h
        .db
        .events_for_claim("c1")
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == AuditEventKind::ProofSigned)
        .count();
    assert_eq!(signed, 1);
}

#[tokio::test]
async fn scenario_b_variance_halt() {
    let mut h = harness(Config::default());
    h.gateway.script_vote("m1", Verdict::Verified, 0.95, 0.88);
    h.gateway.script_vote("m2", Verdict::Unverified, 0.30, 0.85);
    h.gateway.script_vote("m3", Verdict::Verified, 0.85, 0.84);

    let outcome = run_to_completion(&h, vetproof_claim("c1")).await;
    let RunOutcome::Completed(record) = outcome else {
        panic!("expected a halt proof, got {outcome:?}");
    };

    let snapshot = &record.bundle.stages.verify.snapshot;
    assert!((snapshot.confidence_std_dev - 0.287).abs() < 0.005);
    assert!(snapshot.variance_halt);
    assert_eq!(record.bundle.verdict, FinalVerdict::Halt);
    assert!(record.is_halt_proof());
    assert!(record
        .bundle
        .stages
        .detect
        .flags
        .contains(&TrustFlag::HighVariance));

    // Halt-bound claims never wait on a reviewer.
    assert!(h.resolutions.try_recv().is_err());
    assert!(h
        .db
        .events_for_claim("c1")
        .unwrap()
        .iter()
        .any(|e| e.kind == AuditEventKind::HaltTriggered));
}

#[tokio::test]
async fn scenario_c_constitutional_halt() {
    let mut h = harness(Config::default());
    // c-bar = 0.72, below the health threshold of 0.80, with tight
    // agreement.
    script_unanimous(&h.gateway, [0.74, 0.71, 0.71]);

    let claim = Claim::new("c1", "Daily aspirin eliminates all cardiac risk.")
        .with_domain(Domain::Health);
    let outcome = run_to_completion(&h, claim).await;
    let RunOutcome::Suspended { ticket_id } = outcome else {
        panic!("constitutional halt routes through review, got {outcome:?}");
    };

    h.gate
        .resolve(&ticket_id, true, "rev-7", "low confidence confirmed")
        .unwrap();
    let outcome = deliver_resolution(&mut h).await;
    let RunOutcome::Completed(record) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };

    let snapshot = &record.bundle.stages.verify.snapshot;
    assert!(snapshot.bft_reached);
    assert!(snapshot.confidence_std_dev < 0.05);
    assert!(snapshot.constitutional_halt);
    assert_eq!(record.bundle.verdict, FinalVerdict::Halt);
    assert!(!record.bundle.reviewer.auto);
}

#[tokio::test]
async fn scenario_d_hitl_approval() {
    let mut h = harness(Config::default());
    script_unanimous(&h.gateway, [0.74, 0.74, 0.74]);

    let claim = vetproof_claim("c1").with_priority(Priority::High);
    let outcome = run_to_completion(&h, claim).await;
    let RunOutcome::Suspended { ticket_id } = outcome else {
        panic!("high priority must gate, got {outcome:?}");
    };

    h.gate
        .resolve(&ticket_id, true, "rev-1", "evidence reviewed")
        .unwrap();
    let outcome = deliver_resolution(&mut h).await;
    let RunOutcome::Completed(record) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };

    assert_eq!(record.bundle.verdict, FinalVerdict::Verified);
    assert!(!record.bundle.reviewer.auto);
    assert_eq!(record.bundle.reviewer.reviewer, "rev-1");
    assert_eq!(record.bundle.reviewer.reason, "evidence reviewed");
    assert_eq!(record.bundle.previous_hash, GENESIS_HASH);

    // The next proof in the domain chains to this one.
    script_unanimous(&h.gateway, [0.90, 0.88, 0.86]);
    let outcome = run_to_completion(&h, vetproof_claim("c2")).await;
    let RunOutcome::Completed(next) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(next.bundle.previous_hash, record.bundle.proof_hash);
}

#[tokio::test]
async fn scenario_e_hitl_expiry() {
    let mut config = Config::default();
    config.hitl.deadline = std::time::Duration::ZERO;
    let mut h = harness(config);
    script_unanimous(&h.gateway, [0.74, 0.74, 0.74]);

    let claim = vetproof_claim("c1").with_priority(Priority::High);
    let outcome = run_to_completion(&h, claim).await;
    let RunOutcome::Suspended { ticket_id } = outcome else {
        panic!("high priority must gate, got {outcome:?}");
    };

    let expired = h.gate.expire_due(chrono::Utc::now()).unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].ticket_id, ticket_id);

    let outcome = deliver_resolution(&mut h).await;
    let RunOutcome::Completed(record) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };

    assert_eq!(record.bundle.verdict, FinalVerdict::Halt);
    assert_eq!(record.bundle.reviewer.outcome, ReviewOutcome::Expired);
    assert!(record.bundle.reviewer.auto);

    let events = h.db.events_for_claim("c1").unwrap();
    assert!(events.iter().any(|e| e.kind == AuditEventKind::HitlOpen));
    assert!(events.iter().any(|e| e.kind == AuditEventKind::HitlExpired));
}

#[tokio::test(start_paused = true)]
async fn scenario_f_embed_retry_recovery() {
    let h = harness(Config::default());
    script_unanimous(&h.gateway, [0.90, 0.88, 0.86]);
    h.gateway.fail_next_embeds(1);

    let outcome = run_to_completion(&h, vetproof_claim("c1")).await;
    let RunOutcome::Completed(record) = outcome else {
        panic!("expected completion after retry, got {outcome:?}");
    };
    assert_eq!(record.bundle.verdict, FinalVerdict::Verified);

    // The embed retry is visible in the stage log but produced exactly one
    // stage-complete event.
    let instance = h.db.find_instance_by_claim("c1").unwrap().unwrap();
    let embed_entry = instance
        .stage_log
        .iter()
        .find(|e| e.stage == Stage::Embed)
        .unwrap();
    assert_eq!(embed_entry.attempts, 2);

    let events = h.db.events_for_claim("c1").unwrap();
    for stage in Stage::ORDER {
        let count = events
            .iter()
            .filter(|e| {
                e.kind == AuditEventKind::StageComplete
                    && e.payload["stage"] == stage.as_str()
            })
            .count();
        assert_eq!(count, 1, "{stage} must complete exactly once");
    }
}

#[tokio::test(start_paused = true)]
async fn retry_exhaustion_fails_without_proof() {
    let h = harness(Config::default());
    script_unanimous(&h.gateway, [0.90, 0.88, 0.86]);
    // Embed allows 3 attempts; fail more than that.
    h.gateway.fail_next_embeds(10);

    let outcome = run_to_completion(&h, vetproof_claim("c1")).await;
    let RunOutcome::Failed { stage, .. } = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert_eq!(stage, Stage::Embed);

    let instance = h.db.find_instance_by_claim("c1").unwrap().unwrap();
    assert_eq!(instance.status, PipelineStatus::Failed);
    assert!(h.evidence.is_empty(), "failed runs never write proofs");
    assert!(h
        .db
        .events_for_claim("c1")
        .unwrap()
        .iter()
        .any(|e| e.kind == AuditEventKind::StageFail));
}

#[tokio::test]
async fn cancelled_instance_stops_before_next_stage() {
    let h = harness(Config::default());
    script_unanimous(&h.gateway, [0.90, 0.88, 0.86]);

    let instance = h.orchestrator.submit(vetproof_claim("c1")).unwrap();
    h.orchestrator.cancel(&instance.instance_id).unwrap();

    let outcome = h.orchestrator.run(&instance.instance_id).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Cancelled));
    assert!(h.evidence.is_empty());
    // Cancelling a terminal instance is rejected.
    assert!(h.orchestrator.cancel(&instance.instance_id).is_err());
}

#[tokio::test]
async fn domain_mandate_routes_health_claims_to_review() {
    let mut h = harness(Config::default());
    // Confidence clears even the health threshold; the domain mandate
    // still gates.
    script_unanimous(&h.gateway, [0.92, 0.91, 0.90]);

    let claim = Claim::new("c1", "The new vaccine batch meets potency spec.")
        .with_domain(Domain::Health);
    let outcome = run_to_completion(&h, claim).await;
    assert!(matches!(outcome, RunOutcome::Suspended { .. }));

    h.gate
        .resolve(
            &h.gate.list_pending().unwrap()[0].ticket_id.clone(),
            true,
            "rev-2",
            "clinical review done",
        )
        .unwrap();
    let outcome = deliver_resolution(&mut h).await;
    let RunOutcome::Completed(record) = outcome else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(record.bundle.verdict, FinalVerdict::Verified);
}

#[tokio::test]
async fn resume_is_idempotent_after_completion() {
    let mut h = harness(Config::default());
    script_unanimous(&h.gateway, [0.74, 0.74, 0.74]);

    let claim = vetproof_claim("c1").with_priority(Priority::High);
    let instance = h.orchestrator.submit(claim).unwrap();
    let RunOutcome::Suspended { ticket_id } =
        h.orchestrator.run(&instance.instance_id).await.unwrap()
    else {
        panic!("expected suspension");
    };

    h.gate.resolve(&ticket_id, true, "rev-1", "ok").unwrap();
    let first = deliver_resolution(&mut h).await;
    let RunOutcome::Completed(first_record) = first else {
        panic!("expected completion");
    };

    // A second delivery (crash-recovery double fire) returns the same
    // proof instead of signing twice.
    let decision = h.gate.get(&ticket_id).unwrap().decision().unwrap();
    let second = h
        .orchestrator
        .resume(&instance.instance_id, decision)
        .await
        .unwrap();
    let RunOutcome::Completed(second_record) = second else {
        panic!("expected idempotent completion");
    };
    assert_eq!(first_record.proof_id, second_record.proof_id);
    assert_eq!(h.evidence.len(), 1);
}
