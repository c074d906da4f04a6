//! Full-pipeline security behavior: credential lifecycle through the
//! guard, rate enforcement under load, and the audit trail the
//! pipeline leaves behind.

use meshfabric::audit::{AuditLogger, MemoryAuditSink};
use meshfabric::auth::{AuthCache, AuthCacheConfig, Permissions, TokenConfig, TokenService};
use meshfabric::config::GuardConfig;
use meshfabric::error::FabricError;
use meshfabric::guard::{GuardPipeline, MessageIntegrity, SIGNATURE_LENGTH};
use meshfabric::stats::FabricStats;
use meshfabric::EventBus;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

struct Harness {
    pipeline: GuardPipeline,
    tokens: Arc<TokenService>,
    integrity: Arc<MessageIntegrity>,
    sink: Arc<MemoryAuditSink>,
    stats: Arc<FabricStats>,
}

fn harness(guard_config: GuardConfig, token_config: TokenConfig) -> Harness {
    let stats = Arc::new(FabricStats::new());
    let tokens = Arc::new(
        TokenService::new(token_config)
            .unwrap()
            .with_stats(stats.clone()),
    );
    let cache = Arc::new(AuthCache::new(AuthCacheConfig::default()));
    let integrity = Arc::new(MessageIntegrity::new(vec![0xA7; 32]));
    let sink = Arc::new(MemoryAuditSink::new());
    let audit = AuditLogger::spawn(sink.clone(), stats.clone());
    let events = Arc::new(EventBus::new(64));

    let pipeline = GuardPipeline::new(
        &guard_config,
        tokens.clone(),
        cache,
        integrity.clone(),
        audit,
        events,
        stats.clone(),
    );

    Harness {
        pipeline,
        tokens,
        integrity,
        sink,
        stats,
    }
}

fn signing_key() -> Vec<u8> {
    vec![0x42; 32]
}

#[tokio::test]
async fn expired_token_rejected_end_to_end() {
    let h = harness(
        GuardConfig::default(),
        TokenConfig {
            signing_key: signing_key(),
            validity: Duration::from_secs(0),
            ..Default::default()
        },
    );

    let token = h.tokens.issue("agent-1", "worker", Permissions::SEND).unwrap();
    let message = b"too late";
    let sig = h.integrity.sign(message).unwrap();

    let err = h
        .pipeline
        .check_message("10.0.0.1", &token, message, &sig, Permissions::SEND)
        .unwrap_err();
    assert!(matches!(err, FabricError::ExpiredToken));
    assert_eq!(h.stats.snapshot().auth_failures, 1);

    // A fresh credential with a real validity window goes through.
    let token = h
        .tokens
        .issue_with_validity("agent-1", "worker", Permissions::SEND, Duration::from_secs(60))
        .unwrap();
    let message = b"in time";
    let sig = h.integrity.sign(message).unwrap();
    h.pipeline
        .check_message("10.0.0.1", &token, message, &sig, Permissions::SEND)
        .unwrap();
}

#[tokio::test]
async fn cached_credential_dies_with_its_token() {
    let h = harness(
        GuardConfig::default(),
        TokenConfig {
            signing_key: signing_key(),
            validity: Duration::from_secs(1),
            ..Default::default()
        },
    );

    let token = h.tokens.issue("agent-1", "worker", Permissions::SEND).unwrap();

    // First pass validates and caches.
    h.pipeline.authenticate(&token).unwrap();
    assert_eq!(h.stats.snapshot().auth_cache_misses, 1);

    // A hit within the validity window.
    h.pipeline.authenticate(&token).unwrap();
    assert_eq!(h.stats.snapshot().auth_cache_hits, 1);

    // Past the token lifetime the cached entry is gone too, and
    // revalidation fails outright.
    sleep(Duration::from_millis(1600)).await;
    let err = h.pipeline.authenticate(&token).unwrap_err();
    assert!(matches!(err, FabricError::ExpiredToken));
    assert_eq!(h.stats.snapshot().auth_cache_misses, 2);
}

#[tokio::test]
async fn sustained_load_trips_ceiling_then_recovers_on_deactivation() {
    let h = harness(
        GuardConfig {
            rate_ceiling: 500,
            baseline_rps: 1_000_000.0,
            ..Default::default()
        },
        TokenConfig {
            signing_key: signing_key(),
            ..Default::default()
        },
    );

    // 1000 identical messages, each freshly signed so sequences strictly
    // increase. Exactly the first 500 clear the ceiling.
    let token = h.tokens.issue("agent-1", "worker", Permissions::SEND).unwrap();
    let mut accepted = 0u32;
    let mut rate_limited = 0u32;
    for _ in 0..1000 {
        let message = b"burst";
        let sig = h.integrity.sign(message).unwrap();
        match h
            .pipeline
            .check_message("10.0.0.1", &token, message, &sig, Permissions::SEND)
        {
            Ok(_) => accepted += 1,
            Err(FabricError::RateLimited(_)) => rate_limited += 1,
            Err(other) => panic!("unexpected rejection: {other:?}"),
        }
    }
    assert_eq!(accepted, 500);
    assert_eq!(rate_limited, 500);
    assert_eq!(h.stats.snapshot().rate_limited, 500);

    // Deactivation wipes traffic state, but the replay watermark reset
    // means the subject also starts a fresh sequence, so a new signature
    // from the shared signer still verifies.
    h.pipeline.deactivate_subject("agent-1");
    let message = b"clean slate";
    let sig = h.integrity.sign(message).unwrap();
    h.pipeline
        .check_message("10.0.0.1", &token, message, &sig, Permissions::SEND)
        .unwrap();
}

#[tokio::test]
async fn replayed_signature_rejected() {
    let h = harness(
        GuardConfig {
            rate_ceiling: 100,
            baseline_rps: 1_000_000.0,
            ..Default::default()
        },
        TokenConfig {
            signing_key: signing_key(),
            ..Default::default()
        },
    );

    let token = h.tokens.issue("agent-1", "worker", Permissions::SEND).unwrap();
    let message = b"pay 100 credits";
    let sig = h.integrity.sign(message).unwrap();

    h.pipeline
        .check_message("10.0.0.1", &token, message, &sig, Permissions::SEND)
        .unwrap();

    // Same bytes again: the watermark has moved past this sequence.
    let err = h
        .pipeline
        .check_message("10.0.0.1", &token, message, &sig, Permissions::SEND)
        .unwrap_err();
    assert!(matches!(err, FabricError::IntegrityViolation(_)));
    assert_eq!(h.stats.snapshot().integrity_failures, 1);
}

#[tokio::test]
async fn invalid_token_short_circuits_before_integrity() {
    let h = harness(
        GuardConfig::default(),
        TokenConfig {
            signing_key: signing_key(),
            ..Default::default()
        },
    );

    let err = h
        .pipeline
        .check_message(
            "10.0.0.1",
            "bogus.token.here",
            b"m",
            &[0u8; SIGNATURE_LENGTH],
            Permissions::SEND,
        )
        .unwrap_err();
    assert!(matches!(err, FabricError::InvalidToken(_)));

    // The garbage signature was never inspected.
    let snap = h.stats.snapshot();
    assert_eq!(snap.integrity_failures, 0);
    assert_eq!(snap.messages_verified, 0);
}

#[tokio::test]
async fn audit_trail_sequences_monotonically() {
    let h = harness(
        GuardConfig {
            rate_ceiling: 2,
            baseline_rps: 1_000_000.0,
            ..Default::default()
        },
        TokenConfig {
            signing_key: signing_key(),
            ..Default::default()
        },
    );

    // Generate a mix of rejections: bad token, missing permission,
    // rate-limit trips.
    let _ = h.pipeline.check_message(
        "10.0.0.1",
        "junk",
        b"m",
        &[0u8; SIGNATURE_LENGTH],
        Permissions::SEND,
    );

    let token = h.tokens.issue("agent-1", "worker", Permissions::SEND).unwrap();
    let message = b"m";
    let sig = h.integrity.sign(message).unwrap();
    let _ = h
        .pipeline
        .check_message("10.0.0.1", &token, message, &sig, Permissions::ADMIN);

    for _ in 0..4 {
        let message = b"m";
        let sig = h.integrity.sign(message).unwrap();
        let _ = h
            .pipeline
            .check_message("10.0.0.1", &token, message, &sig, Permissions::SEND);
    }

    // Let the background writer drain.
    sleep(Duration::from_millis(100)).await;

    let events = h.sink.events();
    assert!(events.len() >= 4, "expected several audit events, got {}", events.len());
    for pair in events.windows(2) {
        assert!(
            pair[1].sequence > pair[0].sequence,
            "audit sequence regressed: {} then {}",
            pair[0].sequence,
            pair[1].sequence
        );
    }
    assert_eq!(h.stats.snapshot().audit_events, events.len() as u64);
}

#[tokio::test]
async fn wrong_key_signature_rejected_and_audited() {
    let h = harness(
        GuardConfig::default(),
        TokenConfig {
            signing_key: signing_key(),
            ..Default::default()
        },
    );

    let token = h.tokens.issue("agent-1", "worker", Permissions::SEND).unwrap();
    let imposter = MessageIntegrity::new(vec![0xDD; 32]);
    let message = b"forged";
    let sig = imposter.sign(message).unwrap();

    let err = h
        .pipeline
        .check_message("10.0.0.1", &token, message, &sig, Permissions::SEND)
        .unwrap_err();
    assert!(matches!(err, FabricError::IntegrityViolation(_)));

    sleep(Duration::from_millis(100)).await;
    let events = h.sink.events();
    assert!(events
        .iter()
        .any(|e| e.action == "verify_signature" && e.subject.as_deref() == Some("agent-1")));
}
