//! Inbound message guard.
//!
//! Every fabric message passes the same gauntlet, in a fixed order:
//! abuse scoring on the network origin, credential validation (cache
//! first), permission check, integrity verification, then per-subject
//! rate limiting. The abuse scorer runs first and keys on the origin,
//! not the credential, so floods that never present a valid token are
//! still scored and blocked. Each rejection produces an audit event.

mod integrity;
mod ratelimit;
mod threat;

pub use integrity::{MessageIntegrity, NONCE_LENGTH, SIGNATURE_LENGTH};
pub use ratelimit::{RateLimitConfig, RateLimiter};
pub use threat::{ThreatConfig, ThreatMonitor};

use crate::audit::{AuditCategory, AuditEvent, AuditLogger, AuditOutcome, AuditSeverity};
use crate::auth::{AuthCache, AuthContext, Permissions, TokenService};
use crate::config::GuardConfig;
use crate::error::{FabricError, Result};
use crate::events::{EventBus, FabricEvent};
use crate::stats::FabricStats;
use std::sync::Arc;
use tracing::debug;

/// The assembled guard pipeline.
pub struct GuardPipeline {
    tokens: Arc<TokenService>,
    cache: Arc<AuthCache>,
    integrity: Arc<MessageIntegrity>,
    rate_limiter: RateLimiter,
    threat_monitor: ThreatMonitor,
    audit: Arc<AuditLogger>,
    events: Arc<EventBus>,
    stats: Arc<FabricStats>,
}

impl GuardPipeline {
    pub fn new(
        config: &GuardConfig,
        tokens: Arc<TokenService>,
        cache: Arc<AuthCache>,
        integrity: Arc<MessageIntegrity>,
        audit: Arc<AuditLogger>,
        events: Arc<EventBus>,
        stats: Arc<FabricStats>,
    ) -> Self {
        let rate_limiter = RateLimiter::new(RateLimitConfig {
            window: config.rate_window,
            max_requests: config.rate_ceiling as u64,
            block_duration: config.rate_block_duration,
            shards: config.rate_buckets,
        });
        let threat_monitor = ThreatMonitor::new(ThreatConfig {
            window: config.abuse_window,
            baseline_rps: config.baseline_rps,
            score_threshold: config.abuse_threshold_multiplier,
            block_duration: config.abuse_block_duration,
        });

        Self {
            tokens,
            cache,
            integrity,
            rate_limiter,
            threat_monitor,
            audit,
            events,
            stats,
        }
    }

    /// Run the full gauntlet for one inbound message. `origin` is the
    /// network source of the message (address or transport peer name),
    /// independent of whatever identity the token claims. Returns the
    /// authenticated context on success.
    pub fn check_message(
        &self,
        origin: &str,
        token: &str,
        message: &[u8],
        signature: &[u8],
        required: Permissions,
    ) -> Result<AuthContext> {
        // The abuse scorer sees every arrival, authenticated or not. A
        // flood of garbage credentials never reaches validation once the
        // origin is blocked.
        if let Err(e) = self.threat_monitor.record(origin) {
            self.stats.record_threat_detected();
            if let FabricError::AbuseDetected { score, .. } = e {
                self.events.publish(FabricEvent::ThreatDetected {
                    origin: origin.to_string(),
                    score,
                });
            }
            self.audit.log(
                AuditEvent::builder(AuditCategory::Threat, "traffic_anomaly")
                    .severity(AuditSeverity::Critical)
                    .outcome(AuditOutcome::Denied)
                    .subject(origin)
                    .detail("origin over abuse threshold"),
            );
            return Err(e);
        }

        let context = self.authenticate(token)?;
        let subject = context.subject.clone();

        if !context.has_permission(required) {
            self.reject_auth(&subject, "permission_denied", AuditCategory::Authorization);
            return Err(FabricError::PermissionDenied(subject));
        }

        if let Err(e) = self.integrity.verify(&subject, message, signature) {
            self.stats.record_integrity_failure();
            self.audit.log(
                AuditEvent::builder(AuditCategory::Integrity, "verify_signature")
                    .severity(AuditSeverity::Critical)
                    .outcome(AuditOutcome::Denied)
                    .subject(&subject)
                    .detail(e.to_string()),
            );
            return Err(e);
        }
        self.stats.record_message_verified();

        if let Err(e) = self.rate_limiter.check(&subject) {
            self.stats.record_rate_limited();
            self.events.publish(FabricEvent::RateLimitTripped {
                subject: subject.clone(),
            });
            self.audit.log(
                AuditEvent::builder(AuditCategory::RateLimit, "request_ceiling")
                    .severity(AuditSeverity::Warning)
                    .outcome(AuditOutcome::Denied)
                    .subject(&subject),
            );
            return Err(e);
        }

        debug!(subject = %subject, origin = %origin, "Message passed guard pipeline");
        Ok(context)
    }

    /// Validate a credential, preferring the cache.
    pub fn authenticate(&self, token: &str) -> Result<AuthContext> {
        if let Some(context) = self.cache.get(token) {
            self.stats.record_auth_cache_hit();
            return Ok(context);
        }
        self.stats.record_auth_cache_miss();

        match self.tokens.validate(token) {
            Ok(context) => {
                self.stats.record_token_validated();
                self.cache.insert(token, context.clone());
                Ok(context)
            }
            Err(e) => {
                self.reject_auth("unknown", &e.to_string(), AuditCategory::Authentication);
                Err(e)
            }
        }
    }

    /// Deactivate a subject: evict its cached credentials and clear its
    /// traffic state so a re-admitted subject starts clean. Abuse state
    /// is keyed by network origin, not subject, and is untouched here;
    /// see [`GuardPipeline::clear_origin`].
    pub fn deactivate_subject(&self, subject: &str) {
        self.cache.invalidate_subject(subject);
        self.rate_limiter.reset(subject);
        self.integrity.reset_origin(subject);
        self.audit.log(
            AuditEvent::builder(AuditCategory::Authorization, "deactivate_subject")
                .severity(AuditSeverity::Warning)
                .subject(subject),
        );
    }

    /// Operator override: drop an origin's abuse history and any block.
    pub fn clear_origin(&self, origin: &str) {
        self.threat_monitor.reset(origin);
        self.audit.log(
            AuditEvent::builder(AuditCategory::Threat, "clear_origin")
                .severity(AuditSeverity::Warning)
                .subject(origin),
        );
    }

    fn reject_auth(&self, subject: &str, reason: &str, category: AuditCategory) {
        self.stats.record_auth_failure();
        self.events.publish(FabricEvent::AuthRejected {
            subject: subject.to_string(),
            reason: reason.to_string(),
        });
        self.audit.log(
            AuditEvent::builder(category, "validate_credential")
                .severity(AuditSeverity::Warning)
                .outcome(AuditOutcome::Denied)
                .subject(subject)
                .detail(reason),
        );
    }
}
