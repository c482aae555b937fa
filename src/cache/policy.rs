//! Refresh policy: decides between no-op, incremental and full refresh.
//!
//! Age is checked first. A cache with no full refresh on record, or one
//! older than the max age, always gets a full refresh. Otherwise a cheap
//! activity probe (one single-record page per kind) compares remote totals
//! with the last recorded ones.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{ActivityCounts, CacheMetadata, EntityKind};
use crate::error::SyncResult;
use crate::helpdesk::HelpdeskSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PolicyState {
    Fresh,
    StaleCheckNeeded,
    ForceFull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshAction {
    None,
    Incremental,
    Full,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Observed(ActivityCounts),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshDecision {
    pub state: PolicyState,
    pub action: RefreshAction,
    /// Totals seen by the probe, when it ran and succeeded.
    pub observed: Option<ActivityCounts>,
}

/// Age-only assessment; no network.
pub fn assess(
    metadata: &CacheMetadata,
    now: DateTime<Utc>,
    max_age: chrono::Duration,
) -> PolicyState {
    match metadata.last_full_refresh {
        None => PolicyState::ForceFull,
        Some(at) if now - at > max_age => PolicyState::ForceFull,
        Some(_) => PolicyState::StaleCheckNeeded,
    }
}

/// Map a probe result onto an action. A failed probe counts as activity.
pub fn decide_after_probe(recorded: &ActivityCounts, probe: &ProbeOutcome) -> RefreshAction {
    match probe {
        ProbeOutcome::Observed(observed) if observed.exceeds(recorded) => {
            RefreshAction::Incremental
        }
        ProbeOutcome::Observed(_) => RefreshAction::None,
        ProbeOutcome::Failed(_) => RefreshAction::Incremental,
    }
}

/// Probe the three counted kinds concurrently.
pub async fn probe_activity(source: &dyn HelpdeskSource) -> ProbeOutcome {
    let probe = |kind: EntityKind| async move {
        let total = source.probe_total(&kind.probe_path()).await?;
        SyncResult::Ok((kind, total))
    };

    let result = tokio::try_join!(
        probe(EntityKind::Contacts),
        probe(EntityKind::Companies),
        probe(EntityKind::Conversations),
    );

    match result {
        Ok((a, b, c)) => {
            let mut counts = ActivityCounts::default();
            for (kind, total) in [a, b, c] {
                counts.set(kind, total);
            }
            ProbeOutcome::Observed(counts)
        }
        Err(e) => {
            log::warn!("Refresh policy: activity probe failed, assuming changes: {}", e);
            ProbeOutcome::Failed(e.to_string())
        }
    }
}

/// Full decision: age check, then probe when needed.
pub async fn decide(
    source: &dyn HelpdeskSource,
    metadata: &CacheMetadata,
    now: DateTime<Utc>,
    max_age: chrono::Duration,
) -> RefreshDecision {
    let state = assess(metadata, now, max_age);
    if state == PolicyState::ForceFull {
        return RefreshDecision {
            state,
            action: RefreshAction::Full,
            observed: None,
        };
    }

    let probe = probe_activity(source).await;
    let action = decide_after_probe(&metadata.last_activity, &probe);
    let observed = match probe {
        ProbeOutcome::Observed(counts) => Some(counts),
        ProbeOutcome::Failed(_) => None,
    };
    RefreshDecision {
        state: if action == RefreshAction::None {
            PolicyState::Fresh
        } else {
            PolicyState::StaleCheckNeeded
        },
        action,
        observed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use async_trait::async_trait;
    use serde_json::Value;

    struct ProbeSource {
        totals: Option<ActivityCounts>,
    }

    #[async_trait]
    impl HelpdeskSource for ProbeSource {
        async fn fetch_pages(
            &self,
            _path: &str,
            _keys: &[&str],
            _max_pages: Option<usize>,
        ) -> SyncResult<Vec<Value>> {
            panic!("policy must not page");
        }

        async fn probe_total(&self, path: &str) -> SyncResult<u64> {
            let totals = self
                .totals
                .ok_or_else(|| SyncError::Transport("offline".into()))?;
            let kind: EntityKind = crate::helpdesk::pagination::strip_query(path)
                .trim_start_matches('/')
                .parse()
                .map_err(SyncError::MalformedResponse)?;
            assert!(path.ends_with("per_page=1"));
            Ok(totals.get(kind))
        }

        async fn fetch_detail(&self, _kind: &str, _id: &str) -> SyncResult<Value> {
            panic!("policy must not fetch details");
        }
    }

    fn metadata(hours_ago: Option<i64>, now: DateTime<Utc>) -> CacheMetadata {
        CacheMetadata {
            last_full_refresh: hours_ago.map(|h| now - chrono::Duration::hours(h)),
            last_activity: ActivityCounts {
                contacts: 10,
                companies: 2,
                conversations: 30,
            },
            ..CacheMetadata::default()
        }
    }

    #[test]
    fn test_assess_age_boundaries() {
        let now = Utc::now();
        let max_age = chrono::Duration::hours(24);
        assert_eq!(assess(&metadata(None, now), now, max_age), PolicyState::ForceFull);
        assert_eq!(assess(&metadata(Some(25), now), now, max_age), PolicyState::ForceFull);
        assert_eq!(
            assess(&metadata(Some(24), now), now, max_age),
            PolicyState::StaleCheckNeeded
        );
        assert_eq!(
            assess(&metadata(Some(1), now), now, max_age),
            PolicyState::StaleCheckNeeded
        );
    }

    #[test]
    fn test_decide_after_probe() {
        let recorded = ActivityCounts {
            contacts: 10,
            companies: 2,
            conversations: 30,
        };
        let same = ProbeOutcome::Observed(recorded);
        assert_eq!(decide_after_probe(&recorded, &same), RefreshAction::None);

        let grown = ProbeOutcome::Observed(ActivityCounts {
            companies: 3,
            ..recorded
        });
        assert_eq!(decide_after_probe(&recorded, &grown), RefreshAction::Incremental);

        let failed = ProbeOutcome::Failed("timeout".into());
        assert_eq!(decide_after_probe(&recorded, &failed), RefreshAction::Incremental);
    }

    #[tokio::test]
    async fn test_decide_old_cache_skips_probe() {
        let now = Utc::now();
        // Would panic via fetch_pages/fetch_detail, and probe_total errors if called
        let source = ProbeSource { totals: None };
        let decision = decide(&source, &metadata(Some(25), now), now, chrono::Duration::hours(24)).await;
        assert_eq!(decision.action, RefreshAction::Full);
        assert_eq!(decision.state, PolicyState::ForceFull);
        assert_eq!(decision.observed, None);
    }

    #[tokio::test]
    async fn test_decide_recent_cache_same_counts_is_noop() {
        let now = Utc::now();
        let meta = metadata(Some(1), now);
        let source = ProbeSource {
            totals: Some(meta.last_activity),
        };
        let decision = decide(&source, &meta, now, chrono::Duration::hours(24)).await;
        assert_eq!(decision.action, RefreshAction::None);
        assert_eq!(decision.state, PolicyState::Fresh);
        assert_eq!(decision.observed, Some(meta.last_activity));
    }

    #[tokio::test]
    async fn test_decide_recent_cache_new_activity_is_incremental() {
        let now = Utc::now();
        let meta = metadata(Some(1), now);
        let source = ProbeSource {
            totals: Some(ActivityCounts {
                conversations: 31,
                ..meta.last_activity
            }),
        };
        let decision = decide(&source, &meta, now, chrono::Duration::hours(24)).await;
        assert_eq!(decision.action, RefreshAction::Incremental);
        assert_eq!(decision.observed.map(|o| o.conversations), Some(31));
    }

    #[tokio::test]
    async fn test_decide_probe_failure_is_incremental() {
        let now = Utc::now();
        let source = ProbeSource { totals: None };
        let decision = decide(&source, &metadata(Some(1), now), now, chrono::Duration::hours(24)).await;
        assert_eq!(decision.action, RefreshAction::Incremental);
        assert_eq!(decision.observed, None);
    }
}
