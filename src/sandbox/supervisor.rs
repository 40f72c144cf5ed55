//! Background lifecycle supervisor.
//!
//! A single task per service: evicts idle sessions, probes session health,
//! and emits per-pass telemetry. It never creates sessions, and it holds no
//! long-term locks; each close goes through the backend's own
//! per-session serialization.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::ChatBackend;

/// Supervisor settings.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    /// Eviction threshold: sessions idle longer than this are closed.
    pub idle_timeout: Duration,
    /// Pass period.
    pub sweep_interval: Duration,
}

/// Counters from one supervisor pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub live: usize,
    pub evicted: usize,
    pub failed: usize,
}

/// Spawn the supervisor task. Aborts when the handle is dropped by the
/// caller at shutdown.
pub fn start(backend: Arc<dyn ChatBackend>, config: SupervisorConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        // The first tick fires immediately; skip it so a freshly started
        // service doesn't sweep before anything exists.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let stats = sweep(backend.as_ref(), config.idle_timeout).await;
            info!(
                live = stats.live,
                evicted = stats.evicted,
                failed = stats.failed,
                "supervisor pass complete"
            );
        }
    })
}

/// One supervisor pass over a snapshot of live sessions.
pub async fn sweep(backend: &dyn ChatBackend, idle_timeout: Duration) -> SweepStats {
    let sessions = backend.list_sessions().await;
    let now = Utc::now();

    let mut stats = SweepStats {
        live: sessions.len(),
        ..SweepStats::default()
    };

    for session in sessions {
        if !session.status.is_live() {
            continue;
        }

        if is_idle(&session.last_activity_at, now, idle_timeout) {
            // Idle eviction releases the container and ports but retains the
            // workspace so the session can reattach later.
            match backend.close_session(&session.id, "idle").await {
                Ok(()) => {
                    info!(session_id = %session.id, "evicted idle session");
                    stats.evicted += 1;
                }
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "idle eviction failed");
                    stats.failed += 1;
                }
            }
            continue;
        }

        if let Err(e) = backend.probe_session(&session.id).await {
            // probe_session already drove the close; count it
            warn!(session_id = %session.id, error = %e, "session failed health probing");
            stats.failed += 1;
        }
    }

    stats
}

fn is_idle(last_activity_at: &str, now: DateTime<Utc>, idle_timeout: Duration) -> bool {
    let Ok(last) = DateTime::parse_from_rfc3339(last_activity_at) else {
        // Unparseable timestamps never block eviction forever
        return true;
    };

    let elapsed = now.signed_duration_since(last.with_timezone(&Utc));
    elapsed.num_milliseconds() > idle_timeout.as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_idle() {
        let now = Utc::now();
        let fresh = now.to_rfc3339();
        let stale = (now - chrono::Duration::seconds(120)).to_rfc3339();

        assert!(!is_idle(&fresh, now, Duration::from_secs(60)));
        assert!(is_idle(&stale, now, Duration::from_secs(60)));
        assert!(!is_idle(&stale, now, Duration::from_secs(600)));
    }

    #[test]
    fn test_garbage_timestamp_counts_as_idle() {
        assert!(is_idle("not-a-timestamp", Utc::now(), Duration::from_secs(60)));
    }
}
