use std::str::FromStr;
use std::time::Duration;

use unpin_kubehub::MAX_WATCH_TIMEOUT_SECS;
use unpin_reconcile::{StripPolicy, Triggers};

/// Runtime knobs. `from_env` reads `UNPIN_*` variables; the binary then
/// overrides whatever was given on the command line.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Zero disables periodic resync.
    pub resync_period: Duration,
    pub sync_timeout: Duration,
    pub backoff_max: Duration,
    pub watch_timeout_secs: u32,
    pub concurrency: usize,
    pub queue_cap: usize,
    /// How long shutdown waits for the feed and for in-flight handlers.
    pub grace: Duration,
    pub policy: StripPolicy,
    pub triggers: Triggers,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            resync_period: Duration::ZERO,
            sync_timeout: Duration::from_secs(60),
            backoff_max: Duration::from_secs(30),
            watch_timeout_secs: MAX_WATCH_TIMEOUT_SECS,
            concurrency: 4,
            queue_cap: 2048,
            grace: Duration::from_secs(5),
            policy: StripPolicy::default(),
            triggers: Triggers::default(),
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    /// Build from an arbitrary variable source; unset or unparsable values
    /// fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let get = |key: &str| lookup(key).and_then(|s| s.trim().parse::<u64>().ok());
        let secs = |key: &str, dflt: Duration| get(key).map(Duration::from_secs).unwrap_or(dflt);
        Self {
            resync_period: secs("UNPIN_RESYNC_SECS", d.resync_period),
            sync_timeout: secs("UNPIN_SYNC_TIMEOUT_SECS", d.sync_timeout),
            backoff_max: secs("UNPIN_WATCH_BACKOFF_MAX_SECS", d.backoff_max),
            watch_timeout_secs: get("UNPIN_WATCH_TIMEOUT_SECS")
                .map(|s| s.clamp(1, MAX_WATCH_TIMEOUT_SECS as u64) as u32)
                .unwrap_or(d.watch_timeout_secs),
            concurrency: get("UNPIN_CONCURRENCY").map(|n| n.max(1) as usize).unwrap_or(d.concurrency),
            queue_cap: get("UNPIN_QUEUE_CAP").map(|n| n.max(1) as usize).unwrap_or(d.queue_cap),
            grace: secs("UNPIN_GRACE_SECS", d.grace),
            policy: lookup("UNPIN_STRIP_POLICY").and_then(|s| StripPolicy::from_str(&s).ok()).unwrap_or(d.policy),
            triggers: d.triggers,
        }
    }
}
