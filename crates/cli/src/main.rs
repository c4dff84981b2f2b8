use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use unpin_controller::{Controller, ControllerConfig};
use unpin_core::Scope;
use unpin_kubehub::{connect, CredentialChain, KubeClient};
use unpin_reconcile::StripPolicy;

#[derive(Parser, Debug)]
#[command(name = "unpin", version, about = "Keep node affinity out of Deployment pod templates")]
struct Cli {
    /// Kubeconfig file (default: $HOME/.kube/config); in-cluster credentials are tried next
    #[arg(long = "kubeconfig", env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Namespace to watch, or "all"
    #[arg(long = "namespace", short = 'n', env = "UNPIN_NAMESPACE", default_value = "all")]
    namespace: Scope,

    /// Periodic resync interval in seconds (0 disables)
    #[arg(long = "resync-secs")]
    resync_secs: Option<u64>,

    /// Give up if the initial list has not completed within this many seconds
    #[arg(long = "sync-timeout-secs")]
    sync_timeout_secs: Option<u64>,

    /// Maximum concurrent reconciles across different deployments
    #[arg(long = "concurrency")]
    concurrency: Option<usize>,

    /// What to remove: node-affinity or whole-affinity
    #[arg(long = "strip-policy")]
    strip_policy: Option<StripPolicy>,

    /// Do not reconcile on Added notifications (updates and resyncs still do)
    #[arg(long = "ignore-added", action = ArgAction::SetTrue)]
    ignore_added: bool,
}

impl Cli {
    fn config(&self) -> ControllerConfig {
        let mut cfg = ControllerConfig::from_env();
        if let Some(s) = self.resync_secs {
            cfg.resync_period = Duration::from_secs(s);
        }
        if let Some(s) = self.sync_timeout_secs {
            cfg.sync_timeout = Duration::from_secs(s);
        }
        if let Some(n) = self.concurrency {
            cfg.concurrency = n.max(1);
        }
        if let Some(p) = self.strip_policy {
            cfg.policy = p;
        }
        if self.ignore_added {
            cfg.triggers.on_add = false;
        }
        cfg
    }

    fn kubeconfig_path(&self) -> Option<PathBuf> {
        self.kubeconfig.clone().or_else(|| dirs::home_dir().map(|h| h.join(".kube").join("config")))
    }
}

/// Default filter: our crates at info, the kube client stack only when it warns.
const DEFAULT_LOG: &str = "info,kube_client=warn,hyper=warn,tower=warn";

fn init_tracing() {
    let env = std::env::var("UNPIN_LOG").unwrap_or_else(|_| DEFAULT_LOG.to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

/// Install the Prometheus exporter when `UNPIN_METRICS_ADDR` is set and
/// describe the counters the controller emits.
fn init_metrics() {
    let Ok(addr) = std::env::var("UNPIN_METRICS_ADDR") else { return };
    let Ok(sock) = addr.parse::<std::net::SocketAddr>() else {
        warn!(addr = %addr, "invalid UNPIN_METRICS_ADDR; expected host:port");
        return;
    };
    if let Err(e) = metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
        warn!(error = %e, "failed to install metrics exporter");
        return;
    }
    for (name, help) in COUNTERS {
        metrics::describe_counter!((*name), (*help));
    }
    info!(addr = %addr, counters = COUNTERS.len(), "Prometheus metrics exporter listening");
}

const COUNTERS: &[(&str, &str)] = &[
    ("feed_relists", "Full lists of Deployments"),
    ("feed_reconnects", "Watch streams reopened after a close, failure or expired cursor"),
    ("feed_malformed_events", "Undecodable watch events skipped"),
    ("dispatch_handler_errors", "Handler invocations that failed or panicked"),
    ("reconcile_corrected", "Deployments whose node affinity was removed"),
    ("reconcile_conflicts", "Corrections rejected because the snapshot was stale"),
    ("reconcile_failures", "Corrections that failed for any other reason"),
];

/// Cancel `token` on ctrl-c or SIGTERM.
fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        let term = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut s) => {
                    s.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "cannot listen for SIGTERM");
                    std::future::pending::<()>().await;
                }
            }
        };
        #[cfg(not(unix))]
        let term = std::future::pending::<()>();

        tokio::select! {
            r = signal::ctrl_c() => {
                if let Err(e) = r {
                    warn!(error = %e, "cannot listen for ctrl-c");
                    return;
                }
                info!("interrupt received; shutting down");
            }
            _ = term => info!("terminate received; shutting down"),
        }
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = cli.config();

    let chain = CredentialChain::standard(cli.kubeconfig_path());
    let client = connect(&chain).await.context("connecting to the cluster")?;
    let client = KubeClient::new(client, cli.namespace.clone()).with_watch_timeout(cfg.watch_timeout_secs);
    info!(scope = %cli.namespace, policy = %cfg.policy, on_add = cfg.triggers.on_add, "unpin starting");

    let mut controller = Controller::new(Arc::new(client), cfg);
    controller.register_stripper();

    let stop = CancellationToken::new();
    cancel_on_signal(stop.clone());
    controller.run_until(stop).await.context("controller failed")?;
    info!("unpin exited");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse_and_override() {
        let cli = Cli::try_parse_from([
            "unpin",
            "--namespace",
            "team-a",
            "--resync-secs",
            "30",
            "--strip-policy",
            "whole-affinity",
            "--ignore-added",
        ])
        .expect("valid flags");
        assert_eq!(cli.namespace, Scope::Namespace("team-a".into()));
        let cfg = cli.config();
        assert_eq!(cfg.resync_period, Duration::from_secs(30));
        assert_eq!(cfg.policy, StripPolicy::WholeAffinity);
        assert!(!cfg.triggers.on_add);
        assert!(cfg.triggers.on_update);
    }

    #[test]
    fn kubeconfig_flag_wins_over_home() {
        let cli = Cli::try_parse_from(["unpin", "--kubeconfig", "/tmp/kc"]).expect("valid flags");
        assert_eq!(cli.kubeconfig_path(), Some(PathBuf::from("/tmp/kc")));
    }

    #[test]
    fn rejects_unknown_policy() {
        assert!(Cli::try_parse_from(["unpin", "--strip-policy", "everything"]).is_err());
    }

    #[test]
    fn default_filter_parses_and_counters_are_distinct() {
        assert!(tracing_subscriber::EnvFilter::from_str(DEFAULT_LOG).is_ok());
        let mut names: Vec<_> = COUNTERS.iter().map(|(n, _)| *n).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), COUNTERS.len());
    }
}
