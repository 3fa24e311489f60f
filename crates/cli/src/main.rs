use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use kube::{api::Api, core::GroupVersionKind, Client};
use serde::Serialize;
use tandem_apply::{SsaApplicator, DEFAULT_FIELD_MANAGER};
use tandem_core::{ClientApplicator, ObjectStore, WaitTiers};
use tandem_kubehub::{client_for, crd_established, discover, find_api_resource, parse_gvk_key, ClusterConfig, KubeStore};
use tandem_reconcile::{ApiFinalizer, ClaimReconciler, DynamicInstanceSet, ExtensionReconciler, DEFAULT_FINALIZER};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "tandem", version, about = "Keeps claims and extension resources in sync between a local and a remote cluster")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(flatten)]
    clusters: ClusterArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Side { Local, Remote }

#[derive(Args, Debug)]
struct ClusterArgs {
    /// Kubeconfig of the local (management) cluster; in-cluster/default when unset
    #[arg(long = "local-kubeconfig", env = "TANDEM_LOCAL_KUBECONFIG", global = true)]
    local_kubeconfig: Option<PathBuf>,
    #[arg(long = "local-context", env = "TANDEM_LOCAL_CONTEXT", global = true)]
    local_context: Option<String>,
    /// Kubeconfig of the remote (target) cluster
    #[arg(long = "remote-kubeconfig", env = "TANDEM_REMOTE_KUBECONFIG", global = true)]
    remote_kubeconfig: Option<PathBuf>,
    #[arg(long = "remote-context", env = "TANDEM_REMOTE_CONTEXT", global = true)]
    remote_context: Option<String>,
}

impl ClusterArgs {
    fn cluster(&self, side: Side) -> ClusterConfig {
        match side {
            Side::Local => ClusterConfig { kubeconfig: self.local_kubeconfig.clone(), context: self.local_context.clone() },
            Side::Remote => ClusterConfig { kubeconfig: self.remote_kubeconfig.clone(), context: self.remote_context.clone() },
        }
    }

    async fn client(&self, side: Side) -> Result<Client> {
        client_for(&self.cluster(side)).await.with_context(|| format!("connecting to {:?} cluster", side))
    }
}

/// `<gvk>=<crd-name>`, e.g. `apiextensions.crossplane.io/v1/Composition=compositions.apiextensions.crossplane.io`
#[derive(Clone, Debug)]
struct ExtensionTarget {
    gvk: GroupVersionKind,
    crd: String,
}

impl FromStr for ExtensionTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (gvk, crd) = s.split_once('=').ok_or_else(|| format!("expected <gvk>=<crd-name>, got {}", s))?;
        let gvk = parse_gvk_key(gvk.trim()).map_err(|e| e.to_string())?;
        let crd = crd.trim();
        if crd.is_empty() {
            return Err(format!("missing CRD name in {}", s));
        }
        Ok(Self { gvk, crd: crd.to_string() })
    }
}

#[derive(Args, Debug)]
struct AgentArgs {
    /// Kind whose local objects are claims, e.g. "example.org/v1alpha1/Bucket" (repeatable)
    #[arg(long = "claim", env = "TANDEM_CLAIMS", value_delimiter = ',')]
    claims: Vec<String>,
    /// Extension kind and its CRD, "<gvk>=<crd-name>" (repeatable)
    #[arg(long = "extension", env = "TANDEM_EXTENSIONS", value_delimiter = ',')]
    extensions: Vec<ExtensionTarget>,
    /// Server-side apply field manager
    #[arg(long = "field-manager", env = "TANDEM_FIELD_MANAGER", default_value = DEFAULT_FIELD_MANAGER)]
    field_manager: String,
    /// Finalizer placed on local claims
    #[arg(long = "finalizer", env = "TANDEM_FINALIZER", default_value = DEFAULT_FINALIZER)]
    finalizer: String,
    #[arg(long = "wait-tiny-secs", env = "TANDEM_WAIT_TINY_SECS", default_value_t = 3)]
    wait_tiny_secs: u64,
    #[arg(long = "wait-short-secs", env = "TANDEM_WAIT_SHORT_SECS", default_value_t = 30)]
    wait_short_secs: u64,
    #[arg(long = "wait-long-secs", env = "TANDEM_WAIT_LONG_SECS", default_value_t = 60)]
    wait_long_secs: u64,
    /// Extension garbage-collection sweep period; defaults to the long wait, 0 disables
    #[arg(long = "resync-secs", env = "TANDEM_RESYNC_SECS")]
    resync_secs: Option<u64>,
}

impl AgentArgs {
    fn waits(&self) -> Result<WaitTiers> {
        Ok(WaitTiers::from_secs(self.wait_tiny_secs, self.wait_short_secs, self.wait_long_secs)?)
    }

    fn resync(&self, waits: &WaitTiers) -> Option<Duration> {
        match self.resync_secs {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(waits.long),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the configured controllers until SIGINT/SIGTERM
    Run(AgentArgs),
    /// Discover served resources (incl. CRDs) of one cluster
    Discover {
        #[arg(long = "cluster", value_enum, default_value_t = Side::Local)]
        cluster: Side,
    },
    /// Verify connectivity, configured kinds and CRD readiness
    Check(AgentArgs),
}

fn init_tracing() {
    let env = std::env::var("TANDEM_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TANDEM_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid TANDEM_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run(args) => run_agent(&cli.clusters, args).await?,
        Commands::Discover { cluster } => {
            info!(cluster = ?cluster, "discover invoked");
            let client = cli.clusters.client(*cluster).await?;
            let resources = discover(client).await.context("discovery failed")?;
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        let gv = if r.group.is_empty() { r.version.clone() } else { format!("{}/{}", r.group, r.version) };
                        println!("{} • {} • {}", gv, r.kind, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
        Commands::Check(args) => check(&cli.clusters, args, cli.output).await?,
    }

    Ok(())
}

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

async fn run_agent(clusters: &ClusterArgs, args: &AgentArgs) -> Result<()> {
    let waits = args.waits()?;
    let resync = args.resync(&waits);
    if args.claims.is_empty() && args.extensions.is_empty() {
        bail!("nothing to run: pass at least one --claim or --extension");
    }
    let local_client = clusters.client(Side::Local).await?;
    let remote_client = clusters.client(Side::Remote).await?;

    let local_store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(local_client.clone()));
    let remote_store: Arc<dyn ObjectStore> = Arc::new(KubeStore::new(remote_client.clone()));
    let local = ClientApplicator::new(local_store.clone(), Arc::new(SsaApplicator::new(local_client.clone(), &args.field_manager)));
    let remote = ClientApplicator::new(remote_store.clone(), Arc::new(SsaApplicator::new(remote_client.clone(), &args.field_manager)));

    let mut controllers: Vec<ControllerFuture> = Vec::new();
    for key in &args.claims {
        let gvk = parse_gvk_key(key)?;
        let (ar, _) = find_api_resource(local_client.clone(), &gvk)
            .await
            .with_context(|| format!("resolving claim kind {} on the local cluster", key))?;
        let finalizer = Arc::new(ApiFinalizer::new(local_store.clone(), ar.clone(), args.finalizer.as_str()));
        let reconciler = ClaimReconciler::builder(local_store.clone(), remote.clone(), ar.clone())
            .finalizer(finalizer)
            .waits(waits)
            .build();
        let api = Api::all_with(local_client.clone(), &ar);
        controllers.push(Box::pin(tandem_reconcile::run(api, ar, Arc::new(reconciler), None)));
    }
    for ext in &args.extensions {
        // The CRD may not be installed locally yet; the kind is resolved where it is served.
        let (ar, _) = find_api_resource(remote_client.clone(), &ext.gvk)
            .await
            .with_context(|| format!("resolving extension kind {} on the remote cluster", ext.gvk.kind))?;
        let instances = Arc::new(DynamicInstanceSet::new(ar.clone()));
        let reconciler = ExtensionReconciler::new(local.clone(), remote_store.clone(), instances, ext.crd.as_str(), waits);
        let api = Api::all_with(remote_client.clone(), &ar);
        controllers.push(Box::pin(tandem_reconcile::run(api, ar, Arc::new(reconciler), resync)));
    }

    info!(claims = args.claims.len(), extensions = args.extensions.len(), ?waits, ?resync, "agent started");
    futures::future::join_all(controllers).await;
    warn!("all controllers stopped");
    Ok(())
}

#[derive(Debug, Serialize)]
struct CheckRow {
    check: String,
    ok: bool,
    detail: String,
}

impl CheckRow {
    fn from_result<T>(check: impl Into<String>, res: Result<T>, detail: impl FnOnce(T) -> String) -> Self {
        match res {
            Ok(v) => Self { check: check.into(), ok: true, detail: detail(v) },
            Err(e) => Self { check: check.into(), ok: false, detail: format!("{:#}", e) },
        }
    }
}

async fn check(clusters: &ClusterArgs, args: &AgentArgs, output: Output) -> Result<()> {
    let mut rows = Vec::new();
    rows.push(CheckRow::from_result("wait tiers", args.waits(), |w| format!("{:?}", w)));

    let mut connected = Vec::new();
    for side in [Side::Local, Side::Remote] {
        let res = match clusters.client(side).await {
            Ok(client) => client
                .apiserver_version()
                .await
                .map(|v| (client, v.git_version))
                .context("querying apiserver version"),
            Err(e) => Err(e),
        };
        let row = CheckRow::from_result(format!("{:?} cluster", side).to_lowercase(), res, |(client, version)| {
            connected.push((side, client));
            version
        });
        rows.push(row);
    }
    let client_of = |side: Side| connected.iter().find(|(s, _)| *s == side).map(|(_, c)| c.clone());

    if let (Some(local), Some(remote)) = (client_of(Side::Local), client_of(Side::Remote)) {
        for key in &args.claims {
            for (side, client) in [(Side::Local, &local), (Side::Remote, &remote)] {
                let res = match parse_gvk_key(key) {
                    Ok(gvk) => find_api_resource(client.clone(), &gvk).await,
                    Err(e) => Err(e),
                };
                rows.push(CheckRow::from_result(format!("claim {} ({:?})", key, side), res, |(ar, namespaced)| {
                    format!("{} {}", ar.plural, if namespaced { "namespaced" } else { "cluster" })
                }));
            }
        }
        for ext in &args.extensions {
            let res = find_api_resource(remote.clone(), &ext.gvk).await;
            rows.push(CheckRow::from_result(format!("extension {} (Remote)", ext.gvk.kind), res, |(ar, _)| ar.plural));
            let res = match crd_established(local.clone(), &ext.crd).await {
                Ok(true) => Ok(()),
                Ok(false) => Err(anyhow::anyhow!("not established")),
                Err(e) => Err(e),
            };
            rows.push(CheckRow::from_result(format!("crd {} (Local)", ext.crd), res, |_| "established".to_string()));
        }
    }

    match output {
        Output::Human => {
            for r in &rows {
                println!("{:<4} {:<48} {}", if r.ok { "ok" } else { "FAIL" }, r.check, r.detail);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
    }
    let failed = rows.iter().filter(|r| !r.ok).count();
    if failed > 0 {
        error!(failed, "check failed");
        bail!("{} check(s) failed", failed);
    }
    Ok(())
}
