//! Tandem kubehub – per-cluster client construction, discovery and the
//! Kubernetes-backed [`tandem_core::ObjectStore`].

#![forbid(unsafe_code)]

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, ApiResource},
    config::{KubeConfigOptions, Kubeconfig},
    core::GroupVersionKind,
    discovery::{Discovery, Scope},
    Client, Config,
};
use serde::Serialize;
use tracing::{debug, info};

mod store;

pub use store::KubeStore;

/// How to reach one cluster: an optional kubeconfig file and context.
/// With neither set, the in-cluster / default kubeconfig is inferred.
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
}

/// Build a client for the described cluster.
pub async fn client_for(cluster: &ClusterConfig) -> Result<Client> {
    let opts = KubeConfigOptions { context: cluster.context.clone(), ..Default::default() };
    let config = match (&cluster.kubeconfig, &cluster.context) {
        (Some(path), _) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kc, &opts).await.context("loading kubeconfig")?
        }
        (None, Some(_)) => Config::from_kubeconfig(&opts).await.context("loading default kubeconfig")?,
        (None, None) => Config::infer().await.context("inferring kube config")?,
    };
    debug!(cluster_url = %config.cluster_url, "kube client configured");
    Client::try_from(config).context("building kube client")
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Discover served resources (incl. CRDs) using kube Discovery.
pub async fn discover(client: Client) -> Result<Vec<DiscoveredResource>> {
    let discovery = Discovery::new(client).run().await?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            let namespaced = matches!(caps.scope, Scope::Namespaced);
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                namespaced,
            });
        }
    }
    // Stable-ish order
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() })
        }
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// Resolve a GVK against the served API, returning the resource (with its real
/// plural) and whether it is namespaced.
pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Whether the named CRD exists and reports `Established=True`.
pub async fn crd_established(client: Client, crd_name: &str) -> Result<bool> {
    let api: Api<CustomResourceDefinition> = Api::all(client);
    let crd = match api.get_opt(crd_name).await.with_context(|| format!("getting CRD {}", crd_name))? {
        Some(crd) => crd,
        None => return Ok(false),
    };
    let established = crd
        .status
        .and_then(|s| s.conditions)
        .map(|cs| cs.iter().any(|c| c.type_ == "Established" && c.status == "True"))
        .unwrap_or(false);
    info!(crd = %crd_name, established, "CRD readiness checked");
    Ok(established)
}
