use chrono::{DateTime, Utc};
use futures::StreamExt;
use kube::{
    api::{Api, ListParams, Patch, PatchParams, ResourceExt},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType, Recorder, Reporter},
        watcher::Config,
    },
    Resource,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::*;

use crate::metrics::Metrics;
use crate::{Error, Result};

use super::awsauth::{AuthApply, WorkloadAuthApply};
use super::client::{Connect, SecretConnect};
use super::connection::{ConnectionSecretWriter, SecretWrite};
use super::phases::{self, Requeue, SHORT_WAIT};
use super::status::reconcile_error;
use super::types::{EksCluster, EksClusterStatus};

pub const FIELD_MANAGER: &str = "eks-cluster-controller";

/// State shared between the controller and the web server
#[derive(Clone, Default)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics registry
    registry: prometheus::Registry,
}

/// State wrapper around the controller outputs for the web server
impl State {
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub fn to_context(&self, client: Client) -> Arc<Context> {
        Arc::new(Context {
            connector: Arc::new(SecretConnect::new(client.clone())),
            auth: Arc::new(WorkloadAuthApply),
            secrets: Arc::new(ConnectionSecretWriter::new(client.clone())),
            client,
            metrics: Metrics::default().register(&self.registry).unwrap(),
            diagnostics: self.diagnostics.clone(),
        })
    }
}

/// Context for the reconciler. The cloud connector, auth applier and secret
/// writer are separately assignable so each phase can be exercised against
/// test doubles.
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Metrics,
    /// Resolves a cloud client from the resource's provider reference
    pub connector: Arc<dyn Connect>,
    /// Pushes the aws-auth document into the workload cluster
    pub auth: Arc<dyn AuthApply>,
    /// Writes the connection secret
    pub secrets: Arc<dyn SecretWrite>,
}

impl Context {
    async fn publish_delete_event(&self, cluster: &EksCluster) {
        let recorder = self
            .diagnostics
            .read()
            .await
            .recorder(self.client.clone(), cluster);
        // Best effort; teardown proceeds either way.
        if let Err(e) = recorder
            .publish(Event {
                type_: EventType::Normal,
                reason: "DeleteRequested".into(),
                note: Some(format!("Delete `{}`", cluster.name_any())),
                action: "Deleting".into(),
                secondary: None,
            })
            .await
        {
            debug!("failed to publish delete event: {e}");
        }
    }
}

pub async fn reconcile(cluster: Arc<EksCluster>, ctx: Arc<Context>) -> Result<Action> {
    let _timer = ctx.metrics.count_and_measure();
    ctx.diagnostics.write().await.last_event = Utc::now();

    let ns = cluster
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let name = cluster.name_any();
    let api: Api<EksCluster> = Api::namespaced(ctx.client.clone(), &ns);

    info!("reconciling EksCluster \"{name}\" in {ns}");

    // Work on a fresh read; the triggering event may be stale or the object
    // already gone.
    let Some(current) = api.get_opt(&name).await.map_err(Error::KubeError)? else {
        debug!("EksCluster \"{name}\" is gone, nothing to do");
        return Ok(Action::await_change());
    };

    let mut desired = current.clone();
    if desired.status.is_none() {
        desired.status = Some(EksClusterStatus::default());
    }

    let eks = match ctx.connector.connect(&desired).await {
        Ok(eks) => eks,
        Err(e) => {
            warn!("failed to connect cloud provider for \"{name}\": {e}");
            if let Some(status) = desired.status.as_mut() {
                status.set_conditions([reconcile_error(&e)]);
            }
            persist(&api, &current, &desired).await?;
            return Ok(Requeue::Short.into());
        }
    };

    let requeue = if desired.meta().deletion_timestamp.is_some() {
        ctx.publish_delete_event(&desired).await;
        phases::delete(&mut desired, eks.as_ref()).await
    } else if desired
        .status
        .as_ref()
        .map_or(true, |s| s.cluster_name.is_empty())
    {
        phases::create(&mut desired, eks.as_ref()).await
    } else {
        phases::sync(&mut desired, eks.as_ref(), ctx.auth.as_ref(), ctx.secrets.as_ref()).await
    };

    persist(&api, &current, &desired).await?;
    Ok(requeue.into())
}

/// Writes finalizer and status changes back, skipping untouched fields to
/// limit write amplification.
async fn persist(api: &Api<EksCluster>, current: &EksCluster, desired: &EksCluster) -> Result<()> {
    let name = desired.name_any();

    if desired.meta().finalizers != current.meta().finalizers {
        let patch = Patch::Merge(json!({
            "metadata": { "finalizers": desired.meta().finalizers }
        }));
        api.patch(&name, &PatchParams::default(), &patch)
            .await
            .map_err(Error::KubeError)?;
    }

    if desired.status != current.status {
        let patch = Patch::Apply(json!({
            "apiVersion": "eks.cloudctl.dev/v1alpha1",
            "kind": "EksCluster",
            "status": desired.status,
        }));
        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch_status(&name, &params, &patch)
            .await
            .map_err(Error::KubeError)?;
    }

    Ok(())
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "eks-cluster-controller".into(),
        }
    }
}
impl Diagnostics {
    fn recorder(&self, client: Client, cluster: &EksCluster) -> Recorder {
        Recorder::new(client, self.reporter.clone(), cluster.object_ref(&()))
    }
}

fn error_policy(cluster: Arc<EksCluster>, error: &Error, ctx: Arc<Context>) -> Action {
    warn!("reconcile failed: {error:?}");
    ctx.metrics.reconcile_failure(&cluster, error);
    Action::requeue(SHORT_WAIT)
}

/// Initialize the controller and shared state (given the crd is installed)
pub async fn run(state: State) {
    let client = Client::try_default()
        .await
        .expect("failed to create kube Client");

    let clusters = Api::<EksCluster>::all(client.clone());
    if let Err(e) = clusters.list(&ListParams::default().limit(1)).await {
        error!("CRD is not queryable; {e:?}. Is the CRD installed?");
        info!("Installation: cargo run --bin crdgen | kubectl apply -f -");
        std::process::exit(1);
    }

    Controller::new(clusters, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state.to_context(client))
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;
}
