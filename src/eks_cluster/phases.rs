use kube::runtime::controller::Action;
use kube::ResourceExt;
use tokio::time::Duration;
use tracing::*;

use super::awsauth::AuthApply;
use super::client::{EksApi, CLUSTER_STATUS_ACTIVE, CLUSTER_STATUS_CREATING};
use super::connection::{self, SecretWrite};
use super::status::{available, creating, deleting, reconcile_error, reconcile_success};
use super::types::{EksCluster, EksClusterStatus, ReclaimPolicy, CLUSTER_NAME_PREFIX};

/// Retry interval while waiting on cloud transitions or after an error.
pub const SHORT_WAIT: Duration = Duration::from_secs(30);
/// Steady-state pass interval once the cluster is available.
pub const LONG_WAIT: Duration = Duration::from_secs(5 * 60);

/// Requeue hint returned by the phase handlers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Requeue {
    None,
    Short,
    Long,
}

impl From<Requeue> for Action {
    fn from(requeue: Requeue) -> Action {
        match requeue {
            Requeue::None => Action::await_change(),
            Requeue::Short => Action::requeue(SHORT_WAIT),
            Requeue::Long => Action::requeue(LONG_WAIT),
        }
    }
}

fn status_mut(cluster: &mut EksCluster) -> &mut EksClusterStatus {
    cluster.status.get_or_insert_with(Default::default)
}

/// First reconcile of a resource that has no cluster name yet: submit the
/// control-plane creation request.
pub async fn create(cluster: &mut EksCluster, eks: &dyn EksApi) -> Requeue {
    let cluster_name = format!("{CLUSTER_NAME_PREFIX}{}", cluster.uid().unwrap_or_default());

    match eks.create_cluster(&cluster_name, &cluster.spec).await {
        Err(e) if e.is_terminal() => {
            // Malformed spec. Nothing was provisioned, so keep no partial
            // state and no finalizer; only a spec edit triggers another try.
            warn!("cluster {cluster_name} rejected: {e}");
            let status = cluster.status.insert(EksClusterStatus::default());
            status.set_conditions([creating(), reconcile_error(&e)]);
            Requeue::None
        }
        Err(e) => {
            warn!("failed to create cluster {cluster_name}: {e}");
            let status = status_mut(cluster);
            status.set_conditions([creating(), reconcile_error(&e)]);
            Requeue::Short
        }
        Ok(_) => {
            info!("created control plane {cluster_name}");
            cluster.add_finalizer();
            let status = status_mut(cluster);
            status.cluster_name = cluster_name;
            status.state = CLUSTER_STATUS_CREATING.to_string();
            status.set_conditions([creating(), reconcile_success()]);
            Requeue::Short
        }
    }
}

/// Steady-state reconcile of a named, live resource: converge workers, auth
/// and connection material on the observed control plane.
pub async fn sync(
    cluster: &mut EksCluster,
    eks: &dyn EksApi,
    auth: &dyn AuthApply,
    secrets: &dyn SecretWrite,
) -> Requeue {
    let cluster_name = cluster
        .status
        .as_ref()
        .map(|s| s.cluster_name.clone())
        .unwrap_or_default();

    let observed = match eks.get_cluster(&cluster_name).await {
        Ok(observed) => observed,
        Err(e) => {
            warn!("failed to describe cluster {cluster_name}: {e}");
            status_mut(cluster).set_conditions([reconcile_error(&e)]);
            return Requeue::Short;
        }
    };

    {
        let status = status_mut(cluster);
        status.state = observed.state.clone();
        status.endpoint = observed.endpoint;
        status.certificate_authority_data = observed.certificate_authority_data;
    }

    if observed.state != CLUSTER_STATUS_ACTIVE {
        // Still transitioning; poll again without touching conditions.
        return Requeue::Short;
    }

    if status_mut(cluster).cloud_formation_stack_id.is_empty() {
        let role_arn = cluster.spec.role_arn.clone();
        match eks
            .create_worker_nodes(&cluster_name, &role_arn, &cluster.spec)
            .await
        {
            Ok(workers) => {
                info!("created worker node stack {}", workers.stack_id);
                let status = status_mut(cluster);
                status.cloud_formation_stack_id = workers.stack_id;
                status.set_conditions([reconcile_success()]);
            }
            Err(e) => {
                warn!("failed to create worker node stack for {cluster_name}: {e}");
                status_mut(cluster).set_conditions([reconcile_error(&e)]);
            }
        }
        return Requeue::Short;
    }

    let stack_id = status_mut(cluster).cloud_formation_stack_id.clone();
    let workers = match eks.get_worker_nodes(&stack_id).await {
        Ok(workers) => workers,
        Err(e) => {
            warn!("failed to describe worker node stack {stack_id}: {e}");
            status_mut(cluster).set_conditions([reconcile_error(&e)]);
            return Requeue::Short;
        }
    };

    if !workers.is_ready() {
        debug!("worker node stack {stack_id} in state {}", workers.status);
        status_mut(cluster).set_conditions([reconcile_success()]);
        return Requeue::Short;
    }

    if let Err(e) = auth
        .apply(cluster, eks, &workers.node_instance_role_arn)
        .await
    {
        let message = format!("failed to set auth map on eks: {e}");
        warn!("{message}");
        status_mut(cluster).set_conditions([reconcile_error(message)]);
        return Requeue::Short;
    }

    if let Err(e) = connection::publish(cluster, eks, secrets).await {
        warn!("failed to publish connection secret: {e}");
        status_mut(cluster).set_conditions([reconcile_error(&e)]);
        return Requeue::Short;
    }

    status_mut(cluster).set_conditions([available(), reconcile_success()]);
    Requeue::Long
}

/// Teardown once the deletion timestamp is set. The finalizer is released
/// only when no cleanup obligation remains.
pub async fn delete(cluster: &mut EksCluster, eks: &dyn EksApi) -> Requeue {
    if cluster.spec.reclaim_policy == ReclaimPolicy::Retain {
        info!("reclaim policy is Retain; leaving cloud resources in place");
        status_mut(cluster).set_conditions([deleting(), reconcile_success()]);
        cluster.remove_finalizer();
        return Requeue::None;
    }

    let (cluster_name, stack_id) = cluster
        .status
        .as_ref()
        .map(|s| (s.cluster_name.clone(), s.cloud_formation_stack_id.clone()))
        .unwrap_or_default();

    // Attempt both teardowns; a failure in one must not shadow the other.
    let master = if cluster_name.is_empty() {
        Ok(())
    } else {
        eks.delete_cluster(&cluster_name).await
    };
    let workers = if stack_id.is_empty() {
        Ok(())
    } else {
        eks.delete_worker_nodes(&stack_id).await
    };

    let failure = match (master, workers) {
        (Ok(()), Ok(())) => None,
        (Err(m), Ok(())) => Some(format!("Master Delete Error: {m}")),
        (Ok(()), Err(w)) => Some(format!("Worker Delete Error: {w}")),
        (Err(m), Err(w)) => Some(format!(
            "Master Delete Error: {m}, Worker Delete Error: {w}"
        )),
    };

    match failure {
        Some(message) => {
            warn!("teardown of {cluster_name} incomplete: {message}");
            status_mut(cluster).set_conditions([deleting(), reconcile_error(message)]);
            Requeue::Short
        }
        None => {
            info!("teardown of {cluster_name} complete");
            status_mut(cluster).set_conditions([deleting(), reconcile_success()]);
            cluster.remove_finalizer();
            Requeue::None
        }
    }
}
