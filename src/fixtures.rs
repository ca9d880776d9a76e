//! Test doubles for the cloud client and the reconciler's collaborators.

use std::sync::Mutex;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::eks_cluster::awsauth::AuthApply;
use crate::eks_cluster::client::{
    ClusterObservation, CloudError, EksApi, WorkerObservation, CLUSTER_STATUS_ACTIVE,
};
use crate::eks_cluster::connection::{ConnectionDetails, SecretWrite};
use crate::eks_cluster::types::{
    EksCluster, EksClusterSpec, EksClusterStatus, ProviderReference, ReclaimPolicy,
    SecretReference, CLUSTER_NAME_PREFIX,
};

pub const TEST_UID: &str = "test-uid";
pub const NODE_ROLE_ARN: &str =
    "arn:aws:iam::111122223333:role/eks-test-uid-workers-NodeInstanceRole";

pub fn test_spec() -> EksClusterSpec {
    EksClusterSpec {
        provider_ref: ProviderReference {
            name: "aws-creds".to_string(),
            namespace: None,
        },
        region: "us-west-2".to_string(),
        role_arn: "arn:aws:iam::111122223333:role/eks-service-role".to_string(),
        version: "1.27".to_string(),
        vpc_id: "vpc-0123456789".to_string(),
        subnets: vec!["subnet-a".to_string(), "subnet-b".to_string()],
        security_groups: vec!["sg-0123456789".to_string()],
        worker_nodes_instance_type: "m5.large".to_string(),
        workers_count: 3,
        map_roles: Vec::new(),
        map_users: Vec::new(),
        reclaim_policy: ReclaimPolicy::Delete,
        write_connection_secret_to: SecretReference {
            name: "test-cluster-connection".to_string(),
            namespace: None,
        },
    }
}

/// A freshly submitted resource: spec filled in, nothing observed yet.
pub fn test_cluster() -> EksCluster {
    let mut cluster = EksCluster::new("test-cluster", test_spec());
    cluster.metadata.namespace = Some("default".to_string());
    cluster.metadata.uid = Some(TEST_UID.to_string());
    cluster
}

/// A resource whose control plane exists and has been observed once.
pub fn provisioned_cluster(stack_id: &str) -> EksCluster {
    let mut cluster = test_cluster();
    cluster.status = Some(EksClusterStatus {
        cluster_name: format!("{CLUSTER_NAME_PREFIX}{TEST_UID}"),
        cloud_formation_stack_id: stack_id.to_string(),
        endpoint: "test-ep".to_string(),
        certificate_authority_data: STANDARD.encode("test-ca"),
        ..Default::default()
    });
    cluster
}

/// What `get_cluster` reports once the control plane has settled.
pub fn active_observation() -> ClusterObservation {
    ClusterObservation {
        state: CLUSTER_STATUS_ACTIVE.to_string(),
        endpoint: "test-ep".to_string(),
        certificate_authority_data: STANDARD.encode("test-ca"),
    }
}

type CreateFn = Box<dyn Fn(&str) -> Result<ClusterObservation, CloudError> + Send + Sync>;
type GetFn = Box<dyn Fn(&str) -> Result<ClusterObservation, CloudError> + Send + Sync>;
type CreateWorkersFn =
    Box<dyn Fn(&str, &str) -> Result<WorkerObservation, CloudError> + Send + Sync>;
type GetWorkersFn = Box<dyn Fn(&str) -> Result<WorkerObservation, CloudError> + Send + Sync>;
type DeleteFn = Box<dyn Fn(&str) -> Result<(), CloudError> + Send + Sync>;
type TokenFn = Box<dyn Fn(&str) -> Result<String, CloudError> + Send + Sync>;

/// Closure-per-operation cloud client. Operations a test does not stub panic
/// when reached, so unexpected cloud calls fail loudly.
pub struct MockEks {
    pub create: CreateFn,
    pub get: GetFn,
    pub create_workers: CreateWorkersFn,
    pub get_workers: GetWorkersFn,
    pub delete: DeleteFn,
    pub delete_workers: DeleteFn,
    pub token: TokenFn,
}

impl Default for MockEks {
    fn default() -> Self {
        Self {
            create: Box::new(|name| panic!("unexpected create_cluster({name})")),
            get: Box::new(|name| panic!("unexpected get_cluster({name})")),
            create_workers: Box::new(|name, _| panic!("unexpected create_worker_nodes({name})")),
            get_workers: Box::new(|stack| panic!("unexpected get_worker_nodes({stack})")),
            delete: Box::new(|name| panic!("unexpected delete_cluster({name})")),
            delete_workers: Box::new(|stack| panic!("unexpected delete_worker_nodes({stack})")),
            token: Box::new(|name| panic!("unexpected connection_token({name})")),
        }
    }
}

#[async_trait]
impl EksApi for MockEks {
    async fn create_cluster(
        &self,
        name: &str,
        _spec: &EksClusterSpec,
    ) -> Result<ClusterObservation, CloudError> {
        (self.create)(name)
    }

    async fn get_cluster(&self, name: &str) -> Result<ClusterObservation, CloudError> {
        (self.get)(name)
    }

    async fn create_worker_nodes(
        &self,
        name: &str,
        role_arn: &str,
        _spec: &EksClusterSpec,
    ) -> Result<WorkerObservation, CloudError> {
        (self.create_workers)(name, role_arn)
    }

    async fn get_worker_nodes(&self, stack_id: &str) -> Result<WorkerObservation, CloudError> {
        (self.get_workers)(stack_id)
    }

    async fn delete_cluster(&self, name: &str) -> Result<(), CloudError> {
        (self.delete)(name)
    }

    async fn delete_worker_nodes(&self, stack_id: &str) -> Result<(), CloudError> {
        (self.delete_workers)(stack_id)
    }

    async fn connection_token(&self, name: &str) -> Result<String, CloudError> {
        (self.token)(name)
    }
}

/// AuthApply double recording the node role it was handed.
#[derive(Default)]
pub struct RecordingAuth {
    pub applied_role_arns: Mutex<Vec<String>>,
    pub error: Option<String>,
}

#[async_trait]
impl AuthApply for RecordingAuth {
    async fn apply(
        &self,
        _cluster: &EksCluster,
        _eks: &dyn EksApi,
        node_role_arn: &str,
    ) -> anyhow::Result<()> {
        if let Some(message) = &self.error {
            anyhow::bail!("{message}");
        }
        self.applied_role_arns
            .lock()
            .unwrap()
            .push(node_role_arn.to_string());
        Ok(())
    }
}

/// SecretWrite double capturing every published payload.
#[derive(Default)]
pub struct RecordingSecrets {
    pub written: Mutex<Vec<ConnectionDetails>>,
    pub error: Option<String>,
}

#[async_trait]
impl SecretWrite for RecordingSecrets {
    async fn write(&self, _cluster: &EksCluster, details: ConnectionDetails) -> anyhow::Result<()> {
        if let Some(message) = &self.error {
            anyhow::bail!("{message}");
        }
        self.written.lock().unwrap().push(details);
        Ok(())
    }
}
