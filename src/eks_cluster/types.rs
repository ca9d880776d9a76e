use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub static EKS_CLUSTER_FINALIZER: &str = "ekscluster.eks.cloudctl.dev";

/// Cloud cluster names are derived from the resource uid so repeated
/// reconciles of the same object always address the same cluster.
pub const CLUSTER_NAME_PREFIX: &str = "eks-";

/// Reference to the Secret holding AWS credentials for this cluster.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProviderReference {
    pub name: String,
    /// Defaults to the namespace of the EksCluster resource.
    pub namespace: Option<String>,
}

/// Reference to the Secret the controller writes connection details into.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretReference {
    pub name: String,
    /// Defaults to the namespace of the EksCluster resource.
    pub namespace: Option<String>,
}

/// One entry of the aws-auth `mapRoles` document. The field names follow the
/// wire format the aws-iam-authenticator expects.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct MapRole {
    pub rolearn: String,
    pub username: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// One entry of the aws-auth `mapUsers` document.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct MapUser {
    pub userarn: String,
    pub username: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

/// Whether deleting the resource also deletes the cloud cluster.
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
pub enum ReclaimPolicy {
    #[default]
    Delete,
    Retain,
}

/// Generate the Kubernetes wrapper struct `EksCluster` from our Spec and Status struct
///
/// This provides a hook for generating the CRD yaml (in crdgen.rs)
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[cfg_attr(test, derive(Default))]
#[kube(kind = "EksCluster", group = "eks.cloudctl.dev", version = "v1alpha1", namespaced)]
#[kube(status = "EksClusterStatus", shortname = "eks")]
#[serde(rename_all = "camelCase")]
pub struct EksClusterSpec {
    pub provider_ref: ProviderReference,
    pub region: String,
    /// IAM role the EKS control plane assumes.
    #[serde(rename = "roleARN")]
    pub role_arn: String,
    /// Kubernetes version of the control plane, e.g. "1.27".
    pub version: String,
    #[serde(rename = "vpcID")]
    pub vpc_id: String,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub worker_nodes_instance_type: String,
    pub workers_count: i32,
    /// IAM roles granted access inside the workload cluster, in order.
    #[serde(default)]
    pub map_roles: Vec<MapRole>,
    /// IAM users granted access inside the workload cluster, in order.
    #[serde(default)]
    pub map_users: Vec<MapUser>,
    #[serde(default)]
    pub reclaim_policy: ReclaimPolicy,
    pub write_connection_secret_to: SecretReference,
}

/// The status object of `EksCluster`
#[derive(Deserialize, Serialize, Clone, Default, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EksClusterStatus {
    #[serde(default)]
    #[schemars(schema_with = "conditions_schema")]
    pub conditions: Vec<Condition>,
    /// Name of the control plane in the cloud. Set once, never changed.
    #[serde(default)]
    pub cluster_name: String,
    /// Last observed control-plane state (CREATING, ACTIVE, ...).
    #[serde(default)]
    pub state: String,
    /// Identifier of the worker node stack. Set once, never changed.
    #[serde(default, rename = "cloudFormationStackID")]
    pub cloud_formation_stack_id: String,
    #[serde(default)]
    pub endpoint: String,
    /// Base64-encoded cluster CA as returned by the cloud API.
    #[serde(default)]
    pub certificate_authority_data: String,
}

impl EksCluster {
    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|f| f == EKS_CLUSTER_FINALIZER)
    }

    pub fn add_finalizer(&mut self) {
        if !self.has_finalizer() {
            self.metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(EKS_CLUSTER_FINALIZER.to_string());
        }
    }

    pub fn remove_finalizer(&mut self) {
        let finalizers = self.metadata.finalizers.take().map(|mut f| {
            f.retain(|t| t != EKS_CLUSTER_FINALIZER);
            f
        });
        self.metadata.finalizers = finalizers.filter(|f| !f.is_empty());
    }
}

pub fn conditions_schema(_: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
    serde_json::from_value(serde_json::json!({
        "type": "array",
        "x-kubernetes-list-type": "map",
        "x-kubernetes-list-map-keys": ["type"],
        "items": {
            "type": "object",
            "properties": {
                "lastTransitionTime": { "format": "date-time", "type": "string" },
                "message": { "type": "string" },
                "observedGeneration": { "type": "integer", "format": "int64", "default": 0 },
                "reason": { "type": "string" },
                "status": { "type": "string" },
                "type": { "type": "string" }
            },
            "required": [
                "lastTransitionTime",
                "message",
                "reason",
                "status",
                "type"
            ],
        },
    }))
    .unwrap()
}
