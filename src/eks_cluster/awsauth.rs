use std::collections::BTreeMap;

use anyhow::Context as _;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::json;

use super::client::EksApi;
use super::controller::FIELD_MANAGER;
use super::types::{EksCluster, MapRole};

pub const AWS_AUTH_CONFIG_MAP: &str = "aws-auth";
pub const KUBE_SYSTEM_NAMESPACE: &str = "kube-system";

/// Username template for worker nodes; expanded by the kubelet, not by us.
const NODE_INSTANCE_USERNAME: &str = "system:node:{{EC2PrivateDNSName}}";
const NODE_INSTANCE_GROUPS: [&str; 2] = ["system:bootstrappers", "system:nodes"];

/// Renders the aws-auth ConfigMap granting cloud identities access inside the
/// workload cluster.
///
/// User-declared roles keep their declaration order; the implicit entry for
/// the worker node role is appended last. Downstream identity resolution is
/// order-sensitive, so both positions are contractual.
pub fn auth_config_map(cluster: &EksCluster, node_role_arn: &str) -> anyhow::Result<ConfigMap> {
    let mut roles = cluster.spec.map_roles.clone();
    roles.push(MapRole {
        rolearn: node_role_arn.to_string(),
        username: NODE_INSTANCE_USERNAME.to_string(),
        groups: NODE_INSTANCE_GROUPS.iter().map(|g| g.to_string()).collect(),
    });

    let mut data = BTreeMap::new();
    data.insert(
        "mapRoles".to_string(),
        serde_yaml::to_string(&roles).context("failed to serialize mapRoles")?,
    );
    data.insert(
        "mapUsers".to_string(),
        serde_yaml::to_string(&cluster.spec.map_users).context("failed to serialize mapUsers")?,
    );

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(AWS_AUTH_CONFIG_MAP.to_string()),
            namespace: Some(KUBE_SYSTEM_NAMESPACE.to_string()),
            ..ObjectMeta::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

/// Pushes the rendered auth document into the workload cluster.
#[async_trait]
pub trait AuthApply: Send + Sync {
    async fn apply(
        &self,
        cluster: &EksCluster,
        eks: &dyn EksApi,
        node_role_arn: &str,
    ) -> anyhow::Result<()>;
}

/// AuthApply implementation talking to the freshly provisioned cluster with a
/// minted token.
pub struct WorkloadAuthApply;

#[async_trait]
impl AuthApply for WorkloadAuthApply {
    async fn apply(
        &self,
        cluster: &EksCluster,
        eks: &dyn EksApi,
        node_role_arn: &str,
    ) -> anyhow::Result<()> {
        let config_map = auth_config_map(cluster, node_role_arn)?;
        let client = workload_client(cluster, eks).await?;
        let api: Api<ConfigMap> = Api::namespaced(client, KUBE_SYSTEM_NAMESPACE);
        api.patch(
            AWS_AUTH_CONFIG_MAP,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&config_map),
        )
        .await
        .context("failed to apply aws-auth config map")?;
        Ok(())
    }
}

async fn workload_client(cluster: &EksCluster, eks: &dyn EksApi) -> anyhow::Result<Client> {
    let status = cluster
        .status
        .as_ref()
        .context("cluster has no observed status")?;
    let token = eks.connection_token(&status.cluster_name).await?;

    let kubeconfig: Kubeconfig = serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": status.cluster_name,
            "cluster": {
                "server": status.endpoint,
                "certificate-authority-data": status.certificate_authority_data,
            },
        }],
        "users": [{
            "name": status.cluster_name,
            "user": { "token": token },
        }],
        "contexts": [{
            "name": status.cluster_name,
            "context": { "cluster": status.cluster_name, "user": status.cluster_name },
        }],
        "current-context": status.cluster_name,
    }))
    .context("failed to assemble workload cluster kubeconfig")?;

    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context("failed to load workload cluster config")?;
    Client::try_from(config).context("failed to build workload cluster client")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eks_cluster::types::MapUser;
    use crate::fixtures::test_cluster;

    const NODE_ROLE: &str = "arn:aws:iam::111122223333:role/test-cluster-workers-NodeInstanceRole";

    #[test]
    fn map_roles_keeps_user_entries_first_and_node_entry_last() {
        let mut cluster = test_cluster();
        cluster.spec.map_roles = vec![
            MapRole {
                rolearn: "arn:aws:iam::111122223333:role/admin".to_string(),
                username: "admin".to_string(),
                groups: vec!["system:masters".to_string()],
            },
            MapRole {
                rolearn: "arn:aws:iam::111122223333:role/dev".to_string(),
                username: "dev".to_string(),
                groups: Vec::new(),
            },
        ];

        let config_map = auth_config_map(&cluster, NODE_ROLE).unwrap();
        let data = config_map.data.unwrap();
        let roles: Vec<MapRole> = serde_yaml::from_str(&data["mapRoles"]).unwrap();

        assert_eq!(roles.len(), 3);
        assert_eq!(roles[0].username, "admin");
        assert_eq!(roles[1].username, "dev");

        let node_entry = &roles[2];
        assert_eq!(node_entry.rolearn, NODE_ROLE);
        assert_eq!(node_entry.username, "system:node:{{EC2PrivateDNSName}}");
        assert_eq!(node_entry.groups, vec!["system:bootstrappers", "system:nodes"]);
    }

    #[test]
    fn node_entry_is_appended_even_without_user_roles() {
        let cluster = test_cluster();

        let config_map = auth_config_map(&cluster, NODE_ROLE).unwrap();
        let data = config_map.data.unwrap();
        let roles: Vec<MapRole> = serde_yaml::from_str(&data["mapRoles"]).unwrap();

        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].rolearn, NODE_ROLE);
    }

    #[test]
    fn map_users_round_trip_verbatim() {
        let mut cluster = test_cluster();
        cluster.spec.map_users = vec![
            MapUser {
                userarn: "arn:aws:iam::111122223333:user/alice".to_string(),
                username: "alice".to_string(),
                groups: vec!["system:masters".to_string()],
            },
            MapUser {
                userarn: "arn:aws:iam::111122223333:user/bob".to_string(),
                username: "bob".to_string(),
                groups: Vec::new(),
            },
        ];

        let config_map = auth_config_map(&cluster, NODE_ROLE).unwrap();
        let data = config_map.data.unwrap();
        let users: Vec<MapUser> = serde_yaml::from_str(&data["mapUsers"]).unwrap();

        assert_eq!(users, cluster.spec.map_users);
    }

    #[test]
    fn config_map_targets_kube_system() {
        let config_map = auth_config_map(&test_cluster(), NODE_ROLE).unwrap();
        assert_eq!(config_map.metadata.name.as_deref(), Some(AWS_AUTH_CONFIG_MAP));
        assert_eq!(
            config_map.metadata.namespace.as_deref(),
            Some(KUBE_SYSTEM_NAMESPACE)
        );
    }
}
