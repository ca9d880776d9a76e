use std::collections::BTreeMap;

use anyhow::Context as _;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};

use super::client::EksApi;
use super::controller::FIELD_MANAGER;
use super::types::EksCluster;

pub const CONNECTION_KEY_ENDPOINT: &str = "endpoint";
pub const CONNECTION_KEY_CLUSTER_CA: &str = "clusterCA";
pub const CONNECTION_KEY_TOKEN: &str = "token";

/// Material a downstream consumer needs to talk to the workload cluster.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ConnectionDetails {
    pub endpoint: Vec<u8>,
    /// Raw CA bytes, already decoded from the cloud API's base64.
    pub cluster_ca: Vec<u8>,
    pub token: Vec<u8>,
}

impl ConnectionDetails {
    pub fn into_secret_data(self) -> BTreeMap<String, ByteString> {
        BTreeMap::from([
            (CONNECTION_KEY_ENDPOINT.to_string(), ByteString(self.endpoint)),
            (CONNECTION_KEY_CLUSTER_CA.to_string(), ByteString(self.cluster_ca)),
            (CONNECTION_KEY_TOKEN.to_string(), ByteString(self.token)),
        ])
    }
}

/// Persists connection details for a cluster.
#[async_trait]
pub trait SecretWrite: Send + Sync {
    async fn write(&self, cluster: &EksCluster, details: ConnectionDetails) -> anyhow::Result<()>;
}

/// Mints a fresh token and hands endpoint, CA and token to the writer.
///
/// Tokens are short-lived, so the token entry rolls on every publish.
/// Token errors surface unmodified.
pub async fn publish(
    cluster: &EksCluster,
    eks: &dyn EksApi,
    secrets: &dyn SecretWrite,
) -> anyhow::Result<()> {
    let status = cluster
        .status
        .as_ref()
        .context("cluster has no observed status")?;

    let token = eks.connection_token(&status.cluster_name).await?;
    let cluster_ca = STANDARD
        .decode(status.certificate_authority_data.as_bytes())
        .context("failed to decode certificate authority data")?;

    let details = ConnectionDetails {
        endpoint: status.endpoint.clone().into_bytes(),
        cluster_ca,
        token: token.into_bytes(),
    };
    secrets.write(cluster, details).await
}

/// SecretWrite implementation applying a Secret at the location named by
/// `writeConnectionSecretTo`.
pub struct ConnectionSecretWriter {
    client: Client,
}

impl ConnectionSecretWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretWrite for ConnectionSecretWriter {
    async fn write(&self, cluster: &EksCluster, details: ConnectionDetails) -> anyhow::Result<()> {
        let secret_ref = &cluster.spec.write_connection_secret_to;
        let namespace = secret_ref
            .namespace
            .clone()
            .or_else(|| cluster.namespace())
            .context("connection secret namespace unresolved")?;

        // Owner references cannot cross namespaces.
        let owner = (cluster.namespace().as_deref() == Some(namespace.as_str()))
            .then(|| cluster.controller_owner_ref(&()))
            .flatten();

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(secret_ref.name.clone()),
                namespace: Some(namespace.clone()),
                owner_references: owner.map(|o| vec![o]),
                ..ObjectMeta::default()
            },
            data: Some(details.into_secret_data()),
            ..Default::default()
        };

        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            &secret_ref.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&secret),
        )
        .await
        .context("failed to write connection secret")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eks_cluster::client::CloudError;
    use crate::fixtures::{provisioned_cluster, MockEks, RecordingSecrets};
    use anyhow::anyhow;

    #[tokio::test]
    async fn publish_writes_endpoint_ca_and_fresh_token() {
        let cluster = provisioned_cluster("fake-stack-id");
        let eks = MockEks {
            token: Box::new(|_| Ok("test-token".to_string())),
            ..Default::default()
        };
        let secrets = RecordingSecrets::default();

        publish(&cluster, &eks, &secrets).await.unwrap();

        let written = secrets.written.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].endpoint, b"test-ep");
        assert_eq!(written[0].cluster_ca, b"test-ca");
        assert_eq!(written[0].token, b"test-token");
    }

    #[tokio::test]
    async fn publish_propagates_token_errors_unwrapped() {
        let cluster = provisioned_cluster("fake-stack-id");
        let eks = MockEks {
            token: Box::new(|_| Err(CloudError::Other(anyhow!("token refused")))),
            ..Default::default()
        };
        let secrets = RecordingSecrets::default();

        let err = publish(&cluster, &eks, &secrets).await.unwrap_err();

        assert_eq!(err.to_string(), "token refused");
        assert!(secrets.written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_rejects_malformed_certificate_authority() {
        let mut cluster = provisioned_cluster("fake-stack-id");
        cluster
            .status
            .as_mut()
            .unwrap()
            .certificate_authority_data = "%%not-base64%%".to_string();
        let eks = MockEks {
            token: Box::new(|_| Ok("test-token".to_string())),
            ..Default::default()
        };
        let secrets = RecordingSecrets::default();

        let err = publish(&cluster, &eks, &secrets).await.unwrap_err();

        assert!(err.to_string().contains("certificate authority"));
        assert!(secrets.written.lock().unwrap().is_empty());
    }

    #[test]
    fn secret_data_uses_contractual_keys() {
        let details = ConnectionDetails {
            endpoint: b"test-ep".to_vec(),
            cluster_ca: b"test-ca".to_vec(),
            token: b"test-token".to_vec(),
        };

        let data = details.into_secret_data();
        assert_eq!(
            data.keys().map(String::as_str).collect::<Vec<_>>(),
            vec!["clusterCA", "endpoint", "token"]
        );
        assert_eq!(data[CONNECTION_KEY_ENDPOINT].0, b"test-ep");
    }
}
