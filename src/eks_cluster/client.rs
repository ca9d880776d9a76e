use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::anyhow;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::provider::ProvideCredentials;
use aws_credential_types::Credentials;
use aws_sdk_cloudformation::error::SdkError as CfnSdkError;
use aws_sdk_cloudformation::types::{Capability, Parameter};
use aws_sdk_eks::error::SdkError;
use aws_sdk_eks::types::VpcConfigRequest;
use aws_sigv4::http_request::{
    sign, SignableBody, SignableRequest, SignatureLocation, SigningSettings,
};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;
use aws_smithy_types::error::display::DisplayErrorContext;
use aws_types::region::Region;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::Api;
use kube::ResourceExt;
use thiserror::Error;

use super::types::{EksCluster, EksClusterSpec};

pub const CLUSTER_STATUS_CREATING: &str = "CREATING";
pub const CLUSTER_STATUS_ACTIVE: &str = "ACTIVE";

pub const STACK_STATUS_CREATE_COMPLETE: &str = "CREATE_COMPLETE";
pub const STACK_STATUS_UPDATE_COMPLETE: &str = "UPDATE_COMPLETE";

/// Published template creating the worker node group and its instance role.
const NODE_GROUP_TEMPLATE_URL: &str =
    "https://s3.us-west-2.amazonaws.com/amazon-eks/cloudformation/2020-10-29/amazon-eks-nodegroup.yaml";

/// Stack output carrying the IAM role of the worker nodes.
const NODE_INSTANCE_ROLE_OUTPUT: &str = "NodeInstanceRole";

const TOKEN_PREFIX: &str = "k8s-aws-v1.";
const TOKEN_EXPIRY: Duration = Duration::from_secs(15 * 60);

#[derive(Error, Debug)]
pub enum CloudError {
    /// The cloud rejected the request as malformed. Never retried until the
    /// spec changes.
    #[error("InvalidParameterException: {0}")]
    InvalidParameter(String),

    #[error("NotFound: {0}")]
    NotFound(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CloudError {
    /// Terminal errors strip partial status and are not requeued. Foreign
    /// errors are classified by message, matching the cloud API's own naming.
    pub fn is_terminal(&self) -> bool {
        matches!(self, CloudError::InvalidParameter(_))
            || self.to_string().contains("InvalidParameterException")
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }
}

/// Last observed shape of the control plane.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterObservation {
    pub state: String,
    pub endpoint: String,
    /// Base64-encoded, as returned by the cloud API.
    pub certificate_authority_data: String,
}

/// Last observed shape of the worker node stack.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkerObservation {
    pub stack_id: String,
    pub status: String,
    pub reason: String,
    /// Non-empty only once the stack has settled in a success state.
    pub node_instance_role_arn: String,
}

impl WorkerObservation {
    pub fn is_ready(&self) -> bool {
        matches!(
            self.status.as_str(),
            STACK_STATUS_CREATE_COMPLETE | STACK_STATUS_UPDATE_COMPLETE
        )
    }
}

/// Capability set the reconciler requires from the cloud.
///
/// Every operation is idempotent from the caller's point of view: deletes
/// treat not-found as success, creates of an already-existing resource fall
/// back to a read.
#[async_trait]
pub trait EksApi: Send + Sync {
    async fn create_cluster(
        &self,
        name: &str,
        spec: &EksClusterSpec,
    ) -> Result<ClusterObservation, CloudError>;

    async fn get_cluster(&self, name: &str) -> Result<ClusterObservation, CloudError>;

    async fn create_worker_nodes(
        &self,
        name: &str,
        role_arn: &str,
        spec: &EksClusterSpec,
    ) -> Result<WorkerObservation, CloudError>;

    async fn get_worker_nodes(&self, stack_id: &str) -> Result<WorkerObservation, CloudError>;

    async fn delete_cluster(&self, name: &str) -> Result<(), CloudError>;

    async fn delete_worker_nodes(&self, stack_id: &str) -> Result<(), CloudError>;

    /// Mints a short-lived bearer token for the workload cluster. Every call
    /// yields a fresh token.
    async fn connection_token(&self, name: &str) -> Result<String, CloudError>;
}

/// Resolves a cloud client for a resource via its provider reference.
#[async_trait]
pub trait Connect: Send + Sync {
    async fn connect(&self, cluster: &EksCluster) -> Result<Arc<dyn EksApi>, CloudError>;
}

/// EksApi backed by the AWS SDK: EKS for the control plane, CloudFormation
/// for the worker node stack, presigned STS for tokens.
pub struct AwsEks {
    eks: aws_sdk_eks::Client,
    cloudformation: aws_sdk_cloudformation::Client,
    config: aws_config::SdkConfig,
}

impl AwsEks {
    pub fn new(config: aws_config::SdkConfig) -> Self {
        Self {
            eks: aws_sdk_eks::Client::new(&config),
            cloudformation: aws_sdk_cloudformation::Client::new(&config),
            config,
        }
    }
}

#[async_trait]
impl EksApi for AwsEks {
    async fn create_cluster(
        &self,
        name: &str,
        spec: &EksClusterSpec,
    ) -> Result<ClusterObservation, CloudError> {
        let vpc_config = VpcConfigRequest::builder()
            .set_subnet_ids(Some(spec.subnets.clone()))
            .set_security_group_ids(Some(spec.security_groups.clone()))
            .build();

        let result = self
            .eks
            .create_cluster()
            .name(name)
            .role_arn(&spec.role_arn)
            .version(&spec.version)
            .resources_vpc_config(vpc_config)
            .send()
            .await;

        match result {
            Ok(output) => Ok(output
                .cluster
                .map(observe_cluster)
                .unwrap_or_default()),
            Err(SdkError::ServiceError(context))
                if context.err().is_invalid_parameter_exception() =>
            {
                Err(CloudError::InvalidParameter(context.err().to_string()))
            }
            // A previous reconcile may have created the cluster but failed to
            // record it; fall back to a read.
            Err(SdkError::ServiceError(context))
                if context.err().is_resource_in_use_exception() =>
            {
                self.get_cluster(name).await
            }
            Err(e) => Err(transient(e)),
        }
    }

    async fn get_cluster(&self, name: &str) -> Result<ClusterObservation, CloudError> {
        let result = self.eks.describe_cluster().name(name).send().await;

        match result {
            Ok(output) => {
                let cluster = output
                    .cluster
                    .ok_or_else(|| anyhow!("DescribeCluster response missing cluster field"))?;
                Ok(observe_cluster(cluster))
            }
            Err(SdkError::ServiceError(context))
                if context.err().is_resource_not_found_exception() =>
            {
                Err(CloudError::NotFound(format!("cluster {name} not found")))
            }
            Err(e) => Err(transient(e)),
        }
    }

    async fn create_worker_nodes(
        &self,
        name: &str,
        role_arn: &str,
        spec: &EksClusterSpec,
    ) -> Result<WorkerObservation, CloudError> {
        let stack_name = format!("{name}-workers");
        let result = self
            .cloudformation
            .create_stack()
            .stack_name(&stack_name)
            .template_url(NODE_GROUP_TEMPLATE_URL)
            .role_arn(role_arn)
            .capabilities(Capability::CapabilityIam)
            .parameters(parameter("ClusterName", name))
            .parameters(parameter(
                "ClusterControlPlaneSecurityGroup",
                &spec.security_groups.join(","),
            ))
            .parameters(parameter("NodeGroupName", &stack_name))
            .parameters(parameter(
                "NodeAutoScalingGroupMinSize",
                &spec.workers_count.to_string(),
            ))
            .parameters(parameter(
                "NodeAutoScalingGroupDesiredCapacity",
                &spec.workers_count.to_string(),
            ))
            .parameters(parameter(
                "NodeAutoScalingGroupMaxSize",
                &(spec.workers_count + 1).to_string(),
            ))
            .parameters(parameter("NodeInstanceType", &spec.worker_nodes_instance_type))
            .parameters(parameter("Subnets", &spec.subnets.join(",")))
            .parameters(parameter("VpcId", &spec.vpc_id))
            .send()
            .await;

        match result {
            Ok(output) => Ok(WorkerObservation {
                stack_id: output.stack_id.unwrap_or(stack_name),
                ..Default::default()
            }),
            // The stack survived an earlier reconcile whose status write was
            // lost; recover its id instead of failing forever.
            Err(CfnSdkError::ServiceError(context))
                if context.err().is_already_exists_exception() =>
            {
                self.get_worker_nodes(&stack_name).await
            }
            Err(e) => Err(transient(e)),
        }
    }

    async fn get_worker_nodes(&self, stack_id: &str) -> Result<WorkerObservation, CloudError> {
        let result = self
            .cloudformation
            .describe_stacks()
            .stack_name(stack_id)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e) if is_missing_stack(&e) => {
                return Err(CloudError::NotFound(format!("stack {stack_id} not found")))
            }
            Err(e) => return Err(transient(e)),
        };

        let stack = output
            .stacks
            .unwrap_or_default()
            .into_iter()
            .next()
            .ok_or_else(|| CloudError::NotFound(format!("stack {stack_id} not found")))?;

        let status = stack
            .stack_status
            .map(|s| s.as_str().to_string())
            .unwrap_or_default();
        let mut observation = WorkerObservation {
            stack_id: stack.stack_id.unwrap_or_else(|| stack_id.to_string()),
            status,
            reason: stack.stack_status_reason.unwrap_or_default(),
            node_instance_role_arn: String::new(),
        };
        if observation.is_ready() {
            observation.node_instance_role_arn = stack
                .outputs
                .unwrap_or_default()
                .into_iter()
                .find(|output| output.output_key.as_deref() == Some(NODE_INSTANCE_ROLE_OUTPUT))
                .and_then(|output| output.output_value)
                .unwrap_or_default();
        }
        Ok(observation)
    }

    async fn delete_cluster(&self, name: &str) -> Result<(), CloudError> {
        match self.eks.delete_cluster().name(name).send().await {
            Ok(_) => Ok(()),
            Err(SdkError::ServiceError(context))
                if context.err().is_resource_not_found_exception() =>
            {
                Ok(())
            }
            Err(e) => Err(transient(e)),
        }
    }

    async fn delete_worker_nodes(&self, stack_id: &str) -> Result<(), CloudError> {
        match self
            .cloudformation
            .delete_stack()
            .stack_name(stack_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_missing_stack(&e) => Ok(()),
            Err(e) => Err(transient(e)),
        }
    }

    async fn connection_token(&self, name: &str) -> Result<String, CloudError> {
        let region = self
            .config
            .region()
            .ok_or_else(|| anyhow!("no region configured"))?
            .to_string();
        let provider = self
            .config
            .credentials_provider()
            .ok_or_else(|| anyhow!("no credentials provider configured"))?;
        let credentials = provider
            .provide_credentials()
            .await
            .map_err(|e| anyhow!(e).context("failed to resolve signing credentials"))?;

        let identity = Identity::from(credentials);
        let mut settings = SigningSettings::default();
        settings.signature_location = SignatureLocation::QueryParams;
        settings.expires_in = Some(TOKEN_EXPIRY);
        let params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&region)
            .name("sts")
            .time(SystemTime::now())
            .settings(settings)
            .build()
            .map_err(|e| anyhow!(e).context("failed to build signing parameters"))?;

        // The signed GetCallerIdentity URL, bound to the cluster via the
        // x-k8s-aws-id header, is the bearer token the apiserver verifies.
        let url = format!("https://sts.{region}.amazonaws.com/?Action=GetCallerIdentity&Version=2011-06-15");
        let headers = [("x-k8s-aws-id", name)];
        let signable = SignableRequest::new(
            "GET",
            url.clone(),
            headers.iter().copied(),
            SignableBody::Bytes(&[]),
        )
        .map_err(|e| anyhow!(e).context("failed to assemble token request"))?;
        let (instructions, _signature) = sign(signable, &params.into())
            .map_err(|e| anyhow!(e).context("failed to presign token request"))?
            .into_parts();

        let mut request = http::Request::builder()
            .method("GET")
            .uri(&url)
            .header("x-k8s-aws-id", name)
            .body(())
            .map_err(|e| CloudError::Other(anyhow!(e)))?;
        instructions.apply_to_request_http0x(&mut request);

        Ok(format!(
            "{TOKEN_PREFIX}{}",
            URL_SAFE_NO_PAD.encode(request.uri().to_string())
        ))
    }
}

fn observe_cluster(cluster: aws_sdk_eks::types::Cluster) -> ClusterObservation {
    ClusterObservation {
        state: cluster
            .status
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
        endpoint: cluster.endpoint.unwrap_or_default(),
        certificate_authority_data: cluster
            .certificate_authority
            .and_then(|ca| ca.data)
            .unwrap_or_default(),
    }
}

fn parameter(key: &str, value: &str) -> Parameter {
    Parameter::builder()
        .parameter_key(key)
        .parameter_value(value)
        .build()
}

fn transient<E>(e: E) -> CloudError
where
    E: std::error::Error + Send + Sync + 'static,
{
    CloudError::Other(anyhow!("{}", DisplayErrorContext(&e)))
}

// CloudFormation reports a missing stack as a plain validation error.
fn is_missing_stack<E>(e: &E) -> bool
where
    E: std::error::Error,
{
    format!("{}", DisplayErrorContext(e)).contains("does not exist")
}

/// Connect implementation reading AWS credentials from the Secret named by
/// the resource's provider reference.
pub struct SecretConnect {
    client: kube::Client,
}

impl SecretConnect {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Connect for SecretConnect {
    async fn connect(&self, cluster: &EksCluster) -> Result<Arc<dyn EksApi>, CloudError> {
        let namespace = cluster
            .spec
            .provider_ref
            .namespace
            .clone()
            .or_else(|| cluster.namespace())
            .ok_or_else(|| anyhow!("provider secret namespace unresolved"))?;

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let secret = secrets
            .get(&cluster.spec.provider_ref.name)
            .await
            .map_err(|e| anyhow!(e).context("failed to read provider credentials secret"))?;
        let data = secret.data.unwrap_or_default();

        let access_key_id = secret_value(&data, "aws_access_key_id")?;
        let secret_access_key = secret_value(&data, "aws_secret_access_key")?;
        let session_token = match data.get("aws_session_token") {
            Some(_) => Some(secret_value(&data, "aws_session_token")?),
            None => None,
        };
        let credentials = Credentials::new(
            access_key_id,
            secret_access_key,
            session_token,
            None,
            "provider-secret",
        );

        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(cluster.spec.region.clone()))
            .credentials_provider(credentials)
            .load()
            .await;

        Ok(Arc::new(AwsEks::new(config)))
    }
}

fn secret_value(data: &BTreeMap<String, ByteString>, key: &str) -> Result<String, CloudError> {
    let bytes = data
        .get(key)
        .ok_or_else(|| anyhow!("provider secret missing key {key}"))?;
    String::from_utf8(bytes.0.clone())
        .map_err(|_| CloudError::Other(anyhow!("provider secret key {key} is not utf-8")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_parameter_errors_are_terminal() {
        let err = CloudError::InvalidParameter("subnets cannot be empty".to_string());
        assert!(err.is_terminal());
        assert!(!err.is_not_found());
    }

    #[test]
    fn foreign_errors_are_classified_by_message() {
        let err = CloudError::Other(anyhow!(
            "InvalidParameterException: unsupported availability zone"
        ));
        assert!(err.is_terminal());

        let err = CloudError::Other(anyhow!("Throttling: rate exceeded"));
        assert!(!err.is_terminal());
    }

    #[test]
    fn worker_observation_ready_only_in_success_states() {
        let mut workers = WorkerObservation {
            status: "CREATE_IN_PROGRESS".to_string(),
            ..Default::default()
        };
        assert!(!workers.is_ready());

        workers.status = STACK_STATUS_CREATE_COMPLETE.to_string();
        assert!(workers.is_ready());

        workers.status = STACK_STATUS_UPDATE_COMPLETE.to_string();
        assert!(workers.is_ready());

        workers.status = "ROLLBACK_COMPLETE".to_string();
        assert!(!workers.is_ready());
    }
}
