//! Custom Resource Definitions for the flowgrid Kubernetes Operator
//!
//! This module defines the `FlowPipeline` CRD that declares a flow-log
//! processing pipeline. The operator watches these resources and drives the
//! pipeline workloads toward the declared state.

use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// Regex for validating Kubernetes names (RFC 1123 subdomain)
static NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Regex for validating broker bootstrap addresses (host:port)
static ADDRESS_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9.\-]+:[0-9]{1,5}$").unwrap());

/// Validate a Kubernetes name (RFC 1123 subdomain)
fn validate_k8s_name(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(()); // Empty is allowed for optional fields
    }
    if value.len() > 63 {
        return Err(
            ValidationError::new("name_too_long").with_message("name exceeds 63 characters".into())
        );
    }
    if !NAME_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_name").with_message(
            format!("'{}' is not a valid Kubernetes name (RFC 1123)", value).into(),
        ));
    }
    Ok(())
}

/// Validate a broker bootstrap address (host:port, empty allowed)
fn validate_broker_address(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(()); // Empty is allowed when the deployment model is direct
    }
    if !ADDRESS_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_address")
            .with_message(format!("'{}' is not a valid host:port address", value).into()));
    }
    Ok(())
}

/// FlowPipeline custom resource definition
///
/// Declares a distributed flow-log processing pipeline: how flow records are
/// ingested (directly from agents or through a message broker), how the
/// processor is tuned, and where enriched records are exported.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema, Validate)]
#[kube(
    group = "flowgrid.io",
    version = "v1alpha1",
    kind = "FlowPipeline",
    plural = "flowpipelines",
    shortname = "fgp",
    namespaced,
    status = "FlowPipelineStatus",
    printcolumn = r#"{"name":"Model", "type":"string", "jsonPath":".spec.deploymentModel"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FlowPipelineSpec {
    /// Namespace where pipeline workloads are deployed
    #[serde(default = "default_namespace")]
    #[validate(custom(function = "validate_k8s_name"))]
    pub namespace: String,

    /// How the pipeline is deployed: a single process consuming directly
    /// from the agents, or split into broker-backed roles
    #[serde(default)]
    pub deployment_model: DeploymentModel,

    /// Upstream flow agent configuration
    #[serde(default)]
    pub agent: AgentSpec,

    /// Processor tuning
    #[serde(default)]
    #[validate(nested)]
    pub processor: ProcessorSpec,

    /// Broker connection, used when the deployment model is `broker`
    #[serde(default)]
    #[validate(nested)]
    pub broker: BrokerSpec,

    /// Additional exporters fed by the transform stages (max 8)
    #[serde(default)]
    #[validate(length(max = 8, message = "maximum 8 exporters allowed"), nested)]
    pub exporters: Vec<ExporterSpec>,
}

/// Pipeline deployment topology
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum DeploymentModel {
    /// Single-process monolith ingesting directly from the agents
    #[default]
    Direct,
    /// Ingest and transform split across a message broker
    Broker,
}

/// Upstream flow agent configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    /// Wire protocol the agent emits flow records with
    #[serde(default)]
    pub protocol: AgentProtocol,
}

/// Wire protocol used by the upstream flow agent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum AgentProtocol {
    /// Packed binary flow records; the performance path and the default
    #[default]
    Protobuf,
    /// Structured-text flow records from IPFIX exporters
    Ipfix,
}

impl AgentProtocol {
    /// Whether the agent emits the packed binary format
    pub fn is_packed_binary(self) -> bool {
        matches!(self, AgentProtocol::Protobuf)
    }
}

/// Processor tuning parameters
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorSpec {
    /// Port the collector ingest stage listens on
    #[serde(default = "default_port")]
    #[validate(range(min = 1, message = "port must be non-zero"))]
    pub port: u16,

    /// Fixed replica count for broker consumer workloads
    #[serde(default = "default_consumer_replicas")]
    #[validate(range(min = 1, max = 100, message = "consumerReplicas must be between 1 and 100"))]
    pub consumer_replicas: i32,

    /// Capacity of the broker pull queue, in messages
    #[serde(default = "default_queue_capacity")]
    #[validate(range(min = 1, message = "consumerQueueCapacity must be non-zero"))]
    pub consumer_queue_capacity: u32,

    /// Ceiling on the byte size of one broker pull batch
    #[serde(default = "default_batch_bytes")]
    #[validate(range(min = 1, message = "consumerBatchBytes must be non-zero"))]
    pub consumer_batch_bytes: i64,

    /// Autoscaling policy for the transformer workload; absent disables it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub autoscaler: Option<AutoscalerSpec>,
}

impl Default for ProcessorSpec {
    fn default() -> Self {
        Self {
            port: default_port(),
            consumer_replicas: default_consumer_replicas(),
            consumer_queue_capacity: default_queue_capacity(),
            consumer_batch_bytes: default_batch_bytes(),
            autoscaler: None,
        }
    }
}

/// Autoscaling policy for a pipeline workload
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalerSpec {
    /// Lower replica bound; defaults to 1 when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,

    /// Upper replica bound
    #[serde(default = "default_max_replicas")]
    #[validate(range(min = 1, max = 100, message = "maxReplicas must be between 1 and 100"))]
    pub max_replicas: i32,

    /// Target average CPU utilization, in percent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(range(min = 1, max = 100, message = "target utilization is a percentage"))]
    pub target_cpu_utilization_percentage: Option<i32>,
}

/// Message broker connection
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSpec {
    /// Bootstrap address, host:port
    #[serde(default)]
    #[validate(custom(function = "validate_broker_address"))]
    pub address: String,

    /// Topic carrying flow records
    #[serde(default)]
    #[validate(length(max = 255, message = "topic exceeds 255 characters"))]
    pub topic: String,

    /// TLS client configuration
    #[serde(default)]
    #[validate(nested)]
    pub tls: ClientTls,

    /// SASL authentication
    #[serde(default)]
    #[validate(nested)]
    pub sasl: SaslSpec,
}

/// TLS client configuration for a broker connection
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ClientTls {
    /// Enable TLS
    #[serde(default)]
    pub enabled: bool,

    /// Skip server certificate verification
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// CA certificate used to verify the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub ca_cert: Option<CredentialRef>,

    /// Client certificate/key pair for mutual TLS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub user_cert: Option<CredentialRef>,
}

/// SASL authentication for a broker connection
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SaslSpec {
    /// SASL mechanism; absent disables SASL entirely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mechanism: Option<SaslMechanism>,

    /// Secret holding the SASL client id and password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(nested)]
    pub secret: Option<CredentialRef>,
}

impl SaslSpec {
    /// Whether SASL authentication is requested
    pub fn enabled(&self) -> bool {
        self.mechanism.is_some()
    }
}

/// SASL mechanism
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum SaslMechanism {
    #[serde(rename = "PLAIN")]
    Plain,
    #[serde(rename = "SCRAM-SHA-512")]
    ScramSha512,
}

/// Reference to a credential held in a Secret or ConfigMap
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRef {
    /// Kind of object holding the credential
    #[serde(default)]
    pub kind: CredentialKind,

    /// Object name
    #[validate(custom(function = "validate_k8s_name"))]
    pub name: String,

    /// Object namespace; defaults to the pipeline namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[validate(custom(function = "validate_k8s_name"))]
    pub namespace: Option<String>,

    /// Data key inside the object; absent digests every entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Kind of Kubernetes object holding a credential
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum CredentialKind {
    #[default]
    Secret,
    ConfigMap,
}

/// Exporter fed by the transform stages
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ExporterSpec {
    /// Exporter kind
    #[serde(default)]
    pub kind: ExporterKind,

    /// Broker connection for broker exporters
    #[serde(default)]
    #[validate(nested)]
    pub broker: BrokerSpec,
}

/// Kind of exporter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum ExporterKind {
    /// Re-publish enriched records to a message broker
    #[default]
    Broker,
}

/// Status of a FlowPipeline
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FlowPipelineStatus {
    /// Current phase of the pipeline
    #[serde(default)]
    pub phase: PipelinePhase,

    /// Conditions describing pipeline state
    #[serde(default)]
    pub conditions: Vec<PipelineCondition>,

    /// Current observed generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Last time the status was updated
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<String>,

    /// Error message if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Lifecycle phase of a FlowPipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum PipelinePhase {
    /// Pipeline has not been reconciled yet
    #[default]
    Pending,
    /// All requested roles reconciled successfully
    Ready,
    /// The last reconciliation cycle failed
    Failed,
}

/// One condition in a FlowPipeline status
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PipelineCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, Unknown)
    pub status: String,

    /// Reason for the condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last transition time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl FlowPipelineSpec {
    /// Whether the pipeline is split across a message broker
    pub fn uses_broker(&self) -> bool {
        self.deployment_model == DeploymentModel::Broker
    }
}

fn default_namespace() -> String {
    "flowgrid".to_string()
}

fn default_port() -> u16 {
    2055
}

fn default_consumer_replicas() -> i32 {
    3
}

fn default_queue_capacity() -> u32 {
    1000
}

fn default_batch_bytes() -> i64 {
    10_485_760
}

fn default_max_replicas() -> i32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_spec() -> FlowPipelineSpec {
        serde_json::from_value(serde_json::json!({})).unwrap()
    }

    #[test]
    fn test_spec_defaults() {
        let spec = create_test_spec();
        assert_eq!(spec.namespace, "flowgrid");
        assert_eq!(spec.deployment_model, DeploymentModel::Direct);
        assert_eq!(spec.agent.protocol, AgentProtocol::Protobuf);
        assert_eq!(spec.processor.port, 2055);
        assert_eq!(spec.processor.consumer_replicas, 3);
        assert_eq!(spec.processor.consumer_queue_capacity, 1000);
        assert_eq!(spec.processor.consumer_batch_bytes, 10_485_760);
        assert!(spec.processor.autoscaler.is_none());
        assert!(spec.exporters.is_empty());
        assert!(!spec.uses_broker());
    }

    #[test]
    fn test_unset_protocol_defaults_to_packed_binary() {
        let agent: AgentSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(agent.protocol.is_packed_binary());

        let agent: AgentSpec =
            serde_json::from_value(serde_json::json!({"protocol": "ipfix"})).unwrap();
        assert!(!agent.protocol.is_packed_binary());
    }

    #[test]
    fn test_spec_validation() {
        let mut spec = create_test_spec();
        assert!(spec.validate().is_ok());

        spec.namespace = "Not_A_Valid_Namespace".to_string();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_broker_address_validation() {
        let mut broker = BrokerSpec::default();
        assert!(broker.validate().is_ok());

        broker.address = "broker.flowgrid.svc:9092".to_string();
        assert!(broker.validate().is_ok());

        broker.address = "no port here".to_string();
        assert!(broker.validate().is_err());
    }

    #[test]
    fn test_sasl_enabled() {
        let mut sasl = SaslSpec::default();
        assert!(!sasl.enabled());

        sasl.mechanism = Some(SaslMechanism::Plain);
        assert!(sasl.enabled());
    }

    #[test]
    fn test_processor_bounds() {
        let mut processor = ProcessorSpec::default();
        assert!(processor.validate().is_ok());

        processor.consumer_replicas = 0;
        assert!(processor.validate().is_err());

        processor.consumer_replicas = 101;
        assert!(processor.validate().is_err());
    }

    #[test]
    fn test_sasl_mechanism_wire_format() {
        let json = serde_json::to_string(&SaslMechanism::ScramSha512).unwrap();
        assert_eq!(json, "\"SCRAM-SHA-512\"");
    }
}
