//! Pipeline configuration graph
//!
//! A [`PipelineGraph`] is the ordered sequence of processing stages handed to
//! a pipeline workload as its startup configuration: exactly one ingest stage
//! at the root, followed by transform and write stages that each consume from
//! a named predecessor. The graph is rebuilt from scratch on every
//! reconciliation cycle; nothing in it survives across cycles.

use crate::crd::SaslMechanism;
use crate::error::{OperatorError, Result};
use serde::{Deserialize, Serialize};

/// One node in the processing pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    /// Stage name, unique within the graph
    pub name: String,

    /// Name of the stage this one consumes from; absent for the ingest root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub follows: Option<String>,
}

/// Parameters attached to a named stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageParams {
    /// Name of the stage these parameters belong to
    pub name: String,

    #[serde(flatten)]
    pub kind: StageKind,
}

/// Stage-specific parameter set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StageKind {
    /// Listen for flow records pushed directly by the agents
    IngestCollector(CollectorParams),
    /// Consume flow records from a message broker
    IngestBroker(BrokerIngestParams),
    /// Normalize decoded records into the canonical field set
    TransformEnrich,
    /// Publish records to a message broker
    WriteBroker(BrokerWriteParams),
}

impl StageKind {
    /// Whether this parameter set belongs to an ingest stage
    pub fn is_ingest(&self) -> bool {
        matches!(
            self,
            StageKind::IngestCollector(_) | StageKind::IngestBroker(_)
        )
    }
}

/// Decoder applied to incoming flow records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderKind {
    /// Packed binary records
    Protobuf,
    /// Structured-text records
    Json,
}

/// Parameters for the collector ingest stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorParams {
    /// Listen port
    pub port: u16,

    /// Decoder for the records the agents push
    pub decoder: DecoderKind,
}

/// Parameters for the broker ingest stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerIngestParams {
    /// Bootstrap addresses
    pub brokers: Vec<String>,

    /// Topic to consume
    pub topic: String,

    /// Consumer group identifier; without one, every consumer would receive
    /// every message
    pub group_id: String,

    /// Decoder for the consumed records
    pub decoder: DecoderKind,

    /// TLS client parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<BrokerTlsParams>,

    /// SASL client parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sasl: Option<BrokerSaslParams>,

    /// Capacity of the pull queue, in messages
    pub pull_queue_capacity: u32,

    /// Ceiling on the byte size of one pull batch
    pub pull_max_bytes: i64,
}

/// Parameters for a broker write stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerWriteParams {
    /// Bootstrap addresses
    pub brokers: Vec<String>,

    /// Topic to publish to
    pub topic: String,

    /// TLS client parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<BrokerTlsParams>,

    /// SASL client parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sasl: Option<BrokerSaslParams>,
}

/// TLS client parameters, with certificates as mounted file paths
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerTlsParams {
    /// Skip server certificate verification
    #[serde(default)]
    pub insecure_skip_verify: bool,

    /// Path of the mounted CA certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_path: Option<String>,

    /// Path of the mounted client certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_cert_path: Option<String>,

    /// Path of the mounted client key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_key_path: Option<String>,
}

/// SASL client parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSaslParams {
    /// SASL mechanism
    pub mechanism: SaslMechanism,

    /// Path of the mounted credentials file
    pub secret_path: String,
}

/// Ordered stage sequence plus per-stage parameters
///
/// Invariants enforced here: exactly one ingest stage roots the graph, every
/// appended stage consumes from an existing stage, and stage names are
/// unique. Violations are programming defects and surface as
/// [`OperatorError::Build`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineGraph {
    stages: Vec<Stage>,
    parameters: Vec<StageParams>,
}

impl PipelineGraph {
    /// Start a graph rooted at a collector ingest stage
    pub fn new_collector_pipeline(name: &str, params: CollectorParams) -> Self {
        Self::new_root(name, StageKind::IngestCollector(params))
    }

    /// Start a graph rooted at a broker ingest stage
    pub fn new_broker_pipeline(name: &str, params: BrokerIngestParams) -> Self {
        Self::new_root(name, StageKind::IngestBroker(params))
    }

    fn new_root(name: &str, kind: StageKind) -> Self {
        Self {
            stages: vec![Stage {
                name: name.to_string(),
                follows: None,
            }],
            parameters: vec![StageParams {
                name: name.to_string(),
                kind,
            }],
        }
    }

    /// Append a stage consuming from `follows`
    pub fn append(&mut self, name: &str, follows: &str, kind: StageKind) -> Result<()> {
        if kind.is_ingest() {
            return Err(OperatorError::Build(format!(
                "stage '{}' is an ingest stage; a pipeline has exactly one ingest root",
                name
            )));
        }
        if self.stages.iter().any(|s| s.name == name) {
            return Err(OperatorError::Build(format!(
                "stage name '{}' is already in use",
                name
            )));
        }
        if !self.stages.iter().any(|s| s.name == follows) {
            return Err(OperatorError::Build(format!(
                "stage '{}' follows unknown stage '{}'",
                name, follows
            )));
        }

        self.stages.push(Stage {
            name: name.to_string(),
            follows: Some(follows.to_string()),
        });
        self.parameters.push(StageParams {
            name: name.to_string(),
            kind,
        });
        Ok(())
    }

    /// The ordered stage sequence
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// The per-stage parameter mapping
    pub fn parameters(&self) -> &[StageParams] {
        &self.parameters
    }

    /// Parameters of the named stage, if present
    pub fn params_of(&self, name: &str) -> Option<&StageParams> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// Serialize the graph as the workload's startup configuration
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector_params() -> CollectorParams {
        CollectorParams {
            port: 2055,
            decoder: DecoderKind::Protobuf,
        }
    }

    #[test]
    fn test_root_is_single_ingest() {
        let graph = PipelineGraph::new_collector_pipeline("collector", collector_params());
        assert_eq!(graph.stages().len(), 1);
        assert_eq!(graph.stages()[0].name, "collector");
        assert!(graph.stages()[0].follows.is_none());
    }

    #[test]
    fn test_append_preserves_connectivity() {
        let mut graph = PipelineGraph::new_collector_pipeline("collector", collector_params());
        graph
            .append("enrich", "collector", StageKind::TransformEnrich)
            .unwrap();

        assert_eq!(graph.stages().len(), 2);
        assert_eq!(graph.stages()[1].follows.as_deref(), Some("collector"));
        assert!(graph.params_of("enrich").is_some());
    }

    #[test]
    fn test_append_to_unknown_stage_is_build_error() {
        let mut graph = PipelineGraph::new_collector_pipeline("collector", collector_params());
        let err = graph
            .append("enrich", "nowhere", StageKind::TransformEnrich)
            .unwrap_err();
        assert!(matches!(err, OperatorError::Build(_)));
    }

    #[test]
    fn test_second_ingest_is_build_error() {
        let mut graph = PipelineGraph::new_collector_pipeline("collector", collector_params());
        let err = graph
            .append(
                "again",
                "collector",
                StageKind::IngestCollector(collector_params()),
            )
            .unwrap_err();
        assert!(matches!(err, OperatorError::Build(_)));
    }

    #[test]
    fn test_duplicate_stage_name_is_build_error() {
        let mut graph = PipelineGraph::new_collector_pipeline("collector", collector_params());
        graph
            .append("enrich", "collector", StageKind::TransformEnrich)
            .unwrap();
        let err = graph
            .append("enrich", "collector", StageKind::TransformEnrich)
            .unwrap_err();
        assert!(matches!(err, OperatorError::Build(_)));
    }

    #[test]
    fn test_json_serialization_shape() {
        let mut graph = PipelineGraph::new_broker_pipeline(
            "broker-read",
            BrokerIngestParams {
                brokers: vec!["b:9092".to_string()],
                topic: "flows".to_string(),
                group_id: "flowgrid-pipeline-transformer".to_string(),
                decoder: DecoderKind::Json,
                tls: None,
                sasl: None,
                pull_queue_capacity: 1000,
                pull_max_bytes: 10_485_760,
            },
        );
        graph
            .append("enrich", "broker-read", StageKind::TransformEnrich)
            .unwrap();

        let json = graph.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["stages"][0]["name"], "broker-read");
        assert_eq!(value["stages"][1]["follows"], "broker-read");
        assert_eq!(value["parameters"][0]["kind"], "ingestBroker");
        assert_eq!(value["parameters"][0]["decoder"], "json");
        assert!(value["parameters"][0].get("tls").is_none());
    }
}
