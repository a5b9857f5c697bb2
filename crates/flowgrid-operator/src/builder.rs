//! Pipeline configuration builder
//!
//! Turns one role's view of the desired state into a [`PipelineGraph`] plus
//! the digest annotations that force dependent workloads to restart when a
//! credential rotates. The graph is a pure function of the desired spec and
//! the resolved digests; nothing is cached across cycles.

use crate::crd::{BrokerSpec, ClientTls, CredentialRef, ExporterKind, FlowPipelineSpec, SaslSpec};
use crate::digest::{AnnotationSet, DigestTracker};
use crate::dispatcher::{Instance, ReconcileContext};
use crate::error::{OperatorError, Result};
use crate::pipeline::{
    BrokerIngestParams, BrokerSaslParams, BrokerTlsParams, BrokerWriteParams, CollectorParams,
    DecoderKind, PipelineGraph, StageKind,
};
use tracing::debug;

/// Directory where the manifest collaborator mounts credential volumes
const CREDENTIALS_DIR: &str = "/var/run/flowgrid";

/// Name of the collector ingest stage
const COLLECTOR_STAGE: &str = "collector";

/// Name of the broker ingest stage
const BROKER_READ_STAGE: &str = "broker-read";

/// Name of the ingester's broker write stage
const BROKER_WRITE_STAGE: &str = "broker-write";

/// Name of the shared enrichment transform stage
const ENRICH_STAGE: &str = "enrich";

/// Annotation prefix for the main broker connection's credentials
const BROKER_PREFIX: &str = "broker";

/// Builds the pipeline configuration for one role
pub struct PipelineBuilder<'a> {
    instance: &'a Instance,
    desired: &'a FlowPipelineSpec,
}

impl<'a> PipelineBuilder<'a> {
    /// Create a builder for the given role instance and desired state
    pub fn new(instance: &'a Instance, desired: &'a FlowPipelineSpec) -> Self {
        Self { instance, desired }
    }

    fn tracker(&self) -> DigestTracker<'_> {
        DigestTracker::new(self.instance.reader.as_ref(), &self.desired.namespace)
    }

    /// Decoder for the ingest stage.
    ///
    /// Exactly one kind is chosen: agents emitting anything other than the
    /// packed binary format get the structured-text decoder, everything else
    /// gets the packed binary one. Transform stages assume the decoder has
    /// already normalized fields.
    fn decoder(&self) -> DecoderKind {
        if self.desired.agent.protocol.is_packed_binary() {
            DecoderKind::Protobuf
        } else {
            DecoderKind::Json
        }
    }

    /// Collector-rooted pipeline for the monolith role: agents push records
    /// straight into the process, transforms run in the same graph
    pub async fn build_collector_pipeline(
        &self,
        ctx: &ReconcileContext,
    ) -> Result<(PipelineGraph, AnnotationSet)> {
        let mut annotations = AnnotationSet::new();
        let mut graph = PipelineGraph::new_collector_pipeline(
            COLLECTOR_STAGE,
            CollectorParams {
                port: self.desired.processor.port,
                decoder: self.decoder(),
            },
        );
        self.append_transform_stages(ctx, &mut graph, COLLECTOR_STAGE, &mut annotations)
            .await?;
        debug!(role = %self.instance.role, stages = graph.stages().len(), "Built collector pipeline");
        Ok((graph, annotations))
    }

    /// Broker-rooted pipeline for the transformer role
    pub async fn build_broker_pipeline(
        &self,
        ctx: &ReconcileContext,
    ) -> Result<(PipelineGraph, AnnotationSet)> {
        let broker = &self.desired.broker;
        ensure_broker_configured(broker)?;

        let mut annotations = AnnotationSet::new();
        self.tracker()
            .annotate_broker_certs(ctx, BROKER_PREFIX, broker, &mut annotations)
            .await?;

        let processor = &self.desired.processor;
        let mut graph = PipelineGraph::new_broker_pipeline(
            BROKER_READ_STAGE,
            BrokerIngestParams {
                brokers: vec![broker.address.clone()],
                topic: broker.topic.clone(),
                // The generated workload name keeps the consumer group stable
                // across cycles and operator restarts
                group_id: self.instance.name.clone(),
                decoder: self.decoder(),
                tls: client_tls_params(&broker.tls, "broker-cert"),
                sasl: sasl_params(&broker.sasl, "broker-sasl"),
                pull_queue_capacity: processor.consumer_queue_capacity,
                pull_max_bytes: processor.consumer_batch_bytes,
            },
        );
        self.append_transform_stages(ctx, &mut graph, BROKER_READ_STAGE, &mut annotations)
            .await?;
        debug!(role = %self.instance.role, stages = graph.stages().len(), "Built broker pipeline");
        Ok((graph, annotations))
    }

    /// Collector-to-broker pipeline for the ingester role: raw records in,
    /// broker out, no transforms
    pub async fn build_forwarder_pipeline(
        &self,
        ctx: &ReconcileContext,
    ) -> Result<(PipelineGraph, AnnotationSet)> {
        let broker = &self.desired.broker;
        ensure_broker_configured(broker)?;

        let mut annotations = AnnotationSet::new();
        self.tracker()
            .annotate_broker_certs(ctx, BROKER_PREFIX, broker, &mut annotations)
            .await?;

        let mut graph = PipelineGraph::new_collector_pipeline(
            COLLECTOR_STAGE,
            CollectorParams {
                port: self.desired.processor.port,
                decoder: self.decoder(),
            },
        );
        graph.append(
            BROKER_WRITE_STAGE,
            COLLECTOR_STAGE,
            StageKind::WriteBroker(BrokerWriteParams {
                brokers: vec![broker.address.clone()],
                topic: broker.topic.clone(),
                tls: client_tls_params(&broker.tls, "broker-cert"),
                sasl: sasl_params(&broker.sasl, "broker-sasl"),
            }),
        )?;
        debug!(role = %self.instance.role, stages = graph.stages().len(), "Built forwarder pipeline");
        Ok((graph, annotations))
    }

    /// Shared transform assembly: the enrichment stage plus one write stage
    /// per configured exporter, each with its own credential digests
    async fn append_transform_stages(
        &self,
        ctx: &ReconcileContext,
        graph: &mut PipelineGraph,
        follows: &str,
        annotations: &mut AnnotationSet,
    ) -> Result<()> {
        graph.append(ENRICH_STAGE, follows, StageKind::TransformEnrich)?;

        for (i, exporter) in self.desired.exporters.iter().enumerate() {
            match exporter.kind {
                ExporterKind::Broker => {
                    let prefix = format!("export-{}", i);
                    ensure_broker_configured(&exporter.broker)?;
                    self.tracker()
                        .annotate_broker_certs(ctx, &prefix, &exporter.broker, annotations)
                        .await?;
                    graph.append(
                        &prefix,
                        ENRICH_STAGE,
                        StageKind::WriteBroker(BrokerWriteParams {
                            brokers: vec![exporter.broker.address.clone()],
                            topic: exporter.broker.topic.clone(),
                            tls: client_tls_params(
                                &exporter.broker.tls,
                                &format!("{}-cert", prefix),
                            ),
                            sasl: sasl_params(&exporter.broker.sasl, &format!("{}-sasl", prefix)),
                        }),
                    )?;
                }
            }
        }
        Ok(())
    }
}

/// A broker-backed stage must never carry empty connection parameters
fn ensure_broker_configured(broker: &BrokerSpec) -> Result<()> {
    if broker.address.is_empty() {
        return Err(OperatorError::Validation(
            "broker address must be set for broker-backed stages".to_string(),
        ));
    }
    if broker.topic.is_empty() {
        return Err(OperatorError::Validation(
            "broker topic must be set for broker-backed stages".to_string(),
        ));
    }
    Ok(())
}

fn client_tls_params(tls: &ClientTls, mount: &str) -> Option<BrokerTlsParams> {
    if !tls.enabled {
        return None;
    }
    Some(BrokerTlsParams {
        insecure_skip_verify: tls.insecure_skip_verify,
        ca_cert_path: tls
            .ca_cert
            .as_ref()
            .map(|c| credential_path(mount, c, "ca.crt")),
        user_cert_path: tls
            .user_cert
            .as_ref()
            .map(|c| credential_path(mount, c, "tls.crt")),
        user_key_path: tls
            .user_cert
            .as_ref()
            .map(|_| format!("{}/{}/tls.key", CREDENTIALS_DIR, mount)),
    })
}

fn sasl_params(sasl: &SaslSpec, mount: &str) -> Option<BrokerSaslParams> {
    match (sasl.mechanism, &sasl.secret) {
        (Some(mechanism), Some(secret)) => Some(BrokerSaslParams {
            mechanism,
            secret_path: credential_path(mount, secret, "credentials"),
        }),
        _ => None,
    }
}

/// Path of a credential file inside its mounted volume
fn credential_path(mount: &str, reference: &CredentialRef, default_file: &str) -> String {
    let file = reference.key.as_deref().unwrap_or(default_file);
    format!("{}/{}/{}", CREDENTIALS_DIR, mount, file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AgentProtocol, CredentialKind, DeploymentModel, SaslMechanism};
    use crate::digest::{annotation_key, MemorySecretReader, SecretReader};
    use crate::dispatcher::{Common, RoleArtifacts, RoleKind, WorkloadApplier};
    use async_trait::async_trait;
    use sha2::{Digest, Sha256};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    struct NullApplier;

    #[async_trait]
    impl WorkloadApplier for NullApplier {
        async fn apply(&self, _ctx: &ReconcileContext, _artifacts: RoleArtifacts) -> Result<()> {
            Ok(())
        }

        async fn cleanup(
            &self,
            _ctx: &ReconcileContext,
            _role: RoleKind,
            _namespace: &str,
        ) -> Result<()> {
            Ok(())
        }
    }

    fn create_test_common(reader: Arc<dyn SecretReader>) -> Common {
        Common {
            applier: Arc::new(NullApplier),
            reader,
            image: "ghcr.io/flowgrid/pipeline:test".to_string(),
        }
    }

    fn create_test_spec() -> FlowPipelineSpec {
        let mut spec: FlowPipelineSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        spec.deployment_model = DeploymentModel::Broker;
        spec.broker.address = "b:9092".to_string();
        spec.broker.topic = "flows".to_string();
        spec
    }

    fn test_context() -> ReconcileContext {
        ReconcileContext::new(CancellationToken::new())
    }

    fn ca_ref() -> CredentialRef {
        CredentialRef {
            kind: CredentialKind::Secret,
            name: "broker-ca".to_string(),
            namespace: None,
            key: Some("ca.crt".to_string()),
        }
    }

    #[tokio::test]
    async fn test_plain_broker_pipeline_has_no_security_params() {
        // Scenario: broker at b:9092, topic flows, TLS and SASL disabled,
        // packed-binary agents
        let reader = Arc::new(MemorySecretReader::new());
        let common = create_test_common(reader);
        let instance = common.new_instance(RoleKind::Transformer);
        let spec = create_test_spec();

        let builder = PipelineBuilder::new(&instance, &spec);
        let (graph, annotations) = builder.build_broker_pipeline(&test_context()).await.unwrap();

        let params = graph.params_of(BROKER_READ_STAGE).unwrap();
        match &params.kind {
            StageKind::IngestBroker(p) => {
                assert_eq!(p.brokers, vec!["b:9092".to_string()]);
                assert_eq!(p.topic, "flows");
                assert_eq!(p.decoder, DecoderKind::Protobuf);
                assert!(p.tls.is_none());
                assert!(p.sasl.is_none());
                assert_eq!(p.pull_queue_capacity, 1000);
                assert_eq!(p.pull_max_bytes, 10_485_760);
            }
            other => panic!("unexpected ingest params: {:?}", other),
        }
        assert!(annotations.is_empty());
    }

    #[tokio::test]
    async fn test_ca_only_tls_yields_exactly_one_annotation() {
        let reader = Arc::new(MemorySecretReader::new());
        reader.put(
            CredentialKind::Secret,
            "flowgrid",
            "broker-ca",
            "ca.crt",
            b"ca-pem-bytes",
        );
        let common = create_test_common(reader);
        let instance = common.new_instance(RoleKind::Transformer);
        let mut spec = create_test_spec();
        spec.broker.tls.enabled = true;
        spec.broker.tls.ca_cert = Some(ca_ref());

        let builder = PipelineBuilder::new(&instance, &spec);
        let (graph, annotations) = builder.build_broker_pipeline(&test_context()).await.unwrap();

        assert_eq!(annotations.len(), 1);
        let expected = hex::encode(Sha256::digest(b"ca-pem-bytes"));
        assert_eq!(annotations.get(&annotation_key("broker-ca")), Some(&expected));

        match &graph.params_of(BROKER_READ_STAGE).unwrap().kind {
            StageKind::IngestBroker(p) => {
                let tls = p.tls.as_ref().unwrap();
                assert_eq!(
                    tls.ca_cert_path.as_deref(),
                    Some("/var/run/flowgrid/broker-cert/ca.crt")
                );
                assert!(tls.user_cert_path.is_none());
            }
            other => panic!("unexpected ingest params: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_decoder_follows_agent_protocol() {
        let reader = Arc::new(MemorySecretReader::new());
        let common = create_test_common(reader);
        let instance = common.new_instance(RoleKind::Transformer);

        let mut spec = create_test_spec();
        spec.agent.protocol = AgentProtocol::Ipfix;
        let builder = PipelineBuilder::new(&instance, &spec);
        let (graph, _) = builder.build_broker_pipeline(&test_context()).await.unwrap();
        match &graph.params_of(BROKER_READ_STAGE).unwrap().kind {
            StageKind::IngestBroker(p) => assert_eq!(p.decoder, DecoderKind::Json),
            other => panic!("unexpected ingest params: {:?}", other),
        }

        let mut spec = create_test_spec();
        spec.agent.protocol = AgentProtocol::Protobuf;
        let builder = PipelineBuilder::new(&instance, &spec);
        let (graph, _) = builder.build_broker_pipeline(&test_context()).await.unwrap();
        match &graph.params_of(BROKER_READ_STAGE).unwrap().kind {
            StageKind::IngestBroker(p) => assert_eq!(p.decoder, DecoderKind::Protobuf),
            other => panic!("unexpected ingest params: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_consumer_group_is_stable_across_builds() {
        let reader = Arc::new(MemorySecretReader::new());
        let common = create_test_common(reader);
        let instance = common.new_instance(RoleKind::Transformer);
        let spec = create_test_spec();

        let mut groups = Vec::new();
        for _ in 0..3 {
            let builder = PipelineBuilder::new(&instance, &spec);
            let (graph, _) = builder.build_broker_pipeline(&test_context()).await.unwrap();
            match &graph.params_of(BROKER_READ_STAGE).unwrap().kind {
                StageKind::IngestBroker(p) => groups.push(p.group_id.clone()),
                other => panic!("unexpected ingest params: {:?}", other),
            }
        }
        assert!(groups.iter().all(|g| g == "flowgrid-pipeline-transformer"));
    }

    #[tokio::test]
    async fn test_exporter_credentials_are_tracked_per_exporter() {
        let reader = Arc::new(MemorySecretReader::new());
        reader.put(
            CredentialKind::Secret,
            "flowgrid",
            "export-sasl",
            "credentials",
            b"user:password",
        );
        let common = create_test_common(reader);
        let instance = common.new_instance(RoleKind::Transformer);
        let mut spec = create_test_spec();
        spec.exporters = vec![crate::crd::ExporterSpec {
            kind: ExporterKind::Broker,
            broker: BrokerSpec {
                address: "export:9092".to_string(),
                topic: "enriched".to_string(),
                sasl: SaslSpec {
                    mechanism: Some(SaslMechanism::Plain),
                    secret: Some(CredentialRef {
                        kind: CredentialKind::Secret,
                        name: "export-sasl".to_string(),
                        namespace: None,
                        key: None,
                    }),
                },
                ..Default::default()
            },
        }];

        let builder = PipelineBuilder::new(&instance, &spec);
        let (graph, annotations) = builder.build_broker_pipeline(&test_context()).await.unwrap();

        assert!(annotations.contains_key(&annotation_key("export-0-sasl")));
        let export = graph.params_of("export-0").unwrap();
        match &export.kind {
            StageKind::WriteBroker(p) => {
                assert_eq!(p.topic, "enriched");
                assert_eq!(
                    p.sasl.as_ref().unwrap().secret_path,
                    "/var/run/flowgrid/export-0-sasl/credentials"
                );
            }
            other => panic!("unexpected export params: {:?}", other),
        }
        assert_eq!(
            graph.stages().last().unwrap().follows.as_deref(),
            Some(ENRICH_STAGE)
        );
    }

    #[tokio::test]
    async fn test_empty_broker_address_is_rejected() {
        let reader = Arc::new(MemorySecretReader::new());
        let common = create_test_common(reader);
        let instance = common.new_instance(RoleKind::Transformer);
        let mut spec = create_test_spec();
        spec.broker.address.clear();

        let builder = PipelineBuilder::new(&instance, &spec);
        let err = builder
            .build_broker_pipeline(&test_context())
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::Validation(_)));
    }

    #[tokio::test]
    async fn test_forwarder_pipeline_writes_to_broker() {
        let reader = Arc::new(MemorySecretReader::new());
        let common = create_test_common(reader);
        let instance = common.new_instance(RoleKind::Ingester);
        let spec = create_test_spec();

        let builder = PipelineBuilder::new(&instance, &spec);
        let (graph, _) = builder
            .build_forwarder_pipeline(&test_context())
            .await
            .unwrap();

        assert_eq!(graph.stages().len(), 2);
        assert_eq!(graph.stages()[0].name, COLLECTOR_STAGE);
        assert_eq!(graph.stages()[1].name, BROKER_WRITE_STAGE);
        assert_eq!(
            graph.stages()[1].follows.as_deref(),
            Some(COLLECTOR_STAGE)
        );
    }

    #[tokio::test]
    async fn test_unresolvable_credential_aborts_build() {
        let reader = Arc::new(MemorySecretReader::new());
        let common = create_test_common(reader);
        let instance = common.new_instance(RoleKind::Transformer);
        let mut spec = create_test_spec();
        spec.broker.tls.enabled = true;
        spec.broker.tls.ca_cert = Some(ca_ref());
        // Referenced secret is never inserted into the store

        let builder = PipelineBuilder::new(&instance, &spec);
        let err = builder
            .build_broker_pipeline(&test_context())
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::Resolution(_)));
    }
}
