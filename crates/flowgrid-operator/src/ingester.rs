//! Ingester role reconciler
//!
//! The ingester bridges agents that cannot publish to the broker themselves:
//! it listens on the collector port and forwards raw records to the broker
//! topic, without running any transforms. Selected when the deployment model
//! is `broker` and the agents emit the structured-text protocol; packed
//! binary agents publish to the broker directly and need no bridge.

use crate::builder::PipelineBuilder;
use crate::crd::FlowPipeline;
use crate::dispatcher::{Instance, ReconcileContext, RoleArtifacts, RoleKind, RoleReconciler};
use crate::error::Result;
use crate::rbac;
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Reconciles the collector-to-broker forwarder deployment
pub struct IngesterReconciler {
    instance: Instance,
}

impl IngesterReconciler {
    /// Create the reconciler for a role instance
    pub fn new(instance: Instance) -> Self {
        Self { instance }
    }
}

#[async_trait]
impl RoleReconciler for IngesterReconciler {
    fn role(&self) -> RoleKind {
        RoleKind::Ingester
    }

    async fn reconcile(&self, ctx: &ReconcileContext, desired: &FlowPipeline) -> Result<()> {
        let spec = &desired.spec;
        if !spec.uses_broker() || spec.agent.protocol.is_packed_binary() {
            debug!(role = %self.role(), "Ingester not requested, removing owned objects");
            return self
                .instance
                .applier
                .cleanup(ctx, self.role(), &spec.namespace)
                .await;
        }

        info!(role = %self.role(), namespace = %spec.namespace, "Reconciling ingester workload");
        let builder = PipelineBuilder::new(&self.instance, spec);
        let (graph, annotations) = builder.build_forwarder_pipeline(ctx).await?;

        let artifacts = RoleArtifacts {
            role: self.role(),
            name: self.instance.name.clone(),
            namespace: spec.namespace.clone(),
            image: self.instance.image.clone(),
            graph,
            annotations,
            // Daemon-style listener, like the monolith
            replicas: None,
            autoscaler: None,
            cluster_role: rbac::build_cluster_role(self.role()),
            cluster_role_binding: rbac::build_cluster_role_binding(self.role(), &spec.namespace),
        };
        self.instance.applier.apply(ctx, artifacts).await
    }

    async fn cleanup_namespace(&self, ctx: &ReconcileContext, namespace: &str) {
        if let Err(e) = self
            .instance
            .applier
            .cleanup(ctx, self.role(), namespace)
            .await
        {
            warn!(role = %self.role(), error = %e, "Cleanup failed, leaving for the next cycle");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AgentProtocol, DeploymentModel, FlowPipelineSpec};
    use crate::digest::MemorySecretReader;
    use crate::dispatcher::{Common, WorkloadApplier};
    use std::sync::{Arc, Mutex};
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct RecordingApplier {
        applied: Mutex<Vec<RoleArtifacts>>,
        cleaned: Mutex<Vec<(RoleKind, String)>>,
    }

    #[async_trait]
    impl WorkloadApplier for RecordingApplier {
        async fn apply(&self, _ctx: &ReconcileContext, artifacts: RoleArtifacts) -> Result<()> {
            self.applied.lock().unwrap().push(artifacts);
            Ok(())
        }

        async fn cleanup(
            &self,
            _ctx: &ReconcileContext,
            role: RoleKind,
            namespace: &str,
        ) -> Result<()> {
            self.cleaned
                .lock()
                .unwrap()
                .push((role, namespace.to_string()));
            Ok(())
        }
    }

    fn create_test_pipeline(
        model: DeploymentModel,
        protocol: AgentProtocol,
    ) -> FlowPipeline {
        let mut spec: FlowPipelineSpec = serde_json::from_value(serde_json::json!({})).unwrap();
        spec.deployment_model = model;
        spec.agent.protocol = protocol;
        spec.broker.address = "b:9092".to_string();
        spec.broker.topic = "flows".to_string();
        FlowPipeline::new("test", spec)
    }

    fn create_reconciler(applier: Arc<RecordingApplier>) -> IngesterReconciler {
        let common = Common {
            applier,
            reader: Arc::new(MemorySecretReader::new()),
            image: "ghcr.io/flowgrid/pipeline:test".to_string(),
        };
        IngesterReconciler::new(common.new_instance(RoleKind::Ingester))
    }

    fn test_context() -> ReconcileContext {
        ReconcileContext::new(CancellationToken::new())
    }

    #[tokio::test]
    async fn test_structured_text_agents_get_a_forwarder() {
        let applier = Arc::new(RecordingApplier::default());
        let reconciler = create_reconciler(Arc::clone(&applier));

        reconciler
            .reconcile(
                &test_context(),
                &create_test_pipeline(DeploymentModel::Broker, AgentProtocol::Ipfix),
            )
            .await
            .unwrap();

        let applied = applier.applied.lock().unwrap();
        assert_eq!(applied.len(), 1);
        let artifacts = &applied[0];
        assert_eq!(artifacts.name, "flowgrid-pipeline-ingester");
        let names: Vec<_> = artifacts
            .graph
            .stages()
            .iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["collector", "broker-write"]);
    }

    #[tokio::test]
    async fn test_packed_binary_agents_need_no_ingester() {
        let applier = Arc::new(RecordingApplier::default());
        let reconciler = create_reconciler(Arc::clone(&applier));

        reconciler
            .reconcile(
                &test_context(),
                &create_test_pipeline(DeploymentModel::Broker, AgentProtocol::Protobuf),
            )
            .await
            .unwrap();

        assert!(applier.applied.lock().unwrap().is_empty());
        assert_eq!(applier.cleaned.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_direct_model_needs_no_ingester() {
        let applier = Arc::new(RecordingApplier::default());
        let reconciler = create_reconciler(Arc::clone(&applier));

        reconciler
            .reconcile(
                &test_context(),
                &create_test_pipeline(DeploymentModel::Direct, AgentProtocol::Ipfix),
            )
            .await
            .unwrap();

        assert!(applier.applied.lock().unwrap().is_empty());
        assert_eq!(applier.cleaned.lock().unwrap().len(), 1);
    }
}
