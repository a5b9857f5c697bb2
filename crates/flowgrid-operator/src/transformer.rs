//! Transformer role reconciler
//!
//! The transformer consumes flow records from the message broker and runs
//! the transform stages. Selected when the deployment model is `broker`; the
//! only role that scales horizontally, so it carries the autoscaling policy.

use crate::builder::PipelineBuilder;
use crate::crd::FlowPipeline;
use crate::dispatcher::{Instance, ReconcileContext, RoleArtifacts, RoleKind, RoleReconciler};
use crate::error::Result;
use crate::rbac;
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Reconciles the broker-consuming transformer deployment
pub struct TransformerReconciler {
    instance: Instance,
}

impl TransformerReconciler {
    /// Create the reconciler for a role instance
    pub fn new(instance: Instance) -> Self {
        Self { instance }
    }
}

#[async_trait]
impl RoleReconciler for TransformerReconciler {
    fn role(&self) -> RoleKind {
        RoleKind::Transformer
    }

    async fn reconcile(&self, ctx: &ReconcileContext, desired: &FlowPipeline) -> Result<()> {
        let spec = &desired.spec;
        if !spec.uses_broker() {
            debug!(role = %self.role(), "Transformer not requested, removing owned objects");
            return self
                .instance
                .applier
                .cleanup(ctx, self.role(), &spec.namespace)
                .await;
        }

        info!(role = %self.role(), namespace = %spec.namespace, "Reconciling transformer workload");
        let builder = PipelineBuilder::new(&self.instance, spec);
        let (graph, annotations) = builder.build_broker_pipeline(ctx).await?;

        let artifacts = RoleArtifacts {
            role: self.role(),
            name: self.instance.name.clone(),
            namespace: spec.namespace.clone(),
            image: self.instance.image.clone(),
            graph,
            annotations,
            replicas: Some(spec.processor.consumer_replicas),
            autoscaler: spec.processor.autoscaler.clone(),
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
