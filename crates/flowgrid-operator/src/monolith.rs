//! Monolith role reconciler
//!
//! The monolith runs the whole pipeline in a single process: agents push
//! flow records straight into its collector stage and the transform stages
//! run in the same graph. Selected when the deployment model is `direct`.

use crate::builder::PipelineBuilder;
use crate::crd::{DeploymentModel, FlowPipeline};
use crate::dispatcher::{Instance, ReconcileContext, RoleArtifacts, RoleKind, RoleReconciler};
use crate::error::Result;
use crate::rbac;
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Reconciles the single-process pipeline deployment
pub struct MonolithReconciler {
    instance: Instance,
}

impl MonolithReconciler {
    /// Create the reconciler for a role instance
    pub fn new(instance: Instance) -> Self {
        Self { instance }
    }
}

#[async_trait]
impl RoleReconciler for MonolithReconciler {
    fn role(&self) -> RoleKind {
        RoleKind::Monolith
    }

    async fn reconcile(&self, ctx: &ReconcileContext, desired: &FlowPipeline) -> Result<()> {
        let spec = &desired.spec;
        if spec.deployment_model != DeploymentModel::Direct {
            // Decommissioned by a model switch; drop whatever this role owns
            debug!(role = %self.role(), "Monolith not requested, removing owned objects");
            return self
                .instance
                .applier
                .cleanup(ctx, self.role(), &spec.namespace)
                .await;
        }

        info!(role = %self.role(), namespace = %spec.namespace, "Reconciling monolith workload");
        let builder = PipelineBuilder::new(&self.instance, spec);
        let (graph, annotations) = builder.build_collector_pipeline(ctx).await?;

        let artifacts = RoleArtifacts {
            role: self.role(),
            name: self.instance.name.clone(),
            namespace: spec.namespace.clone(),
            image: self.instance.image.clone(),
            graph,
            annotations,
            // Daemon-style: one listener per node, no fixed replica count
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
