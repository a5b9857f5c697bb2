//! Multi-role reconciliation dispatch
//!
//! One [`PipelineDispatcher`] owns the fixed, ordered collection of role
//! reconcilers for a pipeline object. A reconciliation cycle validates the
//! desired state once, then walks the roles in order and stops at the first
//! error; each role's objects are independent, so a partial apply is safe to
//! leave for the next cycle.

use crate::crd::{AutoscalerSpec, FlowPipeline, ProcessorSpec};
use crate::digest::{AnnotationSet, SecretReader};
use crate::error::{OperatorError, Result};
use crate::pipeline::PipelineGraph;
use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Ports reserved for host tunnel/encapsulation traffic (VXLAN, GENEVE,
/// IKE, IPsec NAT-T); a collector listening there would collide with node
/// networking
pub const RESERVED_PORTS: [u16; 4] = [4789, 6081, 500, 4500];

/// Base name of the managed pipeline workloads
pub const PIPELINE_NAME: &str = "flowgrid-pipeline";

/// Identity of a pipeline deployment role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    /// Single-process deployment ingesting directly from the agents
    Monolith,
    /// Broker consumer running the transform stages
    Transformer,
    /// Collector that forwards raw records to the broker
    Ingester,
}

impl RoleKind {
    /// Short role tag used in logs and context tagging
    pub fn as_str(self) -> &'static str {
        match self {
            RoleKind::Monolith => "monolith",
            RoleKind::Transformer => "transformer",
            RoleKind::Ingester => "ingester",
        }
    }

    /// Generated name of the role's workload objects.
    ///
    /// Also serves as the broker consumer-group identifier, so it must stay
    /// stable across reconciliation cycles and operator restarts.
    pub fn workload_name(self) -> &'static str {
        match self {
            RoleKind::Monolith => PIPELINE_NAME,
            RoleKind::Transformer => "flowgrid-pipeline-transformer",
            RoleKind::Ingester => "flowgrid-pipeline-ingester",
        }
    }
}

impl fmt::Display for RoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-cycle execution context, tagged with the active role
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    /// Role the context is tagged with; absent at the dispatcher level
    pub role: Option<RoleKind>,

    /// Cancellation signal for this cycle; a cancelled cycle is superseded
    /// by a newer one and must not be retried
    pub cancellation: CancellationToken,
}

impl ReconcileContext {
    /// Root context for one reconciliation cycle
    pub fn new(cancellation: CancellationToken) -> Self {
        Self {
            role: None,
            cancellation,
        }
    }

    /// Derive a context tagged with `role`
    pub fn for_role(&self, role: RoleKind) -> Self {
        Self {
            role: Some(role),
            cancellation: self.cancellation.clone(),
        }
    }

    /// Role tag for observability
    pub fn role_name(&self) -> &'static str {
        self.role.map(RoleKind::as_str).unwrap_or("dispatcher")
    }

    /// Fail with [`OperatorError::Cancelled`] once the cycle is superseded
    pub fn ensure_active(&self) -> Result<()> {
        if self.cancellation.is_cancelled() {
            Err(OperatorError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Everything the manifest-building collaborator needs to converge one
/// role's workload
#[derive(Debug, Clone)]
pub struct RoleArtifacts {
    /// Role the artifacts belong to
    pub role: RoleKind,

    /// Generated workload name
    pub name: String,

    /// Target namespace
    pub namespace: String,

    /// Container image for the pipeline workload
    pub image: String,

    /// Startup configuration of the workload
    pub graph: PipelineGraph,

    /// Digest annotations to merge into the pod-template metadata
    pub annotations: AnnotationSet,

    /// Fixed replica count; absent for daemon-style roles
    pub replicas: Option<i32>,

    /// Autoscaling policy, when the role supports it
    pub autoscaler: Option<AutoscalerSpec>,

    /// Cluster-scoped permissions the workload itself requires
    pub cluster_role: ClusterRole,

    /// Binding of those permissions to the workload's service account
    pub cluster_role_binding: ClusterRoleBinding,
}

/// Manifest-building collaborator provided by the host runtime
///
/// The dispatcher computes *what* each role's configuration and restart
/// triggers are; turning that into concrete deployment/service objects and
/// diffing them against the cluster is the applier's business.
#[async_trait]
pub trait WorkloadApplier: Send + Sync {
    /// Create or update the role's workload objects from the computed
    /// artifacts
    async fn apply(&self, ctx: &ReconcileContext, artifacts: RoleArtifacts) -> Result<()>;

    /// Delete everything previously applied for `role` in `namespace`; must
    /// no-op cleanly when nothing exists
    async fn cleanup(&self, ctx: &ReconcileContext, role: RoleKind, namespace: &str)
        -> Result<()>;
}

/// State shared by every role reconciler
pub struct Common {
    /// Manifest-building collaborator
    pub applier: Arc<dyn WorkloadApplier>,
    /// Credential store access for digest tracking
    pub reader: Arc<dyn SecretReader>,
    /// Container image for the pipeline workloads
    pub image: String,
}

impl Common {
    /// Derive the per-role slice of the shared state
    pub fn new_instance(&self, role: RoleKind) -> Instance {
        Instance {
            role,
            name: role.workload_name().to_string(),
            image: self.image.clone(),
            applier: Arc::clone(&self.applier),
            reader: Arc::clone(&self.reader),
        }
    }
}

/// Per-role slice of the shared reconciler state
pub struct Instance {
    /// Role this instance reconciles
    pub role: RoleKind,
    /// Generated workload name
    pub name: String,
    /// Container image for the pipeline workload
    pub image: String,
    /// Manifest-building collaborator
    pub applier: Arc<dyn WorkloadApplier>,
    /// Credential store access
    pub reader: Arc<dyn SecretReader>,
}

/// Single-role reconciler capability set
#[async_trait]
pub trait RoleReconciler: Send + Sync {
    /// Role identity, used to tag the execution context
    fn role(&self) -> RoleKind;

    /// Derive the role-tagged execution context for one invocation
    fn context(&self, ctx: &ReconcileContext) -> ReconcileContext {
        ctx.for_role(self.role())
    }

    /// Converge this role's workload toward the desired state
    async fn reconcile(&self, ctx: &ReconcileContext, desired: &FlowPipeline) -> Result<()>;

    /// Best-effort removal of everything this role owns in `namespace`;
    /// must no-op cleanly when it owns nothing
    async fn cleanup_namespace(&self, ctx: &ReconcileContext, namespace: &str);
}

/// Sequences the per-role reconcilers for one pipeline object
pub struct PipelineDispatcher {
    reconcilers: Vec<Box<dyn RoleReconciler>>,
}

impl PipelineDispatcher {
    /// Build the dispatcher with the standard roles.
    ///
    /// Order is fixed: monolith, then transformer, then ingester, in
    /// increasing architectural complexity, so simpler roles fail fast
    /// before the expensive ones run.
    pub fn new(common: &Common) -> Self {
        Self::with_reconcilers(vec![
            Box::new(crate::monolith::MonolithReconciler::new(
                common.new_instance(RoleKind::Monolith),
            )),
            Box::new(crate::transformer::TransformerReconciler::new(
                common.new_instance(RoleKind::Transformer),
            )),
            Box::new(crate::ingester::IngesterReconciler::new(
                common.new_instance(RoleKind::Ingester),
            )),
        ])
    }

    /// Build a dispatcher over an explicit reconciler collection
    pub fn with_reconcilers(reconcilers: Vec<Box<dyn RoleReconciler>>) -> Self {
        Self { reconcilers }
    }

    /// Run one reconciliation cycle.
    ///
    /// Validates global invariants, then invokes each reconciler in order.
    /// The first error is returned verbatim, without wrapping or
    /// continuation, so the caller's retry policy can discriminate error
    /// kinds.
    pub async fn reconcile(&self, ctx: &ReconcileContext, desired: &FlowPipeline) -> Result<()> {
        validate_desired(&desired.spec.processor)?;

        for reconciler in &self.reconcilers {
            let role_ctx = reconciler.context(ctx);
            reconciler.reconcile(&role_ctx, desired).await?;
        }
        Ok(())
    }

    /// Remove everything the roles own in `namespace`, best-effort.
    ///
    /// Invoked when a pipeline is decommissioned. Each reconciler no-ops
    /// cleanly if it owns nothing; failures are logged, never propagated.
    pub async fn cleanup_namespace(&self, ctx: &ReconcileContext, namespace: &str) {
        for reconciler in &self.reconcilers {
            let role_ctx = reconciler.context(ctx);
            reconciler.cleanup_namespace(&role_ctx, namespace).await;
        }
    }
}

/// Reject collector ports that collide with well-known tunnel traffic
fn validate_desired(processor: &ProcessorSpec) -> Result<()> {
    if RESERVED_PORTS.contains(&processor.port) {
        return Err(OperatorError::Validation(format!(
            "processor port {} is reserved for tunnel traffic and not authorized",
            processor.port
        )));
    }
    Ok(())
}
