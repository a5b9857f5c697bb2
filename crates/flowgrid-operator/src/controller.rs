//! FlowPipeline controller harness
//!
//! Thin glue between the host watch machinery (`kube-runtime`) and the
//! reconciliation dispatcher. The harness owns nothing the dispatcher
//! computes: it watches FlowPipeline objects, hands each observed change to
//! the dispatcher, records metrics, updates the CRD status, and translates
//! the dispatcher's error kinds into requeue behavior.

use crate::crd::{FlowPipeline, FlowPipelineStatus, PipelineCondition, PipelinePhase};
use crate::digest::KubeSecretReader;
use crate::dispatcher::{
    Common, PipelineDispatcher, ReconcileContext, RoleArtifacts, RoleKind, WorkloadApplier,
};
use crate::error::{OperatorError, Result};
use crate::rbac::{self, MANAGED_BY_LABEL, OPERATOR_NAME};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Error as FinalizerError, Event as FinalizerEvent};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use validator::Validate;

/// Finalizer name for cleanup operations
pub const FINALIZER_NAME: &str = "flowgrid.io/pipeline-finalizer";

/// Default requeue interval for successful reconciliations
const DEFAULT_REQUEUE_SECONDS: u64 = 300; // 5 minutes

/// Requeue interval for error cases (base for exponential backoff)
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

/// Context passed to the controller
pub struct ControllerContext {
    /// Kubernetes client
    pub client: Client,
    /// Fixed-order role dispatcher, one per controller lifetime
    pub dispatcher: PipelineDispatcher,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-pipeline error retry counts for exponential backoff
    pub error_counts: dashmap::DashMap<String, u32>,
    /// Cancelled when the operator shuts down; supersedes in-flight cycles
    pub shutdown: CancellationToken,
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("flowgrid_operator_reconciliations_total"),
            errors: metrics::counter!("flowgrid_operator_reconciliation_errors_total"),
            duration: metrics::histogram!("flowgrid_operator_reconciliation_duration_seconds"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the FlowPipeline controller
pub async fn run_controller(
    client: Client,
    namespace: Option<String>,
    pipeline_image: String,
) -> Result<()> {
    let pipelines: Api<FlowPipeline> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let common = Common {
        applier: Arc::new(ConfigApplier::new(client.clone())),
        reader: Arc::new(KubeSecretReader::new(client.clone())),
        image: pipeline_image,
    };

    let ctx = Arc::new(ControllerContext {
        client: client.clone(),
        dispatcher: PipelineDispatcher::new(&common),
        metrics: Some(ControllerMetrics::new()),
        error_counts: dashmap::DashMap::new(),
        shutdown: CancellationToken::new(),
    });

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting FlowPipeline controller"
    );

    // Watch the config maps the applier materializes
    let configmaps = match &namespace {
        Some(ns) => Api::<ConfigMap>::namespaced(client.clone(), ns),
        None => Api::<ConfigMap>::all(client.clone()),
    };

    Controller::new(pipelines.clone(), Config::default())
        .owns(configmaps, Config::default())
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

/// Main reconciliation function
async fn reconcile(pipeline: Arc<FlowPipeline>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let namespace = pipeline
        .namespace()
        .unwrap_or_else(|| "default".to_string());
    let name = pipeline.name_any();
    let pipelines: Api<FlowPipeline> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&pipelines, FINALIZER_NAME, pipeline, |event| async {
        match event {
            FinalizerEvent::Apply(pipeline) => apply_pipeline(pipeline, ctx.clone()).await,
            FinalizerEvent::Cleanup(pipeline) => cleanup_pipeline(pipeline, ctx.clone()).await,
        }
    })
    .await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    // Reset error backoff counter on success
    if result.is_ok() {
        ctx.error_counts.remove(&name);
    }

    result.map_err(|e| {
        if let Some(ref metrics) = ctx.metrics {
            metrics.errors.increment(1);
        }
        // Surface the reconciler's own error so the error policy can still
        // discriminate kinds; only finalizer bookkeeping failures are wrapped
        match e {
            FinalizerError::ApplyFailed(err) | FinalizerError::CleanupFailed(err) => err,
            other => OperatorError::ReconcileFailed(other.to_string()),
        }
    })
}

/// Run one reconciliation cycle through the dispatcher
async fn apply_pipeline(
    pipeline: Arc<FlowPipeline>,
    ctx: Arc<ControllerContext>,
) -> Result<Action> {
    let name = pipeline.name_any();
    let namespace = pipeline
        .namespace()
        .unwrap_or_else(|| "default".to_string());

    info!(name = %name, namespace = %namespace, "Reconciling FlowPipeline");

    // Field-level validation before the dispatcher's invariant checks
    if let Err(errors) = pipeline.spec.validate() {
        let error_messages: Vec<String> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errs)| {
                errs.iter()
                    .map(move |e| format!("{}: {:?}", field, e.message))
            })
            .collect();
        let error_msg = error_messages.join("; ");
        warn!(name = %name, errors = %error_msg, "Pipeline spec validation failed");
        update_status(&ctx.client, &namespace, &name, failed_status(&pipeline, &error_msg)).await?;
        return Err(OperatorError::Validation(error_msg));
    }

    let cycle = ReconcileContext::new(ctx.shutdown.child_token());

    match ctx.dispatcher.reconcile(&cycle, &pipeline).await {
        Ok(()) => {
            update_status(&ctx.client, &namespace, &name, ready_status(&pipeline)).await?;
            info!(name = %name, "Reconciliation complete");
            Ok(Action::requeue(Duration::from_secs(
                DEFAULT_REQUEUE_SECONDS,
            )))
        }
        Err(OperatorError::Cancelled) => {
            // A newer cycle supersedes this one; leave the status alone
            debug!(name = %name, "Cycle cancelled");
            Err(OperatorError::Cancelled)
        }
        Err(e) => {
            if let Err(status_err) = update_status(
                &ctx.client,
                &namespace,
                &name,
                failed_status(&pipeline, &e.to_string()),
            )
            .await
            {
                warn!(name = %name, error = %status_err, "Failed to record failure status");
            }
            Err(e)
        }
    }
}

/// Cleanup owned objects when a pipeline is deleted
async fn cleanup_pipeline(
    pipeline: Arc<FlowPipeline>,
    ctx: Arc<ControllerContext>,
) -> Result<Action> {
    let name = pipeline.name_any();
    info!(name = %name, "Cleaning up FlowPipeline resources");

    let cycle = ReconcileContext::new(ctx.shutdown.child_token());
    ctx.dispatcher
        .cleanup_namespace(&cycle, &pipeline.spec.namespace)
        .await;

    info!(name = %name, "Cleanup complete");
    Ok(Action::await_change())
}

fn ready_status(pipeline: &FlowPipeline) -> FlowPipelineStatus {
    let now = Utc::now().to_rfc3339();
    FlowPipelineStatus {
        phase: PipelinePhase::Ready,
        conditions: vec![PipelineCondition {
            condition_type: "Ready".to_string(),
            status: "True".to_string(),
            reason: Some("ReconcileSucceeded".to_string()),
            message: None,
            last_transition_time: Some(now.clone()),
        }],
        observed_generation: pipeline.metadata.generation,
        last_updated: Some(now),
        message: None,
    }
}

fn failed_status(pipeline: &FlowPipeline, message: &str) -> FlowPipelineStatus {
    let now = Utc::now().to_rfc3339();
    FlowPipelineStatus {
        phase: PipelinePhase::Failed,
        conditions: vec![PipelineCondition {
            condition_type: "Ready".to_string(),
            status: "False".to_string(),
            reason: Some("ReconcileFailed".to_string()),
            message: Some(message.to_string()),
            last_transition_time: Some(now.clone()),
        }],
        observed_generation: pipeline.metadata.generation,
        last_updated: Some(now),
        message: Some(message.to_string()),
    }
}

/// Update the pipeline status subresource
async fn update_status(
    client: &Client,
    namespace: &str,
    name: &str,
    status: FlowPipelineStatus,
) -> Result<()> {
    let api: Api<FlowPipeline> = Api::namespaced(client.clone(), namespace);

    debug!(name = %name, phase = ?status.phase, "Updating pipeline status");

    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(OperatorError::from)?;

    Ok(())
}

/// Error policy for the controller.
///
/// Retryable errors back off exponentially (30s doubling, capped at 10
/// minutes); everything else parks until the spec changes, since retrying a
/// validation failure or a build defect cannot succeed.
fn error_policy(
    pipeline: Arc<FlowPipeline>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = pipeline.name_any();
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    match backoff_delay(error, retries) {
        Some(delay) => {
            warn!(
                error = %error,
                retry = retries,
                delay_secs = delay.as_secs(),
                "Reconciliation error for '{}', will retry",
                key
            );
            Action::requeue(delay)
        }
        None => {
            warn!(error = %error, "Reconciliation error for '{}', waiting for spec change", key);
            Action::await_change()
        }
    }
}

/// Requeue delay for the nth retry of an error, or `None` when retrying is
/// pointless
fn backoff_delay(error: &OperatorError, retries: u32) -> Option<Duration> {
    if !error.is_retryable() {
        return None;
    }
    let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
    let backoff = base * 2u32.saturating_pow(retries.saturating_sub(1).min(5));
    Some(backoff.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS)))
}

/// Default manifest collaborator: materializes each role's startup
/// configuration and RBAC objects in the cluster.
///
/// Deployment, service and service-account construction stays with the host
/// runtime; this applier only owns the objects the dispatcher computes
/// directly: the pipeline ConfigMap, the namespace, and the RBAC pair.
pub struct ConfigApplier {
    client: Client,
}

impl ConfigApplier {
    /// Create an applier backed by the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn apply_namespace(&self, namespace: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = rbac::build_namespace(namespace);
        api.patch(
            namespace,
            &PatchParams::apply(OPERATOR_NAME).force(),
            &Patch::Apply(&ns),
        )
        .await
        .map_err(OperatorError::from)?;
        Ok(())
    }

    async fn apply_rbac(
        &self,
        cluster_role: &ClusterRole,
        binding: &ClusterRoleBinding,
    ) -> Result<()> {
        let params = PatchParams::apply(OPERATOR_NAME).force();

        let roles: Api<ClusterRole> = Api::all(self.client.clone());
        let name = cluster_role
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| OperatorError::Build("ClusterRole missing metadata.name".into()))?;
        roles
            .patch(name, &params, &Patch::Apply(cluster_role))
            .await
            .map_err(OperatorError::from)?;

        let bindings: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let name = binding.metadata.name.as_deref().ok_or_else(|| {
            OperatorError::Build("ClusterRoleBinding missing metadata.name".into())
        })?;
        bindings
            .patch(name, &params, &Patch::Apply(binding))
            .await
            .map_err(OperatorError::from)?;

        Ok(())
    }

    async fn apply_configmap(&self, namespace: &str, cm: ConfigMap) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let name = cm
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| OperatorError::Build("ConfigMap missing metadata.name".into()))?;

        debug!(name = %name, "Applying ConfigMap");

        // Refuse to force-apply over an object another controller manages
        if let Ok(existing) = api.get(name).await {
            verify_ownership(name, existing.metadata.labels.as_ref())?;
        }

        api.patch(
            name,
            &PatchParams::apply(OPERATOR_NAME).force(),
            &Patch::Apply(&cm),
        )
        .await
        .map_err(OperatorError::from)?;
        Ok(())
    }

    async fn delete_configmap(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(OperatorError::Cleanup(e.to_string())),
        }
    }

    async fn delete_rbac(&self, name: &str) -> Result<()> {
        let bindings: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        match bindings.delete(name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(ae)) if ae.code == 404 => {}
            Err(e) => return Err(OperatorError::Cleanup(e.to_string())),
        }

        let roles: Api<ClusterRole> = Api::all(self.client.clone());
        match roles.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(OperatorError::Cleanup(e.to_string())),
        }
    }
}

#[async_trait]
impl WorkloadApplier for ConfigApplier {
    async fn apply(&self, ctx: &ReconcileContext, artifacts: RoleArtifacts) -> Result<()> {
        ctx.ensure_active()?;

        self.apply_namespace(&artifacts.namespace).await?;
        self.apply_rbac(&artifacts.cluster_role, &artifacts.cluster_role_binding)
            .await?;

        let cm = build_config_map(&artifacts)?;
        self.apply_configmap(&artifacts.namespace, cm).await?;

        debug!(
            role = %artifacts.role,
            annotations = artifacts.annotations.len(),
            replicas = ?artifacts.replicas,
            "Workload artifacts handed to manifest building"
        );
        Ok(())
    }

    async fn cleanup(
        &self,
        ctx: &ReconcileContext,
        role: RoleKind,
        namespace: &str,
    ) -> Result<()> {
        ctx.ensure_active()?;
        self.delete_configmap(namespace, &config_map_name(role.workload_name()))
            .await?;
        self.delete_rbac(role.workload_name()).await?;
        Ok(())
    }
}

/// Name of a role's pipeline configuration ConfigMap
fn config_map_name(workload: &str) -> String {
    format!("{}-config", workload)
}

/// Build the ConfigMap carrying a role's startup configuration
fn build_config_map(artifacts: &RoleArtifacts) -> Result<ConfigMap> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "app.kubernetes.io/name".to_string(),
        crate::dispatcher::PIPELINE_NAME.to_string(),
    );
    labels.insert(
        "app.kubernetes.io/component".to_string(),
        artifacts.role.as_str().to_string(),
    );
    labels.insert(MANAGED_BY_LABEL.to_string(), OPERATOR_NAME.to_string());

    let mut data = BTreeMap::new();
    data.insert("config.json".to_string(), artifacts.graph.to_json()?);

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(config_map_name(&artifacts.name)),
            namespace: Some(artifacts.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    })
}

/// Reject force-applies over objects another controller manages
fn verify_ownership(name: &str, labels: Option<&BTreeMap<String, String>>) -> Result<()> {
    match labels.and_then(|l| l.get(MANAGED_BY_LABEL)) {
        Some(manager) if manager != OPERATOR_NAME => Err(OperatorError::Validation(format!(
            "resource '{}' is managed by '{}', not {}; refusing to take ownership",
            name, manager, OPERATOR_NAME
        ))),
        _ => Ok(()),
    }
}
