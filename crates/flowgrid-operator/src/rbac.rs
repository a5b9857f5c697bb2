//! RBAC and namespace object builders
//!
//! The operator needs at least the permissions it grants, so the cluster
//! role mirrors exactly what the managed pipeline workload requires: read
//! access to the objects it watches for enrichment, plus write access to its
//! own autoscaler objects. Nothing more.

use crate::dispatcher::RoleKind;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;

/// Label marking objects as managed by this operator
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of the managed-by label
pub const OPERATOR_NAME: &str = "flowgrid-operator";

/// Build the namespace that hosts a pipeline's workloads
pub fn build_namespace(name: &str) -> Namespace {
    let mut labels = BTreeMap::new();
    labels.insert(MANAGED_BY_LABEL.to_string(), OPERATOR_NAME.to_string());
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Build the cluster role granting a pipeline workload its read permissions
/// and autoscaler write permissions
pub fn build_cluster_role(role: RoleKind) -> ClusterRole {
    ClusterRole {
        metadata: ObjectMeta {
            name: Some(role.workload_name().to_string()),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec!["".to_string()]),
                verbs: vec!["list".to_string(), "get".to_string(), "watch".to_string()],
                resources: Some(vec![
                    "pods".to_string(),
                    "services".to_string(),
                    "nodes".to_string(),
                ]),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["apps".to_string()]),
                verbs: vec!["list".to_string(), "get".to_string(), "watch".to_string()],
                resources: Some(vec!["replicasets".to_string()]),
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["autoscaling".to_string()]),
                verbs: vec![
                    "create".to_string(),
                    "delete".to_string(),
                    "patch".to_string(),
                    "update".to_string(),
                    "get".to_string(),
                    "watch".to_string(),
                    "list".to_string(),
                ],
                resources: Some(vec!["horizontalpodautoscalers".to_string()]),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

/// Bind a role's cluster permissions to its workload service account
pub fn build_cluster_role_binding(role: RoleKind, namespace: &str) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(role.workload_name().to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: role.workload_name().to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: role.workload_name().to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_carries_managed_by_label() {
        let ns = build_namespace("flowgrid");
        assert_eq!(ns.metadata.name.as_deref(), Some("flowgrid"));
        assert_eq!(
            ns.metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(MANAGED_BY_LABEL))
                .map(String::as_str),
            Some(OPERATOR_NAME)
        );
    }

    #[test]
    fn test_cluster_role_is_least_privilege() {
        let role = build_cluster_role(RoleKind::Transformer);
        let rules = role.rules.unwrap();
        assert_eq!(rules.len(), 3);

        // Core resources are read-only
        let core = &rules[0];
        assert_eq!(core.verbs, vec!["list", "get", "watch"]);
        assert!(core
            .resources
            .as_ref()
            .unwrap()
            .iter()
            .any(|r| r == "nodes"));

        // Autoscalers get full verbs; nothing else does
        let autoscaling = &rules[2];
        assert!(autoscaling.verbs.contains(&"create".to_string()));
        assert_eq!(
            autoscaling.resources.as_ref().unwrap(),
            &vec!["horizontalpodautoscalers".to_string()]
        );
    }

    #[test]
    fn test_binding_targets_workload_service_account() {
        let binding = build_cluster_role_binding(RoleKind::Ingester, "flowgrid");
        assert_eq!(
            binding.metadata.name.as_deref(),
            Some("flowgrid-pipeline-ingester")
        );
        let subject = &binding.subjects.unwrap()[0];
        assert_eq!(subject.kind, "ServiceAccount");
        assert_eq!(subject.name, "flowgrid-pipeline-ingester");
        assert_eq!(subject.namespace.as_deref(), Some("flowgrid"));
    }
}
