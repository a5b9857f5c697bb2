//! Credential digest tracking
//!
//! Resolves referenced secrets and certificates to stable content digests.
//! The digests are written into the pod-template annotations of dependent
//! workloads, so a credential rotation changes the pod template and forces a
//! rolling restart, while unchanged content leaves the template untouched.

use crate::crd::{BrokerSpec, CredentialKind, CredentialRef};
use crate::dispatcher::ReconcileContext;
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use kube::Client;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tracing::debug;

/// Domain prefix for digest annotations on managed pod templates
pub const ANNOTATION_DOMAIN: &str = "digest.flowgrid.io";

/// Build the pod-template annotation key for a tracked credential
pub fn annotation_key(name: &str) -> String {
    format!("{}/{}", ANNOTATION_DOMAIN, name)
}

/// Digest values keyed by pod-template annotation key
pub type AnnotationSet = BTreeMap<String, String>;

/// Read access to the raw content of referenced credentials
#[async_trait]
pub trait SecretReader: Send + Sync {
    /// Fetch the data entries of the referenced object.
    ///
    /// `default_namespace` applies when the reference carries no namespace
    /// of its own.
    async fn read(
        &self,
        reference: &CredentialRef,
        default_namespace: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>>;
}

/// Reads credentials from the cluster
pub struct KubeSecretReader {
    client: Client,
}

impl KubeSecretReader {
    /// Create a reader backed by the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretReader for KubeSecretReader {
    async fn read(
        &self,
        reference: &CredentialRef,
        default_namespace: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let namespace = reference.namespace.as_deref().unwrap_or(default_namespace);

        match reference.kind {
            CredentialKind::Secret => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
                let secret = api.get(&reference.name).await.map_err(|e| {
                    OperatorError::Resolution(format!(
                        "reading secret {}/{}: {}",
                        namespace, reference.name, e
                    ))
                })?;
                Ok(secret
                    .data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| (k, v.0))
                    .collect())
            }
            CredentialKind::ConfigMap => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                let cm = api.get(&reference.name).await.map_err(|e| {
                    OperatorError::Resolution(format!(
                        "reading config map {}/{}: {}",
                        namespace, reference.name, e
                    ))
                })?;
                let mut data: BTreeMap<String, Vec<u8>> = cm
                    .data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| (k, v.into_bytes()))
                    .collect();
                data.extend(
                    cm.binary_data
                        .unwrap_or_default()
                        .into_iter()
                        .map(|(k, v)| (k, v.0)),
                );
                Ok(data)
            }
        }
    }
}

/// In-memory credential store, used by tests and offline tooling
#[derive(Default)]
pub struct MemorySecretReader {
    objects: Mutex<HashMap<(CredentialKind, String, String), BTreeMap<String, Vec<u8>>>>,
}

impl MemorySecretReader {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace one data entry of an object
    pub fn put(
        &self,
        kind: CredentialKind,
        namespace: &str,
        name: &str,
        key: &str,
        value: &[u8],
    ) {
        self.objects
            .lock()
            .expect("memory store lock poisoned")
            .entry((kind, namespace.to_string(), name.to_string()))
            .or_default()
            .insert(key.to_string(), value.to_vec());
    }
}

#[async_trait]
impl SecretReader for MemorySecretReader {
    async fn read(
        &self,
        reference: &CredentialRef,
        default_namespace: &str,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let namespace = reference.namespace.as_deref().unwrap_or(default_namespace);
        self.objects
            .lock()
            .expect("memory store lock poisoned")
            .get(&(
                reference.kind,
                namespace.to_string(),
                reference.name.to_string(),
            ))
            .cloned()
            .ok_or_else(|| {
                OperatorError::Resolution(format!(
                    "object {}/{} not found",
                    namespace, reference.name
                ))
            })
    }
}

/// Resolves credential references to content digests for one cycle
pub struct DigestTracker<'a> {
    reader: &'a dyn SecretReader,
    namespace: &'a str,
}

impl<'a> DigestTracker<'a> {
    /// Create a tracker resolving references against `namespace` by default
    pub fn new(reader: &'a dyn SecretReader, namespace: &'a str) -> Self {
        Self { reader, namespace }
    }

    /// Resolve a credential reference to its content digest.
    ///
    /// The digest is a hex-encoded SHA-256 over the referenced bytes; the
    /// same content always yields the same digest. An object with no data
    /// yields an empty digest, which callers treat as "not in use".
    ///
    /// A cancelled context aborts the read promptly and surfaces
    /// [`OperatorError::Cancelled`] instead of a retryable error.
    pub async fn resolve(
        &self,
        ctx: &ReconcileContext,
        reference: &CredentialRef,
    ) -> Result<String> {
        ctx.ensure_active()?;

        let data = tokio::select! {
            _ = ctx.cancellation.cancelled() => return Err(OperatorError::Cancelled),
            data = self.reader.read(reference, self.namespace) => data?,
        };

        if let Some(key) = &reference.key {
            let value = data.get(key).ok_or_else(|| {
                OperatorError::Resolution(format!(
                    "object {} has no data key '{}'",
                    reference.name, key
                ))
            })?;
            return Ok(hex::encode(Sha256::digest(value)));
        }

        if data.is_empty() {
            return Ok(String::new());
        }

        // BTreeMap iteration order keeps the digest stable across cycles
        let mut hasher = Sha256::new();
        for (key, value) in &data {
            hasher.update(key.as_bytes());
            hasher.update([0u8]);
            hasher.update(value);
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Record digests for a broker connection's TLS and SASL credentials.
    ///
    /// Writes `<prefix>-ca`, `<prefix>-user` and `<prefix>-sasl` annotation
    /// keys for the credentials that are configured; credentials that are
    /// absent leave no annotation, which downstream manifest building relies
    /// on to decide whether a secret volume is mounted at all.
    pub async fn annotate_broker_certs(
        &self,
        ctx: &ReconcileContext,
        prefix: &str,
        broker: &BrokerSpec,
        annotations: &mut AnnotationSet,
    ) -> Result<()> {
        if broker.tls.enabled {
            if let Some(ca) = &broker.tls.ca_cert {
                self.annotate(ctx, &format!("{}-ca", prefix), ca, annotations)
                    .await?;
            }
            if let Some(user) = &broker.tls.user_cert {
                self.annotate(ctx, &format!("{}-user", prefix), user, annotations)
                    .await?;
            }
        }

        if broker.sasl.enabled() {
            let secret = broker.sasl.secret.as_ref().ok_or_else(|| {
                OperatorError::Resolution(format!(
                    "SASL requested for '{}' but no secret is referenced",
                    prefix
                ))
            })?;
            self.annotate(ctx, &format!("{}-sasl", prefix), secret, annotations)
                .await?;
        }

        Ok(())
    }

    async fn annotate(
        &self,
        ctx: &ReconcileContext,
        name: &str,
        reference: &CredentialRef,
        annotations: &mut AnnotationSet,
    ) -> Result<()> {
        let digest = self.resolve(ctx, reference).await?;
        if digest.is_empty() {
            debug!(credential = %name, "Referenced object holds no data, skipping annotation");
            return Ok(());
        }
        annotations.insert(annotation_key(name), digest);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ClientTls, SaslMechanism, SaslSpec};
    use tokio_util::sync::CancellationToken;

    fn create_test_context() -> ReconcileContext {
        ReconcileContext::new(CancellationToken::new())
    }

    fn secret_ref(name: &str) -> CredentialRef {
        CredentialRef {
            kind: CredentialKind::Secret,
            name: name.to_string(),
            namespace: None,
            key: None,
        }
    }

    #[tokio::test]
    async fn test_digest_determinism() {
        let reader = MemorySecretReader::new();
        reader.put(CredentialKind::Secret, "flowgrid", "ca", "ca.crt", b"cert-bytes");

        let tracker = DigestTracker::new(&reader, "flowgrid");
        let ctx = create_test_context();

        let first = tracker.resolve(&ctx, &secret_ref("ca")).await.unwrap();
        let second = tracker.resolve(&ctx, &secret_ref("ca")).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }

    #[tokio::test]
    async fn test_digest_changes_with_content() {
        let reader = MemorySecretReader::new();
        reader.put(CredentialKind::Secret, "flowgrid", "ca", "ca.crt", b"cert-bytes");

        let tracker = DigestTracker::new(&reader, "flowgrid");
        let ctx = create_test_context();
        let before = tracker.resolve(&ctx, &secret_ref("ca")).await.unwrap();

        reader.put(CredentialKind::Secret, "flowgrid", "ca", "ca.crt", b"cert-byteX");
        let after = tracker.resolve(&ctx, &secret_ref("ca")).await.unwrap();
        assert_ne!(before, after);
    }

    #[tokio::test]
    async fn test_missing_credential_is_resolution_error() {
        let reader = MemorySecretReader::new();
        let tracker = DigestTracker::new(&reader, "flowgrid");
        let ctx = create_test_context();

        let err = tracker
            .resolve(&ctx, &secret_ref("absent"))
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::Resolution(_)));
    }

    #[tokio::test]
    async fn test_no_sasl_means_no_sasl_annotation() {
        let reader = MemorySecretReader::new();
        reader.put(CredentialKind::Secret, "flowgrid", "ca", "ca.crt", b"cert-bytes");

        let tracker = DigestTracker::new(&reader, "flowgrid");
        let ctx = create_test_context();
        let broker = BrokerSpec {
            address: "broker:9092".to_string(),
            topic: "flows".to_string(),
            tls: ClientTls {
                enabled: true,
                ca_cert: Some(secret_ref("ca")),
                ..Default::default()
            },
            sasl: SaslSpec::default(),
        };

        let mut annotations = AnnotationSet::new();
        tracker
            .annotate_broker_certs(&ctx, "broker", &broker, &mut annotations)
            .await
            .unwrap();

        assert_eq!(annotations.len(), 1);
        assert!(annotations.contains_key(&annotation_key("broker-ca")));
        assert!(!annotations.keys().any(|k| k.contains("sasl")));
    }

    #[tokio::test]
    async fn test_sasl_without_secret_is_resolution_error() {
        let reader = MemorySecretReader::new();
        let tracker = DigestTracker::new(&reader, "flowgrid");
        let ctx = create_test_context();
        let broker = BrokerSpec {
            sasl: SaslSpec {
                mechanism: Some(SaslMechanism::Plain),
                secret: None,
            },
            ..Default::default()
        };

        let mut annotations = AnnotationSet::new();
        let err = tracker
            .annotate_broker_certs(&ctx, "broker", &broker, &mut annotations)
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::Resolution(_)));
    }

    #[tokio::test]
    async fn test_cancelled_context_aborts_resolution() {
        let reader = MemorySecretReader::new();
        reader.put(CredentialKind::Secret, "flowgrid", "ca", "ca.crt", b"cert-bytes");

        let tracker = DigestTracker::new(&reader, "flowgrid");
        let token = CancellationToken::new();
        token.cancel();
        let ctx = ReconcileContext::new(token);

        let err = tracker
            .resolve(&ctx, &secret_ref("ca"))
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::Cancelled));
    }

    #[test]
    fn test_annotation_key() {
        assert_eq!(
            annotation_key("broker-ca"),
            "digest.flowgrid.io/broker-ca"
        );
    }
}
