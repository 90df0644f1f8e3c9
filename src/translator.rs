//! Translation of structured log records into Forward-protocol records.
//!
//! Translation is pure: it reads a [`LogRecord`] and the attributes of its
//! owning [`Resource`] and produces a [`Record`]. Missing attributes are
//! never an error; the corresponding field is simply left out.

use std::collections::BTreeMap;

use chrono::SecondsFormat;

use crate::logs::{AnyValue, LogRecord, Resource};
use crate::record::Record;

/// Label fed from the record's severity text.
pub const SEVERITY_LABEL: &str = "severity";

/// Label fed from the record's body.
pub const MESSAGE_LABEL: &str = "message";

/// Label fed from the record's timestamp.
pub const TIME_LABEL: &str = "time";

/// Default key the Kubernetes sub-record is nested under.
pub const DEFAULT_KUBERNETES_KEY: &str = "kubernetes";

const K8S_NAMESPACE_NAME: &str = "k8s.namespace.name";
const K8S_CONTAINER_NAME: &str = "k8s.container.name";
const K8S_POD_NAME: &str = "k8s.pod.name";
const K8S_NODE_NAME: &str = "k8s.node.name";
const K8S_POD_LABELS_PREFIX: &str = "k8s.pod.labels.";

/// Kubernetes metadata enrichment settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KubernetesMetadata {
    /// Key the metadata sub-record is nested under
    pub key: String,

    /// Whether to add a `labels` sub-record built from pod-label attributes
    pub include_pod_labels: bool,
}

impl Default for KubernetesMetadata {
    fn default() -> Self {
        Self {
            key: DEFAULT_KUBERNETES_KEY.to_string(),
            include_pod_labels: false,
        }
    }
}

/// Settings that drive [`translate`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslatorConfig {
    /// Labels to emit, keyed by label name
    pub default_labels_enabled: BTreeMap<String, bool>,

    /// Kubernetes enrichment, when configured
    pub kubernetes_metadata: Option<KubernetesMetadata>,
}

/// Translate one log record into a wire record.
///
/// Enabled labels are emitted in label-name order. `severity`, `message`
/// and `time` come from the record itself; every other label is looked up
/// on the record's own attributes.
pub fn translate(record: &LogRecord, resource: &Resource, config: &TranslatorConfig) -> Record {
    let mut out = Record::new();

    for label in config
        .default_labels_enabled
        .iter()
        .filter(|(_, enabled)| **enabled)
        .map(|(label, _)| label.as_str())
    {
        match label {
            SEVERITY_LABEL => out.insert(SEVERITY_LABEL, record.severity_text.as_str()),
            MESSAGE_LABEL => out.insert(
                MESSAGE_LABEL,
                record
                    .body
                    .as_ref()
                    .map(AnyValue::as_string)
                    .unwrap_or_default(),
            ),
            TIME_LABEL => {
                if let Some(ts) = record.timestamp.or(record.observed_timestamp) {
                    out.insert(TIME_LABEL, ts.to_rfc3339_opts(SecondsFormat::Nanos, true));
                }
            }
            key => {
                if let Some(value) = record.attributes.get(key) {
                    out.insert(key, value.as_string());
                }
            }
        }
    }

    if let Some(k8s) = &config.kubernetes_metadata {
        out.insert(k8s.key.as_str(), kubernetes_record(resource, k8s.include_pod_labels));
    }

    out
}

/// Build the Kubernetes sub-record in a single pass over the resource attributes.
fn kubernetes_record(resource: &Resource, include_pod_labels: bool) -> Record {
    let mut namespace_name = String::new();
    let mut container_name = String::new();
    let mut pod_name = String::new();
    let mut host = String::new();
    let mut labels = Record::new();

    for (key, value) in resource.attributes.iter() {
        match key {
            K8S_NAMESPACE_NAME => namespace_name = value.as_string(),
            K8S_CONTAINER_NAME => container_name = value.as_string(),
            K8S_POD_NAME => pod_name = value.as_string(),
            K8S_NODE_NAME => host = value.as_string(),
            _ if include_pod_labels => {
                if let Some(label) = key.strip_prefix(K8S_POD_LABELS_PREFIX) {
                    labels.insert(label, value.as_string());
                }
            }
            _ => {}
        }
    }

    let mut k8s = Record::new();
    k8s.insert("namespace_name", namespace_name);
    k8s.insert("container_name", container_name);
    k8s.insert("pod_name", pod_name);
    k8s.insert("host", host);
    if include_pod_labels {
        k8s.insert("labels", labels);
    }
    k8s
}
