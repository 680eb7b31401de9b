//! Template catalog: scans a directory of compose-style deployment
//! definitions and normalizes them for deploys.
//!
//! Normalization extracts the `x-deckhand` wrapper-metadata block, injects
//! a provenance label into every declared service, and re-serializes the
//! definition to its canonical text form. Catalog keys are derived from
//! the file name with `.` replaced by `__` so they stay safe as map
//! accessors in every consuming layer.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::SnapshotError;
use crate::snapshot::{Snapshot, SnapshotCell};

/// Provenance label injected into every service:
/// `deckhand_template=<fileName>`.
pub const TEMPLATE_LABEL: &str = "deckhand_template";

/// Compose extension key holding the wrapper metadata; removed from the
/// body before deployment.
pub const METADATA_KEY: &str = "x-deckhand";

/// Derive the catalog key for a template file name.
pub fn template_key(file_name: &str) -> String {
    file_name.replace('.', "__")
}

/// Wrapper metadata declared by a template file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMetadata {
    /// Display name shown by the dashboard.
    #[serde(default)]
    pub name: Option<String>,
    /// Stack name the template deploys under.
    #[serde(default)]
    pub stack_name: Option<String>,
    /// Secrets-service environment slug to resolve secrets from.
    #[serde(default)]
    pub infisical_env: Option<String>,
    #[serde(default)]
    pub container_env_type: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// One normalized template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateRecord {
    pub file_name: String,
    pub template_name: Option<String>,
    pub metadata: TemplateMetadata,
    /// Canonical serialized definition with provenance labels injected and
    /// the metadata block removed.
    pub body: String,
}

/// Domain payload of the template-catalog snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplatesData {
    #[serde(default)]
    pub templates: BTreeMap<String, TemplateRecord>,
}

/// Parse and normalize one template file.
fn normalize_template(file_name: &str, content: &str) -> Result<TemplateRecord, String> {
    let mut doc: serde_yaml::Value =
        serde_yaml::from_str(content).map_err(|e| format!("yaml parse error: {}", e))?;
    let root = doc
        .as_mapping_mut()
        .ok_or_else(|| "template root is not a mapping".to_string())?;

    let metadata = match root.remove(METADATA_KEY) {
        Some(value) => serde_yaml::from_value(value).unwrap_or_else(|err| {
            tracing::warn!(file = file_name, error = %err, "unparsable wrapper metadata, using defaults");
            TemplateMetadata::default()
        }),
        None => TemplateMetadata::default(),
    };

    if let Some(services) = root
        .get_mut("services")
        .and_then(serde_yaml::Value::as_mapping_mut)
    {
        let label_line = format!("{}={}", TEMPLATE_LABEL, file_name);
        for (_, service) in services.iter_mut() {
            inject_label(service, &label_line, file_name);
        }
    }

    let body = serde_yaml::to_string(&doc).map_err(|e| format!("yaml serialize error: {}", e))?;

    Ok(TemplateRecord {
        file_name: file_name.to_string(),
        template_name: metadata.name.clone(),
        metadata,
        body,
    })
}

/// Add the provenance label to one service's label set.
///
/// Compose allows labels as a list (`- key=value`) or a map
/// (`key: value`); both get set semantics — no duplicate entries.
fn inject_label(service: &mut serde_yaml::Value, label_line: &str, file_name: &str) {
    let Some(service) = service.as_mapping_mut() else {
        return;
    };
    let labels_key = serde_yaml::Value::from("labels");

    match service.get_mut(&labels_key) {
        Some(serde_yaml::Value::Sequence(labels)) => {
            let exists = labels.iter().any(|l| l.as_str() == Some(label_line));
            if !exists {
                labels.push(serde_yaml::Value::from(label_line));
            }
            return;
        }
        Some(serde_yaml::Value::Mapping(labels)) => {
            labels.insert(
                serde_yaml::Value::from(TEMPLATE_LABEL),
                serde_yaml::Value::from(file_name),
            );
            return;
        }
        _ => {}
    }

    // Absent or scalar labels entry: replace with a fresh list.
    service.insert(
        labels_key,
        serde_yaml::Value::Sequence(vec![serde_yaml::Value::from(label_line)]),
    );
}

/// Rebuilds and owns the template-catalog snapshot.
pub struct TemplateCatalog {
    templates_dir: PathBuf,
    cell: SnapshotCell<TemplatesData>,
}

impl TemplateCatalog {
    pub fn new(templates_dir: PathBuf, cell: SnapshotCell<TemplatesData>) -> Self {
        Self {
            templates_dir,
            cell,
        }
    }

    pub async fn snapshot(&self) -> Snapshot<TemplatesData> {
        self.cell.read().await
    }

    #[cfg(test)]
    pub(crate) fn cell(&self) -> &SnapshotCell<TemplatesData> {
        &self.cell
    }

    pub async fn timestamp(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.cell.timestamp().await
    }

    pub async fn restore(&self) -> bool {
        self.cell.restore().await
    }

    pub async fn ensure(&self, force: bool) -> Result<Option<Value>, SnapshotError> {
        self.cell.ensure(force, || self.rebuild()).await
    }

    async fn rebuild(&self) -> Result<(TemplatesData, Value), SnapshotError> {
        let mut data = TemplatesData::default();
        let mut scanned = Vec::new();

        let mut entries = tokio::fs::read_dir(&self.templates_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_template = path
                .extension()
                .and_then(|ext| ext.to_str())
                .map(|ext| ext == "yaml" || ext == "yml")
                .unwrap_or(false);
            if !is_template {
                continue;
            }
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(String::from)
            else {
                continue;
            };

            let content = match tokio::fs::read_to_string(&path).await {
                Ok(content) => content,
                Err(err) => {
                    tracing::warn!(file = %file_name, error = %err, "unreadable template file, skipping");
                    continue;
                }
            };

            match normalize_template(&file_name, &content) {
                Ok(record) => {
                    scanned.push(file_name.clone());
                    data.templates.insert(template_key(&file_name), record);
                }
                Err(reason) => {
                    tracing::warn!(file = %file_name, reason = %reason, "invalid template file, skipping");
                }
            }
        }

        tracing::info!(templates = data.templates.len(), "template catalog rebuilt");
        Ok((data, json!({ "files": scanned })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "\
x-deckhand:
  name: Web service
  stackName: web-stack
  infisicalEnv: staging
  category: frontend
services:
  web:
    image: \"nginx:1.27\"
    labels:
      - app=web
  worker:
    image: \"busybox\"
";

    #[test]
    fn test_template_key_replaces_every_dot() {
        assert_eq!(template_key("svc.yaml"), "svc__yaml");
        assert_eq!(template_key("a.b.yml"), "a__b__yml");
        assert_eq!(template_key("plain"), "plain");
    }

    #[test]
    fn test_normalize_extracts_and_removes_metadata() {
        let record = normalize_template("svc.yaml", TEMPLATE).unwrap();
        assert_eq!(record.template_name.as_deref(), Some("Web service"));
        assert_eq!(record.metadata.stack_name.as_deref(), Some("web-stack"));
        assert_eq!(record.metadata.infisical_env.as_deref(), Some("staging"));
        assert!(!record.body.contains(METADATA_KEY));
    }

    #[test]
    fn test_normalize_injects_label_into_every_service() {
        let record = normalize_template("svc.yaml", TEMPLATE).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&record.body).unwrap();
        for service in ["web", "worker"] {
            let labels = &doc["services"][service]["labels"];
            let found = labels
                .as_sequence()
                .unwrap()
                .iter()
                .any(|l| l.as_str() == Some("deckhand_template=svc.yaml"));
            assert!(found, "missing provenance label on {}", service);
        }
        // Existing labels survive.
        let web_labels = doc["services"]["web"]["labels"].as_sequence().unwrap();
        assert!(web_labels.iter().any(|l| l.as_str() == Some("app=web")));
    }

    #[test]
    fn test_normalize_label_injection_is_idempotent() {
        let record = normalize_template("svc.yaml", TEMPLATE).unwrap();
        let record = normalize_template("svc.yaml", &record.body).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&record.body).unwrap();
        let labels = doc["services"]["web"]["labels"].as_sequence().unwrap();
        let count = labels
            .iter()
            .filter(|l| l.as_str() == Some("deckhand_template=svc.yaml"))
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_normalize_map_form_labels() {
        let content = "\
services:
  web:
    image: redis
    labels:
      app: web
";
        let record = normalize_template("cache.yml", content).unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&record.body).unwrap();
        assert_eq!(
            doc["services"]["web"]["labels"][TEMPLATE_LABEL].as_str(),
            Some("cache.yml")
        );
        assert_eq!(doc["services"]["web"]["labels"]["app"].as_str(), Some("web"));
    }

    #[test]
    fn test_normalize_rejects_non_mapping_root() {
        assert!(normalize_template("bad.yaml", "- just\n- a list\n").is_err());
    }

    #[tokio::test]
    async fn test_rebuild_scans_only_template_files() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("svc.yaml"), TEMPLATE).await.unwrap();
        tokio::fs::write(dir.path().join("notes.txt"), "ignore me").await.unwrap();
        tokio::fs::write(dir.path().join("broken.yml"), "{ unclosed").await.unwrap();

        let catalog = TemplateCatalog::new(
            dir.path().to_path_buf(),
            SnapshotCell::new(
                "template_catalog",
                std::time::Duration::from_secs(300),
                std::time::Duration::from_secs(5),
                dir.path(),
            ),
        );
        catalog.ensure(true).await.unwrap();

        let snapshot = catalog.snapshot().await;
        assert_eq!(snapshot.data.templates.len(), 1);
        assert!(snapshot.data.templates.contains_key("svc__yaml"));
        assert!(snapshot.timestamp.is_some());
    }
}
