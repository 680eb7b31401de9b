//! Environments snapshot: data model and the discovery rebuild.
//!
//! A rebuild walks the orchestration platform in stages: trigger the
//! platform's own snapshot refresh, list the environments, then fan out
//! four per-environment query batches (runtime info, runtime version,
//! stacks, containers) followed by one global tag pass. Every
//! per-environment fetch tolerates failure — the affected environment
//! simply lacks that field and the rebuild as a whole still succeeds.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SnapshotError, UpstreamError};
use crate::snapshot::{Snapshot, SnapshotCell};
use crate::upstream::PortainerClient;

/// Containers carrying this label (with a non-empty value) are "managed";
/// the value is their display name.
pub const MANAGED_LABEL: &str = "deckhand_managed";

/// Tag names splitting into exactly two parts on this delimiter are
/// `key=value` metadata; everything else is a plain label.
pub const TAG_METADATA_DELIMITER: &str = "__";

/// Concurrent per-environment queries within one batch.
const FANOUT_CONCURRENCY: usize = 8;

/// One container as reported by the environment's runtime.
///
/// The aliases accept the platform's PascalCase payloads; the persisted
/// snapshot uses the snake_case names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerRecord {
    #[serde(alias = "Id")]
    pub id: String,
    #[serde(default, alias = "Names")]
    pub names: Vec<String>,
    #[serde(default, alias = "Image")]
    pub image: String,
    #[serde(default, alias = "State")]
    pub state: String,
    #[serde(default, alias = "Status")]
    pub status: String,
    #[serde(default, alias = "Labels")]
    pub labels: BTreeMap<String, String>,
}

/// A managed container: a running container annotated with the display
/// name taken from its management label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedContainer {
    pub name: String,
    #[serde(flatten)]
    pub container: ContainerRecord,
}

/// One stack as reported by the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackRecord {
    #[serde(alias = "Id")]
    pub id: i64,
    #[serde(alias = "Name")]
    pub name: String,
    #[serde(default, alias = "Status")]
    pub status: Option<i64>,
    #[serde(default, alias = "EndpointId")]
    pub endpoint_id: Option<i64>,
}

/// One platform tag with its environment associations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagRecord {
    #[serde(alias = "ID")]
    pub id: i64,
    #[serde(alias = "Name")]
    pub name: String,
    /// Environment id (stringified) → membership flag.
    #[serde(default, alias = "Endpoints")]
    pub endpoints: BTreeMap<String, bool>,
}

/// Everything known about one environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub id: i64,
    pub name: String,
    pub is_swarm: bool,
    pub is_standalone: bool,
    #[serde(default)]
    pub discover_info: Option<Value>,
    #[serde(default)]
    pub discover_version: Option<Value>,
    #[serde(default)]
    pub discover_stacks: BTreeMap<String, StackRecord>,
    #[serde(default)]
    pub discover_containers: BTreeMap<String, ContainerRecord>,
    #[serde(default)]
    pub managed_containers: BTreeMap<String, ManagedContainer>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub tag_metadata: BTreeMap<String, String>,
}

/// Domain payload of the environments snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentsData {
    #[serde(default)]
    pub envs: BTreeMap<String, EnvironmentRecord>,
    #[serde(default)]
    pub env_id_to_name: BTreeMap<i64, String>,
    #[serde(default)]
    pub tags_by_name: BTreeMap<String, TagRecord>,
}

#[derive(Deserialize)]
struct EndpointPayload {
    #[serde(alias = "Id")]
    id: i64,
    #[serde(alias = "Name")]
    name: String,
    #[serde(default, alias = "Snapshots")]
    snapshots: Vec<EndpointSnapshot>,
}

#[derive(Deserialize)]
struct EndpointSnapshot {
    #[serde(default, alias = "Swarm")]
    swarm: bool,
}

/// Derive the managed subset: running containers with a non-empty
/// management label value.
fn managed_subset(
    containers: &BTreeMap<String, ContainerRecord>,
) -> BTreeMap<String, ManagedContainer> {
    containers
        .iter()
        .filter(|(_, c)| c.state == "running")
        .filter_map(|(id, c)| {
            let name = c.labels.get(MANAGED_LABEL)?;
            if name.is_empty() {
                return None;
            }
            Some((
                id.clone(),
                ManagedContainer {
                    name: name.clone(),
                    container: c.clone(),
                },
            ))
        })
        .collect()
}

/// Propagate the tag table onto member environments.
///
/// Exactly-two-parts names are `key=value` metadata (last write wins);
/// anything else is a plain label. Endpoint ids without a known
/// environment are skipped.
fn apply_tags(data: &mut EnvironmentsData, tags: Vec<TagRecord>) {
    for tag in tags {
        let member_ids: Vec<i64> = tag
            .endpoints
            .iter()
            .filter(|(_, member)| **member)
            .filter_map(|(id, _)| id.parse().ok())
            .collect();

        let parts: Vec<&str> = tag.name.split(TAG_METADATA_DELIMITER).collect();

        for id in member_ids {
            let Some(name) = data.env_id_to_name.get(&id) else {
                continue;
            };
            let Some(env) = data.envs.get_mut(name) else {
                continue;
            };
            if parts.len() == 2 {
                env.tag_metadata
                    .insert(parts[0].to_string(), parts[1].to_string());
            } else {
                env.tags.push(tag.name.clone());
            }
        }

        data.tags_by_name.insert(tag.name.clone(), tag);
    }
}

fn shape_error(what: &str, err: serde_json::Error) -> SnapshotError {
    SnapshotError::Upstream(UpstreamError::Rejected {
        status: 200,
        body: format!("unexpected {} payload: {}", what, err),
    })
}

/// Rebuilds and owns the environments snapshot.
pub struct EnvironmentDiscoverer {
    portainer: Arc<PortainerClient>,
    cell: SnapshotCell<EnvironmentsData>,
}

impl EnvironmentDiscoverer {
    pub fn new(portainer: Arc<PortainerClient>, cell: SnapshotCell<EnvironmentsData>) -> Self {
        Self { portainer, cell }
    }

    /// Current snapshot, possibly stale or empty. Never fails.
    pub async fn snapshot(&self) -> Snapshot<EnvironmentsData> {
        self.cell.read().await
    }

    #[cfg(test)]
    pub(crate) fn cell(&self) -> &SnapshotCell<EnvironmentsData> {
        &self.cell
    }

    pub async fn timestamp(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.cell.timestamp().await
    }

    /// Adopt the persisted snapshot if still fresh.
    pub async fn restore(&self) -> bool {
        self.cell.restore().await
    }

    /// Refresh the snapshot unless it is within TTL (or always, when
    /// forced). Returns the raw environment list when a rebuild ran.
    pub async fn ensure(&self, force: bool) -> Result<Option<Value>, SnapshotError> {
        self.cell.ensure(force, || self.rebuild()).await
    }

    async fn rebuild(&self) -> Result<(EnvironmentsData, Value), SnapshotError> {
        // Correctness signal to the platform; the rebuild proceeds even if
        // it fails.
        if let Err(err) = self.portainer.trigger_snapshot().await {
            tracing::warn!(error = %err, "platform snapshot trigger failed");
        }

        let raw = self.portainer.list_endpoints().await?;
        let endpoints: Vec<EndpointPayload> =
            serde_json::from_value(raw.clone()).map_err(|e| shape_error("endpoint list", e))?;

        let mut data = EnvironmentsData::default();
        for endpoint in &endpoints {
            let is_swarm = endpoint.snapshots.first().map(|s| s.swarm).unwrap_or(false);
            data.env_id_to_name.insert(endpoint.id, endpoint.name.clone());
            data.envs.insert(
                endpoint.name.clone(),
                EnvironmentRecord {
                    id: endpoint.id,
                    name: endpoint.name.clone(),
                    is_swarm,
                    is_standalone: !is_swarm,
                    ..Default::default()
                },
            );
        }

        let targets: Vec<(i64, String)> = endpoints
            .iter()
            .map(|e| (e.id, e.name.clone()))
            .collect();

        for (name, info) in self
            .fan_out(&targets, "info", |id| self.portainer.docker_info(id))
            .await
        {
            if let Some(env) = data.envs.get_mut(&name) {
                env.discover_info = Some(info);
            }
        }

        for (name, version) in self
            .fan_out(&targets, "version", |id| self.portainer.docker_version(id))
            .await
        {
            if let Some(env) = data.envs.get_mut(&name) {
                env.discover_version = Some(version);
            }
        }

        for (name, stacks) in self
            .fan_out(&targets, "stacks", |id| self.portainer.list_stacks(id))
            .await
        {
            let stacks: Vec<StackRecord> = match serde_json::from_value(stacks) {
                Ok(stacks) => stacks,
                Err(err) => {
                    tracing::warn!(environment = %name, error = %err, "unparsable stack list, skipping");
                    continue;
                }
            };
            if let Some(env) = data.envs.get_mut(&name) {
                env.discover_stacks = stacks.into_iter().map(|s| (s.name.clone(), s)).collect();
            }
        }

        for (name, containers) in self
            .fan_out(&targets, "containers", |id| self.portainer.list_containers(id))
            .await
        {
            let containers: Vec<ContainerRecord> = match serde_json::from_value(containers) {
                Ok(containers) => containers,
                Err(err) => {
                    tracing::warn!(environment = %name, error = %err, "unparsable container list, skipping");
                    continue;
                }
            };
            if let Some(env) = data.envs.get_mut(&name) {
                env.discover_containers =
                    containers.into_iter().map(|c| (c.id.clone(), c)).collect();
                env.managed_containers = managed_subset(&env.discover_containers);
            }
        }

        match self.portainer.list_tags().await {
            Ok(raw_tags) => match serde_json::from_value::<Vec<TagRecord>>(raw_tags) {
                Ok(tags) => apply_tags(&mut data, tags),
                Err(err) => tracing::warn!(error = %err, "unparsable tag list, skipping tags"),
            },
            Err(err) => tracing::warn!(error = %err, "tag list fetch failed, skipping tags"),
        }

        tracing::info!(environments = data.envs.len(), "environments snapshot rebuilt");
        Ok((data, raw))
    }

    /// Run one query class against every environment concurrently, with
    /// full fan-in. A failed fetch logs and drops that one environment.
    async fn fan_out<F, Fut>(
        &self,
        targets: &[(i64, String)],
        query: &'static str,
        fetch: F,
    ) -> Vec<(String, Value)>
    where
        F: Fn(i64) -> Fut,
        Fut: Future<Output = Result<Value, UpstreamError>>,
    {
        futures::stream::iter(targets.to_vec().into_iter().map(|(id, name)| {
            let fut = fetch(id);
            async move {
                match fut.await {
                    Ok(value) => Some((name.clone(), value)),
                    Err(err) => {
                        tracing::warn!(environment = %name, query, error = %err, "per-environment query failed, skipping");
                        None
                    }
                }
            }
        }))
        .buffer_unordered(FANOUT_CONCURRENCY)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .flatten()
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn data_with_envs(envs: &[(i64, &str)]) -> EnvironmentsData {
        let mut data = EnvironmentsData::default();
        for (id, name) in envs {
            data.env_id_to_name.insert(*id, name.to_string());
            data.envs.insert(
                name.to_string(),
                EnvironmentRecord {
                    id: *id,
                    name: name.to_string(),
                    is_standalone: true,
                    ..Default::default()
                },
            );
        }
        data
    }

    fn tag(name: &str, member_ids: &[i64]) -> TagRecord {
        TagRecord {
            id: 1,
            name: name.to_string(),
            endpoints: member_ids
                .iter()
                .map(|id| (id.to_string(), true))
                .collect(),
        }
    }

    #[test]
    fn test_two_part_tag_becomes_metadata() {
        let mut data = data_with_envs(&[(1, "prod"), (2, "dev")]);
        apply_tags(&mut data, vec![tag("foo__bar", &[1])]);

        let prod = &data.envs["prod"];
        assert_eq!(prod.tag_metadata.get("foo"), Some(&"bar".to_string()));
        assert!(prod.tags.is_empty());
        // Non-members untouched.
        assert!(data.envs["dev"].tag_metadata.is_empty());
        assert!(data.tags_by_name.contains_key("foo__bar"));
    }

    #[test]
    fn test_plain_tag_is_appended_not_metadata() {
        let mut data = data_with_envs(&[(1, "prod")]);
        apply_tags(&mut data, vec![tag("plain", &[1])]);

        let prod = &data.envs["prod"];
        assert_eq!(prod.tags, vec!["plain".to_string()]);
        assert!(prod.tag_metadata.is_empty());
    }

    #[test]
    fn test_malformed_split_is_always_plain() {
        let mut data = data_with_envs(&[(1, "prod")]);
        apply_tags(&mut data, vec![tag("a__b__c", &[1])]);

        let prod = &data.envs["prod"];
        assert_eq!(prod.tags, vec!["a__b__c".to_string()]);
        assert!(prod.tag_metadata.is_empty());
    }

    #[test]
    fn test_metadata_last_write_wins() {
        let mut data = data_with_envs(&[(1, "prod")]);
        apply_tags(
            &mut data,
            vec![tag("tier__bronze", &[1]), tag("tier__gold", &[1])],
        );
        assert_eq!(
            data.envs["prod"].tag_metadata.get("tier"),
            Some(&"gold".to_string())
        );
    }

    #[test]
    fn test_unknown_member_id_is_skipped() {
        let mut data = data_with_envs(&[(1, "prod")]);
        apply_tags(&mut data, vec![tag("foo__bar", &[99])]);
        assert!(data.envs["prod"].tag_metadata.is_empty());
        // The tag table still records the tag itself.
        assert!(data.tags_by_name.contains_key("foo__bar"));
    }

    #[test]
    fn test_falsy_association_is_not_membership() {
        let mut data = data_with_envs(&[(1, "prod")]);
        let mut t = tag("plain", &[]);
        t.endpoints.insert("1".to_string(), false);
        apply_tags(&mut data, vec![t]);
        assert!(data.envs["prod"].tags.is_empty());
    }

    #[test]
    fn test_managed_subset_filters_state_and_label() {
        let mut containers = BTreeMap::new();
        containers.insert(
            "c1".to_string(),
            ContainerRecord {
                id: "c1".to_string(),
                state: "running".to_string(),
                labels: [(MANAGED_LABEL.to_string(), "web".to_string())].into(),
                ..Default::default()
            },
        );
        containers.insert(
            "c2".to_string(),
            ContainerRecord {
                id: "c2".to_string(),
                state: "exited".to_string(),
                labels: [(MANAGED_LABEL.to_string(), "db".to_string())].into(),
                ..Default::default()
            },
        );
        containers.insert(
            "c3".to_string(),
            ContainerRecord {
                id: "c3".to_string(),
                state: "running".to_string(),
                ..Default::default()
            },
        );
        containers.insert(
            "c4".to_string(),
            ContainerRecord {
                id: "c4".to_string(),
                state: "running".to_string(),
                labels: [(MANAGED_LABEL.to_string(), String::new())].into(),
                ..Default::default()
            },
        );

        let managed = managed_subset(&containers);
        assert_eq!(managed.len(), 1);
        assert_eq!(managed["c1"].name, "web");
        // Subset invariant: every managed id exists in the full list.
        assert!(managed.keys().all(|id| containers.contains_key(id)));
    }

    #[test]
    fn test_container_record_accepts_platform_payload() {
        let record: ContainerRecord = serde_json::from_value(json!({
            "Id": "abc123",
            "Names": ["/web"],
            "Image": "nginx:1.27",
            "State": "running",
            "Status": "Up 2 hours",
            "Labels": { "deckhand_managed": "web" },
        }))
        .unwrap();
        assert_eq!(record.id, "abc123");
        assert_eq!(record.state, "running");
        assert_eq!(record.labels[MANAGED_LABEL], "web");
    }

    #[test]
    fn test_endpoint_payload_swarm_flag() {
        let endpoints: Vec<EndpointPayload> = serde_json::from_value(json!([
            { "Id": 1, "Name": "prod", "Snapshots": [{ "Swarm": false }] },
            { "Id": 2, "Name": "cluster", "Snapshots": [{ "Swarm": true }] },
            { "Id": 3, "Name": "bare" },
        ]))
        .unwrap();
        let flags: Vec<bool> = endpoints
            .iter()
            .map(|e| e.snapshots.first().map(|s| s.swarm).unwrap_or(false))
            .collect();
        assert_eq!(flags, vec![false, true, false]);
    }
}
