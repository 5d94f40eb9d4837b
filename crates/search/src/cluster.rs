//! K-means clustering over session-level embeddings.
//!
//! k defaults to 10 and is clamped to the session count. Seeding is
//! deterministic (evenly spaced over id-sorted sessions) so repeated runs
//! on the same data agree. Labels come from the dominant tag, falling back
//! to the dominant project; quality is reported as a silhouette score.

use crate::duplicate::session_profiles;
use crate::error::Result;
use refork_registry::SessionRegistry;
use refork_vector_store::{cosine_similarity, VectorStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_K: usize = 10;
const MAX_ITERATIONS: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterAssignment {
    pub cluster_id: usize,
    pub label: String,
    pub session_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub clusters: Vec<ClusterAssignment>,
    pub silhouette: f32,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

pub struct ClusterService {
    store: Arc<VectorStore>,
    registry: Arc<SessionRegistry>,
    snapshot_path: PathBuf,
}

impl ClusterService {
    pub fn new(store: Arc<VectorStore>, registry: Arc<SessionRegistry>, storage_dir: &Path) -> Self {
        Self {
            store,
            registry,
            snapshot_path: storage_dir.join("clusters.json"),
        }
    }

    /// Run k-means, persist the snapshot, and return it.
    pub fn cluster_sessions(&self, k: Option<usize>) -> Result<ClusterSnapshot> {
        let mut profiles = session_profiles(&self.store, 1)?;
        profiles.sort_by(|a, b| a.0.cmp(&b.0));
        if profiles.is_empty() {
            return Err(crate::SearchError::InvalidArgument(
                "no indexed sessions to cluster".to_string(),
            ));
        }

        let k = k.unwrap_or(DEFAULT_K).clamp(1, profiles.len());
        let assignments = kmeans(&profiles, k);
        let silhouette = silhouette_score(&profiles, &assignments, k);

        let mut clusters = Vec::with_capacity(k);
        for cluster_id in 0..k {
            let session_ids: Vec<String> = profiles
                .iter()
                .zip(&assignments)
                .filter(|(_, &a)| a == cluster_id)
                .map(|((id, _), _)| id.clone())
                .collect();
            if session_ids.is_empty() {
                continue;
            }
            let label = self.label_for(&session_ids)?;
            clusters.push(ClusterAssignment {
                cluster_id,
                label,
                session_ids,
            });
        }

        let snapshot = ClusterSnapshot {
            clusters,
            silhouette,
            generated_at: chrono::Utc::now(),
        };
        self.save(&snapshot)?;
        Ok(snapshot)
    }

    /// Last persisted snapshot, if any.
    pub fn load_snapshot(&self) -> Result<Option<ClusterSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.snapshot_path)?;
        Ok(serde_json::from_str(&raw).ok())
    }

    fn save(&self, snapshot: &ClusterSnapshot) -> Result<()> {
        if let Some(parent) = self.snapshot_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(snapshot)?;
        let tmp = self.snapshot_path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        if let Err(err) = std::fs::rename(&tmp, &self.snapshot_path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    /// Dominant tag across the cluster's sessions, else dominant project,
    /// else a generic label.
    fn label_for(&self, session_ids: &[String]) -> Result<String> {
        let mut tag_counts: HashMap<String, usize> = HashMap::new();
        let mut project_counts: HashMap<String, usize> = HashMap::new();
        for id in session_ids {
            if let Some(metadata) = self.registry.get(id)? {
                for tag in &metadata.tags {
                    *tag_counts.entry(tag.clone()).or_insert(0) += 1;
                }
                if let Some(project) = metadata.project {
                    *project_counts.entry(project).or_insert(0) += 1;
                }
            }
        }
        let dominant = |counts: HashMap<String, usize>| {
            counts
                .into_iter()
                .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
                .map(|(name, _)| name)
        };
        Ok(dominant(tag_counts)
            .or_else(|| dominant(project_counts))
            .unwrap_or_else(|| "unlabelled".to_string()))
    }
}

fn kmeans(profiles: &[(String, Vec<f32>)], k: usize) -> Vec<usize> {
    let n = profiles.len();
    // Deterministic seeding: evenly spaced over the id-sorted profiles.
    let mut centroids: Vec<Vec<f32>> = (0..k)
        .map(|i| profiles[i * n / k].1.clone())
        .collect();
    let mut assignments = vec![0usize; n];

    for _ in 0..MAX_ITERATIONS {
        let mut changed = false;
        for (idx, (_, vector)) in profiles.iter().enumerate() {
            let nearest = centroids
                .iter()
                .enumerate()
                .map(|(c, centroid)| (c, cosine_similarity(vector, centroid)))
                .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(c, _)| c)
                .unwrap_or(0);
            if assignments[idx] != nearest {
                assignments[idx] = nearest;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        for (c, centroid) in centroids.iter_mut().enumerate() {
            let members: Vec<&[f32]> = profiles
                .iter()
                .zip(&assignments)
                .filter(|(_, &a)| a == c)
                .map(|((_, v), _)| v.as_slice())
                .collect();
            if let Some(mean) = crate::duplicate::mean_vector(members) {
                *centroid = mean;
            }
        }
    }
    assignments
}

/// Mean silhouette over all points, using cosine distance (1 − similarity).
fn silhouette_score(profiles: &[(String, Vec<f32>)], assignments: &[usize], k: usize) -> f32 {
    let n = profiles.len();
    if n < 2 || k < 2 {
        return 0.0;
    }
    let distance =
        |a: &[f32], b: &[f32]| 1.0 - cosine_similarity(a, b);

    let mut total = 0.0f32;
    let mut counted = 0usize;
    for i in 0..n {
        let own = assignments[i];
        let mut intra = Vec::new();
        let mut inter: HashMap<usize, Vec<f32>> = HashMap::new();
        for j in 0..n {
            if i == j {
                continue;
            }
            let d = distance(&profiles[i].1, &profiles[j].1);
            if assignments[j] == own {
                intra.push(d);
            } else {
                inter.entry(assignments[j]).or_default().push(d);
            }
        }
        if intra.is_empty() || inter.is_empty() {
            continue;
        }
        let a = intra.iter().sum::<f32>() / intra.len() as f32;
        let b = inter
            .values()
            .map(|ds| ds.iter().sum::<f32>() / ds.len() as f32)
            .fold(f32::MAX, f32::min);
        total += (b - a) / a.max(b).max(f32::EPSILON);
        counted += 1;
    }
    if counted == 0 {
        0.0
    } else {
        total / counted as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refork_registry::SessionMetadata;
    use refork_vector_store::ChunkRecord;
    use tempfile::TempDir;

    fn seed(store: &VectorStore, registry: &SessionRegistry, session: &str, base: [f32; 4], tag: &str) {
        let chunks = (0..2)
            .map(|i| {
                (
                    ChunkRecord {
                        session_id: session.to_string(),
                        chunk_index: i,
                        text: format!("{session} {i}"),
                        token_count: 2,
                        project: "demo".to_string(),
                        timestamp: None,
                        first_message: i,
                        last_message: i,
                        memory_types: Vec::new(),
                        tags: vec![tag.to_string()],
                        archived: false,
                    },
                    base.to_vec(),
                )
            })
            .collect();
        store.upsert_chunks(chunks).unwrap();
        let mut meta = SessionMetadata::new(session);
        meta.project = Some("demo".to_string());
        meta.tags = vec![tag.to_string()];
        registry.add(meta).unwrap();
    }

    #[test]
    fn separates_two_obvious_groups() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(VectorStore::open(tmp.path(), 4).unwrap());
        let registry = Arc::new(
            SessionRegistry::open(&tmp.path().join("session-registry.json")).unwrap(),
        );
        for i in 0..3 {
            seed(&store, &registry, &format!("auth-{i}"), [1.0, 0.1 * i as f32, 0.0, 0.0], "auth");
        }
        for i in 0..3 {
            seed(&store, &registry, &format!("ui-{i}"), [0.0, 0.0, 1.0, 0.1 * i as f32], "ui");
        }

        let service = ClusterService::new(store, registry, tmp.path());
        let snapshot = service.cluster_sessions(Some(2)).unwrap();
        assert_eq!(snapshot.clusters.len(), 2);
        assert!(snapshot.silhouette > 0.3);

        let labels: Vec<&str> = snapshot.clusters.iter().map(|c| c.label.as_str()).collect();
        assert!(labels.contains(&"auth"));
        assert!(labels.contains(&"ui"));

        for cluster in &snapshot.clusters {
            let prefixes: std::collections::HashSet<&str> = cluster
                .session_ids
                .iter()
                .map(|id| id.split('-').next().unwrap())
                .collect();
            assert_eq!(prefixes.len(), 1, "mixed cluster: {:?}", cluster.session_ids);
        }
    }

    #[test]
    fn k_clamps_to_session_count() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(VectorStore::open(tmp.path(), 4).unwrap());
        let registry = Arc::new(
            SessionRegistry::open(&tmp.path().join("session-registry.json")).unwrap(),
        );
        seed(&store, &registry, "only", [1.0, 0.0, 0.0, 0.0], "solo");

        let service = ClusterService::new(store, registry, tmp.path());
        let snapshot = service.cluster_sessions(None).unwrap();
        assert_eq!(snapshot.clusters.len(), 1);
    }

    #[test]
    fn snapshot_round_trips_from_disk() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(VectorStore::open(tmp.path(), 4).unwrap());
        let registry = Arc::new(
            SessionRegistry::open(&tmp.path().join("session-registry.json")).unwrap(),
        );
        seed(&store, &registry, "s1", [1.0, 0.0, 0.0, 0.0], "tag");
        seed(&store, &registry, "s2", [0.0, 1.0, 0.0, 0.0], "tag");

        let service = ClusterService::new(store, registry, tmp.path());
        let generated = service.cluster_sessions(Some(2)).unwrap();
        let loaded = service.load_snapshot().unwrap().unwrap();
        assert_eq!(loaded.clusters.len(), generated.clusters.len());
    }

    #[test]
    fn empty_store_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(VectorStore::open(tmp.path(), 4).unwrap());
        let registry = Arc::new(
            SessionRegistry::open(&tmp.path().join("session-registry.json")).unwrap(),
        );
        let service = ClusterService::new(store, registry, tmp.path());
        assert!(service.cluster_sessions(None).is_err());
    }
}
