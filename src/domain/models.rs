use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// Stable identity for a photo shared by both stores.
///
/// Built from the lower-cased file basename plus the byte size when both
/// sides expose one. When either side lacks a size the key degrades to the
/// basename alone; readers flag that so the join can be diagnosed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhotoKey(pub String);

impl PhotoKey {
    pub fn from_parts(file_name: &str, size_bytes: Option<i64>) -> Self {
        // Legacy paths are Windows-style, Immich paths are POSIX.
        let base = file_name
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(file_name)
            .trim()
            .to_lowercase();
        match size_bytes {
            Some(size) if size > 0 => PhotoKey(format!("{}|{}", base, size)),
            _ => PhotoKey(base),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PhotoKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Axis-aligned face rectangle in normalized image coordinates,
/// origin top-left, 0 <= x1 < x2 <= 1 and 0 <= y1 < y2 <= 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FaceRect {
    pub x1: f64,
    pub y1: f64,
    pub x2: f64,
    pub y2: f64,
}

impl FaceRect {
    /// Returns None for rectangles outside [0,1] or with a degenerate side.
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Option<Self> {
        let in_unit = |v: f64| v.is_finite() && (0.0..=1.0).contains(&v);
        if in_unit(x1) && in_unit(y1) && in_unit(x2) && in_unit(y2) && x1 < x2 && y1 < y2 {
            Some(Self { x1, y1, x2, y2 })
        } else {
            None
        }
    }

    /// Normalizes a pixel rectangle using the image's own dimensions.
    pub fn from_pixels(x: f64, y: f64, w: f64, h: f64, img_w: f64, img_h: f64) -> Option<Self> {
        if img_w <= 0.0 || img_h <= 0.0 {
            return None;
        }
        Self::new(x / img_w, y / img_h, (x + w) / img_w, (y + h) / img_h)
    }

    pub fn area(&self) -> f64 {
        (self.x2 - self.x1) * (self.y2 - self.y1)
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

/// A face rectangle from the legacy store, already resolved to a person.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFace {
    pub id: i64,
    pub person_id: i64,
    pub photo: PhotoKey,
    pub rect: FaceRect,
}

/// A named person from the legacy store. Zero faces makes it an orphan:
/// kept for diagnostics, excluded from matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcePerson {
    pub id: i64,
    pub name: String,
    pub face_count: usize,
}

/// A face detection on the Immich side. `cluster_id = None` means the face
/// is unclustered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetFace {
    pub id: String,
    pub asset_id: String,
    pub photo: PhotoKey,
    pub rect: FaceRect,
    pub cluster_id: Option<String>,
}

/// An Immich person, i.e. a cluster of target faces. `name = None` means
/// the cluster is unnamed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: String,
    pub name: Option<String>,
    pub face_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetAsset {
    pub id: String,
    pub width: Option<i32>,
    pub height: Option<i32>,
}

/// Everything the source reader produces in one load.
#[derive(Debug, Clone, Default)]
pub struct SourceInventory {
    /// Named persons with at least one valid face, keyed by canonical id.
    pub persons: HashMap<i64, SourcePerson>,
    pub faces: Vec<SourceFace>,
    pub orphans: Vec<SourcePerson>,
    pub malformed_faces: u64,
    /// True when photo keys had to fall back to basename-only identity.
    pub key_degraded: bool,
}

impl SourceInventory {
    pub fn person_name(&self, id: i64) -> &str {
        self.persons.get(&id).map(|p| p.name.as_str()).unwrap_or("")
    }

    pub fn photo_keys(&self) -> HashSet<PhotoKey> {
        self.faces.iter().map(|f| f.photo.clone()).collect()
    }
}

/// Everything the target reader produces in one load.
#[derive(Debug, Clone, Default)]
pub struct TargetInventory {
    pub faces: Vec<TargetFace>,
    pub clusters: HashMap<String, Cluster>,
    /// All assets, with or without faces; the join runs over these.
    pub assets: HashMap<PhotoKey, TargetAsset>,
    /// Trimmed display names of named Immich persons.
    pub person_names: HashSet<String>,
    pub malformed_faces: u64,
    pub key_degraded: bool,
}

impl TargetInventory {
    pub fn photo_keys(&self) -> HashSet<PhotoKey> {
        self.assets.keys().cloned().collect()
    }
}

/// One source-face / target-face correspondence on a shared photo.
/// Threshold-free: the matcher emits every pair with IoU > 0 and the
/// downstream stages filter by (I, C).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFaceMatch {
    pub src_person_id: i64,
    pub src_person_name: String,
    pub src_face_id: i64,
    pub cluster_id: Option<String>,
    pub cluster_name: Option<String>,
    pub tgt_face_id: String,
    pub photo: PhotoKey,
    pub iou: f64,
    pub center_dist: f64,
}

/// The (I, C) pair every downstream stage filters by.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchThresholds {
    pub min_iou: f64,
    pub max_center_dist: f64,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            min_iou: 0.30,
            max_center_dist: 0.40,
        }
    }
}

impl MatchThresholds {
    pub fn passes(&self, m: &RawFaceMatch) -> bool {
        m.iou >= self.min_iou && m.center_dist <= self.max_center_dist
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Confidence {
    /// High iff count >= 5 and mean IoU >= 0.40; else Medium iff count >= 2
    /// and mean IoU >= 0.35; else Low.
    pub fn grade(count: usize, mean_iou: f64) -> Self {
        if count >= 5 && mean_iou >= 0.40 {
            Confidence::High
        } else if count >= 2 && mean_iou >= 0.35 {
            Confidence::Medium
        } else {
            Confidence::Low
        }
    }
}

/// Aggregate of all passing matches between one source person and one
/// target cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairAggregate {
    pub src_person_id: i64,
    pub src_person_name: String,
    pub cluster_id: String,
    pub cluster_name: Option<String>,
    pub match_count: usize,
    pub mean_iou: f64,
    pub mean_center_dist: f64,
    pub confidence: Confidence,
    /// Up to five photo keys, most-overlapping first.
    pub sample_photos: Vec<PhotoKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonMatchTotal {
    pub src_person_id: i64,
    pub src_person_name: String,
    pub matched_faces: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignPreview {
    pub tgt_face_id: String,
    pub asset_id: String,
    pub photo: PhotoKey,
    pub iou: f64,
}

/// All unclustered target faces that matched one source person.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignUnclusteredGroup {
    pub src_person_id: i64,
    pub src_person_name: String,
    /// Unique target face ids, never multiplicity across matches.
    pub face_ids: Vec<String>,
    pub face_count: usize,
    pub mean_iou: f64,
    pub needs_person_creation: bool,
    pub preview: Vec<AssignPreview>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeClusterRef {
    pub cluster_id: String,
    pub cluster_name: Option<String>,
    pub match_count: usize,
    pub mean_iou: f64,
}

/// One source person mapped onto two or more distinct clusters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeCandidate {
    pub src_person_id: i64,
    pub src_person_name: String,
    /// Sorted by matched count descending.
    pub clusters: Vec<MergeClusterRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuePerson {
    pub src_person_id: i64,
    pub src_person_name: String,
    pub face_count: usize,
}

/// A cluster that two or more source persons project onto.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub cluster_id: String,
    pub cluster_name: Option<String>,
    pub severity: Severity,
    pub matched_faces: usize,
    pub total_faces_in_cluster: i64,
    /// Per-person matched counts, largest first.
    pub persons: Vec<IssuePerson>,
}

/// A source face on a common photo with no target face at IoU >= I.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFaceCandidate {
    pub src_face_id: i64,
    pub photo: PhotoKey,
    pub rect: FaceRect,
    pub asset_id: Option<String>,
    pub image_width: Option<i32>,
    pub image_height: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFaceGroup {
    pub src_person_id: i64,
    pub src_person_name: String,
    pub faces: Vec<CreateFaceCandidate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Percentiles {
    pub min: f64,
    pub p5: f64,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    pub p95: f64,
    pub max: f64,
    pub mean: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionPoint {
    pub threshold: f64,
    pub pass_pct: f64,
}

/// Descriptive statistics for one metric over the raw match list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricStats {
    /// 20 bins over [0,1]; the last bin is inclusive on both sides.
    pub histogram: Vec<u64>,
    pub percentiles: Percentiles,
    pub retention: Vec<RetentionPoint>,
    pub suggested_threshold: f64,
    /// True when the distribution was too degenerate for Otsu and the
    /// documented fallback was returned instead.
    pub fallback_used: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatisticsBundle {
    pub sample_count: usize,
    pub iou: MetricStats,
    pub center_dist: MetricStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisTotals {
    pub source_persons: usize,
    pub source_orphans: usize,
    pub source_faces: usize,
    pub source_malformed_faces: u64,
    pub target_faces: usize,
    pub target_clusters: usize,
    pub target_unclustered_faces: usize,
    pub target_malformed_faces: u64,
    pub common_photos: usize,
    pub only_in_source: usize,
    pub only_in_target: usize,
    pub raw_matches: usize,
    pub passing_matches: usize,
}

/// Immutable snapshot of one full analysis run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisBundle {
    pub thresholds: MatchThresholds,
    pub totals: AnalysisTotals,
    pub statistics: StatisticsBundle,
    pub rename_applicable: Vec<PairAggregate>,
    pub assign_unclustered: Vec<AssignUnclusteredGroup>,
    pub merge_candidates: Vec<MergeCandidate>,
    pub validation_issues: Vec<ValidationIssue>,
    pub create_face_candidates: Vec<CreateFaceGroup>,
    pub person_totals: Vec<PersonMatchTotal>,
}

// --- Executor types ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Processing,
    Success,
    Error,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyErrorKind {
    NotFound,
    AlreadyNamed,
    CreateFailed,
    AssignFailed,
    Network,
    Timeout,
    Other,
}

/// One event on the executor's progress stream.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub batch_id: Uuid,
    pub operation: String,
    pub index: usize,
    pub total: usize,
    pub label: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ApplyErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemResult {
    pub index: usize,
    pub label: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ApplyErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplyResults {
    pub success: Vec<ItemResult>,
    pub failed: Vec<ItemResult>,
    pub skipped: Vec<ItemResult>,
    /// Items never started because the batch was cancelled.
    pub pending: Vec<ItemResult>,
}

/// Structured outcome of one apply batch. Invariant:
/// success + failed + skipped + pending = total.
#[derive(Debug, Clone, Serialize)]
pub struct ApplyReport {
    pub batch_id: Uuid,
    pub operation: String,
    pub total: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub skipped_count: usize,
    pub pending_count: usize,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_error: Option<String>,
    pub results: ApplyResults,
}

// --- Executor inputs ---

#[derive(Debug, Clone, Deserialize)]
pub struct RenameItem {
    pub src_person_id: i64,
    pub src_person_name: String,
    pub cluster_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AssignItem {
    pub src_person_id: i64,
    pub src_person_name: String,
    pub face_ids: Vec<String>,
}

/// Pixel coordinates plus the image's own dimensions; the target API
/// client forwards these as-is.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateFaceItem {
    pub asset_id: String,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub image_width: i32,
    pub image_height: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckKind {
    Merge,
    Fix,
}

/// Acknowledgement-only item: the target service has no merge or
/// split-cluster API, so applying one is local bookkeeping.
#[derive(Debug, Clone, Deserialize)]
pub struct AckItem {
    pub src_person_id: i64,
    pub src_person_name: String,
    pub cluster_ids: Vec<String>,
}

/// Folds a display name for case- and whitespace-insensitive comparison.
pub fn fold_person_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
