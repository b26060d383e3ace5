use crate::application::aggregate::aggregate_matches;
use crate::application::classify::{classify, ClassifierKnobs};
use crate::application::joiner::{join_photos, PhotoJoin};
use crate::application::matcher::compute_raw_matches;
use crate::application::statistics::compute_statistics;
use crate::domain::{
    AnalysisBundle, AnalysisTotals, DomainError, MatchThresholds, RawFaceMatch, SourceInventory,
    SourceRepository, TargetInventory, TargetRepository,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// One load of both stores plus the threshold-free raw match list.
/// Published immutably: threshold changes re-derive everything downstream
/// from this without touching either store.
pub struct RawSnapshot {
    pub source: SourceInventory,
    pub target: TargetInventory,
    pub join: PhotoJoin,
    pub raw_matches: Vec<RawFaceMatch>,
}

/// Orchestrates the pipeline: readers -> joiner -> matcher once, then
/// statistics, aggregation and classification per (I, C).
pub struct Coordinator {
    snapshot: Mutex<Option<Arc<RawSnapshot>>>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            snapshot: Mutex::new(None),
        }
    }

    /// Drops the cached snapshot; the next analysis reloads both stores.
    /// Called when a connection setting is hot-swapped.
    pub async fn invalidate(&self) {
        *self.snapshot.lock().await = None;
        info!("analysis snapshot invalidated");
    }

    pub async fn run_full_analysis(
        &self,
        source: Arc<dyn SourceRepository>,
        target: Arc<dyn TargetRepository>,
        thresholds: MatchThresholds,
        knobs: ClassifierKnobs,
    ) -> Result<AnalysisBundle, DomainError> {
        let snapshot = self.snapshot_or_load(source, target).await?;
        Ok(derive_bundle(&snapshot, thresholds, &knobs))
    }

    /// First caller loads and publishes; concurrent callers wait on the
    /// lock and reuse the published snapshot.
    async fn snapshot_or_load(
        &self,
        source: Arc<dyn SourceRepository>,
        target: Arc<dyn TargetRepository>,
    ) -> Result<Arc<RawSnapshot>, DomainError> {
        let mut guard = self.snapshot.lock().await;
        if let Some(snapshot) = guard.as_ref() {
            return Ok(snapshot.clone());
        }

        let source_inv = source.load()?;
        let target_inv = target.load()?;
        let join = join_photos(&source_inv.photo_keys(), &target_inv.photo_keys());
        let raw_matches = compute_raw_matches(&source_inv, &target_inv, &join.common);
        info!(
            source_faces = source_inv.faces.len(),
            target_faces = target_inv.faces.len(),
            common_photos = join.common.len(),
            raw_matches = raw_matches.len(),
            "loaded analysis snapshot"
        );

        let snapshot = Arc::new(RawSnapshot {
            source: source_inv,
            target: target_inv,
            join,
            raw_matches,
        });
        *guard = Some(snapshot.clone());
        Ok(snapshot)
    }
}

fn derive_bundle(
    snapshot: &RawSnapshot,
    thresholds: MatchThresholds,
    knobs: &ClassifierKnobs,
) -> AnalysisBundle {
    let statistics = compute_statistics(&snapshot.raw_matches);
    let aggregation = aggregate_matches(&snapshot.raw_matches, &thresholds);
    let buckets = classify(
        &snapshot.raw_matches,
        &aggregation.pairs,
        &snapshot.source,
        &snapshot.target,
        &snapshot.join.common,
        &thresholds,
        knobs,
    );

    let totals = AnalysisTotals {
        source_persons: snapshot.source.persons.len(),
        source_orphans: snapshot.source.orphans.len(),
        source_faces: snapshot.source.faces.len(),
        source_malformed_faces: snapshot.source.malformed_faces,
        target_faces: snapshot.target.faces.len(),
        target_clusters: snapshot.target.clusters.len(),
        target_unclustered_faces: snapshot
            .target
            .faces
            .iter()
            .filter(|f| f.cluster_id.is_none())
            .count(),
        target_malformed_faces: snapshot.target.malformed_faces,
        common_photos: snapshot.join.common.len(),
        only_in_source: snapshot.join.only_in_source,
        only_in_target: snapshot.join.only_in_target,
        raw_matches: snapshot.raw_matches.len(),
        passing_matches: aggregation.passing_count,
    };

    AnalysisBundle {
        thresholds,
        totals,
        statistics,
        rename_applicable: buckets.rename_applicable,
        assign_unclustered: buckets.assign_unclustered,
        merge_candidates: buckets.merge_candidates,
        validation_issues: buckets.validation_issues,
        create_face_candidates: buckets.create_face_candidates,
        person_totals: aggregation.person_totals,
    }
}
