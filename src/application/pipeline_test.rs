//! End-to-end pipeline tests over in-memory store fakes: readers ->
//! joiner -> matcher -> statistics -> aggregation -> classification via
//! the coordinator, without touching SQLite or Postgres.

use crate::application::classify::ClassifierKnobs;
use crate::application::Coordinator;
use crate::domain::{
    Cluster, Confidence, DomainError, FaceRect, MatchThresholds, PhotoKey, Severity, SourceFace,
    SourceInventory, SourcePerson, SourceRepository, SourceTotals, TargetAsset, TargetFace,
    TargetInventory, TargetRepository, TargetTotals,
};
use std::sync::Arc;

struct FakeSource(SourceInventory);

impl SourceRepository for FakeSource {
    fn load(&self) -> Result<SourceInventory, DomainError> {
        Ok(self.0.clone())
    }

    fn totals(&self) -> Result<SourceTotals, DomainError> {
        Ok(SourceTotals {
            persons: self.0.persons.len() as i64,
            faces: self.0.faces.len() as i64,
            photos: self.0.photo_keys().len() as i64,
        })
    }
}

struct FakeTarget(TargetInventory);

impl TargetRepository for FakeTarget {
    fn load(&self) -> Result<TargetInventory, DomainError> {
        Ok(self.0.clone())
    }

    fn totals(&self) -> Result<TargetTotals, DomainError> {
        Ok(TargetTotals {
            assets: self.0.assets.len() as i64,
            faces: self.0.faces.len() as i64,
            clusters: self.0.clusters.len() as i64,
        })
    }
}

fn key(name: &str) -> PhotoKey {
    PhotoKey::from_parts(name, Some(1000))
}

fn rect(x1: f64, y1: f64, x2: f64, y2: f64) -> FaceRect {
    FaceRect::new(x1, y1, x2, y2).unwrap()
}

struct SourceBuilder(SourceInventory);

impl SourceBuilder {
    fn new() -> Self {
        Self(SourceInventory::default())
    }

    fn person(mut self, id: i64, name: &str) -> Self {
        self.0.persons.insert(
            id,
            SourcePerson {
                id,
                name: name.to_string(),
                face_count: 0,
            },
        );
        self
    }

    fn face(mut self, id: i64, person_id: i64, photo: &str, r: FaceRect) -> Self {
        self.0.faces.push(SourceFace {
            id,
            person_id,
            photo: key(photo),
            rect: r,
        });
        if let Some(p) = self.0.persons.get_mut(&person_id) {
            p.face_count += 1;
        }
        self
    }

    fn build(self) -> Arc<FakeSource> {
        Arc::new(FakeSource(self.0))
    }
}

struct TargetBuilder(TargetInventory);

impl TargetBuilder {
    fn new() -> Self {
        Self(TargetInventory::default())
    }

    fn asset(mut self, id: &str, photo: &str) -> Self {
        self.0.assets.insert(
            key(photo),
            TargetAsset {
                id: id.to_string(),
                width: Some(4000),
                height: Some(3000),
            },
        );
        self
    }

    fn cluster(mut self, id: &str, name: Option<&str>, face_count: i64) -> Self {
        if let Some(name) = name {
            self.0.person_names.insert(name.to_string());
        }
        self.0.clusters.insert(
            id.to_string(),
            Cluster {
                id: id.to_string(),
                name: name.map(String::from),
                face_count,
            },
        );
        self
    }

    fn person_name(mut self, name: &str) -> Self {
        self.0.person_names.insert(name.to_string());
        self
    }

    fn face(mut self, id: &str, asset_id: &str, photo: &str, r: FaceRect, cluster: Option<&str>) -> Self {
        self.0.faces.push(TargetFace {
            id: id.to_string(),
            asset_id: asset_id.to_string(),
            photo: key(photo),
            rect: r,
            cluster_id: cluster.map(String::from),
        });
        self
    }

    fn build(self) -> Arc<FakeTarget> {
        Arc::new(FakeTarget(self.0))
    }
}

async fn analyze(
    source: Arc<FakeSource>,
    target: Arc<FakeTarget>,
    knobs: ClassifierKnobs,
) -> crate::domain::AnalysisBundle {
    Coordinator::new()
        .run_full_analysis(source, target, MatchThresholds::default(), knobs)
        .await
        .unwrap()
}

#[tokio::test]
async fn perfect_overlap_on_unnamed_cluster_becomes_a_rename() {
    let source = SourceBuilder::new()
        .person(1, "Alice")
        .face(1, 1, "photo1.jpg", rect(0.10, 0.10, 0.40, 0.40))
        .build();
    let target = TargetBuilder::new()
        .asset("asset-1", "photo1.jpg")
        .cluster("x", None, 1)
        .face("t1", "asset-1", "photo1.jpg", rect(0.10, 0.10, 0.40, 0.40), Some("x"))
        .build();

    let bundle = analyze(source, target, ClassifierKnobs::default()).await;

    assert_eq!(bundle.totals.raw_matches, 1);
    assert_eq!(bundle.totals.passing_matches, 1);
    assert_eq!(bundle.rename_applicable.len(), 1);
    let pair = &bundle.rename_applicable[0];
    assert_eq!(pair.src_person_name, "Alice");
    assert_eq!(pair.cluster_id, "x");
    assert_eq!(pair.match_count, 1);
    assert!((pair.mean_iou - 1.0).abs() < 1e-9);
    assert!(pair.mean_center_dist.abs() < 1e-12);
    // One match is below the medium-confidence count floor.
    assert_eq!(pair.confidence, Confidence::Low);

    assert!(bundle.assign_unclustered.is_empty());
    assert!(bundle.merge_candidates.is_empty());
    assert!(bundle.validation_issues.is_empty());
    assert!(bundle.create_face_candidates.is_empty());
}

#[tokio::test]
async fn unclustered_overlap_becomes_an_assignment() {
    let source = SourceBuilder::new()
        .person(1, "Bob")
        .face(1, 1, "photo1.jpg", rect(0.5, 0.5, 0.7, 0.7))
        .build();
    let target = TargetBuilder::new()
        .asset("asset-1", "photo1.jpg")
        .face("t1", "asset-1", "photo1.jpg", rect(0.51, 0.51, 0.69, 0.69), None)
        .build();

    let bundle = analyze(source, target, ClassifierKnobs::default()).await;

    assert!(bundle.rename_applicable.is_empty());
    assert_eq!(bundle.assign_unclustered.len(), 1);
    let group = &bundle.assign_unclustered[0];
    assert_eq!(group.src_person_name, "Bob");
    assert_eq!(group.face_count, 1);
    assert_eq!(group.face_ids, vec!["t1".to_string()]);
    assert!(group.mean_iou > 0.7);
    // No target person named Bob exists yet.
    assert!(group.needs_person_creation);
}

#[tokio::test]
async fn existing_target_person_suppresses_creation() {
    let source = SourceBuilder::new()
        .person(1, "Bob")
        .face(1, 1, "photo1.jpg", rect(0.5, 0.5, 0.7, 0.7))
        .build();
    let target = TargetBuilder::new()
        .asset("asset-1", "photo1.jpg")
        .person_name("Bob")
        .face("t1", "asset-1", "photo1.jpg", rect(0.51, 0.51, 0.69, 0.69), None)
        .build();

    let bundle = analyze(source, target, ClassifierKnobs::default()).await;
    assert!(!bundle.assign_unclustered[0].needs_person_creation);
}

#[tokio::test]
async fn one_person_across_two_clusters_is_a_merge_candidate() {
    let source = SourceBuilder::new()
        .person(1, "Carol")
        .face(1, 1, "photo1.jpg", rect(0.1, 0.1, 0.5, 0.5))
        .face(2, 1, "photo2.jpg", rect(0.2, 0.2, 0.6, 0.6))
        .build();
    let target = TargetBuilder::new()
        .asset("asset-1", "photo1.jpg")
        .asset("asset-2", "photo2.jpg")
        .cluster("x", None, 1)
        .cluster("y", None, 1)
        .face("t1", "asset-1", "photo1.jpg", rect(0.1, 0.1, 0.48, 0.5), Some("x"))
        .face("t2", "asset-2", "photo2.jpg", rect(0.2, 0.2, 0.58, 0.6), Some("y"))
        .build();

    let knobs = ClassifierKnobs {
        min_merge_matches: 1,
        ..ClassifierKnobs::default()
    };
    let bundle = analyze(source, target, knobs).await;

    assert_eq!(bundle.merge_candidates.len(), 1);
    let candidate = &bundle.merge_candidates[0];
    assert_eq!(candidate.src_person_name, "Carol");
    let ids: Vec<&str> = candidate.clusters.iter().map(|c| c.cluster_id.as_str()).collect();
    assert!(ids.contains(&"x") && ids.contains(&"y"));
}

#[tokio::test]
async fn contested_cluster_raises_a_validation_issue() {
    // Two target faces in the already-named cluster Z; Dave and Eve each
    // overlap a different one.
    let source = SourceBuilder::new()
        .person(1, "Dave")
        .person(2, "Eve")
        .face(1, 1, "photo1.jpg", rect(0.1, 0.1, 0.3, 0.3))
        .face(2, 2, "photo1.jpg", rect(0.6, 0.6, 0.8, 0.8))
        .build();
    let build_target = || {
        TargetBuilder::new()
            .asset("asset-1", "photo1.jpg")
            .cluster("z", Some("Dave"), 2)
            .face("t1", "asset-1", "photo1.jpg", rect(0.1, 0.1, 0.31, 0.3), Some("z"))
            .face("t2", "asset-1", "photo1.jpg", rect(0.6, 0.6, 0.81, 0.8), Some("z"))
            .build()
    };

    let bundle = analyze(
        SourceBuilder::new()
            .person(1, "Dave")
            .person(2, "Eve")
            .face(1, 1, "photo1.jpg", rect(0.1, 0.1, 0.3, 0.3))
            .face(2, 2, "photo1.jpg", rect(0.6, 0.6, 0.8, 0.8))
            .build(),
        build_target(),
        ClassifierKnobs::default(),
    )
    .await;

    assert_eq!(bundle.validation_issues.len(), 1);
    let issue = &bundle.validation_issues[0];
    assert_eq!(issue.cluster_id, "z");
    assert_eq!(issue.matched_faces, 2);
    assert_eq!(issue.persons.len(), 2);
    assert!(issue.persons.iter().all(|p| p.face_count == 1));
    // With the default knobs a single-face runner-up stays a warning.
    assert_eq!(issue.severity, Severity::Warning);

    // Lowering the face-count knob escalates the same cluster to error.
    let strict = ClassifierKnobs {
        issue_error_min_faces: 1,
        ..ClassifierKnobs::default()
    };
    let bundle = analyze(source, build_target(), strict).await;
    assert_eq!(bundle.validation_issues[0].severity, Severity::Error);
}

#[tokio::test]
async fn face_missing_on_target_becomes_a_create_candidate() {
    let source = SourceBuilder::new()
        .person(1, "Frank")
        .face(1, 1, "photo1.jpg", rect(0.2, 0.2, 0.4, 0.4))
        .build();
    // The asset exists on the target side but has no face detections.
    let target = TargetBuilder::new().asset("asset-1", "photo1.jpg").build();

    let bundle = analyze(source, target, ClassifierKnobs::default()).await;

    assert_eq!(bundle.totals.common_photos, 1);
    assert_eq!(bundle.create_face_candidates.len(), 1);
    let group = &bundle.create_face_candidates[0];
    assert_eq!(group.src_person_name, "Frank");
    assert_eq!(group.faces.len(), 1);
    assert_eq!(group.faces[0].asset_id.as_deref(), Some("asset-1"));
    assert_eq!(group.faces[0].image_width, Some(4000));

    assert!(bundle.rename_applicable.is_empty());
    assert!(bundle.assign_unclustered.is_empty());
    assert!(bundle.merge_candidates.is_empty());
    assert!(bundle.validation_issues.is_empty());
}

#[tokio::test]
async fn empty_common_photo_set_yields_empty_buckets_and_fallbacks() {
    let source = SourceBuilder::new()
        .person(1, "Alice")
        .face(1, 1, "only-here.jpg", rect(0.1, 0.1, 0.4, 0.4))
        .build();
    let target = TargetBuilder::new().asset("asset-1", "only-there.jpg").build();

    let bundle = analyze(source, target, ClassifierKnobs::default()).await;

    assert_eq!(bundle.totals.common_photos, 0);
    assert_eq!(bundle.totals.only_in_source, 1);
    assert_eq!(bundle.totals.only_in_target, 1);
    assert_eq!(bundle.totals.raw_matches, 0);
    assert!(bundle.rename_applicable.is_empty());
    assert!(bundle.assign_unclustered.is_empty());
    assert!(bundle.merge_candidates.is_empty());
    assert!(bundle.validation_issues.is_empty());
    assert!(bundle.create_face_candidates.is_empty());
    assert_eq!(bundle.statistics.iou.histogram, vec![0u64; 20]);
    assert!(bundle.statistics.iou.fallback_used);
    assert_eq!(bundle.statistics.iou.suggested_threshold, 0.30);
    assert_eq!(bundle.statistics.center_dist.suggested_threshold, 0.40);
}

#[tokio::test]
async fn applied_renames_disappear_from_the_next_analysis() {
    let source = SourceBuilder::new()
        .person(1, "Alice")
        .face(1, 1, "photo1.jpg", rect(0.10, 0.10, 0.40, 0.40))
        .build();
    let before = TargetBuilder::new()
        .asset("asset-1", "photo1.jpg")
        .cluster("x", None, 1)
        .face("t1", "asset-1", "photo1.jpg", rect(0.10, 0.10, 0.40, 0.40), Some("x"))
        .build();

    let coordinator = Coordinator::new();
    let bundle = coordinator
        .run_full_analysis(
            source.clone(),
            before,
            MatchThresholds::default(),
            ClassifierKnobs::default(),
        )
        .await
        .unwrap();
    assert_eq!(bundle.rename_applicable.len(), 1);

    // The same store after the rename was applied remotely.
    let after = TargetBuilder::new()
        .asset("asset-1", "photo1.jpg")
        .cluster("x", Some("Alice"), 1)
        .face("t1", "asset-1", "photo1.jpg", rect(0.10, 0.10, 0.40, 0.40), Some("x"))
        .build();
    coordinator.invalidate().await;
    let bundle = coordinator
        .run_full_analysis(
            source,
            after,
            MatchThresholds::default(),
            ClassifierKnobs::default(),
        )
        .await
        .unwrap();
    assert!(bundle.rename_applicable.is_empty());
}
