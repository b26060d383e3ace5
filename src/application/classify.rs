use crate::domain::{
    fold_person_name, AssignPreview, AssignUnclusteredGroup, CreateFaceCandidate, CreateFaceGroup,
    IssuePerson, MatchThresholds, MergeCandidate, MergeClusterRef, PairAggregate, PhotoKey,
    RawFaceMatch, Severity, SourceInventory, TargetInventory, ValidationIssue,
};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Bound on the assign-unclustered preview list.
const MAX_ASSIGN_PREVIEW: usize = 5;

#[derive(Debug, Clone, Copy)]
pub struct ClassifierKnobs {
    /// Minimum matched faces per cluster for a merge candidate.
    pub min_merge_matches: usize,
    /// Floor on pair match counts before a pair is actionable at all.
    pub min_pair_matches: usize,
    /// Whether the `needs_person_creation` lookup compares names case-
    /// and whitespace-insensitively. The two stores do not guarantee the
    /// same name semantics, so this is configuration, not a constant.
    pub person_name_case_insensitive: bool,
    /// A validation issue escalates to `error` when the runner-up person
    /// has at least this many matched faces...
    pub issue_error_min_faces: usize,
    /// ...and they make up at least this share of the cluster's total.
    pub issue_error_min_share: f64,
}

impl Default for ClassifierKnobs {
    fn default() -> Self {
        Self {
            min_merge_matches: 2,
            min_pair_matches: 1,
            person_name_case_insensitive: true,
            issue_error_min_faces: 2,
            issue_error_min_share: 0.10,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OperationBuckets {
    pub rename_applicable: Vec<PairAggregate>,
    pub assign_unclustered: Vec<AssignUnclusteredGroup>,
    pub merge_candidates: Vec<MergeCandidate>,
    pub validation_issues: Vec<ValidationIssue>,
    pub create_face_candidates: Vec<CreateFaceGroup>,
}

/// Derives the operation buckets from the aggregates plus both readers'
/// inventories. Deterministic given the raw matches and thresholds; every
/// listing is ordered by entity id after its primary sort key.
pub fn classify(
    raw: &[RawFaceMatch],
    pairs: &[PairAggregate],
    source: &SourceInventory,
    target: &TargetInventory,
    common: &HashSet<PhotoKey>,
    thresholds: &MatchThresholds,
    knobs: &ClassifierKnobs,
) -> OperationBuckets {
    let actionable: Vec<&PairAggregate> = pairs
        .iter()
        .filter(|p| p.match_count >= knobs.min_pair_matches)
        .collect();

    OperationBuckets {
        rename_applicable: rename_applicable(&actionable, target),
        assign_unclustered: assign_unclustered(raw, target, thresholds, knobs),
        merge_candidates: merge_candidates(&actionable, knobs),
        validation_issues: validation_issues(&actionable, target, knobs),
        create_face_candidates: create_face_candidates(raw, source, target, common, thresholds),
    }
}

/// Pairs whose target cluster is currently unnamed. Two source persons
/// matching the same unnamed cluster yield two entries; the executor
/// refuses to apply more than one of them.
fn rename_applicable(pairs: &[&PairAggregate], target: &TargetInventory) -> Vec<PairAggregate> {
    pairs
        .iter()
        .filter(|p| {
            target
                .clusters
                .get(&p.cluster_id)
                .map(|c| c.name.is_none())
                .unwrap_or(false)
        })
        .map(|p| (*p).clone())
        .collect()
}

fn assign_unclustered(
    raw: &[RawFaceMatch],
    target: &TargetInventory,
    thresholds: &MatchThresholds,
    knobs: &ClassifierKnobs,
) -> Vec<AssignUnclusteredGroup> {
    let asset_of: HashMap<&str, &str> = target
        .faces
        .iter()
        .map(|f| (f.id.as_str(), f.asset_id.as_str()))
        .collect();
    let known_names: HashSet<String> = if knobs.person_name_case_insensitive {
        target.person_names.iter().map(|n| fold_person_name(n)).collect()
    } else {
        target.person_names.clone()
    };
    let person_exists = |name: &str| {
        if knobs.person_name_case_insensitive {
            known_names.contains(&fold_person_name(name))
        } else {
            known_names.contains(name.trim())
        }
    };

    struct Group {
        name: String,
        faces: BTreeSet<String>,
        iou_sum: f64,
        match_count: usize,
        previews: Vec<(f64, String, PhotoKey)>,
    }
    let mut groups: BTreeMap<i64, Group> = BTreeMap::new();

    for m in raw {
        if m.cluster_id.is_some() || !thresholds.passes(m) {
            continue;
        }
        let g = groups.entry(m.src_person_id).or_insert_with(|| Group {
            name: m.src_person_name.clone(),
            faces: BTreeSet::new(),
            iou_sum: 0.0,
            match_count: 0,
            previews: Vec::new(),
        });
        g.iou_sum += m.iou;
        g.match_count += 1;
        if g.faces.insert(m.tgt_face_id.clone()) {
            g.previews.push((m.iou, m.tgt_face_id.clone(), m.photo.clone()));
        }
    }

    groups
        .into_iter()
        .map(|(src_person_id, mut g)| {
            g.previews.sort_by(|a, b| {
                b.0.partial_cmp(&a.0)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.1.cmp(&b.1))
            });
            let preview = g
                .previews
                .iter()
                .take(MAX_ASSIGN_PREVIEW)
                .map(|(iou, face_id, photo)| AssignPreview {
                    tgt_face_id: face_id.clone(),
                    asset_id: asset_of.get(face_id.as_str()).unwrap_or(&"").to_string(),
                    photo: photo.clone(),
                    iou: *iou,
                })
                .collect();
            AssignUnclusteredGroup {
                src_person_id,
                needs_person_creation: !person_exists(&g.name),
                src_person_name: g.name,
                face_count: g.faces.len(),
                mean_iou: g.iou_sum / g.match_count as f64,
                face_ids: g.faces.into_iter().collect(),
                preview,
            }
        })
        .collect()
}

fn merge_candidates(pairs: &[&PairAggregate], knobs: &ClassifierKnobs) -> Vec<MergeCandidate> {
    let mut by_person: BTreeMap<i64, (String, Vec<MergeClusterRef>)> = BTreeMap::new();
    for p in pairs {
        if p.match_count < knobs.min_merge_matches {
            continue;
        }
        let entry = by_person
            .entry(p.src_person_id)
            .or_insert_with(|| (p.src_person_name.clone(), Vec::new()));
        entry.1.push(MergeClusterRef {
            cluster_id: p.cluster_id.clone(),
            cluster_name: p.cluster_name.clone(),
            match_count: p.match_count,
            mean_iou: p.mean_iou,
        });
    }

    by_person
        .into_iter()
        .filter(|(_, (_, clusters))| clusters.len() >= 2)
        .map(|(src_person_id, (src_person_name, mut clusters))| {
            clusters.sort_by(|a, b| {
                b.match_count
                    .cmp(&a.match_count)
                    .then_with(|| a.cluster_id.cmp(&b.cluster_id))
            });
            MergeCandidate {
                src_person_id,
                src_person_name,
                clusters,
            }
        })
        .collect()
}

fn validation_issues(
    pairs: &[&PairAggregate],
    target: &TargetInventory,
    knobs: &ClassifierKnobs,
) -> Vec<ValidationIssue> {
    let mut by_cluster: BTreeMap<&str, Vec<&PairAggregate>> = BTreeMap::new();
    for p in pairs {
        by_cluster.entry(p.cluster_id.as_str()).or_default().push(p);
    }

    by_cluster
        .into_iter()
        .filter(|(_, members)| members.len() >= 2)
        .map(|(cluster_id, members)| {
            let mut persons: Vec<IssuePerson> = members
                .iter()
                .map(|p| IssuePerson {
                    src_person_id: p.src_person_id,
                    src_person_name: p.src_person_name.clone(),
                    face_count: p.match_count,
                })
                .collect();
            persons.sort_by(|a, b| {
                b.face_count
                    .cmp(&a.face_count)
                    .then_with(|| a.src_person_id.cmp(&b.src_person_id))
            });

            let matched_faces: usize = persons.iter().map(|p| p.face_count).sum();
            let total_faces_in_cluster = target
                .clusters
                .get(cluster_id)
                .map(|c| c.face_count)
                .unwrap_or(matched_faces as i64);
            let runner_up = persons[1].face_count;
            let severity = if runner_up >= knobs.issue_error_min_faces
                && runner_up as f64 >= knobs.issue_error_min_share * total_faces_in_cluster as f64
            {
                Severity::Error
            } else {
                Severity::Warning
            };
            ValidationIssue {
                cluster_id: cluster_id.to_string(),
                cluster_name: target
                    .clusters
                    .get(cluster_id)
                    .and_then(|c| c.name.clone()),
                severity,
                matched_faces,
                total_faces_in_cluster,
                persons,
            }
        })
        .collect()
}

/// Source faces on a common photo with no target counterpart at IoU >= I.
/// Only the IoU leg of the thresholds applies here: a face whose best
/// correspondence is merely off-center already exists on the target side.
fn create_face_candidates(
    raw: &[RawFaceMatch],
    source: &SourceInventory,
    target: &TargetInventory,
    common: &HashSet<PhotoKey>,
    thresholds: &MatchThresholds,
) -> Vec<CreateFaceGroup> {
    let covered: HashSet<i64> = raw
        .iter()
        .filter(|m| m.iou >= thresholds.min_iou)
        .map(|m| m.src_face_id)
        .collect();

    let mut by_person: BTreeMap<i64, Vec<CreateFaceCandidate>> = BTreeMap::new();
    for face in &source.faces {
        if !common.contains(&face.photo) || covered.contains(&face.id) {
            continue;
        }
        let asset = target.assets.get(&face.photo);
        by_person
            .entry(face.person_id)
            .or_default()
            .push(CreateFaceCandidate {
                src_face_id: face.id,
                photo: face.photo.clone(),
                rect: face.rect,
                asset_id: asset.map(|a| a.id.clone()),
                image_width: asset.and_then(|a| a.width),
                image_height: asset.and_then(|a| a.height),
            });
    }

    by_person
        .into_iter()
        .map(|(src_person_id, mut faces)| {
            faces.sort_by_key(|f| f.src_face_id);
            CreateFaceGroup {
                src_person_id,
                src_person_name: source.person_name(src_person_id).to_string(),
                faces,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Cluster, Confidence, SourceFace, SourcePerson, TargetAsset, TargetFace};

    fn key(name: &str) -> PhotoKey {
        PhotoKey::from_parts(name, Some(1))
    }

    fn pair(person: i64, cluster: &str, count: usize, mean_iou: f64) -> PairAggregate {
        PairAggregate {
            src_person_id: person,
            src_person_name: format!("person-{}", person),
            cluster_id: cluster.to_string(),
            cluster_name: None,
            match_count: count,
            mean_iou,
            mean_center_dist: 0.1,
            confidence: Confidence::grade(count, mean_iou),
            sample_photos: vec![],
        }
    }

    fn cluster(id: &str, name: Option<&str>, faces: i64) -> Cluster {
        Cluster {
            id: id.to_string(),
            name: name.map(String::from),
            face_count: faces,
        }
    }

    fn raw(person: i64, cluster: Option<&str>, src_face: i64, tgt_face: &str, iou: f64) -> RawFaceMatch {
        RawFaceMatch {
            src_person_id: person,
            src_person_name: format!("person-{}", person),
            src_face_id: src_face,
            cluster_id: cluster.map(String::from),
            cluster_name: None,
            tgt_face_id: tgt_face.to_string(),
            photo: key("shared.jpg"),
            iou,
            center_dist: 0.05,
        }
    }

    fn empty_source() -> SourceInventory {
        SourceInventory::default()
    }

    fn face_rect() -> crate::domain::FaceRect {
        crate::domain::FaceRect::new(0.2, 0.2, 0.4, 0.4).unwrap()
    }

    #[test]
    fn unnamed_cluster_pairs_become_rename_applicable() {
        let mut target = TargetInventory::default();
        target.clusters.insert("x".into(), cluster("x", None, 3));
        target.clusters.insert("y".into(), cluster("y", Some("Named"), 3));

        let pairs = vec![pair(1, "x", 1, 1.0), pair(1, "y", 1, 1.0)];
        let buckets = classify(
            &[],
            &pairs,
            &empty_source(),
            &target,
            &HashSet::new(),
            &MatchThresholds::default(),
            &ClassifierKnobs::default(),
        );
        assert_eq!(buckets.rename_applicable.len(), 1);
        assert_eq!(buckets.rename_applicable[0].cluster_id, "x");
    }

    #[test]
    fn same_unnamed_cluster_with_two_persons_yields_two_entries() {
        let mut target = TargetInventory::default();
        target.clusters.insert("x".into(), cluster("x", None, 4));

        let pairs = vec![pair(1, "x", 2, 0.9), pair(2, "x", 1, 0.8)];
        let buckets = classify(
            &[],
            &pairs,
            &empty_source(),
            &target,
            &HashSet::new(),
            &MatchThresholds::default(),
            &ClassifierKnobs::default(),
        );
        assert_eq!(buckets.rename_applicable.len(), 2);
    }

    #[test]
    fn assign_unclustered_groups_by_person_with_unique_faces() {
        let mut target = TargetInventory::default();
        target.faces.push(TargetFace {
            id: "t1".into(),
            asset_id: "asset-1".into(),
            photo: key("shared.jpg"),
            rect: face_rect(),
            cluster_id: None,
        });
        target.person_names.insert("person-1".into());

        let matches = vec![
            raw(1, None, 10, "t1", 0.8),
            raw(1, None, 11, "t1", 0.6), // same target face again
            raw(2, None, 12, "t1", 0.2), // below threshold
        ];
        let buckets = classify(
            &matches,
            &[],
            &empty_source(),
            &target,
            &HashSet::new(),
            &MatchThresholds::default(),
            &ClassifierKnobs::default(),
        );
        assert_eq!(buckets.assign_unclustered.len(), 1);
        let g = &buckets.assign_unclustered[0];
        assert_eq!(g.src_person_id, 1);
        assert_eq!(g.face_count, 1);
        assert_eq!(g.face_ids, vec!["t1".to_string()]);
        assert!((g.mean_iou - 0.7).abs() < 1e-9);
        assert!(!g.needs_person_creation);
        assert_eq!(g.preview[0].asset_id, "asset-1");
    }

    #[test]
    fn assign_unclustered_flags_missing_target_person() {
        let target = TargetInventory::default();
        let matches = vec![raw(7, None, 1, "t1", 0.9)];
        let buckets = classify(
            &matches,
            &[],
            &empty_source(),
            &target,
            &HashSet::new(),
            &MatchThresholds::default(),
            &ClassifierKnobs::default(),
        );
        assert!(buckets.assign_unclustered[0].needs_person_creation);
    }

    #[test]
    fn name_lookup_can_be_case_sensitive() {
        let mut target = TargetInventory::default();
        target.person_names.insert("PERSON-1".into());
        let matches = vec![raw(1, None, 1, "t1", 0.9)];

        let insensitive = classify(
            &matches,
            &[],
            &empty_source(),
            &target,
            &HashSet::new(),
            &MatchThresholds::default(),
            &ClassifierKnobs::default(),
        );
        assert!(!insensitive.assign_unclustered[0].needs_person_creation);

        let sensitive = classify(
            &matches,
            &[],
            &empty_source(),
            &target,
            &HashSet::new(),
            &MatchThresholds::default(),
            &ClassifierKnobs {
                person_name_case_insensitive: false,
                ..ClassifierKnobs::default()
            },
        );
        assert!(sensitive.assign_unclustered[0].needs_person_creation);
    }

    #[test]
    fn merge_requires_two_clusters_at_min_matches() {
        let target = TargetInventory::default();
        let knobs = ClassifierKnobs {
            min_merge_matches: 2,
            ..ClassifierKnobs::default()
        };
        // Person 1: two clusters but one below min_matches. Person 2: two
        // qualifying clusters, bigger one first.
        let pairs = vec![
            pair(1, "a", 5, 0.9),
            pair(1, "b", 1, 0.9),
            pair(2, "c", 2, 0.9),
            pair(2, "d", 4, 0.9),
        ];
        let buckets = classify(
            &[],
            &pairs,
            &empty_source(),
            &target,
            &HashSet::new(),
            &MatchThresholds::default(),
            &knobs,
        );
        assert_eq!(buckets.merge_candidates.len(), 1);
        let mc = &buckets.merge_candidates[0];
        assert_eq!(mc.src_person_id, 2);
        assert_eq!(mc.clusters.len(), 2);
        assert_eq!(mc.clusters[0].cluster_id, "d");
    }

    #[test]
    fn merge_with_min_matches_one_accepts_single_match_clusters() {
        let target = TargetInventory::default();
        let knobs = ClassifierKnobs {
            min_merge_matches: 1,
            ..ClassifierKnobs::default()
        };
        let pairs = vec![pair(3, "x", 1, 0.9), pair(3, "y", 1, 0.9)];
        let buckets = classify(
            &[],
            &pairs,
            &empty_source(),
            &target,
            &HashSet::new(),
            &MatchThresholds::default(),
            &knobs,
        );
        assert_eq!(buckets.merge_candidates.len(), 1);
        assert_eq!(buckets.merge_candidates[0].clusters.len(), 2);
    }

    #[test]
    fn contested_cluster_severity_depends_on_runner_up() {
        let mut target = TargetInventory::default();
        target.clusters.insert("z".into(), cluster("z", Some("Dave"), 10));
        target.clusters.insert("w".into(), cluster("w", None, 100));

        // Cluster z: runner-up has 2 faces, 20% of 10 -> error.
        // Cluster w: runner-up has 2 faces but only 2% of 100 -> warning.
        let pairs = vec![
            pair(1, "z", 6, 0.9),
            pair(2, "z", 2, 0.9),
            pair(3, "w", 50, 0.9),
            pair(4, "w", 2, 0.9),
        ];
        let buckets = classify(
            &[],
            &pairs,
            &empty_source(),
            &target,
            &HashSet::new(),
            &MatchThresholds::default(),
            &ClassifierKnobs::default(),
        );
        assert_eq!(buckets.validation_issues.len(), 2);
        let w = buckets.validation_issues.iter().find(|i| i.cluster_id == "w").unwrap();
        let z = buckets.validation_issues.iter().find(|i| i.cluster_id == "z").unwrap();
        assert_eq!(z.severity, Severity::Error);
        assert_eq!(w.severity, Severity::Warning);
        assert_eq!(z.matched_faces, 8);
        assert_eq!(z.total_faces_in_cluster, 10);
        assert_eq!(z.persons[0].face_count, 6);
    }

    #[test]
    fn single_person_runner_up_of_one_face_is_warning() {
        let mut target = TargetInventory::default();
        target.clusters.insert("z".into(), cluster("z", None, 4));
        let pairs = vec![pair(1, "z", 3, 0.9), pair(2, "z", 1, 0.9)];
        let buckets = classify(
            &[],
            &pairs,
            &empty_source(),
            &target,
            &HashSet::new(),
            &MatchThresholds::default(),
            &ClassifierKnobs::default(),
        );
        assert_eq!(buckets.validation_issues[0].severity, Severity::Warning);
    }

    #[test]
    fn uncovered_source_faces_become_create_candidates() {
        let shared = key("shared.jpg");
        let mut source = SourceInventory::default();
        source.persons.insert(
            9,
            SourcePerson {
                id: 9,
                name: "Frank".into(),
                face_count: 2,
            },
        );
        source.faces.push(SourceFace {
            id: 100,
            person_id: 9,
            photo: shared.clone(),
            rect: face_rect(),
        });
        source.faces.push(SourceFace {
            id: 101,
            person_id: 9,
            photo: key("elsewhere.jpg"),
            rect: face_rect(),
        });

        let mut target = TargetInventory::default();
        target.assets.insert(
            shared.clone(),
            TargetAsset {
                id: "asset-9".into(),
                width: Some(4000),
                height: Some(3000),
            },
        );

        let common: HashSet<_> = [shared].into();
        let buckets = classify(
            &[],
            &[],
            &source,
            &target,
            &common,
            &MatchThresholds::default(),
            &ClassifierKnobs::default(),
        );
        assert_eq!(buckets.create_face_candidates.len(), 1);
        let g = &buckets.create_face_candidates[0];
        assert_eq!(g.src_person_name, "Frank");
        assert_eq!(g.faces.len(), 1);
        assert_eq!(g.faces[0].src_face_id, 100);
        assert_eq!(g.faces[0].asset_id.as_deref(), Some("asset-9"));
        assert_eq!(g.faces[0].image_width, Some(4000));
    }

    #[test]
    fn covered_source_faces_are_not_create_candidates() {
        let shared = key("shared.jpg");
        let mut source = SourceInventory::default();
        source.persons.insert(
            1,
            SourcePerson {
                id: 1,
                name: "person-1".into(),
                face_count: 1,
            },
        );
        source.faces.push(SourceFace {
            id: 10,
            person_id: 1,
            photo: shared.clone(),
            rect: face_rect(),
        });
        let target = TargetInventory::default();
        let common: HashSet<_> = [shared].into();

        // Covered at IoU >= I even though the center distance leg fails.
        let mut covered = raw(1, Some("c"), 10, "t1", 0.5);
        covered.center_dist = 0.99;
        let buckets = classify(
            &[covered],
            &[],
            &source,
            &target,
            &common,
            &MatchThresholds::default(),
            &ClassifierKnobs::default(),
        );
        assert!(buckets.create_face_candidates.is_empty());
    }

}
