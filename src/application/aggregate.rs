use crate::domain::{
    Confidence, MatchThresholds, PairAggregate, PersonMatchTotal, PhotoKey, RawFaceMatch,
};
use std::collections::{HashMap, HashSet};

/// Bound on the per-pair photo sample.
const MAX_SAMPLE_PHOTOS: usize = 5;

#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    /// One entry per (source person, target cluster) with passing matches.
    pub pairs: Vec<PairAggregate>,
    /// Per source person, the number of unique target faces matched.
    pub person_totals: Vec<PersonMatchTotal>,
    pub passing_count: usize,
}

struct PairAccum {
    src_person_name: String,
    cluster_name: Option<String>,
    count: usize,
    iou_sum: f64,
    dist_sum: f64,
    photos: Vec<(f64, PhotoKey)>,
}

/// Groups threshold-passing matches by (source person, cluster). Matches
/// against unclustered faces carry no cluster and are aggregated by the
/// classifier instead; they still count into the per-person totals.
pub fn aggregate_matches(raw: &[RawFaceMatch], thresholds: &MatchThresholds) -> Aggregation {
    let mut pairs: HashMap<(i64, String), PairAccum> = HashMap::new();
    let mut person_faces: HashMap<i64, (String, HashSet<String>)> = HashMap::new();
    let mut passing_count = 0usize;

    for m in raw.iter().filter(|m| thresholds.passes(m)) {
        passing_count += 1;
        let (_, faces) = person_faces
            .entry(m.src_person_id)
            .or_insert_with(|| (m.src_person_name.clone(), HashSet::new()));
        faces.insert(m.tgt_face_id.clone());

        let Some(cluster_id) = m.cluster_id.clone() else {
            continue;
        };
        let acc = pairs
            .entry((m.src_person_id, cluster_id))
            .or_insert_with(|| PairAccum {
                src_person_name: m.src_person_name.clone(),
                cluster_name: m.cluster_name.clone(),
                count: 0,
                iou_sum: 0.0,
                dist_sum: 0.0,
                photos: Vec::new(),
            });
        acc.count += 1;
        acc.iou_sum += m.iou;
        acc.dist_sum += m.center_dist;
        acc.photos.push((m.iou, m.photo.clone()));
    }

    let mut out: Vec<PairAggregate> = pairs
        .into_iter()
        .map(|((src_person_id, cluster_id), acc)| {
            let mean_iou = acc.iou_sum / acc.count as f64;
            PairAggregate {
                src_person_id,
                src_person_name: acc.src_person_name,
                cluster_id,
                cluster_name: acc.cluster_name,
                match_count: acc.count,
                mean_iou,
                mean_center_dist: acc.dist_sum / acc.count as f64,
                confidence: Confidence::grade(acc.count, mean_iou),
                sample_photos: sample_photos(acc.photos),
            }
        })
        .collect();
    out.sort_by(|a, b| {
        (a.src_person_id, &a.cluster_id).cmp(&(b.src_person_id, &b.cluster_id))
    });

    let mut person_totals: Vec<PersonMatchTotal> = person_faces
        .into_iter()
        .map(|(src_person_id, (src_person_name, faces))| PersonMatchTotal {
            src_person_id,
            src_person_name,
            matched_faces: faces.len(),
        })
        .collect();
    person_totals.sort_by_key(|t| t.src_person_id);

    Aggregation {
        pairs: out,
        person_totals,
        passing_count,
    }
}

/// Up to five distinct photos, most-overlapping first.
pub(crate) fn sample_photos(mut scored: Vec<(f64, PhotoKey)>) -> Vec<PhotoKey> {
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.1.cmp(&b.1))
    });
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for (_, photo) in scored {
        if seen.insert(photo.clone()) {
            out.push(photo);
            if out.len() == MAX_SAMPLE_PHOTOS {
                break;
            }
        }
    }
    out
}
