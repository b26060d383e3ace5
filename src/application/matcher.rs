use crate::domain::{FaceRect, PhotoKey, RawFaceMatch, SourceInventory, TargetInventory};
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};

/// Normalized diagonal of the unit square; center distances divide by this
/// so they land in [0, 1].
const UNIT_DIAGONAL: f64 = std::f64::consts::SQRT_2;

/// Intersection-over-Union with the 0/0 = 0 convention.
#[inline]
pub fn iou(a: &FaceRect, b: &FaceRect) -> f64 {
    let ix = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let iy = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = ix * iy;
    let union = a.area() + b.area() - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Euclidean distance between rectangle centers, normalized by the image
/// diagonal so it lies in [0, 1].
#[inline]
pub fn center_dist(a: &FaceRect, b: &FaceRect) -> f64 {
    let (ax, ay) = a.center();
    let (bx, by) = b.center();
    ((ax - bx).powi(2) + (ay - by).powi(2)).sqrt() / UNIT_DIAGONAL
}

/// For each common photo, emits one RawFaceMatch per (source face, target
/// face) pair with IoU > 0. Many-to-many on purpose: one source face may
/// match several target faces and vice versa; downstream consumers filter
/// by thresholds and deduplicate at the right level.
///
/// Output order is determinised by (photo, source face id, target face id)
/// regardless of the parallel fan-out.
pub fn compute_raw_matches(
    source: &SourceInventory,
    target: &TargetInventory,
    common: &HashSet<PhotoKey>,
) -> Vec<RawFaceMatch> {
    let mut src_by_photo: HashMap<&PhotoKey, Vec<&crate::domain::SourceFace>> = HashMap::new();
    for face in &source.faces {
        if common.contains(&face.photo) {
            src_by_photo.entry(&face.photo).or_default().push(face);
        }
    }
    let mut tgt_by_photo: HashMap<&PhotoKey, Vec<&crate::domain::TargetFace>> = HashMap::new();
    for face in &target.faces {
        if common.contains(&face.photo) {
            tgt_by_photo.entry(&face.photo).or_default().push(face);
        }
    }

    // Only photos with faces on both sides can emit anything.
    let mut photos: Vec<&PhotoKey> = src_by_photo
        .keys()
        .filter(|k| tgt_by_photo.contains_key(*k))
        .copied()
        .collect();
    photos.sort();

    let mut matches: Vec<RawFaceMatch> = photos
        .par_iter()
        .flat_map_iter(|photo| {
            let src_faces = &src_by_photo[*photo];
            let tgt_faces = &tgt_by_photo[*photo];
            let mut local = Vec::new();
            for sf in src_faces {
                for tf in tgt_faces {
                    let overlap = iou(&sf.rect, &tf.rect);
                    if overlap <= 0.0 {
                        continue;
                    }
                    local.push(RawFaceMatch {
                        src_person_id: sf.person_id,
                        src_person_name: source.person_name(sf.person_id).to_string(),
                        src_face_id: sf.id,
                        cluster_id: tf.cluster_id.clone(),
                        cluster_name: tf.cluster_id.as_deref().and_then(|id| {
                            target.clusters.get(id).and_then(|c| c.name.clone())
                        }),
                        tgt_face_id: tf.id.clone(),
                        photo: (*photo).clone(),
                        iou: overlap,
                        center_dist: center_dist(&sf.rect, &tf.rect),
                    });
                }
            }
            local
        })
        .collect();

    matches.sort_by(|a, b| {
        (&a.photo, a.src_face_id, &a.tgt_face_id).cmp(&(&b.photo, b.src_face_id, &b.tgt_face_id))
    });
    matches
}
