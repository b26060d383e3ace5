use crate::domain::PhotoKey;
use std::collections::HashSet;
use tracing::info;

/// Result of intersecting the two stores' photo sets.
#[derive(Debug, Clone, Default)]
pub struct PhotoJoin {
    pub common: HashSet<PhotoKey>,
    pub only_in_source: usize,
    pub only_in_target: usize,
}

/// Set intersection on PhotoKey. The one-sided counts are the main
/// diagnostic for path-mapping mistakes, so they are logged as well as
/// returned.
pub fn join_photos(source: &HashSet<PhotoKey>, target: &HashSet<PhotoKey>) -> PhotoJoin {
    let common: HashSet<PhotoKey> = source.intersection(target).cloned().collect();
    let join = PhotoJoin {
        only_in_source: source.len() - common.len(),
        only_in_target: target.len() - common.len(),
        common,
    };
    info!(
        common = join.common.len(),
        only_in_source = join.only_in_source,
        only_in_target = join.only_in_target,
        "joined photo sets"
    );
    join
}
