//! Label selector matching.

use crate::event::{Labels, Selectors};

/// True if every selector key is present in `labels` with an equal value.
///
/// An empty selector map matches everything.
pub fn matches(labels: &Labels, selectors: &Selectors) -> bool {
    selectors
        .iter()
        .all(|(key, want)| labels.get(key).is_some_and(|have| have == want))
}
