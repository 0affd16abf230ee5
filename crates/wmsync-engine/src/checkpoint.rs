//! Initial cursors and bookmark advancement.

use chrono::{DateTime, SecondsFormat, Utc};
use wmsync_state::{BookmarkStore, StateError};
use wmsync_types::state::{Bookmark, CursorValue, EntityName};
use wmsync_types::wire::SyncMode;

use crate::config::ModeConfig;
use crate::pipeline::{CursorFilter, FilterOp};

/// Full sync reads newest-first on a stable id; incremental reads oldest-first.
#[must_use]
pub fn ordering_descending(mode: SyncMode) -> bool {
    mode == SyncMode::Full
}

/// Extraction filter for one entity at run start.
///
/// FULL: no filter on the first run, then `key < last`. INCREMENTAL:
/// `key >= (last or now) - overlap` so late-arriving changes are re-read.
#[must_use]
pub fn initial_filter(
    mode: SyncMode,
    config: &ModeConfig,
    bookmark: Option<&Bookmark>,
    now: DateTime<Utc>,
) -> Option<CursorFilter> {
    let field = config.ordering_key.clone();
    match mode {
        SyncMode::Full => bookmark.map(|b| CursorFilter {
            field,
            op: FilterOp::Lt,
            value: b.replication_key_value.clone(),
        }),
        SyncMode::Incremental => {
            let overlap = chrono::Duration::from_std(config.overlap_window())
                .unwrap_or_else(|_| chrono::Duration::zero());
            let value = match bookmark {
                None => timestamp_value(now - overlap),
                Some(b) => match b.replication_key_value.as_timestamp() {
                    Some(ts) => timestamp_value(ts - overlap),
                    None => b.replication_key_value.clone(),
                },
            };
            Some(CursorFilter {
                field,
                op: FilterOp::Gte,
                value,
            })
        }
    }
}

fn timestamp_value(ts: DateTime<Utc>) -> CursorValue {
    CursorValue::Text(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// Whether moving from `current` to `candidate` would step backwards for
/// the mode's read direction.
#[must_use]
pub fn is_regression(mode: SyncMode, current: &CursorValue, candidate: &CursorValue) -> bool {
    let ordering = candidate.compare(current);
    if ordering_descending(mode) {
        ordering.is_gt()
    } else {
        ordering.is_lt()
    }
}

/// Persist `candidate` as the bookmark for `entity`, unless it would move
/// the cursor backwards. Returns the bookmark written, if any.
///
/// Only called after the batch ending at `candidate` committed.
///
/// # Errors
///
/// Returns [`StateError`] if the store cannot be read or written.
pub fn advance_bookmark(
    store: &dyn BookmarkStore,
    entity: &EntityName,
    mode: SyncMode,
    candidate: &CursorValue,
) -> Result<Option<Bookmark>, StateError> {
    if let Some(current) = store.get_bookmark(entity)? {
        if is_regression(mode, &current.replication_key_value, candidate) {
            tracing::warn!(
                entity = %entity,
                current = %current.replication_key_value,
                candidate = %candidate,
                "Ignoring bookmark regression"
            );
            return Ok(None);
        }
    }

    let bookmark = Bookmark::now(entity.clone(), candidate.clone());
    store.set_bookmark(&bookmark)?;
    tracing::info!(
        entity = %entity,
        replication_key_value = %candidate,
        "Bookmark advanced"
    );
    Ok(Some(bookmark))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wmsync_state::JsonFileBookmarkStore;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn full_first_run_is_unfiltered() {
        let config = ModeConfig::full_defaults();
        assert!(initial_filter(SyncMode::Full, &config, None, Utc::now()).is_none());
    }

    #[test]
    fn full_resume_filters_below_last_id() {
        let config = ModeConfig::full_defaults();
        let bookmark = Bookmark::now("orders".into(), CursorValue::Int(420));
        let filter = initial_filter(SyncMode::Full, &config, Some(&bookmark), Utc::now()).unwrap();
        assert_eq!(filter.field, "id");
        assert_eq!(filter.op, FilterOp::Lt);
        assert_eq!(filter.value, CursorValue::Int(420));
    }

    #[test]
    fn incremental_first_run_starts_overlap_before_now() {
        let config = ModeConfig::incremental_defaults();
        let now = at("2024-05-01T10:00:00Z");
        let filter = initial_filter(SyncMode::Incremental, &config, None, now).unwrap();
        assert_eq!(filter.op, FilterOp::Gte);
        assert_eq!(filter.value, CursorValue::Text("2024-05-01T09:55:00Z".into()));
    }

    #[test]
    fn incremental_resume_subtracts_overlap_from_bookmark() {
        let config = ModeConfig::incremental_defaults();
        let bookmark = Bookmark::now("orders".into(), CursorValue::Text("2024-04-30T23:02:30+00:00".into()));
        let filter =
            initial_filter(SyncMode::Incremental, &config, Some(&bookmark), Utc::now()).unwrap();
        assert_eq!(filter.value, CursorValue::Text("2024-04-30T22:57:30Z".into()));
    }

    #[test]
    fn incremental_non_timestamp_bookmark_used_verbatim() {
        let config = ModeConfig::incremental_defaults();
        let bookmark = Bookmark::now("orders".into(), CursorValue::Int(77));
        let filter =
            initial_filter(SyncMode::Incremental, &config, Some(&bookmark), Utc::now()).unwrap();
        assert_eq!(filter.value, CursorValue::Int(77));
    }

    #[test]
    fn regression_depends_on_direction() {
        let low = CursorValue::Int(10);
        let high = CursorValue::Int(20);
        assert!(is_regression(SyncMode::Full, &low, &high));
        assert!(!is_regression(SyncMode::Full, &high, &low));
        assert!(is_regression(SyncMode::Incremental, &high, &low));
        assert!(!is_regression(SyncMode::Incremental, &low, &low));
    }

    #[test]
    fn advance_skips_regressions() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileBookmarkStore::open(dir.path().join("bookmarks.json")).unwrap();
        let entity = EntityName::from("orders");

        let first = advance_bookmark(&store, &entity, SyncMode::Full, &CursorValue::Int(500)).unwrap();
        assert!(first.is_some());
        let stale = advance_bookmark(&store, &entity, SyncMode::Full, &CursorValue::Int(900)).unwrap();
        assert!(stale.is_none());
        advance_bookmark(&store, &entity, SyncMode::Full, &CursorValue::Int(250)).unwrap();

        let stored = store.get_bookmark(&entity).unwrap().unwrap();
        assert_eq!(stored.replication_key_value, CursorValue::Int(250));
    }
}
