//! Path layout of a tree-backed queue.
//!
//! ```text
//! {root}/{yyyy}/{MM}/{dd}/{HH}/{mm}/{entry}
//! ```
//!
//! Entry ids encode the path below the root so they resolve back to a node
//! without an index.

use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};

use crate::domain::EntryId;

pub const ENTRY_ID_PREFIX: &str = "distrq-";
pub const SEPARATOR_MARKER: &str = "--";

/// Depth of minute folders below the root.
pub const BUCKET_DEPTH: usize = 5;
/// Depth of entry nodes below the root.
pub const ENTRY_DEPTH: usize = BUCKET_DEPTH + 1;

pub fn minute_path(root: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}/{}",
        root.trim_end_matches('/'),
        at.format("%Y/%m/%d/%H/%M")
    )
}

pub fn truncate_to_minute(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(at)
}

pub fn entry_id(root: &str, path: &str) -> Option<EntryId> {
    let relative = path.strip_prefix(root.trim_end_matches('/'))?;
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        return None;
    }
    Some(EntryId::new(format!(
        "{ENTRY_ID_PREFIX}{}",
        relative.replace('/', SEPARATOR_MARKER)
    )))
}

/// Path of the entry node `id` names, `None` unless it decodes to exactly
/// [`ENTRY_DEPTH`] plain segments below `root`.
pub fn entry_path(root: &str, id: &EntryId) -> Option<String> {
    let encoded = id.as_str().strip_prefix(ENTRY_ID_PREFIX)?;
    let segments: Vec<&str> = encoded.split(SEPARATOR_MARKER).collect();
    if segments.len() != ENTRY_DEPTH
        || segments
            .iter()
            .any(|segment| matches!(*segment, "" | "." | "..") || segment.contains('/'))
    {
        return None;
    }
    Some(format!(
        "{}/{}",
        root.trim_end_matches('/'),
        segments.join("/")
    ))
}

/// Time-path segments of `path` below `root`, e.g. `[2024, 1, 31]`.
pub fn bucket_segments(root: &str, path: &str) -> Option<Vec<u32>> {
    let relative = path.strip_prefix(root.trim_end_matches('/'))?;
    relative
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.parse().ok())
        .collect()
}

/// First instant after the last minute a bucket folder can hold.
pub fn bucket_end(segments: &[u32]) -> Option<DateTime<Utc>> {
    let at = |y: u32, mo: u32, d: u32, h: u32, mi: u32| -> Option<DateTime<Utc>> {
        Utc.with_ymd_and_hms(i32::try_from(y).ok()?, mo, d, h, mi, 0)
            .single()
    };
    match *segments {
        [y] | [y, 12] => at(y.checked_add(1)?, 1, 1, 0, 0),
        [y, mo] => at(y, mo.checked_add(1)?, 1, 0, 0),
        [y, mo, d] => at(y, mo, d, 0, 0).map(|t| t + Duration::days(1)),
        [y, mo, d, h] => at(y, mo, d, h, 0).map(|t| t + Duration::hours(1)),
        [y, mo, d, h, mi] => at(y, mo, d, h, mi).map(|t| t + Duration::minutes(1)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const ROOT: &str = "/var/shuttle/publish/default";

    #[test]
    fn minute_path_is_zero_padded() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 7, 9, 41).unwrap();
        assert_eq!(minute_path(ROOT, at), format!("{ROOT}/2024/03/05/07/09"));
    }

    #[test]
    fn entry_ids_resolve_back_to_paths() {
        let path = format!("{ROOT}/2024/03/05/07/09/01HX");
        let id = entry_id(ROOT, &path).unwrap();
        assert_eq!(id.as_str(), "distrq-2024--03--05--07--09--01HX");
        assert_eq!(entry_path(ROOT, &id), Some(path));

        assert_eq!(entry_path(ROOT, &EntryId::from("pkg-1")), None);
        assert_eq!(entry_id(ROOT, "/elsewhere/x"), None);
    }

    #[rstest]
    #[case("distrq-")]
    #[case("distrq-2024")]
    #[case("distrq-2024--03--05--07--09")]
    #[case("distrq-2024--03--05--07--09--01HX--extra")]
    #[case("distrq-2024--03--05--07--..--01HX")]
    #[case("distrq-2024--03--05--07--09--.")]
    #[case("distrq-2024--03--05--07----01HX")]
    #[case("distrq-2024--03--05--07--09--a/b")]
    fn ids_not_naming_an_entry_have_no_path(#[case] id: &str) {
        assert_eq!(entry_path(ROOT, &EntryId::from(id)), None);
    }

    #[rstest]
    #[case(&[2024], (2025, 1, 1, 0, 0))]
    #[case(&[2024, 12], (2025, 1, 1, 0, 0))]
    #[case(&[2024, 2], (2024, 3, 1, 0, 0))]
    #[case(&[2024, 2, 29], (2024, 3, 1, 0, 0))]
    #[case(&[2024, 2, 29, 23], (2024, 3, 1, 0, 0))]
    #[case(&[2024, 2, 29, 23, 59], (2024, 3, 1, 0, 0))]
    #[case(&[2024, 2, 29, 10, 15], (2024, 2, 29, 10, 16))]
    fn bucket_end_is_exclusive_upper_bound(
        #[case] segments: &[u32],
        #[case] end: (i32, u32, u32, u32, u32),
    ) {
        let (y, mo, d, h, mi) = end;
        let expected = Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap();
        assert_eq!(bucket_end(segments), Some(expected));
    }

    #[test]
    fn malformed_buckets_have_no_end() {
        assert_eq!(bucket_end(&[]), None);
        assert_eq!(bucket_end(&[2024, 13]), None);
        assert_eq!(bucket_end(&[u32::MAX]), None);
        assert_eq!(bucket_end(&[u32::MAX, 12]), None);
        assert_eq!(bucket_end(&[2024, u32::MAX]), None);
        assert_eq!(bucket_segments(ROOT, &format!("{ROOT}/2024/xx")), None);
        assert_eq!(
            bucket_segments(ROOT, &format!("{ROOT}/2024/03")),
            Some(vec![2024, 3])
        );
    }
}
