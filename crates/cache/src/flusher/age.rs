use super::Flusher;
use crate::error::Result;
use stash_storage::FileEntry;
use std::time::Duration;
use time::OffsetDateTime;

/// How long an archive may go unmodified before [`AgeFlusher::default`]
/// evicts it.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Evicts files last modified longer ago than `max_age`.
///
/// Directories are never selected, however old: on filesystem-backed stores
/// they hold other entries, and deleting them is the backend's business.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AgeFlusher {
    max_age: Duration,
}

impl AgeFlusher {
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Select against a fixed clock instead of the current time.
    pub fn find_at(&self, entries: &[FileEntry], now: OffsetDateTime) -> Vec<FileEntry> {
        // A cutoff before the earliest representable time selects nothing.
        let Some(cutoff) = time::Duration::try_from(self.max_age).ok().and_then(|age| now.checked_sub(age)) else {
            return Vec::new();
        };
        entries.iter().filter(|entry| !entry.is_dir() && entry.modified < cutoff).cloned().collect()
    }
}

impl Default for AgeFlusher {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_AGE)
    }
}

impl Flusher for AgeFlusher {
    fn find(&self, entries: &[FileEntry]) -> Result<Vec<FileEntry>> {
        let found = self.find_at(entries, OffsetDateTime::now_utc());
        tracing::debug!(listed = entries.len(), found = found.len(), max_age = ?self.max_age, "Found stale entries");
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use time::Duration as TimeDuration;

    const DAY: u64 = 24 * 60 * 60;

    fn entries(now: OffsetDateTime) -> Vec<FileEntry> {
        vec![
            FileEntry::new("A", 1, now - TimeDuration::days(1)),
            FileEntry::new("B", 1, now - TimeDuration::days(10)),
            FileEntry::directory("C", now - TimeDuration::days(100)),
        ]
    }

    #[rstest]
    #[case(9, &["B"])]
    #[case(0, &["A", "B"])]
    #[case(20, &[])]
    #[case(1000, &[])]
    fn test_selects_old_files(#[case] max_age_days: u64, #[case] expected: &[&str]) {
        let now = OffsetDateTime::now_utc();
        let found = AgeFlusher::new(Duration::from_secs(max_age_days * DAY)).find_at(&entries(now), now);
        let paths: Vec<_> = found.iter().map(|entry| entry.path.to_str().unwrap()).collect();
        assert_eq!(paths, expected);
    }

    #[test]
    fn test_unrepresentable_age_selects_nothing() {
        let now = OffsetDateTime::now_utc();
        assert!(AgeFlusher::new(Duration::MAX).find_at(&entries(now), now).is_empty());
    }

    #[test]
    fn test_never_selects_directories() {
        let now = OffsetDateTime::now_utc();
        let found = AgeFlusher::new(Duration::ZERO).find_at(&entries(now), now + TimeDuration::days(365));
        assert!(found.iter().all(|entry| !entry.is_dir()));
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_entry_exactly_at_cutoff_is_kept() {
        let now = OffsetDateTime::now_utc();
        let entry = FileEntry::new("edge.tar", 1, now - TimeDuration::days(7));
        assert!(AgeFlusher::default().find_at(&[entry], now).is_empty());
    }

    #[test]
    fn test_default_is_seven_days() {
        assert_eq!(AgeFlusher::default().max_age(), Duration::from_secs(7 * DAY));
    }

    #[test]
    fn test_find_uses_current_time() {
        let now = OffsetDateTime::now_utc();
        let found = AgeFlusher::new(Duration::from_secs(9 * DAY)).find(&entries(now)).unwrap();
        assert_eq!(found, vec![entries(now)[1].clone()]);
    }
}
