//! Hierarchical document addressing: `collection/doc/collection/doc/...`.

use std::fmt;

use thiserror::Error;

use crate::report::Report;

/// Longest id segment accepted by the document store.
pub const MAX_SEGMENT_BYTES: usize = 1500;

const SYSTEMS: &str = "systems";
const REPORTS: &str = "reports";
const LATEST: &str = "latest";
const SNAPSHOT: &str = "snapshot";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("empty path segment")]
    Empty,

    #[error("path segment {0:?} contains '/'")]
    Slash(String),

    #[error("path segment {0:?} is reserved")]
    Reserved(String),

    #[error("path segment exceeds {MAX_SEGMENT_BYTES} bytes")]
    TooLong,
}

fn check_segment(id: &str) -> Result<(), PathError> {
    if id.is_empty() {
        return Err(PathError::Empty);
    }
    if id.contains('/') {
        return Err(PathError::Slash(id.to_string()));
    }
    if id == "." || id == ".." || (id.len() > 4 && id.starts_with("__") && id.ends_with("__")) {
        return Err(PathError::Reserved(id.to_string()));
    }
    if id.len() > MAX_SEGMENT_BYTES {
        return Err(PathError::TooLong);
    }
    Ok(())
}

/// A collection path (odd number of segments).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionPath(String);

/// A document path (even number of segments).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentPath(String);

impl CollectionPath {
    /// A top-level collection.
    pub fn root(name: &str) -> Result<Self, PathError> {
        check_segment(name)?;
        Ok(Self(name.to_string()))
    }

    pub fn doc(&self, id: &str) -> Result<DocumentPath, PathError> {
        check_segment(id)?;
        Ok(DocumentPath(format!("{}/{}", self.0, id)))
    }
}

impl DocumentPath {
    pub fn collection(&self, name: &str) -> Result<CollectionPath, PathError> {
        check_segment(name)?;
        Ok(CollectionPath(format!("{}/{}", self.0, name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Last segment of the path.
    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic record id: `{TimeStamp}-{SystemId}-{Pid}`.
pub fn report_doc_id(report: &Report) -> String {
    format!(
        "{}-{}-{}",
        report.time_stamp, report.system_id, report.pid
    )
}

/// `systems/{SystemId}/reports/{TimeStamp}-{SystemId}-{Pid}`
pub fn report_path(report: &Report) -> Result<DocumentPath, PathError> {
    CollectionPath::root(SYSTEMS)?
        .doc(&report.system_id)?
        .collection(REPORTS)?
        .doc(&report_doc_id(report))
}

/// `systems/{SystemId}/latest/snapshot`
pub fn latest_snapshot_path(system_id: &str) -> Result<DocumentPath, PathError> {
    CollectionPath::root(SYSTEMS)?
        .doc(system_id)?
        .collection(LATEST)?
        .doc(SNAPSHOT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_path_layout() {
        let report = Report {
            system_id: "host-a".to_string(),
            pid: 4242,
            time_stamp: 1_700_000_000,
            ..Default::default()
        };
        let path = report_path(&report).expect("path");
        assert_eq!(
            path.as_str(),
            "systems/host-a/reports/1700000000-host-a-4242"
        );
        assert_eq!(path.id(), "1700000000-host-a-4242");
    }

    #[test]
    fn test_heartbeat_report_path_uses_pid_zero() {
        let path = report_path(&Report::heartbeat("host-a", 5)).expect("path");
        assert_eq!(path.as_str(), "systems/host-a/reports/5-host-a-0");
    }

    #[test]
    fn test_latest_snapshot_path_layout() {
        let path = latest_snapshot_path("host-a").expect("path");
        assert_eq!(path.as_str(), "systems/host-a/latest/snapshot");
    }

    #[test]
    fn test_invalid_segments() {
        assert_eq!(latest_snapshot_path(""), Err(PathError::Empty));
        assert!(matches!(
            latest_snapshot_path("a/b"),
            Err(PathError::Slash(_))
        ));
        assert!(matches!(
            latest_snapshot_path(".."),
            Err(PathError::Reserved(_))
        ));
        assert!(matches!(
            latest_snapshot_path("__name__"),
            Err(PathError::Reserved(_))
        ));
        assert_eq!(
            latest_snapshot_path(&"x".repeat(MAX_SEGMENT_BYTES + 1)),
            Err(PathError::TooLong)
        );
    }
}
