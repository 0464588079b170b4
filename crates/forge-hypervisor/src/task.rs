//! Task handle parsing.
//!
//! A Proxmox task handle (UPID) has the shape
//! `UPID:<node>:<pid>:<pstart>:<starttime>:<type>:<id>:<user>:` with the
//! three numeric fields in hex. [`TaskHandle::parse`] accepts only that
//! grammar. [`TaskHandle::extract`] recovers a handle from free-form text by
//! locating the `UPID:` prefix and the trailing user marker.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use tracing::warn;

use crate::error::{TaskError, TaskResult};
use crate::gateway::TaskRef;

const PREFIX: &str = "UPID:";

static UPID_GRAMMAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^UPID:([A-Za-z0-9][A-Za-z0-9.\-]*):[0-9A-Fa-f]{8}:[0-9A-Fa-f]{8,9}:[0-9A-Fa-f]{8}:[^:\s]+:[^:\s]*:[^:\s]+:$",
    )
    .expect("UPID grammar is a valid regex")
});

/// A task handle together with the host it runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    raw: String,
    node: String,
    well_formed: bool,
}

impl TaskHandle {
    /// Strictly parse a complete handle.
    pub fn parse(s: &str) -> TaskResult<Self> {
        let caps = UPID_GRAMMAR
            .captures(s)
            .ok_or_else(|| TaskError::InvalidTask(format!("malformed task handle {s:?}")))?;
        Ok(Self {
            raw: s.to_string(),
            node: caps[1].to_string(),
            well_formed: true,
        })
    }

    /// Recover a handle embedded in free-form text.
    ///
    /// `user_marker` is the trailing `<user>:` field, e.g. `root@pam:`. The
    /// result is the exact substring from `UPID:` through the marker. A
    /// substring that fails the grammar is still returned, flagged as not
    /// well-formed.
    pub fn extract(text: &str, user_marker: &str) -> TaskResult<Self> {
        let start = text
            .find(PREFIX)
            .ok_or_else(|| TaskError::InvalidTask(format!("no task handle in {text:?}")))?;
        let rest = &text[start..];
        let end = rest
            .find(user_marker)
            .map(|i| i + user_marker.len())
            .ok_or_else(|| {
                TaskError::InvalidTask(format!("no {user_marker:?} marker after task prefix in {text:?}"))
            })?;
        let candidate = &rest[..end];

        if let Ok(handle) = Self::parse(candidate) {
            return Ok(handle);
        }

        let node = candidate
            .split(':')
            .nth(1)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| TaskError::InvalidTask(format!("no host in task handle {candidate:?}")))?;
        warn!(handle = %candidate, "task handle does not match the expected grammar, using it anyway");
        Ok(Self {
            raw: candidate.to_string(),
            node: node.to_string(),
            well_formed: false,
        })
    }

    /// Resolve whatever a mutating call returned into a handle to wait on.
    pub fn from_ref(task: &TaskRef, user_marker: &str) -> TaskResult<Self> {
        match task {
            TaskRef::Handle(s) => Self::parse(s).or_else(|_| {
                warn!(handle = %s, "unexpected task handle, attempting extraction");
                Self::extract(s, user_marker)
            }),
            TaskRef::Error { text } => {
                let handle = Self::extract(text, user_marker)?;
                warn!(handle = %handle, "task handle recovered from an error payload");
                Ok(handle)
            }
            TaskRef::Completed(value) => Err(TaskError::InvalidTask(format!(
                "cannot wait for a non-task value {value}"
            ))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Host the task runs on.
    pub fn node(&self) -> &str {
        &self.node
    }

    /// False when the handle was recovered best-effort.
    pub fn is_well_formed(&self) -> bool {
        self.well_formed
    }
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKER: &str = "root@pam:";
    const UPID: &str = "UPID:hostA:0003A1F2:01B2C3D4:64F0A1B2:qmclone:9010:root@pam:";

    #[test]
    fn parse_valid_handle() {
        let handle = TaskHandle::parse(UPID).unwrap();
        assert_eq!(handle.node(), "hostA");
        assert_eq!(handle.as_str(), UPID);
        assert!(handle.is_well_formed());
    }

    #[test]
    fn parse_handle_with_empty_id() {
        let upid = "UPID:tapir:00001234:00ABCDEF:5F3E8A1B:aptupdate::root@pam:";
        assert_eq!(TaskHandle::parse(upid).unwrap().node(), "tapir");
    }

    #[test]
    fn parse_rejects_truncated_handle() {
        assert!(matches!(
            TaskHandle::parse("UPID:hostA:0003A1F2"),
            Err(TaskError::InvalidTask(_))
        ));
    }

    #[test]
    fn parse_rejects_trailing_garbage() {
        let s = format!("{UPID}extra");
        assert!(TaskHandle::parse(&s).is_err());
    }

    #[test]
    fn extract_from_error_text() {
        let text = format!("clone failed: can't lock file - got timeout {UPID} (500)");
        let handle = TaskHandle::extract(&text, MARKER).unwrap();
        assert_eq!(handle.as_str(), UPID);
        assert!(handle.is_well_formed());
    }

    #[test]
    fn extract_malformed_is_best_effort() {
        let text = "error: UPID:hostA:zz:qmstart:root@pam: trailing";
        let handle = TaskHandle::extract(text, MARKER).unwrap();
        assert_eq!(handle.as_str(), "UPID:hostA:zz:qmstart:root@pam:");
        assert_eq!(handle.node(), "hostA");
        assert!(!handle.is_well_formed());
    }

    #[test]
    fn extract_without_prefix_is_invalid() {
        let err = TaskHandle::extract("VM 500 already exists", MARKER).unwrap_err();
        assert!(matches!(err, TaskError::InvalidTask(_)));
    }

    #[test]
    fn extract_without_marker_is_invalid() {
        let err = TaskHandle::extract("UPID:hostA:0003A1F2:01B2", MARKER).unwrap_err();
        assert!(matches!(err, TaskError::InvalidTask(_)));
    }

    #[test]
    fn extract_without_host_is_invalid() {
        let err = TaskHandle::extract("UPID::x:root@pam:", MARKER).unwrap_err();
        assert!(matches!(err, TaskError::InvalidTask(_)));
    }

    #[test]
    fn from_ref_handle() {
        let handle = TaskHandle::from_ref(&TaskRef::Handle(UPID.to_string()), MARKER).unwrap();
        assert_eq!(handle.node(), "hostA");
    }

    #[test]
    fn from_ref_padded_handle_is_extracted() {
        let padded = format!("  {UPID}\n");
        let handle = TaskHandle::from_ref(&TaskRef::Handle(padded), MARKER).unwrap();
        assert_eq!(handle.as_str(), UPID);
    }

    #[test]
    fn from_ref_error_payload() {
        let task = TaskRef::Error {
            text: format!("{{\"errors\":\"{UPID} failed\"}}"),
        };
        let handle = TaskHandle::from_ref(&task, MARKER).unwrap();
        assert_eq!(handle.as_str(), UPID);
    }

    #[test]
    fn from_ref_completed_is_invalid() {
        let task = TaskRef::Completed(serde_json::json!({"status": "ok"}));
        assert!(matches!(
            TaskHandle::from_ref(&task, MARKER),
            Err(TaskError::InvalidTask(_))
        ));
    }
}
