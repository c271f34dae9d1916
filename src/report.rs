//! Per-process memory accounting types and the on-wire report record.

use serde::{Deserialize, Serialize};

/// Width of the kernel task command buffer, including the trailing NUL.
pub const TASK_COMM_LEN: usize = 16;

/// Identity of one accumulator entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemKey {
    pub pid: u32,
    pub command_name: String,
}

impl MemKey {
    pub fn new(pid: u32, command_name: impl Into<String>) -> Self {
        Self {
            pid,
            command_name: command_name.into(),
        }
    }

    /// Build a key from the raw kernel representation.
    pub fn from_raw(pid: u32, comm: &[u8; TASK_COMM_LEN]) -> Self {
        Self {
            pid,
            command_name: trim_comm(comm),
        }
    }
}

/// Byte counters accumulated for one key since its last drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemCounters {
    pub allocated_bytes: u64,
    pub freed_bytes: u64,
}

impl MemCounters {
    pub fn new(allocated_bytes: u64, freed_bytes: u64) -> Self {
        Self {
            allocated_bytes,
            freed_bytes,
        }
    }
}

/// Decode a kernel command buffer: cut at the first NUL, strip trailing
/// NUL/newline octets and keep at most `TASK_COMM_LEN - 1` bytes.
pub fn trim_comm(raw: &[u8]) -> String {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    let mut name = &raw[..end.min(TASK_COMM_LEN - 1)];
    while let Some((last, rest)) = name.split_last() {
        if *last == b'\n' || *last == 0 {
            name = rest;
        } else {
            break;
        }
    }
    String::from_utf8_lossy(name).into_owned()
}

/// One classified observation, exchanged between agent and collector.
///
/// Field names are fixed by the wire format. Missing fields decode to zero
/// values, and every field is always emitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Report {
    pub system_id: String,
    pub pid: u32,
    pub process: String,
    #[serde(rename = "AllocKB")]
    pub alloc_kb: i64,
    #[serde(rename = "FreeKB")]
    pub free_kb: i64,
    pub ratio: f64,
    pub leak_suspect: bool,
    pub time_stamp: i64,
}

impl Report {
    /// A liveness record: only `SystemId` and `TimeStamp` are populated.
    pub fn heartbeat(system_id: impl Into<String>, now: i64) -> Self {
        Self {
            system_id: system_id.into(),
            time_stamp: now,
            ..Default::default()
        }
    }

    /// Whether every field other than `SystemId` and `TimeStamp` is zero.
    pub fn is_heartbeat(&self) -> bool {
        self.pid == 0
            && self.process.is_empty()
            && self.alloc_kb == 0
            && self.free_kb == 0
            && self.ratio == 0.0
            && !self.leak_suspect
    }
}

/// Current wall-clock time in Unix seconds.
pub fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comm(bytes: &[u8]) -> [u8; TASK_COMM_LEN] {
        let mut raw = [0u8; TASK_COMM_LEN];
        raw[..bytes.len()].copy_from_slice(bytes);
        raw
    }

    #[test]
    fn test_trim_comm_strips_nul_padding() {
        let key = MemKey::from_raw(42, &comm(b"nginx"));
        assert_eq!(key.command_name, "nginx");
        assert_eq!(key.pid, 42);
    }

    #[test]
    fn test_trim_comm_strips_trailing_newline() {
        assert_eq!(trim_comm(&comm(b"worker\n")), "worker");
        assert_eq!(trim_comm(b"worker\n\0\n"), "worker");
    }

    #[test]
    fn test_trim_comm_caps_at_fifteen_bytes() {
        let raw = [b'a'; TASK_COMM_LEN];
        assert_eq!(trim_comm(&raw).len(), TASK_COMM_LEN - 1);
    }

    #[test]
    fn test_trim_comm_empty() {
        assert_eq!(trim_comm(&[0u8; TASK_COMM_LEN]), "");
    }

    #[test]
    fn test_report_wire_field_names() {
        let report = Report {
            system_id: "host-a".to_string(),
            pid: 7,
            process: "cat".to_string(),
            alloc_kb: 2,
            free_kb: 1,
            ratio: 2.0,
            leak_suspect: false,
            time_stamp: 1_700_000_000,
        };

        let value = serde_json::to_value(&report).expect("serialize");
        let obj = value.as_object().expect("object");
        let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec![
                "AllocKB",
                "FreeKB",
                "LeakSuspect",
                "Pid",
                "Process",
                "Ratio",
                "SystemId",
                "TimeStamp"
            ]
        );
        assert_eq!(obj["AllocKB"], 2);
        assert_eq!(obj["TimeStamp"], 1_700_000_000i64);
    }

    #[test]
    fn test_heartbeat_emits_all_fields_zeroed() {
        let hb = Report::heartbeat("host-a", 1_700_000_000);
        assert!(hb.is_heartbeat());

        let json = serde_json::to_string(&hb).expect("serialize");
        assert!(json.contains("\"Pid\":0"));
        assert!(json.contains("\"Process\":\"\""));
        assert!(json.contains("\"LeakSuspect\":false"));
        assert!(json.contains("\"SystemId\":\"host-a\""));
    }

    #[test]
    fn test_missing_fields_decode_to_zero() {
        let report: Report =
            serde_json::from_str(r#"{"SystemId":"h","Pid":9}"#).expect("deserialize");
        assert_eq!(report.system_id, "h");
        assert_eq!(report.pid, 9);
        assert_eq!(report.time_stamp, 0);
        assert_eq!(report.ratio, 0.0);
        assert!(!report.leak_suspect);
    }

    #[test]
    fn test_now_unix_is_positive() {
        assert!(now_unix() > 1_600_000_000);
    }
}
