//! Kernel accumulator backed by an eBPF hash map.
//!
//! Loads the instrumentation object from disk, attaches the page allocation
//! and page free tracepoints, and drains the `(pid, comm) -> counters` map.
//! All code is gated behind `#[cfg(feature = "bpf")]`.

use anyhow::{Context, Result};
use aya::maps::hash_map::HashMap as BpfHashMap;
use aya::maps::MapData;
use aya::programs::TracePoint;
use aya::{Ebpf, EbpfLoader};

use super::{Accumulator, Snapshot, SnapshotError};
use crate::config::BpfConfig;
use crate::report::{MemCounters, MemKey, TASK_COMM_LEN};

const TRACEPOINT_GROUP: &str = "kmem";
const ALLOC_TRACEPOINT: &str = "mm_page_alloc";
const FREE_TRACEPOINT: &str = "mm_page_free";

/// BPF map key (matches `struct mem_key` in the instrumentation object).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct RawMemKey {
    pid: u32,
    comm: [u8; TASK_COMM_LEN],
}

// SAFETY: RawMemKey is a plain C struct of integers with no padding.
unsafe impl aya::Pod for RawMemKey {}

/// BPF map value (matches `struct mem_counters` in the instrumentation object).
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
struct RawMemCounters {
    allocated_bytes: u64,
    freed_bytes: u64,
}

// SAFETY: RawMemCounters is a plain C struct of integers with no padding.
unsafe impl aya::Pod for RawMemCounters {}

/// BPF program attachment statistics for Prometheus metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttachmentStats {
    pub alloc_attached: bool,
    pub free_attached: bool,
    pub tracepoints_attached: u32,
    pub tracepoints_failed: u32,
}

/// Accumulator reading the kernel-maintained allocation map.
pub struct BpfAccumulator {
    // Must precede `_ebpf`: the map handle is released before the programs
    // are detached.
    map: BpfHashMap<MapData, RawMemKey, RawMemCounters>,
    /// Owns the loaded programs; dropping it detaches them.
    _ebpf: Ebpf,
    attach_stats: AttachmentStats,
}

impl BpfAccumulator {
    /// Load the object, attach the tracepoints and take the accumulator map.
    pub fn load(cfg: &BpfConfig) -> Result<Self> {
        bump_memlock_rlimit();

        let mut ebpf = EbpfLoader::new()
            .load_file(&cfg.object_path)
            .with_context(|| format!("loading BPF object {}", cfg.object_path.display()))?;

        let mut stats = AttachmentStats::default();

        attach_tracepoint_required(
            &mut ebpf,
            &cfg.alloc_program,
            TRACEPOINT_GROUP,
            ALLOC_TRACEPOINT,
            &mut stats,
        )?;
        stats.alloc_attached = true;

        stats.free_attached = attach_tracepoint_optional(
            &mut ebpf,
            &cfg.free_program,
            TRACEPOINT_GROUP,
            FREE_TRACEPOINT,
            &mut stats,
        );
        if !stats.free_attached {
            tracing::warn!("free tracepoint unavailable, reporting allocations only");
        }

        log_attachment_stats(&stats);

        let raw_map = ebpf
            .take_map(&cfg.map_name)
            .ok_or_else(|| anyhow::anyhow!("map '{}' not found", cfg.map_name))?;
        let map = BpfHashMap::try_from(raw_map)
            .with_context(|| format!("opening '{}' as a hash map", cfg.map_name))?;

        tracing::info!(
            object = %cfg.object_path.display(),
            map = %cfg.map_name,
            "BPF accumulator loaded"
        );

        Ok(Self {
            map,
            _ebpf: ebpf,
            attach_stats: stats,
        })
    }

    /// Return a copy of the attachment statistics.
    pub fn attachment_stats(&self) -> AttachmentStats {
        self.attach_stats
    }
}

impl Accumulator for BpfAccumulator {
    fn snapshot(&mut self) -> Result<Snapshot, SnapshotError> {
        // Phase 1: copy every entry.
        let mut raw_keys = Vec::new();
        let mut entries = Vec::new();
        for item in self.map.iter() {
            let (key, value) = item.map_err(|e| SnapshotError::Iterate(e.to_string()))?;
            entries.push((
                MemKey::from_raw(key.pid, &key.comm),
                MemCounters::new(value.allocated_bytes, value.freed_bytes),
            ));
            raw_keys.push(key);
        }

        // Phase 2: delete what was observed.
        let mut delete_failures = 0;
        for key in &raw_keys {
            if let Err(e) = self.map.remove(key) {
                delete_failures += 1;
                tracing::warn!(pid = key.pid, error = %e, "map delete failed for PID");
            }
        }

        Ok(Snapshot {
            entries,
            delete_failures,
        })
    }
}

/// Lift RLIMIT_MEMLOCK for kernels that still charge BPF maps against it.
fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    // SAFETY: setrlimit only reads the provided struct.
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        tracing::debug!(ret, "removing memlock limit failed");
    }
}

fn attach_tracepoint_required(
    ebpf: &mut Ebpf,
    prog_name: &str,
    group: &str,
    name: &str,
    stats: &mut AttachmentStats,
) -> Result<()> {
    let prog: &mut TracePoint = ebpf
        .program_mut(prog_name)
        .ok_or_else(|| anyhow::anyhow!("tracepoint program '{prog_name}' not found"))?
        .try_into()
        .with_context(|| format!("'{prog_name}' is not a tracepoint program"))?;
    prog.load()
        .with_context(|| format!("loading tracepoint {group}/{name}"))?;
    prog.attach(group, name)
        .with_context(|| format!("attaching tracepoint {group}/{name}"))?;

    stats.tracepoints_attached += 1;
    tracing::debug!(group, name, "attached tracepoint");

    Ok(())
}

fn attach_tracepoint_optional(
    ebpf: &mut Ebpf,
    prog_name: &str,
    group: &str,
    name: &str,
    stats: &mut AttachmentStats,
) -> bool {
    let result: Result<()> = (|| {
        let prog: &mut TracePoint = ebpf
            .program_mut(prog_name)
            .ok_or_else(|| anyhow::anyhow!("program '{prog_name}' not found"))?
            .try_into()?;
        prog.load()?;
        prog.attach(group, name)?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            stats.tracepoints_attached += 1;
            tracing::debug!(group, name, "attached optional tracepoint");
            true
        }
        Err(e) => {
            stats.tracepoints_failed += 1;
            tracing::warn!(
                group,
                name,
                error = %e,
                "optional tracepoint attach failed"
            );
            false
        }
    }
}

fn log_attachment_stats(stats: &AttachmentStats) {
    tracing::info!(
        alloc_attached = stats.alloc_attached,
        free_attached = stats.free_attached,
        tracepoints_attached = stats.tracepoints_attached,
        tracepoints_failed = stats.tracepoints_failed,
        "BPF program attachment summary"
    );
}
