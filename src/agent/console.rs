//! Human-readable leak report printed to stdout each tick.

use std::io::Write;

use crate::report::Report;

const NAME_WIDTH: usize = 20;
const BANNER: &str = "=== RAM Leak Report ===";

/// Prints each tick's batch as a table, largest allocators first.
#[derive(Debug, Default)]
pub struct ConsoleReporter;

impl ConsoleReporter {
    pub fn new() -> Self {
        Self
    }

    pub fn emit(&self, batch: &[Report]) -> std::io::Result<()> {
        let text = render(batch);
        let mut out = std::io::stdout().lock();
        out.write_all(text.as_bytes())?;
        out.flush()
    }
}

/// Render a batch. A heartbeat-only batch renders as an empty report.
///
/// The sort is stable, so rows sharing a KB value keep the batch order,
/// which the sampler builds from raw byte counts.
pub fn render(batch: &[Report]) -> String {
    let mut entries: Vec<&Report> = batch.iter().filter(|r| !r.is_heartbeat()).collect();

    if entries.is_empty() {
        return format!("\n{BANNER} (empty)\n");
    }

    entries.sort_by(|a, b| b.alloc_kb.cmp(&a.alloc_kb));

    let mut out = format!("\n{BANNER}\n");
    for r in entries {
        out.push_str(&render_line(r));
        out.push('\n');
    }
    out
}

fn render_line(r: &Report) -> String {
    let ratio = if r.ratio < 0.0 {
        "N/A".to_string()
    } else {
        format!("{:.2}", r.ratio)
    };
    let status = if r.leak_suspect { " [LEAK SUSPECT]" } else { "" };

    format!(
        "PID: {:<6} ({:<width$}) - Alloc: {:>8} KB | Freed: {:>8} KB | Ratio: {:>6}{}",
        r.pid,
        truncate(&r.process, NAME_WIDTH),
        r.alloc_kb,
        r.free_kb,
        ratio,
        status,
        width = NAME_WIDTH,
    )
}

fn truncate(name: &str, max: usize) -> String {
    if name.chars().count() <= max {
        return name.to_string();
    }
    if max <= 3 {
        return name.chars().take(max).collect();
    }
    let mut short: String = name.chars().take(max - 3).collect();
    short.push_str("...");
    short
}
