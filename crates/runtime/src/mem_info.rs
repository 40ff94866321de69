//! Best-effort physical memory detection.
//!
//! Used to warn when a configured memory limit exceeds what the machine can
//! actually provide, and to cap per-child reservations when summing pool
//! reservations. Detection failures degrade to "unknown" (`i64::MAX`), which
//! disables the clamp warnings rather than failing startup.

use std::sync::OnceLock;

/// Total physical memory in bytes, or `i64::MAX` when it cannot be detected.
pub fn physical_mem() -> i64 {
    static PHYSICAL: OnceLock<i64> = OnceLock::new();
    *PHYSICAL.get_or_init(read_physical_mem)
}

fn read_physical_mem() -> i64 {
    match std::fs::read_to_string("/proc/meminfo") {
        Ok(contents) => parse_mem_total(&contents).unwrap_or(i64::MAX),
        Err(_) => i64::MAX,
    }
}

fn parse_mem_total(contents: &str) -> Option<i64> {
    let rest = contents
        .lines()
        .find_map(|line| line.strip_prefix("MemTotal:"))?;
    let kb: i64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
    Some(kb.saturating_mul(1024))
}
