use tracing::debug;

const BYTES_PER_SLOT: u64 = 2 * 1024 * 1024 * 1024;
const FALLBACK_PARALLEL: u32 = 4;
const MAX_PARALLEL: u32 = 16;

/// Available physical memory, best effort per platform. `None` when the
/// platform gave no usable answer.
pub fn available_memory_bytes() -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        parse_meminfo(&meminfo)
    }
    #[cfg(target_os = "macos")]
    {
        let output = std::process::Command::new("sysctl")
            .args(["-n", "hw.memsize"])
            .output()
            .ok()?;
        String::from_utf8(output.stdout)
            .ok()?
            .trim()
            .parse::<u64>()
            .ok()
    }
    #[cfg(target_os = "windows")]
    {
        let output = std::process::Command::new("wmic")
            .args(["OS", "get", "FreePhysicalMemory", "/value"])
            .output()
            .ok()?;
        let text = String::from_utf8(output.stdout).ok()?;
        let kib = text
            .lines()
            .find_map(|line| line.trim().strip_prefix("FreePhysicalMemory="))?
            .trim()
            .parse::<u64>()
            .ok()?;
        Some(kib * 1024)
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        None
    }
}

#[cfg(target_os = "linux")]
fn parse_meminfo(meminfo: &str) -> Option<u64> {
    let line = meminfo
        .lines()
        .find(|line| line.starts_with("MemAvailable:"))?;
    let kib = line.split_whitespace().nth(1)?.parse::<u64>().ok()?;
    Some(kib * 1024)
}

/// Map available memory to a per-model parallel limit: one slot per 2 GiB,
/// clamped to [1, 16]; 4 when memory could not be probed.
pub fn parallel_limit_for(available: Option<u64>) -> u32 {
    match available {
        Some(bytes) => ((bytes / BYTES_PER_SLOT) as u32).clamp(1, MAX_PARALLEL),
        None => FALLBACK_PARALLEL,
    }
}

/// Probe once at startup.
pub fn detect_parallel_limit() -> (Option<u64>, u32) {
    let available = available_memory_bytes();
    let limit = parallel_limit_for(available);
    debug!(?available, limit, "auto-sized per-model parallelism");
    (available, limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_clamps_both_ends() {
        assert_eq!(parallel_limit_for(Some(0)), 1);
        assert_eq!(parallel_limit_for(Some(BYTES_PER_SLOT)), 1);
        assert_eq!(parallel_limit_for(Some(8 * BYTES_PER_SLOT)), 8);
        assert_eq!(parallel_limit_for(Some(1024 * BYTES_PER_SLOT)), 16);
        assert_eq!(parallel_limit_for(None), 4);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn meminfo_parsing() {
        let sample = "MemTotal:       16315668 kB\nMemFree:         1000000 kB\nMemAvailable:    8157834 kB\n";
        assert_eq!(parse_meminfo(sample), Some(8157834 * 1024));
    }
}
