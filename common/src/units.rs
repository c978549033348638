use std::time::Duration;

pub const BYTES_PER_GIB: u64 = 1024 * 1024 * 1024;
pub const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Mbps (10^6 bits per second) to bytes per second, truncating.
pub fn mbps_to_bytes_per_sec(mbps: f64) -> u64 {
    if mbps <= 0.0 {
        return 0;
    }
    (mbps * 1_000_000.0 / 8.0) as u64
}

pub fn bytes_per_sec_to_mbps(bytes_per_sec: u64) -> f64 {
    bytes_per_sec as f64 * 8.0 / 1_000_000.0
}

pub fn gib_to_bytes(gib: f64) -> u64 {
    if gib <= 0.0 {
        return 0;
    }
    (gib * BYTES_PER_GIB as f64) as u64
}

pub fn days(days: u32) -> Duration {
    Duration::from_secs(u64::from(days) * SECS_PER_DAY)
}

/// Human readable byte count using binary prefixes, e.g. `1.5 KB` for 1536.
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0usize;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let prefix = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {}B", bytes as f64 / div as f64, prefix)
}

/// `1h2m3s`, `2m3s` or `3s`; sub-second precision is dropped.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;

    if h > 0 {
        format!("{}h{}m{}s", h, m, s)
    } else if m > 0 {
        format!("{}m{}s", m, s)
    } else {
        format!("{}s", s)
    }
}

pub fn format_bandwidth(bytes_per_sec: u64) -> String {
    if bytes_per_sec == 0 {
        "unlimited".to_string()
    } else {
        format!("{:.0} Mbps", bytes_per_sec_to_mbps(bytes_per_sec))
    }
}
