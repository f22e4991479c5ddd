//! Human-readable byte and throughput formatting.

use serde::{Deserialize, Serialize};

const KIB: f64 = 1024.0;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SpeedUnit {
    Bytes,
    #[default]
    Kilobytes,
    Megabytes,
    /// Decimal megabits, as link speeds are usually quoted.
    Megabits,
}

/// Formats a bytes-per-second value in `unit` with two decimals.
pub fn format_speed(bytes_per_sec: f64, unit: SpeedUnit) -> String {
    match unit {
        SpeedUnit::Bytes => format!("{bytes_per_sec:.2} B/s"),
        SpeedUnit::Kilobytes => format!("{:.2} KB/s", bytes_per_sec / KIB),
        SpeedUnit::Megabytes => format!("{:.2} MB/s", bytes_per_sec / (KIB * KIB)),
        SpeedUnit::Megabits => format!("{:.2} Mbps", bytes_per_sec * 8.0 / 1_000_000.0),
    }
}

/// Formats a byte count using the largest binary unit that keeps the value
/// at or above 1.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= KIB && unit < UNITS.len() - 1 {
        value /= KIB;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_speed_units() {
        assert_eq!(format_speed(512.0, SpeedUnit::Bytes), "512.00 B/s");
        assert_eq!(format_speed(2048.0, SpeedUnit::Kilobytes), "2.00 KB/s");
        assert_eq!(format_speed(1_572_864.0, SpeedUnit::Megabytes), "1.50 MB/s");
        assert_eq!(format_speed(125_000.0, SpeedUnit::Megabits), "1.00 Mbps");
        assert_eq!(format_speed(0.0, SpeedUnit::Kilobytes), "0.00 KB/s");
    }

    #[test]
    fn test_format_bytes_picks_largest_unit() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024 + 512 * 1024), "5.50 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
        assert_eq!(format_bytes(2048 * 1024u64.pow(4)), "2048.00 TB");
    }

    #[test]
    fn test_speed_unit_names_in_config() {
        let unit: SpeedUnit = serde_json::from_str("\"megabytes\"").unwrap();
        assert_eq!(unit, SpeedUnit::Megabytes);
        assert_eq!(serde_json::to_string(&SpeedUnit::Bytes).unwrap(), "\"bytes\"");
    }
}
