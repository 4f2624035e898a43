//! Byte-count helpers shared across backends

use anyhow::Result;
use num_format::{Locale, ToFormattedString};

/// Convert bytes to human-readable format (e.g., "1.50 GiB")
pub fn bytes_to_pretty(bytes: &u64, add_bytes: bool) -> String {
    let mut steps = 0;
    let mut val: f64 = *bytes as f64;

    while val > 1024. && steps < 6 {
        val /= 1024.;
        steps += 1;
    }

    let unit = match steps {
        0 => "B",
        1 => "KiB",
        2 => "MiB",
        3 => "GiB",
        4 => "TiB",
        5 => "PiB",
        _ => "EiB",
    };

    if add_bytes {
        let bytes_str = bytes.to_formatted_string(&Locale::en);
        format!("{:.2} {} ({} bytes)", val, unit, bytes_str)
    } else {
        format!("{:.2} {}", val, unit)
    }
}

/// Parse a size string reported by a volume tool into bytes.
///
/// Accepts the spellings printed by `btrfs filesystem show` (`10.00GiB`),
/// `zfs list` (`1.5G`, `96K`, `0B`) and plain byte counts, with or without a
/// space between number and unit. All units are powers of 1024.
pub fn parse_size(pretty: &str) -> Result<u64> {
    let pretty = pretty.trim();
    if pretty.is_empty() {
        return Err(anyhow::anyhow!("Invalid input: empty size"));
    }

    let split_at = pretty
        .find(|character: char| !(character.is_ascii_digit() || character == '.'))
        .unwrap_or(pretty.len());
    let (number, unit) = pretty.split_at(split_at);

    if number.is_empty() {
        return Err(anyhow::anyhow!("Invalid input: {}", pretty));
    }
    let mut val: f64 = number.parse()?;

    let mut steps = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 0,
        "K" | "KB" | "KIB" => 1,
        "M" | "MB" | "MIB" => 2,
        "G" | "GB" | "GIB" => 3,
        "T" | "TB" | "TIB" => 4,
        "P" | "PB" | "PIB" => 5,
        "E" | "EB" | "EIB" => 6,
        _ => return Err(anyhow::anyhow!("Invalid unit: {}", unit.trim())),
    };

    while steps > 0 {
        val *= 1024.;
        steps -= 1;
    }

    Ok(val.round() as u64)
}
