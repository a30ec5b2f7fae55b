use crate::error::AppError;

const KIB: u64 = 1 << 10;
const MIB: u64 = 1 << 20;
pub const GIB: u64 = 1 << 30;
const TIB: u64 = 1 << 40;

/// Display units, largest first
const UNITS: [(u64, &str); 4] = [(TIB, "TB"), (GIB, "GB"), (MIB, "MB"), (KIB, "KB")];

/// Parse a size with an optional unit (B, KB, MB, GB, TB), binary multiples.
pub fn parse_size(size_str: &str) -> Result<u64, AppError> {
    let size_str = size_str.trim().to_lowercase();
    if size_str.is_empty() {
        return Err(AppError::ParseError("Invalid size: empty string".to_string()));
    }

    let split = size_str
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(size_str.len());
    let (numeric_part, unit_part) = size_str.split_at(split);

    if unit_part.is_empty() {
        return numeric_part
            .parse::<u64>()
            .map_err(|_| AppError::ParseError(format!("Invalid size: '{size_str}'")));
    }

    let value = numeric_part
        .parse::<f64>()
        .map_err(|_| AppError::ParseError(format!("Invalid size: '{size_str}'")))?;

    let multiplier = match unit_part.trim() {
        "b" => 1,
        "k" | "kb" | "kib" => KIB,
        "m" | "mb" | "mib" => MIB,
        "g" | "gb" | "gib" => GIB,
        "t" | "tb" | "tib" => TIB,
        unit => return Err(AppError::ParseError(format!("Invalid size unit: '{unit}'"))),
    };
    Ok((value * multiplier as f64) as u64)
}

/// Bytes in the largest binary unit that keeps the value at 1 or more
pub fn format_bytes(bytes: u64) -> String {
    match UNITS.iter().find(|(scale, _)| bytes >= *scale) {
        Some((scale, unit)) => format!("{:.2} {unit}", bytes as f64 / *scale as f64),
        None => format!("{bytes} B"),
    }
}
