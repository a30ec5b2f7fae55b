use std::time::Duration;

use crate::error::AppError;

/// Parse a duration with an optional unit (s, m, h). Bare numbers are seconds.
pub fn parse_time(time_str: &str) -> Result<Duration, AppError> {
    let time_str = time_str.trim();
    if time_str.is_empty() {
        return Err(AppError::ParseError("Invalid duration: empty string".to_string()));
    }

    let split = time_str
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(time_str.len());
    let (numeric_part, unit_part) = time_str.split_at(split);

    let value = numeric_part
        .parse::<f64>()
        .map_err(|_| AppError::ParseError(format!("Invalid duration: '{time_str}'")))?;

    let seconds = match unit_part.trim().to_lowercase().as_str() {
        "" | "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        unit => {
            return Err(AppError::ParseError(format!(
                "Invalid duration unit: '{unit}'"
            )));
        }
    };
    Duration::try_from_secs_f64(seconds)
        .map_err(|_| AppError::ParseError(format!("Duration out of range: '{time_str}'")))
}
