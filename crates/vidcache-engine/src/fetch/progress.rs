use std::sync::LazyLock;

use regex::Regex;

use crate::broadcast::ProgressUpdate;

// `[download]  42.3% of ~  12.34MiB at  1.23MiB/s ETA 00:10`
static PROGRESS_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[download\]\s+(\d{1,3}(?:\.\d+)?)%(?:.*?\bat\s+(\S+/s))?(?:.*?\bETA\s+(\S+))?")
        .unwrap()
});

/// Output lines that mean the tool is past the transfer and post-processing.
const POST_PROCESS_MARKERS: &[&str] = &["[Merger]", "[FixupM3u8]", "[MoveFiles]", "[VideoConvertor]"];

/// What a single line of fetch tool output tells us
#[derive(Debug, Clone, PartialEq)]
pub enum ToolLine {
    Progress(ProgressUpdate),
    PostProcessing,
    Other,
}

pub fn parse_line(line: &str) -> ToolLine {
    let line = line.trim();
    if let Some(caps) = PROGRESS_REGEX.captures(line)
        && let Some(percent) = caps.get(1).and_then(|m| m.as_str().parse::<f32>().ok())
    {
        let known = |i: usize| {
            caps.get(i)
                .map(|m| m.as_str())
                .filter(|v| !v.starts_with("Unknown"))
                .map(str::to_owned)
        };
        return ToolLine::Progress(ProgressUpdate {
            percent: percent.min(100.0),
            speed: known(2),
            eta: known(3),
        });
    }
    if POST_PROCESS_MARKERS.iter().any(|m| line.starts_with(m)) {
        return ToolLine::PostProcessing;
    }
    ToolLine::Other
}
