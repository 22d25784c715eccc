use crate::search::Match;

/// Appended to content that was cut short.
const MARKER: &str = "...\n";

/// The head of a result list plus how much was left out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncated<'a> {
    /// At most `max_results` leading results.
    pub kept: &'a [Match],

    /// Number of results before truncation.
    pub total_count: usize,

    /// Number of results dropped.
    pub truncated_count: usize,
}

/// Keeps the first `max_results` results.
pub fn truncate_results(results: &[Match], max_results: usize) -> Truncated<'_> {
    let kept = &results[..results.len().min(max_results)];
    Truncated {
        kept,
        total_count: results.len(),
        truncated_count: results.len() - kept.len(),
    }
}

/// Shortens `content` to at most `max_lines` lines and `max_bytes` bytes.
///
/// When anything is cut, `"...\n"` is appended and counts against both
/// budgets. The first line is always kept, so a single oversized line comes
/// back whole, followed by the marker.
pub fn truncate_content(content: &str, max_lines: usize, max_bytes: usize) -> String {
    match kept_prefix(content, max_lines, max_bytes) {
        Some(kept) => format!("{}{MARKER}", &content[..kept]),
        None => content.to_string(),
    }
}

/// Length of the leading whole lines [`truncate_content`] keeps, or `None`
/// when `content` fits and is returned unchanged.
pub(crate) fn kept_prefix(content: &str, max_lines: usize, max_bytes: usize) -> Option<usize> {
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    if lines.len() <= max_lines && content.len() <= max_bytes {
        return None;
    }

    let mut kept = 0;
    for (count, line) in lines.iter().enumerate() {
        let fits = count + 1 < max_lines && kept + line.len() + MARKER.len() <= max_bytes;
        if count > 0 && !fits {
            break;
        }
        kept += line.len();
    }
    Some(kept)
}

/// `word` with an `s` unless `count` is exactly one.
pub fn pluralize(word: &str, count: usize) -> String {
    if count == 1 {
        word.to_string()
    } else {
        format!("{word}s")
    }
}
