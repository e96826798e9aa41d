//! Domain-aware, deterministic segmentation of crash-log content (§4.4).
//!
//! Grounded on `original_source/src/analyzers/anr/base.py::chunk_content` for the ANR
//! thread-packing algorithm; tombstone section splitting and the line-oriented fallback
//! are new (the original's tombstone analyzer was not part of the retrieval pack) but
//! follow the same pack-until-budget shape.

use regex::Regex;
use std::sync::LazyLock;

use crate::model::{Chunk, LogKind, Mode, StructuralSummary};

/// Floor below which `max_chars` is never reduced (§4.4).
const MIN_CHUNK_CHARS: usize = 10_000;

static THREAD_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?m)^"[^"]*" prio=\d+ tid=\d+"#).unwrap());

static THREAD_NAME_TID_STATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""([^"]*)".*?tid=(\d+)\s+(\w+)"#).unwrap());

const TOMBSTONE_MARKERS: &[&str] = &[
    "*** *** ***",
    "backtrace:",
    "stack:",
    "memory near",
    "code around",
    "registers:",
    "memory map:",
];

/// `max_chars = context_window * 0.8 * mode_ratio * chars_per_token`, floored at
/// `MIN_CHUNK_CHARS` (§4.4).
pub fn max_chars(context_window: u64, mode: Mode, chars_per_token: f64) -> usize {
    let computed = context_window as f64 * 0.8 * mode.context_ratio() * chars_per_token;
    (computed as usize).max(MIN_CHUNK_CHARS)
}

/// Splits `content` into `Chunk`s for `(kind, mode)` under the given character budget.
/// Deterministic: the same inputs always produce byte-identical output (§4.4, §8).
pub fn chunk_content(content: &str, kind: LogKind, mode: Mode, max_chars: usize) -> Vec<Chunk> {
    let texts = match kind {
        LogKind::Anr => {
            let preprocessed = preprocess_anr(content);
            chunk_anr(&preprocessed, mode, max_chars)
        }
        LogKind::Tombstone => chunk_tombstone(content, mode, max_chars),
    };
    let texts = if texts.is_empty() {
        chunk_generic(content, max_chars)
    } else {
        texts
    };
    let total = texts.len();
    texts
        .into_iter()
        .enumerate()
        .map(|(index, text)| Chunk {
            index,
            total,
            est_input_tokens: estimate_chars_as_tokens(&text),
            text,
        })
        .collect()
}

fn estimate_chars_as_tokens(text: &str) -> u64 {
    (text.chars().count() as f64 / 3.5).round() as u64
}

/// Strips `  | sysTid=` continuation lines, mirroring the original's `preprocess_content`.
pub fn preprocess_anr(content: &str) -> String {
    content
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with("  | sysTid="))
        .collect::<Vec<_>>()
        .join("\n")
}

fn chunk_anr(content: &str, mode: Mode, max_chunk_size: usize) -> Vec<String> {
    let blocks: Vec<&str> = split_on_thread_headers(content);
    if blocks.len() <= 1 {
        return Vec::new();
    }
    let header = blocks[0];
    let thread_blocks = &blocks[1..];

    let avg_thread_size = thread_blocks.iter().map(|b| b.len()).sum::<usize>() as f64
        / thread_blocks.len().max(1) as f64;
    let computed_threads_per_chunk = ((max_chunk_size as f64 / avg_thread_size.max(1.0)) as usize).max(1);
    let threads_per_chunk = match mode.thread_cap() {
        Some(cap) => computed_threads_per_chunk.min(cap),
        None => computed_threads_per_chunk,
    };

    let mut chunks = Vec::new();
    let mut current: Vec<&str> = vec![header];
    let mut current_size = header.len();
    let mut thread_count = 0usize;

    for block in thread_blocks {
        let block_size = block.len();
        if current_size + block_size > max_chunk_size && current.len() > 1 {
            chunks.push(current.join("\n"));
            current = vec![header];
            current_size = header.len();
            thread_count = 0;
        }
        current.push(block);
        current_size += block_size;
        thread_count += 1;
        if thread_count >= threads_per_chunk {
            chunks.push(current.join("\n"));
            current = vec![header];
            current_size = header.len();
            thread_count = 0;
        }
    }
    if current.len() > 1 {
        chunks.push(current.join("\n"));
    }
    chunks
}

fn split_on_thread_headers(content: &str) -> Vec<&str> {
    let matches: Vec<usize> = THREAD_HEADER.find_iter(content).map(|m| m.start()).collect();
    if matches.is_empty() {
        return vec![content];
    }
    let mut blocks = Vec::with_capacity(matches.len() + 1);
    blocks.push(&content[..matches[0]]);
    for window in matches.windows(2) {
        blocks.push(&content[window[0]..window[1]]);
    }
    blocks.push(&content[*matches.last().unwrap()..]);
    blocks
}

fn chunk_tombstone(content: &str, mode: Mode, max_chars: usize) -> Vec<String> {
    let sections = split_on_markers(content);
    if sections.len() <= 1 {
        return Vec::new();
    }
    match mode {
        Mode::Quick => sections.into_iter().take(3).collect(),
        Mode::MaxToken => sections,
        _ => pack_sections(&sections, max_chars),
    }
}

fn split_on_markers(content: &str) -> Vec<String> {
    let mut boundaries = Vec::new();
    for marker in TOMBSTONE_MARKERS {
        let mut search_from = 0;
        while let Some(offset) = content[search_from..].find(marker) {
            let line_start = content[..search_from + offset]
                .rfind('\n')
                .map(|p| p + 1)
                .unwrap_or(0);
            boundaries.push(line_start);
            search_from += offset + marker.len();
        }
    }
    boundaries.sort_unstable();
    boundaries.dedup();
    if boundaries.is_empty() {
        return Vec::new();
    }
    let mut sections = Vec::new();
    let mut starts = boundaries.clone();
    if starts[0] != 0 {
        starts.insert(0, 0);
    }
    for window in starts.windows(2) {
        sections.push(content[window[0]..window[1]].to_string());
    }
    sections.push(content[*starts.last().unwrap()..].to_string());
    sections.retain(|s| !s.trim().is_empty());
    sections
}

fn pack_sections(sections: &[String], max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for section in sections {
        if !current.is_empty() && current.len() + section.len() > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(section);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Line-oriented packing that never splits a line (§4.4, used for any kind without
/// recognizable structure).
fn chunk_generic(content: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in content.lines() {
        if !current.is_empty() && current.len() + line.len() + 1 > max_chars {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() || chunks.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Coarse structural metadata used only for status messages (SPEC_FULL §11), never for
/// chunk boundaries.
pub fn summarize(content: &str, kind: LogKind) -> StructuralSummary {
    match kind {
        LogKind::Anr => {
            let blocks = split_on_thread_headers(content);
            let total_threads = blocks.len().saturating_sub(1);
            let main_thread_state = blocks
                .iter()
                .skip(1)
                .find(|b| b.contains("\"main\""))
                .and_then(|b| THREAD_NAME_TID_STATE.captures(b))
                .map(|c| c[3].to_string());
            StructuralSummary {
                total_threads: Some(total_threads),
                total_sections: None,
                main_thread_state,
                crash_signal: None,
            }
        }
        LogKind::Tombstone => {
            let sections = split_on_markers(content);
            let crash_signal = content
                .lines()
                .find(|l| l.contains("signal "))
                .map(|l| l.trim().to_string());
            StructuralSummary {
                total_threads: None,
                total_sections: Some(sections.len()),
                main_thread_state: None,
                crash_signal,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ANR_SAMPLE: &str = concat!(
        "----- pid 100 at 2024-01-01 -----\n",
        "Cmd line: com.example.app\n",
        "\"main\" prio=5 tid=1 Blocked\n",
        "  | sysTid=100\n",
        "  at com.example.App.onCreate(App.java:10)\n",
        "\"Binder:100_1\" prio=5 tid=2 Native\n",
        "  at android.os.BinderProxy.transactNative(Native method)\n",
    );

    #[test]
    fn anr_chunking_is_deterministic() {
        let first = chunk_content(ANR_SAMPLE, LogKind::Anr, Mode::Intelligent, 100_000);
        let second = chunk_content(ANR_SAMPLE, LogKind::Anr, Mode::Intelligent, 100_000);
        let first_texts: Vec<&str> = first.iter().map(|c| c.text.as_str()).collect();
        let second_texts: Vec<&str> = second.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(first_texts, second_texts);
    }

    #[test]
    fn anr_chunk_includes_header_in_every_chunk() {
        let chunks = chunk_content(ANR_SAMPLE, LogKind::Anr, Mode::Quick, 120);
        for chunk in &chunks {
            assert!(chunk.text.contains("----- pid 100"));
        }
    }

    #[test]
    fn generic_fallback_never_splits_a_line() {
        let content = "line one\nline two\nline three";
        let chunks = chunk_generic(content, 12);
        for chunk in &chunks {
            for line in chunk.lines() {
                assert!(content.contains(line));
            }
        }
    }

    #[test]
    fn tombstone_quick_mode_keeps_top_three_sections() {
        let content = "intro\nbacktrace:\n  #00 pc 1\nstack:\n  data\nregisters:\n  r0 0\nmemory map:\n  region";
        let chunks = chunk_content(content, LogKind::Tombstone, Mode::Quick, 10_000);
        assert!(chunks.len() <= 3);
    }

    #[test]
    fn max_chars_never_below_floor() {
        assert_eq!(max_chars(1000, Mode::MaxToken, 2.5), MIN_CHUNK_CHARS);
    }

    #[test]
    fn summarize_counts_anr_threads() {
        let summary = summarize(ANR_SAMPLE, LogKind::Anr);
        assert_eq!(summary.total_threads, Some(2));
        assert_eq!(summary.main_thread_state.as_deref(), Some("Blocked"));
    }

    #[test]
    fn preprocess_anr_strips_systid_and_blank_lines() {
        let cleaned = preprocess_anr(ANR_SAMPLE);
        assert!(!cleaned.contains("sysTid="));
        assert!(cleaned.lines().all(|l| !l.trim().is_empty()));
    }

    #[test]
    fn anr_chunks_never_contain_systid_lines() {
        let chunks = chunk_content(ANR_SAMPLE, LogKind::Anr, Mode::Intelligent, 100_000);
        for chunk in &chunks {
            assert!(!chunk.text.contains("sysTid="));
        }
    }
}
