//! Candidate extraction
//!
//! Pulls one unified diff out of free-form generated text and scores it.
//! Fenced blocks are tried first (` ```diff ` / ` ```patch `, then bare
//! fences); otherwise the longest run of diff-marker lines is used.

use crate::error::ExtractionError;
use crate::patch::{classify_line, parse_file_patches, LineKind};
use regex::{RegexSet, RegexSetBuilder};
use serde::Serialize;
use std::sync::OnceLock;

/// Candidate texts above this size are refused before any scanning.
pub const MAX_CANDIDATE_BYTES: usize = 800_000;

const LONG_LINE_CHARS: usize = 100;
const DANGER_PENALTY: f64 = 0.3;

const DANGEROUS_PATTERNS: [&str; 7] = [
    r"rm\s+-rf",
    r"del\s+/s",
    r"format\s+c:",
    r"dd\s+if=",
    r"\beval\(",
    r"\bexec\(",
    r"\bsystem\(",
];

static DANGEROUS: OnceLock<Option<RegexSet>> = OnceLock::new();

fn dangerous_set() -> Option<&'static RegexSet> {
    DANGEROUS
        .get_or_init(|| {
            RegexSetBuilder::new(DANGEROUS_PATTERNS)
                .case_insensitive(true)
                .build()
                .ok()
        })
        .as_ref()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CandidateScores {
    /// Share of non-empty lines that are valid diff lines
    pub structure: f64,
    /// Share of patched files the caller listed as relevant
    pub alignment: f64,
    /// 1.0 minus a penalty per dangerous pattern in added lines
    pub safety: f64,
    /// Penalizes very long changed lines
    pub complexity: f64,
}

impl CandidateScores {
    pub fn confidence(&self) -> f64 {
        (self.structure * 0.4 + self.alignment * 0.3 + self.safety * 0.2 + self.complexity * 0.1)
            .clamp(0.0, 1.0)
    }
}

/// An extracted patch and its confidence. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    patch: String,
    files: Vec<String>,
    scores: CandidateScores,
    confidence: f64,
}

impl Candidate {
    pub fn patch(&self) -> &str {
        &self.patch
    }

    /// Files the patch lands on.
    pub fn files(&self) -> &[String] {
        &self.files
    }

    pub fn scores(&self) -> CandidateScores {
        self.scores
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    #[cfg(test)]
    pub(crate) fn for_test(patch: &str, confidence: f64) -> Self {
        let files = parse_file_patches(patch)
            .iter()
            .filter_map(|f| f.path().map(str::to_string))
            .collect();
        Self {
            patch: patch.to_string(),
            files,
            scores: CandidateScores {
                structure: 1.0,
                alignment: 1.0,
                safety: 1.0,
                complexity: 1.0,
            },
            confidence,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CandidateExtractor {
    max_bytes: usize,
}

impl Default for CandidateExtractor {
    fn default() -> Self {
        Self {
            max_bytes: MAX_CANDIDATE_BYTES,
        }
    }
}

impl CandidateExtractor {
    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self { max_bytes }
    }

    /// Extract and score a patch. `context_files` are the paths the caller
    /// believes are relevant; they only feed the alignment score.
    pub fn extract(
        &self,
        text: &str,
        context_files: &[String],
    ) -> Result<Candidate, ExtractionError> {
        if text.trim().is_empty() {
            return Err(ExtractionError::Empty);
        }
        if text.len() > self.max_bytes {
            return Err(ExtractionError::TooLarge {
                size: text.len(),
                limit: self.max_bytes,
            });
        }

        let lines = find_patch_lines(text)?;
        let patch = normalize_patch(&lines);
        Ok(score(patch, context_files))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct BlockStats {
    file_headers: usize,
    content_lines: usize,
}

impl BlockStats {
    fn of(lines: &[&str]) -> Self {
        let mut stats = BlockStats::default();
        for line in lines {
            let kind = classify_line(line);
            if kind.is_file_header() {
                stats.file_headers += 1;
            } else if kind.is_content() {
                stats.content_lines += 1;
            }
        }
        stats
    }

    fn is_complete(&self) -> bool {
        self.file_headers > 0 && self.content_lines > 0
    }

    fn is_empty(&self) -> bool {
        self.file_headers == 0 && self.content_lines == 0
    }
}

struct Fence<'a> {
    info: String,
    body: Vec<&'a str>,
}

// Fence markers must start at column 0: an indented "```" may be a diff
// context line quoting markdown.
fn fenced_blocks(text: &str) -> Vec<Fence<'_>> {
    let mut blocks = Vec::new();
    let mut open: Option<Fence<'_>> = None;
    for line in text.lines() {
        match open.take() {
            None => {
                if let Some(info) = line.strip_prefix("```") {
                    open = Some(Fence {
                        info: info.trim().to_ascii_lowercase(),
                        body: Vec::new(),
                    });
                }
            }
            Some(mut fence) => {
                if line.trim_end() == "```" {
                    blocks.push(fence);
                } else {
                    fence.body.push(line);
                    open = Some(fence);
                }
            }
        }
    }
    // An unterminated fence still counts; generators often stop mid-block.
    blocks.extend(open);
    blocks
}

// Lines that may appear in a marker run. Blank lines are tolerated inside a
// run but never start one.
fn is_marker_line(line: &str) -> bool {
    !matches!(classify_line(line), LineKind::Other)
}

fn longest_marker_run(text: &str) -> Vec<&str> {
    fn finish<'a>(current: &mut Vec<&'a str>, best: &mut Vec<&'a str>) {
        while current.last().is_some_and(|l| l.trim().is_empty()) {
            current.pop();
        }
        if current.len() > best.len() {
            *best = std::mem::take(current);
        } else {
            current.clear();
        }
    }

    let mut best: Vec<&str> = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    for line in text.lines() {
        if is_marker_line(line) || (!current.is_empty() && line.is_empty()) {
            current.push(line);
        } else {
            finish(&mut current, &mut best);
        }
    }
    finish(&mut current, &mut best);
    best
}

fn find_patch_lines(text: &str) -> Result<Vec<&str>, ExtractionError> {
    let fences = fenced_blocks(text);
    let mut seen = BlockStats::default();

    let labelled = fences
        .iter()
        .filter(|f| matches!(f.info.as_str(), "diff" | "patch" | "udiff"));
    let unlabelled = fences.iter().filter(|f| f.info.is_empty());
    for fence in labelled.chain(unlabelled) {
        let stats = BlockStats::of(&fence.body);
        if stats.is_complete() {
            return Ok(fence.body.clone());
        }
        if seen.is_empty() {
            seen = stats;
        }
    }

    let run = longest_marker_run(text);
    let stats = BlockStats::of(&run);
    if stats.is_complete() {
        return Ok(run);
    }
    if !stats.is_empty() {
        seen = stats;
    }

    if seen.is_empty() {
        Err(ExtractionError::NoPatch)
    } else {
        Err(ExtractionError::Incomplete {
            file_headers: seen.file_headers,
            content_lines: seen.content_lines,
        })
    }
}

// Leading blank lines dropped, exactly one trailing newline.
fn normalize_patch(lines: &[&str]) -> String {
    let start = lines
        .iter()
        .position(|l| !l.trim().is_empty())
        .unwrap_or(lines.len());
    let mut patch = lines[start..].join("\n");
    let trimmed = patch.trim_end_matches(['\n', '\r']).len();
    patch.truncate(trimmed);
    patch.push('\n');
    patch
}

fn score(patch: String, context_files: &[String]) -> Candidate {
    let mut files: Vec<String> = Vec::new();
    for file in parse_file_patches(&patch) {
        if let Some(path) = file.path() {
            if !files.iter().any(|f| f == path) {
                files.push(path.to_string());
            }
        }
    }

    let mut non_empty = 0usize;
    let mut structural = 0usize;
    let mut long_changes = 0usize;
    let mut added = String::new();
    for line in patch.lines().filter(|l| !l.is_empty()) {
        non_empty += 1;
        let kind = classify_line(line);
        if kind.is_structural() {
            structural += 1;
        }
        if kind.is_change() && line.chars().count() > LONG_LINE_CHARS {
            long_changes += 1;
        }
        if kind == LineKind::Add {
            added.push_str(&line[1..]);
            added.push('\n');
        }
    }

    let ratio = |n: usize| {
        if non_empty == 0 {
            0.0
        } else {
            n as f64 / non_empty as f64
        }
    };

    let dangerous = dangerous_set()
        .map(|set| set.matches(&added).iter().count())
        .unwrap_or(0);

    let scores = CandidateScores {
        structure: ratio(structural),
        alignment: alignment(&files, context_files),
        safety: (1.0 - DANGER_PENALTY * dangerous as f64).max(0.0),
        complexity: 1.0 - ratio(long_changes),
    };

    Candidate {
        confidence: scores.confidence(),
        patch,
        files,
        scores,
    }
}

fn alignment(files: &[String], context_files: &[String]) -> f64 {
    if files.is_empty() || context_files.is_empty() {
        return 0.5;
    }
    let context: Vec<String> = context_files.iter().map(|c| normalize_path(c)).collect();
    let aligned = files
        .iter()
        .filter(|file| {
            let file = normalize_path(file);
            context.iter().any(|ctx| paths_match(&file, ctx))
        })
        .count();
    aligned as f64 / files.len() as f64
}

fn normalize_path(path: &str) -> String {
    path.trim()
        .replace('\\', "/")
        .trim_start_matches("./")
        .trim_start_matches('/')
        .to_string()
}

// Either side may be given relative to a different root.
fn paths_match(a: &str, b: &str) -> bool {
    a == b || a.ends_with(&format!("/{}", b)) || b.ends_with(&format!("/{}", a))
}
