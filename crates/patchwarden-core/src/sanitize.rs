//! Candidate sanitization
//!
//! Decides whether a candidate may proceed to a rollout. Sensitive paths and
//! blocked content always block; low confidence or an empty change set makes
//! the candidate invalid; an oversized patch is cut down to the profile's
//! budget around a single marker line.

use crate::candidate::Candidate;
use crate::patch::{classify_line, split_sections, touched_paths, DiffSection};
use crate::profile::OperatingProfile;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::fmt;

/// Prefix of the line inserted where a truncated patch was cut.
pub const TRUNCATION_MARKER_PREFIX: &str = "# ... patchwarden truncated";

pub const DEFAULT_SENSITIVE_PATHS: [&str; 13] = [
    r"^\.patchwarden(/|$)",
    r"(^|/)\.git(/|$)",
    r"\.env",
    r"\.ssh",
    r"\.pem$",
    r"id_rsa",
    r"secrets\.",
    r"\.key$",
    r"\.cert$",
    r"\.p12$",
    r"\.pfx$",
    r"\.keystore$",
    r"\.jks$",
];

pub const DEFAULT_BLOCKED_CONTENT: [&str; 11] = [
    r"\bsk-[A-Za-z0-9_-]{20,}",
    r"\bghp_[A-Za-z0-9]{20,}",
    r"\bxox[baprs]-[A-Za-z0-9-]{10,}",
    r"\bAIza[0-9A-Za-z_-]{30,}",
    r#"(?i)\b(api[_-]?key|token|secret|password)\s*[:=]\s*["'][^"']{8,}["']"#,
    r"\brm\s+-rf\s+(/|~|\$HOME)",
    r"\bmkfs\.",
    r"\bdd\s+if=",
    r"\bchmod\s+(-R\s+)?777\b",
    r"(?i)\bformat\s+c:",
    r"\bfdisk\s+/dev/",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Valid,
    Invalid,
    Blocked,
    Truncated,
}

impl Verdict {
    pub fn may_proceed(self) -> bool {
        matches!(self, Verdict::Valid | Verdict::Truncated)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Verdict::Valid => "valid",
            Verdict::Invalid => "invalid",
            Verdict::Blocked => "blocked",
            Verdict::Truncated => "truncated",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Violation {
    SensitivePath { path: String, pattern: String },
    /// `line` is 1-based within the patch.
    BlockedContent { line: usize, pattern: String },
    LowConfidence { confidence: f64, minimum: f64 },
    EmptyPatch,
    SizeLimitExceeded { lines: usize, limit: usize },
}

impl Violation {
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            Violation::SensitivePath { .. } | Violation::BlockedContent { .. }
        )
    }

    pub fn describe(&self) -> String {
        match self {
            Violation::SensitivePath { path, pattern } => {
                format!("sensitive path {} (matches {})", path, pattern)
            }
            Violation::BlockedContent { line, pattern } => {
                format!("blocked content on patch line {} (matches {})", line, pattern)
            }
            Violation::LowConfidence {
                confidence,
                minimum,
            } => format!("confidence {:.2} below minimum {:.2}", confidence, minimum),
            Violation::EmptyPatch => "patch changes nothing".to_string(),
            Violation::SizeLimitExceeded { lines, limit } => {
                format!("{} lines exceeds the {} line budget", lines, limit)
            }
        }
    }
}

/// Result of sanitizing one candidate. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationOutcome {
    verdict: Verdict,
    violations: Vec<Violation>,
    /// The patch to hand to the rollout; truncated when the verdict says so.
    patch: String,
}

impl ValidationOutcome {
    pub fn verdict(&self) -> Verdict {
        self.verdict
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn patch(&self) -> &str {
        &self.patch
    }

    pub fn may_proceed(&self) -> bool {
        self.verdict.may_proceed()
    }
}

/// Deny-lists applied by the sanitizer.
#[derive(Debug, Clone)]
pub struct SanitizerPolicy {
    sensitive_paths: Vec<Regex>,
    blocked_content: Vec<Regex>,
}

impl Default for SanitizerPolicy {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SanitizerPolicy {
    pub fn builtin() -> Self {
        Self {
            sensitive_paths: DEFAULT_SENSITIVE_PATHS
                .iter()
                .filter_map(|p| path_regex(p).ok())
                .collect(),
            blocked_content: DEFAULT_BLOCKED_CONTENT
                .iter()
                .filter_map(|p| Regex::new(p).ok())
                .collect(),
        }
    }

    /// Build from configured patterns. Path patterns match case-insensitively.
    pub fn from_patterns<S: AsRef<str>>(
        sensitive_paths: &[S],
        blocked_content: &[S],
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            sensitive_paths: sensitive_paths
                .iter()
                .map(|p| path_regex(p.as_ref()))
                .collect::<Result<_, _>>()?,
            blocked_content: blocked_content
                .iter()
                .map(|p| Regex::new(p.as_ref()))
                .collect::<Result<_, _>>()?,
        })
    }

    pub fn sensitive_path_count(&self) -> usize {
        self.sensitive_paths.len()
    }

    pub fn blocked_content_count(&self) -> usize {
        self.blocked_content.len()
    }
}

fn path_regex(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).case_insensitive(true).build()
}

#[derive(Debug, Clone, Default)]
pub struct Sanitizer {
    policy: SanitizerPolicy,
}

impl Sanitizer {
    pub fn new(policy: SanitizerPolicy) -> Self {
        Self { policy }
    }

    pub fn sanitize(&self, candidate: &Candidate, profile: &OperatingProfile) -> ValidationOutcome {
        let patch = candidate.patch();
        let mut violations = self.blocking_violations(patch);

        if candidate.confidence() < profile.min_confidence() {
            violations.push(Violation::LowConfidence {
                confidence: candidate.confidence(),
                minimum: profile.min_confidence(),
            });
        }
        let has_change = patch
            .lines()
            .any(|l| classify_line(l).is_change() && !l[1..].trim().is_empty());
        if !has_change {
            violations.push(Violation::EmptyPatch);
        }

        if violations.iter().any(Violation::is_blocking) {
            return outcome(Verdict::Blocked, violations, patch);
        }
        if !violations.is_empty() {
            return outcome(Verdict::Invalid, violations, patch);
        }

        let line_count = patch.lines().count();
        let limit = profile.max_patch_lines();
        if line_count > limit {
            let truncated = truncate_patch(patch, limit);
            return ValidationOutcome {
                verdict: Verdict::Truncated,
                violations: vec![Violation::SizeLimitExceeded {
                    lines: line_count,
                    limit,
                }],
                patch: truncated,
            };
        }

        outcome(Verdict::Valid, violations, patch)
    }

    fn blocking_violations(&self, patch: &str) -> Vec<Violation> {
        let mut violations = Vec::new();

        for path in touched_paths(patch) {
            if let Some(re) = self.policy.sensitive_paths.iter().find(|re| re.is_match(&path)) {
                violations.push(Violation::SensitivePath {
                    path,
                    pattern: re.as_str().to_string(),
                });
            }
        }

        for (idx, line) in patch.lines().enumerate() {
            if !classify_line(line).is_content() {
                continue;
            }
            if let Some(re) = self.policy.blocked_content.iter().find(|re| re.is_match(&line[1..])) {
                violations.push(Violation::BlockedContent {
                    line: idx + 1,
                    pattern: re.as_str().to_string(),
                });
            }
        }

        violations
    }
}

fn outcome(verdict: Verdict, violations: Vec<Violation>, patch: &str) -> ValidationOutcome {
    ValidationOutcome {
        verdict,
        violations,
        patch: patch.to_string(),
    }
}

/// Cut an oversized patch down to at most `max_lines` lines (minimum one).
///
/// Hunks are kept whole from the front and the back of the patch. The hunk
/// at each cut is trimmed with its header recounted and original lines as
/// context, so both halves still apply. The single marker line sits between
/// the halves, outside any hunk, and the back half repeats its file header.
pub fn truncate_patch(patch: &str, max_lines: usize) -> String {
    let total = patch.lines().count();
    let max_lines = max_lines.max(1);
    if total <= max_lines {
        return patch.to_string();
    }

    let sections = split_sections(patch);
    let budget = max_lines - 1;
    let (mut out, cut) = keep_front(&sections, budget.div_ceil(2));
    let tail = match cut {
        Some(cut) => keep_back(&sections, cut, budget - out.len()),
        None => Vec::new(),
    };

    let dropped = total.saturating_sub(out.len() + tail.len());
    out.push(format!("{} {} lines ...", TRUNCATION_MARKER_PREFIX, dropped));
    out.extend(tail);

    let mut text = out.join("\n");
    text.push('\n');
    text
}

/// Where the front half stopped: hunks before `hunk` in `section` were kept
/// whole and the first `kept` body lines of `hunk` were kept as a prefix.
#[derive(Debug, Clone, Copy)]
struct Cut {
    section: usize,
    hunk: usize,
    kept: usize,
}

fn keep_front(sections: &[DiffSection<'_>], budget: usize) -> (Vec<String>, Option<Cut>) {
    let mut out: Vec<String> = Vec::new();
    for (si, section) in sections.iter().enumerate() {
        if section.hunks.is_empty() {
            if out.len() + section.header.len() > budget {
                return (out, Some(Cut { section: si, hunk: 0, kept: 0 }));
            }
            out.extend(section.header.iter().map(|l| l.to_string()));
            continue;
        }

        let mut header_written = false;
        for (hi, hunk) in section.hunks.iter().enumerate() {
            let header_cost = if header_written { 0 } else { section.header.len() };
            let room = budget.saturating_sub(out.len() + header_cost);
            let whole = hunk.line_count() <= room;
            let prefix = if whole {
                None
            } else {
                (1..room.min(hunk.body.len()))
                    .rev()
                    .find_map(|n| hunk.prefix(n).filter(|l| l.len() <= room).map(|l| (n, l)))
            };
            if (whole || prefix.is_some()) && !header_written {
                out.extend(section.header.iter().map(|l| l.to_string()));
                header_written = true;
            }
            if whole {
                out.extend(hunk.lines().map(str::to_string));
                continue;
            }
            let kept = match prefix {
                Some((n, lines)) => {
                    out.extend(lines);
                    n
                }
                None => 0,
            };
            return (out, Some(Cut { section: si, hunk: hi, kept }));
        }
    }
    (out, None)
}

fn keep_back(sections: &[DiffSection<'_>], cut: Cut, budget: usize) -> Vec<String> {
    let mut pieces: Vec<Vec<String>> = Vec::new();
    let mut used = 0;

    for si in (cut.section..sections.len()).rev() {
        let section = &sections[si];
        let header: Vec<String> = section.header.iter().map(|l| l.to_string()).collect();
        if section.hunks.is_empty() {
            if used + header.len() > budget {
                break;
            }
            used += header.len();
            pieces.push(header);
            continue;
        }

        let first = if si == cut.section { cut.hunk } else { 0 };
        let mut hunks: Vec<Vec<String>> = Vec::new();
        let mut stopped = false;
        for hi in (first..section.hunks.len()).rev() {
            let hunk = &section.hunks[hi];
            let header_cost = if hunks.is_empty() { header.len() } else { 0 };
            let room = budget.saturating_sub(used + header_cost);
            let floor = if si == cut.section && hi == cut.hunk { cut.kept } else { 0 };

            if floor == 0 && hunk.line_count() <= room {
                used += header_cost + hunk.line_count();
                hunks.push(hunk.lines().map(str::to_string).collect());
                continue;
            }
            let start = floor
                .max(hunk.body.len().saturating_sub(room.saturating_sub(1)))
                .max(1);
            let suffix = (start..hunk.body.len())
                .find_map(|s| hunk.suffix(s, floor).filter(|l| l.len() <= room));
            if let Some(lines) = suffix {
                used += header_cost + lines.len();
                hunks.push(lines);
            }
            stopped = true;
            break;
        }

        if !hunks.is_empty() {
            let mut lines = header;
            lines.extend(hunks.into_iter().rev().flatten());
            pieces.push(lines);
        }
        if stopped {
            break;
        }
    }
    pieces.into_iter().rev().flatten().collect()
}
