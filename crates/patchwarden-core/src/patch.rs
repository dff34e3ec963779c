//! Unified diff inspection
//!
//! Parses just enough of a unified diff to know which files it touches and
//! how many lines it changes. Applying the patch is left to version control.

const DEV_NULL: &str = "/dev/null";

const GIT_METADATA_PREFIXES: [&str; 11] = [
    "index ",
    "new file mode",
    "deleted file mode",
    "old mode",
    "new mode",
    "similarity index",
    "dissimilarity index",
    "rename from",
    "rename to",
    "copy from",
    "copy to",
];

/// What a single diff line is, judged without surrounding state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// `--- a/path`
    OldHeader,
    /// `+++ b/path`
    NewHeader,
    /// `diff --git a/path b/path`
    GitHeader,
    /// `index ..`, `new file mode ..`, rename/copy lines
    Metadata,
    /// `@@ -1,3 +1,4 @@`
    HunkHeader,
    Add,
    Remove,
    Context,
    /// `\ No newline at end of file`
    NoNewline,
    Other,
}

impl LineKind {
    pub fn is_file_header(self) -> bool {
        matches!(self, LineKind::OldHeader | LineKind::NewHeader | LineKind::GitHeader)
    }

    pub fn is_content(self) -> bool {
        matches!(self, LineKind::Add | LineKind::Remove | LineKind::Context)
    }

    pub fn is_change(self) -> bool {
        matches!(self, LineKind::Add | LineKind::Remove)
    }

    /// Anything a well-formed unified diff may contain.
    pub fn is_structural(self) -> bool {
        !matches!(self, LineKind::Other)
    }
}

pub fn classify_line(line: &str) -> LineKind {
    if line.starts_with("--- ") {
        LineKind::OldHeader
    } else if line.starts_with("+++ ") {
        LineKind::NewHeader
    } else if line.starts_with("diff --git ") {
        LineKind::GitHeader
    } else if line.starts_with("@@") {
        LineKind::HunkHeader
    } else if GIT_METADATA_PREFIXES.iter().any(|p| line.starts_with(p)) || line.starts_with("Binary files ") {
        LineKind::Metadata
    } else if line.starts_with('+') {
        LineKind::Add
    } else if line.starts_with('-') {
        LineKind::Remove
    } else if line.starts_with(' ') {
        LineKind::Context
    } else if line.starts_with('\\') {
        LineKind::NoNewline
    } else {
        LineKind::Other
    }
}

/// Per-file slice of a unified diff.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilePatch {
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub hunks: usize,
    pub additions: usize,
    pub removals: usize,
}

impl FilePatch {
    /// Path the change lands on: the new side, or the old side for deletions.
    pub fn path(&self) -> Option<&str> {
        self.new_path.as_deref().or(self.old_path.as_deref())
    }

    fn has_header(&self) -> bool {
        self.old_path.is_some() || self.new_path.is_some()
    }
}

/// Split a unified diff into per-file sections.
///
/// Both plain `---`/`+++` diffs and git-style diffs are accepted. Files with
/// no recognizable path (both sides `/dev/null`) are dropped.
pub fn parse_file_patches(diff: &str) -> Vec<FilePatch> {
    let mut files: Vec<FilePatch> = Vec::new();
    let mut current: Option<FilePatch> = None;
    let mut in_hunk = false;
    let mut saw_old_header = false;

    for line in diff.lines() {
        match classify_line(line) {
            LineKind::GitHeader => {
                files.extend(current.take());
                let (old, new) = parse_git_header(line);
                current = Some(FilePatch {
                    old_path: old,
                    new_path: new,
                    ..Default::default()
                });
                in_hunk = false;
                saw_old_header = false;
            }
            LineKind::OldHeader if !in_hunk || looks_like_header_pair(line) => {
                // A second `---` outside a git header starts a new file.
                if saw_old_header || current.as_ref().is_some_and(|f| f.hunks > 0) {
                    files.extend(current.take());
                }
                let file = current.get_or_insert_with(FilePatch::default);
                file.old_path = normalize_header_path(&line[4..], "a/");
                in_hunk = false;
                saw_old_header = true;
            }
            LineKind::NewHeader if !in_hunk || saw_old_header => {
                let file = current.get_or_insert_with(FilePatch::default);
                file.new_path = normalize_header_path(&line[4..], "b/");
                in_hunk = false;
                saw_old_header = false;
            }
            LineKind::HunkHeader => {
                let file = current.get_or_insert_with(FilePatch::default);
                file.hunks += 1;
                in_hunk = true;
                saw_old_header = false;
            }
            LineKind::Add | LineKind::NewHeader if in_hunk => {
                if let Some(file) = current.as_mut() {
                    file.additions += 1;
                }
            }
            LineKind::Remove | LineKind::OldHeader if in_hunk => {
                if let Some(file) = current.as_mut() {
                    file.removals += 1;
                }
            }
            _ => {}
        }
    }
    files.extend(current);

    files.into_iter().filter(FilePatch::has_header).collect()
}

// Inside a hunk, `--- x` is usually a removed line starting with "-- ".
// Treat it as a header only when it is immediately recognisable as one.
fn looks_like_header_pair(line: &str) -> bool {
    line.starts_with("--- a/") || line.starts_with("--- /dev/null")
}

/// Every path a diff reads or writes, old and new sides, first-seen order.
pub fn touched_paths(diff: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for file in parse_file_patches(diff) {
        for path in [file.old_path, file.new_path].into_iter().flatten() {
            if !out.contains(&path) {
                out.push(path);
            }
        }
    }
    out
}

fn parse_git_header(line: &str) -> (Option<String>, Option<String>) {
    let rest = line.trim_start_matches("diff --git ").trim();
    // Unquoted paths: "a/x b/x". Split on the last " b/" to tolerate spaces.
    match rest.rfind(" b/") {
        Some(idx) => (
            normalize_header_path(&rest[..idx], "a/"),
            normalize_header_path(&rest[idx + 1..], "b/"),
        ),
        None => (None, None),
    }
}

/// Context lines kept around a hunk cut.
const CUT_CONTEXT_LINES: usize = 3;

/// One file's header lines and its hunks, borrowed from the diff text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSection<'a> {
    pub header: Vec<&'a str>,
    pub hunks: Vec<Hunk<'a>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk<'a> {
    pub header: &'a str,
    pub body: Vec<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HunkRange<'a> {
    old_start: usize,
    new_start: usize,
    /// Whatever follows the closing `@@`, usually a function name.
    trailer: &'a str,
}

impl<'a> Hunk<'a> {
    /// Lines this hunk occupies, header included.
    pub fn line_count(&self) -> usize {
        1 + self.body.len()
    }

    pub fn lines(&self) -> impl Iterator<Item = &'a str> + '_ {
        std::iter::once(self.header).chain(self.body.iter().copied())
    }

    /// The first `n` body lines as a standalone hunk, followed by up to three
    /// original lines from the rest of the hunk as trailing context.
    /// `None` when the header cannot be parsed or the cut holds no change.
    pub fn prefix(&self, n: usize) -> Option<Vec<String>> {
        let range = parse_hunk_range(self.header)?;
        if n == 0 || n >= self.body.len() || is_no_newline(self.body[n]) {
            return None;
        }
        let kept = &self.body[..n];
        if !kept.iter().any(|l| is_change(l)) {
            return None;
        }

        let mut context: Vec<String> = Vec::new();
        let rest = &self.body[n..];
        let mut taken = 0;
        for (i, line) in rest.iter().enumerate() {
            if taken == CUT_CONTEXT_LINES {
                break;
            }
            if is_old_side(line) {
                context.push(as_context(line));
                taken += 1;
                if rest.get(i + 1).is_some_and(|l| is_no_newline(l)) {
                    context.push(rest[i + 1].to_string());
                }
            }
        }

        let old = count_side(kept, is_old_side) + taken;
        let new = count_side(kept, is_new_side) + taken;
        let mut out = vec![format_range(range.old_start, old, range.new_start, new, range.trailer)];
        out.extend(kept.iter().map(|l| l.to_string()));
        out.extend(context);
        Some(out)
    }

    /// Body lines from `start` on as a standalone hunk, preceded by up to
    /// three original lines taken from `floor..start` as leading context.
    pub fn suffix(&self, start: usize, floor: usize) -> Option<Vec<String>> {
        let range = parse_hunk_range(self.header)?;
        if start == 0 || start >= self.body.len() || floor > start || is_no_newline(self.body[start]) {
            return None;
        }
        let kept = &self.body[start..];
        if !kept.iter().any(|l| is_change(l)) {
            return None;
        }

        let mut context: Vec<String> = self.body[floor..start]
            .iter()
            .rev()
            .filter(|l| is_old_side(l))
            .take(CUT_CONTEXT_LINES)
            .map(|l| as_context(l))
            .collect();
        context.reverse();
        let taken = context.len();

        let before = &self.body[..start];
        let old_start = (range.old_start + count_side(before, is_old_side)).saturating_sub(taken);
        // Keep the original hunk's offset between the two sides.
        let new_start = (old_start + range.new_start).saturating_sub(range.old_start);
        let old = count_side(kept, is_old_side) + taken;
        let new = count_side(kept, is_new_side) + taken;
        let mut out = vec![format_range(old_start, old, new_start, new, range.trailer)];
        out.extend(context);
        out.extend(kept.iter().map(|l| l.to_string()));
        Some(out)
    }
}

/// Split a diff into file sections and hunks.
///
/// Hunk bodies run until a line that cannot belong to one. Stray text between
/// hunks is dropped; text before any hunk stays with the file header.
pub fn split_sections(diff: &str) -> Vec<DiffSection<'_>> {
    let lines: Vec<&str> = diff.lines().collect();
    let mut sections: Vec<DiffSection<'_>> = Vec::new();
    let mut in_hunk = false;

    for (i, &line) in lines.iter().enumerate() {
        let next_is_new_header = lines.get(i + 1).is_some_and(|n| n.starts_with("+++ "));
        let current_has_hunks = sections.last().is_some_and(|s| !s.hunks.is_empty());
        let starts_file = line.starts_with("diff --git ")
            || (line.starts_with("--- ") && next_is_new_header && (in_hunk || current_has_hunks));

        if starts_file || sections.is_empty() {
            sections.push(DiffSection::default());
            in_hunk = false;
        }
        let Some(section) = sections.last_mut() else {
            continue;
        };

        if line.starts_with("@@") {
            section.hunks.push(Hunk {
                header: line,
                body: Vec::new(),
            });
            in_hunk = true;
        } else if in_hunk && is_body_line(line) {
            if let Some(hunk) = section.hunks.last_mut() {
                hunk.body.push(line);
            }
        } else if section.hunks.is_empty() {
            section.header.push(line);
        } else {
            in_hunk = false;
        }
    }
    sections
}

fn parse_hunk_range(header: &str) -> Option<HunkRange<'_>> {
    let rest = header.strip_prefix("@@ -")?;
    let (ranges, trailer) = rest.split_once(" @@")?;
    let (old, new) = ranges.split_once(" +")?;
    let start = |r: &str| r.split(',').next().and_then(|n| n.parse::<usize>().ok());
    Some(HunkRange {
        old_start: start(old)?,
        new_start: start(new)?,
        trailer,
    })
}

fn format_range(old_start: usize, old: usize, new_start: usize, new: usize, trailer: &str) -> String {
    format!("@@ -{},{} +{},{} @@{}", old_start, old, new_start, new, trailer)
}

fn is_body_line(line: &str) -> bool {
    line.is_empty() || line.starts_with([' ', '+', '-', '\\'])
}

fn is_old_side(line: &&str) -> bool {
    line.is_empty() || line.starts_with([' ', '-'])
}

fn is_new_side(line: &&str) -> bool {
    line.is_empty() || line.starts_with([' ', '+'])
}

fn is_change(line: &str) -> bool {
    line.starts_with(['+', '-'])
}

fn is_no_newline(line: &str) -> bool {
    line.starts_with('\\')
}

fn count_side(lines: &[&str], side: fn(&&str) -> bool) -> usize {
    lines.iter().filter(|l| side(l)).count()
}

fn as_context(line: &str) -> String {
    match line.get(1..) {
        Some(rest) => format!(" {}", rest),
        None => " ".to_string(),
    }
}

fn normalize_header_path(raw: &str, prefix: &str) -> Option<String> {
    // Strip timestamp suffix ("path\t2024-01-01 ...")
    let raw = raw.split('\t').next().unwrap_or(raw).trim();
    let raw = raw.trim_matches('"');
    if raw.is_empty() || raw == DEV_NULL {
        return None;
    }
    let path = raw.strip_prefix(prefix).unwrap_or(raw);
    let path = path.trim_start_matches("./").replace('\\', "/");
    if path.is_empty() {
        None
    } else {
        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_diff() {
        let diff = r#"--- a/src/example.ts
+++ b/src/example.ts
@@ -1,5 +1,6 @@
 function hello() {
-  console.log("old");
+  console.log("new");
+  console.log("extra");
   return true;
 }
"#;
        let files = parse_file_patches(diff);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path(), Some("src/example.ts"));
        assert_eq!(files[0].hunks, 1);
        assert_eq!((files[0].additions, files[0].removals), (2, 1));
    }

    #[test]
    fn test_parse_multi_file_git_diff() {
        let diff = "diff --git a/src/a.rs b/src/a.rs\n\
index 111..222 100644\n\
--- a/src/a.rs\n\
+++ b/src/a.rs\n\
@@ -1 +1 @@\n\
-old\n\
+new\n\
diff --git a/src/b.rs b/src/b.rs\n\
new file mode 100644\n\
--- /dev/null\n\
+++ b/src/b.rs\n\
@@ -0,0 +1,2 @@\n\
+fn b() {}\n\
+\n";
        let files = parse_file_patches(diff);
        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path(), Some("src/a.rs"));
        assert_eq!(files[1].old_path, None);
        assert_eq!(files[1].path(), Some("src/b.rs"));
        assert_eq!(files[1].additions, 2);
    }

    #[test]
    fn test_plain_diffs_without_git_header_split_per_file() {
        let diff = "--- a/one.txt\n+++ b/one.txt\n@@ -1 +1 @@\n-a\n+b\n--- a/two.txt\n+++ b/two.txt\n@@ -1 +1 @@\n-c\n+d\n";
        let paths: Vec<_> = parse_file_patches(diff)
            .iter()
            .filter_map(|f| f.path().map(str::to_string))
            .collect();
        assert_eq!(paths, vec!["one.txt", "two.txt"]);
    }

    #[test]
    fn test_removed_line_starting_with_dashes_is_not_a_header() {
        let diff = "--- a/notes.md\n+++ b/notes.md\n@@ -1,2 +1,1 @@\n--- separator\n keep\n";
        let files = parse_file_patches(diff);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].removals, 1);
    }

    #[test]
    fn test_touched_paths_includes_both_sides_of_rename() {
        let diff = "--- a/old/name.rs\n+++ b/new/name.rs\n@@ -1 +1 @@\n-x\n+y\n";
        assert_eq!(touched_paths(diff), vec!["old/name.rs", "new/name.rs"]);
    }

    #[test]
    fn test_header_timestamps_are_stripped() {
        let diff = "--- src/lib.rs\t2024-01-01 00:00:00\n+++ src/lib.rs\t2024-01-02 00:00:00\n@@ -1 +1 @@\n-a\n+b\n";
        assert_eq!(touched_paths(diff), vec!["src/lib.rs"]);
    }

    #[test]
    fn test_split_sections_keeps_headers_and_hunk_bodies() {
        let diff = "diff --git a/a.rs b/a.rs\n--- a/a.rs\n+++ b/a.rs\n@@ -1,2 +1,2 @@\n-x\n--- y\n@@ -9 +9 @@\n-p\n+q\n--- a/b.rs\n+++ b/b.rs\n@@ -1 +1 @@\n-m\n+n\n\\ No newline at end of file\n";
        let sections = split_sections(diff);
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[0].header.len(), 3);
        assert_eq!(sections[0].hunks.len(), 2);
        // "--- y" is not followed by "+++", so it stays a removed line.
        assert_eq!(sections[0].hunks[0].body, vec!["-x", "--- y"]);
        assert_eq!(sections[1].header, vec!["--- a/b.rs", "+++ b/b.rs"]);
        assert_eq!(sections[1].hunks[0].body.len(), 3);
    }

    #[test]
    fn test_hunk_prefix_and_suffix_recount_headers() {
        let hunk = Hunk {
            header: "@@ -10,7 +10,7 @@ fn main()",
            body: vec![" a", "-b", "-c", "-d", "+B", "+C", "+D", " e"],
        };

        let prefix = hunk.prefix(2).unwrap();
        assert_eq!(prefix, vec!["@@ -10,5 +10,4 @@ fn main()", " a", "-b", " c", " d", " e"]);

        let suffix = hunk.suffix(5, 0).unwrap();
        assert_eq!(suffix, vec!["@@ -11,4 +11,6 @@ fn main()", " b", " c", " d", "+C", "+D", " e"]);

        // Context is only drawn from lines at or after the floor.
        let floored = hunk.suffix(5, 3).unwrap();
        assert_eq!(floored[0], "@@ -13,2 +13,4 @@ fn main()");
        assert_eq!(&floored[1..], [" d", "+C", "+D", " e"]);

        assert!(hunk.prefix(1).is_none());
        assert!(hunk.suffix(7, 0).is_none());
        assert!(Hunk { header: "@@ junk", body: vec!["-a", "+b"] }.prefix(1).is_none());
    }

    #[test]
    fn test_classify_line() {
        assert_eq!(classify_line("+++ b/x"), LineKind::NewHeader);
        assert_eq!(classify_line("+added"), LineKind::Add);
        assert_eq!(classify_line("index abc..def"), LineKind::Metadata);
        assert_eq!(classify_line("\\ No newline at end of file"), LineKind::NoNewline);
        assert_eq!(classify_line("Here is the fix:"), LineKind::Other);
        assert!(LineKind::GitHeader.is_file_header());
        assert!(!LineKind::HunkHeader.is_content());
    }
}
