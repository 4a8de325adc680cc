use similar::TextDiff;

/// One `@@` block of a unified diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// 1-based start line in the old file as written in the header.
    pub old_start: usize,
    /// Context and removed lines, in order.
    pub old_lines: Vec<String>,
    /// Context and added lines, in order.
    pub new_lines: Vec<String>,
    pub new_ends_without_newline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    /// `None` for a created file.
    pub old_path: Option<String>,
    /// `None` for a deleted file.
    pub new_path: Option<String>,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    pub fn target_path(&self) -> Option<&str> {
        self.new_path.as_deref().or(self.old_path.as_deref())
    }

    pub fn is_new_file(&self) -> bool {
        self.old_path.is_none()
    }

    pub fn is_deletion(&self) -> bool {
        self.new_path.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Whitespace,
    Fuzzy,
}

pub fn parse_unified_diff(text: &str) -> Result<Vec<FilePatch>, String> {
    let lines: Vec<&str> = text.lines().collect();
    let mut files: Vec<FilePatch> = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        if line.starts_with("--- ") && i + 1 < lines.len() && lines[i + 1].starts_with("+++ ") {
            files.push(FilePatch {
                old_path: header_path(&line[4..]),
                new_path: header_path(&lines[i + 1][4..]),
                hunks: Vec::new(),
            });
            i += 2;
            continue;
        }

        if line.starts_with("@@") {
            let file = files
                .last_mut()
                .ok_or_else(|| format!("hunk before any file header at line {}", i + 1))?;
            let (old_start, old_count, new_count) = parse_hunk_header(line)
                .ok_or_else(|| format!("malformed hunk header at line {}: {}", i + 1, line))?;
            i += 1;

            let mut hunk = Hunk {
                old_start,
                old_lines: Vec::new(),
                new_lines: Vec::new(),
                new_ends_without_newline: false,
            };
            let (mut old_seen, mut new_seen) = (0, 0);
            let mut last_side = ' ';
            while i < lines.len() && (old_seen < old_count || new_seen < new_count) {
                let body = lines[i];
                match body.chars().next() {
                    Some(' ') | None => {
                        let content = body.get(1..).unwrap_or("").to_string();
                        hunk.old_lines.push(content.clone());
                        hunk.new_lines.push(content);
                        old_seen += 1;
                        new_seen += 1;
                        last_side = ' ';
                    }
                    Some('-') => {
                        hunk.old_lines.push(body[1..].to_string());
                        old_seen += 1;
                        last_side = '-';
                    }
                    Some('+') => {
                        hunk.new_lines.push(body[1..].to_string());
                        new_seen += 1;
                        last_side = '+';
                    }
                    Some('\\') => {}
                    Some(_) => return Err(format!("unexpected line in hunk at line {}: {}", i + 1, body)),
                }
                i += 1;
            }
            if old_seen < old_count || new_seen < new_count {
                return Err(format!("truncated hunk ending at line {}", i));
            }
            if i < lines.len() && lines[i].starts_with('\\') {
                if last_side != '-' {
                    hunk.new_ends_without_newline = true;
                }
                i += 1;
            }
            file.hunks.push(hunk);
            continue;
        }

        i += 1;
    }

    if files.is_empty() {
        return Err("no file headers found in patch".to_string());
    }
    Ok(files)
}

fn header_path(raw: &str) -> Option<String> {
    // Drop a trailing timestamp ("path\t2024-01-01 ...").
    let path = raw.split('\t').next().unwrap_or(raw).trim();
    if path == "/dev/null" {
        return None;
    }
    let stripped = path
        .strip_prefix("a/")
        .or_else(|| path.strip_prefix("b/"))
        .unwrap_or(path);
    Some(stripped.to_string())
}

fn parse_hunk_header(line: &str) -> Option<(usize, usize, usize)> {
    let inner = line.strip_prefix("@@ ")?;
    let end = inner.find(" @@")?;
    let mut parts = inner[..end].split_whitespace();
    let (old_start, old_count) = parse_range(parts.next()?.strip_prefix('-')?)?;
    let (_, new_count) = parse_range(parts.next()?.strip_prefix('+')?)?;
    Some((old_start, old_count, new_count))
}

fn parse_range(range: &str) -> Option<(usize, usize)> {
    match range.split_once(',') {
        Some((start, count)) => Some((start.parse().ok()?, count.parse().ok()?)),
        None => Some((range.parse().ok()?, 1)),
    }
}

/// Relocate each hunk in `original` and return the rewritten file plus the
/// weakest match that was needed.
pub fn apply_hunks(original: &str, hunks: &[Hunk], fuzzy_threshold: f64) -> Result<(String, MatchKind), String> {
    let mut lines: Vec<String> = original.lines().map(str::to_string).collect();
    let mut ends_with_newline = original.is_empty() || original.ends_with('\n');
    let mut offset: isize = 0;
    let mut weakest = MatchKind::Exact;
    let mut floor = 0;

    for (n, hunk) in hunks.iter().enumerate() {
        let expected = (hunk.old_start.saturating_sub(1) as isize + offset).max(0) as usize;
        let (start, kind) = if hunk.old_lines.is_empty() {
            (expected.min(lines.len()), MatchKind::Exact)
        } else {
            locate(&lines, &hunk.old_lines, expected, floor, fuzzy_threshold)
                .ok_or_else(|| format!("hunk {} does not match the current file", n + 1))?
        };

        let end = start + hunk.old_lines.len();
        if end == lines.len() {
            ends_with_newline = !hunk.new_ends_without_newline;
        }
        lines.splice(start..end, hunk.new_lines.iter().cloned());
        offset += hunk.new_lines.len() as isize - hunk.old_lines.len() as isize;
        floor = start + hunk.new_lines.len();
        weakest = weakest.max_with(kind);
    }

    let mut out = lines.join("\n");
    if ends_with_newline && !lines.is_empty() {
        out.push('\n');
    }
    Ok((out, weakest))
}

/// Contents of a file created by the patch.
pub fn new_file_contents(patch: &FilePatch) -> String {
    let mut lines = Vec::new();
    let mut ends_with_newline = true;
    for hunk in &patch.hunks {
        lines.extend(hunk.new_lines.iter().cloned());
        ends_with_newline = !hunk.new_ends_without_newline;
    }
    let mut out = lines.join("\n");
    if ends_with_newline && !lines.is_empty() {
        out.push('\n');
    }
    out
}

impl MatchKind {
    fn rank(self) -> u8 {
        match self {
            Self::Exact => 0,
            Self::Whitespace => 1,
            Self::Fuzzy => 2,
        }
    }

    pub fn max_with(self, other: Self) -> Self {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

fn locate(
    lines: &[String],
    needle: &[String],
    expected: usize,
    floor: usize,
    threshold: f64,
) -> Option<(usize, MatchKind)> {
    if needle.len() > lines.len() {
        return None;
    }
    let candidates: Vec<usize> = (floor..=lines.len() - needle.len()).collect();
    if candidates.is_empty() {
        return None;
    }
    let nearest = |positions: Vec<usize>| positions.into_iter().min_by_key(|p| p.abs_diff(expected));

    let exact: Vec<usize> = candidates
        .iter()
        .copied()
        .filter(|&p| lines[p..p + needle.len()] == *needle)
        .collect();
    if let Some(p) = nearest(exact) {
        return Some((p, MatchKind::Exact));
    }

    let relaxed: Vec<usize> = candidates
        .iter()
        .copied()
        .filter(|&p| {
            lines[p..p + needle.len()]
                .iter()
                .zip(needle)
                .all(|(a, b)| squash(a) == squash(b))
        })
        .collect();
    if let Some(p) = nearest(relaxed) {
        return Some((p, MatchKind::Whitespace));
    }

    let needle_refs: Vec<&str> = needle.iter().map(String::as_str).collect();
    let mut best: Option<(usize, f64)> = None;
    for &p in &candidates {
        let window: Vec<&str> = lines[p..p + needle.len()].iter().map(String::as_str).collect();
        let ratio = TextDiff::from_slices(window.as_slice(), needle_refs.as_slice()).ratio() as f64;
        let better = match best {
            None => true,
            Some((bp, br)) => ratio > br || (ratio == br && p.abs_diff(expected) < bp.abs_diff(expected)),
        };
        if better {
            best = Some((p, ratio));
        }
    }
    match best {
        Some((p, ratio)) if ratio >= threshold => Some((p, MatchKind::Fuzzy)),
        _ => None,
    }
}

fn squash(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATCH: &str = "\
diff --git a/src/lib.py b/src/lib.py
--- a/src/lib.py
+++ b/src/lib.py
@@ -1,4 +1,4 @@
 def handler(data):
-    return eval(data)
+    return literal_eval(data)

 # end
";

    #[test]
    fn test_parse_single_file() {
        let files = parse_unified_diff(PATCH).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].target_path(), Some("src/lib.py"));
        assert_eq!(files[0].hunks.len(), 1);
        let hunk = &files[0].hunks[0];
        assert_eq!(hunk.old_start, 1);
        assert_eq!(hunk.old_lines.len(), 4);
        assert_eq!(hunk.new_lines[1], "    return literal_eval(data)");
    }

    #[test]
    fn test_parse_new_and_deleted_files() {
        let text = "\
--- /dev/null
+++ b/new.txt
@@ -0,0 +1,2 @@
+one
+two
--- a/old.txt
+++ /dev/null
@@ -1 +0,0 @@
-gone
";
        let files = parse_unified_diff(text).unwrap();
        assert!(files[0].is_new_file());
        assert_eq!(new_file_contents(&files[0]), "one\ntwo\n");
        assert!(files[1].is_deletion());
        assert_eq!(files[1].target_path(), Some("old.txt"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_unified_diff("this is not a diff").is_err());
        assert!(parse_unified_diff("--- a/x\n+++ b/x\n@@ -1,3 +1,3 @@\n a\n").is_err());
    }

    #[test]
    fn test_removed_line_that_looks_like_header() {
        let text = "--- a/x\n+++ b/x\n@@ -1,2 +1,1 @@\n keep\n--- dashes\n";
        let files = parse_unified_diff(text).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].hunks[0].old_lines, vec!["keep", "-- dashes"]);
    }

    #[test]
    fn test_apply_exact_with_drift() {
        let files = parse_unified_diff(PATCH).unwrap();
        let original = "import ast\n\ndef handler(data):\n    return eval(data)\n\n# end\n";
        let (out, kind) = apply_hunks(original, &files[0].hunks, 0.75).unwrap();
        assert_eq!(kind, MatchKind::Exact);
        assert_eq!(out, "import ast\n\ndef handler(data):\n    return literal_eval(data)\n\n# end\n");
    }

    #[test]
    fn test_apply_whitespace_insensitive() {
        let files = parse_unified_diff(PATCH).unwrap();
        let original = "def handler(data):\n\treturn eval(data)\n\n# end\n";
        let (out, kind) = apply_hunks(original, &files[0].hunks, 0.75).unwrap();
        assert_eq!(kind, MatchKind::Whitespace);
        assert!(out.contains("literal_eval"));
    }

    #[test]
    fn test_apply_fuzzy_and_threshold() {
        let files = parse_unified_diff(PATCH).unwrap();
        let original = "def handler(data):\n    return eval(data)\n\n# the end\n";
        let (_, kind) = apply_hunks(original, &files[0].hunks, 0.7).unwrap();
        assert_eq!(kind, MatchKind::Fuzzy);

        let unrelated = "fn main() {}\nlet x = 1;\nlet y = 2;\nlet z = 3;\n";
        assert!(apply_hunks(unrelated, &files[0].hunks, 0.75).is_err());
    }

    #[test]
    fn test_apply_preserves_missing_trailing_newline() {
        let text = "--- a/x\n+++ b/x\n@@ -1,2 +1,2 @@\n a\n-b\n+c\n";
        let files = parse_unified_diff(text).unwrap();
        let (out, _) = apply_hunks("a\nb\n", &files[0].hunks, 0.75).unwrap();
        assert_eq!(out, "a\nc\n");
    }
}
