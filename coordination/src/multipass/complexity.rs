//! Diff complexity classification.
//!
//! Two independent signals decide how deep a review goes:
//! 1. A deterministic signal from the diff itself (file count, changed
//!    lines, security-sensitive path segments).
//! 2. The planning pass's self-reported risk.
//!
//! The fused class is the maximum of the two, so either signal alone can
//! raise a review to `high`, and neither can lower the other.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Review depth class.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Low,
    Medium,
    High,
}

impl Complexity {
    /// Reasoning effort forwarded to backends that support it.
    pub fn reasoning_effort(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

/// Directory names whose presence anywhere in a path marks it sensitive.
const SENSITIVE_DIRS: &[&str] = &[
    "auth",
    "secrets",
    "secret",
    "credentials",
    ".ssh",
    "keys",
    "security",
    "crypto",
    "iam",
];

/// Size thresholds for the deterministic signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexityThresholds {
    pub low_max_files: usize,
    pub low_max_lines: usize,
    pub medium_max_files: usize,
    pub medium_max_lines: usize,
}

impl Default for ComplexityThresholds {
    fn default() -> Self {
        Self {
            low_max_files: 3,
            low_max_lines: 150,
            medium_max_files: 10,
            medium_max_lines: 600,
        }
    }
}

/// File and line statistics extracted from a unified diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffStats {
    pub files: Vec<String>,
    pub added: usize,
    pub removed: usize,
}

impl DiffStats {
    /// Parse a unified diff.
    ///
    /// Content with no diff headers is treated as a single file whose every
    /// line changed (document reviews).
    pub fn from_diff(diff: &str) -> Self {
        let mut stats = Self::default();
        let mut saw_git_header = false;
        let mut hunk: Option<HunkCursor> = None;

        for line in diff.lines() {
            // Inside a hunk, lines are body lines until its counts run out,
            // even when a removed line itself starts with "-- ".
            if let Some(kind) = hunk.as_mut().and_then(|h| h.consume(line)) {
                match kind {
                    BodyLine::Added => stats.added += 1,
                    BodyLine::Removed => stats.removed += 1,
                    BodyLine::Context => {}
                }
                continue;
            }
            hunk = None;

            if let Some(rest) = line.strip_prefix("diff --git ") {
                saw_git_header = true;
                if let Some(path) = rest.rsplit(" b/").next() {
                    stats.push_file(path);
                }
            } else if line.starts_with("@@") {
                hunk = Some(HunkCursor::parse(line));
            } else if let Some(rest) = line.strip_prefix("+++ ") {
                if !saw_git_header {
                    let path = rest.trim().trim_start_matches("b/");
                    if path != "/dev/null" {
                        stats.push_file(path);
                    }
                }
            } else if line.starts_with("--- ") {
                continue;
            } else if line.starts_with('+') {
                stats.added += 1;
            } else if line.starts_with('-') {
                stats.removed += 1;
            }
        }

        if stats.files.is_empty() && !diff.trim().is_empty() {
            stats.files.push("<content>".to_string());
            stats.added = diff.lines().count();
            stats.removed = 0;
        }
        stats
    }

    fn push_file(&mut self, path: &str) {
        let path = path.trim();
        if !path.is_empty() && !self.files.iter().any(|f| f == path) {
            self.files.push(path.to_string());
        }
    }

    pub fn changed_lines(&self) -> usize {
        self.added + self.removed
    }
}

enum BodyLine {
    Added,
    Removed,
    Context,
}

/// Old/new line counts still owed by the current hunk.
struct HunkCursor {
    old: usize,
    new: usize,
}

impl HunkCursor {
    /// `@@ -l[,s] +l[,s] @@`; an unreadable header leaves the hunk open-ended.
    fn parse(header: &str) -> Self {
        let count = |prefix: char| {
            header
                .split_whitespace()
                .find_map(|t| t.strip_prefix(prefix))
                .map(|range| match range.split_once(',') {
                    Some((_, len)) => len.parse().unwrap_or(usize::MAX),
                    None => 1,
                })
                .unwrap_or(usize::MAX)
        };
        Self {
            old: count('-'),
            new: count('+'),
        }
    }

    fn consume(&mut self, line: &str) -> Option<BodyLine> {
        if self.old == 0 && self.new == 0 {
            return None;
        }
        match line.as_bytes().first() {
            Some(b'+') => {
                self.new = self.new.saturating_sub(1);
                Some(BodyLine::Added)
            }
            Some(b'-') => {
                self.old = self.old.saturating_sub(1);
                Some(BodyLine::Removed)
            }
            Some(b' ') | None => {
                self.old = self.old.saturating_sub(1);
                self.new = self.new.saturating_sub(1);
                Some(BodyLine::Context)
            }
            Some(b'\\') => Some(BodyLine::Context),
            _ => None,
        }
    }
}

/// Whether a path has a security-sensitive segment.
///
/// Exact component match only: `src/auth/login.rs` and `config/.env.prod`
/// match, `src/authorization/mod.rs` and `src/environment.ts` do not.
pub fn is_sensitive_path(path: &str) -> bool {
    let components: Vec<&str> = path
        .split(['/', '\\'])
        .filter(|c| !c.is_empty() && *c != ".")
        .collect();
    let Some((last, dirs)) = components.split_last() else {
        return false;
    };

    let file = last.to_ascii_lowercase();
    if file == ".env" || file.starts_with(".env.") {
        return true;
    }
    dirs.iter()
        .any(|d| SENSITIVE_DIRS.contains(&d.to_ascii_lowercase().as_str()))
}

/// Deterministic classification result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplexityAnalysis {
    pub complexity: Complexity,
    pub file_count: usize,
    pub changed_lines: usize,
    pub sensitive_paths: Vec<String>,
}

impl ComplexityAnalysis {
    /// Compact summary for logging.
    pub fn summary(&self) -> String {
        format!(
            "complexity={} files={} lines={} sensitive={}",
            self.complexity,
            self.file_count,
            self.changed_lines,
            self.sensitive_paths.len()
        )
    }
}

/// Deterministic diff classifier.
#[derive(Debug, Clone, Default)]
pub struct ComplexityClassifier {
    thresholds: ComplexityThresholds,
}

impl ComplexityClassifier {
    pub fn new(thresholds: ComplexityThresholds) -> Self {
        Self { thresholds }
    }

    pub fn analyze(&self, diff: &str) -> ComplexityAnalysis {
        let stats = DiffStats::from_diff(diff);
        let changed_lines = stats.changed_lines();
        let file_count = stats.files.len();
        let sensitive_paths: Vec<String> = stats
            .files
            .iter()
            .filter(|f| is_sensitive_path(f))
            .cloned()
            .collect();

        let t = &self.thresholds;
        let complexity = if !sensitive_paths.is_empty() {
            Complexity::High
        } else if file_count <= t.low_max_files && changed_lines <= t.low_max_lines {
            Complexity::Low
        } else if file_count <= t.medium_max_files && changed_lines <= t.medium_max_lines {
            Complexity::Medium
        } else {
            Complexity::High
        };

        ComplexityAnalysis {
            complexity,
            file_count,
            changed_lines,
            sensitive_paths,
        }
    }
}

/// Classify a diff with the default thresholds.
pub fn classify_complexity(diff: &str) -> Complexity {
    ComplexityClassifier::default().analyze(diff).complexity
}

/// Complexity implied by the planning pass's own risk report.
///
/// Counts `risk_areas` and `findings` entries; any entry rated `high` or
/// `critical`, or five or more entries, means `high`. A self-reported
/// `complexity` field is honored as a floor.
pub fn model_signal(pass1: &Value) -> Complexity {
    let entries: Vec<&Value> = ["risk_areas", "findings"]
        .iter()
        .filter_map(|k| pass1.get(k).and_then(Value::as_array))
        .flatten()
        .collect();

    let severe = entries.iter().any(|e| {
        ["severity", "risk", "level"].iter().any(|k| {
            e.get(k)
                .and_then(Value::as_str)
                .map(|s| matches!(s.to_ascii_lowercase().as_str(), "high" | "critical"))
                .unwrap_or(false)
        })
    });

    let from_counts = if severe || entries.len() >= 5 {
        Complexity::High
    } else if entries.len() >= 2 {
        Complexity::Medium
    } else {
        Complexity::Low
    };

    let self_reported = pass1
        .get("complexity")
        .and_then(Value::as_str)
        .and_then(|s| match s.to_ascii_lowercase().as_str() {
            "high" => Some(Complexity::High),
            "medium" => Some(Complexity::Medium),
            "low" => Some(Complexity::Low),
            _ => None,
        })
        .unwrap_or(Complexity::Low);

    from_counts.max(self_reported)
}

/// How deterministic and model signals are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusionPolicy {
    /// The more conservative (higher) of the two signals.
    #[default]
    Conservative,
}

impl FusionPolicy {
    pub fn fuse(self, deterministic: Complexity, model: Complexity) -> Complexity {
        match self {
            Self::Conservative => deterministic.max(model),
        }
    }
}

/// Fuse the deterministic class with the planning pass's risk signal.
pub fn reclassify_with_model_signals(deterministic: Complexity, pass1: &Value) -> Complexity {
    FusionPolicy::Conservative.fuse(deterministic, model_signal(pass1))
}
