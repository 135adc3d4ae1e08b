//! Feature detection for agent CLIs.
//!
//! Supported flags are read from `<cli> exec --help` and cached per CLI
//! version under `<cache_dir>/capabilities/<backend>-<hash>.json`. Records
//! older than [`CACHE_TTL_DAYS`] are re-probed.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use review_coordination::Capability;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::process::{run_with_timeout, CommandLine};

pub const CACHE_TTL_DAYS: i64 = 7;

const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Flag each optional capability depends on.
pub fn capability_flag(capability: Capability) -> Option<&'static str> {
    match capability {
        Capability::Sandbox => Some("--sandbox"),
        Capability::Ephemeral => Some("--ephemeral"),
        Capability::OutputFile => Some("--output-last-message"),
        Capability::ReasoningEffort => Some("--config"),
        Capability::MultiPass => None,
    }
}

/// Cached probe result for one CLI version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRecord {
    pub backend: String,
    pub version: String,
    pub version_hash: String,
    pub flags: BTreeSet<String>,
    pub probed_at: DateTime<Utc>,
}

impl CapabilityRecord {
    pub fn new(backend: &str, version: &str, flags: BTreeSet<String>, now: DateTime<Utc>) -> Self {
        Self {
            backend: backend.to_string(),
            version: version.to_string(),
            version_hash: version_hash(version),
            flags,
            probed_at: now,
        }
    }

    /// Record with no optional flags, used when probing fails.
    pub fn unprobed(backend: &str) -> Self {
        Self::new(backend, "", BTreeSet::new(), Utc::now())
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.probed_at) < chrono::Duration::days(CACHE_TTL_DAYS)
    }

    pub fn supports_flag(&self, flag: &str) -> bool {
        self.flags.contains(flag)
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match capability_flag(capability) {
            Some(flag) => self.supports_flag(flag),
            None => false,
        }
    }
}

/// Short content hash of a version string.
pub fn version_hash(version: &str) -> String {
    let hash = blake3::hash(version.trim().as_bytes());
    hash.to_hex()[..16].to_string()
}

/// Long flags mentioned anywhere in help output.
pub fn parse_help_flags(help: &str) -> BTreeSet<String> {
    help.split(|c: char| c.is_whitespace() || matches!(c, ',' | '=' | '[' | ']' | '<' | '(' | ')'))
        .filter_map(|tok| tok.strip_prefix("--"))
        .map(|name| {
            name.chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
                .collect::<String>()
        })
        .filter(|name| !name.is_empty() && !name.starts_with('-'))
        .map(|name| format!("--{name}"))
        .collect()
}

/// On-disk cache of capability records.
#[derive(Debug, Clone)]
pub struct CapabilityCache {
    dir: PathBuf,
}

impl CapabilityCache {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            dir: cache_root.into().join("capabilities"),
        }
    }

    pub fn path_for(&self, backend: &str, version: &str) -> PathBuf {
        self.dir
            .join(format!("{backend}-{}.json", version_hash(version)))
    }

    /// Fresh record for this backend version, if cached.
    pub fn load(&self, backend: &str, version: &str, now: DateTime<Utc>) -> Option<CapabilityRecord> {
        let path = self.path_for(backend, version);
        let raw = std::fs::read_to_string(&path).ok()?;
        let record: CapabilityRecord = match serde_json::from_str(&raw) {
            Ok(r) => r,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt capability cache entry");
                return None;
            }
        };
        if record.version_hash != version_hash(version) || !record.is_fresh(now) {
            debug!(path = %path.display(), "Capability cache entry stale");
            return None;
        }
        Some(record)
    }

    /// Write atomically so concurrent probes never see a torn file.
    pub fn store(&self, record: &CapabilityRecord) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.path_for(&record.backend, &record.version);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer_pretty(&mut tmp, record)?;
        tmp.persist(&path)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

async fn capture_stdout(cli: &CommandLine, args: &[&str], cwd: Option<&Path>) -> Option<String> {
    let mut cmd = cli.command();
    cmd.args(args);
    match run_with_timeout(&mut cmd, cwd, None, PROBE_TIMEOUT).await {
        Ok(out) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
        Ok(out) => {
            debug!(program = %cli.program, ?args, code = ?out.status.code(), "Probe exited nonzero");
            None
        }
        Err(e) => {
            debug!(program = %cli.program, ?args, error = %e, "Probe failed");
            None
        }
    }
}

/// Probe a CLI's flags, consulting the cache first.
///
/// Any failure yields [`CapabilityRecord::unprobed`], so optional flags are
/// simply not passed.
pub async fn probe(backend: &str, cli: &CommandLine, cache: &CapabilityCache) -> CapabilityRecord {
    let Some(version) = capture_stdout(cli, &["--version"], None).await else {
        return CapabilityRecord::unprobed(backend);
    };
    let version = version.trim().to_string();
    let now = Utc::now();

    if let Some(record) = cache.load(backend, &version, now) {
        debug!(backend, %version, "Capability cache hit");
        return record;
    }

    let Some(help) = capture_stdout(cli, &["exec", "--help"], None).await else {
        return CapabilityRecord::unprobed(backend);
    };
    let record = CapabilityRecord::new(backend, &version, parse_help_flags(&help), now);
    match cache.store(&record) {
        Ok(path) => info!(backend, %version, flags = record.flags.len(), path = %path.display(), "Capabilities probed"),
        Err(e) => warn!(backend, error = %e, "Failed to cache capabilities"),
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELP: &str = "\
Usage: codex exec [OPTIONS] [PROMPT]

Options:
  -m, --model <MODEL>            Model the agent should use
  -s, --sandbox <SANDBOX_MODE>   [possible values: read-only, workspace-write]
      --ephemeral                Do not persist the session
  -o, --output-last-message=<FILE>
  -C, --cd <DIR>
      --skip-git-repo-check
  -c, --config <key=value>
";

    #[test]
    fn test_parse_help_flags() {
        let flags = parse_help_flags(HELP);
        for f in ["--model", "--sandbox", "--ephemeral", "--output-last-message", "--cd", "--skip-git-repo-check", "--config"] {
            assert!(flags.contains(f), "missing {f}");
        }
        assert!(!flags.contains("--"));
    }

    #[test]
    fn test_record_supports() {
        let rec = CapabilityRecord::new("codex", "codex-cli 0.40.0", parse_help_flags(HELP), Utc::now());
        assert!(rec.supports(Capability::Sandbox));
        assert!(rec.supports(Capability::Ephemeral));
        assert!(rec.supports(Capability::OutputFile));
        assert!(!rec.supports(Capability::MultiPass));
        assert!(!CapabilityRecord::unprobed("codex").supports(Capability::Sandbox));
    }

    #[test]
    fn test_version_hash_is_stable() {
        assert_eq!(version_hash("1.0"), version_hash(" 1.0\n"));
        assert_ne!(version_hash("1.0"), version_hash("1.1"));
        assert_eq!(version_hash("1.0").len(), 16);
    }

    #[test]
    fn test_cache_round_trip_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CapabilityCache::new(dir.path());
        let now = Utc::now();
        let rec = CapabilityRecord::new("codex", "0.40.0", parse_help_flags(HELP), now);
        let path = cache.store(&rec).unwrap();
        assert!(path.starts_with(dir.path().join("capabilities")));

        assert_eq!(cache.load("codex", "0.40.0", now), Some(rec.clone()));
        assert!(cache.load("codex", "0.41.0", now).is_none());
        let later = now + chrono::Duration::days(CACHE_TTL_DAYS + 1);
        assert!(cache.load("codex", "0.40.0", later).is_none());
    }

    #[test]
    fn test_corrupt_entry_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CapabilityCache::new(dir.path());
        let path = cache.path_for("codex", "1");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();
        assert!(cache.load("codex", "1", Utc::now()).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_missing_binary_is_unprobed() {
        let dir = tempfile::tempdir().unwrap();
        let cache = CapabilityCache::new(dir.path());
        let cli = CommandLine::parse("definitely-not-a-real-cli-9f2c").unwrap();
        let rec = probe("codex", &cli, &cache).await;
        assert!(rec.flags.is_empty());
    }
}
