//! Concrete review backends and their wiring into the registries.

pub mod auth;
pub mod capabilities;
pub mod codex;
pub mod curl;
pub mod hounfour;
pub mod process;
pub mod workspace;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use review_coordination::routes::{AvailabilityProbes, BackendRegistry};
use tracing::info;

use crate::config::ReviewConfig;
use auth::{credential_from_env, OPENAI_KEY_VARS};
use capabilities::{CapabilityCache, CapabilityRecord};
use codex::CodexBackend;
use curl::CurlBackend;
use hounfour::HounfourBackend;
use process::CommandLine;

/// Whether a configured command resolves to something runnable.
pub fn command_available(command: &str) -> bool {
    CommandLine::parse(command).is_some_and(|cl| which::which(&cl.program).is_ok())
}

/// Registered backends plus the live probes behind the availability
/// conditions.
pub struct BackendSet {
    pub registry: BackendRegistry,
    pub probes: AvailabilityProbes,
}

/// Register the three built-in backends.
///
/// The agent CLI is only probed for flags when it is installed.
pub async fn build_backends(config: &ReviewConfig, project_root: &Path, tool_access: bool) -> Result<BackendSet> {
    let settings = &config.backends;

    let hounfour = Arc::new(HounfourBackend::new(project_root, &settings.hounfour));
    let codex_installed = command_available(&settings.codex.command);
    let codex = if codex_installed {
        let cache = CapabilityCache::new(config.capability_cache_dir());
        CodexBackend::detect(&settings.codex.command, &cache, project_root, tool_access).await
    } else {
        CodexBackend::new(
            &settings.codex.command,
            CapabilityRecord::unprobed(codex::NAME),
            project_root,
            tool_access,
        )
    };
    let curl = CurlBackend::new(&settings.curl.base_url);

    info!(
        hounfour = hounfour.is_available(),
        codex = codex_installed,
        api_key = credential_from_env(OPENAI_KEY_VARS).is_some(),
        "Backend availability"
    );

    let hounfour_probe = Arc::clone(&hounfour);
    let probes = AvailabilityProbes {
        hounfour: Arc::new(move || hounfour_probe.is_available()),
        codex: Arc::new(move || codex_installed),
        api_key: Arc::new(|| credential_from_env(OPENAI_KEY_VARS).is_some()),
    };

    let mut registry = BackendRegistry::new();
    registry.register(hounfour)?;
    registry.register(Arc::new(codex))?;
    registry.register(Arc::new(curl))?;

    Ok(BackendSet { registry, probes })
}
