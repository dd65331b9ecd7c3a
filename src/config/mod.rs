//! Canvas host configuration.
//!
//! Priority (highest to lowest): CLI / env var > TOML file > built-in
//! default. The TOML file lives at `{data_dir}/config.toml`; all fields are
//! optional overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

use crate::limiter::RateLimitConfig;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 4310;
const DEFAULT_NAMESPACE: &str = "/__nexus__";
const DEFAULT_ROLE: &str = "viewer";

// ─── TOML config file ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TokenToml {
    /// HMAC secret; empty disables token verification.
    pub secret: Option<String>,
    /// Minted-token lifetime in seconds; 0 = no expiry.
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ActionToml {
    /// Role assumed when a request carries no token role.
    pub default_role: Option<String>,
    pub rate_limit: Option<RateLimitConfig>,
}

/// `{data_dir}/config.toml` — all fields are optional overrides.
#[derive(Deserialize, Default)]
struct TomlConfig {
    host: Option<String>,
    port: Option<u16>,
    /// Canvas static root.
    root: Option<PathBuf>,
    /// Route namespace prefix (default: /__nexus__).
    namespace: Option<String>,
    /// Auxiliary UI root (optional).
    a2ui_root: Option<PathBuf>,
    live_reload: Option<bool>,
    inject_client: Option<bool>,
    auto_index: Option<bool>,
    /// Scheme override for minted URLs (else X-Forwarded-Proto, else http).
    public_scheme: Option<String>,
    /// Host override for minted URLs.
    public_host: Option<String>,
    /// Log level filter string, e.g. "debug", "info,canvasd=trace".
    log: Option<String>,
    tokens: Option<TokenToml>,
    actions: Option<ActionToml>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── Resolved config ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub secret: String,
    pub ttl: Duration,
}

impl TokenConfig {
    /// Token verification is on iff a secret is configured.
    pub fn enabled(&self) -> bool {
        !self.secret.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ActionConfig {
    pub default_role: String,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone)]
pub struct CanvasConfig {
    pub host: String,
    pub port: u16,
    /// Canvas static root (required).
    pub root: PathBuf,
    /// Route namespace prefix, normalized to a single leading slash and no
    /// trailing slash.
    pub namespace: String,
    pub a2ui_root: Option<PathBuf>,
    pub live_reload: bool,
    pub inject_client: bool,
    pub auto_index: bool,
    pub public_scheme: Option<String>,
    pub public_host: Option<String>,
    pub data_dir: PathBuf,
    pub log: String,
    pub tokens: TokenConfig,
    pub actions: ActionConfig,
}

/// CLI/env overrides as parsed by clap; `None` falls through to TOML.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub root: Option<PathBuf>,
    pub namespace: Option<String>,
    pub a2ui_root: Option<PathBuf>,
    pub live_reload: Option<bool>,
    pub log: Option<String>,
    pub token_secret: Option<String>,
    pub token_ttl_secs: Option<u64>,
}

impl CanvasConfig {
    /// Layer CLI/env over `{data_dir}/config.toml` over defaults.
    ///
    /// Fails when no canvas root is configured anywhere.
    pub fn load(data_dir: PathBuf, cli: CliOverrides) -> crate::error::Result<Self> {
        let toml = load_toml(&data_dir).unwrap_or_default();
        let tokens_toml = toml.tokens.unwrap_or_default();
        let actions_toml = toml.actions.unwrap_or_default();

        let root = cli
            .root
            .or(toml.root)
            .ok_or(crate::error::CanvasError::invalid(
                "canvas root is required (--root or config.toml `root`)",
            ))?;

        let live_reload = cli.live_reload.or(toml.live_reload).unwrap_or(false);

        Ok(Self {
            host: cli
                .host
                .or(toml.host)
                .unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: cli.port.or(toml.port).unwrap_or(DEFAULT_PORT),
            root,
            namespace: normalize_namespace(
                &cli.namespace
                    .or(toml.namespace)
                    .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            ),
            a2ui_root: cli.a2ui_root.or(toml.a2ui_root),
            live_reload,
            // Client injection follows live_reload unless pinned explicitly.
            inject_client: toml.inject_client.unwrap_or(live_reload),
            auto_index: toml.auto_index.unwrap_or(true),
            public_scheme: toml.public_scheme,
            public_host: toml.public_host,
            log: cli.log.or(toml.log).unwrap_or_else(|| "info".to_string()),
            tokens: TokenConfig {
                secret: cli
                    .token_secret
                    .or(tokens_toml.secret)
                    .unwrap_or_default(),
                ttl: Duration::from_secs(
                    cli.token_ttl_secs.or(tokens_toml.ttl_secs).unwrap_or(0),
                ),
            },
            actions: ActionConfig {
                default_role: actions_toml
                    .default_role
                    .unwrap_or_else(|| DEFAULT_ROLE.to_string()),
                rate_limit: actions_toml.rate_limit.unwrap_or_default(),
            },
            data_dir,
        })
    }
}

/// Ensure a single leading `/` and no trailing `/` (`""` stays the empty
/// prefix meaning routes mount at the server root).
fn normalize_namespace(ns: &str) -> String {
    let trimmed = ns.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}
