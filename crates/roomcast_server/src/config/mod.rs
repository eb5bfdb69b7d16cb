#![forbid(unsafe_code)]

use core::fmt;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

/// A string that must not leak through `Debug`/`Display`.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

/// Default config path: `~/.roomcast/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".roomcast").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
#[allow(dead_code)]
pub fn load_server_config() -> anyhow::Result<ServerConfig> {
	let path = default_config_path()?;
	load_server_config_from_path(&path)
}

/// Same as `load_server_config` but with an explicit config path.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg)?;

	apply_env_overrides(&mut cfg)?;

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone)]
pub struct ServerConfig {
	/// Listen address.
	pub bind: SocketAddr,
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub persistence: PersistenceSettings,
	pub limits: LimitSettings,
}

/// Transport and observability settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Maximum number of queued outbound frames per connection.
	pub subscriber_queue_capacity: usize,
	/// Maximum inbound frame size in bytes.
	pub max_frame_bytes: usize,
}

impl Default for ServerSettings {
	fn default() -> Self {
		Self {
			metrics_bind: None,
			subscriber_queue_capacity: 1024,
			max_frame_bytes: roomcast_protocol::DEFAULT_MAX_FRAME_SIZE,
		}
	}
}

/// Token auth settings.
#[derive(Debug, Clone, Default)]
pub struct AuthSettings {
	/// HMAC secret for stateless access tokens. Required to serve.
	pub hmac_secret: Option<SecretString>,
	/// Issued-token lifetime.
	pub token_ttl: Duration,
}

/// Persistence settings.
#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// SQLite database URL.
	pub database_url: String,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			database_url: "sqlite:roomcast.db?mode=rwc".to_string(),
		}
	}
}

/// Input validation bounds.
#[derive(Debug, Clone)]
pub struct LimitSettings {
	/// Maximum message text length in characters.
	pub max_message_chars: usize,
}

impl Default for LimitSettings {
	fn default() -> Self {
		Self { max_message_chars: 500 }
	}
}

const DEFAULT_BIND: &str = "127.0.0.1:8203";
const DEFAULT_TOKEN_TTL_SECS: u64 = 86_400;

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	bind: Option<String>,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,

	#[serde(default)]
	limits: FileLimitSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	subscriber_queue_capacity: Option<usize>,
	max_frame_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	hmac_secret: Option<String>,
	token_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLimitSettings {
	max_message_chars: Option<usize>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> anyhow::Result<Self> {
		let bind = parse_bind(file.bind.as_deref().unwrap_or(DEFAULT_BIND))?;

		let defaults = ServerSettings::default();
		let server = ServerSettings {
			metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
			subscriber_queue_capacity: file
				.server
				.subscriber_queue_capacity
				.filter(|v| *v > 0)
				.unwrap_or(defaults.subscriber_queue_capacity),
			max_frame_bytes: file
				.server
				.max_frame_bytes
				.filter(|v| *v > 0)
				.unwrap_or(defaults.max_frame_bytes),
		};

		let auth = AuthSettings {
			hmac_secret: file
				.auth
				.hmac_secret
				.filter(|s| !s.trim().is_empty())
				.map(SecretString::new),
			token_ttl: Duration::from_secs(file.auth.token_ttl_secs.filter(|v| *v > 0).unwrap_or(DEFAULT_TOKEN_TTL_SECS)),
		};

		let persistence = PersistenceSettings {
			database_url: file
				.persistence
				.database_url
				.filter(|s| !s.trim().is_empty())
				.unwrap_or_else(|| PersistenceSettings::default().database_url),
		};

		let limits = LimitSettings {
			max_message_chars: file
				.limits
				.max_message_chars
				.filter(|v| *v > 0)
				.unwrap_or_else(|| LimitSettings::default().max_message_chars),
		};

		Ok(Self {
			bind,
			server,
			auth,
			persistence,
			limits,
		})
	}
}

fn parse_bind(s: &str) -> anyhow::Result<SocketAddr> {
	s.trim()
		.parse::<SocketAddr>()
		.map_err(|e| anyhow!("invalid bind address {s:?} (expected host:port): {e}"))
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) -> anyhow::Result<()> {
	if let Ok(v) = std::env::var("ROOMCAST_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.bind = parse_bind(&v)?;
			info!("server config: bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("ROOMCAST_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("ROOMCAST_SUBSCRIBER_QUEUE_CAPACITY")
		&& let Ok(capacity) = v.trim().parse::<usize>()
		&& capacity > 0
	{
		cfg.server.subscriber_queue_capacity = capacity;
		info!(capacity, "server config: subscriber_queue_capacity overridden by env");
	}

	if let Ok(v) = std::env::var("ROOMCAST_MAX_FRAME_BYTES")
		&& let Ok(max) = v.trim().parse::<usize>()
		&& max > 0
	{
		cfg.server.max_frame_bytes = max;
		info!(max, "server config: max_frame_bytes overridden by env");
	}

	if let Ok(v) = std::env::var("ROOMCAST_AUTH_HMAC_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.auth.hmac_secret = Some(SecretString::new(v));
			info!("server auth: hmac_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("ROOMCAST_TOKEN_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.auth.token_ttl = Duration::from_secs(secs);
		info!(secs, "server auth: token_ttl overridden by env");
	}

	if let Ok(v) = std::env::var("ROOMCAST_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = v;
			info!("persistence: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("ROOMCAST_MAX_MESSAGE_CHARS")
		&& let Ok(max) = v.trim().parse::<usize>()
		&& max > 0
	{
		cfg.limits.max_message_chars = max;
		info!(max, "limits: max_message_chars overridden by env");
	}

	Ok(())
}
