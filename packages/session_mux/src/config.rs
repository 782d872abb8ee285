use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::dedup::DedupPolicy;
use crate::frame::Encoding;
use crate::mux::MuxConfig;

// =============================================================================
// Client config (figment-deserialized from defaults / mux.toml / env vars)
// =============================================================================
//
//   mux.toml:        [transport]
//                    max_retries = 5
//
//   env var:         MUX_TRANSPORT__MAX_RETRIES=5   (double underscore = nesting)

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
}

/// Endpoint and credentials (`[server]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub encoding: Encoding,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            token: String::new(),
            encoding: Encoding::Json,
        }
    }
}

/// Socket reconnect policy and heartbeat (`[transport]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(flatten)]
    pub backoff: BackoffPolicy,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::transport(),
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

/// Per-session reconnect policy and history paging (`[session]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(flatten)]
    pub backoff: BackoffPolicy,
    #[serde(default = "default_history_page_size")]
    pub history_page_size: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::session(),
            history_page_size: default_history_page_size(),
        }
    }
}

/// Duplicate suppression (`[dedup]`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_lookback")]
    pub lookback: usize,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            lookback: default_lookback(),
            window_secs: default_window_secs(),
        }
    }
}

fn default_url() -> String {
    "ws://127.0.0.1:8080/ws".to_string()
}
fn default_heartbeat_secs() -> u64 {
    30
}
fn default_history_page_size() -> u32 {
    50
}
fn default_lookback() -> usize {
    50
}
fn default_window_secs() -> u64 {
    60
}

impl ClientConfig {
    pub fn mux_config(&self) -> MuxConfig {
        MuxConfig {
            token: self.server.token.clone(),
            encoding: self.server.encoding,
            backoff: self.transport.backoff,
            heartbeat: Duration::from_secs(self.transport.heartbeat_secs.max(1)),
        }
    }

    pub fn dedup_policy(&self) -> DedupPolicy {
        DedupPolicy {
            lookback: self.dedup.lookback,
            window: Duration::from_secs(self.dedup.window_secs),
        }
    }
}

/// Build a figment that layers: defaults → mux.toml → MUX_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `MUX_SERVER__TOKEN=abc`  →  `server.token = "abc"`
///   `MUX_SESSION__MAX_RETRIES=3`  →  `session.max_retries = 3`
pub fn figment(config_file: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(ClientConfig::default()))
        .merge(Toml::file(config_file))
        .merge(Env::prefixed("MUX_").split("__"))
}

/// Resolve the configuration. A missing file is not an error.
pub fn load_config(config_file: &Path) -> Result<ClientConfig, figment::Error> {
    figment(config_file).extract()
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_defaults() {
        let c = ClientConfig::default();
        assert_eq!(c.transport.backoff, BackoffPolicy::transport());
        assert_eq!(c.transport.heartbeat_secs, 30);
        assert_eq!(c.session.backoff, BackoffPolicy::session());
        assert_eq!(c.session.history_page_size, 50);
        assert_eq!(c.dedup_policy(), DedupPolicy::default());
        assert_eq!(c.server.encoding, Encoding::Json);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let c = load_config(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(c, ClientConfig::default());
    }

    // ── layering ────────────────────────────────────────────────────────

    #[test]
    fn test_file_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "mux.toml",
                r#"
                [server]
                url = "wss://example.test/ws"
                token = "t0k"
                encoding = "cbor"

                [session]
                base_delay_ms = 250
                max_retries = 4
                "#,
            )?;
            let c = load_config(Path::new("mux.toml"))?;
            assert_eq!(c.server.url, "wss://example.test/ws");
            assert_eq!(c.server.encoding, Encoding::Cbor);
            assert_eq!(c.session.backoff.base, Duration::from_millis(250));
            assert_eq!(c.session.backoff.max_retries, 4);
            // untouched fields keep their preset
            assert_eq!(c.session.backoff.max, Duration::from_millis(10_000));
            assert_eq!(c.mux_config().token, "t0k");
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("mux.toml", "[transport]\nmax_retries = 7\n")?;
            jail.set_env("MUX_TRANSPORT__MAX_RETRIES", "3");
            jail.set_env("MUX_DEDUP__WINDOW_SECS", "5");
            let c = load_config(Path::new("mux.toml"))?;
            assert_eq!(c.transport.backoff.max_retries, 3);
            assert_eq!(c.dedup_policy().window, Duration::from_secs(5));
            Ok(())
        });
    }

    #[test]
    fn test_roundtrips_through_toml() {
        let c = ClientConfig::default();
        let text = toml::to_string(&c).unwrap();
        assert!(text.contains("base_delay_ms = 100"));
        let back: ClientConfig = toml::from_str(&text).unwrap();
        assert_eq!(back, c);
    }
}
