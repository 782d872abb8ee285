//! Everything wired together over one connection.

use std::sync::Arc;

use serde_json::Value;

use crate::agent::AgentChannel;
use crate::config::ClientConfig;
use crate::error::SessionError;
use crate::mux::Multiplexer;
use crate::registry::{SessionRegistry, SessionView};
use crate::shell::ShellChannel;
use crate::transport::{Transport, WebSocketTransport};

#[derive(Clone)]
pub struct MuxClient {
    mux: Multiplexer,
    registry: SessionRegistry,
    agent: AgentChannel,
    shell: ShellChannel,
}

impl MuxClient {
    pub fn new<T: Transport>(
        transport: T,
        config: &ClientConfig,
        view: Arc<dyn SessionView>,
    ) -> Self {
        let mux = Multiplexer::new(transport, config.mux_config());
        let registry = SessionRegistry::new(mux.clone(), config.session.backoff, view);
        let agent = AgentChannel::new(
            registry.clone(),
            config.dedup_policy(),
            config.session.history_page_size,
        );
        let shell = ShellChannel::new(registry.clone());
        Self {
            mux,
            registry,
            agent,
            shell,
        }
    }

    /// Client for the WebSocket endpoint in `config.server.url`.
    pub fn websocket(config: &ClientConfig, view: Arc<dyn SessionView>) -> Self {
        Self::new(WebSocketTransport::new(config.server.url.clone()), config, view)
    }

    pub fn mux(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn agent(&self) -> &AgentChannel {
        &self.agent
    }

    pub fn shell(&self) -> &ShellChannel {
        &self.shell
    }

    /// A fresh `new-<millis>` key the server will replace with a durable one.
    pub fn temporary_key(&self) -> String {
        let mut stamp = chrono::Utc::now().timestamp_millis();
        loop {
            let key = format!("new-{stamp}");
            if !self.registry.has(&key) {
                return key;
            }
            stamp += 1;
        }
    }

    /// Open a new agent session in the foreground. Returns its temporary key.
    pub fn open_agent(&self, name: &str, params: Value) -> Result<String, SessionError> {
        let key = self.temporary_key();
        self.registry.open(&key, name);
        self.agent.connect(&key, params)?;
        Ok(key)
    }

    /// Open a new shell session in the foreground. Returns its temporary key.
    pub fn open_shell(&self, name: &str, cols: u16, rows: u16) -> Result<String, SessionError> {
        let key = self.temporary_key();
        self.registry.open(&key, name);
        self.shell.connect(&key, cols, rows)?;
        Ok(key)
    }

    pub fn shutdown(&self) {
        self.mux.shutdown();
    }
}
