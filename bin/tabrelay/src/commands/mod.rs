pub mod chat;
pub mod recover;
pub mod relay;
pub mod search;
pub mod status;
pub mod tabs;

use serde::Serialize;
use std::sync::Arc;
use tabrelay_client::{CommandChannel, PeerClient, SendPolicy};
use tabrelay_core::{Config, Paths, Product};
use tabrelay_orchestrator::{SessionRegistry, Supervisor};

use crate::WaitArgs;

/// Configuration resolved once per invocation, with CLI overrides applied.
pub struct Context {
    pub config: Config,
    pub paths: Paths,
    pub product: Product,
}

impl Context {
    pub fn load(port: Option<u16>, product: Product) -> anyhow::Result<Self> {
        let paths = Paths::new();
        let mut config = Config::load_or_default(&paths)?;
        if let Some(port) = port {
            config.relay.port = port;
        }
        Ok(Self { config, paths, product })
    }

    pub fn with_wait(mut self, wait: &WaitArgs) -> Self {
        if let Some(timeout) = wait.timeout {
            self.config.detector.timeout_secs = timeout;
        }
        if let Some(interval) = wait.poll_interval {
            self.config.detector.poll_interval_secs = interval.max(1);
        }
        self
    }

    /// Peer client over a fresh relay connection, starting the relay when
    /// it is down and auto-start is on.
    pub async fn peer(&self) -> anyhow::Result<PeerClient> {
        let channel = Arc::new(CommandChannel::from_config(&self.config)?);
        let peer = PeerClient::new(channel, self.product)
            .with_send_policy(SendPolicy::from_config(&self.config.supervisor));
        peer.ensure_ready().await?;
        Ok(peer)
    }

    pub async fn registry(&self) -> anyhow::Result<SessionRegistry> {
        Ok(SessionRegistry::load(self.paths.session_file(self.product)).await?)
    }

    pub async fn supervisor(&self) -> anyhow::Result<Supervisor> {
        Ok(Supervisor::from_config(self.peer().await?, &self.config))
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
