use serde_json::json;
use std::sync::Arc;
use tabrelay_client::{CommandChannel, PeerClient, RelayLauncher};
use tabrelay_core::Error;
use tracing::debug;

use super::{print_json, Context};

/// Report relay liveness, whether an extension is attached, and the
/// registered session tabs. Never starts the relay.
pub async fn run(ctx: &Context) -> anyhow::Result<()> {
    let launcher = RelayLauncher::from_config(&ctx.config)?;
    let running = launcher.is_running().await;

    let extension = if running {
        let channel = Arc::new(CommandChannel::new(
            ctx.config.relay.ws_url(),
            ctx.config.client.command_timeout(),
        ));
        let peer = PeerClient::new(channel, ctx.product);
        match peer.get_tabs().await {
            Ok(tabs) => json!({ "connected": true, "openTabs": tabs.len() }),
            Err(Error::PeerNotConnected) => json!({ "connected": false }),
            Err(e) => {
                debug!(error = %e, "Extension check failed");
                json!({ "connected": false, "error": e.to_string() })
            }
        }
    } else {
        json!({ "connected": false })
    };

    let registry = ctx.registry().await?;
    print_json(&json!({
        "relay": {
            "address": ctx.config.relay.ws_url(),
            "running": running,
        },
        "extension": extension,
        "product": ctx.product,
        "sessionFile": registry.path(),
        "sessions": registry.tabs(),
    }))
}
