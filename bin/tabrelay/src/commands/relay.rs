use tabrelay_relay::RelayServer;
use tracing::info;

use super::Context;

pub async fn run(ctx: &Context) -> anyhow::Result<()> {
    let server = RelayServer::new(ctx.config.relay.clone());

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down relay");
        }
    }

    Ok(())
}
