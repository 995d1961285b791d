use super::{print_json, Context};

pub async fn run(ctx: &Context) -> anyhow::Result<()> {
    let peer = ctx.peer().await?;
    let tabs = peer.get_tabs().await?;
    print_json(&tabs)
}
