use std::path::PathBuf;
use tabrelay_orchestrator::RecoverTarget;

use super::{print_json, Context};

pub async fn run(ctx: &Context, tab: Option<i64>, url: Option<String>, files: &[PathBuf]) -> anyhow::Result<()> {
    let target = match (tab, url) {
        (Some(id), _) => RecoverTarget::Tab(id),
        (None, Some(url)) => RecoverTarget::Url(url),
        (None, None) => anyhow::bail!("recover needs --tab or --url"),
    };

    let supervisor = ctx.supervisor().await?;
    let mut registry = ctx.registry().await?;
    let result = supervisor.recover(target, files, &mut registry).await;
    print_json(&result)
}
