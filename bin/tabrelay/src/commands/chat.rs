use std::path::PathBuf;
use tabrelay_orchestrator::ChatOptions;

use super::{print_json, Context};

pub async fn run(
    ctx: Context,
    messages: &[String],
    tab: Option<i64>,
    topic: Option<&str>,
    attachments: Vec<PathBuf>,
    wait: bool,
) -> anyhow::Result<()> {
    let supervisor = ctx.supervisor().await?;
    let mut registry = ctx.registry().await?;

    let tab = match topic {
        Some(topic) => match registry.find_by_topic(topic) {
            Some(entry) => Some(entry.id),
            None => anyhow::bail!("no session tab saved under topic '{}'", topic),
        },
        None => tab,
    };

    let opts = ChatOptions { wait, attachments };
    let results = supervisor.chat(messages, tab, &opts, &mut registry).await?;
    print_json(&results)
}
