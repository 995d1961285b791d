use tabrelay_orchestrator::TaskOptions;
use tracing::info;

use super::{print_json, Context};
use crate::SetupArgs;

fn task_options(setup: &SetupArgs, close_tabs: bool) -> TaskOptions {
    TaskOptions {
        model: setup.model.clone(),
        thinking: setup.thinking.clone(),
        mode: setup.mode.clone(),
        attachments: setup.files.clone(),
        close_tabs,
    }
}

/// Parallel search: one new tab per question.
pub async fn run(ctx: Context, questions: &[String], setup: &SetupArgs, close_tabs: bool) -> anyhow::Result<()> {
    let supervisor = ctx.supervisor().await?;
    let mut registry = ctx.registry().await?;
    let opts = task_options(setup, close_tabs);

    let results = supervisor.parallel_search(questions, &opts, &mut registry).await?;
    let ok = results.iter().filter(|r| r.success).count();
    info!(ok, total = results.len(), "Search finished");
    print_json(&results)
}

/// Sequential search in one tab.
pub async fn run_single(
    ctx: Context,
    questions: &[String],
    tab: Option<i64>,
    setup: &SetupArgs,
    close_tabs: bool,
) -> anyhow::Result<()> {
    let supervisor = ctx.supervisor().await?;
    let mut registry = ctx.registry().await?;
    let opts = task_options(setup, close_tabs);

    let results = supervisor
        .single_session_search(questions, &opts, tab, &mut registry)
        .await?;
    print_json(&results)
}
