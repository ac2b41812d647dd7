use workspace_host::{HostConfig, WorkspaceHost};

/// One reconciliation pass without starting the background loops.
pub async fn run_prune(config: HostConfig, json: bool) -> anyhow::Result<()> {
    let host = WorkspaceHost::open(config).await?;
    let report = host.prune().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if report.skipped {
        println!("Container engine unreachable, nothing was reconciled");
        return Ok(());
    }

    println!("Reconciliation complete");
    println!("  Orphan containers removed: {}", report.orphans_removed);
    println!("  Running workspaces errored: {}", report.running_errored);
    println!("  Interrupted launches:       {}", report.launches_recovered);
    println!("  Interrupted stops:          {}", report.stops_recovered);
    println!("  Ports reserved:             {}", report.ports_reserved);
    println!("  Ports released:             {}", report.ports_released);
    Ok(())
}
