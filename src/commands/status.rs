use workspace_host::{registry::WorkspaceRegistry, HostConfig, Workspace};

pub async fn run_status(
    config: &HostConfig,
    workspace: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let registry = WorkspaceRegistry::open(&config.state_dir).await?;
    let workspaces = match workspace {
        Some(id) => {
            workspace_host::workspace::validate_workspace_id(id)?;
            vec![registry.require(id).await?]
        }
        None => registry.list().await?,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&workspaces)?);
        return Ok(());
    }

    println!("Workspaces:");
    println!("{:-<90}", "");
    if workspaces.is_empty() {
        println!("  No workspaces registered");
        return Ok(());
    }

    println!(
        "  {:<28} {:<14} {:>7} {:>6}  {}",
        "ID", "STATE", "VERSION", "PORT", "MESSAGE"
    );
    for ws in &workspaces {
        println!("{}", format_row(ws));
    }

    Ok(())
}

pub async fn run_history(config: &HostConfig, workspace: &str, json: bool) -> anyhow::Result<()> {
    workspace_host::workspace::validate_workspace_id(workspace)?;
    let registry = WorkspaceRegistry::open(&config.state_dir).await?;
    let entries = registry.history(workspace).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No recorded transitions for '{}'", workspace);
        return Ok(());
    }

    println!("History of '{}':", workspace);
    for entry in &entries {
        println!(
            "  {}  v{:<4} {:<14} {}",
            entry.at.format("%Y-%m-%d %H:%M:%S"),
            entry.version,
            entry.state.as_str(),
            entry.message
        );
    }
    Ok(())
}

fn format_row(ws: &Workspace) -> String {
    let port = ws
        .assigned_port
        .map(|p| p.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "  {:<28} {:<14} {:>7} {:>6}  {}",
        ws.id,
        ws.state.as_str(),
        ws.version,
        port,
        ws.message
    )
}
