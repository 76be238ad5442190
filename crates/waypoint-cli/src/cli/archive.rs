//! `waypoint archive`: register a directory as a file group and archive it.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use console::style;
use uuid::Uuid;
use waypoint_core::archive::step::{ArchiveGroupStep, ArchiveRequest};
use waypoint_core::engine::cleanup::CleanupPolicy;
use waypoint_core::engine::registry::HandlerRegistry;
use waypoint_core::engine::subtask_handler::{SubtaskHandlerConfig, SubtaskTaskHandler};
use waypoint_infra::archive::zip_sink::ZipArchiver;
use waypoint_infra::scheduler::{Delivery, LocalScheduler};
use waypoint_types::group::{FileGroup, StoredFile};
use waypoint_types::task::Task;

use super::ArchiveArgs;
use crate::state::AppState;

const TASK_TYPE: &str = "group_archive";

pub async fn archive_group(state: &AppState, args: ArchiveArgs, json: bool) -> Result<()> {
    let mut archive_config = state.config.archive.clone();
    if let Some(parallel) = args.parallel {
        archive_config.max_parallel_files = parallel;
    }
    if args.no_manifest {
        archive_config.include_manifest = false;
    }

    let group = register_group(state, &args.group_dir).await?;
    let file_count = group.file_ids.len();

    let step = ArchiveGroupStep::new(
        Arc::clone(&state.groups),
        Arc::clone(&state.blobs),
        ZipArchiver::new(Arc::clone(&state.blobs)),
        archive_config,
    );
    let handler = SubtaskTaskHandler::new(
        SubtaskHandlerConfig::new(TASK_TYPE)
            .processor(step.into_processor()?)
            .cleanup_policy(CleanupPolicy::from(&state.config.cleanup)),
    )?;

    let mut registry = HandlerRegistry::new();
    registry.register(handler)?;
    let scheduler = LocalScheduler::new(registry).sleep_until_due(true);

    let request = ArchiveRequest {
        group_id: group.id,
        output_path: args.output.clone(),
    };
    let mut task = Task::new(TASK_TYPE, request.to_task_data());
    tracing::info!(task_id = %task.id, group_id = %group.id, files = file_count, "archive task created");

    let max_deliveries = state.config.cleanup.max_retry_attempts as usize + 3;
    match scheduler.run_to_completion(&mut task, max_deliveries).await? {
        Delivery::Completed => {}
        Delivery::Pending { run_at } => {
            bail!("archive task still pending after {max_deliveries} deliveries (next run at {run_at:?})")
        }
    }

    let result = &task.data["subtask_metadata"];
    let needs_resync = state
        .groups
        .group(&group.id)
        .map(|g| g.needs_resync)
        .unwrap_or(false);

    if json {
        let summary = serde_json::json!({
            "group_id": group.id,
            "archive_path": result["archive_path"],
            "archived_files": result["archived_files"],
            "missing_files": result["missing_files"],
            "bytes_written": result["bytes_written"],
            "needs_resync": needs_resync,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Archived '{}'",
        style("✓").green().bold(),
        style(&group.name).cyan()
    );
    println!();
    println!("  Output:   {}", state.data_dir.join(&args.output).display());
    println!("  Files:    {} of {}", result["archived_files"], file_count);
    println!("  Bytes:    {}", result["bytes_written"]);
    if needs_resync {
        println!(
            "  {} {} file(s) could not be read; group flagged for resync",
            style("!").yellow().bold(),
            result["missing_files"]
        );
    }
    println!();
    Ok(())
}

/// Register every regular file directly under `group_dir` as one group.
async fn register_group(state: &AppState, group_dir: &str) -> Result<FileGroup> {
    let group_dir = group_dir.trim_end_matches('/');
    let dir = state
        .blobs
        .resolve(group_dir)
        .with_context(|| format!("invalid group directory '{group_dir}'"))?;

    let mut entries = tokio::fs::read_dir(&dir)
        .await
        .with_context(|| format!("cannot read {}", dir.display()))?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            files.push((name.to_string(), meta.len()));
        }
    }
    files.sort();

    let group_name = group_dir.rsplit('/').next().unwrap_or(group_dir);
    let group = FileGroup::new(group_name);
    let group_id = group.id;
    state.groups.insert_group(group);

    for (name, size_bytes) in files {
        state.groups.insert_file(StoredFile {
            id: Uuid::now_v7(),
            group_id,
            blob_path: format!("{group_dir}/{name}"),
            name,
            size_bytes,
        })?;
    }

    state
        .groups
        .group(&group_id)
        .context("group vanished right after registration")
}
