//! `waymark run` - Pursue one goal from the terminal.
//!
//! Streams task transitions as they happen and asks on stdin before any
//! step the workspace's autonomy level does not cover.

use std::io::{BufRead, Write};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use waymark_agent::TaskRequest;
use waymark_core::event::DomainEvent;
use waymark_core::task::Termination;

use super::{CliResult, runtime_for};

pub async fn run(workspace: String, goal: String, auto_approve: bool) -> CliResult {
    let (state, workspace_id) = runtime_for(&workspace).await?;
    let mut events = state.events.subscribe();

    let handle = state
        .orchestrator
        .spawn_task(TaskRequest::new(workspace_id, goal.clone()))
        .await?;
    let task_id = handle.task_id().to_string();

    println!("🧭 Task {task_id} in '{workspace}'");
    println!("   Goal: {goal}\n");

    let join = handle.join();
    tokio::pin!(join);
    let mut listening = true;

    let report = loop {
        tokio::select! {
            report = &mut join => break report?,
            event = events.recv(), if listening => match event {
                Ok(event) => handle_event(&state, &task_id, &event, auto_approve).await,
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "Event stream lagged"),
                Err(RecvError::Closed) => listening = false,
            },
        }
    };

    println!();
    match report.termination() {
        Some(Termination::Success) => println!("✅ Done after {} replan(s)", report.replans),
        Some(Termination::Cancelled) => println!(
            "⏹️  Cancelled: {}",
            report.reason.as_deref().unwrap_or("no reason given")
        ),
        _ => println!(
            "❌ Failed: {}",
            report.reason.as_deref().unwrap_or("no reason given")
        ),
    }
    println!("   Episodes recorded: {}", report.episodes.len());

    Ok(())
}

async fn handle_event(
    state: &waymark_gateway::AppState,
    task_id: &str,
    event: &Arc<DomainEvent>,
    auto_approve: bool,
) {
    match event.as_ref() {
        DomainEvent::TaskStateChanged {
            task_id: id,
            state: task_state,
            reason,
            ..
        } if id == task_id => match reason {
            Some(reason) => println!("  → {task_state}: {reason}"),
            None => println!("  → {task_state}"),
        },
        DomainEvent::ApprovalRequested {
            approval_id,
            task_id: id,
            step_description,
            required_level,
            ..
        } if id == task_id => {
            println!("  ⚠️  Approval needed ({required_level}): {step_description}");
            let approved = auto_approve || ask("     Allow this step? [y/N] ").await;
            if let Err(e) = state
                .orchestrator
                .resolve_approval(approval_id, approved)
                .await
            {
                println!("     Could not resolve approval: {e}");
            }
        }
        _ => {}
    }
}

/// Read a yes/no answer without blocking the runtime.
async fn ask(prompt: &str) -> bool {
    let prompt = prompt.to_string();
    tokio::task::spawn_blocking(move || {
        print!("{prompt}");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(_) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    })
    .await
    .unwrap_or(false)
}
