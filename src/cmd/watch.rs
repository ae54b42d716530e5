//! Continuous autosave of a form file (`draftsave watch`).
//!
//! The file is polled for changes and each change marks the draft dirty;
//! the agent's timer does the saving. Lines typed on stdin are forwarded
//! as host events (`offline`, `online`, `hidden`, `visible`, `unload`),
//! plus `save` and `status`. Ctrl-C flushes through the unload beacon and
//! exits.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

use draftsave::agent::{AgentDeps, DraftAgent};
use draftsave::config::DraftsaveToml;
use draftsave::events::{HostEvent, HostSignals};
use draftsave::form::JsonFileForm;
use draftsave::notify::Callbacks;
use draftsave::state::Payload;

use super::save::{build_transport, effective_options, require_document_id};
use crate::Cli;

/// How long outstanding unload beacons get on exit.
const BEACON_GRACE: Duration = Duration::from_secs(5);

pub struct WatchArgs<'a> {
    pub document_id: &'a str,
    pub file: &'a Path,
    pub interval_ms: Option<u64>,
    pub poll_ms: u64,
    pub start_offline: bool,
}

pub async fn cmd_watch(cli: &Cli, settings: &DraftsaveToml, args: WatchArgs<'_>) -> Result<()> {
    let document_id = require_document_id(args.document_id)?;
    let mut options = effective_options(cli, settings);
    if let Some(ms) = args.interval_ms {
        options = options.with_save_interval(Duration::from_millis(ms));
    }

    let transport = Arc::new(build_transport(settings, &options)?);
    let signals = Arc::new(HostSignals::new(!args.start_offline));
    let form = JsonFileForm::new(args.file);

    let callbacks = Callbacks::default()
        .with_on_status(|status| println!("[{}]", status))
        .with_on_save_success(|receipt| match receipt.version {
            Some(version) => println!("Saved (version {})", version),
            None => println!("Saved"),
        })
        .with_on_save_error(|error| eprintln!("Save failed, draft kept locally: {}", error))
        .with_on_offline(|| println!("Offline. Changes will be saved when back online."))
        .with_on_online(|| println!("Back online."));

    let deps = AgentDeps::new(transport.clone())
        .with_form_source(Arc::new(form.clone()))
        .with_events(signals.clone())
        .with_callbacks(callbacks);
    let agent = DraftAgent::configure(document_id, options, deps);

    println!(
        "Watching {} for {} (saving every {}s). Ctrl-C to stop.",
        args.file.display(),
        document_id,
        agent.options().save_interval().as_secs_f64()
    );

    let mut last_seen: Option<Payload> = form.read().ok();
    let mut poll = tokio::time::interval(Duration::from_millis(args.poll_ms.max(50)));
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = poll.tick() => {
                let current = form.read().ok();
                if current.is_some() && current != last_seen {
                    agent.mark_dirty(current.clone());
                    last_seen = current;
                }
            }
            line = stdin.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => handle_command(&agent, &signals, line.trim()).await,
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        tracing::warn!(error = %e, "stdin closed");
                        stdin_open = false;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    agent.handle_event(HostEvent::Unload).await;
    if !transport.wait_for_beacons(BEACON_GRACE).await {
        eprintln!("Unload beacon still in flight after {}s; exiting anyway.", BEACON_GRACE.as_secs());
    }
    agent.destroy();
    Ok(())
}

async fn handle_command(agent: &DraftAgent, signals: &HostSignals, line: &str) {
    match line {
        "" => {}
        "save" => {
            let outcome = agent.force_save().await;
            tracing::debug!(?outcome, "manual save");
        }
        "status" => {
            let state = agent.status();
            println!(
                "phase={:?} dirty={} online={} saves={} last_save={}",
                agent.phase(),
                state.is_dirty,
                state.is_online,
                state.save_count,
                state
                    .last_save_time
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string())
            );
        }
        other => match other.parse::<HostEvent>() {
            Ok(event) => {
                signals.emit(event);
            }
            Err(e) => eprintln!("{}. Other commands: save, status", e),
        },
    }
}
