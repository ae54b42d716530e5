//! One-shot save (`draftsave save`).

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;

use draftsave::agent::{AgentDeps, DraftAgent, SaveOutcome};
use draftsave::config::{AgentOptions, DraftsaveToml};
use draftsave::errors::DraftError;
use draftsave::form::JsonFileForm;
use draftsave::notify::Callbacks;
use draftsave::transport::{EnvToken, HttpTransport, SaveReceipt};

use crate::Cli;

/// Agent options with the CLI endpoint override applied on top of file and env.
pub(crate) fn effective_options(cli: &Cli, settings: &DraftsaveToml) -> AgentOptions {
    let endpoint = cli
        .endpoint
        .clone()
        .unwrap_or_else(|| settings.endpoint_base());
    settings.autosave.clone().with_endpoint_base(endpoint)
}

/// The agent runs inert without an id; the CLI refuses instead.
pub(crate) fn require_document_id(document_id: &str) -> Result<&str> {
    let trimmed = document_id.trim();
    if trimmed.is_empty() {
        return Err(DraftError::MissingDocumentId.into());
    }
    Ok(trimmed)
}

pub(crate) fn build_transport(
    settings: &DraftsaveToml,
    options: &AgentOptions,
) -> Result<HttpTransport> {
    let transport = match options.request_timeout() {
        Some(timeout) => HttpTransport::with_timeout(&options.endpoint_base, timeout)
            .context("Failed to build HTTP client")?,
        None => HttpTransport::new(&options.endpoint_base),
    };
    Ok(transport.with_token_source(EnvToken(settings.auth.token_env.clone())))
}

pub async fn cmd_save(
    cli: &Cli,
    settings: &DraftsaveToml,
    document_id: &str,
    file: &Path,
) -> Result<()> {
    let document_id = require_document_id(document_id)?;
    let form = JsonFileForm::new(file);
    let snapshot = form.read()?;
    if snapshot.is_empty() {
        anyhow::bail!("Form file {} is an empty object; nothing to save", file.display());
    }

    let options = effective_options(cli, settings);
    let transport = build_transport(settings, &options)?;

    // Retries finish after force_save returns; the terminal result arrives here.
    let (tx, mut rx) = mpsc::unbounded_channel::<Result<SaveReceipt, String>>();
    let success_tx = tx.clone();
    let callbacks = Callbacks::default()
        .with_on_save_success(move |receipt| {
            let _ = success_tx.send(Ok(receipt.clone()));
        })
        .with_on_save_error(move |error| {
            let _ = tx.send(Err(error.to_string()));
        });

    let deps = AgentDeps::new(Arc::new(transport))
        .with_form_source(Arc::new(form))
        .with_callbacks(callbacks);
    let agent = DraftAgent::configure(document_id, options.with_enabled(true), deps);

    let result = match agent.force_save().await {
        SaveOutcome::Saved(receipt) => Ok(receipt),
        SaveOutcome::RetryScheduled { .. } | SaveOutcome::Failed => rx
            .recv()
            .await
            .unwrap_or_else(|| Err("autosave agent stopped".to_string())),
        SaveOutcome::Deferred => Err("offline; draft not sent".to_string()),
        SaveOutcome::Skipped(reason) => Err(format!("nothing was sent ({:?})", reason)),
    };
    agent.destroy();

    match result {
        Ok(receipt) => {
            print_receipt(document_id, &receipt);
            Ok(())
        }
        Err(message) => anyhow::bail!("Save failed for {}: {}", document_id, message),
    }
}

fn print_receipt(document_id: &str, receipt: &SaveReceipt) {
    println!("Saved draft for {}", document_id);
    if let Some(version) = receipt.version {
        println!("  version = {}", version);
    }
    if let Some(count) = receipt.auto_save_count {
        println!("  auto_save_count = {}", count);
    }
    if let Some(at) = &receipt.last_auto_save {
        println!("  last_auto_save = {}", at);
    }
    if let Some(message) = &receipt.message {
        println!("  {}", message);
    }
}
