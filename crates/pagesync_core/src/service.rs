use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::changeset::{SyncUnit, build_full, build_incremental};
use crate::config::Settings;
use crate::error::SyncError;
use crate::protocol::{PageHandle, SessionLauncher, WikiLocation, WikiSession, replace_page};
use crate::response::SyncResponse;
use crate::scheduler::run_in_batches;
use crate::source::ContentSource;
use crate::webhook::{WebhookRequest, authenticate};

/// Entry point shared by the CLI and the HTTP server.
pub struct SyncService<L: SessionLauncher> {
    settings: Settings,
    launcher: L,
    source: Box<dyn ContentSource>,
    run_lock: Mutex<()>,
}

impl<L: SessionLauncher> SyncService<L> {
    pub fn new(settings: Settings, launcher: L, source: Box<dyn ContentSource>) -> Self {
        Self {
            settings,
            launcher,
            source,
            run_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Handle one webhook invocation end to end.
    pub async fn receive(&self, request: &WebhookRequest) -> SyncResponse {
        let outcome: Result<SyncResponse, SyncError> = async {
            let event = authenticate(request, &self.settings)?;
            let pinned = event
                .branch()
                .and_then(|branch| self.source.at_branch(branch));
            let source = pinned.as_deref().unwrap_or(self.source.as_ref());
            let units = build_incremental(&event, source).await?;
            self.publish(units).await
        }
        .await;
        respond(outcome)
    }

    /// Replace every page under both category roots.
    pub async fn sync_all(&self) -> SyncResponse {
        let outcome: Result<SyncResponse, SyncError> = async {
            let units = build_full(self.source.as_ref()).await?;
            self.publish(units).await
        }
        .await;
        respond(outcome)
    }

    /// [`SyncService::receive`] on its own task. The run goes on to
    /// completion even when the returned future is dropped.
    pub async fn receive_detached(self: Arc<Self>, request: WebhookRequest) -> SyncResponse
    where
        L: 'static,
    {
        let task = tokio::spawn(async move { self.receive(&request).await });
        match task.await {
            Ok(response) => response,
            Err(join_error) => respond(Err(SyncError::Automation(
                anyhow::Error::new(join_error).context("sync task ended abnormally"),
            ))),
        }
    }

    async fn publish(&self, units: Vec<SyncUnit>) -> Result<SyncResponse, SyncError> {
        if units.is_empty() {
            info!(source = %self.source.label(), "no applicable files");
            return Ok(SyncResponse::not_applicable());
        }
        let location = self.settings.wiki.location().map_err(SyncError::Config)?;

        let _running = self.run_lock.lock().await;
        info!(
            units = units.len(),
            batch_size = self.settings.batch_size.get(),
            project = location.project(),
            "starting sync"
        );
        let mut session = self
            .launcher
            .launch()
            .await
            .map_err(SyncError::Automation)?;
        let outcome = self.run_units(&session, &location, &units).await;
        let closed = session.close().await;

        match (outcome, closed) {
            (Ok(()), Ok(())) => Ok(SyncResponse::ok(summary_message(&units))),
            (Ok(()), Err(close_error)) => Err(SyncError::Automation(
                close_error.context("failed to close browser session"),
            )),
            (Err(run_error), closed) => {
                if let Err(close_error) = closed {
                    warn!(error = %format!("{close_error:#}"), "failed to close browser session");
                }
                Err(SyncError::Automation(run_error))
            }
        }
    }

    async fn run_units(
        &self,
        session: &L::Session,
        location: &WikiLocation,
        units: &[SyncUnit],
    ) -> Result<()> {
        run_in_batches(units.iter().collect(), self.settings.batch_size, |unit| {
            self.sync_unit(session, location, unit)
        })
        .await?;
        Ok(())
    }

    async fn sync_unit(
        &self,
        session: &L::Session,
        location: &WikiLocation,
        unit: &SyncUnit,
    ) -> Result<()> {
        info!(page = %unit.label(), path = %unit.source_path, "syncing page");
        let page = session
            .open_page()
            .await
            .with_context(|| format!("failed to open a tab for {}", unit.label()))?;
        let template = self.settings.templates.for_category(unit.category);
        let replaced = replace_page(&page, location, template, unit).await;
        if let Err(close_error) = page.close().await {
            warn!(page = %unit.label(), error = %format!("{close_error:#}"), "failed to close tab");
        }
        replaced?;
        info!(page = %unit.label(), "page synced");
        Ok(())
    }
}

/// `sync complete - <category>:<title>, ...` in unit order.
pub fn summary_message(units: &[SyncUnit]) -> String {
    let labels: Vec<String> = units.iter().map(SyncUnit::label).collect();
    format!("sync complete - {}", labels.join(", "))
}

fn respond(outcome: Result<SyncResponse, SyncError>) -> SyncResponse {
    match outcome {
        Ok(response) => {
            info!(status = response.status_code, message = %response.message, "run finished");
            response
        }
        Err(sync_error) => {
            let response = SyncResponse::from_error(&sync_error);
            if response.status_code >= 500 {
                error!(status = response.status_code, error = %response.message, "run failed");
            } else {
                warn!(status = response.status_code, error = %response.message, "request rejected");
            }
            response
        }
    }
}
