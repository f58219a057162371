//! One configured connection to a server, with its shared state.

use crate::api::OsmApi;
use crate::auth::CredentialsProvider;
use crate::cache::ChangesetCache;
use crate::config::TransferConfig;
use crate::connection::OsmConnection;
use crate::error::TransferResult;
use crate::http::{HttpClient, UreqClient};
use crate::network_log::NetworkErrorLog;
use crate::offline::{OfflineGate, OnlineResource};
use crate::progress::{NullProgress, ProgressSink};
use crate::reconcile::{ChangesetFetcher, ReconciliationTask, TickOutcome};
use crate::strategy::UploadStrategySpec;
use crate::upload::{UploadFailure, UploadReport, UploadTask};
use osmsync_protocol::{Changeset, Edit};
use std::sync::Arc;
use tracing::info;

/// Wires the connection, API client, changeset cache and reconciliation
/// task for one server.
pub struct TransferSession {
    config: TransferConfig,
    gate: Arc<OfflineGate>,
    errors: Arc<NetworkErrorLog>,
    cache: Arc<ChangesetCache>,
    api: Arc<OsmApi>,
    reconciliation: ReconciliationTask,
}

impl TransferSession {
    /// Creates a session over an HTTP client.
    ///
    /// Reconciliation is not started; see [`start_reconciliation`](Self::start_reconciliation).
    pub fn new(
        config: TransferConfig,
        client: Arc<dyn HttpClient>,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> TransferResult<Self> {
        let gate = Arc::new(OfflineGate::new());
        gate.set_base_url(OnlineResource::OsmApi, &config.server_url)?;
        gate.set_base_url(OnlineResource::Website, &config.website_url)?;
        for resource in &config.offline_resources {
            gate.set_offline(*resource);
        }

        let errors = Arc::new(NetworkErrorLog::new());
        let connect = || -> TransferResult<OsmConnection> {
            Ok(OsmConnection::new(
                &config.server_url,
                config.auth_method,
                Arc::clone(&client),
                Arc::clone(&gate),
                Arc::clone(&credentials),
                Arc::clone(&errors),
            )?
            .with_cancel_grace(config.cancel_grace))
        };
        let api = Arc::new(OsmApi::new(Arc::new(connect()?)));
        // Background fetches get their own connection so cancelling a
        // foreground transfer leaves reconciliation alone.
        let background = Arc::new(OsmApi::new(Arc::new(connect()?)));
        let cache = Arc::new(ChangesetCache::new());
        let fetcher: Arc<dyn ChangesetFetcher> = background;
        let reconciliation =
            ReconciliationTask::new(Arc::clone(&cache), fetcher, config.reconciliation);

        info!(
            server = %config.server_url,
            auth = %config.auth_method,
            strategy = %config.upload.strategy,
            "transfer session created"
        );
        Ok(Self {
            config,
            gate,
            errors,
            cache,
            api,
            reconciliation,
        })
    }

    /// Creates a session over a blocking ureq agent.
    pub fn with_ureq(
        config: TransferConfig,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> TransferResult<Self> {
        let client = Arc::new(UreqClient::new(config.timeout));
        Self::new(config, client, credentials)
    }

    /// Configuration in effect.
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// API client.
    pub fn api(&self) -> &OsmApi {
        &self.api
    }

    /// Underlying connection.
    pub fn connection(&self) -> &OsmConnection {
        self.api.connection()
    }

    /// Offline gate shared by every request.
    pub fn offline_gate(&self) -> &OfflineGate {
        &self.gate
    }

    /// Per-URL log of failed requests.
    pub fn network_errors(&self) -> &NetworkErrorLog {
        &self.errors
    }

    /// Changeset cache.
    pub fn cache(&self) -> &ChangesetCache {
        &self.cache
    }

    /// Reconciliation task.
    pub fn reconciliation(&self) -> &ReconciliationTask {
        &self.reconciliation
    }

    /// Starts background reconciliation. Returns false if already running or disabled.
    pub fn start_reconciliation(&self) -> bool {
        self.reconciliation.start()
    }

    /// Reconciles the cache once, now.
    pub fn reconcile_now(&self) -> TransferResult<TickOutcome> {
        self.reconciliation.run_once()
    }

    /// Uploads edits with the configured strategy.
    pub fn upload(&self, changeset: Changeset, edits: Vec<Edit>) -> Result<UploadReport, UploadFailure> {
        self.upload_with(self.config.upload, changeset, edits, &NullProgress)
    }

    /// Uploads edits with an explicit strategy and progress sink.
    pub fn upload_with(
        &self,
        spec: UploadStrategySpec,
        changeset: Changeset,
        edits: Vec<Edit>,
        progress: &dyn ProgressSink,
    ) -> Result<UploadReport, UploadFailure> {
        self.connection().reset_cancel();
        UploadTask::new(&self.api, spec)
            .with_cache(&self.cache)
            .with_progress(progress)
            .upload(changeset, edits)
    }

    /// Closes a changeset by id, fetching it first if it is not cached.
    pub fn close_changeset(&self, id: u64) -> TransferResult<Changeset> {
        let mut changeset = match self.cache.get(id) {
            Some(changeset) => changeset,
            None => self.api.get_changeset(id)?,
        };
        let result = self.api.close_changeset(&mut changeset);
        self.cache.upsert(changeset.clone());
        result.map(|()| changeset)
    }

    /// Cancels the foreground request in flight, if any. Background
    /// reconciliation is not affected.
    pub fn cancel(&self) -> bool {
        self.connection().cancel()
    }
}

impl std::fmt::Debug for TransferSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSession")
            .field("server_url", &self.config.server_url)
            .field("cached_changesets", &self.cache.len())
            .field("reconciliation", &self.reconciliation)
            .finish()
    }
}
