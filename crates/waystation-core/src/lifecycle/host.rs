//! The host: shared state across generations and the event dispatcher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::{ActivationReport, Event, EventOutcome, Intermediary};
use crate::config::Settings;
use crate::control::{ClientId, ControlMessage, ControlReply, REPLY_CHANNEL_CAPACITY};
use crate::error::{ControlError, PreloadError, StoreError};
use crate::http::{FetchOptions, Request, Response};
use crate::maintenance::MaintenanceReport;
use crate::origin::{self, FetchError, Origin};
use crate::preload::{self, PreloadReport};
use crate::store::{CacheStorage, PartitionRole, VersionTag};
use crate::sync::{self, LogNotifier, Notification, Notifier, SyncAttempts, SyncSource};

#[derive(Debug)]
pub struct InstallOutcome {
    pub generation: u64,
    pub version: VersionTag,
    pub preload: PreloadReport,
    /// Present when the new generation took over immediately
    pub activation: Option<ActivationReport>,
}

#[derive(Debug)]
pub struct SyncOutcome {
    pub tag: String,
    pub maintenance: Option<MaintenanceReport>,
    /// `None` when no sync source is registered
    pub sync: Option<SyncAttempts>,
}

struct ClientHandle {
    /// Generation controlling this client, if any
    controller: Option<u64>,
    replies: mpsc::Sender<ControlReply>,
}

pub struct Host {
    settings: Settings,
    storage: Arc<dyn CacheStorage>,
    origin: Arc<dyn Origin>,
    notifier: Arc<dyn Notifier>,
    sync_source: Option<Arc<dyn SyncSource>>,
    generations: AtomicU64,
    next_client: AtomicU64,
    active: RwLock<Option<Arc<Intermediary>>>,
    waiting: RwLock<Option<Arc<Intermediary>>>,
    clients: Mutex<HashMap<ClientId, ClientHandle>>,
    // Serializes install and activation
    transitions: Mutex<()>,
}

impl Host {
    pub fn new(settings: Settings, storage: Arc<dyn CacheStorage>, origin: Arc<dyn Origin>) -> Self {
        Self {
            settings,
            storage,
            origin,
            notifier: Arc::new(LogNotifier),
            sync_source: None,
            generations: AtomicU64::new(0),
            next_client: AtomicU64::new(0),
            active: RwLock::new(None),
            waiting: RwLock::new(None),
            clients: Mutex::new(HashMap::new()),
            transitions: Mutex::new(()),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_sync_source(mut self, source: Arc<dyn SyncSource>) -> Self {
        self.sync_source = Some(source);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn storage(&self) -> &Arc<dyn CacheStorage> {
        &self.storage
    }

    pub async fn active(&self) -> Option<Arc<Intermediary>> {
        self.active.read().await.clone()
    }

    pub async fn waiting(&self) -> Option<Arc<Intermediary>> {
        self.waiting.read().await.clone()
    }

    pub async fn current_version(&self) -> Option<VersionTag> {
        self.active().await.map(|instance| instance.version().clone())
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn instance(&self, version: VersionTag) -> Arc<Intermediary> {
        Arc::new(Intermediary::new(
            self.next_generation(),
            version,
            &self.settings,
            Arc::clone(&self.storage),
            Arc::clone(&self.origin),
        ))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Resume after a restart: if the configured version finished its
    /// preload earlier, activate it without preloading again.
    pub async fn restore(&self) -> Result<Option<Arc<Intermediary>>, StoreError> {
        let _guard = self.transitions.lock().await;
        if let Some(active) = self.active().await {
            return Ok(Some(active));
        }

        let version = self.settings.version.clone();
        let static_name = PartitionRole::Static.partition_name(&version);
        if !preload::is_installed(self.storage.as_ref(), &self.settings.scope, &static_name).await? {
            debug!(version = %version, "No completed install to restore");
            return Ok(None);
        }

        let instance = self.instance(version);
        instance.activate().await;
        *self.active.write().await = Some(Arc::clone(&instance));
        self.claim_clients(instance.generation()).await;
        info!(version = %instance.version(), "Restored active generation from storage");
        Ok(Some(instance))
    }

    /// Install a new generation. A failed preload discards it and leaves
    /// the active generation serving.
    pub async fn install(
        &self,
        version: VersionTag,
        manifest: &[String],
    ) -> Result<InstallOutcome, PreloadError> {
        let _guard = self.transitions.lock().await;

        let instance = self.instance(version);
        info!(generation = instance.generation(), version = %instance.version(), "Installing");
        let preload = instance.install(manifest).await?;

        if let Some(previous) = self.waiting.write().await.replace(Arc::clone(&instance)) {
            debug!(generation = previous.generation(), "Replacing waiting generation");
            previous.retire();
        }

        let activation = if self.settings.skip_waiting || !self.has_controlled_clients().await {
            self.activate_locked().await
        } else {
            info!(
                generation = instance.generation(),
                "Installed, waiting for clients of the active generation to go away"
            );
            None
        };

        Ok(InstallOutcome {
            generation: instance.generation(),
            version: instance.version().clone(),
            preload,
            activation,
        })
    }

    /// Promote the waiting generation, if any.
    pub async fn activate_waiting(&self) -> Option<ActivationReport> {
        let _guard = self.transitions.lock().await;
        self.activate_locked().await
    }

    async fn activate_locked(&self) -> Option<ActivationReport> {
        let instance = self.waiting.write().await.take()?;
        let report = instance.activate().await;

        let previous = self.active.write().await.replace(Arc::clone(&instance));
        if let Some(previous) = previous {
            previous.retire();
        }
        self.claim_clients(instance.generation()).await;
        Some(report)
    }

    /// Make every connected client controlled by `generation`.
    async fn claim_clients(&self, generation: u64) {
        let mut clients = self.clients.lock().await;
        for handle in clients.values_mut() {
            handle.controller = Some(generation);
        }
        debug!(generation, clients = clients.len(), "Claimed clients");
    }

    /// True when some client is controlled by the active generation.
    async fn has_controlled_clients(&self) -> bool {
        let Some(active) = self.active().await else {
            return false;
        };
        let clients = self.clients.lock().await;
        clients
            .values()
            .any(|handle| handle.controller == Some(active.generation()))
    }

    // =========================================================================
    // Clients
    // =========================================================================

    pub async fn connect(&self) -> (ClientId, mpsc::Receiver<ControlReply>) {
        let id = ClientId(self.next_client.fetch_add(1, Ordering::SeqCst) + 1);
        let controller = self.active().await.map(|instance| instance.generation());
        let (tx, rx) = mpsc::channel(REPLY_CHANNEL_CAPACITY);
        self.clients.lock().await.insert(
            id,
            ClientHandle {
                controller,
                replies: tx,
            },
        );
        debug!(client = %id, ?controller, "Client connected");
        (id, rx)
    }

    /// Remove a client. When the last client of the active generation goes
    /// away, a waiting generation takes over.
    pub async fn disconnect(&self, client: ClientId) {
        if self.clients.lock().await.remove(&client).is_none() {
            return;
        }
        debug!(client = %client, "Client disconnected");

        let has_waiting = self.waiting.read().await.is_some();
        if has_waiting && !self.has_controlled_clients().await {
            info!("Last client of the active generation left, activating waiting generation");
            self.activate_waiting().await;
        }
    }

    pub async fn controller_of(&self, client: ClientId) -> Option<u64> {
        self.clients
            .lock()
            .await
            .get(&client)
            .and_then(|handle| handle.controller)
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Route a request through the newest active generation. Without one,
    /// the request goes straight to the origin.
    pub async fn fetch(
        &self,
        client: Option<ClientId>,
        request: Request,
        options: FetchOptions,
    ) -> Result<Response, FetchError> {
        match self.active().await {
            Some(instance) => instance.intercept(request, options).await,
            None => {
                debug!(client = ?client, url = %request.url, "No active generation, fetching directly");
                origin::fetch_with_options(self.origin.as_ref(), &request, options).await
            }
        }
    }

    // =========================================================================
    // Control channel
    // =========================================================================

    pub async fn post_message(&self, client: ClientId, raw: &str) -> Result<(), ControlError> {
        let message = ControlMessage::parse(raw).map_err(|e| {
            warn!(client = %client, error = %e, "Rejected control message");
            ControlError::InvalidMessage(e)
        })?;
        debug!(client = %client, ?message, "Control message");

        match message {
            ControlMessage::SkipWaiting => {
                if self.activate_waiting().await.is_none() {
                    debug!("SKIP_WAITING with no waiting generation");
                }
                Ok(())
            }
            ControlMessage::GetVersion => {
                let version = self.current_version().await.ok_or(ControlError::NotActive)?;
                self.reply(client, ControlReply::Version { version }).await
            }
            ControlMessage::CacheData { payload } => {
                let instance = self.active().await.ok_or(ControlError::NotActive)?;
                if let Err(e) = instance.cache_data(&payload).await {
                    warn!(error = %e, "Failed to cache pushed data");
                }
                Ok(())
            }
        }
    }

    async fn reply(&self, client: ClientId, reply: ControlReply) -> Result<(), ControlError> {
        let sender = {
            let clients = self.clients.lock().await;
            clients
                .get(&client)
                .map(|handle| handle.replies.clone())
                .ok_or(ControlError::UnknownClient(client))?
        };
        sender.send(reply).await.map_err(|e| {
            error!(client = %client, error = %e, "Failed to send reply - channel closed");
            ControlError::MailboxClosed(client)
        })
    }

    // =========================================================================
    // Background work
    // =========================================================================

    pub async fn run_maintenance(&self) -> Option<MaintenanceReport> {
        let instance = self.active().await?;
        Some(instance.run_maintenance().await)
    }

    pub async fn background_sync(&self, tag: &str) -> SyncOutcome {
        let maintenance = self.run_maintenance().await;
        let sync = match self.sync_source {
            Some(ref source) => Some(sync::run_with_retry(source.as_ref(), tag).await),
            None => None,
        };
        SyncOutcome {
            tag: tag.to_string(),
            maintenance,
            sync,
        }
    }

    pub fn push(&self, payload: Option<&Value>) {
        self.notifier.show(&Notification::from_payload(payload));
    }

    pub async fn dispatch(&self, event: Event) -> EventOutcome {
        match event {
            Event::Install { version, manifest } => {
                EventOutcome::Installed(self.install(version, &manifest).await)
            }
            Event::Activate => EventOutcome::Activated(self.activate_waiting().await),
            Event::Fetch {
                client,
                request,
                options,
            } => EventOutcome::Response(self.fetch(client, request, options).await),
            Event::Message { client, raw } => {
                EventOutcome::MessageHandled(self.post_message(client, &raw).await)
            }
            Event::PeriodicTrigger => EventOutcome::Maintained(self.run_maintenance().await),
            Event::Sync { tag } => EventOutcome::Synced(self.background_sync(&tag).await),
            Event::Push { payload } => {
                self.push(payload.as_ref());
                EventOutcome::Notified
            }
        }
    }
}
