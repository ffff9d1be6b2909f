//! Wiring and lifecycle.
//!
//! [`WatchtowerBuilder`] assembles store, cache, components, responder and
//! processor from an [`AppConfig`] plus the injected collaborators
//! (provider, signer). [`Watchtower`] owns the running service: it
//! restores persisted state, starts the processor's subscription task,
//! and coordinates graceful shutdown through a broadcast channel.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::appointments::AppointmentRegistry;
use crate::cache::{shared, BlockCache, BlockCacheError, BlockItemStore, SharedBlockCache};
use crate::config::AppConfig;
use crate::observer::ConfirmationObserver;
use crate::processor::{BlockProcessor, HeadListener, ProcessorError, ProcessorState};
use crate::provider::{
    ChainProvider, DelayedProvider, JsonRpcProvider, JsonRpcProviderConfig, ProviderError,
};
use crate::reducer::ComponentSet;
use crate::responder::{
    MultiResponder, ResponderComponent, ResponderStatus, TransactionSigner, WatcherComponent,
};
use crate::store::{ItemStore, ItemStoreError, SledStore};
use crate::types::{Appointment, Block, Hash256};

#[derive(Debug, Error)]
pub enum WatchtowerError {
    #[error("builder is missing a transaction signer")]
    MissingSigner,

    #[error(transparent)]
    Cache(#[from] BlockCacheError),

    #[error(transparent)]
    Store(#[from] ItemStoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Processor(#[from] ProcessorError),
}

/// Operator-facing view of the running service.
#[derive(Debug, Clone, Default)]
pub struct HealthSnapshot {
    pub head_number: Option<u64>,
    pub head_hash: Option<Hash256>,
    pub queue_depth: usize,
    pub pending_nonce: u64,
    pub highest_mined_nonce: Option<u64>,
    pub stuck_items: usize,
    pub last_broadcast_error: Option<String>,
    pub pending_confirmations: usize,
}

pub struct WatchtowerBuilder {
    config: AppConfig,
    provider: Option<Arc<dyn ChainProvider>>,
    signer: Option<Arc<dyn TransactionSigner>>,
    store: Option<Arc<dyn ItemStore>>,
}

impl WatchtowerBuilder {
    #[must_use]
    pub fn new(config: AppConfig) -> Self {
        Self { config, provider: None, signer: None, store: None }
    }

    /// Overrides the JSON-RPC provider built from the config.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn ChainProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// The signing key holder. Required.
    #[must_use]
    pub fn with_signer(mut self, signer: Arc<dyn TransactionSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Overrides the sled store built from the config.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn ItemStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<Watchtower, WatchtowerError> {
        let signer = self.signer.ok_or(WatchtowerError::MissingSigner)?;

        let store: Arc<dyn ItemStore> = match self.store {
            Some(store) => store,
            None => Arc::new(SledStore::open(&self.config.store.path)?),
        };

        let provider: Arc<dyn ChainProvider> = match self.provider {
            Some(provider) => provider,
            None => {
                let rpc = JsonRpcProvider::new(JsonRpcProviderConfig {
                    url: self.config.provider.url.clone(),
                    chain_id: self.config.provider.chain_id,
                    request_timeout: Duration::from_secs(
                        self.config.provider.request_timeout_secs,
                    ),
                    poll_interval: Duration::from_secs(self.config.provider.poll_interval_secs),
                })?;
                if self.config.provider.delay > 0 {
                    Arc::new(DelayedProvider::new(rpc, self.config.provider.delay))
                } else {
                    Arc::new(rpc)
                }
            }
        };

        let cache = shared(BlockCache::new(self.config.cache.max_depth)?);
        let items = Arc::new(BlockItemStore::new(Arc::clone(&store)));
        let registry = Arc::new(AppointmentRegistry::new(Arc::clone(&store)));

        // watcher first: a trigger observed at head N enqueues before the
        // responder component diffs that same head
        let mut components = ComponentSet::new(Arc::clone(&items));
        components.register(WatcherComponent::new(Arc::clone(&registry)));
        components.register(ResponderComponent::new(Arc::clone(&registry), signer.address()));

        let responder = MultiResponder::new(
            Arc::clone(&provider),
            Arc::clone(&signer),
            Arc::clone(&store),
            Arc::clone(&registry),
            self.config.responder.gas.clone(),
            self.config.provider.chain_id,
            self.config.responder.journal_snapshot_interval,
        );
        let responder_status = responder.status_handle();

        let observer = Arc::new(ConfirmationObserver::new(Arc::clone(&cache)));
        let processor = Arc::new(BlockProcessor::new(
            provider,
            Arc::clone(&cache),
            items,
            components,
            responder,
        ));

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Watchtower {
            cache,
            registry,
            observer,
            processor,
            responder_status,
            shutdown_tx,
            subscription: None,
        })
    }
}

/// Forwards head promotions to the confirmation observer.
struct ObserverListener(Arc<ConfirmationObserver>);

impl HeadListener for ObserverListener {
    fn new_head(&self, head_hash: &Hash256) {
        self.0.on_new_head(head_hash);
    }
}

pub struct Watchtower {
    cache: SharedBlockCache<Block>,
    registry: Arc<AppointmentRegistry>,
    observer: Arc<ConfirmationObserver>,
    processor: Arc<BlockProcessor>,
    responder_status: Arc<ArcSwap<ResponderStatus>>,
    shutdown_tx: broadcast::Sender<()>,
    subscription: Option<JoinHandle<()>>,
}

impl Watchtower {
    #[must_use]
    pub fn builder(config: AppConfig) -> WatchtowerBuilder {
        WatchtowerBuilder::new(config)
    }

    /// Restores persisted state and starts following the chain.
    pub async fn start(&mut self) -> Result<(), WatchtowerError> {
        let restored = self.registry.restore()?;
        debug!(appointments = restored, "registry loaded");

        let handle = self.processor.start(self.shutdown_tx.subscribe()).await?;
        self.subscription = Some(handle);
        self.processor.add_listener(Arc::new(ObserverListener(Arc::clone(&self.observer))))?;
        info!("watchtower started");
        Ok(())
    }

    /// Signals shutdown and waits for the in-flight head turn to finish.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.subscription.take() {
            if let Err(err) = handle.await {
                warn!(error = %err, "subscription task ended abnormally");
            }
        }
        info!("watchtower stopped");
    }

    /// Accepts an inspector-validated appointment into the registry. The
    /// watcher component picks it up on the next head.
    pub fn add_appointment(&self, appointment: Appointment) -> Result<(), WatchtowerError> {
        self.registry.add(appointment)?;
        Ok(())
    }

    #[must_use]
    pub fn observer(&self) -> &Arc<ConfirmationObserver> {
        &self.observer
    }

    #[must_use]
    pub fn processor_state(&self) -> ProcessorState {
        self.processor.state()
    }

    /// Lock-free-ish health probe: one short cache read plus atomic
    /// snapshots.
    #[must_use]
    pub fn health(&self) -> HealthSnapshot {
        let (head_number, head_hash) = {
            let cache = self.cache.read();
            match cache.head() {
                Some(head) => (Some(head.number), Some(head.hash)),
                None => (None, None),
            }
        };
        let responder = self.responder_status.load();
        HealthSnapshot {
            head_number,
            head_hash,
            queue_depth: responder.queue_depth,
            pending_nonce: responder.pending_nonce,
            highest_mined_nonce: responder.highest_mined_nonce,
            stuck_items: responder.stuck_items,
            last_broadcast_error: responder.last_broadcast_error.clone(),
            pending_confirmations: self.observer.pending(),
        }
    }
}
