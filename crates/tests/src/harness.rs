//! Hand-wired pipeline stack with every component handle exposed, so
//! tests can drive head turns deterministically and assert on internals
//! the public runtime deliberately hides.

use std::sync::Arc;

use arc_swap::ArcSwap;

use pisa_core::appointments::AppointmentRegistry;
use pisa_core::cache::{shared, BlockCache, BlockItemStore, SharedBlockCache};
use pisa_core::observer::ConfirmationObserver;
use pisa_core::processor::BlockProcessor;
use pisa_core::reducer::ComponentSet;
use pisa_core::responder::{
    GasPolicy, MultiResponder, ResponderComponent, ResponderStatus, WatcherComponent,
};
use pisa_core::store::ItemStore;
use pisa_core::types::Block;

use crate::mock_infrastructure::{MockProvider, StubSigner, RESPONDER_ADDRESS};

pub struct TestStack {
    pub provider: Arc<MockProvider>,
    pub registry: Arc<AppointmentRegistry>,
    pub observer: Arc<ConfirmationObserver>,
    pub processor: Arc<BlockProcessor>,
    pub status: Arc<ArcSwap<ResponderStatus>>,
    pub cache: SharedBlockCache<Block>,
}

pub const CHAIN_ID: u64 = 1;

pub fn build_stack(
    provider: Arc<MockProvider>,
    store: Arc<dyn ItemStore>,
    max_depth: u64,
) -> TestStack {
    let cache = shared(BlockCache::new(max_depth).expect("valid depth"));
    let items = Arc::new(BlockItemStore::new(Arc::clone(&store)));
    let registry = Arc::new(AppointmentRegistry::new(Arc::clone(&store)));

    let mut components = ComponentSet::new(Arc::clone(&items));
    components.register(WatcherComponent::new(Arc::clone(&registry)));
    components.register(ResponderComponent::new(Arc::clone(&registry), RESPONDER_ADDRESS));

    let responder = MultiResponder::new(
        Arc::clone(&provider) as Arc<dyn pisa_core::provider::ChainProvider>,
        Arc::new(StubSigner),
        Arc::clone(&store),
        Arc::clone(&registry),
        GasPolicy { floor_gas_price: 1, ..GasPolicy::default() },
        CHAIN_ID,
        16,
    );
    let status = responder.status_handle();

    let observer = Arc::new(ConfirmationObserver::new(Arc::clone(&cache)));
    let processor = Arc::new(BlockProcessor::new(
        Arc::clone(&provider) as Arc<dyn pisa_core::provider::ChainProvider>,
        Arc::clone(&cache),
        items,
        components,
        responder,
    ));

    TestStack { provider, registry, observer, processor, status, cache }
}

impl TestStack {
    /// Current head number, if any.
    pub fn head_number(&self) -> Option<u64> {
        self.cache.read().head().map(|h| h.number)
    }

    /// Processes a head and evaluates the confirmation observer, the way
    /// the running service does on every promotion.
    pub async fn process_and_observe(&self, number: u64) {
        self.processor.process_block_number(number).await.expect("process block");
        let head_hash = self.cache.read().head().map(|h| h.hash);
        if let Some(hash) = head_hash {
            self.observer.on_new_head(&hash);
        }
    }
}
