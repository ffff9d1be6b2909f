//! Crash-recovery and lifecycle behavior: journal replay, cache
//! restoration, catch-up, and the full runtime loop.

use std::sync::Arc;
use std::time::Duration;

use pisa_core::config::AppConfig;
use pisa_core::processor::ProcessorState;
use pisa_core::runtime::Watchtower;
use pisa_core::store::{ItemStore, MemoryStore};
use pisa_core::types::{Appointment, ResponseIdentifier};

use crate::harness::{build_stack, CHAIN_ID};
use crate::mock_infrastructure::{chain_block, response_tx, MockProvider, RESPONDER_ADDRESS, StubSigner};

fn identifier(tag: u8) -> ResponseIdentifier {
    ResponseIdentifier {
        chain_id: CHAIN_ID,
        to: [tag; 20],
        value: 0,
        data: vec![tag],
        gas_limit: 100_000,
    }
}

fn appointment(tag: u8, confirmations: u32) -> Appointment {
    Appointment {
        id: [tag; 32],
        customer_address: [1u8; 20],
        identifier: identifier(tag),
        start_block: 0,
        end_block: 1_000,
        confirmations_required: confirmations,
        event_topics: None,
        payment_proof: vec![],
    }
}

/// The journal rebuilds the queue after a restart and the restored items
/// are rebroadcast.
#[tokio::test]
async fn journal_rebuilds_queue_across_restart() {
    let provider = MockProvider::new();
    for n in 1..=3u64 {
        provider.add_canonical(chain_block(n, n as u8, (n - 1) as u8));
    }
    let store: Arc<dyn ItemStore> = Arc::new(MemoryStore::new());

    // first life: enqueue a response, then vanish without consuming it
    {
        let stack = build_stack(Arc::clone(&provider), Arc::clone(&store), 100);
        stack.processor.bootstrap().await.expect("bootstrap");
        stack.registry.add(appointment(1, 5)).expect("add appointment");
        stack.process_and_observe(1).await;
        assert_eq!(stack.status.load().queue_depth, 1);
    }
    let broadcasts_before = provider.broadcasts().len();

    // second life over the same store
    let stack = build_stack(Arc::clone(&provider), store, 100);
    stack.processor.bootstrap().await.expect("bootstrap");
    stack.registry.restore().expect("restore registry");

    let status = stack.status.load();
    assert_eq!(status.queue_depth, 1, "journal replay restores the queue");
    assert_eq!(status.pending_nonce, 0);

    // the next head re-broadcasts the restored item
    stack.process_and_observe(2).await;
    assert!(
        provider.broadcasts().len() > broadcasts_before,
        "restored items must be rebroadcast"
    );
}

/// The cache graph and head pointer survive a restart; processing resumes
/// from the persisted head, and anchor states do not need the old blocks
/// refetched.
#[tokio::test]
async fn cache_restores_from_block_records() {
    let provider = MockProvider::new();
    for n in 1..=5u64 {
        provider.add_canonical(chain_block(n, n as u8, (n - 1) as u8));
    }
    let store: Arc<dyn ItemStore> = Arc::new(MemoryStore::new());

    {
        let stack = build_stack(Arc::clone(&provider), Arc::clone(&store), 100);
        stack.processor.bootstrap().await.expect("bootstrap");
        for n in 1..=4u64 {
            stack.process_and_observe(n).await;
        }
        assert_eq!(stack.head_number(), Some(4));
    }

    let stack = build_stack(Arc::clone(&provider), store, 100);
    let resume = stack.processor.bootstrap().await.expect("bootstrap");
    assert_eq!(resume, 4, "resume height comes from the persisted head pointer");
    assert_eq!(stack.head_number(), Some(4), "head re-established from block records");

    stack.process_and_observe(5).await;
    assert_eq!(stack.head_number(), Some(5));
}

/// A notification far ahead of the head is caught up in depth-bounded
/// steps without ever violating the window invariant.
#[tokio::test]
async fn catch_up_is_depth_bounded() {
    let provider = MockProvider::new();
    for n in 1..=40u64 {
        provider.add_canonical(chain_block(n, n as u8, (n - 1) as u8));
    }

    let store: Arc<dyn ItemStore> = Arc::new(MemoryStore::new());
    let stack = build_stack(Arc::clone(&provider), store, 10);
    stack.processor.bootstrap().await.expect("bootstrap");

    stack.process_and_observe(1).await;
    assert_eq!(stack.head_number(), Some(1));

    // 39 blocks ahead: requires several lockstep iterations
    stack.process_and_observe(40).await;
    assert_eq!(stack.head_number(), Some(40));

    let cache = stack.cache.read();
    assert!(cache.len() <= 11, "window must stay within max_depth blocks");
}

/// A response mined while the watchtower was down is recognized on
/// restart instead of being double-broadcast.
#[tokio::test]
async fn mined_while_down_is_recognized_on_restart() {
    let provider = MockProvider::new();
    provider.add_canonical(chain_block(1, 1, 0));
    let store: Arc<dyn ItemStore> = Arc::new(MemoryStore::new());

    {
        let stack = build_stack(Arc::clone(&provider), Arc::clone(&store), 100);
        stack.processor.bootstrap().await.expect("bootstrap");
        stack.registry.add(appointment(1, 5)).expect("add appointment");
        stack.process_and_observe(1).await;
    }

    // while down: our response mines at block 2 with nonce 0
    let mut block2 = chain_block(2, 2, 1);
    block2.transactions.push(response_tx(&identifier(1), RESPONDER_ADDRESS, 0, 2));
    provider.add_canonical(block2);
    provider.set_transaction_count(RESPONDER_ADDRESS, 1);

    let stack = build_stack(Arc::clone(&provider), store, 100);
    stack.processor.bootstrap().await.expect("bootstrap");
    stack.registry.restore().expect("restore registry");

    // the journalled item sat at nonce 0, which the chain now owns: the
    // restored queue is rebased to the remote count and emptied
    let status = stack.status.load();
    assert_eq!(status.pending_nonce, 1, "base nonce refreshed from the provider");
    assert_eq!(status.queue_depth, 0, "mined item dropped during rebase");

    stack.process_and_observe(2).await;
    let status = stack.status.load();
    assert_eq!(status.highest_mined_nonce, Some(0), "mined response recognized");
}

/// Full runtime loop: notifications drive heads through the subscription
/// task, and shutdown lets the in-flight turn finish.
#[tokio::test]
async fn runtime_follows_notifications_and_stops_cleanly() {
    let provider = MockProvider::new();
    let store: Arc<dyn ItemStore> = Arc::new(MemoryStore::new());
    let mut watchtower = Watchtower::builder(AppConfig::default())
        .with_provider(Arc::clone(&provider) as Arc<dyn pisa_core::provider::ChainProvider>)
        .with_signer(Arc::new(StubSigner))
        .with_store(store)
        .build()
        .expect("build watchtower");

    watchtower.start().await.expect("start");
    assert_eq!(watchtower.processor_state(), ProcessorState::Running);

    for n in 1..=3u64 {
        provider.add_canonical(chain_block(n, n as u8, (n - 1) as u8));
        provider.notify(n);
    }

    // the subscription task is asynchronous; poll the health probe
    let mut head = None;
    for _ in 0..100 {
        head = watchtower.health().head_number;
        if head == Some(3) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(head, Some(3), "runtime should follow notifications to the tip");

    watchtower.stop().await;
    assert_eq!(watchtower.processor_state(), ProcessorState::Stopped);
}
