//! End-to-end scenarios driven through the block processor.

use std::sync::Arc;

use pisa_core::observer::{ConfirmationError, ConfirmationPolicy};
use pisa_core::store::{ItemStore, MemoryStore};
use pisa_core::types::{Appointment, Hash256, ResponseIdentifier};

use crate::harness::{build_stack, TestStack, CHAIN_ID};
use crate::mock_infrastructure::{
    chain_block, event_log, response_tx, MockProvider, RESPONDER_ADDRESS,
};

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

async fn stack_with(provider: Arc<MockProvider>) -> TestStack {
    let store: Arc<dyn ItemStore> = Arc::new(MemoryStore::new());
    let stack = build_stack(provider, store, 100);
    stack.processor.bootstrap().await.expect("bootstrap");
    stack
}

/// An appointment's response is enqueued, observed mined, and finally
/// confirmed after the required depth.
#[tokio::test]
async fn pending_then_mined_then_confirmed() {
    let provider = MockProvider::new();
    // nonce 1 is the next usable nonce for the responder
    provider.set_transaction_count(RESPONDER_ADDRESS, 1);

    for n in 1..=8u64 {
        let mut block = chain_block(n, n as u8, (n - 1) as u8);
        if n == 3 {
            block.transactions.push(response_tx(&identifier(1), RESPONDER_ADDRESS, 1, 3));
        }
        provider.add_canonical(block);
    }

    let stack = stack_with(Arc::clone(&provider)).await;
    stack.registry.add(appointment(1, 5)).expect("add appointment");

    for n in 1..=2u64 {
        stack.process_and_observe(n).await;
    }
    let status = stack.status.load();
    assert_eq!(status.queue_depth, 1, "response should be queued while pending");
    assert_eq!(status.highest_mined_nonce, None);
    assert!(!provider.broadcasts().is_empty(), "pending response must be broadcast");

    stack.process_and_observe(3).await;
    let status = stack.status.load();
    assert_eq!(status.highest_mined_nonce, Some(1), "mined nonce observed at head 3");
    assert_eq!(status.queue_depth, 0, "mined item leaves the queue");
    assert_eq!(status.pending_nonce, 2, "base nonce advances past the mined nonce");
    assert!(stack.registry.get(&[1u8; 32]).is_some(), "not yet confirmed");

    for n in 4..=7u64 {
        stack.process_and_observe(n).await;
        assert!(
            stack.registry.get(&[1u8; 32]).is_some(),
            "appointment must survive until 5 confirmations (head {n})"
        );
    }

    stack.process_and_observe(8).await;
    assert!(
        stack.registry.get(&[1u8; 32]).is_none(),
        "EndResponse drops the appointment at confirmation depth 5"
    );
}

/// A restart with a pending appointment and an empty queue re-enqueues
/// the missing response.
#[tokio::test]
async fn re_enqueue_missing_items_after_restart() {
    let provider = MockProvider::new();
    for n in 1..=10u64 {
        provider.add_canonical(chain_block(n, n as u8, (n - 1) as u8));
    }

    let store: Arc<dyn ItemStore> = Arc::new(MemoryStore::new());
    // the appointment survived the restart; the queue did not
    {
        let registry =
            pisa_core::appointments::AppointmentRegistry::new(Arc::clone(&store));
        registry.add(appointment(1, 5)).expect("persist appointment");
    }

    let stack = build_stack(Arc::clone(&provider), store, 100);
    stack.processor.bootstrap().await.expect("bootstrap");
    stack.registry.restore().expect("restore registry");
    assert_eq!(stack.registry.len(), 1, "registry restored from the store");

    stack.process_and_observe(10).await;

    let status = stack.status.load();
    assert_eq!(status.queue_depth, 1, "missing item re-enqueued");
    let requests = provider.broadcast_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].nonce, 0);
    assert_eq!(requests[0].to, identifier(1).to);
}

/// A matching identifier from a foreign sender is not our response.
#[tokio::test]
async fn foreign_sender_does_not_complete_the_response() {
    let provider = MockProvider::new();
    let stranger = [0xDD; 20];

    for n in 1..=3u64 {
        let mut block = chain_block(n, n as u8, (n - 1) as u8);
        if n == 2 {
            block.transactions.push(response_tx(&identifier(1), stranger, 3, 2));
        }
        provider.add_canonical(block);
    }

    let stack = stack_with(Arc::clone(&provider)).await;
    stack.registry.add(appointment(1, 5)).expect("add appointment");

    for n in 1..=3u64 {
        stack.process_and_observe(n).await;
    }

    let status = stack.status.load();
    assert_eq!(status.highest_mined_nonce, None, "foreign transaction must not count");
    assert_eq!(status.queue_depth, 1, "our own response stays queued");
    assert!(stack.registry.get(&[1u8; 32]).is_some());
}

/// A stale notification below the depth window does not move the head.
#[tokio::test]
async fn notification_below_window_is_ignored() {
    let provider = MockProvider::new();
    for n in 80..=100u64 {
        provider.add_canonical(chain_block(n, n as u8, (n - 1) as u8));
    }

    let store: Arc<dyn ItemStore> = Arc::new(MemoryStore::new());
    let stack = build_stack(Arc::clone(&provider), store, 10);
    stack.processor.bootstrap().await.expect("bootstrap");

    stack.process_and_observe(100).await;
    assert_eq!(stack.head_number(), Some(100));

    // block 80 is below minimum_height = 90
    stack.processor.process_block_number(80).await.expect("stale notification");
    assert_eq!(stack.head_number(), Some(100), "head must not move for a stale block");
}

/// A reorg that drops a watched transaction rejects the confirmation
/// wait with a reorg error.
#[tokio::test]
async fn reorg_below_confirmation_rejects_observer() {
    let provider = MockProvider::new();
    let watched_tx = response_tx(&identifier(9), RESPONDER_ADDRESS, 0, 48);
    let tx_hash: Hash256 = watched_tx.hash;

    for n in 46..=49u64 {
        let mut block = chain_block(n, n as u8, (n - 1) as u8);
        if n == 48 {
            block.transactions.push(watched_tx.clone());
        }
        provider.add_canonical(block);
    }

    let stack = stack_with(Arc::clone(&provider)).await;
    for n in 46..=49u64 {
        stack.process_and_observe(n).await;
    }

    let handle = stack.observer.wait_for_confirmations(
        tx_hash,
        5,
        ConfirmationPolicy { block_threshold: None, reorg_if_not_found: true },
    );

    // competing branch from 47, without the transaction, takes over
    provider.reorg_to(vec![
        chain_block(48, 148, 47),
        chain_block(49, 149, 148),
        chain_block(50, 150, 149),
    ]);
    stack.process_and_observe(50).await;

    assert_eq!(stack.head_number(), Some(50));
    assert_eq!(handle.wait().await, Err(ConfirmationError::Reorg));
}

/// While un-mined, an item's gas price is bumped each head with its nonce
/// pinned.
#[tokio::test]
async fn gas_bump_preserves_nonce() {
    let provider = MockProvider::new();
    for n in 1..=3u64 {
        provider.add_canonical(chain_block(n, n as u8, (n - 1) as u8));
    }

    let stack = stack_with(Arc::clone(&provider)).await;
    stack.registry.add(appointment(1, 5)).expect("add appointment");

    for n in 1..=3u64 {
        stack.process_and_observe(n).await;
    }

    let requests = provider.broadcast_requests();
    assert!(requests.len() >= 2, "initial broadcast plus at least one bump");
    for window in requests.windows(2) {
        assert_eq!(window[0].nonce, window[1].nonce, "bumps never change the nonce");
        assert!(
            window[1].gas_price > window[0].gas_price,
            "every rebroadcast must raise the gas price"
        );
    }
}
