mod common;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::time::Duration;

use notify_relay::aggregator::{BufferedEvent, ORPHAN_MIN_AGE_SECS};
use notify_relay::models::{CustomerContext, EventType, NormalizedEvent};
use notify_relay::store::{Clock, SharedStore};

use common::harness;

fn event(event_type: EventType, external_id: &str, customer_id: &str) -> NormalizedEvent {
    let mut e = NormalizedEvent::new(
        "acme",
        "stripe",
        event_type,
        external_id,
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).unwrap(),
    );
    e.customer_id = Some(customer_id.to_string());
    e.amount = Some(299.0);
    e.currency = Some("USD".into());
    e
}

fn customer(email: &str) -> CustomerContext {
    CustomerContext {
        email: Some(email.to_string()),
        ..Default::default()
    }
}

#[tokio::test(start_paused = true)]
async fn burst_for_one_customer_flushes_as_a_single_composite() {
    let h = harness(Duration::from_secs(30));

    h.aggregator
        .enqueue(
            event(EventType::PaymentSuccess, "evt_pay", "cus_1"),
            customer("first@vance.example"),
        )
        .await
        .unwrap();
    h.aggregator
        .enqueue(
            event(EventType::SubscriptionCreated, "evt_sub", "cus_1"),
            customer("second@vance.example"),
        )
        .await
        .unwrap();
    h.aggregator
        .enqueue(
            event(EventType::InvoicePaid, "evt_inv", "cus_1"),
            customer("third@vance.example"),
        )
        .await
        .unwrap();

    assert_eq!(h.recorder.sent_count(), 0);
    tokio::time::sleep(Duration::from_secs(31)).await;

    // One notification, shaped by the highest-priority event, addressed with
    // the first arrival's email.
    let sent = h.recorder.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].event_type, EventType::SubscriptionCreated);
    assert_eq!(sent[0].headline, "New subscription - $299.00");
    assert_eq!(sent[0].customer.email.as_deref(), Some("first@vance.example"));
}

#[tokio::test(start_paused = true)]
async fn different_customers_flush_separately() {
    let h = harness(Duration::from_secs(30));

    h.aggregator
        .enqueue(
            event(EventType::PaymentSuccess, "evt_a", "cus_1"),
            customer("a@vance.example"),
        )
        .await
        .unwrap();
    h.aggregator
        .enqueue(
            event(EventType::PaymentSuccess, "evt_b", "cus_2"),
            customer("b@vance.example"),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(h.recorder.sent_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn idempotency_key_correlates_across_customers() {
    let h = harness(Duration::from_secs(30));

    let mut first = event(EventType::PaymentSuccess, "evt_a", "cus_1");
    first.idempotency_key = Some("idem_1".into());
    let mut second = event(EventType::SubscriptionCreated, "evt_b", "cus_2");
    second.idempotency_key = Some("idem_1".into());

    h.aggregator
        .enqueue(first, customer("a@vance.example"))
        .await
        .unwrap();
    h.aggregator
        .enqueue(second, customer("b@vance.example"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(h.recorder.sent_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn event_without_any_correlation_key_is_delivered_directly() {
    let h = harness(Duration::from_secs(30));

    let mut e = event(EventType::PaymentSuccess, "evt_a", "cus_1");
    e.customer_id = None;
    h.aggregator
        .enqueue(e, customer("a@vance.example"))
        .await
        .unwrap();

    // No timer involved; the notification goes straight out.
    assert_eq!(h.recorder.sent_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_delivery_keeps_the_buffer_for_retry() {
    let h = harness(Duration::from_secs(30));
    h.recorder.set_failing(true);

    h.aggregator
        .enqueue(
            event(EventType::PaymentSuccess, "evt_a", "cus_1"),
            customer("a@vance.example"),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(h.recorder.sent_count(), 0);

    let keys = h.store.scan_prefix("pending_webhook:").await.unwrap();
    assert_eq!(keys.len(), 1);

    // The destination recovers; a manual flush drains the kept buffer.
    h.recorder.set_failing(false);
    h.aggregator.process_key(&keys[0]).await;
    assert_eq!(h.recorder.sent_count(), 1);
    assert!(h
        .store
        .scan_prefix("pending_webhook:")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn processing_lock_blocks_a_second_flusher() {
    let h = harness(Duration::from_secs(300));

    h.aggregator
        .enqueue(
            event(EventType::PaymentSuccess, "evt_a", "cus_1"),
            customer("a@vance.example"),
        )
        .await
        .unwrap();
    let keys = h.store.scan_prefix("pending_webhook:").await.unwrap();
    assert_eq!(keys.len(), 1);

    // Another instance holds the lock.
    h.store
        .set_if_absent(
            &format!("processing:{}", keys[0]),
            "1",
            ChronoDuration::seconds(60),
        )
        .await
        .unwrap();

    h.aggregator.process_key(&keys[0]).await;
    assert_eq!(h.recorder.sent_count(), 0);
    assert_eq!(h.store.scan_prefix("pending_webhook:").await.unwrap().len(), 1);
}

fn buffer_json(e: NormalizedEvent, email: &str, queued_at: i64) -> String {
    serde_json::to_string(&vec![BufferedEvent {
        event: e,
        customer: customer(email),
        queued_at,
    }])
    .unwrap()
}

#[tokio::test]
async fn startup_recovers_aged_orphans_only() {
    let h = harness(Duration::from_secs(30));
    let now = h.clock.now().timestamp();

    // Old enough to be considered abandoned.
    h.store
        .set(
            "pending_webhook:acme:customer:cus_1:t100",
            &buffer_json(
                event(EventType::PaymentSuccess, "evt_old", "cus_1"),
                "old@vance.example",
                now - ORPHAN_MIN_AGE_SECS - 5,
            ),
            ChronoDuration::seconds(300),
        )
        .await
        .unwrap();
    // Young buffer; its owner may still be about to flush it.
    h.store
        .set(
            "pending_webhook:acme:customer:cus_2:t200",
            &buffer_json(
                event(EventType::PaymentSuccess, "evt_young", "cus_2"),
                "young@vance.example",
                now - 5,
            ),
            ChronoDuration::seconds(300),
        )
        .await
        .unwrap();
    // Tenant no longer exists; the buffer is garbage.
    h.store
        .set(
            "pending_webhook:ghost:customer:cus_3:t300",
            &buffer_json(
                {
                    let mut e = event(EventType::PaymentSuccess, "evt_ghost", "cus_3");
                    e.tenant_id = "ghost".into();
                    e
                },
                "ghost@vance.example",
                now - ORPHAN_MIN_AGE_SECS - 5,
            ),
            ChronoDuration::seconds(300),
        )
        .await
        .unwrap();

    let recovered = h.aggregator.recover_orphans().await;
    assert_eq!(recovered, 1);
    assert_eq!(h.recorder.headlines(), vec!["Payment received - $299.00"]);

    let mut remaining = h.store.scan_prefix("pending_webhook:").await.unwrap();
    remaining.sort();
    assert_eq!(
        remaining,
        vec!["pending_webhook:acme:customer:cus_2:t200".to_string()]
    );
}

#[tokio::test]
async fn orphan_age_follows_the_earliest_buffered_event() {
    let h = harness(Duration::from_secs(30));
    let now = h.clock.now().timestamp();

    // The first event is well past the minimum age; the last arrived just
    // before the previous instance died. The buffer missed its timer and
    // must be recovered regardless of the late arrivals.
    let items = vec![
        BufferedEvent {
            event: event(EventType::PaymentSuccess, "evt_first", "cus_1"),
            customer: customer("first@vance.example"),
            queued_at: now - ORPHAN_MIN_AGE_SECS - 20,
        },
        BufferedEvent {
            event: event(EventType::SubscriptionCreated, "evt_last", "cus_1"),
            customer: customer("last@vance.example"),
            queued_at: now - 2,
        },
    ];
    h.store
        .set(
            "pending_webhook:acme:customer:cus_1:t100",
            &serde_json::to_string(&items).unwrap(),
            ChronoDuration::seconds(300),
        )
        .await
        .unwrap();

    let recovered = h.aggregator.recover_orphans().await;
    assert_eq!(recovered, 1);
    assert_eq!(h.recorder.headlines(), vec!["New subscription - $299.00"]);
    assert!(h
        .store
        .scan_prefix("pending_webhook:")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn corrupt_orphan_buffers_are_discarded() {
    let h = harness(Duration::from_secs(30));
    h.store
        .set(
            "pending_webhook:acme:customer:cus_1:t100",
            "not json",
            ChronoDuration::seconds(300),
        )
        .await
        .unwrap();

    let recovered = h.aggregator.recover_orphans().await;
    assert_eq!(recovered, 0);
    assert!(h
        .store
        .scan_prefix("pending_webhook:")
        .await
        .unwrap()
        .is_empty());
    assert_eq!(h.recorder.sent_count(), 0);
}

#[tokio::test]
async fn composite_is_rechecked_against_late_suppressions() {
    use notify_relay::consolidation::Verdict;

    let h = harness(Duration::from_secs(300));

    // The payment is buffered first; its subscription primary is admitted
    // afterwards and registers the suppression for this customer.
    h.aggregator
        .enqueue(
            event(EventType::PaymentSuccess, "evt_pay", "cus_1"),
            customer("a@vance.example"),
        )
        .await
        .unwrap();

    let sub = event(EventType::SubscriptionCreated, "evt_sub", "cus_1");
    assert_eq!(h.filter.admit(&sub).await.unwrap(), Verdict::Deliver);

    let keys = h.store.scan_prefix("pending_webhook:").await.unwrap();
    h.aggregator.process_key(&keys[0]).await;
    assert_eq!(h.recorder.sent_count(), 0);
    assert!(h
        .store
        .scan_prefix("pending_webhook:")
        .await
        .unwrap()
        .is_empty());
}
