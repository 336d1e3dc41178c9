//! At-least-once delivery, redelivery and poison containment.

use super::harness::{eventually, Pipeline};
use checker_database::PrimeCheckStatus;
use stream_courier::{BrokerGateway, Envelope, MessageType, PrimeCheckPayload, TraceContext};

#[tokio::test]
async fn publish_failures_delay_but_do_not_lose_messages() {
    let mut p = Pipeline::new().await;
    let check = p
        .service
        .create_prime_check(1, "13", TraceContext::new())
        .await
        .unwrap();

    p.broker.fail_next_publishes(3);
    for _ in 0..3 {
        let report = p.tick().await;
        assert_eq!(report.failed(), 1);
        assert_eq!(p.unprocessed().await, 1);
    }
    assert_eq!(p.tick().await.published(), 1);
    assert_eq!(p.unprocessed().await, 0);

    p.start_workers();
    let id = check.id;
    let pr = &p;
    eventually("row completed", move || async move {
        pr.row(id).await.status == PrimeCheckStatus::Completed
    })
    .await;
    p.stop().await;
}

#[tokio::test]
async fn broker_outage_is_survived() {
    let mut p = Pipeline::new().await;
    p.start_workers();
    let broker = p.broker.clone();
    eventually("topics ready", move || {
        let broker = broker.clone();
        async move { ["primecheck", "emailsend", "unknown"].iter().all(|t| broker.has_topic(t)) }
    })
    .await;
    p.broker.set_unavailable(true);
    // Long enough for every subscription to hit a failed pull
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let check = p
        .service
        .create_prime_check(1, "7", TraceContext::new())
        .await
        .unwrap();
    assert_eq!(p.tick().await.failed(), 1);

    p.broker.set_unavailable(false);
    let emails = p.emails.clone();
    p.drive_until("email sent", || {
        let emails = emails.clone();
        async move { emails.sent_count() == 1 }
    })
    .await;
    assert_eq!(p.emails.sent()[0].request_id, check.id);

    let stats = p.stop().await;
    assert!(stats.iter().any(|s| s.pull_errors > 0));
}

#[tokio::test]
async fn relay_failures_are_redelivered_until_sent() {
    let mut p = Pipeline::new().await;
    p.emails.fail_next(2);
    p.start_workers();

    p.service
        .create_prime_check(1, "17", TraceContext::new())
        .await
        .unwrap();

    let emails = p.emails.clone();
    p.drive_until("email sent", || {
        let emails = emails.clone();
        async move { emails.sent_count() == 1 }
    })
    .await;

    let stats = p.stop().await;
    assert_eq!(stats[1].nacked, 2, "two failed sends");
    assert_eq!(stats[1].acked, 1);
}

#[tokio::test]
async fn republished_prime_check_sends_one_email() {
    let mut p = Pipeline::new().await;
    let check = p
        .service
        .create_prime_check(1, "17", TraceContext::new())
        .await
        .unwrap();

    // Simulate a crash between publish and mark: the same record goes out twice
    let record = p.outbox("prime_check").await.remove(0);
    let envelope = Envelope::from_bytes(&record.payload).unwrap();
    p.broker.publish("primecheck", &envelope).await.unwrap();
    p.tick().await;
    assert_eq!(p.broker.published("primecheck").len(), 2);

    p.start_workers();
    let emails = p.emails.clone();
    p.drive_until("email sent", || {
        let emails = emails.clone();
        async move { emails.sent_count() >= 1 }
    })
    .await;

    let broker = p.broker.clone();
    eventually("both deliveries acked", move || {
        let broker = broker.clone();
        async move { broker.pending_count("primecheck") == 0 && broker.undelivered_count("primecheck") == 0 }
    })
    .await;
    p.tick().await;

    assert_eq!(p.outbox("email_send").await.len(), 1);
    assert_eq!(p.emails.sent_count(), 1);
    assert_eq!(p.row(check.id).await.status, PrimeCheckStatus::Completed);
    p.stop().await;
}

#[tokio::test]
async fn unparseable_number_is_contained() {
    let mut p = Pipeline::new().await;
    p.start_workers();

    let bad = p
        .service
        .create_prime_check(1, "not-a-number", TraceContext::new())
        .await
        .unwrap();
    let good = p
        .service
        .create_prime_check(1, "5", TraceContext::new())
        .await
        .unwrap();

    let emails = p.emails.clone();
    p.drive_until("email for the good number", || {
        let emails = emails.clone();
        async move { emails.sent_count() == 1 }
    })
    .await;

    assert_eq!(p.row(bad.id).await.status, PrimeCheckStatus::Failed);
    assert_eq!(p.row(good.id).await.status, PrimeCheckStatus::Completed);
    assert_eq!(p.emails.sent()[0].request_id, good.id);

    let stats = p.stop().await;
    assert_eq!(stats[0].poisoned, 1);
    assert_eq!(stats[0].nacked, 0, "poison is never redelivered");
}

#[tokio::test]
async fn garbage_on_the_topic_does_not_block_it() {
    let mut p = Pipeline::new().await;
    p.broker.publish_raw("primecheck", b"\x00\x01 not an envelope".to_vec());
    let check = p
        .service
        .create_prime_check(1, "11", TraceContext::new())
        .await
        .unwrap();
    p.tick().await;
    p.start_workers();

    let id = check.id;
    let pr = &p;
    eventually("row completed", move || async move {
        pr.row(id).await.status == PrimeCheckStatus::Completed
    })
    .await;

    let stats = p.stop().await;
    assert_eq!(stats[0].poisoned, 1);
    assert_eq!(stats[0].acked, 1);
}

#[tokio::test]
async fn unknown_event_type_reaches_the_sink() {
    let mut p = Pipeline::new().await;
    p.start_workers();

    let envelope = Envelope::new(
        MessageType::Unknown("sms_send".to_string()),
        &serde_json::json!({"to": "+100000000"}),
        TraceContext::new(),
    )
    .unwrap();
    p.db.transaction(move |tx| checker_outbox::append_envelope(tx, &envelope))
        .await
        .unwrap();

    let sink = p.unknown_sink.clone();
    p.drive_until("unknown message counted", || {
        let sink = sink.clone();
        async move { sink.unknown_count() == 1 }
    })
    .await;

    assert_eq!(p.broker.published("unknown").len(), 1);
    assert_eq!(p.unprocessed().await, 0);
    p.stop().await;
}

#[tokio::test]
async fn mislabelled_payload_is_contained() {
    let mut p = Pipeline::new().await;
    p.start_workers();

    // Declared as email_send but carries a prime check payload
    let envelope = Envelope::new(
        MessageType::EmailSend,
        &PrimeCheckPayload {
            request_id: 1,
            user_id: 1,
            number_text: "17".to_string(),
        },
        TraceContext::new(),
    )
    .unwrap();
    p.broker.publish("emailsend", &envelope).await.unwrap();

    let broker = p.broker.clone();
    eventually("mislabelled message acked", move || {
        let broker = broker.clone();
        async move { broker.ack_count() == 1 }
    })
    .await;

    assert_eq!(p.emails.sent_count(), 0);
    let stats = p.stop().await;
    assert_eq!(stats[1].poisoned, 1);
}
