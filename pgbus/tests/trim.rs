use pgbus::{MessageStatus, SendOptions, TopicOptions};

mod common;

#[tokio::test]
async fn trim_keeps_last_acknowledged_and_all_unacknowledged() -> anyhow::Result<()> {
    let broker = common::create_broker("trim_basic").await?;
    let topic = broker
        .topic_with("orders", TopicOptions::default().max_retention(1))
        .await?;
    let subscription = topic.subscribe("billing").await?;

    let m1 = topic.send("m1", SendOptions::default()).await?;
    let m2 = topic.send("m2", SendOptions::default()).await?;

    for _ in 0..2 {
        let deliveries = subscription.reserve_next(1).await?;
        deliveries[0].complete().await?;
    }

    let m3 = topic.send("m3", SendOptions::default()).await?;

    assert_eq!(topic.trim().await?, 1);

    let remaining: Vec<String> = topic.messages().await?.into_iter().map(|m| m.id).collect();
    assert_eq!(remaining, vec![m2.id, m3.id.clone()]);
    assert!(!remaining.contains(&m1.id));

    // The unacknowledged message still has its state row.
    let waiting = subscription.messages(&[MessageStatus::Waiting]).await?;
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0].message_id, m3.id);

    broker.close().await?;

    Ok(())
}

#[tokio::test]
async fn topic_without_subscriptions_trims_to_the_cap() -> anyhow::Result<()> {
    let broker = common::create_broker("trim_no_subs").await?;
    let topic = broker
        .topic_with("orders", TopicOptions::default().max_retention(1))
        .await?;

    topic
        .send_bulk(vec!["m1", "m2", "m3"], SendOptions::default())
        .await?;

    // Everything counts as acknowledged, so only the retention cap remains.
    assert_eq!(topic.trim().await?, 2);
    assert_eq!(topic.messages().await?.len(), 1);

    broker.close().await?;

    Ok(())
}

#[tokio::test]
async fn unlimited_retention_never_trims() -> anyhow::Result<()> {
    let broker = common::create_broker("trim_unlimited").await?;
    let topic = broker
        .topic_with("audit", TopicOptions::default().unlimited_retention())
        .await?;

    topic
        .send_bulk(vec!["m1", "m2", "m3"], SendOptions::default())
        .await?;

    assert_eq!(topic.trim().await?, 0);
    assert_eq!(broker.trim().await?, 0);
    assert_eq!(topic.messages().await?.len(), 3);

    broker.close().await?;

    Ok(())
}

#[tokio::test]
async fn broker_trim_covers_every_finite_topic() -> anyhow::Result<()> {
    let broker = common::create_broker("trim_all").await?;

    let orders = broker
        .topic_with("orders", TopicOptions::default().max_retention(0))
        .await?;
    let audit = broker
        .topic_with("audit", TopicOptions::default().unlimited_retention())
        .await?;

    orders
        .send_bulk(vec!["a", "b"], SendOptions::default())
        .await?;
    audit
        .send_bulk(vec!["a", "b"], SendOptions::default())
        .await?;

    assert_eq!(broker.trim().await?, 2);
    assert!(orders.messages().await?.is_empty());
    assert_eq!(audit.messages().await?.len(), 2);

    broker.close().await?;

    Ok(())
}

#[tokio::test]
async fn trim_never_deletes_unacknowledged_messages() -> anyhow::Result<()> {
    let broker = common::create_broker("trim_safety").await?;
    let topic = broker
        .topic_with("orders", TopicOptions::default().max_retention(0))
        .await?;
    let subscription = topic.subscribe("billing").await?;

    topic
        .send_bulk(vec!["m1", "m2", "m3"], SendOptions::default())
        .await?;

    // Only the first message gets acknowledged.
    let deliveries = subscription.reserve_next(1).await?;
    deliveries[0].complete().await?;

    assert_eq!(topic.trim().await?, 1);

    let rows = subscription.messages(&[]).await?;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.status == MessageStatus::Waiting));

    broker.close().await?;

    Ok(())
}
