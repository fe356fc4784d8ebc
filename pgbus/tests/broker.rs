use pgbus::{BrokerOptions, SendOptions, TopicOptions};

mod common;

#[tokio::test]
async fn open_is_idempotent_across_processes() -> anyhow::Result<()> {
    let broker = common::create_broker("open_idempotent").await?;

    // A second broker against the same database observes the recorded
    // migrations and commits a no-op bootstrap.
    let second = pgbus::Broker::with_pool(
        broker.pool().clone(),
        BrokerOptions {
            background: false,
            ..BrokerOptions::default()
        },
    )
    .await?;

    let a = broker.topic("orders").await?;
    let b = second.topic("orders").await?;

    assert_eq!(a.id, b.id);

    broker.close().await?;

    Ok(())
}

#[tokio::test]
async fn double_close_is_a_noop() -> anyhow::Result<()> {
    let broker = common::create_broker("double_close").await?;

    broker.close().await?;
    broker.close().await?;

    assert!(broker.topic("orders").await.is_err());

    Ok(())
}

#[tokio::test]
async fn topic_configuration_is_immutable_after_creation() -> anyhow::Result<()> {
    let broker = common::create_broker("topic_immutable").await?;

    let first = broker
        .topic_with("orders", TopicOptions::default().max_retention(5))
        .await?;
    let second = broker
        .topic_with("orders", TopicOptions::default().max_retention(50))
        .await?;

    assert_eq!(first.id, second.id);
    assert_eq!(second.max_retention, Some(5));

    broker.close().await?;

    Ok(())
}

#[tokio::test]
async fn topic_remove_cascades() -> anyhow::Result<()> {
    let broker = common::create_broker("topic_remove").await?;

    let topic = broker.topic("orders").await?;
    let subscription = topic.subscribe("billing").await?;
    topic.send(serde_json::json!({"n": 1}), SendOptions::default())
        .await?;

    topic.remove().await?;

    let topic = broker.topic("orders").await?;
    assert!(topic.messages().await?.is_empty());
    assert_eq!(subscription.messages(&[]).await?.len(), 0);

    broker.close().await?;

    Ok(())
}
