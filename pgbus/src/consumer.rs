use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use dyn_clone::DynClone;
use serde_json::Value;
use tokio::{
    sync::{broadcast, watch, Notify},
    time::{interval_at, Instant},
};

use crate::{
    error::Result,
    message::Delivery,
    subscription::{ConsumptionMode, Subscription},
};

/// Processes one delivery at a time.
///
/// Returning `Ok` completes the message; returning `Err` records the error
/// stack and applies the subscription's retry policy. Implement it directly
/// for stateful handlers, or wrap an async closure with [`handler_fn`].
#[async_trait]
pub trait Handler: DynClone + Send + Sync {
    async fn handle(&self, delivery: Delivery) -> anyhow::Result<()>;
}

dyn_clone::clone_trait_object!(Handler);

/// Wraps an async closure into a [`Handler`].
///
/// ```rust,ignore
/// let consumer = subscription.consume(pgbus::handler_fn(|delivery| async move {
///     let payload: MyJob = delivery.data()?;
///     // ...
///     Ok(())
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> impl Handler + Clone
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler(Arc::new(move |delivery| {
        Box::pin(f(delivery)) as BoxHandlerFuture
    }))
}

type BoxHandlerFuture = std::pin::Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

struct FnHandler(Arc<dyn Fn(Delivery) -> BoxHandlerFuture + Send + Sync>);

impl Clone for FnHandler {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

#[async_trait]
impl Handler for FnHandler {
    async fn handle(&self, delivery: Delivery) -> anyhow::Result<()> {
        (self.0)(delivery).await
    }
}

/// Consumer tuning. `concurrency` is forced to 1 on sequential subscriptions.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    pub concurrency: usize,
    pub polling_interval: Duration,
    pub heartbeat_interval: Duration,
    pub autostart: bool,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            polling_interval: Duration::from_millis(1_000),
            heartbeat_interval: Duration::from_millis(10_000),
            autostart: true,
        }
    }
}

impl ConsumerOptions {
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);

        self
    }

    pub fn polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;

        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;

        self
    }

    pub fn autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;

        self
    }
}

/// In-process consumer notifications, fire-and-forget.
#[derive(Debug, Clone)]
pub enum ConsumerEvent {
    /// A drain pass was requested (explicitly or by the poll loop).
    Consume,
    /// A reserved message was dispatched to the handler.
    Process { message_id: String, attempts: i32 },
    Completed {
        message_id: String,
    },
    Failed {
        message_id: String,
        error: String,
    },
    Progress {
        message_id: String,
        progress: Value,
    },
    /// The drain ended with nothing reserved and nothing in flight.
    Idle,
}

struct ConsumerInner {
    subscription: Subscription,
    handler: Box<dyn Handler>,
    options: ConsumerOptions,
    events: broadcast::Sender<ConsumerEvent>,
    in_flight: AtomicUsize,
    slots: Notify,
    draining: AtomicBool,
    pending_drain: AtomicBool,
    idle: watch::Sender<bool>,
    init: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    poll_handle: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// A poll-driven worker bound to one subscription.
///
/// Cheap to clone; all clones share the same drain state and event channel.
#[derive(Clone)]
pub struct Consumer(Arc<ConsumerInner>);

impl Consumer {
    pub(crate) fn create(
        subscription: Subscription,
        handler: Box<dyn Handler>,
        mut options: ConsumerOptions,
    ) -> Self {
        if subscription.mode == ConsumptionMode::Sequential {
            options.concurrency = 1;
        }
        options.concurrency = options.concurrency.max(1);

        let (events, _) = broadcast::channel(256);
        let (idle, _) = watch::channel(true);
        let (init, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);

        let consumer = Self(Arc::new(ConsumerInner {
            subscription: subscription.clone(),
            handler,
            options,
            events,
            in_flight: AtomicUsize::new(0),
            slots: Notify::new(),
            draining: AtomicBool::new(false),
            pending_drain: AtomicBool::new(false),
            idle,
            init,
            shutdown,
            poll_handle: parking_lot::Mutex::new(None),
        }));

        subscription.broker.register_consumer(consumer.clone());

        if consumer.0.options.autostart {
            consumer.start();
        }

        consumer.0.init.send_replace(true);

        consumer
    }

    pub fn subscription(&self) -> &Subscription {
        &self.0.subscription
    }

    /// Subscribes to this consumer's event stream.
    pub fn events(&self) -> broadcast::Receiver<ConsumerEvent> {
        self.0.events.subscribe()
    }

    /// Starts the poll loop. Idempotent; a stopped consumer stays stopped.
    pub fn start(&self) {
        let mut guard = self.0.poll_handle.lock();

        if guard.is_some() || *self.0.shutdown.borrow() {
            return;
        }

        let consumer = self.clone();
        let mut shutdown_rx = self.0.shutdown.subscribe();

        *guard = Some(tokio::spawn(async move {
            let period = consumer.0.options.polling_interval;
            let mut interval = interval_at(Instant::now(), period);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(err) = consumer.consume().await {
                            tracing::error!(
                                error = %err,
                                subscription = %consumer.0.subscription.name,
                                "drain failed, retrying on next poll"
                            );
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Stops polling and waits for the in-progress drain to reach idle.
    pub async fn stop(&self) {
        self.0.shutdown.send_replace(true);

        let handle = self.0.poll_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        self.wait_idle().await;
    }

    /// Runs one drain pass.
    ///
    /// Coalescing: when a drain is already in progress this call joins it;
    /// the running drain picks up the request and the call returns once the
    /// consumer is idle again.
    pub async fn consume(&self) -> Result<()> {
        let _ = self.0.events.send(ConsumerEvent::Consume);

        if self.0.draining.swap(true, Ordering::SeqCst) {
            self.0.pending_drain.store(true, Ordering::SeqCst);
            self.wait_idle().await;

            return Ok(());
        }

        self.0.idle.send_replace(false);

        let result = async {
            loop {
                self.drain().await?;

                if !self.0.pending_drain.swap(false, Ordering::SeqCst) {
                    return Ok(());
                }
            }
        }
        .await;

        self.0.draining.store(false, Ordering::SeqCst);
        self.0.idle.send_replace(true);

        if result.is_ok() {
            let _ = self.0.events.send(ConsumerEvent::Idle);
        }

        result
    }

    /// Resolves when no drain is running and nothing is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.0.idle.subscribe();

        loop {
            if *rx.borrow() && !self.0.draining.load(Ordering::SeqCst) {
                return;
            }

            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Resolves once the consumer is registered and (if autostarted) polling.
    pub async fn wait_init(&self) {
        let mut rx = self.0.init.subscribe();

        loop {
            if *rx.borrow() {
                return;
            }

            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn drain(&self) -> Result<()> {
        loop {
            let in_flight = self.0.in_flight.load(Ordering::SeqCst);
            let free = self.0.options.concurrency.saturating_sub(in_flight);

            if free == 0 {
                self.0.slots.notified().await;
                continue;
            }

            let deliveries = self.0.subscription.reserve_next(free).await?;

            if deliveries.is_empty() {
                if self.0.in_flight.load(Ordering::SeqCst) == 0 {
                    return Ok(());
                }

                self.0.slots.notified().await;
                continue;
            }

            for delivery in deliveries {
                self.dispatch(delivery);
            }
        }
    }

    fn dispatch(&self, mut delivery: Delivery) {
        self.0.in_flight.fetch_add(1, Ordering::SeqCst);
        delivery.events = Some(self.0.events.clone());

        let _ = self.0.events.send(ConsumerEvent::Process {
            message_id: delivery.message_id.to_owned(),
            attempts: delivery.attempts,
        });

        let consumer = self.clone();
        let handler = self.0.handler.clone();

        tokio::spawn(async move {
            let heartbeat = {
                let delivery = delivery.clone();
                let period = consumer.0.options.heartbeat_interval;

                tokio::spawn(async move {
                    let mut interval = interval_at(Instant::now() + period, period);

                    loop {
                        interval.tick().await;

                        if let Err(err) = delivery.heartbeat().await {
                            tracing::error!(
                                error = %err,
                                message_id = %delivery.message_id,
                                "heartbeat write failed"
                            );
                        }
                    }
                })
            };

            let result = handler.handle(delivery.clone()).await;
            heartbeat.abort();

            match result {
                Ok(()) => match delivery.complete().await {
                    Ok(()) => {
                        let _ = consumer.0.events.send(ConsumerEvent::Completed {
                            message_id: delivery.message_id.to_owned(),
                        });
                    }
                    Err(err) => {
                        tracing::error!(
                            error = %err,
                            message_id = %delivery.message_id,
                            "failed to complete message"
                        );
                    }
                },
                Err(err) => {
                    let error = format!("{err:?}");

                    if let Err(err) = delivery.fail(&error).await {
                        tracing::error!(
                            error = %err,
                            message_id = %delivery.message_id,
                            "failed to record handler failure"
                        );
                    }

                    let _ = consumer.0.events.send(ConsumerEvent::Failed {
                        message_id: delivery.message_id.to_owned(),
                        error,
                    });
                }
            }

            consumer.0.in_flight.fetch_sub(1, Ordering::SeqCst);
            consumer.0.slots.notify_one();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options_match_documented_defaults() {
        let options = ConsumerOptions::default();

        assert_eq!(options.concurrency, 1);
        assert_eq!(options.polling_interval, Duration::from_millis(1_000));
        assert_eq!(options.heartbeat_interval, Duration::from_millis(10_000));
        assert!(options.autostart);
    }

    #[test]
    fn concurrency_never_drops_below_one() {
        assert_eq!(ConsumerOptions::default().concurrency(0).concurrency, 1);
    }
}
