//! Integration tests for the MOM against the in-process broker.
//!
//! These tests cover:
//! - Queue and topic delivery semantics
//! - Acknowledgement modes (concurrent, single threaded, transacted)
//! - Durable subscriptions and selectors
//! - Request/reply including timeouts and cancellation
//! - Failover when the broker goes away and comes back

use jobs::{JobContext, JobError, JobFilter, JobInput, JobManager, RunContext, Transaction};
use mom::environment;
use mom::*;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Helpers
// ============================================================================

fn test_environment(broker: &MemoryBroker) -> MomEnvironment {
    MomEnvironment::new()
        .with(environment::SYMBOLIC_NAME, "it")
        .with(environment::RECEIVE_TIMEOUT_MILLIS, "20")
        .with(environment::CONNECTION_RETRY_COUNT, "1")
        .with(environment::CONNECTION_RETRY_INTERVAL_MILLIS, "5")
        .with(environment::SESSION_RETRY_INTERVAL_MILLIS, "10")
        .with_connection_factory(Arc::new(broker.clone()))
}

async fn start(broker: &MemoryBroker) -> Mom {
    core_config::tracing::init_tracing(&core_config::Environment::Development);
    Mom::init(test_environment(broker), JobManager::new("it")).await.unwrap()
}

/// Poll `condition` until it holds, failing the test after five seconds.
async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn collector<T>() -> Arc<Mutex<Vec<T>>> {
    Arc::new(Mutex::new(Vec::new()))
}

fn timeout(millis: u64) -> PublishInput {
    PublishInput::new().with_request_reply_timeout(Duration::from_millis(millis))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u32,
    item: String,
}

// ============================================================================
// Publish / Subscribe
// ============================================================================

#[tokio::test]
async fn test_queue_delivers_each_message_to_one_subscriber() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let work = Destination::<u32>::queue("work");
    let seen = collector();

    for _ in 0..3 {
        let seen = seen.clone();
        mom.subscribe(
            &work,
            move |message: Message<u32>, _ctx: JobContext| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(*message.transfer_object());
                    Ok(())
                }
            },
            SubscribeInput::new(),
        )
        .await
        .unwrap();
    }

    for n in 0..30 {
        mom.publish(&work, &n, PublishInput::new()).await.unwrap();
    }

    eventually("all messages", || seen.lock().unwrap().len() >= 30).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut seen = seen.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, (0..30).collect::<Vec<_>>());
    mom.destroy().await;
}

#[tokio::test]
async fn test_topic_fans_out_to_active_subscribers_only() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let news = Destination::<String>::topic("news");
    let early = collector();
    let late = collector();

    for _ in 0..2 {
        let early = early.clone();
        mom.subscribe(
            &news,
            move |message: Message<String>, _ctx: JobContext| {
                let early = early.clone();
                async move {
                    early.lock().unwrap().push(message.transfer_object().clone());
                    Ok(())
                }
            },
            SubscribeInput::new(),
        )
        .await
        .unwrap();
    }

    mom.publish(&news, &"headline".to_string(), PublishInput::new())
        .await
        .unwrap();
    eventually("both subscribers", || early.lock().unwrap().len() == 2).await;

    let late_seen = late.clone();
    mom.subscribe(
        &news,
        move |message: Message<String>, _ctx: JobContext| {
            let late = late_seen.clone();
            async move {
                late.lock().unwrap().push(message.transfer_object().clone());
                Ok(())
            }
        },
        SubscribeInput::new(),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(late.lock().unwrap().is_empty());
    assert_eq!(early.lock().unwrap().len(), 2);
    mom.destroy().await;
}

#[tokio::test]
async fn test_queue_keeps_messages_until_first_consumer() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let inbox = Destination::<String>::queue("inbox");

    mom.publish(&inbox, &"waiting".to_string(), PublishInput::new())
        .await
        .unwrap();
    assert_eq!(broker.queue_depth("inbox"), 1);

    let seen = collector();
    let sink = seen.clone();
    mom.subscribe(
        &inbox,
        move |message: Message<String>, _ctx: JobContext| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(message.transfer_object().clone());
                Ok(())
            }
        },
        SubscribeInput::new(),
    )
    .await
    .unwrap();

    eventually("retained message", || seen.lock().unwrap().len() == 1).await;
    assert_eq!(seen.lock().unwrap()[0], "waiting");
    mom.destroy().await;
}

#[tokio::test]
async fn test_queue_without_consumer_drops_when_required() {
    let broker = MemoryBroker::with_config(
        MemoryBrokerConfig::default().with_queue_retention(QueueRetention::RequireConsumer),
    );
    let mom = start(&broker).await;
    let inbox = Destination::<String>::queue("inbox");

    mom.publish(&inbox, &"lost".to_string(), PublishInput::new())
        .await
        .unwrap();

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    mom.subscribe(
        &inbox,
        move |_message: Message<String>, _ctx: JobContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        },
        SubscribeInput::new(),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 0);
    mom.destroy().await;
}

#[tokio::test]
async fn test_expired_message_is_not_delivered() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let inbox = Destination::<String>::queue("short-lived");

    mom.publish(
        &inbox,
        &"stale".to_string(),
        PublishInput::new().with_time_to_live(Duration::from_millis(10)),
    )
    .await
    .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    mom.subscribe(
        &inbox,
        move |_message: Message<String>, _ctx: JobContext| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        },
        SubscribeInput::new(),
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(seen.load(Ordering::SeqCst), 0);
    mom.destroy().await;
}

#[tokio::test]
async fn test_user_properties_and_object_marshalling() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let orders = Destination::<Order>::queue("orders");
    let seen = collector();

    let sink = seen.clone();
    mom.subscribe(
        &orders,
        move |message: Message<Order>, ctx: JobContext| {
            let sink = sink.clone();
            async move {
                let current = Message::<Order>::current(&ctx).map(|m| m.transfer_object().clone());
                sink.lock().unwrap().push((
                    message.transfer_object().clone(),
                    message.property("tenant").cloned(),
                    current,
                ));
                Ok(())
            }
        },
        SubscribeInput::new(),
    )
    .await
    .unwrap();

    let order = Order {
        id: 7,
        item: "keyboard".into(),
    };
    mom.publish(&orders, &order, PublishInput::new().with_property("tenant", "acme"))
        .await
        .unwrap();

    eventually("order", || seen.lock().unwrap().len() == 1).await;
    let (received, tenant, current) = seen.lock().unwrap()[0].clone();
    assert_eq!(received, order);
    assert_eq!(tenant, Some(serde_json::json!("acme")));
    assert_eq!(current, Some(order));
    mom.destroy().await;
}

#[tokio::test]
async fn test_selector_filters_messages() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let events = Destination::<String>::topic("events");
    let seen = collector();

    let sink = seen.clone();
    mom.subscribe(
        &events,
        move |message: Message<String>, _ctx: JobContext| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(message.transfer_object().clone());
                Ok(())
            }
        },
        SubscribeInput::new().with_selector("region = 'eu' AND priority > 2"),
    )
    .await
    .unwrap();

    for (region, priority, body) in [("eu", 5, "match"), ("us", 5, "wrong region"), ("eu", 1, "too low")] {
        mom.publish(
            &events,
            &body.to_string(),
            PublishInput::new()
                .with_property("region", region)
                .with_property("priority", priority),
        )
        .await
        .unwrap();
    }

    eventually("selected message", || !seen.lock().unwrap().is_empty()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*seen.lock().unwrap(), vec!["match".to_string()]);
    mom.destroy().await;
}

#[tokio::test]
async fn test_invalid_selector_is_rejected() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let events = Destination::<String>::topic("events");

    let error = mom
        .subscribe(
            &events,
            |_message: Message<String>, _ctx: JobContext| async { Ok(()) },
            SubscribeInput::new().with_selector("region = "),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, MomError::Config(_)));
    mom.destroy().await;
}

#[tokio::test]
async fn test_concurrency_bound_in_auto_mode() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let work = Destination::<u32>::queue("bounded");
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let (r, p, d) = (running.clone(), peak.clone(), done.clone());
    mom.subscribe(
        &work,
        move |_message: Message<u32>, _ctx: JobContext| {
            let (running, peak, done) = (r.clone(), p.clone(), d.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
        SubscribeInput::new().with_max_concurrent_consumer_jobs(2),
    )
    .await
    .unwrap();

    for n in 0..8 {
        mom.publish(&work, &n, PublishInput::new()).await.unwrap();
    }

    eventually("all handled", || done.load(Ordering::SeqCst) == 8).await;
    assert!(peak.load(Ordering::SeqCst) <= 2);
    mom.destroy().await;
}

#[tokio::test]
async fn test_bounded_subscriber_leaves_backlog_to_others() {
    let broker = MemoryBroker::new();
    let busy = start(&broker).await;
    let idle = start(&broker).await;
    let work = Destination::<u32>::queue("backpressure");
    let busy_handled = Arc::new(AtomicUsize::new(0));
    let idle_handled = Arc::new(AtomicUsize::new(0));

    let counter = busy_handled.clone();
    busy.subscribe(
        &work,
        move |_message: Message<u32>, _ctx: JobContext| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
        SubscribeInput::new().with_max_concurrent_consumer_jobs(1),
    )
    .await
    .unwrap();

    for n in 0..20 {
        busy.publish(&work, &n, PublishInput::new()).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    // one message in the handler, the rest still on the broker
    assert!(broker.queue_depth("backpressure") >= 18);

    let counter = idle_handled.clone();
    idle.subscribe(
        &work,
        move |_message: Message<u32>, _ctx: JobContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
        SubscribeInput::new(),
    )
    .await
    .unwrap();

    eventually("all handled", || {
        busy_handled.load(Ordering::SeqCst) + idle_handled.load(Ordering::SeqCst) == 20
    })
    .await;
    assert!(idle_handled.load(Ordering::SeqCst) >= 15);
    busy.destroy().await;
    idle.destroy().await;
}

#[tokio::test]
async fn test_single_threaded_preserves_order() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let steps = Destination::<u32>::queue("steps");
    let seen = collector();

    let sink = seen.clone();
    mom.subscribe(
        &steps,
        move |message: Message<u32>, _ctx: JobContext| {
            let sink = sink.clone();
            async move {
                // later messages would overtake if handlers overlapped
                tokio::time::sleep(Duration::from_millis(5)).await;
                sink.lock().unwrap().push(*message.transfer_object());
                Ok(())
            }
        },
        SubscribeInput::new().with_acknowledgement_mode(AcknowledgementMode::AutoSingleThreaded),
    )
    .await
    .unwrap();

    for n in 0..10 {
        mom.publish(&steps, &n, PublishInput::new()).await.unwrap();
    }

    eventually("all steps", || seen.lock().unwrap().len() == 10).await;
    assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    mom.destroy().await;
}

#[tokio::test]
async fn test_dispose_waits_for_running_handler() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let slow = Destination::<u32>::queue("slow");
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let (s, f) = (started.clone(), finished.clone());
    let subscription = mom
        .subscribe(
            &slow,
            move |_message: Message<u32>, _ctx: JobContext| {
                let (started, finished) = (s.clone(), f.clone());
                async move {
                    started.store(true, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    finished.store(true, Ordering::SeqCst);
                    Ok(())
                }
            },
            SubscribeInput::new().with_acknowledgement_mode(AcknowledgementMode::AutoSingleThreaded),
        )
        .await
        .unwrap();
    assert_eq!(mom.get_subscriptions().len(), 1);

    mom.publish(&slow, &1, PublishInput::new()).await.unwrap();
    eventually("handler start", || started.load(Ordering::SeqCst)).await;

    subscription.dispose().await;
    assert!(finished.load(Ordering::SeqCst));
    assert!(subscription.is_disposed());
    assert!(mom.get_subscriptions().is_empty());

    // idempotent
    subscription.dispose().await;
    mom.destroy().await;
}

#[tokio::test]
async fn test_failing_handler_does_not_stop_subscription() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let jobs = Destination::<u32>::queue("flaky");
    let seen = collector();

    let sink = seen.clone();
    mom.subscribe(
        &jobs,
        move |message: Message<u32>, _ctx: JobContext| {
            let sink = sink.clone();
            async move {
                let n = *message.transfer_object();
                sink.lock().unwrap().push(n);
                if n == 1 {
                    return Err(MomError::processing("boom"));
                }
                Ok(())
            }
        },
        SubscribeInput::new().with_acknowledgement_mode(AcknowledgementMode::AutoSingleThreaded),
    )
    .await
    .unwrap();

    for n in 1..=3 {
        mom.publish(&jobs, &n, PublishInput::new()).await.unwrap();
    }

    eventually("all messages", || seen.lock().unwrap().len() == 3).await;
    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    mom.destroy().await;
}

// ============================================================================
// Transactions
// ============================================================================

#[tokio::test]
async fn test_transactional_publish_sent_on_commit() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let ledger = Destination::<String>::queue("ledger");

    let tx = Transaction::new();
    let input = || {
        PublishInput::new()
            .with_transactional(true)
            .with_run_context(RunContext::new().with_transaction(tx.clone()))
    };
    mom.publish(&ledger, &"debit".to_string(), input()).await.unwrap();
    mom.publish(&ledger, &"credit".to_string(), input()).await.unwrap();
    assert_eq!(broker.queue_depth("ledger"), 0);

    tx.commit().await.unwrap();
    assert_eq!(broker.queue_depth("ledger"), 2);
    mom.destroy().await;
}

#[tokio::test]
async fn test_transactional_publish_discarded_on_rollback() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let ledger = Destination::<String>::queue("ledger");

    let tx = Transaction::new();
    mom.publish(
        &ledger,
        &"debit".to_string(),
        PublishInput::new()
            .with_transactional(true)
            .with_run_context(RunContext::new().with_transaction(tx.clone())),
    )
    .await
    .unwrap();

    tx.rollback().await;
    assert_eq!(broker.queue_depth("ledger"), 0);
    mom.destroy().await;
}

#[tokio::test]
async fn test_transactional_publish_needs_transaction() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let ledger = Destination::<String>::queue("ledger");

    let error = mom
        .publish(&ledger, &"debit".to_string(), PublishInput::new().with_transactional(true))
        .await
        .unwrap_err();
    assert!(matches!(error, MomError::Config(_)));
    mom.destroy().await;
}

#[tokio::test]
async fn test_transacted_subscription_redelivers_until_success() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let payments = Destination::<String>::queue("payments");
    let attempts = collector();

    let sink = attempts.clone();
    mom.subscribe(
        &payments,
        move |message: Message<String>, _ctx: JobContext| {
            let sink = sink.clone();
            async move {
                let attempt = {
                    let mut attempts = sink.lock().unwrap();
                    attempts.push(message.is_redelivered());
                    attempts.len()
                };
                if attempt <= 3 {
                    return Err(MomError::processing(format!("attempt {attempt} failed")));
                }
                Ok(())
            }
        },
        SubscribeInput::new().with_acknowledgement_mode(AcknowledgementMode::Transacted),
    )
    .await
    .unwrap();

    mom.publish(&payments, &"pay".to_string(), PublishInput::new())
        .await
        .unwrap();

    eventually("four attempts", || attempts.lock().unwrap().len() == 4).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*attempts.lock().unwrap(), vec![false, true, true, true]);
    assert_eq!(broker.queue_depth("payments"), 0);
    mom.destroy().await;
}

// ============================================================================
// Durable subscriptions
// ============================================================================

#[tokio::test]
async fn test_durable_subscription_keeps_backlog() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let audit = Destination::<u32>::topic("audit");
    let seen = collector();

    let durable = || SubscribeInput::new().with_durable_subscription_name("auditor");
    let subscribe = |seen: Arc<Mutex<Vec<u32>>>| {
        move |message: Message<u32>, _ctx: JobContext| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(*message.transfer_object());
                Ok(())
            }
        }
    };

    let subscription = mom.subscribe(&audit, subscribe(seen.clone()), durable()).await.unwrap();
    assert_eq!(subscription.durable_subscription_name(), Some("auditor"));
    subscription.dispose().await;

    mom.publish(&audit, &1, PublishInput::new()).await.unwrap();
    mom.publish(&audit, &2, PublishInput::new()).await.unwrap();
    assert_eq!(broker.durable_backlog("auditor"), Some(2));

    mom.subscribe(&audit, subscribe(seen.clone()), durable()).await.unwrap();
    eventually("backlog", || seen.lock().unwrap().len() == 2).await;
    assert_eq!(*seen.lock().unwrap(), vec![1, 2]);

    mom.cancel_durable_subscription("auditor").await.unwrap();
    assert!(mom.get_subscriptions().is_empty());
    assert_eq!(broker.durable_backlog("auditor"), None);
    mom.destroy().await;
}

#[tokio::test]
async fn test_cancelled_durable_subscription_drops_backlog() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let audit = Destination::<u32>::topic("audit");
    let seen = collector();

    let durable = || SubscribeInput::new().with_durable_subscription_name("archiver");
    let subscribe = |seen: Arc<Mutex<Vec<u32>>>| {
        move |message: Message<u32>, _ctx: JobContext| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(*message.transfer_object());
                Ok(())
            }
        }
    };

    mom.subscribe(&audit, subscribe(seen.clone()), durable())
        .await
        .unwrap()
        .dispose()
        .await;
    mom.publish(&audit, &1, PublishInput::new()).await.unwrap();
    mom.publish(&audit, &2, PublishInput::new()).await.unwrap();
    assert_eq!(broker.durable_backlog("archiver"), Some(2));

    mom.cancel_durable_subscription("archiver").await.unwrap();
    assert_eq!(broker.durable_backlog("archiver"), None);

    mom.subscribe(&audit, subscribe(seen.clone()), durable()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(seen.lock().unwrap().is_empty());

    mom.publish(&audit, &3, PublishInput::new()).await.unwrap();
    eventually("fresh message", || !seen.lock().unwrap().is_empty()).await;
    assert_eq!(*seen.lock().unwrap(), vec![3]);
    mom.destroy().await;
}

#[tokio::test]
async fn test_durable_subscription_needs_topic() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let queue = Destination::<u32>::queue("not-a-topic");

    let error = mom
        .subscribe(
            &queue,
            |_message: Message<u32>, _ctx: JobContext| async { Ok(()) },
            SubscribeInput::new().with_durable_subscription_name("nope"),
        )
        .await
        .unwrap_err();
    assert!(matches!(error, MomError::Config(_)));
    mom.destroy().await;
}

// ============================================================================
// Request / Reply
// ============================================================================

async fn echo_replier(mom: &Mom, destination: &BiDestination<String, String>) -> Subscription {
    mom.reply(
        destination,
        |message: Message<String>, _ctx: JobContext| async move { Ok(message.transfer_object().to_uppercase()) },
        SubscribeInput::new(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_request_reply_round_trip() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let echo = BiDestination::<String, String>::queue("echo");
    echo_replier(&mom, &echo).await;

    let answer = mom.request(&echo, &"hello".to_string(), timeout(5_000)).await.unwrap();
    assert_eq!(answer, "HELLO");
    mom.destroy().await;
}

#[tokio::test]
async fn test_request_before_replier_is_answered() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let echo = BiDestination::<String, String>::queue("echo");

    let early = "early".to_string();
    let (answer, _subscription) = tokio::join!(mom.request(&echo, &early, timeout(5_000)), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        echo_replier(&mom, &echo).await
    });
    assert_eq!(answer.unwrap(), "EARLY");
    mom.destroy().await;
}

#[tokio::test]
async fn test_request_times_out_without_replier() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let nobody = BiDestination::<String, String>::queue("nobody");

    let error = mom
        .request(&nobody, &"anyone?".to_string(), timeout(50))
        .await
        .unwrap_err();
    assert!(matches!(error, MomError::TimedOut(_)));
    assert!(error.is_timeout());
    mom.destroy().await;
}

#[tokio::test]
async fn test_abandoned_request_interrupts_replier() {
    let broker = MemoryBroker::new();
    let requester = start(&broker).await;
    let replier = start(&broker).await;
    let slow = BiDestination::<String, String>::queue("slow");
    let started = Arc::new(AtomicBool::new(false));
    let interrupted = Arc::new(AtomicBool::new(false));

    let (s, i) = (started.clone(), interrupted.clone());
    replier
        .reply(
            &slow,
            move |_message: Message<String>, ctx: JobContext| {
                let (started, interrupted) = (s.clone(), i.clone());
                async move {
                    started.store(true, Ordering::SeqCst);
                    match ctx.sleep(Duration::from_secs(30)).await {
                        Ok(()) => Ok("too late".to_string()),
                        Err(e) => {
                            interrupted.store(true, Ordering::SeqCst);
                            Err(MomError::from(e))
                        }
                    }
                }
            },
            SubscribeInput::new(),
        )
        .await
        .unwrap();

    let error = requester
        .request(&slow, &"work".to_string(), timeout(200))
        .await
        .unwrap_err();
    assert!(error.is_timeout());
    assert!(started.load(Ordering::SeqCst));

    eventually("replier interrupted", || interrupted.load(Ordering::SeqCst)).await;
    requester.destroy().await;
    replier.destroy().await;
}

/// A replier that sleeps until interrupted, flagging when it started and
/// when it was interrupted.
async fn sleepy_replier(
    mom: &Mom,
    destination: &BiDestination<String, String>,
    started: Arc<AtomicBool>,
    interrupted: Arc<AtomicBool>,
) {
    mom.reply(
        destination,
        move |_message: Message<String>, ctx: JobContext| {
            let (started, interrupted) = (started.clone(), interrupted.clone());
            async move {
                started.store(true, Ordering::SeqCst);
                match ctx.sleep(Duration::from_secs(30)).await {
                    Ok(()) => Ok("too late".to_string()),
                    Err(e) => {
                        interrupted.store(true, Ordering::SeqCst);
                        Err(MomError::from(e))
                    }
                }
            }
        },
        SubscribeInput::new(),
    )
    .await
    .unwrap();
}

fn pending_requests(mom: &Mom) -> usize {
    mom.job_manager()
        .get_futures(&JobFilter::not_done())
        .iter()
        .filter(|job| job.name().starts_with("mom.request "))
        .count()
}

#[tokio::test]
async fn test_cancelled_caller_job_interrupts_replier() {
    let broker = MemoryBroker::new();
    let requester = start(&broker).await;
    let replier = start(&broker).await;
    let slow = BiDestination::<String, String>::queue("slow");
    let started = Arc::new(AtomicBool::new(false));
    let interrupted = Arc::new(AtomicBool::new(false));
    sleepy_replier(&replier, &slow, started.clone(), interrupted.clone()).await;

    let (client, destination) = (requester.clone(), slow.clone());
    let caller = requester.job_manager().schedule(
        move |ctx: JobContext| async move {
            client
                .request(&destination, &"work".to_string(), PublishInput::new().with_job_context(&ctx))
                .await
                .map_err(JobError::from)
        },
        JobInput::new("caller"),
    );

    eventually("replier started", || started.load(Ordering::SeqCst)).await;
    assert!(caller.cancel(true));

    let outcome = tokio::time::timeout(Duration::from_secs(5), caller.await_done_and_get())
        .await
        .unwrap();
    assert!(outcome.unwrap_err().is_cancellation());
    eventually("replier interrupted", || interrupted.load(Ordering::SeqCst)).await;
    eventually("request job ended", || pending_requests(&requester) == 0).await;
    requester.destroy().await;
    replier.destroy().await;
}

#[tokio::test]
async fn test_dropped_request_interrupts_replier() {
    let broker = MemoryBroker::new();
    let requester = start(&broker).await;
    let replier = start(&broker).await;
    let slow = BiDestination::<String, String>::queue("slow");
    let started = Arc::new(AtomicBool::new(false));
    let interrupted = Arc::new(AtomicBool::new(false));
    sleepy_replier(&replier, &slow, started.clone(), interrupted.clone()).await;

    let work = "work".to_string();
    let request = requester.request(&slow, &work, PublishInput::new());
    tokio::select! {
        answer = request => panic!("unexpected answer {answer:?}"),
        _ = eventually("replier started", || started.load(Ordering::SeqCst)) => {}
    }

    eventually("replier interrupted", || interrupted.load(Ordering::SeqCst)).await;
    eventually("request job ended", || pending_requests(&requester) == 0).await;
    requester.destroy().await;
    replier.destroy().await;
}

#[tokio::test]
async fn test_requests_timing_out_leave_no_jobs_behind() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let nobody = BiDestination::<String, String>::queue("nobody");

    for _ in 0..5 {
        let outcome = tokio::time::timeout(
            Duration::from_millis(50),
            mom.request(&nobody, &"anyone?".to_string(), PublishInput::new()),
        )
        .await;
        assert!(outcome.is_err());
    }

    eventually("request jobs ended", || pending_requests(&mom) == 0).await;
    mom.destroy().await;
}

#[tokio::test]
async fn test_topic_request_takes_first_reply() {
    let broker = MemoryBroker::new();
    let requester = start(&broker).await;
    let repliers = [start(&broker).await, start(&broker).await];
    let quote = BiDestination::<String, String>::topic("quote");
    let calls = Arc::new(AtomicUsize::new(0));

    for (n, replier) in repliers.iter().enumerate() {
        let calls = calls.clone();
        replier
            .reply(
                &quote,
                move |message: Message<String>, _ctx: JobContext| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(format!("replier {n}: {}", message.transfer_object()))
                    }
                },
                SubscribeInput::new(),
            )
            .await
            .unwrap();
    }

    let first = requester.request(&quote, &"one".to_string(), timeout(5_000)).await.unwrap();
    assert!(first.ends_with(": one"), "{first}");
    eventually("both repliers answered", || calls.load(Ordering::SeqCst) == 2).await;

    // the late duplicate must not leak into the next request
    let second = requester.request(&quote, &"two".to_string(), timeout(5_000)).await.unwrap();
    assert!(second.ends_with(": two"), "{second}");
    eventually("both repliers answered again", || calls.load(Ordering::SeqCst) == 4).await;

    requester.destroy().await;
    for replier in repliers {
        replier.destroy().await;
    }
}

#[tokio::test]
async fn test_requests_spread_over_repliers() {
    let broker = MemoryBroker::new();
    let requester = start(&broker).await;
    let first = start(&broker).await;
    let second = start(&broker).await;
    let echo = BiDestination::<String, String>::queue("echo");
    let calls = Arc::new(AtomicUsize::new(0));

    for replier in [&first, &second] {
        let calls = calls.clone();
        replier
            .reply(
                &echo,
                move |message: Message<String>, _ctx: JobContext| {
                    let calls = calls.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(message.transfer_object().to_uppercase())
                    }
                },
                SubscribeInput::new(),
            )
            .await
            .unwrap();
    }

    for n in 0..10 {
        let answer = requester
            .request(&echo, &format!("call {n}"), timeout(5_000))
            .await
            .unwrap();
        assert_eq!(answer, format!("CALL {n}"));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 10);

    for mom in [requester, first, second] {
        mom.destroy().await;
    }
}

#[tokio::test]
async fn test_remote_failure_with_structured_marshaller() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let validate = BiDestination::<Order, bool>::queue("validate");

    mom.reply(
        &validate,
        |message: Message<Order>, _ctx: JobContext| async move {
            if message.transfer_object().item.is_empty() {
                return Err(MomError::processing("item must not be empty\nat validate.rs:12"));
            }
            Ok(true)
        },
        SubscribeInput::new(),
    )
    .await
    .unwrap();

    let order = Order { id: 1, item: String::new() };
    match mom.request(&validate, &order, timeout(5_000)).await {
        Err(MomError::Remote(remote)) => assert_eq!(remote.message, "item must not be empty"),
        other => panic!("expected remote error, got {other:?}"),
    }
    mom.destroy().await;
}

#[tokio::test]
async fn test_remote_failure_with_text_marshaller_is_generic() {
    let broker = MemoryBroker::new();
    let mom = Mom::init(
        test_environment(&broker).with(environment::MARSHALLER, "text"),
        JobManager::new("it"),
    )
    .await
    .unwrap();
    let login = BiDestination::<String, String>::queue("login");

    mom.reply(
        &login,
        |_message: Message<String>, _ctx: JobContext| async move {
            Err::<String, _>(MomError::processing("password for admin is hunter2"))
        },
        SubscribeInput::new(),
    )
    .await
    .unwrap();

    let error = mom.request(&login, &"admin".to_string(), timeout(5_000)).await.unwrap_err();
    assert!(matches!(error, MomError::Processing(_)));
    assert!(!error.to_string().contains("hunter2"));
    mom.destroy().await;
}

#[tokio::test]
async fn test_request_correlation_ids() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let whoami = BiDestination::<String, String>::queue("whoami");
    let seen = collector();

    let sink = seen.clone();
    mom.reply(
        &whoami,
        move |message: Message<String>, ctx: JobContext| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push((
                    message.correlation_id().map(str::to_string),
                    message.caller_correlation_id().map(str::to_string),
                    ctx.run_context().correlation_id().map(str::to_string),
                ));
                Ok("ok".to_string())
            }
        },
        SubscribeInput::new(),
    )
    .await
    .unwrap();

    let input = timeout(5_000).with_run_context(RunContext::new().with_correlation_id("order-42"));
    mom.request(&whoami, &"?".to_string(), input).await.unwrap();

    let (correlation_id, caller, ambient) = seen.lock().unwrap()[0].clone();
    let correlation_id = correlation_id.unwrap();
    assert!(correlation_id.starts_with(REPLY_ID_PREFIX));
    assert_eq!(caller.as_deref(), Some("order-42"));
    assert_eq!(ambient, Some(correlation_id));
    mom.destroy().await;
}

#[tokio::test]
async fn test_custom_cancellation_topic() {
    let broker = MemoryBroker::new();
    let mom = Mom::init(
        test_environment(&broker).with(environment::REQUEST_REPLY_CANCELLATION_TOPIC, "define:///ops.cancel"),
        JobManager::new("it"),
    )
    .await
    .unwrap();

    assert_eq!(broker.subscriber_count("ops.cancel"), 1);
    assert_eq!(broker.subscriber_count(DEFAULT_CANCELLATION_TOPIC), 0);
    // not listed with the user's subscriptions
    assert!(mom.get_subscriptions().is_empty());
    mom.destroy().await;
    assert_eq!(broker.subscriber_count("ops.cancel"), 0);
}

#[tokio::test]
async fn test_request_reply_disabled() {
    let broker = MemoryBroker::new();
    let mom = Mom::init(
        test_environment(&broker).with(environment::REQUEST_REPLY_ENABLED, "false"),
        JobManager::new("it"),
    )
    .await
    .unwrap();
    let echo = BiDestination::<String, String>::queue("echo");

    assert!(!mom.is_request_reply_enabled());
    assert_eq!(broker.subscriber_count(DEFAULT_CANCELLATION_TOPIC), 0);

    let error = mom
        .reply(
            &echo,
            |message: Message<String>, _ctx: JobContext| async move { Ok(message.transfer_object().clone()) },
            SubscribeInput::new(),
        )
        .await
        .unwrap_err();
    assert_eq!(error, MomError::RequestReplyDisabled);

    let error = mom.request(&echo, &"hi".to_string(), timeout(50)).await.unwrap_err();
    assert_eq!(error, MomError::RequestReplyDisabled);
    mom.destroy().await;
}

// ============================================================================
// Marshallers and encryption
// ============================================================================

#[tokio::test]
async fn test_registered_encrypter_round_trip() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let secrets = Destination::<String>::queue("secrets");
    let registration = mom.register_encrypter(&secrets, Arc::new(AesGcmEncrypter::generate()));
    let seen = collector();

    let sink = seen.clone();
    mom.subscribe(
        &secrets,
        move |message: Message<String>, _ctx: JobContext| {
            let sink = sink.clone();
            async move {
                let context = message
                    .adapter_message()
                    .and_then(|adapter| adapter.property(PROP_MARSHALLER_CONTEXT).cloned());
                sink.lock().unwrap().push((message.transfer_object().clone(), context));
                Ok(())
            }
        },
        SubscribeInput::new(),
    )
    .await
    .unwrap();

    mom.publish(&secrets, &"launch code".to_string(), PublishInput::new())
        .await
        .unwrap();

    eventually("secret", || seen.lock().unwrap().len() == 1).await;
    let (body, context) = seen.lock().unwrap()[0].clone();
    assert_eq!(body, "launch code");
    assert!(context.unwrap().as_str().unwrap().contains("encrypted"));

    registration.dispose();
    assert!(registration.is_disposed());
    mom.destroy().await;
}

#[tokio::test]
async fn test_registered_marshaller_overrides_default() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let plain = Destination::<String>::queue("plain");
    let _registration = mom.register_marshaller(&plain, Arc::new(TextMarshaller));
    let seen = collector();

    let sink = seen.clone();
    mom.subscribe(
        &plain,
        move |message: Message<String>, _ctx: JobContext| {
            let sink = sink.clone();
            async move {
                let text = message
                    .adapter_message()
                    .and_then(|adapter| adapter.body.as_text().map(str::to_string));
                sink.lock().unwrap().push(text);
                Ok(())
            }
        },
        SubscribeInput::new(),
    )
    .await
    .unwrap();

    mom.publish(&plain, &"as text".to_string(), PublishInput::new())
        .await
        .unwrap();

    eventually("text message", || seen.lock().unwrap().len() == 1).await;
    assert_eq!(seen.lock().unwrap()[0].as_deref(), Some("as text"));
    mom.destroy().await;
}

#[tokio::test]
async fn test_unknown_marshaller_fails_init() {
    let broker = MemoryBroker::new();
    let error = Mom::init(
        test_environment(&broker).with(environment::MARSHALLER, "yaml"),
        JobManager::new("it"),
    )
    .await
    .unwrap_err();
    assert!(matches!(error, MomError::Config(_)));
}

// ============================================================================
// Failover and lifecycle
// ============================================================================

#[tokio::test]
async fn test_subscription_survives_broker_outage() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let work = Destination::<u32>::queue("resilient");
    let seen = collector();

    let sink = seen.clone();
    let subscription = mom
        .subscribe(
            &work,
            move |message: Message<u32>, _ctx: JobContext| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(*message.transfer_object());
                    Ok(())
                }
            },
            SubscribeInput::new(),
        )
        .await
        .unwrap();

    mom.publish(&work, &1, PublishInput::new()).await.unwrap();
    eventually("first message", || seen.lock().unwrap().len() == 1).await;

    broker.set_available(false);
    assert!(!mom.is_connected());
    let error = mom.publish(&work, &2, PublishInput::new()).await.unwrap_err();
    assert!(error.is_connection_error());
    tokio::time::sleep(Duration::from_millis(50)).await;
    broker.set_available(true);

    mom.publish(&work, &3, PublishInput::new()).await.unwrap();
    eventually("message after outage", || seen.lock().unwrap().len() == 2).await;
    assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
    eventually("reconnect counted", || subscription.stats().reconnects() >= 1).await;
    assert!(mom.is_connected());
    mom.destroy().await;
}

#[tokio::test]
async fn test_destroy_releases_everything() {
    let broker = MemoryBroker::new();
    let mom = start(&broker).await;
    let news = Destination::<String>::topic("news");

    mom.subscribe(
        &news,
        |_message: Message<String>, _ctx: JobContext| async { Ok(()) },
        SubscribeInput::new(),
    )
    .await
    .unwrap();
    assert_eq!(broker.subscriber_count("news"), 1);

    mom.destroy().await;
    assert!(mom.is_destroyed());
    assert!(!mom.is_connected());
    assert!(mom.get_subscriptions().is_empty());
    assert_eq!(broker.subscriber_count("news"), 0);
    assert_eq!(broker.subscriber_count(DEFAULT_CANCELLATION_TOPIC), 0);

    let error = mom
        .publish(&news, &"after".to_string(), PublishInput::new())
        .await
        .unwrap_err();
    assert!(matches!(error, MomError::Config(_)));

    // idempotent
    mom.destroy().await;
}
