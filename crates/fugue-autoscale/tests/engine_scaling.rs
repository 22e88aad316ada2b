//! End-to-end scaling behavior over the in-memory transport.

use std::sync::Arc;
use std::time::Duration;

use fugue_autoscale::{Autoscaler, FunctionId};
use fugue_transport::{metrics_channel, MemoryTransport, MetricsSender};

fn started_engine(capacity: usize) -> (Autoscaler, MetricsSender) {
    let (sender, receiver) = metrics_channel(capacity);
    let transport = MemoryTransport::new();
    let engine = Autoscaler::new(receiver, Arc::new(transport.inspector()));
    engine.run().unwrap();
    (engine, sender)
}

/// Give the background accumulation task time to drain the metric
/// channels. Proposing mid-fold would split the window, so the tests
/// settle once rather than polling.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn lagging_consumption_scales_up_then_idles_to_zero() {
    let (engine, sender) = started_engine(256);
    let f = FunctionId::new("squarer");
    engine.start_monitoring("numbers", &f).await.unwrap();
    engine.inform_function_replicas(&f, 1).await.unwrap();

    // One replica keeps up with a quarter of the produced volume.
    for _ in 0..100 {
        sender.record_transmit("numbers", 1);
    }
    for _ in 0..25 {
        sender.record_receive("numbers", "squarer", 1);
    }
    settle().await;

    // ceil(1 * 100 / 25) = 4
    let proposals = engine.propose().await.unwrap();
    assert_eq!(proposals.get(&f), Some(&4));

    // The window was reset; with no further traffic and an empty queue
    // the function scales to zero.
    assert_eq!(engine.propose().await.unwrap().get(&f), Some(&0));

    engine.close().await.unwrap();
}

#[tokio::test]
async fn max_replicas_policy_caps_the_proposal() {
    let (engine, sender) = started_engine(256);
    let f = FunctionId::new("squarer");
    engine.start_monitoring("numbers", &f).await.unwrap();
    engine.inform_function_replicas(&f, 1).await.unwrap();
    engine.set_max_replicas_policy(|_| 2).await.unwrap();

    for _ in 0..100 {
        sender.record_transmit("numbers", 1);
    }
    for _ in 0..10 {
        sender.record_receive("numbers", "squarer", 1);
    }
    settle().await;

    let proposals = engine.propose().await.unwrap();
    assert_eq!(proposals.get(&f), Some(&2));

    engine.close().await.unwrap();
}

#[tokio::test]
async fn cooldown_policy_holds_scale_down() {
    let (engine, sender) = started_engine(256);
    let f = FunctionId::new("squarer");
    engine.start_monitoring("numbers", &f).await.unwrap();
    engine.inform_function_replicas(&f, 1).await.unwrap();
    engine
        .set_delay_scale_down_policy(|_| Duration::from_secs(600))
        .await
        .unwrap();

    sender.record_transmit("numbers", 8);
    sender.record_receive("numbers", "squarer", 2);
    settle().await;

    // ceil(1 * 8 / 2) = 4
    let proposals = engine.propose().await.unwrap();
    assert_eq!(proposals.get(&f), Some(&4));

    // Traffic stopped, but the cooldown window has not elapsed.
    assert_eq!(engine.propose().await.unwrap().get(&f), Some(&4));

    engine.close().await.unwrap();
}

#[tokio::test]
async fn metrics_for_unmonitored_topics_are_dropped() {
    let (engine, sender) = started_engine(256);
    let f = FunctionId::new("squarer");
    engine.start_monitoring("numbers", &f).await.unwrap();
    engine.inform_function_replicas(&f, 1).await.unwrap();

    sender.record_transmit("letters", 50);
    sender.record_receive("letters", "squarer", 5);
    sender.record_transmit("numbers", 4);
    sender.record_receive("numbers", "squarer", 4);
    settle().await;

    // Only the monitored topic's traffic counts: ceil(1 * 4 / 4) = 1.
    let proposals = engine.propose().await.unwrap();
    assert_eq!(proposals.get(&f), Some(&1));

    engine.close().await.unwrap();
}

#[tokio::test]
async fn backlogged_queue_keeps_one_replica() {
    let (sender, receiver) = metrics_channel(64);
    let transport = MemoryTransport::new();
    let engine = Autoscaler::new(receiver, Arc::new(transport.inspector()));
    engine.run().unwrap();

    let f = FunctionId::new("squarer");
    engine.start_monitoring("numbers", &f).await.unwrap();
    engine.inform_function_replicas(&f, 1).await.unwrap();

    // Traffic dries up but two messages sit unconsumed on the topic.
    use fugue_transport::{Message, Producer};
    let producer = transport.producer();
    producer.send("numbers", Message::new(b"1".to_vec())).await.unwrap();
    producer.send("numbers", Message::new(b"2".to_vec())).await.unwrap();

    drop(sender);
    settle().await;

    assert_eq!(engine.propose().await.unwrap().get(&f), Some(&1));

    engine.close().await.unwrap();
}
