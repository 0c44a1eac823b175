mod common;

use common::{MockNet, engine, engine_with, wait_for_sockets};
use layer_engine::pool::{HIGH_BONUS, LOW_BONUS, Level};
use layer_engine::{CallOptions, InvocationError, Settings};
use layer_tl_types::{Object, Value};

fn send_message(text: &str) -> Value {
    Object::new("messages.sendMessage").with("message", text).into()
}

#[tokio::test]
async fn weights_follow_sockets() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let cdn = engine.add_datacenter(203, true);
    engine.connect(203).await.unwrap();

    cdn.connect_more(3).await.unwrap();
    assert_eq!(cdn.socket_ids(), vec![0, 1, 2, 3]);
    assert!(cdn.socket_ids().iter().all(|&id| cdn.weight(id).is_some()));

    cdn.signal_disconnect(1);
    assert_eq!(cdn.socket_ids(), vec![0, 2, 3]);
    assert_eq!(cdn.weight(1), None);

    cdn.connect_more(1).await.unwrap();
    assert_eq!(cdn.socket_ids(), vec![0, 1, 2, 3]);
    assert_eq!(cdn.weight(1), Some(0));
}

#[tokio::test]
async fn leveling_grows_media_pools() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let cdn = engine.add_datacenter(203, true);
    engine.connect(203).await.unwrap();
    cdn.connect_more(3).await.unwrap();

    assert_eq!(cdn.even().await, Level::Boosted(LOW_BONUS));
    assert_eq!(cdn.even().await, Level::Grow(2));
    assert_eq!(cdn.socket_count(), 6);
    assert!(cdn.socket_ids().iter().all(|&id| cdn.weight(id).is_some()));
}

#[tokio::test]
async fn full_pool_is_boosted_instead() {
    let net = MockNet::new();
    let settings = Settings { max_media_socket_count: 2, ..Settings::default() };
    let engine = common::engine_with(&net, settings);
    engine.connect(2).await.unwrap();
    let cdn = engine.add_datacenter(203, true);
    engine.connect(203).await.unwrap();
    cdn.connect_more(1).await.unwrap();

    assert_eq!(cdn.even().await, Level::Boosted(LOW_BONUS));
    assert_eq!(cdn.even().await, Level::Boosted(HIGH_BONUS));
    assert_eq!(cdn.even().await, Level::Idle);
    assert_eq!(cdn.socket_count(), 2);
}

#[tokio::test]
async fn single_socket_is_not_charged() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let dc = engine.datacenter(2).unwrap();
    let before = dc.weight(0);
    for _ in 0..5 {
        assert_eq!(dc.get_connection().map(|c| c.id()), Some(0));
    }
    assert_eq!(dc.weight(0), before);
}

#[tokio::test]
async fn lost_socket_replays_unanswered_calls() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    net.on(|call| match call.method.as_str() {
        "messages.sendMessage" => None,
        _ => Some(Ok(Value::Bool(true))),
    });

    let pending = engine.call("messages.sendMessage", send_message("hang"), CallOptions::default()).await.unwrap();
    assert!(net.calls_to("messages.sendMessage")[0].encrypted);
    assert_eq!(net.calls_to("messages.sendMessage").len(), 1);

    net.on(|_| Some(Ok(Value::from(Object::new("updates")))));
    net.kill(2, 0);

    let reply = tokio::time::timeout(std::time::Duration::from_secs(5), pending.wait()).await.unwrap().unwrap();
    assert_eq!(reply.predicate(), Some("updates"));

    let sent = net.calls_to("messages.sendMessage");
    assert_eq!(sent.len(), 2);
    assert_ne!(sent[0].msg_id, sent[1].msg_id);
    let dc = engine.datacenter(2).unwrap();
    assert_eq!(dc.socket_ids(), vec![0]);
    assert_eq!(dc.backup_len(), 0);
}

#[tokio::test]
async fn lost_socket_drops_plaintext_calls() {
    let net = MockNet::new();
    let engine = engine_with(&net, Settings::default());
    let dc = engine.datacenter(2).unwrap();
    dc.connect(None).await.unwrap();
    net.on(|call| match call.method.as_str() {
        "ping" => None,
        _ => Some(Ok(Value::Bool(true))),
    });

    let pending = engine.call("ping", Object::new("ping").with("ping_id", 1i64).into(), CallOptions::default())
        .await
        .unwrap();
    assert!(!net.calls_to("ping")[0].encrypted);

    net.kill(2, 0);
    let err = tokio::time::timeout(std::time::Duration::from_secs(5), pending.wait()).await.unwrap().unwrap_err();
    assert!(matches!(err, InvocationError::Dropped), "{err:?}");

    wait_for_sockets(&net, 2).await;
    assert_eq!(dc.socket_ids(), vec![0]);
    assert_eq!(net.calls_to("ping").len(), 1);
    assert_eq!(dc.backup_len(), 0);
}

#[tokio::test]
async fn disconnect_keeps_calls_for_the_next_connect() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    net.on(|call| match call.method.as_str() {
        "messages.sendMessage" => None,
        _ => Some(Ok(Value::Bool(true))),
    });

    let pending = engine.call("messages.sendMessage", send_message("later"), CallOptions::default()).await.unwrap();
    let dc = engine.datacenter(2).unwrap();
    dc.disconnect();
    assert_eq!(dc.socket_count(), 0);
    assert_eq!(dc.backup_len(), 1);

    net.on(|_| Some(Ok(Value::from(Object::new("updates")))));
    engine.connect(2).await.unwrap();

    assert_eq!(pending.wait().await.unwrap().predicate(), Some("updates"));
    assert_eq!(dc.backup_len(), 0);
    let sent = net.calls_to("messages.sendMessage");
    assert_eq!(sent.len(), 2);
    assert_ne!(sent[0].msg_id, sent[1].msg_id);
    assert_eq!(net.calls_to("auth.bindTempAuthKey").len(), 1);
}
