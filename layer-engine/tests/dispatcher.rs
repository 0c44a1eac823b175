mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use common::{MockNet, engine, engine_with, rpc};
use layer_engine::{CallOptions, InvocationError, Settings};
use layer_tl_types::{Object, Value};

fn text(message: &str) -> Value {
    Object::new("messages.sendMessage").with("message", message).into()
}

fn updates() -> common::Reply {
    Some(Ok(Object::new("updates").into()))
}

#[tokio::test]
async fn unknown_method_is_rejected() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let err = engine.call_and_await("nope.nothing", Value::Null, CallOptions::default()).await.unwrap_err();
    assert!(matches!(err, InvocationError::UnknownMethod(ref m) if m == "nope.nothing"));
}

#[tokio::test]
async fn benign_errors_become_null() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    net.on(|_| rpc(403, "CHAT_WRITE_FORBIDDEN"));
    let res = engine.call_and_await("messages.sendMessage", text("hi"), CallOptions::default()).await.unwrap();
    assert_eq!(res, Value::Null);

    net.on(|_| rpc(400, "MESSAGE_EMPTY"));
    let err = engine.call_and_await("messages.sendMessage", text(""), CallOptions::default()).await.unwrap_err();
    assert!(err.is("MESSAGE_EMPTY"));
}

fn flood_once(net: &MockNet) -> Arc<AtomicU32> {
    let seen = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&seen);
    net.on(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            rpc(420, "FLOOD_WAIT_3")
        } else {
            updates()
        }
    });
    seen
}

#[tokio::test(start_paused = true)]
async fn flood_wait_under_the_limit_is_slept_off() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let seen = flood_once(&net);

    let started = tokio::time::Instant::now();
    let opts = CallOptions::default().flood_wait_limit(5);
    let res = engine.call_and_await("messages.sendMessage", text("hi"), opts).await.unwrap();
    assert_eq!(res.predicate(), Some("updates"));
    assert_eq!(seen.load(Ordering::SeqCst), 2);
    assert!(started.elapsed() >= std::time::Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn flood_wait_over_the_limit_is_returned() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let seen = flood_once(&net);

    let opts = CallOptions::default().flood_wait_limit(0);
    let err = engine.call_and_await("messages.sendMessage", text("hi"), opts).await.unwrap_err();
    assert_eq!(err.flood_wait_seconds(), Some(3));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn long_text_is_split_in_order() {
    let net = MockNet::new();
    let engine = engine_with(&net, Settings { message_length_max: 10, ..Settings::default() });
    engine.connect(2).await.unwrap();
    net.on(|_| updates());

    let original = "aaaa bbbb cccc dddd eeee";
    let res = engine.call_and_await("messages.sendMessage", text(original), CallOptions::default()).await.unwrap();
    assert_eq!(res.as_vec().map(<[Value]>::len), Some(3));

    let sent = net.calls_to("messages.sendMessage");
    let parts: Vec<&str> = sent.iter().filter_map(|c| c.args.get("message").and_then(Value::as_str)).collect();
    assert_eq!(parts, vec!["aaaa bbbb ", "cccc dddd ", "eeee"]);
    assert_eq!(parts.concat(), original);
    assert_eq!(sent[0].invoke_after, None);
    assert_eq!(sent[1].invoke_after, Some(sent[0].msg_id));
    assert_eq!(sent[2].invoke_after, Some(sent[1].msg_id));
}

#[tokio::test(start_paused = true)]
async fn flood_wait_in_a_split_resends_only_that_part() {
    let net = MockNet::new();
    let engine = engine_with(&net, Settings { message_length_max: 10, ..Settings::default() });
    engine.connect(2).await.unwrap();
    let seen = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&seen);
    net.on(move |_| {
        if counter.fetch_add(1, Ordering::SeqCst) == 2 {
            rpc(420, "FLOOD_WAIT_1")
        } else {
            updates()
        }
    });

    let res = engine
        .call_and_await("messages.sendMessage", text("aaaa bbbb cccc dddd eeee"), CallOptions::default())
        .await
        .unwrap();
    assert_eq!(res.as_vec().map(<[Value]>::len), Some(3));

    let sent = net.calls_to("messages.sendMessage");
    let parts: Vec<&str> = sent.iter().filter_map(|c| c.args.get("message").and_then(Value::as_str)).collect();
    assert_eq!(parts, vec!["aaaa bbbb ", "cccc dddd ", "eeee", "eeee"]);
    assert_eq!(sent[3].invoke_after, Some(sent[2].msg_id));
}

#[tokio::test]
async fn benign_error_in_a_batch_only_nulls_its_member() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    net.on(|call| match call.args.get("message").and_then(Value::as_str) {
        Some("bb") => rpc(403, "CHAT_WRITE_FORBIDDEN"),
        _ => updates(),
    });

    let args = Object::new("messages.sendMessage").with("multiple", vec![text("a"), text("bb"), text("ccc")]);
    let res = engine.call_and_await("messages.sendMessage", args.clone().into(), CallOptions::default()).await.unwrap();
    let members = res.as_vec().unwrap();
    assert_eq!(members.len(), 3);
    assert_eq!(members[0].predicate(), Some("updates"));
    assert_eq!(members[1], Value::Null);
    assert_eq!(members[2].predicate(), Some("updates"));

    let pending = engine.call("messages.sendMessage", args.into(), CallOptions::default()).await.unwrap();
    let members = pending.wait().await.unwrap();
    assert_eq!(members.as_vec().map(|m| m[1].clone()), Some(Value::Null));
    assert_eq!(net.calls_to("messages.sendMessage").len(), 6);
}

#[tokio::test]
async fn multiple_fans_out() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    net.on(|call| {
        let n = call.args.get("message").and_then(Value::as_str).map(str::len).unwrap_or(0);
        Some(Ok(Value::Int(n as i32)))
    });

    let args = Object::new("messages.sendMessage").with("multiple", vec![text("a"), text("bb"), text("ccc")]);
    let res = engine.call_and_await("messages.sendMessage", args.into(), CallOptions::default()).await.unwrap();
    assert_eq!(res, Value::Vector(vec![Value::Int(1), Value::Int(2), Value::Int(3)]));
    assert_eq!(net.calls_to("messages.sendMessage").len(), 3);
}

#[tokio::test]
async fn secret_chat_calls_are_chained() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    net.on(|_| Some(Ok(Object::new("messages.sentEncryptedMessage").into())));

    for _ in 0..3 {
        let args = Object::new("messages.sendEncrypted").with("data", vec![0u8; 16]);
        engine.call_and_await("messages.sendEncrypted", args.into(), CallOptions::default()).await.unwrap();
    }
    let sent = net.calls_to("messages.sendEncrypted");
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0].invoke_after, None);
    assert_eq!(sent[1].invoke_after, Some(sent[0].msg_id));
    assert_eq!(sent[2].invoke_after, Some(sent[1].msg_id));
}

#[tokio::test]
async fn no_response_returns_immediately() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    net.on(|_| None);
    let opts = CallOptions::default().no_response(true);
    assert_eq!(engine.call_and_await("messages.sendMessage", text("x"), opts).await.unwrap(), Value::Null);
    assert_eq!(net.calls_to("messages.sendMessage").len(), 1);
}

#[tokio::test]
async fn postponed_calls_wait_for_a_flush() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    net.on(|_| updates());
    let pending = engine
        .call("messages.sendMessage", text("later"), CallOptions::default().postpone(true))
        .await
        .unwrap();
    assert!(net.calls_to("messages.sendMessage").is_empty());

    engine.datacenter(2).unwrap().flush_all().await;
    assert_eq!(pending.wait().await.unwrap().predicate(), Some("updates"));
}

#[tokio::test]
async fn recall_resends_under_the_same_id() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    net.on(|_| None);
    let pending = engine.call("messages.sendMessage", text("again"), CallOptions::default()).await.unwrap();
    let first = net.calls_to("messages.sendMessage")[0].msg_id;

    net.on(|_| updates());
    assert_eq!(engine.recall(2, first, None, false).await.unwrap(), 1);
    assert_eq!(pending.wait().await.unwrap().predicate(), Some("updates"));

    let sent = net.calls_to("messages.sendMessage");
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1].msg_id, first);
    assert_eq!(engine.recall(2, first, None, false).await.unwrap(), 0);
}

#[tokio::test]
async fn recall_moves_to_another_dc() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    engine.add_datacenter(4, false);
    engine.connect(4).await.unwrap();
    net.on(|_| None);
    let pending = engine.call("messages.sendMessage", text("move"), CallOptions::default()).await.unwrap();
    let first = net.calls_to("messages.sendMessage")[0].clone();
    assert_eq!(first.dc_id, 2);

    net.on(|_| updates());
    assert_eq!(engine.recall(2, first.msg_id, Some(4), false).await.unwrap(), 1);
    assert_eq!(pending.wait().await.unwrap().predicate(), Some("updates"));

    let moved = &net.calls_to("messages.sendMessage")[1];
    assert_eq!(moved.dc_id, 4);
    assert_ne!(moved.msg_id, first.msg_id);
}

#[tokio::test]
async fn recall_to_unknown_dc_fails() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let err = engine.recall(2, 1, Some(9), false).await.unwrap_err();
    assert!(matches!(err, InvocationError::Usage(_)));
}

#[tokio::test]
async fn inline_messages_go_to_their_dc() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    engine.add_datacenter(4, false);
    engine.connect(4).await.unwrap();

    let id = Object::new("inputBotInlineMessageID").with("dc_id", 4).with("id", 1i64).with("access_hash", 2i64);
    let args = Object::new("messages.editInlineBotMessage").with("id", id);
    engine.call_and_await("messages.editInlineBotMessage", args.into(), CallOptions::default()).await.unwrap();
    assert_eq!(net.calls_to("messages.editInlineBotMessage")[0].dc_id, 4);
}

#[tokio::test]
async fn file_calls_prefer_the_media_dc() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    net.on(|_| Some(Ok(Object::new("upload.file").with("bytes", vec![1u8]).into())));
    let args = || Value::from(Object::new("upload.getFile").with("offset", 0i64).with("limit", 4096));

    engine.call_and_await("upload.getFile", args(), CallOptions::default().file(true)).await.unwrap();
    assert_eq!(net.calls_to("upload.getFile")[0].dc_id, 2);

    engine.add_datacenter(-2, false);
    engine.connect(-2).await.unwrap();
    engine.call_and_await("upload.getFile", args(), CallOptions::default().file(true)).await.unwrap();
    engine.call_and_await("upload.getFile", args(), CallOptions::default()).await.unwrap();
    let dcs: Vec<i32> = net.calls_to("upload.getFile").iter().map(|c| c.dc_id).collect();
    assert_eq!(dcs, vec![2, -2, 2]);
}

#[tokio::test]
async fn calls_need_a_datacenter() {
    let net = MockNet::new();
    let engine = engine_with(&net, Settings::default());
    engine.set_authorized_dc(None);
    let err = engine.call("messages.sendMessage", text("x"), CallOptions::default()).await.unwrap_err();
    assert!(matches!(err, InvocationError::Usage(_)));
    let err = engine.call("messages.sendMessage", text("x"), CallOptions::on(7)).await.unwrap_err();
    assert!(matches!(err, InvocationError::Usage(_)));
}
