mod common;

use common::{MockNet, engine, engine_with, wait_for_sockets};
use layer_crypto::AuthKey;
use layer_engine::{AuthState, InvocationError, LoginOutcome, PermAuthKey, Settings};
use layer_tl_types::{Object, Value};

#[tokio::test]
async fn connect_binds_fresh_keys() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let dc = engine.datacenter(2).unwrap();

    assert_eq!(dc.auth_state(), AuthState::Bound);
    let perm = dc.perm_key().unwrap();
    let temp = dc.temp_key().unwrap();
    assert_ne!(perm.id(), temp.id());
    assert_eq!(temp.bound_to(), Some(perm.id()));
    assert_eq!(net.keys_made(), 2);
    assert_eq!(net.calls_to("auth.bindTempAuthKey").len(), 1);
    assert_eq!(net.calls_to("help.getConfig").len(), 1);

    engine.set_logged_in(true);
    assert_eq!(dc.auth_state(), AuthState::Authorized);
    assert!(dc.is_authorized());
}

#[tokio::test]
async fn init_twice_does_no_new_handshake() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    engine.datacenter(2).unwrap().init_authorization().await.unwrap();
    assert_eq!(net.keys_made(), 2);
    assert_eq!(net.calls_to("auth.bindTempAuthKey").len(), 1);
}

#[tokio::test]
async fn binding_is_retried() {
    let net = MockNet::new();
    net.fail_binds(2);
    let engine = engine_with(&net, Settings { max_auth_tries: 3, ..Settings::default() });
    engine.connect(2).await.unwrap();
    assert_eq!(net.calls_to("auth.bindTempAuthKey").len(), 3);
    assert!(engine.datacenter(2).unwrap().is_bound());
}

#[tokio::test]
async fn binding_gives_up_after_max_tries() {
    let net = MockNet::new();
    net.fail_binds(3);
    let engine = engine_with(&net, Settings { max_auth_tries: 3, ..Settings::default() });

    let err = engine.connect(2).await.unwrap_err();
    assert!(matches!(err, InvocationError::Security(_)), "{err:?}");
    let dc = engine.datacenter(2).unwrap();
    assert!(!dc.is_bound());
    assert_eq!(dc.auth_state(), AuthState::TempKeyGenerated);
    assert!(net.calls_to("help.getConfig").is_empty());
}

#[tokio::test]
async fn binding_is_not_replayed_after_socket_loss() {
    let net = MockNet::new();
    net.stall_binds(1);
    let engine = engine_with(&net, Settings { max_auth_tries: 1, ..Settings::default() });

    let connecting = tokio::spawn({
        let engine = engine.clone();
        async move { engine.connect(2).await }
    });
    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while net.calls_to("auth.bindTempAuthKey").is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    net.kill(2, 0);

    let err = connecting.await.unwrap().unwrap_err();
    assert!(matches!(err, InvocationError::Security(_)), "{err:?}");

    wait_for_sockets(&net, 2).await;
    let dc = engine.datacenter(2).unwrap();
    assert_eq!(net.calls_to("auth.bindTempAuthKey").len(), 1);
    assert!(!dc.is_bound());
    assert_eq!(dc.backup_len(), 0);
}

#[tokio::test]
async fn without_pfs_the_permanent_key_is_used() {
    let net = MockNet::new();
    let engine = engine_with(&net, Settings { pfs: false, ..Settings::default() });
    engine.connect(2).await.unwrap();
    let dc = engine.datacenter(2).unwrap();
    assert_eq!(dc.temp_key().unwrap().id(), dc.perm_key().unwrap().id());
    assert!(dc.is_bound());
    assert_eq!(net.keys_made(), 1);
    assert!(net.calls_to("auth.bindTempAuthKey").is_empty());
}

#[tokio::test]
async fn media_dc_shares_the_main_key() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let main = engine.datacenter(2).unwrap();
    let media = engine.add_datacenter(-2, false);
    engine.connect(-2).await.unwrap();

    assert_eq!(media.linked_dc(), Some(2));
    assert_eq!(media.perm_key().map(|k| k.id()), main.perm_key().map(|k| k.id()));
    assert_ne!(media.temp_key().map(|k| k.id()), main.temp_key().map(|k| k.id()));
    assert!(media.is_bound());

    let replacement = PermAuthKey::new(AuthKey::from_bytes([9; 256]), 0);
    let replacement_id = replacement.id();
    main.set_perm_key(Some(replacement.clone())).unwrap();
    assert_eq!(media.perm_key().map(|k| k.id()), Some(replacement_id));

    let err = media.set_perm_key(Some(replacement)).unwrap_err();
    assert!(matches!(err, InvocationError::Usage(_)));

    engine.set_logged_in(true);
    assert!(media.perm_key().unwrap().is_authorized());
}

#[tokio::test]
async fn media_dc_needs_its_main_dc() {
    let net = MockNet::new();
    let engine = engine_with(&net, Settings::default());
    engine.add_datacenter(-2, false);
    let err = engine.connect(-2).await.unwrap_err();
    assert!(matches!(err, InvocationError::Usage(_)), "{err:?}");
}

#[tokio::test]
async fn cdn_dc_is_never_bound() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let cdn = engine.add_datacenter(203, true);
    engine.connect(203).await.unwrap();

    assert_eq!(cdn.auth_state(), AuthState::Bound);
    assert!(!cdn.has_perm_key());
    assert!(cdn.temp_key().is_some());
    assert!(net.calls_to("auth.bindTempAuthKey").iter().all(|c| c.dc_id != 203));
    assert!(net.calls_to("help.getConfig").iter().all(|c| c.dc_id != 203));
}

#[tokio::test]
async fn login_is_copied_to_new_dcs() {
    let net = MockNet::new();
    net.on(|call| match call.method.as_str() {
        "auth.exportAuthorization" => Some(Ok(Object::new("auth.exportedAuthorization")
            .with("id", 77i64)
            .with("bytes", vec![1u8, 2, 3])
            .into())),
        "auth.importAuthorization" => Some(Ok(Object::new("auth.authorization").into())),
        _ => Some(Ok(Value::Bool(true))),
    });
    let engine = engine(&net).await;
    engine.set_logged_in(true);

    let dc4 = engine.add_datacenter(4, false);
    engine.connect(4).await.unwrap();

    let export = net.calls_to("auth.exportAuthorization");
    assert_eq!(export.len(), 1);
    assert_eq!(export[0].dc_id, 2);
    assert_eq!(export[0].args.get("dc_id"), Some(&Value::Int(4)));

    let import = net.calls_to("auth.importAuthorization");
    assert_eq!(import.len(), 1);
    assert_eq!(import[0].dc_id, 4);
    assert_eq!(import[0].args.get("id"), Some(&Value::Long(77)));
    assert_eq!(import[0].args.get("bytes"), Some(&Value::Bytes(vec![1, 2, 3])));

    assert_eq!(dc4.auth_state(), AuthState::Authorized);
}

#[tokio::test]
async fn failed_export_leaves_dc_unauthorized() {
    let net = MockNet::new();
    net.on(|call| match call.method.as_str() {
        "auth.exportAuthorization" => common::rpc(400, "DC_ID_INVALID"),
        _ => Some(Ok(Value::Bool(true))),
    });
    let engine = engine(&net).await;
    engine.set_logged_in(true);
    let dc4 = engine.add_datacenter(4, false);
    engine.connect(4).await.unwrap();

    assert_eq!(dc4.auth_state(), AuthState::Bound);
    assert!(net.calls_to("auth.importAuthorization").is_empty());
}

#[tokio::test]
async fn login_wait_resolves_on_login() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let wait = engine.login_wait();
    let waiter = tokio::spawn(async move { wait.wait(None, None).await });
    tokio::task::yield_now().await;
    engine.set_logged_in(true);
    assert_eq!(waiter.await.unwrap().unwrap(), LoginOutcome::LoggedIn);

    // Already logged in: resolves immediately.
    assert_eq!(engine.login_wait().wait(None, None).await.unwrap(), LoginOutcome::LoggedIn);
}

#[tokio::test(start_paused = true)]
async fn login_wait_rearms_after_logout() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    engine.set_logged_in(true);
    engine.set_logged_in(false);
    assert!(!engine.datacenter(2).unwrap().is_authorized());

    let expires = chrono::Utc::now() + chrono::Duration::seconds(60);
    let outcome = engine.login_wait().wait(Some(expires), None).await.unwrap();
    assert_eq!(outcome, LoginOutcome::Expired);
}
