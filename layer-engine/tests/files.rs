mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use common::{Call, MockNet, engine, payload, rpc, slice};
use layer_crypto::aes::{Ige, ctr_apply};
use layer_crypto::cdn_chunk_iv;
use layer_engine::files::{UPLOAD_PART_SIZE, progress_channel};
use layer_engine::{DownloadInfo, DownloadOptions, FileKey, InvocationError, UploadOptions};
use layer_tl_types::{Object, Value};
use parking_lot::Mutex;

const CDN_DC: i32 = 203;
const TOKEN: &[u8] = b"cdn-token";
const CDN_KEY: [u8; 32] = [5; 32];
const CDN_IV: [u8; 16] = [6; 16];
const HASH_SPAN: usize = 128 * 1024;

fn location() -> Object {
    Object::new("inputDocumentFileLocation")
        .with("id", 1i64)
        .with("access_hash", 2i64)
        .with("file_reference", vec![0u8])
        .with("thumb_size", "")
}

fn file_part(bytes: Vec<u8>) -> common::Reply {
    Some(Ok(Object::new("upload.file").with("bytes", bytes).into()))
}

/// Remembers uploaded parts by index.
fn record_parts(net: &MockNet) -> Arc<Mutex<BTreeMap<i32, Vec<u8>>>> {
    let parts = Arc::new(Mutex::new(BTreeMap::new()));
    let sink = Arc::clone(&parts);
    net.on(move |call| {
        if call.method.starts_with("upload.save") {
            let part = call.args.get("file_part").and_then(Value::as_i32).unwrap_or(-1);
            let bytes = call.args.get("bytes").and_then(Value::as_bytes).unwrap_or_default().to_vec();
            sink.lock().insert(part, bytes);
        }
        Some(Ok(Value::Bool(true)))
    });
    parts
}

// ─── Upload ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn small_upload_uses_save_file_part() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let parts = record_parts(&net);
    let data = payload(1_500_000);

    let (tx, rx) = progress_channel();
    let opts = UploadOptions::new("clip.bin", "application/octet-stream").progress(tx);
    let file = engine.upload_bytes(data.clone(), opts).await.unwrap();

    assert_eq!(file.parts, 3);
    assert!(!file.big);
    assert_eq!(file.size, 1_500_000);
    let input = file.to_value();
    assert_eq!(input.predicate(), Some("inputFile"));
    assert_eq!(input.get("parts"), Some(&Value::Int(3)));
    assert_eq!(input.get("name"), Some(&Value::from("clip.bin")));

    let calls = net.calls_to("upload.saveFilePart");
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|c| c.args.get("file_id") == Some(&Value::Long(file.id))));
    assert!(calls.iter().all(|c| c.args.get("file_total_parts").is_none()));

    let parts = parts.lock();
    assert_eq!(parts[&2].len(), 451_424);
    assert_eq!(parts.values().flatten().copied().collect::<Vec<u8>>(), data);
    assert_eq!(rx.borrow().percent, 100.0);
}

#[tokio::test]
async fn big_upload_uses_save_big_file_part() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    record_parts(&net);

    let file = engine.upload_bytes(vec![7u8; 11 * 1024 * 1024], UploadOptions::default()).await.unwrap();
    assert!(file.big);
    assert_eq!(file.parts, 22);
    assert_eq!(file.to_value().predicate(), Some("inputFileBig"));

    let calls = net.calls_to("upload.saveBigFilePart");
    assert_eq!(calls.len(), 22);
    assert!(calls.iter().all(|c| c.args.get("file_total_parts") == Some(&Value::Int(22))));
    assert!(net.calls_to("upload.saveFilePart").is_empty());
}

#[tokio::test]
async fn encrypted_upload_is_sequential_and_decryptable() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let parts = record_parts(&net);
    let data = payload(1_000_000);

    let file = engine.upload_bytes(data.clone(), UploadOptions::default().encrypted(true)).await.unwrap();
    let key = file.key.expect("encrypted upload carries a key");
    key.check().unwrap();
    assert_eq!(file.to_value().predicate(), Some("inputEncryptedFileUploaded"));
    assert_eq!(file.to_value().get("key_fingerprint"), Some(&Value::Int(key.fingerprint)));

    let order: Vec<i32> = net.calls_to("upload.saveFilePart").iter()
        .filter_map(|c| c.args.get("file_part").and_then(Value::as_i32))
        .collect();
    assert_eq!(order, vec![0, 1]);

    let mut cipher = Ige::new(&key.key, &key.iv);
    let mut plain = Vec::new();
    for bytes in parts.lock().values() {
        assert_eq!(bytes.len(), UPLOAD_PART_SIZE);
        let mut bytes = bytes.clone();
        cipher.decrypt(&mut bytes);
        plain.extend(bytes);
    }
    plain.truncate(data.len());
    assert_eq!(plain, data);
}

#[tokio::test]
async fn rejected_part_fails_the_upload() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    net.on(|_| Some(Ok(Value::Bool(false))));
    let err = engine.upload_bytes(payload(1000), UploadOptions::default()).await.unwrap_err();
    assert!(matches!(err, InvocationError::Usage(_)), "{err:?}");
}

#[tokio::test]
async fn empty_upload_is_refused() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let err = engine.upload_bytes(Vec::new(), UploadOptions::default()).await.unwrap_err();
    assert!(matches!(err, InvocationError::Usage(_)));
    assert!(net.calls_to("upload.saveFilePart").is_empty());
}

// ─── Download ─────────────────────────────────────────────────────────────────

fn serve(net: &MockNet, data: Vec<u8>) {
    net.on(move |call| match call.method.as_str() {
        "upload.getFile" => file_part(slice(&data, call)),
        _ => Some(Ok(Value::Bool(true))),
    });
}

#[tokio::test]
async fn plain_download_reassembles_the_file() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let data = payload(3_000_000);
    serve(&net, data.clone());

    let info = DownloadInfo::new(location()).dc(2).size(data.len() as u64);
    let out = engine.download_to_vec(&info, DownloadOptions::default()).await.unwrap();
    assert_eq!(out, data);
    assert_eq!(net.calls_to("upload.getFile").len(), 3);
}

#[tokio::test]
async fn ranged_download() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let data = payload(3_000_000);
    serve(&net, data.clone());

    let info = DownloadInfo::new(location()).dc(2).size(data.len() as u64);
    let opts = DownloadOptions::default().range(1000, 2_100_000).part_size(512 * 1024);
    let out = engine.download_to_vec(&info, opts).await.unwrap();
    assert_eq!(out, data[1000..2_100_000]);
}

#[tokio::test]
async fn unknown_size_stops_at_the_first_short_chunk() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let data = payload(2_500_000);
    serve(&net, data.clone());

    let info = DownloadInfo::new(location()).dc(2);
    let out = engine.download_to_vec(&info, DownloadOptions::default().seekable(false)).await.unwrap();
    assert_eq!(out, data);
    assert_eq!(net.calls_to("upload.getFile").len(), 3);
}

#[tokio::test]
async fn secret_chat_download_is_decrypted() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let plain = payload(600_000);
    let key = FileKey::new([3; 32], [4; 32]);
    let mut encrypted = plain.clone();
    Ige::new(&key.key, &key.iv).encrypt(&mut encrypted);
    serve(&net, encrypted);

    let info = DownloadInfo::new(location()).dc(2).size(plain.len() as u64).key(key);
    let opts = DownloadOptions::default().part_size(256 * 1024);
    assert_eq!(engine.download_to_vec(&info, opts).await.unwrap(), plain);

    let err = engine.download_to_vec(&info, DownloadOptions::default().range(16, 32)).await.unwrap_err();
    assert!(matches!(err, InvocationError::Usage(_)));
}

#[tokio::test]
async fn tampered_file_key_is_refused() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let mut key = FileKey::new([3; 32], [4; 32]);
    key.fingerprint ^= 1;
    let info = DownloadInfo::new(location()).dc(2).size(16).key(key);
    let err = engine.download_to_vec(&info, DownloadOptions::default()).await.unwrap_err();
    assert!(matches!(err, InvocationError::Security(_)));
    assert!(net.calls_to("upload.getFile").is_empty());
}

// ─── CDN ──────────────────────────────────────────────────────────────────────

fn file_hashes(data: &[u8], from: usize, to: usize) -> Value {
    let mut out = Vec::new();
    let mut offset = from;
    while offset < to.min(data.len()) {
        let end = (offset + HASH_SPAN).min(data.len());
        out.push(Value::from(Object::new("fileHash")
            .with("offset", offset as i64)
            .with("limit", (end - offset) as i32)
            .with("hash", layer_crypto::sha256!(&data[offset..end]).to_vec())));
        offset = end;
    }
    Value::Vector(out)
}

fn cdn_chunk(data: &[u8], call: &Call) -> Vec<u8> {
    let offset = call.args.get("offset").and_then(Value::as_i64).unwrap_or(0) as u64;
    let mut bytes = slice(data, call);
    ctr_apply(&mut bytes, &CDN_KEY, &cdn_chunk_iv(&CDN_IV, offset));
    bytes
}

fn redirect(hashes: Value) -> common::Reply {
    Some(Ok(Object::new("upload.fileCdnRedirect")
        .with("dc_id", CDN_DC)
        .with("file_token", TOKEN.to_vec())
        .with("encryption_key", CDN_KEY.to_vec())
        .with("encryption_iv", CDN_IV.to_vec())
        .with("file_hashes", hashes)
        .into()))
}

#[tokio::test]
async fn cdn_download_is_verified() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let data = payload(400_000);
    let served = data.clone();
    net.on(move |call| match call.method.as_str() {
        "upload.getFile" => redirect(file_hashes(&served, 0, 2 * HASH_SPAN)),
        "upload.getCdnFile" => Some(Ok(Object::new("upload.cdnFile").with("bytes", cdn_chunk(&served, call)).into())),
        "upload.getCdnFileHashes" => {
            let from = call.args.get("offset").and_then(Value::as_i64).unwrap_or(0) as usize;
            Some(Ok(file_hashes(&served, from, served.len())))
        }
        _ => Some(Ok(Value::Bool(true))),
    });

    let info = DownloadInfo::new(location()).dc(2).size(data.len() as u64);
    let opts = DownloadOptions::default().part_size(256 * 1024);
    assert_eq!(engine.download_to_vec(&info, opts).await.unwrap(), data);

    assert!(engine.has_datacenter(CDN_DC));
    assert!(engine.datacenter(CDN_DC).unwrap().is_cdn());
    assert!(net.calls_to("upload.getCdnFile").iter().all(|c| c.dc_id == CDN_DC));
    let refetched = net.calls_to("upload.getCdnFileHashes");
    assert_eq!(refetched.len(), 1);
    assert_eq!(refetched[0].dc_id, 2);
    assert!(!engine.cdn_hashes().contains(TOKEN));
}

#[tokio::test]
async fn cdn_hash_mismatch_aborts() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let data = payload(300_000);
    let served = data.clone();
    net.on(move |call| match call.method.as_str() {
        "upload.getFile" => {
            let mut tampered = served.clone();
            tampered[10] ^= 0xff;
            redirect(file_hashes(&tampered, 0, tampered.len()))
        }
        "upload.getCdnFile" => Some(Ok(Object::new("upload.cdnFile").with("bytes", cdn_chunk(&served, call)).into())),
        _ => Some(Ok(Value::Bool(true))),
    });

    let info = DownloadInfo::new(location()).dc(2).size(data.len() as u64);
    let err = engine.download_to_vec(&info, DownloadOptions::default()).await.unwrap_err();
    assert!(matches!(err, InvocationError::Security(_)), "{err:?}");
    assert_eq!(net.calls_to("upload.getCdnFile").len(), 1);
    assert!(!engine.cdn_hashes().contains(TOKEN));
}

#[tokio::test]
async fn cdn_mismatch_on_a_later_chunk_stops_the_download() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let data = payload(5 * HASH_SPAN);
    let served = data.clone();
    net.on(move |call| match call.method.as_str() {
        "upload.getFile" => {
            let mut tampered = served.clone();
            tampered[2 * HASH_SPAN + 10] ^= 0xff;
            redirect(file_hashes(&tampered, 0, tampered.len()))
        }
        "upload.getCdnFile" => Some(Ok(Object::new("upload.cdnFile").with("bytes", cdn_chunk(&served, call)).into())),
        _ => Some(Ok(Value::Bool(true))),
    });

    let info = DownloadInfo::new(location()).dc(2).size(data.len() as u64);
    let opts = DownloadOptions::default().part_size(HASH_SPAN).seekable(false);
    let err = engine.download_to_vec(&info, opts).await.unwrap_err();
    assert!(matches!(err, InvocationError::Security(_)), "{err:?}");

    let offsets: Vec<i64> = net.calls_to("upload.getCdnFile").iter()
        .filter_map(|c| c.args.get("offset").and_then(Value::as_i64))
        .collect();
    assert_eq!(offsets, vec![0, HASH_SPAN as i64, 2 * HASH_SPAN as i64]);
    assert!(!engine.cdn_hashes().contains(TOKEN));
}

#[tokio::test]
async fn cdn_reupload_is_requested() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let data = payload(200_000);
    let served = data.clone();
    let flag = Arc::new(AtomicBool::new(false));
    net.on(move |call| match call.method.as_str() {
        "upload.getFile" => redirect(Value::Vector(Vec::new())),
        "upload.getCdnFile" if !flag.load(Ordering::SeqCst) => Some(Ok(Object::new("upload.cdnFileReuploadNeeded")
            .with("request_token", vec![9u8])
            .into())),
        "upload.getCdnFile" => Some(Ok(Object::new("upload.cdnFile").with("bytes", cdn_chunk(&served, call)).into())),
        "upload.reuploadCdnFile" => {
            flag.store(true, Ordering::SeqCst);
            Some(Ok(file_hashes(&served, 0, served.len())))
        }
        _ => Some(Ok(Value::Bool(true))),
    });

    let info = DownloadInfo::new(location()).dc(2).size(data.len() as u64);
    assert_eq!(engine.download_to_vec(&info, DownloadOptions::default()).await.unwrap(), data);

    let reupload = net.calls_to("upload.reuploadCdnFile");
    assert_eq!(reupload.len(), 1);
    assert_eq!(reupload[0].dc_id, 2);
    assert_eq!(reupload[0].args.get("request_token"), Some(&Value::Bytes(vec![9])));
}

#[tokio::test]
async fn rejected_cdn_token_falls_back_to_origin() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let data = payload(100_000);
    let served = data.clone();
    let redirected = AtomicBool::new(false);
    net.on(move |call| match call.method.as_str() {
        "upload.getFile" if !redirected.swap(true, Ordering::SeqCst) => redirect(Value::Vector(Vec::new())),
        "upload.getFile" => file_part(slice(&served, call)),
        "upload.getCdnFile" => rpc(400, "FILE_TOKEN_INVALID"),
        _ => Some(Ok(Value::Bool(true))),
    });

    let info = DownloadInfo::new(location()).dc(2).size(data.len() as u64);
    assert_eq!(engine.download_to_vec(&info, DownloadOptions::default()).await.unwrap(), data);
    let origins: Vec<i32> = net.calls_to("upload.getFile").iter().map(|c| c.dc_id).collect();
    assert_eq!(origins, vec![2, 2]);
}

// ─── Reupload ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn reupload_pipes_download_into_upload() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let data = payload(1_200_000);
    let served = data.clone();
    let parts = Arc::new(Mutex::new(BTreeMap::new()));
    let stored = Arc::clone(&parts);
    net.on(move |call| match call.method.as_str() {
        "upload.getFile" => file_part(slice(&served, call)),
        "upload.saveFilePart" => {
            let part = call.args.get("file_part").and_then(Value::as_i32).unwrap_or(-1);
            let bytes = call.args.get("bytes").and_then(Value::as_bytes).unwrap_or_default().to_vec();
            stored.lock().insert(part, bytes);
            Some(Ok(Value::Bool(true)))
        }
        _ => Some(Ok(Value::Bool(true))),
    });

    let document = Object::new("document")
        .with("id", 77i64)
        .with("access_hash", 5i64)
        .with("file_reference", vec![1u8, 2])
        .with("dc_id", 2)
        .with("size", data.len() as i64)
        .with("mime_type", "video/mp4")
        .with("attributes", Vec::<Value>::new());
    let media = Value::from(Object::new("messageMediaDocument").with("document", document));

    let file = engine.reupload(&media, false, None).await.unwrap();
    assert_eq!(file.parts, 3);
    assert_eq!(file.mime, "video/mp4");
    assert!(file.name.starts_with("5_77"), "{}", file.name);
    assert_eq!(parts.lock().values().flatten().copied().collect::<Vec<u8>>(), data);
}

#[tokio::test]
async fn reupload_needs_size_and_mime() {
    let net = MockNet::new();
    let engine = engine(&net).await;
    let document = Object::new("document")
        .with("id", 77i64)
        .with("access_hash", 5i64)
        .with("dc_id", 2)
        .with("attributes", Vec::<Value>::new());
    let media = Value::from(Object::new("messageMediaDocument").with("document", document));
    let err = engine.reupload(&media, false, None).await.unwrap_err();
    assert!(matches!(err, InvocationError::Usage(_)));
}
