//! Turning media objects into download locations.

use std::path::Path;

use layer_crypto::aes::Ige;
use layer_tl_types::{Object, Value};

use crate::errors::InvocationError;
use crate::schema::ReferenceDatabase;

// ─── FileKey ──────────────────────────────────────────────────────────────────

/// AES-256-IGE key material of a secret-chat file.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FileKey {
    pub key:         [u8; 32],
    pub iv:          [u8; 32],
    /// Fingerprint announced alongside the file.
    pub fingerprint: i32,
}

impl FileKey {
    /// Key material with its own fingerprint.
    pub fn new(key: [u8; 32], iv: [u8; 32]) -> Self {
        Self { key, iv, fingerprint: layer_crypto::key_fingerprint(&key, &iv) }
    }

    /// Fresh random key material.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        let mut iv = [0u8; 32];
        getrandom::getrandom(&mut key).expect("getrandom");
        getrandom::getrandom(&mut iv).expect("getrandom");
        Self::new(key, iv)
    }

    /// The announced fingerprint must match the key material.
    pub fn check(&self) -> Result<(), InvocationError> {
        if layer_crypto::key_fingerprint(&self.key, &self.iv) != self.fingerprint {
            tracing::error!("[files] file key fingerprint mismatch");
            return Err(InvocationError::Security("Fingerprint mismatch!".into()));
        }
        Ok(())
    }

    pub(crate) fn cipher(&self) -> Ige {
        Ige::new(&self.key, &self.iv)
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKey").field("fingerprint", &self.fingerprint).finish_non_exhaustive()
    }
}

// ─── DownloadInfo ─────────────────────────────────────────────────────────────

/// Everything a download needs to know about a file.
#[derive(Clone, Debug, PartialEq)]
pub struct DownloadInfo {
    /// An `InputFileLocation` object.
    pub location: Object,
    /// Datacenter holding the file, when the media says so.
    pub dc_id:    Option<i32>,
    pub size:     Option<u64>,
    pub name:     String,
    /// Extension with its leading dot, e.g. `".jpg"`.
    pub ext:      String,
    pub mime:     String,
    /// Set for secret-chat files.
    pub key:      Option<FileKey>,
}

impl DownloadInfo {
    pub fn new(location: Object) -> Self {
        Self {
            location,
            dc_id: None,
            size:  None,
            name:  String::new(),
            ext:   String::new(),
            mime:  String::new(),
            key:   None,
        }
    }

    pub fn dc(mut self, dc_id: i32) -> Self { self.dc_id = Some(dc_id); self }
    pub fn size(mut self, size: u64) -> Self { self.size = Some(size); self }
    pub fn mime(mut self, mime: impl Into<String>) -> Self { self.mime = mime.into(); self }
    pub fn key(mut self, key: FileKey) -> Self { self.key = Some(key); self }

    /// `name` followed by `ext`.
    pub fn file_name(&self) -> String {
        format!("{}{}", self.name, self.ext)
    }
}

// ─── Resolution ───────────────────────────────────────────────────────────────

/// Work out where `media` can be downloaded from.
///
/// Accepts message updates, messages, message media, bare documents and
/// photos, wallpapers and encrypted messages carrying a decrypted media
/// object.
pub fn resolve(media: &Value, refs: &dyn ReferenceDatabase) -> Result<DownloadInfo, InvocationError> {
    let predicate = media.predicate()
        .ok_or_else(|| InvocationError::Usage("media is not a TL object".into()))?;
    match predicate {
        "updateNewMessage" | "updateNewChannelMessage" | "updateEditMessage" | "updateEditChannelMessage" => {
            resolve(field(media, "message")?, refs)
        }
        "message" => resolve(field(media, "media")?, refs),
        "updateNewEncryptedMessage" => resolve(field(media, "message")?, refs),
        "encryptedMessage" => {
            let inner = field(field(media, "decrypted_message")?, "media")?;
            if inner.predicate() == Some("decryptedMessageMediaExternalDocument") {
                return document(inner, refs);
            }
            encrypted(media, inner)
        }
        "wallPaper" => document(field(media, "document")?, refs),
        "messageMediaPhoto" => photo(field(media, "photo")?, refs),
        "photo" => photo(media, refs),
        "messageMediaDocument" => document(field(media, "document")?, refs),
        "document" | "decryptedMessageMediaExternalDocument" => document(media, refs),
        other => Err(InvocationError::Usage(format!("Invalid constructor provided: {other}"))),
    }
}

fn document(doc: &Value, refs: &dyn ReferenceDatabase) -> Result<DownloadInfo, InvocationError> {
    let id = long(doc, "id")?;
    let access_hash = long(doc, "access_hash")?;
    let mime = doc.get("mime_type").and_then(Value::as_str).unwrap_or_default().to_string();

    let (mut name, mut ext) = names_from_attributes(doc.get("attributes"));
    if ext.is_empty() {
        ext = ext_from_mime(&mime);
    }
    if name.is_empty() {
        name = access_hash.to_string();
    }
    name = format!("{name}_{id}");

    let location = Object::new("inputDocumentFileLocation")
        .with("id", id)
        .with("access_hash", access_hash)
        .with("file_reference", reference(doc, refs))
        .with("thumb_size", "");
    Ok(DownloadInfo {
        location,
        dc_id: doc.get("dc_id").and_then(Value::as_i32),
        size:  doc.get("size").and_then(Value::as_i64).and_then(|s| u64::try_from(s).ok()),
        name,
        ext,
        mime,
        key:   None,
    })
}

fn photo(photo: &Value, refs: &dyn ReferenceDatabase) -> Result<DownloadInfo, InvocationError> {
    let id = long(photo, "id")?;
    let access_hash = long(photo, "access_hash")?;
    let dc_id = photo.get("dc_id").and_then(Value::as_i32);
    let sizes = photo.get("sizes").and_then(Value::as_vec).unwrap_or_default();
    let largest = largest_size(sizes)
        .ok_or_else(|| InvocationError::Usage(format!("photo {id} has no downloadable size")))?;
    let thumb = largest.get("type").and_then(Value::as_str).unwrap_or("x").to_string();

    let location = Object::new("inputPhotoFileLocation")
        .with("id", id)
        .with("access_hash", access_hash)
        .with("file_reference", reference(photo, refs))
        .with("thumb_size", thumb.as_str());
    Ok(DownloadInfo {
        location,
        dc_id,
        size: size_of(largest),
        name: format!("{id}_{thumb}_{}", dc_id.unwrap_or_default()),
        ext:  ".jpg".into(),
        mime: "image/jpeg".into(),
        key:  None,
    })
}

fn encrypted(message: &Value, media: &Value) -> Result<DownloadInfo, InvocationError> {
    let file = field(message, "file")?;
    let id = long(file, "id")?;
    let access_hash = long(file, "access_hash")?;
    let key = FileKey {
        key:         array32(media, "key")?,
        iv:          array32(media, "iv")?,
        fingerprint: file.get("key_fingerprint").and_then(Value::as_i32)
            .ok_or_else(|| missing("key_fingerprint"))?,
    };

    let (mut name, mut ext) = (String::new(), String::new());
    if let Some(file_name) = media.get("file_name").and_then(Value::as_str) {
        (name, ext) = split_name(file_name);
    }
    let (attr_name, attr_ext) = names_from_attributes(media.get("attributes"));
    if !attr_name.is_empty() {
        name = attr_name;
    }
    if !attr_ext.is_empty() {
        ext = attr_ext;
    }
    let mut mime = media.get("mime_type").and_then(Value::as_str).unwrap_or_default().to_string();
    if mime.is_empty() && media.predicate() == Some("decryptedMessageMediaPhoto") {
        mime = "image/jpeg".into();
    }
    if ext.is_empty() {
        ext = ext_from_mime(if mime.is_empty() { "image/jpeg" } else { &mime });
    }
    if mime.is_empty() {
        mime = mime_guess::from_ext(ext.trim_start_matches('.')).first_raw().unwrap_or("image/jpeg").to_string();
    }
    if name.is_empty() {
        name = access_hash.to_string();
    }

    let location = Object::new("inputEncryptedFileLocation")
        .with("id", id)
        .with("access_hash", access_hash);
    Ok(DownloadInfo {
        location,
        dc_id: file.get("dc_id").and_then(Value::as_i32),
        size:  media.get("size").and_then(Value::as_i64).and_then(|s| u64::try_from(s).ok()),
        name,
        ext,
        mime,
        key:   Some(key),
    })
}

/// File name and audio attributes, as `(name, ext)`.
fn names_from_attributes(attributes: Option<&Value>) -> (String, String) {
    let (mut name, mut ext) = (String::new(), String::new());
    let mut audio = None;
    for attr in attributes.and_then(Value::as_vec).unwrap_or_default() {
        match attr.predicate() {
            Some("documentAttributeFilename") => {
                if let Some(file_name) = attr.get("file_name").and_then(Value::as_str) {
                    (name, ext) = split_name(file_name);
                }
            }
            Some("documentAttributeAudio") => audio = Some(attr),
            _ => {}
        }
    }
    if let (true, Some(audio)) = (name.is_empty(), audio) {
        if let Some(title) = audio.get("title").and_then(Value::as_str) {
            name = title.to_string();
            if let Some(performer) = audio.get("performer").and_then(Value::as_str) {
                name = format!("{name} - {performer}");
            }
        }
    }
    (name, ext)
}

fn split_name(file_name: &str) -> (String, String) {
    let path = Path::new(file_name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(file_name).to_string();
    let ext = path.extension().and_then(|e| e.to_str()).map(|e| format!(".{e}")).unwrap_or_default();
    (stem, ext)
}

fn ext_from_mime(mime: &str) -> String {
    mime_guess::get_mime_extensions_str(mime)
        .and_then(|exts| exts.first())
        .map(|e| format!(".{e}"))
        .unwrap_or_default()
}

/// The biggest real photo size; stripped and vector thumbnails never win.
fn largest_size(sizes: &[Value]) -> Option<&Value> {
    sizes.iter()
        .filter(|s| matches!(
            s.predicate(),
            Some("photoSize" | "photoSizeProgressive" | "photoCachedSize")
        ))
        .max_by_key(|s| {
            let w = s.get("w").and_then(Value::as_i64).unwrap_or(0);
            let h = s.get("h").and_then(Value::as_i64).unwrap_or(0);
            w * h
        })
}

fn size_of(size: &Value) -> Option<u64> {
    let bytes = match size.predicate()? {
        "photoSize" => size.get("size")?.as_i64()?,
        "photoSizeProgressive" => size.get("sizes")?.as_vec()?.last()?.as_i64()?,
        "photoCachedSize" => size.get("bytes")?.as_bytes()?.len() as i64,
        _ => return None,
    };
    u64::try_from(bytes).ok()
}

fn reference(object: &Value, refs: &dyn ReferenceDatabase) -> Vec<u8> {
    refs.get_reference(object)
        .or_else(|| object.get("file_reference").and_then(Value::as_bytes).map(<[u8]>::to_vec))
        .unwrap_or_default()
}

fn field<'a>(v: &'a Value, name: &str) -> Result<&'a Value, InvocationError> {
    v.get(name).ok_or_else(|| missing(name))
}

fn long(v: &Value, name: &str) -> Result<i64, InvocationError> {
    field(v, name)?.as_i64().ok_or_else(|| missing(name))
}

fn array32(v: &Value, name: &str) -> Result<[u8; 32], InvocationError> {
    field(v, name)?
        .as_bytes()
        .and_then(|b| <[u8; 32]>::try_from(b).ok())
        .ok_or_else(|| missing(name))
}

fn missing(name: &str) -> InvocationError {
    InvocationError::Usage(format!("media has no usable `{name}`"))
}
