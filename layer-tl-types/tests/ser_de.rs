use layer_tl_types::deserialize::Error;
use layer_tl_types::{Cursor, Deserializable, Object, Serializable, Value};

// ── Wire layout ───────────────────────────────────────────────────────────────

#[test]
fn bool_uses_boxed_constructors() {
    assert_eq!(true.to_bytes(), 0x997275b5u32.to_le_bytes());
    assert_eq!(false.to_bytes(), 0xbc799737u32.to_le_bytes());
    assert!(bool::from_bytes(&0x997275b5u32.to_le_bytes()).unwrap());
    assert_eq!(
        bool::from_bytes(&0xdeadbeefu32.to_le_bytes()),
        Err(Error::UnexpectedConstructor { id: 0xdeadbeef })
    );
}

#[test]
fn short_bytes_are_padded_to_four() {
    let bytes = b"abcde".as_slice().to_bytes();
    assert_eq!(bytes, [5, b'a', b'b', b'c', b'd', b'e', 0, 0]);
    assert_eq!(Vec::<u8>::from_bytes(&bytes).unwrap(), b"abcde");
}

#[test]
fn long_bytes_use_three_byte_length() {
    let payload = vec![7u8; 300];
    let bytes = payload.to_bytes();
    assert_eq!(&bytes[..4], &[0xfe, 0x2c, 0x01, 0x00]);
    assert_eq!(bytes.len() % 4, 0);
    assert_eq!(Vec::<u8>::from_bytes(&bytes).unwrap(), payload);
}

#[test]
fn vector_of_longs_is_boxed() {
    let ids = vec![1i64, -2];
    let bytes = ids.to_bytes();
    assert_eq!(&bytes[..4], &0x1cb5c415u32.to_le_bytes());
    assert_eq!(&bytes[4..8], &2i32.to_le_bytes());
    assert_eq!(Vec::<i64>::from_bytes(&bytes).unwrap(), ids);
}

#[test]
fn int128_is_raw() {
    let nonce: [u8; 16] = core::array::from_fn(|i| i as u8);
    assert_eq!(nonce.to_bytes(), nonce.to_vec());
}

#[test]
fn truncated_input_is_eof() {
    assert_eq!(i32::from_bytes(&[0x01, 0x02]), Err(Error::UnexpectedEof));
    assert_eq!(Vec::<u8>::from_bytes(&[10, 1, 2]), Err(Error::UnexpectedEof));
}

#[test]
fn cursor_peek_does_not_advance() {
    let bytes = [0x15, 0xc4, 0xb5, 0x1c, 0, 0, 0, 0];
    let mut cur = Cursor::from_slice(&bytes);
    assert_eq!(cur.peek_id().unwrap(), 0x1cb5c415);
    assert_eq!(cur.pos(), 0);
    assert!(Vec::<i32>::deserialize(&mut cur).unwrap().is_empty());
    assert_eq!(cur.remaining(), 0);
}

#[test]
fn option_none_writes_nothing() {
    assert!(None::<i32>.to_bytes().is_empty());
    assert_eq!(Some(42i32).to_bytes(), 42i32.to_bytes());
}

// ── Value model ───────────────────────────────────────────────────────────────

#[test]
fn object_builder_and_accessors() {
    let v: Value = Object::new("upload.getFile")
        .with("offset", 4096i64)
        .with("limit", 1024)
        .with("precise", true)
        .into();

    assert_eq!(v.predicate(), Some("upload.getFile"));
    assert_eq!(v.get("offset").and_then(Value::as_i64), Some(4096));
    assert_eq!(v.get("limit").and_then(Value::as_i64), Some(1024));
    assert!(v.get("precise").unwrap().is_true());
    assert!(v.get("missing").is_none());
}

#[test]
fn long_narrows_to_i32_only_when_it_fits() {
    assert_eq!(Value::Long(5).as_i32(), Some(5));
    assert_eq!(Value::Long(i64::MAX).as_i32(), None);
}

#[test]
fn option_converts_to_null() {
    assert!(Value::from(None::<i32>).is_null());
    assert_eq!(Value::from(Some("x")), Value::String("x".into()));
    assert!(Value::default().is_null());
}

#[test]
fn required_fields_report_their_name() {
    let obj = Object::new("upload.file").with("bytes", 12);
    assert_eq!(
        obj.bytes_field("bytes"),
        Err(Error::UnexpectedValue { expected: "bytes", field: "bytes".into() })
    );
    assert!(obj.i64_field("bytes").is_ok());
}

#[test]
fn get_mut_edits_in_place() {
    let mut v: Value = Object::new("messages.sendMessage").with("message", "hi").into();
    *v.get_mut("message").unwrap() = "bye".into();
    assert_eq!(v.get("message").and_then(Value::as_str), Some("bye"));
}
