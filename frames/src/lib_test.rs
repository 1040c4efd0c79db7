use super::*;
use serde_json::json;

fn sample_join() -> ClientFrame {
    ClientFrame::new(
        "join",
        "req-1",
        json!({"board_slug_id": "AAAAAAAAAAAA", "user_auth_token": "token-123"}),
    )
}

#[test]
fn client_frame_survives_codec() {
    let original = sample_join();
    let bytes = encode_frame(&original).expect("encode");
    let restored: ClientFrame = decode_frame(&bytes).expect("decode");
    assert_eq!(restored, original);
}

#[test]
fn cursor_floats_survive_codec() {
    for (x, y) in [(0.0, 0.0), (-12.5, 3.25), (1024.75, -8.5)] {
        let original = ClientFrame::new("cursor", "c", json!({"x": x, "y": y}));
        let restored: ClientFrame = decode_frame(&encode_frame(&original).expect("encode")).expect("decode");
        assert_eq!(restored, original);
    }
}

#[test]
fn encoded_bytes_are_zlib() {
    let bytes = encode_frame(&sample_join()).expect("encode");
    // zlib header: CM=8 (deflate) and FCHECK makes the first u16 a multiple of 31.
    assert_eq!(bytes[0] & 0x0f, 8);
    assert_eq!((u16::from(bytes[0]) << 8 | u16::from(bytes[1])) % 31, 0);
}

#[test]
fn missing_id_and_data_default_to_empty() {
    let bytes = compress(br#"{"type":"cursor"}"#).expect("compress");
    let frame: ClientFrame = decode_frame(&bytes).expect("decode");
    assert_eq!(frame.kind, "cursor");
    assert!(frame.id.is_empty());
    assert_eq!(frame.data, Value::Null);
}

#[test]
fn plain_json_is_rejected_as_unknown_compression() {
    let err = decode_frame::<ClientFrame>(br#"{"type":"join","id":"1"}"#).unwrap_err();
    assert!(matches!(err, CodecError::Compression(_)), "got {err:?}");
}

#[test]
fn garbage_inside_valid_stream_is_json_error() {
    let bytes = compress(b"not json").expect("compress");
    let err = decode_frame::<ClientFrame>(&bytes).unwrap_err();
    assert!(matches!(err, CodecError::Json(_)), "got {err:?}");
}

#[test]
fn oversized_inflation_is_rejected() {
    let huge = vec![b' '; usize::try_from(MAX_INFLATED_BYTES).expect("fits") + 10];
    let bytes = compress(&huge).expect("compress");
    assert!(matches!(decompress(&bytes), Err(CodecError::TooLarge)));
}

#[test]
fn reply_omits_event_key() {
    let frame = ServerFrame::reply("abc", json!({"ok": true}));
    let text = serde_json::to_string(&frame).expect("serialize");
    assert_eq!(text, r#"{"reply_to":"abc","data":{"ok":true}}"#);
}

#[test]
fn event_omits_reply_to_key() {
    let frame = ServerFrame::event("USER_LEFT", ServerFrame::single("user", json!({"id": 1})));
    let text = serde_json::to_string(&frame).expect("serialize");
    assert_eq!(text, r#"{"event":"USER_LEFT","data":{"user":{"id":1}}}"#);
}

#[test]
fn server_frame_decodes_from_wire() {
    let bytes = encode_frame(&ServerFrame::event("CURSOR", json!({"cursor": {"x": 1.0}}))).expect("encode");
    let frame: ServerFrame = decode_frame(&bytes).expect("decode");
    assert_eq!(frame.event.as_deref(), Some("CURSOR"));
    assert!(frame.reply_to.is_none());
}
