//! Wire codec over a real stream: framing, interleaved frames and
//! binary-tail consumption through the async reader.

use remdap::remote::wire::{self, Frame, OMITTED_PLACEHOLDER, STATUS_OK};
use serde_json::json;
use tokio::io::AsyncWriteExt;

#[tokio::test]
async fn frames_round_trip_across_a_stream() {
    let (mut client, server) = tokio::io::duplex(4096);
    let (mut read, _write) = tokio::io::split(server);

    let first = Frame::call(1, "setBreaks", json!({"module": "", "lines": [3, 7]}));
    let second = Frame::call(2, "stackTrace", json!({}));
    wire::write_frame(&mut client, &first).await.unwrap();
    wire::write_frame(&mut client, &second).await.unwrap();

    let decoded = wire::read_frame(&mut read).await.unwrap();
    assert_eq!(decoded.id, Some(1));
    assert_eq!(decoded.func.as_deref(), Some("setBreaks"));
    assert_eq!(decoded.data, first.data);

    let decoded = wire::read_frame(&mut read).await.unwrap();
    assert_eq!(decoded.id, Some(2));
    assert_eq!(decoded.func.as_deref(), Some("stackTrace"));
}

#[tokio::test]
async fn binary_tail_is_sized_from_the_header() {
    let (mut client, server) = tokio::io::duplex(4096);
    let (mut read, _write) = tokio::io::split(server);

    // A response whose data entries reference trailing binary segments:
    // the first consumes four bytes, the second is the omitted sentinel.
    let header = json!({
        "id": 9,
        "data": [
            {"name": "big", "offset": 4},
            {"name": "huge", "offset": -1},
        ],
        "message": STATUS_OK,
    });
    let header_bytes = serde_json::to_vec(&header).unwrap();
    let mut message = Vec::new();
    message.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    message.extend_from_slice(&header_bytes);
    message.extend_from_slice(b"8421");
    // Trailing bytes of the next frame must not be consumed as payload.
    let follow_up = wire::encode(&Frame::call(10, "pauseRun", json!({}))).unwrap();
    message.extend_from_slice(&follow_up);

    client.write_all(&message).await.unwrap();

    let frame = wire::read_frame(&mut read).await.unwrap();
    assert!(frame.is_ok());
    let entries = frame.data.as_array().unwrap();
    assert_eq!(entries[0]["data"], json!(8421));
    assert_eq!(entries[1]["data"], json!(OMITTED_PLACEHOLDER));

    let next = wire::read_frame(&mut read).await.unwrap();
    assert_eq!(next.id, Some(10));
    assert_eq!(next.func.as_deref(), Some("pauseRun"));
}
