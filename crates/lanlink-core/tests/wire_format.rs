//! Wire conformance tests for the envelope codec.
//!
//! These tests pin the exact bytes of the documented frames so that a node
//! built from this crate stays interoperable with older builds: a call with
//! a token, a fire-and-forget event, and both reply shapes. The unit tests
//! inside the crate cover the error paths; this file is only about what the
//! other side of the socket sees.

use lanlink_core::protocol::envelope::{Envelope, RESULT_MESSAGE};
use serde_json::{json, Map, Value};

fn payload(entries: &[(&str, Value)]) -> Map<String, Value> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[test]
fn test_call_frame_is_byte_exact() {
    let env = Envelope::with_token("Ping", 7, Map::new());
    assert_eq!(env.encode_line().unwrap(), "{\"_Message_\":\"Ping\",\"_Token_\":7}\n");
}

#[test]
fn test_fire_and_forget_frame_is_byte_exact() {
    let env = Envelope::new(
        "ClipboardChanged",
        payload(&[("Formats", json!(["Text", "UnicodeText"]))]),
    );
    assert_eq!(
        env.encode_line().unwrap(),
        "{\"_Message_\":\"ClipboardChanged\",\"Formats\":[\"Text\",\"UnicodeText\"]}\n"
    );
}

#[test]
fn test_reply_frames_are_byte_exact() {
    assert_eq!(
        Envelope::result_ok(7, json!("pong")).encode_line().unwrap(),
        "{\"_Message_\":\"_Result_\",\"Token\":7,\"Result\":\"pong\"}\n"
    );
    assert_eq!(
        Envelope::result_err(7, "boom").encode_line().unwrap(),
        "{\"_Message_\":\"_Result_\",\"Token\":7,\"Error\":\"boom\"}\n"
    );
}

#[test]
fn test_every_frame_is_one_line() {
    let env = Envelope::with_token(
        "RemoteInput",
        3,
        payload(&[("Events", json!("with\nnewline and \"quotes\""))]),
    );
    let line = env.encode_line().unwrap();
    assert!(line.ends_with('\n'));
    // JSON string escaping keeps embedded newlines out of the frame body.
    assert_eq!(line.matches('\n').count(), 1);
}

#[test]
fn test_peer_round_trip_across_the_framing_boundary() {
    // What one node encodes, the remote decodes; the reply comes back the
    // same way.
    let call = Envelope::with_token(
        "ClipboardGetDataPresent",
        11,
        payload(&[("Format", json!("Text"))]),
    );
    let received = Envelope::decode_line(&call.encode_line().unwrap()).unwrap();
    assert_eq!(received.name, "ClipboardGetDataPresent");
    assert_eq!(received.token, Some(11));

    let reply = Envelope::result_ok(received.token.unwrap(), json!(true));
    let received_reply = Envelope::decode_line(&reply.encode_line().unwrap()).unwrap();
    assert_eq!(received_reply.name, RESULT_MESSAGE);
    let (token, outcome) = received_reply.result_parts().unwrap();
    assert_eq!(token, 11);
    assert_eq!(outcome, Ok(json!(true)));
}
