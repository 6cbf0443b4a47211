use agent_runner::models::command::SessionCommand;
use agent_runner::stream::codec::{parse_inbound, ControlFrame, FrameCodec, Inbound};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

#[test]
fn handshake_frames_are_control_frames() {
    assert_eq!(
        parse_inbound(r#"{"type":"AUTH_OK"}"#),
        Inbound::Control(ControlFrame::AuthOk)
    );
    assert_eq!(
        parse_inbound(r#"{"type":"AUTH_ERROR","message":"bad token"}"#),
        Inbound::Control(ControlFrame::AuthError {
            message: Some("bad token".into()),
        })
    );
    assert_eq!(
        parse_inbound(r#"{"type":"PONG"}"#),
        Inbound::Control(ControlFrame::Pong { ts: None })
    );
}

#[test]
fn commands_are_validated() {
    assert_eq!(
        parse_inbound(r#"{"type":"RESUME","sessionId":"sess-1"}"#),
        Inbound::Command(SessionCommand::Resume {
            session_id: "sess-1".into(),
        })
    );
    assert!(matches!(
        parse_inbound(r#"{"type":"APPROVE","sessionId":"sess-1"}"#),
        Inbound::Invalid(_)
    ));
}

#[test]
fn garbage_is_invalid_not_an_error() {
    for line in ["", "nope", "[]", r#"{"sessionId":"s"}"#, r#"{"type":"PING"}"#] {
        assert!(matches!(parse_inbound(line), Inbound::Invalid(_)), "{line}");
    }
    match parse_inbound(r#"{"type":"REBOOT"}"#) {
        Inbound::Invalid(reason) => assert!(reason.starts_with("invalid command"), "{reason}"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn malformed_control_frame_names_its_tag() {
    match parse_inbound(r#"{"type":"AUTH_ERROR","message":5}"#) {
        Inbound::Invalid(reason) => {
            assert!(reason.starts_with("invalid AUTH_ERROR frame"), "{reason}");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn codec_splits_lines() {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(&b"{\"a\":1}\n{\"b\""[..]);
    assert_eq!(
        codec.decode(&mut buf).expect("decode").as_deref(),
        Some("{\"a\":1}")
    );
    assert_eq!(codec.decode(&mut buf).expect("decode"), None);
    buf.extend_from_slice(b":2}\r\n");
    assert_eq!(
        codec.decode(&mut buf).expect("decode").as_deref(),
        Some("{\"b\":2}")
    );

    let mut out = BytesMut::new();
    codec
        .encode(ControlFrame::AuthOk.to_line().expect("line"), &mut out)
        .expect("encode");
    assert_eq!(&out[..], b"{\"type\":\"AUTH_OK\"}\n");
}
