use super::*;
use assert_matches::assert_matches;

fn login() -> Login {
    Login {
        protocol_version: CURRENT_PROTOCOL_VERSION,
        role: "server".to_string(),
        host: "data01.example.org".to_string(),
        port: 1094,
        session_id: Some("s-1".to_string()),
        level: 0,
        config_id: 7,
        exports: vec![Export {
            prefix: "/store".to_string(),
            writable: true,
        }],
        suspended: false,
        no_stage: false,
        disk: DiskReport {
            disk_free: 1 << 20,
            disk_util: 40,
            disk_nums: 2,
        },
        credentials: b"unix\0alice".to_vec(),
    }
}

#[test]
fn test_header_layout() {
    let frame = Frame::empty(0x01020304, RRCode::Status, modifier::SUSPEND | modifier::STAGE);
    let encoded = frame.encode();

    assert_eq!(encoded.len(), HEADER_LEN);
    assert_eq!(&encoded[..4], &[1, 2, 3, 4]);
    assert_eq!(encoded[4], RRCode::Status as u8);
    assert_eq!(encoded[5], 0x09);
    assert_eq!(&encoded[6..8], &[0, 0]);
}

#[test]
fn test_login_frame_decodes() {
    let frame = Request::Login(Box::new(login())).to_frame(3).unwrap();
    assert_eq!(frame.header.dlen as usize, frame.body.len());

    let decoded = Frame::decode(frame.encode()).unwrap();
    assert_eq!(decoded.header.stream_id, 3);
    assert_matches!(Request::from_frame(&decoded), Ok(Request::Login(l)) if l.host == "data01.example.org");
}

#[test]
fn test_status_carries_modifier_only() {
    let frame = Request::Status(modifier::NO_STAGE).to_frame(0).unwrap();
    assert!(frame.body.is_empty());
    assert_eq!(
        Request::from_frame(&frame).unwrap(),
        Request::Status(modifier::NO_STAGE)
    );
}

#[test]
fn test_unknown_code_is_rejected() {
    let mut raw = Frame::empty(1, RRCode::Ping, 0).encode().to_vec();
    raw[4] = 200;
    assert_matches!(
        Frame::decode(Bytes::from(raw)),
        Err(WireError::UnknownCode(200))
    );
}

#[test]
fn test_response_frames_are_not_requests() {
    let frame = Response::Pong.to_frame(9).unwrap();
    assert_eq!(Response::from_frame(&frame).unwrap(), Response::Pong);

    let data = Response::Space(SpaceReport {
        disk_free: 10,
        disk_util: 5,
    })
    .to_frame(9)
    .unwrap();
    assert_matches!(Request::from_frame(&data), Err(WireError::Unexpected(RRCode::Data)));
}

#[test]
fn test_frame_parser() {
    let frame1 = Request::Have("/store/a".to_string()).to_frame(1).unwrap().encode();
    let frame2 = Request::Ping.to_frame(2).unwrap().encode();

    let mut parser = FrameParser::new();

    parser.extend(&frame1[0..4]);
    assert!(parser.parse().unwrap().is_none());

    parser.extend(&frame1[4..10]);
    assert!(parser.parse().unwrap().is_none());

    parser.extend(&frame1[10..]);
    parser.extend(&frame2);

    let parsed1 = parser.parse().unwrap().unwrap();
    let parsed2 = parser.parse().unwrap().unwrap();
    assert!(parser.parse().unwrap().is_none());

    assert_eq!(
        Request::from_frame(&parsed1).unwrap(),
        Request::Have("/store/a".to_string())
    );
    assert_eq!(parsed2.header.stream_id, 2);
    assert_eq!(Request::from_frame(&parsed2).unwrap(), Request::Ping);
}

#[test]
fn test_frame_parser_skips_unknown_code() {
    let mut unknown = Request::Have("/store/a".to_string())
        .to_frame(7)
        .unwrap()
        .encode()
        .to_vec();
    unknown[4] = 99;
    let next = Request::Ping.to_frame(8).unwrap().encode();

    let mut parser = FrameParser::new();
    parser.extend(&unknown[..HEADER_LEN + 2]);
    assert!(parser.parse().unwrap().is_none());
    parser.extend(&unknown[HEADER_LEN + 2..]);
    parser.extend(&next);

    assert_matches!(
        parser.parse(),
        Err(WireError::Unsupported {
            stream_id: 7,
            code: 99
        })
    );
    let parsed = parser.parse().unwrap().unwrap();
    assert_eq!(parsed.header.stream_id, 8);
    assert_eq!(Request::from_frame(&parsed).unwrap(), Request::Ping);
}

#[tokio::test]
async fn test_frame_reader_end_of_stream() {
    let (mut client, server) = tokio::io::duplex(64);
    let frame = Request::Usage.to_frame(5).unwrap().encode();

    tokio::io::AsyncWriteExt::write_all(&mut client, &frame)
        .await
        .unwrap();
    drop(client);

    let mut reader = FrameReader::new(server);
    let read = reader.read_frame().await.unwrap().unwrap();
    assert_eq!(read.header.code, RRCode::Usage);
    assert!(reader.read_frame().await.unwrap().is_none());
}
