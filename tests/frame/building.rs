//! Tests for frame encoding

use bytes::Bytes;
use wsmux::{opcode, reset_code, Frame, FrameHeader, HEADER_LEN};

#[test]
fn test_encode_open_layout() {
    let bytes = Frame::Open {
        stream_id: 1,
        window: 0x0001_0000,
    }
    .encode();
    assert_eq!(&bytes[..], &[0, 0, 0, 0, 1, 0, 1, 0, 0]);
}

#[test]
fn test_encode_data_appends_payload() {
    let bytes = Frame::Data {
        stream_id: 4,
        payload: Bytes::from_static(b"hello"),
    }
    .encode();

    assert_eq!(bytes.len(), HEADER_LEN + 5);
    assert_eq!(&bytes[..HEADER_LEN], &[1, 0, 0, 0, 4, 0, 0, 0, 5]);
    assert_eq!(&bytes[HEADER_LEN..], b"hello");
}

#[test]
fn test_encode_empty_data_is_header_only() {
    let bytes = Frame::Data {
        stream_id: 3,
        payload: Bytes::new(),
    }
    .encode();
    assert_eq!(&bytes[..], &[1, 0, 0, 0, 3, 0, 0, 0, 0]);
}

#[test]
fn test_encode_reset_and_close() {
    let reset = Frame::Reset {
        stream_id: 6,
        code: reset_code::FLOW_CONTROL_ERROR,
    }
    .encode();
    assert_eq!(&reset[..], &[4, 0, 0, 0, 6, 0, 0, 0, 2]);

    let close = Frame::Close { stream_id: 6 }.encode();
    assert_eq!(&close[..], &[3, 0, 0, 0, 6, 0, 0, 0, 0]);
}

#[test]
fn test_header_matches_encoding() {
    let frame = Frame::WindowUpdate {
        stream_id: 10,
        increment: 32768,
    };
    let bytes = frame.encode();
    let parsed = FrameHeader::parse(&bytes).unwrap();

    assert_eq!(parsed, frame.header());
    assert_eq!(parsed.opcode, opcode::WINDOW_UPDATE);
    assert_eq!(parsed.total_size(), bytes.len());
}

#[test]
fn test_large_data_frame_survives_decode() {
    let payload: Vec<u8> = (0..16 * 1024).map(|i| (i % 251) as u8).collect();
    let frame = Frame::Data {
        stream_id: 1,
        payload: Bytes::from(payload),
    };
    assert_eq!(Frame::decode(frame.encode()).unwrap(), frame);
}
