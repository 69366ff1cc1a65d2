//! Frame codec: `u32` big-endian length, then zlib-compressed JSON.

use super::packets::InboundPacket;
use crate::config::types::{JudgeError, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{ErrorKind, Read, Write};

/// Largest frame accepted, compressed or not
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Length prefix plus compressed body
pub fn encode_frame<T: Serialize>(packet: &T) -> Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(vec![0u8; 4], Compression::default());
    serde_json::to_writer(&mut encoder, packet)?;
    let mut frame = encoder.finish()?;
    let length = frame.len() - 4;
    if length > MAX_FRAME_SIZE {
        return Err(JudgeError::Protocol(format!("packet of {} bytes is too large", length)));
    }
    frame[..4].copy_from_slice(&(length as u32).to_be_bytes());
    Ok(frame)
}

/// Inflate and parse one frame body
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    let mut json = Vec::new();
    ZlibDecoder::new(body)
        .take(MAX_FRAME_SIZE as u64 + 1)
        .read_to_end(&mut json)
        .map_err(|e| JudgeError::Protocol(format!("bad compressed packet: {}", e)))?;
    if json.len() > MAX_FRAME_SIZE {
        return Err(JudgeError::Protocol("packet inflates past the frame limit".to_string()));
    }
    Ok(serde_json::from_slice(&json)?)
}

/// Decode a whole frame, prefix included
pub fn decode_frame<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    if frame.len() < 4 {
        return Err(JudgeError::Protocol("frame shorter than its prefix".to_string()));
    }
    let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if frame.len() - 4 != length {
        return Err(JudgeError::Protocol(format!(
            "frame declares {} bytes, has {}",
            length,
            frame.len() - 4
        )));
    }
    decode_body(&frame[4..])
}

pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, packet: &T) -> Result<()> {
    let frame = encode_frame(packet)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Read one compressed body. Socket timeouts come back as `Io`.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut length = [0u8; 4];
    reader.read_exact(&mut length).map_err(closed_or_io)?;
    let length = u32::from_be_bytes(length) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(JudgeError::Protocol(format!("frame of {} bytes exceeds the limit", length)));
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).map_err(closed_or_io)?;
    Ok(body)
}

pub fn read_packet<R: Read>(reader: &mut R) -> Result<InboundPacket> {
    let body = read_frame(reader)?;
    InboundPacket::from_value(decode_body(&body)?)
}

fn closed_or_io(err: std::io::Error) -> JudgeError {
    if err.kind() == ErrorKind::UnexpectedEof {
        JudgeError::Protocol("connection closed by server".to_string())
    } else {
        JudgeError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packets::{CaseStatus, OutboundPacket};
    use std::io::Cursor;

    #[test]
    fn test_outbound_round_trip() {
        let packets = vec![
            OutboundPacket::SubmissionAcknowledged { submission_id: 9 },
            OutboundPacket::CurrentSubmissionId { submission_id: None },
            OutboundPacket::InternalError {
                submission_id: 9,
                message: "worker died".to_string(),
            },
            OutboundPacket::TestCaseStatus {
                submission_id: 9,
                cases: vec![CaseStatus {
                    position: 0,
                    status: 0,
                    time: 0.01,
                    points: 1.0,
                    total_points: 1.0,
                    memory: 512,
                    output: "3\n".to_string(),
                    feedback: String::new(),
                    extended_feedback: String::new(),
                    voluntary_context_switches: 1,
                    involuntary_context_switches: 0,
                    runtime_version: "gcc 13.2.0".to_string(),
                }],
            },
        ];
        for packet in packets {
            let frame = encode_frame(&packet).unwrap();
            let decoded: OutboundPacket = decode_frame(&frame).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn test_prefix_is_compressed_length() {
        let frame = encode_frame(&serde_json::json!({"name": "ping", "when": 1.0})).unwrap();
        let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(length, frame.len() - 4);
        let packet = read_packet(&mut Cursor::new(frame)).unwrap();
        assert_eq!(packet, InboundPacket::Ping { when: 1.0 });
    }

    #[test]
    fn test_oversized_prefix_is_rejected() {
        let mut frame = ((MAX_FRAME_SIZE + 1) as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&[0u8; 16]);
        assert!(matches!(
            read_frame(&mut Cursor::new(frame)),
            Err(JudgeError::Protocol(_))
        ));
    }

    #[test]
    fn test_truncated_stream_reports_closed() {
        let frame = encode_frame(&serde_json::json!({"name": "disconnect"})).unwrap();
        let truncated = frame[..frame.len() - 2].to_vec();
        assert!(matches!(
            read_frame(&mut Cursor::new(truncated)),
            Err(JudgeError::Protocol(msg)) if msg.contains("closed")
        ));
    }

    #[test]
    fn test_garbage_body_is_a_protocol_error() {
        let mut frame = 4u32.to_be_bytes().to_vec();
        frame.extend_from_slice(b"nope");
        assert!(matches!(
            read_packet(&mut Cursor::new(frame)),
            Err(JudgeError::Protocol(_))
        ));
    }
}
