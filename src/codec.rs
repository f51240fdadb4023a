//! 프레임 코덱
//!
//! 프레임 구조:
//! - V1: `0xFE | len(u8) | seq | sysid | compid | payload | crc32(LE)`
//! - V2: `0xFD | len(u16 LE) | seq | sysid | compid | payload | crc32(LE)`
//!
//! payload는 bincode로 직렬화된 [`Message`], CRC는 시작 바이트 이후 payload 끝까지.
//! 와이어 버전은 코덱 값마다 따로 가지므로 버전이 다른 링크가 공존할 수 있음.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::debug;

use crate::message::{Frame, FrameHeader, Message};
use crate::{Error, PeerId, Result};

/// V1 시작 바이트
pub const STX_V1: u8 = 0xFE;

/// V2 시작 바이트
pub const STX_V2: u8 = 0xFD;

const CRC_LEN: usize = 4;

/// 와이어 프로토콜 버전
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireVersion {
    /// V1으로 송신하다가 V2 프레임을 한 번이라도 받으면 V2로 전환
    Auto,
    V1,
    V2,
}

impl WireVersion {
    fn header_len(is_v2: bool) -> usize {
        if is_v2 {
            6
        } else {
            5
        }
    }

    fn max_payload(is_v2: bool) -> usize {
        if is_v2 {
            u16::MAX as usize
        } else {
            u8::MAX as usize
        }
    }
}

/// 스트리밍 프레임 코덱
#[derive(Debug)]
pub struct Codec {
    version: WireVersion,
    sensed_v2: bool,
    system_id: PeerId,
    component_id: u8,
    sequence: u8,
    buffer: BytesMut,
    dropped_frames: u64,
}

impl Codec {
    pub fn new(system_id: PeerId, component_id: u8, version: WireVersion) -> Self {
        Self {
            version,
            sensed_v2: false,
            system_id,
            component_id,
            sequence: 0,
            buffer: BytesMut::with_capacity(4096),
            dropped_frames: 0,
        }
    }

    /// 현재 송신에 사용하는 버전이 V2인지
    pub fn sends_v2(&self) -> bool {
        match self.version {
            WireVersion::V1 => false,
            WireVersion::V2 => true,
            WireVersion::Auto => self.sensed_v2,
        }
    }

    /// CRC 불일치/알 수 없는 메시지로 버린 프레임 수
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// 메시지를 이 코덱의 송신 ID로 인코딩
    pub fn encode(&mut self, message: &Message) -> Result<Bytes> {
        let header = FrameHeader {
            sequence: self.sequence,
            system_id: self.system_id,
            component_id: self.component_id,
        };
        let bytes = self.encode_with_header(header, message)?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(bytes)
    }

    fn encode_with_header(&self, header: FrameHeader, message: &Message) -> Result<Bytes> {
        let is_v2 = self.sends_v2();
        let payload = bincode::serialize(message)?;

        let max = WireVersion::max_payload(is_v2);
        if payload.len() > max {
            return Err(Error::FrameTooLarge {
                len: payload.len(),
                max,
            });
        }

        let header_len = WireVersion::header_len(is_v2);
        let mut buf = BytesMut::with_capacity(header_len + payload.len() + CRC_LEN);
        if is_v2 {
            buf.put_u8(STX_V2);
            buf.put_u16_le(payload.len() as u16);
        } else {
            buf.put_u8(STX_V1);
            buf.put_u8(payload.len() as u8);
        }
        buf.put_u8(header.sequence);
        buf.put_u8(header.system_id);
        buf.put_u8(header.component_id);
        buf.extend_from_slice(&payload);

        let crc = crc32fast::hash(&buf[1..]);
        buf.put_u32_le(crc);

        Ok(buf.freeze())
    }

    /// 수신 바이트를 누적하고 완성된 프레임을 모두 반환
    ///
    /// 불완전한 프레임은 다음 호출까지 버퍼에 남음.
    pub fn decode(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();

        loop {
            // 시작 바이트 탐색
            let start = self
                .buffer
                .iter()
                .position(|&b| b == STX_V1 || b == STX_V2);

            match start {
                Some(pos) => self.buffer.advance(pos),
                None => {
                    self.buffer.clear();
                    break;
                }
            }

            let is_v2 = self.buffer[0] == STX_V2;
            let header_len = WireVersion::header_len(is_v2);
            if self.buffer.len() < header_len {
                break;
            }

            let payload_len = if is_v2 {
                u16::from_le_bytes([self.buffer[1], self.buffer[2]]) as usize
            } else {
                self.buffer[1] as usize
            };

            let total = header_len + payload_len + CRC_LEN;
            if self.buffer.len() < total {
                break;
            }

            let body_end = header_len + payload_len;
            let expected = crc32fast::hash(&self.buffer[1..body_end]);
            let got = u32::from_le_bytes([
                self.buffer[body_end],
                self.buffer[body_end + 1],
                self.buffer[body_end + 2],
                self.buffer[body_end + 3],
            ]);

            if expected != got {
                // 재동기화: 시작 바이트 하나만 버리고 다시 탐색
                debug!("{}", Error::CrcMismatch { expected, got });
                self.dropped_frames += 1;
                self.buffer.advance(1);
                continue;
            }

            let raw = self.buffer.split_to(total);
            let header = FrameHeader {
                sequence: raw[header_len - 3],
                system_id: raw[header_len - 2],
                component_id: raw[header_len - 1],
            };

            match bincode::deserialize::<Message>(&raw[header_len..body_end]) {
                Ok(message) => {
                    if is_v2 && self.version == WireVersion::Auto && !self.sensed_v2 {
                        debug!("V2 프레임 감지, 송신 버전 전환");
                        self.sensed_v2 = true;
                    }
                    frames.push(Frame { header, message });
                }
                Err(e) => {
                    debug!("알 수 없는 메시지: sysid={}, {}", header.system_id, e);
                    self.dropped_frames += 1;
                }
            }
        }

        frames
    }
}
