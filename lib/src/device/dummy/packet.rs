//! Bitstream format produced and consumed by the software codec.
//!
//! The stream is a sequence of packets, each starting with a 4-bytes tag:
//!
//! * `VCUP`: parameter set (codec, picture size, buffers needed to decode),
//! * `VCUS`: SEI message,
//! * `VCUF`: one frame (size, picture type, flags, and a sample of the
//!   source picture).
//!
//! All integers are little-endian.
use bitflags::bitflags;
use thiserror::Error;

use crate::device::SeiMessage;
use crate::settings::Codec;
use crate::{PictureType, Resolution};

const CONFIG_TAG: &[u8; 4] = b"VCUP";
const SEI_TAG: &[u8; 4] = b"VCUS";
const FRAME_TAG: &[u8; 4] = b"VCUF";

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        /// Frame was partially reconstructed.
        const CONCEALED = 0b001;
        /// Frame cannot be decoded.
        const CORRUPT = 0b010;
        const SKIPPED = 0b100;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Config {
        codec: Codec,
        resolution: Resolution,
        min_buffers: u8,
    },
    Sei(SeiMessage),
    Frame {
        resolution: Resolution,
        picture_type: PictureType,
        flags: FrameFlags,
        data: Vec<u8>,
    },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("truncated packet at offset {0}")]
    Truncated(usize),
    #[error("unknown packet tag {0:?} at offset {1}")]
    UnknownTag([u8; 4], usize),
    #[error("invalid field value {0} at offset {1}")]
    InvalidField(u32, usize),
}

fn picture_type_to_u8(picture_type: PictureType) -> u8 {
    match picture_type {
        PictureType::Idr => 0,
        PictureType::I => 1,
        PictureType::P => 2,
        PictureType::B => 3,
    }
}

fn picture_type_from_u8(v: u8) -> Option<PictureType> {
    Some(match v {
        0 => PictureType::Idr,
        1 => PictureType::I,
        2 => PictureType::P,
        3 => PictureType::B,
        _ => return None,
    })
}

impl Packet {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Packet::Config {
                codec,
                resolution,
                min_buffers,
            } => {
                out.extend_from_slice(CONFIG_TAG);
                out.push(match codec {
                    Codec::Avc => 0,
                    Codec::Hevc => 1,
                });
                out.extend_from_slice(&resolution.width.to_le_bytes());
                out.extend_from_slice(&resolution.height.to_le_bytes());
                out.push(*min_buffers);
            }
            Packet::Sei(sei) => {
                out.extend_from_slice(SEI_TAG);
                out.push(sei.prefix as u8);
                out.extend_from_slice(&sei.payload_type.to_le_bytes());
                out.extend_from_slice(&(sei.payload.len() as u32).to_le_bytes());
                out.extend_from_slice(&sei.payload);
            }
            Packet::Frame {
                resolution,
                picture_type,
                flags,
                data,
            } => {
                out.extend_from_slice(FRAME_TAG);
                out.extend_from_slice(&resolution.width.to_le_bytes());
                out.extend_from_slice(&resolution.height.to_le_bytes());
                out.push(picture_type_to_u8(*picture_type));
                out.push(flags.bits());
                out.extend_from_slice(&(data.len() as u16).to_le_bytes());
                out.extend_from_slice(data);
            }
        }
        out
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], PacketError> {
        let bytes = self
            .data
            .get(self.pos..self.pos + len)
            .ok_or(PacketError::Truncated(self.pos))?;
        self.pos += len;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, PacketError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, PacketError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn packet(&mut self) -> Result<Packet, PacketError> {
        let start = self.pos;
        let mut tag = [0u8; 4];
        tag.copy_from_slice(self.take(4)?);

        match &tag {
            CONFIG_TAG => {
                let codec = match self.u8()? {
                    0 => Codec::Avc,
                    1 => Codec::Hevc,
                    c => return Err(PacketError::InvalidField(c as u32, start + 4)),
                };
                let resolution = Resolution::new(self.u32()?, self.u32()?);
                let min_buffers = self.u8()?;
                Ok(Packet::Config {
                    codec,
                    resolution,
                    min_buffers,
                })
            }
            SEI_TAG => {
                let prefix = self.u8()? != 0;
                let payload_type = self.u32()?;
                let len = self.u32()? as usize;
                let payload = self.take(len)?.to_vec();
                Ok(Packet::Sei(SeiMessage {
                    prefix,
                    payload_type,
                    payload,
                }))
            }
            FRAME_TAG => {
                let resolution = Resolution::new(self.u32()?, self.u32()?);
                let t = self.u8()?;
                let picture_type = picture_type_from_u8(t)
                    .ok_or(PacketError::InvalidField(t as u32, start + 12))?;
                let flags = FrameFlags::from_bits_truncate(self.u8()?);
                let len = self.u16()? as usize;
                let data = self.take(len)?.to_vec();
                Ok(Packet::Frame {
                    resolution,
                    picture_type,
                    flags,
                    data,
                })
            }
            _ => Err(PacketError::UnknownTag(tag, start)),
        }
    }
}

/// Splits `data` into packets.
pub fn parse(data: &[u8]) -> Result<Vec<Packet>, PacketError> {
    let mut reader = Reader { data, pos: 0 };
    let mut packets = Vec::new();
    while reader.pos < data.len() {
        packets.push(reader.packet()?);
    }
    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_stream() {
        let packets = vec![
            Packet::Config {
                codec: Codec::Hevc,
                resolution: Resolution::new(64, 48),
                min_buffers: 3,
            },
            Packet::Sei(SeiMessage {
                prefix: true,
                payload_type: 6,
                payload: vec![1, 2, 3],
            }),
            Packet::Frame {
                resolution: Resolution::new(64, 48),
                picture_type: PictureType::Idr,
                flags: FrameFlags::CONCEALED,
                data: vec![0xaa; 16],
            },
        ];
        let stream: Vec<u8> = packets.iter().flat_map(|p| p.encode()).collect();

        assert_eq!(parse(&stream).unwrap(), packets);
    }

    #[test]
    fn truncated_and_garbage() {
        let frame = Packet::Frame {
            resolution: Resolution::new(16, 16),
            picture_type: PictureType::P,
            flags: FrameFlags::empty(),
            data: vec![1; 8],
        }
        .encode();

        assert_eq!(
            parse(&frame[..frame.len() - 1]),
            Err(PacketError::Truncated(16))
        );
        assert_eq!(
            parse(b"ABCDEFGH"),
            Err(PacketError::UnknownTag(*b"ABCD", 0))
        );
        assert_eq!(parse(&[]), Ok(vec![]));
    }
}
