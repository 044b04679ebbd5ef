//! ZCL frame and attribute codec
//!
//! ZCL is little-endian on the wire. The only exception in this gateway is
//! the Tuya private cluster whose inner datapoint values are big-endian;
//! that quirk lives with the Tuya access functions, not here.

use crate::types::ProtocolError;

pub const ZCL_FC_PROFILE_COMMAND: u8 = 0x00;
pub const ZCL_FC_CLUSTER_COMMAND: u8 = 0x01;
pub const ZCL_FC_MANUFACTURER_SPECIFIC: u8 = 0x04;
pub const ZCL_FC_DIRECTION_SERVER_TO_CLIENT: u8 = 0x08;
pub const ZCL_FC_DISABLE_DEFAULT_RESPONSE: u8 = 0x10;

/// ZCL global (profile wide) command IDs
pub mod zcl_command {
    pub const READ_ATTRIBUTES: u8 = 0x00;
    pub const READ_ATTRIBUTES_RESPONSE: u8 = 0x01;
    pub const WRITE_ATTRIBUTES: u8 = 0x02;
    pub const WRITE_ATTRIBUTES_RESPONSE: u8 = 0x04;
    pub const CONFIGURE_REPORTING: u8 = 0x06;
    pub const REPORT_ATTRIBUTES: u8 = 0x0a;
    pub const DEFAULT_RESPONSE: u8 = 0x0b;
}

/// ZCL status codes
pub mod zcl_status {
    pub const SUCCESS: u8 = 0x00;
    pub const UNSUPPORTED_ATTRIBUTE: u8 = 0x86;
}

/// Common cluster IDs used by the core
pub mod clusters {
    pub const BASIC: u16 = 0x0000;
    pub const ON_OFF: u16 = 0x0006;
    pub const TIME: u16 = 0x000a;
    pub const OTAU: u16 = 0x0019;
    pub const IAS_ZONE: u16 = 0x0500;
    pub const IAS_ACE: u16 = 0x0501;
    pub const XIAOMI_LUMI: u16 = 0xfcc0;
    pub const TUYA: u16 = 0xef00;
}

/// Basic cluster attribute IDs
pub mod basic_attr {
    pub const MANUFACTURER_NAME: u16 = 0x0004;
    pub const MODEL_IDENTIFIER: u16 = 0x0005;
}

/// ZCL data type codes
pub mod data_type {
    pub const NO_DATA: u8 = 0x00;
    pub const DATA8: u8 = 0x08;
    pub const BOOLEAN: u8 = 0x10;
    pub const BITMAP8: u8 = 0x18;
    pub const BITMAP16: u8 = 0x19;
    pub const BITMAP24: u8 = 0x1a;
    pub const BITMAP32: u8 = 0x1b;
    pub const UINT8: u8 = 0x20;
    pub const UINT16: u8 = 0x21;
    pub const UINT24: u8 = 0x22;
    pub const UINT32: u8 = 0x23;
    pub const UINT40: u8 = 0x24;
    pub const UINT48: u8 = 0x25;
    pub const UINT56: u8 = 0x26;
    pub const UINT64: u8 = 0x27;
    pub const INT8: u8 = 0x28;
    pub const INT16: u8 = 0x29;
    pub const INT24: u8 = 0x2a;
    pub const INT32: u8 = 0x2b;
    pub const INT64: u8 = 0x2f;
    pub const ENUM8: u8 = 0x30;
    pub const ENUM16: u8 = 0x31;
    pub const FLOAT32: u8 = 0x39;
    pub const OCTET_STRING: u8 = 0x41;
    pub const CHARACTER_STRING: u8 = 0x42;
    pub const STRUCT: u8 = 0x4c;
    pub const UTC_TIME: u8 = 0xe2;
}

/// Bounds-checked little-endian reader over an ASDU slice.
#[derive(Debug, Clone, Copy)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    #[must_use]
    pub fn at_end(&self) -> bool {
        self.remaining() == 0
    }

    pub fn u8(&mut self) -> Result<u8, ProtocolError> {
        if self.remaining() < 1 {
            return Err(ProtocolError::FrameTooShort(self.data.len()));
        }
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    pub fn u16_le(&mut self) -> Result<u16, ProtocolError> {
        let lo = self.u8()?;
        let hi = self.u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    pub fn u16_be(&mut self) -> Result<u16, ProtocolError> {
        let hi = self.u8()?;
        let lo = self.u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    pub fn u32_be(&mut self) -> Result<u32, ProtocolError> {
        let hi = self.u16_be()?;
        let lo = self.u16_be()?;
        Ok((u32::from(hi) << 16) | u32::from(lo))
    }

    /// Unsigned little-endian integer of 1..=8 bytes.
    pub fn uint_le(&mut self, size: usize) -> Result<u64, ProtocolError> {
        debug_assert!(size >= 1 && size <= 8);
        let mut v: u64 = 0;
        for i in 0..size {
            v |= u64::from(self.u8()?) << (8 * i);
        }
        Ok(v)
    }

    pub fn u64_le(&mut self) -> Result<u64, ProtocolError> {
        self.uint_le(8)
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        if self.remaining() < len {
            return Err(ProtocolError::FrameTooShort(self.data.len()));
        }
        let v = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(v)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), ProtocolError> {
        self.bytes(len).map(|_| ())
    }
}

/// A decoded ZCL attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum ZclValue {
    None,
    Bool(bool),
    U64(u64),
    I64(i64),
    Real(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl ZclValue {
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ZclValue::Bool(b) => Some(i64::from(*b)),
            ZclValue::U64(v) => i64::try_from(*v).ok(),
            ZclValue::I64(v) => Some(*v),
            _ => None,
        }
    }
}

/// Returns the byte size of a fixed-width numeric data type and whether it
/// is signed. Strings and structs are not fixed width.
#[must_use]
pub fn numeric_type_info(dt: u8) -> Option<(usize, bool)> {
    use data_type as t;
    match dt {
        t::DATA8 | t::BOOLEAN | t::BITMAP8 | t::UINT8 | t::ENUM8 => Some((1, false)),
        t::BITMAP16 | t::UINT16 | t::ENUM16 => Some((2, false)),
        t::BITMAP24 | t::UINT24 => Some((3, false)),
        t::BITMAP32 | t::UINT32 | t::UTC_TIME => Some((4, false)),
        t::UINT40 => Some((5, false)),
        t::UINT48 => Some((6, false)),
        t::UINT56 => Some((7, false)),
        t::UINT64 => Some((8, false)),
        t::INT8 => Some((1, true)),
        t::INT16 => Some((2, true)),
        t::INT24 => Some((3, true)),
        t::INT32 => Some((4, true)),
        t::INT64 => Some((8, true)),
        _ => None,
    }
}

fn sign_extend(raw: u64, size: usize) -> i64 {
    let shift = 64 - (size * 8) as u32;
    ((raw << shift) as i64) >> shift
}

/// A single ZCL attribute as carried in read/report/write commands.
#[derive(Debug, Clone, PartialEq)]
pub struct ZclAttribute {
    pub id: u16,
    pub data_type: u8,
    pub value: ZclValue,
}

impl ZclAttribute {
    #[must_use]
    pub fn new(id: u16, data_type: u8) -> Self {
        Self { id, data_type, value: ZclValue::None }
    }

    /// Reads the attribute value per its data type from \p r.
    pub fn read_value(&mut self, r: &mut Reader) -> Result<(), ProtocolError> {
        use data_type as t;

        if let Some((size, signed)) = numeric_type_info(self.data_type) {
            let raw = r.uint_le(size)?;
            self.value = if self.data_type == t::BOOLEAN {
                ZclValue::Bool(raw != 0)
            } else if signed {
                ZclValue::I64(sign_extend(raw, size))
            } else {
                ZclValue::U64(raw)
            };
            return Ok(());
        }

        match self.data_type {
            t::NO_DATA => {
                self.value = ZclValue::None;
                Ok(())
            }
            t::FLOAT32 => {
                let raw = r.uint_le(4)? as u32;
                self.value = ZclValue::Real(f64::from(f32::from_bits(raw)));
                Ok(())
            }
            t::OCTET_STRING => {
                let len = r.u8()? as usize;
                self.value = ZclValue::Bytes(r.bytes(len)?.to_vec());
                Ok(())
            }
            t::CHARACTER_STRING => {
                let len = r.u8()? as usize;
                let raw = r.bytes(len)?;
                self.value = ZclValue::Str(String::from_utf8_lossy(raw).into_owned());
                Ok(())
            }
            dt => Err(ProtocolError::UnsupportedDataType(dt)),
        }
    }

    /// Serializes the attribute value per its data type (little-endian).
    pub fn write_value(&self, out: &mut Vec<u8>) -> Result<(), ProtocolError> {
        use data_type as t;

        if let Some((size, _)) = numeric_type_info(self.data_type) {
            let raw = match &self.value {
                ZclValue::Bool(b) => u64::from(*b),
                ZclValue::U64(v) => *v,
                ZclValue::I64(v) => *v as u64,
                _ => return Err(ProtocolError::InvalidFrame("non numeric value".into())),
            };
            out.extend_from_slice(&raw.to_le_bytes()[..size]);
            return Ok(());
        }

        match self.data_type {
            t::CHARACTER_STRING => {
                let s = match &self.value {
                    ZclValue::Str(s) => s.as_bytes(),
                    _ => return Err(ProtocolError::InvalidFrame("non string value".into())),
                };
                if s.len() > u8::MAX as usize {
                    return Err(ProtocolError::InvalidFrame("string too long".into()));
                }
                out.push(s.len() as u8);
                out.extend_from_slice(s);
                Ok(())
            }
            dt => Err(ProtocolError::UnsupportedDataType(dt)),
        }
    }
}

/// A ZCL frame: frame control, optional manufacturer code, sequence number,
/// command id and payload.
#[derive(Debug, Clone, Default)]
pub struct ZclFrame {
    pub frame_control: u8,
    pub manufacturer_code: u16,
    pub sequence_number: u8,
    pub command_id: u8,
    pub payload: Vec<u8>,
}

impl ZclFrame {
    /// Parse a ZCL frame from raw ASDU bytes.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(data);
        let frame_control = r.u8()?;

        let manufacturer_code = if frame_control & ZCL_FC_MANUFACTURER_SPECIFIC != 0 {
            r.u16_le()?
        } else {
            0
        };

        let sequence_number = r.u8()?;
        let command_id = r.u8()?;
        let payload = r.bytes(r.remaining())?.to_vec();

        Ok(Self { frame_control, manufacturer_code, sequence_number, command_id, payload })
    }

    /// Serialize to ASDU bytes.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + self.payload.len());
        data.push(self.frame_control);
        if self.frame_control & ZCL_FC_MANUFACTURER_SPECIFIC != 0 {
            data.extend_from_slice(&self.manufacturer_code.to_le_bytes());
        }
        data.push(self.sequence_number);
        data.push(self.command_id);
        data.extend_from_slice(&self.payload);
        data
    }

    #[must_use]
    pub fn is_cluster_command(&self) -> bool {
        self.frame_control & 0x03 == ZCL_FC_CLUSTER_COMMAND
    }

    #[must_use]
    pub fn is_profile_command(&self) -> bool {
        self.frame_control & 0x03 == ZCL_FC_PROFILE_COMMAND
    }

    #[must_use]
    pub fn is_default_response(&self) -> bool {
        self.is_profile_command() && self.command_id == zcl_command::DEFAULT_RESPONSE
    }

    #[must_use]
    pub fn disable_default_response(&self) -> bool {
        self.frame_control & ZCL_FC_DISABLE_DEFAULT_RESPONSE != 0
    }

    #[must_use]
    pub fn is_manufacturer_specific(&self) -> bool {
        self.frame_control & ZCL_FC_MANUFACTURER_SPECIFIC != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip_plain() {
        let frame = ZclFrame {
            frame_control: ZCL_FC_PROFILE_COMMAND | ZCL_FC_DISABLE_DEFAULT_RESPONSE,
            manufacturer_code: 0,
            sequence_number: 0x42,
            command_id: zcl_command::READ_ATTRIBUTES,
            payload: vec![0x04, 0x00],
        };

        let parsed = ZclFrame::parse(&frame.serialize()).unwrap();
        assert_eq!(parsed.sequence_number, 0x42);
        assert_eq!(parsed.command_id, zcl_command::READ_ATTRIBUTES);
        assert_eq!(parsed.manufacturer_code, 0);
        assert_eq!(parsed.payload, vec![0x04, 0x00]);
        assert!(parsed.disable_default_response());
    }

    #[test]
    fn frame_roundtrip_manufacturer_specific() {
        let frame = ZclFrame {
            frame_control: ZCL_FC_PROFILE_COMMAND | ZCL_FC_MANUFACTURER_SPECIFIC,
            manufacturer_code: 0x115f,
            sequence_number: 7,
            command_id: zcl_command::WRITE_ATTRIBUTES,
            payload: vec![],
        };

        let raw = frame.serialize();
        assert_eq!(raw[1..3], 0x115f_u16.to_le_bytes());
        let parsed = ZclFrame::parse(&raw).unwrap();
        assert_eq!(parsed.manufacturer_code, 0x115f);
        assert!(parsed.is_manufacturer_specific());
    }

    #[test]
    fn attribute_numeric_types() {
        // int16 temperature -12.5 C as centi-degrees
        let raw: Vec<u8> = (-1250_i16).to_le_bytes().to_vec();
        let mut attr = ZclAttribute::new(0x0000, data_type::INT16);
        attr.read_value(&mut Reader::new(&raw)).unwrap();
        assert_eq!(attr.value, ZclValue::I64(-1250));

        let mut attr = ZclAttribute::new(0x0000, data_type::BOOLEAN);
        attr.read_value(&mut Reader::new(&[0x01])).unwrap();
        assert_eq!(attr.value, ZclValue::Bool(true));

        let mut attr = ZclAttribute::new(0x0000, data_type::UINT48);
        attr.read_value(&mut Reader::new(&[1, 0, 0, 0, 0, 0])).unwrap();
        assert_eq!(attr.value, ZclValue::U64(1));
    }

    #[test]
    fn attribute_string() {
        let mut raw = vec![5u8];
        raw.extend_from_slice(b"lumi.");
        let mut attr = ZclAttribute::new(0x0005, data_type::CHARACTER_STRING);
        attr.read_value(&mut Reader::new(&raw)).unwrap();
        assert_eq!(attr.value, ZclValue::Str("lumi.".into()));
    }

    #[test]
    fn attribute_write_roundtrip() {
        let attr = ZclAttribute {
            id: 0xff0d,
            data_type: data_type::UINT8,
            value: ZclValue::U64(0x15),
        };
        let mut out = Vec::new();
        attr.write_value(&mut out).unwrap();
        assert_eq!(out, vec![0x15]);
    }

    #[test]
    fn truncated_frame_is_error() {
        assert!(ZclFrame::parse(&[0x00, 0x01]).is_err());
    }
}
