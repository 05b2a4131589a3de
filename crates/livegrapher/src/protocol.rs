//! Wire format for the LiveGrapher streaming protocol.
//!
//! Every frame begins with a single header octet: the top two bits carry
//! the packet type, the bottom six carry a [`DatasetId`] (zero for frames
//! that don't need one). Multi-byte fields are big-endian. There is no
//! padding between fields anywhere in this module — structs are never
//! blitted onto the wire, every field is serialised by hand so that
//! in-memory alignment never leaks into the byte stream.

use crate::error::ProtocolError;

/// Number of distinct datasets a single engine can track (the id space is a
/// 6-bit field on the wire).
pub const MAX_DATASETS: usize = 64;

/// The arithmetically correct 6-bit mask for a [`DatasetId`].
pub const ID_MASK: u8 = 0x3F;

/// The mask the historical host implementation used by mistake (drops bit
/// 4, aliasing ids that differ only in that bit). Only ever used to shape
/// an *encoded* header when `legacy_id_mask_compat` is set; decoding always
/// uses [`ID_MASK`] since that's what's actually on the wire.
pub const LEGACY_ID_MASK: u8 = 0x2F;

const TYPE_SHIFT: u32 = 6;
const TYPE_MASK: u8 = 0b1100_0000;

const CLIENT_TYPE_SUBSCRIBE: u8 = 0b00;
const CLIENT_TYPE_UNSUBSCRIBE: u8 = 0b01;
const CLIENT_TYPE_LIST_REQUEST: u8 = 0b10;

const HOST_TYPE_DATA_POINT: u8 = 0b00;
const HOST_TYPE_CATALOG_ENTRY: u8 = 0b01;

/// `u64 time_ms` + `f32 value`, both big-endian, after the header byte.
pub const DATA_POINT_FRAME_LEN: usize = 1 + size_of::<u64>() + size_of::<f32>();

/// A 6-bit dataset identifier, in `[0, 64)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatasetId(u8);

impl DatasetId {
    /// Builds a `DatasetId`, rejecting anything that doesn't fit in 6 bits.
    pub const fn new(id: u8) -> Option<Self> {
        if id < MAX_DATASETS as u8 { Some(Self(id)) } else { None }
    }

    /// Extracts the id bits from a header byte. Always masks with
    /// [`ID_MASK`]: the id field is exactly 6 wide regardless of which mask
    /// a (possibly buggy) encoder used to set it.
    const fn from_header_byte(header: u8) -> Self {
        Self(header & ID_MASK)
    }

    #[inline]
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl From<DatasetId> for usize {
    fn from(id: DatasetId) -> Self {
        id.0 as usize
    }
}

/// Client-to-host control frames. Every variant is exactly one octet on the
/// wire: the header byte itself carries the whole frame, so decoding never
/// needs to wait for a payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientFrame {
    Subscribe(DatasetId),
    Unsubscribe(DatasetId),
    ListRequest,
}

impl ClientFrame {
    /// Decodes a single header byte into a control frame.
    ///
    /// # Errors
    /// Returns [`ProtocolError::BadType`] for the reserved `0b11` type.
    pub fn decode(header: u8) -> Result<Self, ProtocolError> {
        let id = DatasetId::from_header_byte(header);
        match (header & TYPE_MASK) >> TYPE_SHIFT {
            CLIENT_TYPE_SUBSCRIBE => Ok(Self::Subscribe(id)),
            CLIENT_TYPE_UNSUBSCRIBE => Ok(Self::Unsubscribe(id)),
            CLIENT_TYPE_LIST_REQUEST => Ok(Self::ListRequest),
            _ => Err(ProtocolError::BadType),
        }
    }

    /// Encodes the frame to its single header byte.
    ///
    /// `id_mask` selects [`ID_MASK`] or, for interop with a pre-existing
    /// buggy host, [`LEGACY_ID_MASK`] (see `EngineOptions::legacy_id_mask_compat`).
    pub fn encode(self, id_mask: u8) -> u8 {
        match self {
            Self::Subscribe(id) => header_byte(CLIENT_TYPE_SUBSCRIBE, id, id_mask),
            Self::Unsubscribe(id) => header_byte(CLIENT_TYPE_UNSUBSCRIBE, id, id_mask),
            Self::ListRequest => header_byte(CLIENT_TYPE_LIST_REQUEST, DatasetId(0), id_mask),
        }
    }
}

/// Host-to-client data/catalog frames.
#[derive(Clone, Debug, PartialEq)]
pub enum HostFrame<'a> {
    DataPoint { id: DatasetId, time_ms: u64, value: f32 },
    CatalogEntry { id: DatasetId, name: &'a str, is_last: bool },
}

impl<'a> HostFrame<'a> {
    /// Appends the encoded frame to `buf`.
    ///
    /// # Errors
    /// Returns [`ProtocolError::BadLength`] for a `CatalogEntry` whose name
    /// is empty or longer than 255 bytes.
    pub fn encode_into(&self, buf: &mut Vec<u8>, id_mask: u8) -> Result<(), ProtocolError> {
        match *self {
            Self::DataPoint { id, time_ms, value } => {
                buf.push(header_byte(HOST_TYPE_DATA_POINT, id, id_mask));
                buf.extend_from_slice(&time_ms.to_be_bytes());
                buf.extend_from_slice(&value.to_be_bytes());
            }
            Self::CatalogEntry { id, name, is_last } => {
                let name_len = name.len();
                if name_len == 0 || name_len > u8::MAX as usize {
                    return Err(ProtocolError::BadLength);
                }
                buf.push(header_byte(HOST_TYPE_CATALOG_ENTRY, id, id_mask));
                buf.push(name_len as u8);
                buf.extend_from_slice(name.as_bytes());
                buf.push(u8::from(is_last));
            }
        }
        Ok(())
    }

    /// Decodes one frame from the front of `bytes`, returning the frame and
    /// the number of bytes it consumed.
    ///
    /// # Errors
    /// [`ProtocolError::BadType`] for an unrecognised header type,
    /// [`ProtocolError::BadLength`] for a zero `name_len`, and
    /// [`ProtocolError::ShortRead`] if `bytes` doesn't yet hold a full frame
    /// (treat as "need more bytes", not fatal, unless the peer has hit EOF).
    pub fn decode(bytes: &'a [u8]) -> Result<(Self, usize), ProtocolError> {
        let &header = bytes.first().ok_or(ProtocolError::ShortRead)?;
        let id = DatasetId::from_header_byte(header);
        match (header & TYPE_MASK) >> TYPE_SHIFT {
            HOST_TYPE_DATA_POINT => {
                if bytes.len() < DATA_POINT_FRAME_LEN {
                    return Err(ProtocolError::ShortRead);
                }
                let time_ms = u64::from_be_bytes(bytes[1..9].try_into().unwrap());
                let value = f32::from_be_bytes(bytes[9..13].try_into().unwrap());
                Ok((Self::DataPoint { id, time_ms, value }, DATA_POINT_FRAME_LEN))
            }
            HOST_TYPE_CATALOG_ENTRY => {
                let &name_len = bytes.get(1).ok_or(ProtocolError::ShortRead)?;
                if name_len == 0 {
                    return Err(ProtocolError::BadLength);
                }
                let name_len = name_len as usize;
                let frame_len = 1 + 1 + name_len + 1;
                if bytes.len() < frame_len {
                    return Err(ProtocolError::ShortRead);
                }
                let name = std::str::from_utf8(&bytes[2..2 + name_len])
                    .map_err(|_| ProtocolError::BadLength)?;
                let is_last = bytes[2 + name_len] != 0;
                Ok((Self::CatalogEntry { id, name, is_last }, frame_len))
            }
            _ => Err(ProtocolError::BadType),
        }
    }
}

#[inline]
const fn header_byte(type_bits: u8, id: DatasetId, id_mask: u8) -> u8 {
    (type_bits << TYPE_SHIFT) | (id.get() & id_mask)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> DatasetId {
        DatasetId::new(n).unwrap()
    }

    #[test]
    fn client_frame_round_trip() {
        for frame in [
            ClientFrame::Subscribe(id(0)),
            ClientFrame::Subscribe(id(63)),
            ClientFrame::Unsubscribe(id(2)),
            ClientFrame::ListRequest,
        ] {
            let byte = frame.encode(ID_MASK);
            assert_eq!(ClientFrame::decode(byte).unwrap(), frame);
        }
    }

    #[test]
    fn client_frame_rejects_reserved_type() {
        assert_eq!(ClientFrame::decode(0xC0), Err(ProtocolError::BadType));
    }

    #[test]
    fn canonical_header_bytes() {
        // Anchored to the unsubscribe/list-request literals, which are
        // internally consistent across the scenario examples.
        assert_eq!(ClientFrame::decode(0x00), Ok(ClientFrame::Subscribe(id(0))));
        assert_eq!(ClientFrame::decode(0x42), Ok(ClientFrame::Unsubscribe(id(2))));
        assert_eq!(ClientFrame::decode(0x80), Ok(ClientFrame::ListRequest));
    }

    #[test]
    fn data_point_round_trip() {
        let frame = HostFrame::DataPoint { id: id(0), time_ms: 1000, value: 1.5 };
        let mut buf = Vec::new();
        frame.encode_into(&mut buf, ID_MASK).unwrap();
        assert_eq!(buf.len(), DATA_POINT_FRAME_LEN);
        assert_eq!(buf[0], 0x00);
        assert_eq!(&buf[1..9], 1000u64.to_be_bytes());
        assert_eq!(&buf[9..13], 0x3FC00000u32.to_be_bytes());
        let (decoded, consumed) = HostFrame::decode(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn catalog_entry_round_trip() {
        let frame = HostFrame::CatalogEntry { id: id(0), name: "foo", is_last: true };
        let mut buf = Vec::new();
        frame.encode_into(&mut buf, ID_MASK).unwrap();
        assert_eq!(buf, vec![0x40, 3, b'f', b'o', b'o', 1]);
        let (decoded, consumed) = HostFrame::decode(&buf).unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn catalog_entry_rejects_empty_name() {
        let frame = HostFrame::CatalogEntry { id: id(0), name: "", is_last: true };
        let mut buf = Vec::new();
        assert_eq!(frame.encode_into(&mut buf, ID_MASK), Err(ProtocolError::BadLength));
    }

    #[test]
    fn decode_reports_short_read_not_eof() {
        let mut buf = Vec::new();
        HostFrame::DataPoint { id: id(0), time_ms: 1, value: 1.0 }
            .encode_into(&mut buf, ID_MASK)
            .unwrap();
        for cut in 0..buf.len() {
            assert_eq!(HostFrame::decode(&buf[..cut]), Err(ProtocolError::ShortRead));
        }
    }

    #[test]
    fn legacy_mask_aliases_bit_four() {
        // Ids 16 and 0 differ only in bit 4 (0x10), which 0x2F zeroes out.
        let with_legacy = header_byte(HOST_TYPE_DATA_POINT, id(16), LEGACY_ID_MASK);
        let zero = header_byte(HOST_TYPE_DATA_POINT, id(0), LEGACY_ID_MASK);
        assert_eq!(with_legacy, zero);
    }
}
