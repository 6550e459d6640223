//! Exec header (SPH) wire codec.
//!
//! Every exec frame starts with a fixed-size preamble followed by
//! `event_size` bytes of event name and `data_size` bytes of opaque payload.
//! The layout is ABI-fixed, all integers little-endian, and must round-trip
//! unchanged between nodes.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Size of the originating node/transaction id.
pub const ID_SIZE: usize = 64;
/// Size of a serialized node address.
pub const ADDR_SIZE: usize = 32;
/// Fixed preamble size: sizes, flags, src_key, src id, address.
pub const SPH_SIZE: usize = 8 + 8 + 4 + 4 + ID_SIZE + ADDR_SIZE;

/// Flag bits carried in the exec header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SphFlags(u32);

impl SphFlags {
    /// Client expects a correlated reply stream.
    pub const SRC_BLOCK: u32 = 1 << 0;
    /// Frame carries worker output being fanned back.
    pub const REPLY: u32 = 1 << 1;
    /// Terminal reply frame.
    pub const FINISH: u32 = 1 << 2;

    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn src_block(self) -> bool {
        self.0 & Self::SRC_BLOCK != 0
    }

    pub const fn reply(self) -> bool {
        self.0 & Self::REPLY != 0
    }

    pub const fn finish(self) -> bool {
        self.0 & Self::FINISH != 0
    }

    pub const fn is_reply_or_finish(self) -> bool {
        self.0 & (Self::REPLY | Self::FINISH) != 0
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SphError {
    #[error("frame truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("frame extents out of bounds: event {event_size} + data {data_size} in {frame} bytes")]
    BadExtent {
        event_size: u64,
        data_size: u64,
        frame: usize,
    },

    #[error("event name is not valid utf-8")]
    EventNotUtf8,

    #[error("invalid event name {event:?}: must be application@method")]
    MissingMethod { event: String },
}

/// The exec header. Field order matches the wire layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sph {
    pub data_size: u64,
    pub event_size: u64,
    pub flags: SphFlags,
    pub src_key: i32,
    pub src: [u8; ID_SIZE],
    pub addr: [u8; ADDR_SIZE],
}

impl Sph {
    pub fn zeroed() -> Self {
        Self {
            data_size: 0,
            event_size: 0,
            flags: SphFlags::default(),
            src_key: 0,
            src: [0; ID_SIZE],
            addr: [0; ADDR_SIZE],
        }
    }

    /// Combined length of the event name and payload that follow the header.
    pub fn total_size(&self) -> u64 {
        self.event_size + self.data_size
    }

    pub fn decode(buf: &[u8]) -> Result<Self, SphError> {
        if buf.len() < SPH_SIZE {
            return Err(SphError::Truncated {
                need: SPH_SIZE,
                got: buf.len(),
            });
        }

        let data_size = read_u64(&buf[0..8]);
        let event_size = read_u64(&buf[8..16]);
        let flags = SphFlags::new(read_u32(&buf[16..20]));
        let src_key = read_u32(&buf[20..24]) as i32;

        let mut src = [0u8; ID_SIZE];
        src.copy_from_slice(&buf[24..24 + ID_SIZE]);
        let mut addr = [0u8; ADDR_SIZE];
        addr.copy_from_slice(&buf[24 + ID_SIZE..SPH_SIZE]);

        Ok(Self {
            data_size,
            event_size,
            flags,
            src_key,
            src,
            addr,
        })
    }

    pub fn encode_into(&self, out: &mut BytesMut) {
        out.reserve(SPH_SIZE);
        out.put_u64_le(self.data_size);
        out.put_u64_le(self.event_size);
        out.put_u32_le(self.flags.bits());
        out.put_u32_le(self.src_key as u32);
        out.put_slice(&self.src);
        out.put_slice(&self.addr);
    }
}

/// One parsed exec frame: header, event name, opaque payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecFrame {
    pub sph: Sph,
    pub event: String,
    pub data: Bytes,
}

impl ExecFrame {
    pub fn parse(raw: &[u8]) -> Result<Self, SphError> {
        let sph = Sph::decode(raw)?;

        let extent_err = SphError::BadExtent {
            event_size: sph.event_size,
            data_size: sph.data_size,
            frame: raw.len(),
        };
        let need = (SPH_SIZE as u64)
            .checked_add(sph.event_size)
            .and_then(|n| n.checked_add(sph.data_size))
            .ok_or_else(|| extent_err.clone())?;
        if need > raw.len() as u64 {
            return Err(extent_err);
        }

        let event_end = SPH_SIZE + sph.event_size as usize;
        let data_end = event_end + sph.data_size as usize;

        let event = std::str::from_utf8(&raw[SPH_SIZE..event_end])
            .map_err(|_| SphError::EventNotUtf8)?
            .to_string();
        let data = Bytes::copy_from_slice(&raw[event_end..data_end]);

        Ok(Self { sph, event, data })
    }

    /// Re-synthesise `SPH || event || data` with the header sizes patched to
    /// the actual lengths.
    pub fn encode(&self) -> Bytes {
        let mut sph = self.sph;
        sph.event_size = self.event.len() as u64;
        sph.data_size = self.data.len() as u64;

        let mut out = BytesMut::with_capacity(SPH_SIZE + self.event.len() + self.data.len());
        sph.encode_into(&mut out);
        out.put_slice(self.event.as_bytes());
        out.put_slice(&self.data);
        out.freeze()
    }
}

/// Split an event name at the `@` separator into `(application, method)`.
pub fn split_event(event: &str) -> Result<(&str, &str), SphError> {
    event.split_once('@').ok_or_else(|| SphError::MissingMethod {
        event: event.to_string(),
    })
}

/// Truncated hex dump of an id for log context.
pub fn short_id(id: &[u8]) -> String {
    let mut out = String::with_capacity(12);
    for byte in id.iter().take(6) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn read_u64(buf: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    u64::from_le_bytes(bytes)
}

fn read_u32(buf: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[..4]);
    u32::from_le_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_frame() -> ExecFrame {
        let mut sph = Sph::zeroed();
        sph.flags = SphFlags::new(SphFlags::SRC_BLOCK);
        sph.src_key = -1;
        sph.src = [7u8; ID_SIZE];
        sph.addr = [9u8; ADDR_SIZE];
        ExecFrame {
            sph,
            event: "calc@square".to_string(),
            data: Bytes::from_static(b"{\"x\":3}"),
        }
    }

    #[test]
    fn frame_roundtrip() {
        let frame = sample_frame();
        let raw = frame.encode();
        assert_eq!(raw.len(), SPH_SIZE + 11 + 7);

        let parsed = ExecFrame::parse(&raw).unwrap();
        assert_eq!(parsed.event, "calc@square");
        assert_eq!(parsed.data.as_ref(), b"{\"x\":3}");
        assert_eq!(parsed.sph.event_size, 11);
        assert_eq!(parsed.sph.data_size, 7);
        assert_eq!(parsed.sph.src_key, -1);
        assert_eq!(parsed.sph.src, [7u8; ID_SIZE]);
    }

    #[test]
    fn truncated_header_is_rejected() {
        let raw = sample_frame().encode();
        let err = ExecFrame::parse(&raw[..SPH_SIZE - 1]).unwrap_err();
        assert!(matches!(err, SphError::Truncated { .. }));
    }

    #[test]
    fn lying_extents_are_rejected() {
        let frame = sample_frame();
        let mut raw = frame.encode().to_vec();
        // Claim more payload than the frame carries.
        raw[0..8].copy_from_slice(&u64::MAX.to_le_bytes());
        let err = ExecFrame::parse(&raw).unwrap_err();
        assert!(matches!(err, SphError::BadExtent { .. }));
    }

    #[test]
    fn non_utf8_event_is_rejected() {
        let frame = sample_frame();
        let mut raw = frame.encode().to_vec();
        raw[SPH_SIZE] = 0xff;
        raw[SPH_SIZE + 1] = 0xfe;
        assert_eq!(ExecFrame::parse(&raw).unwrap_err(), SphError::EventNotUtf8);
    }

    #[test]
    fn event_split() {
        assert_eq!(split_event("calc@square").unwrap(), ("calc", "square"));
        assert_eq!(split_event("a@").unwrap(), ("a", ""));
        assert!(matches!(
            split_event("noatsign").unwrap_err(),
            SphError::MissingMethod { .. }
        ));
    }

    #[test]
    fn flag_bits() {
        let flags = SphFlags::new(SphFlags::REPLY | SphFlags::FINISH);
        assert!(flags.reply());
        assert!(flags.finish());
        assert!(flags.is_reply_or_finish());
        assert!(!flags.src_block());
        assert!(SphFlags::new(SphFlags::SRC_BLOCK).src_block());
    }

    #[test]
    fn short_id_truncates() {
        let id = [0xabu8; ID_SIZE];
        assert_eq!(short_id(&id), "abababababab");
        assert_eq!(short_id(&[0x01, 0x02]), "0102");
    }

    proptest! {
        #[test]
        fn header_roundtrips_for_any_fields(
            flags in 0u32..8,
            src_key in any::<i32>(),
            src_byte in any::<u8>(),
            addr_byte in any::<u8>(),
            data in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let mut sph = Sph::zeroed();
            sph.flags = SphFlags::new(flags);
            sph.src_key = src_key;
            sph.src = [src_byte; ID_SIZE];
            sph.addr = [addr_byte; ADDR_SIZE];

            let frame = ExecFrame {
                sph,
                event: "app@method".to_string(),
                data: Bytes::from(data.clone()),
            };
            let parsed = ExecFrame::parse(&frame.encode()).unwrap();
            prop_assert_eq!(parsed.sph.flags.bits(), flags);
            prop_assert_eq!(parsed.sph.src_key, src_key);
            prop_assert_eq!(parsed.data.as_ref(), &data[..]);
        }
    }
}
