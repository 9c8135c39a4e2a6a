//! OpenRGB SDK wire protocol
//!
//! Every packet starts with a 16-byte header: the magic `ORGB`, then three
//! little-endian u32 fields (device index, packet id, payload size). Payloads
//! are little-endian; strings are a u16 length (including the trailing NUL)
//! followed by the bytes.

use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::color::Rgb;
use crate::error::ClientError;
use crate::{DeviceId, DeviceInfo, Zone};

pub const MAGIC: [u8; 4] = *b"ORGB";
pub const HEADER_LEN: usize = 16;
pub const DEFAULT_PORT: u16 = 6742;
/// Upper bound on a single payload; controller data for large matrices stays well below.
pub const MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Packet ids
pub mod packet {
    pub const REQUEST_CONTROLLER_COUNT: u32 = 0;
    pub const REQUEST_CONTROLLER_DATA: u32 = 1;
    pub const SET_CLIENT_NAME: u32 = 50;
    pub const DEVICE_LIST_UPDATED: u32 = 100;
    pub const UPDATE_LEDS: u32 = 1050;
    pub const UPDATE_ZONE_LEDS: u32 = 1051;
    pub const UPDATE_SINGLE_LED: u32 = 1052;
}

/// Packet header.
#[derive(Debug, Clone, Copy, IntoBytes, FromBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct PacketHeader {
    magic: [u8; 4],
    device: U32,
    id: U32,
    size: U32,
}

impl PacketHeader {
    pub fn new(device: DeviceId, id: u32, size: usize) -> Result<Self, ClientError> {
        let size = u32::try_from(size).map_err(|_| ClientError::Oversized(size))?;
        Ok(Self {
            magic: MAGIC,
            device: U32::new(device),
            id: U32::new(id),
            size: U32::new(size),
        })
    }

    /// Decode and validate a received header
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Result<Self, ClientError> {
        let header = Self::read_from_bytes(bytes).map_err(|_| ClientError::Truncated {
            needed: HEADER_LEN,
            offset: 0,
            len: bytes.len(),
        })?;
        if header.magic != MAGIC {
            return Err(ClientError::BadMagic(header.magic));
        }
        if header.size() > MAX_PAYLOAD {
            return Err(ClientError::Oversized(header.size()));
        }
        Ok(header)
    }

    pub fn device(&self) -> DeviceId {
        self.device.get()
    }

    pub fn id(&self) -> u32 {
        self.id.get()
    }

    pub fn size(&self) -> usize {
        self.size.get() as usize
    }
}

/// Header and payload as one buffer
pub fn encode_packet(device: DeviceId, id: u32, payload: &[u8]) -> Result<Vec<u8>, ClientError> {
    let header = PacketHeader::new(device, id, payload.len())?;
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(header.as_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn color_count(colors: &[Rgb]) -> Result<u16, ClientError> {
    u16::try_from(colors.len()).map_err(|_| ClientError::Oversized(colors.len()))
}

/// UPDATE_LEDS payload: data size, color count, colors
pub fn update_leds_payload(colors: &[Rgb]) -> Result<Vec<u8>, ClientError> {
    let count = color_count(colors)?;
    let size = 4 + 2 + colors.len() * 4;
    let mut buf = Vec::with_capacity(size);
    buf.extend_from_slice(&(size as u32).to_le_bytes());
    buf.extend_from_slice(&count.to_le_bytes());
    for c in colors {
        buf.extend_from_slice(&c.to_wire());
    }
    Ok(buf)
}

/// UPDATE_ZONE_LEDS payload: data size, zone index, color count, colors
pub fn update_zone_payload(zone: u32, colors: &[Rgb]) -> Result<Vec<u8>, ClientError> {
    let count = color_count(colors)?;
    let size = 4 + 4 + 2 + colors.len() * 4;
    let mut buf = Vec::with_capacity(size);
    buf.extend_from_slice(&(size as u32).to_le_bytes());
    buf.extend_from_slice(&zone.to_le_bytes());
    buf.extend_from_slice(&count.to_le_bytes());
    for c in colors {
        buf.extend_from_slice(&c.to_wire());
    }
    Ok(buf)
}

/// UPDATE_SINGLE_LED payload: LED index, color
pub fn update_single_led_payload(index: usize, color: Rgb) -> Result<Vec<u8>, ClientError> {
    let index = i32::try_from(index).map_err(|_| ClientError::Oversized(index))?;
    let mut buf = Vec::with_capacity(8);
    buf.extend_from_slice(&index.to_le_bytes());
    buf.extend_from_slice(&color.to_wire());
    Ok(buf)
}

/// SET_CLIENT_NAME payload: NUL-terminated name
pub fn client_name_payload(name: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(name.len() + 1);
    buf.extend_from_slice(name.as_bytes());
    buf.push(0);
    buf
}

/// Little-endian cursor over a payload
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ClientError> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.buf.len());
        let Some(end) = end else {
            return Err(ClientError::Truncated {
                needed: n,
                offset: self.pos,
                len: self.buf.len(),
            });
        };
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ClientError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16, ClientError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, ClientError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn skip(&mut self, n: usize) -> Result<(), ClientError> {
        self.take(n).map(|_| ())
    }

    fn string(&mut self) -> Result<String, ClientError> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        let text = bytes.strip_suffix(&[0]).unwrap_or(bytes);
        Ok(String::from_utf8_lossy(text).into_owned())
    }

    fn colors(&mut self) -> Result<Vec<Rgb>, ClientError> {
        let count = self.u16()?;
        (0..count).map(|_| Ok(Rgb::from_wire(self.array()?))).collect()
    }
}

/// Parse a REQUEST_CONTROLLER_COUNT reply
pub fn parse_controller_count(payload: &[u8]) -> Result<u32, ClientError> {
    Reader::new(payload).u32()
}

/// Parse a protocol-0 REQUEST_CONTROLLER_DATA reply
pub fn parse_controller_data(id: DeviceId, payload: &[u8]) -> Result<DeviceInfo, ClientError> {
    let mut r = Reader::new(payload);
    let _data_size = r.u32()?;
    let _device_type = r.u32()?;
    let name = r.string()?;
    for _ in 0..4 {
        // description, version, serial, location
        r.string()?;
    }

    let mode_count = r.u16()?;
    let _active_mode = r.u32()?;
    for _ in 0..mode_count {
        r.string()?;
        // value, flags, speed min/max, colors min/max, speed, direction, color mode
        r.skip(9 * 4)?;
        r.colors()?;
    }

    let zone_count = r.u16()?;
    let mut zones = Vec::with_capacity(zone_count as usize);
    let mut start = 0usize;
    for _ in 0..zone_count {
        let zone_name = r.string()?;
        let _zone_type = r.u32()?;
        let _leds_min = r.u32()?;
        let _leds_max = r.u32()?;
        let len = r.u32()? as usize;
        let matrix_len = r.u16()? as usize;
        r.skip(matrix_len)?;
        zones.push(Zone {
            name: zone_name,
            start,
            len,
        });
        start += len;
    }

    let led_count = r.u16()?;
    for _ in 0..led_count {
        r.string()?;
        r.u32()?;
    }

    let colors = r.colors()?;
    Ok(DeviceInfo {
        id,
        name,
        colors,
        zones,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Little-endian builder for synthetic controller data
    #[derive(Default)]
    pub(crate) struct Writer(pub Vec<u8>);

    impl Writer {
        pub fn u16(&mut self, v: u16) -> &mut Self {
            self.0.extend_from_slice(&v.to_le_bytes());
            self
        }
        pub fn u32(&mut self, v: u32) -> &mut Self {
            self.0.extend_from_slice(&v.to_le_bytes());
            self
        }
        pub fn string(&mut self, s: &str) -> &mut Self {
            self.u16(s.len() as u16 + 1);
            self.0.extend_from_slice(s.as_bytes());
            self.0.push(0);
            self
        }
        pub fn colors(&mut self, colors: &[Rgb]) -> &mut Self {
            self.u16(colors.len() as u16);
            for c in colors {
                self.0.extend_from_slice(&c.to_wire());
            }
            self
        }
    }

    /// One mode, two zones (3 + 2 LEDs), the second zone carrying a 1x2 matrix
    pub(crate) fn controller_blob(name: &str, colors: &[Rgb]) -> Vec<u8> {
        let mut w = Writer::default();
        w.u32(0).u32(2).string(name);
        for s in ["desc", "1.0", "SN1", "usb"] {
            w.string(s);
        }
        w.u16(1).u32(0).string("Direct");
        for _ in 0..9 {
            w.u32(0);
        }
        w.colors(&[]);

        w.u16(2);
        w.string("Top").u32(1).u32(3).u32(3).u32(3).u16(0);
        w.string("Bottom").u32(2).u32(2).u32(2).u32(2);
        w.u16(16).u32(1).u32(2).u32(0).u32(1);

        w.u16(colors.len() as u16);
        for i in 0..colors.len() {
            w.string(&format!("LED {i}")).u32(i as u32);
        }
        w.colors(colors);
        w.0
    }

    #[test]
    fn header_layout() {
        let packet = encode_packet(3, packet::UPDATE_LEDS, &[1, 2]).unwrap();
        assert_eq!(&packet[..4], b"ORGB");
        assert_eq!(&packet[4..8], &3u32.to_le_bytes());
        assert_eq!(&packet[8..12], &1050u32.to_le_bytes());
        assert_eq!(&packet[12..16], &2u32.to_le_bytes());

        let mut raw = [0u8; HEADER_LEN];
        raw.copy_from_slice(&packet[..HEADER_LEN]);
        let header = PacketHeader::decode(&raw).unwrap();
        assert_eq!((header.device(), header.id(), header.size()), (3, 1050, 2));
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut raw = [0u8; HEADER_LEN];
        raw[..4].copy_from_slice(b"NOPE");
        assert!(matches!(PacketHeader::decode(&raw), Err(ClientError::BadMagic(_))));
    }

    #[test]
    fn update_leds_payload_layout() {
        let payload = update_leds_payload(&[Rgb::new(1, 2, 3), Rgb::new(4, 5, 6)]).unwrap();
        assert_eq!(payload.len(), 14);
        assert_eq!(&payload[..4], &14u32.to_le_bytes());
        assert_eq!(&payload[4..6], &2u16.to_le_bytes());
        assert_eq!(&payload[6..], &[1, 2, 3, 0, 4, 5, 6, 0]);
    }

    #[test]
    fn zone_and_single_payloads() {
        let zone = update_zone_payload(1, &[Rgb::WHITE]).unwrap();
        assert_eq!(&zone[..4], &14u32.to_le_bytes());
        assert_eq!(&zone[4..8], &1u32.to_le_bytes());

        let single = update_single_led_payload(7, Rgb::new(9, 8, 7)).unwrap();
        assert_eq!(single, vec![7, 0, 0, 0, 9, 8, 7, 0]);
    }

    #[test]
    fn controller_data_parses_zones_and_colors() {
        let colors = vec![Rgb::new(10, 0, 0); 5];
        let info = parse_controller_data(4, &controller_blob("Strip", &colors)).unwrap();
        assert_eq!(info.id, 4);
        assert_eq!(info.name, "Strip");
        assert_eq!(info.colors, colors);
        assert_eq!(info.zones.len(), 2);
        assert_eq!((info.zones[1].start, info.zones[1].len), (3, 2));
    }

    #[test]
    fn controller_data_truncated() {
        let blob = controller_blob("Strip", &[Rgb::BLACK; 5]);
        assert!(matches!(
            parse_controller_data(0, &blob[..blob.len() - 3]),
            Err(ClientError::Truncated { .. })
        ));
    }
}
