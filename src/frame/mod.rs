//! The seven fixed-layout binary frames exchanged between a client and the
//! relay, and their big-endian wire encoding.
//!
//! Every multi-byte integer is big-endian. Strings in fixed-width slots are
//! NUL-padded. Payload bytes (FORWARD, GENERAL) are opaque to the codec —
//! they are carried along but never interpreted.
//!
//! Unknown tag bytes are not a decode error: [`Frame::decode`] returns
//! `Ok(None)` for them, matching the "silently ignore unknown Type" rule.
//! A *recognized* tag with a too-short buffer is a decode error (a protocol
//! violation, not silent).

use crate::error::RelayError;

pub const TAG_AUTH: u8 = 0;
pub const TAG_FORWARD: u8 = 1;
pub const TAG_DHCP: u8 = 2;
pub const TAG_PEER: u8 = 3;
pub const TAG_VMAC: u8 = 4;
pub const TAG_DISCOVERY: u8 = 5;
pub const TAG_GENERAL: u8 = 255;

const CIDR_FIELD_LEN: usize = 32;
const VMAC_FIELD_LEN: usize = 16;
const HASH_LEN: usize = 32;

fn require_len(buf: &[u8], len: usize, what: &str) -> Result<(), RelayError> {
    if buf.len() < len {
        Err(RelayError::protocol(format!(
            "{what} frame too short: got {} bytes, need at least {len}",
            buf.len()
        )))
    } else {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthFrame {
    pub ip: u32,
    pub timestamp: i64,
    pub hash: [u8; HASH_LEN],
}

impl AuthFrame {
    pub const LEN: usize = 1 + 4 + 8 + HASH_LEN;

    pub fn decode(buf: &[u8]) -> Result<Self, RelayError> {
        require_len(buf, Self::LEN, "AUTH")?;
        let ip = u32::from_be_bytes(buf[1..5].try_into().unwrap());
        let timestamp = i64::from_be_bytes(buf[5..13].try_into().unwrap());
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&buf[13..13 + HASH_LEN]);
        Ok(Self { ip, timestamp, hash })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.push(TAG_AUTH);
        out.extend_from_slice(&self.ip.to_be_bytes());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.hash);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardFrame {
    pub src: u32,
    pub dst: u32,
    pub payload: Vec<u8>,
}

impl ForwardFrame {
    pub const HEADER_LEN: usize = 1 + 12 + 4 + 4;

    pub fn decode(buf: &[u8]) -> Result<Self, RelayError> {
        require_len(buf, Self::HEADER_LEN, "FORWARD")?;
        let src = u32::from_be_bytes(buf[13..17].try_into().unwrap());
        let dst = u32::from_be_bytes(buf[17..21].try_into().unwrap());
        let payload = buf[Self::HEADER_LEN..].to_vec();
        Ok(Self { src, dst, payload })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_LEN + self.payload.len());
        out.push(TAG_FORWARD);
        out.extend_from_slice(&[0u8; 12]);
        out.extend_from_slice(&self.src.to_be_bytes());
        out.extend_from_slice(&self.dst.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpFrame {
    pub timestamp: i64,
    /// NUL-padded 32-byte textual CIDR, stored as the raw field (callers
    /// trim at the first NUL to recover the string).
    pub cidr: [u8; CIDR_FIELD_LEN],
    pub hash: [u8; HASH_LEN],
}

impl DhcpFrame {
    pub const LEN: usize = 1 + 8 + CIDR_FIELD_LEN + HASH_LEN;

    pub fn decode(buf: &[u8]) -> Result<Self, RelayError> {
        require_len(buf, Self::LEN, "DHCP")?;
        let timestamp = i64::from_be_bytes(buf[1..9].try_into().unwrap());
        let mut cidr = [0u8; CIDR_FIELD_LEN];
        cidr.copy_from_slice(&buf[9..9 + CIDR_FIELD_LEN]);
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&buf[9 + CIDR_FIELD_LEN..9 + CIDR_FIELD_LEN + HASH_LEN]);
        Ok(Self { timestamp, cidr, hash })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.push(TAG_DHCP);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.cidr);
        out.extend_from_slice(&self.hash);
        out
    }

    pub fn cidr_str(&self) -> &str {
        let end = self.cidr.iter().position(|&b| b == 0).unwrap_or(self.cidr.len());
        std::str::from_utf8(&self.cidr[..end]).unwrap_or("")
    }

    /// Build the NUL-padded field from a textual CIDR, truncating silently
    /// if it doesn't fit (never produced by the server for valid input).
    pub fn cidr_field(s: &str) -> [u8; CIDR_FIELD_LEN] {
        let mut field = [0u8; CIDR_FIELD_LEN];
        let bytes = s.as_bytes();
        let n = bytes.len().min(CIDR_FIELD_LEN);
        field[..n].copy_from_slice(&bytes[..n]);
        field
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFrame {
    pub src: u32,
    pub dst: u32,
    pub ip_hint: u32,
    pub port_hint: u16,
}

impl PeerFrame {
    pub const LEN: usize = 1 + 4 + 4 + 4 + 2;

    pub fn decode(buf: &[u8]) -> Result<Self, RelayError> {
        require_len(buf, Self::LEN, "PEER")?;
        let src = u32::from_be_bytes(buf[1..5].try_into().unwrap());
        let dst = u32::from_be_bytes(buf[5..9].try_into().unwrap());
        let ip_hint = u32::from_be_bytes(buf[9..13].try_into().unwrap());
        let port_hint = u16::from_be_bytes(buf[13..15].try_into().unwrap());
        Ok(Self { src, dst, ip_hint, port_hint })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.push(TAG_PEER);
        out.extend_from_slice(&self.src.to_be_bytes());
        out.extend_from_slice(&self.dst.to_be_bytes());
        out.extend_from_slice(&self.ip_hint.to_be_bytes());
        out.extend_from_slice(&self.port_hint.to_be_bytes());
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VMacFrame {
    pub vmac: [u8; VMAC_FIELD_LEN],
    pub timestamp: i64,
    pub hash: [u8; HASH_LEN],
}

impl VMacFrame {
    pub const LEN: usize = 1 + VMAC_FIELD_LEN + 8 + HASH_LEN;

    pub fn decode(buf: &[u8]) -> Result<Self, RelayError> {
        require_len(buf, Self::LEN, "VMAC")?;
        let mut vmac = [0u8; VMAC_FIELD_LEN];
        vmac.copy_from_slice(&buf[1..1 + VMAC_FIELD_LEN]);
        let off = 1 + VMAC_FIELD_LEN;
        let timestamp = i64::from_be_bytes(buf[off..off + 8].try_into().unwrap());
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&buf[off + 8..off + 8 + HASH_LEN]);
        Ok(Self { vmac, timestamp, hash })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.push(TAG_VMAC);
        out.extend_from_slice(&self.vmac);
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.hash);
        out
    }

    pub fn vmac_str(&self) -> Result<&str, RelayError> {
        std::str::from_utf8(&self.vmac).map_err(|_| RelayError::protocol("vmac is not valid utf-8"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryFrame {
    pub src: u32,
    pub dst: u32,
}

impl DiscoveryFrame {
    pub const LEN: usize = 1 + 4 + 4;

    pub fn decode(buf: &[u8]) -> Result<Self, RelayError> {
        require_len(buf, Self::LEN, "DISCOVERY")?;
        let src = u32::from_be_bytes(buf[1..5].try_into().unwrap());
        let dst = u32::from_be_bytes(buf[5..9].try_into().unwrap());
        Ok(Self { src, dst })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.push(TAG_DISCOVERY);
        out.extend_from_slice(&self.src.to_be_bytes());
        out.extend_from_slice(&self.dst.to_be_bytes());
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneralFrame {
    pub subtype: u8,
    pub extra: u16,
    pub src: u32,
    pub dst: u32,
    pub payload: Vec<u8>,
}

impl GeneralFrame {
    pub const HEADER_LEN: usize = 1 + 1 + 2 + 4 + 4;

    pub fn decode(buf: &[u8]) -> Result<Self, RelayError> {
        require_len(buf, Self::HEADER_LEN, "GENERAL")?;
        let subtype = buf[1];
        let extra = u16::from_be_bytes(buf[2..4].try_into().unwrap());
        let src = u32::from_be_bytes(buf[4..8].try_into().unwrap());
        let dst = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let payload = buf[Self::HEADER_LEN..].to_vec();
        Ok(Self { subtype, extra, src, dst, payload })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::HEADER_LEN + self.payload.len());
        out.push(TAG_GENERAL);
        out.push(self.subtype);
        out.extend_from_slice(&self.extra.to_be_bytes());
        out.extend_from_slice(&self.src.to_be_bytes());
        out.extend_from_slice(&self.dst.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Dispatch key for the reader loop: which handler a frame belongs to. Not
/// a parsed frame itself — just enough to route `buf` to the right decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    Auth,
    Forward,
    Dhcp,
    Peer,
    VMac,
    Discovery,
    General,
}

impl FrameTag {
    /// Returns `None` for an unrecognized tag byte — the caller should
    /// silently drop the frame rather than error.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            TAG_AUTH => Some(Self::Auth),
            TAG_FORWARD => Some(Self::Forward),
            TAG_DHCP => Some(Self::Dhcp),
            TAG_PEER => Some(Self::Peer),
            TAG_VMAC => Some(Self::VMac),
            TAG_DISCOVERY => Some(Self::Discovery),
            TAG_GENERAL => Some(Self::General),
            _ => None,
        }
    }
}

pub fn tag_of(buf: &[u8]) -> Option<FrameTag> {
    buf.first().copied().and_then(FrameTag::from_byte)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_round_trip() {
        let f = AuthFrame { ip: 0x0a000005, timestamp: 1_700_000_000, hash: [7u8; 32] };
        let decoded = AuthFrame::decode(&f.encode()).unwrap();
        assert_eq!(f, decoded);
    }

    #[test]
    fn forward_round_trip() {
        let f = ForwardFrame { src: 1, dst: 2, payload: vec![1, 2, 3, 4, 5] };
        let decoded = ForwardFrame::decode(&f.encode()).unwrap();
        assert_eq!(f, decoded);
    }

    #[test]
    fn dhcp_round_trip() {
        let f = DhcpFrame {
            timestamp: 42,
            cidr: DhcpFrame::cidr_field("10.0.0.5/24"),
            hash: [9u8; 32],
        };
        let decoded = DhcpFrame::decode(&f.encode()).unwrap();
        assert_eq!(f, decoded);
        assert_eq!(decoded.cidr_str(), "10.0.0.5/24");
    }

    #[test]
    fn peer_round_trip() {
        let f = PeerFrame { src: 1, dst: 2, ip_hint: 3, port_hint: 4444 };
        let decoded = PeerFrame::decode(&f.encode()).unwrap();
        assert_eq!(f, decoded);
    }

    #[test]
    fn vmac_round_trip() {
        let mut vmac = [0u8; 16];
        vmac.copy_from_slice(b"aaaaaaaaaaaaaaaa");
        let f = VMacFrame { vmac, timestamp: 123, hash: [1u8; 32] };
        let decoded = VMacFrame::decode(&f.encode()).unwrap();
        assert_eq!(f, decoded);
        assert_eq!(decoded.vmac_str().unwrap(), "aaaaaaaaaaaaaaaa");
    }

    #[test]
    fn discovery_round_trip() {
        let f = DiscoveryFrame { src: 10, dst: 20 };
        let decoded = DiscoveryFrame::decode(&f.encode()).unwrap();
        assert_eq!(f, decoded);
    }

    #[test]
    fn general_round_trip() {
        let f = GeneralFrame { subtype: 3, extra: 9, src: 1, dst: 2, payload: vec![0xaa, 0xbb] };
        let decoded = GeneralFrame::decode(&f.encode()).unwrap();
        assert_eq!(f, decoded);
    }

    #[test]
    fn unknown_tag_is_ignored_not_errored() {
        assert_eq!(tag_of(&[0xaau8, 1, 2, 3]), None);
    }

    #[test]
    fn truncated_known_tag_is_a_decode_error() {
        assert!(AuthFrame::decode(&[TAG_AUTH, 1, 2]).is_err());
    }
}
