//! Timestamp + SHA-256 verification for AUTH, DHCP and VMAC handshake
//! frames (§4.2). A frame proves knowledge of the domain password without
//! transmitting it: the client hashes the password together with the
//! frame's other fields, and the server recomputes the same hash.

use sha2::{Digest, Sha256};

use crate::error::RelayError;

/// Frames older or newer than this many seconds (server clock) are
/// rejected, to bound replay windows.
pub const MAX_CLOCK_SKEW_SECS: i64 = 30;

fn check_skew(now: i64, timestamp: i64) -> Result<(), RelayError> {
    if (now - timestamp).abs() > MAX_CLOCK_SKEW_SECS {
        return Err(RelayError::protocol("timestamp outside allowed clock skew"));
    }
    Ok(())
}

/// SHA-256( password ‖ BE32(ip) ‖ BE64(timestamp) )
pub fn check_auth(password: &[u8], ip: u32, timestamp: i64, reported: &[u8; 32], now: i64) -> Result<(), RelayError> {
    check_skew(now, timestamp)?;
    let mut hasher = Sha256::new();
    hasher.update(password);
    hasher.update(ip.to_be_bytes());
    hasher.update(timestamp.to_be_bytes());
    let computed = hasher.finalize();
    if computed.as_slice() != reported {
        return Err(RelayError::protocol("auth hash value does not match"));
    }
    Ok(())
}

/// SHA-256( password ‖ BE64(timestamp) )
pub fn check_dhcp(password: &[u8], timestamp: i64, reported: &[u8; 32], now: i64) -> Result<(), RelayError> {
    check_skew(now, timestamp)?;
    let mut hasher = Sha256::new();
    hasher.update(password);
    hasher.update(timestamp.to_be_bytes());
    let computed = hasher.finalize();
    if computed.as_slice() != reported {
        return Err(RelayError::protocol("dhcp hash value does not match"));
    }
    Ok(())
}

/// SHA-256( password ‖ vmac-ascii ‖ BE64(timestamp) )
pub fn check_vmac(password: &[u8], vmac: &str, timestamp: i64, reported: &[u8; 32], now: i64) -> Result<(), RelayError> {
    check_skew(now, timestamp)?;
    if vmac.len() != 16 || !vmac.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(RelayError::protocol("invalid vmac message value"));
    }
    let mut hasher = Sha256::new();
    hasher.update(password);
    hasher.update(vmac.as_bytes());
    hasher.update(timestamp.to_be_bytes());
    let computed = hasher.finalize();
    if computed.as_slice() != reported {
        return Err(RelayError::protocol("vmac hash value does not match"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha(parts: &[&[u8]]) -> [u8; 32] {
        let mut hasher = Sha256::new();
        for p in parts {
            hasher.update(p);
        }
        hasher.finalize().into()
    }

    #[test]
    fn auth_accepts_correct_hash() {
        let password = b"p";
        let ip = 0x0a000005u32;
        let ts = 1_000i64;
        let hash = sha(&[password, &ip.to_be_bytes(), &ts.to_be_bytes()]);
        assert!(check_auth(password, ip, ts, &hash, ts).is_ok());
    }

    #[test]
    fn auth_rejects_bitflip_in_password() {
        let ip = 0x0a000005u32;
        let ts = 1_000i64;
        let hash = sha(&[b"p", &ip.to_be_bytes(), &ts.to_be_bytes()]);
        assert!(check_auth(b"q", ip, ts, &hash, ts).is_err());
    }

    #[test]
    fn auth_rejects_bitflip_in_payload() {
        let password = b"p";
        let ip = 0x0a000005u32;
        let ts = 1_000i64;
        let mut hash = sha(&[password, &ip.to_be_bytes(), &ts.to_be_bytes()]);
        hash[0] ^= 0x01;
        assert!(check_auth(password, ip, ts, &hash, ts).is_err());
    }

    #[test]
    fn auth_rejects_skewed_timestamp() {
        let password = b"p";
        let ip = 0x0a000005u32;
        let ts = 1_000i64;
        let hash = sha(&[password, &ip.to_be_bytes(), &ts.to_be_bytes()]);
        assert!(check_auth(password, ip, ts, &hash, ts + 60).is_err());
    }

    #[test]
    fn vmac_rejects_non_hex() {
        let password = b"p";
        let ts = 1_000i64;
        let vmac = "zzzzzzzzzzzzzzzz";
        let hash = sha(&[password, vmac.as_bytes(), &ts.to_be_bytes()]);
        assert!(check_vmac(password, vmac, ts, &hash, ts).is_err());
    }

    #[test]
    fn vmac_accepts_valid_hex() {
        let password = b"p";
        let ts = 1_000i64;
        let vmac = "aaaaaaaaaaaaaaaa";
        let hash = sha(&[password, vmac.as_bytes(), &ts.to_be_bytes()]);
        assert!(check_vmac(password, vmac, ts, &hash, ts).is_ok());
    }

    #[test]
    fn dhcp_accepts_correct_hash() {
        let password = b"p";
        let ts = 1_000i64;
        let hash = sha(&[password, &ts.to_be_bytes()]);
        assert!(check_dhcp(password, ts, &hash, ts).is_ok());
    }
}
