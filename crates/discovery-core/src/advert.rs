//! Short-range radio advertisement codec.
//!
//! The byte layout is fixed by the interoperating protocol and must stay
//! compatible with unmodified remote peers:
//!
//! ```text
//! offset  size  field
//! 0       2     magic (0xA1 0x5F)
//! 2       1     version (currently 1)
//! 3       8     identity fingerprint (first 8 bytes of the pubkey hash)
//! 11      2     service discriminator, big-endian
//! 13      n     display name, UTF-8, at most 20 bytes
//! ```

use thiserror::Error;

pub const ADVERT_MAGIC: [u8; 2] = [0xA1, 0x5F];
pub const ADVERT_VERSION: u8 = 1;
pub const FINGERPRINT_LEN: usize = 8;
pub const MAX_NAME_LEN: usize = 20;

const HEADER_LEN: usize = 2 + 1 + FINGERPRINT_LEN + 2;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AdvertError {
    #[error("advertisement too short: {0} bytes")]
    TooShort(usize),
    #[error("bad magic")]
    BadMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),
    #[error("display name is not valid UTF-8")]
    BadName,
    #[error("display name longer than {MAX_NAME_LEN} bytes")]
    NameTooLong,
}

/// A decoded short-range advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub fingerprint: [u8; FINGERPRINT_LEN],
    pub discriminator: u16,
    pub display_name: String,
}

impl Advertisement {
    pub fn new(
        fingerprint: [u8; FINGERPRINT_LEN],
        discriminator: u16,
        display_name: &str,
    ) -> Result<Self, AdvertError> {
        if display_name.len() > MAX_NAME_LEN {
            return Err(AdvertError::NameTooLong);
        }
        Ok(Self {
            fingerprint,
            discriminator,
            display_name: display_name.to_string(),
        })
    }

    /// Short hex form of the fingerprint, used as the peer id.
    pub fn peer_id(&self) -> String {
        hex::encode(self.fingerprint)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.display_name.len());
        out.extend_from_slice(&ADVERT_MAGIC);
        out.push(ADVERT_VERSION);
        out.extend_from_slice(&self.fingerprint);
        out.extend_from_slice(&self.discriminator.to_be_bytes());
        out.extend_from_slice(self.display_name.as_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, AdvertError> {
        if bytes.len() < HEADER_LEN {
            return Err(AdvertError::TooShort(bytes.len()));
        }
        if bytes[..2] != ADVERT_MAGIC {
            return Err(AdvertError::BadMagic);
        }
        if bytes[2] != ADVERT_VERSION {
            return Err(AdvertError::UnsupportedVersion(bytes[2]));
        }
        let mut fingerprint = [0u8; FINGERPRINT_LEN];
        fingerprint.copy_from_slice(&bytes[3..3 + FINGERPRINT_LEN]);
        let discriminator = u16::from_be_bytes([bytes[11], bytes[12]]);
        let name_bytes = &bytes[HEADER_LEN..];
        if name_bytes.len() > MAX_NAME_LEN {
            return Err(AdvertError::NameTooLong);
        }
        let display_name = std::str::from_utf8(name_bytes)
            .map_err(|_| AdvertError::BadName)?
            .to_string();
        Ok(Self {
            fingerprint,
            discriminator,
            display_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Advertisement {
        Advertisement::new([7u8; FINGERPRINT_LEN], 0x0a1f, "living-room").unwrap()
    }

    #[test]
    fn encode_decode_roundtrip() {
        let adv = sample();
        let decoded = Advertisement::decode(&adv.encode()).unwrap();
        assert_eq!(adv, decoded);
    }

    #[test]
    fn rejects_truncated_payload() {
        let mut bytes = sample().encode();
        bytes.truncate(5);
        assert!(matches!(
            Advertisement::decode(&bytes),
            Err(AdvertError::TooShort(5))
        ));
    }

    #[test]
    fn rejects_wrong_magic() {
        let mut bytes = sample().encode();
        bytes[0] = 0x00;
        assert_eq!(Advertisement::decode(&bytes), Err(AdvertError::BadMagic));
    }

    #[test]
    fn rejects_future_version() {
        let mut bytes = sample().encode();
        bytes[2] = 9;
        assert_eq!(
            Advertisement::decode(&bytes),
            Err(AdvertError::UnsupportedVersion(9))
        );
    }

    #[test]
    fn rejects_invalid_utf8_name() {
        let mut bytes = sample().encode();
        bytes.truncate(HEADER_LEN);
        bytes.extend_from_slice(&[0xff, 0xfe]);
        assert_eq!(Advertisement::decode(&bytes), Err(AdvertError::BadName));
    }

    #[test]
    fn rejects_oversized_name() {
        let err = Advertisement::new([0u8; FINGERPRINT_LEN], 1, "x".repeat(21).as_str());
        assert_eq!(err.unwrap_err(), AdvertError::NameTooLong);
    }

    #[test]
    fn empty_name_is_valid() {
        let adv = Advertisement::new([1u8; FINGERPRINT_LEN], 2, "").unwrap();
        let decoded = Advertisement::decode(&adv.encode()).unwrap();
        assert_eq!(decoded.display_name, "");
        assert_eq!(decoded.peer_id(), hex::encode([1u8; FINGERPRINT_LEN]));
    }
}
