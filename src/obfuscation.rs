//! Envelope obfuscation codec (spec §4.1, C1).
//!
//! Wraps a payload in random-padded header/footer bytes so traffic does not
//! look like a fixed-format protocol on the wire. This is a thin framing
//! layer, not a cryptographic one — confidentiality comes from C2/C3.

use rand::RngCore;

use crate::error::FramingError;

const HEADER_LEN: usize = 16;
const TYPE_LEN: usize = 1;
const LENGTH_LEN: usize = 4;
const MIN_ENVELOPE_LEN: usize = HEADER_LEN + TYPE_LEN + LENGTH_LEN; // 21
const FOOTER_MIN: usize = 16;
const FOOTER_MAX: usize = 128;

const COVER_MIN: usize = 128;
const COVER_MAX: usize = 8192;

const JITTER_MIN_MS: u64 = 10;
const JITTER_MAX_MS: u64 = 500;

/// The envelope `type` byte. Unknown variants are discarded by the reader
/// (spec §9: sum types over duck typing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeType {
    Message,
    Reserved(u8),
}

impl EnvelopeType {
    fn to_byte(self) -> u8 {
        match self {
            EnvelopeType::Message => 0x01,
            EnvelopeType::Reserved(b) => b,
        }
    }

    fn from_byte(b: u8) -> EnvelopeType {
        match b {
            0x01 => EnvelopeType::Message,
            other => EnvelopeType::Reserved(other),
        }
    }
}

/// Wrap `payload` into a random-padded envelope:
/// `header(16) ‖ type(1) ‖ length(4, BE) ‖ payload ‖ footer(16..128)`.
pub fn wrap_envelope(payload: &[u8], msg_type: EnvelopeType) -> Vec<u8> {
    let mut rng = rand::thread_rng();

    let mut header = [0u8; HEADER_LEN];
    rng.fill_bytes(&mut header);

    let footer_len = gen_range_inclusive(&mut rng, FOOTER_MIN as u64, FOOTER_MAX as u64) as usize;
    let mut footer = vec![0u8; footer_len];
    rng.fill_bytes(&mut footer);

    let mut out = Vec::with_capacity(HEADER_LEN + TYPE_LEN + LENGTH_LEN + payload.len() + footer_len);
    out.extend_from_slice(&header);
    out.push(msg_type.to_byte());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(&footer);
    out
}

/// Extract the payload and type back out of an envelope produced by [`wrap_envelope`].
pub fn unwrap_envelope(envelope: &[u8]) -> Result<(EnvelopeType, &[u8]), FramingError> {
    if envelope.len() < MIN_ENVELOPE_LEN {
        return Err(FramingError::TooShort);
    }

    let msg_type = EnvelopeType::from_byte(envelope[HEADER_LEN]);
    let len_offset = HEADER_LEN + TYPE_LEN;
    let declared = u32::from_be_bytes(
        envelope[len_offset..len_offset + LENGTH_LEN]
            .try_into()
            .expect("slice is exactly 4 bytes"),
    );

    let payload_start = MIN_ENVELOPE_LEN;
    let remaining = envelope.len() - payload_start;
    if declared as usize > remaining {
        return Err(FramingError::BadLength {
            declared,
            available: remaining,
        });
    }

    let payload = &envelope[payload_start..payload_start + declared as usize];
    Ok((msg_type, payload))
}

/// Random delay in `[10ms, 500ms]` applied before a real send (spec §4.1).
pub fn jitter_delay() -> std::time::Duration {
    let ms = gen_range_inclusive(&mut rand::thread_rng(), JITTER_MIN_MS, JITTER_MAX_MS);
    std::time::Duration::from_millis(ms)
}

/// Random cover traffic of random size in `[128, 8192]` bytes. Optional —
/// not on the happy send path (spec §4.1).
pub fn cover_traffic() -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let size = gen_range_inclusive(&mut rng, COVER_MIN as u64, COVER_MAX as u64) as usize;
    let mut buf = vec![0u8; size];
    rng.fill_bytes(&mut buf);
    buf
}

/// Split `data` into randomly-sized chunks, optionally interleaved with
/// decoy chunks of random bytes. Optional traffic-shaping helper (spec §4.1);
/// not used by [`crate::transport`]'s default send path.
pub fn decoy_split(data: &[u8]) -> Vec<Vec<u8>> {
    let mut rng = rand::thread_rng();
    let mut chunks = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let take = gen_range_inclusive(&mut rng, COVER_MIN as u64, COVER_MAX as u64)
            .min((data.len() - offset) as u64) as usize;
        let take = take.max(1);
        chunks.push(data[offset..offset + take].to_vec());
        offset += take;
    }

    if rand::random::<f32>() < 0.3 {
        let decoy_count = gen_range_inclusive(&mut rng, 1, 3);
        for _ in 0..decoy_count {
            let pos = gen_range_inclusive(&mut rng, 0, chunks.len() as u64) as usize;
            chunks.insert(pos.min(chunks.len()), cover_traffic());
        }
    }

    chunks
}

/// Uniform integer in `[low, high]` inclusive, drawn from the given RNG.
fn gen_range_inclusive<R: RngCore>(rng: &mut R, low: u64, high: u64) -> u64 {
    let span = high - low + 1;
    low + (rng.next_u64() % span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_roundtrip_empty() {
        let (ty, payload) = unwrap_envelope(&wrap_envelope(b"", EnvelopeType::Message)).unwrap();
        assert_eq!(ty, EnvelopeType::Message);
        assert_eq!(payload, b"");
    }

    #[test]
    fn wrap_unwrap_roundtrip_various_lengths() {
        for len in [0usize, 1, 255, 256, 257, 4096] {
            let data = vec![0xABu8; len];
            let wrapped = wrap_envelope(&data, EnvelopeType::Message);
            let (ty, payload) = unwrap_envelope(&wrapped).unwrap();
            assert_eq!(ty, EnvelopeType::Message);
            assert_eq!(payload, data.as_slice());
        }
    }

    #[test]
    fn footer_length_is_in_range() {
        let wrapped = wrap_envelope(b"hi", EnvelopeType::Message);
        let footer_len = wrapped.len() - MIN_ENVELOPE_LEN - 2;
        assert!((FOOTER_MIN..=FOOTER_MAX).contains(&footer_len));
    }

    #[test]
    fn too_short_is_rejected() {
        let buf = vec![0u8; 20];
        assert!(matches!(unwrap_envelope(&buf), Err(FramingError::TooShort)));
    }

    #[test]
    fn bad_length_is_rejected() {
        let mut buf = vec![0u8; 21];
        buf[16] = 0x01;
        buf[17..21].copy_from_slice(&100u32.to_be_bytes());
        assert!(matches!(
            unwrap_envelope(&buf),
            Err(FramingError::BadLength { .. })
        ));
    }

    #[test]
    fn unknown_type_is_preserved_as_reserved() {
        let wrapped = wrap_envelope(b"x", EnvelopeType::Reserved(0x42));
        let (ty, _) = unwrap_envelope(&wrapped).unwrap();
        assert_eq!(ty, EnvelopeType::Reserved(0x42));
    }

    #[test]
    fn jitter_is_within_spec_bounds() {
        let d = jitter_delay();
        assert!(d.as_millis() >= JITTER_MIN_MS as u128);
        assert!(d.as_millis() <= JITTER_MAX_MS as u128);
    }

    #[test]
    fn cover_traffic_is_within_spec_bounds() {
        let c = cover_traffic();
        assert!(c.len() >= COVER_MIN && c.len() <= COVER_MAX);
    }
}
