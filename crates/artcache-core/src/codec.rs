//! # Wire Codec
//!
//! Put request body, as written by Buck's HTTP cache client:
//!
//! ```text
//! ┌───────────────┬──────────────────────────────────────┬───────────────┐
//! │ key count N   │ N × (u16 length ‖ key bytes)         │ payload       │
//! │ i32 BE        │ Java modified UTF-8, no terminator   │ rest of body  │
//! └───────────────┴──────────────────────────────────────┴───────────────┘
//! ```
//!
//! Keys use the `DataOutputStream.writeUTF` encoding: NUL is written as
//! `C0 80` and characters outside the BMP as two three-byte surrogates.
//! There is no payload length field; everything after the last key is
//! payload.
//!
//! The get response body is the payload verbatim.

use bytes::{Buf, Bytes};

use crate::error::CodecError;
use crate::store::StoredArtifact;

/// A decoded put request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutRequest {
    /// External keys in wire order (may contain duplicates).
    pub keys: Vec<String>,
    /// Artifact bytes.
    pub payload: Bytes,
    /// Total body bytes read, charged to ingress admission.
    pub consumed: u64,
}

impl PutRequest {
    /// Whether the request is acceptable: at least one key and a non-empty payload.
    pub fn verify(&self) -> bool {
        !self.keys.is_empty() && !self.payload.is_empty()
    }
}

fn need(buf: &Bytes, needed: usize, field: &'static str) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            field,
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

/// Decode a put request body.
pub fn decode_put(body: Bytes) -> Result<PutRequest, CodecError> {
    let consumed = body.len() as u64;
    let mut buf = body;

    need(&buf, 4, "key count")?;
    let count = buf.get_i32();
    if count < 0 {
        return Err(CodecError::NegativeKeyCount(count));
    }
    let count = count as usize;
    // Each key needs at least its length prefix; refuse to allocate for
    // counts the body cannot possibly hold.
    need(&buf, count.saturating_mul(2), "key length prefixes")?;

    let mut keys = Vec::with_capacity(count);
    for _ in 0..count {
        need(&buf, 2, "key length")?;
        let len = usize::from(buf.get_u16());
        need(&buf, len, "key")?;
        let raw = buf.split_to(len);
        keys.push(decode_modified_utf8(&raw)?);
    }

    Ok(PutRequest {
        keys,
        payload: buf,
        consumed,
    })
}

/// Encode a put request body (client side).
pub fn encode_put<K: AsRef<str>>(keys: &[K], payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let count = i32::try_from(keys.len()).map_err(|_| CodecError::TooManyKeys(keys.len()))?;

    let mut out = Vec::with_capacity(4 + keys.len() * 16 + payload.len());
    out.extend_from_slice(&count.to_be_bytes());
    for key in keys {
        let encoded = encode_modified_utf8(key.as_ref());
        let len = u16::try_from(encoded.len()).map_err(|_| CodecError::KeyTooLong(encoded.len()))?;
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&encoded);
    }
    out.extend_from_slice(payload);
    Ok(out)
}

/// Encode a get response body: the raw payload, no framing.
pub fn encode_get(artifact: &StoredArtifact) -> Bytes {
    artifact.payload.clone()
}

/// Java modified UTF-8, as produced by `DataOutputStream.writeUTF`.
pub fn encode_modified_utf8(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for unit in s.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}

/// Inverse of [`encode_modified_utf8`]. Unpaired surrogates are rejected.
pub fn decode_modified_utf8(bytes: &[u8]) -> Result<String, CodecError> {
    let continuation = |i: usize| -> Result<u16, CodecError> {
        match bytes.get(i) {
            Some(&b) if b & 0xC0 == 0x80 => Ok(u16::from(b & 0x3F)),
            Some(&b) => Err(CodecError::InvalidKey(format!(
                "bad continuation byte {b:#04x} at offset {i}"
            ))),
            None => Err(CodecError::InvalidKey(format!(
                "sequence cut off at offset {i}"
            ))),
        }
    };

    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let lead = bytes[i];
        match lead >> 4 {
            0x0..=0x7 => {
                units.push(u16::from(lead));
                i += 1;
            }
            0xC | 0xD => {
                units.push((u16::from(lead & 0x1F) << 6) | continuation(i + 1)?);
                i += 2;
            }
            0xE => {
                units.push(
                    (u16::from(lead & 0x0F) << 12) | (continuation(i + 1)? << 6) | continuation(i + 2)?,
                );
                i += 3;
            }
            _ => {
                return Err(CodecError::InvalidKey(format!(
                    "bad lead byte {lead:#04x} at offset {i}"
                )));
            }
        }
    }

    String::from_utf16(&units).map_err(|e| CodecError::InvalidKey(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::ArtifactId;

    const EXAMPLE: &[u8] = &[
        0x00, 0x00, 0x00, 0x03, // three keys
        0x00, 0x01, b'x', //
        0x00, 0x02, b'y', b'y', //
        0x00, 0x03, b'z', b'z', b'z', //
        0x01, 0x02, 0x03, // payload
    ];

    #[test]
    fn encodes_the_reference_example() {
        let encoded = encode_put(&["x", "yy", "zzz"], &[0x01, 0x02, 0x03]).unwrap();
        assert_eq!(encoded, EXAMPLE);
    }

    #[test]
    fn decodes_the_reference_example() {
        let request = decode_put(Bytes::from_static(EXAMPLE)).unwrap();
        assert_eq!(request.keys, ["x", "yy", "zzz"]);
        assert_eq!(request.payload, Bytes::from_static(&[0x01, 0x02, 0x03]));
        assert_eq!(request.consumed, EXAMPLE.len() as u64);
        assert!(request.verify());
    }

    #[test]
    fn payload_is_everything_after_keys() {
        let body = encode_put(&["k"], b"").unwrap();
        let request = decode_put(Bytes::from(body)).unwrap();
        assert!(request.payload.is_empty());
        assert!(!request.verify());
    }

    #[test]
    fn zero_keys_fails_verify() {
        let request = decode_put(Bytes::from(encode_put::<&str>(&[], b"data").unwrap())).unwrap();
        assert!(request.keys.is_empty());
        assert!(!request.verify());
    }

    #[test]
    fn truncated_count() {
        let err = decode_put(Bytes::from_static(&[0x00, 0x00])).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { field: "key count", .. }));
    }

    #[test]
    fn truncated_key() {
        let err = decode_put(Bytes::from_static(&[0, 0, 0, 1, 0, 5, b'a', b'b'])).unwrap_err();
        assert_eq!(
            err,
            CodecError::Truncated {
                field: "key",
                needed: 5,
                available: 2
            }
        );
    }

    #[test]
    fn absurd_key_count_is_rejected_without_allocating() {
        let err = decode_put(Bytes::from_static(&[0x7F, 0xFF, 0xFF, 0xFF, 0, 1, b'a'])).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { field: "key length prefixes", .. }));
    }

    #[test]
    fn negative_key_count() {
        let err = decode_put(Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF])).unwrap_err();
        assert_eq!(err, CodecError::NegativeKeyCount(-1));
    }

    #[test]
    fn nul_uses_two_byte_form() {
        assert_eq!(encode_modified_utf8("a\0b"), [b'a', 0xC0, 0x80, b'b']);
        assert_eq!(decode_modified_utf8(&[b'a', 0xC0, 0x80, b'b']).unwrap(), "a\0b");
    }

    #[test]
    fn supplementary_characters_use_surrogate_pairs() {
        let encoded = encode_modified_utf8("😀");
        assert_eq!(encoded, [0xED, 0xA0, 0xBD, 0xED, 0xB8, 0x80]);
        assert_eq!(decode_modified_utf8(&encoded).unwrap(), "😀");
    }

    #[test]
    fn two_byte_characters() {
        assert_eq!(encode_modified_utf8("é"), [0xC3, 0xA9]);
        assert_eq!(decode_modified_utf8(&[0xC3, 0xA9]).unwrap(), "é");
    }

    #[test]
    fn invalid_sequences_are_rejected() {
        assert!(decode_modified_utf8(&[0xFF]).is_err());
        assert!(decode_modified_utf8(&[0xC3]).is_err());
        assert!(decode_modified_utf8(&[0xE0, 0x41, 0x80]).is_err());
        // Lone high surrogate.
        assert!(decode_modified_utf8(&[0xED, 0xA0, 0xBD]).is_err());
    }

    #[test]
    fn oversized_key_is_rejected() {
        let key = "k".repeat(70_000);
        assert_eq!(
            encode_put(&[key], b"x").unwrap_err(),
            CodecError::KeyTooLong(70_000)
        );
    }

    #[test]
    fn get_body_is_payload_verbatim() {
        let artifact = StoredArtifact {
            id: ArtifactId::new(1),
            payload: Bytes::from_static(b"\x00\x01raw"),
            size: 5,
        };
        assert_eq!(encode_get(&artifact), Bytes::from_static(b"\x00\x01raw"));
    }
}
