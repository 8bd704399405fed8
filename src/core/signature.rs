//! ECDSA signature format conversion.
//!
//! General-purpose signing APIs emit ECDSA signatures as a DER SEQUENCE of
//! two variable-length INTEGERs, while the COSE and JOSE structures built
//! here need the fixed 64-byte `r ‖ s` form. [`der_to_raw`] performs that
//! conversion for P-256 signatures.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature is not a DER SEQUENCE")]
    NotASequence,
    #[error("expected a DER INTEGER at offset {0}")]
    ExpectedInteger(usize),
    #[error("signature is truncated")]
    Truncated,
}

/// Converts a DER-encoded ECDSA P-256 signature into its raw 64-byte form.
///
/// Each component is zero-padded on the left to 32 bytes. Encodings longer
/// than 32 bytes (a leading 0x00 sign guard, or redundant padding) are
/// truncated from the left. Sequence lengths in long form (high bit set on
/// the length byte) are accepted.
pub fn der_to_raw(der: &[u8]) -> Result<[u8; 64], SignatureError> {
    if der.first() != Some(&0x30) {
        return Err(SignatureError::NotASequence);
    }
    let len_byte = *der.get(1).ok_or(SignatureError::Truncated)?;
    // A long-form length carries (len_byte & 0x7f) extra length bytes.
    let mut pos = if len_byte & 0x80 != 0 {
        2 + (len_byte & 0x7f) as usize
    } else {
        2
    };

    let r = integer(der, &mut pos)?;
    let s = integer(der, &mut pos)?;

    let mut raw = [0u8; 64];
    raw[..32].copy_from_slice(&r);
    raw[32..].copy_from_slice(&s);
    Ok(raw)
}

/// Reads one INTEGER at `*pos` and normalizes it to 32 big-endian bytes.
fn integer(der: &[u8], pos: &mut usize) -> Result<[u8; 32], SignatureError> {
    if der.get(*pos) != Some(&0x02) {
        return Err(SignatureError::ExpectedInteger(*pos));
    }
    let len = *der.get(*pos + 1).ok_or(SignatureError::Truncated)? as usize;
    let start = *pos + 2;
    let end = start
        .checked_add(len)
        .filter(|end| *end <= der.len())
        .ok_or(SignatureError::Truncated)?;
    let bytes = &der[start..end];
    *pos = end;

    let mut out = [0u8; 32];
    if len >= 32 {
        // Anything above 32 bytes is sign-guard or padding; keep the low 32.
        out.copy_from_slice(&bytes[len - 32..]);
    } else {
        out[32 - len..].copy_from_slice(bytes);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::{signature::Signer, Signature, SigningKey};

    /// Builds a DER signature from raw integer encodings.
    fn der(r: &[u8], s: &[u8]) -> Vec<u8> {
        let mut out = vec![0x30, (r.len() + s.len() + 4) as u8];
        out.push(0x02);
        out.push(r.len() as u8);
        out.extend_from_slice(r);
        out.push(0x02);
        out.push(s.len() as u8);
        out.extend_from_slice(s);
        out
    }

    #[test]
    fn full_width_integers_concatenate_directly() {
        let r = [0x11u8; 32];
        let s = [0x22u8; 32];
        let raw = der_to_raw(&der(&r, &s)).unwrap();
        assert_eq!(&raw[..32], &r);
        assert_eq!(&raw[32..], &s);
    }

    #[test]
    fn sign_guard_byte_is_stripped() {
        let mut r = vec![0x00];
        r.extend_from_slice(&[0x80; 32]);
        let s = [0x01u8; 32];
        let raw = der_to_raw(&der(&r, &s)).unwrap();
        assert_eq!(&raw[..32], &[0x80; 32]);
        assert_eq!(&raw[32..], &s);
    }

    #[test]
    fn short_integers_are_left_padded() {
        let r = [0xab; 31];
        let s = [0x7f];
        let raw = der_to_raw(&der(&r, &s)).unwrap();
        assert_eq!(raw[0], 0x00);
        assert_eq!(&raw[1..32], &r);
        assert_eq!(&raw[32..63], &[0x00; 31]);
        assert_eq!(raw[63], 0x7f);
    }

    #[test]
    fn long_form_sequence_length_is_accepted() {
        let r = [0x11u8; 32];
        let s = [0x22u8; 32];
        let short = der(&r, &s);
        let mut long = vec![0x30, 0x81, short[1]];
        long.extend_from_slice(&short[2..]);
        assert_eq!(der_to_raw(&long).unwrap(), der_to_raw(&short).unwrap());
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert_eq!(der_to_raw(&[]), Err(SignatureError::NotASequence));
        assert_eq!(der_to_raw(&[0x04, 0x00]), Err(SignatureError::NotASequence));
        assert_eq!(der_to_raw(&[0x30]), Err(SignatureError::Truncated));
        assert_eq!(
            der_to_raw(&[0x30, 0x06, 0x04, 0x01, 0x00]),
            Err(SignatureError::ExpectedInteger(2))
        );
        // INTEGER length runs past the end of the buffer.
        assert_eq!(
            der_to_raw(&[0x30, 0x44, 0x02, 0x20, 0x01]),
            Err(SignatureError::Truncated)
        );
    }

    #[test]
    fn matches_crate_native_raw_encoding() {
        let key = SigningKey::random(&mut rand::rngs::OsRng);
        for message in [&b"device authentication"[..], b"", b"x"] {
            let signature: Signature = key.sign(message);
            let raw = der_to_raw(signature.to_der().as_bytes()).unwrap();
            assert_eq!(raw.as_slice(), signature.to_bytes().as_slice());
        }
    }
}
