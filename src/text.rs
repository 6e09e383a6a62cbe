//! Text helpers shared by both dialects.
//!
//! Direct Connect uses unpadded RFC 4648 base32 for CIDs, keyprints and
//! tokens, and NMDC hubs speak a per-hub legacy character encoding that has
//! to be normalised to UTF-8 before identity lookups.

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Encodes bytes as unpadded base32.
pub fn base32_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(5) * 8);
    let mut acc: u32 = 0;
    let mut bits = 0usize;

    for &b in bytes {
        acc = (acc << 8) | u32::from(b);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((acc << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

/// Decodes base32 into a fixed-size buffer, stopping when it is full.
///
/// Characters outside the alphabet are skipped, matching the tolerant
/// decoder the wire formats assume.
pub fn base32_decode_into(s: &str, out: &mut [u8]) {
    let mut acc: u32 = 0;
    let mut bits = 0usize;
    let mut pos = 0usize;

    for c in s.bytes() {
        let val = match c {
            b'A'..=b'Z' => c - b'A',
            b'a'..=b'z' => c - b'a',
            b'2'..=b'7' => c - b'2' + 26,
            _ => continue,
        };
        acc = (acc << 5) | u32::from(val);
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            if pos == out.len() {
                return;
            }
            out[pos] = ((acc >> bits) & 0xff) as u8;
            pos += 1;
        }
    }
}

/// Decodes unpadded base32 into exactly `len` bytes.
///
/// Returns `None` if the input does not carry enough bits.
pub fn base32_decode(s: &str, len: usize) -> Option<Vec<u8>> {
    let valid = s
        .bytes()
        .filter(|c| c.is_ascii_alphabetic() || (b'2'..=b'7').contains(c))
        .count();
    if valid * 5 / 8 < len {
        return None;
    }
    let mut out = vec![0u8; len];
    base32_decode_into(s, &mut out);
    Some(out)
}

/// Converts a nick received in a hub's wire encoding to UTF-8.
///
/// UTF-8 hubs pass through (lossily, bad sequences are replaced); legacy
/// single-byte encodings fall back to a Latin-1 style byte-to-char map,
/// which keeps CIDs stable for the ASCII nicks those hubs carry.
pub fn to_utf8(raw: &[u8], encoding: &str) -> String {
    if encoding.is_empty()
        || encoding.eq_ignore_ascii_case("utf-8")
        || encoding.eq_ignore_ascii_case("utf8")
    {
        String::from_utf8_lossy(raw).into_owned()
    } else {
        raw.iter().map(|&b| b as char).collect()
    }
}
