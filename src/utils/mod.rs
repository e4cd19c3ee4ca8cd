/// Compute CRC16 (XMODEM) over the provided bytes.
pub fn crc16(data: &[u8]) -> u16 {
    crc16::State::<crc16::XMODEM>::calculate(data)
}

/// Hash slot of a key, honoring the `{tag}` convention.
///
/// If the key contains a `{...}` pattern with a non-empty interior, only the
/// bytes between the first `{` and the first `}` after it are hashed, so that
/// related keys can be forced onto the same slot. A missing `}` or an empty
/// `{}` falls back to hashing the whole key.
pub fn hash_slot(key: &[u8]) -> u16 {
    let open = match key.iter().position(|&b| b == b'{') {
        Some(open) => open,
        None => return crc16(key) & 0x3fff,
    };
    let tag = &key[open + 1..];
    match tag.iter().position(|&b| b == b'}') {
        Some(close) if close > 0 => crc16(&tag[..close]) & 0x3fff,
        _ => crc16(key) & 0x3fff,
    }
}
