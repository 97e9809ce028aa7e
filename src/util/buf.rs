use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};


/// Serialization helpers for the small closed set of compound values used on the wire:
///  length-prefixed byte strings, UTF-8 strings and string maps. Lengths are varint encoded.
///
/// All read functions consume from the buffer sequentially and fail with an error (rather than
///  panicking or reading garbage) if the buffer is exhausted early - wire input is untrusted.

pub fn put_bytes(buf: &mut impl BufMut, bytes: &[u8]) {
    buf.put_usize_varint(bytes.len());
    buf.put_slice(bytes);
}

pub fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Vec<u8>> {
    let len = buf.try_get_usize_varint()?;
    if buf.remaining() < len {
        return Err(anyhow::anyhow!("buffer underflow: {} bytes announced, {} available", len, buf.remaining()));
    }
    let mut result = vec![0u8; len];
    buf.copy_to_slice(&mut result);
    Ok(result)
}

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let raw = try_get_bytes(buf)?;
    Ok(String::from_utf8(raw)?)
}

pub fn put_string_map<'a>(buf: &mut impl BufMut, entries: impl ExactSizeIterator<Item = (&'a str, &'a str)>) {
    buf.put_usize_varint(entries.len());
    for (key, value) in entries {
        put_string(buf, key);
        put_string(buf, value);
    }
}

pub fn try_get_string_map(buf: &mut impl Buf) -> anyhow::Result<Vec<(String, String)>> {
    let num_entries = buf.try_get_usize_varint()?;
    let mut result = Vec::new();
    for _ in 0..num_entries {
        let key = try_get_string(buf)?;
        let value = try_get_string(buf)?;
        result.push((key, value));
    }
    Ok(result)
}
