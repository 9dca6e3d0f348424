//! # Prefix-varint encoding and decoding
//!
//! This file implements the encoding described here:
//! <https://github.com/WebAssembly/design/issues/601#issuecomment-196022303>
//!
//! The length of an encoded value is determined by its first byte alone, which lets free-list
//! trunk pages be scanned without decoding every entry. Decoding never trusts its input: pages
//! read back from a swap file may be truncated or garbage.

fn unaligned_load_u64(p: &[u8]) -> u64 {
  let mut array = [0u8; 8];
  let len = p.len().min(8);
  array[..len].copy_from_slice(&p[..len]);
  u64::from_le_bytes(array)
}

fn length(initial: u8) -> usize {
  1 + (u32::from(initial) | 0x100).trailing_zeros() as usize
}

/// Returns the number of bytes [`encode`] produces for `x`.
pub fn encoded_len(x: u64) -> usize {
  let bits = 64 - (x | 1).leading_zeros() as usize;
  if bits > 56 {
    9
  } else {
    1 + (bits - 1) / 7
  }
}

/// Decodes an unsigned 64-bit integer from the front of `p`.
///
/// Returns the value and the number of bytes it occupied, or `None` if `p` ends before the value
/// does.
pub fn decode(p: &[u8]) -> Option<(u64, usize)> {
  let length = length(*p.first()?);
  if p.len() < length {
    return None;
  }
  let value = if length < 9 {
    let unused = 64 - 8 * length;
    unaligned_load_u64(&p[..length]) << unused >> (unused + length)
  } else {
    unaligned_load_u64(&p[1..9])
  };
  Some((value, length))
}

/// Encodes an unsigned 64-bit integer into a byte vector, using the prefix-varint format.
pub fn encode(x: u64, output: &mut Vec<u8>) {
  let bits = 64 - (x | 1).leading_zeros();
  let mut bytes = 1 + (bits - 1) / 7;
  let mut x = x;
  if bits > 56 {
    output.push(0);
    bytes = 8;
  } else {
    x = (x << bytes) | (1 << (bytes - 1));
  }
  for _ in 0..bytes {
    output.push((x & 0xff) as u8);
    x >>= 8;
  }
}

/// Iterates over the values packed back to back in `p`, stopping at the first truncated one.
pub fn decode_all(p: &[u8]) -> impl Iterator<Item = u64> + '_ {
  let mut rest = p;
  std::iter::from_fn(move || {
    let (value, used) = decode(rest)?;
    rest = &rest[used..];
    Some(value)
  })
}
