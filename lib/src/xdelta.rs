// Copyright 2022 The Mtn Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Invertible binary deltas over opaque byte sequences.
//!
//! A delta is a sequence of copy-from-source and insert-literal
//! instructions. Matching is block-based and greedy, which keeps the
//! computation deterministic; the interesting property is not an optimal
//! delta but invertibility: given `old` and the delta `old -> new`, the
//! reverse delta `new -> old` is derivable with no additional data
//! (reconstruct `new`, then diff back).

use std::collections::HashMap;

use thiserror::Error;

const BLOCK_SIZE: usize = 64;

const OP_COPY: u8 = b'C';
const OP_INSERT: u8 = b'I';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum XdeltaError {
    #[error("truncated delta")]
    Truncated,
    #[error("bad delta opcode {0:#x}")]
    BadOpcode(u8),
    #[error("delta copies out of bounds (offset {offset}, len {len}, source len {source_len})")]
    OutOfBounds {
        offset: usize,
        len: usize,
        source_len: usize,
    },
}

fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn read_u32(input: &[u8], pos: &mut usize) -> Result<u32, XdeltaError> {
    let bytes: [u8; 4] = input
        .get(*pos..*pos + 4)
        .ok_or(XdeltaError::Truncated)?
        .try_into()
        .unwrap();
    *pos += 4;
    Ok(u32::from_be_bytes(bytes))
}

fn block_hash(block: &[u8]) -> u64 {
    // FNV-1a; only used to bucket candidate offsets, matches are verified
    // byte-for-byte.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in block {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x1000_0000_01b3);
    }
    hash
}

/// Computes an encoded delta transforming `old` into `new`.
pub fn compute_delta(old: &[u8], new: &[u8]) -> Vec<u8> {
    let mut index: HashMap<u64, Vec<usize>> = HashMap::new();
    if old.len() >= BLOCK_SIZE {
        for offset in (0..=old.len() - BLOCK_SIZE).step_by(BLOCK_SIZE) {
            index
                .entry(block_hash(&old[offset..offset + BLOCK_SIZE]))
                .or_default()
                .push(offset);
        }
    }

    let mut delta = Vec::new();
    let mut pending = Vec::new();
    let mut flush_insert = |delta: &mut Vec<u8>, pending: &mut Vec<u8>| {
        if !pending.is_empty() {
            delta.push(OP_INSERT);
            push_u32(delta, pending.len() as u32);
            delta.extend_from_slice(pending);
            pending.clear();
        }
    };

    let mut pos = 0;
    while pos < new.len() {
        let mut matched = None;
        if pos + BLOCK_SIZE <= new.len() {
            let needle = &new[pos..pos + BLOCK_SIZE];
            if let Some(candidates) = index.get(&block_hash(needle)) {
                for &offset in candidates {
                    if &old[offset..offset + BLOCK_SIZE] == needle {
                        // extend the match forward as far as it goes
                        let mut len = BLOCK_SIZE;
                        while offset + len < old.len()
                            && pos + len < new.len()
                            && old[offset + len] == new[pos + len]
                        {
                            len += 1;
                        }
                        matched = Some((offset, len));
                        break;
                    }
                }
            }
        }
        match matched {
            Some((offset, len)) => {
                flush_insert(&mut delta, &mut pending);
                delta.push(OP_COPY);
                push_u32(&mut delta, offset as u32);
                push_u32(&mut delta, len as u32);
                pos += len;
            }
            None => {
                pending.push(new[pos]);
                pos += 1;
            }
        }
    }
    flush_insert(&mut delta, &mut pending);
    delta
}

/// Applies an encoded delta to `old`.
pub fn apply_delta(old: &[u8], delta: &[u8]) -> Result<Vec<u8>, XdeltaError> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos < delta.len() {
        let op = delta[pos];
        pos += 1;
        match op {
            OP_COPY => {
                let offset = read_u32(delta, &mut pos)? as usize;
                let len = read_u32(delta, &mut pos)? as usize;
                let chunk = old.get(offset..offset + len).ok_or(XdeltaError::OutOfBounds {
                    offset,
                    len,
                    source_len: old.len(),
                })?;
                out.extend_from_slice(chunk);
            }
            OP_INSERT => {
                let len = read_u32(delta, &mut pos)? as usize;
                let chunk = delta.get(pos..pos + len).ok_or(XdeltaError::Truncated)?;
                out.extend_from_slice(chunk);
                pos += len;
            }
            other => return Err(XdeltaError::BadOpcode(other)),
        }
    }
    Ok(out)
}

/// Derives the reverse delta `new -> old` from `old` and the forward
/// delta `old -> new`.
pub fn invert_delta(old: &[u8], forward: &[u8]) -> Result<Vec<u8>, XdeltaError> {
    let new = apply_delta(old, forward)?;
    Ok(compute_delta(&new, old))
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    fn sample(len: usize, seed: u8) -> Vec<u8> {
        // deterministic pseudo-random bytes
        let mut state = u32::from(seed) | 1;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (state >> 24) as u8
            })
            .collect()
    }

    #[test_case(0, 0)]
    #[test_case(0, 1000)]
    #[test_case(1000, 0)]
    #[test_case(1000, 1000)]
    fn round_trip(old_len: usize, new_len: usize) {
        let old = sample(old_len, 3);
        let mut new = sample(new_len, 5);
        // splice a shared chunk in so there is something to copy
        let shared = old.iter().take(200).copied().collect::<Vec<_>>();
        new.extend_from_slice(&shared);
        let delta = compute_delta(&old, &new);
        assert_eq!(apply_delta(&old, &delta).unwrap(), new);
    }

    #[test]
    fn large_common_prefix_compresses() {
        let old = sample(8192, 7);
        let mut new = old.clone();
        new.extend_from_slice(b"trailing edit");
        let delta = compute_delta(&old, &new);
        assert!(delta.len() < 128, "delta is {} bytes", delta.len());
        assert_eq!(apply_delta(&old, &delta).unwrap(), new);
    }

    #[test]
    fn inversion_restores_old_exactly() {
        let old = sample(4096, 11);
        let mut new = old.clone();
        new.splice(100..200, b"replacement".iter().copied());
        let forward = compute_delta(&old, &new);
        let reverse = invert_delta(&old, &forward).unwrap();
        assert_eq!(apply_delta(&new, &reverse).unwrap(), old);
    }

    #[test]
    fn apply_rejects_corrupt_input() {
        assert_eq!(apply_delta(b"abc", &[b'Z']), Err(XdeltaError::BadOpcode(b'Z')));
        assert_eq!(apply_delta(b"abc", &[OP_COPY, 0, 0]), Err(XdeltaError::Truncated));
        let mut delta = vec![OP_COPY];
        push_u32(&mut delta, 2);
        push_u32(&mut delta, 10);
        assert_eq!(
            apply_delta(b"abc", &delta),
            Err(XdeltaError::OutOfBounds {
                offset: 2,
                len: 10,
                source_len: 3
            })
        );
    }
}
