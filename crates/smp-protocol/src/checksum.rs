// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! 32-bit integrity checksum carried in the trailer of every command PDU.
//!
//! Reflected CRC-32 (polynomial `0xEDB88320`, initial value and final XOR
//! `0xFFFFFFFF`). The lookup table is built once, at compile time.

/// Reflected CRC-32 polynomial.
pub const POLYNOMIAL: u32 = 0xEDB8_8320;

static TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut value = n as u32;
        let mut bit = 0;
        while bit < 8 {
            if value & 1 == 1 {
                value = (value >> 1) ^ POLYNOMIAL;
            } else {
                value >>= 1;
            }
            bit += 1;
        }
        table[n] = value;
        n += 1;
    }
    table
}

/// Compute the checksum of `bytes`.
pub fn checksum(bytes: &[u8]) -> u32 {
    let mut acc = u32::MAX;
    for &byte in bytes {
        acc = TABLE[((acc ^ u32::from(byte)) & 0xFF) as usize] ^ (acc >> 8);
    }
    acc ^ u32::MAX
}
