/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

use bstr::ByteSlice;

/// Interpret a fixed-size field as a NUL-terminated string and return the
/// bytes before the first NUL. If there is no NUL, the whole field is
/// returned.
pub fn truncate_at_nul(buf: &[u8]) -> &[u8] {
    match buf.find_byte(0) {
        Some(n) => &buf[..n],
        None => buf,
    }
}

/// Check if a byte slice is non-empty and every byte equals `fill`.
pub fn is_filled_with(buf: &[u8], fill: u8) -> bool {
    !buf.is_empty() && buf.iter().all(|b| *b == fill)
}
