/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! System property identifiers and the test override-list parser. The cached
//! property cells themselves live in the updater configuration.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Too many fields (max is {count}): {0}", count = PropertyKind::COUNT)]
    TooManyFields(String),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PropertyKind {
    MainfwAct,
    TpmFwver,
    FwVboot2,
    PlatformVer,
    WpHw,
    WpSw,
}

impl PropertyKind {
    pub const ALL: [Self; 6] = [
        Self::MainfwAct,
        Self::TpmFwver,
        Self::FwVboot2,
        Self::PlatformVer,
        Self::WpHw,
        Self::WpSw,
    ];
    pub const COUNT: usize = Self::ALL.len();

    pub fn index(self) -> usize {
        Self::ALL.iter().position(|p| *p == self).unwrap()
    }
}

/// The RW slot the system booted from, as reported by `mainfw_act`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ActiveSlot {
    Unknown,
    A,
    B,
}

impl ActiveSlot {
    pub fn from_property(value: i64) -> Self {
        match value {
            0 => Self::A,
            1 => Self::B,
            _ => Self::Unknown,
        }
    }

    pub fn to_property(self) -> i64 {
        match self {
            Self::A => 0,
            Self::B => 1,
            Self::Unknown => -1,
        }
    }
}

/// Parse an integer prefix the way `strtol(s, .., 0)` would, with hex
/// (`0x`) support. Returns the value and the number of bytes consumed; a
/// lone sign consumes one byte and yields zero.
fn parse_int_prefix(s: &str) -> (i64, usize) {
    let bytes = s.as_bytes();
    let mut pos = 0;
    let negative = bytes.first() == Some(&b'-');
    if negative {
        pos += 1;
    }

    let radix = if bytes[pos..].starts_with(b"0x") || bytes[pos..].starts_with(b"0X") {
        pos += 2;
        16
    } else {
        10
    };

    let mut value: i64 = 0;
    while pos < bytes.len() {
        let Some(digit) = (bytes[pos] as char).to_digit(radix) else {
            break;
        };
        value = value.wrapping_mul(i64::from(radix)).wrapping_add(i64::from(digit));
        pos += 1;
    }

    (if negative { -value } else { value }, pos.max(1))
}

/// Parse a property override list: integers separated by commas and/or
/// spaces. `"1 2 3"` and `"1,2,3"` both override the first three properties;
/// an empty field between commas skips that property (`"1,,3"` overrides the
/// first and third). Fields that do not start with a digit or `-` are
/// ignored. Listing more fields than there are properties is an error.
pub fn parse_override_list(list: &str) -> Result<Vec<(PropertyKind, i64)>> {
    let bytes = list.as_bytes();
    let mut overrides = vec![];
    let mut index = 0;
    let mut wait_comma = false;
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos];

        if c == b',' {
            if !wait_comma {
                index += 1;
            }
            wait_comma = false;
        }

        if c.is_ascii_digit() || c == b'-' {
            if index >= PropertyKind::COUNT {
                return Err(Error::TooManyFields(list.to_owned()));
            }

            let (value, consumed) = parse_int_prefix(&list[pos..]);
            overrides.push((PropertyKind::ALL[index], value));
            wait_comma = true;
            index += 1;
            pos += consumed;
        } else {
            pos += 1;
        }
    }

    Ok(overrides)
}
