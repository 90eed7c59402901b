/*
 * SPDX-FileCopyrightText: 2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! Verified-boot structures: packed public keys, keyblocks, and firmware
//! preambles. A "slot" is a keyblock immediately followed by a preamble at
//! the start of a VBLOCK section.

use std::mem;

use rsa::{BigUint, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;
use zerocopy::{little_endian, FromBytes, FromZeros, IntoBytes};
use zerocopy_derive::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const KEYBLOCK_MAGIC: [u8; 8] = *b"CHROMEOS";
pub const KEYBLOCK_VERSION_MAJOR: u32 = 2;
pub const KEYBLOCK_VERSION_MINOR: u32 = 1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Packed key {0:?} field exceeds blob bounds")]
    KeyOutOfBounds(&'static str),
    #[error("Signature algorithm not supported: {0:?}")]
    UnsupportedAlgorithm(SignatureAlgorithm),
    #[error("Incorrect key size ({key_size} bytes) for algorithm {algo:?} ({} bytes)", algo.key_len())]
    IncorrectKeySize {
        key_size: usize,
        algo: SignatureAlgorithm,
    },
    #[error("{0} byte section is too small for keyblock and preamble")]
    SectionTooSmall(usize),
    #[error("Invalid keyblock size: {0}")]
    InvalidKeyblockSize(u32),
    #[error("Keyblock is not signed")]
    NotSigned,
    #[error("Keyblock signature exceeds keyblock bounds")]
    SignatureOutOfBounds,
    #[error("RSA public key rejected")]
    RsaKey(#[source] rsa::Error),
    #[error("Failed to RSA sign digest")]
    RsaSign(#[source] rsa::Error),
    #[error("Failed to RSA verify signature")]
    RsaVerify(#[source] rsa::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SignatureAlgorithm {
    Rsa2048Sha256,
    Rsa4096Sha256,
    Rsa8192Sha256,
    Unknown(u32),
}

impl SignatureAlgorithm {
    pub fn from_raw(value: u32) -> Self {
        match value {
            4 => Self::Rsa2048Sha256,
            7 => Self::Rsa4096Sha256,
            11 => Self::Rsa8192Sha256,
            v => Self::Unknown(v),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            Self::Rsa2048Sha256 => 4,
            Self::Rsa4096Sha256 => 7,
            Self::Rsa8192Sha256 => 11,
            Self::Unknown(v) => v,
        }
    }

    /// Size of the packed key data (the big-endian modulus).
    pub fn key_len(self) -> usize {
        match self {
            Self::Rsa2048Sha256 => 2048 / 8,
            Self::Rsa4096Sha256 => 4096 / 8,
            Self::Rsa8192Sha256 => 8192 / 8,
            Self::Unknown(_) => 0,
        }
    }

    pub fn signature_len(self) -> usize {
        self.key_len()
    }

    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        Sha256::digest(data).to_vec()
    }

    pub fn sign(self, key: &RsaPrivateKey, digest: &[u8]) -> Result<Vec<u8>> {
        let scheme = Pkcs1v15Sign::new::<Sha256>();
        key.sign(scheme, digest).map_err(Error::RsaSign)
    }

    pub fn verify(self, key: &RsaPublicKey, digest: &[u8], signature: &[u8]) -> Result<()> {
        let scheme = Pkcs1v15Sign::new::<Sha256>();
        key.verify(scheme, digest, signature)
            .map_err(Error::RsaVerify)
    }
}

/// Raw on-disk layout for a signature reference. Offsets are relative to the
/// start of this structure.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawSignature {
    sig_offset: little_endian::U32,
    reserved0: little_endian::U32,
    sig_size: little_endian::U32,
    reserved1: little_endian::U32,
    data_size: little_endian::U32,
    reserved2: little_endian::U32,
}

/// Raw on-disk layout for a packed public key. The key data offset is
/// relative to the start of this structure.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawPackedKey {
    key_offset: little_endian::U32,
    reserved0: little_endian::U32,
    key_size: little_endian::U32,
    reserved1: little_endian::U32,
    algorithm: little_endian::U32,
    reserved2: little_endian::U32,
    key_version: little_endian::U32,
    reserved3: little_endian::U32,
}

/// Raw on-disk layout for the keyblock header.
#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawKeyblock {
    /// Magic value. This should be equal to [`KEYBLOCK_MAGIC`].
    magic: [u8; 8],
    header_version_major: little_endian::U32,
    header_version_minor: little_endian::U32,
    keyblock_size: little_endian::U32,
    reserved0: little_endian::U32,
    keyblock_signature: RawSignature,
    keyblock_hash: RawSignature,
    keyblock_flags: little_endian::U32,
    reserved1: little_endian::U32,
    data_key: RawPackedKey,
}

/// Raw on-disk layout for the firmware preamble that immediately follows a
/// keyblock.
#[derive(Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(packed)]
struct RawFwPreamble {
    preamble_size: little_endian::U32,
    reserved0: little_endian::U32,
    preamble_signature: RawSignature,
    firmware_version: little_endian::U32,
    reserved1: little_endian::U32,
    kernel_subkey: RawPackedKey,
    body_signature: RawSignature,
    flags: little_endian::U32,
}

pub const KEYBLOCK_SIZE: usize = mem::size_of::<RawKeyblock>();
pub const PREAMBLE_SIZE: usize = mem::size_of::<RawFwPreamble>();

const KEYBLOCK_SIG_OFFSET: usize = mem::offset_of!(RawKeyblock, keyblock_signature);
const DATA_KEY_OFFSET: usize = mem::offset_of!(RawKeyblock, data_key);

/// A validated packed public key, borrowing the key data from the blob it was
/// parsed from.
#[derive(Clone, Copy, Debug)]
pub struct PackedKey<'a> {
    pub algorithm: SignatureAlgorithm,
    pub key_version: u32,
    pub data: &'a [u8],
}

impl<'a> PackedKey<'a> {
    /// Parse a packed key whose header starts at the beginning of `blob`.
    pub fn parse(blob: &'a [u8]) -> Result<Self> {
        let (raw, _) =
            RawPackedKey::read_from_prefix(blob).map_err(|_| Error::KeyOutOfBounds("header"))?;

        let offset = raw.key_offset.get() as usize;
        let size = raw.key_size.get() as usize;

        if offset < mem::size_of::<RawPackedKey>() {
            return Err(Error::KeyOutOfBounds("key_offset"));
        }
        let end = offset.checked_add(size).ok_or(Error::KeyOutOfBounds("key_size"))?;
        if end > blob.len() {
            return Err(Error::KeyOutOfBounds("key_size"));
        }

        let algorithm = SignatureAlgorithm::from_raw(raw.algorithm.get());
        if let SignatureAlgorithm::Unknown(_) = algorithm {
            return Err(Error::UnsupportedAlgorithm(algorithm));
        }
        if size != algorithm.key_len() {
            return Err(Error::IncorrectKeySize {
                key_size: size,
                algo: algorithm,
            });
        }

        Ok(Self {
            algorithm,
            key_version: raw.key_version.get(),
            data: &blob[offset..end],
        })
    }

    pub fn to_public_key(&self) -> Result<RsaPublicKey> {
        RsaPublicKey::new(
            BigUint::from_bytes_be(self.data),
            BigUint::from(65537u32),
        )
        .map_err(Error::RsaKey)
    }

    /// SHA-1 fingerprint of the key data, for diagnostics.
    pub fn sha1_hex(&self) -> String {
        hex::encode(Sha1::digest(self.data))
    }

    /// Whether two packed keys carry the same key material.
    pub fn same_key(&self, other: &PackedKey) -> bool {
        self.algorithm == other.algorithm && self.data == other.data
    }
}

/// A keyblock view over a VBLOCK section. The preamble that follows it is
/// reachable through [`Keyblock::firmware_version`].
#[derive(Clone, Copy, Debug)]
pub struct Keyblock<'a> {
    section: &'a [u8],
    raw: RawKeyblock,
}

impl<'a> Keyblock<'a> {
    /// Parse the keyblock at the start of a VBLOCK section. The section must
    /// be large enough to also hold the firmware preamble that follows the
    /// keyblock.
    pub fn parse(section: &'a [u8]) -> Result<Self> {
        if section.len() < KEYBLOCK_SIZE + PREAMBLE_SIZE {
            return Err(Error::SectionTooSmall(section.len()));
        }

        let (raw, _) = RawKeyblock::read_from_prefix(section)
            .map_err(|_| Error::SectionTooSmall(section.len()))?;

        let size = raw.keyblock_size.get();
        if (size as usize) < KEYBLOCK_SIZE
            || size as usize + PREAMBLE_SIZE > section.len()
        {
            return Err(Error::InvalidKeyblockSize(size));
        }

        Ok(Self { section, raw })
    }

    pub fn size(&self) -> u32 {
        self.raw.keyblock_size.get()
    }

    pub fn data_key_version(&self) -> u32 {
        self.raw.data_key.key_version.get()
    }

    /// Firmware version from the preamble following this keyblock.
    pub fn firmware_version(&self) -> Result<u32> {
        let offset = self.raw.keyblock_size.get() as usize;
        let (preamble, _) = RawFwPreamble::read_from_prefix(&self.section[offset..])
            .map_err(|_| Error::SectionTooSmall(self.section.len()))?;

        Ok(preamble.firmware_version.get())
    }

    /// Verify the keyblock signature against `key`. Verification operates on
    /// a fresh copy of the keyblock bytes; verifiers may clobber the
    /// signature in place.
    pub fn verify(&self, key: &PackedKey) -> Result<()> {
        let sig = self.raw.keyblock_signature;
        let sig_size = sig.sig_size.get() as usize;
        let data_size = sig.data_size.get() as usize;
        let keyblock_size = self.raw.keyblock_size.get() as usize;

        if sig_size == 0 {
            return Err(Error::NotSigned);
        }

        let sig_start = KEYBLOCK_SIG_OFFSET
            .checked_add(sig.sig_offset.get() as usize)
            .ok_or(Error::SignatureOutOfBounds)?;
        let sig_end = sig_start
            .checked_add(sig_size)
            .ok_or(Error::SignatureOutOfBounds)?;
        if sig_end > keyblock_size || data_size > keyblock_size {
            return Err(Error::SignatureOutOfBounds);
        }

        let copy = self.section[..keyblock_size].to_vec();
        let digest = key.algorithm.hash(&copy[..data_size]);
        let public_key = key.to_public_key()?;

        key.algorithm
            .verify(&public_key, &digest, &copy[sig_start..sig_end])
    }
}

/// Read the data-key version and firmware version from a VBLOCK section.
pub fn key_versions(section: &[u8]) -> Result<(u32, u32)> {
    let keyblock = Keyblock::parse(section)?;
    let firmware_version = keyblock.firmware_version()?;

    Ok((keyblock.data_key_version(), firmware_version))
}

/// Serialize a packed key for the given RSA public key. The key data is the
/// big-endian modulus; the exponent is fixed at 65537.
pub fn pack_key(
    key: &RsaPublicKey,
    algorithm: SignatureAlgorithm,
    key_version: u32,
) -> Vec<u8> {
    use rsa::traits::PublicKeyParts;

    let mut modulus = key.n().to_bytes_be();
    // Left pad in case the modulus has leading zero bytes.
    while modulus.len() < algorithm.key_len() {
        modulus.insert(0, 0);
    }

    let raw = RawPackedKey {
        key_offset: (mem::size_of::<RawPackedKey>() as u32).into(),
        reserved0: 0.into(),
        key_size: (modulus.len() as u32).into(),
        reserved1: 0.into(),
        algorithm: algorithm.to_raw().into(),
        reserved2: 0.into(),
        key_version: key_version.into(),
        reserved3: 0.into(),
    };

    let mut blob = raw.as_bytes().to_vec();
    blob.extend_from_slice(&modulus);
    blob
}

/// Build a signed (keyblock, preamble) slot for a VBLOCK section. The data
/// key is embedded with `data_key_version` and the keyblock is signed with
/// `signing_key`, which must match `algorithm`.
pub fn build_slot(
    signing_key: &RsaPrivateKey,
    algorithm: SignatureAlgorithm,
    data_key_version: u32,
    firmware_version: u32,
) -> Result<Vec<u8>> {
    let modulus_len = algorithm.key_len();
    let sig_len = algorithm.signature_len();
    let data_size = KEYBLOCK_SIZE + modulus_len;
    let keyblock_size = data_size + sig_len;

    let raw = RawKeyblock {
        magic: KEYBLOCK_MAGIC,
        header_version_major: KEYBLOCK_VERSION_MAJOR.into(),
        header_version_minor: KEYBLOCK_VERSION_MINOR.into(),
        keyblock_size: (keyblock_size as u32).into(),
        reserved0: 0.into(),
        keyblock_signature: RawSignature {
            sig_offset: ((data_size - KEYBLOCK_SIG_OFFSET) as u32).into(),
            reserved0: 0.into(),
            sig_size: (sig_len as u32).into(),
            reserved1: 0.into(),
            data_size: (data_size as u32).into(),
            reserved2: 0.into(),
        },
        keyblock_hash: RawSignature::new_zeroed(),
        keyblock_flags: 0.into(),
        reserved1: 0.into(),
        data_key: RawPackedKey {
            key_offset: ((KEYBLOCK_SIZE - DATA_KEY_OFFSET) as u32).into(),
            reserved0: 0.into(),
            key_size: (modulus_len as u32).into(),
            reserved1: 0.into(),
            algorithm: algorithm.to_raw().into(),
            reserved2: 0.into(),
            key_version: data_key_version.into(),
            reserved3: 0.into(),
        },
    };

    let mut blob = raw.as_bytes().to_vec();

    let public_key = signing_key.to_public_key();
    let packed = pack_key(&public_key, algorithm, data_key_version);
    blob.extend_from_slice(&packed[mem::size_of::<RawPackedKey>()..]);

    let digest = algorithm.hash(&blob[..data_size]);
    let signature = algorithm.sign(signing_key, &digest)?;
    blob.extend_from_slice(&signature);

    let preamble = RawFwPreamble {
        preamble_size: (PREAMBLE_SIZE as u32).into(),
        reserved0: 0.into(),
        preamble_signature: RawSignature::new_zeroed(),
        firmware_version: firmware_version.into(),
        reserved1: 0.into(),
        kernel_subkey: RawPackedKey::new_zeroed(),
        body_signature: RawSignature::new_zeroed(),
        flags: 0.into(),
    };
    blob.extend_from_slice(preamble.as_bytes());

    Ok(blob)
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use assert_matches::assert_matches;

    use super::*;

    fn test_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap())
    }

    fn other_key() -> &'static RsaPrivateKey {
        static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
        KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap())
    }

    #[test]
    fn slot_round_trip() {
        let slot = build_slot(test_key(), SignatureAlgorithm::Rsa2048Sha256, 2, 4).unwrap();

        assert_eq!(key_versions(&slot).unwrap(), (2, 4));

        let packed = pack_key(
            &test_key().to_public_key(),
            SignatureAlgorithm::Rsa2048Sha256,
            2,
        );
        let root = PackedKey::parse(&packed).unwrap();

        let keyblock = Keyblock::parse(&slot).unwrap();
        keyblock.verify(&root).unwrap();
    }

    #[test]
    fn verify_rejects_wrong_key() {
        let slot = build_slot(test_key(), SignatureAlgorithm::Rsa2048Sha256, 1, 1).unwrap();
        let packed = pack_key(
            &other_key().to_public_key(),
            SignatureAlgorithm::Rsa2048Sha256,
            1,
        );
        let root = PackedKey::parse(&packed).unwrap();

        let keyblock = Keyblock::parse(&slot).unwrap();
        assert_matches!(keyblock.verify(&root), Err(Error::RsaVerify(_)));
    }

    #[test]
    fn verify_rejects_tampered_keyblock() {
        let mut slot = build_slot(test_key(), SignatureAlgorithm::Rsa2048Sha256, 1, 1).unwrap();
        // Bump the embedded data key version without re-signing.
        let off = DATA_KEY_OFFSET + mem::offset_of!(RawPackedKey, key_version);
        slot[off] ^= 1;

        let packed = pack_key(
            &test_key().to_public_key(),
            SignatureAlgorithm::Rsa2048Sha256,
            1,
        );
        let root = PackedKey::parse(&packed).unwrap();

        let keyblock = Keyblock::parse(&slot).unwrap();
        assert_matches!(keyblock.verify(&root), Err(Error::RsaVerify(_)));
    }

    #[test]
    fn unsigned_keyblock() {
        let mut slot = build_slot(test_key(), SignatureAlgorithm::Rsa2048Sha256, 1, 1).unwrap();
        let off = KEYBLOCK_SIG_OFFSET + mem::offset_of!(RawSignature, sig_size);
        slot[off..off + 4].copy_from_slice(&[0; 4]);

        let packed = pack_key(
            &test_key().to_public_key(),
            SignatureAlgorithm::Rsa2048Sha256,
            1,
        );
        let root = PackedKey::parse(&packed).unwrap();

        let keyblock = Keyblock::parse(&slot).unwrap();
        assert_matches!(keyblock.verify(&root), Err(Error::NotSigned));
    }

    #[test]
    fn section_too_small() {
        assert_matches!(
            Keyblock::parse(&[0u8; KEYBLOCK_SIZE]),
            Err(Error::SectionTooSmall(_))
        );
    }

    #[test]
    fn packed_key_sanity() {
        let mut packed = pack_key(
            &test_key().to_public_key(),
            SignatureAlgorithm::Rsa2048Sha256,
            1,
        );

        // Truncated key data.
        packed.truncate(packed.len() - 1);
        assert_matches!(PackedKey::parse(&packed), Err(Error::KeyOutOfBounds(_)));
    }
}
