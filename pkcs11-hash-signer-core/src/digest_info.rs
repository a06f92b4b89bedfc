// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! PKCS#1 v1.5 `DigestInfo` encoding for hashes computed outside the token.
//!
//! `CKM_RSA_PKCS` pads and transforms whatever it is given, so a caller that
//! hashed the document itself must hand it the DER structure
//!
//! ```text
//! DigestInfo ::= SEQUENCE {
//!     digestAlgorithm AlgorithmIdentifier,
//!     digest OCTET STRING
//! }
//! ```
//!
//! Everything up to the digest bytes is fixed per algorithm, so the encoding
//! is a table lookup followed by a concatenation.

use pkcs11_hash_signer_traits::HashAlgorithm;
use strum_macros::EnumIter;
use tracing::warn;

use crate::{Error, Result};

const SHA1_PREFIX: &[u8] = &[
    0x30, 0x21, 0x30, 0x09, 0x06, 0x05, 0x2B, 0x0E, 0x03, 0x02, 0x1A, 0x05, 0x00, 0x04, 0x14,
];
const SHA256_PREFIX: &[u8] = &[
    0x30, 0x31, 0x30, 0x0D, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01, 0x05,
    0x00, 0x04, 0x20,
];
const SHA384_PREFIX: &[u8] = &[
    0x30, 0x41, 0x30, 0x0D, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02, 0x05,
    0x00, 0x04, 0x30,
];
const SHA512_PREFIX: &[u8] = &[
    0x30, 0x51, 0x30, 0x0D, 0x06, 0x09, 0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03, 0x05,
    0x00, 0x04, 0x40,
];

/// The subset of [`HashAlgorithm`] that has a DigestInfo encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn prefix(&self) -> &'static [u8] {
        match self {
            DigestAlgorithm::Sha1 => SHA1_PREFIX,
            DigestAlgorithm::Sha256 => SHA256_PREFIX,
            DigestAlgorithm::Sha384 => SHA384_PREFIX,
            DigestAlgorithm::Sha512 => SHA512_PREFIX,
        }
    }
}

impl TryFrom<HashAlgorithm> for DigestAlgorithm {
    type Error = Error;

    fn try_from(value: HashAlgorithm) -> Result<Self> {
        match value {
            HashAlgorithm::Sha1 => Ok(DigestAlgorithm::Sha1),
            HashAlgorithm::Sha256 => Ok(DigestAlgorithm::Sha256),
            HashAlgorithm::Sha384 => Ok(DigestAlgorithm::Sha384),
            HashAlgorithm::Sha512 => Ok(DigestAlgorithm::Sha512),
            HashAlgorithm::Md5 | HashAlgorithm::Sha224 => {
                Err(Error::UnsupportedAlgorithm(value.to_string()))
            }
        }
    }
}

impl From<DigestAlgorithm> for HashAlgorithm {
    fn from(value: DigestAlgorithm) -> Self {
        match value {
            DigestAlgorithm::Sha1 => HashAlgorithm::Sha1,
            DigestAlgorithm::Sha256 => HashAlgorithm::Sha256,
            DigestAlgorithm::Sha384 => HashAlgorithm::Sha384,
            DigestAlgorithm::Sha512 => HashAlgorithm::Sha512,
        }
    }
}

/// Builds `prefix(algorithm) || hash`. No hashing happens here.
pub fn encode(algorithm: HashAlgorithm, hash: &[u8]) -> Result<Vec<u8>> {
    let prefix = DigestAlgorithm::try_from(algorithm)?.prefix();
    if hash.is_empty() {
        return Err(Error::EmptyHash);
    }
    // The prefix commits to the digest length; a mismatch still encodes but
    // the token will produce a signature no verifier accepts.
    if hash.len() != algorithm.digest_len() {
        warn!(
            %algorithm,
            expected = algorithm.digest_len(),
            actual = hash.len(),
            "hash length does not match algorithm"
        );
    }
    let mut digest_info = Vec::with_capacity(prefix.len() + hash.len());
    digest_info.extend_from_slice(prefix);
    digest_info.extend_from_slice(hash);
    Ok(digest_info)
}
