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

use std::{fmt, str::FromStr};

use x509_cert::der::Decode;

pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Hash algorithms an external signing pipeline may ask for.
///
/// Not every variant can be signed: the DigestInfo table only covers the
/// SHA-1 and SHA-2 (256/384/512) families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn digest_len(&self) -> usize {
        match self {
            HashAlgorithm::Md5 => 16,
            HashAlgorithm::Sha1 => 20,
            HashAlgorithm::Sha224 => 28,
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Md5 => "MD5",
            HashAlgorithm::Sha1 => "SHA-1",
            HashAlgorithm::Sha224 => "SHA-224",
            HashAlgorithm::Sha256 => "SHA-256",
            HashAlgorithm::Sha384 => "SHA-384",
            HashAlgorithm::Sha512 => "SHA-512",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownHashAlgorithm(pub String);

impl fmt::Display for UnknownHashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown hash algorithm: {}", self.0)
    }
}

impl std::error::Error for UnknownHashAlgorithm {}

impl FromStr for HashAlgorithm {
    type Err = UnknownHashAlgorithm;

    /// Accepts both the canonical and hyphenated spelling, ignoring case:
    /// "SHA256", "sha-256" and "Sha256" all name the same algorithm.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized: String =
            s.trim().chars().filter(|c| *c != '-' && *c != '_').collect::<String>().to_uppercase();
        match normalized.as_str() {
            "MD5" => Ok(HashAlgorithm::Md5),
            "SHA1" => Ok(HashAlgorithm::Sha1),
            "SHA224" => Ok(HashAlgorithm::Sha224),
            "SHA256" => Ok(HashAlgorithm::Sha256),
            "SHA384" => Ok(HashAlgorithm::Sha384),
            "SHA512" => Ok(HashAlgorithm::Sha512),
            _ => Err(UnknownHashAlgorithm(s.to_string())),
        }
    }
}

/// Capability handed to a document-signing pipeline. The pipeline computes
/// the hash itself and embeds the returned bytes; the implementation only
/// produces the raw signature.
pub trait HashSigner {
    type Error: std::error::Error + Send + Sync + 'static;

    fn sign_hash(
        &self,
        hash: &[u8],
        algorithm: HashAlgorithm,
    ) -> std::result::Result<Vec<u8>, Self::Error>;
}

impl<T: HashSigner + ?Sized> HashSigner for &T {
    type Error = T::Error;

    fn sign_hash(
        &self,
        hash: &[u8],
        algorithm: HashAlgorithm,
    ) -> std::result::Result<Vec<u8>, Self::Error> {
        (**self).sign_hash(hash, algorithm)
    }
}

pub trait Certificate: Send + Sync + fmt::Debug {
    fn label(&self) -> String;
    fn to_der(&self) -> Vec<u8>;
    /// CKA_ID of the certificate object, used to pair it with its private key.
    fn id(&self) -> Option<Vec<u8>>;
}

pub trait CertificateExt: Certificate {
    fn issuer(&self) -> Result<Vec<u8>> {
        let der = self.to_der();
        let c = x509_cert::Certificate::from_der(&der)?;
        Ok(x509_cert::der::Encode::to_der(&c.tbs_certificate.issuer)?)
    }

    fn serial_number(&self) -> Result<Vec<u8>> {
        let der = self.to_der();
        let c = x509_cert::Certificate::from_der(&der)?;
        Ok(x509_cert::der::Encode::to_der(&c.tbs_certificate.serial_number)?)
    }

    fn subject(&self) -> Result<Vec<u8>> {
        let der = self.to_der();
        let c = x509_cert::Certificate::from_der(&der)?;
        Ok(x509_cert::der::Encode::to_der(&c.tbs_certificate.subject)?)
    }
}

impl<T: Certificate + ?Sized> CertificateExt for T {}

/// Random bytes shaped like a digest of `algorithm`, for tests that must not
/// depend on a particular hash value.
pub fn random_digest(algorithm: HashAlgorithm) -> Vec<u8> {
    use rand::Rng;
    let mut digest = vec![0; algorithm.digest_len()];
    rand::rng().fill(digest.as_mut_slice());
    digest
}
