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

use pkcs11_hash_signer_core::{Rv, RvError, digest_info};
use pkcs11_hash_signer_traits::{HashAlgorithm, HashSigner};
use tracing::{debug, error, instrument};

use crate::{
    Error,
    Result,
    config::SignerConfig,
    driver::{DriverLoader, ObjectHandle},
    locator::{self, TokenCertificate},
    module::ModuleLoader,
    sessions::{self, SessionKind, TokenSession},
};

/// Signs hashes computed elsewhere with the private key on a PKCS#11 token.
///
/// Every request loads the driver, opens and authenticates a session, signs,
/// and tears everything down again before returning. Overlapping requests
/// for the same module share its initialization; nothing else is shared.
///
/// Logging is left to the host; call [`crate::init_tracing`] to install the
/// crate's subscriber.
#[derive(Debug)]
pub struct ExternalHashSigner<L = ModuleLoader> {
    config: SignerConfig,
    loader: L,
}

impl ExternalHashSigner<ModuleLoader> {
    pub fn new(config: SignerConfig) -> Self {
        Self::with_loader(config, ModuleLoader)
    }
}

impl<L: DriverLoader> ExternalHashSigner<L> {
    pub fn with_loader(config: SignerConfig, loader: L) -> Self {
        Self { config, loader }
    }

    pub fn config(&self) -> &SignerConfig {
        &self.config
    }

    /// Returns the raw RSA PKCS#1 v1.5 signature over `DigestInfo(hash)`.
    #[instrument(
        skip(self, hash),
        fields(hash_len = hash.len(), module = %self.config.module_path().display())
    )]
    pub fn sign(&self, hash: &[u8], algorithm: HashAlgorithm) -> Result<Vec<u8>> {
        let result = self.sign_once(hash, algorithm);
        if let Err(e) = &result {
            error!(%e, "signing request failed");
        }
        result
    }

    fn sign_once(&self, hash: &[u8], algorithm: HashAlgorithm) -> Result<Vec<u8>> {
        let digest_info = digest_info::encode(algorithm, hash)?;

        let driver = self.loader.load(self.config.module_path(), self.config.threading())?;
        let slot = sessions::first_usable_slot(driver.as_ref())?;
        let mut session = TokenSession::open(driver.as_ref(), slot, SessionKind::ReadWrite)?;
        session.login(self.config.pin())?;
        let key = locator::find_private_key(&session)?;
        sign_digest_info(&session, key, &digest_info)
    }

    /// Reads the X.509 certificate stored on the token.
    #[instrument(skip(self), fields(module = %self.config.module_path().display()))]
    pub fn read_certificate(&self) -> Result<TokenCertificate> {
        let result = self.read_certificate_once();
        if let Err(e) = &result {
            error!(%e, "reading certificate failed");
        }
        result
    }

    fn read_certificate_once(&self) -> Result<TokenCertificate> {
        let driver = self.loader.load(self.config.module_path(), self.config.threading())?;
        let slot = sessions::first_usable_slot(driver.as_ref())?;
        let mut session = TokenSession::open(driver.as_ref(), slot, SessionKind::ReadOnly)?;
        session.login(self.config.pin())?;
        locator::find_certificate(&session)
    }
}

fn sign_digest_info(
    session: &TokenSession<'_>,
    key: ObjectHandle,
    digest_info: &[u8],
) -> Result<Vec<u8>> {
    let signature = session
        .driver()
        .sign(session.handle(), key, digest_info)
        .map_err(|e| match e.rv() {
            Some(rv) => Error::SigningFailure(Rv(rv)),
            None => e,
        })?;
    if signature.is_empty() {
        return Err(Error::SigningFailure(Rv(RvError::FunctionFailed)));
    }
    debug!(signature_len = signature.len(), "signed");
    Ok(signature)
}

impl<L: DriverLoader> HashSigner for ExternalHashSigner<L> {
    type Error = Error;

    fn sign_hash(&self, hash: &[u8], algorithm: HashAlgorithm) -> Result<Vec<u8>> {
        self.sign(hash, algorithm)
    }
}
