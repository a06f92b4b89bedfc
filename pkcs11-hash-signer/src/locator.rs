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

//! Finding the signing key and its certificate on a token.

use pkcs11_hash_signer_core::attribute::{
    Attribute,
    AttributeType,
    Attributes,
    CertificateType,
    ObjectClass,
};
use pkcs11_hash_signer_traits::Certificate;
use tracing::{debug, instrument};
use x509_cert::der::Decode;

use crate::{Error, Result, driver::ObjectHandle, sessions::TokenSession};

/// Upper bound on the handles returned by the sequential search.
pub const SEQUENTIAL_SEARCH_LIMIT: usize = 20;

/// Returns the objects matching `template`, in driver order.
///
/// Some drivers fail a complete search that drains every match; those are
/// retried with a single bounded `C_FindObjects` call.
pub fn find_objects(
    session: &TokenSession<'_>,
    template: &Attributes,
) -> Result<Vec<ObjectHandle>> {
    let driver = session.driver();
    match driver.find_all_objects(session.handle(), template) {
        Ok(objects) => Ok(objects),
        Err(e) => {
            debug!(%e, "complete search failed, retrying sequentially");
            driver.find_objects(session.handle(), template, SEQUENTIAL_SEARCH_LIMIT)
        }
    }
}

fn certificate_template() -> Attributes {
    vec![
        Attribute::Class(ObjectClass::Certificate),
        Attribute::CertificateType(CertificateType::X509),
    ]
    .into()
}

/// The `CKA_ID` of the first X.509 certificate on the token, if any.
/// Failures are logged and treated as "no identifier".
pub fn certificate_id(session: &TokenSession<'_>) -> Option<Vec<u8>> {
    let certificates = match find_objects(session, &certificate_template()) {
        Ok(certificates) => certificates,
        Err(e) => {
            debug!(%e, "certificate search failed");
            return None;
        }
    };
    let certificate = *certificates.first()?;
    match session.driver().attribute_value(session.handle(), certificate, AttributeType::Id) {
        Ok(Some(id)) if !id.is_empty() => Some(id),
        Ok(_) => None,
        Err(e) => {
            debug!(%e, certificate, "could not read certificate id");
            None
        }
    }
}

/// Selects the private key to sign with.
///
/// The preferred key is a private key with `CKA_SIGN` set whose `CKA_ID`
/// matches the certificate's. Tokens that omit either attribute are served by
/// a second search for any private key.
#[instrument(skip_all)]
pub fn find_private_key(session: &TokenSession<'_>) -> Result<ObjectHandle> {
    let mut template: Attributes =
        vec![Attribute::Class(ObjectClass::PrivateKey), Attribute::Sign(true)].into();
    if let Some(id) = certificate_id(session) {
        template.push(Attribute::Id(id));
    }
    let mut keys = find_objects(session, &template)?;
    if keys.is_empty() {
        debug!("no key matched the signing template, searching for any private key");
        keys = find_objects(session, &vec![Attribute::Class(ObjectClass::PrivateKey)].into())?;
    }
    // With several private keys the driver's order decides.
    let key = keys.first().copied().ok_or(Error::KeyNotFound)?;
    debug!(key, candidates = keys.len(), "selected private key");
    Ok(key)
}

/// An X.509 certificate read from the token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenCertificate {
    label: String,
    der: Vec<u8>,
    id: Option<Vec<u8>>,
}

impl Certificate for TokenCertificate {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn to_der(&self) -> Vec<u8> {
        self.der.clone()
    }

    fn id(&self) -> Option<Vec<u8>> {
        self.id.clone()
    }
}

/// Reads the first X.509 certificate on the token and checks that it parses.
#[instrument(skip_all)]
pub fn find_certificate(session: &TokenSession<'_>) -> Result<TokenCertificate> {
    let certificates = find_objects(session, &certificate_template())?;
    let object = *certificates.first().ok_or(Error::CertificateNotFound)?;
    let driver = session.driver();
    let der = driver
        .attribute_value(session.handle(), object, AttributeType::Value)?
        .ok_or(Error::Certificate("certificate has no value".into()))?;
    x509_cert::Certificate::from_der(&der).map_err(|e| Error::Certificate(e.to_string()))?;

    let label = match driver.attribute_value(session.handle(), object, AttributeType::Label) {
        Ok(Some(label)) => String::from_utf8_lossy(&label).into_owned(),
        Ok(None) => String::new(),
        Err(e) => {
            debug!(%e, "could not read certificate label");
            String::new()
        }
    };
    let id = driver
        .attribute_value(session.handle(), object, AttributeType::Id)
        .ok()
        .flatten()
        .filter(|id| !id.is_empty());
    Ok(TokenCertificate { label, der, id })
}
