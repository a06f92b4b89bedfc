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

//! Signs hashes computed outside a PKCS#11 token with an RSA private key held
//! on the token.
//!
//! ```no_run
//! use pkcs11_hash_signer::{ExternalHashSigner, HashAlgorithm, SignerConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! pkcs11_hash_signer::init_tracing();
//! let config = SignerConfig::new("/usr/lib/softhsm/libsofthsm2.so", "1234")?;
//! let signer = ExternalHashSigner::new(config);
//! let signature = signer.sign(&[0; 32], HashAlgorithm::Sha256)?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_op_in_unsafe_fn)]

use std::sync::Once;

pub use pkcs11_hash_signer_core::{Error, Result, Rv};
pub use pkcs11_hash_signer_traits::{Certificate, CertificateExt, HashAlgorithm, HashSigner};
use tracing::metadata::LevelFilter;
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, Registry, fmt::format::FmtSpan, prelude::*};

pub mod config;
pub mod driver;
pub mod locator;
pub mod module;
mod registry;
pub mod sessions;
mod signer;

#[cfg(test)]
mod fake_driver;

pub use config::{SignerConfig, ThreadingMode};
pub use locator::TokenCertificate;
pub use signer::ExternalHashSigner;

/// Set to log to stderr even when journald is available.
pub const LOG_STDERR_ENV: &str = "PKCS11_HASH_SIGNER_LOG_STDERR";

static TRACING_INIT: Once = Once::new();

/// Installs the global subscriber once per process. Does nothing if the host
/// application already installed its own. Hosts that route logs elsewhere
/// never need to call it.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let env_filter =
            EnvFilter::builder().with_default_directive(LevelFilter::WARN.into()).from_env_lossy();
        if std::env::var(LOG_STDERR_ENV).is_err() {
            if let Ok(journald_layer) = tracing_journald::layer() {
                _ = Registry::default()
                    .with(journald_layer.with_syslog_identifier("pkcs11-hash-signer".into()))
                    .with(env_filter)
                    .with(ErrorLayer::default())
                    .try_init();
                return;
            }
        }
        _ = Registry::default()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_span_events(FmtSpan::ENTER),
            )
            .with(env_filter)
            .with(ErrorLayer::default())
            .try_init();
    });
}
