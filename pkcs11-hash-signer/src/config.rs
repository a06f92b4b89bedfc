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

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use zeroize::Zeroizing;

use crate::{Error, Result};

pub const MODULE_ENV: &str = "PKCS11_HASH_SIGNER_MODULE";
pub const PIN_ENV: &str = "PKCS11_HASH_SIGNER_PIN";
pub const THREADING_ENV: &str = "PKCS11_HASH_SIGNER_THREADING";

/// How the driver is told to handle locking in `C_Initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadingMode {
    /// No initialization arguments; the driver may assume a single caller.
    SingleThreaded,
    /// `CKF_OS_LOCKING_OK`; the driver uses native OS locking.
    #[default]
    MultiThreaded,
}

impl FromStr for ThreadingMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" | "single-threaded" => Ok(ThreadingMode::SingleThreaded),
            "multi" | "multi-threaded" => Ok(ThreadingMode::MultiThreaded),
            other => Err(Error::Configuration(format!("unknown threading mode {other:?}"))),
        }
    }
}

/// Where the driver lives and how to authenticate to its token.
#[derive(Clone)]
pub struct SignerConfig {
    module_path: PathBuf,
    pin: Zeroizing<String>,
    threading: ThreadingMode,
}

impl SignerConfig {
    pub fn new(module_path: impl Into<PathBuf>, pin: impl Into<String>) -> Result<Self> {
        let module_path = module_path.into();
        if module_path.as_os_str().is_empty() {
            return Err(Error::Configuration("module path must not be empty".into()));
        }
        let pin: Zeroizing<String> = Zeroizing::new(pin.into());
        if pin.is_empty() {
            return Err(Error::Configuration("PIN must not be empty".into()));
        }
        Ok(Self { module_path, pin, threading: Default::default() })
    }

    pub fn with_threading(mut self, threading: ThreadingMode) -> Self {
        self.threading = threading;
        self
    }

    /// Reads the configuration from `PKCS11_HASH_SIGNER_MODULE`,
    /// `PKCS11_HASH_SIGNER_PIN` and, optionally, `PKCS11_HASH_SIGNER_THREADING`.
    pub fn from_env() -> Result<Self> {
        let required = |name: &str| {
            std::env::var(name).map_err(|e| Error::Configuration(format!("{name}: {e}")))
        };
        let config = Self::new(required(MODULE_ENV)?, required(PIN_ENV)?)?;
        match std::env::var(THREADING_ENV) {
            Ok(threading) => Ok(config.with_threading(threading.parse()?)),
            Err(std::env::VarError::NotPresent) => Ok(config),
            Err(e) => Err(Error::Configuration(format!("{THREADING_ENV}: {e}"))),
        }
    }

    pub fn module_path(&self) -> &Path {
        &self.module_path
    }

    pub fn pin(&self) -> &str {
        &self.pin
    }

    pub fn threading(&self) -> ThreadingMode {
        self.threading
    }
}

impl fmt::Debug for SignerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerConfig")
            .field("module_path", &self.module_path)
            .field("pin", &"<redacted>")
            .field("threading", &self.threading)
            .finish()
    }
}
