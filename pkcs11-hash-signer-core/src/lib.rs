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

use std::{fmt, path::PathBuf};

pub use cryptoki::{context::Function, error::RvError};
use pkcs11_hash_signer_traits::UnknownHashAlgorithm;
use thiserror::Error;

pub mod attribute;
pub mod digest_info;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unsupported hash algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("hash must not be empty")]
    EmptyHash,

    #[error("no usable PKCS#11 slot found")]
    DeviceUnavailable,

    #[error("login rejected by the token: {0}")]
    AuthenticationFailure(Rv),

    #[error("no private key found on the token")]
    KeyNotFound,

    #[error("signing failed: {0}")]
    SigningFailure(Rv),

    #[error("no certificate found on the token")]
    CertificateNotFound,

    #[error("certificate on the token is malformed: {0}")]
    Certificate(String),

    // Driver errors.
    #[error("failed to load PKCS#11 module {}: {source}", path.display())]
    ModuleLoad {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("a required function is not provided by the PKCS#11 module")]
    FunctionNotSupported,

    #[error("{function:?} failed: {rv}")]
    Function { function: Function, rv: Rv },

    #[error(transparent)]
    Cryptoki(cryptoki::error::Error),
}

impl Error {
    /// The return value reported by the driver, if this error came from one.
    pub fn rv(&self) -> Option<RvError> {
        match self {
            Error::AuthenticationFailure(rv)
            | Error::SigningFailure(rv)
            | Error::Function { rv, .. } => Some(rv.0),
            _ => None,
        }
    }
}

impl From<cryptoki::error::Error> for Error {
    fn from(e: cryptoki::error::Error) -> Self {
        match e {
            cryptoki::error::Error::Pkcs11(rv, function) => Error::Function { function, rv: Rv(rv) },
            cryptoki::error::Error::NullFunctionPointer => Error::FunctionNotSupported,
            other => Error::Cryptoki(other),
        }
    }
}

impl From<UnknownHashAlgorithm> for Error {
    fn from(e: UnknownHashAlgorithm) -> Self {
        Error::UnsupportedAlgorithm(e.0)
    }
}

/// A driver return value that displays as its `CKR_*` name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rv(pub RvError);

impl Rv {
    pub fn name(&self) -> Option<&'static str> {
        let name = match self.0 {
            RvError::Cancel => "CKR_CANCEL",
            RvError::HostMemory => "CKR_HOST_MEMORY",
            RvError::SlotIdInvalid => "CKR_SLOT_ID_INVALID",
            RvError::GeneralError => "CKR_GENERAL_ERROR",
            RvError::FunctionFailed => "CKR_FUNCTION_FAILED",
            RvError::ArgumentsBad => "CKR_ARGUMENTS_BAD",
            RvError::AttributeSensitive => "CKR_ATTRIBUTE_SENSITIVE",
            RvError::AttributeTypeInvalid => "CKR_ATTRIBUTE_TYPE_INVALID",
            RvError::AttributeValueInvalid => "CKR_ATTRIBUTE_VALUE_INVALID",
            RvError::DataInvalid => "CKR_DATA_INVALID",
            RvError::DataLenRange => "CKR_DATA_LEN_RANGE",
            RvError::DeviceError => "CKR_DEVICE_ERROR",
            RvError::DeviceMemory => "CKR_DEVICE_MEMORY",
            RvError::DeviceRemoved => "CKR_DEVICE_REMOVED",
            RvError::FunctionCanceled => "CKR_FUNCTION_CANCELED",
            RvError::FunctionNotSupported => "CKR_FUNCTION_NOT_SUPPORTED",
            RvError::KeyHandleInvalid => "CKR_KEY_HANDLE_INVALID",
            RvError::KeySizeRange => "CKR_KEY_SIZE_RANGE",
            RvError::KeyTypeInconsistent => "CKR_KEY_TYPE_INCONSISTENT",
            RvError::KeyFunctionNotPermitted => "CKR_KEY_FUNCTION_NOT_PERMITTED",
            RvError::MechanismInvalid => "CKR_MECHANISM_INVALID",
            RvError::MechanismParamInvalid => "CKR_MECHANISM_PARAM_INVALID",
            RvError::ObjectHandleInvalid => "CKR_OBJECT_HANDLE_INVALID",
            RvError::OperationActive => "CKR_OPERATION_ACTIVE",
            RvError::OperationNotInitialized => "CKR_OPERATION_NOT_INITIALIZED",
            RvError::PinIncorrect => "CKR_PIN_INCORRECT",
            RvError::PinInvalid => "CKR_PIN_INVALID",
            RvError::PinLenRange => "CKR_PIN_LEN_RANGE",
            RvError::PinExpired => "CKR_PIN_EXPIRED",
            RvError::PinLocked => "CKR_PIN_LOCKED",
            RvError::SessionClosed => "CKR_SESSION_CLOSED",
            RvError::SessionCount => "CKR_SESSION_COUNT",
            RvError::SessionHandleInvalid => "CKR_SESSION_HANDLE_INVALID",
            RvError::SessionParallelNotSupported => "CKR_SESSION_PARALLEL_NOT_SUPPORTED",
            RvError::SessionReadOnly => "CKR_SESSION_READ_ONLY",
            RvError::TemplateIncomplete => "CKR_TEMPLATE_INCOMPLETE",
            RvError::TemplateInconsistent => "CKR_TEMPLATE_INCONSISTENT",
            RvError::TokenNotPresent => "CKR_TOKEN_NOT_PRESENT",
            RvError::TokenNotRecognized => "CKR_TOKEN_NOT_RECOGNIZED",
            RvError::UserAlreadyLoggedIn => "CKR_USER_ALREADY_LOGGED_IN",
            RvError::UserNotLoggedIn => "CKR_USER_NOT_LOGGED_IN",
            RvError::UserPinNotInitialized => "CKR_USER_PIN_NOT_INITIALIZED",
            RvError::UserTypeInvalid => "CKR_USER_TYPE_INVALID",
            RvError::BufferTooSmall => "CKR_BUFFER_TOO_SMALL",
            RvError::CryptokiNotInitialized => "CKR_CRYPTOKI_NOT_INITIALIZED",
            RvError::CryptokiAlreadyInitialized => "CKR_CRYPTOKI_ALREADY_INITIALIZED",
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for Rv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{:?}", self.0),
        }
    }
}
