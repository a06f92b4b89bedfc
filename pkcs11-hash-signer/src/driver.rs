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

use std::path::Path;

use cryptoki::session::UserType;
use pkcs11_hash_signer_core::attribute::{AttributeType, Attributes};

use crate::{Result, config::ThreadingMode, sessions::SessionKind};

pub type SlotId = u64;
pub type SessionHandle = u64;
pub type ObjectHandle = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub description: String,
    pub token_present: bool,
}

/// The PKCS#11 functions the signer relies on.
///
/// Errors are reported as `Error::Function` carrying the driver's return
/// value so callers can decide what a failure means in their context.
pub trait Driver {
    /// Slots that report a token, in driver order.
    fn slots_with_token(&self) -> Result<Vec<SlotId>>;
    fn slot_info(&self, slot: SlotId) -> Result<SlotInfo>;
    fn open_session(&self, slot: SlotId, kind: SessionKind) -> Result<SessionHandle>;
    fn close_session(&self, session: SessionHandle) -> Result<()>;
    fn login(&self, session: SessionHandle, user_type: UserType, pin: &str) -> Result<()>;
    fn logout(&self, session: SessionHandle) -> Result<()>;
    /// Returns every object matching `template`.
    fn find_all_objects(
        &self,
        session: SessionHandle,
        template: &Attributes,
    ) -> Result<Vec<ObjectHandle>>;
    /// Starts a search, pulls at most `max_objects` handles with one
    /// `C_FindObjects` call and finalizes the search.
    fn find_objects(
        &self,
        session: SessionHandle,
        template: &Attributes,
        max_objects: usize,
    ) -> Result<Vec<ObjectHandle>>;
    /// Reads one byte-valued attribute. `Ok(None)` means the object does not
    /// expose it.
    fn attribute_value(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attribute_type: AttributeType,
    ) -> Result<Option<Vec<u8>>>;
    /// `C_SignInit` with `CKM_RSA_PKCS` followed by `C_Sign`. The token pads
    /// and applies the key but does not hash, so `data` is a DigestInfo.
    fn sign(&self, session: SessionHandle, key: ObjectHandle, data: &[u8]) -> Result<Vec<u8>>;
}

/// Produces an initialized driver. Dropping the returned driver releases it;
/// the library is finalized once no other driver loaded from the same path
/// is alive.
pub trait DriverLoader {
    fn load(&self, module_path: &Path, threading: ThreadingMode) -> Result<Box<dyn Driver>>;
}
