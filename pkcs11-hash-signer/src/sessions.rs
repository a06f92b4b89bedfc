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

use cryptoki::session::UserType;
use pkcs11_hash_signer_core::Rv;
use tracing::{debug, warn};

use crate::{
    Error,
    Result,
    driver::{Driver, SessionHandle, SlotId},
};

/// Picks the first slot, in driver order, whose token is present.
pub fn first_usable_slot(driver: &dyn Driver) -> Result<SlotId> {
    for slot in driver.slots_with_token()? {
        match driver.slot_info(slot) {
            Ok(info) if info.token_present => {
                debug!(slot, description = %info.description, "using slot");
                return Ok(slot);
            }
            Ok(_) => debug!(slot, "skipping slot without a token"),
            Err(e) => debug!(slot, %e, "skipping slot with unreadable info"),
        }
    }
    Err(Error::DeviceUnavailable)
}

/// Sessions are always serial; read-write ones may also use the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    ReadOnly,
    ReadWrite,
}

/// An open session on a token.
///
/// Dropping the session logs out (if a login succeeded) and then closes it.
/// Neither failure is reported to the caller: by the time a session is
/// dropped the request has already produced its result.
pub struct TokenSession<'d> {
    driver: &'d dyn Driver,
    handle: SessionHandle,
    logged_in: bool,
}

impl<'d> TokenSession<'d> {
    pub fn open(driver: &'d dyn Driver, slot: SlotId, kind: SessionKind) -> Result<Self> {
        let handle = driver.open_session(slot, kind)?;
        debug!(slot, handle, ?kind, "opened session");
        Ok(Self { driver, handle, logged_in: false })
    }

    /// Logs in as the normal user. A rejection by the token is reported as
    /// `Error::AuthenticationFailure` with the driver's return value.
    pub fn login(&mut self, pin: &str) -> Result<()> {
        match self.driver.login(self.handle, UserType::User, pin) {
            Ok(()) => {
                self.logged_in = true;
                Ok(())
            }
            Err(e) => Err(match e.rv() {
                Some(rv) => Error::AuthenticationFailure(Rv(rv)),
                None => e,
            }),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn driver(&self) -> &'d dyn Driver {
        self.driver
    }

    pub fn is_logged_in(&self) -> bool {
        self.logged_in
    }
}

impl Drop for TokenSession<'_> {
    fn drop(&mut self) {
        if self.logged_in {
            if let Err(e) = self.driver.logout(self.handle) {
                warn!(handle = self.handle, %e, "logout failed");
            }
        }
        if let Err(e) = self.driver.close_session(self.handle) {
            warn!(handle = self.handle, %e, "failed to close session");
        }
    }
}
