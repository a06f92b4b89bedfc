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

//! A PKCS#11 driver loaded from a shared library at runtime.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{LazyLock, Mutex, MutexGuard, PoisonError},
};

use cryptoki::{
    context::{CInitializeArgs, Function, Pkcs11},
    error::RvError,
    mechanism::Mechanism,
    object::{self as ck, ObjectHandle as CkObjectHandle},
    session::{Session, UserType},
    slot::Slot,
    types::AuthPin,
};
use pkcs11_hash_signer_core::attribute::{AttributeType, Attributes};
use tracing::{debug, instrument, warn};

use crate::{
    Error,
    Result,
    Rv,
    config::ThreadingMode,
    driver::{Driver, DriverLoader, ObjectHandle, SessionHandle, SlotId, SlotInfo},
    registry::{Initialization, LibraryRegistry},
    sessions::SessionKind,
};

/// Every library initialized by this process, shared between overlapping
/// requests for the same module path.
static LIBRARIES: LazyLock<LibraryRegistry<Pkcs11>> = LazyLock::new(Default::default);

/// The `C_Initialize` arguments for a threading mode: `CKF_OS_LOCKING_OK`
/// for multi-threaded callers, no arguments otherwise.
pub fn init_args(threading: ThreadingMode) -> CInitializeArgs {
    match threading {
        ThreadingMode::SingleThreaded => CInitializeArgs::NoThreads,
        ThreadingMode::MultiThreaded => CInitializeArgs::OsThreads,
    }
}

fn invalid(function: Function, rv: RvError) -> Error {
    Error::Function { function, rv: Rv(rv) }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Sessions {
    next_handle: SessionHandle,
    open: HashMap<SessionHandle, Session>,
}

/// A loaded and initialized driver. Dropping it closes any session still
/// open and releases the library, which is finalized and unloaded once no
/// other `Module` for the same path is alive.
pub struct Module {
    path: PathBuf,
    // `None` only while dropping.
    pkcs11: Option<Pkcs11>,
    slots: Vec<Slot>,
    sessions: Mutex<Sessions>,
    // Handles given out by searches; the index plus one is the public handle.
    objects: Mutex<Vec<CkObjectHandle>>,
}

impl Module {
    #[instrument]
    pub fn load(path: &Path, threading: ThreadingMode) -> Result<Self> {
        let pkcs11 = LIBRARIES.acquire(path, || open(path, threading))?;
        let mut module = Module {
            path: path.to_path_buf(),
            pkcs11: Some(pkcs11),
            slots: vec![],
            sessions: Mutex::default(),
            objects: Mutex::default(),
        };
        module.slots = module.pkcs11()?.get_all_slots()?;
        debug!(users = LIBRARIES.users(path), "module loaded");
        Ok(module)
    }

    fn pkcs11(&self) -> Result<&Pkcs11> {
        self.pkcs11.as_ref().ok_or(invalid(Function::Initialize, RvError::CryptokiNotInitialized))
    }

    fn slot(&self, id: SlotId) -> Result<Slot> {
        self.slots
            .iter()
            .copied()
            .find(|slot| slot.id() == id)
            .ok_or(invalid(Function::GetSlotInfo, RvError::SlotIdInvalid))
    }

    fn with_session<T>(
        &self,
        handle: SessionHandle,
        f: impl FnOnce(&Session) -> cryptoki::error::Result<T>,
    ) -> Result<T> {
        let sessions = lock(&self.sessions);
        let session = sessions
            .open
            .get(&handle)
            .ok_or(invalid(Function::GetSessionInfo, RvError::SessionHandleInvalid))?;
        Ok(f(session)?)
    }

    fn remember(&self, found: Vec<CkObjectHandle>) -> Vec<ObjectHandle> {
        let mut objects = lock(&self.objects);
        found
            .into_iter()
            .map(|handle| {
                let index = match objects.iter().position(|known| *known == handle) {
                    Some(index) => index,
                    None => {
                        objects.push(handle);
                        objects.len() - 1
                    }
                };
                index as ObjectHandle + 1
            })
            .collect()
    }

    fn object(&self, handle: ObjectHandle) -> Result<CkObjectHandle> {
        let objects = lock(&self.objects);
        handle
            .checked_sub(1)
            .and_then(|index| objects.get(index as usize))
            .copied()
            .ok_or(invalid(Function::GetAttributeValue, RvError::ObjectHandleInvalid))
    }
}

/// Loads and initializes the library for the first user of `path`.
fn open(path: &Path, threading: ThreadingMode) -> Result<Initialization<Pkcs11>> {
    let pkcs11 = Pkcs11::new(path)
        .map_err(|e| Error::ModuleLoad { path: path.to_path_buf(), source: Box::new(e) })?;
    match pkcs11.initialize(init_args(threading)) {
        Ok(()) => Ok(Initialization::Owned(pkcs11)),
        Err(cryptoki::error::Error::Pkcs11(RvError::CryptokiAlreadyInitialized, _)) => {
            warn!("module was already initialized in this process, leaving it initialized");
            Ok(Initialization::Joined(pkcs11))
        }
        Err(e) => Err(e.into()),
    }
}

impl Drop for Module {
    fn drop(&mut self) {
        // Sessions keep the library alive; close them before the release so
        // a last release finalizes under the registry lock.
        let open = std::mem::take(&mut lock(&self.sessions).open);
        if !open.is_empty() {
            warn!(count = open.len(), "closing sessions left open");
        }
        drop(open);
        if let Some(pkcs11) = self.pkcs11.take() {
            LIBRARIES.release(&self.path, pkcs11);
        }
    }
}

impl Driver for Module {
    fn slots_with_token(&self) -> Result<Vec<SlotId>> {
        Ok(self.pkcs11()?.get_slots_with_token()?.iter().map(Slot::id).collect())
    }

    fn slot_info(&self, slot: SlotId) -> Result<SlotInfo> {
        let info = self.pkcs11()?.get_slot_info(self.slot(slot)?)?;
        Ok(SlotInfo {
            description: info.slot_description().to_string(),
            token_present: info.token_present(),
        })
    }

    fn open_session(&self, slot: SlotId, kind: SessionKind) -> Result<SessionHandle> {
        let slot = self.slot(slot)?;
        let session = match kind {
            SessionKind::ReadOnly => self.pkcs11()?.open_ro_session(slot)?,
            SessionKind::ReadWrite => self.pkcs11()?.open_rw_session(slot)?,
        };
        let mut sessions = lock(&self.sessions);
        sessions.next_handle += 1;
        let handle = sessions.next_handle;
        sessions.open.insert(handle, session);
        Ok(handle)
    }

    fn close_session(&self, session: SessionHandle) -> Result<()> {
        let closed = lock(&self.sessions).open.remove(&session);
        match closed {
            // Dropping the session runs `C_CloseSession`.
            Some(closed) => {
                drop(closed);
                Ok(())
            }
            None => Err(invalid(Function::CloseSession, RvError::SessionHandleInvalid)),
        }
    }

    fn login(&self, session: SessionHandle, user_type: UserType, pin: &str) -> Result<()> {
        let pin = AuthPin::new(pin.into());
        self.with_session(session, |session| session.login(user_type, Some(&pin)))
    }

    fn logout(&self, session: SessionHandle) -> Result<()> {
        self.with_session(session, Session::logout)
    }

    fn find_all_objects(
        &self,
        session: SessionHandle,
        template: &Attributes,
    ) -> Result<Vec<ObjectHandle>> {
        let template = template.to_cryptoki();
        let found = self.with_session(session, |session| session.find_objects(&template))?;
        Ok(self.remember(found))
    }

    fn find_objects(
        &self,
        session: SessionHandle,
        template: &Attributes,
        max_objects: usize,
    ) -> Result<Vec<ObjectHandle>> {
        let Some(batch) = std::num::NonZeroUsize::new(max_objects) else {
            return Ok(vec![]);
        };
        let template = template.to_cryptoki();
        // The iterator fetches `batch` handles per `C_FindObjects` and runs
        // `C_FindObjectsFinal` when dropped.
        let found = self.with_session(session, |session| {
            session
                .iter_objects_with_cache_size(&template, batch)?
                .take(max_objects)
                .collect::<cryptoki::error::Result<Vec<_>>>()
        })?;
        Ok(self.remember(found))
    }

    fn attribute_value(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attribute_type: AttributeType,
    ) -> Result<Option<Vec<u8>>> {
        let object = self.object(object)?;
        // Unreadable, sensitive and unavailable attributes are left out of
        // the result rather than failing the call.
        let attributes = self.with_session(session, |session| {
            session.get_attributes(object, &[attribute_type.into()])
        })?;
        let value = attributes.into_iter().find_map(|attribute| match attribute {
            ck::Attribute::Id(bytes) | ck::Attribute::Label(bytes) | ck::Attribute::Value(bytes) => {
                Some(bytes)
            }
            _ => None,
        });
        if value.is_none() {
            debug!(%attribute_type, "attribute not readable");
        }
        Ok(value)
    }

    fn sign(&self, session: SessionHandle, key: ObjectHandle, data: &[u8]) -> Result<Vec<u8>> {
        let key = self.object(key)?;
        self.with_session(session, |session| session.sign(&Mechanism::RsaPkcs, key, data))
    }
}

/// Loads drivers from shared libraries on disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModuleLoader;

impl DriverLoader for ModuleLoader {
    fn load(&self, module_path: &Path, threading: ThreadingMode) -> Result<Box<dyn Driver>> {
        Ok(Box::new(Module::load(module_path, threading)?))
    }
}
