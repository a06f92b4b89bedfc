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

//! An in-memory token that records every call made to it.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use cryptoki::session::UserType;
use pkcs11_hash_signer_core::{
    Function,
    Rv,
    RvError,
    attribute::{Attribute, AttributeType, Attributes, CertificateType, ObjectClass},
};

use crate::{
    Error,
    Result,
    config::ThreadingMode,
    driver::{Driver, DriverLoader, ObjectHandle, SessionHandle, SlotId, SlotInfo},
    registry::{Initialization, LibraryRegistry},
    sessions::SessionKind,
};

pub const TEST_CERTIFICATE: &[u8] = include_bytes!("../tests/data/token-cert.der");

/// The module path every fake driver is loaded from.
pub const FAKE_MODULE: &str = "/opt/token/libpkcs11.so";

/// Handles requested per `C_FindObjects` call by a complete search.
const FIND_ALL_BATCH: usize = 10;

fn failed(function: Function, rv: RvError) -> Error {
    Error::Function { function, rv: Rv(rv) }
}

#[derive(Debug, Clone)]
pub struct FakeObject {
    pub handle: ObjectHandle,
    attributes: Vec<Attribute>,
}

impl FakeObject {
    pub fn private_key(handle: ObjectHandle) -> Self {
        Self {
            handle,
            attributes: vec![Attribute::Class(ObjectClass::PrivateKey), Attribute::Sign(true)],
        }
    }

    pub fn certificate(handle: ObjectHandle, der: &[u8]) -> Self {
        Self {
            handle,
            attributes: vec![
                Attribute::Class(ObjectClass::Certificate),
                Attribute::CertificateType(CertificateType::X509),
                Attribute::Value(der.to_vec()),
            ],
        }
    }

    pub fn with(mut self, attribute: Attribute) -> Self {
        let attribute_type = attribute.attribute_type();
        self.attributes.retain(|a| a.attribute_type() != attribute_type);
        self.attributes.push(attribute);
        self
    }

    pub fn without(mut self, attribute_type: AttributeType) -> Self {
        self.attributes.retain(|a| a.attribute_type() != attribute_type);
        self
    }

    fn bytes(&self, attribute_type: AttributeType) -> Option<Vec<u8>> {
        match self.attributes.iter().find(|a| a.attribute_type() == attribute_type)? {
            Attribute::Id(bytes) | Attribute::Value(bytes) => Some(bytes.clone()),
            Attribute::Label(label) => Some(label.as_bytes().to_vec()),
            _ => None,
        }
    }

    fn matches(&self, template: &Attributes) -> bool {
        template.iter().all(|attribute| self.attributes.contains(attribute))
    }

    fn is_private(&self) -> bool {
        self.attributes.contains(&Attribute::Class(ObjectClass::PrivateKey))
    }
}

/// What the fake token holds and how it misbehaves.
#[derive(Debug, Clone)]
pub struct FakeToken {
    /// `(slot, token present)` in the order the driver reports them.
    pub slots: Vec<(SlotId, bool)>,
    pub unreadable_slots: Vec<SlotId>,
    /// Listed with a token, but the token is gone by `C_GetSlotInfo`.
    pub removed_after_listing: Vec<SlotId>,
    pub objects: Vec<FakeObject>,
    pub load_fails: bool,
    pub already_initialized: bool,
    pub batched_search_fails: bool,
    pub logout_rv: Option<RvError>,
    pub sign_rv: Option<RvError>,
    pub empty_signature: bool,
}

impl FakeToken {
    pub const PIN: &str = "1234";

    pub fn with_objects(objects: Vec<FakeObject>) -> Self {
        Self { objects, ..Self::default() }
    }
}

impl Default for FakeToken {
    fn default() -> Self {
        Self {
            slots: vec![(1, true)],
            unreadable_slots: vec![],
            removed_after_listing: vec![],
            objects: vec![],
            load_fails: false,
            already_initialized: false,
            batched_search_fails: false,
            logout_rv: None,
            sign_rv: None,
            empty_signature: false,
        }
    }
}

#[derive(Debug, Default)]
struct FakeSession {
    logged_in: bool,
}

#[derive(Debug)]
pub struct FakeState {
    pub token: FakeToken,
    calls: Vec<&'static str>,
    sessions: HashMap<SessionHandle, FakeSession>,
    next_handle: SessionHandle,
    pub loads: usize,
    pub unloads: usize,
    pub initializes: usize,
    pub finalizes: usize,
    /// The threading mode requested by each load.
    pub threading: Vec<ThreadingMode>,
    pub opened_on: Vec<SlotId>,
    pub session_kinds: Vec<SessionKind>,
    pub find_limits: Vec<usize>,
    pub templates: Vec<Attributes>,
    pub signed: Vec<(ObjectHandle, Vec<u8>)>,
}

impl FakeState {
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn calls(&self) -> &[&'static str] {
        &self.calls
    }

    pub fn calls_to(&self, function: &str) -> usize {
        self.calls.iter().filter(|c| **c == function).count()
    }

    /// Whether the first call to `first` precedes the last call to `then`.
    pub fn called_before(&self, first: &str, then: &str) -> bool {
        match (
            self.calls.iter().position(|c| *c == first),
            self.calls.iter().rposition(|c| *c == then),
        ) {
            (Some(a), Some(b)) => a < b,
            _ => false,
        }
    }

    fn session(&mut self, handle: SessionHandle) -> Result<&mut FakeSession> {
        self.sessions
            .get_mut(&handle)
            .ok_or(failed(Function::GetSessionInfo, RvError::SessionHandleInvalid))
    }

    fn visible_object(&self, handle: ObjectHandle, logged_in: bool) -> Option<&FakeObject> {
        self.token.objects.iter().find(|o| o.handle == handle && (logged_in || !o.is_private()))
    }
}

/// The fake's stand-in for an initialized library: finalized when the last
/// clone drops, like `cryptoki::context::Pkcs11`.
#[derive(Clone)]
pub struct FakeLibrary(#[allow(dead_code)] Arc<FakeInitialization>);

pub struct FakeInitialization {
    state: Arc<Mutex<FakeState>>,
    owned: bool,
}

impl Drop for FakeInitialization {
    fn drop(&mut self) {
        if self.owned {
            let mut state = self.state.lock().unwrap();
            state.calls.push("C_Finalize");
            state.finalizes += 1;
        }
    }
}

/// Loads fake drivers. Clones share the token and the set of initialized
/// libraries, so drivers from one loader overlap the way drivers loaded by
/// concurrent requests in one process do.
#[derive(Clone)]
pub struct FakeLoader {
    state: Arc<Mutex<FakeState>>,
    libraries: Arc<LibraryRegistry<FakeLibrary>>,
}

impl FakeLoader {
    pub fn new(token: FakeToken) -> Self {
        let state = FakeState {
            token,
            calls: vec![],
            sessions: HashMap::new(),
            next_handle: 0,
            loads: 0,
            unloads: 0,
            initializes: 0,
            finalizes: 0,
            threading: vec![],
            opened_on: vec![],
            session_kinds: vec![],
            find_limits: vec![],
            templates: vec![],
            signed: vec![],
        };
        Self { state: Arc::new(Mutex::new(state)), libraries: Arc::default() }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn load_driver(&self) -> Box<dyn Driver> {
        self.load(Path::new(FAKE_MODULE), ThreadingMode::default()).unwrap()
    }

    fn initialize(&self) -> Result<Initialization<FakeLibrary>> {
        let mut state = self.state();
        state.calls.push("C_Initialize");
        state.initializes += 1;
        let owned = !state.token.already_initialized;
        let library = FakeLibrary(Arc::new(FakeInitialization { state: self.state.clone(), owned }));
        Ok(if owned { Initialization::Owned(library) } else { Initialization::Joined(library) })
    }
}

impl DriverLoader for FakeLoader {
    fn load(&self, module_path: &Path, threading: ThreadingMode) -> Result<Box<dyn Driver>> {
        {
            let mut state = self.state();
            state.calls.push("load");
            if state.token.load_fails {
                return Err(Error::ModuleLoad {
                    path: module_path.to_path_buf(),
                    source: "not a PKCS#11 module".into(),
                });
            }
            state.loads += 1;
            state.threading.push(threading);
        }
        let library = self.libraries.acquire(module_path, || self.initialize())?;
        Ok(Box::new(FakeDriver {
            state: self.state.clone(),
            libraries: self.libraries.clone(),
            path: module_path.to_path_buf(),
            library: Some(library),
        }))
    }
}

pub struct FakeDriver {
    state: Arc<Mutex<FakeState>>,
    libraries: Arc<LibraryRegistry<FakeLibrary>>,
    path: PathBuf,
    library: Option<FakeLibrary>,
}

impl FakeDriver {
    fn enter(&self, function: &'static str) -> MutexGuard<'_, FakeState> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(function);
        state
    }

    /// One search: init, `C_FindObjects` in batches of `batch` (only the
    /// first unless `drain`), final.
    fn search(
        &self,
        session: SessionHandle,
        template: &Attributes,
        batch: usize,
        drain: bool,
    ) -> Result<Vec<ObjectHandle>> {
        let mut state = self.enter("C_FindObjectsInit");
        state.templates.push(template.clone());
        let logged_in = state.session(session)?.logged_in;
        let mut matching: Vec<ObjectHandle> = state
            .token
            .objects
            .iter()
            .filter(|o| o.matches(template) && (logged_in || !o.is_private()))
            .map(|o| o.handle)
            .collect();
        let mut found = vec![];
        loop {
            state.calls.push("C_FindObjects");
            state.find_limits.push(batch);
            let count = batch.min(matching.len());
            found.extend(matching.drain(..count));
            if !drain || count < batch {
                break;
            }
        }
        state.calls.push("C_FindObjectsFinal");
        Ok(found)
    }
}

impl Drop for FakeDriver {
    fn drop(&mut self) {
        // Released before taking the state lock: a last release finalizes,
        // which records into the state itself.
        if let Some(library) = self.library.take() {
            self.libraries.release(&self.path, library);
        }
        let mut state = self.state.lock().unwrap();
        state.calls.push("unload");
        state.unloads += 1;
    }
}

impl Driver for FakeDriver {
    fn slots_with_token(&self) -> Result<Vec<SlotId>> {
        let state = self.enter("C_GetSlotList");
        Ok(state.token.slots.iter().filter(|(_, present)| *present).map(|(slot, _)| *slot).collect())
    }

    fn slot_info(&self, slot: SlotId) -> Result<SlotInfo> {
        let state = self.enter("C_GetSlotInfo");
        if state.token.unreadable_slots.contains(&slot) {
            return Err(failed(Function::GetSlotInfo, RvError::DeviceError));
        }
        let (_, present) = state
            .token
            .slots
            .iter()
            .find(|(id, _)| *id == slot)
            .ok_or(failed(Function::GetSlotInfo, RvError::SlotIdInvalid))?;
        Ok(SlotInfo {
            description: format!("fake slot {slot}"),
            token_present: *present && !state.token.removed_after_listing.contains(&slot),
        })
    }

    fn open_session(&self, slot: SlotId, kind: SessionKind) -> Result<SessionHandle> {
        let mut state = self.enter("C_OpenSession");
        match state.token.slots.iter().find(|(id, _)| *id == slot) {
            None => return Err(failed(Function::OpenSession, RvError::SlotIdInvalid)),
            Some((_, false)) => return Err(failed(Function::OpenSession, RvError::TokenNotPresent)),
            Some(_) => {}
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state.sessions.insert(handle, FakeSession::default());
        state.opened_on.push(slot);
        state.session_kinds.push(kind);
        Ok(handle)
    }

    fn close_session(&self, session: SessionHandle) -> Result<()> {
        let mut state = self.enter("C_CloseSession");
        state
            .sessions
            .remove(&session)
            .map(|_| ())
            .ok_or(failed(Function::CloseSession, RvError::SessionHandleInvalid))
    }

    fn login(&self, session: SessionHandle, user_type: UserType, pin: &str) -> Result<()> {
        let mut state = self.enter("C_Login");
        if !matches!(user_type, UserType::User) {
            return Err(failed(Function::Login, RvError::UserTypeInvalid));
        }
        let session = state.session(session)?;
        if pin != FakeToken::PIN {
            return Err(failed(Function::Login, RvError::PinIncorrect));
        }
        session.logged_in = true;
        Ok(())
    }

    fn logout(&self, session: SessionHandle) -> Result<()> {
        let mut state = self.enter("C_Logout");
        let logout_rv = state.token.logout_rv;
        let session = state.session(session)?;
        if let Some(rv) = logout_rv {
            return Err(failed(Function::Logout, rv));
        }
        session.logged_in = false;
        Ok(())
    }

    fn find_all_objects(
        &self,
        session: SessionHandle,
        template: &Attributes,
    ) -> Result<Vec<ObjectHandle>> {
        if self.enter("find_all").token.batched_search_fails {
            return Err(failed(Function::FindObjects, RvError::FunctionFailed));
        }
        self.search(session, template, FIND_ALL_BATCH, true)
    }

    fn find_objects(
        &self,
        session: SessionHandle,
        template: &Attributes,
        max_objects: usize,
    ) -> Result<Vec<ObjectHandle>> {
        self.search(session, template, max_objects, false)
    }

    fn attribute_value(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attribute_type: AttributeType,
    ) -> Result<Option<Vec<u8>>> {
        let mut state = self.enter("C_GetAttributeValue");
        let logged_in = state.session(session)?.logged_in;
        let object = state
            .visible_object(object, logged_in)
            .ok_or(failed(Function::GetAttributeValue, RvError::ObjectHandleInvalid))?;
        Ok(object.bytes(attribute_type))
    }

    fn sign(&self, session: SessionHandle, key: ObjectHandle, data: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.enter("C_SignInit");
        let logged_in = state.session(session)?.logged_in;
        let is_signing_key = state.visible_object(key, logged_in).is_some_and(FakeObject::is_private);
        if !is_signing_key {
            return Err(failed(Function::SignInit, RvError::KeyHandleInvalid));
        }
        state.calls.push("C_Sign");
        if let Some(rv) = state.token.sign_rv {
            return Err(failed(Function::Sign, rv));
        }
        state.signed.push((key, data.to_vec()));
        if state.token.empty_signature {
            return Ok(vec![]);
        }
        // A recognizable stand-in for a 2048-bit signature.
        Ok(vec![key as u8; 256])
    }
}
