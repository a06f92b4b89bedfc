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

//! Reference counts for initialized PKCS#11 libraries.
//!
//! `C_Initialize` and `C_Finalize` act on the whole process, so drivers
//! loaded from the same path share one initialized library. The library is
//! finalized when its last user releases it, never while a request on
//! another thread still holds it.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use tracing::debug;

use crate::Result;

/// How a freshly opened library came to be initialized.
pub enum Initialization<L> {
    /// This process initialized it and finalizes it after the last release.
    Owned(L),
    /// Someone else in the process had already initialized it. It is kept
    /// for reuse and never finalized here.
    Joined(L),
}

struct Entry<L> {
    library: L,
    users: usize,
    owned: bool,
}

/// Libraries keyed by module path. `L` is a cheap shared handle whose last
/// clone finalizes the library when dropped.
pub struct LibraryRegistry<L> {
    entries: Mutex<HashMap<PathBuf, Entry<L>>>,
}

impl<L> Default for LibraryRegistry<L> {
    fn default() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }
}

impl<L: Clone> LibraryRegistry<L> {
    fn entries(&self) -> MutexGuard<'_, HashMap<PathBuf, Entry<L>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a handle to the library at `path`, calling `open` only when
    /// no user currently holds it. Every successful call must be paired with
    /// one `release`.
    pub fn acquire(
        &self,
        path: &Path,
        open: impl FnOnce() -> Result<Initialization<L>>,
    ) -> Result<L> {
        // Held across `open` so a concurrent release cannot finalize while
        // the library is being initialized.
        let mut entries = self.entries();
        if let Some(entry) = entries.get_mut(path) {
            entry.users += 1;
            debug!(path = %path.display(), users = entry.users, "reusing initialized library");
            return Ok(entry.library.clone());
        }
        let (library, owned) = match open()? {
            Initialization::Owned(library) => (library, true),
            Initialization::Joined(library) => (library, false),
        };
        entries.insert(path.to_path_buf(), Entry { library: library.clone(), users: 1, owned });
        Ok(library)
    }

    /// Gives back a handle obtained from `acquire`. The last release of an
    /// owned library drops it while the registry is locked, so finalization
    /// completes before anyone can acquire the path again.
    pub fn release(&self, path: &Path, library: L) {
        let mut entries = self.entries();
        let Some(entry) = entries.get_mut(path) else {
            return;
        };
        entry.users = entry.users.saturating_sub(1);
        if entry.users == 0 && entry.owned {
            debug!(path = %path.display(), "last user released library");
            let entry = entries.remove(path);
            drop(library);
            drop(entry);
        }
    }

    pub fn users(&self, path: &Path) -> usize {
        self.entries().get(path).map_or(0, |entry| entry.users)
    }
}
