use std::{
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bon::bon;

use crate::error::Error;

use super::{EmergencyCallback, SectionId, TimeoutRegistry};

const NO_SECTION: &str = "[none]";

struct StackEntry {
    name: String,
    id: SectionId,
}

/// Opens and closes named critical sections on a [`TimeoutRegistry`].
///
/// Sections entered with [`enter`](Self::enter) form a stack and must be exited in reverse
/// order. [`scoped_enter`](Self::scoped_enter) sections are tracked by their scope instead and
/// may close in any order.
pub struct CriticalSectionProvider {
    registry: TimeoutRegistry,
    emergency_limit: Duration,
    emergency_callback: Option<EmergencyCallback>,
    stack: Mutex<Vec<StackEntry>>,
}

#[bon]
impl CriticalSectionProvider {
    #[builder]
    pub fn new(
        registry: TimeoutRegistry,
        emergency_limit: Duration,
        emergency_callback: Option<EmergencyCallback>,
    ) -> Self {
        Self {
            registry,
            emergency_limit,
            emergency_callback,
            stack: Mutex::new(Vec::new()),
        }
    }
}

impl CriticalSectionProvider {
    fn stack(&self) -> MutexGuard<'_, Vec<StackEntry>> {
        self.stack.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self, name: &str) -> SectionId {
        self.registry
            .open_section(name, self.emergency_limit, self.emergency_callback.clone())
    }

    pub fn enter(&self, name: impl Into<String>) {
        let name = name.into();
        let id = self.open(&name);
        self.stack().push(StackEntry { name, id });
    }

    /// Closes the innermost section, which must be called `name`.
    ///
    /// On a name mismatch nothing is closed and the stack is left as it was.
    pub fn exit(&self, name: &str) -> Result<(), Error> {
        let entry = {
            let mut stack = self.stack();
            let innermost = stack.last().map(|top| top.name.clone());
            match innermost {
                Some(innermost) if innermost == name => stack.pop(),
                Some(innermost) => return Err(Error::critical_section_mismatch(name, innermost)),
                None => return Err(Error::critical_section_mismatch(name, NO_SECTION)),
            }
        };

        match entry {
            Some(entry) => self.registry.close_section(entry.id),
            None => Ok(()),
        }
    }

    pub fn scoped_enter(&self, name: impl Into<String>) -> CriticalSectionScope {
        let name = name.into();
        let id = self.open(&name);
        CriticalSectionScope {
            registry: self.registry.clone(),
            id,
            name,
            closed: false,
        }
    }

    /// Number of sections entered with [`enter`](Self::enter) and not yet exited.
    pub fn depth(&self) -> usize {
        self.stack().len()
    }

    pub fn registry(&self) -> &TimeoutRegistry {
        &self.registry
    }
}

/// A critical section that closes when this value is exited or dropped.
///
/// Prefer [`exit`](Self::exit), which surfaces a deferred ambient timeout to the caller. A
/// dropped scope still closes its section, and the fault is then delivered by the supervisor.
#[must_use = "the critical section closes as soon as the scope is dropped"]
pub struct CriticalSectionScope {
    registry: TimeoutRegistry,
    id: SectionId,
    name: String,
    closed: bool,
}

impl CriticalSectionScope {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exit(mut self) -> Result<(), Error> {
        self.closed = true;
        self.registry.close_section(self.id)
    }
}

impl Drop for CriticalSectionScope {
    fn drop(&mut self) {
        if !self.closed {
            self.registry.release_section(self.id);
        }
    }
}
