//! Deadline coordination for a worker process.
//!
//! A [`TimeoutRegistry`] owns two kinds of deadline:
//!
//! - The *ambient* deadline bounds a whole unit of work (see [`TimeoutRegistry::supervise`]).
//!   It is soft: while any critical section is open its expiry is held back, and the fault is
//!   raised as soon as the outermost section closes.
//! - Each open critical section carries its own *emergency* deadline. When it elapses, the
//!   section's emergency callback runs if it has one; otherwise the supervised work is
//!   cancelled with [`Error::EmergencyTimeout`].
//!
//! Cancellation means the supervised future is dropped at its next await point. Sections are
//! normally opened through a [`CriticalSectionProvider`].

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::{sync::Notify, time::Instant};

use crate::error::Error;

mod provider;

pub use provider::{CriticalSectionProvider, CriticalSectionScope};

/// Invoked with the section name when a section outlives its emergency limit.
pub type EmergencyCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectionId(u64);

struct OpenSection {
    name: String,
    limit: Duration,
    deadline: Instant,
    callback: Option<EmergencyCallback>,
    fired: bool,
}

struct Ambient {
    limit: Duration,
    deadline: Instant,
    expired: bool,
    delivered: bool,
}

#[derive(Default)]
struct State {
    next_id: u64,
    sections: HashMap<SectionId, OpenSection>,
    ambient: Option<Ambient>,
}

impl State {
    /// Hands out the deferred ambient fault once, after the last section has closed.
    fn take_ambient_fault(&mut self) -> Option<Error> {
        if !self.sections.is_empty() {
            return None;
        }
        match &mut self.ambient {
            Some(ambient) if ambient.expired && !ambient.delivered => {
                ambient.delivered = true;
                Some(Error::AmbientTimeout {
                    limit: ambient.limit,
                })
            }
            _ => None,
        }
    }
}

struct Inner {
    state: Mutex<State>,
    wakeup: Notify,
}

#[derive(Clone)]
pub struct TimeoutRegistry {
    inner: Arc<Inner>,
}

impl Default for TimeoutRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeoutRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                wakeup: Notify::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts the ambient deadline `limit` from now, replacing any previous one.
    /// `None` removes the deadline.
    pub fn set_ambient_limit(&self, limit: Option<Duration>) {
        self.state().ambient = limit.map(|limit| Ambient {
            limit,
            deadline: Instant::now() + limit,
            expired: false,
            delivered: false,
        });
        self.inner.wakeup.notify_one();
    }

    pub fn open_sections(&self) -> usize {
        self.state().sections.len()
    }

    /// Opens a critical section whose emergency deadline starts now.
    pub fn open_section(
        &self,
        name: &str,
        limit: Duration,
        callback: Option<EmergencyCallback>,
    ) -> SectionId {
        let id = {
            let mut state = self.state();
            state.next_id += 1;
            let id = SectionId(state.next_id);
            state.sections.insert(
                id,
                OpenSection {
                    name: name.to_owned(),
                    limit,
                    deadline: Instant::now() + limit,
                    callback,
                    fired: false,
                },
            );
            id
        };

        tracing::debug!(section = name, ?limit, "Entered critical section");
        self.inner.wakeup.notify_one();
        id
    }

    /// Closes a section. Fails with [`Error::AmbientTimeout`] if this was the last open
    /// section and the ambient deadline passed while it was open.
    pub fn close_section(&self, id: SectionId) -> Result<(), Error> {
        let fault = {
            let mut state = self.state();
            match state.sections.remove(&id) {
                Some(section) => {
                    tracing::debug!(section = %section.name, "Exited critical section");
                }
                None => {
                    tracing::debug!(?id, "Critical section already closed");
                    return Ok(());
                }
            }
            state.take_ambient_fault()
        };

        self.inner.wakeup.notify_one();
        match fault {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Closes a section without claiming a deferred ambient fault, leaving it for the
    /// supervisor to deliver.
    pub fn release_section(&self, id: SectionId) {
        if let Some(section) = self.state().sections.remove(&id) {
            tracing::debug!(section = %section.name, "Released critical section");
        }
        self.inner.wakeup.notify_one();
    }

    /// Applies every deadline that has passed at `now`.
    ///
    /// Returns the fault the supervised work must be cancelled with, if any, or else the
    /// next instant at which a deadline falls due.
    pub fn poll_deadlines(&self, now: Instant) -> Result<Option<Instant>, Error> {
        let mut callbacks = Vec::new();

        let next_wakeup = {
            let mut guard = self.state();
            let state = &mut *guard;

            let mut expired = Vec::new();
            for (id, section) in state.sections.iter_mut() {
                if section.fired || section.deadline > now {
                    continue;
                }
                section.fired = true;
                match &section.callback {
                    Some(callback) => callbacks.push((callback.clone(), section.name.clone())),
                    None => expired.push(*id),
                }
            }

            // Every expired section is abandoned with the work. The outermost one names the
            // fault.
            expired.sort_unstable();
            let mut fault = None;
            for id in expired {
                if let Some(section) = state.sections.remove(&id) {
                    tracing::error!(
                        section = %section.name,
                        limit = ?section.limit,
                        "Emergency timeout expired with no callback"
                    );
                    fault.get_or_insert(Error::EmergencyTimeout {
                        name: section.name,
                        limit: section.limit,
                    });
                }
            }
            if let Some(fault) = fault {
                return Err(fault);
            }

            if let Some(ambient) = &mut state.ambient {
                if !ambient.expired && ambient.deadline <= now {
                    ambient.expired = true;
                    if !state.sections.is_empty() {
                        tracing::info!(
                            open_sections = state.sections.len(),
                            "Ambient deadline passed, deferring until critical sections close"
                        );
                    }
                }
            }

            if let Some(fault) = state.take_ambient_fault() {
                return Err(fault);
            }

            let ambient_deadline = state
                .ambient
                .as_ref()
                .filter(|ambient| !ambient.expired)
                .map(|ambient| ambient.deadline);

            state
                .sections
                .values()
                .filter(|section| !section.fired)
                .map(|section| section.deadline)
                .chain(ambient_deadline)
                .min()
        };

        for (callback, name) in callbacks {
            tracing::warn!(section = %name, "Emergency timeout expired, running callback");
            callback(&name);
        }

        Ok(next_wakeup)
    }

    /// Runs `work` to completion unless a deadline fault cancels it first.
    ///
    /// Sections the cancelled work left open are closed along with it.
    pub async fn supervise<F, T, E>(&self, work: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<Error>,
    {
        let first = SectionId(self.state().next_id + 1);
        tokio::pin!(work);

        loop {
            let next_wakeup = match self.poll_deadlines(Instant::now()) {
                Ok(next_wakeup) => next_wakeup,
                Err(fault) => {
                    self.abandon_sections_from(first);
                    return Err(fault.into());
                }
            };

            tokio::select! {
                biased;
                result = &mut work => return result,
                _ = self.inner.wakeup.notified() => {}
                _ = sleep_until(next_wakeup) => {}
            }
        }
    }

    fn abandon_sections_from(&self, first: SectionId) {
        let mut state = self.state();
        state.sections.retain(|id, section| {
            if *id < first {
                return true;
            }
            tracing::warn!(section = %section.name, "Abandoning critical section of cancelled work");
            false
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
