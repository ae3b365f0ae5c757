//! Lifecycle hooks: one on-start and one on-end slot per object
//!
//! The on-start hook runs on a blocking worker once the object is logically
//! connected. It receives an [`ObjectHandle`] and is expected to poll
//! [`ObjectHandle::is_connected`] (or await [`ObjectHandle::cancelled`]) to know
//! when to stop. [`LifecycleHooks::register_main_loop`] does that polling for
//! a body that should simply repeat. The on-end hook runs inline on the
//! closing path.
//!
//! ```text
//! Live ──► spawn_blocking(on_start) ──► ... ──► token cancelled ──► join
//! Closed ──► on_end (inline)
//! ```

use super::error::RegistrationError;
use crate::connection::ObjectHandle;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type HookFn = dyn Fn(&ObjectHandle) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookSlot {
    OnStart,
    OnEnd,
}

impl fmt::Display for HookSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HookSlot::OnStart => write!(f, "on-start"),
            HookSlot::OnEnd => write!(f, "on-end"),
        }
    }
}

/// A registered hook; bound arguments live in the closure's captures
#[derive(Clone)]
pub struct LifecycleHook {
    slot: HookSlot,
    callback: Arc<HookFn>,
}

impl LifecycleHook {
    pub fn slot(&self) -> HookSlot {
        self.slot
    }

    pub(crate) fn invoke(&self, handle: &ObjectHandle) {
        debug!("Running {} hook for {}", self.slot, handle.name());
        (self.callback)(handle)
    }
}

impl fmt::Debug for LifecycleHook {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LifecycleHook")
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

/// Returned by hook registration in place of the hook itself.
///
/// Hooks belong to the connection manager; application code calling the guard
/// is a programming error and terminates the process.
#[derive(Debug, Clone, Copy)]
pub struct HookGuard {
    slot: HookSlot,
}

impl HookGuard {
    pub fn slot(&self) -> HookSlot {
        self.slot
    }

    pub fn call(&self) -> ! {
        error!(
            "The {} hook was invoked directly. Lifecycle hooks are run by the connection, \
             never by application code",
            self.slot
        );
        std::process::exit(1)
    }
}

#[derive(Clone, Default, Debug)]
pub struct LifecycleHooks {
    on_start: Option<LifecycleHook>,
    on_end: Option<LifecycleHook>,
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fills `slot`. Fails if the slot is already occupied, leaving the first
    /// registration in place.
    pub fn register<F>(&mut self, slot: HookSlot, callback: F) -> Result<HookGuard, RegistrationError>
    where
        F: Fn(&ObjectHandle) + Send + Sync + 'static,
    {
        let target = match slot {
            HookSlot::OnStart => &mut self.on_start,
            HookSlot::OnEnd => &mut self.on_end,
        };
        if target.is_some() {
            error!("Tried to register the {} hook twice", slot);
            return Err(RegistrationError::HookAlreadyRegistered(slot));
        }
        *target = Some(LifecycleHook {
            slot,
            callback: Arc::new(callback),
        });
        Ok(HookGuard { slot })
    }

    /// Fills the on-start slot with a loop around `body`.
    ///
    /// With `Some(n)` the body runs at most `n` times; with `None` it runs
    /// until the connection drops. Either way it stops as soon as the object
    /// is no longer connected.
    pub fn register_main_loop<F>(
        &mut self,
        repetitions: Option<usize>,
        body: F,
    ) -> Result<HookGuard, RegistrationError>
    where
        F: Fn(&ObjectHandle) + Send + Sync + 'static,
    {
        self.register(HookSlot::OnStart, move |handle: &ObjectHandle| {
            let runs = run_main_loop(handle, repetitions, &body);
            debug!("Main loop of {} ran {} time(s)", handle.name(), runs);
        })
    }

    pub fn on_start(&self) -> Option<&LifecycleHook> {
        self.on_start.as_ref()
    }

    pub fn on_end(&self) -> Option<&LifecycleHook> {
        self.on_end.as_ref()
    }
}

fn run_main_loop<F>(handle: &ObjectHandle, repetitions: Option<usize>, body: &F) -> usize
where
    F: Fn(&ObjectHandle),
{
    let mut runs = 0;
    while handle.is_connected() && repetitions.map_or(true, |max| runs < max) {
        body(handle);
        runs += 1;
    }
    runs
}

/// The on-start hook running on its blocking worker
#[derive(Debug)]
pub(crate) struct StartTask {
    join: JoinHandle<()>,
}

impl StartTask {
    pub(crate) fn launch(hook: LifecycleHook, handle: ObjectHandle) -> Self {
        info!("Launching {} hook for {}", hook.slot, handle.name());
        let join = tokio::task::spawn_blocking(move || {
            hook.invoke(&handle);
            debug!("{} hook returned", hook.slot);
        });
        Self { join }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the hook to return, detaching it after `timeout`
    pub(crate) async fn join(self, timeout: Duration) {
        match tokio::time::timeout(timeout, self.join).await {
            Ok(Ok(())) => debug!("On-start worker joined"),
            Ok(Err(e)) => error!("On-start hook failed: {}", e),
            Err(_) => warn!(
                "On-start hook still running {:?} after the connection closed, detaching it",
                timeout
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn second_registration_fails_and_keeps_the_first() {
        let mut hooks = LifecycleHooks::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let first = calls.clone();
        let guard = hooks
            .register(HookSlot::OnStart, move |_| {
                first.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(guard.slot(), HookSlot::OnStart);

        let second = hooks.register(HookSlot::OnStart, |_| {});
        assert_eq!(
            second.unwrap_err(),
            RegistrationError::HookAlreadyRegistered(HookSlot::OnStart)
        );

        hooks
            .on_start()
            .unwrap()
            .invoke(&ObjectHandle::detached("lamp", "obj-1"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn slots_are_independent() {
        let mut hooks = LifecycleHooks::new();
        hooks.register(HookSlot::OnEnd, |_| {}).unwrap();
        assert!(hooks.on_start().is_none());
        hooks.register(HookSlot::OnStart, |_| {}).unwrap();
        assert!(hooks.register(HookSlot::OnEnd, |_| {}).is_err());
        assert_eq!(hooks.on_end().unwrap().slot(), HookSlot::OnEnd);
    }

    #[tokio::test]
    async fn start_task_runs_once_and_joins() {
        let mut hooks = LifecycleHooks::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        hooks
            .register(HookSlot::OnStart, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let task = StartTask::launch(
            hooks.on_start().unwrap().clone(),
            ObjectHandle::detached("lamp", "obj-1"),
        );
        task.join(Duration::from_secs(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn main_loop_takes_the_on_start_slot() {
        let mut hooks = LifecycleHooks::new();
        let guard = hooks.register_main_loop(Some(2), |_| {}).unwrap();
        assert_eq!(guard.slot(), HookSlot::OnStart);
        assert_eq!(
            hooks.register(HookSlot::OnStart, |_| {}).unwrap_err(),
            RegistrationError::HookAlreadyRegistered(HookSlot::OnStart)
        );
        assert!(hooks.register_main_loop(None, |_| {}).is_err());
    }

    #[test]
    fn main_loop_never_runs_without_a_connection() {
        let calls = AtomicUsize::new(0);
        let handle = ObjectHandle::detached("lamp", "obj-1");
        let body = |_: &ObjectHandle| {
            calls.fetch_add(1, Ordering::SeqCst);
        };

        assert_eq!(run_main_loop(&handle, Some(3), &body), 0);
        assert_eq!(run_main_loop(&handle, None, &body), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
