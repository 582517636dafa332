use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::telemetry::SharedTelemetry;
use crate::utils::sync::lock;

/// Reason activated by the external memory pressure signal.
pub const MEMORY_PRESSURE: &str = "memory_pressure";
/// Reason activated when a render runs out of memory.
///
/// Cleared together with [`MEMORY_PRESSURE`] once the pressure is relieved.
pub const RENDER_OOM: &str = "render_oom";
/// Reason activated when the disk mirror could not be initialized.
///
/// This one is sticky: only [`FallbackController::clear`] or a restart removes it.
pub const DISK_INIT: &str = "render_cache_disk_init";

type Listener = Arc<dyn Fn(&str) + Send + Sync>;

/// Identifies a registered listener, see [`FallbackController::remove_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct Listeners {
    next_id: u64,
    activated: Vec<(ListenerId, Listener)>,
    deactivated: Vec<(ListenerId, Listener)>,
}

impl Listeners {
    fn next_id(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }
}

/// Tracks the reasons for which degraded mode is currently active.
///
/// Degraded mode is active as long as at least one reason is. Listeners registered with
/// [`on_activated`](Self::on_activated) and [`on_deactivated`](Self::on_deactivated) only fire on
/// the transitions between "no reasons" and "some reasons", never on every call.
///
/// Listeners run outside of the reason lock, but must not call back into the controller.
pub struct FallbackController {
    mode: &'static str,
    reasons: Mutex<HashSet<String>>,
    /// Mirrors `!reasons.is_empty()` so that `is_active` never blocks.
    active: AtomicBool,
    /// Serializes transitions together with their listener calls, so listeners observe
    /// activations and deactivations in the order they happened.
    transitions: Mutex<()>,
    listeners: Mutex<Listeners>,
    telemetry: SharedTelemetry,
}

impl fmt::Debug for FallbackController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackController")
            .field("mode", &self.mode)
            .field("reasons", &self.reasons())
            .finish()
    }
}

enum Transition {
    Activated,
    Deactivated,
    None,
}

impl FallbackController {
    /// Creates a controller for the degraded mode named `mode`, used in breadcrumbs.
    pub fn new(mode: &'static str, telemetry: SharedTelemetry) -> Self {
        Self {
            mode,
            reasons: Mutex::new(HashSet::new()),
            active: AtomicBool::new(false),
            transitions: Mutex::new(()),
            listeners: Mutex::new(Listeners::default()),
            telemetry,
        }
    }

    pub fn mode(&self) -> &'static str {
        self.mode
    }

    /// Whether any reason is currently active.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Returns a snapshot of all active reasons.
    pub fn reasons(&self) -> HashSet<String> {
        lock(&self.reasons).clone()
    }

    /// Registers a listener for the transition into degraded mode.
    ///
    /// The listener receives the reason that caused the transition.
    pub fn on_activated<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.listeners);
        let id = listeners.next_id();
        listeners.activated.push((id, Arc::new(listener)));
        id
    }

    /// Registers a listener for the transition back into normal mode.
    ///
    /// The listener receives the reason whose removal caused the transition, or `"clear"`.
    pub fn on_deactivated<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let mut listeners = lock(&self.listeners);
        let id = listeners.next_id();
        listeners.deactivated.push((id, Arc::new(listener)));
        id
    }

    /// Unregisters a listener previously returned by one of the `on_*` methods.
    pub fn remove_listener(&self, id: ListenerId) {
        let mut listeners = lock(&self.listeners);
        listeners.activated.retain(|(listener_id, _)| *listener_id != id);
        listeners.deactivated.retain(|(listener_id, _)| *listener_id != id);
    }

    /// Adds `reason`. Adding a reason that is already active does nothing.
    pub fn activate(&self, reason: &str) {
        let _transition = lock(&self.transitions);
        let transition = {
            let mut reasons = lock(&self.reasons);
            let was_empty = reasons.is_empty();
            if !reasons.insert(reason.to_owned()) {
                return;
            }
            self.active.store(true, Ordering::Release);
            tracing::debug!(mode = self.mode, reason, active = reasons.len(), "Fallback reason activated");
            if was_empty {
                Transition::Activated
            } else {
                Transition::None
            }
        };
        self.notify(transition, reason);
    }

    /// Removes `reason`. Removing a reason that is not active does nothing.
    pub fn deactivate(&self, reason: &str) {
        let _transition = lock(&self.transitions);
        let transition = {
            let mut reasons = lock(&self.reasons);
            if !reasons.remove(reason) {
                return;
            }
            tracing::debug!(mode = self.mode, reason, active = reasons.len(), "Fallback reason deactivated");
            if reasons.is_empty() {
                self.active.store(false, Ordering::Release);
                Transition::Deactivated
            } else {
                Transition::None
            }
        };
        self.notify(transition, reason);
    }

    /// Removes all reasons, including sticky ones.
    pub fn clear(&self) {
        let _transition = lock(&self.transitions);
        let transition = {
            let mut reasons = lock(&self.reasons);
            let was_active = !reasons.is_empty();
            reasons.clear();
            self.active.store(false, Ordering::Release);
            if was_active {
                Transition::Deactivated
            } else {
                Transition::None
            }
        };
        self.notify(transition, "clear");
    }

    fn notify(&self, transition: Transition, reason: &str) {
        let listeners = {
            let listeners = lock(&self.listeners);
            match transition {
                Transition::Activated => listeners.activated.clone(),
                Transition::Deactivated => listeners.deactivated.clone(),
                Transition::None => return,
            }
        };

        match transition {
            Transition::Activated => {
                tracing::info!(mode = self.mode, reason, "Entering degraded mode");
                metric!(gauge("fallback.active") = 1u64, "mode" => self.mode);
                self.telemetry
                    .breadcrumb("fallback", format!("fallback_mode:{}:{reason}", self.mode));
            }
            Transition::Deactivated => {
                tracing::info!(mode = self.mode, reason, "Leaving degraded mode");
                metric!(gauge("fallback.active") = 0u64, "mode" => self.mode);
                self.telemetry
                    .breadcrumb("fallback", format!("fallback_mode:restored:{reason}"));
            }
            Transition::None => {}
        }

        for (_, listener) in listeners {
            listener(reason);
        }
    }
}
