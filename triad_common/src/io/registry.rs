//! Process-wide pin registry and safe-shutdown hook.
//!
//! Every [`IoPin`](super::pin::IoPin) registers itself here at construction
//! and deregisters at drop. On any terminal path — normal exit, panic, or
//! SIGINT/SIGTERM — [`deactivate_all`] drives every live pin to its declared
//! default state. The hook is installed idempotently on first registration.
//!
//! Locking discipline: both the registry map and the per-pin backend locks
//! are held only for short register/read/write windows, so the bounded
//! try-lock used on the shutdown paths converges; an entry whose lock never
//! frees is skipped rather than deadlocking the handler.

use std::collections::HashMap;
use std::panic;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Once, OnceLock, TryLockError};

use nix::sys::signal::{raise, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::{debug, info, warn};

use super::pin::{DefaultState, Level, PinBackend, PinSpec};

// ─── Storage ────────────────────────────────────────────────────────

#[derive(Clone)]
struct Entry {
    spec: PinSpec,
    backend: Arc<Mutex<dyn PinBackend>>,
}

static REGISTRY: OnceLock<Mutex<HashMap<u64, Entry>>> = OnceLock::new();
static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static HOOK_INIT: Once = Once::new();

fn registry() -> &'static Mutex<HashMap<u64, Entry>> {
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Bounded try-lock: spins briefly, then gives up. Shutdown paths must
/// never block indefinitely on a lock the interrupted thread may hold.
fn bounded_lock<T: ?Sized>(mutex: &Mutex<T>) -> Option<MutexGuard<'_, T>> {
    for _ in 0..10_000 {
        match mutex.try_lock() {
            Ok(guard) => return Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => std::hint::spin_loop(),
        }
    }
    None
}

// ─── Registration ───────────────────────────────────────────────────

/// Register a pin; returns its registry id. Installs the shutdown hook
/// on first call.
pub(super) fn register(spec: PinSpec, backend: Arc<Mutex<dyn PinBackend>>) -> u64 {
    install_shutdown_hook();
    let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
    let mut map = registry()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    map.insert(id, Entry { spec, backend });
    debug!(pin = spec.pin, id, "pin registered");
    id
}

/// Remove a pin from the registry. The caller is responsible for having
/// driven it to its default state first.
pub(super) fn deregister(id: u64) {
    let mut map = registry()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if map.remove(&id).is_none() {
        warn!(id, "deregister of unknown pin id");
    }
}

/// Number of currently registered pins.
pub fn live_pin_count() -> usize {
    registry()
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .len()
}

// ─── Default-state execution ────────────────────────────────────────

/// Drive a backend to the default state declared in `spec`.
///
/// The default is a logical state: write inversion is applied before the
/// primitive is touched, so an invert-writes heater pin with default LOW
/// ends up physically HIGH.
pub(super) fn drive_default(spec: PinSpec, backend: &mut dyn PinBackend) {
    let translate = |level: Level| {
        if spec.invert_writes {
            !level
        } else {
            level
        }
    };
    match spec.default_state {
        DefaultState::Low => backend.make_output(translate(Level::Low)),
        DefaultState::High => backend.make_output(translate(Level::High)),
        DefaultState::HighZ => backend.make_input(),
    }
}

/// Drive every registered pin to its declared default state.
///
/// Safe to call from the panic hook and the signal handler: all locks are
/// acquired with a bounded try-lock and unreachable entries are skipped.
pub fn deactivate_all() {
    let Some(registry) = REGISTRY.get() else {
        return;
    };
    let entries: Vec<Entry> = match bounded_lock(registry) {
        Some(map) => map.values().cloned().collect(),
        None => {
            warn!("pin registry lock unavailable during shutdown");
            return;
        }
    };
    info!(pins = entries.len(), "driving all pins to default state");
    for entry in entries {
        match bounded_lock(&entry.backend) {
            Some(mut backend) => drive_default(entry.spec, &mut *backend),
            None => warn!(pin = entry.spec.pin, "pin busy during shutdown, skipped"),
        }
    }
}

// ─── Shutdown hook installation ─────────────────────────────────────

extern "C" fn exit_handler() {
    deactivate_all();
}

extern "C" fn signal_handler(signum: i32) {
    deactivate_all();
    // Restore the default disposition and re-raise so the process
    // terminates with the conventional signal status.
    if let Ok(signal) = Signal::try_from(signum) {
        let default =
            SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        unsafe {
            let _ = sigaction(signal, &default);
        }
        let _ = raise(signal);
    }
}

/// Install the exit/panic/signal hooks exactly once.
fn install_shutdown_hook() {
    HOOK_INIT.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            deactivate_all();
            previous(info);
        }));

        unsafe {
            libc::atexit(exit_handler);
        }

        let action = SigAction::new(
            SigHandler::Handler(signal_handler),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe {
            let _ = sigaction(Signal::SIGINT, &action);
            let _ = sigaction(Signal::SIGTERM, &action);
        }
        debug!("pin shutdown hook installed");
    });
}

#[cfg(test)]
mod tests {
    use super::super::pin::{IoPin, Level};
    use super::super::sim::{SimMode, SimPin};
    use super::*;

    #[test]
    fn drive_default_translates_inversion() {
        let mut sim = SimPin::new();
        let state = sim.state();
        let spec = PinSpec {
            pin: 10,
            invert_reads: false,
            invert_writes: true,
            default_state: DefaultState::Low,
        };
        drive_default(spec, &mut sim);
        // Logical LOW on an invert-writes pin is primitive HIGH.
        assert_eq!(state.level(), Level::High);
        assert_eq!(state.mode(), SimMode::Output);
    }

    #[test]
    fn drive_default_high_z_releases_line() {
        let mut sim = SimPin::new();
        let state = sim.state();
        sim.make_output(Level::High);
        let spec = PinSpec {
            pin: 11,
            invert_reads: false,
            invert_writes: false,
            default_state: DefaultState::HighZ,
        };
        drive_default(spec, &mut sim);
        assert_eq!(state.mode(), SimMode::Input);
    }

    #[test]
    fn drop_restores_default() {
        // Count assertions would race with concurrently running tests that
        // also register pins, so only the pin's own state is checked.
        let sim = SimPin::new();
        let state = sim.state();
        let mut pin = IoPin::new(PinSpec::plain(12), sim);
        assert!(live_pin_count() >= 1);
        pin.digital_write(Level::High);
        drop(pin);
        assert_eq!(state.level(), Level::Low);
        assert_eq!(state.mode(), SimMode::Output);
    }
}
