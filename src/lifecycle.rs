//! Ownership and single-flight loading of the inference engine.
//!
//! The manager is created once, in [`Phase::Unloaded`], and shared behind an
//! `Arc`. Only the holder of the load lock moves the state to
//! [`Phase::Loading`]; every other caller that needs the model waits on a
//! condition variable until that load finishes. A drop guard puts the state
//! back to `Unloaded` on every failed exit, panics included, so the manager
//! is never left stuck mid-load.
//!
//! Local loads have no timeout. A backend that hangs blocks its loader and
//! every waiter.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::device::{is_remote_policy, Device, DeviceResolver};
use crate::engine::{InferenceBackend, InferenceEngine};
use crate::error::{Result, TtsError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unloaded,
    Loading,
    Ready,
}

/// Where the model currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveDevice {
    Local(Device),
    /// Synthesis is delegated to a remote worker; nothing is loaded locally.
    Delegated,
}

impl fmt::Display for ActiveDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActiveDevice::Local(device) => device.fmt(f),
            ActiveDevice::Delegated => f.write_str("remote"),
        }
    }
}

/// Point-in-time view of the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleStatus {
    pub phase: Phase,
    pub device: Option<ActiveDevice>,
    pub policy: String,
}

impl LifecycleStatus {
    pub fn is_ready(&self) -> bool {
        self.phase == Phase::Ready
    }

    pub fn is_loading(&self) -> bool {
        self.phase == Phase::Loading
    }

    /// True when a local engine is loaded.
    pub fn is_loaded_locally(&self) -> bool {
        self.is_ready() && matches!(self.device, Some(ActiveDevice::Local(_)))
    }
}

/// What a call to [`ModelLifecycleManager::reload`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// A new engine was built on this device.
    Loaded(Device),
    /// The policy resolved to the device already loaded; nothing was built.
    Unchanged(Device),
    /// The policy is remote; the local engine (if any) was released.
    Delegated,
}

/// Lifecycle notifications, emitted outside of any lock.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    LoadStarted { device: Device },
    Loaded { device: Device, elapsed: Duration },
    LoadFailed { device: Device, error: String },
    Delegated { policy: String },
    Released { device: Device },
}

pub trait LifecycleListener: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent);
}

impl<F> LifecycleListener for F
where
    F: Fn(&LifecycleEvent) + Send + Sync,
{
    fn on_event(&self, event: &LifecycleEvent) {
        self(event)
    }
}

struct ModelState {
    phase: Phase,
    device: Option<ActiveDevice>,
    policy: String,
}

impl ModelState {
    fn snapshot(&self) -> LifecycleStatus {
        LifecycleStatus {
            phase: self.phase,
            device: self.device,
            policy: self.policy.clone(),
        }
    }
}

/// Owns the single inference engine and serializes every load and reload.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use tts_dispatch::device::{DeviceResolver, SysfsProbe};
/// # use tts_dispatch::lifecycle::ModelLifecycleManager;
/// # fn backend() -> Arc<dyn tts_dispatch::engine::InferenceBackend> { unimplemented!() }
/// let resolver = DeviceResolver::detect(&SysfsProbe::new());
/// let manager = Arc::new(ModelLifecycleManager::new(backend(), resolver, "auto"));
/// manager.preload()?;
/// manager.reload("cpu")?;
/// println!("{:?}", manager.status());
/// # Ok::<(), tts_dispatch::TtsError>(())
/// ```
pub struct ModelLifecycleManager {
    backend: Arc<dyn InferenceBackend>,
    resolver: DeviceResolver,
    state: Mutex<ModelState>,
    state_changed: Condvar,
    engine: RwLock<Option<Box<dyn InferenceEngine>>>,
    /// Held for the whole of a load, reload or shutdown.
    load_lock: Mutex<()>,
    load_attempts: AtomicU64,
    listener: Option<Arc<dyn LifecycleListener>>,
}

impl ModelLifecycleManager {
    /// Create an unloaded manager. Nothing is built until the first
    /// [`preload`](Self::preload) or [`reload`](Self::reload).
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        resolver: DeviceResolver,
        policy: impl AsRef<str>,
    ) -> Self {
        Self {
            backend,
            resolver,
            state: Mutex::new(ModelState {
                phase: Phase::Unloaded,
                device: None,
                policy: normalize_policy(policy.as_ref()),
            }),
            state_changed: Condvar::new(),
            engine: RwLock::new(None),
            load_lock: Mutex::new(()),
            load_attempts: AtomicU64::new(0),
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn LifecycleListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn resolver(&self) -> &DeviceResolver {
        &self.resolver
    }

    pub fn status(&self) -> LifecycleStatus {
        self.state.lock().snapshot()
    }

    /// The configured device policy, normalized.
    pub fn policy(&self) -> String {
        self.state.lock().policy.clone()
    }

    /// Number of engine constructions attempted so far.
    pub fn load_count(&self) -> u64 {
        self.load_attempts.load(Ordering::SeqCst)
    }

    /// Make sure the model for the configured policy is ready.
    ///
    /// Returns at once when ready. While another caller is loading, blocks
    /// until that load finishes and checks again. Otherwise this caller
    /// loads; concurrent callers all observe the same engine.
    pub fn preload(&self) -> Result<LifecycleStatus> {
        {
            let mut state = self.state.lock();
            loop {
                match state.phase {
                    Phase::Ready => return Ok(state.snapshot()),
                    Phase::Loading => self.state_changed.wait(&mut state),
                    Phase::Unloaded => break,
                }
            }
        }

        let _load = self.load_lock.lock();
        let policy = {
            let mut state = self.state.lock();
            // another caller may have finished a load while we queued for the lock
            if state.phase == Phase::Ready {
                return Ok(state.snapshot());
            }
            state.phase = Phase::Loading;
            state.policy.clone()
        };
        let guard = LoadingGuard::new(self);

        if is_remote_policy(&policy) {
            guard.publish(ActiveDevice::Delegated);
            log::info!("Device policy '{policy}' delegates synthesis to a remote worker");
            self.emit(LifecycleEvent::Delegated { policy });
            return Ok(self.status());
        }

        let resolved = self.resolver.require_local(&policy)?;
        resolved.log();
        let engine = self.construct(resolved.resolved)?;
        *self.engine.write() = Some(engine);
        guard.publish(ActiveDevice::Local(resolved.resolved));
        Ok(self.status())
    }

    /// Switch to `policy`, rebuilding the engine only if the device changes.
    ///
    /// The previous engine is released before the new one is built; if the
    /// build fails the manager is left `Unloaded` and the error is returned.
    pub fn reload(&self, policy: &str) -> Result<ReloadOutcome> {
        let _load = self.load_lock.lock();
        let policy = normalize_policy(policy);

        if is_remote_policy(&policy) {
            let previous = self.begin_loading(&policy);
            let guard = LoadingGuard::new(self);
            self.release_engine(previous);
            guard.publish(ActiveDevice::Delegated);
            log::info!("Device policy '{policy}' delegates synthesis to a remote worker");
            self.emit(LifecycleEvent::Delegated { policy });
            return Ok(ReloadOutcome::Delegated);
        }

        let resolved = self.resolver.require_local(&policy)?;
        let target = resolved.resolved;
        {
            let mut state = self.state.lock();
            if state.phase == Phase::Ready && state.device == Some(ActiveDevice::Local(target)) {
                log::debug!("Model already loaded on {target}, reload skipped");
                state.policy = policy;
                return Ok(ReloadOutcome::Unchanged(target));
            }
        }

        log::info!("Reloading {} model on {target}...", self.backend.name());
        resolved.log();
        let previous = self.begin_loading(&policy);
        let guard = LoadingGuard::new(self);
        self.release_engine(previous);
        let engine = self.construct(target)?;
        *self.engine.write() = Some(engine);
        guard.publish(ActiveDevice::Local(target));
        Ok(ReloadOutcome::Loaded(target))
    }

    /// Release the engine and return to `Unloaded`.
    pub fn shutdown(&self) {
        let _load = self.load_lock.lock();
        let policy = self.policy();
        let previous = self.begin_loading(&policy);
        // the guard's rollback is exactly the unloaded state we want
        let _guard = LoadingGuard::new(self);
        self.release_engine(previous);
    }

    /// Run `f` against the loaded engine.
    ///
    /// The engine stays borrowed for the duration of `f`; a concurrent
    /// reload waits for it before releasing the engine.
    pub fn with_engine<R>(&self, f: impl FnOnce(&dyn InferenceEngine) -> Result<R>) -> Result<R> {
        let slot = self.engine.read();
        if let Some(engine) = slot.as_deref() {
            return f(engine);
        }
        drop(slot);

        let device = self
            .status()
            .device
            .map(|d| d.to_string())
            .unwrap_or_else(|| "none".to_string());
        Err(TtsError::resource(device, "no local model is loaded"))
    }

    /// Mark the state as loading under the new policy; returns the device
    /// that was active before.
    fn begin_loading(&self, policy: &str) -> Option<ActiveDevice> {
        let mut state = self.state.lock();
        state.phase = Phase::Loading;
        state.policy = policy.to_string();
        state.device.take()
    }

    fn release_engine(&self, previous: Option<ActiveDevice>) {
        let Some(engine) = self.engine.write().take() else {
            return;
        };
        let device = match previous {
            Some(ActiveDevice::Local(device)) => device,
            _ => Device::Cpu,
        };
        if let Err(e) = engine.release() {
            log::error!("Error releasing model on {device}: {e}");
        }
        log::debug!("Released model on {device}");
        self.emit(LifecycleEvent::Released { device });
    }

    fn construct(&self, device: Device) -> Result<Box<dyn InferenceEngine>> {
        self.load_attempts.fetch_add(1, Ordering::SeqCst);
        self.emit(LifecycleEvent::LoadStarted { device });
        log::info!("Loading {} model on {device}...", self.backend.name());

        let started = Instant::now();
        match self.backend.load(device) {
            Ok(engine) => {
                let elapsed = started.elapsed();
                log::info!(
                    "{} model loaded on {device} in {:.2?}",
                    self.backend.name(),
                    elapsed
                );
                self.emit(LifecycleEvent::Loaded { device, elapsed });
                Ok(engine)
            }
            Err(e) => {
                log::error!("Failed to load {} model on {device}: {e}", self.backend.name());
                self.emit(LifecycleEvent::LoadFailed {
                    device,
                    error: e.to_string(),
                });
                Err(TtsError::resource(device, e))
            }
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        if let Some(listener) = &self.listener {
            listener.on_event(&event);
        }
    }
}

/// Resets a `Loading` state to `Unloaded` unless the load is published.
struct LoadingGuard<'a> {
    manager: &'a ModelLifecycleManager,
    published: bool,
}

impl<'a> LoadingGuard<'a> {
    fn new(manager: &'a ModelLifecycleManager) -> Self {
        Self {
            manager,
            published: false,
        }
    }

    fn publish(mut self, device: ActiveDevice) {
        let mut state = self.manager.state.lock();
        state.phase = Phase::Ready;
        state.device = Some(device);
        self.published = true;
        self.manager.state_changed.notify_all();
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        let mut state = self.manager.state.lock();
        state.phase = Phase::Unloaded;
        state.device = None;
        self.manager.state_changed.notify_all();
    }
}

fn normalize_policy(policy: &str) -> String {
    policy.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::StaticProbe;
    use crate::engine::{EngineError, Voice, VoiceEmbedding};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;

    struct MockEngine {
        releases: Arc<AtomicUsize>,
    }

    impl InferenceEngine for MockEngine {
        fn synthesize(&self, text: &str, _voice: &Voice, _speed: f32) -> std::result::Result<Vec<f32>, EngineError> {
            Ok(vec![0.1; text.len()])
        }

        fn load_voice(&self, _voice_id: &str) -> std::result::Result<VoiceEmbedding, EngineError> {
            Ok(VoiceEmbedding(vec![0.0; 4]))
        }

        fn release(self: Box<Self>) -> std::result::Result<(), EngineError> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Err("cache flush failed".into())
        }
    }

    #[derive(Default)]
    struct MockBackend {
        loads: AtomicUsize,
        releases: Arc<AtomicUsize>,
        devices: Mutex<Vec<Device>>,
        fail_on: Mutex<Option<Device>>,
        delay: Duration,
    }

    impl InferenceBackend for MockBackend {
        fn load(&self, device: Device) -> std::result::Result<Box<dyn InferenceEngine>, EngineError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            thread::sleep(self.delay);
            if *self.fail_on.lock() == Some(device) {
                return Err("out of device memory".into());
            }
            if device == Device::Accelerator(7) {
                panic!("driver crashed");
            }
            self.devices.lock().push(device);
            Ok(Box::new(MockEngine {
                releases: self.releases.clone(),
            }))
        }
    }

    fn manager(backend: Arc<MockBackend>, accelerators: usize, policy: &str) -> ModelLifecycleManager {
        let resolver = DeviceResolver::detect(&StaticProbe::with_count(accelerators));
        ModelLifecycleManager::new(backend, resolver, policy)
    }

    #[test]
    fn test_starts_unloaded() {
        let m = manager(Arc::default(), 0, " AUTO ");
        let status = m.status();
        assert_eq!(status.phase, Phase::Unloaded);
        assert_eq!(status.device, None);
        assert_eq!(status.policy, "auto");
        assert!(m.with_engine(|_| Ok(())).is_err());
    }

    #[test]
    fn test_concurrent_preload_builds_once() {
        let backend = Arc::new(MockBackend {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let m = Arc::new(manager(backend.clone(), 2, "auto"));
        let n = 16;
        let barrier = Arc::new(Barrier::new(n));

        let handles: Vec<_> = (0..n)
            .map(|_| {
                let m = m.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    m.preload().unwrap()
                })
            })
            .collect();

        for handle in handles {
            let status = handle.join().unwrap();
            assert_eq!(status.phase, Phase::Ready);
            assert_eq!(status.device, Some(ActiveDevice::Local(Device::Accelerator(0))));
        }
        assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
        assert_eq!(m.load_count(), 1);
    }

    #[test]
    fn test_preload_is_idempotent() {
        let backend = Arc::new(MockBackend::default());
        let m = manager(backend.clone(), 0, "cpu");
        m.preload().unwrap();
        m.preload().unwrap();
        assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
        assert!(m.status().is_loaded_locally());
    }

    #[test]
    fn test_reload_same_device_is_noop() {
        let backend = Arc::new(MockBackend::default());
        let m = manager(backend.clone(), 2, "cpu");

        assert_eq!(m.reload("accelerator:1").unwrap(), ReloadOutcome::Loaded(Device::Accelerator(1)));
        let loads = m.load_count();
        assert_eq!(m.reload("accelerator:1").unwrap(), ReloadOutcome::Unchanged(Device::Accelerator(1)));
        assert_eq!(m.load_count(), loads);

        // a different policy that lands on the same device is also a no-op
        m.reload("accelerator:0").unwrap();
        assert_eq!(m.reload("auto").unwrap(), ReloadOutcome::Unchanged(Device::Accelerator(0)));
        assert_eq!(m.policy(), "auto");
    }

    #[test]
    fn test_reload_switches_device_and_releases_old() {
        let backend = Arc::new(MockBackend::default());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let m = manager(backend.clone(), 1, "cpu")
            .with_listener(Arc::new(move |e: &LifecycleEvent| sink.lock().push(e.clone())));

        m.preload().unwrap();
        assert_eq!(m.reload("accelerator:0").unwrap(), ReloadOutcome::Loaded(Device::Accelerator(0)));

        // release failure is logged, not fatal
        assert_eq!(backend.releases.load(Ordering::SeqCst), 1);
        assert_eq!(*backend.devices.lock(), vec![Device::Cpu, Device::Accelerator(0)]);
        assert_eq!(m.status().device, Some(ActiveDevice::Local(Device::Accelerator(0))));
        assert!(events.lock().contains(&LifecycleEvent::Released { device: Device::Cpu }));
    }

    #[test]
    fn test_failed_reload_leaves_unloaded() {
        let backend = Arc::new(MockBackend::default());
        *backend.fail_on.lock() = Some(Device::Accelerator(1));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let m = manager(backend.clone(), 2, "cpu")
            .with_listener(Arc::new(move |e: &LifecycleEvent| sink.lock().push(e.clone())));

        m.preload().unwrap();
        let err = m.reload("accelerator:1").unwrap_err();
        assert!(matches!(err, TtsError::Resource { ref device, .. } if device == "accelerator:1"));

        let status = m.status();
        assert_eq!(status.phase, Phase::Unloaded);
        assert_eq!(status.device, None);
        assert_eq!(status.policy, "accelerator:1");
        assert!(m.with_engine(|_| Ok(())).is_err());
        assert!(events
            .lock()
            .iter()
            .any(|e| matches!(e, LifecycleEvent::LoadFailed { device: Device::Accelerator(1), .. })));

        // next preload retries under the new policy
        *backend.fail_on.lock() = None;
        m.preload().unwrap();
        assert_eq!(m.status().device, Some(ActiveDevice::Local(Device::Accelerator(1))));
    }

    #[test]
    fn test_waiters_retry_after_failed_load() {
        let backend = Arc::new(MockBackend {
            delay: Duration::from_millis(20),
            ..Default::default()
        });
        *backend.fail_on.lock() = Some(Device::Cpu);
        let m = manager(backend.clone(), 0, "cpu");

        assert!(m.preload().is_err());
        assert_eq!(m.status().phase, Phase::Unloaded);
        assert!(m.preload().is_err());
        assert_eq!(m.load_count(), 2);
    }

    #[test]
    fn test_panicking_backend_does_not_wedge_state() {
        let backend = Arc::new(MockBackend::default());
        let m = Arc::new(manager(backend, 8, "accelerator:7"));

        let loader = m.clone();
        assert!(thread::spawn(move || loader.preload()).join().is_err());
        assert_eq!(m.status().phase, Phase::Unloaded);

        m.reload("cpu").unwrap();
        assert!(m.status().is_ready());
    }

    #[test]
    fn test_remote_policy_builds_nothing() {
        let backend = Arc::new(MockBackend::default());
        let m = manager(backend.clone(), 1, "remote");
        let status = m.preload().unwrap();
        assert_eq!(status.device, Some(ActiveDevice::Delegated));
        assert_eq!(m.load_count(), 0);

        m.reload("cpu").unwrap();
        assert_eq!(m.reload("remote:gpu").unwrap(), ReloadOutcome::Delegated);
        assert_eq!(backend.releases.load(Ordering::SeqCst), 1);
        assert_eq!(m.load_count(), 1);
        assert_eq!(m.status().device.unwrap().to_string(), "remote");
        assert!(m.with_engine(|_| Ok(())).is_err());
    }

    #[test]
    fn test_status_reports_loading() {
        let backend = Arc::new(MockBackend {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let m = Arc::new(manager(backend, 0, "cpu"));
        let loader = m.clone();
        let handle = thread::spawn(move || loader.preload());

        let deadline = Instant::now() + Duration::from_secs(2);
        while !m.status().is_loading() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(m.status().is_loading());
        handle.join().unwrap().unwrap();
        assert!(m.status().is_ready());
    }

    #[test]
    fn test_shutdown_releases() {
        let backend = Arc::new(MockBackend::default());
        let m = manager(backend.clone(), 0, "cpu");
        m.preload().unwrap();
        m.with_engine(|engine| {
            assert_eq!(engine.synthesize("abc", &Voice::named("a"), 1.0).unwrap().len(), 3);
            Ok(())
        })
        .unwrap();

        m.shutdown();
        assert_eq!(m.status().phase, Phase::Unloaded);
        assert_eq!(backend.releases.load(Ordering::SeqCst), 1);
        m.preload().unwrap();
        assert_eq!(m.load_count(), 2);
    }
}
