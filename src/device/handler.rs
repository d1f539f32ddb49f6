// Output device lifecycle:
//   Uninitialized -> Initializing -> Ready <-> Started
// failure or cancel drops back to Uninitialized, as do shutdown and device loss.
// Endpoints are opened on a worker thread. Buffer traffic shares the state
// mutex, held for one call or one DeviceBuffer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};

use super::backend::{DeviceBackend, DeviceInfo, DeviceSession, StreamFormat};
use super::error::{DeviceError, DeviceResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Uninitialized,
    Initializing,
    Ready,
    Started,
}

pub enum InitRequest {
    Pending(InitTicket),
    // an earlier initialization is still running, nothing new was launched
    NotYetReady,
}

impl InitRequest {
    pub fn is_pending(&self) -> bool {
        matches!(self, InitRequest::Pending(_))
    }

    pub fn wait(self) -> DeviceResult<DeviceInfo> {
        match self {
            InitRequest::Pending(ticket) => ticket.wait(),
            InitRequest::NotYetReady => Err(DeviceError::NotReady),
        }
    }
}

pub struct InitTicket {
    rx: Receiver<DeviceResult<DeviceInfo>>,
}

impl InitTicket {
    // a ticket whose outcome is already known
    fn settled(result: DeviceResult<DeviceInfo>) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let _ = tx.send(result);
        Self { rx }
    }

    pub fn wait(&self) -> DeviceResult<DeviceInfo> {
        self.rx.recv().unwrap_or(Err(DeviceError::Cancelled))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<DeviceResult<DeviceInfo>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(DeviceError::Cancelled)),
        }
    }
}

struct Inner {
    state: DeviceState,
    session: Option<Box<dyn DeviceSession>>,
    device: Option<DeviceInfo>,
    format: Option<StreamFormat>,
    generation: u64,
    cancel: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Inner {
    // error for a call that needs a session but there is none
    fn missing(&self) -> DeviceError {
        if self.state == DeviceState::Initializing { DeviceError::NotReady } else { DeviceError::NotInitialized }
    }

    fn teardown(&mut self) {
        if let Some(session) = self.session.as_deref_mut() {
            if self.state == DeviceState::Started {
                if let Err(e) = session.stop() {
                    log::warn!("stopping {} during teardown: {e}", session.info().name);
                }
            }
        }
        self.session = None;
        self.device = None;
        self.format = None;
    }
}

struct Shared {
    backend: Arc<dyn DeviceBackend>,
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // Pass a session error through, dropping the session first if the device is gone.
    fn fail(&self, inner: &mut Inner, err: DeviceError) -> DeviceError {
        if matches!(err, DeviceError::Lost) {
            log::warn!(
                "audio device {} lost; back to uninitialized",
                inner.device.as_ref().map_or("?", |d| d.name.as_str())
            );
            inner.session = None;
            inner.device = None;
            inner.format = None;
            inner.state = DeviceState::Uninitialized;
            self.changed.notify_all();
        }
        err
    }

    fn commit(
        &self,
        generation: u64,
        cancel: &AtomicBool,
        result: DeviceResult<(Box<dyn DeviceSession>, StreamFormat)>,
    ) -> DeviceResult<DeviceInfo> {
        let mut inner = self.lock();
        if cancel.load(Ordering::Acquire) || inner.generation != generation {
            log::debug!("discarding cancelled device initialization");
            return Err(DeviceError::Cancelled);
        }
        let outcome = match result {
            Ok((session, format)) => {
                let info = session.info().clone();
                log::info!(
                    "audio device ready: {} [{}] {} ch @ {} Hz",
                    info.name,
                    info.id,
                    format.channels,
                    format.sample_rate
                );
                inner.session = Some(session);
                inner.device = Some(info.clone());
                inner.format = Some(format);
                inner.state = DeviceState::Ready;
                Ok(info)
            }
            Err(e) => {
                log::error!("audio device initialization failed: {e}");
                inner.state = DeviceState::Uninitialized;
                Err(e)
            }
        };
        self.changed.notify_all();
        outcome
    }
}

// Requested id (or the default), else the first enumerated endpoint.
fn open_endpoint(
    backend: &dyn DeviceBackend,
    requested: Option<&str>,
) -> DeviceResult<(Box<dyn DeviceSession>, StreamFormat)> {
    let first = match requested {
        Some(id) => backend.open(id),
        None => backend.default_device().and_then(|d| backend.open(&d.id)),
    };
    let mut session = match first {
        Ok(session) => session,
        Err(e) => {
            log::warn!("could not open {}: {e}", requested.unwrap_or("default output device"));
            let devices = backend.enumerate()?;
            let fallback = devices.first().ok_or(DeviceError::NoDevices)?;
            log::warn!("falling back to first output device {} [{}]", fallback.name, fallback.id);
            backend.open(&fallback.id)?
        }
    };

    let mut format = session.mix_format()?;
    if !format.is_usable() {
        log::warn!(
            "{} reported an unusable format ({} ch @ {} Hz); using {} ch / {}-bit @ {} Hz",
            session.info().name,
            format.channels,
            format.sample_rate,
            StreamFormat::FALLBACK.channels,
            StreamFormat::FALLBACK.bits_per_sample,
            StreamFormat::FALLBACK.sample_rate
        );
        format = StreamFormat::FALLBACK;
    }
    session.initialize(format)?;
    Ok((session, format))
}

pub struct AudioDeviceHandler {
    shared: Arc<Shared>,
}

impl AudioDeviceHandler {
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                inner: Mutex::new(Inner {
                    state: DeviceState::Uninitialized,
                    session: None,
                    device: None,
                    format: None,
                    generation: 0,
                    cancel: Arc::new(AtomicBool::new(false)),
                    worker: None,
                }),
                changed: Condvar::new(),
            }),
        }
    }

    pub fn enumerate(&self) -> DeviceResult<Vec<DeviceInfo>> {
        self.shared.backend.enumerate()
    }

    // tears down any open session first
    pub fn initialize(&self, device_id: Option<&str>) -> InitRequest {
        let mut inner = self.shared.lock();
        if inner.state == DeviceState::Initializing {
            log::debug!("device initialization already in flight");
            return InitRequest::NotYetReady;
        }
        inner.teardown();
        inner.state = DeviceState::Initializing;
        inner.generation += 1;
        let generation = inner.generation;
        let cancel = Arc::new(AtomicBool::new(false));
        inner.cancel = cancel.clone();

        let (tx, rx) = crossbeam_channel::bounded(1);
        let shared = self.shared.clone();
        let requested = device_id.map(str::to_owned);
        let spawned = std::thread::Builder::new().name("device-init".into()).spawn(move || {
            let result = open_endpoint(shared.backend.as_ref(), requested.as_deref());
            let outcome = shared.commit(generation, &cancel, result);
            let _ = tx.send(outcome);
        });
        match spawned {
            Ok(handle) => {
                inner.worker = Some(handle);
                InitRequest::Pending(InitTicket { rx })
            }
            Err(e) => {
                log::error!("could not spawn device init worker: {e}");
                inner.state = DeviceState::Uninitialized;
                self.shared.changed.notify_all();
                InitRequest::Pending(InitTicket::settled(Err(DeviceError::Backend(format!(
                    "could not spawn device init worker: {e}"
                )))))
            }
        }
    }

    // whatever the worker opens afterwards is dropped, not committed
    pub fn cancel_initialization(&self) -> bool {
        let mut inner = self.shared.lock();
        if inner.state != DeviceState::Initializing {
            return false;
        }
        inner.cancel.store(true, Ordering::Release);
        inner.generation += 1;
        inner.state = DeviceState::Uninitialized;
        self.shared.changed.notify_all();
        log::info!("device initialization cancelled");
        true
    }

    pub fn wait_until_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.lock();
        loop {
            match inner.state {
                DeviceState::Ready | DeviceState::Started => return true,
                DeviceState::Uninitialized => return false,
                DeviceState::Initializing => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            inner = self
                .shared
                .changed
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    pub fn state(&self) -> DeviceState {
        self.shared.lock().state
    }

    pub fn device(&self) -> Option<DeviceInfo> {
        self.shared.lock().device.clone()
    }

    pub fn format(&self) -> Option<StreamFormat> {
        self.shared.lock().format
    }

    pub fn start(&self) -> DeviceResult<()> {
        let mut inner = self.shared.lock();
        match inner.state {
            DeviceState::Started => return Ok(()),
            DeviceState::Ready => {}
            _ => return Err(inner.missing()),
        }
        let Some(session) = inner.session.as_deref_mut() else {
            return Err(inner.missing());
        };
        if let Err(e) = session.start() {
            log::error!("failed to start audio device: {e}");
            return Err(self.shared.fail(&mut inner, e));
        }
        inner.state = DeviceState::Started;
        self.shared.changed.notify_all();
        log::info!("audio device started");
        Ok(())
    }

    pub fn stop(&self) -> DeviceResult<()> {
        let mut inner = self.shared.lock();
        match inner.state {
            DeviceState::Ready => return Ok(()),
            DeviceState::Started => {}
            _ => return Err(inner.missing()),
        }
        let Some(session) = inner.session.as_deref_mut() else {
            return Err(inner.missing());
        };
        if let Err(e) = session.stop() {
            log::error!("failed to stop audio device: {e}");
            return Err(self.shared.fail(&mut inner, e));
        }
        inner.state = DeviceState::Ready;
        self.shared.changed.notify_all();
        log::info!("audio device stopped");
        Ok(())
    }

    pub fn shutdown(&self) {
        let worker = {
            let mut inner = self.shared.lock();
            inner.cancel.store(true, Ordering::Release);
            inner.generation += 1;
            let was = inner.state;
            inner.teardown();
            inner.state = DeviceState::Uninitialized;
            self.shared.changed.notify_all();
            if was != DeviceState::Uninitialized {
                log::info!("audio device shut down");
            }
            inner.worker.take()
        };
        // the worker takes the lock to commit, so join outside it
        if let Some(worker) = worker {
            let _ = worker.join();
        }
    }

    pub fn buffer_frame_count(&self) -> DeviceResult<u32> {
        let inner = self.shared.lock();
        match inner.session.as_deref() {
            Some(session) => Ok(session.buffer_frame_count()),
            None => Err(inner.missing()),
        }
    }

    pub fn current_padding(&self) -> DeviceResult<u32> {
        let mut inner = self.shared.lock();
        let result = match inner.session.as_deref_mut() {
            Some(session) => session.current_padding(),
            None => return Err(inner.missing()),
        };
        result.map_err(|e| self.shared.fail(&mut inner, e))
    }

    // the handler stays locked until the buffer is released or dropped
    pub fn get_buffer(&self, frames: u32) -> DeviceResult<DeviceBuffer<'_>> {
        let mut inner = self.shared.lock();
        let Some(channels) = inner.format.map(|f| f.channels) else {
            return Err(inner.missing());
        };
        let result = match inner.session.as_deref_mut() {
            Some(session) => session.get_buffer(frames),
            None => return Err(inner.missing()),
        };
        if let Err(e) = result {
            return Err(self.shared.fail(&mut inner, e));
        }
        Ok(DeviceBuffer { guard: inner, shared: &self.shared, frames, channels, released: false })
    }
}

impl Drop for AudioDeviceHandler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// Dropping it unreleased commits nothing.
pub struct DeviceBuffer<'a> {
    guard: MutexGuard<'a, Inner>,
    shared: &'a Shared,
    frames: u32,
    channels: u16,
    released: bool,
}

impl DeviceBuffer<'_> {
    pub fn frames(&self) -> u32 {
        self.frames
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    // interleaved, frames * channels long
    pub fn samples_mut(&mut self) -> &mut [i16] {
        match self.guard.session.as_deref_mut() {
            Some(session) => session.buffer_mut(),
            None => Default::default(),
        }
    }

    pub fn release(mut self, frames: u32) -> DeviceResult<()> {
        self.released = true;
        let frames = frames.min(self.frames);
        self.commit(frames)
    }

    fn commit(&mut self, frames: u32) -> DeviceResult<()> {
        let result = match self.guard.session.as_deref_mut() {
            Some(session) => session.release_buffer(frames),
            None => Err(DeviceError::NotInitialized),
        };
        result.map_err(|e| self.shared.fail(&mut self.guard, e))
    }
}

impl Drop for DeviceBuffer<'_> {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.commit(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::offline::OfflineBackend;

    const WAIT: Duration = Duration::from_secs(5);

    fn stereo() -> StreamFormat {
        StreamFormat { channels: 2, sample_rate: 48000, bits_per_sample: 32 }
    }

    #[test]
    fn invalid_id_falls_back_to_first_endpoint() {
        let backend = OfflineBackend::new()
            .with_endpoint("hw:0", "Speakers", stereo())
            .with_endpoint("hw:1", "Headphones", stereo());
        let handler = AudioDeviceHandler::new(Arc::new(backend));
        let info = handler.initialize(Some("no-such-device")).wait().unwrap();
        assert_eq!(info, DeviceInfo { id: "hw:0".into(), name: "Speakers".into() });
        assert_eq!(handler.state(), DeviceState::Ready);
        assert_eq!(handler.device(), Some(info));
    }

    #[test]
    fn default_device_is_used_when_no_id_given() {
        let backend = OfflineBackend::new()
            .with_endpoint("hw:0", "Speakers", stereo())
            .with_endpoint("hw:1", "Headphones", stereo())
            .with_default("hw:1");
        let handler = AudioDeviceHandler::new(Arc::new(backend));
        assert_eq!(handler.initialize(None).wait().unwrap().id, "hw:1");
    }

    #[test]
    fn no_endpoints_fails_cleanly() {
        let handler = AudioDeviceHandler::new(Arc::new(OfflineBackend::new()));
        assert!(matches!(handler.initialize(None).wait(), Err(DeviceError::NoDevices)));
        assert_eq!(handler.state(), DeviceState::Uninitialized);
        assert!(!handler.wait_until_ready(Duration::from_millis(10)));
    }

    #[test]
    fn second_initialize_while_in_flight_is_refused() {
        let backend = OfflineBackend::new()
            .with_endpoint("hw:0", "Speakers", stereo())
            .with_open_delay(Duration::from_millis(200));
        let handler = AudioDeviceHandler::new(Arc::new(backend));
        let first = handler.initialize(None);
        assert!(first.is_pending());
        assert_eq!(handler.state(), DeviceState::Initializing);
        assert!(!handler.initialize(None).is_pending());
        assert!(matches!(handler.get_buffer(16), Err(DeviceError::NotReady)));
        assert!(handler.wait_until_ready(WAIT));
        assert!(first.wait().is_ok());
    }

    #[test]
    fn zero_channel_format_falls_back_to_stereo_16_bit() {
        let broken = StreamFormat { channels: 0, sample_rate: 96000, bits_per_sample: 24 };
        let backend = OfflineBackend::new().with_endpoint("hw:0", "Odd", broken);
        let handler = AudioDeviceHandler::new(Arc::new(backend));
        handler.initialize(None).wait().unwrap();
        assert_eq!(handler.format(), Some(StreamFormat::FALLBACK));
    }

    #[test]
    fn cancelled_initialization_is_not_committed() {
        let backend = OfflineBackend::new()
            .with_endpoint("hw:0", "Speakers", stereo())
            .with_open_delay(Duration::from_millis(100));
        let handler = AudioDeviceHandler::new(Arc::new(backend));
        let ticket = handler.initialize(None);
        assert!(handler.cancel_initialization());
        assert_eq!(handler.state(), DeviceState::Uninitialized);
        assert!(matches!(ticket.wait(), Err(DeviceError::Cancelled)));
        assert_eq!(handler.state(), DeviceState::Uninitialized);
        assert!(handler.device().is_none());
        assert!(!handler.cancel_initialization());
    }

    #[test]
    fn lifecycle_and_buffer_pass_through() {
        let backend = OfflineBackend::new()
            .with_endpoint("hw:0", "Speakers", stereo())
            .with_buffer_frames(64)
            .with_capture();
        let capture = backend.capture();
        let handler = AudioDeviceHandler::new(Arc::new(backend));

        assert!(matches!(handler.current_padding(), Err(DeviceError::NotInitialized)));
        assert!(matches!(handler.start(), Err(DeviceError::NotInitialized)));

        handler.initialize(None).wait().unwrap();
        assert_eq!(handler.buffer_frame_count().unwrap(), 64);
        handler.start().unwrap();
        assert_eq!(handler.state(), DeviceState::Started);

        let mut buf = handler.get_buffer(4).unwrap();
        assert_eq!(buf.samples_mut().len(), 8);
        buf.samples_mut().copy_from_slice(&[1, -1, 2, -2, 3, -3, 4, -4]);
        buf.release(4).unwrap();
        assert_eq!(capture.samples(), vec![1, -1, 2, -2, 3, -3, 4, -4]);

        // an unreleased buffer commits nothing
        drop(handler.get_buffer(4).unwrap());
        assert_eq!(capture.frames(), 4);
        assert!(matches!(handler.get_buffer(65), Err(DeviceError::BufferTooLarge { .. })));

        handler.stop().unwrap();
        assert_eq!(handler.state(), DeviceState::Ready);
        handler.shutdown();
        assert_eq!(handler.state(), DeviceState::Uninitialized);
        assert!(matches!(handler.get_buffer(1), Err(DeviceError::NotInitialized)));
    }

    #[test]
    fn settled_ticket_reports_its_own_error() {
        let ticket = InitTicket::settled(Err(DeviceError::Backend("spawn failed".into())));
        assert!(matches!(ticket.wait_timeout(Duration::ZERO), Some(Err(DeviceError::Backend(_)))));
        // only one outcome per ticket; afterwards the channel is closed
        assert!(matches!(ticket.wait(), Err(DeviceError::Cancelled)));
    }

    #[test]
    fn device_loss_resets_to_uninitialized() {
        let backend = OfflineBackend::new().with_endpoint("hw:0", "Speakers", stereo());
        let capture = backend.capture();
        let handler = AudioDeviceHandler::new(Arc::new(backend));
        handler.initialize(None).wait().unwrap();
        handler.start().unwrap();
        capture.lose_device();
        assert!(matches!(handler.current_padding(), Err(DeviceError::Lost)));
        assert_eq!(handler.state(), DeviceState::Uninitialized);
        assert!(handler.format().is_none());
    }
}
