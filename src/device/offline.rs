// In-memory endpoints. Nothing is played: released frames are counted, kept in
// memory only when asked to (with_capture), and optionally streamed into a WAV
// file. A started endpoint drains instantly, so the render loop can run as
// fast as it is driven.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::backend::{DeviceBackend, DeviceInfo, DeviceSession, StreamFormat};
use super::error::{DeviceError, DeviceResult};

const DEFAULT_BUFFER_FRAMES: u32 = 1024;

#[derive(Clone, Debug)]
struct Endpoint {
    info: DeviceInfo,
    format: StreamFormat,
}

#[derive(Default)]
struct CaptureState {
    channels: u16,
    sample_rate: u32,
    frames: usize,
    retain: bool,
    samples: Vec<i16>,
    wav_path: Option<PathBuf>,
    wav: Option<hound::WavWriter<BufWriter<File>>>,
    lost: bool,
}

#[derive(Clone, Default)]
pub struct OfflineCapture {
    state: Arc<Mutex<CaptureState>>,
}

impl OfflineCapture {
    fn lock(&self) -> MutexGuard<'_, CaptureState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn channels(&self) -> u16 {
        self.lock().channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.lock().sample_rate
    }

    pub fn frames(&self) -> usize {
        self.lock().frames
    }

    // empty unless the backend was built with_capture
    pub fn samples(&self) -> Vec<i16> {
        self.lock().samples.clone()
    }

    // later calls on the open session report Lost
    pub fn lose_device(&self) {
        self.lock().lost = true;
    }

    pub fn finalize(&self) -> anyhow::Result<()> {
        let writer = self.lock().wav.take();
        if let Some(writer) = writer {
            writer.finalize()?;
        }
        Ok(())
    }
}

pub struct OfflineBackend {
    endpoints: Vec<Endpoint>,
    default_id: Option<String>,
    buffer_frames: u32,
    open_delay: Duration,
    capture: OfflineCapture,
}

impl OfflineBackend {
    pub fn new() -> Self {
        Self {
            endpoints: Vec::new(),
            default_id: None,
            buffer_frames: DEFAULT_BUFFER_FRAMES,
            open_delay: Duration::ZERO,
            capture: OfflineCapture::default(),
        }
    }

    pub fn with_endpoint(mut self, id: &str, name: &str, format: StreamFormat) -> Self {
        self.endpoints.push(Endpoint {
            info: DeviceInfo { id: id.to_string(), name: name.to_string() },
            format,
        });
        self
    }

    pub fn with_default(mut self, id: &str) -> Self {
        self.default_id = Some(id.to_string());
        self
    }

    pub fn with_buffer_frames(mut self, frames: u32) -> Self {
        self.buffer_frames = frames.max(1);
        self
    }

    pub fn with_capture(self) -> Self {
        self.capture.lock().retain = true;
        self
    }

    // simulate a slow driver
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    // the file is created when a session initializes
    pub fn with_wav_output(self, path: &Path) -> Self {
        self.capture.lock().wav_path = Some(path.to_path_buf());
        self
    }

    pub fn capture(&self) -> OfflineCapture {
        self.capture.clone()
    }
}

impl Default for OfflineBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBackend for OfflineBackend {
    fn enumerate(&self) -> DeviceResult<Vec<DeviceInfo>> {
        Ok(self.endpoints.iter().map(|e| e.info.clone()).collect())
    }

    fn default_device(&self) -> DeviceResult<DeviceInfo> {
        let endpoint = match &self.default_id {
            Some(id) => self.endpoints.iter().find(|e| &e.info.id == id),
            None => self.endpoints.first(),
        };
        endpoint.map(|e| e.info.clone()).ok_or(DeviceError::NoDevices)
    }

    fn open(&self, id: &str) -> DeviceResult<Box<dyn DeviceSession>> {
        if !self.open_delay.is_zero() {
            std::thread::sleep(self.open_delay);
        }
        let endpoint = self
            .endpoints
            .iter()
            .find(|e| e.info.id == id)
            .ok_or_else(|| DeviceError::DeviceNotFound(id.to_string()))?;
        self.capture.lock().lost = false;
        Ok(Box::new(OfflineSession {
            endpoint: endpoint.clone(),
            buffer_frames: self.buffer_frames,
            format: None,
            started: false,
            queued: 0,
            reserved: 0,
            scratch: Vec::new(),
            capture: self.capture.clone(),
        }))
    }
}

struct OfflineSession {
    endpoint: Endpoint,
    buffer_frames: u32,
    format: Option<StreamFormat>,
    started: bool,
    queued: u32,
    reserved: u32,
    scratch: Vec<i16>,
    capture: OfflineCapture,
}

impl OfflineSession {
    fn check(&self) -> DeviceResult<StreamFormat> {
        if self.capture.lock().lost {
            return Err(DeviceError::Lost);
        }
        self.format.ok_or(DeviceError::NotInitialized)
    }
}

impl DeviceSession for OfflineSession {
    fn info(&self) -> &DeviceInfo {
        &self.endpoint.info
    }

    fn mix_format(&self) -> DeviceResult<StreamFormat> {
        Ok(self.endpoint.format)
    }

    fn initialize(&mut self, format: StreamFormat) -> DeviceResult<()> {
        let mut capture = self.capture.lock();
        capture.channels = format.channels;
        capture.sample_rate = format.sample_rate;
        if let Some(path) = capture.wav_path.clone() {
            let spec = hound::WavSpec {
                channels: format.channels,
                sample_rate: format.sample_rate,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let writer = hound::WavWriter::create(&path, spec)
                .map_err(|e| DeviceError::StreamBuild(format!("{}: {e}", path.display())))?;
            capture.wav = Some(writer);
        }
        drop(capture);

        self.scratch = vec![0; self.buffer_frames as usize * format.channels as usize];
        self.format = Some(format);
        Ok(())
    }

    fn buffer_frame_count(&self) -> u32 {
        self.buffer_frames
    }

    fn current_padding(&mut self) -> DeviceResult<u32> {
        self.check()?;
        Ok(self.queued)
    }

    fn get_buffer(&mut self, frames: u32) -> DeviceResult<()> {
        let format = self.check()?;
        let available = self.buffer_frames - self.queued;
        if frames > available {
            return Err(DeviceError::BufferTooLarge { requested: frames, available });
        }
        let len = frames as usize * format.channels as usize;
        self.scratch[..len].fill(0);
        self.reserved = frames;
        Ok(())
    }

    fn buffer_mut(&mut self) -> &mut [i16] {
        let channels = self.format.map_or(0, |f| f.channels as usize);
        &mut self.scratch[..self.reserved as usize * channels]
    }

    fn release_buffer(&mut self, frames: u32) -> DeviceResult<()> {
        let format = self.check()?;
        let frames = frames.min(self.reserved);
        self.reserved = 0;
        if frames == 0 {
            return Ok(());
        }
        let written = &self.scratch[..frames as usize * format.channels as usize];

        let mut capture = self.capture.lock();
        capture.frames += frames as usize;
        if capture.retain {
            capture.samples.extend_from_slice(written);
        }
        if let Some(wav) = capture.wav.as_mut() {
            for &s in written {
                wav.write_sample(s).map_err(|e| DeviceError::StreamControl(e.to_string()))?;
            }
        }
        drop(capture);

        // a started endpoint plays everything immediately
        if !self.started {
            self.queued += frames;
        }
        Ok(())
    }

    fn start(&mut self) -> DeviceResult<()> {
        self.check()?;
        self.started = true;
        self.queued = 0;
        Ok(())
    }

    fn stop(&mut self) -> DeviceResult<()> {
        self.check()?;
        self.started = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono() -> StreamFormat {
        StreamFormat { channels: 1, sample_rate: 8000, bits_per_sample: 16 }
    }

    #[test]
    fn unstarted_endpoint_fills_up() {
        let backend = OfflineBackend::new().with_endpoint("a", "A", mono()).with_buffer_frames(8);
        let mut session = backend.open("a").unwrap();
        assert!(matches!(session.get_buffer(1), Err(DeviceError::NotInitialized)));
        session.initialize(mono()).unwrap();

        session.get_buffer(8).unwrap();
        session.release_buffer(8).unwrap();
        assert_eq!(session.current_padding().unwrap(), 8);
        assert!(matches!(session.get_buffer(1), Err(DeviceError::BufferTooLarge { .. })));

        session.start().unwrap();
        assert_eq!(session.current_padding().unwrap(), 0);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let backend = OfflineBackend::new().with_endpoint("a", "A", mono());
        assert!(matches!(backend.open("b"), Err(DeviceError::DeviceNotFound(_))));
        assert_eq!(backend.default_device().unwrap().id, "a");
    }

    #[test]
    fn writes_released_frames_to_wav() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.wav");
        let backend = OfflineBackend::new().with_endpoint("a", "A", mono()).with_wav_output(&path);
        let capture = backend.capture();
        let mut session = backend.open("a").unwrap();
        session.initialize(mono()).unwrap();
        session.start().unwrap();
        session.get_buffer(3).unwrap();
        session.buffer_mut().copy_from_slice(&[10, 20, 30]);
        session.release_buffer(2).unwrap();
        capture.finalize().unwrap();

        let reader = hound::WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().sample_rate, 8000);
        let samples: Vec<i16> = reader.into_samples::<i16>().map(Result::unwrap).collect();
        assert_eq!(samples, vec![10, 20]);
        // streamed to disk only
        assert_eq!(capture.frames(), 2);
        assert!(capture.samples().is_empty());
    }

    #[test]
    fn capture_keeps_samples_when_asked() {
        let backend = OfflineBackend::new().with_endpoint("a", "A", mono()).with_capture();
        let capture = backend.capture();
        let mut session = backend.open("a").unwrap();
        session.initialize(mono()).unwrap();
        session.get_buffer(2).unwrap();
        session.buffer_mut().copy_from_slice(&[7, 8]);
        session.release_buffer(2).unwrap();
        assert_eq!(capture.frames(), 2);
        assert_eq!(capture.samples(), vec![7, 8]);
    }
}
