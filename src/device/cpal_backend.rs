// cpal is callback driven; the render loop pulls. The two meet in an rtrb ring:
// the render loop writes whole frames into the producer, the stream callback
// drains the consumer, and "padding" is simply what is still in the ring.
// cpal streams are not Send on every platform, so each one lives on its own
// thread and is driven over a small control channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use crossbeam_channel::Sender;

use super::backend::{DeviceBackend, DeviceInfo, DeviceSession, StreamFormat};
use super::error::{DeviceError, DeviceResult};

pub const DEFAULT_LATENCY_FRAMES: u32 = 2048;

pub struct CpalBackend {
    latency_frames: u32,
}

impl CpalBackend {
    pub fn new(latency_frames: u32) -> Self {
        Self { latency_frames: latency_frames.max(64) }
    }
}

impl Default for CpalBackend {
    fn default() -> Self {
        Self::new(DEFAULT_LATENCY_FRAMES)
    }
}

// cpal 0.15 has no stable endpoint ids; the device name doubles as one.
fn device_info(device: &cpal::Device) -> Option<DeviceInfo> {
    let name = device.name().ok()?;
    Some(DeviceInfo { id: name.clone(), name })
}

fn find_output_device(id: &str) -> DeviceResult<cpal::Device> {
    let host = cpal::default_host();
    let mut devices = host.output_devices().map_err(|e| DeviceError::Backend(e.to_string()))?;
    devices
        .find(|d| d.name().is_ok_and(|n| n == id))
        .ok_or_else(|| DeviceError::DeviceNotFound(id.to_string()))
}

impl DeviceBackend for CpalBackend {
    fn enumerate(&self) -> DeviceResult<Vec<DeviceInfo>> {
        let host = cpal::default_host();
        let devices = host.output_devices().map_err(|e| DeviceError::Backend(e.to_string()))?;
        Ok(devices.filter_map(|d| device_info(&d)).collect())
    }

    fn default_device(&self) -> DeviceResult<DeviceInfo> {
        let host = cpal::default_host();
        host.default_output_device()
            .and_then(|d| device_info(&d))
            .ok_or(DeviceError::NoDevices)
    }

    fn open(&self, id: &str) -> DeviceResult<Box<dyn DeviceSession>> {
        let device = find_output_device(id)?;
        let info = device_info(&device).ok_or_else(|| DeviceError::DeviceNotFound(id.to_string()))?;
        let config = device
            .default_output_config()
            .map_err(|e| DeviceError::Format(e.to_string()))?;
        let mix_format = StreamFormat {
            channels: config.channels(),
            sample_rate: config.sample_rate().0,
            bits_per_sample: (config.sample_format().sample_size() * 8) as u16,
        };
        Ok(Box::new(CpalSession {
            info,
            mix_format,
            sample_format: config.sample_format(),
            latency_frames: self.latency_frames,
            channels: 0,
            producer: None,
            ring_capacity: 0,
            scratch: Vec::new(),
            reserved: 0,
            lost: Arc::new(AtomicBool::new(false)),
            stream: None,
        }))
    }
}

enum StreamControl {
    Play(Sender<DeviceResult<()>>),
    Pause(Sender<DeviceResult<()>>),
    Close,
}

struct StreamThread {
    tx: Sender<StreamControl>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    fn request(&self, make: impl FnOnce(Sender<DeviceResult<()>>) -> StreamControl) -> DeviceResult<()> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.tx
            .send(make(reply_tx))
            .map_err(|_| DeviceError::StreamControl("stream thread has exited".into()))?;
        reply_rx
            .recv()
            .map_err(|_| DeviceError::StreamControl("stream thread has exited".into()))?
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        let _ = self.tx.send(StreamControl::Close);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct CpalSession {
    info: DeviceInfo,
    mix_format: StreamFormat,
    sample_format: cpal::SampleFormat,
    latency_frames: u32,
    channels: usize,
    producer: Option<rtrb::Producer<i16>>,
    ring_capacity: usize,
    scratch: Vec<i16>,
    reserved: u32,
    lost: Arc<AtomicBool>,
    stream: Option<StreamThread>,
}

impl CpalSession {
    fn producer(&mut self) -> DeviceResult<&mut rtrb::Producer<i16>> {
        if self.lost.load(Ordering::Acquire) {
            return Err(DeviceError::Lost);
        }
        self.producer.as_mut().ok_or(DeviceError::NotInitialized)
    }

    fn stream(&self) -> DeviceResult<&StreamThread> {
        if self.lost.load(Ordering::Acquire) {
            return Err(DeviceError::Lost);
        }
        self.stream.as_ref().ok_or(DeviceError::NotInitialized)
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut consumer: rtrb::Consumer<i16>,
    lost: Arc<AtomicBool>,
) -> DeviceResult<cpal::Stream>
where
    T: SizedSample + FromSample<i16>,
{
    let channels = config.channels as usize;
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _info: &cpal::OutputCallbackInfo| {
                for frame in data.chunks_mut(channels) {
                    // only whole frames, so an underrun never shifts channels
                    if consumer.slots() >= frame.len() {
                        for out in frame.iter_mut() {
                            *out = consumer.pop().map_or(T::EQUILIBRIUM, T::from_sample);
                        }
                    } else {
                        frame.fill(T::EQUILIBRIUM);
                    }
                }
            },
            move |err| {
                log::error!("audio output stream error: {err}");
                if matches!(err, cpal::StreamError::DeviceNotAvailable) {
                    lost.store(true, Ordering::Release);
                }
            },
            None,
        )
        .map_err(|e| DeviceError::StreamBuild(e.to_string()))
}

fn spawn_stream_thread(
    device_id: String,
    sample_format: cpal::SampleFormat,
    config: cpal::StreamConfig,
    consumer: rtrb::Consumer<i16>,
    lost: Arc<AtomicBool>,
) -> DeviceResult<StreamThread> {
    let (ctl_tx, ctl_rx) = crossbeam_channel::unbounded::<StreamControl>();
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<DeviceResult<()>>(1);

    let handle = std::thread::Builder::new()
        .name("cpal-output".into())
        .spawn(move || {
            let built = find_output_device(&device_id).and_then(|device| match sample_format {
                cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, consumer, lost),
                cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, consumer, lost),
                cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, consumer, lost),
                cpal::SampleFormat::I32 => build_stream::<i32>(&device, &config, consumer, lost),
                other => Err(DeviceError::Format(format!("unsupported sample format {other:?}"))),
            });
            let stream = match built {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            for ctl in ctl_rx.iter() {
                match ctl {
                    StreamControl::Play(reply) => {
                        let _ = reply.send(stream.play().map_err(|e| DeviceError::StreamControl(e.to_string())));
                    }
                    StreamControl::Pause(reply) => {
                        let _ = reply.send(stream.pause().map_err(|e| DeviceError::StreamControl(e.to_string())));
                    }
                    StreamControl::Close => break,
                }
            }
            log::debug!("closing output stream for {device_id}");
        })
        .map_err(|e| DeviceError::StreamBuild(e.to_string()))?;

    let thread = StreamThread { tx: ctl_tx, handle: Some(handle) };
    match ready_rx.recv() {
        Ok(Ok(())) => Ok(thread),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(DeviceError::StreamBuild("stream thread exited during setup".into())),
    }
}

impl DeviceSession for CpalSession {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn mix_format(&self) -> DeviceResult<StreamFormat> {
        Ok(self.mix_format)
    }

    fn initialize(&mut self, format: StreamFormat) -> DeviceResult<()> {
        let channels = format.channels as usize;
        let capacity = self.latency_frames as usize * channels;
        let (producer, consumer) = rtrb::RingBuffer::<i16>::new(capacity);
        let config = cpal::StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        self.lost.store(false, Ordering::Release);
        let stream = spawn_stream_thread(self.info.id.clone(), self.sample_format, config, consumer, self.lost.clone())?;
        log::debug!(
            "{}: {:?} stream, ring of {} frames",
            self.info.name,
            self.sample_format,
            self.latency_frames
        );

        self.channels = channels;
        self.ring_capacity = capacity;
        self.scratch = vec![0; capacity];
        self.producer = Some(producer);
        self.stream = Some(stream);
        Ok(())
    }

    fn buffer_frame_count(&self) -> u32 {
        self.latency_frames
    }

    fn current_padding(&mut self) -> DeviceResult<u32> {
        let capacity = self.ring_capacity;
        let channels = self.channels.max(1);
        let free = self.producer()?.slots();
        Ok(((capacity - free) / channels) as u32)
    }

    fn get_buffer(&mut self, frames: u32) -> DeviceResult<()> {
        let channels = self.channels.max(1);
        let available = (self.producer()?.slots() / channels) as u32;
        if frames > available {
            return Err(DeviceError::BufferTooLarge { requested: frames, available });
        }
        self.scratch[..frames as usize * channels].fill(0);
        self.reserved = frames;
        Ok(())
    }

    fn buffer_mut(&mut self) -> &mut [i16] {
        let len = self.reserved as usize * self.channels;
        &mut self.scratch[..len]
    }

    fn release_buffer(&mut self, frames: u32) -> DeviceResult<()> {
        let frames = frames.min(self.reserved);
        self.reserved = 0;
        if frames == 0 {
            return Ok(());
        }
        if self.lost.load(Ordering::Acquire) {
            return Err(DeviceError::Lost);
        }
        let len = frames as usize * self.channels;
        let Some(producer) = self.producer.as_mut() else {
            return Err(DeviceError::NotInitialized);
        };
        let available = (producer.slots() / self.channels.max(1)) as u32;
        let mut chunk = producer
            .write_chunk(len)
            .map_err(|_| DeviceError::BufferTooLarge { requested: frames, available })?;
        let (first, second) = chunk.as_mut_slices();
        let split = first.len();
        first.copy_from_slice(&self.scratch[..split]);
        second.copy_from_slice(&self.scratch[split..len]);
        chunk.commit_all();
        Ok(())
    }

    fn start(&mut self) -> DeviceResult<()> {
        self.stream()?.request(StreamControl::Play)
    }

    fn stop(&mut self) -> DeviceResult<()> {
        self.stream()?.request(StreamControl::Pause)
    }
}
