use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::audio_api::AudioCommand;
use crate::device::{AudioDeviceHandler, DeviceError, DeviceResult};
use crate::pipeline::project::Project;
use crate::pipeline::registry::{TrackData, TrackRegistry};
use crate::pipeline::sequencer::{StepClock, Sequencer, Transport, step_duration_samples};
use crate::pipeline::steps::StepNote;
use crate::shared::{DEFAULT_STEP_COUNT, MAX_TRACKS, TrackId};

use super::effect::Effect;
use super::frame::StereoFrame;
use super::voice::PlaybackState;

const MAX_MASTER_EFFECTS: usize = 16;
const BLOCK_CAPACITY: usize = 4096; // frames; larger device buffers grow the scratch once

/// Renders the project: one instance, owned by the render thread.
pub struct Engine {
    registry: Arc<TrackRegistry>,
    sequencer: Arc<Sequencer>,
    transport: Arc<Transport>,
    commands: Receiver<AudioCommand>,

    sample_rate: f32,
    clock: StepClock,
    live: Vec<Arc<TrackData>>,
    states: Vec<PlaybackState>, // parallel to `live` after reconcile
    spare: Vec<PlaybackState>,  // preallocated; new tracks take from here
    levels: Vec<f32>,
    mix: Vec<StereoFrame>,
    master: Vec<Box<dyn Effect>>,
}

impl Engine {
    pub fn new(project: &Project, commands: Receiver<AudioCommand>, sample_rate: u32) -> Self {
        let rate = sample_rate.max(1) as f32;
        // the registry caps the track count, so the render thread never builds one
        let spare = (0..MAX_TRACKS).map(|_| PlaybackState::new(TrackId::NONE, rate)).collect();
        Self {
            registry: project.registry().clone(),
            sequencer: project.sequencer().clone(),
            transport: project.transport().clone(),
            commands,
            sample_rate: rate,
            clock: StepClock::new(),
            live: Vec::with_capacity(MAX_TRACKS),
            states: Vec::with_capacity(MAX_TRACKS),
            spare,
            levels: Vec::with_capacity(MAX_TRACKS),
            mix: vec![StereoFrame::zero(); BLOCK_CAPACITY],
            master: Vec::with_capacity(MAX_MASTER_EFFECTS),
        }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate.max(1) as f32;
    }

    pub fn master_effect_count(&self) -> usize {
        self.master.len()
    }

    pub fn handle_cmd(&mut self, cmd: AudioCommand) {
        match cmd {
            AudioCommand::InsertMasterEffect(fx) => {
                if self.master.len() < MAX_MASTER_EFFECTS {
                    self.master.push(fx);
                } else {
                    log::warn!("master chain full, dropping effect");
                }
            }
            AudioCommand::ClearMasterEffects => self.master.clear(),
        }
    }

    // Snapshot the track list and line the playback cache up with it.
    fn reconcile(&mut self) {
        self.registry.collect_live(&mut self.live);

        // removed tracks give their state back first, so states + spare never
        // outgrow the capacity reserved in new()
        let mut i = 0;
        while i < self.states.len() {
            let id = self.states[i].id();
            if self.live.iter().any(|t| t.id() == id) {
                i += 1;
            } else {
                let mut state = self.states.swap_remove(i);
                state.retire();
                self.spare.push(state);
            }
        }

        for (i, track) in self.live.iter().enumerate() {
            let id = track.id();
            match self.states[i..].iter().position(|s| s.id() == id) {
                Some(offset) => self.states.swap(i, i + offset),
                None => {
                    let state = match self.spare.pop() {
                        Some(mut state) => {
                            state.rebind(id);
                            state
                        }
                        None => PlaybackState::new(id, self.sample_rate),
                    };
                    self.states.push(state);
                    let last = self.states.len() - 1;
                    self.states.swap(i, last);
                }
            }
        }

        for (state, track) in self.states.iter_mut().zip(&self.live) {
            state.configure(track, self.sample_rate);
        }
        for i in 0..self.states.len() {
            let source = self.states[i].sidechain_source();
            self.states[i].key_slot = if source.is_none() {
                None
            } else {
                self.live.iter().position(|t| t.id() == source)
            };
        }
        self.levels.resize(self.states.len(), 0.0);
    }

    // Active track's width, else the first track's, else the default.
    fn active_step_count(&self) -> usize {
        let active: TrackId = self.sequencer.active_track();
        self.live
            .iter()
            .find(|t| t.id() == active)
            .or_else(|| self.live.first())
            .map_or(DEFAULT_STEP_COUNT, |t| t.step_count())
    }

    /// Render `out.len() / channels` frames of interleaved 16-bit audio.
    /// Returns the number of frames written.
    pub fn render_into(&mut self, out: &mut [i16], channels: usize) -> usize {
        let channels = channels.max(1);
        let frames = out.len() / channels;

        while let Ok(cmd) = self.commands.try_recv() {
            self.handle_cmd(cmd);
        }
        self.reconcile();

        if self.mix.len() < frames {
            self.mix.resize(frames, StereoFrame::zero());
        }
        let step_count = self.active_step_count();
        let step_duration = step_duration_samples(self.sample_rate as f64, self.sequencer.bpm());
        let playing = self.transport.is_playing();

        for f in 0..frames {
            let tick = self.clock.tick(playing, &self.sequencer, step_count, step_duration);
            if !tick.playing {
                for state in &mut self.states {
                    state.idle();
                }
                self.mix[f] = StereoFrame::zero();
                continue;
            }
            if tick.reset {
                for state in &mut self.states {
                    state.reset();
                }
            }

            // sidechain keys read the previous frame, so track order does not matter
            for (level, state) in self.levels.iter_mut().zip(&self.states) {
                *level = state.level();
            }

            let mut sum = StereoFrame::zero();
            for (state, track) in self.states.iter_mut().zip(&self.live) {
                let step = tick.step % track.step_count().max(1);
                let gate = track.steps.is_enabled(step);
                let trigger = (tick.trigger && gate).then(|| {
                    track
                        .steps
                        .try_first_note(step)
                        .unwrap_or_else(|| StepNote::canonical(track.midi_note()))
                });
                let key = state.key_slot.map_or(0.0, |k| self.levels[k]);
                sum += state.render(gate, trigger, key);
            }
            self.mix[f] = sum;
        }

        for fx in &mut self.master {
            fx.process(&mut self.mix[..frames]);
        }

        for (slot, frame) in out.chunks_exact_mut(channels).zip(&self.mix[..frames]) {
            write_frame(slot, *frame);
        }
        frames
    }
}

#[inline]
fn to_i16(x: f32) -> i16 {
    (x.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

// Left/right onto the first two channels; mono gets the average, extra
// channels stay silent.
#[inline]
fn write_frame(slot: &mut [i16], frame: StereoFrame) {
    match slot {
        [mono] => *mono = to_i16((frame.left + frame.right) * 0.5),
        [l, r, rest @ ..] => {
            *l = to_i16(frame.left);
            *r = to_i16(frame.right);
            rest.fill(0);
        }
        [] => {}
    }
}

// ── Render loop ───────────────────────────────────────────────────

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Pulls writable space from the device, renders into it, hands it back.
pub struct RenderLoop {
    engine: Engine,
    device: Arc<AudioDeviceHandler>,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
}

impl RenderLoop {
    pub fn new(engine: Engine, device: Arc<AudioDeviceHandler>) -> Self {
        Self {
            engine,
            device,
            poll_interval: DEFAULT_POLL_INTERVAL,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// One acquire/render/release round. Returns the frames written, which is
    /// zero when the device has no room yet.
    pub fn render_cycle(&mut self) -> DeviceResult<usize> {
        self.cycle(u32::MAX)
    }

    fn cycle(&mut self, max_frames: u32) -> DeviceResult<usize> {
        let capacity = self.device.buffer_frame_count()?;
        let padding = self.device.current_padding()?;
        let available = capacity.saturating_sub(padding).min(max_frames);
        if available == 0 {
            return Ok(0);
        }
        let format = self.device.format().ok_or(DeviceError::NotInitialized)?;
        if format.sample_rate as f32 != self.engine.sample_rate() {
            self.engine.set_sample_rate(format.sample_rate);
        }

        let mut buffer = self.device.get_buffer(available)?;
        let channels = buffer.channels() as usize;
        let frames = self.engine.render_into(buffer.samples_mut(), channels);
        buffer.release(frames as u32)?;
        Ok(frames)
    }

    /// Drive the device until `frames` frames have been written. Meant for
    /// offline endpoints, which always have room.
    pub fn render_frames(&mut self, frames: u64) -> DeviceResult<u64> {
        let mut done = 0u64;
        while done < frames {
            let want = (frames - done).min(u32::MAX as u64) as u32;
            match self.cycle(want)? {
                0 => std::thread::sleep(self.poll_interval),
                n => done += n as u64,
            }
        }
        Ok(done)
    }

    /// Run until the handle is dropped.
    pub fn run(&mut self) {
        log::info!("render loop running");
        let mut failing = false;
        while self.running.load(Ordering::Acquire) {
            let pause = match self.render_cycle() {
                Ok(_) => {
                    if failing {
                        log::info!("render loop recovered");
                        failing = false;
                    }
                    self.poll_interval
                }
                Err(e) if e.is_transient() => self.poll_interval,
                Err(e) => {
                    if !failing {
                        log::warn!("render cycle failed: {e}");
                        failing = true;
                    } else {
                        log::debug!("render cycle failed: {e}");
                    }
                    ERROR_BACKOFF
                }
            };
            std::thread::sleep(pause);
        }
        log::info!("render loop stopped");
    }

    pub fn spawn(mut self) -> std::io::Result<RenderHandle> {
        let running = self.running.clone();
        let thread = std::thread::Builder::new()
            .name("render".into())
            .spawn(move || self.run())?;
        Ok(RenderHandle { running, thread: Some(thread) })
    }
}

/// Owns the render thread; dropping it stops and joins the loop.
pub struct RenderHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RenderHandle {
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for RenderHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("render thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SampleBuffer;
    use crate::audio_api::command_channel;
    use crate::device::{OfflineBackend, StreamFormat};
    use crate::pipeline::params::Param;
    use crate::shared::TrackType;

    const RATE: u32 = 1000; // 125 frames per step at 120 BPM

    fn engine(project: &Project) -> (Engine, crate::audio_api::AudioSender) {
        let (tx, rx) = command_channel();
        (Engine::new(project, rx, RATE), tx)
    }

    fn render(engine: &mut Engine, frames: usize) -> Vec<i16> {
        let mut out = vec![0i16; frames * 2];
        assert_eq!(engine.render_into(&mut out, 2), frames);
        out
    }

    struct Mute;

    impl Effect for Mute {
        fn process(&mut self, buf: &mut [StereoFrame]) {
            buf.fill(StereoFrame::zero());
        }
    }

    #[test]
    fn sample_track_without_buffer_is_silent() {
        let project = Project::default();
        let id = project.add_track("kick", TrackType::Sample).unwrap().id;
        project.registry().set_step_state(id, 0, true);
        project.set_playing(true);
        let (mut engine, _tx) = engine(&project);

        let out = render(&mut engine, 64);
        assert!(out.iter().all(|&s| s == 0));
        assert!(!engine.states[0].player.is_playing());
    }

    #[test]
    fn sample_track_plays_its_buffer_on_a_step() {
        let project = Project::default();
        let id = project.add_track("kick", TrackType::Sample).unwrap().id;
        let buffer = Arc::new(SampleBuffer::new(1, RATE, vec![i16::MAX / 2; 32]));
        project.registry().set_sample_buffer(id, buffer, None);
        project.registry().set_step_state(id, 0, true);
        project.set_playing(true);
        let (mut engine, _tx) = engine(&project);

        let out = render(&mut engine, 64);
        assert!(out[0] > 0);
        // 32 source frames at the same rate, then silence
        assert_eq!(out[40 * 2], 0);
        assert!(!engine.states[0].player.is_playing());
    }

    #[test]
    fn synth_sounds_only_on_enabled_steps() {
        let project = Project::default();
        let id = project.add_track("lead", TrackType::Synth).unwrap().id;
        project.set_playing(true);
        let (mut engine, _tx) = engine(&project);
        assert!(render(&mut engine, 100).iter().all(|&s| s == 0));

        project.sequencer().request_reset();
        project.registry().set_step_state(id, 0, true);
        let out = render(&mut engine, 100);
        assert!(out.iter().any(|&s| s != 0));
        assert!(engine.states[0].envelope() > 0.0);
    }

    #[test]
    fn stopped_transport_emits_silence() {
        let project = Project::default();
        let id = project.add_track("lead", TrackType::Synth).unwrap().id;
        project.registry().set_step_state(id, 0, true);
        project.set_playing(true);
        let (mut engine, _tx) = engine(&project);
        render(&mut engine, 50);
        let before = engine.states[0].envelope();
        assert!(before > 0.0);

        project.set_playing(false);
        assert!(render(&mut engine, 50).iter().all(|&s| s == 0));
        assert!(engine.states[0].envelope() < before);
        // the stop edge leaves a reset queued for the next start
        assert!(project.sequencer().reset_pending());
    }

    #[test]
    fn mix_is_clamped_to_full_scale() {
        let project = Project::default();
        let loud = Arc::new(SampleBuffer::new(1, RATE, vec![i16::MAX; 500]));
        for i in 0..6 {
            let id = project.add_track(&format!("t{i}"), TrackType::Sample).unwrap().id;
            project.registry().set_sample_buffer(id, loud.clone(), None);
            project.registry().set_step_state(id, 0, true);
            project.registry().set_volume(id, 1.0);
        }
        project.set_playing(true);
        let (mut engine, _tx) = engine(&project);
        let out = render(&mut engine, 10);
        assert_eq!(out[0], i16::MAX);
        assert_eq!(out[1], i16::MAX);
    }

    #[test]
    fn master_effects_follow_commands() {
        let project = Project::default();
        let id = project.add_track("lead", TrackType::Synth).unwrap().id;
        project.registry().set_step_state(id, 0, true);
        project.set_playing(true);
        let (mut engine, tx) = engine(&project);

        assert!(tx.send(AudioCommand::InsertMasterEffect(Box::new(Mute))));
        assert!(render(&mut engine, 60).iter().all(|&s| s == 0));
        assert_eq!(engine.master_effect_count(), 1);

        assert!(tx.send(AudioCommand::ClearMasterEffects));
        assert!(render(&mut engine, 60).iter().any(|&s| s != 0));
    }

    #[test]
    fn cache_follows_the_track_list() {
        let project = Project::default();
        let a = project.add_track("a", TrackType::Synth).unwrap().id;
        let b = project.add_track("b", TrackType::Synth).unwrap().id;
        project.registry().set_param(b, Param::SidechainEnabled, 1.0);
        project.registry().set_param(b, Param::SidechainSource, a.0 as f32);
        let (mut engine, _tx) = engine(&project);
        render(&mut engine, 4);
        assert_eq!(engine.states.len(), 2);
        assert_eq!(engine.states[1].key_slot, Some(0));

        project.remove_track(a);
        render(&mut engine, 4);
        assert_eq!(engine.states.len(), 1);
        assert_eq!(engine.states[0].id(), b);
        assert_eq!(engine.states[0].key_slot, None);
    }

    #[test]
    fn track_churn_reuses_pooled_state() {
        let project = Project::default();
        let ids: Vec<TrackId> = (0..MAX_TRACKS)
            .map(|i| project.add_track(&format!("t{i}"), TrackType::Synth).unwrap().id)
            .collect();
        let (mut engine, _tx) = engine(&project);
        let capacity = engine.states.capacity();
        render(&mut engine, 4);
        assert_eq!(engine.states.len(), MAX_TRACKS);
        assert!(engine.spare.is_empty());

        project.remove_track(ids[3]);
        let added = project.add_track("late", TrackType::Sample).unwrap().id;
        render(&mut engine, 4);
        assert_eq!(engine.states.len(), MAX_TRACKS);
        assert!(engine.spare.is_empty());
        assert_eq!(engine.states.capacity(), capacity);
        assert!(engine.states.iter().any(|s| s.id() == added));
        assert!(engine.states.iter().all(|s| s.id() != ids[3]));

        project.remove_track(added);
        render(&mut engine, 4);
        assert_eq!(engine.spare.len(), 1);
    }

    #[test]
    fn sample_rate_change_rerates_loaded_samples() {
        let project = Project::default();
        let id = project.add_track("kick", TrackType::Sample).unwrap().id;
        let buffer = Arc::new(SampleBuffer::new(1, RATE, vec![i16::MAX / 2; 4000]));
        project.registry().set_sample_buffer(id, buffer, None);
        project.registry().set_step_state(id, 0, true);
        project.set_playing(true);
        let (mut engine, _tx) = engine(&project);

        render(&mut engine, 10);
        assert_eq!(engine.states[0].player.increment(), 1.0);

        engine.set_sample_rate(RATE * 2);
        render(&mut engine, 10);
        assert_eq!(engine.states[0].player.increment(), 0.5);

        // a retrigger at the new rate keeps the new ratio
        project.sequencer().request_reset();
        render(&mut engine, 10);
        assert_eq!(engine.states[0].player.increment(), 0.5);
    }

    #[test]
    fn cursor_follows_the_active_track_width() {
        let project = Project::default();
        let id = project.add_track("a", TrackType::Synth).unwrap().id;
        project.set_sequencer_step_count(id, 2);
        project.sequencer().take_reset();
        project.set_playing(true);
        let (mut engine, _tx) = engine(&project);
        // start frame plus two boundaries wraps a 2-step pattern back to 0
        render(&mut engine, 250);
        assert_eq!(project.sequencer().current_step(), 0);
        render(&mut engine, 125);
        assert_eq!(project.sequencer().current_step(), 1);
    }

    #[test]
    fn render_loop_feeds_the_device() {
        let project = Project::default();
        let id = project.add_track("lead", TrackType::Synth).unwrap().id;
        project.registry().set_step_state(id, 0, true);
        project.set_playing(true);

        let format = StreamFormat { channels: 2, sample_rate: 8000, bits_per_sample: 16 };
        let backend = OfflineBackend::new()
            .with_endpoint("out", "Offline", format)
            .with_buffer_frames(256)
            .with_capture();
        let capture = backend.capture();
        let device = Arc::new(AudioDeviceHandler::new(Arc::new(backend)));
        let (engine, _tx) = engine(&project);
        let mut render_loop = RenderLoop::new(engine, device.clone());

        assert!(matches!(render_loop.render_cycle(), Err(DeviceError::NotInitialized)));

        device.initialize(None).wait().unwrap();
        device.start().unwrap();
        assert_eq!(render_loop.render_frames(1000).unwrap(), 1000);
        assert_eq!(capture.frames(), 1000);
        assert_eq!(render_loop.engine().sample_rate(), 8000.0);
        assert!(capture.samples().iter().any(|&s| s != 0));
    }

    #[test]
    fn dropping_the_handle_joins_the_thread() {
        let project = Project::default();
        let device = Arc::new(AudioDeviceHandler::new(Arc::new(OfflineBackend::new())));
        let (engine, _tx) = engine(&project);
        let handle = RenderLoop::new(engine, device)
            .with_poll_interval(Duration::from_millis(1))
            .spawn()
            .unwrap();
        assert!(handle.is_running());
        handle.stop();
    }
}
