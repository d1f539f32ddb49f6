use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};

use steprender::audio::{Engine, RenderLoop, plugin};
use steprender::audio_api::{AudioCommand, AudioSender, command_channel};
use steprender::config::{self, EngineConfig};
use steprender::device::{AudioDeviceHandler, CpalBackend, OfflineBackend, StreamFormat};
use steprender::loader::sample_loader;
use steprender::pipeline::params::Param;
use steprender::pipeline::project::Project;
use steprender::shared::{MAX_TRACKS, TrackType};

const DEFAULT_RENDER_SECONDS: f64 = 8.0;
const OFFLINE_FORMAT: StreamFormat = StreamFormat { channels: 2, sample_rate: 44100, bits_per_sample: 16 };

struct Args {
    project_dir: PathBuf,
    render_to: Option<PathBuf>,
    seconds: f64,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut project_dir = None;
    let mut render_to = None;
    let mut seconds = DEFAULT_RENDER_SECONDS;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--render" => render_to = Some(PathBuf::from(args.next().context("--render needs an output path")?)),
            "--seconds" => {
                let value = args.next().context("--seconds needs a value")?;
                seconds = value.parse().with_context(|| format!("invalid --seconds value {value:?}"))?;
            }
            flag if flag.starts_with("--") => bail!("unknown option {flag}"),
            dir => project_dir = Some(PathBuf::from(dir)),
        }
    }
    let project_dir = match project_dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    Ok(Args { project_dir, render_to, seconds: seconds.max(0.0) })
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = run() {
        log::error!("{e:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = parse_args()?;
    let config = config::load_config(&args.project_dir);
    let project = Project::new(config.bpm);
    build_tracks(&project, &args.project_dir, &config)?;
    let plugins = plugin::load_all(&config.plugins);

    match &args.render_to {
        Some(out) => render_offline(&project, &config, &plugins, out, args.seconds),
        None => {
            play_live(&project, &config, &plugins)?;
            config::save_config(&args.project_dir, &config)
        }
    }
}

// One sample track per WAV in the project dir, plus a synth lead.
fn build_tracks(project: &Project, project_dir: &Path, config: &EngineConfig) -> anyhow::Result<()> {
    let wavs = sample_loader::index_wav_in_dir(project_dir)
        .with_context(|| format!("could not read {}", project_dir.display()))?;
    let registry = project.registry();

    let mut sample_tracks = Vec::new();
    for path in wavs.iter().take(MAX_TRACKS - 1) {
        let name = path.file_stem().map_or_else(|| "sample".into(), |s| s.to_string_lossy().into_owned());
        let Some(track) = project.add_track(&name, TrackType::Sample) else {
            break;
        };
        let id = track.id;
        if project.load_sample(id, path).is_err() {
            // already logged; an empty sample track just stays silent
            continue;
        }
        sample_tracks.push(id);
    }
    let lead = project
        .add_track("lead", TrackType::Synth)
        .context("no room left for the synth track")?
        .id;

    for id in registry.track_ids() {
        project.set_sequencer_step_count(id, config.step_count);
    }
    if !config.demo_pattern {
        return Ok(());
    }

    // staggered quarter notes across the sample tracks
    let steps = config.step_count;
    for (i, &id) in sample_tracks.iter().enumerate() {
        for step in (i * 2 % 4..steps).step_by(4) {
            registry.set_step_state(id, step, true);
        }
    }
    for (step, note) in [(0, 48), (3, 55), (6, 60), (10, 58), (12, 55)] {
        if step < steps {
            registry.set_step_state(lead, step, true);
            registry.set_note_state(lead, step, note, true);
        }
    }
    // duck the lead under the first sample track
    if let Some(&key) = sample_tracks.first() {
        registry.set_param(lead, Param::SidechainSource, key.0 as f32);
        registry.set_param(lead, Param::SidechainEnabled, 1.0);
    }
    registry.set_param(lead, Param::DelayEnabled, 1.0);
    log::info!(
        "demo pattern on {} sample track(s) and a synth lead",
        sample_tracks.len()
    );
    Ok(())
}

fn insert_master_chain(tx: &AudioSender, config: &EngineConfig, plugins: &[plugin::PluginLibrary], sample_rate: u32) {
    for spec in &config.master_effects {
        if tx.insert_master_effect(spec, sample_rate as f32) {
            log::info!("master insert: {}", spec.label());
        }
    }
    for lib in plugins {
        match lib.instantiate(sample_rate as f32) {
            Ok(fx) => {
                tx.send(AudioCommand::InsertMasterEffect(Box::new(fx)));
            }
            Err(e) => log::warn!("{}: {e}", lib.path().display()),
        }
    }
}

fn play_live(project: &Project, config: &EngineConfig, plugins: &[plugin::PluginLibrary]) -> anyhow::Result<()> {
    let backend = CpalBackend::new(config.latency_frames);
    let device = Arc::new(AudioDeviceHandler::new(Arc::new(backend)));
    let info = device
        .initialize(config.output_device.as_deref())
        .wait()
        .context("could not open an audio output device")?;
    device.start()?;
    let format = device.format().context("audio device lost during startup")?;

    let (tx, rx) = command_channel();
    insert_master_chain(&tx, config, plugins, format.sample_rate);
    let engine = Engine::new(project, rx, format.sample_rate);
    let handle = RenderLoop::new(engine, device.clone())
        .with_poll_interval(config.poll_interval())
        .spawn()?;

    project.set_playing(true);
    println!(
        "playing {} track(s) on {} at {} BPM; press Enter to stop",
        project.registry().len(),
        info.name,
        project.bpm()
    );
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;

    project.set_playing(false);
    drop(handle);
    device.shutdown();
    Ok(())
}

fn render_offline(
    project: &Project,
    config: &EngineConfig,
    plugins: &[plugin::PluginLibrary],
    out: &Path,
    seconds: f64,
) -> anyhow::Result<()> {
    let backend = OfflineBackend::new()
        .with_endpoint("offline", "Offline renderer", OFFLINE_FORMAT)
        .with_buffer_frames(config.latency_frames)
        .with_wav_output(out);
    let capture = backend.capture();
    let device = Arc::new(AudioDeviceHandler::new(Arc::new(backend)));
    device.initialize(None).wait()?;
    device.start()?;

    let (tx, rx) = command_channel();
    insert_master_chain(&tx, config, plugins, OFFLINE_FORMAT.sample_rate);
    let engine = Engine::new(project, rx, OFFLINE_FORMAT.sample_rate);
    let mut render_loop = RenderLoop::new(engine, device.clone()).with_poll_interval(config.poll_interval());

    project.set_playing(true);
    let frames = (seconds * OFFLINE_FORMAT.sample_rate as f64).round() as u64;
    let written = render_loop.render_frames(frames)?;
    project.set_playing(false);

    device.shutdown();
    capture.finalize().with_context(|| format!("could not finish {}", out.display()))?;
    log::info!("rendered {written} frames ({seconds:.2} s) to {}", out.display());
    Ok(())
}
