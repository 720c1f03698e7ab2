mod audio_engine;
mod audio_io;
mod controller;
mod instruments;
mod keys;
mod midi;
mod pitch_shift;
mod sample_library;
mod sampler_engine;
mod screen;
mod settings;
mod slicer;
mod soundscape;
mod stretch;
mod surface;
mod synth;
mod theory;

use crate::audio_engine::{AudioCommand, AudioEngine, AudioHandle, EngineEvent, VoiceSettings};
use crate::controller::{Controller, ControllerOptions, KnobMode};
use crate::keys::{KeyCommand, KeyResult};
use crate::midi::MidiPorts;
use crate::sample_library::{LoaderOptions, SampleLibrary};
use crate::screen::Screen;
use crate::settings::{load_settings, AppSettings};
use crate::soundscape::{Soundscape, SoundscapeOptions, LOOP_TRACK};
use anyhow::{Context, Result};
use ringbuf::HeapRb;
use std::fs::File;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// The terminal is in raw mode while running, so diagnostics go to a file.
fn init_logging(settings: &AppSettings) -> Result<()> {
    let file = File::create(&settings.log_file)
        .with_context(|| format!("Cannot create log file {}", settings.log_file.display()))?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .init();
    Ok(())
}

fn main() -> Result<()> {
    let (settings, settings_problem) = load_settings();
    init_logging(&settings)?;
    if let Some(problem) = settings_problem {
        warn!("{}", problem);
    }
    surface::validate_layout()?;
    let instruments = instruments::default_catalogue(&settings)?;

    let ports = MidiPorts::open(&settings.in_port_device, &settings.out_port_device)?;
    let initial_knob_mode = if instruments.synths[0].is_sampler() {
        KnobMode::SmpPitch
    } else {
        KnobMode::SynPitch
    };
    let mut ctrl = Controller::new(
        ControllerOptions {
            external_led_mode: settings.external_led_mode,
            blink_delay: Duration::from_millis(settings.blink_delay_ms),
            initial_knob_mode,
        },
        Box::new(ports),
    );

    let (producer, consumer) = HeapRb::<AudioCommand>::new(settings.audio_command_capacity).split();
    let (event_producer, event_consumer) =
        HeapRb::<EngineEvent>::new(settings.audio_command_capacity).split();
    let engine = AudioEngine::new(
        consumer,
        event_producer,
        VoiceSettings {
            sample_rate: settings.sample_rate as f64,
            min_db: settings.min_db,
            pitch_per_second: settings.pitch_per_second,
            db_per_second: settings.db_per_second,
        },
        LOOP_TRACK + 1,
        surface::NUM_CONTROLS,
    );
    let (_stream, active_sr) = audio_io::init_and_run_stream(Some(settings.sample_rate), engine)?;
    if active_sr != settings.sample_rate {
        warn!(
            "Output runs at {} Hz instead of {} Hz",
            active_sr, settings.sample_rate
        );
    }

    let library = SampleLibrary::new(
        &settings.sample_folder,
        LoaderOptions {
            sample_rate: settings.sample_rate,
            stereo_to_mono_tolerance: settings.stereo_to_mono_tolerance,
            exit_on_error: settings.exit_on_error,
            num_tracks: surface::NUM_CONTROLS,
        },
    );
    let mut sound = Soundscape::new(
        instruments,
        library,
        Box::new(AudioHandle::new(producer, event_consumer)),
        SoundscapeOptions {
            min_db: settings.min_db,
            max_db: settings.max_db,
            synth_max_bend_semitones: settings.synth_max_bend_semitones,
            exit_on_error: settings.exit_on_error,
            max_record_frames: (settings.max_record_secs * settings.sample_rate as f64) as usize,
        },
    );

    if let Some(name) = &settings.initial_sample {
        sound.select_sample(&mut ctrl, name)?;
    }
    if let Some(name) = &settings.initial_synth {
        sound.select_synth(&mut ctrl, name)?;
    }

    let result = run(
        &mut ctrl,
        &mut sound,
        Duration::from_micros(settings.main_loop_delay_us),
    );
    sound.kill_sound();
    match &result {
        Ok(()) => info!("Bye"),
        Err(e) => error!("{:#}", e),
    }
    result
}

/// The control loop: MIDI in, commit, voices, screen, one key, sleep.
fn run(ctrl: &mut Controller, sound: &mut Soundscape, delay: Duration) -> Result<()> {
    let mut screen = Screen::enter()?;
    let mut pending: Option<KeyCommand> = None;
    loop {
        ctrl.drain_midi();
        ctrl.update_all();
        sound.update(ctrl)?;
        screen.draw(ctrl, sound)?;
        ctrl.clear_new_controls();

        let command = match pending.take() {
            Some(command) => Some(command),
            None => keys::poll_key()?,
        };
        if let Some(command) = command {
            match keys::apply(command, ctrl, sound)? {
                KeyResult::Continue => {}
                KeyResult::Redraw => screen.invalidate(),
                KeyResult::Then(next) => {
                    screen.invalidate();
                    pending = Some(next);
                }
                KeyResult::Quit => return Ok(()),
            }
        }
        thread::sleep(delay);
    }
}
