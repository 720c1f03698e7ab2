use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE_NAME: &str = "nanotron.json";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AppSettings {
    /// Case-insensitive prefix of the MIDI input port name.
    pub in_port_device: String,
    pub out_port_device: String,
    /// Requires LED Mode "External" in the KORG KONTROL Editor.
    pub external_led_mode: bool,
    pub blink_delay_ms: u64,
    pub log_file: PathBuf,
    pub main_loop_delay_us: u64,

    // Audio
    pub sample_rate: u32,
    pub max_db: f64,
    pub min_db: f64,
    pub pitch_per_second: f64,
    pub db_per_second: f64,
    pub audio_command_capacity: usize,
    /// Longest take the live looper keeps.
    pub max_record_secs: f64,

    // Samples
    pub sample_folder: PathBuf,
    pub stereo_to_mono_tolerance: Option<f32>,
    pub exit_on_error: bool,
    /// Sample number or folder-relative name to start with.
    pub initial_sample: Option<String>,

    // Synths
    /// Synth number or name to start with.
    pub initial_synth: Option<String>,
    pub synth_max_bend_semitones: f64,
    pub sampler_max_bend_semitones: f64,
    /// 0 leaves chords loud, 0.5 keeps RMS steady, 1 never clips.
    pub gain_normalization_exponent: f64,
    pub detune_semitones: f64,
    pub arpeggio_secs: f64,
    pub arpeggio_amp_step: f64,
    pub loop_slice_secs: f64,
    pub sampler_elongate_factor: f64,
    pub loop_max_scrub_secs: Option<f64>,
    pub stretch_window_secs: f64,
    pub stretch_slice_secs: f64,
    pub stretch_max_scrub_secs: Option<f64>,
    pub stretch_advance_factor: f64,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            in_port_device: "nanoKONTROL2 1".to_string(),
            out_port_device: "nanoKONTROL2 1".to_string(),
            external_led_mode: true,
            blink_delay_ms: 200,
            log_file: PathBuf::from("nanotron.log"),
            main_loop_delay_us: 100,
            sample_rate: 44100,
            max_db: 0.0,
            min_db: -100.0,
            pitch_per_second: 200.0,
            db_per_second: 200.0,
            audio_command_capacity: 1024,
            max_record_secs: 60.0,
            sample_folder: PathBuf::from("samples"),
            stereo_to_mono_tolerance: Some(1e-3),
            exit_on_error: true,
            initial_sample: None,
            initial_synth: None,
            synth_max_bend_semitones: 16.0 / 15.0, // 5/3 cent per step
            sampler_max_bend_semitones: 3.2,       // 5 cent per step
            gain_normalization_exponent: 1.0,
            detune_semitones: 0.02,
            arpeggio_secs: 0.25,
            arpeggio_amp_step: 0.005,
            loop_slice_secs: 0.25,
            sampler_elongate_factor: 0.05,
            loop_max_scrub_secs: None,
            stretch_window_secs: 0.25,
            stretch_slice_secs: 0.5,
            stretch_max_scrub_secs: None,
            stretch_advance_factor: 0.1, // 1 / stretch factor
        }
    }
}

/// Settings file candidates: the working directory first, then next to the executable.
pub fn settings_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(SETTINGS_FILE_NAME)];
    if let Ok(exe_path) = env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            paths.push(exe_dir.join(SETTINGS_FILE_NAME));
        }
    }
    paths
}

pub fn read_settings(path: &Path) -> Result<AppSettings> {
    let json_string = fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file {}", path.display()))?;
    serde_json::from_str(&json_string)
        .with_context(|| format!("Failed to parse settings file {}", path.display()))
}

/// Loads the first settings file found; defaults when there is none or it is broken.
///
/// The second value is a problem to report once logging is up.
pub fn load_settings() -> (AppSettings, Option<String>) {
    match settings_paths().into_iter().find(|p| p.exists()) {
        Some(path) => match read_settings(&path) {
            Ok(settings) => (settings, None),
            Err(e) => (
                AppSettings::default(),
                Some(format!("{:#}, using defaults", e)),
            ),
        },
        None => (AppSettings::default(), None),
    }
}
