// src/sample_library.rs
//! Discovers, decodes and conditions the samples the sampler synths play.

use anyhow::{Context, Result};
use rodio::{Decoder, Source};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const AUDIO_EXTENSIONS: [&str; 8] = ["wav", "flac", "mp3", "ogg", "m4a", "aac", "aif", "aiff"];

pub fn is_audio_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .map_or(false, |e| AUDIO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
}

/// Audio files directly inside `dir`, sorted.
fn audio_files_in(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .filter(|p| is_audio_file(p))
        .collect();
    files.sort();
    files
}

/// Sample data bound to the tracks: one shared buffer, or one per track.
#[derive(Clone, Debug)]
pub enum SampleSet {
    Single(Arc<Vec<f32>>),
    PerTrack(Vec<Arc<Vec<f32>>>),
}

impl SampleSet {
    pub fn for_track(&self, k: usize) -> Arc<Vec<f32>> {
        match self {
            SampleSet::Single(sample) => sample.clone(),
            SampleSet::PerTrack(samples) => samples[k % samples.len()].clone(),
        }
    }

    pub fn is_per_track(&self) -> bool {
        matches!(self, SampleSet::PerTrack(_))
    }

    /// Elongation stops at the window size only when every track has the same length.
    pub fn uniform_lengths(&self) -> bool {
        match self {
            SampleSet::Single(_) => true,
            SampleSet::PerTrack(samples) => samples.windows(2).all(|w| w[0].len() == w[1].len()),
        }
    }

    pub fn longest(&self) -> Arc<Vec<f32>> {
        match self {
            SampleSet::Single(sample) => sample.clone(),
            SampleSet::PerTrack(samples) => samples
                .iter()
                .max_by_key(|s| s.len())
                .cloned()
                .unwrap_or_default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoadedSample {
    /// Position in the candidate list.
    pub index: usize,
    /// Path relative to the sample folder, or `folder/[N files]`.
    pub display_path: String,
    pub set: SampleSet,
}

#[derive(Clone, Debug)]
pub struct LoaderOptions {
    pub sample_rate: u32,
    pub stereo_to_mono_tolerance: Option<f32>,
    pub exit_on_error: bool,
    pub num_tracks: usize,
}

pub struct SampleLibrary {
    folder: PathBuf,
    options: LoaderOptions,
}

impl SampleLibrary {
    pub fn new(folder: impl Into<PathBuf>, options: LoaderOptions) -> Self {
        Self {
            folder: folder.into(),
            options,
        }
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn exit_on_error(&self) -> bool {
        self.options.exit_on_error
    }

    /// Audio files in the sample folder plus sub-folders holding audio files, sorted by path.
    pub fn candidates(&self) -> Vec<PathBuf> {
        if !self.folder.is_dir() {
            return Vec::new();
        }
        let mut paths = audio_files_in(&self.folder);
        paths.extend(
            WalkDir::new(&self.folder)
                .min_depth(1)
                .max_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_dir())
                .map(|e| e.into_path())
                .filter(|p| !audio_files_in(p).is_empty()),
        );
        paths.sort();
        paths
    }

    /// 1-based number or path relative to the sample folder.
    pub fn find(&self, candidates: &[PathBuf], name_or_num: &str) -> Option<usize> {
        if let Ok(num) = name_or_num.trim().parse::<i64>() {
            return usize::try_from(num - 1).ok().filter(|&i| i < candidates.len());
        }
        let wanted = self.folder.join(name_or_num.trim_end_matches(['/', '\\']));
        candidates.iter().position(|p| *p == wanted)
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.folder)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string()
    }

    /// Decodes one file. Under `exit_on_error` a failure is an error, otherwise `None`.
    pub fn load_sample(&self, path: &Path) -> Result<Option<Vec<f32>>> {
        match decode_file(path, self.options.sample_rate, self.options.stereo_to_mono_tolerance) {
            Ok(sample) => {
                debug!("Loaded {} ({} frames)", path.display(), sample.len());
                Ok(Some(sample))
            }
            Err(e) if self.options.exit_on_error => {
                Err(e.context(format!("Error loading sample {}", path.display())))
            }
            Err(e) => {
                warn!("Error loading sample {}: {:#}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Loads a candidate file, or a folder as one file per track cycling through its files.
    pub fn load_candidate(&self, candidates: &[PathBuf], index: usize) -> Result<Option<LoadedSample>> {
        let Some(path) = candidates.get(index) else {
            return Ok(None);
        };
        if !path.is_dir() {
            return Ok(self.load_sample(path)?.map(|sample| LoadedSample {
                index,
                display_path: self.relative(path),
                set: SampleSet::Single(Arc::new(sample)),
            }));
        }

        let files = audio_files_in(path);
        let tracks = self.options.num_tracks;
        let mut samples = Vec::with_capacity(tracks);
        let mut k = 0;
        while samples.len() < tracks && k < files.len() * tracks {
            if let Some(sample) = self.load_sample(&files[k % files.len()])? {
                samples.push(Arc::new(sample));
            }
            k += 1;
        }
        if samples.is_empty() {
            return Ok(None);
        }
        let display_path = if files.len() == 1 {
            self.relative(&files[0])
        } else {
            format!(
                "{}/[{} files]",
                self.relative(path),
                files.len().min(tracks)
            )
        };
        info!("Loaded sample folder {}", display_path);
        Ok(Some(LoadedSample {
            index,
            display_path,
            set: SampleSet::PerTrack(samples),
        }))
    }
}

/// Decodes, collapses to mono, resamples and peak-normalises an audio file.
pub fn decode_file(path: &Path, target_sr: u32, stereo_tolerance: Option<f32>) -> Result<Vec<f32>> {
    let file = BufReader::new(
        File::open(path).with_context(|| format!("Cannot open {}", path.display()))?,
    );
    let source = Decoder::new(file)?;
    let source_sr = source.sample_rate();
    let num_channels = source.channels() as usize;

    let all_samples: Vec<f32> = source.map(|s| s as f32 / i16::MAX as f32).collect();
    let mono_samples = collapse_to_mono(&all_samples, num_channels, stereo_tolerance);

    let mut samples = if source_sr != target_sr && !mono_samples.is_empty() {
        debug!("Resampling {} from {} Hz to {} Hz", path.display(), source_sr, target_sr);
        resample(mono_samples, target_sr as f64 / source_sr as f64)?
    } else {
        mono_samples
    };
    normalize_peak(&mut samples);
    Ok(samples)
}

/// Interleaved frames to mono: the left channel when a stereo pair is identical within
/// `tolerance`, the channel average otherwise.
pub fn collapse_to_mono(interleaved: &[f32], channels: usize, tolerance: Option<f32>) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    let frames = interleaved.chunks_exact(channels);
    if channels == 2 {
        if let Some(tolerance) = tolerance {
            if frames.clone().all(|f| (f[0] - f[1]).abs() <= tolerance) {
                return frames.map(|f| f[0]).collect();
            }
        }
    }
    frames
        .map(|chunk| chunk.iter().sum::<f32>() / channels as f32)
        .collect()
}

fn normalize_peak(samples: &mut [f32]) {
    let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
    if peak > 1.0 {
        for s in samples.iter_mut() {
            *s /= peak;
        }
    }
}

/// Single-channel sinc resampling by `ratio` (output rate over input rate).
pub fn resample(samples: Vec<f32>, ratio: f64) -> Result<Vec<f32>> {
    if samples.is_empty() {
        return Ok(samples);
    }
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, samples.len(), 1)?;
    let waves_in = vec![samples];
    let waves_out = resampler.process(&waves_in, None)?;
    Ok(waves_out.into_iter().next().unwrap_or_default())
}
