// src/synth.rs
//! Oscillators, the drawbar harmonizer and the chord/arpeggio generator.

use crate::controller::{read_controls, SharedControls};
use crate::theory::{resolve, trim_chord, ChordTable, BINS_PER_OCTAVE};
use anyhow::{anyhow, bail, Result};
use std::f64::consts::PI;
use std::sync::Arc;

pub const MIDDLE_C_FREQUENCY: f64 = 261.625565;

/// Pitch offsets of the nine tonewheel drawbars, in semitones.
pub const HAMMOND_DRAWBAR_NOTES: [i32; 9] = [-12, 7, 0, 12, 19, 24, 28, 31, 36];

// --- Generic Waveform Trait ---

/// A per-track generator bound to its voice.
///
/// `phase` holds the voice's accumulated phase in radians, one entry per output frame.
/// Implementations must fill all of `out` and never block.
pub trait Waveform: Send {
    fn render(&mut self, phase: &[f64], out: &mut [f32]);
}

/// Stand-in for sampler synths when no sample could be loaded.
pub struct Silence;

impl Waveform for Silence {
    fn render(&mut self, _phase: &[f64], out: &mut [f32]) {
        out.fill(0.0);
    }
}

#[inline]
pub fn semitone_ratio(semitones: f64) -> f64 {
    2f64.powf(semitones / BINS_PER_OCTAVE as f64)
}

#[inline]
pub fn sawtooth(x: f64) -> f64 {
    (x / PI).rem_euclid(2.0) - 1.0
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Shape {
    Sine,
    /// Two sawtooths detuned symmetrically; a single one when the detune is zero.
    DetunedSaw { detune_semitones: f64 },
}

impl Shape {
    #[inline]
    pub fn at(&self, x: f64, gain_exponent: f64) -> f64 {
        match *self {
            Shape::Sine => x.sin(),
            Shape::DetunedSaw { detune_semitones } => {
                let half = detune_semitones / 2.0;
                let low = sawtooth(x * semitone_ratio(-half));
                if detune_semitones == 0.0 {
                    low
                } else {
                    (low + sawtooth(x * semitone_ratio(half))) / 2f64.powf(gain_exponent)
                }
            }
        }
    }
}

pub struct Oscillator {
    shape: Shape,
    gain_exponent: f64,
}

impl Oscillator {
    pub fn new(shape: Shape, gain_exponent: f64) -> Self {
        Self {
            shape,
            gain_exponent,
        }
    }
}

impl Waveform for Oscillator {
    fn render(&mut self, phase: &[f64], out: &mut [f32]) {
        for (y, &x) in out.iter_mut().zip(phase) {
            *y = self.shape.at(x, self.gain_exponent) as f32;
        }
    }
}

// --- Drawbars ---

/// An organ registration: one level (0..=8) per drawbar, trailing drawbars omitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Drawbar(Vec<u8>);

impl Drawbar {
    pub fn parse(registration: &str, max_len: usize) -> Result<Self> {
        let levels = registration
            .chars()
            .map(|c| {
                c.to_digit(10)
                    .filter(|&d| d <= 8)
                    .map(|d| d as u8)
                    .ok_or_else(|| anyhow!("Invalid drawbar level '{}' in '{}'", c, registration))
            })
            .collect::<Result<Vec<_>>>()?;
        if levels.is_empty() || levels.len() > max_len {
            bail!(
                "Drawbar '{}' must have between 1 and {} levels",
                registration,
                max_len
            );
        }
        if levels.iter().all(|&v| v == 0) {
            bail!("Drawbar '{}' is silent", registration);
        }
        Ok(Self(levels))
    }

    pub fn levels(&self) -> &[u8] {
        &self.0
    }

    pub fn total(&self) -> f64 {
        self.0.iter().map(|&v| v as f64).sum()
    }

    /// Zero-padded to `num_notes` and grouped like the physical bars, e.g. `00 80808 00`.
    pub fn display(&self, num_notes: usize) -> String {
        let mut digits: String = self.0.iter().map(|&v| char::from(b'0' + v)).collect();
        while digits.len() < num_notes {
            digits.push('0');
        }
        let len = digits.len();
        format!(
            "{} {} {}",
            &digits[..2.min(len)],
            &digits[2.min(len)..7.min(len)],
            &digits[7.min(len)..]
        )
    }
}

/// Mixes `shape` at every drawbar offset, normalised by the total registration.
pub fn harmonize(
    shape: Shape,
    x: f64,
    drawbar: Option<&Drawbar>,
    drawbar_notes: &[i32],
    gain_exponent: f64,
) -> f64 {
    let Some(drawbar) = drawbar else {
        return shape.at(x, gain_exponent);
    };
    let mixed: f64 = drawbar
        .levels()
        .iter()
        .zip(drawbar_notes)
        .filter(|(&v, _)| v != 0)
        .map(|(&v, &n)| v as f64 * shape.at(x * semitone_ratio(n as f64), gain_exponent))
        .sum();
    mixed / drawbar.total().powf(gain_exponent)
}

// --- Chord / Arpeggio Harmonizer ---

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Arpeggio {
    pub secs: f64,
    /// Envelope change per sample.
    pub amp_step: f64,
}

#[derive(Clone, Debug)]
pub struct ChordArpSettings {
    pub shape: Shape,
    pub chords: ChordTable,
    pub seventh: bool,
    /// Presets selected by the synth transport register; `None` is plain unison.
    pub drawbars: Vec<Option<Drawbar>>,
    pub drawbar_notes: Vec<i32>,
    pub descending: bool,
    pub arpeggio: Option<Arpeggio>,
}

pub struct ChordArp {
    settings: Arc<ChordArpSettings>,
    /// This track's chord for every scale quality, trimmed and ordered.
    chords: Vec<Vec<i32>>,
    controls: SharedControls,
    sample_rate: f64,
    gain_exponent: f64,
    /// Frequency ratios of the current chord, reused every block.
    ratios: Vec<f64>,
    envelope: Vec<f64>,
    elapsed: u64,
}

impl ChordArp {
    pub fn new(
        settings: Arc<ChordArpSettings>,
        track: usize,
        controls: SharedControls,
        sample_rate: f64,
        gain_exponent: f64,
    ) -> Self {
        let chords = settings
            .chords
            .rows()
            .iter()
            .map(|row| {
                let mut chord = trim_chord(&row[track % row.len()], settings.seventh);
                if settings.descending {
                    chord.reverse();
                }
                chord
            })
            .collect::<Vec<Vec<i32>>>();
        let widest = chords.iter().map(Vec::len).max().unwrap_or(0);
        Self {
            settings,
            chords,
            controls,
            sample_rate,
            gain_exponent,
            ratios: Vec::with_capacity(widest),
            envelope: Vec::with_capacity(widest),
            elapsed: 0,
        }
    }

    pub fn envelope(&self) -> &[f64] {
        &self.envelope
    }
}

impl Waveform for ChordArp {
    fn render(&mut self, phase: &[f64], out: &mut [f32]) {
        let (syn_track, syn_transport) = {
            let state = read_controls(&self.controls);
            (state.track_register.syn, state.transport_register.syn)
        };
        let (quality, _) = resolve(syn_track, self.chords.len());
        self.ratios.clear();
        self.ratios
            .extend(self.chords[quality].iter().map(|&n| semitone_ratio(n as f64)));
        let ratios = &self.ratios;
        let lcn = ratios.len();
        self.envelope.resize(lcn, 0.0);
        if lcn == 0 {
            out.fill(0.0);
            self.elapsed += phase.len() as u64;
            return;
        }

        let settings = &self.settings;
        let drawbar = if settings.drawbars.is_empty() {
            None
        } else {
            settings.drawbars[resolve(syn_transport, settings.drawbars.len()).0].as_ref()
        };
        let gain = self.gain_exponent;
        let voice = |x: f64| harmonize(settings.shape, x, drawbar, &settings.drawbar_notes, gain);

        match settings.arpeggio {
            Some(arp) => {
                for (j, (y, &x)) in out.iter_mut().zip(phase).enumerate() {
                    let t = (self.elapsed + j as u64) as f64 / self.sample_rate;
                    let active = (t / arp.secs) as usize % lcn;
                    let mut acc = 0.0;
                    for (i, level) in self.envelope.iter_mut().enumerate() {
                        *level = if i == active {
                            (*level + arp.amp_step).min(1.0)
                        } else {
                            (*level - arp.amp_step).max(0.0)
                        };
                        if *level > 0.0 {
                            acc += *level * voice(x * ratios[i]);
                        }
                    }
                    *y = acc as f32;
                }
            }
            None => {
                let norm = (lcn as f64).powf(gain);
                for (y, &x) in out.iter_mut().zip(phase) {
                    let acc: f64 = ratios.iter().map(|r| voice(x * r)).sum();
                    *y = (acc / norm) as f32;
                }
            }
        }
        self.elapsed += phase.len() as u64;
    }
}

/// Capabilities of a synth, replacing ad-hoc flags on generator functions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SynthKind {
    /// A fresh generator is built per track.
    pub needs_track_binding: bool,
    /// Knob labels show the track number instead of a note.
    pub displays_track_number: bool,
    /// The generator handles pitch itself; knob motion does not bend the voice.
    pub skips_external_pitch_control: bool,
}
