// src/instruments.rs
//! The synth catalogue: named generator recipes plus the tables they play from.

use crate::controller::SharedControls;
use crate::sample_library::SampleSet;
use crate::sampler_engine::Looper;
use crate::settings::AppSettings;
use crate::slicer::{get_slice_len, get_windowsize, SliceParams, SliceState};
use crate::stretch::Stretcher;
use crate::surface::NUM_CONTROLS;
use crate::synth::{
    Arpeggio, ChordArp, ChordArpSettings, Drawbar, Oscillator, Shape, Silence, SynthKind,
    Waveform, HAMMOND_DRAWBAR_NOTES,
};
use crate::theory::{ChordQuality, ChordTable, NoteTable, Scale, Voicing};
use anyhow::{bail, Result};
use std::collections::BTreeSet;
use std::sync::Arc;

pub const SAMPLER_PREFIX: &str = "smp";

/// Slicing recipe of a sampler synth.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplerSettings {
    pub slice_secs: f64,
    /// `Some` for stretchers.
    pub windowsize_secs: Option<f64>,
    pub advance_factor: f64,
    pub elongate_factor: f64,
    pub extend_reversal: bool,
    pub max_scrub_secs: Option<f64>,
    pub max_bend_semitones: f64,
}

impl SamplerSettings {
    /// Per-track folders slice whole files; elongation stops at the window only for equal lengths.
    pub fn slice_params(&self, set: &SampleSet, sample_rate: f64) -> SliceParams {
        SliceParams {
            slice_secs: if set.is_per_track() {
                None
            } else {
                Some(self.slice_secs)
            },
            sample_rate,
            windowsize: self.windowsize_secs.map(|secs| get_windowsize(secs, sample_rate)),
            advance_factor: self.advance_factor,
            elongate_factor: self.elongate_factor,
            extend_reversal: self.extend_reversal,
            smart_skipping: set.uniform_lengths(),
        }
    }

    /// Whether the slice display is in milliseconds rather than percent of the sample.
    pub fn shows_millis(&self, set: &SampleSet) -> bool {
        set.uniform_lengths() || (self.windowsize_secs.is_some() && self.advance_factor == 0.0)
    }
}

#[derive(Clone, Debug)]
pub enum Generator {
    Oscillator(Shape),
    ChordArp(Arc<ChordArpSettings>),
    Loop(SamplerSettings),
    Stretch(SamplerSettings),
}

#[derive(Clone, Debug)]
pub struct SynthEntry {
    pub name: String,
    pub generator: Generator,
    /// Notes the tracks are tuned to; samplers autotune to them.
    pub notes: Arc<NoteTable>,
}

impl SynthEntry {
    pub fn is_sampler(&self) -> bool {
        self.name.to_lowercase().starts_with(SAMPLER_PREFIX)
    }

    pub fn kind(&self) -> SynthKind {
        match self.generator {
            Generator::Oscillator(_) => SynthKind::default(),
            Generator::ChordArp(_) => SynthKind {
                needs_track_binding: true,
                ..SynthKind::default()
            },
            Generator::Loop(_) | Generator::Stretch(_) => SynthKind {
                needs_track_binding: true,
                displays_track_number: true,
                skips_external_pitch_control: true,
            },
        }
    }

    pub fn chord_settings(&self) -> Option<&ChordArpSettings> {
        match &self.generator {
            Generator::ChordArp(settings) => Some(settings),
            _ => None,
        }
    }

    pub fn sampler_settings(&self) -> Option<&SamplerSettings> {
        match &self.generator {
            Generator::Loop(settings) | Generator::Stretch(settings) => Some(settings),
            _ => None,
        }
    }
}

pub struct Instruments {
    pub synths: Vec<SynthEntry>,
    pub sample_rate: f64,
    pub gain_exponent: f64,
}

impl Instruments {
    pub fn new(synths: Vec<SynthEntry>, sample_rate: f64, gain_exponent: f64) -> Result<Self> {
        if synths.is_empty() {
            bail!("No synths configured");
        }
        let mut names = BTreeSet::new();
        for synth in &synths {
            if !names.insert(synth.name.to_lowercase()) {
                bail!("Duplicate synth name '{}'", synth.name);
            }
            if synth.notes.is_empty() {
                bail!("Synth '{}' has no notes", synth.name);
            }
            if let Some(settings) = synth.chord_settings() {
                settings.chords.check_against(&synth.notes)?;
            }
        }
        Ok(Self {
            synths,
            sample_rate,
            gain_exponent,
        })
    }

    pub fn len(&self) -> usize {
        self.synths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.synths.is_empty()
    }

    /// 1-based number or case-insensitive name.
    pub fn find(&self, name_or_num: &str) -> Option<usize> {
        if let Ok(num) = name_or_num.trim().parse::<i64>() {
            return usize::try_from(num - 1).ok().filter(|&i| i < self.len());
        }
        let wanted = name_or_num.to_lowercase();
        self.synths.iter().position(|s| s.name.to_lowercase() == wanted)
    }

    /// Builds the generator of synth `index` for track `k`.
    ///
    /// Sampler synths without a sample play silence.
    pub fn build(
        &self,
        index: usize,
        k: usize,
        controls: &SharedControls,
        sample: Option<&SampleSet>,
    ) -> Box<dyn Waveform> {
        let synth = &self.synths[index];
        let sr = self.sample_rate;
        match &synth.generator {
            Generator::Oscillator(shape) => Box::new(Oscillator::new(*shape, self.gain_exponent)),
            Generator::ChordArp(settings) => Box::new(ChordArp::new(
                settings.clone(),
                k,
                controls.clone(),
                sr,
                self.gain_exponent,
            )),
            Generator::Loop(settings) | Generator::Stretch(settings) => {
                let Some(set) = sample else {
                    return Box::new(Silence);
                };
                let params = settings.slice_params(set, sr);
                let windowsize = params.windowsize;
                let slice = SliceState::new(
                    params,
                    set.for_track(k),
                    k,
                    settings.max_scrub_secs,
                    synth.notes.clone(),
                );
                match (&synth.generator, windowsize) {
                    (Generator::Stretch(_), Some(windowsize)) => Box::new(Stretcher::new(
                        slice,
                        controls.clone(),
                        windowsize,
                        settings.advance_factor,
                        settings.max_bend_semitones,
                        sr,
                    )),
                    _ => Box::new(Looper::new(
                        slice,
                        controls.clone(),
                        settings.max_bend_semitones,
                    )),
                }
            }
        }
    }

    /// Slice length of synth `index` for the longest sample at an elongation step.
    ///
    /// # Returns
    /// `None` for non-sampler synths, otherwise the signed slice length and the step
    /// after saturation or wrapping.
    pub fn probe_slice(
        &self,
        index: usize,
        set: &SampleSet,
        elongate_steps: i64,
        no_roll: bool,
    ) -> Option<(i64, Option<i64>)> {
        let settings = self.synths[index].sampler_settings()?;
        let params = settings.slice_params(set, self.sample_rate);
        Some(get_slice_len(
            set.longest().len(),
            &params,
            Some(elongate_steps),
            no_roll,
        ))
    }
}

fn drawbar_presets() -> Result<Vec<Option<Drawbar>>> {
    let max_len = HAMMOND_DRAWBAR_NOTES.len();
    Ok(vec![
        None,                                       // unison
        Some(Drawbar::parse("008080800", max_len)?), // clarinet
        Some(Drawbar::parse("868868446", max_len)?), // full organ
        Some(Drawbar::parse("888", max_len)?),       // jimmy smith
    ])
}

fn asos_tables() -> Result<(NoteTable, ChordTable)> {
    use ChordQuality::{Major, Minor};
    let add8_no3_add10 = |q: ChordQuality| q.voiced(Voicing::Add8No3Add10);
    let add8 = |q: ChordQuality| q.voiced(Voicing::Add8);
    let root = |q: ChordQuality| q.voiced(Voicing::Root);
    let notes = NoteTable::new(
        vec![vec![2, 4, 4, 6, 7, 9, 6, 11], vec![2, 4, 4, 11, 7, 9, 7, 11]],
        NUM_CONTROLS,
    )?;
    let chords = ChordTable::new(vec![
        vec![
            add8_no3_add10(Major),
            add8_no3_add10(Minor),
            add8(Major),
            add8(Major),
            add8(Major),
            root(Major),
            Minor.voiced(Voicing::Inversion(1)),
            root(Minor),
        ],
        vec![
            add8_no3_add10(Major),
            add8_no3_add10(Minor),
            add8(Major),
            root(Major),
            add8(Major),
            root(Major),
            Minor.voiced(Voicing::Inversion(1)),
            root(Minor),
        ],
    ])?;
    Ok((notes, chords))
}

/// The stock catalogue, in selection order.
pub fn default_catalogue(settings: &AppSettings) -> Result<Instruments> {
    let notes = Arc::new(NoteTable::from_scales(&Scale::ALL, NUM_CONTROLS)?);
    let chords = ChordTable::from_scales(&Scale::ALL)?;
    let (asos_notes, asos_chords) = asos_tables()?;
    let asos_notes = Arc::new(asos_notes);
    let drawbars = drawbar_presets()?;
    let dsaw = Shape::DetunedSaw {
        detune_semitones: settings.detune_semitones,
    };

    let chord_arp = |shape: Shape, chords: &ChordTable, arpeggio: Option<Arpeggio>| {
        Generator::ChordArp(Arc::new(ChordArpSettings {
            shape,
            chords: chords.clone(),
            seventh: arpeggio.is_some(),
            drawbars: drawbars.clone(),
            drawbar_notes: HAMMOND_DRAWBAR_NOTES.to_vec(),
            descending: false,
            arpeggio,
        }))
    };
    let sampler = SamplerSettings {
        slice_secs: settings.stretch_slice_secs,
        windowsize_secs: Some(settings.stretch_window_secs),
        advance_factor: settings.stretch_advance_factor,
        elongate_factor: settings.sampler_elongate_factor,
        extend_reversal: false,
        max_scrub_secs: settings.stretch_max_scrub_secs,
        max_bend_semitones: settings.sampler_max_bend_semitones,
    };
    let freeze = SamplerSettings {
        advance_factor: 0.0,
        ..sampler.clone()
    };

    let entry = |name: &str, generator: Generator, notes: &Arc<NoteTable>| SynthEntry {
        name: name.to_string(),
        generator,
        notes: notes.clone(),
    };
    let synths = vec![
        entry("sine", Generator::Oscillator(Shape::Sine), &notes),
        entry("chord", chord_arp(Shape::Sine, &chords, None), &notes),
        entry(
            "arpeggio-up7",
            chord_arp(
                Shape::Sine,
                &chords,
                Some(Arpeggio {
                    secs: settings.arpeggio_secs,
                    amp_step: settings.arpeggio_amp_step,
                }),
            ),
            &notes,
        ),
        entry("dsaw", Generator::Oscillator(dsaw), &notes),
        entry("dsaw-chord", chord_arp(dsaw, &chords, None), &notes),
        entry(
            "smp:loop",
            Generator::Loop(SamplerSettings {
                slice_secs: settings.loop_slice_secs,
                windowsize_secs: None,
                advance_factor: 0.0,
                extend_reversal: true,
                max_scrub_secs: settings.loop_max_scrub_secs,
                ..sampler.clone()
            }),
            &notes,
        ),
        entry(
            "smp:stretch+rev",
            Generator::Stretch(SamplerSettings {
                extend_reversal: true,
                ..sampler.clone()
            }),
            &notes,
        ),
        entry("smp:stretch", Generator::Stretch(sampler.clone()), &notes),
        entry("smp:freeze", Generator::Stretch(freeze.clone()), &notes),
        entry("smp:ASOS-CV", Generator::Stretch(freeze), &asos_notes),
        entry("ASOS-CV", chord_arp(Shape::Sine, &asos_chords, None), &asos_notes),
    ];
    Instruments::new(
        synths,
        settings.sample_rate as f64,
        settings.gain_normalization_exponent,
    )
}
