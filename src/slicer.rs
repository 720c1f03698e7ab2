//! Slice geometry shared by the sampler generators: analysis window sizing, the
//! elongation sequence of slice lengths, and the lazily refreshed scrub state.

use crate::controller::{ControlState, KnobMode};
use crate::surface::Transport;
use crate::theory::NoteTable;
use std::sync::Arc;

/// Even FFT size of at least 16 whose only prime factors are 2, 3 and 5.
pub fn get_windowsize(windowsize_secs: f64, sample_rate: f64) -> usize {
    let mut windowsize = ((windowsize_secs * sample_rate) as usize).max(16);
    loop {
        let mut n = windowsize;
        for factor in [2, 3, 5] {
            while n % factor == 0 {
                n /= factor;
            }
        }
        if n < 2 {
            break;
        }
        windowsize += 1;
    }
    windowsize / 2 * 2
}

/// Fixed parameters of a sampler synth that determine its slice lengths.
#[derive(Clone, Debug, PartialEq)]
pub struct SliceParams {
    /// `None` slices the whole sample. Negative plays the slice reversed.
    pub slice_secs: Option<f64>,
    pub sample_rate: f64,
    pub windowsize: Option<usize>,
    pub advance_factor: f64,
    pub elongate_factor: f64,
    pub extend_reversal: bool,
    /// Bounds the elongation sequence at the window size instead of zero.
    pub smart_skipping: bool,
}

/// `numpy.arange` over floats.
fn arange(start: f64, stop: f64, step: f64) -> Vec<f64> {
    let count = ((stop - start) / step).ceil();
    if !count.is_finite() || count <= 0.0 {
        return Vec::new();
    }
    (0..count as usize).map(|i| start + i as f64 * step).collect()
}

/// Computes the signed slice length for an elongation step.
///
/// # Arguments
/// * `sample_len` - Length of the sample being sliced.
/// * `params` - The synth's slicing parameters.
/// * `elongate_steps` - Offset into the sequence of candidate lengths; `None` or zero
///   yields the base slice.
/// * `no_roll` - Saturate at the ends of the sequence instead of wrapping.
///
/// # Returns
/// The slice length (negative for reversed slices) and, when the elongation sequence
/// was consulted, the effective step after wrapping or saturation.
pub fn get_slice_len(
    sample_len: usize,
    params: &SliceParams,
    elongate_steps: Option<i64>,
    no_roll: bool,
) -> (i64, Option<i64>) {
    if let Some(windowsize) = params.windowsize {
        if params.advance_factor == 0.0 {
            return (windowsize as i64, None);
        }
    }
    let total = sample_len as f64;
    let (mut slice_len, sign) = match params.slice_secs {
        None => (total, 1.0),
        Some(secs) => {
            let secs = if params.extend_reversal { secs.abs() } else { secs };
            (secs * params.sample_rate, if secs < 0.0 { -1.0 } else { 1.0 })
        }
    };
    slice_len = slice_len.round();
    let windowsize = params
        .windowsize
        .map_or((params.sample_rate / 100.0).round(), |w| w as f64);
    if slice_len > 0.0 || params.extend_reversal {
        slice_len = windowsize.max(slice_len.min(total));
    } else {
        slice_len = (-total).max(slice_len.min(-windowsize));
    }

    let steps = match elongate_steps {
        Some(steps) if steps != 0 && params.elongate_factor != 0.0 => steps,
        _ => return (slice_len as i64, None),
    };

    let step_len = slice_len.abs() * params.elongate_factor;
    let floor = if params.smart_skipping { windowsize } else { 0.0 };
    let mut neg_lens = Vec::new();
    if !params.extend_reversal {
        slice_len = slice_len.abs();
        neg_lens = arange(-slice_len, -total, -step_len);
        neg_lens.reverse();
        neg_lens.extend(arange(-slice_len, -floor, step_len).into_iter().skip(1));
        if neg_lens.first().map_or(true, |v| v.round() != -total) {
            neg_lens.insert(0, -total);
        }
        if params.smart_skipping && neg_lens.last().map_or(true, |v| v.round() != -windowsize) {
            neg_lens.push(-windowsize);
        }
    }
    let mut pos_lens = arange(slice_len, floor, -step_len);
    pos_lens.reverse();
    pos_lens.extend(arange(slice_len, total, step_len).into_iter().skip(1));
    if pos_lens.last().map_or(true, |v| v.round() != total) {
        pos_lens.push(total);
    }
    if params.smart_skipping && pos_lens.first().map_or(true, |v| v.round() != windowsize) {
        pos_lens.insert(0, windowsize);
    }

    let lens: Vec<f64> = neg_lens.into_iter().chain(pos_lens).collect();
    let target = slice_len * sign;
    let index_shift = lens
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| (*a - target).abs().total_cmp(&(*b - target).abs()))
        .map_or(0, |(i, _)| i as i64);
    let last = lens.len() as i64 - 1;
    let index = if no_roll {
        (index_shift + steps).clamp(0, last)
    } else {
        (index_shift + steps).rem_euclid(last + 1)
    };
    let mut len = lens[index as usize].round() as i64;
    len = if len < 0 {
        len.min(-(windowsize as i64))
    } else {
        len.max(windowsize as i64)
    };
    (len, Some(index - index_shift))
}

/// What [`SliceState::refresh`] found stale.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Invalidated {
    pub slice: bool,
    pub scrub: bool,
    pub pitch: bool,
    pub note: bool,
}

impl Invalidated {
    /// Any of these means a pitch-shifted buffer must be rebuilt.
    pub fn shift(&self) -> bool {
        self.slice || self.scrub || self.pitch || self.note
    }
}

/// Memoised slice, scrub position, pitch knob and autotune note of one sampler track.
///
/// Each quantity is recomputed only when its input changes: the sampler elongation
/// register, the scrub knob, the pitch knob and the autotune note.
pub struct SliceState {
    params: SliceParams,
    sample: Arc<Vec<f32>>,
    track: usize,
    max_scrub_secs: Option<f64>,
    notes: Arc<NoteTable>,
    elongate_steps: Option<i64>,
    slice_len: i64,
    sample_len_for_slicing: Option<i64>,
    scrub_knob: Option<f64>,
    pitch_knob: Option<f64>,
    note: Option<i32>,
    /// Read position within `loop_smp`.
    pub pos: f64,
    pub loop_smp: Vec<f32>,
}

impl SliceState {
    pub fn new(
        params: SliceParams,
        sample: Arc<Vec<f32>>,
        track: usize,
        max_scrub_secs: Option<f64>,
        notes: Arc<NoteTable>,
    ) -> Self {
        // Room for the longest slice plus its reversal, so rebuilds never grow it.
        let loop_capacity = sample.len() * if params.extend_reversal { 2 } else { 1 };
        Self {
            params,
            sample,
            track,
            max_scrub_secs,
            notes,
            elongate_steps: None,
            slice_len: 0,
            sample_len_for_slicing: None,
            scrub_knob: None,
            pitch_knob: None,
            note: None,
            pos: 0.0,
            loop_smp: Vec::with_capacity(loop_capacity),
        }
    }

    pub fn slice_len(&self) -> i64 {
        self.slice_len
    }

    pub fn pitch_knob(&self) -> f64 {
        self.pitch_knob.unwrap_or(0.0)
    }

    pub fn note(&self) -> Option<i32> {
        self.note
    }

    pub fn refresh(&mut self, state: &ControlState) -> Invalidated {
        let mut stale = Invalidated::default();
        let sample_len = self.sample.len() as i64;

        let steps = state.track_register.smp;
        if self.elongate_steps != Some(steps) {
            self.elongate_steps = Some(steps);
            self.slice_len = get_slice_len(self.sample.len(), &self.params, Some(steps), false).0;
            if self.sample_len_for_slicing.is_none() {
                let initial = if steps != 0 {
                    get_slice_len(self.sample.len(), &self.params, None, false).0
                } else {
                    self.slice_len
                };
                self.sample_len_for_slicing = Some((sample_len - initial.abs()).max(0));
            }
            self.pos = 0.0;
            self.scrub_knob = None;
            stale.slice = true;
        }

        let scrub = state.get_knob(self.track, Some(KnobMode::SmpScrub));
        if self.scrub_knob != Some(scrub) {
            self.scrub_knob = Some(scrub);
            self.rebuild_loop(scrub);
            self.pitch_knob = None;
            stale.scrub = true;
        }

        let pitch = state.get_knob(self.track, Some(KnobMode::SmpPitch));
        if self.pitch_knob != Some(pitch) {
            self.pitch_knob = Some(pitch);
            stale.pitch = true;
        }

        if state.transport(Transport::Set) {
            let note = self.notes.note(state.track_register.syn, self.track);
            if self.note != Some(note) {
                self.note = Some(note);
                stale.note = true;
            }
        } else if self.note.is_some() {
            self.note = None;
            stale.note = true;
        }
        stale
    }

    fn rebuild_loop(&mut self, scrub: f64) {
        let sample_len = self.sample.len() as i64;
        let mut scrub_len = sample_len;
        if let Some(secs) = self.max_scrub_secs {
            scrub_len = scrub_len.min((secs * self.params.sample_rate).round() as i64);
        }
        let slfs = self.sample_len_for_slicing.unwrap_or(0);
        let offset = ControlState::relative_track(self.track) * slfs as f64;
        let global_pos = ((scrub * scrub_len as f64 + offset) as i64).clamp(0, slfs.max(0));
        let start = (global_pos.min(sample_len)) as usize;
        let end = (global_pos + self.slice_len.abs()).min(sample_len) as usize;

        self.loop_smp.clear();
        self.loop_smp.extend_from_slice(&self.sample[start..end.max(start)]);
        if self.slice_len < 0 {
            self.loop_smp.reverse();
        }
        if self.params.extend_reversal
            && (self.params.windowsize.is_none() || self.params.advance_factor != 0.0)
        {
            let len = self.loop_smp.len();
            for i in (0..len).rev() {
                let s = self.loop_smp[i];
                self.loop_smp.push(s);
            }
        }
    }
}
