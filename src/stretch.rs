// src/stretch.rs
//! Paulstretch-style stretcher: magnitude spectra of successive windows are
//! resynthesised with random phases and overlap-added.
//!
//! An advance factor below one stretches time, zero freezes the current window
//! into a static texture that keeps re-randomising its phases.

use crate::audio_engine::MAX_BLOCK;
use crate::controller::{read_controls, SharedControls};
use crate::slicer::SliceState;
use crate::synth::{Waveform, MIDDLE_C_FREQUENCY};
use crate::theory::BINS_PER_OCTAVE;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use realfft::num_complex::Complex;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use std::collections::VecDeque;
use std::f64::consts::{PI, SQRT_2};
use std::sync::Arc;

/// Empirical overlap-add gain.
const AMP_CORRECTION: f64 = 1.6 * 1.6;

/// `(1 - x^2)^1.25` over `x` evenly spaced in [-1, 1].
pub fn stretch_window(windowsize: usize) -> Vec<f64> {
    let step = if windowsize > 1 {
        2.0 / (windowsize - 1) as f64
    } else {
        0.0
    };
    (0..windowsize)
        .map(|i| {
            let x = -1.0 + i as f64 * step;
            (1.0 - x * x).max(0.0).powf(1.25)
        })
        .collect()
}

/// Frequency of the strongest non-DC bin.
pub fn fundamental_hz(freqs: &[f64], sample_rate: f64, windowsize: usize) -> f64 {
    let bin = freqs
        .iter()
        .enumerate()
        .skip(1)
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map_or(0, |(i, _)| i);
    bin as f64 * sample_rate / windowsize as f64
}

/// Moves magnitude bins by `semitones` into `out`; lowering accumulates, raising stretches.
pub fn remap_bins(freqs: &[f64], semitones: f64, out: &mut [f64]) {
    let rap = 2f64.powf(semitones / BINS_PER_OCTAVE as f64);
    if rap < 1.0 {
        out.fill(0.0);
        for (i, &f) in freqs.iter().enumerate() {
            out[(i as f64 * rap) as usize] += f;
        }
    } else {
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = freqs[(i as f64 / rap) as usize];
        }
    }
}

pub struct Stretcher {
    slice: SliceState,
    controls: SharedControls,
    max_bend_semitones: f64,
    sample_rate: f64,
    advance_factor: f64,
    windowsize: usize,
    window: Vec<f64>,
    r2c: Arc<dyn RealToComplex<f64>>,
    c2r: Arc<dyn ComplexToReal<f64>>,
    in_buf: Vec<f64>,
    spectrum: Vec<Complex<f64>>,
    out_buf: Vec<f64>,
    forward_scratch: Vec<Complex<f64>>,
    inverse_scratch: Vec<Complex<f64>>,
    /// Magnitude spectrum of the current window, valid when `has_freqs`.
    freqs: Vec<f64>,
    has_freqs: bool,
    /// `freqs` after pitch remapping, valid when `has_shifted`.
    shifted: Vec<f64>,
    has_shifted: bool,
    old_windowed: Vec<f64>,
    later: VecDeque<f32>,
    rng: StdRng,
}

impl Stretcher {
    /// Plans the FFTs and allocates every buffer the audio thread will need.
    pub fn new(
        slice: SliceState,
        controls: SharedControls,
        windowsize: usize,
        advance_factor: f64,
        max_bend_semitones: f64,
        sample_rate: f64,
    ) -> Self {
        let mut planner = RealFftPlanner::<f64>::new();
        let r2c = planner.plan_fft_forward(windowsize);
        let c2r = planner.plan_fft_inverse(windowsize);
        let bins = windowsize / 2 + 1;
        Self {
            slice,
            controls,
            max_bend_semitones,
            sample_rate,
            advance_factor,
            windowsize,
            window: stretch_window(windowsize),
            in_buf: r2c.make_input_vec(),
            spectrum: r2c.make_output_vec(),
            out_buf: c2r.make_output_vec(),
            forward_scratch: r2c.make_scratch_vec(),
            inverse_scratch: c2r.make_scratch_vec(),
            r2c,
            c2r,
            freqs: vec![0.0; bins],
            has_freqs: false,
            shifted: vec![0.0; bins],
            has_shifted: false,
            old_windowed: vec![0.0; windowsize],
            later: VecDeque::with_capacity(MAX_BLOCK + windowsize),
            rng: StdRng::from_entropy(),
        }
    }

    fn analyse(&mut self) {
        let start = self.slice.pos as usize;
        for (j, slot) in self.in_buf.iter_mut().enumerate() {
            let s = self.slice.loop_smp.get(start + j).copied().unwrap_or(0.0);
            *slot = s as f64 * self.window[j];
        }
        let transformed = self.r2c.process_with_scratch(
            &mut self.in_buf,
            &mut self.spectrum,
            &mut self.forward_scratch,
        );
        match transformed {
            Ok(()) => {
                for (f, c) in self.freqs.iter_mut().zip(&self.spectrum) {
                    *f = c.norm();
                }
            }
            Err(_) => self.freqs.fill(0.0),
        }
    }

    /// Bend from the pitch knob plus the autotune correction, `None` when there is none.
    fn shift_semitones(&self) -> Option<f64> {
        let pitch_knob = self.slice.pitch_knob();
        let note = self.slice.note();
        if pitch_knob == 0.0 && note.is_none() {
            return None;
        }
        let mut semitones = pitch_knob * self.max_bend_semitones;
        if let Some(note) = note {
            let fundamental = fundamental_hz(&self.freqs, self.sample_rate, self.windowsize);
            if fundamental > 0.0 {
                semitones += note as f64
                    - (fundamental / MIDDLE_C_FREQUENCY).log2() * BINS_PER_OCTAVE as f64;
            }
        }
        Some(semitones)
    }

    fn remap(&mut self) {
        match self.shift_semitones() {
            Some(semitones) => remap_bins(&self.freqs, semitones, &mut self.shifted),
            None => self.shifted.copy_from_slice(&self.freqs),
        }
    }

    /// Synthesises one hop of output into `later`.
    fn next_frame(&mut self) {
        let ws = self.windowsize;
        if !self.has_freqs || self.advance_factor != 0.0 {
            self.analyse();
            self.has_freqs = true;
            self.has_shifted = false;
        }
        if !self.has_shifted {
            self.remap();
            self.has_shifted = true;
        }

        for (c, &m) in self.spectrum.iter_mut().zip(&self.shifted) {
            *c = Complex::from_polar(m, self.rng.gen_range(0.0..2.0 * PI));
        }
        // Real-only DC and Nyquist bins.
        if let Some(dc) = self.spectrum.first_mut() {
            dc.im = 0.0;
        }
        if ws % 2 == 0 {
            if let Some(nyquist) = self.spectrum.last_mut() {
                nyquist.im = 0.0;
            }
        }
        let synthesised = self.c2r.process_with_scratch(
            &mut self.spectrum,
            &mut self.out_buf,
            &mut self.inverse_scratch,
        );
        if synthesised.is_err() {
            self.out_buf.fill(0.0);
        }
        for (s, w) in self.out_buf.iter_mut().zip(&self.window) {
            *s = *s / ws as f64 * w;
        }

        let half = ws / 2;
        let (buf, old) = (&self.out_buf, &self.old_windowed);
        self.later.extend((0..half).map(|j| {
            let y = (buf[j] + old[half + j]) / SQRT_2 * AMP_CORRECTION;
            y.clamp(-1.0, 1.0) as f32
        }));
        std::mem::swap(&mut self.old_windowed, &mut self.out_buf);

        let span = (self.slice.loop_smp.len() as f64 - ws as f64).max(1.0);
        self.slice.pos = (self.slice.pos + half as f64 * self.advance_factor) % span;
    }
}

impl Waveform for Stretcher {
    fn render(&mut self, phase: &[f64], out: &mut [f32]) {
        let stale = {
            let state = read_controls(&self.controls);
            self.slice.refresh(&state)
        };
        if stale.slice || stale.scrub {
            self.has_freqs = false;
        }
        if stale.shift() {
            self.has_shifted = false;
        }
        if self.windowsize < 2 {
            out.fill(0.0);
            return;
        }
        while self.later.len() < phase.len() {
            self.next_frame();
        }
        for y in out.iter_mut() {
            *y = self.later.pop_front().unwrap_or(0.0);
        }
    }
}
