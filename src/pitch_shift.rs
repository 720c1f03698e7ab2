// src/pitch_shift.rs
//! Duration-preserving pitch shift: phase-vocoder time stretch followed by
//! resampling back to the original length.

use crate::sample_library::resample;
use anyhow::{anyhow, Result};
use realfft::num_complex::Complex;
use realfft::RealFftPlanner;
use std::f64::consts::PI;

pub const N_FFT: usize = 2048;
pub const HOP: usize = N_FFT / 4;

fn hann(n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| 0.5 - 0.5 * (2.0 * PI * i as f64 / n as f64).cos())
        .collect()
}

/// Shifts `samples` by `semitones` while keeping the length unchanged.
pub fn pitch_shift(samples: &[f32], semitones: f64) -> Result<Vec<f32>> {
    if semitones == 0.0 || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let rate = 2f64.powf(-semitones / 12.0);
    let stretched = time_stretch(samples, rate)?;
    let mut shifted = resample(stretched, rate)?;
    shifted.resize(samples.len(), 0.0);
    Ok(shifted)
}

/// Phase-vocoder time stretch; `rate` > 1 speeds up.
pub fn time_stretch(samples: &[f32], rate: f64) -> Result<Vec<f32>> {
    let window = hann(N_FFT);
    let mut planner = RealFftPlanner::<f64>::new();
    let r2c = planner.plan_fft_forward(N_FFT);
    let c2r = planner.plan_fft_inverse(N_FFT);
    let bins = N_FFT / 2 + 1;

    // Centered frames.
    let pad = N_FFT / 2;
    let mut padded = vec![0.0f64; pad];
    padded.extend(samples.iter().map(|&s| s as f64));
    padded.extend(std::iter::repeat(0.0).take(pad));
    let num_frames = 1 + padded.len().saturating_sub(N_FFT) / HOP;

    let mut stft: Vec<Vec<Complex<f64>>> = Vec::with_capacity(num_frames + 1);
    let mut frame = r2c.make_input_vec();
    for i in 0..num_frames {
        let start = i * HOP;
        for (j, slot) in frame.iter_mut().enumerate() {
            *slot = padded.get(start + j).copied().unwrap_or(0.0) * window[j];
        }
        let mut spectrum = r2c.make_output_vec();
        r2c.process(&mut frame, &mut spectrum)
            .map_err(|e| anyhow!("Forward FFT failed: {}", e))?;
        stft.push(spectrum);
    }
    stft.push(vec![Complex::new(0.0, 0.0); bins]);

    let phi_advance: Vec<f64> = (0..bins)
        .map(|k| 2.0 * PI * HOP as f64 * k as f64 / N_FFT as f64)
        .collect();
    let mut phase_acc: Vec<f64> = stft[0].iter().map(|c| c.arg()).collect();

    let mut out_frames: Vec<Vec<Complex<f64>>> = Vec::new();
    let mut t = 0.0;
    while t < num_frames as f64 {
        let index = t as usize;
        let alpha = t.fract();
        let (left, right) = (&stft[index], &stft[index + 1]);
        let mut column = Vec::with_capacity(bins);
        for k in 0..bins {
            let magnitude = (1.0 - alpha) * left[k].norm() + alpha * right[k].norm();
            column.push(Complex::from_polar(magnitude, phase_acc[k]));
            let mut dphase = right[k].arg() - left[k].arg() - phi_advance[k];
            dphase -= 2.0 * PI * (dphase / (2.0 * PI)).round();
            phase_acc[k] += phi_advance[k] + dphase;
        }
        out_frames.push(column);
        t += rate;
    }

    let out_len = (samples.len() as f64 / rate).round() as usize;
    let total = out_frames.len().saturating_sub(1) * HOP + N_FFT;
    let mut output = vec![0.0f64; total];
    let mut norm = vec![0.0f64; total];
    let mut buffer = c2r.make_output_vec();
    for (i, mut column) in out_frames.into_iter().enumerate() {
        column[0].im = 0.0;
        column[bins - 1].im = 0.0;
        c2r.process(&mut column, &mut buffer)
            .map_err(|e| anyhow!("Inverse FFT failed: {}", e))?;
        let start = i * HOP;
        for j in 0..N_FFT {
            output[start + j] += buffer[j] / N_FFT as f64 * window[j];
            norm[start + j] += window[j] * window[j];
        }
    }
    Ok(output
        .iter()
        .zip(&norm)
        .skip(pad)
        .take(out_len)
        .map(|(&y, &w)| if w > 1e-10 { (y / w) as f32 } else { y as f32 })
        .collect())
}
