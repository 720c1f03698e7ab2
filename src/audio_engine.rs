// src/audio_engine.rs

mod command;

pub use command::{AudioCommand, EngineEvent};

use crate::synth::{Waveform, MIDDLE_C_FREQUENCY};
use crate::theory::BINS_PER_OCTAVE;
use rayon::prelude::*; // Import Rayon for parallel processing
use ringbuf::{HeapConsumer, HeapProducer};
use std::f64::consts::TAU;
use tracing::warn;

/// Phase is wrapped at this whole multiple of 2π to keep precision.
pub const PHASE_CUTOFF: f64 = TAU * 318_309_886.0;

/// Longest block handed to a generator; longer requests are rendered in chunks.
pub const MAX_BLOCK: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VoiceSettings {
    pub sample_rate: f64,
    pub min_db: f64,
    pub pitch_per_second: f64,
    pub db_per_second: f64,
}

/// Moves `value` toward `target` by at most `step`.
#[inline]
fn glide(value: f64, target: f64, step: f64) -> f64 {
    if value < target {
        (value + step).min(target)
    } else {
        (value - step).max(target)
    }
}

// --- Voice ---

/// One track's oscillator: glided pitch and volume driving a waveform generator.
pub struct Voice {
    waveform: Option<Box<dyn Waveform>>,
    settings: VoiceSettings,
    pitch: f64,
    target_pitch: f64,
    db: f64,
    target_db: f64,
    phase: f64,
    phase_buf: Vec<f64>,
    amp_buf: Vec<f32>,
}

impl Voice {
    /// An idle voice with its block buffers already allocated.
    pub fn new(settings: VoiceSettings) -> Self {
        Self {
            waveform: None,
            settings,
            pitch: 0.0,
            target_pitch: 0.0,
            db: settings.min_db,
            target_db: settings.min_db,
            phase: 0.0,
            phase_buf: vec![0.0; MAX_BLOCK],
            amp_buf: vec![0.0; MAX_BLOCK],
        }
    }

    /// Restarts from silence at `pitch` and returns the previous generator.
    pub fn start(&mut self, waveform: Box<dyn Waveform>, pitch: f64) -> Option<Box<dyn Waveform>> {
        self.pitch = pitch;
        self.target_pitch = pitch;
        self.db = self.settings.min_db;
        self.target_db = self.settings.min_db;
        self.phase = 0.0;
        self.waveform.replace(waveform)
    }

    pub fn set_waveform(&mut self, waveform: Box<dyn Waveform>) -> Option<Box<dyn Waveform>> {
        self.waveform.replace(waveform)
    }

    pub fn stop(&mut self) -> Option<Box<dyn Waveform>> {
        self.db = self.settings.min_db;
        self.target_db = self.settings.min_db;
        self.waveform.take()
    }

    pub fn set_pitch(&mut self, semitones: f64) {
        self.target_pitch = semitones;
    }

    pub fn set_volume(&mut self, db: f64) {
        self.target_db = db;
    }

    fn is_silent(&self) -> bool {
        self.waveform.is_none()
            || (self.db <= self.settings.min_db && self.target_db <= self.settings.min_db)
    }

    pub fn process(&mut self, output: &mut [f32]) {
        for block in output.chunks_mut(MAX_BLOCK) {
            self.process_block(block);
        }
    }

    fn process_block(&mut self, output: &mut [f32]) {
        if self.is_silent() {
            output.fill(0.0);
            return;
        }
        let n = output.len();
        let sr = self.settings.sample_rate;
        let pitch_step = self.settings.pitch_per_second / sr;
        let db_step = self.settings.db_per_second / sr;
        for i in 0..n {
            self.pitch = glide(self.pitch, self.target_pitch, pitch_step);
            let freq = MIDDLE_C_FREQUENCY * 2f64.powf(self.pitch / BINS_PER_OCTAVE as f64);
            self.phase += TAU * freq / sr;
            if self.phase >= PHASE_CUTOFF {
                self.phase -= PHASE_CUTOFF;
            }
            self.phase_buf[i] = self.phase;

            self.db = glide(self.db, self.target_db, db_step);
            self.amp_buf[i] = if self.db <= self.settings.min_db {
                0.0
            } else {
                10f64.powf(self.db / 20.0) as f32
            };
        }

        if let Some(waveform) = self.waveform.as_mut() {
            waveform.render(&self.phase_buf[..n], output);
        }
        for (y, a) in output.iter_mut().zip(&self.amp_buf[..n]) {
            *y = if y.is_finite() { *y * a } else { 0.0 };
        }
    }
}

// --- Control-side handle ---

/// Per-track voice operations used by the soundscape.
pub trait VoiceBank: Send {
    fn start(&mut self, track: usize, waveform: Box<dyn Waveform>, pitch: f64);
    fn set_waveform(&mut self, track: usize, waveform: Box<dyn Waveform>);
    fn set_pitch(&mut self, track: usize, semitones: f64);
    fn set_volume(&mut self, track: usize, db: f64);
    fn stop_all(&mut self);
    /// Captures the track mix into `buffer`, never past its capacity.
    fn start_recording(&mut self, buffer: Vec<f32>);
    fn stop_recording(&mut self);
    /// The latest finished recording. Also frees generators the audio thread let go of.
    fn poll_take(&mut self) -> Option<Vec<f32>>;
}

/// Sends voice operations to the audio thread and collects what it sends back.
pub struct AudioHandle {
    command_producer: HeapProducer<AudioCommand>,
    event_consumer: HeapConsumer<EngineEvent>,
}

impl AudioHandle {
    pub fn new(
        command_producer: HeapProducer<AudioCommand>,
        event_consumer: HeapConsumer<EngineEvent>,
    ) -> Self {
        Self {
            command_producer,
            event_consumer,
        }
    }

    fn send(&mut self, command: AudioCommand) {
        if let Err(command) = self.command_producer.push(command) {
            warn!("Audio command queue full, dropping {:?}", command);
        }
    }
}

impl VoiceBank for AudioHandle {
    fn start(&mut self, track: usize, waveform: Box<dyn Waveform>, pitch: f64) {
        self.send(AudioCommand::StartVoice {
            track,
            waveform,
            pitch,
        });
    }

    fn set_waveform(&mut self, track: usize, waveform: Box<dyn Waveform>) {
        self.send(AudioCommand::SetWaveform { track, waveform });
    }

    fn set_pitch(&mut self, track: usize, semitones: f64) {
        self.send(AudioCommand::SetPitch { track, semitones });
    }

    fn set_volume(&mut self, track: usize, db: f64) {
        self.send(AudioCommand::SetVolume { track, db });
    }

    fn stop_all(&mut self) {
        self.send(AudioCommand::StopAll);
    }

    fn start_recording(&mut self, buffer: Vec<f32>) {
        self.send(AudioCommand::StartRecording { buffer });
    }

    fn stop_recording(&mut self) {
        self.send(AudioCommand::StopRecording);
    }

    fn poll_take(&mut self) -> Option<Vec<f32>> {
        let mut take = None;
        while let Some(event) = self.event_consumer.pop() {
            match event {
                EngineEvent::Retired(waveform) => drop(waveform),
                EngineEvent::Take(samples) => take = Some(samples),
            }
        }
        take
    }
}

// --- Audio thread ---

pub struct AudioEngine {
    command_consumer: HeapConsumer<AudioCommand>,
    event_producer: HeapProducer<EngineEvent>,
    voices: Vec<Voice>,
    voice_outputs: Vec<Vec<f32>>,
    /// Voices `0..recorded_voices` feed the recording.
    recorded_voices: usize,
    take: Option<Vec<f32>>,
}

impl AudioEngine {
    /// Allocates `num_voices` voice slots up front; nothing is allocated while rendering.
    pub fn new(
        command_consumer: HeapConsumer<AudioCommand>,
        event_producer: HeapProducer<EngineEvent>,
        settings: VoiceSettings,
        num_voices: usize,
        recorded_voices: usize,
    ) -> Self {
        Self {
            command_consumer,
            event_producer,
            voices: (0..num_voices).map(|_| Voice::new(settings)).collect(),
            voice_outputs: vec![vec![0.0; MAX_BLOCK]; num_voices],
            recorded_voices: recorded_voices.min(num_voices),
            take: None,
        }
    }

    /// Hands a generator back to the control loop.
    fn retire(&mut self, waveform: Option<Box<dyn Waveform>>) {
        if let Some(waveform) = waveform {
            // A full queue frees it here.
            let _ = self.event_producer.push(EngineEvent::Retired(waveform));
        }
    }

    fn finish_take(&mut self) {
        if let Some(take) = self.take.take() {
            let _ = self.event_producer.push(EngineEvent::Take(take));
        }
    }

    pub fn handle_commands(&mut self) {
        while let Some(command) = self.command_consumer.pop() {
            match command {
                AudioCommand::StartVoice {
                    track,
                    waveform,
                    pitch,
                } => {
                    let old = match self.voices.get_mut(track) {
                        Some(voice) => voice.start(waveform, pitch),
                        None => Some(waveform),
                    };
                    self.retire(old);
                }
                AudioCommand::SetWaveform { track, waveform } => {
                    let old = match self.voices.get_mut(track) {
                        Some(voice) => voice.set_waveform(waveform),
                        None => Some(waveform),
                    };
                    self.retire(old);
                }
                AudioCommand::SetPitch { track, semitones } => {
                    if let Some(voice) = self.voices.get_mut(track) {
                        voice.set_pitch(semitones);
                    }
                }
                AudioCommand::SetVolume { track, db } => {
                    if let Some(voice) = self.voices.get_mut(track) {
                        voice.set_volume(db);
                    }
                }
                AudioCommand::StartRecording { buffer } => {
                    self.finish_take();
                    self.take = Some(buffer);
                }
                AudioCommand::StopRecording => self.finish_take(),
                AudioCommand::StopAll => {
                    for track in 0..self.voices.len() {
                        let old = self.voices[track].stop();
                        self.retire(old);
                    }
                }
            }
        }
    }

    /// Renders the mono mix of every voice into `output`.
    pub fn process_buffer(&mut self, output: &mut [f32]) {
        self.handle_commands();
        for block in output.chunks_mut(MAX_BLOCK) {
            self.render_block(block);
        }
    }

    fn render_block(&mut self, output: &mut [f32]) {
        let n = output.len();

        // --- Parallel Processing of Voices ---
        self.voices
            .par_iter_mut()
            .zip(self.voice_outputs.par_iter_mut())
            .for_each(|(voice, voice_output_buffer)| voice.process(&mut voice_output_buffer[..n]));

        // --- Final Mixdown ---
        output.fill(0.0);
        let (recorded, rest) = self.voice_outputs.split_at(self.recorded_voices);
        for voice_buffer in recorded {
            for (y, s) in output.iter_mut().zip(voice_buffer) {
                *y += s;
            }
        }
        if let Some(take) = self.take.as_mut() {
            let room = take.capacity() - take.len();
            take.extend_from_slice(&output[..n.min(room)]);
        }
        for voice_buffer in rest {
            for (y, s) in output.iter_mut().zip(voice_buffer) {
                *y += s;
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ringbuf::HeapRb;

    const SETTINGS: VoiceSettings = VoiceSettings {
        sample_rate: 1000.0,
        min_db: -100.0,
        pitch_per_second: 1000.0,
        db_per_second: 100_000.0,
    };

    /// Emits the phase it is given.
    struct PhaseProbe;

    impl Waveform for PhaseProbe {
        fn render(&mut self, phase: &[f64], out: &mut [f32]) {
            for (y, &x) in out.iter_mut().zip(phase) {
                *y = x as f32;
            }
        }
    }

    struct Dc(f32);

    impl Waveform for Dc {
        fn render(&mut self, _phase: &[f64], out: &mut [f32]) {
            out.fill(self.0);
        }
    }

    /// Four voices, the first three recorded.
    fn engine() -> (AudioEngine, AudioHandle) {
        let (producer, consumer) = HeapRb::<AudioCommand>::new(64).split();
        let (event_producer, event_consumer) = HeapRb::<EngineEvent>::new(64).split();
        (
            AudioEngine::new(consumer, event_producer, SETTINGS, 4, 3),
            AudioHandle::new(producer, event_consumer),
        )
    }

    fn started(waveform: Box<dyn Waveform>) -> Voice {
        let mut voice = Voice::new(SETTINGS);
        voice.start(waveform, 0.0);
        voice.set_volume(0.0);
        voice
    }

    #[test]
    fn new_voice_is_silent_until_volume_is_raised() {
        let (mut engine, mut handle) = engine();
        handle.start(0, Box::new(Dc(0.5)), 0.0);
        let mut out = vec![1.0; 16];
        engine.process_buffer(&mut out);
        assert_eq!(out, vec![0.0; 16]);

        handle.set_volume(0, 0.0);
        engine.process_buffer(&mut out);
        // 100 dB per sample reaches 0 dB on the first sample.
        assert_abs_diff_eq!(out[15], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn phase_advances_at_note_frequency() {
        let (mut engine, mut handle) = engine();
        handle.start(1, Box::new(PhaseProbe), 0.0);
        handle.set_volume(1, 0.0);
        let mut out = vec![0.0; 8];
        engine.process_buffer(&mut out);
        let step = TAU * MIDDLE_C_FREQUENCY / SETTINGS.sample_rate;
        assert_abs_diff_eq!((out[5] - out[4]) as f64, step, epsilon = 1e-4);
    }

    #[test]
    fn long_requests_are_rendered_in_blocks() {
        let mut voice = started(Box::new(PhaseProbe));
        let mut out = vec![0.0; 2 * MAX_BLOCK + 5];
        voice.process(&mut out);
        let step = TAU * MIDDLE_C_FREQUENCY / SETTINGS.sample_rate;
        for i in [1, MAX_BLOCK, 2 * MAX_BLOCK, 2 * MAX_BLOCK + 4] {
            assert_abs_diff_eq!((out[i] - out[i - 1]) as f64, step, epsilon = 1e-2);
        }
        assert_eq!(voice.phase_buf.capacity(), MAX_BLOCK);
    }

    #[test]
    fn pitch_glides_toward_target() {
        let mut voice = started(Box::new(PhaseProbe));
        voice.set_pitch(12.0);
        let mut out = vec![0.0; 4];
        voice.process(&mut out);
        assert_abs_diff_eq!(voice.pitch, 4.0);
        let mut out = vec![0.0; 20];
        voice.process(&mut out);
        assert_abs_diff_eq!(voice.pitch, 12.0);
    }

    #[test]
    fn voices_are_mixed_and_stop_all_silences() {
        let (mut engine, mut handle) = engine();
        for track in 0..3 {
            handle.start(track, Box::new(Dc(0.25)), 0.0);
            handle.set_volume(track, 0.0);
        }
        handle.set_waveform(2, Box::new(Dc(-0.25)));
        let mut out = vec![0.0; 4];
        engine.process_buffer(&mut out);
        assert_abs_diff_eq!(out[3], 0.25, epsilon = 1e-6);

        handle.stop_all();
        engine.process_buffer(&mut out);
        assert_eq!(out, vec![0.0; 4]);
    }

    #[test]
    fn replaced_generators_are_sent_back() {
        let (producer, consumer) = HeapRb::<AudioCommand>::new(8).split();
        let (event_producer, mut events) = HeapRb::<EngineEvent>::new(8).split();
        let mut engine = AudioEngine::new(consumer, event_producer, SETTINGS, 2, 2);
        let mut handle = AudioHandle::new(producer, HeapRb::<EngineEvent>::new(1).split().1);
        handle.start(0, Box::new(Dc(0.1)), 0.0);
        handle.set_waveform(0, Box::new(Dc(0.2)));
        handle.start(5, Box::new(Dc(0.3)), 0.0);
        engine.process_buffer(&mut [0.0; 4]);
        let retired: Vec<String> = std::iter::from_fn(|| events.pop())
            .map(|e| format!("{:?}", e))
            .collect();
        assert_eq!(retired, vec!["Retired", "Retired"]);

        handle.stop_all();
        engine.process_buffer(&mut [0.0; 4]);
        assert!(matches!(events.pop(), Some(EngineEvent::Retired(_))));
        assert!(events.pop().is_none());
    }

    #[test]
    fn recording_captures_the_track_mix_up_to_capacity() {
        let (mut engine, mut handle) = engine();
        for track in 0..4 {
            handle.start(track, Box::new(Dc(0.25)), 0.0);
            handle.set_volume(track, 0.0);
        }
        handle.start_recording(Vec::with_capacity(6));
        let mut out = vec![0.0; 4];
        engine.process_buffer(&mut out);
        assert_abs_diff_eq!(out[0], 1.0, epsilon = 1e-6);
        engine.process_buffer(&mut out);
        assert!(handle.poll_take().is_none());

        handle.stop_recording();
        engine.process_buffer(&mut out);
        let take = handle.poll_take().unwrap();
        assert_eq!(take.len(), 6);
        // The fourth voice is not recorded.
        assert!(take.iter().all(|&s| (s - 0.75).abs() < 1e-6));
    }

    #[test]
    fn non_finite_output_is_zeroed() {
        let mut voice = started(Box::new(Dc(f32::NAN)));
        let mut out = vec![0.0; 4];
        voice.process(&mut out);
        assert_eq!(out, vec![0.0; 4]);
    }
}
