// src/soundscape.rs
//! Binds the selected synth and sample to the eight track voices and follows the controller.

use crate::audio_engine::VoiceBank;
use crate::controller::{ControlState, Controller};
use crate::instruments::Instruments;
use crate::sample_library::{LoadedSample, SampleLibrary};
use crate::sampler_engine::TakeLoop;
use crate::surface::{knob_index, StateKind, Transport, NUM_CONTROLS};
use crate::synth::{Drawbar, Waveform};
use crate::theory::{note_and_chord, note_name, resolve, ChordTable, NoteTable};
use anyhow::{bail, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Voice slot of the live looper played by the play button.
pub const LOOP_TRACK: usize = NUM_CONTROLS;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SoundscapeOptions {
    pub min_db: f64,
    pub max_db: f64,
    pub synth_max_bend_semitones: f64,
    pub exit_on_error: bool,
    /// Recording stops growing the take at this many frames.
    pub max_record_frames: usize,
}

pub struct Soundscape {
    instruments: Instruments,
    library: SampleLibrary,
    voices: Box<dyn VoiceBank>,
    options: SoundscapeOptions,
    synth_ind: Option<usize>,
    sample_ind: Option<usize>,
    sample: Option<LoadedSample>,
    notes: Option<Arc<NoteTable>>,
    chords: Option<ChordTable>,
    drawbars: Option<Vec<Option<Drawbar>>>,
    drawbar_notes: Option<Vec<i32>>,
    volumes: [f64; NUM_CONTROLS + 1],
    voices_started: bool,
    warned_no_samples: bool,
    /// Mix of the tracks captured by the last recording.
    take: Option<Arc<Vec<f32>>>,
    recording: bool,
    awaiting_take: bool,
    /// The take in flight was cut off by a reset.
    discard_take: bool,
    loop_playing: bool,
    /// Tracks playing the take instead of the synth.
    live_looping: [bool; NUM_CONTROLS],
}

impl Soundscape {
    pub fn new(
        instruments: Instruments,
        library: SampleLibrary,
        voices: Box<dyn VoiceBank>,
        options: SoundscapeOptions,
    ) -> Self {
        Self {
            instruments,
            library,
            voices,
            options,
            synth_ind: None,
            sample_ind: None,
            sample: None,
            notes: None,
            chords: None,
            drawbars: None,
            drawbar_notes: None,
            volumes: [options.min_db; NUM_CONTROLS + 1],
            voices_started: false,
            warned_no_samples: false,
            take: None,
            recording: false,
            awaiting_take: false,
            discard_take: false,
            loop_playing: false,
            live_looping: [false; NUM_CONTROLS],
        }
    }

    pub fn instruments(&self) -> &Instruments {
        &self.instruments
    }

    /// Forgets the current selection and silences every voice; the next update rebuilds them.
    pub fn reset(&mut self) {
        self.sample_ind = None;
        self.synth_ind = None;
        self.kill_sound();
        if self.recording || self.awaiting_take {
            self.discard_take = true;
        }
        if self.recording {
            self.voices.stop_recording();
            self.recording = false;
        }
        self.take = None;
        self.volumes = [self.options.min_db; NUM_CONTROLS + 1];
    }

    pub fn kill_sound(&mut self) {
        if self.voices_started {
            self.voices.stop_all();
            self.voices_started = false;
        }
        self.loop_playing = false;
        self.live_looping = [false; NUM_CONTROLS];
    }

    pub fn update(&mut self, ctrl: &mut Controller) -> Result<()> {
        self.update_sample(ctrl, None)?;
        self.update_synth(ctrl, None)?;
        self.update_record(ctrl);
        self.update_volume_pitch(ctrl);
        Ok(())
    }

    // --- Selection ---

    pub fn select_synth(&mut self, ctrl: &mut Controller, name_or_num: &str) -> Result<()> {
        self.update_synth(ctrl, Some(name_or_num))
    }

    pub fn select_sample(&mut self, ctrl: &mut Controller, name_or_num: &str) -> Result<()> {
        self.update_sample(ctrl, Some(name_or_num))
    }

    /// Follows `transport_register.smp`, or jumps to a sample by number or folder-relative name.
    ///
    /// Unloadable candidates are skipped in the direction the register moved.
    pub fn update_sample(&mut self, ctrl: &mut Controller, name_or_num: Option<&str>) -> Result<()> {
        let mut register = ctrl.state().transport_register.smp;
        if name_or_num.is_none() && self.sample_ind.map(|i| i as i64) == Some(register) {
            return Ok(());
        }
        let candidates = self.library.candidates();
        if candidates.is_empty() {
            if !self.warned_no_samples {
                warn!("No samples found in {}", self.library.folder().display());
                self.warned_no_samples = true;
            }
            return Ok(());
        }
        if let Some(name_or_num) = name_or_num {
            match self.library.find(&candidates, name_or_num) {
                Some(index) => register = index as i64,
                None => {
                    warn!("Missing sample {}", name_or_num);
                    if self.options.exit_on_error {
                        bail!("Missing sample {}", name_or_num);
                    }
                    return Ok(());
                }
            }
        }

        let direction = match self.sample_ind {
            Some(current) if register < current as i64 => -1,
            _ => 1,
        };
        for _ in 0..candidates.len() {
            let (index, _) = resolve(register, candidates.len());
            match self.library.load_candidate(&candidates, index)? {
                Some(loaded) => {
                    info!("Selected sample {}", loaded.display_path);
                    ctrl.edit(|s| s.transport_register.smp = index as i64);
                    self.sample_ind = Some(index);
                    self.sample = Some(loaded);
                    self.synth_ind = None;
                    return Ok(());
                }
                None if name_or_num.is_some() => return Ok(()),
                None => register = index as i64 + direction,
            }
        }
        warn!("No loadable samples in {}", self.library.folder().display());
        ctrl.edit(|s| s.transport_register.smp = register);
        self.sample_ind = Some(resolve(register, candidates.len()).0);
        Ok(())
    }

    /// Follows `marker_register`, or jumps to a synth by number or name.
    pub fn update_synth(&mut self, ctrl: &mut Controller, name_or_num: Option<&str>) -> Result<()> {
        if let Some(name_or_num) = name_or_num {
            match self.instruments.find(name_or_num) {
                Some(index) => ctrl.edit(|s| s.marker_register = index as i64),
                None => {
                    warn!("Missing synth {}", name_or_num);
                    if self.options.exit_on_error {
                        bail!("Missing synth {}", name_or_num);
                    }
                    return Ok(());
                }
            }
        }
        let (synth_ind, _) = resolve(ctrl.state().marker_register, self.instruments.len());
        if self.synth_ind == Some(synth_ind) {
            return Ok(());
        }
        self.synth_ind = Some(synth_ind);
        self.clamp_elongation(ctrl, true);

        let synth = &self.instruments.synths[synth_ind];
        info!("Selected synth {}", synth.name);
        ctrl.toggle_knob_mode(Some(synth.is_sampler()));

        let new_notes = synth.notes.clone();
        let chord_settings = synth.chord_settings();
        let new_chords = chord_settings.map(|c| c.chords.clone());
        let new_drawbars = chord_settings.map(|c| c.drawbars.clone());
        let new_drawbar_notes = chord_settings.map(|c| c.drawbar_notes.clone());

        let notes_changed = self.notes.as_ref() != Some(&new_notes);
        if notes_changed || (new_chords.is_some() && new_chords != self.chords) {
            if notes_changed || self.chords.is_some() {
                ctrl.edit(|s| s.track_register.syn = 0);
            }
            self.notes = Some(new_notes);
            self.chords = new_chords;
        }
        if (new_drawbars.is_some() && new_drawbars != self.drawbars)
            || (new_drawbar_notes.is_some() && new_drawbar_notes != self.drawbar_notes)
        {
            ctrl.edit(|s| s.transport_register.syn = 0);
            self.drawbars = new_drawbars;
            self.drawbar_notes = new_drawbar_notes;
        }

        let register = ctrl.state().track_register.syn;
        for k in 0..NUM_CONTROLS {
            if self.voices_started {
                if !self.live_looping[k] {
                    let waveform = self.build_track(synth_ind, k, ctrl);
                    self.voices.set_waveform(k, waveform);
                }
            } else {
                let waveform = self.build_track(synth_ind, k, ctrl);
                let pitch = self.track_note(register, k) as f64;
                self.voices.start(k, waveform, pitch);
            }
        }
        self.voices_started = true;
        Ok(())
    }

    fn build_track(&self, synth_ind: usize, k: usize, ctrl: &Controller) -> Box<dyn Waveform> {
        let bound = self.instruments.synths[synth_ind].kind().needs_track_binding;
        self.instruments.build(
            synth_ind,
            if bound { k } else { 0 },
            &ctrl.shared(),
            self.sample.as_ref().map(|s| &s.set),
        )
    }

    fn track_note(&self, register: i64, k: usize) -> i32 {
        self.notes.as_ref().map_or(0, |notes| notes.note(register, k))
    }

    // --- Live looping ---

    /// Follows the record and play buttons and the per-track record states.
    ///
    /// Record captures the track mix into a take, continuing the previous one unless stop
    /// was released since. Play loops the take on [`LOOP_TRACK`]; an armed track plays it
    /// at its own pitch. Both are released again when there is nothing recorded.
    pub fn update_record(&mut self, ctrl: &mut Controller) {
        if let Some(take) = self.voices.poll_take() {
            self.awaiting_take = false;
            if std::mem::take(&mut self.discard_take) {
                debug!("Dropping take cut off by reset");
            } else {
                info!("Recorded {} frames", take.len());
                self.take = Some(Arc::new(take)).filter(|t| !t.is_empty());
            }
        }

        let (record, play, armed) = {
            let state = ctrl.state();
            let mut armed = [false; NUM_CONTROLS];
            for (k, on) in armed.iter_mut().enumerate() {
                *on = state.state(StateKind::Record, k);
            }
            (
                state.transport(Transport::Record),
                state.transport(Transport::Play),
                armed,
            )
        };

        if record != self.recording {
            if record {
                let clear = ctrl.edit(|s| std::mem::replace(&mut s.stopped, false));
                let mut buffer = Vec::with_capacity(self.options.max_record_frames);
                if let (false, Some(take)) = (clear, &self.take) {
                    let kept = take.len().min(buffer.capacity());
                    buffer.extend_from_slice(&take[..kept]);
                }
                debug!("Recording from frame {}", buffer.len());
                self.voices.start_recording(buffer);
            } else {
                self.voices.stop_recording();
                self.awaiting_take = true;
            }
            self.recording = record;
        }

        if !self.voices_started {
            return;
        }

        if !play {
            self.loop_playing = false;
        } else if !self.loop_playing {
            match &self.take {
                Some(take) => {
                    self.voices
                        .start(LOOP_TRACK, Box::new(TakeLoop::new(take.clone())), 0.0);
                    self.volumes[LOOP_TRACK] = self.options.min_db;
                    self.loop_playing = true;
                }
                None if self.awaiting_take => {}
                None => ctrl.toggle_transport(Transport::Play),
            }
        }

        for k in 0..NUM_CONTROLS {
            if armed[k] == self.live_looping[k] {
                continue;
            }
            if armed[k] {
                let Some(take) = &self.take else {
                    if !self.awaiting_take {
                        ctrl.stage_state(StateKind::Record, k, false);
                    }
                    continue;
                };
                let waveform = TakeLoop::pitched(take.clone(), self.instruments.sample_rate);
                self.voices.set_waveform(k, Box::new(waveform));
                self.live_looping[k] = true;
            } else if let Some(synth_ind) = self.synth_ind {
                let waveform = self.build_track(synth_ind, k, ctrl);
                self.voices.set_waveform(k, waveform);
                self.live_looping[k] = false;
            }
        }
    }

    /// Sliders set volume and new knob values bend pitch, unless the synth reads its knobs itself.
    pub fn update_volume_pitch(&mut self, ctrl: &Controller) {
        let Some(synth_ind) = self.synth_ind else {
            return;
        };
        let state = ctrl.state();
        let range = self.options.max_db - self.options.min_db;
        for k in 0..NUM_CONTROLS {
            let mut volume = self.options.min_db;
            if !state.is_effective_mute(k) {
                volume += state.get_slider(k) * range;
            }
            if volume != self.volumes[k] {
                self.voices.set_volume(k, volume);
                self.volumes[k] = volume;
            }
        }
        let loop_volume = if self.loop_playing && !state.global_controls.mute_override {
            self.options.max_db
        } else {
            self.options.min_db
        };
        if loop_volume != self.volumes[LOOP_TRACK] {
            self.voices.set_volume(LOOP_TRACK, loop_volume);
            self.volumes[LOOP_TRACK] = loop_volume;
        }

        if self.instruments.synths[synth_ind].kind().skips_external_pitch_control {
            return;
        }
        let register = state.track_register.syn;
        for (&cc, &value) in ctrl.new_controls() {
            if let Some(k) = knob_index(cc) {
                let bend = ControlState::norm_knob(value) * self.options.synth_max_bend_semitones;
                let pitch = self.track_note(register, k) as f64 + bend;
                self.voices.set_pitch(k, pitch);
            }
        }
    }

    // --- Elongation ---

    /// Slice length for the longest loaded sample at the current elongation step.
    ///
    /// Writes the wrapped (or with `no_roll`, saturated) step back into `track_register.smp`.
    fn clamp_elongation(&self, ctrl: &Controller, no_roll: bool) -> Option<i64> {
        let synth_ind = self.synth_ind?;
        let sample = self.sample.as_ref()?;
        let steps = ctrl.state().track_register.smp;
        let (slice_len, new_steps) =
            self.instruments
                .probe_slice(synth_ind, &sample.set, steps, no_roll)?;
        if let Some(new_steps) = new_steps {
            ctrl.edit(|s| s.track_register.smp = new_steps);
        }
        Some(slice_len)
    }

    // --- Display ---

    pub fn synth_display(&self) -> String {
        self.synth_ind.map_or_else(String::new, |i| {
            format!("{}.{}", i + 1, self.instruments.synths[i].name)
        })
    }

    /// The active drawbar registration grouped like the bars, empty for unison.
    pub fn drawbar_display(&self, state: &ControlState) -> String {
        let Some(synth_ind) = self.synth_ind else {
            return String::new();
        };
        let has_drawbars = self.instruments.synths[synth_ind]
            .chord_settings()
            .map_or(false, |c| !c.drawbars.is_empty());
        match (has_drawbars, &self.drawbars, &self.drawbar_notes) {
            (true, Some(drawbars), Some(notes)) if !drawbars.is_empty() => {
                let (i, _) = resolve(state.transport_register.syn, drawbars.len());
                drawbars[i]
                    .as_ref()
                    .map_or_else(String::new, |d| d.display(notes.len()))
            }
            _ => String::new(),
        }
    }

    /// Sample path and slice length, e.g. `kick.wav\nslice=250ms`.
    pub fn sample_display(&self, ctrl: &Controller) -> String {
        let (Some(synth_ind), Some(sample)) = (self.synth_ind, &self.sample) else {
            return String::new();
        };
        let mut display = sample.display_path.clone();
        let Some(settings) = self.instruments.synths[synth_ind].sampler_settings() else {
            return display;
        };
        if let Some(slice_len) = self.clamp_elongation(ctrl, false) {
            let slice_len = slice_len as f64;
            if settings.shows_millis(&sample.set) {
                let millis = slice_len / self.instruments.sample_rate * 1000.0;
                display.push_str(&format!("\nslice={}ms", millis.round()));
            } else {
                let total = sample.set.longest().len().max(1) as f64;
                display.push_str(&format!("\nslice={}%", (slice_len / total * 100.0).round()));
            }
        }
        display
    }

    pub fn second_display(&self, ctrl: &Controller) -> String {
        match self.synth_ind {
            Some(i) if self.instruments.synths[i].is_sampler() => self.sample_display(ctrl),
            Some(_) => self.drawbar_display(&ctrl.state()),
            None => String::new(),
        }
    }

    /// Knob caption: track number for samplers unless autotune is on, else the note (and chord).
    pub fn knob_label(&self, state: &ControlState, k: usize) -> String {
        let Some(synth_ind) = self.synth_ind else {
            return String::new();
        };
        let synth = &self.instruments.synths[synth_ind];
        if synth.kind().displays_track_number && !state.transport(Transport::Set) {
            return format!("{:>2}", k + 1);
        }
        let Some(notes) = &self.notes else {
            return String::new();
        };
        let register = state.track_register.syn;
        match (&self.chords, synth.chord_settings()) {
            (Some(chords), Some(_)) => note_and_chord(register, notes, chords, k).label(),
            _ => note_name(notes.note(register, k)).to_string(),
        }
    }
}

impl Drop for Soundscape {
    fn drop(&mut self) {
        self.kill_sound();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_engine::testing::{RecordingVoices, VoiceEvent};
    use crate::controller::{ControllerOptions, KnobMode};
    use crate::instruments::default_catalogue;
    use crate::midi::testing::LoopbackLink;
    use crate::sample_library::LoaderOptions;
    use crate::settings::AppSettings;
    use crate::surface::{knob_cc, slider_cc};
    use std::path::Path;
    use std::time::Duration;

    fn controller() -> (Controller, LoopbackLink) {
        let link = LoopbackLink::default();
        let options = ControllerOptions {
            blink_delay: Duration::ZERO,
            initial_knob_mode: KnobMode::SynPitch,
            ..ControllerOptions::default()
        };
        (Controller::new(options, Box::new(link.clone())), link)
    }

    fn write_wav(path: &Path, frames: usize) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for i in 0..frames {
            writer.write_sample(((i % 100) as i16 - 50) * 100).unwrap();
        }
        writer.finalize().unwrap();
    }

    fn soundscape(folder: &Path, exit_on_error: bool) -> (Soundscape, RecordingVoices) {
        let settings = AppSettings::default();
        let instruments = default_catalogue(&settings).unwrap();
        let library = SampleLibrary::new(
            folder,
            LoaderOptions {
                sample_rate: 44100,
                stereo_to_mono_tolerance: Some(1e-3),
                exit_on_error,
                num_tracks: NUM_CONTROLS,
            },
        );
        let voices = RecordingVoices::default();
        let options = SoundscapeOptions {
            min_db: settings.min_db,
            max_db: settings.max_db,
            synth_max_bend_semitones: 1.0,
            exit_on_error,
            max_record_frames: 16,
        };
        (
            Soundscape::new(instruments, library, Box::new(voices.clone()), options),
            voices,
        )
    }

    #[test]
    fn first_update_starts_every_voice_on_its_note() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sound, voices) = soundscape(dir.path(), true);
        let (mut ctrl, _) = controller();
        sound.update(&mut ctrl).unwrap();
        let events = voices.take();
        let starts: Vec<&VoiceEvent> = events
            .iter()
            .filter(|e| matches!(e, VoiceEvent::Start(..)))
            .collect();
        assert_eq!(starts.len(), NUM_CONTROLS);
        assert_eq!(starts[0], &VoiceEvent::Start(0, 0.0));
        assert_eq!(starts[1], &VoiceEvent::Start(1, 2.0));
        assert_eq!(sound.synth_display(), "1.sine");
        assert_eq!(sound.knob_label(&ctrl.state(), 2), "E");
    }

    #[test]
    fn marker_change_swaps_waveforms_without_restarting() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sound, voices) = soundscape(dir.path(), true);
        let (mut ctrl, _) = controller();
        sound.update(&mut ctrl).unwrap();
        voices.take();

        ctrl.edit(|s| s.marker_register = 1);
        sound.update(&mut ctrl).unwrap();
        let events = voices.take();
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, VoiceEvent::SetWaveform(_)))
                .count(),
            NUM_CONTROLS
        );
        assert!(!events.iter().any(|e| matches!(e, VoiceEvent::Start(..))));
        assert_eq!(sound.synth_display(), "2.chord");
        assert_eq!(sound.knob_label(&ctrl.state(), 0), "C");
        assert_eq!(sound.knob_label(&ctrl.state(), 1), "Dm");

        // Unchanged marker: nothing to rebuild.
        ctrl.clear_new_controls();
        sound.update(&mut ctrl).unwrap();
        assert!(voices.take().is_empty());
    }

    #[test]
    fn sliders_and_mutes_drive_volume() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sound, voices) = soundscape(dir.path(), true);
        let (mut ctrl, _) = controller();
        sound.update(&mut ctrl).unwrap();
        voices.take();

        ctrl.update_single(slider_cc(3), 127);
        ctrl.update_all();
        sound.update(&mut ctrl).unwrap();
        assert!(voices.take().contains(&VoiceEvent::SetVolume(3, 0.0)));

        ctrl.clear_new_controls();
        ctrl.edit(|s| s.global_controls.mute_override = true);
        sound.update(&mut ctrl).unwrap();
        assert_eq!(voices.take(), vec![VoiceEvent::SetVolume(3, -100.0)]);
    }

    #[test]
    fn knob_motion_bends_around_the_track_note() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sound, voices) = soundscape(dir.path(), true);
        let (mut ctrl, _) = controller();
        sound.update(&mut ctrl).unwrap();
        ctrl.clear_new_controls();
        voices.take();

        ctrl.update_single(knob_cc(1), 0);
        ctrl.update_all();
        sound.update(&mut ctrl).unwrap();
        assert_eq!(voices.take(), vec![VoiceEvent::SetPitch(1, 1.0)]);
    }

    #[test]
    fn sampler_without_samples_is_silent_and_shows_track_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sound, _voices) = soundscape(&dir.path().join("missing"), true);
        let (mut ctrl, _) = controller();
        sound.select_synth(&mut ctrl, "smp:loop").unwrap();
        assert_eq!(ctrl.state().knob_mode, KnobMode::SmpPitch);
        assert_eq!(sound.knob_label(&ctrl.state(), 4), " 5");
        assert_eq!(sound.second_display(&ctrl), "");
    }

    #[test]
    fn sample_selection_skips_broken_files_and_reports_slice() {
        let dir = tempfile::tempdir().unwrap();
        write_wav(&dir.path().join("a.wav"), 44100);
        std::fs::write(dir.path().join("b.wav"), b"not audio").unwrap();
        write_wav(&dir.path().join("c.wav"), 22050);
        let (mut sound, _voices) = soundscape(dir.path(), false);
        let (mut ctrl, _) = controller();
        sound.update(&mut ctrl).unwrap();
        assert_eq!(ctrl.state().transport_register.smp, 0);

        ctrl.edit(|s| s.transport_register.smp = 1);
        sound.update(&mut ctrl).unwrap();
        assert_eq!(ctrl.state().transport_register.smp, 2);

        sound.update_synth(&mut ctrl, Some("smp:loop")).unwrap();
        assert_eq!(sound.second_display(&ctrl), "c.wav\nslice=250ms");
    }

    #[test]
    fn missing_names_fail_only_under_exit_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let (mut strict, _) = soundscape(dir.path(), true);
        let (mut ctrl, _) = controller();
        assert!(strict.select_synth(&mut ctrl, "theremin").is_err());
        assert!(strict.select_sample(&mut ctrl, "1").is_ok());

        let (mut lenient, _) = soundscape(dir.path(), false);
        lenient.update(&mut ctrl).unwrap();
        lenient.update_synth(&mut ctrl, Some("theremin")).unwrap();
        assert_eq!(lenient.synth_display(), "1.sine");
    }

    #[test]
    fn drawbar_display_follows_transport_register() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sound, _) = soundscape(dir.path(), true);
        let (mut ctrl, _) = controller();
        sound.update_synth(&mut ctrl, Some("chord")).unwrap();
        assert_eq!(sound.drawbar_display(&ctrl.state()), "");
        ctrl.edit(|s| s.transport_register.syn = 1);
        assert_eq!(sound.drawbar_display(&ctrl.state()), "00 80808 00");
    }

    #[test]
    fn reset_and_drop_stop_the_voices() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sound, voices) = soundscape(dir.path(), true);
        let (mut ctrl, _) = controller();
        sound.update(&mut ctrl).unwrap();
        sound.reset();
        assert_eq!(voices.take().last(), Some(&VoiceEvent::StopAll));

        sound.update(&mut ctrl).unwrap();
        assert!(voices
            .take()
            .iter()
            .any(|e| matches!(e, VoiceEvent::Start(..))));
        drop(sound);
        assert_eq!(voices.take(), vec![VoiceEvent::StopAll]);
    }

    fn set_transport(ctrl: &Controller, t: Transport, on: bool) {
        ctrl.edit(|s| {
            s.transport.insert(t, on);
        });
    }

    fn arm(ctrl: &Controller, k: usize, on: bool) {
        ctrl.edit(|s| s.states.get_mut(&StateKind::Record).unwrap()[k] = on);
    }

    /// Starts the voices and records one take of `capture`.
    fn recorded(capture: Vec<f32>) -> (Soundscape, RecordingVoices, Controller, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let (mut sound, voices) = soundscape(dir.path(), true);
        let (mut ctrl, _) = controller();
        sound.update(&mut ctrl).unwrap();
        ctrl.clear_new_controls();
        voices.set_capture(capture);
        set_transport(&ctrl, Transport::Record, true);
        sound.update(&mut ctrl).unwrap();
        set_transport(&ctrl, Transport::Record, false);
        sound.update(&mut ctrl).unwrap();
        voices.take();
        (sound, voices, ctrl, dir)
    }

    #[test]
    fn play_loops_the_recorded_take() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sound, voices) = soundscape(dir.path(), true);
        let (mut ctrl, _) = controller();
        sound.update(&mut ctrl).unwrap();
        ctrl.clear_new_controls();
        voices.take();

        voices.set_capture(vec![0.5, -0.5, 0.25]);
        set_transport(&ctrl, Transport::Record, true);
        sound.update(&mut ctrl).unwrap();
        assert_eq!(
            voices.take(),
            vec![VoiceEvent::StartRecording { len: 0, capacity: 16 }]
        );
        assert!(!ctrl.state().stopped);

        set_transport(&ctrl, Transport::Record, false);
        sound.update(&mut ctrl).unwrap();
        assert_eq!(voices.take(), vec![VoiceEvent::StopRecording]);

        set_transport(&ctrl, Transport::Play, true);
        sound.update(&mut ctrl).unwrap();
        assert_eq!(
            voices.take(),
            vec![
                VoiceEvent::Start(LOOP_TRACK, 0.0),
                VoiceEvent::SetVolume(LOOP_TRACK, 0.0)
            ]
        );
        assert_eq!(
            voices.render(LOOP_TRACK, &[0.0; 5]),
            vec![0.5, -0.5, 0.25, 0.5, -0.5]
        );

        set_transport(&ctrl, Transport::Play, false);
        sound.update(&mut ctrl).unwrap();
        assert_eq!(voices.take(), vec![VoiceEvent::SetVolume(LOOP_TRACK, -100.0)]);
    }

    #[test]
    fn recording_continues_the_take_until_stop_is_released() {
        let (mut sound, voices, mut ctrl, _dir) = recorded(vec![0.5; 3]);

        set_transport(&ctrl, Transport::Record, true);
        sound.update(&mut ctrl).unwrap();
        assert_eq!(
            voices.take(),
            vec![VoiceEvent::StartRecording { len: 3, capacity: 16 }]
        );
        set_transport(&ctrl, Transport::Record, false);
        sound.update(&mut ctrl).unwrap();

        ctrl.tap_transport(Transport::Stop);
        ctrl.update_all();
        assert!(ctrl.state().stopped);
        ctrl.clear_new_controls();
        voices.take();
        set_transport(&ctrl, Transport::Record, true);
        sound.update(&mut ctrl).unwrap();
        assert_eq!(
            voices.take(),
            vec![VoiceEvent::StartRecording { len: 0, capacity: 16 }]
        );
    }

    #[test]
    fn armed_track_plays_the_take_instead_of_the_synth() {
        let (mut sound, voices, mut ctrl, _dir) = recorded(vec![0.5, 0.25]);

        arm(&ctrl, 2, true);
        sound.update(&mut ctrl).unwrap();
        assert_eq!(voices.take(), vec![VoiceEvent::SetWaveform(2)]);
        assert_eq!(voices.render(2, &[0.0]), vec![0.5]);

        // A new synth leaves the armed track alone.
        ctrl.edit(|s| s.marker_register = 3);
        sound.update(&mut ctrl).unwrap();
        let swapped: Vec<VoiceEvent> = voices
            .take()
            .into_iter()
            .filter(|e| matches!(e, VoiceEvent::SetWaveform(_)))
            .collect();
        assert_eq!(swapped.len(), NUM_CONTROLS - 1);
        assert!(!swapped.contains(&VoiceEvent::SetWaveform(2)));

        arm(&ctrl, 2, false);
        ctrl.clear_new_controls();
        sound.update(&mut ctrl).unwrap();
        assert_eq!(voices.take(), vec![VoiceEvent::SetWaveform(2)]);
    }

    #[test]
    fn nothing_recorded_releases_play_and_arming() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sound, voices) = soundscape(dir.path(), true);
        let (mut ctrl, _) = controller();
        sound.update(&mut ctrl).unwrap();
        ctrl.clear_new_controls();
        voices.take();

        set_transport(&ctrl, Transport::Play, true);
        arm(&ctrl, 1, true);
        sound.update(&mut ctrl).unwrap();
        assert!(voices.take().is_empty());

        ctrl.update_all();
        assert!(!ctrl.state().transport(Transport::Play));
        assert!(!ctrl.state().state(StateKind::Record, 1));
    }

    #[test]
    fn reset_drops_the_take_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let (mut sound, voices) = soundscape(dir.path(), true);
        let (mut ctrl, _) = controller();
        sound.update(&mut ctrl).unwrap();
        voices.set_capture(vec![0.5; 4]);
        set_transport(&ctrl, Transport::Record, true);
        sound.update(&mut ctrl).unwrap();
        voices.take();

        sound.reset();
        assert_eq!(
            voices.take(),
            vec![VoiceEvent::StopAll, VoiceEvent::StopRecording]
        );
        set_transport(&ctrl, Transport::Record, false);
        set_transport(&ctrl, Transport::Play, true);
        ctrl.clear_new_controls();
        sound.update(&mut ctrl).unwrap();
        assert!(!voices
            .take()
            .iter()
            .any(|e| matches!(e, VoiceEvent::Start(LOOP_TRACK, _))));
    }
}
