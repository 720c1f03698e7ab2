// FILE: src\audio_engine\command.rs
// ==================================

use crate::synth::Waveform;

/// Messages from the control loop to the audio thread.
pub enum AudioCommand {
    /// Restarts the voice of a track, fading in from silence.
    StartVoice {
        track: usize,
        waveform: Box<dyn Waveform>,
        pitch: f64,
    },
    SetWaveform {
        track: usize,
        waveform: Box<dyn Waveform>,
    },
    /// Target pitch in semitones relative to middle C.
    SetPitch { track: usize, semitones: f64 },
    /// Target volume in dB.
    SetVolume { track: usize, db: f64 },
    /// Appends the track mix to `buffer` until its capacity is used up.
    StartRecording { buffer: Vec<f32> },
    StopRecording,
    StopAll,
}

/// Messages from the audio thread back to the control loop.
pub enum EngineEvent {
    /// A generator replaced or stopped on the audio thread, freed by the receiver.
    Retired(Box<dyn Waveform>),
    /// A finished recording.
    Take(Vec<f32>),
}

impl std::fmt::Debug for AudioCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AudioCommand::StartVoice { track, pitch, .. } => f
                .debug_struct("StartVoice")
                .field("track", track)
                .field("pitch", pitch)
                .finish_non_exhaustive(),
            AudioCommand::SetWaveform { track, .. } => f
                .debug_struct("SetWaveform")
                .field("track", track)
                .finish_non_exhaustive(),
            AudioCommand::SetPitch { track, semitones } => f
                .debug_struct("SetPitch")
                .field("track", track)
                .field("semitones", semitones)
                .finish(),
            AudioCommand::SetVolume { track, db } => f
                .debug_struct("SetVolume")
                .field("track", track)
                .field("db", db)
                .finish(),
            AudioCommand::StartRecording { buffer } => f
                .debug_struct("StartRecording")
                .field("len", &buffer.len())
                .field("capacity", &buffer.capacity())
                .finish(),
            AudioCommand::StopRecording => write!(f, "StopRecording"),
            AudioCommand::StopAll => write!(f, "StopAll"),
        }
    }
}

impl std::fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::Retired(_) => write!(f, "Retired"),
            EngineEvent::Take(take) => f.debug_tuple("Take").field(&take.len()).finish(),
        }
    }
}
