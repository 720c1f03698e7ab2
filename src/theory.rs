// src/theory.rs

use anyhow::{bail, Result};
use std::collections::BTreeSet;

pub const BINS_PER_OCTAVE: i32 = 12;

pub const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Splits a signed register into a table index and the number of whole wraps.
/// Every register dereference goes through here.
pub fn resolve(register: i64, len: usize) -> (usize, i64) {
    let len = len.max(1) as i64;
    (register.rem_euclid(len) as usize, register.div_euclid(len))
}

pub fn note_name(note: i32) -> &'static str {
    NOTE_NAMES[note.rem_euclid(BINS_PER_OCTAVE) as usize]
}

/// The two scales of the default note table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scale {
    Major,
    NaturalMinor,
}

impl Scale {
    pub const ALL: [Scale; 2] = [Scale::Major, Scale::NaturalMinor];

    /// Eight degrees, octave included, so every track gets a note.
    pub fn get_intervals(&self) -> [i32; 8] {
        match self {
            Scale::Major => [0, 2, 4, 5, 7, 9, 11, 12],
            Scale::NaturalMinor => [0, 2, 3, 5, 7, 8, 10, 12],
        }
    }

    /// Diatonic chord on each degree.
    pub fn get_chords(&self) -> [ChordQuality; 7] {
        use ChordQuality::*;
        match self {
            Scale::Major => [Major, Minor, Minor, Major, Dominant, Minor, Diminished],
            Scale::NaturalMinor => [Minor, Diminished, Major, Minor, Minor, Major, Dominant],
        }
    }
}

impl std::fmt::Display for Scale {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Scale::Major => "Major",
            Scale::NaturalMinor => "Minor (Aeolian)",
        };
        write!(f, "{}", name)
    }
}

/// Seventh-chord qualities; the fourth note is dropped unless sevenths are requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChordQuality {
    Major,
    Minor,
    Dominant,
    Diminished,
    Augmented,
}

impl ChordQuality {
    /// Recognition order; `Major` must precede `Dominant` since both trim to the same triad.
    const RECOGNIZABLE: [ChordQuality; 5] = [
        ChordQuality::Major,
        ChordQuality::Minor,
        ChordQuality::Dominant,
        ChordQuality::Diminished,
        ChordQuality::Augmented,
    ];

    pub fn get_intervals(&self) -> [i32; 4] {
        match self {
            ChordQuality::Major => [0, 4, 7, 11],
            ChordQuality::Minor => [0, 3, 7, 10],
            ChordQuality::Dominant => [0, 4, 7, 10],
            ChordQuality::Diminished => [0, 3, 6, 9],
            ChordQuality::Augmented => [0, 4, 8, 10],
        }
    }

    /// Label suffix: major and dominant print bare, augmented as `+`.
    pub fn symbol(&self) -> &'static str {
        match self {
            ChordQuality::Major | ChordQuality::Dominant => "",
            ChordQuality::Minor => "m",
            ChordQuality::Diminished => "o",
            ChordQuality::Augmented => "+",
        }
    }

    pub fn voiced(&self, voicing: Voicing) -> Vec<i32> {
        let root = self.get_intervals().to_vec();
        match voicing {
            Voicing::Root => root,
            Voicing::Inversion(i) => invert(&root, i),
            Voicing::Add8 => std::iter::once(root[0]).chain(invert(&root, 1)).collect(),
            Voicing::Add8No3Add10 => std::iter::once(root[0]).chain(invert(&root, 2)).collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Voicing {
    Root,
    /// Rotates the lowest `n` notes (1..=3) up an octave.
    Inversion(usize),
    Add8,
    Add8No3Add10,
}

fn invert(chord: &[i32], n: usize) -> Vec<i32> {
    let n = n.min(chord.len());
    chord[n..]
        .iter()
        .copied()
        .chain(chord[..n].iter().map(|note| note + BINS_PER_OCTAVE))
        .collect()
}

/// Drops sevenths (pitch classes 9, 10, 11) unless `seventh` is set.
pub fn trim_chord(chord: &[i32], seventh: bool) -> Vec<i32> {
    chord
        .iter()
        .copied()
        .filter(|n| seventh || n.rem_euclid(BINS_PER_OCTAVE) <= 8)
        .collect()
}

/// Folds the trimmed chord into close position above its (untrimmed) bass.
pub fn norm_chord(chord: &[i32], seventh: bool) -> Vec<i32> {
    let Some(&bass) = chord.iter().min() else {
        return Vec::new();
    };
    let notes: BTreeSet<i32> = trim_chord(chord, seventh)
        .iter()
        .map(|n| bass + (n - bass).rem_euclid(BINS_PER_OCTAVE))
        .collect();
    notes.into_iter().collect()
}

/// Maps a chord back to its quality by trying every inversion.
pub fn recognize_chord(chord: &[i32]) -> Option<ChordQuality> {
    let normed = norm_chord(chord, false);
    for quality in ChordQuality::RECOGNIZABLE {
        for voicing in [
            Voicing::Root,
            Voicing::Inversion(1),
            Voicing::Inversion(2),
            Voicing::Inversion(3),
        ] {
            if norm_chord(&quality.voiced(voicing), false) == normed {
                return Some(quality);
            }
        }
    }
    None
}

/// Scale-quality rows, each with one note per track.
#[derive(Clone, Debug, PartialEq)]
pub struct NoteTable(Vec<Vec<i32>>);

impl NoteTable {
    pub fn new(rows: Vec<Vec<i32>>, num_tracks: usize) -> Result<Self> {
        if rows.is_empty() {
            bail!("Note table has no scale rows");
        }
        if let Some(row) = rows.iter().find(|row| row.len() < num_tracks) {
            bail!("Note row {:?} has fewer than {} notes", row, num_tracks);
        }
        Ok(Self(rows))
    }

    pub fn from_scales(scales: &[Scale], num_tracks: usize) -> Result<Self> {
        Self::new(
            scales.iter().map(|s| s.get_intervals().to_vec()).collect(),
            num_tracks,
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Note of track `k`, transposed one semitone per full wrap of the register.
    pub fn note(&self, register: i64, k: usize) -> i32 {
        let (quality, offset) = resolve(register, self.len());
        let row = &self.0[quality];
        row[k % row.len()] + offset as i32
    }
}

/// Scale-quality rows, each with one chord per track (cycled when shorter).
#[derive(Clone, Debug, PartialEq)]
pub struct ChordTable(Vec<Vec<Vec<i32>>>);

impl ChordTable {
    pub fn new(rows: Vec<Vec<Vec<i32>>>) -> Result<Self> {
        if rows.is_empty() || rows.iter().any(|row| row.is_empty()) {
            bail!("Chord table needs at least one chord per scale row");
        }
        Ok(Self(rows))
    }

    pub fn from_scales(scales: &[Scale]) -> Result<Self> {
        Self::new(
            scales
                .iter()
                .map(|s| {
                    s.get_chords()
                        .iter()
                        .map(|q| q.get_intervals().to_vec())
                        .collect()
                })
                .collect(),
        )
    }

    /// Fails unless the note rows divide evenly into the chord rows.
    pub fn check_against(&self, notes: &NoteTable) -> Result<()> {
        if notes.len() < self.len() || notes.len() % self.len() != 0 {
            bail!(
                "{} note rows cannot be paired with {} chord rows",
                notes.len(),
                self.len()
            );
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn rows(&self) -> &[Vec<Vec<i32>>] {
        &self.0
    }

    pub fn chord(&self, quality: usize, k: usize) -> &[i32] {
        let row = &self.0[quality % self.len()];
        &row[k % row.len()]
    }
}

/// What a knob label shows for a chord synth.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NoteAndChord {
    pub note: i32,
    pub quality: &'static str,
    pub bass: Option<i32>,
}

impl NoteAndChord {
    pub fn label(&self) -> String {
        let mut label = format!("{}{}", note_name(self.note), self.quality);
        if let Some(bass) = self.bass {
            label.push('/');
            label.push_str(note_name(bass));
        }
        label
    }
}

/// Note of track `k` plus its chord's quality; inverted chords get a slash bass and
/// the root moves up an octave.
pub fn note_and_chord(register: i64, notes: &NoteTable, chords: &ChordTable, k: usize) -> NoteAndChord {
    let mut note = notes.note(register, k);
    let (quality_index, _) = resolve(register, notes.len());
    let chord = chords.chord(quality_index, k);
    let quality = recognize_chord(chord).map_or("*", |q| q.symbol());
    let normed = norm_chord(chord, false);
    let mut bass = None;
    if let Some(&lowest) = normed.first() {
        if lowest != 0 {
            bass = Some(note + lowest);
            note += BINS_PER_OCTAVE;
        }
    }
    NoteAndChord {
        note,
        quality,
        bass,
    }
}
