//! Automatic gain control.
//!
//! Envelope follower that pulls frame RMS toward a target level mapped
//! from the user-facing 0..=100 setting. Fast attack when the signal is
//! too hot, slow release when quiet, so speech onsets do not clip and
//! the floor does not pump.

const TARGET_MIN: f32 = 0.01;
const TARGET_MAX: f32 = 0.50;

const GAIN_MIN: f32 = 0.1;
const GAIN_MAX: f32 = 10.0;

const ATTACK: f32 = 0.80;
const RELEASE: f32 = 0.02;

/// Frames quieter than this leave the gain untouched.
const SILENCE_RMS: f32 = 0.001;

/// Map the 0..=100 config setting onto a linear target RMS.
pub fn map_target(setting: f32) -> f32 {
    let t = (setting / 100.0).clamp(0.0, 1.0);
    TARGET_MIN + t * (TARGET_MAX - TARGET_MIN)
}

pub struct Agc {
    target_rms: f32,
    gain: f32,
}

impl Agc {
    /// `setting` is the user-facing 0..=100 target level.
    pub fn new(setting: f32) -> Self {
        Self {
            target_rms: map_target(setting),
            gain: 1.0,
        }
    }

    pub fn set_target(&mut self, setting: f32) {
        self.target_rms = map_target(setting);
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Apply gain to one frame in place. Samples are clamped to [-1, 1].
    pub fn process(&mut self, frame: &mut [f32]) {
        let rms = crate::vad::frame_rms(frame);
        if rms >= SILENCE_RMS {
            let desired = (self.target_rms / rms).clamp(GAIN_MIN, GAIN_MAX);
            let coeff = if desired < self.gain { ATTACK } else { RELEASE };
            self.gain += coeff * (desired - self.gain);
            self.gain = self.gain.clamp(GAIN_MIN, GAIN_MAX);
        }
        for s in frame.iter_mut() {
            *s = (*s * self.gain).clamp(-1.0, 1.0);
        }
    }
}
