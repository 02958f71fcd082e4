use std::f64::consts::PI;

const BEEP_HZ: f64 = 1000.0;
const BEEP_SECS: f64 = 0.2;
const GAP_SECS: f64 = 0.1;
const BEEP_COUNT: usize = 3;

/// Three 1 kHz beeps at half scale separated by short silences, for
/// checking the speaker path by ear.
pub fn calibration_beeps(sample_rate: u32) -> Vec<i16> {
    let tone_len = (f64::from(sample_rate) * BEEP_SECS) as usize;
    let gap_len = (f64::from(sample_rate) * GAP_SECS) as usize;

    let tone: Vec<i16> = (0..tone_len)
        .map(|n| {
            let t = n as f64 / f64::from(sample_rate);
            ((2.0 * PI * BEEP_HZ * t).sin() * 0.5 * 32767.0) as i16
        })
        .collect();

    let mut out = Vec::with_capacity(tone_len * BEEP_COUNT + gap_len * (BEEP_COUNT - 1));
    for i in 0..BEEP_COUNT {
        if i > 0 {
            out.resize(out.len() + gap_len, 0);
        }
        out.extend_from_slice(&tone);
    }
    out
}
