//! Sample layout and rate conversion between callers and device-native formats.

/// Average interleaved channels down to mono.
pub fn downmix_to_mono(interleaved: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Duplicate a mono signal into every channel.
pub fn upmix_mono(mono: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return mono.to_vec();
    }
    let mut out = Vec::with_capacity(mono.len() * channels);
    for &sample in mono {
        out.extend(std::iter::repeat_n(sample, channels));
    }
    out
}

/// Linear-interpolation resampler for mono audio.
pub fn resample(input: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || input.is_empty() || from_rate == 0 || to_rate == 0 {
        return input.to_vec();
    }

    let ratio = f64::from(from_rate) / f64::from(to_rate);
    let out_len = ((input.len() as f64) / ratio).round() as usize;
    let last = input.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos as usize).min(last);
            let frac = pos - idx as f64;
            let a = f64::from(input[idx]);
            let b = f64::from(input[(idx + 1).min(last)]);
            (a + (b - a) * frac).round() as i16
        })
        .collect()
}

/// Turn caller-supplied mono samples at `rate` into the interleaved layout
/// the output device expects.
pub fn prepare_playback(mono: &[i16], rate: u32, device_rate: u32, device_channels: u16) -> Vec<i16> {
    let resampled = resample(mono, rate, device_rate);
    upmix_mono(&resampled, usize::from(device_channels))
}
