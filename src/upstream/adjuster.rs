//! Bitrate reduction applied when the transport is overloaded.

use super::properties::SourceProperties;
use super::MIN_AUDIO_KBIT;

/// Reduced `(audio, video)` bitrates for an overloaded transport.
///
/// Audio is reduced to 8/10 of its current value unless already at or
/// below the floor, in which case it stays unchanged. Video gets 8/10 of
/// whatever the measured average leaves after the audio share.
pub fn reduced_bitrates(props: &SourceProperties, bitrate_avg: u32) -> (u32, u32) {
    let new_audio = if props.audio_bitrate > MIN_AUDIO_KBIT {
        props.audio_bitrate * 8 / 10
    } else {
        props.audio_bitrate
    };
    let new_video = bitrate_avg.saturating_sub(new_audio) * 8 / 10;
    (new_audio, new_video)
}
