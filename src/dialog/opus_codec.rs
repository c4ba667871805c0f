// PCM <-> Opus transcoding shared by the Dialog Dispatcher (per-chunk POST
// body) and the optional audio archive sink.
//
// Encodes as a sequence of length-prefixed Opus frames rather than a full
// Ogg container: the dialog and TTS engines on the other end of these HTTP
// contracts are paired with this same gateway software, so a minimal
// self-describing frame stream is sufficient and avoids pulling in a
// separate Ogg-muxing dependency nothing else in this domain needs.

use opus::{Application, Channels, Decoder, Encoder};

const OPUS_FRAME_MS: u32 = 20;
const BITRATE_BPS: i32 = 24_000;

fn frame_samples(sample_rate: u32) -> usize {
    (sample_rate as u64 * OPUS_FRAME_MS as u64 / 1000) as usize
}

pub fn encode(pcm: &[i16], sample_rate: u32) -> Result<Vec<u8>, String> {
    let mut encoder = Encoder::new(sample_rate, Channels::Mono, Application::Voip)
        .map_err(|e| format!("opus encoder init: {e}"))?;
    encoder
        .set_bitrate(opus::Bitrate::Bits(BITRATE_BPS))
        .map_err(|e| format!("opus set_bitrate: {e}"))?;
    encoder
        .set_vbr(true)
        .map_err(|e| format!("opus set_vbr: {e}"))?;

    let frame_len = frame_samples(sample_rate);
    let mut out = Vec::new();
    let mut scratch = vec![0u8; 4000];

    for frame in pcm.chunks(frame_len) {
        let padded;
        let input: &[i16] = if frame.len() == frame_len {
            frame
        } else {
            let mut buf = frame.to_vec();
            buf.resize(frame_len, 0);
            padded = buf;
            &padded
        };
        let n = encoder
            .encode(input, &mut scratch)
            .map_err(|e| format!("opus encode: {e}"))?;
        out.extend_from_slice(&(n as u32).to_le_bytes());
        out.extend_from_slice(&scratch[..n]);
    }
    Ok(out)
}

pub fn decode(opus_bytes: &[u8], sample_rate: u32) -> Result<Vec<i16>, String> {
    let mut decoder =
        Decoder::new(sample_rate, Channels::Mono).map_err(|e| format!("opus decoder init: {e}"))?;
    let frame_len = frame_samples(sample_rate);
    let mut out = Vec::new();
    let mut pcm_scratch = vec![0i16; frame_len * 2];

    let mut cursor = 0usize;
    while cursor + 4 <= opus_bytes.len() {
        let len = u32::from_le_bytes(opus_bytes[cursor..cursor + 4].try_into().unwrap()) as usize;
        cursor += 4;
        if cursor + len > opus_bytes.len() {
            return Err("truncated opus frame stream".to_string());
        }
        let frame = &opus_bytes[cursor..cursor + len];
        cursor += len;
        let n = decoder
            .decode(frame, &mut pcm_scratch, false)
            .map_err(|e| format!("opus decode: {e}"))?;
        out.extend_from_slice(&pcm_scratch[..n]);
    }
    Ok(out)
}
