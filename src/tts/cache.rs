// TTS artifact cache (C7): content-addressed storage for raw PCM produced by
// the TTS engine. Keyed on normalized text so repeated phrases (greetings,
// fallback apologies) never re-hit the engine.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use md5::{Digest, Md5};

const MAX_KEY_LEN: usize = 200;
const TRUNCATE_LEN: usize = 150;

/// Lowercases and strips everything but alphanumerics, then truncates long
/// text to a fixed prefix plus an 8-hex-digit hash of the full normalized
/// text, so two long phrases sharing a 150-char prefix never collide.
pub fn cache_key(text: &str) -> String {
    let normalized: String = text
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if normalized.len() <= MAX_KEY_LEN {
        return normalized;
    }

    let mut hasher = Md5::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let hash8 = digest.iter().take(4).map(|b| format!("{b:02x}")).collect::<String>();

    format!("{}{}", &normalized[..TRUNCATE_LEN], hash8)
}

pub fn artifact_path(root: &Path, audio_format: &str, voice: &str, text: &str) -> PathBuf {
    root.join(audio_format).join(voice).join(format!("{}.raw", cache_key(text)))
}

/// Returns `Some(pcm_bytes)` if the artifact is already cached.
pub fn lookup(root: &Path, audio_format: &str, voice: &str, text: &str) -> Option<Vec<u8>> {
    let path = artifact_path(root, audio_format, voice, text);
    fs::read(path).ok()
}

/// Writes a freshly synthesized artifact. Artifacts are immutable once
/// written, so a plain write (no temp-file dance) is sufficient: a partial
/// write from a crash mid-synthesis simply means the next `lookup` misses
/// and re-synthesizes.
pub fn store(root: &Path, audio_format: &str, voice: &str, text: &str, pcm: &[u8]) -> io::Result<()> {
    let path = artifact_path(root, audio_format, voice, text);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, pcm)
}
