use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::vision::types::Observation;

/// Compact identity of an observation: URL hash plus a perceptual hash of
/// the screenshot. Only this survives between iterations; the observation
/// itself is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fingerprint {
    pub url_hash: u64,
    pub screenshot_hash: u64,
}

impl Fingerprint {
    pub fn of(obs: &Observation) -> Self {
        Self {
            url_hash: hash_str(&obs.url),
            screenshot_hash: screenshot_hash(&obs.screenshot),
        }
    }
}

/// Did the last action move the page, without any semantic understanding?
/// `Progressed`: the URL changed — navigation happened. `Changed`: the page
/// redrew without navigating (ambiguous: could be a hover state, could be a
/// dropdown). `Stalled`: nothing moved at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Progressed,
    Changed,
    Stalled,
}

impl Progress {
    /// Pure function of the two fingerprints; the caller owns the previous
    /// value. With no previous fingerprint there is nothing to stall
    /// against.
    pub fn classify(previous: Option<&Fingerprint>, current: &Fingerprint) -> Progress {
        match previous {
            None => Progress::Progressed,
            Some(prev) if prev.url_hash != current.url_hash => Progress::Progressed,
            Some(prev) if prev.screenshot_hash != current.screenshot_hash => Progress::Changed,
            Some(_) => Progress::Stalled,
        }
    }
}

fn hash_str(s: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    s.hash(&mut hasher);
    hasher.finish()
}

/// Perceptual 8×8 average hash of the screenshot, so byte-level encoder
/// noise between visually identical captures does not read as change.
/// Bytes that fail to decode as an image fall back to a sampled byte hash.
fn screenshot_hash(png: &[u8]) -> u64 {
    match image::load_from_memory(png) {
        Ok(img) => average_hash(&img),
        Err(_) => sampled_byte_hash(png),
    }
}

fn average_hash(img: &image::DynamicImage) -> u64 {
    let small = image::imageops::resize(
        &img.to_luma8(),
        8,
        8,
        image::imageops::FilterType::Triangle,
    );
    let sum: u64 = small.pixels().map(|p| p.0[0] as u64).sum();
    let avg = sum / 64;
    let mut bits = 0u64;
    for (i, p) in small.pixels().enumerate() {
        if p.0[0] as u64 >= avg {
            bits |= 1 << i;
        }
    }
    bits
}

fn sampled_byte_hash(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    let step = (bytes.len() / 1000).max(1);
    for i in (0..bytes.len()).step_by(step) {
        bytes[i].hash(&mut hasher);
    }
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn obs(url: &str, screenshot: &[u8]) -> Observation {
        Observation {
            url: url.into(),
            title: String::new(),
            screenshot: screenshot.to_vec(),
            captured_at: Utc::now(),
        }
    }

    fn png(pattern: fn(u32, u32) -> u8) -> Vec<u8> {
        let img = image::GrayImage::from_fn(32, 32, |x, y| image::Luma([pattern(x, y)]));
        let mut out = Vec::new();
        image::DynamicImage::ImageLuma8(img)
            .write_to(
                &mut std::io::Cursor::new(&mut out),
                image::ImageFormat::Png,
            )
            .unwrap();
        out
    }

    #[test]
    fn identical_observations_stall() {
        let shot = png(|x, y| ((x + y) % 2 * 255) as u8);
        let a = Fingerprint::of(&obs("https://github.com", &shot));
        let b = Fingerprint::of(&obs("https://github.com", &shot));
        assert_eq!(Progress::classify(Some(&a), &b), Progress::Stalled);
    }

    #[test]
    fn url_change_progresses() {
        let shot = png(|x, _| if x < 16 { 0 } else { 255 });
        let a = Fingerprint::of(&obs("https://github.com", &shot));
        let b = Fingerprint::of(&obs("https://github.com/search?q=x", &shot));
        assert_eq!(Progress::classify(Some(&a), &b), Progress::Progressed);
    }

    #[test]
    fn screenshot_only_change_is_ambiguous() {
        // Same URL, structurally different page: left-half dark vs top-half dark.
        let a = Fingerprint::of(&obs("https://github.com", &png(|x, _| if x < 16 { 0 } else { 255 })));
        let b = Fingerprint::of(&obs("https://github.com", &png(|_, y| if y < 16 { 0 } else { 255 })));
        assert_eq!(Progress::classify(Some(&a), &b), Progress::Changed);
    }

    #[test]
    fn first_observation_counts_as_progress() {
        let fp = Fingerprint::of(&obs("https://github.com", b"not a png"));
        assert_eq!(Progress::classify(None, &fp), Progress::Progressed);
    }

    #[test]
    fn undecodable_bytes_still_fingerprint_deterministically() {
        let a = Fingerprint::of(&obs("u", b"raw bytes AAAA"));
        let b = Fingerprint::of(&obs("u", b"raw bytes AAAA"));
        let c = Fingerprint::of(&obs("u", b"raw bytes BBBB"));
        assert_eq!(a, b);
        assert_ne!(a.screenshot_hash, c.screenshot_hash);
    }
}
