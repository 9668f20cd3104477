pub mod bmp;
pub mod gif;
pub mod jpeg;
pub mod png;
pub mod webp;

use crate::types::ImageFormat;
use aho_corasick::AhoCorasick;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

/// A structural problem the repair engine knows how to fix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Defect {
    TruncatedTail { keep: usize, seal: &'static [u8] },
    MissingTerminator { seal: &'static [u8] },
    TrailingData { end: usize },
    HuffmanOversubscribed { offset: usize, symbols: usize },
    HuffmanUndersubscribed { offset: usize, symbols: usize },
    LengthFieldMismatch { offset: usize, declared: u32, actual: u32 },
    ChunkCrcMismatch { offset: usize, computed: u32 },
    ShortPixelData { missing: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DefectKind {
    TruncatedTail,
    MissingTerminator,
    TrailingData,
    HuffmanOversubscribed,
    HuffmanUndersubscribed,
    LengthFieldMismatch,
    ChunkCrcMismatch,
    ShortPixelData,
}

impl DefectKind {
    pub const ALL: [DefectKind; 8] = [
        DefectKind::TruncatedTail,
        DefectKind::MissingTerminator,
        DefectKind::TrailingData,
        DefectKind::HuffmanOversubscribed,
        DefectKind::HuffmanUndersubscribed,
        DefectKind::LengthFieldMismatch,
        DefectKind::ChunkCrcMismatch,
        DefectKind::ShortPixelData,
    ];
}

impl Defect {
    pub fn kind(&self) -> DefectKind {
        match self {
            Defect::TruncatedTail { .. } => DefectKind::TruncatedTail,
            Defect::MissingTerminator { .. } => DefectKind::MissingTerminator,
            Defect::TrailingData { .. } => DefectKind::TrailingData,
            Defect::HuffmanOversubscribed { .. } => DefectKind::HuffmanOversubscribed,
            Defect::HuffmanUndersubscribed { .. } => DefectKind::HuffmanUndersubscribed,
            Defect::LengthFieldMismatch { .. } => DefectKind::LengthFieldMismatch,
            Defect::ChunkCrcMismatch { .. } => DefectKind::ChunkCrcMismatch,
            Defect::ShortPixelData { .. } => DefectKind::ShortPixelData,
        }
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Defect::TruncatedTail { keep, .. } => {
                write!(f, "stream truncated after byte {keep}")
            }
            Defect::MissingTerminator { .. } => f.write_str("terminal marker missing"),
            Defect::TrailingData { end } => write!(f, "trailing bytes after offset {end}"),
            Defect::HuffmanOversubscribed { offset, symbols } => write!(
                f,
                "Huffman code error: over-subscribed table at {offset} ({symbols} symbols)"
            ),
            Defect::HuffmanUndersubscribed { offset, symbols } => write!(
                f,
                "Huffman code error: under-subscribed table at {offset} ({symbols} symbols)"
            ),
            Defect::LengthFieldMismatch {
                offset,
                declared,
                actual,
            } => write!(
                f,
                "length field at {offset} declares {declared}, actual {actual}"
            ),
            Defect::ChunkCrcMismatch { offset, .. } => write!(f, "chunk CRC mismatch at {offset}"),
            Defect::ShortPixelData { missing } => {
                write!(f, "pixel data short by {missing} bytes")
            }
        }
    }
}

/// Outcome of a format-specific structural walk.
#[derive(Debug, Clone, Default)]
pub struct Structure {
    pub defects: Vec<Defect>,
    pub fatal: Option<String>,
    pub checks_passed: u32,
    pub checks_total: u32,
    pub dimensions: Option<(u32, u32)>,
}

impl Structure {
    pub(crate) fn new(checks_total: u32) -> Self {
        Self {
            checks_total,
            ..Self::default()
        }
    }

    pub(crate) fn check(&mut self, ok: bool) -> bool {
        if ok {
            self.checks_passed += 1;
        }
        ok
    }

    pub(crate) fn fail(mut self, reason: impl Into<String>) -> Self {
        self.fatal = Some(reason.into());
        self
    }

    pub fn confidence(&self) -> f32 {
        if self.checks_total == 0 {
            return 0.0;
        }
        (self.checks_passed as f32 / self.checks_total as f32).clamp(0.0, 1.0)
    }

    pub fn is_sound(&self) -> bool {
        self.fatal.is_none() && self.defects.is_empty()
    }
}

pub fn sniff(data: &[u8]) -> Option<ImageFormat> {
    if data.starts_with(&png::PNG_SIGNATURE) {
        return Some(ImageFormat::Png);
    }
    if data.starts_with(&jpeg::JPEG_MAGIC) {
        return Some(ImageFormat::Jpeg);
    }
    if data.starts_with(gif::GIF87A) || data.starts_with(gif::GIF89A) {
        return Some(ImageFormat::Gif);
    }
    if webp::has_riff_webp_header(data) {
        return Some(ImageFormat::Webp);
    }
    if bmp::has_plausible_header(data) {
        return Some(ImageFormat::Bmp);
    }
    None
}

pub fn inspect(format: ImageFormat, data: &[u8]) -> Structure {
    match format {
        ImageFormat::Png => png::inspect(data),
        ImageFormat::Jpeg => jpeg::inspect(data),
        ImageFormat::Gif => gif::inspect(data),
        ImageFormat::Bmp => bmp::inspect(data),
        ImageFormat::Webp => webp::inspect(data),
    }
}

/// Length of the image that starts at `data[0]`, when the format lets us
/// find its end without trusting anything past it.
pub fn carve_end(format: ImageFormat, data: &[u8]) -> Option<usize> {
    match format {
        ImageFormat::Png => png::stream_end(data),
        ImageFormat::Jpeg => jpeg::stream_end(data),
        ImageFormat::Gif => gif::stream_end(data),
        ImageFormat::Bmp => bmp::stream_end(data),
        ImageFormat::Webp => webp::stream_end(data),
    }
}

const SIGNATURE_PATTERNS: [(&[u8], ImageFormat); 6] = [
    (&png::PNG_SIGNATURE, ImageFormat::Png),
    (&jpeg::JPEG_MAGIC, ImageFormat::Jpeg),
    (gif::GIF87A, ImageFormat::Gif),
    (gif::GIF89A, ImageFormat::Gif),
    (webp::RIFF_MAGIC, ImageFormat::Webp),
    (bmp::BMP_MAGIC, ImageFormat::Bmp),
];

pub struct SignatureRegistry {
    pattern_matcher: Option<AhoCorasick>,
}

impl SignatureRegistry {
    pub fn new() -> Self {
        let patterns: Vec<&[u8]> = SIGNATURE_PATTERNS.iter().map(|(p, _)| *p).collect();
        Self {
            pattern_matcher: AhoCorasick::new(&patterns).ok(),
        }
    }

    /// Offsets of every magic prefix in `data` whose header also looks sane,
    /// in ascending order.
    pub fn find(&self, data: &[u8]) -> Vec<(usize, ImageFormat)> {
        let Some(matcher) = &self.pattern_matcher else {
            return Vec::new();
        };

        let mut hits: Vec<(usize, ImageFormat)> = matcher
            .find_overlapping_iter(data)
            .filter_map(|m| {
                let (_, format) = SIGNATURE_PATTERNS[m.pattern().as_usize()];
                let start = m.start();
                (sniff(&data[start..]) == Some(format)).then_some((start, format))
            })
            .collect();
        hits.sort_unstable_by_key(|(offset, _)| *offset);
        hits.dedup_by_key(|(offset, _)| *offset);
        hits
    }
}

impl Default for SignatureRegistry {
    fn default() -> Self {
        Self::new()
    }
}

static REGISTRY: LazyLock<SignatureRegistry> = LazyLock::new(SignatureRegistry::new);

pub fn find_signatures(data: &[u8]) -> Vec<(usize, ImageFormat)> {
    REGISTRY.find(data)
}

/// Splits `data` into non-overlapping image runs starting at verified
/// signatures. Each run ends at the format's own end marker, or at the end
/// of `data` when none is found.
pub fn carve_all(data: &[u8]) -> Vec<(usize, ImageFormat, &[u8])> {
    let mut runs = Vec::new();
    let mut covered = 0usize;
    for (offset, format) in find_signatures(data) {
        if offset < covered {
            continue;
        }
        let tail = &data[offset..];
        let len = carve_end(format, tail).unwrap_or(tail.len());
        runs.push((offset, format, &tail[..len]));
        covered = offset + len.max(1);
    }
    runs
}

#[inline]
pub(crate) fn read_u32_be(data: &[u8], pos: usize) -> Option<u32> {
    let bytes = data.get(pos..pos + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub(crate) fn read_u32_le(data: &[u8], pos: usize) -> Option<u32> {
    let bytes = data.get(pos..pos + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub(crate) fn read_u16_le(data: &[u8], pos: usize) -> Option<u16> {
    let bytes = data.get(pos..pos + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub(crate) fn read_u16_be(data: &[u8], pos: usize) -> Option<u16> {
    let bytes = data.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_rejects_short_and_random_input() {
        assert_eq!(sniff(&[]), None);
        assert_eq!(sniff(b"BM"), None);
        assert_eq!(sniff(b"RIFF\x00\x00\x00\x00WAVE"), None);
        assert_eq!(sniff(&[0xFF, 0xD8]), None);
    }

    #[test]
    fn test_find_signatures_skips_unverified_magic() {
        let mut data = b"xxBMxxRIFFxxxxAVI ".to_vec();
        data.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0]);
        let hits = find_signatures(&data);
        assert_eq!(hits, vec![(18, ImageFormat::Jpeg)]);
    }

    #[test]
    fn test_structure_confidence() {
        let mut s = Structure::new(4);
        s.check(true);
        s.check(false);
        s.check(true);
        assert!((s.confidence() - 0.5).abs() < f32::EPSILON);
        assert_eq!(Structure::default().confidence(), 0.0);
    }
}
