use super::{Defect, Structure, read_u16_be};

pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];
pub const JPEG_MAGIC: [u8; 3] = [0xFF, 0xD8, 0xFF];

const DHT: u8 = 0xC4;
const SOS: u8 = 0xDA;
const EOI: u8 = 0xD9;
const HUFFMAN_COUNTS: usize = 16;
const HUFFMAN_MAX_SYMBOLS: usize = 256;
const CODE_SPACE: u32 = 1 << 16;
const CHECKS: u32 = 6;

/// Markers that may open a segment: SOFn, DHT, RSTn, SOI/EOI, SOS, DQT,
/// DNL/DRI/DHP/EXP, APPn and COM.
#[inline]
fn is_segment_marker(marker: u8) -> bool {
    matches!(marker, 0xC0..=0xEF | 0xFE)
}

#[inline]
fn is_frame_marker(marker: u8) -> bool {
    matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeSpace {
    Complete,
    Oversubscribed,
    Undersubscribed,
}

/// Classifies a DHT bit-length histogram against the canonical code tree.
/// JPEG forbids the all-ones codeword, so a complete table leaves exactly one
/// slot of the longest length unused.
pub fn classify_code_lengths(counts: &[u8]) -> CodeSpace {
    let mut used = 0u32;
    let mut longest = 0usize;
    for (i, &count) in counts.iter().take(HUFFMAN_COUNTS).enumerate() {
        used += count as u32 * (CODE_SPACE >> (i + 1));
        if count > 0 {
            longest = i + 1;
        }
    }
    if longest == 0 {
        return CodeSpace::Undersubscribed;
    }
    let reserved = CODE_SPACE >> longest;
    match (used + reserved).cmp(&CODE_SPACE) {
        std::cmp::Ordering::Greater => CodeSpace::Oversubscribed,
        std::cmp::Ordering::Less => CodeSpace::Undersubscribed,
        std::cmp::Ordering::Equal => CodeSpace::Complete,
    }
}

/// Length histogram of a balanced canonical code for `symbols` symbols plus the
/// reserved all-ones slot.
pub fn balanced_counts(symbols: usize) -> Option<[u8; HUFFMAN_COUNTS]> {
    if symbols == 0 || symbols > HUFFMAN_MAX_SYMBOLS {
        return None;
    }
    let leaves = symbols + 1;
    let depth = (usize::BITS - (leaves - 1).leading_zeros()) as usize;
    let short = (1usize << depth) - leaves;
    let long = 2 * leaves - (1usize << depth) - 1;

    let mut counts = [0u8; HUFFMAN_COUNTS];
    if depth >= 2 {
        counts[depth - 2] = u8::try_from(short).ok()?;
    }
    counts[depth - 1] = u8::try_from(long).ok()?;
    Some(counts)
}

fn check_dht(body: &[u8], base: usize, defects: &mut Vec<Defect>) -> Result<bool, String> {
    let mut sound = true;
    let mut p = 0usize;
    while p < body.len() {
        if p + 1 + HUFFMAN_COUNTS > body.len() {
            return Err(format!("DHT table header overruns segment at {}", base + p));
        }
        let class_id = body[p];
        if class_id >> 4 > 1 || class_id & 0x0F > 3 {
            return Err(format!("invalid Huffman table selector {class_id:#04x}"));
        }
        let counts = &body[p + 1..p + 1 + HUFFMAN_COUNTS];
        let symbols: usize = counts.iter().map(|&c| c as usize).sum();
        if symbols == 0 {
            return Err("empty Huffman table".to_string());
        }
        if symbols > HUFFMAN_MAX_SYMBOLS {
            return Err(format!("Huffman table declares {symbols} symbols"));
        }
        if p + 1 + HUFFMAN_COUNTS + symbols > body.len() {
            return Err("Huffman symbol list overruns segment".to_string());
        }

        let offset = base + p + 1;
        match classify_code_lengths(counts) {
            CodeSpace::Complete => {}
            CodeSpace::Oversubscribed => {
                sound = false;
                defects.push(Defect::HuffmanOversubscribed { offset, symbols });
            }
            CodeSpace::Undersubscribed => {
                sound = false;
                defects.push(Defect::HuffmanUndersubscribed { offset, symbols });
            }
        }
        p += 1 + HUFFMAN_COUNTS + symbols;
    }
    Ok(sound)
}

/// Skips entropy-coded data and returns the offset of the next real marker.
fn skip_entropy_data(data: &[u8], start: usize) -> Option<usize> {
    let mut i = start;
    while i + 1 < data.len() {
        if data[i] == 0xFF {
            let next = data[i + 1];
            if next == 0x00 || matches!(next, 0xD0..=0xD7) {
                i += 2;
                continue;
            }
            if next == 0xFF {
                i += 1;
                continue;
            }
            return Some(i);
        }
        i += 1;
    }
    None
}

fn cut_defect(data: &[u8], keep: usize) -> Defect {
    if keep >= data.len() {
        Defect::MissingTerminator { seal: &JPEG_EOI }
    } else {
        Defect::TruncatedTail {
            keep,
            seal: &JPEG_EOI,
        }
    }
}

pub fn inspect(data: &[u8]) -> Structure {
    let mut s = Structure::new(CHECKS);

    if !s.check(data.starts_with(&JPEG_MAGIC)) {
        return s.fail("missing JPEG start-of-image");
    }

    let mut pos = JPEG_SOI.len();
    let mut has_sof = false;
    let mut has_sos = false;
    let mut huffman_ok = true;
    let mut eoi_end = None;

    loop {
        while pos + 1 < data.len() && data[pos] == 0xFF && data[pos + 1] == 0xFF {
            pos += 1;
        }

        if pos + 1 >= data.len() {
            if !has_sos {
                return s.fail("truncated before scan data");
            }
            s.defects.push(cut_defect(data, pos));
            break;
        }

        if data[pos] != 0xFF {
            return s.fail(format!("expected marker at offset {pos}"));
        }

        let marker = data[pos + 1];

        if marker == EOI {
            if !has_sos {
                return s.fail("end-of-image before any scan");
            }
            eoi_end = Some(pos + 2);
            break;
        }

        if matches!(marker, 0xD0..=0xD7 | 0x01) {
            pos += 2;
            continue;
        }

        if !is_segment_marker(marker) || marker == 0xD8 {
            return s.fail(format!("invalid marker {marker:#04x} at offset {pos}"));
        }

        let Some(seg_len) = read_u16_be(data, pos + 2) else {
            if !has_sos {
                return s.fail("truncated before scan data");
            }
            s.defects.push(cut_defect(data, pos));
            break;
        };
        let seg_len = seg_len as usize;
        if seg_len < 2 {
            return s.fail(format!("segment length {seg_len} at offset {pos}"));
        }

        let seg_end = pos + 2 + seg_len;
        if seg_end > data.len() {
            if !has_sos {
                return s.fail(format!("segment at offset {pos} overruns data"));
            }
            s.defects.push(cut_defect(data, pos));
            break;
        }

        let body = &data[pos + 4..seg_end];

        match marker {
            DHT => match check_dht(body, pos + 4, &mut s.defects) {
                Ok(sound) => huffman_ok &= sound,
                Err(reason) => return s.fail(reason),
            },
            m if is_frame_marker(m) => {
                if body.len() >= 5 {
                    let height = u16::from_be_bytes([body[1], body[2]]) as u32;
                    let width = u16::from_be_bytes([body[3], body[4]]) as u32;
                    has_sof = width > 0;
                    s.dimensions = Some((width, height));
                }
            }
            SOS => {
                if !has_sof {
                    return s.fail("scan before frame header");
                }
                has_sos = true;
                match skip_entropy_data(data, seg_end) {
                    Some(next) => {
                        pos = next;
                        continue;
                    }
                    None => {
                        let keep = if data.last() == Some(&0xFF) {
                            data.len() - 1
                        } else {
                            data.len()
                        };
                        s.defects.push(cut_defect(data, keep));
                        break;
                    }
                }
            }
            _ => {}
        }

        pos = seg_end;
    }

    s.check(has_sof);
    s.check(has_sos);
    s.check(huffman_ok);
    if let Some(end) = eoi_end {
        s.check(true);
        if !s.check(end == data.len()) {
            s.defects.push(Defect::TrailingData { end });
        }
    }
    s
}

pub fn stream_end(data: &[u8]) -> Option<usize> {
    let s = inspect(data);
    if s.fatal.is_some() {
        return None;
    }
    let mut open = false;
    for defect in &s.defects {
        match defect {
            Defect::TrailingData { end } => return Some(*end),
            Defect::TruncatedTail { .. } | Defect::MissingTerminator { .. } => open = true,
            _ => {}
        }
    }
    (!open).then_some(data.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_tables_are_complete() {
        let dc_luma = [0, 1, 5, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0];
        let ac_luma = [0, 2, 1, 3, 3, 2, 4, 3, 5, 5, 4, 4, 0, 0, 1, 0x7D];
        assert_eq!(classify_code_lengths(&dc_luma), CodeSpace::Complete);
        assert_eq!(classify_code_lengths(&ac_luma), CodeSpace::Complete);
    }

    #[test]
    fn test_classify_over_and_under() {
        let over = [3, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let full = [2, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let under = [0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(classify_code_lengths(&over), CodeSpace::Oversubscribed);
        assert_eq!(classify_code_lengths(&full), CodeSpace::Oversubscribed);
        assert_eq!(classify_code_lengths(&under), CodeSpace::Undersubscribed);
        assert_eq!(classify_code_lengths(&[0; 16]), CodeSpace::Undersubscribed);
    }

    #[test]
    fn test_balanced_counts_always_complete() {
        for n in 1..=255 {
            let counts = balanced_counts(n).unwrap();
            let total: usize = counts.iter().map(|&c| c as usize).sum();
            assert_eq!(total, n);
            assert_eq!(classify_code_lengths(&counts), CodeSpace::Complete, "n={n}");
        }
        assert_eq!(balanced_counts(0), None);
        assert_eq!(balanced_counts(257), None);
    }

    #[test]
    fn test_skip_entropy_data_honours_stuffing() {
        let data = [0x12, 0xFF, 0x00, 0x34, 0xFF, 0xD3, 0x56, 0xFF, 0xD9];
        assert_eq!(skip_entropy_data(&data, 0), Some(7));
        assert_eq!(skip_entropy_data(&data[..7], 0), None);
    }

    #[test]
    fn test_segment_markers() {
        assert!(is_segment_marker(0xC0));
        assert!(is_segment_marker(0xE0));
        assert!(is_segment_marker(0xDA));
        assert!(is_segment_marker(0xFE));
        assert!(!is_segment_marker(0x00));
        assert!(!is_segment_marker(0xF0));
    }
}
