use super::{Defect, Structure, read_u16_le, read_u32_le};

pub const RIFF_MAGIC: &[u8] = b"RIFF";
pub const WEBP_FOURCC: &[u8] = b"WEBP";

const RIFF_SIZE_OFFSET: usize = 4;
const RIFF_HEADER_LEN: usize = 12;
const CHUNK_HEADER_LEN: usize = 8;
const CHECKS: u32 = 4;

pub fn has_riff_webp_header(data: &[u8]) -> bool {
    data.len() >= RIFF_HEADER_LEN && data.starts_with(RIFF_MAGIC) && &data[8..12] == WEBP_FOURCC
}

fn read_u24_le(data: &[u8], pos: usize) -> Option<u32> {
    let b = data.get(pos..pos + 3)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], 0]))
}

fn image_dimensions(fourcc: &[u8], payload: &[u8]) -> Option<(u32, u32)> {
    match fourcc {
        b"VP8X" => Some((
            read_u24_le(payload, 4)? + 1,
            read_u24_le(payload, 7)? + 1,
        )),
        b"VP8L" => {
            if payload.first() != Some(&0x2F) {
                return None;
            }
            let bits = read_u32_le(payload, 1)?;
            Some(((bits & 0x3FFF) + 1, ((bits >> 14) & 0x3FFF) + 1))
        }
        b"VP8 " => {
            if payload.get(3..6) != Some(&[0x9D, 0x01, 0x2A][..]) {
                return None;
            }
            Some((
                (read_u16_le(payload, 6)? & 0x3FFF) as u32,
                (read_u16_le(payload, 8)? & 0x3FFF) as u32,
            ))
        }
        _ => None,
    }
}

pub fn inspect(data: &[u8]) -> Structure {
    let mut s = Structure::new(CHECKS);

    if !s.check(has_riff_webp_header(data)) {
        return s.fail("missing RIFF/WEBP header");
    }

    let declared = read_u32_le(data, RIFF_SIZE_OFFSET).unwrap_or_default();
    let riff_end = declared as usize + CHUNK_HEADER_LEN;

    let mut pos = RIFF_HEADER_LEN;
    let mut first = true;
    while pos < data.len() {
        let header = data.get(pos..pos + CHUNK_HEADER_LEN);
        let size = read_u32_le(data, pos + 4).map(|v| v as usize);
        let next = size.map(|size| pos + CHUNK_HEADER_LEN + size + (size & 1));

        match (header, next) {
            (Some(header), Some(next)) if next <= data.len() => {
                let fourcc = &header[..4];
                if first {
                    if !s.check(matches!(fourcc, b"VP8 " | b"VP8L" | b"VP8X")) {
                        return s.fail("first chunk is not an image chunk");
                    }
                    let payload = &data[pos + CHUNK_HEADER_LEN..next.min(data.len())];
                    s.dimensions = image_dimensions(fourcc, payload);
                    first = false;
                }
                pos = next;
            }
            _ if pos == riff_end && !first => {
                s.check(true);
                s.check(true);
                s.defects.push(Defect::TrailingData { end: pos });
                return s;
            }
            _ => return s.fail(format!("chunk at offset {pos} overruns data")),
        }
    }

    if first {
        return s.fail("no image chunk");
    }
    s.check(true);

    let actual = u32::try_from(data.len() - CHUNK_HEADER_LEN).unwrap_or(u32::MAX);
    if !s.check(declared == actual) {
        s.defects.push(Defect::LengthFieldMismatch {
            offset: RIFF_SIZE_OFFSET,
            declared,
            actual,
        });
    }
    s
}

pub fn stream_end(data: &[u8]) -> Option<usize> {
    if !has_riff_webp_header(data) {
        return None;
    }
    let end = read_u32_le(data, RIFF_SIZE_OFFSET)? as usize + CHUNK_HEADER_LEN;
    (end > RIFF_HEADER_LEN && end <= data.len()).then_some(end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lossless_stub() -> Vec<u8> {
        let payload = [0x2F, 0x00, 0x00, 0x00, 0x00, 0x00];
        let mut webp = b"RIFF".to_vec();
        webp.extend_from_slice(&((4 + 8 + payload.len()) as u32).to_le_bytes());
        webp.extend_from_slice(b"WEBPVP8L");
        webp.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        webp.extend_from_slice(&payload);
        webp
    }

    #[test]
    fn test_consistent_riff_size() {
        let s = inspect(&lossless_stub());
        assert!(s.is_sound(), "{s:?}");
        assert_eq!(s.dimensions, Some((1, 1)));
    }

    #[test]
    fn test_riff_size_mismatch() {
        let mut webp = lossless_stub();
        webp[4] = 0x40;
        let s = inspect(&webp);
        assert!(matches!(
            s.defects[..],
            [Defect::LengthFieldMismatch { declared: 0x40, actual: 18, .. }]
        ));
    }

    #[test]
    fn test_trailing_bytes_after_riff() {
        let mut webp = lossless_stub();
        let len = webp.len();
        webp.extend_from_slice(b"\x01\x02\x03");
        assert_eq!(inspect(&webp).defects, vec![Defect::TrailingData { end: len }]);
        assert_eq!(stream_end(&webp), Some(len));
    }
}
