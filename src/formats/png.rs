use super::{Defect, Structure, read_u32_be};

pub const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

pub const IEND_CRC: u32 = 0xAE426082;

pub const IEND_CHUNK: [u8; 12] = [
    0x00, 0x00, 0x00, 0x00, b'I', b'E', b'N', b'D', 0xAE, 0x42, 0x60, 0x82,
];

const IHDR_LEN: u32 = 13;
const CHUNK_OVERHEAD: usize = 12;
const CHECKS: u32 = 6;

pub fn chunk_crc(chunk_type: &[u8; 4], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(chunk_type);
    hasher.update(payload);
    hasher.finalize()
}

pub fn inspect(data: &[u8]) -> Structure {
    let mut s = Structure::new(CHECKS);

    if !s.check(data.starts_with(&PNG_SIGNATURE)) {
        return s.fail("missing PNG signature");
    }

    let mut pos = PNG_SIGNATURE.len();
    let mut seen_ihdr = false;
    let mut idat_count = 0usize;
    let mut crc_ok = true;
    let mut terminated = false;

    while pos < data.len() {
        if pos + CHUNK_OVERHEAD > data.len() {
            break;
        }
        let length = read_u32_be(data, pos).unwrap_or(u32::MAX) as usize;
        let chunk_type: [u8; 4] = [data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]];

        if !chunk_type.iter().all(u8::is_ascii_alphabetic) {
            return s.fail(format!("invalid chunk type at offset {pos}"));
        }

        if !seen_ihdr {
            if &chunk_type != b"IHDR" || length as u32 != IHDR_LEN {
                return s.fail("first chunk is not a valid IHDR");
            }
            seen_ihdr = true;
            s.check(true);
        }

        let total = CHUNK_OVERHEAD.saturating_add(length);
        if pos.saturating_add(total) > data.len() {
            break;
        }

        let payload = &data[pos + 8..pos + 8 + length];
        let crc_pos = pos + 8 + length;
        let stored = read_u32_be(data, crc_pos).unwrap_or_default();
        let computed = chunk_crc(&chunk_type, payload);
        if stored != computed {
            crc_ok = false;
            s.defects.push(Defect::ChunkCrcMismatch {
                offset: crc_pos,
                computed,
            });
        }

        match &chunk_type {
            b"IHDR" => {
                let width = read_u32_be(payload, 0).unwrap_or_default();
                let height = read_u32_be(payload, 4).unwrap_or_default();
                s.dimensions = Some((width, height));
            }
            b"IDAT" => idat_count += 1,
            b"IEND" => {
                terminated = true;
                pos += total;
                break;
            }
            _ => {}
        }

        pos += total;
    }

    if !seen_ihdr {
        return s.fail("no IHDR chunk");
    }
    s.check(crc_ok);

    if !s.check(idat_count > 0) {
        return s.fail("no complete IDAT chunk");
    }

    if s.check(terminated) {
        if s.check(pos == data.len()) {
            return s;
        }
        s.defects.push(Defect::TrailingData { end: pos });
    } else if pos == data.len() {
        s.defects.push(Defect::MissingTerminator { seal: &IEND_CHUNK });
    } else {
        s.defects.push(Defect::TruncatedTail {
            keep: pos,
            seal: &IEND_CHUNK,
        });
    }
    s
}

/// End of the first complete chunk stream, ignoring anything after IEND.
pub fn stream_end(data: &[u8]) -> Option<usize> {
    let s = inspect(data);
    if s.fatal.is_some() {
        return None;
    }
    let mut end = data.len();
    for defect in &s.defects {
        match defect {
            Defect::TrailingData { end: at } => end = *at,
            Defect::TruncatedTail { .. } | Defect::MissingTerminator { .. } => return None,
            _ => {}
        }
    }
    Some(end)
}
