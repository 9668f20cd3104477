use super::{Defect, Structure, read_u16_le};

pub const GIF87A: &[u8] = b"GIF87a";
pub const GIF89A: &[u8] = b"GIF89a";

pub const GIF_TRAILER: u8 = 0x3B;
const EXTENSION_INTRODUCER: u8 = 0x21;
const IMAGE_SEPARATOR: u8 = 0x2C;
const COLOR_TABLE_FLAG: u8 = 0x80;

const HEADER_LEN: usize = 6;
const SCREEN_DESCRIPTOR_LEN: usize = 7;
const IMAGE_DESCRIPTOR_LEN: usize = 10;
const CHECKS: u32 = 5;

static TRAILER_SEAL: [u8; 1] = [GIF_TRAILER];
static SUB_BLOCK_SEAL: [u8; 2] = [0x00, GIF_TRAILER];

#[inline]
fn color_table_len(packed: u8) -> usize {
    if packed & COLOR_TABLE_FLAG == 0 {
        return 0;
    }
    3 * (1usize << ((packed & 0x07) + 1))
}

enum SubBlocks {
    End(usize),
    Cut(usize),
}

fn skip_sub_blocks(data: &[u8], mut pos: usize) -> SubBlocks {
    loop {
        let Some(&size) = data.get(pos) else {
            return SubBlocks::Cut(pos);
        };
        if size == 0 {
            return SubBlocks::End(pos + 1);
        }
        let next = pos + 1 + size as usize;
        if next > data.len() {
            return SubBlocks::Cut(pos);
        }
        pos = next;
    }
}

pub fn inspect(data: &[u8]) -> Structure {
    let mut s = Structure::new(CHECKS);

    if !s.check(data.starts_with(GIF87A) || data.starts_with(GIF89A)) {
        return s.fail("missing GIF signature");
    }
    if !s.check(data.len() >= HEADER_LEN + SCREEN_DESCRIPTOR_LEN) {
        return s.fail("logical screen descriptor truncated");
    }

    let width = read_u16_le(data, HEADER_LEN).unwrap_or_default() as u32;
    let height = read_u16_le(data, HEADER_LEN + 2).unwrap_or_default() as u32;
    s.dimensions = Some((width, height));

    let packed = data[HEADER_LEN + 4];
    let mut pos = HEADER_LEN + SCREEN_DESCRIPTOR_LEN + color_table_len(packed);
    if pos > data.len() {
        return s.fail("global color table truncated");
    }

    let mut frames = 0usize;
    let mut cut = None;
    let mut trailer_end = None;

    while cut.is_none() && trailer_end.is_none() {
        let Some(&introducer) = data.get(pos) else {
            cut = Some(Defect::MissingTerminator {
                seal: &TRAILER_SEAL,
            });
            break;
        };

        match introducer {
            GIF_TRAILER => trailer_end = Some(pos + 1),
            EXTENSION_INTRODUCER => {
                if pos + 2 > data.len() {
                    cut = Some(Defect::TruncatedTail {
                        keep: pos,
                        seal: &TRAILER_SEAL,
                    });
                    break;
                }
                match skip_sub_blocks(data, pos + 2) {
                    SubBlocks::End(next) => pos = next,
                    SubBlocks::Cut(_) => {
                        cut = Some(Defect::TruncatedTail {
                            keep: pos,
                            seal: &TRAILER_SEAL,
                        });
                    }
                }
            }
            IMAGE_SEPARATOR => {
                if pos + IMAGE_DESCRIPTOR_LEN > data.len() {
                    cut = Some(Defect::TruncatedTail {
                        keep: pos,
                        seal: &TRAILER_SEAL,
                    });
                    break;
                }
                let local_packed = data[pos + 9];
                let data_start = pos + IMAGE_DESCRIPTOR_LEN + color_table_len(local_packed);
                if data_start + 1 > data.len() {
                    cut = Some(Defect::TruncatedTail {
                        keep: pos,
                        seal: &TRAILER_SEAL,
                    });
                    break;
                }
                frames += 1;
                match skip_sub_blocks(data, data_start + 1) {
                    SubBlocks::End(next) => pos = next,
                    SubBlocks::Cut(at) => {
                        cut = Some(Defect::TruncatedTail {
                            keep: at,
                            seal: &SUB_BLOCK_SEAL,
                        });
                    }
                }
            }
            other => {
                return s.fail(format!("unknown block introducer {other:#04x} at {pos}"));
            }
        }
    }

    if !s.check(frames > 0) {
        return s.fail("no image frame");
    }

    if let Some(end) = trailer_end {
        s.check(true);
        if !s.check(end == data.len()) {
            s.defects.push(Defect::TrailingData { end });
        }
    }
    if let Some(defect) = cut {
        s.defects.push(defect);
    }
    s
}

pub fn stream_end(data: &[u8]) -> Option<usize> {
    let s = inspect(data);
    if s.fatal.is_some() {
        return None;
    }
    match s.defects.first() {
        None => Some(data.len()),
        Some(Defect::TrailingData { end }) => Some(*end),
        Some(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_pixel_gif() -> Vec<u8> {
        let mut gif = GIF89A.to_vec();
        gif.extend_from_slice(&[0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00]);
        gif.extend_from_slice(&[0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF]);
        gif.extend_from_slice(&[0x2C, 0, 0, 0, 0, 0x01, 0x00, 0x01, 0x00, 0x00]);
        gif.extend_from_slice(&[0x02, 0x02, 0x44, 0x01, 0x00]);
        gif.push(GIF_TRAILER);
        gif
    }

    #[test]
    fn test_well_formed_gif() {
        let s = inspect(&one_pixel_gif());
        assert!(s.is_sound(), "{s:?}");
        assert_eq!(s.dimensions, Some((1, 1)));
    }

    #[test]
    fn test_missing_trailer() {
        let mut gif = one_pixel_gif();
        gif.pop();
        let s = inspect(&gif);
        assert_eq!(
            s.defects,
            vec![Defect::MissingTerminator {
                seal: &TRAILER_SEAL
            }]
        );
        assert_eq!(stream_end(&gif), None);
    }

    #[test]
    fn test_cut_inside_image_data() {
        let mut gif = one_pixel_gif();
        gif.truncate(gif.len() - 3);
        let s = inspect(&gif);
        assert!(matches!(
            s.defects[..],
            [Defect::TruncatedTail { seal, .. }] if seal == SUB_BLOCK_SEAL
        ));
    }

    #[test]
    fn test_unknown_block_is_fatal() {
        let mut gif = one_pixel_gif();
        let last = gif.len() - 1;
        gif[last] = 0x99;
        assert!(inspect(&gif).fatal.is_some());
    }
}
