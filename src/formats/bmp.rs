use super::{Defect, Structure, read_u16_le, read_u32_le};

pub const BMP_MAGIC: &[u8] = b"BM";

const FILE_HEADER_LEN: usize = 14;
const FILE_SIZE_OFFSET: usize = 2;
const PIXEL_OFFSET_FIELD: usize = 10;
const DIB_SIZES: [u32; 7] = [12, 40, 52, 56, 64, 108, 124];
const CORE_HEADER_LEN: u32 = 12;
const BI_RGB: u32 = 0;
const BI_BITFIELDS: u32 = 3;
const MAX_PIXEL_BYTES: u64 = 256 * 1024 * 1024;
/// Largest zero-fill the repair engine may append to a short pixel array.
/// The fill may also never exceed the pixel bytes actually present.
pub const MAX_PIXEL_PADDING: u64 = 256 * 1024;
const CHECKS: u32 = 6;

struct Header {
    file_size: u32,
    pixel_offset: usize,
    width: i64,
    height: i64,
    planes: u16,
    bpp: u16,
    compression: u32,
    image_size: u32,
}

fn parse_header(data: &[u8]) -> Option<Header> {
    if !data.starts_with(BMP_MAGIC) {
        return None;
    }
    let dib_size = read_u32_le(data, FILE_HEADER_LEN)?;
    if !DIB_SIZES.contains(&dib_size) {
        return None;
    }
    let dib = data.get(FILE_HEADER_LEN..FILE_HEADER_LEN + dib_size as usize)?;

    let (width, height, planes, bpp, compression, image_size) = if dib_size == CORE_HEADER_LEN {
        (
            read_u16_le(dib, 4)? as i64,
            read_u16_le(dib, 6)? as i64,
            read_u16_le(dib, 8)?,
            read_u16_le(dib, 10)?,
            BI_RGB,
            0,
        )
    } else {
        (
            read_u32_le(dib, 4)? as i32 as i64,
            read_u32_le(dib, 8)? as i32 as i64,
            read_u16_le(dib, 12)?,
            read_u16_le(dib, 14)?,
            read_u32_le(dib, 16)?,
            read_u32_le(dib, 20)?,
        )
    };

    Some(Header {
        file_size: read_u32_le(data, FILE_SIZE_OFFSET)?,
        pixel_offset: read_u32_le(data, PIXEL_OFFSET_FIELD)? as usize,
        width,
        height,
        planes,
        bpp,
        compression,
        image_size,
    })
}

/// "BM" alone is too common to trust; require a header that parses and has
/// zeroed reserved fields.
pub fn has_plausible_header(data: &[u8]) -> bool {
    if data.len() < FILE_HEADER_LEN + 4 || data[6..10] != [0, 0, 0, 0] {
        return false;
    }
    parse_header(data).is_some_and(|h| {
        h.planes == 1
            && matches!(h.bpp, 1 | 4 | 8 | 16 | 24 | 32)
            && h.width > 0
            && h.height != 0
            && h.pixel_offset >= FILE_HEADER_LEN
    })
}

fn expected_pixel_bytes(h: &Header) -> Option<u64> {
    match h.compression {
        BI_RGB | BI_BITFIELDS => {
            let row = (h.width as u64 * h.bpp as u64).div_ceil(32) * 4;
            Some(row * h.height.unsigned_abs())
        }
        _ if h.image_size > 0 => Some(h.image_size as u64),
        _ => None,
    }
}

pub fn inspect(data: &[u8]) -> Structure {
    let mut s = Structure::new(CHECKS);

    if !s.check(data.starts_with(BMP_MAGIC)) {
        return s.fail("missing BMP signature");
    }
    let Some(header) = parse_header(data) else {
        return s.fail("unrecognised DIB header");
    };
    s.check(true);

    if !s.check(header.planes == 1 && matches!(header.bpp, 1 | 4 | 8 | 16 | 24 | 32)) {
        return s.fail(format!(
            "unsupported planes/bit depth {}/{}",
            header.planes, header.bpp
        ));
    }
    if header.width <= 0 || header.height == 0 {
        return s.fail("zero image dimensions");
    }
    s.dimensions = Some((header.width as u32, header.height.unsigned_abs() as u32));

    if !s.check(header.pixel_offset >= FILE_HEADER_LEN && header.pixel_offset <= data.len()) {
        return s.fail(format!("pixel offset {} out of range", header.pixel_offset));
    }

    let actual = (data.len() - header.pixel_offset) as u64;
    let complete = match expected_pixel_bytes(&header) {
        Some(expected) if expected > MAX_PIXEL_BYTES => {
            return s.fail("implausible pixel array size");
        }
        Some(expected) if actual < expected => {
            let missing = expected - actual;
            if missing > actual || missing > MAX_PIXEL_PADDING {
                return s.fail(format!(
                    "pixel data far shorter than header ({actual} of {expected} bytes)"
                ));
            }
            s.defects.push(Defect::ShortPixelData {
                missing: missing as usize,
            });
            false
        }
        _ => true,
    };
    s.check(complete);

    let actual_len = u32::try_from(data.len()).unwrap_or(u32::MAX);
    if !s.check(header.file_size == actual_len) {
        s.defects.push(Defect::LengthFieldMismatch {
            offset: FILE_SIZE_OFFSET,
            declared: header.file_size,
            actual: actual_len,
        });
    }
    s
}

pub fn stream_end(data: &[u8]) -> Option<usize> {
    let header = parse_header(data)?;
    let declared = header.file_size as usize;
    (declared > header.pixel_offset && declared <= data.len()).then_some(declared)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_by_two() -> Vec<u8> {
        let mut bmp = Vec::new();
        bmp.extend_from_slice(b"BM");
        bmp.extend_from_slice(&70u32.to_le_bytes());
        bmp.extend_from_slice(&[0, 0, 0, 0]);
        bmp.extend_from_slice(&54u32.to_le_bytes());
        bmp.extend_from_slice(&40u32.to_le_bytes());
        bmp.extend_from_slice(&2i32.to_le_bytes());
        bmp.extend_from_slice(&2i32.to_le_bytes());
        bmp.extend_from_slice(&1u16.to_le_bytes());
        bmp.extend_from_slice(&24u16.to_le_bytes());
        bmp.extend_from_slice(&[0u8; 24]);
        bmp.extend_from_slice(&[0xAA; 16]);
        bmp
    }

    #[test]
    fn test_well_formed_bmp() {
        let bmp = two_by_two();
        assert_eq!(bmp.len(), 70);
        assert!(has_plausible_header(&bmp));
        let s = inspect(&bmp);
        assert!(s.is_sound(), "{s:?}");
        assert_eq!(s.dimensions, Some((2, 2)));
    }

    #[test]
    fn test_short_pixel_data_and_size_field() {
        let mut bmp = two_by_two();
        bmp.truncate(66);
        let s = inspect(&bmp);
        assert_eq!(
            s.defects,
            vec![
                Defect::ShortPixelData { missing: 4 },
                Defect::LengthFieldMismatch {
                    offset: 2,
                    declared: 70,
                    actual: 66
                }
            ]
        );
    }

    #[test]
    fn test_mostly_missing_pixel_data_is_fatal() {
        let mut bmp = two_by_two();
        bmp.truncate(60);
        let s = inspect(&bmp);
        assert!(s.fatal.is_some_and(|reason| reason.contains("far shorter")));
        assert!(s.defects.is_empty());
    }

    #[test]
    fn test_bm_text_is_not_a_bitmap() {
        assert!(!has_plausible_header(b"BMW owners club, est. 1998, 42 members"));
    }
}
