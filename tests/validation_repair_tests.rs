use chainscry::formats::png::{PNG_SIGNATURE, chunk_crc};
use chainscry::formats::{Defect, DefectKind};
use chainscry::repair::{RepairEngine, RepairOutcome};
use chainscry::types::ImageFormat;
use chainscry::validation::{ImageValidator, Strictness, ValidationConfig, Verdict};
use proptest::prelude::*;
use std::borrow::Cow;

const DC_LUMA_COUNTS: [u8; 16] = [0, 1, 5, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0];

fn segment(marker: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![0xFF, marker];
    out.extend_from_slice(&((body.len() + 2) as u16).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn jpeg_with_table(counts: [u8; 16], scan: &[u8]) -> Vec<u8> {
    let symbols: u8 = counts.iter().sum();
    let mut data = vec![0xFF, 0xD8];
    data.extend(segment(0xE0, b"JFIF\0\x01\x01\x00\x00\x01\x00\x01\x00\x00"));
    data.extend(segment(0xC0, &[8, 0, 16, 0, 16, 1, 1, 0x11, 0]));
    let mut dht = vec![0x00];
    dht.extend_from_slice(&counts);
    dht.extend(0..symbols);
    data.extend(segment(0xC4, &dht));
    data.extend(segment(0xDA, &[1, 1, 0x00, 0, 63, 0]));
    data.extend_from_slice(scan);
    data.extend_from_slice(&[0xFF, 0xD9]);
    data
}

fn valid_jpeg() -> Vec<u8> {
    jpeg_with_table(DC_LUMA_COUNTS, &[0x3C, 0x91, 0xFF, 0x00, 0x27])
}

fn png_chunk(chunk_type: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(chunk_type);
    out.extend_from_slice(payload);
    out.extend_from_slice(&chunk_crc(chunk_type, payload).to_be_bytes());
    out
}

fn valid_png() -> Vec<u8> {
    let mut ihdr = Vec::new();
    ihdr.extend_from_slice(&1u32.to_be_bytes());
    ihdr.extend_from_slice(&1u32.to_be_bytes());
    ihdr.extend_from_slice(&[8, 0, 0, 0, 0]);
    let mut data = PNG_SIGNATURE.to_vec();
    data.extend(png_chunk(b"IHDR", &ihdr));
    data.extend(png_chunk(
        b"IDAT",
        &[0x78, 0x9C, 0x63, 0x60, 0x00, 0x00, 0x00, 0x02, 0x00, 0x01],
    ));
    data.extend(png_chunk(b"IEND", &[]));
    data
}

fn valid_bmp() -> Vec<u8> {
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
    bmp.extend_from_slice(&[0x5A; 16]);
    bmp
}

fn one_pixel_gif() -> Vec<u8> {
    let mut gif = b"GIF89a".to_vec();
    gif.extend_from_slice(&[0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00]);
    gif.extend_from_slice(&[0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFF]);
    gif.extend_from_slice(&[0x2C, 0, 0, 0, 0, 0x01, 0x00, 0x01, 0x00, 0x00]);
    gif.extend_from_slice(&[0x02, 0x02, 0x44, 0x01, 0x00]);
    gif.push(0x3B);
    gif
}

fn lossless_webp() -> Vec<u8> {
    let payload = [0x2F, 0x00, 0x00, 0x00, 0x00, 0x00];
    let mut webp = b"RIFF".to_vec();
    webp.extend_from_slice(&((4 + 8 + payload.len()) as u32).to_le_bytes());
    webp.extend_from_slice(b"WEBPVP8L");
    webp.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    webp.extend_from_slice(&payload);
    webp
}

fn repaired_bytes(outcome: RepairOutcome<'_>) -> (Vec<u8>, Vec<DefectKind>) {
    match outcome {
        RepairOutcome::Valid { data, applied } => (data.into_owned(), applied),
        RepairOutcome::StillInvalid { reason, .. } => panic!("repair failed: {reason}"),
    }
}

#[test]
fn test_valid_images_pass() {
    let validator = ImageValidator::with_defaults();
    for data in [valid_jpeg(), valid_png(), valid_bmp()] {
        let v = validator.validate(&data);
        assert_eq!(v.verdict, Verdict::Valid, "{}", v.format_name());
        assert_eq!(v.confidence, 1.0);
    }
}

#[test]
fn test_oversubscribed_huffman_table_is_repaired() {
    let mut counts = [0u8; 16];
    counts[0] = 3;
    let jpeg = jpeg_with_table(counts, &[0x3C, 0x91]);
    let validator = ImageValidator::with_defaults();

    let v = validator.validate(&jpeg);
    let Verdict::RepairableCorruption { reason } = &v.verdict else {
        panic!("expected repairable, got {}", v.verdict);
    };
    assert!(matches!(
        reason[..],
        [Defect::HuffmanOversubscribed { symbols: 3, .. }]
    ));
    assert!(v.verdict.to_string().contains("Huffman code error"));

    let (fixed, applied) = repaired_bytes(RepairEngine::new(&validator).repair(&jpeg));
    assert_eq!(applied, vec![DefectKind::HuffmanOversubscribed]);
    assert_eq!(fixed.len(), jpeg.len());
    assert_eq!(validator.validate(&fixed).verdict, Verdict::Valid);
}

#[test]
fn test_undersubscribed_huffman_table_is_repaired() {
    let mut counts = [0u8; 16];
    counts[3] = 2;
    let jpeg = jpeg_with_table(counts, &[0x01]);
    let validator = ImageValidator::with_defaults();
    assert!(matches!(
        validator.validate(&jpeg).verdict,
        Verdict::RepairableCorruption { .. }
    ));
    let (fixed, applied) = repaired_bytes(RepairEngine::new(&validator).repair(&jpeg));
    assert_eq!(applied, vec![DefectKind::HuffmanUndersubscribed]);
    assert!(validator.validate(&fixed).verdict.is_valid());
}

#[test]
fn test_truncated_jpeg_gets_end_marker() {
    let mut jpeg = valid_jpeg();
    jpeg.truncate(jpeg.len() - 2);
    let validator = ImageValidator::with_defaults();

    let (fixed, applied) = repaired_bytes(RepairEngine::new(&validator).repair(&jpeg));
    assert_eq!(applied, vec![DefectKind::MissingTerminator]);
    assert_eq!(fixed, valid_jpeg());
}

#[test]
fn test_png_cut_mid_chunk_is_sealed() {
    let png = valid_png();
    let cut = &png[..png.len() - 12 - 5];
    let validator = ImageValidator::with_defaults();
    let v = validator.validate(cut);
    assert!(matches!(v.verdict, Verdict::Invalid { .. }), "{}", v.verdict);

    let mut with_tail = png[..png.len() - 12].to_vec();
    with_tail.extend_from_slice(&[0x00, 0x00, 0x00]);
    let (fixed, applied) = repaired_bytes(RepairEngine::new(&validator).repair(&with_tail));
    assert_eq!(applied, vec![DefectKind::TruncatedTail]);
    assert_eq!(fixed, png);
}

#[test]
fn test_png_crc_and_trailing_bytes_are_fixed() {
    let png = valid_png();
    let mut broken = png.clone();
    let idat_crc = png.len() - 12 - 4;
    broken[idat_crc] ^= 0x55;
    broken.extend_from_slice(b"extra");

    let validator = ImageValidator::with_defaults();
    let (fixed, applied) = repaired_bytes(RepairEngine::new(&validator).repair(&broken));
    assert!(applied.contains(&DefectKind::ChunkCrcMismatch));
    assert!(applied.contains(&DefectKind::TrailingData));
    assert_eq!(fixed, png);
}

#[test]
fn test_short_bmp_is_padded_and_size_patched() {
    let mut bmp = valid_bmp();
    bmp.truncate(64);
    let validator = ImageValidator::with_defaults();
    let (fixed, _) = repaired_bytes(RepairEngine::new(&validator).repair(&bmp));
    assert_eq!(fixed.len(), 70);
    assert!(validator.validate(&fixed).verdict.is_valid());
}

#[test]
fn test_bmp_header_far_larger_than_payload_is_not_padded() {
    let mut bmp = Vec::new();
    bmp.extend_from_slice(b"BM");
    bmp.extend_from_slice(&58u32.to_le_bytes());
    bmp.extend_from_slice(&[0, 0, 0, 0]);
    bmp.extend_from_slice(&54u32.to_le_bytes());
    bmp.extend_from_slice(&40u32.to_le_bytes());
    bmp.extend_from_slice(&8192i32.to_le_bytes());
    bmp.extend_from_slice(&8192i32.to_le_bytes());
    bmp.extend_from_slice(&1u16.to_le_bytes());
    bmp.extend_from_slice(&32u16.to_le_bytes());
    bmp.extend_from_slice(&[0u8; 24]);
    bmp.extend_from_slice(&[0x5A; 4]);
    assert_eq!(bmp.len(), 58);

    let validator = ImageValidator::with_defaults();
    match validator.validate(&bmp).verdict {
        Verdict::Invalid { reason } => assert!(reason.contains("far shorter"), "{reason}"),
        other => panic!("expected invalid, got {other}"),
    }
    match RepairEngine::new(&validator).repair(&bmp) {
        RepairOutcome::StillInvalid { original, .. } => assert_eq!(original.len(), 58),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_gif_without_trailer_gets_one() {
    let gif = one_pixel_gif();
    let cut = &gif[..gif.len() - 1];
    let validator = ImageValidator::with_defaults();
    assert!(matches!(
        validator.validate(cut).verdict,
        Verdict::RepairableCorruption { .. }
    ));

    let (fixed, applied) = repaired_bytes(RepairEngine::new(&validator).repair(cut));
    assert_eq!(applied, vec![DefectKind::MissingTerminator]);
    assert_eq!(fixed, gif);
}

#[test]
fn test_gif_cut_inside_sub_block_is_sealed() {
    let gif = one_pixel_gif();
    let cut = &gif[..gif.len() - 3];
    let validator = ImageValidator::with_defaults();

    let (fixed, applied) = repaired_bytes(RepairEngine::new(&validator).repair(cut));
    assert_eq!(applied, vec![DefectKind::TruncatedTail]);
    let mut expected = gif[..30].to_vec();
    expected.extend_from_slice(&[0x00, 0x3B]);
    assert_eq!(fixed, expected);
    assert!(validator.validate(&fixed).verdict.is_valid());
}

#[test]
fn test_webp_riff_size_is_patched() {
    let mut webp = lossless_webp();
    webp[4..8].copy_from_slice(&0x40u32.to_le_bytes());
    let validator = ImageValidator::with_defaults();

    let (fixed, applied) = repaired_bytes(RepairEngine::new(&validator).repair(&webp));
    assert_eq!(applied, vec![DefectKind::LengthFieldMismatch]);
    assert_eq!(fixed, lossless_webp());
    assert_eq!(&fixed[4..8], &18u32.to_le_bytes());
}

#[test]
fn test_bmp_size_field_is_patched() {
    let mut bmp = valid_bmp();
    bmp[2..6].copy_from_slice(&99u32.to_le_bytes());
    let validator = ImageValidator::with_defaults();
    let (fixed, applied) = repaired_bytes(RepairEngine::new(&validator).repair(&bmp));
    assert_eq!(applied, vec![DefectKind::LengthFieldMismatch]);
    assert_eq!(fixed, valid_bmp());
}

#[test]
fn test_strict_mode_rejects_any_defect() {
    let mut jpeg = valid_jpeg();
    jpeg.truncate(jpeg.len() - 2);
    let strict = ImageValidator::new(ValidationConfig::new().with_strictness(Strictness::Strict));
    assert!(matches!(strict.validate(&jpeg).verdict, Verdict::Invalid { .. }));
    assert!(strict.validate(&valid_jpeg()).verdict.is_valid());

    let outcome = RepairEngine::new(&strict).repair(&jpeg);
    assert!(matches!(outcome, RepairOutcome::StillInvalid { original, .. } if original == &jpeg[..]));
}

#[test]
fn test_policy_table_narrows_repairable_defects() {
    let mut counts = [0u8; 16];
    counts[0] = 3;
    let jpeg = jpeg_with_table(counts, &[0x3C]);
    let only_tails =
        ImageValidator::new(ValidationConfig::new().with_repairable([DefectKind::TruncatedTail]));
    let v = only_tails.validate(&jpeg);
    match v.verdict {
        Verdict::Invalid { reason } => assert!(reason.contains("over-subscribed"), "{reason}"),
        other => panic!("expected invalid, got {other}"),
    }
}

#[test]
fn test_format_allow_list() {
    let png_only =
        ImageValidator::new(ValidationConfig::new().with_allowed_formats([ImageFormat::Png]));
    let v = png_only.validate(&valid_jpeg());
    assert!(matches!(v.verdict, Verdict::Invalid { .. }));
    assert_eq!(v.format, Some(ImageFormat::Jpeg));
}

#[test]
fn test_repair_of_valid_image_borrows_input() {
    let png = valid_png();
    let validator = ImageValidator::with_defaults();
    match RepairEngine::new(&validator).repair(&png) {
        RepairOutcome::Valid { data, applied } => {
            assert!(matches!(data, Cow::Borrowed(_)));
            assert_eq!(&*data, &png[..]);
            assert!(applied.is_empty());
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_unrepairable_input_is_returned_unchanged() {
    let mut jpeg = valid_jpeg();
    jpeg[4] = 0x00;
    jpeg[5] = 0x01;
    let validator = ImageValidator::with_defaults();
    match RepairEngine::new(&validator).repair(&jpeg) {
        RepairOutcome::StillInvalid { original, .. } => assert_eq!(original, &jpeg[..]),
        other => panic!("unexpected {other:?}"),
    }
}

proptest! {
    #[test]
    fn prop_validate_never_panics(data in proptest::collection::vec(any::<u8>(), 0..512)) {
        let validator = ImageValidator::with_defaults();
        let _ = validator.validate(&data);
        let _ = RepairEngine::new(&validator).repair(&data);
    }

    #[test]
    fn prop_prefixed_garbage_never_panics(
        prefix in 0usize..5,
        tail in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let heads: [&[u8]; 5] = [&PNG_SIGNATURE, &[0xFF, 0xD8, 0xFF], b"GIF89a", b"RIFF\x20\x00\x00\x00WEBP", b"BM"];
        let mut data = heads[prefix].to_vec();
        data.extend_from_slice(&tail);
        let validator = ImageValidator::with_defaults();
        let v = validator.validate(&data);
        prop_assert!((0.0..=1.0).contains(&v.confidence));
        let _ = RepairEngine::new(&validator).repair(&data);
    }

    #[test]
    fn prop_repair_of_valid_jpeg_is_identity(
        scan in proptest::collection::vec(0u8..0xFF, 1..64),
    ) {
        let jpeg = jpeg_with_table(DC_LUMA_COUNTS, &scan);
        let validator = ImageValidator::with_defaults();
        prop_assert!(validator.validate(&jpeg).verdict.is_valid());
        match RepairEngine::new(&validator).repair(&jpeg) {
            RepairOutcome::Valid { data, applied } => {
                prop_assert!(applied.is_empty());
                prop_assert_eq!(&*data, &jpeg[..]);
            }
            RepairOutcome::StillInvalid { reason, .. } => {
                prop_assert!(false, "valid input failed repair: {}", reason);
            }
        }
    }
}
