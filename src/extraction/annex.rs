use crate::formats::carve_all;
use crate::types::{ExtractionMethod, Extracted, Origin, Transaction};

pub const ANNEX_TAG: u8 = 0x50;

/// BIP-341: the last witness element is an annex only when there are at
/// least two elements and it starts with 0x50.
pub fn annex(witness: &[Vec<u8>]) -> Option<&[u8]> {
    if witness.len() < 2 {
        return None;
    }
    let last = witness.last()?;
    (last.first() == Some(&ANNEX_TAG)).then(|| &last[1..])
}

pub fn extract(tx: &Transaction) -> Vec<Extracted> {
    let mut found = Vec::new();
    for (vin, input) in tx.inputs.iter().enumerate() {
        let Some(blob) = annex(&input.witness) else {
            continue;
        };
        let item = (input.witness.len() - 1) as u32;
        for (offset, _, run) in carve_all(blob) {
            found.push(Extracted::new(
                run.to_vec(),
                ExtractionMethod::TaprootAnnex,
                Origin::Witness {
                    vin: vin as u32,
                    item,
                    offset: offset + 1,
                },
            ));
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_element_is_not_an_annex() {
        assert!(annex(&[vec![0x50, 1, 2]]).is_none());
        assert_eq!(annex(&[vec![1], vec![0x50, 1, 2]]), Some(&[1u8, 2][..]));
    }

    #[test]
    fn test_image_inside_annex() {
        let mut blob = vec![ANNEX_TAG, 0x00, 0x01];
        blob.extend_from_slice(b"GIF89a");
        blob.extend_from_slice(&[0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00]);
        let tx = Transaction::new("t").with_witness(vec![vec![0x30; 64], blob]);
        let found = extract(&tx);
        assert_eq!(found.len(), 1);
        assert!(found[0].data.starts_with(b"GIF89a"));
        assert_eq!(found[0].origin, Origin::Witness { vin: 0, item: 1, offset: 3 });
    }

    #[test]
    fn test_annex_without_magic() {
        let tx = Transaction::new("t").with_witness(vec![vec![0x30; 64], vec![ANNEX_TAG; 40]]);
        assert!(extract(&tx).is_empty());
    }
}
