use crate::formats::carve_all;
use crate::types::{ExtractionMethod, Extracted, Origin, Transaction};

/// Signature search over raw output scripts, whether or not they parse.
pub fn extract(tx: &Transaction) -> Vec<Extracted> {
    let mut found = Vec::new();
    for (vout, output) in tx.outputs.iter().enumerate() {
        for (offset, _, run) in carve_all(&output.script) {
            found.push(Extracted::new(
                run.to_vec(),
                ExtractionMethod::CorruptedOutput,
                Origin::Output {
                    vout: vout as u32,
                    offset,
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
    fn test_plain_payment_script_has_no_hits() {
        let mut p2pkh = vec![0x76, 0xA9, 0x14];
        p2pkh.extend_from_slice(&[0x5A; 20]);
        p2pkh.extend_from_slice(&[0x88, 0xAC]);
        let tx = Transaction::new("t").with_output(p2pkh);
        assert!(extract(&tx).is_empty());
    }

    #[test]
    fn test_hit_after_garbage() {
        let mut script = vec![0xFF, 0xBA, 0xDD, 0x4E];
        script.extend_from_slice(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10]);
        let tx = Transaction::new("t").with_output(script);
        let found = extract(&tx);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].origin, Origin::Output { vout: 0, offset: 4 });
        assert_eq!(found[0].data[..3], [0xFF, 0xD8, 0xFF]);
    }
}
