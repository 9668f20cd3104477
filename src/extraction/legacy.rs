use super::annex::annex;
use super::script::{MAX_DIRECT_PUSH, is_bare_multisig, is_op_return, pushes};
use crate::formats::{carve_end, find_signatures, sniff};
use crate::types::{ExtractionMethod, Extracted, Origin, Transaction};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

/// Smallest push that needs a PUSHDATA opcode.
pub const LEGACY_MIN_PUSH_BYTES: usize = MAX_DIRECT_PUSH + 1;

const CONTROL_BLOCK_BASE: usize = 33;
const CONTROL_BLOCK_STEP: usize = 32;
const TAPSCRIPT_LEAF_MASK: u8 = 0xFE;
const TAPSCRIPT_LEAF_VERSION: u8 = 0xC0;
const BASE64_PREFIX_SKIP: usize = 2;

fn looks_like_control_block(item: &[u8]) -> bool {
    item.len() >= CONTROL_BLOCK_BASE
        && (item.len() - CONTROL_BLOCK_BASE) % CONTROL_BLOCK_STEP == 0
        && item[0] & TAPSCRIPT_LEAF_MASK == TAPSCRIPT_LEAF_VERSION
}

/// Witness stack with a trailing annex removed.
fn stack_without_annex(witness: &[Vec<u8>]) -> &[Vec<u8>] {
    match annex(witness) {
        Some(_) => &witness[..witness.len() - 1],
        None => witness,
    }
}

fn is_taproot_script_path(stack: &[Vec<u8>]) -> bool {
    stack.len() >= 2 && stack.last().is_some_and(|item| looks_like_control_block(item))
}

fn base64_image(item: &[u8]) -> Option<(usize, Vec<u8>)> {
    [0, BASE64_PREFIX_SKIP].into_iter().find_map(|skip| {
        let text = item.get(skip..)?;
        let decoded = STANDARD.decode(text.trim_ascii()).ok()?;
        sniff(&decoded).is_some().then_some((skip, decoded))
    })
}

fn outputs(tx: &Transaction, found: &mut Vec<Extracted>) {
    let mut multisig_vout = None;
    let mut multisig_keys: Vec<u8> = Vec::new();

    for (vout, output) in tx.outputs.iter().enumerate() {
        let script = &output.script;
        if is_op_return(script) {
            continue;
        }
        let multisig = is_bare_multisig(script);
        for (offset, data) in pushes(script) {
            if data.len() >= LEGACY_MIN_PUSH_BYTES {
                found.push(Extracted::new(
                    data.to_vec(),
                    ExtractionMethod::LegacySegwit,
                    Origin::Output {
                        vout: vout as u32,
                        offset,
                    },
                ));
            } else if multisig {
                multisig_vout.get_or_insert(vout);
                multisig_keys.extend_from_slice(data);
            }
        }
    }

    let Some(vout) = multisig_vout else {
        return;
    };
    if let Some(&(offset, format)) = find_signatures(&multisig_keys).first() {
        let tail = &multisig_keys[offset..];
        let len = carve_end(format, tail).unwrap_or(tail.len());
        found.push(Extracted::new(
            tail[..len].to_vec(),
            ExtractionMethod::LegacySegwit,
            Origin::Output {
                vout: vout as u32,
                offset,
            },
        ));
    }
}

fn witnesses(tx: &Transaction, found: &mut Vec<Extracted>) {
    for (vin, input) in tx.inputs.iter().enumerate() {
        let stack = stack_without_annex(&input.witness);
        if stack.is_empty() || is_taproot_script_path(stack) {
            continue;
        }

        let witness_origin = |item: usize, offset: usize| Origin::Witness {
            vin: vin as u32,
            item: item as u32,
            offset,
        };

        let script_idx = (stack.len() >= 2).then(|| stack.len() - 1);
        for (idx, item) in stack.iter().enumerate() {
            if let Some((skip, decoded)) = base64_image(item) {
                found.push(Extracted::new(
                    decoded,
                    ExtractionMethod::LegacySegwit,
                    witness_origin(idx, skip),
                ));
                continue;
            }

            if Some(idx) == script_idx {
                for (offset, data) in pushes(item) {
                    if data.len() >= LEGACY_MIN_PUSH_BYTES {
                        found.push(Extracted::new(
                            data.to_vec(),
                            ExtractionMethod::LegacySegwit,
                            witness_origin(idx, offset),
                        ));
                    }
                }
            } else if item.len() >= LEGACY_MIN_PUSH_BYTES {
                found.push(Extracted::new(
                    item.clone(),
                    ExtractionMethod::LegacySegwit,
                    witness_origin(idx, 0),
                ));
            }
        }
    }
}

pub fn extract(tx: &Transaction) -> Vec<Extracted> {
    let mut found = Vec::new();
    outputs(tx, &mut found);
    witnesses(tx, &mut found);
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::script::push_bytes;

    #[test]
    fn test_ordinary_spend_yields_nothing() {
        let mut p2wpkh = vec![0x00, 0x14];
        p2wpkh.extend_from_slice(&[0x33; 20]);
        let tx = Transaction::new("t")
            .with_witness(vec![vec![0x30; 71], vec![0x02; 33]])
            .with_output(p2wpkh);
        assert!(extract(&tx).is_empty());
    }

    #[test]
    fn test_large_push_in_witness_script() {
        let payload = vec![0x77; 300];
        let mut script = Vec::new();
        push_bytes(&mut script, &payload);
        script.push(0x75);
        script.push(0x51);
        let tx = Transaction::new("t").with_witness(vec![vec![0x30; 71], script]);
        let found = extract(&tx);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].data, payload);
        assert_eq!(found[0].origin, Origin::Witness { vin: 0, item: 1, offset: 0 });
    }

    #[test]
    fn test_taproot_script_path_is_skipped() {
        let mut control = vec![0xC0];
        control.extend_from_slice(&[0x01; 32]);
        let tx = Transaction::new("t").with_witness(vec![vec![0x99; 200], vec![0x51], control]);
        assert!(extract(&tx).is_empty());
    }

    #[test]
    fn test_base64_witness_image() {
        let png = crate::formats::png::PNG_SIGNATURE.repeat(4);
        let mut item = b"xx".to_vec();
        item.extend_from_slice(STANDARD.encode(&png).as_bytes());
        let tx = Transaction::new("t").with_witness(vec![item]);
        let found = extract(&tx);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].data, png);
        assert_eq!(found[0].origin, Origin::Witness { vin: 0, item: 0, offset: 2 });
    }

    #[test]
    fn test_bare_multisig_keys_are_concatenated() {
        let mut image = crate::formats::png::PNG_SIGNATURE.to_vec();
        image.extend_from_slice(&[0x42; 58]);
        let mut script = vec![0x51];
        for key in image.chunks(33) {
            push_bytes(&mut script, key);
        }
        script.extend_from_slice(&[0x52, 0xAE]);
        let tx = Transaction::new("t").with_output(script);
        let found = extract(&tx);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].data, image);
    }
}
