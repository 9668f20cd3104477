//! Ordinal inscription envelopes in taproot script-path witnesses:
//!
//! ```text
//! OP_FALSE OP_IF "ord" OP_1 <content-type> [<tag> <value>]... OP_0 <body>... OP_ENDIF
//! ```

use super::script::{Instruction, Instructions, op_endif, op_if, small_int_value};
use crate::formats::sniff;
use crate::types::{ExtractionMethod, Extracted, Origin, Transaction};
use bitcoincore_rpc::bitcoin::opcodes::all::OP_PUSHBYTES_0;

pub const PROTOCOL_ID: &[u8] = b"ord";
const CONTENT_TYPE_TAG: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn is_image(&self) -> bool {
        if self.body.is_empty() {
            return false;
        }
        let declared = self
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.trim().to_ascii_lowercase().starts_with("image/"));
        declared || sniff(&self.body).is_some()
    }
}

fn envelope_header() -> [u8; 6] {
    [
        OP_PUSHBYTES_0.to_u8(),
        op_if(),
        PROTOCOL_ID.len() as u8,
        PROTOCOL_ID[0],
        PROTOCOL_ID[1],
        PROTOCOL_ID[2],
    ]
}

fn tag_number(ins: Instruction<'_>) -> Option<u8> {
    match ins {
        Instruction::Op(op) => small_int_value(op),
        Instruction::Push([n]) => Some(*n),
        _ => None,
    }
}

/// Parses the instructions following the `ord` marker. Anything short of a
/// closing OP_ENDIF yields `None`.
pub fn parse_envelope(script: &[u8]) -> Option<Envelope> {
    let mut instructions = Instructions::new(script);
    let mut envelope = Envelope::default();

    loop {
        let (_, ins) = instructions.next()?.ok()?;
        match ins {
            Instruction::Push([]) => break,
            Instruction::Op(op) if op == op_endif() => return None,
            other => {
                let tag = tag_number(other)?;
                let (_, value) = instructions.next()?.ok()?;
                let Instruction::Push(value) = value else {
                    return None;
                };
                if tag == CONTENT_TYPE_TAG && envelope.content_type.is_none() {
                    envelope.content_type = Some(String::from_utf8_lossy(value).into_owned());
                }
            }
        }
    }

    loop {
        let (_, ins) = instructions.next()?.ok()?;
        match ins {
            Instruction::Push(data) => envelope.body.extend_from_slice(data),
            Instruction::Op(op) if op == op_endif() => return Some(envelope),
            Instruction::Op(_) => return None,
        }
    }
}

pub fn extract(tx: &Transaction) -> Vec<Extracted> {
    let header = envelope_header();
    let mut found = Vec::new();

    for (vin, input) in tx.inputs.iter().enumerate() {
        for (item_idx, item) in input.witness.iter().enumerate() {
            let mut search = 0usize;
            while let Some(rel) = item[search..]
                .windows(header.len())
                .position(|w| w == header)
            {
                let start = search + rel;
                search = start + header.len();

                let Some(envelope) = parse_envelope(&item[search..]) else {
                    continue;
                };
                if !envelope.is_image() {
                    continue;
                }
                found.push(Extracted {
                    data: envelope.body,
                    method: ExtractionMethod::Inscription,
                    origin: Origin::Witness {
                        vin: vin as u32,
                        item: item_idx as u32,
                        offset: start,
                    },
                    content_type: envelope.content_type,
                });
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::script::{MAX_SCRIPT_ELEMENT_SIZE, push_bytes};

    fn inscription_script(content_type: &[u8], body: &[u8]) -> Vec<u8> {
        let mut script = vec![0x20];
        script.extend_from_slice(&[0x11; 32]);
        script.push(0xAC);
        script.extend_from_slice(&envelope_header());
        script.push(0x51);
        push_bytes(&mut script, content_type);
        script.push(0x00);
        for chunk in body.chunks(MAX_SCRIPT_ELEMENT_SIZE) {
            push_bytes(&mut script, chunk);
        }
        script.push(0x68);
        script
    }

    #[test]
    fn test_body_split_across_pushes_is_reassembled() {
        let mut body = crate::formats::png::PNG_SIGNATURE.to_vec();
        body.extend((0..1200u32).map(|i| i as u8));
        let script = inscription_script(b"image/png", &body);
        let tx = Transaction::new("aa").with_witness(vec![vec![0x01; 64], script, vec![0xC0; 33]]);

        let found = extract(&tx);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].data, body);
        assert_eq!(found[0].content_type.as_deref(), Some("image/png"));
        assert!(matches!(found[0].origin, Origin::Witness { vin: 0, item: 1, offset: 34 }));
    }

    #[test]
    fn test_missing_endif_yields_nothing() {
        let mut script = inscription_script(b"image/png", &[0x89, 0x50, 0x4E, 0x47]);
        script.pop();
        let tx = Transaction::new("bb").with_witness(vec![script]);
        assert!(extract(&tx).is_empty());
    }

    #[test]
    fn test_text_inscription_is_ignored() {
        let script = inscription_script(b"text/plain;charset=utf-8", b"hello world");
        let tx = Transaction::new("cc").with_witness(vec![script]);
        assert!(extract(&tx).is_empty());
    }

    #[test]
    fn test_unlabelled_body_with_image_magic_is_kept() {
        let body = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10];
        let script = inscription_script(b"application/octet-stream", &body);
        let tx = Transaction::new("dd").with_witness(vec![script]);
        assert_eq!(extract(&tx).len(), 1);
    }
}
