use super::script::{is_op_return, pushes};
use crate::formats::sniff;
use crate::types::{ExtractionMethod, Extracted, Origin, Transaction};
use std::collections::BTreeMap;

pub const PART_PREFIX: &[u8] = b"IMG_PART_";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartHeader<'a> {
    pub id: &'a str,
    pub part: usize,
    pub total: usize,
    pub data: &'a [u8],
}

fn take_while<'a>(data: &'a [u8], pred: impl Fn(u8) -> bool) -> (&'a [u8], &'a [u8]) {
    let n = data.iter().position(|&b| !pred(b)).unwrap_or(data.len());
    data.split_at(n)
}

/// `IMG_PART_<hex id>_<part>_<total>` followed by one separator byte, then
/// the part's bytes. Parts are numbered from 1.
pub fn parse_part(chunk: &[u8]) -> Option<PartHeader<'_>> {
    let rest = chunk.strip_prefix(PART_PREFIX)?;
    let (id, rest) = take_while(rest, |b| b.is_ascii_hexdigit());
    let rest = rest.strip_prefix(b"_")?;
    let (part, rest) = take_while(rest, |b| b.is_ascii_digit());
    let rest = rest.strip_prefix(b"_")?;
    let (total, rest) = take_while(rest, |b| b.is_ascii_digit());

    let id = std::str::from_utf8(id).ok().filter(|s| !s.is_empty())?;
    let part: usize = std::str::from_utf8(part).ok()?.parse().ok()?;
    let total: usize = std::str::from_utf8(total).ok()?.parse().ok()?;
    if part == 0 || total == 0 || part > total {
        return None;
    }

    Some(PartHeader {
        id,
        part,
        total,
        data: rest.get(1..).unwrap_or_default(),
    })
}

fn reassemble_parts(chunks: &[Vec<u8>]) -> Option<Vec<u8>> {
    let mut groups: BTreeMap<&str, (usize, BTreeMap<usize, &[u8]>)> = BTreeMap::new();
    for chunk in chunks {
        if let Some(part) = parse_part(chunk) {
            let entry = groups.entry(part.id).or_insert_with(|| (part.total, BTreeMap::new()));
            entry.1.entry(part.part).or_insert(part.data);
        }
    }

    groups
        .into_values()
        .find(|(total, parts)| parts.len() == *total)
        .map(|(_, parts)| parts.into_values().flatten().copied().collect())
}

pub fn extract(tx: &Transaction) -> Vec<Extracted> {
    let mut first_vout = None;
    let mut chunks: Vec<Vec<u8>> = Vec::new();

    for (vout, output) in tx.outputs.iter().enumerate() {
        if !is_op_return(&output.script) {
            continue;
        }
        let chunk: Vec<u8> = pushes(&output.script[1..])
            .flat_map(|(_, data)| data.iter().copied())
            .collect();
        if chunk.is_empty() {
            continue;
        }
        first_vout.get_or_insert(vout);
        chunks.push(chunk);
    }

    let Some(vout) = first_vout else {
        return Vec::new();
    };

    let payload = reassemble_parts(&chunks).unwrap_or_else(|| chunks.concat());
    if sniff(&payload).is_none() {
        return Vec::new();
    }

    vec![Extracted::new(
        payload,
        ExtractionMethod::OpReturn,
        Origin::Output {
            vout: vout as u32,
            offset: 1,
        },
    )]
}
