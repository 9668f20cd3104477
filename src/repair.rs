use crate::formats::jpeg::balanced_counts;
use crate::formats::{Defect, DefectKind};
use crate::validation::{ImageValidator, Verdict};
use std::borrow::Cow;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome<'a> {
    /// Bytes that validate cleanly. Borrowed when nothing needed fixing.
    Valid {
        data: Cow<'a, [u8]>,
        applied: Vec<DefectKind>,
    },
    StillInvalid {
        original: &'a [u8],
        reason: String,
    },
}

impl RepairOutcome<'_> {
    pub fn is_valid(&self) -> bool {
        matches!(self, RepairOutcome::Valid { .. })
    }
}

fn patch_u32_le(data: &mut [u8], offset: usize, value: u32) -> Option<()> {
    data.get_mut(offset..offset + 4)?
        .copy_from_slice(&value.to_le_bytes());
    Some(())
}

/// Applies every defect of one kind to `data`. All fixes of a kind are either
/// same-length patches or a single tail rewrite, so offsets stay valid.
fn apply_kind(kind: DefectKind, defects: &[Defect], data: &[u8]) -> Option<Vec<u8>> {
    let mut out = data.to_vec();
    for defect in defects.iter().filter(|d| d.kind() == kind) {
        match *defect {
            Defect::TruncatedTail { keep, seal } => {
                out.truncate(keep);
                out.extend_from_slice(seal);
            }
            Defect::MissingTerminator { seal } => out.extend_from_slice(seal),
            Defect::TrailingData { end } => out.truncate(end),
            Defect::HuffmanOversubscribed { offset, symbols }
            | Defect::HuffmanUndersubscribed { offset, symbols } => {
                let counts = balanced_counts(symbols)?;
                out.get_mut(offset..offset + counts.len())?
                    .copy_from_slice(&counts);
            }
            Defect::LengthFieldMismatch { offset, actual, .. } => {
                patch_u32_le(&mut out, offset, actual)?;
            }
            Defect::ChunkCrcMismatch { offset, computed } => {
                out.get_mut(offset..offset + 4)?
                    .copy_from_slice(&computed.to_be_bytes());
            }
            Defect::ShortPixelData { missing } => {
                out.resize(out.len() + missing, 0);
            }
        }
    }
    Some(out)
}

pub struct RepairEngine<'v> {
    validator: &'v ImageValidator,
}

impl<'v> RepairEngine<'v> {
    pub fn new(validator: &'v ImageValidator) -> Self {
        Self { validator }
    }

    /// Fix-then-revalidate, trying each defect kind at most once.
    pub fn repair<'a>(&self, data: &'a [u8]) -> RepairOutcome<'a> {
        let mut current: Cow<'a, [u8]> = Cow::Borrowed(data);
        let mut applied: Vec<DefectKind> = Vec::new();

        loop {
            let validation = self.validator.validate(&current);
            let defects = match validation.verdict {
                Verdict::Valid => {
                    return RepairOutcome::Valid {
                        data: current,
                        applied,
                    };
                }
                Verdict::Invalid { reason } => {
                    let reason = if applied.is_empty() {
                        reason
                    } else {
                        format!("{reason} (after repairing {applied:?})")
                    };
                    return RepairOutcome::StillInvalid {
                        original: data,
                        reason,
                    };
                }
                Verdict::RepairableCorruption { reason } => reason,
            };

            let Some(kind) = defects
                .iter()
                .map(Defect::kind)
                .find(|kind| !applied.contains(kind))
            else {
                return RepairOutcome::StillInvalid {
                    original: data,
                    reason: format!("defects persist after repairing {applied:?}"),
                };
            };

            applied.push(kind);
            match apply_kind(kind, &defects, &current) {
                Some(fixed) => {
                    debug!(?kind, before = current.len(), after = fixed.len(), "applied repair");
                    current = Cow::Owned(fixed);
                }
                None => {
                    return RepairOutcome::StillInvalid {
                        original: data,
                        reason: format!("cannot apply {kind:?} repair"),
                    };
                }
            }
        }
    }
}
