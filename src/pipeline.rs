use crate::error::IndexError;
use crate::formats::sniff;
use crate::index::{ImageIndex, ImageRecord, NewImage, Provenance, Validity};
use crate::repair::{RepairEngine, RepairOutcome};
use crate::types::Candidate;
use crate::validation::{ImageValidator, ValidationConfig, Verdict};
use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

/// What the pipeline decided for one candidate.
#[derive(Debug, Clone)]
pub enum Evaluation {
    /// Bytes already indexed, directly or as the original of a repaired
    /// record. Only provenance needs adding.
    Known {
        hash: String,
        provenance: Vec<Provenance>,
        seen: DateTime<Utc>,
    },
    Accept {
        image: NewImage,
        repair_failed: bool,
    },
    Discard {
        digest: String,
        reason: String,
        repair_failed: bool,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub candidates: u64,
    pub known: u64,
    pub accepted: u64,
    pub repaired: u64,
    pub repair_failures: u64,
    pub kept_invalid: u64,
    pub discarded: u64,
}

impl Tally {
    pub fn observe(&mut self, evaluation: &Evaluation) {
        self.candidates += 1;
        match evaluation {
            Evaluation::Known { .. } => self.known += 1,
            Evaluation::Accept {
                image,
                repair_failed,
            } => {
                self.accepted += 1;
                match image.validity {
                    Validity::Repaired => self.repaired += 1,
                    Validity::KeptInvalidForResearch => self.kept_invalid += 1,
                    Validity::OriginalValid => {}
                }
                if *repair_failed {
                    self.repair_failures += 1;
                }
            }
            Evaluation::Discard { repair_failed, .. } => {
                self.discarded += 1;
                if *repair_failed {
                    self.repair_failures += 1;
                }
            }
        }
    }

    pub fn merge(&mut self, other: &Tally) {
        self.candidates += other.candidates;
        self.known += other.known;
        self.accepted += other.accepted;
        self.repaired += other.repaired;
        self.repair_failures += other.repair_failures;
        self.kept_invalid += other.kept_invalid;
        self.discarded += other.discarded;
    }
}

#[derive(Debug, Default)]
pub struct Committed {
    pub created: Vec<ImageRecord>,
    pub updated: usize,
}

pub fn provenance_of(candidate: &Candidate) -> Vec<Provenance> {
    candidate
        .sources
        .iter()
        .map(|source| Provenance {
            method: source.method,
            txid: candidate.txid.clone(),
            block: candidate.block,
            origin: source.origin,
        })
        .collect()
}

/// Validation, repair and the keep/discard decision between the dispatcher
/// and the index.
pub struct Pipeline {
    validator: ImageValidator,
    auto_repair: bool,
    force_save_invalid: bool,
}

impl Pipeline {
    pub fn new(config: ValidationConfig) -> Self {
        Self {
            validator: ImageValidator::new(config),
            auto_repair: true,
            force_save_invalid: false,
        }
    }

    pub fn with_auto_repair(mut self, enabled: bool) -> Self {
        self.auto_repair = enabled;
        self
    }

    pub fn with_force_save_invalid(mut self, enabled: bool) -> Self {
        self.force_save_invalid = enabled;
        self
    }

    pub fn validator(&self) -> &ImageValidator {
        &self.validator
    }

    pub fn evaluate(&self, candidate: &Candidate, index: &ImageIndex) -> Evaluation {
        let provenance = provenance_of(candidate);

        if let Some(hash) = index.resolve(&candidate.digest) {
            debug!(txid = %candidate.txid, %hash, "candidate already indexed");
            return Evaluation::Known {
                hash,
                provenance,
                seen: candidate.discovered,
            };
        }

        let validation = self.validator.validate(&candidate.data);
        debug!(
            txid = %candidate.txid,
            format = validation.format_name(),
            verdict = validation.verdict.label(),
            confidence = validation.confidence,
            size = candidate.data.len(),
            "candidate validated"
        );

        let accept = |data: Vec<u8>, validity: Validity, original_hash: Option<String>| {
            NewImage {
                format: sniff(&data).or(validation.format),
                data,
                validity,
                provenance: provenance.clone(),
                content_type: candidate.content_type.clone(),
                seen: candidate.discovered,
                original_hash,
            }
        };

        match &validation.verdict {
            Verdict::Valid => Evaluation::Accept {
                image: accept(candidate.data.clone(), Validity::OriginalValid, None),
                repair_failed: false,
            },
            Verdict::RepairableCorruption { .. } if self.auto_repair => {
                match RepairEngine::new(&self.validator).repair(&candidate.data) {
                    RepairOutcome::Valid { data, applied } => {
                        debug!(txid = %candidate.txid, ?applied, "candidate repaired");
                        Evaluation::Accept {
                            image: accept(
                                data.into_owned(),
                                Validity::Repaired,
                                Some(candidate.digest.clone()),
                            ),
                            repair_failed: false,
                        }
                    }
                    RepairOutcome::StillInvalid { reason, .. } => {
                        warn!(txid = %candidate.txid, %reason, "repair failed");
                        self.keep_or_discard(candidate, accept, reason, true)
                    }
                }
            }
            verdict => {
                let reason = verdict.to_string();
                self.keep_or_discard(candidate, accept, reason, false)
            }
        }
    }

    fn keep_or_discard(
        &self,
        candidate: &Candidate,
        accept: impl Fn(Vec<u8>, Validity, Option<String>) -> NewImage,
        reason: String,
        repair_failed: bool,
    ) -> Evaluation {
        if self.force_save_invalid {
            return Evaluation::Accept {
                image: accept(candidate.data.clone(), Validity::KeptInvalidForResearch, None),
                repair_failed,
            };
        }
        debug!(txid = %candidate.txid, %reason, "candidate discarded");
        Evaluation::Discard {
            digest: candidate.digest.clone(),
            reason,
            repair_failed,
        }
    }

    pub fn evaluate_all(&self, candidates: &[Candidate], index: &ImageIndex) -> Vec<Evaluation> {
        candidates
            .par_iter()
            .map(|candidate| self.evaluate(candidate, index))
            .collect()
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(ValidationConfig::default())
    }
}

/// Writes a batch of evaluations to the index: new images in one publish,
/// then provenance for already-known ones.
pub fn commit(index: &ImageIndex, evaluations: Vec<Evaluation>) -> Result<Committed, IndexError> {
    let mut images = Vec::new();
    let mut known = Vec::new();
    for evaluation in evaluations {
        match evaluation {
            Evaluation::Accept { image, .. } => images.push(image),
            Evaluation::Known {
                hash,
                provenance,
                seen,
            } => known.push((hash, provenance, seen)),
            Evaluation::Discard { .. } => {}
        }
    }

    let mut committed = Committed::default();
    for upserted in index.upsert_all(images)? {
        if upserted.created {
            info!(
                hash = %upserted.record.hash,
                format = upserted.record.format_name(),
                size = upserted.record.size,
                validity = upserted.record.validity.name(),
                "image indexed"
            );
            committed.created.push(upserted.record);
        } else {
            committed.updated += 1;
        }
    }
    for (hash, provenance, seen) in known {
        index.attach(&hash, provenance, seen)?;
        committed.updated += 1;
    }
    Ok(committed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockRef, ExtractionMethod, Origin, Source, sha256_hex};

    fn candidate(data: &[u8]) -> Candidate {
        Candidate {
            data: data.to_vec(),
            digest: sha256_hex(data),
            txid: "aa".repeat(32),
            block: BlockRef::Height(10),
            sources: vec![Source {
                method: ExtractionMethod::CorruptedOutput,
                origin: Origin::Output { vout: 0, offset: 3 },
            }],
            content_type: None,
            discovered: Utc::now(),
        }
    }

    fn broken_png() -> Vec<u8> {
        let mut data = b"\x89PNG\r\n\x1a\n".to_vec();
        data.extend_from_slice(b"not a chunk stream");
        data
    }

    #[test]
    fn test_invalid_candidate_is_discarded_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let index = ImageIndex::open(dir.path()).unwrap();
        let evaluation = Pipeline::default().evaluate(&candidate(&broken_png()), &index);
        assert!(matches!(evaluation, Evaluation::Discard { .. }));
    }

    #[test]
    fn test_force_save_keeps_invalid_for_research() {
        let dir = tempfile::tempdir().unwrap();
        let index = ImageIndex::open(dir.path()).unwrap();
        let pipeline = Pipeline::default().with_force_save_invalid(true);
        let evaluation = pipeline.evaluate(&candidate(&broken_png()), &index);

        let mut tally = Tally::default();
        tally.observe(&evaluation);
        assert_eq!(tally.kept_invalid, 1);

        let committed = commit(&index, vec![evaluation]).unwrap();
        assert_eq!(committed.created.len(), 1);
        assert_eq!(
            committed.created[0].validity,
            Validity::KeptInvalidForResearch
        );
    }

    #[test]
    fn test_indexed_bytes_take_the_fast_path() {
        let dir = tempfile::tempdir().unwrap();
        let index = ImageIndex::open(dir.path()).unwrap();
        let pipeline = Pipeline::default().with_force_save_invalid(true);
        let first = pipeline.evaluate(&candidate(&broken_png()), &index);
        commit(&index, vec![first]).unwrap();

        let mut again = candidate(&broken_png());
        again.txid = "bb".repeat(32);
        let evaluation = pipeline.evaluate(&again, &index);
        assert!(matches!(evaluation, Evaluation::Known { .. }));

        let committed = commit(&index, vec![evaluation]).unwrap();
        assert_eq!(committed.updated, 1);
        assert_eq!(index.records()[0].provenance.len(), 2);
    }
}
