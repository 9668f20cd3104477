pub mod annex;
pub mod corrupted;
pub mod inscription;
pub mod legacy;
pub mod op_return;
pub mod script;

use crate::formats::sniff;
use crate::types::{
    BlockRef, Candidate, DiscoveryClock, ExtractionMethod, Extracted, ImageFormat, Source,
    Transaction, sha256_hex,
};
use rayon::prelude::*;
use std::collections::HashMap;
use tracing::debug;

impl ExtractionMethod {
    pub fn extract(self, tx: &Transaction) -> Vec<Extracted> {
        match self {
            ExtractionMethod::Inscription => inscription::extract(tx),
            ExtractionMethod::OpReturn => op_return::extract(tx),
            ExtractionMethod::TaprootAnnex => annex::extract(tx),
            ExtractionMethod::CorruptedOutput => corrupted::extract(tx),
            ExtractionMethod::LegacySegwit => legacy::extract(tx),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchFilters {
    pub min_size: usize,
    pub allowed_formats: Vec<ImageFormat>,
}

impl Default for DispatchFilters {
    fn default() -> Self {
        Self {
            min_size: 1,
            allowed_formats: ImageFormat::ALL.to_vec(),
        }
    }
}

impl DispatchFilters {
    pub fn with_min_size(mut self, bytes: usize) -> Self {
        self.min_size = bytes;
        self
    }

    pub fn with_allowed_formats(mut self, formats: impl Into<Vec<ImageFormat>>) -> Self {
        self.allowed_formats = formats.into();
        self
    }

    fn admits(&self, data: &[u8]) -> bool {
        if data.len() < self.min_size.max(1) {
            return false;
        }
        match sniff(data) {
            Some(format) => self.allowed_formats.contains(&format),
            None => true,
        }
    }
}

/// Runs every strategy over a transaction and merges what they find.
pub struct Dispatcher {
    filters: DispatchFilters,
    clock: DiscoveryClock,
}

impl Dispatcher {
    pub fn new(filters: DispatchFilters) -> Self {
        Self {
            filters,
            clock: DiscoveryClock::new(),
        }
    }

    pub fn filters(&self) -> &DispatchFilters {
        &self.filters
    }

    pub fn dispatch(&self, tx: &Transaction, block: BlockRef) -> Vec<Candidate> {
        let per_method: Vec<Vec<Extracted>> = ExtractionMethod::ALL
            .par_iter()
            .map(|method| method.extract(tx))
            .collect();

        let mut merged: Vec<Candidate> = Vec::new();
        let mut by_digest: HashMap<String, usize> = HashMap::new();

        for found in per_method.into_iter().flatten() {
            if !self.filters.admits(&found.data) {
                debug!(
                    txid = %tx.txid,
                    method = %found.method,
                    size = found.data.len(),
                    "candidate filtered"
                );
                continue;
            }

            let source = Source {
                method: found.method,
                origin: found.origin,
            };
            let digest = sha256_hex(&found.data);

            if let Some(&idx) = by_digest.get(&digest) {
                let existing = &mut merged[idx];
                if !existing.sources.contains(&source) {
                    existing.sources.push(source);
                }
                if existing.content_type.is_none() {
                    existing.content_type = found.content_type;
                }
                continue;
            }

            by_digest.insert(digest.clone(), merged.len());
            merged.push(Candidate {
                data: found.data,
                digest,
                txid: tx.txid.clone(),
                block,
                sources: vec![source],
                content_type: found.content_type,
                discovered: self.clock.next(),
            });
        }

        merged
    }

    pub fn dispatch_all(&self, txs: &[Transaction], block: BlockRef) -> Vec<Candidate> {
        txs.par_iter()
            .flat_map_iter(|tx| self.dispatch(tx, block))
            .collect()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DispatchFilters::default())
    }
}
