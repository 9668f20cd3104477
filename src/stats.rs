use crate::index::ImageRecord;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SizeStats {
    pub total: u64,
    pub min: u64,
    pub max: u64,
    pub avg: f64,
}

/// Summary of the index contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    pub images: usize,
    pub transactions: usize,
    pub blocks: usize,
    pub size: SizeStats,
    pub by_format: BTreeMap<String, usize>,
    /// A record counts once under every method that found it.
    pub by_method: BTreeMap<String, usize>,
    /// `block` once any provenance is confirmed, `mempool` otherwise.
    pub by_source: BTreeMap<String, usize>,
    pub by_validity: BTreeMap<String, usize>,
    /// Keyed by first-seen month, `YYYY-MM`.
    pub by_month: BTreeMap<String, usize>,
}

impl Stats {
    pub fn from_records(records: &[ImageRecord]) -> Self {
        let mut stats = Self {
            images: records.len(),
            ..Self::default()
        };
        let mut txids = BTreeSet::new();
        let mut heights = BTreeSet::new();

        for record in records {
            let size = record.size as u64;
            stats.size.total += size;
            stats.size.max = stats.size.max.max(size);
            stats.size.min = if stats.size.min == 0 {
                size
            } else {
                stats.size.min.min(size)
            };

            *stats.by_format.entry(record.format_name().to_string()).or_default() += 1;
            *stats
                .by_validity
                .entry(record.validity.name().to_string())
                .or_default() += 1;
            *stats
                .by_month
                .entry(record.first_seen.format("%Y-%m").to_string())
                .or_default() += 1;

            let methods: BTreeSet<_> = record.methods().collect();
            for method in methods {
                *stats.by_method.entry(method.name().to_string()).or_default() += 1;
            }

            let source = if record.heights().next().is_some() {
                "block"
            } else {
                "mempool"
            };
            *stats.by_source.entry(source.to_string()).or_default() += 1;

            txids.extend(record.provenance.iter().map(|p| p.txid.as_str()));
            heights.extend(record.heights());
        }

        stats.transactions = txids.len();
        stats.blocks = heights.len();
        if stats.images > 0 {
            stats.size.avg = stats.size.total as f64 / stats.images as f64;
        }
        stats
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "images:        {}", self.images);
        let _ = writeln!(out, "transactions:  {}", self.transactions);
        let _ = writeln!(out, "blocks:        {}", self.blocks);
        let _ = writeln!(
            out,
            "bytes:         {} total, {} min, {} max, {:.1} avg",
            self.size.total, self.size.min, self.size.max, self.size.avg
        );

        for (title, counts) in [
            ("format", &self.by_format),
            ("method", &self.by_method),
            ("source", &self.by_source),
            ("validity", &self.by_validity),
            ("month", &self.by_month),
        ] {
            if counts.is_empty() {
                continue;
            }
            let _ = writeln!(out, "\nby {title}:");
            for (key, count) in counts {
                let _ = writeln!(out, "  {key:<28} {count}");
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{Provenance, Validity};
    use crate::types::{BlockRef, ExtractionMethod, ImageFormat, Origin};
    use chrono::{TimeZone, Utc};
    use std::path::PathBuf;

    fn record(size: usize, block: BlockRef, methods: &[ExtractionMethod]) -> ImageRecord {
        let seen = Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap();
        ImageRecord {
            hash: format!("{size:064x}"),
            format: Some(ImageFormat::Png),
            size,
            validity: Validity::OriginalValid,
            provenance: methods
                .iter()
                .map(|&method| Provenance {
                    method,
                    txid: "t".repeat(64),
                    block,
                    origin: Origin::Output { vout: 0, offset: 0 },
                })
                .collect(),
            content_type: None,
            path: PathBuf::from("images/x.png"),
            thumbnail: None,
            first_seen: seen,
            last_seen: seen,
            seq: 0,
        }
    }

    #[test]
    fn test_empty_index_stats() {
        let stats = Stats::from_records(&[]);
        assert_eq!(stats.images, 0);
        assert_eq!(stats.size.avg, 0.0);
        assert!(stats.render_text().contains("images:        0"));
    }

    #[test]
    fn test_stats_breakdowns() {
        let records = vec![
            record(
                100,
                BlockRef::Height(5),
                &[ExtractionMethod::OpReturn, ExtractionMethod::CorruptedOutput],
            ),
            record(300, BlockRef::Unconfirmed, &[ExtractionMethod::Inscription]),
        ];
        let stats = Stats::from_records(&records);

        assert_eq!(stats.images, 2);
        assert_eq!(stats.transactions, 1);
        assert_eq!(stats.blocks, 1);
        assert_eq!(stats.size.min, 100);
        assert_eq!(stats.size.max, 300);
        assert_eq!(stats.size.avg, 200.0);
        assert_eq!(stats.by_method["op-return"], 1);
        assert_eq!(stats.by_method["inscription"], 1);
        assert_eq!(stats.by_source["block"], 1);
        assert_eq!(stats.by_source["mempool"], 1);
        assert_eq!(stats.by_month["2024-03"], 2);
        assert_eq!(stats.by_format["png"], 2);
    }
}
