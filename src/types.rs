use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
    Gif,
    Bmp,
    Webp,
}

impl ImageFormat {
    pub const ALL: [ImageFormat; 5] = [
        ImageFormat::Png,
        ImageFormat::Jpeg,
        ImageFormat::Gif,
        ImageFormat::Bmp,
        ImageFormat::Webp,
    ];

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Gif => "gif",
            ImageFormat::Bmp => "bmp",
            ImageFormat::Webp => "webp",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Gif => "gif",
            ImageFormat::Bmp => "bmp",
            ImageFormat::Webp => "webp",
        }
    }

    pub fn mime(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Bmp => "image/bmp",
            ImageFormat::Webp => "image/webp",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpeg" | "jpg" => Ok(ImageFormat::Jpeg),
            "gif" => Ok(ImageFormat::Gif),
            "bmp" => Ok(ImageFormat::Bmp),
            "webp" => Ok(ImageFormat::Webp),
            other => Err(format!("unsupported image format: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionMethod {
    Inscription,
    OpReturn,
    TaprootAnnex,
    CorruptedOutput,
    LegacySegwit,
}

impl ExtractionMethod {
    pub const ALL: [ExtractionMethod; 5] = [
        ExtractionMethod::Inscription,
        ExtractionMethod::OpReturn,
        ExtractionMethod::TaprootAnnex,
        ExtractionMethod::CorruptedOutput,
        ExtractionMethod::LegacySegwit,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ExtractionMethod::Inscription => "inscription",
            ExtractionMethod::OpReturn => "op-return",
            ExtractionMethod::TaprootAnnex => "taproot-annex",
            ExtractionMethod::CorruptedOutput => "corrupted-output",
            ExtractionMethod::LegacySegwit => "legacy-segwit",
        }
    }
}

impl fmt::Display for ExtractionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ExtractionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('_', "-");
        ExtractionMethod::ALL
            .into_iter()
            .find(|m| m.name() == wanted)
            .ok_or_else(|| format!("unknown extraction method: {s}"))
    }
}

/// Where a transaction was seen: in a block at some height, or in the mempool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockRef {
    Height(u64),
    Unconfirmed,
}

impl BlockRef {
    pub fn height(&self) -> Option<u64> {
        match self {
            BlockRef::Height(h) => Some(*h),
            BlockRef::Unconfirmed => None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, BlockRef::Height(_))
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockRef::Height(h) => write!(f, "{h}"),
            BlockRef::Unconfirmed => f.write_str("mempool"),
        }
    }
}

/// Location of a payload's first byte inside the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Origin {
    Output { vout: u32, offset: usize },
    Witness { vin: u32, item: u32, offset: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxInput {
    pub witness: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxOutput {
    pub script: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    pub txid: String,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    pub fn new(txid: impl Into<String>) -> Self {
        Self {
            txid: txid.into(),
            ..Self::default()
        }
    }

    pub fn with_output(mut self, script: Vec<u8>) -> Self {
        self.outputs.push(TxOutput { script });
        self
    }

    pub fn with_witness(mut self, witness: Vec<Vec<u8>>) -> Self {
        self.inputs.push(TxInput { witness });
        self
    }
}

/// Raw bytes produced by one strategy, before the dispatcher stamps them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    pub data: Vec<u8>,
    pub method: ExtractionMethod,
    pub origin: Origin,
    pub content_type: Option<String>,
}

impl Extracted {
    pub fn new(data: Vec<u8>, method: ExtractionMethod, origin: Origin) -> Self {
        Self {
            data,
            method,
            origin,
            content_type: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    pub method: ExtractionMethod,
    pub origin: Origin,
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub data: Vec<u8>,
    pub digest: String,
    pub txid: String,
    pub block: BlockRef,
    pub sources: Vec<Source>,
    pub content_type: Option<String>,
    pub discovered: DateTime<Utc>,
}

impl Candidate {
    pub fn methods(&self) -> impl Iterator<Item = ExtractionMethod> + '_ {
        self.sources.iter().map(|s| s.method)
    }
}

/// Hands out strictly increasing timestamps, even when the wall clock stalls
/// or steps backwards.
#[derive(Debug, Default)]
pub struct DiscoveryClock {
    last_micros: AtomicI64,
}

impl DiscoveryClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> DateTime<Utc> {
        let now = Utc::now().timestamp_micros();
        let mut current = self.last_micros.load(Ordering::Relaxed);
        loop {
            let candidate = now.max(current + 1);
            match self.last_micros.compare_exchange_weak(
                current,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return micros_to_datetime(candidate),
                Err(observed) => current = observed,
            }
        }
    }
}

fn micros_to_datetime(micros: i64) -> DateTime<Utc> {
    Utc.timestamp_micros(micros).single().unwrap_or_else(Utc::now)
}

pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    hex::encode(Sha256::digest(data))
}
