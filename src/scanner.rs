//! Block catch-up and mempool polling.
//!
//! A block is processed as one unit: fetch, extract, evaluate, commit to the
//! index, then advance and persist the cursor. A crash anywhere in between
//! leaves the cursor on the previous block, and redoing the block is harmless
//! because index writes are keyed by content hash.

use crate::config::Config;
use crate::cursor::ScanCursor;
use crate::error::{RpcError, ScanError};
use crate::extraction::Dispatcher;
use crate::index::{ImageIndex, ImageRecord, THUMBS_DIR};
use crate::pipeline::{self, Pipeline, Tally};
use crate::rpc::{LedgerRpc, RetryPolicy, with_retry};
use crate::thumbnail::{CommandPresenter, ImageThumbnailer, NoopPresenter, Presenter, Thumbnailer};
use crate::types::{BlockRef, Transaction};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    Upstream(String),
    IndexWrite(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => f.write_str("stop requested"),
            StopReason::Upstream(msg) => write!(f, "upstream unavailable: {msg}"),
            StopReason::IndexWrite(msg) => write!(f, "index write failed: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    CatchingUpBlocks,
    PollingMempool,
    Stopped(StopReason),
}

impl ScanState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, ScanState::Stopped(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub blocks: u64,
    pub transactions: u64,
    pub mempool_transactions: u64,
    pub images: Tally,
    /// Chain tip observed when the pass started.
    pub tip: Option<u64>,
}

impl PassSummary {
    fn log(&self, label: &'static str) {
        info!(
            pass = label,
            blocks = self.blocks,
            transactions = self.transactions,
            mempool_transactions = self.mempool_transactions,
            candidates = self.images.candidates,
            accepted = self.images.accepted,
            known = self.images.known,
            repaired = self.images.repaired,
            repair_failures = self.images.repair_failures,
            discarded = self.images.discarded,
            "pass summary"
        );
        if self.images.repair_failures > 0 {
            warn!(
                pass = label,
                repair_failures = self.images.repair_failures,
                kept = self.images.kept_invalid,
                "some candidates could not be repaired"
            );
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub start_height: Option<u64>,
    pub poll_interval: Duration,
    pub retry: RetryPolicy,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            start_height: None,
            poll_interval: Duration::from_secs(2),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&Config> for ScanOptions {
    fn from(config: &Config) -> Self {
        Self {
            start_height: config.scan.start_height,
            poll_interval: config.poll_interval(),
            retry: config.retry_policy(),
        }
    }
}

pub struct Scanner<R: LedgerRpc> {
    rpc: R,
    index: ImageIndex,
    cursor: ScanCursor,
    dispatcher: Dispatcher,
    pipeline: Pipeline,
    options: ScanOptions,
    thumbnailer: Option<Box<dyn Thumbnailer>>,
    presenter: Box<dyn Presenter>,
    state: ScanState,
    stop: Arc<AtomicBool>,
    failure: Option<ScanError>,
    summary: PassSummary,
}

impl<R: LedgerRpc> Scanner<R> {
    pub fn new(rpc: R, index: ImageIndex, cursor: ScanCursor) -> Self {
        Self {
            rpc,
            index,
            cursor,
            dispatcher: Dispatcher::default(),
            pipeline: Pipeline::default(),
            options: ScanOptions::default(),
            thumbnailer: None,
            presenter: Box::new(NoopPresenter),
            state: ScanState::Idle,
            stop: Arc::new(AtomicBool::new(false)),
            failure: None,
            summary: PassSummary::default(),
        }
    }

    /// Opens the index and cursor under `config.data_dir` and wires every
    /// collaborator the configuration asks for.
    pub fn from_config(rpc: R, config: &Config) -> Result<Self, ScanError> {
        let index = ImageIndex::open(&config.data_dir)?;
        let cursor = ScanCursor::load(&config.data_dir, config.scan.mempool_seen_capacity)?;
        let pipeline = Pipeline::new(config.validation_config())
            .with_auto_repair(config.repair.auto_repair)
            .with_force_save_invalid(config.repair.force_save_invalid);

        let mut scanner = Self::new(rpc, index, cursor)
            .with_options(ScanOptions::from(config))
            .with_dispatcher(Dispatcher::new(config.dispatch_filters()))
            .with_pipeline(pipeline);
        if config.output.auto_thumbnail {
            scanner = scanner.with_thumbnailer(Box::new(ImageThumbnailer::new(
                config.output.thumbnail_edge,
            )));
        }
        if let Some(presenter) = config.output.viewer.as_deref().and_then(CommandPresenter::new) {
            scanner = scanner.with_presenter(Box::new(presenter));
        }
        Ok(scanner)
    }

    pub fn with_options(mut self, options: ScanOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_pipeline(mut self, pipeline: Pipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_thumbnailer(mut self, thumbnailer: Box<dyn Thumbnailer>) -> Self {
        self.thumbnailer = Some(thumbnailer);
        self
    }

    pub fn with_presenter(mut self, presenter: Box<dyn Presenter>) -> Self {
        self.presenter = presenter;
        self
    }

    pub fn state(&self) -> &ScanState {
        &self.state
    }

    pub fn cursor(&self) -> &ScanCursor {
        &self.cursor
    }

    pub fn index(&self) -> &ImageIndex {
        &self.index
    }

    pub fn rpc(&self) -> &R {
        &self.rpc
    }

    pub fn summary(&self) -> &PassSummary {
        &self.summary
    }

    /// Shared flag a signal handler can set. The in-flight block finishes
    /// before the scanner halts.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    fn call<T>(
        &self,
        operation: &'static str,
        f: impl FnMut() -> Result<T, RpcError>,
    ) -> Result<T, ScanError> {
        with_retry(&self.options.retry, operation, f)
            .map_err(|source| ScanError::UpstreamUnavailable { operation, source })
    }

    fn halt(&mut self, err: &ScanError) {
        let reason = match err {
            ScanError::UpstreamUnavailable { .. } => StopReason::Upstream(err.to_string()),
            ScanError::IndexWriteFailure(_) => StopReason::IndexWrite(err.to_string()),
            ScanError::StopRequested => StopReason::Requested,
        };
        if reason != StopReason::Requested {
            error!(error = %err, last_height = ?self.cursor.last_height(), "scanner stopped");
        }
        self.state = ScanState::Stopped(reason);
    }

    /// Advances the state machine by one transition.
    pub fn step(&mut self) -> &ScanState {
        if self.state.is_stopped() {
            return &self.state;
        }
        if self.stop_requested() {
            self.summary.log("final");
            self.state = ScanState::Stopped(StopReason::Requested);
            return &self.state;
        }

        let result = match self.state {
            ScanState::Idle => {
                info!(last_height = ?self.cursor.last_height(), "scanner starting");
                self.state = ScanState::CatchingUpBlocks;
                Ok(())
            }
            ScanState::CatchingUpBlocks => self.catch_up_one(),
            ScanState::PollingMempool => self.poll_once(),
            ScanState::Stopped(_) => Ok(()),
        };
        if let Err(err) = result {
            self.halt(&err);
            if !matches!(err, ScanError::StopRequested) {
                self.failure = Some(err);
            }
        }
        &self.state
    }

    fn catch_up_one(&mut self) -> Result<(), ScanError> {
        let tip = self.call("getblockcount", || self.rpc.block_count())?;
        self.summary.tip = Some(tip);
        let next = self.cursor.next_height(self.options.start_height, tip);
        if next > tip {
            self.summary.log("catch-up");
            self.state = ScanState::PollingMempool;
            return Ok(());
        }
        self.process_block(next)?;
        self.commit_cursor(next)
    }

    fn poll_once(&mut self) -> Result<(), ScanError> {
        let tip = self.call("getblockcount", || self.rpc.block_count())?;
        if self.cursor.next_height(self.options.start_height, tip) <= tip {
            debug!(tip, "new block while polling");
            self.state = ScanState::CatchingUpBlocks;
            return Ok(());
        }
        self.poll_mempool()?;
        self.sleep(self.options.poll_interval);
        Ok(())
    }

    /// Steps until the scanner stops. A requested stop is a clean exit.
    pub fn run(&mut self) -> Result<PassSummary, ScanError> {
        while !self.step().is_stopped() {}
        match self.failure.take() {
            Some(err) => Err(err),
            None => Ok(self.summary),
        }
    }

    /// Catches up to the tip observed at the start of the pass, then returns
    /// without polling the mempool.
    pub fn run_pass(&mut self) -> Result<PassSummary, ScanError> {
        self.summary = PassSummary::default();
        let result = self.catch_up_to_tip();
        self.summary.log("batch");
        match result {
            Ok(()) => Ok(self.summary),
            Err(err) => {
                self.halt(&err);
                Err(err)
            }
        }
    }

    fn catch_up_to_tip(&mut self) -> Result<(), ScanError> {
        let tip = self.call("getblockcount", || self.rpc.block_count())?;
        self.summary.tip = Some(tip);
        let mut next = self.cursor.next_height(self.options.start_height, tip);
        while next <= tip {
            if self.stop_requested() {
                return Err(ScanError::StopRequested);
            }
            self.process_block(next)?;
            self.commit_cursor(next)?;
            next += 1;
        }
        Ok(())
    }

    /// Processes `start..=end` every `step` blocks without moving the cursor.
    pub fn scan_range(&mut self, start: u64, end: u64, step: u64) -> Result<PassSummary, ScanError> {
        self.summary = PassSummary::default();
        for height in (start..=end).step_by(step.max(1) as usize) {
            if self.stop_requested() {
                info!(height, "range scan interrupted");
                break;
            }
            self.process_block(height)?;
        }
        self.summary.log("range");
        Ok(self.summary)
    }

    /// Fetches and processes one transaction, then returns every record it
    /// contributed to.
    pub fn scan_transaction(&mut self, txid: &str) -> Result<Vec<ImageRecord>, ScanError> {
        let tx = self.call("getrawtransaction", || self.rpc.raw_transaction(txid))?;
        let block = match self.call("gettransactionheight", || self.rpc.transaction_height(txid)) {
            Ok(Some(height)) => BlockRef::Height(height),
            Ok(None) => BlockRef::Unconfirmed,
            Err(err) => {
                warn!(txid, error = %err, "cannot resolve transaction height");
                BlockRef::Unconfirmed
            }
        };
        self.process_transactions(std::slice::from_ref(&tx), block)?;
        Ok(self.index.by_txid(txid))
    }

    fn process_block(&mut self, height: u64) -> Result<(), ScanError> {
        let hash = self.call("getblockhash", || self.rpc.block_hash(height))?;
        let txs = self.call("getblock", || self.rpc.block(&hash))?;
        let before = self.summary.images;
        self.process_transactions(&txs, BlockRef::Height(height))?;

        self.summary.blocks += 1;
        self.summary.transactions += txs.len() as u64;
        info!(
            height,
            txs = txs.len(),
            candidates = self.summary.images.candidates - before.candidates,
            accepted = self.summary.images.accepted - before.accepted,
            "block committed"
        );
        Ok(())
    }

    fn commit_cursor(&mut self, height: u64) -> Result<(), ScanError> {
        if self.cursor.advance(height) {
            self.cursor.save()?;
        }
        Ok(())
    }

    fn process_transactions(&mut self, txs: &[Transaction], block: BlockRef) -> Result<(), ScanError> {
        let candidates = self.dispatcher.dispatch_all(txs, block);
        if candidates.is_empty() {
            return Ok(());
        }
        let evaluations = self.pipeline.evaluate_all(&candidates, &self.index);
        for evaluation in &evaluations {
            self.summary.images.observe(evaluation);
        }
        let committed = pipeline::commit(&self.index, evaluations)?;
        self.after_commit(&committed.created);
        Ok(())
    }

    fn poll_mempool(&mut self) -> Result<(), ScanError> {
        let listed = self.call("getrawmempool", || self.rpc.raw_mempool())?;
        let remembered = self.cursor.seen_len();
        let fresh = self.cursor.reconcile_mempool(&listed);
        if fresh.is_empty() {
            if self.cursor.seen_len() != remembered {
                self.cursor.save()?;
            }
            return Ok(());
        }

        let mut txs = Vec::with_capacity(fresh.len());
        for txid in &fresh {
            match with_retry(&self.options.retry, "getrawtransaction", || {
                self.rpc.raw_transaction(txid)
            }) {
                Ok(tx) => txs.push(tx),
                Err(RpcError::NotFound(_)) => {
                    warn!(txid = %txid, "mempool transaction vanished before fetch");
                }
                Err(source) => {
                    return Err(ScanError::UpstreamUnavailable {
                        operation: "getrawtransaction",
                        source,
                    });
                }
            }
        }

        self.process_transactions(&txs, BlockRef::Unconfirmed)?;
        self.summary.mempool_transactions += txs.len() as u64;
        for txid in &fresh {
            self.cursor.mark_seen(txid);
        }
        self.cursor.save()?;
        debug!(fresh = fresh.len(), fetched = txs.len(), "mempool polled");
        Ok(())
    }

    fn sleep(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while !self.stop_requested() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    fn after_commit(&self, created: &[ImageRecord]) {
        for record in created {
            let Some(format) = record.format else {
                continue;
            };
            let data = match self.index.read_payload(record) {
                Ok(data) => data,
                Err(err) => {
                    warn!(hash = %record.hash, error = %err, "cannot reread payload");
                    continue;
                }
            };

            if let Some(thumbnailer) = &self.thumbnailer {
                match thumbnailer.generate(&record.hash, &data, format, &self.index.thumbs_dir()) {
                    Ok(path) => {
                        let stored = path
                            .file_name()
                            .map(|name| Path::new(THUMBS_DIR).join(name))
                            .unwrap_or(path);
                        if let Err(err) = self.index.set_thumbnail(&record.hash, stored) {
                            warn!(hash = %record.hash, error = %err, "cannot record thumbnail");
                        }
                    }
                    Err(err) => warn!(hash = %record.hash, error = %err, "thumbnail failed"),
                }
            }

            if let Err(err) = self.presenter.present(&data, format) {
                warn!(hash = %record.hash, error = %err, "display failed");
            }
        }
    }
}
