use crate::error::RpcError;
use crate::types::{Transaction, TxInput, TxOutput};
use backoff::ExponentialBackoffBuilder;
use bitcoincore_rpc::bitcoin::{self, BlockHash, Txid};
use bitcoincore_rpc::{Auth, Client, RpcApi, jsonrpc};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const RPC_NOT_FOUND: i32 = -5;
const RPC_OUT_OF_RANGE: i32 = -8;

/// The slice of the node's RPC surface the scanner needs.
pub trait LedgerRpc: Send + Sync {
    fn block_count(&self) -> Result<u64, RpcError>;
    fn block_hash(&self, height: u64) -> Result<String, RpcError>;
    fn block(&self, hash: &str) -> Result<Vec<Transaction>, RpcError>;
    fn raw_mempool(&self) -> Result<Vec<String>, RpcError>;
    fn raw_transaction(&self, txid: &str) -> Result<Transaction, RpcError>;

    /// Height of the block containing `txid`, if the node knows it.
    fn transaction_height(&self, _txid: &str) -> Result<Option<u64>, RpcError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_intervals(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_interval = initial;
        self.max_interval = max.max(initial);
        self
    }
}

/// Runs `call` until it succeeds, fails permanently, or has been tried
/// `policy.max_attempts` times.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    operation: &'static str,
    mut call: impl FnMut() -> Result<T, RpcError>,
) -> Result<T, RpcError> {
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(policy.initial_interval)
        .with_max_interval(policy.max_interval)
        .with_max_elapsed_time(None)
        .build();

    let mut attempts = 0u32;
    let op = || {
        attempts += 1;
        call().map_err(|err| {
            if err.is_transient() && attempts < policy.max_attempts {
                backoff::Error::transient(err)
            } else {
                backoff::Error::permanent(err)
            }
        })
    };

    backoff::retry_notify(backoff, op, |err: RpcError, wait: Duration| {
        warn!(
            operation,
            error = %err,
            retry_after_ms = wait.as_millis() as u64,
            "RPC call failed, retrying"
        );
    })
    .map_err(|e| match e {
        backoff::Error::Permanent(err) => err,
        backoff::Error::Transient { err, .. } => err,
    })
}

impl From<bitcoincore_rpc::Error> for RpcError {
    fn from(err: bitcoincore_rpc::Error) -> Self {
        match &err {
            bitcoincore_rpc::Error::JsonRpc(jsonrpc::Error::Rpc(rpc))
                if rpc.code == RPC_NOT_FOUND || rpc.code == RPC_OUT_OF_RANGE =>
            {
                RpcError::NotFound(rpc.message.clone())
            }
            bitcoincore_rpc::Error::JsonRpc(jsonrpc::Error::Rpc(rpc)) => {
                RpcError::Transport(format!("{} ({})", rpc.message, rpc.code))
            }
            bitcoincore_rpc::Error::JsonRpc(_) | bitcoincore_rpc::Error::Io(_) => {
                RpcError::Transport(err.to_string())
            }
            _ => RpcError::Decode(err.to_string()),
        }
    }
}

pub fn convert_transaction(tx: &bitcoin::Transaction) -> Transaction {
    Transaction {
        txid: tx.compute_txid().to_string(),
        inputs: tx
            .input
            .iter()
            .map(|input| TxInput {
                witness: input.witness.iter().map(<[u8]>::to_vec).collect(),
            })
            .collect(),
        outputs: tx
            .output
            .iter()
            .map(|output| TxOutput {
                script: output.script_pubkey.as_bytes().to_vec(),
            })
            .collect(),
    }
}

#[derive(Debug, Clone)]
pub enum RpcAuth {
    None,
    UserPass { user: String, password: String },
    Cookie(PathBuf),
}

/// [`LedgerRpc`] over a Bitcoin Core JSON-RPC endpoint.
pub struct CoreRpc {
    client: Client,
}

impl CoreRpc {
    pub fn connect(url: &str, auth: RpcAuth) -> Result<Self, RpcError> {
        let auth = match auth {
            RpcAuth::None => Auth::None,
            RpcAuth::UserPass { user, password } => Auth::UserPass(user, password),
            RpcAuth::Cookie(path) => Auth::CookieFile(path),
        };
        let client = Client::new(url, auth)?;
        Ok(Self { client })
    }
}

fn parse_txid(txid: &str) -> Result<Txid, RpcError> {
    Txid::from_str(txid).map_err(|e| RpcError::Decode(format!("bad txid {txid}: {e}")))
}

fn parse_block_hash(hash: &str) -> Result<BlockHash, RpcError> {
    BlockHash::from_str(hash).map_err(|e| RpcError::Decode(format!("bad block hash {hash}: {e}")))
}

impl LedgerRpc for CoreRpc {
    fn block_count(&self) -> Result<u64, RpcError> {
        Ok(self.client.get_block_count()?)
    }

    fn block_hash(&self, height: u64) -> Result<String, RpcError> {
        Ok(self.client.get_block_hash(height)?.to_string())
    }

    fn block(&self, hash: &str) -> Result<Vec<Transaction>, RpcError> {
        let block = self.client.get_block(&parse_block_hash(hash)?)?;
        Ok(block.txdata.iter().map(convert_transaction).collect())
    }

    fn raw_mempool(&self) -> Result<Vec<String>, RpcError> {
        Ok(self
            .client
            .get_raw_mempool()?
            .into_iter()
            .map(|txid| txid.to_string())
            .collect())
    }

    fn raw_transaction(&self, txid: &str) -> Result<Transaction, RpcError> {
        let tx = self.client.get_raw_transaction(&parse_txid(txid)?, None)?;
        Ok(convert_transaction(&tx))
    }

    fn transaction_height(&self, txid: &str) -> Result<Option<u64>, RpcError> {
        let info = self
            .client
            .get_raw_transaction_info(&parse_txid(txid)?, None)?;
        let Some(block_hash) = info.blockhash else {
            return Ok(None);
        };
        let header = self.client.get_block_header_info(&block_hash)?;
        Ok(Some(header.height as u64))
    }
}
