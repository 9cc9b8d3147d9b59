#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

/// Base units per native ledger unit.
pub const BASE_UNITS_PER_UNIT: f64 = 1_000_000_000.0;

#[derive(Debug, Clone, Error)]
pub enum LedgerError {
	#[error("ledger request failed: {0}")]
	Request(String),
	#[error("ledger request timed out")]
	Timeout,
	#[error("ledger returned status {0}")]
	Status(u16),
	#[error("ledger rpc error {code}: {message}")]
	Rpc { code: i64, message: String },
	#[error("malformed ledger response: {0}")]
	Decode(String),
}

/// Balance view of one confirmed transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerTransaction {
	pub signature: String,

	/// Unix seconds; `None` when the ledger did not report one.
	pub block_time: Option<i64>,

	pub failed: bool,
	pub account_keys: Vec<String>,

	/// Balances in base units, index-aligned with `account_keys`.
	pub pre_balances: Vec<u64>,
	pub post_balances: Vec<u64>,
}

/// Detected incoming transfer to a payout account.
#[derive(Debug, Clone, PartialEq)]
pub struct Donation {
	/// Best-effort payer identity (see [`detect_donation`]).
	pub payer: String,

	/// Amount in native units.
	pub amount: f64,

	pub signature: String,
}

/// Donation ledger contract: latest signature lookup plus transaction fetch.
#[async_trait]
pub trait LedgerClient: Send + Sync + 'static {
	async fn latest_signature(&self, wallet: &str) -> Result<Option<String>, LedgerError>;

	async fn transaction(&self, signature: &str) -> Result<Option<LedgerTransaction>, LedgerError>;
}

/// Derive a donation from a transaction's balance deltas.
///
/// The receiver's delta (post - pre) must be positive and the block no older
/// than `max_age`. The payer is the account whose balance dropped the most,
/// excluding the receiver. This is a heuristic: it names whoever paid the most
/// in the transaction, which is not a proof that they initiated the transfer.
pub fn detect_donation(tx: &LedgerTransaction, receiver: &str, now: SystemTime, max_age: Duration) -> Option<Donation> {
	if tx.failed {
		return None;
	}

	let block_time = tx.block_time?;
	let now_secs = i64::try_from(now.duration_since(SystemTime::UNIX_EPOCH).ok()?.as_secs()).ok()?;
	let max_age_secs = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
	if now_secs.saturating_sub(block_time) >= max_age_secs {
		return None;
	}

	let delta = |idx: usize| -> Option<i128> {
		let pre = *tx.pre_balances.get(idx)?;
		let post = *tx.post_balances.get(idx)?;
		Some(i128::from(post) - i128::from(pre))
	};

	let receiver_idx = tx.account_keys.iter().position(|k| k == receiver)?;
	let received = delta(receiver_idx)?;
	if received <= 0 {
		return None;
	}

	let payer = tx
		.account_keys
		.iter()
		.enumerate()
		.filter(|(idx, _)| *idx != receiver_idx)
		.filter_map(|(idx, key)| delta(idx).filter(|d| *d < 0).map(|d| (key, d)))
		.min_by_key(|(_, d)| *d)
		.map(|(key, _)| key.clone())?;

	Some(Donation {
		payer,
		amount: received as f64 / BASE_UNITS_PER_UNIT,
		signature: tx.signature.clone(),
	})
}

/// JSON-RPC ledger client (`getSignaturesForAddress` / `getTransaction`).
#[derive(Debug, Clone)]
pub struct JsonRpcLedgerClient {
	rpc_url: String,
	timeout: Duration,
	client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
	result: Option<T>,
	error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
	code: i64,
	message: String,
}

#[derive(Debug, Deserialize)]
struct SignatureInfo {
	signature: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
	block_time: Option<i64>,
	meta: Option<RpcMeta>,
	transaction: RpcTransactionBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcMeta {
	err: Option<serde_json::Value>,
	#[serde(default)]
	pre_balances: Vec<u64>,
	#[serde(default)]
	post_balances: Vec<u64>,
}

#[derive(Debug, Deserialize)]
struct RpcTransactionBody {
	message: RpcMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcMessage {
	#[serde(default)]
	account_keys: Vec<String>,
}

impl JsonRpcLedgerClient {
	pub fn new(rpc_url: impl Into<String>) -> Self {
		Self {
			rpc_url: rpc_url.into(),
			timeout: Duration::from_secs(10),
			client: reqwest::Client::new(),
		}
	}

	/// Per-request bound; a hung RPC call fails instead of stalling the watcher.
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	async fn call<T: for<'de> Deserialize<'de>>(
		&self,
		method: &str,
		params: serde_json::Value,
	) -> Result<Option<T>, LedgerError> {
		let body = json!({
			"jsonrpc": "2.0",
			"id": 1,
			"method": method,
			"params": params,
		});

		let resp = self
			.client
			.post(&self.rpc_url)
			.timeout(self.timeout)
			.json(&body)
			.send()
			.await
			.map_err(|e| {
				if e.is_timeout() {
					LedgerError::Timeout
				} else {
					LedgerError::Request(format!("{method}: {e}"))
				}
			})?;

		if !resp.status().is_success() {
			return Err(LedgerError::Status(resp.status().as_u16()));
		}

		let parsed: RpcResponse<T> = resp
			.json()
			.await
			.map_err(|e| LedgerError::Decode(format!("{method}: {e}")))?;

		if let Some(err) = parsed.error {
			return Err(LedgerError::Rpc {
				code: err.code,
				message: err.message,
			});
		}
		Ok(parsed.result)
	}
}

impl From<(String, RpcTransaction)> for LedgerTransaction {
	fn from((signature, tx): (String, RpcTransaction)) -> Self {
		let (failed, pre_balances, post_balances) = match tx.meta {
			Some(meta) => (
				meta.err.is_some_and(|e| !e.is_null()),
				meta.pre_balances,
				meta.post_balances,
			),
			None => (false, Vec::new(), Vec::new()),
		};
		Self {
			signature,
			block_time: tx.block_time,
			failed,
			account_keys: tx.transaction.message.account_keys,
			pre_balances,
			post_balances,
		}
	}
}

#[async_trait]
impl LedgerClient for JsonRpcLedgerClient {
	async fn latest_signature(&self, wallet: &str) -> Result<Option<String>, LedgerError> {
		let sigs: Option<Vec<SignatureInfo>> = self
			.call("getSignaturesForAddress", json!([wallet, { "limit": 1 }]))
			.await?;
		Ok(sigs.and_then(|s| s.into_iter().next()).map(|s| s.signature))
	}

	async fn transaction(&self, signature: &str) -> Result<Option<LedgerTransaction>, LedgerError> {
		let tx: Option<RpcTransaction> = self
			.call(
				"getTransaction",
				json!([signature, { "encoding": "json", "maxSupportedTransactionVersion": 0 }]),
			)
			.await?;
		Ok(tx.map(|tx| LedgerTransaction::from((signature.to_string(), tx))))
	}
}
