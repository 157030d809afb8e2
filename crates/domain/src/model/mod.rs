//! Data structures exchanged between the gateway and its collaborators.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, EnumString};
use thiserror::Error;

/// Number of hex characters following the `0x` prefix of an address.
pub const ADDRESS_HEX_LENGTH: usize = 40;

/// Upper bound for slippage tolerances expressed in basis points.
pub const MAX_SLIPPAGE_BPS: u32 = 10_000;

/// Errors emitted when user-supplied addresses fail validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressFormatError {
    #[error("address must start with 0x")]
    MissingPrefix,
    #[error("address must be exactly {ADDRESS_HEX_LENGTH} hex characters after 0x")]
    WrongLength,
    #[error("address contains non-hex characters")]
    NonHex,
}

/// Validates the `0x` + 40 hex character contract.
pub fn validate_address(raw: &str) -> Result<(), AddressFormatError> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .ok_or(AddressFormatError::MissingPrefix)?;
    if digits.len() != ADDRESS_HEX_LENGTH {
        return Err(AddressFormatError::WrongLength);
    }
    hex::decode(digits).map_err(|_| AddressFormatError::NonHex)?;
    Ok(())
}

/// Canonical (lowercase) account or token address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EthAddress(String);

impl EthAddress {
    pub fn parse(raw: &str) -> Result<Self, AddressFormatError> {
        validate_address(raw.trim())?;
        Ok(Self(raw.trim().to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EthAddress {
    type Error = AddressFormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EthAddress> for String {
    fn from(value: EthAddress) -> Self {
        value.0
    }
}

impl fmt::Display for EthAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of a relayed meta transaction.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionStatus {
    Submitted,
    Mempool,
    Dropped,
    Mined,
    Confirmed,
    MinedFailure,
    Aborted,
}

impl TransactionStatus {
    /// `Confirmed` (mined-success) and `MinedFailure` freeze the record.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Confirmed | Self::MinedFailure)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionRecordError {
    #[error("transaction {ref_hash} is final ({status:?}) and cannot change")]
    Finalized {
        ref_hash: String,
        status: TransactionStatus,
    },
    #[error("on-chain status flag must be 0 or 1, got {0}")]
    InvalidTxStatus(u8),
}

/// Relay bookkeeping for a single meta transaction, keyed by its reference
/// hash. Created at submission with only the reference hash and a mining
/// estimate, then filled in as on-chain observations arrive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    pub ref_hash: String,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub taker_address: Option<EthAddress>,
    pub status: TransactionStatus,
    pub expected_mined_in_sec: u64,
    #[serde(default)]
    pub to: Option<EthAddress>,
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub value: Option<u128>,
    #[serde(default)]
    pub from: Option<EthAddress>,
    #[serde(default)]
    pub nonce: Option<u64>,
    #[serde(default)]
    pub gas_price: Option<u128>,
    #[serde(default)]
    pub gas: Option<u64>,
    #[serde(default)]
    pub gas_used: Option<u64>,
    #[serde(default)]
    pub block_number: Option<u64>,
    /// 1 for success, 0 for failure once mined.
    #[serde(default)]
    pub tx_status: Option<u8>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Data observed on-chain for a submitted transaction. Absent fields leave
/// the record untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainObservation {
    pub tx_hash: Option<String>,
    pub from: Option<EthAddress>,
    pub nonce: Option<u64>,
    pub gas_price: Option<u128>,
    pub gas: Option<u64>,
    pub gas_used: Option<u64>,
    pub block_number: Option<u64>,
    pub tx_status: Option<u8>,
}

impl TransactionRecord {
    pub fn new(ref_hash: impl Into<String>, expected_mined_in_sec: u64) -> Self {
        let now = Utc::now();
        Self {
            ref_hash: ref_hash.into(),
            api_key: None,
            tx_hash: None,
            taker_address: None,
            status: TransactionStatus::Submitted,
            expected_mined_in_sec,
            to: None,
            data: None,
            value: None,
            from: None,
            nonce: None,
            gas_price: None,
            gas: None,
            gas_used: None,
            block_number: None,
            tx_status: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_final(&self) -> bool {
        self.status.is_terminal()
    }

    /// Merges an on-chain observation and advances the status: a block number
    /// with a status flag finalizes the record, a block number alone marks it
    /// mined, and a hash alone places it in the mempool.
    pub fn observe(&mut self, observation: ChainObservation) -> Result<(), TransactionRecordError> {
        self.ensure_mutable()?;
        if let Some(flag) = observation.tx_status {
            if flag > 1 {
                return Err(TransactionRecordError::InvalidTxStatus(flag));
            }
        }

        merge(&mut self.tx_hash, observation.tx_hash);
        merge(&mut self.from, observation.from);
        merge(&mut self.nonce, observation.nonce);
        merge(&mut self.gas_price, observation.gas_price);
        merge(&mut self.gas, observation.gas);
        merge(&mut self.gas_used, observation.gas_used);
        merge(&mut self.block_number, observation.block_number);
        merge(&mut self.tx_status, observation.tx_status);

        self.status = match (self.block_number, self.tx_status) {
            (Some(_), Some(1)) => TransactionStatus::Confirmed,
            (Some(_), Some(_)) => TransactionStatus::MinedFailure,
            (Some(_), None) => TransactionStatus::Mined,
            (None, _) if self.tx_hash.is_some() => TransactionStatus::Mempool,
            (None, _) => self.status,
        };
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Moves a non-final record to an operator-driven status such as
    /// `Dropped` or `Aborted`.
    pub fn transition(&mut self, status: TransactionStatus) -> Result<(), TransactionRecordError> {
        self.ensure_mutable()?;
        self.status = status;
        self.updated_at = Utc::now();
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<(), TransactionRecordError> {
        if self.is_final() {
            return Err(TransactionRecordError::Finalized {
                ref_hash: self.ref_hash.clone(),
                status: self.status,
            });
        }
        Ok(())
    }
}

fn merge<T>(slot: &mut Option<T>, update: Option<T>) {
    if update.is_some() {
        *slot = update;
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecurringTradeError {
    #[error("invalid address in `{field}`: {source}")]
    Address {
        field: &'static str,
        #[source]
        source: AddressFormatError,
    },
    #[error("`{field}` must be a non-negative integer, got `{value}`")]
    Magnitude { field: &'static str, value: String },
    #[error("max slippage {0} bps exceeds {MAX_SLIPPAGE_BPS}")]
    SlippageOutOfRange(u32),
}

/// Wire form of a scheduled trade, with magnitudes as decimal strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringTradeRequest {
    pub trader_address: String,
    pub bridge_address: String,
    pub from_token_address: String,
    pub to_token_address: String,
    pub from_token_amount: String,
    pub interval: String,
    pub min_buy_amount: String,
    pub max_slippage_bps: String,
    pub unwrap_weth: bool,
}

/// Validated scheduled trade. Magnitudes are unsigned so the non-negative
/// invariant holds by construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecurringTradeRecord {
    pub trader_address: EthAddress,
    pub bridge_address: EthAddress,
    pub from_token_address: EthAddress,
    pub to_token_address: EthAddress,
    pub from_token_amount: u128,
    pub interval_secs: u64,
    pub min_buy_amount: u128,
    pub max_slippage_bps: u32,
    pub unwrap_weth: bool,
}

impl TryFrom<RecurringTradeRequest> for RecurringTradeRecord {
    type Error = RecurringTradeError;

    fn try_from(request: RecurringTradeRequest) -> Result<Self, Self::Error> {
        let max_slippage_bps = magnitude("maxSlippageBps", &request.max_slippage_bps)?;
        if max_slippage_bps > MAX_SLIPPAGE_BPS {
            return Err(RecurringTradeError::SlippageOutOfRange(max_slippage_bps));
        }

        Ok(Self {
            trader_address: address("traderAddress", &request.trader_address)?,
            bridge_address: address("bridgeAddress", &request.bridge_address)?,
            from_token_address: address("fromTokenAddress", &request.from_token_address)?,
            to_token_address: address("toTokenAddress", &request.to_token_address)?,
            from_token_amount: magnitude("fromTokenAmount", &request.from_token_amount)?,
            interval_secs: magnitude("interval", &request.interval)?,
            min_buy_amount: magnitude("minBuyAmount", &request.min_buy_amount)?,
            max_slippage_bps,
            unwrap_weth: request.unwrap_weth,
        })
    }
}

fn address(field: &'static str, raw: &str) -> Result<EthAddress, RecurringTradeError> {
    EthAddress::parse(raw).map_err(|source| RecurringTradeError::Address { field, source })
}

fn magnitude<T: std::str::FromStr>(
    field: &'static str,
    raw: &str,
) -> Result<T, RecurringTradeError> {
    raw.trim().parse().map_err(|_| RecurringTradeError::Magnitude {
        field,
        value: raw.to_string(),
    })
}

/// State change reported by the event bus for a single order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderEventKind {
    Added,
    Filled,
    FullyFilled,
    Cancelled,
    Expired,
    Invalid,
    Unfunded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    pub order_hash: String,
    pub maker_address: String,
    pub maker_token: String,
    pub taker_token: String,
    pub kind: OrderEventKind,
    #[serde(default)]
    pub order: serde_json::Value,
}
