//! Typed views of indexed agent records.
//!
//! The indexer returns every relation as optional and every amount as a
//! decimal string. Conversion here is strict: a missing or malformed field
//! yields a [`DataError`] and nothing is defaulted.

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};

use keeper_api::{IndexedAgent, IndexedBorrow, IndexedMarket, IndexedPosition, IndexedToken};
use keeper_chain::{market_id, Market, MarketId};

use crate::error::DataError;

/// Record context for error messages.
struct Fields<'a> {
    record: &'static str,
    id: &'a str,
}

impl<'a> Fields<'a> {
    fn new(record: &'static str, id: &'a str) -> Self {
        Self { record, id }
    }

    fn missing(&self, field: &'static str) -> DataError {
        DataError::MissingField {
            record: self.record,
            id: self.id.to_string(),
            field,
        }
    }

    fn invalid(&self, field: &'static str, value: impl ToString) -> DataError {
        DataError::InvalidField {
            record: self.record,
            id: self.id.to_string(),
            field,
            value: value.to_string(),
        }
    }

    fn require<'v, T>(&self, field: &'static str, value: Option<&'v T>) -> Result<&'v T, DataError> {
        value.ok_or_else(|| self.missing(field))
    }

    fn address(&self, field: &'static str, raw: Option<&str>) -> Result<Address, DataError> {
        let raw = raw.ok_or_else(|| self.missing(field))?;
        raw.parse().map_err(|_| self.invalid(field, raw))
    }

    fn amount(&self, field: &'static str, raw: &str) -> Result<U256, DataError> {
        U256::from_str_radix(raw, 10).map_err(|_| self.invalid(field, raw))
    }

    fn timestamp(&self, field: &'static str, raw: &str) -> Result<DateTime<Utc>, DataError> {
        raw.parse::<i64>()
            .ok()
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .ok_or_else(|| self.invalid(field, raw))
    }
}

/// ERC20 token as recorded by the indexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub address: Address,
    pub symbol: String,
    pub decimals: u8,
}

impl TokenInfo {
    fn from_indexed(
        fields: &Fields<'_>,
        field: &'static str,
        token: Option<&IndexedToken>,
    ) -> Result<Self, DataError> {
        let token = fields.require(field, token)?;
        let address = fields.address(field, token.address.as_deref())?;
        let decimals = token.decimals.ok_or_else(|| fields.missing(field))?;
        let decimals = u8::try_from(decimals).map_err(|_| fields.invalid(field, decimals))?;
        Ok(Self {
            address,
            symbol: token.symbol.clone().unwrap_or_default(),
            decimals,
        })
    }
}

/// A market placement with its protocol and both tokens resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketRecord {
    pub protocol: u16,
    pub market: Market,
    pub id: MarketId,
    pub loan_token: TokenInfo,
    pub collateral_token: TokenInfo,
}

impl MarketRecord {
    fn from_indexed(fields: &Fields<'_>, market: Option<&IndexedMarket>) -> Result<Self, DataError> {
        let indexed = fields.require("market", market)?;

        let code = indexed
            .protocol_code
            .ok_or_else(|| fields.missing("market.protocolCode"))?;
        let loan_token = TokenInfo::from_indexed(fields, "market.loanToken", indexed.loan_token.as_ref())?;
        let collateral_token = TokenInfo::from_indexed(
            fields,
            "market.collateralToken",
            indexed.collateral_token.as_ref(),
        )?;
        let market_address = fields.address("market.marketAddress", indexed.market_address.as_deref())?;

        let raw_aux = indexed
            .aux_id
            .as_deref()
            .ok_or_else(|| fields.missing("market.auxId"))?;
        let aux_id: B256 = raw_aux
            .parse()
            .map_err(|_| fields.invalid("market.auxId", raw_aux))?;

        let raw_flags = indexed.flags.ok_or_else(|| fields.missing("market.flags"))?;
        let flags = u16::try_from(raw_flags).map_err(|_| fields.invalid("market.flags", raw_flags))?;

        let market = Market {
            loan_token: loan_token.address,
            collateral_token: collateral_token.address,
            market_address,
            aux_id,
            flags,
        };
        let id = market_id(code, &market).map_err(|source| DataError::MarketId {
            record: fields.record,
            id: fields.id.to_string(),
            source,
        })?;

        Ok(Self {
            // Range checked by market_id.
            protocol: code as u16,
            market,
            id,
            loan_token,
            collateral_token,
        })
    }
}

/// An agent contract and its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentRecord {
    pub address: Address,
    /// The agent's creator; owner-side balances and allowances are read for it
    pub owner: Address,
    pub adapters: Vec<Address>,
    pub disabled_at: Option<DateTime<Utc>>,
}

impl AgentRecord {
    pub fn from_indexed(agent: &IndexedAgent) -> Result<Self, DataError> {
        let fields = Fields::new("agent", &agent.id);
        let address = fields.address("id", Some(&agent.id))?;
        let owner = fields.address("creator", agent.creator.as_deref())?;
        let adapters = agent
            .adapters
            .iter()
            .map(|raw| fields.address("adapters", Some(raw)))
            .collect::<Result<Vec<_>, _>>()?;
        let disabled_at = agent
            .disabled_at
            .as_deref()
            .map(|raw| fields.timestamp("disabledAt", raw))
            .transpose()?;

        Ok(Self {
            address,
            owner,
            adapters,
            disabled_at,
        })
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_at.is_some()
    }
}

/// The live allocation of one supplied token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LivePosition {
    pub token: TokenInfo,
    pub placement: MarketRecord,
    /// Amount recorded on the allocation
    pub amount: U256,
    pub allocated_at: DateTime<Utc>,
}

impl LivePosition {
    /// The position's chronologically last allocation, or `None` when the
    /// last one was withdrawn. A position without allocations is malformed.
    pub fn from_indexed(position: &IndexedPosition) -> Result<Option<Self>, DataError> {
        let fields = Fields::new("position", &position.id);
        let token = TokenInfo::from_indexed(&fields, "token", position.token.as_ref())?;

        let allocations = fields.require("allocations", position.allocations.as_ref())?;
        if allocations.items.is_empty() {
            return Err(fields.missing("allocations"));
        }

        let mut last = None;
        for allocation in &allocations.items {
            let fields = Fields::new("allocation", &allocation.id);
            let at = fields.timestamp("timestamp", &allocation.timestamp)?;
            // Later entries win ties
            if last.map_or(true, |(latest, _)| at >= latest) {
                last = Some((at, allocation));
            }
        }

        let Some((allocated_at, allocation)) = last else {
            return Ok(None);
        };
        if allocation.withdrawal.is_some() {
            return Ok(None);
        }

        let fields = Fields::new("allocation", &allocation.id);
        let placement = MarketRecord::from_indexed(&fields, allocation.market.as_ref())?;
        let amount = fields.amount("amount", &allocation.amount)?;

        Ok(Some(Self {
            token,
            placement,
            amount,
            allocated_at,
        }))
    }
}

/// A standing borrow-target configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BorrowTarget {
    pub id: String,
    pub placement: MarketRecord,
    pub min_amount: U256,
    /// `None` or zero disables auto-refill
    pub max_amount: Option<U256>,
}

impl BorrowTarget {
    pub fn from_indexed(borrow: &IndexedBorrow) -> Result<Self, DataError> {
        let fields = Fields::new("borrow", &borrow.id);
        let placement = MarketRecord::from_indexed(&fields, borrow.market.as_ref())?;
        let min_amount = fields.amount("minAmount", &borrow.min_amount)?;
        let max_amount = borrow
            .max_amount
            .as_deref()
            .map(|raw| fields.amount("maxAmount", raw))
            .transpose()?;

        Ok(Self {
            id: borrow.id.clone(),
            placement,
            min_amount,
            max_amount,
        })
    }

    /// Amount borrowed at origination: `maxAmount`, else `minAmount`.
    pub fn original_amount(&self) -> U256 {
        self.max_amount.unwrap_or(self.min_amount)
    }

    pub fn auto_refill(&self) -> Option<U256> {
        self.max_amount.filter(|max| !max.is_zero())
    }
}
