//! Clients for the keeper's off-chain services.
//!
//! - Market ranking: best supply/borrow markets per chain
//! - Indexer: agents, positions and borrow targets over GraphQL
//! - Prices: USD spot prices with a TTL cache

mod error;
mod indexer;
mod markets;
mod prices;

pub use error::{ApiError, Result};
pub use indexer::{
    AgentLedger, IndexedAgent, IndexedAllocation, IndexedBorrow, IndexedMarket, IndexedPosition,
    IndexedToken, IndexedWithdrawal, IndexerClient, Page, DEFAULT_INDEXER_URL,
};
pub use markets::{
    AssetKind, BorrowMarkets, ChainMarkets, CollateralAsset, CollateralPolicy, LoanAsset,
    MarketClient, MarketRanking, RankedMarket, TokenAmount, TokenRef, DEFAULT_MARKETS_URL,
};
pub use prices::{CoinPrice, PriceClient, PriceOracle, DEFAULT_PRICES_URL, DEFAULT_PRICE_TTL};
