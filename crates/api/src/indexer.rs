//! Agent ledger client for the Ponder GraphQL indexer.
//!
//! Records are returned as indexed, with every relation optional; callers
//! decide which missing fields are fatal.

use alloy::primitives::Address;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, instrument};

use crate::error::{decode, read_body, ApiError, Result};

pub const DEFAULT_INDEXER_URL: &str = "http://localhost:42069/graphql";

/// Largest page the indexer serves.
const PAGE_SIZE: u32 = 1000;

const AGENTS_QUERY: &str = r#"
    query AllAgents($after: String) {
        agents(limit: 1000, after: $after) {
            items { id creator adapters disabledAt }
            pageInfo { hasNextPage endCursor }
        }
    }
"#;

// Allocations come newest first, so the live allocation is always on the
// first page.
const POSITIONS_QUERY: &str = r#"
    query AgentPositions($agentAddress: String!, $after: String) {
        positions(where: { agent: $agentAddress }, limit: 1000, after: $after) {
            items {
                id
                token { address symbol decimals }
                allocations(orderBy: "timestamp", orderDirection: "desc", limit: 1000) {
                    items {
                        id
                        amount
                        timestamp
                        market {
                            id
                            protocolCode
                            marketAddress
                            auxId
                            flags
                            loanToken { address symbol decimals }
                            collateralToken { address symbol decimals }
                        }
                        withdrawal { amount managementFee }
                    }
                }
            }
            pageInfo { hasNextPage endCursor }
        }
    }
"#;

const BORROWS_QUERY: &str = r#"
    query AgentBorrows($agentAddress: String!, $after: String) {
        borrows(where: { agent: $agentAddress }, limit: 1000, after: $after) {
            items {
                id
                minAmount
                maxAmount
                market {
                    id
                    protocolCode
                    marketAddress
                    auxId
                    flags
                    loanToken { address symbol decimals }
                    collateralToken { address symbol decimals }
                }
            }
            pageInfo { hasNextPage endCursor }
        }
    }
"#;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedAgent {
    pub id: String,
    pub creator: Option<String>,
    #[serde(default)]
    pub adapters: Vec<String>,
    /// Unix seconds, as a decimal string
    pub disabled_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IndexedToken {
    pub address: Option<String>,
    pub symbol: Option<String>,
    pub decimals: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedMarket {
    pub id: Option<String>,
    pub protocol_code: Option<i64>,
    pub market_address: Option<String>,
    pub aux_id: Option<String>,
    pub flags: Option<i64>,
    pub loan_token: Option<IndexedToken>,
    pub collateral_token: Option<IndexedToken>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedWithdrawal {
    pub amount: String,
    pub management_fee: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IndexedAllocation {
    pub id: String,
    pub amount: String,
    pub timestamp: String,
    pub market: Option<IndexedMarket>,
    pub withdrawal: Option<IndexedWithdrawal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IndexedPosition {
    pub id: String,
    pub token: Option<IndexedToken>,
    pub allocations: Option<Page<IndexedAllocation>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedBorrow {
    pub id: String,
    pub min_amount: String,
    pub max_amount: Option<String>,
    pub market: Option<IndexedMarket>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageInfo {
    has_next_page: bool,
    end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Connection<T> {
    items: Vec<T>,
    page_info: Option<PageInfo>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphQlError>>,
}

/// Extract `data` from a GraphQL response body, failing on any reported error.
fn into_data<T: DeserializeOwned>(operation: &'static str, body: &[u8]) -> Result<T> {
    let response: GraphQlResponse<T> = decode(operation, body)?;
    if let Some(errors) = response.errors.filter(|e| !e.is_empty()) {
        let messages: Vec<String> = errors.into_iter().map(|e| e.message).collect();
        return Err(ApiError::GraphQl(format!("{operation}: {}", messages.join("; "))));
    }
    response
        .data
        .ok_or_else(|| ApiError::GraphQl(format!("{operation}: response has no data")))
}

/// Indexed agent records the keeper reconciles against.
#[async_trait]
pub trait AgentLedger: Send + Sync {
    async fn agents(&self) -> Result<Vec<IndexedAgent>>;
    async fn positions(&self, agent: Address) -> Result<Vec<IndexedPosition>>;
    async fn borrows(&self, agent: Address) -> Result<Vec<IndexedBorrow>>;
}

/// GraphQL client for the indexer.
#[derive(Debug, Clone)]
pub struct IndexerClient {
    client: reqwest::Client,
    url: String,
}

impl IndexerClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }

    async fn query<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        query: &str,
        variables: &Value,
    ) -> Result<T> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;
        let body = read_body(operation, response).await?;
        into_data(operation, &body)
    }

    /// Follow `pageInfo.endCursor` until the connection is exhausted.
    async fn paginate<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        query: &str,
        field: &'static str,
        mut variables: Value,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut after: Option<String> = None;
        loop {
            variables["after"] = json!(after);
            let mut data: HashMap<String, Connection<T>> =
                self.query(operation, query, &variables).await?;
            let page = data
                .remove(field)
                .ok_or_else(|| ApiError::GraphQl(format!("{operation}: missing {field}")))?;
            items.extend(page.items);

            match page.page_info {
                Some(PageInfo {
                    has_next_page: true,
                    end_cursor: Some(cursor),
                }) => after = Some(cursor),
                _ => break,
            }
        }
        debug!(operation, items = items.len(), page_size = PAGE_SIZE, "Indexer query complete");
        Ok(items)
    }
}

impl Default for IndexerClient {
    fn default() -> Self {
        Self::new(DEFAULT_INDEXER_URL)
    }
}

fn agent_key(agent: Address) -> String {
    format!("{agent}").to_lowercase()
}

#[async_trait]
impl AgentLedger for IndexerClient {
    #[instrument(skip(self))]
    async fn agents(&self) -> Result<Vec<IndexedAgent>> {
        self.paginate("AllAgents", AGENTS_QUERY, "agents", json!({}))
            .await
    }

    #[instrument(skip(self))]
    async fn positions(&self, agent: Address) -> Result<Vec<IndexedPosition>> {
        let variables = json!({ "agentAddress": agent_key(agent) });
        self.paginate("AgentPositions", POSITIONS_QUERY, "positions", variables)
            .await
    }

    #[instrument(skip(self))]
    async fn borrows(&self, agent: Address) -> Result<Vec<IndexedBorrow>> {
        let variables = json!({ "agentAddress": agent_key(agent) });
        self.paginate("AgentBorrows", BORROWS_QUERY, "borrows", variables)
            .await
    }
}
