//! Transaction signing and submission for agent actions.
//!
//! Every action goes through the same pipeline:
//! 1. estimate gas (`linea_estimateGas` on Linea), re-simulating on failure
//!    to surface the revert reason
//! 2. compare the estimate with the largest gas limit seen in recent blocks
//! 3. pick fees: the chain's strategy when the sample supports it, legacy
//!    `eth_gasPrice` otherwise
//! 4. simulate once more when pricing is legacy
//! 5. sign, send, and wait for one confirmation
//!
//! No step is retried; a failure is returned to the caller.

use crate::contracts::AgentAction;
use crate::gas::{
    analyze_gas_limits, collect_recent_blocks, create_gas_strategy, BlockSample, GasLimitStats,
    GasParams, GasPricingModel, GasStrategy, LegacyGasStrategy, SamplingConfig,
};
use crate::provider::{ChainClient, LineaGasEstimate};
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::decode_revert_reason;
use alloy::transports::TransportError;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Gas limit of a plain value transfer.
const TRANSFER_GAS_LIMIT: u64 = 21_000;

/// Why a submission did not produce a successful transaction.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("gas estimation reverted: {reason}")]
    EstimationReverted { reason: String },

    #[error("estimated gas {estimated} exceeds largest recent gas limit {ceiling}")]
    GasCeilingExceeded { estimated: u64, ceiling: u64 },

    #[error("simulation reverted: {reason}")]
    SimulationReverted { reason: String },

    #[error("transaction {0} reverted on chain")]
    Reverted(B256),

    #[error("rpc error: {0}")]
    Rpc(#[from] TransportError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Executes agent actions on chain.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Submit `action` against `agent` and wait for it to be mined.
    async fn execute(&self, agent: Address, action: &AgentAction) -> Result<B256, SubmitError>;
}

/// Readable reason for a failed call: the decoded revert string when the
/// node returned revert data, the error text otherwise.
pub fn revert_reason(err: &TransportError) -> String {
    err.as_error_resp()
        .and_then(|payload| payload.as_revert_data())
        .and_then(|data| decode_revert_reason(&data))
        .unwrap_or_else(|| err.to_string())
}

/// `eth_call` the request, returning the revert reason on failure.
async fn simulate<P: Provider>(provider: &P, tx: &TransactionRequest) -> Result<(), String> {
    provider
        .call(tx.clone())
        .await
        .map(|_| ())
        .map_err(|e| revert_reason(&e))
}

/// Checks an estimate against the gas limits of a recent block sample.
///
/// A transaction asking for more gas than any recent transaction was given
/// is not submitted. An empty sample leaves nothing to compare against and
/// aborts as well.
pub fn check_gas_ceiling(estimated: u64, sample: &[BlockSample]) -> Result<GasLimitStats, SubmitError> {
    let limits = analyze_gas_limits(sample).map_err(anyhow::Error::from)?;
    if estimated > limits.max_gas_limit {
        return Err(SubmitError::GasCeilingExceeded {
            estimated,
            ceiling: limits.max_gas_limit,
        });
    }
    Ok(limits)
}

/// Fees for replacing stuck transactions: 110% of the gas price, tip 7 wei below.
fn cancel_fees(gas_price: u128) -> (u128, u128) {
    let max_fee = gas_price.saturating_mul(11) / 10;
    (max_fee, max_fee.saturating_sub(7))
}

/// Nonce allocation for the keeper account on one chain.
///
/// Overlapping cycles share the account, so allocation is a single atomic
/// increment.
pub struct NonceManager {
    next: AtomicU64,
}

impl NonceManager {
    pub fn new(pending_nonce: u64) -> Self {
        Self {
            next: AtomicU64::new(pending_nonce),
        }
    }

    /// Take the nonce for the next transaction.
    #[inline]
    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::AcqRel)
    }

    /// The nonce the next transaction will get.
    #[inline]
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }

    /// Adopt the node's pending nonce after a failed broadcast or a
    /// cancellation sweep.
    pub fn resync(&self, pending_nonce: u64) {
        self.next.store(pending_nonce, Ordering::Release);
    }
}

/// Configures a [`TransactionSender`] for one chain.
pub struct TransactionSenderBuilder {
    client: ChainClient,
    pricing: GasPricingModel,
    gas_strategy: Option<Box<dyn GasStrategy>>,
    max_gas_price_gwei: Option<f64>,
    min_gas_used: u64,
    buffer: f64,
    sampling: SamplingConfig,
}

impl TransactionSenderBuilder {
    pub fn new(client: ChainClient) -> Self {
        Self {
            client,
            pricing: GasPricingModel::default(),
            gas_strategy: None,
            max_gas_price_gwei: None,
            min_gas_used: 0,
            buffer: crate::gas::stats::DEFAULT_BUFFER_MULTIPLIER,
            sampling: SamplingConfig::default(),
        }
    }

    pub fn pricing(mut self, pricing: GasPricingModel) -> Self {
        self.pricing = pricing;
        self
    }

    /// Override the strategy derived from the pricing model.
    pub fn gas_strategy(mut self, strategy: Box<dyn GasStrategy>) -> Self {
        self.gas_strategy = Some(strategy);
        self
    }

    pub fn max_gas_price_gwei(mut self, max: Option<f64>) -> Self {
        self.max_gas_price_gwei = max;
        self
    }

    /// Heavy-transaction threshold and buffer for fee recommendations.
    pub fn fee_sampling(mut self, min_gas_used: u64, buffer: f64) -> Self {
        self.min_gas_used = min_gas_used;
        self.buffer = buffer;
        self
    }

    /// Bounds of the block sample taken per submission.
    pub fn sampling(mut self, sampling: SamplingConfig) -> Self {
        self.sampling = sampling;
        self
    }

    /// Build the sender, fetching the account's pending nonce.
    pub async fn build(self, private_key: &str) -> Result<TransactionSender> {
        let signer: PrivateKeySigner = private_key.trim_start_matches("0x").parse()?;
        let address = signer.address();
        let wallet_provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .on_http(self.client.rpc_url().clone())
            .erased();

        let initial_nonce = self
            .client
            .provider()
            .get_transaction_count(address)
            .pending()
            .await?;

        let gas_strategy = self.gas_strategy.unwrap_or_else(|| {
            create_gas_strategy(
                self.pricing,
                self.max_gas_price_gwei,
                self.min_gas_used,
                self.buffer,
            )
        });
        let max_gas_price = self.max_gas_price_gwei.map(|gwei| (gwei * 1e9) as u128);

        info!(
            address = %address,
            chain = %self.client.name(),
            chain_id = self.client.chain_id(),
            initial_nonce,
            pricing = ?self.pricing,
            gas_strategy = gas_strategy.strategy_name(),
            "Transaction sender initialized"
        );

        Ok(TransactionSender {
            client: self.client,
            wallet_provider,
            address,
            pricing: self.pricing,
            nonce_manager: NonceManager::new(initial_nonce),
            gas_strategy,
            legacy_fallback: LegacyGasStrategy::new(max_gas_price),
            sampling: self.sampling,
            last_gas_params: parking_lot::RwLock::new(None),
        })
    }
}

/// Signs and submits keeper transactions on one chain.
pub struct TransactionSender {
    client: ChainClient,
    /// Signs with the keeper key; shares nothing with the read provider
    wallet_provider: DynProvider,
    /// Keeper account address
    pub address: Address,
    pricing: GasPricingModel,
    nonce_manager: NonceManager,
    gas_strategy: Box<dyn GasStrategy>,
    /// Used when the chain shows no base fee
    legacy_fallback: LegacyGasStrategy,
    sampling: SamplingConfig,
    last_gas_params: parking_lot::RwLock<Option<GasParams>>,
}

impl TransactionSender {
    pub fn gas_strategy_name(&self) -> &'static str {
        self.gas_strategy.strategy_name()
    }

    /// Fees used by the most recent submission.
    pub fn last_gas_params(&self) -> Option<GasParams> {
        self.last_gas_params.read().clone()
    }

    pub fn current_nonce(&self) -> u64 {
        self.nonce_manager.peek()
    }

    async fn estimate(
        &self,
        tx: &TransactionRequest,
    ) -> Result<(u64, Option<LineaGasEstimate>), SubmitError> {
        let provider = self.client.provider();
        let estimate = match self.pricing {
            GasPricingModel::Linea => self
                .client
                .linea_estimate_gas(tx)
                .await
                .map(|est| (est.gas_limit, Some(est))),
            _ => provider
                .estimate_gas(tx.clone())
                .await
                .map(|gas| (gas, None))
                .map_err(anyhow::Error::from),
        };

        match estimate {
            Ok(estimate) => Ok(estimate),
            Err(e) => {
                warn!(error = %e, "Gas estimation failed, simulating for revert reason");
                let reason = match simulate(provider, tx).await {
                    Ok(()) => e.to_string(),
                    Err(reason) => reason,
                };
                Err(SubmitError::EstimationReverted { reason })
            }
        }
    }

    async fn resolve_fees(
        &self,
        linea: Option<LineaGasEstimate>,
        sample: &[BlockSample],
    ) -> Result<GasParams, SubmitError> {
        if let Some(est) = linea {
            let max_fee = est.base_fee_per_gas.saturating_add(est.priority_fee_per_gas);
            if max_fee > 0 {
                return Ok(GasParams::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: est.priority_fee_per_gas,
                    base_fee: est.base_fee_per_gas,
                });
            }
        }

        let params = if self.gas_strategy.supports_sample(sample) {
            self.gas_strategy.fetch_params(&self.client, sample).await?
        } else {
            debug!(
                strategy = self.gas_strategy.strategy_name(),
                "No base fee on latest block, pricing as legacy"
            );
            self.legacy_fallback.fetch_params(&self.client, sample).await?
        };
        Ok(params)
    }

    /// Estimate, check, price and simulate a call. Nothing is signed and
    /// no nonce is taken.
    async fn prepare(
        &self,
        to: Address,
        calldata: Bytes,
    ) -> Result<(TransactionRequest, GasParams), SubmitError> {
        let request = TransactionRequest::default()
            .with_from(self.address)
            .with_to(to)
            .with_input(calldata);

        let (gas_limit, linea) = self.estimate(&request).await?;

        let sample = collect_recent_blocks(&self.client, self.sampling).await?;
        let limits = check_gas_ceiling(gas_limit, &sample)?;
        debug!(
            gas_limit,
            median_gas_limit = limits.median_gas_limit,
            max_gas_limit = limits.max_gas_limit,
            "Gas estimate within observed limits"
        );

        let params = self.resolve_fees(linea, &sample).await?;
        *self.last_gas_params.write() = Some(params.clone());

        let mut tx = request
            .with_gas_limit(gas_limit)
            .with_chain_id(self.client.chain_id());
        if params.is_legacy() {
            self.legacy_fallback.apply_gas(&mut tx, &params);
            simulate(self.client.provider(), &tx)
                .await
                .map_err(|reason| SubmitError::SimulationReverted { reason })?;
        } else {
            self.gas_strategy.apply_gas(&mut tx, &params);
        }
        Ok((tx, params))
    }

    /// Run the full pipeline for a call to `to` with `calldata`.
    pub async fn submit(&self, to: Address, calldata: Bytes) -> Result<B256, SubmitError> {
        let total_start = Instant::now();
        let (tx, params) = self.prepare(to, calldata).await?;

        let nonce = self.nonce_manager.allocate();
        let tx = tx.with_nonce(nonce);

        info!(
            to = %to,
            nonce,
            gas_limit = tx.gas.unwrap_or_default(),
            gas_price_gwei = params.effective_gas_price() / 1_000_000_000,
            legacy = params.is_legacy(),
            "Sending transaction"
        );

        let pending = match self.wallet_provider.send_transaction(tx).await {
            Ok(pending) => pending,
            Err(e) => {
                self.sync_nonce().await;
                return Err(SubmitError::Rpc(e));
            }
        };
        let tx_hash = *pending.tx_hash();
        info!(tx_hash = %tx_hash, "Transaction submitted, waiting for confirmation");

        let receipt = pending.get_receipt().await.map_err(anyhow::Error::from)?;

        if receipt.status() {
            info!(
                tx_hash = %tx_hash,
                block = receipt.block_number.unwrap_or(0),
                gas_used = receipt.gas_used,
                total_ms = total_start.elapsed().as_millis(),
                "Transaction confirmed"
            );
            Ok(tx_hash)
        } else {
            warn!(tx_hash = %tx_hash, "Transaction reverted, syncing nonce");
            self.sync_nonce().await;
            Err(SubmitError::Reverted(tx_hash))
        }
    }

    /// Replace every transaction stuck between the latest and pending nonce
    /// with a zero-value self-transfer. Returns the number replaced.
    pub async fn cancel_pending(&self) -> Result<u64> {
        let provider = self.client.provider();
        let confirmed = provider
            .get_transaction_count(self.address)
            .latest()
            .await?;
        let pending = provider
            .get_transaction_count(self.address)
            .pending()
            .await?;

        if pending <= confirmed {
            info!(chain = %self.client.name(), "No pending transactions to cancel");
            return Ok(0);
        }

        warn!(
            chain = %self.client.name(),
            from = confirmed,
            to = pending - 1,
            "Cancelling pending transactions"
        );

        let (max_fee, priority_fee) = cancel_fees(provider.get_gas_price().await?);

        for nonce in confirmed..pending {
            let tx = TransactionRequest::default()
                .with_from(self.address)
                .with_to(self.address)
                .with_value(U256::ZERO)
                .with_nonce(nonce)
                .with_gas_limit(TRANSFER_GAS_LIMIT)
                .with_chain_id(self.client.chain_id())
                .with_max_fee_per_gas(max_fee)
                .with_max_priority_fee_per_gas(priority_fee);

            let receipt = self
                .wallet_provider
                .send_transaction(tx)
                .await?
                .get_receipt()
                .await?;
            info!(
                nonce,
                block = receipt.block_number.unwrap_or(0),
                "Cancelled pending transaction"
            );
        }

        self.nonce_manager.resync(pending);
        Ok(pending - confirmed)
    }

    /// Re-read the pending nonce from chain.
    pub async fn sync_nonce(&self) {
        match self
            .client
            .provider()
            .get_transaction_count(self.address)
            .pending()
            .await
        {
            Ok(chain_nonce) => {
                self.nonce_manager.resync(chain_nonce);
                debug!(nonce = chain_nonce, "Nonce synced from chain");
            }
            Err(e) => {
                warn!(error = %e, "Failed to sync nonce from chain");
            }
        }
    }
}

#[async_trait]
impl ActionExecutor for TransactionSender {
    async fn execute(&self, agent: Address, action: &AgentAction) -> Result<B256, SubmitError> {
        info!(agent = %agent, action = %action, "Submitting agent action");
        let tx_hash = self.submit(agent, action.calldata()).await?;
        if let Some(params) = self.last_gas_params() {
            debug!(
                tx_hash = %tx_hash,
                kind = action.kind(),
                gas_price_gwei = params.effective_gas_price() / 1_000_000_000,
                "Action fees"
            );
        }
        Ok(tx_hash)
    }
}

impl std::fmt::Debug for TransactionSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionSender")
            .field("address", &self.address)
            .field("chain", &self.client.name())
            .field("chain_id", &self.client.chain_id())
            .field("pricing", &self.pricing)
            .field("gas_strategy", &self.gas_strategy.strategy_name())
            .finish_non_exhaustive()
    }
}
