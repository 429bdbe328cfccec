//! Per-chain automation driver and scheduler.
//!
//! Each configured chain gets one supervised task that fires a cycle on a
//! fixed interval. A cycle walks every enabled agent sequentially through
//! reconciliation, liquidation protection, borrow-target maintenance and
//! yield rebalancing, in that order.

use alloy::primitives::Address;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use keeper_api::{AgentLedger, MarketClient, MarketRanking, PriceOracle, RankedMarket};
use keeper_chain::{ActionExecutor, AgentAction, ChainReader, CollateralProbe};

use crate::config::{ChainDetails, KeeperConfig, OverlapPolicy};
use crate::ledger::AgentRecord;
use crate::maintainer::Maintainer;
use crate::planner::plan_rebalance;
use crate::protection::plan_protection;
use crate::reconcile::{AgentSnapshot, Reconciler};

/// Tracks cycles in flight for one chain.
#[derive(Debug, Clone, Default)]
pub struct CycleGuard {
    running: Arc<AtomicUsize>,
}

/// Marks a cycle as running until dropped.
#[derive(Debug)]
pub struct CycleToken {
    running: Arc<AtomicUsize>,
}

impl Drop for CycleToken {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::AcqRel);
    }
}

impl CycleGuard {
    /// Start a cycle only if none is running.
    pub fn try_begin(&self) -> Option<CycleToken> {
        self.running
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleToken {
                running: self.running.clone(),
            })
    }

    /// Start a cycle alongside any running ones.
    pub fn begin(&self) -> CycleToken {
        self.running.fetch_add(1, Ordering::AcqRel);
        CycleToken {
            running: self.running.clone(),
        }
    }

    pub fn in_flight(&self) -> bool {
        self.running.load(Ordering::Acquire) > 0
    }
}

/// Chain-bound and shared collaborators of a driver.
#[derive(Clone)]
pub struct Collaborators {
    pub reader: Arc<dyn ChainReader>,
    pub probe: Arc<dyn CollateralProbe>,
    pub executor: Arc<dyn ActionExecutor>,
    pub ledger: Arc<dyn AgentLedger>,
    pub ranking: Arc<dyn MarketRanking>,
    pub prices: Arc<dyn PriceOracle>,
}

/// Outcome counters for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Agents that went through the pipeline
    pub agents: usize,
    pub disabled: usize,
    /// Agents skipped on a data, read or submission error
    pub failed: usize,
    pub transactions: usize,
}

/// Runs automation cycles for one chain.
pub struct ChainDriver {
    chain: ChainDetails,
    deps: Collaborators,
    config: Arc<KeeperConfig>,
    guard: CycleGuard,
}

impl ChainDriver {
    pub fn new(chain: ChainDetails, deps: Collaborators, config: Arc<KeeperConfig>) -> Self {
        Self {
            chain,
            deps,
            config,
            guard: CycleGuard::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.chain.name
    }

    pub fn guard(&self) -> &CycleGuard {
        &self.guard
    }

    /// One pass over every agent on the chain. Only a failure to list the
    /// agents fails the cycle; per-agent errors are logged and counted.
    #[instrument(skip(self), fields(chain = %self.chain.name, chain_id = self.chain.chain_id))]
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let started = Instant::now();
        let indexed = self.deps.ledger.agents().await.context("failed to list agents")?;

        // Capacity pricing needs the full market list; without it the
        // maintainer sits this cycle out.
        let markets = match self.deps.ranking.markets_on_chain(self.chain.chain_id).await {
            Ok(markets) => Some(markets),
            Err(e) => {
                warn!(error = %e, "Market list unavailable, skipping borrow maintenance");
                None
            }
        };

        let mut report = CycleReport::default();
        for raw in &indexed {
            let agent = match AgentRecord::from_indexed(raw) {
                Ok(agent) => agent,
                Err(e) => {
                    warn!(agent = %raw.id, error = %e, "Skipping malformed agent record");
                    report.failed += 1;
                    continue;
                }
            };
            if agent.is_disabled() {
                report.disabled += 1;
                continue;
            }

            report.agents += 1;
            match self.process_agent(&agent, markets.as_deref()).await {
                Ok(sent) => report.transactions += sent,
                Err(e) => {
                    report.failed += 1;
                    error!(agent = %agent.address, error = %format!("{e:#}"), "Agent skipped this cycle");
                }
            }
        }

        info!(
            agents = report.agents,
            disabled = report.disabled,
            failed = report.failed,
            transactions = report.transactions,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Cycle complete"
        );
        Ok(report)
    }

    /// Full pipeline for one agent. State is reconciled again after any
    /// stage that submitted, so later stages never plan against balances
    /// an earlier transaction already moved.
    async fn process_agent(&self, agent: &AgentRecord, markets: Option<&[RankedMarket]>) -> Result<usize> {
        let reconciler = Reconciler::new(
            self.deps.ledger.as_ref(),
            self.deps.reader.as_ref(),
            self.deps.probe.as_ref(),
            self.config.rebalance.borrow_protocol,
        );
        let mut snapshot = reconciler.reconcile(agent).await?;
        let mut sent = 0;

        let protection = plan_protection(&snapshot, &self.config.protection);
        if !protection.is_empty() {
            sent += self.submit(&snapshot, &protection).await?;
            snapshot = reconciler.reconcile(agent).await?;
        }

        if let Some(markets) = markets {
            let maintainer = Maintainer::new(markets, self.deps.prices.as_ref(), &self.chain.price_chain);
            let refills = maintainer.plan(&snapshot).await?;
            if !refills.is_empty() {
                sent += self.submit(&snapshot, &refills).await?;
                snapshot = reconciler.reconcile(agent).await?;
            }
        }

        let rebalance = plan_rebalance(
            &snapshot,
            self.deps.ranking.as_ref(),
            self.chain.chain_id,
            self.config.rebalance.max_steps_per_cycle,
        )
        .await?;
        if let Some(action) = rebalance {
            sent += self.submit(&snapshot, std::slice::from_ref(&action)).await?;
        }

        if sent == 0 {
            debug!(agent = %agent.address, "Nothing to do");
        }
        Ok(sent)
    }

    /// Submit actions in order; the first failure abandons the rest.
    async fn submit(&self, snapshot: &AgentSnapshot, actions: &[AgentAction]) -> Result<usize> {
        let agent: Address = snapshot.address();
        for action in actions {
            let tx_hash = self
                .deps
                .executor
                .execute(agent, action)
                .await
                .with_context(|| format!("{} failed", action.kind()))?;

            match self.chain.tx_url(tx_hash) {
                Some(url) => info!(agent = %agent, action = %action, url = %url, "Transaction confirmed"),
                None => info!(agent = %agent, action = %action, tx_hash = %tx_hash, "Transaction confirmed"),
            }
        }
        Ok(actions.len())
    }
}

/// Drives every chain on its own interval until Ctrl-C.
pub struct Scheduler {
    drivers: Vec<Arc<ChainDriver>>,
    config: Arc<KeeperConfig>,
    warmup: Option<Arc<MarketClient>>,
}

impl Scheduler {
    pub fn new(drivers: Vec<Arc<ChainDriver>>, config: Arc<KeeperConfig>) -> Self {
        Self {
            drivers,
            config,
            warmup: None,
        }
    }

    /// Periodically ping the market service so it stays warm.
    pub fn with_market_warmup(mut self, client: Arc<MarketClient>) -> Self {
        self.warmup = Some(client);
        self
    }

    pub async fn run(self) -> Result<()> {
        let period = self.config.scheduler.interval();
        let policy = self.config.scheduler.overlap;

        let mut tasks = JoinSet::new();
        for driver in self.drivers {
            info!(
                chain = %driver.name(),
                interval_ms = period.as_millis() as u64,
                policy = ?policy,
                "Starting chain task"
            );
            tasks.spawn(run_chain(driver, period, policy));
        }
        if let Some(client) = self.warmup {
            tasks.spawn(warm_markets(client, self.config.scheduler.market_warmup_interval()));
        }

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                signal = &mut shutdown => {
                    if let Err(e) = signal {
                        error!(error = %e, "Failed to listen for Ctrl-C");
                    }
                    info!("Shutting down");
                    tasks.shutdown().await;
                    return Ok(());
                }
                joined = tasks.join_next() => match joined {
                    None => {
                        warn!("No tasks left running");
                        return Ok(());
                    }
                    Some(Err(e)) if e.is_panic() => error!(error = %e, "Task panicked"),
                    Some(Err(e)) => warn!(error = %e, "Task cancelled"),
                    Some(Ok(())) => {}
                },
            }
        }
    }
}

async fn run_chain(driver: Arc<ChainDriver>, period: Duration, policy: OverlapPolicy) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cycles = JoinSet::new();

    loop {
        ticker.tick().await;

        while let Some(done) = cycles.try_join_next() {
            if let Err(e) = done {
                error!(chain = %driver.name(), error = %e, "Cycle task aborted");
            }
        }

        let token = match policy {
            OverlapPolicy::Skip => match driver.guard().try_begin() {
                Some(token) => token,
                None => {
                    warn!(chain = %driver.name(), "Previous cycle still running, tick skipped");
                    continue;
                }
            },
            OverlapPolicy::Overlap => driver.guard().begin(),
        };

        let driver = driver.clone();
        cycles.spawn(async move {
            let _token = token;
            if let Err(e) = driver.run_cycle().await {
                error!(chain = %driver.name(), error = %format!("{e:#}"), "Cycle failed");
            }
        });
    }
}

async fn warm_markets(client: Arc<MarketClient>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        match client.ping().await {
            Ok(()) => debug!("Market service pinged"),
            Err(e) => warn!(error = %e, "Market warm-up request failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, U256};
    use keeper_api::IndexedAgent;

    use crate::config::{GasConfig, RpcConfig};
    use crate::mocks::fixtures::{self, ADAPTER, AGENT, OWNER, USDC, WETH};
    use crate::mocks::{MockChain, MockLedger, MockPrices, MockProbe, MockRanking, RecordingExecutor};

    const OTHER_AGENT: Address = address!("5555555555555555555555555555555555555555");

    fn chain() -> ChainDetails {
        ChainDetails {
            chain_id: 8453,
            name: "base".to_string(),
            price_chain: "base".to_string(),
            explorer_url: Some("https://basescan.org".to_string()),
            cancel_pending_on_start: false,
            rpc: RpcConfig {
                http: "http://localhost:8545".to_string(),
            },
            gas: GasConfig::default(),
        }
    }

    fn indexed_agent(address: Address) -> IndexedAgent {
        IndexedAgent {
            id: address.to_string(),
            creator: Some(OWNER.to_string()),
            adapters: vec![ADAPTER.to_string()],
            disabled_at: None,
        }
    }

    /// An at-risk borrow on protocol 3 with enough allowance to repay
    /// the 50 of accrued interest.
    fn at_risk(ledger: &mut MockLedger, reader: MockChain, agent: Address) -> MockChain {
        ledger.agents.push(indexed_agent(agent));
        ledger.add_borrow(agent, fixtures::indexed_borrow("b1", 3, "1000", Some("1000")));
        reader
            .with_protocols(agent, vec![3])
            .with_adapter(agent, 3, ADAPTER)
            .with_allowance(USDC, OWNER, agent, 100)
    }

    fn at_risk_chain() -> MockChain {
        MockChain::default()
            .with_debt(ADAPTER, 1_050)
            .with_health_factor(ADAPTER, fixtures::hf(1.05))
    }

    fn driver(ledger: MockLedger, reader: MockChain, executor: Arc<RecordingExecutor>) -> ChainDriver {
        let deps = Collaborators {
            reader: Arc::new(reader),
            probe: Arc::new(MockProbe::default()),
            executor,
            ledger: Arc::new(ledger),
            ranking: Arc::new(MockRanking::default()),
            prices: Arc::new(MockPrices::default()),
        };
        ChainDriver::new(chain(), deps, Arc::new(KeeperConfig::default()))
    }

    #[test]
    fn test_guard_skips_while_in_flight() {
        let guard = CycleGuard::default();
        assert!(!guard.in_flight());

        let token = guard.try_begin().unwrap();
        assert!(guard.in_flight());
        assert!(guard.try_begin().is_none());

        drop(token);
        assert!(!guard.in_flight());
        assert!(guard.try_begin().is_some());
    }

    #[test]
    fn test_guard_overlap_counts_every_cycle() {
        let guard = CycleGuard::default();
        let first = guard.begin();
        let second = guard.begin();
        drop(first);
        assert!(guard.in_flight());
        drop(second);
        assert!(!guard.in_flight());
    }

    #[tokio::test]
    async fn test_cycle_repays_at_risk_borrow() {
        let mut ledger = MockLedger::default();
        let reader = at_risk(&mut ledger, at_risk_chain(), AGENT);
        let executor = Arc::new(RecordingExecutor::default());

        let report = driver(ledger, reader, executor.clone()).run_cycle().await.unwrap();
        assert_eq!(report.agents, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(report.transactions, 1);

        let actions = executor.actions();
        assert_eq!(
            actions,
            vec![AgentAction::Repay {
                protocol: 3,
                market: fixtures::market_in(WETH, 3),
                amount: U256::from(50u64),
            }]
        );
    }

    #[tokio::test]
    async fn test_disabled_agents_are_skipped() {
        let mut ledger = MockLedger::default();
        let reader = at_risk(&mut ledger, at_risk_chain(), AGENT);
        ledger.agents[0].disabled_at = Some("1700000000".to_string());
        let executor = Arc::new(RecordingExecutor::default());

        let report = driver(ledger, reader, executor.clone()).run_cycle().await.unwrap();
        assert_eq!(report.disabled, 1);
        assert_eq!(report.agents, 0);
        assert!(executor.actions().is_empty());
    }

    #[tokio::test]
    async fn test_bad_agent_does_not_stop_the_cycle() {
        let mut ledger = MockLedger::default();

        // no creator
        let mut orphan = indexed_agent(address!("6666666666666666666666666666666666666666"));
        orphan.creator = None;
        ledger.agents.push(orphan);

        // borrow record without a market
        ledger.agents.push(indexed_agent(OTHER_AGENT));
        let mut broken = fixtures::indexed_borrow("b0", 3, "1000", None);
        broken.market = None;
        ledger.add_borrow(OTHER_AGENT, broken);

        let reader = at_risk(&mut ledger, at_risk_chain(), AGENT);
        let executor = Arc::new(RecordingExecutor::default());

        let report = driver(ledger, reader, executor.clone()).run_cycle().await.unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(report.agents, 2);
        assert_eq!(report.transactions, 1);
        assert_eq!(executor.actions().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_submission_skips_agent() {
        let mut ledger = MockLedger::default();
        let reader = at_risk(&mut ledger, at_risk_chain(), AGENT);
        let executor = Arc::new(RecordingExecutor::failing());

        let report = driver(ledger, reader, executor.clone()).run_cycle().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.transactions, 0);
    }

    #[tokio::test]
    async fn test_cycle_rebalances_idle_reserve() {
        let mut ledger = MockLedger::default();
        ledger.agents.push(indexed_agent(AGENT));
        ledger.add_position(AGENT, fixtures::indexed_position("p-weth", WETH, 2, "5000"));
        let reader = MockChain::default().with_protocols(AGENT, vec![2, 3]);
        let executor = Arc::new(RecordingExecutor::default());

        let deps = Collaborators {
            reader: Arc::new(reader),
            probe: Arc::new(MockProbe::default()),
            executor: executor.clone(),
            ledger: Arc::new(ledger),
            ranking: Arc::new(MockRanking::new(vec![fixtures::ranked(WETH, 3, 0.8)])),
            prices: Arc::new(MockPrices::default()),
        };
        let driver = ChainDriver::new(chain(), deps, Arc::new(KeeperConfig::default()));

        let report = driver.run_cycle().await.unwrap();
        assert_eq!(report.transactions, 1);
        assert!(!driver.guard().in_flight());

        match executor.actions().as_slice() {
            [AgentAction::Rebalance { steps }] => {
                assert_eq!(steps.len(), 1);
                assert_eq!(steps[0].from_protocol, 2);
                assert_eq!(steps[0].to_protocol, 3);
            }
            other => panic!("unexpected actions {other:?}"),
        }
    }
}
