use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::rebalance::{plan_rebalance, RollAction};
use super::{total_value, Miscellaneous, PendingOperation, StakingAddress, AUTO_COMPOUND};
use crate::client::ClientDriver;
use crate::config::StakingConfig;
use crate::db::{RollOpKind, RollOpRecord, Store, ValueHistory};
use crate::dispatcher::{AddressChangedDispatcher, StatusDispatcher, Unsubscribe};
use crate::error::{NodeManagerError, Result};
use crate::network::Network;
use crate::node_api::NodeApi;
use crate::status::NodeStatus;
use crate::supervisor::{NodeSession, SessionProvider};
use crate::wallet::Wallet;

pub const STATUS_ON_SUBSCRIBER: &str = "staking-manager-status-on";
pub const NODE_DOWN_SUBSCRIBER: &str = "staking-manager-node-down";

const NODE_DOWN: [NodeStatus; 3] = [
    NodeStatus::Crashed,
    NodeStatus::Desynced,
    NodeStatus::Stopping,
];

#[derive(Default)]
struct State {
    node_up: bool,
    /// Network the tracked addresses belong to.
    network: Option<Network>,
    addresses: Vec<StakingAddress>,
    misc: Option<(Network, Miscellaneous)>,
    monitoring: Option<CancellationToken>,
    last_recorded_value: Option<f64>,
}

struct Inner {
    config: StakingConfig,
    api: Arc<dyn NodeApi>,
    client: Arc<dyn ClientDriver>,
    store: Arc<dyn Store>,
    wallet: Arc<dyn Wallet>,
    sessions: Arc<dyn SessionProvider>,
    status: StatusDispatcher,
    address_changed: AddressChangedDispatcher,
    /// Address list and pending operations.
    state: Mutex<State>,
    /// Serializes issuing buy/sell operations.
    rolls: Mutex<()>,
    shutdown: CancellationToken,
}

enum PendingCheck {
    Resolved,
    /// Still in flight. Carries the expire period when the node reported one.
    Waiting { expire_period: Option<u64> },
}

/// Tracks staking addresses and reconciles their rolls while the node is on.
#[derive(Clone)]
pub struct StakingManager {
    inner: Arc<Inner>,
}

impl StakingManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: StakingConfig,
        api: Arc<dyn NodeApi>,
        client: Arc<dyn ClientDriver>,
        store: Arc<dyn Store>,
        wallet: Arc<dyn Wallet>,
        sessions: Arc<dyn SessionProvider>,
        status: StatusDispatcher,
        address_changed: AddressChangedDispatcher,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                api,
                client,
                store,
                wallet,
                sessions,
                status,
                address_changed,
                state: Mutex::new(State::default()),
                rolls: Mutex::new(()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Start reacting to node status changes. Reconciliation runs while the node is on.
    pub fn spawn(&self) -> JoinHandle<()> {
        let (on_rx, on_unsub) = self
            .inner
            .status
            .subscribe(&[NodeStatus::On], STATUS_ON_SUBSCRIBER);
        let (down_rx, down_unsub) = self.inner.status.subscribe(&NODE_DOWN, NODE_DOWN_SUBSCRIBER);
        let already_on = self.inner.status.current() == NodeStatus::On;

        let manager = self.clone();
        tokio::spawn(async move {
            if already_on {
                manager.on_node_up().await;
            }
            manager
                .listen(on_rx, down_rx, on_unsub, down_unsub)
                .await;
        })
    }

    /// Stop every background task.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    pub fn address_changes(
        &self,
        name: &str,
    ) -> (mpsc::Receiver<Vec<StakingAddress>>, Unsubscribe<Vec<StakingAddress>>) {
        self.inner.address_changed.subscribe_all(name)
    }

    /// Current staking addresses, discovering them from the node when none are tracked.
    pub async fn staking_addresses(&self) -> Result<Vec<StakingAddress>> {
        let session = self.session()?;
        let mut state = self.inner.state.lock().await;
        if !state.node_up {
            return Err(NodeManagerError::NodeNotUp);
        }
        if state.addresses.is_empty() {
            self.init_addresses(&mut state, &session).await?;
        }
        Ok(state.addresses.clone())
    }

    /// Register the wallet account `nickname` for staking.
    pub async fn add_staking_address(&self, nickname: &str) -> Result<StakingAddress> {
        let session = self.session()?;
        let account = self.inner.wallet.account(nickname)?;

        let mut state = self.inner.state.lock().await;
        if !state.node_up {
            return Err(NodeManagerError::NodeNotUp);
        }
        if state.addresses.iter().any(|a| a.address == account.address) {
            return Err(NodeManagerError::AddressAlreadyStaking(account.address));
        }

        self.inner
            .client
            .add_staking_address(&session, &account.secret_key, &account.address)
            .await?;
        self.inner
            .store
            .add_rolls_target(&account.address, AUTO_COMPOUND, session.network)?;

        let added = self
            .fetch_addresses(&session, &[account.address.clone()])
            .await?
            .pop()
            .ok_or_else(|| {
                NodeManagerError::Rpc(format!("node returned no data for {}", account.address))
            })?;
        state.addresses.push(added.clone());
        self.inner.address_changed.publish(state.addresses.clone());

        tracing::info!(address = %added.address, network = %session.network, "staking address added");
        Ok(added)
    }

    /// Stop staking with `address`, selling its candidate rolls first.
    pub async fn remove_staking_address(&self, address: &str) -> Result<()> {
        let session = self.session()?;
        let mut state = self.inner.state.lock().await;
        if !state.node_up {
            return Err(NodeManagerError::NodeNotUp);
        }
        let index = state
            .addresses
            .iter()
            .position(|a| a.address == address)
            .ok_or_else(|| NodeManagerError::AddressNotFound(address.to_string()))?;

        let candidate = state.addresses[index].candidate_rolls;
        if candidate > 0 {
            let misc = self.misc_for(&mut state, session.network).await?;
            let op_id = self
                .inner
                .client
                .sell_rolls(&session, address, candidate, misc.minimal_fees)
                .await?;
            tracing::info!(%address, %op_id, rolls = candidate, "sold rolls before removal");
        }

        self.inner
            .client
            .remove_staking_address(&session, address)
            .await?;
        state.addresses.remove(index);
        self.inner.address_changed.publish(state.addresses.clone());

        let mut errors = Vec::new();
        if let Err(e) = self.inner.store.delete_rolls_target(address, session.network) {
            if !e.is_not_found() {
                errors.push(e);
            }
        }
        if let Err(e) = self
            .inner
            .store
            .delete_roll_op_history(address, session.network)
        {
            if !e.is_not_found() {
                errors.push(e);
            }
        }

        tracing::info!(%address, network = %session.network, "staking address removed");
        NodeManagerError::aggregate(errors)
    }

    /// Change the target of a tracked address and rebalance it right away.
    pub async fn set_target_rolls(&self, address: &str, target: i64) -> Result<()> {
        let session = self.session()?;
        let (node_up, misc) = {
            let mut state = self.inner.state.lock().await;
            let addr = state
                .addresses
                .iter_mut()
                .find(|a| a.address == address)
                .ok_or_else(|| NodeManagerError::AddressNotFound(address.to_string()))?;
            if addr.target_rolls == target {
                return Ok(());
            }

            match self
                .inner
                .store
                .update_rolls_target(address, target, session.network)
            {
                Err(e) if e.is_not_found() => {
                    self.inner
                        .store
                        .add_rolls_target(address, target, session.network)?
                }
                other => other?,
            }
            addr.target_rolls = target;
            self.inner.address_changed.publish(state.addresses.clone());
            tracing::info!(%address, target, "rolls target updated");

            let misc = if state.node_up {
                Some(self.misc_for(&mut state, session.network).await?)
            } else {
                None
            };
            (state.node_up, misc)
        };

        let (true, Some(misc)) = (node_up, misc) else {
            return Ok(());
        };
        let _rolls = self.inner.rolls.lock().await;
        match self.rebalance(&session, address, &misc).await {
            Err(e) if e.is_pending_conflict() => {
                tracing::debug!(%address, error = %e, "rebalance deferred");
                Ok(())
            }
            other => other,
        }
    }

    pub fn roll_operations(&self, address: &str, network: Network) -> Result<Vec<RollOpRecord>> {
        self.inner.store.roll_op_history(address, network)
    }

    // ── Node status reactions ───────────────────────────────────────────

    async fn listen(
        &self,
        mut on_rx: mpsc::Receiver<NodeStatus>,
        mut down_rx: mpsc::Receiver<NodeStatus>,
        on_unsub: Unsubscribe<NodeStatus>,
        down_unsub: Unsubscribe<NodeStatus>,
    ) {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                Some(_) = on_rx.recv() => self.on_node_up().await,
                Some(status) = down_rx.recv() => self.on_node_down(status).await,
                else => break,
            }
        }
        on_unsub.unsubscribe();
        down_unsub.unsubscribe();
        self.stop_monitoring().await;
    }

    async fn on_node_up(&self) {
        // Up and down events arrive on separate queues; trust the latest status.
        if self.inner.status.current() != NodeStatus::On {
            tracing::debug!("stale node-up event, ignoring");
            return;
        }
        let session = match self.session() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "node is on but no session is known");
                return;
            }
        };

        let mut state = self.inner.state.lock().await;
        state.node_up = true;
        if state.network != Some(session.network) {
            state.addresses.clear();
            state.last_recorded_value = None;
            state.network = Some(session.network);
        }
        if let Err(e) = self.misc_for(&mut state, session.network).await {
            tracing::warn!(error = %e, "failed to read network constants, will retry");
        }

        if let Some(previous) = state.monitoring.take() {
            previous.cancel();
        }
        let token = self.inner.shutdown.child_token();
        state.monitoring = Some(token.clone());
        drop(state);

        tracing::info!(network = %session.network, "node is on, starting staking monitor");
        let manager = self.clone();
        tokio::spawn(async move { manager.monitor(token).await });
    }

    async fn on_node_down(&self, status: NodeStatus) {
        if self.inner.status.current() == NodeStatus::On {
            tracing::debug!(%status, "stale node-down event, ignoring");
            return;
        }
        tracing::info!(%status, "node left service, pausing staking monitor");
        let mut state = self.inner.state.lock().await;
        state.node_up = false;
        if let Some(token) = state.monitoring.take() {
            token.cancel();
        }
    }

    async fn stop_monitoring(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(token) = state.monitoring.take() {
            token.cancel();
        }
    }

    // ── Reconciliation ──────────────────────────────────────────────────

    async fn monitor(&self, cancel: CancellationToken) {
        let poll_every = self.inner.config.poll_interval;
        let value_every = self.inner.config.total_value_interval;
        let mut poll = interval_at(Instant::now() + poll_every, poll_every);
        let mut value = interval_at(Instant::now() + value_every, value_every);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        value.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll.tick() => {
                    if let Err(e) = self.reconcile().await {
                        tracing::warn!(error = %e, "staking reconciliation failed");
                    }
                }
                _ = value.tick() => {
                    if let Err(e) = self.record_total_value().await {
                        tracing::warn!(error = %e, "failed to record total value");
                    }
                }
            }
        }
        tracing::info!("staking monitor stopped");
    }

    /// One poll: refresh on-chain data, then rebalance every address.
    pub async fn reconcile(&self) -> Result<()> {
        let session = self.session()?;
        let (addresses, misc) = {
            let mut state = self.inner.state.lock().await;
            if !state.node_up {
                return Ok(());
            }

            if state.addresses.is_empty() {
                self.init_addresses(&mut state, &session).await?;
            } else {
                let tracked: Vec<String> =
                    state.addresses.iter().map(|a| a.address.clone()).collect();
                let fresh = self.fetch_addresses(&session, &tracked).await?;
                let changed = merge_addresses(&mut state.addresses, &fresh);
                if changed && self.inner.address_changed.has_subscribers() {
                    self.inner.address_changed.publish(state.addresses.clone());
                }
            }

            let misc = self.misc_for(&mut state, session.network).await?;
            let addresses: Vec<String> = state.addresses.iter().map(|a| a.address.clone()).collect();
            (addresses, misc)
        };

        let _rolls = self.inner.rolls.lock().await;
        for address in addresses {
            match self.rebalance(&session, &address, &misc).await {
                Ok(()) => {}
                Err(e) if e.is_pending_conflict() => {
                    tracing::debug!(%address, error = %e, "skipping address this cycle");
                }
                Err(e) => tracing::warn!(%address, error = %e, "failed to rebalance rolls"),
            }
        }
        Ok(())
    }

    /// Apply the rebalancing policy to one address. Callers hold the rolls lock.
    async fn rebalance(&self, session: &NodeSession, address: &str, misc: &Miscellaneous) -> Result<()> {
        let mut current = self
            .inner
            .state
            .lock()
            .await
            .addresses
            .iter()
            .find(|a| a.address == address)
            .cloned()
            .ok_or_else(|| NodeManagerError::AddressNotFound(address.to_string()))?;

        if let Some(pending) = current.pending_operation.take() {
            let check = self.check_pending(address, &pending).await;
            let mut state = self.inner.state.lock().await;
            let tracked = state.addresses.iter_mut().find(|a| {
                a.address == address
                    && a.pending_operation.as_ref().is_some_and(|p| p.id == pending.id)
            });
            match check {
                PendingCheck::Resolved => {
                    if let Some(addr) = tracked {
                        addr.pending_operation = None;
                    }
                }
                PendingCheck::Waiting { expire_period } => {
                    let tracked = tracked.and_then(|a| a.pending_operation.as_mut());
                    if let (Some(p), Some(period)) = (tracked, expire_period) {
                        p.expire_period = Some(period);
                    }
                    return Err(NodeManagerError::PendingOperation {
                        address: address.to_string(),
                        operation_id: pending.id,
                    });
                }
            }
        }

        let action = plan_rebalance(&current, misc)?;
        let (kind, amount) = match action {
            RollAction::Hold => return Ok(()),
            RollAction::Buy(n) => (RollOpKind::Buy, n),
            RollAction::Sell(n) => (RollOpKind::Sell, n),
        };

        let op_id = match kind {
            RollOpKind::Buy => {
                self.inner
                    .client
                    .buy_rolls(session, address, amount, misc.minimal_fees)
                    .await?
            }
            RollOpKind::Sell => {
                self.inner
                    .client
                    .sell_rolls(session, address, amount, misc.minimal_fees)
                    .await?
            }
        };
        tracing::info!(%address, %op_id, op = kind.as_str(), amount, "roll operation submitted");

        {
            let mut state = self.inner.state.lock().await;
            if let Some(addr) = state.addresses.iter_mut().find(|a| a.address == address) {
                addr.pending_operation = Some(PendingOperation {
                    id: op_id.clone(),
                    expected_rolls: action.expected_rolls(current.candidate_rolls),
                    expire_period: None,
                });
            }
        }

        if let Err(e) = self.inner.store.add_roll_op(&RollOpRecord {
            op_id,
            network: session.network,
            address: address.to_string(),
            kind,
            amount,
            timestamp: Utc::now(),
        }) {
            tracing::warn!(%address, error = %e, "failed to record roll operation");
        }
        Ok(())
    }

    /// Final operations are resolved, and so are operations whose expire period
    /// has passed. Anything else, including an operation the node has not
    /// indexed yet, stays pending.
    async fn check_pending(&self, address: &str, pending: &PendingOperation) -> PendingCheck {
        let expire_period = match self.inner.api.get_operation(&pending.id).await {
            Ok(op) if op.is_final() => {
                tracing::info!(%address, op_id = %pending.id, "roll operation final");
                return PendingCheck::Resolved;
            }
            Ok(op) => Some(op.expire_period()),
            Err(e) if e.is_not_found() => {
                tracing::debug!(%address, op_id = %pending.id, "operation not known to node yet");
                pending.expire_period
            }
            Err(e) => {
                tracing::debug!(%address, op_id = %pending.id, error = %e, "failed to look up operation");
                return PendingCheck::Waiting {
                    expire_period: None,
                };
            }
        };
        let Some(expire) = expire_period else {
            return PendingCheck::Waiting {
                expire_period: None,
            };
        };

        let last_period = match self.inner.api.get_status().await {
            Ok(status) => status.last_slot.map(|s| s.period).unwrap_or(0),
            Err(e) => {
                tracing::debug!(error = %e, "failed to read last slot");
                return PendingCheck::Waiting { expire_period };
            }
        };
        if expire < last_period {
            tracing::info!(%address, op_id = %pending.id, expire, last_period, "roll operation expired");
            return PendingCheck::Resolved;
        }
        PendingCheck::Waiting { expire_period }
    }

    /// Append the current total value if it moved since the last record.
    pub async fn record_total_value(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if !state.node_up {
            return Ok(());
        }
        let (Some(network), Some((misc_network, misc))) = (state.network, state.misc) else {
            return Ok(());
        };
        if network != misc_network {
            return Ok(());
        }

        let value = total_value(&state.addresses, misc.roll_price);
        if state.last_recorded_value == Some(value) {
            tracing::debug!(value, "total value unchanged");
            return Ok(());
        }
        self.inner.store.post_value_history(
            &ValueHistory {
                timestamp: Utc::now(),
                total_value: value,
            },
            network,
        )?;
        state.last_recorded_value = Some(value);
        tracing::debug!(%network, value, "total value recorded");
        Ok(())
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    /// Load the addresses the node already stakes with and prune stale targets.
    async fn init_addresses(&self, state: &mut MutexGuard<'_, State>, session: &NodeSession) -> Result<()> {
        let on_chain = self.inner.client.staking_addresses(session).await?;

        for target in self.inner.store.rolls_targets(session.network)? {
            if on_chain.contains(&target.address) {
                continue;
            }
            match self
                .inner
                .store
                .delete_rolls_target(&target.address, session.network)
            {
                Ok(()) => tracing::info!(address = %target.address, "pruned stale rolls target"),
                Err(e) if e.is_not_found() => {}
                Err(e) => tracing::warn!(address = %target.address, error = %e, "failed to prune rolls target"),
            }
        }

        state.addresses = if on_chain.is_empty() {
            Vec::new()
        } else {
            self.fetch_addresses(session, &on_chain).await?
        };
        state.network = Some(session.network);
        tracing::info!(count = state.addresses.len(), network = %session.network, "staking addresses loaded");
        Ok(())
    }

    async fn fetch_addresses(&self, session: &NodeSession, addresses: &[String]) -> Result<Vec<StakingAddress>> {
        let infos = self.inner.api.get_addresses(addresses).await?;
        let wallet = self.inner.client.wallet_info(session).await?;
        let targets: HashMap<String, i64> = self
            .inner
            .store
            .rolls_targets(session.network)?
            .into_iter()
            .map(|t| (t.address, t.target))
            .collect();

        Ok(infos
            .into_iter()
            .map(|info| {
                let active = wallet
                    .get(&info.address)
                    .map(|w| w.address_info.active_rolls)
                    .unwrap_or(0);
                let target = targets.get(&info.address).copied().unwrap_or(AUTO_COMPOUND);
                StakingAddress::from_node(info, active, target)
            })
            .collect())
    }

    /// Network constants for `network`, fetched once per network.
    async fn misc_for(&self, state: &mut MutexGuard<'_, State>, network: Network) -> Result<Miscellaneous> {
        if let Some((cached, misc)) = state.misc {
            if cached == network {
                return Ok(misc);
            }
        }
        let status = self.inner.api.get_status().await?;
        let misc = Miscellaneous {
            minimal_fees: status.minimal_fees,
            roll_price: status.config.roll_price,
        };
        tracing::info!(%network, roll_price = misc.roll_price, minimal_fees = misc.minimal_fees, "network constants loaded");
        state.misc = Some((network, misc));
        Ok(misc)
    }

    fn session(&self) -> Result<NodeSession> {
        self.inner
            .sessions
            .session()
            .ok_or(NodeManagerError::NodeNotUp)
    }
}

/// Refresh tracked addresses in place. Returns true when anything changed.
fn merge_addresses(tracked: &mut [StakingAddress], fresh: &[StakingAddress]) -> bool {
    let mut changed = false;
    for addr in tracked.iter_mut() {
        if let Some(update) = fresh.iter().find(|f| f.address == addr.address) {
            changed |= addr.refresh_from(update);
        }
    }
    changed
}
