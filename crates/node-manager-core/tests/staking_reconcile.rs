//! Staking engine tests against fake node, client and wallet, with a real
//! in-memory store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use node_manager::client::{ClientDriver, WalletEntry};
use node_manager::config::StakingConfig;
use node_manager::db::{RollOpKind, RollOpRecord, RollsTarget, SqliteStore, Store, ValueHistory};
use node_manager::dispatcher::{AddressChangedDispatcher, StatusDispatcher};
use node_manager::error::{NodeManagerError, Result};
use node_manager::node_api::{
    NodeAddress, NodeApi, NodeConfigInfo, NodeStatusInfo, OperationContent, OperationDetail,
    OperationInfo, Slot,
};
use node_manager::supervisor::{NodeSession, SessionProvider};
use node_manager::wallet::{Wallet, WalletAccount};
use node_manager::{Network, NodeStatus, StakingManager};

// ── Fakes ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeNode {
    addresses: Mutex<HashMap<String, NodeAddress>>,
    operations: Mutex<HashMap<String, OperationInfo>>,
    last_period: AtomicU64,
}

impl FakeNode {
    fn set_operation(&self, id: &str, is_final: bool, expire_period: u64) {
        self.operations.lock().unwrap().insert(
            id.to_string(),
            OperationInfo {
                id: id.to_string(),
                is_operation_final: Some(is_final),
                operation: OperationDetail {
                    content: OperationContent { expire_period },
                },
            },
        );
    }
}

#[async_trait]
impl NodeApi for FakeNode {
    async fn get_status(&self) -> Result<NodeStatusInfo> {
        Ok(NodeStatusInfo {
            minimal_fees: 0.01,
            config: NodeConfigInfo { roll_price: 100.0 },
            last_slot: Some(Slot {
                period: self.last_period.load(Ordering::SeqCst),
                thread: 0,
            }),
        })
    }

    async fn get_addresses(&self, addresses: &[String]) -> Result<Vec<NodeAddress>> {
        let known = self.addresses.lock().unwrap();
        Ok(addresses.iter().filter_map(|a| known.get(a).cloned()).collect())
    }

    async fn get_operation(&self, operation_id: &str) -> Result<OperationInfo> {
        self.operations
            .lock()
            .unwrap()
            .get(operation_id)
            .cloned()
            .ok_or_else(|| NodeManagerError::NotFound(format!("operation {operation_id}")))
    }
}

#[derive(Default)]
struct FakeClient {
    staking: Mutex<Vec<String>>,
    buys: Mutex<Vec<(String, u64)>>,
    sells: Mutex<Vec<(String, u64)>>,
    removed: Mutex<Vec<String>>,
    next_op: AtomicUsize,
    fail_sell: AtomicBool,
}

impl FakeClient {
    fn op_id(&self) -> String {
        format!("O{}", self.next_op.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn buys(&self) -> Vec<(String, u64)> {
        self.buys.lock().unwrap().clone()
    }

    fn sells(&self) -> Vec<(String, u64)> {
        self.sells.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClientDriver for FakeClient {
    async fn staking_addresses(&self, _session: &NodeSession) -> Result<Vec<String>> {
        Ok(self.staking.lock().unwrap().clone())
    }

    async fn add_staking_address(&self, _session: &NodeSession, _secret_key: &str, address: &str) -> Result<()> {
        self.staking.lock().unwrap().push(address.to_string());
        Ok(())
    }

    async fn remove_staking_address(&self, _session: &NodeSession, address: &str) -> Result<()> {
        self.staking.lock().unwrap().retain(|a| a != address);
        self.removed.lock().unwrap().push(address.to_string());
        Ok(())
    }

    async fn buy_rolls(&self, _session: &NodeSession, address: &str, amount: u64, _fee: f64) -> Result<String> {
        self.buys.lock().unwrap().push((address.to_string(), amount));
        Ok(self.op_id())
    }

    async fn sell_rolls(&self, _session: &NodeSession, address: &str, amount: u64, _fee: f64) -> Result<String> {
        if self.fail_sell.load(Ordering::SeqCst) {
            return Err(NodeManagerError::Client("sell_rolls failed".into()));
        }
        self.sells.lock().unwrap().push((address.to_string(), amount));
        Ok(self.op_id())
    }

    async fn wallet_info(&self, _session: &NodeSession) -> Result<HashMap<String, WalletEntry>> {
        Ok(HashMap::new())
    }
}

#[derive(Default)]
struct FakeWallet {
    accounts: HashMap<String, WalletAccount>,
}

impl Wallet for FakeWallet {
    fn account(&self, nickname: &str) -> Result<WalletAccount> {
        self.accounts
            .get(nickname)
            .cloned()
            .ok_or_else(|| NodeManagerError::NotFound(format!("wallet account {nickname}")))
    }
}

struct FixedSession;

impl SessionProvider for FixedSession {
    fn session(&self) -> Option<NodeSession> {
        Some(NodeSession {
            network: Network::Mainnet,
            credential: "pwd".into(),
        })
    }
}

/// Counts writes so tests can assert that nothing was persisted.
struct CountingStore {
    inner: SqliteStore,
    writes: AtomicUsize,
}

impl CountingStore {
    fn wrote(&self) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl Store for CountingStore {
    fn rolls_targets(&self, network: Network) -> Result<Vec<RollsTarget>> {
        self.inner.rolls_targets(network)
    }

    fn add_rolls_target(&self, address: &str, target: i64, network: Network) -> Result<()> {
        self.inner.add_rolls_target(address, target, network)?;
        self.wrote()
    }

    fn update_rolls_target(&self, address: &str, target: i64, network: Network) -> Result<()> {
        self.inner.update_rolls_target(address, target, network)?;
        self.wrote()
    }

    fn delete_rolls_target(&self, address: &str, network: Network) -> Result<()> {
        self.inner.delete_rolls_target(address, network)?;
        self.wrote()
    }

    fn add_roll_op(&self, op: &RollOpRecord) -> Result<()> {
        self.inner.add_roll_op(op)?;
        self.wrote()
    }

    fn roll_op_history(&self, address: &str, network: Network) -> Result<Vec<RollOpRecord>> {
        self.inner.roll_op_history(address, network)
    }

    fn delete_roll_op_history(&self, address: &str, network: Network) -> Result<()> {
        self.inner.delete_roll_op_history(address, network)?;
        self.wrote()
    }

    fn post_value_history(&self, entry: &ValueHistory, network: Network) -> Result<()> {
        self.inner.post_value_history(entry, network)?;
        self.wrote()
    }

    fn value_history_after(&self, after: DateTime<Utc>, network: Network) -> Result<Vec<ValueHistory>> {
        self.inner.value_history_after(after, network)
    }

    fn delete_value_history_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.inner.delete_value_history_before(cutoff)
    }
}

// ── Harness ─────────────────────────────────────────────────────────────

struct Harness {
    manager: StakingManager,
    node: Arc<FakeNode>,
    client: Arc<FakeClient>,
    store: Arc<CountingStore>,
    status: StatusDispatcher,
}

fn node_address(address: &str, balance: f64, rolls: u64) -> NodeAddress {
    NodeAddress {
        address: address.to_string(),
        thread: 0,
        final_roll_count: rolls,
        candidate_roll_count: rolls,
        final_balance: balance,
        candidate_balance: balance,
        deferred_credits: Vec::new(),
    }
}

fn account(address: &str) -> WalletAccount {
    WalletAccount {
        address: address.to_string(),
        secret_key: format!("S-{address}"),
    }
}

fn harness(addresses: Vec<NodeAddress>, staking: &[&str], wallet: FakeWallet) -> Harness {
    let node = Arc::new(FakeNode::default());
    node.addresses
        .lock()
        .unwrap()
        .extend(addresses.into_iter().map(|a| (a.address.clone(), a)));
    let client = Arc::new(FakeClient::default());
    client
        .staking
        .lock()
        .unwrap()
        .extend(staking.iter().map(|s| s.to_string()));
    let store = Arc::new(CountingStore {
        inner: SqliteStore::new(":memory:").unwrap(),
        writes: AtomicUsize::new(0),
    });
    let status = StatusDispatcher::new(NodeStatus::On);

    let manager = StakingManager::new(
        StakingConfig {
            poll_interval: Duration::from_secs(3600),
            total_value_interval: Duration::from_secs(7200),
        },
        node.clone(),
        client.clone(),
        store.clone(),
        Arc::new(wallet),
        Arc::new(FixedSession),
        status.clone(),
        AddressChangedDispatcher::new(Vec::new()),
    );
    Harness {
        manager,
        node,
        client,
        store,
        status,
    }
}

/// Let spawned tasks react to published events.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

async fn started(h: &Harness) {
    h.manager.spawn();
    settle().await;
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn auto_compound_buys_and_waits_for_pending_operation() {
    let h = harness(vec![node_address("AU1", 1000.0, 0)], &["AU1"], FakeWallet::default());
    started(&h).await;

    h.manager.reconcile().await.unwrap();
    assert_eq!(h.client.buys(), vec![("AU1".to_string(), 10)]);

    let tracked = h.manager.staking_addresses().await.unwrap();
    let pending = tracked[0].pending_operation.clone().unwrap();
    assert_eq!(pending.id, "O1");
    assert_eq!(pending.expected_rolls, 10);

    let history = h.manager.roll_operations("AU1", Network::Mainnet).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].kind, RollOpKind::Buy);
    assert_eq!(history[0].amount, 10);

    // Not final and not expired: nothing new is issued.
    h.node.set_operation("O1", false, 100);
    h.node.last_period.store(10, Ordering::SeqCst);
    h.manager.reconcile().await.unwrap();
    assert_eq!(h.client.buys().len(), 1);

    // Expired: resolved, and the still-unbought balance is spent again.
    h.node.last_period.store(101, Ordering::SeqCst);
    h.manager.reconcile().await.unwrap();
    assert_eq!(h.client.buys().len(), 2);
    let tracked = h.manager.staking_addresses().await.unwrap();
    assert_eq!(tracked[0].pending_operation.as_ref().unwrap().id, "O2");
}

#[tokio::test(start_paused = true)]
async fn final_operation_is_cleared() {
    let h = harness(vec![node_address("AU1", 950.0, 0)], &["AU1"], FakeWallet::default());
    started(&h).await;

    h.manager.reconcile().await.unwrap();
    assert_eq!(h.client.buys(), vec![("AU1".to_string(), 9)]);

    h.node.set_operation("O1", true, 100);
    h.node
        .addresses
        .lock()
        .unwrap()
        .insert("AU1".into(), node_address("AU1", 50.0, 9));
    h.manager.reconcile().await.unwrap();

    let tracked = h.manager.staking_addresses().await.unwrap();
    assert_eq!(tracked[0].candidate_rolls, 9);
    assert!(tracked[0].pending_operation.is_none());
    assert_eq!(h.client.buys().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn operation_unknown_to_node_stays_pending() {
    let h = harness(vec![node_address("AU1", 1000.0, 0)], &["AU1"], FakeWallet::default());
    started(&h).await;

    h.manager.reconcile().await.unwrap();
    h.node.last_period.store(500, Ordering::SeqCst);

    // Freshly submitted operations are often not indexed yet.
    h.manager.reconcile().await.unwrap();
    h.manager.reconcile().await.unwrap();
    assert_eq!(h.client.buys().len(), 1);
    let tracked = h.manager.staking_addresses().await.unwrap();
    assert_eq!(tracked[0].pending_operation.as_ref().unwrap().id, "O1");
}

#[tokio::test(start_paused = true)]
async fn operation_dropped_by_node_clears_after_known_expiry() {
    let h = harness(vec![node_address("AU1", 1000.0, 0)], &["AU1"], FakeWallet::default());
    started(&h).await;
    h.manager.reconcile().await.unwrap();

    h.node.set_operation("O1", false, 20);
    h.node.last_period.store(10, Ordering::SeqCst);
    h.manager.reconcile().await.unwrap();
    let tracked = h.manager.staking_addresses().await.unwrap();
    assert_eq!(tracked[0].pending_operation.as_ref().unwrap().expire_period, Some(20));

    // Pruned from the pool before its expiry: still waiting.
    h.node.operations.lock().unwrap().clear();
    h.node.last_period.store(15, Ordering::SeqCst);
    h.manager.reconcile().await.unwrap();
    assert_eq!(h.client.buys().len(), 1);

    h.node.last_period.store(21, Ordering::SeqCst);
    h.manager.reconcile().await.unwrap();
    assert_eq!(h.client.buys().len(), 2);
    let tracked = h.manager.staking_addresses().await.unwrap();
    assert_eq!(tracked[0].pending_operation.as_ref().unwrap().id, "O2");
}

#[tokio::test(start_paused = true)]
async fn startup_prunes_targets_of_addresses_no_longer_staking() {
    let h = harness(vec![node_address("AU1", 0.0, 3)], &["AU1"], FakeWallet::default());
    h.store.add_rolls_target("AU1", 3, Network::Mainnet).unwrap();
    h.store.add_rolls_target("AU9", 5, Network::Mainnet).unwrap();
    started(&h).await;

    let tracked = h.manager.staking_addresses().await.unwrap();
    assert_eq!(tracked.len(), 1);
    assert_eq!(tracked[0].target_rolls, 3);

    let targets = h.store.rolls_targets(Network::Mainnet).unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].address, "AU1");
}

#[tokio::test(start_paused = true)]
async fn set_target_rolls_is_idempotent_and_rebalances_on_change() {
    let h = harness(vec![node_address("AU1", 1000.0, 5)], &["AU1"], FakeWallet::default());
    h.store.add_rolls_target("AU1", 5, Network::Mainnet).unwrap();
    started(&h).await;
    h.manager.staking_addresses().await.unwrap();

    let (mut changes, _unsub) = h.manager.address_changes("test");
    let writes = h.store.writes();

    h.manager.set_target_rolls("AU1", 5).await.unwrap();
    assert_eq!(h.store.writes(), writes);
    assert!(changes.try_recv().is_err());
    assert!(h.client.buys().is_empty());

    h.manager.set_target_rolls("AU1", 7).await.unwrap();
    let published = changes.try_recv().unwrap();
    assert_eq!(published[0].target_rolls, 7);
    assert_eq!(h.client.buys(), vec![("AU1".to_string(), 2)]);
    assert_eq!(h.store.rolls_targets(Network::Mainnet).unwrap()[0].target, 7);
}

#[tokio::test(start_paused = true)]
async fn add_staking_address_rejects_duplicates() {
    let wallet = FakeWallet {
        accounts: HashMap::from([
            ("alice".to_string(), account("AU2")),
            ("bob".to_string(), account("AU1")),
        ]),
    };
    let h = harness(
        vec![node_address("AU1", 0.0, 1), node_address("AU2", 10.0, 0)],
        &["AU1"],
        wallet,
    );
    started(&h).await;
    h.manager.staking_addresses().await.unwrap();
    let (mut changes, _unsub) = h.manager.address_changes("test");

    let err = h.manager.add_staking_address("bob").await.unwrap_err();
    assert!(matches!(err, NodeManagerError::AddressAlreadyStaking(ref a) if a == "AU1"));

    assert!(h.manager.add_staking_address("carol").await.unwrap_err().is_not_found());

    let added = h.manager.add_staking_address("alice").await.unwrap();
    assert_eq!(added.address, "AU2");
    assert_eq!(added.target_rolls, -1);
    assert_eq!(changes.try_recv().unwrap().len(), 2);
    assert!(h.client.staking.lock().unwrap().contains(&"AU2".to_string()));

    let targets = h.store.rolls_targets(Network::Mainnet).unwrap();
    assert!(targets.iter().any(|t| t.address == "AU2" && t.target == -1));
}

#[tokio::test(start_paused = true)]
async fn remove_staking_address_sells_rolls_first() {
    let h = harness(vec![node_address("AU1", 5.0, 4)], &["AU1"], FakeWallet::default());
    h.store.add_rolls_target("AU1", 4, Network::Mainnet).unwrap();
    started(&h).await;
    h.manager.staking_addresses().await.unwrap();

    h.client.fail_sell.store(true, Ordering::SeqCst);
    assert!(h.manager.remove_staking_address("AU1").await.is_err());
    assert!(h.client.removed.lock().unwrap().is_empty());
    assert_eq!(h.manager.staking_addresses().await.unwrap().len(), 1);

    h.client.fail_sell.store(false, Ordering::SeqCst);
    h.manager.remove_staking_address("AU1").await.unwrap();
    assert_eq!(h.client.sells(), vec![("AU1".to_string(), 4)]);
    assert_eq!(*h.client.removed.lock().unwrap(), vec!["AU1".to_string()]);
    assert!(h.store.rolls_targets(Network::Mainnet).unwrap().is_empty());

    assert!(matches!(
        h.manager.remove_staking_address("AU1").await,
        Err(NodeManagerError::AddressNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn node_down_pauses_staking() {
    let h = harness(vec![node_address("AU1", 1000.0, 0)], &["AU1"], FakeWallet::default());
    started(&h).await;

    h.status.publish(NodeStatus::Stopping);
    settle().await;
    assert!(matches!(
        h.manager.staking_addresses().await,
        Err(NodeManagerError::NodeNotUp)
    ));
    h.manager.reconcile().await.unwrap();
    assert!(h.client.buys().is_empty());

    h.status.publish(NodeStatus::On);
    settle().await;
    h.manager.reconcile().await.unwrap();
    assert_eq!(h.client.buys().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn quick_desync_and_recovery_leaves_staking_running() {
    let h = harness(vec![node_address("AU1", 1000.0, 0)], &["AU1"], FakeWallet::default());
    started(&h).await;

    // Down and up events travel on separate queues and may be seen out of order.
    for _ in 0..5 {
        h.status.publish(NodeStatus::Desynced);
        h.status.publish(NodeStatus::On);
        settle().await;
        assert!(h.manager.staking_addresses().await.is_ok());
    }

    h.manager.reconcile().await.unwrap();
    assert_eq!(h.client.buys().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn total_value_is_recorded_only_on_change() {
    let h = harness(
        vec![node_address("AU1", 500.0, 0), node_address("AU2", 0.0, 5)],
        &["AU1", "AU2"],
        FakeWallet::default(),
    );
    h.store.add_rolls_target("AU1", 0, Network::Mainnet).unwrap();
    h.store.add_rolls_target("AU2", 5, Network::Mainnet).unwrap();
    started(&h).await;
    h.manager.staking_addresses().await.unwrap();

    h.manager.record_total_value().await.unwrap();
    h.manager.record_total_value().await.unwrap();

    let since = Utc::now() - chrono::Duration::days(1);
    let history = h.store.value_history_after(since, Network::Mainnet).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].total_value, 1000.0);
}
