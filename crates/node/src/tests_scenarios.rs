//! End-to-end scenarios over an in-memory network.
//!
//! Each test wires a few managers together through a queueing messenger;
//! `pump` delivers queued messages until the network goes quiet, so
//! multi-round protocols run deterministically on the paused clock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use driftlog_primitives::{
    Coordinate, DeliveryMode, Entry, EntryHash, EntryLog, LocalIdentity, Messenger, PeerId,
    RangeIntent, ReplicationError, ReplicationMessage, ReplicationRange, Resolution, Span,
};
use driftlog_replication::{
    HashDomain, LogContext, ReplicationDomain, ReplicationRequest,
};
use tokio_util::sync::CancellationToken;

use crate::config::{DomainSelection, ReplicationOptions, SynchronizerChoice};
use crate::manager::ReplicationManager;

type Exchange = Arc<Mutex<HashMap<EntryHash, Entry>>>;

#[derive(Default)]
struct Network {
    queue: Mutex<Vec<(PeerId, PeerId, Vec<u8>)>>,
    managers: Mutex<HashMap<PeerId, ReplicationManager>>,
}

impl Network {
    fn register(&self, peer: PeerId, manager: ReplicationManager) {
        let _ = self.managers.lock().unwrap().insert(peer, manager);
    }

    fn pop(&self) -> Option<(PeerId, PeerId, Vec<u8>)> {
        let mut queue = self.queue.lock().unwrap();
        if queue.is_empty() {
            None
        } else {
            Some(queue.remove(0))
        }
    }

    /// Deliver queued messages, including replies, until none remain.
    async fn pump(&self) {
        for _ in 0..10_000 {
            let Some((from, to, bytes)) = self.pop() else {
                return;
            };
            let manager = self.managers.lock().unwrap().get(&to).cloned();
            if let Some(manager) = manager {
                manager.handle_raw(from, &bytes).await.unwrap();
            }
        }
        panic!("network never went quiet");
    }
}

struct Endpoint {
    local: PeerId,
    network: Arc<Network>,
}

#[async_trait]
impl Messenger for Endpoint {
    async fn send(
        &self,
        message: ReplicationMessage,
        mode: DeliveryMode,
        targets: &[PeerId],
    ) -> eyre::Result<()> {
        let bytes = message.to_bytes()?;
        let recipients: Vec<PeerId> = match mode {
            DeliveryMode::Broadcast => self
                .network
                .managers
                .lock()
                .unwrap()
                .keys()
                .copied()
                .filter(|peer| *peer != self.local)
                .collect(),
            DeliveryMode::Direct => targets.to_vec(),
        };
        let mut queue = self.network.queue.lock().unwrap();
        for to in recipients {
            queue.push((self.local, to, bytes.clone()));
        }
        Ok(())
    }
}

/// In-memory log; `exchange` stands in for the log-level block exchange
/// every node fetches through.
struct MemoryLog {
    entries: Mutex<HashMap<EntryHash, Entry>>,
    exchange: Exchange,
}

impl MemoryLog {
    fn new(exchange: Exchange) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            exchange,
        }
    }

    fn contains(&self, hash: &EntryHash) -> bool {
        self.entries.lock().unwrap().contains_key(hash)
    }
}

#[async_trait]
impl EntryLog for MemoryLog {
    async fn append(&self, entry: Entry) -> eyre::Result<()> {
        let _ = self.exchange.lock().unwrap().insert(entry.hash, entry.clone());
        let _ = self.entries.lock().unwrap().insert(entry.hash, entry);
        Ok(())
    }

    async fn get(&self, hash: &EntryHash) -> eyre::Result<Option<Entry>> {
        Ok(self.entries.lock().unwrap().get(hash).cloned())
    }

    async fn has(&self, hash: &EntryHash) -> eyre::Result<bool> {
        Ok(self.contains(hash))
    }

    async fn has_block(&self, hash: &EntryHash) -> eyre::Result<bool> {
        Ok(self.contains(hash))
    }

    async fn heads(&self) -> eyre::Result<Vec<EntryHash>> {
        Ok(self.entries.lock().unwrap().keys().copied().collect())
    }

    async fn fetch(&self, hashes: &[EntryHash], _from: PeerId) -> eyre::Result<Vec<Entry>> {
        let exchange = self.exchange.lock().unwrap();
        Ok(hashes.iter().filter_map(|hash| exchange.get(hash).cloned()).collect())
    }

    async fn to_vec(&self) -> eyre::Result<Vec<Entry>> {
        Ok(self.entries.lock().unwrap().values().cloned().collect())
    }
}

struct Identity(PeerId);

impl LocalIdentity for Identity {
    fn public_key(&self) -> PeerId {
        self.0
    }
}

struct Node {
    manager: ReplicationManager,
    log: Arc<MemoryLog>,
    peer: PeerId,
}

fn options(request: ReplicationRequest, synchronizer: SynchronizerChoice) -> ReplicationOptions {
    ReplicationOptions {
        request,
        synchronizer,
        role_age_ms: 0,
        debounce_ms: 10,
        wait_retry_interval_ms: 5,
        wait_max_attempts: 4,
        ..ReplicationOptions::default()
    }
}

async fn spawn_node(
    network: &Arc<Network>,
    exchange: &Exchange,
    tag: u8,
    options: ReplicationOptions,
) -> Node {
    let peer = PeerId::from([tag; 32]);
    let log = Arc::new(MemoryLog::new(Arc::clone(exchange)));
    let messenger = Arc::new(Endpoint {
        local: peer,
        network: Arc::clone(network),
    });
    let manager = ReplicationManager::open(
        options,
        Arc::new(Identity(peer)),
        Arc::clone(&log) as Arc<dyn EntryLog>,
        messenger,
    )
    .await
    .unwrap();
    network.register(peer, manager.clone());
    Node { manager, log, peer }
}

/// Let debounced flushes fire and deliver whatever they produced.
async fn settle(network: &Arc<Network>) {
    for _ in 0..6 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        network.pump().await;
    }
}

fn explicit(offset: f64, factor: f64) -> ReplicationRequest {
    ReplicationRequest::Range { offset, factor }
}

#[tokio::test(start_paused = true)]
async fn appended_entry_reaches_covering_peers_only() {
    let network = Arc::new(Network::default());
    let exchange: Exchange = Arc::default();
    let a = spawn_node(&network, &exchange, 1, options(explicit(0.0, 0.5), SynchronizerChoice::Simple)).await;
    let b = spawn_node(&network, &exchange, 2, options(explicit(0.5, 0.5), SynchronizerChoice::Simple)).await;
    let c = spawn_node(&network, &exchange, 3, options(explicit(0.25, 0.5), SynchronizerChoice::Simple)).await;
    for node in [&a, &b, &c] {
        node.manager.announce().await.unwrap();
    }
    network.pump().await;

    // A group key whose coordinate lands strictly inside C's arc but
    // outside B's.
    let resolution = Resolution::U32;
    let domain = HashDomain::new(resolution);
    let lo = resolution.fraction_to_point(0.25);
    let hi = resolution.fraction_to_point(0.5);
    let entry = (0_u32..)
        .map(|nonce| Entry::new(format!("group-{nonce}").into_bytes(), 1_000, b"payload".to_vec()))
        .find(|entry| {
            let coordinate = domain.coordinate_for(entry);
            coordinate > lo && coordinate < hi
        })
        .unwrap();

    a.manager.append(entry.clone()).await.unwrap();
    settle(&network).await;

    assert!(a.log.contains(&entry.hash));
    assert!(c.log.contains(&entry.hash), "covering peer missed the entry");
    assert!(!b.log.contains(&entry.hash), "non-covering peer got the entry");
}

#[tokio::test(start_paused = true)]
async fn coded_symbol_sync_converges_disjoint_logs() {
    let network = Arc::new(Network::default());
    let exchange: Exchange = Arc::default();
    let full = ReplicationRequest::Factor(1.0);
    let a = spawn_node(&network, &exchange, 1, options(full, SynchronizerChoice::RatelessIblt)).await;
    let b = spawn_node(&network, &exchange, 2, options(full, SynchronizerChoice::RatelessIblt)).await;
    a.manager.announce().await.unwrap();
    b.manager.announce().await.unwrap();
    network.pump().await;

    let mut hashes = Vec::new();
    for i in 0_u32..5 {
        let entry = Entry::new(format!("a-{i}").into_bytes(), 1_000, vec![i as u8]);
        hashes.push(entry.hash);
        a.manager.append(entry).await.unwrap();
    }
    for i in 0_u32..3 {
        let entry = Entry::new(format!("b-{i}").into_bytes(), 1_000, vec![i as u8]);
        hashes.push(entry.hash);
        b.manager.append(entry).await.unwrap();
    }
    settle(&network).await;
    settle(&network).await;

    for hash in &hashes {
        assert!(a.log.contains(hash), "first peer is missing an entry");
        assert!(b.log.contains(hash), "second peer is missing an entry");
    }
}

#[tokio::test(start_paused = true)]
async fn pending_sync_counts_an_open_session_once() {
    let network = Arc::new(Network::default());
    let exchange: Exchange = Arc::default();
    let full = ReplicationRequest::Factor(1.0);
    let a = spawn_node(&network, &exchange, 1, options(full, SynchronizerChoice::RatelessIblt)).await;
    let b = spawn_node(&network, &exchange, 2, options(full, SynchronizerChoice::RatelessIblt)).await;
    a.manager.announce().await.unwrap();
    b.manager.announce().await.unwrap();
    network.pump().await;

    let entry = Entry::new(b"solo".to_vec(), 1_000, b"payload".to_vec());
    let hash = entry.hash;
    a.manager.append(entry).await.unwrap();
    // Let the debounced flush open its session toward B, but hold the
    // queued messages back so the session stays in flight.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a.manager.pending_sync().await, 1);

    settle(&network).await;
    assert_eq!(a.manager.pending_sync().await, 0);
    assert!(b.log.contains(&hash));
}

#[tokio::test(start_paused = true)]
async fn coverage_wait_times_out_then_succeeds() {
    let network = Arc::new(Network::default());
    let exchange: Exchange = Arc::default();
    let a = spawn_node(&network, &exchange, 1, options(explicit(0.0, 0.5), SynchronizerChoice::Simple)).await;
    let cancel = CancellationToken::new();

    let err = a
        .manager
        .wait_for_coverage(Span::full(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicationError::Timeout { attempts: 4 }));

    let b = spawn_node(&network, &exchange, 2, options(explicit(0.5, 0.5), SynchronizerChoice::Simple)).await;
    b.manager.announce().await.unwrap();
    network.pump().await;

    let peers = a
        .manager
        .wait_for_coverage(Span::full(), &cancel)
        .await
        .unwrap();
    assert_eq!(peers.len(), 2);
    assert!(peers.contains(&a.peer) && peers.contains(&b.peer));
}

#[tokio::test(start_paused = true)]
async fn coverage_wait_honors_cancellation() {
    let network = Arc::new(Network::default());
    let exchange: Exchange = Arc::default();
    let a = spawn_node(&network, &exchange, 1, options(explicit(0.0, 0.25), SynchronizerChoice::Simple)).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = a
        .manager
        .wait_for_coverage(Span::full(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ReplicationError::Aborted));
}

#[tokio::test(start_paused = true)]
async fn malformed_bytes_are_dropped_not_fatal() {
    let network = Arc::new(Network::default());
    let exchange: Exchange = Arc::default();
    let a = spawn_node(&network, &exchange, 1, options(explicit(0.0, 0.5), SynchronizerChoice::RatelessIblt)).await;

    let rogue = PeerId::from([9; 32]);
    a.manager
        .handle_raw(rogue, &[0xff, 0xee, 0x01])
        .await
        .unwrap();

    // Still fully functional afterwards, and the drop was counted.
    assert_eq!(a.manager.my_segments().await.len(), 1);
    assert_eq!(a.manager.pending_sync().await, 0);
    assert_eq!(a.manager.peer_stats(&rogue).await.decode_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn time_domain_refuses_64_bit_resolution() {
    let network = Arc::new(Network::default());
    let exchange: Exchange = Arc::default();
    let peer = PeerId::from([1; 32]);
    let log = Arc::new(MemoryLog::new(Arc::clone(&exchange)));
    let messenger = Arc::new(Endpoint {
        local: peer,
        network: Arc::clone(&network),
    });
    let options = ReplicationOptions {
        domain: DomainSelection::Time { origin_ms: 0 },
        resolution: Resolution::U64,
        ..ReplicationOptions::default()
    };

    let err = ReplicationManager::open(
        options,
        Arc::new(Identity(peer)),
        log as Arc<dyn EntryLog>,
        messenger,
    )
    .await
    .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ReplicationError>(),
        Some(ReplicationError::Configuration(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn replicate_and_unreplicate_lifecycle() {
    let network = Arc::new(Network::default());
    let exchange: Exchange = Arc::default();
    let a = spawn_node(&network, &exchange, 1, options(ReplicationRequest::Observer, SynchronizerChoice::Simple)).await;

    assert!(a.manager.my_segments().await.is_empty());
    assert_eq!(a.manager.coverage(Span::full()).await, 0.0);

    let mine = a.manager.replicate(ReplicationRequest::Factor(0.25)).await;
    assert_eq!(mine.len(), 1);
    let coverage = a.manager.coverage(Span::full()).await;
    assert!((coverage - 0.25).abs() < 1e-6, "coverage was {coverage}");

    let removed = a.manager.unreplicate(&[mine[0].id()]).await;
    assert_eq!(removed.len(), 1);
    assert!(a.manager.my_segments().await.is_empty());
    assert_eq!(a.manager.coverage(Span::full()).await, 0.0);
}

#[tokio::test(start_paused = true)]
async fn departed_peer_loses_its_coverage() {
    let network = Arc::new(Network::default());
    let exchange: Exchange = Arc::default();
    let a = spawn_node(&network, &exchange, 1, options(explicit(0.0, 0.5), SynchronizerChoice::Simple)).await;
    let b = spawn_node(&network, &exchange, 2, options(explicit(0.5, 0.5), SynchronizerChoice::Simple)).await;
    for node in [&a, &b] {
        node.manager.announce().await.unwrap();
    }
    network.pump().await;

    assert!((a.manager.coverage(Span::full()).await - 1.0).abs() < 1e-9);
    assert_eq!(a.manager.replicators().await.len(), 2);

    a.manager.on_peer_departed(&b.peer).await;
    let coverage = a.manager.coverage(Span::full()).await;
    assert!((coverage - 0.5).abs() < 1e-6, "coverage was {coverage}");
    assert_eq!(a.manager.replicators().await, vec![a.peer]);
}

#[tokio::test(start_paused = true)]
async fn adaptive_tick_resizes_and_sheds_under_pressure() {
    let network = Arc::new(Network::default());
    let exchange: Exchange = Arc::default();
    let a = spawn_node(&network, &exchange, 1, options(ReplicationRequest::Adaptive, SynchronizerChoice::Simple)).await;
    let b = spawn_node(&network, &exchange, 2, options(ReplicationRequest::Adaptive, SynchronizerChoice::Simple)).await;
    a.manager.announce().await.unwrap();
    b.manager.announce().await.unwrap();
    network.pump().await;

    let healthy = a.manager.controller_tick(0.0, 0.0).await.unwrap();
    assert!(healthy > 0.0 && healthy <= 1.0);

    let mut factor = healthy;
    for _ in 0..64 {
        factor = a.manager.controller_tick(1.0, 1.0).await.unwrap();
    }
    assert_eq!(factor, 0.0);
    assert!(a.manager.my_segments().await.is_empty());

    // Non-adaptive logs never tick.
    let c = spawn_node(&network, &exchange, 3, options(explicit(0.0, 0.5), SynchronizerChoice::Simple)).await;
    assert_eq!(c.manager.controller_tick(1.0, 1.0).await, None);
}

/// Domain that reads the coordinate straight out of the grouping key, so
/// tests can place entries at exact ring positions.
struct FixedDomain;

impl ReplicationDomain for FixedDomain {
    fn kind(&self) -> &'static str {
        "fixed"
    }

    fn resolution(&self) -> Resolution {
        Resolution::U32
    }

    fn coordinate_for(&self, entry: &Entry) -> Coordinate {
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(&entry.group_key[..8]);
        Resolution::U32.truncate(u64::from_le_bytes(raw))
    }

    fn initial_range(
        &self,
        request: &ReplicationRequest,
        ctx: &LogContext,
    ) -> Option<ReplicationRange> {
        let ReplicationRequest::Range { offset, factor } = *request else {
            return None;
        };
        Some(ReplicationRange::new(
            ctx.local,
            Resolution::U32.fraction_to_point(offset),
            Resolution::U32.fraction_to_width(factor),
            ctx.now_ms,
        ))
    }
}

#[tokio::test(start_paused = true)]
async fn boundary_entry_pins_the_local_range() {
    let network = Arc::new(Network::default());
    let exchange: Exchange = Arc::default();
    let peer = PeerId::from([1; 32]);
    let log = Arc::new(MemoryLog::new(Arc::clone(&exchange)));
    let messenger = Arc::new(Endpoint {
        local: peer,
        network: Arc::clone(&network),
    });
    let manager = ReplicationManager::open_with_domain(
        options(explicit(0.0, 0.25), SynchronizerChoice::Simple),
        Arc::new(FixedDomain),
        Arc::new(Identity(peer)),
        Arc::clone(&log) as Arc<dyn EntryLog>,
        messenger,
    )
    .await
    .unwrap();
    network.register(peer, manager.clone());

    let boundary = Resolution::U32.fraction_to_point(0.25);
    let entry = Entry::new(boundary.to_le_bytes().to_vec(), 1_000, b"edge".to_vec());
    manager.append(entry).await.unwrap();

    let mine = manager.my_segments().await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].intent, RangeIntent::BoundaryPinned);
}
