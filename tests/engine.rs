//! End-to-end allocation scenarios across engine, stores, configuration
//! backend and snapshot publication.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use shadowlease::alloc::{AllocEngine, ClientContext4, EngineConfig};
use shadowlease::configdb::{
    ConfigBackend, MemoryConfigBackend, Pool4, ServerSelector, Subnet4,
};
use shadowlease::leasedb::{LeaseStore, MemoryLeaseStore, SqliteLeaseStore};
use shadowlease::reclaim::Reclaimer;
use shadowlease::reservations::ReservationDb;
use shadowlease::snapshot::{ConfigPoller, ConfigSnapshot, SnapshotHandle};
use shadowlease::{ClientId, Error, SubnetId};

fn pool_subnet(id: u32, prefix: &str, start: &str, end: &str) -> Subnet4 {
    let mut subnet = Subnet4::new(SubnetId::from_raw(id), prefix.parse().unwrap(), 3600);
    subnet
        .pools
        .push(Pool4::new(start.parse().unwrap(), end.parse().unwrap()).unwrap());
    subnet
}

fn engine_on(store: Arc<dyn LeaseStore>) -> AllocEngine {
    engine_with_config(store, EngineConfig::default())
}

fn engine_with_config(store: Arc<dyn LeaseStore>, config: EngineConfig) -> AllocEngine {
    let backend = MemoryConfigBackend::new();
    backend
        .upsert_subnet4(
            &ServerSelector::AllServers,
            pool_subnet(7, "192.0.2.0/29", "192.0.2.2", "192.0.2.6"),
        )
        .unwrap();
    let snapshot = ConfigSnapshot::build(&backend, &ServerSelector::AllServers).unwrap();
    AllocEngine::new(
        store,
        Arc::new(ReservationDb::new()),
        Arc::new(SnapshotHandle::new(snapshot)),
        config,
    )
}

fn client(octets: &[u8], now: i64) -> ClientContext4 {
    let mut ctx = ClientContext4::new(SubnetId::from_raw(7), now);
    ctx.client_id = Some(ClientId::new(octets.to_vec()).unwrap());
    ctx.deadline = Instant::now() + Duration::from_secs(10);
    ctx
}

// Five concurrent distinct clients on a five-address pool: everyone is
// served, nobody livelocks, and the sixth client gets a clean NAK.
#[test]
fn concurrent_clients_fill_the_pool_exactly() {
    let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
    let engine = Arc::new(engine_on(Arc::clone(&store)));

    let handles: Vec<_> = (0..5u8)
        .map(|i| {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.allocate4(&client(&[0x01, i], 100)))
        })
        .collect();

    let mut addrs: Vec<Ipv4Addr> = handles
        .into_iter()
        .map(|h| h.join().unwrap().unwrap().addr)
        .collect();
    addrs.sort_unstable();
    addrs.dedup();
    assert_eq!(addrs.len(), 5, "five distinct addresses");

    let err = engine.allocate4(&client(&[0x01, 0xff], 100)).unwrap_err();
    assert!(matches!(err, Error::NoAddressAvailable(_)));
}

// The same scenario through the SQLite backend: the trait contract, not
// the backend, is what the engine depends on.
#[test]
fn sqlite_backend_serves_the_same_flow() {
    let store: Arc<dyn LeaseStore> = Arc::new(SqliteLeaseStore::open_in_memory().unwrap());
    let engine = engine_on(Arc::clone(&store));

    for i in 0..5u8 {
        engine.allocate4(&client(&[0x02, i], 100)).unwrap();
    }
    assert!(matches!(
        engine.allocate4(&client(&[0x02, 0xff], 100)),
        Err(Error::NoAddressAvailable(_))
    ));

    // renewal touches the same row instead of burning a new address
    let renewed = engine.allocate4(&client(&[0x02, 0], 101)).unwrap();
    assert_eq!(renewed.cltt, 101);
    assert_eq!(store.leases4_in_subnet(SubnetId::from_raw(7)).unwrap().len(), 5);
}

// Uniqueness under direct concurrent inserts: for one address, only one
// non-reclaimed lease is ever observable.
#[test]
fn concurrent_add_lease_commits_exactly_once() {
    let store = Arc::new(MemoryLeaseStore::new());
    let addr = Ipv4Addr::new(203, 0, 113, 50);

    let handles: Vec<_> = (0..8u8)
        .map(|i| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                let mut lease = shadowlease::Lease4::new(addr, SubnetId::from_raw(1), 3600, 100);
                lease.client_id = Some(ClientId::new(vec![0x05, i]).unwrap());
                store.add_lease4(lease).unwrap()
            })
        })
        .collect();

    let winners = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(winners, 1);
}

// Decline quarantines the address; after the probation runs out one
// reclamation pass frees it and the next client may take it.
#[test]
fn decline_reclaim_reallocate_lifecycle() {
    let store: Arc<dyn LeaseStore> = Arc::new(MemoryLeaseStore::new());
    let config = EngineConfig {
        probation_secs: 600,
        ..EngineConfig::default()
    };
    let engine = engine_with_config(Arc::clone(&store), config);

    // fill the pool, then poison one address
    let declined_addr = engine.allocate4(&client(&[0x03, 0x00], 100)).unwrap().addr;
    for i in 1..5u8 {
        engine.allocate4(&client(&[0x03, i], 100)).unwrap();
    }
    engine.decline4(declined_addr, 200).unwrap();

    // quarantined plus four active leases: nothing left to hand out
    assert!(matches!(
        engine.allocate4(&client(&[0x04, 0x01], 300)),
        Err(Error::NoAddressAvailable(_))
    ));

    // quarantine ends at 800; the other leases stay active until 3700
    let reclaimer = Reclaimer::new(Arc::clone(&store), 7 * 86_400, 100);
    let stats = reclaimer.run_once(900).unwrap();
    assert_eq!(stats.reclaimed4, 1);

    let back = engine.allocate4(&client(&[0x04, 0x02], 950)).unwrap();
    assert_eq!(back.addr, declined_addr);
}

// A configuration change lands in the backend, the poller tails the audit
// log, and requests after the swap allocate from the new subnet while
// in-flight requests keep their old view.
#[test]
fn reconfiguration_swaps_atomically() {
    let backend = Arc::new(MemoryConfigBackend::new());
    backend
        .upsert_subnet4(
            &ServerSelector::AllServers,
            pool_subnet(7, "192.0.2.0/29", "192.0.2.2", "192.0.2.6"),
        )
        .unwrap();

    let handle = Arc::new(SnapshotHandle::default());
    let mut poller = ConfigPoller::new(
        Arc::clone(&backend) as Arc<dyn ConfigBackend>,
        Arc::clone(&handle),
        ServerSelector::AllServers,
    );
    poller.prime().unwrap();

    let engine = AllocEngine::new(
        Arc::new(MemoryLeaseStore::new()),
        Arc::new(ReservationDb::new()),
        Arc::clone(&handle),
        EngineConfig::default(),
    );

    // unknown subnet until the next snapshot
    let mut ctx = ClientContext4::new(SubnetId::from_raw(9), 100);
    ctx.client_id = Some(ClientId::new(vec![0x06, 0x01]).unwrap());
    ctx.deadline = Instant::now() + Duration::from_secs(10);
    assert!(matches!(engine.allocate4(&ctx), Err(Error::BadValue(_))));

    backend
        .upsert_subnet4(
            &ServerSelector::AllServers,
            pool_subnet(9, "198.51.100.0/24", "198.51.100.10", "198.51.100.20"),
        )
        .unwrap();
    assert!(poller.poll().unwrap());

    let lease = engine.allocate4(&ctx).unwrap();
    assert!(lease.addr >= "198.51.100.10".parse::<std::net::Ipv4Addr>().unwrap());
    assert!(lease.addr <= "198.51.100.20".parse::<std::net::Ipv4Addr>().unwrap());
}
