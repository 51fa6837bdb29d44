//! Replication toward observers and cross-ownership transfer RPCs.
//!
//! After a simulation pass the engine hands the replicator the set of
//! changed entity ids per network. Only observers whose last known
//! position is within the notify range of at least one changed entity
//! receive a notice; nothing broadcasts to the whole population.
//!
//! Resources that live on a remote peer (an observer's personal energy
//! pool, fuel items in an observer's inventory) are never mutated here.
//! Transfers cross the ownership boundary as request → commit pairs keyed
//! by correlation id: the remote owner applies the delta and remains the
//! source of truth, and consumables pulled from an inventory are only
//! discarded remotely once the commit releases the pending reservation.

use std::collections::{HashMap, HashSet};

use powernet_logic::consumer::IntensityLevel;
use powernet_logic::geometry::Vec3;
use serde::{Deserialize, Serialize};

use crate::bridge::Field;
use crate::record::{RecordId, RecordStore};
use crate::registry::Registry;

/// Observer identity (a remote peer).
pub type ObserverId = i64;

/// Reported level of one observer pool inside a pool offer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoolLevel {
    pub observer: ObserverId,
    pub amount: f32,
    pub capacity: f32,
}

/// Wire messages. Field order is the wire order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Authority → observer: these entities of a network changed.
    ChangedEntities {
        network_id: String,
        entities: Vec<RecordId>,
    },
    /// Observer → authority: operator changed a consumer's settings.
    ConsumerUpdate {
        entity: RecordId,
        is_demanding: bool,
        base_consumption: f32,
        intensity: i64,
    },
    /// Observer → authority: current levels of the pools an observer has
    /// connected to a conduit.
    PoolOffer {
        entity: RecordId,
        pools: Vec<PoolLevel>,
    },
    /// Authority → observer: credit this amount to your pool. The pool is
    /// remote-owned; the observer applies it and is authoritative after.
    PoolCredit {
        entity: RecordId,
        observer: ObserverId,
        amount: f32,
    },
    /// Observer → authority: add fuel to a source. The observer holds the
    /// fuel items reserved until the matching commit arrives.
    FuelAddRequest {
        entity: RecordId,
        amount: f32,
        correlation: u64,
    },
    /// Authority → observer: the fuel transfer landed; release the
    /// reservation and discard the consumed items.
    FuelAddCommit { correlation: u64 },
}

/// Logical channels a transport must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    ChangeNotice,
    ConsumerUpdate,
    PoolOffer,
    PoolCredit,
    FuelTransfer,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::ChangeNotice,
        Channel::ConsumerUpdate,
        Channel::PoolOffer,
        Channel::PoolCredit,
        Channel::FuelTransfer,
    ];

    fn of(message: &WireMessage) -> Channel {
        match message {
            WireMessage::ChangedEntities { .. } => Channel::ChangeNotice,
            WireMessage::ConsumerUpdate { .. } => Channel::ConsumerUpdate,
            WireMessage::PoolOffer { .. } => Channel::PoolOffer,
            WireMessage::PoolCredit { .. } => Channel::PoolCredit,
            WireMessage::FuelAddRequest { .. } | WireMessage::FuelAddCommit { .. } => {
                Channel::FuelTransfer
            }
        }
    }
}

/// Replication failure. Registration failures are tolerated; codec
/// failures are surfaced to the caller that fed the bytes in.
#[derive(Debug)]
pub enum ReplicationError {
    ChannelUnavailable(Channel),
    Codec(String),
    Send(String),
}

impl std::fmt::Display for ReplicationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationError::ChannelUnavailable(c) => write!(f, "channel {:?} unavailable", c),
            ReplicationError::Codec(e) => write!(f, "codec failure: {}", e),
            ReplicationError::Send(e) => write!(f, "send failure: {}", e),
        }
    }
}

impl std::error::Error for ReplicationError {}

/// Encode a message for the wire.
pub fn encode(message: &WireMessage) -> Result<Vec<u8>, ReplicationError> {
    bincode::serialize(message).map_err(|e| ReplicationError::Codec(e.to_string()))
}

/// Decode a message from the wire.
pub fn decode(bytes: &[u8]) -> Result<WireMessage, ReplicationError> {
    bincode::deserialize(bytes).map_err(|e| ReplicationError::Codec(e.to_string()))
}

/// What the replicator needs from the host's transport.
pub trait Transport {
    /// Register a logical channel at startup. May fail per channel.
    fn register_channel(&mut self, channel: Channel) -> Result<(), String>;

    /// Deliver an encoded message to one observer.
    fn send(&mut self, observer: ObserverId, payload: &[u8]) -> Result<(), String>;
}

/// Authoritative-side replication state.
#[derive(Debug, Default)]
pub struct Replicator {
    notify_range_sq: f32,
    /// Last known observer positions, updated by the host.
    observers: HashMap<ObserverId, Vec3>,
    /// Channels that failed to register; sends on them are skipped.
    disabled: HashSet<Channel>,
}

impl Replicator {
    pub fn new(notify_range: f32) -> Self {
        Self {
            notify_range_sq: notify_range * notify_range,
            observers: HashMap::new(),
            disabled: HashSet::new(),
        }
    }

    /// Register every channel on the transport. A channel that fails to
    /// register is logged and disabled; the rest of the subsystem keeps
    /// running without it.
    pub fn bind(&mut self, transport: &mut dyn Transport) {
        for channel in Channel::ALL {
            if let Err(err) = transport.register_channel(channel) {
                log::warn!("failed to register channel {:?}: {}", channel, err);
                self.disabled.insert(channel);
            }
        }
    }

    pub fn channel_enabled(&self, channel: Channel) -> bool {
        !self.disabled.contains(&channel)
    }

    /// Record where an observer was last seen.
    pub fn update_observer(&mut self, observer: ObserverId, position: Vec3) {
        self.observers.insert(observer, position);
    }

    /// Forget an observer (disconnected or despawned).
    pub fn remove_observer(&mut self, observer: ObserverId) {
        self.observers.remove(&observer);
    }

    /// Drop every tracked observer not present in `live`. Stale references
    /// are pruned rather than failing any caller.
    pub fn sanitize(&mut self, live: &HashSet<ObserverId>) {
        self.observers.retain(|observer, _| live.contains(observer));
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    fn send(
        &mut self,
        transport: &mut dyn Transport,
        observer: ObserverId,
        message: &WireMessage,
    ) -> Result<(), ReplicationError> {
        let channel = Channel::of(message);
        if self.disabled.contains(&channel) {
            return Err(ReplicationError::ChannelUnavailable(channel));
        }
        let payload = encode(message)?;
        transport
            .send(observer, &payload)
            .map_err(ReplicationError::Send)
    }

    /// Notify observers near any changed entity of a network. Returns the
    /// observers that were notified.
    pub fn notify_changed(
        &mut self,
        transport: &mut dyn Transport,
        store: &dyn RecordStore,
        network_id: &str,
        changed: &[RecordId],
    ) -> Vec<ObserverId> {
        if changed.is_empty() || !self.channel_enabled(Channel::ChangeNotice) {
            return Vec::new();
        }
        let positions: Vec<Vec3> = changed.iter().filter_map(|&id| store.position(id)).collect();
        let mut targets: Vec<ObserverId> = self
            .observers
            .iter()
            .filter(|(_, observer_pos)| {
                positions
                    .iter()
                    .any(|p| p.dist_sq(observer_pos) <= self.notify_range_sq)
            })
            .map(|(&observer, _)| observer)
            .collect();
        targets.sort_unstable();

        let message = WireMessage::ChangedEntities {
            network_id: network_id.to_string(),
            entities: changed.to_vec(),
        };
        let mut notified = Vec::new();
        for observer in targets {
            match self.send(transport, observer, &message) {
                Ok(()) => notified.push(observer),
                Err(err) => log::warn!("change notice to observer {} failed: {}", observer, err),
            }
        }
        notified
    }

    /// Send the pool credits a settlement granted through drain conduits.
    pub fn send_pool_credits(
        &mut self,
        transport: &mut dyn Transport,
        grants: &[powernet_logic::resolve::PoolGrant],
    ) {
        for grant in grants {
            if grant.amount <= 0.0 {
                continue;
            }
            let message = WireMessage::PoolCredit {
                entity: grant.conduit,
                observer: grant.observer,
                amount: grant.amount,
            };
            if let Err(err) = self.send(transport, grant.observer, &message) {
                log::warn!("pool credit to observer {} failed: {}", grant.observer, err);
            }
        }
    }

    /// Apply an inbound observer → authority message to the registry.
    /// Unknown entity ids are ignored; the observer may be ahead of or
    /// behind our registry, and absence must be tolerated.
    pub fn handle_inbound(
        &mut self,
        transport: &mut dyn Transport,
        registry: &mut Registry,
        from: ObserverId,
        message: WireMessage,
    ) {
        match message {
            WireMessage::ConsumerUpdate {
                entity,
                is_demanding,
                base_consumption,
                intensity,
            } => {
                let Some(entry) = registry.get_mut(entity) else {
                    return;
                };
                let Some(consumer) = entry.data.as_consumer_mut() else {
                    return;
                };
                consumer.is_demanding = is_demanding;
                consumer.base_power_consumption = base_consumption;
                consumer.intensity = IntensityLevel::from_i64(intensity);
                entry.persist.mark_dirty(Field::IsDemanding);
                entry.persist.mark_dirty(Field::IntensityLevel);
            }
            WireMessage::PoolOffer { entity, pools } => {
                let Some(entry) = registry.get_mut(entity) else {
                    return;
                };
                let Some(conduit) = entry.data.as_conduit_mut() else {
                    return;
                };
                for level in pools {
                    conduit.update_pool(level.observer, level.amount, level.capacity);
                }
            }
            WireMessage::FuelAddRequest {
                entity,
                amount,
                correlation,
            } => {
                let accepted = registry
                    .get_mut(entity)
                    .and_then(|entry| {
                        let source = entry.data.as_source_mut()?;
                        let accepted = source.add_fuel(amount);
                        if accepted > 0.0 {
                            entry.persist.mark_dirty(Field::Fuel);
                        }
                        Some(accepted)
                    })
                    .unwrap_or(0.0);
                if accepted > 0.0 {
                    let commit = WireMessage::FuelAddCommit { correlation };
                    if let Err(err) = self.send(transport, from, &commit) {
                        log::warn!("fuel commit to observer {} failed: {}", from, err);
                    }
                }
            }
            // Authority → observer shapes arriving here are a peer bug;
            // drop them rather than failing the caller.
            WireMessage::ChangedEntities { .. }
            | WireMessage::PoolCredit { .. }
            | WireMessage::FuelAddCommit { .. } => {}
        }
    }
}

/// Observer-side ledger of fuel reservations awaiting commit.
///
/// `reserve` holds the items and yields the correlation id to put on the
/// request; `release` on commit tells the caller how much to actually
/// discard. Items are never discarded while a reservation is pending, so
/// a request lost in transit can be safely re-issued or abandoned.
#[derive(Debug, Default)]
pub struct ReservationLedger {
    next_correlation: u64,
    pending: HashMap<u64, f32>,
}

impl ReservationLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reserve(&mut self, amount: f32) -> u64 {
        self.next_correlation += 1;
        self.pending.insert(self.next_correlation, amount);
        self.next_correlation
    }

    /// Release a committed reservation. Unknown correlations return
    /// `None` (duplicate or stray commit) and change nothing.
    pub fn release(&mut self, correlation: u64) -> Option<f32> {
        self.pending.remove(&correlation)
    }

    /// Abandon a reservation without consuming anything (request failed).
    pub fn cancel(&mut self, correlation: u64) -> Option<f32> {
        self.pending.remove(&correlation)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Observer-side view of network membership, fed by change notices.
///
/// A notice for a network the view has never heard of triggers one full
/// refresh and a single retry; a second miss is logged and dropped.
#[derive(Debug, Default)]
pub struct ClientView {
    networks: HashMap<String, Vec<RecordId>>,
}

impl ClientView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole view (initial sync or recovery refresh).
    pub fn replace(&mut self, networks: HashMap<String, Vec<RecordId>>) {
        self.networks = networks;
    }

    pub fn members(&self, network_id: &str) -> Option<&[RecordId]> {
        self.networks.get(network_id).map(Vec::as_slice)
    }

    /// Handle a changed-entities notice. `refresh` produces a full view
    /// on a cache miss; it runs at most once per notice.
    pub fn handle_changed(
        &mut self,
        network_id: &str,
        entities: &[RecordId],
        refresh: impl FnOnce() -> HashMap<String, Vec<RecordId>>,
    ) -> bool {
        if !self.networks.contains_key(network_id) {
            self.replace(refresh());
            if !self.networks.contains_key(network_id) {
                log::warn!("change notice for unknown network {} after refresh", network_id);
                return false;
            }
        }
        let members = self.networks.entry(network_id.to_string()).or_default();
        for &id in entities {
            if !members.contains(&id) {
                members.push(id);
            }
        }
        true
    }
}

/// In-process transport used by tests and the simtest harness: delivers
/// by pushing onto per-observer queues.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    pub delivered: HashMap<ObserverId, Vec<Vec<u8>>>,
    /// Channels that refuse to register, for failure-path tests.
    pub refuse: HashSet<Channel>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&mut self, observer: ObserverId) -> Vec<WireMessage> {
        self.delivered
            .remove(&observer)
            .unwrap_or_default()
            .iter()
            .filter_map(|bytes| decode(bytes).ok())
            .collect()
    }
}

impl Transport for LoopbackTransport {
    fn register_channel(&mut self, channel: Channel) -> Result<(), String> {
        if self.refuse.contains(&channel) {
            Err(format!("{:?} refused", channel))
        } else {
            Ok(())
        }
    }

    fn send(&mut self, observer: ObserverId, payload: &[u8]) -> Result<(), String> {
        self.delivered.entry(observer).or_default().push(payload.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use powernet_logic::config::PowerConfig;
    use powernet_logic::entity::{ComputeData, PrefabKind};

    use crate::record::MemoryStore;

    #[test]
    fn test_codec_roundtrip() {
        let message = WireMessage::ChangedEntities {
            network_id: "net-0-abc".to_string(),
            entities: vec![1, 2, 3],
        };
        let decoded = decode(&encode(&message).unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_notify_scoped_to_nearby_observers() {
        let mut transport = LoopbackTransport::new();
        let mut replicator = Replicator::new(40.0);
        replicator.bind(&mut transport);

        let mut store = MemoryStore::new();
        store.insert(1, Vec3::new(0.0, 0.0, 0.0));
        store.insert(2, Vec3::new(10.0, 0.0, 0.0));

        replicator.update_observer(100, Vec3::new(30.0, 0.0, 0.0)); // near entity 2
        replicator.update_observer(200, Vec3::new(500.0, 0.0, 0.0)); // far from both

        let notified = replicator.notify_changed(&mut transport, &store, "net-x", &[1, 2]);
        assert_eq!(notified, vec![100]);
        assert_eq!(transport.drain(100).len(), 1);
        assert!(transport.drain(200).is_empty());
    }

    #[test]
    fn test_failed_channel_is_disabled_not_fatal() {
        let mut transport = LoopbackTransport::new();
        transport.refuse.insert(Channel::ChangeNotice);
        let mut replicator = Replicator::new(40.0);
        replicator.bind(&mut transport);
        assert!(!replicator.channel_enabled(Channel::ChangeNotice));
        assert!(replicator.channel_enabled(Channel::FuelTransfer));

        let store = MemoryStore::new();
        let notified = replicator.notify_changed(&mut transport, &store, "net-x", &[1]);
        assert!(notified.is_empty());
    }

    #[test]
    fn test_fuel_request_commits_back_and_releases_reservation() {
        let mut transport = LoopbackTransport::new();
        let mut replicator = Replicator::new(40.0);
        replicator.bind(&mut transport);

        let config = PowerConfig::default();
        let mut registry = Registry::new();
        registry.register(5, ComputeData::from_prefab(PrefabKind::Generator, &config));

        // Observer side: reserve fuel items, send the request.
        let mut ledger = ReservationLedger::new();
        let correlation = ledger.reserve(8.0);
        assert_eq!(ledger.pending_count(), 1);

        replicator.handle_inbound(
            &mut transport,
            &mut registry,
            42,
            WireMessage::FuelAddRequest {
                entity: 5,
                amount: 8.0,
                correlation,
            },
        );

        // Authority applied the fuel and committed back.
        let fuel = registry.get(5).unwrap().data.as_source().unwrap().fuel;
        assert_eq!(fuel, 8.0);
        let responses = transport.drain(42);
        assert_eq!(responses, vec![WireMessage::FuelAddCommit { correlation }]);

        // Observer discards the items only now.
        assert_eq!(ledger.release(correlation), Some(8.0));
        assert_eq!(ledger.pending_count(), 0);
        // A duplicate commit changes nothing.
        assert_eq!(ledger.release(correlation), None);

        // A request the observer abandons is cancelled, not consumed.
        let abandoned = ledger.reserve(3.0);
        assert_eq!(ledger.cancel(abandoned), Some(3.0));
        assert_eq!(ledger.pending_count(), 0);
    }

    #[test]
    fn test_consumer_update_marks_dirty() {
        let mut transport = LoopbackTransport::new();
        let mut replicator = Replicator::new(40.0);
        let config = PowerConfig::default();
        let mut registry = Registry::new();
        registry.register(9, ComputeData::from_prefab(PrefabKind::Machine, &config));

        replicator.handle_inbound(
            &mut transport,
            &mut registry,
            7,
            WireMessage::ConsumerUpdate {
                entity: 9,
                is_demanding: true,
                base_consumption: 4.0,
                intensity: 2,
            },
        );

        let entry = registry.get(9).unwrap();
        let consumer = entry.data.as_consumer().unwrap();
        assert!(consumer.is_demanding);
        assert_eq!(consumer.base_power_consumption, 4.0);
        assert_eq!(consumer.intensity, IntensityLevel::High);
        assert!(entry.persist.is_dirty(Field::IsDemanding));
    }

    #[test]
    fn test_pool_offer_updates_conduit_cache() {
        let mut transport = LoopbackTransport::new();
        let mut replicator = Replicator::new(40.0);
        let config = PowerConfig::default();
        let mut registry = Registry::new();
        registry.register(3, ComputeData::from_prefab(PrefabKind::ChargePad, &config));

        replicator.handle_inbound(
            &mut transport,
            &mut registry,
            7,
            WireMessage::PoolOffer {
                entity: 3,
                pools: vec![PoolLevel {
                    observer: 7,
                    amount: 12.0,
                    capacity: 60.0,
                }],
            },
        );

        let conduit = registry.get(3).unwrap().data.as_conduit().unwrap();
        assert_eq!(conduit.pool_deficit(), 48.0);
    }

    #[test]
    fn test_client_view_refreshes_once_on_miss() {
        let mut view = ClientView::new();
        let mut refreshed = 0;
        let handled = view.handle_changed("net-a", &[1, 2], || {
            refreshed += 1;
            let mut map = HashMap::new();
            map.insert("net-a".to_string(), vec![1]);
            map
        });
        assert!(handled);
        assert_eq!(refreshed, 1);
        assert_eq!(view.members("net-a"), Some(&[1, 2][..]));

        // Known network: no refresh.
        let handled = view.handle_changed("net-a", &[3], || unreachable!());
        assert!(handled);

        // Unknown even after refresh: dropped.
        let handled = view.handle_changed("net-z", &[9], HashMap::new);
        assert!(!handled);
    }

    #[test]
    fn test_sanitize_prunes_stale_observers() {
        let mut replicator = Replicator::new(40.0);
        replicator.update_observer(1, Vec3::default());
        replicator.update_observer(2, Vec3::default());
        let live: HashSet<ObserverId> = [2].into_iter().collect();
        replicator.sanitize(&live);
        assert_eq!(replicator.observer_count(), 1);
    }
}
