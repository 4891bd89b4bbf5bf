//! Sled-backed repository.
//!
//! One tree per entity; keys are big-endian composites so range scans come
//! back in chronological/sequence order. Values are JSON. Writes rely on
//! sled's background flushing; on crash the last few writes may be lost,
//! which the engine tolerates (positions are re-ingested, ETA samples are
//! regenerated on the next fix).

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::{EventRecord, RepoError, Repository};
use crate::types::{
    Advisory, EntityId, EtaSample, Reroute, RerouteStatus, Route, Shipment, ShipmentStatus,
    SnappedPoint, Stop,
};

/// Separator between the vehicle id and the timestamp in position keys.
/// Vehicle ids are validated printable ASCII, so 0x00 cannot collide.
const KEY_SEP: u8 = 0x00;

#[derive(Clone)]
pub struct SledRepository {
    db: Arc<sled::Db>,
    shipments: sled::Tree,
    shipment_refs: sled::Tree,
    vehicle_index: sled::Tree,
    stops: sled::Tree,
    stop_index: sled::Tree,
    positions: sled::Tree,
    routes: sled::Tree,
    reroutes: sled::Tree,
    advisories: sled::Tree,
    eta_latest: sled::Tree,
    events: sled::Tree,
    meta: sled::Tree,
    /// Tie-break counter for equal-timestamp audit events.
    event_seq: Arc<AtomicU64>,
}

impl SledRepository {
    /// Open or create the repository at the given directory.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RepoError> {
        let db = sled::open(path)?;
        Ok(Self {
            shipments: db.open_tree("shipments")?,
            shipment_refs: db.open_tree("shipment_refs")?,
            vehicle_index: db.open_tree("vehicle_index")?,
            stops: db.open_tree("stops")?,
            stop_index: db.open_tree("stop_index")?,
            positions: db.open_tree("positions")?,
            routes: db.open_tree("routes")?,
            reroutes: db.open_tree("reroutes")?,
            advisories: db.open_tree("advisories")?,
            eta_latest: db.open_tree("eta_latest")?,
            events: db.open_tree("events")?,
            meta: db.open_tree("meta")?,
            db: Arc::new(db),
            event_seq: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Flush pending writes; called on shutdown.
    pub fn flush(&self) -> Result<(), RepoError> {
        self.db.flush()?;
        Ok(())
    }

    fn id_key(id: EntityId) -> [u8; 8] {
        id.to_be_bytes()
    }

    fn pair_key(a: EntityId, b: EntityId) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&a.to_be_bytes());
        key[8..].copy_from_slice(&b.to_be_bytes());
        key
    }

    fn stop_key(shipment_id: EntityId, sequence: u32) -> [u8; 12] {
        let mut key = [0u8; 12];
        key[..8].copy_from_slice(&shipment_id.to_be_bytes());
        key[8..].copy_from_slice(&sequence.to_be_bytes());
        key
    }

    fn position_key(vehicle_id: &str, ts: DateTime<Utc>) -> Vec<u8> {
        let mut key = Vec::with_capacity(vehicle_id.len() + 9);
        key.extend_from_slice(vehicle_id.as_bytes());
        key.push(KEY_SEP);
        key.extend_from_slice(&ts.timestamp_millis().to_be_bytes());
        key
    }

    /// Record an allocated id so `max_allocated_id` survives restarts.
    fn note_id(&self, id: EntityId) -> Result<(), RepoError> {
        self.meta.fetch_and_update("max_id", |old| {
            let current = old
                .and_then(|bytes| bytes.try_into().ok().map(u64::from_be_bytes))
                .unwrap_or(0);
            Some(current.max(id).to_be_bytes().to_vec())
        })?;
        Ok(())
    }

    fn load_shipment(&self, id: EntityId) -> Result<Shipment, RepoError> {
        let bytes = self
            .shipments
            .get(Self::id_key(id))?
            .ok_or_else(|| RepoError::not_found("shipment", id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write_shipment_indexes(&self, shipment: &Shipment) -> Result<(), RepoError> {
        self.shipment_refs
            .insert(shipment.reference.as_bytes(), &Self::id_key(shipment.id))?;
        if shipment.status.is_terminal() {
            // Only clear the vehicle mapping if it still points at us; the
            // vehicle may already be reassigned to a newer shipment.
            if let Some(bytes) = self.vehicle_index.get(shipment.vehicle_id.as_bytes())? {
                if bytes.as_ref() == Self::id_key(shipment.id) {
                    self.vehicle_index.remove(shipment.vehicle_id.as_bytes())?;
                }
            }
        } else {
            self.vehicle_index
                .insert(shipment.vehicle_id.as_bytes(), &Self::id_key(shipment.id))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for SledRepository {
    async fn get_shipment_by_id(&self, id: EntityId) -> Result<Shipment, RepoError> {
        self.load_shipment(id)
    }

    async fn get_shipment_by_reference(&self, reference: &str) -> Result<Shipment, RepoError> {
        let bytes = self
            .shipment_refs
            .get(reference.as_bytes())?
            .ok_or_else(|| RepoError::not_found("shipment", reference))?;
        let id = u64::from_be_bytes(
            bytes
                .as_ref()
                .try_into()
                .map_err(|_| RepoError::Transient("corrupt reference index".to_string()))?,
        );
        self.load_shipment(id)
    }

    async fn list_active_shipments(&self) -> Result<Vec<Shipment>, RepoError> {
        let mut out = Vec::new();
        for item in self.shipments.iter() {
            let (_, value) = item?;
            let shipment: Shipment = serde_json::from_slice(&value)?;
            if !shipment.status.is_terminal() {
                out.push(shipment);
            }
        }
        Ok(out)
    }

    async fn active_shipment_for_vehicle(&self, vehicle_id: &str) -> Result<Shipment, RepoError> {
        let bytes = self
            .vehicle_index
            .get(vehicle_id.as_bytes())?
            .ok_or_else(|| RepoError::not_found("vehicle", vehicle_id))?;
        let id = u64::from_be_bytes(
            bytes
                .as_ref()
                .try_into()
                .map_err(|_| RepoError::Transient("corrupt vehicle index".to_string()))?,
        );
        let shipment = self.load_shipment(id)?;
        if shipment.status.is_terminal() {
            return Err(RepoError::not_found("active shipment", vehicle_id));
        }
        Ok(shipment)
    }

    async fn insert_shipment(&self, shipment: &Shipment, stops: &[Stop]) -> Result<(), RepoError> {
        self.shipments
            .insert(Self::id_key(shipment.id), serde_json::to_vec(shipment)?)?;
        self.write_shipment_indexes(shipment)?;
        self.note_id(shipment.id)?;
        for stop in stops {
            let key = Self::stop_key(shipment.id, stop.sequence);
            self.stops.insert(key, serde_json::to_vec(stop)?)?;
            self.stop_index.insert(Self::id_key(stop.id), &key)?;
            self.note_id(stop.id)?;
        }
        debug!(shipment_id = shipment.id, stops = stops.len(), "Shipment inserted");
        Ok(())
    }

    async fn update_shipment(&self, shipment: &Shipment) -> Result<(), RepoError> {
        let current = self.load_shipment(shipment.id)?;
        if current.version + 1 != shipment.version {
            return Err(RepoError::Conflict {
                entity: "shipment",
                detail: format!(
                    "version {} does not follow stored {}",
                    shipment.version, current.version
                ),
            });
        }
        let old_bytes = serde_json::to_vec(&current)?;
        let new_bytes = serde_json::to_vec(shipment)?;
        self.shipments
            .compare_and_swap(Self::id_key(shipment.id), Some(old_bytes), Some(new_bytes))?
            .map_err(|_| RepoError::Conflict {
                entity: "shipment",
                detail: "concurrent modification".to_string(),
            })?;
        self.write_shipment_indexes(shipment)?;
        Ok(())
    }

    async fn append_positions(
        &self,
        vehicle_id: &str,
        points: &[SnappedPoint],
    ) -> Result<usize, RepoError> {
        let mut inserted = 0;
        for point in points {
            let key = Self::position_key(vehicle_id, point.position.ts);
            if self.positions.contains_key(&key)? {
                continue;
            }
            self.positions.insert(key, serde_json::to_vec(point)?)?;
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn get_stops(&self, shipment_id: EntityId) -> Result<Vec<Stop>, RepoError> {
        let prefix = Self::id_key(shipment_id);
        let mut stops = Vec::new();
        for item in self.stops.scan_prefix(prefix) {
            let (_, value) = item?;
            stops.push(serde_json::from_slice::<Stop>(&value)?);
        }
        // Keys are (shipment, sequence) big-endian, so this is already
        // sequence order; sort anyway to keep the contract explicit.
        stops.sort_by_key(|s| s.sequence);
        Ok(stops)
    }

    async fn update_stop_actual(
        &self,
        stop_id: EntityId,
        arrival: Option<DateTime<Utc>>,
        departure: Option<DateTime<Utc>>,
        completed: bool,
    ) -> Result<(), RepoError> {
        let key = self
            .stop_index
            .get(Self::id_key(stop_id))?
            .ok_or_else(|| RepoError::not_found("stop", stop_id))?;
        let bytes = self
            .stops
            .get(&key)?
            .ok_or_else(|| RepoError::not_found("stop", stop_id))?;
        let mut stop: Stop = serde_json::from_slice(&bytes)?;
        if let Some(at) = arrival {
            stop.actual_arrival.get_or_insert(at);
        }
        if let Some(at) = departure {
            stop.actual_departure = Some(at);
        }
        stop.completed = stop.completed || completed;
        self.stops.insert(key, serde_json::to_vec(&stop)?)?;
        Ok(())
    }

    async fn insert_route(&self, route: &Route) -> Result<(), RepoError> {
        self.routes
            .insert(Self::id_key(route.id), serde_json::to_vec(route)?)?;
        self.note_id(route.id)?;
        Ok(())
    }

    async fn get_route(&self, route_id: EntityId) -> Result<Route, RepoError> {
        let bytes = self
            .routes
            .get(Self::id_key(route_id))?
            .ok_or_else(|| RepoError::not_found("route", route_id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn get_active_route(&self, shipment_id: EntityId) -> Result<Route, RepoError> {
        let shipment = self.load_shipment(shipment_id)?;
        let route_id = shipment
            .active_route_id
            .ok_or_else(|| RepoError::not_found("active route", shipment_id))?;
        self.get_route(route_id).await
    }

    async fn replace_active_route_with_reroute(
        &self,
        shipment_id: EntityId,
        reroute_id: EntityId,
    ) -> Result<Route, RepoError> {
        let bytes = self
            .reroutes
            .get(Self::id_key(reroute_id))?
            .ok_or_else(|| RepoError::not_found("reroute", reroute_id))?;
        let mut reroute: Reroute = serde_json::from_slice(&bytes)?;
        if reroute.shipment_id != shipment_id {
            return Err(RepoError::not_found("reroute", reroute_id));
        }
        if reroute.status != RerouteStatus::Proposed {
            return Err(RepoError::Conflict {
                entity: "reroute",
                detail: format!("status is {} not proposed", reroute.status),
            });
        }

        // Expire every other still-proposed reroute for this shipment first,
        // then flip the winner, then swap the shipment's route via CAS. The
        // actor serializes all of this per shipment; the CAS guards against
        // out-of-band writers.
        for item in self.reroutes.iter() {
            let (key, value) = item?;
            let mut other: Reroute = serde_json::from_slice(&value)?;
            if other.shipment_id == shipment_id
                && other.id != reroute_id
                && other.status == RerouteStatus::Proposed
            {
                other.status = RerouteStatus::Expired;
                self.reroutes.insert(key, serde_json::to_vec(&other)?)?;
            }
        }

        reroute.status = RerouteStatus::Accepted;
        self.reroutes
            .insert(Self::id_key(reroute_id), serde_json::to_vec(&reroute)?)?;

        let mut shipment = self.load_shipment(shipment_id)?;
        let old_bytes = serde_json::to_vec(&shipment)?;
        shipment.active_route_id = Some(reroute.new_route_id);
        shipment.version += 1;
        shipment.updated_at = Utc::now();
        let new_bytes = serde_json::to_vec(&shipment)?;
        self.shipments
            .compare_and_swap(Self::id_key(shipment_id), Some(old_bytes), Some(new_bytes))?
            .map_err(|_| RepoError::Conflict {
                entity: "shipment",
                detail: "concurrent modification during route swap".to_string(),
            })?;

        self.get_route(reroute.new_route_id).await
    }

    async fn insert_reroute(&self, reroute: &Reroute) -> Result<(), RepoError> {
        // A new proposal supersedes any still-proposed one.
        if reroute.status == RerouteStatus::Proposed {
            for item in self.reroutes.iter() {
                let (key, value) = item?;
                let mut other: Reroute = serde_json::from_slice(&value)?;
                if other.shipment_id == reroute.shipment_id
                    && other.status == RerouteStatus::Proposed
                {
                    other.status = RerouteStatus::Expired;
                    self.reroutes.insert(key, serde_json::to_vec(&other)?)?;
                }
            }
        }
        self.reroutes
            .insert(Self::id_key(reroute.id), serde_json::to_vec(reroute)?)?;
        self.note_id(reroute.id)?;
        Ok(())
    }

    async fn get_reroute(&self, id: EntityId) -> Result<Reroute, RepoError> {
        let bytes = self
            .reroutes
            .get(Self::id_key(id))?
            .ok_or_else(|| RepoError::not_found("reroute", id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn proposed_reroute(
        &self,
        shipment_id: EntityId,
    ) -> Result<Option<Reroute>, RepoError> {
        for item in self.reroutes.iter() {
            let (_, value) = item?;
            let reroute: Reroute = serde_json::from_slice(&value)?;
            if reroute.shipment_id == shipment_id && reroute.status == RerouteStatus::Proposed {
                return Ok(Some(reroute));
            }
        }
        Ok(None)
    }

    async fn update_reroute_status(
        &self,
        id: EntityId,
        status: RerouteStatus,
    ) -> Result<(), RepoError> {
        let mut reroute = self.get_reroute(id).await?;
        reroute.status = status;
        self.reroutes
            .insert(Self::id_key(id), serde_json::to_vec(&reroute)?)?;
        Ok(())
    }

    async fn upsert_advisory(
        &self,
        shipment_id: EntityId,
        advisory: &Advisory,
    ) -> Result<(), RepoError> {
        self.advisories
            .insert(Self::id_key(shipment_id), serde_json::to_vec(advisory)?)?;
        self.note_id(advisory.id)?;
        Ok(())
    }

    async fn get_advisory(&self, shipment_id: EntityId) -> Result<Option<Advisory>, RepoError> {
        match self.advisories.get(Self::id_key(shipment_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn append_eta_samples(&self, samples: &[EtaSample]) -> Result<(), RepoError> {
        for sample in samples {
            let key = Self::pair_key(sample.shipment_id, sample.stop_id);
            self.eta_latest.insert(key, serde_json::to_vec(sample)?)?;
            self.note_id(sample.id)?;
        }
        Ok(())
    }

    async fn latest_eta_samples(
        &self,
        shipment_id: EntityId,
    ) -> Result<Vec<EtaSample>, RepoError> {
        let prefix = Self::id_key(shipment_id);
        let mut samples = Vec::new();
        for item in self.eta_latest.scan_prefix(prefix) {
            let (_, value) = item?;
            samples.push(serde_json::from_slice::<EtaSample>(&value)?);
        }
        Ok(samples)
    }

    async fn insert_event(
        &self,
        shipment_id: EntityId,
        kind: &str,
        payload: serde_json::Value,
        ts: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        let record = EventRecord {
            shipment_id,
            kind: kind.to_string(),
            payload,
            ts,
        };
        let seq = self.event_seq.fetch_add(1, Ordering::Relaxed);
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(&shipment_id.to_be_bytes());
        key.extend_from_slice(&ts.timestamp_millis().to_be_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        self.events.insert(key, serde_json::to_vec(&record)?)?;
        Ok(())
    }

    async fn recent_events(
        &self,
        shipment_id: EntityId,
        limit: usize,
    ) -> Result<Vec<EventRecord>, RepoError> {
        let prefix = Self::id_key(shipment_id);
        let mut records = Vec::new();
        for item in self.events.scan_prefix(prefix).rev() {
            if records.len() >= limit {
                break;
            }
            let (_, value) = item?;
            records.push(serde_json::from_slice::<EventRecord>(&value)?);
        }
        Ok(records)
    }

    async fn max_allocated_id(&self) -> Result<EntityId, RepoError> {
        Ok(self
            .meta
            .get("max_id")?
            .and_then(|bytes| bytes.as_ref().try_into().ok().map(u64::from_be_bytes))
            .unwrap_or(0))
    }
}
