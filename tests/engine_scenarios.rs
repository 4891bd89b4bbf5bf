//! End-to-end engine scenarios: ingest through the gateway, process in the
//! shipment actor, observe events on the subscription hub and state in the
//! repository.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use routepulse::actor::{ActorContext, Command};
use routepulse::clock::{IdGen, SystemClock};
use routepulse::gateway::{IngestPoint, IngestionGateway};
use routepulse::hub::SubscriptionHub;
use routepulse::repo::{Repository, SledRepository};
use routepulse::routing::{RoutePlan, RoutingBackend, RoutingClient, RoutingError};
use routepulse::signals::{StaticTraffic, StaticWeather};
use routepulse::types::{
    Coordinate, ReasonCode, RerouteStatus, Route, RouteSegment, Shipment, ShipmentEvent,
    ShipmentStatus, Stop, TruckProfile,
};

// ============================================================================
// Harness
// ============================================================================

/// Routing backend with scriptable alternative durations.
struct StubRouting {
    alternative_durations_s: Vec<f64>,
}

#[async_trait]
impl RoutingBackend for StubRouting {
    async fn route(
        &self,
        waypoints: &[Coordinate],
        profile: &TruckProfile,
    ) -> Result<RoutePlan, RoutingError> {
        self.alternatives(waypoints, profile, 1)
            .await
            .map(|mut v| v.remove(0))
    }

    async fn alternatives(
        &self,
        waypoints: &[Coordinate],
        _profile: &TruckProfile,
        _k: u32,
    ) -> Result<Vec<RoutePlan>, RoutingError> {
        let start = *waypoints.first().ok_or(RoutingError::NoRoute)?;
        let end = *waypoints.last().ok_or(RoutingError::NoRoute)?;
        Ok(self
            .alternative_durations_s
            .iter()
            .map(|&duration| RoutePlan {
                polyline: vec![start, end],
                total_distance_m: 1200.0,
                total_duration_s: duration,
                segments: vec![RouteSegment {
                    start_fraction: 0.0,
                    end_fraction: 1.0,
                    freeflow_speed_mps: 1200.0 / duration.max(1.0),
                }],
                source: "stub".to_string(),
            })
            .collect())
    }

    async fn snap(&self, coordinate: Coordinate) -> Result<Coordinate, RoutingError> {
        Ok(coordinate)
    }

    fn name(&self) -> &'static str {
        "stub"
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    repo: Arc<SledRepository>,
    hub: Arc<SubscriptionHub>,
    gateway: Arc<IngestionGateway>,
    _cancel: CancellationToken,
}

fn harness(alternative_durations_s: Vec<f64>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let repo = Arc::new(SledRepository::open(dir.path().join("db")).unwrap());
    let hub = Arc::new(SubscriptionHub::new(32));
    let routing = Arc::new(RoutingClient::new(
        Box::new(StubRouting {
            alternative_durations_s,
        }),
        None,
        StdDuration::from_millis(500),
        Duration::minutes(5),
    ));
    let cancel = CancellationToken::new();
    let ctx = ActorContext {
        repo: repo.clone(),
        routing,
        traffic: Arc::new(StaticTraffic::free_flow()),
        weather: Arc::new(StaticWeather::clear()),
        hub: hub.clone(),
        clock: Arc::new(SystemClock::new()),
        ids: Arc::new(IdGen::starting_at(10_000)),
    };
    let gateway = Arc::new(IngestionGateway::new(ctx, cancel.clone()));
    Harness {
        _dir: dir,
        repo,
        hub,
        gateway,
        _cancel: cancel,
    }
}

/// Straight ~1.1 km due-north route used by every scenario.
fn seed_route() -> Route {
    Route {
        id: 900,
        polyline: vec![Coordinate::new(30.0, -94.0), Coordinate::new(30.01, -94.0)],
        total_distance_m: 1112.0,
        total_duration_s: 67.0,
        segments: vec![RouteSegment {
            start_fraction: 0.0,
            end_fraction: 1.0,
            freeflow_speed_mps: 16.6,
        }],
        profile: TruckProfile::default(),
        source: "seed".to_string(),
        created_at: Utc::now(),
    }
}

async fn seed_shipment(repo: &SledRepository) {
    let now = Utc::now();
    let shipment = Shipment {
        id: 1,
        reference: "SHP-00001".to_string(),
        vehicle_id: "TRK-1".to_string(),
        promised_by: now + Duration::hours(6),
        status: ShipmentStatus::InTransit,
        active_route_id: Some(900),
        truck_profile: TruckProfile::default(),
        version: 1,
        created_at: now,
        updated_at: now,
    };
    let stops = vec![
        Stop {
            id: 10,
            shipment_id: 1,
            sequence: 1,
            name: "Origin DC".to_string(),
            coordinate: Coordinate::new(30.0, -94.0),
            planned_arrival: now,
            planned_departure: now + Duration::minutes(30),
            service_minutes: 30,
            actual_arrival: None,
            actual_departure: None,
            completed: false,
        },
        Stop {
            id: 11,
            shipment_id: 1,
            sequence: 2,
            name: "Customer dock".to_string(),
            coordinate: Coordinate::new(30.01, -94.0),
            planned_arrival: now + Duration::hours(1),
            planned_departure: now + Duration::hours(2),
            service_minutes: 60,
            actual_arrival: None,
            actual_departure: None,
            completed: false,
        },
    ];
    repo.insert_route(&seed_route()).await.unwrap();
    repo.insert_shipment(&shipment, &stops).await.unwrap();
}

fn point_at(ts: DateTime<Utc>, fraction: f64, speed_mps: f64) -> IngestPoint {
    IngestPoint {
        ts,
        lat: 30.0 + 0.01 * fraction,
        lon: -94.0,
        speed: Some(speed_mps),
        accuracy: 10.0,
    }
}

/// ~55.6 km long-haul leg; big enough that a reroute can clear the
/// minimum-saving threshold.
async fn seed_long_shipment(repo: &SledRepository) {
    let now = Utc::now();
    let route = Route {
        id: 900,
        polyline: vec![Coordinate::new(30.0, -94.0), Coordinate::new(30.5, -94.0)],
        total_distance_m: 55_600.0,
        total_duration_s: 3_340.0,
        segments: vec![RouteSegment {
            start_fraction: 0.0,
            end_fraction: 1.0,
            freeflow_speed_mps: 16.6,
        }],
        profile: TruckProfile::default(),
        source: "seed".to_string(),
        created_at: now,
    };
    let shipment = Shipment {
        id: 1,
        reference: "SHP-00001".to_string(),
        vehicle_id: "TRK-1".to_string(),
        promised_by: now + Duration::hours(6),
        status: ShipmentStatus::InTransit,
        active_route_id: Some(900),
        truck_profile: TruckProfile::default(),
        version: 1,
        created_at: now,
        updated_at: now,
    };
    let stops = vec![
        Stop {
            id: 10,
            shipment_id: 1,
            sequence: 1,
            name: "Origin DC".to_string(),
            coordinate: Coordinate::new(30.0, -94.0),
            planned_arrival: now,
            planned_departure: now + Duration::minutes(30),
            service_minutes: 30,
            actual_arrival: None,
            actual_departure: None,
            completed: false,
        },
        Stop {
            id: 11,
            shipment_id: 1,
            sequence: 2,
            name: "Customer dock".to_string(),
            coordinate: Coordinate::new(30.5, -94.0),
            planned_arrival: now + Duration::hours(1),
            planned_departure: now + Duration::hours(2),
            service_minutes: 60,
            actual_arrival: None,
            actual_departure: None,
            completed: false,
        },
    ];
    repo.insert_route(&route).await.unwrap();
    repo.insert_shipment(&shipment, &stops).await.unwrap();
}

fn long_point_at(ts: DateTime<Utc>, fraction: f64, speed_mps: f64) -> IngestPoint {
    IngestPoint {
        ts,
        lat: 30.0 + 0.5 * fraction,
        lon: -94.0,
        speed: Some(speed_mps),
        accuracy: 10.0,
    }
}

/// Collect events from a receiver until `deadline_ms` of silence.
async fn drain_events(
    rx: &mut broadcast::Receiver<ShipmentEvent>,
    deadline_ms: u64,
) -> Vec<ShipmentEvent> {
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(StdDuration::from_millis(deadline_ms), rx.recv()).await {
            Ok(Ok(event)) => events.push(event),
            _ => break,
        }
    }
    events
}

async fn wait_for_status(
    repo: &SledRepository,
    shipment_id: u64,
    status: ShipmentStatus,
) -> bool {
    for _ in 0..200 {
        if let Ok(shipment) = repo.get_shipment_by_id(shipment_id).await {
            if shipment.status == status {
                return true;
            }
        }
        tokio::time::sleep(StdDuration::from_millis(25)).await;
    }
    false
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn single_stop_on_time_arrival() {
    let h = harness(vec![]);
    seed_shipment(&h.repo).await;
    let mut rx = h.hub.subscribe(1);

    // Drive the route at ~60 km/h, then sit at the customer dock.
    let t0 = Utc::now() - Duration::minutes(20);
    let mut points = Vec::new();
    for (i, fraction) in [0.0, 0.25, 0.5, 0.75, 0.95].iter().enumerate() {
        points.push(point_at(t0 + Duration::seconds(30 * i as i64), *fraction, 16.7));
    }
    // Stationary fixes at the dock let the filtered speed decay below the
    // stopped threshold, firing the arrival predicate.
    for i in 0..8 {
        points.push(point_at(t0 + Duration::seconds(150 + 30 * i), 1.0, 0.0));
    }

    let report = h.gateway.ingest("TRK-1", points, None).await.unwrap();
    assert_eq!(report.dropped, 0);

    assert!(
        wait_for_status(&h.repo, 1, ShipmentStatus::Completed).await,
        "terminal arrival must complete the shipment"
    );

    let events = drain_events(&mut rx, 300).await;
    let updates: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ShipmentEvent::PositionUpdate {
                per_stop_etas,
                residual_percent,
                ..
            } => Some((per_stop_etas.clone(), *residual_percent)),
            _ => None,
        })
        .collect();
    assert!(updates.len() >= 5, "expected live updates, got {}", updates.len());

    // Residual percent shrinks as the vehicle moves.
    assert!(updates.first().unwrap().1 > updates.last().unwrap().1);

    // Terminal-stop residual duration trends down over the driving phase.
    let terminal_residuals: Vec<f64> = updates
        .iter()
        .filter_map(|(etas, _)| {
            etas.iter()
                .find(|e| e.stop_id == 11)
                .map(|e| e.smoothed_duration_s)
        })
        .collect();
    assert!(terminal_residuals.first().unwrap() > terminal_residuals.last().unwrap());

    // Advisory settled on ON_TIME.
    let advisory = h.repo.get_advisory(1).await.unwrap().unwrap();
    assert_eq!(advisory.reason, ReasonCode::OnTime);

    // Terminal stop carries an actual arrival.
    let stops = h.repo.get_stops(1).await.unwrap();
    let terminal = stops.iter().find(|s| s.sequence == 2).unwrap();
    assert!(terminal.actual_arrival.is_some());
    assert!(terminal.completed);
}

#[tokio::test]
async fn out_of_order_timestamps_dropped() {
    let h = harness(vec![]);
    seed_shipment(&h.repo).await;
    let mut rx = h.hub.subscribe(1);

    let t0 = Utc::now() - Duration::minutes(10);
    let points = vec![
        point_at(t0, 0.1, 16.7),
        point_at(t0 + Duration::seconds(30), 0.2, 16.7),
        point_at(t0 + Duration::seconds(20), 0.15, 16.7), // regressing ts
        point_at(t0 + Duration::seconds(60), 0.3, 16.7),
    ];
    h.gateway.ingest("TRK-1", points, None).await.unwrap();

    let events = drain_events(&mut rx, 400).await;
    let updates = events
        .iter()
        .filter(|e| matches!(e, ShipmentEvent::PositionUpdate { .. }))
        .count();
    assert_eq!(updates, 3, "t+20 must be dropped by admission");
}

#[tokio::test]
async fn backward_jitter_rejected_without_update() {
    let h = harness(vec![]);
    seed_shipment(&h.repo).await;
    let mut rx = h.hub.subscribe(1);

    let t0 = Utc::now() - Duration::minutes(10);
    let points = vec![
        point_at(t0, 0.5, 16.7),
        // ~30 m backwards along the polyline: beyond the 20 m tolerance.
        point_at(t0 + Duration::seconds(30), 0.473, 16.7),
        point_at(t0 + Duration::seconds(60), 0.6, 16.7),
    ];
    h.gateway.ingest("TRK-1", points, None).await.unwrap();

    let events = drain_events(&mut rx, 400).await;
    let progresses: Vec<f64> = events
        .iter()
        .filter_map(|e| match e {
            ShipmentEvent::PositionUpdate { progress, .. } => Some(*progress),
            _ => None,
        })
        .collect();
    assert_eq!(progresses.len(), 2, "the backward fix must emit nothing");
    assert!(progresses[0] < progresses[1]);
}

#[tokio::test]
async fn duplicate_batch_is_idempotent() {
    let h = harness(vec![]);
    seed_shipment(&h.repo).await;
    let mut rx = h.hub.subscribe(1);

    let t0 = Utc::now() - Duration::minutes(10);
    let batch: Vec<IngestPoint> = (0..3)
        .map(|i| point_at(t0 + Duration::seconds(30 * i), 0.1 * (i + 1) as f64, 16.7))
        .collect();

    h.gateway.ingest("TRK-1", batch.clone(), None).await.unwrap();
    let first = drain_events(&mut rx, 400).await;
    let first_updates = first
        .iter()
        .filter(|e| matches!(e, ShipmentEvent::PositionUpdate { .. }))
        .count();
    assert_eq!(first_updates, 3);

    // Replaying the same batch admits the points but the actor drops every
    // one on the monotonic-timestamp check: no further updates.
    h.gateway.ingest("TRK-1", batch, None).await.unwrap();
    let second = drain_events(&mut rx, 400).await;
    let second_updates = second
        .iter()
        .filter(|e| matches!(e, ShipmentEvent::PositionUpdate { .. }))
        .count();
    assert_eq!(second_updates, 0);
}

#[tokio::test]
async fn reroute_propose_accept_broadcast() {
    // Alternatives at 10 s beat any residual by miles.
    let h = harness(vec![10.0, 12.0, 15.0]);
    seed_long_shipment(&h.repo).await;

    // Establish position and ETAs first.
    let t0 = Utc::now() - Duration::minutes(10);
    h.gateway
        .ingest(
            "TRK-1",
            vec![
                long_point_at(t0, 0.1, 16.7),
                long_point_at(t0 + Duration::seconds(30), 0.2, 16.7),
            ],
            None,
        )
        .await
        .unwrap();
    tokio::time::sleep(StdDuration::from_millis(200)).await;

    let mut rx_a = h.hub.subscribe(1);
    let mut rx_b = h.hub.subscribe(1);

    let handle = h.gateway.ensure_actor(1).await.unwrap();
    let (reply, rx) = tokio::sync::oneshot::channel();
    handle.send_command(Command::ProposeReroute { reply });
    let proposal = rx.await.unwrap().unwrap().expect("proposal expected");
    assert_eq!(proposal.status, RerouteStatus::Proposed);
    assert!(proposal.projected_saving_min > 10.0);

    let (reply, rx) = tokio::sync::oneshot::channel();
    handle.send_command(Command::AcceptReroute {
        reroute_id: proposal.id,
        reply,
    });
    rx.await.unwrap().unwrap();

    // Both subscribers observe the same reroute_accepted payload.
    let events_a = drain_events(&mut rx_a, 400).await;
    let events_b = drain_events(&mut rx_b, 400).await;
    let accepted_a = events_a
        .iter()
        .find_map(|e| match e {
            ShipmentEvent::RerouteAccepted {
                reroute_id,
                new_route_summary,
                ..
            } => Some((*reroute_id, new_route_summary.route_id)),
            _ => None,
        })
        .expect("subscriber A missed reroute_accepted");
    let accepted_b = events_b
        .iter()
        .find_map(|e| match e {
            ShipmentEvent::RerouteAccepted {
                reroute_id,
                new_route_summary,
                ..
            } => Some((*reroute_id, new_route_summary.route_id)),
            _ => None,
        })
        .expect("subscriber B missed reroute_accepted");
    assert_eq!(accepted_a, accepted_b);

    // The store reflects the swap and no proposal remains.
    let shipment = h.repo.get_shipment_by_id(1).await.unwrap();
    assert_eq!(shipment.active_route_id, Some(accepted_a.1));
    assert_ne!(shipment.active_route_id, Some(900));
    assert!(h.repo.proposed_reroute(1).await.unwrap().is_none());
    assert_eq!(
        h.repo.get_reroute(proposal.id).await.unwrap().status,
        RerouteStatus::Accepted
    );

    // Subsequent updates ride the new route.
    let mut rx_c = h.hub.subscribe(1);
    h.gateway
        .ingest(
            "TRK-1",
            vec![long_point_at(t0 + Duration::seconds(90), 0.3, 16.7)],
            None,
        )
        .await
        .unwrap();
    let events_c = drain_events(&mut rx_c, 400).await;
    assert!(events_c
        .iter()
        .any(|e| matches!(e, ShipmentEvent::PositionUpdate { .. })));
}

#[tokio::test]
async fn reroute_reject_leaves_route_unchanged() {
    let h = harness(vec![10.0]);
    seed_long_shipment(&h.repo).await;

    let t0 = Utc::now() - Duration::minutes(10);
    h.gateway
        .ingest(
            "TRK-1",
            vec![
                long_point_at(t0, 0.1, 16.7),
                long_point_at(t0 + Duration::seconds(30), 0.2, 16.7),
            ],
            None,
        )
        .await
        .unwrap();
    tokio::time::sleep(StdDuration::from_millis(200)).await;

    let handle = h.gateway.ensure_actor(1).await.unwrap();
    let (reply, rx) = tokio::sync::oneshot::channel();
    handle.send_command(Command::ProposeReroute { reply });
    let proposal = rx.await.unwrap().unwrap().expect("proposal expected");

    let (reply, rx) = tokio::sync::oneshot::channel();
    handle.send_command(Command::RejectReroute {
        reroute_id: proposal.id,
        reply,
    });
    rx.await.unwrap().unwrap();

    let shipment = h.repo.get_shipment_by_id(1).await.unwrap();
    assert_eq!(shipment.active_route_id, Some(900));
    assert_eq!(
        h.repo.get_reroute(proposal.id).await.unwrap().status,
        RerouteStatus::Rejected
    );

    // Rejecting twice is a state conflict.
    let (reply, rx) = tokio::sync::oneshot::channel();
    handle.send_command(Command::RejectReroute {
        reroute_id: proposal.id,
        reply,
    });
    assert!(rx.await.unwrap().is_err());
}

#[tokio::test]
async fn cancel_stops_processing() {
    let h = harness(vec![]);
    seed_shipment(&h.repo).await;

    let handle = h.gateway.ensure_actor(1).await.unwrap();
    let (reply, rx) = tokio::sync::oneshot::channel();
    handle.send_command(Command::Cancel { reply });
    rx.await.unwrap().unwrap();

    assert!(wait_for_status(&h.repo, 1, ShipmentStatus::Cancelled).await);

    // Ingest for a cancelled shipment is refused at resolution time.
    let t0 = Utc::now() - Duration::minutes(5);
    let err = h
        .gateway
        .ingest("TRK-1", vec![point_at(t0, 0.1, 16.7)], None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        routepulse::gateway::IngestError::VehicleUnknown(_)
            | routepulse::gateway::IngestError::ShipmentNotActive(_)
    ));
}
