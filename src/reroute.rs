//! Reroute evaluation: requests alternatives, scores them against the
//! current residual, and manages the proposal lifecycle.
//!
//! Triggered by the shipment actor when advisory severity escalates,
//! projected lateness crosses the threshold, or upcoming traffic degrades.
//! A proposal is only persisted when the best alternative saves strictly
//! more than the configured minimum and its ETA confidence is at least
//! medium. One proposal per shipment; a new one expires the old.

use chrono::{Duration, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::clock::IdGen;
use crate::config;
use crate::repo::{RepoError, Repository};
use crate::routing::{RoutingClient, RoutingError};
use crate::types::{
    ConfidenceBucket, Coordinate, EntityId, Reroute, RerouteStatus, Route, Severity, Shipment,
    Stop,
};

#[derive(Debug, Error)]
pub enum RerouteError {
    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Current-route figures an evaluation compares against.
#[derive(Debug, Clone, Copy)]
pub struct CurrentPlan {
    pub residual_duration_s: f64,
    pub residual_distance_m: f64,
    /// Confidence of the current terminal ETA; alternatives inherit the
    /// same signal coverage, so this doubles as the alternative confidence.
    pub eta_confidence: ConfidenceBucket,
}

/// Why the actor asked for an evaluation; recorded on the proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerouteTrigger {
    SeverityEscalation,
    ProjectedLateness,
    TrafficDegradation,
    Manual,
}

impl RerouteTrigger {
    fn describe(self) -> &'static str {
        match self {
            RerouteTrigger::SeverityEscalation => "advisory severity escalated",
            RerouteTrigger::ProjectedLateness => "projected lateness over threshold",
            RerouteTrigger::TrafficDegradation => "traffic degraded on upcoming segments",
            RerouteTrigger::Manual => "requested by planner",
        }
    }
}

/// Decides whether the actor should run an evaluation this cycle.
pub fn trigger_for(
    previous_severity: Option<Severity>,
    current_severity: Severity,
    lateness_min: f64,
    traffic_factor: Option<f64>,
) -> Option<RerouteTrigger> {
    let cfg = config::get();
    let escalated = matches!(previous_severity, Some(Severity::Low) | None)
        && current_severity >= Severity::Medium;
    if escalated {
        return Some(RerouteTrigger::SeverityEscalation);
    }
    if lateness_min > cfg.reroute.lateness_trigger_min {
        return Some(RerouteTrigger::ProjectedLateness);
    }
    if let Some(factor) = traffic_factor {
        if factor < cfg.classify.traffic_congestion_factor {
            return Some(RerouteTrigger::TrafficDegradation);
        }
    }
    None
}

/// Scored alternative produced during an evaluation.
#[derive(Debug)]
struct ScoredAlternative {
    route: Route,
    saving_min: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RerouteEvaluator;

impl RerouteEvaluator {
    /// Ask the routing backend for alternatives from the current position
    /// through all remaining stops, score them, and persist the best as a
    /// proposal when it clears the saving threshold.
    ///
    /// Returns `Ok(None)` when no alternative qualifies.
    pub async fn evaluate(
        &self,
        repo: &dyn Repository,
        routing: &RoutingClient,
        ids: &IdGen,
        shipment: &Shipment,
        stops: &[Stop],
        from: Coordinate,
        current: CurrentPlan,
        trigger: RerouteTrigger,
    ) -> Result<Option<Reroute>, RerouteError> {
        let cfg = config::get();

        if current.eta_confidence == ConfidenceBucket::Low {
            debug!(shipment_id = shipment.id, "Skipping reroute: ETA confidence low");
            return Ok(None);
        }
        let Some(old_route_id) = shipment.active_route_id else {
            return Ok(None);
        };

        let mut waypoints = vec![from];
        waypoints.extend(
            stops
                .iter()
                .filter(|s| !s.completed)
                .map(|s| s.coordinate),
        );
        if waypoints.len() < 2 {
            return Ok(None);
        }

        let plans = routing
            .alternatives(&waypoints, &shipment.truck_profile, cfg.reroute.alternatives)
            .await?;

        let mut best: Option<ScoredAlternative> = None;
        let now = Utc::now();
        for plan in plans {
            let mut saving_min =
                (current.residual_duration_s - plan.total_duration_s) / 60.0;
            // Penalize long detours chasing small wins.
            if plan.total_distance_m
                > current.residual_distance_m * (1.0 + cfg.reroute.detour_fraction)
            {
                saving_min -= cfg.reroute.detour_penalty_min;
            }
            if best.as_ref().map(|b| saving_min > b.saving_min).unwrap_or(true) {
                best = Some(ScoredAlternative {
                    route: Route {
                        id: ids.next(),
                        polyline: plan.polyline,
                        total_distance_m: plan.total_distance_m,
                        total_duration_s: plan.total_duration_s,
                        segments: plan.segments,
                        profile: shipment.truck_profile.clone(),
                        source: plan.source,
                        created_at: now,
                    },
                    saving_min,
                });
            }
        }

        let Some(best) = best else {
            return Ok(None);
        };

        // Strictly greater: a saving equal to the threshold is not proposed.
        if best.saving_min <= cfg.reroute.min_saving_min {
            debug!(
                shipment_id = shipment.id,
                saving_min = best.saving_min,
                threshold = cfg.reroute.min_saving_min,
                "No reroute: saving under threshold"
            );
            return Ok(None);
        }

        repo.insert_route(&best.route).await?;
        let reroute = Reroute {
            id: ids.next(),
            shipment_id: shipment.id,
            created_at: now,
            old_route_id,
            new_route_id: best.route.id,
            projected_saving_min: best.saving_min,
            reason: format!(
                "{}; projected to save {:.0} min",
                trigger.describe(),
                best.saving_min
            ),
            status: RerouteStatus::Proposed,
        };
        repo.insert_reroute(&reroute).await?;

        info!(
            shipment_id = shipment.id,
            reroute_id = reroute.id,
            saving_min = best.saving_min,
            "Reroute proposed"
        );
        Ok(Some(reroute))
    }

    /// Expire the shipment's proposal when it outlived its TTL.
    /// Returns the expired reroute id, if any.
    pub async fn expire_stale(
        &self,
        repo: &dyn Repository,
        shipment_id: EntityId,
    ) -> Result<Option<EntityId>, RerouteError> {
        let cfg = config::get();
        let Some(proposal) = repo.proposed_reroute(shipment_id).await? else {
            return Ok(None);
        };
        let age = Utc::now() - proposal.created_at;
        if age > Duration::minutes(cfg.reroute.proposal_ttl_min) {
            repo.update_reroute_status(proposal.id, RerouteStatus::Expired)
                .await?;
            info!(
                shipment_id,
                reroute_id = proposal.id,
                "Reroute proposal expired"
            );
            return Ok(Some(proposal.id));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::SledRepository;
    use crate::routing::{RoutePlan, RoutingBackend};
    use crate::types::{ShipmentStatus, TruckProfile};
    use async_trait::async_trait;

    /// Backend returning fixed-duration alternatives.
    struct AltBackend {
        durations_s: Vec<f64>,
        distance_m: f64,
    }

    #[async_trait]
    impl RoutingBackend for AltBackend {
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
            _waypoints: &[Coordinate],
            _profile: &TruckProfile,
            _k: u32,
        ) -> Result<Vec<RoutePlan>, RoutingError> {
            Ok(self
                .durations_s
                .iter()
                .map(|&d| RoutePlan {
                    polyline: vec![
                        Coordinate::new(30.0, -94.0),
                        Coordinate::new(30.02, -94.0),
                    ],
                    total_distance_m: self.distance_m,
                    total_duration_s: d,
                    segments: Vec::new(),
                    source: "alt".to_string(),
                })
                .collect())
        }

        async fn snap(&self, coordinate: Coordinate) -> Result<Coordinate, RoutingError> {
            Ok(coordinate)
        }

        fn name(&self) -> &'static str {
            "alt"
        }
    }

    fn routing_with(durations_s: Vec<f64>, distance_m: f64) -> RoutingClient {
        RoutingClient::new(
            Box::new(AltBackend {
                durations_s,
                distance_m,
            }),
            None,
            std::time::Duration::from_millis(500),
            chrono::Duration::minutes(5),
        )
    }

    fn shipment() -> Shipment {
        Shipment {
            id: 1,
            reference: "SHP-00001".to_string(),
            vehicle_id: "TRK-1".to_string(),
            promised_by: Utc::now() + Duration::hours(4),
            status: ShipmentStatus::InTransit,
            active_route_id: Some(500),
            truck_profile: TruckProfile::default(),
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn terminal_stop() -> Stop {
        Stop {
            id: 20,
            shipment_id: 1,
            sequence: 2,
            name: "Terminal".to_string(),
            coordinate: Coordinate::new(30.02, -94.0),
            planned_arrival: Utc::now(),
            planned_departure: Utc::now(),
            service_minutes: 0,
            actual_arrival: None,
            actual_departure: None,
            completed: false,
        }
    }

    async fn run_eval(
        durations_s: Vec<f64>,
        current_duration_s: f64,
    ) -> Option<Reroute> {
        let dir = tempfile::tempdir().unwrap();
        let repo = SledRepository::open(dir.path().join("db")).unwrap();
        let routing = routing_with(durations_s, 20_000.0);
        let ids = IdGen::starting_at(1000);

        RerouteEvaluator
            .evaluate(
                &repo,
                &routing,
                &ids,
                &shipment(),
                &[terminal_stop()],
                Coordinate::new(30.0, -94.0),
                CurrentPlan {
                    residual_duration_s: current_duration_s,
                    residual_distance_m: 25_000.0,
                    eta_confidence: ConfidenceBucket::High,
                },
                RerouteTrigger::ProjectedLateness,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_saving_over_threshold_proposes() {
        // Residual 60 min; alternatives 55, 50, 49 min. Best saving 11 > 10.
        let proposal = run_eval(vec![3300.0, 3000.0, 2940.0], 3600.0).await.unwrap();
        assert!((proposal.projected_saving_min - 11.0).abs() < 0.01);
        assert_eq!(proposal.status, RerouteStatus::Proposed);
    }

    #[tokio::test]
    async fn test_saving_at_threshold_not_proposed() {
        // Best alternative 50 min: saving exactly 10 does not propose.
        let proposal = run_eval(vec![3300.0, 3000.0], 3600.0).await;
        assert!(proposal.is_none());
    }

    #[tokio::test]
    async fn test_detour_penalty_applies() {
        let dir = tempfile::tempdir().unwrap();
        let repo = SledRepository::open(dir.path().join("db")).unwrap();
        // Saves 12 min raw but is more than 20% longer: 12 - 5 = 7 < 10.
        let routing = routing_with(vec![2880.0], 40_000.0);
        let ids = IdGen::starting_at(1000);

        let proposal = RerouteEvaluator
            .evaluate(
                &repo,
                &routing,
                &ids,
                &shipment(),
                &[terminal_stop()],
                Coordinate::new(30.0, -94.0),
                CurrentPlan {
                    residual_duration_s: 3600.0,
                    residual_distance_m: 25_000.0,
                    eta_confidence: ConfidenceBucket::High,
                },
                RerouteTrigger::TrafficDegradation,
            )
            .await
            .unwrap();
        assert!(proposal.is_none());
    }

    #[tokio::test]
    async fn test_low_confidence_skips_evaluation() {
        let dir = tempfile::tempdir().unwrap();
        let repo = SledRepository::open(dir.path().join("db")).unwrap();
        let routing = routing_with(vec![1800.0], 20_000.0);
        let ids = IdGen::starting_at(1000);

        let proposal = RerouteEvaluator
            .evaluate(
                &repo,
                &routing,
                &ids,
                &shipment(),
                &[terminal_stop()],
                Coordinate::new(30.0, -94.0),
                CurrentPlan {
                    residual_duration_s: 3600.0,
                    residual_distance_m: 25_000.0,
                    eta_confidence: ConfidenceBucket::Low,
                },
                RerouteTrigger::Manual,
            )
            .await
            .unwrap();
        assert!(proposal.is_none());
    }

    #[test]
    fn test_trigger_conditions() {
        assert_eq!(
            trigger_for(Some(Severity::Low), Severity::High, 0.0, None),
            Some(RerouteTrigger::SeverityEscalation)
        );
        assert_eq!(
            trigger_for(Some(Severity::Medium), Severity::Medium, 12.0, None),
            Some(RerouteTrigger::ProjectedLateness)
        );
        assert_eq!(
            trigger_for(Some(Severity::Medium), Severity::Medium, 0.0, Some(0.3)),
            Some(RerouteTrigger::TrafficDegradation)
        );
        assert_eq!(
            trigger_for(Some(Severity::Medium), Severity::Medium, 0.0, Some(0.9)),
            None
        );
    }
}
