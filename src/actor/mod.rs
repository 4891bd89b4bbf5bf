//! Per-shipment actor: the serialized state machine that owns all mutable
//! shipment state.
//!
//! One tokio task per active shipment. The inbox has two lanes: commands
//! (accept/reject/propose reroute, cancel, snapshot) are never dropped;
//! position batches ride a bounded drop-oldest queue so a flooding vehicle
//! can only displace its own stale fixes. Commands drain before positions.
//!
//! The per-position hot path: admission check, snap, dwell transitions,
//! ETA pass, delay classification, reroute evaluation, event fan-out,
//! persistence with bounded retry.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::{ClassifierInputs, DelayClassifier, HosState, ManualEvent};
use crate::clock::{Clock, IdGen};
use crate::config;
use crate::eta::{DwellTracker, EtaEstimator, EtaInputs, StopTransition};
use crate::hub::SubscriptionHub;
use crate::repo::{RepoError, Repository};
use crate::reroute::{trigger_for, CurrentPlan, RerouteEvaluator, RerouteTrigger};
use crate::routing::RoutingClient;
use crate::signals::{TrafficProvider, WeatherProvider};
use crate::snap::{RoadSnapper, SnapState};
use crate::types::event::RouteSummary;
use crate::types::{
    Advisory, EntityId, EtaSample, Position, Reroute, Route, Severity, Shipment, ShipmentEvent,
    ShipmentSnapshot, ShipmentStatus, SnappedPoint, Stop, StopView, TrafficSample, WeatherSample,
};

// ============================================================================
// Shared dependencies
// ============================================================================

/// Dependencies shared by every actor; cheap to clone.
#[derive(Clone)]
pub struct ActorContext {
    pub repo: Arc<dyn Repository>,
    pub routing: Arc<RoutingClient>,
    pub traffic: Arc<dyn TrafficProvider>,
    pub weather: Arc<dyn WeatherProvider>,
    pub hub: Arc<SubscriptionHub>,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<IdGen>,
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("not found")]
    NotFound,

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("routing unavailable: {0}")]
    RoutingUnavailable(String),

    #[error("storage unavailable: {0}")]
    Storage(String),
}

impl From<RepoError> for CommandError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound { .. } => CommandError::NotFound,
            RepoError::Conflict { detail, .. } => CommandError::StateConflict(detail),
            RepoError::Transient(detail) => CommandError::Storage(detail),
        }
    }
}

/// Control-lane messages; never dropped by the inbox.
pub enum Command {
    ProposeReroute {
        reply: oneshot::Sender<Result<Option<Reroute>, CommandError>>,
    },
    AcceptReroute {
        reroute_id: EntityId,
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    RejectReroute {
        reroute_id: EntityId,
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    /// Manual operational report feeding the VEHICLE_ISSUE cause.
    ReportVehicleEvent { description: String, at: DateTime<Utc> },
    /// Driver shift start feeding the DRIVER_HOS_RISK cause.
    SetShiftStart { at: DateTime<Utc> },
    Cancel {
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    Snapshot {
        reply: oneshot::Sender<ShipmentSnapshot>,
    },
}

// ============================================================================
// Inbox
// ============================================================================

struct Inbox {
    commands: Mutex<VecDeque<Command>>,
    positions: Mutex<VecDeque<Position>>,
    notify: Notify,
    capacity: usize,
    overflow_dropped: AtomicU64,
}

impl Inbox {
    fn new(capacity: usize) -> Self {
        Self {
            commands: Mutex::new(VecDeque::new()),
            positions: Mutex::new(VecDeque::with_capacity(capacity)),
            notify: Notify::new(),
            capacity,
            overflow_dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue positions with the drop-oldest policy. Returns how many
    /// queued entries were displaced to make room.
    fn push_positions(&self, batch: Vec<Position>) -> u64 {
        let mut dropped = 0;
        {
            let mut queue = match self.positions.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            for position in batch {
                while queue.len() >= self.capacity {
                    queue.pop_front();
                    dropped += 1;
                }
                queue.push_back(position);
            }
        }
        if dropped > 0 {
            self.overflow_dropped.fetch_add(dropped, Ordering::Relaxed);
        }
        self.notify.notify_one();
        dropped
    }

    fn push_command(&self, command: Command) {
        {
            let mut queue = match self.commands.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            queue.push_back(command);
        }
        self.notify.notify_one();
    }

    fn pop_command(&self) -> Option<Command> {
        match self.commands.lock() {
            Ok(mut guard) => guard.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }

    fn pop_position(&self) -> Option<Position> {
        match self.positions.lock() {
            Ok(mut guard) => guard.pop_front(),
            Err(poisoned) => poisoned.into_inner().pop_front(),
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Result of enqueueing a position batch.
#[derive(Debug, Clone, Copy)]
pub struct EnqueueOutcome {
    pub queued: usize,
    pub displaced: u64,
}

/// Client side of an actor: the gateway and API handlers talk through this.
#[derive(Clone)]
pub struct ActorHandle {
    pub shipment_id: EntityId,
    inbox: Arc<Inbox>,
    done: Arc<AtomicBool>,
}

impl ActorHandle {
    pub fn enqueue_positions(&self, batch: Vec<Position>) -> EnqueueOutcome {
        let queued = batch.len();
        let displaced = self.inbox.push_positions(batch);
        EnqueueOutcome { queued, displaced }
    }

    pub fn send_command(&self, command: Command) {
        self.inbox.push_command(command);
    }

    pub async fn snapshot(&self) -> Result<ShipmentSnapshot, CommandError> {
        let (reply, rx) = oneshot::channel();
        self.inbox.push_command(Command::Snapshot { reply });
        rx.await.map_err(|_| CommandError::NotFound)
    }

    /// True once the actor's run loop has exited (terminal shipment state
    /// or engine shutdown); the gateway reaps done handles.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Actor
// ============================================================================

/// Observable per-actor counters.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ActorStats {
    pub positions_processed: u64,
    pub positions_admission_dropped: u64,
    pub snap_rejections: u64,
    pub storage_degraded_buffered: usize,
    /// Positions lost because the degraded buffer was already full.
    pub storage_degraded_lost: u64,
}

pub struct ShipmentActor {
    ctx: ActorContext,
    shipment: Shipment,
    stops: Vec<Stop>,
    route: Option<Route>,
    snapper: RoadSnapper,
    snap_state: SnapState,
    estimator: EtaEstimator,
    dwell: DwellTracker,
    classifier: DelayClassifier,
    evaluator: RerouteEvaluator,
    hos: Option<HosState>,
    vehicle_event: Option<ManualEvent>,
    active_advisory: Option<Advisory>,
    latest_etas: Vec<EtaSample>,
    latest_snapped: Option<SnappedPoint>,
    last_accepted_ts: Option<DateTime<Utc>>,
    consecutive_rejections: u32,
    /// Whether the last route refresh attempt failed; caps ETA confidence.
    routing_degraded: bool,
    /// Positions that could not be persisted; flushed opportunistically.
    degraded_buffer: VecDeque<SnappedPoint>,
    stats: ActorStats,
}

impl ShipmentActor {
    /// Load shipment state and start the actor task.
    pub async fn spawn(
        ctx: ActorContext,
        shipment_id: EntityId,
        cancel: CancellationToken,
    ) -> Result<ActorHandle, RepoError> {
        let cfg = config::get();
        let shipment = ctx.repo.get_shipment_by_id(shipment_id).await?;
        let stops = ctx.repo.get_stops(shipment_id).await?;
        let route = match ctx.repo.get_active_route(shipment_id).await {
            Ok(route) => Some(route),
            Err(RepoError::NotFound { .. }) => None,
            Err(e) => return Err(e),
        };

        let mut estimator = EtaEstimator::new();
        let persisted = ctx.repo.latest_eta_samples(shipment_id).await?;
        estimator.seed(&persisted);
        let active_advisory = ctx.repo.get_advisory(shipment_id).await?;

        let inbox = Arc::new(Inbox::new(cfg.queue.per_shipment_capacity));
        let done = Arc::new(AtomicBool::new(false));
        let handle = ActorHandle {
            shipment_id,
            inbox: Arc::clone(&inbox),
            done: Arc::clone(&done),
        };

        let mut actor = ShipmentActor {
            ctx,
            shipment,
            stops,
            route,
            snapper: RoadSnapper,
            snap_state: SnapState::default(),
            estimator,
            dwell: DwellTracker::new(),
            classifier: DelayClassifier,
            evaluator: RerouteEvaluator,
            hos: None,
            vehicle_event: None,
            active_advisory,
            latest_etas: persisted,
            latest_snapped: None,
            last_accepted_ts: None,
            consecutive_rejections: 0,
            routing_degraded: false,
            degraded_buffer: VecDeque::new(),
            stats: ActorStats::default(),
        };

        tokio::spawn(async move {
            info!(shipment_id, "Shipment actor started");
            actor.run(&inbox, cancel).await;
            done.store(true, Ordering::Relaxed);
            info!(
                shipment_id,
                status = %actor.shipment.status,
                positions = actor.stats.positions_processed,
                admission_dropped = actor.stats.positions_admission_dropped,
                snap_rejections = actor.stats.snap_rejections,
                "Shipment actor stopped"
            );
        });

        Ok(handle)
    }

    async fn run(&mut self, inbox: &Inbox, cancel: CancellationToken) {
        loop {
            loop {
                if cancel.is_cancelled() || self.shipment.status.is_terminal() {
                    self.drain_commands_terminal(inbox);
                    return;
                }
                if let Some(command) = inbox.pop_command() {
                    self.handle_command(command).await;
                    continue;
                }
                if let Some(position) = inbox.pop_position() {
                    self.handle_position(position).await;
                    continue;
                }
                break;
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    self.drain_commands_terminal(inbox);
                    return;
                }
                () = inbox.notify.notified() => {}
            }
        }
    }

    /// Answer any commands still queued after the actor decided to stop,
    /// so callers holding reply channels do not hang.
    fn drain_commands_terminal(&mut self, inbox: &Inbox) {
        while let Some(command) = inbox.pop_command() {
            match command {
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.build_snapshot());
                }
                Command::ProposeReroute { reply } => {
                    let _ = reply.send(Err(CommandError::StateConflict(
                        "shipment is no longer active".to_string(),
                    )));
                }
                Command::AcceptReroute { reply, .. } | Command::RejectReroute { reply, .. } => {
                    let _ = reply.send(Err(CommandError::StateConflict(
                        "shipment is no longer active".to_string(),
                    )));
                }
                Command::Cancel { reply } => {
                    let _ = reply.send(Ok(()));
                }
                Command::ReportVehicleEvent { .. } | Command::SetShiftStart { .. } => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Hot path
    // ------------------------------------------------------------------

    async fn handle_position(&mut self, position: Position) {
        let now = self.ctx.clock.now();

        // Step 1: admission — strictly increasing timestamps per vehicle.
        if let Some(last) = self.last_accepted_ts {
            if position.ts <= last {
                self.stats.positions_admission_dropped += 1;
                debug!(
                    shipment_id = self.shipment.id,
                    ts = %position.ts,
                    last = %last,
                    "Position dropped: timestamp not after last accepted"
                );
                return;
            }
        }

        // Lazily obtain a route the first time a fix arrives without one.
        if self.route.is_none() {
            self.refresh_route_from(position.coordinate).await;
        }
        let Some(route) = self.route.clone() else {
            self.stats.positions_admission_dropped += 1;
            return;
        };

        // Step 2: snap.
        let snapped = match self.snapper.snap(&mut self.snap_state, &position, &route) {
            Ok(snapped) => snapped,
            Err(rejection) => {
                self.consecutive_rejections += 1;
                self.stats.snap_rejections += 1;
                debug!(
                    shipment_id = self.shipment.id,
                    rejections = self.consecutive_rejections,
                    %rejection,
                    "Snap rejected"
                );
                return;
            }
        };
        self.consecutive_rejections = 0;
        self.last_accepted_ts = Some(position.ts);
        self.stats.positions_processed += 1;

        // pending -> in_transit on the first forward fix.
        if self.shipment.status == ShipmentStatus::Pending && snapped.progress > 0.0 {
            self.transition_status(ShipmentStatus::InTransit).await;
        }

        // Step 3: stop arrival/departure.
        if let Some(transition) = self.dwell.observe(&snapped, &self.stops) {
            self.apply_stop_transition(transition).await;
        }

        // Step 4: signal samples, then the ETA pass.
        let (traffic, weather) = self.sample_signals(snapped.snapped, now).await;
        let etas = self.estimator.estimate(
            now,
            &self.ctx.ids,
            &EtaInputs {
                snapped: &snapped,
                route: &route,
                stops: &self.stops,
                traffic: traffic.as_ref(),
                weather: weather.as_ref(),
                routing_degraded: self.routing_degraded,
            },
        );

        // Step 5: delay classification; publish only real changes.
        let previous_severity = self.active_advisory.as_ref().map(|a| a.severity);
        let advisory = self
            .run_classifier(now, &etas, traffic.as_ref(), weather.as_ref())
            .await;

        // Step 6: reroute evaluation.
        self.maybe_evaluate_reroute(previous_severity, &snapped, &etas, traffic.as_ref())
            .await;

        // Step 7: composite position_update.
        let residual_percent = (1.0 - snapped.progress) * 100.0;
        self.ctx.hub.publish(ShipmentEvent::PositionUpdate {
            shipment_id: self.shipment.id,
            snapped: snapped.snapped,
            progress: snapped.progress,
            residual_percent,
            per_stop_etas: etas.clone(),
            advisory: advisory.clone(),
        });

        // Step 8: persistence.
        self.persist_cycle(&snapped, &etas, residual_percent).await;

        self.latest_etas = etas;
        self.latest_snapped = Some(snapped);

        // Terminal stop completion may have been detected in step 3.
        let terminal_done = self
            .stops
            .iter()
            .max_by_key(|s| s.sequence)
            .map(|s| s.completed)
            .unwrap_or(false);
        if terminal_done && !self.shipment.status.is_terminal() {
            self.transition_status(ShipmentStatus::Completed).await;
        }
    }

    async fn sample_signals(
        &self,
        point: crate::types::Coordinate,
        now: DateTime<Utc>,
    ) -> (Option<TrafficSample>, Option<WeatherSample>) {
        let budget = std::time::Duration::from_millis(config::get().signals.timeout_ms);
        let traffic = match tokio::time::timeout(budget, self.ctx.traffic.sample(point, now)).await
        {
            Ok(Ok(sample)) => Some(sample),
            Ok(Err(e)) => {
                debug!(shipment_id = self.shipment.id, error = %e, "Traffic sample missing");
                None
            }
            Err(_) => {
                debug!(shipment_id = self.shipment.id, "Traffic sample timed out");
                None
            }
        };
        let weather = match tokio::time::timeout(budget, self.ctx.weather.sample(point, now)).await
        {
            Ok(Ok(sample)) => Some(sample),
            Ok(Err(e)) => {
                debug!(shipment_id = self.shipment.id, error = %e, "Weather sample missing");
                None
            }
            Err(_) => {
                debug!(shipment_id = self.shipment.id, "Weather sample timed out");
                None
            }
        };
        (traffic, weather)
    }

    async fn run_classifier(
        &mut self,
        now: DateTime<Utc>,
        etas: &[EtaSample],
        traffic: Option<&TrafficSample>,
        weather: Option<&WeatherSample>,
    ) -> Option<Advisory> {
        let terminal_eta = self
            .stops
            .iter()
            .max_by_key(|s| s.sequence)
            .and_then(|terminal| etas.iter().find(|e| e.stop_id == terminal.id));

        let verdict = self.classifier.classify(&ClassifierInputs {
            now,
            promised_by: self.shipment.promised_by,
            terminal_eta,
            traffic,
            weather,
            hos: self.hos.as_ref(),
            vehicle_event: self.vehicle_event.as_ref(),
            snap_rejections: self.consecutive_rejections,
        });

        let advisory = Advisory {
            id: self.ctx.ids.next(),
            shipment_id: self.shipment.id,
            observed_at: now,
            reason: verdict.reason,
            confidence: verdict.confidence,
            explanation: verdict.explanation,
            severity: verdict.severity,
        };

        let changed = self
            .active_advisory
            .as_ref()
            .map(|active| active.differs_from(&advisory))
            .unwrap_or(true);
        if changed {
            let persisted = with_retry(|| {
                repo_call(self.ctx.repo.upsert_advisory(self.shipment.id, &advisory))
            })
            .await;
            if let Err(e) = persisted {
                warn!(shipment_id = self.shipment.id, error = %e, "Advisory upsert failed");
            }
            self.ctx.hub.publish(ShipmentEvent::AdvisoryChanged {
                shipment_id: self.shipment.id,
                reason_code: advisory.reason,
                confidence: advisory.confidence,
                explanation: advisory.explanation.clone(),
                severity: advisory.severity,
            });
            info!(
                shipment_id = self.shipment.id,
                reason = %advisory.reason,
                severity = %advisory.severity,
                confidence = advisory.confidence,
                "Advisory changed"
            );
            self.active_advisory = Some(advisory);
        }
        self.active_advisory.clone()
    }

    async fn maybe_evaluate_reroute(
        &mut self,
        previous_severity: Option<Severity>,
        snapped: &SnappedPoint,
        etas: &[EtaSample],
        traffic: Option<&TrafficSample>,
    ) {
        // Expire an aging proposal regardless of triggers.
        if let Ok(Some(_)) = self
            .evaluator
            .expire_stale(self.ctx.repo.as_ref(), self.shipment.id)
            .await
        {
            // expired proposals need no broadcast; queries stop showing them
        }

        let Some(terminal) = self.stops.iter().max_by_key(|s| s.sequence) else {
            return;
        };
        let Some(terminal_eta) = etas.iter().find(|e| e.stop_id == terminal.id) else {
            return;
        };
        let lateness_min = (terminal_eta.estimated_arrival - self.shipment.promised_by)
            .num_seconds() as f64
            / 60.0;
        let current_severity = self
            .active_advisory
            .as_ref()
            .map(|a| a.severity)
            .unwrap_or(Severity::Low);

        let Some(trigger) = trigger_for(
            previous_severity,
            current_severity,
            lateness_min,
            traffic.map(|t| t.speed_factor()),
        ) else {
            return;
        };

        // One outstanding proposal at a time; don't churn the routing
        // backend while a planner is already looking at one.
        match self.ctx.repo.proposed_reroute(self.shipment.id).await {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                warn!(shipment_id = self.shipment.id, error = %e, "Proposal lookup failed");
                return;
            }
        }

        self.propose(snapped.snapped, terminal_eta, trigger).await.ok();
    }

    async fn propose(
        &mut self,
        from: crate::types::Coordinate,
        terminal_eta: &EtaSample,
        trigger: RerouteTrigger,
    ) -> Result<Option<Reroute>, CommandError> {
        let plan = CurrentPlan {
            residual_duration_s: terminal_eta.smoothed_duration_s,
            residual_distance_m: terminal_eta.residual_distance_m,
            eta_confidence: terminal_eta.bucket,
        };
        let result = self
            .evaluator
            .evaluate(
                self.ctx.repo.as_ref(),
                &self.ctx.routing,
                &self.ctx.ids,
                &self.shipment,
                &self.stops,
                from,
                plan,
                trigger,
            )
            .await;

        match result {
            Ok(Some(reroute)) => {
                self.routing_degraded = false;
                self.ctx.hub.publish(ShipmentEvent::RerouteSuggested {
                    shipment_id: self.shipment.id,
                    reroute_id: reroute.id,
                    time_saved_min: reroute.projected_saving_min,
                    reason: reroute.reason.clone(),
                });
                self.audit(
                    "reroute_suggested",
                    serde_json::json!({
                        "reroute_id": reroute.id,
                        "time_saved_min": reroute.projected_saving_min,
                    }),
                )
                .await;
                Ok(Some(reroute))
            }
            Ok(None) => Ok(None),
            Err(crate::reroute::RerouteError::Routing(e)) => {
                // Keep the current route; ETA confidence is capped until a
                // routing call succeeds again.
                self.routing_degraded = true;
                warn!(shipment_id = self.shipment.id, error = %e, "Reroute evaluation: routing unavailable");
                Err(CommandError::RoutingUnavailable(e.to_string()))
            }
            Err(crate::reroute::RerouteError::Repo(e)) => Err(e.into()),
        }
    }

    async fn apply_stop_transition(&mut self, transition: StopTransition) {
        let terminal_seq = self.stops.iter().map(|s| s.sequence).max().unwrap_or(0);
        match transition {
            StopTransition::Arrived { stop_id, at } => {
                let is_terminal = self
                    .stops
                    .iter()
                    .find(|s| s.id == stop_id)
                    .map(|s| s.sequence == terminal_seq)
                    .unwrap_or(false);
                // The terminal stop has no departure; arrival completes it.
                let completed = is_terminal;
                let persisted = with_retry(|| {
                    repo_call(self.ctx.repo.update_stop_actual(
                        stop_id,
                        Some(at),
                        None,
                        completed,
                    ))
                })
                .await;
                if let Err(e) = persisted {
                    warn!(shipment_id = self.shipment.id, error = %e, "Stop arrival persist failed");
                }
                if let Some(stop) = self.stops.iter_mut().find(|s| s.id == stop_id) {
                    stop.actual_arrival.get_or_insert(at);
                    stop.completed = stop.completed || completed;
                    info!(
                        shipment_id = self.shipment.id,
                        stop = stop.sequence,
                        terminal = is_terminal,
                        "Stop arrival"
                    );
                }
                self.audit("stop_arrival", serde_json::json!({"stop_id": stop_id, "at": at}))
                    .await;
            }
            StopTransition::Departed { stop_id, at } => {
                let persisted = with_retry(|| {
                    repo_call(
                        self.ctx
                            .repo
                            .update_stop_actual(stop_id, None, Some(at), true),
                    )
                })
                .await;
                if let Err(e) = persisted {
                    warn!(shipment_id = self.shipment.id, error = %e, "Stop departure persist failed");
                }
                if let Some(stop) = self.stops.iter_mut().find(|s| s.id == stop_id) {
                    stop.actual_departure = Some(at);
                    stop.completed = true;
                    info!(shipment_id = self.shipment.id, stop = stop.sequence, "Stop departure");
                }
                self.dwell.reset();
                self.audit("stop_departure", serde_json::json!({"stop_id": stop_id, "at": at}))
                    .await;
            }
        }
    }

    async fn persist_cycle(
        &mut self,
        snapped: &SnappedPoint,
        etas: &[EtaSample],
        residual_percent: f64,
    ) {
        // Flush the degraded buffer ahead of the fresh point so order holds.
        if !self.degraded_buffer.is_empty() {
            let backlog: Vec<SnappedPoint> = self.degraded_buffer.iter().cloned().collect();
            if with_retry(|| {
                repo_call(
                    self.ctx
                        .repo
                        .append_positions(&self.shipment.vehicle_id, &backlog),
                )
            })
            .await
            .is_ok()
            {
                info!(
                    shipment_id = self.shipment.id,
                    flushed = backlog.len(),
                    "Degraded position buffer flushed"
                );
                self.degraded_buffer.clear();
            }
        }

        let points = std::slice::from_ref(snapped);
        let persisted = with_retry(|| {
            repo_call(
                self.ctx
                    .repo
                    .append_positions(&self.shipment.vehicle_id, points),
            )
        })
        .await;

        match persisted {
            Ok(_) => {
                if let Err(e) =
                    with_retry(|| repo_call(self.ctx.repo.append_eta_samples(etas))).await
                {
                    warn!(shipment_id = self.shipment.id, error = %e, "ETA sample persist failed");
                }
                self.audit(
                    "position_update",
                    serde_json::json!({
                        "ts": snapped.position.ts,
                        "progress": snapped.progress,
                        "residual_percent": residual_percent,
                    }),
                )
                .await;
            }
            Err(e) => {
                // Buffer the snapshot and keep serving; loss beyond the
                // buffer capacity is permitted and counted.
                let cap = config::get().queue.degraded_buffer;
                while self.degraded_buffer.len() >= cap {
                    self.degraded_buffer.pop_front();
                    self.stats.storage_degraded_lost += 1;
                }
                self.degraded_buffer.push_back(snapped.clone());
                self.stats.storage_degraded_buffered = self.degraded_buffer.len();
                warn!(
                    shipment_id = self.shipment.id,
                    buffered = self.degraded_buffer.len(),
                    error = %e,
                    "Storage degraded; buffering position"
                );
                self.ctx.hub.publish(ShipmentEvent::StorageDegraded {
                    shipment_id: self.shipment.id,
                    buffered: self.degraded_buffer.len(),
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::ProposeReroute { reply } => {
                let result = self.manual_propose().await;
                let _ = reply.send(result);
            }
            Command::AcceptReroute { reroute_id, reply } => {
                let result = self.accept_reroute(reroute_id).await;
                let _ = reply.send(result);
            }
            Command::RejectReroute { reroute_id, reply } => {
                let result = self.reject_reroute(reroute_id).await;
                let _ = reply.send(result);
            }
            Command::ReportVehicleEvent { description, at } => {
                self.audit(
                    "vehicle_event",
                    serde_json::json!({"description": description, "at": at}),
                )
                .await;
                self.vehicle_event = Some(ManualEvent { at, description });
            }
            Command::SetShiftStart { at } => {
                self.hos = Some(HosState { shift_start: at });
            }
            Command::Cancel { reply } => {
                if self.shipment.status.is_terminal() {
                    let _ = reply.send(Err(CommandError::StateConflict(format!(
                        "shipment already {}",
                        self.shipment.status
                    ))));
                } else {
                    self.transition_status(ShipmentStatus::Cancelled).await;
                    let _ = reply.send(Ok(()));
                }
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.build_snapshot());
            }
        }
    }

    async fn manual_propose(&mut self) -> Result<Option<Reroute>, CommandError> {
        let Some(snapped) = self.latest_snapped.clone() else {
            return Err(CommandError::StateConflict(
                "no accepted position yet".to_string(),
            ));
        };
        let Some(terminal) = self.stops.iter().max_by_key(|s| s.sequence) else {
            return Err(CommandError::NotFound);
        };
        let Some(terminal_eta) = self
            .latest_etas
            .iter()
            .find(|e| e.stop_id == terminal.id)
            .cloned()
        else {
            return Err(CommandError::StateConflict(
                "no ETA computed yet".to_string(),
            ));
        };
        self.propose(snapped.snapped, &terminal_eta, RerouteTrigger::Manual)
            .await
    }

    async fn accept_reroute(&mut self, reroute_id: EntityId) -> Result<(), CommandError> {
        let reroute = self.ctx.repo.get_reroute(reroute_id).await?;
        if reroute.shipment_id != self.shipment.id {
            return Err(CommandError::NotFound);
        }

        let new_route = self
            .ctx
            .repo
            .replace_active_route_with_reroute(self.shipment.id, reroute_id)
            .await?;

        // Local state follows the store: fresh shipment version, new
        // geometry, progress and smoothing restart on the new polyline.
        self.shipment = self.ctx.repo.get_shipment_by_id(self.shipment.id).await?;
        self.route = Some(new_route.clone());
        self.snap_state.reset_progress();
        self.estimator.reset_for_route_change();
        self.routing_degraded = false;

        // Recompute ETAs against the new route from the last known fix so
        // the broadcast carries fresh per-stop estimates.
        let stops_with_new_etas = match self.latest_snapped.clone() {
            Some(mut snapped) => {
                if let Some(projection) =
                    crate::geo::project_onto_polyline(&new_route.polyline, snapped.position.coordinate)
                {
                    snapped.route_id = new_route.id;
                    snapped.snapped = projection.point;
                    snapped.progress = projection.fraction;
                    snapped.cross_track_m = projection.cross_track_m;
                    self.snap_state.last_progress = Some(projection.fraction);
                    self.snap_state.last_ts = Some(snapped.position.ts);
                }
                let now = self.ctx.clock.now();
                let (traffic, weather) = self.sample_signals(snapped.snapped, now).await;
                let etas = self.estimator.estimate(
                    now,
                    &self.ctx.ids,
                    &EtaInputs {
                        snapped: &snapped,
                        route: &new_route,
                        stops: &self.stops,
                        traffic: traffic.as_ref(),
                        weather: weather.as_ref(),
                        routing_degraded: false,
                    },
                );
                self.latest_snapped = Some(snapped);
                if let Err(e) =
                    with_retry(|| repo_call(self.ctx.repo.append_eta_samples(&etas))).await
                {
                    warn!(shipment_id = self.shipment.id, error = %e, "Post-reroute ETA persist failed");
                }
                self.latest_etas = etas.clone();
                etas
            }
            None => Vec::new(),
        };

        self.ctx.hub.publish(ShipmentEvent::RerouteAccepted {
            shipment_id: self.shipment.id,
            reroute_id,
            new_route_summary: RouteSummary {
                route_id: new_route.id,
                total_distance_m: new_route.total_distance_m,
                total_duration_s: new_route.total_duration_s,
                source: new_route.source.clone(),
            },
            stops_with_new_etas,
        });
        self.audit(
            "reroute_accepted",
            serde_json::json!({"reroute_id": reroute_id, "new_route_id": new_route.id}),
        )
        .await;
        info!(
            shipment_id = self.shipment.id,
            reroute_id,
            new_route_id = new_route.id,
            "Reroute accepted"
        );
        Ok(())
    }

    async fn reject_reroute(&mut self, reroute_id: EntityId) -> Result<(), CommandError> {
        let reroute = self.ctx.repo.get_reroute(reroute_id).await?;
        if reroute.shipment_id != self.shipment.id {
            return Err(CommandError::NotFound);
        }
        if reroute.status != crate::types::RerouteStatus::Proposed {
            return Err(CommandError::StateConflict(format!(
                "reroute is {}",
                reroute.status
            )));
        }
        self.ctx
            .repo
            .update_reroute_status(reroute_id, crate::types::RerouteStatus::Rejected)
            .await?;
        self.audit("reroute_rejected", serde_json::json!({"reroute_id": reroute_id}))
            .await;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    /// Fetch a route when the actor has none: snap the fix to the road
    /// network, then route through every remaining stop.
    async fn refresh_route_from(&mut self, from: crate::types::Coordinate) {
        let origin = match self.ctx.routing.snap(from).await {
            Ok(snapped) => snapped,
            Err(_) => from,
        };
        let mut waypoints = vec![origin];
        waypoints.extend(self.stops.iter().filter(|s| !s.completed).map(|s| s.coordinate));
        if waypoints.len() < 2 {
            return;
        }

        match self
            .ctx
            .routing
            .route(&waypoints, &self.shipment.truck_profile)
            .await
        {
            Ok(plan) => {
                let route = Route {
                    id: self.ctx.ids.next(),
                    polyline: plan.polyline,
                    total_distance_m: plan.total_distance_m,
                    total_duration_s: plan.total_duration_s,
                    segments: plan.segments,
                    profile: self.shipment.truck_profile.clone(),
                    source: plan.source,
                    created_at: self.ctx.clock.now(),
                };
                if let Err(e) = self.ctx.repo.insert_route(&route).await {
                    warn!(shipment_id = self.shipment.id, error = %e, "Route persist failed");
                }
                let mut updated = self.shipment.clone();
                updated.active_route_id = Some(route.id);
                updated.version += 1;
                updated.updated_at = self.ctx.clock.now();
                match self.ctx.repo.update_shipment(&updated).await {
                    Ok(()) => self.shipment = updated,
                    Err(e) => {
                        warn!(shipment_id = self.shipment.id, error = %e, "Shipment route ref update failed");
                    }
                }
                self.route = Some(route);
                self.routing_degraded = false;
            }
            Err(e) => {
                // Keep whatever we had; C6 still computes on the old route
                // with confidence capped at medium.
                warn!(shipment_id = self.shipment.id, error = %e, "Routing unavailable, retaining last route");
                self.routing_degraded = true;
            }
        }
    }

    async fn transition_status(&mut self, to: ShipmentStatus) {
        if to.rank() <= self.shipment.status.rank() && to != ShipmentStatus::Cancelled {
            return;
        }
        let mut updated = self.shipment.clone();
        updated.status = to;
        updated.version += 1;
        updated.updated_at = self.ctx.clock.now();

        match with_retry(|| repo_call(self.ctx.repo.update_shipment(&updated))).await {
            Ok(()) => {
                info!(shipment_id = self.shipment.id, from = %self.shipment.status, to = %to, "Status transition");
                self.shipment = updated;
                self.audit("status_changed", serde_json::json!({"status": to.to_string()}))
                    .await;
            }
            Err(RepoError::Conflict { .. }) => {
                // Another writer bumped the version; re-read and reapply once.
                if let Ok(mut fresh) = self.ctx.repo.get_shipment_by_id(self.shipment.id).await {
                    fresh.status = to;
                    fresh.version += 1;
                    fresh.updated_at = self.ctx.clock.now();
                    if self.ctx.repo.update_shipment(&fresh).await.is_ok() {
                        self.shipment = fresh;
                    }
                }
            }
            Err(e) => {
                warn!(shipment_id = self.shipment.id, error = %e, "Status transition persist failed");
            }
        }
    }

    async fn audit(&self, kind: &str, payload: serde_json::Value) {
        if let Err(e) = self
            .ctx
            .repo
            .insert_event(self.shipment.id, kind, payload, self.ctx.clock.now())
            .await
        {
            debug!(shipment_id = self.shipment.id, error = %e, "Audit event insert failed");
        }
    }

    fn build_snapshot(&self) -> ShipmentSnapshot {
        let stops = self
            .stops
            .iter()
            .map(|stop| StopView {
                stop: stop.clone(),
                eta: self
                    .latest_etas
                    .iter()
                    .find(|e| e.stop_id == stop.id)
                    .cloned(),
            })
            .collect();
        ShipmentSnapshot {
            shipment: self.shipment.clone(),
            stops,
            advisory: self.active_advisory.clone(),
            last_snapped: self.latest_snapped.clone(),
            residual_percent: self
                .latest_snapped
                .as_ref()
                .map(|s| (1.0 - s.progress) * 100.0)
                .unwrap_or(100.0),
        }
    }
}

// ============================================================================
// Retry helper
// ============================================================================

/// Bound a repository future by the configured timeout, mapping the
/// elapsed case to a transient error.
async fn repo_call<T>(
    fut: impl std::future::Future<Output = Result<T, RepoError>>,
) -> Result<T, RepoError> {
    let budget = std::time::Duration::from_millis(config::defaults::REPO_TIMEOUT_MS);
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => Err(RepoError::Transient("repository call timed out".to_string())),
    }
}

/// Retry transient repository failures with exponential backoff. Conflicts
/// and not-found pass through untouched.
async fn with_retry<T, Fut>(mut op: impl FnMut() -> Fut) -> Result<T, RepoError>
where
    Fut: std::future::Future<Output = Result<T, RepoError>>,
{
    use crate::config::defaults::{REPO_RETRY_ATTEMPTS, REPO_RETRY_BACKOFF_MS};

    let mut delay_ms = REPO_RETRY_BACKOFF_MS;
    let mut last = None;
    for attempt in 0..REPO_RETRY_ATTEMPTS {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                debug!(attempt, error = %e, "Transient repository failure");
                last = Some(e);
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                delay_ms *= 2;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| RepoError::Transient("retries exhausted".to_string())))
}
