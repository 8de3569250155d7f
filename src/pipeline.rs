//! Pipeline orchestration
//!
//! A run walks `IDLE → FETCHING → FEATURIZING → (FITTING | LOADING_CACHED_MODEL)
//! → SIGNALING → EVALUATING → DONE`, or ends in `FAILED` from any step. At most
//! one run executes at a time: [`PipelineState::try_begin`] hands out a single
//! [`RunGuard`] and every other start request is rejected with
//! [`PipelineError::RunInProgress`]. Accepted runs are handed to one
//! long-lived worker thread through a single-slot queue.
//!
//! Results are published as one immutable [`PipelineSnapshot`] when a run
//! completes, so readers see either the previous snapshot or the new one.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread;
use tracing::{debug, error, info, warn};

use crate::config::{Config, RegimeVariant};
use crate::data::PriceSource;
use crate::error::{PipelineError, PipelineResult};
use crate::evaluate::PerformanceEvaluator;
use crate::features::{compute_features, FeatureSchema};
use crate::predictor::{fit_model, FitSummary, FittedModel, RidgeRegressor};
use crate::regime::{regime_counts, RegimeClassifier};
use crate::signals::{hold_timeline, SignalGenerator, SignalSet};
use crate::store::{ModelBundle, ModelStore, RunRecord};
use crate::{
    Availability, FeatureRow, PerformanceReport, Regime, SignalCounts, SignalRow,
};

/// Price points returned by the dashboard overview
pub const OVERVIEW_PRICE_LIMIT: usize = 100;
/// Active signals returned by the dashboard overview
pub const OVERVIEW_SIGNAL_LIMIT: usize = 50;

// =============================================================================
// Run State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    #[default]
    Idle,
    Fetching,
    Featurizing,
    Fitting,
    LoadingCachedModel,
    Signaling,
    Evaluating,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "IDLE",
            RunState::Fetching => "FETCHING",
            RunState::Featurizing => "FEATURIZING",
            RunState::Fitting => "FITTING",
            RunState::LoadingCachedModel => "LOADING_CACHED_MODEL",
            RunState::Signaling => "SIGNALING",
            RunState::Evaluating => "EVALUATING",
            RunState::Done => "DONE",
            RunState::Failed => "FAILED",
        };
        write!(f, "{}", name)
    }
}

/// Where the model used by a run came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelSource {
    Fitted,
    Memory,
    Store,
}

// =============================================================================
// Snapshot
// =============================================================================

/// Everything one completed run produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSnapshot {
    pub completed_at: DateTime<Utc>,
    pub source: String,
    pub features: Vec<FeatureRow>,
    /// One signal per feature row
    pub signals: Vec<SignalRow>,
    /// Window signals and threshold search outcome; absent when the run fell
    /// back to an all-HOLD timeline
    pub signal_set: Option<SignalSet>,
    pub report: PerformanceReport,
    pub regime_variant: RegimeVariant,
    pub model_source: ModelSource,
    pub fit: Option<FitSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalsView {
    /// Most recent BUY/SELL rows, oldest first
    pub signals: Vec<SignalRow>,
    pub counts: SignalCounts,
    pub final_threshold: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegimePoint {
    pub timestamp: DateTime<Utc>,
    pub regime: Regime,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegimesView {
    pub variant: RegimeVariant,
    pub regimes: Vec<RegimePoint>,
    pub counts: BTreeMap<&'static str, usize>,
    pub labels: BTreeMap<u8, &'static str>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PricePointView {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceDataView {
    pub points: Vec<PricePointView>,
    pub latest_price: Option<f64>,
    /// Change of the last period, in percent
    pub change_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overview {
    pub completed_at: DateTime<Utc>,
    pub price_data: PriceDataView,
    pub signals: SignalsView,
    pub latest_signal: Option<SignalRow>,
    pub regimes: RegimesView,
    pub performance: PerformanceReport,
}

impl PipelineSnapshot {
    pub fn signals_view(&self, limit: usize) -> SignalsView {
        let active: Vec<&SignalRow> = self.signals.iter().filter(|s| s.signal.is_active()).collect();
        let skip = active.len().saturating_sub(limit);

        SignalsView {
            signals: active.into_iter().skip(skip).cloned().collect(),
            counts: SignalCounts::from_rows(&self.signals),
            final_threshold: self.signal_set.as_ref().map(|s| s.final_threshold),
        }
    }

    pub fn regimes_view(&self) -> RegimesView {
        RegimesView {
            variant: self.regime_variant,
            regimes: self
                .features
                .iter()
                .map(|f| RegimePoint {
                    timestamp: f.timestamp,
                    regime: f.market_regime,
                })
                .collect(),
            counts: regime_counts(&self.features)
                .into_iter()
                .map(|(regime, n)| (regime.label(), n))
                .collect(),
            labels: Regime::labels(),
        }
    }

    pub fn price_view(&self, limit: usize) -> PriceDataView {
        let skip = self.features.len().saturating_sub(limit);
        let change_pct = match self.features.as_slice() {
            [.., prev, last] if prev.price != 0.0 => Some((last.price / prev.price - 1.0) * 100.0),
            _ => None,
        };

        PriceDataView {
            points: self.features[skip..]
                .iter()
                .map(|f| PricePointView {
                    timestamp: f.timestamp,
                    price: f.price,
                })
                .collect(),
            latest_price: self.features.last().map(|f| f.price),
            change_pct,
        }
    }

    pub fn overview(&self) -> Overview {
        Overview {
            completed_at: self.completed_at,
            price_data: self.price_view(OVERVIEW_PRICE_LIMIT),
            signals: self.signals_view(OVERVIEW_SIGNAL_LIMIT),
            latest_signal: self.signals.last().cloned(),
            regimes: self.regimes_view(),
            performance: self.report.clone(),
        }
    }
}

// =============================================================================
// Shared State
// =============================================================================

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    lock.read().unwrap_or_else(PoisonError::into_inner).clone()
}

fn write<T>(lock: &RwLock<T>, value: T) {
    *lock.write().unwrap_or_else(PoisonError::into_inner) = value;
}

/// State shared between the run worker and readers
#[derive(Debug, Default)]
pub struct PipelineState {
    running: AtomicBool,
    run_state: RwLock<RunState>,
    model: RwLock<Option<Arc<FittedModel>>>,
    snapshot: RwLock<Option<Arc<PipelineSnapshot>>>,
    last_error: RwLock<Option<PipelineError>>,
}

impl PipelineState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim the single run slot
    pub fn try_begin(self: &Arc<Self>) -> PipelineResult<RunGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| PipelineError::RunInProgress)?;
        Ok(RunGuard {
            state: Arc::clone(self),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn run_state(&self) -> RunState {
        read(&self.run_state)
    }

    fn transition(&self, next: RunState) {
        let mut current = self.run_state.write().unwrap_or_else(PoisonError::into_inner);
        info!("Pipeline state {} -> {}", *current, next);
        *current = next;
    }

    pub fn snapshot(&self) -> Option<Arc<PipelineSnapshot>> {
        read(&self.snapshot)
    }

    pub fn publish(&self, snapshot: Arc<PipelineSnapshot>) {
        write(&self.snapshot, Some(snapshot));
    }

    pub fn model(&self) -> Option<Arc<FittedModel>> {
        read(&self.model)
    }

    pub fn set_model(&self, model: Arc<FittedModel>) {
        write(&self.model, Some(model));
    }

    pub fn last_error(&self) -> Option<PipelineError> {
        read(&self.last_error)
    }
}

/// Proof of holding the run slot; released on drop
#[derive(Debug)]
pub struct RunGuard {
    state: Arc<PipelineState>,
}

impl RunGuard {
    pub fn state(&self) -> &PipelineState {
        &self.state
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::Release);
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

#[derive(Default)]
struct RunProgress {
    model: Option<(Arc<FittedModel>, ModelSource)>,
    signal_set: Option<SignalSet>,
    report: Option<PerformanceReport>,
}

/// Sequences one run over the configured collaborators
pub struct Pipeline {
    config: Config,
    source: Box<dyn PriceSource>,
    store: Option<ModelStore>,
}

impl Pipeline {
    pub fn new(config: Config, source: Box<dyn PriceSource>) -> Self {
        Pipeline {
            config,
            source,
            store: None,
        }
    }

    pub fn with_store(mut self, store: ModelStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Option<&ModelStore> {
        self.store.as_ref()
    }

    /// Execute one run while holding the run slot
    ///
    /// On success the snapshot is published before returning. On failure the
    /// previous snapshot stays visible and the error is kept for status reads.
    pub fn run(&self, guard: &RunGuard) -> PipelineResult<Arc<PipelineSnapshot>> {
        let state = guard.state();
        let started_at = Utc::now();
        let mut progress = RunProgress::default();

        let result = self.execute(state, &mut progress);

        match &result {
            Ok(snapshot) => {
                state.publish(Arc::clone(snapshot));
                write(&state.last_error, None);
                state.transition(RunState::Done);
            }
            Err(e) => {
                error!("Pipeline run failed: {}", e);
                write(&state.last_error, Some(e.clone()));
                state.transition(RunState::Failed);
            }
        }

        self.write_back(started_at, &result, &progress);
        result
    }

    fn execute(
        &self,
        state: &PipelineState,
        progress: &mut RunProgress,
    ) -> PipelineResult<Arc<PipelineSnapshot>> {
        state.transition(RunState::Fetching);
        let series = self.source.fetch()?;

        state.transition(RunState::Featurizing);
        let features = compute_features(&series)?;
        let features = RegimeClassifier::new(self.config.regime.clone()).classify(&features);
        let schema = FeatureSchema::for_table(&features);
        let window_size = self.config.signals.window_size;

        let (model, model_source, fit) = match self.cached_model(state, &schema, window_size) {
            Some((model, source)) => {
                state.transition(RunState::LoadingCachedModel);
                (model, source, None)
            }
            None => {
                state.transition(RunState::Fitting);
                let (model, summary) = fit_model(
                    RidgeRegressor::new(self.config.model.ridge_lambda),
                    &features,
                    window_size,
                    &self.config.model,
                )?;
                (Arc::new(model), ModelSource::Fitted, Some(summary))
            }
        };
        progress.model = Some((Arc::clone(&model), model_source));
        state.set_model(Arc::clone(&model));

        state.transition(RunState::Signaling);
        let generator = SignalGenerator::new(self.config.signals.clone());
        let signal_set = generator.generate(&features, Some(model.as_ref()))?;
        let (signals, signal_set) = match signal_set.timeline(&features) {
            Ok(timeline) => (timeline, Some(signal_set)),
            Err(PipelineError::MissingSignalColumn) => {
                warn!("Signals do not line up with the feature table, using HOLD timeline");
                (hold_timeline(&features), None)
            }
            Err(e) => return Err(e),
        };
        progress.signal_set = signal_set.clone();

        state.transition(RunState::Evaluating);
        let report = PerformanceEvaluator::new(self.config.targets.clone()).evaluate(&signals)?;
        progress.report = Some(report.clone());

        Ok(Arc::new(PipelineSnapshot {
            completed_at: Utc::now(),
            source: self.source.name(),
            features,
            signals,
            signal_set,
            report,
            regime_variant: self.config.regime.variant,
            model_source,
            fit,
        }))
    }

    /// In-memory model first, then the store; any mismatch is a cache miss
    fn cached_model(
        &self,
        state: &PipelineState,
        schema: &FeatureSchema,
        window_size: usize,
    ) -> Option<(Arc<FittedModel>, ModelSource)> {
        if let Some(model) = state.model() {
            if model.is_ready() && model.is_compatible(schema) && model.window_size == window_size {
                info!("Reusing in-memory model");
                return Some((model, ModelSource::Memory));
            }
            info!("In-memory model does not match the feature schema, cache miss");
        }

        let store = self.store.as_ref()?;
        match store.load_bundle::<RidgeRegressor>(schema) {
            Ok(Some(bundle)) if bundle.model.window_size == window_size && bundle.model.is_ready() => {
                Some((Arc::new(bundle.model), ModelSource::Store))
            }
            Ok(Some(_)) => {
                info!("Cached model was fitted for another window size, cache miss");
                None
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Failed to read cached model: {:#}", e);
                None
            }
        }
    }

    /// Persist model, report and run record; failures here are logged only
    fn write_back(
        &self,
        started_at: DateTime<Utc>,
        result: &PipelineResult<Arc<PipelineSnapshot>>,
        progress: &RunProgress,
    ) {
        let Some(store) = &self.store else {
            return;
        };

        match &progress.model {
            Some((model, ModelSource::Fitted)) => {
                let bundle = ModelBundle::new(model.as_ref().clone(), progress.report.clone());
                if let Err(e) = store.save_bundle(&bundle) {
                    warn!("Failed to persist model bundle: {:#}", e);
                }
            }
            Some((model, _)) => {
                let fingerprint = model.schema.fingerprint();
                match store.update_bundle_report(&fingerprint, progress.report.as_ref()) {
                    Ok(true) => {}
                    Ok(false) => {
                        let bundle =
                            ModelBundle::new(model.as_ref().clone(), progress.report.clone());
                        if let Err(e) = store.save_bundle(&bundle) {
                            warn!("Failed to persist model bundle: {:#}", e);
                        }
                    }
                    Err(e) => warn!("Failed to update cached model report: {:#}", e),
                }
            }
            None => {}
        }

        let record = RunRecord {
            id: None,
            started_at,
            finished_at: Utc::now(),
            state: match result {
                Ok(_) => RunState::Done.to_string(),
                Err(_) => RunState::Failed.to_string(),
            },
            error: result.as_ref().err().map(|e| e.to_string()),
            report: progress.report.clone(),
            counts: result
                .as_ref()
                .map(|s| SignalCounts::from_rows(&s.signals))
                .unwrap_or_default(),
            final_threshold: progress.signal_set.as_ref().map(|s| s.final_threshold),
            threshold_attempts: progress.signal_set.as_ref().map(|s| s.threshold_attempts),
        };

        let snapshot = result.as_ref().ok().map(|s| s.as_ref());
        if let Err(e) = store.record_run(&record, snapshot) {
            warn!("Failed to record run: {:#}", e);
        }
    }
}

// =============================================================================
// Service
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub model_loaded: bool,
    pub data_available: bool,
    pub signals_available: bool,
    pub performance_available: bool,
    pub task_running: bool,
    pub state: RunState,
    pub last_error: Option<String>,
    pub last_completed_at: Option<DateTime<Utc>>,
}

type RunResult = PipelineResult<Arc<PipelineSnapshot>>;

/// One accepted run waiting for the worker
#[derive(Debug)]
struct RunRequest {
    guard: RunGuard,
    reply: mpsc::Sender<RunResult>,
}

/// Handle to a run accepted by [`PipelineService::start`]
#[derive(Debug)]
pub struct RunTicket {
    result: Receiver<RunResult>,
}

impl RunTicket {
    /// Block until the worker finishes this run
    pub fn wait(self) -> RunResult {
        self.result
            .recv()
            .map_err(|_| PipelineError::Defect("run worker stopped before replying".into()))?
    }
}

fn worker_loop(pipeline: Arc<Pipeline>, requests: Receiver<RunRequest>) {
    for RunRequest { guard, reply } in requests {
        let result = pipeline.run(&guard);
        drop(guard);
        if reply.send(result).is_err() {
            debug!("Run finished after its requester went away");
        }
    }
    info!("Run worker stopped");
}

/// Runs the pipeline on a single worker and serves snapshot reads
#[derive(Clone)]
pub struct PipelineService {
    pipeline: Arc<Pipeline>,
    state: Arc<PipelineState>,
    requests: SyncSender<RunRequest>,
}

impl PipelineService {
    pub fn new(pipeline: Pipeline) -> Self {
        let (service, requests) = Self::unstarted(pipeline);
        let pipeline = Arc::clone(&service.pipeline);

        if let Err(e) = thread::Builder::new()
            .name("pipeline-worker".to_string())
            .spawn(move || worker_loop(pipeline, requests))
        {
            error!("Failed to spawn run worker: {}", e);
        }
        service
    }

    /// Service whose run queue is not yet consumed by a worker
    fn unstarted(pipeline: Pipeline) -> (Self, Receiver<RunRequest>) {
        let (sender, receiver) = mpsc::sync_channel(1);
        let service = PipelineService {
            pipeline: Arc::new(pipeline),
            state: PipelineState::new(),
            requests: sender,
        };
        (service, receiver)
    }

    pub fn state(&self) -> &PipelineState {
        &self.state
    }

    pub fn config(&self) -> &Config {
        self.pipeline.config()
    }

    /// Load the last persisted model and snapshot, if any
    pub fn restore(&self) -> Result<bool> {
        let Some(store) = self.pipeline.store() else {
            return Ok(false);
        };

        if let Some(bundle) = store.latest_bundle::<RidgeRegressor>()? {
            self.state.set_model(Arc::new(bundle.model));
        }
        match store.last_snapshot::<PipelineSnapshot>()? {
            Some(snapshot) => {
                info!("Restored snapshot from {}", snapshot.completed_at);
                self.state.publish(Arc::new(snapshot));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run to completion, blocking the caller
    pub fn run(&self) -> RunResult {
        self.start()?.wait()
    }

    /// Queue a run for the worker
    ///
    /// Rejected with `RunInProgress` while a run is queued or executing.
    pub fn start(&self) -> PipelineResult<RunTicket> {
        let guard = self.state.try_begin()?;
        let (reply, result) = mpsc::channel();

        match self.requests.try_send(RunRequest { guard, reply }) {
            Ok(()) => Ok(RunTicket { result }),
            Err(TrySendError::Full(_)) => Err(PipelineError::RunInProgress),
            Err(TrySendError::Disconnected(_)) => {
                Err(PipelineError::Defect("run worker is not running".into()))
            }
        }
    }

    pub fn snapshot(&self) -> Availability<Arc<PipelineSnapshot>> {
        self.state.snapshot().into()
    }

    pub fn signals(&self, limit: usize) -> Availability<SignalsView> {
        self.state.snapshot().map(|s| s.signals_view(limit)).into()
    }

    pub fn performance(&self) -> Availability<PerformanceReport> {
        self.state.snapshot().map(|s| s.report.clone()).into()
    }

    pub fn regimes(&self) -> Availability<RegimesView> {
        self.state.snapshot().map(|s| s.regimes_view()).into()
    }

    pub fn price_data(&self, limit: usize) -> Availability<PriceDataView> {
        self.state.snapshot().map(|s| s.price_view(limit)).into()
    }

    pub fn overview(&self) -> Availability<Overview> {
        self.state.snapshot().map(|s| s.overview()).into()
    }

    pub fn status(&self) -> PipelineStatus {
        let snapshot = self.state.snapshot();
        PipelineStatus {
            model_loaded: self.state.model().is_some_and(|m| m.is_ready()),
            data_available: snapshot.as_ref().is_some_and(|s| !s.features.is_empty()),
            signals_available: snapshot.as_ref().is_some_and(|s| !s.signals.is_empty()),
            performance_available: snapshot.is_some(),
            task_running: self.state.is_running(),
            state: self.state.run_state(),
            last_error: self.state.last_error().map(|e| e.to_string()),
            last_completed_at: snapshot.map(|s| s.completed_at),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::StaticSource;
    use crate::{PricePoint, Signal};
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::{channel, Receiver};
    use std::sync::Mutex;

    fn series(n: usize) -> Vec<PricePoint> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let price = 100.0 + 8.0 * (i as f64 * 0.45).sin() + 0.3 * i as f64;
                PricePoint::new(start + Duration::days(i as i64), price)
            })
            .collect()
    }

    fn service(n: usize) -> PipelineService {
        PipelineService::new(Pipeline::new(
            Config::default(),
            Box::new(StaticSource::new(series(n))),
        ))
    }

    /// Blocks in `fetch` until released
    struct GatedSource {
        gate: Mutex<Receiver<()>>,
        series: Vec<PricePoint>,
    }

    impl PriceSource for GatedSource {
        fn name(&self) -> String {
            "gated".to_string()
        }

        fn fetch(&self) -> PipelineResult<Vec<PricePoint>> {
            self.gate
                .lock()
                .unwrap()
                .recv()
                .map_err(|e| PipelineError::Fetch(e.to_string()))?;
            Ok(self.series.clone())
        }
    }

    /// Serves the good series on odd calls, a broken one on even calls
    struct FlakySource {
        calls: AtomicUsize,
        series: Vec<PricePoint>,
    }

    impl PriceSource for FlakySource {
        fn name(&self) -> String {
            "flaky".to_string()
        }

        fn fetch(&self) -> PipelineResult<Vec<PricePoint>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
                return Err(PipelineError::RateLimited { attempts: 6 });
            }
            Ok(self.series.clone())
        }
    }

    #[test]
    fn test_run_state_names() {
        assert_eq!(RunState::LoadingCachedModel.to_string(), "LOADING_CACHED_MODEL");
        assert_eq!(
            serde_json::to_string(&RunState::LoadingCachedModel).unwrap(),
            "\"LOADING_CACHED_MODEL\""
        );
        assert!(RunState::Failed.is_terminal());
        assert!(!RunState::Signaling.is_terminal());
    }

    #[test]
    fn test_reads_before_first_run() {
        let service = service(60);

        assert_eq!(service.signals(50), Availability::NotYetAvailable);
        assert_eq!(service.performance(), Availability::NotYetAvailable);
        assert_eq!(service.regimes(), Availability::NotYetAvailable);
        assert_eq!(service.price_data(100), Availability::NotYetAvailable);
        assert_eq!(service.overview(), Availability::NotYetAvailable);

        let status = service.status();
        assert!(!status.model_loaded);
        assert!(!status.task_running);
        assert_eq!(status.state, RunState::Idle);
    }

    #[test]
    fn test_run_publishes_snapshot() {
        let service = service(60);
        let snapshot = service.run().unwrap();

        assert_eq!(snapshot.features.len(), 60);
        assert_eq!(snapshot.signals.len(), 60);
        assert_eq!(snapshot.model_source, ModelSource::Fitted);
        assert!(snapshot.fit.is_some());

        let status = service.status();
        assert_eq!(status.state, RunState::Done);
        assert!(status.model_loaded);
        assert!(status.performance_available);
        assert!(!status.task_running);

        let signals = service.signals(5).into_option().unwrap();
        assert!(signals.signals.len() <= 5);
        assert!(signals.signals.iter().all(|s| s.signal != Signal::Hold));
        assert_eq!(signals.counts.total(), 60);

        let regimes = service.regimes().into_option().unwrap();
        assert_eq!(regimes.regimes.len(), 60);
        assert_eq!(regimes.counts.values().sum::<usize>(), 60);
        assert_eq!(regimes.labels[&1], "Bullish");

        let prices = service.price_data(10).into_option().unwrap();
        assert_eq!(prices.points.len(), 10);
        assert_eq!(prices.latest_price, Some(snapshot.features[59].price));
    }

    #[test]
    fn test_second_run_reuses_model() {
        let service = service(60);
        let first = service.run().unwrap();
        let second = service.run().unwrap();

        assert_eq!(second.model_source, ModelSource::Memory);
        assert_eq!(second.signals, first.signals);
        assert_eq!(second.report, first.report);
    }

    #[test]
    fn test_concurrent_start_is_rejected() {
        let (release, gate) = channel();
        let service = PipelineService::new(Pipeline::new(
            Config::default(),
            Box::new(GatedSource {
                gate: Mutex::new(gate),
                series: series(60),
            }),
        ));

        let ticket = service.start().unwrap();
        assert!(service.status().task_running);
        assert_eq!(service.start().unwrap_err(), PipelineError::RunInProgress);
        assert_eq!(service.run().unwrap_err(), PipelineError::RunInProgress);
        // reads are served while the run is in flight
        assert_eq!(service.performance(), Availability::NotYetAvailable);

        release.send(()).unwrap();
        let snapshot = ticket.wait().unwrap();

        assert!(!service.status().task_running);
        assert_eq!(service.performance().into_option(), Some(snapshot.report.clone()));
    }

    #[test]
    fn test_queued_run_blocks_further_starts() {
        let (service, requests) = PipelineService::unstarted(Pipeline::new(
            Config::default(),
            Box::new(StaticSource::new(series(60))),
        ));

        let _ticket = service.start().unwrap();
        assert!(service.status().task_running);
        assert_eq!(service.state().run_state(), RunState::Idle);
        assert_eq!(service.start().unwrap_err(), PipelineError::RunInProgress);

        // dropping the queued request frees the slot
        drop(requests.recv().unwrap());
        assert!(!service.status().task_running);
        assert!(service.start().is_ok());
    }

    #[test]
    fn test_start_without_worker_is_a_defect() {
        let (service, requests) = PipelineService::unstarted(Pipeline::new(
            Config::default(),
            Box::new(StaticSource::new(series(60))),
        ));
        drop(requests);

        assert!(matches!(service.start(), Err(PipelineError::Defect(_))));
        assert!(!service.status().task_running);
    }

    /// Records the name of the thread each fetch runs on
    struct ThreadRecordingSource {
        threads: Mutex<Vec<Option<String>>>,
        series: Vec<PricePoint>,
    }

    impl PriceSource for ThreadRecordingSource {
        fn name(&self) -> String {
            "thread-recording".to_string()
        }

        fn fetch(&self) -> PipelineResult<Vec<PricePoint>> {
            let name = std::thread::current().name().map(str::to_string);
            self.threads.lock().unwrap().push(name);
            Ok(self.series.clone())
        }
    }

    #[test]
    fn test_runs_execute_on_the_worker_thread() {
        let source = Arc::new(ThreadRecordingSource {
            threads: Mutex::new(Vec::new()),
            series: series(60),
        });
        let service = PipelineService::new(Pipeline::new(
            Config::default(),
            Box::new(SharedSource(Arc::clone(&source))),
        ));

        service.run().unwrap();
        service.start().unwrap().wait().unwrap();

        let threads = source.threads.lock().unwrap();
        assert_eq!(threads.len(), 2);
        assert!(threads
            .iter()
            .all(|name| name.as_deref() == Some("pipeline-worker")));
    }

    struct SharedSource(Arc<ThreadRecordingSource>);

    impl PriceSource for SharedSource {
        fn name(&self) -> String {
            self.0.name()
        }

        fn fetch(&self) -> PipelineResult<Vec<PricePoint>> {
            self.0.fetch()
        }
    }

    #[test]
    fn test_failed_run_keeps_previous_snapshot() {
        let service = PipelineService::new(Pipeline::new(
            Config::default(),
            Box::new(FlakySource {
                calls: AtomicUsize::new(0),
                series: series(60),
            }),
        ));

        let good = service.run().unwrap();
        let err = service.run().unwrap_err();
        assert_eq!(err, PipelineError::RateLimited { attempts: 6 });
        assert!(err.is_recoverable());

        let status = service.status();
        assert_eq!(status.state, RunState::Failed);
        assert!(status.last_error.unwrap().contains("rate limited"));
        assert_eq!(service.performance().into_option(), Some(good.report.clone()));
    }

    #[test]
    fn test_short_series_fails_without_snapshot() {
        let service = service(12);
        assert!(matches!(
            service.run(),
            Err(PipelineError::InsufficientData { .. })
        ));
        assert_eq!(service.status().state, RunState::Failed);
        assert_eq!(service.signals(10), Availability::NotYetAvailable);
    }

    #[test]
    fn test_overview_limits() {
        let service = service(150);
        service.run().unwrap();
        let overview = service.overview().into_option().unwrap();

        assert_eq!(overview.price_data.points.len(), OVERVIEW_PRICE_LIMIT);
        assert!(overview.signals.signals.len() <= OVERVIEW_SIGNAL_LIMIT);
        assert_eq!(
            overview.latest_signal.map(|s| s.timestamp),
            overview.price_data.points.last().map(|p| p.timestamp)
        );
    }
}
