//! Transaction scheduler
//!
//! All transactions (NB changes, SB notifications, retries) enter one
//! bounded queue. A single consumer task processes them one at a time
//! inside the scheduler's critical section, so descriptors never see
//! concurrent calls.

use crate::api::{
    BaseValueStatus, DumpView, KeySelector, KvWithMetadata, Metadata, Value, ValueOrigin,
    ValueState, ValueStatus,
};
use crate::config::{RetryOpt, SchedulerConfig};
use crate::descriptor::KvDescriptor;
use crate::error::{KeyWithError, SchedulerError, TransactionError};
use crate::executor::{self, ExecContext};
use crate::graph::Graph;
use crate::metadata::MetadataMap;
use crate::planner::{self, Forced};
use crate::refresh;
use crate::registry::DescriptorRegistry;
use crate::txn::{
    QueuedTxn, RecordedKv, RecordedTxn, RecordedTxnOp, ResyncType, Txn, TxnKind, TxnOptions,
    TxnType,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, debug_span, info, info_span, warn, Instrument, Span};

/// Key-value scheduler reconciling the desired state with southbound
pub struct KvScheduler {
    inner: Arc<Inner>,
}

struct Inner {
    config: SchedulerConfig,
    registry: RwLock<DescriptorRegistry>,
    state: Mutex<State>,
    history: Mutex<VecDeque<RecordedTxn>>,
    watchers: Mutex<Vec<StatusWatcher>>,
    queue: mpsc::Sender<QueuedTxn>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    started: DateTime<Utc>,
    span: Span,
}

#[derive(Default)]
struct State {
    graph: Graph,
    /// Desired base values requested by northbound
    desired: BTreeMap<String, Value>,
    next_seq: u64,
    resync_count: u64,
}

struct StatusWatcher {
    selector: KeySelector,
    sender: mpsc::Sender<BaseValueStatus>,
}

/// Status of every known value with the base value it belongs to
type StatusSnapshot = HashMap<String, (ValueStatus, String)>;

/// Transaction being processed
struct TxnRun {
    seq: u64,
    txn_type: TxnType,
    resync: Option<ResyncType>,
    description: String,
    start: DateTime<Utc>,
    values: Vec<RecordedKv>,
    planned: Vec<RecordedTxnOp>,
    executed: Vec<RecordedTxnOp>,
    errors: Vec<KeyWithError>,
    dump_errors: Vec<SchedulerError>,
    cancelled: bool,
}

impl TxnRun {
    fn new(seq: u64, txn_type: TxnType) -> Self {
        Self {
            seq,
            txn_type,
            resync: None,
            description: String::new(),
            start: Utc::now(),
            values: Vec::new(),
            planned: Vec::new(),
            executed: Vec::new(),
            errors: Vec::new(),
            dump_errors: Vec::new(),
            cancelled: false,
        }
    }

    fn result(&self) -> Result<u64, TransactionError> {
        if self.errors.is_empty() && self.dump_errors.is_empty() && !self.cancelled {
            return Ok(self.seq);
        }
        Err(TransactionError {
            seq_num: Some(self.seq),
            txn_init_error: self.cancelled.then_some(SchedulerError::Cancelled),
            kv_errors: self.errors.clone(),
            dump_errors: self.dump_errors.clone(),
        })
    }
}

/// Outcome of one plan-and-execute pass
struct PassOutcome {
    failed: bool,
    retries: Vec<(String, u32)>,
    wanted: HashSet<String>,
}

impl KvScheduler {
    /// Create scheduler and start its transaction processing.
    ///
    /// # Panics
    /// Panics if called outside of a Tokio runtime
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        let span = info_span!(parent: Span::current(), "kv_scheduler");
        let (queue, rx) = mpsc::channel(config.transaction_queue_capacity.max(1));
        let inner = Arc::new(Inner {
            registry: RwLock::new(DescriptorRegistry::new()),
            state: Mutex::new(State::default()),
            history: Mutex::new(VecDeque::new()),
            watchers: Mutex::new(Vec::new()),
            queue,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started: Utc::now(),
            span: span.clone(),
            config,
        });

        inner
            .tracker
            .spawn(Arc::clone(&inner).consume(rx).instrument(span.clone()));
        if inner.config.record_transaction_history {
            inner
                .tracker
                .spawn(Arc::clone(&inner).trim_history().instrument(span.clone()));
        }
        info!(parent: &span, queue_capacity = inner.config.transaction_queue_capacity, "Scheduler started");
        Self { inner }
    }

    /// Scheduler configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Register descriptor.
    ///
    /// # Errors
    /// Returns error if the name is taken, the dump dependencies form a
    /// cycle or the scheduler is closed
    pub fn register_descriptor(&self, descriptor: Arc<dyn KvDescriptor>) -> Result<(), SchedulerError> {
        if self.is_closed() {
            return Err(SchedulerError::Closed);
        }
        self.inner.registry.write().register(descriptor)
    }

    /// Northbound key prefixes of the registered descriptors
    #[must_use]
    pub fn registered_nb_key_prefixes(&self) -> Vec<String> {
        self.inner.registry.read().nb_key_prefixes()
    }

    /// Start building an NB transaction
    pub fn start_nb_transaction(&self) -> Txn {
        Txn::new(self.inner.queue.clone(), self.inner.cancel.clone())
    }

    /// Notify about a change done in southbound outside of the scheduler.
    ///
    /// `None` reports the value as removed.
    ///
    /// # Errors
    /// Returns error if the transaction queue is full or the scheduler is
    /// closed
    pub fn push_sb_notification(
        &self,
        key: impl Into<String>,
        value: Option<Value>,
        metadata: Option<Metadata>,
    ) -> Result<(), SchedulerError> {
        if self.is_closed() {
            return Err(SchedulerError::Closed);
        }
        let txn = QueuedTxn::new(
            TxnKind::Sb {
                key: key.into(),
                value,
                metadata,
            },
            None,
        );
        self.inner.queue.try_send(txn).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SchedulerError::TxnQueueFull,
            mpsc::error::TrySendError::Closed(_) => SchedulerError::Closed,
        })
    }

    /// Wait until every transaction queued so far is processed.
    ///
    /// # Errors
    /// Returns [`SchedulerError::Closed`] if the scheduler closes first
    pub async fn transaction_barrier(&self) -> Result<(), SchedulerError> {
        let (reply, done) = oneshot::channel();
        let txn = QueuedTxn::new(TxnKind::Barrier, Some(reply));
        tokio::select! {
            () = self.inner.cancel.cancelled() => return Err(SchedulerError::Closed),
            sent = self.inner.queue.send(txn) => sent.map_err(|_| SchedulerError::Closed)?,
        }
        match done.await {
            Ok(_) => Ok(()),
            Err(_) => Err(SchedulerError::Closed),
        }
    }

    /// Metadata map of the descriptor, if it keeps metadata
    #[must_use]
    pub fn metadata_map(&self, descriptor: &str) -> Option<Arc<dyn MetadataMap>> {
        self.inner.registry.read().metadata_map(descriptor)
    }

    /// Status of a base value and its derived values
    #[must_use]
    pub fn value_status(&self, key: &str) -> BaseValueStatus {
        let state = self.inner.state.lock();
        base_status(&state.graph, key, None)
    }

    /// Watch status changes of base values accepted by `selector`.
    ///
    /// Updates are dropped with a warning while the receiver lags behind by
    /// `capacity` updates.
    pub fn watch_value_status(&self, selector: KeySelector, capacity: usize) -> mpsc::Receiver<BaseValueStatus> {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        self.inner
            .watchers
            .lock()
            .push(StatusWatcher { selector, sender });
        receiver
    }

    /// Recorded transactions started within the given bounds
    #[must_use]
    pub fn transaction_history(
        &self,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Vec<RecordedTxn> {
        self.inner
            .history
            .lock()
            .iter()
            .filter(|txn| since.map_or(true, |since| txn.start >= since))
            .filter(|txn| until.map_or(true, |until| txn.start <= until))
            .cloned()
            .collect()
    }

    /// Recorded transaction with the given sequence number
    #[must_use]
    pub fn recorded_transaction(&self, seq_num: u64) -> Option<RecordedTxn> {
        self.inner
            .history
            .lock()
            .iter()
            .find(|txn| txn.seq_num == seq_num)
            .cloned()
    }

    /// Values of a descriptor as seen from the given view.
    ///
    /// # Errors
    /// Returns error if the descriptor is unknown, or for
    /// [`DumpView::Southbound`] if it cannot be dumped
    pub fn dump_values_by_descriptor(
        &self,
        descriptor: &str,
        view: DumpView,
    ) -> Result<Vec<KvWithMetadata>, SchedulerError> {
        let registry = self.inner.registry.read();
        let desc = registry
            .get(descriptor)
            .ok_or_else(|| SchedulerError::UnknownDescriptor(descriptor.to_owned()))?;
        let state = self.inner.state.lock();
        match view {
            DumpView::Southbound => {
                if !desc.is_dumpable() {
                    return Err(SchedulerError::NotDumpable(descriptor.to_owned()));
                }
                let correlate = refresh::correlate(desc.as_ref(), &state.graph, None);
                desc.dump(&correlate)
                    .map_err(|err| SchedulerError::DumpFailed {
                        descriptor: descriptor.to_owned(),
                        error: Arc::new(err),
                    })
            }
            DumpView::Northbound => Ok(state
                .desired
                .iter()
                .filter(|(key, _)| desc.key_selector(key))
                .map(|(key, value)| KvWithMetadata {
                    key: key.clone(),
                    value: Arc::clone(value),
                    metadata: state.graph.get(key).and_then(|node| node.metadata.clone()),
                    origin: ValueOrigin::FromNb,
                })
                .collect()),
            DumpView::Cached => Ok(refresh::correlate(desc.as_ref(), &state.graph, None)),
        }
    }

    /// True once [`KvScheduler::close`] was called
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Stop processing and wait for the consumer and pending retries.
    ///
    /// A transaction being executed stops before its next operation.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!(parent: &self.inner.span, "Scheduler closed");
    }
}

impl Drop for KvScheduler {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl fmt::Debug for KvScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvScheduler")
            .field("config", &self.inner.config)
            .field("descriptors", &self.inner.registry.read().len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Inner {
    async fn consume(self: Arc<Self>, mut rx: mpsc::Receiver<QueuedTxn>) {
        loop {
            let txn = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                txn = rx.recv() => match txn {
                    Some(txn) => txn,
                    None => break,
                },
            };
            self.process(txn);
        }
        rx.close();
        while let Ok(txn) = rx.try_recv() {
            txn.respond(Err(SchedulerError::Closed.into()));
        }
        debug!("Transaction queue closed");
    }

    fn process(&self, txn: QueuedTxn) {
        let QueuedTxn { kind, reply } = txn;
        let result = match kind {
            TxnKind::Nb { values, opts } => self.process_nb(values, &opts),
            TxnKind::Sb {
                key,
                value,
                metadata,
            } => self.process_sb(key, value, metadata),
            TxnKind::Retry {
                keys,
                origin_seq,
                retry,
            } => self.process_retry(keys, origin_seq, retry),
            TxnKind::Barrier => Ok(self.state.lock().next_seq),
        };
        if let Some(reply) = reply {
            // Committer may have stopped waiting
            let _ = reply.send(result);
        }
    }

    fn process_nb(
        &self,
        values: Vec<(String, Option<Value>)>,
        opts: &TxnOptions,
    ) -> Result<u64, TransactionError> {
        let registry = self.registry.read();
        let mut state = self.state.lock();
        let seq = next_seq(&mut state);
        let span = debug_span!("txn", seq, txn_type = %TxnType::NbTransaction);
        let _enter = span.enter();
        let before = self.status_snapshot(&state.graph);

        let mut run = TxnRun::new(seq, TxnType::NbTransaction);
        run.resync = opts.resync;
        run.description.clone_from(&opts.description);
        run.values = values
            .iter()
            .map(|(key, value)| RecordedKv {
                key: key.clone(),
                value: value.as_ref().map(|v| format!("{v:?}")),
            })
            .collect();

        let snapshot = opts.revert_on_failure.then(|| state.desired.clone());
        let txn_keys: HashSet<String> = values.iter().map(|(key, _)| key.clone()).collect();
        let forced = match opts.resync {
            Some(resync) => {
                run.dump_errors = self.resync(&registry, &mut state, resync, &values);
                Forced::All
            }
            None => {
                for (key, value) in values {
                    match value {
                        Some(value) => state.desired.insert(key, value),
                        None => state.desired.remove(&key),
                    };
                }
                Forced::Keys(txn_keys.clone())
            }
        };
        mark_updated(&mut state.graph, &txn_keys, seq);

        let retry = opts.effective_retry(self.config.enable_txn_retry, self.config.retry);
        let mut cancel = vec![self.cancel.clone()];
        cancel.extend(opts.cancel.clone());
        let ctx = ExecContext {
            retry,
            stop_on_failure: opts.revert_on_failure,
            is_retry: false,
            is_revert: false,
            cancel,
        };
        // Values of descriptors which failed to dump are unknown, not absent
        let unknown: HashSet<String> = run
            .dump_errors
            .iter()
            .filter_map(|err| match err {
                SchedulerError::DumpFailed { descriptor, .. } => Some(descriptor.clone()),
                _ => None,
            })
            .collect();
        let mut outcome = self.run_pass(&registry, &mut state, &forced, &unknown, &ctx, &mut run);

        match snapshot {
            Some(snapshot) if outcome.failed && !run.cancelled => {
                warn!("Operation failed, reverting transaction");
                state.desired = snapshot;
                let revert = ExecContext {
                    retry: None,
                    stop_on_failure: false,
                    is_retry: false,
                    is_revert: true,
                    cancel: ctx.cancel.clone(),
                };
                let forced = match opts.resync {
                    Some(_) => Forced::All,
                    None => Forced::Keys(txn_keys),
                };
                outcome = self.run_pass(&registry, &mut state, &forced, &unknown, &revert, &mut run);
            }
            _ => {
                if let Some(retry) = retry {
                    self.schedule_retries(&outcome.retries, seq, retry);
                }
            }
        }
        self.finish(&mut state, before, &outcome, run)
    }

    fn resync(
        &self,
        registry: &DescriptorRegistry,
        state: &mut State,
        resync: ResyncType,
        values: &[(String, Option<Value>)],
    ) -> Vec<SchedulerError> {
        let first = state.resync_count == 0;
        info!(resync = ?resync, first, "Resync");
        let requested = || -> BTreeMap<String, Value> {
            values
                .iter()
                .filter_map(|(key, value)| value.as_ref().map(|v| (key.clone(), Arc::clone(v))))
                .collect()
        };
        let dump_errors = match resync {
            ResyncType::Full => {
                let desired = requested();
                let dump_errors = refresh::refresh(registry, &mut state.graph, first.then_some(&desired));
                state.desired = desired;
                dump_errors
            }
            ResyncType::Upstream => {
                state.desired = requested();
                Vec::new()
            }
            ResyncType::Downstream => {
                let desired = state.desired.clone();
                refresh::refresh(registry, &mut state.graph, first.then_some(&desired))
            }
        };
        state.resync_count += 1;
        for node in state.graph.nodes_mut() {
            node.attempts = 0;
        }
        dump_errors
    }

    fn process_sb(
        &self,
        key: String,
        value: Option<Value>,
        metadata: Option<Metadata>,
    ) -> Result<u64, TransactionError> {
        let registry = self.registry.read();
        let mut state = self.state.lock();
        let seq = next_seq(&mut state);
        let span = debug_span!("txn", seq, txn_type = %TxnType::SbNotification);
        let _enter = span.enter();
        let before = self.status_snapshot(&state.graph);

        let mut run = TxnRun::new(seq, TxnType::SbNotification);
        run.values.push(RecordedKv {
            key: key.clone(),
            value: value.as_ref().map(|v| format!("{v:?}")),
        });

        let descriptor = registry.for_key(&key);
        if let Some(desc) = &descriptor {
            refresh::sync_metadata(&registry, desc.as_ref(), &key, metadata.as_ref());
        }
        match value {
            Some(value) => {
                let nb_owned = state.desired.contains_key(&key)
                    && state
                        .graph
                        .get(&key)
                        .is_some_and(|node| node.origin == ValueOrigin::FromNb);
                let origin = if nb_owned {
                    ValueOrigin::FromNb
                } else {
                    ValueOrigin::FromSb
                };
                debug!(key = %key, origin = ?origin, "Value changed in southbound");
                refresh::store_value(
                    &registry,
                    &mut state.graph,
                    &key,
                    value,
                    metadata,
                    descriptor.as_ref(),
                    origin,
                );
            }
            None => {
                debug!(key = %key, "Value removed in southbound");
                refresh::drop_value(&mut state.graph, &key);
            }
        }

        let ctx = ExecContext {
            retry: self.config.enable_txn_retry.then_some(self.config.retry),
            cancel: vec![self.cancel.clone()],
            ..ExecContext::default()
        };
        let outcome = self.run_pass(&registry, &mut state, &Forced::none(), &HashSet::new(), &ctx, &mut run);
        if let Some(retry) = ctx.retry {
            self.schedule_retries(&outcome.retries, seq, retry);
        }
        self.finish(&mut state, before, &outcome, run)
    }

    fn process_retry(
        &self,
        keys: Vec<String>,
        origin_seq: u64,
        retry: RetryOpt,
    ) -> Result<u64, TransactionError> {
        let registry = self.registry.read();
        let mut state = self.state.lock();
        let keys: HashSet<String> = keys
            .into_iter()
            .filter(|key| {
                state.graph.get(key).is_some_and(|node| {
                    node.state == ValueState::Retrying && node.last_update <= origin_seq
                })
            })
            .collect();
        if keys.is_empty() {
            debug!(origin_seq, "Nothing left to retry");
            return Ok(origin_seq);
        }

        let seq = next_seq(&mut state);
        let span = debug_span!("txn", seq, txn_type = %TxnType::RetryFailedOps);
        let _enter = span.enter();
        let before = self.status_snapshot(&state.graph);

        let mut run = TxnRun::new(seq, TxnType::RetryFailedOps);
        run.description = format!("retry of #{origin_seq}");
        let mut sorted: Vec<&String> = keys.iter().collect();
        sorted.sort();
        run.values = sorted
            .into_iter()
            .map(|key| RecordedKv {
                key: key.clone(),
                value: state
                    .desired
                    .get(key)
                    .map(|v| format!("{v:?}")),
            })
            .collect();

        let ctx = ExecContext {
            retry: Some(retry),
            is_retry: true,
            cancel: vec![self.cancel.clone()],
            ..ExecContext::default()
        };
        let outcome = self.run_pass(
            &registry,
            &mut state,
            &Forced::Keys(keys),
            &HashSet::new(),
            &ctx,
            &mut run,
        );
        self.schedule_retries(&outcome.retries, seq, retry);
        self.finish(&mut state, before, &outcome, run)
    }

    fn run_pass(
        &self,
        registry: &DescriptorRegistry,
        state: &mut State,
        forced: &Forced,
        unknown: &HashSet<String>,
        ctx: &ExecContext,
        run: &mut TxnRun,
    ) -> PassOutcome {
        let State { graph, desired, .. } = state;
        let plan = planner::plan(registry, graph, desired, forced, unknown, ctx.is_retry);
        for op in &plan.ops {
            run.planned.push(executor::planned_record(ctx, graph, op));
        }
        run.executed.extend(plan.records);
        run.errors.extend(plan.errors);
        let invalid = !run.errors.is_empty();

        let execution = executor::execute(ctx, registry, graph, plan.ops);
        run.executed.extend(execution.executed);
        run.errors.extend(execution.errors);
        run.cancelled |= execution.cancelled;
        PassOutcome {
            failed: execution.failed || invalid,
            retries: execution.retries,
            wanted: plan.wanted,
        }
    }

    fn schedule_retries(&self, retries: &[(String, u32)], origin_seq: u64, retry: RetryOpt) {
        let mut by_delay: BTreeMap<Duration, Vec<String>> = BTreeMap::new();
        for (key, attempts) in retries {
            by_delay
                .entry(retry.delay(*attempts))
                .or_default()
                .push(key.clone());
        }
        for (delay, keys) in by_delay {
            debug!(keys = ?keys, delay = ?delay, "Scheduling retry");
            let queue = self.queue.clone();
            let cancel = self.cancel.clone();
            self.tracker.spawn(
                async move {
                    tokio::select! {
                        () = cancel.cancelled() => {}
                        () = tokio::time::sleep(delay) => {
                            let txn = QueuedTxn::new(TxnKind::Retry { keys, origin_seq, retry }, None);
                            tokio::select! {
                                () = cancel.cancelled() => {}
                                sent = queue.send(txn) => {
                                    if sent.is_err() {
                                        debug!("Queue closed, dropping retry");
                                    }
                                }
                            }
                        }
                    }
                }
                .instrument(self.span.clone()),
            );
        }
    }

    fn finish(
        &self,
        state: &mut State,
        before: Option<StatusSnapshot>,
        outcome: &PassOutcome,
        run: TxnRun,
    ) -> Result<u64, TransactionError> {
        let desired = &state.desired;
        let dropped = state
            .graph
            .collect_garbage(|key| desired.contains_key(key) || outcome.wanted.contains(key));
        if !dropped.is_empty() {
            debug!(keys = ?dropped, "Forgot removed values");
        }
        if let Some(before) = before {
            self.publish(&state.graph, before);
        }

        let result = run.result();
        info!(
            executed = run.executed.len(),
            errors = run.errors.len(),
            dump_errors = run.dump_errors.len(),
            cancelled = run.cancelled,
            "Transaction processed"
        );
        if self.config.record_transaction_history {
            self.history.lock().push_back(RecordedTxn {
                seq_num: run.seq,
                txn_type: run.txn_type,
                resync_type: run.resync,
                description: run.description,
                start: run.start,
                stop: Utc::now(),
                values: run.values,
                planned: run.planned,
                executed: run.executed,
                dump_errors: run.dump_errors.iter().map(ToString::to_string).collect(),
            });
        }
        result
    }

    fn status_snapshot(&self, graph: &Graph) -> Option<StatusSnapshot> {
        if self.watchers.lock().is_empty() {
            return None;
        }
        Some(
            graph
                .nodes()
                .map(|node| (node.key.clone(), (node.status(), graph.base_of(&node.key))))
                .collect(),
        )
    }

    /// Send status of every base value whose own or derived status changed
    fn publish(&self, graph: &Graph, before: StatusSnapshot) {
        let mut changed = BTreeSet::new();
        for node in graph.nodes() {
            let status = node.status();
            if before.get(&node.key).map(|(prev, _)| prev) != Some(&status) {
                changed.insert(graph.base_of(&node.key));
            }
        }
        let mut removed = HashMap::new();
        for (key, (status, base)) in before {
            if graph.get(&key).is_some() {
                continue;
            }
            if key == base {
                removed.insert(
                    key,
                    ValueStatus {
                        state: ValueState::Removed,
                        ..status
                    },
                );
            }
            changed.insert(base);
        }

        let mut watchers = self.watchers.lock();
        for base in changed {
            let status = base_status(graph, &base, removed.remove(&base));
            watchers.retain(|watcher| {
                if !(watcher.selector)(&base) {
                    return true;
                }
                match watcher.sender.try_send(status.clone()) {
                    Ok(()) => true,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(key = %base, "Status watcher lags behind, dropping update");
                        true
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                }
            });
        }
    }

    async fn trim_history(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.history_trim_period());
        interval.tick().await;
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = interval.tick() => self.trim_history_now(Utc::now()),
            }
        }
    }

    fn trim_history_now(&self, now: DateTime<Utc>) {
        let (Ok(age_limit), Ok(init_period)) = (
            chrono::Duration::from_std(self.config.history_age_limit()),
            chrono::Duration::from_std(self.config.permanent_init_period()),
        ) else {
            return;
        };
        let permanent_until = self.started.checked_add_signed(init_period);
        let cutoff = now.checked_sub_signed(age_limit);
        let mut history = self.history.lock();
        let before = history.len();
        history.retain(|txn| {
            permanent_until.is_some_and(|until| txn.start < until)
                || cutoff.map_or(true, |cutoff| txn.start >= cutoff)
        });
        if history.len() < before {
            debug!(trimmed = before - history.len(), "Trimmed transaction history");
        }
    }
}

fn next_seq(state: &mut State) -> u64 {
    let seq = state.next_seq;
    state.next_seq += 1;
    seq
}

/// Record the transaction as the last change of its keys and give their
/// values a fresh retry budget
fn mark_updated(graph: &mut Graph, keys: &HashSet<String>, seq: u64) {
    for key in keys {
        let mut affected = graph.descendants(key);
        affected.push(key.clone());
        for key in affected {
            if let Some(node) = graph.get_mut(&key) {
                node.last_update = seq;
                node.clear_failure();
            }
        }
    }
}

fn base_status(graph: &Graph, key: &str, removed: Option<ValueStatus>) -> BaseValueStatus {
    let value = graph
        .get(key)
        .map(crate::graph::Node::status)
        .or(removed)
        .unwrap_or_else(|| ValueStatus::non_existent(key));
    let derived = graph
        .descendants(key)
        .iter()
        .filter_map(|derived| graph.get(derived).map(crate::graph::Node::status))
        .collect();
    BaseValueStatus { value, derived }
}
