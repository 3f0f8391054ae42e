//! Drives a [`Projection`] over the event log.

use super::{FailureContext, FailureStrategy, Projection, ProjectionState, ProjectionStore, ProjectionTx, Statement};
use crate::config::{env_millis, env_validated, ConfigError};
use crate::errors::{EventstoreError, EventstoreResult, ProjectionError, ProjectionResult};
use crate::event::Event;
use crate::log::{EventLog, Eventstore};
use crate::search::SearchQueryBuilder;
use crate::types::{InstanceId, Position};
use futures::future::join_all;
use nutype::nutype;
use std::future::Future;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

/// Maximum number of events processed per transaction.
#[nutype(
    validate(greater = 0, less_or_equal = 10_000),
    default = 200,
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, Default, Into)
)]
pub struct BulkLimit(u64);

/// Failures after which an event is skipped for good.
#[nutype(
    validate(greater = 0),
    default = 5,
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, Default, Into)
)]
pub struct MaxFailureCount(u32);

/// Configuration of a [`Handler`].
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Events per transaction (default: 200).
    pub bulk_limit: BulkLimit,
    /// Failures after which an event is skipped for good (default: 5).
    pub max_failure_count: MaxFailureCount,
    /// Interval between periodic triggers in [`Handler::run`] (default: 60 seconds).
    pub requeue_every: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            bulk_limit: BulkLimit::default(),
            max_failure_count: MaxFailureCount::default(),
            requeue_every: Duration::from_secs(60),
        }
    }
}

impl HandlerConfig {
    /// Reads `IDSTORE_PROJECTION_BULK_LIMIT`, `IDSTORE_PROJECTION_MAX_FAILURE_COUNT`
    /// and `IDSTORE_PROJECTION_REQUEUE_EVERY_MS`, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            bulk_limit: env_validated("IDSTORE_PROJECTION_BULK_LIMIT", BulkLimit::try_new)?
                .unwrap_or(defaults.bulk_limit),
            max_failure_count: env_validated(
                "IDSTORE_PROJECTION_MAX_FAILURE_COUNT",
                MaxFailureCount::try_new,
            )?
            .unwrap_or(defaults.max_failure_count),
            requeue_every: env_millis("IDSTORE_PROJECTION_REQUEUE_EVERY_MS")?
                .unwrap_or(defaults.requeue_every),
        })
    }
}

/// Summary of one [`Handler::trigger`] call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TriggerReport {
    /// Transactions committed.
    pub batches: usize,
    /// Events read, including failed ones.
    pub processed: usize,
    /// Events left recorded as failed.
    pub failed: usize,
    /// Another worker held the progress lock; nothing was done.
    pub locked: bool,
    /// Committed position after the run.
    pub position: Option<Position>,
}

enum EventOutcome {
    Applied,
    Skipped,
    Fatal(EventstoreError),
}

struct BatchOutcome {
    fetched: usize,
    failed: usize,
    position: Position,
}

/// Runs one projection: fetch, reduce, persist, repeat.
pub struct Handler<P, L, S> {
    projection: P,
    eventstore: Eventstore<L>,
    store: S,
    config: HandlerConfig,
    ready: OnceCell<()>,
}

impl<P, L, S> Handler<P, L, S>
where
    P: Projection,
    L: EventLog,
    S: ProjectionStore,
{
    /// Creates a handler; the init check runs lazily on the first trigger.
    pub fn new(projection: P, eventstore: Eventstore<L>, store: S, config: HandlerConfig) -> Self {
        Self {
            projection,
            eventstore,
            store,
            config,
            ready: OnceCell::new(),
        }
    }

    /// The driven projection.
    pub const fn projection(&self) -> &P {
        &self.projection
    }

    /// The projection store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Processes every new event of `instance`.
    ///
    /// Returns a report with `locked == true` when another worker is
    /// processing the same projection and instance.
    #[instrument(name = "handler.trigger", skip(self), fields(projection = %self.projection.name()))]
    pub async fn trigger(&self, instance: &InstanceId) -> ProjectionResult<TriggerReport> {
        self.ensure_ready().await?;
        let bulk_limit = usize::try_from(self.config.bulk_limit.into_inner()).unwrap_or(usize::MAX);
        let mut report = TriggerReport::default();
        loop {
            let tx = match self.store.begin(self.projection.name(), instance).await {
                Ok(tx) => tx,
                Err(ProjectionError::Locked { .. }) => {
                    debug!("[handler.trigger] progress locked by another worker, skipping");
                    report.locked = true;
                    return Ok(report);
                }
                Err(error) => return Err(error),
            };
            let batch = self.process_batch(tx).await?;
            report.batches += 1;
            report.processed += batch.fetched;
            report.failed += batch.failed;
            report.position = Some(batch.position);
            if batch.fetched < bulk_limit {
                break;
            }
        }
        if report.processed > 0 {
            info!(
                processed = report.processed,
                failed = report.failed,
                "[handler.trigger] projection updated"
            );
        }
        Ok(report)
    }

    /// Triggers every instance each `requeue_every` until `shutdown` resolves.
    pub async fn run<F>(&self, instances: &[InstanceId], shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.config.requeue_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown = std::pin::pin!(shutdown);
        info!(projection = %self.projection.name(), instances = instances.len(), "[handler.run] started");
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!(projection = %self.projection.name(), "[handler.run] shutdown requested");
                    return;
                }
                _ = ticker.tick() => {
                    let results = join_all(instances.iter().map(|instance| self.trigger(instance))).await;
                    for (instance, result) in instances.iter().zip(results) {
                        if let Err(error) = result {
                            error!(%instance, %error, "[handler.run] trigger failed");
                        }
                    }
                }
            }
        }
    }

    /// Number of positions the projection trails the log by within `instance`.
    pub async fn lag(&self, instance: &InstanceId) -> ProjectionResult<u64> {
        let state = self
            .store
            .state(self.projection.name(), instance)
            .await?
            .unwrap_or_else(|| {
                ProjectionState::initial(self.projection.name().clone(), instance.clone())
            });
        let mut query = SearchQueryBuilder::new().instance_id(instance.clone());
        for subquery in self.projection.mapper().search_queries() {
            query = query.add_query(subquery);
        }
        let latest = self.eventstore.latest_position(&query).await?;
        Ok(latest
            .into_inner()
            .saturating_sub(state.position.into_inner()))
    }

    async fn ensure_ready(&self) -> ProjectionResult<()> {
        self.ready
            .get_or_try_init(|| async {
                let steps = self.projection.init_check();
                if steps.is_empty() {
                    return Ok(());
                }
                self.store
                    .init(self.projection.name(), &steps)
                    .await
                    .map_err(|source| {
                        error!(projection = %self.projection.name(), error = %source, "[handler.init] init check failed");
                        ProjectionError::NotReady {
                            projection: self.projection.name().clone(),
                            source,
                        }
                    })
            })
            .await
            .map(|_| ())
    }

    fn batch_query(&self, state: &ProjectionState) -> SearchQueryBuilder {
        let mut query = SearchQueryBuilder::new()
            .instance_id(state.instance_id.clone())
            .position_at_least(state.position)
            .offset(state.filter_offset)
            .limit(self.config.bulk_limit.into_inner())
            .order_asc()
            .await_open_transactions();
        for subquery in self.projection.mapper().search_queries() {
            query = query.add_query(subquery);
        }
        query
    }

    async fn process_batch(&self, mut tx: S::Tx) -> ProjectionResult<BatchOutcome> {
        let state = tx.state().clone();
        let events = self.eventstore.filter(&self.batch_query(&state)).await?;
        debug!(
            fetched = events.len(),
            position = %state.position,
            offset = state.filter_offset,
            "[handler.batch] events fetched"
        );

        let mut failed = 0;
        for (index, event) in events.iter().enumerate() {
            match self.process_event(&mut tx, event).await? {
                EventOutcome::Applied => {}
                EventOutcome::Skipped => failed += 1,
                EventOutcome::Fatal(source) => {
                    tx.commit(state.advance(&events[..index])).await?;
                    return Err(ProjectionError::Fatal {
                        projection: self.projection.name().clone(),
                        event_id: event.id,
                        source,
                    });
                }
            }
        }

        let next = state.advance(&events);
        let position = next.position;
        tx.commit(next).await?;
        Ok(BatchOutcome {
            fetched: events.len(),
            failed,
            position,
        })
    }

    async fn process_event(&self, tx: &mut S::Tx, event: &Event) -> ProjectionResult<EventOutcome> {
        let max_failures = self.config.max_failure_count.into_inner();
        if tx.failure_count(event).await? >= max_failures {
            warn!(event_id = %event.id, "[handler.event] failure limit reached, skipping");
            return Ok(EventOutcome::Skipped);
        }
        loop {
            let Err(error) = self.reduce_and_apply(tx, event).await else {
                return Ok(EventOutcome::Applied);
            };
            let retry_count = tx.record_failure(event, &error).await?;
            let ctx = FailureContext {
                error: &error,
                event,
                position: event.position,
                retry_count,
            };
            match self.projection.on_error(&ctx) {
                FailureStrategy::Fatal => {
                    error!(event_id = %event.id, %error, "[handler.event] fatal failure");
                    return Ok(EventOutcome::Fatal(error));
                }
                FailureStrategy::Retry if retry_count < max_failures => {
                    debug!(event_id = %event.id, %error, retry_count, "[handler.event] retrying");
                }
                FailureStrategy::Retry | FailureStrategy::Skip => {
                    warn!(event_id = %event.id, %error, retry_count, "[handler.event] event failed, skipping");
                    return Ok(EventOutcome::Skipped);
                }
            }
        }
    }

    async fn reduce_and_apply(&self, tx: &mut S::Tx, event: &Event) -> EventstoreResult<()> {
        let statement = match self.projection.mapper().decode(event) {
            None => Statement::noop(event),
            Some(decoded) => self.projection.reduce(decoded?, event).await?,
        };
        tx.apply(&statement).await
    }
}
