//! Definition of a teleflow worker.

use std::sync::Arc;
use std::time::Duration;

use timely::communication::Allocate;
use timely::dataflow::Scope;
use timely::worker::Worker as TimelyWorker;
use tracing::instrument;

use crate::dataflow::WorkerCount;
use crate::dataflow::WorkerIndex;
use crate::deadletter::DeadLetterWriter;
use crate::deadletter::InMemDeadLetters;
use crate::deadletter::SqliteDeadLetterStore;
use crate::errors::FlowException;
use crate::errors::TrackedError;
use crate::options::PipelineOptions;

/// A pipeline template.
///
/// `build` is called once on every worker, each with its own scope.
/// Every worker must build the same operators in the same order.
pub trait Pipeline: Send + Sync + 'static {
    fn build<S>(&self, scope: &mut S, ctx: &WorkerContext) -> Result<(), TrackedError>
    where
        S: Scope<Timestamp = u64>;
}

/// What a worker knows about itself while building a pipeline.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub index: WorkerIndex,
    pub count: WorkerCount,
    pub options: Arc<PipelineOptions>,
}

impl WorkerContext {
    /// Open this worker's dead letter store in the configured
    /// directory, or keep dead letters in memory if there is none.
    pub fn dead_letter_writer(&self) -> Result<Box<dyn DeadLetterWriter>, TrackedError> {
        match &self.options.dead_letter_dir {
            Some(dir) => {
                let store = SqliteDeadLetterStore::open(dir, self.index)
                    .reraise("error opening dead letter store")?;
                Ok(Box::new(store))
            }
            None => {
                tracing::warn!("No dead letter directory set; dead letters are kept in memory");
                Ok(Box::new(InMemDeadLetters::new()))
            }
        }
    }
}

/// teleflow worker.
///
/// Wraps a [`TimelyWorker`].
struct Worker<'a, A, F>
where
    A: Allocate,
    F: Fn() -> bool,
{
    worker: &'a mut TimelyWorker<A>,
    /// This is a function that should return `true` only when the
    /// dataflow should perform an abrupt shutdown.
    interrupt_callback: F,
}

impl<'a, A, F> Worker<'a, A, F>
where
    A: Allocate,
    F: Fn() -> bool,
{
    fn new(worker: &'a mut TimelyWorker<A>, interrupt_callback: F) -> Self {
        Self {
            worker,
            interrupt_callback,
        }
    }

    /// Run all installed dataflows until they are complete.
    fn run(&mut self) {
        tracing::info!("Timely dataflow start");
        let cooldown = Duration::from_millis(1);
        let mut running = true;
        while running && !(self.interrupt_callback)() {
            running = tracing::debug_span!("step")
                .in_scope(|| self.worker.step_or_park(Some(cooldown)));
        }
        tracing::info!("Timely dataflow stop");
    }

    /// Terminate all dataflows in this worker.
    ///
    /// We need this because otherwise all of Timely's entry points
    /// (e.g. [`timely::execute::execute_from`]) wait until all work
    /// is complete and we will hang if we are shutting down due to
    /// error.
    fn shutdown(&mut self) {
        for dataflow_id in self.worker.installed_dataflows() {
            self.worker.drop_dataflow(dataflow_id);
        }
    }
}

/// Public, main entry point for a worker thread.
#[instrument(name = "worker_main", skip_all, fields(worker = worker.index()))]
pub(crate) fn worker_main<A, P>(
    worker: &mut TimelyWorker<A>,
    interrupt_callback: impl Fn() -> bool,
    pipeline: &P,
    options: Arc<PipelineOptions>,
) -> Result<(), TrackedError>
where
    A: Allocate,
    P: Pipeline,
{
    let ctx = WorkerContext {
        index: WorkerIndex(worker.index()),
        count: WorkerCount(worker.peers()),
        options,
    };
    let mut worker = Worker::new(worker, interrupt_callback);
    tracing::info!("Worker start");

    // Remember! Never build different numbers of Timely operators on
    // different workers! Timely does not like that and you'll see a
    // mysterious `failed to correctly cast channel` panic. You must
    // build asymmetry within each operator.
    worker
        .worker
        .dataflow::<u64, _, _>(|scope| pipeline.build(scope, &ctx))
        .reraise("error building pipeline dataflow")?;

    tracing::info_span!("pipeline_dataflow").in_scope(|| {
        worker.run();
    });

    worker.shutdown();
    tracing::info!("Worker stop");
    Ok(())
}
