//! Internal code for pipeline execution.
//!
//! [`crate::worker::worker_main`] is the root of all the action on
//! each worker thread. The functions here only decide how many
//! workers there are and where they live.
//!
//! - [`run_main`] runs a single worker on the current thread.
//!
//! - [`cluster_main`] runs this process's workers as part of a
//!   cluster described by [`PipelineOptions::addresses`].
//!
//! - [`cli_main`] is what a pipeline binary calls. It sets up logging
//!   and either runs in place or spawns one copy of the current
//!   executable per process.

use std::any::Any;
use std::process::Child;
use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::runtime::Runtime;

use crate::errors::prepend_tname;
use crate::errors::tracked_err;
use crate::errors::FlowException;
use crate::errors::TrackedError;
use crate::metrics::initialize_metrics;
use crate::options::PipelineOptions;
use crate::tracing::FlowTracer;
use crate::tracing::TracingConfig;
use crate::unwrap_any;
use crate::webserver::run_webserver;
use crate::worker::worker_main;
use crate::worker::Pipeline;

/// First port used when `cli_main` picks addresses for local
/// processes.
const BASE_PORT: u64 = 2101;

/// Start the tokio runtime for the metrics webserver.
///
/// Returns `None` if no metrics port is configured. Keep a reference
/// to the runtime for as long as you need it running.
fn start_server_runtime(
    options: &PipelineOptions,
    port: Option<u16>,
) -> Result<Option<Runtime>, TrackedError> {
    let Some(port) = port else {
        return Ok(None);
    };

    // Options can't change at runtime, so encode them once here
    // rather than in each request.
    let options_json =
        serde_json::to_string(options).reraise("error encoding pipeline options")?;

    initialize_metrics(&options.job_name).reraise("error initializing metrics")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("webserver-threads")
        .enable_all()
        .build()
        .reraise("error initializing tokio runtime for webserver")?;
    rt.spawn(async move {
        if let Err(err) = run_webserver(port, options_json).await {
            tracing::error!("{}", err.stacktrace());
        }
    });
    Ok(Some(rt))
}

/// Turn whatever a worker panicked with back into an error.
fn panic_to_error(panic_err: Box<dyn Any + Send>) -> TrackedError {
    match panic_err.downcast::<TrackedError>() {
        // Panics with a TrackedError payload come from `unwrap_any!`.
        Ok(err) => *err,
        Err(panic_err) => {
            if let Some(msg) = panic_err.downcast_ref::<String>() {
                // Panics with String payload usually comes from timely.
                tracked_err(msg)
            } else if let Some(msg) = panic_err.downcast_ref::<&str>() {
                // Direct calls to `panic!` with a literal.
                tracked_err(msg)
            } else {
                tracked_err("unknown error")
            }
        }
    }
}

/// Execute a pipeline with a single worker in the current thread.
///
/// Blocks until execution is complete. Errors raised while building
/// or running the pipeline are returned, panics included.
pub fn run_main<P>(pipeline: P, options: PipelineOptions) -> Result<(), TrackedError>
where
    P: Pipeline,
{
    options.validate().reraise("invalid pipeline options")?;
    tracing::info!("Running single worker on single process");

    let _server_rt = start_server_runtime(&options, options.metrics_port)?;
    let options = Arc::new(options);

    let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
        timely::execute::execute_directly::<(), _>(move |worker| {
            // Timely doesn't offer a way to stop a worker with an
            // `Err`, so errors become panics here and are caught by
            // `catch_unwind` above.
            unwrap_any!(worker_main(worker, || false, &pipeline, options).reraise("worker error"))
        })
    }));

    res.map_err(panic_to_error)
}

/// Execute a pipeline in the current process as part of a cluster.
///
/// If [`PipelineOptions::process_id`] is unset, all workers run in
/// this process and talk over shared memory.
///
/// Blocks until execution is complete.
pub fn cluster_main<P>(pipeline: P, options: PipelineOptions) -> Result<(), TrackedError>
where
    P: Pipeline,
{
    options.validate().reraise("invalid pipeline options")?;
    let proc_id = options.process_id.unwrap_or(0);
    tracing::info!(
        "Running {} workers on process {} of a {}-worker cluster",
        options.workers_per_process,
        proc_id,
        options.worker_count().0
    );

    let (builders, other) = if options.process_id.is_none() {
        timely::CommunicationConfig::Process(options.workers_per_process)
    } else {
        timely::CommunicationConfig::Cluster {
            threads: options.workers_per_process,
            process: proc_id,
            addresses: options.addresses.clone(),
            report: false,
            log_fn: Box::new(|_| None),
        }
    }
    .try_build()
    .map_err(|msg| tracked_err(&format!("error building timely communication pipeline: {msg}")))?;

    let should_shutdown = Arc::new(AtomicBool::new(false));
    let should_shutdown_w = should_shutdown.clone();
    let should_shutdown_p = should_shutdown;

    // Timely turns worker panics into strings when joining, so print
    // the full stacktrace to stderr here and tell every other worker
    // to stop.
    std::panic::set_hook(Box::new(move |info| {
        should_shutdown_p.store(true, Ordering::Relaxed);
        let payload = info.payload();
        let msg = if let Some(err) = payload.downcast_ref::<TrackedError>() {
            err.stacktrace()
        } else if let Some(msg) = payload.downcast_ref::<String>() {
            msg.clone()
        } else if let Some(msg) = payload.downcast_ref::<&str>() {
            msg.to_string()
        } else {
            format!("{info}")
        };
        let msg = prepend_tname(msg);
        // Write in one go so lines from different threads don't
        // interleave.
        let mut stderr = std::io::stderr().lock();
        std::io::Write::write_all(&mut stderr, msg.as_bytes())
            .unwrap_or_else(|err| eprintln!("Error printing error (that's not good): {err}"));
    }));

    // Each process of a cluster gets its own port.
    let port = options
        .metrics_port
        .map(|port| port.saturating_add(proc_id as u16));
    let _server_rt = start_server_runtime(&options, port)?;

    let pipeline = Arc::new(pipeline);
    let options = Arc::new(options);
    let guards = timely::execute::execute_from::<_, (), _>(
        builders,
        other,
        timely::WorkerConfig::default(),
        move |worker| {
            let interrupt = || should_shutdown_w.load(Ordering::Relaxed);
            unwrap_any!(worker_main(worker, interrupt, &*pipeline, options.clone()))
        },
    )
    .map_err(|msg| tracked_err(&format!("error during execution: {msg}")))?;

    for maybe_worker_panic in guards.join() {
        maybe_worker_panic
            .map_err(|_| tracked_err("Worker thread died; look for errors above"))?;
    }

    Ok(())
}

/// Spawn one copy of the current executable per process, each with
/// its process index and the cluster addresses in its environment.
fn spawn_processes(processes: usize) -> Result<Vec<Child>, TrackedError> {
    let addresses: Vec<String> = (0..processes)
        .map(|proc_id| format!("localhost:{}", proc_id as u64 + BASE_PORT))
        .collect();
    let exe = std::env::current_exe().reraise("can't find the current executable")?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    (0..processes)
        .map(|proc_id| {
            Command::new(&exe)
                .args(&args)
                .env("TELEFLOW_PROCESS_ID", proc_id.to_string())
                .env("TELEFLOW_ADDRESSES", addresses.join(","))
                // Only the parent serves metrics.
                .env_remove("TELEFLOW_METRICS_PORT")
                .spawn()
                .reraise_with(|| format!("error spawning process {proc_id}"))
        })
        .collect()
}

/// Main entry point for pipeline binaries.
///
/// Pass the options from [`PipelineOptions::load`] so that spawned
/// processes pick up their process index from the environment.
pub fn cli_main<P>(pipeline: P, options: PipelineOptions) -> Result<(), TrackedError>
where
    P: Pipeline,
{
    let tracer = FlowTracer::new().reraise("error creating tracer")?;
    let _tracer_guard = tracer
        .setup(
            TracingConfig::from_options(&options),
            options.log_level.as_deref(),
        )
        .reraise("error setting up tracing")?;

    if options.process_id.is_some() {
        cluster_main(pipeline, options)
    } else if options.processes == 1 && options.workers_per_process == 1 {
        run_main(pipeline, options)
    } else if options.processes == 1 {
        cluster_main(pipeline, options)
    } else {
        let server_rt = start_server_runtime(&options, options.metrics_port)?;
        let mut ps = spawn_processes(options.processes)?;

        let mut failed = None;
        loop {
            let mut running = false;
            for (proc_id, process) in ps.iter_mut().enumerate() {
                match process.try_wait() {
                    Ok(None) => running = true,
                    Ok(Some(status)) if !status.success() => {
                        failed.get_or_insert((proc_id, status));
                    }
                    Ok(Some(_)) => {}
                    Err(err) => {
                        tracing::error!("Can't check process {proc_id}: {err}");
                    }
                }
            }
            if !running || failed.is_some() {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }

        if let Some((proc_id, status)) = failed {
            for process in ps.iter_mut() {
                // Already exited processes can't be killed.
                let _ = process.kill();
            }
            // Dropping the runtime would wait for the server forever.
            if let Some(rt) = server_rt {
                rt.shutdown_timeout(Duration::from_secs(0));
            }
            return Err(tracked_err(&format!(
                "process {proc_id} failed with {status}; all processes have been shut down"
            )));
        }
        if let Some(rt) = server_rt {
            rt.shutdown_timeout(Duration::from_secs(0));
        }
        Ok(())
    }
}
