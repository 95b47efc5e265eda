use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use teleflow::coders::FailsafeElementCoder;
use teleflow::coders::StringUtf8Coder;
use teleflow::dataflow::WorkerIndex;
use teleflow::deadletter::InMemDeadLetters;
use teleflow::deadletter::SqliteDeadLetterStore;
use teleflow::dofn::DoFn;
use teleflow::errors::tracked_err;
use teleflow::mutations::Put;
use teleflow::mutations::RowMutations;
use teleflow::operators::*;
use teleflow::run::run_main;
use teleflow::FailsafeElement;
use teleflow::Pipeline;
use teleflow::PipelineOptions;
use teleflow::StepId;
use teleflow::TrackedError;
use teleflow::WorkerContext;
use timely::dataflow::operators::capture::Extract;
use timely::dataflow::operators::Capture;
use timely::dataflow::operators::Delay;
use timely::dataflow::operators::Map;
use timely::dataflow::operators::ToStream;
use timely::dataflow::Scope;

fn raw(inputs: &[&str]) -> Vec<String> {
    inputs.iter().map(|s| s.to_string()).collect()
}

#[test]
fn failsafe_map_splits_successes_and_failures() {
    let (oks, dead) = timely::example(|scope| {
        let (oks, dead) = raw(&["1", "2", "three", "4"])
            .to_stream(scope)
            .into_failsafe()
            .failsafe_map(StepId::from("parse"), |raw: &String| raw.parse::<u64>());
        let oks = oks.into_payloads().capture();
        let dead = dead
            .map(|element: FailsafeElement<String, String>| {
                (
                    element.original_payload().clone(),
                    element.error_message().map(str::to_string),
                    element.stacktrace().map(|trace| trace.starts_with("in step parse at")),
                )
            })
            .capture();
        (oks, dead)
    });

    let oks: Vec<u64> = oks.extract().into_iter().flat_map(|(_, xs)| xs).collect();
    assert_eq!(oks, vec![1, 2, 4]);

    let dead: Vec<_> = dead.extract().into_iter().flat_map(|(_, xs)| xs).collect();
    assert_eq!(
        dead,
        vec![(
            "three".to_string(),
            Some("invalid digit found in string".to_string()),
            Some(true)
        )]
    );
}

#[test]
fn chained_steps_keep_the_original_payload() {
    let dead = timely::example(|scope| {
        let (parsed, _) = raw(&["10", "0"])
            .to_stream(scope)
            .into_failsafe()
            .failsafe_map(StepId::from("parse"), |raw: &String| raw.parse::<u64>());
        let (_, dead) = parsed.failsafe_map(StepId::from("invert"), |n: &u64| {
            if *n == 0 {
                Err(tracked_err("division by zero"))
            } else {
                Ok(100 / n)
            }
        });
        dead.map(|element| {
            let (original, payload, error_message, _) = element.into_parts();
            let failed_on_zero = error_message
                .map(|msg| msg.ends_with("division by zero"))
                .unwrap_or(false);
            (original, payload, failed_on_zero)
        })
        .capture()
    });

    let dead: Vec<_> = dead.extract().into_iter().flat_map(|(_, xs)| xs).collect();
    assert_eq!(dead, vec![("0".to_string(), 0, true)]);
}

#[test]
fn dead_letters_are_written_once_per_element() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().to_path_buf();

    let written = timely::example(move |scope| {
        let store = SqliteDeadLetterStore::open(&path, WorkerIndex(0)).unwrap();
        let (_, dead) = raw(&["oops", "1", "oops", "nope"])
            .to_stream(scope)
            .into_failsafe()
            .failsafe_map(StepId::from("parse"), |raw: &String| raw.parse::<u64>());
        dead.write_dead_letters(
            StepId::from("parse"),
            FailsafeElementCoder::of(StringUtf8Coder, StringUtf8Coder),
            store,
        )
        .unwrap()
        .map(|record| record.fingerprint)
        .capture()
    });

    let written: Vec<u64> = written.extract().into_iter().flat_map(|(_, xs)| xs).collect();
    assert_eq!(written.len(), 3);

    let store = SqliteDeadLetterStore::open(dir.path(), WorkerIndex(0)).unwrap();
    let records = store.load().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].occurrences, 2);
    assert_eq!(records[1].occurrences, 1);

    let coder = FailsafeElementCoder::of(StringUtf8Coder, StringUtf8Coder);
    let element = records[0].decode(&coder).unwrap();
    assert_eq!(element.original_payload(), "oops");
    assert_eq!(element.payload(), "oops");
    assert!(element.is_failed());
}

#[test]
fn in_mem_dead_letters_collect_from_the_dataflow() {
    let store = InMemDeadLetters::new();
    let writer = store.clone();

    timely::example(move |scope| {
        let (_, dead) = raw(&["a", "b"])
            .to_stream(scope)
            .into_failsafe()
            .failsafe_map(StepId::from("parse"), |raw: &String| raw.parse::<u64>());
        dead.write_dead_letters(
            StepId::from("parse"),
            FailsafeElementCoder::of(StringUtf8Coder, StringUtf8Coder),
            writer,
        )
        .unwrap();
    });

    let records = store.records();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.step_id == StepId::from("parse")));
}

#[test]
fn dead_letters_are_written_when_each_epoch_closes() {
    let store = InMemDeadLetters::new();
    let writer = store.clone();

    let written = timely::example(move |scope| {
        let (_, dead) = vec![(0_u64, "a"), (1, "b"), (1, "c"), (3, "d")]
            .to_stream(scope)
            .delay(|(epoch, _), _| *epoch)
            .map(|(_, raw)| raw.to_string())
            .into_failsafe()
            .failsafe_map(StepId::from("parse"), |raw: &String| raw.parse::<u64>());
        dead.write_dead_letters(
            StepId::from("parse"),
            FailsafeElementCoder::of(StringUtf8Coder, StringUtf8Coder),
            writer,
        )
        .unwrap()
        .capture()
    });

    let batches: Vec<(u64, usize)> = written
        .extract()
        .into_iter()
        .map(|(epoch, records)| (epoch, records.len()))
        .collect();
    assert_eq!(batches, vec![(0, 1), (1, 2), (3, 1)]);
    assert_eq!(store.records().len(), 4);
}

struct Doubler {
    setups: Arc<AtomicUsize>,
    teardowns: Arc<AtomicUsize>,
}

impl DoFn<u64> for Doubler {
    type Output = u64;

    fn setup(&mut self) -> Result<(), TrackedError> {
        self.setups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn process(&mut self, input: u64, output: &mut Vec<u64>) -> Result<(), TrackedError> {
        output.push(input * 2);
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), TrackedError> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn par_do_sets_up_and_tears_down_once() {
    let setups = Arc::new(AtomicUsize::new(0));
    let teardowns = Arc::new(AtomicUsize::new(0));
    let dofn_setups = setups.clone();
    let dofn_teardowns = teardowns.clone();

    let out = timely::example(move |scope| {
        let dofn = Doubler {
            setups: dofn_setups,
            teardowns: dofn_teardowns,
        };
        (1..=3_u64)
            .to_stream(scope)
            .par_do(StepId::from("double"), dofn)
            .unwrap()
            .capture()
    });

    let out: Vec<u64> = out.extract().into_iter().flat_map(|(_, xs)| xs).collect();
    assert_eq!(out, vec![2, 4, 6]);
    assert_eq!(setups.load(Ordering::SeqCst), 1);
    assert_eq!(teardowns.load(Ordering::SeqCst), 1);
}

#[test]
fn hash_row_mutations_step() {
    let out = timely::example(|scope| {
        let mut row = RowMutations::new("row-key-1");
        row.add(Put::new("row-key-1").add_column("cf", "col1", 123456000, "val-1"))
            .unwrap();
        vec![(b"row-key-1".to_vec(), row)]
            .to_stream(scope)
            .hash_row_mutations(StepId::from("hash"))
            .capture()
    });

    let out: Vec<_> = out.extract().into_iter().flat_map(|(_, xs)| xs).collect();
    assert_eq!(
        out,
        vec![(
            "row-key-1".to_string(),
            vec!["PUT_123456000_row-key-1_cf_col1_val-1".to_string()]
        )]
    );
}

struct ParseNumbers {
    inputs: Vec<String>,
}

impl Pipeline for ParseNumbers {
    fn build<S>(&self, scope: &mut S, ctx: &WorkerContext) -> Result<(), TrackedError>
    where
        S: Scope<Timestamp = u64>,
    {
        let (_, dead) = self
            .inputs
            .clone()
            .to_stream(scope)
            .into_failsafe()
            .failsafe_map(StepId::from("parse"), |raw: &String| raw.parse::<u64>());
        dead.write_dead_letters(
            StepId::from("dead_letters"),
            FailsafeElementCoder::of(StringUtf8Coder, StringUtf8Coder),
            ctx.dead_letter_writer()?,
        )?;
        Ok(())
    }
}

#[test]
fn run_main_writes_worker_dead_letters() {
    let dir = tempfile::tempdir().unwrap();
    let options = PipelineOptions {
        dead_letter_dir: Some(dir.path().to_path_buf()),
        ..PipelineOptions::default()
    };

    run_main(
        ParseNumbers {
            inputs: raw(&["1", "x", "2"]),
        },
        options,
    )
    .unwrap();

    let store = SqliteDeadLetterStore::open(dir.path(), WorkerIndex(0)).unwrap();
    let records = store.load_step(&StepId::from("dead_letters")).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].error_message.as_deref(),
        Some("invalid digit found in string")
    );
}

struct BrokenPipeline;

impl Pipeline for BrokenPipeline {
    fn build<S>(&self, _scope: &mut S, _ctx: &WorkerContext) -> Result<(), TrackedError>
    where
        S: Scope<Timestamp = u64>,
    {
        Err(tracked_err("no inputs configured"))
    }
}

#[test]
fn run_main_returns_build_errors() {
    let err = run_main(BrokenPipeline, PipelineOptions::default()).unwrap_err();

    assert_eq!(err.message(), "worker error");
    assert!(err.stacktrace().contains("no inputs configured"));
}
