//! Timely operators that move [`FailsafeElement`]s through a
//! pipeline.
//!
//! A typical pipeline wraps raw input with
//! [`IntoFailsafeOp::into_failsafe`], runs one or more
//! [`FailsafeMapOp::failsafe_map`] stages, writes the failures with
//! [`WriteDeadLettersOp::write_dead_letters`] and unwraps the
//! successes with [`IntoPayloadsOp::into_payloads`].

use std::collections::BTreeMap;
use std::error::Error;
use std::panic::Location;

use chrono::Utc;
use opentelemetry::KeyValue;
use timely::dataflow::channels::pact::Pipeline;
use timely::dataflow::operators::generic::builder_rc::OperatorBuilder;
use timely::dataflow::operators::Map;
use timely::dataflow::operators::Operator;
use timely::dataflow::Scope;
use timely::dataflow::Stream;
use timely::Data;

use crate::coders::Coder;
use crate::dataflow::StepId;
use crate::deadletter::DeadLetterRecord;
use crate::deadletter::DeadLetterWriter;
use crate::dofn::DoFn;
use crate::dofn::Lifecycle;
use crate::errors::stacktrace;
use crate::errors::FlowException;
use crate::errors::TrackedError;
use crate::mutations::hash_row_mutations;
use crate::mutations::RowMutations;
use crate::unwrap_any;
use crate::values::FailsafeElement;
use crate::with_timer;

fn step_labels<S: Scope>(scope: &S, step_id: &StepId) -> Vec<KeyValue> {
    vec![
        KeyValue::new("step_id", step_id.0.clone()),
        KeyValue::new("worker_index", scope.index().to_string()),
    ]
}

pub trait IntoFailsafeOp<S, D>
where
    S: Scope,
    D: Data,
{
    /// Wrap each raw record so its original and current payload are
    /// both the record.
    fn into_failsafe(&self) -> Stream<S, FailsafeElement<D, D>>;
}

impl<S, D> IntoFailsafeOp<S, D> for Stream<S, D>
where
    S: Scope,
    D: Data,
{
    fn into_failsafe(&self) -> Stream<S, FailsafeElement<D, D>> {
        self.map(FailsafeElement::wrap)
    }
}

pub trait IntoPayloadsOp<S, O, C>
where
    S: Scope,
    O: Data,
    C: Data,
{
    /// Drop the failsafe wrapper before a sink.
    fn into_payloads(&self) -> Stream<S, C>;
}

impl<S, O, C> IntoPayloadsOp<S, O, C> for Stream<S, FailsafeElement<O, C>>
where
    S: Scope,
    O: Data,
    C: Data,
{
    fn into_payloads(&self) -> Stream<S, C> {
        self.map(FailsafeElement::into_payload)
    }
}

pub trait FailsafeMapOp<S, O, C>
where
    S: Scope,
    O: Data,
    C: Data,
{
    /// Apply a fallible function to the current payload of each
    /// element.
    ///
    /// Returns the stream of transformed elements and the stream of
    /// dead letters. A dead letter is the input element unchanged
    /// except for its error message and stacktrace. Errors never
    /// stop the dataflow.
    fn failsafe_map<N, E, F>(
        &self,
        step_id: StepId,
        logic: F,
    ) -> (
        Stream<S, FailsafeElement<O, N>>,
        Stream<S, FailsafeElement<O, C>>,
    )
    where
        N: Data,
        E: Error + 'static,
        F: FnMut(&C) -> Result<N, E> + 'static;
}

impl<S, O, C> FailsafeMapOp<S, O, C> for Stream<S, FailsafeElement<O, C>>
where
    S: Scope,
    O: Data,
    C: Data,
{
    #[track_caller]
    fn failsafe_map<N, E, F>(
        &self,
        step_id: StepId,
        mut logic: F,
    ) -> (
        Stream<S, FailsafeElement<O, N>>,
        Stream<S, FailsafeElement<O, C>>,
    )
    where
        N: Data,
        E: Error + 'static,
        F: FnMut(&C) -> Result<N, E> + 'static,
    {
        let caller = Location::caller();

        let mut op_builder = OperatorBuilder::new(format!("{step_id}.failsafe_map"), self.scope());

        let mut self_handle = op_builder.new_input(self, Pipeline);
        let (mut ok_output, oks) = op_builder.new_output();
        let (mut dlq_output, dead_letters) = op_builder.new_output();

        let meter = opentelemetry::global::meter("teleflow");
        let item_inp_count = meter
            .u64_counter("item_inp_count")
            .with_description("number of items this step has ingested")
            .init();
        let item_out_count = meter
            .u64_counter("item_out_count")
            .with_description("number of items this step has emitted")
            .init();
        let dead_letter_count = meter
            .u64_counter("dead_letter_count")
            .with_description("number of items this step has sent to dead letters")
            .init();
        let logic_histogram = meter
            .f64_histogram("failsafe_map_duration_seconds")
            .with_description("`failsafe_map` logic duration in seconds")
            .init();
        let labels = step_labels(&self.scope(), &step_id);

        op_builder.build(move |_| {
            let mut inbuf = Vec::new();
            move |_frontiers| {
                tracing::debug_span!("operator", operator = step_id.0.clone()).in_scope(|| {
                    let mut ok_handle = ok_output.activate();
                    let mut dlq_handle = dlq_output.activate();

                    self_handle.for_each(|time, data| {
                        data.swap(&mut inbuf);
                        item_inp_count.add(inbuf.len() as u64, &labels);

                        let mut ok_session = ok_handle.session(&time);
                        let mut dlq_session = dlq_handle.session(&time);
                        for element in inbuf.drain(..) {
                            let res = with_timer!(logic_histogram, labels, logic(element.payload()));
                            match res {
                                Ok(payload) => {
                                    item_out_count.add(1, &labels);
                                    ok_session.give(element.with_payload(payload));
                                }
                                Err(err) => {
                                    tracing::debug!("Element failed in step {step_id}: {err}");
                                    dead_letter_count.add(1, &labels);
                                    let trace = format!(
                                        "in step {step_id} at {caller}\n{}",
                                        stacktrace(&err)
                                    );
                                    dlq_session.give(
                                        element
                                            .with_error_message(err.to_string())
                                            .with_stacktrace(trace),
                                    );
                                }
                            }
                        }
                    });
                });
            }
        });

        (oks, dead_letters)
    }
}

pub trait ParDoOp<S, D>
where
    S: Scope<Timestamp = u64>,
    D: Data,
{
    /// Run a [`DoFn`] over every element.
    ///
    /// The function is set up now, before the dataflow runs, and torn
    /// down once the input is exhausted or the dataflow is dropped.
    /// An error while processing is not recoverable and panics.
    fn par_do<F>(&self, step_id: StepId, dofn: F) -> Result<Stream<S, F::Output>, TrackedError>
    where
        F: DoFn<D> + 'static,
        F::Output: Data;
}

impl<S, D> ParDoOp<S, D> for Stream<S, D>
where
    S: Scope<Timestamp = u64>,
    D: Data,
{
    fn par_do<F>(&self, step_id: StepId, dofn: F) -> Result<Stream<S, F::Output>, TrackedError>
    where
        F: DoFn<D> + 'static,
        F::Output: Data,
    {
        let mut lifecycle = Lifecycle::setup(step_id.clone(), dofn)?;

        let meter = opentelemetry::global::meter("teleflow");
        let item_inp_count = meter
            .u64_counter("item_inp_count")
            .with_description("number of items this step has ingested")
            .init();
        let item_out_count = meter
            .u64_counter("item_out_count")
            .with_description("number of items this step has emitted")
            .init();
        let labels = step_labels(&self.scope(), &step_id);

        let name = format!("{step_id}.par_do");
        Ok(self.unary_frontier(Pipeline, &name, move |_init_cap, _info| {
            let mut inbuf = Vec::new();
            // Timely forcibly flushes buffers when using
            // `Session::give_vec` so collect all outputs of a batch
            // first.
            let mut outbuf = Vec::new();

            move |input, output| {
                tracing::debug_span!("operator", operator = step_id.0.clone()).in_scope(|| {
                    input.for_each(|time, data| {
                        data.swap(&mut inbuf);
                        item_inp_count.add(inbuf.len() as u64, &labels);
                        for item in inbuf.drain(..) {
                            unwrap_any!(lifecycle.process(item, &mut outbuf));
                        }
                        item_out_count.add(outbuf.len() as u64, &labels);
                        output.session(&time).give_vec(&mut outbuf);
                    });

                    if input.frontier().frontier().is_empty() && !lifecycle.is_torn_down() {
                        unwrap_any!(lifecycle.teardown());
                    }
                });
            }
        }))
    }
}

pub trait HashRowMutationsOp<S>
where
    S: Scope,
{
    /// Turn `(row key, row mutations)` pairs into `(row, mutation
    /// hashes)` that can be compared with `==`.
    ///
    /// Panics on a key that doesn't match its row or on a cell type
    /// that can't be hashed.
    fn hash_row_mutations(&self, step_id: StepId) -> Stream<S, (String, Vec<String>)>;
}

impl<S> HashRowMutationsOp<S> for Stream<S, (Vec<u8>, RowMutations)>
where
    S: Scope,
{
    fn hash_row_mutations(&self, step_id: StepId) -> Stream<S, (String, Vec<String>)> {
        self.map(move |(key, row_mutations)| {
            unwrap_any!(hash_row_mutations(&key, &row_mutations)
                .reraise_with(|| format!("error hashing row mutations in step {step_id}")))
        })
    }
}

pub trait WriteDeadLettersOp<S, O, C>
where
    S: Scope<Timestamp = u64>,
    O: Data,
    C: Data,
{
    /// Encode failed elements and write them, one batch per epoch.
    ///
    /// Emits each written record downstream once its batch is
    /// stored. The coder must be deterministic since records are
    /// deduplicated by the hash of their bytes.
    fn write_dead_letters<K, W>(
        &self,
        step_id: StepId,
        coder: K,
        writer: W,
    ) -> Result<Stream<S, DeadLetterRecord>, TrackedError>
    where
        K: Coder<Value = FailsafeElement<O, C>> + 'static,
        W: DeadLetterWriter + 'static;
}

impl<S, O, C> WriteDeadLettersOp<S, O, C> for Stream<S, FailsafeElement<O, C>>
where
    S: Scope<Timestamp = u64>,
    O: Data,
    C: Data,
{
    fn write_dead_letters<K, W>(
        &self,
        step_id: StepId,
        coder: K,
        mut writer: W,
    ) -> Result<Stream<S, DeadLetterRecord>, TrackedError>
    where
        K: Coder<Value = FailsafeElement<O, C>> + 'static,
        W: DeadLetterWriter + 'static,
    {
        coder
            .verify_deterministic()
            .reraise_with(|| format!("coder for dead letters in step {step_id} can't fingerprint"))?;

        let meter = opentelemetry::global::meter("teleflow");
        let item_inp_count = meter
            .u64_counter("item_inp_count")
            .with_description("number of items this step has ingested")
            .init();
        let labels = step_labels(&self.scope(), &step_id);

        // Elements wait here until their epoch closes.
        let mut stash: BTreeMap<u64, Vec<FailsafeElement<O, C>>> = BTreeMap::new();
        let mut inbuf = Vec::new();

        let name = format!("{step_id}.write_dead_letters");
        Ok(self.unary_notify(Pipeline, &name, None, move |input, output, notificator| {
            tracing::debug_span!("operator", operator = step_id.0.clone()).in_scope(|| {
                input.for_each(|cap, incoming| {
                    incoming.swap(&mut inbuf);
                    stash
                        .entry(*cap.time())
                        .or_insert_with(Vec::new)
                        .append(&mut inbuf);
                    notificator.notify_at(cap.retain());
                });

                notificator.for_each(|cap, _count, _notificator| {
                    let epoch = *cap.time();
                    if let Some(batch) = stash.remove(&epoch) {
                        item_inp_count.add(batch.len() as u64, &labels);
                        let failed_at = Utc::now();
                        let mut records = unwrap_any!(batch
                            .iter()
                            .map(|element| {
                                DeadLetterRecord::encode(step_id.clone(), &coder, element, failed_at)
                            })
                            .collect::<Result<Vec<_>, _>>()
                            .reraise_with(|| {
                                format!("error encoding dead letters in step {step_id}")
                            }));
                        tracing::debug!(
                            "Writing {} dead letters in step {step_id} at epoch {epoch}",
                            records.len()
                        );
                        unwrap_any!(writer.write_batch(records.clone()).reraise_with(|| {
                            format!("error writing dead letters in step {step_id}")
                        }));
                        output.session(&cap).give_vec(&mut records);
                    }
                });
            });
        }))
    }
}
