//! Per-worker processing functions with a setup and teardown
//! lifecycle.
//!
//! A [`DoFn`] usually holds a connection or client that is expensive
//! to create. [`Lifecycle`] guarantees `setup` runs once before any
//! element and `teardown` runs once after the last, even when the
//! worker is unwinding.

use std::marker::PhantomData;

use crate::dataflow::StepId;
use crate::errors::tracked_err;
use crate::errors::FlowException;
use crate::errors::TrackedError;

/// Logic run on every element of a stream, on each worker.
pub trait DoFn<I> {
    type Output;

    /// Acquire resources. Called once before the first element.
    fn setup(&mut self) -> Result<(), TrackedError> {
        Ok(())
    }

    /// Process one element, pushing any number of outputs.
    fn process(&mut self, input: I, output: &mut Vec<Self::Output>) -> Result<(), TrackedError>;

    /// Release resources. Called once after the last element.
    fn teardown(&mut self) -> Result<(), TrackedError> {
        Ok(())
    }
}

/// Owns a set-up [`DoFn`] and tears it down exactly once.
///
/// Teardown happens on [`Lifecycle::teardown`] or, failing that, on
/// drop.
pub struct Lifecycle<I, F>
where
    F: DoFn<I>,
{
    step_id: StepId,
    dofn: Option<F>,
    _input: PhantomData<fn(I)>,
}

impl<I, F> Lifecycle<I, F>
where
    F: DoFn<I>,
{
    pub fn setup(step_id: StepId, mut dofn: F) -> Result<Self, TrackedError> {
        dofn.setup()
            .reraise_with(|| format!("error in setup of step {step_id}"))?;
        tracing::debug!("DoFn in step {step_id} set up");
        Ok(Self {
            step_id,
            dofn: Some(dofn),
            _input: PhantomData,
        })
    }

    pub fn process(&mut self, input: I, output: &mut Vec<F::Output>) -> Result<(), TrackedError> {
        let step_id = &self.step_id;
        match self.dofn.as_mut() {
            Some(dofn) => dofn
                .process(input, output)
                .reraise_with(|| format!("error processing element in step {step_id}")),
            None => Err(tracked_err(&format!(
                "step {step_id} received an element after teardown"
            ))),
        }
    }

    pub fn is_torn_down(&self) -> bool {
        self.dofn.is_none()
    }

    /// Does nothing if already torn down.
    pub fn teardown(&mut self) -> Result<(), TrackedError> {
        match self.dofn.take() {
            Some(mut dofn) => {
                tracing::debug!("DoFn in step {} tearing down", self.step_id);
                let step_id = &self.step_id;
                dofn.teardown()
                    .reraise_with(|| format!("error in teardown of step {step_id}"))
            }
            None => Ok(()),
        }
    }
}

impl<I, F> Drop for Lifecycle<I, F>
where
    F: DoFn<I>,
{
    fn drop(&mut self) {
        if let Err(err) = self.teardown() {
            tracing::error!("{}", err.stacktrace());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Rc<RefCell<Vec<String>>>,
        fail_setup: bool,
    }

    impl DoFn<u32> for Recorder {
        type Output = u32;

        fn setup(&mut self) -> Result<(), TrackedError> {
            if self.fail_setup {
                return Err(tracked_err("no connection"));
            }
            self.events.borrow_mut().push("setup".to_string());
            Ok(())
        }

        fn process(&mut self, input: u32, output: &mut Vec<u32>) -> Result<(), TrackedError> {
            self.events.borrow_mut().push(format!("process {input}"));
            output.push(input * 2);
            Ok(())
        }

        fn teardown(&mut self) -> Result<(), TrackedError> {
            self.events.borrow_mut().push("teardown".to_string());
            Ok(())
        }
    }

    #[test]
    fn lifecycle_runs_in_order_and_tears_down_once() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let dofn = Recorder {
            events: events.clone(),
            ..Default::default()
        };

        let mut lifecycle = Lifecycle::setup(StepId::from("double"), dofn).unwrap();
        let mut out = Vec::new();
        lifecycle.process(1, &mut out).unwrap();
        lifecycle.process(2, &mut out).unwrap();
        lifecycle.teardown().unwrap();
        lifecycle.teardown().unwrap();
        drop(lifecycle);

        assert_eq!(out, vec![2, 4]);
        assert_eq!(
            *events.borrow(),
            vec!["setup", "process 1", "process 2", "teardown"]
        );
    }

    #[test]
    fn drop_tears_down() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let dofn = Recorder {
            events: events.clone(),
            ..Default::default()
        };

        let lifecycle = Lifecycle::setup(StepId::from("double"), dofn).unwrap();
        drop(lifecycle);

        assert_eq!(*events.borrow(), vec!["setup", "teardown"]);
    }

    #[test]
    fn failed_setup_is_reported() {
        let dofn = Recorder {
            fail_setup: true,
            ..Default::default()
        };

        let err = match Lifecycle::setup(StepId::from("double"), dofn) {
            Ok(_) => panic!("setup should fail"),
            Err(err) => err,
        };

        assert_eq!(err.message(), "error in setup of step double");
        assert!(err.stacktrace().contains("no connection"));
    }

    #[test]
    fn process_after_teardown_is_an_error() {
        let mut lifecycle = Lifecycle::setup(StepId::from("double"), Recorder::default()).unwrap();
        lifecycle.teardown().unwrap();

        assert!(lifecycle.is_torn_down());
        assert!(lifecycle.process(3, &mut Vec::new()).is_err());
    }
}
