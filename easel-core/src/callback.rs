//! Step-callback normalization.
//!
//! Engine families report denoising progress in different shapes. Each
//! family passes its shape as a [`StepArgs`] variant and the
//! [`ProgressAdapter`] folds all of them into one
//! `(completed, total, stage)` progress report, plus an optional raw hook
//! for consumers that want the latents.

use std::panic::{self, AssertUnwindSafe};

use candle_core::Tensor;
use tracing::warn;

/// The side-channel mapping some engines pass to their callback and expect
/// back, possibly modified.
#[derive(Debug, Clone)]
pub struct StepState {
    pub latents: Tensor,
    pub timestep: f64,
}

/// One step callback invocation, in the caller's convention.
#[derive(Debug)]
pub enum StepArgs<'a> {
    Positional {
        step: usize,
        timestep: f64,
        latents: &'a Tensor,
    },
    SideChannel {
        step: usize,
        state: StepState,
    },
    Keyword {
        step: Option<usize>,
        timestep: Option<f64>,
    },
}

/// Receiver of engine step callbacks.
pub trait StepCallback {
    /// Returns the side-channel state for [`StepArgs::SideChannel`] calls,
    /// `None` otherwise.
    fn on_step(&mut self, args: StepArgs<'_>) -> Option<StepState>;
}

/// Receiver of normalized progress reports.
pub trait ProgressSink {
    fn report(&mut self, completed: usize, total: usize, stage: &str);
}

impl<F> ProgressSink for F
where
    F: FnMut(usize, usize, &str),
{
    fn report(&mut self, completed: usize, total: usize, stage: &str) {
        self(completed, total, stage)
    }
}

/// Discards every report.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&mut self, _completed: usize, _total: usize, _stage: &str) {}
}

/// Raw per-step hook. The variant declares how many arguments it accepts.
pub enum RawStepHook<'a> {
    Full(Box<dyn FnMut(usize, f64, &Tensor) + Send + 'a>),
    StepAndTimestep(Box<dyn FnMut(usize, f64) + Send + 'a>),
    StepOnly(Box<dyn FnMut(usize) + Send + 'a>),
}

impl RawStepHook<'_> {
    /// Call the hook with as much of `(step, timestep, latents)` as both the
    /// hook and the step provide.
    fn invoke(&mut self, step: usize, timestep: Option<f64>, latents: Option<&Tensor>) {
        match (self, timestep, latents) {
            (RawStepHook::Full(f), Some(t), Some(l)) => f(step, t, l),
            (RawStepHook::Full(_), _, _) => {
                warn!(step, "raw step hook wants latents the engine did not provide, skipping")
            }
            (RawStepHook::StepAndTimestep(f), Some(t), _) => f(step, t),
            (RawStepHook::StepAndTimestep(_), None, _) => {
                warn!(step, "raw step hook wants a timestep the engine did not provide, skipping")
            }
            (RawStepHook::StepOnly(f), _, _) => f(step),
        }
    }
}

pub fn stage_label(completed: usize, total: usize) -> String {
    format!("Generating (step {completed}/{total})")
}

/// Adapts engine step callbacks to a [`ProgressSink`].
pub struct ProgressAdapter<'a> {
    total_steps: usize,
    sink: &'a mut dyn ProgressSink,
    raw: Option<RawStepHook<'a>>,
    counter: usize,
}

pub fn make_progress_adapter<'a>(
    total_steps: usize,
    sink: &'a mut dyn ProgressSink,
    raw: Option<RawStepHook<'a>>,
) -> ProgressAdapter<'a> {
    ProgressAdapter {
        total_steps,
        sink,
        raw,
        counter: 0,
    }
}

impl ProgressAdapter<'_> {
    /// Zero-based index of the next step when the engine does not say.
    fn next_counter(&mut self) -> usize {
        let step = self.counter;
        self.counter += 1;
        step
    }
}

impl StepCallback for ProgressAdapter<'_> {
    fn on_step(&mut self, args: StepArgs<'_>) -> Option<StepState> {
        let (step, timestep, latents, state) = match args {
            StepArgs::SideChannel { step, state } => {
                (step, Some(state.timestep), Some(state.latents.clone()), Some(state))
            }
            StepArgs::Positional {
                step,
                timestep,
                latents,
            } => (step, Some(timestep), Some(latents.clone()), None),
            StepArgs::Keyword {
                step: Some(step),
                timestep,
            } => (step, timestep, None, None),
            StepArgs::Keyword { step: None, timestep } => {
                (self.next_counter(), timestep, None, None)
            }
        };
        self.counter = self.counter.max(step + 1);

        let completed = step + 1;
        self.sink
            .report(completed, self.total_steps, &stage_label(completed, self.total_steps));

        if let Some(raw) = self.raw.as_mut() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                raw.invoke(step, timestep, latents.as_ref())
            }));
            if outcome.is_err() {
                warn!(step, "raw step hook panicked, continuing generation");
            }
        }

        state
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use candle_core::{DType, Device};
    use std::sync::{Arc, Mutex};

    fn latents() -> Tensor {
        Tensor::zeros((1, 4, 8, 8), DType::F32, &Device::Cpu).unwrap()
    }

    fn reports_for(args: StepArgs<'_>) -> Vec<(usize, usize, String)> {
        let mut seen = Vec::new();
        let mut sink = |c: usize, t: usize, s: &str| seen.push((c, t, s.to_string()));
        let mut adapter = make_progress_adapter(10, &mut sink, None);
        adapter.on_step(args);
        drop(adapter);
        seen
    }

    #[test]
    fn every_convention_normalizes_identically() {
        let l = latents();
        let expected = vec![(4, 10, "Generating (step 4/10)".to_string())];

        assert_eq!(
            reports_for(StepArgs::Positional {
                step: 3,
                timestep: 501.0,
                latents: &l,
            }),
            expected
        );
        assert_eq!(
            reports_for(StepArgs::SideChannel {
                step: 3,
                state: StepState {
                    latents: l.clone(),
                    timestep: 501.0,
                },
            }),
            expected
        );
        assert_eq!(
            reports_for(StepArgs::Keyword {
                step: Some(3),
                timestep: None,
            }),
            expected
        );
    }

    #[test]
    fn missing_step_uses_counter() {
        let mut seen = Vec::new();
        let mut sink = |c: usize, _t: usize, _s: &str| seen.push(c);
        let mut adapter = make_progress_adapter(4, &mut sink, None);
        for _ in 0..3 {
            adapter.on_step(StepArgs::Keyword {
                step: None,
                timestep: None,
            });
        }
        drop(adapter);
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn counter_continues_after_explicit_steps() {
        let mut seen = Vec::new();
        let mut sink = |c: usize, _t: usize, _s: &str| seen.push(c);
        let mut adapter = make_progress_adapter(4, &mut sink, None);
        adapter.on_step(StepArgs::Keyword {
            step: Some(1),
            timestep: None,
        });
        adapter.on_step(StepArgs::Keyword {
            step: None,
            timestep: None,
        });
        drop(adapter);
        assert_eq!(seen, vec![2, 3]);
    }

    #[test]
    fn side_channel_is_returned_unmodified() {
        let l = latents();
        let mut sink = NoProgress;
        let mut adapter = make_progress_adapter(10, &mut sink, None);
        let returned = adapter
            .on_step(StepArgs::SideChannel {
                step: 0,
                state: StepState {
                    latents: l.clone(),
                    timestep: 0.75,
                },
            })
            .expect("side channel state comes back");
        assert_eq!(returned.timestep, 0.75);
        assert_eq!(returned.latents.dims(), l.dims());

        let positional = adapter.on_step(StepArgs::Positional {
            step: 1,
            timestep: 1.0,
            latents: &l,
        });
        assert!(positional.is_none());
    }

    #[test]
    fn raw_hook_receives_what_it_accepts() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let recorded = calls.clone();
        let hook = RawStepHook::StepAndTimestep(Box::new(move |step, t| {
            recorded.lock().unwrap().push((step, t));
        }));
        let l = latents();
        let mut sink = NoProgress;
        let mut adapter = make_progress_adapter(10, &mut sink, Some(hook));
        adapter.on_step(StepArgs::Positional {
            step: 2,
            timestep: 800.0,
            latents: &l,
        });
        // No timestep available: the hook is skipped, not called with junk.
        adapter.on_step(StepArgs::Keyword {
            step: Some(3),
            timestep: None,
        });
        drop(adapter);
        assert_eq!(*calls.lock().unwrap(), vec![(2, 800.0)]);
    }

    #[test]
    fn full_hook_gets_latents() {
        let shapes = Arc::new(Mutex::new(Vec::new()));
        let recorded = shapes.clone();
        let hook = RawStepHook::Full(Box::new(move |step, _t, latents| {
            recorded.lock().unwrap().push((step, latents.dims().to_vec()));
        }));
        let l = latents();
        let mut sink = NoProgress;
        let mut adapter = make_progress_adapter(10, &mut sink, Some(hook));
        adapter.on_step(StepArgs::SideChannel {
            step: 5,
            state: StepState {
                latents: l,
                timestep: 0.5,
            },
        });
        drop(adapter);
        assert_eq!(*shapes.lock().unwrap(), vec![(5, vec![1, 4, 8, 8])]);
    }

    #[test]
    fn panicking_hook_does_not_abort() {
        let hook = RawStepHook::StepOnly(Box::new(|_| panic!("wrong signature")));
        let mut seen = Vec::new();
        let mut sink = |c: usize, _t: usize, _s: &str| seen.push(c);
        let mut adapter = make_progress_adapter(2, &mut sink, Some(hook));
        adapter.on_step(StepArgs::Keyword {
            step: Some(0),
            timestep: None,
        });
        adapter.on_step(StepArgs::Keyword {
            step: Some(1),
            timestep: None,
        });
        drop(adapter);
        assert_eq!(seen, vec![1, 2]);
    }
}
