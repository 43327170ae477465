//! An ordered stack of stages with an interception point on each stage.
//!
//! Observers wrap a stage's invocation: the stage runs, then every observer
//! registered on it gets the output in registration order and returns the
//! (possibly modified) output that flows on to the next stage.

use crate::error::{Error, Result};
use candle_core::Tensor;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::debug;

/// What a stage emits: the hidden state alone, or the hidden state followed by
/// auxiliary tensors that downstream stages ignore.
#[derive(Debug, Clone)]
pub enum StageOutput {
    Hidden(Tensor),
    Tuple(Tensor, Vec<Tensor>),
}

impl StageOutput {
    pub fn hidden(&self) -> &Tensor {
        match self {
            Self::Hidden(h) | Self::Tuple(h, _) => h,
        }
    }

    pub fn into_hidden(self) -> Tensor {
        match self {
            Self::Hidden(h) | Self::Tuple(h, _) => h,
        }
    }

    /// 1 for a bare tensor, `1 + aux.len()` for a tuple.
    pub fn arity(&self) -> usize {
        match self {
            Self::Hidden(_) => 1,
            Self::Tuple(_, aux) => 1 + aux.len(),
        }
    }

    /// Replace the hidden state, keep the variant and the auxiliary tensors.
    pub fn map_hidden<F>(self, f: F) -> candle_core::Result<Self>
    where
        F: FnOnce(Tensor) -> candle_core::Result<Tensor>,
    {
        Ok(match self {
            Self::Hidden(h) => Self::Hidden(f(h)?),
            Self::Tuple(h, aux) => Self::Tuple(f(h)?, aux),
        })
    }
}

pub trait Stage {
    fn forward(&self, hidden: &Tensor) -> candle_core::Result<StageOutput>;
}

pub trait StageObserver: Send + Sync {
    fn observe(&self, output: StageOutput) -> candle_core::Result<StageOutput>;
}

type ObserverList = Mutex<Vec<(u64, Arc<dyn StageObserver>)>>;

struct ObservedStage {
    stage: Box<dyn Stage>,
    observers: Arc<ObserverList>,
}

#[derive(Default)]
pub struct Pipeline {
    stages: Vec<ObservedStage>,
    next_observer_id: u64,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: impl Stage + 'static) {
        self.stages.push(ObservedStage {
            stage: Box::new(stage),
            observers: Arc::new(Mutex::new(Vec::new())),
        });
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Wrap stage `index` with `observer`.
    ///
    /// Registering the same observer twice applies it twice.
    pub fn register_observer(
        &mut self,
        index: usize,
        observer: Arc<dyn StageObserver>,
    ) -> Result<ObserverHandle> {
        let len = self.stages.len();
        let stage = self
            .stages
            .get(index)
            .ok_or(Error::StageIndexOutOfRange { index, len })?;

        let id = self.next_observer_id;
        self.next_observer_id += 1;
        lock(&stage.observers).push((id, observer));

        debug!(stage = index, observer = id, "observer registered");
        Ok(ObserverHandle {
            id,
            stage_index: index,
            observers: Arc::downgrade(&stage.observers),
        })
    }

    /// Number of observers on stage `index`, `None` when out of range.
    pub fn observer_count(&self, index: usize) -> Option<usize> {
        self.stages.get(index).map(|s| lock(&s.observers).len())
    }

    /// Run one stage and its observers.
    pub fn forward_stage(&self, index: usize, hidden: &Tensor) -> candle_core::Result<StageOutput> {
        let stage = self.stages.get(index).ok_or_else(|| {
            candle_core::Error::Msg(format!(
                "stage index {index} out of range for {} stages",
                self.stages.len()
            ))
        })?;

        let mut output = stage.stage.forward(hidden)?;
        // Snapshot so an observer may detach itself without deadlocking.
        let observers: Vec<Arc<dyn StageObserver>> =
            lock(&stage.observers).iter().map(|(_, o)| o.clone()).collect();
        for observer in observers {
            output = observer.observe(output)?;
        }
        Ok(output)
    }

    /// Thread the hidden state through every stage in order.
    pub fn forward(&self, input: &Tensor) -> candle_core::Result<Tensor> {
        let mut hidden = input.clone();
        for index in 0..self.stages.len() {
            hidden = self.forward_stage(index, &hidden)?.into_hidden();
        }
        Ok(hidden)
    }
}

/// Removal token for one registered observer.
///
/// Holds only a weak reference to the stage, so it never keeps a dropped
/// pipeline alive.
#[derive(Debug, Clone)]
pub struct ObserverHandle {
    id: u64,
    stage_index: usize,
    observers: Weak<ObserverList>,
}

impl ObserverHandle {
    pub fn stage_index(&self) -> usize {
        self.stage_index
    }

    /// Still registered on a pipeline that is still alive.
    pub fn is_live(&self) -> bool {
        self.observers
            .upgrade()
            .map(|observers| lock(&observers).iter().any(|(id, _)| *id == self.id))
            .unwrap_or(false)
    }

    /// Unregister. Returns `false` when there was nothing left to remove.
    pub fn remove(&self) -> bool {
        let Some(observers) = self.observers.upgrade() else {
            return false;
        };
        let mut observers = lock(&observers);
        let before = observers.len();
        observers.retain(|(id, _)| *id != self.id);
        let removed = observers.len() != before;
        if removed {
            debug!(stage = self.stage_index, observer = self.id, "observer removed");
        }
        removed
    }
}

fn lock(observers: &ObserverList) -> MutexGuard<'_, Vec<(u64, Arc<dyn StageObserver>)>> {
    observers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
