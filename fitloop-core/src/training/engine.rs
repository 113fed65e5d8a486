//! Epoch driver: runs training and validation passes over mini-batches.
//!
//! A training step is forward, loss, backward, norm diagnostics, optimizer
//! update. A validation step is forward and loss inside an [`EvalScope`],
//! which switches gradient bookkeeping off and restores it on every exit
//! path. Per-batch metrics are folded into per-epoch running averages.

use crate::data::Batch;
use crate::error::FitError;
use crate::training::callbacks::EpochObserver;
use crate::training::checkpoint::ModelState;
use crate::training::metrics::{
    ACCURACY, Averaging, GRAD_NORM, LOSS, Metrics, PARAM_NORM, RunningAverage,
};
use crate::training::task::TaskKind;
use candle_core::Tensor;
use candle_core::backprop::GradStore;
use candle_nn::{ModuleT, Optimizer, VarMap};
use std::cell::Cell;
use std::fmt;

/// Which step function an epoch applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Training,
    Validation,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Training => write!(f, "train"),
            Self::Validation => write!(f, "valid"),
        }
    }
}

/// Where the driver is within an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    RunningBatch,
    EpochComplete,
}

/// Gradient bookkeeping is off while this guard lives: forward outputs are
/// detached from the parameters until it drops.
pub struct EvalScope<'a> {
    flag: &'a Cell<bool>,
    previous: bool,
}

impl<'a> EvalScope<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        let previous = flag.replace(false);
        Self { flag, previous }
    }
}

impl Drop for EvalScope<'_> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}

/// L2 norm over every parameter of `varmap`.
pub fn parameter_norm(varmap: &VarMap) -> Result<f64, FitError> {
    let mut total = 0.0f64;
    for var in varmap.all_vars() {
        total += squared_sum(var.as_tensor())?;
    }
    Ok(total.sqrt())
}

/// L2 norm over the gradients of `varmap`'s parameters; parameters without a gradient are skipped.
pub fn gradient_norm(varmap: &VarMap, grads: &GradStore) -> Result<f64, FitError> {
    let mut total = 0.0f64;
    for var in varmap.all_vars() {
        if let Some(grad) = grads.get(var.as_tensor()) {
            total += squared_sum(grad)?;
        }
    }
    Ok(total.sqrt())
}

fn squared_sum(t: &Tensor) -> Result<f64, FitError> {
    let sum = t
        .to_dtype(candle_core::DType::F64)?
        .sqr()?
        .sum_all()?
        .to_scalar::<f64>()?;
    Ok(sum)
}

/// Drives one model through training and validation epochs.
pub struct EpochDriver<M, O> {
    model: M,
    varmap: VarMap,
    optimizer: O,
    task: TaskKind,
    running: RunningAverage,
    observers: Vec<Box<dyn EpochObserver>>,
    state: DriverState,
    grad_enabled: Cell<bool>,
    train_epochs: usize,
    valid_epochs: usize,
}

impl<M, O> EpochDriver<M, O>
where
    M: ModuleT,
    O: Optimizer,
{
    /// `varmap` must hold the parameters of `model`, and `optimizer` must update them.
    pub fn new(model: M, varmap: VarMap, optimizer: O, task: TaskKind, averaging: Averaging) -> Self {
        Self {
            model,
            varmap,
            optimizer,
            task,
            running: RunningAverage::new(averaging),
            observers: Vec::new(),
            state: DriverState::Idle,
            grad_enabled: Cell::new(true),
            train_epochs: 0,
            valid_epochs: 0,
        }
    }

    pub fn add_observer(&mut self, observer: Box<dyn EpochObserver>) {
        self.observers.push(observer);
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn task(&self) -> TaskKind {
        self.task
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn grad_enabled(&self) -> bool {
        self.grad_enabled.get()
    }

    /// Number of completed epochs in `mode`.
    pub fn epochs_completed(&self, mode: Mode) -> usize {
        match mode {
            Mode::Training => self.train_epochs,
            Mode::Validation => self.valid_epochs,
        }
    }

    /// Deep copy of the current parameters.
    pub fn model_state(&self) -> Result<ModelState, FitError> {
        ModelState::capture(&self.varmap)
    }

    fn forward(&self, batch: &Batch, train: bool) -> Result<(Tensor, Tensor), FitError> {
        batch.validate(self.task.target_dtype())?;
        let output = self
            .model
            .forward_t(&batch.inputs, train)
            .map_err(|e| FitError::data(format!("forward pass failed: {e}")))?;
        // Outside gradient mode the output is cut from the graph, so the loss
        // tracks no parameter.
        let output = if self.grad_enabled.get() {
            output
        } else {
            output.detach()
        };
        let loss = self
            .task
            .loss(&output, &batch.targets)
            .map_err(|e| FitError::data(format!("loss computation failed: {e}")))?;
        Ok((output, loss))
    }

    /// Forward, backward and one optimizer update on `batch`.
    ///
    /// Norms are measured before the update. Returns loss, accuracy, `|param|`
    /// and `|g_param|`.
    pub fn run_training_step(&mut self, batch: &Batch) -> Result<Metrics, FitError> {
        let (output, loss) = self.forward(batch, true)?;
        // Each backward pass starts from an empty gradient store.
        let grads = loss.backward()?;

        let loss_value = f64::from(loss.to_scalar::<f32>()?);
        let accuracy = self.task.accuracy(&output, &batch.targets)?;
        let p_norm = parameter_norm(&self.varmap)?;
        let g_norm = gradient_norm(&self.varmap, &grads)?;

        self.optimizer.step(&grads)?;

        Ok(Metrics::new()
            .with(LOSS, loss_value)
            .with(ACCURACY, accuracy)
            .with(PARAM_NORM, p_norm)
            .with(GRAD_NORM, g_norm))
    }

    /// Forward pass only; parameters are never touched.
    pub fn run_validation_step(&self, batch: &Batch) -> Result<Metrics, FitError> {
        let _scope = EvalScope::enter(&self.grad_enabled);
        let (output, loss) = self.forward(batch, false)?;
        let loss_value = f64::from(loss.to_scalar::<f32>()?);
        let accuracy = self.task.accuracy(&output, &batch.targets)?;
        Ok(Metrics::new()
            .with(LOSS, loss_value)
            .with(ACCURACY, accuracy))
    }

    /// Run every batch of `batches` once in `mode` and return the epoch averages.
    ///
    /// The first failing batch aborts the epoch; updates from earlier batches stay.
    pub fn run_epoch<I>(&mut self, batches: I, mode: Mode) -> Result<Metrics, FitError>
    where
        I: IntoIterator<Item = Result<Batch, FitError>>,
    {
        self.state = DriverState::Idle;
        self.running.reset();

        for (i, batch) in batches.into_iter().enumerate() {
            self.state = DriverState::RunningBatch;
            let step = batch.and_then(|batch| match mode {
                Mode::Training => self.run_training_step(&batch),
                Mode::Validation => self.run_validation_step(&batch),
            });
            let metrics = match step {
                Ok(metrics) => metrics,
                Err(e) => {
                    self.state = DriverState::Idle;
                    tracing::warn!(%mode, batch = i + 1, error = %e, "epoch aborted");
                    return Err(e);
                }
            };
            self.running.update(&metrics);
            let running = self.running.compute();
            for observer in &mut self.observers {
                observer.on_batch_completed(mode, i + 1, &running);
            }
        }

        let epoch = match mode {
            Mode::Training => {
                self.train_epochs += 1;
                self.train_epochs
            }
            Mode::Validation => {
                self.valid_epochs += 1;
                self.valid_epochs
            }
        };
        self.state = DriverState::EpochComplete;

        let aggregated = self.running.compute();
        for observer in &mut self.observers {
            observer.on_epoch_completed(mode, epoch, &aggregated);
        }
        Ok(aggregated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::model::Mlp;
    use crate::training::metrics::{TRAINING_METRICS, VALIDATION_METRICS};
    use candle_core::{DType, Device};
    use candle_nn::{SGD, VarBuilder};
    use std::cell::RefCell;
    use std::rc::Rc;

    fn driver(lr: f64) -> EpochDriver<Mlp, SGD> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let config = ModelConfig {
            input_size: 2,
            output_size: 2,
            n_layers: 1,
            use_dropout: false,
            dropout_p: 0.0,
        };
        let model = Mlp::new(&config, vb).unwrap();
        let opt = SGD::new(varmap.all_vars(), lr).unwrap();
        EpochDriver::new(model, varmap, opt, TaskKind::Classification, Averaging::Cumulative)
    }

    fn batch() -> Batch {
        let dev = Device::Cpu;
        Batch::new(
            Tensor::new(&[[1.0f32, 0.0], [0.0, 1.0], [2.0, 0.1]], &dev).unwrap(),
            Tensor::new(&[0u32, 1, 0], &dev).unwrap(),
        )
    }

    #[derive(Default)]
    struct Recorder {
        batches: Vec<(Mode, usize)>,
        epochs: Vec<(Mode, usize, Metrics)>,
    }

    struct Shared(Rc<RefCell<Recorder>>);

    impl EpochObserver for Shared {
        fn on_batch_completed(&mut self, mode: Mode, batch: usize, _running: &Metrics) {
            self.0.borrow_mut().batches.push((mode, batch));
        }

        fn on_epoch_completed(&mut self, mode: Mode, epoch: usize, metrics: &Metrics) {
            self.0.borrow_mut().epochs.push((mode, epoch, metrics.clone()));
        }
    }

    #[test]
    fn test_training_step_reports_all_metrics() {
        let mut d = driver(0.1);
        let before = d.model_state().unwrap();
        let m = d.run_training_step(&batch()).unwrap();
        for name in TRAINING_METRICS {
            let v = m.get(name).unwrap();
            assert!(v.is_finite() && v >= 0.0, "{name} = {v}");
        }
        assert_ne!(d.model_state().unwrap(), before);
    }

    #[test]
    fn test_validation_step_leaves_parameters_untouched() {
        let d = driver(0.1);
        let before = d.model_state().unwrap();
        let m = d.run_validation_step(&batch()).unwrap();
        assert_eq!(m.len(), VALIDATION_METRICS.len());
        assert!(VALIDATION_METRICS.iter().all(|name| m.get(name).is_some()));
        assert!(m.get(PARAM_NORM).is_none());
        assert_eq!(d.model_state().unwrap(), before);
    }

    #[test]
    fn test_eval_scope_tracks_no_gradients() {
        let d = driver(0.1);
        let (_, loss) = d.forward(&batch(), false).unwrap();
        let grads = loss.backward().unwrap();
        let vars = d.varmap().all_vars();
        assert!(vars.iter().all(|v| grads.get(v.as_tensor()).is_some()));

        let _scope = EvalScope::enter(&d.grad_enabled);
        assert!(!d.grad_enabled());
        let (_, loss) = d.forward(&batch(), false).unwrap();
        let grads = loss.backward().unwrap();
        let tracked = vars
            .iter()
            .filter(|v| grads.get(v.as_tensor()).is_some())
            .count();
        assert_eq!(tracked, 0);
    }

    #[test]
    fn test_eval_scope_restored_after_failure() {
        let mut d = driver(0.1);
        let dev = Device::Cpu;
        let bad = Batch::new(
            Tensor::zeros((2, 5), DType::F32, &dev).unwrap(),
            Tensor::zeros(2, DType::U32, &dev).unwrap(),
        );
        let err = d.run_validation_step(&bad).unwrap_err();
        assert!(matches!(err, FitError::Data(_)));
        assert!(d.grad_enabled());
        assert!(d.run_training_step(&batch()).is_ok());
    }

    #[test]
    fn test_run_epoch_notifies_observers() {
        let mut d = driver(0.1);
        let rec = Rc::new(RefCell::new(Recorder::default()));
        d.add_observer(Box::new(Shared(rec.clone())));

        let batches = vec![Ok(batch()), Ok(batch())];
        let avg = d.run_epoch(batches, Mode::Training).unwrap();
        assert_eq!(d.state(), DriverState::EpochComplete);
        assert_eq!(d.epochs_completed(Mode::Training), 1);
        assert_eq!(d.epochs_completed(Mode::Validation), 0);

        let rec = rec.borrow();
        assert_eq!(
            rec.batches,
            vec![(Mode::Training, 1), (Mode::Training, 2)]
        );
        assert_eq!(rec.epochs.len(), 1);
        assert_eq!(rec.epochs[0].0, Mode::Training);
        assert_eq!(rec.epochs[0].2, avg);
    }

    #[test]
    fn test_failing_batch_aborts_epoch_and_keeps_progress() {
        let mut d = driver(0.5);
        let before = d.model_state().unwrap();
        let dev = Device::Cpu;
        let bad = Batch::new(
            Tensor::zeros((3, 2), DType::F32, &dev).unwrap(),
            Tensor::zeros(2, DType::U32, &dev).unwrap(),
        );
        let err = d
            .run_epoch(vec![Ok(batch()), Ok(bad), Ok(batch())], Mode::Training)
            .unwrap_err();
        assert!(matches!(err, FitError::Data(_)));
        assert_eq!(d.state(), DriverState::Idle);
        assert_eq!(d.epochs_completed(Mode::Training), 0);
        // The first batch's update is not rolled back.
        assert_ne!(d.model_state().unwrap(), before);
    }

    #[test]
    fn test_parameter_norm_matches_manual_sum() {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        varmap
            .get((2,), "a", candle_nn::Init::Const(3.0), DType::F32, &dev)
            .unwrap();
        varmap
            .get((1,), "b", candle_nn::Init::Const(4.0), DType::F32, &dev)
            .unwrap();
        // sqrt(9 + 9 + 16)
        let norm = parameter_norm(&varmap).unwrap();
        assert!((norm - 34f64.sqrt()).abs() < 1e-9);
    }
}
