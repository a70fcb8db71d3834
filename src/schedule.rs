use burn::{config::Config, lr_scheduler::LrScheduler, tensor::backend::Backend, LearningRate};

/// The configuration for creating an [inverse time decay](InverseTimeDecay) scheduler.
///
/// At iteration `i` the learning rate is
/// `initial_lr / (1 + decay_rate * (offset + i / decay_steps))`, with an integer division.
/// A frozen scheduler keeps the decay term at `offset`.
#[derive(Config, Debug)]
pub struct InverseTimeDecayConfig {
    /// The initial learning rate.
    pub initial_lr: LearningRate,
    #[config(default = 1.0)]
    pub decay_rate: f64,
    /// Number of iterations between two decay steps.
    #[config(default = 1)]
    pub decay_steps: usize,
    /// Decay steps already elapsed when training starts.
    #[config(default = 0)]
    pub offset: usize,
    #[config(default = false)]
    pub frozen: bool,
}

impl InverseTimeDecayConfig {
    /// Initializes an [inverse time decay scheduler](InverseTimeDecay).
    ///
    /// # Panics
    /// This function panics if `initial_lr` is not positive, `decay_rate` is negative or
    /// `decay_steps` is zero.
    pub fn init(&self) -> InverseTimeDecay {
        assert!(
            self.initial_lr > 0.,
            "Initial learning rate must be greater than 0"
        );
        assert!(self.decay_rate >= 0., "Decay rate must not be negative");
        assert!(self.decay_steps > 0, "Decay steps must be greater than 0");

        InverseTimeDecay {
            initial_lr: self.initial_lr,
            decay_rate: self.decay_rate,
            decay_steps: self.decay_steps,
            offset: self.offset,
            frozen: self.frozen,
            iteration: 0,
        }
    }
}

/// Inverse time decay learning rate scheduler.
///
/// See [InverseTimeDecayConfig] for more information.
#[derive(Clone, Copy, Debug)]
pub struct InverseTimeDecay {
    initial_lr: LearningRate,
    decay_rate: f64,
    decay_steps: usize,
    offset: usize,
    frozen: bool,
    iteration: usize,
}

impl InverseTimeDecay {
    fn lr_at(&self, iteration: usize) -> LearningRate {
        let elapsed = if self.frozen {
            self.offset
        } else {
            self.offset + iteration / self.decay_steps
        };

        self.initial_lr / (1.0 + self.decay_rate * elapsed as f64)
    }
}

impl LrScheduler for InverseTimeDecay {
    type Record<B: Backend> = usize;

    fn step(&mut self) -> LearningRate {
        let lr = self.lr_at(self.iteration);
        self.iteration += 1;
        lr
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        self.iteration
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        self.iteration = record;
        self
    }
}

/// Learning rate policy of a training run: a constant rate or an inverse time decay.
#[derive(Clone, Copy, Debug)]
pub enum LearningRateSchedule {
    Constant(LearningRate),
    InverseTimeDecay(InverseTimeDecay),
}

impl LrScheduler for LearningRateSchedule {
    type Record<B: Backend> = usize;

    fn step(&mut self) -> LearningRate {
        match self {
            LearningRateSchedule::Constant(lr) => *lr,
            LearningRateSchedule::InverseTimeDecay(scheduler) => scheduler.step(),
        }
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        match self {
            LearningRateSchedule::Constant(_) => 0,
            LearningRateSchedule::InverseTimeDecay(scheduler) => scheduler.to_record::<B>(),
        }
    }

    fn load_record<B: Backend>(self, record: Self::Record<B>) -> Self {
        match self {
            LearningRateSchedule::Constant(_) => self,
            LearningRateSchedule::InverseTimeDecay(scheduler) => {
                LearningRateSchedule::InverseTimeDecay(scheduler.load_record::<B>(record))
            }
        }
    }
}
