use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, Zip};
use std::collections::HashMap;
use tracing::debug;

use super::config::{LrSchedule, OptimizerType};

/// Trait pour les optimiseurs
///
/// Chaque paramètre est identifié par un nom stable (`"digitcaps.weights"`, ...)
/// pour que l'état interne (moments, vélocité) lui reste attaché.
pub trait Optimizer: Send + Sync {
    fn step(&mut self, param_id: &str, param: ArrayViewMutD<'_, f32>, grad: ArrayViewD<'_, f32>);
    fn get_lr(&self) -> f32;
    fn set_lr(&mut self, lr: f32);
}

/// Construit l'optimiseur décrit par la configuration
pub fn build_optimizer(optimizer_type: &OptimizerType, learning_rate: f32) -> Box<dyn Optimizer> {
    match *optimizer_type {
        OptimizerType::Adam {
            beta1,
            beta2,
            epsilon,
        } => Box::new(Adam::new(learning_rate, beta1, beta2, epsilon)),
        OptimizerType::SGD { momentum } => Box::new(SGD::new(learning_rate, momentum)),
    }
}

/// Optimiseur SGD avec momentum
pub struct SGD {
    learning_rate: f32,
    momentum: f32,
    velocity: HashMap<String, ArrayD<f32>>,
}

impl SGD {
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: HashMap::new(),
        }
    }
}

impl Optimizer for SGD {
    fn step(&mut self, param_id: &str, mut param: ArrayViewMutD<'_, f32>, grad: ArrayViewD<'_, f32>) {
        let velocity = self
            .velocity
            .entry(param_id.to_string())
            .or_insert_with(|| ArrayD::zeros(param.raw_dim()));

        // v = momentum * v - lr * grad ; param += v
        let (momentum, lr) = (self.momentum, self.learning_rate);
        Zip::from(&mut param)
            .and(velocity)
            .and(&grad)
            .for_each(|p, v, &g| {
                *v = momentum * *v - lr * g;
                *p += *v;
            });
    }

    fn get_lr(&self) -> f32 {
        self.learning_rate
    }

    fn set_lr(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}

struct AdamState {
    m: ArrayD<f32>,
    v: ArrayD<f32>,
    timestep: i32,
}

/// Optimiseur Adam
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    states: HashMap<String, AdamState>,
}

impl Adam {
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            states: HashMap::new(),
        }
    }
}

impl Optimizer for Adam {
    fn step(&mut self, param_id: &str, mut param: ArrayViewMutD<'_, f32>, grad: ArrayViewD<'_, f32>) {
        let state = self
            .states
            .entry(param_id.to_string())
            .or_insert_with(|| AdamState {
                m: ArrayD::zeros(param.raw_dim()),
                v: ArrayD::zeros(param.raw_dim()),
                timestep: 0,
            });
        state.timestep += 1;

        // Correction du biais repliée dans le pas
        let t = state.timestep;
        let step_size = self.learning_rate * (1.0 - self.beta2.powi(t)).sqrt()
            / (1.0 - self.beta1.powi(t));
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);

        Zip::from(&mut param)
            .and(&mut state.m)
            .and(&mut state.v)
            .and(&grad)
            .for_each(|p, m, v, &g| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                *p -= step_size * *m / (v.sqrt() + epsilon);
            });
    }

    fn get_lr(&self) -> f32 {
        self.learning_rate
    }

    fn set_lr(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}

impl LrSchedule {
    /// Learning rate de l'époque `epoch` (indexée à partir de 0)
    pub fn learning_rate(&self, initial_lr: f32, epoch: usize) -> f32 {
        match *self {
            LrSchedule::Constant => initial_lr,
            LrSchedule::ExponentialDecay { decay_epochs } => {
                initial_lr * (-(epoch as f32) / decay_epochs).exp()
            }
            LrSchedule::StepDecay { step_size, gamma } => {
                initial_lr * gamma.powi((epoch / step_size) as i32)
            }
        }
    }

    /// Applique le planning à l'optimiseur au début d'une époque
    pub fn apply(&self, optimizer: &mut dyn Optimizer, initial_lr: f32, epoch: usize) -> f32 {
        let lr = self.learning_rate(initial_lr, epoch);
        optimizer.set_lr(lr);
        debug!(epoch, lr, "learning rate mis à jour");
        lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::ArrayD;
    use ndarray::IxDyn;

    #[test]
    fn test_sgd_momentum() {
        let mut optimizer = SGD::new(0.01, 0.9);
        let mut param = ArrayD::ones(IxDyn(&[2, 2, 2, 2]));
        let grad = ArrayD::ones(IxDyn(&[2, 2, 2, 2]));

        optimizer.step("test_param", param.view_mut(), grad.view());
        assert_abs_diff_eq!(param[[0, 0, 0, 0]], 0.99, epsilon = 1e-6);

        // Le momentum amplifie le second pas
        optimizer.step("test_param", param.view_mut(), grad.view());
        assert_abs_diff_eq!(param[[0, 0, 0, 0]], 0.99 - 0.019, epsilon = 1e-6);
    }

    #[test]
    fn test_adam_first_step_is_lr() {
        let mut optimizer = Adam::new(0.001, 0.9, 0.999, 1e-7);
        let mut param = ArrayD::ones(IxDyn(&[3]));
        let grad = ArrayD::from_elem(IxDyn(&[3]), 5.0);

        optimizer.step("test_param", param.view_mut(), grad.view());

        // Premier pas d'Adam: lr * sign(grad)
        for &p in param.iter() {
            assert_abs_diff_eq!(p, 0.999, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_adam_states_are_per_parameter() {
        let mut optimizer = Adam::new(0.1, 0.9, 0.999, 1e-7);
        let mut a = ArrayD::zeros(IxDyn(&[1]));
        let mut b = ArrayD::zeros(IxDyn(&[2]));
        let ga = ArrayD::from_elem(IxDyn(&[1]), 1.0);
        let gb = ArrayD::from_elem(IxDyn(&[2]), -1.0);

        optimizer.step("a", a.view_mut(), ga.view());
        optimizer.step("b", b.view_mut(), gb.view());

        assert_abs_diff_eq!(a[[0]], -0.1, epsilon = 1e-4);
        assert_abs_diff_eq!(b[[1]], 0.1, epsilon = 1e-4);
    }

    #[test]
    fn test_exponential_decay() {
        let schedule = LrSchedule::ExponentialDecay { decay_epochs: 10.0 };
        assert_abs_diff_eq!(schedule.learning_rate(0.001, 0), 0.001);
        assert_abs_diff_eq!(
            schedule.learning_rate(0.001, 10),
            0.001 * (-1.0f32).exp(),
            epsilon = 1e-9
        );
    }

    #[test]
    fn test_step_decay_sets_optimizer_lr() {
        let schedule = LrSchedule::StepDecay {
            step_size: 5,
            gamma: 0.5,
        };
        let mut optimizer = build_optimizer(&OptimizerType::SGD { momentum: 0.0 }, 0.1);
        let lr = schedule.apply(optimizer.as_mut(), 0.1, 11);
        assert_abs_diff_eq!(lr, 0.025, epsilon = 1e-7);
        assert_abs_diff_eq!(optimizer.get_lr(), 0.025, epsilon = 1e-7);
    }
}
