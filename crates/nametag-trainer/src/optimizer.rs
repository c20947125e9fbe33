//! Adam with L2 weight decay, grouped parameters and exportable state.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};

/// Adam hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamParams {
    #[serde(rename = "learning_rate")]
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 1e-3,
        }
    }
}

struct ParamState {
    name: String,
    var: Var,
    m: Var,
    v: Var,
}

/// Parameters sharing one learning rate.
pub struct ParamGroup {
    pub lr: f64,
    params: Vec<ParamState>,
}

/// Scalar optimizer state, stored next to the moment tensors in a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamState {
    #[serde(flatten)]
    pub params: AdamParams,
    pub step: usize,
}

pub struct Adam {
    groups: Vec<ParamGroup>,
    params: AdamParams,
    step: usize,
}

impl Adam {
    /// One group holding every named variable.
    pub fn new(vars: Vec<(String, Var)>, params: AdamParams) -> Result<Self> {
        let mut states = Vec::with_capacity(vars.len());
        for (name, var) in vars {
            let m = Var::zeros(var.shape(), var.dtype(), var.device())?;
            let v = Var::zeros(var.shape(), var.dtype(), var.device())?;
            states.push(ParamState { name, var, m, v });
        }
        Ok(Self {
            groups: vec![ParamGroup {
                lr: params.lr,
                params: states,
            }],
            params,
            step: 0,
        })
    }

    pub fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    /// Learning rate of the first group.
    pub fn learning_rate(&self) -> f64 {
        self.groups.first().map_or(self.params.lr, |g| g.lr)
    }

    /// Set the learning rate of every group.
    pub fn set_learning_rate(&mut self, lr: f64) {
        for group in &mut self.groups {
            group.lr = lr;
        }
    }

    pub fn vars(&self) -> impl Iterator<Item = &Var> {
        self.groups.iter().flat_map(|g| g.params.iter().map(|p| &p.var))
    }

    /// Apply one update. Gradients come fresh from each `backward()`, so
    /// there is nothing to zero between steps.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step += 1;
        let AdamParams {
            beta1,
            beta2,
            eps,
            weight_decay,
            ..
        } = self.params;
        let bias1 = 1.0 - beta1.powi(self.step as i32);
        let bias2 = 1.0 - beta2.powi(self.step as i32);

        for group in &self.groups {
            for p in &group.params {
                let Some(grad) = grads.get(p.var.as_tensor()) else {
                    continue;
                };
                let theta = p.var.as_tensor();
                let grad = if weight_decay > 0.0 {
                    (grad + theta.affine(weight_decay, 0.0)?)?
                } else {
                    grad.clone()
                };
                let m = ((p.m.as_tensor() * beta1)? + (&grad * (1.0 - beta1))?)?;
                let v = ((p.v.as_tensor() * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;
                let m_hat = (&m / bias1)?;
                let v_hat = (&v / bias2)?;
                let update = (m_hat / (v_hat.sqrt()? + eps)?)?;
                p.var.set(&(theta - (update * group.lr)?)?)?;
                p.m.set(&m)?;
                p.v.set(&v)?;
            }
        }
        Ok(())
    }

    pub fn state(&self) -> AdamState {
        AdamState {
            params: AdamParams {
                lr: self.learning_rate(),
                ..self.params
            },
            step: self.step,
        }
    }

    /// First and second moments keyed by parameter name.
    pub fn moments(&self) -> (BTreeMap<String, Tensor>, BTreeMap<String, Tensor>) {
        let mut first = BTreeMap::new();
        let mut second = BTreeMap::new();
        for p in self.groups.iter().flat_map(|g| &g.params) {
            first.insert(p.name.clone(), p.m.as_tensor().clone());
            second.insert(p.name.clone(), p.v.as_tensor().clone());
        }
        (first, second)
    }

    /// Restore moments and step count saved by [`Adam::state`] and [`Adam::moments`].
    pub fn restore(
        &mut self,
        state: &AdamState,
        first: &BTreeMap<String, Tensor>,
        second: &BTreeMap<String, Tensor>,
    ) -> Result<()> {
        for p in self.groups.iter().flat_map(|g| &g.params) {
            match (first.get(&p.name), second.get(&p.name)) {
                (Some(m), Some(v)) => {
                    p.m.set(m)?;
                    p.v.set(v)?;
                }
                _ => bail!("optimizer state has no moments for {}", p.name),
            }
        }
        self.params = state.params;
        self.step = state.step;
        self.set_learning_rate(state.params.lr);
        Ok(())
    }
}

/// Rescale every gradient so their joint L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm<'a, I>(vars: I, grads: &mut GradStore, max_norm: f64) -> Result<f64>
where
    I: IntoIterator<Item = &'a Var>,
{
    let vars: Vec<&Var> = vars.into_iter().collect();
    let mut sum_sq = 0.0f64;
    for var in &vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            sum_sq += grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let norm = sum_sq.sqrt();

    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(grad) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), (grad * scale)?);
            }
        }
    }
    Ok(norm)
}
