//! AdamW (重み減衰分離型) と指数減衰スケジューラ
//!
//! 最適化器の状態はテンソルとして書き出せ、チェックポイント経由で復元できる。

use crate::error::{Result, TrainError};
use candle_core::{DType, Device, Tensor, Var};
use std::collections::HashMap;

/// パラメータ名から勾配への対応
pub type GradMap = HashMap<String, Tensor>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamWConfig {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub weight_decay: f64,
}

struct ParamState {
    var: Var,
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

pub struct AdamW {
    params: Vec<(String, ParamState)>,
    config: AdamWConfig,
    step: u64,
}

impl AdamW {
    /// 状態は全パラメータについて 0 で初期化する
    pub fn new(vars: Vec<(String, Var)>, config: AdamWConfig) -> Result<Self> {
        let mut params = Vec::with_capacity(vars.len());
        for (name, var) in vars {
            let exp_avg = var.zeros_like()?;
            let exp_avg_sq = var.zeros_like()?;
            params.push((
                name,
                ParamState {
                    var,
                    exp_avg,
                    exp_avg_sq,
                },
            ));
        }
        Ok(Self { params, config, step: 0 })
    }

    pub fn learning_rate(&self) -> f64 {
        self.config.lr
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.config.lr = lr;
    }

    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// 勾配のないパラメータは更新しない
    pub fn step(&mut self, grads: &GradMap) -> Result<()> {
        if let Some(unknown) = grads.keys().find(|k| !self.params.iter().any(|(n, _)| n == *k)) {
            return Err(TrainError::StateMismatch(format!(
                "gradient for unknown parameter `{}`",
                unknown
            )));
        }
        self.step += 1;
        let AdamWConfig {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.config;
        let bias1 = 1.0 - beta1.powi(self.step as i32);
        let bias2 = 1.0 - beta2.powi(self.step as i32);
        let step_size = lr / bias1;
        let bias2_sqrt = bias2.sqrt();

        for (name, state) in self.params.iter_mut() {
            let Some(g) = grads.get(name) else {
                continue;
            };
            let g = g.to_dtype(state.var.dtype())?;
            let theta = state.var.as_tensor();
            let theta = (theta * (1.0 - lr * weight_decay))?;
            let exp_avg = ((&state.exp_avg * beta1)? + (&g * (1.0 - beta1))?)?;
            let exp_avg_sq = ((&state.exp_avg_sq * beta2)? + (g.sqr()? * (1.0 - beta2))?)?;
            let denom = ((exp_avg_sq.sqrt()? / bias2_sqrt)? + eps)?;
            let update = ((&exp_avg / denom)? * step_size)?;
            state.var.set(&(theta - update)?)?;
            state.exp_avg = exp_avg;
            state.exp_avg_sq = exp_avg_sq;
        }
        Ok(())
    }

    /// `exp_avg.<name>`, `exp_avg_sq.<name>`, `step`, `lr`
    pub fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let mut out = HashMap::with_capacity(self.params.len() * 2 + 2);
        for (name, state) in &self.params {
            out.insert(format!("exp_avg.{}", name), state.exp_avg.detach());
            out.insert(format!("exp_avg_sq.{}", name), state.exp_avg_sq.detach());
        }
        out.insert("step".to_string(), Tensor::new(&[self.step as i64], &Device::Cpu)?);
        out.insert("lr".to_string(), Tensor::new(&[self.config.lr], &Device::Cpu)?);
        Ok(out)
    }

    /// パラメータ集合が名前・形状とも 1 対 1 で一致しなければエラー
    pub fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        let expected = self.params.len() * 2 + 2;
        if state.len() != expected {
            return Err(TrainError::StateMismatch(format!(
                "optimizer state has {} entries, expected {}",
                state.len(),
                expected
            )));
        }
        let fetch = |key: &str| {
            state
                .get(key)
                .ok_or_else(|| TrainError::StateMismatch(format!("optimizer state entry `{}` missing", key)))
        };

        let mut restored = Vec::with_capacity(self.params.len());
        for (name, p) in &self.params {
            let load = |prefix: &str| -> Result<Tensor> {
                let key = format!("{}.{}", prefix, name);
                let t = fetch(&key)?;
                if t.dims() != p.var.dims() {
                    return Err(TrainError::StateMismatch(format!(
                        "optimizer state `{}` has shape {:?}, parameter has {:?}",
                        key,
                        t.dims(),
                        p.var.dims()
                    )));
                }
                Ok(t.to_device(p.var.device())?.to_dtype(p.var.dtype())?)
            };
            restored.push((load("exp_avg")?, load("exp_avg_sq")?));
        }
        let step = fetch("step")?.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?;
        let lr = fetch("lr")?.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
        let (Some(&step), Some(&lr)) = (step.first(), lr.first()) else {
            return Err(TrainError::StateMismatch("optimizer step/lr entries are empty".into()));
        };

        for ((_, p), (exp_avg, exp_avg_sq)) in self.params.iter_mut().zip(restored) {
            p.exp_avg = exp_avg;
            p.exp_avg_sq = exp_avg_sq;
        }
        self.step = step.max(0) as u64;
        self.config.lr = lr;
        Ok(())
    }
}

/// `lr(epoch) = base_lr * gamma^epoch` を返す指数減衰スケジューラ
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialLr {
    base_lr: f64,
    gamma: f64,
    last_epoch: i64,
}

impl ExponentialLr {
    /// `last_epoch` は最後に完了したエポック。新規学習なら -1。
    pub fn new(base_lr: f64, gamma: f64, last_epoch: i64) -> Self {
        Self {
            base_lr,
            gamma,
            last_epoch,
        }
    }

    /// 次のエポックで使う学習率
    pub fn lr(&self) -> f64 {
        self.base_lr * self.gamma.powi((self.last_epoch + 1).max(0) as i32)
    }

    pub fn step(&mut self) {
        self.last_epoch += 1;
    }

    pub fn last_epoch(&self) -> i64 {
        self.last_epoch
    }
}

/// 要素ごとに `[-clip, clip]` へ丸め、丸める前の全体 L2 ノルムを返す。
/// `clip` が `None` なら勾配は変更しない。
pub fn clip_grad_value(grads: &mut GradMap, clip: Option<f64>) -> Result<f64> {
    let mut total = 0f64;
    for g in grads.values() {
        let sq = g.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()?;
        total += sq as f64;
    }
    if let Some(c) = clip {
        for g in grads.values_mut() {
            *g = g.clamp(-c, c)?;
        }
    }
    Ok(total.sqrt())
}
