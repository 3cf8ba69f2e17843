//! 混合精度学習用の動的損失スケーラ
//!
//! 1 バッチの流れは
//! `scale -> unscale(D) -> step(D) -> scale -> unscale(G) -> step(G) -> update`。
//! 順序違反は `TrainError::ScalerState` になる。

use crate::error::{Result, TrainError};
use crate::nets::NetRole;
use crate::optim::{AdamW, GradMap};
use candle_core::{DType, Tensor};

const INIT_SCALE: f64 = 65536.0;
const GROWTH_FACTOR: f64 = 2.0;
const BACKOFF_FACTOR: f64 = 0.5;
const GROWTH_INTERVAL: u32 = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalerPhase {
    Idle,
    Scaled,
    Unscaled,
    Stepped,
    Updated,
}

#[derive(Debug, Default, Clone, Copy)]
struct RoleState {
    /// unscale 済みなら非有限勾配を見つけたかどうか
    found_inf: Option<bool>,
    stepped: bool,
}

pub struct LossScaler {
    enabled: bool,
    scale: f64,
    growth_tracker: u32,
    phase: ScalerPhase,
    pending: Option<NetRole>,
    generator: RoleState,
    discriminator: RoleState,
}

impl LossScaler {
    /// 無効時はスケール 1 で、ステップを飛ばすこともない
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            scale: if enabled { INIT_SCALE } else { 1.0 },
            growth_tracker: 0,
            phase: ScalerPhase::Idle,
            pending: None,
            generator: RoleState::default(),
            discriminator: RoleState::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn scale_value(&self) -> f64 {
        self.scale
    }

    pub fn phase(&self) -> ScalerPhase {
        self.phase
    }

    fn role_mut(&mut self, role: NetRole) -> &mut RoleState {
        match role {
            NetRole::Generator => &mut self.generator,
            NetRole::Discriminator => &mut self.discriminator,
        }
    }

    fn expect_phase(&self, op: &str, allowed: &[ScalerPhase]) -> Result<()> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(TrainError::ScalerState(format!(
                "`{}` called in phase {:?}",
                op, self.phase
            )))
        }
    }

    /// 損失にスケールを掛ける
    pub fn scale(&mut self, loss: &Tensor) -> Result<Tensor> {
        self.expect_phase(
            "scale",
            &[ScalerPhase::Idle, ScalerPhase::Updated, ScalerPhase::Stepped],
        )?;
        self.phase = ScalerPhase::Scaled;
        if self.enabled {
            Ok((loss * self.scale)?)
        } else {
            Ok(loss.clone())
        }
    }

    /// 勾配をスケールで割り戻し、非有限値の有無を記録する
    pub fn unscale(&mut self, role: NetRole, grads: &mut GradMap) -> Result<()> {
        self.expect_phase("unscale", &[ScalerPhase::Scaled])?;
        let state = *self.role_mut(role);
        if state.found_inf.is_some() || state.stepped {
            return Err(TrainError::ScalerState(format!(
                "{} gradients already unscaled in this batch",
                role
            )));
        }
        let mut found_inf = false;
        if self.enabled {
            let inv = 1.0 / self.scale;
            for g in grads.values_mut() {
                *g = (&*g * inv)?;
                let s = g.to_dtype(DType::F32)?.sum_all()?.to_scalar::<f32>()?;
                if !s.is_finite() {
                    found_inf = true;
                }
            }
        }
        self.role_mut(role).found_inf = Some(found_inf);
        self.pending = Some(role);
        self.phase = ScalerPhase::Unscaled;
        Ok(())
    }

    /// 勾配が有限なら最適化器を進める。飛ばした場合は `false`。
    pub fn step(&mut self, role: NetRole, optim: &mut AdamW, grads: &GradMap) -> Result<bool> {
        self.expect_phase("step", &[ScalerPhase::Unscaled])?;
        if self.pending != Some(role) {
            return Err(TrainError::ScalerState(format!(
                "step for {} but last unscale was for {:?}",
                role, self.pending
            )));
        }
        let found_inf = self.role_mut(role).found_inf.unwrap_or(false);
        let applied = if found_inf {
            tracing::warn!(%role, scale = self.scale, "non-finite gradients, skipping optimizer step");
            false
        } else {
            optim.step(grads)?;
            true
        };
        self.role_mut(role).stepped = true;
        self.pending = None;
        self.phase = ScalerPhase::Stepped;
        Ok(applied)
    }

    /// バッチ末尾で 1 回だけ呼ぶ。両方の最適化器のステップ後でなければならない。
    pub fn update(&mut self) -> Result<()> {
        self.expect_phase("update", &[ScalerPhase::Stepped])?;
        if !(self.generator.stepped && self.discriminator.stepped) {
            return Err(TrainError::ScalerState(
                "update requires both optimizers to have stepped".into(),
            ));
        }
        if self.enabled {
            let found_inf = self.generator.found_inf == Some(true) || self.discriminator.found_inf == Some(true);
            if found_inf {
                self.scale *= BACKOFF_FACTOR;
                self.growth_tracker = 0;
            } else {
                self.growth_tracker += 1;
                if self.growth_tracker == GROWTH_INTERVAL {
                    self.scale *= GROWTH_FACTOR;
                    self.growth_tracker = 0;
                }
            }
        }
        self.generator = RoleState::default();
        self.discriminator = RoleState::default();
        self.phase = ScalerPhase::Updated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::AdamWConfig;
    use candle_core::{Device, Var};

    fn optim() -> Result<(Var, AdamW)> {
        let var = Var::new(&[1f32], &Device::Cpu)?;
        let opt = AdamW::new(
            vec![("w".to_string(), var.clone())],
            AdamWConfig {
                lr: 0.1,
                beta1: 0.8,
                beta2: 0.99,
                eps: 1e-9,
                weight_decay: 0.0,
            },
        )?;
        Ok((var, opt))
    }

    fn grads(v: f32) -> Result<GradMap> {
        let mut g = GradMap::new();
        g.insert("w".to_string(), Tensor::new(&[v], &Device::Cpu)?);
        Ok(g)
    }

    fn run_batch(scaler: &mut LossScaler, d_grad: f32, g_grad: f32) -> Result<(bool, bool)> {
        let (_vd, mut opt_d) = optim()?;
        let (_vg, mut opt_g) = optim()?;
        let loss = Tensor::new(1f32, &Device::Cpu)?;

        scaler.scale(&loss)?;
        let mut gd = grads(d_grad)?;
        scaler.unscale(NetRole::Discriminator, &mut gd)?;
        let d = scaler.step(NetRole::Discriminator, &mut opt_d, &gd)?;

        scaler.scale(&loss)?;
        let mut gg = grads(g_grad)?;
        scaler.unscale(NetRole::Generator, &mut gg)?;
        let g = scaler.step(NetRole::Generator, &mut opt_g, &gg)?;
        scaler.update()?;
        Ok((d, g))
    }

    #[test]
    fn test_disabled_scaler_is_identity() -> Result<()> {
        let mut scaler = LossScaler::new(false);
        let loss = Tensor::new(3f32, &Device::Cpu)?;
        let scaled = scaler.scale(&loss)?;
        assert_eq!(scaled.to_scalar::<f32>()?, 3.0);
        assert_eq!(scaler.scale_value(), 1.0);
        // 無効時は勾配を検査しないので NaN でもステップする
        let (_v, mut opt) = optim()?;
        let mut g = grads(f32::NAN)?;
        scaler.unscale(NetRole::Discriminator, &mut g)?;
        assert!(scaler.step(NetRole::Discriminator, &mut opt, &g)?);
        Ok(())
    }

    #[test]
    fn test_unscale_divides_by_scale() -> Result<()> {
        let mut scaler = LossScaler::new(true);
        let loss = Tensor::new(1f32, &Device::Cpu)?;
        let scaled = scaler.scale(&loss)?;
        assert_eq!(scaled.to_scalar::<f32>()?, 65536.0);
        let mut g = grads(65536.0)?;
        scaler.unscale(NetRole::Discriminator, &mut g)?;
        assert_eq!(g["w"].to_vec1::<f32>()?, vec![1.0]);
        Ok(())
    }

    #[test]
    fn test_overflow_skips_step_and_backs_off() -> Result<()> {
        let mut scaler = LossScaler::new(true);
        let (d, g) = run_batch(&mut scaler, f32::INFINITY, 1.0)?;
        assert!(!d);
        assert!(g);
        assert_eq!(scaler.scale_value(), 32768.0);
        assert_eq!(scaler.phase(), ScalerPhase::Updated);

        let (d, g) = run_batch(&mut scaler, 1.0, f32::NAN)?;
        assert!(d);
        assert!(!g);
        assert_eq!(scaler.scale_value(), 16384.0);
        Ok(())
    }

    #[test]
    fn test_growth_after_interval() -> Result<()> {
        let mut scaler = LossScaler::new(true);
        for _ in 0..GROWTH_INTERVAL {
            run_batch(&mut scaler, 1.0, 1.0)?;
        }
        assert_eq!(scaler.scale_value(), INIT_SCALE * GROWTH_FACTOR);
        Ok(())
    }

    #[test]
    fn test_out_of_order_calls_rejected() -> Result<()> {
        let mut scaler = LossScaler::new(true);
        let (_v, mut opt) = optim()?;
        let g = grads(1.0)?;
        // scale 前の step / update
        assert!(matches!(
            scaler.step(NetRole::Generator, &mut opt, &g),
            Err(TrainError::ScalerState(_))
        ));
        assert!(scaler.update().is_err());

        // D だけ進めて update
        let loss = Tensor::new(1f32, &Device::Cpu)?;
        scaler.scale(&loss)?;
        let mut gd = grads(1.0)?;
        scaler.unscale(NetRole::Discriminator, &mut gd)?;
        assert!(scaler.step(NetRole::Generator, &mut opt, &gd).is_err());
        scaler.step(NetRole::Discriminator, &mut opt, &gd)?;
        assert!(matches!(scaler.update(), Err(TrainError::ScalerState(_))));
        Ok(())
    }
}
