use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{Conv1d, Conv1dConfig, LayerNorm, Module, VarBuilder};

/// 対数継続長を回帰する決定的な継続長予測器
pub struct DurationPredictor {
    convs: Vec<(Conv1d, LayerNorm)>,
    proj: Conv1d,
    cond: Option<Conv1d>,
    p_dropout: f64,
}

impl DurationPredictor {
    pub fn new(
        in_channels: usize,
        filter_channels: usize,
        kernel_size: usize,
        p_dropout: f64,
        gin_channels: Option<usize>,
        vs: VarBuilder,
    ) -> Result<Self> {
        let cfg = Conv1dConfig {
            padding: kernel_size / 2,
            ..Default::default()
        };
        let mut convs = Vec::with_capacity(2);
        for (i, in_ch) in [in_channels, filter_channels].into_iter().enumerate() {
            let conv = candle_nn::conv1d(in_ch, filter_channels, kernel_size, cfg, vs.pp(format!("conv_{}", i)))?;
            let norm = candle_nn::layer_norm(filter_channels, 1e-5, vs.pp(format!("norm_{}", i)))?;
            convs.push((conv, norm));
        }
        let proj = candle_nn::conv1d(filter_channels, 1, 1, Default::default(), vs.pp("proj"))?;
        let cond = match gin_channels {
            Some(gin) => Some(candle_nn::conv1d(gin, in_channels, 1, Default::default(), vs.pp("cond"))?),
            None => None,
        };
        Ok(Self {
            convs,
            proj,
            cond,
            p_dropout,
        })
    }

    /// `x`: `[batch, in, t_x]`、戻り値は `[batch, 1, t_x]` の対数継続長
    pub fn forward(&self, x: &Tensor, mask: &Tensor, g: Option<&Tensor>, training: bool) -> Result<Tensor> {
        let mut h = match (&self.cond, g) {
            (Some(cond), Some(g)) => x.broadcast_add(&cond.forward(g)?)?,
            _ => x.clone(),
        };
        for (conv, norm) in &self.convs {
            h = conv.forward(&h.broadcast_mul(mask)?)?.relu()?;
            h = norm.forward(&h.transpose(1, 2)?)?.transpose(1, 2)?;
            if training && self.p_dropout > 0.0 {
                h = candle_nn::ops::dropout(&h, self.p_dropout as f32)?;
            }
        }
        let out = self.proj.forward(&h.broadcast_mul(mask)?.contiguous()?)?;
        Ok(out.broadcast_mul(mask)?)
    }
}
