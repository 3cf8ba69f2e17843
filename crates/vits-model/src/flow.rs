use crate::commons::flip_channels;
use crate::encoder::ConvStack;
use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{Conv1d, Module, VarBuilder};

/// 平均のみのアフィンカップリング層 (体積保存)
struct CouplingLayer {
    pre: Conv1d,
    enc: ConvStack,
    post: Conv1d,
    half_channels: usize,
}

impl CouplingLayer {
    fn new(
        channels: usize,
        hidden_channels: usize,
        kernel_size: usize,
        num_layers: usize,
        gin_channels: Option<usize>,
        vs: VarBuilder,
    ) -> Result<Self> {
        let half_channels = channels / 2;
        let pre = candle_nn::conv1d(half_channels, hidden_channels, 1, Default::default(), vs.pp("pre"))?;
        let enc = ConvStack::new(hidden_channels, kernel_size, num_layers, 0.0, gin_channels, vs.pp("enc"))?;
        // 恒等写像から学習を始めるため出力層はゼロ初期化
        let post_w = vs.pp("post").get_with_hints(
            (half_channels, hidden_channels, 1),
            "weight",
            candle_nn::Init::Const(0.0),
        )?;
        let post_b = vs.pp("post").get_with_hints(half_channels, "bias", candle_nn::Init::Const(0.0))?;
        let post = Conv1d::new(post_w, Some(post_b), Default::default());
        Ok(Self {
            pre,
            enc,
            post,
            half_channels,
        })
    }

    fn forward(&self, x: &Tensor, mask: &Tensor, g: Option<&Tensor>, reverse: bool) -> Result<Tensor> {
        let x0 = x.narrow(1, 0, self.half_channels)?.contiguous()?;
        let x1 = x.narrow(1, self.half_channels, self.half_channels)?;
        let h = self.pre.forward(&x0)?.broadcast_mul(mask)?;
        let h = self.enc.forward(&h, mask, g, false)?;
        let m = self.post.forward(&h)?.broadcast_mul(mask)?;
        let x1 = if reverse {
            (x1 - m)?.broadcast_mul(mask)?
        } else {
            (m + x1.broadcast_mul(mask)?)?
        };
        Ok(Tensor::cat(&[&x0, &x1], 1)?)
    }
}

/// カップリング層とチャネル反転を交互に重ねた正規化フロー
pub struct ResidualCouplingBlock {
    layers: Vec<CouplingLayer>,
}

impl ResidualCouplingBlock {
    pub fn new(
        channels: usize,
        hidden_channels: usize,
        kernel_size: usize,
        num_layers: usize,
        n_flows: usize,
        gin_channels: Option<usize>,
        vs: VarBuilder,
    ) -> Result<Self> {
        let mut layers = Vec::with_capacity(n_flows);
        let flows_vs = vs.pp("flows");
        for i in 0..n_flows {
            layers.push(CouplingLayer::new(
                channels,
                hidden_channels,
                kernel_size,
                num_layers,
                gin_channels,
                flows_vs.pp(i),
            )?);
        }
        Ok(Self { layers })
    }

    /// z (事後) -> z_p (事前側)
    pub fn forward(&self, x: &Tensor, mask: &Tensor, g: Option<&Tensor>) -> Result<Tensor> {
        let mut x = x.clone();
        for layer in &self.layers {
            x = layer.forward(&x, mask, g, false)?;
            x = flip_channels(&x)?;
        }
        Ok(x)
    }

    /// z_p -> z
    pub fn reverse(&self, x: &Tensor, mask: &Tensor, g: Option<&Tensor>) -> Result<Tensor> {
        let mut x = x.clone();
        for layer in self.layers.iter().rev() {
            x = flip_channels(&x)?;
            x = layer.forward(&x, mask, g, true)?;
        }
        Ok(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn test_flow_is_invertible() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let flow = ResidualCouplingBlock::new(4, 8, 3, 1, 2, None, vs)?;
        // ゼロ初期化の出力層に値を入れて非自明な変換にする
        for (name, var) in varmap.data().lock().unwrap().iter() {
            if name.contains("post") {
                var.set(&var.ones_like()?)?;
            }
        }
        let x = Tensor::randn(0f32, 1f32, (1, 4, 5), &device)?;
        let mask = Tensor::ones((1, 1, 5), DType::F32, &device)?;
        let z_p = flow.forward(&x, &mask, None)?;
        let back = flow.reverse(&z_p, &mask, None)?;
        let diff = (back - &x)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-4, "flow inverse error {}", diff);
        Ok(())
    }
}
