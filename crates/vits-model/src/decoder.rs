use crate::commons::leaky_relu;
use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{Conv1d, Conv1dConfig, Module, VarBuilder};

const LRELU_SLOPE: f64 = 0.1;
/// `conv_pre` / `conv_post` (カーネル 7) の片側パディング
pub const PRE_PADDING: usize = 3;

/// 残差付き 1D 畳み込み (HiFi-GAN の ResBlock を縮めたもの)
struct ResBlock {
    convs: Vec<Conv1d>,
}

impl ResBlock {
    fn new(channels: usize, kernel_size: usize, num_convs: usize, vs: VarBuilder) -> Result<Self> {
        let cfg = Conv1dConfig {
            padding: kernel_size / 2,
            ..Default::default()
        };
        let mut convs = Vec::with_capacity(num_convs);
        for i in 0..num_convs {
            convs.push(candle_nn::conv1d(channels, channels, kernel_size, cfg, vs.pp(i))?);
        }
        Ok(Self { convs })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut xs = xs.clone();
        for conv in &self.convs {
            let h = conv.forward(&leaky_relu(&xs, LRELU_SLOPE)?)?;
            xs = (h + xs)?;
        }
        Ok(xs)
    }
}

/// 最近傍で時間方向に `rate` 倍してから畳み込むアップサンプラ
struct Upsample {
    conv: Conv1d,
    rate: usize,
}

impl Upsample {
    fn new(in_channels: usize, out_channels: usize, rate: usize, vs: VarBuilder) -> Result<Self> {
        let cfg = Conv1dConfig {
            padding: rate,
            ..Default::default()
        };
        let conv = candle_nn::conv1d(in_channels, out_channels, rate * 2 + 1, cfg, vs)?;
        Ok(Self { conv, rate })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, c, t) = xs.dims3()?;
        let xs = xs
            .unsqueeze(3)?
            .broadcast_as((b, c, t, self.rate))?
            .reshape((b, c, t * self.rate))?;
        Ok(self.conv.forward(&xs)?)
    }
}

/// 潜在変数 `[batch, inter, frames]` を波形 `[batch, 1, frames * hop]` に変換するデコーダ
pub struct WaveDecoder {
    conv_pre: Conv1d,
    ups: Vec<Upsample>,
    resblocks: Vec<ResBlock>,
    conv_post: Conv1d,
    cond: Option<Conv1d>,
}

impl WaveDecoder {
    pub fn new(
        in_channels: usize,
        upsample_rates: &[usize],
        upsample_initial_channel: usize,
        gin_channels: Option<usize>,
        vs: VarBuilder,
    ) -> Result<Self> {
        let pre_cfg = Conv1dConfig {
            padding: PRE_PADDING,
            ..Default::default()
        };
        let conv_pre = candle_nn::conv1d(in_channels, upsample_initial_channel, 7, pre_cfg, vs.pp("conv_pre"))?;

        let mut ups = Vec::with_capacity(upsample_rates.len());
        let mut resblocks = Vec::with_capacity(upsample_rates.len());
        let mut ch = upsample_initial_channel;
        for (i, &rate) in upsample_rates.iter().enumerate() {
            let out_ch = ch / 2;
            ups.push(Upsample::new(ch, out_ch, rate, vs.pp("ups").pp(i))?);
            resblocks.push(ResBlock::new(out_ch, 3, 2, vs.pp("resblocks").pp(i))?);
            ch = out_ch;
        }

        let conv_post = candle_nn::conv1d(ch, 1, 7, pre_cfg, vs.pp("conv_post"))?;
        let cond = match gin_channels {
            Some(gin) => Some(candle_nn::conv1d(
                gin,
                upsample_initial_channel,
                1,
                Default::default(),
                vs.pp("cond"),
            )?),
            None => None,
        };
        Ok(Self {
            conv_pre,
            ups,
            resblocks,
            conv_post,
            cond,
        })
    }

    /// 逆伝播に必要な最小フレーム数。これ以下だと `conv_pre` の勾配計算で長さが負になる。
    pub fn min_backward_frames() -> usize {
        2 * PRE_PADDING + 1
    }

    pub fn forward(&self, z: &Tensor, g: Option<&Tensor>) -> Result<Tensor> {
        let mut xs = self.conv_pre.forward(&z.contiguous()?)?;
        if let (Some(cond), Some(g)) = (&self.cond, g) {
            xs = xs.broadcast_add(&cond.forward(g)?)?;
        }
        for (up, res) in self.ups.iter().zip(&self.resblocks) {
            xs = up.forward(&leaky_relu(&xs, LRELU_SLOPE)?)?;
            xs = res.forward(&xs)?;
        }
        let xs = leaky_relu(&xs, 0.01)?;
        Ok(self.conv_post.forward(&xs)?.tanh()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_upsampling_matches_hop() -> Result<()> {
        let device = Device::Cpu;
        let vs = VarBuilder::zeros(DType::F32, &device);
        let dec = WaveDecoder::new(4, &[4, 3, 2], 16, None, vs)?;
        let z = Tensor::zeros((2, 4, 5), DType::F32, &device)?;
        let wav = dec.forward(&z, None)?;
        assert_eq!(wav.dims(), &[2, 1, 5 * 24]);
        Ok(())
    }
}
