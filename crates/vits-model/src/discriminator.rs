use crate::commons::{leaky_relu, reflect_pad_last};
use crate::config::DiscriminatorConfig;
use anyhow::Result;
use candle_core::Tensor;
use candle_nn::{Conv1d, Conv1dConfig, Module, VarBuilder};

const LRELU_SLOPE: f64 = 0.1;

/// 識別器の出力。各サブ識別器ごとにスコアと中間特徴マップを持つ。
pub struct DiscriminatorOutput {
    pub real: Vec<Tensor>,
    pub fake: Vec<Tensor>,
    pub fmap_real: Vec<Vec<Tensor>>,
    pub fmap_fake: Vec<Vec<Tensor>>,
}

fn grouped(in_ch: usize, out_ch: usize) -> usize {
    if in_ch >= 4 && in_ch % 4 == 0 && out_ch % (in_ch / 4) == 0 {
        in_ch / 4
    } else {
        1
    }
}

/// 波形をそのまま見るスケール識別器
struct ScaleDiscriminator {
    convs: Vec<Conv1d>,
    post: Conv1d,
}

impl ScaleDiscriminator {
    fn new(channels: &[usize], vs: VarBuilder) -> Result<Self> {
        let n = channels.len();
        let mut convs = Vec::with_capacity(n);
        let mut in_ch = 1;
        for (i, &out_ch) in channels.iter().enumerate() {
            let (kernel, cfg) = if i == 0 {
                (15, Conv1dConfig { padding: 7, ..Default::default() })
            } else if i == n - 1 {
                (5, Conv1dConfig { padding: 2, ..Default::default() })
            } else {
                let cfg = Conv1dConfig {
                    padding: 20,
                    stride: 4,
                    groups: grouped(in_ch, out_ch),
                    ..Default::default()
                };
                (41, cfg)
            };
            convs.push(candle_nn::conv1d(in_ch, out_ch, kernel, cfg, vs.pp("convs").pp(i))?);
            in_ch = out_ch;
        }
        let post_cfg = Conv1dConfig {
            padding: 1,
            ..Default::default()
        };
        let post = candle_nn::conv1d(in_ch, 1, 3, post_cfg, vs.pp("conv_post"))?;
        Ok(Self { convs, post })
    }

    fn forward(&self, x: &Tensor) -> Result<(Tensor, Vec<Tensor>)> {
        let mut fmap = Vec::with_capacity(self.convs.len() + 1);
        let mut h = x.contiguous()?;
        for conv in &self.convs {
            h = leaky_relu(&conv.forward(&h)?, LRELU_SLOPE)?;
            fmap.push(h.clone());
        }
        h = self.post.forward(&h)?;
        fmap.push(h.clone());
        Ok((h.flatten_from(1)?, fmap))
    }
}

/// 波形を `period` ごとに折り畳んだ 2 次元表現を見るピリオド識別器。
/// カーネル幅 1 の 2D 畳み込みは列ごとの 1D 畳み込みと等価なので、列をバッチ方向に展開して計算する。
struct PeriodDiscriminator {
    period: usize,
    convs: Vec<Conv1d>,
    post: Conv1d,
}

impl PeriodDiscriminator {
    fn new(period: usize, channels: &[usize], vs: VarBuilder) -> Result<Self> {
        let mut convs = Vec::with_capacity(channels.len());
        let mut in_ch = 1;
        for (i, &out_ch) in channels.iter().enumerate() {
            let stride = if i + 1 == channels.len() { 1 } else { 3 };
            let cfg = Conv1dConfig {
                padding: 2,
                stride,
                ..Default::default()
            };
            convs.push(candle_nn::conv1d(in_ch, out_ch, 5, cfg, vs.pp("convs").pp(i))?);
            in_ch = out_ch;
        }
        let post_cfg = Conv1dConfig {
            padding: 1,
            ..Default::default()
        };
        let post = candle_nn::conv1d(in_ch, 1, 3, post_cfg, vs.pp("conv_post"))?;
        Ok(Self { period, convs, post })
    }

    /// `[batch * period, c, h]` -> `[batch, c, h, period]`
    fn unfold(h: &Tensor, b: usize, period: usize) -> Result<Tensor> {
        let (_, c, t) = h.dims3()?;
        Ok(h.reshape((b, period, c, t))?.permute((0, 2, 3, 1))?.contiguous()?)
    }

    fn forward(&self, x: &Tensor) -> Result<(Tensor, Vec<Tensor>)> {
        let (b, c, t) = x.dims3()?;
        let p = self.period;
        let x = if t % p != 0 {
            reflect_pad_last(x, 0, p - t % p)?
        } else {
            x.clone()
        };
        let h_len = x.dim(2)? / p;
        // [b, c, h, p] -> [b * p, c, h]
        let mut h = x
            .reshape((b, c, h_len, p))?
            .permute((0, 3, 1, 2))?
            .reshape((b * p, c, h_len))?;

        let mut fmap = Vec::with_capacity(self.convs.len() + 1);
        for conv in &self.convs {
            h = leaky_relu(&conv.forward(&h)?, LRELU_SLOPE)?;
            fmap.push(Self::unfold(&h, b, p)?);
        }
        h = self.post.forward(&h)?;
        let out = Self::unfold(&h, b, p)?;
        fmap.push(out.clone());
        Ok((out.flatten_from(1)?, fmap))
    }
}

/// スケール識別器 1 つと各周期のピリオド識別器からなるマルチピリオド識別器
pub struct MultiPeriodDiscriminator {
    config: DiscriminatorConfig,
    scale: ScaleDiscriminator,
    periods: Vec<PeriodDiscriminator>,
}

impl MultiPeriodDiscriminator {
    pub fn new(config: &DiscriminatorConfig, vs: VarBuilder) -> Result<Self> {
        config.validate()?;
        let scale = ScaleDiscriminator::new(&config.scale_channels, vs.pp("discriminators").pp(0))?;
        let mut periods = Vec::with_capacity(config.periods.len());
        for (i, &p) in config.periods.iter().enumerate() {
            periods.push(PeriodDiscriminator::new(
                p,
                &config.period_channels,
                vs.pp("discriminators").pp(i + 1),
            )?);
        }
        Ok(Self {
            config: config.clone(),
            scale,
            periods,
        })
    }

    pub fn config(&self) -> &DiscriminatorConfig {
        &self.config
    }

    /// サブ識別器の数
    pub fn len(&self) -> usize {
        1 + self.periods.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    fn run(&self, y: &Tensor) -> Result<(Vec<Tensor>, Vec<Vec<Tensor>>)> {
        let mut scores = Vec::with_capacity(self.len());
        let mut fmaps = Vec::with_capacity(self.len());
        let (s, f) = self.scale.forward(y)?;
        scores.push(s);
        fmaps.push(f);
        for d in &self.periods {
            let (s, f) = d.forward(y)?;
            scores.push(s);
            fmaps.push(f);
        }
        Ok((scores, fmaps))
    }

    /// `y`, `y_hat`: `[batch, 1, samples]`
    pub fn forward(&self, y: &Tensor, y_hat: &Tensor) -> Result<DiscriminatorOutput> {
        let (real, fmap_real) = self.run(y)?;
        let (fake, fmap_fake) = self.run(y_hat)?;
        Ok(DiscriminatorOutput {
            real,
            fake,
            fmap_real,
            fmap_fake,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn tiny_config() -> DiscriminatorConfig {
        DiscriminatorConfig {
            periods: vec![2, 3],
            scale_channels: vec![4, 16, 16],
            period_channels: vec![4, 8],
            use_spectral_norm: false,
        }
    }

    #[test]
    fn test_output_structure() -> Result<()> {
        let device = Device::Cpu;
        let vs = VarBuilder::zeros(DType::F32, &device);
        let disc = MultiPeriodDiscriminator::new(&tiny_config(), vs)?;
        let y = Tensor::zeros((2, 1, 64), DType::F32, &device)?;
        let out = disc.forward(&y, &y)?;
        assert_eq!(out.real.len(), 3);
        assert_eq!(out.fake.len(), 3);
        assert_eq!(out.fmap_real.len(), 3);
        // スケール識別器: 3 層 + post
        assert_eq!(out.fmap_real[0].len(), 4);
        // ピリオド識別器: 2 層 + post、4 次元 [b, c, h, period]
        assert_eq!(out.fmap_real[1].len(), 3);
        assert_eq!(out.fmap_real[1][0].rank(), 4);
        assert_eq!(out.fmap_real[1][0].dim(3)?, 2);
        for score in &out.real {
            assert_eq!(score.dim(0)?, 2);
        }
        Ok(())
    }

    #[test]
    fn test_period_pads_non_divisible_length() -> Result<()> {
        let device = Device::Cpu;
        let vs = VarBuilder::zeros(DType::F32, &device);
        let disc = MultiPeriodDiscriminator::new(&tiny_config(), vs)?;
        let y = Tensor::zeros((1, 1, 31), DType::F32, &device)?;
        let out = disc.forward(&y, &y)?;
        // 31 -> 33 (period 3)、h = 11 -> stride 3 で 4
        assert_eq!(out.fmap_fake[2][0].dims(), &[1, 4, 4, 3]);
        Ok(())
    }
}
