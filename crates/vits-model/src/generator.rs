use crate::alignment::maximum_path;
use crate::commons::{generate_path, rand_slice_segments, sequence_mask};
use crate::config::GeneratorConfig;
use crate::decoder::WaveDecoder;
use crate::duration::DurationPredictor;
use crate::encoder::{PosteriorEncoder, TextEncoder};
use crate::flow::ResidualCouplingBlock;
use anyhow::{ensure, Result};
use candle_core::{Device, Tensor};
use candle_nn::{Embedding, Module, VarBuilder};
use rand::Rng;

/// 推論時に 1 トークンへ割り当てるフレーム数の上限
pub const MAX_TOKEN_FRAMES: usize = 1000;

/// 切り上げ済みの継続長 `[b][t_x]` を有効長までフレーム数に変換する。
/// 負値と NaN は 0、無限大や上限超えは `MAX_TOKEN_FRAMES` に丸める。
pub fn durations_from_widths(w_ceil: &[Vec<f32>], x_lens: &[usize]) -> Vec<Vec<usize>> {
    w_ceil
        .iter()
        .zip(x_lens)
        .map(|(row, &len)| {
            row.iter()
                .take(len)
                .map(|&d| d.max(0.0).min(MAX_TOKEN_FRAMES as f32) as usize)
                .collect()
        })
        .collect()
}

/// 学習時の生成器出力
pub struct GeneratorOutput {
    /// 切り出し区間の生成波形 `[batch, 1, segment_frames * hop]`
    pub y_hat: Tensor,
    /// サンプルごとの継続長損失 `[batch]`
    pub l_length: Tensor,
    /// アライメント `[batch, 1, t_y, t_x]`
    pub attn: Tensor,
    /// 各サンプルの切り出し開始フレーム
    pub ids_slice: Vec<usize>,
    pub x_mask: Tensor,
    pub z_mask: Tensor,
    pub z: Tensor,
    pub z_p: Tensor,
    /// アライメントで展開済みの事前分布 `[batch, inter, t_y]`
    pub m_p: Tensor,
    pub logs_p: Tensor,
    pub m_q: Tensor,
    pub logs_q: Tensor,
}

/// 推論時の生成器出力
pub struct InferenceOutput {
    pub y_hat: Tensor,
    pub attn: Tensor,
    /// `[batch, 1, t_y]`
    pub y_mask: Tensor,
}

/// VITS の生成器。テキスト・事後エンコーダ、フロー、継続長予測器、波形デコーダからなる。
pub struct SynthesizerTrn {
    config: GeneratorConfig,
    enc_p: TextEncoder,
    enc_q: PosteriorEncoder,
    flow: ResidualCouplingBlock,
    dp: DurationPredictor,
    dec: WaveDecoder,
    emb_g: Option<Embedding>,
    training: bool,
}

fn lengths_vec(lengths: &Tensor) -> Result<Vec<usize>> {
    Ok(lengths
        .to_device(&Device::Cpu)?
        .to_dtype(candle_core::DType::U32)?
        .to_vec1::<u32>()?
        .into_iter()
        .map(|l| l as usize)
        .collect())
}

/// `[batch, t_y, t_x]` のアライメントで `[batch, d, t_x]` を `[batch, d, t_y]` に展開する
fn expand(attn: &Tensor, stats: &Tensor) -> Result<Tensor> {
    let expanded = attn.matmul(&stats.transpose(1, 2)?.contiguous()?)?;
    Ok(expanded.transpose(1, 2)?.contiguous()?)
}

impl SynthesizerTrn {
    pub fn new(config: &GeneratorConfig, vs: VarBuilder) -> Result<Self> {
        config.validate()?;
        let gin = config.is_multi_speaker().then_some(config.gin_channels);
        let enc_p = TextEncoder::new(
            config.n_vocab,
            config.inter_channels,
            config.hidden_channels,
            config.kernel_size,
            config.text_layers,
            config.p_dropout,
            vs.pp("enc_p"),
        )?;
        let enc_q = PosteriorEncoder::new(
            config.spec_channels,
            config.inter_channels,
            config.hidden_channels,
            config.kernel_size,
            config.posterior_layers,
            gin,
            vs.pp("enc_q"),
        )?;
        let flow = ResidualCouplingBlock::new(
            config.inter_channels,
            config.hidden_channels,
            config.kernel_size,
            1,
            config.n_flows,
            gin,
            vs.pp("flow"),
        )?;
        let dp = DurationPredictor::new(
            config.hidden_channels,
            config.filter_channels,
            3,
            0.5,
            gin,
            vs.pp("dp"),
        )?;
        let dec = WaveDecoder::new(
            config.inter_channels,
            &config.upsample_rates,
            config.upsample_initial_channel,
            gin,
            vs.pp("dec"),
        )?;
        let emb_g = match gin {
            Some(gin) => Some(candle_nn::embedding(config.n_speakers, gin, vs.pp("emb_g"))?),
            None => None,
        };
        Ok(Self {
            config: config.clone(),
            enc_p,
            enc_q,
            flow,
            dp,
            dec,
            emb_g,
            training: true,
        })
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    fn speaker_embedding(&self, sid: &Tensor) -> Result<Option<Tensor>> {
        match &self.emb_g {
            Some(emb) => Ok(Some(emb.forward(sid)?.unsqueeze(2)?)),
            None => Ok(None),
        }
    }

    /// 事前分布の下での z_p の対数尤度 `[batch, t_y, t_x]` (勾配なし)
    fn log_likelihood(z_p: &Tensor, m_p: &Tensor, logs_p: &Tensor) -> Result<Tensor> {
        let (z_p, m_p, logs_p) = (z_p.detach(), m_p.detach(), logs_p.detach());
        let half_log_2pi = 0.5 * (2.0 * std::f64::consts::PI).ln();
        let s_p_sq_r = (&logs_p * -2.0)?.exp()?;
        let neg_cent1 = logs_p.affine(-1.0, -half_log_2pi)?.sum_keepdim(1)?;
        let neg_cent2 = (z_p.sqr()? * -0.5)?
            .transpose(1, 2)?
            .contiguous()?
            .matmul(&s_p_sq_r)?;
        let neg_cent3 = z_p
            .transpose(1, 2)?
            .contiguous()?
            .matmul(&(&m_p * &s_p_sq_r)?)?;
        let neg_cent4 = ((m_p.sqr()? * -0.5)? * &s_p_sq_r)?.sum_keepdim(1)?;
        let neg_cent = (neg_cent2 + neg_cent3)?
            .broadcast_add(&neg_cent1)?
            .broadcast_add(&neg_cent4)?;
        Ok(neg_cent)
    }

    /// 学習時の順伝播
    ///
    /// * `x`: `[batch, t_x]` トークン ID
    /// * `spec`: `[batch, spec_channels, t_y]` 線形スペクトログラム
    /// * `sid`: `[batch]` 話者 ID (単一話者モデルでは無視)
    pub fn forward<R: Rng + ?Sized>(
        &self,
        x: &Tensor,
        x_lengths: &Tensor,
        spec: &Tensor,
        spec_lengths: &Tensor,
        sid: &Tensor,
        rng: &mut R,
    ) -> Result<GeneratorOutput> {
        let x_lens = lengths_vec(x_lengths)?;
        let y_lens = lengths_vec(spec_lengths)?;
        ensure!(x_lens.len() == y_lens.len(), "text and spectrogram batch sizes differ");

        let enc = self.enc_p.forward(x, x_lengths, self.training)?;
        let g = self.speaker_embedding(sid)?;
        let post = self.enc_q.forward(spec, spec_lengths, g.as_ref(), self.training)?;
        let z_p = self.flow.forward(&post.z, &post.y_mask, g.as_ref())?;

        let neg_cent = Self::log_likelihood(&z_p, &enc.m_p, &enc.logs_p)?;
        let attn = maximum_path(&neg_cent, &x_lens, &y_lens)?;

        // 継続長: 各トークンに割り当てられたフレーム数
        let w = attn.sum_keepdim(1)?;
        let logw_target = ((w + 1e-6)?.log()? * &enc.x_mask)?;
        let g_detached = g.as_ref().map(|g| g.detach());
        let logw = self
            .dp
            .forward(&enc.hidden.detach(), &enc.x_mask, g_detached.as_ref(), self.training)?;
        let l_length = (logw - logw_target)?.sqr()?.sum(2)?.sum(1)?;
        let l_length = (l_length / enc.x_mask.sum(2)?.sum(1)?)?;

        let m_p = expand(&attn, &enc.m_p)?;
        let logs_p = expand(&attn, &enc.logs_p)?;

        let (z_slice, ids_slice) = rand_slice_segments(&post.z, &y_lens, self.config.segment_frames, rng)?;
        let y_hat = self.dec.forward(&z_slice, g.as_ref())?;

        Ok(GeneratorOutput {
            y_hat,
            l_length,
            attn: attn.unsqueeze(1)?,
            ids_slice,
            x_mask: enc.x_mask,
            z_mask: post.y_mask,
            z: post.z,
            z_p,
            m_p,
            logs_p,
            m_q: post.m_q,
            logs_q: post.logs_q,
        })
    }

    /// テキストから波形を生成する。`max_len` は潜在フレーム数の上限。
    pub fn infer(
        &self,
        x: &Tensor,
        x_lengths: &Tensor,
        sid: &Tensor,
        max_len: Option<usize>,
        noise_scale: f64,
        length_scale: f64,
    ) -> Result<InferenceOutput> {
        let device = x.device().clone();
        let x_lens = lengths_vec(x_lengths)?;
        let enc = self.enc_p.forward(x, x_lengths, false)?;
        let g = self.speaker_embedding(sid)?;
        let logw = self.dp.forward(&enc.hidden, &enc.x_mask, g.as_ref(), false)?;
        let w = ((logw.exp()? * &enc.x_mask)? * length_scale)?;
        let w_ceil = w.ceil()?.squeeze(1)?.to_device(&Device::Cpu)?.to_vec2::<f32>()?;

        let durations = durations_from_widths(&w_ceil, &x_lens);
        let y_lens: Vec<usize> = durations.iter().map(|d| d.iter().sum::<usize>().max(1)).collect();
        let t_y = y_lens.iter().copied().max().unwrap_or(1);
        let y_lengths = Tensor::from_vec(
            y_lens.iter().map(|&l| l as u32).collect::<Vec<_>>(),
            (y_lens.len(),),
            &device,
        )?;
        let y_mask = sequence_mask(&y_lengths, t_y)?.unsqueeze(1)?;

        let t_x = x.dim(1)?;
        let padded: Vec<Vec<usize>> = durations
            .into_iter()
            .map(|mut d| {
                d.resize(t_x, 0);
                d
            })
            .collect();
        let attn = generate_path(&padded, &y_lens, t_y, &device)?;
        let m_p = expand(&attn, &enc.m_p)?;
        let logs_p = expand(&attn, &enc.logs_p)?;

        let noise = (m_p.randn_like(0.0, 1.0)? * logs_p.exp()?)?;
        let z_p = (&m_p + (noise * noise_scale)?)?;
        let z = self.flow.reverse(&z_p, &y_mask, g.as_ref())?;
        let z = z.broadcast_mul(&y_mask)?;
        let frames = max_len.map_or(t_y, |m| m.min(t_y));
        let y_hat = self.dec.forward(&z.narrow(2, 0, frames)?, g.as_ref())?;

        Ok(InferenceOutput {
            y_hat,
            attn: attn.unsqueeze(1)?,
            y_mask,
        })
    }
}
