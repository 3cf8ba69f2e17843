use crate::commons::sequence_mask;
use anyhow::Result;
use candle_core::{Tensor, D};
use candle_nn::{Conv1d, Conv1dConfig, Embedding, LayerNorm, Module, VarBuilder};

/// マスク付きの 1D ゲート付き畳み込みブロック。入出力は `[batch, channels, time]`。
pub struct GatedConvBlock {
    conv: Conv1d,
    norm: LayerNorm,
    p_dropout: f64,
}

impl GatedConvBlock {
    pub fn new(dim: usize, kernel_size: usize, p_dropout: f64, vs: VarBuilder) -> Result<Self> {
        let cfg = Conv1dConfig {
            padding: kernel_size / 2,
            ..Default::default()
        };
        // 出力は dim * 2 で、半分をゲートにする
        let conv = candle_nn::conv1d(dim, dim * 2, kernel_size, cfg, vs.pp("conv"))?;
        let norm = candle_nn::layer_norm(dim, 1e-5, vs.pp("norm"))?;
        Ok(Self {
            conv,
            norm,
            p_dropout,
        })
    }

    pub fn forward(&self, xs: &Tensor, mask: &Tensor, training: bool) -> Result<Tensor> {
        let h = self.conv.forward(&xs.broadcast_mul(mask)?)?;
        let chunks = h.chunk(2, 1)?;
        let (val, gate) = (&chunks[0], &chunks[1]);
        let mut h = (val * candle_nn::ops::sigmoid(gate)?)?;
        // LayerNorm はチャネル方向に掛ける
        h = self.norm.forward(&h.transpose(1, 2)?)?.transpose(1, 2)?;
        if training && self.p_dropout > 0.0 {
            h = candle_nn::ops::dropout(&h, self.p_dropout as f32)?;
        }
        Ok((h + xs)?.broadcast_mul(mask)?)
    }
}

/// ブロックの積み重ね。話者埋め込み `g` が与えられた場合は入力に加算する。
pub struct ConvStack {
    blocks: Vec<GatedConvBlock>,
    cond: Option<Conv1d>,
}

impl ConvStack {
    pub fn new(
        dim: usize,
        kernel_size: usize,
        num_layers: usize,
        p_dropout: f64,
        gin_channels: Option<usize>,
        vs: VarBuilder,
    ) -> Result<Self> {
        let mut blocks = Vec::with_capacity(num_layers);
        let blocks_vs = vs.pp("blocks");
        for i in 0..num_layers {
            blocks.push(GatedConvBlock::new(dim, kernel_size, p_dropout, blocks_vs.pp(i))?);
        }
        let cond = match gin_channels {
            Some(gin) => Some(candle_nn::conv1d(gin, dim, 1, Default::default(), vs.pp("cond"))?),
            None => None,
        };
        Ok(Self { blocks, cond })
    }

    pub fn forward(&self, xs: &Tensor, mask: &Tensor, g: Option<&Tensor>, training: bool) -> Result<Tensor> {
        let mut h = match (&self.cond, g) {
            (Some(cond), Some(g)) => xs.broadcast_add(&cond.forward(g)?)?,
            _ => xs.clone(),
        };
        for block in &self.blocks {
            h = block.forward(&h, mask, training)?;
        }
        Ok(h)
    }
}

/// テキストエンコーダの出力
pub struct TextEncoderOutput {
    /// 隠れ表現 `[batch, hidden, t_x]`
    pub hidden: Tensor,
    pub m_p: Tensor,
    pub logs_p: Tensor,
    /// `[batch, 1, t_x]`
    pub x_mask: Tensor,
}

/// トークン列から事前分布の平均と対数標準偏差を出すエンコーダ
pub struct TextEncoder {
    emb: Embedding,
    stack: ConvStack,
    proj: Conv1d,
    hidden_channels: usize,
}

impl TextEncoder {
    pub fn new(
        n_vocab: usize,
        out_channels: usize,
        hidden_channels: usize,
        kernel_size: usize,
        num_layers: usize,
        p_dropout: f64,
        vs: VarBuilder,
    ) -> Result<Self> {
        let emb = candle_nn::embedding(n_vocab, hidden_channels, vs.pp("emb"))?;
        let stack = ConvStack::new(hidden_channels, kernel_size, num_layers, p_dropout, None, vs.pp("encoder"))?;
        let proj = candle_nn::conv1d(hidden_channels, out_channels * 2, 1, Default::default(), vs.pp("proj"))?;
        Ok(Self {
            emb,
            stack,
            proj,
            hidden_channels,
        })
    }

    pub fn forward(&self, x: &Tensor, x_lengths: &Tensor, training: bool) -> Result<TextEncoderOutput> {
        let t_x = x.dim(1)?;
        let h = self.emb.forward(x)?;
        let h = (h * (self.hidden_channels as f64).sqrt())?;
        // [batch, t_x, hidden] -> [batch, hidden, t_x]
        let h = h.transpose(1, 2)?.contiguous()?;
        let x_mask = sequence_mask(x_lengths, t_x)?.unsqueeze(1)?;
        let hidden = self.stack.forward(&h, &x_mask, None, training)?;
        let stats = self.proj.forward(&hidden)?.broadcast_mul(&x_mask)?;
        let chunks = stats.chunk(2, 1)?;
        Ok(TextEncoderOutput {
            hidden,
            m_p: chunks[0].contiguous()?,
            logs_p: chunks[1].contiguous()?,
            x_mask,
        })
    }
}

/// 事後エンコーダの出力
pub struct PosteriorOutput {
    pub z: Tensor,
    pub m_q: Tensor,
    pub logs_q: Tensor,
    /// `[batch, 1, t_y]`
    pub y_mask: Tensor,
}

/// 線形スペクトログラムから潜在変数 z をサンプリングするエンコーダ
pub struct PosteriorEncoder {
    pre: Conv1d,
    stack: ConvStack,
    proj: Conv1d,
}

impl PosteriorEncoder {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        hidden_channels: usize,
        kernel_size: usize,
        num_layers: usize,
        gin_channels: Option<usize>,
        vs: VarBuilder,
    ) -> Result<Self> {
        let pre = candle_nn::conv1d(in_channels, hidden_channels, 1, Default::default(), vs.pp("pre"))?;
        let stack = ConvStack::new(hidden_channels, kernel_size, num_layers, 0.0, gin_channels, vs.pp("enc"))?;
        let proj = candle_nn::conv1d(hidden_channels, out_channels * 2, 1, Default::default(), vs.pp("proj"))?;
        Ok(Self { pre, stack, proj })
    }

    pub fn forward(&self, spec: &Tensor, lengths: &Tensor, g: Option<&Tensor>, training: bool) -> Result<PosteriorOutput> {
        let t_y = spec.dim(D::Minus1)?;
        let y_mask = sequence_mask(lengths, t_y)?.unsqueeze(1)?;
        let h = self.pre.forward(spec)?.broadcast_mul(&y_mask)?;
        let h = self.stack.forward(&h, &y_mask, g, training)?;
        let stats = self.proj.forward(&h)?.broadcast_mul(&y_mask)?;
        let chunks = stats.chunk(2, 1)?;
        let m_q = chunks[0].contiguous()?;
        let logs_q = chunks[1].contiguous()?;
        let noise = m_q.randn_like(0.0, 1.0)?;
        let z = (&m_q + (noise * logs_q.exp()?)?)?.broadcast_mul(&y_mask)?;
        Ok(PosteriorOutput { z, m_q, logs_q, y_mask })
    }
}
