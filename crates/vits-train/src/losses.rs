//! GAN 学習用の損失関数 (LSGAN, 特徴マッチング, KL)
//!
//! 入力はすべて計算グラフ上のテンソルで、戻り値のスカラーテンソルから勾配を流せる。

use crate::error::{Result, TrainError};
use candle_core::Tensor;

fn scalar(t: &Tensor) -> Result<f32> {
    Ok(t.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?)
}

/// 特徴マッチング損失: `2 * Σ_i Σ_j mean(|real_ij - fake_ij|)`。
/// 本物側の特徴マップは勾配を止める。
pub fn feature_loss(fmap_r: &[Vec<Tensor>], fmap_g: &[Vec<Tensor>]) -> Result<Tensor> {
    let mut total: Option<Tensor> = None;
    for (dr, dg) in fmap_r.iter().zip(fmap_g) {
        for (rl, gl) in dr.iter().zip(dg) {
            let l = (rl.detach() - gl)?.abs()?.mean_all()?;
            total = Some(match total {
                Some(t) => (t + l)?,
                None => l,
            });
        }
    }
    match total {
        Some(t) => Ok((t * 2.0)?),
        None => Err(TrainError::Numerical("feature_loss: no feature maps".into())),
    }
}

/// 識別器損失。戻り値は (合計, サブ識別器ごとの本物損失, 偽物損失)。
pub fn discriminator_loss(real: &[Tensor], fake: &[Tensor]) -> Result<(Tensor, Vec<f32>, Vec<f32>)> {
    if real.is_empty() || real.len() != fake.len() {
        return Err(TrainError::Numerical(format!(
            "discriminator_loss: {} real vs {} fake outputs",
            real.len(),
            fake.len()
        )));
    }
    let mut total: Option<Tensor> = None;
    let mut r_losses = Vec::with_capacity(real.len());
    let mut g_losses = Vec::with_capacity(fake.len());
    for (dr, dg) in real.iter().zip(fake) {
        let r_loss = (dr - 1.0)?.sqr()?.mean_all()?;
        let g_loss = dg.sqr()?.mean_all()?;
        r_losses.push(scalar(&r_loss)?);
        g_losses.push(scalar(&g_loss)?);
        let l = (r_loss + g_loss)?;
        total = Some(match total {
            Some(t) => (t + l)?,
            None => l,
        });
    }
    // 空でないことは先頭で確認済み
    let total = total.ok_or_else(|| TrainError::Numerical("discriminator_loss: empty".into()))?;
    Ok((total, r_losses, g_losses))
}

/// 生成器の敵対的損失。戻り値は (合計, サブ識別器ごとの損失)。
pub fn generator_loss(fake: &[Tensor]) -> Result<(Tensor, Vec<Tensor>)> {
    let mut losses = Vec::with_capacity(fake.len());
    for dg in fake {
        losses.push((dg - 1.0)?.sqr()?.mean_all()?);
    }
    let mut iter = losses.iter();
    let first = iter
        .next()
        .ok_or_else(|| TrainError::Numerical("generator_loss: no discriminator outputs".into()))?;
    let mut total = first.clone();
    for l in iter {
        total = (total + l)?;
    }
    Ok((total, losses))
}

/// 事後分布と事前分布の間の KL 損失 (マスク内の平均)。
///
/// `z_p`, `logs_q`: `[b, h, t_t]`、`m_p`, `logs_p`: `[b, h, t_t]`、`z_mask`: `[b, 1, t_t]`
pub fn kl_loss(z_p: &Tensor, logs_q: &Tensor, m_p: &Tensor, logs_p: &Tensor, z_mask: &Tensor) -> Result<Tensor> {
    let f32 = candle_core::DType::F32;
    let (z_p, logs_q) = (z_p.to_dtype(f32)?, logs_q.to_dtype(f32)?);
    let (m_p, logs_p) = (m_p.to_dtype(f32)?, logs_p.to_dtype(f32)?);
    let z_mask = z_mask.to_dtype(f32)?;

    // 分母はチャネル方向に数えない (マスクそのものの総和)
    let denom = z_mask.sum_all()?;
    if scalar(&denom)? <= 0.0 {
        return Err(TrainError::Numerical("kl_loss: mask selects no positions".into()));
    }

    // 乗算ではなく選択で落とす。マスク外の inf/NaN が 0 * inf として混ざらないよう、
    // exp と二乗の前に入力自体も置き換える。
    let keep = z_mask.ne(&z_mask.zeros_like()?)?.broadcast_as(z_p.shape())?;
    let zeros = z_p.zeros_like()?;
    let select = |t: &Tensor| keep.where_cond(t, &zeros);
    let (z_p, logs_q, m_p, logs_p) = (select(&z_p)?, select(&logs_q)?, select(&m_p)?, select(&logs_p)?);

    let kl = ((&logs_p - &logs_q)? - 0.5)?;
    let sq = (&z_p - &m_p)?.sqr()?;
    let inv_var = (&logs_p * -2.0)?.exp()?;
    let kl = (kl + ((sq * inv_var)? * 0.5)?)?;
    let kl = keep.where_cond(&kl, &zeros)?.sum_all()?;
    Ok((kl / denom)?)
}

/// メルスペクトログラムの L1 損失 (要素平均)
pub fn mel_l1(y_mel: &Tensor, y_hat_mel: &Tensor) -> Result<Tensor> {
    Ok((y_mel - y_hat_mel)?.abs()?.mean_all()?)
}
