use anyhow::{ensure, Result};
use candle_core::{Device, Tensor};

/// Monotonic Alignment Search (単調アライメント探索)
///
/// `neg_cent`: `[batch, t_y, t_x]` の対数尤度。`y_lengths[b]` × `x_lengths[b]` の範囲だけを使い、
/// 各フレームがちょうど1つのトークンに割り当てられ、トークン順が単調増加になるパスを返す。
/// 勾配は流さないため CPU 上のベクタで計算する。
pub fn maximum_path(neg_cent: &Tensor, x_lengths: &[usize], y_lengths: &[usize]) -> Result<Tensor> {
    let device = neg_cent.device().clone();
    let values = neg_cent.to_device(&Device::Cpu)?.to_vec3::<f32>()?;
    let b_sz = values.len();
    ensure!(
        x_lengths.len() == b_sz && y_lengths.len() == b_sz,
        "maximum_path: length vectors do not match batch size {}",
        b_sz
    );
    let (_, t_y, t_x) = neg_cent.dims3()?;
    let mut path = vec![0f32; b_sz * t_y * t_x];
    for b in 0..b_sz {
        let ty = y_lengths[b].min(t_y);
        let tx = x_lengths[b].min(t_x);
        if ty == 0 || tx == 0 {
            continue;
        }
        let cells = search_single(&values[b], tx, ty);
        for (y, x) in cells.into_iter().enumerate() {
            path[(b * t_y + y) * t_x + x] = 1.0;
        }
    }
    Ok(Tensor::from_vec(path, (b_sz, t_y, t_x), &device)?)
}

/// 1サンプル分の動的計画法。戻り値はフレームごとのトークン番号。
fn search_single(value: &[Vec<f32>], tx: usize, ty: usize) -> Vec<usize> {
    const NEG_INF: f32 = -1e9;
    let mut acc = vec![vec![NEG_INF; tx]; ty];
    for y in 0..ty {
        let lo = (tx + y).saturating_sub(ty);
        let hi = tx.min(y + 1);
        for x in lo..hi {
            let v_cur = if x == y { NEG_INF } else { acc[y - 1][x] };
            let v_prev = if x == 0 {
                if y == 0 {
                    0.0
                } else {
                    NEG_INF
                }
            } else {
                acc[y - 1][x - 1]
            };
            acc[y][x] = value[y][x] + v_cur.max(v_prev);
        }
    }

    let mut owner = vec![0usize; ty];
    let mut index = tx - 1;
    for y in (0..ty).rev() {
        owner[y] = index;
        if y > 0 && index != 0 && (index == y || acc[y - 1][index] < acc[y - 1][index - 1]) {
            index -= 1;
        }
    }
    owner
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn owners(path: &[Vec<f32>]) -> Vec<Option<usize>> {
        path.iter().map(|row| row.iter().position(|&v| v == 1.0)).collect()
    }

    #[test]
    fn test_path_is_monotonic_and_covers_all_tokens() -> Result<()> {
        let device = Device::Cpu;
        let neg_cent = Tensor::zeros((1, 7, 3), DType::F32, &device)?;
        let path = maximum_path(&neg_cent, &[3], &[7])?.to_vec3::<f32>()?;
        let own = owners(&path[0]);
        let own: Vec<usize> = own.into_iter().map(|o| o.unwrap_or(usize::MAX)).collect();
        assert_eq!(own[0], 0);
        assert_eq!(own[6], 2);
        assert!(own.windows(2).all(|w| w[1] == w[0] || w[1] == w[0] + 1));
        Ok(())
    }

    #[test]
    fn test_path_follows_likelihood() -> Result<()> {
        let device = Device::Cpu;
        // フレーム 0..2 はトークン0、3..4 はトークン1 を強く好む
        let mut v = vec![0f32; 5 * 2];
        for y in 0..5 {
            let best = if y < 3 { 0 } else { 1 };
            v[y * 2 + best] = 10.0;
        }
        let neg_cent = Tensor::from_vec(v, (1, 5, 2), &device)?;
        let path = maximum_path(&neg_cent, &[2], &[5])?.to_vec3::<f32>()?;
        assert_eq!(
            owners(&path[0]),
            vec![Some(0), Some(0), Some(0), Some(1), Some(1)]
        );
        Ok(())
    }

    #[test]
    fn test_padding_rows_are_empty() -> Result<()> {
        let device = Device::Cpu;
        let neg_cent = Tensor::zeros((2, 4, 3), DType::F32, &device)?;
        let path = maximum_path(&neg_cent, &[3, 2], &[4, 2])?.to_vec3::<f32>()?;
        let own = owners(&path[1]);
        assert_eq!(own, vec![Some(0), Some(1), None, None]);
        Ok(())
    }
}
