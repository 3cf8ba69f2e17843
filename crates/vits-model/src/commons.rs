use anyhow::{ensure, Result};
use candle_core::{DType, Device, Tensor, D};
use rand::Rng;

/// 長さ `[batch]` から `[batch, max_len]` の 0/1 マスクを作る
pub fn sequence_mask(lengths: &Tensor, max_len: usize) -> Result<Tensor> {
    let device = lengths.device();
    let range = Tensor::arange(0u32, max_len as u32, device)?.unsqueeze(0)?;
    let lengths = lengths.to_dtype(DType::U32)?.unsqueeze(1)?;
    let mask = range.broadcast_lt(&lengths)?.to_dtype(DType::F32)?;
    Ok(mask)
}

/// `[batch, channels, time]` から各サンプルの `ids_str[b]` を起点に `segment_size` だけ切り出す。
/// 末尾を超える分はゼロで埋める。
pub fn slice_segments(x: &Tensor, ids_str: &[usize], segment_size: usize) -> Result<Tensor> {
    let (b_sz, _, t) = x.dims3()?;
    ensure!(
        ids_str.len() == b_sz,
        "slice_segments: {} offsets for batch of {}",
        ids_str.len(),
        b_sz
    );
    let mut segments = Vec::with_capacity(b_sz);
    for (b, &start) in ids_str.iter().enumerate() {
        let row = x.get(b)?;
        let start = start.min(t);
        let len = segment_size.min(t - start);
        let mut seg = row.narrow(1, start, len)?;
        if len < segment_size {
            seg = seg.pad_with_zeros(1, 0, segment_size - len)?;
        }
        segments.push(seg.contiguous()?);
    }
    Ok(Tensor::stack(&segments, 0)?)
}

/// 有効長の範囲内でランダムな開始位置を選び、切り出した区間と開始位置を返す
pub fn rand_slice_segments<R: Rng + ?Sized>(
    x: &Tensor,
    lengths: &[usize],
    segment_size: usize,
    rng: &mut R,
) -> Result<(Tensor, Vec<usize>)> {
    let ids_str: Vec<usize> = lengths
        .iter()
        .map(|&len| {
            let max_start = (len + 1).saturating_sub(segment_size).max(1);
            let r: f32 = rng.random();
            ((r * max_start as f32) as usize).min(max_start - 1)
        })
        .collect();
    let segments = slice_segments(x, &ids_str, segment_size)?;
    Ok((segments, ids_str))
}

/// 最終次元を反射パディングする (PyTorch の `mode="reflect"` と同じ)
pub fn reflect_pad_last(x: &Tensor, left: usize, right: usize) -> Result<Tensor> {
    if left == 0 && right == 0 {
        return Ok(x.clone());
    }
    let t = x.dim(D::Minus1)?;
    ensure!(
        left < t && right < t,
        "reflect padding ({}, {}) requires length > padding, got {}",
        left,
        right,
        t
    );
    let mut idx: Vec<u32> = Vec::with_capacity(left + t + right);
    idx.extend((1..=left).rev().map(|i| i as u32));
    idx.extend((0..t).map(|i| i as u32));
    idx.extend((0..right).map(|i| (t - 2 - i) as u32));
    let idx = Tensor::from_vec(idx, (left + t + right,), x.device())?;
    Ok(x.contiguous()?.index_select(&idx, x.rank() - 1)?)
}

/// チャネル (dim 1) の順序を反転する
pub fn flip_channels(x: &Tensor) -> Result<Tensor> {
    let c = x.dim(1)?;
    let idx: Vec<u32> = (0..c as u32).rev().collect();
    let idx = Tensor::from_vec(idx, (c,), x.device())?;
    Ok(x.contiguous()?.index_select(&idx, 1)?)
}

pub fn leaky_relu(x: &Tensor, slope: f64) -> candle_core::Result<Tensor> {
    let zeros = x.zeros_like()?;
    let neg = (x.minimum(&zeros)? * slope)?;
    x.maximum(&zeros)? + neg
}

/// 各テキストトークンの継続長 `[batch, t_x]` から単調なアライメントパス `[batch, t_y, t_x]` を作る。
/// `y_lengths` を超えるフレームは 0 になる。
pub fn generate_path(durations: &[Vec<usize>], y_lengths: &[usize], t_y: usize, device: &Device) -> Result<Tensor> {
    let b_sz = durations.len();
    let t_x = durations.iter().map(|d| d.len()).max().unwrap_or(0);
    let mut path = vec![0f32; b_sz * t_y * t_x];
    for (b, durs) in durations.iter().enumerate() {
        let limit = y_lengths.get(b).copied().unwrap_or(t_y).min(t_y);
        let mut start = 0usize;
        for (i, &d) in durs.iter().enumerate() {
            let end = (start + d).min(limit);
            for y in start..end {
                path[(b * t_y + y) * t_x + i] = 1.0;
            }
            start = end;
        }
    }
    Ok(Tensor::from_vec(path, (b_sz, t_y, t_x), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_mask() -> Result<()> {
        let device = Device::Cpu;
        let lengths = Tensor::new(&[2u32, 4], &device)?;
        let mask = sequence_mask(&lengths, 4)?.to_vec2::<f32>()?;
        assert_eq!(mask, vec![vec![1.0, 1.0, 0.0, 0.0], vec![1.0; 4]]);
        Ok(())
    }

    #[test]
    fn test_slice_segments_full_length() -> Result<()> {
        // hop 256, セグメント 8000 サンプル: 開始位置 0 なら長さ 8000 の区間がそのまま得られる
        let device = Device::Cpu;
        let wav: Vec<f32> = (0..16000).map(|i| i as f32).collect();
        let y = Tensor::from_vec(wav, (1, 1, 16000), &device)?;
        let seg = slice_segments(&y, &[0], 8000)?;
        assert_eq!(seg.dims(), &[1, 1, 8000]);
        let v = seg.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(v[0], 0.0);
        assert_eq!(v[7999], 7999.0);
        Ok(())
    }

    #[test]
    fn test_slice_segments_pads_tail() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::ones((1, 2, 5), DType::F32, &device)?;
        let seg = slice_segments(&x, &[3], 4)?.to_vec3::<f32>()?;
        assert_eq!(seg[0][0], vec![1.0, 1.0, 0.0, 0.0]);
        Ok(())
    }

    #[test]
    fn test_rand_slice_segments_in_range() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::zeros((3, 2, 20), DType::F32, &device)?;
        let mut rng = rand::rng();
        for _ in 0..50 {
            let (seg, ids) = rand_slice_segments(&x, &[20, 8, 3], 8, &mut rng)?;
            assert_eq!(seg.dims(), &[3, 2, 8]);
            assert!(ids[0] <= 12);
            assert_eq!(ids[1], 0);
            assert_eq!(ids[2], 0);
        }
        Ok(())
    }

    #[test]
    fn test_reflect_pad() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[[1f32, 2., 3., 4.]], &device)?;
        let y = reflect_pad_last(&x, 2, 2)?.to_vec2::<f32>()?;
        assert_eq!(y[0], vec![3.0, 2.0, 1.0, 2.0, 3.0, 4.0, 3.0, 2.0]);
        assert!(reflect_pad_last(&x, 4, 0).is_err());
        Ok(())
    }

    #[test]
    fn test_generate_path() -> Result<()> {
        let device = Device::Cpu;
        let path = generate_path(&[vec![2, 1, 3]], &[5], 6, &device)?.to_vec3::<f32>()?;
        let owner: Vec<Option<usize>> = path[0]
            .iter()
            .map(|row| row.iter().position(|&v| v == 1.0))
            .collect();
        assert_eq!(owner, vec![Some(0), Some(0), Some(1), Some(2), Some(2), None]);
        Ok(())
    }

    #[test]
    fn test_leaky_relu_and_flip() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[[[-1f32], [2.]]], &device)?;
        let y = leaky_relu(&x, 0.1)?.flatten_all()?.to_vec1::<f32>()?;
        assert!((y[0] + 0.1).abs() < 1e-6);
        assert_eq!(y[1], 2.0);
        let f = flip_channels(&x)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(f, vec![2.0, -1.0]);
        Ok(())
    }
}
