use crate::config::HParams;
use crate::error::{Result, TrainError};
use candle_core::{Device, Tensor};
use rustfft::{num_complex::Complex, FftPlanner};
use vits_model::commons::reflect_pad_last;

/// STFT とメルフィルタバンクの設定
#[derive(Debug, Clone, PartialEq)]
pub struct MelConfig {
    pub filter_length: usize,
    pub hop_length: usize,
    pub win_length: usize,
    pub n_mel_channels: usize,
    pub sampling_rate: u32,
    pub mel_fmin: f32,
    pub mel_fmax: Option<f32>,
}

impl MelConfig {
    pub fn from_hparams(hp: &HParams) -> Self {
        Self {
            filter_length: hp.filter_length,
            hop_length: hp.hop_length,
            win_length: hp.win_length,
            n_mel_channels: hp.n_mel_channels,
            sampling_rate: hp.sampling_rate,
            mel_fmin: hp.mel_fmin,
            mel_fmax: hp.mel_fmax,
        }
    }

    pub fn n_freq(&self) -> usize {
        self.filter_length / 2 + 1
    }

    /// 両端の反射パディング量。フレーム数がちょうど `samples / hop` になる。
    pub fn padding(&self) -> usize {
        (self.filter_length - self.hop_length) / 2
    }

    /// 周期的 Hann 窓を `filter_length` の中央に配置したもの
    fn window(&self) -> Vec<f32> {
        let n_fft = self.filter_length;
        let win = self.win_length;
        let offset = (n_fft - win) / 2;
        let mut window = vec![0f32; n_fft];
        for i in 0..win {
            let phase = 2.0 * std::f32::consts::PI * i as f32 / win as f32;
            window[offset + i] = 0.5 - 0.5 * phase.cos();
        }
        window
    }
}

fn hz_to_mel(f: f32) -> f32 {
    1127.0f32 * (1.0f32 + f / 700.0f32).ln()
}

fn mel_to_hz(m: f32) -> f32 {
    700.0f32 * ((m / 1127.0f32).exp() - 1.0f32)
}

/// `[n_mels, n_freq]` の三角フィルタバンク (面積正規化付き)
pub fn mel_filter(cfg: &MelConfig) -> Vec<f32> {
    let n_freq = cfg.n_freq();
    let n_mels = cfg.n_mel_channels;
    let sr = cfg.sampling_rate as f32;
    let f_max = cfg.mel_fmax.unwrap_or(sr / 2.0);
    let mel_min = hz_to_mel(cfg.mel_fmin);
    let mel_max = hz_to_mel(f_max);
    let hz_points: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * (i as f32 / (n_mels + 1) as f32)))
        .collect();

    let mut filter = vec![0f32; n_mels * n_freq];
    for m in 0..n_mels {
        let (f_prev, f_curr, f_next) = (hz_points[m], hz_points[m + 1], hz_points[m + 2]);
        let enorm = 2.0 / (f_next - f_prev);
        for k in 0..n_freq {
            let f_hz = k as f32 * sr / cfg.filter_length as f32;
            let lower = (f_hz - f_prev) / (f_curr - f_prev);
            let upper = (f_next - f_hz) / (f_next - f_curr);
            filter[m * n_freq + k] = lower.min(upper).max(0.0) * enorm;
        }
    }
    filter
}

/// CPU 上で線形振幅スペクトログラム `[n_freq, frames]` を計算する (データ前処理用)
pub fn spectrogram_cpu(samples: &[f32], cfg: &MelConfig) -> Result<Tensor> {
    let n_fft = cfg.filter_length;
    let pad = cfg.padding();
    if samples.len() <= pad {
        return Err(TrainError::Data(format!(
            "audio of {} samples is too short for padding {}",
            samples.len(),
            pad
        )));
    }
    // 反射パディング
    let mut padded = Vec::with_capacity(samples.len() + 2 * pad);
    padded.extend((1..=pad).rev().map(|i| samples[i]));
    padded.extend_from_slice(samples);
    padded.extend((0..pad).map(|i| samples[samples.len() - 2 - i]));

    if padded.len() < n_fft {
        return Err(TrainError::Data(format!(
            "audio of {} samples is shorter than one frame",
            samples.len()
        )));
    }
    let num_frames = (padded.len() - n_fft) / cfg.hop_length + 1;
    let n_freq = cfg.n_freq();
    let window = cfg.window();

    let mut planner = FftPlanner::new();
    let fft = planner.plan_fft_forward(n_fft);
    let mut out = vec![0f32; n_freq * num_frames];
    let mut buf = vec![Complex::default(); n_fft];
    for frame in 0..num_frames {
        let start = frame * cfg.hop_length;
        for j in 0..n_fft {
            buf[j] = Complex::new(padded[start + j] * window[j], 0.0);
        }
        fft.process(&mut buf);
        for (k, c) in buf.iter().take(n_freq).enumerate() {
            out[k * num_frames + frame] = (c.norm_sqr() + 1e-6).sqrt();
        }
    }
    Ok(Tensor::from_vec(out, (n_freq, num_frames), &Device::Cpu)?)
}

/// 計算デバイス上で微分可能な STFT とメル変換を行う。
/// 窓付き DFT 基底を畳み込みカーネルとして持つ。
pub struct MelTransform {
    cfg: MelConfig,
    dft_kernel: Tensor,
    mel_basis: Tensor,
}

impl MelTransform {
    pub fn new(cfg: MelConfig, device: &Device) -> Result<Self> {
        if cfg.hop_length == 0 || cfg.hop_length > cfg.filter_length {
            return Err(TrainError::Data(format!(
                "invalid STFT parameters: hop {} filter {}",
                cfg.hop_length, cfg.filter_length
            )));
        }
        let n_fft = cfg.filter_length;
        let n_freq = cfg.n_freq();
        let window = cfg.window();
        let mut kernel = vec![0f32; 2 * n_freq * n_fft];
        for k in 0..n_freq {
            for n in 0..n_fft {
                let phase = 2.0 * std::f64::consts::PI * (k * n % n_fft) as f64 / n_fft as f64;
                kernel[k * n_fft + n] = (phase.cos() as f32) * window[n];
                kernel[(n_freq + k) * n_fft + n] = -(phase.sin() as f32) * window[n];
            }
        }
        let dft_kernel = Tensor::from_vec(kernel, (2 * n_freq, 1, n_fft), device)?;
        let mel_basis = Tensor::from_vec(mel_filter(&cfg), (cfg.n_mel_channels, n_freq), device)?;
        Ok(Self {
            cfg,
            dft_kernel,
            mel_basis,
        })
    }

    pub fn config(&self) -> &MelConfig {
        &self.cfg
    }

    /// 波形 `[batch, samples]` -> 線形スペクトログラム `[batch, n_freq, frames]`
    pub fn spectrogram(&self, y: &Tensor) -> Result<Tensor> {
        let pad = self.cfg.padding();
        let y = reflect_pad_last(&y.unsqueeze(1)?, pad, pad)?;
        let out = y.conv1d(&self.dft_kernel, 0, self.cfg.hop_length, 1, 1)?;
        let n_freq = self.cfg.n_freq();
        let re = out.narrow(1, 0, n_freq)?;
        let im = out.narrow(1, n_freq, n_freq)?;
        let power = ((re.sqr()? + im.sqr()?)? + 1e-6)?;
        Ok(power.sqrt()?)
    }

    /// 線形スペクトログラム -> 対数メル `[batch, n_mels, frames]`
    pub fn spec_to_mel(&self, spec: &Tensor) -> Result<Tensor> {
        let mel = self.mel_basis.broadcast_matmul(&spec.contiguous()?)?;
        Ok(mel.maximum(1e-5f32)?.log()?)
    }

    /// 波形 `[batch, samples]` -> 対数メル
    pub fn mel_spectrogram(&self, y: &Tensor) -> Result<Tensor> {
        self.spec_to_mel(&self.spectrogram(y)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> MelConfig {
        MelConfig {
            filter_length: 64,
            hop_length: 16,
            win_length: 64,
            n_mel_channels: 10,
            sampling_rate: 8000,
            mel_fmin: 0.0,
            mel_fmax: None,
        }
    }

    fn sine(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (i as f32 * 2.0 * std::f32::consts::PI * 440.0 / 8000.0).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_frame_count_matches_hop() -> Result<()> {
        let cfg = small_config();
        let spec = spectrogram_cpu(&sine(320), &cfg)?;
        assert_eq!(spec.dims(), &[33, 20]);
        Ok(())
    }

    #[test]
    fn test_device_stft_matches_fft() -> Result<()> {
        let cfg = small_config();
        let samples = sine(320);
        let reference = spectrogram_cpu(&samples, &cfg)?;
        let mel = MelTransform::new(cfg, &Device::Cpu)?;
        let y = Tensor::from_vec(samples, (1, 320), &Device::Cpu)?;
        let spec = mel.spectrogram(&y)?.squeeze(0)?;
        assert_eq!(spec.dims(), reference.dims());
        let diff = (spec - reference)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-3, "max diff {}", diff);
        Ok(())
    }

    #[test]
    fn test_mel_shapes_and_floor() -> Result<()> {
        let cfg = small_config();
        let mel = MelTransform::new(cfg, &Device::Cpu)?;
        let y = Tensor::zeros((2, 160), candle_core::DType::F32, &Device::Cpu)?;
        let m = mel.mel_spectrogram(&y)?;
        assert_eq!(m.dims(), &[2, 10, 10]);
        // 無音はログの下限 ln(1e-5) 付近に張り付く
        let min = m.min_all()?.to_scalar::<f32>()?;
        assert!(min >= (1e-5f32).ln() - 1e-4);
        Ok(())
    }

    #[test]
    fn test_filterbank_nonnegative() {
        let cfg = small_config();
        let f = mel_filter(&cfg);
        assert_eq!(f.len(), 10 * 33);
        assert!(f.iter().all(|&w| w >= 0.0));
        // 各フィルタは少なくとも 1 ビンを持つ
        for m in 0..10 {
            assert!(f[m * 33..(m + 1) * 33].iter().any(|&w| w > 0.0));
        }
    }
}
