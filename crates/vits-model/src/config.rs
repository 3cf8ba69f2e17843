use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// 生成器 (SynthesizerTrn) の構成
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub n_vocab: usize,
    /// 線形スペクトログラムのビン数 (filter_length / 2 + 1)
    pub spec_channels: usize,
    /// 学習時に切り出すフレーム数 (segment_size / hop_length)
    pub segment_frames: usize,
    pub inter_channels: usize,
    pub hidden_channels: usize,
    pub filter_channels: usize,
    pub text_layers: usize,
    pub posterior_layers: usize,
    pub kernel_size: usize,
    pub p_dropout: f64,
    pub n_flows: usize,
    pub upsample_rates: Vec<usize>,
    pub upsample_initial_channel: usize,
    pub n_speakers: usize,
    pub gin_channels: usize,
}

impl GeneratorConfig {
    /// VITS 論文相当の既定値
    pub fn new(n_vocab: usize, spec_channels: usize, segment_frames: usize) -> Self {
        Self {
            n_vocab,
            spec_channels,
            segment_frames,
            inter_channels: 192,
            hidden_channels: 192,
            filter_channels: 256,
            text_layers: 6,
            posterior_layers: 4,
            kernel_size: 5,
            p_dropout: 0.1,
            n_flows: 4,
            upsample_rates: vec![8, 8, 2, 2],
            upsample_initial_channel: 512,
            n_speakers: 0,
            gin_channels: 256,
        }
    }

    /// 波形サンプル数 / フレーム数
    pub fn hop_length(&self) -> usize {
        self.upsample_rates.iter().product()
    }

    pub fn is_multi_speaker(&self) -> bool {
        self.n_speakers > 1
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.n_vocab > 0, "n_vocab must be positive");
        ensure!(
            self.inter_channels % 2 == 0,
            "inter_channels must be even, got {}",
            self.inter_channels
        );
        ensure!(!self.upsample_rates.is_empty(), "upsample_rates must not be empty");
        ensure!(
            self.upsample_initial_channel >> self.upsample_rates.len() > 0,
            "upsample_initial_channel {} too small for {} upsampling stages",
            self.upsample_initial_channel,
            self.upsample_rates.len()
        );
        ensure!(self.segment_frames > 0, "segment_frames must be positive");
        Ok(())
    }
}

/// マルチピリオド識別器の構成
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscriminatorConfig {
    pub periods: Vec<usize>,
    /// スケール識別器の各層のチャネル数
    pub scale_channels: Vec<usize>,
    /// ピリオド識別器の各層のチャネル数
    pub period_channels: Vec<usize>,
    /// 正規化方式の指定。重みの再パラメータ化は行わず、設定値として保持するのみ。
    pub use_spectral_norm: bool,
}

impl Default for DiscriminatorConfig {
    fn default() -> Self {
        Self {
            periods: vec![2, 3, 5, 7, 11],
            scale_channels: vec![16, 64, 256, 1024, 1024, 1024],
            period_channels: vec![32, 128, 512, 1024, 1024],
            use_spectral_norm: false,
        }
    }
}

impl DiscriminatorConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.periods.iter().all(|&p| p > 0), "periods must be positive");
        ensure!(
            self.scale_channels.len() >= 2,
            "scale discriminator needs at least two layers"
        );
        ensure!(
            !self.period_channels.is_empty(),
            "period discriminator needs at least one layer"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrip() -> Result<()> {
        let cfg = GeneratorConfig::new(100, 513, 32);
        assert_eq!(cfg.hop_length(), 256);
        let json = serde_json::to_string(&cfg)?;
        let back: GeneratorConfig = serde_json::from_str(&json)?;
        assert_eq!(cfg, back);
        cfg.validate()?;
        DiscriminatorConfig::default().validate()?;
        Ok(())
    }

    #[test]
    fn test_odd_inter_channels_rejected() {
        let mut cfg = GeneratorConfig::new(10, 33, 4);
        cfg.inter_channels = 7;
        assert!(cfg.validate().is_err());
    }
}
