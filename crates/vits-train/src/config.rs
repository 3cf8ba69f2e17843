use crate::error::ConfigError;
use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use vits_model::decoder::WaveDecoder;
use vits_model::{DiscriminatorConfig, GeneratorConfig};

/// 分散学習のランデブー先 (固定アドレス)
pub const DEFAULT_RENDEZVOUS: &str = "127.0.0.1:54321";
pub const DEFAULT_BUCKET_BOUNDARIES: [usize; 9] = [32, 300, 400, 500, 600, 700, 800, 900, 1000];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
    Metal,
}

/// 「キーは存在するが値が null」と「キー自体が無い」を区別する
fn deserialize_some<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Deserialize::deserialize(deserializer).map(Some)
}

/// JSON から読んだままのハイパーパラメータ。全フィールドが省略可能で、
/// `HParams` への変換時に必須項目を検査する。
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct HParamsFile {
    learning_rate: Option<f64>,
    betas: Option<Vec<f64>>,
    eps: Option<f64>,
    lr_decay: Option<f64>,
    c_mel: Option<f64>,
    c_kl: Option<f64>,
    segment_size: Option<usize>,
    training_audiopaths_and_text: Option<PathBuf>,
    val_audiopaths_and_text: Option<PathBuf>,
    #[serde(default, deserialize_with = "deserialize_some")]
    warm_start_name_g: Option<Option<String>>,
    #[serde(default, deserialize_with = "deserialize_some")]
    warm_start_name_d: Option<Option<String>>,
    batch_size: Option<usize>,
    epochs: Option<usize>,
    epochs_per_checkpoint: Option<usize>,
    fp16_run: Option<bool>,
    distributed_run: Option<bool>,
    device: Option<DeviceKind>,
    hop_length: Option<usize>,
    filter_length: Option<usize>,
    n_speakers: Option<usize>,
    use_spectral_norm: Option<bool>,

    rank: Option<usize>,
    world_size: Option<usize>,
    rendezvous: Option<String>,
    checkpoint_path: Option<PathBuf>,
    log_dir: Option<PathBuf>,
    log_interval: Option<u64>,
    seed: Option<u64>,
    win_length: Option<usize>,
    n_mel_channels: Option<usize>,
    sampling_rate: Option<u32>,
    mel_fmin: Option<f32>,
    mel_fmax: Option<f32>,
    max_wav_value: Option<f32>,
    add_blank: Option<bool>,
    min_text_len: Option<usize>,
    max_text_len: Option<usize>,
    weight_decay: Option<f64>,
    bucket_boundaries: Option<Vec<usize>>,
    val_max_len: Option<usize>,
    debug: Option<bool>,
    debug_dataset_size: Option<usize>,

    inter_channels: Option<usize>,
    hidden_channels: Option<usize>,
    filter_channels: Option<usize>,
    text_layers: Option<usize>,
    posterior_layers: Option<usize>,
    kernel_size: Option<usize>,
    p_dropout: Option<f64>,
    n_flows: Option<usize>,
    upsample_rates: Option<Vec<usize>>,
    upsample_initial_channel: Option<usize>,
    gin_channels: Option<usize>,
    periods: Option<Vec<usize>>,
    scale_channels: Option<Vec<usize>>,
    period_channels: Option<Vec<usize>>,
}

/// モデル形状に関する任意設定。未指定の項目は `GeneratorConfig` / `DiscriminatorConfig` の既定値になる。
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelOverrides {
    pub inter_channels: Option<usize>,
    pub hidden_channels: Option<usize>,
    pub filter_channels: Option<usize>,
    pub text_layers: Option<usize>,
    pub posterior_layers: Option<usize>,
    pub kernel_size: Option<usize>,
    pub p_dropout: Option<f64>,
    pub n_flows: Option<usize>,
    pub upsample_rates: Option<Vec<usize>>,
    pub upsample_initial_channel: Option<usize>,
    pub gin_channels: Option<usize>,
    pub periods: Option<Vec<usize>>,
    pub scale_channels: Option<Vec<usize>>,
    pub period_channels: Option<Vec<usize>>,
}

/// 検証済みのハイパーパラメータ
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HParams {
    pub learning_rate: f64,
    pub betas: (f64, f64),
    pub eps: f64,
    pub lr_decay: f64,
    pub c_mel: f64,
    pub c_kl: f64,
    pub segment_size: usize,
    pub training_audiopaths_and_text: PathBuf,
    pub val_audiopaths_and_text: PathBuf,
    pub warm_start_name_g: Option<String>,
    pub warm_start_name_d: Option<String>,
    pub batch_size: usize,
    pub epochs: usize,
    pub epochs_per_checkpoint: usize,
    pub fp16_run: bool,
    pub distributed_run: bool,
    pub device: DeviceKind,
    pub hop_length: usize,
    pub filter_length: usize,
    pub n_speakers: usize,
    pub use_spectral_norm: bool,

    pub rank: Option<usize>,
    pub world_size: Option<usize>,
    pub rendezvous: String,
    pub checkpoint_path: PathBuf,
    pub log_dir: PathBuf,
    pub log_interval: u64,
    pub seed: u64,
    pub win_length: usize,
    pub n_mel_channels: usize,
    pub sampling_rate: u32,
    pub mel_fmin: f32,
    pub mel_fmax: Option<f32>,
    pub max_wav_value: f32,
    pub add_blank: bool,
    pub min_text_len: usize,
    pub max_text_len: usize,
    pub weight_decay: f64,
    pub bucket_boundaries: Vec<usize>,
    pub val_max_len: usize,
    pub debug: bool,
    pub debug_dataset_size: Option<usize>,
    pub model: ModelOverrides,
}

macro_rules! required {
    ($raw:ident . $field:ident) => {
        $raw.$field.ok_or(ConfigError::MissingField(stringify!($field)))?
    };
}

impl TryFrom<HParamsFile> for HParams {
    type Error = ConfigError;

    fn try_from(raw: HParamsFile) -> Result<Self, Self::Error> {
        // 必須項目は固定の順序で検査し、最初に欠けていたものを報告する
        let learning_rate = required!(raw.learning_rate);
        let betas = required!(raw.betas);
        let eps = required!(raw.eps);
        let lr_decay = required!(raw.lr_decay);
        let c_mel = required!(raw.c_mel);
        let c_kl = required!(raw.c_kl);
        let segment_size = required!(raw.segment_size);
        let training_audiopaths_and_text = required!(raw.training_audiopaths_and_text);
        let val_audiopaths_and_text = required!(raw.val_audiopaths_and_text);
        let warm_start_name_g = required!(raw.warm_start_name_g);
        let warm_start_name_d = required!(raw.warm_start_name_d);
        let batch_size = required!(raw.batch_size);
        let epochs = required!(raw.epochs);
        let epochs_per_checkpoint = required!(raw.epochs_per_checkpoint);
        let fp16_run = required!(raw.fp16_run);
        let distributed_run = required!(raw.distributed_run);
        let device = required!(raw.device);
        let hop_length = required!(raw.hop_length);
        let filter_length = required!(raw.filter_length);
        let n_speakers = required!(raw.n_speakers);
        let use_spectral_norm = required!(raw.use_spectral_norm);

        let betas = match betas.as_slice() {
            [b1, b2] => (*b1, *b2),
            other => {
                return Err(ConfigError::invalid(
                    "betas",
                    format!("expected two values, got {}", other.len()),
                ))
            }
        };

        let hparams = Self {
            learning_rate,
            betas,
            eps,
            lr_decay,
            c_mel,
            c_kl,
            segment_size,
            training_audiopaths_and_text,
            val_audiopaths_and_text,
            warm_start_name_g,
            warm_start_name_d,
            batch_size,
            epochs,
            epochs_per_checkpoint,
            fp16_run,
            distributed_run,
            device,
            hop_length,
            filter_length,
            n_speakers,
            use_spectral_norm,
            rank: raw.rank,
            world_size: raw.world_size,
            rendezvous: raw.rendezvous.unwrap_or_else(|| DEFAULT_RENDEZVOUS.to_string()),
            checkpoint_path: raw.checkpoint_path.unwrap_or_else(|| PathBuf::from("checkpoints")),
            log_dir: raw.log_dir.unwrap_or_else(|| PathBuf::from("logs")),
            log_interval: raw.log_interval.unwrap_or(10),
            seed: raw.seed.unwrap_or(1234),
            win_length: raw.win_length.unwrap_or(filter_length),
            n_mel_channels: raw.n_mel_channels.unwrap_or(80),
            sampling_rate: raw.sampling_rate.unwrap_or(22050),
            mel_fmin: raw.mel_fmin.unwrap_or(0.0),
            mel_fmax: raw.mel_fmax,
            max_wav_value: raw.max_wav_value.unwrap_or(32768.0),
            add_blank: raw.add_blank.unwrap_or(true),
            min_text_len: raw.min_text_len.unwrap_or(1),
            max_text_len: raw.max_text_len.unwrap_or(190),
            weight_decay: raw.weight_decay.unwrap_or(0.01),
            bucket_boundaries: raw
                .bucket_boundaries
                .unwrap_or_else(|| DEFAULT_BUCKET_BOUNDARIES.to_vec()),
            val_max_len: raw.val_max_len.unwrap_or(1000),
            debug: raw.debug.unwrap_or(false),
            debug_dataset_size: raw.debug_dataset_size,
            model: ModelOverrides {
                inter_channels: raw.inter_channels,
                hidden_channels: raw.hidden_channels,
                filter_channels: raw.filter_channels,
                text_layers: raw.text_layers,
                posterior_layers: raw.posterior_layers,
                kernel_size: raw.kernel_size,
                p_dropout: raw.p_dropout,
                n_flows: raw.n_flows,
                upsample_rates: raw.upsample_rates,
                upsample_initial_channel: raw.upsample_initial_channel,
                gin_channels: raw.gin_channels,
                periods: raw.periods,
                scale_channels: raw.scale_channels,
                period_channels: raw.period_channels,
            },
        };
        hparams.validate()?;
        Ok(hparams)
    }
}

impl HParams {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let raw: HParamsFile = serde_json::from_str(json)?;
        Self::try_from(raw)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let hparams = Self::from_json_str(&json)?;
        tracing::debug!(?path, "hyperparameters loaded");
        Ok(hparams)
    }

    /// コマンドラインで与えられたランク情報で上書きする
    pub fn with_identity(mut self, rank: Option<usize>, world_size: Option<usize>) -> Result<Self, ConfigError> {
        if rank.is_some() {
            self.rank = rank;
        }
        if world_size.is_some() {
            self.world_size = world_size;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", "must be positive"));
        }
        if self.epochs_per_checkpoint == 0 {
            return Err(ConfigError::invalid("epochs_per_checkpoint", "must be positive"));
        }
        if self.hop_length == 0 || self.segment_size % self.hop_length != 0 {
            return Err(ConfigError::invalid(
                "segment_size",
                format!(
                    "{} is not a multiple of hop_length {}",
                    self.segment_size, self.hop_length
                ),
            ));
        }
        if self.segment_frames() < WaveDecoder::min_backward_frames() {
            return Err(ConfigError::invalid(
                "segment_size",
                format!(
                    "{} frames per segment, need at least {}",
                    self.segment_frames(),
                    WaveDecoder::min_backward_frames()
                ),
            ));
        }
        if self.filter_length < self.hop_length || self.win_length > self.filter_length {
            return Err(ConfigError::invalid(
                "filter_length",
                "must satisfy hop_length <= filter_length and win_length <= filter_length",
            ));
        }
        let rates = self.upsample_rates();
        if rates.iter().product::<usize>() != self.hop_length {
            return Err(ConfigError::invalid(
                "upsample_rates",
                format!("{:?} does not multiply to hop_length {}", rates, self.hop_length),
            ));
        }
        if let (Some(rank), Some(world)) = (self.rank, self.world_size) {
            if rank >= world {
                return Err(ConfigError::invalid(
                    "rank",
                    format!("rank {} out of range for world_size {}", rank, world),
                ));
            }
        }
        if self.bucket_boundaries.len() < 2 || self.bucket_boundaries.windows(2).any(|w| w[0] >= w[1]) {
            return Err(ConfigError::invalid(
                "bucket_boundaries",
                "need at least two strictly increasing boundaries",
            ));
        }
        if self.model.inter_channels.is_some_and(|c| c % 2 != 0) {
            return Err(ConfigError::invalid("inter_channels", "must be even"));
        }
        if self.max_wav_value <= 0.0 {
            return Err(ConfigError::invalid("max_wav_value", "must be positive"));
        }
        Ok(())
    }

    pub fn upsample_rates(&self) -> Vec<usize> {
        self.model
            .upsample_rates
            .clone()
            .unwrap_or_else(|| vec![8, 8, 2, 2])
    }

    pub fn spec_channels(&self) -> usize {
        self.filter_length / 2 + 1
    }

    pub fn segment_frames(&self) -> usize {
        self.segment_size / self.hop_length
    }

    pub fn generator_config(&self, n_vocab: usize) -> GeneratorConfig {
        let mut cfg = GeneratorConfig::new(n_vocab, self.spec_channels(), self.segment_frames());
        let m = &self.model;
        cfg.inter_channels = m.inter_channels.unwrap_or(cfg.inter_channels);
        cfg.hidden_channels = m.hidden_channels.unwrap_or(cfg.hidden_channels);
        cfg.filter_channels = m.filter_channels.unwrap_or(cfg.filter_channels);
        cfg.text_layers = m.text_layers.unwrap_or(cfg.text_layers);
        cfg.posterior_layers = m.posterior_layers.unwrap_or(cfg.posterior_layers);
        cfg.kernel_size = m.kernel_size.unwrap_or(cfg.kernel_size);
        cfg.p_dropout = m.p_dropout.unwrap_or(cfg.p_dropout);
        cfg.n_flows = m.n_flows.unwrap_or(cfg.n_flows);
        cfg.upsample_rates = self.upsample_rates();
        cfg.upsample_initial_channel = m.upsample_initial_channel.unwrap_or(cfg.upsample_initial_channel);
        cfg.gin_channels = m.gin_channels.unwrap_or(cfg.gin_channels);
        cfg.n_speakers = self.n_speakers;
        cfg
    }

    pub fn discriminator_config(&self) -> DiscriminatorConfig {
        let mut cfg = DiscriminatorConfig {
            use_spectral_norm: self.use_spectral_norm,
            ..Default::default()
        };
        if let Some(periods) = &self.model.periods {
            cfg.periods = periods.clone();
        }
        if let Some(ch) = &self.model.scale_channels {
            cfg.scale_channels = ch.clone();
        }
        if let Some(ch) = &self.model.period_channels {
            cfg.period_channels = ch.clone();
        }
        cfg
    }
}
