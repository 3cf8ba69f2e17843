use std::path::PathBuf;
use thiserror::Error;

/// ハイパーパラメータの読み込み・検証エラー
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required hyperparameter `{0}` is missing")]
    MissingField(&'static str),

    #[error("invalid hyperparameter `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to parse hyperparameters: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read hyperparameters from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// 学習パイプライン全体のエラー
#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("distributed training requires both `rank` and `world_size`")]
    MissingDistributedIdentity,

    #[error("distributed error: {0}")]
    Distributed(String),

    #[error("checkpoint {path:?}: {reason}")]
    Checkpoint { path: PathBuf, reason: String },

    #[error("parameter/state mismatch: {0}")]
    StateMismatch(String),

    #[error("loss scaler misuse: {0}")]
    ScalerState(String),

    #[error("numerical error: {0}")]
    Numerical(String),

    #[error("data error: {0}")]
    Data(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Wav(#[from] hound::Error),

    #[error(transparent)]
    Model(#[from] anyhow::Error),
}

impl TrainError {
    pub fn checkpoint(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Checkpoint {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TrainError>;
