//! VITS の敵対的学習パイプライン
//!
//! ハイパーパラメータの読み込み、データセットとバケットサンプラ、
//! 生成器・識別器の交互更新、損失スケーリング、チェックポイント、
//! 複数プロセスでの勾配平均を提供する。

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod distributed;
pub mod error;
pub mod logger;
pub mod losses;
pub mod mel;
pub mod nets;
pub mod optim;
pub mod preprocess;
pub mod sampler;
pub mod scaler;
pub mod trainer;

pub use config::HParams;
pub use error::{ConfigError, Result, TrainError};
pub use trainer::{TrainPhase, TrainSummary, Trainer};
