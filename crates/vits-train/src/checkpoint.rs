//! チェックポイントの保存・読み込みとウォームスタート
//!
//! 1 ファイルに 1 ネットワーク分の状態を safetensors で保存する。
//! キーは `model.*`, `optimizer.*`, `meta.*`。

use crate::error::{Result, TrainError};
use crate::nets::{NetRole, Network};
use crate::optim::AdamW;
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const EXT: &str = "safetensors";

/// 学習の進行状態。オーケストレータだけが更新する。
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingState {
    pub global_step: u64,
    pub learning_rate: f64,
    pub epoch: usize,
    pub rank: usize,
    pub world_size: usize,
}

impl TrainingState {
    pub fn new(learning_rate: f64, rank: usize, world_size: usize) -> Self {
        Self {
            global_step: 0,
            learning_rate,
            epoch: 0,
            rank,
            world_size,
        }
    }
}

/// 読み込んだチェックポイントの中身
pub struct CheckpointRecord {
    pub model: HashMap<String, Tensor>,
    pub optimizer: HashMap<String, Tensor>,
    pub global_step: u64,
    pub learning_rate: f64,
    pub epoch: usize,
    pub model_config: serde_json::Value,
}

/// `epoch` がチェックポイント保存の対象か
pub fn should_checkpoint(epoch: usize, epochs_per_checkpoint: usize) -> bool {
    epochs_per_checkpoint > 0 && epoch % epochs_per_checkpoint == 0
}

/// `vits_G_<step>` / `vits_D_<step>`
pub fn checkpoint_name(role: NetRole, global_step: u64) -> String {
    format!("vits_{}_{}", role.tag(), global_step)
}

pub struct CheckpointManager {
    dir: PathBuf,
    rank: usize,
}

fn meta_scalar_i64(path: &Path, tensors: &HashMap<String, Tensor>, key: &str) -> Result<i64> {
    let t = tensors
        .get(key)
        .ok_or_else(|| TrainError::checkpoint(path, format!("missing `{}`", key)))?;
    let v = t.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?;
    v.first()
        .copied()
        .ok_or_else(|| TrainError::checkpoint(path, format!("empty `{}`", key)))
}

impl CheckpointManager {
    pub fn new<P: Into<PathBuf>>(dir: P, rank: usize) -> Self {
        Self { dir: dir.into(), rank }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, EXT))
    }

    /// 既存のパスならそのまま、そうでなければ保存先ディレクトリ内の名前として解決する
    pub fn resolve(&self, name: &str) -> PathBuf {
        let direct = PathBuf::from(name);
        if direct.is_file() {
            direct
        } else {
            self.path_for(name)
        }
    }

    /// ランク 0 以外では何もしない。一時ファイルに書いてから置き換える。
    pub fn save<M>(
        &self,
        name: &str,
        net: &Network<M>,
        optim: &AdamW,
        learning_rate: f64,
        epoch: usize,
        global_step: u64,
    ) -> Result<Option<PathBuf>> {
        if self.rank != 0 {
            return Ok(None);
        }
        std::fs::create_dir_all(&self.dir)?;
        let cpu = Device::Cpu;
        let mut tensors = HashMap::new();
        for (k, v) in net.state_dict()? {
            tensors.insert(format!("model.{}", k), v.to_device(&cpu)?);
        }
        for (k, v) in optim.state_dict()? {
            tensors.insert(format!("optimizer.{}", k), v.to_device(&cpu)?);
        }
        tensors.insert("meta.global_step".into(), Tensor::new(&[global_step as i64], &cpu)?);
        tensors.insert("meta.learning_rate".into(), Tensor::new(&[learning_rate], &cpu)?);
        tensors.insert("meta.epoch".into(), Tensor::new(&[epoch as i64], &cpu)?);
        let config = serde_json::to_vec(net.config_json())?;
        let n = config.len();
        tensors.insert("meta.model_config".into(), Tensor::from_vec(config, (n,), &cpu)?);

        let path = self.path_for(name);
        let tmp = path.with_extension(format!("{}.tmp", EXT));
        candle_core::safetensors::save(&tensors, &tmp)?;
        std::fs::rename(&tmp, &path)?;
        tracing::info!(?path, role = %net.role(), global_step, epoch, "checkpoint saved");
        Ok(Some(path))
    }

    pub fn load(&self, path: &Path) -> Result<CheckpointRecord> {
        if !path.is_file() {
            return Err(TrainError::checkpoint(path, "file not found"));
        }
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .map_err(|e| TrainError::checkpoint(path, e.to_string()))?;

        let global_step = meta_scalar_i64(path, &tensors, "meta.global_step")?;
        let epoch = meta_scalar_i64(path, &tensors, "meta.epoch")?;
        let learning_rate = tensors
            .get("meta.learning_rate")
            .ok_or_else(|| TrainError::checkpoint(path, "missing `meta.learning_rate`"))?
            .to_dtype(DType::F64)?
            .flatten_all()?
            .to_vec1::<f64>()?;
        let learning_rate = *learning_rate
            .first()
            .ok_or_else(|| TrainError::checkpoint(path, "empty `meta.learning_rate`"))?;
        let model_config = match tensors.get("meta.model_config") {
            Some(t) => serde_json::from_slice(&t.to_vec1::<u8>()?)
                .map_err(|e| TrainError::checkpoint(path, format!("bad model config: {}", e)))?,
            None => return Err(TrainError::checkpoint(path, "missing `meta.model_config`")),
        };

        let mut model = HashMap::new();
        let mut optimizer = HashMap::new();
        for (k, v) in tensors {
            if let Some(name) = k.strip_prefix("model.") {
                model.insert(name.to_string(), v);
            } else if let Some(name) = k.strip_prefix("optimizer.") {
                optimizer.insert(name.to_string(), v);
            }
        }
        if global_step < 0 || epoch < 0 {
            return Err(TrainError::checkpoint(path, "negative step or epoch"));
        }
        Ok(CheckpointRecord {
            model,
            optimizer,
            global_step: global_step as u64,
            learning_rate,
            epoch: epoch as usize,
            model_config,
        })
    }

    /// 1 ネットワーク分を復元し、読み込んだレコードを返す
    pub fn restore<M>(&self, name: &str, net: &Network<M>, optim: &mut AdamW) -> Result<CheckpointRecord> {
        let path = self.resolve(name);
        let record = self.load(&path)?;
        if &record.model_config != net.config_json() {
            tracing::warn!(?path, role = %net.role(), "model config in checkpoint differs from current config");
        }
        net.load_state_dict(&record.model)?;
        optim.load_state_dict(&record.optimizer)?;
        tracing::info!(?path, role = %net.role(), global_step = record.global_step, epoch = record.epoch, "checkpoint restored");
        Ok(record)
    }

    /// 生成器・識別器の両方の名前が指定されたときだけ復元する。戻り値は開始エポック。
    /// step / epoch / learning_rate は後から読む識別器側の値で上書きされる。
    #[allow(clippy::too_many_arguments)]
    pub fn warm_start<G, D>(
        &self,
        name_g: Option<&str>,
        name_d: Option<&str>,
        net_g: &Network<G>,
        net_d: &Network<D>,
        optim_g: &mut AdamW,
        optim_d: &mut AdamW,
        state: &mut TrainingState,
    ) -> Result<usize> {
        let (Some(name_g), Some(name_d)) = (name_g, name_d) else {
            return Ok(0);
        };
        let rec_g = self.restore(name_g, net_g, optim_g)?;
        let rec_d = self.restore(name_d, net_d, optim_d)?;
        if (rec_g.global_step, rec_g.epoch) != (rec_d.global_step, rec_d.epoch) || rec_g.learning_rate != rec_d.learning_rate {
            tracing::warn!(
                g_step = rec_g.global_step,
                d_step = rec_d.global_step,
                g_epoch = rec_g.epoch,
                d_epoch = rec_d.epoch,
                "generator and discriminator checkpoints disagree; using discriminator values"
            );
        }
        state.global_step = rec_d.global_step;
        state.learning_rate = rec_d.learning_rate;
        state.epoch = rec_d.epoch;
        Ok(rec_d.epoch)
    }
}
