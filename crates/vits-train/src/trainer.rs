//! 生成器と識別器を交互に更新する学習オーケストレータ
//!
//! 状態遷移:
//! `Init -> DistributedSetup -> DataReady -> ModelReady -> WarmStarted -> EpochLoop -> Done`

use crate::checkpoint::{checkpoint_name, should_checkpoint, CheckpointManager, TrainingState};
use crate::config::HParams;
use crate::dataset::{Batch, DatasetParams, SequentialLoader, TextAudioSpeakerDataset};
use crate::distributed::DistributedContext;
use crate::error::{Result, TrainError};
use crate::logger::{metric_key, LogPayload, LogSink};
use crate::losses::{discriminator_loss, feature_loss, generator_loss, kl_loss, mel_l1};
use crate::mel::{MelConfig, MelTransform};
use crate::nets::{NetRole, Network};
use crate::optim::{clip_grad_value, AdamW, AdamWConfig, ExponentialLr};
use crate::sampler::DistributedBucketSampler;
use crate::scaler::LossScaler;
use candle_core::{DType, Tensor};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::ops::{Deref, DerefMut};
use std::path::PathBuf;
use vits_core::SymbolTokenizer;
use vits_model::commons::slice_segments;
use vits_model::{MultiPeriodDiscriminator, SynthesizerTrn};

/// 検証時のノイズ倍率と話速
const INFER_NOISE_SCALE: f64 = 0.667;
const INFER_LENGTH_SCALE: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainPhase {
    Init,
    DistributedSetup,
    DataReady,
    ModelReady,
    WarmStarted,
    EpochLoop,
    Done,
}

/// 学習終了時の結果
#[derive(Debug, Clone)]
pub struct TrainSummary {
    pub global_step: u64,
    pub start_epoch: usize,
    pub epochs_run: usize,
    pub checkpoints: Vec<PathBuf>,
}

/// 生成器を評価モードにし、スコープを抜けるときに必ず学習モードへ戻す
pub struct EvalMode<'a> {
    net: &'a mut SynthesizerTrn,
}

impl<'a> EvalMode<'a> {
    pub fn new(net: &'a mut SynthesizerTrn) -> Self {
        net.eval();
        Self { net }
    }
}

impl Deref for EvalMode<'_> {
    type Target = SynthesizerTrn;

    fn deref(&self) -> &Self::Target {
        self.net
    }
}

impl DerefMut for EvalMode<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.net
    }
}

impl Drop for EvalMode<'_> {
    fn drop(&mut self) {
        self.net.train();
    }
}

struct Loaders {
    train: TextAudioSpeakerDataset,
    sampler: DistributedBucketSampler,
    /// 検証データはランク 0 だけが持つ
    val: Option<TextAudioSpeakerDataset>,
}

struct Models {
    net_g: Network<SynthesizerTrn>,
    net_d: Network<MultiPeriodDiscriminator>,
    optim_g: AdamW,
    optim_d: AdamW,
}

/// 1 ステップ分の損失 (ログ用に f32 へ落としたもの)
#[derive(Debug, Clone, Default)]
pub struct StepLosses {
    pub disc_total: f32,
    pub disc_real: Vec<f32>,
    pub disc_fake: Vec<f32>,
    pub gen_total: f32,
    pub gen_adv: f32,
    pub fm: f32,
    pub mel: f32,
    pub dur: f32,
    pub kl: f32,
    pub d_stepped: bool,
    pub g_stepped: bool,
    /// ログを出したステップだけ `(識別器, 生成器)` の勾配 L2 ノルム。
    /// どちらも各自の更新に使った勾配で測るので、識別器側は生成器パスで
    /// 識別器パラメータに流れる勾配を含まない。
    pub grad_norms: Option<(f64, f64)>,
}

pub struct Trainer<S: LogSink> {
    hp: HParams,
    ctx: DistributedContext,
    sink: S,
    mel: MelTransform,
    scaler: LossScaler,
    state: TrainingState,
    ckpt: CheckpointManager,
    rng: StdRng,
    phase: TrainPhase,
}

fn scalar(t: &Tensor) -> Result<f32> {
    Ok(t.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

impl<S: LogSink> Trainer<S> {
    pub fn new(hp: HParams, ctx: DistributedContext, sink: S) -> Result<Self> {
        hp.validate()?;
        if hp.distributed_run && ctx.world_size() != hp.world_size.unwrap_or(1) {
            return Err(TrainError::Distributed(format!(
                "process group has {} ranks but world_size is {:?}",
                ctx.world_size(),
                hp.world_size
            )));
        }
        let mel = MelTransform::new(MelConfig::from_hparams(&hp), ctx.device())?;
        let state = TrainingState::new(hp.learning_rate, ctx.rank(), ctx.world_size());
        let ckpt = CheckpointManager::new(hp.checkpoint_path.clone(), ctx.rank());
        let rng = StdRng::seed_from_u64(hp.seed.wrapping_add(ctx.rank() as u64));
        let scaler = LossScaler::new(hp.fp16_run);
        Ok(Self {
            hp,
            ctx,
            sink,
            mel,
            scaler,
            state,
            ckpt,
            rng,
            phase: TrainPhase::Init,
        })
    }

    /// 設定からプロセスグループとデバイスを用意して組み立てる。
    /// シンクはランクが決まってから作る (ファイル出力をランク 0 に限るため)。
    pub fn init<F>(hp: HParams, make_sink: F) -> Result<Self>
    where
        F: FnOnce(&DistributedContext) -> Result<S>,
    {
        hp.validate()?;
        let distributed = hp.distributed_run;
        if distributed {
            tracing::debug!(from = ?TrainPhase::Init, to = ?TrainPhase::DistributedSetup, "phase transition");
        }
        let ctx = DistributedContext::init(&hp)?;
        let sink = make_sink(&ctx)?;
        let mut trainer = Self::new(hp, ctx, sink)?;
        if distributed {
            trainer.phase = TrainPhase::DistributedSetup;
        }
        Ok(trainer)
    }

    pub fn phase(&self) -> TrainPhase {
        self.phase
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    fn enter(&mut self, phase: TrainPhase) {
        tracing::debug!(from = ?self.phase, to = ?phase, "phase transition");
        self.phase = phase;
    }

    /// プロセスグループを破棄して終了する
    pub fn shutdown(self) -> Result<()> {
        self.ctx.shutdown()
    }

    fn build_loaders(&self) -> Result<Loaders> {
        let tokenizer = SymbolTokenizer::new();
        let params = DatasetParams::from_hparams(&self.hp);
        let mut train = TextAudioSpeakerDataset::load(&self.hp.training_audiopaths_and_text, params.clone(), &tokenizer)?;
        if self.hp.debug {
            if let Some(n) = self.hp.debug_dataset_size {
                train.truncate(n);
            }
        }
        if train.is_empty() {
            return Err(TrainError::Data("training set is empty after filtering".into()));
        }
        let sampler = DistributedBucketSampler::new(
            &train.lengths(),
            self.hp.batch_size,
            &self.hp.bucket_boundaries,
            self.ctx.world_size(),
            self.ctx.rank(),
            true,
            self.hp.seed,
        )?;
        let val = if self.ctx.is_primary() {
            let mut val = TextAudioSpeakerDataset::load(&self.hp.val_audiopaths_and_text, params, &tokenizer)?;
            if self.hp.debug {
                if let Some(n) = self.hp.debug_dataset_size {
                    val.truncate(n);
                }
            }
            Some(val)
        } else {
            None
        };
        tracing::info!(
            train = train.len(),
            batches_per_epoch = sampler.len(),
            val = ?val.as_ref().map(|v| v.len()),
            "data ready"
        );
        Ok(Loaders { train, sampler, val })
    }

    fn build_models(&self) -> Result<Models> {
        let n_vocab = SymbolTokenizer::new().vocab_size();
        let device = self.ctx.device().clone();
        let g_cfg = self.hp.generator_config(n_vocab);
        let d_cfg = self.hp.discriminator_config();
        let net_g = Network::build(NetRole::Generator, &g_cfg, &device, |c, vs| SynthesizerTrn::new(c, vs))?;
        let net_d = Network::build(NetRole::Discriminator, &d_cfg, &device, |c, vs| {
            MultiPeriodDiscriminator::new(c, vs)
        })?;

        let adam = AdamWConfig {
            lr: self.hp.learning_rate,
            beta1: self.hp.betas.0,
            beta2: self.hp.betas.1,
            eps: self.hp.eps,
            weight_decay: self.hp.weight_decay,
        };
        let optim_g = AdamW::new(net_g.named_vars()?, adam)?;
        let optim_d = AdamW::new(net_d.named_vars()?, adam)?;
        tracing::info!(
            generator_params = net_g.num_parameters()?,
            discriminator_params = net_d.num_parameters()?,
            "models built"
        );
        Ok(Models {
            net_g,
            net_d,
            optim_g,
            optim_d,
        })
    }

    /// 設定されたエポック数まで学習する
    pub fn train(&mut self) -> Result<TrainSummary> {
        let mut loaders = self.build_loaders()?;
        self.enter(TrainPhase::DataReady);

        let mut models = self.build_models()?;
        self.enter(TrainPhase::ModelReady);

        let start_epoch = self.ckpt.warm_start(
            self.hp.warm_start_name_g.as_deref(),
            self.hp.warm_start_name_d.as_deref(),
            &models.net_g,
            &models.net_d,
            &mut models.optim_g,
            &mut models.optim_d,
            &mut self.state,
        )?;
        self.ctx.broadcast_parameters(&models.net_g)?;
        self.ctx.broadcast_parameters(&models.net_d)?;
        self.enter(TrainPhase::WarmStarted);

        let last_epoch = start_epoch as i64 - 1;
        let mut scheduler_g = ExponentialLr::new(self.hp.learning_rate, self.hp.lr_decay, last_epoch);
        let mut scheduler_d = ExponentialLr::new(self.hp.learning_rate, self.hp.lr_decay, last_epoch);

        self.enter(TrainPhase::EpochLoop);
        let mut checkpoints = Vec::new();
        for epoch in start_epoch..self.hp.epochs {
            self.state.epoch = epoch;
            models.optim_g.set_learning_rate(scheduler_g.lr());
            models.optim_d.set_learning_rate(scheduler_d.lr());
            self.state.learning_rate = scheduler_g.lr();

            self.train_epoch(epoch, &mut models, &mut loaders)?;

            if self.ctx.is_primary() {
                if let Some(val) = loaders.val.as_ref() {
                    self.evaluate(&mut models.net_g, val)?;
                }
            }

            if should_checkpoint(epoch, self.hp.epochs_per_checkpoint) {
                for saved in [
                    self.ckpt.save(
                        &checkpoint_name(NetRole::Generator, self.state.global_step),
                        &models.net_g,
                        &models.optim_g,
                        self.state.learning_rate,
                        epoch,
                        self.state.global_step,
                    )?,
                    self.ckpt.save(
                        &checkpoint_name(NetRole::Discriminator, self.state.global_step),
                        &models.net_d,
                        &models.optim_d,
                        self.state.learning_rate,
                        epoch,
                        self.state.global_step,
                    )?,
                ]
                .into_iter()
                .flatten()
                {
                    checkpoints.push(saved);
                }
            }
            scheduler_g.step();
            scheduler_d.step();
            self.sink.flush()?;
        }
        self.enter(TrainPhase::Done);
        tracing::info!(global_step = self.state.global_step, "training finished");
        Ok(TrainSummary {
            global_step: self.state.global_step,
            start_epoch,
            epochs_run: self.hp.epochs.saturating_sub(start_epoch),
            checkpoints,
        })
    }

    fn train_epoch(&mut self, epoch: usize, models: &mut Models, loaders: &mut Loaders) -> Result<()> {
        loaders.sampler.set_epoch(epoch as u64);
        models.net_g.module.train();
        let batches = loaders.sampler.batches();
        tracing::info!(epoch, batches = batches.len(), lr = self.state.learning_rate, "epoch start");
        for (batch_idx, ids) in batches.iter().enumerate() {
            let batch = loaders.train.collate(ids)?;
            tracing::debug!(global_step = self.state.global_step, batch_idx, "step");
            self.train_step(models, &batch)?;
        }
        Ok(())
    }

    /// 識別器 -> 生成器の順に 1 回ずつ更新し、スケーラを 1 回だけ更新する
    fn train_step(&mut self, models: &mut Models, batch: &Batch) -> Result<StepLosses> {
        let device = self.ctx.device().clone();
        let batch = batch.to_device(&device)?;
        let hop = self.hp.hop_length;
        let segment_frames = self.hp.segment_frames();

        let out = models.net_g.module.forward(
            &batch.x,
            &batch.x_lengths,
            &batch.spec,
            &batch.spec_lengths,
            &batch.speakers,
            &mut self.rng,
        )?;

        let mel = self.mel.spec_to_mel(&batch.spec)?;
        let y_mel = slice_segments(&mel, &out.ids_slice, segment_frames)?;
        let y_hat_mel = self.mel.mel_spectrogram(&out.y_hat.squeeze(1)?)?;
        let wav_ids: Vec<usize> = out.ids_slice.iter().map(|&i| i * hop).collect();
        let y = slice_segments(&batch.y, &wav_ids, self.hp.segment_size)?;

        // 識別器
        let disc = models.net_d.module.forward(&y, &out.y_hat.detach())?;
        let (loss_disc, disc_real, disc_fake) = discriminator_loss(&disc.real, &disc.fake)?;
        let scaled = self.scaler.scale(&loss_disc)?;
        let mut grads_d = self.ctx.backward(&models.net_d, &scaled)?;
        self.scaler.unscale(NetRole::Discriminator, &mut grads_d)?;
        let d_stepped = self
            .scaler
            .step(NetRole::Discriminator, &mut models.optim_d, &grads_d)?;

        // 生成器
        let disc = models.net_d.module.forward(&y, &out.y_hat)?;
        let loss_dur = out.l_length.to_dtype(DType::F32)?.sum_all()?;
        let loss_mel = (mel_l1(&y_mel, &y_hat_mel)? * self.hp.c_mel)?;
        let loss_kl = (kl_loss(&out.z_p, &out.logs_q, &out.m_p, &out.logs_p, &out.z_mask)? * self.hp.c_kl)?;
        let loss_fm = feature_loss(&disc.fmap_real, &disc.fmap_fake)?;
        let (loss_gen, _losses_gen) = generator_loss(&disc.fake)?;
        let loss_gen_all = ((((&loss_gen + &loss_fm)? + &loss_mel)? + &loss_dur)? + &loss_kl)?;

        let scaled = self.scaler.scale(&loss_gen_all)?;
        let mut grads_g = self.ctx.backward(&models.net_g, &scaled)?;
        self.scaler.unscale(NetRole::Generator, &mut grads_g)?;
        let g_stepped = self.scaler.step(NetRole::Generator, &mut models.optim_g, &grads_g)?;
        self.scaler.update()?;

        let mut losses = StepLosses {
            disc_total: scalar(&loss_disc)?,
            disc_real,
            disc_fake,
            gen_total: scalar(&loss_gen_all)?,
            gen_adv: scalar(&loss_gen)?,
            fm: scalar(&loss_fm)?,
            mel: scalar(&loss_mel)?,
            dur: scalar(&loss_dur)?,
            kl: scalar(&loss_kl)?,
            d_stepped,
            g_stepped,
            grad_norms: None,
        };

        if self.ctx.is_primary() && self.state.global_step % self.hp.log_interval.max(1) == 0 {
            let grad_norm_d = clip_grad_value(&mut grads_d, None)?;
            let grad_norm_g = clip_grad_value(&mut grads_g, None)?;
            losses.grad_norms = Some((grad_norm_d, grad_norm_g));
            let step = self.state.global_step;
            let scalars = [
                ("loss_g_total", losses.gen_total as f64),
                ("loss_d_total", losses.disc_total as f64),
                ("gradnorm_d", grad_norm_d),
                ("gradnorm_g", grad_norm_g),
                ("loss_g_fm", losses.fm as f64),
                ("loss_g_dur", losses.dur as f64),
                ("loss_g_mel", losses.mel as f64),
                ("loss_g_kl", losses.kl as f64),
                ("loss_g_adv", losses.gen_adv as f64),
            ];
            for (name, value) in scalars {
                self.sink.log(&metric_key(name), step, LogPayload::Scalar(value))?;
            }
            let images = [
                ("slice_mel_org", y_mel.get(0)?),
                ("slice_mel_gen", y_hat_mel.get(0)?),
                ("all_mel", mel.get(0)?),
                ("all_attn", out.attn.get(0)?.get(0)?),
            ];
            for (name, image) in &images {
                self.sink.log(&metric_key(name), step, LogPayload::Image(image))?;
            }
            tracing::info!(
                step,
                epoch = self.state.epoch,
                loss_g = losses.gen_total,
                loss_d = losses.disc_total,
                mel = losses.mel,
                kl = losses.kl,
                "train"
            );
        }

        self.state.global_step += 1;
        Ok(losses)
    }

    /// 検証データの先頭 1 件で推論し、音声とメルを記録する
    fn evaluate(&mut self, net_g: &mut Network<SynthesizerTrn>, val: &TextAudioSpeakerDataset) -> Result<()> {
        if val.is_empty() {
            tracing::warn!("validation set is empty, skipping evaluation");
            return Ok(());
        }
        let device = self.ctx.device().clone();
        let loader = SequentialLoader::new(val, self.hp.batch_size);
        let batch = loader.batch(0)?.first()?.to_device(&device)?;
        let hop = self.hp.hop_length;

        let generator = EvalMode::new(&mut net_g.module);
        let out = generator.infer(
            &batch.x,
            &batch.x_lengths,
            &batch.speakers,
            Some(self.hp.val_max_len),
            INFER_NOISE_SCALE,
            INFER_LENGTH_SCALE,
        )?;
        drop(generator);

        let y_hat = out.y_hat.detach();
        let predicted = scalar(&out.y_mask.sum_all()?)? as usize * hop;
        let y_hat_len = predicted.min(y_hat.dim(2)?);
        let mut y_hat_flat = y_hat.squeeze(1)?;
        // 反射パディングが効く長さを確保する
        if y_hat_flat.dim(1)? < self.hp.filter_length {
            let short = self.hp.filter_length - y_hat_flat.dim(1)?;
            y_hat_flat = y_hat_flat.pad_with_zeros(1, 0, short)?;
        }
        let y_hat_mel = self.mel.mel_spectrogram(&y_hat_flat)?;
        let mel = self.mel.spec_to_mel(&batch.spec)?;

        let step = self.state.global_step;
        self.sink.log("Val/mel_gen", step, LogPayload::Image(&y_hat_mel.get(0)?))?;
        self.sink.log("Val/mel_gt", step, LogPayload::Image(&mel.get(0)?))?;

        let gen_audio = y_hat.flatten_all()?.narrow(0, 0, y_hat_len)?.to_vec1::<f32>()?;
        let y_len = batch.y_lengths.to_vec1::<u32>()?.first().copied().unwrap_or(0) as usize;
        let gt_audio = batch.y.flatten_all()?.narrow(0, 0, y_len)?.to_vec1::<f32>()?;
        let sample_rate = self.hp.sampling_rate;
        self.sink.log(
            "Val/audio_gen",
            step,
            LogPayload::Audio {
                samples: &gen_audio,
                sample_rate,
            },
        )?;
        self.sink.log(
            "Val/audio_gt",
            step,
            LogPayload::Audio {
                samples: &gt_audio,
                sample_rate,
            },
        )?;
        tracing::info!(step, generated_samples = y_hat_len, "validation logged");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::base_json;
    use crate::dataset::tests::write_sine;
    use crate::logger::FileSink;
    use candle_core::Device;
    use serde_json::json;
    use std::path::Path;

    fn tiny_hparams(root: &Path, epochs: usize) -> Result<HParams> {
        let wavs = [("a.wav", 320, 440.0), ("b.wav", 480, 220.0), ("c.wav", 400, 330.0), ("d.wav", 640, 550.0)];
        for (name, len, freq) in wavs {
            write_sine(&root.join(name), 8000, len, freq)?;
        }
        std::fs::write(
            root.join("train.txt"),
            "a.wav|hello|0\nb.wav|good morning|0\nc.wav|tiny test|0\nd.wav|one more line|0\n",
        )?;
        std::fs::write(root.join("val.txt"), "b.wav|good morning|0\na.wav|hello|0\n")?;

        let mut v = base_json();
        let o = json!({
            "training_audiopaths_and_text": root.join("train.txt"),
            "val_audiopaths_and_text": root.join("val.txt"),
            "checkpoint_path": root.join("ckpt"),
            "log_dir": root.join("logs"),
            "batch_size": 2,
            "epochs": epochs,
            "epochs_per_checkpoint": 2,
            "log_interval": 1,
            "sampling_rate": 8000,
            "hop_length": 16,
            "filter_length": 64,
            "n_mel_channels": 10,
            "segment_size": 128,
            "bucket_boundaries": [10, 100],
            "upsample_rates": [4, 4],
            "upsample_initial_channel": 8,
            "inter_channels": 4,
            "hidden_channels": 8,
            "filter_channels": 8,
            "text_layers": 1,
            "posterior_layers": 1,
            "n_flows": 1,
            "periods": [2, 3],
            "scale_channels": [4, 16, 16],
            "period_channels": [4, 8],
            "val_max_len": 50
        });
        if let (Some(dst), Some(src)) = (v.as_object_mut(), o.as_object()) {
            for (k, val) in src {
                dst.insert(k.clone(), val.clone());
            }
        }
        Ok(HParams::from_json_str(&v.to_string())?)
    }

    fn trainer(hp: HParams) -> Result<Trainer<FileSink>> {
        let sink = FileSink::create(&hp.log_dir)?;
        Trainer::new(hp, DistributedContext::single(Device::Cpu), sink)
    }

    #[test]
    fn test_init_enters_distributed_setup() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let hp = tiny_hparams(dir.path(), 1)?;
        let t = Trainer::init(hp.clone(), |ctx| {
            assert_eq!(ctx.world_size(), 1);
            FileSink::create(dir.path().join("logs"))
        })?;
        assert_eq!(t.phase(), TrainPhase::Init);
        t.shutdown()?;

        let mut dist = hp;
        dist.distributed_run = true;
        dist.rank = Some(0);
        dist.world_size = Some(1);
        dist.rendezvous = "127.0.0.1:0".into();
        let t = Trainer::init(dist, |ctx| {
            assert!(ctx.is_primary());
            FileSink::create(dir.path().join("logs"))
        })?;
        assert_eq!(t.phase(), TrainPhase::DistributedSetup);
        t.shutdown()?;

        let mut missing = tiny_hparams(dir.path(), 1)?;
        missing.distributed_run = true;
        assert!(matches!(
            Trainer::init(missing, |_| FileSink::create(dir.path().join("logs"))),
            Err(TrainError::MissingDistributedIdentity)
        ));
        Ok(())
    }

    #[test]
    fn test_eval_mode_guard_restores_training() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let hp = tiny_hparams(dir.path(), 1)?;
        let t = trainer(hp)?;
        let mut models = t.build_models()?;
        models.net_g.module.train();
        {
            let g = EvalMode::new(&mut models.net_g.module);
            assert!(!g.is_training());
        }
        assert!(models.net_g.module.is_training());
        Ok(())
    }

    #[test]
    fn test_step_increments_global_step_and_logs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let hp = tiny_hparams(dir.path(), 1)?;
        let mut t = trainer(hp)?;
        let loaders = t.build_loaders()?;
        let mut models = t.build_models()?;
        let batch = loaders.train.collate(&[0, 1])?;
        let before = models.net_g.state_dict()?;

        let losses = t.train_step(&mut models, &batch)?;
        assert_eq!(t.state().global_step, 1);
        assert!(losses.d_stepped && losses.g_stepped);
        assert_eq!(losses.disc_real.len(), 3);
        assert!(losses.gen_total.is_finite());
        let expected = losses.gen_adv + losses.fm + losses.mel + losses.dur + losses.kl;
        assert!((losses.gen_total - expected).abs() < 1e-3 * expected.abs().max(1.0));

        // 生成器のパラメータが動いている
        let after = models.net_g.state_dict()?;
        let moved = before.iter().any(|(k, v)| {
            (v - &after[k])
                .and_then(|d| d.abs()?.sum_all()?.to_scalar::<f32>())
                .map(|s| s > 0.0)
                .unwrap_or(false)
        });
        assert!(moved);

        let (norm_d, norm_g) = losses
            .grad_norms
            .ok_or_else(|| TrainError::Data("grad norms not logged".into()))?;
        assert!(norm_d.is_finite() && norm_d > 0.0);
        assert!(norm_g.is_finite() && norm_g > 0.0);

        t.train_step(&mut models, &batch)?;
        assert_eq!(t.state().global_step, 2);

        t.sink.flush()?;
        let scalars = std::fs::read_to_string(dir.path().join("logs").join("scalars.jsonl"))?;
        // log_interval = 1 なので 2 ステップ分 x 9 項目
        assert_eq!(scalars.lines().count(), 18);
        assert!(scalars.contains("\"loss/g/total\""));
        assert!(dir.path().join("logs").join("all_attn_0.safetensors").exists());
        Ok(())
    }

    #[test]
    fn test_training_run_checkpoints_and_resume() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let hp = tiny_hparams(dir.path(), 3)?;
        let mut t = trainer(hp.clone())?;
        let summary = t.train()?;
        assert_eq!(t.phase(), TrainPhase::Done);
        // 4 サンプル / バッチ 2 = 2 ステップ x 3 エポック
        assert_eq!(summary.global_step, 6);
        assert_eq!(summary.start_epoch, 0);
        // エポック 0 と 2 の終わりで保存
        let ckpt = dir.path().join("ckpt");
        for name in ["vits_G_2", "vits_D_2", "vits_G_6", "vits_D_6"] {
            assert!(ckpt.join(format!("{}.safetensors", name)).exists(), "{} missing", name);
        }
        assert_eq!(summary.checkpoints.len(), 4);
        assert!(!ckpt.join("vits_G_4.safetensors").exists());
        assert!(dir.path().join("logs").join("Val_audio_gen_6.wav").exists());
        t.shutdown()?;

        // エポック 2 の状態から再開し、エポック 2, 3 を学習
        let mut resumed = hp;
        resumed.epochs = 4;
        resumed.warm_start_name_g = Some("vits_G_6".into());
        resumed.warm_start_name_d = Some("vits_D_6".into());
        let mut t = trainer(resumed)?;
        let summary = t.train()?;
        assert_eq!(summary.start_epoch, 2);
        assert_eq!(summary.global_step, 10);
        assert!(ckpt.join("vits_G_8.safetensors").exists());
        t.shutdown()
    }
}
