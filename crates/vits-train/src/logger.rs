//! 学習メトリクスの出力先
//!
//! 1 回の `log` 呼び出しで渡せるペイロードは 1 種類だけ。

use crate::error::{Result, TrainError};
use candle_core::{DType, Device, Tensor};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub enum LogPayload<'a> {
    Scalar(f64),
    /// 2 次元配列 `[rows, cols]`
    Image(&'a Tensor),
    /// モノラル波形 (値域 [-1, 1])
    Audio { samples: &'a [f32], sample_rate: u32 },
}

impl LogPayload<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            LogPayload::Scalar(_) => "scalar",
            LogPayload::Image(_) => "image",
            LogPayload::Audio { .. } => "audio",
        }
    }
}

pub trait LogSink {
    fn log(&mut self, key: &str, step: u64, payload: LogPayload<'_>) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// `loss_g_total` -> `loss/g/total`
pub fn metric_key(name: &str) -> String {
    name.replace('_', "/")
}

/// tracing のイベントとしてだけ出力する
#[derive(Debug, Default)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&mut self, key: &str, step: u64, payload: LogPayload<'_>) -> Result<()> {
        match payload {
            LogPayload::Scalar(v) => tracing::info!(key, step, value = v, "scalar"),
            LogPayload::Image(t) => tracing::debug!(key, step, shape = ?t.dims(), "image"),
            LogPayload::Audio { samples, sample_rate } => {
                tracing::debug!(key, step, samples = samples.len(), sample_rate, "audio")
            }
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct ScalarRecord<'a> {
    key: &'a str,
    step: u64,
    value: f64,
}

/// スカラーは `scalars.jsonl` に追記し、画像は safetensors、音声は WAV として書き出す
pub struct FileSink {
    dir: PathBuf,
    scalars: BufWriter<File>,
}

impl FileSink {
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("scalars.jsonl"))?;
        Ok(Self {
            dir,
            scalars: BufWriter::new(file),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn artifact_path(&self, key: &str, step: u64, ext: &str) -> PathBuf {
        let stem = key.replace('/', "_");
        self.dir.join(format!("{}_{}.{}", stem, step, ext))
    }
}

impl LogSink for FileSink {
    fn log(&mut self, key: &str, step: u64, payload: LogPayload<'_>) -> Result<()> {
        match payload {
            LogPayload::Scalar(value) => {
                serde_json::to_writer(&mut self.scalars, &ScalarRecord { key, step, value })?;
                self.scalars.write_all(b"\n")?;
            }
            LogPayload::Image(t) => {
                if t.rank() != 2 {
                    return Err(TrainError::Data(format!(
                        "image `{}` must be 2-D, got shape {:?}",
                        key,
                        t.dims()
                    )));
                }
                let mut map = HashMap::new();
                map.insert(
                    "image".to_string(),
                    t.to_device(&Device::Cpu)?.to_dtype(DType::F32)?.contiguous()?,
                );
                candle_core::safetensors::save(&map, self.artifact_path(key, step, "safetensors"))?;
            }
            LogPayload::Audio { samples, sample_rate } => {
                let spec = hound::WavSpec {
                    channels: 1,
                    sample_rate,
                    bits_per_sample: 16,
                    sample_format: hound::SampleFormat::Int,
                };
                let mut writer = hound::WavWriter::create(self.artifact_path(key, step, "wav"), spec)?;
                for &s in samples {
                    writer.write_sample((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)?;
                }
                writer.finalize()?;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.scalars.flush()?;
        Ok(())
    }
}

/// 複数のシンクへ同じ内容を流す
pub struct FanoutSink {
    sinks: Vec<Box<dyn LogSink + Send>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Box<dyn LogSink + Send>>) -> Self {
        Self { sinks }
    }
}

impl LogSink for FanoutSink {
    fn log(&mut self, key: &str, step: u64, payload: LogPayload<'_>) -> Result<()> {
        for sink in self.sinks.iter_mut() {
            let p = match &payload {
                LogPayload::Scalar(v) => LogPayload::Scalar(*v),
                LogPayload::Image(t) => LogPayload::Image(*t),
                LogPayload::Audio { samples, sample_rate } => LogPayload::Audio {
                    samples: *samples,
                    sample_rate: *sample_rate,
                },
            };
            sink.log(key, step, p)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        for sink in self.sinks.iter_mut() {
            sink.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_key() {
        assert_eq!(metric_key("loss_g_total"), "loss/g/total");
        assert_eq!(metric_key("gradnorm_d"), "gradnorm/d");
    }

    #[test]
    fn test_file_sink_writes_each_kind() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sink = FileSink::create(dir.path().join("logs"))?;
        sink.log("loss/g/total", 3, LogPayload::Scalar(1.5))?;
        sink.log("loss/d/total", 3, LogPayload::Scalar(0.25))?;
        let img = Tensor::ones((4, 5), DType::F32, &Device::Cpu)?;
        sink.log("slice/mel/org", 3, LogPayload::Image(&img))?;
        sink.log(
            "Val/audio_gen",
            3,
            LogPayload::Audio {
                samples: &[0.0, 0.5, -0.5],
                sample_rate: 8000,
            },
        )?;
        sink.flush()?;

        let lines = std::fs::read_to_string(sink.dir().join("scalars.jsonl"))?;
        let lines: Vec<serde_json::Value> = lines
            .lines()
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()?;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["key"], "loss/g/total");
        assert_eq!(lines[1]["value"], 0.25);

        let loaded = candle_core::safetensors::load(sink.dir().join("slice_mel_org_3.safetensors"), &Device::Cpu)?;
        assert_eq!(loaded["image"].dims(), &[4, 5]);

        let reader = hound::WavReader::open(sink.dir().join("Val_audio_gen_3.wav"))?;
        assert_eq!(reader.len(), 3);
        assert_eq!(reader.spec().sample_rate, 8000);
        Ok(())
    }

    #[test]
    fn test_image_must_be_2d() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sink = FileSink::create(dir.path())?;
        let img = Tensor::ones((1, 4, 5), DType::F32, &Device::Cpu)?;
        assert!(sink.log("all/mel", 0, LogPayload::Image(&img)).is_err());
        Ok(())
    }

    #[test]
    fn test_payload_kind() -> Result<()> {
        let t = Tensor::zeros((1, 1), DType::F32, &Device::Cpu)?;
        assert_eq!(LogPayload::Scalar(0.0).kind(), "scalar");
        assert_eq!(LogPayload::Image(&t).kind(), "image");
        Ok(())
    }
}
