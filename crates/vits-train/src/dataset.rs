use crate::config::HParams;
use crate::error::{Result, TrainError};
use crate::mel::{spectrogram_cpu, MelConfig};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use vits_core::{clean_text, intersperse, load_manifest, ManifestEntry, SymbolTokenizer};

/// データセット読み込みに必要な設定
#[derive(Debug, Clone)]
pub struct DatasetParams {
    pub mel: MelConfig,
    pub max_wav_value: f32,
    pub add_blank: bool,
    pub min_text_len: usize,
    pub max_text_len: usize,
}

impl DatasetParams {
    pub fn from_hparams(hp: &HParams) -> Self {
        Self {
            mel: MelConfig::from_hparams(hp),
            max_wav_value: hp.max_wav_value,
            add_blank: hp.add_blank,
            min_text_len: hp.min_text_len,
            max_text_len: hp.max_text_len,
        }
    }
}

/// WAV の隣に置くスペクトログラムキャッシュのパス (`<wav>.spec.safetensors`)
pub fn spec_cache_path(wav_path: &Path) -> PathBuf {
    let mut name = wav_path.as_os_str().to_owned();
    name.push(".spec.safetensors");
    PathBuf::from(name)
}

/// モノラル WAV を読み込む。整数 PCM は 16bit 相当の値に揃えてから `max_wav_value` で割る。
/// 浮動小数 PCM は既に [-1, 1] とみなす。
pub fn load_wav(path: &Path, sampling_rate: u32, max_wav_value: f32) -> Result<Vec<f32>> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    if spec.sample_rate != sampling_rate {
        return Err(TrainError::Data(format!(
            "{:?}: {} Hz does not match target {} Hz",
            path, spec.sample_rate, sampling_rate
        )));
    }
    if spec.channels != 1 {
        return Err(TrainError::Data(format!(
            "{:?}: expected mono audio, got {} channels",
            path, spec.channels
        )));
    }
    let samples = match spec.sample_format {
        hound::SampleFormat::Int => {
            let to_i16 = 32768.0 / (1u64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * to_i16 / max_wav_value))
                .collect::<std::result::Result<Vec<_>, _>>()?
        }
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<std::result::Result<Vec<_>, _>>()?,
    };
    Ok(samples)
}

/// キャッシュがあれば読み、無ければ計算して保存する。戻り値は `[n_freq, frames]`。
pub fn load_or_compute_spec(wav_path: &Path, samples: &[f32], mel: &MelConfig, overwrite: bool) -> Result<Tensor> {
    let cache = spec_cache_path(wav_path);
    if cache.exists() && !overwrite {
        let tensors = candle_core::safetensors::load(&cache, &Device::Cpu)?;
        if let Some(spec) = tensors.get("spec") {
            if spec.dim(0)? == mel.n_freq() {
                return Ok(spec.clone());
            }
        }
        tracing::warn!(?cache, "stale spectrogram cache, recomputing");
    }
    let spec = spectrogram_cpu(samples, mel)?;
    let mut map = HashMap::new();
    map.insert("spec".to_string(), spec.clone());
    // 複数プロセスが同じキャッシュを書いても壊れないよう一時ファイル経由で置き換える
    let tmp = cache.with_extension(format!("tmp{}", std::process::id()));
    candle_core::safetensors::save(&map, &tmp)?;
    std::fs::rename(&tmp, &cache)?;
    Ok(spec)
}

#[derive(Debug, Clone)]
struct DatasetItem {
    entry: ManifestEntry,
    tokens: Vec<u32>,
    /// WAV ヘッダから見積もったフレーム数
    spec_len: usize,
}

/// 1 サンプル分のデータ (CPU 上)
pub struct Sample {
    pub tokens: Vec<u32>,
    /// `[n_freq, frames]`
    pub spec: Tensor,
    pub wav: Vec<f32>,
    pub speaker_id: u32,
}

/// パディング済みのバッチ。長さはすべて `u32`。
pub struct Batch {
    /// `[b, t_x]`
    pub x: Tensor,
    pub x_lengths: Tensor,
    /// `[b, n_freq, t_y]`
    pub spec: Tensor,
    pub spec_lengths: Tensor,
    /// `[b, 1, t_wav]`
    pub y: Tensor,
    pub y_lengths: Tensor,
    pub speakers: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.x.dim(0).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            x: self.x.to_device(device)?,
            x_lengths: self.x_lengths.to_device(device)?,
            spec: self.spec.to_device(device)?,
            spec_lengths: self.spec_lengths.to_device(device)?,
            y: self.y.to_device(device)?,
            y_lengths: self.y_lengths.to_device(device)?,
            speakers: self.speakers.to_device(device)?,
        })
    }

    /// 先頭の 1 サンプルだけのバッチ (検証用)
    pub fn first(&self) -> Result<Self> {
        Ok(Self {
            x: self.x.narrow(0, 0, 1)?,
            x_lengths: self.x_lengths.narrow(0, 0, 1)?,
            spec: self.spec.narrow(0, 0, 1)?,
            spec_lengths: self.spec_lengths.narrow(0, 0, 1)?,
            y: self.y.narrow(0, 0, 1)?,
            y_lengths: self.y_lengths.narrow(0, 0, 1)?,
            speakers: self.speakers.narrow(0, 0, 1)?,
        })
    }
}

/// テキスト・音声・話者 ID の三つ組データセット
pub struct TextAudioSpeakerDataset {
    items: Vec<DatasetItem>,
    params: DatasetParams,
}

impl TextAudioSpeakerDataset {
    pub fn load<P: AsRef<Path>>(manifest: P, params: DatasetParams, tokenizer: &SymbolTokenizer) -> Result<Self> {
        let manifest = manifest.as_ref();
        let entries = load_manifest(manifest)?;
        let total = entries.len();
        let mut items = Vec::with_capacity(total);
        for entry in entries {
            let cleaned = clean_text(&entry.text);
            let n_chars = cleaned.chars().count();
            if n_chars < params.min_text_len || n_chars > params.max_text_len {
                continue;
            }
            let mut tokens = tokenizer.encode(&cleaned);
            if params.add_blank {
                tokens = intersperse(&tokens, 0);
            }
            let reader = hound::WavReader::open(&entry.audio_path)?;
            let spec = reader.spec();
            if spec.sample_rate != params.mel.sampling_rate {
                return Err(TrainError::Data(format!(
                    "{:?}: {} Hz does not match target {} Hz",
                    entry.audio_path, spec.sample_rate, params.mel.sampling_rate
                )));
            }
            let spec_len = reader.duration() as usize / params.mel.hop_length;
            items.push(DatasetItem { entry, tokens, spec_len });
        }
        tracing::info!(
            manifest = ?manifest,
            kept = items.len(),
            filtered = total - items.len(),
            "dataset loaded"
        );
        Ok(Self { items, params })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// デバッグ用に先頭 n 件だけ残す
    pub fn truncate(&mut self, n: usize) {
        self.items.truncate(n);
    }

    /// バケット化に使うスペクトログラム長
    pub fn lengths(&self) -> Vec<usize> {
        self.items.iter().map(|i| i.spec_len).collect()
    }

    pub fn audio_paths(&self) -> impl Iterator<Item = &Path> {
        self.items.iter().map(|i| i.entry.audio_path.as_path())
    }

    pub fn params(&self) -> &DatasetParams {
        &self.params
    }

    pub fn get(&self, index: usize) -> Result<Sample> {
        let item = self
            .items
            .get(index)
            .ok_or_else(|| TrainError::Data(format!("index {} out of range ({})", index, self.items.len())))?;
        let path = &item.entry.audio_path;
        let wav = load_wav(path, self.params.mel.sampling_rate, self.params.max_wav_value)?;
        let spec = load_or_compute_spec(path, &wav, &self.params.mel, false)?;
        Ok(Sample {
            tokens: item.tokens.clone(),
            spec,
            wav,
            speaker_id: item.entry.speaker_id,
        })
    }

    pub fn collate(&self, indices: &[usize]) -> Result<Batch> {
        let samples = indices
            .iter()
            .map(|&i| self.get(i))
            .collect::<Result<Vec<_>>>()?;
        collate(samples)
    }
}

/// スペクトログラム長の降順に並べてゼロパディングする
pub fn collate(mut samples: Vec<Sample>) -> Result<Batch> {
    if samples.is_empty() {
        return Err(TrainError::Data("cannot collate an empty batch".into()));
    }
    let mut spec_lens = Vec::with_capacity(samples.len());
    for s in &samples {
        spec_lens.push(s.spec.dim(1)?);
    }
    let mut order: Vec<usize> = (0..samples.len()).collect();
    order.sort_by(|&a, &b| spec_lens[b].cmp(&spec_lens[a]));
    let mut slots: Vec<Option<Sample>> = samples.drain(..).map(Some).collect();
    let samples: Vec<Sample> = order.iter().filter_map(|&i| slots[i].take()).collect();

    let b = samples.len();
    let n_freq = samples[0].spec.dim(0)?;
    let max_text = samples.iter().map(|s| s.tokens.len()).max().unwrap_or(0);
    let max_spec = samples.iter().map(|s| s.spec.dim(1)).collect::<candle_core::Result<Vec<_>>>()?;
    let max_spec = max_spec.into_iter().max().unwrap_or(0);
    let max_wav = samples.iter().map(|s| s.wav.len()).max().unwrap_or(0);

    let mut x = vec![0u32; b * max_text];
    let mut wav = vec![0f32; b * max_wav];
    let mut specs = Vec::with_capacity(b);
    let (mut x_lengths, mut spec_lengths, mut y_lengths, mut speakers) =
        (Vec::with_capacity(b), Vec::with_capacity(b), Vec::with_capacity(b), Vec::with_capacity(b));
    for (i, s) in samples.iter().enumerate() {
        x[i * max_text..i * max_text + s.tokens.len()].copy_from_slice(&s.tokens);
        wav[i * max_wav..i * max_wav + s.wav.len()].copy_from_slice(&s.wav);
        if s.spec.dim(0)? != n_freq {
            return Err(TrainError::Data("spectrogram channel count differs within batch".into()));
        }
        let t = s.spec.dim(1)?;
        specs.push(s.spec.to_dtype(DType::F32)?.pad_with_zeros(1, 0, max_spec - t)?);
        x_lengths.push(s.tokens.len() as u32);
        spec_lengths.push(t as u32);
        y_lengths.push(s.wav.len() as u32);
        speakers.push(s.speaker_id);
    }

    let device = Device::Cpu;
    Ok(Batch {
        x: Tensor::from_vec(x, (b, max_text), &device)?,
        x_lengths: Tensor::from_vec(x_lengths, (b,), &device)?,
        spec: Tensor::stack(&specs, 0)?,
        spec_lengths: Tensor::from_vec(spec_lengths, (b,), &device)?,
        y: Tensor::from_vec(wav, (b, 1, max_wav), &device)?,
        y_lengths: Tensor::from_vec(y_lengths, (b,), &device)?,
        speakers: Tensor::from_vec(speakers, (b,), &device)?,
    })
}

/// 検証用の逐次ローダ。シャッフルせず、最後の端数バッチも返す。
pub struct SequentialLoader<'a> {
    dataset: &'a TextAudioSpeakerDataset,
    batch_size: usize,
}

impl<'a> SequentialLoader<'a> {
    pub fn new(dataset: &'a TextAudioSpeakerDataset, batch_size: usize) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
        }
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn batch(&self, index: usize) -> Result<Batch> {
        let start = index * self.batch_size;
        let end = (start + self.batch_size).min(self.dataset.len());
        if start >= end {
            return Err(TrainError::Data(format!("validation batch {} out of range", index)));
        }
        let indices: Vec<usize> = (start..end).collect();
        self.dataset.collate(&indices)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn write_sine(path: &Path, sample_rate: u32, len: usize, freq: f32) -> Result<()> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec)?;
        for i in 0..len {
            let t = i as f32 / sample_rate as f32;
            let amp = (t * freq * 2.0 * std::f32::consts::PI).sin();
            writer.write_sample((amp * 16000.0) as i16)?;
        }
        writer.finalize()?;
        Ok(())
    }

    fn params() -> DatasetParams {
        DatasetParams {
            mel: MelConfig {
                filter_length: 64,
                hop_length: 16,
                win_length: 64,
                n_mel_channels: 10,
                sampling_rate: 8000,
                mel_fmin: 0.0,
                mel_fmax: None,
            },
            max_wav_value: 32768.0,
            add_blank: true,
            min_text_len: 1,
            max_text_len: 20,
        }
    }

    fn fixture(dir: &Path) -> Result<PathBuf> {
        write_sine(&dir.join("a.wav"), 8000, 320, 440.0)?;
        write_sine(&dir.join("b.wav"), 8000, 640, 220.0)?;
        write_sine(&dir.join("c.wav"), 8000, 160, 330.0)?;
        let manifest = dir.join("train.txt");
        std::fs::write(
            &manifest,
            "a.wav|Hello there|0\nb.wav|World|1\nc.wav|this text is far too long to keep|0\n",
        )?;
        Ok(manifest)
    }

    #[test]
    fn test_load_filters_and_estimates_lengths() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manifest = fixture(dir.path())?;
        let ds = TextAudioSpeakerDataset::load(&manifest, params(), &SymbolTokenizer::new())?;
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.lengths(), vec![20, 40]);
        Ok(())
    }

    #[test]
    fn test_collate_sorts_and_pads() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manifest = fixture(dir.path())?;
        let ds = TextAudioSpeakerDataset::load(&manifest, params(), &SymbolTokenizer::new())?;
        let batch = ds.collate(&[0, 1])?;
        assert_eq!(batch.len(), 2);
        // 長い方 (b.wav) が先頭
        assert_eq!(batch.spec_lengths.to_vec1::<u32>()?, vec![40, 20]);
        assert_eq!(batch.y_lengths.to_vec1::<u32>()?, vec![640, 320]);
        assert_eq!(batch.speakers.to_vec1::<u32>()?, vec![1, 0]);
        assert_eq!(batch.spec.dims(), &[2, 33, 40]);
        assert_eq!(batch.y.dims(), &[2, 1, 640]);
        // "world" に blank を挟んで 11 トークン
        assert_eq!(batch.x_lengths.to_vec1::<u32>()?, vec![11, 23]);
        let padded = batch.spec.get(1)?.narrow(1, 20, 20)?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(padded, 0.0);

        let first = batch.first()?;
        assert_eq!(first.spec.dims(), &[1, 33, 40]);
        Ok(())
    }

    #[test]
    fn test_spec_cache_written_and_reused() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manifest = fixture(dir.path())?;
        let ds = TextAudioSpeakerDataset::load(&manifest, params(), &SymbolTokenizer::new())?;
        let cache = spec_cache_path(&dir.path().join("a.wav"));
        assert!(!cache.exists());
        let s = ds.get(0)?;
        assert!(cache.exists());
        assert_eq!(s.spec.dims(), &[33, 20]);

        // キャッシュの中身が使われる
        let mut map = HashMap::new();
        map.insert("spec".to_string(), Tensor::ones((33, 20), DType::F32, &Device::Cpu)?);
        candle_core::safetensors::save(&map, &cache)?;
        let s = ds.get(0)?;
        assert_eq!(s.spec.sum_all()?.to_scalar::<f32>()?, 660.0);
        Ok(())
    }

    #[test]
    fn test_sample_rate_mismatch_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_sine(&dir.path().join("a.wav"), 16000, 320, 440.0)?;
        let manifest = dir.path().join("m.txt");
        std::fs::write(&manifest, "a.wav|hi\n")?;
        let r = TextAudioSpeakerDataset::load(&manifest, params(), &SymbolTokenizer::new());
        assert!(matches!(r, Err(TrainError::Data(_))));
        Ok(())
    }

    #[test]
    fn test_sequential_loader_keeps_last_partial() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manifest = fixture(dir.path())?;
        let ds = TextAudioSpeakerDataset::load(&manifest, params(), &SymbolTokenizer::new())?;
        let loader = SequentialLoader::new(&ds, 3);
        assert_eq!(loader.num_batches(), 1);
        assert_eq!(loader.batch(0)?.len(), 2);
        assert!(loader.batch(1).is_err());
        Ok(())
    }
}
