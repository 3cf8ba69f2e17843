use crate::config::HParams;
use crate::dataset::{load_or_compute_spec, load_wav, spec_cache_path, DatasetParams, TextAudioSpeakerDataset};
use crate::error::Result;
use clap::Parser;
use std::collections::BTreeSet;
use std::io::Write;
use std::path::PathBuf;
use vits_core::SymbolTokenizer;

#[derive(Parser, Debug)]
pub struct PreprocessArgs {
    /// ハイパーパラメータ JSON
    #[arg(long, short)]
    pub config: PathBuf,

    /// 既に存在するキャッシュを上書きする
    #[arg(long)]
    pub overwrite: bool,
}

/// 前処理の結果件数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreprocessReport {
    pub computed: usize,
    pub skipped: usize,
}

/// 学習・検証両方のマニフェストに載っている音声の線形スペクトログラムを事前計算する
pub fn run(hp: &HParams, overwrite: bool) -> Result<PreprocessReport> {
    let tokenizer = SymbolTokenizer::new();
    let params = DatasetParams::from_hparams(hp);

    let mut paths = BTreeSet::new();
    for manifest in [&hp.training_audiopaths_and_text, &hp.val_audiopaths_and_text] {
        println!("Loading manifest {:?}...", manifest);
        let dataset = TextAudioSpeakerDataset::load(manifest, params.clone(), &tokenizer)?;
        paths.extend(dataset.audio_paths().map(|p| p.to_path_buf()));
    }

    let total = paths.len();
    println!("Found {} audio files. Starting spectrogram pre-computation...", total);
    let mut report = PreprocessReport::default();
    for (i, wav_path) in paths.iter().enumerate() {
        if spec_cache_path(wav_path).exists() && !overwrite {
            report.skipped += 1;
            if i % 100 == 0 {
                print!("\rSkipping {}/{} (already exists)...", i + 1, total);
                std::io::stdout().flush()?;
            }
            continue;
        }

        let samples = load_wav(wav_path, params.mel.sampling_rate, params.max_wav_value)?;
        load_or_compute_spec(wav_path, &samples, &params.mel, true)?;
        report.computed += 1;

        if (i + 1) % 10 == 0 || i + 1 == total {
            print!("\rProcessed {}/{}...", i + 1, total);
            std::io::stdout().flush()?;
        }
    }

    println!("\nPre-computation completed.");
    tracing::info!(computed = report.computed, skipped = report.skipped, "preprocess finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::base_json;
    use crate::dataset::tests::write_sine;
    use serde_json::json;

    #[test]
    fn test_preprocess_writes_and_skips_cache() -> Result<()> {
        let dir = tempfile::tempdir()?;
        write_sine(&dir.path().join("a.wav"), 8000, 320, 440.0)?;
        write_sine(&dir.path().join("b.wav"), 8000, 480, 220.0)?;
        std::fs::write(dir.path().join("train.txt"), "a.wav|hello|0\nb.wav|good morning|0\n")?;
        std::fs::write(dir.path().join("val.txt"), "a.wav|hello|0\n")?;

        let mut v = base_json();
        v["training_audiopaths_and_text"] = json!(dir.path().join("train.txt"));
        v["val_audiopaths_and_text"] = json!(dir.path().join("val.txt"));
        v["sampling_rate"] = json!(8000);
        v["hop_length"] = json!(16);
        v["filter_length"] = json!(64);
        v["segment_size"] = json!(128);
        v["upsample_rates"] = json!([4, 4]);
        let hp = HParams::from_json_str(&v.to_string())?;

        let report = run(&hp, false)?;
        assert_eq!(report, PreprocessReport { computed: 2, skipped: 0 });
        assert!(spec_cache_path(&dir.path().join("a.wav")).exists());

        let report = run(&hp, false)?;
        assert_eq!(report, PreprocessReport { computed: 0, skipped: 2 });

        let report = run(&hp, true)?;
        assert_eq!(report.computed, 2);
        Ok(())
    }
}
