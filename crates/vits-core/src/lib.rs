use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// マニフェストの1行 (`wav|text|speaker_id`) を表す構造体
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct ManifestEntry {
    /// 音声ファイルのパス
    pub audio_path: PathBuf,
    /// 原文 (クリーニング前)
    pub text: String,
    /// 話者ID (単一話者のマニフェストでは 0)
    pub speaker_id: u32,
}

impl ManifestEntry {
    pub fn new(audio_path: impl Into<PathBuf>, text: impl Into<String>, speaker_id: u32) -> Self {
        Self {
            audio_path: audio_path.into(),
            text: text.into(),
            speaker_id,
        }
    }

    /// パイプ区切りの1行をパースする。相対パスは `root` からの相対として解決する。
    pub fn parse_line(line: &str, root: &Path) -> Result<Self> {
        let fields: Vec<&str> = line.split('|').collect();
        let (path, text, speaker_id) = match fields.as_slice() {
            [path, text] => (*path, *text, 0),
            [path, text, speaker] => {
                let sid = speaker
                    .trim()
                    .parse::<u32>()
                    .with_context(|| format!("Invalid speaker id {:?}", speaker))?;
                (*path, *text, sid)
            }
            _ => bail!("Malformed manifest line: {:?}", line),
        };
        if path.trim().is_empty() {
            bail!("Empty audio path in manifest line: {:?}", line);
        }
        let path = PathBuf::from(path.trim());
        let audio_path = if path.is_absolute() { path } else { root.join(path) };
        Ok(Self::new(audio_path, text.trim(), speaker_id))
    }
}

/// マニフェストファイルを読み込む。空行と `#` で始まる行は無視する。
pub fn load_manifest<P: AsRef<Path>>(path: P) -> Result<Vec<ManifestEntry>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read manifest {:?}", path))?;
    let root = path.parent().unwrap_or_else(|| Path::new("."));
    let mut entries = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let entry = ManifestEntry::parse_line(line, root)
            .with_context(|| format!("{:?}:{}", path, lineno + 1))?;
        entries.push(entry);
    }
    Ok(entries)
}

/// 小文字化と空白の正規化のみを行う基本的なクリーナー
pub fn clean_text(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

const PAD: &str = "_";
const PUNCTUATION: &str = ";:,.!?¡¿—…\"«»“” ";
const LETTERS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const LETTERS_IPA: &str = "ɑɐɒæɓʙβɔɕçɗɖðʤəɘɚɛɜɝɞɟʄɡɠɢʛɦɧħɥʜɨɪʝɭɬɫɮʟɱɯɰŋɳɲɴøɵɸθœɶʘɹɺɾɻʀʁɽʂʃʈʧʉʊʋⱱʌɣɤʍχʎʏʑʐʒʔʡʕʢǀǁǂǃˈˌːˑʼʴʰʱʲʷˠˤ˞↓↑→↗↘'̩'ᵻ";

/// 文字とIDの相互変換を行うトークナイザー。ID 0 はパディング兼ブランク。
pub struct SymbolTokenizer {
    symbol_to_id: HashMap<char, u32>,
    id_to_symbol: Vec<char>,
}

impl SymbolTokenizer {
    /// デフォルトのシンボルセット (パッド, 句読点, 英字, IPA) で初期化
    pub fn new() -> Self {
        let mut symbols: Vec<char> = Vec::new();
        for c in PAD
            .chars()
            .chain(PUNCTUATION.chars())
            .chain(LETTERS.chars())
            .chain(LETTERS_IPA.chars())
        {
            // 重複は最初の出現のみ残す
            if !symbols.contains(&c) {
                symbols.push(c);
            }
        }
        let symbol_to_id = symbols
            .iter()
            .enumerate()
            .map(|(i, c)| (*c, i as u32))
            .collect();
        Self {
            symbol_to_id,
            id_to_symbol: symbols,
        }
    }

    /// 未知の文字はスキップする
    pub fn encode(&self, text: &str) -> Vec<u32> {
        text.chars()
            .filter_map(|c| self.symbol_to_id.get(&c).copied())
            .collect()
    }

    pub fn decode(&self, ids: &[u32]) -> String {
        ids.iter()
            .filter_map(|&i| self.id_to_symbol.get(i as usize))
            .collect()
    }

    pub fn vocab_size(&self) -> usize {
        self.id_to_symbol.len()
    }
}

impl Default for SymbolTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

/// 各トークンの間と両端にブランクを挿入する (`[a, b]` -> `[0, a, 0, b, 0]`)
pub fn intersperse(ids: &[u32], blank: u32) -> Vec<u32> {
    let mut out = vec![blank; ids.len() * 2 + 1];
    for (i, &id) in ids.iter().enumerate() {
        out[i * 2 + 1] = id;
    }
    out
}
