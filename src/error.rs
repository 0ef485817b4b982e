use std::path::PathBuf;
use thiserror::Error;

/// 学習スケジューラ全体で使うエラー型。
///
/// いずれも学習を止めるべき致命的なエラーです。自動的なリトライや
/// 最初からの再学習は行いません。
#[derive(Error, Debug)]
pub enum PinnError {
    // --- 設定 ---
    #[error("設定が不正です: {0}")]
    InvalidConfig(String),

    #[error("設定ファイルを読み込めません: {0}")]
    ConfigLoad(String),

    // --- 損失項 ---
    #[error("損失項 '{0}' は既に登録されています")]
    DuplicateName(String),

    #[error("損失項 '{0}' は登録されていません")]
    UnknownTerm(String),

    #[error("損失項 '{term}' の評価に失敗しました: {cause}")]
    LossEvaluation { term: String, cause: String },

    #[error("形状が一致しません: 期待値 {expected}, 実際 {got}")]
    ShapeMismatch { expected: String, got: String },

    // --- 因果重み ---
    #[error("チャンク {chunk} の累積残差が有限ではありません ({cumulative})")]
    CausalWeight { chunk: usize, cumulative: f32 },

    // --- チェックポイント ---
    #[error("チェックポイントが見つかりません: {0}")]
    CheckpointNotFound(PathBuf),

    #[error("チェックポイント {path} が壊れています: {reason}")]
    CorruptCheckpoint { path: PathBuf, reason: String },

    #[error("チェックポイント {path} の保存に失敗しました: {reason}")]
    CheckpointWrite { path: PathBuf, reason: String },

    #[error("{path} の入出力に失敗しました: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, PinnError>;
