//! RTS解析のエラー分類

use thiserror::Error;

/// スタック解析・スレッド列挙で発生するエラー
///
/// いずれも「現在のスレッド」または「現在の列挙元」に限定して扱われ、
/// 呼び出し側は残りのスレッドの処理を続行する。
#[derive(Debug, Error)]
pub enum RtsError {
    /// フレームサイズを計算できない種別のフレーム
    #[error("unsupported frame kind {kind} at 0x{frame:x}")]
    UnsupportedFrameKind { frame: u64, kind: u32 },

    /// 対象メモリの読み取り失敗
    #[error("Cannot access memory at address 0x{addr:x}")]
    ReadFault {
        addr: u64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// 番兵に到達しないリスト走査（対象イメージの破損）
    #[error("{list} traversal did not terminate after {limit} links")]
    TraversalDidNotTerminate { list: &'static str, limit: usize },

    /// サイズ0のフレーム（走査が進まない）
    #[error("zero-sized frame at 0x{0:x}")]
    ZeroSizedFrame(u64),

    /// スタック領域の終端を越えるフレーム
    #[error("frame at 0x{frame:x} of {words} words overruns the stack end 0x{top:x}")]
    FrameOverrunsStack { frame: u64, words: u64, top: u64 },

    /// 対象イメージにグローバルシンボルがない
    #[error("symbol '{0}' not found in the target image")]
    MissingSymbol(String),

    /// RTSの型情報（構造体レイアウト）がない
    #[error("RTS type information missing: {0} (build the program with -g or link the debug RTS)")]
    MissingLayout(String),

    /// RTSのグローバル値が明らかに異常
    #[error("implausible value {value} for {name}")]
    ImplausibleValue { name: &'static str, value: u64 },

    #[error("invalid name pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl RtsError {
    /// メモリ読み取りエラーをアドレス付きで包む
    pub fn read_fault(addr: u64, source: anyhow::Error) -> Self {
        Self::ReadFault {
            addr,
            source: source.into(),
        }
    }
}
