//! hsscope のコア機能
//!
//! このクレートは、インスペクタの中核となるロジックを提供します。
//! ターゲットプロセスのメモリ、デバッグ情報、RTSの解析を統合し、
//! REPLコマンドとその出力書式を扱います。

pub mod command;
pub mod errors;
pub mod inspector;
pub mod parse;
pub mod trace;

pub use command::{Command, CommandError};
pub use inspector::Inspector;
pub use trace::{profile_line, ListOptions, ProfileOptions, TraceFormatter};

// 他のクレートから使用するために再エクスポート
pub use hsscope_dwarf::Symbol;
pub use hsscope_rts::{clean_name, FunctionName, NameKind, RegistryConfig, WalkConfig};

/// インスペクタの結果型
pub type Result<T> = anyhow::Result<T>;
