//! hsscope ターゲットプロセスアクセス
//!
//! このクレートは、調査対象プロセスへの読み取り専用アクセスを提供します。
//! ptraceによる停止状態の確保と、/proc/pid/mem経由のメモリ読み取りを行います。
//! 対象プロセスのメモリやレジスタを書き換える機能は持ちません。

pub mod process;
pub mod thread;
pub mod memory;

pub use process::Process;
pub use thread::{Thread, ThreadId};
pub use memory::{Memory, MemoryMapping, MemoryReadable, MemoryReader};

/// ターゲット制御の結果型
pub type Result<T> = anyhow::Result<T>;
