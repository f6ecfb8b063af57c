//! hsscope DWARF デバッグ情報解析
//!
//! このクレートは、ELFファイルとDWARFデバッグ情報から、調査に必要な
//! ホスト側の問い合わせ（スコープ、シンボル、ソース行、RTS構造体レイアウト）を提供します。

pub mod loader;
pub mod symbols;
pub mod lines;
pub mod scopes;
pub mod type_info;
pub mod source;

pub use loader::DwarfLoader;
pub use symbols::{Symbol, SymbolResolver};
pub use lines::{LineInfo, LineInfoProvider, LineRow};
pub use scopes::{ScopeIndex, ScopeInfo};
pub use type_info::{FieldLayout, StructLayout, TypeLayouts};
pub use source::{DebugInfoSource, DebugSymbols};

/// DWARF解析の結果型
pub type Result<T> = anyhow::Result<T>;

/// DWARFリーダーの具体型
pub type DwarfReader = gimli::EndianSlice<'static, gimli::RunTimeEndian>;
