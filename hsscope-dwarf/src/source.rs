//! ホストデバッグ情報の問い合わせインターフェース
//!
//! スタック解析側はこのトレイトだけを通してシンボル・行・スコープ情報を参照します。
//! アドレスはすべて実行時（ロード後）のアドレスで受け渡しします。

use crate::{DwarfLoader, LineInfo, LineInfoProvider, LineRow, Result, ScopeIndex, ScopeInfo, SymbolResolver};

/// デバッグ情報の問い合わせ
///
/// 問い合わせが失敗しても例外にはせず、「情報なし」として扱う。
pub trait DebugInfoSource {
    /// PCを含む字句スコープを内側から外側の順に返す
    fn scope_chain(&self, pc: u64) -> Vec<ScopeInfo>;

    /// PCにあるシンボル名（フラットなシンボルテーブル検索）
    fn symbol_at(&self, pc: u64) -> Option<String>;

    /// PCのソース行
    fn line_at(&self, pc: u64) -> Option<LineInfo>;

    /// PCを含むコンパイルユニット・ファイルの行番号テーブル
    fn line_table(&self, pc: u64) -> Vec<LineRow>;

    /// グローバルシンボルのアドレス
    fn global_address(&self, name: &str) -> Option<u64>;
}

impl<D: DebugInfoSource + ?Sized> DebugInfoSource for &D {
    fn scope_chain(&self, pc: u64) -> Vec<ScopeInfo> {
        (**self).scope_chain(pc)
    }

    fn symbol_at(&self, pc: u64) -> Option<String> {
        (**self).symbol_at(pc)
    }

    fn line_at(&self, pc: u64) -> Option<LineInfo> {
        (**self).line_at(pc)
    }

    fn line_table(&self, pc: u64) -> Vec<LineRow> {
        (**self).line_table(pc)
    }

    fn global_address(&self, name: &str) -> Option<u64> {
        (**self).global_address(name)
    }
}

/// ELF/DWARFから構築したデバッグ情報
pub struct DebugSymbols {
    symbols: SymbolResolver,
    scopes: ScopeIndex,
    lines: LineInfoProvider,
    /// 実行時アドレス - リンク時アドレス（PIEの場合のみ非0）
    load_bias: u64,
}

impl DebugSymbols {
    /// ローダーから全ての索引を構築する
    pub fn load(loader: &DwarfLoader) -> Result<Self> {
        if !loader.has_debug_info() {
            tracing::warn!("binary has no .debug_info section; only the symbol table will be used");
        }
        Ok(Self {
            symbols: SymbolResolver::new(loader)?,
            scopes: ScopeIndex::build(loader.dwarf())?,
            lines: LineInfoProvider::new(loader)?,
            load_bias: 0,
        })
    }

    /// PIEのロードバイアスを設定する
    pub fn with_load_bias(mut self, load_bias: u64) -> Self {
        self.load_bias = load_bias;
        self
    }

    pub fn load_bias(&self) -> u64 {
        self.load_bias
    }

    pub fn symbols(&self) -> &SymbolResolver {
        &self.symbols
    }

    pub fn scopes(&self) -> &ScopeIndex {
        &self.scopes
    }

    /// 実行時アドレスをリンク時アドレスに変換する
    fn to_link(&self, pc: u64) -> Option<u64> {
        pc.checked_sub(self.load_bias)
    }
}

impl DebugInfoSource for DebugSymbols {
    fn scope_chain(&self, pc: u64) -> Vec<ScopeInfo> {
        let Some(pc) = self.to_link(pc) else {
            return Vec::new();
        };
        self.scopes
            .scope_chain(pc)
            .into_iter()
            .map(|s| ScopeInfo {
                low_pc: s.low_pc + self.load_bias,
                ..s
            })
            .collect()
    }

    fn symbol_at(&self, pc: u64) -> Option<String> {
        self.symbols
            .reverse_resolve(self.to_link(pc)?)
            .map(|sym| sym.name)
    }

    fn line_at(&self, pc: u64) -> Option<LineInfo> {
        match self.lines.lookup(self.to_link(pc)?) {
            Ok(info) => info,
            Err(e) => {
                tracing::debug!("{}", e);
                None
            }
        }
    }

    fn line_table(&self, pc: u64) -> Vec<LineRow> {
        let Some(link_pc) = self.to_link(pc) else {
            return Vec::new();
        };
        match self.lines.line_table(link_pc) {
            Ok(rows) => rows
                .into_iter()
                .map(|r| LineRow {
                    address: r.address + self.load_bias,
                    line: r.line,
                })
                .collect(),
            Err(e) => {
                tracing::debug!("line table lookup failed at 0x{:x}: {}", pc, e);
                Vec::new()
            }
        }
    }

    fn global_address(&self, name: &str) -> Option<u64> {
        self.symbols.resolve(name).map(|addr| addr + self.load_bias)
    }
}
