//! シンボル解決機能

use crate::{DwarfLoader, Result};
use object::{Object, ObjectSymbol, SymbolKind};
use std::collections::HashMap;

/// シンボル情報
#[derive(Debug, Clone)]
pub struct Symbol {
    /// イメージに格納されている生のシンボル名
    pub name: String,
    /// デマングルされたシンボル名（デマングルできない場合は生の名前）
    pub demangled_name: String,
    pub address: u64,
    pub size: u64,
}

impl Symbol {
    /// シンボルを作成し、デマングルされた名前を設定する
    pub fn new(name: String, address: u64, size: u64) -> Self {
        let demangled_name = demangle_symbol(&name);
        Self {
            name,
            demangled_name,
            address,
            size,
        }
    }

    /// アドレスがシンボルの範囲内にあるか
    fn covers(&self, addr: u64) -> bool {
        addr >= self.address && (self.size == 0 || addr < self.address + self.size)
    }
}

/// シンボル名をデマングルする
///
/// Haskellのzエンコード名はここでは扱わず、RTSに同梱される
/// Rust製ライブラリのシンボルのみを対象とする
fn demangle_symbol(name: &str) -> String {
    if let Ok(demangled) = rustc_demangle::try_demangle(name) {
        return format!("{:#}", demangled);
    }
    name.to_string()
}

/// シンボル解決
pub struct SymbolResolver {
    /// シンボル名 -> シンボル情報のマップ
    symbols_by_name: HashMap<String, Symbol>,
    /// アドレス順にソートされたシンボル
    symbols_by_address: Vec<Symbol>,
    /// PIE（Position Independent Executable）かどうか
    is_pie: bool,
}

impl SymbolResolver {
    /// DWARFローダーからシンボル解決を作成する
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let symbols = loader
            .object_file()
            .symbols()
            .filter(|s| !matches!(s.kind(), SymbolKind::File | SymbolKind::Section))
            .filter_map(|s| {
                let name = s.name().ok()?;
                (!name.is_empty()).then(|| Symbol::new(name.to_string(), s.address(), s.size()))
            });

        Ok(Self::from_symbols(symbols, loader.is_pie()))
    }

    /// シンボル列からシンボル解決を作成する
    pub fn from_symbols(symbols: impl IntoIterator<Item = Symbol>, is_pie: bool) -> Self {
        let mut symbols_by_name = HashMap::new();
        let mut symbols_by_address = Vec::new();

        for sym in symbols {
            symbols_by_name.insert(sym.name.clone(), sym.clone());
            symbols_by_address.push(sym);
        }

        symbols_by_address.sort_by_key(|s| s.address);

        Self {
            symbols_by_name,
            symbols_by_address,
            is_pie,
        }
    }

    /// PIE（Position Independent Executable）かどうかを取得する
    pub fn is_pie(&self) -> bool {
        self.is_pie
    }

    /// シンボル名からアドレスを解決する
    pub fn resolve(&self, symbol: &str) -> Option<u64> {
        self.symbols_by_name.get(symbol).map(|s| s.address)
    }

    /// アドレスを含むシンボルを解決する
    ///
    /// サイズ情報があればその範囲内のみ、なければ直前のシンボルを返す。
    pub fn reverse_resolve(&self, addr: u64) -> Option<Symbol> {
        let idx = self
            .symbols_by_address
            .partition_point(|s| s.address <= addr);
        // 同一アドレスに複数のシンボルがある場合は範囲を持つものを優先する
        self.symbols_by_address[..idx]
            .iter()
            .rev()
            .take_while(|s| s.address == self.symbols_by_address[idx - 1].address)
            .find(|s| s.covers(addr))
            .cloned()
    }

    /// すべてのシンボルを取得する
    pub fn all_symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols_by_address.iter()
    }

    /// パターンにマッチするシンボルをアドレス順に検索する
    /// 生の名前とデマングル名の両方で検索する
    pub fn find_symbols(&self, pattern: &str) -> Vec<Symbol> {
        self.symbols_by_address
            .iter()
            .filter(|s| s.name.contains(pattern) || s.demangled_name.contains(pattern))
            .cloned()
            .collect()
    }
}
