//! コードアドレスから関数名を解決する
//!
//! 次の順に試し、最初に見つかった名前を使う。
//!
//! 1. PCを含む最内側スコープの名前
//! 2. 無名スコープの場合は名前を持つ祖先スコープ（`name:closure`）
//! 3. シンボルテーブル上のPCのシンボル（`_info`を含むもののみ）
//! 4. 行番号テーブルからの推測（`name:??`、pretty表示のときのみ）
//!
//! どれも失敗した場合は`??`を返す。解決の失敗はエラーにしない。

use crate::zdecode::zdecode;
use crate::Result;
use hsscope_dwarf::DebugInfoSource;
use regex::RegexSet;
use std::collections::HashMap;
use std::fmt;

/// 解決できなかった場合の名前
pub const UNKNOWN_NAME: &str = "??";

/// RTS内部の関数名の接頭辞
pub const INTERNAL_PREFIX: &str = "stg_";

/// z復元してGHCの接尾辞（`_ret_info`, `_info`）を取り除く
pub fn clean_name(raw: &str) -> String {
    let decoded = zdecode(raw);
    let name = decoded.strip_suffix("_ret_info").unwrap_or(&decoded);
    let name = name.strip_suffix("_info").unwrap_or(name);
    name.to_string()
}

/// [`clean_name`]に加えてパッケージのバージョンとハッシュを取り除く
///
/// # Examples
/// ```
/// use hsscope_rts::pretty_name;
///
/// assert_eq!(
///     pretty_name("aesonzm1zi4zi6zi0zmI0PKQM6ADfIKvzzTI4BNoug_DataziAttoparsecziTime_zdwf_info"),
///     "aeson:Data.Attoparsec.Time_$wf"
/// );
/// ```
pub fn pretty_name(raw: &str) -> String {
    let name = clean_name(raw);
    if !name.contains('-') {
        return name;
    }
    let (package, rest) = name.split_once('_').unwrap_or((name.as_str(), ""));
    let package = package.split('.').next().unwrap_or(package);
    let package = package.trim_end_matches(|c: char| c.is_ascii_digit() || c == '-');
    format!("{}:{}", package, rest)
}

/// 名前の表示形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameStyle {
    /// z復元と接尾辞の除去のみ
    Clean,
    /// パッケージ名を短縮する（推測も行う）
    Pretty,
}

impl NameStyle {
    fn render(self, raw: &str) -> String {
        match self {
            Self::Clean => clean_name(raw),
            Self::Pretty => pretty_name(raw),
        }
    }
}

/// 名前の確度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    Exact,
    /// 無名スコープ（クロージャ）の中
    InsideClosure,
    /// 行番号テーブルからの推測
    Guess,
    Unknown,
}

/// 解決した関数名
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionName {
    pub name: String,
    pub kind: NameKind,
}

impl FunctionName {
    pub fn new(name: impl Into<String>, kind: NameKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }

    pub fn unknown() -> Self {
        Self::new(UNKNOWN_NAME, NameKind::Unknown)
    }

    pub fn is_unknown(&self) -> bool {
        self.kind == NameKind::Unknown
    }

    /// RTS内部の関数か
    pub fn is_internal(&self) -> bool {
        self.name.starts_with(INTERNAL_PREFIX)
    }
}

impl fmt::Display for FunctionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            NameKind::Exact => f.write_str(&self.name),
            NameKind::InsideClosure => write!(f, "{}:closure", self.name),
            NameKind::Guess => write!(f, "{}:??", self.name),
            NameKind::Unknown => f.write_str(UNKNOWN_NAME),
        }
    }
}

/// 推測に使う「普通のパッケージ関数らしい」名前の判定
///
/// zエンコードされたパッケージ名（`zm`）とモジュール名（`zi`）を含み、
/// パッケージとモジュールの区切り（`_`）を持つものを対象にする。
/// 大まかな判定で、誤検出はありうる。
struct HeuristicMatcher {
    patterns: RegexSet,
}

impl HeuristicMatcher {
    fn new() -> Result<Self> {
        Ok(Self {
            patterns: RegexSet::new(["zm", "zi", "_"])?,
        })
    }

    fn looks_ordinary(&self, name: &str) -> bool {
        self.patterns.matches(name).matched_all()
    }
}

/// 関数名リゾルバ
pub struct NameResolver<D: DebugInfoSource> {
    debug: D,
    matcher: HeuristicMatcher,
}

impl<D: DebugInfoSource> NameResolver<D> {
    pub fn new(debug: D) -> Result<Self> {
        Ok(Self {
            debug,
            matcher: HeuristicMatcher::new()?,
        })
    }

    pub fn debug(&self) -> &D {
        &self.debug
    }

    /// PCの関数名を解決する
    pub fn resolve(&self, pc: u64, style: NameStyle) -> FunctionName {
        let chain = self.debug.scope_chain(pc);

        if let Some(name) = chain.first().and_then(|s| s.name.as_deref()) {
            return FunctionName::new(style.render(name), NameKind::Exact);
        }

        if let Some(name) = chain.iter().skip(1).find_map(|s| s.name.as_deref()) {
            return FunctionName::new(style.render(name), NameKind::InsideClosure);
        }

        // ここまで来てスコープがあるなら、それは無名スコープ
        let in_closure = !chain.is_empty();
        if let Some(symbol) = self.debug.symbol_at(pc).filter(|s| s.contains("_info")) {
            let token = symbol.split_whitespace().next().unwrap_or(&symbol);
            let kind = if in_closure {
                NameKind::InsideClosure
            } else {
                NameKind::Exact
            };
            return FunctionName::new(style.render(token), kind);
        }

        if style == NameStyle::Pretty {
            if let Some(name) = self.guess(pc) {
                return FunctionName::new(style.render(&name), NameKind::Guess);
            }
        }

        tracing::debug!("no name for pc 0x{:x}", pc);
        FunctionName::unknown()
    }

    /// 行番号テーブルから親関数の名前を推測する
    ///
    /// PCの行以前で最も後ろにあり、かつ普通の関数らしい名前のスコープに
    /// 属する行を探す。
    fn guess(&self, pc: u64) -> Option<String> {
        let line = self.debug.line_at(pc)?;
        line.file.as_ref()?;

        let mut best_line = 0;
        let mut best = None;
        for row in self.debug.line_table(pc) {
            if row.line > line.line || row.line <= best_line {
                continue;
            }
            // 最内側が無名ブロックの行は使わない
            let Some(name) = self
                .debug
                .scope_chain(row.address)
                .into_iter()
                .next()
                .and_then(|s| s.name)
            else {
                continue;
            };
            if self.matcher.looks_ordinary(&name) {
                best_line = row.line;
                best = Some(name);
            }
        }
        best
    }
}

/// 1回のコマンド実行の間だけ使う名前キャッシュ
///
/// 対象プロセスが再開するとコードアドレスの意味が変わりうるので、
/// コマンドをまたいで使い回さない。
#[derive(Debug, Default)]
pub struct NameCache {
    names: HashMap<u64, FunctionName>,
}

impl NameCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// pretty表示の名前をキャッシュ経由で解決する
    pub fn resolve<D: DebugInfoSource>(&mut self, resolver: &NameResolver<D>, pc: u64) -> &FunctionName {
        self.names
            .entry(pc)
            .or_insert_with(|| resolver.resolve(pc, NameStyle::Pretty))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
