//! インスペクタのメインロジック
//!
//! 対象バイナリのデバッグ情報とRTSのレイアウトを読み込み、停止させたプロセスの
//! スレッドとスタックを表示します。各コマンドは実行のたびに
//! 名前リゾルバとキャッシュを作り直し、コマンドをまたいで状態を持ち越しません。

use crate::errors::{ERR_BINARY_NOT_LOADED, ERR_NOT_ATTACHED};
use crate::trace::{ListOptions, ProfileOptions, TraceFormatter};
use crate::Result;
use hsscope_dwarf::{DebugSymbols, DwarfLoader, Symbol, TypeLayouts};
use hsscope_rts::{
    zdecode, FunctionName, NameCache, NameResolver, NameStyle, RegistryConfig, RtsLayout, RtsRoots,
    ThreadRegistry, WalkConfig, TYPE_NAMES,
};
use hsscope_target::{Memory, Process};
use std::io::Write;
use std::path::{Path, PathBuf};

/// 対象バイナリから読み込んだ情報
struct Binary {
    path: PathBuf,
    is_pie: bool,
    debug: DebugSymbols,
    layout: RtsLayout,
}

/// インスペクタ
pub struct Inspector {
    binary: Option<Binary>,
    /// アタッチ中のプロセス（dropでデタッチする）
    process: Option<Process>,
    memory: Option<Memory>,
    registry_config: RegistryConfig,
    walk_config: WalkConfig,
}

impl Inspector {
    pub fn new() -> Self {
        Self {
            binary: None,
            process: None,
            memory: None,
            registry_config: RegistryConfig::default(),
            walk_config: WalkConfig::default(),
        }
    }

    pub fn with_limits(mut self, registry_config: RegistryConfig, walk_config: WalkConfig) -> Self {
        self.registry_config = registry_config;
        self.walk_config = walk_config;
        self
    }

    /// ELFバイナリからデバッグ情報とRTSのレイアウトを読み込む
    pub fn load_binary<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let loader = DwarfLoader::load(path)?;
        let symbols = DebugSymbols::load(&loader)?;
        let types = TypeLayouts::extract(loader.dwarf(), TYPE_NAMES)?;
        let layout = RtsLayout::resolve(&types)?;

        let n_symbols = symbols.symbols().all_symbols().count();
        let n_scopes = symbols.scopes().len();
        tracing::debug!(
            "loaded {} ({} symbols, {} scopes)",
            path.display(),
            n_symbols,
            n_scopes
        );
        self.binary = Some(Binary {
            path: path.to_path_buf(),
            is_pie: loader.is_pie(),
            debug: symbols,
            layout,
        });
        Ok(())
    }

    /// 既存のプロセスにアタッチして停止させる
    ///
    /// PIEの場合はマッピングからロードバイアスを求めてデバッグ情報に設定する。
    pub fn attach(&mut self, pid: i32) -> Result<()> {
        let binary = self
            .binary
            .take()
            .ok_or_else(|| anyhow::anyhow!(ERR_BINARY_NOT_LOADED))?;

        let process = Process::attach(pid);
        let process = match process {
            Ok(process) => process,
            Err(e) => {
                self.binary = Some(binary);
                return Err(e);
            }
        };
        let memory = Memory::new(pid);

        let bias = if binary.is_pie {
            memory.image_base(&binary.path).unwrap_or_else(|e| {
                tracing::warn!("could not determine load address of {}: {}", binary.path.display(), e);
                0
            })
        } else {
            0
        };
        tracing::debug!("load bias of pid {}: 0x{:x}", pid, bias);

        self.binary = Some(Binary {
            debug: binary.debug.with_load_bias(bias),
            ..binary
        });
        self.process = Some(process);
        self.memory = Some(memory);
        Ok(())
    }

    pub fn pid(&self) -> Option<i32> {
        self.process.as_ref().map(Process::pid)
    }

    fn require_binary(&self) -> Result<&Binary> {
        self.binary
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!(ERR_BINARY_NOT_LOADED))
    }

    fn require_target(&self) -> Result<(&Binary, &Memory)> {
        let memory = self
            .memory
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!(ERR_NOT_ATTACHED))?;
        Ok((self.require_binary()?, memory))
    }

    /// 全スレッドのスタックを表示する（`info tsos`）
    pub fn list_threads<W: Write>(&self, out: &mut W, options: ListOptions) -> Result<()> {
        let (binary, memory) = self.require_target()?;
        let roots = RtsRoots::locate(memory, &binary.debug, &binary.layout)?;
        let registry = ThreadRegistry::new(memory, &binary.layout, roots, self.registry_config);
        let resolver = NameResolver::new(&binary.debug)?;
        let formatter = TraceFormatter::new(memory, &binary.layout, &resolver, self.walk_config);

        formatter.write_listing(out, registry.all_threads(), options)?;
        Ok(())
    }

    /// 実行中スレッドのプロファイル行を出力する（`info tsoprofile`）
    pub fn profile<W: Write>(&self, out: &mut W, options: ProfileOptions) -> Result<()> {
        let (binary, memory) = self.require_target()?;
        let roots = RtsRoots::locate(memory, &binary.debug, &binary.layout)?;
        let registry = ThreadRegistry::new(memory, &binary.layout, roots, self.registry_config);
        let resolver = NameResolver::new(&binary.debug)?;
        let formatter = TraceFormatter::new(memory, &binary.layout, &resolver, self.walk_config);

        let mut cache = NameCache::new();
        formatter.write_profile(out, registry.running_threads(), options, &mut cache)?;
        tracing::debug!("resolved {} distinct code addresses", cache.len());
        Ok(())
    }

    /// コードアドレスの関数名を (通常表示, pretty表示) で返す
    pub fn function_name(&self, pc: u64) -> Result<(FunctionName, FunctionName)> {
        let binary = self.require_binary()?;
        let resolver = NameResolver::new(&binary.debug)?;
        Ok((
            resolver.resolve(pc, NameStyle::Clean),
            resolver.resolve(pc, NameStyle::Pretty),
        ))
    }

    /// パターンにマッチするシンボルを検索する
    ///
    /// 生の名前とz復元した名前の両方で検索する。
    pub fn find_symbols(&self, pattern: &str) -> Result<Vec<Symbol>> {
        let binary = self.require_binary()?;
        Ok(find_in(binary.debug.symbols().all_symbols(), pattern))
    }
}

impl Default for Inspector {
    fn default() -> Self {
        Self::new()
    }
}

/// 生の名前、デマングル名、z復元名のいずれかが`pattern`を含むシンボル
fn find_in<'a>(symbols: impl Iterator<Item = &'a Symbol>, pattern: &str) -> Vec<Symbol> {
    symbols
        .filter(|s| {
            s.name.contains(pattern)
                || s.demangled_name.contains(pattern)
                || zdecode(&s.name).contains(pattern)
        })
        .cloned()
        .collect()
}
