//! スレッドレジストリの列挙
//!
//! スレッドは2つの独立した情報源から見つける（rts/Threads.c:printAllThreads と同じ順序）。
//!
//! 1. 各Capabilityの実行キュー（`run_queue_hd`から`_link`を辿る）
//! 2. 各世代のスレッドリスト（`threads`から`global_link`を辿る）
//!
//! どちらのリストも`stg_END_TSO_QUEUE_closure`のアドレスで終わる。
//! NULLでは終わらないので、番兵との比較で判定する。

use crate::layout::{read_field, read_word, RtsLayout, WORD_SIZE};
use crate::tso::ThreadHandle;
use crate::{Result, RtsError};
use hsscope_dwarf::DebugInfoSource;
use hsscope_target::MemoryReader;
use std::collections::HashSet;

/// Capability数の上限（これを超える値はイメージの破損とみなす）
const MAX_CAPABILITIES: u64 = 1 << 16;
/// 世代数の上限
const MAX_GENERATIONS: u64 = 64;

const RUN_QUEUE: &str = "run queue";
const GENERATION_LIST: &str = "generation thread list";

/// 列挙の設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    /// 1つのリストで辿るリンクの上限
    pub max_links: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self { max_links: 1_000_000 }
    }
}

/// 列挙の起点となるRTSのグローバル値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtsRoots {
    pub n_capabilities: u64,
    /// `Capability *`の配列
    pub capabilities: u64,
    pub n_generations: u64,
    /// `generation`の配列
    pub generations: u64,
    /// リストの番兵
    pub end_tso_queue: u64,
}

impl RtsRoots {
    /// グローバルシンボルから起点を読み取る
    pub fn locate<M, D>(mem: &M, debug: &D, layout: &RtsLayout) -> Result<Self>
    where
        M: MemoryReader,
        D: DebugInfoSource,
    {
        let symbol = |name: &str| {
            debug
                .global_address(name)
                .ok_or_else(|| RtsError::MissingSymbol(name.to_string()))
        };

        let n_caps_addr = symbol("n_capabilities")?;
        let n_capabilities = u64::from(
            mem.read_u32(n_caps_addr)
                .map_err(|e| RtsError::read_fault(n_caps_addr, e))?,
        );
        let capabilities = read_word(mem, symbol("capabilities")?)?;
        let n_generations = read_field(mem, symbol("RtsFlags")?, layout.rts_flags_generations)?;
        let generations = read_word(mem, symbol("generations")?)?;
        let end_tso_queue = symbol("stg_END_TSO_QUEUE_closure")?;

        if n_capabilities > MAX_CAPABILITIES {
            return Err(RtsError::ImplausibleValue {
                name: "n_capabilities",
                value: n_capabilities,
            });
        }
        if n_generations > MAX_GENERATIONS {
            return Err(RtsError::ImplausibleValue {
                name: "RtsFlags.GcFlags.generations",
                value: n_generations,
            });
        }

        let roots = Self {
            n_capabilities,
            capabilities,
            n_generations,
            generations,
            end_tso_queue,
        };
        tracing::debug!("RTS roots: {:?}", roots);
        Ok(roots)
    }
}

/// スレッドレジストリ
pub struct ThreadRegistry<'a, M: MemoryReader> {
    mem: &'a M,
    layout: &'a RtsLayout,
    roots: RtsRoots,
    config: RegistryConfig,
}

impl<'a, M: MemoryReader> ThreadRegistry<'a, M> {
    pub fn new(mem: &'a M, layout: &'a RtsLayout, roots: RtsRoots, config: RegistryConfig) -> Self {
        Self {
            mem,
            layout,
            roots,
            config,
        }
    }

    /// `index`番目のCapabilityのアドレス
    fn capability(&self, index: u64) -> Result<u64> {
        capability_at(self.mem, &self.roots, index)
    }

    /// 全スレッドを列挙する
    ///
    /// 実行キューのスレッドを全て返した後に世代リストのスレッドを返す。
    /// 同じレコードは一度だけ返す。リストの途中でエラーになった場合は
    /// エラーを1つ返してそのリストを打ち切り、次のリストに進む。
    pub fn all_threads(&self) -> AllThreads<'_, 'a, M> {
        AllThreads {
            registry: self,
            source: Source::RunQueue(0).normalize(&self.roots),
            cursor: None,
            links: 0,
            seen: HashSet::new(),
        }
    }

    /// 各Capabilityで現在実行中のスレッドを列挙する
    ///
    /// キューは辿らず`r.rCurrentTSO`だけを読む。NULLのCapabilityは飛ばす。
    pub fn running_threads(&self) -> impl Iterator<Item = Result<ThreadHandle>> + 'a {
        let (mem, layout, roots) = (self.mem, self.layout, self.roots);
        (0..roots.n_capabilities).filter_map(move |i| {
            let current = capability_at(mem, &roots, i)
                .and_then(|cap| read_field(mem, cap, layout.cap_current_tso));
            match current {
                Ok(0) => None,
                Ok(tso) => Some(ThreadHandle::read(mem, layout, tso)),
                Err(e) => Some(Err(e)),
            }
        })
    }
}

fn capability_at<M: MemoryReader>(mem: &M, roots: &RtsRoots, index: u64) -> Result<u64> {
    read_word(mem, roots.capabilities.wrapping_add(index * WORD_SIZE))
}

/// 現在辿っているリスト
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    RunQueue(u64),
    Generation(u64),
    Done,
}

impl Source {
    fn name(self) -> &'static str {
        match self {
            Self::RunQueue(_) => RUN_QUEUE,
            _ => GENERATION_LIST,
        }
    }

    /// 範囲外のインデックスを次の情報源に繰り上げる
    fn normalize(self, roots: &RtsRoots) -> Self {
        match self {
            Self::RunQueue(i) if i >= roots.n_capabilities => Self::Generation(0).normalize(roots),
            Self::Generation(i) if i >= roots.n_generations => Self::Done,
            other => other,
        }
    }

    fn next(self, roots: &RtsRoots) -> Self {
        match self {
            Self::RunQueue(i) => Self::RunQueue(i + 1),
            Self::Generation(i) => Self::Generation(i + 1),
            Self::Done => Self::Done,
        }
        .normalize(roots)
    }
}

/// [`ThreadRegistry::all_threads`]のイテレータ
pub struct AllThreads<'r, 'a, M: MemoryReader> {
    registry: &'r ThreadRegistry<'a, M>,
    source: Source,
    /// 現在のリストで次に読むレコード（Noneならリストの先頭を読む）
    cursor: Option<u64>,
    links: usize,
    seen: HashSet<u64>,
}

impl<M: MemoryReader> AllThreads<'_, '_, M> {
    /// リストの先頭を読む
    fn head(&self) -> Result<u64> {
        let registry = self.registry;
        let layout = registry.layout;
        match self.source {
            Source::RunQueue(i) => {
                let cap = registry.capability(i)?;
                read_field(registry.mem, cap, layout.cap_run_queue_hd)
            }
            Source::Generation(i) => {
                let generation = registry
                    .roots
                    .generations
                    .wrapping_add(i * layout.gen_size);
                read_field(registry.mem, generation, layout.gen_threads)
            }
            Source::Done => Ok(registry.roots.end_tso_queue),
        }
    }

    /// 現在のリストを終えて次のリストに進む
    fn finish_source(&mut self) {
        self.source = self.source.next(&self.registry.roots);
        self.cursor = None;
        self.links = 0;
    }

    /// 現在のリストを打ち切り、エラーを返す
    fn abandon(&mut self, err: RtsError) -> Option<Result<ThreadHandle>> {
        tracing::warn!("abandoning {}: {}", self.source.name(), err);
        self.finish_source();
        Some(Err(err))
    }
}

impl<M: MemoryReader> Iterator for AllThreads<'_, '_, M> {
    type Item = Result<ThreadHandle>;

    fn next(&mut self) -> Option<Self::Item> {
        let end = self.registry.roots.end_tso_queue;
        loop {
            if self.source == Source::Done {
                return None;
            }

            let addr = match self.cursor {
                Some(addr) => addr,
                None => match self.head() {
                    Ok(head) => {
                        self.cursor = Some(head);
                        head
                    }
                    Err(e) => return self.abandon(e),
                },
            };

            if addr == end {
                self.finish_source();
                continue;
            }

            if self.links >= self.registry.config.max_links {
                let err = RtsError::TraversalDidNotTerminate {
                    list: self.source.name(),
                    limit: self.registry.config.max_links,
                };
                return self.abandon(err);
            }
            self.links += 1;

            let handle = match ThreadHandle::read(self.registry.mem, self.registry.layout, addr) {
                Ok(handle) => handle,
                Err(e) => return self.abandon(e),
            };
            self.cursor = Some(match self.source {
                Source::RunQueue(_) => handle.link,
                _ => handle.global_link,
            });

            if self.seen.insert(addr) {
                return Some(Ok(handle));
            }
        }
    }
}
