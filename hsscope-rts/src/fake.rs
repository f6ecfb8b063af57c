//! テスト用の合成ターゲット
//!
//! 実プロセスの代わりに、バイト単位のメモリと手書きのデバッグ情報で
//! RTSのデータ構造を組み立てます。レイアウトはx86_64のGHC RTSを簡略化したもの。

use crate::layout::RtsLayout;
use crate::tso::ThreadHandle;
use hsscope_dwarf::{DebugInfoSource, LineInfo, LineRow, ScopeInfo, StructLayout, TypeLayouts};
use hsscope_target::MemoryReader;
use std::collections::HashMap;

/// バイト単位の疎なメモリ
#[derive(Debug, Clone, Default)]
pub struct FakeMemory {
    bytes: HashMap<u64, u8>,
}

impl FakeMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.bytes.insert(addr + i as u64, *b);
        }
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        self.write_bytes(addr, &value.to_le_bytes());
    }

    pub fn write_u16(&mut self, addr: u64, value: u16) {
        self.write_bytes(addr, &value.to_le_bytes());
    }
}

impl MemoryReader for FakeMemory {
    fn read(&self, addr: u64, size: usize) -> hsscope_target::Result<Vec<u8>> {
        (0..size as u64)
            .map(|i| {
                let at = addr.wrapping_add(i);
                self.bytes
                    .get(&at)
                    .copied()
                    .ok_or_else(|| anyhow::anyhow!("address 0x{:x} is not mapped", at))
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
struct FakeScope {
    start: u64,
    end: u64,
    name: Option<String>,
}

/// 手書きのデバッグ情報
#[derive(Debug, Clone, Default)]
pub struct FakeDebugInfo {
    scopes: Vec<FakeScope>,
    symbols: Vec<(u64, u64, String)>,
    lines: Vec<(u64, u64, LineInfo)>,
    rows: Vec<LineRow>,
    globals: HashMap<String, u64>,
}

impl FakeDebugInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// スコープを追加する。範囲の狭いものほど内側になる
    pub fn scope(mut self, start: u64, end: u64, name: Option<&str>) -> Self {
        self.add_scope(start, end, name);
        self
    }

    pub fn symbol(mut self, address: u64, size: u64, name: &str) -> Self {
        self.add_symbol(address, size, name);
        self
    }

    pub fn line(mut self, start: u64, end: u64, file: Option<&str>, line: u32) -> Self {
        self.add_line(start, end, file, line);
        self
    }

    /// 行番号テーブルの行を追加する（テーブルは1つだけ）
    pub fn row(mut self, address: u64, line: u32) -> Self {
        self.rows.push(LineRow { address, line });
        self
    }

    pub fn global(mut self, name: &str, address: u64) -> Self {
        self.set_global(name, address);
        self
    }

    pub fn add_scope(&mut self, start: u64, end: u64, name: Option<&str>) {
        self.scopes.push(FakeScope {
            start,
            end,
            name: name.map(str::to_string),
        });
    }

    pub fn add_symbol(&mut self, address: u64, size: u64, name: &str) {
        self.symbols.push((address, size, name.to_string()));
    }

    pub fn add_line(&mut self, start: u64, end: u64, file: Option<&str>, line: u32) {
        self.lines.push((
            start,
            end,
            LineInfo {
                file: file.map(str::to_string),
                line,
                column: None,
            },
        ));
    }

    pub fn set_global(&mut self, name: &str, address: u64) {
        self.globals.insert(name.to_string(), address);
    }

    pub fn remove_global(&mut self, name: &str) {
        self.globals.remove(name);
    }
}

impl DebugInfoSource for FakeDebugInfo {
    fn scope_chain(&self, pc: u64) -> Vec<ScopeInfo> {
        let mut chain: Vec<&FakeScope> = self
            .scopes
            .iter()
            .filter(|s| s.start <= pc && pc < s.end)
            .collect();
        chain.sort_by_key(|s| s.end - s.start);
        chain
            .into_iter()
            .map(|s| ScopeInfo {
                name: s.name.clone(),
                low_pc: s.start,
            })
            .collect()
    }

    fn symbol_at(&self, pc: u64) -> Option<String> {
        self.symbols
            .iter()
            .find(|(start, size, _)| *start <= pc && pc < start + size)
            .map(|(_, _, name)| name.clone())
    }

    fn line_at(&self, pc: u64) -> Option<LineInfo> {
        self.lines
            .iter()
            .find(|(start, end, _)| *start <= pc && pc < *end)
            .map(|(_, _, info)| info.clone())
    }

    fn line_table(&self, _pc: u64) -> Vec<LineRow> {
        self.rows.clone()
    }

    fn global_address(&self, name: &str) -> Option<u64> {
        self.globals.get(name).copied()
    }
}

/// 合成レイアウトの型情報
pub fn type_layouts() -> TypeLayouts {
    let mut types = TypeLayouts::new();
    types.insert(
        StructLayout::new("StgTSO", 64)
            .with_field("_link", 8, 8)
            .with_field("global_link", 16, 8)
            .with_field("stackobj", 24, 8)
            .with_field("what_next", 32, 2)
            .with_field("why_blocked", 34, 2)
            .with_field("id", 48, 8),
    );
    types.insert(
        StructLayout::new("StgStack", 24)
            .with_field("stack_size", 8, 4)
            .with_field("sp", 16, 8)
            .with_field("stack", 24, 0),
    );
    types.insert(
        StructLayout::new("Capability", 128)
            .with_field("r", 0, 64)
            .with_field("r.rCurrentTSO", 16, 8)
            .with_field("run_queue_hd", 64, 8),
    );
    types.insert(StructLayout::new("generation", 32).with_field("threads", 8, 8));
    types.insert(
        StructLayout::new("RTS_FLAGS", 16)
            .with_field("GcFlags", 0, 16)
            .with_field("GcFlags.generations", 4, 4),
    );
    types.insert(
        StructLayout::new("StgRetInfoTable", 16)
            .with_field("i", 0, 16)
            .with_field("i.layout", 0, 8)
            .with_field("i.layout.bitmap", 0, 8)
            .with_field("i.type", 8, 4),
    );
    types.insert(
        StructLayout::new("StgRetFun", 24)
            .with_field("size", 8, 8)
            .with_field("fun", 16, 8),
    );
    types
}

/// 合成レイアウト
pub fn layout() -> RtsLayout {
    RtsLayout::resolve(&type_layouts()).expect("synthetic RTS layout is complete")
}

/// 合成スタックの1フレーム
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSpec {
    pub pc: u64,
    /// 関数適用フレームの追加ワード数
    pub fun_size: u64,
}

impl FrameSpec {
    pub fn new(pc: u64) -> Self {
        Self { pc, fun_size: 0 }
    }

    pub fn fun(pc: u64, fun_size: u64) -> Self {
        Self { pc, fun_size }
    }
}

const CODE_BASE: u64 = 0x40_0000;
const HEAP_BASE: u64 = 0x100_0000;
const GLOBALS_BASE: u64 = 0x80_0000;
const MAX_CAPS: u64 = 16;
const MAX_GENS: u64 = 8;

/// スタックの先頭に置く未使用ワード数
const STACK_SLACK_WORDS: u64 = 4;

/// RTSのスレッド構造を持つ合成イメージ
pub struct FakeImage {
    pub mem: FakeMemory,
    pub debug: FakeDebugInfo,
    pub layout: RtsLayout,
    end_tso_queue: u64,
    next_code: u64,
    next_heap: u64,
    /// コードアドレス -> (種別, ビットマップ)
    code: HashMap<u64, (u32, u64)>,
    capabilities: Vec<u64>,
    generations: u64,
    n_generations: u32,
}

impl Default for FakeImage {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeImage {
    /// Capabilityも世代もない空のイメージ
    pub fn new() -> Self {
        let layout = layout();
        let mut image = Self {
            mem: FakeMemory::new(),
            debug: FakeDebugInfo::new(),
            layout,
            end_tso_queue: 0,
            next_code: CODE_BASE,
            next_heap: HEAP_BASE,
            code: HashMap::new(),
            capabilities: Vec::new(),
            generations: 0,
            n_generations: 0,
        };

        image.end_tso_queue = image.alloc(16);
        image.generations = image.alloc(image.layout.gen_size * MAX_GENS);

        let n_caps = GLOBALS_BASE;
        let caps_ptr = GLOBALS_BASE + 0x10;
        let flags = GLOBALS_BASE + 0x20;
        let gens_ptr = GLOBALS_BASE + 0x40;
        let caps_array = GLOBALS_BASE + 0x100;

        image.mem.write_u32(n_caps, 0);
        image.mem.write_u64(caps_ptr, caps_array);
        image.mem.write_bytes(caps_array, &[0; (MAX_CAPS * 8) as usize]);
        image.mem.write_bytes(flags, &[0; 16]);
        image.mem.write_u64(gens_ptr, image.generations);

        image.debug.set_global("n_capabilities", n_caps);
        image.debug.set_global("capabilities", caps_ptr);
        image.debug.set_global("RtsFlags", flags);
        image.debug.set_global("generations", gens_ptr);
        image.debug.set_global("stg_END_TSO_QUEUE_closure", image.end_tso_queue);
        image
    }

    fn alloc(&mut self, size: u64) -> u64 {
        let addr = self.next_heap;
        self.mem.write_bytes(addr, &vec![0; size as usize]);
        self.next_heap += (size + 15) & !15;
        addr
    }

    fn global(&self, name: &str) -> u64 {
        self.debug.global_address(name).unwrap_or(0)
    }

    /// 戻り情報テーブル付きのコードを置き、コードアドレスを返す
    ///
    /// `name`はシンボルテーブルに登録する。
    pub fn code(&mut self, name: &str, kind: u32, bitmap: u64) -> u64 {
        let info = self.next_code;
        let pc = info + self.layout.ret_info_size;
        self.mem.write_u64(info + self.layout.info_bitmap.offset, bitmap);
        self.mem.write_u32(info + self.layout.info_type.offset, kind);
        self.mem.write_bytes(pc, &[0x90; 16]);
        self.debug.add_symbol(pc, 16, name);
        self.code.insert(pc, (kind, bitmap));
        self.next_code = pc + 0x30;
        pc
    }

    fn frame_words(&self, frame: &FrameSpec) -> u64 {
        match self.code.get(&frame.pc) {
            Some(&(32, _)) => self.layout.ret_fun_header_words + frame.fun_size,
            Some(&(29 | 31, _)) | None => 1,
            Some(&(_, bitmap)) => crate::frame::small_frame_size(bitmap),
        }
    }

    /// スレッドを作る（実行中、リンクは番兵）
    pub fn thread(&mut self, id: u64, frames: &[FrameSpec]) -> u64 {
        let layout = self.layout.clone();
        let used: u64 = frames.iter().map(|f| self.frame_words(f)).sum();
        let stack_words = used + STACK_SLACK_WORDS;

        let stack = self.alloc(layout.stack_stack.offset + stack_words * 8);
        let base = stack + layout.stack_stack.offset;
        let sp = base + STACK_SLACK_WORDS * 8;
        self.mem.write_u32(stack + layout.stack_size.offset, stack_words as u32);
        self.mem.write_u64(stack + layout.stack_sp.offset, sp);

        let mut cursor = sp;
        for frame in frames {
            self.mem.write_u64(cursor, frame.pc);
            if self.code.get(&frame.pc).map(|&(kind, _)| kind) == Some(32) {
                self.mem.write_u64(cursor + layout.ret_fun_size.offset, frame.fun_size);
            }
            cursor += self.frame_words(frame) * 8;
        }

        let tso = self.alloc(64);
        self.mem.write_u64(tso + layout.tso_id.offset, id);
        self.mem.write_u64(tso + layout.tso_stackobj.offset, stack);
        self.mem.write_u16(tso + layout.tso_what_next.offset, 1);
        self.mem.write_u16(tso + layout.tso_why_blocked.offset, 0);
        self.mem.write_u64(tso + layout.tso_link.offset, self.end_tso_queue);
        self.mem.write_u64(tso + layout.tso_global_link.offset, self.end_tso_queue);
        tso
    }

    pub fn set_status(&mut self, tso: u64, what_next: u16, why_blocked: u16) {
        self.mem.write_u16(tso + self.layout.tso_what_next.offset, what_next);
        self.mem.write_u16(tso + self.layout.tso_why_blocked.offset, why_blocked);
    }

    pub fn set_link(&mut self, tso: u64, next: u64) {
        self.mem.write_u64(tso + self.layout.tso_link.offset, next);
    }

    pub fn set_global_link(&mut self, tso: u64, next: u64) {
        self.mem.write_u64(tso + self.layout.tso_global_link.offset, next);
    }

    /// `_link`で繋いだ実行キューを持つCapabilityを追加し、番号を返す
    pub fn capability(&mut self, run_queue: &[u64]) -> usize {
        let cap = self.alloc(128);
        let head = self.chain(run_queue, |image, tso, next| image.set_link(tso, next));
        self.mem.write_u64(cap + self.layout.cap_run_queue_hd.offset, head);

        let index = self.capabilities.len();
        let caps_array = GLOBALS_BASE + 0x100;
        self.mem.write_u64(caps_array + index as u64 * 8, cap);
        self.capabilities.push(cap);
        let n_caps = self.global("n_capabilities");
        self.mem.write_u32(n_caps, self.capabilities.len() as u32);
        index
    }

    /// Capabilityで実行中のスレッドを設定する
    pub fn set_current(&mut self, cap: usize, tso: u64) {
        let addr = self.capabilities[cap] + self.layout.cap_current_tso.offset;
        self.mem.write_u64(addr, tso);
    }

    /// `global_link`で繋いだスレッドリストを持つ世代を追加する
    pub fn generation(&mut self, threads: &[u64]) {
        let head = self.chain(threads, |image, tso, next| image.set_global_link(tso, next));
        let generation = self.generations + u64::from(self.n_generations) * self.layout.gen_size;
        self.mem.write_u64(generation + self.layout.gen_threads.offset, head);
        self.n_generations += 1;
        self.set_generation_count(self.n_generations);
    }

    /// `RtsFlags.GcFlags.generations`を書き換える
    pub fn set_generation_count(&mut self, count: u32) {
        let flags = self.global("RtsFlags");
        self.mem.write_u32(flags + self.layout.rts_flags_generations.offset, count);
    }

    /// スレッドを順に繋ぎ、先頭を返す（空なら番兵）
    fn chain(&mut self, threads: &[u64], mut link: impl FnMut(&mut Self, u64, u64)) -> u64 {
        for pair in threads.windows(2) {
            link(self, pair[0], pair[1]);
        }
        if let Some(&last) = threads.last() {
            link(self, last, self.end_tso_queue);
        }
        threads.first().copied().unwrap_or(self.end_tso_queue)
    }

    pub fn handle(&self, tso: u64) -> ThreadHandle {
        ThreadHandle::read(&self.mem, &self.layout, tso).expect("fake thread record")
    }
}
