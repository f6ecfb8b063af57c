//! RTS構造体のレイアウト
//!
//! オフセットはハードコードせず、対象バイナリのDWARFから抽出した
//! [`TypeLayouts`]を解決して使います。RTSの型情報がない場合は
//! 解析を始める前にエラーにします。

use crate::{Result, RtsError};
use hsscope_dwarf::{FieldLayout, StructLayout, TypeLayouts};
use hsscope_target::MemoryReader;

/// ワードサイズ（64bitのみ対応）
pub const WORD_SIZE: u64 = 8;

/// DWARFから抽出する型名（構造体タグ名とtypedef名の両方）
pub const TYPE_NAMES: &[&str] = &[
    "StgTSO",
    "StgTSO_",
    "StgStack",
    "StgStack_",
    "Capability",
    "Capability_",
    "generation",
    "generation_",
    "RTS_FLAGS",
    "_RTS_FLAGS",
    "StgRetInfoTable",
    "StgRetInfoTable_",
    "StgRetFun",
];

/// スタック解析とスレッド列挙に必要なメンバのレイアウト
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtsLayout {
    pub tso_link: FieldLayout,
    pub tso_global_link: FieldLayout,
    pub tso_stackobj: FieldLayout,
    pub tso_what_next: FieldLayout,
    pub tso_why_blocked: FieldLayout,
    pub tso_id: FieldLayout,

    pub stack_size: FieldLayout,
    pub stack_sp: FieldLayout,
    /// スタック領域の先頭（可変長配列なのでオフセットのみ使う）
    pub stack_stack: FieldLayout,

    pub cap_run_queue_hd: FieldLayout,
    pub cap_current_tso: FieldLayout,

    pub gen_threads: FieldLayout,
    /// generation配列の要素サイズ
    pub gen_size: u64,

    pub rts_flags_generations: FieldLayout,

    /// フレーム記述子（戻り情報テーブル）のサイズ
    pub ret_info_size: u64,
    pub info_type: FieldLayout,
    pub info_bitmap: FieldLayout,

    pub ret_fun_size: FieldLayout,
    /// 関数適用フレームのヘッダワード数
    pub ret_fun_header_words: u64,
}

impl RtsLayout {
    /// 抽出済みの型情報からレイアウトを解決する
    pub fn resolve(types: &TypeLayouts) -> Result<Self> {
        let tso = lookup(types, &["StgTSO", "StgTSO_"])?;
        let stack = lookup(types, &["StgStack", "StgStack_"])?;
        let cap = lookup(types, &["Capability", "Capability_"])?;
        let generation = lookup(types, &["generation", "generation_"])?;
        let flags = lookup(types, &["RTS_FLAGS", "_RTS_FLAGS"])?;
        let ret_info = lookup(types, &["StgRetInfoTable", "StgRetInfoTable_"])?;
        let ret_fun = lookup(types, &["StgRetFun"])?;

        if generation.size == 0 {
            return Err(RtsError::MissingLayout("sizeof(generation)".to_string()));
        }
        if ret_info.size == 0 {
            return Err(RtsError::MissingLayout("sizeof(StgRetInfoTable)".to_string()));
        }
        if ret_fun.size == 0 || ret_fun.size % WORD_SIZE != 0 {
            return Err(RtsError::MissingLayout("sizeof(StgRetFun)".to_string()));
        }

        let layout = Self {
            tso_link: scalar(tso, "_link")?,
            tso_global_link: scalar(tso, "global_link")?,
            tso_stackobj: scalar(tso, "stackobj")?,
            tso_what_next: scalar(tso, "what_next")?,
            tso_why_blocked: scalar(tso, "why_blocked")?,
            tso_id: scalar(tso, "id")?,
            stack_size: scalar(stack, "stack_size")?,
            stack_sp: scalar(stack, "sp")?,
            stack_stack: member(stack, "stack")?,
            cap_run_queue_hd: scalar(cap, "run_queue_hd")?,
            cap_current_tso: scalar(cap, "r.rCurrentTSO")?,
            gen_threads: scalar(generation, "threads")?,
            gen_size: generation.size,
            rts_flags_generations: scalar(flags, "GcFlags.generations")?,
            ret_info_size: ret_info.size,
            info_type: scalar(ret_info, "i.type")?,
            info_bitmap: scalar(ret_info, "i.layout.bitmap")?,
            ret_fun_size: scalar(ret_fun, "size")?,
            ret_fun_header_words: ret_fun.size / WORD_SIZE,
        };
        tracing::debug!("resolved RTS layout: {:?}", layout);
        Ok(layout)
    }
}

fn lookup<'a>(types: &'a TypeLayouts, candidates: &[&str]) -> Result<&'a StructLayout> {
    candidates
        .iter()
        .find_map(|name| types.get(name))
        .ok_or_else(|| RtsError::MissingLayout(candidates[0].to_string()))
}

fn member(layout: &StructLayout, path: &str) -> Result<FieldLayout> {
    layout
        .field(path)
        .ok_or_else(|| RtsError::MissingLayout(format!("{}.{}", layout.name, path)))
}

/// 整数またはポインタとして読むメンバ
fn scalar(layout: &StructLayout, path: &str) -> Result<FieldLayout> {
    let field = member(layout, path)?;
    if !matches!(field.size, 1 | 2 | 4 | 8) {
        return Err(RtsError::MissingLayout(format!(
            "{}.{} has unsupported width {}",
            layout.name, path, field.size
        )));
    }
    Ok(field)
}

/// 構造体`base`のメンバを読み取る
pub fn read_field<M: MemoryReader>(mem: &M, base: u64, field: FieldLayout) -> Result<u64> {
    let addr = base.wrapping_add(field.offset);
    mem.read_uint(addr, field.size)
        .map_err(|e| RtsError::read_fault(addr, e))
}

/// 1ワード読み取る
pub fn read_word<M: MemoryReader>(mem: &M, addr: u64) -> Result<u64> {
    mem.read_ptr(addr).map_err(|e| RtsError::read_fault(addr, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{self, FakeMemory};

    #[test]
    fn test_resolve_synthetic_layout() {
        let layout = fake::layout();
        assert_eq!(layout.tso_what_next, FieldLayout { offset: 32, size: 2 });
        assert_eq!(layout.cap_current_tso.offset, 16);
        assert_eq!(layout.ret_fun_header_words, 3);
        assert_eq!(layout.ret_info_size, 16);
        assert_eq!(layout.gen_size, 32);
    }

    #[test]
    fn test_missing_struct_is_reported() {
        let mut types = fake::type_layouts();
        let mut reduced = TypeLayouts::new();
        for name in TYPE_NAMES {
            if let Some(l) = types.get(name) {
                if l.name != "StgRetFun" {
                    reduced.insert(l.clone());
                }
            }
        }
        types = reduced;
        let err = RtsLayout::resolve(&types).unwrap_err();
        assert!(matches!(err, RtsError::MissingLayout(ref s) if s == "StgRetFun"));
    }

    #[test]
    fn test_missing_member_is_reported() {
        let mut types = fake::type_layouts();
        types.insert(StructLayout::new("generation", 32));
        let err = RtsLayout::resolve(&types).unwrap_err();
        assert_eq!(
            err.to_string(),
            "RTS type information missing: generation.threads (build the program with -g or link the debug RTS)"
        );
    }

    #[test]
    fn test_typedef_tag_name_fallback() {
        let types = fake::type_layouts();
        let mut tagged = TypeLayouts::new();
        for name in TYPE_NAMES {
            if let Some(l) = types.get(name) {
                let mut l = l.clone();
                if l.name == "StgTSO" {
                    l.name = "StgTSO_".to_string();
                }
                tagged.insert(l);
            }
        }
        assert!(tagged.get("StgTSO").is_none());
        assert_eq!(RtsLayout::resolve(&tagged).unwrap(), fake::layout());
    }

    #[test]
    fn test_read_field_widths() {
        let mut mem = FakeMemory::new();
        mem.write_u64(0x1000, 0xdead_beef_0000_0001);
        mem.write_u16(0x1010, 7);

        let word = FieldLayout { offset: 0, size: 8 };
        let half = FieldLayout { offset: 0x10, size: 2 };
        assert_eq!(read_field(&mem, 0x1000, word).unwrap(), 0xdead_beef_0000_0001);
        assert_eq!(read_field(&mem, 0x1000, half).unwrap(), 7);

        let err = read_field(&mem, 0x9000, word).unwrap_err();
        assert!(matches!(err, RtsError::ReadFault { addr: 0x9000, .. }));
    }
}
