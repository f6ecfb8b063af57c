//! DWARF構造体レイアウトの抽出
//!
//! RTSの構造体（StgTSO, Capability など）のメンバオフセットとサイズを
//! DWARFの構造体・共用体・typedef定義から取り出します。
//! メンバは`r.rCurrentTSO`のようなドット区切りのパスで平坦化して保持します。

use crate::{DwarfReader, Result};
use gimli::Reader;
use std::collections::{BTreeMap, HashMap};

/// メンバ展開の最大深さ
const MAX_MEMBER_DEPTH: usize = 4;

/// メンバのオフセットとサイズ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLayout {
    /// 構造体先頭からのオフセット（バイト）
    pub offset: u64,
    /// サイズ（バイト）。可変長配列などサイズ不明の場合は0
    pub size: u64,
}

/// 構造体のレイアウト
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructLayout {
    pub name: String,
    pub size: u64,
    fields: BTreeMap<String, FieldLayout>,
}

impl StructLayout {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            fields: BTreeMap::new(),
        }
    }

    /// メンバを追加する（テストや手動定義用）
    pub fn with_field(mut self, path: impl Into<String>, offset: u64, size: u64) -> Self {
        self.fields.insert(path.into(), FieldLayout { offset, size });
        self
    }

    /// パスでメンバを検索する
    pub fn field(&self, path: &str) -> Option<FieldLayout> {
        self.fields.get(path).copied()
    }
}

/// 名前で引ける構造体レイアウトの集合
#[derive(Debug, Clone, Default)]
pub struct TypeLayouts {
    layouts: HashMap<String, StructLayout>,
}

impl TypeLayouts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, layout: StructLayout) {
        self.layouts.insert(layout.name.clone(), layout);
    }

    pub fn get(&self, name: &str) -> Option<&StructLayout> {
        self.layouts.get(name)
    }

    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    /// 指定した型名（構造体タグ名またはtypedef名）のレイアウトをDWARFから抽出する
    ///
    /// 最初に見つかった完全な定義を採用する。見つからない名前は結果に含まれない。
    pub fn extract(dwarf: &gimli::Dwarf<DwarfReader>, names: &[&str]) -> Result<Self> {
        let mut layouts = Self::new();

        let mut iter = dwarf.units();
        while let Some(header) = iter.next()? {
            if layouts.len() == names.len() {
                break;
            }
            let unit = dwarf.unit(header)?;
            let extractor = LayoutExtractor { dwarf, unit: &unit };

            let mut entries = unit.entries();
            while let Some((_, entry)) = entries.next_dfs()? {
                if !matches!(
                    entry.tag(),
                    gimli::DW_TAG_structure_type | gimli::DW_TAG_union_type | gimli::DW_TAG_typedef
                ) {
                    continue;
                }
                let Some(name) = extractor.name(entry) else {
                    continue;
                };
                if !names.contains(&name.as_str()) || layouts.get(&name).is_some() {
                    continue;
                }
                if let Some(layout) = extractor.struct_layout(&name, entry.offset())? {
                    tracing::debug!("extracted layout of '{}' ({} bytes)", name, layout.size);
                    layouts.insert(layout);
                }
            }
        }

        Ok(layouts)
    }
}

/// 1つのコンパイルユニット内でのレイアウト抽出器
struct LayoutExtractor<'a, R: Reader> {
    dwarf: &'a gimli::Dwarf<R>,
    unit: &'a gimli::Unit<R>,
}

impl<'a, R: Reader<Offset = usize>> LayoutExtractor<'a, R> {
    /// typedefや修飾子を剥がした型DIEのオフセットを返す
    fn strip_type(&self, mut offset: gimli::UnitOffset<usize>) -> Result<gimli::UnitOffset<usize>> {
        for _ in 0..16 {
            let entry = self.unit.entry(offset)?;
            match entry.tag() {
                gimli::DW_TAG_typedef | gimli::DW_TAG_const_type | gimli::DW_TAG_volatile_type => {
                    match self.type_ref(&entry) {
                        Some(next) => offset = next,
                        None => return Ok(offset),
                    }
                }
                _ => return Ok(offset),
            }
        }
        Ok(offset)
    }

    /// 構造体（またはtypedef先の構造体）のレイアウトを抽出する
    fn struct_layout(
        &self,
        name: &str,
        offset: gimli::UnitOffset<usize>,
    ) -> Result<Option<StructLayout>> {
        let offset = self.strip_type(offset)?;
        let entry = self.unit.entry(offset)?;

        if !matches!(entry.tag(), gimli::DW_TAG_structure_type | gimli::DW_TAG_union_type) {
            return Ok(None);
        }
        // 前方宣言は無視する
        if let Ok(Some(gimli::AttributeValue::Flag(true))) = entry.attr_value(gimli::DW_AT_declaration) {
            return Ok(None);
        }

        let size = self.byte_size(&entry).unwrap_or(0);
        let mut layout = StructLayout::new(name, size);
        self.collect_members(offset, "", 0, 0, &mut layout)?;
        Ok(Some(layout))
    }

    /// メンバを再帰的に平坦化して収集する
    fn collect_members(
        &self,
        parent: gimli::UnitOffset<usize>,
        prefix: &str,
        base: u64,
        depth: usize,
        layout: &mut StructLayout,
    ) -> Result<()> {
        if depth >= MAX_MEMBER_DEPTH {
            return Ok(());
        }

        let mut tree = self.unit.entries_tree(Some(parent))?;
        let root = tree.root()?;
        let mut children = root.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            if entry.tag() != gimli::DW_TAG_member {
                continue;
            }

            let offset = base + self.data_member_location(entry).unwrap_or(0);
            let member_type = match self.type_ref(entry) {
                Some(t) => Some(self.strip_type(t)?),
                None => None,
            };
            let size = match member_type {
                Some(t) => self.byte_size(&self.unit.entry(t)?).unwrap_or(0),
                None => 0,
            };

            // 無名の構造体・共用体メンバは親のパスに展開する
            let path = match self.name(entry) {
                Some(name) if prefix.is_empty() => name,
                Some(name) => format!("{}.{}", prefix, name),
                None => prefix.to_string(),
            };

            if !path.is_empty() {
                layout.fields.insert(path.clone(), FieldLayout { offset, size });
            }

            if let Some(t) = member_type {
                let tag = self.unit.entry(t)?.tag();
                if matches!(tag, gimli::DW_TAG_structure_type | gimli::DW_TAG_union_type) {
                    self.collect_members(t, &path, offset, depth + 1, layout)?;
                }
            }
        }

        Ok(())
    }

    /// 名前を取得する
    fn name(&self, entry: &gimli::DebuggingInformationEntry<R>) -> Option<String> {
        let attr = entry.attr_value(gimli::DW_AT_name).ok()??;
        let s = self.dwarf.attr_string(self.unit, attr).ok()?;
        s.to_string_lossy().ok().map(|s| s.into_owned())
    }

    /// バイトサイズを取得する
    fn byte_size(&self, entry: &gimli::DebuggingInformationEntry<R>) -> Option<u64> {
        if entry.tag() == gimli::DW_TAG_pointer_type && entry.attr_value(gimli::DW_AT_byte_size).ok()?.is_none() {
            return Some(8);
        }
        entry.attr_value(gimli::DW_AT_byte_size).ok()??.udata_value()
    }

    /// 型参照を取得する
    fn type_ref(&self, entry: &gimli::DebuggingInformationEntry<R>) -> Option<gimli::UnitOffset<usize>> {
        match entry.attr_value(gimli::DW_AT_type).ok()?? {
            gimli::AttributeValue::UnitRef(offset) => Some(offset),
            _ => None,
        }
    }

    /// データメンバのロケーション（オフセット）を取得する
    fn data_member_location(&self, entry: &gimli::DebuggingInformationEntry<R>) -> Option<u64> {
        entry
            .attr_value(gimli::DW_AT_data_member_location)
            .ok()??
            .udata_value()
    }
}
