//! 字句スコープ（DWARFブロック）の索引
//!
//! DW_TAG_subprogram / DW_TAG_inlined_subroutine / DW_TAG_lexical_block を
//! 入れ子構造のまま索引化し、PCから最内側スコープとその祖先を引けるようにします。
//! 名前を持つのは関数スコープ（subprogramとinlined_subroutine）のみで、
//! lexical_blockは常に無名として扱います。

use crate::{DwarfReader, Result};
use gimli::Reader;

/// PC検索の結果として返すスコープ情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeInfo {
    /// 関数スコープの名前（リンケージ名を優先）
    pub name: Option<String>,
    /// スコープの開始アドレス
    pub low_pc: u64,
}

#[derive(Debug)]
struct Scope {
    ranges: Vec<(u64, u64)>,
    name: Option<String>,
    children: Vec<usize>,
}

impl Scope {
    fn contains(&self, pc: u64) -> bool {
        self.ranges.iter().any(|&(start, end)| pc >= start && pc < end)
    }

    fn low_pc(&self) -> u64 {
        self.ranges.iter().map(|&(start, _)| start).min().unwrap_or(0)
    }
}

/// スコープ索引
#[derive(Debug, Default)]
pub struct ScopeIndex {
    scopes: Vec<Scope>,
    /// 最上位スコープの (開始, 終了, インデックス)。開始アドレス順
    roots: Vec<(u64, u64, usize)>,
}

impl ScopeIndex {
    /// 全コンパイルユニットを走査して索引を構築する
    pub fn build(dwarf: &gimli::Dwarf<DwarfReader>) -> Result<Self> {
        let mut index = Self::default();

        let mut iter = dwarf.units();
        while let Some(header) = iter.next()? {
            let unit = dwarf.unit(header)?;
            let mut tree = unit.entries_tree(None)?;
            let root = tree.root()?;
            index.walk(dwarf, &unit, root, None)?;
        }

        index.roots.sort_by_key(|&(start, _, _)| start);
        tracing::debug!(
            "indexed {} scopes ({} top-level ranges)",
            index.scopes.len(),
            index.roots.len()
        );
        Ok(index)
    }

    /// DIEツリーを再帰的に走査する
    ///
    /// スコープでないDIE（namespaceなど）は透過的に扱い、親スコープを引き継ぐ。
    fn walk<R: Reader<Offset = usize>>(
        &mut self,
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        node: gimli::EntriesTreeNode<R>,
        parent: Option<usize>,
    ) -> Result<()> {
        let mut children = node.children();
        while let Some(child) = children.next()? {
            let entry = child.entry();
            let tag = entry.tag();

            let is_scope = matches!(
                tag,
                gimli::DW_TAG_subprogram | gimli::DW_TAG_inlined_subroutine | gimli::DW_TAG_lexical_block
            );
            if !is_scope {
                self.walk(dwarf, unit, child, parent)?;
                continue;
            }

            let ranges = Self::entry_ranges(dwarf, unit, entry)?;
            if ranges.is_empty() {
                // 宣言や抽象インスタンスは具体的なコードを持たない
                continue;
            }

            let name = if tag == gimli::DW_TAG_lexical_block {
                None
            } else {
                Self::function_name(dwarf, unit, entry)
            };

            let idx = self.scopes.len();
            match parent {
                Some(p) => self.scopes[p].children.push(idx),
                None => {
                    for &(start, end) in &ranges {
                        self.roots.push((start, end, idx));
                    }
                }
            }
            self.scopes.push(Scope {
                ranges,
                name,
                children: Vec::new(),
            });

            self.walk(dwarf, unit, child, Some(idx))?;
        }
        Ok(())
    }

    /// DIEのアドレス範囲を取得する（low_pc/high_pc と DW_AT_ranges の両方に対応）
    fn entry_ranges<R: Reader<Offset = usize>>(
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Result<Vec<(u64, u64)>> {
        let mut ranges = Vec::new();
        let mut iter = dwarf.die_ranges(unit, entry)?;
        while let Some(range) = iter.next()? {
            if range.begin < range.end {
                ranges.push((range.begin, range.end));
            }
        }
        Ok(ranges)
    }

    /// 関数スコープの名前を取得する
    ///
    /// DW_AT_linkage_name（またはDW_AT_MIPS_linkage_name）を優先し、
    /// なければDW_AT_name。DW_AT_abstract_origin / DW_AT_specification も辿る。
    fn function_name<R: Reader<Offset = usize>>(
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        entry: &gimli::DebuggingInformationEntry<R>,
    ) -> Option<String> {
        const NAME_ATTRS: [gimli::DwAt; 3] = [
            gimli::DW_AT_linkage_name,
            gimli::DW_AT_MIPS_linkage_name,
            gimli::DW_AT_name,
        ];

        for attr in NAME_ATTRS {
            if let Some(name) = Self::string_attr(dwarf, unit, entry, attr) {
                return Some(name);
            }
        }

        for attr in [gimli::DW_AT_abstract_origin, gimli::DW_AT_specification] {
            if let Ok(Some(gimli::AttributeValue::UnitRef(offset))) = entry.attr_value(attr) {
                if let Ok(origin) = unit.entry(offset) {
                    for name_attr in NAME_ATTRS {
                        if let Some(name) = Self::string_attr(dwarf, unit, &origin, name_attr) {
                            return Some(name);
                        }
                    }
                }
            }
        }
        None
    }

    fn string_attr<R: Reader<Offset = usize>>(
        dwarf: &gimli::Dwarf<R>,
        unit: &gimli::Unit<R>,
        entry: &gimli::DebuggingInformationEntry<R>,
        attr: gimli::DwAt,
    ) -> Option<String> {
        let value = entry.attr_value(attr).ok()??;
        let s = dwarf.attr_string(unit, value).ok()?;
        let s = s.to_string_lossy().ok()?;
        (!s.is_empty()).then(|| s.into_owned())
    }

    /// PCを含むスコープを内側から外側の順に返す
    ///
    /// PCを含むスコープがなければ空のVecを返す。
    pub fn scope_chain(&self, pc: u64) -> Vec<ScopeInfo> {
        let Some(root) = self.find_root(pc) else {
            return Vec::new();
        };

        let mut chain = vec![root];
        let mut current = root;
        while let Some(&child) = self.scopes[current]
            .children
            .iter()
            .find(|&&c| self.scopes[c].contains(pc))
        {
            chain.push(child);
            current = child;
        }

        chain
            .into_iter()
            .rev()
            .map(|idx| ScopeInfo {
                name: self.scopes[idx].name.clone(),
                low_pc: self.scopes[idx].low_pc(),
            })
            .collect()
    }

    fn find_root(&self, pc: u64) -> Option<usize> {
        let idx = self.roots.partition_point(|&(start, _, _)| start <= pc);
        self.roots[..idx]
            .iter()
            .rev()
            .find(|&&(start, end, _)| pc >= start && pc < end)
            .map(|&(_, _, scope)| scope)
    }

    /// 索引化されたスコープ数
    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}
