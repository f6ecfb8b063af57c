//! ソース行情報

use crate::{DwarfLoader, DwarfReader, Result};

/// ソース行情報
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineInfo {
    /// ソースファイル名（不明な場合はNone）
    pub file: Option<String>,
    pub line: u32,
    pub column: Option<u32>,
}

impl std::fmt::Display for LineInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.file.as_deref().unwrap_or("?"), self.line)
    }
}

/// 行番号テーブルの1行
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRow {
    pub address: u64,
    pub line: u32,
}

/// 行番号プログラムから取り出した生の行
#[derive(Debug, Clone, Copy)]
struct RawRow {
    address: u64,
    line: u32,
    file_index: u64,
    end_sequence: bool,
}

/// ソース行情報の取得
pub struct LineInfoProvider {
    context: addr2line::Context<DwarfReader>,
    dwarf: gimli::Dwarf<DwarfReader>,
}

impl LineInfoProvider {
    /// ソース行情報プロバイダを作成する
    pub fn new(loader: &DwarfLoader) -> Result<Self> {
        let context = addr2line::Context::from_dwarf(loader.load_dwarf()?)
            .map_err(|e| anyhow::anyhow!("Failed to build addr2line context: {}", e))?;
        Ok(Self {
            context,
            dwarf: loader.load_dwarf()?,
        })
    }

    /// アドレスからソース行情報を取得する
    pub fn lookup(&self, addr: u64) -> Result<Option<LineInfo>> {
        let location = self
            .context
            .find_location(addr)
            .map_err(|e| anyhow::anyhow!("Line lookup failed at 0x{:x}: {}", addr, e))?;

        Ok(location.and_then(|loc| {
            loc.line.map(|line| LineInfo {
                file: loc.file.map(str::to_string),
                line,
                column: loc.column,
            })
        }))
    }

    /// アドレスを含むコンパイルユニットの行番号テーブルを取得する
    ///
    /// アドレスに対応する行と同じソースファイルの行のみを返す。
    /// 見つからない場合は空のVecを返す。
    pub fn line_table(&self, addr: u64) -> Result<Vec<LineRow>> {
        let mut iter = self.dwarf.units();
        while let Some(header) = iter.next()? {
            let unit = self.dwarf.unit(header)?;
            if !self.unit_contains(&unit, addr)? {
                continue;
            }

            let Some(program) = unit.line_program.clone() else {
                return Ok(Vec::new());
            };

            let mut raw = Vec::new();
            let mut rows = program.rows();
            while let Some((_, row)) = rows.next_row()? {
                raw.push(RawRow {
                    address: row.address(),
                    line: row.line().map(|l| l.get() as u32).unwrap_or(0),
                    file_index: row.file_index(),
                    end_sequence: row.end_sequence(),
                });
            }

            return Ok(Self::rows_for_file_at(&raw, addr));
        }
        Ok(Vec::new())
    }

    fn unit_contains(&self, unit: &gimli::Unit<DwarfReader>, addr: u64) -> Result<bool> {
        let mut ranges = self.dwarf.unit_ranges(unit)?;
        while let Some(range) = ranges.next()? {
            if addr >= range.begin && addr < range.end {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// `addr`の行と同じファイルに属する行だけを抽出する
    fn rows_for_file_at(raw: &[RawRow], addr: u64) -> Vec<LineRow> {
        let file_index = raw.windows(2).find_map(|pair| {
            let (row, next) = (pair[0], pair[1]);
            (!row.end_sequence && row.address <= addr && addr < next.address)
                .then_some(row.file_index)
        });

        let Some(file_index) = file_index else {
            return Vec::new();
        };

        raw.iter()
            .filter(|r| !r.end_sequence && r.line > 0 && r.file_index == file_index)
            .map(|r| LineRow {
                address: r.address,
                line: r.line,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(address: u64, line: u32, file_index: u64, end_sequence: bool) -> RawRow {
        RawRow {
            address,
            line,
            file_index,
            end_sequence,
        }
    }

    #[test]
    fn test_rows_filtered_by_file_of_address() {
        let raw = vec![
            row(0x100, 10, 1, false),
            row(0x110, 12, 2, false),
            row(0x120, 14, 1, false),
            row(0x130, 0, 1, true),
        ];
        let rows = LineInfoProvider::rows_for_file_at(&raw, 0x124);
        assert_eq!(
            rows,
            vec![
                LineRow { address: 0x100, line: 10 },
                LineRow { address: 0x120, line: 14 },
            ]
        );
    }

    #[test]
    fn test_rows_outside_sequence() {
        let raw = vec![row(0x100, 10, 1, false), row(0x110, 0, 1, true)];
        assert!(LineInfoProvider::rows_for_file_at(&raw, 0x200).is_empty());
    }

    #[test]
    fn test_line_info_display() {
        let known = LineInfo {
            file: Some("src/Main.hs".to_string()),
            line: 42,
            column: None,
        };
        assert_eq!(known.to_string(), "src/Main.hs:42");
        let unknown = LineInfo {
            file: None,
            line: 7,
            column: None,
        };
        assert_eq!(unknown.to_string(), "?:7");
    }
}
