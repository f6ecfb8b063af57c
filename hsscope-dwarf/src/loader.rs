//! ELFとDWARFの読み込み機能

use crate::{DwarfReader, Result};
use object::{Object, ObjectSection};
use std::fs;
use std::path::Path;

/// DWARFローダー
pub struct DwarfLoader {
    /// オブジェクトファイル
    object_file: object::File<'static>,
    /// エンディアン
    endian: gimli::RunTimeEndian,
    /// DWARFコンテキスト
    dwarf: gimli::Dwarf<DwarfReader>,
}

impl DwarfLoader {
    /// ELFファイルからDWARF情報を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file_data = fs::read(path)
            .map_err(|e| anyhow::anyhow!("Failed to read file {:?}: {}", path, e))?;

        // 'staticライフタイムを得るため、バイナリはプロセス終了まで保持する
        let file_data: &'static [u8] = Box::leak(file_data.into_boxed_slice());

        let object_file = object::File::parse(file_data)
            .map_err(|e| anyhow::anyhow!("Failed to parse ELF file {:?}: {}", path, e))?;

        let endian = if object_file.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };

        let dwarf = Self::load_sections(&object_file, endian)?;

        Ok(Self {
            object_file,
            endian,
            dwarf,
        })
    }

    /// DWARFセクションを読み込んでコンテキストを構築する
    fn load_sections(
        object_file: &object::File<'static>,
        endian: gimli::RunTimeEndian,
    ) -> Result<gimli::Dwarf<DwarfReader>> {
        let load_section = |id: gimli::SectionId| -> Result<DwarfReader> {
            let data = object_file
                .section_by_name(id.name())
                .and_then(|section| section.data().ok())
                .unwrap_or(&[]);
            Ok(gimli::EndianSlice::new(data, endian))
        };

        gimli::Dwarf::load(load_section)
            .map_err(|e| anyhow::anyhow!("Failed to load DWARF sections: {}", e))
    }

    /// DWARFコンテキストへの参照を取得
    pub fn dwarf(&self) -> &gimli::Dwarf<DwarfReader> {
        &self.dwarf
    }

    /// 所有権付きのDWARFコンテキストを新たに構築する
    ///
    /// addr2lineのコンテキストはDWARFを所有する必要があるため、
    /// 同じセクションデータを参照する別インスタンスを作ります。
    pub fn load_dwarf(&self) -> Result<gimli::Dwarf<DwarfReader>> {
        Self::load_sections(&self.object_file, self.endian)
    }

    /// オブジェクトファイルへの参照を取得
    pub fn object_file(&self) -> &object::File<'static> {
        &self.object_file
    }

    /// DWARFデバッグ情報を含んでいるか
    pub fn has_debug_info(&self) -> bool {
        self.object_file.section_by_name(".debug_info").is_some()
    }

    /// PIE（Position Independent Executable）かどうかを判定する
    ///
    /// PIE実行ファイルの場合、シンボルアドレスはオフセットであり、
    /// 実行時ベースアドレスを加算する必要があります。
    pub fn is_pie(&self) -> bool {
        use object::ObjectKind;

        // ET_DYN = PIE実行ファイルまたは共有ライブラリ
        matches!(self.object_file.kind(), ObjectKind::Dynamic)
    }
}
