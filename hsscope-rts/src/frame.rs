//! スタックフレームと記述子
//!
//! フレームの先頭ワードは戻り先コードのアドレスで、その直前に
//! 戻り情報テーブル（StgRetInfoTable）が置かれている（tables-next-to-code）。
//! フレームのサイズは記述子の種別とレイアウトから計算する。

use crate::layout::{read_field, read_word, RtsLayout, WORD_SIZE};
use crate::{Result, RtsError};
use hsscope_target::MemoryReader;
use std::fmt;

/// 小さいビットマップのうちサイズを表す下位ビット（64bitのみ）
pub const SMALL_BITMAP_SIZE_MASK: u64 = 0x3f;

/// フレーム種別（rts/storage/ClosureTypes.h）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    Bytecode,
    Small,
    Big,
    Fun,
    Update,
    Catch,
    Underflow,
    Stop,
    Atomically,
    CatchRetry,
    CatchStm,
    Other(u32),
}

impl FrameKind {
    pub fn from_tag(tag: u32) -> Self {
        match tag {
            29 => Self::Bytecode,
            30 => Self::Small,
            31 => Self::Big,
            32 => Self::Fun,
            33 => Self::Update,
            34 => Self::Catch,
            35 => Self::Underflow,
            36 => Self::Stop,
            55 => Self::Atomically,
            56 => Self::CatchRetry,
            57 => Self::CatchStm,
            other => Self::Other(other),
        }
    }

    pub fn tag(self) -> u32 {
        match self {
            Self::Bytecode => 29,
            Self::Small => 30,
            Self::Big => 31,
            Self::Fun => 32,
            Self::Update => 33,
            Self::Catch => 34,
            Self::Underflow => 35,
            Self::Stop => 36,
            Self::Atomically => 55,
            Self::CatchRetry => 56,
            Self::CatchStm => 57,
            Self::Other(tag) => tag,
        }
    }

    /// 表示用ラベル（表にない種別はNone）
    pub fn label(self) -> Option<&'static str> {
        match self {
            Self::Bytecode => Some("bytecode"),
            Self::Small => Some("small"),
            Self::Update => Some("update"),
            Self::Catch => Some("catch"),
            Self::Underflow => Some("underflow"),
            Self::Stop => Some("stop"),
            Self::Atomically => Some("atomically"),
            _ => None,
        }
    }

    /// 小さいビットマップでサイズが決まる種別か
    fn has_small_layout(self) -> bool {
        matches!(
            self,
            Self::Small
                | Self::Update
                | Self::Catch
                | Self::Underflow
                | Self::Stop
                | Self::Atomically
                | Self::CatchRetry
                | Self::CatchStm
        )
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.label() {
            Some(label) => f.write_str(label),
            None => write!(f, "{}", self.tag()),
        }
    }
}

/// 小さいビットマップを持つフレームのワード数
///
/// 下位6bitがペイロードのワード数で、先頭の1ワード（戻り先アドレス）を加える。
/// 64bitのビットマップ形式でのみ正しい。
pub fn small_frame_size(bitmap: u64) -> u64 {
    1 + (bitmap & SMALL_BITMAP_SIZE_MASK)
}

/// フレーム記述子
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDescriptor {
    /// 記述子のアドレス
    pub address: u64,
    pub kind: FrameKind,
    pub bitmap: u64,
}

impl FrameDescriptor {
    /// 戻り先コードアドレスの直前にある記述子を読み取る
    pub fn read<M: MemoryReader>(mem: &M, layout: &RtsLayout, pc: u64) -> Result<Self> {
        let address = pc.wrapping_sub(layout.ret_info_size);
        let tag = read_field(mem, address, layout.info_type)?;
        let bitmap = read_field(mem, address, layout.info_bitmap)?;
        Ok(Self {
            address,
            kind: FrameKind::from_tag(tag as u32),
            bitmap,
        })
    }

    /// `frame`にあるフレームのワード数を計算する
    ///
    /// 関数適用フレームはフレーム本体の`size`メンバを読む。
    /// 大きいビットマップ・バイトコード・未知の種別は扱わない。
    pub fn frame_size<M: MemoryReader>(&self, mem: &M, layout: &RtsLayout, frame: u64) -> Result<u64> {
        match self.kind {
            FrameKind::Fun => {
                let extra = read_field(mem, frame, layout.ret_fun_size)?;
                layout
                    .ret_fun_header_words
                    .checked_add(extra)
                    .ok_or(RtsError::ImplausibleValue {
                        name: "StgRetFun.size",
                        value: extra,
                    })
            }
            kind if kind.has_small_layout() => Ok(small_frame_size(self.bitmap)),
            kind => Err(RtsError::UnsupportedFrameKind {
                frame,
                kind: kind.tag(),
            }),
        }
    }
}

/// スタック上の1フレーム
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// フレームの先頭アドレス
    pub address: u64,
    /// 戻り先コードアドレス
    pub pc: u64,
    pub descriptor: FrameDescriptor,
    /// ワード数（常に1以上）
    pub size_words: u64,
}

impl Frame {
    /// `address`にあるフレームを読み取る
    pub fn read<M: MemoryReader>(mem: &M, layout: &RtsLayout, address: u64) -> Result<Self> {
        let pc = read_word(mem, address)?;
        let descriptor = FrameDescriptor::read(mem, layout, pc)?;
        let size_words = descriptor.frame_size(mem, layout, address)?;
        if size_words == 0 {
            return Err(RtsError::ZeroSizedFrame(address));
        }
        Ok(Self {
            address,
            pc,
            descriptor,
            size_words,
        })
    }

    pub fn kind(&self) -> FrameKind {
        self.descriptor.kind
    }

    /// 次のフレームのアドレス
    pub fn next_address(&self) -> u64 {
        self.address
            .saturating_add(self.size_words.saturating_mul(WORD_SIZE))
    }

    /// フレームの終端アドレス（アドレス空間を越える場合は`None`）
    pub fn end_address(&self) -> Option<u64> {
        self.size_words
            .checked_mul(WORD_SIZE)
            .and_then(|bytes| self.address.checked_add(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{self, FakeMemory};

    #[test]
    fn test_small_frame_size() {
        assert_eq!(small_frame_size(0x05), 6);
        assert_eq!(small_frame_size(0x3f), 64);
        assert_eq!(small_frame_size(0x00), 1);
        // 上位ビット（ポインタビットマップ）は無視する
        assert_eq!(small_frame_size(0xffff_ffc5), 6);
        assert_eq!(small_frame_size(u64::MAX), 64);
    }

    #[test]
    fn test_kind_labels() {
        assert_eq!(FrameKind::from_tag(30).to_string(), "small");
        assert_eq!(FrameKind::from_tag(29).to_string(), "bytecode");
        assert_eq!(FrameKind::from_tag(55).to_string(), "atomically");
        assert_eq!(FrameKind::from_tag(32).to_string(), "32");
        assert_eq!(FrameKind::from_tag(99).to_string(), "99");
        for tag in [29, 30, 31, 32, 33, 34, 35, 36, 55, 56, 57, 7] {
            assert_eq!(FrameKind::from_tag(tag).tag(), tag);
        }
    }

    fn write_descriptor(mem: &mut FakeMemory, pc: u64, kind: u32, bitmap: u64) {
        let info = pc - 16;
        mem.write_u64(info, bitmap);
        mem.write_u32(info + 8, kind);
    }

    #[test]
    fn test_read_small_frame() {
        let layout = fake::layout();
        let mut mem = FakeMemory::new();
        write_descriptor(&mut mem, 0x4010, 30, 0x105);
        mem.write_u64(0x7000, 0x4010);

        let frame = Frame::read(&mem, &layout, 0x7000).unwrap();
        assert_eq!(frame.pc, 0x4010);
        assert_eq!(frame.kind(), FrameKind::Small);
        assert_eq!(frame.size_words, 6);
        assert_eq!(frame.next_address(), 0x7030);
    }

    #[test]
    fn test_read_fun_frame_uses_frame_size_field() {
        let layout = fake::layout();
        let mut mem = FakeMemory::new();
        write_descriptor(&mut mem, 0x4010, 32, 0x3f);
        mem.write_u64(0x7000, 0x4010);
        mem.write_u64(0x7008, 4);

        let frame = Frame::read(&mem, &layout, 0x7000).unwrap();
        assert_eq!(frame.size_words, 3 + 4);
    }

    #[test]
    fn test_unsupported_kinds() {
        let layout = fake::layout();
        for kind in [29, 31, 7, 200] {
            let mut mem = FakeMemory::new();
            write_descriptor(&mut mem, 0x4010, kind, 0x1);
            mem.write_u64(0x7000, 0x4010);
            let err = Frame::read(&mem, &layout, 0x7000).unwrap_err();
            assert!(
                matches!(err, RtsError::UnsupportedFrameKind { frame: 0x7000, kind: k } if k == kind),
                "kind {}",
                kind
            );
        }
    }

    #[test]
    fn test_zero_sized_fun_frame() {
        // ヘッダ3ワードは常にあるので、0になるのはレイアウトが壊れている場合のみ
        let mut layout = fake::layout();
        layout.ret_fun_header_words = 0;
        let mut mem = FakeMemory::new();
        write_descriptor(&mut mem, 0x4010, 32, 0);
        mem.write_u64(0x7000, 0x4010);
        mem.write_u64(0x7008, 0);

        let err = Frame::read(&mem, &layout, 0x7000).unwrap_err();
        assert!(matches!(err, RtsError::ZeroSizedFrame(0x7000)));
    }

    #[test]
    fn test_corrupt_fun_frame_size() {
        let layout = fake::layout();
        let mut mem = FakeMemory::new();
        write_descriptor(&mut mem, 0x4010, 32, 0);
        mem.write_u64(0x7000, 0x4010);
        mem.write_u64(0x7008, u64::MAX);

        let err = Frame::read(&mem, &layout, 0x7000).unwrap_err();
        assert!(matches!(
            err,
            RtsError::ImplausibleValue {
                name: "StgRetFun.size",
                value: u64::MAX
            }
        ));
    }

    #[test]
    fn test_unreadable_descriptor() {
        let layout = fake::layout();
        let mut mem = FakeMemory::new();
        mem.write_u64(0x7000, 0x4010);
        let err = Frame::read(&mem, &layout, 0x7000).unwrap_err();
        assert!(matches!(err, RtsError::ReadFault { addr: 0x4008, .. }));
    }
}
