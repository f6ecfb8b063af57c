//! スレッド制御レコード（StgTSO）

use crate::layout::{read_field, RtsLayout, WORD_SIZE};
use crate::Result;
use hsscope_target::MemoryReader;
use std::fmt;

/// ブロック理由（rts/include/rts/Constants.h）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    NotBlocked,
    MVar,
    BlackHole,
    Read,
    Write,
    Delay,
    Stm,
    DoProc,
    CCall,
    CCallInterruptible,
    ThrowTo,
    Migrating,
    MVarRead,
    Other(u16),
}

impl BlockReason {
    pub fn from_code(code: u16) -> Self {
        match code {
            0 => Self::NotBlocked,
            1 => Self::MVar,
            2 => Self::BlackHole,
            3 => Self::Read,
            4 => Self::Write,
            5 => Self::Delay,
            6 => Self::Stm,
            7 => Self::DoProc,
            10 => Self::CCall,
            11 => Self::CCallInterruptible,
            12 => Self::ThrowTo,
            13 => Self::Migrating,
            14 => Self::MVarRead,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotBlocked => "not blocked",
            Self::MVar => "waiting for MVar",
            Self::BlackHole => "waiting for black hole",
            Self::Read => "waiting on read",
            Self::Write => "waiting on write",
            Self::Delay => "sleep",
            Self::Stm => "blocked on STM",
            Self::DoProc => "blocked on proc",
            Self::CCall => "blocked on ccall",
            Self::CCallInterruptible => "blocked on interruptible ccall",
            Self::ThrowTo => "throwto",
            Self::Migrating => "migrating",
            Self::MVarRead => "waiting for MVar read",
            Self::Other(code) => return write!(f, "status {}", code),
        };
        f.write_str(s)
    }
}

/// スレッドの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    NotStarted,
    /// 実行可能（ブロックされていれば理由を持つ）
    Live(BlockReason),
    Killed,
    Complete,
}

impl ThreadStatus {
    /// `what_next`と`why_blocked`から状態を決める
    pub fn from_raw(what_next: u16, why_blocked: u16) -> Self {
        match what_next {
            0 => Self::NotStarted,
            3 => Self::Killed,
            4 => Self::Complete,
            _ => Self::Live(BlockReason::from_code(why_blocked)),
        }
    }

    /// 実行中（終了しておらずブロックもされていない）か
    pub fn is_running(self) -> bool {
        matches!(self, Self::Live(BlockReason::NotBlocked))
    }
}

impl fmt::Display for ThreadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => f.write_str("not started"),
            Self::Live(reason) => reason.fmt(f),
            Self::Killed => f.write_str("killed"),
            Self::Complete => f.write_str("completed"),
        }
    }
}

/// スタックオブジェクトの範囲（ワード単位）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    /// 現在のスタックポインタ
    pub sp: u64,
    /// スタック領域の終端（この位置で走査を終える）
    pub top: u64,
}

/// スレッド制御レコードのスナップショット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadHandle {
    /// レコードのアドレス
    pub address: u64,
    pub id: u64,
    pub what_next: u16,
    pub why_blocked: u16,
    /// スタックオブジェクトのアドレス
    pub stack: u64,
    /// 実行キューのリンク
    pub link: u64,
    /// 世代のスレッドリストのリンク
    pub global_link: u64,
}

impl ThreadHandle {
    /// `address`にあるレコードを読み取る
    pub fn read<M: MemoryReader>(mem: &M, layout: &RtsLayout, address: u64) -> Result<Self> {
        Ok(Self {
            address,
            id: read_field(mem, address, layout.tso_id)?,
            what_next: read_field(mem, address, layout.tso_what_next)? as u16,
            why_blocked: read_field(mem, address, layout.tso_why_blocked)? as u16,
            stack: read_field(mem, address, layout.tso_stackobj)?,
            link: read_field(mem, address, layout.tso_link)?,
            global_link: read_field(mem, address, layout.tso_global_link)?,
        })
    }

    pub fn status(&self) -> ThreadStatus {
        ThreadStatus::from_raw(self.what_next, self.why_blocked)
    }

    pub fn is_running(&self) -> bool {
        self.status().is_running()
    }

    /// スタックオブジェクトから走査範囲を読み取る
    pub fn stack_region<M: MemoryReader>(&self, mem: &M, layout: &RtsLayout) -> Result<StackRegion> {
        let sp = read_field(mem, self.stack, layout.stack_sp)?;
        let size_words = read_field(mem, self.stack, layout.stack_size)?;
        let base = self.stack.wrapping_add(layout.stack_stack.offset);
        Ok(StackRegion {
            sp,
            top: base.saturating_add(size_words.saturating_mul(WORD_SIZE)),
        })
    }
}
