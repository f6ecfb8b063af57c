//! スレッドのスタック走査
//!
//! スタックポインタから領域の終端に向かって、フレームごとに記述子から
//! サイズを求めて進む。エラーはそのスレッドの走査だけを終わらせる。

use crate::frame::Frame;
use crate::layout::RtsLayout;
use crate::tso::{StackRegion, ThreadHandle};
use crate::{Result, RtsError};
use hsscope_target::MemoryReader;

/// 走査の設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkConfig {
    /// 1スレッドあたりの最大フレーム数
    pub max_frames: usize,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self { max_frames: 1_000_000 }
    }
}

/// スタック走査のカーソル
pub struct StackWalker<'a, M: MemoryReader> {
    mem: &'a M,
    layout: &'a RtsLayout,
    config: WalkConfig,
    /// 次に読むフレームのアドレス
    cursor: u64,
    top: u64,
    frames: usize,
    /// エラー後は何も返さない
    failed: bool,
}

impl<'a, M: MemoryReader> StackWalker<'a, M> {
    /// スレッドのスタックオブジェクトを読み、走査を開始する
    pub fn new(mem: &'a M, layout: &'a RtsLayout, thread: &ThreadHandle, config: WalkConfig) -> Result<Self> {
        let region = thread.stack_region(mem, layout)?;
        Ok(Self::from_region(mem, layout, region, config))
    }

    pub fn from_region(mem: &'a M, layout: &'a RtsLayout, region: StackRegion, config: WalkConfig) -> Self {
        tracing::debug!("walking stack 0x{:x} -> 0x{:x}", region.sp, region.top);
        Self {
            mem,
            layout,
            config,
            cursor: region.sp,
            top: region.top,
            frames: 0,
            failed: false,
        }
    }

    /// まだフレームが残っているか
    pub fn has_next(&self) -> bool {
        !self.failed && self.cursor < self.top
    }

    /// 次のフレームを読み、カーソルを進める
    ///
    /// 終端に達していれば`Ok(None)`。
    pub fn advance(&mut self) -> Result<Option<Frame>> {
        if !self.has_next() {
            return Ok(None);
        }
        match self.step() {
            Ok(frame) => Ok(Some(frame)),
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    fn step(&mut self) -> Result<Frame> {
        if self.frames >= self.config.max_frames {
            return Err(RtsError::TraversalDidNotTerminate {
                list: "stack",
                limit: self.config.max_frames,
            });
        }
        let frame = Frame::read(self.mem, self.layout, self.cursor)?;
        if frame.end_address().map_or(true, |end| end > self.top) {
            return Err(RtsError::FrameOverrunsStack {
                frame: frame.address,
                words: frame.size_words,
                top: self.top,
            });
        }
        self.cursor = frame.next_address();
        self.frames += 1;
        Ok(frame)
    }
}

impl<M: MemoryReader> Iterator for StackWalker<'_, M> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}

impl<M: MemoryReader> std::iter::FusedIterator for StackWalker<'_, M> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeImage, FrameSpec};

    #[test]
    fn test_walk_to_top() {
        let mut image = FakeImage::new();
        let a = image.code("Main_a_info", 30, 0x02);
        let b = image.code("Main_b_info", 30, 0x00);
        let stop = image.code("stg_stop_thread_info", 36, 0x00);
        let tso = image.thread(
            1,
            &[FrameSpec::new(a), FrameSpec::new(b), FrameSpec::new(stop)],
        );

        let handle = image.handle(tso);
        let walker = StackWalker::new(&image.mem, &image.layout, &handle, WalkConfig::default()).unwrap();
        let frames: Vec<Frame> = walker.collect::<Result<_>>().unwrap();

        assert_eq!(frames.iter().map(|f| f.pc).collect::<Vec<_>>(), vec![a, b, stop]);
        assert_eq!(frames[0].size_words, 3);
        assert_eq!(frames[1].address, frames[0].address + 24);
        assert_eq!(frames[2].address, frames[1].address + 8);
    }

    #[test]
    fn test_empty_stack() {
        let mut image = FakeImage::new();
        let tso = image.thread(1, &[]);
        let handle = image.handle(tso);
        let mut walker = StackWalker::new(&image.mem, &image.layout, &handle, WalkConfig::default()).unwrap();
        assert!(!walker.has_next());
        assert!(walker.advance().unwrap().is_none());
    }

    #[test]
    fn test_error_ends_walk() {
        let mut image = FakeImage::new();
        let a = image.code("Main_a_info", 30, 0x00);
        let big = image.code("Main_big_info", 31, 0x00);
        let tso = image.thread(1, &[FrameSpec::new(a), FrameSpec::new(big), FrameSpec::new(a)]);
        let handle = image.handle(tso);
        let mut walker = StackWalker::new(&image.mem, &image.layout, &handle, WalkConfig::default()).unwrap();

        assert_eq!(walker.advance().unwrap().map(|f| f.pc), Some(a));
        assert!(matches!(
            walker.advance(),
            Err(RtsError::UnsupportedFrameKind { kind: 31, .. })
        ));
        assert!(!walker.has_next());
        assert!(walker.next().is_none());
    }

    #[test]
    fn test_walk_over_fun_frame() {
        let mut image = FakeImage::new();
        let ap = image.code("stg_ap_pp_info", 32, 0x00);
        let stop = image.code("stg_stop_thread_info", 36, 0x00);
        let tso = image.thread(1, &[FrameSpec::fun(ap, 2), FrameSpec::new(stop)]);
        let handle = image.handle(tso);
        let frames: Vec<Frame> = StackWalker::new(&image.mem, &image.layout, &handle, WalkConfig::default())
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        let header = image.layout.ret_fun_header_words;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].size_words, header + 2);
        assert_eq!(frames[1].address, frames[0].address + (header + 2) * 8);
        assert_eq!(frames[1].pc, stop);
    }

    #[test]
    fn test_frame_past_stack_end() {
        let mut image = FakeImage::new();
        let ap = image.code("stg_ap_pp_info", 32, 0x00);
        let tso = image.thread(1, &[FrameSpec::fun(ap, 1)]);
        let handle = image.handle(tso);
        let region = handle.stack_region(&image.mem, &image.layout).unwrap();
        image
            .mem
            .write_u64(region.sp + image.layout.ret_fun_size.offset, 100);

        let mut walker = StackWalker::new(&image.mem, &image.layout, &handle, WalkConfig::default()).unwrap();
        assert!(matches!(
            walker.advance(),
            Err(RtsError::FrameOverrunsStack { frame, top, .. }) if frame == region.sp && top == region.top
        ));
        assert!(walker.next().is_none());

        // 加算が溢れるサイズはフレームの読み取りで弾く
        image.mem.write_u64(region.sp + image.layout.ret_fun_size.offset, u64::MAX);
        let mut walker = StackWalker::new(&image.mem, &image.layout, &handle, WalkConfig::default()).unwrap();
        assert!(matches!(walker.advance(), Err(RtsError::ImplausibleValue { .. })));
    }

    #[test]
    fn test_frame_cap() {
        let mut image = FakeImage::new();
        let a = image.code("Main_a_info", 30, 0x00);
        let tso = image.thread(1, &[FrameSpec::new(a); 5]);
        let handle = image.handle(tso);
        let config = WalkConfig { max_frames: 3 };
        let results: Vec<_> = StackWalker::new(&image.mem, &image.layout, &handle, config)
            .unwrap()
            .collect();

        assert_eq!(results.len(), 4);
        assert!(results[..3].iter().all(|r| r.is_ok()));
        assert!(matches!(
            results[3],
            Err(RtsError::TraversalDidNotTerminate { list: "stack", limit: 3 })
        ));
    }

    #[test]
    fn test_unreadable_stack_object() {
        let image = FakeImage::new();
        let handle = ThreadHandle {
            address: 0x10,
            id: 9,
            what_next: 1,
            why_blocked: 0,
            stack: 0xdead_0000,
            link: 0,
            global_link: 0,
        };
        let err = StackWalker::new(&image.mem, &image.layout, &handle, WalkConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, RtsError::ReadFault { .. }));
    }
}
