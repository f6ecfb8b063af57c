//! スレッドとスタックの表示
//!
//! 一覧表示（`info tsos`）とフレームグラフ集計用のプロファイル行
//! （`info tsoprofile`）の2つの形式を出力します。
//! 1つのスレッドで失敗しても、その場でエラーを表示して次のスレッドに進みます。

use hsscope_dwarf::DebugInfoSource;
use hsscope_rts::{
    Frame, FunctionName, NameCache, NameResolver, NameStyle, RtsLayout, StackWalker, ThreadHandle,
    WalkConfig, UNKNOWN_NAME,
};
use hsscope_target::MemoryReader;
use std::io::{self, Write};

/// プロファイル行の接頭辞
pub const PROFILE_TAG: &str = "PROFILE";

/// 一覧表示のオプション
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// 実行中のスレッドのみ（`-r`）
    pub running_only: bool,
    /// 1フレーム1行で表示する（`-c`）
    pub compact: bool,
}

/// プロファイル行のオプション
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfileOptions {
    /// 不明な関数とRTS内部の関数も含める（`-v`）
    pub verbose: bool,
    /// 連続する同じ名前を1つにまとめる（`-u`）
    pub unique: bool,
}

/// 葉から根の順の関数名からプロファイル行を作る
///
/// # Examples
/// ```
/// use hsscope_core::trace::{profile_line, ProfileOptions};
///
/// let names = ["A", "B", "A", "A"];
/// let unique = ProfileOptions { verbose: false, unique: true };
/// assert_eq!(profile_line(names, unique), "PROFILE;A;B;A");
/// assert_eq!(profile_line(names, ProfileOptions::default()), "PROFILE;A;A;B;A");
/// ```
pub fn profile_line<I, S>(names: I, options: ProfileOptions) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut stack: Vec<String> = Vec::new();
    for name in names {
        let name = name.as_ref();
        if !options.verbose && (name == UNKNOWN_NAME || name.starts_with("stg_")) {
            continue;
        }
        if options.unique && stack.last().map(String::as_str) == Some(name) {
            continue;
        }
        stack.push(name.to_string());
    }
    stack.reverse();

    let mut line = String::from(PROFILE_TAG);
    for name in &stack {
        line.push(';');
        line.push_str(name);
    }
    line
}

/// スタックトレースの出力
pub struct TraceFormatter<'a, M: MemoryReader, D: DebugInfoSource> {
    mem: &'a M,
    layout: &'a RtsLayout,
    resolver: &'a NameResolver<D>,
    walk: WalkConfig,
}

impl<'a, M: MemoryReader, D: DebugInfoSource> TraceFormatter<'a, M, D> {
    pub fn new(mem: &'a M, layout: &'a RtsLayout, resolver: &'a NameResolver<D>, walk: WalkConfig) -> Self {
        Self {
            mem,
            layout,
            resolver,
            walk,
        }
    }

    fn walker(&self, thread: &ThreadHandle) -> hsscope_rts::Result<StackWalker<'a, M>> {
        StackWalker::new(self.mem, self.layout, thread, self.walk)
    }

    /// スレッドごとにスタックを一覧表示する
    pub fn write_listing<W, I>(&self, out: &mut W, threads: I, options: ListOptions) -> io::Result<()>
    where
        W: Write,
        I: IntoIterator<Item = hsscope_rts::Result<ThreadHandle>>,
    {
        for thread in threads {
            let thread = match thread {
                Ok(thread) => thread,
                Err(e) => {
                    writeln!(out, "error: {}", e)?;
                    continue;
                }
            };
            if options.running_only && !thread.is_running() {
                continue;
            }

            writeln!(out, "TSO {} ({})", thread.id, thread.status())?;
            match self.walker(&thread) {
                Ok(walker) => {
                    for frame in walker {
                        match frame {
                            Ok(frame) => self.write_frame(out, &frame, options.compact)?,
                            Err(e) => writeln!(out, "  error: {}", e)?,
                        }
                    }
                }
                Err(e) => writeln!(out, "  error: {}", e)?,
            }
            writeln!(out)?;
        }
        Ok(())
    }

    fn write_frame<W: Write>(&self, out: &mut W, frame: &Frame, compact: bool) -> io::Result<()> {
        let pc = frame.pc;
        let line = self.resolver.debug().line_at(pc);

        if compact {
            let func = self.resolver.resolve(pc, NameStyle::Pretty);
            match line {
                Some(hsscope_dwarf::LineInfo {
                    file: Some(file),
                    line,
                    ..
                }) => writeln!(out, "  0x{:016x} in {} at {}:{}", pc, func, file, line),
                _ => writeln!(out, "  0x{:016x} in {}", pc, func),
            }
        } else {
            let func = self.resolver.resolve(pc, NameStyle::Clean);
            writeln!(out, "  {} (0x{:x}, type {})", func, pc, frame.kind())?;
            match line {
                Some(line) => writeln!(out, "    {}", line),
                None => writeln!(out, "    0x{:x}", pc),
            }
        }
    }

    /// 実行中のスレッドごとにプロファイル行を出力する
    pub fn write_profile<W, I>(
        &self,
        out: &mut W,
        threads: I,
        options: ProfileOptions,
        cache: &mut NameCache,
    ) -> io::Result<()>
    where
        W: Write,
        I: IntoIterator<Item = hsscope_rts::Result<ThreadHandle>>,
    {
        for thread in threads {
            match thread.and_then(|t| self.sample(&t, cache)) {
                Ok(names) => writeln!(out, "{}", profile_line(&names, options))?,
                Err(e) => writeln!(out, "error: {}", e)?,
            }
        }
        Ok(())
    }

    /// スタックの関数名を葉から根の順に集める
    fn sample(&self, thread: &ThreadHandle, cache: &mut NameCache) -> hsscope_rts::Result<Vec<String>> {
        let mut names = Vec::new();
        for frame in self.walker(thread)? {
            let frame = frame?;
            let name: &FunctionName = cache.resolve(self.resolver, frame.pc);
            names.push(name.to_string());
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hsscope_rts::fake::{FakeImage, FrameSpec};
    use hsscope_rts::{RegistryConfig, RtsRoots, ThreadRegistry};

    const VERBOSE_UNIQUE: ProfileOptions = ProfileOptions {
        verbose: true,
        unique: true,
    };

    #[test]
    fn test_profile_line_collapses_only_adjacent() {
        let leaf_to_root = ["A", "B", "A", "A"];
        assert_eq!(profile_line(leaf_to_root, VERBOSE_UNIQUE), "PROFILE;A;B;A");
        assert_eq!(
            profile_line(leaf_to_root, ProfileOptions::default()),
            "PROFILE;A;A;B;A"
        );
    }

    #[test]
    fn test_profile_line_order_and_filter() {
        let leaf_to_root = ["leaf", "??", "stg_upd_frame", "mid", "root:??", "stg_stop_thread"];
        assert_eq!(
            profile_line(leaf_to_root, ProfileOptions::default()),
            "PROFILE;root:??;mid;leaf"
        );
        assert_eq!(
            profile_line(leaf_to_root, ProfileOptions { verbose: true, unique: false }),
            "PROFILE;stg_stop_thread;root:??;mid;stg_upd_frame;??;leaf"
        );
    }

    #[test]
    fn test_profile_line_unique_ignores_skipped_frames() {
        // 内部フレームを飛ばした結果として隣り合う同名フレームもまとめる
        let leaf_to_root = ["A", "stg_ap_v", "A", "B"];
        let unique = ProfileOptions {
            verbose: false,
            unique: true,
        };
        assert_eq!(profile_line(leaf_to_root, unique), "PROFILE;B;A");
        assert_eq!(profile_line(Vec::<String>::new(), unique), "PROFILE");
    }

    /// 3スレッドのイメージ。2番目のスレッドのスタックには大きいビットマップのフレームがある
    fn three_threads() -> (FakeImage, [u64; 3], [u64; 3]) {
        let mut image = FakeImage::new();
        let main = image.code("Main_main_info", 30, 0x01);
        let go = image.code("Main_zdwgo_info", 30, 0x00);
        let big = image.code("Main_big_info", 31, 0x00);
        let stop = image.code("stg_stop_thread_info", 36, 0x00);
        image.debug.add_line(go, go + 16, Some("src/Main.hs"), 12);

        let t1 = image.thread(1, &[FrameSpec::new(go), FrameSpec::new(main), FrameSpec::new(stop)]);
        let t2 = image.thread(2, &[FrameSpec::new(go), FrameSpec::new(big), FrameSpec::new(stop)]);
        let t3 = image.thread(3, &[FrameSpec::new(stop)]);
        image.set_status(t3, 1, 1);
        image.capability(&[t1, t2]);
        image.generation(&[t3]);
        (image, [main, go, stop], [t1, t2, t3])
    }

    fn listing(image: &FakeImage, options: ListOptions) -> String {
        let resolver = NameResolver::new(&image.debug).unwrap();
        let formatter = TraceFormatter::new(&image.mem, &image.layout, &resolver, WalkConfig::default());
        let roots = RtsRoots::locate(&image.mem, &image.debug, &image.layout).unwrap();
        let registry = ThreadRegistry::new(&image.mem, &image.layout, roots, RegistryConfig::default());

        let mut out = Vec::new();
        formatter
            .write_listing(&mut out, registry.all_threads(), options)
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    fn profile(image: &FakeImage, options: ProfileOptions, cache: &mut NameCache) -> String {
        let resolver = NameResolver::new(&image.debug).unwrap();
        let formatter = TraceFormatter::new(&image.mem, &image.layout, &resolver, WalkConfig::default());
        let roots = RtsRoots::locate(&image.mem, &image.debug, &image.layout).unwrap();
        let registry = ThreadRegistry::new(&image.mem, &image.layout, roots, RegistryConfig::default());

        let mut out = Vec::new();
        formatter
            .write_profile(&mut out, registry.running_threads(), options, cache)
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_listing_isolates_failing_thread() {
        let (image, [main, go, stop], [_, t2, _]) = three_threads();
        let t2_sp = image.handle(t2).stack_region(&image.mem, &image.layout).unwrap().sp;
        let big_frame = t2_sp + 8;

        let expected = format!(
            "TSO 1 (not blocked)\n\
             \x20 Main_$wgo (0x{go:x}, type small)\n\
             \x20   src/Main.hs:12\n\
             \x20 Main_main (0x{main:x}, type small)\n\
             \x20   0x{main:x}\n\
             \x20 stg_stop_thread (0x{stop:x}, type stop)\n\
             \x20   0x{stop:x}\n\
             \n\
             TSO 2 (not blocked)\n\
             \x20 Main_$wgo (0x{go:x}, type small)\n\
             \x20   src/Main.hs:12\n\
             \x20 error: unsupported frame kind 31 at 0x{big_frame:x}\n\
             \n\
             TSO 3 (waiting for MVar)\n\
             \x20 stg_stop_thread (0x{stop:x}, type stop)\n\
             \x20   0x{stop:x}\n\
             \n",
        );
        assert_eq!(listing(&image, ListOptions::default()), expected);
    }

    #[test]
    fn test_compact_listing_running_only() {
        let (image, [main, go, stop], _) = three_threads();
        let out = listing(
            &image,
            ListOptions {
                running_only: true,
                compact: true,
            },
        );

        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "TSO 1 (not blocked)");
        assert_eq!(lines[1], format!("  0x{:016x} in Main_$wgo at src/Main.hs:12", go));
        assert_eq!(lines[2], format!("  0x{:016x} in Main_main", main));
        assert_eq!(lines[3], format!("  0x{:016x} in stg_stop_thread", stop));
        assert_eq!(lines[4], "");
        assert_eq!(lines[5], "TSO 2 (not blocked)");
        assert!(!out.contains("TSO 3"));
    }

    #[test]
    fn test_read_fault_mid_walk_stays_in_thread() {
        let mut image = FakeImage::new();
        let go = image.code("Main_zdwgo_info", 30, 0x00);
        let stop = image.code("stg_stop_thread_info", 36, 0x00);
        let unmapped = 0xdead_0010;

        let t1 = image.thread(1, &[FrameSpec::new(go), FrameSpec::new(stop)]);
        let t2 = image.thread(
            2,
            &[FrameSpec::new(go), FrameSpec::new(unmapped), FrameSpec::new(stop)],
        );
        let t3 = image.thread(3, &[FrameSpec::new(go), FrameSpec::new(stop)]);
        image.capability(&[t1, t2, t3]);

        let descriptor = unmapped - image.layout.ret_info_size + image.layout.info_type.offset;
        let full = |id: u64| {
            format!(
                "TSO {id} (not blocked)\n\
                 \x20 Main_$wgo (0x{go:x}, type small)\n\
                 \x20   0x{go:x}\n\
                 \x20 stg_stop_thread (0x{stop:x}, type stop)\n\
                 \x20   0x{stop:x}\n\
                 \n"
            )
        };
        let expected = format!(
            "{}\
             TSO 2 (not blocked)\n\
             \x20 Main_$wgo (0x{go:x}, type small)\n\
             \x20   0x{go:x}\n\
             \x20 error: Cannot access memory at address 0x{descriptor:x}\n\
             \n\
             {}",
            full(1),
            full(3),
        );
        assert_eq!(listing(&image, ListOptions::default()), expected);
    }

    #[test]
    fn test_listing_reports_enumeration_error_and_continues() {
        let (mut image, _, [t1, _, _]) = three_threads();
        image.set_link(t1, 0xdead_0000);

        let out = listing(&image, ListOptions::default());
        assert!(out.starts_with("TSO 1 (not blocked)\n"));
        assert!(out.contains("\nerror: Cannot access memory at address 0xdead"));
        assert!(out.contains("TSO 3 (waiting for MVar)"));
        assert!(!out.contains("TSO 2"));
    }

    #[test]
    fn test_profile_of_running_threads() {
        let mut image = FakeImage::new();
        let a = image.code("mylibzm1zi0zmabc_LibziCore_step_info", 30, 0x00);
        let b = image.code("mylibzm1zi0zmabc_LibziCore_loop_info", 30, 0x00);
        let upd = image.code("stg_upd_frame_info", 33, 0x01);
        let stop = image.code("stg_stop_thread_info", 36, 0x00);
        let big = image.code("Main_big_info", 31, 0x00);

        let frames = [a, a, upd, b, a, stop].map(FrameSpec::new);
        let t1 = image.thread(1, &frames);
        let t2 = image.thread(2, &[FrameSpec::new(big)]);
        let c0 = image.capability(&[t1]);
        let c1 = image.capability(&[t2]);
        image.capability(&[]);
        image.set_current(c0, t1);
        image.set_current(c1, t2);

        let mut cache = NameCache::new();
        let unique = ProfileOptions {
            verbose: false,
            unique: true,
        };
        let out = profile(&image, unique, &mut cache);
        let lines: Vec<&str> = out.lines().collect();

        assert_eq!(
            lines[0],
            "PROFILE;mylib:Lib.Core_step;mylib:Lib.Core_loop;mylib:Lib.Core_step"
        );
        assert!(lines[1].starts_with("error: unsupported frame kind 31"));
        assert_eq!(lines.len(), 2);
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn test_unknown_frames_in_profile() {
        let mut image = FakeImage::new();
        let a = image.code("Main_a_info", 30, 0x00);
        // `_info`を含まないシンボルは名前に使わない
        let anon = image.code("anon_code", 30, 0x00);
        let t1 = image.thread(1, &[FrameSpec::new(anon), FrameSpec::new(a)]);
        let c0 = image.capability(&[t1]);
        image.set_current(c0, t1);

        let verbose = profile(&image, VERBOSE_UNIQUE, &mut NameCache::new());
        assert_eq!(verbose, "PROFILE;Main_a;??\n");
        let quiet = profile(&image, ProfileOptions::default(), &mut NameCache::new());
        assert_eq!(quiet, "PROFILE;Main_a\n");
    }
}
