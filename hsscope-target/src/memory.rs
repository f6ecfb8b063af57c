//! メモリアクセス機能

use crate::Result;
use nix::unistd::Pid;
use std::fs::File;
use std::io::{BufRead, BufReader, Read as _, Seek, SeekFrom};
use std::path::Path;

/// メモリから読み取り可能な型
pub trait MemoryReadable: Sized {
    /// バイト配列から値を構築
    fn from_le_bytes(bytes: &[u8]) -> Result<Self>;

    /// 型のサイズ（バイト数）
    fn size() -> usize;
}

macro_rules! impl_memory_readable {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl MemoryReadable for $ty {
                fn from_le_bytes(bytes: &[u8]) -> Result<Self> {
                    let array: [u8; std::mem::size_of::<$ty>()] = bytes.try_into().map_err(|_| {
                        anyhow::anyhow!(
                            "Failed to convert {} bytes to {} (expected {} bytes)",
                            bytes.len(),
                            stringify!($ty),
                            std::mem::size_of::<$ty>()
                        )
                    })?;
                    Ok(<$ty>::from_le_bytes(array))
                }

                fn size() -> usize {
                    std::mem::size_of::<$ty>()
                }
            }
        )+
    };
}

impl_memory_readable!(u8, u16, u32, u64);

/// 対象アドレス空間の読み取り手段
///
/// すべての解析コンポーネントはこのトレイト経由でのみ対象メモリを参照します。
/// 読み取りに失敗した場合（未マップ領域、プロセス消滅など）はエラーを返します。
pub trait MemoryReader {
    /// 指定アドレスから`size`バイトを読み取る
    fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>>;

    fn read_u8(&self, addr: u64) -> Result<u8> {
        let bytes = self.read(addr, <u8 as MemoryReadable>::size())?;
        <u8 as MemoryReadable>::from_le_bytes(&bytes)
    }

    fn read_u16(&self, addr: u64) -> Result<u16> {
        let bytes = self.read(addr, <u16 as MemoryReadable>::size())?;
        <u16 as MemoryReadable>::from_le_bytes(&bytes)
    }

    fn read_u32(&self, addr: u64) -> Result<u32> {
        let bytes = self.read(addr, <u32 as MemoryReadable>::size())?;
        <u32 as MemoryReadable>::from_le_bytes(&bytes)
    }

    fn read_u64(&self, addr: u64) -> Result<u64> {
        let bytes = self.read(addr, <u64 as MemoryReadable>::size())?;
        <u64 as MemoryReadable>::from_le_bytes(&bytes)
    }

    /// ポインタを読み取る（64bitのみ対応）
    fn read_ptr(&self, addr: u64) -> Result<u64> {
        self.read_u64(addr)
    }

    /// 1/2/4/8バイトの符号なし整数を読み取り、u64に拡張する
    fn read_uint(&self, addr: u64, size: u64) -> Result<u64> {
        match size {
            1 => self.read_u8(addr).map(u64::from),
            2 => self.read_u16(addr).map(u64::from),
            4 => self.read_u32(addr).map(u64::from),
            8 => self.read_u64(addr),
            _ => Err(anyhow::anyhow!(
                "Unsupported integer width {} at 0x{:x}",
                size,
                addr
            )),
        }
    }
}

impl<M: MemoryReader + ?Sized> MemoryReader for &M {
    fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        (**self).read(addr, size)
    }
}

/// メモリマッピング情報
#[derive(Debug, Clone)]
pub struct MemoryMapping {
    pub start: u64,
    pub end: u64,
    pub offset: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub pathname: Option<String>,
}

impl MemoryMapping {
    /// /proc/pid/maps の1行をパースする
    ///
    /// フォーマット: "address perms offset dev inode pathname"
    /// 例: "7f1234567000-7f1234568000 r-xp 00000000 08:01 123456 /lib/libc.so"
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 3 {
            return Ok(None);
        }

        let Some((start, end)) = parts[0].split_once('-') else {
            return Ok(None);
        };
        let start = u64::from_str_radix(start, 16)
            .map_err(|e| anyhow::anyhow!("Failed to parse start address: {}", e))?;
        let end = u64::from_str_radix(end, 16)
            .map_err(|e| anyhow::anyhow!("Failed to parse end address: {}", e))?;
        let offset = u64::from_str_radix(parts[2], 16)
            .map_err(|e| anyhow::anyhow!("Failed to parse segment offset: {}", e))?;

        let perms = parts[1].as_bytes();
        Ok(Some(Self {
            start,
            end,
            offset,
            readable: perms.first() == Some(&b'r'),
            writable: perms.get(1) == Some(&b'w'),
            executable: perms.get(2) == Some(&b'x'),
            pathname: parts.get(5).map(|s| s.to_string()),
        }))
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// 稼働中プロセスのメモリアクセス（読み取り専用）
pub struct Memory {
    pid: Pid,
}

impl Memory {
    /// メモリアクセスを作成する
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
        }
    }

    /// /proc/pid/mem のパスを取得する
    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.pid)
    }

    /// /proc/pid/mem経由でメモリを読み取る（内部実装）
    fn read_via_proc_mem(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        let mem_path = self.mem_path();
        let mut file = File::open(&mem_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", mem_path, e))?;

        file.seek(SeekFrom::Start(addr))?;

        let mut buffer = vec![0u8; size];
        file.read_exact(&mut buffer)?;

        Ok(buffer)
    }

    /// PTRACE_PEEKDATAを使用してメモリからデータを読み取る
    ///
    /// /proc/pid/memが使用できない場合のフォールバック。
    /// 小さなデータ読み取り（1-8バイト）に適しています。
    pub fn read_via_ptrace(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        use nix::sys::ptrace;

        let mut data = Vec::with_capacity(size);
        let word_size = std::mem::size_of::<usize>();

        // word単位で読み取り
        for offset in (0..size).step_by(word_size) {
            let word_addr = (addr + offset as u64) as *mut std::ffi::c_void;
            let word = ptrace::read(self.pid, word_addr).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to read via ptrace at 0x{:x}: {}",
                    addr + offset as u64,
                    e
                )
            })?;

            let bytes = word.to_ne_bytes();
            let copy_size = (size - offset).min(word_size);
            data.extend_from_slice(&bytes[..copy_size]);
        }

        Ok(data)
    }

    /// /proc/pid/maps を解析してメモリマッピング情報を取得する
    pub fn get_mappings(&self) -> Result<Vec<MemoryMapping>> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let file = File::open(&maps_path)
            .map_err(|e| anyhow::anyhow!("Failed to open {}: {}", maps_path, e))?;
        let reader = BufReader::new(file);

        let mut mappings = Vec::new();
        for line in reader.lines() {
            if let Some(mapping) = MemoryMapping::parse(&line?)? {
                mappings.push(mapping);
            }
        }

        Ok(mappings)
    }

    /// 実行可能ファイルのベースアドレスを取得する
    ///
    /// PIE（Position Independent Executable）の場合、実行時にランダムなアドレスにロードされます。
    /// 実行可能ファイルの最初の実行可能セグメントの開始アドレスからファイルオフセットを
    /// 引いた値を返します。
    pub fn get_base_address(&self) -> Result<u64> {
        self.get_mappings()?
            .iter()
            .find(|m| m.executable)
            .map(|m| m.start - m.offset)
            .ok_or_else(|| {
                anyhow::anyhow!("Could not find executable segment in memory mappings")
            })
    }

    /// 指定したファイルがマップされたロードアドレス（ファイルオフセット0の位置）を取得する
    ///
    /// 見つからない場合は[`Memory::get_base_address`]にフォールバックする。
    pub fn image_base(&self, path: &Path) -> Result<u64> {
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        match image_base_in(&self.get_mappings()?, &path) {
            Some(base) => Ok(base),
            None => {
                tracing::debug!("{} is not in the maps of {}", path.display(), self.pid);
                self.get_base_address()
            }
        }
    }
}

/// `path`のマッピングのうち最も低いロードアドレス
fn image_base_in(mappings: &[MemoryMapping], path: &Path) -> Option<u64> {
    mappings
        .iter()
        .filter(|m| m.pathname.as_deref().map(Path::new) == Some(path))
        .map(|m| m.start.wrapping_sub(m.offset))
        .min()
}

impl MemoryReader for Memory {
    /// /proc/pid/memを使用してターゲットプロセスのメモリを読み取ります。
    /// /proc/pid/memが使用できない場合（EIOエラー）、PTRACE_PEEKDATAにフォールバックします。
    fn read(&self, addr: u64, size: usize) -> Result<Vec<u8>> {
        match self.read_via_proc_mem(addr, size) {
            Ok(data) => Ok(data),
            Err(e) => {
                if let Some(io_err) = e.downcast_ref::<std::io::Error>() {
                    // EIO (errno 5): ptraceにフォールバック
                    if io_err.raw_os_error() == Some(5) {
                        tracing::debug!("EIO reading 0x{:x}, falling back to ptrace", addr);
                        return self.read_via_ptrace(addr, size);
                    }
                }
                Err(e)
            }
        }
    }
}
