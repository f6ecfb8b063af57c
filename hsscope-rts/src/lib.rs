//! GHC RTS のスレッドとスタックの解析
//!
//! 停止中のプロセスのメモリを読むだけで、RTSのスレッド（TSO）を列挙し、
//! 各スレッドのスタックをフレーム記述子に従って走査し、
//! フレームのコードアドレスを関数名に解決します。
//! 対象プロセスのコードは一切実行しません。

pub mod error;
pub mod frame;
pub mod layout;
pub mod names;
pub mod registry;
pub mod stack;
pub mod tso;
pub mod zdecode;

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

pub use error::RtsError;
pub use frame::{small_frame_size, Frame, FrameDescriptor, FrameKind};
pub use layout::{RtsLayout, TYPE_NAMES};
pub use names::{
    clean_name, pretty_name, FunctionName, NameCache, NameKind, NameResolver, NameStyle, UNKNOWN_NAME,
};
pub use registry::{AllThreads, RegistryConfig, RtsRoots, ThreadRegistry};
pub use stack::{StackWalker, WalkConfig};
pub use tso::{BlockReason, StackRegion, ThreadHandle, ThreadStatus};
pub use zdecode::zdecode;

/// RTS解析の結果型
pub type Result<T, E = RtsError> = std::result::Result<T, E>;
