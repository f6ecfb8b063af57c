//! エラーメッセージ定数

/// プロセスに接続されていない場合のエラーメッセージ
pub const ERR_NOT_ATTACHED: &str = "Not attached to a process";

/// バイナリが読み込まれていない場合のエラーメッセージ
pub const ERR_BINARY_NOT_LOADED: &str = "No binary loaded";
