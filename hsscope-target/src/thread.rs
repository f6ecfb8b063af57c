//! OSスレッド管理機能

use std::fs;

/// スレッドID
pub type ThreadId = i32;

/// 対象プロセスのOSスレッド（/proc/pid/task のエントリ）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thread {
    tid: ThreadId,
}

impl Thread {
    /// スレッドを作成する
    pub fn new(tid: ThreadId) -> Self {
        Self { tid }
    }

    /// スレッドIDを取得する
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    /// プロセスに属するすべてのOSスレッドを列挙する
    pub fn list(pid: i32) -> crate::Result<Vec<Thread>> {
        let task_dir = format!("/proc/{}/task", pid);
        let entries = fs::read_dir(&task_dir)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", task_dir, e))?;

        let mut threads = Vec::new();
        for entry in entries {
            let entry = entry?;
            // 数値でないエントリは無視する
            if let Some(tid) = entry.file_name().to_str().and_then(|s| s.parse().ok()) {
                threads.push(Thread::new(tid));
            }
        }
        threads.sort_by_key(|t| t.tid);
        Ok(threads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_own_threads() {
        let pid = std::process::id() as i32;
        let threads = Thread::list(pid).unwrap();
        assert!(threads.iter().any(|t| t.tid() == pid));
    }
}
