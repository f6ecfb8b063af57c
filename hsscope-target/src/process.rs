//! プロセス停止制御機能

use crate::{Result, Thread};
use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// 調査対象のプロセス
///
/// アタッチ中はすべてのOSスレッドがptraceで停止しています。
/// 調査中に実行を再開することはなく、`Drop`時にデタッチして元の状態に戻します。
pub struct Process {
    pid: Pid,
    /// アタッチ済みのOSスレッド
    attached: Vec<Thread>,
}

impl Process {
    /// 既存のプロセスにアタッチし、全スレッドの停止を待つ
    ///
    /// RTSのワーカースレッドが動き続けるとスタックやスレッドリストが
    /// 書き換わるため、/proc/pid/task の全エントリにアタッチします。
    pub fn attach(pid: i32) -> Result<Self> {
        let mut process = Self {
            pid: Pid::from_raw(pid),
            attached: Vec::new(),
        };

        for thread in Thread::list(pid)? {
            let tid = Pid::from_raw(thread.tid());
            match ptrace::attach(tid) {
                Ok(()) => {}
                // 列挙後に終了したスレッドは無視する
                Err(nix::errno::Errno::ESRCH) => {
                    tracing::debug!("thread {} exited before attach", tid);
                    continue;
                }
                Err(e) => {
                    return Err(anyhow::anyhow!("Failed to attach to thread {}: {}", tid, e));
                }
            }
            process.attached.push(thread);
            Self::wait_stopped(tid)?;
        }

        if process.attached.is_empty() {
            return Err(anyhow::anyhow!("Process {} has no threads to attach", pid));
        }

        tracing::debug!(
            "attached to {} thread(s) of process {}",
            process.attached.len(),
            pid
        );
        Ok(process)
    }

    /// スレッドが停止状態になるまで待機する
    fn wait_stopped(tid: Pid) -> Result<()> {
        match waitpid(tid, Some(WaitPidFlag::__WALL))? {
            WaitStatus::Stopped(_, _) => Ok(()),
            WaitStatus::Exited(_, code) => {
                Err(anyhow::anyhow!("Thread {} exited with code {}", tid, code))
            }
            status => Err(anyhow::anyhow!(
                "Unexpected wait status after attach: {:?}",
                status
            )),
        }
    }

    /// プロセスIDを取得する
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        for thread in &self.attached {
            let _ = ptrace::detach(Pid::from_raw(thread.tid()), None);
        }
    }
}
