use tokio::sync::watch;

/// Reference to a framework process spawned by an engine backend.
///
/// The handle only observes the process: the backend that spawned it reports
/// termination through the paired [`ProcessExit`]. Clones observe the same
/// process.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    exited: watch::Receiver<Option<i32>>,
}

/// Reporting half of a [`ProcessHandle`], held by the backend.
#[derive(Debug)]
pub struct ProcessExit {
    tx: watch::Sender<Option<i32>>,
}

impl ProcessHandle {
    pub fn new(pid: Option<u32>) -> (Self, ProcessExit) {
        let (tx, exited) = watch::channel(None);
        (Self { pid, exited }, ProcessExit { tx })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exited.borrow().is_some()
    }

    /// Wait for the process to terminate, returning its exit code (`-1` when
    /// the reporter went away without a code).
    pub async fn wait(&self) -> i32 {
        let mut rx = self.exited.clone();
        loop {
            if let Some(code) = *rx.borrow_and_update() {
                return code;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().unwrap_or(-1);
            }
        }
    }
}

impl ProcessExit {
    pub fn exited(&self, code: i32) {
        self.tx.send_replace(Some(code));
    }
}
