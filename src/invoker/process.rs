use parking_lot::Mutex;

#[derive(Default)]
struct TrackerState {
    pgid: Option<i32>,
    terminated: bool,
}

/// Links a scheduled job to the process group of the build it is running,
/// so the scheduler can tear the whole tree down when the job overruns.
#[derive(Default)]
pub struct ProcessTracker {
    state: Mutex<TrackerState>,
}

impl ProcessTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly spawned process group leader.
    ///
    /// Returns `false` and kills the group right away when the job was already
    /// terminated.
    pub fn attach(&self, pid: u32) -> bool {
        let mut state = self.state.lock();
        let pgid = pid as i32;
        if state.terminated {
            signal_group(pgid, libc::SIGKILL);
            return false;
        }
        state.pgid = Some(pgid);
        true
    }

    /// Forgets the group once its leader has been reaped.
    pub fn detach(&self) {
        let mut state = self.state.lock();
        if let Some(pgid) = state.pgid.take()
            && state.terminated
        {
            // stragglers that outlived the leader
            signal_group(pgid, libc::SIGKILL);
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().pgid.is_some()
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    /// Marks the job as timed out and asks the process group to stop.
    pub fn terminate(&self) {
        let mut state = self.state.lock();
        state.terminated = true;
        if let Some(pgid) = state.pgid {
            log::info!("Sending SIGTERM to process group {pgid}");
            signal_group(pgid, libc::SIGTERM);
        }
    }

    /// Marks the job as timed out and kills the process group.
    pub fn kill(&self) {
        let mut state = self.state.lock();
        state.terminated = true;
        if let Some(pgid) = state.pgid {
            log::warn!("Sending SIGKILL to process group {pgid}");
            signal_group(pgid, libc::SIGKILL);
        }
    }
}

fn signal_group(pgid: i32, signal: libc::c_int) {
    // SAFETY: killpg has no memory safety preconditions
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            log::warn!("Failed to signal process group {pgid}: {err}");
        }
    }
}
