use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use pulsecompiler_backend::AcquisitionError;

/// Status reported when a receiver missed commands.
pub const CMD_DIVERGED: i32 = -4110;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerCmd {
    /// Stop the current run and report it as aborted.
    Abort,
    /// The unit is being dropped.
    Close,
}

/// Host-to-worker broadcast of the latest command.
pub struct CmdChan {
    cmd: Arc<Mutex<(usize, WorkerCmd)>>, // (msg_num: usize, worker_cmd: WorkerCmd)
    condvar: Arc<Condvar>,
}

impl CmdChan {
    pub fn new() -> Self {
        Self {
            cmd: Arc::new(Mutex::new((0, WorkerCmd::Close))),
            condvar: Arc::new(Condvar::new()),
        }
    }

    pub fn new_recvr(&self) -> CmdRecvr {
        // A receiver only reacts to commands posted after its creation
        let (msg_num, _cmd_val) = &*self.cmd.lock();
        CmdRecvr {
            cmd: self.cmd.clone(),
            condvar: self.condvar.clone(),
            viewed_msg_num: *msg_num,
        }
    }

    pub fn send(&self, cmd: WorkerCmd) {
        let mut mutex_guard = self.cmd.lock();
        let (msg_num, cmd_val) = &mut *mutex_guard;
        *cmd_val = cmd;
        *msg_num += 1;
        self.condvar.notify_all();
    }
}

impl Default for CmdChan {
    fn default() -> Self {
        Self::new()
    }
}

pub struct CmdRecvr {
    cmd: Arc<Mutex<(usize, WorkerCmd)>>,
    condvar: Arc<Condvar>,
    viewed_msg_num: usize,
}

impl CmdRecvr {
    fn check_diverged(&self, msg_num: usize) -> Result<(), AcquisitionError> {
        if msg_num > self.viewed_msg_num + 1 {
            return Err(AcquisitionError::new(
                CMD_DIVERGED,
                format!(
                    "viewed command {} diverged from the published command {}",
                    self.viewed_msg_num, msg_num
                ),
            ));
        }
        Ok(())
    }

    /// Blocks until the next command is posted.
    pub fn recv(&mut self) -> Result<WorkerCmd, AcquisitionError> {
        let mut mutex_guard = self.cmd.lock();
        while mutex_guard.0 == self.viewed_msg_num {
            self.condvar.wait(&mut mutex_guard);
        }
        let (msg_num, cmd_val) = *mutex_guard;
        self.check_diverged(msg_num)?;
        self.viewed_msg_num += 1;
        Ok(cmd_val)
    }

    /// Returns the next command if one was posted, without waiting.
    pub fn try_recv(&mut self) -> Result<Option<WorkerCmd>, AcquisitionError> {
        let (msg_num, cmd_val) = *self.cmd.lock();
        if msg_num == self.viewed_msg_num {
            return Ok(None);
        }
        self.check_diverged(msg_num)?;
        self.viewed_msg_num += 1;
        Ok(Some(cmd_val))
    }
}
