use tokio::task::JoinHandle;

/// Background tasks tied to one WebSocket connection (reader, heartbeat).
#[derive(Default)]
pub struct ConnectionTasks {
    handles: Vec<JoinHandle<()>>,
}

impl ConnectionTasks {
    pub fn spawn<F>(&mut self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handles.retain(|handle| !handle.is_finished());
        self.handles.push(tokio::spawn(future));
    }

    /// Aborts every task of the previous connection.
    pub fn abort_all(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }
}

impl Drop for ConnectionTasks {
    fn drop(&mut self) {
        self.abort_all();
    }
}
