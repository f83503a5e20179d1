//! Worker pool: spawning, registry bookkeeping, and command plumbing.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::models::{JobId, WorkerCommand, WorkerId, WorkerKind};
use crate::worker::{run_worker, WorkerContext};

/// Scheduler-side view of one worker task.
#[derive(Debug)]
pub struct WorkerHandle {
    pub kind: WorkerKind,
    pub idle: bool,
    pub stopping: bool,
    pub current_job: Option<JobId>,
    commands: mpsc::UnboundedSender<WorkerCommand>,
}

/// Registry of live workers plus their joinable tasks.
pub struct WorkerPool {
    context: WorkerContext,
    next_id: WorkerId,
    workers: HashMap<WorkerId, WorkerHandle>,
    tasks: JoinSet<()>,
}

impl WorkerPool {
    pub fn new(context: WorkerContext) -> Self {
        Self {
            context,
            next_id: 0,
            workers: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Spawn a worker of the given kind; it will announce itself Ready.
    pub fn spawn(&mut self, kind: WorkerKind) -> WorkerId {
        let id = self.next_id;
        self.next_id += 1;

        let (commands, commands_rx) = mpsc::unbounded_channel();
        self.workers.insert(
            id,
            WorkerHandle {
                kind,
                idle: false,
                stopping: false,
                current_job: None,
                commands,
            },
        );
        self.tasks
            .spawn(run_worker(id, kind, self.context.clone(), commands_rx));
        tracing::debug!(worker = id, kind = kind.label(), "worker spawned");
        id
    }

    pub fn get(&self, id: WorkerId) -> Option<&WorkerHandle> {
        self.workers.get(&id)
    }

    pub fn get_mut(&mut self, id: WorkerId) -> Option<&mut WorkerHandle> {
        self.workers.get_mut(&id)
    }

    /// Send a command; a closed channel means the worker already exited.
    pub fn send(&self, id: WorkerId, command: WorkerCommand) -> bool {
        match self.workers.get(&id) {
            Some(handle) => handle.commands.send(command).is_ok(),
            None => false,
        }
    }

    /// Ask one worker to stop; it finishes its current job first.
    pub fn stop(&mut self, id: WorkerId) {
        if let Some(handle) = self.workers.get_mut(&id) {
            if !handle.stopping {
                handle.stopping = true;
                let _ = handle.commands.send(WorkerCommand::Stop);
            }
        }
    }

    /// Broadcast stop to every worker.
    pub fn stop_all(&mut self) {
        let ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        for id in ids {
            self.stop(id);
        }
    }

    /// Forget a worker that reported Stopped (or crashed).
    pub fn remove(&mut self, id: WorkerId) -> Option<WorkerHandle> {
        self.workers.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn count_of_kind(&self, kind: WorkerKind) -> usize {
        self.workers
            .values()
            .filter(|w| w.kind == kind && !w.stopping)
            .count()
    }

    /// Idle, non-stopping workers of one kind, in stable id order.
    pub fn idle_of_kind(&self, kind: WorkerKind) -> Vec<WorkerId> {
        let mut ids: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, w)| w.kind == kind && w.idle && !w.stopping)
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// In-flight job count per kind, derived from the registry.
    pub fn busy_of_kind(&self, kind: WorkerKind) -> usize {
        self.workers
            .values()
            .filter(|w| w.kind == kind && w.current_job.is_some())
            .count()
    }

    /// Await worker task completion during shutdown.
    pub async fn join_next(&mut self) -> Option<()> {
        match self.tasks.join_next().await {
            Some(Ok(())) => Some(()),
            Some(Err(error)) => {
                if error.is_panic() {
                    tracing::error!(%error, "worker task panicked");
                }
                Some(())
            }
            None => None,
        }
    }

    pub async fn join_all(&mut self) {
        while self.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    use crate::config::CrawlOptions;
    use crate::dedup::LinkFilter;
    use crate::models::WorkerEvent;
    use crate::network::HttpClient;
    use crate::render::Renderer;

    fn pool_fixture() -> (WorkerPool, mpsc::UnboundedReceiver<WorkerEvent>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut options = CrawlOptions::default();
        options.out_dir = tmp.path().to_path_buf();
        let (events, events_rx) = mpsc::unbounded_channel();
        let context = WorkerContext {
            options: Arc::new(options),
            http: Arc::new(HttpClient::new("mdmirror-test", 2_000).unwrap()),
            renderer: Arc::new(Renderer::Disabled),
            filter: Arc::new(LinkFilter::new(1 << 10)),
            events,
        };
        (WorkerPool::new(context), events_rx, tmp)
    }

    #[tokio::test]
    async fn test_spawn_and_counts() {
        let (mut pool, mut events_rx, _tmp) = pool_fixture();
        let a = pool.spawn(WorkerKind::Markdown);
        let b = pool.spawn(WorkerKind::Hybrid);
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.count_of_kind(WorkerKind::Markdown), 1);
        assert_eq!(pool.count_of_kind(WorkerKind::Hybrid), 1);

        // Both workers announce readiness.
        for _ in 0..2 {
            assert!(matches!(
                events_rx.recv().await,
                Some(WorkerEvent::Ready { .. })
            ));
        }

        pool.stop_all();
        assert_eq!(pool.count_of_kind(WorkerKind::Markdown), 0);
        pool.join_all().await;
    }

    #[tokio::test]
    async fn test_idle_tracking() {
        let (mut pool, mut events_rx, _tmp) = pool_fixture();
        let id = pool.spawn(WorkerKind::Markdown);
        assert!(matches!(
            events_rx.recv().await,
            Some(WorkerEvent::Ready { .. })
        ));
        pool.get_mut(id).unwrap().idle = true;
        assert_eq!(pool.idle_of_kind(WorkerKind::Markdown), vec![id]);
        assert!(pool.idle_of_kind(WorkerKind::Hybrid).is_empty());

        pool.stop_all();
        pool.join_all().await;
    }
}
