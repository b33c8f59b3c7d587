//! Job records and the per-node job table.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::gauge;
use tracing::debug;

use arbor_overlay::{Errno, Request, WireError};
use arbor_rankset::RankSet;

use crate::barrier::Barrier;
use crate::executor::TaskHandle;
use crate::wire::JobId;

/// One active job, as seen from the local rank.
#[derive(Debug)]
pub struct Job {
    /// Job identity, assigned by the requester.
    pub id: JobId,
    /// The requesting user.
    pub userid: u32,
    /// Every rank hosting the job.
    pub target_ranks: RankSet,
    /// The hosting ranks inside this node's coverage:
    /// `target_ranks ∩ (local rank + descendants)`. All aggregation
    /// predicates compare against this set.
    pub subtree_ranks: RankSet,
    /// Hosting ranks of the subtree whose task has started.
    pub start_ranks: RankSet,
    /// Hosting ranks of the subtree whose task has finished.
    pub finish_ranks: RankSet,
    /// Reserved for the release protocol.
    pub release_ranks: RankSet,
    /// The maximum exit code reported so far.
    pub status: i32,
    /// Barrier state, reused across invocations.
    pub(crate) barrier: Barrier,
    /// The local task, when this rank hosts the job.
    pub(crate) task: Option<TaskHandle>,
    /// The originating request, held only on the originator; start,
    /// finish, and exception replies go here instead of upstream.
    pub(crate) request: Option<Arc<Request>>,
    /// The start transition already fired.
    pub(crate) start_notified: bool,
    /// The finish transition already fired.
    pub(crate) finish_notified: bool,
}

impl Job {
    pub(crate) fn new(id: JobId, userid: u32, target_ranks: RankSet, subtree_ranks: RankSet) -> Job {
        Job {
            id,
            userid,
            target_ranks,
            subtree_ranks,
            start_ranks: RankSet::new(),
            finish_ranks: RankSet::new(),
            release_ranks: RankSet::new(),
            status: 0,
            barrier: Barrier::new(),
            task: None,
            request: None,
            start_notified: false,
            finish_notified: false,
        }
    }
}

/// The active jobs on this node, keyed by id.
///
/// The table exclusively owns its records; everything else refers to jobs
/// by id and re-looks them up per handler.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: HashMap<JobId, Job>,
}

impl JobTable {
    /// An empty table.
    pub fn new() -> JobTable {
        JobTable::default()
    }

    /// The number of active jobs.
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns true when no jobs are active.
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Returns true if `id` is an active job.
    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.contains_key(&id)
    }

    /// Look up a job.
    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    /// Look up a job for update.
    pub fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    /// Insert a new record; an already-known id fails `EEXIST` and leaves
    /// the original untouched.
    pub fn insert(&mut self, job: Job) -> Result<(), WireError> {
        if self.jobs.contains_key(&job.id) {
            debug!(job = job.id, "duplicate add request");
            return Err(WireError::new(
                Errno::Exist,
                format!("job {} already exists", job.id),
            ));
        }
        self.jobs.insert(job.id, job);
        gauge!("arbor.jobs.active").set(self.jobs.len() as f64);
        Ok(())
    }

    /// Drop a record once final cleanup has flowed through.
    pub fn remove(&mut self, id: JobId) -> Option<Job> {
        let job = self.jobs.remove(&id);
        gauge!("arbor.jobs.active").set(self.jobs.len() as f64);
        job
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(id: JobId) -> Job {
        let target: RankSet = "0-2".parse().expect("decodes");
        Job::new(id, 100, target.clone(), target)
    }

    #[test]
    fn duplicate_insert_fails_eexist_and_keeps_the_original() {
        arbor_test::init();

        let mut table = JobTable::new();
        table.insert(job(1)).expect("first insert");

        let mut replay = job(1);
        replay.userid = 999;
        let err = table.insert(replay).expect_err("duplicate");
        assert_eq!(err.errno, Errno::Exist);
        assert_eq!(table.get(1).expect("still present").userid, 100);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_drops_the_record() {
        arbor_test::init();

        let mut table = JobTable::new();
        table.insert(job(1)).expect("inserts");
        assert!(table.remove(1).is_some());
        assert!(table.remove(1).is_none());
        assert!(table.is_empty());
    }
}
