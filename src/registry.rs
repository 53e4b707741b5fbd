use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::sandbox::SupervisorHandle;

/// Live supervisors of one worker, keyed by job id
///
/// Each worker owns its own registry and hands clones of it to the pipeline
/// and the inbound event router. An entry only ever points at the stage that
/// is currently running for a job and is removed when that stage terminates.
#[derive(Clone, Default)]
pub struct JobRegistry {
    entries: Arc<Mutex<HashMap<String, SupervisorHandle>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handle` for `job_id`, replacing any previous stage
    pub fn insert(&self, job_id: &str, handle: SupervisorHandle) {
        if let Some(previous) = self.entries.lock().insert(job_id.to_string(), handle) {
            log::warn!(
                "Job {job_id} already had stage {} registered, replaced",
                previous.stage_id()
            );
        }
    }

    pub fn get(&self, job_id: &str) -> Option<SupervisorHandle> {
        self.entries.lock().get(job_id).cloned()
    }

    /// Removes the entry of `job_id` if it still belongs to `stage_id`
    pub fn remove(&self, job_id: &str, stage_id: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(job_id) {
            Some(handle) if handle.stage_id() == stage_id => {
                entries.remove(job_id);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.entries.lock().contains_key(job_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_lookup_remove() {
        let registry = JobRegistry::new();
        let (handle, _rx) = SupervisorHandle::detached();
        let stage_id = handle.stage_id();

        registry.insert("job-1", handle);
        assert!(registry.contains("job-1"));
        assert_eq!(registry.get("job-1").map(|h| h.stage_id()), Some(stage_id));
        assert!(registry.get("job-2").is_none());

        assert!(registry.remove("job-1", stage_id));
        assert!(!registry.remove("job-1", stage_id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_stage_does_not_evict_newer_one() {
        let registry = JobRegistry::new();
        let (compile, _compile_rx) = SupervisorHandle::detached();
        let (run, _run_rx) = SupervisorHandle::detached();
        let (compile_id, run_id) = (compile.stage_id(), run.stage_id());

        registry.insert("job-1", compile);
        registry.insert("job-1", run);

        assert!(!registry.remove("job-1", compile_id));
        assert_eq!(registry.get("job-1").map(|h| h.stage_id()), Some(run_id));
        assert_eq!(registry.len(), 1);
    }
}
