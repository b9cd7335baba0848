// Rollback for multi-step object creation
//
// Each successfully created object registers how to release it. If a later
// step fails and the rollback is dropped, the releases run newest first.
// `commit` hands ownership to the finished object instead.

#[derive(Default)]
pub struct Rollback {
    steps: Vec<Box<dyn FnOnce()>>,
}

impl Rollback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the release of something that was just created.
    pub fn push(&mut self, release: impl FnOnce() + 'static) {
        self.steps.push(Box::new(release));
    }

    /// Everything registered so far is now owned elsewhere.
    pub fn commit(mut self) {
        self.steps.clear();
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        while let Some(release) = self.steps.pop() {
            release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn FnOnce()>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        (log, move |name| {
            let log = log2.clone();
            Box::new(move || log.borrow_mut().push(name)) as Box<dyn FnOnce()>
        })
    }

    #[test]
    fn releases_newest_first_on_drop() {
        let (log, release) = recorder();
        {
            let mut rollback = Rollback::new();
            rollback.push(release("instance"));
            rollback.push(release("messenger"));
            rollback.push(release("surface"));
        }
        assert_eq!(*log.borrow(), vec!["surface", "messenger", "instance"]);
    }

    #[test]
    fn commit_releases_nothing() {
        let (log, release) = recorder();
        let mut rollback = Rollback::new();
        rollback.push(release("instance"));
        rollback.push(release("device"));
        rollback.commit();
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn failure_midway_releases_only_what_was_created() {
        let (log, release) = recorder();

        let build = |fail_at: usize| -> Result<Vec<usize>, String> {
            let mut rollback = Rollback::new();
            let mut created = Vec::new();
            for step in 0..3 {
                if step == fail_at {
                    return Err(format!("step {} failed", step));
                }
                created.push(step);
                rollback.push(release(["first", "second", "third"][step]));
            }
            rollback.commit();
            Ok(created)
        };

        assert!(build(2).is_err());
        assert_eq!(*log.borrow(), vec!["second", "first"]);

        log.borrow_mut().clear();
        assert_eq!(build(3).unwrap(), vec![0, 1, 2]);
        assert!(log.borrow().is_empty());
    }
}
