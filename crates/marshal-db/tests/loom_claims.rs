//! Loom model-check of the version-checked claim protocol.
//!
//! redb uses real file I/O that loom can't intercept, so the claim and
//! mutation rules are modelled with loom primitives: one writer at a time
//! compares the expected version before writing.

#[cfg(test)]
mod tests {
    use loom::sync::{Arc, Mutex};
    use loom::thread;

    #[derive(Clone, Copy, Debug, PartialEq)]
    struct Slot {
        version: u64,
        holder: Option<usize>,
    }

    /// Model of `TaskStore::claim` with a version pin.
    struct ClaimModel {
        tasks: Mutex<Vec<Slot>>,
    }

    impl ClaimModel {
        fn new(num_tasks: usize, version: u64) -> Self {
            Self {
                tasks: Mutex::new(vec![
                    Slot {
                        version,
                        holder: None
                    };
                    num_tasks
                ]),
            }
        }

        /// Claim `index` if it is still at `expected`.
        fn claim_at(&self, index: usize, expected: u64, worker: usize) -> Result<u64, u64> {
            let mut tasks = self.tasks.lock().unwrap();
            let slot = &mut tasks[index];
            if slot.version != expected || slot.holder.is_some() {
                return Err(slot.version);
            }
            slot.version += 1;
            slot.holder = Some(worker);
            Ok(slot.version)
        }

        /// Claim the first free task, like an untargeted claim.
        fn claim_next(&self, worker: usize) -> Option<usize> {
            let mut tasks = self.tasks.lock().unwrap();
            for (i, slot) in tasks.iter_mut().enumerate() {
                if slot.holder.is_none() {
                    slot.version += 1;
                    slot.holder = Some(worker);
                    return Some(i);
                }
            }
            None
        }
    }

    #[test]
    fn pinned_claims_have_exactly_one_winner() {
        loom::model(|| {
            let model = Arc::new(ClaimModel::new(1, 5));
            let m1 = Arc::clone(&model);
            let m2 = Arc::clone(&model);

            let t1 = thread::spawn(move || m1.claim_at(0, 5, 1));
            let t2 = thread::spawn(move || m2.claim_at(0, 5, 2));

            let r1 = t1.join().unwrap();
            let r2 = t2.join().unwrap();

            assert!(r1.is_ok() ^ r2.is_ok(), "exactly one claim should win");
            let winner = if r1.is_ok() { r1 } else { r2 };
            assert_eq!(winner, Ok(6));

            let tasks = model.tasks.lock().unwrap();
            assert_eq!(tasks[0].version, 6, "the loser must not write");
        });
    }

    #[test]
    fn loser_moves_to_next_candidate() {
        loom::model(|| {
            let model = Arc::new(ClaimModel::new(2, 5));
            let m1 = Arc::clone(&model);
            let m2 = Arc::clone(&model);

            let run = |m: Arc<ClaimModel>, worker: usize| match m.claim_at(0, 5, worker) {
                Ok(_) => Some(0),
                Err(_) => m.claim_next(worker),
            };
            let t1 = thread::spawn(move || run(m1, 1));
            let t2 = thread::spawn(move || run(m2, 2));

            let r1 = t1.join().unwrap();
            let r2 = t2.join().unwrap();

            assert!(r1.is_some() && r2.is_some());
            assert_ne!(r1, r2, "workers should hold different tasks");
        });
    }
}
