use std::sync::Arc;

use crate::config::Config;
use crate::poll::PollRepository;
use crate::store::KvStore;
use crate::vote::VoteLedger;

pub struct AppState {
    pub config: Config,
    pub polls: Arc<PollRepository>,
    pub votes: VoteLedger,
}

impl AppState {
    /// Wires both components to the same store handle.
    pub fn new(config: Config, store: Arc<dyn KvStore>) -> Arc<Self> {
        let polls = Arc::new(PollRepository::new(
            store.clone(),
            config.store_timeout,
            config.scan_batch,
        ));
        let votes = VoteLedger::new(store, polls.clone());

        Arc::new(Self {
            config,
            polls,
            votes,
        })
    }
}
