use crate::commands::CommandRecord;
use crate::events::QueueStateKind;

use super::{CommandQueue, Lane, QueueDependencies, QueueError, QueueSettings, QueueStatus};

/// The three lanes, constructed together from shared dependencies.
pub struct CommandQueues {
    general: CommandQueue,
    hashing: CommandQueue,
    image: CommandQueue,
}

impl CommandQueues {
    pub fn new(deps: QueueDependencies, settings: QueueSettings) -> Result<Self, QueueError> {
        Ok(Self {
            general: CommandQueue::new(Lane::General, deps.clone(), settings)?,
            hashing: CommandQueue::new(Lane::Hashing, deps.clone(), settings)?,
            image: CommandQueue::new(Lane::Image, deps, settings)?,
        })
    }

    pub fn lane(&self, lane: Lane) -> &CommandQueue {
        match lane {
            Lane::General => &self.general,
            Lane::Hashing => &self.hashing,
            Lane::Image => &self.image,
        }
    }

    pub fn lane_mut(&mut self, lane: Lane) -> &mut CommandQueue {
        match lane {
            Lane::General => &mut self.general,
            Lane::Hashing => &mut self.hashing,
            Lane::Image => &mut self.image,
        }
    }

    /// Routes `record` to the lane it names.
    pub fn enqueue(&self, record: &CommandRecord) -> Result<bool, QueueError> {
        self.lane(record.lane).enqueue(record)
    }

    pub fn start_all(&mut self) -> Result<(), QueueError> {
        for lane in Lane::ALL {
            self.lane_mut(lane).start()?;
        }
        Ok(())
    }

    pub fn cancel_all(&self) {
        for lane in Lane::ALL {
            self.lane(lane).cancel();
        }
    }

    pub fn join_all(&mut self) -> Result<(), QueueError> {
        let mut first_error = None;
        for lane in Lane::ALL {
            if let Err(error) = self.lane_mut(lane).join() {
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn statuses(&self) -> Result<Vec<QueueStatus>, QueueError> {
        Lane::ALL
            .into_iter()
            .map(|lane| self.lane(lane).status())
            .collect()
    }

    pub fn all_idle(&self) -> bool {
        Lane::ALL.into_iter().all(|lane| {
            let queue = self.lane(lane);
            queue.state() != QueueStateKind::Executing && queue.depth().unwrap_or(0) == 0
        })
    }
}
