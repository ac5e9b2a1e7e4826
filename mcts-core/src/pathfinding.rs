//! Bounded exponential backoff over the game's asynchronous pathfinder.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{InstanceError, PathError};

pub const DEFAULT_INITIAL_WAIT: Duration = Duration::from_millis(32);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathStatus {
    Success,
    Busy,
    NotFound,
    InvalidRequest,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PathPoll {
    pub status: PathStatus,
    #[serde(default)]
    pub waypoints: Vec<Position>,
}

pub trait Pathfinder {
    fn request_path(&mut self, start: Position, finish: Position) -> Result<PathHandle, InstanceError>;

    fn poll_path(&mut self, handle: PathHandle) -> Result<PathPoll, InstanceError>;
}

pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub initial_wait: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial_wait: DEFAULT_INITIAL_WAIT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Request a path and poll until the pathfinder answers.
///
/// Each `busy` poll is followed by a wait that doubles from
/// `initial_wait`. `not_found` and `invalid_request` end the request
/// immediately; running out of attempts is [`PathError::Exhausted`].
pub fn find_path<P: Pathfinder + ?Sized, S: Sleeper + ?Sized>(
    pathfinder: &mut P,
    sleeper: &mut S,
    start: Position,
    finish: Position,
    backoff: Backoff,
) -> Result<Vec<Position>, PathError> {
    let handle = pathfinder
        .request_path(start, finish)
        .map_err(PathError::Backend)?;

    let mut wait = backoff.initial_wait;
    for attempt in 1..=backoff.max_attempts {
        let poll = pathfinder.poll_path(handle).map_err(PathError::Backend)?;
        match poll.status {
            PathStatus::Success => return Ok(poll.waypoints),
            PathStatus::NotFound => return Err(PathError::NotFound),
            PathStatus::InvalidRequest => {
                return Err(PathError::InvalidRequest(format!(
                    "{start:?} -> {finish:?}"
                )))
            }
            PathStatus::Busy => {
                if attempt < backoff.max_attempts {
                    sleeper.sleep(wait);
                    wait = wait.saturating_mul(2);
                }
            }
        }
    }
    Err(PathError::Exhausted {
        attempts: backoff.max_attempts,
    })
}
