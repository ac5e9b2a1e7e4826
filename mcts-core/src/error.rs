use core::fmt;

use crate::program::ProgramId;

/// Failure reported at the game-instance boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InstanceError {
    /// The instance understood the request and refused it.
    Rejected {
        operation: &'static str,
        message: String,
    },
    /// The round-trip to the instance itself failed.
    Transport(String),
    /// The instance answered with something that is not a valid reply.
    Malformed(String),
}

impl fmt::Display for InstanceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rejected { operation, message } => {
                write!(f, "instance rejected {operation}: {message}")
            }
            Self::Transport(message) => write!(f, "instance transport failure: {message}"),
            Self::Malformed(message) => write!(f, "malformed instance reply: {message}"),
        }
    }
}

impl std::error::Error for InstanceError {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StateError {
    Export(InstanceError),
    Import(InstanceError),
    ReadInventory(InstanceError),
    WriteInventory(InstanceError),
    Encode(String),
    Decode(String),
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Export(err) => write!(f, "state export failed: {err}"),
            Self::Import(err) => write!(f, "state import failed: {err}"),
            Self::ReadInventory(err) => write!(f, "inventory read failed: {err}"),
            Self::WriteInventory(err) => write!(f, "inventory write failed: {err}"),
            Self::Encode(message) => write!(f, "game state encode failed: {message}"),
            Self::Decode(message) => write!(f, "game state decode failed: {message}"),
        }
    }
}

impl std::error::Error for StateError {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathError {
    NotFound,
    InvalidRequest(String),
    Exhausted { attempts: u32 },
    Backend(InstanceError),
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "no path exists between the requested positions"),
            Self::InvalidRequest(message) => write!(f, "invalid path request: {message}"),
            Self::Exhausted { attempts } => {
                write!(f, "pathfinder still busy after {attempts} attempts")
            }
            Self::Backend(err) => write!(f, "pathfinder backend failure: {err}"),
        }
    }
}

impl std::error::Error for PathError {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TreeError {
    MissingId,
    Duplicate(ProgramId),
    UnknownParent {
        program: ProgramId,
        parent: ProgramId,
    },
    UnknownProgram(ProgramId),
}

impl fmt::Display for TreeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingId => write!(f, "program has no id; persist it before adding it to a tree"),
            Self::Duplicate(id) => write!(f, "program {id} is already in the tree"),
            Self::UnknownParent { program, parent } => {
                write!(f, "program {program} references unknown parent {parent}")
            }
            Self::UnknownProgram(id) => write!(f, "program {id} is not in the tree"),
        }
    }
}

impl std::error::Error for TreeError {}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SampleError {
    Source(String),
    Encoder(String),
}

impl fmt::Display for SampleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source(message) => write!(f, "failed to load sampling candidates: {message}"),
            Self::Encoder(message) => write!(f, "trace encoder failed: {message}"),
        }
    }
}

impl std::error::Error for SampleError {}
