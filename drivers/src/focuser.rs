//! Focuser capability

use crate::DriverResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Direction for a relative focuser move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FocusDirection {
    In,
    Out,
}

impl std::fmt::Display for FocusDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FocusDirection::In => write!(f, "in"),
            FocusDirection::Out => write!(f, "out"),
        }
    }
}

/// Driver interface for the focuser.
#[async_trait]
pub trait FocuserDriver: Send + Sync {
    async fn connect(&mut self) -> DriverResult<()>;

    async fn disconnect(&mut self) -> DriverResult<()>;

    /// Move by `steps` in the given direction, returning once the
    /// move is acknowledged.
    async fn move_relative(&mut self, direction: FocusDirection, steps: u32) -> DriverResult<()>;

    /// Move to an absolute position, returning once acknowledged.
    async fn move_absolute(&mut self, position: i32) -> DriverResult<()>;

    async fn position(&self) -> DriverResult<i32>;

    /// Stop any move in progress.
    async fn halt(&mut self) -> DriverResult<()>;
}
