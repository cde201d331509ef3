//! CAN frame source trait definition

use anyhow::Result;
use std::fmt;

/// One raw CAN frame as received from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// Arbitration id (11 or 29 bit)
    pub id: u32,
    /// Payload, normally 0 to 8 bytes
    pub data: Vec<u8>,
}

impl CanFrame {
    pub fn new(id: u32, data: Vec<u8>) -> Self {
        Self { id, data }
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X}#", self.id)?;
        for byte in &self.data {
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

/// Trait for anything that produces CAN frames
///
/// Each source is responsible for:
/// - Opening whatever it reads from (interface, log file, generator)
/// - Handing frames to the engine one at a time
pub trait CanSource: Send {
    /// Get the name of this source (e.g., "demo", "candump")
    fn name(&self) -> &str;

    /// Start reading frames
    fn start(&mut self) -> Result<()>;

    /// Stop reading frames and release resources
    fn stop(&mut self) -> Result<()>;

    /// Read the next frame
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a frame is available
    /// - `Ok(None)` if no frame is ready yet, or the source is exhausted
    /// - `Err(_)` if an error occurred
    ///
    /// May block for a short time; sources are driven from a blocking task.
    fn read_frame(&mut self) -> Result<Option<CanFrame>>;

    /// Get whether the source is currently active
    fn is_active(&self) -> bool;
}
