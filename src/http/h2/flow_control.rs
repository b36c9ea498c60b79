//! HTTP/2 flow control
//!
//! This module implements flow control as defined in RFC 7540 Section 5.2.
//!
//! HTTP/2 uses flow control to prevent senders from overwhelming receivers
//! with data. Flow control is applied at both the connection and stream level;
//! the same [`FlowControl`] pair of windows serves both.

use super::error::{Error, Result};
use super::DEFAULT_INITIAL_WINDOW_SIZE;

/// Largest legal window (2^31 - 1)
const MAX_WINDOW_SIZE: i64 = 0x7FFF_FFFF;

/// Flow control window
///
/// The size may go negative when the peer shrinks SETTINGS_INITIAL_WINDOW_SIZE
/// while data is in flight.
#[derive(Debug, Clone)]
pub struct FlowControlWindow {
    initial_size: u32,
    current_size: i64,
}

impl FlowControlWindow {
    /// Create a new flow control window with default size
    pub fn new() -> Self {
        Self::with_initial_size(DEFAULT_INITIAL_WINDOW_SIZE)
    }

    /// Create a new flow control window with specified initial size
    pub fn with_initial_size(initial_size: u32) -> Self {
        FlowControlWindow {
            initial_size,
            current_size: initial_size as i64,
        }
    }

    /// Get current window size
    pub fn size(&self) -> i64 {
        self.current_size
    }

    /// Get initial window size
    pub fn initial_size(&self) -> u32 {
        self.initial_size
    }

    /// Bytes that may be sent right now
    pub fn available(&self) -> usize {
        self.current_size.max(0) as usize
    }

    /// Consume window capacity for sending data
    ///
    /// Returns the amount actually granted, which may be less than requested.
    pub fn consume(&mut self, amount: usize) -> usize {
        let granted = amount.min(self.available());
        self.current_size -= granted as i64;
        granted
    }

    /// Increase window size (WINDOW_UPDATE)
    pub fn increase(&mut self, increment: u32) -> Result<i64> {
        if increment == 0 {
            return Err(Error::Protocol(
                "Window update increment must be non-zero".to_string(),
            ));
        }

        let new_size = self.current_size + increment as i64;
        if new_size > MAX_WINDOW_SIZE {
            return Err(Error::FlowControl(format!(
                "Window size {} exceeds maximum (2^31-1)",
                new_size
            )));
        }

        self.current_size = new_size;
        Ok(self.current_size)
    }

    /// Account for received data; fails when the peer overran the window
    pub fn receive(&mut self, amount: usize) -> Result<()> {
        if amount as i64 > self.current_size {
            return Err(Error::FlowControl(format!(
                "received {} bytes with only {} left in the window",
                amount, self.current_size
            )));
        }
        self.current_size -= amount as i64;
        Ok(())
    }

    /// Apply a new SETTINGS_INITIAL_WINDOW_SIZE (RFC 7540 Section 6.9.2)
    pub fn update_initial_size(&mut self, new_initial_size: u32) -> Result<()> {
        let diff = new_initial_size as i64 - self.initial_size as i64;
        let new_current = self.current_size + diff;

        if new_current > MAX_WINDOW_SIZE {
            return Err(Error::FlowControl(format!(
                "New window size {} exceeds maximum (2^31-1)",
                new_current
            )));
        }

        self.initial_size = new_initial_size;
        self.current_size = new_current;
        Ok(())
    }
}

impl Default for FlowControlWindow {
    fn default() -> Self {
        Self::new()
    }
}

/// Send and receive windows of one stream or of the whole connection
#[derive(Debug, Clone, Default)]
pub struct FlowControl {
    pub send: FlowControlWindow,
    pub recv: FlowControlWindow,
}

impl FlowControl {
    pub fn new(send_size: u32, recv_size: u32) -> Self {
        FlowControl {
            send: FlowControlWindow::with_initial_size(send_size),
            recv: FlowControlWindow::with_initial_size(recv_size),
        }
    }

    /// Give back credit for `amount` received bytes the application has
    /// taken; returns the WINDOW_UPDATE increment to send, if any
    pub fn release(&mut self, amount: usize) -> Result<Option<u32>> {
        if amount == 0 {
            return Ok(None);
        }
        let increment = u32::try_from(amount)
            .map_err(|_| Error::FlowControl(format!("cannot release {} bytes at once", amount)))?;
        self.recv.increase(increment)?;
        Ok(Some(increment))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_control_window_consume() {
        let mut window = FlowControlWindow::with_initial_size(100);
        assert_eq!(window.consume(50), 50);
        assert_eq!(window.size(), 50);
        assert_eq!(window.consume(60), 50);
        assert_eq!(window.size(), 0);
        assert_eq!(window.consume(10), 0);
    }

    #[test]
    fn test_flow_control_window_increase() {
        let mut window = FlowControlWindow::with_initial_size(100);
        window.consume(50);
        assert_eq!(window.increase(100).unwrap(), 150);
        assert!(window.increase(0).is_err());

        let mut full = FlowControlWindow::with_initial_size(0x7FFF_FFFF);
        assert!(matches!(full.increase(1), Err(Error::FlowControl(_))));
    }

    #[test]
    fn test_update_initial_size_can_go_negative() {
        let mut window = FlowControlWindow::with_initial_size(100);
        window.consume(80);
        window.update_initial_size(50).unwrap();
        assert_eq!(window.size(), -30);
        assert_eq!(window.available(), 0);
        window.update_initial_size(200).unwrap();
        assert_eq!(window.size(), 120);
    }

    #[test]
    fn test_receive_waits_for_release() {
        let mut flow = FlowControl::new(65535, 10);
        flow.recv.receive(8).unwrap();
        assert_eq!(flow.recv.size(), 2);
        assert!(flow.recv.receive(3).is_err());

        assert_eq!(flow.release(0).unwrap(), None);
        assert_eq!(flow.release(8).unwrap(), Some(8));
        assert_eq!(flow.recv.size(), 10);
        assert!(flow.recv.receive(11).is_err());
    }
}
