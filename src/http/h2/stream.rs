//! HTTP/2 stream state
//!
//! Client-side view of one stream as defined in RFC 7540 Section 5.1. A
//! client stream starts when its HEADERS are sent, so `Idle` and the
//! reserved states never apply; pushed streams are refused outright.

use super::error::{Error, Result};
use super::flow_control::{FlowControl, FlowControlWindow};
use bytes::Bytes;
use std::collections::VecDeque;

/// Stream ID type
pub type StreamId = u32;

/// Stream state as defined in RFC 7540 Section 5.1
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Both sides can send frames
    Open,
    /// We sent END_STREAM; the response is still arriving
    HalfClosedLocal,
    /// The peer sent END_STREAM; our request body is still going out
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    /// Check if stream can send data
    pub fn can_send(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedRemote)
    }

    /// Check if stream can receive data
    pub fn can_receive(&self) -> bool {
        matches!(self, StreamState::Open | StreamState::HalfClosedLocal)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed)
    }
}

/// One client-initiated stream
#[derive(Debug)]
pub struct H2Stream {
    id: StreamId,
    state: StreamState,
    flow: FlowControl,
    /// Final (non-1xx) response headers were received
    response_started: bool,
    /// Request body waiting for window
    outbound: VecDeque<Bytes>,
    /// END_STREAM goes out once `outbound` drains
    end_queued: bool,
}

impl H2Stream {
    /// Stream whose HEADERS were just sent
    pub fn open(id: StreamId, send_window: u32, recv_window: u32, end_stream: bool) -> Self {
        H2Stream {
            id,
            state: if end_stream {
                StreamState::HalfClosedLocal
            } else {
                StreamState::Open
            },
            flow: FlowControl::new(send_window, recv_window),
            response_started: false,
            outbound: VecDeque::new(),
            end_queued: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn flow_mut(&mut self) -> &mut FlowControl {
        &mut self.flow
    }

    pub fn response_started(&self) -> bool {
        self.response_started
    }

    pub fn mark_response_started(&mut self) {
        self.response_started = true;
    }

    /// Queue request body bytes; `end` marks the last piece
    pub fn queue_data(&mut self, data: Bytes, end: bool) -> Result<()> {
        if !self.state.can_send() || self.end_queued {
            return Err(Error::Protocol(format!(
                "stream {} cannot send data in state {:?}",
                self.id, self.state
            )));
        }
        if !data.is_empty() {
            self.outbound.push_back(data);
        }
        self.end_queued = end;
        Ok(())
    }

    /// Whether queued data is waiting for window
    pub fn has_pending(&self) -> bool {
        !self.outbound.is_empty() || (self.end_queued && self.state.can_send())
    }

    /// Next DATA payload allowed by both windows
    ///
    /// Returns the bytes and whether END_STREAM should be set. An empty
    /// payload is only returned to carry END_STREAM.
    pub fn next_sendable(
        &mut self,
        connection: &mut FlowControlWindow,
        max_frame_size: usize,
    ) -> Option<(Bytes, bool)> {
        if !self.state.can_send() {
            return None;
        }
        let Some(front) = self.outbound.front_mut() else {
            if self.end_queued {
                self.close_local();
                return Some((Bytes::new(), true));
            }
            return None;
        };

        let allowed = front
            .len()
            .min(max_frame_size)
            .min(self.flow.send.available())
            .min(connection.available());
        if allowed == 0 {
            return None;
        }
        self.flow.send.consume(allowed);
        connection.consume(allowed);

        let piece = front.split_to(allowed);
        if front.is_empty() {
            self.outbound.pop_front();
        }
        let end = self.outbound.is_empty() && self.end_queued;
        if end {
            self.close_local();
        }
        Some((piece, end))
    }

    fn close_local(&mut self) {
        self.end_queued = false;
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            _ => StreamState::Closed,
        };
    }

    /// Record END_STREAM from the peer
    pub fn close_remote(&mut self) -> Result<()> {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            state => {
                return Err(Error::Protocol(format!(
                    "END_STREAM on stream {} in state {:?}",
                    self.id, state
                )))
            }
        };
        Ok(())
    }

    /// Ensure the peer may still send on this stream
    pub fn check_receive(&self) -> Result<()> {
        if !self.state.can_receive() {
            return Err(Error::Protocol(format!(
                "frame on stream {} in state {:?}",
                self.id, self.state
            )));
        }
        Ok(())
    }

    /// Drop queued data and close
    pub fn reset(&mut self) {
        self.outbound.clear();
        self.end_queued = false;
        self.state = StreamState::Closed;
    }
}
